use std::collections::HashMap;
use std::sync::Arc;

use hyper::{Body, Method, Request, Response, StatusCode};
use swarmpush_p2p::{ArcMutex, Error, SessionMgnt, StatusReport};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info};

use super::orchestrator::{CreateTask, Orchestrator, TaskStatus};
use super::{empty, json, not_found, read_json, text};
use crate::config::Config;

struct TaskEntry {
    create: CreateTask,
    reports: mpsc::Sender<StatusReport>,
    stop: mpsc::Sender<()>,
    status: watch::Receiver<TaskStatus>,
}

/// Server-side task cache: one orchestrator per accepted CreateTask. Entries
/// survive into their terminal state so operators can still query the
/// outcome; DELETE removes them.
pub(crate) struct ServerState {
    cfg: Arc<Config>,
    mgnt: SessionMgnt,
    tasks: Arc<Mutex<HashMap<String, TaskEntry>>>,
}

impl ServerState {
    pub fn new(cfg: Arc<Config>, mgnt: SessionMgnt) -> ServerState {
        ServerState {
            cfg,
            mgnt,
            tasks: ArcMutex!(HashMap::new()),
        }
    }
}

pub(crate) async fn route(state: Arc<ServerState>, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().trim_matches('/').to_owned();
    let segments: Vec<&str> = path.split('/').collect();
    match segments.as_slice() {
        ["api", "v1", "server", "tasks"] if method == Method::POST => create(state, req).await,
        ["api", "v1", "server", "tasks", "status"] if method == Method::POST => {
            report(state, req).await
        }
        ["api", "v1", "server", "tasks", id] if method == Method::DELETE => {
            let id = id.to_string();
            cancel(state, &id).await
        }
        ["api", "v1", "server", "tasks", id] if method == Method::GET => {
            let id = id.to_string();
            query(state, &id).await
        }
        _ => not_found(),
    }
}

async fn create(state: Arc<ServerState>, req: Request<Body>) -> Response<Body> {
    let create: CreateTask = match read_json(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    if create.id.is_empty() || create.dispatch_files.is_empty() || create.dest_ips.is_empty() {
        return text(
            StatusCode::BAD_REQUEST,
            "id, dispatch_files and dest_ips are all required",
        );
    }

    let mut tasks = state.tasks.lock().await;
    if let Some(entry) = tasks.get(&create.id) {
        if entry.create == create {
            debug!(task = %create.id, "identical task resubmitted");
            return empty(StatusCode::ACCEPTED);
        }
        return text(
            StatusCode::BAD_REQUEST,
            &Error::TaskExist(create.id).to_string(),
        );
    }

    info!(task = %create.id, files = ?create.dispatch_files, dests = ?create.dest_ips, "task accepted");
    let (report_tx, report_rx) = mpsc::channel(256);
    let (stop_tx, stop_rx) = mpsc::channel(4);
    let (status_tx, status_rx) = watch::channel(TaskStatus::pending(&create));

    let orchestrator = Orchestrator::new(
        state.cfg.clone(),
        state.mgnt.clone(),
        create.clone(),
        report_tx.clone(),
        status_tx,
    );
    tokio::spawn(orchestrator.run(report_rx, stop_rx));

    tasks.insert(
        create.id.clone(),
        TaskEntry {
            create,
            reports: report_tx,
            stop: stop_tx,
            status: status_rx,
        },
    );
    empty(StatusCode::ACCEPTED)
}

async fn cancel(state: Arc<ServerState>, id: &str) -> Response<Body> {
    let removed = state.tasks.lock().await.remove(id);
    match removed {
        Some(entry) => {
            info!(task = %id, "task cancelled by operator");
            let _ = entry.stop.send(()).await;
            empty(StatusCode::ACCEPTED)
        }
        None => text(
            StatusCode::BAD_REQUEST,
            &Error::TaskNotExist(id.to_owned()).to_string(),
        ),
    }
}

async fn query(state: Arc<ServerState>, id: &str) -> Response<Body> {
    let tasks = state.tasks.lock().await;
    match tasks.get(id) {
        Some(entry) => {
            let status = entry.status.borrow().clone();
            json(StatusCode::OK, &status)
        }
        None => text(
            StatusCode::BAD_REQUEST,
            &Error::TaskNotExist(id.to_owned()).to_string(),
        ),
    }
}

/// `POST /api/v1/server/tasks/status` answers 200 no matter what; reports
/// for unknown tasks are simply dropped.
async fn report(state: Arc<ServerState>, req: Request<Body>) -> Response<Body> {
    let report: StatusReport = match read_json(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    let sender = {
        let tasks = state.tasks.lock().await;
        tasks.get(&report.task_id).map(|entry| entry.reports.clone())
    };
    if let Some(sender) = sender {
        debug!(task = %report.task_id, peer = %report.peer_id,
               percent = report.percent_complete, "status report");
        let _ = sender.send(report).await;
    }
    empty(StatusCode::OK)
}
