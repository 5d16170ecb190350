use std::sync::Arc;

use hyper::{Body, Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use swarmpush_p2p::{DispatchTask, SessionMgnt, StartTask};
use tracing::info;

use super::{empty, json, not_found, read_json, text};
use crate::config::Config;

/// Body answered to a DispatchTask: tells the server how this agent appears
/// on the data plane, which is what address books are built from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckDispatch {
    pub peer_id: String,
}

pub(crate) struct AgentState {
    pub cfg: Arc<Config>,
    pub mgnt: SessionMgnt,
}

pub(crate) async fn route(state: Arc<AgentState>, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().trim_matches('/').to_owned();
    let segments: Vec<&str> = path.split('/').collect();
    match segments.as_slice() {
        ["api", "v1", "agent", "tasks"] if method == Method::POST => create(state, req).await,
        ["api", "v1", "agent", "tasks", "start"] if method == Method::POST => {
            start(state, req).await
        }
        ["api", "v1", "agent", "tasks", id] if method == Method::DELETE => {
            let id = id.to_string();
            cancel(state, &id).await
        }
        _ => not_found(),
    }
}

async fn create(state: Arc<AgentState>, req: Request<Body>) -> Response<Body> {
    let dispatch: DispatchTask = match read_json(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    info!(task = %dispatch.task_id, files = dispatch.meta_info.files.len(), "dispatch received");
    match state.mgnt.create_task(dispatch).await {
        Ok(()) => json(
            StatusCode::ACCEPTED,
            &AckDispatch {
                peer_id: state.cfg.peer_id(),
            },
        ),
        Err(err) => text(StatusCode::BAD_REQUEST, &err.to_string()),
    }
}

async fn start(state: Arc<AgentState>, req: Request<Body>) -> Response<Body> {
    let start: StartTask = match read_json(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    info!(task = %start.task_id, peers = start.addresses.len(), "start received");
    match state.mgnt.start_task(start).await {
        Ok(()) => empty(StatusCode::ACCEPTED),
        Err(err) => text(StatusCode::BAD_REQUEST, &err.to_string()),
    }
}

async fn cancel(state: Arc<AgentState>, id: &str) -> Response<Body> {
    info!(task = %id, "cancel received");
    match state.mgnt.stop_task(id).await {
        Ok(()) => empty(StatusCode::ACCEPTED),
        Err(err) => text(StatusCode::BAD_REQUEST, &err.to_string()),
    }
}
