use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use futures::stream::{self, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use swarmpush_p2p::{
    compute_all_sums, DiskStore, DispatchTask, FileSpec, MetaInfo, ReportSink, Role, SessionMgnt,
    StartTask, StatusReport,
};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::service::agent::AckDispatch;

/// Pieces the orchestrator cuts dispatch payloads into.
const PIECE_LENGTH: u64 = 1 << 20;

const DISPATCH_PARALLELISM: usize = 32;
const POST_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const DISPATCH_BOUND: Duration = Duration::from_secs(30);
const START_BOUND: Duration = Duration::from_secs(30);
const LIVENESS_DEADLINE: Duration = Duration::from_secs(30);
const CANCEL_BROADCAST_BOUND: Duration = Duration::from_secs(5);

/// Operator request accepted on `POST /api/v1/server/tasks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTask {
    pub id: String,
    /// Absolute paths of the source files on the server.
    pub dispatch_files: Vec<String>,
    /// Destination agents, `ip` or `ip:mgnt_port`.
    pub dest_ips: Vec<String>,
    /// Optional overall deadline for the whole distribution.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Hashing,
    Dispatching,
    Starting,
    Transferring,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DestStatus {
    pub dispatched: bool,
    pub started: bool,
    pub percent: f32,
    pub finished: bool,
    pub failed: bool,
}

/// Snapshot answered on `GET /api/v1/server/tasks/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: String,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub dests: HashMap<String, DestStatus>,
}

impl TaskStatus {
    pub(crate) fn pending(create: &CreateTask) -> TaskStatus {
        TaskStatus {
            id: create.id.clone(),
            state: TaskState::Pending,
            error: None,
            dests: create
                .dest_ips
                .iter()
                .map(|ip| (ip.clone(), DestStatus::default()))
                .collect(),
        }
    }
}

/// Drives one task end to end: hash the sources, seed them through the local
/// engine, push DispatchTask to every destination, fire StartTask, consume
/// status reports and decide the terminal state.
pub(crate) struct Orchestrator {
    cfg: Arc<Config>,
    mgnt: SessionMgnt,
    create: CreateTask,
    client: reqwest::Client,
    /// Clone of the cache entry's report sender, wired into the local seeder
    /// session so its reports flow the same way as HTTP ones.
    report_tx: mpsc::Sender<StatusReport>,
    status_tx: watch::Sender<TaskStatus>,
    dests: HashMap<String, DestStatus>,
    /// Maps the peer id each agent acknowledged with back to the dest key.
    peer_to_dest: HashMap<String, String>,
}

impl Orchestrator {
    pub fn new(
        cfg: Arc<Config>,
        mgnt: SessionMgnt,
        create: CreateTask,
        report_tx: mpsc::Sender<StatusReport>,
        status_tx: watch::Sender<TaskStatus>,
    ) -> Orchestrator {
        let dests = create
            .dest_ips
            .iter()
            .map(|ip| (ip.clone(), DestStatus::default()))
            .collect();
        Orchestrator {
            cfg,
            mgnt,
            create,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
            report_tx,
            status_tx,
            dests,
            peer_to_dest: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut reports: mpsc::Receiver<StatusReport>, mut stop: mpsc::Receiver<()>) {
        let outcome = self.drive(&mut reports, &mut stop).await;
        let (state, error) = match outcome {
            Ok(state) => (state, None),
            Err(reason) => {
                warn!(task = %self.create.id, %reason, "task failed");
                (TaskState::Failed, Some(reason))
            }
        };
        self.finish(state, error).await;
    }

    async fn drive(
        &mut self,
        reports: &mut mpsc::Receiver<StatusReport>,
        stop: &mut mpsc::Receiver<()>,
    ) -> Result<TaskState, String> {
        self.publish(TaskState::Hashing, None);
        let meta = self.build_meta().await.map_err(|e| format!("{e:#}"))?;
        info!(task = %self.create.id, pieces = meta.num_pieces(),
              total = meta.total_length, "metainfo computed");

        let roster: Vec<String> = std::iter::once(self.cfg.peer_id())
            .chain(self.create.dest_ips.iter().cloned())
            .collect();
        let seeder = DispatchTask {
            task_id: self.create.id.clone(),
            meta_info: meta.clone(),
            self_role: Role::Server,
            peers: roster.clone(),
            server: self.cfg.mgnt_addr(),
        };
        self.mgnt
            .create_task_with_sink(seeder, Some(ReportSink::Channel(self.report_tx.clone())))
            .await
            .map_err(|e| format!("local seeder session: {e}"))?;

        if stop.try_recv().is_ok() {
            return Ok(TaskState::Cancelled);
        }
        self.publish(TaskState::Dispatching, None);
        let dispatch = DispatchTask {
            task_id: self.create.id.clone(),
            meta_info: meta,
            self_role: Role::Agent,
            peers: roster,
            server: self.cfg.mgnt_addr(),
        };
        let addresses = timeout(DISPATCH_BOUND, self.dispatch_all(&dispatch))
            .await
            .map_err(|_| "dispatch timed out".to_string())??;

        if stop.try_recv().is_ok() {
            return Ok(TaskState::Cancelled);
        }
        self.publish(TaskState::Starting, None);
        timeout(START_BOUND, self.start_all(addresses))
            .await
            .map_err(|_| "start timed out".to_string())??;

        self.publish(TaskState::Transferring, None);
        self.collect(reports, stop).await
    }

    async fn build_meta(&self) -> anyhow::Result<MetaInfo> {
        let mut files = Vec::with_capacity(self.create.dispatch_files.len());
        for path in &self.create.dispatch_files {
            let md = tokio::fs::metadata(path)
                .await
                .with_context(|| format!("reading {path}"))?;
            if !md.is_file() {
                anyhow::bail!("{path} is not a regular file");
            }
            files.push(FileSpec {
                path: path.clone(),
                length: md.len(),
            });
        }
        let total_length: u64 = files.iter().map(|f| f.length).sum();
        if total_length == 0 {
            anyhow::bail!("dispatch payload is empty");
        }
        let hash_files = files.clone();
        let pieces = tokio::task::spawn_blocking(move || {
            let store = DiskStore::open(&hash_files)?;
            compute_all_sums(&store, total_length, PIECE_LENGTH)
        })
        .await
        .context("hash worker panicked")??;
        Ok(MetaInfo {
            piece_length: PIECE_LENGTH,
            total_length,
            pieces,
            files,
        })
    }

    /// Pushes the DispatchTask to every destination with bounded parallelism
    /// and builds the address book from their acknowledgements.
    async fn dispatch_all(
        &mut self,
        dispatch: &DispatchTask,
    ) -> Result<HashMap<String, String>, String> {
        let results: Vec<(String, anyhow::Result<AckDispatch>)> =
            stream::iter(self.create.dest_ips.clone())
                .map(|dest| {
                    let client = self.client.clone();
                    let cfg = self.cfg.clone();
                    let dispatch = dispatch.clone();
                    async move {
                        let url = format!("http://{}/api/v1/agent/tasks", mgnt_addr_of(&cfg, &dest));
                        let ack = match post_with_retry(&client, &cfg, &url, &dispatch).await {
                            Ok(resp) => resp
                                .json::<AckDispatch>()
                                .await
                                .context("parsing dispatch ack"),
                            Err(err) => Err(err),
                        };
                        (dest, ack)
                    }
                })
                .buffer_unordered(DISPATCH_PARALLELISM)
                .collect()
                .await;

        let mut addresses = HashMap::new();
        // the seeder's peer id is also its data address
        addresses.insert(self.cfg.peer_id(), self.cfg.peer_id());
        for (dest, ack) in results {
            match ack {
                Ok(ack) => {
                    debug!(task = %self.create.id, %dest, peer = %ack.peer_id, "dispatched");
                    if let Some(status) = self.dests.get_mut(&dest) {
                        status.dispatched = true;
                    }
                    addresses.insert(ack.peer_id.clone(), ack.peer_id.clone());
                    self.peer_to_dest.insert(ack.peer_id, dest);
                }
                Err(err) => return Err(format!("dispatch to {dest} failed: {err:#}")),
            }
        }
        Ok(addresses)
    }

    async fn start_all(&mut self, addresses: HashMap<String, String>) -> Result<(), String> {
        let start = StartTask {
            task_id: self.create.id.clone(),
            addresses,
        };
        self.mgnt
            .start_task(start.clone())
            .await
            .map_err(|e| format!("starting local seeder: {e}"))?;

        let results: Vec<(String, anyhow::Result<reqwest::Response>)> =
            stream::iter(self.create.dest_ips.clone())
                .map(|dest| {
                    let client = self.client.clone();
                    let cfg = self.cfg.clone();
                    let start = start.clone();
                    async move {
                        let url = format!(
                            "http://{}/api/v1/agent/tasks/start",
                            mgnt_addr_of(&cfg, &dest)
                        );
                        (dest, post_with_retry(&client, &cfg, &url, &start).await)
                    }
                })
                .buffer_unordered(DISPATCH_PARALLELISM)
                .collect()
                .await;

        for (dest, result) in results {
            match result {
                Ok(_) => {
                    if let Some(status) = self.dests.get_mut(&dest) {
                        status.started = true;
                    }
                }
                Err(err) => return Err(format!("start on {dest} failed: {err:#}")),
            }
        }
        Ok(())
    }

    /// Consumes status reports until every destination finishes, anything
    /// fails, a destination goes silent, the operator cancels, or the task's
    /// overall deadline passes.
    async fn collect(
        &mut self,
        reports: &mut mpsc::Receiver<StatusReport>,
        stop: &mut mpsc::Receiver<()>,
    ) -> Result<TaskState, String> {
        let mut last_seen: HashMap<String, Instant> = self
            .dests
            .keys()
            .map(|dest| (dest.clone(), Instant::now()))
            .collect();
        let mut liveness = interval(Duration::from_secs(5));
        liveness.tick().await; // the first tick is immediate
        let deadline = self
            .create
            .timeout_secs
            .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));

        loop {
            tokio::select! {
                report = reports.recv() => {
                    let Some(report) = report else {
                        return Err("report channel closed".into());
                    };
                    if report.task_id != self.create.id {
                        continue;
                    }
                    let Some(dest) = self.peer_to_dest.get(&report.peer_id).cloned() else {
                        continue; // the local seeder's own reports land here
                    };
                    last_seen.insert(dest.clone(), Instant::now());
                    let status = self.dests.get_mut(&dest).expect("dest table is fixed");
                    status.percent = report.percent_complete;
                    status.finished |= report.finished;
                    status.failed |= report.failed;
                    if report.failed {
                        return Err(format!(
                            "{dest} failed: {}",
                            report.error.unwrap_or_else(|| "unspecified".into())
                        ));
                    }
                    self.publish(TaskState::Transferring, None);
                    if self.dests.values().all(|d| d.finished) {
                        info!(task = %self.create.id, "all destinations finished");
                        return Ok(TaskState::Succeeded);
                    }
                }
                _ = stop.recv() => {
                    info!(task = %self.create.id, "cancel requested");
                    return Ok(TaskState::Cancelled);
                }
                _ = liveness.tick() => {
                    for (dest, status) in &self.dests {
                        if !status.finished && last_seen[dest].elapsed() > LIVENESS_DEADLINE {
                            return Err(format!("{dest} went silent during transfer"));
                        }
                    }
                }
                _ = maybe_sleep_until(deadline) => {
                    return Err("overall deadline exceeded".into());
                }
            }
        }
    }

    /// Terminal housekeeping: cancel surviving agent sessions, stop the local
    /// seeder, publish the final state.
    async fn finish(self, state: TaskState, error: Option<String>) {
        let cancels = stream::iter(self.create.dest_ips.clone())
            .map(|dest| {
                let client = self.client.clone();
                let cfg = self.cfg.clone();
                let id = self.create.id.clone();
                async move {
                    let url = format!(
                        "http://{}/api/v1/agent/tasks/{id}",
                        mgnt_addr_of(&cfg, &dest)
                    );
                    let _ = client
                        .delete(&url)
                        .basic_auth(&cfg.auth.username, Some(&cfg.auth.password))
                        .send()
                        .await;
                }
            })
            .buffer_unordered(DISPATCH_PARALLELISM)
            .collect::<Vec<()>>();
        let _ = timeout(CANCEL_BROADCAST_BOUND, cancels).await;

        if let Err(err) = self.mgnt.stop_task(&self.create.id).await {
            debug!(task = %self.create.id, %err, "local seeder already gone");
        }
        info!(task = %self.create.id, ?state, "task finished");
        self.publish(state, error);
    }

    fn publish(&self, state: TaskState, error: Option<String>) {
        let _ = self.status_tx.send(TaskStatus {
            id: self.create.id.clone(),
            state,
            error,
            dests: self.dests.clone(),
        });
    }
}

/// `dest` may be a bare ip (the fleet's common management port applies) or an
/// explicit `ip:port`.
fn mgnt_addr_of(cfg: &Config, dest: &str) -> String {
    if dest.contains(':') {
        dest.to_owned()
    } else {
        format!("{dest}:{}", cfg.net.mgnt_port)
    }
}

/// POST with a small bounded retry and exponential back-off with jitter.
async fn post_with_retry<T: Serialize>(
    client: &reqwest::Client,
    cfg: &Config,
    url: &str,
    body: &T,
) -> anyhow::Result<reqwest::Response> {
    let mut delay = RETRY_BASE_DELAY;
    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 0..POST_RETRIES {
        if attempt > 0 {
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
            sleep(delay + jitter).await;
            delay *= 2;
        }
        match client
            .post(url)
            .basic_auth(&cfg.auth.username, Some(&cfg.auth.password))
            .json(body)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => return Ok(resp),
            Ok(resp) => last_err = Some(anyhow::anyhow!("{url} answered {}", resp.status())),
            Err(err) => last_err = Some(err.into()),
        }
        debug!(url, attempt, "management post failed, backing off");
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{url}: no attempts made")))
}

async fn maybe_sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => futures::future::pending().await,
    }
}
