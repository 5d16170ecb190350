use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::session::{
    self, EngineConfig, ReportSink, SessionHandle, SessionProgress,
};
use crate::task::{task_id_bytes, DispatchTask, StartTask};
use crate::wire::Handshake;

const ACCEPT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// The task-id → session map of one node, plus the shared data-plane
/// listener feeding accepted peers into their sessions.
///
/// The map itself is mutated by a single coordinator task; every caller goes
/// through the command channel, so duplicate creates, stops and inbound
/// routing all serialize without a lock.
#[derive(Clone)]
pub struct SessionMgnt {
    tx: mpsc::Sender<Cmd>,
    data_addr: SocketAddr,
}

enum Cmd {
    Create {
        dispatch: Box<DispatchTask>,
        sink: Option<ReportSink>,
        reply: oneshot::Sender<Result<()>>,
    },
    Start {
        start: StartTask,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        task_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Query {
        task_id: String,
        reply: oneshot::Sender<Result<SessionProgress>>,
    },
    Incoming {
        stream: TcpStream,
        handshake: Handshake,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

impl SessionMgnt {
    /// Binds the data-plane listener and spawns the coordinator.
    pub async fn start(cfg: EngineConfig, listen: SocketAddr) -> Result<SessionMgnt> {
        let listener = TcpListener::bind(listen).await?;
        let data_addr = listener.local_addr()?;
        info!(%data_addr, "peer listener up");

        let (tx, rx) = mpsc::channel(64);
        let mgnt = SessionMgnt { tx: tx.clone(), data_addr };

        tokio::spawn(accept_loop(listener, tx));
        tokio::spawn(coordinate(Arc::new(cfg), rx));
        Ok(mgnt)
    }

    /// Where peers reach this node; `listen` port 0 resolves here.
    pub fn data_addr(&self) -> SocketAddr {
        self.data_addr
    }

    /// Creates the session for a dispatched task. A duplicate for a live
    /// task id is acknowledged without doing anything.
    pub async fn create_task(&self, dispatch: DispatchTask) -> Result<()> {
        self.create_task_with_sink(dispatch, None).await
    }

    /// Same as [`SessionMgnt::create_task`] but with an explicit report sink;
    /// the server wires its own seeder session straight into the orchestrator
    /// this way.
    pub async fn create_task_with_sink(
        &self,
        dispatch: DispatchTask,
        sink: Option<ReportSink>,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Cmd::Create {
            dispatch: Box::new(dispatch),
            sink,
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Hands the address book to a created session and begins peering.
    pub async fn start_task(&self, start: StartTask) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Cmd::Start { start, reply }).await?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Stops and removes a session; unknown ids are an error.
    pub async fn stop_task(&self, task_id: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Cmd::Stop {
            task_id: task_id.to_owned(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    pub async fn query_task(&self, task_id: &str) -> Result<SessionProgress> {
        let (reply, rx) = oneshot::channel();
        self.send(Cmd::Query {
            task_id: task_id.to_owned(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Stops every session; used when the node shuts down.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Cmd::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn send(&self, cmd: Cmd) -> Result<()> {
        self.tx.send(cmd).await.map_err(|_| Error::Shutdown)
    }
}

/// Accepts data-plane connections, reads the handshake and forwards the
/// stream to the coordinator for routing. The handshake is answered only
/// once a session claims the connection.
async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<Cmd>) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(%err, "accept failed");
                continue;
            }
        };
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut stream = stream;
            match timeout(ACCEPT_HANDSHAKE_TIMEOUT, Handshake::read_from(&mut stream)).await {
                Ok(Ok(handshake)) => {
                    let _ = tx.send(Cmd::Incoming { stream, handshake }).await;
                }
                Ok(Err(err)) => debug!(%remote, %err, "bad handshake, dropping connection"),
                Err(_) => debug!(%remote, "handshake timed out, dropping connection"),
            }
        });
    }
}

async fn coordinate(cfg: Arc<EngineConfig>, mut rx: mpsc::Receiver<Cmd>) {
    let mut sessions: HashMap<String, SessionHandle> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            Cmd::Create {
                dispatch,
                sink,
                reply,
            } => {
                let result = if sessions.contains_key(&dispatch.task_id) {
                    debug!(task = %dispatch.task_id, "duplicate dispatch ignored");
                    Ok(())
                } else {
                    let task_id = dispatch.task_id.clone();
                    session::spawn(*dispatch, cfg.clone(), sink).map(|handle| {
                        info!(task = %task_id, "session created");
                        sessions.insert(task_id, handle);
                    })
                };
                let _ = reply.send(result);
            }
            Cmd::Start { start, reply } => {
                let result = match sessions.get(&start.task_id) {
                    Some(handle) => handle.start(start).await,
                    None => Err(Error::TaskNotExist(start.task_id.clone())),
                };
                let _ = reply.send(result);
            }
            Cmd::Stop { task_id, reply } => {
                let result = match sessions.remove(&task_id) {
                    Some(handle) => {
                        info!(task = %task_id, "stopping session");
                        handle.stop().await
                    }
                    None => Err(Error::TaskNotExist(task_id)),
                };
                let _ = reply.send(result);
            }
            Cmd::Query { task_id, reply } => {
                let result = match sessions.get(&task_id) {
                    Some(handle) => handle.query().await,
                    None => Err(Error::TaskNotExist(task_id)),
                };
                let _ = reply.send(result);
            }
            Cmd::Incoming { stream, handshake } => {
                let claimed = sessions
                    .values()
                    .find(|h| task_id_bytes(&h.task_id) == handshake.task_id)
                    .cloned();
                match claimed {
                    Some(handle) => {
                        let ours = Handshake::new(&handle.task_id, &cfg.peer_id);
                        tokio::spawn(async move {
                            let mut stream = stream;
                            if let Err(err) = ours.write_to(&mut stream).await {
                                debug!(%err, "handshake reply failed");
                                return;
                            }
                            let _ = handle.connected(stream, handshake.peer_id).await;
                        });
                    }
                    None => {
                        debug!(peer = %handshake.peer_id, "handshake for an unknown task, dropping");
                    }
                }
            }
            Cmd::Shutdown { reply } => {
                for (task_id, handle) in sessions.drain() {
                    debug!(task = %task_id, "stopping session on shutdown");
                    let _ = handle.stop().await;
                }
                let _ = reply.send(());
                break;
            }
        }
    }
}
