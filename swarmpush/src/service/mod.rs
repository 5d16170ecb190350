pub mod agent;
pub mod orchestrator;
pub mod server;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use swarmpush_p2p::{Role, SessionMgnt};
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::{AuthConfig, Config};

/// One running swarmpush node: the P2P engine plus the management HTTP
/// endpoint for its role.
pub struct Node {
    role: Role,
    mgnt: SessionMgnt,
    mgnt_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl Node {
    /// Binds the data listener and the management endpoint and starts
    /// serving. Stop with [`Node::stop`]; both binds accept port 0 so tests
    /// can run fleets on one host.
    pub async fn start(cfg: Config, role: Role) -> anyhow::Result<Node> {
        cfg.validate(role)?;
        let cfg = Arc::new(cfg);
        let mgnt = SessionMgnt::start(cfg.engine(), cfg.data_bind()?).await?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let mgnt_addr = match role {
            Role::Server => {
                let state = Arc::new(server::ServerState::new(cfg.clone(), mgnt.clone()));
                serve_http(
                    cfg.mgnt_bind()?,
                    cfg.auth.clone(),
                    move |req| {
                        let state = state.clone();
                        async move { server::route(state, req).await }
                    },
                    shutdown_rx,
                )?
            }
            Role::Agent => {
                let state = Arc::new(agent::AgentState {
                    cfg: cfg.clone(),
                    mgnt: mgnt.clone(),
                });
                serve_http(
                    cfg.mgnt_bind()?,
                    cfg.auth.clone(),
                    move |req| {
                        let state = state.clone();
                        async move { agent::route(state, req).await }
                    },
                    shutdown_rx,
                )?
            }
        };

        info!(name = %cfg.name, ?role, %mgnt_addr, data_addr = %mgnt.data_addr(), "node up");
        Ok(Node {
            role,
            mgnt,
            mgnt_addr,
            shutdown,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn mgnt_addr(&self) -> SocketAddr {
        self.mgnt_addr
    }

    pub fn data_addr(&self) -> SocketAddr {
        self.mgnt.data_addr()
    }

    /// Graceful stop: the management endpoint drains, every session closes
    /// its peers and unregisters.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.mgnt.shutdown().await;
    }
}

/// Binds a hyper server, wraps every request in the Basic Auth check, and
/// serves until the shutdown flag flips. Returns the bound address.
fn serve_http<H, F>(
    addr: SocketAddr,
    auth: AuthConfig,
    handler: H,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<SocketAddr>
where
    H: Fn(Request<Body>) -> F + Clone + Send + Sync + 'static,
    F: Future<Output = Response<Body>> + Send + 'static,
{
    let make = make_service_fn(move |_conn| {
        let handler = handler.clone();
        let auth = auth.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req| {
                let handler = handler.clone();
                let auth = auth.clone();
                async move {
                    let response = if authorized(&req, &auth) {
                        handler(req).await
                    } else {
                        unauthorized()
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make);
    let local = server.local_addr();
    tokio::spawn(async move {
        let graceful = server.with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        });
        if let Err(err) = graceful.await {
            error!(%err, "management endpoint failed");
        }
    });
    Ok(local)
}

fn authorized(req: &Request<Body>, auth: &AuthConfig) -> bool {
    use base64::Engine;
    let Some(header) = req.headers().get(AUTHORIZATION) else {
        return false;
    };
    let Ok(header) = header.to_str() else {
        return false;
    };
    let Some(encoded) = header.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    decoded == format!("{}:{}", auth.username, auth.password).into_bytes()
}

fn unauthorized() -> Response<Body> {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(WWW_AUTHENTICATE, "Basic realm=\"swarmpush\"")
        .body(Body::empty())
        .expect("static response")
}

pub(crate) async fn read_json<T: DeserializeOwned>(
    req: Request<Body>,
) -> Result<T, Response<Body>> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|_| text(StatusCode::BAD_REQUEST, "unreadable body"))?;
    serde_json::from_slice(&bytes)
        .map_err(|err| text(StatusCode::BAD_REQUEST, &format!("malformed body: {err}")))
}

pub(crate) fn empty(code: StatusCode) -> Response<Body> {
    Response::builder()
        .status(code)
        .body(Body::empty())
        .expect("static response")
}

pub(crate) fn text(code: StatusCode, msg: &str) -> Response<Body> {
    Response::builder()
        .status(code)
        .body(Body::from(msg.to_owned()))
        .expect("static response")
}

pub(crate) fn json<T: Serialize>(code: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(code)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .expect("static response"),
        Err(err) => text(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

pub(crate) fn not_found() -> Response<Body> {
    empty(StatusCode::NOT_FOUND)
}
