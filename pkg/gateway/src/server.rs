use anyhow::{Result, bail};
use axum::{
    Router,
    extract::{Query, Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
};
use hyper_util::rt::TokioIo;
use pkg_container::ContainerExecutor;
use pkg_pki::GatewayCert;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tracing::{info, warn};

use crate::auth::GatewayAuth;
use crate::session::{SessionContext, SessionHandler};

const TARGET_UUID_HEADERS: &[&str] = &["x-arvados-target-uuid", "x-arvados-container-gateway-uuid"];
const AUTH_HEADER: &str = "x-arvados-authorization";
const AUTH_RESPONSE_HEADER: &str = "x-arvados-authorization-response";

/// Gateway settings, taken from the cluster's `GatewayAddress` and
/// `GatewayAuthSecret`.
pub struct Gateway {
    pub container_uuid: String,
    /// `host:port` as seen from the controller. Port `0` picks a free
    /// port; an empty address listens on loopback only.
    pub address: String,
    pub auth_secret: String,
    pub target: Arc<dyn ContainerExecutor>,
    pub sessions: Option<Arc<dyn SessionHandler>>,
}

/// A listening gateway. Dropping it stops accepting connections.
pub struct GatewayHandle {
    address: String,
    task: JoinHandle<()>,
}

impl GatewayHandle {
    /// `host:port` to record as the container's `gateway_address`.
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Drop for GatewayHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Shared {
    container_uuid: String,
    auth: GatewayAuth,
    target: Arc<dyn ContainerExecutor>,
    sessions: Option<Arc<dyn SessionHandler>>,
}

#[derive(Debug, Default, Deserialize)]
struct GatewayQuery {
    #[serde(default)]
    uuid: String,
    #[serde(default)]
    detach_keys: String,
    #[serde(default)]
    login_username: String,
}

impl Gateway {
    /// Generate a certificate, bind, and serve in the background.
    pub async fn start(self) -> Result<GatewayHandle> {
        let (ext_host, listen_host, port) = split_address(&self.address)?;

        let cert = GatewayCert::generate(&[ext_host.clone()])?;
        let auth = GatewayAuth::new(&self.auth_secret, cert.der())?;
        let acceptor = TlsAcceptor::from(cert.server_config()?);

        let listener = TcpListener::bind((listen_host.as_str(), port))
            .await
            .map_err(|e| anyhow::anyhow!("gateway listen on {}:{}: {}", listen_host, port, e))?;
        let listener = TlsListener::new(listener, acceptor)?;
        let address = join_host_port(&ext_host, listener.local.port());
        info!("[gateway] listening at {}", address);

        let app = router(Arc::new(Shared {
            container_uuid: self.container_uuid,
            auth,
            target: self.target,
            sessions: self.sessions,
        }));
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!("[gateway] serve: {}", e);
            }
        });

        Ok(GatewayHandle { address, task })
    }
}

// ─── TLS listener ───────────────────────────────────────────────

/// Hands finished TLS handshakes to `axum::serve`. Handshakes run in their
/// own tasks so a slow client doesn't hold up the others.
struct TlsListener {
    streams: mpsc::Receiver<(TlsStream<TcpStream>, SocketAddr)>,
    local: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl TlsListener {
    fn new(listener: TcpListener, acceptor: TlsAcceptor) -> std::io::Result<Self> {
        let local = listener.local_addr()?;
        let (tx, streams) = mpsc::channel(16);
        let accept_task = tokio::spawn(async move {
            loop {
                let (tcp, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("[gateway] accept: {}", e);
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    match acceptor.accept(tcp).await {
                        Ok(tls) => {
                            let _ = tx.send((tls, peer)).await;
                        }
                        Err(e) => warn!("[gateway] TLS handshake with {}: {}", peer, e),
                    }
                });
            }
        });
        Ok(Self {
            streams,
            local,
            accept_task,
        })
    }
}

impl Drop for TlsListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl axum::serve::Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.streams.recv().await {
            Some(conn) => conn,
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.local)
    }
}

/// Split the configured address into the advertised host, the host to
/// listen on, and the port.
fn split_address(address: &str) -> Result<(String, String, u16)> {
    if address.is_empty() {
        return Ok(("127.0.0.1".into(), "127.0.0.1".into(), 0));
    }
    let Some((host, port)) = address.rsplit_once(':') else {
        bail!("gateway address {:?}: missing port", address);
    };
    let port: u16 = port
        .parse()
        .map_err(|e| anyhow::anyhow!("gateway address {:?}: {}", address, e))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    // Reachable from outside, so listen on every interface.
    Ok((host.to_string(), "0.0.0.0".into(), port))
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

// ─── Routes ─────────────────────────────────────────────────────

fn router(shared: Arc<Shared>) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(middleware::from_fn_with_state(shared.clone(), authorize))
        .with_state(shared)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// Reject requests meant for another container or lacking the shared
/// secret; sign every other response.
async fn authorize(
    State(shared): State<Arc<Shared>>,
    Query(query): Query<GatewayQuery>,
    req: Request,
    next: Next,
) -> Response {
    let wanted = TARGET_UUID_HEADERS
        .iter()
        .find_map(|h| header_str(req.headers(), h))
        .unwrap_or(&query.uuid);
    if wanted != shared.container_uuid {
        let msg = format!(
            "misdirected request: meant for {:?} but received by crunch-run {:?}",
            wanted, shared.container_uuid
        );
        return (StatusCode::BAD_GATEWAY, msg).into_response();
    }
    if !shared.auth.verify(header_str(req.headers(), AUTH_HEADER)) {
        return (StatusCode::UNAUTHORIZED, "bad X-Arvados-Authorization header").into_response();
    }

    let mut resp = next.run(req).await;
    match HeaderValue::from_str(shared.auth.response()) {
        Ok(v) => {
            resp.headers_mut().insert(AUTH_RESPONSE_HEADER, v);
        }
        Err(e) => warn!("[gateway] auth response header: {}", e),
    }
    resp
}

async fn dispatch(
    State(shared): State<Arc<Shared>>,
    Query(query): Query<GatewayQuery>,
    mut req: Request,
) -> Response {
    let is_ssh = req.method() == Method::POST
        && header_str(req.headers(), header::UPGRADE.as_str())
            .is_some_and(|u| u.eq_ignore_ascii_case("ssh"));
    if !is_ssh {
        return (StatusCode::NOT_FOUND, "path not found").into_response();
    }
    let Some(sessions) = shared.sessions.clone() else {
        return (StatusCode::NOT_IMPLEMENTED, "no ssh server configured").into_response();
    };

    let ctx = SessionContext {
        container_uuid: shared.container_uuid.clone(),
        detach_keys: query.detach_keys,
        username: if query.login_username.is_empty() {
            "root".to_string()
        } else {
            query.login_username
        },
        target: shared.target.clone(),
    };
    let upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        let stream = match upgrade.await {
            Ok(upgraded) => TokioIo::new(upgraded),
            Err(e) => {
                warn!("[gateway] ssh upgrade: {}", e);
                return;
            }
        };
        if let Err(e) = sessions.serve(Box::new(stream), ctx).await {
            warn!("[gateway] ssh session: {:#}", e);
        }
    });
    (
        StatusCode::SWITCHING_PROTOCOLS,
        [(header::CONNECTION, "upgrade"), (header::UPGRADE, "ssh")],
    )
        .into_response()
}
