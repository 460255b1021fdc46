//! Reference command server.
//!
//! The counterpart the agent talks to in tests and local labs. It speaks
//! the same envelope protocol over HTTP/1.1 and HTTP/2, cleartext or TLS:
//!
//! 1. **OPAQUE verifier**: registers agents holding the shared secret and
//!    installs a session key after each login
//! 2. **Directive queue**: answers every sealed message with the next queued
//!    directive for that agent, or `Idle`
//! 3. **Observation**: records the TLS fingerprint and the request surface
//!    each agent presents
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Server                                │
//! │  ┌─────────────────┐   ┌─────────────────┐                   │
//! │  │  TCP listener   │──►│ ClientHello peek│──► ServerMetrics  │
//! │  │  (JoinSet)      │   │ (JA3)           │                   │
//! │  └────────┬────────┘   └─────────────────┘                   │
//! │           ▼                                                  │
//! │  ┌──────────────────────────────────────────────────────┐    │
//! │  │  hyper auto (HTTP/1.1 + h2 / h2c)                     │    │
//! │  └────────┬─────────────────────────────────────────────┘    │
//! │           ▼                                                  │
//! │  ┌──────────────────────────────────────────────────────┐    │
//! │  │  CommandServer: PakeServer + AgentRegistry            │    │
//! │  └──────────────────────────────────────────────────────┘    │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod config;
mod handler;
mod metrics;
mod registry;
mod tls;

pub use config::{ListenMode, ServerConfig, ServerConfigFile};
pub use handler::{status_for, CommandServer};
pub use metrics::{MetricsSnapshot, ObservedRequest, ServerMetrics};
pub use registry::{AgentRegistry, AgentSession};

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE, HOST, USER_AGENT};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::transport::hello::{parse_client_hello, record_len};
use crate::transport::Ja3;
use crate::MAX_ENVELOPE_SIZE;

/// Largest ClientHello the listener waits for.
const MAX_CLIENT_HELLO: usize = 16 * 1024;

/// Interval between idle-session sweeps.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Main server instance.
pub struct Server {
    config: Arc<ServerConfig>,
    command: Arc<CommandServer>,
    acceptor: Option<TlsAcceptor>,
}

impl Server {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let command = Arc::new(CommandServer::new(&config)?);
        let acceptor = match config.mode {
            ListenMode::Plain => None,
            ListenMode::Tls => Some(tls::self_signed_acceptor(&config.certificate_names)?),
        };

        Ok(Self {
            config: Arc::new(config),
            command,
            acceptor,
        })
    }

    /// Message logic shared by every connection.
    pub fn command(&self) -> &Arc<CommandServer> {
        &self.command
    }

    /// Serve until `shutdown` fires.
    ///
    /// The bound address is sent on `ready` once the listener is up.
    pub async fn run(
        self,
        ready: oneshot::Sender<SocketAddr>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> Result<()> {
        let addr = format!("{}:{}", self.config.listen_addr, self.config.listen_port);
        let listener = TcpListener::bind(&addr).await?;
        let local = listener.local_addr()?;

        info!(addr = %local, mode = ?self.config.mode, "command server listening");
        if ready.send(local).is_err() {
            debug!("nobody waiting for the ready signal");
        }

        let cleanup = {
            let command = Arc::clone(&self.command);
            tokio::spawn(async move { command.run_cleanup(CLEANUP_INTERVAL).await })
        };

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };

                    let command = Arc::clone(&self.command);
                    let acceptor = self.acceptor.clone();
                    connections.spawn(async move {
                        command.metrics().increment_connections();
                        if let Err(e) = handle_connection(&command, acceptor, stream).await {
                            debug!(%peer, error = %e, "connection ended with error");
                        }
                        command.metrics().decrement_connections();
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        info!(addr = %local, "command server shutting down");
        cleanup.abort();
        connections.shutdown().await;
        Ok(())
    }

    /// Spawn the server and wait until it is listening.
    pub async fn start(self) -> Result<ServerHandle> {
        let command = Arc::clone(&self.command);
        let mode = self.config.mode;
        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(self.run(ready_tx, shutdown_rx));
        let addr = match ready_rx.await {
            Ok(addr) => addr,
            Err(_) => {
                // The server exited before binding; surface its error
                return match task.await {
                    Ok(Err(e)) => Err(e),
                    _ => Err(Error::transport("server exited before listening")),
                };
            }
        };

        Ok(ServerHandle {
            addr,
            mode,
            command,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }
}

/// A running server.
///
/// Dropping the handle stops the server.
pub struct ServerHandle {
    addr: SocketAddr,
    mode: ListenMode,
    command: Arc<CommandServer>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<()>>>,
}

impl ServerHandle {
    /// Bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base URL of the listener.
    pub fn url(&self) -> String {
        let scheme = match self.mode {
            ListenMode::Plain => "http",
            ListenMode::Tls => "https",
        };
        format!("{scheme}://{}/", self.addr)
    }

    /// Message logic, for queueing directives and reading results.
    pub fn command(&self) -> &Arc<CommandServer> {
        &self.command
    }

    /// Counters and observed request surface.
    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        self.command.metrics()
    }

    /// Stop the server and wait for it to exit.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| Error::transport(format!("server task failed: {e}")))?,
            None => Ok(()),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn handle_connection(
    command: &Arc<CommandServer>,
    acceptor: Option<TlsAcceptor>,
    stream: TcpStream,
) -> Result<()> {
    stream.set_nodelay(true)?;

    let Some(acceptor) = acceptor else {
        return serve(stream, Arc::clone(command)).await;
    };

    if let Some(ja3) = peek_client_hello(&stream).await {
        debug!(%ja3, "ClientHello");
        command.metrics().record_ja3(ja3);
    }

    let tls = match acceptor.accept(stream).await {
        Ok(tls) => tls,
        Err(e) => {
            command.metrics().increment_handshake_errors();
            return Err(e.into());
        }
    };
    serve(tls, Arc::clone(command)).await
}

/// Read the first TLS record without consuming it.
async fn peek_client_hello(stream: &TcpStream) -> Option<Ja3> {
    let mut buf = vec![0u8; MAX_CLIENT_HELLO];

    for _ in 0..50 {
        let n = stream.peek(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        match record_len(&buf[..n]) {
            Some(len) if len > MAX_CLIENT_HELLO => return None,
            Some(len) if n >= len => return parse_client_hello(&buf[..len]).ok(),
            _ => tokio::time::sleep(Duration::from_millis(2)).await,
        }
    }
    None
}

async fn serve<I>(io: I, command: Arc<CommandServer>) -> Result<()>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let command = Arc::clone(&command);
        async move { Ok::<_, Infallible>(respond(&command, req).await) }
    });

    auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(io), service)
        .await
        .map_err(|e| Error::transport(format!("HTTP connection: {e}")))
}

async fn respond(command: &CommandServer, req: Request<Incoming>) -> Response<Full<Bytes>> {
    command.metrics().record_request(observe(&req));

    if req.method() != Method::POST {
        return reply(StatusCode::NOT_FOUND, Bytes::new());
    }

    let body = match Limited::new(req.into_body(), MAX_ENVELOPE_SIZE).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, "request body rejected");
            return reply(StatusCode::PAYLOAD_TOO_LARGE, Bytes::new());
        }
    };

    match command.handle(body) {
        Ok(envelope) => reply(StatusCode::OK, envelope),
        Err(e) => {
            let status = StatusCode::from_u16(status_for(&e))
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            debug!(error = %e, %status, "request refused");
            reply(status, Bytes::new())
        }
    }
}

fn observe(req: &Request<Incoming>) -> ObservedRequest {
    let header = |name: HeaderName| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    };
    ObservedRequest {
        host: header(HOST).or_else(|| req.uri().authority().map(|a| a.to_string())),
        user_agent: header(USER_AGENT),
        version: format!("{:?}", req.version()),
        method: req.method().to_string(),
        path: req.uri().path().to_string(),
    }
}

fn reply(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static(crate::transport::CONTENT_TYPE),
    );
    response
}
