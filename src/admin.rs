use crate::db::Database;
use crate::error::{json_error_response, ControlError, ErrorCode};
use crate::registration::RegistrationService;
use crate::stats::StatsCollector;
use crate::supervisor::Supervisor;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Version information for the control plane
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest request body the control API accepts
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(json) => Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(json)))
            .expect("valid response with StatusCode enum and static header"),
        Err(e) => json_error_response(ErrorCode::InternalError, e.to_string()),
    }
}

fn error_response(err: &ControlError) -> Response<Full<Bytes>> {
    debug!(error = %err, "Control API request failed");
    err.into()
}

/// Everything the control API operates on
pub struct AdminState {
    pub supervisor: Arc<Supervisor>,
    pub stats: Arc<StatsCollector>,
    pub registration: Arc<RegistrationService>,
    pub db: Arc<Database>,
}

/// HTTP control API of the relay
pub struct AdminServer {
    bind_addr: SocketAddr,
    state: Arc<AdminState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(bind_addr: SocketAddr, state: Arc<AdminState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Control API listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Control API connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept control API connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Control API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(stream: S, state: Arc<AdminState>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_admin_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Control API connection error: {}", e))?;

    Ok(())
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    secret_key: String,
    public_key: String,
}

#[derive(Debug, Deserialize)]
struct LicenseRequest {
    license: String,
}

#[derive(Debug, Deserialize)]
struct ResetTrafficRequest {
    tag: String,
}

async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T, Response<Full<Bytes>>> {
    let body = Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| json_error_response(ErrorCode::BadRequest, format!("failed to read body: {}", e)))?
        .to_bytes();

    serde_json::from_slice(&body)
        .map_err(|e| json_error_response(ErrorCode::BadRequest, format!("invalid JSON body: {}", e)))
}

fn force_requested(req: &Request<Incoming>) -> bool {
    req.uri()
        .query()
        .map(|q| q.split('&').any(|pair| pair == "force=true" || pair == "force=1"))
        .unwrap_or(false)
}

async fn handle_admin_request(
    req: Request<Incoming>,
    state: Arc<AdminState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Control API request");

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
                "relay_version": state.supervisor.get_version(),
            }),
        ),

        (&Method::GET, "/status") => json_response(StatusCode::OK, &state.supervisor.status()),

        (&Method::POST, "/restart") => {
            let force = force_requested(&req);
            match state.supervisor.restart(force).await {
                Ok(()) => json_response(StatusCode::OK, &state.supervisor.status()),
                Err(e) => error_response(&e),
            }
        }

        (&Method::POST, "/stop") => match state.supervisor.stop().await {
            Ok(()) => json_response(StatusCode::OK, &state.supervisor.status()),
            Err(e) => error_response(&e),
        },

        (&Method::POST, "/dirty") => {
            state.supervisor.restart_flag().mark_dirty();
            json_response(StatusCode::ACCEPTED, &serde_json::json!({ "dirty": true }))
        }

        (&Method::GET, "/traffic") => match state.stats.collect_into(&state.db).await {
            Ok((traffic, client_traffic)) => json_response(
                StatusCode::OK,
                &serde_json::json!({
                    "traffic": traffic,
                    "client_traffic": client_traffic,
                }),
            ),
            Err(e) => error_response(&e),
        },

        (&Method::POST, "/registration") => match read_json::<RegisterRequest>(req).await {
            Ok(body) => match state
                .registration
                .register(&body.secret_key, &body.public_key)
                .await
            {
                Ok((credential, config)) => {
                    state.supervisor.restart_flag().mark_dirty();
                    json_response(
                        StatusCode::OK,
                        &serde_json::json!({
                            "device_id": credential.device_id,
                            "license_key": credential.license_key,
                            "config": config,
                        }),
                    )
                }
                Err(e) => error_response(&e),
            },
            Err(resp) => resp,
        },

        (&Method::GET, "/registration/config") => match state.registration.refresh_config().await {
            Ok(config) => {
                state.supervisor.restart_flag().mark_dirty();
                json_response(StatusCode::OK, &config)
            }
            Err(e) => error_response(&e),
        },

        (&Method::PUT, "/registration/license") => match read_json::<LicenseRequest>(req).await {
            Ok(body) => match state.registration.set_license(&body.license).await {
                Ok(credential) => {
                    state.supervisor.restart_flag().mark_dirty();
                    json_response(
                        StatusCode::OK,
                        &serde_json::json!({
                            "device_id": credential.device_id,
                            "license_key": credential.license_key,
                        }),
                    )
                }
                Err(e) => error_response(&e),
            },
            Err(resp) => resp,
        },

        (&Method::GET, "/outbounds/traffic") => match state.db.outbound_traffic() {
            Ok(rows) => json_response(StatusCode::OK, &rows),
            Err(e) => error_response(&ControlError::Store(e)),
        },

        (&Method::POST, "/outbounds/traffic/reset") => match read_json::<ResetTrafficRequest>(req).await {
            Ok(body) => match state.db.reset_outbound_traffic(&body.tag) {
                Ok(reset) => json_response(StatusCode::OK, &serde_json::json!({ "reset": reset })),
                Err(e) => error_response(&ControlError::Store(e)),
            },
            Err(resp) => resp,
        },

        _ => json_error_response(ErrorCode::NotFound, format!("no route for {} {}", method, path)),
    };

    Ok(response)
}
