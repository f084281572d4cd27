//! Inbound HTTP surface of the launch service

use crate::error::{json_error_response, ErrorCode, LaunchError};
use crate::events::{EventRouter, UnitEvent};
use crate::fleet::FleetController;
use crate::orchestrator::{LaunchOutcome, Launcher, WorkloadEndpoints, WorkloadStatus};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Bytes};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest accepted event body
const MAX_EVENT_BODY: usize = 64 * 1024;

/// Seconds a caller should wait before polling a starting workload again
const RETRY_AFTER_SECS: &str = "5";

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Body of a launch or status response
#[derive(Debug, Serialize)]
pub struct WorkloadResponse<'a> {
    /// "ready", "starting" or "stopped"
    pub status: &'static str,
    pub name: &'a str,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<&'a WorkloadEndpoints>,
}

fn workload_response(status: StatusCode, body: &WorkloadResponse<'_>) -> Response<Full<Bytes>> {
    match serde_json::to_string(body) {
        Ok(json) => {
            let mut resp = json_response(status, json);
            if body.status == "starting" {
                resp.headers_mut()
                    .insert("retry-after", hyper::header::HeaderValue::from_static(RETRY_AFTER_SECS));
            }
            resp
        }
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            json_error_response(ErrorCode::InternalError, "internal error")
        }
    }
}

/// Everything a request handler needs
pub struct AppState {
    pub launcher: Arc<Launcher>,
    pub fleet: Arc<FleetController>,
    pub events: Arc<EventRouter>,
}

pub struct LaunchServer {
    bind_addr: SocketAddr,
    state: Arc<AppState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl LaunchServer {
    pub fn new(bind_addr: SocketAddr, state: Arc<AppState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Launch service listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let state = Arc::clone(&state);
                                    async move { handle_request(req, state).await }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Launch service shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

fn wants_status_only(query: Option<&str>) -> bool {
    query
        .map(|q| q.split('&').any(|pair| pair == "status=true" || pair == "status=1"))
        .unwrap_or(false)
}

/// Route one request
pub async fn handle_request<B>(
    req: Request<B>,
    state: Arc<AppState>,
) -> Result<Response<Full<Bytes>>, hyper::Error>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, %path, "Request");

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::POST, "/events") => handle_event(req, &state).await,

        (&Method::POST, "/fleet/evaluate") => match state.fleet.evaluate().await {
            Ok(Some(plan)) => match serde_json::to_string(&plan) {
                Ok(json) => json_response(StatusCode::OK, json),
                Err(e) => {
                    error!(error = %e, "Failed to serialize fleet plan");
                    json_error_response(ErrorCode::InternalError, "internal error")
                }
            },
            Ok(None) => json_response(StatusCode::OK, r#"{"skipped":true}"#),
            Err(e) => {
                error!(error = %e, "Fleet evaluation failed");
                json_error_response(ErrorCode::InternalError, "fleet evaluation failed")
            }
        },

        (&Method::GET, "/") => json_error_response(ErrorCode::NotFound, "workload name required"),

        (&Method::GET, p) => {
            let name = &p[1..];
            if wants_status_only(req.uri().query()) {
                handle_status(name, &state).await
            } else {
                handle_launch(name, &state).await
            }
        }

        _ => json_error_response(ErrorCode::MethodNotAllowed, "method not allowed"),
    };

    Ok(response)
}

async fn handle_launch(name: &str, state: &AppState) -> Response<Full<Bytes>> {
    match state.launcher.launch(name).await {
        Ok(LaunchOutcome::Ready(endpoints)) => workload_response(
            StatusCode::OK,
            &WorkloadResponse {
                status: "ready",
                name,
                endpoints: Some(&endpoints),
            },
        ),
        Ok(LaunchOutcome::Starting) => workload_response(
            StatusCode::ACCEPTED,
            &WorkloadResponse {
                status: "starting",
                name,
                endpoints: None,
            },
        ),
        Err(e) => launch_error_response(name, e),
    }
}

async fn handle_status(name: &str, state: &AppState) -> Response<Full<Bytes>> {
    match state.launcher.status(name).await {
        Ok(WorkloadStatus::Ready(endpoints)) => workload_response(
            StatusCode::OK,
            &WorkloadResponse {
                status: "ready",
                name,
                endpoints: Some(&endpoints),
            },
        ),
        Ok(WorkloadStatus::Starting) => workload_response(
            StatusCode::ACCEPTED,
            &WorkloadResponse {
                status: "starting",
                name,
                endpoints: None,
            },
        ),
        Ok(WorkloadStatus::Stopped) => workload_response(
            StatusCode::OK,
            &WorkloadResponse {
                status: "stopped",
                name,
                endpoints: None,
            },
        ),
        Err(e) => launch_error_response(name, e),
    }
}

/// Callers see the invalid-name reason; everything else stays in the log
fn launch_error_response(name: &str, err: LaunchError) -> Response<Full<Bytes>> {
    match err {
        LaunchError::InvalidName(e) => {
            debug!(workload = name, error = %e, "Rejected workload name");
            json_error_response(ErrorCode::InvalidWorkloadName, e.to_string())
        }
        other => {
            error!(workload = name, error = %other, "Request failed");
            json_error_response(ErrorCode::LaunchFailed, "launch failed")
        }
    }
}

async fn handle_event<B>(req: Request<B>, state: &AppState) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let body = match Limited::new(req.into_body(), MAX_EVENT_BODY).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "Failed to read event body");
            return json_error_response(ErrorCode::InvalidEvent, "unreadable event body");
        }
    };

    let event: UnitEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "Invalid event body");
            return json_error_response(ErrorCode::InvalidEvent, format!("invalid event: {}", e));
        }
    };

    state.events.handle(&event).await;
    json_response(StatusCode::ACCEPTED, r#"{"status":"accepted"}"#)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_query() {
        assert!(wants_status_only(Some("status=true")));
        assert!(wants_status_only(Some("x=1&status=1")));
        assert!(!wants_status_only(Some("status=false")));
        assert!(!wants_status_only(None));
    }

    #[test]
    fn test_starting_response_has_retry_after() {
        let resp = workload_response(
            StatusCode::ACCEPTED,
            &WorkloadResponse {
                status: "starting",
                name: "demo",
                endpoints: None,
            },
        );
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(resp.headers().get("retry-after").unwrap(), "5");
    }
}
