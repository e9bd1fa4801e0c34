use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};

use crate::processor::State;

#[derive(Clone)]
pub struct HealthServer {
    ready: Arc<AtomicBool>,
}

impl HealthServer {
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Report ready only while the processor is running. Returns once the
    /// processor has stopped or its state channel is closed.
    pub async fn track(&self, mut states: watch::Receiver<State>) {
        loop {
            let state = *states.borrow_and_update();
            self.set_ready(state == State::Running);
            debug!(state = %state, ready = self.is_ready(), "Readiness updated");
            if state == State::Stopped || states.changed().await.is_err() {
                self.set_ready(false);
                return;
            }
        }
    }

    pub async fn serve(&self, port: u16, ready_tx: oneshot::Sender<()>) -> std::io::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr).await?;

        info!(port = port, "Health server listening");

        // Signal that health server is ready
        let _ = ready_tx.send(());

        self.serve_listener(listener).await
    }

    pub async fn serve_listener(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let ready = self.ready.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let ready = ready.clone();
                    async move { handle_request(req, ready).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!(
                        error = %err,
                        remote_addr = %remote_addr,
                        "Health server connection error"
                    );
                }
            });
        }
    }
}

impl Default for HealthServer {
    fn default() -> Self {
        Self::new()
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    ready: Arc<AtomicBool>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        // Liveness: the process is up
        (&Method::GET, "/healthz") => text_response(StatusCode::OK, "ok"),
        (&Method::GET, "/readyz") => {
            if ready.load(Ordering::SeqCst) {
                text_response(StatusCode::OK, "ok")
            } else {
                text_response(StatusCode::SERVICE_UNAVAILABLE, "not ready")
            }
        }
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_server() -> (HealthServer, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = HealthServer::new();
        let serving = server.clone();
        tokio::spawn(async move { serving.serve_listener(listener).await });
        (server, format!("http://{addr}"))
    }

    #[tokio::test]
    async fn test_probes() {
        let (server, base) = spawn_server().await;
        let client = reqwest::Client::new();

        let healthz = client.get(format!("{base}/healthz")).send().await.unwrap();
        assert_eq!(healthz.status(), reqwest::StatusCode::OK);

        let readyz = client.get(format!("{base}/readyz")).send().await.unwrap();
        assert_eq!(readyz.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(readyz.text().await.unwrap(), "not ready");

        server.set_ready(true);
        let readyz = client.get(format!("{base}/readyz")).send().await.unwrap();
        assert_eq!(readyz.status(), reqwest::StatusCode::OK);

        let missing = client.get(format!("{base}/metrics")).send().await.unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_track_follows_processor_state() {
        let server = HealthServer::new();
        let (states, receiver) = watch::channel(State::Idle);
        let tracking = {
            let server = server.clone();
            tokio::spawn(async move { server.track(receiver).await })
        };

        states.send_replace(State::Running);
        for _ in 0..100 {
            if server.is_ready() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(server.is_ready());

        states.send_replace(State::Draining);
        states.send_replace(State::Stopped);
        tracking.await.unwrap();
        assert!(!server.is_ready());
    }
}
