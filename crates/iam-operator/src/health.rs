//! Liveness and readiness probes
//!
//! `/healthz` answers as long as the process serves requests. `/readyz`
//! answers `503` until [`run_controller`](crate::controller::run_controller)
//! has confirmed the ServiceRole CRD is queryable,
//! and again once the controller has stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::debug;

/// Path of the liveness probe
pub const LIVENESS_PATH: &str = "/healthz";

/// Path of the readiness probe
pub const READINESS_PATH: &str = "/readyz";

const OK: &str = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nOK";
const NOT_READY: &str =
    "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 9\r\nConnection: close\r\n\r\nNot Ready";
const NOT_FOUND: &str =
    "HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\nConnection: close\r\n\r\nNot Found";

/// Shared readiness flag, flipped by the controller
#[derive(Debug, Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.0.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Response for an HTTP request line such as `GET /readyz HTTP/1.1`
fn respond(request_line: &str, readiness: &Readiness) -> &'static str {
    let path = request_line.split_whitespace().nth(1).unwrap_or_default();
    let path = path.split('?').next().unwrap_or_default();
    match path {
        LIVENESS_PATH => OK,
        READINESS_PATH if readiness.is_ready() => OK,
        READINESS_PATH => NOT_READY,
        _ => NOT_FOUND,
    }
}

/// Serve probes on `listener` until accepting fails
pub async fn serve(listener: TcpListener, readiness: Readiness) -> std::io::Result<()> {
    loop {
        let (mut socket, peer) = listener.accept().await?;
        let readiness = readiness.clone();

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            let n = match socket.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "Failed to read probe request");
                    return;
                }
            };
            let request = String::from_utf8_lossy(&buf[..n]);
            let response = respond(request.lines().next().unwrap_or_default(), &readiness);
            if let Err(e) = socket.write_all(response.as_bytes()).await {
                debug!(peer = %peer, error = %e, "Failed to answer probe");
            }
        });
    }
}
