//! Hand-rolled HTTP/1.1 client and server over `tokio::net::UnixStream` /
//! `UnixListener`. Used both to push Discord events into the core
//! (`sockets/core-{instance}.sock`, server role here) and to dispatch
//! replies to the Discord bot sidecar (`sockets/discord-{instance}.sock`,
//! client role here) — spec.md §6.

use crate::error::DispatchError;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};

/// POSTs `body` as JSON to `path` over the Unix socket at `socket_path`,
/// with `timeout` applied to the whole request/response round trip.
pub async fn post_json(
    socket_path: &Path,
    path: &str,
    body: &serde_json::Value,
    timeout: Duration,
) -> Result<(), DispatchError> {
    let fut = async {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let payload = serde_json::to_vec(body).unwrap_or_default();
        let req = Request::builder()
            .method("POST")
            .uri(path)
            .header("host", "localhost")
            .header("content-type", "application/json")
            .header("content-length", payload.len())
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| DispatchError::Transport(e.to_string()))?;

        let resp = sender.send_request(req).await.map_err(|e| DispatchError::Transport(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DispatchError::Http(status.as_u16()))
        }
    };

    tokio::time::timeout(timeout, fut).await.unwrap_or(Err(DispatchError::Timeout))
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub uptime_s: Option<i64>,
}

/// `GET /health` over a Unix socket (spec.md §6, used by the Supervisor).
pub async fn get_health(socket_path: &Path, timeout: Duration) -> Option<HealthResponse> {
    let fut = async {
        let stream = UnixStream::connect(socket_path).await.ok()?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await.ok()?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = Request::builder()
            .method("GET")
            .uri("/health")
            .header("host", "localhost")
            .body(Full::new(Bytes::new()))
            .ok()?;
        let resp = sender.send_request(req).await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        read_json_body(resp).await.ok()
    };

    tokio::time::timeout(timeout, fut).await.ok().flatten()
}

async fn read_json_body<T: DeserializeOwned>(resp: Response<Incoming>) -> Result<T, anyhow::Error> {
    let bytes = resp.into_body().collect().await?.to_bytes();
    Ok(serde_json::from_slice(&bytes)?)
}

/// Binds `socket_path` after removing any stale socket file left by a
/// previous crash, sets mode 0600 (spec.md §6 Filesystem), and serves
/// `handle` for every connection until the process exits.
pub async fn serve_unix<F, Fut>(socket_path: &Path, handle: F) -> std::io::Result<()>
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    let listener = UnixListener::bind(socket_path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
    }

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let handle = handle.clone();

        tokio::spawn(async move {
            let service = hyper::service::service_fn(move |req| {
                let handle = handle.clone();
                async move { Ok::<_, std::convert::Infallible>(handle(req).await) }
            });
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                tracing::debug!(error = %e, "unix http connection closed with error");
            }
        });
    }
}

pub fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Full<Bytes>> {
    let payload = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(payload)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}
