//! Measurement server.
//!
//! Serves both protocol variants from one router: the session, chunk and
//! probe endpoints of the discrete-chunk variant, and the `/download` and
//! `/upload` WebSocket endpoints of the continuous-stream variant.

use crate::config::Config;
use crate::rate::bits_per_second;
use crate::rate::RateReporter;
use crate::session::SessionRegistry;
use crate::stream::{
    self, ServerTransport, DOWNLOAD_PATH, MAX_FRAME_SIZE, STREAM_SUBPROTOCOL, UPLOAD_PATH,
};
use crate::Result;
use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Buffer size for generated download bodies (1 MiB).
const DOWNLOAD_BUF_SIZE: u64 = 1 << 20;

/// Response body of a session-create request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCreated {
    #[serde(rename = "sessionID")]
    pub session_id: String,
}

#[derive(Clone)]
struct AppState {
    registry: Arc<SessionRegistry>,
    budget: Duration,
    sample_interval: Duration,
}

/// Measurement server for both protocol variants.
///
/// # Examples
///
/// ```no_run
/// use netgauge::{Config, Server};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::serve("127.0.0.1".to_string(), 4443);
/// let server = Server::new(config);
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    config: Config,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
}

impl Server {
    /// Creates a server with the given configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the server gracefully when cancelled.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// The server's session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Builds the router serving both variants.
    pub fn app(&self) -> Router {
        let state = AppState {
            registry: self.registry.clone(),
            budget: self.config.budget,
            sample_interval: self.config.sample_interval,
        };
        Router::new()
            .route("/session", post(create_session))
            .route("/session/:sid", delete(delete_session))
            .route("/session/:sid/chunk/:size", get(get_chunk).put(put_chunk))
            .route("/session/:sid/probe/:pid", get(probe))
            .route(DOWNLOAD_PATH, get(ws_download))
            .route(UPLOAD_PATH, get(ws_upload))
            .layer(DefaultBodyLimit::disable())
            .with_state(state)
    }

    /// Binds the configured endpoint and serves until shut down.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the endpoint
    /// cannot be bound; both are fatal at startup.
    pub async fn run(&self) -> Result<()> {
        self.config.validate()?;
        let endpoint = format!("{}:{}", self.config.address, self.config.port);
        let listener = TcpListener::bind(&endpoint).await?;
        info!("serving at {endpoint}");
        self.run_with_listener(listener).await
    }

    /// Serves on an already-bound listener until shut down.
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<()> {
        let app = self
            .app()
            .into_make_service_with_connect_info::<SocketAddr>();
        let shutdown = self.shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        info!("server stopped");
        Ok(())
    }
}

async fn create_session(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let session_id = state.registry.create();
    info!("session created: sid {session_id} remote {remote}");
    (StatusCode::CREATED, Json(SessionCreated { session_id }))
}

async fn delete_session(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(sid): Path<String>,
) -> StatusCode {
    if !state.registry.delete(&sid) {
        return StatusCode::NOT_FOUND;
    }
    info!("session deleted: sid {sid} remote {remote}");
    StatusCode::NO_CONTENT
}

async fn get_chunk(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path((sid, size)): Path<(String, u64)>,
) -> Response {
    if !state.registry.exists(&sid) {
        return StatusCode::NOT_FOUND.into_response();
    }
    if size == 0 {
        return StatusCode::BAD_REQUEST.into_response();
    }
    info!("GET chunk: sid {sid} size {size} remote {remote}");

    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, size)
        .body(zero_body(size, sid))
    {
        Ok(response) => response,
        Err(err) => {
            warn!("GET chunk: failed to build response: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// A body of exactly `total` zero bytes, generated in 1 MiB chunks.
fn zero_body(total: u64, sid: String) -> Body {
    let zeros = Bytes::from(vec![0u8; DOWNLOAD_BUF_SIZE.min(total) as usize]);
    let t0 = Instant::now();
    let stream = futures::stream::unfold((zeros, 0u64), move |(zeros, sent)| {
        let sid = sid.clone();
        async move {
            if sent >= total {
                let elapsed = t0.elapsed();
                info!(
                    "GET chunk done: sid {sid} bytes {sent} in {:.3}s ({:.2} Mbit/s)",
                    elapsed.as_secs_f64(),
                    bits_per_second(sent, elapsed) / 1_000_000.0
                );
                return None;
            }
            let count = (total - sent).min(zeros.len() as u64);
            let part = zeros.slice(..count as usize);
            Some((
                Ok::<Bytes, std::convert::Infallible>(part),
                (zeros, sent + count),
            ))
        }
    });
    Body::from_stream(stream)
}

async fn put_chunk(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path((sid, size)): Path<(String, u64)>,
    body: Body,
) -> StatusCode {
    if !state.registry.exists(&sid) {
        return StatusCode::NOT_FOUND;
    }
    if size == 0 {
        return StatusCode::BAD_REQUEST;
    }
    info!("PUT chunk: sid {sid} expect {size} bytes remote {remote}");

    let t0 = Instant::now();
    let received = drain_body(body.into_data_stream(), size, state.sample_interval).await;
    let elapsed = t0.elapsed();
    info!(
        "PUT chunk done: sid {sid} bytes {received} in {:.3}s ({:.2} Mbit/s)",
        elapsed.as_secs_f64(),
        bits_per_second(received, elapsed) / 1_000_000.0
    );
    StatusCode::NO_CONTENT
}

/// Drains at most `limit` bytes from the stream, discarding content and
/// reporting throughput along the way. Returns the number of bytes counted.
async fn drain_body<S, E>(mut body: S, limit: u64, sample_interval: Duration) -> u64
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut reporter = RateReporter::new(sample_interval);
    let mut received = 0u64;
    while received < limit {
        match body.next().await {
            Some(Ok(part)) => {
                let count = (limit - received).min(part.len() as u64);
                received += count;
                if let Some(sample) = reporter.record(count) {
                    info!(
                        "PUT chunk: {} bytes in {:.3}s ({:.2} Mbit/s)",
                        sample.bytes,
                        sample.elapsed.as_secs_f64(),
                        sample.bits_per_second / 1_000_000.0
                    );
                }
            }
            Some(Err(err)) => {
                warn!("PUT chunk read failed: {err}");
                break;
            }
            None => break,
        }
    }
    received
}

async fn probe(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path((sid, pid)): Path<(String, String)>,
) -> StatusCode {
    if !state.registry.exists(&sid) {
        return StatusCode::NOT_FOUND;
    }
    info!("probe: sid {sid} pid {pid} remote {remote}");
    StatusCode::NO_CONTENT
}

async fn ws_download(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let upgrade = match negotiate(&headers, ws) {
        Ok(upgrade) => upgrade,
        Err(response) => return response,
    };
    let (budget, interval) = (state.budget, state.sample_interval);
    upgrade.on_upgrade(move |socket| async move {
        info!("stream download: remote {remote}");
        let mut transport = ServerTransport::new(socket);
        let cancel = CancellationToken::new();
        if let Err(err) =
            stream::sender(&mut transport, budget, interval, "download", &cancel).await
        {
            warn!("stream download to {remote} failed: {err}");
        }
    })
}

async fn ws_upload(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let upgrade = match negotiate(&headers, ws) {
        Ok(upgrade) => upgrade,
        Err(response) => return response,
    };
    let (budget, interval) = (state.budget, state.sample_interval);
    upgrade.on_upgrade(move |socket| async move {
        info!("stream upload: remote {remote}");
        let mut transport = ServerTransport::new(socket);
        let cancel = CancellationToken::new();
        if let Err(err) =
            stream::receiver(&mut transport, budget, interval, "upload", &cancel).await
        {
            warn!("stream upload from {remote} failed: {err}");
        }
    })
}

/// Accepts the upgrade only when the client declares the measurement
/// subprotocol; anything else is a client error.
fn negotiate(
    headers: &HeaderMap,
    ws: WebSocketUpgrade,
) -> std::result::Result<WebSocketUpgrade, Response> {
    let offered = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok());
    if offered != Some(STREAM_SUBPROTOCOL) {
        warn!("stream upgrade rejected: subprotocol {offered:?}");
        return Err(StatusCode::BAD_REQUEST.into_response());
    }
    Ok(ws
        .protocols([STREAM_SUBPROTOCOL])
        .max_message_size(MAX_FRAME_SIZE)
        .max_frame_size(MAX_FRAME_SIZE))
}
