//! Continuous-stream measurement engine.
//!
//! One persistent WebSocket connection per direction carries adaptively
//! sized binary frames; text frames are out-of-band measurement reports
//! from the peer. The same [`sender`] and [`receiver`] loops are used
//! symmetrically: the responder serves a download by sending and serves an
//! upload by receiving.

use crate::rate::{RateReporter, RateSample};
use crate::{Error, Result};
use bytes::Bytes;
use log::{debug, info, warn};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

/// Initial message size for the adaptive sender (1 KiB).
pub const MIN_MESSAGE_SIZE: usize = 1 << 10;

/// Maximum message size during adaptive scaling (1 MiB).
pub const MAX_SCALED_MESSAGE_SIZE: usize = 1 << 20;

/// Maximum accepted frame size, bounding memory per connection (16 MiB).
pub const MAX_FRAME_SIZE: usize = 1 << 24;

/// Scaling gate divisor: a message may not exceed one sixteenth of the
/// bytes sent so far.
pub const SCALING_FRACTION: u64 = 16;

/// Application subprotocol token both endpoints must agree on.
pub const STREAM_SUBPROTOCOL: &str = "net.netgauge.stream.v1";

/// Path of the download endpoint.
pub const DOWNLOAD_PATH: &str = "/download";

/// Path of the upload endpoint.
pub const UPLOAD_PATH: &str = "/upload";

/// One frame on the measurement connection.
///
/// Binary frames carry sizing information only; their content is never
/// examined. Text frames are opaque measurement reports relayed verbatim.
#[derive(Debug, Clone)]
pub enum StreamFrame {
    Binary(Bytes),
    Text(String),
}

/// Transport seam for the stream engine.
///
/// The sender and receiver loops are generic over this trait so the same
/// logic runs over a server-side upgraded socket and a client-side dialed
/// one, and so probe and transfer paths stay independently pluggable.
#[allow(async_fn_in_trait)]
pub trait FrameTransport {
    /// Sends one frame.
    async fn send_frame(&mut self, frame: StreamFrame) -> Result<()>;

    /// Receives the next data frame, skipping over control frames.
    /// Returns `None` once the connection is closed.
    async fn next_frame(&mut self) -> Option<Result<StreamFrame>>;
}

/// Returns the message size for the next iteration of the sender loop.
///
/// The size doubles only while it is below the scaled maximum and below
/// one [`SCALING_FRACTION`]th of the bytes sent so far, so early messages
/// stay small while actual bandwidth is still unknown and growth tracks
/// demonstrated throughput afterwards.
pub fn next_message_size(size: usize, total_sent: u64) -> usize {
    if size < MAX_SCALED_MESSAGE_SIZE && (size as u64) < total_sent / SCALING_FRACTION {
        size << 1
    } else {
        size
    }
}

/// Writes binary frames with adaptive sizing until the budget expires, the
/// token is cancelled, or the connection fails.
///
/// Used by the server for download and by the measurer for upload. Returns
/// the cumulative sample for the direction; a transport failure before the
/// budget expires is an error.
pub async fn sender<T: FrameTransport>(
    transport: &mut T,
    budget: Duration,
    sample_interval: Duration,
    label: &str,
    cancel: &CancellationToken,
) -> Result<RateSample> {
    let start = Instant::now();
    let mut reporter = RateReporter::new(sample_interval);
    let mut size = MIN_MESSAGE_SIZE;
    let mut payload = Bytes::from(vec![0u8; size]);
    let mut total: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let Some(remaining) = budget.checked_sub(start.elapsed()) else {
            break;
        };
        match timeout(remaining, transport.send_frame(StreamFrame::Binary(payload.clone()))).await {
            Err(_) => break, // budget expired mid-write
            Ok(Err(err)) => {
                warn!("{label}: send failed: {err}");
                return Err(err);
            }
            Ok(Ok(())) => {}
        }
        total += size as u64;
        if let Some(sample) = reporter.record(size as u64) {
            emit_sample(label, &sample);
        }
        let next = next_message_size(size, total);
        if next != size {
            size = next;
            payload = Bytes::from(vec![0u8; size]);
        }
    }

    let sample = reporter.sample();
    emit_sample(label, &sample);
    Ok(sample)
}

/// Reads frames until the budget expires, the token is cancelled, or the
/// connection closes or fails.
///
/// Binary payloads are discarded and counted by length; text frames are
/// surfaced verbatim without counting toward throughput. Used by the
/// measurer for download and by the server for upload.
pub async fn receiver<T: FrameTransport>(
    transport: &mut T,
    budget: Duration,
    sample_interval: Duration,
    label: &str,
    cancel: &CancellationToken,
) -> Result<RateSample> {
    let start = Instant::now();
    let mut reporter = RateReporter::new(sample_interval);

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let Some(remaining) = budget.checked_sub(start.elapsed()) else {
            break;
        };
        let frame = match timeout(remaining, transport.next_frame()).await {
            Err(_) => break,    // budget expired waiting for a frame
            Ok(None) => break,  // peer closed the connection
            Ok(Some(Err(err))) => {
                warn!("{label}: receive failed: {err}");
                return Err(err);
            }
            Ok(Some(Ok(frame))) => frame,
        };
        match frame {
            StreamFrame::Text(report) => {
                // Out-of-band measurement report from the peer; relayed
                // verbatim, not counted toward throughput.
                println!("{report}");
            }
            StreamFrame::Binary(payload) => {
                if let Some(sample) = reporter.record(payload.len() as u64) {
                    emit_sample(label, &sample);
                }
            }
        }
    }

    let sample = reporter.sample();
    emit_sample(label, &sample);
    Ok(sample)
}

fn emit_sample(label: &str, sample: &RateSample) {
    info!(
        "{label}: {} bytes in {:.3}s ({:.2} Mbit/s)",
        sample.bytes,
        sample.elapsed.as_secs_f64(),
        sample.bits_per_second / 1_000_000.0
    );
}

/// Server-side transport over an upgraded axum WebSocket.
pub struct ServerTransport {
    socket: axum::extract::ws::WebSocket,
}

impl ServerTransport {
    pub fn new(socket: axum::extract::ws::WebSocket) -> Self {
        Self { socket }
    }
}

impl FrameTransport for ServerTransport {
    async fn send_frame(&mut self, frame: StreamFrame) -> Result<()> {
        use axum::extract::ws::Message;
        let message = match frame {
            StreamFrame::Binary(payload) => Message::Binary(payload.to_vec()),
            StreamFrame::Text(report) => Message::Text(report),
        };
        self.socket
            .send(message)
            .await
            .map_err(|err| Error::Transfer(err.to_string()))
    }

    async fn next_frame(&mut self) -> Option<Result<StreamFrame>> {
        use axum::extract::ws::Message;
        loop {
            return match self.socket.recv().await? {
                Ok(Message::Binary(payload)) => Some(Ok(StreamFrame::Binary(payload.into()))),
                Ok(Message::Text(report)) => Some(Ok(StreamFrame::Text(report))),
                Ok(Message::Ping(_) | Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => None,
                Err(err) => Some(Err(Error::Transfer(err.to_string()))),
            };
        }
    }
}

/// Client-side transport over a dialed tungstenite WebSocket.
pub struct ClientTransport {
    socket: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

/// Dials `{base}{path}`, declaring the measurement subprotocol and bounding
/// the accepted frame size.
pub async fn dial(base: &str, path: &str) -> Result<ClientTransport> {
    let url = format!("{base}{path}");
    let mut request = url.clone().into_client_request()?;
    request.headers_mut().insert(
        SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(STREAM_SUBPROTOCOL),
    );
    let config = WebSocketConfig::default()
        .max_message_size(Some(MAX_FRAME_SIZE))
        .max_frame_size(Some(MAX_FRAME_SIZE));
    let (socket, response) = connect_async_with_config(request, Some(config), false).await?;
    debug!("connected to {url}: status {}", response.status());
    Ok(ClientTransport { socket })
}

impl FrameTransport for ClientTransport {
    async fn send_frame(&mut self, frame: StreamFrame) -> Result<()> {
        use futures::SinkExt;
        use tokio_tungstenite::tungstenite::Message;
        let message = match frame {
            StreamFrame::Binary(payload) => Message::Binary(payload),
            StreamFrame::Text(report) => Message::Text(report.into()),
        };
        self.socket.send(message).await.map_err(Error::from)
    }

    async fn next_frame(&mut self) -> Option<Result<StreamFrame>> {
        use futures::StreamExt;
        use tokio_tungstenite::tungstenite::Message;
        loop {
            return match self.socket.next().await? {
                Ok(Message::Binary(payload)) => Some(Ok(StreamFrame::Binary(payload))),
                Ok(Message::Text(report)) => {
                    Some(Ok(StreamFrame::Text(report.as_str().to_owned())))
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Ok(Message::Close(_)) => None,
                Err(err) => Some(Err(Error::from(err))),
            };
        }
    }
}

/// In-memory duplex transport for exercising the engine without a network.
#[cfg(test)]
pub(crate) struct ChannelTransport {
    pub tx: tokio::sync::mpsc::UnboundedSender<StreamFrame>,
    pub rx: tokio::sync::mpsc::UnboundedReceiver<StreamFrame>,
}

#[cfg(test)]
impl ChannelTransport {
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = tokio::sync::mpsc::unbounded_channel();
        let (tx_b, rx_b) = tokio::sync::mpsc::unbounded_channel();
        (
            Self { tx: tx_a, rx: rx_b },
            Self { tx: tx_b, rx: rx_a },
        )
    }
}

#[cfg(test)]
impl FrameTransport for ChannelTransport {
    async fn send_frame(&mut self, frame: StreamFrame) -> Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| Error::Transfer("peer gone".to_string()))
    }

    async fn next_frame(&mut self) -> Option<Result<StreamFrame>> {
        self.rx.recv().await.map(Ok)
    }
}
