//! Discrete-chunk measurement engine.
//!
//! One direction is measured by a sequence of whole-body HTTP transfers of
//! doubling size against the session's chunk endpoint, sampling both the
//! latency-dominated regime (small chunks) and the throughput-dominated
//! regime (large chunks) within a fixed time budget.

use crate::client::{CallbackRef, ProgressEvent};
use crate::rate::{bits_per_second, RateReporter, RateSample};
use crate::{Error, Result};
use bytes::Bytes;
use futures::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Starting chunk size for the doubling sequence (32 bytes).
pub const INITIAL_CHUNK_SIZE: u64 = 32;

/// Maximum chunk size (256 MiB).
pub const MAX_CHUNK_SIZE: u64 = 256 << 20;

/// Buffer size for generated upload payloads (1 MiB).
const UPLOAD_BUF_SIZE: u64 = 1 << 20;

/// Transfer direction, chosen once per measured direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Server sends, measurer receives.
    Download,
    /// Measurer sends, server receives.
    Upload,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Download => write!(f, "download"),
            Direction::Upload => write!(f, "upload"),
        }
    }
}

/// The strictly doubling chunk size sequence, from 32 bytes up to and
/// including 256 MiB.
pub fn doubling_sizes() -> impl Iterator<Item = u64> {
    std::iter::successors(Some(INITIAL_CHUNK_SIZE), |&size| {
        (size < MAX_CHUNK_SIZE).then_some(size * 2)
    })
}

/// Outcome of one completed chunk transfer.
#[derive(Debug, Clone, Copy)]
pub struct ChunkReport {
    pub size: u64,
    pub bytes: u64,
    pub elapsed: Duration,
    pub bits_per_second: f64,
}

/// Outcome of one fully measured direction.
#[derive(Debug, Clone, Copy)]
pub struct DirectionSummary {
    pub direction: Direction,
    pub chunks: u32,
    pub bytes: u64,
    pub elapsed: Duration,
    pub bits_per_second: f64,
}

type SharedReporter = Arc<Mutex<RateReporter>>;

/// Drives one direction's chunk-doubling measurement within a time budget.
///
/// A transport or protocol error on one chunk abandons the remaining
/// iterations for that direction without retry, but is not fatal to the
/// overall measurement: the engine returns a summary either way and the
/// caller proceeds to the next direction or to cleanup.
pub struct ChunkDoublingEngine {
    http: reqwest::Client,
    base_url: String,
    session_id: String,
    budget: Duration,
    sample_interval: Duration,
    callback: Option<CallbackRef>,
}

impl ChunkDoublingEngine {
    pub fn new(
        http: reqwest::Client,
        base_url: String,
        session_id: String,
        budget: Duration,
        sample_interval: Duration,
        callback: Option<CallbackRef>,
    ) -> Self {
        Self {
            http,
            base_url,
            session_id,
            budget,
            sample_interval,
            callback,
        }
    }

    fn notify(&self, event: ProgressEvent) {
        if let Some(callback) = &self.callback {
            callback.on_progress(event);
        }
    }

    fn chunk_url(&self, size: u64) -> String {
        format!(
            "{}/session/{}/chunk/{}",
            self.base_url, self.session_id, size
        )
    }

    /// Runs the doubling loop for one direction until the budget expires,
    /// the size sequence is exhausted, a chunk fails, or the token is
    /// cancelled.
    pub async fn run(&self, direction: Direction, cancel: &CancellationToken) -> DirectionSummary {
        let start = Instant::now();
        let reporter: SharedReporter = Arc::new(Mutex::new(RateReporter::new(self.sample_interval)));
        let mut chunks = 0u32;

        for size in doubling_sizes() {
            if start.elapsed() >= self.budget || cancel.is_cancelled() {
                break;
            }
            let remaining = self.budget.saturating_sub(start.elapsed());
            let result = match direction {
                Direction::Download => self.download_chunk(size, remaining, &reporter).await,
                Direction::Upload => self.upload_chunk(size, remaining, &reporter).await,
            };
            match result {
                Ok(report) => {
                    chunks += 1;
                    info!(
                        "{direction} chunk done: {} bytes in {:.3}s ({:.2} Mbit/s)",
                        report.bytes,
                        report.elapsed.as_secs_f64(),
                        report.bits_per_second / 1_000_000.0
                    );
                    self.notify(ProgressEvent::ChunkCompleted { direction, report });
                }
                Err(err) => {
                    if start.elapsed() >= self.budget {
                        // The in-flight transfer was cut off by the budget;
                        // this is the expected end-of-measurement condition.
                        debug!("{direction}: budget reached mid-transfer: {err}");
                    } else {
                        warn!("{direction} chunk of {size} bytes failed: {err}");
                        self.notify(ProgressEvent::Error(format!(
                            "{direction} chunk of {size} bytes failed: {err}"
                        )));
                    }
                    break;
                }
            }
        }

        let sample = reporter.lock().sample();
        let summary = DirectionSummary {
            direction,
            chunks,
            bytes: sample.bytes,
            elapsed: sample.elapsed,
            bits_per_second: sample.bits_per_second,
        };
        info!(
            "{direction} done: {} chunks, {} bytes in {:.3}s ({:.2} Mbit/s)",
            summary.chunks,
            summary.bytes,
            summary.elapsed.as_secs_f64(),
            summary.bits_per_second / 1_000_000.0
        );
        self.notify(ProgressEvent::DirectionCompleted { summary });
        summary
    }

    /// Fetches one chunk and drains the body, discarding content while
    /// routing byte counts through the rate reporter.
    async fn download_chunk(
        &self,
        size: u64,
        remaining: Duration,
        reporter: &SharedReporter,
    ) -> Result<ChunkReport> {
        let t0 = Instant::now();
        let response = self
            .http
            .get(self.chunk_url(size))
            .timeout(remaining)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Transfer(format!(
                "download chunk of {size} bytes: status {}",
                response.status()
            )));
        }

        let mut body = response.bytes_stream();
        let mut received = 0u64;
        while let Some(part) = body.next().await {
            let part = part?;
            received += part.len() as u64;
            if let Some(sample) = reporter.lock().record(part.len() as u64) {
                self.emit_sample(Direction::Download, sample);
            }
        }
        if received != size {
            warn!("download chunk: expected {size} bytes, got {received}");
        }

        let elapsed = t0.elapsed();
        Ok(ChunkReport {
            size,
            bytes: received,
            elapsed,
            bits_per_second: bits_per_second(received, elapsed),
        })
    }

    /// Uploads one chunk, generating the zero payload on the fly with the
    /// length declared up front.
    async fn upload_chunk(
        &self,
        size: u64,
        remaining: Duration,
        reporter: &SharedReporter,
    ) -> Result<ChunkReport> {
        let t0 = Instant::now();
        let zeros = Bytes::from(vec![0u8; UPLOAD_BUF_SIZE.min(size) as usize]);
        let reporter_handle = reporter.clone();
        let callback = self.callback.clone();
        let body = futures::stream::unfold(
            (zeros, size, reporter_handle, callback),
            |(zeros, left, reporter, callback)| async move {
                if left == 0 {
                    return None;
                }
                let count = left.min(zeros.len() as u64);
                let part = zeros.slice(..count as usize);
                if let Some(sample) = reporter.lock().record(count) {
                    info!(
                        "upload: {} bytes in {:.3}s ({:.2} Mbit/s)",
                        sample.bytes,
                        sample.elapsed.as_secs_f64(),
                        sample.bits_per_second / 1_000_000.0
                    );
                    if let Some(callback) = &callback {
                        callback.on_progress(ProgressEvent::Sample {
                            direction: Direction::Upload,
                            sample,
                        });
                    }
                }
                Some((
                    Ok::<Bytes, std::convert::Infallible>(part),
                    (zeros, left - count, reporter, callback),
                ))
            },
        );

        let response = self
            .http
            .put(self.chunk_url(size))
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(reqwest::Body::wrap_stream(body))
            .timeout(remaining)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Transfer(format!(
                "upload chunk of {size} bytes: status {}",
                response.status()
            )));
        }

        let elapsed = t0.elapsed();
        Ok(ChunkReport {
            size,
            bytes: size,
            elapsed,
            bits_per_second: bits_per_second(size, elapsed),
        })
    }

    fn emit_sample(&self, direction: Direction, sample: RateSample) {
        info!(
            "{direction}: {} bytes in {:.3}s ({:.2} Mbit/s)",
            sample.bytes,
            sample.elapsed.as_secs_f64(),
            sample.bits_per_second / 1_000_000.0
        );
        self.notify(ProgressEvent::Sample { direction, sample });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_start_at_32_and_strictly_double() {
        let sizes: Vec<u64> = doubling_sizes().collect();
        assert_eq!(&sizes[..4], &[32, 64, 128, 256]);
        for pair in sizes.windows(2) {
            assert_eq!(pair[1], pair[0] * 2);
        }
    }

    #[test]
    fn sizes_are_capped_at_the_maximum() {
        let sizes: Vec<u64> = doubling_sizes().collect();
        assert_eq!(*sizes.last().expect("non-empty"), MAX_CHUNK_SIZE);
        assert!(sizes.iter().all(|&size| size <= MAX_CHUNK_SIZE));
        // 32 = 2^5 through 256 MiB = 2^28.
        assert_eq!(sizes.len(), 24);
    }
}
