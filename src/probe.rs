//! Responsiveness probing.
//!
//! While a bulk transfer runs, small round-trip requests are issued at a
//! fixed cadence to observe latency under load (bufferbloat shows up as the
//! round-trip time rising sharply once the pipe is full).

use crate::client::{CallbackRef, ProgressEvent};
use crate::session::fresh_token;
use log::{info, warn};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Outcome of one responsiveness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The probe completed with a success status.
    Success,
    /// The probe completed with a non-success HTTP status.
    Status(u16),
    /// The probe failed at the transport level.
    Failed(String),
}

/// One round-trip measurement under load.
#[derive(Debug, Clone)]
pub struct ProbeSample {
    pub probe_id: String,
    pub rtt: Duration,
    pub outcome: ProbeOutcome,
}

/// Issues small round-trip requests at a fixed cadence, independent of the
/// bulk transfer, until cancelled.
///
/// The scheduler owns its own HTTP client handle so the probe path stays
/// pluggable separately from the transfer path. Note that when both paths
/// resolve to the same underlying connection, probe latency reflects
/// transport-level scheduling rather than path round-trip time; that
/// limitation is inherited from the protocol design.
pub struct ProbeScheduler {
    http: reqwest::Client,
    base_url: String,
    session_id: String,
    interval: Duration,
    callback: Option<CallbackRef>,
}

impl ProbeScheduler {
    pub fn new(
        http: reqwest::Client,
        base_url: String,
        session_id: String,
        interval: Duration,
        callback: Option<CallbackRef>,
    ) -> Self {
        Self {
            http,
            base_url,
            session_id,
            interval,
            callback,
        }
    }

    /// Runs until the token is cancelled, returning every emitted sample.
    ///
    /// A failed probe is reported and tolerated; only cancellation stops
    /// the scheduler. Cancellation between ticks exits without issuing a
    /// further request.
    pub async fn run(self, cancel: CancellationToken) -> Vec<ProbeSample> {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + self.interval, self.interval);
        let mut samples = Vec::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let sample = tokio::select! {
                _ = cancel.cancelled() => break,
                sample = self.probe_once() => sample,
            };
            match &sample.outcome {
                ProbeOutcome::Success => info!(
                    "probe {}: rtt {:.1} ms",
                    sample.probe_id,
                    sample.rtt.as_secs_f64() * 1000.0
                ),
                ProbeOutcome::Status(status) => warn!(
                    "probe {}: status {} after {:.1} ms",
                    sample.probe_id,
                    status,
                    sample.rtt.as_secs_f64() * 1000.0
                ),
                ProbeOutcome::Failed(err) => warn!("probe {}: {}", sample.probe_id, err),
            }
            if let Some(callback) = &self.callback {
                callback.on_progress(ProgressEvent::Probe(sample.clone()));
            }
            samples.push(sample);
        }

        samples
    }

    async fn probe_once(&self) -> ProbeSample {
        let probe_id = fresh_token();
        let url = format!(
            "{}/session/{}/probe/{}",
            self.base_url, self.session_id, probe_id
        );
        let t0 = Instant::now();
        let outcome = match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => ProbeOutcome::Success,
            Ok(response) => ProbeOutcome::Status(response.status().as_u16()),
            Err(err) => ProbeOutcome::Failed(err.to_string()),
        };
        ProbeSample {
            probe_id,
            rtt: t0.elapsed(),
            outcome,
        }
    }
}
