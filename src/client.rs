//! Measurement orchestration.
//!
//! The [`Measurer`] drives a full measurement against a server: for the
//! chunk variant it creates a session, measures download then upload with
//! concurrent responsiveness probes, and deletes the session; for the
//! stream variant it dials the download and upload endpoints in turn.

use crate::chunk::{ChunkDoublingEngine, ChunkReport, Direction, DirectionSummary};
use crate::config::{Config, Mode, Variant};
use crate::probe::{ProbeSample, ProbeScheduler};
use crate::rate::RateSample;
use crate::server::SessionCreated;
use crate::stream::{self, DOWNLOAD_PATH, UPLOAD_PATH};
use crate::{Error, Result};
use log::{info, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Progress event types reported during a measurement.
///
/// Every transfer and probe outcome is surfaced through these events, so
/// failures stay observable even when they are tolerated.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A session was created on the server (chunk variant).
    SessionCreated { session_id: String },
    /// One chunk transfer completed, with its per-chunk rate.
    ChunkCompleted {
        direction: Direction,
        report: ChunkReport,
    },
    /// Periodic cumulative throughput sample for a running direction.
    Sample {
        direction: Direction,
        sample: RateSample,
    },
    /// One responsiveness probe completed (successfully or not).
    Probe(ProbeSample),
    /// A chunk-variant direction finished.
    DirectionCompleted { summary: DirectionSummary },
    /// A stream-variant direction finished.
    StreamCompleted {
        direction: Direction,
        sample: RateSample,
    },
    /// A non-fatal error was tolerated or a direction was aborted.
    Error(String),
}

/// Callback trait for receiving progress updates during a measurement.
///
/// Automatically implemented for any function or closure with the right
/// signature.
///
/// # Examples
///
/// ```no_run
/// use netgauge::{Config, Measurer, ProgressEvent};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::measure("127.0.0.1".to_string(), 4443);
/// let measurer = Measurer::new(config)?.with_callback(|event: ProgressEvent| {
///     if let ProgressEvent::Probe(sample) = event {
///         println!("rtt {:.1} ms", sample.rtt.as_secs_f64() * 1000.0);
///     }
/// });
/// measurer.run().await?;
/// # Ok(())
/// # }
/// ```
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

impl<F> ProgressCallback for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: ProgressEvent) {
        self(event)
    }
}

pub type CallbackRef = Arc<dyn ProgressCallback>;

/// Drives a full measurement against a netgauge server.
///
/// The transfer path and the probe path use separate HTTP client handles,
/// so a future mitigation for probe contamination (for example a second
/// origin) only needs to swap the probe client.
///
/// # Examples
///
/// ```no_run
/// use netgauge::{Config, Measurer, Variant};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::measure("192.0.2.10".to_string(), 4443)
///     .with_variant(Variant::Chunk);
/// let measurer = Measurer::new(config)?;
/// measurer.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Measurer {
    config: Config,
    http: reqwest::Client,
    probe_http: reqwest::Client,
    callback: Option<CallbackRef>,
    cancellation_token: CancellationToken,
}

impl Measurer {
    /// Creates a measurer from a measurement configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or not a
    /// measurement configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        if config.mode != Mode::Measure {
            return Err(Error::Config(
                "measurement configuration required".to_string(),
            ));
        }
        let http = reqwest::Client::builder().build()?;
        let probe_http = reqwest::Client::builder().build()?;
        Ok(Self {
            config,
            http,
            probe_http,
            callback: None,
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Attaches a progress callback receiving every measurement event.
    pub fn with_callback<C: ProgressCallback + 'static>(mut self, callback: C) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    fn notify(&self, event: ProgressEvent) {
        if let Some(callback) = &self.callback {
            callback.on_progress(event);
        }
    }

    /// Token that aborts the running measurement when cancelled.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Runs the configured measurement to completion.
    ///
    /// # Errors
    ///
    /// Returns an error when the measurement cannot be set up at all
    /// (session creation or connection setup fails). Failures within one
    /// direction are reported through events and logs but do not abort
    /// the remaining steps.
    pub async fn run(&self) -> Result<()> {
        match self.config.variant {
            Variant::Chunk => self.run_chunk().await,
            Variant::Stream => self.run_stream().await,
        }
    }

    async fn run_chunk(&self) -> Result<()> {
        let base = self.config.http_base();
        let session_id = self.create_session(&base).await?;
        info!("session created: sid {session_id}");
        self.notify(ProgressEvent::SessionCreated {
            session_id: session_id.clone(),
        });

        for direction in [Direction::Download, Direction::Upload] {
            info!("starting {direction}");
            self.run_direction(&base, &session_id, direction).await;
        }

        self.delete_session(&base, &session_id).await;
        info!("measurement complete: sid {session_id}");
        Ok(())
    }

    /// Runs one direction's transfer and its probe scheduler concurrently
    /// under one shared cancellation signal; the probe task never outlives
    /// this call.
    async fn run_direction(&self, base: &str, session_id: &str, direction: Direction) {
        let engine = ChunkDoublingEngine::new(
            self.http.clone(),
            base.to_string(),
            session_id.to_string(),
            self.config.budget,
            self.config.sample_interval,
            self.callback.clone(),
        );
        let scheduler = ProbeScheduler::new(
            self.probe_http.clone(),
            base.to_string(),
            session_id.to_string(),
            self.config.probe_interval,
            self.callback.clone(),
        );

        let cancel = self.cancellation_token.child_token();
        let probe_task = tokio::spawn(scheduler.run(cancel.clone()));

        let summary = engine.run(direction, &cancel).await;

        cancel.cancel();
        match probe_task.await {
            Ok(samples) => info!(
                "{direction}: {} probes across {} chunks",
                samples.len(),
                summary.chunks
            ),
            Err(err) => warn!("{direction}: probe task failed: {err}"),
        }
    }

    async fn create_session(&self, base: &str) -> Result<String> {
        let response = self.http.post(format!("{base}/session")).send().await?;
        if response.status() != reqwest::StatusCode::CREATED {
            return Err(Error::Session(format!(
                "create session: status {}",
                response.status()
            )));
        }
        let created: SessionCreated = response.json().await?;
        Ok(created.session_id)
    }

    /// Best-effort cleanup; a failed delete is logged, never fatal.
    async fn delete_session(&self, base: &str, session_id: &str) {
        match self
            .http
            .delete(format!("{base}/session/{session_id}"))
            .send()
            .await
        {
            Ok(response) => info!(
                "session deleted: sid {session_id} status {}",
                response.status()
            ),
            Err(err) => warn!("delete session failed: {err}"),
        }
    }

    async fn run_stream(&self) -> Result<()> {
        let base = self.config.ws_base();

        info!("stream download: {base}{DOWNLOAD_PATH}");
        let mut transport = stream::dial(&base, DOWNLOAD_PATH).await?;
        match stream::receiver(
            &mut transport,
            self.config.budget,
            self.config.sample_interval,
            "download",
            &self.cancellation_token,
        )
        .await
        {
            Ok(sample) => self.notify(ProgressEvent::StreamCompleted {
                direction: Direction::Download,
                sample,
            }),
            Err(err) => {
                warn!("stream download failed: {err}");
                self.notify(ProgressEvent::Error(format!("stream download: {err}")));
            }
        }

        info!("stream upload: {base}{UPLOAD_PATH}");
        let mut transport = stream::dial(&base, UPLOAD_PATH).await?;
        match stream::sender(
            &mut transport,
            self.config.budget,
            self.config.sample_interval,
            "upload",
            &self.cancellation_token,
        )
        .await
        {
            Ok(sample) => self.notify(ProgressEvent::StreamCompleted {
                direction: Direction::Upload,
                sample,
            }),
            Err(err) => {
                warn!("stream upload failed: {err}");
                self.notify(ProgressEvent::Error(format!("stream upload: {err}")));
            }
        }

        Ok(())
    }
}
