//! netgauge - network throughput and responsiveness measurement
//!
//! This library measures achievable throughput and latency under load
//! between two endpoints, using one of two protocol variants:
//!
//! - the **chunk** variant performs discrete HTTP transfers of doubling
//!   size against a server-assigned session, while small responsiveness
//!   probes run concurrently to detect bufferbloat;
//! - the **stream** variant transfers adaptively sized frames over one
//!   persistent WebSocket connection per direction.
//!
//! # Features
//!
//! - Chunk doubling from 32 bytes to 256 MiB under a fixed time budget
//! - Adaptive message scaling gated on demonstrated throughput
//! - Concurrent responsiveness probing at a fixed cadence
//! - Periodic throughput sampling on the I/O path
//! - Asynchronous I/O using tokio

pub mod chunk;
pub mod client;
pub mod config;
pub mod error;
pub mod probe;
pub mod rate;
pub mod server;
pub mod session;
pub mod stream;

pub use chunk::{ChunkDoublingEngine, Direction};
pub use client::{Measurer, ProgressCallback, ProgressEvent};
pub use config::{Config, Mode, Variant};
pub use error::{Error, Result};
pub use probe::{ProbeOutcome, ProbeSample, ProbeScheduler};
pub use rate::{RateReporter, RateSample};
pub use server::Server;
pub use session::SessionRegistry;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
