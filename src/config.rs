use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default time budget for one direction's measurement.
pub const DEFAULT_BUDGET: Duration = Duration::from_secs(10);

/// Default cadence for responsiveness probes.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// Protocol variant for a measurement.
///
/// The chunk variant performs a sequence of discrete HTTP request/response
/// transfers of doubling size against a server-assigned session. The stream
/// variant transfers adaptively sized frames over one persistent WebSocket
/// connection per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Variant {
    /// Session-based discrete chunk transfers over HTTP.
    Chunk,
    /// Continuous duplex framed transfer over WebSocket.
    Stream,
}

/// Run mode: serve measurement requests or measure against a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Server mode - answers session, chunk, probe and stream requests.
    Serve,
    /// Measurement mode - drives transfers and probes against a server.
    Measure,
}

/// Configuration for netgauge servers and measurers.
///
/// Use the builder-style methods to customize a configuration created with
/// [`Config::serve`] or [`Config::measure`].
///
/// # Examples
///
/// ```
/// use netgauge::{Config, Variant};
/// use std::time::Duration;
///
/// let config = Config::measure("192.0.2.10".to_string(), 4443)
///     .with_variant(Variant::Stream)
///     .with_budget(Duration::from_secs(5));
/// assert_eq!(config.port, 4443);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Serve or measure.
    pub mode: Mode,

    /// Protocol variant to use.
    pub variant: Variant,

    /// Server address: the bind address in serve mode, the target address
    /// in measure mode.
    pub address: String,

    /// TCP port to listen on or connect to.
    pub port: u16,

    /// Time budget per measured direction.
    pub budget: Duration,

    /// Cadence of responsiveness probes during a transfer.
    pub probe_interval: Duration,

    /// Lower bound on the interval between periodic rate emissions.
    pub sample_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Measure,
            variant: Variant::Chunk,
            address: "127.0.0.1".to_string(),
            port: 4443,
            budget: DEFAULT_BUDGET,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            sample_interval: crate::rate::DEFAULT_SAMPLE_INTERVAL,
        }
    }
}

impl Config {
    /// Creates a server configuration bound to the given address and port.
    pub fn serve(address: String, port: u16) -> Self {
        Self {
            mode: Mode::Serve,
            address,
            port,
            ..Default::default()
        }
    }

    /// Creates a measurement configuration targeting the given server.
    pub fn measure(address: String, port: u16) -> Self {
        Self {
            mode: Mode::Measure,
            address,
            port,
            ..Default::default()
        }
    }

    /// Sets the protocol variant.
    pub fn with_variant(mut self, variant: Variant) -> Self {
        self.variant = variant;
        self
    }

    /// Sets the per-direction time budget.
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    /// Sets the probe cadence.
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Sets the rate-sampling interval.
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    /// Validates the configuration. A malformed configuration is a fatal
    /// setup error: neither a server nor a measurer is started from one.
    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(Error::Config("address must not be empty".to_string()));
        }
        if self.budget.is_zero() {
            return Err(Error::Config("budget must be positive".to_string()));
        }
        if self.probe_interval.is_zero() {
            return Err(Error::Config("probe interval must be positive".to_string()));
        }
        if self.sample_interval.is_zero() {
            return Err(Error::Config(
                "sample interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Base `http://` URL for the configured server.
    pub fn http_base(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }

    /// Base `ws://` URL for the configured server.
    pub fn ws_base(&self) -> String {
        format!("ws://{}:{}", self.address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.budget, Duration::from_secs(10));
        assert_eq!(config.probe_interval, Duration::from_millis(250));
        assert_eq!(config.sample_interval, Duration::from_millis(250));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_budget() {
        let config = Config::measure("127.0.0.1".to_string(), 4443)
            .with_budget(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn builder_round_trip() {
        let config = Config::serve("0.0.0.0".to_string(), 8080)
            .with_variant(Variant::Stream)
            .with_budget(Duration::from_secs(3))
            .with_probe_interval(Duration::from_millis(100))
            .with_sample_interval(Duration::from_millis(50));
        assert_eq!(config.mode, Mode::Serve);
        assert_eq!(config.variant, Variant::Stream);
        assert_eq!(config.budget, Duration::from_secs(3));
        assert_eq!(config.probe_interval, Duration::from_millis(100));
        assert_eq!(config.sample_interval, Duration::from_millis(50));
    }
}
