//! Tunnel configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{TransportError, TransportResult};

/// Key rotation interval used when none is configured
pub const DEFAULT_REKEY_INTERVAL_MS: u64 = 60_000;

/// Runtime settings shared by client and server endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Period of the per-connection key rotation timer (0 disables it)
    pub rekey_interval_ms: u64,
    /// Read timeout while waiting for the peer's public key (0 waits forever)
    pub handshake_timeout_ms: u64,
    /// Socket write timeout (0 blocks forever)
    pub write_timeout_ms: u64,
    /// Directory received files are written into
    pub receive_dir: PathBuf,
    /// Disable Nagle's algorithm on tunnel sockets
    pub nodelay: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            rekey_interval_ms: DEFAULT_REKEY_INTERVAL_MS,
            handshake_timeout_ms: 10_000,
            write_timeout_ms: 30_000,
            receive_dir: PathBuf::from("."),
            nodelay: true,
        }
    }
}

impl TunnelConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> TransportResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| TransportError::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.receive_dir.as_os_str().is_empty() {
            return Err(TransportError::Config("receive_dir must not be empty".into()));
        }
        Ok(())
    }

    /// Create `receive_dir` if it is missing
    pub fn ensure_receive_dir(&self) -> TransportResult<()> {
        std::fs::create_dir_all(&self.receive_dir).map_err(|e| {
            TransportError::Config(format!(
                "receive_dir {}: {}",
                self.receive_dir.display(),
                e
            ))
        })
    }

    pub fn with_receive_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.receive_dir = dir.into();
        self
    }

    pub fn with_rekey_interval(mut self, interval: Duration) -> Self {
        self.rekey_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn rekey_interval(&self) -> Option<Duration> {
        non_zero_millis(self.rekey_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.handshake_timeout_ms)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.write_timeout_ms)
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
