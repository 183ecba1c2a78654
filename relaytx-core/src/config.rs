//! Tunable configuration for the transfer controller: backpressure
//! watermarks, polling interval, retry counts, spool directory, and
//! ack-batch overrides (§4.4, §4.5). TOML-backed with `#[serde(default)]`
//! fields throughout, so a partial config file still parses, plus
//! `load`/`write_default` for the CLI's `--gen-config` flag.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub backpressure: BackpressureConfig,
    pub retry: RetryConfig,
    pub spool: SpoolConfig,
    pub logging: LoggingConfig,
}

/// Outbound-buffer backpressure watermarks and polling (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// High watermark in bytes; the send loop suspends at or above this.
    pub high_watermark_bytes: u64,
    /// Low watermark in bytes; the send loop resumes below this.
    pub low_watermark_bytes: u64,
    /// Polling interval used when the channel has no low-watermark
    /// notification, in milliseconds.
    pub poll_interval_ms: u64,
    /// Adaptive pre-delay steps inserted per send, in milliseconds,
    /// smallest first (§4.4 "0/5/10 ms").
    pub pre_delay_steps_ms: Vec<u64>,
}

/// Per-chunk retry and transfer-wide abort thresholds (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Linear backoff multiplier in milliseconds (`100 * attempt`).
    pub backoff_unit_ms: u64,
    /// Maximum attempts per chunk before it is abandoned.
    pub max_attempts_per_chunk: u32,
    /// Consecutive send errors (across chunks) before the whole
    /// transfer aborts.
    pub max_consecutive_errors: u32,
}

/// Durable spool location and override of the §4.3 policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    /// Directory for [`crate::spool::DiskSpool`] storage.
    pub directory: String,
    /// Force `useDurableSpool` on or off regardless of the §4.3
    /// device-class/file-size policy. `None` defers to the policy.
    pub force_durable_spool: Option<bool>,
    /// Override the §4.3 ACK-batch-size thresholds. `None` defers to
    /// [`crate::chunking::ack_batch_size`].
    pub ack_batch_size_override: Option<u32>,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            backpressure: BackpressureConfig::default(),
            retry: RetryConfig::default(),
            spool: SpoolConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high_watermark_bytes: 256 * 1024,
            low_watermark_bytes: 64 * 1024,
            poll_interval_ms: 30,
            pre_delay_steps_ms: vec![0, 5, 10],
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_unit_ms: 100,
            max_attempts_per_chunk: 3,
            max_consecutive_errors: 5,
        }
    }
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            directory: "relaytx-spool".into(),
            force_durable_spool: None,
            ack_batch_size_override: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file, falling back to defaults
    /// on a missing file or parse error.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let cfg = Self::default();
        let text = toml::to_string_pretty(&cfg)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, text)
    }

    /// Resolve the configured high watermark, raised for desktop-class
    /// senders per §4.4 ("may be raised to 1 MiB on desktops").
    pub fn high_watermark_for(&self, device_class: crate::chunking::DeviceClass) -> u64 {
        match device_class {
            crate::chunking::DeviceClass::Desktop => {
                self.backpressure.high_watermark_bytes.max(1024 * 1024)
            }
            _ => self.backpressure.high_watermark_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = RelayConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        assert!(text.contains("high_watermark_bytes"));
        assert!(text.contains("max_attempts_per_chunk"));
    }

    #[test]
    fn roundtrip_config() {
        let cfg = RelayConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: RelayConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.backpressure.high_watermark_bytes, 256 * 1024);
        assert_eq!(parsed.retry.max_attempts_per_chunk, 3);
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let cfg = RelayConfig::load(Path::new("/nonexistent/relaytx.toml"));
        assert_eq!(cfg.retry.max_consecutive_errors, 5);
    }

    #[test]
    fn high_watermark_raised_for_desktop() {
        let cfg = RelayConfig::default();
        assert_eq!(
            cfg.high_watermark_for(crate::chunking::DeviceClass::Desktop),
            1024 * 1024
        );
        assert_eq!(
            cfg.high_watermark_for(crate::chunking::DeviceClass::Mobile),
            256 * 1024
        );
    }
}
