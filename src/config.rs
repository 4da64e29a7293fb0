//! Configuration loading for the capture binary.
//!
//! Configuration is merged from two providers:
//! 1. a TOML file (`wavespool.toml` by default),
//! 2. environment variables prefixed with `WAVESPOOL_`, with `__`
//!    separating nested keys (`WAVESPOOL_LISTENER__BASE_PORT=2000`).
//!
//! Every field has a sensible default, so an absent file still yields a
//! runnable configuration. `validate()` catches values that parse but make
//! no sense before any socket or file is touched.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::classify::ProcessorKind;
use crate::error::{Result, SpoolError};
use crate::wire;

/// One batch of receive slots is sized to stay inside a typical L2 cache.
const BATCH_CACHE_BUDGET: usize = 256_000;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Application-level settings.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Socket and receive-path settings.
    #[serde(default)]
    pub listener: ListenerConfig,
    /// Output and classification settings.
    #[serde(default)]
    pub capture: CaptureConfig,
}

/// Application-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Instance name used in log output.
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Logging format (pretty, compact, json).
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Socket and receive-path settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Address every instance binds on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// First UDP port; instance `i` binds `base_port + i`.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Number of independent listener instances.
    #[serde(default = "default_instances")]
    pub instances: u16,
    /// Slots received per batch; 0 sizes the batch to the cache budget.
    #[serde(default)]
    pub batch_size: usize,
    /// Largest fragment width (in samples) the digitizer will send.
    #[serde(default = "default_max_fragment_samples")]
    pub max_fragment_samples: u16,
}

/// Output and classification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Directory the spool files are written into.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// File prefix; defaults to a start timestamp when unset.
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Batch-processing behavior.
    #[serde(default)]
    pub processor: ProcessorKind,
    /// Fraction of acceptable fragments the fault injector abandons.
    #[serde(default = "default_fault_fraction")]
    pub fault_fraction: f64,
    /// Stop an instance after observing this many events.
    #[serde(default)]
    pub event_limit: Option<u64>,
    /// Warn when an accepted fragment jumps the watermark by more than
    /// this gap; 0 disables the warning.
    #[serde(default = "default_reorder_warn_gap")]
    pub reorder_warn_gap: u64,
}

fn default_name() -> String {
    "wavespool".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_base_port() -> u16 {
    1338
}

fn default_instances() -> u16 {
    1
}

fn default_max_fragment_samples() -> u16 {
    wire::DEFAULT_MAX_FRAGMENT_SAMPLES
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("rawdata")
}

fn default_fault_fraction() -> f64 {
    0.37
}

fn default_reorder_warn_gap() -> u64 {
    1000
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            base_port: default_base_port(),
            instances: default_instances(),
            batch_size: 0,
            max_fragment_samples: default_max_fragment_samples(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            file_prefix: None,
            processor: ProcessorKind::default(),
            fault_fraction: default_fault_fraction(),
            event_limit: None,
            reorder_warn_gap: default_reorder_warn_gap(),
        }
    }
}

impl ListenerConfig {
    /// Receive slot width this deployment allocates per datagram.
    pub fn slot_len(&self) -> usize {
        wire::slot_len(self.max_fragment_samples)
    }

    /// Configured batch size, or the cache-budget default when 0.
    pub fn effective_batch_size(&self) -> usize {
        if self.batch_size > 0 {
            self.batch_size
        } else {
            (BATCH_CACHE_BUDGET / self.slot_len()).max(1)
        }
    }
}

impl CaptureConfig {
    /// The configured prefix, or a fresh start-time stamp.
    pub fn resolved_prefix(&self) -> String {
        self.file_prefix.clone().unwrap_or_else(|| {
            chrono::Local::now()
                .format("%Y-%m-%d_%H-%M-%S")
                .to_string()
        })
    }
}

impl Config {
    /// Load from the default `wavespool.toml` plus environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_from("wavespool.toml")
    }

    /// Load from a specific TOML file plus environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("WAVESPOOL_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Reject values that parse but cannot work.
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(SpoolError::Configuration(format!(
                "invalid log_level '{}'; must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(SpoolError::Configuration(format!(
                "invalid log_format '{}'; must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.listener.instances == 0 {
            return Err(SpoolError::Configuration(
                "listener.instances must be at least 1".to_string(),
            ));
        }

        if self.listener.max_fragment_samples == 0 {
            return Err(SpoolError::Configuration(
                "listener.max_fragment_samples must be at least 1".to_string(),
            ));
        }

        if u32::from(self.listener.base_port) + u32::from(self.listener.instances) > 0x1_0000 {
            return Err(SpoolError::Configuration(format!(
                "{} instances starting at port {} would run past the port range",
                self.listener.instances, self.listener.base_port
            )));
        }

        if !(0.0..=1.0).contains(&self.capture.fault_fraction) {
            return Err(SpoolError::Configuration(format!(
                "capture.fault_fraction {} must lie in [0, 1]",
                self.capture.fault_fraction
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate_and_match_the_stock_deployment() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listener.slot_len(), 1064);
        // 256000 / 1064 slots per batch, as the receive loop was tuned.
        assert_eq!(config.listener.effective_batch_size(), 240);
        assert_eq!(config.capture.processor, ProcessorKind::Order);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[listener]\nbase_port = 2000\ninstances = 4\n\n\
             [capture]\nprocessor = \"fault-inject\"\nfault_fraction = 0.5"
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.listener.base_port, 2000);
        assert_eq!(config.listener.instances, 4);
        assert_eq!(config.capture.processor, ProcessorKind::FaultInject);
        assert!((config.capture.fault_fraction - 0.5).abs() < f64::EPSILON);
        // Untouched sections keep their defaults.
        assert_eq!(config.application.log_level, "info");
    }

    #[test]
    fn bad_log_level_is_rejected() {
        let mut config = Config::default();
        config.application.log_level = "loud".to_string();
        assert!(matches!(
            config.validate(),
            Err(SpoolError::Configuration(_))
        ));
    }

    #[test]
    fn fault_fraction_outside_unit_interval_is_rejected() {
        let mut config = Config::default();
        config.capture.fault_fraction = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn instance_range_must_fit_the_port_space() {
        let mut config = Config::default();
        config.listener.base_port = 65530;
        config.listener.instances = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_prefix_wins_over_timestamp() {
        let mut capture = CaptureConfig::default();
        capture.file_prefix = Some("beamtest".to_string());
        assert_eq!(capture.resolved_prefix(), "beamtest");

        capture.file_prefix = None;
        // Timestamp prefix has the strftime shape, e.g. 2026-08-06_12-30-00.
        assert_eq!(capture.resolved_prefix().len(), 19);
    }
}
