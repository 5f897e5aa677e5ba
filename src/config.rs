//! Kernel Configuration
//!
//! Tunables for the worker pool, timeouts and the background sweep.
//! Every field has a default so a partial YAML file is valid.
//!
//! # Example YAML Format
//!
//! ```yaml
//! workers: 8
//! facilitation_timeout_ms: 2000
//! dispatch_timeout_ms: 5000
//! default_task_expiry_ms: 60000
//! sweep_interval_ms: 1000
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};

/// Runtime configuration for an orchestrator instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct KernelConfig {
    /// Number of events processed concurrently
    pub workers: usize,

    /// Upper bound on an asynchronous facilitator probe
    pub facilitation_timeout_ms: u64,

    /// Upper bound on handing a task to the transport
    pub dispatch_timeout_ms: u64,

    /// Task expiry used when a step does not request one
    pub default_task_expiry_ms: u64,

    /// Period of the task-expiry and intervention-deadline sweep
    pub sweep_interval_ms: u64,

    /// Backoff used by retry advisers without explicit wait intervals
    pub default_retry_wait_ms: u64,

    /// Deadline for manual intervention when the adviser sets none
    pub intervention_timeout_ms: Option<u64>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            facilitation_timeout_ms: 2_000,
            dispatch_timeout_ms: 5_000,
            default_task_expiry_ms: 60_000,
            sweep_interval_ms: 1_000,
            default_retry_wait_ms: 0,
            intervention_timeout_ms: None,
        }
    }
}

impl KernelConfig {
    /// Loads configuration from a YAML file and validates it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            KernelError::Config(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        let config: KernelConfig = serde_yaml::from_str(&content)?;
        config.validate()?;

        info!("Loaded kernel configuration from {}", path.display());
        Ok(config)
    }

    /// Rejects values that would stall the kernel.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(KernelError::Config("workers must be at least 1".into()));
        }
        let timeouts = [
            ("facilitation_timeout_ms", self.facilitation_timeout_ms),
            ("dispatch_timeout_ms", self.dispatch_timeout_ms),
            ("default_task_expiry_ms", self.default_task_expiry_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(KernelError::Config(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }

    pub fn facilitation_timeout(&self) -> Duration {
        Duration::from_millis(self.facilitation_timeout_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn default_task_expiry(&self) -> Duration {
        Duration::from_millis(self.default_task_expiry_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = KernelConfig::default();
        assert!(config.workers >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: KernelConfig = serde_yaml::from_str("workers: 3").unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.dispatch_timeout_ms, 5_000);
        assert_eq!(config.intervention_timeout_ms, None);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "workers: 2\nsweep_interval_ms: 50").unwrap();

        let config = KernelConfig::load(file.path()).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.sweep_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = KernelConfig {
            workers: 0,
            ..KernelConfig::default()
        };
        assert!(matches!(config.validate(), Err(KernelError::Config(_))));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = KernelConfig {
            dispatch_timeout_ms: 0,
            ..KernelConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("dispatch_timeout_ms"));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let result = KernelConfig::load("/nonexistent/kernel.yaml");
        assert!(matches!(result, Err(KernelError::Config(_))));
    }
}
