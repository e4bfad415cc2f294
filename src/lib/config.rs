use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::*;

use crate::error::{PerfError, Result};

pub const DEFAULT_PRINT_CPU_LOAD: bool = false;
pub const DEFAULT_GPU_STATS_ENABLED: bool = false;
pub const DEFAULT_BITRATE_WINDOW_SIZE: u32 = 0;
pub const DEFAULT_BITRATE_INTERVAL_MS: u32 = 1000;
/// 8 MiB of samples, over twelve days at the default interval.
pub const MAX_BITRATE_WINDOW_SIZE: u32 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerfConfig {
    /// Sample the system CPU load and append it to the report text.
    pub print_cpu_load: bool,
    /// Query GPU stats for the structured report.
    pub gpu_stats_enabled: bool,
    /// Number of samples in the bitrate moving average, 0 averages all samples.
    pub bitrate_window_size: u32,
    /// Interval between bitrate calculations. Runs even when no buffers are
    /// received.
    pub bitrate_interval_ms: u32,
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            print_cpu_load: DEFAULT_PRINT_CPU_LOAD,
            gpu_stats_enabled: DEFAULT_GPU_STATS_ENABLED,
            bitrate_window_size: DEFAULT_BITRATE_WINDOW_SIZE,
            bitrate_interval_ms: DEFAULT_BITRATE_INTERVAL_MS,
        }
    }
}

/// On-disk layout, which still accepts the deprecated `print_arm_load`.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(flatten)]
    config: PerfConfig,
    print_arm_load: Option<bool>,
}

impl PerfConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bitrate_interval_ms == 0 {
            return Err(PerfError::InvalidConfig(
                "bitrate_interval_ms must be greater than zero".to_string(),
            ));
        }

        if self.bitrate_window_size > MAX_BITRATE_WINDOW_SIZE {
            return Err(PerfError::InvalidConfig(format!(
                "bitrate_window_size must be at most {MAX_BITRATE_WINDOW_SIZE}, got {}",
                self.bitrate_window_size
            )));
        }

        Ok(())
    }

    pub fn from_json(content: &str) -> std::result::Result<Self, serde_json::Error> {
        let file: ConfigFile = serde_json::from_str(content)?;
        let mut config = file.config;

        if let Some(print_arm_load) = file.print_arm_load {
            warn!("print_arm_load is deprecated, use print_cpu_load instead!");
            config.print_cpu_load = print_arm_load;
        }

        Ok(config)
    }

    /// Loads and validates a JSON configuration file.
    #[instrument(level = "debug")]
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| PerfError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_json(&content).map_err(|source| PerfError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;

        debug!("Loaded configuration: {config:?}");
        Ok(config)
    }
}
