use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, PerfError>;

#[derive(Debug, thiserror::Error)]
pub enum PerfError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unable to read configuration file {path:?}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Unable to parse configuration file {path:?}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// The bitrate window buffer could not be reserved at start.
    #[error("Unable to allocate a bitrate window of {0} samples")]
    WindowAllocation(usize),

    #[error("Stage {0:?} is already running")]
    AlreadyRunning(String),

    #[error("Failed to spawn the bitrate timer thread: {0}")]
    TimerSpawn(std::io::Error),

    #[error("Failed to read CPU statistics from {path:?}: {source}")]
    CpuStatRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse CPU statistics: {0}")]
    CpuStatParse(String),

    #[error("CPU statistics unavailable: {0}")]
    CpuStatUnavailable(String),

    #[error("Failed to run GPU query tool: {0}")]
    GpuQuery(std::io::Error),

    #[error("GPU query tool exited with {0}")]
    GpuQueryStatus(std::process::ExitStatus),

    #[error("Failed to parse GPU stats: {0}")]
    GpuStatsParse(String),
}
