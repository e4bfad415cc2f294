use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::*;

use crate::error::{PerfError, Result};

const NVIDIA_SMI: &str = "nvidia-smi";

/// Query fields, in the order [`GpuStats`] is parsed from.
const NVIDIA_SMI_QUERY: &[&str] = &[
    "utilization.encoder",
    "encoder.stats.sessionCount",
    "encoder.stats.averageFps",
    "encoder.stats.averageLatency",
    "utilization.gpu",
    "memory.used",
    "memory.free",
];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuStats {
    pub encoder_utilization: u32,
    pub session_count: u32,
    pub average_fps: u32,
    pub average_latency: u64,
    pub gpu_utilization: u32,
    pub memory_used: u32,
    pub memory_free: u32,
}

impl GpuStats {
    /// Parses one line of `nvidia-smi --format=csv,noheader` output for
    /// [`NVIDIA_SMI_QUERY`]. Only the first GPU (first line) is considered.
    pub fn parse_csv(output: &str) -> Result<Self> {
        let line = output
            .lines()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| PerfError::GpuStatsParse("empty output".to_string()))?;

        let values = line
            .split(',')
            .map(parse_leading_number)
            .collect::<Result<Vec<u64>>>()?;

        let [encoder_utilization, session_count, average_fps, average_latency, gpu_utilization, memory_used, memory_free] =
            values[..]
        else {
            return Err(PerfError::GpuStatsParse(format!(
                "expected {} fields, found {} in {line:?}",
                NVIDIA_SMI_QUERY.len(),
                values.len()
            )));
        };

        Ok(Self {
            encoder_utilization: encoder_utilization as u32,
            session_count: session_count as u32,
            average_fps: average_fps as u32,
            average_latency,
            gpu_utilization: gpu_utilization as u32,
            memory_used: memory_used as u32,
            memory_free: memory_free as u32,
        })
    }
}

/// Reads the leading unsigned integer of a field such as `" 35 %"` or
/// `"1024 MiB"`. Bracketed placeholders like `[N/A]` or `[Not Supported]` read
/// as zero.
fn parse_leading_number(field: &str) -> Result<u64> {
    let field = field.trim();
    if field.starts_with('[') && field.ends_with(']') {
        return Ok(0);
    }

    let digits = field
        .find(|c: char| !c.is_ascii_digit())
        .map_or(field, |end| &field[..end]);

    digits
        .parse()
        .map_err(|_| PerfError::GpuStatsParse(format!("{field:?} is not a number")))
}

/// Provides a fresh [`GpuStats`] sample.
pub trait GpuStatsSource: Send {
    fn query(&mut self) -> Result<GpuStats>;
}

/// Synchronous `nvidia-smi` invocation.
#[derive(Debug, Clone)]
pub struct NvidiaSmi {
    program: String,
}

impl Default for NvidiaSmi {
    fn default() -> Self {
        Self {
            program: NVIDIA_SMI.to_string(),
        }
    }
}

impl NvidiaSmi {
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl GpuStatsSource for NvidiaSmi {
    #[instrument(level = "trace", skip(self), fields(program = %self.program))]
    fn query(&mut self) -> Result<GpuStats> {
        let output = Command::new(&self.program)
            .arg("--format=csv,noheader")
            .arg(format!("--query-gpu={}", NVIDIA_SMI_QUERY.join(",")))
            .output()
            .map_err(PerfError::GpuQuery)?;

        if !output.status.success() {
            return Err(PerfError::GpuQueryStatus(output.status));
        }

        GpuStats::parse_csv(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Keeps the last successful GPU sample.
pub struct GpuStatsSampler {
    source: Box<dyn GpuStatsSource>,
    last: GpuStats,
}

impl std::fmt::Debug for GpuStatsSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuStatsSampler")
            .field("last", &self.last)
            .finish_non_exhaustive()
    }
}

impl Default for GpuStatsSampler {
    fn default() -> Self {
        Self::new(Box::new(NvidiaSmi::default()))
    }
}

impl GpuStatsSampler {
    pub fn new(source: Box<dyn GpuStatsSource>) -> Self {
        Self {
            source,
            last: GpuStats::default(),
        }
    }

    /// Queries the source. On failure the previous sample is kept and
    /// returned.
    pub fn sample(&mut self) -> GpuStats {
        match self.source.query() {
            Ok(stats) => self.last = stats,
            Err(error) => warn!("Failed to get GPU stats: {error}"),
        }

        self.last
    }

    pub fn last(&self) -> GpuStats {
        self.last
    }

    pub fn clear(&mut self) {
        self.last = GpuStats::default();
    }
}
