//! System-wide CPU load from OS tick counters.
//!
//! Every source yields cumulative `(idle, total)` ticks. The load is computed
//! from the delta against the previous reading, so the first sample after a
//! clear covers the whole time since boot.
//!
//! Readings are taken from `/proc/stat` on Linux and from the Mach host CPU
//! load counters on macOS. Other platforms report the load as unknown.

use std::path::PathBuf;

use tracing::*;

use crate::error::{PerfError, Result};

/// Cumulative CPU ticks since boot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuTicks {
    pub idle: u64,
    pub total: u64,
}

/// Provides raw CPU tick counters.
pub trait CpuTicksSource: Send {
    /// `Ok(None)` means the platform has no known counter source, which is not
    /// an error.
    fn read_ticks(&mut self) -> Result<Option<CpuTicks>>;
}

/// Linux aggregate `cpu` line of `/proc/stat`.
#[derive(Debug, Clone)]
pub struct ProcStat {
    path: PathBuf,
}

impl Default for ProcStat {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/proc/stat"),
        }
    }
}

impl ProcStat {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CpuTicksSource for ProcStat {
    fn read_ticks(&mut self) -> Result<Option<CpuTicks>> {
        let content =
            std::fs::read_to_string(&self.path).map_err(|source| PerfError::CpuStatRead {
                path: self.path.clone(),
                source,
            })?;

        parse_proc_stat(&content).map(Some)
    }
}

/// Parses the aggregate `cpu` line:
/// `cpu user nice system idle iowait irq softirq steal ...`.
///
/// Total is the sum of the first eight counters; idle is the `idle` counter
/// alone. Missing trailing counters (older kernels) count as zero.
pub fn parse_proc_stat(content: &str) -> Result<CpuTicks> {
    let line = content
        .lines()
        .find(|line| line.split_whitespace().next() == Some("cpu"))
        .ok_or_else(|| PerfError::CpuStatParse("no aggregate \"cpu\" line".to_string()))?;

    let counters = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|field| {
            field
                .parse::<u64>()
                .map_err(|error| PerfError::CpuStatParse(format!("{field:?}: {error}")))
        })
        .collect::<Result<Vec<u64>>>()?;

    if counters.len() < 4 {
        return Err(PerfError::CpuStatParse(format!(
            "expected at least 4 counters, found {}",
            counters.len()
        )));
    }

    let [user, nice, system, idle, iowait, irq, softirq, steal] = {
        let mut all = [0u64; 8];
        all[..counters.len()].copy_from_slice(&counters);
        all
    };
    trace!(
        "CPU stats-> user: {user}; nice: {nice}; sys: {system}; idle: {idle} iowait: {iowait}; irq: {irq}; softirq: {softirq}; steal: {steal}"
    );

    Ok(CpuTicks {
        idle,
        total: counters.iter().sum(),
    })
}

/// Extends per-state 32-bit tick counters, which wrap around, into
/// monotonic 64-bit totals.
#[derive(Debug, Default, Clone)]
pub struct WrappingTicks {
    last: Vec<u32>,
    ticks: CpuTicks,
}

impl WrappingTicks {
    /// Folds a new reading of `counters` into the totals. `idle` indexes the
    /// idle counter. A reading with a different number of counters restarts
    /// the totals from that reading.
    pub fn update(&mut self, counters: &[u32], idle: usize) -> CpuTicks {
        if self.last.len() != counters.len() {
            self.ticks = CpuTicks {
                idle: counters.get(idle).map_or(0, |&ticks| ticks as u64),
                total: counters.iter().map(|&ticks| ticks as u64).sum(),
            };
        } else {
            for (index, (&current, &last)) in counters.iter().zip(&self.last).enumerate() {
                let delta = current.wrapping_sub(last) as u64;
                self.ticks.total += delta;
                if index == idle {
                    self.ticks.idle += delta;
                }
            }
        }

        self.last = counters.to_vec();
        self.ticks
    }
}

/// Mach `host_statistics(HOST_CPU_LOAD_INFO)` tick counters.
#[cfg(target_os = "macos")]
#[derive(Debug, Default, Clone)]
pub struct HostStatistics {
    ticks: WrappingTicks,
}

#[cfg(target_os = "macos")]
impl CpuTicksSource for HostStatistics {
    #[allow(deprecated)]
    fn read_ticks(&mut self) -> Result<Option<CpuTicks>> {
        let mut info = libc::host_cpu_load_info {
            cpu_ticks: [0; libc::CPU_STATE_MAX as usize],
        };
        let mut count = libc::HOST_CPU_LOAD_INFO_COUNT;

        let status = unsafe {
            libc::host_statistics(
                libc::mach_host_self(),
                libc::HOST_CPU_LOAD_INFO,
                &mut info as *mut libc::host_cpu_load_info as libc::host_info_t,
                &mut count,
            )
        };
        if status != libc::KERN_SUCCESS {
            return Err(PerfError::CpuStatUnavailable(format!(
                "host_statistics returned {status}"
            )));
        }

        Ok(Some(self.ticks.update(
            &info.cpu_ticks,
            libc::CPU_STATE_IDLE as usize,
        )))
    }
}

/// Platforms without a known counter source.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unsupported;

impl CpuTicksSource for Unsupported {
    fn read_ticks(&mut self) -> Result<Option<CpuTicks>> {
        Ok(None)
    }
}

/// The tick source for the target operating system.
pub fn default_source() -> Box<dyn CpuTicksSource> {
    #[cfg(target_os = "linux")]
    return Box::new(ProcStat::default());

    #[cfg(target_os = "macos")]
    return Box::new(HostStatistics::default());

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    return Box::new(Unsupported);
}

/// Turns successive tick readings into a load percentage.
pub struct CpuLoadSampler {
    source: Box<dyn CpuTicksSource>,
    previous: CpuTicks,
}

impl std::fmt::Debug for CpuLoadSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuLoadSampler")
            .field("previous", &self.previous)
            .finish_non_exhaustive()
    }
}

impl Default for CpuLoadSampler {
    fn default() -> Self {
        Self::new(default_source())
    }
}

impl CpuLoadSampler {
    pub fn new(source: Box<dyn CpuTicksSource>) -> Self {
        Self {
            source,
            previous: CpuTicks::default(),
        }
    }

    /// Reads the source and returns the load in percent since the previous
    /// reading, or `None` when it is unknown.
    pub fn sample(&mut self) -> Option<u32> {
        match self.source.read_ticks() {
            Ok(Some(ticks)) => Some(self.compute(ticks)),
            Ok(None) => None,
            Err(error) => {
                warn!("Failed to get the CPU load: {error}");
                None
            }
        }
    }

    /// Load in percent between the stored snapshot and `current`, rounded to
    /// the nearest integer. The snapshot is replaced by `current`. Counters
    /// going backwards (reset, CPU hot-unplug) give a load of zero.
    pub fn compute(&mut self, current: CpuTicks) -> u32 {
        let previous = std::mem::replace(&mut self.previous, current);

        let (Some(idle), Some(total)) = (
            current.idle.checked_sub(previous.idle),
            current.total.checked_sub(previous.total),
        ) else {
            debug!("CPU tick counters went backwards: {previous:?} -> {current:?}");
            return 0;
        };

        if total == 0 {
            return 0;
        }

        // Scaled by 1000 so integer division can round to the nearest percent.
        let busy = total.saturating_sub(idle) as u128;
        ((1000 * busy / total as u128 + 5) / 10) as u32
    }

    pub fn previous(&self) -> CpuTicks {
        self.previous
    }

    pub fn clear(&mut self) {
        self.previous = CpuTicks::default();
    }
}
