//! Per-second reports driven by buffer arrival.
//!
//! A report is due on the first buffer of a run and then on the first buffer
//! arriving at least [`REPORT_PERIOD`] after the previous report. Frame rate is
//! measured over the observed gap, so a stalled stream yields one report with
//! a long period instead of several empty ones.

use std::{io::Write, sync::Mutex, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::*;

use super::{
    accumulator::{BitrateCells, SampleAccumulator},
    average::cumulative_average,
    clock::format_clock_time,
    cpu::CpuLoadSampler,
    gpu::{GpuStats, GpuStatsSampler},
};

pub const REPORT_PERIOD: Duration = Duration::from_secs(1);

/// Everything published for one report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerfReport {
    pub stage: String,
    /// Monotonic clock time of the buffer that triggered the report.
    #[serde(with = "duration_nanos", rename = "timestamp_ns")]
    pub timestamp: Duration,
    pub fps: f64,
    pub fps_average: f64,
    pub bitrate_instant: f64,
    pub bitrate_average: f64,
    /// `None` when CPU sampling is disabled or the load is unknown.
    pub cpu_load: Option<u32>,
    #[serde(flatten)]
    pub gpu: GpuStats,
}

impl PerfReport {
    /// The human readable line posted alongside the structured stats.
    pub fn info_message(&self, print_cpu_load: bool) -> String {
        let mut message = format!(
            "perf: {}; timestamp: {}; bps: {:.3}; mean_bps: {:.3}; fps: {:.3}; mean_fps: {:.3}",
            self.stage,
            format_clock_time(self.timestamp),
            self.bitrate_instant,
            self.bitrate_average,
            self.fps,
            self.fps_average,
        );

        if print_cpu_load {
            match self.cpu_load {
                Some(load) => message.push_str(&format!("; cpu: {load}; ")),
                None => message.push_str("; cpu: -1; "),
            }
        }

        message
    }
}

mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_nanos)
    }
}

/// Receives what a stage emits once per report.
pub trait ReportSink: Send + Sync {
    /// Informational text message.
    fn on_message(&self, report: &PerfReport, text: &str);

    /// Structured notification with all numeric fields.
    fn on_stats(&self, report: &PerfReport);
}

impl<S: ReportSink + ?Sized> ReportSink for std::sync::Arc<S> {
    fn on_message(&self, report: &PerfReport, text: &str) {
        (**self).on_message(report, text)
    }

    fn on_stats(&self, report: &PerfReport) {
        (**self).on_stats(report)
    }
}

impl ReportSink for Vec<Box<dyn ReportSink>> {
    fn on_message(&self, report: &PerfReport, text: &str) {
        for sink in self {
            sink.on_message(report, text);
        }
    }

    fn on_stats(&self, report: &PerfReport) {
        for sink in self {
            sink.on_stats(report);
        }
    }
}

/// Writes every report as one JSON object per line.
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<W: Write + Send> ReportSink for JsonLinesSink<W> {
    fn on_message(&self, _report: &PerfReport, _text: &str) {}

    fn on_stats(&self, report: &PerfReport) {
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let result = serde_json::to_writer(&mut *writer, report)
            .map_err(std::io::Error::from)
            .and_then(|_| writeln!(writer))
            .and_then(|_| writer.flush());
        if let Err(error) = result {
            warn!("Failed to write stats for {:?}: {error}", report.stage);
        }
    }
}

/// Which optional samplers run for a report.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReportFlags {
    pub print_cpu_load: bool,
    pub gpu_stats_enabled: bool,
}

/// Buffer path state. Only touched from the thread delivering buffers.
#[derive(Debug)]
pub struct ReportEngine {
    reports: u64,
    fps_average: f64,
    prev_timestamp: Option<Duration>,
    cpu: CpuLoadSampler,
    gpu: GpuStatsSampler,
}

impl Default for ReportEngine {
    fn default() -> Self {
        Self::new(CpuLoadSampler::default(), GpuStatsSampler::default())
    }
}

impl ReportEngine {
    pub fn new(cpu: CpuLoadSampler, gpu: GpuStatsSampler) -> Self {
        Self {
            reports: 0,
            fps_average: 0.0,
            prev_timestamp: None,
            cpu,
            gpu,
        }
    }

    pub fn set_cpu_sampler(&mut self, cpu: CpuLoadSampler) {
        self.cpu = cpu;
    }

    pub fn set_gpu_sampler(&mut self, gpu: GpuStatsSampler) {
        self.gpu = gpu;
    }

    pub fn is_due(&self, now: Duration) -> bool {
        match self.prev_timestamp {
            None => true,
            Some(prev) => now.saturating_sub(prev) >= REPORT_PERIOD,
        }
    }

    /// Closes the current reporting period at `now`.
    pub fn report(
        &mut self,
        stage: &str,
        now: Duration,
        accumulator: &SampleAccumulator,
        bitrate: &BitrateCells,
        flags: ReportFlags,
    ) -> PerfReport {
        // The first report has no previous period; count it as one second.
        let elapsed_seconds = self
            .prev_timestamp
            .map_or(1.0, |prev| now.saturating_sub(prev).as_secs_f64());

        let frames = accumulator.drain_frames();
        let fps = if elapsed_seconds > 0.0 {
            frames as f64 / elapsed_seconds
        } else {
            0.0
        };

        self.fps_average = cumulative_average(self.reports, fps, self.fps_average);
        self.reports += 1;
        self.prev_timestamp = Some(now);

        let bitrate_instant = bitrate.instant();
        let bitrate_average = bitrate.average();

        let cpu_load = if flags.print_cpu_load {
            self.cpu.sample()
        } else {
            None
        };

        let gpu = if flags.gpu_stats_enabled {
            self.gpu.sample()
        } else {
            self.gpu.last()
        };

        PerfReport {
            stage: stage.to_string(),
            timestamp: now,
            fps,
            fps_average: self.fps_average,
            bitrate_instant,
            bitrate_average,
            cpu_load,
            gpu,
        }
    }

    pub fn reports(&self) -> u64 {
        self.reports
    }

    pub fn fps_average(&self) -> f64 {
        self.fps_average
    }

    pub fn prev_timestamp(&self) -> Option<Duration> {
        self.prev_timestamp
    }

    pub fn clear(&mut self) {
        self.reports = 0;
        self.fps_average = 0.0;
        self.prev_timestamp = None;
        self.cpu.clear();
        self.gpu.clear();
    }
}
