//! The pass-through measuring stage.
//!
//! A [`PerfStage`] is fed every buffer of a stream (through
//! [`PerfStage::transform`] or [`PerfStage::on_buffer`]) and never alters or
//! drops it. Between [`PerfStage::start`] and [`PerfStage::stop`] it runs a
//! bitrate timer thread and emits one [`PerfReport`] per reporting period to
//! its [`ReportSink`].

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError, RwLock,
};

use tracing::*;

use crate::{
    config::PerfConfig,
    error::{PerfError, Result},
    stats::{
        accumulator::{BitrateCells, SampleAccumulator},
        bitrate::{BitrateState, BitrateTimer},
        clock::{Clock, MonotonicClock},
        cpu::{CpuLoadSampler, CpuTicksSource},
        gpu::{GpuStatsSampler, GpuStatsSource},
        report::{PerfReport, ReportEngine, ReportFlags, ReportSink},
    },
};

/// Anything flowing through the stage whose payload size can be measured.
pub trait Payload {
    fn payload_size(&self) -> usize;
}

impl Payload for [u8] {
    fn payload_size(&self) -> usize {
        self.len()
    }
}

impl Payload for Vec<u8> {
    fn payload_size(&self) -> usize {
        self.len()
    }
}

impl<P: Payload + ?Sized> Payload for &P {
    fn payload_size(&self) -> usize {
        (**self).payload_size()
    }
}

impl<P: Payload + ?Sized> Payload for Box<P> {
    fn payload_size(&self) -> usize {
        (**self).payload_size()
    }
}

pub struct PerfStage {
    name: String,
    config: RwLock<PerfConfig>,
    clock: Box<dyn Clock>,
    sink: Box<dyn ReportSink>,
    accumulator: Arc<SampleAccumulator>,
    bitrate: Arc<BitrateCells>,
    engine: Mutex<ReportEngine>,
    timer: Mutex<Option<BitrateTimer>>,
    running: AtomicBool,
}

impl std::fmt::Debug for PerfStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerfStage")
            .field("name", &self.name)
            .field("config", &self.config())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl PerfStage {
    /// Creates a stopped stage. Fails if `config` does not validate.
    pub fn try_new(
        name: impl Into<String>,
        config: PerfConfig,
        sink: impl ReportSink + 'static,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            name: name.into(),
            config: RwLock::new(config),
            clock: Box::new(MonotonicClock),
            sink: Box::new(sink),
            accumulator: Arc::new(SampleAccumulator::new()),
            bitrate: Arc::new(BitrateCells::default()),
            engine: Mutex::new(ReportEngine::default()),
            timer: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_cpu_source(mut self, source: Box<dyn CpuTicksSource>) -> Self {
        self.engine
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .set_cpu_sampler(CpuLoadSampler::new(source));
        self
    }

    pub fn with_gpu_source(mut self, source: Box<dyn GpuStatsSource>) -> Self {
        self.engine
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .set_gpu_sampler(GpuStatsSampler::new(source));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> PerfConfig {
        *self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the configuration. Flags take effect on the next report; the
    /// bitrate interval and window size on the next start.
    pub fn set_config(&self, config: PerfConfig) -> Result<()> {
        config.validate()?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Clears all counters and starts the bitrate timer.
    #[instrument(level = "debug", skip(self), fields(stage = %self.name))]
    pub fn start(&self) -> Result<()> {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if timer.is_some() {
            return Err(PerfError::AlreadyRunning(self.name.clone()));
        }

        self.clear();

        let config = self.config();
        let state = BitrateState::try_new(config.bitrate_interval_ms, config.bitrate_window_size)
            .inspect_err(|error| error!("Unable to start {:?}: {error}", self.name))?;

        *timer = Some(BitrateTimer::spawn(
            &self.name,
            state,
            self.accumulator.clone(),
            self.bitrate.clone(),
        )?);
        self.running.store(true, Ordering::Release);

        debug!("Started with {config:?}");
        Ok(())
    }

    /// Cancels the bitrate timer, waiting for an in-flight firing, then clears
    /// all counters. Stopping a stopped stage does nothing. The timer lock is
    /// held throughout, so a concurrent [`PerfStage::start`] runs either before
    /// or after the whole stop.
    #[instrument(level = "debug", skip(self), fields(stage = %self.name))]
    pub fn stop(&self) {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(running) = timer.take() else {
            return;
        };

        self.running.store(false, Ordering::Release);
        running.cancel();
        self.clear();
        drop(timer);

        debug!("Stopped");
    }

    /// Observes `buffer` and hands it back untouched.
    #[inline]
    pub fn transform<P: Payload>(&self, buffer: P) -> P {
        self.on_buffer(buffer.payload_size());
        buffer
    }

    /// Observes one buffer of `size` bytes. Buffers seen while the stage is
    /// stopped are not measured.
    pub fn on_buffer(&self, size: usize) {
        if !self.is_running() {
            return;
        }

        let now = self.clock.now();

        let report = {
            let mut engine = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
            engine.is_due(now).then(|| {
                let flags = self.report_flags();
                let report =
                    engine.report(&self.name, now, &self.accumulator, &self.bitrate, flags);
                (report, flags)
            })
        };

        if let Some((report, flags)) = report {
            self.emit(&report, flags);
        }

        self.accumulator.increment_frame();
        self.accumulator.add_bytes(size as u64);
    }

    /// Latest `(instant, average)` bitrate published by the timer.
    pub fn bitrate(&self) -> (f64, f64) {
        (self.bitrate.instant(), self.bitrate.average())
    }

    pub fn pending_frames(&self) -> u32 {
        self.accumulator.frames()
    }

    pub fn pending_bytes(&self) -> u64 {
        self.accumulator.bytes()
    }

    pub fn reports(&self) -> u64 {
        self.engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reports()
    }

    fn report_flags(&self) -> ReportFlags {
        let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
        ReportFlags {
            print_cpu_load: config.print_cpu_load,
            gpu_stats_enabled: config.gpu_stats_enabled,
        }
    }

    fn emit(&self, report: &PerfReport, flags: ReportFlags) {
        let text = report.info_message(flags.print_cpu_load);

        self.sink.on_message(report, &text);
        self.sink.on_stats(report);

        info!("{text}");
    }

    fn clear(&self) {
        self.accumulator.clear();
        self.bitrate.clear();
        self.engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Drop for PerfStage {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tracing_test::traced_test;

    use super::*;
    use crate::stats::{
        clock::ManualClock,
        cpu::CpuTicks,
        gpu::GpuStats,
    };

    #[derive(Default)]
    struct Capture {
        messages: Mutex<Vec<String>>,
        reports: Mutex<Vec<PerfReport>>,
    }

    impl Capture {
        fn messages(&self) -> Vec<String> {
            self.messages.lock().unwrap().clone()
        }

        fn reports(&self) -> Vec<PerfReport> {
            self.reports.lock().unwrap().clone()
        }
    }

    impl ReportSink for Capture {
        fn on_message(&self, _report: &PerfReport, text: &str) {
            self.messages.lock().unwrap().push(text.to_string());
        }

        fn on_stats(&self, report: &PerfReport) {
            self.reports.lock().unwrap().push(report.clone());
        }
    }

    struct FailingTicks;

    impl CpuTicksSource for FailingTicks {
        fn read_ticks(&mut self) -> Result<Option<CpuTicks>> {
            Err(PerfError::CpuStatParse("unreadable".to_string()))
        }
    }

    struct FirstThenFail(Option<GpuStats>);

    impl GpuStatsSource for FirstThenFail {
        fn query(&mut self) -> Result<GpuStats> {
            self.0
                .take()
                .ok_or_else(|| PerfError::GpuStatsParse("no output".to_string()))
        }
    }

    fn stage(config: PerfConfig) -> (PerfStage, Arc<Capture>, Arc<ManualClock>) {
        let capture = Arc::new(Capture::default());
        let clock = Arc::new(ManualClock::new(Duration::ZERO));
        let stage = PerfStage::try_new("perf0", config, capture.clone())
            .unwrap()
            .with_clock(clock.clone())
            .with_cpu_source(Box::new(FailingTicks));
        (stage, capture, clock)
    }

    #[test]
    fn buffers_pass_through_unchanged() {
        let (stage, _, _) = stage(PerfConfig::default());
        stage.start().unwrap();

        let buffer = vec![1u8, 2, 3, 4];
        let out = stage.transform(buffer.clone());
        assert_eq!(out, buffer);

        let slice: &[u8] = &[9, 9];
        assert_eq!(stage.transform(slice), slice);
        assert_eq!(stage.pending_bytes(), 6);
        assert_eq!(stage.pending_frames(), 2);
    }

    #[test]
    fn stopped_stage_does_not_measure() {
        let (stage, capture, _) = stage(PerfConfig::default());

        stage.on_buffer(100);
        assert_eq!(stage.pending_frames(), 0);
        assert_eq!(stage.pending_bytes(), 0);
        assert!(capture.reports().is_empty());
    }

    #[test]
    fn reports_once_per_period() {
        let (stage, capture, clock) = stage(PerfConfig::default());
        stage.start().unwrap();

        // Opening report on the very first buffer.
        stage.on_buffer(10);
        assert_eq!(capture.reports().len(), 1);
        assert_eq!(capture.reports()[0].fps, 0.0);

        for _ in 0..4 {
            clock.advance(Duration::from_millis(500));
            stage.on_buffer(10);
        }
        // Reports at 1.0s and 2.0s.
        let reports = capture.reports();
        assert_eq!(reports.len(), 3);
        assert_eq!(reports[1].timestamp, Duration::from_secs(1));
        assert_eq!(reports[1].fps, 2.0);
        assert_eq!(reports[2].fps, 2.0);
        assert_eq!(reports[2].fps_average, 2.0);
        assert_eq!(stage.reports(), 3);
    }

    #[test]
    fn stalled_stream_yields_a_single_long_period() {
        let (stage, capture, clock) = stage(PerfConfig::default());
        stage.start().unwrap();

        stage.on_buffer(10);
        for _ in 0..4 {
            stage.on_buffer(10);
        }
        clock.set(Duration::from_millis(2500));
        stage.on_buffer(10);

        let reports = capture.reports();
        assert_eq!(reports.len(), 2);
        // The opening buffer plus four more, over 2.5 seconds.
        assert_eq!(reports[1].fps, 2.0);
        assert_eq!(stage.pending_frames(), 1);
    }

    #[test]
    fn start_twice_is_rejected() {
        let (stage, _, _) = stage(PerfConfig::default());
        stage.start().unwrap();
        assert!(matches!(stage.start(), Err(PerfError::AlreadyRunning(name)) if name == "perf0"));
        assert!(stage.is_running());
    }

    #[test]
    fn restart_clears_all_counters() {
        let (stage, capture, clock) = stage(PerfConfig::default());
        stage.start().unwrap();
        stage.on_buffer(10);
        clock.advance(Duration::from_secs(1));
        stage.on_buffer(10);
        stage.on_buffer(10);
        assert_eq!(stage.reports(), 2);

        stage.stop();
        assert!(!stage.is_running());
        assert_eq!(stage.reports(), 0);
        assert_eq!(stage.pending_frames(), 0);
        assert_eq!(stage.pending_bytes(), 0);
        assert_eq!(stage.bitrate(), (0.0, 0.0));

        // Stopping again is a no-op.
        stage.stop();

        stage.start().unwrap();
        clock.advance(Duration::from_secs(10));
        stage.on_buffer(10);
        let last = capture.reports().pop().unwrap();
        assert_eq!(last.fps, 0.0);
        assert_eq!(last.fps_average, 0.0);
        assert_eq!(stage.reports(), 1);
    }

    #[test]
    fn concurrent_start_and_stop_keep_a_consistent_state() {
        let (stage, _, _) = stage(PerfConfig::default());
        let stage = Arc::new(stage);

        let workers = (0..4)
            .map(|_| {
                let stage = stage.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let _ = stage.start();
                        stage.on_buffer(10);
                        stage.stop();
                    }
                })
            })
            .collect::<Vec<_>>();
        for worker in workers {
            worker.join().unwrap();
        }

        assert!(!stage.is_running());

        // A stop racing a start must never leave a timer behind.
        stage.start().unwrap();
        assert!(stage.is_running());
        assert_eq!(stage.pending_bytes(), 0);
        stage.stop();
        assert!(!stage.is_running());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = PerfConfig {
            bitrate_interval_ms: 0,
            ..Default::default()
        };
        assert!(matches!(
            PerfStage::try_new("perf0", config, Capture::default()),
            Err(PerfError::InvalidConfig(_))
        ));

        let (stage, _, _) = stage(PerfConfig::default());
        assert!(stage.set_config(config).is_err());
        assert_eq!(stage.config(), PerfConfig::default());
    }

    #[traced_test]
    #[test]
    fn unreadable_cpu_load_is_reported_as_unknown() {
        let (stage, capture, _) = stage(PerfConfig {
            print_cpu_load: true,
            ..Default::default()
        });
        stage.start().unwrap();
        stage.on_buffer(10);

        assert_eq!(capture.reports()[0].cpu_load, None);
        assert!(capture.messages()[0].ends_with("; cpu: -1; "));
        assert!(logs_contain("Failed to get the CPU load"));
        assert!(logs_contain("perf: perf0; timestamp: 0:00:00.000000000"));
    }

    #[test]
    fn flags_take_effect_on_the_next_report() {
        let (stage, capture, clock) = stage(PerfConfig::default());
        stage.start().unwrap();
        stage.on_buffer(10);
        assert!(!capture.messages()[0].contains("cpu:"));

        stage
            .set_config(PerfConfig {
                print_cpu_load: true,
                ..Default::default()
            })
            .unwrap();
        clock.advance(Duration::from_secs(1));
        stage.on_buffer(10);
        assert!(capture.messages()[1].contains("cpu: -1"));
    }

    #[test]
    fn gpu_stats_survive_a_failed_query() {
        let stats = GpuStats {
            encoder_utilization: 40,
            session_count: 2,
            average_fps: 30,
            average_latency: 900,
            gpu_utilization: 55,
            memory_used: 1024,
            memory_free: 3072,
        };
        let (stage, capture, clock) = stage(PerfConfig {
            gpu_stats_enabled: true,
            ..Default::default()
        });
        let stage = stage.with_gpu_source(Box::new(FirstThenFail(Some(stats))));
        stage.start().unwrap();

        stage.on_buffer(10);
        clock.advance(Duration::from_secs(1));
        stage.on_buffer(10);

        let reports = capture.reports();
        assert_eq!(reports[0].gpu, stats);
        assert_eq!(reports[1].gpu, stats);
    }
}
