//! Wall-clock driven bitrate measurement.
//!
//! The buffer path only adds bytes to the [`SampleAccumulator`]. A dedicated
//! thread drains it every `interval` and folds the resulting bits per second
//! into either a cumulative mean or, when a window size is configured, a
//! fixed-window moving mean. The window is indexed by the number of timer
//! firings, not by elapsed time.

use std::{
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use tracing::*;

use super::{
    accumulator::{BitrateCells, SampleAccumulator},
    average::{cumulative_average, moving_average},
};
use crate::error::{PerfError, Result};

const BITS_PER_BYTE: f64 = 8.0;
const MS_PER_S: f64 = 1000.0;

/// State owned by the timer thread for the duration of a run.
#[derive(Debug)]
pub struct BitrateState {
    interval_ms: u32,
    window: Option<Box<[f64]>>,
    average: f64,
    firings: u64,
}

impl BitrateState {
    /// Creates the state for a run, reserving the window buffer up front.
    pub fn try_new(interval_ms: u32, window_size: u32) -> Result<Self> {
        let window = match window_size {
            0 => None,
            size => {
                let size = size as usize;
                let mut window = Vec::new();
                window
                    .try_reserve_exact(size)
                    .map_err(|_| PerfError::WindowAllocation(size))?;
                window.resize(size, 0.0);
                Some(window.into_boxed_slice())
            }
        };

        Ok(Self {
            interval_ms,
            window,
            average: 0.0,
            firings: 0,
        })
    }

    pub fn has_window(&self) -> bool {
        self.window.is_some()
    }

    pub fn window_len(&self) -> usize {
        self.window.as_ref().map_or(0, |window| window.len())
    }

    pub fn firings(&self) -> u64 {
        self.firings
    }

    pub fn average(&self) -> f64 {
        self.average
    }

    /// Folds `bytes` collected over one interval into the running average.
    ///
    /// Returns `(bits_per_second, average)`, or `None` when the interval is
    /// zero and the cycle has to be skipped.
    pub fn update(&mut self, bytes: u64) -> Option<(f64, f64)> {
        if self.interval_ms == 0 {
            return None;
        }

        let bits_per_second = bytes as f64 * BITS_PER_BYTE / (self.interval_ms as f64 / MS_PER_S);

        self.average = match self.window.as_mut() {
            None => cumulative_average(self.firings + 1, bits_per_second, self.average),
            Some(window) => {
                // The slot for the newest sample is the one holding the oldest.
                let index = (self.firings % window.len() as u64) as usize;
                let average = moving_average(
                    window.len() as u64,
                    self.average,
                    bits_per_second,
                    window[index],
                );
                window[index] = bits_per_second;
                average
            }
        };

        self.firings += 1;

        Some((bits_per_second, self.average))
    }

    /// Runs one timer firing: drain, compute, publish.
    pub fn fire(&mut self, accumulator: &SampleAccumulator, cells: &BitrateCells) {
        let bytes = accumulator.drain_bytes();
        let Some((bits_per_second, average)) = self.update(bytes) else {
            trace!("Skipping bitrate cycle with a zero interval");
            return;
        };
        cells.publish(bits_per_second, average);
        trace!("bytes: {bytes}, bps: {bits_per_second:.3}, mean_bps: {average:.3}");
    }
}

/// Handle to the running bitrate thread. Cancelling joins the thread, so no
/// firing can happen after [`BitrateTimer::cancel`] returns.
#[derive(Debug)]
pub struct BitrateTimer {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl BitrateTimer {
    #[instrument(level = "debug", skip(state, accumulator, cells))]
    pub fn spawn(
        name: &str,
        mut state: BitrateState,
        accumulator: Arc<SampleAccumulator>,
        cells: Arc<BitrateCells>,
    ) -> Result<Self> {
        if state.interval_ms == 0 {
            return Err(PerfError::InvalidConfig(
                "bitrate interval must be greater than zero".to_string(),
            ));
        }

        let interval = Duration::from_millis(state.interval_ms as u64);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let span = span!(Level::DEBUG, "bitrate timer", stage = name);

        let handle = std::thread::Builder::new()
            .name(format!("{name}-bitrate"))
            .spawn(move || {
                let _span = span.enter();
                debug!("Bitrate timer started with an interval of {interval:?}");

                let mut deadline = Instant::now() + interval;
                loop {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    match stop_rx.recv_timeout(timeout) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }

                    state.fire(&accumulator, &cells);

                    deadline += interval;
                    let now = Instant::now();
                    if deadline < now {
                        warn!("Bitrate timer fell behind by {:?}", now - deadline);
                        deadline = now + interval;
                    }
                }

                debug!("Bitrate timer stopped after {} firings", state.firings);
            })
            .map_err(PerfError::TimerSpawn)?;

        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn cancel(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Bitrate timer thread panicked");
            }
        }
    }
}

impl Drop for BitrateTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
