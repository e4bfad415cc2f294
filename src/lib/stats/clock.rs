use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

lazy_static! {
    static ref CLOCK_ORIGIN: Instant = Instant::now();
}

/// Monotonic time source used by the report engine.
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary, fixed origin.
    fn now(&self) -> Duration;
}

/// The system monotonic clock, measured from the first time any
/// `MonotonicClock` was read in this process.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        CLOCK_ORIGIN.elapsed()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Duration) -> Self {
        Self {
            nanos: AtomicU64::new(start.as_nanos() as u64),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::AcqRel);
    }

    pub fn set(&self, to: Duration) {
        self.nanos.store(to.as_nanos() as u64, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Acquire))
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now(&self) -> Duration {
        (**self).now()
    }
}

/// Formats a clock time as `h:mm:ss.nnnnnnnnn`, the way GStreamer prints
/// clock times.
pub fn format_clock_time(time: Duration) -> String {
    let seconds = time.as_secs();
    format!(
        "{}:{:02}:{:02}.{:09}",
        seconds / 3600,
        (seconds / 60) % 60,
        seconds % 60,
        time.subsec_nanos()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_time_format() {
        assert_eq!(format_clock_time(Duration::ZERO), "0:00:00.000000000");
        assert_eq!(
            format_clock_time(Duration::new(3 * 3600 + 25 * 60 + 7, 120_000_001)),
            "3:25:07.120000001"
        );
        assert_eq!(
            format_clock_time(Duration::from_secs(100 * 3600)),
            "100:00:00.000000000"
        );
    }

    #[test]
    fn manual_clock_moves_only_when_advanced() {
        let clock = ManualClock::new(Duration::from_secs(10));
        assert_eq!(clock.now(), Duration::from_secs(10));
        clock.advance(Duration::from_millis(2500));
        assert_eq!(clock.now(), Duration::from_millis(12_500));
        clock.set(Duration::from_secs(1));
        assert_eq!(clock.now(), Duration::from_secs(1));
    }

    #[test]
    fn monotonic_clock_never_goes_back() {
        let clock = MonotonicClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
