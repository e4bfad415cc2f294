use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use atomic_float::AtomicF64;

/// Byte and frame counters fed by the buffer path.
///
/// Bytes are drained by the bitrate timer thread and frames by the report
/// engine. Both drains are a single atomic swap, so increments racing with a
/// drain land either in the drained value or in the next period.
#[derive(Debug, Default)]
pub struct SampleAccumulator {
    bytes: AtomicU64,
    frames: AtomicU32,
}

impl SampleAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add_bytes(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Returns the bytes accumulated since the previous drain and resets the
    /// counter to zero.
    #[inline]
    pub fn drain_bytes(&self) -> u64 {
        self.bytes.swap(0, Ordering::AcqRel)
    }

    #[inline]
    pub fn increment_frame(&self) {
        self.frames.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn drain_frames(&self) -> u32 {
        self.frames.swap(0, Ordering::AcqRel)
    }

    pub fn frames(&self) -> u32 {
        self.frames.load(Ordering::Acquire)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.bytes.store(0, Ordering::Release);
        self.frames.store(0, Ordering::Release);
    }
}

/// Latest bitrate values published by the timer thread.
///
/// Each value is individually atomic; a reader may see the instant value of
/// one firing together with the average of the previous one.
#[derive(Debug, Default)]
pub struct BitrateCells {
    instant: AtomicF64,
    average: AtomicF64,
}

impl BitrateCells {
    pub fn publish(&self, instant: f64, average: f64) {
        self.average.store(average, Ordering::Release);
        self.instant.store(instant, Ordering::Release);
    }

    pub fn instant(&self) -> f64 {
        self.instant.load(Ordering::Acquire)
    }

    pub fn average(&self) -> f64 {
        self.average.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.publish(0.0, 0.0);
    }
}
