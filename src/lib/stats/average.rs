//! Running mean helpers shared by the fps and bitrate paths.

/// Cumulative mean after folding `current` into `old`, where `count` is the
/// number of samples the new mean covers. Returns 0 when `count` is 0.
pub fn cumulative_average(count: u64, current: f64, old: f64) -> f64 {
    if count == 0 {
        return 0.0;
    }

    ((count - 1) as f64 * old + current) / count as f64
}

/// Fixed-window mean update.
///
/// `evicted_sample` must be the value currently stored in the slot that
/// `new_sample` is about to overwrite. Returns 0 when `window_size` is 0.
pub fn moving_average(
    window_size: u64,
    old_average: f64,
    new_sample: f64,
    evicted_sample: f64,
) -> f64 {
    if window_size == 0 {
        return 0.0;
    }

    let window_size = window_size as f64;
    (old_average * window_size - evicted_sample + new_sample) / window_size
}
