//! Progress fraction rules shared by job bodies and the scheduler.

use std::time::Duration;

/// Ceiling for timer-driven estimates. Only a finished job reaches 100%.
pub const ESTIMATE_CEILING: f64 = 0.99;

/// Convert a fraction in `[0, 1]` into a whole percentage.
///
/// Returns `None` for values outside the range (including NaN) so callers
/// can keep the previously reported value.
pub fn fraction_to_percent(fraction: f64) -> Option<i16> {
    if !(0.0..=1.0).contains(&fraction) {
        return None;
    }
    Some((fraction * 100.0).floor() as i16)
}

/// Estimated completion fraction after `elapsed` of an `estimated` run.
///
/// Grows linearly and is capped at [`ESTIMATE_CEILING`]. A zero estimate
/// yields the ceiling immediately.
pub fn estimated_fraction(elapsed: Duration, estimated: Duration) -> f64 {
    if estimated.is_zero() {
        return ESTIMATE_CEILING;
    }
    (elapsed.as_secs_f64() / estimated.as_secs_f64()).min(ESTIMATE_CEILING)
}
