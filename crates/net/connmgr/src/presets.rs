//! Canonical decay and bump functions.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::decay::{BumpFn, DecayFn};

/// Applies no decay; the value never changes and is never removed.
pub fn no_decay() -> DecayFn {
    Arc::new(|value| (value.value, false))
}

/// Subtracts `minuend` on every visit, removing the tag when the result
/// reaches zero or below.
pub fn fixed_decay(minuend: i64) -> DecayFn {
    Arc::new(move |value| {
        let after = value.value - minuend;
        (after, after <= 0)
    })
}

/// Multiplies the value by `coef` on every visit, rounding down. Removes the
/// tag when the result reaches zero or below.
pub fn linear_decay(coef: f64) -> DecayFn {
    Arc::new(move |value| {
        let after = (value.value as f64 * coef).floor() as i64;
        (after, after <= 0)
    })
}

/// Expires the tag once it has gone `after` without a bump.
pub fn expire_when_inactive(after: Duration) -> DecayFn {
    Arc::new(move |value| {
        if Instant::now().saturating_duration_since(value.last_visit) >= after {
            (0, true)
        } else {
            (value.value, false)
        }
    })
}

/// Adds the incoming delta to the current value, unbounded.
pub fn sum_unbounded() -> BumpFn {
    Arc::new(|value, delta| value.value + delta)
}

/// Adds the incoming delta, clamping the result to `[min, max]`.
pub fn sum_bounded(min: i64, max: i64) -> BumpFn {
    Arc::new(move |value, delta| (value.value + delta).clamp(min, max))
}

/// Replaces the current value with the incoming delta.
pub fn overwrite() -> BumpFn {
    Arc::new(|_, delta| delta)
}
