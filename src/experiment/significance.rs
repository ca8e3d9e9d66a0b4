//! Two-proportion z-test for A/B conversion data
//!
//! **Score**: `100 * (1 - p)` where `p` is the two-sided p-value of the
//! pooled two-proportion z-test, clamped to `[0, 100]`.
//!
//! **Undefined cases** (score 0, not an error):
//! - either arm has no participants
//! - pooled rate is 0 or 1 (zero standard error)
//!
//! References:
//! - Abramowitz & Stegun 7.1.26 for `erf` (|error| < 1.5e-7)

use super::VariantKey;

/// Conventional confidence required before a winner is declared.
pub const DEFAULT_THRESHOLD: f64 = 95.0;

/// `conversions / participants`, 0 for an empty arm.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rate(conversions: u64, participants: u64) -> f64 {
    if participants == 0 {
        0.0
    } else {
        conversions as f64 / participants as f64
    }
}

/// Pooled two-proportion z statistic (B relative to A).
///
/// Returns `None` when the test is undefined.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn z_score(participants_a: u64, conversions_a: u64, participants_b: u64, conversions_b: u64) -> Option<f64> {
    if participants_a == 0 || participants_b == 0 {
        return None;
    }
    let n_a = participants_a as f64;
    let n_b = participants_b as f64;
    let pooled = (conversions_a + conversions_b) as f64 / (n_a + n_b);
    let std_err = (pooled * (1.0 - pooled) * (1.0 / n_a + 1.0 / n_b)).sqrt();
    if !std_err.is_finite() || std_err <= 0.0 {
        return None;
    }

    let z = (rate(conversions_b, participants_b) - rate(conversions_a, participants_a)) / std_err;
    z.is_finite().then_some(z)
}

/// Confidence score in `[0, 100]`.
#[must_use]
pub fn significance(participants_a: u64, conversions_a: u64, participants_b: u64, conversions_b: u64) -> f64 {
    z_score(participants_a, conversions_a, participants_b, conversions_b).map_or(0.0, |z| {
        let p_value = 2.0 * (1.0 - normal_cdf(z.abs()));
        (100.0 * (1.0 - p_value)).clamp(0.0, 100.0)
    })
}

/// Winner, only when `significance >= threshold` and the rates differ.
#[must_use]
pub fn winner(rate_a: f64, rate_b: f64, significance: f64, threshold: f64) -> Option<VariantKey> {
    if significance < threshold {
        return None;
    }
    if rate_b > rate_a {
        Some(VariantKey::B)
    } else if rate_a > rate_b {
        Some(VariantKey::A)
    } else {
        None
    }
}

/// Standard normal CDF.
#[must_use]
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

fn erf(x: f64) -> f64 {
    const A1: f64 = 0.254_829_592;
    const A2: f64 = -0.284_496_736;
    const A3: f64 = 1.421_413_741;
    const A4: f64 = -1.453_152_027;
    const A5: f64 = 1.061_405_429;
    const P: f64 = 0.327_591_1;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let poly = ((((A5 * t + A4) * t + A3) * t + A2) * t + A1) * t;
    sign * (1.0 - poly * (-x * x).exp())
}
