//! Money math.
//!
//! All monetary amounts are integer base units (satoshis); prices are
//! `f64`. Conversions between the two always round half away from zero.

/// Base units per whole coin.
pub const SATOSHI: i64 = 100_000_000;

/// Round half away from zero: `round_f64(2.5) == 3`, `round_f64(-2.5) == -3`.
pub fn round_f64(f: f64) -> i64 {
    if f >= 0.0 {
        (f + 0.5) as i64
    } else {
        (f - 0.5) as i64
    }
}

/// Round a non-negative float to unsigned base units.
///
/// Callers must not pass negative values; the conversion saturates at zero
/// rather than wrapping.
pub fn round_f64_unsigned(f: f64) -> u64 {
    if f <= 0.0 { 0 } else { (f + 0.5) as u64 }
}

/// Whole coins to base units.
pub fn coins_to_units(f: f64) -> i64 {
    round_f64(f * SATOSHI as f64)
}

/// Base units to whole coins.
pub fn units_to_coins(units: i64) -> f64 {
    units as f64 / SATOSHI as f64
}

/// Truncate a float to `sig` significant figures.
pub fn to_sig_figs(f: f64, sig: usize) -> f64 {
    if f == 0.0 || !f.is_finite() {
        return f;
    }
    let formatted = format!("{:.*e}", sig.saturating_sub(1), f);
    formatted.parse().unwrap_or(f)
}

/// Compare two floats at `sig` significant figures.
pub fn cmp_sig_figs(a: f64, b: f64, sig: usize) -> std::cmp::Ordering {
    let (a, b) = (to_sig_figs(a, sig), to_sig_figs(b, sig));
    a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn rounding_is_half_away_from_zero() {
        assert_eq!(round_f64(0.0), 0);
        assert_eq!(round_f64(2.4), 2);
        assert_eq!(round_f64(2.5), 3);
        assert_eq!(round_f64(-2.4), -2);
        assert_eq!(round_f64(-2.5), -3);
        assert_eq!(round_f64_unsigned(199.5), 200);
        assert_eq!(round_f64_unsigned(-1.0), 0);
    }

    #[test]
    fn unit_conversions() {
        assert_eq!(coins_to_units(1.0), SATOSHI);
        assert_eq!(coins_to_units(0.00000001), 1);
        assert_eq!(units_to_coins(SATOSHI / 2), 0.5);
    }

    #[test]
    fn sig_fig_compare() {
        assert_eq!(cmp_sig_figs(100.00001, 100.00002, 5), Ordering::Equal);
        assert_eq!(cmp_sig_figs(99.0, 102.0, 5), Ordering::Less);
        assert_eq!(to_sig_figs(123_456.0, 3), 123_000.0);
    }
}
