//! Fractional Kelly sizing for binary contracts

/// Stake in USDC. `b = (1 - p_market) / p_market`, `f* = (p·b - q) / b`,
/// then `clamp(f* · fraction · capital, 0, max_fraction · capital)`.
pub fn kelly_size(
    p_model: f64,
    p_market: f64,
    capital: f64,
    kelly_fraction: f64,
    max_position_fraction: f64,
) -> f64 {
    if !(p_model > 0.0 && p_model < 1.0 && p_market > 0.0 && p_market < 1.0) || capital <= 0.0 {
        return 0.0;
    }
    let b = (1.0 - p_market) / p_market;
    let f_star = (p_model * b - (1.0 - p_model)) / b;
    if f_star <= 0.0 {
        return 0.0;
    }
    let cap = max_position_fraction * capital;
    let size = ((f_star * kelly_fraction * capital * 100.0).round() / 100.0).max(0.0);
    size.min(cap)
}

/// A sized directional entry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntrySize {
    pub usd: f64,
    pub shares: f64,
    pub price: f64,
}

/// Convert a Kelly stake into shares at `price`. Anything under either
/// floor is no trade.
pub fn size_entry(stake_usd: f64, price: f64, min_shares: f64, min_usd: f64) -> Option<EntrySize> {
    if price <= 0.0 || stake_usd < min_usd {
        return None;
    }
    let shares = ((stake_usd / price) * 10.0).floor() / 10.0;
    if shares < min_shares {
        return None;
    }
    Some(EntrySize {
        usd: shares * price,
        shares,
        price,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quarter_kelly_with_cap() {
        // b = 1, f* = 0.20, quarter Kelly = 0.05 -> $50, cap 5% = $50
        let size = kelly_size(0.60, 0.50, 1000.0, 0.25, 0.05);
        assert!((size - 50.0).abs() < 1e-9, "size {}", size);

        // Half Kelly would be $100, capped at $50
        let capped = kelly_size(0.60, 0.50, 1000.0, 0.50, 0.05);
        assert!((capped - 50.0).abs() < 1e-9);
    }

    #[test]
    fn cent_rounding_never_exceeds_cap() {
        // Cap is $61.72835; rounding the capped stake to cents would give $61.73
        let capital = 1234.567;
        let size = kelly_size(0.80, 0.50, capital, 0.50, 0.05);
        assert!(size <= 0.05 * capital, "size {} above cap", size);
        assert!((size - 0.05 * capital).abs() < 1e-9);
    }

    #[test]
    fn no_edge_no_stake() {
        assert_eq!(kelly_size(0.50, 0.50, 1000.0, 0.25, 0.05), 0.0);
        assert_eq!(kelly_size(0.40, 0.50, 1000.0, 0.25, 0.05), 0.0);
        assert_eq!(kelly_size(0.60, 0.0, 1000.0, 0.25, 0.05), 0.0);
        assert_eq!(kelly_size(0.60, 0.50, 0.0, 0.25, 0.05), 0.0);
    }

    #[test]
    fn below_floor_is_no_trade() {
        assert!(size_entry(2.0, 0.50, 5.0, 1.0).is_none());
        assert!(size_entry(0.5, 0.05, 5.0, 1.0).is_none());
        let entry = size_entry(10.0, 0.40, 5.0, 1.0).unwrap();
        assert!((entry.shares - 25.0).abs() < 1e-9);
        assert!(entry.usd <= 10.0 + 1e-9);
    }
}
