//! Avellaneda-Stoikov quoting
//!
//! ```text
//! gamma       = gamma_base * (1 + alpha * |q|)
//! reservation = mid - q * gamma * sigma^2 * T
//! spread      = gamma * sigma^2 * T + (2 / gamma) * ln(1 + gamma / kappa)
//! ```
//!
//! `q` is net inventory over capacity, `sigma` the tracked vol in price units
//! and `T` the time to resolution normalized to `[0, 1]`.

use super::{finalize_pair, PriceQuote, PricingInputs, QuoteModel};
use crate::config::PricingConfig;

#[derive(Debug, Clone)]
pub struct AvellanedaStoikovModel {
    gamma_base: f64,
    gamma_alpha: f64,
    max_t_days: f64,
    min_spread_pts: f64,
    max_spread_pts: f64,
}

pub fn dynamic_gamma(gamma_base: f64, alpha: f64, inventory_ratio: f64) -> f64 {
    gamma_base * (1.0 + alpha * inventory_ratio.abs())
}

pub fn reservation_price(mid: f64, inventory_ratio: f64, gamma: f64, sigma: f64, t: f64) -> f64 {
    mid - inventory_ratio * gamma * sigma * sigma * t
}

/// Optimal full spread in price units
pub fn optimal_spread(gamma: f64, sigma: f64, t: f64, kappa: f64) -> f64 {
    if gamma <= 0.0 || kappa <= 0.0 {
        return 0.02;
    }
    gamma * sigma * sigma * t + (2.0 / gamma) * (1.0 + gamma / kappa).ln()
}

/// Days to resolution as `T` in `[0, 1]`; 0.01 once expired
pub fn time_remaining(days_to_resolution: f64, max_t_days: f64) -> f64 {
    if days_to_resolution <= 0.0 {
        return 0.01;
    }
    (days_to_resolution / max_t_days.max(f64::EPSILON)).min(1.0)
}

impl AvellanedaStoikovModel {
    pub fn new(cfg: &PricingConfig) -> Self {
        Self {
            gamma_base: cfg.as_gamma_base,
            gamma_alpha: cfg.as_gamma_alpha,
            max_t_days: cfg.as_max_t_days,
            min_spread_pts: cfg.as_min_spread_pts,
            max_spread_pts: cfg.as_max_spread_pts,
        }
    }
}

impl QuoteModel for AvellanedaStoikovModel {
    fn name(&self) -> &'static str {
        "avellaneda_stoikov"
    }

    fn price(&self, inputs: &PricingInputs) -> PriceQuote {
        let q = if inputs.max_inventory > 0.0 {
            inputs.net_inventory / inputs.max_inventory
        } else {
            0.0
        };
        let gamma = dynamic_gamma(self.gamma_base, self.gamma_alpha, q);
        let sigma = inputs.vol_pts / 100.0;
        let t = time_remaining(inputs.days_to_resolution, self.max_t_days);

        let reservation = reservation_price(inputs.mid, q, gamma, sigma, t);
        let spread_pts = (optimal_spread(gamma, sigma, t, inputs.kappa) * 100.0)
            .clamp(self.min_spread_pts, self.max_spread_pts);
        let half = spread_pts / 200.0;

        let bid = reservation - half;
        let mut ask = reservation + half;
        // Never offer inventory below what it cost
        if inputs.avg_entry > 0.0 && inputs.net_inventory > 0.0 {
            ask = ask.max(inputs.avg_entry + inputs.tick);
        }
        let (bid, ask) = finalize_pair(bid, ask, inputs.mid, inputs.tick);

        PriceQuote {
            bid,
            ask,
            mid: inputs.mid,
            reservation,
            half_spread_pts: spread_pts / 2.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_inputs(net: f64, avg_entry: f64) -> PricingInputs {
        PricingInputs {
            mid: 0.50,
            imbalance: 0.0,
            vol_pts: 2.0,
            staleness: 0.0,
            kappa: 1.5,
            net_inventory: net,
            max_inventory: 50.0,
            avg_entry,
            days_to_resolution: 30.0,
            tick: 0.01,
        }
    }

    #[test]
    fn spread_grows_with_volatility() {
        let low = optimal_spread(0.1, 0.02, 1.0, 1.5);
        let high = optimal_spread(0.1, 0.10, 1.0, 1.5);
        assert!(high > low);
        assert_eq!(optimal_spread(0.0, 0.05, 1.0, 1.5), 0.02);
    }

    #[test]
    fn time_remaining_is_normalized() {
        assert_eq!(time_remaining(60.0, 30.0), 1.0);
        assert!((time_remaining(15.0, 30.0) - 0.5).abs() < 1e-12);
        assert_eq!(time_remaining(0.0, 30.0), 0.01);
        assert_eq!(time_remaining(-3.0, 30.0), 0.01);
    }

    #[test]
    fn gamma_scales_with_inventory() {
        assert!((dynamic_gamma(0.1, 0.5, 0.0) - 0.1).abs() < 1e-12);
        assert!((dynamic_gamma(0.1, 0.5, -1.0) - 0.15).abs() < 1e-12);
    }

    #[test]
    fn spread_is_clamped_to_configured_bounds() {
        let model = AvellanedaStoikovModel::new(&PricingConfig::default());
        // Arrival term with gamma 0.1, kappa 1.5 is ~129 points, so the max applies
        let quote = model.price(&make_inputs(0.0, 0.0));
        assert!((quote.half_spread_pts - 6.0).abs() < 1e-9);
        assert!(quote.bid < quote.ask);
        assert!(((quote.ask - quote.bid) * 100.0 - 12.0).abs() < 1.0 + 1e-9);
    }

    #[test]
    fn long_inventory_never_sells_below_entry() {
        let model = AvellanedaStoikovModel::new(&PricingConfig::default());
        let quote = model.price(&make_inputs(40.0, 0.60));
        assert!(quote.ask >= 0.61 - 1e-9, "ask {}", quote.ask);
        assert!(quote.reservation < 0.50);
    }
}
