//! Heuristic half-spread model
//!
//! `delta` is built from volatility, book imbalance and staleness, all in
//! points, and clamped to `[delta_min, delta_max]`. Inventory shifts both
//! sides by a skew that is linear near zero and quadratic at the extremes.

use super::{finalize_pair, PriceQuote, PricingInputs, QuoteModel};
use crate::config::PricingConfig;

#[derive(Debug, Clone)]
pub struct LegacyModel {
    delta_min: f64,
    delta_max: f64,
    weight_vol: f64,
    weight_imbalance: f64,
    weight_stale: f64,
    weight_fee: f64,
    skew_factor: f64,
    quadratic_skew_factor: f64,
}

impl LegacyModel {
    pub fn new(cfg: &PricingConfig) -> Self {
        Self {
            delta_min: cfg.delta_min_pts,
            delta_max: cfg.delta_max_pts,
            weight_vol: cfg.weight_vol,
            weight_imbalance: cfg.weight_imbalance,
            weight_stale: cfg.weight_stale,
            weight_fee: cfg.weight_fee,
            skew_factor: cfg.skew_factor,
            quadratic_skew_factor: cfg.quadratic_skew_factor,
        }
    }

    /// Half-spread in points
    pub fn delta(&self, vol_pts: f64, imbalance: f64, staleness: f64) -> f64 {
        let raw = self.weight_vol * vol_pts
            + self.weight_imbalance * imbalance.abs() * 10.0
            + self.weight_stale * staleness * 5.0
            + self.weight_fee * 1.0;
        raw.clamp(self.delta_min, self.delta_max)
    }

    /// Quote shift in points; negative when long
    pub fn skew(&self, net_inventory: f64, max_inventory: f64) -> f64 {
        if max_inventory <= 0.0 {
            return 0.0;
        }
        let ratio = (net_inventory / max_inventory).clamp(-1.0, 1.0);
        let linear = -ratio * self.skew_factor;
        let sign = if ratio > 0.0 { -1.0 } else { 1.0 };
        linear + sign * ratio * ratio * self.quadratic_skew_factor
    }
}

impl QuoteModel for LegacyModel {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn price(&self, inputs: &PricingInputs) -> PriceQuote {
        let delta = self.delta(inputs.vol_pts, inputs.imbalance, inputs.staleness);
        let skew = self.skew(inputs.net_inventory, inputs.max_inventory);

        let reservation = inputs.mid + skew / 100.0;
        let bid = reservation - delta / 100.0;
        let ask = reservation + delta / 100.0;
        let (bid, ask) = finalize_pair(bid, ask, inputs.mid, inputs.tick);

        PriceQuote {
            bid,
            ask,
            mid: inputs.mid,
            reservation,
            half_spread_pts: delta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_model() -> LegacyModel {
        LegacyModel::new(&PricingConfig::default())
    }

    fn make_inputs(mid: f64, net: f64) -> PricingInputs {
        PricingInputs {
            mid,
            imbalance: 0.0,
            vol_pts: 0.0,
            staleness: 0.0,
            kappa: 1.5,
            net_inventory: net,
            max_inventory: 50.0,
            avg_entry: 0.0,
            days_to_resolution: 30.0,
            tick: 0.01,
        }
    }

    #[test]
    fn delta_respects_bounds() {
        let model = make_model();
        // Only the fee buffer: 0.2 < delta_min
        assert_eq!(model.delta(0.0, 0.0, 0.0), 1.5);
        // 0.3*5 + 0.2*0.5*10 + 0.3*1*5 + 0.2 = 4.2
        assert!((model.delta(5.0, -0.5, 1.0) - 4.2).abs() < 1e-9);
        assert_eq!(model.delta(100.0, 1.0, 1.0), 8.0);
    }

    #[test]
    fn skew_is_antisymmetric_and_steeper_at_extremes() {
        let model = make_model();
        assert_eq!(model.skew(0.0, 50.0), 0.0);
        let long = model.skew(25.0, 50.0);
        let short = model.skew(-25.0, 50.0);
        assert!((long + short).abs() < 1e-12);
        // r = 0.5 => -0.25 - 0.075
        assert!((long + 0.325).abs() < 1e-9, "skew {}", long);
        // Beyond capacity the ratio is clamped
        assert!((model.skew(500.0, 50.0) + 0.8).abs() < 1e-9);
    }

    #[test]
    fn long_inventory_shifts_quotes_down() {
        let model = make_model();
        let flat = model.price(&make_inputs(0.50, 0.0));
        let long = model.price(&make_inputs(0.50, 50.0));
        assert!(flat.bid < flat.ask);
        assert!(long.bid <= flat.bid);
        assert!(long.ask <= flat.ask);
        assert!(long.reservation < flat.reservation);
    }

    #[test]
    fn collapsed_pair_falls_back_to_one_tick_each_side() {
        let cfg = PricingConfig {
            delta_min_pts: 0.1,
            delta_max_pts: 0.1,
            ..PricingConfig::default()
        };
        let model = LegacyModel::new(&cfg);
        let quote = model.price(&make_inputs(0.503, 0.0));
        assert_eq!(quote.bid, 0.49);
        assert_eq!(quote.ask, 0.51);
    }
}
