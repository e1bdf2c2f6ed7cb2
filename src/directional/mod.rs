//! Crypto-directional model
//!
//! Prices threshold markets ("BTC above $X on date") from spot and an EWMA
//! estimate of daily volatility, using a unit-variance Student-t over the
//! time-scaled log distance to the strike. Both outcomes are evaluated and
//! the larger edge wins.

pub mod book;
pub mod exit;
pub mod kelly;
pub mod signal;

pub use book::{ClosedTrade, DirectionalBook, DirectionalPosition};
pub use exit::{check_exit, ExitReason};
pub use kelly::{kelly_size, size_entry, EntrySize};
pub use signal::{SignalState, SignalTracker, SignalTransition};

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::config::{CdConfig, CdExitConfig};
use crate::types::{Outcome, ThresholdDirection};

/// EWMA daily volatility of log returns. `None` with fewer than 3 prices or
/// no usable returns.
pub fn ewma_volatility(prices: &[f64], lambda: f64) -> Option<f64> {
    if prices.len() < 3 {
        return None;
    }
    let returns: Vec<f64> = prices
        .windows(2)
        .filter(|w| w[0] > 0.0 && w[1] > 0.0)
        .map(|w| (w[1] / w[0]).ln())
        .collect();
    let (first, rest) = returns.split_first()?;
    let variance = rest
        .iter()
        .fold(first * first, |var, r| lambda * var + (1.0 - lambda) * r * r);
    let vol = variance.sqrt();
    (vol.is_finite() && vol > 0.0).then_some(vol)
}

/// ln Γ(x), Lanczos approximation (g = 7, n = 9)
fn ln_gamma(x: f64) -> f64 {
    const G: f64 = 7.0;
    const COEF: [f64; 9] = [
        0.999_999_999_999_809_9,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];
    if x < 0.5 {
        // Reflection
        return (PI / (PI * x).sin()).ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let t = x + G + 0.5;
    let series = COEF
        .iter()
        .enumerate()
        .skip(1)
        .fold(COEF[0], |acc, (i, c)| acc + c / (x + i as f64));
    0.5 * (2.0 * PI).ln() + (x + 0.5) * t.ln() - t + series.ln()
}

/// Continued fraction for the incomplete beta, modified Lentz
fn beta_continued_fraction(a: f64, b: f64, x: f64) -> f64 {
    const MAX_ITER: usize = 300;
    const EPS: f64 = 1e-14;
    const TINY: f64 = 1e-300;

    let guard = |v: f64| if v.abs() < TINY { TINY } else { v };
    let (qab, qap, qam) = (a + b, a + 1.0, a - 1.0);
    let mut c = 1.0;
    let mut d = 1.0 / guard(1.0 - qab * x / qap);
    let mut h = d;

    for m in 1..=MAX_ITER {
        let m = m as f64;
        let m2 = 2.0 * m;

        let even = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 / guard(1.0 + even * d);
        c = guard(1.0 + even / c);
        h *= d * c;

        let odd = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 / guard(1.0 + odd * d);
        c = guard(1.0 + odd / c);
        let delta = d * c;
        h *= delta;

        if (delta - 1.0).abs() < EPS {
            break;
        }
    }
    h
}

/// Regularized incomplete beta I_x(a, b)
pub fn regularized_incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let ln_front = ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
    let front = ln_front.exp();
    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(a, b, x) / a
    } else {
        1.0 - front * beta_continued_fraction(b, a, 1.0 - x) / b
    }
}

/// CDF of Student's t with `nu` degrees of freedom
pub fn student_t_cdf(t: f64, nu: f64) -> f64 {
    if t.is_nan() || nu <= 0.0 {
        return 0.5;
    }
    if t.is_infinite() {
        return if t > 0.0 { 1.0 } else { 0.0 };
    }
    let x = nu / (nu + t * t);
    let tail = 0.5 * regularized_incomplete_beta(nu / 2.0, 0.5, x);
    if t >= 0.0 {
        1.0 - tail
    } else {
        tail
    }
}

/// Probability that the threshold event resolves YES.
///
/// `d = ln(K/S) / (σ·√t)` shrunk by `√((ν−2)/ν)` before the t CDF, so the
/// assigned probability of a move sits above the normal baseline.
/// Invalid inputs give 0.5.
pub fn threshold_probability(
    spot: f64,
    strike: f64,
    t_days: f64,
    daily_vol: f64,
    nu: f64,
    direction: ThresholdDirection,
) -> f64 {
    if !(spot > 0.0 && strike > 0.0 && t_days > 0.0 && daily_vol > 0.0 && nu > 2.0) {
        return 0.5;
    }
    let sigma_t = daily_vol * t_days.sqrt();
    let d = (strike / spot).ln() / sigma_t;
    let d_scaled = d * ((nu - 2.0) / nu).sqrt();
    let p_below = student_t_cdf(d_scaled, nu).clamp(0.0, 1.0);
    match direction {
        ThresholdDirection::Above => 1.0 - p_below,
        ThresholdDirection::Below => p_below,
    }
}

/// Edge in probability points
pub fn edge_pts(p_model: f64, p_market: f64) -> f64 {
    (p_model - p_market) * 100.0
}

/// The better of the two outcomes for one market
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutcomeEdge {
    pub outcome: Outcome,
    pub model_probability: f64,
    pub market_probability: f64,
    pub edge_pts: f64,
}

pub fn best_edge(p_model_yes: f64, p_yes_market: f64, p_no_market: f64) -> OutcomeEdge {
    let yes = OutcomeEdge {
        outcome: Outcome::Yes,
        model_probability: p_model_yes,
        market_probability: p_yes_market,
        edge_pts: edge_pts(p_model_yes, p_yes_market),
    };
    let no = OutcomeEdge {
        outcome: Outcome::No,
        model_probability: 1.0 - p_model_yes,
        market_probability: p_no_market,
        edge_pts: edge_pts(1.0 - p_model_yes, p_no_market),
    };
    if no.edge_pts > yes.edge_pts {
        no
    } else {
        yes
    }
}

/// Directional parameters adjustable at runtime through [`SettingsUpdate`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DirectionalTunables {
    pub min_edge_pts: f64,
    pub kelly_fraction: f64,
    pub student_t_nu: f64,
    pub stop_loss_pts: f64,
    pub take_profit_pts: f64,
}

impl DirectionalTunables {
    pub fn from_config(cd: &CdConfig, exit: &CdExitConfig) -> Self {
        Self {
            min_edge_pts: cd.min_edge_pts,
            kelly_fraction: cd.kelly_fraction,
            student_t_nu: cd.student_t_nu,
            stop_loss_pts: exit.stop_loss_pts,
            take_profit_pts: exit.take_profit_pts,
        }
    }

    /// Apply an update; returns `(name, old, new)` for each change
    pub fn apply(&mut self, update: &SettingsUpdate) -> Vec<(&'static str, f64, f64)> {
        let mut changes = Vec::new();
        let fields: [(&'static str, Option<f64>, &mut f64); 5] = [
            ("min_edge_pts", update.min_edge_pts, &mut self.min_edge_pts),
            ("kelly_fraction", update.kelly_fraction, &mut self.kelly_fraction),
            ("student_t_nu", update.student_t_nu, &mut self.student_t_nu),
            ("stop_loss_pts", update.stop_loss_pts, &mut self.stop_loss_pts),
            ("take_profit_pts", update.take_profit_pts, &mut self.take_profit_pts),
        ];
        for (name, value, slot) in fields {
            if let Some(v) = value {
                if (*slot - v).abs() > 1e-12 {
                    changes.push((name, *slot, v));
                    *slot = v;
                }
            }
        }
        changes
    }
}

/// Runtime change to the directional tunables. Built only through
/// [`SettingsUpdate::bounded`], which drops out-of-range values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsUpdate {
    pub min_edge_pts: Option<f64>,
    pub kelly_fraction: Option<f64>,
    pub student_t_nu: Option<f64>,
    pub stop_loss_pts: Option<f64>,
    pub take_profit_pts: Option<f64>,
}

impl SettingsUpdate {
    pub const MIN_EDGE_BOUNDS: (f64, f64) = (3.0, 15.0);
    pub const KELLY_BOUNDS: (f64, f64) = (0.10, 0.50);
    pub const NU_BOUNDS: (f64, f64) = (4.0, 10.0);
    pub const STOP_LOSS_BOUNDS: (f64, f64) = (8.0, 25.0);
    pub const TAKE_PROFIT_BOUNDS: (f64, f64) = (10.0, 40.0);

    pub fn bounded(
        min_edge_pts: Option<f64>,
        kelly_fraction: Option<f64>,
        student_t_nu: Option<f64>,
        stop_loss_pts: Option<f64>,
        take_profit_pts: Option<f64>,
    ) -> Self {
        let within = |v: Option<f64>, (lo, hi): (f64, f64)| v.filter(|x| x.is_finite() && *x >= lo && *x <= hi);
        Self {
            min_edge_pts: within(min_edge_pts, Self::MIN_EDGE_BOUNDS),
            kelly_fraction: within(kelly_fraction, Self::KELLY_BOUNDS),
            student_t_nu: within(student_t_nu, Self::NU_BOUNDS),
            stop_loss_pts: within(stop_loss_pts, Self::STOP_LOSS_BOUNDS),
            take_profit_pts: within(take_profit_pts, Self::TAKE_PROFIT_BOUNDS),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min_edge_pts.is_none()
            && self.kelly_fraction.is_none()
            && self.student_t_nu.is_none()
            && self.stop_loss_pts.is_none()
            && self.take_profit_pts.is_none()
    }
}

/// One model evaluation of a threshold market
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub spot: f64,
    pub daily_vol: f64,
    pub days_to_expiry: f64,
    /// Model probability that YES resolves
    pub p_model_yes: f64,
    pub best: OutcomeEdge,
}

/// Evaluate a threshold market from spot history and current outcome prices
#[allow(clippy::too_many_arguments)]
pub fn evaluate(
    spot: f64,
    closes: &[f64],
    strike: f64,
    direction: ThresholdDirection,
    days_to_expiry: f64,
    p_yes_market: f64,
    p_no_market: f64,
    lambda: f64,
    nu: f64,
) -> Option<Evaluation> {
    let daily_vol = ewma_volatility(closes, lambda)?;
    let days = days_to_expiry.max(0.5);
    let p_model_yes = threshold_probability(spot, strike, days, daily_vol, nu, direction);
    Some(Evaluation {
        spot,
        daily_vol,
        days_to_expiry: days,
        p_model_yes,
        best: best_edge(p_model_yes, p_yes_market, p_no_market),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() < tol,
            "expected {} got {} (tol {})",
            expected,
            actual,
            tol
        );
    }

    #[test]
    fn ewma_needs_three_prices() {
        assert!(ewma_volatility(&[100.0, 101.0], 0.94).is_none());
        assert!(ewma_volatility(&[100.0, 100.0, 100.0], 0.94).is_none());
        let vol = ewma_volatility(&[100.0, 102.0, 99.0, 101.0], 0.94).unwrap();
        // Hand-computed recursion
        let r: Vec<f64> = [(102.0f64 / 100.0), (99.0 / 102.0), (101.0 / 99.0)]
            .iter()
            .map(|x| x.ln())
            .collect();
        let mut var = r[0] * r[0];
        for x in &r[1..] {
            var = 0.94 * var + 0.06 * x * x;
        }
        assert_close(vol, var.sqrt(), 1e-12);
    }

    #[test]
    fn student_t_cdf_known_values() {
        assert_close(student_t_cdf(0.0, 6.0), 0.5, 1e-12);
        // Cauchy
        assert_close(student_t_cdf(1.0, 1.0), 0.75, 1e-9);
        assert_close(student_t_cdf(1.0, 6.0), 0.8220, 1e-4);
        assert_close(student_t_cdf(2.447, 6.0), 0.975, 1e-4);
        assert_close(student_t_cdf(-2.447, 6.0), 0.025, 1e-4);
        // Symmetry
        assert_close(student_t_cdf(1.3, 8.0) + student_t_cdf(-1.3, 8.0), 1.0, 1e-12);
    }

    #[test]
    fn probability_edge_cases() {
        let p = threshold_probability(100.0, 100.0, 10.0, 0.03, 6.0, ThresholdDirection::Above);
        assert_close(p, 0.5, 1e-12);
        assert_eq!(threshold_probability(0.0, 100.0, 10.0, 0.03, 6.0, ThresholdDirection::Above), 0.5);
        assert_eq!(threshold_probability(100.0, 100.0, 10.0, 0.0, 6.0, ThresholdDirection::Below), 0.5);
        let above = threshold_probability(100.0, 110.0, 10.0, 0.03, 6.0, ThresholdDirection::Above);
        let below = threshold_probability(100.0, 110.0, 10.0, 0.03, 6.0, ThresholdDirection::Below);
        assert_close(above + below, 1.0, 1e-12);
        assert!(above < 0.5);
    }

    #[test]
    fn fat_tail_exceeds_normal_for_large_moves() {
        // d = 3 standard deviations; normal tail is 0.00135
        let sigma = 0.02;
        let t = 4.0;
        let strike = 100.0 * (3.0 * sigma * t.sqrt()).exp();
        let p = threshold_probability(100.0, strike, t, sigma, 6.0, ThresholdDirection::Above);
        assert!(p > 0.00135 * 2.0, "t tail {}", p);
        assert!(p < 0.05);
    }

    #[test]
    fn fat_tail_exceeds_normal_at_one_sigma() {
        // d = 1: normal tail 0.1587, scaled t(6) tail at 0.8165 is 0.2227
        let sigma = 0.02;
        let t = 9.0;
        let strike = 100.0 * (sigma * t.sqrt()).exp();
        let p = threshold_probability(100.0, strike, t, sigma, 6.0, ThresholdDirection::Above);
        assert_close(p, 0.2227, 5e-4);
        assert!(p > 0.1587, "t tail {} not above normal", p);

        let strike = 100.0 * (1.5 * sigma * t.sqrt()).exp();
        let p = threshold_probability(100.0, strike, t, sigma, 6.0, ThresholdDirection::Above);
        assert!(p > 0.0668, "t tail {} at 1.5 sigma not above normal", p);
    }

    #[test]
    fn best_edge_picks_larger_side() {
        let e = best_edge(0.60, 0.50, 0.52);
        assert_eq!(e.outcome, Outcome::Yes);
        assert_close(e.edge_pts, 10.0, 1e-9);

        let e = best_edge(0.30, 0.40, 0.55);
        assert_eq!(e.outcome, Outcome::No);
        assert_close(e.model_probability, 0.70, 1e-12);
        assert_close(e.edge_pts, 15.0, 1e-9);
    }

    #[test]
    fn settings_update_drops_out_of_bounds() {
        let update = SettingsUpdate::bounded(Some(2.0), Some(0.2), Some(7.0), Some(30.0), None);
        assert_eq!(update.min_edge_pts, None);
        assert_eq!(update.kelly_fraction, Some(0.2));
        assert_eq!(update.student_t_nu, Some(7.0));
        assert_eq!(update.stop_loss_pts, None);

        let mut tunables = DirectionalTunables::from_config(&CdConfig::default(), &CdExitConfig::default());
        let changes = tunables.apply(&update);
        assert_eq!(changes.len(), 2);
        assert_eq!(tunables.kelly_fraction, 0.2);
        assert_eq!(tunables.student_t_nu, 7.0);
        assert!(SettingsUpdate::default().is_empty());
    }

    #[test]
    fn evaluate_requires_history() {
        assert!(evaluate(100.0, &[100.0], 110.0, ThresholdDirection::Above, 5.0, 0.3, 0.7, 0.94, 6.0).is_none());
        let closes = [100.0, 101.0, 99.5, 102.0, 100.5];
        let eval = evaluate(100.0, &closes, 110.0, ThresholdDirection::Above, 5.0, 0.3, 0.7, 0.94, 6.0).unwrap();
        assert!(eval.p_model_yes > 0.0 && eval.p_model_yes < 0.5);
    }
}
