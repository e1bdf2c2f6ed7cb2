//! Per-market state feeding the quote models: realized mid volatility,
//! quote staleness and fill-arrival intensity.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};

/// EWMA of squared mid changes, in points
#[derive(Debug, Clone)]
pub struct VolTracker {
    alpha: f64,
    ewma_var: HashMap<String, f64>,
    last_mid: HashMap<String, f64>,
}

impl VolTracker {
    pub fn new(halflife: u32) -> Self {
        Self {
            alpha: 1.0 - 0.5f64.powf(1.0 / halflife.max(1) as f64),
            ewma_var: HashMap::new(),
            last_mid: HashMap::new(),
        }
    }

    /// Record a mid and return the current vol estimate (points)
    pub fn update(&mut self, market_id: &str, mid: f64) -> f64 {
        let last = self.last_mid.insert(market_id.to_string(), mid);
        let last = match last {
            Some(last) if last > 0.0 && mid > 0.0 => last,
            _ => return self.vol(market_id),
        };

        let change = (mid - last) * 100.0;
        let sq_change = change * change;
        let prev_var = self.ewma_var.get(market_id).copied().unwrap_or(sq_change);
        let new_var = self.alpha * sq_change + (1.0 - self.alpha) * prev_var;
        self.ewma_var.insert(market_id.to_string(), new_var);
        new_var.sqrt()
    }

    pub fn vol(&self, market_id: &str) -> f64 {
        self.ewma_var.get(market_id).copied().unwrap_or(0.0).sqrt()
    }

    pub fn reset(&mut self, market_id: &str) {
        self.ewma_var.remove(market_id);
        self.last_mid.remove(market_id);
    }
}

/// How long a market's mid has been unchanged, as a [0, 1] factor
#[derive(Debug, Clone)]
pub struct StaleTracker {
    threshold_secs: f64,
    last_mid: HashMap<String, f64>,
    last_change: HashMap<String, DateTime<Utc>>,
}

impl StaleTracker {
    pub fn new(threshold_secs: f64) -> Self {
        Self {
            threshold_secs,
            last_mid: HashMap::new(),
            last_change: HashMap::new(),
        }
    }

    pub fn observe(&mut self, market_id: &str, mid: f64, now: DateTime<Utc>) {
        let moved = match self.last_mid.insert(market_id.to_string(), mid) {
            Some(prev) => (mid - prev).abs() > 1e-6,
            None => true,
        };
        if moved || !self.last_change.contains_key(market_id) {
            self.last_change.insert(market_id.to_string(), now);
        }
    }

    /// 0.0 = fresh, 1.0 = unchanged for the whole threshold
    pub fn staleness(&self, market_id: &str, now: DateTime<Utc>) -> f64 {
        let Some(last) = self.last_change.get(market_id) else {
            return 0.0;
        };
        if self.threshold_secs <= 0.0 {
            return 0.0;
        }
        let elapsed = (now - *last).num_milliseconds().max(0) as f64 / 1000.0;
        (elapsed / self.threshold_secs).min(1.0)
    }

    pub fn reset(&mut self, market_id: &str) {
        self.last_mid.remove(market_id);
        self.last_change.remove(market_id);
    }
}

/// Fill-arrival intensity over a rolling window
#[derive(Debug, Clone)]
pub struct KappaEstimator {
    window: Duration,
    default_kappa: f64,
    fills: HashMap<String, VecDeque<DateTime<Utc>>>,
}

impl KappaEstimator {
    pub const MIN_KAPPA: f64 = 0.5;
    pub const MAX_KAPPA: f64 = 10.0;

    pub fn new(window_mins: i64, default_kappa: f64) -> Self {
        Self {
            window: Duration::minutes(window_mins.max(1)),
            default_kappa,
            fills: HashMap::new(),
        }
    }

    pub fn record_fill(&mut self, market_id: &str, at: DateTime<Utc>) {
        let queue = self.fills.entry(market_id.to_string()).or_default();
        queue.push_back(at);
        let cutoff = at - self.window;
        while queue.front().is_some_and(|t| *t < cutoff) {
            queue.pop_front();
        }
    }

    /// Fills per minute, clamped; the default until two fills are in the window
    pub fn kappa(&self, market_id: &str, now: DateTime<Utc>) -> f64 {
        let Some(queue) = self.fills.get(market_id) else {
            return self.default_kappa;
        };
        let cutoff = now - self.window;
        let recent: Vec<&DateTime<Utc>> = queue.iter().filter(|t| **t >= cutoff).collect();
        if recent.len() < 2 {
            return self.default_kappa;
        }
        let span_secs = (*recent[recent.len() - 1] - *recent[0]).num_milliseconds() as f64 / 1000.0;
        if span_secs <= 0.0 {
            return self.default_kappa;
        }
        let rate_per_min = (recent.len() - 1) as f64 / (span_secs / 60.0);
        rate_per_min.clamp(Self::MIN_KAPPA, Self::MAX_KAPPA)
    }

    pub fn reset(&mut self, market_id: &str) {
        self.fills.remove(market_id);
    }
}
