//! Risk manager - the single gate every quote and trade passes
//!
//! Implements:
//! - Per-quote price sanity (bounds, spread, distance from mid)
//! - Directional trade checks (pause, edge, position count, exposure, daily volume)
//! - Fail-closed capital: an unknown balance rejects every new trade
//! - Drawdown kill-switch with hysteresis, cooldown and a daily auto-resume cap
//! - Per-market circuit breakers and guard blocks
//!
//! All state lives behind one mutex; every public method is one critical
//! section. Time is always passed in so evaluation is deterministic.

pub mod breaker;

pub use breaker::CircuitBreaker;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::config::RiskConfig;
use crate::persistence::RiskRecord;

/// Outcome of a risk check
#[derive(Debug, Clone, PartialEq)]
pub enum RiskVerdict {
    Approved,
    Rejected(String),
}

impl RiskVerdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, RiskVerdict::Approved)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            RiskVerdict::Approved => None,
            RiskVerdict::Rejected(reason) => Some(reason),
        }
    }
}

/// Result of the external balance query
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BalanceReading {
    Known(f64),
    /// Query failed; treat as unknown, never as zero or as enough
    Unknown,
}

impl BalanceReading {
    pub fn known(&self) -> Option<f64> {
        match self {
            BalanceReading::Known(v) => Some(*v),
            BalanceReading::Unknown => None,
        }
    }
}

/// Capital for one decision. Built fresh from the balance query each time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapitalBudget {
    pub balance: BalanceReading,
    /// Remaining notional of resting market-making bids
    pub locked_in_quotes: f64,
    /// Remaining notional of unfilled directional entry orders
    pub locked_in_entries: f64,
}

impl CapitalBudget {
    pub fn new(balance: BalanceReading, locked_in_quotes: f64, locked_in_entries: f64) -> Self {
        Self {
            balance,
            locked_in_quotes,
            locked_in_entries,
        }
    }

    /// Balance minus locked capital; `None` when the balance is unknown
    pub fn available(&self) -> Option<f64> {
        self.balance
            .known()
            .map(|b| (b - self.locked_in_quotes - self.locked_in_entries).max(0.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskMode {
    Normal,
    /// Drawdown past the reduce threshold: sizes halved
    Reduce,
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    Drawdown,
    IntradayDrawdown,
    Manual,
    Fatal,
}

impl PauseReason {
    /// Manual and fatal pauses only clear through an explicit resume
    pub fn auto_resumable(&self) -> bool {
        matches!(self, PauseReason::Drawdown | PauseReason::IntradayDrawdown)
    }
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PauseReason::Drawdown => "drawdown",
            PauseReason::IntradayDrawdown => "intraday_drawdown",
            PauseReason::Manual => "manual",
            PauseReason::Fatal => "fatal",
        };
        write!(f, "{}", s)
    }
}

/// Externally observable risk state change
#[derive(Debug, Clone, PartialEq)]
pub enum RiskEvent {
    Paused {
        reason: PauseReason,
        drawdown_pct: f64,
        detail: String,
    },
    Resumed {
        auto: bool,
        drawdown_pct: f64,
    },
    ReduceEntered {
        drawdown_pct: f64,
    },
    ReduceExited {
        drawdown_pct: f64,
    },
    BreakerTripped {
        market_id: String,
        until: DateTime<Utc>,
    },
    BreakerCleared {
        market_id: String,
    },
    MarketBlocked {
        market_id: String,
        until: DateTime<Utc>,
        reason: String,
    },
    MarketUnblocked {
        market_id: String,
    },
    CapitalUnknown,
    CapitalRestored,
    DayRolled {
        date: NaiveDate,
    },
}

impl RiskEvent {
    /// Exposure-increasing quotes must be pulled
    pub fn is_kill(&self) -> bool {
        matches!(self, RiskEvent::Paused { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RiskEvent::Paused { .. } => "paused",
            RiskEvent::Resumed { .. } => "resumed",
            RiskEvent::ReduceEntered { .. } => "reduce_entered",
            RiskEvent::ReduceExited { .. } => "reduce_exited",
            RiskEvent::BreakerTripped { .. } => "breaker_tripped",
            RiskEvent::BreakerCleared { .. } => "breaker_cleared",
            RiskEvent::MarketBlocked { .. } => "market_blocked",
            RiskEvent::MarketUnblocked { .. } => "market_unblocked",
            RiskEvent::CapitalUnknown => "capital_unknown",
            RiskEvent::CapitalRestored => "capital_restored",
            RiskEvent::DayRolled { .. } => "day_rolled",
        }
    }

    pub fn to_record(&self, at: DateTime<Utc>) -> RiskRecord {
        let (market_id, drawdown_pct, detail) = match self {
            RiskEvent::Paused {
                reason,
                drawdown_pct,
                detail,
            } => (None, Some(*drawdown_pct), format!("{}: {}", reason, detail)),
            RiskEvent::Resumed { auto, drawdown_pct } => (
                None,
                Some(*drawdown_pct),
                if *auto { "auto" } else { "manual" }.to_string(),
            ),
            RiskEvent::ReduceEntered { drawdown_pct } | RiskEvent::ReduceExited { drawdown_pct } => {
                (None, Some(*drawdown_pct), String::new())
            }
            RiskEvent::BreakerTripped { market_id, until } => {
                (Some(market_id.clone()), None, format!("until {}", until.to_rfc3339()))
            }
            RiskEvent::BreakerCleared { market_id } | RiskEvent::MarketUnblocked { market_id } => {
                (Some(market_id.clone()), None, String::new())
            }
            RiskEvent::MarketBlocked {
                market_id,
                until,
                reason,
            } => (
                Some(market_id.clone()),
                None,
                format!("{} (until {})", reason, until.to_rfc3339()),
            ),
            RiskEvent::CapitalUnknown | RiskEvent::CapitalRestored => (None, None, String::new()),
            RiskEvent::DayRolled { date } => (None, None, date.to_string()),
        };
        RiskRecord {
            timestamp: at.timestamp_millis(),
            kind: self.kind().to_string(),
            market_id,
            drawdown_pct,
            detail,
        }
    }
}

/// Directional entry awaiting approval
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalIntent {
    pub size_usd: f64,
    pub edge_pts: f64,
    /// Live entry threshold from the directional tunables
    pub min_edge_pts: f64,
    pub open_positions: usize,
    pub max_positions: usize,
}

/// Process-wide risk state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub paused: Option<PauseReason>,
    pub paused_at: Option<DateTime<Utc>>,
    pub mode: RiskMode,
    pub high_water_mark: f64,
    pub day: NaiveDate,
    pub day_peak: f64,
    pub drawdown_pct: f64,
    pub intraday_drawdown_pct: f64,
    pub auto_resumes_today: u32,
    pub directional_volume_today: f64,
    pub capital_unknown: bool,
    pub breakers: HashMap<String, CircuitBreaker>,
    pub blocked_markets: HashMap<String, DateTime<Utc>>,
}

impl RiskState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            paused: None,
            paused_at: None,
            mode: RiskMode::Normal,
            high_water_mark: 0.0,
            day: now.date_naive(),
            day_peak: 0.0,
            drawdown_pct: 0.0,
            intraday_drawdown_pct: 0.0,
            auto_resumes_today: 0,
            directional_volume_today: 0.0,
            capital_unknown: false,
            breakers: HashMap::new(),
            blocked_markets: HashMap::new(),
        }
    }

    fn roll_day(&mut self, now: DateTime<Utc>) -> Option<RiskEvent> {
        let today = now.date_naive();
        if today == self.day {
            return None;
        }
        self.day = today;
        self.day_peak = 0.0;
        self.auto_resumes_today = 0;
        self.directional_volume_today = 0.0;
        Some(RiskEvent::DayRolled { date: today })
    }
}

pub struct RiskManager {
    config: RiskConfig,
    state: Mutex<RiskState>,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RiskState::new(Utc::now())),
        }
    }

    pub fn restore(config: RiskConfig, mut state: RiskState) -> Self {
        // Breaker thresholds follow the current config
        for breaker in state.breakers.values_mut() {
            *breaker = CircuitBreaker::new(config.breaker_threshold, config.breaker_cooldown_secs)
                .with_trip(breaker.tripped_until());
        }
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RiskState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn snapshot(&self) -> RiskState {
        self.lock().clone()
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused.is_some()
    }

    pub fn pause_reason(&self) -> Option<PauseReason> {
        self.lock().paused
    }

    pub fn mode(&self) -> RiskMode {
        self.lock().mode
    }

    pub fn is_reduce_mode(&self) -> bool {
        self.lock().mode == RiskMode::Reduce
    }

    // ═══════════════════════════════════════════════════════════════════
    // QUOTE CHECKS
    // ═══════════════════════════════════════════════════════════════════

    /// Validate a (possibly one-sided) market-making quote
    pub fn validate_quote(
        &self,
        market_id: &str,
        bid: Option<f64>,
        ask: Option<f64>,
        mid: f64,
        max_delta_pts: f64,
        now: DateTime<Utc>,
    ) -> RiskVerdict {
        let state = self.lock();
        if state.paused.is_some() {
            return RiskVerdict::Rejected("trading paused".to_string());
        }
        if Self::suspended(&state, market_id, now) {
            return RiskVerdict::Rejected(format!("market {} suspended", market_id));
        }
        drop(state);

        if bid.is_none() && ask.is_none() {
            return RiskVerdict::Rejected("empty quote".to_string());
        }
        for price in [bid, ask].into_iter().flatten() {
            if price < self.config.min_price || price > self.config.max_price {
                return RiskVerdict::Rejected(format!("price {:.2} out of range", price));
            }
        }

        let hard_cap = max_delta_pts * 2.0;
        if let Some(b) = bid {
            let d = (mid - b).abs() * 100.0;
            if d > hard_cap + 1e-9 {
                return RiskVerdict::Rejected(format!(
                    "bid {:.1}pts from mid exceeds {:.1}pts",
                    d, hard_cap
                ));
            }
        }
        if let Some(a) = ask {
            let d = (a - mid).abs() * 100.0;
            if d > hard_cap + 1e-9 {
                return RiskVerdict::Rejected(format!(
                    "ask {:.1}pts from mid exceeds {:.1}pts",
                    d, hard_cap
                ));
            }
        }

        if let (Some(b), Some(a)) = (bid, ask) {
            if b >= a {
                return RiskVerdict::Rejected(format!("bid {:.2} >= ask {:.2}", b, a));
            }
            let spread = ((a - b) * 100.0 * 100.0).round() / 100.0;
            let max_spread = (2.0 * max_delta_pts + 1.0).min(self.config.max_spread_pts);
            if spread > max_spread + 1e-9 {
                return RiskVerdict::Rejected(format!(
                    "spread {:.1}pts > {:.1}pts",
                    spread, max_spread
                ));
            }
            if spread + 1e-9 < self.config.min_spread_pts {
                return RiskVerdict::Rejected(format!(
                    "spread {:.1}pts < {:.1}pts minimum",
                    spread, self.config.min_spread_pts
                ));
            }
        }
        RiskVerdict::Approved
    }

    // ═══════════════════════════════════════════════════════════════════
    // DIRECTIONAL + EXPOSURE CHECKS
    // ═══════════════════════════════════════════════════════════════════

    /// Combined MM + CD exposure as a percent of total capital (cash + exposure)
    pub fn exposure_pct(total_exposure: f64, balance: f64) -> f64 {
        let total = balance + total_exposure;
        if total <= 0.0 {
            0.0
        } else {
            total_exposure / total * 100.0
        }
    }

    pub fn check_global_exposure(
        &self,
        total_exposure: f64,
        additional: f64,
        budget: &CapitalBudget,
    ) -> RiskVerdict {
        let Some(balance) = budget.balance.known() else {
            return RiskVerdict::Rejected("balance unknown".to_string());
        };
        let pct = Self::exposure_pct(total_exposure + additional, balance - additional);
        if pct > self.config.max_total_exposure_pct {
            return RiskVerdict::Rejected(format!(
                "exposure {:.1}% > {:.1}%",
                pct, self.config.max_total_exposure_pct
            ));
        }
        RiskVerdict::Approved
    }

    pub fn validate_directional_trade(
        &self,
        intent: &DirectionalIntent,
        budget: &CapitalBudget,
        total_exposure: f64,
        now: DateTime<Utc>,
    ) -> RiskVerdict {
        let mut state = self.lock();
        if state.paused.is_some() {
            return RiskVerdict::Rejected("trading paused".to_string());
        }
        if let Some(event) = state.roll_day(now) {
            info!(?event, "Risk day rolled during directional check");
        }
        let volume_today = state.directional_volume_today;
        drop(state);

        let Some(available) = budget.available() else {
            return RiskVerdict::Rejected("balance unknown".to_string());
        };
        if intent.size_usd <= 0.0 {
            return RiskVerdict::Rejected("size must be positive".to_string());
        }
        if intent.size_usd > available {
            return RiskVerdict::Rejected(format!(
                "insufficient funds: need ${:.2}, have ${:.2}",
                intent.size_usd, available
            ));
        }
        if intent.edge_pts < intent.min_edge_pts {
            return RiskVerdict::Rejected(format!(
                "edge {:.1}pts below {:.1}pts minimum",
                intent.edge_pts, intent.min_edge_pts
            ));
        }
        if intent.open_positions >= intent.max_positions {
            return RiskVerdict::Rejected(format!(
                "{} open positions (max {})",
                intent.open_positions, intent.max_positions
            ));
        }
        if let RiskVerdict::Rejected(reason) =
            self.check_global_exposure(total_exposure, intent.size_usd, budget)
        {
            return RiskVerdict::Rejected(reason);
        }
        let daily_cap = available * self.config.directional_daily_volume_pct / 100.0;
        if volume_today + intent.size_usd > daily_cap {
            return RiskVerdict::Rejected(format!(
                "daily directional volume ${:.2} + ${:.2} > ${:.2}",
                volume_today, intent.size_usd, daily_cap
            ));
        }
        RiskVerdict::Approved
    }

    pub fn record_directional_volume(&self, usd: f64, now: DateTime<Utc>) {
        let mut state = self.lock();
        state.roll_day(now);
        state.directional_volume_today += usd;
    }

    // ═══════════════════════════════════════════════════════════════════
    // BREAKERS + BLOCKS
    // ═══════════════════════════════════════════════════════════════════

    fn suspended(state: &RiskState, market_id: &str, now: DateTime<Utc>) -> bool {
        state
            .breakers
            .get(market_id)
            .is_some_and(|b| b.is_open(now))
            || state
                .blocked_markets
                .get(market_id)
                .is_some_and(|until| now < *until)
    }

    pub fn is_market_suspended(&self, market_id: &str, now: DateTime<Utc>) -> bool {
        Self::suspended(&self.lock(), market_id, now)
    }

    /// Adverse = bought above the post-fill mid, or sold below it
    pub fn is_adverse(side_is_buy: bool, fill_price: f64, post_fill_mid: f64) -> bool {
        if side_is_buy {
            fill_price > post_fill_mid
        } else {
            fill_price < post_fill_mid
        }
    }

    pub fn record_fill_outcome(
        &self,
        market_id: &str,
        adverse: bool,
        now: DateTime<Utc>,
    ) -> Option<RiskEvent> {
        let mut state = self.lock();
        let breaker = state
            .breakers
            .entry(market_id.to_string())
            .or_insert_with(|| {
                CircuitBreaker::new(self.config.breaker_threshold, self.config.breaker_cooldown_secs)
            });
        let until = breaker.record(adverse, now)?;
        warn!(market = %market_id, until = %until, "🔌 Circuit breaker tripped");
        Some(RiskEvent::BreakerTripped {
            market_id: market_id.to_string(),
            until,
        })
    }

    pub fn block_market(
        &self,
        market_id: &str,
        until: DateTime<Utc>,
        reason: &str,
    ) -> RiskEvent {
        self.lock()
            .blocked_markets
            .insert(market_id.to_string(), until);
        warn!(market = %market_id, until = %until, reason, "⛔ Market blocked");
        RiskEvent::MarketBlocked {
            market_id: market_id.to_string(),
            until,
            reason: reason.to_string(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // PAUSE / RESUME
    // ═══════════════════════════════════════════════════════════════════

    fn pause_locked(
        state: &mut RiskState,
        reason: PauseReason,
        detail: String,
        now: DateTime<Utc>,
    ) -> RiskEvent {
        state.paused = Some(reason);
        state.paused_at = Some(now);
        state.mode = RiskMode::Killed;
        RiskEvent::Paused {
            reason,
            drawdown_pct: state.drawdown_pct,
            detail,
        }
    }

    /// Operator pause; never auto-resumes
    pub fn pause_manual(&self, now: DateTime<Utc>) -> Option<RiskEvent> {
        let mut state = self.lock();
        if state.paused == Some(PauseReason::Manual) {
            return None;
        }
        warn!("⏸️ Trading paused by operator");
        Some(Self::pause_locked(&mut state, PauseReason::Manual, "operator".to_string(), now))
    }

    /// Unrecoverable internal error: take the kill path
    pub fn escalate_fatal(&self, detail: &str, now: DateTime<Utc>) -> RiskEvent {
        let mut state = self.lock();
        error!(detail, "🛑 Fatal error, kill-switch engaged");
        Self::pause_locked(&mut state, PauseReason::Fatal, detail.to_string(), now)
    }

    /// Operator resume; clears any pause
    pub fn resume_manual(&self) -> Option<RiskEvent> {
        let mut state = self.lock();
        state.paused?;
        state.paused = None;
        state.paused_at = None;
        state.mode = if state.drawdown_pct >= self.config.dd_reduce_pct {
            RiskMode::Reduce
        } else {
            RiskMode::Normal
        };
        info!("▶️ Trading resumed by operator");
        Some(RiskEvent::Resumed {
            auto: false,
            drawdown_pct: state.drawdown_pct,
        })
    }

    /// Flag a failed balance read seen outside the evaluation tick
    pub fn mark_capital_unknown(&self) -> Option<RiskEvent> {
        let mut state = self.lock();
        if state.capital_unknown {
            return None;
        }
        state.capital_unknown = true;
        warn!("⚠️ Balance unknown, new trades rejected");
        Some(RiskEvent::CapitalUnknown)
    }

    // ═══════════════════════════════════════════════════════════════════
    // EVALUATION TICK
    // ═══════════════════════════════════════════════════════════════════

    /// One maintenance evaluation. `portfolio_value` is balance plus marked
    /// inventory, or `None` when the balance could not be read.
    pub fn evaluate(&self, portfolio_value: Option<f64>, now: DateTime<Utc>) -> Vec<RiskEvent> {
        let mut state = self.lock();
        let mut events = Vec::new();

        if let Some(event) = state.roll_day(now) {
            events.push(event);
        }

        let expired: Vec<String> = state
            .breakers
            .iter_mut()
            .filter_map(|(id, b)| b.expire(now).then(|| id.clone()))
            .collect();
        for market_id in expired {
            info!(market = %market_id, "Circuit breaker cleared");
            events.push(RiskEvent::BreakerCleared { market_id });
        }
        let unblocked: Vec<String> = state
            .blocked_markets
            .iter()
            .filter(|(_, until)| now >= **until)
            .map(|(id, _)| id.clone())
            .collect();
        for market_id in unblocked {
            state.blocked_markets.remove(&market_id);
            events.push(RiskEvent::MarketUnblocked { market_id });
        }

        let Some(value) = portfolio_value else {
            if !state.capital_unknown {
                state.capital_unknown = true;
                warn!("⚠️ Balance unknown, drawdown evaluation skipped");
                events.push(RiskEvent::CapitalUnknown);
            }
            return events;
        };
        if state.capital_unknown {
            state.capital_unknown = false;
            events.push(RiskEvent::CapitalRestored);
        }

        state.high_water_mark = state.high_water_mark.max(value);
        state.day_peak = state.day_peak.max(value);
        let pct_from = |peak: f64| {
            if peak > 0.0 {
                ((peak - value) / peak * 100.0).max(0.0)
            } else {
                0.0
            }
        };
        let dd = pct_from(state.high_water_mark);
        let intraday = pct_from(state.day_peak);
        state.drawdown_pct = dd;
        state.intraday_drawdown_pct = intraday;

        match state.paused {
            Some(reason) if reason.auto_resumable() => {
                if let Some(event) = self.try_auto_resume(&mut state, now) {
                    events.push(event);
                }
            }
            Some(_) => {}
            None => {
                if dd >= self.config.dd_kill_pct {
                    error!(drawdown_pct = dd, hwm = state.high_water_mark, value, "🛑 DRAWDOWN KILL SWITCH");
                    events.push(Self::pause_locked(
                        &mut state,
                        PauseReason::Drawdown,
                        format!("drawdown {:.1}% >= {:.1}%", dd, self.config.dd_kill_pct),
                        now,
                    ));
                } else if intraday >= self.config.intraday_kill_pct {
                    error!(intraday_pct = intraday, day_peak = state.day_peak, value, "🛑 INTRADAY KILL SWITCH");
                    events.push(Self::pause_locked(
                        &mut state,
                        PauseReason::IntradayDrawdown,
                        format!(
                            "intraday drawdown {:.1}% >= {:.1}%",
                            intraday, self.config.intraday_kill_pct
                        ),
                        now,
                    ));
                } else if dd >= self.config.dd_reduce_pct {
                    if state.mode != RiskMode::Reduce {
                        warn!(drawdown_pct = dd, "📉 Reduce mode entered");
                        state.mode = RiskMode::Reduce;
                        events.push(RiskEvent::ReduceEntered { drawdown_pct: dd });
                    }
                } else if state.mode == RiskMode::Reduce {
                    info!(drawdown_pct = dd, "Reduce mode cleared");
                    state.mode = RiskMode::Normal;
                    events.push(RiskEvent::ReduceExited { drawdown_pct: dd });
                }
            }
        }
        events
    }

    /// Resume requires every drawdown below its resume threshold, the
    /// cooldown elapsed, and the daily auto-resume cap not reached.
    fn try_auto_resume(&self, state: &mut RiskState, now: DateTime<Utc>) -> Option<RiskEvent> {
        if state.drawdown_pct >= self.config.dd_resume_pct
            || state.intraday_drawdown_pct >= self.config.intraday_resume_pct
        {
            return None;
        }
        let paused_at = state.paused_at?;
        if now - paused_at < Duration::minutes(self.config.dd_cooldown_minutes) {
            return None;
        }
        if state.auto_resumes_today >= self.config.max_auto_resumes_per_day {
            return None;
        }
        state.paused = None;
        state.paused_at = None;
        state.auto_resumes_today += 1;
        state.mode = if state.drawdown_pct >= self.config.dd_reduce_pct {
            RiskMode::Reduce
        } else {
            RiskMode::Normal
        };
        info!(
            drawdown_pct = state.drawdown_pct,
            resumes_today = state.auto_resumes_today,
            max = self.config.max_auto_resumes_per_day,
            "▶️ AUTO-RESUME"
        );
        Some(RiskEvent::Resumed {
            auto: true,
            drawdown_pct: state.drawdown_pct,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn make_manager() -> RiskManager {
        RiskManager::new(RiskConfig::default())
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap()
    }

    fn known(balance: f64) -> CapitalBudget {
        CapitalBudget::new(BalanceReading::Known(balance), 0.0, 0.0)
    }

    fn make_intent(size: f64) -> DirectionalIntent {
        DirectionalIntent {
            size_usd: size,
            edge_pts: 8.0,
            min_edge_pts: 5.0,
            open_positions: 0,
            max_positions: 5,
        }
    }

    #[test]
    fn quote_sanity_checks() {
        let risk = make_manager();
        let now = noon();
        assert!(risk.validate_quote("m", Some(0.48), Some(0.52), 0.50, 3.0, now).is_approved());
        // bid >= ask
        assert!(!risk.validate_quote("m", Some(0.52), Some(0.52), 0.52, 3.0, now).is_approved());
        // out of range
        assert!(!risk.validate_quote("m", Some(0.005), None, 0.01, 3.0, now).is_approved());
        // spread wider than 2*delta+1
        assert!(!risk.validate_quote("m", Some(0.45), Some(0.55), 0.50, 3.0, now).is_approved());
        // one side too far from mid
        assert!(!risk.validate_quote("m", Some(0.40), None, 0.50, 3.0, now).is_approved());
        // spread under the 1-point minimum can't happen on a 0.01 grid, but sub-tick grids can
        assert!(!risk.validate_quote("m", Some(0.500), Some(0.505), 0.5025, 3.0, now).is_approved());
    }

    #[test]
    fn unknown_balance_rejects_directional() {
        let risk = make_manager();
        let budget = CapitalBudget::new(BalanceReading::Unknown, 0.0, 0.0);
        let verdict = risk.validate_directional_trade(&make_intent(10.0), &budget, 0.0, noon());
        assert_eq!(verdict, RiskVerdict::Rejected("balance unknown".to_string()));
        assert!(!risk.check_global_exposure(0.0, 1.0, &budget).is_approved());
    }

    #[test]
    fn directional_caps() {
        let risk = make_manager();
        let now = noon();
        assert!(risk
            .validate_directional_trade(&make_intent(50.0), &known(1000.0), 0.0, now)
            .is_approved());

        let mut low_edge = make_intent(10.0);
        low_edge.edge_pts = 4.0;
        assert!(!risk.validate_directional_trade(&low_edge, &known(1000.0), 0.0, now).is_approved());
        // A lowered runtime threshold lets the same edge through
        low_edge.min_edge_pts = 3.0;
        assert!(risk.validate_directional_trade(&low_edge, &known(1000.0), 0.0, now).is_approved());

        let mut crowded = make_intent(10.0);
        crowded.open_positions = 5;
        assert!(!risk.validate_directional_trade(&crowded, &known(1000.0), 0.0, now).is_approved());

        // 900 exposure on 100 cash is 90% > 75%
        assert!(!risk
            .validate_directional_trade(&make_intent(10.0), &known(100.0), 900.0, now)
            .is_approved());

        // Daily volume: 50% of available
        risk.record_directional_volume(480.0, now);
        assert!(!risk
            .validate_directional_trade(&make_intent(30.0), &known(1000.0), 0.0, now)
            .is_approved());
        // New UTC day resets it
        let tomorrow = now + Duration::days(1);
        assert!(risk
            .validate_directional_trade(&make_intent(30.0), &known(1000.0), 0.0, tomorrow)
            .is_approved());
    }

    #[test]
    fn locked_capital_reduces_available() {
        let budget = CapitalBudget::new(BalanceReading::Known(100.0), 30.0, 20.0);
        assert_eq!(budget.available(), Some(50.0));
        let unknown = CapitalBudget::new(BalanceReading::Unknown, 0.0, 0.0);
        assert_eq!(unknown.available(), None);
    }

    #[test]
    fn drawdown_kill_then_hysteresis_resume() {
        let risk = make_manager();
        let t0 = noon();
        risk.evaluate(Some(1000.0), t0);

        let events = risk.evaluate(Some(750.0), t0 + Duration::minutes(1));
        assert!(events.iter().any(|e| e.is_kill()));
        assert!(risk.is_paused());
        assert_eq!(risk.pause_reason(), Some(PauseReason::Drawdown));

        // Oscillating between 21% and 24%: stays paused, no flapping
        for (i, value) in [790.0, 760.0, 780.0, 770.0].iter().enumerate() {
            let at = t0 + Duration::minutes(40 + i as i64);
            let events = risk.evaluate(Some(*value), at);
            assert!(events.is_empty(), "unexpected events {:?}", events);
            assert!(risk.is_paused());
        }

        // Below 20% but inside the 30-minute cooldown
        let risk2 = make_manager();
        risk2.evaluate(Some(1000.0), t0);
        risk2.evaluate(Some(740.0), t0);
        assert!(risk2.evaluate(Some(900.0), t0 + Duration::minutes(10)).is_empty());
        assert!(risk2.is_paused());
        let events = risk2.evaluate(Some(900.0), t0 + Duration::minutes(31));
        assert!(matches!(events.as_slice(), [RiskEvent::Resumed { auto: true, .. }]));
        assert!(!risk2.is_paused());
    }

    #[test]
    fn auto_resume_capped_per_day() {
        let cfg = RiskConfig {
            max_auto_resumes_per_day: 1,
            dd_cooldown_minutes: 0,
            ..RiskConfig::default()
        };
        let risk = RiskManager::new(cfg);
        let t0 = noon();
        risk.evaluate(Some(1000.0), t0);
        risk.evaluate(Some(700.0), t0);
        assert!(!risk.evaluate(Some(900.0), t0).is_empty());
        assert!(!risk.is_paused());

        risk.evaluate(Some(700.0), t0 + Duration::minutes(1));
        assert!(risk.is_paused());
        // Cap reached: stays paused even though recovered
        risk.evaluate(Some(950.0), t0 + Duration::minutes(2));
        assert!(risk.is_paused());
    }

    #[test]
    fn manual_pause_never_auto_resumes() {
        let cfg = RiskConfig {
            dd_cooldown_minutes: 0,
            ..RiskConfig::default()
        };
        let risk = RiskManager::new(cfg);
        let t0 = noon();
        risk.evaluate(Some(1000.0), t0);
        assert!(risk.pause_manual(t0).is_some());
        risk.evaluate(Some(1000.0), t0 + Duration::hours(2));
        assert!(risk.is_paused());
        assert!(risk.resume_manual().is_some());
        assert!(!risk.is_paused());
        assert!(risk.resume_manual().is_none());
    }

    #[test]
    fn intraday_kill_uses_day_peak() {
        let risk = make_manager();
        let t0 = noon();
        risk.evaluate(Some(1250.0), t0 - Duration::days(1));
        // New day: HWM 1250, day peak restarts at 1000 (20% cumulative, no kill)
        risk.evaluate(Some(1000.0), t0);
        assert!(!risk.is_paused());
        assert_eq!(risk.mode(), RiskMode::Reduce);
        // 790 is 21% below the day peak and 36.8% cumulative; cumulative kill wins
        let events = risk.evaluate(Some(790.0), t0 + Duration::minutes(5));
        assert!(matches!(
            events.as_slice(),
            [RiskEvent::Paused { reason: PauseReason::Drawdown, .. }]
        ));
    }

    #[test]
    fn intraday_kill_without_cumulative_breach() {
        let risk = make_manager();
        let t0 = noon();
        risk.evaluate(Some(1000.0), t0);
        let events = risk.evaluate(Some(790.0), t0 + Duration::minutes(5));
        assert!(matches!(
            events.as_slice(),
            [RiskEvent::Paused { reason: PauseReason::IntradayDrawdown, .. }]
        ));
    }

    #[test]
    fn reduce_band_enters_and_exits() {
        let risk = make_manager();
        let t0 = noon();
        risk.evaluate(Some(1000.0), t0);
        let events = risk.evaluate(Some(840.0), t0);
        assert!(matches!(events.as_slice(), [RiskEvent::ReduceEntered { .. }]));
        assert!(risk.is_reduce_mode());
        let events = risk.evaluate(Some(900.0), t0);
        assert!(matches!(events.as_slice(), [RiskEvent::ReduceExited { .. }]));
    }

    #[test]
    fn breaker_suspends_only_its_market_and_expires() {
        let risk = make_manager();
        let t0 = noon();
        for i in 0..4 {
            assert!(risk.record_fill_outcome("a", true, t0 + Duration::seconds(i)).is_none());
        }
        let event = risk.record_fill_outcome("a", true, t0 + Duration::seconds(4));
        assert!(matches!(event, Some(RiskEvent::BreakerTripped { .. })));
        assert!(risk.is_market_suspended("a", t0 + Duration::seconds(10)));
        assert!(!risk.is_market_suspended("b", t0 + Duration::seconds(10)));
        assert!(!risk
            .validate_quote("a", Some(0.48), Some(0.52), 0.50, 3.0, t0 + Duration::seconds(10))
            .is_approved());

        let later = t0 + Duration::seconds(4 + 300);
        assert!(!risk.is_market_suspended("a", later));
        let events = risk.evaluate(Some(1000.0), later);
        assert!(events
            .iter()
            .any(|e| matches!(e, RiskEvent::BreakerCleared { market_id } if market_id == "a")));
    }

    #[test]
    fn unknown_value_flags_capital_once() {
        let risk = make_manager();
        let t0 = noon();
        let events = risk.evaluate(None, t0);
        assert!(events.contains(&RiskEvent::CapitalUnknown));
        assert!(risk.evaluate(None, t0).is_empty());
        let events = risk.evaluate(Some(100.0), t0);
        assert!(events.contains(&RiskEvent::CapitalRestored));
    }

    #[test]
    fn adverse_fill_classification() {
        assert!(RiskManager::is_adverse(true, 0.52, 0.50));
        assert!(!RiskManager::is_adverse(true, 0.48, 0.50));
        assert!(RiskManager::is_adverse(false, 0.48, 0.50));
        assert!(!RiskManager::is_adverse(false, 0.52, 0.50));
    }

    #[test]
    fn risk_events_become_journal_records() {
        let at = noon();
        let record = RiskEvent::BreakerTripped {
            market_id: "m".into(),
            until: at,
        }
        .to_record(at);
        assert_eq!(record.kind, "breaker_tripped");
        assert_eq!(record.market_id.as_deref(), Some("m"));
    }
}
