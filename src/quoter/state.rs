//! Quote state machine
//!
//! ```text
//! Proposed -> Live | Rejected | Cancelled
//! Live     -> Partial | Filled | Cancelled
//! Partial  -> Partial | Filled | Cancelled
//! Cancelled -> Partial | Filled   (fill that raced the cancel)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::types::{Fill, OrderSide, Outcome, StrategyKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuoteState {
    Proposed,
    Live,
    Partial,
    Filled,
    Cancelled,
    Rejected,
}

impl QuoteState {
    pub fn can_transition(self, to: QuoteState) -> bool {
        use QuoteState::*;
        matches!(
            (self, to),
            (Proposed, Live)
                | (Proposed, Rejected)
                | (Proposed, Cancelled)
                | (Live, Partial)
                | (Live, Filled)
                | (Live, Cancelled)
                | (Partial, Partial)
                | (Partial, Filled)
                | (Partial, Cancelled)
                | (Cancelled, Partial)
                | (Cancelled, Filled)
        )
    }

    pub fn is_resting(self) -> bool {
        matches!(self, QuoteState::Live | QuoteState::Partial)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, QuoteState::Filled | QuoteState::Rejected)
    }

    /// Exchange status string to a state; `None` for statuses that imply no transition
    pub fn from_exchange_status(status: &str) -> Option<QuoteState> {
        match status.to_ascii_uppercase().as_str() {
            "LIVE" | "OPEN" | "ACTIVE" => Some(QuoteState::Live),
            "MATCHED" | "FILLED" => Some(QuoteState::Filled),
            "CANCELED" | "CANCELLED" | "EXPIRED" => Some(QuoteState::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for QuoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QuoteState::Proposed => "PROPOSED",
            QuoteState::Live => "LIVE",
            QuoteState::Partial => "PARTIAL",
            QuoteState::Filled => "FILLED",
            QuoteState::Cancelled => "CANCELLED",
            QuoteState::Rejected => "REJECTED",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid quote transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: QuoteState,
    pub to: QuoteState,
}

/// One resting (or formerly resting) order managed by the quoter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub order_id: Option<String>,
    pub market_id: String,
    pub token_id: String,
    pub outcome: Outcome,
    pub side: OrderSide,
    pub price: f64,
    pub size: f64,
    /// Cumulative matched shares acknowledged into the ledger
    pub size_matched: f64,
    pub state: QuoteState,
    /// Market mid when the quote was priced
    pub quoted_mid: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Quote {
    #[allow(clippy::too_many_arguments)]
    pub fn proposed(
        market_id: &str,
        token_id: &str,
        outcome: Outcome,
        side: OrderSide,
        price: f64,
        size: f64,
        quoted_mid: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            order_id: None,
            market_id: market_id.to_string(),
            token_id: token_id.to_string(),
            outcome,
            side,
            price,
            size,
            size_matched: 0.0,
            state: QuoteState::Proposed,
            quoted_mid,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, to: QuoteState, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if !self.state.can_transition(to) {
            return Err(InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.updated_at = now;
        Ok(())
    }

    pub fn remaining(&self) -> f64 {
        (self.size - self.size_matched).max(0.0)
    }

    /// USDC reserved by a resting bid
    pub fn locked_capital(&self) -> f64 {
        match (self.side, self.state.is_resting()) {
            (OrderSide::Buy, true) => self.remaining() * self.price,
            _ => 0.0,
        }
    }

    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_seconds()
    }

    /// Fill for newly matched shares, if the exchange reports more than we
    /// have acknowledged. The id is stable per (order, cumulative matched).
    pub fn pending_fill(&self, exchange_matched: f64, now: DateTime<Utc>) -> Option<Fill> {
        let order_id = self.order_id.as_ref()?;
        let delta = exchange_matched - self.size_matched;
        if delta <= 1e-9 {
            return None;
        }
        Some(Fill {
            fill_id: format!("{}:{:.4}", order_id, exchange_matched),
            order_id: order_id.clone(),
            market_id: self.market_id.clone(),
            outcome: self.outcome,
            side: self.side,
            price: self.price,
            size: delta,
            fee: 0.0,
            strategy: StrategyKind::MarketMaking,
            timestamp: now,
        })
    }

    /// Record an acknowledged fill and move to Partial or Filled
    pub fn acknowledge_fill(
        &mut self,
        exchange_matched: f64,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        let to = if exchange_matched + 1e-9 >= self.size {
            QuoteState::Filled
        } else {
            QuoteState::Partial
        };
        self.transition(to, now)?;
        self.size_matched = exchange_matched.min(self.size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_quote() -> Quote {
        let mut q = Quote::proposed("m", "yes", Outcome::Yes, OrderSide::Buy, 0.45, 10.0, 0.47, Utc::now());
        q.order_id = Some("o1".to_string());
        q
    }

    #[test]
    fn lifecycle_transitions() {
        let now = Utc::now();
        let mut q = make_quote();
        q.transition(QuoteState::Live, now).unwrap();
        assert!(q.transition(QuoteState::Proposed, now).is_err());
        q.acknowledge_fill(4.0, now).unwrap();
        assert_eq!(q.state, QuoteState::Partial);
        q.acknowledge_fill(6.0, now).unwrap();
        assert_eq!(q.state, QuoteState::Partial);
        q.acknowledge_fill(10.0, now).unwrap();
        assert_eq!(q.state, QuoteState::Filled);
        assert!(q.transition(QuoteState::Cancelled, now).is_err());
    }

    #[test]
    fn cancelled_quote_accepts_late_fill() {
        let now = Utc::now();
        let mut q = make_quote();
        q.transition(QuoteState::Live, now).unwrap();
        q.transition(QuoteState::Cancelled, now).unwrap();
        let fill = q.pending_fill(3.0, now).unwrap();
        assert_eq!(fill.size, 3.0);
        q.acknowledge_fill(3.0, now).unwrap();
        assert_eq!(q.state, QuoteState::Partial);
    }

    #[test]
    fn pending_fill_uses_delta_and_stable_id() {
        let now = Utc::now();
        let mut q = make_quote();
        q.transition(QuoteState::Live, now).unwrap();
        assert!(q.pending_fill(0.0, now).is_none());
        let first = q.pending_fill(4.0, now).unwrap();
        assert_eq!(first.fill_id, "o1:4.0000");
        q.acknowledge_fill(4.0, now).unwrap();
        let second = q.pending_fill(7.5, now).unwrap();
        assert!((second.size - 3.5).abs() < 1e-12);
        assert_ne!(first.fill_id, second.fill_id);
    }

    #[test]
    fn locked_capital_only_for_resting_bids() {
        let now = Utc::now();
        let mut q = make_quote();
        assert_eq!(q.locked_capital(), 0.0);
        q.transition(QuoteState::Live, now).unwrap();
        assert!((q.locked_capital() - 4.5).abs() < 1e-12);
        q.acknowledge_fill(4.0, now).unwrap();
        assert!((q.locked_capital() - 2.7).abs() < 1e-12);
    }

    #[test]
    fn exchange_status_mapping() {
        assert_eq!(QuoteState::from_exchange_status("live"), Some(QuoteState::Live));
        assert_eq!(QuoteState::from_exchange_status("MATCHED"), Some(QuoteState::Filled));
        assert_eq!(QuoteState::from_exchange_status("CANCELED"), Some(QuoteState::Cancelled));
        assert_eq!(QuoteState::from_exchange_status("delayed"), None);
    }
}
