//! Open directional positions and closed-trade history

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::info;

use super::ExitReason;
use crate::types::{Outcome, ThresholdDirection};

const EPS: f64 = 1e-9;

/// A directional entry, from order placement until exit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectionalPosition {
    pub market_id: String,
    pub token_id: String,
    pub question: String,
    pub coin: String,
    pub strike: f64,
    pub direction: ThresholdDirection,
    pub outcome: Outcome,
    pub entry_price: f64,
    /// Shares ordered
    pub size: f64,
    /// Shares filled so far
    pub filled: f64,
    pub entry_order_id: String,
    /// Entry order still resting on the book
    pub entry_open: bool,
    pub opened_at: DateTime<Utc>,
    pub expiry_days_at_entry: f64,
    pub entry_edge_pts: f64,
}

impl DirectionalPosition {
    /// Days left to resolution, decayed by wall-clock time since entry and
    /// floored at one day
    pub fn remaining_expiry_days(&self, now: DateTime<Utc>) -> f64 {
        let elapsed = (now - self.opened_at).num_seconds() as f64 / 86_400.0;
        (self.expiry_days_at_entry - elapsed).max(1.0)
    }

    /// Capital still committed by the unfilled part of the entry order
    pub fn pending_entry_notional(&self) -> f64 {
        if self.entry_open {
            (self.size - self.filled).max(0.0) * self.entry_price
        } else {
            0.0
        }
    }

    pub fn cost_basis(&self) -> f64 {
        self.filled * self.entry_price
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub market_id: String,
    pub outcome: Outcome,
    pub reason: ExitReason,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    pub pnl: f64,
    pub entry_edge_pts: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl ClosedTrade {
    pub fn is_win(&self) -> bool {
        self.pnl > 0.0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub positions: Vec<DirectionalPosition>,
    pub closed: Vec<ClosedTrade>,
}

#[derive(Debug, Default)]
struct BookState {
    positions: HashMap<String, DirectionalPosition>,
    closed: Vec<ClosedTrade>,
}

/// At most one position per market
#[derive(Debug, Default)]
pub struct DirectionalBook {
    state: Mutex<BookState>,
}

impl DirectionalBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: BookSnapshot) -> Self {
        Self {
            state: Mutex::new(BookState {
                positions: snapshot
                    .positions
                    .into_iter()
                    .map(|p| (p.market_id.clone(), p))
                    .collect(),
                closed: snapshot.closed,
            }),
        }
    }

    pub async fn snapshot(&self) -> BookSnapshot {
        let state = self.state.lock().await;
        let mut positions: Vec<DirectionalPosition> = state.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.market_id.cmp(&b.market_id));
        BookSnapshot {
            positions,
            closed: state.closed.clone(),
        }
    }

    /// Register a new entry. Returns false when the market is already held.
    pub async fn open(&self, position: DirectionalPosition) -> bool {
        let mut state = self.state.lock().await;
        if state.positions.contains_key(&position.market_id) {
            return false;
        }
        info!(
            market = %position.market_id,
            outcome = %position.outcome,
            price = position.entry_price,
            size = position.size,
            edge_pts = position.entry_edge_pts,
            "📘 Directional position opened"
        );
        state.positions.insert(position.market_id.clone(), position);
        true
    }

    pub async fn contains(&self, market_id: &str) -> bool {
        self.state.lock().await.positions.contains_key(market_id)
    }

    pub async fn get(&self, market_id: &str) -> Option<DirectionalPosition> {
        self.state.lock().await.positions.get(market_id).cloned()
    }

    pub async fn positions(&self) -> Vec<DirectionalPosition> {
        let state = self.state.lock().await;
        let mut positions: Vec<DirectionalPosition> = state.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.market_id.cmp(&b.market_id));
        positions
    }

    pub async fn count(&self) -> usize {
        self.state.lock().await.positions.len()
    }

    /// Record exchange-reported fill progress of an entry order. `open` is
    /// false once the order is no longer resting. An order that closes with
    /// nothing filled drops the position.
    pub async fn update_entry(&self, market_id: &str, filled: f64, open: bool) -> Option<DirectionalPosition> {
        let mut state = self.state.lock().await;
        let position = state.positions.get_mut(market_id)?;
        position.filled = filled.min(position.size).max(position.filled);
        position.entry_open = open && position.filled + EPS < position.size;
        if !position.entry_open && position.filled <= EPS {
            info!(market = %market_id, "Directional entry expired unfilled");
            return state.positions.remove(market_id);
        }
        None
    }

    pub async fn pending_entry_notional(&self) -> f64 {
        let state = self.state.lock().await;
        state
            .positions
            .values()
            .map(DirectionalPosition::pending_entry_notional)
            .sum()
    }

    /// Notional of filled directional shares at entry price
    pub async fn exposure(&self) -> f64 {
        let state = self.state.lock().await;
        state.positions.values().map(DirectionalPosition::cost_basis).sum()
    }

    pub async fn entry_order_ids(&self) -> HashSet<String> {
        let state = self.state.lock().await;
        state
            .positions
            .values()
            .map(|p| p.entry_order_id.clone())
            .collect()
    }

    /// Remove the position and book the trade. `sold` is the filled exit
    /// size; a partial exit leaves the remainder open.
    pub async fn close(
        &self,
        market_id: &str,
        exit_price: f64,
        sold: f64,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Option<ClosedTrade> {
        let mut state = self.state.lock().await;
        let position = state.positions.get_mut(market_id)?;
        let sold = sold.min(position.filled);
        if sold <= EPS {
            return None;
        }
        let trade = ClosedTrade {
            market_id: market_id.to_string(),
            outcome: position.outcome,
            reason,
            entry_price: position.entry_price,
            exit_price,
            size: sold,
            pnl: (exit_price - position.entry_price) * sold,
            entry_edge_pts: position.entry_edge_pts,
            opened_at: position.opened_at,
            closed_at: now,
        };
        position.filled -= sold;
        position.size = (position.size - sold).max(position.filled);
        if position.filled <= EPS && !position.entry_open {
            state.positions.remove(market_id);
        }
        state.closed.push(trade.clone());
        Some(trade)
    }

    pub async fn closed(&self) -> Vec<ClosedTrade> {
        self.state.lock().await.closed.clone()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;

    pub(crate) fn make_position(market_id: &str, entry_price: f64, size: f64) -> DirectionalPosition {
        DirectionalPosition {
            market_id: market_id.to_string(),
            token_id: format!("{}-yes", market_id),
            question: "Will BTC be above $100,000?".to_string(),
            coin: "BTC".to_string(),
            strike: 100_000.0,
            direction: ThresholdDirection::Above,
            outcome: Outcome::Yes,
            entry_price,
            size,
            filled: size,
            entry_order_id: format!("order-{}", market_id),
            entry_open: false,
            opened_at: Utc::now(),
            expiry_days_at_entry: 10.0,
            entry_edge_pts: 8.0,
        }
    }

    #[test]
    fn remaining_expiry_decays_to_floor() {
        let mut position = make_position("m", 0.5, 10.0);
        let opened = position.opened_at;
        assert!((position.remaining_expiry_days(opened + Duration::days(3)) - 7.0).abs() < 1e-6);
        assert_eq!(position.remaining_expiry_days(opened + Duration::days(30)), 1.0);
        position.expiry_days_at_entry = 0.2;
        assert_eq!(position.remaining_expiry_days(opened), 1.0);
    }

    #[tokio::test]
    async fn one_position_per_market() {
        let book = DirectionalBook::new();
        assert!(book.open(make_position("m", 0.5, 10.0)).await);
        assert!(!book.open(make_position("m", 0.4, 10.0)).await);
        assert_eq!(book.count().await, 1);
    }

    #[tokio::test]
    async fn pending_notional_tracks_unfilled_entry() {
        let book = DirectionalBook::new();
        let mut position = make_position("m", 0.40, 20.0);
        position.filled = 0.0;
        position.entry_open = true;
        book.open(position).await;
        assert!((book.pending_entry_notional().await - 8.0).abs() < 1e-9);

        book.update_entry("m", 5.0, true).await;
        assert!((book.pending_entry_notional().await - 6.0).abs() < 1e-9);

        book.update_entry("m", 5.0, false).await;
        assert_eq!(book.pending_entry_notional().await, 0.0);
        assert_eq!(book.count().await, 1);
    }

    #[tokio::test]
    async fn unfilled_expired_entry_is_dropped() {
        let book = DirectionalBook::new();
        let mut position = make_position("m", 0.40, 20.0);
        position.filled = 0.0;
        position.entry_open = true;
        book.open(position).await;
        assert!(book.update_entry("m", 0.0, false).await.is_some());
        assert_eq!(book.count().await, 0);
    }

    #[tokio::test]
    async fn close_books_pnl() {
        let book = DirectionalBook::new();
        book.open(make_position("m", 0.50, 10.0)).await;
        let trade = book
            .close("m", 0.30, 10.0, ExitReason::StopLoss, Utc::now())
            .await
            .unwrap();
        assert!((trade.pnl + 2.0).abs() < 1e-9);
        assert!(!trade.is_win());
        assert_eq!(book.count().await, 0);
        assert_eq!(book.closed().await.len(), 1);
    }

    #[tokio::test]
    async fn partial_exit_keeps_remainder() {
        let book = DirectionalBook::new();
        book.open(make_position("m", 0.50, 10.0)).await;
        book.close("m", 0.75, 4.0, ExitReason::TakeProfit, Utc::now()).await;
        let remaining = book.get("m").await.unwrap();
        assert!((remaining.filled - 6.0).abs() < 1e-9);

        let snapshot = book.snapshot().await;
        let restored = DirectionalBook::from_snapshot(snapshot);
        assert_eq!(restored.count().await, 1);
        assert_eq!(restored.closed().await.len(), 1);
    }
}
