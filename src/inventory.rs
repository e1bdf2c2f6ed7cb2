//! Inventory ledger
//!
//! Per market and outcome, positions are kept as FIFO lots. Sells consume
//! the oldest lots first and realize `(sell - lot) * size`. Sizes never go
//! negative: a sell larger than the holding is capped and the excess logged.
//!
//! The ledger is the single writer for positions. Every mutation runs under
//! one async mutex and, for fills, merges and splits, includes the journal
//! append; if the append fails the mutation is dropped, so a change is
//! either fully applied and durable or not applied at all.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::gateway::ExecutionGateway;
use crate::persistence::{DivergenceRecord, EventJournal, SetConversionRecord};
use crate::pricing::InventorySignal;
use crate::types::{Fill, Market, OrderSide, Outcome, StrategyKind};

/// Share difference tolerated before a position is corrected to exchange truth
pub const RECONCILE_TOLERANCE: f64 = 0.1;

const EPS: f64 = 1e-9;

/// Fill ids remembered for deduplication; the oldest are evicted first
pub const MAX_SEEN_FILLS: usize = 20_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lot {
    pub size: f64,
    pub price: f64,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryPosition {
    pub market_id: String,
    pub outcome: Outcome,
    pub lots: VecDeque<Lot>,
    pub realized_pnl: f64,
    pub fees_paid: f64,
    /// Last mark used for unrealized PnL
    pub mark: Option<f64>,
}

impl InventoryPosition {
    pub fn new(market_id: &str, outcome: Outcome) -> Self {
        Self {
            market_id: market_id.to_string(),
            outcome,
            lots: VecDeque::new(),
            realized_pnl: 0.0,
            fees_paid: 0.0,
            mark: None,
        }
    }

    pub fn size(&self) -> f64 {
        self.lots.iter().map(|l| l.size).sum()
    }

    pub fn cost_basis(&self) -> f64 {
        self.lots.iter().map(|l| l.size * l.price).sum()
    }

    /// Size-weighted price of the open lots, 0 when flat
    pub fn avg_entry(&self) -> f64 {
        let size = self.size();
        if size <= EPS {
            0.0
        } else {
            self.cost_basis() / size
        }
    }

    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        self.lots.front().map(|l| l.opened_at)
    }

    pub fn unrealized_pnl(&self) -> f64 {
        match self.mark {
            Some(mark) => self.size() * mark - self.cost_basis(),
            None => 0.0,
        }
    }

    /// Marked value, falling back to cost basis when unmarked
    pub fn market_value(&self) -> f64 {
        match self.mark {
            Some(mark) => self.size() * mark,
            None => self.cost_basis(),
        }
    }

    fn add_lot(&mut self, size: f64, price: f64, at: DateTime<Utc>) {
        if size > EPS {
            self.lots.push_back(Lot {
                size,
                price,
                opened_at: at,
            });
        }
    }

    /// Remove up to `size` shares FIFO. Returns (removed, cost of removed).
    fn take_fifo(&mut self, size: f64) -> (f64, f64) {
        let mut remaining = size;
        let mut removed = 0.0;
        let mut cost = 0.0;
        while remaining > EPS {
            let Some(lot) = self.lots.front_mut() else {
                break;
            };
            let take = lot.size.min(remaining);
            lot.size -= take;
            removed += take;
            cost += take * lot.price;
            remaining -= take;
            if lot.size <= EPS {
                self.lots.pop_front();
            }
        }
        (removed, cost)
    }

    /// Lots consumed FIFO for `size` shares, without mutating
    fn peek_fifo(&self, size: f64) -> Vec<(f64, f64)> {
        let mut remaining = size;
        let mut out = Vec::new();
        for lot in &self.lots {
            if remaining <= EPS {
                break;
            }
            let take = lot.size.min(remaining);
            out.push((take, lot.price));
            remaining -= take;
        }
        out
    }
}

/// What happened to a fill handed to the ledger
#[derive(Debug, Clone, PartialEq)]
pub enum FillApplied {
    Applied { realized: f64 },
    /// Already consumed; nothing changed
    Duplicate,
}

/// Local position that disagreed with exchange truth and was corrected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Divergence {
    pub market_id: String,
    pub outcome: Outcome,
    pub local_size: f64,
    pub exchange_size: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub positions: Vec<InventoryPosition>,
    pub seen_fills: Vec<String>,
    pub realized_pnl: f64,
}

#[derive(Debug, Default)]
struct LedgerState {
    positions: HashMap<(String, Outcome), InventoryPosition>,
    seen_fills: HashSet<String>,
    /// Insertion order of `seen_fills`
    seen_order: VecDeque<String>,
    realized_pnl: f64,
}

impl LedgerState {
    fn remember_fill(&mut self, fill_id: &str) {
        if !self.seen_fills.insert(fill_id.to_string()) {
            return;
        }
        self.seen_order.push_back(fill_id.to_string());
        while self.seen_order.len() > MAX_SEEN_FILLS {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen_fills.remove(&oldest);
            }
        }
    }

    fn position(&self, market_id: &str, outcome: Outcome) -> Option<&InventoryPosition> {
        self.positions.get(&(market_id.to_string(), outcome))
    }

    fn position_or_new(&self, market_id: &str, outcome: Outcome) -> InventoryPosition {
        self.position(market_id, outcome)
            .cloned()
            .unwrap_or_else(|| InventoryPosition::new(market_id, outcome))
    }
}

#[derive(Debug, Default)]
pub struct InventoryLedger {
    state: Mutex<LedgerState>,
}

impl InventoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        let positions = snapshot
            .positions
            .into_iter()
            .map(|p| ((p.market_id.clone(), p.outcome), p))
            .collect();
        let mut state = LedgerState {
            positions,
            realized_pnl: snapshot.realized_pnl,
            ..LedgerState::default()
        };
        for fill_id in &snapshot.seen_fills {
            state.remember_fill(fill_id);
        }
        Self {
            state: Mutex::new(state),
        }
    }

    pub async fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state.lock().await;
        let mut positions: Vec<InventoryPosition> = state.positions.values().cloned().collect();
        positions.sort_by(|a, b| {
            (a.market_id.as_str(), a.outcome as u8).cmp(&(b.market_id.as_str(), b.outcome as u8))
        });
        LedgerSnapshot {
            positions,
            seen_fills: state.seen_order.iter().cloned().collect(),
            realized_pnl: state.realized_pnl,
        }
    }

    /// Apply a fill exactly once. The journal append happens under the lock;
    /// on failure the ledger is left unchanged and the error returned.
    pub async fn apply_fill(&self, fill: &Fill, journal: &EventJournal) -> Result<FillApplied> {
        let mut state = self.state.lock().await;
        if state.seen_fills.contains(&fill.fill_id) {
            debug!(fill_id = %fill.fill_id, "Duplicate fill ignored");
            return Ok(FillApplied::Duplicate);
        }

        let mut position = state.position_or_new(&fill.market_id, fill.outcome);
        let realized = match fill.side {
            OrderSide::Buy => {
                position.add_lot(fill.size, fill.price, fill.timestamp);
                0.0
            }
            OrderSide::Sell => {
                let (removed, cost) = position.take_fifo(fill.size);
                if removed + EPS < fill.size {
                    warn!(
                        market = %fill.market_id,
                        outcome = %fill.outcome,
                        requested = fill.size,
                        held = removed,
                        "Sell fill exceeds holding, capped at zero"
                    );
                }
                removed * fill.price - cost
            }
        } - fill.fee;
        position.realized_pnl += realized;
        position.fees_paid += fill.fee;

        journal.record_fill(fill).await?;

        state.realized_pnl += realized;
        state.remember_fill(&fill.fill_id);
        state
            .positions
            .insert((fill.market_id.clone(), fill.outcome), position);
        info!(
            market = %fill.market_id,
            outcome = %fill.outcome,
            side = %fill.side,
            price = fill.price,
            size = fill.size,
            strategy = %fill.strategy,
            realized,
            "📒 Fill applied"
        );
        Ok(FillApplied::Applied { realized })
    }

    /// Record `pairs` YES+NO merged into collateral. Realizes `1 - yes - no`
    /// per pair at FIFO lot prices. Returns realized PnL.
    pub async fn apply_merge(
        &self,
        market_id: &str,
        pairs: f64,
        journal: &EventJournal,
        at: DateTime<Utc>,
    ) -> Result<f64> {
        let mut state = self.state.lock().await;
        let mut yes = state.position_or_new(market_id, Outcome::Yes);
        let mut no = state.position_or_new(market_id, Outcome::No);
        let pairs = pairs.min(yes.size()).min(no.size());
        if pairs <= EPS {
            return Ok(0.0);
        }
        let (_, yes_cost) = yes.take_fifo(pairs);
        let (_, no_cost) = no.take_fifo(pairs);
        let realized = pairs - yes_cost - no_cost;
        // Attribute the merge profit to the YES leg
        yes.realized_pnl += realized;

        journal
            .record_set_conversion(&SetConversionRecord {
                timestamp: at.timestamp_millis(),
                kind: "merge".to_string(),
                market_id: market_id.to_string(),
                pairs,
                realized,
            })
            .await?;

        state.realized_pnl += realized;
        state.positions.insert((market_id.to_string(), Outcome::Yes), yes);
        state.positions.insert((market_id.to_string(), Outcome::No), no);
        info!(market = %market_id, pairs, realized, "🔗 Merge applied");
        Ok(realized)
    }

    /// Record collateral split into `amount` YES+NO pairs at 0.50 each
    pub async fn apply_split(
        &self,
        market_id: &str,
        amount: f64,
        journal: &EventJournal,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        journal
            .record_set_conversion(&SetConversionRecord {
                timestamp: at.timestamp_millis(),
                kind: "split".to_string(),
                market_id: market_id.to_string(),
                pairs: amount,
                realized: 0.0,
            })
            .await?;
        for outcome in [Outcome::Yes, Outcome::No] {
            let mut position = state.position_or_new(market_id, outcome);
            position.add_lot(amount, 0.5, at);
            state.positions.insert((market_id.to_string(), outcome), position);
        }
        info!(market = %market_id, amount, "✂️ Split applied");
        Ok(())
    }

    pub async fn position(&self, market_id: &str, outcome: Outcome) -> Option<InventoryPosition> {
        self.state.lock().await.position(market_id, outcome).cloned()
    }

    pub async fn positions(&self) -> Vec<InventoryPosition> {
        self.state
            .lock()
            .await
            .positions
            .values()
            .filter(|p| p.size() > EPS)
            .cloned()
            .collect()
    }

    /// Markets with a non-empty position
    pub async fn markets(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut ids: Vec<String> = state
            .positions
            .values()
            .filter(|p| p.size() > EPS)
            .map(|p| p.market_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub async fn signal(&self, market_id: &str) -> InventorySignal {
        let state = self.state.lock().await;
        let yes = state.position(market_id, Outcome::Yes);
        let no = state.position(market_id, Outcome::No);
        InventorySignal {
            yes_shares: yes.map_or(0.0, |p| p.size()),
            no_shares: no.map_or(0.0, |p| p.size()),
            yes_avg_entry: yes.map_or(0.0, |p| p.avg_entry()),
            exposure_usd: yes.map_or(0.0, |p| p.cost_basis()) + no.map_or(0.0, |p| p.cost_basis()),
        }
    }

    pub async fn mergeable_pairs(&self, market_id: &str) -> f64 {
        let signal = self.signal(market_id).await;
        (signal.yes_shares.min(signal.no_shares) * 100.0).floor() / 100.0
    }

    /// Realized PnL that a merge of `pairs` would book, without applying it
    pub async fn merge_preview(&self, market_id: &str, pairs: f64) -> f64 {
        let state = self.state.lock().await;
        let (Some(yes), Some(no)) = (
            state.position(market_id, Outcome::Yes),
            state.position(market_id, Outcome::No),
        ) else {
            return 0.0;
        };
        let yes_cost: f64 = yes.peek_fifo(pairs).iter().map(|(s, p)| s * p).sum();
        let no_cost: f64 = no.peek_fifo(pairs).iter().map(|(s, p)| s * p).sum();
        pairs.min(yes.size()).min(no.size()) - yes_cost - no_cost
    }

    pub async fn mark(&self, market_id: &str, outcome: Outcome, price: f64) {
        let mut state = self.state.lock().await;
        if let Some(p) = state.positions.get_mut(&(market_id.to_string(), outcome)) {
            p.mark = Some(price);
        }
    }

    /// Cost basis across all positions
    pub async fn total_exposure(&self) -> f64 {
        self.state
            .lock()
            .await
            .positions
            .values()
            .map(|p| p.cost_basis())
            .sum()
    }

    /// Marked value of all holdings
    pub async fn marked_value(&self) -> f64 {
        self.state
            .lock()
            .await
            .positions
            .values()
            .map(|p| p.market_value())
            .sum()
    }

    pub async fn realized_pnl(&self) -> f64 {
        self.state.lock().await.realized_pnl
    }

    pub async fn unrealized_pnl(&self) -> f64 {
        self.state
            .lock()
            .await
            .positions
            .values()
            .map(|p| p.unrealized_pnl())
            .sum()
    }

    /// min(age / max_hours, 1) for the oldest open lot in the market
    pub async fn unwind_urgency(&self, market_id: &str, max_hours: f64, now: DateTime<Utc>) -> f64 {
        let state = self.state.lock().await;
        let oldest = [Outcome::Yes, Outcome::No]
            .iter()
            .filter_map(|o| state.position(market_id, *o)?.opened_at())
            .min();
        match oldest {
            Some(opened) if max_hours > 0.0 => {
                let hours = (now - opened).num_seconds() as f64 / 3600.0;
                (hours / max_hours).clamp(0.0, 1.0)
            }
            _ => 0.0,
        }
    }

    /// |YES - NO| value beyond `threshold * max_per_market`
    pub async fn needs_unwind(&self, market_id: &str, max_per_market: f64, threshold: f64) -> bool {
        let state = self.state.lock().await;
        let value = |o: Outcome| {
            state.position(market_id, o).map_or(0.0, |p| {
                let price = if p.avg_entry() > 0.0 { p.avg_entry() } else { 0.5 };
                p.size() * price
            })
        };
        (value(Outcome::Yes) - value(Outcome::No)).abs() > threshold * max_per_market
    }

    /// Correct positions toward exchange truth. Shares the exchange has that
    /// we don't are added at the current average entry (0.50 if flat); shares
    /// we have that it doesn't are removed FIFO without booking PnL.
    pub async fn correct_to(
        &self,
        market_id: &str,
        outcome: Outcome,
        exchange_size: f64,
        at: DateTime<Utc>,
    ) -> Option<Divergence> {
        let mut state = self.state.lock().await;
        let mut position = state.position_or_new(market_id, outcome);
        let local = position.size();
        let diff = exchange_size - local;
        if diff.abs() <= RECONCILE_TOLERANCE {
            return None;
        }
        if diff > 0.0 {
            let price = if position.avg_entry() > 0.0 {
                position.avg_entry()
            } else {
                0.5
            };
            position.add_lot(diff, price, at);
        } else {
            position.take_fifo(-diff);
        }
        state
            .positions
            .insert((market_id.to_string(), outcome), position);
        warn!(
            market = %market_id,
            outcome = %outcome,
            local_size = local,
            exchange_size,
            "⚠️ Inventory diverged from exchange, corrected"
        );
        Some(Divergence {
            market_id: market_id.to_string(),
            outcome,
            local_size: local,
            exchange_size,
        })
    }

    /// Compare every tracked market against gateway token balances. Balance
    /// failures leave that position untouched (unknown is not zero).
    pub async fn reconcile(
        &self,
        gateway: &dyn ExecutionGateway,
        markets: &[Market],
        journal: &EventJournal,
        now: DateTime<Utc>,
    ) -> Vec<Divergence> {
        let mut divergences = Vec::new();
        for market in markets {
            for outcome in [Outcome::Yes, Outcome::No] {
                let exchange_size = match gateway.get_token_balance(market, outcome).await {
                    Ok(size) => size,
                    Err(e) => {
                        warn!(market = %market.id, outcome = %outcome, error = %e, "Token balance unknown, skipping reconcile");
                        continue;
                    }
                };
                if let Some(divergence) = self.correct_to(&market.id, outcome, exchange_size, now).await {
                    let record = DivergenceRecord {
                        timestamp: now.timestamp_millis(),
                        kind: "divergence".to_string(),
                        market_id: divergence.market_id.clone(),
                        outcome: divergence.outcome.to_string(),
                        local_size: divergence.local_size,
                        exchange_size: divergence.exchange_size,
                    };
                    if let Err(e) = journal.record_divergence(&record).await {
                        warn!(error = %e, "Failed to journal divergence");
                    }
                    divergences.push(divergence);
                }
            }
        }
        if divergences.is_empty() {
            debug!(markets = markets.len(), "Reconcile clean");
        }
        divergences
    }
}

/// Fill built by hand (arbitrage legs, tests)
#[allow(clippy::too_many_arguments)]
pub fn make_fill(
    fill_id: &str,
    market_id: &str,
    outcome: Outcome,
    side: OrderSide,
    price: f64,
    size: f64,
    strategy: StrategyKind,
    at: DateTime<Utc>,
) -> Fill {
    Fill {
        fill_id: fill_id.to_string(),
        order_id: fill_id.split(':').next().unwrap_or(fill_id).to_string(),
        market_id: market_id.to_string(),
        outcome,
        side,
        price,
        size,
        fee: 0.0,
        strategy,
        timestamp: at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::PaperGateway;

    fn buy(id: &str, price: f64, size: f64) -> Fill {
        make_fill(id, "m1", Outcome::Yes, OrderSide::Buy, price, size, StrategyKind::MarketMaking, Utc::now())
    }

    fn sell(id: &str, price: f64, size: f64) -> Fill {
        make_fill(id, "m1", Outcome::Yes, OrderSide::Sell, price, size, StrategyKind::MarketMaking, Utc::now())
    }

    fn make_market() -> Market {
        Market {
            id: "m1".into(),
            question: "Q?".into(),
            yes_token: "yes".into(),
            no_token: "no".into(),
            tick_size: 0.01,
            end_date: None,
            created_at: None,
        }
    }

    #[tokio::test]
    async fn fifo_round_trip_realizes_price_difference() {
        let ledger = InventoryLedger::new();
        let journal = EventJournal::disabled();
        ledger.apply_fill(&buy("a:10", 0.40, 10.0), &journal).await.unwrap();
        ledger.apply_fill(&buy("b:10", 0.50, 10.0), &journal).await.unwrap();

        let pos = ledger.position("m1", Outcome::Yes).await.unwrap();
        assert!((pos.avg_entry() - 0.45).abs() < 1e-9);

        // Sells consume the 0.40 lot first
        let res = ledger.apply_fill(&sell("c:15", 0.60, 15.0), &journal).await.unwrap();
        let FillApplied::Applied { realized } = res else {
            panic!("expected applied");
        };
        // 10 * (0.60-0.40) + 5 * (0.60-0.50)
        assert!((realized - 2.5).abs() < 1e-9, "realized {}", realized);
        let pos = ledger.position("m1", Outcome::Yes).await.unwrap();
        assert!((pos.size() - 5.0).abs() < 1e-9);
        assert!((pos.avg_entry() - 0.50).abs() < 1e-9);
    }

    #[tokio::test]
    async fn duplicate_fill_is_ignored() {
        let ledger = InventoryLedger::new();
        let journal = EventJournal::disabled();
        let fill = buy("a:10", 0.40, 10.0);
        ledger.apply_fill(&fill, &journal).await.unwrap();
        assert_eq!(ledger.apply_fill(&fill, &journal).await.unwrap(), FillApplied::Duplicate);
        let pos = ledger.position("m1", Outcome::Yes).await.unwrap();
        assert!((pos.size() - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn oversell_is_capped_at_zero() {
        let ledger = InventoryLedger::new();
        let journal = EventJournal::disabled();
        ledger.apply_fill(&buy("a:5", 0.40, 5.0), &journal).await.unwrap();
        ledger.apply_fill(&sell("b:8", 0.50, 8.0), &journal).await.unwrap();
        let pos = ledger.position("m1", Outcome::Yes).await.unwrap();
        assert_eq!(pos.size(), 0.0);
        assert!((ledger.realized_pnl().await - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn merge_realizes_complete_set_profit() {
        let ledger = InventoryLedger::new();
        let journal = EventJournal::disabled();
        ledger.apply_fill(&buy("a:10", 0.45, 10.0), &journal).await.unwrap();
        let no = make_fill("b:10", "m1", Outcome::No, OrderSide::Buy, 0.50, 10.0, StrategyKind::Arbitrage, Utc::now());
        ledger.apply_fill(&no, &journal).await.unwrap();

        assert!((ledger.merge_preview("m1", 10.0).await - 0.5).abs() < 1e-9);
        let realized = ledger.apply_merge("m1", 10.0, &journal, Utc::now()).await.unwrap();
        assert!((realized - 0.5).abs() < 1e-9);
        assert_eq!(ledger.mergeable_pairs("m1").await, 0.0);
        assert!(ledger.markets().await.is_empty());
    }

    #[tokio::test]
    async fn merge_and_split_are_journaled() {
        let dir = std::env::temp_dir().join(format!("polyhybrid-sets-{}", uuid::Uuid::new_v4()));
        let journal = EventJournal::new(&dir).unwrap();
        let ledger = InventoryLedger::new();
        let now = Utc::now();
        ledger.apply_split("m1", 10.0, &journal, now).await.unwrap();
        let realized = ledger.apply_merge("m1", 10.0, &journal, now).await.unwrap();
        assert!(realized.abs() < 1e-9);

        let path = dir
            .join("sets")
            .join(format!("sets_{}.csv", now.format("%Y-%m-%d")));
        let content = std::fs::read_to_string(&path).unwrap();
        let rows: Vec<&str> = content.lines().skip(1).collect();
        assert_eq!(rows.len(), 2, "{}", content);
        assert!(rows[0].contains(",split,m1,"));
        assert!(rows[1].contains(",merge,m1,"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn seen_fill_ids_are_bounded() {
        let mut state = LedgerState::default();
        for i in 0..MAX_SEEN_FILLS + 5 {
            state.remember_fill(&format!("f{}", i));
        }
        state.remember_fill("f10");
        assert_eq!(state.seen_fills.len(), MAX_SEEN_FILLS);
        assert_eq!(state.seen_order.len(), MAX_SEEN_FILLS);
        assert!(!state.seen_fills.contains("f0"));
        assert!(state.seen_fills.contains(&format!("f{}", MAX_SEEN_FILLS + 4)));

        // Restoring keeps the newest ids in order
        let ledger = InventoryLedger::from_snapshot(LedgerSnapshot {
            seen_fills: state.seen_order.iter().cloned().collect(),
            ..LedgerSnapshot::default()
        });
        let snapshot = ledger.snapshot().await;
        assert_eq!(snapshot.seen_fills.first().map(String::as_str), Some("f5"));
        assert_eq!(snapshot.seen_fills.len(), MAX_SEEN_FILLS);
    }

    #[tokio::test]
    async fn split_adds_half_priced_lots() {
        let ledger = InventoryLedger::new();
        ledger
            .apply_split("m1", 20.0, &EventJournal::disabled(), Utc::now())
            .await
            .unwrap();
        let signal = ledger.signal("m1").await;
        assert_eq!(signal.yes_shares, 20.0);
        assert_eq!(signal.no_shares, 20.0);
        assert!((signal.exposure_usd - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn reconcile_corrects_to_exchange_and_is_idempotent() {
        let ledger = InventoryLedger::new();
        let journal = EventJournal::disabled();
        ledger.apply_fill(&buy("a:10", 0.40, 10.0), &journal).await.unwrap();

        let gateway = PaperGateway::new(100.0);
        gateway.credit_tokens("yes", 7.0);
        let markets = vec![make_market()];

        let first = ledger.reconcile(&gateway, &markets, &journal, Utc::now()).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].exchange_size, 7.0);
        let after_first = ledger.snapshot().await;

        let second = ledger.reconcile(&gateway, &markets, &journal, Utc::now()).await;
        assert!(second.is_empty());
        assert_eq!(ledger.snapshot().await, after_first);
    }

    #[tokio::test]
    async fn reconcile_skips_unknown_balances() {
        let ledger = InventoryLedger::new();
        let journal = EventJournal::disabled();
        ledger.apply_fill(&buy("a:10", 0.40, 10.0), &journal).await.unwrap();
        let gateway = PaperGateway::new(100.0);
        gateway.inject_transient_failures(10);
        let divergences = ledger.reconcile(&gateway, &[make_market()], &journal, Utc::now()).await;
        assert!(divergences.is_empty());
        let pos = ledger.position("m1", Outcome::Yes).await.unwrap();
        assert_eq!(pos.size(), 10.0);
    }

    #[tokio::test]
    async fn snapshot_restores_state() {
        let ledger = InventoryLedger::new();
        let journal = EventJournal::disabled();
        ledger.apply_fill(&buy("a:10", 0.40, 10.0), &journal).await.unwrap();
        let snap = ledger.snapshot().await;
        let restored = InventoryLedger::from_snapshot(snap.clone());
        assert_eq!(restored.snapshot().await, snap);
        // Seen fill ids survive the restore
        assert_eq!(
            restored.apply_fill(&buy("a:10", 0.40, 10.0), &journal).await.unwrap(),
            FillApplied::Duplicate
        );
    }

    #[tokio::test]
    async fn unwind_flags() {
        let ledger = InventoryLedger::new();
        let journal = EventJournal::disabled();
        let t0 = Utc::now() - chrono::Duration::hours(12);
        let fill = make_fill("a:50", "m1", Outcome::Yes, OrderSide::Buy, 0.50, 50.0, StrategyKind::MarketMaking, t0);
        ledger.apply_fill(&fill, &journal).await.unwrap();
        assert!(ledger.needs_unwind("m1", 25.0, 0.8).await);
        let urgency = ledger.unwind_urgency("m1", 24.0, Utc::now()).await;
        assert!((urgency - 0.5).abs() < 0.01, "urgency {}", urgency);
    }
}
