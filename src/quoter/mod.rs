//! Quote lifecycle for market making
//!
//! Owns every resting MM order: places proposals with post-only discipline,
//! cancels and requotes with anti-churn rules, polls the exchange for
//! matched size and hands new fills to the inventory ledger. A quote's
//! `size_matched` only advances after the ledger (and its journal row)
//! committed the fill, so a crash in between is replayed by the next poll
//! and deduplicated by fill id.

pub mod state;

pub use state::{InvalidTransition, Quote, QuoteState};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::config::QuoterConfig;
use crate::error::GatewayError;
use crate::gateway::{ExecutionGateway, OrderRequest};
use crate::inventory::{FillApplied, InventoryLedger};
use crate::persistence::EventJournal;
use crate::pricing::{ProposedOrder, QuoteProposal, SideSet};
use crate::types::{clamp_price, round_to_tick, Fill, Market, OrderBook, OrderSide, Outcome, StrategyKind};

/// Cooldown after `streak` consecutive crossing rejects; 0 below the threshold
pub fn cross_cooldown_secs(streak: u32, config: &QuoterConfig) -> i64 {
    let threshold = config.cross_reject_threshold.max(1);
    if streak < threshold {
        return 0;
    }
    let level = 1 + (streak - threshold) / threshold;
    let factor = 1i64 << (level - 1).min(20);
    config
        .cross_cooldown_base_secs
        .saturating_mul(factor)
        .min(config.cross_cooldown_max_secs)
}

/// Keep both sides maker-only against the current top of book.
///
/// `bid <= best_ask - tick`, `ask >= best_bid + tick`. If that collapses the
/// pair, fall back to the touch, then to `mid ± 1 tick`.
pub fn sanitize_post_only(proposal: &mut QuoteProposal, book: &OrderBook, tick: f64) {
    let best_bid = book.best_bid().map(|l| l.price);
    let best_ask = book.best_ask().map(|l| l.price);

    if let (Some(bid), Some(a)) = (proposal.bid.as_mut(), best_ask) {
        bid.price = bid.price.min(clamp_price(round_to_tick(a - tick, tick)));
        bid.price = clamp_price(round_to_tick(bid.price, tick));
    }
    if let (Some(ask), Some(b)) = (proposal.ask.as_mut(), best_bid) {
        ask.price = ask.price.max(clamp_price(round_to_tick(b + tick, tick)));
        ask.price = clamp_price(round_to_tick(ask.price, tick));
    }

    let (Some(bid), Some(ask)) = (proposal.bid.as_mut(), proposal.ask.as_mut()) else {
        return;
    };
    if bid.price < ask.price {
        return;
    }
    match (best_bid, best_ask) {
        (Some(b), Some(a)) if a > b => {
            bid.price = clamp_price(round_to_tick(b, tick));
            ask.price = clamp_price(round_to_tick(a, tick));
            if bid.price >= ask.price {
                bid.price = clamp_price(round_to_tick(ask.price - tick, tick));
            }
        }
        _ => {
            let mid = (bid.price + ask.price) / 2.0;
            bid.price = clamp_price(round_to_tick(mid - tick, tick));
            ask.price = clamp_price(round_to_tick(mid + tick, tick));
            if bid.price >= ask.price {
                ask.price = clamp_price(round_to_tick(bid.price + tick, tick));
            }
        }
    }
}

fn more_passive(side: OrderSide, price: f64, tick: f64) -> f64 {
    let next = match side {
        OrderSide::Buy => price - tick,
        OrderSide::Sell => price + tick,
    };
    clamp_price(round_to_tick(next, tick))
}

#[derive(Debug, Default)]
struct MarketQuotes {
    bid: Option<Quote>,
    ask: Option<Quote>,
    cross_streak: u32,
    cooldown_until: Option<DateTime<Utc>>,
}

impl MarketQuotes {
    fn resting(&self) -> impl Iterator<Item = &Quote> {
        self.bid
            .iter()
            .chain(self.ask.iter())
            .filter(|q| q.state.is_resting())
    }

    fn sides(&self) -> SideSet {
        SideSet {
            bid: self.bid.as_ref().is_some_and(|q| q.state.is_resting()),
            ask: self.ask.as_ref().is_some_and(|q| q.state.is_resting()),
        }
    }

    fn slot(&mut self, side: OrderSide) -> &mut Option<Quote> {
        match side {
            OrderSide::Buy => &mut self.bid,
            OrderSide::Sell => &mut self.ask,
        }
    }
}

/// What happened to one side in a placement attempt
#[derive(Debug, Clone, PartialEq)]
pub enum SideOutcome {
    Placed { order_id: String, price: f64 },
    Kept,
    Cancelled,
    Rejected(String),
    /// Still crossing after every passive reprice
    CrossRejected,
    /// Transport failure; order state unknown until reconciliation
    Failed(String),
    Idle,
}

/// Summary of one market's quoting pass
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub bid: SideOutcome,
    pub ask: SideOutcome,
    pub cooldown_secs: i64,
}

impl CycleReport {
    fn idle() -> Self {
        Self {
            bid: SideOutcome::Idle,
            ask: SideOutcome::Idle,
            cooldown_secs: 0,
        }
    }

    pub fn placed(&self) -> usize {
        [&self.bid, &self.ask]
            .iter()
            .filter(|o| matches!(o, SideOutcome::Placed { .. }))
            .count()
    }
}

pub struct Quoter {
    config: QuoterConfig,
    post_only: bool,
    markets: HashMap<String, MarketQuotes>,
    /// Cancelled quotes kept until a final poll settles late fills
    retired: Vec<Quote>,
}

impl Quoter {
    pub fn new(config: QuoterConfig, post_only: bool) -> Self {
        Self {
            config,
            post_only,
            markets: HashMap::new(),
            retired: Vec::new(),
        }
    }

    pub fn is_cooling_down(&self, market_id: &str, now: DateTime<Utc>) -> bool {
        self.markets
            .get(market_id)
            .and_then(|m| m.cooldown_until)
            .is_some_and(|until| now < until)
    }

    pub fn cross_streak(&self, market_id: &str) -> u32 {
        self.markets.get(market_id).map_or(0, |m| m.cross_streak)
    }

    pub fn quotes(&self, market_id: &str) -> Vec<Quote> {
        self.markets
            .get(market_id)
            .map(|m| m.bid.iter().chain(m.ask.iter()).cloned().collect())
            .unwrap_or_default()
    }

    /// Markets with at least one resting quote
    pub fn active_markets(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .markets
            .iter()
            .filter(|(_, m)| m.resting().next().is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// USDC reserved by resting bids
    pub fn locked_capital(&self) -> f64 {
        self.markets
            .values()
            .flat_map(|m| m.resting())
            .map(Quote::locked_capital)
            .sum()
    }

    /// Order ids this quoter is tracking, resting or retired
    pub fn known_order_ids(&self) -> HashSet<String> {
        self.markets
            .values()
            .flat_map(|m| m.bid.iter().chain(m.ask.iter()))
            .chain(self.retired.iter())
            .filter_map(|q| q.order_id.clone())
            .collect()
    }

    /// Anti-churn gate: young quotes are never replaced; otherwise requote on a
    /// side-set change or a mid move of at least the threshold.
    pub fn should_requote(
        &self,
        market_id: &str,
        wanted: SideSet,
        mid: f64,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(entry) = self.markets.get(market_id) else {
            return true;
        };
        let mut resting = entry.resting().peekable();
        if resting.peek().is_none() {
            return true;
        }
        let resting: Vec<&Quote> = resting.collect();
        if resting
            .iter()
            .any(|q| q.age_secs(now) < self.config.min_quote_lifetime_secs)
        {
            return false;
        }
        if entry.sides() != wanted {
            return true;
        }
        resting
            .iter()
            .any(|q| (mid - q.quoted_mid).abs() * 100.0 >= self.config.requote_threshold_pts - 1e-9)
    }

    /// Bring a market's resting quotes in line with `proposal`
    pub async fn apply(
        &mut self,
        gateway: &dyn ExecutionGateway,
        market: &Market,
        proposal: &QuoteProposal,
        now: DateTime<Utc>,
    ) -> CycleReport {
        if self.is_cooling_down(&market.id, now) {
            debug!(market = %market.id, "Cross-reject cooldown active, skipping");
            return CycleReport::idle();
        }
        let tick = market.tick();
        let mut report = CycleReport::idle();

        for (side, wanted) in [(OrderSide::Buy, proposal.bid), (OrderSide::Sell, proposal.ask)] {
            let outcome = self
                .apply_side(gateway, market, proposal, side, wanted, tick, now)
                .await;
            match side {
                OrderSide::Buy => report.bid = outcome,
                OrderSide::Sell => report.ask = outcome,
            }
        }

        let crossed = report.bid == SideOutcome::CrossRejected || report.ask == SideOutcome::CrossRejected;
        let entry = self.markets.entry(market.id.clone()).or_default();
        if crossed {
            entry.cross_streak += 1;
            let secs = cross_cooldown_secs(entry.cross_streak, &self.config);
            if secs > 0 {
                let until = now + Duration::seconds(secs);
                entry.cooldown_until = Some(entry.cooldown_until.map_or(until, |u| u.max(until)));
                warn!(
                    market = %market.id,
                    streak = entry.cross_streak,
                    cooldown_secs = secs,
                    "Cross-reject cooldown set"
                );
            }
            report.cooldown_secs = secs;
        } else if report.placed() > 0 {
            entry.cross_streak = 0;
            entry.cooldown_until = None;
        }
        report
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_side(
        &mut self,
        gateway: &dyn ExecutionGateway,
        market: &Market,
        proposal: &QuoteProposal,
        side: OrderSide,
        wanted: Option<ProposedOrder>,
        tick: f64,
        now: DateTime<Utc>,
    ) -> SideOutcome {
        let existing = self
            .markets
            .entry(market.id.clone())
            .or_default()
            .slot(side)
            .take();

        if let Some(mut quote) = existing {
            if quote.state.is_resting() {
                let keep = match wanted {
                    Some(order) => {
                        let moved = (quote.price - order.price).abs();
                        // Hanging partial: leave it resting unless the price moved half a tick
                        (quote.state == QuoteState::Partial && moved < tick / 2.0)
                            || (moved < 1e-9 && (quote.size - order.size).abs() < 1e-9)
                    }
                    None => false,
                };
                if keep {
                    self.put(&market.id, side, quote);
                    return SideOutcome::Kept;
                }
                if !self.cancel_quote(gateway, &mut quote, now).await {
                    self.put(&market.id, side, quote);
                    return SideOutcome::Failed("cancel failed".to_string());
                }
                self.retired.push(quote);
                if wanted.is_none() {
                    return SideOutcome::Cancelled;
                }
            }
        }

        let Some(order) = wanted else {
            return SideOutcome::Idle;
        };
        let (outcome, quote) = self
            .place_side(gateway, market, &proposal.token_id, side, order, proposal.quote.mid, tick, now)
            .await;
        if let Some(quote) = quote {
            self.put(&market.id, side, quote);
        }
        outcome
    }

    fn put(&mut self, market_id: &str, side: OrderSide, quote: Quote) {
        *self
            .markets
            .entry(market_id.to_string())
            .or_default()
            .slot(side) = Some(quote);
    }

    /// Place one side, stepping one tick more passive on each crossing reject
    #[allow(clippy::too_many_arguments)]
    async fn place_side(
        &self,
        gateway: &dyn ExecutionGateway,
        market: &Market,
        token_id: &str,
        side: OrderSide,
        order: ProposedOrder,
        mid: f64,
        tick: f64,
        now: DateTime<Utc>,
    ) -> (SideOutcome, Option<Quote>) {
        let outcome = market.outcome_of(token_id).unwrap_or(Outcome::Yes);
        let mut price = order.price;

        for attempt in 0..=self.config.max_reprice_ticks {
            let mut quote = Quote::proposed(&market.id, token_id, outcome, side, price, order.size, mid, now);
            let request = OrderRequest {
                market_id: market.id.clone(),
                token_id: token_id.to_string(),
                outcome,
                side,
                price,
                size: order.size,
                post_only: self.post_only,
                tick_size: tick,
                strategy: StrategyKind::MarketMaking,
            };

            match gateway.place_order(&request).await {
                Ok(placed) => {
                    quote.order_id = Some(placed.order_id.clone());
                    if let Err(err) = quote.transition(QuoteState::Live, now) {
                        warn!(error = %err, "Quote transition failed after placement");
                    }
                    info!(
                        market = %market.id,
                        side = %side,
                        price,
                        size = order.size,
                        reprices = attempt,
                        order_id = %placed.order_id,
                        "📗 Quote live"
                    );
                    return (
                        SideOutcome::Placed {
                            order_id: placed.order_id,
                            price,
                        },
                        Some(quote),
                    );
                }
                Err(err) if err.is_cross_reject() => {
                    let next = more_passive(side, price, tick);
                    debug!(market = %market.id, side = %side, price, next, "Post-only cross, repricing");
                    if (next - price).abs() < 1e-9 {
                        break;
                    }
                    price = next;
                }
                Err(GatewayError::Rejected(reason)) => {
                    let _ = quote.transition(QuoteState::Rejected, now);
                    warn!(market = %market.id, side = %side, price, reason = %reason, "Quote rejected");
                    return (SideOutcome::Rejected(reason), None);
                }
                Err(err) => {
                    warn!(market = %market.id, side = %side, error = %err, "Quote placement failed");
                    return (SideOutcome::Failed(err.to_string()), None);
                }
            }
        }

        warn!(
            market = %market.id,
            side = %side,
            max_reprice_ticks = self.config.max_reprice_ticks,
            "Quote still crossing after reprices"
        );
        (SideOutcome::CrossRejected, None)
    }

    /// Cancel one quote on the exchange. An order the exchange no longer
    /// knows counts as cancelled.
    async fn cancel_quote(&self, gateway: &dyn ExecutionGateway, quote: &mut Quote, now: DateTime<Utc>) -> bool {
        if let Some(order_id) = quote.order_id.clone() {
            match gateway.cancel_order(&order_id).await {
                Ok(()) | Err(GatewayError::NotFound(_)) => {}
                Err(err) => {
                    warn!(order_id = %order_id, error = %err, "Cancel failed");
                    return false;
                }
            }
        }
        if let Err(err) = quote.transition(QuoteState::Cancelled, now) {
            debug!(error = %err, "Cancel on non-resting quote");
        }
        true
    }

    /// Cancel both sides of a market and forget its cooldown state
    pub async fn cancel_market(
        &mut self,
        gateway: &dyn ExecutionGateway,
        market_id: &str,
        now: DateTime<Utc>,
    ) -> usize {
        let Some(mut entry) = self.markets.remove(market_id) else {
            return 0;
        };
        let mut cancelled = 0;
        for slot in [&mut entry.bid, &mut entry.ask] {
            let Some(mut quote) = slot.take() else {
                continue;
            };
            if !quote.state.is_resting() {
                continue;
            }
            if self.cancel_quote(gateway, &mut quote, now).await {
                cancelled += 1;
                self.retired.push(quote);
            } else {
                *slot = Some(quote);
            }
        }
        if entry.bid.is_some() || entry.ask.is_some() {
            // Keep what could not be cancelled so the next pass retries it
            self.markets.insert(market_id.to_string(), entry);
        }
        if cancelled > 0 {
            info!(market = %market_id, cancelled, "Market quotes cancelled");
        }
        cancelled
    }

    /// Cancel every resting bid. Asks only shrink inventory and may stay.
    pub async fn cancel_exposure_increasing(
        &mut self,
        gateway: &dyn ExecutionGateway,
        now: DateTime<Utc>,
    ) -> usize {
        let ids: Vec<String> = self.markets.keys().cloned().collect();
        let mut cancelled = 0;
        for market_id in ids {
            let Some(mut quote) = self
                .markets
                .get_mut(&market_id)
                .and_then(|m| m.bid.take())
            else {
                continue;
            };
            if quote.state.is_resting() && !self.cancel_quote(gateway, &mut quote, now).await {
                self.put(&market_id, OrderSide::Buy, quote);
                continue;
            }
            if quote.state == QuoteState::Cancelled {
                cancelled += 1;
                self.retired.push(quote);
            }
        }
        cancelled
    }

    /// Exchange-wide cancel. Local quotes are retired only when the exchange confirms.
    pub async fn cancel_all(
        &mut self,
        gateway: &dyn ExecutionGateway,
        now: DateTime<Utc>,
    ) -> Result<usize, GatewayError> {
        gateway.cancel_all().await?;
        let mut cancelled = 0;
        for (_, mut entry) in self.markets.drain() {
            for slot in [entry.bid.take(), entry.ask.take()] {
                let Some(mut quote) = slot else { continue };
                if quote.state.is_resting() {
                    let _ = quote.transition(QuoteState::Cancelled, now);
                    cancelled += 1;
                    self.retired.push(quote);
                }
            }
        }
        info!(cancelled, "All quotes cancelled");
        Ok(cancelled)
    }

    /// Poll every tracked order for newly matched size.
    ///
    /// Each new fill goes through the ledger (which journals it) before the
    /// quote acknowledges it. A ledger error stops the poll; the fill is seen
    /// again next time and deduplicated by id.
    pub async fn poll_fills(
        &mut self,
        gateway: &dyn ExecutionGateway,
        ledger: &InventoryLedger,
        journal: &EventJournal,
        now: DateTime<Utc>,
    ) -> Result<Vec<Fill>> {
        let mut fills = Vec::new();
        let mut settled: HashSet<String> = HashSet::new();

        let mut tracked: Vec<&mut Quote> = Vec::new();
        for entry in self.markets.values_mut() {
            tracked.extend(entry.bid.as_mut());
            tracked.extend(entry.ask.as_mut());
        }
        tracked.extend(self.retired.iter_mut());

        for quote in tracked {
            let Some(order_id) = quote.order_id.clone() else {
                continue;
            };
            if quote.state.is_terminal() {
                continue;
            }
            let report = match gateway.get_order(&order_id).await {
                Ok(report) => report,
                Err(GatewayError::NotFound(_)) if quote.state == QuoteState::Cancelled => {
                    settled.insert(order_id);
                    continue;
                }
                Err(err) => {
                    debug!(order_id = %order_id, error = %err, "Order status unavailable");
                    continue;
                }
            };

            if let Some(fill) = quote.pending_fill(report.size_matched, now) {
                let applied = ledger.apply_fill(&fill, journal).await?;
                if let Err(err) = quote.acknowledge_fill(report.size_matched, now) {
                    warn!(order_id = %order_id, error = %err, "Fill on unexpected quote state");
                    quote.size_matched = report.size_matched.min(quote.size);
                }
                if applied != FillApplied::Duplicate {
                    info!(
                        market = %fill.market_id,
                        side = %fill.side,
                        price = fill.price,
                        size = fill.size,
                        "💰 Quote fill"
                    );
                    fills.push(fill);
                }
            }

            match QuoteState::from_exchange_status(&report.status) {
                Some(QuoteState::Cancelled) if quote.state.is_resting() => {
                    info!(order_id = %order_id, "Quote cancelled by exchange");
                    let _ = quote.transition(QuoteState::Cancelled, now);
                }
                Some(QuoteState::Filled) if quote.state != QuoteState::Filled => {
                    debug!(order_id = %order_id, "Exchange reports filled before size caught up");
                }
                _ => {}
            }
            if quote.state == QuoteState::Cancelled && !report.is_open() {
                settled.insert(order_id);
            }
        }

        self.retired.retain(|q| {
            !q.state.is_terminal()
                && !q.order_id.as_ref().is_some_and(|id| settled.contains(id))
        });
        for entry in self.markets.values_mut() {
            for slot in [&mut entry.bid, &mut entry.ask] {
                if slot.as_ref().is_some_and(|q| !q.state.is_resting()) {
                    let quote = slot.take();
                    if let Some(q) = quote.filter(|q| q.state == QuoteState::Cancelled) {
                        if !q.order_id.as_ref().is_some_and(|id| settled.contains(id)) {
                            self.retired.push(q);
                        }
                    }
                }
            }
        }
        Ok(fills)
    }

    /// Cancel exchange orders nobody tracks. `others` lists ids owned by
    /// other strategies (directional entries) that must be left alone.
    pub async fn cancel_orphans(
        &mut self,
        gateway: &dyn ExecutionGateway,
        others: &HashSet<String>,
    ) -> Result<usize, GatewayError> {
        let known = self.known_order_ids();
        let open = gateway.get_open_orders().await?;
        let mut cancelled = 0;
        for order in open {
            if known.contains(&order.order_id) || others.contains(&order.order_id) {
                continue;
            }
            match gateway.cancel_order(&order.order_id).await {
                Ok(()) | Err(GatewayError::NotFound(_)) => {
                    warn!(order_id = %order.order_id, token = %order.token_id, "Orphan order cancelled");
                    cancelled += 1;
                }
                Err(err) => warn!(order_id = %order.order_id, error = %err, "Orphan cancel failed"),
            }
        }
        Ok(cancelled)
    }

    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::PaperGateway;
    use crate::pricing::PriceQuote;
    use crate::types::BookLevel;

    fn make_market() -> Market {
        Market {
            id: "m1".into(),
            question: "Will it rain?".into(),
            yes_token: "yes".into(),
            no_token: "no".into(),
            tick_size: 0.01,
            end_date: None,
            created_at: None,
        }
    }

    fn make_book(bid: f64, ask: f64) -> OrderBook {
        OrderBook::new(
            "yes",
            vec![BookLevel::new(bid, 100.0)],
            vec![BookLevel::new(ask, 100.0)],
        )
    }

    fn make_proposal(bid: Option<f64>, ask: Option<f64>, mid: f64) -> QuoteProposal {
        QuoteProposal {
            market_id: "m1".into(),
            token_id: "yes".into(),
            quote: PriceQuote {
                bid: bid.unwrap_or(mid - 0.02),
                ask: ask.unwrap_or(mid + 0.02),
                mid,
                reservation: mid,
                half_spread_pts: 2.0,
            },
            bid: bid.map(|price| ProposedOrder { price, size: 10.0 }),
            ask: ask.map(|price| ProposedOrder { price, size: 10.0 }),
            reduce_only: false,
        }
    }

    #[test]
    fn cooldown_grows_exponentially_and_caps() {
        let cfg = QuoterConfig::default();
        assert_eq!(cross_cooldown_secs(2, &cfg), 0);
        assert_eq!(cross_cooldown_secs(3, &cfg), 300);
        assert_eq!(cross_cooldown_secs(5, &cfg), 300);
        assert_eq!(cross_cooldown_secs(6, &cfg), 600);
        assert_eq!(cross_cooldown_secs(9, &cfg), 1200);
        assert_eq!(cross_cooldown_secs(12, &cfg), 1800);
        assert_eq!(cross_cooldown_secs(60, &cfg), 1800);
    }

    #[test]
    fn sanitize_keeps_quotes_passive() {
        let book = make_book(0.50, 0.52);
        let mut p = make_proposal(Some(0.53), Some(0.49), 0.51);
        sanitize_post_only(&mut p, &book, 0.01);
        let (bid, ask) = (p.bid.unwrap().price, p.ask.unwrap().price);
        assert!(bid < ask, "bid {} ask {}", bid, ask);
        assert!(bid <= 0.51 + 1e-9);
        assert!(ask >= 0.51 - 1e-9);

        let mut p = make_proposal(Some(0.55), None, 0.51);
        sanitize_post_only(&mut p, &book, 0.01);
        assert!((p.bid.unwrap().price - 0.51).abs() < 1e-9);
    }

    #[tokio::test]
    async fn places_and_tracks_locked_capital() {
        let gateway = PaperGateway::new(100.0);
        gateway.credit_tokens("yes", 20.0);
        gateway.set_book(make_book(0.45, 0.55));
        let mut quoter = Quoter::new(QuoterConfig::default(), true);
        let now = Utc::now();

        let report = quoter
            .apply(&gateway, &make_market(), &make_proposal(Some(0.48), Some(0.52), 0.50), now)
            .await;
        assert_eq!(report.placed(), 2);
        assert_eq!(gateway.open_order_count(), 2);
        assert!((quoter.locked_capital() - 4.8).abs() < 1e-9);
        assert_eq!(quoter.active_markets(), vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn crossing_bid_is_repriced_passive() {
        let gateway = PaperGateway::new(100.0);
        gateway.set_book(make_book(0.45, 0.50));
        let mut quoter = Quoter::new(QuoterConfig::default(), true);

        // 0.51 and 0.50 cross the 0.50 ask; 0.49 rests
        let report = quoter
            .apply(&gateway, &make_market(), &make_proposal(Some(0.51), None, 0.48), Utc::now())
            .await;
        match report.bid {
            SideOutcome::Placed { price, .. } => assert!((price - 0.49).abs() < 1e-9),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(quoter.cross_streak("m1"), 0);
    }

    #[tokio::test]
    async fn repeated_cross_rejects_start_cooldown() {
        let gateway = PaperGateway::new(100.0);
        gateway.set_book(make_book(0.40, 0.45));
        let mut quoter = Quoter::new(QuoterConfig::default(), true);
        let now = Utc::now();
        // 0.50 needs five ticks to clear the 0.45 ask; only three allowed
        let proposal = make_proposal(Some(0.50), None, 0.42);
        for _ in 0..3 {
            let report = quoter.apply(&gateway, &make_market(), &proposal, now).await;
            assert_eq!(report.bid, SideOutcome::CrossRejected);
        }
        assert!(quoter.is_cooling_down("m1", now));
        assert!(!quoter.is_cooling_down("m1", now + Duration::seconds(301)));
        let report = quoter.apply(&gateway, &make_market(), &proposal, now).await;
        assert_eq!(report, CycleReport::idle());
    }

    #[tokio::test]
    async fn requote_respects_lifetime_threshold_and_sides() {
        let gateway = PaperGateway::new(100.0);
        gateway.set_book(make_book(0.45, 0.55));
        let mut quoter = Quoter::new(QuoterConfig::default(), true);
        let t0 = Utc::now();
        quoter
            .apply(&gateway, &make_market(), &make_proposal(Some(0.48), None, 0.50), t0)
            .await;

        let bid_only = SideSet { bid: true, ask: false };
        let both = SideSet { bid: true, ask: true };
        // Too young even for a big move
        assert!(!quoter.should_requote("m1", bid_only, 0.60, t0 + Duration::seconds(5)));
        let later = t0 + Duration::seconds(15);
        assert!(!quoter.should_requote("m1", bid_only, 0.502, later));
        assert!(quoter.should_requote("m1", bid_only, 0.505, later));
        assert!(quoter.should_requote("m1", both, 0.50, later));
        assert!(quoter.should_requote("other", bid_only, 0.50, later));
    }

    #[tokio::test]
    async fn fills_flow_into_ledger_once() {
        let gateway = PaperGateway::new(100.0);
        gateway.set_book(make_book(0.45, 0.55));
        let ledger = InventoryLedger::new();
        let journal = EventJournal::disabled();
        let mut quoter = Quoter::new(QuoterConfig::default(), true);
        let now = Utc::now();
        quoter
            .apply(&gateway, &make_market(), &make_proposal(Some(0.48), None, 0.50), now)
            .await;

        assert_eq!(gateway.simulate_taker("yes", OrderSide::Sell, 0.48, 4.0), 4.0);
        let fills = quoter.poll_fills(&gateway, &ledger, &journal, now).await.unwrap();
        assert_eq!(fills.len(), 1);
        assert!((fills[0].size - 4.0).abs() < 1e-9);
        assert_eq!(quoter.quotes("m1")[0].state, QuoteState::Partial);

        // Nothing new: no duplicate
        let fills = quoter.poll_fills(&gateway, &ledger, &journal, now).await.unwrap();
        assert!(fills.is_empty());
        let pos = ledger.position("m1", Outcome::Yes).await.unwrap();
        assert!((pos.size() - 4.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn late_fill_on_cancelled_quote_is_booked() {
        let gateway = PaperGateway::new(100.0);
        gateway.set_book(make_book(0.45, 0.55));
        let ledger = InventoryLedger::new();
        let journal = EventJournal::disabled();
        let mut quoter = Quoter::new(QuoterConfig::default(), true);
        let now = Utc::now();
        quoter
            .apply(&gateway, &make_market(), &make_proposal(Some(0.48), None, 0.50), now)
            .await;

        // Fill lands on the exchange, then we cancel before polling
        gateway.simulate_taker("yes", OrderSide::Sell, 0.48, 3.0);
        assert_eq!(quoter.cancel_market(&gateway, "m1", now).await, 1);
        assert_eq!(quoter.retired_count(), 1);

        let fills = quoter.poll_fills(&gateway, &ledger, &journal, now).await.unwrap();
        assert_eq!(fills.len(), 1);
        assert!((ledger.position("m1", Outcome::Yes).await.unwrap().size() - 3.0).abs() < 1e-9);
        assert_eq!(quoter.retired_count(), 0);
    }

    #[tokio::test]
    async fn cancel_exposure_increasing_leaves_asks() {
        let gateway = PaperGateway::new(100.0);
        gateway.credit_tokens("yes", 20.0);
        gateway.set_book(make_book(0.45, 0.55));
        let mut quoter = Quoter::new(QuoterConfig::default(), true);
        let now = Utc::now();
        quoter
            .apply(&gateway, &make_market(), &make_proposal(Some(0.48), Some(0.52), 0.50), now)
            .await;
        assert_eq!(quoter.cancel_exposure_increasing(&gateway, now).await, 1);
        assert_eq!(gateway.open_order_count(), 1);
        assert_eq!(quoter.locked_capital(), 0.0);
    }

    #[tokio::test]
    async fn orphan_orders_are_cancelled() {
        let gateway = PaperGateway::new(100.0);
        gateway.set_book(make_book(0.45, 0.55));
        let request = OrderRequest {
            market_id: "m1".into(),
            token_id: "yes".into(),
            outcome: Outcome::Yes,
            side: OrderSide::Buy,
            price: 0.40,
            size: 10.0,
            post_only: true,
            tick_size: 0.01,
            strategy: StrategyKind::MarketMaking,
        };
        let orphan = gateway.place_order(&request).await.unwrap();
        let directional = gateway.place_order(&request).await.unwrap();

        let mut quoter = Quoter::new(QuoterConfig::default(), true);
        let others: HashSet<String> = [directional.order_id.clone()].into_iter().collect();
        assert_eq!(quoter.cancel_orphans(&gateway, &others).await.unwrap(), 1);
        let open = gateway.get_open_orders().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].order_id, directional.order_id);
        assert_ne!(orphan.order_id, directional.order_id);
    }
}
