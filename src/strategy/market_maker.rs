//! Market-making loop
//!
//! One pass per cycle:
//! 1. poll quote fills into the ledger and feed the per-market breakers
//! 2. for every quoting market: book, trackers, arbitrage scan, pricing,
//!    post-only sanitize, risk gate, requote
//! 3. pull quotes from markets that dropped out of the universe

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::{debug, info, warn};

use super::StrategyContext;
use crate::arbitrage::ArbitrageDetector;
use crate::config::PricingModel;
use crate::pricing::{weighted_mid, KappaEstimator, PricingEngine, PricingInputs, StaleTracker, VolTracker, DEPTH_LEVELS};
use crate::quoter::sanitize_post_only;
use crate::risk::{CapitalBudget, RiskManager, RiskVerdict};
use crate::types::{Fill, Market, OrderSide, Outcome};

/// What one pass did, for logging and tests
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MmCycleSummary {
    pub markets_seen: usize,
    pub quotes_placed: usize,
    pub fills: usize,
    pub rejected: usize,
    pub arbitrages: usize,
}

pub struct MarketMaker {
    engine: PricingEngine,
    arbitrage: ArbitrageDetector,
    vol: VolTracker,
    stale: StaleTracker,
    kappa: KappaEstimator,
    max_delta_pts: f64,
}

impl MarketMaker {
    pub fn from_context(ctx: &StrategyContext) -> Self {
        let pricing = &ctx.config.pricing;
        let max_delta_pts = match pricing.model {
            PricingModel::Legacy => pricing.delta_max_pts,
            PricingModel::AvellanedaStoikov => pricing.as_max_spread_pts / 2.0,
        };
        info!(model = %pricing.model, max_delta_pts, "📗 Market maker ready");
        Self {
            engine: PricingEngine::from_config(pricing, &ctx.config.mm),
            arbitrage: ArbitrageDetector::new(ctx.config.arbitrage.clone()),
            vol: VolTracker::new(pricing.vol_halflife),
            stale: StaleTracker::new(pricing.stale_threshold_secs),
            kappa: KappaEstimator::new(pricing.as_kappa_window_mins, pricing.as_default_kappa),
            max_delta_pts,
        }
    }

    pub async fn run_cycle(&mut self, ctx: &StrategyContext, now: DateTime<Utc>) -> Result<MmCycleSummary> {
        let mut summary = MmCycleSummary::default();

        let fills = {
            let mut quoter = ctx.quoter.lock().await;
            quoter
                .poll_fills(ctx.gateway.as_ref(), &ctx.ledger, &ctx.journal, now)
                .await?
        };
        summary.fills = fills.len();
        for fill in &fills {
            self.on_fill(ctx, fill, now).await;
        }

        if ctx.risk.is_paused() {
            debug!("Trading paused, quoting skipped");
            return Ok(summary);
        }

        let mut markets = match ctx.markets.quoting_markets().await {
            Ok(markets) => markets,
            Err(err) => {
                warn!(error = %err, "Market universe unavailable, keeping current quotes");
                return Ok(summary);
            }
        };
        let mut limit = ctx.config.mm.max_markets;
        if ctx.risk.is_reduce_mode() {
            limit = (limit / 2).max(1);
        }
        markets.truncate(limit);
        ctx.remember_markets(markets.iter()).await;
        summary.markets_seen = markets.len();

        for market in &markets {
            match self.quote_market(ctx, market, now).await {
                Ok(step) => {
                    summary.quotes_placed += step.placed;
                    summary.rejected += usize::from(step.rejected);
                    summary.arbitrages += usize::from(step.arbitrage);
                }
                Err(err) => warn!(market = %market.id, error = %err, "Quoting pass failed"),
            }
        }

        let listed: HashSet<&str> = markets.iter().map(|m| m.id.as_str()).collect();
        let mut quoter = ctx.quoter.lock().await;
        for stale in quoter.active_markets() {
            if !listed.contains(stale.as_str()) {
                let cancelled = quoter.cancel_market(ctx.gateway.as_ref(), &stale, now).await;
                info!(market = %stale, cancelled, "Market left the universe, quotes pulled");
            }
        }
        Ok(summary)
    }

    /// Feed fill intensity and the adverse-selection breaker
    async fn on_fill(&mut self, ctx: &StrategyContext, fill: &Fill, now: DateTime<Utc>) {
        self.kappa.record_fill(&fill.market_id, fill.timestamp);
        let Some(market) = ctx.known_market(&fill.market_id).await else {
            return;
        };
        let post_fill_mid = match ctx.gateway.get_midpoint(market.token(fill.outcome)).await {
            Ok(mid) => mid,
            Err(err) => {
                debug!(market = %fill.market_id, error = %err, "No post-fill mid, breaker not fed");
                return;
            }
        };
        let adverse = RiskManager::is_adverse(fill.side == OrderSide::Buy, fill.price, post_fill_mid);
        if let Some(event) = ctx.risk.record_fill_outcome(&fill.market_id, adverse, now) {
            ctx.journal_risk(&[event], now).await;
            let mut quoter = ctx.quoter.lock().await;
            quoter.cancel_market(ctx.gateway.as_ref(), &fill.market_id, now).await;
        }
    }

    async fn quote_market(&mut self, ctx: &StrategyContext, market: &Market, now: DateTime<Utc>) -> Result<MarketStep> {
        let mut step = MarketStep::default();
        if ctx.risk.is_market_suspended(&market.id, now) {
            let mut quoter = ctx.quoter.lock().await;
            quoter.cancel_market(ctx.gateway.as_ref(), &market.id, now).await;
            debug!(market = %market.id, "Market suspended, not quoting");
            return Ok(step);
        }

        let book = ctx.gateway.get_book(&market.yes_token).await?;
        let Some(mid) = weighted_mid(&book).or_else(|| book.mid_price()) else {
            debug!(market = %market.id, "One-sided book, skipping");
            return Ok(step);
        };
        let tick = market.tick();
        let vol_pts = self.vol.update(&market.id, mid);
        self.stale.observe(&market.id, mid, now);
        ctx.ledger.mark(&market.id, Outcome::Yes, mid).await;
        ctx.ledger.mark(&market.id, Outcome::No, 1.0 - mid).await;

        let budget = ctx.capital_budget(now).await;
        step.arbitrage = self.scan_arbitrage(ctx, market, &budget, now).await;

        let Some(capital) = budget.available() else {
            debug!(market = %market.id, "Balance unknown, no new quotes");
            return Ok(step);
        };
        let inventory = ctx.ledger.signal(&market.id).await;
        let inputs = PricingInputs {
            mid,
            imbalance: book.imbalance(DEPTH_LEVELS),
            vol_pts,
            staleness: self.stale.staleness(&market.id, now),
            kappa: self.kappa.kappa(&market.id, now),
            net_inventory: inventory.net(),
            max_inventory: if mid > 0.0 { ctx.config.mm.max_per_market_usd / mid } else { 0.0 },
            avg_entry: inventory.yes_avg_entry,
            days_to_resolution: market.days_to_resolution(now),
            tick,
        };

        let mut quoter = ctx.quoter.lock().await;
        let Some(mut proposal) = self.engine.propose(
            &market.id,
            &market.yes_token,
            &inputs,
            &inventory,
            capital,
            ctx.risk.is_reduce_mode(),
        ) else {
            quoter.cancel_market(ctx.gateway.as_ref(), &market.id, now).await;
            return Ok(step);
        };
        sanitize_post_only(&mut proposal, &book, tick);

        if let Some(bid) = proposal.bid {
            let total_exposure = ctx.ledger.total_exposure().await;
            let verdict = ctx
                .risk
                .check_global_exposure(total_exposure, bid.price * bid.size, &budget);
            if let RiskVerdict::Rejected(reason) = verdict {
                debug!(market = %market.id, reason = %reason, "Bid dropped by exposure cap");
                proposal.bid = None;
            }
        }

        let verdict = ctx.risk.validate_quote(
            &market.id,
            proposal.bid.map(|o| o.price),
            proposal.ask.map(|o| o.price),
            proposal.quote.mid,
            self.max_delta_pts,
            now,
        );
        if let RiskVerdict::Rejected(reason) = verdict {
            debug!(market = %market.id, reason = %reason, "Quote rejected by risk");
            step.rejected = true;
            return Ok(step);
        }

        if !quoter.should_requote(&market.id, proposal.sides(), mid, now) {
            return Ok(step);
        }
        let report = quoter.apply(ctx.gateway.as_ref(), market, &proposal, now).await;
        step.placed = report.placed();
        if step.placed > 0 {
            debug!(
                market = %market.id,
                bid = ?proposal.bid.map(|o| o.price),
                ask = ?proposal.ask.map(|o| o.price),
                model = self.engine.model_name(),
                "Quotes refreshed"
            );
        }
        Ok(step)
    }

    async fn scan_arbitrage(
        &self,
        ctx: &StrategyContext,
        market: &Market,
        budget: &CapitalBudget,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.arbitrage.config().enabled || ctx.risk.is_paused() {
            return false;
        }
        let (Ok(yes_book), Ok(no_book)) = (
            ctx.gateway.get_book(&market.yes_token).await,
            ctx.gateway.get_book(&market.no_token).await,
        ) else {
            return false;
        };
        let Ok(opportunity) = self.arbitrage.detect(market, &yes_book, &no_book) else {
            return false;
        };
        let affordable = budget
            .available()
            .is_some_and(|available| opportunity.capital_required() <= available);
        if !affordable {
            debug!(market = %market.id, need = opportunity.capital_required(), "Arbitrage skipped, capital");
            return false;
        }
        match self
            .arbitrage
            .execute(ctx.gateway.as_ref(), &ctx.ledger, &ctx.journal, market, &opportunity, now)
            .await
        {
            Ok(_) => true,
            Err(err) => {
                warn!(market = %market.id, error = %err, "Arbitrage bookkeeping failed");
                false
            }
        }
    }
}

#[derive(Debug, Default)]
struct MarketStep {
    placed: usize,
    rejected: bool,
    arbitrage: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{ExecutionGateway, PaperGateway};
    use crate::markets::StaticMarketSource;
    use crate::spot::FixedSpotFeed;
    use crate::strategy::test_support::*;
    use std::sync::Arc;

    fn setup(markets: Vec<Market>) -> (Arc<PaperGateway>, StrategyContext) {
        let gateway = Arc::new(PaperGateway::new(1_000.0));
        let ctx = make_context(
            gateway.clone(),
            StaticMarketSource::new(markets, vec![]),
            FixedSpotFeed::default(),
            disabled_oracle(),
        );
        (gateway, ctx)
    }

    #[tokio::test]
    async fn quotes_a_bid_on_a_fresh_market() {
        let market = make_market("m1");
        let (gateway, ctx) = setup(vec![market.clone()]);
        gateway.set_book(make_book(&market.yes_token, 0.45, 0.55, 200.0));
        gateway.set_book(make_book(&market.no_token, 0.45, 0.55, 200.0));

        let mut mm = MarketMaker::from_context(&ctx);
        let summary = mm.run_cycle(&ctx, Utc::now()).await.unwrap();
        assert_eq!(summary.markets_seen, 1);
        assert_eq!(summary.quotes_placed, 1, "bid only with flat inventory");
        assert_eq!(gateway.open_order_count(), 1);
        let open = gateway.get_open_orders().await.unwrap();
        assert!(open[0].price < 0.55);
    }

    #[tokio::test]
    async fn paused_risk_places_nothing() {
        let market = make_market("m1");
        let (gateway, ctx) = setup(vec![market.clone()]);
        gateway.set_book(make_book(&market.yes_token, 0.45, 0.55, 200.0));
        ctx.risk.pause_manual(Utc::now());

        let mut mm = MarketMaker::from_context(&ctx);
        let summary = mm.run_cycle(&ctx, Utc::now()).await.unwrap();
        assert_eq!(summary.quotes_placed, 0);
        assert_eq!(gateway.open_order_count(), 0);
    }

    #[tokio::test]
    async fn unknown_balance_places_nothing() {
        let market = make_market("m1");
        let (gateway, ctx) = setup(vec![market.clone()]);
        gateway.set_book(make_book(&market.yes_token, 0.45, 0.55, 200.0));
        gateway.set_balance_unavailable(true);

        let mut mm = MarketMaker::from_context(&ctx);
        let summary = mm.run_cycle(&ctx, Utc::now()).await.unwrap();
        assert_eq!(summary.quotes_placed, 0);
        assert_eq!(gateway.open_order_count(), 0);
    }

    #[tokio::test]
    async fn fill_reaches_ledger() {
        let market = make_market("m1");
        let (gateway, ctx) = setup(vec![market.clone()]);
        gateway.set_book(make_book(&market.yes_token, 0.45, 0.55, 200.0));
        gateway.set_book(make_book(&market.no_token, 0.45, 0.55, 200.0));

        let mut mm = MarketMaker::from_context(&ctx);
        mm.run_cycle(&ctx, Utc::now()).await.unwrap();
        let bid = gateway.get_open_orders().await.unwrap().remove(0);
        let filled = gateway.simulate_taker(&market.yes_token, OrderSide::Sell, bid.price, bid.original_size);
        assert!(filled > 0.0);

        let summary = mm.run_cycle(&ctx, Utc::now()).await.unwrap();
        assert_eq!(summary.fills, 1);
        let yes = ctx.ledger.position("m1", Outcome::Yes).await.unwrap();
        assert!((yes.size() - filled).abs() < 1e-9);
    }

    #[tokio::test]
    async fn dropped_market_quotes_are_pulled() {
        let market = make_market("m1");
        let (gateway, ctx) = setup(vec![market.clone()]);
        gateway.set_book(make_book(&market.yes_token, 0.45, 0.55, 200.0));
        gateway.set_book(make_book(&market.no_token, 0.45, 0.55, 200.0));
        let mut mm = MarketMaker::from_context(&ctx);
        mm.run_cycle(&ctx, Utc::now()).await.unwrap();
        assert_eq!(gateway.open_order_count(), 1);

        // Suspend the market through the breaker path
        for _ in 0..ctx.config.risk.breaker_threshold {
            ctx.risk.record_fill_outcome("m1", true, Utc::now());
        }
        mm.run_cycle(&ctx, Utc::now()).await.unwrap();
        assert_eq!(gateway.open_order_count(), 0);
    }
}
