//! Crypto-directional entry loop

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use super::StrategyContext;
use crate::directional::{self, kelly_size, size_entry, DirectionalPosition, Evaluation, OutcomeEdge};
use crate::gateway::{OrderRequest, PlacementOutcome};
use crate::inventory::make_fill;
use crate::oracle::{consult, EntryContext, OracleOutcome};
use crate::risk::{DirectionalIntent, RiskVerdict};
use crate::types::{round_to_tick, Market, OrderSide, StrategyKind, ThresholdMarket};

/// What one entry pass did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CdCycleSummary {
    pub evaluated: usize,
    pub confirmed: usize,
    pub entered: usize,
    pub rejected: usize,
}

/// Spot and close history for one coin, fetched once per cycle
struct CoinData {
    spot: f64,
    closes: Vec<f64>,
}

pub struct DirectionalTrader;

impl DirectionalTrader {
    pub async fn run_cycle(ctx: &StrategyContext, now: DateTime<Utc>) -> Result<CdCycleSummary> {
        let mut summary = CdCycleSummary::default();
        sync_entries(ctx, now).await?;

        if ctx.risk.is_paused() {
            debug!("Trading paused, no directional entries");
            return Ok(summary);
        }

        let markets = match ctx.markets.threshold_markets().await {
            Ok(markets) => markets,
            Err(err) => {
                warn!(error = %err, "Threshold markets unavailable");
                return Ok(summary);
            }
        };
        let coins: HashSet<String> = ctx.config.cd.coins.iter().map(|c| c.to_uppercase()).collect();
        let markets: Vec<ThresholdMarket> = markets
            .into_iter()
            .filter(|m| coins.contains(&m.coin.to_uppercase()))
            .collect();
        let universe: Vec<Market> = markets.iter().map(|m| m.market.clone()).collect();
        ctx.remember_markets(&universe).await;

        let listed: HashSet<String> = markets.iter().map(|m| m.market.id.clone()).collect();
        let expired = ctx.signals.lock().await.expire_missing(&listed, now);
        for transition in &expired {
            record_signal(ctx, transition).await;
        }

        let mut coin_data: HashMap<String, Option<CoinData>> = HashMap::new();
        for threshold in &markets {
            if ctx.book.contains(&threshold.market.id).await {
                continue;
            }
            let days = threshold.market.days_to_resolution(now);
            if days <= 0.0 {
                continue;
            }
            if !coin_data.contains_key(&threshold.coin) {
                let data = fetch_coin(ctx, &threshold.coin).await;
                coin_data.insert(threshold.coin.clone(), data);
            }
            let Some(Some(data)) = coin_data.get(&threshold.coin) else {
                continue;
            };

            let Some((evaluation, prices)) = evaluate_market(ctx, threshold, data, days).await else {
                continue;
            };
            summary.evaluated += 1;

            let min_edge = ctx.tunables.read().await.min_edge_pts;
            let transition = ctx
                .signals
                .lock()
                .await
                .observe(&threshold.market.id, &evaluation.best, min_edge, now);
            if let Some(transition) = &transition {
                record_signal(ctx, transition).await;
            }
            if !ctx.signals.lock().await.is_confirmed(&threshold.market.id) {
                continue;
            }
            summary.confirmed += 1;

            match try_enter(ctx, threshold, &evaluation, &prices, now).await {
                Ok(true) => summary.entered += 1,
                Ok(false) => summary.rejected += 1,
                Err(err) => {
                    summary.rejected += 1;
                    warn!(market = %threshold.market.id, error = %err, "Directional entry failed");
                }
            }
        }

        if summary.evaluated > 0 {
            info!(
                evaluated = summary.evaluated,
                confirmed = summary.confirmed,
                entered = summary.entered,
                "🎯 Directional scan done"
            );
        }
        Ok(summary)
    }
}

/// Top of book for the favoured outcome
struct OutcomePrices {
    best_bid: Option<f64>,
    best_ask: Option<f64>,
}

async fn fetch_coin(ctx: &StrategyContext, coin: &str) -> Option<CoinData> {
    let spot = match ctx.spot.spot_price(coin).await {
        Ok(spot) => spot,
        Err(err) => {
            warn!(coin, error = %err, "Spot price unavailable");
            return None;
        }
    };
    let closes = match ctx.spot.daily_closes(coin, ctx.config.cd.ewma_span_days + 1).await {
        Ok(closes) => closes,
        Err(err) => {
            warn!(coin, error = %err, "Close history unavailable");
            return None;
        }
    };
    Some(CoinData { spot, closes })
}

/// Market probabilities from the two books' mids, then the model edge
async fn evaluate_market(
    ctx: &StrategyContext,
    threshold: &ThresholdMarket,
    data: &CoinData,
    days: f64,
) -> Option<(Evaluation, OutcomePrices)> {
    let market = &threshold.market;
    let yes_book = ctx.gateway.get_book(&market.yes_token).await.ok()?;
    let p_yes = yes_book.mid_price()?;
    let no_book = ctx.gateway.get_book(&market.no_token).await.ok();
    let p_no = no_book
        .as_ref()
        .and_then(|b| b.mid_price())
        .unwrap_or(1.0 - p_yes);

    let nu = ctx.tunables.read().await.student_t_nu;
    let evaluation = directional::evaluate(
        data.spot,
        &data.closes,
        threshold.strike,
        threshold.direction,
        days,
        p_yes,
        p_no,
        ctx.config.cd.ewma_lambda,
        nu,
    )?;
    let book = match evaluation.best.outcome {
        crate::types::Outcome::Yes => Some(&yes_book),
        crate::types::Outcome::No => no_book.as_ref(),
    };
    let prices = OutcomePrices {
        best_bid: book.and_then(|b| b.best_bid()).map(|l| l.price),
        best_ask: book.and_then(|b| b.best_ask()).map(|l| l.price),
    };
    Some((evaluation, prices))
}

/// Size, gate and place one entry. `Ok(false)` means no trade.
async fn try_enter(
    ctx: &StrategyContext,
    threshold: &ThresholdMarket,
    evaluation: &Evaluation,
    prices: &OutcomePrices,
    now: DateTime<Utc>,
) -> Result<bool> {
    let market = &threshold.market;
    let edge: &OutcomeEdge = &evaluation.best;
    let cd = &ctx.config.cd;

    let raw_price = if cd.post_only {
        match prices.best_bid {
            Some(bid) => edge.market_probability.min(bid),
            None => edge.market_probability,
        }
    } else {
        match prices.best_ask {
            Some(ask) => ask,
            None => return Ok(false),
        }
    };
    let price = round_to_tick(raw_price, market.tick());
    if price <= 0.0 || price >= 1.0 {
        return Ok(false);
    }

    let budget = ctx.capital_budget(now).await;
    let Some(available) = budget.available() else {
        info!(market = %market.id, "Directional entry rejected: balance unknown");
        return Ok(false);
    };
    let tunables = *ctx.tunables.read().await;
    let kelly_fraction = tunables.kelly_fraction;
    let stake = kelly_size(
        edge.model_probability,
        edge.market_probability,
        available,
        kelly_fraction,
        cd.max_position_pct / 100.0,
    );
    let Some(entry) = size_entry(stake, price, cd.min_shares, cd.min_size_usd) else {
        debug!(market = %market.id, stake, "Kelly stake below floor, no trade");
        return Ok(false);
    };

    let intent = DirectionalIntent {
        size_usd: entry.usd,
        edge_pts: edge.edge_pts,
        min_edge_pts: tunables.min_edge_pts,
        open_positions: ctx.book.count().await,
        max_positions: cd.max_concurrent_positions,
    };
    let total_exposure = ctx.ledger.total_exposure().await;
    if let RiskVerdict::Rejected(reason) =
        ctx.risk
            .validate_directional_trade(&intent, &budget, total_exposure, now)
    {
        info!(market = %market.id, reason = %reason, "Directional entry rejected by risk");
        return Ok(false);
    }

    if ctx.config.oracle.cd_entry_enabled && ctx.oracle.is_enabled() {
        let balance = budget.balance.known().unwrap_or(0.0);
        let request = EntryContext {
            market_id: market.id.clone(),
            question: market.question.clone(),
            coin: threshold.coin.clone(),
            spot: evaluation.spot,
            strike: threshold.strike,
            direction: threshold.direction.to_string(),
            outcome: edge.outcome.to_string(),
            days_to_expiry: evaluation.days_to_expiry,
            model_probability: edge.model_probability,
            market_probability: edge.market_probability,
            edge_pts: edge.edge_pts,
            daily_vol: evaluation.daily_vol,
            size_usd: entry.usd,
            portfolio: ctx.portfolio_snapshot(balance).await,
        };
        match consult(ctx.oracle_timeout(), "cd_entry", ctx.oracle.validate_entry(&request)).await {
            OracleOutcome::Answered(verdict) if verdict.approve => {
                debug!(market = %market.id, confidence = verdict.confidence, "Oracle approved entry");
            }
            OracleOutcome::Answered(verdict) => {
                info!(market = %market.id, rationale = %verdict.rationale, "Oracle rejected entry");
                return Ok(false);
            }
            OracleOutcome::Fallback(reason) => {
                info!(market = %market.id, reason = %reason, "Oracle unavailable, entry rejected");
                return Ok(false);
            }
        }
    }

    let request = OrderRequest {
        market_id: market.id.clone(),
        token_id: market.token(edge.outcome).to_string(),
        outcome: edge.outcome,
        side: OrderSide::Buy,
        price,
        size: entry.shares,
        post_only: cd.post_only,
        tick_size: market.tick(),
        strategy: StrategyKind::Directional,
    };
    let placed = match PlacementOutcome::from(ctx.gateway.place_order(&request).await) {
        PlacementOutcome::Placed(placed) => placed,
        PlacementOutcome::Rejected(reason) => {
            info!(market = %market.id, reason = %reason, "Directional order rejected");
            return Ok(false);
        }
        PlacementOutcome::Failed(err) => {
            warn!(market = %market.id, error = %err, "Directional order state unknown");
            return Ok(false);
        }
    };

    let position = DirectionalPosition {
        market_id: market.id.clone(),
        token_id: request.token_id.clone(),
        question: market.question.clone(),
        coin: threshold.coin.clone(),
        strike: threshold.strike,
        direction: threshold.direction,
        outcome: edge.outcome,
        entry_price: price,
        size: entry.shares,
        filled: 0.0,
        entry_order_id: placed.order_id.clone(),
        entry_open: true,
        opened_at: now,
        expiry_days_at_entry: evaluation.days_to_expiry,
        entry_edge_pts: edge.edge_pts,
    };
    ctx.book.open(position).await;
    ctx.risk.record_directional_volume(entry.usd, now);
    if let Some(transition) = ctx.signals.lock().await.mark_entered(&market.id, now) {
        record_signal(ctx, &transition).await;
    }
    if placed.size_matched > 0.0 {
        book_entry_fill(ctx, market, &placed.order_id, placed.size_matched, now).await?;
        let open = placed.size_matched + 1e-9 < entry.shares;
        ctx.book.update_entry(&market.id, placed.size_matched, open).await;
    }
    info!(
        market = %market.id,
        outcome = %edge.outcome,
        price,
        shares = entry.shares,
        usd = entry.usd,
        edge_pts = edge.edge_pts,
        "🚀 Directional entry placed"
    );
    Ok(true)
}

async fn record_signal(ctx: &StrategyContext, transition: &crate::directional::SignalTransition) {
    if let Err(err) = ctx.journal.record_signal(&transition.to_record()).await {
        warn!(error = %err, "Failed to journal signal transition");
    }
}

/// Book newly matched entry shares into the ledger
async fn book_entry_fill(
    ctx: &StrategyContext,
    market: &Market,
    order_id: &str,
    matched_total: f64,
    now: DateTime<Utc>,
) -> Result<()> {
    let Some(position) = ctx.book.get(&market.id).await else {
        return Ok(());
    };
    let delta = matched_total - position.filled;
    if delta <= 1e-9 {
        return Ok(());
    }
    let fill = make_fill(
        &format!("{}:{:.4}", order_id, matched_total),
        &market.id,
        position.outcome,
        OrderSide::Buy,
        position.entry_price,
        delta,
        StrategyKind::Directional,
        now,
    );
    ctx.ledger.apply_fill(&fill, &ctx.journal).await?;
    Ok(())
}

/// Pull fill progress of resting entry orders into the ledger and the
/// directional book. Shared by the entry and exit loops.
pub async fn sync_entries(ctx: &StrategyContext, now: DateTime<Utc>) -> Result<()> {
    for position in ctx.book.positions().await {
        if !position.entry_open {
            continue;
        }
        let report = match ctx.gateway.get_order(&position.entry_order_id).await {
            Ok(report) => report,
            Err(err) => {
                debug!(order_id = %position.entry_order_id, error = %err, "Entry status unavailable");
                continue;
            }
        };
        let Some(market) = ctx.known_market(&position.market_id).await else {
            continue;
        };
        book_entry_fill(ctx, &market, &position.entry_order_id, report.size_matched, now).await?;
        if let Some(dropped) = ctx
            .book
            .update_entry(&position.market_id, report.size_matched, report.is_open())
            .await
        {
            ctx.signals.lock().await.release(&dropped.market_id);
        }
    }
    Ok(())
}
