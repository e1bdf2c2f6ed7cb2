//! Directional exit loop. Runs regardless of pause state.

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::directional::sync_entries;
use super::StrategyContext;
use crate::directional::{self, check_exit, DirectionalPosition, ExitReason};
use crate::gateway::{OrderRequest, PlacementOutcome};
use crate::inventory::make_fill;
use crate::oracle::{consult, ExitContext, OracleOutcome};
use crate::persistence::ExitRecord;
use crate::types::{Outcome, OrderSide, StrategyKind};

/// Oracle confidence needed to hold through an edge reversal
const HOLD_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExitCycleSummary {
    pub checked: usize,
    pub exits: usize,
    pub held: usize,
}

pub struct ExitMonitor;

impl ExitMonitor {
    pub async fn run_cycle(ctx: &StrategyContext, now: DateTime<Utc>) -> Result<ExitCycleSummary> {
        let mut summary = ExitCycleSummary::default();
        sync_entries(ctx, now).await?;

        for position in ctx.book.positions().await {
            if position.filled <= 0.0 {
                continue;
            }
            summary.checked += 1;

            let book = match ctx.gateway.get_book(&position.token_id).await {
                Ok(book) => book,
                Err(err) => {
                    debug!(market = %position.market_id, error = %err, "Exit book unavailable");
                    continue;
                }
            };
            let (Some(best_bid), Some(mid)) = (book.best_bid(), book.mid_price()) else {
                continue;
            };
            ctx.ledger.mark(&position.market_id, position.outcome, mid).await;

            let edge_now = current_edge(ctx, &position, mid, now).await;
            let tunables = *ctx.tunables.read().await;
            let Some(reason) = check_exit(
                &position,
                mid,
                edge_now,
                tunables.stop_loss_pts,
                tunables.take_profit_pts,
                ctx.config.cd_exit.edge_reversal_pts,
            ) else {
                continue;
            };

            let mut oracle_note = None;
            if reason.needs_confirmation() {
                match confirm_reversal(ctx, &position, mid, edge_now.unwrap_or(0.0)).await {
                    Reversal::Hold(note) => {
                        info!(market = %position.market_id, note = %note, "Oracle says hold through reversal");
                        summary.held += 1;
                        continue;
                    }
                    Reversal::Exit(note) => oracle_note = note,
                }
            }

            match close_position(ctx, &position, reason, best_bid.price, mid, oracle_note, now).await {
                Ok(true) => summary.exits += 1,
                Ok(false) => {}
                Err(err) => warn!(market = %position.market_id, error = %err, "Directional exit failed"),
            }
        }
        Ok(summary)
    }
}

enum Reversal {
    Hold(String),
    Exit(Option<String>),
}

/// Only an explicit, confident "do not exit" holds the position
async fn confirm_reversal(
    ctx: &StrategyContext,
    position: &DirectionalPosition,
    current_price: f64,
    edge_pts: f64,
) -> Reversal {
    if !(ctx.config.oracle.cd_exit_confirm_enabled && ctx.oracle.is_enabled()) {
        return Reversal::Exit(None);
    }
    let request = ExitContext {
        market_id: position.market_id.clone(),
        question: position.question.clone(),
        outcome: position.outcome.to_string(),
        entry_price: position.entry_price,
        current_price,
        edge_pts,
        reason: ExitReason::EdgeReversal.to_string(),
    };
    match consult(ctx.oracle_timeout(), "cd_exit", ctx.oracle.confirm_exit(&request)).await {
        OracleOutcome::Answered(verdict) if !verdict.approve && verdict.confidence >= HOLD_CONFIDENCE => {
            Reversal::Hold(verdict.rationale)
        }
        OracleOutcome::Answered(verdict) => Reversal::Exit(Some(verdict.rationale)),
        OracleOutcome::Fallback(reason) => Reversal::Exit(Some(format!("fallback: {}", reason))),
    }
}

/// Model edge for the held outcome right now, in points
async fn current_edge(
    ctx: &StrategyContext,
    position: &DirectionalPosition,
    mid: f64,
    now: DateTime<Utc>,
) -> Option<f64> {
    let spot = ctx.spot.spot_price(&position.coin).await.ok()?;
    let closes = ctx
        .spot
        .daily_closes(&position.coin, ctx.config.cd.ewma_span_days + 1)
        .await
        .ok()?;
    let daily_vol = directional::ewma_volatility(&closes, ctx.config.cd.ewma_lambda)?;
    let nu = ctx.tunables.read().await.student_t_nu;
    let p_yes = directional::threshold_probability(
        spot,
        position.strike,
        position.remaining_expiry_days(now),
        daily_vol,
        nu,
        position.direction,
    );
    let p_model = match position.outcome {
        Outcome::Yes => p_yes,
        Outcome::No => 1.0 - p_yes,
    };
    Some(directional::edge_pts(p_model, mid))
}

/// Cancel any resting entry, sell the filled shares into the bid and book
/// whatever traded. Returns whether anything was sold.
async fn close_position(
    ctx: &StrategyContext,
    position: &DirectionalPosition,
    reason: ExitReason,
    bid: f64,
    mid: f64,
    oracle_note: Option<String>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let Some(market) = ctx.known_market(&position.market_id).await else {
        warn!(market = %position.market_id, "Exit skipped: market metadata unknown");
        return Ok(false);
    };

    if position.entry_open {
        if let Err(err) = ctx.gateway.cancel_order(&position.entry_order_id).await {
            warn!(order_id = %position.entry_order_id, error = %err, "Entry cancel failed before exit");
        }
        // Anything matched between the last sync and the cancel
        sync_entries(ctx, now).await?;
    }
    let Some(position) = ctx.book.get(&position.market_id).await else {
        return Ok(false);
    };

    let request = OrderRequest {
        market_id: position.market_id.clone(),
        token_id: position.token_id.clone(),
        outcome: position.outcome,
        side: OrderSide::Sell,
        price: bid,
        size: position.filled,
        post_only: false,
        tick_size: market.tick(),
        strategy: StrategyKind::Directional,
    };
    let placed = match PlacementOutcome::from(ctx.gateway.place_order(&request).await) {
        PlacementOutcome::Placed(placed) => placed,
        PlacementOutcome::Rejected(reason) => {
            warn!(market = %position.market_id, reason = %reason, "Exit order rejected");
            return Ok(false);
        }
        PlacementOutcome::Failed(err) => {
            warn!(market = %position.market_id, error = %err, "Exit order state unknown");
            return Ok(false);
        }
    };

    let mut sold = placed.size_matched;
    if sold + 1e-9 < position.filled {
        if let Err(err) = ctx.gateway.cancel_order(&placed.order_id).await {
            warn!(order_id = %placed.order_id, error = %err, "Exit remainder cancel failed");
        }
        if let Ok(report) = ctx.gateway.get_order(&placed.order_id).await {
            sold = sold.max(report.size_matched);
        }
    }
    if sold <= 1e-9 {
        info!(market = %position.market_id, reason = %reason, "Exit found no liquidity");
        return Ok(false);
    }

    let fill = make_fill(
        &format!("{}:{:.4}", placed.order_id, sold),
        &position.market_id,
        position.outcome,
        OrderSide::Sell,
        bid,
        sold,
        StrategyKind::Directional,
        now,
    );
    ctx.ledger.apply_fill(&fill, &ctx.journal).await?;

    let Some(trade) = ctx.book.close(&position.market_id, bid, sold, reason, now).await else {
        return Ok(false);
    };
    if !ctx.book.contains(&position.market_id).await {
        ctx.signals.lock().await.release(&position.market_id);
    }
    let record = ExitRecord {
        timestamp: now.timestamp_millis(),
        kind: "directional_exit".to_string(),
        market_id: trade.market_id.clone(),
        outcome: trade.outcome.to_string(),
        reason: reason.to_string(),
        entry_price: trade.entry_price,
        exit_price: trade.exit_price,
        size: trade.size,
        pnl: trade.pnl,
        oracle_note,
    };
    if let Err(err) = ctx.journal.record_exit(&record).await {
        warn!(error = %err, "Failed to journal exit");
    }
    info!(
        market = %trade.market_id,
        reason = %reason,
        entry = trade.entry_price,
        exit = trade.exit_price,
        mid,
        size = trade.size,
        pnl = trade.pnl,
        "🏁 Directional position closed"
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directional::book::tests::make_position;
    use crate::gateway::PaperGateway;
    use crate::markets::StaticMarketSource;
    use crate::oracle::{MockAdvisoryOracle, OracleVerdict};
    use crate::spot::FixedSpotFeed;
    use crate::strategy::test_support::*;
    use std::sync::Arc;

    /// A filled 10-share YES position at 0.50 in market "btc"
    async fn held_position(
        gateway: Arc<PaperGateway>,
        spot: FixedSpotFeed,
        oracle: Arc<dyn crate::oracle::AdvisoryOracle>,
    ) -> StrategyContext {
        let mut ctx = make_context(gateway.clone(), StaticMarketSource::new(vec![], vec![]), spot, oracle);
        ctx.config.oracle.cd_exit_confirm_enabled = true;
        let market = make_market("btc");
        ctx.remember_markets([&market]).await;
        let position = make_position("btc", 0.50, 10.0);
        gateway.credit_tokens(&position.token_id, 10.0);
        let fill = make_fill("entry:10", "btc", Outcome::Yes, OrderSide::Buy, 0.50, 10.0, StrategyKind::Directional, Utc::now());
        ctx.ledger.apply_fill(&fill, &ctx.journal).await.unwrap();
        ctx.book.open(position).await;
        ctx
    }

    /// Spot far below the strike: the YES model probability collapses
    fn bearish_spot() -> FixedSpotFeed {
        let closes = (0..31).map(|i| if i % 2 == 0 { 100_000.0 } else { 101_000.0 }).collect();
        FixedSpotFeed::default().with_coin("BTC", 90_000.0, closes)
    }

    #[tokio::test]
    async fn stop_loss_sells_into_bid() {
        let gateway = Arc::new(PaperGateway::new(100.0));
        gateway.set_book(make_book("btc-yes", 0.33, 0.35, 100.0));
        let ctx = held_position(gateway.clone(), FixedSpotFeed::default(), disabled_oracle()).await;

        let summary = ExitMonitor::run_cycle(&ctx, Utc::now()).await.unwrap();
        assert_eq!(summary.exits, 1);
        assert_eq!(ctx.book.count().await, 0);
        let closed = ctx.book.closed().await;
        assert_eq!(closed[0].reason, ExitReason::StopLoss);
        assert!((closed[0].pnl - (0.33 - 0.50) * 10.0).abs() < 1e-9);
        let held = ctx.ledger.position("btc", Outcome::Yes).await.map(|p| p.size()).unwrap_or(0.0);
        assert!(held.abs() < 1e-9);
    }

    #[tokio::test]
    async fn exits_run_while_paused() {
        let gateway = Arc::new(PaperGateway::new(100.0));
        gateway.set_book(make_book("btc-yes", 0.72, 0.74, 100.0));
        let ctx = held_position(gateway.clone(), FixedSpotFeed::default(), disabled_oracle()).await;
        ctx.risk.pause_manual(Utc::now());

        let summary = ExitMonitor::run_cycle(&ctx, Utc::now()).await.unwrap();
        assert_eq!(summary.exits, 1);
        assert_eq!(ctx.book.closed().await[0].reason, ExitReason::TakeProfit);
    }

    #[tokio::test]
    async fn quiet_market_is_held() {
        let gateway = Arc::new(PaperGateway::new(100.0));
        gateway.set_book(make_book("btc-yes", 0.49, 0.51, 100.0));
        let ctx = held_position(gateway.clone(), FixedSpotFeed::default(), disabled_oracle()).await;
        let summary = ExitMonitor::run_cycle(&ctx, Utc::now()).await.unwrap();
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.exits, 0);
        assert_eq!(ctx.book.count().await, 1);
    }

    #[tokio::test]
    async fn confident_oracle_holds_through_reversal() {
        let gateway = Arc::new(PaperGateway::new(100.0));
        gateway.set_book(make_book("btc-yes", 0.49, 0.51, 100.0));
        let mut oracle = MockAdvisoryOracle::new();
        oracle.expect_is_enabled().return_const(true);
        oracle.expect_confirm_exit().times(1).returning(|_| {
            Ok(OracleVerdict {
                approve: false,
                confidence: 0.8,
                rationale: "dip is noise".to_string(),
            })
        });
        let ctx = held_position(gateway.clone(), bearish_spot(), Arc::new(oracle)).await;
        let summary = ExitMonitor::run_cycle(&ctx, Utc::now()).await.unwrap();
        assert_eq!(summary.held, 1);
        assert_eq!(ctx.book.count().await, 1);
    }

    #[tokio::test]
    async fn oracle_failure_exits_on_reversal() {
        let gateway = Arc::new(PaperGateway::new(100.0));
        gateway.set_book(make_book("btc-yes", 0.49, 0.51, 100.0));
        let mut oracle = MockAdvisoryOracle::new();
        oracle.expect_is_enabled().return_const(true);
        oracle
            .expect_confirm_exit()
            .returning(|_| Err(crate::error::OracleError::Malformed("no json".to_string())));
        let ctx = held_position(gateway.clone(), bearish_spot(), Arc::new(oracle)).await;
        let summary = ExitMonitor::run_cycle(&ctx, Utc::now()).await.unwrap();
        assert_eq!(summary.exits, 1);
        assert_eq!(ctx.book.closed().await[0].reason, ExitReason::EdgeReversal);
    }
}
