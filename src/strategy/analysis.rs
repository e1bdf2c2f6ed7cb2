//! Post-trade review of the directional book

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::StrategyContext;
use crate::directional::{ClosedTrade, DirectionalTunables, SettingsUpdate};
use crate::oracle::{consult, AnalysisContext, OracleOutcome};

pub struct PostTradeAnalyzer;

impl PostTradeAnalyzer {
    /// Ask the oracle to review closed trades. Returns a bounded settings
    /// update only when auto-apply is on and something survived the bounds.
    pub async fn run_cycle(ctx: &StrategyContext, now: DateTime<Utc>) -> Option<SettingsUpdate> {
        if !(ctx.config.oracle.analysis_enabled && ctx.oracle.is_enabled()) {
            return None;
        }
        let closed = ctx.book.closed().await;
        if closed.is_empty() {
            debug!("No closed directional trades to analyse");
            return None;
        }
        let (observed, entered) = ctx.signals.lock().await.counts();
        let tunables = *ctx.tunables.read().await;
        let request = build_context(observed, entered, &closed, &tunables);

        let report = match consult(ctx.oracle_timeout(), "analysis", ctx.oracle.analyze(&request)).await {
            OracleOutcome::Answered(report) => report,
            OracleOutcome::Fallback(reason) => {
                info!(reason = %reason, "Post-trade analysis unavailable");
                return None;
            }
        };
        info!(
            at = %now,
            trades = request.closed_positions,
            wins = request.wins,
            pnl = request.realized_pnl,
            summary = %report.summary,
            "📊 Post-trade analysis"
        );

        let s = &report.parameter_suggestions;
        let update = SettingsUpdate::bounded(
            s.min_edge_pts,
            s.kelly_fraction,
            s.student_t_nu,
            s.stop_loss_pts,
            s.take_profit_pts,
        );
        if update.is_empty() {
            return None;
        }
        if !ctx.config.oracle.analysis_auto_apply {
            info!(?update, "Parameter suggestions logged, auto-apply off");
            return None;
        }
        Some(update)
    }
}

fn build_context(
    observed: usize,
    entered: usize,
    closed: &[ClosedTrade],
    tunables: &DirectionalTunables,
) -> AnalysisContext {
    let wins = closed.iter().filter(|t| t.is_win()).count();
    let mut reasons: BTreeMap<String, usize> = BTreeMap::new();
    for trade in closed {
        *reasons.entry(trade.reason.to_string()).or_insert(0) += 1;
    }
    AnalysisContext {
        signals_observed: observed,
        signals_entered: entered,
        closed_positions: closed.len(),
        wins,
        losses: closed.len() - wins,
        realized_pnl: closed.iter().map(|t| t.pnl).sum(),
        avg_entry_edge_pts: closed.iter().map(|t| t.entry_edge_pts).sum::<f64>() / closed.len() as f64,
        exit_reasons: reasons.into_iter().collect(),
        min_edge_pts: tunables.min_edge_pts,
        kelly_fraction: tunables.kelly_fraction,
        student_t_nu: tunables.student_t_nu,
        stop_loss_pts: tunables.stop_loss_pts,
        take_profit_pts: tunables.take_profit_pts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directional::book::tests::make_position;
    use crate::directional::ExitReason;
    use crate::gateway::PaperGateway;
    use crate::markets::StaticMarketSource;
    use crate::oracle::{AnalysisReport, MockAdvisoryOracle, ParameterSuggestions};
    use crate::spot::FixedSpotFeed;
    use crate::strategy::test_support::*;
    use std::sync::Arc;

    async fn context_with_trades(oracle: MockAdvisoryOracle, auto_apply: bool) -> StrategyContext {
        let mut ctx = make_context(
            Arc::new(PaperGateway::new(100.0)),
            StaticMarketSource::new(vec![], vec![]),
            FixedSpotFeed::default(),
            Arc::new(oracle),
        );
        ctx.config.oracle.analysis_enabled = true;
        ctx.config.oracle.analysis_auto_apply = auto_apply;
        ctx.book.open(make_position("a", 0.50, 10.0)).await;
        ctx.book.close("a", 0.30, 10.0, ExitReason::StopLoss, Utc::now()).await;
        ctx.book.open(make_position("b", 0.40, 10.0)).await;
        ctx.book.close("b", 0.65, 10.0, ExitReason::TakeProfit, Utc::now()).await;
        ctx
    }

    fn suggesting(suggestions: ParameterSuggestions) -> MockAdvisoryOracle {
        let mut oracle = MockAdvisoryOracle::new();
        oracle.expect_is_enabled().return_const(true);
        oracle.expect_analyze().returning(move |request| {
            assert_eq!(request.closed_positions, 2);
            assert_eq!(request.wins, 1);
            Ok(AnalysisReport {
                summary: "tighten stops".to_string(),
                parameter_suggestions: suggestions.clone(),
            })
        });
        oracle
    }

    #[tokio::test]
    async fn out_of_bounds_suggestions_are_dropped() {
        let oracle = suggesting(ParameterSuggestions {
            min_edge_pts: Some(40.0),
            kelly_fraction: Some(0.3),
            ..Default::default()
        });
        let ctx = context_with_trades(oracle, true).await;
        let update = PostTradeAnalyzer::run_cycle(&ctx, Utc::now()).await.unwrap();
        assert_eq!(update.min_edge_pts, None);
        assert_eq!(update.kelly_fraction, Some(0.3));
    }

    #[tokio::test]
    async fn suggestions_only_logged_without_auto_apply() {
        let oracle = suggesting(ParameterSuggestions {
            stop_loss_pts: Some(12.0),
            ..Default::default()
        });
        let ctx = context_with_trades(oracle, false).await;
        assert!(PostTradeAnalyzer::run_cycle(&ctx, Utc::now()).await.is_none());
    }

    #[test]
    fn context_counts_exit_reasons() {
        let now = Utc::now();
        let trade = |reason, pnl| ClosedTrade {
            market_id: "m".to_string(),
            outcome: crate::types::Outcome::Yes,
            reason,
            entry_price: 0.5,
            exit_price: 0.5,
            size: 1.0,
            pnl,
            entry_edge_pts: 6.0,
            opened_at: now,
            closed_at: now,
        };
        let closed = vec![
            trade(ExitReason::StopLoss, -1.0),
            trade(ExitReason::StopLoss, -2.0),
            trade(ExitReason::TakeProfit, 3.0),
        ];
        let tunables = DirectionalTunables {
            min_edge_pts: 5.0,
            kelly_fraction: 0.25,
            student_t_nu: 6.0,
            stop_loss_pts: 15.0,
            take_profit_pts: 20.0,
        };
        let ctx = build_context(10, 3, &closed, &tunables);
        assert_eq!(ctx.losses, 2);
        assert_eq!(ctx.realized_pnl, 0.0);
        assert_eq!(
            ctx.exit_reasons,
            vec![("STOP_LOSS".to_string(), 2), ("TAKE_PROFIT".to_string(), 1)]
        );
    }
}
