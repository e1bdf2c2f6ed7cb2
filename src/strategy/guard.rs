//! Oracle-driven kill list for actively traded markets

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use tracing::{info, warn};

use super::StrategyContext;
use crate::oracle::{consult, GuardMarketContext, OracleOutcome};

pub struct MarketGuard;

impl MarketGuard {
    /// Send active markets to the oracle and pull any it flags. Returns the
    /// markets blocked this run.
    pub async fn run_cycle(ctx: &StrategyContext, now: DateTime<Utc>) -> Vec<String> {
        if !(ctx.config.oracle.guard_enabled && ctx.oracle.is_enabled()) {
            return Vec::new();
        }

        let mut active: BTreeSet<String> = ctx.quoter.lock().await.active_markets().into_iter().collect();
        active.extend(ctx.ledger.markets().await);
        let mut markets = Vec::with_capacity(active.len());
        for market_id in &active {
            let Some(market) = ctx.known_market(market_id).await else {
                continue;
            };
            markets.push(GuardMarketContext {
                market_id: market.id.clone(),
                question: market.question.clone(),
                hours_old: market
                    .created_at
                    .map(|created| (now - created).num_minutes() as f64 / 60.0),
            });
        }
        if markets.is_empty() {
            return Vec::new();
        }

        let report = match consult(ctx.oracle_timeout(), "guard", ctx.oracle.guard_markets(&markets)).await {
            OracleOutcome::Answered(report) => report,
            OracleOutcome::Fallback(reason) => {
                info!(reason = %reason, "Market guard unavailable, no action");
                return Vec::new();
            }
        };
        for warning in &report.warnings {
            warn!(warning = %warning, "🛡️ Market guard warning");
        }

        let until = now + Duration::hours(ctx.config.oracle.guard_kill_ttl_hours);
        let mut blocked = Vec::new();
        for market_id in report.kill_markets {
            if !active.contains(&market_id) {
                continue;
            }
            let cancelled = ctx
                .quoter
                .lock()
                .await
                .cancel_market(ctx.gateway.as_ref(), &market_id, now)
                .await;
            let event = ctx.risk.block_market(&market_id, until, "oracle guard");
            ctx.journal_risk(&[event], now).await;
            warn!(market = %market_id, cancelled, until = %until, "🛡️ Market killed by guard");
            blocked.push(market_id);
        }
        blocked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::PaperGateway;
    use crate::inventory::make_fill;
    use crate::markets::StaticMarketSource;
    use crate::oracle::{GuardReport, MockAdvisoryOracle};
    use crate::spot::FixedSpotFeed;
    use crate::strategy::test_support::*;
    use crate::types::{OrderSide, Outcome, StrategyKind};
    use std::sync::Arc;

    async fn held_market(oracle: MockAdvisoryOracle) -> StrategyContext {
        let mut ctx = make_context(
            Arc::new(PaperGateway::new(100.0)),
            StaticMarketSource::new(vec![], vec![]),
            FixedSpotFeed::default(),
            Arc::new(oracle),
        );
        ctx.config.oracle.guard_enabled = true;
        let market = make_market("m1");
        ctx.remember_markets([&market]).await;
        let fill = make_fill("o:5", "m1", Outcome::Yes, OrderSide::Buy, 0.5, 5.0, StrategyKind::MarketMaking, Utc::now());
        ctx.ledger.apply_fill(&fill, &ctx.journal).await.unwrap();
        ctx
    }

    #[tokio::test]
    async fn killed_market_is_suspended() {
        let mut oracle = MockAdvisoryOracle::new();
        oracle.expect_is_enabled().return_const(true);
        oracle.expect_guard_markets().returning(|markets| {
            assert_eq!(markets.len(), 1);
            Ok(GuardReport {
                warnings: vec!["resolution source disputed".to_string()],
                kill_markets: vec!["m1".to_string(), "unknown".to_string()],
            })
        });
        let ctx = held_market(oracle).await;
        let blocked = MarketGuard::run_cycle(&ctx, Utc::now()).await;
        assert_eq!(blocked, vec!["m1".to_string()]);
        assert!(ctx.risk.is_market_suspended("m1", Utc::now()));
    }

    #[tokio::test]
    async fn oracle_failure_takes_no_action() {
        let mut oracle = MockAdvisoryOracle::new();
        oracle.expect_is_enabled().return_const(true);
        oracle
            .expect_guard_markets()
            .returning(|_| Err(crate::error::OracleError::Timeout(10)));
        let ctx = held_market(oracle).await;
        assert!(MarketGuard::run_cycle(&ctx, Utc::now()).await.is_empty());
        assert!(!ctx.risk.is_market_suspended("m1", Utc::now()));
    }
}
