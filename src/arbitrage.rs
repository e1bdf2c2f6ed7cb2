//! Complete-set arbitrage
//!
//! - Buy-merge: `ask(YES) + ask(NO) < 1 - margin`, take both asks and merge
//!   the pairs back into collateral.
//! - Split-sell: `bid(YES) + bid(NO) > 1 + margin`, split collateral into
//!   pairs and hit both bids.
//!
//! The two legs are one unit. Whatever a broken leg leaves behind goes to the
//! inventory ledger as ordinary fills.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::ArbitrageConfig;
use crate::gateway::{ExecutionGateway, OrderRequest};
use crate::inventory::{make_fill, InventoryLedger};
use crate::persistence::{ArbitrageRecord, EventJournal};
use crate::types::{Market, OrderBook, OrderSide, Outcome, StrategyKind};

const EPS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbitrageKind {
    BuyMerge,
    SplitSell,
}

impl std::fmt::Display for ArbitrageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArbitrageKind::BuyMerge => write!(f, "buy_merge"),
            ArbitrageKind::SplitSell => write!(f, "split_sell"),
        }
    }
}

/// A detected complete-set mispricing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrageOpportunity {
    pub market_id: String,
    pub kind: ArbitrageKind,
    /// Ask (buy-merge) or bid (split-sell)
    pub yes_price: f64,
    pub no_price: f64,
    /// Pairs, capped by top-of-book depth and the configured maximum
    pub size: f64,
    /// Net of gas, per pair
    pub profit_per_share: f64,
    pub profit_pct: f64,
}

impl ArbitrageOpportunity {
    pub fn expected_profit(&self) -> f64 {
        self.profit_per_share * self.size
    }

    /// Collateral committed up front
    pub fn capital_required(&self) -> f64 {
        match self.kind {
            ArbitrageKind::BuyMerge => (self.yes_price + self.no_price) * self.size,
            ArbitrageKind::SplitSell => self.size,
        }
    }
}

/// Why a market shows no executable arbitrage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbRejection {
    Disabled,
    NoQuotes,
    NoArbitrage,
    BelowMinProfit,
    InsufficientDepth,
}

impl std::fmt::Display for ArbRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArbRejection::Disabled => write!(f, "arbitrage disabled"),
            ArbRejection::NoQuotes => write!(f, "no valid quotes"),
            ArbRejection::NoArbitrage => write!(f, "no complete-set mispricing"),
            ArbRejection::BelowMinProfit => write!(f, "profit below minimum"),
            ArbRejection::InsufficientDepth => write!(f, "depth below minimum size"),
        }
    }
}

/// How an execution ended
#[derive(Debug, Clone, PartialEq)]
pub enum ArbitrageOutcome {
    /// Both legs filled and the pairs were merged or sold
    Completed { pairs: f64, profit: f64 },
    /// A leg fell short; leftovers were booked as inventory
    Partial { yes_filled: f64, no_filled: f64 },
    /// Nothing traded
    Aborted(String),
}

impl ArbitrageOutcome {
    fn status(&self) -> &'static str {
        match self {
            ArbitrageOutcome::Completed { .. } => "completed",
            ArbitrageOutcome::Partial { .. } => "partial",
            ArbitrageOutcome::Aborted(_) => "aborted",
        }
    }
}

pub struct ArbitrageDetector {
    config: ArbitrageConfig,
}

impl ArbitrageDetector {
    pub fn new(config: ArbitrageConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ArbitrageConfig {
        &self.config
    }

    /// Check both directions on the current books. Buy-merge wins when both
    /// somehow show up.
    pub fn detect(
        &self,
        market: &Market,
        yes_book: &OrderBook,
        no_book: &OrderBook,
    ) -> Result<ArbitrageOpportunity, ArbRejection> {
        if !self.config.enabled {
            return Err(ArbRejection::Disabled);
        }
        let (Some(yes_ask), Some(no_ask), Some(yes_bid), Some(no_bid)) = (
            yes_book.best_ask(),
            no_book.best_ask(),
            yes_book.best_bid(),
            no_book.best_bid(),
        ) else {
            return Err(ArbRejection::NoQuotes);
        };

        let buy_cost = yes_ask.price + no_ask.price;
        let sell_revenue = yes_bid.price + no_bid.price;
        let (kind, yes_level, no_level, gap) = if buy_cost < 1.0 - self.config.margin {
            (ArbitrageKind::BuyMerge, yes_ask, no_ask, 1.0 - buy_cost)
        } else if sell_revenue > 1.0 + self.config.margin {
            (ArbitrageKind::SplitSell, yes_bid, no_bid, sell_revenue - 1.0)
        } else {
            return Err(ArbRejection::NoArbitrage);
        };

        let profit_per_share = gap - self.config.gas_cost_usd;
        let profit_pct = profit_per_share * 100.0;
        if profit_per_share <= 0.0 || profit_pct + EPS < self.config.min_profit_pct {
            return Err(ArbRejection::BelowMinProfit);
        }

        let depth = yes_level.size.min(no_level.size).min(self.config.max_size_shares);
        let size = (depth * 10.0).floor() / 10.0;
        if size + EPS < self.config.min_size_shares {
            return Err(ArbRejection::InsufficientDepth);
        }

        Ok(ArbitrageOpportunity {
            market_id: market.id.clone(),
            kind,
            yes_price: yes_level.price,
            no_price: no_level.price,
            size,
            profit_per_share,
            profit_pct,
        })
    }

    /// Run both legs and the merge or split, then journal the attempt.
    pub async fn execute(
        &self,
        gateway: &dyn ExecutionGateway,
        ledger: &InventoryLedger,
        journal: &EventJournal,
        market: &Market,
        opportunity: &ArbitrageOpportunity,
        now: DateTime<Utc>,
    ) -> anyhow::Result<ArbitrageOutcome> {
        info!(
            market = %market.id,
            kind = %opportunity.kind,
            yes = opportunity.yes_price,
            no = opportunity.no_price,
            size = opportunity.size,
            profit_pct = opportunity.profit_pct,
            "⚖️ Arbitrage detected"
        );
        let outcome = match opportunity.kind {
            ArbitrageKind::BuyMerge => self.buy_merge(gateway, ledger, journal, market, opportunity, now).await?,
            ArbitrageKind::SplitSell => self.split_sell(gateway, ledger, journal, market, opportunity, now).await?,
        };

        let profit = match &outcome {
            ArbitrageOutcome::Completed { profit, .. } => *profit,
            _ => 0.0,
        };
        journal
            .record_arbitrage(&ArbitrageRecord {
                timestamp: now.timestamp_millis(),
                kind: opportunity.kind.to_string(),
                market_id: market.id.clone(),
                yes_price: opportunity.yes_price,
                no_price: opportunity.no_price,
                size: opportunity.size,
                expected_profit: profit.max(opportunity.expected_profit()),
                status: outcome.status().to_string(),
            })
            .await?;
        match &outcome {
            ArbitrageOutcome::Completed { pairs, profit } => {
                info!(market = %market.id, pairs, profit, "✅ Arbitrage completed")
            }
            ArbitrageOutcome::Partial { yes_filled, no_filled } => {
                warn!(market = %market.id, yes_filled, no_filled, "Arbitrage leg fell short, leftovers booked")
            }
            ArbitrageOutcome::Aborted(reason) => {
                warn!(market = %market.id, reason = %reason, "Arbitrage aborted")
            }
        }
        Ok(outcome)
    }

    fn taker(market: &Market, outcome: Outcome, side: OrderSide, price: f64, size: f64) -> OrderRequest {
        OrderRequest {
            market_id: market.id.clone(),
            token_id: market.token(outcome).to_string(),
            outcome,
            side,
            price,
            size,
            post_only: false,
            tick_size: market.tick(),
            strategy: StrategyKind::Arbitrage,
        }
    }

    /// Place a taker leg, wait, and return `(order_id, matched)`. Any
    /// unmatched remainder is cancelled.
    async fn run_leg(
        &self,
        gateway: &dyn ExecutionGateway,
        request: &OrderRequest,
    ) -> Result<(String, f64), String> {
        let placed = gateway
            .place_order(request)
            .await
            .map_err(|e| format!("{} leg failed: {}", request.outcome, e))?;
        let mut matched = placed.size_matched;
        if matched + EPS < request.size {
            if self.config.fill_wait_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.fill_wait_ms)).await;
            }
            if let Ok(report) = gateway.get_order(&placed.order_id).await {
                matched = report.size_matched;
                if report.is_open() {
                    if let Err(err) = gateway.cancel_order(&placed.order_id).await {
                        warn!(order_id = %placed.order_id, error = %err, "Arbitrage remainder cancel failed");
                    }
                }
            }
        }
        Ok((placed.order_id, matched))
    }

    #[allow(clippy::too_many_arguments)]
    async fn book_leg(
        &self,
        ledger: &InventoryLedger,
        journal: &EventJournal,
        market: &Market,
        order_id: &str,
        outcome: Outcome,
        side: OrderSide,
        price: f64,
        size: f64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        if size <= EPS {
            return Ok(());
        }
        let fill = make_fill(
            &format!("{}:{:.4}", order_id, size),
            &market.id,
            outcome,
            side,
            price,
            size,
            StrategyKind::Arbitrage,
            now,
        );
        ledger.apply_fill(&fill, journal).await?;
        Ok(())
    }

    async fn buy_merge(
        &self,
        gateway: &dyn ExecutionGateway,
        ledger: &InventoryLedger,
        journal: &EventJournal,
        market: &Market,
        opp: &ArbitrageOpportunity,
        now: DateTime<Utc>,
    ) -> anyhow::Result<ArbitrageOutcome> {
        let yes_req = Self::taker(market, Outcome::Yes, OrderSide::Buy, opp.yes_price, opp.size);
        let (yes_id, yes_filled) = match self.run_leg(gateway, &yes_req).await {
            Ok(leg) => leg,
            Err(reason) => return Ok(ArbitrageOutcome::Aborted(reason)),
        };
        self.book_leg(ledger, journal, market, &yes_id, Outcome::Yes, OrderSide::Buy, opp.yes_price, yes_filled, now)
            .await?;

        let no_req = Self::taker(market, Outcome::No, OrderSide::Buy, opp.no_price, opp.size);
        let no_filled = match self.run_leg(gateway, &no_req).await {
            Ok((no_id, filled)) => {
                self.book_leg(ledger, journal, market, &no_id, Outcome::No, OrderSide::Buy, opp.no_price, filled, now)
                    .await?;
                filled
            }
            Err(reason) => {
                warn!(market = %market.id, reason = %reason, "Second arbitrage leg failed");
                0.0
            }
        };

        let pairs = ((yes_filled.min(no_filled)) * 10.0).floor() / 10.0;
        if pairs + EPS < self.config.min_size_shares {
            if yes_filled <= EPS && no_filled <= EPS {
                return Ok(ArbitrageOutcome::Aborted("no fills".to_string()));
            }
            return Ok(ArbitrageOutcome::Partial { yes_filled, no_filled });
        }

        if let Err(err) = gateway.merge_positions(market, pairs).await {
            warn!(market = %market.id, error = %err, "Merge failed, pairs stay in inventory");
            return Ok(ArbitrageOutcome::Partial { yes_filled, no_filled });
        }
        let realized = match ledger.apply_merge(&market.id, pairs, journal, now).await {
            Ok(realized) => realized,
            Err(err) => {
                error!(market = %market.id, pairs, error = %err, "Merge not journaled, left to reconciliation");
                return Ok(ArbitrageOutcome::Partial { yes_filled, no_filled });
            }
        };
        let profit = realized - self.config.gas_cost_usd * pairs;
        if (yes_filled - no_filled).abs() > EPS {
            return Ok(ArbitrageOutcome::Partial { yes_filled, no_filled });
        }
        Ok(ArbitrageOutcome::Completed { pairs, profit })
    }

    async fn split_sell(
        &self,
        gateway: &dyn ExecutionGateway,
        ledger: &InventoryLedger,
        journal: &EventJournal,
        market: &Market,
        opp: &ArbitrageOpportunity,
        now: DateTime<Utc>,
    ) -> anyhow::Result<ArbitrageOutcome> {
        if let Err(err) = gateway.split_position(market, opp.size).await {
            return Ok(ArbitrageOutcome::Aborted(format!("split failed: {}", err)));
        }
        if let Err(err) = ledger.apply_split(&market.id, opp.size, journal, now).await {
            error!(market = %market.id, size = opp.size, error = %err, "Split not journaled, left to reconciliation");
            return Ok(ArbitrageOutcome::Aborted("split not journaled".to_string()));
        }

        let mut filled = [0.0_f64; 2];
        for (slot, (outcome, price)) in [(Outcome::Yes, opp.yes_price), (Outcome::No, opp.no_price)]
            .into_iter()
            .enumerate()
        {
            let request = Self::taker(market, outcome, OrderSide::Sell, price, opp.size);
            match self.run_leg(gateway, &request).await {
                Ok((order_id, matched)) => {
                    self.book_leg(ledger, journal, market, &order_id, outcome, OrderSide::Sell, price, matched, now)
                        .await?;
                    filled[slot] = matched;
                }
                Err(reason) => warn!(market = %market.id, reason = %reason, "Split-sell leg failed"),
            }
        }

        let [yes_filled, no_filled] = filled;
        if yes_filled + EPS >= opp.size && no_filled + EPS >= opp.size {
            let profit = (opp.yes_price + opp.no_price - 1.0 - self.config.gas_cost_usd) * opp.size;
            Ok(ArbitrageOutcome::Completed { pairs: opp.size, profit })
        } else {
            Ok(ArbitrageOutcome::Partial { yes_filled, no_filled })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::PaperGateway;
    use crate::types::BookLevel;

    fn make_config() -> ArbitrageConfig {
        ArbitrageConfig {
            enabled: true,
            margin: 0.0,
            min_profit_pct: 0.5,
            min_size_shares: 5.0,
            max_size_shares: 50.0,
            gas_cost_usd: 0.005,
            fill_wait_ms: 0,
        }
    }

    fn make_market() -> Market {
        Market {
            id: "cond-1".to_string(),
            question: "Will it rain?".to_string(),
            yes_token: "yes-1".to_string(),
            no_token: "no-1".to_string(),
            tick_size: 0.01,
            end_date: None,
            created_at: None,
        }
    }

    fn book(token: &str, bid: (f64, f64), ask: (f64, f64)) -> OrderBook {
        OrderBook::new(
            token,
            vec![BookLevel::new(bid.0, bid.1)],
            vec![BookLevel::new(ask.0, ask.1)],
        )
    }

    #[test]
    fn buy_merge_profit_after_gas() {
        let detector = ArbitrageDetector::new(make_config());
        let market = make_market();
        let opp = detector
            .detect(
                &market,
                &book("yes-1", (0.46, 100.0), (0.48, 100.0)),
                &book("no-1", (0.47, 100.0), (0.50, 100.0)),
            )
            .unwrap();
        assert_eq!(opp.kind, ArbitrageKind::BuyMerge);
        assert!((opp.profit_per_share - 0.015).abs() < 1e-9);
        assert!((opp.profit_pct - 1.5).abs() < 1e-6);
        assert!((opp.size - 50.0).abs() < 1e-9);
    }

    #[test]
    fn split_sell_and_rejections() {
        let detector = ArbitrageDetector::new(make_config());
        let market = make_market();
        let opp = detector
            .detect(
                &market,
                &book("yes-1", (0.53, 10.0), (0.55, 10.0)),
                &book("no-1", (0.49, 8.0), (0.51, 10.0)),
            )
            .unwrap();
        assert_eq!(opp.kind, ArbitrageKind::SplitSell);
        assert!((opp.size - 8.0).abs() < 1e-9);

        let thin = detector.detect(
            &market,
            &book("yes-1", (0.46, 100.0), (0.48, 3.0)),
            &book("no-1", (0.47, 100.0), (0.50, 100.0)),
        );
        assert_eq!(thin, Err(ArbRejection::InsufficientDepth));

        let tiny = detector.detect(
            &market,
            &book("yes-1", (0.46, 100.0), (0.49, 100.0)),
            &book("no-1", (0.47, 100.0), (0.505, 100.0)),
        );
        assert_eq!(tiny, Err(ArbRejection::BelowMinProfit));

        let fair = detector.detect(
            &market,
            &book("yes-1", (0.49, 100.0), (0.51, 100.0)),
            &book("no-1", (0.49, 100.0), (0.51, 100.0)),
        );
        assert_eq!(fair, Err(ArbRejection::NoArbitrage));
    }

    #[tokio::test]
    async fn buy_merge_executes_and_realizes() {
        let gateway = PaperGateway::new(100.0);
        gateway.set_book(book("yes-1", (0.46, 20.0), (0.48, 20.0)));
        gateway.set_book(book("no-1", (0.47, 20.0), (0.50, 20.0)));
        let detector = ArbitrageDetector::new(make_config());
        let ledger = InventoryLedger::new();
        let journal = EventJournal::disabled();
        let market = make_market();

        let opp = detector
            .detect(
                &market,
                &gateway.get_book("yes-1").await.unwrap(),
                &gateway.get_book("no-1").await.unwrap(),
            )
            .unwrap();
        let outcome = detector
            .execute(&gateway, &ledger, &journal, &market, &opp, Utc::now())
            .await
            .unwrap();

        match outcome {
            ArbitrageOutcome::Completed { pairs, profit } => {
                assert!((pairs - 20.0).abs() < 1e-9);
                assert!((profit - 0.30).abs() < 1e-6);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(ledger.position("cond-1", Outcome::Yes).await.map_or(true, |p| p.size() < 1e-9));
        assert!((ledger.realized_pnl().await - 0.40).abs() < 1e-6);
    }

    #[tokio::test]
    async fn broken_second_leg_leaves_inventory() {
        let gateway = PaperGateway::new(100.0);
        gateway.set_book(book("yes-1", (0.46, 20.0), (0.48, 20.0)));
        // NO side has no asks left to take
        gateway.set_book(OrderBook::new("no-1", vec![BookLevel::new(0.47, 20.0)], vec![]));
        let detector = ArbitrageDetector::new(make_config());
        let ledger = InventoryLedger::new();
        let journal = EventJournal::disabled();
        let market = make_market();
        let opp = ArbitrageOpportunity {
            market_id: market.id.clone(),
            kind: ArbitrageKind::BuyMerge,
            yes_price: 0.48,
            no_price: 0.50,
            size: 10.0,
            profit_per_share: 0.015,
            profit_pct: 1.5,
        };

        let outcome = detector
            .execute(&gateway, &ledger, &journal, &market, &opp, Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, ArbitrageOutcome::Partial { .. }));
        let yes = ledger.position("cond-1", Outcome::Yes).await.unwrap();
        assert!((yes.size() - 10.0).abs() < 1e-9);
        assert_eq!(gateway.open_order_count(), 0);
    }
}
