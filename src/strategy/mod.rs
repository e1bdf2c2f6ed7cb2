//! Strategy loops and the context they share
//!
//! Each loop owns its own scratch state (trackers, detectors) and reaches
//! the shared pieces only through [`StrategyContext`]:
//! - [`market_maker`]: two-sided quoting plus complete-set arbitrage
//! - [`directional`]: crypto threshold entries
//! - [`exit`]: stop-loss / take-profit / edge-reversal exits, never paused
//! - [`analysis`]: post-trade review and bounded parameter suggestions
//! - [`guard`]: oracle-driven market kill list

pub mod analysis;
pub mod directional;
pub mod exit;
pub mod guard;
pub mod market_maker;

pub use analysis::PostTradeAnalyzer;
pub use directional::DirectionalTrader;
pub use exit::ExitMonitor;
pub use guard::MarketGuard;
pub use market_maker::MarketMaker;

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::directional::book::BookSnapshot;
use crate::directional::{DirectionalBook, DirectionalTunables, SignalTracker};
use crate::gateway::ExecutionGateway;
use crate::inventory::{InventoryLedger, LedgerSnapshot};
use crate::markets::MarketSource;
use crate::oracle::{AdvisoryOracle, PortfolioSnapshot};
use crate::persistence::EventJournal;
use crate::quoter::Quoter;
use crate::risk::{BalanceReading, CapitalBudget, RiskEvent, RiskManager, RiskState};
use crate::spot::SpotFeed;
use crate::types::Market;

pub const LEDGER_SNAPSHOT: &str = "ledger";
pub const RISK_SNAPSHOT: &str = "risk";
pub const BOOK_SNAPSHOT: &str = "directional";
pub const MARKETS_SNAPSHOT: &str = "markets";

/// External collaborators, injected at startup
pub struct Collaborators {
    pub gateway: Arc<dyn ExecutionGateway>,
    pub markets: Arc<dyn MarketSource>,
    pub spot: Arc<dyn SpotFeed>,
    pub oracle: Arc<dyn AdvisoryOracle>,
    pub journal: EventJournal,
}

/// Shared state handed to every loop
pub struct StrategyContext {
    pub config: AppConfig,
    pub gateway: Arc<dyn ExecutionGateway>,
    pub markets: Arc<dyn MarketSource>,
    pub spot: Arc<dyn SpotFeed>,
    pub oracle: Arc<dyn AdvisoryOracle>,
    pub journal: EventJournal,
    pub risk: RiskManager,
    pub ledger: InventoryLedger,
    pub quoter: Mutex<Quoter>,
    pub book: DirectionalBook,
    pub signals: Mutex<SignalTracker>,
    pub tunables: RwLock<DirectionalTunables>,
    /// Every market any loop has touched, for reconciliation
    known_markets: RwLock<HashMap<String, Market>>,
}

impl StrategyContext {
    /// Fresh state, ignoring any snapshots on disk
    pub fn new(config: AppConfig, deps: Collaborators) -> Self {
        Self::assemble(config, deps, None, None, None, HashMap::new())
    }

    /// Restore ledger, risk state, directional book and known markets from
    /// the journal's snapshots where present
    pub fn restore(config: AppConfig, deps: Collaborators) -> Result<Self> {
        let ledger = deps.journal.load_snapshot::<LedgerSnapshot>(LEDGER_SNAPSHOT)?;
        let risk = deps.journal.load_snapshot::<RiskState>(RISK_SNAPSHOT)?;
        let book = deps.journal.load_snapshot::<BookSnapshot>(BOOK_SNAPSHOT)?;
        let markets = deps
            .journal
            .load_snapshot::<Vec<Market>>(MARKETS_SNAPSHOT)?
            .unwrap_or_default()
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();
        info!(
            ledger = ledger.is_some(),
            risk = risk.is_some(),
            directional = book.is_some(),
            "State restored from snapshots"
        );
        Ok(Self::assemble(config, deps, ledger, risk, book, markets))
    }

    fn assemble(
        config: AppConfig,
        deps: Collaborators,
        ledger: Option<LedgerSnapshot>,
        risk: Option<RiskState>,
        book: Option<BookSnapshot>,
        markets: HashMap<String, Market>,
    ) -> Self {
        let risk = match risk {
            Some(state) => RiskManager::restore(config.risk.clone(), state),
            None => RiskManager::new(config.risk.clone()),
        };
        Self {
            gateway: deps.gateway,
            markets: deps.markets,
            spot: deps.spot,
            oracle: deps.oracle,
            journal: deps.journal,
            risk,
            ledger: ledger.map(InventoryLedger::from_snapshot).unwrap_or_default(),
            quoter: Mutex::new(Quoter::new(config.quoter.clone(), config.mm.post_only)),
            book: book.map(DirectionalBook::from_snapshot).unwrap_or_default(),
            signals: Mutex::new(SignalTracker::new(config.cd.confirmation_cycles)),
            tunables: RwLock::new(DirectionalTunables::from_config(&config.cd, &config.cd_exit)),
            known_markets: RwLock::new(markets),
            config,
        }
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_millis(self.config.oracle.timeout_ms)
    }

    /// Track markets for reconciliation. New ones are persisted at once so a
    /// crash cannot hide a market from the next startup reconcile.
    pub async fn remember_markets<'a>(&self, markets: impl IntoIterator<Item = &'a Market>) {
        let incoming: Vec<Market> = markets.into_iter().cloned().collect();
        let mut known = self.known_markets.write().await;
        let mut added = 0;
        for market in incoming {
            if !known.contains_key(&market.id) {
                known.insert(market.id.clone(), market);
                added += 1;
            }
        }
        if added == 0 {
            return;
        }
        let mut all: Vec<&Market> = known.values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        if let Err(err) = self.journal.save_snapshot(MARKETS_SNAPSHOT, &all) {
            warn!(error = %err, added, "Failed to persist known markets");
        }
    }

    pub async fn known_market(&self, market_id: &str) -> Option<Market> {
        self.known_markets.read().await.get(market_id).cloned()
    }

    pub async fn known_markets(&self) -> Vec<Market> {
        let mut markets: Vec<Market> = self.known_markets.read().await.values().cloned().collect();
        markets.sort_by(|a, b| a.id.cmp(&b.id));
        markets
    }

    /// Balance from the gateway, read fresh. A failed read is `Unknown` and
    /// flags the risk manager.
    pub async fn read_balance(&self, now: DateTime<Utc>) -> BalanceReading {
        match self.gateway.get_balance().await {
            Ok(balance) => BalanceReading::Known(balance),
            Err(err) => {
                warn!(error = %err, "Balance query failed, capital unknown");
                if let Some(event) = self.risk.mark_capital_unknown() {
                    self.journal_risk(&[event], now).await;
                }
                BalanceReading::Unknown
            }
        }
    }

    /// Capital available for one decision: fresh balance minus capital
    /// locked in live quotes and unfilled directional entries
    pub async fn capital_budget(&self, now: DateTime<Utc>) -> CapitalBudget {
        let balance = self.read_balance(now).await;
        let locked_in_quotes = self.quoter.lock().await.locked_capital();
        let locked_in_entries = self.book.pending_entry_notional().await;
        CapitalBudget::new(balance, locked_in_quotes, locked_in_entries)
    }

    pub async fn portfolio_snapshot(&self, balance: f64) -> PortfolioSnapshot {
        let cd_exposure = self.book.exposure().await;
        let total = self.ledger.total_exposure().await;
        PortfolioSnapshot {
            balance,
            mm_exposure: (total - cd_exposure).max(0.0),
            cd_exposure,
            open_cd_positions: self.book.count().await,
        }
    }

    /// Journal risk events and persist the risk state they came from
    pub async fn journal_risk(&self, events: &[RiskEvent], now: DateTime<Utc>) {
        for event in events {
            if let Err(err) = self.journal.record_risk(&event.to_record(now)).await {
                warn!(error = %err, kind = event.kind(), "Failed to journal risk event");
            }
        }
        if !events.is_empty() {
            self.save_risk_snapshot();
        }
    }

    pub fn save_risk_snapshot(&self) {
        if let Err(err) = self.journal.save_snapshot(RISK_SNAPSHOT, &self.risk.snapshot()) {
            warn!(error = %err, "Failed to persist risk state");
        }
    }

    /// Persist ledger, risk state, directional book and known markets
    pub async fn save_snapshots(&self) -> Result<()> {
        self.journal
            .save_snapshot(LEDGER_SNAPSHOT, &self.ledger.snapshot().await)?;
        self.journal.save_snapshot(RISK_SNAPSHOT, &self.risk.snapshot())?;
        self.journal
            .save_snapshot(BOOK_SNAPSHOT, &self.book.snapshot().await)?;
        self.journal
            .save_snapshot(MARKETS_SNAPSHOT, &self.known_markets().await)?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::gateway::PaperGateway;
    use crate::markets::StaticMarketSource;
    use crate::spot::FixedSpotFeed;

    #[tokio::test]
    async fn budget_subtracts_locked_capital() {
        let gateway = Arc::new(PaperGateway::new(100.0));
        let ctx = make_context(
            gateway.clone(),
            StaticMarketSource::new(vec![], vec![]),
            FixedSpotFeed::default(),
            disabled_oracle(),
        );
        let budget = ctx.capital_budget(Utc::now()).await;
        assert_eq!(budget.available(), Some(100.0));

        gateway.set_balance_unavailable(true);
        let budget = ctx.capital_budget(Utc::now()).await;
        assert_eq!(budget.available(), None);
    }

    #[tokio::test]
    async fn remembers_markets_once() {
        let ctx = make_context(
            Arc::new(PaperGateway::new(100.0)),
            StaticMarketSource::new(vec![], vec![]),
            FixedSpotFeed::default(),
            disabled_oracle(),
        );
        let market = make_market("m1");
        ctx.remember_markets([&market, &market]).await;
        assert_eq!(ctx.known_markets().await.len(), 1);
        assert_eq!(ctx.known_market("m1").await, Some(market));
    }
}
