//! Loop scheduler
//!
//! Six independently paced loops share one [`StrategyContext`]. Operator
//! commands and analysis-driven settings updates arrive on an mpsc channel
//! and are applied by the maintenance loop. Shutdown is ordered: stop the
//! loops, cancel every quote and wait for the exchange to confirm, book late
//! fills, reconcile inventory and orders, persist.

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::directional::SettingsUpdate;
use crate::error::GatewayError;
use crate::strategy::directional::sync_entries;
use crate::strategy::{DirectionalTrader, ExitMonitor, MarketGuard, MarketMaker, PostTradeAnalyzer, StrategyContext};
use crate::types::Market;

const CANCEL_CONFIRM_POLL: Duration = Duration::from_millis(250);

/// Operator and internal control messages
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Pause,
    Resume,
    /// Pause and pull every quote
    Kill,
    UpdateSettings(SettingsUpdate),
}

/// Cloneable handle for sending commands and requesting shutdown
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Command>,
    shutdown: watch::Sender<bool>,
}

impl OrchestratorHandle {
    pub async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow::anyhow!("orchestrator is no longer running"))
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

pub struct Orchestrator {
    ctx: Arc<StrategyContext>,
    commands: mpsc::Receiver<Command>,
    command_tx: mpsc::Sender<Command>,
    shutdown_tx: watch::Sender<bool>,
    shutdown: watch::Receiver<bool>,
}

/// Fixed-period ticker that yields `false` once shutdown is requested
struct Ticker {
    interval: Interval,
    shutdown: watch::Receiver<bool>,
}

impl Ticker {
    fn new(period_secs: u64, delay_first: bool, shutdown: watch::Receiver<bool>) -> Self {
        let period = Duration::from_secs(period_secs.max(1));
        let start = if delay_first {
            Instant::now() + period
        } else {
            Instant::now()
        };
        let mut interval = interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval, shutdown }
    }

    async fn next(&mut self) -> bool {
        if *self.shutdown.borrow() {
            return false;
        }
        tokio::select! {
            _ = self.interval.tick() => true,
            _ = self.shutdown.changed() => false,
        }
    }
}

impl Orchestrator {
    pub fn new(ctx: Arc<StrategyContext>) -> (Self, OrchestratorHandle) {
        let (command_tx, commands) = mpsc::channel(64);
        let (shutdown_tx, shutdown) = watch::channel(false);
        let handle = OrchestratorHandle {
            commands: command_tx.clone(),
            shutdown: shutdown_tx.clone(),
        };
        (
            Self {
                ctx,
                commands,
                command_tx,
                shutdown_tx,
                shutdown,
            },
            handle,
        )
    }

    /// Reconcile inventory and open orders against the gateway before any
    /// loop starts
    pub async fn startup(&self) -> Result<()> {
        let now = Utc::now();
        let markets = reconcile_universe(&self.ctx).await;
        let divergences = self
            .ctx
            .ledger
            .reconcile(self.ctx.gateway.as_ref(), &markets, &self.ctx.journal, now)
            .await;
        let orphans = cancel_orphans(&self.ctx).await;
        info!(
            markets = markets.len(),
            divergences = divergences.len(),
            orphans,
            positions = self.ctx.book.count().await,
            "🔄 Startup reconciliation done"
        );
        Ok(())
    }

    /// Run every loop until shutdown is requested, then shut down in order
    pub async fn run(mut self) -> Result<()> {
        let cfg = self.ctx.config.orchestrator.clone();
        let bot = self.ctx.config.bot.clone();
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        if bot.mm_enabled {
            tasks.push(("mm", tokio::spawn(mm_loop(self.ctx.clone(), cfg.mm_cycle_secs, self.shutdown.clone()))));
        }
        if bot.cd_enabled {
            tasks.push(("cd", tokio::spawn(cd_loop(self.ctx.clone(), cfg.cd_cycle_secs, self.shutdown.clone()))));
        }
        if bot.cd_exit_enabled {
            tasks.push((
                "cd_exit",
                tokio::spawn(exit_loop(self.ctx.clone(), cfg.cd_exit_cycle_secs, self.shutdown.clone())),
            ));
        }
        if bot.cd_analysis_enabled {
            tasks.push((
                "analysis",
                tokio::spawn(analysis_loop(
                    self.ctx.clone(),
                    cfg.cd_analysis_cycle_secs,
                    self.command_tx.clone(),
                    self.shutdown.clone(),
                )),
            ));
        }
        if bot.guard_enabled {
            tasks.push((
                "guard",
                tokio::spawn(guard_loop(self.ctx.clone(), cfg.guard_cycle_secs, self.shutdown.clone())),
            ));
        }
        info!(loops = tasks.len(), "🚀 Orchestrator running");

        // Maintenance runs on this task and owns the command channel
        let mut ticker = Ticker::new(cfg.maintenance_cycle_secs, false, self.shutdown.clone());
        let mut shutdown = self.shutdown.clone();
        let mut tick: u64 = 0;
        loop {
            tokio::select! {
                running = ticker.next() => {
                    if !running {
                        break;
                    }
                    tick += 1;
                    maintenance_tick(&self.ctx, tick, cfg.reconcile_every_ticks, Utc::now()).await;
                }
                Some(command) = self.commands.recv() => {
                    handle_command(&self.ctx, command, Utc::now()).await;
                }
                _ = shutdown.changed() => break,
            }
        }

        let _ = self.shutdown_tx.send(true);
        self.shutdown_sequence(tasks).await
    }

    async fn shutdown_sequence(&self, tasks: Vec<(&'static str, JoinHandle<()>)>) -> Result<()> {
        let timeout = Duration::from_secs(self.ctx.config.orchestrator.shutdown_timeout_secs);
        info!("🛑 Shutdown: stopping loops");
        let (names, handles): (Vec<&'static str>, Vec<JoinHandle<()>>) = tasks.into_iter().unzip();
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        match tokio::time::timeout(timeout, join_all(handles)).await {
            Ok(results) => {
                for (name, result) in names.iter().zip(results) {
                    match result {
                        Ok(()) => debug!(task = name, "Loop stopped"),
                        Err(err) => warn!(task = name, error = %err, "Loop ended abnormally"),
                    }
                }
            }
            Err(_) => {
                warn!("Loops did not stop in time, aborting");
                for abort in aborts {
                    abort.abort();
                }
            }
        }

        info!("🛑 Shutdown: cancelling quotes");
        match tokio::time::timeout(timeout, cancel_and_confirm(&self.ctx)).await {
            Ok(()) => info!("No open orders left on the exchange"),
            Err(_) => error!("Open orders still present after shutdown timeout"),
        }

        info!("🛑 Shutdown: booking late fills and reconciling");
        let now = Utc::now();
        let late = {
            let mut quoter = self.ctx.quoter.lock().await;
            quoter
                .poll_fills(self.ctx.gateway.as_ref(), &self.ctx.ledger, &self.ctx.journal, now)
                .await
        };
        match late {
            Ok(fills) if !fills.is_empty() => info!(fills = fills.len(), "Late quote fills booked"),
            Ok(_) => {}
            Err(err) => error!(error = %err, "Final fill poll failed"),
        }
        if let Err(err) = sync_entries(&self.ctx, now).await {
            error!(error = %err, "Final directional entry sync failed");
        }
        let markets = self.ctx.known_markets().await;
        let divergences = self
            .ctx
            .ledger
            .reconcile(self.ctx.gateway.as_ref(), &markets, &self.ctx.journal, now)
            .await;
        let orphans = cancel_orphans(&self.ctx).await;

        info!("🛑 Shutdown: persisting state");
        self.ctx.save_snapshots().await?;
        info!(
            divergences = divergences.len(),
            orphans,
            realized_pnl = self.ctx.ledger.realized_pnl().await,
            "✅ Shutdown complete"
        );
        Ok(())
    }
}

/// Cancel everything, then re-check the exchange until no order is open.
/// Stragglers are cancelled one by one on each pass.
async fn cancel_and_confirm(ctx: &StrategyContext) {
    let now = Utc::now();
    let cancel = ctx.quoter.lock().await.cancel_all(ctx.gateway.as_ref(), now).await;
    match cancel {
        Ok(cancelled) => info!(cancelled, "Cancel-all sent"),
        Err(err) => error!(error = %err, "Cancel-all failed, cancelling per order"),
    }
    loop {
        match ctx.gateway.get_open_orders().await {
            Ok(open) if open.is_empty() => return,
            Ok(open) => {
                warn!(remaining = open.len(), "Orders still open after cancel");
                for order in &open {
                    match ctx.gateway.cancel_order(&order.order_id).await {
                        Ok(()) | Err(GatewayError::NotFound(_)) => {}
                        Err(err) => debug!(order_id = %order.order_id, error = %err, "Cancel retry failed"),
                    }
                }
            }
            Err(err) => warn!(error = %err, "Open orders unavailable, cancel not yet confirmed"),
        }
        tokio::time::sleep(CANCEL_CONFIRM_POLL).await;
    }
}

/// Markets to reconcile at startup: everything remembered across restarts
/// plus the current universe of both strategies
async fn reconcile_universe(ctx: &StrategyContext) -> Vec<Market> {
    match ctx.markets.quoting_markets().await {
        Ok(markets) => ctx.remember_markets(&markets).await,
        Err(err) => warn!(error = %err, "Quoting universe unavailable at startup"),
    }
    match ctx.markets.threshold_markets().await {
        Ok(thresholds) => {
            let markets: Vec<Market> = thresholds.into_iter().map(|t| t.market).collect();
            ctx.remember_markets(&markets).await;
        }
        Err(err) => warn!(error = %err, "Threshold universe unavailable at startup"),
    }
    let markets = ctx.known_markets().await;
    if let Ok(open) = ctx.gateway.get_open_orders().await {
        let tokens: HashSet<&str> = markets
            .iter()
            .flat_map(|m| [m.yes_token.as_str(), m.no_token.as_str()])
            .collect();
        for order in &open {
            if !tokens.contains(order.token_id.as_str()) {
                warn!(order_id = %order.order_id, token = %order.token_id, "Open order on an untracked market");
            }
        }
    }
    markets
}

/// Escalate an internal loop failure to the kill-switch
async fn escalate(ctx: &StrategyContext, name: &str, err: anyhow::Error) {
    let now = Utc::now();
    let detail = format!("{} loop: {:#}", name, err);
    let event = ctx.risk.escalate_fatal(&detail, now);
    ctx.journal_risk(&[event], now).await;
    ctx.quoter
        .lock()
        .await
        .cancel_exposure_increasing(ctx.gateway.as_ref(), now)
        .await;
}

async fn mm_loop(ctx: Arc<StrategyContext>, secs: u64, shutdown: watch::Receiver<bool>) {
    let mut maker = MarketMaker::from_context(&ctx);
    let mut ticker = Ticker::new(secs, false, shutdown);
    while ticker.next().await {
        match maker.run_cycle(&ctx, Utc::now()).await {
            Ok(summary) => debug!(?summary, "MM cycle"),
            Err(err) => escalate(&ctx, "mm", err).await,
        }
    }
}

async fn cd_loop(ctx: Arc<StrategyContext>, secs: u64, shutdown: watch::Receiver<bool>) {
    let mut ticker = Ticker::new(secs, false, shutdown);
    while ticker.next().await {
        if let Err(err) = DirectionalTrader::run_cycle(&ctx, Utc::now()).await {
            escalate(&ctx, "cd", err).await;
        }
    }
}

async fn exit_loop(ctx: Arc<StrategyContext>, secs: u64, shutdown: watch::Receiver<bool>) {
    let mut ticker = Ticker::new(secs, false, shutdown);
    while ticker.next().await {
        match ExitMonitor::run_cycle(&ctx, Utc::now()).await {
            Ok(summary) if summary.exits > 0 => info!(?summary, "Exit cycle"),
            Ok(_) => {}
            Err(err) => escalate(&ctx, "cd_exit", err).await,
        }
    }
}

async fn analysis_loop(
    ctx: Arc<StrategyContext>,
    secs: u64,
    commands: mpsc::Sender<Command>,
    shutdown: watch::Receiver<bool>,
) {
    let mut ticker = Ticker::new(secs, true, shutdown);
    while ticker.next().await {
        if let Some(update) = PostTradeAnalyzer::run_cycle(&ctx, Utc::now()).await {
            if commands.send(Command::UpdateSettings(update)).await.is_err() {
                break;
            }
        }
    }
}

async fn guard_loop(ctx: Arc<StrategyContext>, secs: u64, shutdown: watch::Receiver<bool>) {
    let mut ticker = Ticker::new(secs, false, shutdown);
    while ticker.next().await {
        MarketGuard::run_cycle(&ctx, Utc::now()).await;
    }
}

async fn cancel_orphans(ctx: &StrategyContext) -> usize {
    let entries = ctx.book.entry_order_ids().await;
    match ctx
        .quoter
        .lock()
        .await
        .cancel_orphans(ctx.gateway.as_ref(), &entries)
        .await
    {
        Ok(cancelled) => cancelled,
        Err(err) => {
            warn!(error = %err, "Open orders unavailable, orphan sweep skipped");
            0
        }
    }
}

/// One maintenance pass: risk evaluation, kill handling, periodic
/// reconciliation, then a state snapshot
pub async fn maintenance_tick(ctx: &StrategyContext, tick: u64, reconcile_every: u64, now: DateTime<Utc>) {
    let portfolio_value = match ctx.read_balance(now).await.known() {
        Some(balance) => Some(balance + ctx.ledger.marked_value().await),
        None => None,
    };
    let events = ctx.risk.evaluate(portfolio_value, now);
    ctx.journal_risk(&events, now).await;
    if events.iter().any(|e| e.is_kill()) {
        let cancelled = ctx
            .quoter
            .lock()
            .await
            .cancel_exposure_increasing(ctx.gateway.as_ref(), now)
            .await;
        warn!(cancelled, "Kill-switch engaged, bids pulled");
    }

    if reconcile_every > 0 && tick % reconcile_every == 0 {
        let markets = ctx.known_markets().await;
        let divergences = ctx
            .ledger
            .reconcile(ctx.gateway.as_ref(), &markets, &ctx.journal, now)
            .await;
        let orphans = cancel_orphans(ctx).await;
        if !divergences.is_empty() || orphans > 0 {
            warn!(divergences = divergences.len(), orphans, "Reconciliation corrected state");
        }
    }

    if let Err(err) = ctx.save_snapshots().await {
        warn!(error = %err, "Failed to persist state on maintenance tick");
    }
}

pub async fn handle_command(ctx: &StrategyContext, command: Command, now: DateTime<Utc>) {
    match command {
        Command::Pause => {
            if let Some(event) = ctx.risk.pause_manual(now) {
                ctx.journal_risk(&[event], now).await;
            }
            ctx.quoter
                .lock()
                .await
                .cancel_exposure_increasing(ctx.gateway.as_ref(), now)
                .await;
        }
        Command::Resume => {
            if let Some(event) = ctx.risk.resume_manual() {
                ctx.journal_risk(&[event], now).await;
            }
        }
        Command::Kill => {
            if let Some(event) = ctx.risk.pause_manual(now) {
                ctx.journal_risk(&[event], now).await;
            }
            let result = ctx.quoter.lock().await.cancel_all(ctx.gateway.as_ref(), now).await;
            match result {
                Ok(cancelled) => warn!(cancelled, "☠️ Kill command: all orders cancelled"),
                Err(err) => error!(error = %err, "Kill command: cancel-all failed"),
            }
        }
        Command::UpdateSettings(update) => {
            let changes = ctx.tunables.write().await.apply(&update);
            for (name, old, new) in &changes {
                info!(setting = name, old, new, "⚙️ Directional setting updated");
            }
            if changes.is_empty() {
                debug!("Settings update changed nothing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::gateway::{ExecutionGateway, MockExecutionGateway, OrderStatusReport, PaperGateway};
    use crate::markets::StaticMarketSource;
    use crate::persistence::EventJournal;
    use crate::spot::FixedSpotFeed;
    use crate::strategy::test_support::*;
    use crate::strategy::Collaborators;
    use crate::types::{OrderSide, Outcome};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn collaborators(gateway: Arc<dyn ExecutionGateway>, journal: EventJournal) -> Collaborators {
        Collaborators {
            gateway,
            markets: Arc::new(StaticMarketSource::new(vec![], vec![])),
            spot: Arc::new(FixedSpotFeed::default()),
            oracle: disabled_oracle(),
            journal,
        }
    }

    fn journal_at(dir: &Path) -> EventJournal {
        EventJournal::new(dir).unwrap()
    }

    fn context(gateway: Arc<PaperGateway>) -> Arc<StrategyContext> {
        Arc::new(make_context(
            gateway,
            StaticMarketSource::new(vec![make_market("m1")], vec![]),
            FixedSpotFeed::default(),
            disabled_oracle(),
        ))
    }

    #[tokio::test]
    async fn pause_and_resume_commands() {
        let ctx = context(Arc::new(PaperGateway::new(100.0)));
        handle_command(&ctx, Command::Pause, Utc::now()).await;
        assert!(ctx.risk.is_paused());
        handle_command(&ctx, Command::Resume, Utc::now()).await;
        assert!(!ctx.risk.is_paused());
    }

    #[tokio::test]
    async fn settings_update_changes_tunables() {
        let ctx = context(Arc::new(PaperGateway::new(100.0)));
        let update = SettingsUpdate::bounded(Some(7.0), None, None, None, None);
        handle_command(&ctx, Command::UpdateSettings(update), Utc::now()).await;
        assert_eq!(ctx.tunables.read().await.min_edge_pts, 7.0);
    }

    #[tokio::test]
    async fn maintenance_reconciles_on_schedule() {
        let gateway = Arc::new(PaperGateway::new(100.0));
        let ctx = context(gateway.clone());
        let market = make_market("m1");
        ctx.remember_markets([&market]).await;
        gateway.credit_tokens(&market.yes_token, 12.0);

        maintenance_tick(&ctx, 1, 10, Utc::now()).await;
        assert!(ctx.ledger.position("m1", crate::types::Outcome::Yes).await.is_none());

        maintenance_tick(&ctx, 10, 10, Utc::now()).await;
        let held = ctx.ledger.position("m1", crate::types::Outcome::Yes).await.unwrap();
        assert!((held.size() - 12.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_and_persists() {
        let gateway = Arc::new(PaperGateway::new(100.0));
        gateway.set_book(make_book("m1-yes", 0.45, 0.55, 100.0));
        let ctx = context(gateway.clone());
        let (orchestrator, handle) = Orchestrator::new(ctx.clone());
        orchestrator.startup().await.unwrap();
        let run = tokio::spawn(orchestrator.run());
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.shutdown();
        run.await.unwrap().unwrap();
        assert_eq!(gateway.get_open_orders().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn startup_reconciles_source_markets() {
        let gateway = Arc::new(PaperGateway::new(100.0));
        gateway.credit_tokens("m1-yes", 8.0);
        let ctx = context(gateway);
        assert!(ctx.known_markets().await.is_empty());

        let (orchestrator, _handle) = Orchestrator::new(ctx.clone());
        orchestrator.startup().await.unwrap();

        let held = ctx.ledger.position("m1", Outcome::Yes).await.unwrap();
        assert!((held.size() - 8.0).abs() < 1e-9);
        assert!(ctx.known_market("m1").await.is_some());
    }

    #[tokio::test]
    async fn drawdown_pause_survives_a_crash() {
        let dir = std::env::temp_dir().join(format!("polyhybrid-orch-{}", uuid::Uuid::new_v4()));
        let gateway = Arc::new(PaperGateway::new(1000.0));
        {
            let ctx = StrategyContext::new(AppConfig::default(), collaborators(gateway.clone(), journal_at(&dir)));
            maintenance_tick(&ctx, 1, 0, Utc::now()).await;
            gateway.set_balance(700.0);
            maintenance_tick(&ctx, 2, 0, Utc::now()).await;
            assert!(ctx.risk.is_paused());
            // dropped without the shutdown sequence
        }

        let restored = StrategyContext::restore(AppConfig::default(), collaborators(gateway, journal_at(&dir))).unwrap();
        assert!(restored.risk.is_paused());
        assert_eq!(restored.risk.snapshot().high_water_mark, 1000.0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn shutdown_waits_for_straggler_orders() {
        let mut gateway = MockExecutionGateway::new();
        gateway.expect_name().return_const("mock");
        gateway.expect_cancel_all().times(1).returning(|| Ok(()));
        let polls = Arc::new(AtomicUsize::new(0));
        let seen = polls.clone();
        gateway.expect_get_open_orders().returning(move || {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(vec![OrderStatusReport {
                    order_id: "late-1".to_string(),
                    token_id: "m1-yes".to_string(),
                    side: OrderSide::Buy,
                    price: 0.45,
                    original_size: 10.0,
                    size_matched: 0.0,
                    status: "LIVE".to_string(),
                }])
            } else {
                Ok(vec![])
            }
        });
        gateway
            .expect_cancel_order()
            .withf(|order_id| order_id == "late-1")
            .times(1)
            .returning(|_| Ok(()));

        let ctx = Arc::new(StrategyContext::new(
            AppConfig::default(),
            collaborators(Arc::new(gateway), EventJournal::disabled()),
        ));
        let (orchestrator, _handle) = Orchestrator::new(ctx);
        orchestrator.shutdown_sequence(Vec::new()).await.unwrap();

        // straggler seen, empty confirmation, then the orphan sweep
        assert!(polls.load(Ordering::SeqCst) >= 3);
    }
}
