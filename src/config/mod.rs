//! Configuration management
//!
//! Layers compiled defaults, optional `config/default.*` and `config/local.*`
//! files, then `POLYHYBRID__*` environment variables (with `.env` support).
//! Every subsystem gets its own immutable struct, validated once at startup.

mod types;

pub use types::*;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub logging: LoggingConfig,
    pub orchestrator: OrchestratorConfig,
    pub pricing: PricingConfig,
    pub mm: MmConfig,
    pub quoter: QuoterConfig,
    pub arbitrage: ArbitrageConfig,
    pub cd: CdConfig,
    pub cd_exit: CdExitConfig,
    pub risk: RiskConfig,
    pub oracle: OracleConfig,
    pub execution: ExecutionConfig,
    pub persistence: PersistenceConfig,
    pub paper_trading: PaperTradingCfg,
    /// Fixed market universe; empty means discover through Gamma
    #[serde(default)]
    pub markets: Vec<MarketSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Version tag for logs and journal rows
    pub tag: String,
    /// Simulated execution instead of the live CLOB
    pub paper_mode: bool,
    pub mm_enabled: bool,
    pub cd_enabled: bool,
    pub cd_exit_enabled: bool,
    pub cd_analysis_enabled: bool,
    pub guard_enabled: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            tag: env!("CARGO_PKG_VERSION").to_string(),
            paper_mode: true,
            mm_enabled: true,
            cd_enabled: true,
            cd_exit_enabled: true,
            cd_analysis_enabled: true,
            guard_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// EnvFilter directive used when RUST_LOG is unset
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Loop cadences
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub mm_cycle_secs: u64,
    pub cd_cycle_secs: u64,
    pub cd_exit_cycle_secs: u64,
    pub cd_analysis_cycle_secs: u64,
    pub guard_cycle_secs: u64,
    pub maintenance_cycle_secs: u64,
    /// Full reconciliation every N maintenance ticks
    pub reconcile_every_ticks: u64,
    /// Bound on waiting for cancel confirmations during shutdown
    pub shutdown_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            mm_cycle_secs: 10,
            cd_cycle_secs: 900,          // 15 min
            cd_exit_cycle_secs: 120,     // 2 min
            cd_analysis_cycle_secs: 21_600, // 6 h
            guard_cycle_secs: 300,       // 5 min
            maintenance_cycle_secs: 30,
            reconcile_every_ticks: 10,
            shutdown_timeout_secs: 15,
        }
    }
}

/// Market-making pricing parameters (all spreads in points, 1 pt = 0.01)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    pub model: PricingModel,
    pub delta_min_pts: f64,
    pub delta_max_pts: f64,
    pub weight_vol: f64,
    pub weight_imbalance: f64,
    pub weight_stale: f64,
    pub weight_fee: f64,
    pub skew_factor: f64,
    pub quadratic_skew_factor: f64,
    /// Observations for the EWMA vol half-life
    pub vol_halflife: u32,
    pub stale_threshold_secs: f64,
    pub as_gamma_base: f64,
    pub as_gamma_alpha: f64,
    pub as_default_kappa: f64,
    pub as_kappa_window_mins: i64,
    pub as_max_t_days: f64,
    pub as_min_spread_pts: f64,
    pub as_max_spread_pts: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            model: PricingModel::Legacy,
            delta_min_pts: 1.5,
            delta_max_pts: 8.0,
            weight_vol: 0.3,
            weight_imbalance: 0.2,
            weight_stale: 0.3,
            weight_fee: 0.2,
            skew_factor: 0.5,
            quadratic_skew_factor: 0.3,
            vol_halflife: 20,
            stale_threshold_secs: 60.0,
            as_gamma_base: 0.1,
            as_gamma_alpha: 0.5,
            as_default_kappa: 1.5,
            as_kappa_window_mins: 60,
            as_max_t_days: 30.0,
            as_min_spread_pts: 3.0, // 2 * delta_min
            as_max_spread_pts: 12.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MmConfig {
    /// Upper bound on markets quoted per cycle
    pub max_markets: usize,
    /// Target quote notional per side (USDC)
    pub base_size_usd: f64,
    /// Inventory capacity per market (USDC)
    pub max_per_market_usd: f64,
    /// Fraction of capacity above which quoting turns reduce-only
    pub unwind_threshold: f64,
    pub unwind_max_hours: f64,
    /// Exchange minimum order size
    pub min_order_shares: f64,
    pub post_only: bool,
}

impl Default for MmConfig {
    fn default() -> Self {
        Self {
            max_markets: 10,
            base_size_usd: 5.0,
            max_per_market_usd: 25.0,
            unwind_threshold: 0.8,
            unwind_max_hours: 24.0,
            min_order_shares: 5.0,
            post_only: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoterConfig {
    pub requote_threshold_pts: f64,
    pub min_quote_lifetime_secs: i64,
    /// Passive reprice attempts after a crossing reject
    pub max_reprice_ticks: u32,
    pub cross_reject_threshold: u32,
    pub cross_cooldown_base_secs: i64,
    pub cross_cooldown_max_secs: i64,
}

impl Default for QuoterConfig {
    fn default() -> Self {
        Self {
            requote_threshold_pts: 0.5,
            min_quote_lifetime_secs: 10,
            max_reprice_ticks: 3,
            cross_reject_threshold: 3,
            cross_cooldown_base_secs: 300,
            cross_cooldown_max_secs: 1_800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageConfig {
    pub enabled: bool,
    /// Required gap beyond the unit price before a scan triggers
    pub margin: f64,
    /// Minimum net profit, percent of settlement value
    pub min_profit_pct: f64,
    pub min_size_shares: f64,
    pub max_size_shares: f64,
    /// Fixed cost per merge/split transaction (USDC)
    pub gas_cost_usd: f64,
    pub fill_wait_ms: u64,
}

impl Default for ArbitrageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            margin: 0.0,
            min_profit_pct: 0.5,
            min_size_shares: 5.0,
            max_size_shares: 50.0,
            gas_cost_usd: 0.005,
            fill_wait_ms: 2_000,
        }
    }
}

/// Crypto-directional entry parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdConfig {
    pub coins: Vec<String>,
    pub min_edge_pts: f64,
    pub confirmation_cycles: u32,
    pub kelly_fraction: f64,
    /// Percent of capital per position
    pub max_position_pct: f64,
    pub max_concurrent_positions: usize,
    pub min_shares: f64,
    pub min_size_usd: f64,
    pub ewma_lambda: f64,
    /// Daily closes used for the vol estimate
    pub ewma_span_days: usize,
    pub student_t_nu: f64,
    pub post_only: bool,
}

impl Default for CdConfig {
    fn default() -> Self {
        Self {
            coins: vec!["BTC".to_string(), "ETH".to_string()],
            min_edge_pts: 5.0,
            confirmation_cycles: 2,
            kelly_fraction: 0.25,
            max_position_pct: 5.0,
            max_concurrent_positions: 5,
            min_shares: 5.0,
            min_size_usd: 1.0,
            ewma_lambda: 0.94,
            ewma_span_days: 30,
            student_t_nu: 6.0,
            post_only: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdExitConfig {
    pub stop_loss_pts: f64,
    pub take_profit_pts: f64,
    /// Exit when the recomputed edge falls to or below this (negative) value
    pub edge_reversal_pts: f64,
}

impl Default for CdExitConfig {
    fn default() -> Self {
        Self {
            stop_loss_pts: 15.0,
            take_profit_pts: 20.0,
            edge_reversal_pts: -3.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub min_price: f64,
    pub max_price: f64,
    pub max_spread_pts: f64,
    pub min_spread_pts: f64,
    /// Drawdown from high-water mark (percent)
    pub dd_reduce_pct: f64,
    pub dd_kill_pct: f64,
    pub dd_resume_pct: f64,
    /// Intraday drawdown from the day's peak (percent)
    pub intraday_kill_pct: f64,
    pub intraday_resume_pct: f64,
    pub dd_cooldown_minutes: i64,
    pub max_auto_resumes_per_day: u32,
    /// Combined MM + CD notional as percent of total capital
    pub max_total_exposure_pct: f64,
    /// Directional daily volume as percent of available capital
    pub directional_daily_volume_pct: f64,
    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: i64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            min_price: 0.01,
            max_price: 0.99,
            max_spread_pts: 12.0,
            min_spread_pts: 1.0,
            dd_reduce_pct: 15.0,
            dd_kill_pct: 25.0,
            dd_resume_pct: 20.0,
            intraday_kill_pct: 20.0,
            intraday_resume_pct: 15.0,
            dd_cooldown_minutes: 30,
            max_auto_resumes_per_day: 3,
            max_total_exposure_pct: 75.0,
            directional_daily_volume_pct: 50.0,
            breaker_threshold: 5,
            breaker_cooldown_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    pub enabled: bool,
    pub endpoint: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub model: String,
    pub timeout_ms: u64,
    pub cd_entry_enabled: bool,
    pub cd_exit_confirm_enabled: bool,
    pub guard_enabled: bool,
    pub analysis_enabled: bool,
    /// Apply bounded parameter suggestions from post-trade analysis
    pub analysis_auto_apply: bool,
    /// Kill-list entries expire after this many hours
    pub guard_kill_ttl_hours: i64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "https://api.anthropic.com/v1/messages".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            model: "claude-haiku-4-5".to_string(),
            timeout_ms: 8_000,
            cd_entry_enabled: true,
            cd_exit_confirm_enabled: true,
            guard_enabled: true,
            analysis_enabled: true,
            analysis_auto_apply: true,
            guard_kill_ttl_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub clob_url: String,
    pub gamma_url: String,
    pub binance_url: String,
    /// JSON-RPC endpoint for on-chain merge/split
    pub polygon_rpc_url: String,
    /// Polygon chain ID (137)
    pub chain_id: u64,
    /// Signature type (0=EOA, 1=Proxy, 2=Safe)
    pub signature_type: u8,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            clob_url: "https://clob.polymarket.com".to_string(),
            gamma_url: "https://gamma-api.polymarket.com".to_string(),
            binance_url: "https://api.binance.com".to_string(),
            polygon_rpc_url: "https://polygon-rpc.com".to_string(),
            chain_id: 137,
            signature_type: 0,
            request_timeout_ms: 10_000,
            max_retries: 3,
            retry_base_delay_ms: 250,
            retry_max_delay_ms: 4_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub data_dir: String,
    pub journal_enabled: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            journal_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperTradingCfg {
    /// Starting virtual balance in USDC
    pub initial_balance: f64,
    /// Pull live books from the public CLOB endpoints
    pub live_books: bool,
}

impl Default for PaperTradingCfg {
    fn default() -> Self {
        Self {
            initial_balance: 1_000.0,
            live_books: true,
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let defaults =
            Config::try_from(&AppConfig::default()).context("Failed to serialize defaults")?;

        let config = Config::builder()
            .add_source(defaults)
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (POLYHYBRID__*)
            .add_source(
                Environment::with_prefix("POLYHYBRID")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("cd.coins")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;
        Ok(app_config)
    }

    /// Reject inconsistent settings before any loop starts
    pub fn validate(&self) -> Result<()> {
        let o = &self.orchestrator;
        for (name, secs) in [
            ("mm_cycle_secs", o.mm_cycle_secs),
            ("cd_cycle_secs", o.cd_cycle_secs),
            ("cd_exit_cycle_secs", o.cd_exit_cycle_secs),
            ("cd_analysis_cycle_secs", o.cd_analysis_cycle_secs),
            ("guard_cycle_secs", o.guard_cycle_secs),
            ("maintenance_cycle_secs", o.maintenance_cycle_secs),
        ] {
            if secs == 0 {
                bail!("orchestrator.{} must be greater than zero", name);
            }
        }
        if o.reconcile_every_ticks == 0 {
            bail!("orchestrator.reconcile_every_ticks must be greater than zero");
        }

        let p = &self.pricing;
        if p.delta_min_pts <= 0.0 || p.delta_min_pts > p.delta_max_pts {
            bail!(
                "pricing.delta_min_pts ({}) must be positive and <= delta_max_pts ({})",
                p.delta_min_pts,
                p.delta_max_pts
            );
        }
        if p.as_min_spread_pts <= 0.0 || p.as_min_spread_pts > p.as_max_spread_pts {
            bail!("pricing.as_min_spread_pts must be positive and <= as_max_spread_pts");
        }
        if p.as_max_spread_pts > self.risk.max_spread_pts {
            bail!(
                "pricing.as_max_spread_pts ({}) exceeds risk.max_spread_pts ({}); every AS quote at the cap would be rejected",
                p.as_max_spread_pts,
                self.risk.max_spread_pts
            );
        }

        let r = &self.risk;
        if r.dd_resume_pct >= r.dd_kill_pct {
            bail!(
                "risk.dd_resume_pct ({}) must be strictly below risk.dd_kill_pct ({})",
                r.dd_resume_pct,
                r.dd_kill_pct
            );
        }
        if r.intraday_resume_pct >= r.intraday_kill_pct {
            bail!("risk.intraday_resume_pct must be strictly below risk.intraday_kill_pct");
        }
        if r.dd_reduce_pct > r.dd_kill_pct {
            bail!("risk.dd_reduce_pct must not exceed risk.dd_kill_pct");
        }
        if !(0.0 < r.min_price && r.min_price < r.max_price && r.max_price < 1.0) {
            bail!("risk price bounds must satisfy 0 < min_price < max_price < 1");
        }
        if r.breaker_threshold == 0 {
            bail!("risk.breaker_threshold must be at least 1");
        }

        let cd = &self.cd;
        if !(cd.kelly_fraction > 0.0 && cd.kelly_fraction <= 1.0) {
            bail!("cd.kelly_fraction must be in (0, 1], got {}", cd.kelly_fraction);
        }
        if !(cd.max_position_pct > 0.0 && cd.max_position_pct <= 100.0) {
            bail!("cd.max_position_pct must be in (0, 100]");
        }
        if cd.student_t_nu <= 2.0 {
            bail!("cd.student_t_nu must be > 2 for a finite variance");
        }
        if !(cd.ewma_lambda > 0.0 && cd.ewma_lambda < 1.0) {
            bail!("cd.ewma_lambda must be in (0, 1)");
        }
        if cd.confirmation_cycles == 0 {
            bail!("cd.confirmation_cycles must be at least 1");
        }
        if self.cd_exit.edge_reversal_pts >= 0.0 {
            bail!("cd_exit.edge_reversal_pts must be negative");
        }

        let mm = &self.mm;
        if !(mm.unwind_threshold > 0.0 && mm.unwind_threshold <= 1.0) {
            bail!("mm.unwind_threshold must be in (0, 1]");
        }
        if mm.max_per_market_usd <= 0.0 || mm.base_size_usd <= 0.0 {
            bail!("mm sizes must be positive");
        }

        if self.arbitrage.min_size_shares > self.arbitrage.max_size_shares {
            bail!("arbitrage.min_size_shares must be <= max_size_shares");
        }

        Ok(())
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        format!(
            "tag={} paper={} mm={} cd={} guard={} model={} dd_kill={:.0}% dd_resume={:.0}% kelly={:.2} min_edge={:.1}pts",
            self.bot.tag,
            self.bot.paper_mode,
            self.bot.mm_enabled,
            self.bot.cd_enabled,
            self.bot.guard_enabled,
            self.pricing.model,
            self.risk.dd_kill_pct,
            self.risk.dd_resume_pct,
            self.cd.kelly_fraction,
            self.cd.min_edge_pts
        )
    }

    /// Validate required environment variables for live trading
    pub fn validate_env(&self) -> Result<()> {
        if self.bot.paper_mode {
            return Ok(());
        }
        for var in ["PRIVATE_KEY", "POLYMARKET_ADDRESS"] {
            if std::env::var(var).is_err() {
                bail!("Required environment variable {} is not set", var);
            }
        }

        let pk = std::env::var("PRIVATE_KEY")?;
        if !pk.starts_with("0x") || pk.len() != 66 {
            bail!("PRIVATE_KEY must be a hex string with 0x prefix (66 chars total)");
        }

        Ok(())
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok(), "{:?}", cfg.validate().err());
    }

    #[test]
    fn resume_threshold_must_sit_below_kill() {
        let mut cfg = AppConfig::default();
        cfg.risk.dd_resume_pct = 25.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn kelly_fraction_is_bounded() {
        let mut cfg = AppConfig::default();
        cfg.cd.kelly_fraction = 1.5;
        assert!(cfg.validate().is_err());
        cfg.cd.kelly_fraction = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn as_spread_cap_cannot_exceed_risk_cap() {
        let mut cfg = AppConfig::default();
        cfg.pricing.as_max_spread_pts = 15.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn pricing_model_parses_aliases() {
        let m: PricingModel = serde_json::from_str("\"avellaneda-stoikov\"").unwrap();
        assert_eq!(m, PricingModel::AvellanedaStoikov);
        let m: PricingModel = serde_json::from_str("\"legacy\"").unwrap();
        assert_eq!(m, PricingModel::Legacy);
    }
}
