//! Advisory oracle boundary
//!
//! Optional scoring and validation calls to an external model service.
//! Every call site goes through [`consult`], which bounds the call with a
//! timeout and turns any failure into [`OracleOutcome::Fallback`]; the caller
//! then applies its own default (reject entries, proceed with exits, no guard
//! action, no parameter changes).

mod http;

pub use http::HttpOracle;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::OracleError;

/// Portfolio summary attached to oracle requests
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub balance: f64,
    pub mm_exposure: f64,
    pub cd_exposure: f64,
    pub open_cd_positions: usize,
}

/// Directional entry awaiting approval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryContext {
    pub market_id: String,
    pub question: String,
    pub coin: String,
    pub spot: f64,
    pub strike: f64,
    pub direction: String,
    pub outcome: String,
    pub days_to_expiry: f64,
    pub model_probability: f64,
    pub market_probability: f64,
    pub edge_pts: f64,
    pub daily_vol: f64,
    pub size_usd: f64,
    pub portfolio: PortfolioSnapshot,
}

/// Directional exit awaiting confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitContext {
    pub market_id: String,
    pub question: String,
    pub outcome: String,
    pub entry_price: f64,
    pub current_price: f64,
    pub edge_pts: f64,
    pub reason: String,
}

/// Approve/reject answer with a confidence and rationale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleVerdict {
    #[serde(alias = "trade", alias = "exit")]
    pub approve: bool,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default, alias = "reason")]
    pub rationale: String,
}

/// One actively traded market sent to the guard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardMarketContext {
    pub market_id: String,
    pub question: String,
    /// Hours since listing, when known
    pub hours_old: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardReport {
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub kill_markets: Vec<String>,
}

/// Post-trade statistics for the directional strategy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisContext {
    pub signals_observed: usize,
    pub signals_entered: usize,
    pub closed_positions: usize,
    pub wins: usize,
    pub losses: usize,
    pub realized_pnl: f64,
    pub avg_entry_edge_pts: f64,
    pub exit_reasons: Vec<(String, usize)>,
    pub min_edge_pts: f64,
    pub kelly_fraction: f64,
    pub student_t_nu: f64,
    pub stop_loss_pts: f64,
    pub take_profit_pts: f64,
}

/// Suggested parameter values; `None` means keep
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSuggestions {
    #[serde(default, alias = "cd_min_edge_pts")]
    pub min_edge_pts: Option<f64>,
    #[serde(default, alias = "cd_kelly_fraction")]
    pub kelly_fraction: Option<f64>,
    #[serde(default, alias = "cd_student_t_nu")]
    pub student_t_nu: Option<f64>,
    #[serde(default, alias = "cd_exit_stop_loss_pts")]
    pub stop_loss_pts: Option<f64>,
    #[serde(default, alias = "cd_exit_take_profit_pts")]
    pub take_profit_pts: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub parameter_suggestions: ParameterSuggestions,
}

/// External advisory service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AdvisoryOracle: Send + Sync {
    fn is_enabled(&self) -> bool;

    async fn validate_entry(&self, ctx: &EntryContext) -> Result<OracleVerdict, OracleError>;

    async fn confirm_exit(&self, ctx: &ExitContext) -> Result<OracleVerdict, OracleError>;

    async fn guard_markets(
        &self,
        markets: &[GuardMarketContext],
    ) -> Result<GuardReport, OracleError>;

    async fn analyze(&self, ctx: &AnalysisContext) -> Result<AnalysisReport, OracleError>;
}

/// Result of a bounded oracle call
#[derive(Debug, Clone, PartialEq)]
pub enum OracleOutcome<T> {
    Answered(T),
    /// No usable answer; the caller applies its default
    Fallback(String),
}

impl<T> OracleOutcome<T> {
    pub fn answered(self) -> Option<T> {
        match self {
            OracleOutcome::Answered(value) => Some(value),
            OracleOutcome::Fallback(_) => None,
        }
    }
}

/// Run an oracle call with a hard timeout. Never returns an error.
pub async fn consult<T, F>(timeout: Duration, call_site: &str, call: F) -> OracleOutcome<T>
where
    F: Future<Output = Result<T, OracleError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => OracleOutcome::Answered(value),
        Ok(Err(OracleError::Disabled)) => OracleOutcome::Fallback("disabled".to_string()),
        Ok(Err(err)) => {
            warn!(call_site, error = %err, "Oracle call failed, using fallback");
            OracleOutcome::Fallback(err.to_string())
        }
        Err(_) => {
            let err = OracleError::Timeout(timeout.as_millis() as u64);
            warn!(call_site, error = %err, "Oracle call timed out, using fallback");
            OracleOutcome::Fallback(err.to_string())
        }
    }
}

/// Oracle used when the service is switched off
pub struct DisabledOracle;

#[async_trait]
impl AdvisoryOracle for DisabledOracle {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn validate_entry(&self, _ctx: &EntryContext) -> Result<OracleVerdict, OracleError> {
        Err(OracleError::Disabled)
    }

    async fn confirm_exit(&self, _ctx: &ExitContext) -> Result<OracleVerdict, OracleError> {
        Err(OracleError::Disabled)
    }

    async fn guard_markets(
        &self,
        _markets: &[GuardMarketContext],
    ) -> Result<GuardReport, OracleError> {
        Err(OracleError::Disabled)
    }

    async fn analyze(&self, _ctx: &AnalysisContext) -> Result<AnalysisReport, OracleError> {
        Err(OracleError::Disabled)
    }
}

/// Pull the first JSON object out of free text
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(text.trim()) {
        if value.is_object() {
            return Some(value);
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}
