//! Execution gateway boundary
//!
//! Everything the core needs from the exchange goes through [`ExecutionGateway`]:
//! - order-book snapshots and midpoints
//! - order placement, cancellation and status
//! - collateral and outcome-token balances
//! - merge / split of complete sets
//!
//! Any failure means "unknown", never zero.

pub mod clob;
pub mod paper;
mod signing;

pub use clob::{ClobGateway, PublicClob};
pub use paper::PaperGateway;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ExecutionConfig;
use crate::error::GatewayError;
use crate::types::{Market, OrderBook, OrderSide, Outcome, StrategyKind};

/// A limit order the core wants on the book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub market_id: String,
    pub token_id: String,
    pub outcome: Outcome,
    pub side: OrderSide,
    pub price: f64,
    /// Shares
    pub size: f64,
    pub post_only: bool,
    pub tick_size: f64,
    pub strategy: StrategyKind,
}

impl OrderRequest {
    pub fn notional(&self) -> f64 {
        self.price * self.size
    }
}

/// Exchange acknowledgement of a placed order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub order_id: String,
    /// Shares matched immediately on placement (taker orders)
    pub size_matched: f64,
    /// Raw exchange status string
    pub status: String,
}

/// Structured result of a placement attempt
#[derive(Debug, Clone, PartialEq)]
pub enum PlacementOutcome {
    Placed(PlacedOrder),
    /// Exchange or post-only rejection, do not retry as-is
    Rejected(String),
    /// State unknown after a transport failure
    Failed(GatewayError),
}

impl From<Result<PlacedOrder, GatewayError>> for PlacementOutcome {
    fn from(result: Result<PlacedOrder, GatewayError>) -> Self {
        match result {
            Ok(placed) => PlacementOutcome::Placed(placed),
            Err(GatewayError::WouldCross(reason)) | Err(GatewayError::Rejected(reason)) => {
                PlacementOutcome::Rejected(reason)
            }
            Err(err) => PlacementOutcome::Failed(err),
        }
    }
}

/// Authoritative order state as reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatusReport {
    pub order_id: String,
    pub token_id: String,
    pub side: OrderSide,
    pub price: f64,
    pub original_size: f64,
    pub size_matched: f64,
    /// Raw exchange status (LIVE, MATCHED, CANCELED, ...)
    pub status: String,
}

impl OrderStatusReport {
    pub fn remaining(&self) -> f64 {
        (self.original_size - self.size_matched).max(0.0)
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.status.to_uppercase().as_str(),
            "LIVE" | "OPEN" | "ACTIVE"
        )
    }
}

/// Exchange contract consumed by every strategy loop
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    /// Human-readable name for logs
    fn name(&self) -> &'static str;

    async fn get_book(&self, token_id: &str) -> Result<OrderBook, GatewayError>;

    async fn get_midpoint(&self, token_id: &str) -> Result<f64, GatewayError>;

    async fn place_order(&self, request: &OrderRequest) -> Result<PlacedOrder, GatewayError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError>;

    async fn cancel_all(&self) -> Result<(), GatewayError>;

    async fn get_order(&self, order_id: &str) -> Result<OrderStatusReport, GatewayError>;

    async fn get_open_orders(&self) -> Result<Vec<OrderStatusReport>, GatewayError>;

    /// Collateral (USDC) balance
    async fn get_balance(&self) -> Result<f64, GatewayError>;

    /// Outcome-token balance in shares
    async fn get_token_balance(
        &self,
        market: &Market,
        outcome: Outcome,
    ) -> Result<f64, GatewayError>;

    /// Redeem `size` complete sets into collateral
    async fn merge_positions(&self, market: &Market, size: f64) -> Result<(), GatewayError>;

    /// Mint `size` complete sets from collateral
    async fn split_position(&self, market: &Market, size: f64) -> Result<(), GatewayError>;
}

/// Bounded exponential backoff for transient gateway failures
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 250,
            max_delay_ms: 4_000,
        }
    }
}

impl From<&ExecutionConfig> for RetryPolicy {
    fn from(cfg: &ExecutionConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base_delay_ms: cfg.retry_base_delay_ms,
            max_delay_ms: cfg.retry_max_delay_ms,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (0-based), with up to 20% jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.max_delay_ms);
        let jitter_cap = ((base as f64) * 0.20).round() as u64;
        let jitter = if jitter_cap > 0 {
            rand::thread_rng().gen_range(0..=jitter_cap)
        } else {
            0
        };
        Duration::from_millis(base.saturating_add(jitter).min(self.max_delay_ms.max(1)))
    }
}

/// Run `op`, retrying only transient failures
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                debug!(
                    call = label,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying gateway call"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_transient() {
                    warn!(call = label, attempts = attempt + 1, error = %err, "Gateway call failed after retries");
                }
                return Err(err);
            }
        }
    }
}

/// Decorator adding bounded retry to idempotent gateway calls.
///
/// Placement, merge and split are passed through once: a transport failure
/// there leaves the order state unknown and reconciliation resolves it.
pub struct RetryingGateway {
    inner: Arc<dyn ExecutionGateway>,
    policy: RetryPolicy,
}

impl RetryingGateway {
    pub fn new(inner: Arc<dyn ExecutionGateway>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl ExecutionGateway for RetryingGateway {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn get_book(&self, token_id: &str) -> Result<OrderBook, GatewayError> {
        with_retry(self.policy, "get_book", move || self.inner.get_book(token_id)).await
    }

    async fn get_midpoint(&self, token_id: &str) -> Result<f64, GatewayError> {
        with_retry(self.policy, "get_midpoint", move || self.inner.get_midpoint(token_id)).await
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<PlacedOrder, GatewayError> {
        self.inner.place_order(request).await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError> {
        with_retry(self.policy, "cancel_order", move || self.inner.cancel_order(order_id)).await
    }

    async fn cancel_all(&self) -> Result<(), GatewayError> {
        with_retry(self.policy, "cancel_all", move || self.inner.cancel_all()).await
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderStatusReport, GatewayError> {
        with_retry(self.policy, "get_order", move || self.inner.get_order(order_id)).await
    }

    async fn get_open_orders(&self) -> Result<Vec<OrderStatusReport>, GatewayError> {
        with_retry(self.policy, "get_open_orders", move || self.inner.get_open_orders()).await
    }

    async fn get_balance(&self) -> Result<f64, GatewayError> {
        with_retry(self.policy, "get_balance", move || self.inner.get_balance()).await
    }

    async fn get_token_balance(
        &self,
        market: &Market,
        outcome: Outcome,
    ) -> Result<f64, GatewayError> {
        with_retry(self.policy, "get_token_balance", move || {
            self.inner.get_token_balance(market, outcome)
        })
        .await
    }

    async fn merge_positions(&self, market: &Market, size: f64) -> Result<(), GatewayError> {
        self.inner.merge_positions(market, size).await
    }

    async fn split_position(&self, market: &Market, size: f64) -> Result<(), GatewayError> {
        self.inner.split_position(market, size).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    #[test]
    fn backoff_is_bounded() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        };
        assert!(policy.delay_for(0) >= Duration::from_millis(100));
        assert!(policy.delay_for(20) <= Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_retry(fast_policy(), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(GatewayError::Transient("timeout".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_rejections() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(fast_policy(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(GatewayError::Rejected("bad price".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(fast_policy(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(GatewayError::Transient("503".into())) }
        })
        .await;
        assert!(matches!(result, Err(GatewayError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn placement_outcome_classifies_errors() {
        let rejected: PlacementOutcome = Err(GatewayError::WouldCross("x".into())).into();
        assert!(matches!(rejected, PlacementOutcome::Rejected(_)));
        let failed: PlacementOutcome = Err(GatewayError::Transient("x".into())).into();
        assert!(matches!(failed, PlacementOutcome::Failed(_)));
    }
}
