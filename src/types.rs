//! Core types shared by every subsystem
//!
//! - Binary markets and their complementary outcome tokens
//! - Order-book snapshots with normalization helpers
//! - Immutable fill records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Default Polymarket tick (1 point)
pub const DEFAULT_TICK: f64 = 0.01;
/// Lowest and highest tradable prices
pub const MIN_PRICE: f64 = 0.01;
pub const MAX_PRICE: f64 = 0.99;

/// Outcome token of a binary market
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Yes,
    No,
}

impl Outcome {
    pub fn complement(&self) -> Self {
        match self {
            Outcome::Yes => Outcome::No,
            Outcome::No => Outcome::Yes,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Yes => write!(f, "YES"),
            Outcome::No => write!(f, "NO"),
        }
    }
}

/// Order side (buy/sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Which strategy produced an order or fill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    MarketMaking,
    Directional,
    Arbitrage,
    Reconciliation,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::MarketMaking => write!(f, "MM"),
            StrategyKind::Directional => write!(f, "CD"),
            StrategyKind::Arbitrage => write!(f, "ARB"),
            StrategyKind::Reconciliation => write!(f, "RECON"),
        }
    }
}

/// A binary market with its two complementary tokens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    /// Condition id (used for merge/split)
    pub id: String,
    pub question: String,
    pub yes_token: String,
    pub no_token: String,
    pub tick_size: f64,
    /// Resolution time, when known
    pub end_date: Option<DateTime<Utc>>,
    /// Market creation time, when known
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Market {
    pub fn token(&self, outcome: Outcome) -> &str {
        match outcome {
            Outcome::Yes => &self.yes_token,
            Outcome::No => &self.no_token,
        }
    }

    pub fn outcome_of(&self, token_id: &str) -> Option<Outcome> {
        if token_id == self.yes_token {
            Some(Outcome::Yes)
        } else if token_id == self.no_token {
            Some(Outcome::No)
        } else {
            None
        }
    }

    /// Days until resolution (fractional). Unknown end dates count as 30 days.
    pub fn days_to_resolution(&self, now: DateTime<Utc>) -> f64 {
        match self.end_date {
            Some(end) => (end - now).num_seconds() as f64 / 86_400.0,
            None => 30.0,
        }
    }

    pub fn tick(&self) -> f64 {
        if self.tick_size > 0.0 {
            self.tick_size
        } else {
            DEFAULT_TICK
        }
    }
}

/// Direction of a crypto threshold market ("above $X" / "below $X")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdDirection {
    Above,
    Below,
}

impl fmt::Display for ThresholdDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThresholdDirection::Above => write!(f, "above"),
            ThresholdDirection::Below => write!(f, "below"),
        }
    }
}

/// A market asking whether a coin ends above/below a strike
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdMarket {
    pub market: Market,
    /// Ticker of the underlying (BTC, ETH)
    pub coin: String,
    pub strike: f64,
    pub direction: ThresholdDirection,
}

/// Price level in the order book
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

impl BookLevel {
    pub fn new(price: f64, size: f64) -> Self {
        Self { price, size }
    }

    fn is_valid(&self) -> bool {
        self.price.is_finite() && self.size.is_finite() && self.price > 0.0 && self.size > 0.0
    }
}

/// Order-book snapshot for one token
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub token_id: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub tick_size: f64,
    pub timestamp: i64,
}

impl OrderBook {
    pub fn new(token_id: impl Into<String>, bids: Vec<BookLevel>, asks: Vec<BookLevel>) -> Self {
        let mut book = Self {
            token_id: token_id.into(),
            bids,
            asks,
            tick_size: DEFAULT_TICK,
            timestamp: Utc::now().timestamp_millis(),
        };
        book.normalize_levels();
        book
    }

    /// Drop invalid levels and sort bids descending, asks ascending
    pub fn normalize_levels(&mut self) {
        self.bids.retain(BookLevel::is_valid);
        self.asks.retain(BookLevel::is_valid);
        self.bids
            .sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(Ordering::Equal));
        self.asks
            .sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(Ordering::Equal));
    }

    pub fn best_bid(&self) -> Option<BookLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<BookLevel> {
        self.asks.first().copied()
    }

    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) if ask.price > bid.price => Some((bid.price + ask.price) / 2.0),
            _ => None,
        }
    }

    pub fn spread(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask.price - bid.price),
            _ => None,
        }
    }

    /// Notional (USDC) resting on the top `levels` bids
    pub fn bid_depth(&self, levels: usize) -> f64 {
        self.bids
            .iter()
            .take(levels)
            .map(|l| l.price * l.size)
            .sum()
    }

    /// Notional (USDC) resting on the top `levels` asks
    pub fn ask_depth(&self, levels: usize) -> f64 {
        self.asks
            .iter()
            .take(levels)
            .map(|l| l.price * l.size)
            .sum()
    }

    /// Shares available at the top `levels` asks
    pub fn ask_shares(&self, levels: usize) -> f64 {
        self.asks.iter().take(levels).map(|l| l.size).sum()
    }

    /// Shares available at the top `levels` bids
    pub fn bid_shares(&self, levels: usize) -> f64 {
        self.bids.iter().take(levels).map(|l| l.size).sum()
    }

    /// (bid_volume - ask_volume) / total over the top levels, in [-1, 1]
    pub fn imbalance(&self, levels: usize) -> f64 {
        let bid_volume = self.bid_depth(levels);
        let ask_volume = self.ask_depth(levels);
        let total = bid_volume + ask_volume;
        if total > 0.0 {
            (bid_volume - ask_volume) / total
        } else {
            0.0
        }
    }

    pub fn tick(&self) -> f64 {
        if self.tick_size > 0.0 {
            self.tick_size
        } else {
            DEFAULT_TICK
        }
    }
}

/// Immutable execution record. Consumed exactly once by the inventory ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    /// Unique per (order, cumulative matched size)
    pub fill_id: String,
    pub order_id: String,
    pub market_id: String,
    pub outcome: Outcome,
    pub side: OrderSide,
    pub price: f64,
    pub size: f64,
    pub fee: f64,
    pub strategy: StrategyKind,
    pub timestamp: DateTime<Utc>,
}

impl Fill {
    pub fn notional(&self) -> f64 {
        self.price * self.size
    }
}

/// Round a price to the nearest tick (avoids float residue like 0.30000000000000004)
pub fn round_to_tick(price: f64, tick: f64) -> f64 {
    let tick = if tick > 0.0 { tick } else { DEFAULT_TICK };
    let decimals = (-tick.log10()).ceil().max(0.0) as i32;
    let factor = 10f64.powi(decimals);
    ((price / tick).round() * tick * factor).round() / factor
}

pub fn clamp_price(price: f64) -> f64 {
    price.clamp(MIN_PRICE, MAX_PRICE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_book() -> OrderBook {
        OrderBook::new(
            "yes",
            vec![
                BookLevel::new(0.45, 3.0),
                BookLevel::new(0.60, 0.0),
                BookLevel::new(0.47, 10.0),
            ],
            vec![
                BookLevel::new(0.70, 1.0),
                BookLevel::new(0.52, 20.0),
                BookLevel::new(0.51, -5.0),
            ],
        )
    }

    #[test]
    fn normalize_sorts_and_filters_levels() {
        let book = make_book();
        assert_eq!(book.bids.len(), 2);
        assert_eq!(book.bids[0].price, 0.47);
        assert_eq!(book.asks.len(), 2);
        assert_eq!(book.asks[0].price, 0.52);
        let mid = book.mid_price().unwrap();
        assert!((mid - 0.495).abs() < 1e-9, "Expected 0.495, got {}", mid);
    }

    #[test]
    fn crossed_book_has_no_mid() {
        let book = OrderBook::new(
            "yes",
            vec![BookLevel::new(0.55, 1.0)],
            vec![BookLevel::new(0.50, 1.0)],
        );
        assert!(book.mid_price().is_none());
    }

    #[test]
    fn round_to_tick_removes_float_residue() {
        assert_eq!(round_to_tick(0.1 + 0.2, 0.01), 0.3);
        assert_eq!(round_to_tick(0.456, 0.01), 0.46);
        assert_eq!(round_to_tick(0.4512, 0.001), 0.451);
    }
}
