//! Market-making pricing
//!
//! - [`QuoteModel`]: pure `(bid, ask)` computation, legacy or Avellaneda-Stoikov
//! - [`PricingEngine`]: wraps the configured model, picks the sides to quote
//!   and sizes each side against capital and per-market capacity

pub mod avellaneda;
pub mod legacy;
pub mod trackers;

pub use avellaneda::AvellanedaStoikovModel;
pub use legacy::LegacyModel;
pub use trackers::{KappaEstimator, StaleTracker, VolTracker};

use serde::{Deserialize, Serialize};

use crate::config::{MmConfig, PricingConfig, PricingModel};
use crate::types::{round_to_tick, OrderBook, MAX_PRICE, MIN_PRICE};

/// Book levels used for the weighted mid
pub const DEPTH_LEVELS: usize = 5;

/// Everything a quote model reads
#[derive(Debug, Clone, PartialEq)]
pub struct PricingInputs {
    pub mid: f64,
    /// Book imbalance in [-1, 1]
    pub imbalance: f64,
    pub vol_pts: f64,
    /// 0 = fresh, 1 = stale
    pub staleness: f64,
    pub kappa: f64,
    /// YES minus NO shares
    pub net_inventory: f64,
    /// Capacity in shares
    pub max_inventory: f64,
    /// Average entry of the YES holding, 0 when flat
    pub avg_entry: f64,
    pub days_to_resolution: f64,
    pub tick: f64,
}

/// Two-sided price with `bid < ask`, both on tick and inside [0.01, 0.99]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub bid: f64,
    pub ask: f64,
    /// Market mid the quote was computed from
    pub mid: f64,
    pub reservation: f64,
    pub half_spread_pts: f64,
}

pub trait QuoteModel: Send + Sync {
    fn name(&self) -> &'static str;

    fn price(&self, inputs: &PricingInputs) -> PriceQuote;
}

/// Clamp, round to tick and, if rounding collapsed the pair, fall back to
/// one tick either side of the rounded mid.
pub(crate) fn finalize_pair(bid: f64, ask: f64, mid: f64, tick: f64) -> (f64, f64) {
    let bid = round_to_tick(bid.clamp(MIN_PRICE, MAX_PRICE), tick);
    let ask = round_to_tick(ask.clamp(MIN_PRICE, MAX_PRICE), tick);
    if bid < ask {
        return (bid, ask);
    }
    let center = round_to_tick(mid, tick).clamp(MIN_PRICE + tick, MAX_PRICE - tick);
    (round_to_tick(center - tick, tick), round_to_tick(center + tick, tick))
}

/// Mid weighted toward the side with more depth behind it
pub fn weighted_mid(book: &OrderBook) -> Option<f64> {
    let best_bid = book.best_bid()?.price;
    let best_ask = book.best_ask()?.price;
    if best_bid <= 0.0 || best_ask <= best_bid {
        return None;
    }
    let bid_depth = book.bid_depth(DEPTH_LEVELS);
    let ask_depth = book.ask_depth(DEPTH_LEVELS);
    let total = bid_depth + ask_depth;
    if total <= 0.0 {
        return Some((best_bid + best_ask) / 2.0);
    }
    let w_bid = ask_depth / total;
    let w_ask = bid_depth / total;
    Some(w_bid * best_bid + w_ask * best_ask)
}

/// Holdings of one market as seen by the pricer
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InventorySignal {
    pub yes_shares: f64,
    pub no_shares: f64,
    pub yes_avg_entry: f64,
    /// Cost basis of both sides, USDC
    pub exposure_usd: f64,
}

impl InventorySignal {
    pub fn net(&self) -> f64 {
        self.yes_shares - self.no_shares
    }
}

/// One side of a proposal
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProposedOrder {
    pub price: f64,
    /// Shares
    pub size: f64,
}

/// Sides that should be resting on a market
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SideSet {
    pub bid: bool,
    pub ask: bool,
}

/// Output of one pricing cycle for one market, quoted on the YES token
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteProposal {
    pub market_id: String,
    pub token_id: String,
    pub quote: PriceQuote,
    pub bid: Option<ProposedOrder>,
    pub ask: Option<ProposedOrder>,
    /// One side only, oriented to shrink inventory
    pub reduce_only: bool,
}

impl QuoteProposal {
    pub fn sides(&self) -> SideSet {
        SideSet {
            bid: self.bid.is_some(),
            ask: self.ask.is_some(),
        }
    }
}

/// USDC to commit on the bid side
pub fn quote_size_usd(
    capital: f64,
    max_per_market: f64,
    inventory_usd: f64,
    base_size_usd: f64,
) -> f64 {
    let remaining = max_per_market - inventory_usd.abs();
    if remaining <= 0.0 {
        return 0.0;
    }
    let size = base_size_usd
        .min(max_per_market)
        .min(capital * 0.1)
        .min(remaining);
    ((size * 100.0).round() / 100.0).max(0.0)
}

fn shares_for(usd: f64, price: f64) -> f64 {
    if price <= 0.0 {
        return 0.0;
    }
    ((usd / price) * 100.0).floor() / 100.0
}

pub struct PricingEngine {
    model: Box<dyn QuoteModel>,
    mm: MmConfig,
}

impl PricingEngine {
    pub fn new(model: Box<dyn QuoteModel>, mm: MmConfig) -> Self {
        Self { model, mm }
    }

    pub fn from_config(pricing: &PricingConfig, mm: &MmConfig) -> Self {
        let model: Box<dyn QuoteModel> = match pricing.model {
            PricingModel::Legacy => Box::new(LegacyModel::new(pricing)),
            PricingModel::AvellanedaStoikov => Box::new(AvellanedaStoikovModel::new(pricing)),
        };
        Self::new(model, mm.clone())
    }

    pub fn model_name(&self) -> &'static str {
        self.model.name()
    }

    pub fn price(&self, inputs: &PricingInputs) -> PriceQuote {
        self.model.price(inputs)
    }

    /// Net inventory value above which only the unwinding side is quoted
    pub fn unwind_limit_usd(&self) -> f64 {
        self.mm.unwind_threshold * self.mm.max_per_market_usd
    }

    /// Price and size one market. `None` when no side clears the share minimum.
    ///
    /// `capital` is the available balance for this decision; `reduce_mode`
    /// halves sizes while drawdown sits in the reduce band.
    pub fn propose(
        &self,
        market_id: &str,
        token_id: &str,
        inputs: &PricingInputs,
        inventory: &InventorySignal,
        capital: f64,
        reduce_mode: bool,
    ) -> Option<QuoteProposal> {
        let quote = self.model.price(inputs);
        debug_assert!(quote.bid < quote.ask);

        let net = inventory.net();
        let net_value = net.abs() * inputs.mid;
        let reduce_only = net_value > self.unwind_limit_usd();
        let scale = if reduce_mode { 0.5 } else { 1.0 };

        let bid_usd = quote_size_usd(
            capital,
            self.mm.max_per_market_usd,
            inventory.exposure_usd,
            self.mm.base_size_usd,
        ) * scale;
        let ask_usd = self.mm.base_size_usd.min(self.mm.max_per_market_usd) * scale;

        let want_bid = !(reduce_only && net > 0.0);
        let want_ask = !(reduce_only && net < 0.0);

        let bid = Some(ProposedOrder {
            price: quote.bid,
            size: shares_for(bid_usd, quote.bid),
        })
        .filter(|o| want_bid && o.size >= self.mm.min_order_shares);

        let ask_size = shares_for(ask_usd, quote.ask).min(inventory.yes_shares);
        let ask = Some(ProposedOrder {
            price: quote.ask,
            size: (ask_size * 100.0).floor() / 100.0,
        })
        .filter(|o| want_ask && o.size >= self.mm.min_order_shares);

        if bid.is_none() && ask.is_none() {
            return None;
        }

        Some(QuoteProposal {
            market_id: market_id.to_string(),
            token_id: token_id.to_string(),
            quote,
            bid,
            ask,
            reduce_only,
        })
    }
}
