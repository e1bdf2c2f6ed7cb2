//! In-memory exchange for paper trading and tests
//!
//! Virtual cash and token balances, post-only crossing rejects, taker
//! matching against the current book, and resting orders that fill when a
//! later book or a simulated taker crosses them. Books come from tests via
//! [`PaperGateway::set_book`] or from the public CLOB endpoints.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use super::clob::PublicClob;
use super::{ExecutionGateway, OrderRequest, OrderStatusReport, PlacedOrder};
use crate::error::GatewayError;
use crate::types::{BookLevel, Market, OrderBook, OrderSide, Outcome};

#[derive(Debug, Clone)]
struct PaperOrder {
    seq: u64,
    token_id: String,
    side: OrderSide,
    price: f64,
    size: f64,
    matched: f64,
    status: &'static str,
}

impl PaperOrder {
    fn remaining(&self) -> f64 {
        (self.size - self.matched).max(0.0)
    }

    fn is_open(&self) -> bool {
        self.status == "LIVE"
    }

    fn report(&self, order_id: &str) -> OrderStatusReport {
        OrderStatusReport {
            order_id: order_id.to_string(),
            token_id: self.token_id.clone(),
            side: self.side,
            price: self.price,
            original_size: self.size,
            size_matched: self.matched,
            status: self.status.to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct PaperState {
    books: HashMap<String, OrderBook>,
    orders: HashMap<String, PaperOrder>,
    balance: f64,
    tokens: HashMap<String, f64>,
    next_seq: u64,
    fail_next: u32,
    balance_unavailable: bool,
}

impl PaperState {
    fn take_injected_failure(&mut self, call: &str) -> Result<(), GatewayError> {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(GatewayError::Transient(format!("injected failure in {}", call)));
        }
        Ok(())
    }

    fn reserved_cash(&self) -> f64 {
        self.orders
            .values()
            .filter(|o| o.is_open() && o.side == OrderSide::Buy)
            .map(|o| o.remaining() * o.price)
            .sum()
    }

    fn reserved_tokens(&self, token_id: &str) -> f64 {
        self.orders
            .values()
            .filter(|o| o.is_open() && o.side == OrderSide::Sell && o.token_id == token_id)
            .map(PaperOrder::remaining)
            .sum()
    }

    fn settle(&mut self, token_id: &str, side: OrderSide, price: f64, size: f64) {
        let held = self.tokens.entry(token_id.to_string()).or_insert(0.0);
        match side {
            OrderSide::Buy => {
                *held += size;
                self.balance -= price * size;
            }
            OrderSide::Sell => {
                *held = (*held - size).max(0.0);
                self.balance += price * size;
            }
        }
    }

    /// Consume book liquidity up to `limit` for a taker order
    fn take_liquidity(&mut self, token_id: &str, side: OrderSide, limit: f64, size: f64) -> Vec<(f64, f64)> {
        let mut executions = Vec::new();
        let Some(book) = self.books.get_mut(token_id) else {
            return executions;
        };
        let levels = match side {
            OrderSide::Buy => &mut book.asks,
            OrderSide::Sell => &mut book.bids,
        };
        let mut remaining = size;
        for level in levels.iter_mut() {
            let crosses = match side {
                OrderSide::Buy => level.price <= limit + 1e-9,
                OrderSide::Sell => level.price >= limit - 1e-9,
            };
            if !crosses || remaining <= 1e-9 {
                break;
            }
            let qty = remaining.min(level.size);
            level.size -= qty;
            remaining -= qty;
            executions.push((level.price, qty));
        }
        levels.retain(|l| l.size > 1e-9);
        executions
    }

    /// Fill resting orders on `token_id` crossed by the current book
    fn match_resting(&mut self, token_id: &str) {
        let Some(book) = self.books.get(token_id).cloned() else {
            return;
        };
        let mut ids: Vec<(u64, String)> = self
            .orders
            .iter()
            .filter(|(_, o)| o.is_open() && o.token_id == token_id)
            .map(|(id, o)| (o.seq, id.clone()))
            .collect();
        ids.sort();

        let mut asks = book.asks.clone();
        let mut bids = book.bids.clone();
        for (_, id) in ids {
            let Some(order) = self.orders.get(&id).cloned() else {
                continue;
            };
            let levels: &mut Vec<BookLevel> = match order.side {
                OrderSide::Buy => &mut asks,
                OrderSide::Sell => &mut bids,
            };
            let mut filled = 0.0;
            for level in levels.iter_mut() {
                let crosses = match order.side {
                    OrderSide::Buy => level.price <= order.price + 1e-9,
                    OrderSide::Sell => level.price >= order.price - 1e-9,
                };
                if !crosses {
                    break;
                }
                let qty = (order.remaining() - filled).min(level.size);
                if qty <= 1e-9 {
                    break;
                }
                level.size -= qty;
                filled += qty;
            }
            levels.retain(|l| l.size > 1e-9);
            if filled > 0.0 {
                self.apply_maker_fill(&id, filled);
            }
        }
        if let Some(stored) = self.books.get_mut(token_id) {
            stored.asks = asks;
            stored.bids = bids;
        }
    }

    fn apply_maker_fill(&mut self, order_id: &str, qty: f64) {
        let Some(order) = self.orders.get_mut(order_id) else {
            return;
        };
        order.matched += qty;
        if order.remaining() <= 1e-9 {
            order.status = "MATCHED";
        }
        let (token, side, price) = (order.token_id.clone(), order.side, order.price);
        debug!(order_id, side = %side, price, qty, "Paper maker fill");
        self.settle(&token, side, price, qty);
    }
}

/// Paper-trading implementation of [`ExecutionGateway`]
pub struct PaperGateway {
    state: Mutex<PaperState>,
    live_books: Option<Arc<PublicClob>>,
}

impl PaperGateway {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            state: Mutex::new(PaperState {
                balance: initial_balance,
                ..PaperState::default()
            }),
            live_books: None,
        }
    }

    /// Pull books from the public CLOB instead of test fixtures
    pub fn with_live_books(mut self, books: Arc<PublicClob>) -> Self {
        self.live_books = Some(books);
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, PaperState>, GatewayError> {
        self.state
            .lock()
            .map_err(|_| GatewayError::Unavailable("paper state poisoned".to_string()))
    }

    /// Replace the book for a token and fill any resting orders it crosses
    pub fn set_book(&self, book: OrderBook) {
        if let Ok(mut state) = self.state.lock() {
            let token = book.token_id.clone();
            state.books.insert(token.clone(), book);
            state.match_resting(&token);
        }
    }

    /// A taker order from another participant hitting our resting orders.
    /// Returns the filled quantity.
    pub fn simulate_taker(&self, token_id: &str, taker_side: OrderSide, price: f64, size: f64) -> f64 {
        let Ok(mut state) = self.state.lock() else {
            return 0.0;
        };
        let maker_side = match taker_side {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        };
        let mut ids: Vec<(u64, String)> = state
            .orders
            .iter()
            .filter(|(_, o)| {
                o.is_open()
                    && o.token_id == token_id
                    && o.side == maker_side
                    && match maker_side {
                        OrderSide::Buy => o.price >= price - 1e-9,
                        OrderSide::Sell => o.price <= price + 1e-9,
                    }
            })
            .map(|(id, o)| (o.seq, id.clone()))
            .collect();
        ids.sort();

        let mut remaining = size;
        for (_, id) in ids {
            if remaining <= 1e-9 {
                break;
            }
            let open = state.orders.get(&id).map(PaperOrder::remaining).unwrap_or(0.0);
            let qty = remaining.min(open);
            if qty > 0.0 {
                state.apply_maker_fill(&id, qty);
                remaining -= qty;
            }
        }
        size - remaining
    }

    pub fn credit_tokens(&self, token_id: &str, size: f64) {
        if let Ok(mut state) = self.state.lock() {
            *state.tokens.entry(token_id.to_string()).or_insert(0.0) += size;
        }
    }

    pub fn set_balance(&self, balance: f64) {
        if let Ok(mut state) = self.state.lock() {
            state.balance = balance;
        }
    }

    /// Next `n` gateway calls fail with a transient error
    pub fn inject_transient_failures(&self, n: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_next = n;
        }
    }

    /// Balance queries fail while set
    pub fn set_balance_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.balance_unavailable = unavailable;
        }
    }

    pub fn open_order_count(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.orders.values().filter(|o| o.is_open()).count())
            .unwrap_or(0)
    }

    pub fn cash(&self) -> f64 {
        self.state.lock().map(|s| s.balance).unwrap_or(0.0)
    }

    pub fn tokens(&self, token_id: &str) -> f64 {
        self.state
            .lock()
            .map(|s| s.tokens.get(token_id).copied().unwrap_or(0.0))
            .unwrap_or(0.0)
    }
}

#[async_trait]
impl ExecutionGateway for PaperGateway {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn get_book(&self, token_id: &str) -> Result<OrderBook, GatewayError> {
        self.lock()?.take_injected_failure("get_book")?;
        if let Some(public) = &self.live_books {
            let book = public.get_book(token_id).await?;
            let mut state = self.lock()?;
            state.books.insert(token_id.to_string(), book);
            state.match_resting(token_id);
            return state
                .books
                .get(token_id)
                .cloned()
                .ok_or_else(|| GatewayError::NotFound(token_id.to_string()));
        }
        self.lock()?
            .books
            .get(token_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("no book for {}", token_id)))
    }

    async fn get_midpoint(&self, token_id: &str) -> Result<f64, GatewayError> {
        let book = self.get_book(token_id).await?;
        book.mid_price()
            .ok_or_else(|| GatewayError::NotFound(format!("no midpoint for {}", token_id)))
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<PlacedOrder, GatewayError> {
        let mut state = self.lock()?;
        state.take_injected_failure("place_order")?;

        if !(request.price > 0.0 && request.price < 1.0) || request.size <= 0.0 {
            return Err(GatewayError::Rejected(format!(
                "invalid order price {} size {}",
                request.price, request.size
            )));
        }

        let (best_bid, best_ask) = state
            .books
            .get(&request.token_id)
            .map(|b| (b.best_bid(), b.best_ask()))
            .unwrap_or((None, None));
        let crosses = match request.side {
            OrderSide::Buy => best_ask.map_or(false, |a| request.price >= a.price - 1e-9),
            OrderSide::Sell => best_bid.map_or(false, |b| request.price <= b.price + 1e-9),
        };
        if crosses && request.post_only {
            return Err(GatewayError::WouldCross(format!(
                "post-only {} at {:.3} crosses the book",
                request.side, request.price
            )));
        }

        match request.side {
            OrderSide::Buy => {
                let free = state.balance - state.reserved_cash();
                if free + 1e-9 < request.notional() {
                    return Err(GatewayError::Rejected(format!(
                        "not enough balance: need {:.2}, free {:.2}",
                        request.notional(),
                        free
                    )));
                }
            }
            OrderSide::Sell => {
                let held = state.tokens.get(&request.token_id).copied().unwrap_or(0.0);
                let free = held - state.reserved_tokens(&request.token_id);
                if free + 1e-9 < request.size {
                    return Err(GatewayError::Rejected(format!(
                        "not enough balance: need {:.2} shares, free {:.2}",
                        request.size, free
                    )));
                }
            }
        }

        let mut matched = 0.0;
        if crosses {
            for (price, qty) in
                state.take_liquidity(&request.token_id, request.side, request.price, request.size)
            {
                state.settle(&request.token_id, request.side, price, qty);
                matched += qty;
            }
        }

        state.next_seq += 1;
        let seq = state.next_seq;
        let order_id = format!("paper-{}", seq);
        let status = if request.size - matched <= 1e-9 {
            "MATCHED"
        } else {
            "LIVE"
        };
        state.orders.insert(
            order_id.clone(),
            PaperOrder {
                seq,
                token_id: request.token_id.clone(),
                side: request.side,
                price: request.price,
                size: request.size,
                matched,
                status,
            },
        );

        debug!(
            order_id = %order_id,
            side = %request.side,
            price = request.price,
            size = request.size,
            matched,
            "Paper order accepted"
        );

        Ok(PlacedOrder {
            order_id,
            size_matched: matched,
            status: status.to_string(),
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError> {
        let mut state = self.lock()?;
        state.take_injected_failure("cancel_order")?;
        match state.orders.get_mut(order_id) {
            Some(order) => {
                if order.is_open() {
                    order.status = "CANCELED";
                }
                Ok(())
            }
            None => Err(GatewayError::NotFound(order_id.to_string())),
        }
    }

    async fn cancel_all(&self) -> Result<(), GatewayError> {
        let mut state = self.lock()?;
        state.take_injected_failure("cancel_all")?;
        let mut cancelled = 0usize;
        for order in state.orders.values_mut().filter(|o| o.is_open()) {
            order.status = "CANCELED";
            cancelled += 1;
        }
        info!(cancelled, "Paper cancel-all");
        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderStatusReport, GatewayError> {
        let mut state = self.lock()?;
        state.take_injected_failure("get_order")?;
        state
            .orders
            .get(order_id)
            .map(|o| o.report(order_id))
            .ok_or_else(|| GatewayError::NotFound(order_id.to_string()))
    }

    async fn get_open_orders(&self) -> Result<Vec<OrderStatusReport>, GatewayError> {
        let mut state = self.lock()?;
        state.take_injected_failure("get_open_orders")?;
        let mut open: Vec<(u64, OrderStatusReport)> = state
            .orders
            .iter()
            .filter(|(_, o)| o.is_open())
            .map(|(id, o)| (o.seq, o.report(id)))
            .collect();
        open.sort_by_key(|(seq, _)| *seq);
        Ok(open.into_iter().map(|(_, r)| r).collect())
    }

    async fn get_balance(&self) -> Result<f64, GatewayError> {
        let mut state = self.lock()?;
        state.take_injected_failure("get_balance")?;
        if state.balance_unavailable {
            return Err(GatewayError::Unavailable("balance endpoint down".to_string()));
        }
        Ok(state.balance)
    }

    async fn get_token_balance(
        &self,
        market: &Market,
        outcome: Outcome,
    ) -> Result<f64, GatewayError> {
        let mut state = self.lock()?;
        state.take_injected_failure("get_token_balance")?;
        Ok(state.tokens.get(market.token(outcome)).copied().unwrap_or(0.0))
    }

    async fn merge_positions(&self, market: &Market, size: f64) -> Result<(), GatewayError> {
        let mut state = self.lock()?;
        state.take_injected_failure("merge_positions")?;
        let yes = state.tokens.get(&market.yes_token).copied().unwrap_or(0.0);
        let no = state.tokens.get(&market.no_token).copied().unwrap_or(0.0);
        if yes + 1e-9 < size || no + 1e-9 < size {
            return Err(GatewayError::Rejected(format!(
                "merge of {:.2} sets exceeds holdings (yes {:.2}, no {:.2})",
                size, yes, no
            )));
        }
        state.tokens.insert(market.yes_token.clone(), yes - size);
        state.tokens.insert(market.no_token.clone(), no - size);
        state.balance += size;
        Ok(())
    }

    async fn split_position(&self, market: &Market, size: f64) -> Result<(), GatewayError> {
        let mut state = self.lock()?;
        state.take_injected_failure("split_position")?;
        if state.balance - state.reserved_cash() + 1e-9 < size {
            return Err(GatewayError::Rejected(format!(
                "split of {:.2} exceeds free balance",
                size
            )));
        }
        state.balance -= size;
        *state.tokens.entry(market.yes_token.clone()).or_insert(0.0) += size;
        *state.tokens.entry(market.no_token.clone()).or_insert(0.0) += size;
        Ok(())
    }
}
