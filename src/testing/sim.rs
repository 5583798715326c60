//! Simulated exchange backing paper-trading mode and the test suite.
//!
//! Books, tickers and balances are seeded by the caller; orders rest until
//! filled explicitly (or instantly with auto-fill on). Every placement,
//! cancellation and book fetch yields once before touching state, so
//! concurrent callers interleave the way they would against a real wire.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::debug;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{ArbError, Result};
use crate::exchange::{
    AccountProvider, Broker, MarketDataProvider, Order, OrderBook, OrderSide, OrderStatus, Quote,
    Tick,
};

#[derive(Default)]
struct Inner {
    books: HashMap<String, OrderBook>,
    tickers: HashMap<String, Tick>,
    balances: HashMap<String, f64>,
    failed_markets: HashSet<String>,
    orders: HashMap<String, Order>,
    /// Placement acks in the order they were admitted
    placements: Vec<Order>,
    subscribers: Vec<mpsc::UnboundedSender<Order>>,
    auto_fill: bool,
}

impl Inner {
    fn broadcast(&mut self, update: Order) {
        self.subscribers
            .retain(|subscriber| subscriber.send(update.clone()).is_ok());
    }
}

#[derive(Default)]
pub struct SimulatedExchange {
    inner: Mutex<Inner>,
}

impl SimulatedExchange {
    pub fn new() -> Arc<Self> {
        Arc::new(SimulatedExchange::default())
    }

    pub fn set_order_book(&self, book: OrderBook) {
        let mut inner = self.inner.lock().expect("sim lock poisoned");
        inner.books.insert(book.market.clone(), book);
    }

    pub fn set_ticker(&self, market: &str, bid: f64, ask: f64) {
        let mut inner = self.inner.lock().expect("sim lock poisoned");
        inner.tickers.insert(
            market.to_string(),
            Tick {
                market: market.to_string(),
                bid,
                ask,
                last: (bid + ask) / 2.0,
            },
        );
    }

    pub fn set_balances(&self, balances: HashMap<String, f64>) {
        self.inner.lock().expect("sim lock poisoned").balances = balances;
    }

    /// With auto-fill on, every admitted order fills in the same breath.
    pub fn set_auto_fill(&self, enabled: bool) {
        self.inner.lock().expect("sim lock poisoned").auto_fill = enabled;
    }

    /// Makes book fetches and placements for one market fail.
    pub fn fail_market(&self, market: &str) {
        let mut inner = self.inner.lock().expect("sim lock poisoned");
        inner.failed_markets.insert(market.to_string());
    }

    pub fn placements(&self) -> Vec<Order> {
        self.inner.lock().expect("sim lock poisoned").placements.clone()
    }

    /// Fills an order and pushes the update on the status stream.
    pub fn fill_order(&self, order_id: &str) {
        let mut inner = self.inner.lock().expect("sim lock poisoned");
        if let Some(order) = inner.orders.get_mut(order_id) {
            if order.is_terminal() {
                return;
            }
            order.status = OrderStatus::Filled;
            order.quantity_remaining = 0.0;
            let update = order.clone();
            inner.broadcast(update);
        }
    }

    /// Fills part of an order and pushes the still-open update.
    pub fn partial_fill(&self, order_id: &str, quantity: f64) {
        let mut inner = self.inner.lock().expect("sim lock poisoned");
        if let Some(order) = inner.orders.get_mut(order_id) {
            if order.is_terminal() {
                return;
            }
            order.quantity_remaining = (order.quantity_remaining - quantity).max(0.0);
            let update = order.clone();
            inner.broadcast(update);
        }
    }

    /// Fills an order on the exchange side without a stream update, the way
    /// a dropped websocket frame would.
    pub fn fill_order_silently(&self, order_id: &str) {
        let mut inner = self.inner.lock().expect("sim lock poisoned");
        if let Some(order) = inner.orders.get_mut(order_id) {
            if !order.is_terminal() {
                order.status = OrderStatus::Filled;
                order.quantity_remaining = 0.0;
            }
        }
    }

    fn admit(&self, quote: &Quote) -> Result<Order> {
        let mut inner = self.inner.lock().expect("sim lock poisoned");
        if inner.failed_markets.contains(&quote.market) {
            return Err(ArbError::OrderPlacement(format!(
                "market {} rejected the order",
                quote.market
            )));
        }
        let order = Order {
            id: Uuid::new_v4().to_string(),
            market: quote.market.clone(),
            side: quote.side,
            rate: quote.rate,
            quantity: quote.quantity,
            quantity_remaining: quote.quantity,
            status: OrderStatus::Open,
        };
        inner.orders.insert(order.id.clone(), order.clone());
        inner.placements.push(order.clone());
        debug!(
            "sim admitted {:?} {} x {} @ {} on {}",
            order.side, order.id, order.quantity, order.rate, order.market
        );
        if inner.auto_fill {
            let mut filled = order.clone();
            filled.status = OrderStatus::Filled;
            filled.quantity_remaining = 0.0;
            inner.orders.insert(filled.id.clone(), filled.clone());
            inner.broadcast(filled);
        }
        Ok(order)
    }
}

#[async_trait]
impl MarketDataProvider for SimulatedExchange {
    async fn get_order_book(&self, market: &str) -> Result<OrderBook> {
        tokio::task::yield_now().await;
        let inner = self.inner.lock().expect("sim lock poisoned");
        if inner.failed_markets.contains(market) {
            return Err(ArbError::MarketData(format!(
                "simulated outage on {}",
                market
            )));
        }
        inner
            .books
            .get(market)
            .cloned()
            .ok_or_else(|| ArbError::MarketData(format!("no book seeded for {}", market)))
    }

    async fn get_ticker(&self, market: &str) -> Result<Tick> {
        tokio::task::yield_now().await;
        let inner = self.inner.lock().expect("sim lock poisoned");
        if let Some(tick) = inner.tickers.get(market) {
            return Ok(tick.clone());
        }
        // fall back to the seeded book's top of book
        let book = inner
            .books
            .get(market)
            .ok_or_else(|| ArbError::MarketData(format!("no ticker seeded for {}", market)))?;
        match (book.best_bid(), book.best_ask()) {
            (Some(bid), Some(ask)) => Ok(Tick {
                market: market.to_string(),
                bid: bid.rate,
                ask: ask.rate,
                last: (bid.rate + ask.rate) / 2.0,
            }),
            _ => Err(ArbError::MarketData(format!(
                "book for {} has an empty side",
                market
            ))),
        }
    }
}

#[async_trait]
impl Broker for SimulatedExchange {
    async fn buy(&self, quote: &Quote) -> Result<Order> {
        tokio::task::yield_now().await;
        debug_assert_eq!(quote.side, OrderSide::Buy);
        self.admit(quote)
    }

    async fn sell(&self, quote: &Quote) -> Result<Order> {
        tokio::task::yield_now().await;
        debug_assert_eq!(quote.side, OrderSide::Sell);
        self.admit(quote)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        tokio::task::yield_now().await;
        let mut inner = self.inner.lock().expect("sim lock poisoned");
        match inner.orders.get_mut(order_id) {
            None => Err(ArbError::OrderNotFound(order_id.to_string())),
            Some(order) if order.is_terminal() => {
                Err(ArbError::OrderAlreadyClosed(order_id.to_string()))
            }
            Some(order) => {
                order.status = OrderStatus::Canceled;
                let update = order.clone();
                inner.broadcast(update);
                Ok(())
            }
        }
    }

    async fn get_order(&self, order_id: &str) -> Result<Order> {
        tokio::task::yield_now().await;
        let inner = self.inner.lock().expect("sim lock poisoned");
        inner
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| ArbError::OrderNotFound(order_id.to_string()))
    }

    fn order_updates(&self) -> mpsc::UnboundedReceiver<Order> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .expect("sim lock poisoned")
            .subscribers
            .push(tx);
        rx
    }
}

#[async_trait]
impl AccountProvider for SimulatedExchange {
    async fn get_balances(&self) -> Result<HashMap<String, f64>> {
        tokio::task::yield_now().await;
        Ok(self.inner.lock().expect("sim lock poisoned").balances.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resting_order_lifecycle() {
        let sim = SimulatedExchange::new();
        let mut updates = sim.order_updates();
        let order = sim
            .buy(&Quote::limit("BTC-LTC", 0.001, 10.0, OrderSide::Buy))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Open);

        sim.partial_fill(&order.id, 4.0);
        sim.fill_order(&order.id);
        assert_eq!(updates.recv().await.unwrap().quantity_remaining, 6.0);
        assert_eq!(updates.recv().await.unwrap().status, OrderStatus::Filled);

        // terminal orders reject cancellation with the distinguished variant
        assert!(matches!(
            sim.cancel_order(&order.id).await,
            Err(ArbError::OrderAlreadyClosed(_))
        ));
    }

    #[tokio::test]
    async fn auto_fill_settles_in_one_step() {
        let sim = SimulatedExchange::new();
        sim.set_auto_fill(true);
        let mut updates = sim.order_updates();
        let ack = sim
            .sell(&Quote::limit("ETH-LTC", 0.015, 5.0, OrderSide::Sell))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::Open);
        assert_eq!(updates.recv().await.unwrap().status, OrderStatus::Filled);
        assert_eq!(
            sim.get_order(&ack.id).await.unwrap().status,
            OrderStatus::Filled
        );
    }

    #[tokio::test]
    async fn failed_market_rejects_fetch_and_placement() {
        let sim = SimulatedExchange::new();
        sim.fail_market("BTC-LTC");
        assert!(sim.get_order_book("BTC-LTC").await.is_err());
        assert!(sim
            .buy(&Quote::limit("BTC-LTC", 0.001, 1.0, OrderSide::Buy))
            .await
            .is_err());
    }
}
