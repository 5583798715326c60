//! Exchange capability seams.
//!
//! The engine never talks to a wire protocol directly; it is written against
//! the three traits below so a different exchange adapter can be substituted
//! without touching the detector, coordinator, tracker or watchdog.

pub mod types;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
pub use types::{
    DepthLevel, Order, OrderBook, OrderId, OrderKind, OrderSide, OrderStatus, PivotMarket, Quote,
    Tick, TimeInForce, Triangle, TriangleStatus, TriangularOpportunity,
};

/// Quote and depth snapshots on demand. Implementations must fail fast and
/// surface transport problems as recoverable errors, never panic.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn get_order_book(&self, market: &str) -> Result<OrderBook>;
    async fn get_ticker(&self, market: &str) -> Result<Tick>;
}

/// Order placement, cancellation and the raw order-status stream.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Places a limit buy; resolves with the placement ack, not the fill.
    async fn buy(&self, quote: &Quote) -> Result<Order>;
    /// Places a limit sell; resolves with the placement ack, not the fill.
    async fn sell(&self, quote: &Quote) -> Result<Order>;
    /// Requests cancellation. An order that already reached a terminal state
    /// yields `ArbError::OrderAlreadyClosed` so callers can branch on it.
    async fn cancel_order(&self, order_id: &str) -> Result<()>;
    /// Current exchange-side view of one order.
    async fn get_order(&self, order_id: &str) -> Result<Order>;
    /// A fresh subscription to the raw order-status stream. Every update the
    /// exchange pushes is fanned out to all receivers handed out here.
    fn order_updates(&self) -> mpsc::UnboundedReceiver<Order>;

    /// Routes a quote to `buy` or `sell` according to its side.
    async fn place(&self, quote: &Quote) -> Result<Order> {
        match quote.side {
            OrderSide::Buy => self.buy(quote).await,
            OrderSide::Sell => self.sell(quote).await,
        }
    }
}

/// Read-only account balances, currency -> available quantity.
///
/// Adapters that reconcile a local ledger against the exchange's view raise
/// `ArbError::BalanceDesync` when the two disagree; workers treat that as
/// fatal and stop scanning.
#[async_trait]
pub trait AccountProvider: Send + Sync {
    async fn get_balances(&self) -> Result<HashMap<String, f64>>;
}
