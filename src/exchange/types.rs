//! Market-data and order value types shared by every component.

use serde::{Deserialize, Serialize};

use crate::error::{ArbError, Result};

pub type OrderId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    GoodUntilCanceled,
}

/// Exchange-authoritative order state. The engine only ever reflects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Open,
    Filled,
    Canceled,
}

/// Immutable description of an intended order.
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub market: String,
    pub rate: f64,
    pub quantity: f64,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub time_in_force: TimeInForce,
}

impl Quote {
    pub fn limit(market: impl Into<String>, rate: f64, quantity: f64, side: OrderSide) -> Self {
        Quote {
            market: market.into(),
            rate,
            quantity,
            side,
            kind: OrderKind::Limit,
            time_in_force: TimeInForce::GoodUntilCanceled,
        }
    }

    pub fn notional(&self) -> f64 {
        self.rate * self.quantity
    }
}

/// One row of an order-book side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthLevel {
    pub rate: f64,
    pub quantity: f64,
}

impl DepthLevel {
    pub fn notional(&self) -> f64 {
        self.rate * self.quantity
    }
}

/// Depth snapshot for one market. Bids descend, asks ascend; produced fresh
/// per detection cycle and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBook {
    pub market: String,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<&DepthLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&DepthLevel> {
        self.asks.first()
    }
}

/// Best bid/ask summary for one market.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub market: String,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
}

impl Tick {
    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }

    pub fn spread_pct(&self) -> f64 {
        (self.spread() / self.ask) * 100.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: OrderId,
    pub market: String,
    pub side: OrderSide,
    pub rate: f64,
    pub quantity: f64,
    pub quantity_remaining: f64,
    pub status: OrderStatus,
}

impl Order {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, OrderStatus::Filled | OrderStatus::Canceled)
    }
}

/// A pivot pair such as `BTC-ETH`, plus the naming of its two instrument legs.
///
/// Markets follow the `BASE-INSTRUMENT` convention: rates are expressed in
/// the base currency, quantities in the instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PivotMarket {
    pub base: String,
    pub quote: String,
}

impl PivotMarket {
    pub fn parse(name: &str) -> Result<Self> {
        let (base, quote) = name
            .split_once('-')
            .ok_or_else(|| ArbError::ConfigError(format!("'{}' is not BASE-QUOTE", name)))?;
        if base.is_empty() || quote.is_empty() {
            return Err(ArbError::ConfigError(format!("'{}' is not BASE-QUOTE", name)));
        }
        Ok(PivotMarket {
            base: base.to_string(),
            quote: quote.to_string(),
        })
    }

    /// The pivot pair itself, e.g. `BTC-ETH`.
    pub fn market_name(&self) -> String {
        format!("{}-{}", self.base, self.quote)
    }

    /// Instrument market against the base currency, e.g. `BTC-LTC`.
    pub fn base_market(&self, instrument: &str) -> String {
        format!("{}-{}", self.base, instrument)
    }

    /// Instrument market against the quote currency, e.g. `ETH-LTC`.
    pub fn quote_market(&self, instrument: &str) -> String {
        format!("{}-{}", self.quote, instrument)
    }
}

/// Priced and sized triangle emitted by the detector. Immutable once built.
#[derive(Debug, Clone)]
pub struct TriangularOpportunity {
    pub instrument: String,
    pub pivot_market: String,
    /// Gap in percent, net of the configured static fee
    pub gap_pct: f64,
    pub buy_quote: Quote,
    pub sell_quote: Quote,
    pub convert_quote: Quote,
    /// Depth-limited ceiling on the instrument quantity
    pub max_arbitrage_qty: f64,
}

impl TriangularOpportunity {
    /// Execution-slot key; at most one triangle may be open per key.
    pub fn key(&self) -> String {
        format!("{}:{}", self.instrument, self.pivot_market)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriangleStatus {
    Idle,
    Open,
    Closed,
}

/// Execution record for one in-flight arbitrage. Owned exclusively by the
/// coordinator while open; transitions Idle -> Open -> Closed, never backward.
#[derive(Debug, Clone)]
pub struct Triangle {
    pub opportunity: TriangularOpportunity,
    pub status: TriangleStatus,
    pub buy_order: Option<Order>,
    pub sell_order: Option<Order>,
    pub convert_order: Option<Order>,
}

impl Triangle {
    pub fn new(opportunity: TriangularOpportunity) -> Self {
        Triangle {
            opportunity,
            status: TriangleStatus::Idle,
            buy_order: None,
            sell_order: None,
            convert_order: None,
        }
    }

    /// Records the placement acks of the first two legs and opens the triangle.
    pub fn open(&mut self, buy_order: Order, convert_order: Order) -> Result<()> {
        if self.status != TriangleStatus::Idle {
            return Err(ArbError::ExecutionError(format!(
                "triangle {} cannot open from {:?}",
                self.opportunity.key(),
                self.status
            )));
        }
        self.buy_order = Some(buy_order);
        self.convert_order = Some(convert_order);
        self.status = TriangleStatus::Open;
        Ok(())
    }

    pub fn set_sell_order(&mut self, order: Order) {
        self.sell_order = Some(order);
    }

    /// Records the settled legs and closes the triangle.
    pub fn close(&mut self, buy: Order, sell: Order, convert: Order) -> Result<()> {
        if self.status != TriangleStatus::Open {
            return Err(ArbError::ExecutionError(format!(
                "triangle {} cannot close from {:?}",
                self.opportunity.key(),
                self.status
            )));
        }
        self.buy_order = Some(buy);
        self.sell_order = Some(sell);
        self.convert_order = Some(convert);
        self.status = TriangleStatus::Closed;
        Ok(())
    }
}
