//! Opportunity Detector
//!
//! Fetches the three legs of a candidate triangle, evaluates both trade
//! directions with cross-rate algebra, and sizes a profitable one against
//! live depth. All rates in an emitted opportunity come from the snapshots
//! fetched in the same cycle; nothing is re-fetched at execution time.

use std::sync::Arc;

use dashmap::DashSet;
use log::{debug, info, warn};

use crate::config::Config;
use crate::error::{ArbError, Result};
use crate::exchange::{
    DepthLevel, MarketDataProvider, OrderBook, OrderSide, PivotMarket, Quote,
    TriangularOpportunity,
};

pub struct OpportunityDetector {
    market_data: Arc<dyn MarketDataProvider>,
    config: Arc<Config>,
    /// Instruments with a detection currently in flight. A second call for
    /// the same instrument is a no-op, not a queue entry.
    analyzing: DashSet<String>,
}

struct AnalyzingGuard<'a> {
    set: &'a DashSet<String>,
    instrument: String,
}

impl Drop for AnalyzingGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.instrument);
    }
}

impl OpportunityDetector {
    pub fn new(market_data: Arc<dyn MarketDataProvider>, config: Arc<Config>) -> Self {
        OpportunityDetector {
            market_data,
            config,
            analyzing: DashSet::new(),
        }
    }

    /// Evaluates one instrument against one pivot market.
    ///
    /// Transient failures (fetch errors, malformed books) abort the cycle at
    /// log level and yield `None`; they are never surfaced as trading faults.
    pub async fn detect(
        &self,
        instrument: &str,
        pivot: &PivotMarket,
    ) -> Option<TriangularOpportunity> {
        if !self.analyzing.insert(instrument.to_string()) {
            debug!("detection for {} already in flight, skipping", instrument);
            return None;
        }
        let _guard = AnalyzingGuard {
            set: &self.analyzing,
            instrument: instrument.to_string(),
        };

        match self.evaluate(instrument, pivot).await {
            Ok(opportunity) => opportunity,
            Err(e) if e.is_recoverable() => {
                debug!("detection cycle for {} aborted: {}", instrument, e);
                None
            }
            Err(e) => {
                warn!("detection cycle for {} failed: {}", instrument, e);
                None
            }
        }
    }

    async fn evaluate(
        &self,
        instrument: &str,
        pivot: &PivotMarket,
    ) -> Result<Option<TriangularOpportunity>> {
        let leg1_market = pivot.base_market(instrument);
        let leg2_market = pivot.quote_market(instrument);
        let pivot_name = pivot.market_name();

        let (leg1, leg2, pivot_book) = tokio::try_join!(
            self.market_data.get_order_book(&leg1_market),
            self.market_data.get_order_book(&leg2_market),
            self.market_data.get_order_book(&pivot_name),
        )?;

        let leg1_ask = self.quotable_level(&leg1, Side::Ask)?;
        let leg1_bid = self.quotable_level(&leg1, Side::Bid)?;
        let leg2_ask = self.quotable_level(&leg2, Side::Ask)?;
        let leg2_bid = self.quotable_level(&leg2, Side::Bid)?;
        let pivot_ask = self.quotable_level(&pivot_book, Side::Ask)?;
        let pivot_bid = self.quotable_level(&pivot_book, Side::Bid)?;

        let forward = self.forward(instrument, pivot, leg1_ask, leg2_bid, pivot_bid);
        let reverse = self.reverse(instrument, pivot, leg2_ask, leg1_bid, pivot_ask);

        // both directions can clear the threshold in one cycle; take the wider gap
        let best = match (forward, reverse) {
            (Some(f), Some(r)) => Some(if f.gap_pct >= r.gap_pct { f } else { r }),
            (f, r) => f.or(r),
        };
        if let Some(opportunity) = &best {
            info!(
                "💰 {} via {}: gap {:.4}% qty {:.6}",
                instrument, opportunity.pivot_market, opportunity.gap_pct,
                opportunity.buy_quote.quantity
            );
        }
        Ok(best)
    }

    /// Buy instrument with the base currency, sell it for the quote currency,
    /// convert quote back to base by selling on the pivot at its bid.
    fn forward(
        &self,
        instrument: &str,
        pivot: &PivotMarket,
        leg1_ask: DepthLevel,
        leg2_bid: DepthLevel,
        pivot_bid: DepthLevel,
    ) -> Option<TriangularOpportunity> {
        let gross = (leg2_bid.rate / leg1_ask.rate) * pivot_bid.rate;
        let gap_pct = (gross - 1.0) * 100.0 - self.config.fee_pct;
        if gap_pct <= self.config.min_profit_pct {
            return None;
        }

        let budget_qty = self.config.start_quantity(&pivot.base) / leg1_ask.rate;
        // pivot depth is denominated in the quote currency; divide by the
        // sell rate to express it as an instrument quantity
        let convert_cap = pivot_bid.quantity / leg2_bid.rate;
        let depth_cap = leg1_ask.quantity.min(leg2_bid.quantity).min(convert_cap);
        let qty = budget_qty.min(depth_cap);
        if qty <= 0.0 {
            return None;
        }

        Some(TriangularOpportunity {
            instrument: instrument.to_string(),
            pivot_market: pivot.market_name(),
            gap_pct,
            buy_quote: Quote::limit(
                pivot.base_market(instrument),
                leg1_ask.rate,
                qty,
                OrderSide::Buy,
            ),
            sell_quote: Quote::limit(
                pivot.quote_market(instrument),
                leg2_bid.rate,
                qty,
                OrderSide::Sell,
            ),
            convert_quote: Quote::limit(
                pivot.market_name(),
                pivot_bid.rate,
                qty * leg2_bid.rate,
                OrderSide::Sell,
            ),
            max_arbitrage_qty: depth_cap,
        })
    }

    /// Mirror direction: buy with the quote currency, sell for the base
    /// currency, convert base back to quote by buying on the pivot at its ask.
    fn reverse(
        &self,
        instrument: &str,
        pivot: &PivotMarket,
        leg2_ask: DepthLevel,
        leg1_bid: DepthLevel,
        pivot_ask: DepthLevel,
    ) -> Option<TriangularOpportunity> {
        let gross = (leg1_bid.rate / leg2_ask.rate) / pivot_ask.rate;
        let gap_pct = (gross - 1.0) * 100.0 - self.config.fee_pct;
        if gap_pct <= self.config.min_profit_pct {
            return None;
        }

        let budget_qty = self.config.start_quantity(&pivot.quote) / leg2_ask.rate;
        // base produced per instrument is leg1_bid; the pivot ask depth (in
        // quote currency) bounds how much of it can be converted back
        let convert_cap = pivot_ask.quantity * pivot_ask.rate / leg1_bid.rate;
        let depth_cap = leg2_ask.quantity.min(leg1_bid.quantity).min(convert_cap);
        let qty = budget_qty.min(depth_cap);
        if qty <= 0.0 {
            return None;
        }

        Some(TriangularOpportunity {
            instrument: instrument.to_string(),
            pivot_market: pivot.market_name(),
            gap_pct,
            buy_quote: Quote::limit(
                pivot.quote_market(instrument),
                leg2_ask.rate,
                qty,
                OrderSide::Buy,
            ),
            sell_quote: Quote::limit(
                pivot.base_market(instrument),
                leg1_bid.rate,
                qty,
                OrderSide::Sell,
            ),
            convert_quote: Quote::limit(
                pivot.market_name(),
                pivot_ask.rate,
                qty * leg1_bid.rate / pivot_ask.rate,
                OrderSide::Buy,
            ),
            max_arbitrage_qty: depth_cap,
        })
    }

    /// Top-of-book level for one side, skipping a single dust-sized level.
    ///
    /// A best level whose notional is under the configured minimum is treated
    /// as spoofing bait and the next level is quoted instead; if no deeper
    /// level exists the book is too thin to trade.
    fn quotable_level(&self, book: &OrderBook, side: Side) -> Result<DepthLevel> {
        let levels = match side {
            Side::Bid => &book.bids,
            Side::Ask => &book.asks,
        };
        let best = *levels.first().ok_or_else(|| {
            ArbError::BookIntegrity(format!("{} has an empty {:?} side", book.market, side))
        })?;
        if best.notional() >= self.config.min_leg_notional {
            return Ok(best);
        }
        levels.get(1).copied().ok_or_else(|| {
            ArbError::BookIntegrity(format!(
                "{} {:?} side is dust-only (top notional {:.8})",
                book.market,
                side,
                best.notional()
            ))
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Bid,
    Ask,
}
