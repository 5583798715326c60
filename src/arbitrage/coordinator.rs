//! Execution Coordinator
//!
//! Drives the three-leg placement protocol for one opportunity: claim the
//! execution slot, place buy and convert concurrently, sell only once the
//! buy leg's fill is confirmed, close when every leg settles. The
//! coordinator is a pure reactive sequencer; deadlines and replacements
//! belong to the watchdog, and it never cancels a leg on its own.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, error, info};

use crate::error::{ArbError, Result};
use crate::exchange::{
    AccountProvider, Broker, Order, OrderSide, Quote, Triangle, TriangularOpportunity,
};
use crate::metrics::Metrics;
use crate::orders::{OrderLifecycleTracker, UnfilledOrderWatchdog};

/// Per-worker registry of in-flight triangles, keyed by
/// `instrument:pivot-market`. Injected into the coordinator rather than
/// process-global, so workers never share execution state.
#[derive(Default)]
pub struct TriangleTable {
    triangles: DashMap<String, Triangle>,
}

impl TriangleTable {
    pub fn new() -> Arc<Self> {
        Arc::new(TriangleTable::default())
    }

    /// Claims the execution slot for an opportunity's key. The check and the
    /// insert happen under one map-shard lock with no suspension point in
    /// between, which is what makes the single-open-per-key guarantee hold
    /// under concurrent delivery.
    pub fn try_claim(&self, opportunity: &TriangularOpportunity) -> bool {
        match self.triangles.entry(opportunity.key()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Triangle::new(opportunity.clone()));
                true
            }
        }
    }

    /// Applies a mutation to the claimed triangle for `key`.
    pub fn modify<F>(&self, key: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Triangle) -> Result<()>,
    {
        match self.triangles.get_mut(key) {
            Some(mut triangle) => mutate(&mut triangle),
            None => Err(ArbError::ExecutionError(format!(
                "no claimed triangle for key {}",
                key
            ))),
        }
    }

    /// Frees the slot, returning the final triangle record.
    pub fn release(&self, key: &str) -> Option<Triangle> {
        self.triangles.remove(key).map(|(_, triangle)| triangle)
    }

    pub fn is_claimed(&self, key: &str) -> bool {
        self.triangles.contains_key(key)
    }

    pub fn open_count(&self) -> usize {
        self.triangles.len()
    }
}

pub struct ExecutionCoordinator {
    broker: Arc<dyn Broker>,
    account: Arc<dyn AccountProvider>,
    tracker: Arc<OrderLifecycleTracker>,
    watchdog: Arc<UnfilledOrderWatchdog>,
    table: Arc<TriangleTable>,
    metrics: Arc<Metrics>,
}

impl ExecutionCoordinator {
    pub fn new(
        broker: Arc<dyn Broker>,
        account: Arc<dyn AccountProvider>,
        tracker: Arc<OrderLifecycleTracker>,
        watchdog: Arc<UnfilledOrderWatchdog>,
        table: Arc<TriangleTable>,
        metrics: Arc<Metrics>,
    ) -> Self {
        ExecutionCoordinator {
            broker,
            account,
            tracker,
            watchdog,
            table,
            metrics,
        }
    }

    /// Executes one opportunity end to end.
    ///
    /// Returns `Ok(None)` when the key is already open and the opportunity is
    /// dropped. Recoverable errors (balance too low, nothing placed) free the
    /// slot for the next cycle; anything that leaves live legs behind keeps
    /// the slot held and is surfaced for operator intervention.
    pub async fn execute(&self, opportunity: TriangularOpportunity) -> Result<Option<Triangle>> {
        let key = opportunity.key();
        if !self.table.try_claim(&opportunity) {
            debug!("triangle {} already open, dropping opportunity", key);
            self.metrics.increment_triangles_skipped();
            return Ok(None);
        }

        match self.run(&opportunity).await {
            Ok(triangle) => {
                self.table.release(&key);
                self.metrics.increment_triangles_completed();
                info!(
                    "✅ triangle {} closed, gap was {:.4}%",
                    key, opportunity.gap_pct
                );
                Ok(Some(triangle))
            }
            Err(e) if e.is_recoverable() => {
                debug!("triangle {} not executed: {}", key, e);
                self.table.release(&key);
                Err(e)
            }
            Err(e) => {
                self.metrics.increment_triangles_failed();
                error!(
                    "🚨 triangle {} failed with legs possibly live: {}; slot held for operator",
                    key, e
                );
                Err(e)
            }
        }
    }

    async fn run(&self, opportunity: &TriangularOpportunity) -> Result<Triangle> {
        let key = opportunity.key();
        self.check_balances(opportunity).await?;

        // buy and convert go out together; the convert leg's price exposure
        // does not depend on the buy leg filling
        let (buy_placed, convert_placed) = tokio::join!(
            self.broker.place(&opportunity.buy_quote),
            self.broker.place(&opportunity.convert_quote),
        );
        let (buy_ack, convert_ack) = match (buy_placed, convert_placed) {
            (Ok(buy), Ok(convert)) => (buy, convert),
            (Ok(survivor), Err(e)) | (Err(e), Ok(survivor)) => {
                return Err(ArbError::ExecutionError(format!(
                    "one leg of triangle {} rejected ({}); order {} left resting on {}",
                    key, e, survivor.id, survivor.market
                )));
            }
            (Err(e), Err(_)) => return Err(e),
        };
        self.tracker.track(buy_ack.clone());
        self.tracker.track(convert_ack.clone());
        self.metrics.increment_orders_placed();
        self.metrics.increment_orders_placed();

        // the convert leg's deadline starts at placement; it must not sit
        // unguarded while the buy leg works through its own fill (and
        // possible replacements)
        let convert_fill = {
            let watchdog = self.watchdog.clone();
            let convert_ack = convert_ack.clone();
            tokio::spawn(async move { watchdog.await_filled_guarded(convert_ack).await })
        };

        self.table
            .modify(&key, |t| t.open(buy_ack.clone(), convert_ack.clone()))?;
        self.metrics.increment_triangles_opened();
        info!(
            "🔺 triangle {} opened: buy {} on {}, convert {} on {}",
            key, buy_ack.id, buy_ack.market, convert_ack.id, convert_ack.market
        );

        // selling before the bought quantity is confirmed would sell
        // un-owned inventory
        let buy_filled = self.leg(&key, "buy", self.watchdog.await_filled_guarded(buy_ack)).await?;

        let sell_ack = self
            .broker
            .sell(&opportunity.sell_quote)
            .await
            .map_err(|e| {
                ArbError::ExecutionError(format!(
                    "sell leg of triangle {} rejected after buy fill: {}",
                    key, e
                ))
            })?;
        self.tracker.track(sell_ack.clone());
        self.metrics.increment_orders_placed();
        self.table.modify(&key, |t| {
            t.set_sell_order(sell_ack.clone());
            Ok(())
        })?;

        let (sell_filled, convert_filled) = tokio::try_join!(
            self.leg(&key, "sell", self.watchdog.await_filled_guarded(sell_ack)),
            self.leg(&key, "convert", async {
                convert_fill.await.map_err(|e| {
                    ArbError::ChannelClosed(format!("convert guard task: {}", e))
                })?
            }),
        )?;

        self.table.modify(&key, |t| {
            t.close(
                buy_filled.clone(),
                sell_filled.clone(),
                convert_filled.clone(),
            )
        })?;
        Ok(Triangle {
            opportunity: opportunity.clone(),
            status: crate::exchange::TriangleStatus::Closed,
            buy_order: Some(buy_filled),
            sell_order: Some(sell_filled),
            convert_order: Some(convert_filled),
        })
    }

    /// Awaits one leg's fill, upgrading any failure to a held-slot execution
    /// error since the triangle already has live orders.
    async fn leg(
        &self,
        key: &str,
        name: &str,
        fill: impl std::future::Future<Output = Result<Order>>,
    ) -> Result<Order> {
        fill.await.map_err(|e| {
            ArbError::ExecutionError(format!("{} leg of triangle {} failed: {}", name, key, e))
        })
    }

    /// The buy and convert legs spend currency we must already hold; the
    /// sell leg spends inventory the buy leg delivers and is not pre-checked.
    async fn check_balances(&self, opportunity: &TriangularOpportunity) -> Result<()> {
        let balances = self.account.get_balances().await?;
        for quote in [&opportunity.buy_quote, &opportunity.convert_quote] {
            let (currency, required) = spend_of(quote)?;
            let available = balances.get(&currency).copied().unwrap_or(0.0);
            if available < required {
                return Err(ArbError::InsufficientBalance(format!(
                    "{} needs {:.8} {}, {:.8} available",
                    quote.market, required, currency, available
                )));
            }
        }
        Ok(())
    }
}

/// Currency and amount a quote will debit when placed.
fn spend_of(quote: &Quote) -> Result<(String, f64)> {
    let (base, instrument) = quote.market.split_once('-').ok_or_else(|| {
        ArbError::ExecutionError(format!("market '{}' is not BASE-INSTRUMENT", quote.market))
    })?;
    Ok(match quote.side {
        OrderSide::Buy => (base.to_string(), quote.notional()),
        OrderSide::Sell => (instrument.to_string(), quote.quantity),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{OrderStatus, TriangleStatus};
    use crate::testing::SimulatedExchange;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn opportunity() -> TriangularOpportunity {
        TriangularOpportunity {
            instrument: "LTC".to_string(),
            pivot_market: "BTC-ETH".to_string(),
            gap_pct: 1.5,
            buy_quote: Quote::limit("BTC-LTC", 0.001, 10.0, OrderSide::Buy),
            sell_quote: Quote::limit("ETH-LTC", 0.015, 10.0, OrderSide::Sell),
            convert_quote: Quote::limit("BTC-ETH", 0.07, 0.15, OrderSide::Sell),
            max_arbitrage_qty: 25.0,
        }
    }

    fn funded_balances() -> HashMap<String, f64> {
        let mut balances = HashMap::new();
        balances.insert("BTC".to_string(), 1.0);
        balances.insert("ETH".to_string(), 5.0);
        balances.insert("LTC".to_string(), 0.0);
        balances
    }

    fn harness(
        sim: &Arc<SimulatedExchange>,
        timeout_ms: u64,
    ) -> (ExecutionCoordinator, Arc<TriangleTable>, Arc<Metrics>) {
        let tracker = OrderLifecycleTracker::start(sim.clone());
        let metrics = Arc::new(Metrics::new());
        let watchdog = UnfilledOrderWatchdog::new(
            sim.clone(),
            sim.clone(),
            tracker.clone(),
            Duration::from_millis(timeout_ms),
            metrics.clone(),
        );
        let table = TriangleTable::new();
        let coordinator = ExecutionCoordinator::new(
            sim.clone(),
            sim.clone(),
            tracker,
            watchdog,
            table.clone(),
            metrics.clone(),
        );
        (coordinator, table, metrics)
    }

    #[tokio::test]
    async fn full_triangle_runs_to_closed() {
        let sim = SimulatedExchange::new();
        sim.set_balances(funded_balances());
        sim.set_auto_fill(true);
        let (coordinator, table, metrics) = harness(&sim, 60_000);

        let triangle = coordinator
            .execute(opportunity())
            .await
            .unwrap()
            .expect("triangle should run");
        assert_eq!(triangle.status, TriangleStatus::Closed);
        assert_eq!(triangle.buy_order.unwrap().status, OrderStatus::Filled);
        assert_eq!(triangle.sell_order.unwrap().status, OrderStatus::Filled);
        assert_eq!(triangle.convert_order.unwrap().status, OrderStatus::Filled);
        assert_eq!(table.open_count(), 0);
        assert_eq!(metrics.triangles_completed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.orders_placed.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn sell_leg_waits_for_the_buy_fill() {
        let sim = SimulatedExchange::new();
        sim.set_balances(funded_balances());
        let (coordinator, _table, _metrics) = harness(&sim, 60_000);
        let coordinator = Arc::new(coordinator);

        let run = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.execute(opportunity()).await })
        };
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        // only buy and convert are out; the sell market must not appear yet
        let placements = sim.placements();
        assert_eq!(placements.len(), 2);
        assert!(placements.iter().all(|o| o.market != "ETH-LTC"));
        let buy_id = placements
            .iter()
            .find(|o| o.market == "BTC-LTC")
            .unwrap()
            .id
            .clone();
        let convert_id = placements
            .iter()
            .find(|o| o.market == "BTC-ETH")
            .unwrap()
            .id
            .clone();

        sim.fill_order(&buy_id);
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        let placements = sim.placements();
        assert_eq!(placements.len(), 3);
        assert_eq!(placements[2].market, "ETH-LTC");

        sim.fill_order(&placements[2].id);
        sim.fill_order(&convert_id);
        let triangle = run.await.unwrap().unwrap().unwrap();
        assert_eq!(triangle.status, TriangleStatus::Closed);
    }

    #[tokio::test]
    async fn concurrent_opportunities_for_one_key_open_once() {
        let sim = SimulatedExchange::new();
        sim.set_balances(funded_balances());
        let (coordinator, table, metrics) = harness(&sim, 60_000);
        let coordinator = Arc::new(coordinator);

        let runs: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.execute(opportunity()).await })
            })
            .collect();
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }

        assert_eq!(table.open_count(), 1);
        assert_eq!(metrics.triangles_opened.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.triangles_skipped.load(Ordering::Relaxed), 7);

        // let the winner finish
        let placements = sim.placements();
        let buy_id = placements
            .iter()
            .find(|o| o.market == "BTC-LTC")
            .unwrap()
            .id
            .clone();
        let convert_id = placements
            .iter()
            .find(|o| o.market == "BTC-ETH")
            .unwrap()
            .id
            .clone();
        sim.fill_order(&buy_id);
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        let sell_id = sim
            .placements()
            .iter()
            .find(|o| o.market == "ETH-LTC")
            .unwrap()
            .id
            .clone();
        sim.fill_order(&sell_id);
        sim.fill_order(&convert_id);

        let mut completed = 0;
        for run in runs {
            if matches!(run.await.unwrap(), Ok(Some(_))) {
                completed += 1;
            }
        }
        assert_eq!(completed, 1);
        assert_eq!(table.open_count(), 0);
    }

    #[tokio::test]
    async fn insufficient_balance_skips_and_frees_the_slot() {
        let sim = SimulatedExchange::new();
        sim.set_balances(HashMap::from([
            ("BTC".to_string(), 0.000_001),
            ("ETH".to_string(), 5.0),
        ]));
        let (coordinator, table, _metrics) = harness(&sim, 60_000);

        let result = coordinator.execute(opportunity()).await;
        assert!(matches!(result, Err(ArbError::InsufficientBalance(_))));
        assert_eq!(sim.placements().len(), 0);
        assert_eq!(table.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_buy_and_convert_legs_are_each_replaced() {
        let sim = SimulatedExchange::new();
        sim.set_balances(funded_balances());
        sim.set_ticker("BTC-LTC", 0.0009, 0.0012);
        sim.set_ticker("BTC-ETH", 0.068, 0.072);
        let (coordinator, table, metrics) = harness(&sim, 10_000);
        let coordinator = Arc::new(coordinator);

        let run = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.execute(opportunity()).await })
        };
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        let originals = sim.placements();
        assert_eq!(originals.len(), 2);
        let buy_id = originals
            .iter()
            .find(|o| o.market == "BTC-LTC")
            .unwrap()
            .id
            .clone();
        let convert_id = originals
            .iter()
            .find(|o| o.market == "BTC-ETH")
            .unwrap()
            .id
            .clone();

        // both legs blow through the deadline together; each one's guard
        // started at placement, so each gets its own replacement
        tokio::time::sleep(Duration::from_millis(10_001)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        let placements = sim.placements();
        assert_eq!(placements.len(), 4, "both stale legs should be replaced");
        let buy_repl = placements
            .iter()
            .find(|o| o.market == "BTC-LTC" && o.id != buy_id)
            .unwrap()
            .clone();
        let convert_repl = placements
            .iter()
            .find(|o| o.market == "BTC-ETH" && o.id != convert_id)
            .unwrap()
            .clone();
        assert_eq!(buy_repl.rate, 0.0012); // buy re-quoted at current ask
        assert_eq!(convert_repl.rate, 0.068); // sell re-quoted at current bid
        assert_eq!(metrics.orders_replaced.load(Ordering::Relaxed), 2);

        sim.fill_order(&buy_repl.id);
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        let sell = sim
            .placements()
            .iter()
            .find(|o| o.market == "ETH-LTC")
            .unwrap()
            .clone();
        sim.fill_order(&sell.id);
        sim.fill_order(&convert_repl.id);

        let triangle = run.await.unwrap().unwrap().expect("triangle should close");
        assert_eq!(triangle.buy_order.unwrap().id, buy_repl.id);
        assert_eq!(triangle.convert_order.unwrap().id, convert_repl.id);
        assert_eq!(table.open_count(), 0);
    }

    #[test]
    fn spend_accounting_per_side() {
        let buy = Quote::limit("BTC-LTC", 0.001, 10.0, OrderSide::Buy);
        let (currency, amount) = spend_of(&buy).unwrap();
        assert_eq!(currency, "BTC");
        assert!((amount - 0.01).abs() < 1e-12);
        let sell = Quote::limit("BTC-ETH", 0.07, 0.15, OrderSide::Sell);
        let (currency, amount) = spend_of(&sell).unwrap();
        assert_eq!(currency, "ETH");
        assert!((amount - 0.15).abs() < 1e-12);
    }
}
