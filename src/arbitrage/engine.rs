//! Per-pivot worker loop.
//!
//! One worker owns a full instance set (detector, tracker, watchdog,
//! coordinator, triangle table, metrics) for a single pivot market and scans
//! its instruments round-robin on a fixed tick. Workers share nothing, so a
//! process can run one per pivot market without any cross-worker locking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::time::MissedTickBehavior;

use crate::arbitrage::{ExecutionCoordinator, OpportunityDetector, TriangleTable};
use crate::config::Config;
use crate::error::{ArbError, Result};
use crate::exchange::{AccountProvider, Broker, MarketDataProvider, PivotMarket};
use crate::metrics::Metrics;
use crate::orders::{OrderLifecycleTracker, UnfilledOrderWatchdog};

pub struct PivotWorker {
    pivot: PivotMarket,
    instruments: Vec<String>,
    detector: OpportunityDetector,
    coordinator: Arc<ExecutionCoordinator>,
    table: Arc<TriangleTable>,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    /// Set when an execution hits a fatal error; the scan loop stops rather
    /// than keep trading on state it can no longer trust.
    fatal: Arc<AtomicBool>,
}

impl PivotWorker {
    pub fn new(
        pivot_market: &str,
        market_data: Arc<dyn MarketDataProvider>,
        broker: Arc<dyn Broker>,
        account: Arc<dyn AccountProvider>,
        config: Arc<Config>,
    ) -> Result<Arc<Self>> {
        let pivot = PivotMarket::parse(pivot_market)?;
        let instruments = config.currencies_for(pivot_market).to_vec();
        if instruments.is_empty() {
            return Err(ArbError::ConfigError(format!(
                "no instruments configured for pivot '{}'",
                pivot_market
            )));
        }

        let metrics = Arc::new(Metrics::new());
        let tracker = OrderLifecycleTracker::start(broker.clone());
        let watchdog = UnfilledOrderWatchdog::new(
            broker.clone(),
            market_data.clone(),
            tracker.clone(),
            Duration::from_millis(config.unfilled_order_timeout_ms),
            metrics.clone(),
        );
        let table = TriangleTable::new();
        let coordinator = Arc::new(ExecutionCoordinator::new(
            broker,
            account,
            tracker,
            watchdog,
            table.clone(),
            metrics.clone(),
        ));
        let detector = OpportunityDetector::new(market_data, config.clone());

        Ok(Arc::new(PivotWorker {
            pivot,
            instruments,
            detector,
            coordinator,
            table,
            config,
            metrics,
            fatal: Arc::new(AtomicBool::new(false)),
        }))
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn table(&self) -> &Arc<TriangleTable> {
        &self.table
    }

    /// Scans instruments round-robin forever, one per tick. Detection pauses
    /// while the worker is at its open-triangle capacity; executions already
    /// in flight keep running.
    pub async fn run(self: Arc<Self>) {
        info!(
            "🚀 worker for {} scanning {:?} every {}ms",
            self.pivot.market_name(),
            self.instruments,
            self.config.detection_interval_ms
        );
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.detection_interval_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cursor = 0usize;
        loop {
            interval.tick().await;
            if self.fatal.load(Ordering::Relaxed) {
                error!(
                    "worker {} stopping after a fatal execution error",
                    self.pivot.market_name()
                );
                return;
            }
            if self.table.open_count() >= self.config.max_open_triangles {
                debug!(
                    "worker {}: at open-triangle capacity, detection paused",
                    self.pivot.market_name()
                );
                continue;
            }
            let instrument = self.instruments[cursor % self.instruments.len()].clone();
            cursor = cursor.wrapping_add(1);
            self.metrics.increment_detection_cycles();
            self.tick(&instrument).await;
        }
    }

    /// One detection pass for one instrument. Executions are spawned, not
    /// awaited, so a long-running triangle never stalls the scan loop.
    pub async fn tick(&self, instrument: &str) {
        let Some(opportunity) = self.detector.detect(instrument, &self.pivot).await else {
            return;
        };
        self.metrics.increment_opportunities_detected();
        let coordinator = self.coordinator.clone();
        let fatal = self.fatal.clone();
        tokio::spawn(async move {
            let key = opportunity.key();
            match coordinator.execute(opportunity).await {
                Ok(Some(_)) | Ok(None) => {}
                Err(e) if e.is_recoverable() => {
                    debug!("triangle {} passed over: {}", key, e)
                }
                Err(e) => {
                    if e.is_fatal() {
                        fatal.store(true, Ordering::Relaxed);
                    }
                    error!("triangle {} execution failed: {}", key, e)
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{DepthLevel, OrderBook};
    use crate::testing::SimulatedExchange;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;

    fn test_config() -> Arc<Config> {
        let mut start_quantities = HashMap::new();
        start_quantities.insert("BTC".to_string(), 0.01);
        start_quantities.insert("ETH".to_string(), 0.5);
        let mut pivot_currencies = HashMap::new();
        pivot_currencies.insert("BTC-ETH".to_string(), vec!["X".to_string()]);
        Arc::new(Config {
            pivot_markets: vec!["BTC-ETH".to_string()],
            pivot_currencies,
            min_profit_pct: 0.5,
            fee_pct: 0.0,
            start_quantities,
            min_leg_notional: 0.0005,
            unfilled_order_timeout_ms: 10_000,
            detection_interval_ms: 500,
            max_open_triangles: 1,
            paper_trading: true,
        })
    }

    fn book(market: &str, bids: &[(f64, f64)], asks: &[(f64, f64)]) -> OrderBook {
        OrderBook {
            market: market.to_string(),
            bids: bids
                .iter()
                .map(|&(rate, quantity)| DepthLevel { rate, quantity })
                .collect(),
            asks: asks
                .iter()
                .map(|&(rate, quantity)| DepthLevel { rate, quantity })
                .collect(),
        }
    }

    fn seed_profitable(sim: &SimulatedExchange) {
        sim.set_order_book(book("BTC-X", &[(0.0009, 50.0)], &[(0.001, 50.0)]));
        sim.set_order_book(book("ETH-X", &[(0.00105, 40.0)], &[(0.0011, 40.0)]));
        sim.set_order_book(book("BTC-ETH", &[(6.5, 1.0)], &[(7.0, 1.0)]));
        sim.set_balances(HashMap::from([
            ("BTC".to_string(), 1.0),
            ("ETH".to_string(), 5.0),
        ]));
    }

    #[tokio::test]
    async fn tick_detects_and_executes_end_to_end() {
        let sim = SimulatedExchange::new();
        seed_profitable(&sim);
        sim.set_auto_fill(true);
        let worker =
            PivotWorker::new("BTC-ETH", sim.clone(), sim.clone(), sim.clone(), test_config())
                .unwrap();

        worker.tick("X").await;
        assert_eq!(
            worker.metrics().opportunities_detected.load(Ordering::Relaxed),
            1
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while worker.metrics().triangles_completed.load(Ordering::Relaxed) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("triangle should complete");
        assert_eq!(sim.placements().len(), 3);
        assert_eq!(worker.table().open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn scan_loop_pauses_at_open_triangle_capacity() {
        let sim = SimulatedExchange::new();
        // no books seeded: detections run and come up empty
        sim.set_balances(HashMap::new());
        let worker =
            PivotWorker::new("BTC-ETH", sim.clone(), sim.clone(), sim.clone(), test_config())
                .unwrap();

        let run = tokio::spawn(worker.clone().run());
        tokio::time::sleep(Duration::from_millis(1_600)).await;
        let cycles = worker.metrics().detection_cycles.load(Ordering::Relaxed);
        assert!(cycles >= 3);

        // saturate the single execution slot; the scan must stand down
        let claimed = worker.table().try_claim(&crate::exchange::TriangularOpportunity {
            instrument: "X".to_string(),
            pivot_market: "BTC-ETH".to_string(),
            gap_pct: 1.0,
            buy_quote: crate::exchange::Quote::limit(
                "BTC-X",
                0.001,
                1.0,
                crate::exchange::OrderSide::Buy,
            ),
            sell_quote: crate::exchange::Quote::limit(
                "ETH-X",
                0.00105,
                1.0,
                crate::exchange::OrderSide::Sell,
            ),
            convert_quote: crate::exchange::Quote::limit(
                "BTC-ETH",
                6.5,
                0.00105,
                crate::exchange::OrderSide::Sell,
            ),
            max_arbitrage_qty: 1.0,
        });
        assert!(claimed);

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(
            worker.metrics().detection_cycles.load(Ordering::Relaxed),
            cycles
        );
        run.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_stops_the_scan_loop() {
        let sim = SimulatedExchange::new();
        sim.set_balances(HashMap::new());
        let worker =
            PivotWorker::new("BTC-ETH", sim.clone(), sim.clone(), sim.clone(), test_config())
                .unwrap();

        let run = tokio::spawn(worker.clone().run());
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(worker.metrics().detection_cycles.load(Ordering::Relaxed) >= 1);

        // the path an execution task takes when it hits a fatal error
        worker.fatal.store(true, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(600)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert!(run.is_finished(), "scan loop should stop, not keep trading");
    }
}
