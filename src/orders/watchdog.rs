//! Unfilled-Order Watchdog
//!
//! Guards a resting limit order with a deadline. If the order is still open
//! when the deadline passes, the watchdog cancels it and re-places the
//! remaining quantity at the current ticker, handing the replacement back to
//! the caller so its fill-await can be retargeted. Each replacement runs
//! under a fresh deadline of its own.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::oneshot;

use crate::error::{ArbError, Result};
use crate::exchange::{Broker, MarketDataProvider, Order, OrderSide, Quote};
use crate::metrics::Metrics;
use crate::orders::OrderLifecycleTracker;

/// Outcome of one guard. `Closed` means the order reached a terminal state
/// on its own and no replacement was placed.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Closed(Order),
    Replaced(Order),
    Failed(ArbError),
}

pub struct UnfilledOrderWatchdog {
    broker: Arc<dyn Broker>,
    market_data: Arc<dyn MarketDataProvider>,
    tracker: Arc<OrderLifecycleTracker>,
    timeout: Duration,
    metrics: Arc<Metrics>,
}

impl UnfilledOrderWatchdog {
    pub fn new(
        broker: Arc<dyn Broker>,
        market_data: Arc<dyn MarketDataProvider>,
        tracker: Arc<OrderLifecycleTracker>,
        timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(UnfilledOrderWatchdog {
            broker,
            market_data,
            tracker,
            timeout,
            metrics,
        })
    }

    /// Puts one order under guard and returns the channel its outcome will
    /// arrive on.
    pub fn watch(self: &Arc<Self>, order: Order) -> oneshot::Receiver<WatchEvent> {
        let (tx, rx) = oneshot::channel();
        let watchdog = self.clone();
        tokio::spawn(async move {
            let event = watchdog.guard(order).await;
            let _ = tx.send(event);
        });
        rx
    }

    /// Awaits the fill of `order`, following cancel-and-replace hops until a
    /// fill lands. This is the coordinator's entry point: the returned order
    /// may be a replacement rather than the one passed in.
    pub async fn await_filled_guarded(self: &Arc<Self>, mut order: Order) -> Result<Order> {
        loop {
            let guard = self.watch(order.clone());
            match self.tracker.await_filled(&order.id).await {
                Ok(filled) => return Ok(filled),
                // canceled under us; the guard knows whether a replacement
                // went out or the cancellation is final
                Err(_) => match guard.await {
                    Ok(WatchEvent::Replaced(next)) => {
                        info!(
                            "retargeting fill-await from order {} to replacement {}",
                            order.id, next.id
                        );
                        order = next;
                    }
                    Ok(WatchEvent::Closed(last)) => {
                        if last.quantity_remaining <= 0.0 {
                            return Ok(last);
                        }
                        return Err(ArbError::ExecutionError(format!(
                            "order {} on {} canceled with {} remaining and no replacement",
                            last.id, last.market, last.quantity_remaining
                        )));
                    }
                    Ok(WatchEvent::Failed(e)) => return Err(e),
                    Err(_) => {
                        return Err(ArbError::ChannelClosed(format!(
                            "guard for order {} dropped",
                            order.id
                        )))
                    }
                },
            }
        }
    }

    async fn guard(&self, order: Order) -> WatchEvent {
        loop {
            tokio::select! {
                // a fill landing exactly at the deadline wins the tie
                biased;
                terminal = self.tracker.await_terminal(&order.id) => {
                    return match terminal {
                        Ok(last) => WatchEvent::Closed(last),
                        Err(e) => WatchEvent::Failed(e),
                    };
                }
                _ = tokio::time::sleep(self.timeout) => {}
            }

            self.metrics.increment_orders_stuck();
            warn!(
                "⏱️ order {} on {} unfilled after {:?}, canceling",
                order.id, order.market, self.timeout
            );
            match self.cancel_and_replace(&order).await {
                Ok(event) => return event,
                Err(ArbError::CancelFailed(reason)) => {
                    // order is still live, try again on the next deadline
                    warn!("cancel of order {} failed ({}), retrying", order.id, reason);
                }
                Err(e) => return WatchEvent::Failed(e),
            }
        }
    }

    async fn cancel_and_replace(&self, order: &Order) -> Result<WatchEvent> {
        match self.broker.cancel_order(&order.id).await {
            Ok(()) => {}
            Err(ArbError::OrderAlreadyClosed(_)) => {
                // the order went terminal before the cancel landed, which is
                // exactly what we wanted; fold the final state into the
                // tracker and report it
                info!("order {} closed before cancel landed, no replacement", order.id);
                let last = self.broker.get_order(&order.id).await?;
                self.tracker.ingest(last.clone());
                return Ok(WatchEvent::Closed(last));
            }
            Err(e) => return Err(e),
        }

        let canceled =
            match tokio::time::timeout(self.timeout, self.tracker.await_canceled(&order.id)).await
            {
                Ok(Ok(canceled)) => canceled,
                Ok(Err(_)) => {
                    // filled while the cancel was in flight
                    let last = self.broker.get_order(&order.id).await?;
                    self.tracker.ingest(last.clone());
                    return Ok(WatchEvent::Closed(last));
                }
                Err(_) => {
                    return Err(ArbError::CancelFailed(format!(
                        "no cancel confirmation for order {} within {:?}",
                        order.id, self.timeout
                    )))
                }
            };

        if canceled.quantity_remaining <= 0.0 {
            return Ok(WatchEvent::Closed(canceled));
        }

        let tick = self.market_data.get_ticker(&order.market).await?;
        let rate = match order.side {
            OrderSide::Buy => tick.ask,
            OrderSide::Sell => tick.bid,
        };
        let quote = Quote::limit(
            order.market.clone(),
            rate,
            canceled.quantity_remaining,
            order.side,
        );
        let replacement = self.broker.place(&quote).await?;
        self.tracker.track(replacement.clone());
        self.metrics.increment_orders_replaced();
        info!(
            "🔁 replaced order {} with {} on {}: {} @ {} (book spread {:.4}%)",
            order.id,
            replacement.id,
            order.market,
            replacement.quantity,
            replacement.rate,
            tick.spread_pct()
        );
        Ok(WatchEvent::Replaced(replacement))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::OrderStatus;
    use crate::testing::SimulatedExchange;
    use std::sync::atomic::Ordering;

    fn harness(
        timeout_ms: u64,
    ) -> (
        Arc<SimulatedExchange>,
        Arc<OrderLifecycleTracker>,
        Arc<UnfilledOrderWatchdog>,
        Arc<Metrics>,
    ) {
        let sim = SimulatedExchange::new();
        let tracker = OrderLifecycleTracker::start(sim.clone());
        let metrics = Arc::new(Metrics::new());
        let watchdog = UnfilledOrderWatchdog::new(
            sim.clone(),
            sim.clone(),
            tracker.clone(),
            Duration::from_millis(timeout_ms),
            metrics.clone(),
        );
        (sim, tracker, watchdog, metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn fill_before_deadline_means_no_replacement() {
        let (sim, _tracker, watchdog, metrics) = harness(10_000);
        let order = sim
            .buy(&Quote::limit("BTC-LTC", 0.001, 10.0, OrderSide::Buy))
            .await
            .unwrap();

        let guarded = {
            let watchdog = watchdog.clone();
            let order = order.clone();
            tokio::spawn(async move { watchdog.await_filled_guarded(order).await })
        };
        tokio::task::yield_now().await;

        sim.fill_order(&order.id);
        let filled = guarded.await.unwrap().unwrap();
        assert_eq!(filled.id, order.id);
        assert_eq!(filled.status, OrderStatus::Filled);
        assert_eq!(metrics.orders_replaced.load(Ordering::Relaxed), 0);
        assert_eq!(sim.placements().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_order_is_replaced_at_current_ticker() {
        let (sim, _tracker, watchdog, metrics) = harness(10_000);
        sim.set_ticker("BTC-LTC", 0.0009, 0.0012);
        let order = sim
            .buy(&Quote::limit("BTC-LTC", 0.001, 10.0, OrderSide::Buy))
            .await
            .unwrap();

        let guarded = {
            let watchdog = watchdog.clone();
            let order = order.clone();
            tokio::spawn(async move { watchdog.await_filled_guarded(order).await })
        };
        tokio::task::yield_now().await;

        // deadline passes with the order untouched
        tokio::time::sleep(Duration::from_millis(10_001)).await;
        tokio::task::yield_now().await;

        let placements = sim.placements();
        assert_eq!(placements.len(), 2, "expected exactly one replacement");
        let replacement = &placements[1];
        assert_eq!(replacement.rate, 0.0012); // buy re-placed at current ask
        assert_eq!(replacement.quantity, 10.0);

        sim.fill_order(&replacement.id);
        let filled = guarded.await.unwrap().unwrap();
        assert_eq!(filled.id, replacement.id);
        assert_eq!(metrics.orders_replaced.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.orders_stuck.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sell_replacement_uses_current_bid() {
        let (sim, _tracker, watchdog, _metrics) = harness(5_000);
        sim.set_ticker("ETH-LTC", 0.014, 0.016);
        let order = sim
            .sell(&Quote::limit("ETH-LTC", 0.015, 4.0, OrderSide::Sell))
            .await
            .unwrap();

        let guarded = {
            let watchdog = watchdog.clone();
            let order = order.clone();
            tokio::spawn(async move { watchdog.await_filled_guarded(order).await })
        };
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(5_001)).await;
        tokio::task::yield_now().await;

        let placements = sim.placements();
        assert_eq!(placements.len(), 2);
        assert_eq!(placements[1].rate, 0.014);

        sim.fill_order(&placements[1].id);
        assert!(guarded.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn partial_fill_replacement_covers_only_the_remainder() {
        let (sim, _tracker, watchdog, _metrics) = harness(10_000);
        sim.set_ticker("BTC-LTC", 0.0009, 0.0012);
        let order = sim
            .buy(&Quote::limit("BTC-LTC", 0.001, 10.0, OrderSide::Buy))
            .await
            .unwrap();

        let guarded = {
            let watchdog = watchdog.clone();
            let order = order.clone();
            tokio::spawn(async move { watchdog.await_filled_guarded(order).await })
        };
        tokio::task::yield_now().await;

        sim.partial_fill(&order.id, 6.0); // 4.0 remaining
        tokio::time::sleep(Duration::from_millis(10_001)).await;
        tokio::task::yield_now().await;

        let placements = sim.placements();
        assert_eq!(placements.len(), 2);
        assert_eq!(placements[1].quantity, 4.0);

        sim.fill_order(&placements[1].id);
        assert!(guarded.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_losing_to_fill_is_benign() {
        let (sim, _tracker, watchdog, metrics) = harness(10_000);
        let order = sim
            .buy(&Quote::limit("BTC-LTC", 0.001, 10.0, OrderSide::Buy))
            .await
            .unwrap();

        let guarded = {
            let watchdog = watchdog.clone();
            let order = order.clone();
            tokio::spawn(async move { watchdog.await_filled_guarded(order).await })
        };
        tokio::task::yield_now().await;

        // fill on the exchange without a stream update, so the watchdog's
        // cancel hits an already-terminal order
        sim.fill_order_silently(&order.id);
        tokio::time::sleep(Duration::from_millis(10_001)).await;

        let filled = guarded.await.unwrap().unwrap();
        assert_eq!(filled.id, order.id);
        assert_eq!(filled.status, OrderStatus::Filled);
        assert_eq!(metrics.orders_replaced.load(Ordering::Relaxed), 0);
        assert_eq!(sim.placements().len(), 1);
    }
}
