//! Order Lifecycle Tracker
//!
//! Consumes the broker's raw order-status stream and republishes typed,
//! per-order events: filled, partially filled, canceled. Terminal state is
//! buffered per order id, and the buffered-state check happens under the same
//! lock as waiter registration, so a fill that lands before a waiter attaches
//! is never lost.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};

use crate::error::{ArbError, Result};
use crate::exchange::{Broker, Order, OrderStatus};

#[derive(Default)]
struct TrackedOrder {
    latest: Option<Order>,
    /// Set once, when the first terminal update is republished. Later
    /// terminal deliveries for the same order are no-ops.
    terminal_emitted: bool,
    filled_waiters: Vec<oneshot::Sender<Order>>,
    canceled_waiters: Vec<oneshot::Sender<Order>>,
    terminal_waiters: Vec<oneshot::Sender<Order>>,
    partial_listeners: Vec<mpsc::UnboundedSender<Order>>,
}

enum WaitOutcome {
    /// Terminal state already buffered with the awaited outcome
    Ready(Order),
    /// Terminal state already buffered with the opposite outcome; this wait
    /// can never resolve
    NeverResolves(Order),
    /// Still pending, waiter registered
    Pending(oneshot::Receiver<Order>),
    /// Order id unknown to the tracker
    Unknown,
}

enum WaitKind {
    Filled,
    Canceled,
    Terminal,
}

/// Republishes the broker's order-status stream as per-order typed events.
#[derive(Clone)]
pub struct OrderLifecycleTracker {
    broker: Arc<dyn Broker>,
    orders: Arc<Mutex<HashMap<String, TrackedOrder>>>,
}

impl OrderLifecycleTracker {
    /// Subscribes to the broker's update stream and spawns the consumer task.
    pub fn start(broker: Arc<dyn Broker>) -> Arc<Self> {
        let updates = broker.order_updates();
        let tracker = Arc::new(OrderLifecycleTracker {
            broker,
            orders: Arc::new(Mutex::new(HashMap::new())),
        });
        let consumer = tracker.clone();
        tokio::spawn(async move { consumer.consume(updates).await });
        tracker
    }

    async fn consume(self: Arc<Self>, mut updates: mpsc::UnboundedReceiver<Order>) {
        while let Some(update) = updates.recv().await {
            self.ingest(update);
        }
        debug!("order status stream ended, lifecycle tracker stopping");
    }

    /// Seeds local state with a placement ack. Called once per placed order;
    /// an update that already arrived for the id wins over the ack.
    pub fn track(&self, order: Order) {
        let mut orders = self.orders.lock().expect("tracker lock poisoned");
        let entry = orders.entry(order.id.clone()).or_default();
        if entry.latest.is_none() {
            entry.latest = Some(order);
        }
    }

    /// Applies one raw status update and fires the typed events it implies.
    pub fn ingest(&self, update: Order) {
        let mut orders = self.orders.lock().expect("tracker lock poisoned");
        let entry = orders.entry(update.id.clone()).or_default();

        if entry.terminal_emitted {
            debug!(
                "duplicate terminal update for order {} ignored",
                update.id
            );
            return;
        }

        // quantity remaining is monotonically non-increasing until terminal
        let previous_remaining = entry
            .latest
            .as_ref()
            .map(|o| o.quantity_remaining)
            .unwrap_or(f64::INFINITY);
        let mut update = update;
        if update.quantity_remaining > previous_remaining {
            warn!(
                "order {} reported remaining {} > previous {}, clamping",
                update.id, update.quantity_remaining, previous_remaining
            );
            update.quantity_remaining = previous_remaining;
        }

        match update.status {
            OrderStatus::Filled => {
                entry.terminal_emitted = true;
                entry.latest = Some(update.clone());
                for waiter in entry.filled_waiters.drain(..) {
                    let _ = waiter.send(update.clone());
                }
                for waiter in entry.terminal_waiters.drain(..) {
                    let _ = waiter.send(update.clone());
                }
                // a fill can never follow, release any cancel waiters
                entry.canceled_waiters.clear();
            }
            OrderStatus::Canceled => {
                entry.terminal_emitted = true;
                entry.latest = Some(update.clone());
                for waiter in entry.canceled_waiters.drain(..) {
                    let _ = waiter.send(update.clone());
                }
                for waiter in entry.terminal_waiters.drain(..) {
                    let _ = waiter.send(update.clone());
                }
                entry.filled_waiters.clear();
            }
            OrderStatus::Open => {
                let partially_filled = update.quantity_remaining < previous_remaining;
                entry.latest = Some(update.clone());
                if partially_filled {
                    entry
                        .partial_listeners
                        .retain(|listener| listener.send(update.clone()).is_ok());
                }
            }
        }
    }

    /// Latest locally-known state of an order.
    pub fn current(&self, order_id: &str) -> Option<Order> {
        let orders = self.orders.lock().expect("tracker lock poisoned");
        orders.get(order_id).and_then(|entry| entry.latest.clone())
    }

    /// Resolves once, when the order is fully filled. Errors with
    /// `ChannelClosed` if the order terminates as canceled instead.
    pub async fn await_filled(&self, order_id: &str) -> Result<Order> {
        self.await_event(order_id, WaitKind::Filled).await
    }

    /// Resolves once, when the order's cancellation is confirmed.
    pub async fn await_canceled(&self, order_id: &str) -> Result<Order> {
        self.await_event(order_id, WaitKind::Canceled).await
    }

    /// Resolves once, on either terminal outcome.
    pub async fn await_terminal(&self, order_id: &str) -> Result<Order> {
        self.await_event(order_id, WaitKind::Terminal).await
    }

    /// A stream of partial-fill updates for one order. Closed when the
    /// tracker drops the listener on terminal state.
    pub fn subscribe_partial_fills(&self, order_id: &str) -> mpsc::UnboundedReceiver<Order> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut orders = self.orders.lock().expect("tracker lock poisoned");
        let entry = orders.entry(order_id.to_string()).or_default();
        entry.partial_listeners.push(tx);
        rx
    }

    async fn await_event(&self, order_id: &str, kind: WaitKind) -> Result<Order> {
        match self.register_waiter(order_id, &kind) {
            WaitOutcome::Ready(order) => return Ok(order),
            WaitOutcome::NeverResolves(order) => {
                return Err(ArbError::ChannelClosed(format!(
                    "order {} terminated as {:?}",
                    order.id, order.status
                )))
            }
            WaitOutcome::Pending(rx) => {
                return rx.await.map_err(|_| {
                    ArbError::ChannelClosed(format!(
                        "wait for order {} abandoned by tracker",
                        order_id
                    ))
                })
            }
            WaitOutcome::Unknown => {}
        }

        // Unknown id: query the broker once, fold the answer into local
        // state, then register for real. The second registration happens
        // under the lock, so an update racing the query cannot be lost.
        let fetched = self.broker.get_order(order_id).await?;
        self.ingest(fetched);
        match self.register_waiter(order_id, &kind) {
            WaitOutcome::Ready(order) => Ok(order),
            WaitOutcome::NeverResolves(order) => Err(ArbError::ChannelClosed(format!(
                "order {} terminated as {:?}",
                order.id, order.status
            ))),
            WaitOutcome::Pending(rx) => rx.await.map_err(|_| {
                ArbError::ChannelClosed(format!("wait for order {} abandoned by tracker", order_id))
            }),
            WaitOutcome::Unknown => Err(ArbError::OrderNotFound(order_id.to_string())),
        }
    }

    /// Checks buffered terminal state and registers the waiter under one
    /// lock. This is the atomic check-then-subscribe that closes the
    /// fast-fill race.
    fn register_waiter(&self, order_id: &str, kind: &WaitKind) -> WaitOutcome {
        let mut orders = self.orders.lock().expect("tracker lock poisoned");
        let entry = match orders.get_mut(order_id) {
            Some(entry) => entry,
            None => return WaitOutcome::Unknown,
        };
        if entry.terminal_emitted {
            let order = entry
                .latest
                .clone()
                .expect("terminal order without state");
            let wanted = match (kind, order.status) {
                (WaitKind::Terminal, _) => true,
                (WaitKind::Filled, OrderStatus::Filled) => true,
                (WaitKind::Canceled, OrderStatus::Canceled) => true,
                _ => false,
            };
            return if wanted {
                WaitOutcome::Ready(order)
            } else {
                WaitOutcome::NeverResolves(order)
            };
        }
        let (tx, rx) = oneshot::channel();
        match kind {
            WaitKind::Filled => entry.filled_waiters.push(tx),
            WaitKind::Canceled => entry.canceled_waiters.push(tx),
            WaitKind::Terminal => entry.terminal_waiters.push(tx),
        }
        WaitOutcome::Pending(rx)
    }
}
