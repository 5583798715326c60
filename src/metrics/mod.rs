//! Lightweight operational counters, one instance per worker.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub detection_cycles: AtomicU64,
    pub opportunities_detected: AtomicU64,
    pub triangles_opened: AtomicU64,
    pub triangles_completed: AtomicU64,
    pub triangles_skipped: AtomicU64,
    pub triangles_failed: AtomicU64,
    pub orders_placed: AtomicU64,
    pub orders_replaced: AtomicU64,
    pub orders_stuck: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_detection_cycles(&self) {
        self.detection_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_opportunities_detected(&self) {
        self.opportunities_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_triangles_opened(&self) {
        self.triangles_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_triangles_completed(&self) {
        self.triangles_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_triangles_skipped(&self) {
        self.triangles_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_triangles_failed(&self) {
        self.triangles_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_orders_placed(&self) {
        self.orders_placed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_orders_replaced(&self) {
        self.orders_replaced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_orders_stuck(&self) {
        self.orders_stuck.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> String {
        format!(
            "cycles={} opportunities={} triangles opened={} completed={} skipped={} failed={} \
             orders placed={} replaced={} stuck={}",
            self.detection_cycles.load(Ordering::Relaxed),
            self.opportunities_detected.load(Ordering::Relaxed),
            self.triangles_opened.load(Ordering::Relaxed),
            self.triangles_completed.load(Ordering::Relaxed),
            self.triangles_skipped.load(Ordering::Relaxed),
            self.triangles_failed.load(Ordering::Relaxed),
            self.orders_placed.load(Ordering::Relaxed),
            self.orders_replaced.load(Ordering::Relaxed),
            self.orders_stuck.load(Ordering::Relaxed),
        )
    }
}
