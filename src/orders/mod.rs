pub mod tracker;
pub mod watchdog;

pub use tracker::OrderLifecycleTracker;
pub use watchdog::UnfilledOrderWatchdog;
