pub mod arbitrage;
pub mod config;
pub mod error;
pub mod exchange;
pub mod metrics;
pub mod orders;
pub mod testing;
pub mod utils;

pub use arbitrage::{ExecutionCoordinator, OpportunityDetector, PivotWorker, TriangleTable};
pub use config::Config;
pub use error::{ArbError, Result};
pub use orders::{OrderLifecycleTracker, UnfilledOrderWatchdog};
