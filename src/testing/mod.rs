//! In-process simulated exchange for paper trading and tests.

pub mod sim;

pub use sim::SimulatedExchange;
