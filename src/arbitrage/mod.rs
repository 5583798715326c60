pub mod coordinator;
pub mod detector;
pub mod engine;

pub use coordinator::{ExecutionCoordinator, TriangleTable};
pub use detector::OpportunityDetector;
pub use engine::PivotWorker;
