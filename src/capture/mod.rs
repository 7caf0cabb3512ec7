pub mod enricher;
pub mod queue;
