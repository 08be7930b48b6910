//! Sample ingest and per-workflow aggregation

mod aggregator;

pub use aggregator::WorkflowAggregator;
