//! Profile data model and running averages

mod tracker;
mod types;

pub use tracker::{NodeAccumulator, RunningAverageTracker, WorkflowAccumulator};
pub use types::{
    IngestStats,
    NodeAverages,
    NodeProfile,
    NodeProfiles,
    WorkflowAverages,
    WorkflowProfile,
};
