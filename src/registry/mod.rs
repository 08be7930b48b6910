//! Registry module providing the main interface to the telemetry pipeline

mod builder;
mod registry;

pub use builder::RegistryBuilder;
pub use registry::{MetricsRegistry, TelemetryStats};

use crate::{
    error::Result,
    metrics::WorkflowProfile,
    types::{IngestOutcome, Millis, NodeEvent, SamplePhase},
};

/// Event subscription interface driven by the host execution engine.
///
/// Every call returns the per-event outcome; failures are recoverable and
/// never affect other workflows.
pub trait ProfilingHooks: Send + Sync {
    /// Apply one wire event
    fn handle_event(&self, event: &NodeEvent) -> Result<IngestOutcome>;

    fn on_workflow_start(&self, prompt_id: &str, timestamp: Millis) -> Result<IngestOutcome>;

    fn on_node_start(&self, prompt_id: &str, node_id: &str, node_type: &str, timestamp: Millis)
        -> Result<IngestOutcome>;

    fn on_node_end(
        &self,
        prompt_id: &str,
        node_id: &str,
        timestamp: Millis,
        vram_after: u64,
        ram_after: u64,
        error: Option<String>,
    ) -> Result<IngestOutcome>;

    fn on_cache_resolved(&self, prompt_id: &str, node_id: &str, hit: bool) -> Result<IngestOutcome>;

    fn on_vram_sample(&self, prompt_id: &str, node_id: &str, phase: SamplePhase, bytes: u64)
        -> Result<IngestOutcome>;

    fn on_ram_sample(&self, prompt_id: &str, node_id: &str, phase: SamplePhase, bytes: u64)
        -> Result<IngestOutcome>;

    fn record_error(&self, prompt_id: &str, node_id: &str, message: &str) -> Result<IngestOutcome>;

    /// Signal workflow completion
    fn on_workflow_end(&self, prompt_id: &str, end_time: Millis) -> Result<WorkflowProfile>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Drives any hook implementation through a one-node run
    fn run_single_node(hooks: &dyn ProfilingHooks) -> Result<WorkflowProfile> {
        hooks.on_node_start("p1", "n1", "KSampler", 0)?;
        hooks.on_node_end("p1", "n1", 100, 2000, 0, None)?;
        hooks.on_cache_resolved("p1", "n1", true)?;
        hooks.on_workflow_end("p1", 100)
    }

    #[tokio::test]
    async fn test_registry_as_hooks() {
        let registry = MetricsRegistry::builder().build().await.unwrap();
        let profile = run_single_node(&registry).unwrap();
        assert_eq!(profile.cache_hits, 1);
        assert_eq!(profile.total_vram_peak, 2000);
        assert!(registry.get_latest().is_some());
    }
}
