use std::collections::{BTreeMap, HashMap};
use parking_lot::RwLock;
use tracing::debug;

use super::types::{NodeAverages, NodeProfile, WorkflowAverages, WorkflowProfile};

/// Running sums for one node type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeAccumulator {
    pub total_time: u64,
    pub vram_usage: i64,
    pub ram_usage: i64,
    pub count: u64,
    pub cache_hits: u64,
}

/// Running sums over all finalized workflows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkflowAccumulator {
    pub total_time: u64,
    pub vram_peak: u64,
    pub ram_peak: u64,
    pub count: u64,
}

fn ratio(sum: f64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

impl NodeAccumulator {
    fn fold(&mut self, node: &NodeProfile, duration: u64) {
        self.total_time += duration;
        self.vram_usage += node.vram_delta();
        self.ram_usage += node.ram_delta();
        self.count += 1;
        if node.cache_hit == Some(true) {
            self.cache_hits += 1;
        }
    }

    pub fn averages(&self) -> NodeAverages {
        NodeAverages {
            avg_time: ratio(self.total_time as f64, self.count),
            avg_vram: ratio(self.vram_usage as f64, self.count),
            avg_ram: ratio(self.ram_usage as f64, self.count),
            count: self.count,
            cache_hit_ratio: ratio(self.cache_hits as f64, self.count),
        }
    }
}

impl WorkflowAccumulator {
    pub fn averages(&self) -> WorkflowAverages {
        WorkflowAverages {
            avg_time: ratio(self.total_time as f64, self.count),
            avg_vram_peak: ratio(self.vram_peak as f64, self.count),
            avg_ram_peak: ratio(self.ram_peak as f64, self.count),
            count: self.count,
        }
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    nodes: HashMap<String, NodeAccumulator>,
    workflow: WorkflowAccumulator,
}

/// Incrementally maintained averages per node type and per workflow.
///
/// Only sums and counts are stored; averages are derived on every read, so
/// memory stays proportional to the number of distinct node types.
#[derive(Debug, Default)]
pub struct RunningAverageTracker {
    state: RwLock<TrackerState>,
}

impl RunningAverageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a finalized workflow into the accumulators.
    ///
    /// All accumulators touched by one workflow are updated under a single
    /// write lock. Nodes that never closed carry no timing and are skipped.
    pub fn fold(&self, profile: &WorkflowProfile) {
        let mut state = self.state.write();

        let mut folded = 0usize;
        for node in profile.nodes.iter() {
            let Some(duration) = node.duration() else {
                continue;
            };
            state
                .nodes
                .entry(node.node_type.clone())
                .or_default()
                .fold(node, duration);
            folded += 1;
        }

        let workflow = &mut state.workflow;
        workflow.total_time += profile.duration().unwrap_or(0);
        workflow.vram_peak += profile.total_vram_peak;
        workflow.ram_peak += profile.total_ram_peak;
        workflow.count += 1;

        debug!(
            prompt_id = %profile.prompt_id,
            nodes = folded,
            workflows = workflow.count,
            "Folded workflow into running averages"
        );
    }

    pub fn node_accumulator(&self, node_type: &str) -> Option<NodeAccumulator> {
        self.state.read().nodes.get(node_type).copied()
    }

    pub fn workflow_accumulator(&self) -> WorkflowAccumulator {
        self.state.read().workflow
    }

    pub fn node_average(&self, node_type: &str) -> Option<NodeAverages> {
        self.node_accumulator(node_type).map(|acc| acc.averages())
    }

    /// Averages for every node type seen, sorted by type name
    pub fn node_averages(&self) -> BTreeMap<String, NodeAverages> {
        self.state
            .read()
            .nodes
            .iter()
            .map(|(node_type, acc)| (node_type.clone(), acc.averages()))
            .collect()
    }

    pub fn workflow_averages(&self) -> WorkflowAverages {
        self.state.read().workflow.averages()
    }

    pub fn node_type_count(&self) -> usize {
        self.state.read().nodes.len()
    }

    pub fn reset(&self) {
        *self.state.write() = TrackerState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed_node(id: &str, node_type: &str, start: u64, end: u64, vram: (u64, u64), hit: Option<bool>) -> NodeProfile {
        let mut node = NodeProfile::open(id, node_type, start);
        node.end_time = Some(end);
        node.vram_before = vram.0;
        node.vram_after = vram.1;
        node.cache_hit = hit;
        node
    }

    fn workflow(prompt_id: &str, nodes: Vec<NodeProfile>, end: u64, vram_peak: u64) -> WorkflowProfile {
        let mut profile = WorkflowProfile::new(prompt_id, 0);
        for node in nodes {
            profile.execution_order.push(node.node_id.clone());
            profile.nodes.insert(node);
        }
        profile.end_time = Some(end);
        profile.total_vram_peak = vram_peak;
        profile
    }

    #[test]
    fn test_empty_tracker_reports_zero() {
        let tracker = RunningAverageTracker::new();
        assert!(tracker.node_averages().is_empty());
        assert_eq!(tracker.node_average("KSampler"), None);

        let averages = tracker.workflow_averages();
        assert_eq!(averages.count, 0);
        assert_eq!(averages.avg_time, 0.0);
        assert_eq!(NodeAccumulator::default().averages(), NodeAverages::default());
    }

    #[test]
    fn test_single_fold() {
        let tracker = RunningAverageTracker::new();
        tracker.fold(&workflow(
            "p1",
            vec![closed_node("n1", "KSampler", 0, 100, (1000, 2000), Some(true))],
            100,
            2000,
        ));

        let avg = tracker.node_average("KSampler").unwrap();
        assert_eq!(avg.avg_time, 100.0);
        assert_eq!(avg.avg_vram, 1000.0);
        assert_eq!(avg.count, 1);
        assert_eq!(avg.cache_hit_ratio, 1.0);

        let wf = tracker.workflow_averages();
        assert_eq!(wf.avg_time, 100.0);
        assert_eq!(wf.avg_vram_peak, 2000.0);
        assert_eq!(wf.count, 1);
    }

    #[test]
    fn test_average_equals_sum_over_count_after_each_fold() {
        let tracker = RunningAverageTracker::new();
        let durations = [10u64, 35, 7, 120, 3];

        for (i, duration) in durations.iter().enumerate() {
            let hit = if i % 2 == 0 { Some(true) } else { Some(false) };
            tracker.fold(&workflow(
                &format!("p{}", i),
                vec![closed_node("n1", "VAEDecode", 0, *duration, (0, 0), hit)],
                *duration,
                0,
            ));

            let acc = tracker.node_accumulator("VAEDecode").unwrap();
            let avg = acc.averages();
            assert_eq!(acc.count, i as u64 + 1);
            assert_eq!(avg.avg_time, acc.total_time as f64 / acc.count as f64);
            assert_eq!(avg.cache_hit_ratio, acc.cache_hits as f64 / acc.count as f64);
        }

        assert_eq!(tracker.node_accumulator("VAEDecode").unwrap().total_time, 175);
        assert_eq!(tracker.node_accumulator("VAEDecode").unwrap().cache_hits, 3);
    }

    #[test]
    fn test_open_nodes_are_skipped() {
        let tracker = RunningAverageTracker::new();
        let mut profile = workflow(
            "p1",
            vec![closed_node("n1", "KSampler", 0, 50, (0, 0), None)],
            60,
            0,
        );
        profile.nodes.insert(NodeProfile::open("n2", "SaveImage", 55));
        profile.execution_order.push("n2".to_string());

        tracker.fold(&profile);
        assert_eq!(tracker.node_type_count(), 1);
        assert_eq!(tracker.node_average("KSampler").unwrap().cache_hit_ratio, 0.0);
    }

    #[test]
    fn test_memory_freed_yields_negative_average() {
        let tracker = RunningAverageTracker::new();
        tracker.fold(&workflow(
            "p1",
            vec![closed_node("n1", "FreeMemory", 0, 5, (8000, 2000), None)],
            5,
            8000,
        ));
        assert_eq!(tracker.node_average("FreeMemory").unwrap().avg_vram, -6000.0);
    }

    #[test]
    fn test_concurrent_folds_do_not_lose_updates() {
        let tracker = std::sync::Arc::new(RunningAverageTracker::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        tracker.fold(&workflow(
                            &format!("p{}-{}", t, i),
                            vec![closed_node("n1", "KSampler", 0, 2, (0, 0), Some(true))],
                            2,
                            0,
                        ));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tracker.workflow_accumulator().count, 400);
        let acc = tracker.node_accumulator("KSampler").unwrap();
        assert_eq!(acc.count, 400);
        assert_eq!(acc.total_time, 800);
    }

    #[test]
    fn test_reset() {
        let tracker = RunningAverageTracker::new();
        tracker.fold(&workflow(
            "p1",
            vec![closed_node("n1", "KSampler", 0, 10, (0, 0), None)],
            10,
            0,
        ));
        tracker.reset();
        assert_eq!(tracker.node_type_count(), 0);
        assert_eq!(tracker.workflow_averages().count, 0);
    }
}
