// Location: src/ingest/aggregator.rs

use std::sync::atomic::{AtomicU64, Ordering};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, error, warn};

use crate::{
    error::{Result, TelemetryError},
    metrics::{IngestStats, NodeProfile, WorkflowProfile},
    types::{EventKind, IngestOutcome, MemoryPool, Millis, NodeEvent, SamplePhase, TensorSizes},
};

/// Atomic counters behind [`IngestStats`]
#[derive(Debug, Default)]
struct IngestCounters {
    applied: AtomicU64,
    duplicates: AtomicU64,
    dangling_nodes: AtomicU64,
    unknown_workflows: AtomicU64,
    illegal_states: AtomicU64,
    rejected: AtomicU64,
}

impl IngestCounters {
    fn snapshot(&self) -> IngestStats {
        IngestStats {
            applied: self.applied.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            dangling_nodes: self.dangling_nodes.load(Ordering::Relaxed),
            unknown_workflows: self.unknown_workflows.load(Ordering::Relaxed),
            illegal_states: self.illegal_states.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.applied,
            &self.duplicates,
            &self.dangling_nodes,
            &self.unknown_workflows,
            &self.illegal_states,
            &self.rejected,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Owns the in-flight workflows and assembles node events into profiles.
///
/// Each in-flight workflow is one `DashMap` entry, so events for the same
/// prompt are serialized by the entry lock while different prompts proceed
/// independently. Every per-event failure is logged, counted and returned to
/// the caller; none of them touch state belonging to another workflow.
#[derive(Debug, Default)]
pub struct WorkflowAggregator {
    in_flight: DashMap<String, WorkflowProfile>,
    counters: IngestCounters,
}

fn is_duplicate(workflow: &WorkflowProfile, seq: Option<u64>) -> bool {
    match (workflow.last_seq, seq) {
        (Some(last), Some(seq)) => seq <= last,
        _ => false,
    }
}

fn mark_seq(workflow: &mut WorkflowProfile, seq: Option<u64>) {
    if let Some(seq) = seq {
        workflow.last_seq = Some(workflow.last_seq.map_or(seq, |last| last.max(seq)));
    }
}

fn dangling(prompt_id: &str, node_id: &str) -> TelemetryError {
    TelemetryError::DanglingNode {
        prompt_id: prompt_id.to_string(),
        node_id: node_id.to_string(),
    }
}

fn unknown(prompt_id: &str) -> TelemetryError {
    TelemetryError::UnknownWorkflow {
        prompt_id: prompt_id.to_string(),
    }
}

/// Optional values carried by a start event
#[derive(Debug, Clone, Default)]
struct NodeOpen {
    vram_before: Option<u64>,
    ram_before: Option<u64>,
    input_sizes: Option<TensorSizes>,
}

/// Memory values carried by an end event; `None` keeps what samples already set
#[derive(Debug, Clone, Default)]
struct NodeClose {
    vram_before: Option<u64>,
    vram_after: Option<u64>,
    ram_before: Option<u64>,
    ram_after: Option<u64>,
    output_sizes: Option<TensorSizes>,
    error: Option<String>,
}

impl WorkflowAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicitly open a workflow before any node starts
    pub fn on_workflow_start(&self, prompt_id: &str, timestamp: Millis) -> Result<IngestOutcome> {
        let result = match self.in_flight.entry(prompt_id.to_string()) {
            Entry::Occupied(_) => Err(TelemetryError::DuplicateWorkflow {
                prompt_id: prompt_id.to_string(),
            }),
            Entry::Vacant(vacant) => {
                vacant.insert(WorkflowProfile::new(prompt_id, timestamp));
                debug!(%prompt_id, "Started workflow profiling");
                Ok(IngestOutcome::Created)
            }
        };
        self.track(prompt_id, None, result)
    }

    pub fn on_node_start(
        &self,
        prompt_id: &str,
        node_id: &str,
        node_type: &str,
        timestamp: Millis,
    ) -> Result<IngestOutcome> {
        let result = self.start_node(prompt_id, node_id, node_type, timestamp, None, NodeOpen::default());
        self.track(prompt_id, Some(node_id), result)
    }

    pub fn on_node_end(
        &self,
        prompt_id: &str,
        node_id: &str,
        timestamp: Millis,
        vram_after: u64,
        ram_after: u64,
        error: Option<String>,
    ) -> Result<IngestOutcome> {
        let close = NodeClose {
            vram_after: Some(vram_after),
            ram_after: Some(ram_after),
            error,
            ..Default::default()
        };
        let result = self.close_node(prompt_id, node_id, timestamp, None, close);
        self.track(prompt_id, Some(node_id), result)
    }

    /// Resolve the node's cache outcome; a second resolution keeps the first value
    pub fn on_cache_resolved(&self, prompt_id: &str, node_id: &str, hit: bool) -> Result<IngestOutcome> {
        let result = self.resolve_cache(prompt_id, node_id, hit, None);
        self.track(prompt_id, Some(node_id), result)
    }

    pub fn on_vram_sample(
        &self,
        prompt_id: &str,
        node_id: &str,
        phase: SamplePhase,
        bytes: u64,
    ) -> Result<IngestOutcome> {
        let result = self.sample(prompt_id, node_id, MemoryPool::Vram, phase, bytes, None);
        self.track(prompt_id, Some(node_id), result)
    }

    pub fn on_ram_sample(
        &self,
        prompt_id: &str,
        node_id: &str,
        phase: SamplePhase,
        bytes: u64,
    ) -> Result<IngestOutcome> {
        let result = self.sample(prompt_id, node_id, MemoryPool::Ram, phase, bytes, None);
        self.track(prompt_id, Some(node_id), result)
    }

    /// Attach an error to a node that has started, open or closed
    pub fn record_error(&self, prompt_id: &str, node_id: &str, message: &str) -> Result<IngestOutcome> {
        let result = self.attach_error(prompt_id, node_id, message, None);
        self.track(prompt_id, Some(node_id), result)
    }

    /// Apply one wire event
    pub fn apply(&self, event: &NodeEvent) -> Result<IngestOutcome> {
        let result = self.dispatch(event);
        self.track(&event.prompt_id, Some(&event.node_id), result)
    }

    fn dispatch(&self, event: &NodeEvent) -> Result<IngestOutcome> {
        let prompt_id = event.prompt_id.as_str();
        let node_id = event.node_id.as_str();

        match event.kind {
            EventKind::Start => {
                let node_type = event
                    .node_type
                    .as_deref()
                    .ok_or_else(|| TelemetryError::invalid_sample("nodeType", "start event without a node type"))?;
                let open = NodeOpen {
                    vram_before: event.vram_before,
                    ram_before: event.ram_before,
                    input_sizes: event.input_sizes.clone(),
                };
                self.start_node(prompt_id, node_id, node_type, event.timestamp, event.seq, open)
            }
            EventKind::End => {
                let close = NodeClose {
                    vram_before: event.vram_before,
                    vram_after: event.vram_after,
                    ram_before: event.ram_before,
                    ram_after: event.ram_after,
                    output_sizes: event.output_sizes.clone(),
                    error: event.error.clone(),
                };
                self.close_node(prompt_id, node_id, event.timestamp, event.seq, close)
            }
            EventKind::CacheResolved => {
                let hit = event
                    .cache_hit
                    .ok_or_else(|| TelemetryError::invalid_sample("cacheHit", "cache event without an outcome"))?;
                self.resolve_cache(prompt_id, node_id, hit, event.seq)
            }
            EventKind::Sample => {
                let phase = event
                    .phase
                    .ok_or_else(|| TelemetryError::invalid_sample("phase", "sample event without a phase"))?;
                let mut outcome = None;
                if let Some(bytes) = event.vram_sample {
                    outcome = Some(self.sample(prompt_id, node_id, MemoryPool::Vram, phase, bytes, event.seq)?);
                }
                if let Some(bytes) = event.ram_sample {
                    // The sequence number was consumed by the VRAM half of the event.
                    let seq = if outcome.is_some() { None } else { event.seq };
                    outcome = Some(self.sample(prompt_id, node_id, MemoryPool::Ram, phase, bytes, seq)?);
                }
                outcome.ok_or_else(|| TelemetryError::invalid_sample("vramSample", "sample event without a value"))
            }
            EventKind::Error => {
                let message = event
                    .error
                    .as_deref()
                    .ok_or_else(|| TelemetryError::invalid_sample("error", "error event without a message"))?;
                self.attach_error(prompt_id, node_id, message, event.seq)
            }
        }
    }

    fn start_node(
        &self,
        prompt_id: &str,
        node_id: &str,
        node_type: &str,
        timestamp: Millis,
        seq: Option<u64>,
        open: NodeOpen,
    ) -> Result<IngestOutcome> {
        let (mut workflow, created) = match self.in_flight.entry(prompt_id.to_string()) {
            Entry::Occupied(occupied) => (occupied.into_ref(), false),
            Entry::Vacant(vacant) => (vacant.insert(WorkflowProfile::new(prompt_id, timestamp)), true),
        };

        if is_duplicate(&workflow, seq) {
            return Ok(IngestOutcome::Duplicate);
        }

        let mut node = NodeProfile::open(node_id, node_type, timestamp);
        node.vram_before = open.vram_before.unwrap_or(0);
        node.ram_before = open.ram_before.unwrap_or(0);
        node.input_sizes = open.input_sizes.unwrap_or_default();
        if !workflow.nodes.insert(node) {
            return Err(TelemetryError::illegal_state(prompt_id, node_id, "node already started in this run"));
        }
        workflow.execution_order.push(node_id.to_string());
        mark_seq(&mut workflow, seq);

        debug!(%prompt_id, %node_id, %node_type, "Started node profiling");
        Ok(if created { IngestOutcome::Created } else { IngestOutcome::Applied })
    }

    /// Run `f` against one in-flight workflow under its entry lock
    fn with_workflow<F>(&self, prompt_id: &str, seq: Option<u64>, f: F) -> Result<IngestOutcome>
    where
        F: FnOnce(&mut WorkflowProfile) -> Result<()>,
    {
        let mut workflow = self.in_flight.get_mut(prompt_id).ok_or_else(|| unknown(prompt_id))?;
        if is_duplicate(&workflow, seq) {
            return Ok(IngestOutcome::Duplicate);
        }
        f(&mut *workflow)?;
        mark_seq(&mut workflow, seq);
        Ok(IngestOutcome::Applied)
    }

    fn close_node(
        &self,
        prompt_id: &str,
        node_id: &str,
        timestamp: Millis,
        seq: Option<u64>,
        close: NodeClose,
    ) -> Result<IngestOutcome> {
        self.with_workflow(prompt_id, seq, |workflow| {
            let node = workflow.nodes.get_mut(node_id).ok_or_else(|| dangling(prompt_id, node_id))?;
            if !node.is_open() {
                return Err(TelemetryError::illegal_state(prompt_id, node_id, "node already ended"));
            }
            if timestamp < node.start_time {
                return Err(TelemetryError::invalid_sample(
                    "endTime",
                    format!("end time {} precedes start time {}", timestamp, node.start_time),
                ));
            }

            node.end_time = Some(timestamp);
            if let Some(bytes) = close.vram_before {
                node.vram_before = bytes;
            }
            if let Some(bytes) = close.ram_before {
                node.ram_before = bytes;
            }
            if let Some(bytes) = close.vram_after {
                node.vram_after = bytes;
            }
            if let Some(bytes) = close.ram_after {
                node.ram_after = bytes;
            }
            if let Some(sizes) = close.output_sizes {
                node.output_sizes = sizes;
            }
            node.vram_peak = Some(node.vram_peak.map_or(node.vram_after, |peak| peak.max(node.vram_after)));
            node.ram_peak = Some(node.ram_peak.map_or(node.ram_after, |peak| peak.max(node.ram_after)));
            if let Some(message) = close.error {
                error!(%prompt_id, %node_id, error = %message, "Node execution failed");
                node.error = Some(message);
            }

            let (vram_after, ram_after) = (node.vram_after, node.ram_after);
            workflow.observe_after(vram_after, ram_after);
            debug!(%prompt_id, %node_id, "Ended node profiling");
            Ok(())
        })
    }

    fn resolve_cache(&self, prompt_id: &str, node_id: &str, hit: bool, seq: Option<u64>) -> Result<IngestOutcome> {
        self.with_workflow(prompt_id, seq, |workflow| {
            let node = workflow.nodes.get_mut(node_id).ok_or_else(|| dangling(prompt_id, node_id))?;
            if let Some(first) = node.cache_hit {
                return Err(TelemetryError::illegal_state(
                    prompt_id,
                    node_id,
                    format!("cache outcome already resolved as {}", if first { "hit" } else { "miss" }),
                ));
            }
            node.cache_hit = Some(hit);
            if hit {
                workflow.cache_hits += 1;
            } else {
                workflow.cache_misses += 1;
            }
            Ok(())
        })
    }

    fn sample(
        &self,
        prompt_id: &str,
        node_id: &str,
        pool: MemoryPool,
        phase: SamplePhase,
        bytes: u64,
        seq: Option<u64>,
    ) -> Result<IngestOutcome> {
        self.with_workflow(prompt_id, seq, |workflow| {
            let node = workflow.nodes.get_mut(node_id).ok_or_else(|| dangling(prompt_id, node_id))?;
            if !node.is_open() {
                return Err(TelemetryError::illegal_state(prompt_id, node_id, "memory sample for an ended node"));
            }

            let (before, after, peak) = match pool {
                MemoryPool::Vram => (&mut node.vram_before, &mut node.vram_after, &mut node.vram_peak),
                MemoryPool::Ram => (&mut node.ram_before, &mut node.ram_after, &mut node.ram_peak),
            };
            match phase {
                SamplePhase::Before => *before = bytes,
                SamplePhase::During => *peak = Some(peak.map_or(bytes, |p| p.max(bytes))),
                SamplePhase::After => {
                    *after = bytes;
                    *peak = Some(peak.map_or(bytes, |p| p.max(bytes)));
                }
            }

            if phase == SamplePhase::After {
                let (vram_after, ram_after) = (node.vram_after, node.ram_after);
                workflow.observe_after(vram_after, ram_after);
            }
            Ok(())
        })
    }

    fn attach_error(&self, prompt_id: &str, node_id: &str, message: &str, seq: Option<u64>) -> Result<IngestOutcome> {
        self.with_workflow(prompt_id, seq, |workflow| {
            let node = workflow.nodes.get_mut(node_id).ok_or_else(|| dangling(prompt_id, node_id))?;
            error!(%prompt_id, %node_id, error = %message, "Node execution failed");
            node.error = Some(message.to_string());
            Ok(())
        })
    }

    /// Close a workflow and hand it out of the in-flight set.
    ///
    /// An end time before the workflow's start is rejected and the workflow
    /// stays in flight.
    pub fn finalize(&self, prompt_id: &str, end_time: Millis) -> Result<WorkflowProfile> {
        match self.in_flight.remove_if(prompt_id, |_, workflow| end_time >= workflow.start_time) {
            Some((_, mut profile)) => {
                profile.end_time = Some(end_time);
                self.counters.applied.fetch_add(1, Ordering::Relaxed);
                debug!(
                    %prompt_id,
                    nodes = profile.nodes.len(),
                    cache_hits = profile.cache_hits,
                    cache_misses = profile.cache_misses,
                    "Finalized workflow"
                );
                Ok(profile)
            }
            None => {
                let err = match self.in_flight.get(prompt_id) {
                    Some(workflow) => TelemetryError::invalid_sample(
                        "endTime",
                        format!("end time {} precedes workflow start {}", end_time, workflow.start_time),
                    ),
                    None => unknown(prompt_id),
                };
                self.note_error(prompt_id, None, &err);
                Err(err)
            }
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, prompt_id: &str) -> bool {
        self.in_flight.contains_key(prompt_id)
    }

    /// Copy of one in-flight workflow
    pub fn get(&self, prompt_id: &str) -> Option<WorkflowProfile> {
        self.in_flight.get(prompt_id).map(|workflow| workflow.clone())
    }

    /// Copies of all in-flight workflows, oldest first
    pub fn snapshot(&self) -> Vec<WorkflowProfile> {
        let mut workflows: Vec<_> = self.in_flight.iter().map(|entry| entry.value().clone()).collect();
        workflows.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.prompt_id.cmp(&b.prompt_id)));
        workflows
    }

    pub fn stats(&self) -> IngestStats {
        self.counters.snapshot()
    }

    pub fn reset(&self) {
        self.in_flight.clear();
        self.counters.reset();
    }

    fn track(&self, prompt_id: &str, node_id: Option<&str>, result: Result<IngestOutcome>) -> Result<IngestOutcome> {
        match &result {
            Ok(IngestOutcome::Duplicate) => {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                debug!(%prompt_id, node_id = node_id.unwrap_or(""), "Ignored duplicate event");
            }
            Ok(_) => {
                self.counters.applied.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => self.note_error(prompt_id, node_id, err),
        }
        result
    }

    fn note_error(&self, prompt_id: &str, node_id: Option<&str>, err: &TelemetryError) {
        let counter = match err {
            TelemetryError::DanglingNode { .. } => &self.counters.dangling_nodes,
            TelemetryError::UnknownWorkflow { .. } => &self.counters.unknown_workflows,
            TelemetryError::IllegalState { .. } => &self.counters.illegal_states,
            _ => &self.counters.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        warn!(%prompt_id, node_id = node_id.unwrap_or(""), error = %err, "Dropped ingest event");
    }
}
