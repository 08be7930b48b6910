//! Ingest event types shared between the execution engine and the registry

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use serde::{Serialize, Deserialize};

/// Milliseconds since the unix epoch, as supplied by the execution engine
pub type Millis = u64;

/// Tensor shapes keyed by slot name, e.g. `output_0 -> [1, 4, 64, 64]`
pub type TensorSizes = BTreeMap<String, Vec<u64>>;

/// Current wall-clock time in milliseconds
pub fn now_millis() -> Millis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Millis)
        .unwrap_or(0)
}

/// Kind of a node lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Start,
    End,
    CacheResolved,
    Sample,
    Error,
}

/// Memory pool a sample belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MemoryPool {
    Vram,
    Ram,
}

/// Position of a memory sample relative to the node's execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SamplePhase {
    Before,
    During,
    After,
}

/// One event from the execution engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEvent {
    pub prompt_id: String,
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    pub kind: EventKind,
    pub timestamp: Millis,
    /// Monotonically increasing per workflow when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vram_before: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vram_after: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_before: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_after: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_hit: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<SamplePhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vram_sample: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_sample: Option<u64>,
    /// Input shapes, carried by start events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_sizes: Option<TensorSizes>,
    /// Output shapes, carried by end events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_sizes: Option<TensorSizes>,
}

impl NodeEvent {
    fn new(prompt_id: impl Into<String>, node_id: impl Into<String>, kind: EventKind, timestamp: Millis) -> Self {
        Self {
            prompt_id: prompt_id.into(),
            node_id: node_id.into(),
            node_type: None,
            kind,
            timestamp,
            seq: None,
            vram_before: None,
            vram_after: None,
            ram_before: None,
            ram_after: None,
            cache_hit: None,
            error: None,
            phase: None,
            vram_sample: None,
            ram_sample: None,
            input_sizes: None,
            output_sizes: None,
        }
    }

    pub fn start(
        prompt_id: impl Into<String>,
        node_id: impl Into<String>,
        node_type: impl Into<String>,
        timestamp: Millis,
    ) -> Self {
        Self {
            node_type: Some(node_type.into()),
            ..Self::new(prompt_id, node_id, EventKind::Start, timestamp)
        }
    }

    pub fn end(prompt_id: impl Into<String>, node_id: impl Into<String>, timestamp: Millis) -> Self {
        Self::new(prompt_id, node_id, EventKind::End, timestamp)
    }

    pub fn cache_resolved(
        prompt_id: impl Into<String>,
        node_id: impl Into<String>,
        hit: bool,
        timestamp: Millis,
    ) -> Self {
        Self {
            cache_hit: Some(hit),
            ..Self::new(prompt_id, node_id, EventKind::CacheResolved, timestamp)
        }
    }

    pub fn sample(
        prompt_id: impl Into<String>,
        node_id: impl Into<String>,
        phase: SamplePhase,
        timestamp: Millis,
    ) -> Self {
        Self {
            phase: Some(phase),
            ..Self::new(prompt_id, node_id, EventKind::Sample, timestamp)
        }
    }

    pub fn error(
        prompt_id: impl Into<String>,
        node_id: impl Into<String>,
        message: impl Into<String>,
        timestamp: Millis,
    ) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::new(prompt_id, node_id, EventKind::Error, timestamp)
        }
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn with_vram(mut self, before: u64, after: u64) -> Self {
        self.vram_before = Some(before);
        self.vram_after = Some(after);
        self
    }

    pub fn with_ram(mut self, before: u64, after: u64) -> Self {
        self.ram_before = Some(before);
        self.ram_after = Some(after);
        self
    }

    pub fn with_vram_sample(mut self, bytes: u64) -> Self {
        self.vram_sample = Some(bytes);
        self
    }

    pub fn with_ram_sample(mut self, bytes: u64) -> Self {
        self.ram_sample = Some(bytes);
        self
    }

    pub fn with_input_sizes(mut self, sizes: TensorSizes) -> Self {
        self.input_sizes = Some(sizes);
        self
    }

    pub fn with_output_sizes(mut self, sizes: TensorSizes) -> Self {
        self.output_sizes = Some(sizes);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }
}

/// Result of applying one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The event was applied to an existing in-flight workflow
    Applied,
    /// The event created a new in-flight workflow
    Created,
    /// The event carried a sequence number already seen for its workflow
    Duplicate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let json = r#"{
            "promptId": "p1",
            "nodeId": "n1",
            "nodeType": "KSampler",
            "kind": "start",
            "timestamp": 0,
            "vramBefore": 1000
        }"#;
        let event: NodeEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, EventKind::Start);
        assert_eq!(event.node_type.as_deref(), Some("KSampler"));
        assert_eq!(event.vram_before, Some(1000));
        assert_eq!(event.seq, None);

        let event: NodeEvent = serde_json::from_str(
            r#"{"promptId":"p1","nodeId":"n1","kind":"cacheResolved","timestamp":5,"cacheHit":true}"#,
        )
        .unwrap();
        assert_eq!(event, NodeEvent::cache_resolved("p1", "n1", true, 5));
    }

    #[test]
    fn test_tensor_sizes_on_the_wire() {
        let json = r#"{"promptId":"p1","nodeId":"n1","kind":"end","timestamp":9,
            "outputSizes":{"output_0":[1,4,64,64]}}"#;
        let event: NodeEvent = serde_json::from_str(json).unwrap();
        let sizes = event.output_sizes.unwrap();
        assert_eq!(sizes["output_0"], vec![1, 4, 64, 64]);
        assert!(event.input_sizes.is_none());

        let plain = serde_json::to_value(NodeEvent::end("p1", "n1", 9)).unwrap();
        assert!(plain.get("outputSizes").is_none());
    }

    #[test]
    fn test_negative_bytes_rejected_at_boundary() {
        let json = r#"{"promptId":"p1","nodeId":"n1","kind":"end","timestamp":3,"vramAfter":-5}"#;
        assert!(serde_json::from_str::<NodeEvent>(json).is_err());
    }
}
