use std::collections::{BTreeMap, HashMap};
use std::fmt;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::types::{Millis, TensorSizes};

/// One execution of one graph node within one workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeProfile {
    /// Unique within one workflow run
    pub node_id: String,

    /// Category key used for averaging
    pub node_type: String,

    pub start_time: Millis,

    /// Absent while the node is in flight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<Millis>,

    #[serde(default)]
    pub vram_before: u64,
    #[serde(default)]
    pub vram_after: u64,
    #[serde(default)]
    pub ram_before: u64,
    #[serde(default)]
    pub ram_after: u64,

    /// Highest VRAM sample observed while the node was running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vram_peak: Option<u64>,

    /// Highest RAM sample observed while the node was running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_peak: Option<u64>,

    /// Set exactly once, when the cache lookup resolves
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_hit: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_sizes: TensorSizes,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_sizes: TensorSizes,
}

impl NodeProfile {
    /// Create an open profile
    pub fn open(node_id: impl Into<String>, node_type: impl Into<String>, start_time: Millis) -> Self {
        Self {
            node_id: node_id.into(),
            node_type: node_type.into(),
            start_time,
            end_time: None,
            vram_before: 0,
            vram_after: 0,
            ram_before: 0,
            ram_after: 0,
            vram_peak: None,
            ram_peak: None,
            cache_hit: None,
            error: None,
            input_sizes: TensorSizes::new(),
            output_sizes: TensorSizes::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }

    /// Execution time in milliseconds, once closed
    pub fn duration(&self) -> Option<Millis> {
        self.end_time.map(|end| end.saturating_sub(self.start_time))
    }

    pub fn vram_delta(&self) -> i64 {
        self.vram_after as i64 - self.vram_before as i64
    }

    pub fn ram_delta(&self) -> i64 {
        self.ram_after as i64 - self.ram_before as i64
    }
}

/// Node profiles keyed by node id, iterated in insertion order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeProfiles {
    entries: Vec<NodeProfile>,
    index: HashMap<String, usize>,
}

impl NodeProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.index.contains_key(node_id)
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeProfile> {
        self.index.get(node_id).map(|&idx| &self.entries[idx])
    }

    pub(crate) fn get_mut(&mut self, node_id: &str) -> Option<&mut NodeProfile> {
        match self.index.get(node_id) {
            Some(&idx) => self.entries.get_mut(idx),
            None => None,
        }
    }

    /// Insert a profile; returns `false` and leaves the map unchanged if the id is taken
    pub(crate) fn insert(&mut self, profile: NodeProfile) -> bool {
        if self.index.contains_key(&profile.node_id) {
            return false;
        }
        self.index.insert(profile.node_id.clone(), self.entries.len());
        self.entries.push(profile);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeProfile> {
        self.entries.iter()
    }
}

impl Serialize for NodeProfiles {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for profile in &self.entries {
            map.serialize_entry(&profile.node_id, profile)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for NodeProfiles {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct NodeProfilesVisitor;

        impl<'de> Visitor<'de> for NodeProfilesVisitor {
            type Value = NodeProfiles;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of node id to node profile")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut nodes = NodeProfiles::new();
                while let Some((node_id, mut profile)) = access.next_entry::<String, NodeProfile>()? {
                    if profile.node_id != node_id {
                        profile.node_id = node_id;
                    }
                    nodes.insert(profile);
                }
                Ok(nodes)
            }
        }

        deserializer.deserialize_map(NodeProfilesVisitor)
    }
}

/// One end-to-end execution of the whole graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowProfile {
    pub prompt_id: String,
    pub start_time: Millis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<Millis>,
    #[serde(default)]
    pub nodes: NodeProfiles,
    /// One entry per node start, append-only
    #[serde(default)]
    pub execution_order: Vec<String>,
    #[serde(default)]
    pub total_vram_peak: u64,
    #[serde(default)]
    pub total_ram_peak: u64,
    #[serde(default)]
    pub cache_hits: u64,
    #[serde(default)]
    pub cache_misses: u64,
    #[serde(skip)]
    pub(crate) last_seq: Option<u64>,
}

impl WorkflowProfile {
    pub fn new(prompt_id: impl Into<String>, start_time: Millis) -> Self {
        Self {
            prompt_id: prompt_id.into(),
            start_time,
            end_time: None,
            nodes: NodeProfiles::new(),
            execution_order: Vec::new(),
            total_vram_peak: 0,
            total_ram_peak: 0,
            cache_hits: 0,
            cache_misses: 0,
            last_seq: None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.end_time.is_some()
    }

    /// Wall time of the whole run in milliseconds, once finalized
    pub fn duration(&self) -> Option<Millis> {
        self.end_time.map(|end| end.saturating_sub(self.start_time))
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeProfile> {
        self.nodes.get(node_id)
    }

    /// Nodes in execution order
    pub fn ordered_nodes(&self) -> impl Iterator<Item = &NodeProfile> {
        self.execution_order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn resolved_nodes(&self) -> usize {
        self.nodes.iter().filter(|node| node.cache_hit.is_some()).count()
    }

    pub(crate) fn observe_after(&mut self, vram_after: u64, ram_after: u64) {
        self.total_vram_peak = self.total_vram_peak.max(vram_after);
        self.total_ram_peak = self.total_ram_peak.max(ram_after);
    }
}

/// Derived per-node-type averages
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeAverages {
    pub avg_time: f64,
    pub avg_vram: f64,
    pub avg_ram: f64,
    pub count: u64,
    pub cache_hit_ratio: f64,
}

/// Derived workflow-level averages
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkflowAverages {
    pub avg_time: f64,
    pub avg_vram_peak: f64,
    pub avg_ram_peak: f64,
    pub count: u64,
}

/// Counts of ingest events by outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IngestStats {
    pub applied: u64,
    pub duplicates: u64,
    pub dangling_nodes: u64,
    pub unknown_workflows: u64,
    pub illegal_states: u64,
    pub rejected: u64,
}

impl IngestStats {
    pub fn dropped(&self) -> u64 {
        self.dangling_nodes + self.unknown_workflows + self.illegal_states + self.rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_profiles_keep_insertion_order() {
        let mut nodes = NodeProfiles::new();
        assert!(nodes.insert(NodeProfile::open("9", "VAEDecode", 10)));
        assert!(nodes.insert(NodeProfile::open("3", "KSampler", 20)));
        assert!(nodes.insert(NodeProfile::open("12", "SaveImage", 30)));
        assert!(!nodes.insert(NodeProfile::open("3", "KSampler", 40)));

        let ids: Vec<_> = nodes.iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(ids, vec!["9", "3", "12"]);
        assert_eq!(nodes.get("3").unwrap().start_time, 20);

        let json = serde_json::to_string(&nodes).unwrap();
        assert!(json.find("\"9\"").unwrap() < json.find("\"3\"").unwrap());
        assert!(json.find("\"3\"").unwrap() < json.find("\"12\"").unwrap());

        let parsed: NodeProfiles = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, nodes);
    }

    #[test]
    fn test_node_profile_deltas() {
        let mut node = NodeProfile::open("1", "VAEDecode", 100);
        assert!(node.is_open());
        assert_eq!(node.duration(), None);

        node.end_time = Some(250);
        node.vram_before = 4096;
        node.vram_after = 1024;
        node.ram_before = 10;
        node.ram_after = 30;
        assert_eq!(node.duration(), Some(150));
        assert_eq!(node.vram_delta(), -3072);
        assert_eq!(node.ram_delta(), 20);
    }

    #[test]
    fn test_workflow_profile_wire_names() {
        let mut profile = WorkflowProfile::new("p1", 0);
        profile.nodes.insert(NodeProfile::open("n1", "KSampler", 0));
        profile.execution_order.push("n1".to_string());
        profile.end_time = Some(100);

        let value = serde_json::to_value(&profile).unwrap();
        assert_eq!(value["promptId"], "p1");
        assert_eq!(value["executionOrder"][0], "n1");
        assert_eq!(value["nodes"]["n1"]["nodeType"], "KSampler");
        assert!(value.get("lastSeq").is_none());
    }

    #[test]
    fn test_node_record_with_tensor_sizes() {
        let json = r#"{
            "nodeId": "7",
            "nodeType": "VAEDecode",
            "startTime": 10,
            "endTime": 30,
            "vramBefore": 100,
            "vramAfter": 300,
            "inputSizes": {"output_0": [1, 4, 64, 64]},
            "outputSizes": {},
            "cacheHit": false
        }"#;
        let node: NodeProfile = serde_json::from_str(json).unwrap();
        assert_eq!(node.input_sizes["output_0"], vec![1, 4, 64, 64]);
        assert!(node.output_sizes.is_empty());

        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["inputSizes"]["output_0"][3], 64);
        assert!(value.get("outputSizes").is_none());
    }

    #[test]
    fn test_ingest_stats_dropped() {
        let stats = IngestStats {
            applied: 10,
            duplicates: 2,
            dangling_nodes: 1,
            unknown_workflows: 1,
            illegal_states: 3,
            rejected: 1,
        };
        assert_eq!(stats.dropped(), 6);
    }
}
