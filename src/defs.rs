//! Entity model: index definitions, node definitions, partition plans
//!
//! These are the structured documents stored in the Cfg. Each aggregate
//! carries its own UUID, rebumped on every write, and the implVersion of the
//! writer so that older readers can refuse documents from a newer schema.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Generates a fresh opaque identifier (lowercase hex, no dashes).
pub fn new_uuid() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Index names are cluster-unique and restricted to a conservative
/// character set so they can appear in filesystem paths and URLs: a leading
/// ASCII letter followed by letters, digits, underscores or dashes.
pub fn valid_index_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

// ---------------------------------------------------------------

/// A user's declaration of a logical index over one data source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uuid: String,
    /// Names a registered pindex implementation type.
    #[serde(rename = "type", default)]
    pub index_type: String,
    /// Implementation-specific JSON blob.
    #[serde(default)]
    pub params: String,
    #[serde(rename = "sourceType", default)]
    pub source_type: String,
    #[serde(rename = "sourceName", default)]
    pub source_name: String,
    #[serde(rename = "sourceUUID", default)]
    pub source_uuid: String,
    /// Source-specific JSON blob.
    #[serde(rename = "sourceParams", default)]
    pub source_params: String,
    #[serde(rename = "planParams", default)]
    pub plan_params: PlanParams,
}

/// The aggregate of all index definitions, stored under one Cfg key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefs {
    #[serde(default)]
    pub uuid: String,
    #[serde(rename = "implVersion", default)]
    pub impl_version: String,
    #[serde(rename = "indexDefs", default)]
    pub index_defs: HashMap<String, IndexDef>,
}

impl IndexDefs {
    pub fn new(version: &str) -> Self {
        Self {
            uuid: new_uuid(),
            impl_version: version.to_string(),
            index_defs: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------

/// Plan-shaping knobs carried on each index definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanParams {
    /// Max source partitions per pindex; 0 means all partitions in one.
    #[serde(rename = "maxPartitionsPerPIndex", default)]
    pub max_partitions_per_pindex: usize,
    #[serde(rename = "numReplicas", default)]
    pub num_replicas: usize,
    /// Placement rules over the node container hierarchy, keyed by state
    /// name ("replica").
    #[serde(rename = "hierarchyRules", default, skip_serializing_if = "Option::is_none")]
    pub hierarchy_rules: Option<HashMap<String, Vec<HierarchyRule>>>,
    /// Per-node read/write overrides: nodeUUID (or "" for any node) ->
    /// indexName-or-pindexName -> override.
    #[serde(rename = "nodePlanParams", default, skip_serializing_if = "Option::is_none")]
    pub node_plan_params: Option<HashMap<String, HashMap<String, NodePlanParam>>>,
    #[serde(rename = "pindexWeights", default, skip_serializing_if = "Option::is_none")]
    pub pindex_weights: Option<HashMap<String, i32>>,
    /// A frozen plan is copied through verbatim by the planner.
    #[serde(rename = "planFrozen", default)]
    pub plan_frozen: bool,
}

/// One hierarchy placement rule: consider candidates up to `include_level`
/// ancestors away while excluding those sharing the `exclude_level`
/// ancestor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyRule {
    #[serde(rename = "includeLevel", default)]
    pub include_level: i32,
    #[serde(rename = "excludeLevel", default)]
    pub exclude_level: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePlanParam {
    #[serde(rename = "canRead", default)]
    pub can_read: bool,
    #[serde(rename = "canWrite", default)]
    pub can_write: bool,
}

/// Resolves the read/write override for a node and index/pindex, checking
/// the node's own entry before the any-node ("") entry, and the index name
/// before the pindex name.
pub fn get_node_plan_param<'a>(
    node_plan_params: Option<&'a HashMap<String, HashMap<String, NodePlanParam>>>,
    node_uuid: &str,
    index_name: &str,
    plan_pindex_name: &str,
) -> Option<&'a NodePlanParam> {
    let m = node_plan_params?;
    for node_key in [node_uuid, ""] {
        if let Some(per_node) = m.get(node_key) {
            if let Some(p) = per_node.get(index_name) {
                return Some(p);
            }
            if let Some(p) = per_node.get(plan_pindex_name) {
                return Some(p);
            }
        }
    }
    None
}

// ---------------------------------------------------------------

/// One live node's advertised identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDef {
    #[serde(rename = "hostPort", default)]
    pub host_port: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(rename = "implVersion", default)]
    pub impl_version: String,
    /// Subset of {planner, janitor, pindex, feed, queryer}; empty means the
    /// node takes all roles.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Slash-delimited containment path, e.g. "datacenter/rack".
    #[serde(default)]
    pub container: String,
    #[serde(default)]
    pub weight: i32,
    #[serde(default)]
    pub extras: String,
}

impl NodeDef {
    /// True when the node carries the tag, or carries no tags at all.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.is_empty() || self.tags.iter().any(|t| t.as_str() == tag)
    }
}

/// Node definitions are stored in two parallel keyed maps: known
/// (reachable) and wanted (desired to participate).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDefs {
    #[serde(default)]
    pub uuid: String,
    #[serde(rename = "implVersion", default)]
    pub impl_version: String,
    #[serde(rename = "nodeDefs", default)]
    pub node_defs: HashMap<String, NodeDef>,
}

impl NodeDefs {
    pub fn new(version: &str) -> Self {
        Self {
            uuid: new_uuid(),
            impl_version: version.to_string(),
            node_defs: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------

/// A node's role within one plan partition. Priority 0 is the primary;
/// higher priorities are replica ranks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanPIndexNode {
    #[serde(rename = "canRead", default)]
    pub can_read: bool,
    #[serde(rename = "canWrite", default)]
    pub can_write: bool,
    #[serde(default)]
    pub priority: i32,
}

/// One planned index partition: a chunk of an index's source partitions
/// assigned to one or more nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanPIndex {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(rename = "indexType", default)]
    pub index_type: String,
    #[serde(rename = "indexName", default)]
    pub index_name: String,
    #[serde(rename = "indexUUID", default)]
    pub index_uuid: String,
    #[serde(rename = "indexParams", default)]
    pub index_params: String,
    #[serde(rename = "sourceType", default)]
    pub source_type: String,
    #[serde(rename = "sourceName", default)]
    pub source_name: String,
    #[serde(rename = "sourceUUID", default)]
    pub source_uuid: String,
    #[serde(rename = "sourceParams", default)]
    pub source_params: String,
    /// Comma-joined list of source partition ids.
    #[serde(rename = "sourcePartitions", default)]
    pub source_partitions: String,
    /// Keyed by node UUID.
    #[serde(default)]
    pub nodes: HashMap<String, PlanPIndexNode>,
}

impl PlanPIndex {
    /// The UUID of the node currently holding priority 0, if any.
    pub fn primary_node(&self) -> Option<&str> {
        self.nodes
            .iter()
            .find(|(_, n)| n.priority <= 0)
            .map(|(uuid, _)| uuid.as_str())
    }
}

/// The full partition plan, stored under one Cfg key and replaced wholesale
/// on every plan rewrite.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanPIndexes {
    #[serde(default)]
    pub uuid: String,
    #[serde(rename = "implVersion", default)]
    pub impl_version: String,
    #[serde(rename = "planPIndexes", default)]
    pub plan_pindexes: HashMap<String, PlanPIndex>,
    #[serde(default)]
    pub warnings: HashMap<String, Vec<String>>,
}

impl PlanPIndexes {
    pub fn new(version: &str) -> Self {
        Self {
            uuid: new_uuid(),
            impl_version: version.to_string(),
            plan_pindexes: HashMap::new(),
            warnings: HashMap::new(),
        }
    }
}

/// Compares two plans for equivalence of their partitions and node
/// assignments, ignoring the aggregate UUID/implVersion and each
/// partition's own UUID (concurrent planners generate different UUIDs for
/// identical outcomes).
pub fn same_plan_pindexes(a: Option<&PlanPIndexes>, b: Option<&PlanPIndexes>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            a.plan_pindexes.len() == b.plan_pindexes.len()
                && subset_plan_pindexes(a, b)
                && subset_plan_pindexes(b, a)
        }
        _ => false,
    }
}

/// True when every partition of `a` appears, equivalent, in `b`.
pub fn subset_plan_pindexes(a: &PlanPIndexes, b: &PlanPIndexes) -> bool {
    a.plan_pindexes.iter().all(|(name, av)| {
        b.plan_pindexes
            .get(name)
            .map(|bv| same_plan_pindex(av, bv))
            .unwrap_or(false)
    })
}

/// Partition equivalence: identity fields and node assignments, but not
/// the partition's own UUID.
pub fn same_plan_pindex(a: &PlanPIndex, b: &PlanPIndex) -> bool {
    a.name == b.name
        && a.index_type == b.index_type
        && a.index_name == b.index_name
        && a.index_uuid == b.index_uuid
        && a.index_params == b.index_params
        && a.source_type == b.source_type
        && a.source_name == b.source_name
        && a.source_uuid == b.source_uuid
        && a.source_params == b.source_params
        && a.source_partitions == b.source_partitions
        && a.nodes == b.nodes
}

/// Deep copy of a plan, restamped with the given implVersion.
pub fn copy_plan_pindexes(a: &PlanPIndexes, impl_version: &str) -> PlanPIndexes {
    let mut copy = a.clone();
    copy.impl_version = impl_version.to_string();
    copy
}

// ---------------------------------------------------------------

/// A per-(pindex, source partition, node) progress marker: the partition's
/// UUID at the time of observation and the highest sequence number seen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UuidSeq {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub seq: u64,
}

// ---------------------------------------------------------------

/// Cluster-level manager options, mirrored between the string-keyed options
/// map and this strongly-typed struct stored in the Cfg. Field names must
/// match the option-map keys, modulo casing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterOptions {
    #[serde(rename = "feedAllotment", default)]
    pub feed_allotment: String,
    #[serde(rename = "maxReplicasAllowed", default)]
    pub max_replicas_allowed: String,
    #[serde(rename = "maxConcurrentPartitionMovesPerNode", default)]
    pub max_concurrent_partition_moves_per_node: String,
    #[serde(rename = "enableVerboseLogging", default)]
    pub enable_verbose_logging: String,
    #[serde(rename = "slowOpLogTimeout", default)]
    pub slow_op_log_timeout: String,
}
