//! Planner: index definitions + node membership -> partition plan
//!
//! The planner splits each index definition into pindexes by chunking the
//! source partitions, assigns pindexes to nodes through the balance
//! library, and CAS-writes the resulting plan. It runs on every node
//! tagged "planner"; concurrent planners converge because pindex names are
//! a pure function of their inputs and the Cfg write is CAS-guarded.

use crate::balance::{self, NextMapParams, PartitionMap};
use crate::cfg::{
    cfg_get_index_defs, cfg_get_node_defs, cfg_get_plan_pindexes, cfg_get_version,
    cfg_node_defs_key, cfg_set_plan_pindexes, Cfg, CfgEvent, INDEX_DEFS_KEY, NODE_DEFS_WANTED,
};
use crate::defs::{
    get_node_plan_param, new_uuid, same_plan_pindexes, HierarchyRule, IndexDef, IndexDefs,
    NodeDefs, PlanPIndex, PlanPIndexNode, PlanPIndexes,
};
use crate::feed::{data_source_partitions, SourceSpec};
use crate::manager::{Manager, WorkOp};
use crate::pindex::pindex_impl_type_instantiatable;
use crate::version::{check_version, version_gte};
use crate::{Error, Result};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, LazyLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Decides whether the plan for an index should be recomputed (true) or
/// left untouched (false).
pub type PlannerFilter =
    Arc<dyn Fn(&IndexDef, &PlanPIndexes, &PlanPIndexes) -> bool + Send + Sync>;

/// The in/out information handed to planner hooks. A hook that wants to
/// affect the outcome returns a modified copy; a hook that retains any of
/// these fields must copy them first.
#[derive(Debug, Clone, Default)]
pub struct PlannerHookInfo {
    pub phase: String,
    pub mode: String,
    pub version: String,
    pub server: String,
    pub options: HashMap<String, String>,
    pub index_defs: IndexDefs,
    pub index_def: Option<IndexDef>,
    pub node_defs: NodeDefs,
    pub node_uuids_all: Vec<String>,
    pub node_uuids_to_add: Vec<String>,
    pub node_uuids_to_remove: Vec<String>,
    pub node_weights: HashMap<String, i32>,
    pub node_hierarchy: HashMap<String, String>,
    pub plan_pindexes_prev: PlanPIndexes,
    pub plan_pindexes: PlanPIndexes,
    pub plan_pindexes_for_index: Option<HashMap<String, PlanPIndex>>,
}

/// A planner hook callback: returns the (possibly modified) info and
/// whether to skip the rest of the current phase's work.
pub type PlannerHook =
    Arc<dyn Fn(PlannerHookInfo) -> Result<(PlannerHookInfo, bool)> + Send + Sync>;

static PLANNER_HOOKS: LazyLock<DashMap<String, PlannerHook>> = LazyLock::new(DashMap::new);

/// Registers a planner hook under a name, selectable through the
/// "plannerHookName" manager option. Call during process init only.
pub fn register_planner_hook(name: &str, hook: PlannerHook) {
    PLANNER_HOOKS.insert(name.to_string(), hook);
}

fn planner_hook(name: &str) -> Option<PlannerHook> {
    PLANNER_HOOKS.get(name).map(|e| e.value().clone())
}

// ---------------------------------------------------------------

/// Runs the planner once: read the Cfg, compute a new plan, and CAS-write
/// it when it differs from the previous plan. Returns whether the stored
/// plan changed.
pub async fn plan(
    cfg: &dyn Cfg,
    version: &str,
    uuid: &str,
    server: &str,
    options: &HashMap<String, String>,
    filter: Option<PlannerFilter>,
) -> Result<bool> {
    let (index_defs, node_defs, plan_prev, plan_cas) =
        planner_get_plan(cfg, version, uuid).await?;

    // Use the effective cluster version for the new plan, which may trail
    // this node's own version in a mixed cluster.
    let mut version = version.to_string();
    let effective = cfg_get_version(cfg, &version).await;
    if effective != version {
        info!(version, effective, "planner: using effective cfg version");
        version = effective;
    }

    let plan_pindexes = calc_plan(
        "",
        &index_defs,
        &node_defs,
        &plan_prev,
        &version,
        server,
        options,
        filter,
    )
    .await
    .map_err(|e| Error::Internal(format!("planner: calc_plan, err: {e}")))?;

    if same_plan_pindexes(Some(&plan_pindexes), Some(&plan_prev)) {
        return Ok(false);
    }

    cfg_set_plan_pindexes(cfg, &plan_pindexes, plan_cas)
        .await
        .map_err(|e| {
            Error::Internal(format!(
                "planner: could not save new plan, perhaps a concurrent planner won, err: {e}"
            ))
        })?;

    Ok(true)
}

/// Reads everything the planner needs from the Cfg: index defs, wanted
/// node defs, and the previous plan with its cas.
pub async fn planner_get_plan(
    cfg: &dyn Cfg,
    version: &str,
    uuid: &str,
) -> Result<(IndexDefs, NodeDefs, PlanPIndexes, u64)> {
    planner_check_version(cfg, version).await?;
    let index_defs = planner_get_index_defs(cfg, version).await?;
    let node_defs = planner_get_node_defs(cfg, version, uuid).await?;
    let (plan_prev, cas) = planner_get_plan_pindexes(cfg, version).await?;
    Ok((index_defs, node_defs, plan_prev, cas))
}

/// Errors with VersionTooLow when this node may not modify the Cfg.
pub async fn planner_check_version(cfg: &dyn Cfg, version: &str) -> Result<()> {
    if !check_version(cfg, version).await? {
        return Err(Error::VersionTooLow(version.to_string()));
    }
    Ok(())
}

pub async fn planner_get_index_defs(cfg: &dyn Cfg, version: &str) -> Result<IndexDefs> {
    let index_defs = match cfg_get_index_defs(cfg).await? {
        None => IndexDefs::new(&cfg_get_version(cfg, version).await),
        Some((d, _)) => d,
    };
    if !version_gte(version, &index_defs.impl_version) {
        return Err(Error::MalformedConfig(format!(
            "planner: indexDefs.implVersion: {} > version: {version}",
            index_defs.impl_version
        )));
    }
    Ok(index_defs)
}

/// Reads the wanted node defs. When a node uuid is supplied, also verifies
/// that the node is registered, consistent, and tagged as a planner.
pub async fn planner_get_node_defs(cfg: &dyn Cfg, version: &str, uuid: &str) -> Result<NodeDefs> {
    let node_defs = match cfg_get_node_defs(cfg, NODE_DEFS_WANTED).await? {
        None => NodeDefs::new(&cfg_get_version(cfg, version).await),
        Some((d, _)) => d,
    };
    if !version_gte(version, &node_defs.impl_version) {
        return Err(Error::MalformedConfig(format!(
            "planner: nodeDefs.implVersion: {} > version: {version}",
            node_defs.impl_version
        )));
    }
    if uuid.is_empty() {
        // The caller may not be a node (e.g. a tool), so has no uuid.
        return Ok(node_defs);
    }
    let node_def = node_defs
        .node_defs
        .get(uuid)
        .ok_or_else(|| Error::Internal(format!("planner: no NodeDef, uuid: {uuid}")))?;
    if node_def.impl_version != version {
        return Err(Error::Internal(format!(
            "planner: ended since NodeDef, uuid: {uuid}, implVersion: {} != version: {version}",
            node_def.impl_version
        )));
    }
    if node_def.uuid != uuid {
        return Err(Error::Internal(format!(
            "planner: ended since NodeDef.uuid: {} != uuid: {uuid}",
            node_def.uuid
        )));
    }
    if !node_def.has_tag("planner") {
        return Err(Error::Internal(format!(
            "planner: ended since node, uuid: {uuid}, is not a planner, tags: {:?}",
            node_def.tags
        )));
    }
    Ok(node_defs)
}

pub async fn planner_get_plan_pindexes(
    cfg: &dyn Cfg,
    version: &str,
) -> Result<(PlanPIndexes, u64)> {
    let (plan_prev, cas) = match cfg_get_plan_pindexes(cfg).await? {
        None => (PlanPIndexes::new(&cfg_get_version(cfg, version).await), 0),
        Some((p, cas)) => (p, cas),
    };
    if !version_gte(version, &plan_prev.impl_version) {
        return Err(Error::MalformedConfig(format!(
            "planner: planPIndexes.implVersion: {} > version: {version}",
            plan_prev.impl_version
        )));
    }
    Ok((plan_prev, cas))
}

// ---------------------------------------------------------------

/// Node layout derived from index defs, node defs, and the previous plan:
/// removals are previous-plan nodes that are gone from the node defs, and
/// additions the symmetric difference.
#[derive(Debug, Clone, Default)]
pub struct NodesLayout {
    pub node_uuids_all: Vec<String>,
    pub node_uuids_to_add: Vec<String>,
    pub node_uuids_to_remove: Vec<String>,
    pub node_weights: HashMap<String, i32>,
    pub node_hierarchy: HashMap<String, String>,
}

pub fn calc_nodes_layout(
    _index_defs: &IndexDefs,
    node_defs: &NodeDefs,
    plan_prev: Option<&PlanPIndexes>,
) -> NodesLayout {
    let mut node_uuids = Vec::new();
    let mut node_weights = HashMap::new();
    let mut node_hierarchy = HashMap::new();

    for node_def in node_defs.node_defs.values() {
        // Only nodes that can host pindexes participate in layout.
        if !node_def.has_tag("pindex") {
            continue;
        }
        node_uuids.push(node_def.uuid.clone());

        if node_def.weight > 0 {
            node_weights.insert(node_def.uuid.clone(), node_def.weight);
        }

        let mut child = node_def.uuid.clone();
        for ancestor in node_def.container.split('/').rev() {
            if !child.is_empty() && !ancestor.is_empty() {
                node_hierarchy.insert(child.clone(), ancestor.to_string());
            }
            child = ancestor.to_string();
        }
    }

    let mut node_uuids_prev = Vec::new();
    if let Some(plan_prev) = plan_prev {
        for plan_pindex in plan_prev.plan_pindexes.values() {
            for node_uuid in plan_pindex.nodes.keys() {
                node_uuids_prev.push(node_uuid.clone());
            }
        }
    }
    node_uuids_prev.sort();
    node_uuids_prev.dedup();

    let mut node_uuids_all = node_uuids.clone();
    node_uuids_all.extend(node_uuids_prev.iter().cloned());
    node_uuids_all.sort();
    node_uuids_all.dedup();

    let mut node_uuids_to_add: Vec<String> = node_uuids_all
        .iter()
        .filter(|n| !node_uuids_prev.contains(n))
        .cloned()
        .collect();
    let mut node_uuids_to_remove: Vec<String> = node_uuids_all
        .iter()
        .filter(|n| !node_uuids.contains(n))
        .cloned()
        .collect();
    node_uuids_to_add.sort();
    node_uuids_to_remove.sort();

    NodesLayout {
        node_uuids_all,
        node_uuids_to_add,
        node_uuids_to_remove,
        node_weights,
        node_hierarchy,
    }
}

// ---------------------------------------------------------------

struct CalcPlanState {
    mode: String,
    version: String,
    server: String,
    options: HashMap<String, String>,
    index_defs: IndexDefs,
    node_defs: NodeDefs,
    layout: NodesLayout,
    plan_prev: PlanPIndexes,
    plan: PlanPIndexes,
}

impl CalcPlanState {
    /// Invokes the hook for a phase, writing any returned modifications
    /// back into the planning state, and returns the hook's skip flag plus
    /// the possibly-updated per-index structures.
    fn hook_call(
        &mut self,
        hook: &PlannerHook,
        phase: &str,
        index_def: Option<&IndexDef>,
        for_index: Option<&HashMap<String, PlanPIndex>>,
    ) -> Result<(Option<IndexDef>, Option<HashMap<String, PlanPIndex>>, bool)> {
        let info = PlannerHookInfo {
            phase: phase.to_string(),
            mode: self.mode.clone(),
            version: self.version.clone(),
            server: self.server.clone(),
            options: self.options.clone(),
            index_defs: self.index_defs.clone(),
            index_def: index_def.cloned(),
            node_defs: self.node_defs.clone(),
            node_uuids_all: self.layout.node_uuids_all.clone(),
            node_uuids_to_add: self.layout.node_uuids_to_add.clone(),
            node_uuids_to_remove: self.layout.node_uuids_to_remove.clone(),
            node_weights: self.layout.node_weights.clone(),
            node_hierarchy: self.layout.node_hierarchy.clone(),
            plan_pindexes_prev: self.plan_prev.clone(),
            plan_pindexes: self.plan.clone(),
            plan_pindexes_for_index: for_index.cloned(),
        };

        let (out, skip) = hook(info)?;

        // Hooks may replace any field; always re-read from the returned
        // structure rather than trusting prior locals.
        self.mode = out.mode;
        self.version = out.version;
        self.server = out.server;
        self.options = out.options;
        self.index_defs = out.index_defs;
        self.node_defs = out.node_defs;
        self.layout.node_uuids_all = out.node_uuids_all;
        self.layout.node_uuids_to_add = out.node_uuids_to_add;
        self.layout.node_uuids_to_remove = out.node_uuids_to_remove;
        self.layout.node_weights = out.node_weights;
        self.layout.node_hierarchy = out.node_hierarchy;
        self.plan_prev = out.plan_pindexes_prev;
        self.plan = out.plan_pindexes;

        Ok((out.index_def, out.plan_pindexes_for_index, skip))
    }
}

/// Splits logical indexes into pindexes and assigns pindexes to nodes,
/// invoking any registered planner hook along the way.
#[allow(clippy::too_many_arguments)]
pub async fn calc_plan(
    mode: &str,
    index_defs: &IndexDefs,
    node_defs: &NodeDefs,
    plan_prev: &PlanPIndexes,
    version: &str,
    server: &str,
    options: &HashMap<String, String>,
    filter: Option<PlannerFilter>,
) -> Result<PlanPIndexes> {
    let noop_hook: PlannerHook = Arc::new(|info| Ok((info, false)));
    let hook = options
        .get("plannerHookName")
        .and_then(|name| planner_hook(name))
        .unwrap_or(noop_hook);

    let mut state = CalcPlanState {
        mode: mode.to_string(),
        version: version.to_string(),
        server: server.to_string(),
        options: options.clone(),
        index_defs: index_defs.clone(),
        node_defs: node_defs.clone(),
        layout: NodesLayout::default(),
        plan_prev: plan_prev.clone(),
        plan: PlanPIndexes::new(version),
    };

    let (_, _, skip) = state.hook_call(&hook, "begin", None, None)?;
    if skip {
        return Ok(state.plan);
    }

    state.layout = calc_nodes_layout(&state.index_defs, &state.node_defs, Some(&state.plan_prev));

    let (_, _, skip) = state.hook_call(&hook, "nodes", None, None)?;
    if skip {
        return Ok(state.plan);
    }

    // Examine every index def, ordered by name for stability.
    let mut index_def_names: Vec<String> = state.index_defs.index_defs.keys().cloned().collect();
    index_def_names.sort();

    for index_def_name in index_def_names {
        let Some(index_def) = state.index_defs.index_defs.get(&index_def_name).cloned() else {
            continue;
        };

        let (hooked_def, _, skip) =
            state.hook_call(&hook, "indexDef.begin", Some(&index_def), None)?;
        if skip {
            continue;
        }
        let index_def = hooked_def.unwrap_or(index_def);

        // A frozen plan is carried over verbatim from the previous plan.
        if case_plan_frozen(&index_def, &state.plan_prev, &mut state.plan) {
            continue;
        }

        if let Some(filter) = &filter {
            if !filter(&index_def, &state.plan_prev, &state.plan) {
                continue;
            }
        }

        // Skip index defs with no instantiatable implementation, such as
        // aliases.
        if !pindex_impl_type_instantiatable(&index_def.index_type) {
            continue;
        }

        let mut for_index = match split_index_def_into_plan_pindexes(
            &index_def,
            &state.server,
            &state.options,
        )
        .await
        {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    index = index_def.name,
                    "planner: could not split index def, err: {e}"
                );
                continue; // Keep planning the other index defs.
            }
        };

        let (hooked_def, hooked_for_index, skip) =
            state.hook_call(&hook, "indexDef.split", Some(&index_def), Some(&for_index))?;
        if skip {
            continue;
        }
        let index_def = hooked_def.unwrap_or(index_def);
        if let Some(h) = hooked_for_index {
            for_index = h;
        }

        let warnings = balance_plan_pindexes(
            &state.mode,
            &index_def,
            &mut for_index,
            &state.plan_prev,
            &state.layout,
        );
        for warning in &warnings {
            info!(index = index_def.name, warning, "planner: balance warning");
        }
        state.plan.warnings.insert(index_def.name.clone(), warnings);

        for (name, plan_pindex) in &for_index {
            state.plan.plan_pindexes.insert(name.clone(), plan_pindex.clone());
        }

        state.hook_call(&hook, "indexDef.balanced", Some(&index_def), Some(&for_index))?;
    }

    state.hook_call(&hook, "end", None, None)?;

    Ok(state.plan)
}

// ---------------------------------------------------------------

/// Splits an index def into one or more PlanPIndexes, chunking source
/// partitions by maxPartitionsPerPIndex. If the total is not a clean
/// multiple, the final chunk is smaller; a source with no partitions still
/// yields one empty pindex so queries have a target.
pub async fn split_index_def_into_plan_pindexes(
    index_def: &IndexDef,
    server: &str,
    options: &HashMap<String, String>,
) -> Result<HashMap<String, PlanPIndex>> {
    let max_partitions = index_def.plan_params.max_partitions_per_pindex;

    let spec = SourceSpec {
        source_type: index_def.source_type.clone(),
        source_name: index_def.source_name.clone(),
        source_uuid: index_def.source_uuid.clone(),
        source_params: index_def.source_params.clone(),
        server: server.to_string(),
        options: options.clone(),
    };
    let source_partitions = data_source_partitions(&spec).await.map_err(|e| {
        Error::Internal(format!(
            "planner: could not get partitions, index: {}, server: {server}, err: {e}",
            index_def.name
        ))
    })?;

    let mut for_index = HashMap::new();
    let mut add_plan_pindex = |chunk: &[String]| {
        let source_partitions = chunk.join(",");
        let name = plan_pindex_name(index_def, &source_partitions);
        for_index.insert(
            name.clone(),
            PlanPIndex {
                name,
                uuid: new_uuid(),
                index_type: index_def.index_type.clone(),
                index_name: index_def.name.clone(),
                index_uuid: index_def.uuid.clone(),
                index_params: index_def.params.clone(),
                source_type: index_def.source_type.clone(),
                source_name: index_def.source_name.clone(),
                source_uuid: index_def.source_uuid.clone(),
                source_params: index_def.source_params.clone(),
                source_partitions,
                nodes: HashMap::new(),
            },
        );
    };

    let mut current: Vec<String> = Vec::new();
    let mut added_any = false;
    for source_partition in source_partitions {
        current.push(source_partition);
        if max_partitions > 0 && current.len() >= max_partitions {
            add_plan_pindex(&current);
            added_any = true;
            current.clear();
        }
    }

    // Assign any leftover partitions, or at least one (empty) pindex.
    if !current.is_empty() || !added_any {
        add_plan_pindex(&current);
    }

    Ok(for_index)
}

/// The deterministic cluster-unique name for a pindex. A pure function of
/// the index identity and the source partition set, so concurrent planners
/// produce identical names for identical inputs. The partition list is
/// hashed rather than embedded because pindex names become filesystem
/// paths.
pub fn plan_pindex_name(index_def: &IndexDef, source_partitions: &str) -> String {
    let crc = crc32fast::hash(source_partitions.as_bytes());
    format!("{}_{}_{:08x}", index_def.name, index_def.uuid, crc)
}

// ---------------------------------------------------------------

/// Assigns an index's pindexes onto nodes through the balance library and
/// writes the node maps into `for_index`. Returns balance warnings.
pub fn balance_plan_pindexes(
    mode: &str,
    index_def: &IndexDef,
    for_index: &mut HashMap<String, PlanPIndex>,
    plan_prev: &PlanPIndexes,
    layout: &NodesLayout,
) -> Vec<String> {
    let model = balance::primary_replica_model(index_def.plan_params.num_replicas);

    let prev_map = partition_map_from_plan(for_index, Some(plan_prev));

    let mut stickiness = None;
    if mode == "failover" {
        let mut m = HashMap::new();
        m.insert("primary".to_string(), 100_000);
        stickiness = Some(m);
    }

    // Rotate the node list by a hash of the index name so distinct indexes
    // start at distinct nodes, deterministically.
    let rotated = rotate_nodes_for_index(&layout.node_uuids_all, &index_def.name);

    // With a hierarchy present and no explicit rules, assume replicas
    // prefer a different group at level one (e.g. another rack within the
    // same datacenter).
    let default_rules;
    let hierarchy_rules = match &index_def.plan_params.hierarchy_rules {
        Some(rules) => Some(rules),
        None if !layout.node_hierarchy.is_empty() => {
            let mut rules = HashMap::new();
            rules.insert(
                "replica".to_string(),
                vec![HierarchyRule {
                    include_level: 2,
                    exclude_level: 1,
                }],
            );
            default_rules = rules;
            Some(&default_rules)
        }
        None => None,
    };

    let (next_map, warnings) = balance::plan_next_map(NextMapParams {
        prev_map: &prev_map,
        nodes_all: &rotated,
        nodes_to_remove: &layout.node_uuids_to_remove,
        nodes_to_add: &layout.node_uuids_to_add,
        model: &model,
        partition_weights: index_def.plan_params.pindex_weights.as_ref(),
        state_stickiness: stickiness.as_ref(),
        node_weights: &layout.node_weights,
        node_hierarchy: &layout.node_hierarchy,
        hierarchy_rules,
    });

    for (plan_pindex_name, partition) in next_map {
        let Some(plan_pindex) = for_index.get_mut(&plan_pindex_name) else {
            continue;
        };
        plan_pindex.nodes = HashMap::new();

        let read_write = |node_uuid: &str| {
            get_node_plan_param(
                index_def.plan_params.node_plan_params.as_ref(),
                node_uuid,
                &index_def.name,
                &plan_pindex_name,
            )
            .map(|p| (p.can_read, p.can_write))
            .unwrap_or((true, true))
        };

        if let Some(primaries) = partition.nodes_by_state.get("primary") {
            for node_uuid in primaries.iter().take(1) {
                let (can_read, can_write) = read_write(node_uuid);
                plan_pindex.nodes.insert(
                    node_uuid.clone(),
                    PlanPIndexNode {
                        can_read,
                        can_write,
                        priority: 0,
                    },
                );
            }
        }

        if let Some(replicas) = partition.nodes_by_state.get("replica") {
            for (i, node_uuid) in replicas
                .iter()
                .take(index_def.plan_params.num_replicas)
                .enumerate()
            {
                let (can_read, can_write) = read_write(node_uuid);
                plan_pindex.nodes.insert(
                    node_uuid.clone(),
                    PlanPIndexNode {
                        can_read,
                        can_write,
                        priority: i as i32 + 1,
                    },
                );
            }
        }
    }

    warnings
}

/// Rotates a sorted node list by the insertion point of the hex CRC32 of
/// the index name, so layouts favor different starting nodes per index
/// while staying repeatable.
pub fn rotate_nodes_for_index(node_uuids_all: &[String], index_name: &str) -> Vec<String> {
    if node_uuids_all.is_empty() {
        return Vec::new();
    }
    let h = format!("{:08x}", crc32fast::hash(index_name.as_bytes()));
    let next = node_uuids_all.partition_point(|n| n.as_str() < h.as_str());
    let mut rotated = Vec::with_capacity(node_uuids_all.len());
    for i in 0..node_uuids_all.len() {
        rotated.push(node_uuids_all[(next + i) % node_uuids_all.len()].clone());
    }
    rotated
}

/// Reconstructs a balance partition map for an index's pindexes from an
/// existing plan. A pindex with no entry under its own name falls back to
/// the previous plan entry with the same index and source partitions
/// (renames after index-definition updates), feeding the balancer the
/// existing layout without affecting the new plan.
pub fn partition_map_from_plan(
    for_index: &HashMap<String, PlanPIndex>,
    plan: Option<&PlanPIndexes>,
) -> PartitionMap {
    let mut m = PartitionMap::new();

    for plan_pindex in for_index.values() {
        let mut partition = balance::Partition {
            name: plan_pindex.name.clone(),
            nodes_by_state: HashMap::new(),
        };

        if let Some(plan) = plan {
            let prev = plan.plan_pindexes.get(&plan_pindex.name).or_else(|| {
                plan.plan_pindexes.values().find(|p| {
                    p.index_name == plan_pindex.index_name
                        && p.source_partitions == plan_pindex.source_partitions
                })
            });

            if let Some(prev) = prev {
                // Sort by priority for stability.
                let mut refs: Vec<(&String, &PlanPIndexNode)> = prev.nodes.iter().collect();
                refs.sort_by(|a, b| (a.1.priority, a.0).cmp(&(b.1.priority, b.0)));

                for (node_uuid, node) in refs {
                    let state = if node.priority <= 0 { "primary" } else { "replica" };
                    partition
                        .nodes_by_state
                        .entry(state.to_string())
                        .or_default()
                        .push(node_uuid.clone());
                }
            }
        }

        m.insert(plan_pindex.name.clone(), partition);
    }

    m
}

// ---------------------------------------------------------------

fn same_index_defs_except_uuid(def1: &IndexDef, def2: &IndexDef) -> bool {
    def1.index_type == def2.index_type
        && def1.name == def2.name
        && def1.params == def2.params
        && def1.source_name == def2.source_name
        && def1.source_type == def2.source_type
        && def1.source_uuid == def2.source_uuid
        && def1.source_params == def2.source_params
}

fn index_def_from_plan_pindex(p: &PlanPIndex) -> IndexDef {
    IndexDef {
        name: p.index_name.clone(),
        uuid: p.index_uuid.clone(),
        index_type: p.index_type.clone(),
        params: p.index_params.clone(),
        source_type: p.source_type.clone(),
        source_name: p.source_name.clone(),
        source_uuid: p.source_uuid.clone(),
        source_params: p.source_params.clone(),
        plan_params: Default::default(),
    }
}

/// When an index's plan is frozen, copies its previous plan entries into
/// the new plan and returns true. A PlanFrozen flip bumps the index
/// definition UUID, so matching falls back to identity-except-UUID.
pub fn case_plan_frozen(
    index_def: &IndexDef,
    beg_plan: &PlanPIndexes,
    end_plan: &mut PlanPIndexes,
) -> bool {
    if !index_def.plan_params.plan_frozen {
        return false;
    }

    for (name, p) in &beg_plan.plan_pindexes {
        if p.index_name == index_def.name
            && (p.index_uuid == index_def.uuid
                || same_index_defs_except_uuid(index_def, &index_def_from_plan_pindex(p)))
        {
            end_plan.plan_pindexes.insert(name.clone(), p.clone());
        }
    }

    true
}

// ---------------------------------------------------------------
// The per-node planner loop.

impl Manager {
    /// Sends a synchronous no-op through the planner queue; returns once
    /// the planner has drained everything ahead of it. Used by tests and
    /// callers that need to observe planner progress.
    pub async fn planner_noop(&self, msg: &str) {
        self.stats.tot_planner_noop.fetch_add(1, Ordering::Relaxed);
        if self.has_tag("planner") {
            self.sync_planner_work(WorkOp::Noop, msg).await;
        }
    }

    /// Synchronously kicks the planner, waiting for the resulting planning
    /// pass to finish.
    pub async fn planner_kick(&self, msg: &str) {
        self.stats.tot_planner_kick.fetch_add(1, Ordering::Relaxed);
        if self.has_tag("planner") {
            self.sync_planner_work(WorkOp::Kick, msg).await;
        }
    }

    /// The planner's main loop: subscribe to index-def and wanted-node-def
    /// changes and run a planning pass per kick, one at a time.
    pub(crate) async fn planner_loop(
        self: Arc<Self>,
        mut work_rx: mpsc::Receiver<crate::manager::WorkReq>,
    ) {
        if let Some(cfg) = self.cfg() {
            let (event_tx, mut event_rx) = mpsc::channel::<CfgEvent>(16);
            let _ = cfg.subscribe(INDEX_DEFS_KEY, event_tx.clone());
            let _ = cfg.subscribe(&cfg_node_defs_key(NODE_DEFS_WANTED), event_tx);

            let mgr = self.clone();
            let stop = self.stop.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        event = event_rx.recv() => {
                            let Some(event) = event else { return };
                            mgr.stats
                                .tot_planner_subscription_event
                                .fetch_add(1, Ordering::Relaxed);
                            mgr.planner_kick(&format!("cfg changed, key: {}", event.key)).await;
                        }
                    }
                }
            });
        }

        loop {
            let req = tokio::select! {
                _ = self.stop.cancelled() => {
                    self.stats.tot_planner_stop.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                req = work_rx.recv() => match req {
                    Some(req) => req,
                    None => return,
                },
            };

            self.stats.tot_planner_op_start.fetch_add(1, Ordering::Relaxed);
            debug!(msg = req.msg, "planner: awakes");

            let result = match req.op {
                WorkOp::Kick => {
                    match self.planner_once(&req.msg).await {
                        Err(e) => {
                            warn!("planner: planner_once, err: {e}");
                            self.stats.tot_planner_kick_err.fetch_add(1, Ordering::Relaxed);
                            // Keep looping; perhaps a transient issue.
                            Ok(())
                        }
                        Ok(changed) => {
                            if changed {
                                self.stats
                                    .tot_planner_kick_changed
                                    .fetch_add(1, Ordering::Relaxed);
                                self.janitor_kick_async("the plans have changed");
                            }
                            self.stats.tot_planner_kick_ok.fetch_add(1, Ordering::Relaxed);
                            Ok(())
                        }
                    }
                }
                WorkOp::Noop => {
                    self.stats.tot_planner_noop_ok.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                _ => Err(Error::Internal("planner: unknown op".to_string())),
            };

            if let Some(reply) = req.reply {
                let _ = reply.send(result);
            }
            self.stats.tot_planner_op_done.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// One planning pass against this manager's Cfg.
    pub async fn planner_once(&self, reason: &str) -> Result<bool> {
        debug!(reason, "planner: once");
        let cfg = self
            .cfg()
            .ok_or_else(|| Error::Internal("planner: skipped due to nil cfg".to_string()))?;
        plan(
            cfg.as_ref(),
            self.version(),
            self.uuid(),
            self.server(),
            &self.options_map(),
            None,
        )
        .await
    }
}
