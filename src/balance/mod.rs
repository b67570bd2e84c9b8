//! Partition assignment library
//!
//! The planner and rebalancer treat partition balancing as a library with
//! documented inputs and outputs: a partition model (states, priorities,
//! constraint counts), a partition map (partition -> state -> ordered node
//! list), and two operations: computing the next map for a changed node
//! set, and computing the per-partition move sequence between two maps. The
//! orchestrator in the submodule drives those moves against a live cluster.
//!
//! The assignment algorithm here is deliberately self-contained and
//! deterministic; it can be swapped for a more sophisticated one without
//! touching the planner or rebalancer.

pub mod orchestrator;

pub use orchestrator::{
    lowest_weight_partition_move_for_node, orchestrate_moves, AssignPartitionsFunc, NextMoves,
    Orchestrator, OrchestratorOptions, OrchestratorProgress, PartitionMoveSelector, PendingMove,
};

use crate::defs::HierarchyRule;
use std::collections::{HashMap, HashSet};

/// One state of the partition model ("primary", "replica"), with its
/// priority (lower is more important) and how many nodes it wants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionModelState {
    pub priority: i32,
    pub constraints: usize,
}

/// The full model, keyed by state name.
pub type PartitionModel = HashMap<String, PartitionModelState>;

/// One partition's node assignments, keyed by state name; node lists are
/// ordered (replica rank order).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    pub nodes_by_state: HashMap<String, Vec<String>>,
}

/// A map of every partition's assignments, keyed by partition name.
pub type PartitionMap = HashMap<String, Partition>;

/// One `(node, state, op)` transition for a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStateOp {
    pub node: String,
    pub state: String,
    pub op: String,
}

/// Inputs to `plan_next_map`.
pub struct NextMapParams<'a> {
    /// The previous assignments; its partition set defines the output's.
    pub prev_map: &'a PartitionMap,
    /// Every candidate node, in rotation order (ties in load break toward
    /// earlier entries, so callers rotate this per index).
    pub nodes_all: &'a [String],
    pub nodes_to_remove: &'a [String],
    pub nodes_to_add: &'a [String],
    pub model: &'a PartitionModel,
    /// Per-partition load weights; unlisted partitions weigh 1.
    pub partition_weights: Option<&'a HashMap<String, i32>>,
    /// Per-state stickiness; a high value pins survivors of that state in
    /// place rather than reshuffling them.
    pub state_stickiness: Option<&'a HashMap<String, i32>>,
    /// Per-node capacity weights; heavier nodes absorb more partitions.
    pub node_weights: &'a HashMap<String, i32>,
    /// child -> parent containment edges (nodeUUID -> rack -> datacenter).
    pub node_hierarchy: &'a HashMap<String, String>,
    /// Placement rules keyed by state name.
    pub hierarchy_rules: Option<&'a HashMap<String, Vec<HierarchyRule>>>,
}

/// Walks `level` steps up the containment hierarchy from a node.
fn ancestor<'h>(
    node: &'h str,
    level: i32,
    hierarchy: &'h HashMap<String, String>,
) -> Option<&'h str> {
    let mut current = node;
    for _ in 0..level {
        current = hierarchy.get(current)?;
    }
    Some(current)
}

/// Computes the next partition map for a changed node set.
///
/// Surviving assignments are preserved in place; deficits are filled from
/// the least-loaded eligible nodes, with hierarchy rules steering replicas
/// away from nodes that share an excluded ancestor with already-assigned
/// nodes. Emits a warning per constraint it cannot satisfy. Deterministic
/// for identical inputs.
pub fn plan_next_map(params: NextMapParams<'_>) -> (PartitionMap, Vec<String>) {
    let removed: HashSet<&str> = params.nodes_to_remove.iter().map(String::as_str).collect();
    let eligible: Vec<&str> = params
        .nodes_all
        .iter()
        .map(String::as_str)
        .filter(|n| !removed.contains(n))
        .collect();

    let mut warnings = Vec::new();
    let mut next: PartitionMap = HashMap::new();

    // Order states by model priority, then partitions by name, for a stable
    // outcome regardless of map iteration order.
    let mut states: Vec<(&String, &PartitionModelState)> = params.model.iter().collect();
    states.sort_by(|a, b| (a.1.priority, a.0).cmp(&(b.1.priority, b.0)));

    let mut partition_names: Vec<&String> = params.prev_map.keys().collect();
    partition_names.sort();

    let weight_of = |partition: &str| -> f64 {
        params
            .partition_weights
            .and_then(|w| w.get(partition))
            .copied()
            .unwrap_or(1)
            .max(1) as f64
    };

    // Current load per node, from assignments that survive the node-set
    // change.
    let mut load: HashMap<&str, f64> = eligible.iter().map(|n| (*n, 0.0)).collect();
    for name in &partition_names {
        let prev = &params.prev_map[name.as_str()];
        for nodes in prev.nodes_by_state.values() {
            for node in nodes {
                if let Some(l) = load.get_mut(node.as_str()) {
                    *l += weight_of(name);
                }
            }
        }
    }

    let order_of: HashMap<&str, usize> = eligible.iter().enumerate().map(|(i, n)| (*n, i)).collect();

    for name in &partition_names {
        let prev = &params.prev_map[name.as_str()];
        let mut assigned: HashSet<String> = HashSet::new();
        let mut out = Partition {
            name: (*name).clone(),
            nodes_by_state: HashMap::new(),
        };

        // Promotion pool: survivors of lower-priority states become
        // candidates when a higher-priority state loses its nodes.
        let mut promotable: Vec<String> = Vec::new();
        for (state_name, _) in states.iter().rev() {
            if let Some(nodes) = prev.nodes_by_state.get(*state_name) {
                for n in nodes {
                    if !removed.contains(n.as_str()) {
                        promotable.push(n.clone());
                    }
                }
            }
        }

        for (state_name, state) in &states {
            let survivors: Vec<String> = prev
                .nodes_by_state
                .get(*state_name)
                .map(|nodes| {
                    nodes
                        .iter()
                        .filter(|n| !removed.contains(n.as_str()) && !assigned.contains(*n))
                        .take(state.constraints)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();

            let mut chosen = survivors;
            for n in &chosen {
                assigned.insert(n.clone());
            }

            let rules = params
                .hierarchy_rules
                .and_then(|r| r.get(*state_name))
                .map(Vec::as_slice)
                .unwrap_or(&[]);

            while chosen.len() < state.constraints {
                // Prefer promoting a surviving lower-priority holder; it
                // already has the data.
                let promoted = promotable
                    .iter()
                    .position(|n| !assigned.contains(n))
                    .map(|i| promotable.remove(i));
                if let Some(node) = promoted {
                    assigned.insert(node.clone());
                    chosen.push(node);
                    continue;
                }

                let picked = pick_node(
                    &eligible,
                    &assigned,
                    &load,
                    params.node_weights,
                    &order_of,
                    rules,
                    params.node_hierarchy,
                );
                match picked {
                    Some((node, hierarchy_ok)) => {
                        if !hierarchy_ok {
                            warnings.push(format!(
                                "partition {}: state {} assignment to node {} violates hierarchy rules",
                                name, state_name, node
                            ));
                        }
                        *load.entry(node).or_insert(0.0) += weight_of(name);
                        assigned.insert(node.to_string());
                        chosen.push(node.to_string());
                    }
                    None => {
                        warnings.push(format!(
                            "partition {}: could not assign {} of {} nodes for state {}",
                            name,
                            state.constraints - chosen.len(),
                            state.constraints,
                            state_name
                        ));
                        break;
                    }
                }
            }

            // Stickiness is already the default behavior (survivors keep
            // their seats); the knob exists for callers that rely on it.
            let _ = params.state_stickiness;

            out.nodes_by_state.insert((*state_name).clone(), chosen);
        }

        next.insert((*name).clone(), out);
    }

    (next, warnings)
}

/// Picks the least-loaded eligible node not yet assigned to the partition.
/// Returns the node and whether it satisfied the hierarchy rules; when no
/// rule-satisfying node exists, falls back to ignoring the rules.
fn pick_node<'e>(
    eligible: &[&'e str],
    assigned: &HashSet<String>,
    load: &HashMap<&str, f64>,
    node_weights: &HashMap<String, i32>,
    order_of: &HashMap<&str, usize>,
    rules: &[HierarchyRule],
    hierarchy: &HashMap<String, String>,
) -> Option<(&'e str, bool)> {
    let excluded_ancestors: Vec<HashSet<&str>> = rules
        .iter()
        .map(|rule| {
            assigned
                .iter()
                .filter_map(|n| ancestor(n, rule.exclude_level, hierarchy))
                .collect()
        })
        .collect();

    let satisfies_rules = |node: &str| -> bool {
        rules.iter().zip(&excluded_ancestors).all(|(rule, taken)| {
            match ancestor(node, rule.exclude_level, hierarchy) {
                Some(a) => !taken.contains(a),
                None => true,
            }
        })
    };

    let score = |node: &str| -> (u64, usize) {
        let weight = node_weights.get(node).copied().unwrap_or(1).max(1) as f64;
        let l = load.get(node).copied().unwrap_or(0.0) / weight;
        // Scale to a totally ordered integer key; ties break on rotation
        // order.
        ((l * 1_000_000.0) as u64, order_of[node])
    };

    let candidates = |require_rules: bool| {
        eligible
            .iter()
            .copied()
            .filter(|n| !assigned.contains(*n))
            .filter(|n| !require_rules || satisfies_rules(n))
            .min_by_key(|n| score(n))
    };

    if let Some(node) = candidates(true) {
        return Some((node, true));
    }
    candidates(false).map(|node| (node, false))
}

// ---------------------------------------------------------------

/// Finds the state a node holds for a partition, preferring
/// higher-priority states when a node somehow appears in more than one.
fn state_of(partition: &Partition, node: &str, states: &[(&String, &PartitionModelState)]) -> Option<String> {
    for (state_name, _) in states {
        if let Some(nodes) = partition.nodes_by_state.get(*state_name) {
            if nodes.iter().any(|n| n.as_str() == node) {
                return Some((*state_name).clone());
            }
        }
    }
    None
}

/// Computes, per partition, the ordered `(node, state, op)` transitions
/// that turn `beg_map` into `end_map`.
///
/// Default ordering favors availability: promotions and additions land
/// before demotions and deletions, so a new primary is in place before the
/// former one is torn down. With `favor_min_nodes` the order flips,
/// freeing capacity first.
pub fn calc_partition_moves(
    model: &PartitionModel,
    beg_map: &PartitionMap,
    end_map: &PartitionMap,
    favor_min_nodes: bool,
) -> HashMap<String, Vec<NodeStateOp>> {
    let mut states: Vec<(&String, &PartitionModelState)> = model.iter().collect();
    states.sort_by(|a, b| (a.1.priority, a.0).cmp(&(b.1.priority, b.0)));
    let priority_of: HashMap<&str, i32> =
        states.iter().map(|(n, s)| (n.as_str(), s.priority)).collect();

    let mut out = HashMap::new();

    let empty = Partition::default();
    let mut partition_names: Vec<&String> = end_map.keys().collect();
    partition_names.sort();

    for name in partition_names {
        let beg = beg_map.get(name.as_str()).unwrap_or(&empty);
        let end = &end_map[name.as_str()];

        let mut nodes: Vec<&str> = Vec::new();
        for p in [beg, end] {
            for ns in p.nodes_by_state.values() {
                for n in ns {
                    if !nodes.contains(&n.as_str()) {
                        nodes.push(n);
                    }
                }
            }
        }
        nodes.sort_unstable();

        let mut promotes = Vec::new();
        let mut adds = Vec::new();
        let mut demotes = Vec::new();
        let mut dels = Vec::new();

        for node in nodes {
            let beg_state = state_of(beg, node, &states);
            let end_state = state_of(end, node, &states);
            match (beg_state, end_state) {
                (None, Some(s)) => adds.push(NodeStateOp {
                    node: node.to_string(),
                    state: s,
                    op: "add".to_string(),
                }),
                (Some(_), None) => dels.push(NodeStateOp {
                    node: node.to_string(),
                    state: String::new(),
                    op: "del".to_string(),
                }),
                (Some(b), Some(e)) if b != e => {
                    let (bp, ep) = (priority_of[b.as_str()], priority_of[e.as_str()]);
                    if ep < bp {
                        promotes.push(NodeStateOp {
                            node: node.to_string(),
                            state: e,
                            op: "promote".to_string(),
                        });
                    } else {
                        demotes.push(NodeStateOp {
                            node: node.to_string(),
                            state: e,
                            op: "demote".to_string(),
                        });
                    }
                }
                _ => {}
            }
        }

        // Primary adds ahead of replica adds.
        adds.sort_by_key(|m| priority_of.get(m.state.as_str()).copied().unwrap_or(i32::MAX));

        let mut moves = Vec::new();
        if favor_min_nodes {
            moves.extend(dels);
            moves.extend(demotes);
            moves.extend(promotes);
            moves.extend(adds);
        } else {
            moves.extend(promotes);
            moves.extend(adds);
            moves.extend(demotes);
            moves.extend(dels);
        }

        if !moves.is_empty() {
            out.insert(name.clone(), moves);
        }
    }

    out
}

/// The standard two-state model: one primary, `num_replicas` replicas.
pub fn primary_replica_model(num_replicas: usize) -> PartitionModel {
    let mut model = PartitionModel::new();
    model.insert(
        "primary".to_string(),
        PartitionModelState {
            priority: 0,
            constraints: 1,
        },
    );
    model.insert(
        "replica".to_string(),
        PartitionModelState {
            priority: 1,
            constraints: num_replicas,
        },
    );
    model
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn partition(name: &str, primary: &[&str], replica: &[&str]) -> Partition {
        let mut nodes_by_state = HashMap::new();
        nodes_by_state.insert("primary".to_string(), strings(primary));
        nodes_by_state.insert("replica".to_string(), strings(replica));
        Partition {
            name: name.to_string(),
            nodes_by_state,
        }
    }

    #[test]
    fn fills_empty_map_deterministically() {
        let model = primary_replica_model(1);
        let mut prev = PartitionMap::new();
        prev.insert("p0".to_string(), partition("p0", &[], &[]));
        prev.insert("p1".to_string(), partition("p1", &[], &[]));

        let nodes = strings(&["a", "b"]);
        let weights = HashMap::new();
        let hierarchy = HashMap::new();

        let run = || {
            plan_next_map(NextMapParams {
                prev_map: &prev,
                nodes_all: &nodes,
                nodes_to_remove: &[],
                nodes_to_add: &nodes,
                model: &model,
                partition_weights: None,
                state_stickiness: None,
                node_weights: &weights,
                node_hierarchy: &hierarchy,
                hierarchy_rules: None,
            })
        };

        let (m1, w1) = run();
        let (m2, _) = run();
        assert_eq!(m1, m2);
        assert!(w1.is_empty());

        for p in m1.values() {
            assert_eq!(p.nodes_by_state["primary"].len(), 1);
            assert_eq!(p.nodes_by_state["replica"].len(), 1);
            assert_ne!(
                p.nodes_by_state["primary"][0],
                p.nodes_by_state["replica"][0]
            );
        }
    }

    #[test]
    fn promotes_replica_when_primary_removed() {
        let model = primary_replica_model(1);
        let mut prev = PartitionMap::new();
        prev.insert("p0".to_string(), partition("p0", &["a"], &["b"]));

        let nodes = strings(&["a", "b", "c"]);
        let weights = HashMap::new();
        let hierarchy = HashMap::new();
        let to_remove = strings(&["a"]);

        let (next, _) = plan_next_map(NextMapParams {
            prev_map: &prev,
            nodes_all: &nodes,
            nodes_to_remove: &to_remove,
            nodes_to_add: &[],
            model: &model,
            partition_weights: None,
            state_stickiness: None,
            node_weights: &weights,
            node_hierarchy: &hierarchy,
            hierarchy_rules: None,
        });

        let p0 = &next["p0"];
        assert_eq!(p0.nodes_by_state["primary"], strings(&["b"]));
        assert_eq!(p0.nodes_by_state["replica"], strings(&["c"]));
    }

    #[test]
    fn warns_when_nodes_run_out() {
        let model = primary_replica_model(2);
        let mut prev = PartitionMap::new();
        prev.insert("p0".to_string(), partition("p0", &[], &[]));

        let nodes = strings(&["only"]);
        let weights = HashMap::new();
        let hierarchy = HashMap::new();

        let (next, warnings) = plan_next_map(NextMapParams {
            prev_map: &prev,
            nodes_all: &nodes,
            nodes_to_remove: &[],
            nodes_to_add: &nodes,
            model: &model,
            partition_weights: None,
            state_stickiness: None,
            node_weights: &weights,
            node_hierarchy: &hierarchy,
            hierarchy_rules: None,
        });

        assert_eq!(next["p0"].nodes_by_state["primary"].len(), 1);
        assert!(next["p0"].nodes_by_state["replica"].is_empty());
        assert!(!warnings.is_empty());
    }

    #[test]
    fn replicas_prefer_a_different_rack() {
        let model = primary_replica_model(1);
        let mut prev = PartitionMap::new();
        prev.insert("p0".to_string(), partition("p0", &[], &[]));

        // a and b share rack1; c sits in rack2.
        let nodes = strings(&["a", "b", "c"]);
        let weights = HashMap::new();
        let mut hierarchy = HashMap::new();
        for (node, rack) in [("a", "rack1"), ("b", "rack1"), ("c", "rack2")] {
            hierarchy.insert(node.to_string(), rack.to_string());
            hierarchy.insert(rack.to_string(), "dc".to_string());
        }
        let mut rules = HashMap::new();
        rules.insert(
            "replica".to_string(),
            vec![HierarchyRule {
                include_level: 2,
                exclude_level: 1,
            }],
        );

        let (next, warnings) = plan_next_map(NextMapParams {
            prev_map: &prev,
            nodes_all: &nodes,
            nodes_to_remove: &[],
            nodes_to_add: &nodes,
            model: &model,
            partition_weights: None,
            state_stickiness: None,
            node_weights: &weights,
            node_hierarchy: &hierarchy,
            hierarchy_rules: Some(&rules),
        });

        assert!(warnings.is_empty());
        let p0 = &next["p0"];
        assert_eq!(p0.nodes_by_state["primary"], strings(&["a"]));
        assert_eq!(p0.nodes_by_state["replica"], strings(&["c"]));
    }

    #[test]
    fn moves_for_primary_relocation() {
        let model = primary_replica_model(0);
        let mut beg = PartitionMap::new();
        beg.insert("p".to_string(), partition("p", &["a"], &[]));
        let mut end = PartitionMap::new();
        end.insert("p".to_string(), partition("p", &["b"], &[]));

        let moves = calc_partition_moves(&model, &beg, &end, false);
        let p = &moves["p"];
        assert_eq!(
            p.iter().map(|m| (m.node.as_str(), m.op.as_str())).collect::<Vec<_>>(),
            vec![("b", "add"), ("a", "del")]
        );
        assert_eq!(p[0].state, "primary");
    }

    #[test]
    fn moves_for_promotion() {
        let model = primary_replica_model(1);
        let mut beg = PartitionMap::new();
        beg.insert("p".to_string(), partition("p", &["a"], &["b"]));
        let mut end = PartitionMap::new();
        end.insert("p".to_string(), partition("p", &["b"], &[]));

        let moves = calc_partition_moves(&model, &beg, &end, false);
        let p = &moves["p"];
        assert_eq!(
            p.iter()
                .map(|m| (m.node.as_str(), m.state.as_str(), m.op.as_str()))
                .collect::<Vec<_>>(),
            vec![("b", "primary", "promote"), ("a", "", "del")]
        );
    }

    #[test]
    fn no_moves_for_identical_maps() {
        let model = primary_replica_model(1);
        let mut m = PartitionMap::new();
        m.insert("p".to_string(), partition("p", &["a"], &["b"]));
        assert!(calc_partition_moves(&model, &m, &m.clone(), false).is_empty());
    }
}
