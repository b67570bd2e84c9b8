//! Rebalancer: cluster-wide, catch-up-guarded partition moves
//!
//! A rebalance walks every index, computes the begin and end partition
//! maps for the changed node set, and lets the balance orchestrator apply
//! the difference one partition move at a time. A pindex becoming primary
//! on a new node first lands as a replica, then is promoted only after the
//! node monitor shows its sequence numbers caught up with the former
//! primary. Progress, pause/resume, and stop are exposed to the caller;
//! per-partition errors from vanished index definitions downgrade to
//! "continue with the other indexes".

mod monitor;

pub use monitor::{
    node_defs_url_uuids, start_monitor_nodes, MonitorNodes, MonitorNodesOptions, MonitorSample,
    UrlUuid, DEFAULT_DIAG_SAMPLE_INTERVAL, DEFAULT_STATS_SAMPLE_INTERVAL, DIAG_SAMPLE_KIND,
    STATS_SAMPLE_KIND,
};

use crate::balance::{
    self, lowest_weight_partition_move_for_node, orchestrate_moves, AssignPartitionsFunc,
    NextMoves, Orchestrator, OrchestratorOptions, OrchestratorProgress,
};
use crate::cfg::{cfg_set_plan_pindexes, Cfg};
use crate::defs::{
    get_node_plan_param, new_uuid, IndexDef, IndexDefs, NodeDefs, PlanPIndexNode, PlanPIndexes,
    UuidSeq,
};
use crate::manager::Manager;
use crate::pindex::pindex_impl_type_instantiatable;
use crate::planner::{
    balance_plan_pindexes, calc_nodes_layout, case_plan_frozen, planner_get_index_defs,
    planner_get_plan, planner_get_plan_pindexes, split_index_def_into_plan_pindexes, NodesLayout,
};
use crate::rest::HttpClient;
use crate::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default upper limit for consecutive stats-sampling errors tolerated per
/// node before the rebalance aborts.
pub const STATS_SAMPLE_ERROR_THRESHOLD: u8 = 3;

/// Progress status information emitted as a rebalance proceeds. Channel
/// close is the terminal signal.
#[derive(Debug, Clone, Default)]
pub struct RebalanceProgress {
    pub error: Option<String>,
    pub index: String,
    pub orchestrator_progress: OrchestratorProgress,
}

#[derive(Clone, Default)]
pub struct RebalanceOptions {
    /// See the balance orchestrator's favor_min_nodes.
    pub favor_min_nodes: bool,

    pub max_concurrent_partition_moves_per_node: usize,

    /// When true, assign a pindex as primary to a node directly rather
    /// than the replica-then-promote maneuver.
    pub add_primary_directly: bool,

    /// When true, no Cfg plan writes happen; everything else executes for
    /// analysis/planning.
    pub dry_run: bool,

    /// Injectable for tests; defaults to the shared reqwest client.
    pub http: Option<Arc<dyn HttpClient>>,

    /// Overrides the monitor's stats cadence; for tests.
    pub stats_sample_interval: Option<Duration>,

    /// Skip sequence-number catch-up checks entirely; for tests.
    pub skip_seq_checks: bool,

    /// When present, used for recovery-plan lookup and for verifying mid-
    /// move that awaited index definitions still exist.
    pub manager: Option<Arc<Manager>>,

    pub stats_sample_error_threshold: Option<u8>,
}

/// Tracks a state (e.g. "primary") with an in-flight op ("add", "del").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateOp {
    pub state: String,
    pub op: String,
}

/// Map of index -> pindex -> node -> StateOp.
pub type CurrStates = HashMap<String, HashMap<String, HashMap<String, StateOp>>>;

/// Map of pindex -> source partition -> node -> UuidSeq.
pub type CurrSeqs = HashMap<String, HashMap<String, HashMap<String, UuidSeq>>>;

/// Map of pindex -> source partition -> node -> UuidSeq.
pub type WantSeqs = HashMap<String, HashMap<String, HashMap<String, UuidSeq>>>;

/// Reads the UuidSeq for a pindex/sourcePartition/node.
pub fn get_uuid_seq(
    m: &HashMap<String, HashMap<String, HashMap<String, UuidSeq>>>,
    pindex: &str,
    source_partition: &str,
    node: &str,
) -> Option<UuidSeq> {
    m.get(pindex)?.get(source_partition)?.get(node).cloned()
}

/// Updates the UuidSeq for a pindex/sourcePartition/node, returning the
/// previous value.
pub fn set_uuid_seq(
    m: &mut HashMap<String, HashMap<String, HashMap<String, UuidSeq>>>,
    pindex: &str,
    source_partition: &str,
    node: &str,
    uuid: &str,
    seq: u64,
) -> Option<UuidSeq> {
    m.entry(pindex.to_string())
        .or_default()
        .entry(source_partition.to_string())
        .or_default()
        .insert(
            node.to_string(),
            UuidSeq {
                uuid: uuid.to_string(),
                seq,
            },
        )
}

/// The wire shape of a stats sample, as consumed from
/// `GET <node>/api/stats?partitions=true`.
#[derive(Debug, Default, Deserialize)]
struct NodeStats {
    #[serde(default)]
    pindexes: HashMap<String, PIndexStats>,
}

#[derive(Debug, Default, Deserialize)]
struct PIndexStats {
    #[serde(default)]
    partitions: HashMap<String, PartitionSeq>,
}

#[derive(Debug, Default, Deserialize)]
struct PartitionSeq {
    #[serde(default)]
    uuid: String,
    #[serde(default)]
    seq: u64,
}

// --------------------------------------------------------

struct RebalancerInner {
    end_plan_pindexes: PlanPIndexes,
    curr_states: CurrStates,
    curr_seqs: CurrSeqs,
    want_seqs: WantSeqs,
}

/// Holds all the tracking information for one rebalance operation.
pub struct Rebalancer {
    version: String,
    cfg: Arc<dyn Cfg>,
    server: String,
    options_mgr: HashMap<String, String>,
    options_reb: RebalanceOptions,

    nodes_all: Vec<String>,
    nodes_to_add: Vec<String>,
    nodes_to_remove: Vec<String>,
    node_weights: HashMap<String, i32>,
    node_hierarchy: HashMap<String, String>,

    beg_index_defs: IndexDefs,
    beg_node_defs: NodeDefs,
    beg_plan_pindexes: PlanPIndexes,
    beg_plan_pindexes_cas: u64,

    recovery_plan_pindexes: Option<PlanPIndexes>,

    monitor: MonitorNodes,
    monitor_sample_want_tx: mpsc::Sender<oneshot::Sender<MonitorSample>>,

    inner: tokio::sync::Mutex<RebalancerInner>,
    orchestrator: parking_lot::Mutex<Option<Arc<Orchestrator>>>,
    progress_rx: parking_lot::Mutex<Option<mpsc::Receiver<RebalanceProgress>>>,

    stop: CancellationToken,
}

impl std::fmt::Debug for Rebalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rebalancer")
            .field("version", &self.version)
            .field("server", &self.server)
            .field("nodes_all", &self.nodes_all)
            .field("nodes_to_add", &self.nodes_to_add)
            .field("nodes_to_remove", &self.nodes_to_remove)
            .finish_non_exhaustive()
    }
}

/// Begins a concurrent, cluster-wide rebalance of all indexes on a
/// cluster, with `nodes_to_remove_param` forced out of the layout.
pub async fn start_rebalance(
    version: &str,
    cfg: Arc<dyn Cfg>,
    server: &str,
    options_mgr: HashMap<String, String>,
    nodes_to_remove_param: &[String],
    options_reb: RebalanceOptions,
) -> Result<Arc<Rebalancer>> {
    // We have no node uuid; the rebalancer is not a node.
    let (beg_index_defs, beg_node_defs, beg_plan_pindexes, beg_plan_pindexes_cas) =
        planner_get_plan(cfg.as_ref(), version, "").await?;

    let layout = calc_nodes_layout(&beg_index_defs, &beg_node_defs, Some(&beg_plan_pindexes));

    let unknown: Vec<&String> = nodes_to_remove_param
        .iter()
        .filter(|n| !layout.node_uuids_all.contains(n))
        .collect();
    if !unknown.is_empty() {
        return Err(Error::Internal(format!(
            "rebalance: unknown nodes in nodesToRemoveParam: {unknown:?}"
        )));
    }

    let mut nodes_to_remove = layout.node_uuids_to_remove.clone();
    nodes_to_remove.extend(nodes_to_remove_param.iter().cloned());
    nodes_to_remove.sort();
    nodes_to_remove.dedup();

    let nodes_to_add: Vec<String> = layout
        .node_uuids_to_add
        .iter()
        .filter(|n| !nodes_to_remove.contains(n))
        .cloned()
        .collect();

    let url_uuids = node_defs_url_uuids(&beg_node_defs);
    info!(?url_uuids, "rebalance: monitoring nodes");

    let (monitor_sample_tx, monitor_sample_rx) = mpsc::channel(16);
    let monitor = start_monitor_nodes(
        url_uuids,
        monitor_sample_tx,
        MonitorNodesOptions {
            stats_sample_interval: options_reb.stats_sample_interval,
            diag_sample_disable: true,
            http: options_reb.http.clone(),
            ..Default::default()
        },
    )?;

    let (want_tx, want_rx) = mpsc::channel(64);
    let (progress_tx, progress_rx) = mpsc::channel(64);

    let recovery_plan_pindexes =
        find_recovery_plan(&options_reb, &nodes_to_add).await;

    let r = Arc::new(Rebalancer {
        version: version.to_string(),
        cfg,
        server: server.to_string(),
        options_mgr,
        options_reb,
        nodes_all: layout.node_uuids_all.clone(),
        nodes_to_add,
        nodes_to_remove,
        node_weights: layout.node_weights.clone(),
        node_hierarchy: layout.node_hierarchy.clone(),
        beg_index_defs,
        beg_node_defs,
        beg_plan_pindexes,
        beg_plan_pindexes_cas,
        recovery_plan_pindexes,
        monitor,
        monitor_sample_want_tx: want_tx,
        inner: tokio::sync::Mutex::new(RebalancerInner {
            end_plan_pindexes: PlanPIndexes::new(version),
            curr_states: CurrStates::new(),
            curr_seqs: CurrSeqs::new(),
            want_seqs: WantSeqs::new(),
        }),
        orchestrator: parking_lot::Mutex::new(None),
        progress_rx: parking_lot::Mutex::new(Some(progress_rx)),
        stop: CancellationToken::new(),
    });

    info!(nodes_all = ?r.nodes_all, "rebalance: starting");
    info!(nodes_to_add = ?r.nodes_to_add, nodes_to_remove = ?r.nodes_to_remove,
        recovery = r.recovery_plan_pindexes.is_some(), "rebalance: layout");

    let monitor_handle = tokio::spawn(r.clone().run_monitor(
        monitor_sample_rx,
        want_rx,
        progress_tx.clone(),
    ));

    tokio::spawn(r.clone().run_rebalance_indexes(progress_tx, monitor_handle));

    Ok(r)
}

/// Decides whether this rebalance is a failover-recovery: when a locally
/// persisted stable plan's node set covers every node being added, that
/// plan becomes the balance input so the pre-failover layout is reproduced
/// verbatim.
async fn find_recovery_plan(
    options_reb: &RebalanceOptions,
    nodes_to_add: &[String],
) -> Option<PlanPIndexes> {
    if nodes_to_add.is_empty() {
        return None;
    }
    let manager = options_reb.manager.as_ref()?;
    let stable = manager.get_stable_local_plan_pindexes().await?;

    let mut prev_nodes: Vec<&str> = stable
        .plan_pindexes
        .values()
        .flat_map(|p| p.nodes.keys().map(String::as_str))
        .collect();
    prev_nodes.sort_unstable();
    prev_nodes.dedup();

    if nodes_to_add.iter().all(|n| prev_nodes.contains(&n.as_str())) {
        Some(stable)
    } else {
        None
    }
}

impl Rebalancer {
    /// Takes the progress receiver. Events arrive as partition
    /// reassignments progress or error; the channel closes when the
    /// rebalance finishes, errors out, or is stopped.
    pub fn progress_rx(&self) -> Option<mpsc::Receiver<RebalanceProgress>> {
        self.progress_rx.lock().take()
    }

    /// Asynchronously requests a stop; idempotent. Watch for the progress
    /// channel closing to learn when the rebalance actually stopped.
    pub fn stop(&self) {
        self.stop.cancel();
        if let Some(o) = self.orchestrator.lock().as_ref() {
            o.stop();
        }
    }

    /// Pauses new assignments; in-flight assignments continue to
    /// completion or error.
    pub fn pause_new_assignments(&self) -> Result<()> {
        match self.orchestrator.lock().as_ref() {
            Some(o) => {
                o.pause_new_assignments();
                Ok(())
            }
            None => Err(Error::Internal("not pausable".to_string())),
        }
    }

    /// Resumes new assignments.
    pub fn resume_new_assignments(&self) -> Result<()> {
        match self.orchestrator.lock().as_ref() {
            Some(o) => {
                o.resume_new_assignments();
                Ok(())
            }
            None => Err(Error::Internal("not resumable".to_string())),
        }
    }

    /// Invokes the visitor with the current, read-only move-tracking
    /// state.
    pub async fn visit<F>(&self, visitor: F)
    where
        F: FnOnce(&CurrStates, &CurrSeqs, &WantSeqs, Option<&HashMap<String, NextMoves>>),
    {
        let inner = self.inner.lock().await;
        let orchestrator = self.orchestrator.lock().clone();
        match orchestrator {
            Some(o) => o.visit_next_moves(|moves| {
                visitor(&inner.curr_states, &inner.curr_seqs, &inner.want_seqs, Some(moves))
            }),
            None => visitor(&inner.curr_states, &inner.curr_seqs, &inner.want_seqs, None),
        }
    }

    /// The end plan computed so far; treat as immutable.
    pub async fn get_end_plan_pindexes(&self) -> PlanPIndexes {
        self.inner.lock().await.end_plan_pindexes.clone()
    }

    /// The cluster snapshot the rebalance started from.
    pub fn begin_node_defs(&self) -> &NodeDefs {
        &self.beg_node_defs
    }

    pub fn begin_plan_pindexes(&self) -> (&PlanPIndexes, u64) {
        (&self.beg_plan_pindexes, self.beg_plan_pindexes_cas)
    }

    /// An upfront approximation of the total partitions to be moved,
    /// assuming index partitions are evenly distributed.
    pub fn get_moving_partitions_count(&self) -> usize {
        let mut moving = 0;
        if let Some(o) = self.orchestrator.lock().as_ref() {
            o.visit_next_moves(|moves| {
                moving = moves.values().filter(|nm| !nm.moves.is_empty()).count();
            });
        }
        self.beg_index_defs.index_defs.len() * moving
    }

    // --------------------------------------------------------

    /// Rebalances each index, one at a time, then releases every
    /// rebalance-related resource and closes the progress channel.
    async fn run_rebalance_indexes(
        self: Arc<Self>,
        progress_tx: mpsc::Sender<RebalanceProgress>,
        monitor_handle: JoinHandle<()>,
    ) {
        let mut index_names: Vec<String> = self.beg_index_defs.index_defs.keys().cloned().collect();
        index_names.sort();

        let n = index_names.len();
        for (i, index_name) in index_names.iter().enumerate() {
            if self.stop.is_cancelled() {
                break;
            }

            info!(index = index_name, "run rebalance indexes: {} of {n}", i + 1);

            let index_def = self.beg_index_defs.index_defs[index_name].clone();
            if let Err(e) = self.rebalance_index(&index_def, &progress_tx).await {
                warn!(index = index_name, "rebalance: index failed, err: {e}");
                break;
            }
        }

        // Completion, natural or via error/stop, needs this cleanup; wait
        // for the monitor loop as it may have more progress sends.
        self.stop();
        self.monitor.stop();
        let _ = monitor_handle.await;
        drop(progress_tx);
    }

    /// Rebalances a single index through the orchestrator.
    async fn rebalance_index(
        self: &Arc<Self>,
        index_def: &IndexDef,
        progress_tx: &mpsc::Sender<RebalanceProgress>,
    ) -> Result<bool> {
        debug!(index = index_def.name, "rebalance: index");

        {
            let mut inner = self.inner.lock().await;
            if case_plan_frozen(index_def, &self.beg_plan_pindexes, &mut inner.end_plan_pindexes) {
                info!(index = index_def.name, "rebalance: plan frozen, cloned previous plan");
                return Ok(false);
            }
        }

        // Skip index defs with no instantiatable implementation, such as
        // aliases.
        if !pindex_impl_type_instantiatable(&index_def.index_type) {
            return Ok(false);
        }

        let (model, beg_map, end_map) = self.calc_beg_end_maps(index_def).await?;

        let assign: AssignPartitionsFunc = {
            let r = self.clone();
            let index_name = index_def.name.clone();
            let progress_tx = progress_tx.clone();
            Arc::new(move |stop2, node, partitions, states, ops| {
                let r = r.clone();
                let index_name = index_name.clone();
                let progress_tx = progress_tx.clone();
                Box::pin(async move {
                    debug!(index = index_name, node, ?partitions, ?states, ?ops,
                        "rebalance: assign pindexes starts");

                    let result = r
                        .assign_pindexes(
                            stop2,
                            &index_name,
                            &node,
                            partitions,
                            states,
                            ops,
                            progress_tx.clone(),
                        )
                        .await;

                    match result {
                        Ok(()) => Ok(()),
                        Err(Error::NoIndexDefinition) => {
                            // The index vanished mid-move; give up on it
                            // but let the rebalance continue elsewhere.
                            warn!(index = index_name, "rebalance: index definition gone");
                            Ok(())
                        }
                        Err(Error::Stopped) => Err(Error::Stopped),
                        Err(e) => {
                            let _ = progress_tx
                                .send(RebalanceProgress {
                                    error: Some(e.to_string()),
                                    index: index_name.clone(),
                                    ..Default::default()
                                })
                                .await;
                            r.stop();
                            Err(e)
                        }
                    }
                })
            })
        };

        let orchestrator = orchestrate_moves(
            &model,
            OrchestratorOptions {
                max_concurrent_partition_moves_per_node: self
                    .options_reb
                    .max_concurrent_partition_moves_per_node,
                favor_min_nodes: self.options_reb.favor_min_nodes,
            },
            &self.nodes_all,
            &beg_map,
            &end_map,
            assign,
            lowest_weight_partition_move_for_node,
        )?;

        *self.orchestrator.lock() = Some(orchestrator.clone());

        // Propagate a rebalancer stop into this index's orchestrator.
        {
            let o = orchestrator.clone();
            let stop = self.stop.clone();
            tokio::spawn(async move {
                stop.cancelled().await;
                o.stop();
            });
        }

        let mut first_err: Option<String> = None;
        if let Some(mut rx) = orchestrator.progress_rx() {
            while let Some(progress) = rx.recv().await {
                if first_err.is_none() {
                    first_err = progress.errors.first().cloned();
                }
                let _ = progress_tx
                    .send(RebalanceProgress {
                        error: first_err.clone(),
                        index: index_def.name.clone(),
                        orchestrator_progress: progress,
                    })
                    .await;
            }
        }

        orchestrator.stop();
        *self.orchestrator.lock() = None;

        match first_err {
            Some(e) => Err(Error::Internal(e)),
            None => Ok(true),
        }
    }

    /// Computes the before and after partition maps for an index, feeding
    /// the recovery plan when this is a failover-recovery.
    async fn calc_beg_end_maps(
        &self,
        index_def: &IndexDef,
    ) -> Result<(balance::PartitionModel, balance::PartitionMap, balance::PartitionMap)> {
        let mut inner = self.inner.lock().await;

        let mut end_for_index =
            split_index_def_into_plan_pindexes(index_def, &self.server, &self.options_mgr)
                .await
                .map_err(|e| {
                    warn!(index = index_def.name, "rebalance: could not split index def, err: {e}");
                    e
                })?;

        let warnings = match &self.recovery_plan_pindexes {
            Some(recovery_plan) => {
                // During failover, replicas were promoted in place rather
                // than rebalanced. Feeding the pre-failover plan back to
                // the balancer reproduces that exact layout for the same
                // node set.
                info!(index = index_def.name, "rebalance: recovery rebalance");
                balance_plan_pindexes(
                    "",
                    index_def,
                    &mut end_for_index,
                    recovery_plan,
                    &NodesLayout {
                        node_uuids_all: self.nodes_all.clone(),
                        node_uuids_to_add: Vec::new(),
                        node_uuids_to_remove: self.nodes_to_remove.clone(),
                        node_weights: self.node_weights.clone(),
                        node_hierarchy: self.node_hierarchy.clone(),
                    },
                )
            }
            None => balance_plan_pindexes(
                "",
                index_def,
                &mut end_for_index,
                &self.beg_plan_pindexes,
                &NodesLayout {
                    node_uuids_all: self.nodes_all.clone(),
                    node_uuids_to_add: self.nodes_to_add.clone(),
                    node_uuids_to_remove: self.nodes_to_remove.clone(),
                    node_weights: self.node_weights.clone(),
                    node_hierarchy: self.node_hierarchy.clone(),
                },
            ),
        };

        for warning in &warnings {
            info!(index = index_def.name, warning, "rebalance: balance warning");
        }
        inner
            .end_plan_pindexes
            .warnings
            .insert(index_def.name.clone(), warnings);

        for (name, plan_pindex) in &end_for_index {
            inner
                .end_plan_pindexes
                .plan_pindexes
                .insert(name.clone(), plan_pindex.clone());
        }

        let model = balance::primary_replica_model(index_def.plan_params.num_replicas);
        let beg_map = crate::planner::partition_map_from_plan(&end_for_index, Some(&self.beg_plan_pindexes));
        let end_map = crate::planner::partition_map_from_plan(&end_for_index, Some(&inner.end_plan_pindexes));

        Ok((model, beg_map, end_map))
    }

    // --------------------------------------------------------

    /// Applies a batch of per-node pindex moves, expanding primary
    /// placements into multi-step replica/promote maneuvers and walking
    /// all the batch's moves forward one step at a time.
    #[allow(clippy::too_many_arguments)]
    async fn assign_pindexes(
        self: &Arc<Self>,
        stop2: CancellationToken,
        index: &str,
        node: &str,
        pindexes: Vec<String>,
        states: Vec<String>,
        ops: Vec<String>,
        progress_tx: mpsc::Sender<RebalanceProgress>,
    ) -> Result<()> {
        let mut moves = self.create_pindexes_moves(pindexes, states, ops);

        let mut next = 0;
        while !moves.is_empty() {
            let (index_def, plan_pindexes, former_primary_nodes) = {
                // Holding the lock across the Cfg update reduces, though
                // does not eliminate, CAS conflicts.
                let mut inner = self.inner.lock().await;
                self.assign_pindexes_locked(&mut inner, index, node, &moves, next)
                    .await?
            };

            let plan_pindexes = Arc::new(plan_pindexes);

            // One worker per pindex tracks that partition's assignment to
            // completion, including any catch-up wait.
            let waits: Vec<_> = moves
                .iter()
                .zip(former_primary_nodes)
                .map(|(pm, former_primary)| {
                    let r = self.clone();
                    let stop2 = stop2.clone();
                    let index_def = index_def.clone();
                    let plan_pindexes = plan_pindexes.clone();
                    let pindex = pm.name.clone();
                    let node = node.to_string();
                    let state_op = pm.state_ops[next].clone();
                    let force_wait = pm.state_ops.len() > 1;
                    let progress_tx = progress_tx.clone();
                    async move {
                        r.wait_assign_pindex_done(
                            stop2,
                            &index_def,
                            &plan_pindexes,
                            &pindex,
                            &node,
                            &state_op,
                            &former_primary,
                            force_wait,
                            progress_tx,
                        )
                        .await
                    }
                })
                .collect();

            let results = futures::future::join_all(waits).await;

            let mut errs = Vec::new();
            let mut index_missing_only = true;
            for result in results {
                if let Err(e) = result {
                    if !matches!(e, Error::NoIndexDefinition) {
                        index_missing_only = false;
                    }
                    errs.push(e);
                }
            }
            if !errs.is_empty() {
                if index_missing_only {
                    return Err(Error::NoIndexDefinition);
                }
                if errs.iter().any(|e| matches!(e, Error::Stopped)) {
                    return Err(Error::Stopped);
                }
                return Err(Error::Internal(format!(
                    "rebalance: waitAssignPIndexDone errors: {}, {:?}",
                    errs.len(),
                    errs.iter().map(|e| e.to_string()).collect::<Vec<_>>()
                )));
            }

            // Filter out single-step moves that are already complete.
            next += 1;
            moves.retain(|pm| pm.state_ops.len() > next);
        }

        Ok(())
    }

    /// Expands each incoming `(state, op)` into its move steps: adding a
    /// primary goes replica-first (unless configured direct), and a
    /// promotion gets a placeholder first step to force a catch-up wait.
    fn create_pindexes_moves(
        &self,
        pindexes: Vec<String>,
        states: Vec<String>,
        ops: Vec<String>,
    ) -> Vec<PIndexMoves> {
        pindexes
            .into_iter()
            .zip(states)
            .zip(ops)
            .map(|((name, state), op)| {
                let state_ops = if !self.options_reb.add_primary_directly
                    && state == "primary"
                    && op == "add"
                {
                    vec![
                        StateOp {
                            state: "replica".to_string(),
                            op: "add".to_string(),
                        },
                        StateOp {
                            state: "primary".to_string(),
                            op: "promote".to_string(),
                        },
                    ]
                } else if state == "primary" && op == "promote" {
                    vec![
                        StateOp {
                            state: "replica".to_string(),
                            op: "promote".to_string(),
                        },
                        StateOp {
                            state: "primary".to_string(),
                            op: "promote".to_string(),
                        },
                    ]
                } else {
                    vec![StateOp { state, op }]
                };
                PIndexMoves { name, state_ops }
            })
            .collect()
    }

    /// Validates the batch's state transitions, then updates the stored
    /// plan under CAS (bounded retries), returning the index def, the
    /// updated plan, and each partition's former primary node.
    async fn assign_pindexes_locked(
        &self,
        inner: &mut RebalancerInner,
        index: &str,
        node: &str,
        moves: &[PIndexMoves],
        next: usize,
    ) -> Result<(IndexDef, PlanPIndexes, Vec<String>)> {
        for pm in moves {
            self.assign_pindex_curr_states_locked(inner, index, &pm.name, node, &pm.state_ops[next])?;
        }

        let index_defs = planner_get_index_defs(self.cfg.as_ref(), &self.version).await?;
        let Some(index_def) = index_defs.index_defs.get(index).cloned() else {
            debug!(index, "rebalance: empty definitions found for index");
            return Err(Error::NoIndexDefinition);
        };

        let mut attempts = 0;
        loop {
            attempts += 1;

            let (mut plan_pindexes, cas) =
                planner_get_plan_pindexes(self.cfg.as_ref(), &self.version).await?;

            let mut former_primary_nodes = Vec::with_capacity(moves.len());
            for pm in moves {
                let former = self
                    .update_plan_pindexes_locked(
                        inner,
                        &mut plan_pindexes,
                        &index_def,
                        &pm.name,
                        node,
                        &pm.state_ops[next],
                    )
                    .await?;
                former_primary_nodes.push(former);
            }

            if self.options_reb.dry_run {
                return Ok((index_def, plan_pindexes, former_primary_nodes));
            }

            match cfg_set_plan_pindexes(self.cfg.as_ref(), &plan_pindexes, cas).await {
                Ok(_) => return Ok((index_def, plan_pindexes, former_primary_nodes)),
                Err(e) if e.is_cas_mismatch() && attempts < 100 => {
                    debug!(index, "rebalance: plan write cas conflict, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Validates a state transition and records it in currStates; an "add"
    /// that finds an existing in-flight StateOp for the node is invalid.
    fn assign_pindex_curr_states_locked(
        &self,
        inner: &mut RebalancerInner,
        index: &str,
        pindex: &str,
        node: &str,
        state_op: &StateOp,
    ) -> Result<()> {
        let nodes = inner
            .curr_states
            .entry(index.to_string())
            .or_default()
            .entry(pindex.to_string())
            .or_default();

        if state_op.op == "add" {
            if let Some(existing) = nodes.get(node) {
                if !existing.state.is_empty() {
                    return Err(Error::Internal(format!(
                        "rebalance: op was add when exists, index: {index}, pindex: {pindex}, \
                         node: {node}, state: {:?}, existing: {existing:?}",
                        state_op
                    )));
                }
            }
        }

        nodes.insert(node.to_string(), state_op.clone());
        Ok(())
    }

    /// Modifies one partition's node entry in the plan per the
    /// `(state, op)`, returning the partition's former primary node.
    async fn update_plan_pindexes_locked(
        &self,
        inner: &RebalancerInner,
        plan_pindexes: &mut PlanPIndexes,
        index_def: &IndexDef,
        pindex: &str,
        node: &str,
        state_op: &StateOp,
    ) -> Result<String> {
        // A partition new to the stored plan starts from the end plan's
        // definition, with no assignments.
        if !plan_pindexes.plan_pindexes.contains_key(pindex) {
            if let Some(end) = inner.end_plan_pindexes.plan_pindexes.get(pindex) {
                let mut p = end.clone();
                p.nodes = HashMap::new();
                plan_pindexes.plan_pindexes.insert(pindex.to_string(), p);
            }
        }
        let Some(plan_pindex) = plan_pindexes.plan_pindexes.get_mut(pindex) else {
            return Err(Error::Internal(format!(
                "rebalance: no planPIndex, pindex: {pindex}"
            )));
        };

        let former_primary_node = plan_pindex
            .primary_node()
            .map(str::to_string)
            .unwrap_or_default();

        let (can_read, can_write) = get_node_plan_param(
            index_def.plan_params.node_plan_params.as_ref(),
            node,
            &index_def.name,
            pindex,
        )
        .map(|p| (p.can_read, p.can_write))
        .unwrap_or((true, true));

        let priority = if state_op.state == "replica" {
            plan_pindex.nodes.len() as i32
        } else {
            0
        };

        if state_op.op == "add" {
            if plan_pindex.nodes.contains_key(node) {
                return Err(Error::Internal(format!(
                    "rebalance: planPIndex entry already exists, pindex: {pindex}, node: {node}, \
                     state: {:?}",
                    state_op
                )));
            }
            plan_pindex.nodes.insert(
                node.to_string(),
                PlanPIndexNode {
                    can_read,
                    can_write,
                    priority,
                },
            );
        } else {
            if !plan_pindex.nodes.contains_key(node) {
                // Distinguish a vanished index definition from a plan
                // propagation gap.
                let index_defs = planner_get_index_defs(self.cfg.as_ref(), &self.version).await?;
                if !index_defs.index_defs.contains_key(&index_def.name) {
                    return Err(Error::NoIndexDefinition);
                }
                return Err(Error::Internal(format!(
                    "rebalance: planPIndex node missing, index: {}, pindex: {pindex}, \
                     node: {node}, state: {:?}",
                    index_def.name, state_op
                )));
            }

            if state_op.op == "del" {
                plan_pindex.nodes.remove(node);
            } else {
                plan_pindex.nodes.insert(
                    node.to_string(),
                    PlanPIndexNode {
                        can_read,
                        can_write,
                        priority,
                    },
                );
            }
        }

        plan_pindex.uuid = new_uuid();
        plan_pindexes.uuid = new_uuid();
        plan_pindexes.impl_version = self.version.clone();

        Ok(former_primary_node)
    }

    // --------------------------------------------------------

    /// Blocks until a pindex/node/state/op transition is complete: no-ops
    /// return immediately, while anything standing in for a future primary
    /// waits until the node's seqs catch up with the former primary's.
    #[allow(clippy::too_many_arguments)]
    async fn wait_assign_pindex_done(
        self: &Arc<Self>,
        stop2: CancellationToken,
        index_def: &IndexDef,
        plan_pindexes: &PlanPIndexes,
        pindex: &str,
        node: &str,
        state_op: &StateOp,
        former_primary_node: &str,
        force_wait_for_catchup: bool,
        progress_tx: mpsc::Sender<RebalanceProgress>,
    ) -> Result<()> {
        if state_op.op == "del" {
            return Ok(());
        }
        if state_op.state == "replica" && !force_wait_for_catchup {
            // A plain replica needs no catch-up gate.
            return Ok(());
        }
        if former_primary_node.is_empty() {
            // No previous primary exists to catch up against.
            return Ok(());
        }

        let source_partitions: Vec<String> = {
            let plan_pindex = plan_pindexes.plan_pindexes.get(pindex).ok_or_else(|| {
                Error::Internal(format!("rebalance: no planPIndex, pindex: {pindex}"))
            })?;
            plan_pindex
                .source_partitions
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        };

        let mut err_threshold = self
            .options_reb
            .stats_sample_error_threshold
            .unwrap_or(STATS_SAMPLE_ERROR_THRESHOLD);

        // First capture want-seqs: the former primary's current seq per
        // source partition, waiting for fresh samples as needed.
        if !self.options_reb.skip_seq_checks {
            for source_partition in &source_partitions {
                loop {
                    {
                        let mut inner = self.inner.lock().await;
                        if get_uuid_seq(&inner.want_seqs, pindex, source_partition, node).is_some()
                        {
                            break;
                        }
                        if let Some(want) = get_uuid_seq(
                            &inner.curr_seqs,
                            pindex,
                            source_partition,
                            former_primary_node,
                        ) {
                            set_uuid_seq(
                                &mut inner.want_seqs,
                                pindex,
                                source_partition,
                                node,
                                &want.uuid,
                                want.seq,
                            );
                            break;
                        }
                    }

                    debug!(pindex, "rebalance: awaiting a stats sample grab");
                    match self.grab_current_sample(&stop2, pindex, former_primary_node).await {
                        Ok(()) => {}
                        Err(Error::NoIndexDefinition) if err_threshold > 0 => {
                            // Tolerate a plan propagation or implementation
                            // lag at the remote node.
                            err_threshold -= 1;
                        }
                        Err(e) => {
                            warn!(pindex, "rebalance: wait assign failed, err: {e}");
                            return Err(e);
                        }
                    }
                }
            }
        }

        // Then poll until the target node reaches the want-seq for every
        // source partition.
        for source_partition in &source_partitions {
            let want = {
                let inner = self.inner.lock().await;
                get_uuid_seq(&inner.want_seqs, pindex, source_partition, node)
            };
            let want = match want {
                Some(want) => want,
                None if self.options_reb.skip_seq_checks => continue,
                None => {
                    return Err(Error::Internal(format!(
                        "rebalance: could not find uuidSeqWant, pindex: {pindex}, \
                         sourcePartition: {source_partition}, node: {node}"
                    )))
                }
            };

            if self.uuid_seq_reached(pindex, source_partition, node, &want).await {
                continue;
            }

            let mut caught_up = false;
            while !caught_up {
                let sample = self.next_sample(&stop2).await?;

                if let Some(err) = &sample.error {
                    return Err(Error::Transport(err.clone()));
                }

                if sample.kind != STATS_SAMPLE_KIND {
                    continue;
                }

                caught_up = self.uuid_seq_reached(pindex, source_partition, node, &want).await;

                // An empty progress event per sample tick keeps callers
                // informed of liveness during long catch-ups.
                let _ = progress_tx.send(RebalanceProgress::default()).await;

                // At the sampling frequency, verify that the index we are
                // waiting on has not been deleted.
                if let Some(manager) = &self.options_reb.manager {
                    let idx = manager.check_and_get_index_def(&index_def.name, false).await?;
                    match idx {
                        Some(idx) if idx.uuid == index_def.uuid => {}
                        _ => {
                            warn!(index = index_def.name, "rebalance: index missing mid-wait");
                            return Err(Error::NoIndexDefinition);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Reserves the next monitor sample and hands it back.
    async fn next_sample(&self, stop2: &CancellationToken) -> Result<MonitorSample> {
        let (tx, rx) = oneshot::channel();
        tokio::select! {
            _ = self.stop.cancelled() => return Err(Error::Stopped),
            _ = stop2.cancelled() => return Err(Error::Stopped),
            sent = self.monitor_sample_want_tx.send(tx) => {
                if sent.is_err() {
                    return Err(Error::Stopped);
                }
            }
        }
        rx.await.map_err(|_| Error::Stopped)
    }

    /// Blocks until the monitor has a fresh sample, erroring when that
    /// sample shows the awaited pindex is gone from the given node.
    async fn grab_current_sample(
        &self,
        stop2: &CancellationToken,
        pindex: &str,
        node: &str,
    ) -> Result<()> {
        let sample = self.next_sample(stop2).await?;

        if sample.uuid != node {
            // A sample from some other node; the caller re-checks and
            // reserves again.
            return Ok(());
        }

        let Some(data) = &sample.data else {
            return Err(Error::Transport(format!(
                "rebalance: grab current sample, empty response for node: {node}"
            )));
        };

        let stats: NodeStats = serde_json::from_slice(data)?;
        if !stats.pindexes.contains_key(pindex) {
            // Absence of the pindex in a healthy sample can indicate the
            // index definition is gone.
            return Err(Error::NoIndexDefinition);
        }

        Ok(())
    }

    /// Seq-only comparison: the target node has caught up when its
    /// current seq meets the wanted seq for the source partition.
    async fn uuid_seq_reached(
        &self,
        pindex: &str,
        source_partition: &str,
        node: &str,
        want: &UuidSeq,
    ) -> bool {
        if self.options_reb.skip_seq_checks {
            return true;
        }

        let curr = {
            let inner = self.inner.lock().await;
            get_uuid_seq(&inner.curr_seqs, pindex, source_partition, node)
        };

        debug!(
            pindex,
            source_partition, node, want_seq = want.seq, curr = ?curr,
            "rebalance: uuid seq reached check"
        );

        matches!(curr, Some(curr) if curr.seq >= want.seq)
    }

    // --------------------------------------------------------

    /// Consumes monitor samples: tolerates up to the error threshold of
    /// consecutive failures per node, folds valid stats into currSeqs, and
    /// hands each sample to any waiter holding a reservation.
    async fn run_monitor(
        self: Arc<Self>,
        mut sample_rx: mpsc::Receiver<MonitorSample>,
        mut want_rx: mpsc::Receiver<oneshot::Sender<MonitorSample>>,
        progress_tx: mpsc::Sender<RebalanceProgress>,
    ) {
        let err_threshold = self
            .options_reb
            .stats_sample_error_threshold
            .unwrap_or(STATS_SAMPLE_ERROR_THRESHOLD);

        let mut err_map: HashMap<String, u8> = HashMap::new();

        loop {
            let sample = tokio::select! {
                _ = self.stop.cancelled() => return,
                sample = sample_rx.recv() => match sample {
                    Some(sample) => sample,
                    None => return,
                },
            };

            debug!(kind = sample.kind, node = sample.uuid, "rebalance: monitor sample");

            if let Some(err) = &sample.error {
                let count = err_map.entry(sample.uuid.clone()).or_insert(0);
                *count += 1;
                if *count < err_threshold {
                    debug!(
                        node = sample.uuid,
                        count = *count,
                        "rebalance: monitor ignoring sample error: {err}"
                    );
                    continue;
                }

                warn!(node = sample.uuid, "rebalance: monitor sample error: {err}");
                let _ = progress_tx
                    .send(RebalanceProgress {
                        error: Some(err.clone()),
                        ..Default::default()
                    })
                    .await;
                self.stop();
                continue;
            }

            if sample.kind == STATS_SAMPLE_KIND {
                let Some(data) = &sample.data else {
                    let count = err_map.entry(sample.uuid.clone()).or_insert(0);
                    *count += 1;
                    if *count < err_threshold {
                        debug!(node = sample.uuid, count = *count, "rebalance: monitor empty response");
                        continue;
                    }
                    let _ = progress_tx
                        .send(RebalanceProgress {
                            error: Some(format!("empty stats response from {}", sample.uuid)),
                            ..Default::default()
                        })
                        .await;
                    self.stop();
                    continue;
                };

                // Only a sequential run of errors for a node aborts a
                // rebalance.
                err_map.insert(sample.uuid.clone(), 0);

                let stats: NodeStats = match serde_json::from_slice(data) {
                    Ok(stats) => stats,
                    Err(e) => {
                        warn!(node = sample.uuid, "rebalance: monitor stats json, err: {e}");
                        let _ = progress_tx
                            .send(RebalanceProgress {
                                error: Some(e.to_string()),
                                ..Default::default()
                            })
                            .await;
                        self.stop();
                        continue;
                    }
                };

                let mut inner = self.inner.lock().await;
                for (pindex, pindex_stats) in stats.pindexes {
                    for (source_partition, uuid_seq) in pindex_stats.partitions {
                        let prev = set_uuid_seq(
                            &mut inner.curr_seqs,
                            &pindex,
                            &source_partition,
                            &sample.uuid,
                            &uuid_seq.uuid,
                            uuid_seq.seq,
                        );
                        let changed = prev
                            .map(|p| p.uuid != uuid_seq.uuid || p.seq != uuid_seq.seq)
                            .unwrap_or(true);
                        if changed {
                            debug!(
                                node = sample.uuid,
                                pindex, source_partition, seq = uuid_seq.seq,
                                "rebalance: monitor seq advanced"
                            );
                        }
                    }
                }
            }

            // Hand this sample to every waiter currently holding a
            // reservation.
            while let Ok(waiter) = want_rx.try_recv() {
                let _ = waiter.send(sample.clone());
            }
        }
    }
}

/// A pindex movement with its (possibly multi-step) state transitions.
#[derive(Debug, Clone)]
struct PIndexMoves {
    name: String,
    state_ops: Vec<StateOp>,
}
