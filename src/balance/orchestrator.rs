//! Move orchestration
//!
//! Turns a begin/end partition-map pair into per-partition move sequences
//! and drives them against a live cluster through a caller-supplied
//! assignment callback, one step per partition at a time, batching
//! same-node moves subject to a per-node concurrency cap. Supports
//! pausing new assignments, resuming, and stopping.

use super::{calc_partition_moves, NodeStateOp, PartitionMap, PartitionModel};
use crate::{Error, Result};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct OrchestratorOptions {
    /// Cap on concurrently moving partitions per node; 0 means 1.
    pub max_concurrent_partition_moves_per_node: usize,
    /// Tear down old assignments before building new ones, freeing
    /// capacity at the cost of availability.
    pub favor_min_nodes: bool,
}

/// A snapshot of orchestration progress, sent after every wave of
/// assignments and once at the start and end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrchestratorProgress {
    pub tot_partition_moves: usize,
    pub tot_moves_done: usize,
    pub tot_assign_errs: usize,
    pub errors: Vec<String>,
}

/// The remaining move sequence for one partition; `next` indexes the move
/// to perform.
#[derive(Debug, Clone)]
pub struct NextMoves {
    pub partition: String,
    pub next: usize,
    pub moves: Vec<NodeStateOp>,
}

/// One candidate move for scheduling.
#[derive(Debug, Clone)]
pub struct PendingMove {
    pub partition: String,
    pub node: String,
    pub state: String,
    pub op: String,
}

/// Chooses which of a node's pending moves goes next; returns an index
/// into the slice.
pub type PartitionMoveSelector = fn(&[PendingMove]) -> usize;

/// The default selector: first pending move wins (pending moves arrive in
/// deterministic partition order).
pub fn lowest_weight_partition_move_for_node(_pending: &[PendingMove]) -> usize {
    0
}

/// The assignment callback: applies a batch of `(partition, state, op)`
/// changes for a single node, returning once the cluster reflects them
/// (including any catch-up waits).
pub type AssignPartitionsFunc = Arc<
    dyn Fn(CancellationToken, String, Vec<String>, Vec<String>, Vec<String>) -> BoxFuture<'static, Result<()>>
        + Send
        + Sync,
>;

struct PauseGate {
    paused: AtomicBool,
    notify: Notify,
}

impl PauseGate {
    fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    async fn wait_unpaused(&self) {
        loop {
            if !self.paused.load(Ordering::Acquire) {
                return;
            }
            let notified = self.notify.notified();
            if !self.paused.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

/// Handle to a running orchestration.
pub struct Orchestrator {
    stop: CancellationToken,
    pause: Arc<PauseGate>,
    moves: Arc<Mutex<HashMap<String, NextMoves>>>,
    progress_rx: Mutex<Option<mpsc::Receiver<OrchestratorProgress>>>,
}

impl Orchestrator {
    /// Takes the progress receiver; the channel closes when the
    /// orchestration finishes, errors out, or is stopped.
    pub fn progress_rx(&self) -> Option<mpsc::Receiver<OrchestratorProgress>> {
        self.progress_rx.lock().take()
    }

    /// Pauses scheduling of new assignment batches; in-flight batches run
    /// to completion.
    pub fn pause_new_assignments(&self) {
        self.pause.paused.store(true, Ordering::Release);
    }

    /// Resumes scheduling of new assignment batches.
    pub fn resume_new_assignments(&self) {
        self.pause.paused.store(false, Ordering::Release);
        self.pause.notify.notify_waiters();
    }

    /// Requests a stop; idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Invokes the visitor with the current per-partition move state.
    pub fn visit_next_moves<F: FnOnce(&HashMap<String, NextMoves>)>(&self, f: F) {
        let moves = self.moves.lock();
        f(&moves);
    }
}

/// Starts orchestrating the moves that turn `beg_map` into `end_map`.
pub fn orchestrate_moves(
    model: &PartitionModel,
    options: OrchestratorOptions,
    _nodes_all: &[String],
    beg_map: &PartitionMap,
    end_map: &PartitionMap,
    assign: AssignPartitionsFunc,
    selector: PartitionMoveSelector,
) -> Result<Arc<Orchestrator>> {
    let calc = calc_partition_moves(model, beg_map, end_map, options.favor_min_nodes);
    let moves: HashMap<String, NextMoves> = calc
        .into_iter()
        .map(|(partition, moves)| {
            (
                partition.clone(),
                NextMoves {
                    partition,
                    next: 0,
                    moves,
                },
            )
        })
        .collect();

    let tot_moves = moves.values().map(|nm| nm.moves.len()).sum();

    let (progress_tx, progress_rx) = mpsc::channel(16);

    let orchestrator = Arc::new(Orchestrator {
        stop: CancellationToken::new(),
        pause: Arc::new(PauseGate::new()),
        moves: Arc::new(Mutex::new(moves)),
        progress_rx: Mutex::new(Some(progress_rx)),
    });

    let cap = options.max_concurrent_partition_moves_per_node.max(1);
    let runner = OrchestratorRunner {
        stop: orchestrator.stop.clone(),
        pause: orchestrator.pause.clone(),
        moves: orchestrator.moves.clone(),
        assign,
        selector,
        cap,
        progress: OrchestratorProgress {
            tot_partition_moves: tot_moves,
            ..Default::default()
        },
        progress_tx,
    };
    tokio::spawn(runner.run());

    Ok(orchestrator)
}

struct OrchestratorRunner {
    stop: CancellationToken,
    pause: Arc<PauseGate>,
    moves: Arc<Mutex<HashMap<String, NextMoves>>>,
    assign: AssignPartitionsFunc,
    selector: PartitionMoveSelector,
    cap: usize,
    progress: OrchestratorProgress,
    progress_tx: mpsc::Sender<OrchestratorProgress>,
}

impl OrchestratorRunner {
    async fn run(mut self) {
        let _ = self.progress_tx.send(self.progress.clone()).await;

        loop {
            if self.stop.is_cancelled() {
                break;
            }

            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = self.pause.wait_unpaused() => {}
            }

            let batches = self.next_batches();
            if batches.is_empty() {
                break;
            }

            let wave: Vec<_> = batches
                .into_iter()
                .map(|(node, batch)| {
                    let assign = self.assign.clone();
                    let child = self.stop.child_token();
                    async move {
                        let partitions: Vec<String> =
                            batch.iter().map(|m| m.partition.clone()).collect();
                        let states: Vec<String> = batch.iter().map(|m| m.state.clone()).collect();
                        let ops: Vec<String> = batch.iter().map(|m| m.op.clone()).collect();
                        debug!(node, ?partitions, ?states, ?ops, "orchestrator: assign batch");
                        let result = assign(child, node.clone(), partitions, states, ops).await;
                        (batch, result)
                    }
                })
                .collect();

            let mut stopped = false;
            for (batch, result) in futures::future::join_all(wave).await {
                match result {
                    Ok(()) => {
                        let mut moves = self.moves.lock();
                        for pm in &batch {
                            if let Some(nm) = moves.get_mut(&pm.partition) {
                                nm.next += 1;
                                self.progress.tot_moves_done += 1;
                            }
                        }
                    }
                    Err(Error::Stopped) => {
                        stopped = true;
                    }
                    Err(e) => {
                        warn!("orchestrator: assign batch failed, err: {e}");
                        self.progress.tot_assign_errs += 1;
                        self.progress.errors.push(e.to_string());
                        // Abandon the failed partitions' remaining moves so
                        // other partitions can still make progress.
                        let mut moves = self.moves.lock();
                        for pm in &batch {
                            if let Some(nm) = moves.get_mut(&pm.partition) {
                                nm.next = nm.moves.len();
                            }
                        }
                    }
                }
            }

            let _ = self.progress_tx.send(self.progress.clone()).await;

            if stopped {
                break;
            }
        }

        let _ = self.progress_tx.send(self.progress.clone()).await;
        // Dropping progress_tx closes the channel, the terminal signal.
    }

    /// Gathers the next wave: per node, up to `cap` pending moves chosen by
    /// the selector, in deterministic partition order.
    fn next_batches(&self) -> Vec<(String, Vec<PendingMove>)> {
        let moves = self.moves.lock();

        let mut pending_by_node: HashMap<String, Vec<PendingMove>> = HashMap::new();
        let mut partitions: Vec<&NextMoves> = moves.values().collect();
        partitions.sort_by(|a, b| a.partition.cmp(&b.partition));

        for nm in partitions {
            if nm.next >= nm.moves.len() {
                continue;
            }
            let m = &nm.moves[nm.next];
            pending_by_node
                .entry(m.node.clone())
                .or_default()
                .push(PendingMove {
                    partition: nm.partition.clone(),
                    node: m.node.clone(),
                    state: m.state.clone(),
                    op: m.op.clone(),
                });
        }

        let mut batches: Vec<(String, Vec<PendingMove>)> = pending_by_node
            .into_iter()
            .map(|(node, mut pending)| {
                let mut batch = Vec::new();
                while batch.len() < self.cap && !pending.is_empty() {
                    let i = (self.selector)(&pending).min(pending.len() - 1);
                    batch.push(pending.remove(i));
                }
                (node, batch)
            })
            .collect();
        batches.sort_by(|a, b| a.0.cmp(&b.0));
        batches
    }
}
