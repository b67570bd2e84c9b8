//! Janitor: reconciles local pindexes and feeds against the plan
//!
//! On each kick the janitor reads the current plan, diffs the subset of
//! PlanPIndexes naming this node against the live local registry, closes
//! or removes extraneous pindexes, creates missing ones, and re-wires
//! data-source feeds. Failures are logged and healed on the next kick.

use crate::cfg::{CfgEvent, PLAN_PINDEXES_DIRECTORY_STAMP, PLAN_PINDEXES_KEY};
use crate::defs::PlanPIndex;
use crate::feed::{feed_type, SourceSpec};
use crate::manager::{Manager, WorkOp, WorkReq};
use crate::pindex::{meta_from_plan, new_pindex, PIndex};
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

impl Manager {
    /// Sends a synchronous no-op through the janitor queue.
    pub async fn janitor_noop(&self, msg: &str) {
        self.stats.tot_janitor_noop.fetch_add(1, Ordering::Relaxed);
        if self.has_tag("janitor") {
            let _ = self.sync_janitor_work(WorkOp::Noop, msg).await;
        }
    }

    /// Synchronously kicks the janitor, waiting for the reconciliation
    /// pass to finish.
    pub async fn janitor_kick(&self, msg: &str) {
        self.stats.tot_janitor_kick.fetch_add(1, Ordering::Relaxed);
        if self.has_tag("janitor") {
            let _ = self.sync_janitor_work(WorkOp::Kick, msg).await;
        }
    }

    /// The janitor's main loop: subscribe to plan changes and reconcile on
    /// each kick, one request at a time.
    pub(crate) async fn janitor_loop(self: Arc<Self>, mut work_rx: mpsc::Receiver<WorkReq>) {
        if let Some(cfg) = self.cfg() {
            let (event_tx, mut event_rx) = mpsc::channel::<CfgEvent>(16);
            let _ = cfg.subscribe(PLAN_PINDEXES_KEY, event_tx.clone());
            let _ = cfg.subscribe(PLAN_PINDEXES_DIRECTORY_STAMP, event_tx);

            let mgr = self.clone();
            let stop = self.stop.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        event = event_rx.recv() => {
                            let Some(event) = event else { return };
                            mgr.stats
                                .tot_janitor_subscription_event
                                .fetch_add(1, Ordering::Relaxed);
                            mgr.janitor_kick(&format!("cfg changed, key: {}", event.key)).await;
                        }
                    }
                }
            });
        }

        loop {
            let req = tokio::select! {
                _ = self.stop.cancelled() => {
                    self.stats.tot_janitor_stop.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                req = work_rx.recv() => match req {
                    Some(req) => req,
                    None => return,
                },
            };

            self.stats.tot_janitor_op_start.fetch_add(1, Ordering::Relaxed);
            debug!(msg = req.msg, "janitor: awakes");

            let result = match req.op {
                WorkOp::Kick => match self.janitor_once(&req.msg).await {
                    Err(e) => {
                        // Keep looping; rely on the next kick to heal.
                        warn!("janitor: janitor_once, err: {e}");
                        self.stats.tot_janitor_kick_err.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }
                    Ok(()) => {
                        self.stats.tot_janitor_kick_ok.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }
                },
                WorkOp::Noop => {
                    self.stats.tot_janitor_noop_ok.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                WorkOp::ClosePIndex(pindex) => {
                    self.stats.tot_janitor_close_pindex.fetch_add(1, Ordering::Relaxed);
                    self.stop_pindex(&pindex, false).await
                }
                WorkOp::RemovePIndex(pindex) => {
                    self.stats.tot_janitor_remove_pindex.fetch_add(1, Ordering::Relaxed);
                    self.stop_pindex(&pindex, true).await
                }
            };

            if let Some(reply) = req.reply {
                let _ = reply.send(result);
            }
            self.stats.tot_janitor_op_done.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// One reconciliation pass: make local pindexes and feeds match the
    /// subset of the plan that names this node.
    pub async fn janitor_once(self: &Arc<Self>, reason: &str) -> Result<()> {
        debug!(reason, "janitor: once");

        if self.cfg().is_none() {
            return Err(Error::Internal("janitor: skipped due to nil cfg".to_string()));
        }

        let (plan, _) = self.get_plan_pindexes(true).await?;

        // The partitions this node should be running.
        let mut wanted: HashMap<String, PlanPIndex> = HashMap::new();
        let mut planned_names: HashSet<String> = HashSet::new();
        if let Some(plan) = &plan {
            for (name, plan_pindex) in &plan.plan_pindexes {
                planned_names.insert(name.clone());
                if plan_pindex.nodes.contains_key(self.uuid()) {
                    wanted.insert(name.clone(), plan_pindex.clone());
                }
            }
        }

        let (_, pindexes) = self.current_maps();

        // Tear down pindexes the plan no longer assigns here. When the
        // partition is gone from the plan entirely (index deleted), its
        // files go too; when it merely moved to another node, files stay
        // for a possible future reassignment.
        let mut to_stop: Vec<(Arc<PIndex>, bool)> = Vec::new();
        for (name, pindex) in pindexes.iter() {
            if !wanted.contains_key(name) {
                let remove_files = !planned_names.contains(name);
                to_stop.push((pindex.clone(), remove_files));
            }
        }

        for (pindex, remove_files) in to_stop {
            info!(
                pindex = pindex.name(),
                remove_files, "janitor: stopping pindex"
            );
            if let Err(e) = self.stop_pindex(&pindex, remove_files).await {
                warn!(pindex = pindex.name(), "janitor: stop pindex, err: {e}");
            }
        }

        // Create pindexes the plan assigns here but that are not running.
        let mut to_start: Vec<&PlanPIndex> = wanted
            .values()
            .filter(|p| !pindexes.contains_key(&p.name) && !self.booting_pindex(&p.name))
            .collect();
        to_start.sort_by(|a, b| a.name.cmp(&b.name));

        for plan_pindex in to_start {
            info!(pindex = plan_pindex.name, "janitor: starting pindex");
            if let Err(e) = self.start_pindex(plan_pindex).await {
                warn!(pindex = plan_pindex.name, "janitor: start pindex, err: {e}");
            }
        }

        self.reconcile_feeds().await;

        Ok(())
    }

    async fn start_pindex(self: &Arc<Self>, plan_pindex: &PlanPIndex) -> Result<()> {
        let meta = meta_from_plan(plan_pindex);
        let path = self.pindex_path(&meta.name);
        let restart = self.restart_fn(&meta.name);
        let pindex = new_pindex(meta, path, restart).await?;
        self.register_pindex(Arc::new(pindex))
    }

    /// Closes a pindex, unregisters it and its feed, and optionally
    /// removes its files.
    pub(crate) async fn stop_pindex(&self, pindex: &Arc<PIndex>, remove_files: bool) -> Result<()> {
        // The feed must stop before the dest under it goes away.
        if let Some(feed) = self.unregister_feed(pindex.name()) {
            if let Err(e) = feed.close().await {
                warn!(feed = feed.name(), "janitor: feed close, err: {e}");
            }
        }

        self.unregister_pindex(pindex.name(), Some(pindex));
        pindex.close(remove_files).await
    }

    /// Aligns the feed registry with the pindex registry: one feed per
    /// live pindex, keyed by the pindex name.
    async fn reconcile_feeds(self: &Arc<Self>) {
        let (feeds, pindexes) = self.current_maps();

        for (name, feed) in feeds.iter() {
            if !pindexes.contains_key(name) {
                info!(feed = name, "janitor: closing orphaned feed");
                self.unregister_feed(name);
                if let Err(e) = feed.close().await {
                    warn!(feed = name, "janitor: feed close, err: {e}");
                }
            }
        }

        for (name, pindex) in pindexes.iter() {
            if feeds.contains_key(name) {
                continue;
            }
            if let Err(e) = self.start_feed(pindex).await {
                error!(pindex = name, "janitor: could not start feed, err: {e}");
            }
        }
    }

    async fn start_feed(self: &Arc<Self>, pindex: &Arc<PIndex>) -> Result<()> {
        let meta = &pindex.meta;
        let Some(ft) = feed_type(&meta.source_type) else {
            return Err(Error::MalformedConfig(format!(
                "janitor: unknown sourceType: {}",
                meta.source_type
            )));
        };

        let Some(dest) = pindex.dest.clone() else {
            return Err(Error::Internal(format!(
                "janitor: pindex has no dest, name: {}",
                meta.name
            )));
        };

        let mut dests = HashMap::new();
        for partition in pindex.source_partitions() {
            dests.insert(partition.clone(), dest.clone());
        }

        let spec = SourceSpec {
            source_type: meta.source_type.clone(),
            source_name: meta.source_name.clone(),
            source_uuid: meta.source_uuid.clone(),
            source_params: meta.source_params.clone(),
            server: self.server().to_string(),
            options: self.options_map(),
        };

        let feed = match ft
            .start_feed(&meta.name, &meta.index_name, &meta.index_uuid, &spec, dests)
            .await
        {
            Ok(feed) => feed,
            Err(e) => {
                if let Some(handlers) = self.event_handlers() {
                    handlers.on_feed_error(&meta.source_type, &meta.name, &e);
                }
                return Err(e);
            }
        };

        self.register_feed(feed.clone())?;
        feed.start().await
    }
}
