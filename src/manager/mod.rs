//! Manager: the per-node process hosting planner + janitor
//!
//! A Manager owns the node's live registries (feeds and pindexes), its
//! cached snapshots of Cfg aggregates, the planner and janitor work
//! queues, and the recovery-plan persistence path. Although often used
//! like a singleton, multiple Manager instances can be created in one
//! process to simulate a cluster of nodes.

mod options;
mod recovery;

pub use recovery::is_stable_plan;

use crate::cfg::{
    cfg_get_index_defs, cfg_get_node_defs, cfg_get_plan_pindexes, cfg_get_version,
    cfg_node_defs_key, cfg_remove_node_def, cfg_set_node_defs, cas_retry, Cfg, CfgEvent,
    INDEX_DEFS_KEY, MANAGER_CLUSTER_OPTIONS_KEY, NODE_DEFS_KNOWN, NODE_DEFS_WANTED,
    PLAN_PINDEXES_DIRECTORY_STAMP, PLAN_PINDEXES_KEY,
};
use crate::defs::{new_uuid, IndexDef, IndexDefs, NodeDef, NodeDefs, PlanPIndex, PlanPIndexes};
use crate::feed::Feed;
use crate::pindex::{
    open_pindex, parse_pindex_path, pindex_path, CoveringPIndexes, CoveringPIndexesSpec, PIndex,
    RestartFn,
};
use crate::rest::{default_http_client, HttpClient};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Limits the number of diagnostic events tracked by a Manager.
pub const MANAGER_MAX_EVENTS: usize = 10;

const WORK_QUEUE_DEPTH: usize = 16;

/// How a node (un)registers itself with the Cfg on start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterMode {
    /// Don't change any Cfg registrations for this node.
    Unchanged,
    /// Register this node as known (reachable).
    Known,
    /// Same as Known, but force a Cfg rewrite even when unchanged.
    KnownForce,
    /// Register this node as known and wanted.
    Wanted,
    /// Same as Wanted, but force a Cfg rewrite even when unchanged.
    WantedForce,
    /// Unregister from the wanted map.
    Unwanted,
    /// Unregister from both the wanted and known maps.
    Unknown,
}

impl std::str::FromStr for RegisterMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unchanged" => Ok(Self::Unchanged),
            "known" => Ok(Self::Known),
            "knownForce" => Ok(Self::KnownForce),
            "wanted" => Ok(Self::Wanted),
            "wantedForce" => Ok(Self::WantedForce),
            "unwanted" => Ok(Self::Unwanted),
            "unknown" => Ok(Self::Unknown),
            other => Err(Error::MalformedConfig(format!(
                "manager: unknown register mode: {other}"
            ))),
        }
    }
}

/// Callback interface for applications that want Manager lifecycle events.
pub trait ManagerEventHandlers: Send + Sync {
    fn on_register_pindex(&self, pindex: &PIndex);
    fn on_unregister_pindex(&self, pindex: &PIndex);
    fn on_feed_error(&self, source_type: &str, feed_name: &str, err: &Error);
}

/// Stats/metrics tracked by a Manager instance.
#[derive(Debug, Default)]
pub struct ManagerStats {
    pub tot_kick: AtomicU64,
    pub tot_set_options: AtomicU64,

    pub tot_register_feed: AtomicU64,
    pub tot_unregister_feed: AtomicU64,
    pub tot_register_pindex: AtomicU64,
    pub tot_unregister_pindex: AtomicU64,

    pub tot_load_data_dir: AtomicU64,

    pub tot_save_node_def: AtomicU64,
    pub tot_save_node_def_same: AtomicU64,
    pub tot_save_node_def_retry: AtomicU64,
    pub tot_save_node_def_ok: AtomicU64,

    pub tot_planner_noop: AtomicU64,
    pub tot_planner_noop_ok: AtomicU64,
    pub tot_planner_kick: AtomicU64,
    pub tot_planner_kick_changed: AtomicU64,
    pub tot_planner_kick_err: AtomicU64,
    pub tot_planner_kick_ok: AtomicU64,
    pub tot_planner_op_start: AtomicU64,
    pub tot_planner_op_done: AtomicU64,
    pub tot_planner_subscription_event: AtomicU64,
    pub tot_planner_stop: AtomicU64,

    pub tot_janitor_noop: AtomicU64,
    pub tot_janitor_noop_ok: AtomicU64,
    pub tot_janitor_kick: AtomicU64,
    pub tot_janitor_kick_err: AtomicU64,
    pub tot_janitor_kick_ok: AtomicU64,
    pub tot_janitor_close_pindex: AtomicU64,
    pub tot_janitor_remove_pindex: AtomicU64,
    pub tot_janitor_op_start: AtomicU64,
    pub tot_janitor_op_done: AtomicU64,
    pub tot_janitor_subscription_event: AtomicU64,
    pub tot_janitor_stop: AtomicU64,

    pub tot_refresh_last_node_defs: AtomicU64,
    pub tot_refresh_last_index_defs: AtomicU64,
    pub tot_refresh_last_plan_pindexes: AtomicU64,
}

pub(crate) enum WorkOp {
    Kick,
    Noop,
    ClosePIndex(Arc<PIndex>),
    RemovePIndex(Arc<PIndex>),
}

pub(crate) struct WorkReq {
    pub op: WorkOp,
    pub msg: String,
    pub reply: Option<oneshot::Sender<Result<()>>>,
}

/// Construction parameters for a Manager.
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    /// The node's metadata schema version (see the version module).
    pub version: String,
    /// Unique to every Manager instance; survives restarts via the
    /// `<baseName>.uuid` file.
    pub uuid: String,
    pub tags: Vec<String>,
    /// '/'-separated containment path (optional).
    pub container: String,
    pub weight: i32,
    pub extras: String,
    pub bind_http: String,
    pub data_dir: PathBuf,
    /// The default data source server; multiple urls permitted with ';'
    /// delimiter.
    pub server: String,
    pub options: HashMap<String, String>,
}

struct ManagerState {
    options: Arc<HashMap<String, String>>,
    container: String,
    feeds: Arc<HashMap<String, Arc<dyn Feed>>>,
    pindexes: Arc<HashMap<String, Arc<PIndex>>>,
    booting_pindexes: HashSet<String>,
    last_node_defs: HashMap<String, Arc<NodeDefs>>,
    last_index_defs: Option<Arc<IndexDefs>>,
    last_index_defs_by_name: Arc<HashMap<String, IndexDef>>,
    last_plan_pindexes: Option<Arc<PlanPIndexes>>,
    last_plan_pindexes_by_name: Arc<HashMap<String, Vec<PlanPIndex>>>,
    covering_cache: HashMap<CoveringPIndexesSpec, (u64, Arc<CoveringPIndexes>)>,
    events: VecDeque<serde_json::Value>,
}

/// A runtime node in a cluster, hosting the planner and janitor loops.
pub struct Manager {
    start_time: chrono::DateTime<chrono::Utc>,
    version: String,
    cfg: Option<Arc<dyn Cfg>>,
    uuid: String,
    tags: Vec<String>,
    tags_map: Option<HashSet<String>>,
    weight: i32,
    extras: String,
    bind_http: String,
    data_dir: PathBuf,
    server: String,
    pub(crate) stop: CancellationToken,

    state: Mutex<ManagerState>,

    pub(crate) planner_tx: mpsc::Sender<WorkReq>,
    planner_rx: Mutex<Option<mpsc::Receiver<WorkReq>>>,
    pub(crate) janitor_tx: mpsc::Sender<WorkReq>,
    janitor_rx: Mutex<Option<mpsc::Receiver<WorkReq>>>,

    event_handlers: Option<Arc<dyn ManagerEventHandlers>>,
    pub(crate) stats: ManagerStats,
    pub(crate) stable_plan_lock: Arc<tokio::sync::RwLock<()>>,
    http: Arc<dyn HttpClient>,
}

impl Manager {
    /// Returns a new, ready-to-be-started Manager instance.
    pub fn new(
        config: ManagerConfig,
        cfg: Option<Arc<dyn Cfg>>,
        event_handlers: Option<Arc<dyn ManagerEventHandlers>>,
    ) -> Arc<Self> {
        Self::new_with_http(config, cfg, event_handlers, default_http_client())
    }

    /// `new` with an injected HTTP client, for tests.
    pub fn new_with_http(
        config: ManagerConfig,
        cfg: Option<Arc<dyn Cfg>>,
        event_handlers: Option<Arc<dyn ManagerEventHandlers>>,
        http: Arc<dyn HttpClient>,
    ) -> Arc<Self> {
        let tags_map = if config.tags.is_empty() {
            None
        } else {
            Some(config.tags.iter().cloned().collect())
        };

        let (planner_tx, planner_rx) = mpsc::channel(WORK_QUEUE_DEPTH);
        let (janitor_tx, janitor_rx) = mpsc::channel(WORK_QUEUE_DEPTH);

        Arc::new(Self {
            start_time: chrono::Utc::now(),
            version: config.version,
            cfg,
            uuid: config.uuid,
            tags: config.tags,
            tags_map,
            weight: config.weight,
            extras: config.extras,
            bind_http: config.bind_http,
            data_dir: config.data_dir,
            server: config.server,
            stop: CancellationToken::new(),
            state: Mutex::new(ManagerState {
                options: Arc::new(config.options),
                container: config.container,
                feeds: Arc::new(HashMap::new()),
                pindexes: Arc::new(HashMap::new()),
                booting_pindexes: HashSet::new(),
                last_node_defs: HashMap::new(),
                last_index_defs: None,
                last_index_defs_by_name: Arc::new(HashMap::new()),
                last_plan_pindexes: None,
                last_plan_pindexes_by_name: Arc::new(HashMap::new()),
                covering_cache: HashMap::new(),
                events: VecDeque::new(),
            }),
            planner_tx,
            planner_rx: Mutex::new(Some(planner_rx)),
            janitor_tx,
            janitor_rx: Mutex::new(Some(janitor_rx)),
            event_handlers,
            stats: ManagerStats::default(),
            stable_plan_lock: Arc::new(tokio::sync::RwLock::new(())),
            http,
        })
    }

    /// Stops the process-lifetime loops; idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Starts and registers this Manager with its configured Cfg, then
    /// launches the planner/janitor loops and Cfg subscriptions according
    /// to the node's tags.
    pub async fn start(self: &Arc<Self>, register: RegisterMode) -> Result<()> {
        self.register(register).await?;

        if self.has_tag("pindex") {
            let mode = self.option("managerLoadDataDir");
            if mode.is_empty() || mode == "sync" || mode == "async" {
                self.load_data_dir(mode == "async").await?;
            }
        }

        if self.has_tag("planner") {
            if let Some(rx) = self.planner_rx.lock().take() {
                let mgr = self.clone();
                tokio::spawn(mgr.planner_loop(rx));
            }
            let mgr = self.clone();
            tokio::spawn(async move { mgr.planner_kick("start").await });
        }

        if self.has_tag("pindex") && self.has_tag("janitor") {
            if let Some(rx) = self.janitor_rx.lock().take() {
                let mgr = self.clone();
                tokio::spawn(mgr.janitor_loop(rx));
            }
            let mgr = self.clone();
            tokio::spawn(async move { mgr.janitor_kick("start").await });
        }

        self.start_cfg_subscriptions();

        Ok(())
    }

    /// Launches the Cfg subscription workers that keep the cached
    /// snapshots fresh.
    fn start_cfg_subscriptions(self: &Arc<Self>) {
        let Some(cfg) = self.cfg() else {
            return;
        };

        {
            let (tx, mut rx) = mpsc::channel::<CfgEvent>(WORK_QUEUE_DEPTH);
            let _ = cfg.subscribe(INDEX_DEFS_KEY, tx.clone());
            let _ = cfg.subscribe(MANAGER_CLUSTER_OPTIONS_KEY, tx);
            let mgr = self.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = mgr.stop.cancelled() => return,
                        event = rx.recv() => {
                            let Some(event) = event else { return };
                            if event.key == INDEX_DEFS_KEY {
                                let _ = mgr.get_index_defs(true).await;
                            } else {
                                let _ = mgr.refresh_options().await;
                            }
                        }
                    }
                }
            });
        }

        {
            let (tx, mut rx) = mpsc::channel::<CfgEvent>(WORK_QUEUE_DEPTH);
            let _ = cfg.subscribe(PLAN_PINDEXES_KEY, tx.clone());
            let _ = cfg.subscribe(PLAN_PINDEXES_DIRECTORY_STAMP, tx);
            let mgr = self.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = mgr.stop.cancelled() => return,
                        event = rx.recv() => {
                            if event.is_none() { return }
                            let _ = mgr.get_plan_pindexes(true).await;
                        }
                    }
                }
            });
        }

        for kind in [NODE_DEFS_KNOWN, NODE_DEFS_WANTED] {
            let (tx, mut rx) = mpsc::channel::<CfgEvent>(WORK_QUEUE_DEPTH);
            let _ = cfg.subscribe(&cfg_node_defs_key(kind), tx);
            let mgr = self.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = mgr.stop.cancelled() => return,
                        event = rx.recv() => {
                            if event.is_none() { return }
                            let _ = mgr.get_node_defs(kind, true).await;
                        }
                    }
                }
            });
        }
    }

    // ---------------------------------------------------------------

    /// Registers or unregisters this node in the Cfg per the mode.
    pub async fn register(&self, mode: RegisterMode) -> Result<()> {
        use RegisterMode::*;

        if mode == Unchanged {
            return Ok(());
        }

        if mode == Unwanted || mode == Unknown {
            self.remove_node_def(NODE_DEFS_WANTED).await?;
            if mode == Unknown {
                self.remove_node_def(NODE_DEFS_KNOWN).await?;
            }
            return Ok(());
        }

        match self.fetch_server_group_container().await {
            Ok(container) if !container.is_empty() => {
                self.state.lock().container = container;
            }
            Ok(_) => {}
            Err(e) => {
                error!("manager: fetch server groups failed, err: {e}");
            }
        }

        // Save our node def as known first; a wanted node is always known.
        self.save_node_def(NODE_DEFS_KNOWN, mode == KnownForce).await?;
        if mode == Wanted || mode == WantedForce {
            self.save_node_def(NODE_DEFS_WANTED, mode == WantedForce).await?;
        }
        Ok(())
    }

    /// Merges this node's NodeDef into the given kind's aggregate with a
    /// CAS retry loop. A byte-identical existing entry skips the write
    /// unless forced.
    pub async fn save_node_def(&self, kind: &str, force: bool) -> Result<()> {
        self.stats.tot_save_node_def.fetch_add(1, Ordering::Relaxed);

        let Some(cfg) = self.cfg() else {
            return Ok(()); // Occurs during testing.
        };

        let node_def = NodeDef {
            host_port: self.bind_http.clone(),
            uuid: self.uuid.clone(),
            impl_version: self.version.clone(),
            tags: self.tags.clone(),
            container: self.container(),
            weight: self.weight,
            extras: self.extras.clone(),
        };

        let mut first_attempt = true;
        cas_retry(100, "saveNodeDef", || {
            let cfg = cfg.clone();
            let node_def = node_def.clone();
            if !first_attempt {
                self.stats.tot_save_node_def_retry.fetch_add(1, Ordering::Relaxed);
            }
            first_attempt = false;
            async move {
                let (mut node_defs, cas) = match cfg_get_node_defs(cfg.as_ref(), kind).await? {
                    Some(x) => x,
                    None => (NodeDefs::new(&self.version), crate::cfg::CAS_ANY),
                };

                if !force {
                    if let Some(prev) = node_defs.node_defs.get(&node_def.uuid) {
                        if *prev == node_def {
                            self.stats.tot_save_node_def_same.fetch_add(1, Ordering::Relaxed);
                            self.stats.tot_save_node_def_ok.fetch_add(1, Ordering::Relaxed);
                            return Ok(());
                        }
                    }
                }

                node_defs.uuid = new_uuid();
                node_defs.node_defs.insert(node_def.uuid.clone(), node_def);
                node_defs.impl_version = cfg_get_version(cfg.as_ref(), &self.version).await;
                debug!(
                    impl_version = node_defs.impl_version,
                    "manager: saving node defs"
                );

                cfg_set_node_defs(cfg.as_ref(), kind, &node_defs, cas).await?;
                self.stats.tot_save_node_def_ok.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        })
        .await
    }

    /// Removes this node's NodeDef from a kind's aggregate, retrying CAS
    /// conflicts.
    pub async fn remove_node_def(&self, kind: &str) -> Result<()> {
        let Some(cfg) = self.cfg() else {
            return Ok(()); // Occurs during testing.
        };

        cas_retry(100, "removeNodeDef", || {
            let cfg = cfg.clone();
            async move {
                let version = cfg_get_version(cfg.as_ref(), &self.version).await;
                cfg_remove_node_def(cfg.as_ref(), kind, &self.uuid, &version).await
            }
        })
        .await
    }

    /// Derives this node's container from the server's server-group
    /// topology, when the server exposes one.
    async fn fetch_server_group_container(&self) -> Result<String> {
        if self.server.is_empty() {
            return Ok(String::new());
        }

        #[derive(Deserialize)]
        struct ServerGroups {
            #[serde(default)]
            groups: Vec<ServerGroup>,
        }
        #[derive(Deserialize)]
        struct ServerGroup {
            #[serde(default)]
            name: String,
            #[serde(default)]
            nodes: Vec<NodeDetail>,
        }
        #[derive(Deserialize)]
        struct NodeDetail {
            #[serde(rename = "nodeUUID", default)]
            node_uuid: String,
        }

        let url = format!("{}/pools/default/serverGroups", self.server);
        let body = self.http.get(&url).await?;
        let sg: ServerGroups = serde_json::from_slice(&body)
            .map_err(|e| Error::MalformedConfig(format!("manager: serverGroups parse, err: {e}")))?;

        for group in sg.groups {
            if group.nodes.iter().any(|n| n.node_uuid == self.uuid) {
                return Ok(format!("datacenter/{}", group.name));
            }
        }
        Ok(String::new())
    }

    // ---------------------------------------------------------------
    // Booting flags guard the data-dir load path against racing the
    // janitor on the same pindex.

    pub(crate) fn booting_pindex(&self, pindex_name: &str) -> bool {
        self.state.lock().booting_pindexes.contains(pindex_name)
    }

    /// Names of pindexes currently mid-boot from the data dir; empty once
    /// a data-dir load has completed.
    pub fn booting_pindexes(&self) -> Vec<String> {
        self.state.lock().booting_pindexes.iter().cloned().collect()
    }

    /// Flips a pindex's booting status; returns false when the janitor
    /// already owns the pindex, in which case the caller must skip it.
    fn update_booting_status(&self, pindex_name: &str, booting: bool) -> bool {
        if pindex_name.is_empty() {
            return true;
        }
        let mut state = self.state.lock();
        if !booting {
            state.booting_pindexes.remove(pindex_name);
            return true;
        }
        if state.pindexes.contains_key(pindex_name) {
            return false;
        }
        state.booting_pindexes.insert(pindex_name.to_string());
        true
    }

    /// Walks the data dir and re-registers pindexes left by a previous
    /// run, opening them on a bounded worker pool. With `detach` the work
    /// continues in the background after this call returns.
    pub async fn load_data_dir(self: &Arc<Self>, detach: bool) -> Result<()> {
        info!(data_dir = %self.data_dir.display(), "manager: loading dataDir...");

        let entries = std::fs::read_dir(&self.data_dir).map_err(|e| {
            Error::Internal(format!(
                "manager: could not read dataDir: {}, err: {e}",
                self.data_dir.display()
            ))
        })?;

        let mut reqs: Vec<(PathBuf, String)> = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let (name, ok) = parse_pindex_path(&self.data_dir, &path);
            if ok {
                reqs.push((path, name));
            }
        }
        reqs.sort();

        let n_workers = worker_count(reqs.len());
        let mut shards: Vec<Vec<(PathBuf, String)>> = vec![Vec::new(); n_workers];
        for (i, req) in reqs.into_iter().enumerate() {
            shards[i % n_workers].push(req);
        }

        let mut handles = Vec::new();
        for shard in shards {
            let mgr = self.clone();
            handles.push(tokio::spawn(async move {
                for (path, name) in shard {
                    mgr.load_one_pindex(path, name).await;
                }
            }));
        }

        let mgr = self.clone();
        let waiter = async move {
            for handle in handles {
                let _ = handle.await;
            }
            mgr.stats.tot_load_data_dir.fetch_add(1, Ordering::Relaxed);
            info!("manager: loading dataDir... done");
        };

        if detach {
            tokio::spawn(waiter);
        } else {
            waiter.await;
        }

        Ok(())
    }

    async fn load_one_pindex(self: &Arc<Self>, path: PathBuf, name: String) {
        // The janitor may have beaten us to this pindex after its first
        // kick; if so, leave it alone.
        if !self.update_booting_status(&name, true) {
            return;
        }

        match open_pindex(path.clone(), self.restart_fn(&name)).await {
            Ok(pindex) => {
                let _ = self.register_pindex(Arc::new(pindex));
                // Kick the janitor to finish the boot ceremony (feed
                // hookups); on failure we rely on the janitor's usual
                // healing pass instead.
                self.janitor_kick_async("loaded pindex from dataDir");
            }
            Err(Error::CorruptPIndex(msg)) => {
                warn!(
                    path = %path.display(),
                    "manager: open pindex found crash marker, cleaning up for rebuild: {msg}"
                );
                let _ = std::fs::remove_dir_all(&path);
            }
            Err(e) => {
                error!(path = %path.display(), "manager: could not open pindex, err: {e}");
            }
        }

        self.update_booting_status(&name, false);
    }

    /// The restart hook handed to pindex implementations: close the named
    /// pindex and kick the janitor to re-create it.
    pub(crate) fn restart_fn(self: &Arc<Self>, pindex_name: &str) -> RestartFn {
        let mgr = Arc::downgrade(self);
        let name = pindex_name.to_string();
        Arc::new(move || {
            let Some(mgr) = mgr.upgrade() else { return };
            let name = name.clone();
            tokio::spawn(async move {
                mgr.restart_pindex_by_name(&name).await;
            });
        })
    }

    pub(crate) async fn restart_pindex_by_name(self: &Arc<Self>, name: &str) {
        if let Some(pindex) = self.get_pindex(name) {
            if !pindex.is_closed() {
                let _ = self.close_pindex(&pindex).await;
            }
        }
        self.kick("restart-pindex").await;
    }

    // ---------------------------------------------------------------

    /// Schedules kicks of both the planner and janitor.
    pub async fn kick(&self, msg: &str) {
        self.stats.tot_kick.fetch_add(1, Ordering::Relaxed);
        self.planner_kick(msg).await;
        self.janitor_kick(msg).await;
    }

    pub(crate) async fn sync_planner_work(&self, op: WorkOp, msg: &str) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let req = WorkReq {
            op,
            msg: msg.to_string(),
            reply: Some(reply_tx),
        };
        if self.planner_tx.send(req).await.is_ok() {
            let _ = reply_rx.await;
        }
    }

    pub(crate) async fn sync_janitor_work(&self, op: WorkOp, msg: &str) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let req = WorkReq {
            op,
            msg: msg.to_string(),
            reply: Some(reply_tx),
        };
        if self.janitor_tx.send(req).await.is_err() {
            return Ok(());
        }
        reply_rx.await.unwrap_or(Ok(()))
    }

    /// Fire-and-forget janitor kick, for callers that must not block on
    /// the janitor queue.
    pub(crate) fn janitor_kick_async(self: &Arc<Self>, msg: &str) {
        let mgr = self.clone();
        let msg = msg.to_string();
        tokio::spawn(async move { mgr.janitor_kick(&msg).await });
    }

    /// Synchronously has the janitor close a pindex (files kept).
    pub async fn close_pindex(&self, pindex: &Arc<PIndex>) -> Result<()> {
        self.sync_janitor_work(WorkOp::ClosePIndex(pindex.clone()), "api-ClosePIndex")
            .await
    }

    /// Synchronously has the janitor remove a pindex (files deleted).
    pub async fn remove_pindex(&self, pindex: &Arc<PIndex>) -> Result<()> {
        self.sync_janitor_work(WorkOp::RemovePIndex(pindex.clone()), "api-RemovePIndex")
            .await
    }

    // ---------------------------------------------------------------
    // Registries. The maps are copy-on-write: mutations swap in a new map
    // under the lock so readers hold cheap snapshots.

    pub fn get_pindex(&self, pindex_name: &str) -> Option<Arc<PIndex>> {
        self.state.lock().pindexes.get(pindex_name).cloned()
    }

    pub(crate) fn register_pindex(&self, pindex: Arc<PIndex>) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.pindexes.contains_key(pindex.name()) {
                return Err(Error::Internal(format!(
                    "manager: registered pindex exists, name: {}",
                    pindex.name()
                )));
            }
            let mut pindexes = (*state.pindexes).clone();
            pindexes.insert(pindex.name().to_string(), pindex.clone());
            state.pindexes = Arc::new(pindexes);
        }
        self.stats.tot_register_pindex.fetch_add(1, Ordering::Relaxed);

        if let Some(handlers) = &self.event_handlers {
            handlers.on_register_pindex(&pindex);
        }
        Ok(())
    }

    /// Unregisters by name; with `to_match` set, only that exact instance
    /// is unregistered.
    pub(crate) fn unregister_pindex(
        &self,
        name: &str,
        to_match: Option<&Arc<PIndex>>,
    ) -> Option<Arc<PIndex>> {
        let removed = {
            let mut state = self.state.lock();
            let existing = state.pindexes.get(name)?;
            if let Some(to_match) = to_match {
                if !Arc::ptr_eq(existing, to_match) {
                    return None;
                }
            }
            let mut pindexes = (*state.pindexes).clone();
            let removed = pindexes.remove(name);
            state.pindexes = Arc::new(pindexes);
            removed
        };

        if let Some(pindex) = &removed {
            self.stats.tot_unregister_pindex.fetch_add(1, Ordering::Relaxed);
            if let Some(handlers) = &self.event_handlers {
                handlers.on_unregister_pindex(pindex);
            }
        }
        removed
    }

    pub(crate) fn register_feed(&self, feed: Arc<dyn Feed>) -> Result<()> {
        let mut state = self.state.lock();
        if state.feeds.contains_key(feed.name()) {
            return Err(Error::Internal(format!(
                "manager: registered feed already exists, name: {}",
                feed.name()
            )));
        }
        let mut feeds = (*state.feeds).clone();
        feeds.insert(feed.name().to_string(), feed);
        state.feeds = Arc::new(feeds);
        drop(state);
        self.stats.tot_register_feed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn unregister_feed(&self, name: &str) -> Option<Arc<dyn Feed>> {
        let removed = {
            let mut state = self.state.lock();
            if !state.feeds.contains_key(name) {
                return None;
            }
            let mut feeds = (*state.feeds).clone();
            let removed = feeds.remove(name);
            state.feeds = Arc::new(feeds);
            removed
        };
        if removed.is_some() {
            self.stats.tot_unregister_feed.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Snapshot of the current feed and pindex registries.
    pub fn current_maps(
        &self,
    ) -> (
        Arc<HashMap<String, Arc<dyn Feed>>>,
        Arc<HashMap<String, Arc<PIndex>>>,
    ) {
        let state = self.state.lock();
        (state.feeds.clone(), state.pindexes.clone())
    }

    // ---------------------------------------------------------------
    // Cached snapshots of Cfg aggregates, refreshed on subscription
    // events or on demand.

    /// Read-only snapshot of NodeDefs of a kind; `refresh` forces a Cfg
    /// read.
    pub async fn get_node_defs(&self, kind: &str, refresh: bool) -> Result<Option<Arc<NodeDefs>>> {
        if !refresh {
            if let Some(cached) = self.state.lock().last_node_defs.get(kind) {
                return Ok(Some(cached.clone()));
            }
        }

        let Some(cfg) = self.cfg() else {
            return Ok(None);
        };

        let node_defs = cfg_get_node_defs(cfg.as_ref(), kind)
            .await?
            .map(|(d, _)| Arc::new(d));

        let mut state = self.state.lock();
        if let Some(node_defs) = &node_defs {
            state.last_node_defs.insert(kind.to_string(), node_defs.clone());
        } else {
            state.last_node_defs.remove(kind);
        }
        drop(state);
        self.stats.tot_refresh_last_node_defs.fetch_add(1, Ordering::Relaxed);

        Ok(node_defs)
    }

    /// Read-only snapshot of the IndexDefs, plus IndexDefs organized by
    /// name; `refresh` forces a Cfg read.
    pub async fn get_index_defs(
        &self,
        refresh: bool,
    ) -> Result<(Option<Arc<IndexDefs>>, Arc<HashMap<String, IndexDef>>)> {
        {
            let state = self.state.lock();
            if state.last_index_defs.is_some() && !refresh {
                return Ok((
                    state.last_index_defs.clone(),
                    state.last_index_defs_by_name.clone(),
                ));
            }
        }

        let Some(cfg) = self.cfg() else {
            return Ok((None, Arc::new(HashMap::new())));
        };

        let index_defs = cfg_get_index_defs(cfg.as_ref()).await?.map(|(d, _)| Arc::new(d));
        let mut by_name = HashMap::new();
        if let Some(index_defs) = &index_defs {
            for index_def in index_defs.index_defs.values() {
                by_name.insert(index_def.name.clone(), index_def.clone());
            }
        }
        let by_name = Arc::new(by_name);

        {
            let mut state = self.state.lock();
            state.last_index_defs = index_defs.clone();
            state.last_index_defs_by_name = by_name.clone();
        }
        self.stats.tot_refresh_last_index_defs.fetch_add(1, Ordering::Relaxed);

        Ok((index_defs, by_name))
    }

    /// The IndexDef for a name, or Ok(None) when absent.
    pub async fn check_and_get_index_def(
        &self,
        index_name: &str,
        refresh: bool,
    ) -> Result<Option<IndexDef>> {
        let (_, by_name) = self.get_index_defs(refresh).await?;
        Ok(by_name.get(index_name).cloned())
    }

    /// Read-only snapshot of the PlanPIndexes, plus plan entries grouped
    /// by index name; `refresh` forces a Cfg read. A refreshed, changed,
    /// stable plan is persisted locally for failover recovery.
    pub async fn get_plan_pindexes(
        &self,
        refresh: bool,
    ) -> Result<(
        Option<Arc<PlanPIndexes>>,
        Arc<HashMap<String, Vec<PlanPIndex>>>,
    )> {
        {
            let state = self.state.lock();
            if state.last_plan_pindexes.is_some() && !refresh {
                return Ok((
                    state.last_plan_pindexes.clone(),
                    state.last_plan_pindexes_by_name.clone(),
                ));
            }
        }

        let Some(cfg) = self.cfg() else {
            return Ok((None, Arc::new(HashMap::new())));
        };

        let plan = cfg_get_plan_pindexes(cfg.as_ref()).await?.map(|(p, _)| Arc::new(p));

        let changed = {
            let state = self.state.lock();
            match (&state.last_plan_pindexes, &plan) {
                (Some(prev), Some(next)) => **prev != **next,
                (None, Some(_)) => true,
                _ => false,
            }
        };
        // Skip disk writes on repeated Cfg callbacks for the same plan.
        if changed {
            if let Some(plan) = &plan {
                self.check_and_store_stable_plan_pindexes(plan).await;
            }
        }

        let mut by_name: HashMap<String, Vec<PlanPIndex>> = HashMap::new();
        if let Some(plan) = &plan {
            for plan_pindex in plan.plan_pindexes.values() {
                by_name
                    .entry(plan_pindex.index_name.clone())
                    .or_default()
                    .push(plan_pindex.clone());
            }
        }
        let by_name = Arc::new(by_name);

        {
            let mut state = self.state.lock();
            state.last_plan_pindexes = plan.clone();
            state.last_plan_pindexes_by_name = by_name.clone();
        }
        self.stats
            .tot_refresh_last_plan_pindexes
            .fetch_add(1, Ordering::Relaxed);

        Ok((plan, by_name))
    }

    // ---------------------------------------------------------------
    // Covering cache plumbing; see the covering module for the selector.

    /// A version number over every input of the covering computation;
    /// cached entries are valid only while this number is unchanged.
    pub(crate) fn covering_cache_version(&self) -> u64 {
        self.stats.tot_refresh_last_node_defs.load(Ordering::Relaxed)
            + self.stats.tot_refresh_last_plan_pindexes.load(Ordering::Relaxed)
            + self.stats.tot_register_pindex.load(Ordering::Relaxed)
            + self.stats.tot_unregister_pindex.load(Ordering::Relaxed)
    }

    pub(crate) fn covering_cache_get(
        &self,
        spec: &CoveringPIndexesSpec,
    ) -> Option<Arc<CoveringPIndexes>> {
        let version = self.covering_cache_version();
        let state = self.state.lock();
        match state.covering_cache.get(spec) {
            Some((cached_version, covering)) if *cached_version == version => {
                Some(covering.clone())
            }
            _ => None,
        }
    }

    pub(crate) fn covering_cache_put(
        &self,
        spec: CoveringPIndexesSpec,
        covering: Arc<CoveringPIndexes>,
    ) {
        let version = self.covering_cache_version();
        self.state.lock().covering_cache.insert(spec, (version, covering));
    }

    // ---------------------------------------------------------------

    /// Appends a diagnostic event, keeping only the most recent few.
    pub fn add_event(&self, event: serde_json::Value) {
        let mut state = self.state.lock();
        while state.events.len() >= MANAGER_MAX_EVENTS {
            state.events.pop_front();
        }
        state.events.push_back(event);
    }

    pub fn events(&self) -> Vec<serde_json::Value> {
        self.state.lock().events.iter().cloned().collect()
    }

    // ---------------------------------------------------------------
    // Accessors.

    pub fn start_time(&self) -> chrono::DateTime<chrono::Utc> {
        self.start_time
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn cfg(&self) -> Option<Arc<dyn Cfg>> {
        self.cfg.clone()
    }

    /// The node UUID of this Manager.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// True when the node carries the tag, or carries no tags at all.
    pub fn has_tag(&self, tag: &str) -> bool {
        match &self.tags_map {
            None => true,
            Some(tags) => tags.contains(tag),
        }
    }

    pub fn container(&self) -> String {
        self.state.lock().container.clone()
    }

    pub fn weight(&self) -> i32 {
        self.weight
    }

    pub fn extras(&self) -> &str {
        &self.extras
    }

    pub fn bind_http(&self) -> &str {
        &self.bind_http
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub(crate) fn http(&self) -> Arc<dyn HttpClient> {
        self.http.clone()
    }

    pub(crate) fn event_handlers(&self) -> Option<Arc<dyn ManagerEventHandlers>> {
        self.event_handlers.clone()
    }

    /// Read-only snapshot of the options map.
    pub fn options_map(&self) -> HashMap<String, String> {
        (*self.state.lock().options).clone()
    }

    pub fn option(&self, key: &str) -> String {
        self.state
            .lock()
            .options
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn swap_options(&self, options: HashMap<String, String>) {
        self.state.lock().options = Arc::new(options);
    }

    pub fn stats(&self) -> &ManagerStats {
        &self.stats
    }

    /// The storage path for a named pindex under this Manager's data dir.
    pub fn pindex_path(&self, pindex_name: &str) -> PathBuf {
        pindex_path(&self.data_dir, pindex_name)
    }

    /// Recovers a pindex name from a path under this Manager's data dir.
    pub fn parse_pindex_path(&self, path: &Path) -> (String, bool) {
        parse_pindex_path(&self.data_dir, path)
    }
}

/// Picks a worker count for opening `n` pindexes, bounded by the host's
/// available parallelism.
pub(crate) fn worker_count(n: usize) -> usize {
    let cpus = std::thread::available_parallelism().map(|p| p.get()).unwrap_or(1);
    n.clamp(1, cpus)
}

/// Reuses a previous `<baseName>.uuid` file from the data dir when
/// present, else generates and persists a brand new node UUID.
pub fn load_or_create_node_uuid(data_dir: &Path, base_name: &str) -> Result<String> {
    let uuid_path = data_dir.join(format!("{base_name}.uuid"));

    let uuid = match std::fs::read_to_string(&uuid_path) {
        Ok(contents) => {
            let uuid = contents.trim().to_string();
            if uuid.is_empty() {
                return Err(Error::MalformedConfig(format!(
                    "manager: could not parse uuid file: {}",
                    uuid_path.display()
                )));
            }
            info!(uuid, "manager: node uuid reloaded");
            uuid
        }
        Err(_) => {
            let uuid = new_uuid();
            info!(uuid, "manager: node uuid generated");
            uuid
        }
    };

    std::fs::write(&uuid_path, &uuid).map_err(|e| {
        Error::Internal(format!(
            "manager: could not write uuid file: {}, err: {e}",
            uuid_path.display()
        ))
    })?;

    Ok(uuid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::CfgMem;

    fn test_manager(cfg: Option<Arc<dyn Cfg>>) -> Arc<Manager> {
        Manager::new(
            ManagerConfig {
                version: "5.5.0".to_string(),
                uuid: "node-test".to_string(),
                bind_http: "127.0.0.1:9200".to_string(),
                weight: 1,
                data_dir: std::env::temp_dir(),
                ..Default::default()
            },
            cfg,
            None,
        )
    }

    #[tokio::test]
    async fn save_node_def_writes_once_when_unchanged() {
        let cfg: Arc<dyn Cfg> = Arc::new(CfgMem::new());
        let mgr = test_manager(Some(cfg.clone()));

        mgr.save_node_def(NODE_DEFS_WANTED, false).await.unwrap();
        let (_, cas1) = cfg_get_node_defs(cfg.as_ref(), NODE_DEFS_WANTED)
            .await
            .unwrap()
            .unwrap();

        // Byte-identical node def: no second Cfg write.
        mgr.save_node_def(NODE_DEFS_WANTED, false).await.unwrap();
        let (_, cas2) = cfg_get_node_defs(cfg.as_ref(), NODE_DEFS_WANTED)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cas1, cas2);
        assert_eq!(mgr.stats.tot_save_node_def_same.load(Ordering::Relaxed), 1);

        // Forced: rewritten even though unchanged.
        mgr.save_node_def(NODE_DEFS_WANTED, true).await.unwrap();
        let (_, cas3) = cfg_get_node_defs(cfg.as_ref(), NODE_DEFS_WANTED)
            .await
            .unwrap()
            .unwrap();
        assert!(cas3 > cas2);
    }

    #[tokio::test]
    async fn register_modes_round_trip() {
        let cfg: Arc<dyn Cfg> = Arc::new(CfgMem::new());
        let mgr = test_manager(Some(cfg.clone()));

        mgr.register(RegisterMode::Wanted).await.unwrap();
        for kind in [NODE_DEFS_KNOWN, NODE_DEFS_WANTED] {
            let (defs, _) = cfg_get_node_defs(cfg.as_ref(), kind).await.unwrap().unwrap();
            assert!(defs.node_defs.contains_key("node-test"), "kind: {kind}");
            assert_eq!(defs.node_defs["node-test"].uuid, "node-test");
        }

        mgr.register(RegisterMode::Unwanted).await.unwrap();
        let (wanted, _) = cfg_get_node_defs(cfg.as_ref(), NODE_DEFS_WANTED)
            .await
            .unwrap()
            .unwrap();
        assert!(!wanted.node_defs.contains_key("node-test"));
        let (known, _) = cfg_get_node_defs(cfg.as_ref(), NODE_DEFS_KNOWN)
            .await
            .unwrap()
            .unwrap();
        assert!(known.node_defs.contains_key("node-test"));

        mgr.register(RegisterMode::Unknown).await.unwrap();
        let (known, _) = cfg_get_node_defs(cfg.as_ref(), NODE_DEFS_KNOWN)
            .await
            .unwrap()
            .unwrap();
        assert!(!known.node_defs.contains_key("node-test"));
    }

    #[tokio::test]
    async fn node_uuid_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let uuid1 = load_or_create_node_uuid(dir.path(), "mynode").unwrap();
        let uuid2 = load_or_create_node_uuid(dir.path(), "mynode").unwrap();
        assert_eq!(uuid1, uuid2);

        let uuid3 = load_or_create_node_uuid(dir.path(), "other").unwrap();
        assert_ne!(uuid1, uuid3);
    }

    #[test]
    fn worker_count_bounds() {
        assert_eq!(worker_count(0), 1);
        assert!(worker_count(1) >= 1);
        let cpus = std::thread::available_parallelism().map(|p| p.get()).unwrap_or(1);
        assert!(worker_count(10_000) <= cpus);
    }

    #[test]
    fn event_ring_is_bounded() {
        let mgr = test_manager(None);
        for i in 0..25 {
            mgr.add_event(serde_json::json!({ "i": i }));
        }
        let events = mgr.events();
        assert_eq!(events.len(), MANAGER_MAX_EVENTS);
        assert_eq!(events[0]["i"], 15);
        assert_eq!(events[9]["i"], 24);
    }

    #[test]
    fn register_mode_parse() {
        use std::str::FromStr;
        assert_eq!(RegisterMode::from_str("wanted").unwrap(), RegisterMode::Wanted);
        assert_eq!(
            RegisterMode::from_str("knownForce").unwrap(),
            RegisterMode::KnownForce
        );
        assert!(RegisterMode::from_str("bogus").is_err());
    }
}
