//! Cfg: the cluster-wide, CAS-versioned key/value store
//!
//! Every piece of cluster metadata (index definitions, node definitions,
//! partition plans, the schema version) lives under a well-known key in a
//! Cfg provider. Writers coordinate through compare-and-swap; subscribers
//! get best-effort change notifications and must re-read on event.

mod file;
mod mem;

pub use file::CfgFile;
pub use mem::CfgMem;

use crate::defs::{ClusterOptions, IndexDefs, NodeDefs, PlanPIndexes};
use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Key holding the cluster's metadata schema version (raw semver bytes).
pub const VERSION_KEY: &str = "version";

/// Key holding the index definitions aggregate.
pub const INDEX_DEFS_KEY: &str = "indexDefs";

/// Node-def kind for nodes that are reachable members of the cluster.
pub const NODE_DEFS_KNOWN: &str = "known";

/// Node-def kind for nodes that are wanted to participate in the cluster.
pub const NODE_DEFS_WANTED: &str = "wanted";

/// Key holding the partition plan aggregate.
pub const PLAN_PINDEXES_KEY: &str = "planPIndexes";

/// Opaque change-stamp key touched on every plan write, for event fan-out.
pub const PLAN_PINDEXES_DIRECTORY_STAMP: &str = "planPIndexes-directory-stamp";

/// Key holding the cluster-level manager options.
pub const MANAGER_CLUSTER_OPTIONS_KEY: &str = "manager_cluster_options_key";

/// CAS value meaning "any stored version" on reads and writes.
pub const CAS_ANY: u64 = 0;

/// CAS value that forces a write regardless of the stored cas.
pub const CAS_FORCE: u64 = u64::MAX;

/// Returns the Cfg key for a node-defs kind (known or wanted).
pub fn cfg_node_defs_key(kind: &str) -> String {
    format!("nodeDefs-{kind}")
}

/// A change notification for a single Cfg key. Delivery is best-effort;
/// consumers re-read the key rather than trusting event payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfgEvent {
    pub key: String,
}

/// The abstract CAS key/value contract every Cfg provider satisfies.
///
/// Guarantees: per-key writes are totally ordered by cas; there are no
/// transactions across keys; event delivery may coalesce or drop.
#[async_trait]
pub trait Cfg: Send + Sync {
    /// Reads a key. `cas == CAS_ANY` accepts any stored version. A missing
    /// key yields `Ok(None)`.
    async fn get(&self, key: &str, cas: u64) -> Result<Option<(Vec<u8>, u64)>>;

    /// Writes a key, returning the new cas. With `cas == CAS_ANY` the key
    /// must not already exist (create-only); `CAS_FORCE` overwrites
    /// unconditionally; any other value must match the stored cas.
    async fn set(&self, key: &str, val: &[u8], cas: u64) -> Result<u64>;

    /// Deletes a key. `cas == CAS_ANY` deletes regardless of version.
    async fn del(&self, key: &str, cas: u64) -> Result<()>;

    /// Registers a change-notification channel for a key.
    fn subscribe(&self, key: &str, sender: mpsc::Sender<CfgEvent>) -> Result<()>;
}

// ---------------------------------------------------------------

/// Runs a read-transform-write closure, retrying only on CAS conflicts, with
/// a small exponential backoff between attempts.
pub async fn cas_retry<T, F, Fut>(max_tries: u32, what: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut backoff = Duration::from_millis(2);
    for _ in 0..max_tries {
        match f().await {
            Err(e) if e.is_cas_mismatch() => {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_millis(250));
            }
            other => return other,
        }
    }
    Err(Error::TooManyRetries(what.to_string()))
}

// ---------------------------------------------------------------
// Typed accessors for the well-known keys. Setters bump the aggregate UUID
// and stamp the implVersion so readers can reject documents written by a
// newer schema.

/// Reads the stored cluster version string, or the given default when the
/// version key is absent or unreadable.
pub async fn cfg_get_version(cfg: &dyn Cfg, default: &str) -> String {
    match cfg.get(VERSION_KEY, CAS_ANY).await {
        Ok(Some((val, _))) => String::from_utf8_lossy(&val).into_owned(),
        _ => default.to_string(),
    }
}

pub async fn cfg_get_index_defs(cfg: &dyn Cfg) -> Result<Option<(IndexDefs, u64)>> {
    match cfg.get(INDEX_DEFS_KEY, CAS_ANY).await? {
        None => Ok(None),
        Some((val, cas)) => Ok(Some((serde_json::from_slice(&val)?, cas))),
    }
}

pub async fn cfg_set_index_defs(cfg: &dyn Cfg, index_defs: &IndexDefs, cas: u64) -> Result<u64> {
    let val = serde_json::to_vec(index_defs)?;
    cfg.set(INDEX_DEFS_KEY, &val, cas).await
}

pub async fn cfg_get_node_defs(cfg: &dyn Cfg, kind: &str) -> Result<Option<(NodeDefs, u64)>> {
    match cfg.get(&cfg_node_defs_key(kind), CAS_ANY).await? {
        None => Ok(None),
        Some((val, cas)) => Ok(Some((serde_json::from_slice(&val)?, cas))),
    }
}

pub async fn cfg_set_node_defs(
    cfg: &dyn Cfg,
    kind: &str,
    node_defs: &NodeDefs,
    cas: u64,
) -> Result<u64> {
    let val = serde_json::to_vec(node_defs)?;
    cfg.set(&cfg_node_defs_key(kind), &val, cas).await
}

/// Removes one node's entry from a node-defs aggregate, performing a single
/// read-modify-write attempt; the caller loops on CAS conflicts.
pub async fn cfg_remove_node_def(
    cfg: &dyn Cfg,
    kind: &str,
    node_uuid: &str,
    version: &str,
) -> Result<()> {
    let (mut node_defs, cas) = match cfg_get_node_defs(cfg, kind).await? {
        None => return Ok(()),
        Some(x) => x,
    };
    if node_defs.node_defs.remove(node_uuid).is_none() {
        return Ok(());
    }
    node_defs.uuid = crate::defs::new_uuid();
    node_defs.impl_version = version.to_string();
    cfg_set_node_defs(cfg, kind, &node_defs, cas).await?;
    Ok(())
}

pub async fn cfg_get_plan_pindexes(cfg: &dyn Cfg) -> Result<Option<(PlanPIndexes, u64)>> {
    match cfg.get(PLAN_PINDEXES_KEY, CAS_ANY).await? {
        None => Ok(None),
        Some((val, cas)) => Ok(Some((serde_json::from_slice(&val)?, cas))),
    }
}

/// Writes the plan aggregate and touches the directory stamp so that
/// subscribers watching either key get a nudge.
pub async fn cfg_set_plan_pindexes(
    cfg: &dyn Cfg,
    plan_pindexes: &PlanPIndexes,
    cas: u64,
) -> Result<u64> {
    let val = serde_json::to_vec(plan_pindexes)?;
    let new_cas = cfg.set(PLAN_PINDEXES_KEY, &val, cas).await?;
    let stamp = crate::defs::new_uuid();
    if let Err(e) = cfg
        .set(PLAN_PINDEXES_DIRECTORY_STAMP, stamp.as_bytes(), CAS_FORCE)
        .await
    {
        tracing::warn!("cfg: could not touch plan directory stamp, err: {e}");
    }
    Ok(new_cas)
}

pub async fn cfg_get_cluster_options(cfg: &dyn Cfg) -> Result<Option<(ClusterOptions, u64)>> {
    match cfg.get(MANAGER_CLUSTER_OPTIONS_KEY, CAS_ANY).await? {
        None => Ok(None),
        Some((val, cas)) => Ok(Some((serde_json::from_slice(&val)?, cas))),
    }
}

pub async fn cfg_set_cluster_options(
    cfg: &dyn Cfg,
    options: &ClusterOptions,
    cas: u64,
) -> Result<u64> {
    let val = serde_json::to_vec(options)?;
    let cas = if cas == CAS_ANY { CAS_FORCE } else { cas };
    cfg.set(MANAGER_CLUSTER_OPTIONS_KEY, &val, cas).await
}

// ---------------------------------------------------------------
// Failure-injecting Cfg wrappers, used by tests across the crate.

/// A Cfg whose every operation fails with a transport error.
#[derive(Debug, Default)]
pub struct ErrorOnlyCfg;

#[async_trait]
impl Cfg for ErrorOnlyCfg {
    async fn get(&self, _key: &str, _cas: u64) -> Result<Option<(Vec<u8>, u64)>> {
        Err(Error::Transport("error only".to_string()))
    }

    async fn set(&self, _key: &str, _val: &[u8], _cas: u64) -> Result<u64> {
        Err(Error::Transport("error only".to_string()))
    }

    async fn del(&self, _key: &str, _cas: u64) -> Result<()> {
        Err(Error::Transport("error only".to_string()))
    }

    fn subscribe(&self, _key: &str, _sender: mpsc::Sender<CfgEvent>) -> Result<()> {
        Err(Error::Transport("error only".to_string()))
    }
}

/// A Cfg that forwards to an inner provider until N operations have
/// happened, then fails every operation after that.
pub struct ErrorAfterCfg<C: Cfg> {
    pub inner: C,
    pub err_after: u64,
    ops: std::sync::atomic::AtomicU64,
}

impl<C: Cfg> ErrorAfterCfg<C> {
    pub fn new(inner: C, err_after: u64) -> Self {
        Self {
            inner,
            err_after,
            ops: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn tick(&self) -> Result<()> {
        let n = self.ops.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if n >= self.err_after {
            return Err(Error::Transport(format!("error after {} ops", self.err_after)));
        }
        Ok(())
    }
}

#[async_trait]
impl<C: Cfg> Cfg for ErrorAfterCfg<C> {
    async fn get(&self, key: &str, cas: u64) -> Result<Option<(Vec<u8>, u64)>> {
        self.tick()?;
        self.inner.get(key, cas).await
    }

    async fn set(&self, key: &str, val: &[u8], cas: u64) -> Result<u64> {
        self.tick()?;
        self.inner.set(key, val, cas).await
    }

    async fn del(&self, key: &str, cas: u64) -> Result<()> {
        self.tick()?;
        self.inner.del(key, cas).await
    }

    fn subscribe(&self, key: &str, sender: mpsc::Sender<CfgEvent>) -> Result<()> {
        self.inner.subscribe(key, sender)
    }
}

/// A Cfg that fails the first N operations, then forwards to the inner
/// provider.
pub struct ErrorUntilCfg<C: Cfg> {
    pub inner: C,
    pub err_until: u64,
    ops: std::sync::atomic::AtomicU64,
}

impl<C: Cfg> ErrorUntilCfg<C> {
    pub fn new(inner: C, err_until: u64) -> Self {
        Self {
            inner,
            err_until,
            ops: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn tick(&self) -> Result<()> {
        let n = self.ops.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if n < self.err_until {
            return Err(Error::Transport(format!("error until {} ops", self.err_until)));
        }
        Ok(())
    }
}

#[async_trait]
impl<C: Cfg> Cfg for ErrorUntilCfg<C> {
    async fn get(&self, key: &str, cas: u64) -> Result<Option<(Vec<u8>, u64)>> {
        self.tick()?;
        self.inner.get(key, cas).await
    }

    async fn set(&self, key: &str, val: &[u8], cas: u64) -> Result<u64> {
        self.tick()?;
        self.inner.set(key, val, cas).await
    }

    async fn del(&self, key: &str, cas: u64) -> Result<()> {
        self.tick()?;
        self.inner.del(key, cas).await
    }

    fn subscribe(&self, key: &str, sender: mpsc::Sender<CfgEvent>) -> Result<()> {
        self.inner.subscribe(key, sender)
    }
}
