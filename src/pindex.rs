//! Index partitions (pindexes)
//!
//! A PIndex is the live, local materialization of one PlanPIndex: the
//! implementation handle plus the Dest that feeds write into. Identifying
//! fields are persisted in a PINDEX_META file alongside the
//! implementation's data directory so a node can reopen its partitions
//! after a restart.

use crate::defs::{PlanPIndex, PlanPIndexNode};
use crate::feed::Dest;
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use tracing::warn;

pub const PINDEX_META_FILENAME: &str = "PINDEX_META";
const PINDEX_PATH_SUFFIX: &str = ".pindex";

/// An opaque handle to a concrete index implementation.
pub trait PIndexImpl: Send + Sync {
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Invoked by an implementation when its pindex needs a close-and-reopen
/// cycle (e.g. after an internal fault).
pub type RestartFn = Arc<dyn Fn() + Send + Sync>;

/// A registration of a single pindex implementation type.
#[async_trait]
pub trait PIndexImplType: Send + Sync {
    /// Creates a brand new pindex's implementation structures and files.
    async fn new_pindex(
        &self,
        index_type: &str,
        index_params: &str,
        path: &Path,
        restart: RestartFn,
    ) -> Result<(Arc<dyn PIndexImpl>, Arc<dyn Dest>)>;

    /// Reopens a previously created pindex from its files.
    async fn open_pindex(
        &self,
        index_type: &str,
        index_params: &str,
        path: &Path,
        restart: RestartFn,
    ) -> Result<(Arc<dyn PIndexImpl>, Arc<dyn Dest>)>;

    /// False for types that only exist as planning-time constructs (e.g.
    /// index aliases); the planner skips those.
    fn instantiatable(&self) -> bool {
        true
    }

    fn description(&self) -> &str;
}

static PINDEX_IMPL_TYPES: LazyLock<DashMap<String, Arc<dyn PIndexImplType>>> =
    LazyLock::new(DashMap::new);

/// Registers a pindex implementation type. Call during process init only.
pub fn register_pindex_impl_type(index_type: &str, t: Arc<dyn PIndexImplType>) {
    PINDEX_IMPL_TYPES.insert(index_type.to_string(), t);
}

pub fn pindex_impl_type(index_type: &str) -> Option<Arc<dyn PIndexImplType>> {
    PINDEX_IMPL_TYPES.get(index_type).map(|e| e.value().clone())
}

/// True when the type is registered and produces real pindexes.
pub fn pindex_impl_type_instantiatable(index_type: &str) -> bool {
    pindex_impl_type(index_type).map(|t| t.instantiatable()).unwrap_or(false)
}

// ---------------------------------------------------------------

/// The persisted identity of a pindex (the PINDEX_META document).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PIndexMeta {
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
    #[serde(rename = "sourcePartitions", default)]
    pub source_partitions: String,
}

/// A live local index partition.
pub struct PIndex {
    pub meta: PIndexMeta,
    pub path: PathBuf,
    pub impl_handle: Option<Arc<dyn PIndexImpl>>,
    pub dest: Option<Arc<dyn Dest>>,
    source_partitions_set: HashSet<String>,
    closed: AtomicBool,
}

impl std::fmt::Debug for PIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PIndex")
            .field("name", &self.meta.name)
            .field("uuid", &self.meta.uuid)
            .field("path", &self.path)
            .finish()
    }
}

impl PIndex {
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn uuid(&self) -> &str {
        &self.meta.uuid
    }

    /// True when this pindex owns the given source partition.
    pub fn covers_source_partition(&self, partition: &str) -> bool {
        self.source_partitions_set.contains(partition)
    }

    pub fn source_partitions(&self) -> &HashSet<String> {
        &self.source_partitions_set
    }

    /// Closes the pindex, optionally removing its stored files. Safe to
    /// call more than once.
    pub async fn close(&self, remove: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(dest) = &self.dest {
            dest.close().await?;
        }

        if remove {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                warn!(path = %self.path.display(), "pindex: remove failed, err: {e}");
            }
        }

        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn from_meta(
        meta: PIndexMeta,
        path: PathBuf,
        impl_handle: Arc<dyn PIndexImpl>,
        dest: Arc<dyn Dest>,
    ) -> Self {
        let source_partitions_set = split_source_partitions(&meta.source_partitions);
        Self {
            meta,
            path,
            impl_handle: Some(impl_handle),
            dest: Some(dest),
            source_partitions_set,
            closed: AtomicBool::new(false),
        }
    }

    /// A registry entry without implementation structures, for tests.
    #[cfg(test)]
    pub(crate) fn bare(meta: PIndexMeta, path: PathBuf) -> Self {
        let source_partitions_set = split_source_partitions(&meta.source_partitions);
        Self {
            meta,
            path,
            impl_handle: None,
            dest: None,
            source_partitions_set,
            closed: AtomicBool::new(false),
        }
    }
}

fn split_source_partitions(source_partitions: &str) -> HashSet<String> {
    source_partitions
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// The persisted meta for a pindex born from a plan entry.
pub fn meta_from_plan(plan_pindex: &PlanPIndex) -> PIndexMeta {
    PIndexMeta {
        name: plan_pindex.name.clone(),
        uuid: crate::defs::new_uuid(),
        index_type: plan_pindex.index_type.clone(),
        index_name: plan_pindex.index_name.clone(),
        index_uuid: plan_pindex.index_uuid.clone(),
        index_params: plan_pindex.index_params.clone(),
        source_type: plan_pindex.source_type.clone(),
        source_name: plan_pindex.source_name.clone(),
        source_uuid: plan_pindex.source_uuid.clone(),
        source_params: plan_pindex.source_params.clone(),
        source_partitions: plan_pindex.source_partitions.clone(),
    }
}

/// Creates a pindex, including its backend implementation structures and
/// files. Partially created state is torn down on failure.
pub async fn new_pindex(meta: PIndexMeta, path: PathBuf, restart: RestartFn) -> Result<PIndex> {
    let impl_type = pindex_impl_type(&meta.index_type).ok_or_else(|| {
        Error::MalformedConfig(format!("pindex: unknown indexType: {}", meta.index_type))
    })?;

    std::fs::create_dir_all(&path)?;

    let (impl_handle, dest) = match impl_type
        .new_pindex(&meta.index_type, &meta.index_params, &path, restart)
        .await
    {
        Ok(x) => x,
        Err(e) => {
            let _ = std::fs::remove_dir_all(&path);
            return Err(Error::Internal(format!(
                "pindex: new indexType: {}, path: {}, err: {e}",
                meta.index_type,
                path.display()
            )));
        }
    };

    let buf = serde_json::to_vec(&meta)?;
    if let Err(e) = std::fs::write(path.join(PINDEX_META_FILENAME), buf) {
        let _ = dest.close().await;
        let _ = std::fs::remove_dir_all(&path);
        return Err(e.into());
    }

    Ok(PIndex::from_meta(meta, path, impl_handle, dest))
}

/// Reopens a previously created pindex from its directory.
pub async fn open_pindex(path: PathBuf, restart: RestartFn) -> Result<PIndex> {
    let buf = std::fs::read(path.join(PINDEX_META_FILENAME)).map_err(|e| {
        Error::Internal(format!(
            "pindex: could not load {PINDEX_META_FILENAME}, path: {}, err: {e}",
            path.display()
        ))
    })?;

    let meta: PIndexMeta = serde_json::from_slice(&buf).map_err(|e| {
        Error::MalformedConfig(format!(
            "pindex: could not parse meta, path: {}, err: {e}",
            path.display()
        ))
    })?;

    let impl_type = pindex_impl_type(&meta.index_type).ok_or_else(|| {
        Error::MalformedConfig(format!("pindex: unknown indexType: {}", meta.index_type))
    })?;

    let (impl_handle, dest) = impl_type
        .open_pindex(&meta.index_type, &meta.index_params, &path, restart)
        .await?;

    Ok(PIndex::from_meta(meta, path, impl_handle, dest))
}

/// Computes the storage path for a named pindex.
pub fn pindex_path(data_dir: &Path, pindex_name: &str) -> PathBuf {
    data_dir.join(format!("{pindex_name}{PINDEX_PATH_SUFFIX}"))
}

/// Retrieves a pindex name back from a storage path; `(_, false)` for paths
/// outside the data dir or without the pindex suffix.
pub fn parse_pindex_path(data_dir: &Path, pindex_path: &Path) -> (String, bool) {
    let Ok(rel) = pindex_path.strip_prefix(data_dir) else {
        return (String::new(), false);
    };
    let Some(file_name) = rel.to_str() else {
        return (String::new(), false);
    };
    if rel.components().count() != 1 {
        return (String::new(), false);
    }
    match file_name.strip_suffix(PINDEX_PATH_SUFFIX) {
        Some(name) if !name.is_empty() => (name.to_string(), true),
        _ => (String::new(), false),
    }
}

/// True when a live pindex corresponds to a plan entry. The name alone
/// decides: pindex names are a pure function of index identity plus the
/// source partition set.
pub fn pindex_matches_plan(pindex: &PIndex, plan_pindex: &PlanPIndex) -> bool {
    pindex.meta.name == plan_pindex.name
}

// ---------------------------------------------------------------
// Covering pindex types

/// A remote partition chosen for a covering set.
#[derive(Debug, Clone)]
pub struct RemotePlanPIndex {
    pub plan_pindex: PlanPIndex,
    pub node_def: crate::defs::NodeDef,
}

/// Filters nodes being considered for a covering set.
pub type PlanPIndexFilter = fn(&PlanPIndexNode) -> bool;

/// The arguments identifying a covering computation; used as the covering
/// cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CoveringPIndexesSpec {
    pub index_name: String,
    pub index_uuid: String,
    pub plan_pindex_filter_name: String,
}

/// A non-overlapping set of pindexes (local or remote) that covers all the
/// partitions of an index for scatter/gather.
#[derive(Debug, Clone, Default)]
pub struct CoveringPIndexes {
    pub local_pindexes: Vec<Arc<PIndex>>,
    pub remote_plan_pindexes: Vec<RemotePlanPIndex>,
    pub missing_pindex_names: Vec<String>,
}

pub fn plan_pindex_node_ok(_node: &PlanPIndexNode) -> bool {
    true
}

pub fn plan_pindex_node_can_read(node: &PlanPIndexNode) -> bool {
    node.can_read
}

static PLAN_PINDEX_FILTERS: LazyLock<HashMap<&'static str, PlanPIndexFilter>> =
    LazyLock::new(|| {
        let mut m: HashMap<&'static str, PlanPIndexFilter> = HashMap::new();
        m.insert("ok", plan_pindex_node_ok);
        m.insert("canRead", plan_pindex_node_can_read);
        m
    });

/// The registered covering filters ("ok", "canRead").
pub fn plan_pindex_filter(name: &str) -> Option<PlanPIndexFilter> {
    PLAN_PINDEX_FILTERS.get(name).copied()
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::feed::Dest;
    use tokio_util::sync::CancellationToken;

    pub struct StubImpl;

    impl PIndexImpl for StubImpl {
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    pub struct StubDest;

    #[async_trait]
    impl Dest for StubDest {
        async fn data_update(&self, _p: &str, _k: &[u8], _s: u64, _v: &[u8]) -> Result<()> {
            Ok(())
        }
        async fn data_delete(&self, _p: &str, _k: &[u8], _s: u64) -> Result<()> {
            Ok(())
        }
        async fn snapshot_start(&self, _p: &str, _s: u64, _e: u64) -> Result<()> {
            Ok(())
        }
        async fn opaque_get(&self, _p: &str) -> Result<(Vec<u8>, u64)> {
            Ok((Vec::new(), 0))
        }
        async fn opaque_set(&self, _p: &str, _v: &[u8]) -> Result<()> {
            Ok(())
        }
        async fn rollback(&self, _p: &str, _s: u64) -> Result<()> {
            Ok(())
        }
        async fn consistency_wait(
            &self,
            _p: &str,
            _l: &str,
            _s: u64,
            _c: CancellationToken,
        ) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    /// A pindex impl type whose open fails with a corruption error when a
    /// marker file is present, for data-dir recovery tests.
    pub struct StubImplType;

    #[async_trait]
    impl PIndexImplType for StubImplType {
        async fn new_pindex(
            &self,
            _index_type: &str,
            _index_params: &str,
            _path: &Path,
            _restart: RestartFn,
        ) -> Result<(Arc<dyn PIndexImpl>, Arc<dyn Dest>)> {
            Ok((Arc::new(StubImpl), Arc::new(StubDest)))
        }

        async fn open_pindex(
            &self,
            _index_type: &str,
            _index_params: &str,
            path: &Path,
            _restart: RestartFn,
        ) -> Result<(Arc<dyn PIndexImpl>, Arc<dyn Dest>)> {
            if path.join("CRASHED").exists() {
                return Err(Error::CorruptPIndex(format!(
                    "crash marker present: {}",
                    path.display()
                )));
            }
            Ok((Arc::new(StubImpl), Arc::new(StubDest)))
        }

        fn description(&self) -> &str {
            "stub pindex impl type for tests"
        }
    }

    pub fn register_stub_impl_type(index_type: &str) {
        register_pindex_impl_type(index_type, Arc::new(StubImplType));
    }

    pub fn noop_restart() -> RestartFn {
        Arc::new(|| {})
    }
}
