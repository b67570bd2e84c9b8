//! Data-source feeds
//!
//! A Feed is the live connection to an external data source, pumping
//! changes into one or more Dest instances (the write side of a pindex).
//! Concrete feed implementations register a FeedType per source type at
//! process startup; the registry is read-mostly afterwards.

use crate::defs::{IndexDef, UuidSeq};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tokio_util::sync::CancellationToken;

pub const FEED_SLEEP_INIT_MS: u64 = 100;
pub const FEED_SLEEP_MAX_MS: u64 = 10_000;
pub const FEED_BACKOFF_FACTOR: f64 = 1.5;

/// The write-side interface of a pindex; a Feed invokes these as source
/// data arrives.
#[async_trait]
pub trait Dest: Send + Sync {
    async fn data_update(&self, partition: &str, key: &[u8], seq: u64, val: &[u8]) -> Result<()>;

    async fn data_delete(&self, partition: &str, key: &[u8], seq: u64) -> Result<()>;

    /// Marks the start of a consistent snapshot covering [seq_start,
    /// seq_end] for a partition.
    async fn snapshot_start(&self, partition: &str, seq_start: u64, seq_end: u64) -> Result<()>;

    /// Retrieves opaque per-partition state plus the last persisted seq.
    async fn opaque_get(&self, partition: &str) -> Result<(Vec<u8>, u64)>;

    async fn opaque_set(&self, partition: &str, value: &[u8]) -> Result<()>;

    /// Rolls the partition back to at most the given seq.
    async fn rollback(&self, partition: &str, rollback_seq: u64) -> Result<()>;

    /// Blocks until the partition has indexed up to the given seq, or the
    /// token fires.
    async fn consistency_wait(
        &self,
        partition: &str,
        consistency_level: &str,
        consistency_seq: u64,
        cancel: CancellationToken,
    ) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// An abstract data source connection, hooked up to one or more Dests.
#[async_trait]
pub trait Feed: Send + Sync {
    fn name(&self) -> &str;

    fn index_name(&self) -> &str;

    async fn start(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Keyed by source partition identifier.
    fn dests(&self) -> HashMap<String, Arc<dyn Dest>>;

    fn stats(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Identifies one data source binding: type, name, integrity UUID, params,
/// plus the server and manager options a feed may need to reach it.
#[derive(Debug, Clone, Default)]
pub struct SourceSpec {
    pub source_type: String,
    pub source_name: String,
    pub source_uuid: String,
    pub source_params: String,
    pub server: String,
    pub options: HashMap<String, String>,
}

/// A registration of a single feed / data source type.
#[async_trait]
pub trait FeedType: Send + Sync {
    /// Starts a feed instance wired to the given dests.
    async fn start_feed(
        &self,
        feed_name: &str,
        index_name: &str,
        index_uuid: &str,
        spec: &SourceSpec,
        dests: HashMap<String, Arc<dyn Dest>>,
    ) -> Result<Arc<dyn Feed>>;

    /// The data source's current partition identifiers.
    async fn partitions(&self, spec: &SourceSpec) -> Result<Vec<String>>;

    /// The data source's current partitions and their seqs, when the
    /// source supports it.
    async fn partition_seqs(&self, _spec: &SourceSpec) -> Result<Option<HashMap<String, UuidSeq>>> {
        Ok(None)
    }

    /// Source-dependent stats, when available.
    async fn source_stats(
        &self,
        _spec: &SourceSpec,
        _stats_kind: &str,
    ) -> Result<Option<serde_json::Value>> {
        Ok(None)
    }

    /// Looks up the source partition holding a document id, when the
    /// source supports it.
    async fn partition_lookup(
        &self,
        _doc_id: &str,
        _server: &str,
        _index_def: &IndexDef,
    ) -> Result<Option<String>> {
        Ok(None)
    }

    /// The sourceUUID for a source name, when the source supports lookup.
    async fn source_uuid_lookup(&self, _spec: &SourceSpec) -> Result<String> {
        Ok(String::new())
    }

    /// Whether user APIs should advertise this feed type.
    fn public(&self) -> bool {
        false
    }

    fn description(&self) -> &str;

    /// An example sourceParams document for user APIs.
    fn start_sample(&self) -> Option<serde_json::Value> {
        None
    }
}

/// Optional sourceParams fields that stop ingest once per-partition seqs
/// have been reached ("one-time indexing").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StopAfterSourceParams {
    /// Valid values: "", "markReached".
    #[serde(rename = "stopAfter", default)]
    pub stop_after: String,
    /// Keyed by source partition.
    #[serde(rename = "markPartitionSeqs", default)]
    pub mark_partition_seqs: HashMap<String, UuidSeq>,
}

// ---------------------------------------------------------------

static FEED_TYPES: LazyLock<DashMap<String, Arc<dyn FeedType>>> = LazyLock::new(DashMap::new);

/// Registers a feed type for a source type. Call during process init only;
/// the registry is read-mostly afterwards.
pub fn register_feed_type(source_type: &str, feed_type: Arc<dyn FeedType>) {
    FEED_TYPES.insert(source_type.to_string(), feed_type);
}

/// Looks up the feed type registered for a source type.
pub fn feed_type(source_type: &str) -> Option<Arc<dyn FeedType>> {
    FEED_TYPES.get(source_type).map(|e| e.value().clone())
}

/// Names of all registered feed types.
pub fn feed_type_names() -> Vec<String> {
    FEED_TYPES.iter().map(|e| e.key().clone()).collect()
}

/// The data source partitions for a source spec, via its registered feed
/// type.
pub async fn data_source_partitions(spec: &SourceSpec) -> Result<Vec<String>> {
    let ft = feed_type(&spec.source_type).ok_or_else(|| {
        Error::MalformedConfig(format!("feed: unknown sourceType: {}", spec.source_type))
    })?;
    ft.partitions(spec).await
}

/// Parses and validates sourceParams, transforming a
/// `"markPartitionSeqs": "currentPartitionSeqs"` request into the source's
/// actual current seqs. Returns the possibly-rewritten sourceParams.
pub async fn data_source_prep_params(spec: &SourceSpec) -> Result<String> {
    data_source_partitions(spec).await?;

    if spec.source_params.is_empty() {
        return Ok(String::new());
    }

    let ft = feed_type(&spec.source_type).ok_or_else(|| {
        Error::MalformedConfig(format!("feed: unknown sourceType: {}", spec.source_type))
    })?;

    let mut params: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(&spec.source_params).map_err(|e| {
            Error::MalformedConfig(format!(
                "feed: json parse sourceParams: {}, err: {e}",
                spec.source_params
            ))
        })?;

    if params.get("markPartitionSeqs").and_then(|v| v.as_str())
        == Some("currentPartitionSeqs")
    {
        if let Some(partition_seqs) = ft.partition_seqs(spec).await? {
            params.insert(
                "markPartitionSeqs".to_string(),
                serde_json::to_value(partition_seqs)?,
            );
            return Ok(serde_json::to_string(&params)?);
        }
    }

    Ok(spec.source_params.clone())
}

/// Fetches the sourceUUID for a source, when the feed type supports it.
pub async fn data_source_uuid(spec: &SourceSpec) -> Result<String> {
    let ft = feed_type(&spec.source_type).ok_or_else(|| {
        Error::MalformedConfig(format!("feed: unknown sourceType: {}", spec.source_type))
    })?;
    ft.source_uuid_lookup(spec).await
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use parking_lot::Mutex;

    /// A feed that records lifecycle calls; enough for janitor and planner
    /// tests.
    pub struct StubFeed {
        pub feed_name: String,
        pub feed_index_name: String,
        pub dests: HashMap<String, Arc<dyn Dest>>,
        pub started: Mutex<bool>,
        pub closed: Mutex<bool>,
    }

    #[async_trait]
    impl Feed for StubFeed {
        fn name(&self) -> &str {
            &self.feed_name
        }

        fn index_name(&self) -> &str {
            &self.feed_index_name
        }

        async fn start(&self) -> Result<()> {
            *self.started.lock() = true;
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            *self.closed.lock() = true;
            Ok(())
        }

        fn dests(&self) -> HashMap<String, Arc<dyn Dest>> {
            self.dests.clone()
        }
    }

    /// A feed type over a fixed partition list.
    pub struct StubFeedType {
        pub partition_ids: Vec<String>,
    }

    #[async_trait]
    impl FeedType for StubFeedType {
        async fn start_feed(
            &self,
            feed_name: &str,
            index_name: &str,
            _index_uuid: &str,
            _spec: &SourceSpec,
            dests: HashMap<String, Arc<dyn Dest>>,
        ) -> Result<Arc<dyn Feed>> {
            Ok(Arc::new(StubFeed {
                feed_name: feed_name.to_string(),
                feed_index_name: index_name.to_string(),
                dests,
                started: Mutex::new(false),
                closed: Mutex::new(false),
            }))
        }

        async fn partitions(&self, _spec: &SourceSpec) -> Result<Vec<String>> {
            Ok(self.partition_ids.clone())
        }

        fn description(&self) -> &str {
            "stub feed type for tests"
        }
    }

    /// Registers a stub feed type producing partitions "0".."n-1".
    pub fn register_stub_source(source_type: &str, num_partitions: usize) {
        register_feed_type(
            source_type,
            Arc::new(StubFeedType {
                partition_ids: (0..num_partitions).map(|i| i.to_string()).collect(),
            }),
        );
    }
}
