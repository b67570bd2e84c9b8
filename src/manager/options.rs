//! Cluster-level manager options
//!
//! The manager carries a copy-on-write string options map plus a
//! strongly-typed ClusterOptions mirror stored under a Cfg key. SetOptions
//! writes both; RefreshOptions merges the cluster copy into the local
//! cache when the Cfg copy changes.

use super::Manager;
use crate::cfg::{cfg_get_cluster_options, cfg_set_cluster_options, CAS_ANY};
use crate::defs::ClusterOptions;
use crate::Result;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use tracing::debug;

/// The option-map keys mirrored into ClusterOptions.
const FEED_ALLOTMENT: &str = "feedAllotment";
const MAX_REPLICAS_ALLOWED: &str = "maxReplicasAllowed";
const MAX_CONCURRENT_PARTITION_MOVES_PER_NODE: &str = "maxConcurrentPartitionMovesPerNode";
const ENABLE_VERBOSE_LOGGING: &str = "enableVerboseLogging";
const SLOW_OP_LOG_TIMEOUT: &str = "slowOpLogTimeout";

/// Extracts the cluster-level options from a string options map.
pub fn cluster_options_from_map(options: &HashMap<String, String>) -> ClusterOptions {
    let get = |key: &str| options.get(key).cloned().unwrap_or_default();
    ClusterOptions {
        feed_allotment: get(FEED_ALLOTMENT),
        max_replicas_allowed: get(MAX_REPLICAS_ALLOWED),
        max_concurrent_partition_moves_per_node: get(MAX_CONCURRENT_PARTITION_MOVES_PER_NODE),
        enable_verbose_logging: get(ENABLE_VERBOSE_LOGGING),
        slow_op_log_timeout: get(SLOW_OP_LOG_TIMEOUT),
    }
}

/// Merges the non-empty fields of cluster options into a string options
/// map, returning the merged copy.
pub fn merge_cluster_options(
    options: &HashMap<String, String>,
    cluster: &ClusterOptions,
) -> HashMap<String, String> {
    let mut merged = options.clone();
    for (key, value) in [
        (FEED_ALLOTMENT, &cluster.feed_allotment),
        (MAX_REPLICAS_ALLOWED, &cluster.max_replicas_allowed),
        (
            MAX_CONCURRENT_PARTITION_MOVES_PER_NODE,
            &cluster.max_concurrent_partition_moves_per_node,
        ),
        (ENABLE_VERBOSE_LOGGING, &cluster.enable_verbose_logging),
        (SLOW_OP_LOG_TIMEOUT, &cluster.slow_op_log_timeout),
    ] {
        if !value.is_empty() {
            merged.insert(key.to_string(), value.clone());
        }
    }
    merged
}

impl Manager {
    /// Replaces the options map, writing the cluster-level subset to the
    /// Cfg so that peers pick it up.
    pub async fn set_options(&self, options: HashMap<String, String>) -> Result<()> {
        if let Some(cfg) = self.cfg() {
            let cluster = cluster_options_from_map(&options);
            cfg_set_cluster_options(cfg.as_ref(), &cluster, CAS_ANY).await?;
        }
        self.swap_options(options);
        self.stats.tot_set_options.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Applies newer values from the cluster-level options into the local
    /// options cache.
    pub async fn refresh_options(&self) -> Result<()> {
        let Some(cfg) = self.cfg() else {
            return Ok(());
        };
        let Some((cluster, _)) = cfg_get_cluster_options(cfg.as_ref()).await? else {
            return Ok(());
        };
        let merged = merge_cluster_options(&self.options_map(), &cluster);
        debug!("manager: refreshed options from cluster");
        self.swap_options(merged);
        Ok(())
    }
}
