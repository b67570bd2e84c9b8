//! Covering pindex selection for scatter/gather
//!
//! Chooses a non-overlapping cover of a logical index's partitions across
//! local and remote nodes: per partition, the lowest-priority assigned
//! node that hosts pindexes and passes the caller's filter, with ties
//! broken toward the local node when it has the partition open. Results
//! are cached per spec and invalidated whenever any input (node defs,
//! plan, local registry) changes.

use crate::cfg::NODE_DEFS_WANTED;
use crate::manager::Manager;
use crate::pindex::{
    plan_pindex_filter, plan_pindex_node_ok, CoveringPIndexes, CoveringPIndexesSpec,
    PlanPIndexFilter, RemotePlanPIndex,
};
use crate::{Error, Result};
use std::sync::Arc;

impl Manager {
    /// The strict covering form: errors when any partition has no
    /// serving node.
    pub async fn covering_pindexes(
        &self,
        index_name: &str,
        index_uuid: &str,
        filter: Option<PlanPIndexFilter>,
        want_kind: &str,
    ) -> Result<CoveringPIndexes> {
        let covering = self
            .covering_pindexes_ex(
                CoveringPIndexesSpec {
                    index_name: index_name.to_string(),
                    index_uuid: index_uuid.to_string(),
                    plan_pindex_filter_name: String::new(),
                },
                filter,
                false,
            )
            .await?;

        if !covering.missing_pindex_names.is_empty() {
            return Err(Error::MissingPartitions(
                covering.missing_pindex_names.clone(),
            ));
        }
        let _ = want_kind;
        Ok((*covering).clone())
    }

    /// The best-effort covering form: missing partitions are returned by
    /// name instead of erroring.
    pub async fn covering_pindexes_best_effort(
        &self,
        index_name: &str,
        index_uuid: &str,
        filter: Option<PlanPIndexFilter>,
    ) -> Result<CoveringPIndexes> {
        let covering = self
            .covering_pindexes_ex(
                CoveringPIndexesSpec {
                    index_name: index_name.to_string(),
                    index_uuid: index_uuid.to_string(),
                    plan_pindex_filter_name: String::new(),
                },
                filter,
                false,
            )
            .await?;
        Ok((*covering).clone())
    }

    /// Computes (or returns cached) covering pindexes for a spec. With an
    /// explicit filter the cache is bypassed, since closures are not
    /// cacheable keys; otherwise the spec's named filter applies and the
    /// result is cached until any covering input changes.
    pub async fn covering_pindexes_ex(
        &self,
        spec: CoveringPIndexesSpec,
        filter: Option<PlanPIndexFilter>,
        no_cache: bool,
    ) -> Result<Arc<CoveringPIndexes>> {
        let cacheable = filter.is_none() && !no_cache;

        if cacheable {
            if let Some(cached) = self.covering_cache_get(&spec) {
                return Ok(cached);
            }
        }

        let effective_filter = filter
            .or_else(|| plan_pindex_filter(&spec.plan_pindex_filter_name))
            .unwrap_or(plan_pindex_node_ok);

        let covering = Arc::new(
            self.covering_pindexes_compute(&spec.index_name, &spec.index_uuid, effective_filter)
                .await?,
        );

        if cacheable {
            self.covering_cache_put(spec, covering.clone());
        }

        Ok(covering)
    }

    async fn covering_pindexes_compute(
        &self,
        index_name: &str,
        index_uuid: &str,
        filter: PlanPIndexFilter,
    ) -> Result<CoveringPIndexes> {
        let node_defs = self
            .get_node_defs(NODE_DEFS_WANTED, false)
            .await?
            .ok_or_else(|| {
                Error::Internal("pindex: could not get wanted nodeDefs".to_string())
            })?;

        let (_, plan_by_name) = self.get_plan_pindexes(false).await?;
        let Some(plan_pindexes) = plan_by_name.get(index_name).filter(|v| !v.is_empty()) else {
            return Err(Error::Internal(format!(
                "pindex: no planPIndexes for indexName: {index_name}"
            )));
        };

        let (_, pindexes) = self.current_maps();
        let self_uuid = self.uuid();

        let mut covering = CoveringPIndexes::default();

        let mut sorted: Vec<_> = plan_pindexes.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));

        for plan_pindex in sorted {
            let mut lowest_priority = i32::MAX;
            let mut lowest_node: Option<&crate::defs::NodeDef> = None;

            for (node_uuid, plan_pindex_node) in &plan_pindex.nodes {
                // The local node only qualifies while it actually has the
                // pindex open under the expected index identity.
                let node_local = node_uuid.as_str() == self_uuid;
                let node_local_ok = node_local
                    && pindexes
                        .get(&plan_pindex.name)
                        .map(|local| {
                            local.meta.index_name == index_name
                                && (index_uuid.is_empty() || local.meta.index_uuid == index_uuid)
                        })
                        .unwrap_or(false);

                let Some(node_def) = node_defs.node_defs.get(node_uuid) else {
                    continue;
                };
                if node_def.uuid != *node_uuid || !node_def.has_tag("pindex") {
                    continue;
                }
                if !filter(plan_pindex_node) {
                    continue;
                }

                if plan_pindex_node.priority < lowest_priority {
                    if !node_local || node_local_ok {
                        lowest_node = Some(node_def);
                        lowest_priority = plan_pindex_node.priority;
                    }
                } else if plan_pindex_node.priority == lowest_priority && node_local && node_local_ok
                {
                    // Same priority: prefer the local node. Known
                    // limitation: local wins even when it lags a remote.
                    lowest_node = Some(node_def);
                }
            }

            match lowest_node {
                None => covering.missing_pindex_names.push(plan_pindex.name.clone()),
                Some(node_def) if node_def.uuid == self_uuid => {
                    if let Some(local) = pindexes.get(&plan_pindex.name) {
                        covering.local_pindexes.push(local.clone());
                    }
                }
                Some(node_def) => covering.remote_plan_pindexes.push(RemotePlanPIndex {
                    plan_pindex: plan_pindex.clone(),
                    node_def: node_def.clone(),
                }),
            }
        }

        Ok(covering)
    }
}
