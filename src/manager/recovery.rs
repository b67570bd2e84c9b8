//! Stable-plan persistence for failover recovery
//!
//! Every time a node observes a changed plan that is *stable* (for every
//! index, all of that index's partitions carry the same number of node
//! assignments), it serializes the plan to
//! `dataDir/planPIndexes/recoveryPlan-<nanos>-<md5hex>` and purges older
//! snapshots. After a failover, the rebalancer can feed this snapshot back
//! to the balancer to reproduce the pre-failover layout verbatim.

use super::Manager;
use crate::defs::PlanPIndexes;
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{error, info};

const RECOVERY_DIR: &str = "planPIndexes";
const RECOVERY_PREFIX: &str = "recoveryPlan-";

pub(crate) fn md5_hex(payload: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(payload);
    format!("{:x}", hasher.finalize())
}

/// A plan is stable when, for every index, all partitions of that index
/// have the same number of assigned nodes; evolving plans (mid-rebalance)
/// are not usable for recovery.
pub fn is_stable_plan(plan: &PlanPIndexes) -> bool {
    if plan.plan_pindexes.is_empty() {
        return false;
    }

    let mut node_counts: HashMap<&str, usize> = HashMap::new();
    for p in plan.plan_pindexes.values() {
        match node_counts.get(p.index_name.as_str()) {
            None => {
                node_counts.insert(&p.index_name, p.nodes.len());
            }
            Some(count) if *count != p.nodes.len() => return false,
            Some(_) => {}
        }
    }
    true
}

impl Manager {
    fn recovery_dir(&self) -> PathBuf {
        self.data_dir().join(RECOVERY_DIR)
    }

    /// Persists a stable plan snapshot, content-addressed by MD5, then
    /// purges all older snapshots. Non-stable plans are ignored. Failures
    /// are logged, never fatal: recovery plans are an optimization.
    pub(crate) async fn check_and_store_stable_plan_pindexes(&self, plan: &PlanPIndexes) {
        if !is_stable_plan(plan) {
            return;
        }

        let val = match serde_json::to_vec(plan) {
            Ok(val) => val,
            Err(e) => {
                error!("manager: persist plan, json err: {e}");
                return;
            }
        };

        // The file name carries the content hash so the read path can
        // verify integrity.
        let hash = md5_hex(&val);
        let nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_string();
        let fname = format!("{RECOVERY_PREFIX}{nanos}-{hash}");
        let dir_path = self.recovery_dir();
        let new_path = dir_path.join(&fname);

        info!(path = %new_path.display(), "manager: persisting stable plan");

        let lock = self.stable_plan_lock.clone();
        let _guard = lock.write().await;

        if let Err(e) = std::fs::create_dir_all(&dir_path) {
            error!("manager: persist plan, mkdir failed, err: {e}");
            return;
        }
        if let Err(e) = std::fs::write(&new_path, &val) {
            error!("manager: persist plan, write failed, err: {e}");
            return;
        }

        // Keep only the most recent snapshot; the plan right before a
        // failover ought to be the stable, usable one.
        let mut names: Vec<String> = match std::fs::read_dir(&dir_path) {
            Ok(entries) => entries
                .flatten()
                .filter_map(|e| e.file_name().into_string().ok())
                .collect(),
            Err(e) => {
                error!("manager: persist plan, readdir failed, err: {e}");
                return;
            }
        };
        names.sort();
        if names.len() <= 1 {
            return;
        }
        for name in &names[..names.len() - 1] {
            if name.contains(&nanos) {
                continue;
            }
            if let Err(e) = std::fs::remove_file(dir_path.join(name)) {
                error!("manager: persist plan, purge failed, err: {e}");
            }
        }
    }

    /// Returns the newest locally persisted stable plan whose content
    /// verifies against the MD5 suffix in its file name; corrupt or
    /// unreadable snapshots are skipped in favor of older ones.
    pub async fn get_stable_local_plan_pindexes(&self) -> Option<PlanPIndexes> {
        let dir_path = self.recovery_dir();

        let lock = self.stable_plan_lock.clone();
        let _guard = lock.read().await;

        let mut names: Vec<String> = std::fs::read_dir(&dir_path)
            .ok()?
            .flatten()
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        names.sort();

        // Newest first; multiple files can linger after a crash on the
        // writer side.
        for name in names.iter().rev() {
            let path = dir_path.join(name);
            let val = match std::fs::read(&path) {
                Ok(val) => val,
                Err(e) => {
                    error!(path = %path.display(), "manager: recovery plan read, err: {e}");
                    continue;
                }
            };

            let name_hash = match name.rsplit('-').next() {
                Some(h) => h,
                None => continue,
            };
            if md5_hex(&val) != name_hash {
                error!(path = %path.display(), "manager: recovery plan hash mismatch");
                continue;
            }

            match serde_json::from_slice::<PlanPIndexes>(&val) {
                Ok(plan) => {
                    info!(path = %path.display(), "manager: recovery plan loaded");
                    return Some(plan);
                }
                Err(e) => {
                    // Hash verified, so the content is as written; a parse
                    // failure here will not heal by reading older files.
                    error!(path = %path.display(), "manager: recovery plan json, err: {e}");
                    return None;
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::{PlanPIndex, PlanPIndexNode};
    use crate::manager::ManagerConfig;
    use std::sync::Arc;

    fn plan_with_counts(counts: &[(&str, usize)]) -> PlanPIndexes {
        let mut plan = PlanPIndexes::new("5.5.0");
        for (i, (index_name, node_count)) in counts.iter().enumerate() {
            let mut p = PlanPIndex {
                name: format!("{index_name}_{i}"),
                index_name: index_name.to_string(),
                ..Default::default()
            };
            for n in 0..*node_count {
                p.nodes.insert(
                    format!("node-{n}"),
                    PlanPIndexNode {
                        can_read: true,
                        can_write: true,
                        priority: n as i32,
                    },
                );
            }
            plan.plan_pindexes.insert(p.name.clone(), p);
        }
        plan
    }

    fn mgr_at(dir: &std::path::Path) -> Arc<Manager> {
        Manager::new(
            ManagerConfig {
                version: "5.5.0".to_string(),
                uuid: "recovery-node".to_string(),
                data_dir: dir.to_path_buf(),
                ..Default::default()
            },
            None,
            None,
        )
    }

    #[test]
    fn stability_requires_uniform_assignment_counts() {
        assert!(!is_stable_plan(&PlanPIndexes::new("5.5.0")));
        assert!(is_stable_plan(&plan_with_counts(&[("a", 2), ("a", 2), ("b", 1)])));
        assert!(!is_stable_plan(&plan_with_counts(&[("a", 2), ("a", 1)])));
    }

    #[tokio::test]
    async fn persists_and_reloads_latest_stable_plan() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = mgr_at(dir.path());

        let plan1 = plan_with_counts(&[("a", 1)]);
        mgr.check_and_store_stable_plan_pindexes(&plan1).await;
        let plan2 = plan_with_counts(&[("a", 2), ("a", 2)]);
        mgr.check_and_store_stable_plan_pindexes(&plan2).await;

        // Only the latest file remains, and it round-trips.
        let files: Vec<_> = std::fs::read_dir(dir.path().join(RECOVERY_DIR))
            .unwrap()
            .flatten()
            .collect();
        assert_eq!(files.len(), 1);

        let loaded = mgr.get_stable_local_plan_pindexes().await.unwrap();
        assert_eq!(loaded, plan2);
    }

    #[tokio::test]
    async fn unstable_plans_are_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = mgr_at(dir.path());

        mgr.check_and_store_stable_plan_pindexes(&plan_with_counts(&[("a", 2), ("a", 1)]))
            .await;
        assert!(mgr.get_stable_local_plan_pindexes().await.is_none());
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = mgr_at(dir.path());

        let good = plan_with_counts(&[("a", 1)]);
        mgr.check_and_store_stable_plan_pindexes(&good).await;

        // Write a newer file with a valid-looking name but a body that no
        // longer matches the hash suffix.
        let recovery_dir = dir.path().join(RECOVERY_DIR);
        let newest = format!("{RECOVERY_PREFIX}9999999999999999999-{}", md5_hex(b"original"));
        std::fs::write(recovery_dir.join(newest), b"tampered").unwrap();

        let loaded = mgr.get_stable_local_plan_pindexes().await.unwrap();
        assert_eq!(loaded, good);
    }
}
