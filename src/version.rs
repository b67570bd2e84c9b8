//! Cluster metadata schema versioning
//!
//! The stored `version` key tracks the schema/format of everything persisted
//! in the Cfg. A node whose version is older than the stored value must not
//! modify cluster metadata, and the stored value is only bumped once every
//! known and wanted node reports the candidate version (homogeneous
//! cluster). The stored version is monotonically non-decreasing.

use crate::cfg::{cfg_get_node_defs, Cfg, CAS_ANY, NODE_DEFS_KNOWN, NODE_DEFS_WANTED, VERSION_KEY};
use crate::{Error, Result};
use tracing::{info, warn};

/// An optional external oracle for the effective cluster compatibility
/// version; when available it takes precedence over per-node version
/// checks.
pub trait VersionReader: Send + Sync {
    fn cluster_version(&self) -> Result<u64>;
}

/// Returns true when `x >= y`, comparing dotted numeric version fields
/// left to right. Non-numeric fields or a shorter `x` compare as lower.
pub fn version_gte(x: &str, y: &str) -> bool {
    let xa: Vec<&str> = x.split('.').collect();
    let ya: Vec<&str> = y.split('.').collect();
    for (i, ys) in ya.iter().enumerate() {
        let Some(xs) = xa.get(i) else {
            return false;
        };
        let (Ok(xv), Ok(yv)) = (xs.parse::<u64>(), ys.parse::<u64>()) else {
            return false;
        };
        if xv > yv {
            return true;
        }
        if xv < yv {
            return false;
        }
    }
    true
}

/// Collapses "maj.min.rest" into the single compatibility number
/// `maj * 65536 + min`.
pub fn compatibility_version(version: &str) -> Result<u64> {
    let mut parts = version.split('.');
    let (Some(maj), Some(min)) = (parts.next(), parts.next()) else {
        return Err(Error::MalformedConfig(format!("invalid version: {version}")));
    };
    let maj: u64 = maj
        .parse()
        .map_err(|_| Error::MalformedConfig(format!("invalid version: {version}")))?;
    let min: u64 = min
        .parse()
        .map_err(|_| Error::MalformedConfig(format!("invalid version: {version}")))?;
    Ok(maj * 65536 + min)
}

/// Runs `f`, retrying up to `attempts` more times while it fails, and
/// returns the most recent outcome.
pub fn retry<T>(attempts: u32, mut f: impl FnMut() -> Result<T>) -> Result<T> {
    let mut outcome = f();
    let mut remaining = attempts;
    while outcome.is_err() && remaining > 0 {
        outcome = f();
        remaining -= 1;
    }
    outcome
}

/// Establishes the cluster's operating schema version for this node.
///
/// Returns `Ok(true)` when this node may modify Cfg metadata, `Ok(false)`
/// when the node is too old (the stored version is newer). The stored value
/// is initialized on first contact and bumped only for a homogeneous
/// cluster.
pub async fn check_version(cfg: &dyn Cfg, my_version: &str) -> Result<bool> {
    check_version_ex(cfg, None, my_version).await
}

/// `check_version` with an optional external compatibility oracle.
pub async fn check_version_ex(
    cfg: &dyn Cfg,
    oracle: Option<&dyn VersionReader>,
    my_version: &str,
) -> Result<bool> {
    let mut tries = 0;
    loop {
        tries += 1;
        if tries > 100 {
            return Err(Error::TooManyRetries("checkVersion".to_string()));
        }

        let Some((stored, cas)) = cfg.get(VERSION_KEY, CAS_ANY).await? else {
            // First-time initialization; save and re-read in case of a
            // multi-node startup race.
            match cfg.set(VERSION_KEY, my_version.as_bytes(), CAS_ANY).await {
                Ok(_) => {
                    info!(version = my_version, "version: initialized cfg version");
                    continue;
                }
                Err(e) if e.is_cas_mismatch() => continue,
                Err(e) => return Err(e),
            }
        };

        let stored = String::from_utf8_lossy(&stored).into_owned();

        // An older node must never override a newer cluster's metadata.
        if !version_gte(my_version, &stored) {
            return Ok(false);
        }

        if my_version != stored {
            if !verify_effective_cluster_version(cfg, oracle, my_version).await? {
                // Coexistence mode: this node passes, but the stored
                // version stays put until the cluster is homogeneous.
                info!(stored, "version: no bump for current cfg version");
                return Ok(true);
            }

            match cfg.set(VERSION_KEY, my_version.as_bytes(), cas).await {
                Ok(_) => {
                    info!(version = my_version, "version: cfg version updated");
                    continue;
                }
                Err(e) if e.is_cas_mismatch() => continue,
                Err(e) => return Err(e),
            }
        }

        return Ok(true);
    }
}

/// Decides whether a version bump to `my_version` is permitted: true only
/// when every known and wanted node already reports `my_version`. When an
/// external oracle is supplied, its compatibility number must equal
/// `compatibility_version(my_version)`; oracle failures fall back to the
/// per-node checks.
pub async fn verify_effective_cluster_version(
    cfg: &dyn Cfg,
    oracle: Option<&dyn VersionReader>,
    my_version: &str,
) -> Result<bool> {
    if let Some(oracle) = oracle {
        match retry(3, || oracle.cluster_version()) {
            Ok(cluster_compat) => {
                let app_compat = compatibility_version(my_version)?;
                if app_compat != cluster_compat {
                    info!(
                        app_compat,
                        cluster_compat, "version: compatibility mismatch, no bump"
                    );
                    return Ok(false);
                }
                return Ok(true);
            }
            Err(e) => {
                warn!("version: cluster version oracle failed, err: {e}");
                // fall through to node-def checks
            }
        }
    }

    for kind in [NODE_DEFS_KNOWN, NODE_DEFS_WANTED] {
        let Some((node_defs, _)) = cfg_get_node_defs(cfg, kind).await? else {
            continue;
        };
        for node in node_defs.node_defs.values() {
            if my_version != node.impl_version && version_gte(my_version, &node.impl_version) {
                info!(
                    node_version = node.impl_version,
                    my_version, "version: node below candidate version, no bump"
                );
                return Ok(false);
            }
        }
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{cfg_set_node_defs, CfgMem, ErrorAfterCfg, ErrorUntilCfg};
    use crate::defs::{NodeDef, NodeDefs};

    fn node_defs_with_versions(versions: &[&str]) -> NodeDefs {
        let mut nd = NodeDefs::new(versions.first().copied().unwrap_or("0.0.0"));
        for (i, v) in versions.iter().enumerate() {
            let uuid = format!("node-{i}");
            nd.node_defs.insert(
                uuid.clone(),
                NodeDef {
                    uuid,
                    host_port: format!("127.0.0.1:920{i}"),
                    impl_version: v.to_string(),
                    weight: 1,
                    ..Default::default()
                },
            );
        }
        nd
    }

    async fn set_both_node_defs(cfg: &CfgMem, versions: &[&str]) {
        for kind in [NODE_DEFS_KNOWN, NODE_DEFS_WANTED] {
            let nd = node_defs_with_versions(versions);
            let cas = match cfg_get_node_defs(cfg, kind).await.unwrap() {
                Some((_, cas)) => cas,
                None => CAS_ANY,
            };
            let cas = if cas == CAS_ANY { crate::cfg::CAS_FORCE } else { cas };
            cfg_set_node_defs(cfg, kind, &nd, cas).await.unwrap();
        }
    }

    async fn stored_version(cfg: &dyn Cfg) -> String {
        let (val, _) = cfg.get(VERSION_KEY, CAS_ANY).await.unwrap().unwrap();
        String::from_utf8(val).unwrap()
    }

    #[test]
    fn version_gte_table() {
        assert!(version_gte("5.5.0", "5.5.0"));
        assert!(version_gte("5.5.1", "5.5.0"));
        assert!(version_gte("5.6.0", "5.5.9"));
        assert!(version_gte("6.0.0", "5.9.9"));
        assert!(!version_gte("5.4.9", "5.5.0"));
        assert!(!version_gte("4.5.0", "5.5.0"));
        assert!(!version_gte("5.5", "5.5.0"));
        assert!(!version_gte("x.y.z", "1.0.0"));
    }

    #[test]
    fn compatibility_version_formula() {
        assert_eq!(compatibility_version("6.5.0").unwrap(), 6 * 65536 + 5);
        assert_eq!(compatibility_version("5.5.9").unwrap(), 5 * 65536 + 5);
        assert!(compatibility_version("6").is_err());
        assert!(compatibility_version("a.b.c").is_err());
    }

    #[test]
    fn retry_returns_most_recent_outcome() {
        let mut calls = 0;
        let out = retry(3, || {
            calls += 1;
            if calls < 3 {
                Err(Error::Transport("flaky".to_string()))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(out.unwrap(), 3);

        let mut calls = 0;
        let out: Result<u64> = retry(3, || {
            calls += 1;
            Err(Error::Transport("always".to_string()))
        });
        assert!(out.is_err());
        assert_eq!(calls, 4);
    }

    #[tokio::test]
    async fn first_node_bootstrap() {
        let cfg = CfgMem::new();
        assert!(check_version(&cfg, "5.5.0").await.unwrap());
        assert_eq!(stored_version(&cfg).await, "5.5.0");

        // An older node must be refused, and the stored value unchanged.
        assert!(!check_version(&cfg, "4.5.0").await.unwrap());
        assert_eq!(stored_version(&cfg).await, "5.5.0");
    }

    #[tokio::test]
    async fn upgrade_bumps_only_when_homogeneous() {
        let cfg = CfgMem::new();
        assert!(check_version(&cfg, "5.0.0").await.unwrap());
        assert_eq!(stored_version(&cfg).await, "5.0.0");

        // Mixed cluster: an older 5.0.0 node holds the bump back, but the
        // newer node still passes (coexistence mode).
        set_both_node_defs(&cfg, &["5.5.0", "5.0.0", "5.5.0"]).await;
        assert!(check_version(&cfg, "5.5.0").await.unwrap());
        assert_eq!(stored_version(&cfg).await, "5.0.0");

        // Homogeneous cluster: the bump happens.
        set_both_node_defs(&cfg, &["5.5.0", "5.5.0", "5.5.0"]).await;
        assert!(check_version(&cfg, "5.5.0").await.unwrap());
        assert_eq!(stored_version(&cfg).await, "5.5.0");

        // A still-newer candidate passes without bumping.
        assert!(check_version(&cfg, "5.5.5").await.unwrap());
        assert_eq!(stored_version(&cfg).await, "5.5.0");

        // The monotonic floor: re-checking with the stored version is fine.
        assert!(check_version(&cfg, "5.5.0").await.unwrap());
        assert_eq!(stored_version(&cfg).await, "5.5.0");
    }

    #[tokio::test]
    async fn transport_errors_surface() {
        for err_after in 0..3 {
            let cfg = ErrorAfterCfg::new(CfgMem::new(), err_after);
            assert!(check_version(&cfg, "1.0.0").await.is_err());
        }

        // Get, set, then the re-read get all succeed within 3 ops.
        let cfg = ErrorAfterCfg::new(CfgMem::new(), 3);
        assert!(check_version(&cfg, "1.0.0").await.unwrap());
    }

    #[tokio::test]
    async fn oracle_takes_precedence() {
        struct FixedOracle(u64);
        impl VersionReader for FixedOracle {
            fn cluster_version(&self) -> Result<u64> {
                Ok(self.0)
            }
        }

        let cfg = CfgMem::new();
        assert!(check_version(&cfg, "5.0.0").await.unwrap());

        // Oracle agrees with the candidate: bump permitted even with stale
        // node defs present.
        set_both_node_defs(&cfg, &["5.0.0"]).await;
        let oracle = FixedOracle(compatibility_version("5.5.0").unwrap());
        assert!(check_version_ex(&cfg, Some(&oracle), "5.5.0").await.unwrap());
        assert_eq!(stored_version(&cfg).await, "5.5.0");

        // Oracle disagreement blocks the bump but not the node.
        let cfg = CfgMem::new();
        assert!(check_version(&cfg, "5.5.0").await.unwrap());
        let oracle = FixedOracle(compatibility_version("5.5.0").unwrap());
        assert!(check_version_ex(&cfg, Some(&oracle), "5.6.0").await.unwrap());
        assert_eq!(stored_version(&cfg).await, "5.5.0");
    }

    #[tokio::test]
    async fn oracle_failure_falls_back_to_node_defs() {
        let cfg = ErrorUntilCfg::new(CfgMem::new(), 0);
        let ok = verify_effective_cluster_version(&cfg, None, "6.5.0")
            .await
            .unwrap();
        assert!(ok, "empty cluster permits a bump");

        struct BrokenOracle;
        impl VersionReader for BrokenOracle {
            fn cluster_version(&self) -> Result<u64> {
                Err(Error::Transport("unreachable".to_string()))
            }
        }

        let mem = CfgMem::new();
        set_both_node_defs(&mem, &["6.5.0"]).await;
        let ok = verify_effective_cluster_version(&mem, Some(&BrokenOracle), "6.5.0")
            .await
            .unwrap();
        assert!(ok, "homogeneous node defs permit a bump despite oracle failure");
    }
}
