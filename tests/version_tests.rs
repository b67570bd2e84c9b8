//! Integration tests for the cluster schema-version gate.

use herder::cfg::{
    cfg_set_node_defs, Cfg, CfgMem, ErrorAfterCfg, CAS_ANY, CAS_FORCE, NODE_DEFS_KNOWN,
    NODE_DEFS_WANTED, VERSION_KEY,
};
use herder::defs::{NodeDef, NodeDefs};
use herder::version::{check_version, compatibility_version};

async fn stored_version(cfg: &dyn Cfg) -> String {
    let (val, _) = cfg.get(VERSION_KEY, CAS_ANY).await.unwrap().unwrap();
    String::from_utf8(val).unwrap()
}

async fn set_cluster_nodes(cfg: &CfgMem, versions: &[&str]) {
    for kind in [NODE_DEFS_KNOWN, NODE_DEFS_WANTED] {
        let mut nd = NodeDefs::new(versions.first().copied().unwrap_or("0.0.0"));
        for (i, version) in versions.iter().enumerate() {
            let uuid = format!("node-{i}");
            nd.node_defs.insert(
                uuid.clone(),
                NodeDef {
                    uuid,
                    host_port: format!("127.0.0.1:920{i}"),
                    impl_version: version.to_string(),
                    weight: 1,
                    ..Default::default()
                },
            );
        }
        cfg_set_node_defs(cfg, kind, &nd, CAS_FORCE).await.unwrap();
    }
}

#[tokio::test]
async fn first_node_bootstrap_wins_then_blocks_older() {
    let cfg = CfgMem::new();

    assert!(check_version(&cfg, "5.5.0").await.unwrap());
    assert_eq!(stored_version(&cfg).await, "5.5.0");

    assert!(!check_version(&cfg, "4.5.0").await.unwrap());
    assert_eq!(stored_version(&cfg).await, "5.5.0");
}

#[tokio::test]
async fn stored_version_never_decreases() {
    let cfg = CfgMem::new();
    assert!(check_version(&cfg, "5.0.0").await.unwrap());

    for candidate in ["4.0.0", "4.9.9", "5.0.0", "5.5.0", "6.0.0"] {
        let before = stored_version(&cfg).await;
        let _ = check_version(&cfg, candidate).await.unwrap();
        let after = stored_version(&cfg).await;
        assert!(
            herder::version::version_gte(&after, &before),
            "stored version decreased: {before} -> {after} on candidate {candidate}"
        );
    }
}

#[tokio::test]
async fn bump_waits_for_homogeneous_cluster() {
    let cfg = CfgMem::new();
    assert!(check_version(&cfg, "5.0.0").await.unwrap());

    // One node still on 5.0.0 holds the bump back, while the newer node
    // itself passes.
    set_cluster_nodes(&cfg, &["5.5.0", "5.0.0", "5.5.0"]).await;
    assert!(check_version(&cfg, "5.5.0").await.unwrap());
    assert_eq!(stored_version(&cfg).await, "5.0.0");

    // Homogeneous: the bump happens.
    set_cluster_nodes(&cfg, &["5.5.0", "5.5.0", "5.5.0"]).await;
    assert!(check_version(&cfg, "5.5.0").await.unwrap());
    assert_eq!(stored_version(&cfg).await, "5.5.0");

    // A mixed 5.5.0/5.5.5 cluster still passes 5.5.5 without a bump.
    set_cluster_nodes(&cfg, &["5.5.5", "5.5.0", "5.5.5"]).await;
    assert!(check_version(&cfg, "5.5.5").await.unwrap());
    assert_eq!(stored_version(&cfg).await, "5.5.0");

    // All on 5.5.5: bumped.
    set_cluster_nodes(&cfg, &["5.5.5", "5.5.5", "5.5.5"]).await;
    assert!(check_version(&cfg, "5.5.5").await.unwrap());
    assert_eq!(stored_version(&cfg).await, "5.5.5");
}

#[tokio::test]
async fn transport_failures_surface_as_errors() {
    for err_after in 0..3 {
        let cfg = ErrorAfterCfg::new(CfgMem::new(), err_after);
        assert!(
            check_version(&cfg, "1.0.0").await.is_err(),
            "expected err when cfg errors on op {err_after}"
        );
    }

    // First-time init takes three ops (get, set, re-read get).
    let cfg = ErrorAfterCfg::new(CfgMem::new(), 3);
    assert!(check_version(&cfg, "1.0.0").await.unwrap());
}

#[test]
fn compatibility_version_is_major_minor_packed() {
    assert_eq!(compatibility_version("6.5.0").unwrap(), 6 * 65536 + 5);
    assert_eq!(compatibility_version("5.5").unwrap(), 5 * 65536 + 5);
    assert!(compatibility_version("junk").is_err());
}
