//! Integration tests for the planner: splitting, balancing, and the
//! CAS-guarded plan write.

mod common;

use herder::cfg::{
    cfg_get_plan_pindexes, cfg_set_index_defs, cfg_set_node_defs, CfgMem, CAS_ANY,
    NODE_DEFS_WANTED,
};
use herder::defs::{same_plan_pindexes, IndexDefs};
use herder::planner::{calc_plan, plan, plan_pindex_name};
use std::collections::HashMap;

async fn seed_cfg(cfg: &CfgMem, index_defs: &IndexDefs, nodes: &[(&str, &str)]) {
    cfg_set_index_defs(cfg, index_defs, CAS_ANY).await.unwrap();
    cfg_set_node_defs(cfg, NODE_DEFS_WANTED, &common::node_defs(nodes), CAS_ANY)
        .await
        .unwrap();
}

#[tokio::test]
async fn split_1024_partitions_into_chunks_of_10() {
    common::register_stub_types("pt-src-1024", "pt-type", 1024);

    let mut index_defs = IndexDefs::new("5.5.0");
    let def = common::index_def("bigidx", "pt-type", "pt-src-1024", 10, 0);
    index_defs.index_defs.insert(def.name.clone(), def);

    let nodes = common::node_defs(&[("n1", "127.0.0.1:9201"), ("n2", "127.0.0.1:9202")]);
    let prev = herder::defs::PlanPIndexes::new("5.5.0");

    let plan1 = calc_plan(
        "",
        &index_defs,
        &nodes,
        &prev,
        "5.5.0",
        "",
        &HashMap::new(),
        None,
    )
    .await
    .unwrap();

    // 1024 partitions in chunks of 10: 102 full pindexes plus one with the
    // remaining 4.
    assert_eq!(plan1.plan_pindexes.len(), 103);
    let mut sizes: Vec<usize> = plan1
        .plan_pindexes
        .values()
        .map(|p| p.source_partitions.split(',').count())
        .collect();
    sizes.sort_unstable();
    assert_eq!(sizes[0], 4);
    assert!(sizes[1..].iter().all(|&s| s == 10));

    // Recomputing over identical inputs yields the same plan.
    let plan2 = calc_plan(
        "",
        &index_defs,
        &nodes,
        &prev,
        "5.5.0",
        "",
        &HashMap::new(),
        None,
    )
    .await
    .unwrap();
    assert!(same_plan_pindexes(Some(&plan1), Some(&plan2)));
}

#[tokio::test]
async fn plan_invariants_hold() {
    common::register_stub_types("pt-src-inv", "pt-type-inv", 32);

    let mut index_defs = IndexDefs::new("5.5.0");
    for name in ["aaa", "bbb", "ccc"] {
        let def = common::index_def(name, "pt-type-inv", "pt-src-inv", 8, 1);
        index_defs.index_defs.insert(def.name.clone(), def);
    }

    let cfg = CfgMem::new();
    seed_cfg(
        &cfg,
        &index_defs,
        &[
            ("n1", "127.0.0.1:9201"),
            ("n2", "127.0.0.1:9202"),
            ("n3", "127.0.0.1:9203"),
        ],
    )
    .await;

    assert!(plan(&cfg, "5.5.0", "", "", &HashMap::new(), None).await.unwrap());

    let (stored, _) = cfg_get_plan_pindexes(&cfg).await.unwrap().unwrap();
    assert!(!stored.plan_pindexes.is_empty());

    for p in stored.plan_pindexes.values() {
        // Every plan entry references an existing index definition.
        let def = index_defs.index_defs.get(&p.index_name).unwrap();
        assert_eq!(p.index_uuid, def.uuid);

        // At most one primary; total assignments bounded by replicas + 1.
        let primaries = p.nodes.values().filter(|n| n.priority == 0).count();
        assert!(primaries <= 1, "pindex {} has {primaries} primaries", p.name);
        assert!(p.nodes.len() <= def.plan_params.num_replicas + 1);

        // Names are the deterministic function of identity + partitions.
        assert_eq!(p.name, plan_pindex_name(def, &p.source_partitions));
    }
}

#[tokio::test]
async fn plan_is_a_fixed_point_through_the_cfg() {
    common::register_stub_types("pt-src-fp", "pt-type-fp", 8);

    let mut index_defs = IndexDefs::new("5.5.0");
    let def = common::index_def("fpidx", "pt-type-fp", "pt-src-fp", 4, 0);
    index_defs.index_defs.insert(def.name.clone(), def);

    let cfg = CfgMem::new();
    seed_cfg(&cfg, &index_defs, &[("n1", "127.0.0.1:9201")]).await;

    let options = HashMap::new();
    assert!(plan(&cfg, "5.5.0", "", "", &options, None).await.unwrap());
    assert!(!plan(&cfg, "5.5.0", "", "", &options, None).await.unwrap());
    assert!(!plan(&cfg, "5.5.0", "", "", &options, None).await.unwrap());
}

#[tokio::test]
async fn concurrent_planners_converge_on_identical_names() {
    common::register_stub_types("pt-src-conc", "pt-type-conc", 16);

    let mut index_defs = IndexDefs::new("5.5.0");
    let def = common::index_def("concidx", "pt-type-conc", "pt-src-conc", 4, 0);
    index_defs.index_defs.insert(def.name.clone(), def);
    let nodes = common::node_defs(&[("n1", "127.0.0.1:9201"), ("n2", "127.0.0.1:9202")]);
    let prev = herder::defs::PlanPIndexes::new("5.5.0");

    // Two independent planning passes, as would run on two racing nodes.
    let plan_a = calc_plan("", &index_defs, &nodes, &prev, "5.5.0", "", &HashMap::new(), None)
        .await
        .unwrap();
    let plan_b = calc_plan("", &index_defs, &nodes, &prev, "5.5.0", "", &HashMap::new(), None)
        .await
        .unwrap();

    let mut names_a: Vec<&String> = plan_a.plan_pindexes.keys().collect();
    let mut names_b: Vec<&String> = plan_b.plan_pindexes.keys().collect();
    names_a.sort();
    names_b.sort();
    assert_eq!(names_a, names_b);
    assert!(same_plan_pindexes(Some(&plan_a), Some(&plan_b)));
}

#[tokio::test]
async fn alias_like_types_are_skipped() {
    // Source exists but the index type has no registered implementation.
    common::register_stub_types("pt-src-alias", "pt-type-real", 4);

    let mut index_defs = IndexDefs::new("5.5.0");
    let def = common::index_def("aliasidx", "pt-type-unregistered", "pt-src-alias", 2, 0);
    index_defs.index_defs.insert(def.name.clone(), def);

    let nodes = common::node_defs(&[("n1", "127.0.0.1:9201")]);
    let plan1 = calc_plan(
        "",
        &index_defs,
        &nodes,
        &herder::defs::PlanPIndexes::new("5.5.0"),
        "5.5.0",
        "",
        &HashMap::new(),
        None,
    )
    .await
    .unwrap();
    assert!(plan1.plan_pindexes.is_empty());
}
