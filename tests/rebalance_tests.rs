//! Integration tests for the rebalancer: the two-step primary move with
//! catch-up waits, monitor error tolerance, failover recovery, and stop
//! semantics.

mod common;

use common::{stats_body, ScriptedHttpClient};
use herder::cfg::{
    cfg_get_plan_pindexes, cfg_set_index_defs, cfg_set_node_defs, cfg_set_plan_pindexes, Cfg,
    CfgMem, CAS_ANY, NODE_DEFS_WANTED, PLAN_PINDEXES_KEY,
};
use herder::defs::{IndexDefs, PlanPIndexes};
use herder::manager::{Manager, ManagerConfig};
use herder::planner::{plan, plan_pindex_name};
use herder::rebalance::{start_rebalance, RebalanceOptions, RebalanceProgress};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const NODE_A: &str = "nodeA";
const NODE_B: &str = "nodeB";
const HOST_A: &str = "a:9200";
const HOST_B: &str = "b:9200";

fn stats_url(host: &str) -> String {
    format!("http://{host}/api/stats?partitions=true")
}

async fn seed_index(cfg: &dyn Cfg, index_defs: &IndexDefs) {
    cfg_set_index_defs(cfg, index_defs, CAS_ANY).await.unwrap();
}

async fn set_wanted_nodes(cfg: &dyn Cfg, entries: &[(&str, &str)]) {
    let nd = common::node_defs(entries);
    let cas = match herder::cfg::cfg_get_node_defs(cfg, NODE_DEFS_WANTED)
        .await
        .unwrap()
    {
        Some((_, cas)) => cas,
        None => CAS_ANY,
    };
    cfg_set_node_defs(cfg, NODE_DEFS_WANTED, &nd, cas).await.unwrap();
}

/// Collects progress events until the channel closes.
fn spawn_progress_collector(
    mut rx: mpsc::Receiver<RebalanceProgress>,
) -> (tokio::task::JoinHandle<()>, Arc<Mutex<Vec<RebalanceProgress>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let events2 = events.clone();
    let handle = tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            events2.lock().push(progress);
        }
    });
    (handle, events)
}

/// Snapshots the stored plan after every plan-key change event.
fn spawn_plan_recorder(cfg: Arc<dyn Cfg>) -> Arc<Mutex<Vec<PlanPIndexes>>> {
    let snapshots = Arc::new(Mutex::new(Vec::new()));
    let snapshots2 = snapshots.clone();
    let (tx, mut rx) = mpsc::channel(128);
    cfg.subscribe(PLAN_PINDEXES_KEY, tx).unwrap();
    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            if let Ok(Some((plan, _))) = cfg_get_plan_pindexes(cfg.as_ref()).await {
                snapshots2.lock().push(plan);
            }
        }
    });
    snapshots
}

#[tokio::test]
async fn add_primary_goes_replica_first_and_waits_for_catchup() {
    common::register_stub_types("rb-src", "rb-type", 2);

    let cfg: Arc<dyn Cfg> = Arc::new(CfgMem::new());
    let mut index_defs = IndexDefs::new("5.5.0");
    let def = common::index_def("rbidx", "rb-type", "rb-src", 0, 0);
    index_defs.index_defs.insert(def.name.clone(), def.clone());
    seed_index(cfg.as_ref(), &index_defs).await;

    // The starting plan puts the single pindex's primary on node A.
    set_wanted_nodes(cfg.as_ref(), &[(NODE_A, HOST_A)]).await;
    assert!(plan(cfg.as_ref(), "5.5.0", "", "", &HashMap::new(), None).await.unwrap());

    let pindex = plan_pindex_name(&def, "0,1");
    {
        let (stored, _) = cfg_get_plan_pindexes(cfg.as_ref()).await.unwrap().unwrap();
        assert_eq!(stored.plan_pindexes[&pindex].primary_node(), Some(NODE_A));
    }

    // Node B joins; node A is asked to leave.
    set_wanted_nodes(cfg.as_ref(), &[(NODE_A, HOST_A), (NODE_B, HOST_B)]).await;

    // A reports seq 10 on both source partitions; B starts behind and
    // catches up only after a few samples.
    let http = Arc::new(ScriptedHttpClient::new());
    http.script_json(&stats_url(HOST_A), stats_body(&pindex, &[("0", 10), ("1", 10)]));
    http.script_json_seq(
        &stats_url(HOST_B),
        vec![
            stats_body(&pindex, &[("0", 2), ("1", 2)]),
            stats_body(&pindex, &[("0", 2), ("1", 2)]),
            stats_body(&pindex, &[("0", 6), ("1", 6)]),
            stats_body(&pindex, &[("0", 10), ("1", 10)]),
        ],
    );

    let snapshots = spawn_plan_recorder(cfg.clone());

    let r = start_rebalance(
        "5.5.0",
        cfg.clone(),
        "",
        HashMap::new(),
        &[NODE_A.to_string()],
        RebalanceOptions {
            http: Some(http),
            stats_sample_interval: Some(Duration::from_millis(25)),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let (collector, events) = spawn_progress_collector(r.progress_rx().unwrap());
    tokio::time::timeout(Duration::from_secs(20), collector)
        .await
        .expect("rebalance finished")
        .unwrap();

    // No error made it to the progress stream.
    assert!(
        events.lock().iter().all(|p| p.error.is_none()),
        "unexpected progress errors: {:?}",
        events
            .lock()
            .iter()
            .filter_map(|p| p.error.clone())
            .collect::<Vec<_>>()
    );

    // The final plan holds B as the sole primary.
    let (stored, _) = cfg_get_plan_pindexes(cfg.as_ref()).await.unwrap().unwrap();
    let final_nodes = &stored.plan_pindexes[&pindex].nodes;
    assert_eq!(final_nodes.len(), 1);
    assert_eq!(final_nodes[NODE_B].priority, 0);

    // On the way there, B first appeared as a replica while A was still
    // the primary: the catch-up gate sat between the two plan writes.
    let snapshots = snapshots.lock();
    let replica_phase = snapshots.iter().any(|plan| {
        plan.plan_pindexes.get(&pindex).is_some_and(|p| {
            p.nodes.get(NODE_B).map(|n| n.priority > 0).unwrap_or(false)
                && p.nodes.get(NODE_A).map(|n| n.priority == 0).unwrap_or(false)
        })
    });
    assert!(replica_phase, "never observed B as a catching-up replica");
}

#[tokio::test]
async fn monitor_tolerates_errors_up_to_threshold() {
    common::register_stub_types("rb6-src", "rb6-type", 2);

    let cfg: Arc<dyn Cfg> = Arc::new(CfgMem::new());
    let mut index_defs = IndexDefs::new("5.5.0");
    let def = common::index_def("rb6idx", "rb6-type", "rb6-src", 0, 0);
    index_defs.index_defs.insert(def.name.clone(), def.clone());
    seed_index(cfg.as_ref(), &index_defs).await;

    set_wanted_nodes(cfg.as_ref(), &[(NODE_A, HOST_A)]).await;
    assert!(plan(cfg.as_ref(), "5.5.0", "", "", &HashMap::new(), None).await.unwrap());
    set_wanted_nodes(cfg.as_ref(), &[(NODE_A, HOST_A), (NODE_B, HOST_B)]).await;

    let pindex = plan_pindex_name(&def, "0,1");

    // A stays healthy; B fails every sample, so its move can never catch
    // up and the error counter climbs.
    let http = Arc::new(ScriptedHttpClient::new());
    http.script_json(&stats_url(HOST_A), stats_body(&pindex, &[("0", 10), ("1", 10)]));

    let r = start_rebalance(
        "5.5.0",
        cfg.clone(),
        "",
        HashMap::new(),
        &[NODE_A.to_string()],
        RebalanceOptions {
            http: Some(http.clone()),
            stats_sample_interval: Some(Duration::from_millis(25)),
            stats_sample_error_threshold: Some(3),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let (collector, events) = spawn_progress_collector(r.progress_rx().unwrap());
    tokio::time::timeout(Duration::from_secs(20), collector)
        .await
        .expect("rebalance aborted")
        .unwrap();

    // The monitor pushed exactly one terminal error after the threshold.
    let error_events: Vec<String> = events
        .lock()
        .iter()
        .filter_map(|p| p.error.clone())
        .collect();
    assert!(!error_events.is_empty(), "expected an error progress event");

    // The first two failures were tolerated: B was sampled at least three
    // times before the abort.
    assert!(
        http.requests_for(&stats_url(HOST_B)) >= 3,
        "B sampled {} times",
        http.requests_for(&stats_url(HOST_B))
    );
}

#[tokio::test]
async fn recovery_rebalance_reproduces_the_pre_failover_layout() {
    common::register_stub_types("rb4-src", "rb4-type", 2);

    let cfg: Arc<dyn Cfg> = Arc::new(CfgMem::new());
    let mut index_defs = IndexDefs::new("5.5.0");
    let def = common::index_def("rb4idx", "rb4-type", "rb4-src", 0, 1);
    index_defs.index_defs.insert(def.name.clone(), def.clone());
    seed_index(cfg.as_ref(), &index_defs).await;
    set_wanted_nodes(cfg.as_ref(), &[(NODE_A, HOST_A), (NODE_B, HOST_B)]).await;

    let pindex = plan_pindex_name(&def, "0,1");

    // The pre-failover layout: A primary, B replica. A manager observes
    // it, persisting the stable recovery snapshot.
    let dir = tempfile::tempdir().unwrap();
    let mgr = Manager::new(
        ManagerConfig {
            version: "5.5.0".to_string(),
            uuid: "rb4-observer".to_string(),
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        },
        Some(cfg.clone()),
        None,
    );

    let mut stable = PlanPIndexes::new("5.5.0");
    let mut p = herder::defs::PlanPIndex {
        name: pindex.clone(),
        uuid: herder::defs::new_uuid(),
        index_type: def.index_type.clone(),
        index_name: def.name.clone(),
        index_uuid: def.uuid.clone(),
        source_type: def.source_type.clone(),
        source_partitions: "0,1".to_string(),
        ..Default::default()
    };
    p.nodes.insert(
        NODE_A.to_string(),
        herder::defs::PlanPIndexNode {
            can_read: true,
            can_write: true,
            priority: 0,
        },
    );
    p.nodes.insert(
        NODE_B.to_string(),
        herder::defs::PlanPIndexNode {
            can_read: true,
            can_write: true,
            priority: 1,
        },
    );
    stable.plan_pindexes.insert(pindex.clone(), p.clone());
    let cas = cfg_set_plan_pindexes(cfg.as_ref(), &stable, CAS_ANY).await.unwrap();
    mgr.get_plan_pindexes(true).await.unwrap();
    assert!(mgr.get_stable_local_plan_pindexes().await.is_some());

    // Failover: B's replica is gone from the stored plan, leaving A alone.
    let mut failed_over = stable.clone();
    failed_over.uuid = herder::defs::new_uuid();
    failed_over
        .plan_pindexes
        .get_mut(&pindex)
        .unwrap()
        .nodes
        .remove(NODE_B);
    cfg_set_plan_pindexes(cfg.as_ref(), &failed_over, cas).await.unwrap();

    // B rejoins; its addition matches the recovery snapshot's node set,
    // so the balancer is fed the pre-failover plan.
    let http = Arc::new(ScriptedHttpClient::new());
    http.script_json(&stats_url(HOST_A), serde_json::json!({"pindexes": {}}));
    http.script_json(&stats_url(HOST_B), serde_json::json!({"pindexes": {}}));

    let r = start_rebalance(
        "5.5.0",
        cfg.clone(),
        "",
        HashMap::new(),
        &[],
        RebalanceOptions {
            http: Some(http),
            stats_sample_interval: Some(Duration::from_millis(25)),
            skip_seq_checks: true,
            manager: Some(mgr.clone()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let (collector, events) = spawn_progress_collector(r.progress_rx().unwrap());
    tokio::time::timeout(Duration::from_secs(20), collector)
        .await
        .expect("rebalance finished")
        .unwrap();
    assert!(events.lock().iter().all(|p| p.error.is_none()));

    // The stored plan is back to the pre-failover layout.
    let (stored, _) = cfg_get_plan_pindexes(cfg.as_ref()).await.unwrap().unwrap();
    let nodes = &stored.plan_pindexes[&pindex].nodes;
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[NODE_A].priority, 0);
    assert!(nodes[NODE_B].priority > 0);

    mgr.stop();
}

#[tokio::test]
async fn stop_twice_is_a_no_op() {
    let cfg: Arc<dyn Cfg> = Arc::new(CfgMem::new());
    seed_index(cfg.as_ref(), &IndexDefs::new("5.5.0")).await;
    set_wanted_nodes(cfg.as_ref(), &[(NODE_A, HOST_A)]).await;

    let http = Arc::new(ScriptedHttpClient::new());
    http.script_json(&stats_url(HOST_A), serde_json::json!({"pindexes": {}}));

    let r = start_rebalance(
        "5.5.0",
        cfg,
        "",
        HashMap::new(),
        &[],
        RebalanceOptions {
            http: Some(http),
            stats_sample_interval: Some(Duration::from_millis(25)),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let mut rx = r.progress_rx().unwrap();

    r.stop();
    r.stop();

    // With no indexes there is nothing to move; the progress channel
    // closes promptly either way.
    tokio::time::timeout(Duration::from_secs(10), async {
        while rx.recv().await.is_some() {}
    })
    .await
    .expect("progress channel closed");
}

#[tokio::test]
async fn unknown_removal_nodes_are_rejected() {
    let cfg: Arc<dyn Cfg> = Arc::new(CfgMem::new());
    seed_index(cfg.as_ref(), &IndexDefs::new("5.5.0")).await;
    set_wanted_nodes(cfg.as_ref(), &[(NODE_A, HOST_A)]).await;

    let err = start_rebalance(
        "5.5.0",
        cfg,
        "",
        HashMap::new(),
        &["never-heard-of-it".to_string()],
        RebalanceOptions::default(),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("unknown nodes"));
}
