//! Shared fixtures for the integration suites: stub feed and pindex
//! implementation types, plus scripted HTTP responses for monitor-driven
//! tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use herder::defs::{IndexDef, NodeDef, NodeDefs, PlanParams};
use herder::feed::{Dest, Feed, FeedType, SourceSpec};
use herder::pindex::{PIndexImpl, PIndexImplType, RestartFn};
use herder::rest::HttpClient;
use herder::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

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

pub struct StubImpl;

impl PIndexImpl for StubImpl {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

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
        "stub pindex impl type for integration tests"
    }
}

pub struct StubFeed {
    name: String,
    index_name: String,
    dests: HashMap<String, Arc<dyn Dest>>,
}

#[async_trait]
impl Feed for StubFeed {
    fn name(&self) -> &str {
        &self.name
    }
    fn index_name(&self) -> &str {
        &self.index_name
    }
    async fn start(&self) -> Result<()> {
        Ok(())
    }
    async fn close(&self) -> Result<()> {
        Ok(())
    }
    fn dests(&self) -> HashMap<String, Arc<dyn Dest>> {
        self.dests.clone()
    }
}

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
            name: feed_name.to_string(),
            index_name: index_name.to_string(),
            dests,
        }))
    }

    async fn partitions(&self, _spec: &SourceSpec) -> Result<Vec<String>> {
        Ok(self.partition_ids.clone())
    }

    fn description(&self) -> &str {
        "stub feed type for integration tests"
    }
}

/// Registers a stub source type producing partitions "0".."n-1" and a
/// stub pindex implementation type.
pub fn register_stub_types(source_type: &str, index_type: &str, num_partitions: usize) {
    herder::feed::register_feed_type(
        source_type,
        Arc::new(StubFeedType {
            partition_ids: (0..num_partitions).map(|i| i.to_string()).collect(),
        }),
    );
    herder::pindex::register_pindex_impl_type(index_type, Arc::new(StubImplType));
}

pub fn index_def(
    name: &str,
    index_type: &str,
    source_type: &str,
    max_partitions: usize,
    replicas: usize,
) -> IndexDef {
    IndexDef {
        name: name.to_string(),
        uuid: format!("{name}-uuid"),
        index_type: index_type.to_string(),
        source_type: source_type.to_string(),
        plan_params: PlanParams {
            max_partitions_per_pindex: max_partitions,
            num_replicas: replicas,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn node_defs(entries: &[(&str, &str)]) -> NodeDefs {
    let mut nd = NodeDefs::new("5.5.0");
    for (uuid, host_port) in entries {
        nd.node_defs.insert(
            uuid.to_string(),
            NodeDef {
                uuid: uuid.to_string(),
                host_port: host_port.to_string(),
                impl_version: "5.5.0".to_string(),
                weight: 1,
                ..Default::default()
            },
        );
    }
    nd
}

/// Serves scripted bodies per URL, consuming a URL's responses in order
/// and repeating the last one; unscripted URLs error every time.
#[derive(Default)]
pub struct ScriptedHttpClient {
    responses: Mutex<HashMap<String, Vec<Result<Bytes>>>>,
    pub requests: Mutex<Vec<String>>,
}

impl ScriptedHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, url: &str, responses: Vec<Result<Bytes>>) {
        self.responses.lock().insert(url.to_string(), responses);
    }

    pub fn script_json(&self, url: &str, body: serde_json::Value) {
        self.script(url, vec![Ok(Bytes::from(body.to_string()))]);
    }

    pub fn script_json_seq(&self, url: &str, bodies: Vec<serde_json::Value>) {
        self.script(
            url,
            bodies
                .into_iter()
                .map(|b| Ok(Bytes::from(b.to_string())))
                .collect(),
        );
    }

    pub fn requests_for(&self, url: &str) -> usize {
        self.requests.lock().iter().filter(|u| u.as_str() == url).count()
    }
}

#[async_trait]
impl HttpClient for ScriptedHttpClient {
    async fn get(&self, url: &str) -> Result<Bytes> {
        self.requests.lock().push(url.to_string());
        let mut responses = self.responses.lock();
        match responses.get_mut(url) {
            None => Err(Error::Transport(format!("no scripted response for {url}"))),
            Some(rs) if rs.is_empty() => {
                Err(Error::Transport(format!("script exhausted for {url}")))
            }
            Some(rs) => {
                if rs.len() > 1 {
                    rs.remove(0)
                } else {
                    match &rs[0] {
                        Ok(b) => Ok(b.clone()),
                        Err(e) => Err(Error::Transport(e.to_string())),
                    }
                }
            }
        }
    }
}

/// A stats body in the shape the rebalancer consumes:
/// `pindexes.<pindex>.partitions.<partition> = {uuid, seq}`.
pub fn stats_body(pindex: &str, partition_seqs: &[(&str, u64)]) -> serde_json::Value {
    let mut partitions = serde_json::Map::new();
    for (partition, seq) in partition_seqs {
        partitions.insert(
            partition.to_string(),
            serde_json::json!({"uuid": "src-uuid", "seq": seq}),
        );
    }
    serde_json::json!({ "pindexes": { pindex: { "partitions": partitions } } })
}
