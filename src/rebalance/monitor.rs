//! Node monitoring: periodic REST stats/diag sampling
//!
//! Each monitored node gets its own sampling task with independent stats
//! and diag tickers; every fetch result (success or failure) is emitted as
//! a MonitorSample on the shared channel. Node membership changes are
//! handled by callers stopping and restarting the monitor.

use crate::defs::NodeDefs;
use crate::rest::HttpClient;
use crate::Result;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_STATS_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_DIAG_SAMPLE_INTERVAL: Duration = Duration::from_secs(60);

/// The REST path sampled for per-partition sequence numbers.
pub const STATS_SAMPLE_KIND: &str = "/api/stats?partitions=true";

/// The REST path sampled for opaque diagnostics.
pub const DIAG_SAMPLE_KIND: &str = "/api/diag";

/// The information collected from sampling one endpoint of one node.
#[derive(Debug, Clone)]
pub struct MonitorSample {
    /// Which endpoint produced this sample (STATS_SAMPLE_KIND or
    /// DIAG_SAMPLE_KIND).
    pub kind: String,
    pub url: String,
    pub uuid: String,
    pub start: chrono::DateTime<chrono::Utc>,
    pub duration: Duration,
    pub error: Option<String>,
    pub data: Option<Bytes>,
}

/// Associates a node's base REST URL with its UUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlUuid {
    pub url: String,
    pub uuid: String,
}

/// Derives the monitorable URL/UUID pairs from a node-defs aggregate.
pub fn node_defs_url_uuids(node_defs: &NodeDefs) -> Vec<UrlUuid> {
    let mut out: Vec<UrlUuid> = node_defs
        .node_defs
        .values()
        .map(|n| UrlUuid {
            url: format!("http://{}", n.host_port),
            uuid: n.uuid.clone(),
        })
        .collect();
    out.sort_by(|a, b| a.uuid.cmp(&b.uuid));
    out
}

#[derive(Clone, Default)]
pub struct MonitorNodesOptions {
    /// Zero means DEFAULT_STATS_SAMPLE_INTERVAL.
    pub stats_sample_interval: Option<Duration>,
    pub stats_sample_disable: bool,
    /// Zero means DEFAULT_DIAG_SAMPLE_INTERVAL.
    pub diag_sample_interval: Option<Duration>,
    pub diag_sample_disable: bool,
    /// Injectable for tests; defaults to the shared reqwest client.
    pub http: Option<Arc<dyn HttpClient>>,
}

/// Handle to a running set of node samplers.
pub struct MonitorNodes {
    stop: CancellationToken,
}

impl MonitorNodes {
    /// Stops all samplers; in-flight fetches complete but their samples
    /// are dropped rather than sent past the stop.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

/// Begins REST stats and diag sampling from a fixed set of nodes,
/// emitting every sample on `sample_tx`.
pub fn start_monitor_nodes(
    url_uuids: Vec<UrlUuid>,
    sample_tx: mpsc::Sender<MonitorSample>,
    options: MonitorNodesOptions,
) -> Result<MonitorNodes> {
    let stop = CancellationToken::new();
    let http = options
        .http
        .clone()
        .unwrap_or_else(crate::rest::default_http_client);

    for url_uuid in url_uuids {
        let runner = NodeRunner {
            url_uuid,
            sample_tx: sample_tx.clone(),
            options: options.clone(),
            http: http.clone(),
            stop: stop.clone(),
        };
        tokio::spawn(runner.run());
    }

    Ok(MonitorNodes { stop })
}

struct NodeRunner {
    url_uuid: UrlUuid,
    sample_tx: mpsc::Sender<MonitorSample>,
    options: MonitorNodesOptions,
    http: Arc<dyn HttpClient>,
    stop: CancellationToken,
}

impl NodeRunner {
    async fn run(self) {
        let stats_interval = self
            .options
            .stats_sample_interval
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_STATS_SAMPLE_INTERVAL);
        let diag_interval = self
            .options
            .diag_sample_interval
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_DIAG_SAMPLE_INTERVAL);

        let mut stats_ticker = tokio::time::interval(stats_interval);
        let mut diag_ticker = tokio::time::interval(diag_interval);
        // The first tick of a tokio interval fires immediately, giving the
        // initial sample of each kind.

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = stats_ticker.tick() => {
                    if !self.options.stats_sample_disable {
                        self.sample(STATS_SAMPLE_KIND).await;
                    }
                }
                _ = diag_ticker.tick() => {
                    if !self.options.diag_sample_disable {
                        self.sample(DIAG_SAMPLE_KIND).await;
                    }
                }
            }
        }
    }

    async fn sample(&self, kind: &str) {
        let url = format!("{}{}", self.url_uuid.url, kind);
        let start = chrono::Utc::now();
        let started = std::time::Instant::now();

        let fetched = self.http.get(&url).await;
        let duration = started.elapsed();

        let sample = match fetched {
            Ok(data) => MonitorSample {
                kind: kind.to_string(),
                url: self.url_uuid.url.clone(),
                uuid: self.url_uuid.uuid.clone(),
                start,
                duration,
                error: None,
                data: Some(data),
            },
            Err(e) => MonitorSample {
                kind: kind.to_string(),
                url: self.url_uuid.url.clone(),
                uuid: self.url_uuid.uuid.clone(),
                start,
                duration,
                error: Some(e.to_string()),
                data: None,
            },
        };

        debug!(node = sample.uuid, kind, err = ?sample.error, "monitor: sample");

        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = self.sample_tx.send(sample) => {}
        }
    }
}
