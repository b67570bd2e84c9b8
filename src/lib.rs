//! # herder
//!
//! A control plane for clusters of nodes hosting partitioned, replicated
//! indexes over external data sources.
//!
//! A logical index is split into partitions (pindexes); each partition is
//! assigned to one or more nodes in primary or replica roles. Cluster
//! metadata lives in a CAS-versioned key/value store (the Cfg); a per-node
//! planner/janitor pair reconciles the desired layout with live
//! processes, and a rebalancer orchestrates cluster-wide partition moves
//! with replica catch-up guarantees.
//!
//! ## Architecture
//!
//! - **Cfg**: the cluster-wide CAS key/value store, with pluggable
//!   providers (in-memory, file-backed, external)
//! - **Planner**: turns index definitions plus node membership into a
//!   partition assignment plan
//! - **Janitor**: per-node reconciler driving local pindex and feed
//!   lifecycle to match the plan
//! - **Manager**: the per-node process hosting planner + janitor,
//!   registries, and recovery-plan persistence
//! - **Rebalancer**: out-of-band orchestrator moving partitions one at a
//!   time, waiting for replica catch-up via remote stats sampling
//!
//! Concrete index implementations and data-source feeds plug in through
//! process-global registries ([`pindex::register_pindex_impl_type`],
//! [`feed::register_feed_type`]), populated at startup.

pub mod balance;
pub mod cfg;
mod covering;
pub mod defs;
pub mod feed;
mod janitor;
pub mod manager;
pub mod pindex;
pub mod planner;
pub mod rebalance;
pub mod rest;
pub mod version;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::cfg::{Cfg, CfgEvent, CfgFile, CfgMem};
    pub use crate::defs::{
        IndexDef, IndexDefs, NodeDef, NodeDefs, PlanPIndex, PlanPIndexNode, PlanPIndexes, UuidSeq,
    };
    pub use crate::feed::{Dest, Feed, FeedType};
    pub use crate::manager::{Manager, ManagerConfig, RegisterMode};
    pub use crate::pindex::{PIndex, PIndexImpl, PIndexImplType};
    pub use crate::planner::plan;
    pub use crate::rebalance::{start_rebalance, RebalanceOptions, Rebalancer};
    pub use crate::version::check_version;
    pub use crate::{Error, Result};
}
