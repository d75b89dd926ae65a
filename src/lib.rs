//! Central control plane for live worker-pool reconfiguration.
//!
//! A config server stores one [`model::PoolConfig`] per [`model::GroupKey`]
//! and holds long-poll requests open until a key a client is watching
//! changes. Clients register their pools, apply pulled changes to live
//! [`executor::DynamicExecutor`]s through the [`registry::PoolRegistry`] and
//! raise rate-limited threshold alarms.

pub mod alarm;
pub mod client;
pub mod config;
pub mod digest;
pub mod error;
pub mod executor;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod storage;
pub mod util;
