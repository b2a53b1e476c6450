//! Cluster configuration and watcher-backed readers.
//!
//! This crate owns everything that talks to a `kube::Client` directly: dev
//! vs. in-cluster config resolution, and the reader tasks that fold a
//! `kube::runtime::watcher` event stream into typed replication requests.

#![forbid(unsafe_code)]

pub mod config;
pub mod reader;

pub use config::{client_from_config, local_config, remote_config, validate_hosts_differ, ConfigError};
pub use reader::run_reader;
