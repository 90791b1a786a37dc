//! Containerized test clusters for a VoltDB-compatible database.
//!
//! Spins up N database nodes as containers on a private network, waits
//! until every node answers queries, and hands out client connections
//! for integration tests and benchmark samples:
//! - Cluster lifecycle: concurrent start, readiness polling, shutdown
//! - Schema and stored-procedure loading, SQL script execution
//! - Per-node network, TLS, and auth configuration, frozen at start
//!
//! The container runtime and the database wire protocol stay behind the
//! [`ContainerEngine`] and [`ClientFactory`] traits; a `docker`-CLI
//! engine is included, the client is supplied by the caller.

pub mod client;
pub mod cluster;
pub mod config;
pub mod docker;
pub mod engine;
pub mod error;
pub mod license;
pub mod node;
pub mod script;

pub use client::{
    ClientConfig, ClientFactory, ProcedureClient, ProcedureResponse, ResponseStatus, ResultTable,
};
pub use cluster::VoltCluster;
pub use config::{NetworkMode, NodeConfig, TlsSettings};
pub use docker::DockerCliEngine;
pub use engine::{ContainerEngine, ContainerHandle, ContainerSpec, CopyFile, CopySource};
pub use error::{Error, Result};
pub use license::resolve_license;
pub use node::{NodeState, VoltNode};
pub use script::ScriptRunner;
