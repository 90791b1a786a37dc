//! Error types for the cluster harness.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::client::ResponseStatus;

/// Harness errors.
#[derive(Error, Debug)]
pub enum Error {
    /// No license file was found in any of the standard locations.
    #[error(
        "no license file found; the cluster will fail to start without one (searched {0:?})"
    )]
    LicenseNotFound(Vec<PathBuf>),

    /// An explicitly configured license path does not exist.
    #[error("license file does not exist: {}", .0.display())]
    LicenseMissing(PathBuf),

    /// Invalid topology or other construction-time misconfiguration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration was applied after the cluster had already started.
    #[error("cluster is already started; configuration must be applied before start()")]
    AlreadyStarted,

    /// The container engine failed to bring up a node.
    #[error("node {host} failed to start: {reason}")]
    NodeStart { host: String, reason: String },

    /// The node process came up but never became queryable.
    #[error(
        "could not connect to node {host} within {timeout:?}; server may have failed to start"
    )]
    ReadinessTimeout { host: String, timeout: Duration },

    /// A cluster-level operation found no node in the running state.
    #[error("no running node found in the cluster")]
    NoRunningNode,

    /// The node's container has not been started.
    #[error("node {host} is not started")]
    NodeNotStarted { host: String },

    /// The node has no connected client.
    #[error("node {host} has no connected client")]
    NotConnected { host: String },

    /// A client connection attempt failed.
    #[error("connection failed: {0}")]
    Connect(String),

    /// A procedure call returned a non-success status or a protocol error.
    #[error("procedure call failed with status {status:?}: {message}")]
    Procedure {
        status: ResponseStatus,
        message: String,
    },

    /// Client-side precondition: DDL batches must start with a DDL statement.
    #[error("this batch begins with a non-DDL statement; batching is only supported for DDL")]
    NonDdlBatch,

    /// Container engine failure.
    #[error("container engine error: {0}")]
    Engine(String),

    /// A script file named by a `file` directive could not be found.
    #[error("script file not found: {}", .0.display())]
    ScriptNotFound(PathBuf),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for harness operations.
pub type Result<T> = std::result::Result<T, Error>;
