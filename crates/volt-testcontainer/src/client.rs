//! Database client contract.
//!
//! The client wire protocol lives outside this crate. The harness only
//! needs "call a named procedure with parameters over an authenticated
//! connection; receive a status and zero or more result tables", which
//! is what [`ProcedureClient`] captures. [`ClientFactory`] is the seam
//! through which a real driver (or a test fake) is injected.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::TlsSettings;
use crate::error::Result;

/// Liveness probe procedure; answering it successfully is the definition
/// of a node being queryable.
pub const PING: &str = "@Ping";

/// Ad-hoc SQL/DDL execution procedure.
pub const AD_HOC: &str = "@AdHoc";

/// Status of a procedure call response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Success,
    UserAbort,
    GracefulFailure,
    UnexpectedFailure,
    ConnectionLost,
}

impl ResponseStatus {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// One result table returned by a procedure call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultTable {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Response to a procedure call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureResponse {
    pub status: ResponseStatus,
    pub status_string: String,
    pub results: Vec<ResultTable>,
}

impl ProcedureResponse {
    /// A bare success response with no result tables.
    pub fn success() -> Self {
        Self {
            status: ResponseStatus::Success,
            status_string: String::new(),
            results: Vec::new(),
        }
    }
}

/// Connection settings handed to the [`ClientFactory`].
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Empty means anonymous.
    pub username: String,
    pub password: String,
    /// TLS settings; `None` for plaintext.
    pub tls: Option<TlsSettings>,
}

/// Creates connected clients. One factory serves every node in a
/// cluster; the address distinguishes them.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Opens a fresh connection to `address` (`host:port`) and returns a
    /// client, or raises on any connection or protocol error.
    async fn connect(&self, address: &str, config: &ClientConfig)
    -> Result<Arc<dyn ProcedureClient>>;
}

/// An authenticated connection to one node.
#[async_trait]
pub trait ProcedureClient: Send + Sync {
    /// Calls a named procedure with the given parameters.
    async fn call(&self, procedure: &str, params: &[Value]) -> Result<ProcedureResponse>;

    /// Like [`Self::call`] with a per-call timeout override.
    async fn call_with_timeout(
        &self,
        timeout_ms: u64,
        procedure: &str,
        params: &[Value],
    ) -> Result<ProcedureResponse>;

    /// Loads (and optionally deletes) stored-procedure classes from a
    /// jar archive.
    async fn update_classes(
        &self,
        jar: &Path,
        classes_to_delete: Option<&str>,
    ) -> Result<ProcedureResponse>;

    /// Closes the connection.
    async fn close(&self);
}
