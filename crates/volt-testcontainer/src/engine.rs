//! Container engine contract.
//!
//! The harness never talks to a container runtime directly. Everything it
//! needs is behind [`ContainerEngine`] and [`ContainerHandle`]: start a
//! named image with env vars, copied-in files and exposed ports, stop it,
//! resolve mapped host ports, and manage a named network. The production
//! implementation drives the local `docker` binary (see [`crate::docker`]);
//! tests substitute in-memory fakes.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Budget for the engine's own readiness probe: after starting a
/// container, retry a no-op exec until it exits zero, bounded by this.
pub const PROCESS_READY_TIMEOUT: Duration = Duration::from_secs(120);

/// Source of a file copied into a container.
#[derive(Debug, Clone)]
pub enum CopySource {
    /// Literal bytes generated by the harness.
    Content(Vec<u8>),
    /// A file on the host.
    HostPath(PathBuf),
}

/// A file placed into a container, either before it starts or while it
/// is running.
#[derive(Debug, Clone)]
pub struct CopyFile {
    pub source: CopySource,
    /// Absolute target path inside the container.
    pub target: String,
    /// Unix permission bits; 0 keeps the source's permissions.
    pub mode: u32,
}

impl CopyFile {
    pub fn content(bytes: impl Into<Vec<u8>>, target: impl Into<String>, mode: u32) -> Self {
        Self {
            source: CopySource::Content(bytes.into()),
            target: target.into(),
            mode,
        }
    }

    pub fn host_path(path: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: CopySource::HostPath(path.into()),
            target: target.into(),
            mode: 0,
        }
    }
}

/// Everything needed to create and start one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: String,
    /// Unique container name.
    pub name: String,
    /// Hostname inside the container network.
    pub hostname: String,
    /// Network to attach to, if any.
    pub network_id: Option<String>,
    /// Aliases under which the container is reachable on that network.
    pub network_aliases: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Container ports published to ephemeral host ports.
    pub exposed_ports: Vec<u16>,
    /// Files copied in after create, before start.
    pub copy_files: Vec<CopyFile>,
    /// Entry command, overriding the image default.
    pub command: Vec<String>,
}

/// A container runtime the cluster delegates to.
///
/// Calls are synchronous from the caller's point of view and raise on
/// failure; `start` returns only once the container process is up and
/// answering the engine's readiness probe.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Creates a named network and returns its id.
    async fn create_network(&self, name: &str) -> Result<String>;

    /// Removes a network created by [`Self::create_network`].
    async fn remove_network(&self, id: &str) -> Result<()>;

    /// Creates and starts a container, blocking until its process is
    /// running and exec-ready, bounded by [`PROCESS_READY_TIMEOUT`].
    async fn start(&self, spec: &ContainerSpec) -> Result<Box<dyn ContainerHandle>>;
}

/// One running (or stopped) container.
#[async_trait]
pub trait ContainerHandle: Send + Sync {
    /// The container name assigned at creation.
    fn name(&self) -> &str;

    /// Network aliases the container is reachable under.
    fn network_aliases(&self) -> &[String];

    /// Whether the container process is currently running.
    async fn is_running(&self) -> bool;

    /// Host port a container port is published on.
    async fn mapped_port(&self, container_port: u16) -> Result<u16>;

    /// Copies a file into the running container.
    async fn copy_to(&self, file: &CopyFile) -> Result<()>;

    /// Stops the container. Best-effort; idempotent.
    async fn stop(&self) -> Result<()>;
}
