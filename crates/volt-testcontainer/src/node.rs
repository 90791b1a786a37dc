//! Node lifecycle: from configured to accepting client connections.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::client::{ClientFactory, PING, ProcedureClient, ProcedureResponse};
use crate::config::{
    self, DEPLOYMENT_TARGET, DR_PORT, ENTRYPOINT_PATH, EXPOSED_PORTS, LICENSE_TARGET, NetworkMode,
    NodeConfig, PRIMARY_CLIENT_PORT, TOPICS_PORT,
};
use crate::engine::{ContainerEngine, ContainerHandle, ContainerSpec, CopyFile};
use crate::error::{Error, Result};

/// Fixed interval between client connection attempts. A plain
/// fixed-interval retry, deliberately without jitter or growth.
pub const CONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Default budget for a node to become queryable.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(120);

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Configured but no container exists yet.
    Configured,
    /// A start has been submitted to the container engine.
    Starting,
    /// The container process is up and exec-ready.
    ProcessRunning,
    /// A client connection succeeded and the liveness probe answered.
    ClientReady,
    /// The start attempt failed.
    Failed,
}

/// One containerized database node.
///
/// Owns the container handle and a cached client connection. The cached
/// client is shared with callers and is never closed by internal health
/// checks.
pub struct VoltNode {
    config: NodeConfig,
    state: NodeState,
    container: Option<Box<dyn ContainerHandle>>,
    client: Option<Arc<dyn ProcedureClient>>,
    container_name: String,
    topics_public: Option<String>,
    dr_public: Option<String>,
}

impl VoltNode {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            state: NodeState::Configured,
            container: None,
            client: None,
            container_name: String::new(),
            topics_public: None,
            dr_public: None,
        }
    }

    pub fn host_id(&self) -> String {
        self.config.host_id()
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Name the engine assigned to the underlying container, empty until
    /// the node has started.
    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Advertised `host:port` for the topics sub-protocol, computed when
    /// the container process came up.
    pub fn topics_public_interface(&self) -> Option<&str> {
        self.topics_public.as_deref()
    }

    /// Advertised `host:port` for the DR sub-protocol.
    pub fn dr_public_interface(&self) -> Option<&str> {
        self.dr_public.as_deref()
    }

    /// Brings the node from configured to process-running.
    ///
    /// Resubmitting a node that already left the configured state is a
    /// no-op; the container it has is the container it keeps.
    pub async fn start(
        &mut self,
        engine: &dyn ContainerEngine,
        network_id: &str,
        container_name: &str,
    ) -> Result<()> {
        if self.state != NodeState::Configured {
            debug!(host = %self.host_id(), state = ?self.state, "start resubmitted; ignoring");
            return Ok(());
        }
        self.state = NodeState::Starting;

        let spec = self.container_spec(network_id, container_name);
        let handle = match engine.start(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                self.state = NodeState::Failed;
                return Err(Error::NodeStart {
                    host: self.host_id(),
                    reason: e.to_string(),
                });
            }
        };
        self.container_name = handle.name().to_string();
        // Store the handle before anything else can fail, so a
        // half-started node can always be stopped.
        self.container = Some(handle);

        if let Err(e) = self.stage_entrypoint().await {
            self.state = NodeState::Failed;
            if let Some(container) = &self.container
                && let Err(stop_err) = container.stop().await
            {
                warn!(host = %self.host_id(), error = %stop_err, "failed to stop node after start error");
            }
            return Err(e);
        }
        self.state = NodeState::ProcessRunning;
        info!(host = %self.host_id(), container = %self.container_name, "node process running");
        Ok(())
    }

    /// Computes the advertised interfaces and copies the rendered
    /// entrypoint into the container. Possible only once the container
    /// process exists: in Docker mode the network aliases exist once it
    /// is attached, in host mode the mapped ports exist once it is
    /// running.
    async fn stage_entrypoint(&mut self) -> Result<()> {
        let container = self.container.as_ref().ok_or_else(|| Error::NodeNotStarted {
            host: self.host_id(),
        })?;
        let topics = self
            .public_interface(&**container, self.config.topics_public_interface.clone(), TOPICS_PORT)
            .await?;
        let dr = self
            .public_interface(&**container, self.config.dr_public_interface.clone(), DR_PORT)
            .await?;
        let script = config::entrypoint_script(&topics, &dr);
        container
            .copy_to(&CopyFile::content(script, ENTRYPOINT_PATH, 0o777))
            .await?;
        self.topics_public = Some(topics);
        self.dr_public = Some(dr);
        Ok(())
    }

    async fn public_interface(
        &self,
        handle: &dyn ContainerHandle,
        override_host: Option<String>,
        port: u16,
    ) -> Result<String> {
        match self.config.network_mode {
            NetworkMode::Host => Ok(format!("localhost:{}", handle.mapped_port(port).await?)),
            NetworkMode::Docker => {
                let host = override_host
                    .or_else(|| handle.network_aliases().first().cloned())
                    .unwrap_or_else(|| handle.name().to_string());
                Ok(format!("{host}:{port}"))
            }
        }
    }

    fn container_spec(&self, network_id: &str, container_name: &str) -> ContainerSpec {
        let host_id = self.config.host_id();
        let mut copy_files = vec![
            CopyFile::host_path(self.config.license_path.clone(), LICENSE_TARGET),
            CopyFile::content(self.config.deployment_descriptor(), DEPLOYMENT_TARGET, 0),
        ];
        for (path, name) in &self.config.schemas {
            copy_files.push(CopyFile::host_path(
                path.clone(),
                format!("{}/{name}", config::SCHEMA_DIR),
            ));
        }
        for (path, name) in &self.config.class_jars {
            copy_files.push(CopyFile::host_path(
                path.clone(),
                format!("{}/{name}", config::CLASSES_DIR),
            ));
        }
        copy_files.extend(self.config.extra_files.iter().cloned());

        ContainerSpec {
            image: self.config.image.clone(),
            name: container_name.to_string(),
            hostname: host_id.clone(),
            network_id: Some(network_id.to_string()),
            network_aliases: vec![host_id],
            env: vec![
                (
                    "VOLTDB_START_CONFIG".to_string(),
                    self.config.start_command.clone(),
                ),
                ("VOLTDB_CONFIG".to_string(), DEPLOYMENT_TARGET.to_string()),
                (
                    "VOLTDB_OPTS".to_string(),
                    "-Dlog4j.configuration=file:///opt/voltdb/tools/kubernetes/console-log4j.xml \
                     --add-opens=java.base/java.net=ALL-UNNAMED \
                     --add-opens=java.base/java.lang.reflect=ALL-UNNAMED"
                        .to_string(),
                ),
            ],
            exposed_ports: EXPOSED_PORTS.to_vec(),
            copy_files,
            command: config::waiter_command(),
        }
    }

    /// Blocks until a client connection to this node succeeds, or
    /// `timeout` elapses.
    ///
    /// Each attempt opens a fresh connection and issues the liveness
    /// probe; any connection or protocol error discards the attempt and
    /// sleeps the fixed backoff before retrying. The successful client
    /// is cached and returned on subsequent calls without re-probing.
    pub async fn connected_client(
        &mut self,
        factory: &dyn ClientFactory,
        timeout: Duration,
    ) -> Result<Arc<dyn ProcedureClient>> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }

        let container = self.container.as_ref().ok_or_else(|| Error::NodeNotStarted {
            host: self.host_id(),
        })?;
        let address = format!("localhost:{}", container.mapped_port(PRIMARY_CLIENT_PORT).await?);
        let client_config = self.config.client_config();

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match factory.connect(&address, &client_config).await {
                Ok(client) => match client.call(PING, &[]).await {
                    Ok(response) if response.status.is_success() => {
                        self.client = Some(client.clone());
                        self.state = NodeState::ClientReady;
                        info!(host = %self.host_id(), %address, "node is queryable");
                        return Ok(client);
                    }
                    Ok(response) => {
                        debug!(host = %self.host_id(), status = ?response.status, "liveness probe refused");
                        client.close().await;
                    }
                    Err(e) => {
                        debug!(host = %self.host_id(), error = %e, "liveness probe failed");
                        client.close().await;
                    }
                },
                Err(e) => {
                    debug!(host = %self.host_id(), error = %e, "connection attempt failed");
                }
            }
            sleep(CONNECT_BACKOFF).await;
        }

        warn!(host = %self.host_id(), ?timeout, "node never became queryable");
        Err(Error::ReadinessTimeout {
            host: self.host_id(),
            timeout,
        })
    }

    /// The cached client, if the node has become queryable.
    pub fn client(&self) -> Option<Arc<dyn ProcedureClient>> {
        self.client.clone()
    }

    /// Whether the underlying container process is currently running.
    pub async fn is_running(&self) -> bool {
        match &self.container {
            Some(container) => container.is_running().await,
            None => false,
        }
    }

    /// Host port a container port is published on.
    pub async fn mapped_port(&self, container_port: u16) -> Result<u16> {
        let container = self.container.as_ref().ok_or_else(|| Error::NodeNotStarted {
            host: self.host_id(),
        })?;
        container.mapped_port(container_port).await
    }

    /// Stops the underlying container. Best-effort.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(container) = &self.container {
            container.stop().await?;
        }
        Ok(())
    }

    /// Runs a DDL schema through the cached client.
    pub async fn run_ddl(&self, schema: &str) -> Result<ProcedureResponse> {
        let client = self.require_client()?;
        client
            .call(crate::client::AD_HOC, &[serde_json::Value::String(schema.to_string())])
            .await
    }

    /// Loads stored-procedure classes from a jar archive.
    pub async fn load_classes(
        &self,
        jar: &std::path::Path,
        classes_to_delete: Option<&str>,
    ) -> Result<ProcedureResponse> {
        let client = self.require_client()?;
        client.update_classes(jar, classes_to_delete).await
    }

    /// Calls a named procedure through the cached client.
    pub async fn call_procedure(
        &self,
        procedure: &str,
        params: &[serde_json::Value],
    ) -> Result<ProcedureResponse> {
        let client = self.require_client()?;
        client.call(procedure, params).await
    }

    fn require_client(&self) -> Result<&Arc<dyn ProcedureClient>> {
        self.client.as_ref().ok_or_else(|| Error::NotConnected {
            host: self.host_id(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEV_IMAGE;
    use std::path::PathBuf;

    fn test_config() -> NodeConfig {
        NodeConfig::new(0, DEV_IMAGE, PathBuf::from("/tmp/license.xml"), 3, 1)
    }

    #[test]
    fn new_node_is_configured() {
        let node = VoltNode::new(test_config());
        assert_eq!(node.state(), NodeState::Configured);
        assert_eq!(node.host_id(), "host-0");
        assert!(node.client().is_none());
    }

    #[test]
    fn container_spec_carries_topology() {
        let node = VoltNode::new(test_config());
        let spec = node.container_spec("net-1", "host-0-test");

        assert_eq!(spec.hostname, "host-0");
        assert_eq!(spec.network_aliases, vec!["host-0".to_string()]);
        assert_eq!(spec.exposed_ports, EXPOSED_PORTS.to_vec());

        let start_config = spec
            .env
            .iter()
            .find(|(k, _)| k == "VOLTDB_START_CONFIG")
            .map(|(_, v)| v.clone())
            .unwrap();
        assert!(start_config.contains("--host=host-0,host-1,host-2"));

        let deployment = spec
            .copy_files
            .iter()
            .find(|f| f.target == DEPLOYMENT_TARGET)
            .unwrap();
        match &deployment.source {
            crate::engine::CopySource::Content(bytes) => {
                let xml = String::from_utf8(bytes.clone()).unwrap();
                assert!(xml.contains("hostcount=\"3\""));
                assert!(xml.contains("kfactor=\"1\""));
            }
            crate::engine::CopySource::HostPath(_) => panic!("deployment should be generated"),
        }
    }

    #[test]
    fn ops_without_client_report_not_connected() {
        let node = VoltNode::new(test_config());
        let err = node.require_client().err().unwrap();
        assert!(matches!(err, Error::NotConnected { .. }));
    }
}
