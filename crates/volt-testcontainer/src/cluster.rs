//! Cluster orchestration: concurrent node startup, readiness, and
//! cluster-wide convenience operations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::client::{AD_HOC, ClientFactory, ProcedureClient, ProcedureResponse};
use crate::config::{
    self, DEV_IMAGE, EXTENSION_DIR, NetworkMode, NodeConfig, PRIMARY_CLIENT_PORT,
    SECONDARY_CLIENT_PORT,
};
use crate::engine::{ContainerEngine, CopyFile};
use crate::error::{Error, Result};
use crate::license::resolve_license;
use crate::node::{DEFAULT_CONNECT_TIMEOUT, VoltNode};
use crate::script::ScriptRunner;

/// Ceiling for waiting on a node to stop during shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
/// Interval between liveness checks while waiting for a stop.
const SHUTDOWN_POLL: Duration = Duration::from_secs(5);

static INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A cluster of containerized database nodes sharing one network.
///
/// Construction resolves the license and builds per-node configuration;
/// nothing touches the container engine until [`start`](Self::start).
/// All `with_*` configuration is rejected with [`Error::AlreadyStarted`]
/// once `start` has been called, since every setting is baked into the
/// containers at creation.
pub struct VoltCluster {
    engine: Arc<dyn ContainerEngine>,
    factory: Arc<dyn ClientFactory>,
    configs: HashMap<String, NodeConfig>,
    nodes: HashMap<String, Arc<Mutex<VoltNode>>>,
    network_name: String,
    network_id: Option<String>,
    start_concurrency: usize,
    started: bool,
    nonce: String,
}

impl VoltCluster {
    /// A single-node cluster on the developer-edition image.
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        factory: Arc<dyn ClientFactory>,
        license: Option<&Path>,
    ) -> Result<Self> {
        Self::with_topology(engine, factory, license, DEV_IMAGE, 1, 0, None)
    }

    /// A cluster of `hostcount` nodes with the given replication factor.
    ///
    /// Jar files in `extra_libs` are copied into every node's extension
    /// directory before start.
    pub fn with_topology(
        engine: Arc<dyn ContainerEngine>,
        factory: Arc<dyn ClientFactory>,
        license: Option<&Path>,
        image: &str,
        hostcount: usize,
        kfactor: usize,
        extra_libs: Option<&Path>,
    ) -> Result<Self> {
        if hostcount < 1 {
            return Err(Error::Config(format!(
                "hostcount must be at least 1, got {hostcount}"
            )));
        }
        if kfactor >= hostcount {
            return Err(Error::Config(format!(
                "kfactor {kfactor} requires more than {kfactor} hosts, got {hostcount}"
            )));
        }
        let license_path = resolve_license(license)?;

        let extension_jars = match extra_libs {
            Some(dir) => config::jar_files(dir)?,
            None => Vec::new(),
        };

        let mut configs = HashMap::new();
        for host_index in 0..hostcount {
            let mut node_config =
                NodeConfig::new(host_index, image, license_path.clone(), hostcount, kfactor);
            for jar in &extension_jars {
                let name = jar_name(jar)?;
                node_config
                    .extra_files
                    .push(CopyFile::host_path(jar.clone(), format!("{EXTENSION_DIR}/{name}")));
            }
            configs.insert(node_config.host_id(), node_config);
        }

        let nonce = format!(
            "{}-{}",
            std::process::id(),
            INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        info!(hostcount, kfactor, image, license = %license_path.display(), "cluster configured");
        Ok(Self {
            engine,
            factory,
            configs,
            nodes: HashMap::new(),
            network_name: format!("volt-net-{nonce}"),
            network_id: None,
            start_concurrency: 1,
            started: false,
            nonce,
        })
    }

    fn ensure_not_started(&self) -> Result<()> {
        if self.started {
            return Err(Error::AlreadyStarted);
        }
        Ok(())
    }

    fn each_config(mut self, apply: impl Fn(&mut NodeConfig)) -> Result<Self> {
        self.ensure_not_started()?;
        for node_config in self.configs.values_mut() {
            apply(node_config);
        }
        Ok(self)
    }

    /// TLS truststore for client connections; the store and its password
    /// are also copied into every container under `/etc/ssl/`.
    pub fn with_truststore(self, truststore: impl Into<PathBuf>, password: &str) -> Result<Self> {
        let truststore = truststore.into();
        if !truststore.is_file() {
            return Err(Error::Config(format!(
                "truststore not found: {}",
                truststore.display()
            )));
        }
        self.each_config(|c| {
            c.tls.enabled = true;
            c.tls.truststore_path = truststore.display().to_string();
            c.tls.truststore_password = password.to_string();
            c.extra_files.push(CopyFile::host_path(
                truststore.clone(),
                "/etc/ssl/truststore.jks",
            ));
            c.extra_files.push(CopyFile::content(
                password.to_string(),
                "/etc/ssl/truststore.pswd",
                0o777,
            ));
        })
    }

    /// TLS keystore holding the server identity, copied into every
    /// container under `/etc/ssl/`.
    pub fn with_keystore(self, keystore: impl Into<PathBuf>, password: &str) -> Result<Self> {
        let keystore = keystore.into();
        if !keystore.is_file() {
            return Err(Error::Config(format!(
                "keystore not found: {}",
                keystore.display()
            )));
        }
        self.each_config(|c| {
            c.tls.enabled = true;
            c.tls.keystore_path = keystore.display().to_string();
            c.tls.keystore_password = password.to_string();
            c.extra_files
                .push(CopyFile::host_path(keystore.clone(), "/etc/ssl/keystore.jks"));
            c.extra_files.push(CopyFile::content(
                password.to_string(),
                "/etc/ssl/keystore.pswd",
                0o777,
            ));
        })
    }

    pub fn with_username_and_password(self, username: &str, password: &str) -> Result<Self> {
        self.each_config(|c| {
            c.username = username.to_string();
            c.password = password.to_string();
        })
    }

    /// Replaces the generated deployment descriptor with the contents of
    /// a file on disk.
    pub fn with_deployment_resource(self, path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        self.with_deployment_content(&content)
    }

    /// Replaces the generated deployment descriptor with explicit XML.
    pub fn with_deployment_content(self, content: &str) -> Result<Self> {
        self.each_config(|c| c.deployment = Some(content.to_string()))
    }

    /// A schema file loaded into the database on first initialization.
    pub fn with_initial_schema(self, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let name = file_name(&path)?;
        self.each_config(|c| c.schemas.push((path.clone(), name.clone())))
    }

    /// A stored-procedure jar loaded on first initialization.
    pub fn with_initial_classes(self, jar: impl Into<PathBuf>) -> Result<Self> {
        let jar = jar.into();
        let name = jar_name(&jar)?;
        self.each_config(|c| c.class_jars.push((jar.clone(), name.clone())))
    }

    /// Every jar under `dir`, loaded on first initialization.
    pub fn with_initial_class_jars(self, dir: impl AsRef<Path>) -> Result<Self> {
        let jars = config::jar_files(dir.as_ref())?;
        let mut named = Vec::with_capacity(jars.len());
        for jar in jars {
            let name = jar_name(&jar)?;
            named.push((jar, name));
        }
        self.each_config(|c| c.class_jars.extend(named.iter().cloned()))
    }

    /// Changes the replication factor, regenerating the deployment
    /// descriptor for the current topology.
    pub fn with_ksafety(self, kfactor: usize) -> Result<Self> {
        self.ensure_not_started()?;
        let hostcount = self.configs.len();
        if kfactor >= hostcount {
            return Err(Error::Config(format!(
                "kfactor {kfactor} requires more than {kfactor} hosts, got {hostcount}"
            )));
        }
        self.each_config(|c| c.kfactor = kfactor)
    }

    pub fn with_network_mode(self, mode: NetworkMode) -> Result<Self> {
        self.each_config(|c| c.network_mode = mode)
    }

    /// Names the cluster network instead of the generated default.
    pub fn with_network_name(mut self, name: &str) -> Result<Self> {
        self.ensure_not_started()?;
        self.network_name = name.to_string();
        Ok(self)
    }

    /// Overrides the advertised topics interface of one node. Only
    /// honored in Docker network mode.
    pub fn with_topic_public_interface(self, host_index: usize, interface: &str) -> Result<Self> {
        self.override_interface(host_index, interface, |c, v| {
            c.topics_public_interface = Some(v);
        })
    }

    /// Overrides the advertised DR interface of one node.
    pub fn with_dr_public_interface(self, host_index: usize, interface: &str) -> Result<Self> {
        self.override_interface(host_index, interface, |c, v| {
            c.dr_public_interface = Some(v);
        })
    }

    fn override_interface(
        mut self,
        host_index: usize,
        interface: &str,
        apply: impl FnOnce(&mut NodeConfig, String),
    ) -> Result<Self> {
        self.ensure_not_started()?;
        let host_id = config::host_id(host_index);
        let node_config = self
            .configs
            .get_mut(&host_id)
            .ok_or_else(|| Error::Config(format!("no such host: {host_id}")))?;
        apply(node_config, interface.to_string());
        Ok(self)
    }

    /// Bounds how many node starts run against the engine at once.
    /// Default 1: starts are serialized while the caller blocks on the
    /// aggregate.
    pub fn with_start_concurrency(mut self, permits: usize) -> Result<Self> {
        self.ensure_not_started()?;
        if permits < 1 {
            return Err(Error::Config(format!(
                "start concurrency must be at least 1, got {permits}"
            )));
        }
        self.start_concurrency = permits;
        Ok(self)
    }

    /// Starts every node and blocks until the whole cluster is
    /// queryable, with the default 120 s per-node readiness budget.
    pub async fn start(&mut self) -> Result<()> {
        self.start_with_timeout(DEFAULT_CONNECT_TIMEOUT).await
    }

    /// Starts every node and blocks until the whole cluster is
    /// queryable.
    ///
    /// On any node failure the nodes that did start are stopped before
    /// the first error is returned, so a failed start leaks no
    /// containers. Calling `start` again resubmits every node; resubmits
    /// of nodes that already started are no-ops.
    pub async fn start_with_timeout(&mut self, timeout: Duration) -> Result<()> {
        let network_id = match &self.network_id {
            Some(id) => id.clone(),
            None => {
                let id = self.engine.create_network(&self.network_name).await?;
                info!(network = %self.network_name, id = %id, "created cluster network");
                self.network_id = Some(id.clone());
                id
            }
        };
        // Nothing is created before the network, so a network-creation
        // failure leaves the cluster reconfigurable. From here on the
        // configuration is frozen.
        self.started = true;

        if self.nodes.is_empty() {
            for (host_id, node_config) in &self.configs {
                self.nodes.insert(
                    host_id.clone(),
                    Arc::new(Mutex::new(VoltNode::new(node_config.clone()))),
                );
            }
        }

        let permits = Arc::new(Semaphore::new(self.start_concurrency));
        let mut tasks = Vec::with_capacity(self.nodes.len());
        for (host_id, node) in &self.nodes {
            let node = node.clone();
            let engine = self.engine.clone();
            let network_id = network_id.clone();
            let container_name = format!("{host_id}-{}", self.nonce);
            let permits = permits.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::Engine(e.to_string()))?;
                node.lock()
                    .await
                    .start(engine.as_ref(), &network_id, &container_name)
                    .await
            }));
        }

        let mut first_error: Option<Error> = None;
        for task in tasks {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(Error::Engine(format!("start task failed: {e}"))),
            };
            if let Err(e) = outcome
                && first_error.is_none()
            {
                first_error = Some(e);
            }
        }
        if let Some(e) = first_error {
            warn!(error = %e, "cluster start failed; stopping nodes that started");
            self.stop_all_nodes().await;
            return Err(e);
        }

        // All processes are up; now wait for each node to answer queries.
        for node in self.nodes.values() {
            let outcome = node
                .lock()
                .await
                .connected_client(self.factory.as_ref(), timeout)
                .await;
            if let Err(e) = outcome {
                warn!(error = %e, "cluster never became queryable; stopping nodes");
                self.stop_all_nodes().await;
                return Err(e);
            }
        }
        info!(nodes = self.nodes.len(), "cluster is up");
        Ok(())
    }

    async fn stop_all_nodes(&self) {
        for (host_id, node) in &self.nodes {
            if let Err(e) = node.lock().await.stop().await {
                warn!(host = %host_id, error = %e, "failed to stop node");
            }
        }
    }

    async fn first_running_node(&self) -> Result<Arc<Mutex<VoltNode>>> {
        // Map-iteration order: arbitrary but stable within one call.
        for node in self.nodes.values() {
            if node.lock().await.is_running().await {
                return Ok(node.clone());
            }
        }
        Err(Error::NoRunningNode)
    }

    /// A client connected to some running node.
    pub async fn client(&self) -> Result<Arc<dyn ProcedureClient>> {
        let node = self.first_running_node().await?;
        let client = node
            .lock()
            .await
            .connected_client(self.factory.as_ref(), DEFAULT_CONNECT_TIMEOUT)
            .await?;
        Ok(client)
    }

    /// A client connected to the named node.
    pub async fn client_for(&self, host_id: &str) -> Result<Arc<dyn ProcedureClient>> {
        let node = self
            .nodes
            .get(host_id)
            .ok_or_else(|| Error::Config(format!("no such host: {host_id}")))?;
        let client = node
            .lock()
            .await
            .connected_client(self.factory.as_ref(), DEFAULT_CONNECT_TIMEOUT)
            .await?;
        Ok(client)
    }

    /// Runs a DDL batch on some running node, failing on a non-success
    /// response.
    pub async fn run_ddl(&self, schema: &str) -> Result<ProcedureResponse> {
        let client = self.client().await?;
        let response = client
            .call(AD_HOC, &[serde_json::Value::String(schema.to_string())])
            .await?;
        checked(response)
    }

    /// Runs a SQL script file on some running node.
    pub async fn run_ddl_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let client = self.client().await?;
        ScriptRunner::new(client.as_ref()).run_file(path.as_ref()).await
    }

    /// Loads stored-procedure classes from a jar archive.
    pub async fn load_classes(&self, jar: impl AsRef<Path>) -> Result<ProcedureResponse> {
        let client = self.client().await?;
        checked(client.update_classes(jar.as_ref(), None).await?)
    }

    /// Loads stored-procedure classes, removing the named classes first
    /// (comma-separated).
    pub async fn load_classes_with_deletes(
        &self,
        jar: impl AsRef<Path>,
        classes_to_delete: &str,
    ) -> Result<ProcedureResponse> {
        let client = self.client().await?;
        checked(
            client
                .update_classes(jar.as_ref(), Some(classes_to_delete))
                .await?,
        )
    }

    /// Calls a named procedure on some running node. The response is
    /// returned as-is; callers inspect the status.
    pub async fn call_procedure(
        &self,
        procedure: &str,
        params: &[serde_json::Value],
    ) -> Result<ProcedureResponse> {
        let client = self.client().await?;
        client.call(procedure, params).await
    }

    /// Host port the secondary client port of some running node is
    /// published on.
    pub async fn first_mapped_port(&self) -> Result<u16> {
        self.mapped_port(SECONDARY_CLIENT_PORT).await
    }

    /// Host port a container port of some running node is published on.
    pub async fn mapped_port(&self, container_port: u16) -> Result<u16> {
        let node = self.first_running_node().await?;
        let port = node.lock().await.mapped_port(container_port).await?;
        Ok(port)
    }

    /// Hostname clients connect to.
    pub fn host(&self) -> &'static str {
        "localhost"
    }

    /// `host:port` of the primary client port of some running node.
    pub async fn host_and_port(&self) -> Result<String> {
        let port = self.mapped_port(PRIMARY_CLIENT_PORT).await?;
        Ok(format!("{}:{port}", self.host()))
    }

    /// Network the cluster's containers are attached to.
    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    /// Stops every node and removes the cluster network. Best-effort: a
    /// node that never stops is abandoned with a warning, never an
    /// error.
    pub async fn shutdown(&mut self) {
        for (host_id, node) in &self.nodes {
            let mut node = node.lock().await;
            if let Err(e) = node.stop().await {
                warn!(host = %host_id, error = %e, "stop failed");
            }
            let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
            while node.is_running().await {
                if Instant::now() >= deadline {
                    warn!(host = %host_id, "node still running after stop; abandoning");
                    break;
                }
                sleep(SHUTDOWN_POLL).await;
            }
        }
        if let Some(network_id) = self.network_id.take() {
            if let Err(e) = self.engine.remove_network(&network_id).await {
                warn!(network = %network_id, error = %e, "failed to remove network");
            }
        }
        info!("cluster shutdown complete");
    }
}

fn checked(response: ProcedureResponse) -> Result<ProcedureResponse> {
    if response.status.is_success() {
        Ok(response)
    } else {
        Err(Error::Procedure {
            status: response.status,
            message: response.status_string,
        })
    }
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Config(format!("not a file path: {}", path.display())))
}

fn jar_name(path: &Path) -> Result<String> {
    let name = file_name(path)?;
    if !name.ends_with(".jar") {
        return Err(Error::Config(format!("not a jar file: {}", path.display())));
    }
    Ok(name)
}
