//! Fake collaborators for cluster tests: a recording container engine
//! and a scriptable client factory.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;
use serde_json::Value;

use volt_testcontainer::client::{
    ClientConfig, ClientFactory, ProcedureClient, ProcedureResponse, ResponseStatus,
};
use volt_testcontainer::engine::{ContainerEngine, ContainerHandle, ContainerSpec, CopyFile};
use volt_testcontainer::error::{Error, Result};

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Writes a placeholder license file and returns its path.
pub fn license_file(dir: &Path) -> PathBuf {
    let path = dir.join("license.xml");
    std::fs::write(&path, "<license/>").unwrap();
    path
}

/// State of one fake container, shared between the handle given to the
/// cluster and the test's assertions.
pub struct FakeContainer {
    pub name: String,
    pub hostname: String,
    pub aliases: Vec<String>,
    pub running: AtomicBool,
    /// container port -> deterministic host port
    pub ports: HashMap<u16, u16>,
    pub copied: Mutex<Vec<CopyFile>>,
    /// When set, `is_running` stays true after `stop`.
    pub refuse_stop: AtomicBool,
    /// When set, `copy_to` fails.
    pub fail_copy: AtomicBool,
}

/// Recording [`ContainerEngine`]: never touches a real runtime, hands
/// out deterministic port mappings, and can inject per-host start
/// failures.
#[derive(Default)]
pub struct FakeEngine {
    pub networks: Mutex<Vec<String>>,
    pub removed_networks: Mutex<Vec<String>>,
    pub specs: Mutex<Vec<ContainerSpec>>,
    pub containers: Mutex<Vec<Arc<FakeContainer>>>,
    pub fail_hosts: Mutex<HashSet<String>>,
    pub fail_copy_hosts: Mutex<HashSet<String>>,
    pub fail_network: AtomicBool,
    started: AtomicUsize,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_start_of(&self, hostname: &str) {
        self.fail_hosts.lock().unwrap().insert(hostname.to_string());
    }

    /// Makes copies into the named host's container fail after it has
    /// started.
    pub fn fail_copy_into(&self, hostname: &str) {
        self.fail_copy_hosts
            .lock()
            .unwrap()
            .insert(hostname.to_string());
    }

    pub fn fail_network_creation(&self) {
        self.fail_network.store(true, Ordering::SeqCst);
    }

    pub fn container(&self, hostname: &str) -> Arc<FakeContainer> {
        self.containers
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.hostname == hostname)
            .cloned()
            .unwrap_or_else(|| panic!("no container for {hostname}"))
    }

    pub fn running_containers(&self) -> usize {
        self.containers
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.running.load(Ordering::SeqCst))
            .count()
    }

    pub fn spec_for(&self, hostname: &str) -> ContainerSpec {
        self.specs
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.hostname == hostname)
            .cloned()
            .unwrap_or_else(|| panic!("no spec for {hostname}"))
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn create_network(&self, name: &str) -> Result<String> {
        if self.fail_network.load(Ordering::SeqCst) {
            return Err(Error::Engine("injected network failure".to_string()));
        }
        let id = format!("net-{name}");
        self.networks.lock().unwrap().push(id.clone());
        Ok(id)
    }

    async fn remove_network(&self, network_id: &str) -> Result<()> {
        self.removed_networks
            .lock()
            .unwrap()
            .push(network_id.to_string());
        Ok(())
    }

    async fn start(&self, spec: &ContainerSpec) -> Result<Box<dyn ContainerHandle>> {
        self.specs.lock().unwrap().push(spec.clone());
        if self.fail_hosts.lock().unwrap().contains(&spec.hostname) {
            return Err(Error::Engine(format!(
                "injected start failure for {}",
                spec.hostname
            )));
        }
        let index = self.started.fetch_add(1, Ordering::SeqCst);
        let base = 30_000 + (index as u16) * 100;
        let ports = spec
            .exposed_ports
            .iter()
            .enumerate()
            .map(|(i, &port)| (port, base + i as u16))
            .collect();
        let fail_copy = self.fail_copy_hosts.lock().unwrap().contains(&spec.hostname);
        let container = Arc::new(FakeContainer {
            name: spec.name.clone(),
            hostname: spec.hostname.clone(),
            aliases: spec.network_aliases.clone(),
            running: AtomicBool::new(true),
            ports,
            copied: Mutex::new(spec.copy_files.clone()),
            refuse_stop: AtomicBool::new(false),
            fail_copy: AtomicBool::new(fail_copy),
        });
        self.containers.lock().unwrap().push(container.clone());
        Ok(Box::new(FakeHandle(container)))
    }
}

struct FakeHandle(Arc<FakeContainer>);

#[async_trait]
impl ContainerHandle for FakeHandle {
    fn name(&self) -> &str {
        &self.0.name
    }

    fn network_aliases(&self) -> &[String] {
        &self.0.aliases
    }

    async fn is_running(&self) -> bool {
        self.0.running.load(Ordering::SeqCst)
    }

    async fn mapped_port(&self, container_port: u16) -> Result<u16> {
        self.0
            .ports
            .get(&container_port)
            .copied()
            .ok_or_else(|| Error::Engine(format!("port {container_port} not exposed")))
    }

    async fn copy_to(&self, file: &CopyFile) -> Result<()> {
        if self.0.fail_copy.load(Ordering::SeqCst) {
            return Err(Error::Engine(format!(
                "injected copy failure for {}",
                self.0.hostname
            )));
        }
        self.0.copied.lock().unwrap().push(file.clone());
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.0.refuse_stop.load(Ordering::SeqCst) {
            self.0.running.store(false, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// How a [`FakeClientFactory`] responds to connection attempts.
#[derive(Debug, Clone, Copy)]
pub enum ConnectBehavior {
    AlwaysSucceed,
    AlwaysFail,
    /// Fail the first `n` attempts per address, then succeed.
    SucceedAfter(usize),
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub address: String,
    pub procedure: String,
    pub params: Vec<Value>,
}

/// Scriptable [`ClientFactory`] recording every connection attempt and
/// every procedure call across all handed-out clients.
pub struct FakeClientFactory {
    behavior: ConnectBehavior,
    pub attempts: Mutex<HashMap<String, usize>>,
    pub calls: Arc<Mutex<Vec<RecordedCall>>>,
    pub loaded_jars: Arc<Mutex<Vec<PathBuf>>>,
}

impl FakeClientFactory {
    pub fn new(behavior: ConnectBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            attempts: Mutex::new(HashMap::new()),
            calls: Arc::new(Mutex::new(Vec::new())),
            loaded_jars: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn attempts_for(&self, address: &str) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_attempts(&self) -> usize {
        self.attempts.lock().unwrap().values().sum()
    }

    pub fn calls_to(&self, procedure: &str) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.procedure == procedure)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ClientFactory for FakeClientFactory {
    async fn connect(
        &self,
        address: &str,
        _config: &ClientConfig,
    ) -> Result<Arc<dyn ProcedureClient>> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let entry = attempts.entry(address.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        let succeed = match self.behavior {
            ConnectBehavior::AlwaysSucceed => true,
            ConnectBehavior::AlwaysFail => false,
            ConnectBehavior::SucceedAfter(n) => attempt > n,
        };
        if !succeed {
            return Err(Error::Connect(format!("connection refused: {address}")));
        }
        Ok(Arc::new(FakeClient {
            address: address.to_string(),
            calls: self.calls.clone(),
            loaded_jars: self.loaded_jars.clone(),
        }))
    }
}

struct FakeClient {
    address: String,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    loaded_jars: Arc<Mutex<Vec<PathBuf>>>,
}

fn success() -> ProcedureResponse {
    ProcedureResponse {
        status: ResponseStatus::Success,
        status_string: String::new(),
        results: Vec::new(),
    }
}

#[async_trait]
impl ProcedureClient for FakeClient {
    async fn call(&self, procedure: &str, params: &[Value]) -> Result<ProcedureResponse> {
        self.calls.lock().unwrap().push(RecordedCall {
            address: self.address.clone(),
            procedure: procedure.to_string(),
            params: params.to_vec(),
        });
        Ok(success())
    }

    async fn call_with_timeout(
        &self,
        _timeout_ms: u64,
        procedure: &str,
        params: &[Value],
    ) -> Result<ProcedureResponse> {
        self.call(procedure, params).await
    }

    async fn update_classes(
        &self,
        jar: &Path,
        classes_to_delete: Option<&str>,
    ) -> Result<ProcedureResponse> {
        self.loaded_jars.lock().unwrap().push(jar.to_path_buf());
        self.calls.lock().unwrap().push(RecordedCall {
            address: self.address.clone(),
            procedure: "@UpdateClasses".to_string(),
            params: classes_to_delete
                .map(|c| vec![Value::String(c.to_string())])
                .unwrap_or_default(),
        });
        Ok(success())
    }

    async fn close(&self) {}
}
