//! Per-node configuration and the templated artifacts baked into a node
//! at container creation time: the deployment descriptor, the start
//! command, and the entrypoint script.

use std::fs;
use std::path::{Path, PathBuf};

use crate::client::ClientConfig;
use crate::engine::CopyFile;
use crate::error::{Error, Result};

/// Primary client port.
pub const PRIMARY_CLIENT_PORT: u16 = 21211;
/// Secondary client port.
pub const SECONDARY_CLIENT_PORT: u16 = 21212;
/// Pub/sub (topics) interface port.
pub const TOPICS_PORT: u16 = 9092;
/// Replication (DR) interface port.
pub const DR_PORT: u16 = 5555;

/// Container ports every node publishes. Fixed, not configurable.
pub const EXPOSED_PORTS: [u16; 4] = [
    SECONDARY_CLIENT_PORT,
    PRIMARY_CLIENT_PORT,
    TOPICS_PORT,
    DR_PORT,
];

/// Default developer-edition image.
pub const DEV_IMAGE: &str = "voltactivedata/volt-developer-edition:14.1.0_voltdb";

/// In-container paths the server image expects.
pub const LICENSE_TARGET: &str = "/etc/voltdb-license.xml";
pub const DEPLOYMENT_TARGET: &str = "/etc/deployment.xml";
pub const SCHEMA_DIR: &str = "/etc/schemas";
pub const CLASSES_DIR: &str = "/etc/classes";
pub const EXTENSION_DIR: &str = "/opt/voltdb/lib/extension";
pub const ENTRYPOINT_PATH: &str = "/opt/voltdb/tools/entrypoint.sh";

/// How externally-advertised addresses are computed for the topics and
/// DR sub-protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkMode {
    /// Callers reach the node from the host machine: advertise
    /// `localhost` plus the externally mapped port.
    #[default]
    Host,
    /// All communication stays inside the container network: advertise
    /// the node's network alias plus the container-internal port.
    Docker,
}

/// TLS material for client connections.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    pub enabled: bool,
    pub truststore_path: String,
    pub truststore_password: String,
    pub keystore_path: String,
    pub keystore_password: String,
}

/// Configuration of a single node, assembled at cluster construction and
/// frozen once the node starts.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    host_index: usize,
    pub image: String,
    pub license_path: PathBuf,
    pub hostcount: usize,
    pub kfactor: usize,
    pub start_command: String,
    pub network_mode: NetworkMode,
    pub tls: TlsSettings,
    pub username: String,
    pub password: String,
    /// Explicit deployment descriptor; overrides the generated one.
    pub deployment: Option<String>,
    /// Advertised hostname overrides, only honored in Docker mode.
    pub topics_public_interface: Option<String>,
    pub dr_public_interface: Option<String>,
    /// Schema files placed under [`SCHEMA_DIR`], loaded at first init.
    pub schemas: Vec<(PathBuf, String)>,
    /// Jar archives placed under [`CLASSES_DIR`], loaded at first init.
    pub class_jars: Vec<(PathBuf, String)>,
    /// Additional files copied in before start (extension jars, TLS
    /// stores and their password files).
    pub extra_files: Vec<CopyFile>,
}

impl NodeConfig {
    pub fn new(
        host_index: usize,
        image: &str,
        license_path: PathBuf,
        hostcount: usize,
        kfactor: usize,
    ) -> Self {
        Self {
            host_index,
            image: image.to_string(),
            license_path,
            hostcount,
            kfactor,
            start_command: start_command(hostcount),
            network_mode: NetworkMode::default(),
            tls: TlsSettings::default(),
            username: String::new(),
            password: String::new(),
            deployment: None,
            topics_public_interface: None,
            dr_public_interface: None,
            schemas: Vec::new(),
            class_jars: Vec::new(),
            extra_files: Vec::new(),
        }
    }

    pub fn host_index(&self) -> usize {
        self.host_index
    }

    pub fn host_id(&self) -> String {
        host_id(self.host_index)
    }

    /// The deployment descriptor baked into this node: the explicit one
    /// if configured, otherwise generated from the current topology.
    pub fn deployment_descriptor(&self) -> String {
        self.deployment
            .clone()
            .unwrap_or_else(|| deployment_descriptor(self.hostcount, self.kfactor))
    }

    /// Connection settings derived from this node's auth and TLS state.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            username: self.username.clone(),
            password: self.password.clone(),
            tls: self.tls.enabled.then(|| self.tls.clone()),
        }
    }
}

/// Stable node identity: `host-<index>`.
pub fn host_id(host_index: usize) -> String {
    format!("host-{host_index}")
}

/// The rendezvous host list every node uses for peer discovery.
pub fn rendezvous_hosts(hostcount: usize) -> Vec<String> {
    (0..hostcount).map(host_id).collect()
}

/// Start options handed to the server process via `VOLTDB_START_CONFIG`.
pub fn start_command(hostcount: usize) -> String {
    format!(
        "--ignore=thp --count={hostcount} --host={}",
        rendezvous_hosts(hostcount).join(",")
    )
}

/// Deterministic deployment descriptor for a `(hostcount, kfactor)`
/// topology, with metrics reporting on.
pub fn deployment_descriptor(hostcount: usize, kfactor: usize) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
         <deployment>\n\
         \x20   <cluster hostcount=\"{hostcount}\" sitesperhost=\"8\" kfactor=\"{kfactor}\"/>\n\
         \x20   <metrics enabled=\"true\" interval=\"60s\" maxbuffersize=\"200\" />\n\
         </deployment>\n"
    )
}

/// The entrypoint script copied into a node once its public interfaces
/// are known. Initializes the database directory on first start (picking
/// up the deployment descriptor, any staged schemas and class jars) and
/// then execs the server with the advertised topics/DR addresses.
pub fn entrypoint_script(topics_public: &str, dr_public: &str) -> String {
    format!(
        "#!/bin/sh\n\
         # Initialize a voltdb directory if needed and start an instance.\n\
         \n\
         : ${{VOLTDB_START_CONFIG:=}}\n\
         : ${{VOLTDB_DIR:=$(pwd)}}\n\
         : ${{VOLTDB_CONFIG:=}}\n\
         : ${{VOLTDB_LICENSE:={LICENSE_TARGET}}}\n\
         : ${{VOLTDB_SCHEMA:={SCHEMA_DIR}}}\n\
         : ${{VOLTDB_CLASSES:={CLASSES_DIR}}}\n\
         \n\
         s=\"\"\n\
         if [ -n \"${{VOLTDB_SCHEMA}}\" -a -e \"${{VOLTDB_SCHEMA}}\" ] ; then\n\
         \x20 s=`ls ${{VOLTDB_SCHEMA}}/*.ddl ${{VOLTDB_SCHEMA}}/*.sql | tr '\\n' ',' | sed 's/,$/\\n/'`\n\
         fi\n\
         \n\
         j=\"\"\n\
         if [ -n \"${{VOLTDB_CLASSES}}\" -a -e \"${{VOLTDB_CLASSES}}\" ] ; then\n\
         \x20 j=`ls ${{VOLTDB_CLASSES}}/*.jar | tr '\\n' ',' | sed 's/,$/\\n/'`\n\
         fi\n\
         \n\
         echo \"Schemas requested to load: \" $s\n\
         echo \"Classes requested to load: \" $j\n\
         \n\
         if [ ! -e ${{VOLTDB_DIR}}/voltdbroot ] ; then\n\
         \x20   if [ -n \"${{VOLTDB_CONFIG}}\" -a -e \"${{VOLTDB_CONFIG}}\" ] ; then\n\
         \x20       INIT_CMD=\"voltdb init -C ${{VOLTDB_CONFIG}} -D ${{VOLTDB_DIR}} --license=${{VOLTDB_LICENSE}}\"\n\
         \x20   else\n\
         \x20       INIT_CMD=\"voltdb init -D ${{VOLTDB_DIR}} --license=${{VOLTDB_LICENSE}}\"\n\
         \x20   fi\n\
         \x20   if [ ! -z $s ] ; then\n\
         \x20       INIT_CMD=\"$INIT_CMD -s $s\"\n\
         \x20   fi\n\
         \x20   if [ ! -z $j ] ; then\n\
         \x20       INIT_CMD=\"$INIT_CMD -j $j\"\n\
         \x20   fi\n\
         \x20   echo $INIT_CMD\n\
         \x20   eval $INIT_CMD\n\
         fi\n\
         \n\
         exec voltdb start -D ${{VOLTDB_DIR}} ${{VOLTDB_START_CONFIG}} \
         --topicspublic={topics_public} --drpublic={dr_public} \"$@\"\n"
    )
}

/// The in-container command every node runs: wait for the entrypoint
/// script to appear (it is copied in once mapped ports are known), then
/// exec it.
pub fn waiter_command() -> Vec<String> {
    vec![
        "/bin/bash".to_string(),
        "-c".to_string(),
        format!("while [ ! -f {ENTRYPOINT_PATH} ]; do sleep 1; done; {ENTRYPOINT_PATH}"),
    ]
}

/// Lists the `*.jar` files in a directory, for the extension path.
pub fn jar_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut jars = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| {
        Error::Config(format!("cannot read extra-library directory {}: {e}", dir.display()))
    })? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "jar") {
            jars.push(path);
        }
    }
    jars.sort();
    Ok(jars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// Test-double parser: recovers (hostcount, kfactor) from a
    /// generated descriptor.
    fn parse_descriptor(xml: &str) -> (usize, usize) {
        let attr = |name: &str| {
            let tag = format!("{name}=\"");
            let at = xml.find(&tag).unwrap() + tag.len();
            xml[at..xml[at..].find('"').unwrap() + at].parse().unwrap()
        };
        (attr("hostcount"), attr("kfactor"))
    }

    #[test]
    fn descriptor_roundtrip() {
        for (hosts, k) in [(1, 0), (3, 1), (5, 2)] {
            let xml = deployment_descriptor(hosts, k);
            assert_eq!(parse_descriptor(&xml), (hosts, k));
            assert!(xml.contains("sitesperhost=\"8\""));
            assert!(xml.contains("<metrics enabled=\"true\""));
        }
    }

    #[test]
    fn descriptor_is_deterministic() {
        assert_eq!(deployment_descriptor(3, 1), deployment_descriptor(3, 1));
    }

    #[test]
    fn start_command_lists_all_rendezvous_hosts() {
        assert_eq!(
            start_command(3),
            "--ignore=thp --count=3 --host=host-0,host-1,host-2"
        );
        assert_eq!(start_command(1), "--ignore=thp --count=1 --host=host-0");
    }

    #[test]
    fn entrypoint_bakes_public_interfaces() {
        let script = entrypoint_script("localhost:49092", "localhost:45555");
        assert!(script.contains("--topicspublic=localhost:49092"));
        assert!(script.contains("--drpublic=localhost:45555"));
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("voltdb init"));
    }

    #[test]
    fn node_config_regenerates_descriptor_on_kfactor_change() {
        let mut config = NodeConfig::new(0, DEV_IMAGE, PathBuf::from("/l.xml"), 3, 0);
        let before = config.deployment_descriptor();
        config.kfactor = 1;
        let after = config.deployment_descriptor();
        assert_ne!(before, after);
        assert_eq!(parse_descriptor(&after), (3, 1));
    }

    #[test]
    fn explicit_deployment_wins_over_generated() {
        let mut config = NodeConfig::new(0, DEV_IMAGE, PathBuf::from("/l.xml"), 3, 1);
        config.deployment = Some("<deployment/>".to_string());
        assert_eq!(config.deployment_descriptor(), "<deployment/>");
    }

    #[test]
    fn client_config_reflects_tls_state() {
        let mut config = NodeConfig::new(0, DEV_IMAGE, PathBuf::from("/l.xml"), 1, 0);
        assert!(config.client_config().tls.is_none());

        config.tls.enabled = true;
        config.tls.truststore_path = "/stores/trust.jks".to_string();
        let client = config.client_config();
        assert_eq!(client.tls.unwrap().truststore_path, "/stores/trust.jks");
    }

    #[test]
    fn jar_files_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.jar"), b"jar").unwrap();
        fs::write(dir.path().join("a.jar"), b"jar").unwrap();
        fs::write(dir.path().join("notes.txt"), b"txt").unwrap();

        let jars = jar_files(dir.path()).unwrap();
        assert_eq!(jars.len(), 2);
        assert_eq!(jars[0].file_name().unwrap(), "a.jar");
        assert_eq!(jars[1].file_name().unwrap(), "b.jar");
    }
}
