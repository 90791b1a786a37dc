//! Production container engine driving the local `docker` binary.

use std::ffi::OsStr;
use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::engine::{
    ContainerEngine, ContainerHandle, ContainerSpec, CopyFile, CopySource, PROCESS_READY_TIMEOUT,
};
use crate::error::{Error, Result};

/// Interval between exec-readiness probes.
const READY_POLL: Duration = Duration::from_secs(1);

/// [`ContainerEngine`] implementation shelling out to the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCliEngine {
    binary: String,
}

impl Default for DockerCliEngine {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

impl DockerCliEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a non-default binary, e.g. `podman`.
    pub fn with_binary(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }
}

/// Runs the container binary with `args`, returning trimmed stdout.
async fn run(binary: &str, args: impl IntoIterator<Item: AsRef<OsStr>>) -> Result<String> {
    let mut command = Command::new(binary);
    command.args(args).kill_on_drop(true);
    debug!(command = ?command.as_std(), "running");
    let output = command.output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Engine(format!(
            "{binary} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Copies one file into a container, staging in-memory content through
/// a temp file since the CLI only copies paths.
async fn copy_file(binary: &str, container: &str, file: &CopyFile) -> Result<()> {
    let staged;
    let source_path = match &file.source {
        CopySource::HostPath(path) => path.clone(),
        CopySource::Content(bytes) => {
            let mut temp = NamedTempFile::new()?;
            temp.write_all(bytes)?;
            temp.flush()?;
            #[cfg(unix)]
            if file.mode != 0 {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(temp.path(), std::fs::Permissions::from_mode(file.mode))?;
            }
            staged = temp;
            staged.path().to_path_buf()
        }
    };
    run(
        binary,
        [
            OsStr::new("cp"),
            source_path.as_os_str(),
            OsStr::new(&format!("{container}:{}", file.target)),
        ],
    )
    .await?;
    Ok(())
}

#[async_trait]
impl ContainerEngine for DockerCliEngine {
    async fn create_network(&self, name: &str) -> Result<String> {
        run(&self.binary, ["network", "create", name]).await
    }

    async fn remove_network(&self, network_id: &str) -> Result<()> {
        run(&self.binary, ["network", "rm", network_id]).await?;
        Ok(())
    }

    async fn start(&self, spec: &ContainerSpec) -> Result<Box<dyn ContainerHandle>> {
        let mut args: Vec<String> = vec![
            "create".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--hostname".to_string(),
            spec.hostname.clone(),
        ];
        if let Some(network_id) = &spec.network_id {
            args.push("--network".to_string());
            args.push(network_id.clone());
            for alias in &spec.network_aliases {
                args.push("--network-alias".to_string());
                args.push(alias.clone());
            }
        }
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        for port in &spec.exposed_ports {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        run(&self.binary, &args).await?;

        for file in &spec.copy_files {
            copy_file(&self.binary, &spec.name, file).await?;
        }
        run(&self.binary, ["start", &spec.name]).await?;

        // The entrypoint may still be unpacking; wait until an exec
        // succeeds before handing the container out.
        let deadline = Instant::now() + PROCESS_READY_TIMEOUT;
        loop {
            if run(&self.binary, ["exec", &spec.name, "echo", "ready"])
                .await
                .is_ok()
            {
                break;
            }
            if Instant::now() >= deadline {
                if let Err(e) = run(&self.binary, ["rm", "-f", &spec.name]).await {
                    warn!(container = %spec.name, error = %e, "cleanup after failed start");
                }
                return Err(Error::Engine(format!(
                    "container {} never became exec-ready",
                    spec.name
                )));
            }
            sleep(READY_POLL).await;
        }

        Ok(Box::new(DockerContainerHandle {
            binary: self.binary.clone(),
            name: spec.name.clone(),
            aliases: spec.network_aliases.clone(),
        }))
    }
}

struct DockerContainerHandle {
    binary: String,
    name: String,
    aliases: Vec<String>,
}

#[async_trait]
impl ContainerHandle for DockerContainerHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn network_aliases(&self) -> &[String] {
        &self.aliases
    }

    async fn is_running(&self) -> bool {
        matches!(
            run(
                &self.binary,
                ["inspect", "-f", "{{.State.Running}}", &self.name],
            )
            .await
            .as_deref(),
            Ok("true")
        )
    }

    async fn mapped_port(&self, container_port: u16) -> Result<u16> {
        let output = run(
            &self.binary,
            ["port", &self.name, &format!("{container_port}/tcp")],
        )
        .await?;
        parse_port_line(&output).ok_or_else(|| {
            Error::Engine(format!(
                "no published port for {container_port}/tcp on {}",
                self.name
            ))
        })
    }

    async fn copy_to(&self, file: &CopyFile) -> Result<()> {
        copy_file(&self.binary, &self.name, file).await
    }

    async fn stop(&self) -> Result<()> {
        run(&self.binary, ["stop", &self.name]).await?;
        if let Err(e) = run(&self.binary, ["rm", &self.name]).await {
            warn!(container = %self.name, error = %e, "failed to remove stopped container");
        }
        Ok(())
    }
}

/// First binding from `docker port` output, e.g.
/// `0.0.0.0:49154` or `[::]:49154`.
fn parse_port_line(output: &str) -> Option<u16> {
    let line = output.lines().next()?;
    line.rsplit(':').next()?.trim().parse().ok()
}
