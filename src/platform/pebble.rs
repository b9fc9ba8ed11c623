//! [`Workload`] backed by the `pebble` command line client
//!
//! File transfer goes through a local scratch directory because `pebble
//! push` and `pebble pull` only work with paths on both ends.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::Workload;
use crate::consul::{Layer, Plan};
use crate::error::{Error, Result};

/// Environment variable read by the pebble client for the socket path
pub const PEBBLE_SOCKET_ENV: &str = "PEBBLE_SOCKET";

#[derive(Debug)]
pub struct PebbleCli {
    bin: PathBuf,
    socket: Option<PathBuf>,
    scratch_dir: PathBuf,
    counter: AtomicU64,
}

impl PebbleCli {
    pub fn new(bin: impl Into<PathBuf>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            socket: None,
            scratch_dir: scratch_dir.into(),
            counter: AtomicU64::new(0),
        }
    }

    /// Talk to the supervisor on `socket` instead of the client default
    pub fn with_socket(mut self, socket: Option<PathBuf>) -> Self {
        self.socket = socket;
        self
    }

    fn scratch_file(&self, stem: &str) -> PathBuf {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        self.scratch_dir
            .join(format!("{}-{}-{}", stem, std::process::id(), n))
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!("Running pebble {:?}", args);
        let mut cmd = Command::new(&self.bin);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(socket) = &self.socket {
            cmd.env(PEBBLE_SOCKET_ENV, socket);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| Error::WorkloadError(format!("cannot run pebble: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::WorkloadError(
                stderr.trim().trim_start_matches("error: ").to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// A fresh scratch path; the directory is created on demand
    async fn scratch(&self, stem: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        Ok(self.scratch_file(stem))
    }

    async fn discard(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("Leaving scratch file {}: {}", path.display(), e);
            }
        }
    }

    async fn pull_into(&self, remote: &str, local: &Path) -> Result<Option<String>> {
        let local_str = local.to_string_lossy();
        match self.run(&["pull", remote, &*local_str]).await {
            Ok(_) => Ok(Some(tokio::fs::read_to_string(local).await?)),
            Err(Error::WorkloadError(msg)) if is_not_found(&msg) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn push_from(&self, local: &Path, remote: &str, content: &str) -> Result<()> {
        tokio::fs::write(local, content).await?;
        let local_str = local.to_string_lossy();
        self.run(&["push", "--parents", &*local_str, remote])
            .await
            .map(|_| ())
    }

    async fn add_from(&self, local: &Path, label: &str, yaml: &str) -> Result<()> {
        tokio::fs::write(local, yaml).await?;
        let local_str = local.to_string_lossy();
        self.run(&["add", "--combine", label, &*local_str])
            .await
            .map(|_| ())
    }
}

fn is_not_found(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("not found") || lower.contains("no such file")
}

#[async_trait]
impl Workload for PebbleCli {
    async fn can_connect(&self) -> bool {
        match self.run(&["services"]).await {
            Ok(_) => true,
            Err(e) => {
                debug!("Pebble not reachable: {}", e);
                false
            }
        }
    }

    #[instrument(skip(self))]
    async fn pull(&self, path: &str) -> Result<Option<String>> {
        let local = self.scratch("pull").await?;
        let result = self.pull_into(path, &local).await;
        self.discard(&local).await;
        result
    }

    #[instrument(skip(self, content))]
    async fn push(&self, path: &str, content: &str) -> Result<()> {
        let local = self.scratch("push").await?;
        let result = self.push_from(&local, path, content).await;
        self.discard(&local).await;
        result
    }

    async fn plan(&self) -> Result<Plan> {
        let text = self.run(&["plan"]).await?;
        Ok(Plan::from_yaml(&text)?)
    }

    #[instrument(skip(self, layer))]
    async fn add_layer(&self, label: &str, layer: &Layer) -> Result<()> {
        let yaml = layer.to_yaml()?;
        let local = self.scratch("layer").await?;
        let result = self.add_from(&local, label, &yaml).await;
        self.discard(&local).await;
        result
    }

    #[instrument(skip(self))]
    async fn restart(&self, service: &str) -> Result<()> {
        self.run(&["restart", service]).await.map(|_| ())
    }
}
