//! [`Model`] backed by the Juju hook tools
//!
//! Every call spawns one hook tool (`is-leader`, `relation-get`, ...) and
//! decodes its `--format=json` output. The tools are found on `PATH` unless
//! an explicit directory is configured.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{Databag, DatabagContent, Model, OpenPort, RelationId, Status};
use crate::config::CharmConfig;
use crate::error::{Error, Result};

/// Hook tool client for a single unit
#[derive(Clone, Debug)]
pub struct HookTools {
    unit_name: String,
    tools_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct GoalState {
    #[serde(default)]
    units: BTreeMap<String, GoalUnit>,
}

#[derive(Debug, Deserialize)]
struct GoalUnit {
    #[serde(default)]
    status: String,
}

impl HookTools {
    pub fn new(unit_name: impl Into<String>) -> Self {
        Self {
            unit_name: unit_name.into(),
            tools_dir: None,
        }
    }

    /// Resolve tools from `dir` instead of `PATH`
    pub fn with_tools_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.tools_dir = dir;
        self
    }

    /// `consul/0` -> `consul`
    pub fn app_name(&self) -> &str {
        self.unit_name
            .split_once('/')
            .map(|(app, _)| app)
            .unwrap_or(&self.unit_name)
    }

    fn command(&self, tool: &str) -> Command {
        let program = match &self.tools_dir {
            Some(dir) => dir.join(tool),
            None => PathBuf::from(tool),
        };
        let mut cmd = Command::new(program);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, tool: &str, args: &[&str]) -> Result<String> {
        self.run_with_stdin(tool, args, None).await
    }

    async fn run_with_stdin(
        &self,
        tool: &str,
        args: &[&str],
        input: Option<&str>,
    ) -> Result<String> {
        debug!("Running hook tool {} {:?}", tool, args);
        let mut cmd = self.command(tool);
        cmd.args(args);
        if input.is_some() {
            cmd.stdin(Stdio::piped());
        }

        let mut child = cmd.spawn().map_err(|e| Error::HookToolError {
            tool: tool.to_string(),
            message: e.to_string(),
        })?;

        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(input.as_bytes()).await?;
            stdin.flush().await?;
            drop(stdin);
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::HookToolError {
                tool: tool.to_string(),
                message: format!("{}: {}", output.status, stderr.trim()),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run_json<T: serde::de::DeserializeOwned>(
        &self,
        tool: &str,
        args: &[&str],
    ) -> Result<T> {
        let mut full = vec!["--format=json"];
        full.extend_from_slice(args);
        let stdout = self.run(tool, &full).await?;
        if stdout.is_empty() {
            return Ok(serde_json::from_str("null")?);
        }
        Ok(serde_json::from_str(&stdout)?)
    }

    async fn remote_app(&self, relation: &RelationId) -> Result<Option<String>> {
        let rel = relation.to_string();
        self.run_json("relation-list", &["-r", rel.as_str(), "--app"]).await
    }
}

#[async_trait]
impl Model for HookTools {
    async fn is_leader(&self) -> Result<bool> {
        self.run_json("is-leader", &[]).await
    }

    async fn config(&self) -> Result<CharmConfig> {
        let value: Option<serde_json::Value> = self.run_json("config-get", &[]).await?;
        CharmConfig::from_json(value.unwrap_or_else(|| serde_json::json!({})))
    }

    async fn planned_units(&self) -> Result<u32> {
        let goal: GoalState = self.run_json("goal-state", &[]).await?;
        let planned = goal
            .units
            .values()
            .filter(|unit| unit.status != "dying")
            .count();
        // goal-state may lag behind our own unit during install.
        Ok(u32::try_from(planned.max(1)).unwrap_or(u32::MAX))
    }

    async fn relation_ids(&self, endpoint: &str) -> Result<Vec<RelationId>> {
        let ids: Option<Vec<String>> = self.run_json("relation-ids", &[endpoint]).await?;
        ids.unwrap_or_default().iter().map(|id| id.parse()).collect()
    }

    async fn relation_get(&self, relation: &RelationId, bag: Databag) -> Result<DatabagContent> {
        let rel = relation.to_string();
        let (owner, app_flag) = match bag {
            Databag::LocalUnit => (self.unit_name.clone(), false),
            Databag::LocalApp => (self.app_name().to_string(), true),
            Databag::RemoteApp => match self.remote_app(relation).await? {
                Some(app) => (app, true),
                None => return Ok(DatabagContent::new()),
            },
        };

        let mut args = vec!["-r", rel.as_str()];
        if app_flag {
            args.push("--app");
        }
        args.extend_from_slice(&["-", owner.as_str()]);

        let data: Option<DatabagContent> = self.run_json("relation-get", &args).await?;
        Ok(data.unwrap_or_default())
    }

    async fn relation_set(
        &self,
        relation: &RelationId,
        bag: Databag,
        data: &DatabagContent,
    ) -> Result<()> {
        let rel = relation.to_string();
        let mut args = vec!["-r", rel.as_str()];
        match bag {
            Databag::LocalApp => args.push("--app"),
            Databag::LocalUnit => {}
            Databag::RemoteApp => {
                return Err(Error::RelationDataError(format!(
                    "cannot write the remote application databag of {rel}"
                )))
            }
        }
        args.extend_from_slice(&["--file", "-"]);

        let document = serde_yaml::to_string(data)?;
        self.run_with_stdin("relation-set", &args, Some(&document))
            .await
            .map(|_| ())
    }

    async fn set_unit_status(&self, status: &Status) -> Result<()> {
        let level = status.level.to_string();
        self.run("status-set", &[level.as_str(), status.message.as_str()])
            .await
            .map(|_| ())
    }

    async fn set_app_status(&self, status: &Status) -> Result<()> {
        let level = status.level.to_string();
        self.run(
            "status-set",
            &["--application", level.as_str(), status.message.as_str()],
        )
        .await
        .map(|_| ())
    }

    async fn opened_ports(&self) -> Result<Vec<OpenPort>> {
        let ports: Option<Vec<String>> = self.run_json("opened-ports", &[]).await?;
        let mut parsed = Vec::new();
        for port in ports.unwrap_or_default() {
            match port.parse() {
                Ok(p) => parsed.push(p),
                // Ranges are never opened by this charm.
                Err(e) => warn!("Ignoring opened port {}: {}", port, e),
            }
        }
        Ok(parsed)
    }

    async fn open_port(&self, port: OpenPort) -> Result<()> {
        let port = port.to_string();
        self.run("open-port", &[port.as_str()]).await.map(|_| ())
    }

    async fn close_port(&self, port: OpenPort) -> Result<()> {
        let port = port.to_string();
        self.run("close-port", &[port.as_str()]).await.map(|_| ())
    }
}
