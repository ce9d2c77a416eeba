//! Remote command provider
//!
//! Pipes a local script into `sh -s` on the target host (through the system
//! `ssh` client for ssh endpoints, directly for local endpoints) and captures
//! its standard output into the artifact directory. Each run yields exactly
//! one entry backed by the captured file.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::streaming::{Discover, EntrySender};
use super::{Entry, FileOpener, ProviderContext, ProviderError};
use crate::config::{ConfigError, Endpoint, EndpointRegistry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCommandConfig {
    pub endpoint: String,
    /// Local path of the script to execute
    pub script: PathBuf,
    /// Working directory on the target host
    #[serde(default)]
    pub workdir: Option<String>,
}

impl RemoteCommandConfig {
    pub fn validate(&self, endpoints: &EndpointRegistry) -> Result<(), ConfigError> {
        if self.script.as_os_str().is_empty() {
            return Err(ConfigError::MissingField {
                context: format!("remote_command provider on `{}`", self.endpoint),
                field: "script",
            });
        }
        match endpoints.get(&self.endpoint)? {
            Endpoint::Ssh { .. } | Endpoint::Local { .. } => Ok(()),
            other => Err(ConfigError::EndpointKind {
                endpoint: self.endpoint.clone(),
                expected: "ssh or local",
                actual: other.kind_name(),
            }),
        }
    }
}

enum Target {
    Local(PathBuf),
    Ssh {
        host: String,
        user: Option<String>,
        port: Option<u16>,
    },
}

/// [`Discover`] implementation for `remote_command`
pub struct RemoteCommand {
    endpoint: String,
    target: Target,
    script_path: PathBuf,
    workdir: Option<String>,
    capture_path: PathBuf,
    script: Option<Vec<u8>>,
}

impl RemoteCommand {
    pub fn from_config(
        config: &RemoteCommandConfig,
        ctx: &ProviderContext,
    ) -> Result<Self, ConfigError> {
        config.validate(&ctx.endpoints)?;
        let target = match ctx.endpoints.get(&config.endpoint)? {
            Endpoint::Local { root } => Target::Local(root.clone()),
            Endpoint::Ssh { host, user, port } => Target::Ssh {
                host: host.clone(),
                user: user.clone(),
                port: *port,
            },
            other => {
                return Err(ConfigError::EndpointKind {
                    endpoint: config.endpoint.clone(),
                    expected: "ssh or local",
                    actual: other.kind_name(),
                })
            },
        };

        let capture_name = format!("{}.stdout", crate::file_safe(&ctx.instance_name));
        Ok(Self {
            endpoint: config.endpoint.clone(),
            target,
            script_path: config.script.clone(),
            workdir: config.workdir.clone(),
            capture_path: ctx.artifact_dir.join(capture_name),
            script: None,
        })
    }

    fn command(&self) -> Command {
        match &self.target {
            Target::Local(root) => {
                let dir = match &self.workdir {
                    Some(dir) => root.join(dir.trim_start_matches('/')),
                    None => root.clone(),
                };
                let mut command = Command::new("sh");
                command.arg("-s").current_dir(dir);
                command
            },
            Target::Ssh { host, user, port } => {
                let mut command = Command::new("ssh");
                command.arg("-o").arg("BatchMode=yes");
                if let Some(port) = port {
                    command.arg("-p").arg(port.to_string());
                }
                let destination = match user {
                    Some(user) => format!("{}@{}", user, host),
                    None => host.clone(),
                };
                let remote = match &self.workdir {
                    Some(dir) => format!("cd '{}' && sh -s", dir.replace('\'', r"'\''")),
                    None => "sh -s".to_string(),
                };
                command.arg(destination).arg(remote);
                command
            },
        }
    }

    fn entry_name(&self) -> String {
        let stem = self
            .script_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "command".to_string());
        format!("{}.out", stem)
    }
}

#[async_trait]
impl Discover for RemoteCommand {
    fn kind(&self) -> &'static str {
        "remote_command"
    }

    fn endpoint_id(&self) -> String {
        format!("{}:{}", self.endpoint, self.script_path.display())
    }

    async fn connect(&mut self) -> Result<(), ProviderError> {
        let script = tokio::fs::read(&self.script_path)
            .await
            .map_err(|e| ProviderError::io(self.script_path.display().to_string(), e))?;
        if let Some(parent) = self.capture_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProviderError::io(parent.display().to_string(), e))?;
        }
        self.script = Some(script);
        Ok(())
    }

    async fn discover(&mut self, out: &EntrySender) -> Result<(), ProviderError> {
        let Some(script) = self.script.take() else {
            return Ok(());
        };
        let label = self.script_path.display().to_string();
        let command_error = |message: String| ProviderError::Command {
            command: label.clone(),
            message,
        };

        info!(script = %label, endpoint = %self.endpoint, "Running command");
        let mut child = self
            .command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| command_error(format!("spawn failed: {}", e)))?;

        // feed the script while stdout drains; a script that prints more than
        // a pipe buffer before `sh -s` has read all of it would otherwise stall
        let stdin = child.stdin.take();
        let feed = async move {
            match stdin {
                // dropping stdin at the end lets `sh -s` run to completion
                Some(mut stdin) => stdin.write_all(&script).await,
                None => Ok(()),
            }
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(|e| command_error(e.to_string()))?;
        match fed {
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                debug!(script = %label, "Command exited before reading the whole script");
            },
            Err(e) => return Err(command_error(format!("writing script: {}", e))),
            Ok(()) => {},
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            out.skip(
                &label,
                command_error(format!("{}: {}", output.status, stderr.trim())),
            );
            return Ok(());
        }

        tokio::fs::write(&self.capture_path, &output.stdout)
            .await
            .map_err(|e| ProviderError::io(self.capture_path.display().to_string(), e))?;
        debug!(
            path = %self.capture_path.display(),
            bytes = output.stdout.len(),
            "Captured command output"
        );
        out.attach(self.capture_path.clone());

        let entry = Entry::new(
            self.entry_name(),
            self.capture_path.display().to_string(),
            FileOpener::new(&self.capture_path),
        )
        .with_size(output.stdout.len() as u64);
        out.offer(entry).await;
        Ok(())
    }
}
