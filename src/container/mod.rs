use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::context::{ContextError, OpContext};
use crate::error::Error;
use crate::types::SrvContainer;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("failed to run '{runtime}': {source}")]
    Spawn {
        runtime: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{0}' timed out after {1:?}")]
    Timeout(String, Duration),
    #[error("container '{0}' not found")]
    NotFound(String),
    #[error("'{action}' exited with {status}: {stderr}")]
    Failed {
        action: String,
        status: String,
        stderr: String,
    },
    #[error("unexpected inspect output: {0}")]
    Inspect(#[from] serde_json::Error),
    #[error(transparent)]
    Context(#[from] ContextError),
}

impl From<ContainerError> for Error {
    fn from(err: ContainerError) -> Self {
        match err {
            ContainerError::NotFound(_) => Error::not_found(err.to_string()),
            other => Error::internal(other),
        }
    }
}

/// Управление контейнером одного сервиса
#[async_trait]
pub trait ContainerHandler: Send + Sync {
    /// Выполняет команду внутри контейнера
    async fn exec_cmd(
        &self,
        ctx: &OpContext,
        cmd: &[String],
        tty: bool,
        env_vars: &BTreeMap<String, String>,
        work_dir: &str,
    ) -> Result<(), ContainerError>;

    async fn info(&self, ctx: &OpContext) -> Result<SrvContainer, ContainerError>;

    async fn restart(&self, ctx: &OpContext) -> Result<(), ContainerError>;
}

/// Реализация поверх CLI контейнерного runtime (docker, podman)
pub struct DockerCtrHandler {
    runtime: String,
    container_name: String,
    timeout: Duration,
    // exec и restart одного контейнера не выполняются параллельно
    mu: Mutex<()>,
}

#[derive(Debug, Deserialize)]
struct InspectEntry {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "State")]
    state: InspectState,
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Status")]
    status: String,
}

impl DockerCtrHandler {
    pub fn new(runtime: &str, container_name: &str, timeout: Duration) -> Self {
        Self {
            runtime: runtime.to_string(),
            container_name: container_name.to_string(),
            timeout,
            mu: Mutex::new(()),
        }
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Аргументы для `<runtime> exec`
    fn exec_args(&self, cmd: &[String], tty: bool, env_vars: &BTreeMap<String, String>, work_dir: &str) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if tty {
            args.push("-t".to_string());
        }
        for (key, val) in env_vars {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, val));
        }
        if !work_dir.is_empty() {
            args.push("-w".to_string());
            args.push(work_dir.to_string());
        }
        args.push(self.container_name.clone());
        args.extend(cmd.iter().cloned());
        args
    }

    /// Запускает runtime с ограничением по времени и с учетом отмены контекста
    async fn run(&self, ctx: &OpContext, args: Vec<String>) -> Result<Vec<u8>, ContainerError> {
        ctx.check()?;
        let action = format!("{} {}", self.runtime, args.first().map(String::as_str).unwrap_or_default());
        debug!("running {} {:?}", self.runtime, args);

        let child = Command::new(&self.runtime)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ContainerError::Spawn {
                runtime: self.runtime.clone(),
                source,
            })?;

        let output = tokio::select! {
            res = tokio::time::timeout(self.timeout, child.wait_with_output()) => match res {
                Ok(output) => output.map_err(|source| ContainerError::Spawn {
                    runtime: self.runtime.clone(),
                    source,
                })?,
                Err(_) => return Err(ContainerError::Timeout(action, self.timeout)),
            },
            err = ctx.done() => return Err(err.into()),
        };

        if output.status.success() {
            return Ok(output.stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("No such container") || stderr.contains("no such container") {
            return Err(ContainerError::NotFound(self.container_name.clone()));
        }
        Err(ContainerError::Failed {
            action,
            status: output.status.to_string(),
            stderr,
        })
    }
}

#[async_trait]
impl ContainerHandler for DockerCtrHandler {
    async fn exec_cmd(
        &self,
        ctx: &OpContext,
        cmd: &[String],
        tty: bool,
        env_vars: &BTreeMap<String, String>,
        work_dir: &str,
    ) -> Result<(), ContainerError> {
        let _guard = self.mu.lock().await;
        let args = self.exec_args(cmd, tty, env_vars, work_dir);
        self.run(ctx, args).await?;
        Ok(())
    }

    async fn info(&self, ctx: &OpContext) -> Result<SrvContainer, ContainerError> {
        let out = self
            .run(ctx, vec!["inspect".to_string(), self.container_name.clone()])
            .await?;
        let entries: Vec<InspectEntry> = serde_json::from_slice(&out)?;
        let Some(entry) = entries.into_iter().next() else {
            warn!("inspect returned no entries for {}", self.container_name);
            return Err(ContainerError::NotFound(self.container_name.clone()));
        };
        Ok(SrvContainer {
            name: self.container_name.clone(),
            id: Some(entry.id),
            state: Some(entry.state.status),
        })
    }

    async fn restart(&self, ctx: &OpContext) -> Result<(), ContainerError> {
        let _guard = self.mu.lock().await;
        self.run(ctx, vec!["restart".to_string(), self.container_name.clone()])
            .await?;
        Ok(())
    }
}
