//! Exec domain — run a command inside a container, capturing output and
//! the exit code. Used for the in-container reconfiguration scripts.

use super::client::DockerClient;
use crate::error::{Error, Result};
use bollard::exec::StartExecResults;
use bollard::models::ExecConfig;
use futures_util::stream::StreamExt;

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub exit_code: i64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a failed command into an `ExternalFailure` carrying its output.
    pub fn into_result(self, what: &str) -> Result<ExecOutput> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::ExternalFailure(format!(
                "{what} exited with {}: {}",
                self.exit_code,
                self.stdout.trim()
            )))
        }
    }
}

impl DockerClient {
    /// Run `argv` inside the container and wait for it to finish.
    pub async fn exec(&self, container: &str, argv: &[&str]) -> Result<ExecOutput> {
        let config = ExecConfig {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(argv.iter().map(|a| a.to_string()).collect()),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(container, config)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => Error::NotFound(format!("container '{container}'")),
                other => Error::from(other),
            })?;

        let mut stdout = String::new();
        match self
            .client
            .start_exec(&exec.id, None::<bollard::exec::StartExecOptions>)
            .await?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(log) => stdout.push_str(&log.to_string()),
                        Err(e) => return Err(Error::from(e)),
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self.client.inspect_exec(&exec.id).await?;
        let exit_code = inspect.exit_code.unwrap_or(-1);

        Ok(ExecOutput { stdout, exit_code })
    }

    /// Run a shell pipeline inside the container (`sh -c '…'`).
    pub async fn exec_shell(&self, container: &str, script: &str) -> Result<ExecOutput> {
        self.exec(container, &["sh", "-c", script]).await
    }
}
