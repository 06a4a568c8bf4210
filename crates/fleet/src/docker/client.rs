//! Docker client — core struct and remote connection setup.

use crate::error::{Error, Result};
use bollard::Docker;
use std::path::PathBuf;

/// Deadline for individual Docker API calls. A host that cannot answer a
/// listing inside this window is considered down by the probe loop.
pub const DOCKER_API_TIMEOUT_SECS: u64 = 10;

/// Client TLS material for daemons listening on TLS-guarded TCP sockets.
#[derive(Debug, Clone)]
pub struct DockerTls {
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
    pub server_ca: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DockerClient {
    /// The bollard Docker client.  `pub(super)` so that domain modules
    /// in sibling files can call bollard APIs directly.
    pub(super) client: Docker,
    /// `host:port` of the daemon this client is connected to.
    pub(super) addr: String,
}

impl DockerClient {
    /// Connect to a remote daemon at `host:port`, with mutual TLS when the
    /// fleet is configured for it.
    pub fn connect(addr: &str, tls: Option<&DockerTls>) -> Result<Self> {
        let client = match tls {
            Some(tls) => Docker::connect_with_ssl(
                &format!("https://{addr}"),
                &tls.client_key,
                &tls.client_cert,
                &tls.server_ca,
                DOCKER_API_TIMEOUT_SECS,
                &bollard::API_DEFAULT_VERSION,
            ),
            None => Docker::connect_with_http(
                &format!("http://{addr}"),
                DOCKER_API_TIMEOUT_SECS,
                &bollard::API_DEFAULT_VERSION,
            ),
        }
        .map_err(|e| Error::Transient(format!("docker connect to {addr}: {e}")))?;

        Ok(DockerClient {
            client,
            addr: addr.to_string(),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Daemon-level information: CPU count, total memory, etc.
    pub async fn info(&self) -> Result<bollard::models::SystemInfo> {
        self.client.info().await.map_err(Error::from)
    }
}
