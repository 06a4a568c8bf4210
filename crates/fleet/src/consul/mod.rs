//! Consul gateway — core client, constructor, shared wire types.
//!
//! Domain methods live in sibling modules (`kv`, `health`, `agent`,
//! `catalog`) which add `impl ConsulClient` blocks.

mod agent;
mod catalog;
mod health;
mod kv;

pub use agent::{CheckRegistration, ServiceRegistration};
pub use catalog::CatalogNode;
pub use health::{CheckDetail, NodeDetail, ServiceDetail, ServiceHealthEntry};
pub use kv::KvPair;

use crate::error::{Error, Result};
use std::time::Duration;

const CONSUL_HTTP_PORT: u16 = 8500;
const CONSUL_API_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ConsulClient {
    pub(super) http: reqwest::Client,
    /// Agent this client talks to (host or host:port).
    pub(super) host: String,
    pub(super) token: Option<String>,
}

impl ConsulClient {
    pub fn new(host: &str, token: Option<&str>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(CONSUL_API_TIMEOUT)
            .build()
            .map_err(|e| Error::Transient(format!("http client: {e}")))?;

        Ok(ConsulClient {
            http,
            host: host.to_string(),
            token: token.map(|t| t.to_string()),
        })
    }

    /// A client for a different agent, keeping the ACL token. Used to
    /// register and deregister services on the agent that owns a docker
    /// host.
    pub fn for_agent(&self, host: &str) -> ConsulClient {
        ConsulClient {
            http: self.http.clone(),
            host: host.to_string(),
            token: self.token.clone(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub(super) fn url(&self, path: &str) -> String {
        if self.host.contains(':') {
            format!("http://{}{}", self.host, path)
        } else {
            format!("http://{}:{}{}", self.host, CONSUL_HTTP_PORT, path)
        }
    }

    pub(super) fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.header("X-Consul-Token", token),
            None => builder,
        }
    }

    /// Map a non-success Consul response to the error taxonomy. A
    /// leaderless cluster answers 500 with a distinctive message; that is
    /// transient, not fatal.
    pub(super) async fn check_response(
        &self,
        response: reqwest::Response,
    ) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 404 {
            return Err(Error::NotFound(body));
        }
        if body.contains("No cluster leader") {
            return Err(Error::Transient("consul has no cluster leader".to_string()));
        }
        Err(Error::Transient(format!("consul returned {status}: {body}")))
    }
}
