//! Health domain — per-service health listings and blocking index watches.

use super::ConsulClient;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct NodeDetail {
    #[serde(rename = "Node")]
    pub node: String,
    #[serde(rename = "Address")]
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceDetail {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Service")]
    pub service: String,
    #[serde(rename = "Tags")]
    pub tags: Option<Vec<String>>,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckDetail {
    #[serde(rename = "CheckID")]
    pub check_id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Output", default)]
    pub output: String,
}

/// One entry of `/v1/health/service/<name>`: the node hosting the service,
/// the service itself, and its checks.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceHealthEntry {
    #[serde(rename = "Node")]
    pub node: NodeDetail,
    #[serde(rename = "Service")]
    pub service: ServiceDetail,
    #[serde(rename = "Checks")]
    pub checks: Vec<CheckDetail>,
}

impl ServiceHealthEntry {
    /// The address the service is reachable at; falls back to the node
    /// address when the service did not advertise one.
    pub fn service_address(&self) -> &str {
        if self.service.address.is_empty() {
            &self.node.address
        } else {
            &self.service.address
        }
    }
}

impl ConsulClient {
    /// Current health entries for a service.
    pub async fn service_health(&self, name: &str) -> Result<Vec<ServiceHealthEntry>> {
        let (_, entries) = self.watch_health(name, None, None).await?;
        Ok(entries)
    }

    /// Blocking health query. With `wait_index` set the call long-polls
    /// until the service's index moves past it or `wait_secs` elapses; the
    /// returned index is fed back in to watch for the next change.
    pub async fn watch_health(
        &self,
        name: &str,
        wait_index: Option<u64>,
        wait_secs: Option<u64>,
    ) -> Result<(u64, Vec<ServiceHealthEntry>)> {
        let url = self.url(&format!("/v1/health/service/{name}"));
        let mut request = self.request(self.http.get(&url));

        if let Some(index) = wait_index {
            let wait = wait_secs.unwrap_or(300);
            request = request
                .query(&[("index", index.to_string()), ("wait", format!("{wait}s"))])
                // reqwest's client timeout must outlive the server-side wait
                .timeout(Duration::from_secs(wait + 60));
        }

        let response = request.send().await?;
        let response = self.check_response(response).await?;

        let index = response
            .headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| Error::Transient("missing X-Consul-Index header".to_string()))?;

        let entries: Vec<ServiceHealthEntry> = response.json().await?;
        Ok((index, entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_address_falls_back_to_node() {
        let entry: ServiceHealthEntry = serde_json::from_value(serde_json::json!({
            "Node": {"Node": "node-1", "Address": "10.0.0.5"},
            "Service": {"ID": "abc_1", "Service": "tarantool", "Tags": ["tarantool"],
                        "Address": "", "Port": 3301},
            "Checks": [{"CheckID": "service:abc_1", "Name": "Service check",
                        "Status": "passing", "Output": ""}]
        }))
        .unwrap();
        assert_eq!(entry.service_address(), "10.0.0.5");
    }

    #[test]
    fn test_service_address_prefers_service() {
        let entry: ServiceHealthEntry = serde_json::from_value(serde_json::json!({
            "Node": {"Node": "node-1", "Address": "10.0.0.5"},
            "Service": {"ID": "abc_1", "Service": "docker", "Tags": ["im"],
                        "Address": "10.0.0.6", "Port": 2375},
            "Checks": []
        }))
        .unwrap();
        assert_eq!(entry.service_address(), "10.0.0.6");
    }
}
