//! Catalog domain — cluster-wide node and service listings, plus the
//! catalog-level deregistration used when an agent is unreachable.

use super::ConsulClient;
use crate::error::Result;
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogNode {
    #[serde(rename = "Node")]
    pub node: String,
    #[serde(rename = "Address")]
    pub address: String,
}

impl ConsulClient {
    /// All known service names with their tags.
    pub async fn catalog_services(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let url = self.url("/v1/catalog/services");
        let response = self.request(self.http.get(&url)).send().await?;
        let response = self.check_response(response).await?;
        Ok(response.json().await?)
    }

    pub async fn catalog_nodes(&self) -> Result<Vec<CatalogNode>> {
        let url = self.url("/v1/catalog/nodes");
        let response = self.request(self.http.get(&url)).send().await?;
        let response = self.check_response(response).await?;
        Ok(response.json().await?)
    }

    /// Remove a service from the catalog directly. Only used when the agent
    /// owning the registration cannot be reached; a live agent would
    /// re-register it via anti-entropy.
    pub async fn catalog_deregister(&self, node: &str, service_id: &str) -> Result<()> {
        let url = self.url("/v1/catalog/deregister");
        let body = serde_json::json!({
            "Node": node,
            "ServiceID": service_id,
        });
        let response = self.request(self.http.put(&url).json(&body)).send().await?;
        self.check_response(response).await?;
        Ok(())
    }
}
