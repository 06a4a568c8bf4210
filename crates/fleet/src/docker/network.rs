//! Network domain — managed-network maintenance, connect, disconnect.

use super::client::DockerClient;
use crate::error::{Error, Result};
use bollard::models::{
    EndpointIpamConfig, EndpointSettings, Ipam, IpamConfig, NetworkConnectRequest,
    NetworkCreateRequest, NetworkDisconnectRequest,
};

impl DockerClient {
    /// Make sure the user-defined network exists on this host with the
    /// configured IPAM subnet. Creation only happens when the settings
    /// allow it; otherwise a missing network is a configuration error.
    pub async fn ensure_network(
        &self,
        name: &str,
        subnet: &str,
        create_if_missing: bool,
    ) -> Result<()> {
        let networks = self
            .client
            .list_networks(None::<bollard::query_parameters::ListNetworksOptions>)
            .await?;

        if networks
            .iter()
            .any(|n| n.name.as_deref() == Some(name))
        {
            return Ok(());
        }

        if !create_if_missing {
            return Err(Error::ConfigInvalid(format!(
                "network '{name}' does not exist on {} and automatic creation is disabled",
                self.addr
            )));
        }

        tracing::info!(network = name, subnet, host = %self.addr, "Creating network");

        let request = NetworkCreateRequest {
            name: name.to_string(),
            driver: Some("bridge".to_string()),
            ipam: Some(Ipam {
                config: Some(vec![IpamConfig {
                    subnet: Some(subnet.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.client.create_network(request).await?;
        Ok(())
    }

    /// Connect a container to a network, optionally at a fixed IPv4.
    pub async fn network_connect(
        &self,
        network: &str,
        container: &str,
        ipv4_address: Option<&str>,
    ) -> Result<()> {
        let endpoint_config = ipv4_address.map(|addr| EndpointSettings {
            ipam_config: Some(EndpointIpamConfig {
                ipv4_address: Some(addr.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });

        let request = NetworkConnectRequest {
            container: container.to_string(),
            endpoint_config,
        };

        self.client
            .connect_network(network, request)
            .await
            .map_err(Error::from)
    }

    pub async fn network_disconnect(
        &self,
        network: &str,
        container: &str,
        force: bool,
    ) -> Result<()> {
        let request = NetworkDisconnectRequest {
            container: container.to_string(),
            force: Some(force),
        };

        self.client
            .disconnect_network(network, request)
            .await
            .map_err(Error::from)
    }
}
