//! Container domain — list, lifecycle, and managed-container creation.

use super::client::DockerClient;
use crate::error::{Error, Result};
use bollard::models::{
    ContainerCreateBody, ContainerInspectResponse, ContainerSummary, HostConfig, RestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    CreateContainerOptions, ListContainersOptions, RemoveContainerOptions, StopContainerOptions,
};
use std::collections::HashMap;

/// Everything needed to run one managed instance container. The container
/// joins `network` with the fixed `ipv4_address` before it starts, so the
/// instance address equals the blueprint address from the first packet.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Option<Vec<String>>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub binds: Vec<String>,
    pub network: String,
    pub ipv4_address: String,
}

impl DockerClient {
    /// List every container on the host, running or not.
    pub async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let options = Some(ListContainersOptions {
            all: true,
            ..Default::default()
        });
        Ok(self.client.list_containers(options).await?)
    }

    pub async fn inspect_container(&self, name: &str) -> Result<ContainerInspectResponse> {
        Ok(self.client.inspect_container(name, None).await?)
    }

    /// Create the container, attach it to the managed network at its fixed
    /// address, and start it.
    pub async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String> {
        let options = Some(CreateContainerOptions {
            name: Some(spec.name.clone()),
            ..Default::default()
        });

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: spec.command.clone(),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            host_config: Some(HostConfig {
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                    maximum_retry_count: Some(0),
                }),
                binds: if spec.binds.is_empty() {
                    None
                } else {
                    Some(spec.binds.clone())
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self.client.create_container(options, body).await?;

        self.network_connect(&spec.network, &spec.name, Some(&spec.ipv4_address))
            .await?;
        self.start_container(&spec.name).await?;

        Ok(created.id)
    }

    pub async fn start_container(&self, name: &str) -> Result<()> {
        self.client
            .start_container(name, None)
            .await
            .map_err(map_container_err(name))
    }

    pub async fn stop_container(&self, name: &str) -> Result<()> {
        self.client
            .stop_container(name, None::<StopContainerOptions>)
            .await
            .map_err(map_container_err(name))
    }

    pub async fn restart_container(&self, name: &str) -> Result<()> {
        self.client
            .restart_container(
                name,
                None::<bollard::query_parameters::RestartContainerOptions>,
            )
            .await
            .map_err(map_container_err(name))
    }

    pub async fn remove_container(&self, name: &str, force: bool) -> Result<()> {
        let options = Some(RemoveContainerOptions {
            force,
            ..Default::default()
        });
        self.client
            .remove_container(name, options)
            .await
            .map_err(map_container_err(name))
    }
}

fn map_container_err(name: &str) -> impl FnOnce(bollard::errors::Error) -> Error + '_ {
    move |e| match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => Error::NotFound(format!("container '{name}'")),
        other => Error::from(other),
    }
}
