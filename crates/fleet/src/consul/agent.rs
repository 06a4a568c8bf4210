//! Agent domain — service and check registration on a specific agent.
//!
//! These endpoints act on the agent the client was built for (see
//! `ConsulClient::for_agent`), which must be the agent co-located with the
//! docker host running the container the checks exec into.

use super::ConsulClient;
use crate::error::Result;
use serde::Serialize;

/// Docker-exec check definition: the agent runs `shell script` inside the
/// container on the given interval.
#[derive(Debug, Clone, Serialize)]
pub struct CheckRegistration {
    #[serde(rename = "Name", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "CheckID", skip_serializing_if = "Option::is_none")]
    pub check_id: Option<String>,
    #[serde(rename = "ServiceID", skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(rename = "DockerContainerID")]
    pub docker_container_id: String,
    #[serde(rename = "Shell")]
    pub shell: String,
    #[serde(rename = "Args")]
    pub args: Vec<String>,
    #[serde(rename = "Interval")]
    pub interval: String,
    #[serde(rename = "Status")]
    pub status: String,
}

impl CheckRegistration {
    /// A check that starts out `warning` until its first run reports.
    pub fn docker_script(container_id: &str, script: &str, period_secs: u64) -> Self {
        CheckRegistration {
            name: None,
            check_id: None,
            service_id: None,
            docker_container_id: container_id.to_string(),
            shell: "/bin/sh".to_string(),
            args: vec![script.to_string()],
            interval: format!("{period_secs}s"),
            status: "warning".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceRegistration {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Tags")]
    pub tags: Vec<String>,
    #[serde(rename = "Check", skip_serializing_if = "Option::is_none")]
    pub check: Option<CheckRegistration>,
}

impl ConsulClient {
    pub async fn register_service(&self, registration: &ServiceRegistration) -> Result<()> {
        let url = self.url("/v1/agent/service/register");
        let response = self
            .request(self.http.put(&url).json(registration))
            .send()
            .await?;
        self.check_response(response).await?;
        Ok(())
    }

    pub async fn deregister_service(&self, service_id: &str) -> Result<()> {
        let url = self.url(&format!("/v1/agent/service/deregister/{service_id}"));
        let response = self.request(self.http.put(&url)).send().await?;
        self.check_response(response).await?;
        Ok(())
    }

    pub async fn register_check(&self, check: &CheckRegistration) -> Result<()> {
        let url = self.url("/v1/agent/check/register");
        let response = self.request(self.http.put(&url).json(check)).send().await?;
        self.check_response(response).await?;
        Ok(())
    }

    pub async fn deregister_check(&self, check_id: &str) -> Result<()> {
        let url = self.url(&format!("/v1/agent/check/deregister/{check_id}"));
        let response = self.request(self.http.put(&url)).send().await?;
        self.check_response(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_script_check_shape() {
        let check = CheckRegistration::docker_script(
            "abc_1",
            "/var/lib/mon.d/tarantool_replication.sh",
            15,
        );
        let json = serde_json::to_value(&check).unwrap();
        assert_eq!(json["DockerContainerID"], "abc_1");
        assert_eq!(json["Shell"], "/bin/sh");
        assert_eq!(json["Interval"], "15s");
        assert_eq!(json["Status"], "warning");
        assert!(json.get("CheckID").is_none());
    }

    #[test]
    fn test_service_registration_serializes_check() {
        let registration = ServiceRegistration {
            name: "tarantool".to_string(),
            id: "abc_1".to_string(),
            address: "172.20.0.2".to_string(),
            port: 3301,
            tags: vec!["tarantool".to_string()],
            check: Some(CheckRegistration::docker_script(
                "abc_1",
                "/var/lib/mon.d/tarantool_replication.sh",
                10,
            )),
        };
        let json = serde_json::to_value(&registration).unwrap();
        assert_eq!(json["Name"], "tarantool");
        assert_eq!(json["Check"]["Interval"], "10s");
    }
}
