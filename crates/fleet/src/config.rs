//! Fleet configuration loaded from a YAML file and the environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Consul agent the orchestrator talks to. Required for every command.
    pub consul_host: Option<String>,
    pub consul_acl_token: Option<String>,

    /// Bind address/port for the (out-of-process) API surface.
    pub listen_addr: String,
    pub listen_port: u16,

    /// Client TLS material for the Docker daemons, all three or none.
    pub docker_client_cert: Option<String>,
    pub docker_client_key: Option<String>,
    pub docker_server_cert: Option<String>,

    pub http_basic_username: Option<String>,
    pub http_basic_password: Option<String>,

    /// Subnet instances get their fixed IPs from (CIDR).
    pub ipalloc_range: String,
    pub gateway_ip: Option<String>,

    /// Name of the user-defined Docker network instances attach to.
    pub docker_network: Option<String>,
    pub create_network_automatically: bool,

    pub backup_storage_type: BackupStorageType,
    pub backup_base_dir: Option<String>,
    pub backup_host: Option<String>,
    pub backup_user: Option<String>,
    pub backup_identity: Option<String>,

    pub ssl_keyfile: Option<String>,
    pub ssl_certfile: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStorageType {
    Filesystem,
    Ssh,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            consul_host: None,
            consul_acl_token: None,
            listen_addr: "0.0.0.0".to_string(),
            listen_port: 5061,
            docker_client_cert: None,
            docker_client_key: None,
            docker_server_cert: None,
            http_basic_username: None,
            http_basic_password: None,
            ipalloc_range: "172.20.0.0/16".to_string(),
            gateway_ip: None,
            docker_network: None,
            create_network_automatically: false,
            backup_storage_type: BackupStorageType::Filesystem,
            backup_base_dir: None,
            backup_host: None,
            backup_user: None,
            backup_identity: None,
            ssl_keyfile: None,
            ssl_certfile: None,
        }
    }
}

impl FleetConfig {
    /// Load configuration: compile-time defaults, then an optional YAML
    /// file, then environment variables (`CONSUL_HOST`, `IPALLOC_RANGE`, …)
    /// which override everything.
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = config::Config::try_from(&FleetConfig::default())
            .context("Failed to serialize default configuration")?;

        let mut builder = config::Config::builder().add_source(defaults);

        let file_paths = match config_file {
            Some(path) => vec![path.to_string()],
            None => vec![
                "/etc/fleet/fleet".to_string(),
                "fleet".to_string(),
            ],
        };
        for path in file_paths {
            builder = builder.add_source(
                config::File::with_name(&path)
                    .format(config::FileFormat::Yaml)
                    .required(false),
            );
        }

        builder = builder.add_source(config::Environment::default().try_parsing(true));

        builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    pub fn validate(&self) -> Result<()> {
        self.ipalloc_range
            .parse::<ipnet::Ipv4Net>()
            .context("Invalid ipalloc_range (expected IPv4 CIDR)")?;

        if let Some(gw) = &self.gateway_ip {
            gw.parse::<std::net::Ipv4Addr>()
                .context("Invalid gateway_ip")?;
        }

        let tls_parts = [
            &self.docker_client_cert,
            &self.docker_client_key,
            &self.docker_server_cert,
        ];
        let present = tls_parts.iter().filter(|p| p.is_some()).count();
        if present != 0 && present != 3 {
            anyhow::bail!(
                "docker TLS needs docker_client_cert, docker_client_key and \
                 docker_server_cert together"
            );
        }

        if self.backup_storage_type == BackupStorageType::Ssh && self.backup_host.is_none() {
            anyhow::bail!("backup_storage_type = ssh requires backup_host");
        }

        Ok(())
    }

    /// The network settings fallback used when `tarantool_settings/` keys
    /// are absent from the KV store.
    pub fn default_network_settings(&self) -> crate::sense::NetworkSettings {
        crate::sense::NetworkSettings {
            network_name: self.docker_network.clone(),
            subnet: Some(self.ipalloc_range.clone()),
            gateway_ip: self.gateway_ip.clone(),
            create_automatically: self.create_network_automatically,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = FleetConfig::default();
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_docker_tls_rejected() {
        let config = FleetConfig {
            docker_client_cert: Some("/certs/cert.pem".to_string()),
            ..FleetConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_subnet_rejected() {
        let config = FleetConfig {
            ipalloc_range: "not-a-subnet".to_string(),
            ..FleetConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ssh_backup_requires_host() {
        let config = FleetConfig {
            backup_storage_type: BackupStorageType::Ssh,
            ..FleetConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
