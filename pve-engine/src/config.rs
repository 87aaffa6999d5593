//! Resource configuration handed to the engine by the orchestration driver.

use serde::{Deserialize, Serialize};

use crate::error::{PveError, Result};

/// How `power-off` asks the guest to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMethod {
    /// ACPI shutdown, cooperative with the guest OS
    Soft,
    /// Immediate power cut
    Hard,
}

impl Default for ShutdownMethod {
    fn default() -> Self {
        Self::Soft
    }
}

impl ShutdownMethod {
    pub fn is_soft(&self) -> bool {
        matches!(self, ShutdownMethod::Soft)
    }
}

/// Connection and placement settings for one hypervisor cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Cluster API host name or IP
    pub address: String,
    /// API port
    pub port: u16,
    /// URL scheme ("https" in every real deployment)
    pub scheme: String,
    /// Login name including realm (e.g. "root@pam")
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    /// Verify the API's TLS certificate
    pub verify_ssl: bool,
    /// Bridge used when a connectivity action names none
    pub default_bridge: Option<String>,
    /// Storage used for clones when the request names none
    pub shared_storage: Option<String>,
    /// VLAN ids owned by the platform rather than by sandboxes
    pub reserved_networks: Vec<String>,
    pub shutdown_method: ShutdownMethod,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 8006,
            scheme: "https".to_string(),
            user: String::new(),
            password: String::new(),
            verify_ssl: false,
            default_bridge: None,
            shared_storage: None,
            reserved_networks: Vec::new(),
            shutdown_method: ShutdownMethod::default(),
        }
    }
}

impl ResourceConfig {
    /// Reject configurations that cannot possibly log in.
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = [
            ("address", self.address.as_str()),
            ("user", self.user.as_str()),
            ("password", self.password.as_str()),
        ]
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| *name)
        .collect();

        if !missing.is_empty() {
            return Err(PveError::InvalidConfig(format!(
                "missing required resource attributes: {}",
                missing.join(", ")
            )));
        }

        if self.scheme != "https" && self.scheme != "http" {
            return Err(PveError::InvalidConfig(format!(
                "unsupported scheme '{}'",
                self.scheme
            )));
        }

        Ok(())
    }

    /// Base URL of the JSON API, e.g. `https://pve.lab:8006/api2/json`.
    pub fn api_base_url(&self) -> String {
        format!("{}://{}:{}/api2/json", self.scheme, self.address, self.port)
    }

    pub fn is_reserved_network(&self, vlan_id: &str) -> bool {
        self.reserved_networks.iter().any(|n| n == vlan_id)
    }
}
