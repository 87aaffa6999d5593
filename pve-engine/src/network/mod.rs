//! Virtual NIC connectivity: attach NICs to bridges/VLANs and detach them.
//!
//! Requests arrive as batches of [`ConnectivityAction`]s from the
//! orchestration driver. Each action is resolved to [`NetworkSettings`] up
//! front, then applied by the [`ConnectivityReconciler`].

pub mod mac;
mod reconciler;
pub mod settings;

pub use reconciler::ConnectivityReconciler;
pub use settings::{NetworkSettings, Vlan, VlanRange};

use serde::{Deserialize, Serialize};

/// Whether an action connects or disconnects a NIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Attach (or re-point) a NIC
    Set,
    /// Bring a NIC's link down
    Remove,
}

/// VLAN mode of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VlanMode {
    /// One untagged VLAN, carried as the NIC's tag
    #[default]
    Access,
    /// A set of tagged VLANs
    Trunk,
}

/// One connectivity request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectivityAction {
    pub action_id: String,
    pub action_type: ActionType,
    pub instance_id: u32,
    /// NIC slot index (`net<N>`). Set actions without one use the first
    /// free slot.
    #[serde(default)]
    pub vnic: Option<u32>,
    /// A single VLAN id in access mode; `,`/`;` separated ids and ranges in
    /// trunk mode. Empty leaves the NIC untagged.
    #[serde(default)]
    pub vlan_id: String,
    #[serde(default)]
    pub mode: VlanMode,
    /// Bridge to connect to; falls back to the resource's default bridge
    #[serde(default)]
    pub switch_name: Option<String>,
    #[serde(default)]
    pub enable_firewall: bool,
    /// Hardware address identifying the NIC to disconnect
    #[serde(default)]
    pub interface_mac: Option<String>,
}

/// Outcome of one action in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectivityResult {
    pub action_id: String,
    pub success: bool,
    /// MAC of the affected NIC; empty when nothing was detached
    pub interface_mac: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectivityResult {
    pub fn ok(action_id: &str, interface_mac: String) -> Self {
        Self {
            action_id: action_id.to_string(),
            success: true,
            interface_mac,
            error: None,
        }
    }

    pub fn failed(action_id: &str, error: String) -> Self {
        Self {
            action_id: action_id.to_string(),
            success: false,
            interface_mac: String::new(),
            error: Some(error),
        }
    }
}
