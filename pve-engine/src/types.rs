//! Type definitions for instances, tasks and their observed state.

use serde::{Deserialize, Serialize};

// =============================================================================
// INSTANCE IDENTITY
// =============================================================================

/// Kind of guest, which selects the `/nodes/{node}/{kind}/...` endpoint family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceKind {
    /// Full virtual machine
    Qemu,
    /// Container
    Lxc,
}

impl InstanceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceKind::Qemu => "qemu",
            InstanceKind::Lxc => "lxc",
        }
    }

    /// Parse the `type` column of a cluster resource listing.
    pub fn from_resource_type(value: &str) -> Option<Self> {
        match value {
            "qemu" => Some(InstanceKind::Qemu),
            "lxc" => Some(InstanceKind::Lxc),
            _ => None,
        }
    }

    /// Config key holding the instance's display name.
    pub fn name_key(&self) -> &'static str {
        match self {
            InstanceKind::Qemu => "name",
            InstanceKind::Lxc => "hostname",
        }
    }
}

impl std::fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an instance lives, as seen by the last cluster listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    /// Hosting node name
    pub node: String,
    /// Guest kind
    pub kind: InstanceKind,
    /// Display name, if the listing carried one
    pub name: Option<String>,
    /// Whether the instance is a template
    pub template: bool,
}

// =============================================================================
// POWER STATE
// =============================================================================

/// Observed power state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Running,
    Stopped,
    Paused,
    Suspended,
    Unknown,
    Error,
}

impl Default for PowerState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl PowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::Running => "running",
            PowerState::Stopped => "stopped",
            PowerState::Paused => "paused",
            PowerState::Suspended => "suspended",
            PowerState::Unknown => "unknown",
            PowerState::Error => "error",
        }
    }

    /// Map hypervisor status strings onto a power state.
    ///
    /// The QEMU monitor status, when present, is more precise than the
    /// coarse `status` field (a paused VM still reports `running`).
    /// Unrecognized strings become [`PowerState::Unknown`].
    pub fn from_status(status: &str, qmpstatus: Option<&str>) -> Self {
        if let Some(qmp) = qmpstatus {
            match qmp {
                "paused" | "prelaunch" => return PowerState::Paused,
                "suspended" => return PowerState::Suspended,
                "internal-error" | "io-error" | "guest-panicked" => return PowerState::Error,
                _ => {}
            }
        }

        match status {
            "running" => PowerState::Running,
            "stopped" => PowerState::Stopped,
            "paused" => PowerState::Paused,
            "suspended" => PowerState::Suspended,
            "error" | "internal-error" => PowerState::Error,
            _ => PowerState::Unknown,
        }
    }
}

// =============================================================================
// TASKS
// =============================================================================

/// Handle to an asynchronous hypervisor job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    /// Node that owns the task
    pub node: String,
    /// Opaque task identifier (`UPID:...`)
    pub upid: String,
}

impl TaskHandle {
    pub fn new(node: impl Into<String>, upid: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            upid: upid.into(),
        }
    }
}

/// Snapshot of a task's progress as reported by the task status endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TaskStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub exitstatus: Option<String>,
}

impl TaskStatus {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }

    pub fn succeeded(&self) -> bool {
        !self.is_running()
            && self
                .exitstatus
                .as_deref()
                .map(|s| s.eq_ignore_ascii_case("ok"))
                .unwrap_or(false)
    }
}

// =============================================================================
// CLUSTER
// =============================================================================

/// Hypervisor release reported by `version`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterVersion {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub release: String,
    #[serde(default)]
    pub repoid: String,
}

// =============================================================================
// INVENTORY
// =============================================================================

/// Resource summary of an instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance_id: u32,
    /// Number of virtual CPUs
    pub cpus: u32,
    /// Maximum memory (bytes)
    pub memory_bytes: u64,
    /// Maximum root disk size (bytes)
    pub disk_bytes: u64,
    /// Guest OS as reported by the guest agent; empty when unavailable
    pub guest_os: String,
}

/// A virtual NIC, merged from the instance configuration and the guest's
/// live report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NicInfo {
    /// Config slot name (e.g. "net0")
    pub slot: String,
    /// Numeric slot index
    pub index: u32,
    /// Hardware address as configured
    pub mac: String,
    /// NIC model or container interface type
    pub model: Option<String>,
    pub bridge: Option<String>,
    pub vlan_tag: Option<u16>,
    pub firewall: bool,
    pub link_up: bool,
    /// Interface name inside the guest
    pub guest_name: Option<String>,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
}

/// One NIC in an [`InstanceDetails`] report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NicDetails {
    #[serde(flatten)]
    pub nic: NicInfo,
    /// The NIC sits on one of the resource's reserved networks
    pub is_predefined: bool,
}

/// Aggregated view used by the details command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDetails {
    pub info: InstanceInfo,
    pub power_state: PowerState,
    pub nics: Vec<NicDetails>,
    pub primary_ip: Option<String>,
}

/// A snapshot as listed by the hypervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
    /// Creation time (Unix seconds)
    #[serde(default)]
    pub snaptime: Option<i64>,
    /// Snapshot includes RAM state
    #[serde(default, deserialize_with = "int_or_bool")]
    pub vmstate: bool,
}

fn int_or_bool<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Bool(b) => b,
        serde_json::Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        serde_json::Value::String(s) => s == "1" || s.eq_ignore_ascii_case("true"),
        _ => false,
    })
}
