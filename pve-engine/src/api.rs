//! Typed endpoints of the hypervisor API.
//!
//! Each method builds one [`ApiRequest`] with the status map that endpoint
//! needs and decodes the unwrapped payload. No retries or waiting happen
//! here; that is the job of the callers.

use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::error::{PveError, Result};
use crate::transport::{ApiRequest, Transport, AGENT_STATUS_MAP};
use crate::types::{ClusterVersion, InstanceKind, PowerState, SnapshotInfo, TaskHandle, TaskStatus};

/// One `qemu`/`lxc` entry of `cluster/resources?type=vm`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterResource {
    pub vmid: u32,
    pub node: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub template: Option<u8>,
}

/// `status/current` payload, reduced to the fields the engine reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CurrentStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub qmpstatus: Option<String>,
    /// Name of the operation currently holding the instance lock
    #[serde(default)]
    pub lock: Option<String>,
    #[serde(default)]
    pub cpus: Option<f64>,
    #[serde(default)]
    pub maxmem: Option<u64>,
    #[serde(default)]
    pub maxdisk: Option<u64>,
}

/// Lock left on a hibernated VM until it is resumed.
pub const HIBERNATION_LOCK: &str = "suspended";

impl CurrentStatus {
    /// Power state of the payload. A hibernated VM reports `stopped` but
    /// keeps the `suspended` lock, and maps to `Suspended`.
    pub fn power_state(&self) -> PowerState {
        if self.lock.as_deref() == Some(HIBERNATION_LOCK) {
            return PowerState::Suspended;
        }
        PowerState::from_status(&self.status, self.qmpstatus.as_deref())
    }
}

/// A network interface as seen from inside the guest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuestInterface {
    pub name: String,
    pub mac: Option<String>,
    pub ipv4: Vec<String>,
    pub ipv6: Vec<String>,
}

/// Parameters of a clone call.
#[derive(Debug, Clone)]
pub struct CloneParams {
    pub new_id: u32,
    pub name: String,
    pub snapshot: Option<String>,
    pub full: bool,
    pub storage: Option<String>,
    pub target_node: Option<String>,
}

/// Thin typed wrapper over a [`Transport`].
#[derive(Clone)]
pub struct PveApi {
    transport: Arc<dyn Transport>,
}

fn instance_path(node: &str, kind: InstanceKind, id: u32) -> String {
    format!("nodes/{}/{}/{}", node, kind.as_str(), id)
}

fn task_from(node: &str, data: Value) -> Result<TaskHandle> {
    match data {
        Value::String(upid) if !upid.is_empty() => Ok(TaskHandle::new(node, upid)),
        other => Err(PveError::UnexpectedResponse(format!(
            "expected a task id, got {}",
            other
        ))),
    }
}

fn decode<T: serde::de::DeserializeOwned>(data: Value, what: &str) -> Result<T> {
    serde_json::from_value(data)
        .map_err(|e| PveError::UnexpectedResponse(format!("{}: {}", what, e)))
}

impl PveApi {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    async fn call(&self, request: ApiRequest) -> Result<Value> {
        self.transport.request(request).await
    }

    // =========================================================================
    // Cluster
    // =========================================================================

    /// All VMs and containers in the cluster.
    pub async fn cluster_instances(&self) -> Result<Vec<ClusterResource>> {
        let data = self.call(ApiRequest::get("cluster/resources?type=vm")).await?;
        let entries: Vec<ClusterResource> = decode(data, "cluster resources")?;
        Ok(entries
            .into_iter()
            .filter(|r| InstanceKind::from_resource_type(&r.resource_type).is_some())
            .collect())
    }

    /// Release of the API endpoint. Needs a valid ticket.
    pub async fn version(&self) -> Result<ClusterVersion> {
        let data = self.call(ApiRequest::get("version")).await?;
        decode(data, "version")
    }

    /// Next free instance ID.
    pub async fn next_id(&self) -> Result<u32> {
        let data = self.call(ApiRequest::get("cluster/nextid")).await?;
        let parsed = match &data {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            _ => None,
        };
        parsed.ok_or_else(|| PveError::UnexpectedResponse(format!("next id: {}", data)))
    }

    pub async fn task_status(&self, task: &TaskHandle) -> Result<TaskStatus> {
        let path = format!(
            "nodes/{}/tasks/{}/status",
            task.node,
            urlencoding::encode(&task.upid)
        );
        let data = self.call(ApiRequest::get(path)).await?;
        decode(data, "task status")
    }

    // =========================================================================
    // Power
    // =========================================================================

    pub async fn current_status(&self, node: &str, kind: InstanceKind, id: u32) -> Result<CurrentStatus> {
        let path = format!("{}/status/current", instance_path(node, kind, id));
        let data = self.call(ApiRequest::get(path)).await?;
        decode(data, "instance status")
    }

    async fn power(&self, node: &str, kind: InstanceKind, id: u32, action: &str) -> Result<TaskHandle> {
        let path = format!("{}/status/{}", instance_path(node, kind, id), action);
        let data = self.call(ApiRequest::post(path)).await?;
        task_from(node, data)
    }

    pub async fn start(&self, node: &str, kind: InstanceKind, id: u32) -> Result<TaskHandle> {
        self.power(node, kind, id, "start").await
    }

    /// ACPI shutdown.
    pub async fn shutdown(&self, node: &str, kind: InstanceKind, id: u32) -> Result<TaskHandle> {
        self.power(node, kind, id, "shutdown").await
    }

    /// Immediate stop.
    pub async fn stop(&self, node: &str, kind: InstanceKind, id: u32) -> Result<TaskHandle> {
        self.power(node, kind, id, "stop").await
    }

    /// Remove the instance, purging it from backup jobs and destroying
    /// disks no longer referenced by any config.
    pub async fn delete(&self, node: &str, kind: InstanceKind, id: u32) -> Result<TaskHandle> {
        let path = format!(
            "{}?purge=1&destroy-unreferenced-disks=1",
            instance_path(node, kind, id)
        );
        let data = self.call(ApiRequest::delete(path)).await?;
        task_from(node, data)
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Raw (unparsed) configuration map.
    pub async fn config(&self, node: &str, kind: InstanceKind, id: u32) -> Result<Map<String, Value>> {
        let path = format!("{}/config", instance_path(node, kind, id));
        match self.call(ApiRequest::get(path)).await? {
            Value::Object(map) => Ok(map),
            other => Err(PveError::UnexpectedResponse(format!("instance config: {}", other))),
        }
    }

    /// Update configuration keys.
    ///
    /// `asynchronous` uses POST (VMs only), which hands back a task id;
    /// otherwise PUT applies the change before returning. Returns the task
    /// when the hypervisor created one.
    pub async fn update_config(
        &self,
        node: &str,
        kind: InstanceKind,
        id: u32,
        changes: Value,
        asynchronous: bool,
    ) -> Result<Option<TaskHandle>> {
        let path = format!("{}/config", instance_path(node, kind, id));
        let request = if asynchronous && kind == InstanceKind::Qemu {
            ApiRequest::post(path)
        } else {
            ApiRequest::put(path)
        };

        match self.call(request.with_body(changes)).await? {
            Value::String(upid) if upid.starts_with("UPID:") => Ok(Some(TaskHandle::new(node, upid))),
            _ => Ok(None),
        }
    }

    pub async fn clone_instance(
        &self,
        node: &str,
        kind: InstanceKind,
        source_id: u32,
        params: &CloneParams,
    ) -> Result<TaskHandle> {
        let mut body = json!({
            "newid": params.new_id,
            "full": if params.full { 1 } else { 0 },
        });
        body[kind.name_key()] = Value::String(params.name.clone());
        if let Some(snapshot) = &params.snapshot {
            body["snapname"] = Value::String(snapshot.clone());
        }
        if let Some(storage) = &params.storage {
            body["storage"] = Value::String(storage.clone());
        }
        if let Some(target) = &params.target_node {
            body["target"] = Value::String(target.clone());
        }

        let path = format!("{}/clone", instance_path(node, kind, source_id));
        let data = self.call(ApiRequest::post(path).with_body(body)).await?;
        task_from(node, data)
    }

    // =========================================================================
    // Guest agent
    // =========================================================================

    /// Interfaces reported from inside the guest. Fails with
    /// `InstanceNotRunning` when the agent (or container) is down.
    pub async fn guest_interfaces(&self, node: &str, kind: InstanceKind, id: u32) -> Result<Vec<GuestInterface>> {
        match kind {
            InstanceKind::Qemu => {
                let path = format!("{}/agent/network-get-interfaces", instance_path(node, kind, id));
                let data = self
                    .call(ApiRequest::get(path).with_status_map(AGENT_STATUS_MAP))
                    .await?;
                Ok(parse_agent_interfaces(&data))
            }
            InstanceKind::Lxc => {
                let path = format!("{}/interfaces", instance_path(node, kind, id));
                let data = self
                    .call(ApiRequest::get(path).with_status_map(AGENT_STATUS_MAP))
                    .await?;
                Ok(parse_container_interfaces(&data))
            }
        }
    }

    /// `"<name> <version>"` from the QEMU guest agent.
    pub async fn guest_os(&self, node: &str, id: u32) -> Result<String> {
        let path = format!("{}/agent/get-osinfo", instance_path(node, InstanceKind::Qemu, id));
        let data = self
            .call(ApiRequest::get(path).with_status_map(AGENT_STATUS_MAP))
            .await?;
        let result = data.get("result").unwrap_or(&Value::Null);
        let name = result.get("name").and_then(Value::as_str).unwrap_or_default();
        let version = result.get("version").and_then(Value::as_str).unwrap_or_default();
        Ok(format!("{} {}", name, version).trim().to_string())
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    pub async fn snapshots(&self, node: &str, kind: InstanceKind, id: u32) -> Result<Vec<SnapshotInfo>> {
        let path = format!("{}/snapshot", instance_path(node, kind, id));
        let data = self.call(ApiRequest::get(path)).await?;
        decode(data, "snapshot list")
    }

    pub async fn create_snapshot(
        &self,
        node: &str,
        kind: InstanceKind,
        id: u32,
        name: &str,
        with_memory: bool,
    ) -> Result<TaskHandle> {
        let path = format!("{}/snapshot", instance_path(node, kind, id));
        let mut body = json!({ "snapname": name });
        // Containers have no RAM state to save.
        if kind == InstanceKind::Qemu {
            body["vmstate"] = json!(if with_memory { 1 } else { 0 });
        }
        let data = self.call(ApiRequest::post(path).with_body(body)).await?;
        task_from(node, data)
    }

    pub async fn rollback_snapshot(&self, node: &str, kind: InstanceKind, id: u32, name: &str) -> Result<TaskHandle> {
        let path = format!(
            "{}/snapshot/{}/rollback",
            instance_path(node, kind, id),
            urlencoding::encode(name)
        );
        let data = self.call(ApiRequest::post(path)).await?;
        task_from(node, data)
    }

    pub async fn delete_snapshot(&self, node: &str, kind: InstanceKind, id: u32, name: &str) -> Result<TaskHandle> {
        let path = format!(
            "{}/snapshot/{}",
            instance_path(node, kind, id),
            urlencoding::encode(name)
        );
        let data = self.call(ApiRequest::delete(path)).await?;
        task_from(node, data)
    }
}

/// Decode `{"result": [{"name", "hardware-address", "ip-addresses": [...]}]}`.
fn parse_agent_interfaces(data: &Value) -> Vec<GuestInterface> {
    let entries = data
        .get("result")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    entries
        .iter()
        .map(|entry| {
            let mut iface = GuestInterface {
                name: entry.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                mac: entry
                    .get("hardware-address")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                ..Default::default()
            };
            for addr in entry
                .get("ip-addresses")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let ip = match addr.get("ip-address").and_then(Value::as_str) {
                    Some(ip) => ip.to_string(),
                    None => continue,
                };
                match addr.get("ip-address-type").and_then(Value::as_str) {
                    Some("ipv4") => iface.ipv4.push(ip),
                    Some("ipv6") => iface.ipv6.push(ip),
                    _ => {}
                }
            }
            iface
        })
        .collect()
}

/// Decode `[{"name", "hwaddr", "inet": "10.0.0.5/24", "inet6": ...}]`.
fn parse_container_interfaces(data: &Value) -> Vec<GuestInterface> {
    let strip = |v: Option<&Value>| -> Vec<String> {
        v.and_then(Value::as_str)
            .map(|s| s.split('/').next().unwrap_or(s).to_string())
            .into_iter()
            .collect()
    };

    data.as_array()
        .into_iter()
        .flatten()
        .map(|entry| GuestInterface {
            name: entry.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
            mac: entry.get("hwaddr").and_then(Value::as_str).map(str::to_string),
            ipv4: strip(entry.get("inet")),
            ipv6: strip(entry.get("inet6")),
        })
        .collect()
}
