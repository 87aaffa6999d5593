use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::mac::{generate_mac, normalize_mac};
use super::settings::{NetworkSettings, NicIdentity};
use super::{ActionType, ConnectivityAction, ConnectivityResult};
use crate::config_parser::{field, parse_instance_config, parse_value};
use crate::error::{PveError, Result};
use crate::instance::InstanceOps;
use crate::types::{InstanceKind, Placement};

const DEFAULT_MODEL: &str = "virtio";

/// Container keys carried over when a NIC is re-pointed.
const KEPT_CONTAINER_KEYS: &[&str] = &["ip", "gw", "ip6", "gw6", "mtu", "rate", "type"];

/// Attaches and detaches virtual NICs.
#[derive(Clone)]
pub struct ConnectivityReconciler {
    ops: InstanceOps,
}

impl ConnectivityReconciler {
    pub fn new(ops: InstanceOps) -> Self {
        Self { ops }
    }

    pub fn with_cancellation(&self, cancel: CancellationToken) -> Self {
        Self::new(self.ops.with_cancellation(cancel))
    }

    /// Resolve settings for every action, failing on the first one that
    /// cannot be resolved.
    pub fn validate(&self, actions: &[ConnectivityAction]) -> Result<Vec<NetworkSettings>> {
        actions
            .iter()
            .map(|action| {
                if action.action_type == ActionType::Remove
                    && action.interface_mac.as_deref().map_or(true, |m| m.trim().is_empty())
                {
                    return Err(PveError::InvalidParameters(format!(
                        "action {}: disconnect requires an interface MAC",
                        action.action_id
                    )));
                }
                NetworkSettings::resolve(action, self.ops.config())
            })
            .collect()
    }

    /// Point NIC `net<slot>` at the given bridge/VLAN and return its MAC.
    ///
    /// An existing NIC keeps its model and hardware address. A new NIC is
    /// created without a MAC so the hypervisor assigns one; if none shows up
    /// a locally generated address is written.
    #[instrument(skip(self, settings), fields(instance_id = id, bridge = %settings.bridge))]
    pub async fn attach(&self, id: u32, slot: u32, settings: &NetworkSettings) -> Result<String> {
        let placement = self.ops.resolver().locate(id)?;
        let key = format!("net{}", slot);
        let raw = self.ops.api().config(&placement.node, placement.kind, id).await?;
        let parsed = parse_instance_config(&raw);

        let existing = parsed.get(&key);
        let mut identity = identity_for(placement.kind, slot, existing, &parsed);
        let extra = kept_fields(placement.kind, existing);

        let descriptor = settings.descriptor(placement.kind, &identity, &extra);
        self.write_nic(&placement, id, &key, descriptor).await?;

        if let Some(mac) = identity.mac {
            info!(slot = %key, mac = %mac, "NIC re-pointed");
            return Ok(mac);
        }

        let raw = self.ops.api().config(&placement.node, placement.kind, id).await?;
        let assigned = raw
            .get(&key)
            .map(|v| parse_value(&key, v))
            .and_then(|v| field(&v, "mac").map(str::to_string));

        let mac = match assigned {
            Some(mac) => mac,
            None => {
                let mac = generate_mac();
                warn!(slot = %key, mac = %mac, "No address assigned, writing a generated one");
                identity.mac = Some(mac.clone());
                let descriptor = settings.descriptor(placement.kind, &identity, &extra);
                self.write_nic(&placement, id, &key, descriptor).await?;
                mac
            }
        };

        info!(slot = %key, mac = %mac, "NIC attached");
        Ok(mac)
    }

    /// Bring down the link of the NIC with hardware address `mac`.
    ///
    /// Returns the MAC, or an empty string when the instance or the NIC no
    /// longer exists.
    #[instrument(skip(self), fields(instance_id = id))]
    pub async fn detach(&self, id: u32, mac: &str) -> Result<String> {
        let placement = match self.ops.resolver().locate_fresh(id).await {
            Ok(placement) => placement,
            Err(PveError::InstanceNotFound(_)) => {
                warn!("Instance no longer exists, skipping disconnect");
                return Ok(String::new());
            }
            Err(e) => return Err(e),
        };

        let wanted = normalize_mac(mac).unwrap_or_else(|| mac.trim().to_ascii_uppercase());
        let raw = self.ops.api().config(&placement.node, placement.kind, id).await?;

        let Some((key, descriptor)) = find_nic(&raw, &wanted) else {
            info!(mac = %wanted, "NIC not found, treating as disconnected");
            return Ok(String::new());
        };

        if parse_value(&key, &Value::String(descriptor.clone())).get("link_down") == Some(&json!("1")) {
            info!(slot = %key, "NIC link already down");
            return Ok(wanted);
        }

        let api = self.ops.api();
        let node = placement.node.as_str();
        let kind = placement.kind;
        let changes = json!({ key.as_str(): link_down_descriptor(&descriptor) });
        let task = self
            .ops
            .locked("disconnect nic", move || {
                api.update_config(node, kind, id, changes.clone(), true)
            })
            .await?;

        if let Some(task) = task {
            self.ops
                .waiter()
                .wait(
                    &task,
                    &self.ops.policies().task,
                    &format!("Failed to disconnect {} of instance {}", key, id),
                )
                .await?;
        }

        info!(slot = %key, mac = %wanted, "NIC disconnected");
        Ok(wanted)
    }

    /// Apply a batch: validate all actions, then run disconnects before
    /// connects. Per-action failures are reported in the results; only
    /// cancellation aborts the batch.
    pub async fn apply(&self, actions: &[ConnectivityAction]) -> Result<Vec<ConnectivityResult>> {
        let settings = self.validate(actions)?;

        let mut order: Vec<usize> = (0..actions.len()).collect();
        order.sort_by_key(|&i| actions[i].action_type != ActionType::Remove);

        let mut results: Vec<Option<ConnectivityResult>> = vec![None; actions.len()];
        for i in order {
            let action = &actions[i];
            let outcome = match action.action_type {
                ActionType::Remove => {
                    let mac = action.interface_mac.as_deref().unwrap_or_default();
                    self.detach(action.instance_id, mac).await
                }
                ActionType::Set => self.connect(action, &settings[i]).await,
            };

            results[i] = Some(match outcome {
                Ok(mac) => ConnectivityResult::ok(&action.action_id, mac),
                Err(e @ PveError::Cancelled(_)) => return Err(e),
                Err(e) => {
                    warn!(action_id = %action.action_id, error = %e, "Connectivity action failed");
                    ConnectivityResult::failed(&action.action_id, e.to_string())
                }
            });
        }

        Ok(results.into_iter().flatten().collect())
    }

    async fn connect(&self, action: &ConnectivityAction, settings: &NetworkSettings) -> Result<String> {
        let slot = match action.vnic {
            Some(slot) => slot,
            None => self.free_slot(action.instance_id).await?,
        };
        self.attach(action.instance_id, slot, settings).await
    }

    /// Lowest `net<N>` index not present in the configuration.
    async fn free_slot(&self, id: u32) -> Result<u32> {
        let placement = self.ops.resolver().locate(id)?;
        let raw = self.ops.api().config(&placement.node, placement.kind, id).await?;
        Ok((0..)
            .find(|n| !raw.contains_key(&format!("net{}", n)))
            .unwrap_or_default())
    }

    async fn write_nic(&self, placement: &Placement, id: u32, key: &str, descriptor: String) -> Result<()> {
        let api = self.ops.api();
        let node = placement.node.as_str();
        let kind = placement.kind;
        let changes = json!({ key: descriptor });

        let task = self
            .ops
            .locked("connect nic", move || {
                api.update_config(node, kind, id, changes.clone(), false)
            })
            .await?;

        if let Some(task) = task {
            self.ops
                .waiter()
                .wait(
                    &task,
                    &self.ops.policies().task,
                    &format!("Failed to connect {} of instance {}", key, id),
                )
                .await?;
        }
        Ok(())
    }
}

/// Model/name and MAC a NIC keeps when re-pointed. New VM NICs take the
/// model of the instance's other NICs.
fn identity_for(kind: InstanceKind, slot: u32, existing: Option<&Value>, parsed: &Map<String, Value>) -> NicIdentity {
    let mac = existing.and_then(|v| field(v, "mac")).map(str::to_string);
    let model = match kind {
        InstanceKind::Qemu => existing
            .and_then(|v| field(v, "type"))
            .or_else(|| {
                parsed
                    .iter()
                    .filter(|(k, _)| k.starts_with("net"))
                    .find_map(|(_, v)| field(v, "type"))
            })
            .unwrap_or(DEFAULT_MODEL)
            .to_string(),
        InstanceKind::Lxc => existing
            .and_then(|v| field(v, "name"))
            .map(str::to_string)
            .unwrap_or_else(|| format!("eth{}", slot)),
    };
    NicIdentity { model, mac }
}

fn kept_fields(kind: InstanceKind, existing: Option<&Value>) -> Vec<(String, String)> {
    let (InstanceKind::Lxc, Some(existing)) = (kind, existing) else {
        return Vec::new();
    };
    KEPT_CONTAINER_KEYS
        .iter()
        .filter_map(|k| {
            field(existing, k)
                // `type` holds the pseudo-model `hwaddr` when no explicit type was set
                .filter(|v| *k != "type" || *v != "hwaddr")
                .map(|v| (k.to_string(), v.to_string()))
        })
        .collect()
}

/// `(key, raw descriptor)` of the NIC with hardware address `mac`.
fn find_nic(raw: &Map<String, Value>, mac: &str) -> Option<(String, String)> {
    raw.iter()
        .filter(|(key, _)| key.starts_with("net"))
        .find_map(|(key, value)| {
            let descriptor = value.as_str()?;
            let parsed = parse_value(key, value);
            let nic_mac = field(&parsed, "mac")?;
            (normalize_mac(nic_mac).as_deref() == Some(mac)).then(|| (key.clone(), descriptor.to_string()))
        })
}

/// `descriptor` with its link forced down. Any existing `link_down` entry is
/// replaced; the hypervisor rejects duplicate keys.
fn link_down_descriptor(descriptor: &str) -> String {
    let mut parts: Vec<&str> = descriptor
        .split(',')
        .filter(|part| !part.is_empty() && !part.trim_start().starts_with("link_down="))
        .collect();
    parts.push("link_down=1");
    parts.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_new_vm_nic_copies_sibling_model() {
        let parsed = parse_instance_config(&config(json!({
            "net0": "e1000=BC:24:11:2A:7F:01,bridge=vmbr0"
        })));
        let identity = identity_for(InstanceKind::Qemu, 1, None, &parsed);
        assert_eq!(identity.model, "e1000");
        assert_eq!(identity.mac, None);

        let identity = identity_for(InstanceKind::Qemu, 0, parsed.get("net0"), &parsed);
        assert_eq!(identity.mac.as_deref(), Some("BC:24:11:2A:7F:01"));

        let identity = identity_for(InstanceKind::Qemu, 0, None, &Map::new());
        assert_eq!(identity.model, "virtio");
    }

    #[test]
    fn test_container_identity_and_kept_fields() {
        let parsed = parse_instance_config(&config(json!({
            "net0": "name=eth0,bridge=vmbr0,hwaddr=BC:24:11:00:00:02,ip=dhcp"
        })));
        let existing = parsed.get("net0");
        let identity = identity_for(InstanceKind::Lxc, 0, existing, &parsed);
        assert_eq!(identity.model, "eth0");
        assert_eq!(identity.mac.as_deref(), Some("BC:24:11:00:00:02"));
        assert_eq!(
            kept_fields(InstanceKind::Lxc, existing),
            vec![("ip".to_string(), "dhcp".to_string())]
        );

        assert_eq!(identity_for(InstanceKind::Lxc, 3, None, &parsed).model, "eth3");
    }

    #[test]
    fn test_find_nic_by_mac() {
        let raw = config(json!({
            "net0": "virtio=BC:24:11:2A:7F:01,bridge=vmbr0",
            "net1": "virtio=BC:24:11:2A:7F:02,bridge=vmbr1,tag=20",
            "scsi0": "local-lvm:vm-105-disk-0,size=32G"
        }));
        let (key, descriptor) = find_nic(&raw, "BC:24:11:2A:7F:02").unwrap();
        assert_eq!(key, "net1");
        assert_eq!(descriptor, "virtio=BC:24:11:2A:7F:02,bridge=vmbr1,tag=20");
        assert!(find_nic(&raw, "52:54:00:00:00:01").is_none());
    }

    #[test]
    fn test_link_down_replaces_existing_flag() {
        assert_eq!(
            link_down_descriptor("virtio=BC:24:11:00:00:82,bridge=vmbr0,link_down=0"),
            "virtio=BC:24:11:00:00:82,bridge=vmbr0,link_down=1"
        );
        assert_eq!(
            link_down_descriptor("virtio=BC:24:11:00:00:82,bridge=vmbr0,tag=10"),
            "virtio=BC:24:11:00:00:82,bridge=vmbr0,tag=10,link_down=1"
        );
    }
}
