//! Power, inventory and teardown of single instances.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::api::{CurrentStatus, GuestInterface, PveApi};
use crate::config::ResourceConfig;
use crate::config_parser::{field, parse_instance_config};
use crate::error::{PveError, Result};
use crate::resolver::NodeResolver;
use crate::retry::{check_cancelled, retry, sleep_or_cancel, EnginePolicies};
use crate::task::TaskWaiter;
use crate::types::{
    InstanceDetails, InstanceInfo, InstanceKind, NicDetails, NicInfo, Placement, PowerState,
};

/// Interval between interface polls while waiting for an address.
pub const IP_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Operations on existing instances.
#[derive(Clone)]
pub struct InstanceOps {
    api: PveApi,
    resolver: Arc<NodeResolver>,
    waiter: TaskWaiter,
    config: Arc<ResourceConfig>,
    policies: Arc<EnginePolicies>,
    cancel: CancellationToken,
}

impl InstanceOps {
    pub fn new(
        api: PveApi,
        resolver: Arc<NodeResolver>,
        config: Arc<ResourceConfig>,
        policies: Arc<EnginePolicies>,
        cancel: CancellationToken,
    ) -> Self {
        let waiter = TaskWaiter::new(api.clone(), cancel.clone());
        Self {
            api,
            resolver,
            waiter,
            config,
            policies,
            cancel,
        }
    }

    /// Same operations, observing a different cancellation token.
    pub fn with_cancellation(&self, cancel: CancellationToken) -> Self {
        Self::new(
            self.api.clone(),
            Arc::clone(&self.resolver),
            Arc::clone(&self.config),
            Arc::clone(&self.policies),
            cancel,
        )
    }

    pub(crate) fn api(&self) -> &PveApi {
        &self.api
    }

    pub(crate) fn resolver(&self) -> &Arc<NodeResolver> {
        &self.resolver
    }

    pub(crate) fn waiter(&self) -> &TaskWaiter {
        &self.waiter
    }

    pub(crate) fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub(crate) fn policies(&self) -> &EnginePolicies {
        &self.policies
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run a mutating call, retrying while another task holds the lock.
    pub(crate) async fn locked<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry(&self.policies.instance_lock, &self.cancel, operation, op).await
    }

    /// Read `status/current`. The `lock` field is reported as is; only a
    /// read rejected with a lock error is retried.
    pub(crate) async fn current_status(&self, placement: &Placement, id: u32) -> Result<CurrentStatus> {
        let api = &self.api;
        let node = placement.node.as_str();
        let kind = placement.kind;

        let status = self
            .locked("read status", move || api.current_status(node, kind, id))
            .await?;
        if let Some(lock) = &status.lock {
            debug!(lock = %lock, "Instance holds a lock");
        }
        Ok(status)
    }

    async fn power_state_of(&self, placement: &Placement, id: u32) -> Result<PowerState> {
        Ok(self.current_status(placement, id).await?.power_state())
    }

    // =========================================================================
    // Power
    // =========================================================================

    /// Power on. Returns as soon as the start is issued; the transition is
    /// observed later through [`InstanceOps::status`].
    #[instrument(skip(self), fields(instance_id = id))]
    pub async fn start(&self, id: u32) -> Result<()> {
        let placement = self.resolver.locate(id)?;

        if self.power_state_of(&placement, id).await? == PowerState::Running {
            info!("Instance already running, skipping start");
            return Ok(());
        }

        let api = &self.api;
        let node = placement.node.as_str();
        let kind = placement.kind;
        let task = self
            .locked("start", move || api.start(node, kind, id))
            .await?;

        info!(node = %task.node, upid = %task.upid, "Start issued");
        Ok(())
    }

    /// Power off and wait until the instance reports `Stopped`.
    ///
    /// Guests may ignore the first ACPI request, so the stop is reissued up
    /// to `stop_attempts` times before failing with `Timeout`.
    #[instrument(skip(self), fields(instance_id = id))]
    pub async fn stop(&self, id: u32, soft: bool) -> Result<()> {
        let placement = self.resolver.locate(id)?;
        self.stop_placed(&placement, id, soft).await
    }

    /// Power off using the resource's configured shutdown method.
    pub async fn power_off(&self, id: u32) -> Result<()> {
        self.stop(id, self.config.shutdown_method.is_soft()).await
    }

    async fn stop_placed(&self, placement: &Placement, id: u32, soft: bool) -> Result<()> {
        let attempts = self.policies.stop_attempts.max(1);
        let api = &self.api;
        let node = placement.node.as_str();
        let kind = placement.kind;
        let message = format!("Failed to stop instance {}", id);

        for attempt in 1..=attempts {
            check_cancelled(&self.cancel, &message)?;

            if self.power_state_of(placement, id).await? == PowerState::Stopped {
                debug!(attempt, "Instance stopped");
                return Ok(());
            }

            let task = if soft {
                self.locked("shutdown", move || api.shutdown(node, kind, id)).await?
            } else {
                self.locked("stop", move || api.stop(node, kind, id)).await?
            };

            match self.waiter.wait(&task, &self.policies.task, &message).await {
                Ok(()) => {}
                Err(e @ PveError::OperationFailed(_)) => {
                    warn!(attempt, error = %e, "Stop task did not complete");
                }
                Err(e) => return Err(e),
            }
        }

        if self.power_state_of(placement, id).await? == PowerState::Stopped {
            return Ok(());
        }

        Err(PveError::Timeout {
            instance_id: id,
            operation: if soft { "shut down" } else { "stop" }.to_string(),
            attempts,
            budget_secs: u64::from(attempts) * self.policies.task.budget_secs(),
        })
    }

    /// Hard-stop and remove an instance, including its unreferenced disks.
    ///
    /// An instance that no longer exists counts as deleted.
    #[instrument(skip(self), fields(instance_id = id))]
    pub async fn delete(&self, id: u32) -> Result<()> {
        let placement = match self.resolver.locate_fresh(id).await {
            Ok(placement) => placement,
            Err(PveError::InstanceNotFound(_)) => {
                info!("Instance does not exist, skipping delete");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.stop_placed(&placement, id, false).await?;

        let api = &self.api;
        let node = placement.node.as_str();
        let kind = placement.kind;
        let task = self
            .locked("delete", move || api.delete(node, kind, id))
            .await?;

        // Destroying disks can take as long as copying them.
        self.waiter
            .wait(
                &task,
                &self.policies.deploy_task,
                &format!("Failed to delete instance {}", id),
            )
            .await?;

        if let Err(e) = self.resolver.refresh().await {
            warn!(error = %e, "Failed to refresh placements after delete");
        }
        info!(node = %placement.node, "Instance deleted");
        Ok(())
    }

    // =========================================================================
    // Inventory
    // =========================================================================

    /// Current power state. Unrecognised hypervisor states map to `Unknown`.
    #[instrument(skip(self), fields(instance_id = id))]
    pub async fn status(&self, id: u32) -> Result<PowerState> {
        let placement = self.resolver.locate(id)?;
        self.power_state_of(&placement, id).await
    }

    /// Virtual NICs keyed by hardware address.
    ///
    /// Configuration is always read; the guest's own report only fills in
    /// names and addresses when the guest is up.
    #[instrument(skip(self), fields(instance_id = id))]
    pub async fn interfaces(&self, id: u32) -> Result<BTreeMap<String, NicInfo>> {
        let placement = self.resolver.locate(id)?;
        let raw = self.api.config(&placement.node, placement.kind, id).await?;
        let parsed = parse_instance_config(&raw);

        let guest = match self
            .api
            .guest_interfaces(&placement.node, placement.kind, id)
            .await
        {
            Ok(guest) => guest,
            Err(PveError::InstanceNotRunning(reason)) => {
                debug!(reason = %reason, "Guest report unavailable");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let mut nics = BTreeMap::new();
        for (slot, value) in &parsed {
            let Some(mut nic) = nic_from_config(slot, value) else {
                continue;
            };
            if let Some(report) = guest.iter().find(|g| {
                g.mac
                    .as_deref()
                    .map(|m| m.eq_ignore_ascii_case(&nic.mac))
                    .unwrap_or(false)
            }) {
                merge_guest_report(&mut nic, report);
            }
            nics.insert(nic.mac.clone(), nic);
        }

        Ok(nics)
    }

    /// CPU, memory, disk and guest OS.
    #[instrument(skip(self), fields(instance_id = id))]
    pub async fn info(&self, id: u32) -> Result<InstanceInfo> {
        let placement = self.resolver.locate(id)?;
        let status = self.current_status(&placement, id).await?;

        let guest_os = match placement.kind {
            InstanceKind::Qemu => match self.api.guest_os(&placement.node, id).await {
                Ok(os) => os,
                Err(PveError::InstanceNotRunning(_)) => String::new(),
                Err(e) => return Err(e),
            },
            InstanceKind::Lxc => {
                let raw = self.api.config(&placement.node, placement.kind, id).await?;
                raw.get("ostype")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            }
        };

        Ok(InstanceInfo {
            instance_id: id,
            cpus: status.cpus.map(|c| c.round() as u32).unwrap_or(0),
            memory_bytes: status.maxmem.unwrap_or(0),
            disk_bytes: status.maxdisk.unwrap_or(0),
            guest_os,
        })
    }

    /// Everything the details view shows, with NICs on reserved networks
    /// flagged.
    pub async fn details(&self, id: u32) -> Result<InstanceDetails> {
        let info = self.info(id).await?;
        let power_state = self.status(id).await?;

        let mut nics: Vec<NicDetails> = self
            .interfaces(id)
            .await?
            .into_values()
            .map(|nic| {
                let vlan = nic.vlan_tag.unwrap_or(0).to_string();
                NicDetails {
                    is_predefined: self.config.is_reserved_network(&vlan),
                    nic,
                }
            })
            .collect();
        nics.sort_by_key(|n| n.nic.index);

        let primary_ip = nics.iter().find_map(|n| n.nic.ipv4.clone());

        Ok(InstanceDetails {
            info,
            power_state,
            nics,
            primary_ip,
        })
    }

    // =========================================================================
    // Guest customisation and addressing
    // =========================================================================

    /// Set the cloud-init user and/or password of a VM.
    #[instrument(skip(self, password), fields(instance_id = id))]
    pub async fn set_user_data(&self, id: u32, user: Option<&str>, password: Option<&str>) -> Result<()> {
        let mut changes = serde_json::Map::new();
        if let Some(user) = user {
            changes.insert("ciuser".to_string(), json!(user));
        }
        if let Some(password) = password {
            changes.insert("cipassword".to_string(), json!(password));
        }
        if changes.is_empty() {
            return Ok(());
        }

        let placement = self.resolver.locate(id)?;
        if placement.kind != InstanceKind::Qemu {
            return Err(PveError::InvalidParameters(format!(
                "instance {} is a container; cloud-init user data applies to VMs only",
                id
            )));
        }

        let api = &self.api;
        let node = placement.node.as_str();
        let changes = Value::Object(changes);
        let task = self
            .locked("set user data", move || {
                api.update_config(node, InstanceKind::Qemu, id, changes.clone(), true)
            })
            .await?;

        if let Some(task) = task {
            self.waiter
                .wait(
                    &task,
                    &self.policies.task,
                    &format!("Failed to set user data on instance {}", id),
                )
                .await?;
        }

        info!(user = ?user, "Cloud-init user data set");
        Ok(())
    }

    /// Wait for the guest to report an IPv4 address starting with `prefix`
    /// (any address when `None`), polling every 5 seconds for up to
    /// `timeout`.
    #[instrument(skip(self), fields(instance_id = id))]
    pub async fn refresh_ip(&self, id: u32, prefix: Option<&str>, timeout: Duration) -> Result<String> {
        if self.status(id).await? != PowerState::Running {
            return Err(PveError::InstanceNotPowered(id));
        }

        let polls = timeout.as_secs() / IP_POLL_INTERVAL.as_secs() + 1;
        let message = format!("refresh ip of instance {}", id);

        for poll in 1..=polls {
            check_cancelled(&self.cancel, &message)?;

            let found = self
                .interfaces(id)
                .await?
                .into_values()
                .filter_map(|nic| nic.ipv4)
                .find(|ip| prefix.map(|p| ip.starts_with(p)).unwrap_or(true));

            if let Some(ip) = found {
                info!(ip = %ip, "Found instance address");
                return Ok(ip);
            }

            if poll < polls {
                sleep_or_cancel(IP_POLL_INTERVAL, &self.cancel, &message).await?;
            }
        }

        Err(PveError::IpNotFound {
            instance_id: id,
            filter: prefix.map(str::to_string),
        })
    }
}

/// Build a NIC record from a parsed `netN` entry.
pub(crate) fn nic_from_config(slot: &str, value: &Value) -> Option<NicInfo> {
    let index: u32 = slot.strip_prefix("net")?.parse().ok()?;
    let mac = field(value, "mac")?.to_string();

    Some(NicInfo {
        slot: slot.to_string(),
        index,
        mac,
        model: field(value, "type").map(str::to_string),
        bridge: field(value, "bridge").map(str::to_string),
        vlan_tag: field(value, "tag").and_then(|t| t.parse().ok()),
        firewall: field(value, "firewall") == Some("1"),
        link_up: field(value, "link_down") != Some("1"),
        guest_name: field(value, "name").map(str::to_string),
        ipv4: None,
        ipv6: None,
    })
}

fn merge_guest_report(nic: &mut NicInfo, report: &GuestInterface) {
    nic.guest_name = Some(report.name.clone());
    nic.ipv4 = report.ipv4.iter().find(|ip| !ip.starts_with("127.")).cloned();
    nic.ipv6 = report.ipv6.iter().find(|ip| ip.as_str() != "::1").cloned();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nic_from_config() {
        let parsed = crate::config_parser::parse_value(
            "net1",
            &json!("virtio=BC:24:11:2A:7F:01,bridge=vmbr0,tag=10,firewall=1,link_down=1"),
        );
        let nic = nic_from_config("net1", &parsed).unwrap();
        assert_eq!(nic.index, 1);
        assert_eq!(nic.model.as_deref(), Some("virtio"));
        assert_eq!(nic.vlan_tag, Some(10));
        assert!(nic.firewall);
        assert!(!nic.link_up);

        assert!(nic_from_config("net1", &json!({"bridge": "vmbr0"})).is_none());
        assert!(nic_from_config("netdev", &parsed).is_none());
    }

    #[test]
    fn test_merge_skips_loopback() {
        let mut nic = NicInfo { mac: "BC:24:11:2A:7F:01".into(), ..Default::default() };
        let report = GuestInterface {
            name: "eth0".into(),
            mac: Some("bc:24:11:2a:7f:01".into()),
            ipv4: vec!["127.0.0.1".into(), "10.0.0.5".into()],
            ipv6: vec!["::1".into()],
        };
        merge_guest_report(&mut nic, &report);
        assert_eq!(nic.ipv4.as_deref(), Some("10.0.0.5"));
        assert_eq!(nic.ipv6, None);
        assert_eq!(nic.guest_name.as_deref(), Some("eth0"));
    }
}
