//! Resolution of connectivity actions into concrete NIC settings, and the
//! device descriptors built from them.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{ConnectivityAction, VlanMode};
use crate::config::ResourceConfig;
use crate::error::{PveError, Result};
use crate::types::InstanceKind;

pub const MIN_VLAN: u16 = 1;
pub const MAX_VLAN: u16 = 4094;

/// Inclusive VLAN id range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanRange {
    pub start: u16,
    pub end: u16,
}

impl fmt::Display for VlanRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vlan {
    Untagged,
    Access(u16),
    Trunk(Vec<VlanRange>),
}

/// Bridge, VLAN and firewall flag for one NIC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub bridge: String,
    pub vlan: Vlan,
    pub firewall: bool,
}

impl NetworkSettings {
    /// Access-mode settings.
    pub fn access(bridge: impl Into<String>, vlan: u16, firewall: bool) -> Self {
        Self {
            bridge: bridge.into(),
            vlan: Vlan::Access(vlan),
            firewall,
        }
    }

    /// Settings for `action`, taking the bridge from the action or the
    /// resource's default bridge.
    pub fn resolve(action: &ConnectivityAction, config: &ResourceConfig) -> Result<Self> {
        let bridge = action
            .switch_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .or_else(|| config.default_bridge.as_deref().map(str::trim).filter(|s| !s.is_empty()))
            .ok_or_else(|| {
                PveError::InvalidConfig(format!(
                    "action {}: no switch name given and no default bridge configured",
                    action.action_id
                ))
            })?
            .to_string();

        let vlan = parse_vlan(&action.vlan_id, action.mode).map_err(|reason| {
            PveError::InvalidParameters(format!("action {}: {}", action.action_id, reason))
        })?;

        Ok(Self {
            bridge,
            vlan,
            firewall: action.enable_firewall,
        })
    }

    /// `bridge=..,tag=..,firewall=..` part shared by VMs and containers.
    fn network_fields(&self) -> Vec<String> {
        let mut fields = vec![format!("bridge={}", self.bridge)];
        match &self.vlan {
            Vlan::Untagged => {}
            Vlan::Access(tag) => fields.push(format!("tag={}", tag)),
            Vlan::Trunk(ranges) => fields.push(format!(
                "trunks={}",
                ranges.iter().map(ToString::to_string).collect::<Vec<_>>().join(";")
            )),
        }
        fields.push(format!("firewall={}", if self.firewall { 1 } else { 0 }));
        fields
    }

    /// Device descriptor for a `net<slot>` key.
    ///
    /// VMs: `<model>[=<mac>],bridge=..,tag=..,firewall=..`. Containers:
    /// `name=<ifname>[,hwaddr=<mac>],bridge=..,tag=..,firewall=..`, keeping
    /// any `ip`/`ip6` setting from `extra`.
    pub fn descriptor(&self, kind: InstanceKind, nic: &NicIdentity, extra: &[(String, String)]) -> String {
        let mut fields = Vec::new();
        match kind {
            InstanceKind::Qemu => match &nic.mac {
                Some(mac) => fields.push(format!("{}={}", nic.model, mac)),
                None => fields.push(nic.model.clone()),
            },
            InstanceKind::Lxc => {
                fields.push(format!("name={}", nic.model));
                if let Some(mac) = &nic.mac {
                    fields.push(format!("hwaddr={}", mac));
                }
            }
        }
        fields.extend(self.network_fields());
        fields.extend(extra.iter().map(|(k, v)| format!("{}={}", k, v)));
        fields.join(",")
    }
}

/// What stays fixed about a NIC when it is re-pointed: its model (VMs) or
/// interface name (containers), and its hardware address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicIdentity {
    pub model: String,
    pub mac: Option<String>,
}

fn parse_vlan_id(text: &str) -> std::result::Result<u16, String> {
    let id: u16 = text
        .trim()
        .parse()
        .map_err(|_| format!("invalid VLAN id '{}'", text.trim()))?;
    if !(MIN_VLAN..=MAX_VLAN).contains(&id) {
        return Err(format!(
            "VLAN id {} out of range {}..={}",
            id, MIN_VLAN, MAX_VLAN
        ));
    }
    Ok(id)
}

fn parse_vlan(text: &str, mode: VlanMode) -> std::result::Result<Vlan, String> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vlan::Untagged);
    }

    match mode {
        VlanMode::Access => parse_vlan_id(text).map(Vlan::Access),
        VlanMode::Trunk => {
            let mut ranges = Vec::new();
            for part in text.split([',', ';']).map(str::trim).filter(|p| !p.is_empty()) {
                let range = match part.split_once('-') {
                    Some((start, end)) => VlanRange {
                        start: parse_vlan_id(start)?,
                        end: parse_vlan_id(end)?,
                    },
                    None => {
                        let id = parse_vlan_id(part)?;
                        VlanRange { start: id, end: id }
                    }
                };
                if range.start > range.end {
                    return Err(format!("empty VLAN range '{}'", part));
                }
                ranges.push(range);
            }
            Ok(Vlan::Trunk(ranges))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ActionType;

    fn action(vlan_id: &str, mode: VlanMode, switch_name: Option<&str>) -> ConnectivityAction {
        ConnectivityAction {
            action_id: "a1".into(),
            action_type: ActionType::Set,
            instance_id: 105,
            vnic: Some(0),
            vlan_id: vlan_id.into(),
            mode,
            switch_name: switch_name.map(str::to_string),
            enable_firewall: true,
            interface_mac: None,
        }
    }

    #[test]
    fn test_switch_falls_back_to_default_bridge() {
        let mut config = ResourceConfig::default();
        let err = NetworkSettings::resolve(&action("10", VlanMode::Access, None), &config).unwrap_err();
        assert!(matches!(err, PveError::InvalidConfig(_)));

        config.default_bridge = Some("vmbr0".into());
        let settings = NetworkSettings::resolve(&action("10", VlanMode::Access, None), &config).unwrap();
        assert_eq!(settings, NetworkSettings::access("vmbr0", 10, true));

        let settings =
            NetworkSettings::resolve(&action("10", VlanMode::Access, Some("vmbr1")), &config).unwrap();
        assert_eq!(settings.bridge, "vmbr1");
    }

    #[test]
    fn test_access_vlan_bounds() {
        assert!(parse_vlan("0", VlanMode::Access).is_err());
        assert!(parse_vlan("4095", VlanMode::Access).is_err());
        assert!(parse_vlan("ten", VlanMode::Access).is_err());
        assert_eq!(parse_vlan("4094", VlanMode::Access), Ok(Vlan::Access(4094)));
        assert_eq!(parse_vlan(" ", VlanMode::Access), Ok(Vlan::Untagged));
    }

    #[test]
    fn test_trunk_ranges() {
        let vlan = parse_vlan("10, 20-30;40", VlanMode::Trunk).unwrap();
        assert_eq!(
            vlan,
            Vlan::Trunk(vec![
                VlanRange { start: 10, end: 10 },
                VlanRange { start: 20, end: 30 },
                VlanRange { start: 40, end: 40 },
            ])
        );
        assert!(parse_vlan("30-20", VlanMode::Trunk).is_err());
    }

    #[test]
    fn test_descriptors() {
        let settings = NetworkSettings::access("vmbr0", 10, true);
        let new_nic = NicIdentity { model: "virtio".into(), mac: None };
        assert_eq!(
            settings.descriptor(InstanceKind::Qemu, &new_nic, &[]),
            "virtio,bridge=vmbr0,tag=10,firewall=1"
        );

        let trunk = NetworkSettings {
            bridge: "vmbr1".into(),
            vlan: Vlan::Trunk(vec![VlanRange { start: 20, end: 30 }, VlanRange { start: 40, end: 40 }]),
            firewall: false,
        };
        let existing = NicIdentity {
            model: "e1000".into(),
            mac: Some("BC:24:11:2A:7F:01".into()),
        };
        assert_eq!(
            trunk.descriptor(InstanceKind::Qemu, &existing, &[]),
            "e1000=BC:24:11:2A:7F:01,bridge=vmbr1,trunks=20-30;40,firewall=0"
        );

        let container = NicIdentity {
            model: "eth0".into(),
            mac: Some("BC:24:11:00:00:02".into()),
        };
        assert_eq!(
            settings.descriptor(
                InstanceKind::Lxc,
                &container,
                &[("ip".to_string(), "dhcp".to_string())]
            ),
            "name=eth0,hwaddr=BC:24:11:00:00:02,bridge=vmbr0,tag=10,firewall=1,ip=dhcp"
        );
    }
}
