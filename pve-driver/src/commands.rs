//! Dispatch of CLI commands into the engine.

use anyhow::Result;
use pve_engine::deploy::{DeployRequest, DeploySource};
use pve_engine::network::{ActionType, ConnectivityAction, VlanMode};
use pve_engine::PveEngine;
use serde_json::{json, Value};
use std::time::Duration;

use crate::cli::{Command, DeployArgs, ModeArg};

fn deploy_request(args: DeployArgs, source: DeploySource) -> DeployRequest {
    DeployRequest {
        app_name: args.app_name,
        autogenerated_name: args.autogenerate_name,
        source,
        target_storage: args.storage,
        target_node: args.target_node,
        user: args.ci_user,
        password: args.ci_password,
    }
}

fn container_source(
    image: Option<String>,
    container_id: Option<u32>,
    snapshot: Option<String>,
    full_clone: Option<bool>,
) -> DeploySource {
    match (container_id, image) {
        (Some(container_id), _) => DeploySource::ContainerFromContainer { container_id, snapshot },
        (None, image) => DeploySource::ContainerFromImage {
            image: image.unwrap_or_default(),
            full_clone,
        },
    }
}

/// Run one command and return its JSON result.
pub async fn run(engine: &PveEngine, command: Command) -> Result<Value> {
    let instances = engine.instances();

    let output = match command {
        Command::DeployFromVm { deploy, vm_id, snapshot } => {
            let request = deploy_request(deploy, DeploySource::VmFromVm { vm_id, snapshot });
            serde_json::to_value(engine.deployer().deploy(&request).await?)?
        }
        Command::DeployFromTemplate { deploy, template_id, full_clone } => {
            let request = deploy_request(
                deploy,
                DeploySource::VmFromTemplate { template_id, full_clone },
            );
            serde_json::to_value(engine.deployer().deploy(&request).await?)?
        }
        Command::DeployContainer { deploy, image, container_id, snapshot, full_clone } => {
            let source = container_source(image, container_id, snapshot, full_clone);
            let request = deploy_request(deploy, source);
            serde_json::to_value(engine.deployer().deploy(&request).await?)?
        }

        Command::Discover => serde_json::to_value(engine.discover().await?)?,

        Command::PowerOn { id } => {
            instances.start(id).await?;
            json!({ "instance_id": id, "requested": "power_on" })
        }
        Command::PowerOff { id, hard, soft } => {
            if hard || soft {
                instances.stop(id, soft).await?;
            } else {
                instances.power_off(id).await?;
            }
            json!({ "instance_id": id, "power_state": "stopped" })
        }
        Command::Delete { id } => {
            instances.delete(id).await?;
            json!({ "instance_id": id, "deleted": true })
        }
        Command::Status { id } => {
            let state = instances.status(id).await?;
            json!({ "instance_id": id, "power_state": state })
        }
        Command::Details { id } => serde_json::to_value(instances.details(id).await?)?,
        Command::RefreshIp { id, prefix, timeout_secs } => {
            let ip = instances
                .refresh_ip(id, prefix.as_deref(), Duration::from_secs(timeout_secs))
                .await?;
            json!({ "instance_id": id, "ip": ip })
        }

        Command::Connect { id, slot, vlan, mode, switch, firewall } => {
            let action = ConnectivityAction {
                action_id: format!("connect-{}", id),
                action_type: ActionType::Set,
                instance_id: id,
                vnic: slot,
                vlan_id: vlan,
                mode: match mode {
                    ModeArg::Access => VlanMode::Access,
                    ModeArg::Trunk => VlanMode::Trunk,
                },
                switch_name: switch,
                enable_firewall: firewall,
                interface_mac: None,
            };
            serde_json::to_value(engine.connectivity().apply(&[action]).await?)?
        }
        Command::Disconnect { id, mac } => {
            let action = ConnectivityAction {
                action_id: format!("disconnect-{}", id),
                action_type: ActionType::Remove,
                instance_id: id,
                vnic: None,
                vlan_id: String::new(),
                mode: VlanMode::Access,
                switch_name: None,
                enable_firewall: false,
                interface_mac: Some(mac),
            };
            serde_json::to_value(engine.connectivity().apply(&[action]).await?)?
        }

        Command::SnapshotSave { id, name, save_memory } => {
            let snapshots = engine.snapshots();
            match name {
                Some(name) => {
                    let name = snapshots.save(id, &name, &save_memory).await?;
                    json!({ "instance_id": id, "snapshot": name })
                }
                None => {
                    let artifact = snapshots.orchestration_save(id).await?;
                    json!({ "instance_id": id, "artifact": artifact })
                }
            }
        }
        Command::SnapshotRestore { id, name, artifact } => {
            let snapshots = engine.snapshots();
            match (name, artifact) {
                (Some(name), _) => snapshots.restore(id, &name).await?,
                (None, Some(artifact)) => snapshots.orchestration_restore(id, &artifact).await?,
                (None, None) => anyhow::bail!("either --name or --artifact is required"),
            }
            json!({ "instance_id": id, "restored": true })
        }
        Command::SnapshotRemove { id, name } => {
            engine.snapshots().remove(id, &name).await?;
            json!({ "instance_id": id, "removed": name })
        }
        Command::SnapshotList { id } => serde_json::to_value(engine.snapshots().list(id).await?)?,
    };

    Ok(output)
}
