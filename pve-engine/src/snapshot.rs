//! Snapshot management and orchestration save/restore.

use chrono::Utc;
use tracing::{info, instrument};

use crate::error::{PveError, Result};
use crate::instance::InstanceOps;
use crate::types::{PowerState, SnapshotInfo};

/// Prefix of orchestration artifacts produced by [`SnapshotOps::orchestration_save`].
pub const SNAPSHOT_ARTIFACT_TYPE: &str = "proxmox_snapshot";

/// Accepted values of the `save_memory` command parameter.
pub const SAVE_MEMORY_VALUES: [&str; 2] = ["Yes", "No"];

/// The hypervisor's pseudo-snapshot describing the live state.
const CURRENT_STATE: &str = "current";

/// Snapshot operations, layered on [`InstanceOps`].
#[derive(Clone)]
pub struct SnapshotOps {
    ops: InstanceOps,
}

impl SnapshotOps {
    pub fn new(ops: InstanceOps) -> Self {
        Self { ops }
    }

    /// Snapshots of an instance, excluding the live-state entry.
    #[instrument(skip(self), fields(instance_id = id))]
    pub async fn list(&self, id: u32) -> Result<Vec<SnapshotInfo>> {
        let placement = self.ops.resolver().locate(id)?;
        let snapshots = self
            .ops
            .api()
            .snapshots(&placement.node, placement.kind, id)
            .await?;
        Ok(snapshots
            .into_iter()
            .filter(|s| s.name != CURRENT_STATE)
            .collect())
    }

    /// Take a snapshot. RAM is included only when requested and the
    /// instance is running.
    #[instrument(skip(self), fields(instance_id = id))]
    pub async fn create(&self, id: u32, name: &str, dump_memory: bool) -> Result<String> {
        validate_name(name)?;
        let placement = self.ops.resolver().locate(id)?;
        let status = self.ops.current_status(&placement, id).await?;
        let running = status.power_state() == PowerState::Running;
        let with_memory = running && dump_memory;

        let api = self.ops.api();
        let node = placement.node.as_str();
        let kind = placement.kind;
        let task = self
            .ops
            .locked("create snapshot", move || {
                api.create_snapshot(node, kind, id, name, with_memory)
            })
            .await?;

        self.ops
            .waiter()
            .wait(
                &task,
                &self.ops.policies().task,
                &format!("Failed to create snapshot {} of instance {}", name, id),
            )
            .await?;

        info!(snapshot = %name, with_memory, "Snapshot created");
        Ok(name.to_string())
    }

    /// Command-level save: validates the `"Yes"`/`"No"` memory flag.
    pub async fn save(&self, id: u32, name: &str, save_memory: &str) -> Result<String> {
        let dump_memory = parse_save_memory(save_memory)?;
        self.create(id, name, dump_memory).await
    }

    /// Roll the instance back to a snapshot.
    #[instrument(skip(self), fields(instance_id = id))]
    pub async fn restore(&self, id: u32, name: &str) -> Result<()> {
        let placement = self.ops.resolver().locate(id)?;
        let api = self.ops.api();
        let node = placement.node.as_str();
        let kind = placement.kind;
        let task = self
            .ops
            .locked("restore snapshot", move || {
                api.rollback_snapshot(node, kind, id, name)
            })
            .await?;

        self.ops
            .waiter()
            .wait(
                &task,
                &self.ops.policies().task,
                &format!("Failed to restore instance {} from snapshot {}", id, name),
            )
            .await?;

        info!(snapshot = %name, "Snapshot restored");
        Ok(())
    }

    /// Delete a snapshot.
    #[instrument(skip(self), fields(instance_id = id))]
    pub async fn remove(&self, id: u32, name: &str) -> Result<()> {
        let placement = self.ops.resolver().locate(id)?;
        let api = self.ops.api();
        let node = placement.node.as_str();
        let kind = placement.kind;
        let task = self
            .ops
            .locked("remove snapshot", move || {
                api.delete_snapshot(node, kind, id, name)
            })
            .await?;

        self.ops
            .waiter()
            .wait(
                &task,
                &self.ops.policies().task,
                &format!("Failed to delete snapshot {} of instance {}", name, id),
            )
            .await?;

        info!(snapshot = %name, "Snapshot removed");
        Ok(())
    }

    /// Snapshot without memory under a timestamped name and return the
    /// artifact path `proxmox_snapshot:<name>`.
    pub async fn orchestration_save(&self, id: u32) -> Result<String> {
        let name = Utc::now().format("snap_%y%m%d_%H%M%S_%6f").to_string();
        let name = self.create(id, &name, false).await?;
        Ok(format!("{}:{}", SNAPSHOT_ARTIFACT_TYPE, name))
    }

    /// Restore from an artifact produced by [`SnapshotOps::orchestration_save`].
    pub async fn orchestration_restore(&self, id: u32, artifact: &str) -> Result<()> {
        let name = parse_artifact(artifact)?;
        self.restore(id, name).await
    }
}

fn parse_save_memory(value: &str) -> Result<bool> {
    match value {
        "Yes" => Ok(true),
        "No" => Ok(false),
        other => Err(PveError::InvalidCommandParam {
            name: "save_memory".to_string(),
            value: other.to_string(),
            expected: SAVE_MEMORY_VALUES.iter().map(|v| v.to_string()).collect(),
        }),
    }
}

fn parse_artifact(artifact: &str) -> Result<&str> {
    let (kind, name) = artifact.split_once(':').unwrap_or((artifact, ""));
    if kind != SNAPSHOT_ARTIFACT_TYPE {
        return Err(PveError::InvalidOrchestrationType {
            found: kind.to_string(),
            expected: SNAPSHOT_ARTIFACT_TYPE.to_string(),
        });
    }
    if name.is_empty() {
        return Err(PveError::InvalidParameters(format!(
            "artifact '{}' names no snapshot",
            artifact
        )));
    }
    Ok(name)
}

/// Snapshot names start with a letter and use `[A-Za-z0-9_-]`, at most 40 chars.
fn validate_name(name: &str) -> Result<()> {
    let valid = name.len() >= 2
        && name.len() <= 40
        && name.starts_with(|c: char| c.is_ascii_alphabetic())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(PveError::InvalidParameters(format!(
            "invalid snapshot name '{}'",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_save_memory_flag() {
        assert!(parse_save_memory("Yes").unwrap());
        assert!(!parse_save_memory("No").unwrap());

        let err = parse_save_memory("yes").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidCommandParam);
        assert!(err.to_string().contains("'yes'"));
    }

    #[test]
    fn test_artifact_prefix() {
        assert_eq!(
            parse_artifact("proxmox_snapshot:snap_240101_120000_000001").unwrap(),
            "snap_240101_120000_000001"
        );
        let err = parse_artifact("vcenter_snapshot:x").unwrap_err();
        assert_eq!(
            err,
            PveError::InvalidOrchestrationType {
                found: "vcenter_snapshot".into(),
                expected: SNAPSHOT_ARTIFACT_TYPE.into()
            }
        );
        assert!(parse_artifact("proxmox_snapshot:").is_err());
    }

    #[test]
    fn test_snapshot_names() {
        assert!(validate_name("before-upgrade_1").is_ok());
        assert!(validate_name("1st").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name(&Utc::now().format("snap_%y%m%d_%H%M%S_%6f").to_string()).is_ok());
    }
}
