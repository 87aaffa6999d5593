//! Clone-based deployment of new instances.
//!
//! Every deploy variant funnels into one clone call. What differs per
//! variant (where the source comes from, full vs. linked copy, whether
//! cloud-init customisation applies) lives in a [`VariantTable`].

pub mod naming;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::api::CloneParams;
use crate::config::ResourceConfig;
use crate::error::{PveError, Result};
use crate::instance::InstanceOps;
use crate::retry::check_cancelled;
use crate::types::{InstanceKind, Placement, TaskHandle};

// =============================================================================
// VARIANTS AND POLICIES
// =============================================================================

/// Kinds of deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeployVariant {
    VmFromVm,
    VmFromTemplate,
    ContainerFromImage,
    ContainerFromContainer,
}

impl DeployVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployVariant::VmFromVm => "vm-from-vm",
            DeployVariant::VmFromTemplate => "vm-from-template",
            DeployVariant::ContainerFromImage => "container-from-image",
            DeployVariant::ContainerFromContainer => "container-from-container",
        }
    }
}

impl std::fmt::Display for DeployVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a deployment clones from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "kebab-case")]
pub enum DeploySource {
    /// Clone a regular VM, optionally from one of its snapshots
    VmFromVm {
        vm_id: u32,
        #[serde(default)]
        snapshot: Option<String>,
    },
    /// Clone a VM template
    VmFromTemplate {
        template_id: u32,
        #[serde(default)]
        full_clone: Option<bool>,
    },
    /// Clone a container image, given as an ID or a template name
    ContainerFromImage {
        image: String,
        #[serde(default)]
        full_clone: Option<bool>,
    },
    /// Clone an existing container
    ContainerFromContainer {
        container_id: u32,
        #[serde(default)]
        snapshot: Option<String>,
    },
}

impl DeploySource {
    pub fn variant(&self) -> DeployVariant {
        match self {
            DeploySource::VmFromVm { .. } => DeployVariant::VmFromVm,
            DeploySource::VmFromTemplate { .. } => DeployVariant::VmFromTemplate,
            DeploySource::ContainerFromImage { .. } => DeployVariant::ContainerFromImage,
            DeploySource::ContainerFromContainer { .. } => DeployVariant::ContainerFromContainer,
        }
    }

    fn requested_full_clone(&self) -> Option<bool> {
        match self {
            DeploySource::VmFromTemplate { full_clone, .. }
            | DeploySource::ContainerFromImage { full_clone, .. } => *full_clone,
            _ => None,
        }
    }

    fn snapshot(&self) -> Option<String> {
        match self {
            DeploySource::VmFromVm { snapshot, .. }
            | DeploySource::ContainerFromContainer { snapshot, .. } => snapshot.clone(),
            _ => None,
        }
    }
}

/// Full vs. linked copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClonePolicy {
    /// Always copy disks; the request cannot override
    AlwaysFull,
    /// Linked unless the request asks for a full copy
    DefaultLinked,
    /// Full unless the request asks for a linked copy
    DefaultFull,
}

impl ClonePolicy {
    pub fn is_full(&self, requested: Option<bool>) -> bool {
        match self {
            ClonePolicy::AlwaysFull => true,
            ClonePolicy::DefaultLinked => requested.unwrap_or(false),
            ClonePolicy::DefaultFull => requested.unwrap_or(true),
        }
    }
}

/// Post-clone customisation applied to a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Customization {
    None,
    /// Inject user/password through cloud-init
    CloudInit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantPolicy {
    pub kind: InstanceKind,
    pub clone: ClonePolicy,
    pub customization: Customization,
}

/// Per-variant policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VariantTable {
    pub vm_from_vm: VariantPolicy,
    pub vm_from_template: VariantPolicy,
    pub container_from_image: VariantPolicy,
    pub container_from_container: VariantPolicy,
}

impl Default for VariantTable {
    fn default() -> Self {
        Self {
            vm_from_vm: VariantPolicy {
                kind: InstanceKind::Qemu,
                clone: ClonePolicy::AlwaysFull,
                customization: Customization::CloudInit,
            },
            vm_from_template: VariantPolicy {
                kind: InstanceKind::Qemu,
                clone: ClonePolicy::DefaultLinked,
                customization: Customization::CloudInit,
            },
            container_from_image: VariantPolicy {
                kind: InstanceKind::Lxc,
                clone: ClonePolicy::DefaultLinked,
                customization: Customization::None,
            },
            container_from_container: VariantPolicy {
                kind: InstanceKind::Lxc,
                clone: ClonePolicy::AlwaysFull,
                customization: Customization::None,
            },
        }
    }
}

impl VariantTable {
    pub fn get(&self, variant: DeployVariant) -> &VariantPolicy {
        match variant {
            DeployVariant::VmFromVm => &self.vm_from_vm,
            DeployVariant::VmFromTemplate => &self.vm_from_template,
            DeployVariant::ContainerFromImage => &self.container_from_image,
            DeployVariant::ContainerFromContainer => &self.container_from_container,
        }
    }
}

// =============================================================================
// REQUESTS AND RESULTS
// =============================================================================

/// One deployment request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    pub app_name: String,
    /// Derive a unique name from `app_name` instead of using it verbatim
    #[serde(default)]
    pub autogenerated_name: bool,
    pub source: DeploySource,
    /// Storage for a full clone; falls back to the resource's shared storage
    #[serde(default)]
    pub target_storage: Option<String>,
    /// Node to place the clone on; the source's node when unset
    #[serde(default)]
    pub target_node: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

impl DeployRequest {
    pub fn new(app_name: impl Into<String>, source: DeploySource) -> Self {
        Self {
            app_name: app_name.into(),
            autogenerated_name: false,
            source,
            target_storage: None,
            target_node: None,
            user: None,
            password: None,
        }
    }
}

/// Progress of a single deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployState {
    NotStarted,
    Cloning,
    Customizing,
    Ready,
    /// Rolled back after a failure
    Deleted,
}

impl DeployState {
    pub fn can_transition_to(&self, next: DeployState) -> bool {
        use DeployState::*;
        matches!(
            (self, next),
            (NotStarted, Cloning)
                | (Cloning, Customizing)
                | (Customizing, Ready)
                | (Cloning, Deleted)
                | (Customizing, Deleted)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployResult {
    pub instance_id: u32,
    pub instance_name: String,
    pub node: String,
    pub kind: InstanceKind,
    pub state: DeployState,
}

struct Tracker {
    state: DeployState,
}

impl Tracker {
    fn advance(&mut self, next: DeployState) {
        if !self.state.can_transition_to(next) {
            warn!(from = ?self.state, to = ?next, "Unexpected deploy state transition");
        }
        info!(from = ?self.state, to = ?next, "Deploy state");
        self.state = next;
    }
}

// =============================================================================
// ORCHESTRATOR
// =============================================================================

/// Deploys instances by cloning.
///
/// Clones share one critical section around "allocate next ID + issue
/// clone", because the hypervisor's ID allocator hands the same ID to
/// concurrent callers. The lock is owned by the orchestrator and shared by
/// its clones.
#[derive(Clone)]
pub struct DeployOrchestrator {
    ops: InstanceOps,
    config: Arc<ResourceConfig>,
    variants: Arc<VariantTable>,
    clone_lock: Arc<Mutex<()>>,
}

impl DeployOrchestrator {
    pub fn new(ops: InstanceOps, config: Arc<ResourceConfig>, variants: Arc<VariantTable>) -> Self {
        Self {
            ops,
            config,
            variants,
            clone_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Same orchestrator (and clone lock) observing another cancellation token.
    pub fn with_cancellation(&self, cancel: CancellationToken) -> Self {
        Self {
            ops: self.ops.with_cancellation(cancel),
            config: Arc::clone(&self.config),
            variants: Arc::clone(&self.variants),
            clone_lock: Arc::clone(&self.clone_lock),
        }
    }

    /// Clone, customise and report the new instance.
    ///
    /// Clone failures are retried as a whole; once retries are exhausted (or
    /// on any other failure while cloning) the new instance is deleted.
    /// Customisation failures leave the instance in place.
    #[instrument(skip(self, request), fields(app = %request.app_name, variant = %request.source.variant()))]
    pub async fn deploy(&self, request: &DeployRequest) -> Result<DeployResult> {
        let cancel = self.ops.cancel_token().clone();
        let policy = self.variants.get(request.source.variant()).clone();
        let name = naming::instance_name(&request.app_name, request.autogenerated_name)?;
        info!(instance_name = %name, "Deploying instance");

        check_cancelled(&cancel, "resolve deploy source")?;
        let (source_id, source) = self.resolve_source(&request.source, policy.kind).await?;

        let full = policy.clone.is_full(request.source.requested_full_clone());
        let storage = request
            .target_storage
            .clone()
            .or_else(|| self.config.shared_storage.clone())
            // Linked clones always live on the source's storage.
            .filter(|_| full);

        let template = CloneParams {
            new_id: 0,
            name: name.clone(),
            snapshot: request.source.snapshot(),
            full,
            storage,
            target_node: request.target_node.clone(),
        };

        let mut tracker = Tracker { state: DeployState::NotStarted };
        tracker.advance(DeployState::Cloning);

        let mut captured: Option<u32> = None;
        let instance_id = match self
            .clone_with_retries(source_id, &source, &template, &mut captured)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.rollback(captured, &e).await;
                tracker.advance(DeployState::Deleted);
                return Err(e);
            }
        };

        let node = match self.ops.resolver().refresh().await.and_then(|_| self.ops.resolver().resolve(instance_id)) {
            Ok(node) => node,
            Err(e) => {
                self.rollback(Some(instance_id), &e).await;
                tracker.advance(DeployState::Deleted);
                return Err(e);
            }
        };

        tracker.advance(DeployState::Customizing);
        if policy.customization == Customization::CloudInit {
            if let Err(e) = self
                .ops
                .set_user_data(instance_id, request.user.as_deref(), request.password.as_deref())
                .await
            {
                error!(instance_id, error = %e, "Customization failed");
                return Err(PveError::CustomizationFailed {
                    instance_id,
                    reason: e.to_string(),
                });
            }
        }

        tracker.advance(DeployState::Ready);
        info!(instance_id, node = %node, "Instance deployed");

        Ok(DeployResult {
            instance_id,
            instance_name: name,
            node,
            kind: policy.kind,
            state: tracker.state,
        })
    }

    /// Delete a deployed instance. A no-op when it is already gone.
    pub async fn rollback_instance(&self, instance_id: u32) -> Result<()> {
        self.ops.delete(instance_id).await
    }

    async fn resolve_source(&self, source: &DeploySource, kind: InstanceKind) -> Result<(u32, Placement)> {
        let resolver = self.ops.resolver();
        let (id, placement) = match source {
            DeploySource::VmFromVm { vm_id: id, .. }
            | DeploySource::VmFromTemplate { template_id: id, .. }
            | DeploySource::ContainerFromContainer { container_id: id, .. } => {
                (*id, resolver.locate_fresh(*id).await?)
            }
            DeploySource::ContainerFromImage { image, .. } => match image.trim().parse::<u32>() {
                Ok(id) => (id, resolver.locate_fresh(id).await?),
                Err(_) => resolver.find_by_name(image.trim(), InstanceKind::Lxc)?,
            },
        };

        if placement.kind != kind {
            return Err(PveError::InvalidParameters(format!(
                "source instance {} is a {}, expected a {}",
                id, placement.kind, kind
            )));
        }
        Ok((id, placement))
    }

    async fn clone_with_retries(
        &self,
        source_id: u32,
        source: &Placement,
        template: &CloneParams,
        captured: &mut Option<u32>,
    ) -> Result<u32> {
        let attempts = self.ops.policies().clone_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            check_cancelled(self.ops.cancel_token(), "clone")?;

            let (new_id, task) = self.issue_clone(source_id, source, template).await?;
            *captured = Some(new_id);

            let message = format!(
                "Failed to clone instance {} to {} ({})",
                source_id, new_id, template.name
            );
            match self
                .ops
                .waiter()
                .wait(&task, &self.ops.policies().deploy_task, &message)
                .await
            {
                Ok(()) => return Ok(new_id),
                Err(e @ PveError::OperationFailed(_)) if attempt < attempts => {
                    warn!(attempt, attempts, instance_id = new_id, error = %e, "Clone failed, retrying");
                    self.ops.delete(new_id).await?;
                    *captured = None;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Allocate an ID and issue the clone inside the critical section.
    async fn issue_clone(&self, source_id: u32, source: &Placement, template: &CloneParams) -> Result<(u32, TaskHandle)> {
        let _guard = self.clone_lock.lock().await;

        let api = self.ops.api();
        let new_id = api.next_id().await?;
        let params = CloneParams {
            new_id,
            ..template.clone()
        };
        let node = source.node.as_str();
        let kind = source.kind;
        let params = &params;

        let task = self
            .ops
            .locked("clone", move || api.clone_instance(node, kind, source_id, params))
            .await?;

        info!(
            source_id,
            instance_id = new_id,
            full = params.full,
            upid = %task.upid,
            "Clone issued"
        );
        Ok((new_id, task))
    }

    /// Best-effort delete of a partially created instance. Runs even when
    /// the deploy itself was cancelled.
    async fn rollback(&self, captured: Option<u32>, cause: &PveError) {
        let Some(instance_id) = captured else {
            return;
        };
        warn!(instance_id, error = %cause, "Rolling back partially created instance");

        let detached = self.ops.with_cancellation(CancellationToken::new());
        if let Err(e) = detached.delete(instance_id).await {
            error!(instance_id, error = %e, "Rollback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_policy() {
        assert!(ClonePolicy::AlwaysFull.is_full(Some(false)));
        assert!(!ClonePolicy::DefaultLinked.is_full(None));
        assert!(ClonePolicy::DefaultLinked.is_full(Some(true)));
        assert!(!ClonePolicy::DefaultFull.is_full(Some(false)));
    }

    #[test]
    fn test_default_variant_table() {
        let table = VariantTable::default();
        assert_eq!(table.get(DeployVariant::VmFromVm).clone, ClonePolicy::AlwaysFull);
        assert_eq!(table.get(DeployVariant::VmFromTemplate).clone, ClonePolicy::DefaultLinked);
        assert_eq!(table.get(DeployVariant::ContainerFromImage).kind, InstanceKind::Lxc);
        assert_eq!(
            table.get(DeployVariant::ContainerFromContainer).customization,
            Customization::None
        );
    }

    #[test]
    fn test_state_transitions() {
        use DeployState::*;
        assert!(NotStarted.can_transition_to(Cloning));
        assert!(Cloning.can_transition_to(Deleted));
        assert!(Customizing.can_transition_to(Deleted));
        assert!(!Ready.can_transition_to(Deleted));
        assert!(!NotStarted.can_transition_to(Ready));
    }

    #[test]
    fn test_request_deserializes_tagged_source() {
        let request: DeployRequest = serde_json::from_value(serde_json::json!({
            "app_name": "web-01",
            "source": {"variant": "vm-from-template", "template_id": 101}
        }))
        .unwrap();
        assert_eq!(request.source.variant(), DeployVariant::VmFromTemplate);
        assert_eq!(request.source.requested_full_clone(), None);
        assert!(!request.autogenerated_name);
    }
}
