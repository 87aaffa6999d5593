//! Entry point wiring transport, resolver and the operation groups.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::PveApi;
use crate::config::ResourceConfig;
use crate::deploy::{DeployOrchestrator, VariantTable};
use crate::error::Result;
use crate::instance::InstanceOps;
use crate::network::ConnectivityReconciler;
use crate::resolver::NodeResolver;
use crate::retry::EnginePolicies;
use crate::snapshot::SnapshotOps;
use crate::types::ClusterVersion;
use crate::transport::{HttpTransport, Transport};

/// A logged-in engine for one cluster.
///
/// Cloning is cheap; clones share the resolver cache and the deploy
/// critical section.
#[derive(Clone)]
pub struct PveEngine {
    instances: InstanceOps,
    deployer: DeployOrchestrator,
}

impl PveEngine {
    /// Log in to the cluster and build the placement cache.
    pub async fn connect(config: ResourceConfig, policies: EnginePolicies) -> Result<Self> {
        Self::connect_with_variants(config, policies, VariantTable::default()).await
    }

    pub async fn connect_with_variants(
        config: ResourceConfig,
        policies: EnginePolicies,
        variants: VariantTable,
    ) -> Result<Self> {
        let transport = HttpTransport::connect(&config).await?;
        info!(address = %config.address, user = %config.user, "Connected to cluster");
        Self::from_transport(Arc::new(transport), config, policies, variants).await
    }

    /// Build an engine over any transport (e.g. [`crate::mock::MockTransport`]).
    pub async fn from_transport(
        transport: Arc<dyn Transport>,
        config: ResourceConfig,
        policies: EnginePolicies,
        variants: VariantTable,
    ) -> Result<Self> {
        let api = PveApi::new(transport);
        let resolver = Arc::new(NodeResolver::new(api.clone()).await?);
        let config = Arc::new(config);

        let instances = InstanceOps::new(
            api,
            resolver,
            Arc::clone(&config),
            Arc::new(policies),
            CancellationToken::new(),
        );
        let deployer = DeployOrchestrator::new(instances.clone(), config, Arc::new(variants));

        Ok(Self { instances, deployer })
    }

    /// Same engine; every operation started through the returned handle
    /// stops waiting once `cancel` fires.
    pub fn with_cancellation(&self, cancel: CancellationToken) -> Self {
        Self {
            instances: self.instances.with_cancellation(cancel.clone()),
            deployer: self.deployer.with_cancellation(cancel),
        }
    }

    pub fn instances(&self) -> &InstanceOps {
        &self.instances
    }

    pub fn snapshots(&self) -> SnapshotOps {
        SnapshotOps::new(self.instances.clone())
    }

    pub fn deployer(&self) -> &DeployOrchestrator {
        &self.deployer
    }

    pub fn connectivity(&self) -> ConnectivityReconciler {
        ConnectivityReconciler::new(self.instances.clone())
    }

    /// Check the resource configuration and that the cluster answers.
    pub async fn discover(&self) -> Result<ClusterVersion> {
        self.instances.config().validate()?;
        let version = self.instances.api().version().await?;
        debug!(version = %version.version, release = %version.release, "Cluster version");
        Ok(version)
    }

    pub fn resolver(&self) -> &Arc<NodeResolver> {
        self.instances.resolver()
    }
}
