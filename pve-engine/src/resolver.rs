//! Instance → node placement cache.
//!
//! Built from one cluster-wide listing. Reads share an immutable snapshot;
//! `refresh()` swaps in a new snapshot wholesale, so readers never observe a
//! partially rebuilt map.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::api::PveApi;
use crate::error::{PveError, Result};
use crate::types::{InstanceKind, Placement};

struct Snapshot {
    generation: u64,
    placements: HashMap<u32, Placement>,
}

/// Cached view of where each instance lives.
pub struct NodeResolver {
    api: PveApi,
    snapshot: RwLock<Arc<Snapshot>>,
    refresh_lock: Mutex<()>,
}

impl NodeResolver {
    /// Build the resolver, listing the cluster once.
    pub async fn new(api: PveApi) -> Result<Self> {
        let placements = Self::fetch(&api).await?;
        Ok(Self {
            api,
            snapshot: RwLock::new(Arc::new(Snapshot {
                generation: 1,
                placements,
            })),
            refresh_lock: Mutex::new(()),
        })
    }

    async fn fetch(api: &PveApi) -> Result<HashMap<u32, Placement>> {
        let entries = api.cluster_instances().await?;
        let mut placements = HashMap::with_capacity(entries.len());
        for entry in entries {
            if let Some(kind) = InstanceKind::from_resource_type(&entry.resource_type) {
                placements.insert(
                    entry.vmid,
                    Placement {
                        node: entry.node,
                        kind,
                        name: entry.name,
                        template: entry.template.unwrap_or(0) != 0,
                    },
                );
            }
        }
        Ok(placements)
    }

    fn current(&self) -> Result<Arc<Snapshot>> {
        self.snapshot
            .read()
            .map(|s| Arc::clone(&*s))
            .map_err(|_| PveError::UnexpectedResponse("Lock poisoned".to_string()))
    }

    /// Rebuild the cache from a fresh listing.
    ///
    /// Concurrent callers are serialised; each one still performs its own
    /// listing so that it observes state at least as new as its call.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        let placements = Self::fetch(&self.api).await?;
        let generation = self.current()?.generation + 1;
        let count = placements.len();

        *self
            .snapshot
            .write()
            .map_err(|_| PveError::UnexpectedResponse("Lock poisoned".to_string()))? =
            Arc::new(Snapshot { generation, placements });

        info!(generation, instances = count, "Node placement cache rebuilt");
        Ok(())
    }

    /// Number of rebuilds so far, starting at 1.
    pub fn generation(&self) -> u64 {
        self.current().map(|s| s.generation).unwrap_or(0)
    }

    /// Full placement record of an instance.
    pub fn locate(&self, instance_id: u32) -> Result<Placement> {
        let snapshot = self.current()?;
        match snapshot.placements.get(&instance_id) {
            Some(placement) => Ok(placement.clone()),
            None => {
                debug!(instance_id, "Instance not in placement cache");
                Err(PveError::InstanceNotFound(instance_id))
            }
        }
    }

    /// Node hosting an instance.
    pub fn resolve(&self, instance_id: u32) -> Result<String> {
        self.locate(instance_id).map(|p| p.node)
    }

    /// Look an instance up, rebuilding the cache once on a miss.
    pub async fn locate_fresh(&self, instance_id: u32) -> Result<Placement> {
        match self.locate(instance_id) {
            Err(PveError::InstanceNotFound(_)) => {
                self.refresh().await?;
                self.locate(instance_id)
            }
            other => other,
        }
    }

    /// Find a template (or any instance) by display name.
    ///
    /// Templates win over regular instances with the same name; among equals
    /// the lowest ID wins.
    pub fn find_by_name(&self, name: &str, kind: InstanceKind) -> Result<(u32, Placement)> {
        let snapshot = self.current()?;
        snapshot
            .placements
            .iter()
            .filter(|(_, p)| p.kind == kind && p.name.as_deref() == Some(name))
            .min_by_key(|(id, p)| (!p.template, **id))
            .map(|(id, p)| (*id, p.clone()))
            .ok_or_else(|| {
                PveError::InvalidParameters(format!("no {} named '{}' in the cluster", kind, name))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use crate::transport::Method;
    use serde_json::json;

    fn listing() -> serde_json::Value {
        json!([
            {"vmid": 100, "node": "pve1", "type": "qemu", "name": "ubuntu", "template": 1},
            {"vmid": 105, "node": "pve2", "type": "qemu", "name": "ubuntu"},
            {"vmid": 200, "node": "pve1", "type": "lxc", "name": "debian-12"}
        ])
    }

    async fn resolver(mock: &Arc<MockTransport>) -> NodeResolver {
        NodeResolver::new(PveApi::new(mock.clone())).await.unwrap()
    }

    #[tokio::test]
    async fn test_resolve_and_miss() {
        let mock = Arc::new(MockTransport::new());
        mock.on(Method::Get, "cluster/resources", listing());
        let resolver = resolver(&mock).await;

        assert_eq!(resolver.resolve(105).unwrap(), "pve2");
        assert_eq!(resolver.locate(200).unwrap().kind, InstanceKind::Lxc);
        assert_eq!(resolver.resolve(999).unwrap_err(), PveError::InstanceNotFound(999));
    }

    #[tokio::test]
    async fn test_refresh_replaces_snapshot() {
        let mock = Arc::new(MockTransport::new());
        mock.on(Method::Get, "cluster/resources", listing());
        mock.on(
            Method::Get,
            "cluster/resources",
            json!([{"vmid": 105, "node": "pve3", "type": "qemu"}]),
        );
        let resolver = resolver(&mock).await;
        assert_eq!(resolver.generation(), 1);

        resolver.refresh().await.unwrap();
        assert_eq!(resolver.generation(), 2);
        assert_eq!(resolver.resolve(105).unwrap(), "pve3");
        assert!(resolver.resolve(100).is_err());
    }

    #[tokio::test]
    async fn test_find_by_name_prefers_templates() {
        let mock = Arc::new(MockTransport::new());
        mock.on(Method::Get, "cluster/resources", listing());
        let resolver = resolver(&mock).await;

        let (id, placement) = resolver.find_by_name("ubuntu", InstanceKind::Qemu).unwrap();
        assert_eq!(id, 100);
        assert!(placement.template);
        assert!(resolver.find_by_name("ubuntu", InstanceKind::Lxc).is_err());
    }
}
