//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use pve_engine::deploy::VariantTable;
use pve_engine::transport::Method;
use pve_engine::{EnginePolicies, MockTransport, PveEngine, ResourceConfig};
use serde_json::{json, Value};
use std::sync::Arc;

pub const NODE: &str = "pve1";

pub fn upid(kind: &str, id: u32) -> String {
    format!("UPID:{}:00001F2A:0003B9C4:65A0F1C2:{}:{}:root@pam:", NODE, kind, id)
}

pub fn task_route(upid: &str) -> String {
    format!("nodes/{}/tasks/{}/status", NODE, urlencoding::encode(upid))
}

pub fn vm_route(id: u32, suffix: &str) -> String {
    if suffix.is_empty() {
        format!("nodes/{}/qemu/{}", NODE, id)
    } else {
        format!("nodes/{}/qemu/{}/{}", NODE, id, suffix)
    }
}

/// Cluster listing entry for a VM on [`NODE`].
pub fn vm(id: u32, name: &str) -> Value {
    json!({"vmid": id, "node": NODE, "type": "qemu", "name": name})
}

pub fn template(id: u32, name: &str) -> Value {
    json!({"vmid": id, "node": NODE, "type": "qemu", "name": name, "template": 1})
}

pub fn task_ok() -> Value {
    json!({"status": "stopped", "exitstatus": "OK"})
}

pub fn config() -> ResourceConfig {
    ResourceConfig {
        address: "pve.lab".into(),
        user: "root@pam".into(),
        password: "secret".into(),
        default_bridge: Some("vmbr0".into()),
        ..Default::default()
    }
}

/// Mock with the given cluster listings queued in order.
pub fn mock_with_listings(listings: &[Value]) -> Arc<MockTransport> {
    let mock = Arc::new(MockTransport::new());
    for listing in listings {
        mock.on(Method::Get, "cluster/resources", listing.clone());
    }
    mock
}

pub async fn engine(mock: &Arc<MockTransport>) -> PveEngine {
    engine_with(mock, EnginePolicies::default()).await
}

pub async fn engine_with(mock: &Arc<MockTransport>, policies: EnginePolicies) -> PveEngine {
    PveEngine::from_transport(mock.clone(), config(), policies, VariantTable::default())
        .await
        .expect("engine over mock transport")
}
