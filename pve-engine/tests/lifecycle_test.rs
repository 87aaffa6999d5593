//! Power, status and teardown against a scripted cluster.

mod common;

use common::*;
use pve_engine::retry::RetryPolicy;
use pve_engine::task::TaskWaiter;
use pve_engine::transport::Method;
use pve_engine::{api::PveApi, EnginePolicies, PowerState, PveError, TaskHandle};
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Deleting an instance twice succeeds; the second call issues no delete.
#[tokio::test(start_paused = true)]
async fn test_delete_is_idempotent() {
    let mock = mock_with_listings(&[json!([vm(120, "old")]), json!([])]);
    let delete_upid = upid("qmdestroy", 120);
    mock.on(Method::Get, &vm_route(120, "status/current"), json!({"status": "stopped"}))
        .on(Method::Delete, &vm_route(120, ""), json!(delete_upid))
        .on(Method::Get, &task_route(&delete_upid), task_ok());

    let engine = engine(&mock).await;
    engine.instances().delete(120).await.unwrap();
    engine.instances().delete(120).await.unwrap();

    let deletes = mock.calls_to(Method::Delete, &vm_route(120, ""));
    assert_eq!(deletes.len(), 1);
    assert_eq!(
        deletes[0].path,
        "nodes/pve1/qemu/120?purge=1&destroy-unreferenced-disks=1"
    );
}

/// A running instance is hard-stopped before it is deleted.
#[tokio::test(start_paused = true)]
async fn test_delete_stops_running_instance_first() {
    let mock = mock_with_listings(&[json!([vm(121, "busy")]), json!([])]);
    let stop_upid = upid("qmstop", 121);
    let delete_upid = upid("qmdestroy", 121);
    mock.on(Method::Get, &vm_route(121, "status/current"), json!({"status": "running"}))
        .on(Method::Get, &vm_route(121, "status/current"), json!({"status": "stopped"}))
        .on(Method::Post, &vm_route(121, "status/stop"), json!(stop_upid))
        .on(Method::Get, &task_route(&stop_upid), task_ok())
        .on(Method::Delete, &vm_route(121, ""), json!(delete_upid))
        .on(Method::Get, &task_route(&delete_upid), task_ok());

    engine(&mock).await.instances().delete(121).await.unwrap();

    assert_eq!(mock.call_count(Method::Post, &vm_route(121, "status/shutdown")), 0);
    assert_eq!(mock.call_count(Method::Post, &vm_route(121, "status/stop")), 1);
    assert_eq!(mock.call_count(Method::Delete, &vm_route(121, "")), 1);
}

/// A soft stop that never converges fails with a timeout naming the instance.
#[tokio::test(start_paused = true)]
async fn test_soft_stop_times_out() {
    let mock = mock_with_listings(&[json!([vm(110, "stubborn")])]);
    let shutdown_upid = upid("qmshutdown", 110);
    mock.on(Method::Get, &vm_route(110, "status/current"), json!({"status": "running"}))
        .on(Method::Post, &vm_route(110, "status/shutdown"), json!(shutdown_upid))
        .on(Method::Get, &task_route(&shutdown_upid), task_ok());

    let err = engine(&mock).await.instances().stop(110, true).await.unwrap_err();

    match &err {
        PveError::Timeout { instance_id, attempts, .. } => {
            assert_eq!(*instance_id, 110);
            assert_eq!(*attempts, 5);
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(err.to_string().contains("110"));
    assert_eq!(mock.call_count(Method::Post, &vm_route(110, "status/shutdown")), 5);
}

/// Unknown hypervisor states map to `Unknown`.
#[tokio::test]
async fn test_unrecognized_status_is_unknown() {
    let mock = mock_with_listings(&[json!([vm(130, "odd")])]);
    mock.on(Method::Get, &vm_route(130, "status/current"), json!({"status": "freezing"}));

    let state = engine(&mock).await.instances().status(130).await.unwrap();
    assert_eq!(state, PowerState::Unknown);
}

/// Start is skipped for a running instance and retried while the instance
/// is locked.
#[tokio::test(start_paused = true)]
async fn test_start_waits_out_lock() {
    let mock = mock_with_listings(&[json!([vm(140, "web")])]);
    let start_upid = upid("qmstart", 140);
    mock.on(Method::Get, &vm_route(140, "status/current"), json!({"status": "stopped"}))
        .on_status(Method::Post, &vm_route(140, "status/start"), 500, "VM 140 is locked (clone)")
        .on(Method::Post, &vm_route(140, "status/start"), json!(start_upid));

    let engine = engine(&mock).await;
    let started = Instant::now();
    engine.instances().start(140).await.unwrap();

    assert_eq!(mock.call_count(Method::Post, &vm_route(140, "status/start")), 2);
    assert_eq!(started.elapsed(), Duration::from_secs(5));

    mock.replace(Method::Get, &vm_route(140, "status/current"), json!({"status": "running"}));
    engine.instances().start(140).await.unwrap();
    assert_eq!(mock.call_count(Method::Post, &vm_route(140, "status/start")), 2);
}

/// A task that never leaves `running` is polled and slept on exactly
/// `attempts` times before failing.
#[tokio::test(start_paused = true)]
async fn test_waiter_budget_is_attempts_times_interval() {
    for (attempts, interval) in [(1u32, 1u64), (4, 3), (6, 5)] {
        let mock = mock_with_listings(&[json!([])]);
        let task = TaskHandle::new(NODE, upid("qmclone", 200));
        mock.on(Method::Get, &task_route(&task.upid), json!({"status": "running"}));

        let waiter = TaskWaiter::new(PveApi::new(mock.clone()), CancellationToken::new());
        let started = Instant::now();
        let err = waiter
            .wait(&task, &RetryPolicy::new(attempts, interval), "clone 200")
            .await
            .unwrap_err();

        assert!(matches!(err, PveError::OperationFailed(_)));
        assert_eq!(started.elapsed(), Duration::from_secs(u64::from(attempts) * interval));
        assert_eq!(mock.call_count(Method::Get, &task_route(&task.upid)), attempts as usize);
    }
}

/// Cancelling before a wait stops the operation without issuing requests.
#[tokio::test(start_paused = true)]
async fn test_cancelled_stop_issues_nothing() {
    let mock = mock_with_listings(&[json!([vm(150, "db")])]);
    mock.on(Method::Get, &vm_route(150, "status/current"), json!({"status": "running"}));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let engine = engine_with(&mock, EnginePolicies::default()).await.with_cancellation(cancel);

    let err = engine.instances().stop(150, false).await.unwrap_err();
    assert!(matches!(err, PveError::Cancelled(_)));
    assert_eq!(mock.call_count(Method::Post, &vm_route(150, "status/stop")), 0);
}

/// Details merge configuration, guest report and reserved networks.
#[tokio::test]
async fn test_details_flag_reserved_networks() {
    let mock = mock_with_listings(&[json!([vm(160, "app")])]);
    mock.on(
        Method::Get,
        &vm_route(160, "status/current"),
        json!({"status": "running", "cpus": 2, "maxmem": 4294967296u64, "maxdisk": 34359738368u64}),
    )
    .on(
        Method::Get,
        &vm_route(160, "config"),
        json!({
            "net0": "virtio=BC:24:11:2A:7F:01,bridge=vmbr0,tag=10",
            "net1": "virtio=BC:24:11:2A:7F:02,bridge=vmbr0,tag=99"
        }),
    )
    .on(
        Method::Get,
        &vm_route(160, "agent/get-osinfo"),
        json!({"result": {"name": "Ubuntu", "version": "22.04"}}),
    )
    .on(
        Method::Get,
        &vm_route(160, "agent/network-get-interfaces"),
        json!({"result": [{
            "name": "eth0",
            "hardware-address": "bc:24:11:2a:7f:01",
            "ip-addresses": [{"ip-address-type": "ipv4", "ip-address": "10.0.10.5"}]
        }]}),
    );

    let mut resource = config();
    resource.reserved_networks = vec!["99".into()];
    let engine = pve_engine::PveEngine::from_transport(
        mock.clone(),
        resource,
        EnginePolicies::default(),
        Default::default(),
    )
    .await
    .unwrap();

    let details = engine.instances().details(160).await.unwrap();
    assert_eq!(details.info.cpus, 2);
    assert_eq!(details.power_state, PowerState::Running);
    assert_eq!(details.nics.len(), 2);
    assert!(!details.nics[0].is_predefined);
    assert!(details.nics[1].is_predefined);
    assert_eq!(details.primary_ip.as_deref(), Some("10.0.10.5"));
}

/// A hibernated VM reports `Suspended` at once and can be started; a
/// running VM under a long-lived lock still reports its power state.
#[tokio::test(start_paused = true)]
async fn test_status_ignores_held_locks() {
    let mock = mock_with_listings(&[json!([vm(180, "sleeper"), vm(181, "archived")])]);
    let start_upid = upid("qmstart", 180);
    mock.on(
        Method::Get,
        &vm_route(180, "status/current"),
        json!({"status": "stopped", "lock": "suspended"}),
    )
    .on(Method::Post, &vm_route(180, "status/start"), json!(start_upid))
    .on(
        Method::Get,
        &vm_route(181, "status/current"),
        json!({"status": "running", "qmpstatus": "running", "lock": "backup"}),
    );

    let engine = engine(&mock).await;
    let started = Instant::now();

    assert_eq!(engine.instances().status(180).await.unwrap(), PowerState::Suspended);
    assert_eq!(engine.instances().status(181).await.unwrap(), PowerState::Running);
    engine.instances().start(180).await.unwrap();

    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(mock.call_count(Method::Get, &vm_route(180, "status/current")), 2);
    assert_eq!(mock.call_count(Method::Post, &vm_route(180, "status/start")), 1);
}

/// Without a guest agent, NICs come from configuration alone and the guest
/// OS is empty.
#[tokio::test]
async fn test_guest_agent_down_degrades_gracefully() {
    let mock = mock_with_listings(&[json!([vm(183, "fresh")])]);
    mock.on(
        Method::Get,
        &vm_route(183, "status/current"),
        json!({"status": "running", "cpus": 1, "maxmem": 1073741824u64, "maxdisk": 0}),
    )
    .on(
        Method::Get,
        &vm_route(183, "config"),
        json!({"net0": "virtio=BC:24:11:00:01:83,bridge=vmbr0,tag=30"}),
    )
    .on_status(
        Method::Get,
        &vm_route(183, "agent/network-get-interfaces"),
        500,
        "QEMU guest agent is not running",
    )
    .on_status(
        Method::Get,
        &vm_route(183, "agent/get-osinfo"),
        500,
        "QEMU guest agent is not running",
    );

    let engine = engine(&mock).await;

    let nics = engine.instances().interfaces(183).await.unwrap();
    let nic = &nics["BC:24:11:00:01:83"];
    assert_eq!(nic.slot, "net0");
    assert_eq!(nic.vlan_tag, Some(30));
    assert_eq!(nic.ipv4, None);
    assert_eq!(nic.guest_name, None);

    let info = engine.instances().info(183).await.unwrap();
    assert_eq!(info.guest_os, "");
    assert_eq!(info.cpus, 1);
}

/// A failed placement refresh after the delete task does not fail the delete.
#[tokio::test(start_paused = true)]
async fn test_delete_survives_failed_refresh() {
    let mock = mock_with_listings(&[json!([vm(184, "gone")])]);
    let delete_upid = upid("qmdestroy", 184);
    mock.on_status(Method::Get, "cluster/resources", 500, "cluster not ready")
        .on(Method::Get, &vm_route(184, "status/current"), json!({"status": "stopped"}))
        .on(Method::Delete, &vm_route(184, ""), json!(delete_upid))
        .on(Method::Get, &task_route(&delete_upid), task_ok());

    engine(&mock).await.instances().delete(184).await.unwrap();

    assert_eq!(mock.call_count(Method::Delete, &vm_route(184, "")), 1);
    assert_eq!(mock.call_count(Method::Get, "cluster/resources"), 2);
}

/// Discovery validates the resource and reports the cluster release.
#[tokio::test]
async fn test_discover_reports_version() {
    let mock = mock_with_listings(&[json!([])]);
    mock.on(
        Method::Get,
        "version",
        json!({"version": "8.2.4", "release": "8.2", "repoid": "faa83925c9641325"}),
    );

    let version = engine(&mock).await.discover().await.unwrap();
    assert_eq!(version.version, "8.2.4");

    let mut resource = config();
    resource.password = String::new();
    let engine = pve_engine::PveEngine::from_transport(
        mock.clone(),
        resource,
        EnginePolicies::default(),
        Default::default(),
    )
    .await
    .unwrap();

    let err = engine.discover().await.unwrap_err();
    assert!(matches!(err, PveError::InvalidConfig(_)));
    assert_eq!(mock.call_count(Method::Get, "version"), 1);
}
