//! # pve-engine
//!
//! Instance lifecycle orchestration for Proxmox VE clusters.
//!
//! The engine turns the hypervisor's asynchronous, lock-prone HTTP API into
//! sequential operations: each call issues a request, polls the resulting
//! task to a terminal state and retries or rolls back on failure.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        PveEngine                         │
//! │  InstanceOps · SnapshotOps · DeployOrchestrator ·        │
//! │  ConnectivityReconciler                                  │
//! └───────────────┬──────────────────────────┬───────────────┘
//!                 ▼                          ▼
//!        ┌─────────────────┐        ┌─────────────────┐
//!        │  NodeResolver   │        │   TaskWaiter    │
//!        └────────┬────────┘        └────────┬────────┘
//!                 └────────────┬─────────────┘
//!                              ▼
//!                 ┌─────────────────────────┐
//!                 │ PveApi ─► dyn Transport │
//!                 │ (HttpTransport | Mock)  │
//!                 └─────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pve_engine::{EnginePolicies, PveEngine, ResourceConfig};
//!
//! let engine = PveEngine::connect(config, EnginePolicies::default()).await?;
//! engine.instances().start(101).await?;
//! let state = engine.instances().status(101).await?;
//! ```

pub mod api;
pub mod config;
pub mod config_parser;
pub mod deploy;
pub mod engine;
pub mod error;
pub mod instance;
pub mod mock;
pub mod network;
pub mod resolver;
pub mod retry;
pub mod snapshot;
pub mod task;
pub mod transport;
pub mod types;

pub use config::{ResourceConfig, ShutdownMethod};
pub use deploy::{
    DeployOrchestrator, DeployRequest, DeployResult, DeploySource, DeployState, DeployVariant,
    VariantTable,
};
pub use engine::PveEngine;
pub use error::{ErrorKind, PveError, Result};
pub use instance::InstanceOps;
pub use mock::MockTransport;
pub use network::{ConnectivityAction, ConnectivityReconciler, ConnectivityResult, NetworkSettings};
pub use resolver::NodeResolver;
pub use retry::{EnginePolicies, RetryPolicy};
pub use snapshot::SnapshotOps;
pub use task::TaskWaiter;
pub use transport::{HttpTransport, Transport};
pub use types::*;
