//! # pve-common
//!
//! Shared utilities for the Proxmox VE provider crates.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use pve_common::{init_logging_with_format, LogFormat};
//!
//! init_logging_with_format("info", LogFormat::Pretty).unwrap();
//! tracing::info!(instance_id = 101, "Powering on");
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, init_logging_with_format, LogFormat};
