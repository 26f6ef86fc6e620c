//! Core types for the service registry and host runtime.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Validated service identifiers and caller identity
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for registry, host, and transport

mod config;
mod errors;
mod ids;

pub use config::{Config, HostConfig, IpcConfig, ObservabilityConfig, RegistryConfig, ServerConfig};
pub use errors::{Error, Result};
pub use ids::{CallerIdentity, ServiceId, UID_ROOT, UID_SYSTEM};
