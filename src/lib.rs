//! # ServiceHub Core - Service Registry & Host Runtime
//!
//! Rust implementation of the platform service-discovery core providing:
//! - System-wide service registry (id -> remote handle + metadata)
//! - Permission-checked lookups and on-demand start delegation
//! - Per-process service host with phase-ordered, dependency-bounded startup
//! - Lazy code loading and on-demand service recycling
//! - Death-notification driven cleanup and registry-restart recovery
//! - TCP+msgpack IPC surface for the control interface
//!
//! ## Architecture
//!
//! ```text
//!   callers ──lookup/connect───▶ ┌──────────────────┐
//!                                │  ServiceRegistry │◀── death watch
//!   hosts ──add/subscribe──────▶ │  records/routes  │
//!                                └────────┬─────────┘
//!                        delegated starts │ add/remove events
//!                                ┌────────▼─────────┐
//!                                │   ServiceHost    │── phase/on-demand pools
//!                                │  local instances │── service loader
//!                                └──────────────────┘
//! ```
//!
//! The registry never owns service instances; it holds reference-counted
//! remote handles. Each hosting process owns its instances exclusively.

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod host;
pub mod ipc;
pub mod liveness;
pub mod loader;
pub mod profile;
pub mod registry;
pub mod remote;
pub mod types;

// Internal utilities
pub mod observability;

pub use types::{CallerIdentity, Config, Error, IpcConfig, Result, ServiceId};
