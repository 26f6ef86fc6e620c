//! Registry data types and the control seams toward hosting processes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::liveness::WatchId;
use crate::remote::RemoteHandle;
use crate::types::ServiceId;

/// Canonical name prefix of a per-process service host. A host must register
/// under exactly this prefix followed by its own pid.
pub const LOCAL_MANAGER_PREFIX: &str = "localservicehost";

/// Metadata supplied when publishing a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublishOptions {
    /// Publish the handle under a distributed-proxy name as well.
    pub distributed: bool,
    /// Capability descriptor (JSON text, may be empty).
    pub capability: String,
    /// Permission a non-privileged caller must hold to receive the handle.
    pub permission: String,
}

/// One registered service. Owned by the registry; overwritten, never merged,
/// on re-registration.
#[derive(Debug)]
pub(crate) struct ServiceRecord {
    pub handle: RemoteHandle,
    pub distributed: bool,
    pub capability: String,
    pub permission: String,
    pub registered_at: DateTime<Utc>,
    pub watch: WatchId,
}

/// Filter mode for the core-service list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreListMode {
    All,
    RegisteredOnly,
    UnregisteredOnly,
}

/// A registered per-process service host, reachable for delegated starts and
/// listener event relay.
#[derive(Clone)]
pub struct HostEndpoint {
    pub handle: RemoteHandle,
    pub control: Arc<dyn HostControl>,
    pub(crate) watch: WatchId,
}

impl std::fmt::Debug for HostEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostEndpoint")
            .field("handle", &self.handle)
            .finish()
    }
}

/// Control interface the registry invokes on a hosting process.
#[async_trait]
pub trait HostControl: Send + Sync {
    /// Schedule an on-demand start; must not block on phase sequencing.
    async fn start_service_async(&self, id: ServiceId);

    /// Stop a running service. Returns whether the stop was carried out.
    async fn stop_service(&self, id: ServiceId) -> bool;

    /// Recycle a stopped on-demand service. Returns whether resources were
    /// released.
    async fn recycle_service(&self, id: ServiceId) -> bool;

    /// A subscribed service id became available.
    async fn on_service_added(&self, id: ServiceId, device_id: &str);

    /// A subscribed service id went away.
    async fn on_service_removed(&self, id: ServiceId, device_id: &str);
}

/// Callback stored by `connect`; at most one per service id.
#[async_trait]
pub trait ConnectionCallback: Send + Sync {
    async fn on_connected(&self, id: ServiceId, handle: RemoteHandle);
    async fn on_disconnected(&self, id: ServiceId);
}
