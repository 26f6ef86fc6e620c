//! Hosted service instances and their lifecycle state.
//!
//! State machine per hosted service:
//! Unloaded -> Loaded (code resolved) -> Instantiated (in the local map)
//! -> Running (start invoked) -> {Recycled (only if not Running) | Removed}

use async_trait::async_trait;
use std::sync::Arc;

use crate::remote::RemoteHandle;
use crate::types::ServiceId;

/// A hosted unit of platform functionality.
///
/// Implementations are constructed by the service loader's registration side
/// effect and owned exclusively by the hosting process's `ServiceHost`.
#[async_trait]
pub trait Service: Send + Sync {
    /// The service's registry id.
    fn id(&self) -> ServiceId;

    /// Invoked when the host starts the service (phase startup or on-demand).
    async fn on_start(&self);

    /// Invoked when the host stops the service.
    async fn on_stop(&self);

    /// Diagnostic dump.
    fn on_dump(&self) -> String {
        String::new()
    }

    /// Debug hook.
    fn on_debug(&self) {}

    /// Self-test hook.
    fn on_test(&self) {}

    /// A watched peer service became available.
    fn on_peer_added(&self, _id: ServiceId, _device_id: &str) {}

    /// A watched peer service went away.
    fn on_peer_removed(&self, _id: ServiceId, _device_id: &str) {}
}

/// Lifecycle state of an instantiated service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Present in the local map, start not yet invoked.
    Instantiated,
    /// Start invoked.
    Running,
    /// Stopped after running; eligible for recycling.
    Stopped,
}

/// Host-side bookkeeping for one instance.
pub(crate) struct HostedService {
    pub service: Arc<dyn Service>,
    /// The remote reference other processes receive from the registry.
    pub handle: RemoteHandle,
    pub state: ServiceState,
    /// Whether the instance's registration has been published to the
    /// registry (drives republish-on-recovery).
    pub published: bool,
}

impl std::fmt::Debug for HostedService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostedService")
            .field("id", &self.service.id())
            .field("state", &self.state)
            .field("published", &self.published)
            .finish()
    }
}
