//! Client surface of the registry as seen by a hosting process.
//!
//! `RegistryApi` is the seam the service host talks through; in-process
//! deployments use `LocalRegistryClient`, a transport would substitute a
//! proxy. `RegistryConnector` models "reach the (possibly restarted)
//! registry": bootstrap and recovery both poll it with bounded retries.

use async_trait::async_trait;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::registry::manager::ServiceRegistry;
use crate::registry::types::{HostControl, PublishOptions};
use crate::remote::RemoteHandle;
use crate::types::{CallerIdentity, Result, ServiceId};

/// Registry operations a hosting process invokes.
#[async_trait]
pub trait RegistryApi: Send + Sync {
    async fn add_service(
        &self,
        id: ServiceId,
        handle: RemoteHandle,
        opts: PublishOptions,
    ) -> Result<()>;

    async fn remove_service(&self, id: ServiceId) -> Result<()>;

    /// Plain visibility check; never triggers an on-demand start.
    async fn check_service(&self, id: ServiceId) -> Result<Option<RemoteHandle>>;

    async fn subscribe(&self, id: ServiceId, listener_name: &str) -> Result<()>;

    async fn unsubscribe(&self, id: ServiceId, listener_name: &str) -> Result<()>;

    async fn add_on_demand_route(&self, id: ServiceId, owner_name: &str) -> Result<()>;

    async fn attach_local_manager(
        &self,
        name: &str,
        handle: RemoteHandle,
        control: Arc<dyn HostControl>,
    ) -> Result<()>;

    async fn device_id(&self) -> Result<String>;
}

/// A reachable registry: its client surface plus the remote handle hosts
/// watch for death.
#[derive(Clone)]
pub struct RegistryLink {
    pub api: Arc<dyn RegistryApi>,
    pub handle: RemoteHandle,
}

impl std::fmt::Debug for RegistryLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryLink")
            .field("handle", &self.handle)
            .finish()
    }
}

/// Locates the current registry instance, if one is up.
#[async_trait]
pub trait RegistryConnector: Send + Sync {
    async fn connect(&self) -> Option<RegistryLink>;
}

/// In-process client wrapping a shared `ServiceRegistry` with a fixed caller
/// identity.
pub struct LocalRegistryClient {
    registry: Arc<ServiceRegistry>,
    caller: CallerIdentity,
}

impl LocalRegistryClient {
    pub fn new(registry: Arc<ServiceRegistry>, caller: CallerIdentity) -> Self {
        Self { registry, caller }
    }
}

impl std::fmt::Debug for LocalRegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRegistryClient")
            .field("caller", &self.caller)
            .finish()
    }
}

#[async_trait]
impl RegistryApi for LocalRegistryClient {
    async fn add_service(
        &self,
        id: ServiceId,
        handle: RemoteHandle,
        opts: PublishOptions,
    ) -> Result<()> {
        self.registry.add_service(id, handle, opts, &self.caller).await
    }

    async fn remove_service(&self, id: ServiceId) -> Result<()> {
        self.registry.remove_service(id, &self.caller).await
    }

    async fn check_service(&self, id: ServiceId) -> Result<Option<RemoteHandle>> {
        self.registry.check_service(id, &self.caller)
    }

    async fn subscribe(&self, id: ServiceId, listener_name: &str) -> Result<()> {
        self.registry.subscribe(id, listener_name).await
    }

    async fn unsubscribe(&self, id: ServiceId, listener_name: &str) -> Result<()> {
        self.registry.unsubscribe(id, listener_name)
    }

    async fn add_on_demand_route(&self, id: ServiceId, owner_name: &str) -> Result<()> {
        self.registry.add_on_demand_route(id, owner_name, &self.caller)
    }

    async fn attach_local_manager(
        &self,
        name: &str,
        handle: RemoteHandle,
        control: Arc<dyn HostControl>,
    ) -> Result<()> {
        self.registry
            .attach_local_manager(name, handle, control, &self.caller)
            .await
    }

    async fn device_id(&self) -> Result<String> {
        Ok(self.registry.device_id().to_string())
    }
}

/// In-process connector pointing at the current registry generation. Tests
/// and single-binary deployments swap the slot to simulate a registry
/// restart.
pub struct LocalRegistryConnector {
    slot: Mutex<Option<Arc<ServiceRegistry>>>,
    caller: CallerIdentity,
}

impl LocalRegistryConnector {
    pub fn new(caller: CallerIdentity) -> Self {
        Self {
            slot: Mutex::new(None),
            caller,
        }
    }

    /// Point the connector at a (new) registry instance.
    pub fn set_registry(&self, registry: Arc<ServiceRegistry>) {
        *self.slot.lock() = Some(registry);
    }

    /// Make the registry unreachable.
    pub fn clear(&self) {
        *self.slot.lock() = None;
    }
}

impl std::fmt::Debug for LocalRegistryConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRegistryConnector")
            .field("attached", &self.slot.lock().is_some())
            .finish()
    }
}

#[async_trait]
impl RegistryConnector for LocalRegistryConnector {
    async fn connect(&self) -> Option<RegistryLink> {
        let registry = self.slot.lock().clone()?;
        if !registry.handle().is_alive() {
            return None;
        }
        Some(RegistryLink {
            handle: registry.handle(),
            api: Arc::new(LocalRegistryClient::new(registry, self.caller.clone())),
        })
    }
}
