//! System-wide service registry.
//!
//! The authoritative map from service id to remote handle plus metadata.
//! Arbitrates permissions, delegates on-demand starts to the owning host,
//! manages listener subscriptions and connection callbacks, tracks system
//! capabilities and core-service readiness, and observes death of both
//! service handles and host endpoints.
//!
//! Lock discipline: the record map and the listener map sit behind
//! independent reader/writer locks, acquired one at a time. Callbacks and
//! cross-process notifications are issued only after every guard is
//! released, so a notification handler that re-enters the registry can
//! never deadlock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock, Weak};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};

use crate::liveness::{DeathWatch, WatchId};
use crate::profile;
use crate::registry::capability::CapabilityMap;
use crate::registry::types::{
    ConnectionCallback, CoreListMode, HostControl, HostEndpoint, PublishOptions, ServiceRecord,
    LOCAL_MANAGER_PREFIX,
};
use crate::remote::RemoteHandle;
use crate::types::{CallerIdentity, Error, RegistryConfig, Result, ServiceId};

/// Handle clones that exist while a published service sits idle: the
/// registry's record and the hosting process's instance. Anything above
/// this means an outside caller still holds the service.
const RESIDENT_HANDLE_HOLDERS: usize = 2;

/// The system-wide service registry. Constructed once per system; shared via
/// `Arc`.
pub struct ServiceRegistry {
    config: RegistryConfig,
    device_id: String,
    handle: RemoteHandle,
    records: RwLock<HashMap<ServiceId, ServiceRecord>>,
    listeners: RwLock<HashMap<ServiceId, Vec<String>>>,
    routes: Mutex<HashMap<ServiceId, String>>,
    starting: Mutex<HashSet<ServiceId>>,
    connections: Mutex<HashMap<ServiceId, Arc<dyn ConnectionCallback>>>,
    managers: Mutex<HashMap<String, HostEndpoint>>,
    capabilities: CapabilityMap,
    core_services: Vec<ServiceId>,
    death: DeathWatch,
    self_ref: OnceLock<Weak<ServiceRegistry>>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("device_id", &self.device_id)
            .field("services", &self.records.read().len())
            .field("managers", &self.managers.lock().len())
            .finish()
    }
}

impl ServiceRegistry {
    /// Build the registry, seeding capabilities and the core-service list
    /// from the configured external files.
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        let capabilities = CapabilityMap::new(
            profile::load_capability_manifest(&config.capability_manifest_path),
            config.max_capability_name_len,
        );
        let core_services = profile::load_core_services(&config.core_list_path);
        let device_id = config
            .device_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let registry = Arc::new(Self {
            handle: RemoteHandle::new(format!("registry@{device_id}")),
            device_id,
            records: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            starting: Mutex::new(HashSet::new()),
            connections: Mutex::new(HashMap::new()),
            managers: Mutex::new(HashMap::new()),
            capabilities,
            core_services,
            death: DeathWatch::new(),
            self_ref: OnceLock::new(),
            config,
        });
        let _ = registry.self_ref.set(Arc::downgrade(&registry));
        registry
    }

    fn weak(&self) -> Weak<Self> {
        self.self_ref.get().cloned().unwrap_or_default()
    }

    /// The registry's own remote handle; hosts watch it for restart
    /// recovery.
    pub fn handle(&self) -> RemoteHandle {
        self.handle.clone()
    }

    /// Stable identifier of this device.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn require_privileged(caller: &CallerIdentity) -> Result<()> {
        caller.validate()?;
        if !caller.is_privileged() {
            return Err(Error::permission_denied(format!(
                "uid {} may not administer the registry",
                caller.uid
            )));
        }
        Ok(())
    }

    fn validate_name(&self, name: &str) -> Result<()> {
        if name.is_empty() || name.len() > self.config.max_name_len || name.trim().is_empty() {
            return Err(Error::invalid_value(format!("name {name:?} is malformed")));
        }
        Ok(())
    }

    fn validate_capability(&self, capability: &str) -> Result<()> {
        if capability.is_empty() {
            return Ok(());
        }
        if capability.len() > self.config.max_capability_bytes {
            return Err(Error::invalid_capability(format!(
                "descriptor is {} bytes, limit {}",
                capability.len(),
                self.config.max_capability_bytes
            )));
        }
        serde_json::from_str::<serde_json::Value>(capability)
            .map(|_| ())
            .map_err(|e| Error::invalid_capability(format!("descriptor is not valid JSON: {e}")))
    }

    // =========================================================================
    // Service Registration
    // =========================================================================

    /// Publish a service. Replaces any existing record for the id.
    pub async fn add_service(
        &self,
        id: ServiceId,
        handle: RemoteHandle,
        opts: PublishOptions,
        caller: &CallerIdentity,
    ) -> Result<()> {
        Self::require_privileged(caller)?;
        if !handle.is_alive() {
            return Err(Error::invalid_value(format!(
                "handle for service {id} is already dead"
            )));
        }
        self.validate_capability(&opts.capability)?;

        let watch = self.observe_service_death(&handle);
        let replaced = {
            let mut records = self.records.write();
            if !records.contains_key(&id) && records.len() >= self.config.max_services {
                drop(records);
                self.death.cancel(watch);
                return Err(Error::exhausted(format!(
                    "service map at capacity ({})",
                    self.config.max_services
                )));
            }
            records.insert(
                id,
                ServiceRecord {
                    handle: handle.clone(),
                    distributed: opts.distributed,
                    capability: opts.capability,
                    permission: opts.permission,
                    registered_at: Utc::now(),
                    watch,
                },
            )
        };
        if let Some(old) = replaced {
            self.death.cancel(old.watch);
            tracing::info!("service {} re-registered, record overwritten", id);
        }

        self.starting.lock().remove(&id);
        let pending = self.connections.lock().remove(&id);

        if opts.distributed {
            tracing::info!(
                "service {} flagged distributed, publishing under proxy name {}_{}",
                id,
                self.device_id,
                id
            );
        }

        tracing::info!("service {} registered ({})", id, handle.descriptor());
        self.notify_listeners(id, true).await;
        if let Some(callback) = pending {
            callback.on_connected(id, handle).await;
        }
        Ok(())
    }

    fn observe_service_death(&self, handle: &RemoteHandle) -> WatchId {
        let weak = self.weak();
        let token = handle.token();
        self.death.observe(handle, move || async move {
            if let Some(registry) = weak.upgrade() {
                registry.remove_service_by_token(token).await;
            }
        })
    }

    /// Remove a service by id.
    pub async fn remove_service(&self, id: ServiceId, caller: &CallerIdentity) -> Result<()> {
        Self::require_privileged(caller)?;
        let record = self
            .records
            .write()
            .remove(&id)
            .ok_or_else(|| Error::not_found(format!("service {id} is not registered")))?;
        self.death.cancel(record.watch);
        self.starting.lock().remove(&id);
        tracing::info!("service {} removed", id);
        self.notify_listeners(id, false).await;
        Ok(())
    }

    /// Remove a service by its remote handle.
    pub async fn remove_service_by_handle(
        &self,
        handle: &RemoteHandle,
        caller: &CallerIdentity,
    ) -> Result<()> {
        Self::require_privileged(caller)?;
        self.remove_service_by_token(handle.token()).await;
        Ok(())
    }

    async fn remove_service_by_token(&self, token: u64) {
        let removed = {
            let mut records = self.records.write();
            let id = records
                .iter()
                .find(|(_, rec)| rec.handle.token() == token)
                .map(|(id, _)| *id);
            id.and_then(|id| records.remove(&id).map(|rec| (id, rec)))
        };
        if let Some((id, record)) = removed {
            self.death.cancel(record.watch);
            self.starting.lock().remove(&id);
            tracing::info!("service {} dropped (handle {} gone)", id, token);
            self.notify_listeners(id, false).await;
        }
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Plain lookup. A record the caller may not see is reported as absent;
    /// existence is never revealed through permission errors. Does not
    /// trigger on-demand starts.
    pub fn check_service(
        &self,
        id: ServiceId,
        caller: &CallerIdentity,
    ) -> Result<Option<RemoteHandle>> {
        caller.validate()?;
        let records = self.records.read();
        match records.get(&id) {
            Some(record) if caller.satisfies(&record.permission) => {
                Ok(Some(record.handle.clone()))
            }
            Some(_) => {
                tracing::debug!("caller uid {} denied service {}", caller.uid, id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Lookup alias used by the wire contract.
    pub fn get_service(
        &self,
        id: ServiceId,
        caller: &CallerIdentity,
    ) -> Result<Option<RemoteHandle>> {
        self.check_service(id, caller)
    }

    /// Lookup that reports existence and starts on-demand services.
    ///
    /// Returns `(handle, exists)`. A routed but not-yet-running service
    /// reports `(None, true)` and at most one delegated start is in flight
    /// at a time.
    pub async fn check_service_now(
        &self,
        id: ServiceId,
        caller: &CallerIdentity,
    ) -> Result<(Option<RemoteHandle>, bool)> {
        caller.validate()?;
        {
            let records = self.records.read();
            if let Some(record) = records.get(&id) {
                if caller.satisfies(&record.permission) {
                    return Ok((Some(record.handle.clone()), true));
                }
                return Ok((None, false));
            }
        }
        if self.delegate_start(id).await {
            return Ok((None, true));
        }
        Ok((None, false))
    }

    /// Kick a delegated on-demand start unless one is already in flight.
    /// Returns whether the id is known to exist (route present).
    async fn delegate_start(&self, id: ServiceId) -> bool {
        if self.starting.lock().contains(&id) {
            return true;
        }
        let owner = match self.routes.lock().get(&id) {
            Some(owner) => owner.clone(),
            None => return false,
        };
        let control = self
            .managers
            .lock()
            .get(&owner)
            .map(|endpoint| endpoint.control.clone());
        match control {
            Some(control) => {
                self.starting.lock().insert(id);
                control.start_service_async(id).await;
                tracing::info!("delegated start of service {} to {}", id, owner);
            }
            None => {
                tracing::warn!("on-demand owner {} for service {} is not attached", owner, id);
            }
        }
        true
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    /// Subscribe a listener (a host, by name) to add/remove events of `id`.
    /// Subscribing to an already-registered id synthesizes exactly one
    /// "add" delivery to the new listener.
    pub async fn subscribe(&self, id: ServiceId, listener_name: &str) -> Result<()> {
        self.validate_name(listener_name)?;
        {
            let mut listeners = self.listeners.write();
            let names = listeners.entry(id).or_default();
            if names.iter().any(|n| n == listener_name) {
                tracing::debug!("listener {} already subscribed to {}", listener_name, id);
                return Ok(());
            }
            names.push(listener_name.to_string());
        }

        let registered = self.records.read().contains_key(&id);
        if registered {
            let control = self
                .managers
                .lock()
                .get(listener_name)
                .map(|endpoint| endpoint.control.clone());
            if let Some(control) = control {
                control.on_service_added(id, &self.device_id).await;
            }
        }
        Ok(())
    }

    pub fn unsubscribe(&self, id: ServiceId, listener_name: &str) -> Result<()> {
        self.validate_name(listener_name)?;
        if let Some(names) = self.listeners.write().get_mut(&id) {
            names.retain(|n| n != listener_name);
        }
        Ok(())
    }

    async fn notify_listeners(&self, id: ServiceId, added: bool) {
        let names: Vec<String> = self
            .listeners
            .read()
            .get(&id)
            .cloned()
            .unwrap_or_default();
        for name in names {
            let control = self
                .managers
                .lock()
                .get(&name)
                .map(|endpoint| endpoint.control.clone());
            match control {
                Some(control) if added => control.on_service_added(id, &self.device_id).await,
                Some(control) => control.on_service_removed(id, &self.device_id).await,
                None => tracing::debug!("listener {} has no attached endpoint", name),
            }
        }
    }

    // =========================================================================
    // On-Demand Routes & Connections
    // =========================================================================

    /// Declare that `owner_name` can start service `id` on demand.
    pub fn add_on_demand_route(
        &self,
        id: ServiceId,
        owner_name: &str,
        caller: &CallerIdentity,
    ) -> Result<()> {
        Self::require_privileged(caller)?;
        self.validate_name(owner_name)?;
        let mut routes = self.routes.lock();
        if routes.len() >= self.config.max_services {
            return Err(Error::exhausted(format!(
                "route map at capacity ({})",
                self.config.max_services
            )));
        }
        if routes.contains_key(&id) {
            return Err(Error::invalid_value(format!(
                "on-demand route for service {id} already registered"
            )));
        }
        routes.insert(id, owner_name.to_string());
        tracing::info!("on-demand route: service {} -> {}", id, owner_name);
        Ok(())
    }

    /// Owner of the on-demand route for `id`, if any.
    pub fn check_on_demand_route(&self, id: ServiceId) -> Option<String> {
        self.routes.lock().get(&id).cloned()
    }

    /// Record a connection callback for `id`, replacing any prior one, and
    /// trigger a delegated start when the service is not yet live.
    pub async fn connect(
        &self,
        id: ServiceId,
        callback: Arc<dyn ConnectionCallback>,
    ) -> Result<()> {
        self.connections.lock().insert(id, callback);
        let registered = self.records.read().contains_key(&id);
        if !registered {
            self.delegate_start(id).await;
        }
        Ok(())
    }

    /// Drop the pending connection callback and deliver "disconnected"
    /// immediately.
    pub async fn disconnect(&self, id: ServiceId) -> Result<()> {
        let callback = self
            .connections
            .lock()
            .remove(&id)
            .ok_or_else(|| Error::not_found(format!("no pending connection for service {id}")))?;
        callback.on_disconnected(id).await;
        Ok(())
    }

    // =========================================================================
    // Local Managers
    // =========================================================================

    /// Attach a per-process service host. The name must be the canonical
    /// pattern derived from the caller's own pid; anything else is spoofing.
    pub async fn attach_local_manager(
        &self,
        name: &str,
        handle: RemoteHandle,
        control: Arc<dyn HostControl>,
        caller: &CallerIdentity,
    ) -> Result<()> {
        Self::require_privileged(caller)?;
        self.validate_name(name)?;
        let expected = format!("{}{}", LOCAL_MANAGER_PREFIX, caller.pid);
        if name != expected {
            return Err(Error::invalid_value(format!(
                "local manager name {name:?} does not match calling process (expected {expected:?})"
            )));
        }
        if !handle.is_alive() {
            return Err(Error::invalid_value("local manager handle is already dead"));
        }

        let watch = self.observe_manager_death(&handle);
        let replaced = {
            let mut managers = self.managers.lock();
            if !managers.contains_key(name) && managers.len() >= self.config.max_services {
                drop(managers);
                self.death.cancel(watch);
                return Err(Error::exhausted(format!(
                    "local manager map at capacity ({})",
                    self.config.max_services
                )));
            }
            managers.insert(
                name.to_string(),
                HostEndpoint {
                    handle,
                    control,
                    watch,
                },
            )
        };
        if let Some(old) = replaced {
            self.death.cancel(old.watch);
        }
        tracing::info!("local manager {} attached", name);
        Ok(())
    }

    fn observe_manager_death(&self, handle: &RemoteHandle) -> WatchId {
        let weak = self.weak();
        let token = handle.token();
        self.death.observe(handle, move || async move {
            if let Some(registry) = weak.upgrade() {
                registry.drop_manager_by_token(token);
            }
        })
    }

    /// Resolve a local manager's handle by name.
    pub fn check_local_manager(
        &self,
        name: &str,
        caller: &CallerIdentity,
    ) -> Result<Option<RemoteHandle>> {
        Self::require_privileged(caller)?;
        self.validate_name(name)?;
        Ok(self
            .managers
            .lock()
            .get(name)
            .map(|endpoint| endpoint.handle.clone()))
    }

    /// Detach a local manager by name.
    pub fn remove_local_manager(&self, name: &str, caller: &CallerIdentity) -> Result<()> {
        Self::require_privileged(caller)?;
        self.validate_name(name)?;
        let endpoint = self
            .managers
            .lock()
            .remove(name)
            .ok_or_else(|| Error::not_found(format!("local manager {name:?} is not attached")))?;
        self.death.cancel(endpoint.watch);
        tracing::info!("local manager {} detached", name);
        Ok(())
    }

    /// Detach a local manager by handle.
    pub fn remove_local_manager_by_handle(
        &self,
        handle: &RemoteHandle,
        caller: &CallerIdentity,
    ) -> Result<()> {
        Self::require_privileged(caller)?;
        self.drop_manager_by_token(handle.token());
        Ok(())
    }

    /// A dying host loses its manager registration only; services it hosted
    /// stay registered until their own handles die.
    fn drop_manager_by_token(&self, token: u64) {
        let removed = {
            let mut managers = self.managers.lock();
            let name = managers
                .iter()
                .find(|(_, endpoint)| endpoint.handle.token() == token)
                .map(|(name, _)| name.clone());
            name.and_then(|name| managers.remove(&name).map(|endpoint| (name, endpoint)))
        };
        if let Some((name, endpoint)) = removed {
            self.death.cancel(endpoint.watch);
            tracing::info!(
                "local manager {} gone; its services remain until their handles die",
                name
            );
        }
    }

    // =========================================================================
    // Capabilities & Core Services
    // =========================================================================

    pub fn add_capability(&self, name: &str) -> Result<()> {
        self.capabilities.mark_available(name)
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.is_available(name)
    }

    pub fn available_capabilities(&self) -> Vec<String> {
        self.capabilities.available()
    }

    /// The configured core-service set filtered against registration state.
    pub fn core_service_list(&self, mode: CoreListMode) -> Vec<ServiceId> {
        let records = self.records.read();
        self.core_services
            .iter()
            .copied()
            .filter(|id| match mode {
                CoreListMode::All => true,
                CoreListMode::RegisteredOnly => records.contains_key(id),
                CoreListMode::UnregisteredOnly => !records.contains_key(id),
            })
            .collect()
    }

    // =========================================================================
    // Enumeration & Recycling
    // =========================================================================

    /// Ids of all registered services.
    pub fn list_services(&self, _dump_flags: u32) -> Vec<ServiceId> {
        let mut ids: Vec<ServiceId> = self.records.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// One diagnostic line per registered service.
    pub fn dump_services(&self) -> Vec<String> {
        let records = self.records.read();
        let mut lines: Vec<String> = records
            .iter()
            .map(|(id, rec)| {
                format!(
                    "service {} handle={} distributed={} capability={:?} registered_at={}",
                    id,
                    rec.handle.descriptor(),
                    rec.distributed,
                    rec.capability,
                    rec.registered_at.to_rfc3339(),
                )
            })
            .collect();
        lines.sort();
        lines
    }

    /// Stop and recycle every routed on-demand service no outside caller
    /// still holds. The handle's clone count is the usage counter: a record
    /// plus the hosting process account for the resident clones.
    pub async fn recycle_on_demand_services(&self, caller: &CallerIdentity) -> Result<()> {
        Self::require_privileged(caller)?;
        let routes: Vec<(ServiceId, String)> = self
            .routes
            .lock()
            .iter()
            .map(|(id, owner)| (*id, owner.clone()))
            .collect();

        for (id, owner) in routes {
            let holders = match self.records.read().get(&id) {
                Some(record) => record.handle.holders(),
                None => continue,
            };
            if holders > RESIDENT_HANDLE_HOLDERS {
                tracing::debug!("service {} still held ({} holders), not recycled", id, holders);
                continue;
            }
            let control = self
                .managers
                .lock()
                .get(&owner)
                .map(|endpoint| endpoint.control.clone());
            let Some(control) = control else {
                tracing::debug!("owner {} of service {} not attached", owner, id);
                continue;
            };
            if !control.stop_service(id).await {
                tracing::info!("service {} could not be stopped, not recycled", id);
                continue;
            }
            if !control.recycle_service(id).await {
                tracing::info!("service {} not recycled by its host", id);
            }
        }
        Ok(())
    }

    /// Abort outstanding death observations (process teardown).
    pub fn shutdown(&self) {
        self.death.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_registry() -> Arc<ServiceRegistry> {
        let dir = tempfile::tempdir().unwrap();
        let caps = dir.path().join("caps.json");
        std::fs::write(
            &caps,
            r#"{"capabilities": [
                {"name": "SystemCapability.Test.Alpha", "register_on_startup": true},
                {"name": "SystemCapability.Test.Beta"}
            ]}"#,
        )
        .unwrap();
        let core = dir.path().join("core.json");
        std::fs::write(&core, r#"{"core_services": [401, 402]}"#).unwrap();
        ServiceRegistry::new(RegistryConfig {
            capability_manifest_path: caps,
            core_list_path: core,
            device_id: Some("dev-test".into()),
            ..RegistryConfig::default()
        })
    }

    fn sid(raw: i32) -> ServiceId {
        ServiceId::new(raw).unwrap()
    }

    fn system() -> CallerIdentity {
        CallerIdentity::system(1)
    }

    #[derive(Default)]
    struct FakeHost {
        started: Mutex<Vec<ServiceId>>,
        stopped: Mutex<Vec<ServiceId>>,
        recycled: Mutex<Vec<ServiceId>>,
        added: AtomicUsize,
        removed: AtomicUsize,
    }

    #[async_trait]
    impl HostControl for FakeHost {
        async fn start_service_async(&self, id: ServiceId) {
            self.started.lock().push(id);
        }
        async fn stop_service(&self, id: ServiceId) -> bool {
            self.stopped.lock().push(id);
            true
        }
        async fn recycle_service(&self, id: ServiceId) -> bool {
            self.recycled.lock().push(id);
            true
        }
        async fn on_service_added(&self, _id: ServiceId, _device_id: &str) {
            self.added.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_service_removed(&self, _id: ServiceId, _device_id: &str) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn attach_host(
        registry: &Arc<ServiceRegistry>,
        pid: u32,
    ) -> (String, Arc<FakeHost>) {
        let name = format!("{LOCAL_MANAGER_PREFIX}{pid}");
        let host = Arc::new(FakeHost::default());
        registry
            .attach_local_manager(
                &name,
                RemoteHandle::new(format!("host:{pid}")),
                host.clone(),
                &CallerIdentity::system(pid),
            )
            .await
            .unwrap();
        (name, host)
    }

    #[tokio::test]
    async fn add_then_lookup_then_remove() {
        let registry = test_registry();
        let handle = RemoteHandle::new("svc:100");
        registry
            .add_service(sid(100), handle.clone(), PublishOptions::default(), &system())
            .await
            .unwrap();

        let found = registry.check_service(sid(100), &system()).unwrap();
        assert_eq!(found.unwrap().token(), handle.token());

        registry.remove_service(sid(100), &system()).await.unwrap();
        assert!(registry.check_service(sid(100), &system()).unwrap().is_none());
        assert!(matches!(
            registry.remove_service(sid(100), &system()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn permission_gates_lookup_without_revealing_existence() {
        let registry = test_registry();
        registry
            .add_service(
                sid(200),
                RemoteHandle::new("svc:200"),
                PublishOptions {
                    permission: "servicehub.permission.TEST".into(),
                    ..PublishOptions::default()
                },
                &system(),
            )
            .await
            .unwrap();

        let stranger = CallerIdentity {
            uid: 10001,
            pid: 5,
            granted: Vec::new(),
        };
        assert!(registry.check_service(sid(200), &stranger).unwrap().is_none());
        let (handle, exists) = registry
            .check_service_now(sid(200), &stranger)
            .await
            .unwrap();
        assert!(handle.is_none());
        assert!(!exists);

        let holder = CallerIdentity {
            uid: 10001,
            pid: 5,
            granted: vec!["servicehub.permission.TEST".into()],
        };
        assert!(registry.check_service(sid(200), &holder).unwrap().is_some());
    }

    #[tokio::test]
    async fn unprivileged_cannot_publish() {
        let registry = test_registry();
        let app = CallerIdentity {
            uid: 10002,
            pid: 9,
            granted: Vec::new(),
        };
        let err = registry
            .add_service(sid(300), RemoteHandle::new("svc:300"), PublishOptions::default(), &app)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn malformed_capability_rejected() {
        let registry = test_registry();
        let err = registry
            .add_service(
                sid(301),
                RemoteHandle::new("svc:301"),
                PublishOptions {
                    capability: "{not json".into(),
                    ..PublishOptions::default()
                },
                &system(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCapability(_)));
        assert!(registry.check_service(sid(301), &system()).unwrap().is_none());
    }

    #[tokio::test]
    async fn reregistration_overwrites_record() {
        let registry = test_registry();
        let first = RemoteHandle::new("svc:v1");
        let second = RemoteHandle::new("svc:v2");
        registry
            .add_service(sid(310), first.clone(), PublishOptions::default(), &system())
            .await
            .unwrap();
        registry
            .add_service(sid(310), second.clone(), PublishOptions::default(), &system())
            .await
            .unwrap();

        let found = registry.check_service(sid(310), &system()).unwrap().unwrap();
        assert_eq!(found.token(), second.token());

        // The first handle is no longer observed: killing it must not evict
        // the replacement record.
        first.kill();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.check_service(sid(310), &system()).unwrap().is_some());
    }

    #[tokio::test]
    async fn handle_death_removes_record_and_notifies() {
        let registry = test_registry();
        let (name, host) = attach_host(&registry, 10).await;
        registry.subscribe(sid(320), &name).await.unwrap();

        let handle = RemoteHandle::new("svc:320");
        registry
            .add_service(sid(320), handle.clone(), PublishOptions::default(), &system())
            .await
            .unwrap();
        assert_eq!(host.added.load(Ordering::SeqCst), 1);

        handle.kill();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.check_service(sid(320), &system()).unwrap().is_none());
        assert_eq!(host.removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscribe_before_and_after_add() {
        let registry = test_registry();
        let (before, before_host) = attach_host(&registry, 21).await;
        registry.subscribe(sid(330), &before).await.unwrap();
        assert_eq!(before_host.added.load(Ordering::SeqCst), 0);

        registry
            .add_service(sid(330), RemoteHandle::new("svc:330"), PublishOptions::default(), &system())
            .await
            .unwrap();
        assert_eq!(before_host.added.load(Ordering::SeqCst), 1);

        // Re-subscribing is deduplicated: no second synthetic delivery.
        registry.subscribe(sid(330), &before).await.unwrap();
        assert_eq!(before_host.added.load(Ordering::SeqCst), 1);

        // A listener arriving after registration gets one synthetic add.
        let (after, after_host) = attach_host(&registry, 22).await;
        registry.subscribe(sid(330), &after).await.unwrap();
        assert_eq!(after_host.added.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn on_demand_start_deduplicated_by_starting_set() {
        let registry = test_registry();
        let (name, host) = attach_host(&registry, 30).await;
        registry
            .add_on_demand_route(sid(340), &name, &system())
            .unwrap();

        let (handle, exists) = registry.check_service_now(sid(340), &system()).await.unwrap();
        assert!(handle.is_none());
        assert!(exists);
        assert_eq!(host.started.lock().len(), 1);

        // Second query while the start is in flight: exists, no new start.
        let (_, exists) = registry.check_service_now(sid(340), &system()).await.unwrap();
        assert!(exists);
        assert_eq!(host.started.lock().len(), 1);

        // Registration clears the starting set; removal makes a later
        // lookup delegate again.
        registry
            .add_service(sid(340), RemoteHandle::new("svc:340"), PublishOptions::default(), &system())
            .await
            .unwrap();
        registry.remove_service(sid(340), &system()).await.unwrap();
        let (_, exists) = registry.check_service_now(sid(340), &system()).await.unwrap();
        assert!(exists);
        assert_eq!(host.started.lock().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_route_rejected() {
        let registry = test_registry();
        let (name, _) = attach_host(&registry, 31).await;
        registry.add_on_demand_route(sid(341), &name, &system()).unwrap();
        assert!(registry
            .add_on_demand_route(sid(341), &name, &system())
            .is_err());
        assert_eq!(registry.check_on_demand_route(sid(341)), Some(name));
    }

    struct FakeConnection {
        connected: AtomicUsize,
        disconnected: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionCallback for FakeConnection {
        async fn on_connected(&self, _id: ServiceId, _handle: RemoteHandle) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_disconnected(&self, _id: ServiceId) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn connect_delivers_once_on_registration() {
        let registry = test_registry();
        let (name, host) = attach_host(&registry, 40).await;
        registry
            .add_on_demand_route(sid(350), &name, &system())
            .unwrap();

        let callback = Arc::new(FakeConnection {
            connected: AtomicUsize::new(0),
            disconnected: AtomicUsize::new(0),
        });
        registry.connect(sid(350), callback.clone()).await.unwrap();
        assert_eq!(host.started.lock().len(), 1);

        registry
            .add_service(sid(350), RemoteHandle::new("svc:350"), PublishOptions::default(), &system())
            .await
            .unwrap();
        assert_eq!(callback.connected.load(Ordering::SeqCst), 1);

        // Callback cleared after fulfilment: re-registration delivers
        // nothing further.
        registry
            .add_service(sid(350), RemoteHandle::new("svc:350b"), PublishOptions::default(), &system())
            .await
            .unwrap();
        assert_eq!(callback.connected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_delivery() {
        let registry = test_registry();
        let (name, _host) = attach_host(&registry, 41).await;
        registry
            .add_on_demand_route(sid(351), &name, &system())
            .unwrap();

        let callback = Arc::new(FakeConnection {
            connected: AtomicUsize::new(0),
            disconnected: AtomicUsize::new(0),
        });
        registry.connect(sid(351), callback.clone()).await.unwrap();
        registry.disconnect(sid(351)).await.unwrap();
        assert_eq!(callback.disconnected.load(Ordering::SeqCst), 1);

        registry
            .add_service(sid(351), RemoteHandle::new("svc:351"), PublishOptions::default(), &system())
            .await
            .unwrap();
        assert_eq!(callback.connected.load(Ordering::SeqCst), 0);

        assert!(matches!(
            registry.disconnect(sid(351)).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn local_manager_name_spoofing_rejected() {
        let registry = test_registry();
        let host = Arc::new(FakeHost::default());
        let caller = CallerIdentity::system(77);

        let err = registry
            .attach_local_manager(
                &format!("{LOCAL_MANAGER_PREFIX}78"),
                RemoteHandle::new("host:78?"),
                host.clone(),
                &caller,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidValue(_)));

        registry
            .attach_local_manager(
                &format!("{LOCAL_MANAGER_PREFIX}77"),
                RemoteHandle::new("host:77"),
                host,
                &caller,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn manager_death_leaves_services_registered() {
        let registry = test_registry();
        let name = format!("{LOCAL_MANAGER_PREFIX}50");
        let host = Arc::new(FakeHost::default());
        let manager_handle = RemoteHandle::new("host:50");
        registry
            .attach_local_manager(&name, manager_handle.clone(), host, &CallerIdentity::system(50))
            .await
            .unwrap();

        registry
            .add_service(sid(360), RemoteHandle::new("svc:360"), PublishOptions::default(), &system())
            .await
            .unwrap();

        manager_handle.kill();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(registry
            .check_local_manager(&name, &system())
            .unwrap()
            .is_none());
        assert!(registry.check_service(sid(360), &system()).unwrap().is_some());
    }

    #[tokio::test]
    async fn recycle_skips_services_with_outside_holders() {
        let registry = test_registry();
        let (name, host) = attach_host(&registry, 60).await;
        registry
            .add_on_demand_route(sid(370), &name, &system())
            .unwrap();

        // The hosting process keeps one clone, the record the other.
        let host_side = RemoteHandle::new("svc:370");
        registry
            .add_service(sid(370), host_side.clone(), PublishOptions::default(), &system())
            .await
            .unwrap();

        // An outside caller holds the service: not recyclable.
        let borrowed = registry.check_service(sid(370), &system()).unwrap().unwrap();
        registry.recycle_on_demand_services(&system()).await.unwrap();
        assert!(host.stopped.lock().is_empty());

        drop(borrowed);
        registry.recycle_on_demand_services(&system()).await.unwrap();
        assert_eq!(host.stopped.lock().as_slice(), &[sid(370)]);
        assert_eq!(host.recycled.lock().as_slice(), &[sid(370)]);
    }

    #[tokio::test]
    async fn capability_queries() {
        let registry = test_registry();
        assert!(registry.has_capability("SystemCapability.Test.Alpha"));
        assert!(!registry.has_capability("SystemCapability.Test.Beta"));
        registry.add_capability("SystemCapability.Test.Beta").unwrap();
        assert!(registry.has_capability("SystemCapability.Test.Beta"));
        assert!(registry.add_capability("SystemCapability.Nope").is_err());
        assert_eq!(registry.available_capabilities().len(), 2);
    }

    #[tokio::test]
    async fn core_service_list_partitions() {
        let registry = test_registry();
        registry
            .add_service(sid(401), RemoteHandle::new("svc:401"), PublishOptions::default(), &system())
            .await
            .unwrap();

        assert_eq!(registry.core_service_list(CoreListMode::All).len(), 2);
        assert_eq!(
            registry.core_service_list(CoreListMode::RegisteredOnly),
            vec![sid(401)]
        );
        assert_eq!(
            registry.core_service_list(CoreListMode::UnregisteredOnly),
            vec![sid(402)]
        );
    }
}
