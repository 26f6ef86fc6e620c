//! Per-process service host.
//!
//! Runs once per hosting process. Owns the in-process map of live service
//! instances, sequences their startup by boot phase, bounds dependency
//! waits, exposes the control interface the registry delegates to
//! (start/stop/recycle/notify), relays add-remove listener events, and
//! re-publishes itself and its hosted services when the registry restarts.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::host::pool::{resolve_workers, TaskPool};
use crate::host::service::{HostedService, Service, ServiceState};
use crate::liveness::DeathWatch;
use crate::loader::{CodeHandle, InstanceSink, ServiceLoader};
use crate::profile::{self, BootPhase, ServiceProfile};
use crate::registry::types::{HostControl, PublishOptions, LOCAL_MANAGER_PREFIX};
use crate::remote::RemoteHandle;
use crate::types::{Error, HostConfig, Result, ServiceId};

pub use crate::registry::api::{RegistryApi, RegistryConnector, RegistryLink};

/// The per-process service host.
pub struct ServiceHost {
    config: HostConfig,
    pid: u32,
    name: String,
    handle: RemoteHandle,
    loader: Arc<dyn ServiceLoader>,
    connector: Arc<dyn RegistryConnector>,
    link: RwLock<Option<RegistryLink>>,
    services: RwLock<HashMap<ServiceId, HostedService>>,
    profiles: Mutex<HashMap<ServiceId, ServiceProfile>>,
    code_handles: Mutex<HashMap<ServiceId, CodeHandle>>,
    listeners: Mutex<HashMap<ServiceId, Vec<ServiceId>>>,
    phases: Mutex<BTreeMap<BootPhase, Vec<ServiceId>>>,
    phase_pool: TaskPool,
    ondemand_pool: TaskPool,
    death: DeathWatch,
    self_ref: OnceLock<Weak<ServiceHost>>,
}

impl std::fmt::Debug for ServiceHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHost")
            .field("name", &self.name)
            .field("services", &self.services.read().len())
            .finish()
    }
}

impl ServiceHost {
    pub fn new(
        config: HostConfig,
        pid: u32,
        loader: Arc<dyn ServiceLoader>,
        connector: Arc<dyn RegistryConnector>,
    ) -> Arc<Self> {
        let workers = resolve_workers(config.pool_workers);
        let max_pending = config.max_pending_tasks;
        let name = format!("{LOCAL_MANAGER_PREFIX}{pid}");
        let host = Arc::new(Self {
            handle: RemoteHandle::new(format!("host:{name}")),
            name,
            pid,
            loader,
            connector,
            link: RwLock::new(None),
            services: RwLock::new(HashMap::new()),
            profiles: Mutex::new(HashMap::new()),
            code_handles: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            phases: Mutex::new(BTreeMap::new()),
            phase_pool: TaskPool::new("phase-start", workers, max_pending),
            ondemand_pool: TaskPool::new("on-demand", workers, max_pending),
            death: DeathWatch::new(),
            self_ref: OnceLock::new(),
            config,
        });
        let _ = host.self_ref.set(Arc::downgrade(&host));
        host
    }

    fn arc(&self) -> Option<Arc<Self>> {
        self.self_ref.get().and_then(Weak::upgrade)
    }

    /// Canonical per-process registration name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pid of the hosting process.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The host's own remote handle (its local-manager endpoint).
    pub fn handle(&self) -> RemoteHandle {
        self.handle.clone()
    }

    /// Lifecycle state of a hosted instance, if present.
    pub fn service_state(&self, id: ServiceId) -> Option<ServiceState> {
        self.services.read().get(&id).map(|hosted| hosted.state)
    }

    fn registry(&self) -> Result<Arc<dyn RegistryApi>> {
        self.link
            .read()
            .as_ref()
            .map(|link| link.api.clone())
            .ok_or_else(|| Error::transport("registry is not reachable"))
    }

    // =========================================================================
    // Bootstrap
    // =========================================================================

    /// Full startup sequence of a hosting process.
    pub async fn bootstrap(self: &Arc<Self>, profile_path: &Path) -> Result<()> {
        let resolved = profile::validate_profile_path(
            profile_path,
            &self.config.profile_dirs,
            &self.config.profile_extension,
        )?;
        let document = profile::load_profiles(&resolved)?;
        tracing::info!(
            "bootstrapping {} with {} service profiles",
            document.process,
            document.services.len()
        );

        {
            let mut profiles = self.profiles.lock();
            let mut phases = self.phases.lock();
            for svc in &document.services {
                if svc.run_on_create {
                    phases.entry(svc.boot_phase).or_default().push(svc.id);
                }
                profiles.insert(svc.id, svc.clone());
            }
        }

        // Resolve backing code for auto-start services up front; a missing
        // factory disables that service but not the whole process.
        for svc in &document.services {
            if svc.run_on_create {
                if let Err(e) = self.load_code(svc.id) {
                    tracing::warn!("service {} code load failed: {}", svc.id, e);
                }
            }
        }

        self.wait_for_registry().await?;
        self.attach_to_registry().await?;
        self.watch_registry();
        self.run_start_phases().await;
        self.register_on_demand_routes().await;
        Ok(())
    }

    /// Poll the connector with bounded retries. Fails permanently once
    /// exhausted.
    async fn wait_for_registry(&self) -> Result<()> {
        for attempt in 0..self.config.registry_wait_retries {
            if let Some(link) = self.connector.connect().await {
                tracing::info!("registry reachable (attempt {})", attempt + 1);
                *self.link.write() = Some(link);
                return Ok(());
            }
            tracing::debug!("waiting for registry (attempt {})", attempt + 1);
            tokio::time::sleep(self.config.registry_wait_interval).await;
        }
        Err(Error::timeout(format!(
            "registry unreachable after {} attempts",
            self.config.registry_wait_retries
        )))
    }

    async fn attach_to_registry(self: &Arc<Self>) -> Result<()> {
        let api = self.registry()?;
        api.attach_local_manager(
            &self.name,
            self.handle.clone(),
            self.clone() as Arc<dyn HostControl>,
        )
        .await?;
        tracing::info!("attached to registry as {}", self.name);
        Ok(())
    }

    /// Observe the registry's handle; on death, run recovery.
    fn watch_registry(self: &Arc<Self>) {
        let registry_handle = match self.link.read().as_ref() {
            Some(link) => link.handle.clone(),
            None => return,
        };
        let weak = Arc::downgrade(self);
        let _ = self.death.observe(&registry_handle, move || async move {
            if let Some(host) = weak.upgrade() {
                host.recover().await;
            }
        });
    }

    // =========================================================================
    // Phase Startup
    // =========================================================================

    async fn run_start_phases(self: &Arc<Self>) {
        let phases = self.phases.lock().clone();
        for phase in BootPhase::ORDERED {
            if let Some(ids) = phases.get(&phase) {
                self.run_phase(phase, ids.clone()).await;
            }
        }
    }

    /// Schedule every auto-start service of one phase and wait on the phase
    /// barrier. The ceiling is absolute: once it passes, the phase is done
    /// even if start tasks are still outstanding (they are not cancelled).
    async fn run_phase(self: &Arc<Self>, phase: BootPhase, ids: Vec<ServiceId>) {
        if ids.is_empty() {
            return;
        }
        tracing::info!("phase {:?}: starting {} services", phase, ids.len());
        let begin = Instant::now();

        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            let host = self.clone();
            match self.phase_pool.spawn(async move { host.start_task(id).await }) {
                Ok(task) => tasks.push(task),
                Err(e) => tracing::warn!("cannot schedule start of service {}: {}", id, e),
            }
        }

        let barrier = futures::future::join_all(tasks);
        if tokio::time::timeout(self.config.phase_ceiling, barrier)
            .await
            .is_err()
        {
            tracing::warn!(
                "phase {:?} ceiling ({:?}) reached with tasks outstanding",
                phase,
                self.config.phase_ceiling
            );
        } else {
            tracing::info!("phase {:?} finished in {:?}", phase, begin.elapsed());
        }
    }

    /// One phase start task: wait for dependencies within the profile's
    /// bound, then start regardless, logging whatever is still missing.
    async fn start_task(self: Arc<Self>, id: ServiceId) {
        let depends = {
            let profiles = self.profiles.lock();
            match profiles.get(&id) {
                Some(p) => (!p.depends.is_empty()).then(|| (p.depends.clone(), p.depend_timeout)),
                None => {
                    tracing::warn!("no profile for service {}, skipping start", id);
                    return;
                }
            }
        };

        if let Some((_, timeout)) = depends {
            let deadline = Instant::now() + timeout;
            loop {
                let unmet = self.unmet_dependencies(id).await;
                if unmet.is_empty() {
                    break;
                }
                if Instant::now() >= deadline {
                    for dep in unmet {
                        tracing::warn!(
                            "service {}'s dependency {} not up within {:?}, starting anyway",
                            id,
                            dep,
                            timeout
                        );
                    }
                    break;
                }
                tokio::time::sleep(self.config.dep_check_interval).await;
            }
        }

        self.start_service(id).await;
    }

    /// Dependencies of `id` not currently visible in the registry.
    async fn unmet_dependencies(&self, id: ServiceId) -> Vec<ServiceId> {
        let depends = self
            .profiles
            .lock()
            .get(&id)
            .map(|p| p.depends.clone())
            .unwrap_or_default();
        let api = match self.registry() {
            Ok(api) => api,
            Err(_) => return depends,
        };
        let mut unmet = Vec::new();
        for dep in depends {
            match api.check_service(dep).await {
                Ok(Some(_)) => {}
                _ => unmet.push(dep),
            }
        }
        unmet
    }

    // =========================================================================
    // Service Lifecycle
    // =========================================================================

    /// Start an instantiated service and publish its registration.
    /// Idempotent for already-running services.
    pub async fn start_service(&self, id: ServiceId) -> bool {
        let service = {
            let mut services = self.services.write();
            match services.get_mut(&id) {
                None => {
                    tracing::warn!("service {} is not instantiated", id);
                    return false;
                }
                Some(hosted) => {
                    if hosted.state == ServiceState::Running {
                        tracing::debug!("service {} already running", id);
                        return true;
                    }
                    hosted.state = ServiceState::Running;
                    hosted.service.clone()
                }
            }
        };

        service.on_start().await;
        tracing::info!("service {} running", id);
        self.publish(id).await;
        true
    }

    /// Publish (or re-publish) a hosted service's registration.
    async fn publish(&self, id: ServiceId) {
        let handle = match self.services.read().get(&id) {
            Some(hosted) => hosted.handle.clone(),
            None => return,
        };
        let opts = self
            .profiles
            .lock()
            .get(&id)
            .map(|p| PublishOptions {
                distributed: p.distributed,
                capability: p.capability.clone(),
                permission: p.permission.clone(),
            })
            .unwrap_or_default();

        let api = match self.registry() {
            Ok(api) => api,
            Err(e) => {
                tracing::warn!("cannot publish service {}: {}", id, e);
                return;
            }
        };
        match api.add_service(id, handle, opts).await {
            Ok(()) => {
                if let Some(hosted) = self.services.write().get_mut(&id) {
                    hosted.published = true;
                }
            }
            Err(e) => tracing::warn!("publishing service {} failed: {}", id, e),
        }
    }

    /// Stop a running service and withdraw its registration.
    pub async fn stop_service(&self, id: ServiceId) -> bool {
        let service = {
            let mut services = self.services.write();
            match services.get_mut(&id) {
                None => return false,
                Some(hosted) => {
                    if hosted.state != ServiceState::Running {
                        tracing::debug!("service {} is not running", id);
                        return true;
                    }
                    hosted.state = ServiceState::Stopped;
                    hosted.service.clone()
                }
            }
        };

        service.on_stop().await;
        if let Ok(api) = self.registry() {
            if let Err(e) = api.remove_service(id).await {
                tracing::debug!("withdrawing service {} failed: {}", id, e);
            }
        }
        if let Some(hosted) = self.services.write().get_mut(&id) {
            hosted.published = false;
        }
        tracing::info!("service {} stopped", id);
        true
    }

    /// Schedule an on-demand start on the dedicated pool.
    pub fn spawn_start(self: &Arc<Self>, id: ServiceId) -> Result<()> {
        let host = self.clone();
        self.ondemand_pool
            .spawn(async move { host.start_on_demand(id).await })
            .map(|_| ())
    }

    /// On-demand start path: load code if needed, wait for the instance to
    /// appear via the loader's registration side effect, then start it.
    async fn start_on_demand(self: Arc<Self>, id: ServiceId) {
        if !self.services.read().contains_key(&id) {
            if let Err(e) = self.load_code(id) {
                tracing::warn!("on-demand load of service {} failed: {}", id, e);
                return;
            }
        }

        let mut retries = self.config.ondemand_wait_retries;
        while !self.services.read().contains_key(&id) {
            if retries == 0 {
                tracing::error!("service {} did not appear after code load", id);
                return;
            }
            tracing::debug!("waiting for service {} to appear", id);
            tokio::time::sleep(self.config.ondemand_wait_interval).await;
            retries -= 1;
        }

        if !self.start_service(id).await {
            tracing::error!("failed to start on-demand service {}", id);
        }
    }

    /// Resolve and load a service's backing code (idempotent).
    fn load_code(&self, id: ServiceId) -> Result<()> {
        if self.code_handles.lock().contains_key(&id) {
            return Ok(());
        }
        let svc_profile = self
            .profiles
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no profile for service {id}")))?;
        let code = self.loader.load(&svc_profile, self)?;
        self.code_handles.lock().insert(id, code);
        Ok(())
    }

    /// Recycle a non-running service: drop the instance, release its code.
    /// A running service is left untouched and reported as not recycled.
    pub async fn recycle_service(&self, id: ServiceId) -> bool {
        {
            let mut services = self.services.write();
            let state = match services.get(&id) {
                None => return false,
                Some(hosted) => hosted.state,
            };
            if state == ServiceState::Running {
                tracing::info!("service {} is running, not recycled", id);
                return false;
            }
            services.remove(&id);
        }
        if let Some(code) = self.code_handles.lock().remove(&id) {
            self.loader.unload(code);
        }
        tracing::info!("service {} recycled", id);
        true
    }

    /// Forward to the instance's debug hook.
    pub fn debug_service(&self, id: ServiceId) -> bool {
        match self.services.read().get(&id) {
            Some(hosted) => {
                hosted.service.on_debug();
                true
            }
            None => false,
        }
    }

    /// Forward to the instance's self-test hook.
    pub fn test_service(&self, id: ServiceId) -> bool {
        match self.services.read().get(&id) {
            Some(hosted) => {
                hosted.service.on_test();
                true
            }
            None => false,
        }
    }

    /// Forward to the instance's dump hook.
    pub fn dump_service(&self, id: ServiceId) -> Option<String> {
        self.services
            .read()
            .get(&id)
            .map(|hosted| hosted.service.on_dump())
    }

    /// Accepted for interface completeness; hand-off sequencing is not
    /// implemented.
    pub fn handoff_begin(&self, id: ServiceId) -> bool {
        tracing::debug!("handoff begin for service {} acknowledged", id);
        true
    }

    /// Accepted for interface completeness; hand-off sequencing is not
    /// implemented.
    pub fn handoff_after(&self, begin: &str, after: &str) -> bool {
        tracing::debug!("handoff ordering {} -> {} acknowledged", begin, after);
        true
    }

    // =========================================================================
    // Listener Relay
    // =========================================================================

    /// Register a local listener service for add/remove events of `id`.
    /// The first listener for an id subscribes this host at the registry;
    /// later listeners on an already-registered id get one immediate "add".
    pub async fn add_service_listener(
        &self,
        id: ServiceId,
        listener: ServiceId,
    ) -> Result<bool> {
        let first_for_id = {
            let mut listeners = self.listeners.lock();
            let entry = listeners.entry(id).or_default();
            if entry.contains(&listener) {
                tracing::debug!("listener {} already registered for {}", listener, id);
                return Ok(false);
            }
            let first = entry.is_empty();
            entry.push(listener);
            first
        };

        let api = self.registry()?;
        if first_for_id {
            api.subscribe(id, &self.name).await?;
        } else if api.check_service(id).await?.is_some() {
            let device = api.device_id().await.unwrap_or_default();
            self.notify_one(id, listener, &device, true);
        }
        Ok(true)
    }

    /// Drop a local listener registration; unsubscribes at the registry
    /// once the last listener for the id is gone.
    pub async fn remove_service_listener(
        &self,
        id: ServiceId,
        listener: ServiceId,
    ) -> Result<bool> {
        let (removed, now_empty) = {
            let mut listeners = self.listeners.lock();
            match listeners.get_mut(&id) {
                None => (false, false),
                Some(entry) => {
                    let before = entry.len();
                    entry.retain(|l| *l != listener);
                    (entry.len() < before, entry.is_empty())
                }
            }
        };
        if removed && now_empty {
            let api = self.registry()?;
            api.unsubscribe(id, &self.name).await?;
        }
        Ok(removed)
    }

    fn notify_one(&self, id: ServiceId, listener: ServiceId, device_id: &str, added: bool) {
        let instance = self
            .services
            .read()
            .get(&listener)
            .map(|hosted| hosted.service.clone());
        match instance {
            Some(service) if added => service.on_peer_added(id, device_id),
            Some(service) => service.on_peer_removed(id, device_id),
            None => tracing::debug!("listener service {} is not instantiated", listener),
        }
    }

    fn relay_event(&self, id: ServiceId, device_id: &str, added: bool) {
        let interested: Vec<ServiceId> = self
            .listeners
            .lock()
            .get(&id)
            .cloned()
            .unwrap_or_default();
        for listener in interested {
            self.notify_one(id, listener, device_id, added);
        }
    }

    // =========================================================================
    // On-Demand Routes & Recovery
    // =========================================================================

    async fn register_on_demand_routes(&self) {
        let on_demand: Vec<ServiceId> = self
            .profiles
            .lock()
            .values()
            .filter(|p| !p.run_on_create)
            .map(|p| p.id)
            .collect();
        let api = match self.registry() {
            Ok(api) => api,
            Err(_) => return,
        };
        for id in on_demand {
            if let Err(e) = api.add_on_demand_route(id, &self.name).await {
                tracing::debug!("on-demand route for service {} not added: {}", id, e);
            }
        }
    }

    /// Registry-death recovery: reconnect, re-attach under the canonical
    /// name, restore routes and subscriptions, and republish every service
    /// that was published - without starting anything again.
    async fn recover(self: Arc<Self>) {
        tracing::warn!("registry died, {} recovering", self.name);
        *self.link.write() = None;

        if let Err(e) = self.wait_for_registry().await {
            tracing::error!("recovery failed, registry never came back: {}", e);
            return;
        }
        if let Err(e) = self.attach_to_registry().await {
            tracing::error!("recovery failed to re-attach: {}", e);
            return;
        }
        self.watch_registry();
        self.register_on_demand_routes().await;

        let subscribed: Vec<ServiceId> = self.listeners.lock().keys().copied().collect();
        if let Ok(api) = self.registry() {
            for id in subscribed {
                if let Err(e) = api.subscribe(id, &self.name).await {
                    tracing::debug!("re-subscribing to {} failed: {}", id, e);
                }
            }
        }

        let republish: Vec<ServiceId> = self
            .services
            .read()
            .iter()
            .filter(|(_, hosted)| hosted.published || hosted.state == ServiceState::Running)
            .map(|(id, _)| *id)
            .collect();
        for id in &republish {
            self.publish(*id).await;
        }
        tracing::info!(
            "recovery complete, republished {} services",
            republish.len()
        );
    }

    /// Release every loaded code handle and stop observing (teardown).
    pub fn shutdown(&self) {
        let handles: Vec<CodeHandle> = {
            let mut code_handles = self.code_handles.lock();
            code_handles.drain().map(|(_, code)| code).collect()
        };
        for code in handles {
            self.loader.unload(code);
        }
        self.phase_pool.shutdown();
        self.ondemand_pool.shutdown();
        self.death.shutdown();
        self.handle.kill();
        tracing::info!("host {} shut down", self.name);
    }
}

impl InstanceSink for ServiceHost {
    /// The loader's registration side effect: loaded code hands its
    /// instance here, making the service visible in the local map.
    fn install(&self, service: Box<dyn Service>) -> bool {
        let id = service.id();
        let mut services = self.services.write();
        if services.contains_key(&id) {
            tracing::info!("instance for service {} already present", id);
            return false;
        }
        services.insert(
            id,
            HostedService {
                handle: RemoteHandle::new(format!("service:{}@{}", id, self.name)),
                service: Arc::from(service),
                state: ServiceState::Instantiated,
                published: false,
            },
        );
        tracing::info!("instance for service {} installed", id);
        true
    }
}

#[async_trait]
impl HostControl for ServiceHost {
    async fn start_service_async(&self, id: ServiceId) {
        match self.arc() {
            Some(host) => {
                if let Err(e) = host.spawn_start(id) {
                    tracing::warn!("cannot schedule on-demand start of {}: {}", id, e);
                }
            }
            None => tracing::warn!("host is shutting down, dropping start of {}", id),
        }
    }

    async fn stop_service(&self, id: ServiceId) -> bool {
        ServiceHost::stop_service(self, id).await
    }

    async fn recycle_service(&self, id: ServiceId) -> bool {
        ServiceHost::recycle_service(self, id).await
    }

    async fn on_service_added(&self, id: ServiceId, device_id: &str) {
        self.relay_event(id, device_id, true);
    }

    async fn on_service_removed(&self, id: ServiceId, device_id: &str) {
        self.relay_event(id, device_id, false);
    }
}
