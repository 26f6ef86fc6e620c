//! Service loader - resolves and loads backing code on first need.
//!
//! The loader abstracts the platform's code-loading story behind an explicit
//! `load`/`unload` pair so the linking mechanism can be substituted without
//! touching orchestration logic. Loading a service's code installs its
//! instance into the hosting process through the `InstanceSink` - the
//! registration side effect the host polls for.
//!
//! `FactoryLoader` is the in-process implementation: a table of constructors
//! keyed by service id, registered by the embedding binary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::host::service::Service;
use crate::profile::ServiceProfile;
use crate::types::{Error, Result, ServiceId};

/// Opaque handle to loaded backing code; returned by `load`, consumed by
/// `unload` when a service is recycled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeHandle {
    id: ServiceId,
    code_ref: String,
    token: u64,
}

impl CodeHandle {
    pub fn id(&self) -> ServiceId {
        self.id
    }

    pub fn code_ref(&self) -> &str {
        &self.code_ref
    }
}

/// Receives instances produced by loaded code.
pub trait InstanceSink: Send + Sync {
    /// Install a freshly constructed instance into the local service map.
    /// Returns false when an instance for the id already exists.
    fn install(&self, service: Box<dyn Service>) -> bool;
}

/// Resolves and loads the backing code of a service.
pub trait ServiceLoader: Send + Sync {
    /// Load the code referenced by `profile.code_ref` and run its
    /// registration side effect against `sink`.
    fn load(&self, profile: &ServiceProfile, sink: &dyn InstanceSink) -> Result<CodeHandle>;

    /// Release previously loaded code.
    fn unload(&self, handle: CodeHandle);
}

/// Constructor for one service instance.
pub type ServiceFactory = Box<dyn Fn() -> Box<dyn Service> + Send + Sync>;

/// In-process loader backed by a factory table.
#[derive(Default)]
pub struct FactoryLoader {
    factories: Mutex<HashMap<ServiceId, ServiceFactory>>,
    next_token: AtomicU64,
}

impl FactoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the constructor for a service id. Replaces any previous one.
    pub fn register<F>(&self, id: ServiceId, factory: F)
    where
        F: Fn() -> Box<dyn Service> + Send + Sync + 'static,
    {
        self.factories.lock().insert(id, Box::new(factory));
    }
}

impl ServiceLoader for FactoryLoader {
    fn load(&self, profile: &ServiceProfile, sink: &dyn InstanceSink) -> Result<CodeHandle> {
        let instance = {
            let factories = self.factories.lock();
            let factory = factories.get(&profile.id).ok_or_else(|| {
                Error::not_found(format!(
                    "no factory for service {} (code ref {})",
                    profile.id, profile.code_ref
                ))
            })?;
            factory()
        };

        if instance.id() != profile.id {
            return Err(Error::invalid_value(format!(
                "factory for service {} produced instance with id {}",
                profile.id,
                instance.id()
            )));
        }

        if !sink.install(instance) {
            tracing::debug!("service {} instance already installed", profile.id);
        }
        tracing::info!("loaded code for service {} ({})", profile.id, profile.code_ref);

        Ok(CodeHandle {
            id: profile.id,
            code_ref: profile.code_ref.clone(),
            token: self.next_token.fetch_add(1, Ordering::Relaxed),
        })
    }

    fn unload(&self, handle: CodeHandle) {
        tracing::info!(
            "released code for service {} ({})",
            handle.id,
            handle.code_ref
        );
    }
}

impl std::fmt::Debug for FactoryLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryLoader")
            .field("factories", &self.factories.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NullService(ServiceId);

    #[async_trait]
    impl Service for NullService {
        fn id(&self) -> ServiceId {
            self.0
        }
        async fn on_start(&self) {}
        async fn on_stop(&self) {}
    }

    #[derive(Default)]
    struct RecordingSink {
        installed: Mutex<Vec<ServiceId>>,
    }

    impl InstanceSink for RecordingSink {
        fn install(&self, service: Box<dyn Service>) -> bool {
            self.installed.lock().push(service.id());
            true
        }
    }

    fn profile(id: i32) -> ServiceProfile {
        ServiceProfile {
            id: ServiceId::new(id).unwrap(),
            code_ref: format!("svc_{id}"),
            depends: Vec::new(),
            depend_timeout: std::time::Duration::from_millis(200),
            run_on_create: false,
            distributed: false,
            dump_level: 0,
            capability: String::new(),
            permission: String::new(),
            boot_phase: crate::profile::BootPhase::Other,
        }
    }

    #[test]
    fn load_runs_registration_side_effect() {
        let loader = FactoryLoader::new();
        let id = ServiceId::new(42).unwrap();
        loader.register(id, move || Box::new(NullService(id)));

        let sink = Arc::new(RecordingSink::default());
        let handle = loader.load(&profile(42), sink.as_ref()).unwrap();
        assert_eq!(handle.id(), id);
        assert_eq!(sink.installed.lock().as_slice(), &[id]);

        loader.unload(handle);
    }

    #[test]
    fn load_without_factory_fails() {
        let loader = FactoryLoader::new();
        let sink = RecordingSink::default();
        let err = loader.load(&profile(7), &sink).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(sink.installed.lock().is_empty());
    }

    #[test]
    fn mismatched_factory_id_rejected() {
        let loader = FactoryLoader::new();
        let id = ServiceId::new(5).unwrap();
        let other = ServiceId::new(6).unwrap();
        loader.register(id, move || Box::new(NullService(other)));

        let sink = RecordingSink::default();
        let err = loader.load(&profile(5), &sink).unwrap_err();
        assert!(matches!(err, Error::InvalidValue(_)));
    }
}
