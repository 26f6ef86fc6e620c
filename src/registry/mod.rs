//! System-wide service registry and its client seams.

pub mod api;
pub mod capability;
pub mod manager;
pub mod types;

pub use api::{
    LocalRegistryClient, LocalRegistryConnector, RegistryApi, RegistryConnector, RegistryLink,
};
pub use capability::CapabilityMap;
pub use manager::ServiceRegistry;
pub use types::{
    ConnectionCallback, CoreListMode, HostControl, HostEndpoint, PublishOptions,
    LOCAL_MANAGER_PREFIX,
};
