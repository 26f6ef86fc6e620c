//! Configuration structures.
//!
//! Every polling interval and timeout the runtime uses is a named field here
//! rather than a constant buried in the code. Durations deserialize from
//! humantime strings ("200ms", "6s").

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Global configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Registry limits and data-file locations.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Host startup scheduling parameters.
    #[serde(default)]
    pub host: HostConfig,

    /// IPC transport configuration.
    #[serde(default)]
    pub ipc: IpcConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// IPC server bind address (TCP).
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:5510".to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Registry limits and external data files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Maximum number of registered services, on-demand routes, and local
    /// managers (each map is capped independently).
    pub max_services: usize,

    /// Maximum accepted length for listener and local-manager names.
    pub max_name_len: usize,

    /// Maximum accepted size of a capability descriptor in bytes.
    pub max_capability_bytes: usize,

    /// Maximum accepted length of a capability name.
    pub max_capability_name_len: usize,

    /// Core-service list; a fixed default set substitutes when unreadable.
    pub core_list_path: PathBuf,

    /// Capability manifest seeding the declared capability map.
    pub capability_manifest_path: PathBuf,

    /// Stable device identifier; generated when unset.
    pub device_id: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_services: 1000,
            max_name_len: 200,
            max_capability_bytes: 8192,
            max_capability_name_len: 64,
            core_list_path: PathBuf::from("/system/profile/core_services.json"),
            capability_manifest_path: PathBuf::from("/system/profile/capabilities.json"),
            device_id: None,
        }
    }
}

/// Host startup scheduling parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// How many times to retry reaching the registry at bootstrap before
    /// failing permanently.
    pub registry_wait_retries: u32,

    /// Pause between registry availability checks.
    #[serde(with = "humantime_serde")]
    pub registry_wait_interval: Duration,

    /// Pause between dependency visibility checks during phase startup.
    #[serde(with = "humantime_serde")]
    pub dep_check_interval: Duration,

    /// How many times to poll for an on-demand instance to appear after its
    /// code is loaded.
    pub ondemand_wait_retries: u32,

    /// Pause between on-demand instance polls.
    #[serde(with = "humantime_serde")]
    pub ondemand_wait_interval: Duration,

    /// Absolute ceiling on one boot phase; the phase is declared complete
    /// after this even if start tasks are still outstanding.
    #[serde(with = "humantime_serde")]
    pub phase_ceiling: Duration,

    /// Worker count per pool; 0 means available parallelism.
    pub pool_workers: usize,

    /// Maximum queued start tasks per pool.
    pub max_pending_tasks: usize,

    /// Directories a profile document must resolve under.
    pub profile_dirs: Vec<PathBuf>,

    /// Required profile file extension.
    pub profile_extension: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            registry_wait_retries: 50,
            registry_wait_interval: Duration::from_millis(200),
            dep_check_interval: Duration::from_millis(100),
            ondemand_wait_retries: 10,
            ondemand_wait_interval: Duration::from_millis(100),
            phase_ceiling: Duration::from_secs(100),
            pool_workers: 0,
            max_pending_tasks: 1000,
            profile_dirs: vec![
                PathBuf::from("/system/profile"),
                PathBuf::from("/system/usr"),
            ],
            profile_extension: "json".to_string(),
        }
    }
}

/// IPC transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Maximum frame payload size in bytes.
    pub max_frame_bytes: u32,

    /// Bounded channel capacity for streaming responses (Connect,
    /// AddLocalManager).
    pub stream_channel_capacity: usize,

    /// Maximum concurrent TCP connections; excess connections are rejected.
    pub max_connections: usize,

    /// Read timeout in seconds per frame. Connections idle beyond this
    /// duration are dropped.
    pub read_timeout_secs: u64,

    /// Write timeout in seconds per frame. Slow consumers that cannot
    /// accept a response within this window are dropped.
    pub write_timeout_secs: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 1024 * 1024,
            stream_channel_capacity: 64,
            max_connections: 1000,
            read_timeout_secs: 300,
            write_timeout_secs: 10,
        }
    }
}
