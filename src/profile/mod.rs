//! Service profile documents and related external inputs.
//!
//! Three inputs feed the runtime:
//!   - **Profile document**: one entry per hosted service (code ref,
//!     dependencies, boot phase, permissions, ...)
//!   - **Capability manifest**: declared capability names with an optional
//!     register-on-startup flag
//!   - **Core-service list**: ids considered mandatory for system readiness,
//!     with a fixed default set when the file is unreadable

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::{Error, Result, ServiceId};

/// Dependency-timeout clamp bounds and default, in milliseconds.
pub const MIN_DEPEND_TIMEOUT_MS: u64 = 200;
pub const MAX_DEPEND_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_DEPEND_TIMEOUT_MS: u64 = 6_000;

/// Core-service ids substituted when the configured list is unreadable.
pub const DEFAULT_CORE_SERVICES: &[i32] = &[301, 401, 511, 1202, 1301, 1501];

// =============================================================================
// Boot Phase
// =============================================================================

/// Startup stage of a hosted service. Phases run strictly in declaration
/// order: Boot, then Core, then Other.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum BootPhase {
    Boot,
    Core,
    #[default]
    Other,
}

impl BootPhase {
    /// Profile tag names; anything unrecognized lands in `Other`.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "BootStartPhase" => BootPhase::Boot,
            "CoreStartPhase" => BootPhase::Core,
            _ => BootPhase::Other,
        }
    }

    pub const ORDERED: [BootPhase; 3] = [BootPhase::Boot, BootPhase::Core, BootPhase::Other];
}

// =============================================================================
// Service Profile
// =============================================================================

/// Parsed per-service profile entry.
#[derive(Debug, Clone)]
pub struct ServiceProfile {
    pub id: ServiceId,
    /// Loadable-code reference resolved by the service loader.
    pub code_ref: String,
    /// Dependency ids, in declaration order; repeats are preserved.
    pub depends: Vec<ServiceId>,
    /// Clamped dependency wait bound.
    pub depend_timeout: Duration,
    pub run_on_create: bool,
    pub distributed: bool,
    pub dump_level: u32,
    /// Capability descriptor (JSON text, may be empty).
    pub capability: String,
    pub permission: String,
    pub boot_phase: BootPhase,
}

/// Raw serde shape of one profile entry.
#[derive(Debug, Deserialize)]
struct ProfileEntry {
    id: i32,
    code_ref: String,
    #[serde(default)]
    depends: Vec<i32>,
    #[serde(default)]
    depend_timeout_ms: u64,
    #[serde(default)]
    run_on_create: bool,
    #[serde(default)]
    distributed: bool,
    #[serde(default)]
    dump_level: u32,
    #[serde(default)]
    capability: String,
    #[serde(default, alias = "def_permission")]
    permission: String,
    #[serde(default)]
    boot_phase: String,
}

/// A whole profile document: the hosting process plus its services.
#[derive(Debug, Clone)]
pub struct ProcessProfile {
    pub process: String,
    pub services: Vec<ServiceProfile>,
}

#[derive(Debug, Deserialize)]
struct ProfileDocument {
    process: String,
    services: Vec<ProfileEntry>,
}

/// Clamp a declared dependency timeout into the accepted window.
/// Zero (absent) picks the default.
pub fn clamp_depend_timeout(ms: u64) -> Duration {
    let ms = if ms == 0 {
        DEFAULT_DEPEND_TIMEOUT_MS
    } else {
        ms.clamp(MIN_DEPEND_TIMEOUT_MS, MAX_DEPEND_TIMEOUT_MS)
    };
    Duration::from_millis(ms)
}

/// Parse a profile document from disk.
pub fn load_profiles(path: &Path) -> Result<ProcessProfile> {
    let text = std::fs::read_to_string(path)?;
    let doc: ProfileDocument = serde_json::from_str(&text)?;
    if doc.process.is_empty() {
        return Err(Error::invalid_value("profile process name is empty"));
    }

    let mut services = Vec::with_capacity(doc.services.len());
    for entry in doc.services {
        let id = ServiceId::new(entry.id)?;
        if entry.code_ref.is_empty() {
            return Err(Error::invalid_value(format!(
                "service {} has no code reference",
                id
            )));
        }
        let mut depends = Vec::with_capacity(entry.depends.len());
        for dep in entry.depends {
            match ServiceId::new(dep) {
                Ok(dep) => depends.push(dep),
                // A bad dependency id cannot be waited on; drop it with a
                // warning rather than rejecting the whole document.
                Err(_) => tracing::warn!("service {}: dependency id {} is invalid", id, dep),
            }
        }
        services.push(ServiceProfile {
            id,
            code_ref: entry.code_ref,
            depends,
            depend_timeout: clamp_depend_timeout(entry.depend_timeout_ms),
            run_on_create: entry.run_on_create,
            distributed: entry.distributed,
            dump_level: entry.dump_level,
            capability: entry.capability,
            permission: entry.permission,
            boot_phase: BootPhase::from_tag(&entry.boot_phase),
        });
    }

    Ok(ProcessProfile {
        process: doc.process,
        services,
    })
}

/// Validate a profile path before any registry interaction: it must resolve
/// under one of the allowed directories and carry the expected extension.
pub fn validate_profile_path(
    path: &Path,
    allowed_dirs: &[PathBuf],
    extension: &str,
) -> Result<PathBuf> {
    let resolved = path
        .canonicalize()
        .map_err(|e| Error::invalid_value(format!("profile path {}: {}", path.display(), e)))?;

    if resolved.extension().and_then(|e| e.to_str()) != Some(extension) {
        return Err(Error::invalid_value(format!(
            "profile {} must have .{} extension",
            resolved.display(),
            extension
        )));
    }

    let permitted = allowed_dirs.iter().any(|dir| {
        dir.canonicalize()
            .map(|d| resolved.starts_with(d))
            .unwrap_or(false)
    });
    if !permitted {
        return Err(Error::invalid_value(format!(
            "profile {} is outside the allowed profile directories",
            resolved.display()
        )));
    }

    Ok(resolved)
}

// =============================================================================
// Capability Manifest
// =============================================================================

/// One declared capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDecl {
    pub name: String,
    #[serde(default)]
    pub register_on_startup: bool,
}

#[derive(Debug, Deserialize)]
struct CapabilityManifest {
    capabilities: Vec<CapabilityDecl>,
}

/// Load the capability manifest; an unreadable manifest yields an empty set.
pub fn load_capability_manifest(path: &Path) -> Vec<CapabilityDecl> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!("capability manifest {} unreadable: {}", path.display(), e);
            return Vec::new();
        }
    };
    match serde_json::from_str::<CapabilityManifest>(&text) {
        Ok(manifest) => manifest.capabilities,
        Err(e) => {
            tracing::warn!("capability manifest {} malformed: {}", path.display(), e);
            Vec::new()
        }
    }
}

// =============================================================================
// Core-Service List
// =============================================================================

#[derive(Debug, Deserialize)]
struct CoreList {
    core_services: Vec<i32>,
}

/// Load the core-service list, substituting the fixed default set when the
/// file is unreadable or yields nothing usable.
pub fn load_core_services(path: &Path) -> Vec<ServiceId> {
    let parsed = std::fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str::<CoreList>(&text).ok())
        .map(|list| {
            list.core_services
                .into_iter()
                .filter_map(|raw| ServiceId::new(raw).ok())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    if parsed.is_empty() {
        tracing::warn!(
            "core-service list {} unusable, falling back to the default set",
            path.display()
        );
        return DEFAULT_CORE_SERVICES
            .iter()
            .filter_map(|raw| ServiceId::new(*raw).ok())
            .collect();
    }
    parsed
}
