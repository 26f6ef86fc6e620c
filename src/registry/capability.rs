//! System capability map.
//!
//! Capability names are declared in advance by the capability manifest and
//! individually flipped to "available" at runtime. Queries only see
//! available capabilities.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::profile::CapabilityDecl;
use crate::types::{Error, Result};

/// Declared capabilities and their availability.
#[derive(Debug, Default)]
pub struct CapabilityMap {
    max_name_len: usize,
    entries: Mutex<BTreeMap<String, bool>>,
}

impl CapabilityMap {
    /// Seed the map from manifest declarations. Names flagged
    /// register-on-startup become available immediately.
    pub fn new(decls: Vec<CapabilityDecl>, max_name_len: usize) -> Self {
        let mut entries = BTreeMap::new();
        for decl in decls {
            if decl.name.is_empty() || decl.name.len() > max_name_len {
                tracing::warn!("skipping malformed capability name {:?}", decl.name);
                continue;
            }
            entries.insert(decl.name, decl.register_on_startup);
        }
        Self {
            max_name_len,
            entries: Mutex::new(entries),
        }
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if name.is_empty() || name.len() > self.max_name_len {
            return Err(Error::invalid_value(format!(
                "capability name {:?} is empty or too long",
                name
            )));
        }
        Ok(())
    }

    /// Flip a declared capability to available. Undeclared names are
    /// rejected.
    pub fn mark_available(&self, name: &str) -> Result<()> {
        self.check_name(name)?;
        let mut entries = self.entries.lock();
        match entries.get_mut(name) {
            Some(available) => {
                *available = true;
                Ok(())
            }
            None => Err(Error::invalid_value(format!(
                "capability {:?} is not declared",
                name
            ))),
        }
    }

    /// Whether a capability is declared and available.
    pub fn is_available(&self, name: &str) -> bool {
        if self.check_name(name).is_err() {
            return false;
        }
        self.entries.lock().get(name).copied().unwrap_or(false)
    }

    /// All currently available capability names.
    pub fn available(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, available)| **available)
            .map(|(name, _)| name.clone())
            .collect()
    }
}
