//! Validated identifiers.
//!
//! Service ids live in a fixed numeric range; every operation rejects
//! out-of-range ids before touching any state.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::Error;

/// Root uid - always privileged.
pub const UID_ROOT: u32 = 0;
/// System uid - always privileged.
pub const UID_SYSTEM: u32 = 1000;

/// Upper bound for acceptable uids. Anything at or above this is treated as
/// malformed caller metadata rather than a real account.
const UID_CEILING: u32 = 10_000_000;

/// Identifier of a system service.
///
/// Wraps the raw integer and guarantees it is inside the valid range
/// `[ServiceId::MIN, ServiceId::MAX]`. Serde round-trips through the raw
/// integer and re-validates on deserialization.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "i32", into = "i32")]
pub struct ServiceId(i32);

impl ServiceId {
    /// Smallest valid service id.
    pub const MIN: i32 = 1;
    /// Largest valid service id.
    pub const MAX: i32 = 0x00FF_FFFF;

    /// Construct a validated service id.
    pub fn new(raw: i32) -> Result<Self, Error> {
        if (Self::MIN..=Self::MAX).contains(&raw) {
            Ok(Self(raw))
        } else {
            Err(Error::InvalidId(raw))
        }
    }

    /// The raw numeric id.
    pub const fn raw(self) -> i32 {
        self.0
    }
}

impl TryFrom<i32> for ServiceId {
    type Error = Error;

    fn try_from(raw: i32) -> Result<Self, Error> {
        Self::new(raw)
    }
}

impl From<ServiceId> for i32 {
    fn from(id: ServiceId) -> i32 {
        id.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the process invoking a control-interface operation.
///
/// Delivered by the transport alongside every request. `granted` carries the
/// permission strings the caller holds; attestation of those claims is the
/// transport's concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub uid: u32,
    pub pid: u32,
    #[serde(default)]
    pub granted: Vec<String>,
}

impl CallerIdentity {
    /// A privileged (system) caller for in-process clients.
    pub fn system(pid: u32) -> Self {
        Self {
            uid: UID_SYSTEM,
            pid,
            granted: Vec::new(),
        }
    }

    /// True for root/system callers.
    pub fn is_privileged(&self) -> bool {
        self.uid == UID_ROOT || self.uid == UID_SYSTEM
    }

    /// Reject malformed uid values before any operation runs.
    pub fn validate(&self) -> Result<(), Error> {
        if self.uid >= UID_CEILING {
            return Err(Error::invalid_value(format!(
                "uid {} out of range",
                self.uid
            )));
        }
        Ok(())
    }

    /// Whether this caller satisfies a record's permission string.
    pub fn satisfies(&self, permission: &str) -> bool {
        self.is_privileged()
            || permission.is_empty()
            || self.granted.iter().any(|p| p == permission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn accepts_range_bounds() {
        assert!(ServiceId::new(ServiceId::MIN).is_ok());
        assert!(ServiceId::new(ServiceId::MAX).is_ok());
        assert!(ServiceId::new(0).is_err());
        assert!(ServiceId::new(-1).is_err());
        assert!(ServiceId::new(ServiceId::MAX + 1).is_err());
    }

    #[test]
    fn serde_revalidates() {
        let id: ServiceId = serde_json::from_str("1301").unwrap();
        assert_eq!(id.raw(), 1301);
        assert!(serde_json::from_str::<ServiceId>("0").is_err());
        assert!(serde_json::from_str::<ServiceId>("16777216").is_err());
    }

    #[test]
    fn privileged_callers() {
        assert!(CallerIdentity::system(42).is_privileged());
        let app = CallerIdentity {
            uid: 10010,
            pid: 7,
            granted: vec!["servicehub.permission.MEDIA".into()],
        };
        assert!(!app.is_privileged());
        assert!(app.satisfies(""));
        assert!(app.satisfies("servicehub.permission.MEDIA"));
        assert!(!app.satisfies("servicehub.permission.TELEPHONY"));
    }

    #[test]
    fn uid_ceiling_rejected() {
        let bogus = CallerIdentity {
            uid: 99_999_999,
            pid: 1,
            granted: Vec::new(),
        };
        assert!(bogus.validate().is_err());
    }

    proptest! {
        #[test]
        fn out_of_range_never_constructs(raw in prop_oneof![
            i32::MIN..ServiceId::MIN,
            (ServiceId::MAX + 1)..i32::MAX,
        ]) {
            prop_assert!(ServiceId::new(raw).is_err());
        }

        #[test]
        fn in_range_round_trips(raw in ServiceId::MIN..=ServiceId::MAX) {
            let id = ServiceId::new(raw).unwrap();
            prop_assert_eq!(id.raw(), raw);
        }
    }
}
