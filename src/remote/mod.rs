//! Remote handles - shared references to service endpoints.
//!
//! A `RemoteHandle` stands in for a reachable remote object: the registry
//! stores one per service record, hosting processes keep one per instance,
//! and lookup callers receive clones. The handle carries its own death
//! signal; `kill()` marks the endpoint permanently unreachable and wakes
//! every observer registered through the liveness module.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

struct HandleInner {
    token: u64,
    descriptor: String,
    death: CancellationToken,
}

/// Reference-counted handle to a remote service endpoint.
///
/// Clones share the same endpoint; `holders()` exposes the live clone count,
/// which the registry uses as its usage-tracking counter when deciding
/// whether an on-demand service is recyclable.
#[derive(Clone)]
pub struct RemoteHandle {
    inner: Arc<HandleInner>,
}

impl RemoteHandle {
    /// Create a handle for a new endpoint.
    pub fn new(descriptor: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                token: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
                descriptor: descriptor.into(),
                death: CancellationToken::new(),
            }),
        }
    }

    /// Process-unique identity of the endpoint. Stable across clones.
    pub fn token(&self) -> u64 {
        self.inner.token
    }

    /// Human-readable endpoint description (diagnostics only).
    pub fn descriptor(&self) -> &str {
        &self.inner.descriptor
    }

    /// Mark the endpoint permanently unreachable and notify observers.
    /// Idempotent.
    pub fn kill(&self) {
        self.inner.death.cancel();
    }

    /// Whether the endpoint is still reachable.
    pub fn is_alive(&self) -> bool {
        !self.inner.death.is_cancelled()
    }

    /// A token that resolves when the endpoint dies. Cloning the token does
    /// not count as holding the handle.
    pub fn death_signal(&self) -> CancellationToken {
        self.inner.death.clone()
    }

    /// Number of live clones of this handle.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether two handles refer to the same endpoint.
    pub fn same_endpoint(&self, other: &RemoteHandle) -> bool {
        self.inner.token == other.inner.token
    }
}

impl PartialEq for RemoteHandle {
    fn eq(&self, other: &Self) -> bool {
        self.same_endpoint(other)
    }
}

impl Eq for RemoteHandle {}

impl fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("token", &self.inner.token)
            .field("descriptor", &self.inner.descriptor)
            .field("alive", &self.is_alive())
            .finish()
    }
}
