//! Top-level IPC router - routes by service, delegates to handlers.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::host::ServiceHost;
use crate::ipc::handlers;
use crate::registry::ServiceRegistry;
use crate::remote::RemoteHandle;
use crate::types::{CallerIdentity, Error, IpcConfig, Result, ServiceId};

/// Shared server-side state handed to every handler.
#[derive(Clone)]
pub struct IpcContext {
    pub registry: Arc<ServiceRegistry>,
    /// Present when this process also hosts services.
    pub host: Option<Arc<ServiceHost>>,
    pub ipc: IpcConfig,
}

impl std::fmt::Debug for IpcContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcContext")
            .field("has_host", &self.host.is_some())
            .finish()
    }
}

/// Per-connection state. Handles minted for a wire client live exactly as
/// long as its connection; killing them on disconnect is what delivers
/// "remote died" to the registry.
#[derive(Debug, Default)]
pub struct ConnState {
    pub minted: Vec<RemoteHandle>,
}

impl ConnState {
    /// Mint a handle bound to this connection's lifetime.
    pub fn mint(&mut self, descriptor: String) -> RemoteHandle {
        let handle = RemoteHandle::new(descriptor);
        self.minted.push(handle.clone());
        handle
    }

    /// Kill every handle exported over this connection.
    pub fn close(&mut self) {
        for handle in self.minted.drain(..) {
            handle.kill();
        }
    }
}

impl Drop for ConnState {
    // Covers early-return error paths in the connection handler.
    fn drop(&mut self) {
        self.close();
    }
}

/// Result from dispatching a request.
#[allow(missing_debug_implementations)]
pub enum DispatchResponse {
    /// Single response value (most endpoints).
    Single(Value),
    /// Streaming response - the server writes each value as a stream chunk,
    /// then stream-end when the sender closes.
    Stream(mpsc::Receiver<Value>),
}

/// Route an IPC request to the appropriate service handler.
pub async fn route_request(
    ctx: &IpcContext,
    conn: &mut ConnState,
    service: &str,
    method: &str,
    caller: CallerIdentity,
    body: Value,
) -> Result<DispatchResponse> {
    match service {
        "registry" => handlers::registry::handle(ctx, conn, method, caller, body).await,
        "host" => handlers::host::handle(ctx, method, caller, body).await,
        _ => Err(Error::not_found(format!("Unknown service: {}", service))),
    }
}

// =============================================================================
// Shared helpers - used by all handler modules
// =============================================================================

pub fn str_field(body: &Value, key: &str) -> Result<String> {
    body.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::invalid_value(format!("Missing required field: {}", key)))
}

pub fn bool_field(body: &Value, key: &str) -> bool {
    body.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

/// Parse a service id field, mapping range violations to `InvalidId`.
pub fn id_field(body: &Value, key: &str) -> Result<ServiceId> {
    let raw = body
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| Error::invalid_value(format!("Missing required field: {}", key)))?;
    // Values beyond i32 saturate and fail the range check like any other
    // out-of-range id.
    let raw = raw.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
    ServiceId::new(raw)
}

/// Caller identity from the request envelope. Absent metadata defaults to an
/// unprivileged caller.
pub fn parse_caller(request: &Value) -> CallerIdentity {
    let caller = request.get("caller");
    let uid = caller
        .and_then(|c| c.get("uid"))
        .and_then(|v| v.as_u64())
        .unwrap_or(10_000) as u32;
    let pid = caller
        .and_then(|c| c.get("pid"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as u32;
    let granted = caller
        .and_then(|c| c.get("granted"))
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    CallerIdentity { uid, pid, granted }
}
