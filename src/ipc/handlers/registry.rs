//! Registry service handler - the system-wide control interface.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::ipc::dispatch::{
    bool_field, id_field, str_field, ConnState, DispatchResponse, IpcContext,
};
use crate::registry::types::{ConnectionCallback, CoreListMode, HostControl, PublishOptions};
use crate::remote::RemoteHandle;
use crate::types::{CallerIdentity, Error, Result, ServiceId};

pub async fn handle(
    ctx: &IpcContext,
    conn: &mut ConnState,
    method: &str,
    caller: CallerIdentity,
    body: Value,
) -> Result<DispatchResponse> {
    let registry = &ctx.registry;
    match method {
        "GetService" | "CheckService" => {
            let id = id_field(&body, "id")?;
            // Cross-device lookup is not forwarded; only the local device
            // resolves.
            if let Some(device) = body.get("device_id").and_then(|v| v.as_str()) {
                if device != registry.device_id() {
                    tracing::debug!("lookup of {} on remote device {} not forwarded", id, device);
                    return Ok(DispatchResponse::Single(handle_value(None)));
                }
            }
            let handle = registry.check_service(id, &caller)?;
            Ok(DispatchResponse::Single(handle_value(handle)))
        }

        "CheckServiceNow" => {
            let id = id_field(&body, "id")?;
            let (handle, exists) = registry.check_service_now(id, &caller).await?;
            let mut value = handle_value(handle);
            if let Value::Object(map) = &mut value {
                map.insert("exists".to_string(), Value::Bool(exists));
            }
            Ok(DispatchResponse::Single(value))
        }

        "AddService" => {
            let id = id_field(&body, "id")?;
            let opts = PublishOptions {
                distributed: bool_field(&body, "distributed"),
                capability: body
                    .get("capability")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                permission: body
                    .get("permission")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
            };
            // dump_flags accepted for contract compatibility; diagnostics
            // derive from the record itself.
            let _ = body.get("dump_flags");

            let handle = RemoteHandle::new(format!("ipc:{}:service:{}", caller.pid, id));
            registry
                .add_service(id, handle.clone(), opts, &caller)
                .await?;
            conn.minted.push(handle.clone());
            Ok(DispatchResponse::Single(json!({
                "published": true,
                "token": handle.token(),
            })))
        }

        "RemoveService" => {
            let id = id_field(&body, "id")?;
            registry.remove_service(id, &caller).await?;
            Ok(DispatchResponse::Single(json!({ "removed": true })))
        }

        "ListServices" => {
            let dump_flags = body.get("dump_flags").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
            let ids: Vec<i32> = registry
                .list_services(dump_flags)
                .into_iter()
                .map(ServiceId::raw)
                .collect();
            let mut response = json!({ "services": ids });
            if dump_flags != 0 {
                if let Value::Object(map) = &mut response {
                    map.insert("dump".to_string(), json!(registry.dump_services()));
                }
            }
            Ok(DispatchResponse::Single(response))
        }

        "Subscribe" => {
            let id = id_field(&body, "id")?;
            let listener = str_field(&body, "listener")?;
            registry.subscribe(id, &listener).await?;
            Ok(DispatchResponse::Single(json!({ "subscribed": true })))
        }

        "Unsubscribe" => {
            let id = id_field(&body, "id")?;
            let listener = str_field(&body, "listener")?;
            registry.unsubscribe(id, &listener)?;
            Ok(DispatchResponse::Single(json!({ "unsubscribed": true })))
        }

        "AddOnDemandRoute" => {
            let id = id_field(&body, "id")?;
            let owner = str_field(&body, "owner")?;
            registry.add_on_demand_route(id, &owner, &caller)?;
            Ok(DispatchResponse::Single(json!({ "added": true })))
        }

        "CheckOnDemandRoute" => {
            let id = id_field(&body, "id")?;
            Ok(DispatchResponse::Single(json!({
                "owner": registry.check_on_demand_route(id),
            })))
        }

        "RecycleOnDemandServices" => {
            registry.recycle_on_demand_services(&caller).await?;
            Ok(DispatchResponse::Single(json!({ "recycled": true })))
        }

        "Connect" => {
            let id = id_field(&body, "id")?;
            let (tx, rx) = mpsc::channel(ctx.ipc.stream_channel_capacity);
            registry
                .connect(id, Arc::new(StreamConnectionCallback { tx }))
                .await?;
            Ok(DispatchResponse::Stream(rx))
        }

        "Disconnect" => {
            let id = id_field(&body, "id")?;
            registry.disconnect(id).await?;
            Ok(DispatchResponse::Single(json!({ "disconnected": true })))
        }

        "AddLocalManager" => {
            let name = str_field(&body, "name")?;
            let (tx, rx) = mpsc::channel(ctx.ipc.stream_channel_capacity);
            let handle = RemoteHandle::new(format!("ipc:{}:manager:{}", caller.pid, name));
            registry
                .attach_local_manager(
                    &name,
                    handle.clone(),
                    Arc::new(StreamHostControl { tx }),
                    &caller,
                )
                .await?;
            conn.minted.push(handle);
            Ok(DispatchResponse::Stream(rx))
        }

        "CheckLocalManager" => {
            let name = str_field(&body, "name")?;
            let handle = registry.check_local_manager(&name, &caller)?;
            Ok(DispatchResponse::Single(handle_value(handle)))
        }

        "RemoveLocalManager" => {
            let name = str_field(&body, "name")?;
            registry.remove_local_manager(&name, &caller)?;
            Ok(DispatchResponse::Single(json!({ "removed": true })))
        }

        "GetDeviceId" => Ok(DispatchResponse::Single(json!({
            "device_id": registry.device_id(),
        }))),

        "GetCoreServiceList" => {
            let mode = parse_core_mode(&body)?;
            let ids: Vec<i32> = registry
                .core_service_list(mode)
                .into_iter()
                .map(ServiceId::raw)
                .collect();
            Ok(DispatchResponse::Single(json!({ "services": ids })))
        }

        "AddCapability" => {
            let name = str_field(&body, "name")?;
            registry.add_capability(&name)?;
            Ok(DispatchResponse::Single(json!({ "added": true })))
        }

        "HasCapability" => {
            let name = str_field(&body, "name")?;
            Ok(DispatchResponse::Single(json!({
                "available": registry.has_capability(&name),
            })))
        }

        "ListAvailableCapabilities" => Ok(DispatchResponse::Single(json!({
            "capabilities": registry.available_capabilities(),
        }))),

        _ => Err(Error::not_found(format!("Unknown registry method: {}", method))),
    }
}

// =============================================================================
// Registry-specific helpers
// =============================================================================

fn handle_value(handle: Option<RemoteHandle>) -> Value {
    match handle {
        Some(handle) => json!({
            "found": true,
            "handle": handle.descriptor(),
            "token": handle.token(),
        }),
        None => json!({ "found": false, "handle": null, "token": null }),
    }
}

fn parse_core_mode(body: &Value) -> Result<CoreListMode> {
    let mode = body.get("mode").and_then(|v| v.as_str()).unwrap_or("all");
    match mode {
        "all" => Ok(CoreListMode::All),
        "registered" => Ok(CoreListMode::RegisteredOnly),
        "unregistered" => Ok(CoreListMode::UnregisteredOnly),
        other => Err(Error::invalid_value(format!(
            "unknown core list mode: {other}"
        ))),
    }
}

/// Relays connection events to a wire client as stream chunks. The stream
/// closes when the callback is dropped (fulfilled or disconnected).
struct StreamConnectionCallback {
    tx: mpsc::Sender<Value>,
}

#[async_trait]
impl ConnectionCallback for StreamConnectionCallback {
    async fn on_connected(&self, id: ServiceId, handle: RemoteHandle) {
        let event = json!({
            "event": "connected",
            "id": id.raw(),
            "handle": handle.descriptor(),
            "token": handle.token(),
        });
        if self.tx.send(event).await.is_err() {
            tracing::debug!("connection watcher for {} went away", id);
        }
    }

    async fn on_disconnected(&self, id: ServiceId) {
        let event = json!({ "event": "disconnected", "id": id.raw() });
        if self.tx.send(event).await.is_err() {
            tracing::debug!("connection watcher for {} went away", id);
        }
    }
}

/// Relays delegated control commands to a wire-attached local manager as
/// stream chunks.
struct StreamHostControl {
    tx: mpsc::Sender<Value>,
}

impl StreamHostControl {
    async fn push(&self, command: Value) {
        if self.tx.send(command).await.is_err() {
            tracing::debug!("local manager stream went away");
        }
    }
}

#[async_trait]
impl HostControl for StreamHostControl {
    async fn start_service_async(&self, id: ServiceId) {
        self.push(json!({ "command": "StartAsync", "id": id.raw() }))
            .await;
    }

    async fn stop_service(&self, id: ServiceId) -> bool {
        self.push(json!({ "command": "Stop", "id": id.raw() })).await;
        // Fire-and-forget over the stream; the host reports back via
        // RemoveService when it actually stops.
        false
    }

    async fn recycle_service(&self, id: ServiceId) -> bool {
        self.push(json!({ "command": "RecycleOnDemand", "id": id.raw() }))
            .await;
        false
    }

    async fn on_service_added(&self, id: ServiceId, device_id: &str) {
        self.push(json!({
            "command": "OnAdd",
            "id": id.raw(),
            "device_id": device_id,
        }))
        .await;
    }

    async fn on_service_removed(&self, id: ServiceId, device_id: &str) {
        self.push(json!({
            "command": "OnRemove",
            "id": id.raw(),
            "device_id": device_id,
        }))
        .await;
    }
}
