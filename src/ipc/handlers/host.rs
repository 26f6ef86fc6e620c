//! Host service handler - the per-process control interface.

use serde_json::{json, Value};

use crate::ipc::dispatch::{id_field, str_field, DispatchResponse, IpcContext};
use crate::registry::types::HostControl;
use crate::types::{CallerIdentity, Error, Result};

pub async fn handle(
    ctx: &IpcContext,
    method: &str,
    caller: CallerIdentity,
    body: Value,
) -> Result<DispatchResponse> {
    caller.validate()?;
    if !caller.is_privileged() {
        return Err(Error::permission_denied(format!(
            "uid {} may not drive the service host",
            caller.uid
        )));
    }
    let host = ctx
        .host
        .as_ref()
        .ok_or_else(|| Error::not_found("this process hosts no services"))?;

    match method {
        "Start" => {
            let id = id_field(&body, "id")?;
            let started = host.start_service(id).await;
            Ok(DispatchResponse::Single(json!({ "started": started })))
        }

        "Stop" => {
            let id = id_field(&body, "id")?;
            let stopped = host.stop_service(id).await;
            Ok(DispatchResponse::Single(json!({ "stopped": stopped })))
        }

        "StartAsync" => {
            let id = id_field(&body, "id")?;
            host.spawn_start(id)?;
            Ok(DispatchResponse::Single(json!({ "scheduled": true })))
        }

        "Debug" => {
            let id = id_field(&body, "id")?;
            let handled = host.debug_service(id);
            Ok(DispatchResponse::Single(json!({ "handled": handled })))
        }

        "Test" => {
            let id = id_field(&body, "id")?;
            let handled = host.test_service(id);
            Ok(DispatchResponse::Single(json!({ "handled": handled })))
        }

        "Dump" => {
            let id = id_field(&body, "id")?;
            match host.dump_service(id) {
                Some(dump) => Ok(DispatchResponse::Single(json!({ "dump": dump }))),
                None => Err(Error::not_found(format!("service {id} is not hosted here"))),
            }
        }

        "OnAdd" => {
            let id = id_field(&body, "id")?;
            let device_id = str_field(&body, "device_id").unwrap_or_default();
            host.on_service_added(id, &device_id).await;
            Ok(DispatchResponse::Single(json!({ "relayed": true })))
        }

        "OnRemove" => {
            let id = id_field(&body, "id")?;
            let device_id = str_field(&body, "device_id").unwrap_or_default();
            host.on_service_removed(id, &device_id).await;
            Ok(DispatchResponse::Single(json!({ "relayed": true })))
        }

        "RecycleOnDemand" => {
            let id = id_field(&body, "id")?;
            let recycled = host.recycle_service(id).await;
            Ok(DispatchResponse::Single(json!({ "recycled": recycled })))
        }

        "HandoffBegin" => {
            let id = id_field(&body, "id")?;
            Ok(DispatchResponse::Single(json!({
                "accepted": host.handoff_begin(id),
            })))
        }

        "HandoffAfter" => {
            let begin = str_field(&body, "begin")?;
            let after = str_field(&body, "after")?;
            Ok(DispatchResponse::Single(json!({
                "accepted": host.handoff_after(&begin, &after),
            })))
        }

        _ => Err(Error::not_found(format!("Unknown host method: {}", method))),
    }
}
