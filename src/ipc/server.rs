//! TCP IPC server - accept loop and per-connection handler.
//!
//! Handles minted for a connection (published services, attached local
//! managers) are killed when the connection closes; that is how "remote
//! died" reaches the registry for wire clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::ipc::codec::{read_frame, write_frame, FrameKind};
use crate::ipc::dispatch::{self, ConnState, DispatchResponse, IpcContext};

/// Encode a JSON value to msgpack. Logs and returns an error on failure
/// instead of silently producing an empty vec.
fn encode_msgpack(value: &serde_json::Value) -> std::io::Result<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(|e| {
        tracing::error!("msgpack encoding failed: {}", e);
        std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
    })
}

/// IPC server exposing the control interface.
#[derive(Debug)]
pub struct IpcServer {
    ctx: IpcContext,
    addr: SocketAddr,
    cancel: CancellationToken,
}

impl IpcServer {
    pub fn new(ctx: IpcContext, addr: SocketAddr) -> Self {
        Self {
            ctx,
            addr,
            cancel: CancellationToken::new(),
        }
    }

    /// Run the server until cancelled or a fatal error occurs.
    pub async fn serve(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        let conn_semaphore = Arc::new(Semaphore::new(self.ctx.ipc.max_connections));
        tracing::info!(
            "IPC server listening on {} (max_connections={})",
            self.addr,
            self.ctx.ipc.max_connections,
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("IPC server shutting down");
                    break;
                }
                accept = listener.accept() => {
                    let (stream, peer) = accept?;

                    let permit = match conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::warn!(
                                "connection from {} rejected: at max_connections ({})",
                                peer,
                                self.ctx.ipc.max_connections,
                            );
                            drop(stream);
                            continue;
                        }
                    };

                    tracing::debug!("IPC connection from {}", peer);
                    let ctx = self.ctx.clone();
                    let cancel = self.cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, ctx, cancel, permit).await {
                            tracing::warn!("connection from {} error: {}", peer, e);
                        }
                    });
                }
            }
        }
        Ok(())
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Handle a single TCP connection: read frames -> dispatch -> write
/// responses. Exported handles die with the connection.
async fn handle_connection(
    stream: tokio::net::TcpStream,
    ctx: IpcContext,
    cancel: CancellationToken,
    _permit: OwnedSemaphorePermit, // held for connection lifetime
) -> std::io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let read_timeout = Duration::from_secs(ctx.ipc.read_timeout_secs);
    let write_timeout = Duration::from_secs(ctx.ipc.write_timeout_secs);
    let mut conn = ConnState::default();

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            frame_result = tokio::time::timeout(read_timeout, read_frame(&mut reader, ctx.ipc.max_frame_bytes)) => {
                let frame = match frame_result {
                    Err(_elapsed) => {
                        tracing::debug!("read timeout ({}s), dropping connection", ctx.ipc.read_timeout_secs);
                        break Ok(());
                    }
                    Ok(Err(e)) => break Err(e),
                    Ok(Ok(None)) => break Ok(()), // clean EOF
                    Ok(Ok(Some(frame))) => frame,
                };

                let (kind, payload) = frame;
                if kind != FrameKind::Request {
                    let err_payload = serde_json::json!({
                        "id": "",
                        "ok": false,
                        "error": {
                            "code": "INVALID_ARGUMENT",
                            "message": format!("Unexpected frame kind: {:?}", kind),
                        }
                    });
                    let encoded = encode_msgpack(&err_payload)?;
                    timed_write(&mut writer, FrameKind::Error, &encoded, write_timeout).await?;
                    continue;
                }

                let request: serde_json::Value = match rmp_serde::from_slice(&payload) {
                    Ok(v) => v,
                    Err(e) => {
                        let err_payload = serde_json::json!({
                            "id": "",
                            "ok": false,
                            "error": {
                                "code": "INVALID_ARGUMENT",
                                "message": format!("Invalid msgpack: {}", e),
                            }
                        });
                        let encoded = encode_msgpack(&err_payload)?;
                        timed_write(&mut writer, FrameKind::Error, &encoded, write_timeout).await?;
                        continue;
                    }
                };

                let request_id = request.get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                let service = request.get("service")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                let method = request.get("method")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                let caller = dispatch::parse_caller(&request);
                let body = request.get("body")
                    .cloned()
                    .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));

                let result = dispatch::route_request(&ctx, &mut conn, service, method, caller, body).await;

                match result {
                    Ok(DispatchResponse::Single(response_body)) => {
                        let response = serde_json::json!({
                            "id": request_id,
                            "ok": true,
                            "body": response_body,
                        });
                        let encoded = encode_msgpack(&response)?;
                        timed_write(&mut writer, FrameKind::Response, &encoded, write_timeout).await?;
                    }
                    Ok(DispatchResponse::Stream(mut rx)) => {
                        // Stream chunks until the sender closes.
                        while let Some(chunk) = rx.recv().await {
                            let frame = serde_json::json!({
                                "id": request_id,
                                "body": chunk,
                            });
                            let encoded = encode_msgpack(&frame)?;
                            timed_write(&mut writer, FrameKind::StreamChunk, &encoded, write_timeout).await?;
                        }
                        let end = serde_json::json!({ "id": request_id });
                        let encoded = encode_msgpack(&end)?;
                        timed_write(&mut writer, FrameKind::StreamEnd, &encoded, write_timeout).await?;
                    }
                    Err(e) => {
                        let response = serde_json::json!({
                            "id": request_id,
                            "ok": false,
                            "error": {
                                "code": e.to_ipc_error_code(),
                                "message": e.to_string(),
                            }
                        });
                        let encoded = encode_msgpack(&response)?;
                        timed_write(&mut writer, FrameKind::Error, &encoded, write_timeout).await?;
                    }
                }
            }
        }
    };

    // Everything this connection exported is now unreachable.
    conn.close();
    result
}

/// Write a frame with a timeout. Returns an error if the write takes too
/// long (prevents slow consumers from holding connections indefinitely).
async fn timed_write<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    kind: FrameKind,
    payload: &[u8],
    timeout: Duration,
) -> std::io::Result<()> {
    tokio::time::timeout(timeout, write_frame(writer, kind, payload))
        .await
        .map_err(|_| {
            tracing::warn!("write timeout ({}s), dropping connection", timeout.as_secs());
            std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout")
        })?
}
