//! IPC integration tests - validates codec -> dispatch -> registry/host
//! round-trips over real TCP connections, including connection-bound handle
//! death and local-manager command streams.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use servicehub_core::host::ServiceHost;
use servicehub_core::ipc::codec::{write_frame, FrameKind};
use servicehub_core::ipc::{IpcContext, IpcServer};
use servicehub_core::loader::FactoryLoader;
use servicehub_core::registry::{LocalRegistryConnector, ServiceRegistry};
use servicehub_core::types::{CallerIdentity, HostConfig, IpcConfig, RegistryConfig};

/// Helper: spin up an IpcServer on a random port.
async fn start_test_server() -> (std::net::SocketAddr, Arc<ServiceRegistry>) {
    let dir = tempfile::tempdir().unwrap();
    let caps = dir.path().join("caps.json");
    std::fs::write(
        &caps,
        r#"{"capabilities": [
            {"name": "SystemCapability.Test.Wire", "register_on_startup": false}
        ]}"#,
    )
    .unwrap();
    let registry = ServiceRegistry::new(RegistryConfig {
        capability_manifest_path: caps,
        core_list_path: dir.path().join("core.json"),
        device_id: Some("wire-device".into()),
        ..RegistryConfig::default()
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let connector = Arc::new(LocalRegistryConnector::new(CallerIdentity::system(
        std::process::id(),
    )));
    connector.set_registry(registry.clone());
    let host = ServiceHost::new(
        HostConfig::default(),
        std::process::id(),
        Arc::new(FactoryLoader::new()),
        connector,
    );

    let ctx = IpcContext {
        registry: registry.clone(),
        host: Some(host),
        ipc: IpcConfig::default(),
    };
    tokio::spawn(async move {
        let server = IpcServer::new(ctx, addr);
        let _ = server.serve().await;
    });

    // Give the server a moment to bind.
    tokio::time::sleep(Duration::from_millis(100)).await;
    (addr, registry)
}

fn request(
    service: &str,
    method: &str,
    caller: serde_json::Value,
    body: serde_json::Value,
) -> serde_json::Value {
    serde_json::json!({
        "id": "test-1",
        "service": service,
        "method": method,
        "caller": caller,
        "body": body,
    })
}

fn system_caller() -> serde_json::Value {
    serde_json::json!({ "uid": 1000, "pid": 7, "granted": [] })
}

/// Read one frame: (kind, decoded payload).
async fn read_reply(stream: &mut TcpStream) -> (FrameKind, serde_json::Value) {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let frame_len = u32::from_be_bytes(len_buf) as usize;
    let mut frame_data = vec![0u8; frame_len];
    stream.read_exact(&mut frame_data).await.unwrap();

    let kind = FrameKind::from_byte(frame_data[0]).unwrap();
    let payload: serde_json::Value = rmp_serde::from_slice(&frame_data[1..]).unwrap();
    (kind, payload)
}

/// Helper: send a request frame, receive and decode the response.
async fn round_trip(
    stream: &mut TcpStream,
    service: &str,
    method: &str,
    caller: serde_json::Value,
    body: serde_json::Value,
) -> (FrameKind, serde_json::Value) {
    let payload = rmp_serde::to_vec_named(&request(service, method, caller, body)).unwrap();
    write_frame(stream, FrameKind::Request, &payload).await.unwrap();
    read_reply(stream).await
}

#[tokio::test]
async fn add_then_check_round_trip() {
    let (addr, _registry) = start_test_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let (kind, response) = round_trip(
        &mut stream,
        "registry",
        "AddService",
        system_caller(),
        serde_json::json!({ "id": 2001, "permission": "servicehub.permission.WIRE" }),
    )
    .await;
    assert_eq!(kind, FrameKind::Response);
    assert!(response["ok"].as_bool().unwrap());
    assert!(response["body"]["published"].as_bool().unwrap());

    // Privileged caller sees the handle.
    let (kind, response) = round_trip(
        &mut stream,
        "registry",
        "CheckService",
        system_caller(),
        serde_json::json!({ "id": 2001 }),
    )
    .await;
    assert_eq!(kind, FrameKind::Response);
    assert!(response["body"]["found"].as_bool().unwrap());

    // Unprivileged caller without the permission sees nothing - and no
    // existence leak.
    let (kind, response) = round_trip(
        &mut stream,
        "registry",
        "CheckService",
        serde_json::json!({ "uid": 10001, "pid": 9 }),
        serde_json::json!({ "id": 2001 }),
    )
    .await;
    assert_eq!(kind, FrameKind::Response);
    assert!(!response["body"]["found"].as_bool().unwrap());

    // With the permission granted, the handle is visible.
    let (_, response) = round_trip(
        &mut stream,
        "registry",
        "CheckService",
        serde_json::json!({ "uid": 10001, "pid": 9,
                            "granted": ["servicehub.permission.WIRE"] }),
        serde_json::json!({ "id": 2001 }),
    )
    .await;
    assert!(response["body"]["found"].as_bool().unwrap());
}

#[tokio::test]
async fn invalid_id_is_rejected_with_code() {
    let (addr, registry) = start_test_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    for method in ["CheckService", "AddService", "RemoveService", "Subscribe"] {
        let (kind, response) = round_trip(
            &mut stream,
            "registry",
            method,
            system_caller(),
            serde_json::json!({ "id": 0, "listener": "localservicehost7" }),
        )
        .await;
        assert_eq!(kind, FrameKind::Error, "method {method}");
        assert_eq!(response["error"]["code"].as_str().unwrap(), "INVALID_ID");
    }
    // Nothing was mutated by any of the rejected calls.
    assert!(registry.list_services(0).is_empty());
}

#[tokio::test]
async fn unknown_service_returns_error() {
    let (addr, _registry) = start_test_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let (kind, response) = round_trip(
        &mut stream,
        "nonexistent",
        "Foo",
        system_caller(),
        serde_json::json!({}),
    )
    .await;
    assert_eq!(kind, FrameKind::Error);
    assert!(!response["ok"].as_bool().unwrap());
    assert_eq!(response["error"]["code"].as_str().unwrap(), "NOT_FOUND");
}

#[tokio::test]
async fn device_id_and_capabilities() {
    let (addr, _registry) = start_test_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let (_, response) = round_trip(
        &mut stream,
        "registry",
        "GetDeviceId",
        system_caller(),
        serde_json::json!({}),
    )
    .await;
    assert_eq!(response["body"]["device_id"].as_str().unwrap(), "wire-device");

    let (_, response) = round_trip(
        &mut stream,
        "registry",
        "HasCapability",
        system_caller(),
        serde_json::json!({ "name": "SystemCapability.Test.Wire" }),
    )
    .await;
    assert!(!response["body"]["available"].as_bool().unwrap());

    let (_, response) = round_trip(
        &mut stream,
        "registry",
        "AddCapability",
        system_caller(),
        serde_json::json!({ "name": "SystemCapability.Test.Wire" }),
    )
    .await;
    assert!(response["body"]["added"].as_bool().unwrap());

    let (_, response) = round_trip(
        &mut stream,
        "registry",
        "ListAvailableCapabilities",
        system_caller(),
        serde_json::json!({}),
    )
    .await;
    assert_eq!(
        response["body"]["capabilities"][0].as_str().unwrap(),
        "SystemCapability.Test.Wire"
    );
}

#[tokio::test]
async fn connection_death_withdraws_exported_services() {
    let (addr, registry) = start_test_server().await;

    let mut publisher = TcpStream::connect(addr).await.unwrap();
    let (kind, _) = round_trip(
        &mut publisher,
        "registry",
        "AddService",
        system_caller(),
        serde_json::json!({ "id": 2101 }),
    )
    .await;
    assert_eq!(kind, FrameKind::Response);
    assert_eq!(registry.list_services(0).len(), 1);

    // Dropping the publishing connection kills its minted handle; the death
    // watch erases the record.
    drop(publisher);
    let deadline = Instant::now() + Duration::from_secs(5);
    while !registry.list_services(0).is_empty() {
        assert!(Instant::now() < deadline, "record survived its connection");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn local_manager_stream_receives_delegated_start() {
    let (addr, _registry) = start_test_server().await;

    // Attach a wire local manager; its response is a command stream.
    let mut manager = TcpStream::connect(addr).await.unwrap();
    let name = "localservicehost99";
    let payload = rmp_serde::to_vec_named(&request(
        "registry",
        "AddLocalManager",
        serde_json::json!({ "uid": 1000, "pid": 99 }),
        serde_json::json!({ "name": name }),
    ))
    .unwrap();
    write_frame(&mut manager, FrameKind::Request, &payload)
        .await
        .unwrap();

    // From a second connection, wait until the manager is attached, then
    // declare a route it owns and trigger an on-demand lookup.
    let mut client = TcpStream::connect(addr).await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let (_, response) = round_trip(
            &mut client,
            "registry",
            "CheckLocalManager",
            system_caller(),
            serde_json::json!({ "name": name }),
        )
        .await;
        if response["body"]["found"].as_bool().unwrap_or(false) {
            break;
        }
        assert!(Instant::now() < deadline, "manager never attached");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let (kind, response) = round_trip(
        &mut client,
        "registry",
        "AddOnDemandRoute",
        system_caller(),
        serde_json::json!({ "id": 2201, "owner": name }),
    )
    .await;
    assert_eq!(kind, FrameKind::Response, "{response}");

    let (kind, response) = round_trip(
        &mut client,
        "registry",
        "CheckServiceNow",
        system_caller(),
        serde_json::json!({ "id": 2201 }),
    )
    .await;
    assert_eq!(kind, FrameKind::Response);
    assert!(response["body"]["exists"].as_bool().unwrap());
    assert!(!response["body"]["found"].as_bool().unwrap());

    // The manager's stream carries the delegated start command.
    let (kind, chunk) = read_reply(&mut manager).await;
    assert_eq!(kind, FrameKind::StreamChunk);
    assert_eq!(chunk["body"]["command"].as_str().unwrap(), "StartAsync");
    assert_eq!(chunk["body"]["id"].as_i64().unwrap(), 2201);
}

#[tokio::test]
async fn host_service_drives_local_instances() {
    let (addr, _registry) = start_test_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // No instance for the id: starting reports false, dumping not-found.
    let (kind, response) = round_trip(
        &mut stream,
        "host",
        "Start",
        system_caller(),
        serde_json::json!({ "id": 2301 }),
    )
    .await;
    assert_eq!(kind, FrameKind::Response);
    assert!(!response["body"]["started"].as_bool().unwrap());

    let (kind, response) = round_trip(
        &mut stream,
        "host",
        "Dump",
        system_caller(),
        serde_json::json!({ "id": 2301 }),
    )
    .await;
    assert_eq!(kind, FrameKind::Error);
    assert_eq!(response["error"]["code"].as_str().unwrap(), "NOT_FOUND");

    // Handoff operations are accepted as-is.
    let (kind, response) = round_trip(
        &mut stream,
        "host",
        "HandoffAfter",
        system_caller(),
        serde_json::json!({ "begin": "svc-a", "after": "svc-b" }),
    )
    .await;
    assert_eq!(kind, FrameKind::Response);
    assert!(response["body"]["accepted"].as_bool().unwrap());

    // Unprivileged callers may not drive the host.
    let (kind, response) = round_trip(
        &mut stream,
        "host",
        "Start",
        serde_json::json!({ "uid": 10001, "pid": 3 }),
        serde_json::json!({ "id": 2301 }),
    )
    .await;
    assert_eq!(kind, FrameKind::Error);
    assert_eq!(
        response["error"]["code"].as_str().unwrap(),
        "PERMISSION_DENIED"
    );
}
