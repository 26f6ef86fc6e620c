//! TCP+msgpack IPC transport for the control interface.
//!
//! Length-prefixed msgpack frames carry `{id, service, method, caller,
//! body}` request envelopes; responses are single values or streams
//! (connection events, local-manager control commands).

pub mod codec;
pub mod dispatch;
pub mod handlers;
pub mod server;

pub use dispatch::IpcContext;
pub use server::IpcServer;
