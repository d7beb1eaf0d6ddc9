// crates/island/src/lib.rs
//! pi-island: drives `pi --mode rpc` agents and reconciles them with the
//! session logs on disk.

pub mod auth;
pub mod config;
pub mod live;
pub mod rpc;

pub use config::{AppConfig, ConfigError};
pub use live::{SessionEvent, SessionManager, SessionManagerHandle, SessionSummary};
pub use rpc::{ProcessLauncher, RpcClient, RpcError};
