// crates/island/src/rpc/mod.rs
pub mod client;
pub mod error;
pub mod launcher;

pub use client::{AgentCommand, EventSender, RpcClient, DEFAULT_RESPONSE_TIMEOUT};
pub use error::RpcError;
pub use launcher::{AgentConnection, AgentLauncher, LaunchOptions, ProcessLauncher};
