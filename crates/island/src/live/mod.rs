// crates/island/src/live/mod.rs
pub mod manager;
pub mod state;
pub mod store;
pub mod watcher;

pub use manager::{ManagerConfig, SessionCommand, SessionManager, SessionManagerHandle};
pub use state::{ManagerError, SessionEvent, SessionSummary};
pub use store::{FileAction, ResumePlan, SessionStore};
pub use watcher::{start_watcher, FileEvent, WatcherHandle};
