// crates/core/src/lib.rs
pub mod codec;
pub mod discovery;
pub mod error;
pub mod parser;
pub mod paths;
pub mod protocol;
pub mod session;
pub mod types;

pub use codec::*;
pub use discovery::*;
pub use error::*;
pub use parser::*;
pub use protocol::*;
pub use session::*;
pub use types::*;
