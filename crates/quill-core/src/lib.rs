//! quill-core — shared ids, wire format, commands, and cryptographic
//! primitives. All other Quill crates depend on this one.

pub mod addr;
pub mod command;
pub mod config;
pub mod crypto;
pub mod ids;
pub mod wire;

pub use addr::{Invitation, RelayAddr};
pub use command::{Command, ErrorCode, MsgFlags, RelayMessage, Response};
pub use ids::{EntityId, QueueRole};
