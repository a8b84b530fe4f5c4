//! # sheepdog-proto
//!
//! Protocol types, constants, and data structures for the sheepdog
//! block driver.
//!
//! This crate defines the client wire protocol, object ID addressing,
//! result codes, and the inode layout. It performs no I/O.

pub mod constants;
pub mod defaults;
pub mod error;
pub mod hash;
pub mod inode;
pub mod oid;
pub mod request;

// Re-export commonly used types at the crate root
pub use error::{SdError, SdResult};
pub use inode::SdInode;
pub use oid::ObjectId;
pub use request::{ObjRequest, Opcode, SdResponse, VdiRequest};
