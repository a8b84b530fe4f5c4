//! # sheepdog-core
//!
//! Core shared library for the sheepdog block driver.
//! Provides async connections to sheep daemons over TCP or Unix-domain
//! sockets, and allocation queries over loaded inodes.

pub mod inode;
pub mod net;
pub mod socket_transport;
pub mod transport;
