//! A minimal TFTP (RFC 1350) server.
//!
//! Clients read or write whole files in 512-byte blocks, each acknowledged before the next is
//! sent. Only octet mode is supported, there is no option negotiation, and nothing is ever
//! retransmitted: a lost packet stalls the transfer until the client gives up and starts over.
//!
//! Datagrams are handled one at a time by a [`server::Server`], which owns the socket and a
//! [`session::SessionTable`] holding one session per client address.

pub mod error;
pub mod processor;
pub mod server;
pub mod session;
pub mod storage;
pub mod tftp;

pub use error::TftpError;
pub use server::{Server, ServerConfig};
pub use storage::{FsStorage, Storage};
