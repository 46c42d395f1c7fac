//! Transport layer for the grove launcher.
//!
//! A spawn process talks to its parent, its children, and its local
//! application processes over [`Channel`]s: reliable, ordered, duplex
//! byte streams accepted on or connected to an [`Endpoint`]. Two
//! transport kinds are compiled in:
//!
//! - **TCP** (`tcp:<host>:<port>`) between hosts, and
//! - **FIFO** (`fifo:<path>`) for application rendezvous on the same
//!   node.
//!
//! The kind of a peer is inferred from its printable address prefix, so
//! a child process can open the matching endpoint kind knowing nothing
//! but its parent's address string.
//!
//! [`wire`] adds the message framing used on top of the byte streams:
//! length-prefixed strings and packed string maps.

pub mod endpoint;
pub mod fifo;
pub mod tcp;
pub mod wire;

pub use endpoint::{Channel, Endpoint, Transport};
