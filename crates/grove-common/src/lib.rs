//! Shared foundation for the grove launcher.
//!
//! This crate holds the two types every other grove crate speaks in:
//!
//! - [`SpawnError`]: the launcher-wide error taxonomy. Every failure in
//!   the tree unfurl, the app launch, or the rendezvous phases is one of
//!   its five kinds.
//! - [`StrMap`]: the insertion-ordered string map used both as the
//!   parameter container inside a spawn process and as the unit of
//!   transfer between them.

pub mod error;
pub mod strmap;

pub use error::{Result, SpawnError};
pub use strmap::StrMap;
