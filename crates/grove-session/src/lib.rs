//! Everything that runs inside one spawn process of the grove launcher.
//!
//! ## Modules
//!
//! - [`topology`]: k-ary tree parent/child computation over ranks
//! - [`tree`]: the connected spawn tree and its collectives
//! - [`launch`]: fork/exec driver for spawn and application processes
//! - [`group`]: process groups and the pid/name registries
//! - [`reaper`]: background child-exit collector
//! - [`ring`]: ring neighbor discovery (double scan over the tree)
//! - [`pmi`]: minimal PMI key/value rendezvous for app procs
//! - [`config`]: `SPAWN_*` environment parsing at the root
//! - [`session`]: the per-process lifecycle tying it all together
//! - [`mpir`]: the process-wide debugger-attach symbols
//! - [`timing`]: phase timing for the launch critical path

pub mod config;
pub mod group;
pub mod launch;
pub mod mpir;
pub mod pmi;
pub mod reaper;
pub mod ring;
pub mod session;
pub mod timing;
pub mod topology;
pub mod tree;

pub use session::Session;
