//! Error taxonomy for the grove launcher.
//!
//! One enum covers the whole launcher. Errors carry a preformatted
//! message with whatever context the failure site had (peer address,
//! key name, errno text); callers add context with the constructor
//! helpers rather than wrapping in further layers.
//!
//! Policy: every error raised during the tree unfurl or the rendezvous
//! phases is fatal on the local spawn process. There is no retry and no
//! partial-success recovery; peers observe a dropped channel and fail in
//! turn.

use std::fmt;

/// Result alias used across the grove crates.
pub type Result<T> = std::result::Result<T, SpawnError>;

/// The launcher-wide error type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnError {
    /// A channel or endpoint operation failed: unreachable peer,
    /// unparseable address, short or failed transfer.
    Transport(String),
    /// A bad environment value or a missing required parameter.
    Config(String),
    /// A fork or exec failed.
    Launch(String),
    /// An unexpected message arrived on a tree channel.
    Protocol(String),
    /// A filesystem operation failed.
    Io(String),
}

impl SpawnError {
    /// Build a `Transport` error from a message.
    pub fn transport(msg: impl Into<String>) -> Self {
        SpawnError::Transport(msg.into())
    }

    /// Build a `Config` error from a message.
    pub fn config(msg: impl Into<String>) -> Self {
        SpawnError::Config(msg.into())
    }

    /// Build a `Launch` error from a message.
    pub fn launch(msg: impl Into<String>) -> Self {
        SpawnError::Launch(msg.into())
    }

    /// Build a `Protocol` error from a message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        SpawnError::Protocol(msg.into())
    }

    /// Build an `Io` error from a message.
    pub fn io(msg: impl Into<String>) -> Self {
        SpawnError::Io(msg.into())
    }

    /// Short tag naming the error kind, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            SpawnError::Transport(_) => "TransportError",
            SpawnError::Config(_) => "ConfigError",
            SpawnError::Launch(_) => "LaunchError",
            SpawnError::Protocol(_) => "ProtocolError",
            SpawnError::Io(_) => "IOError",
        }
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::Transport(msg)
            | SpawnError::Config(msg)
            | SpawnError::Launch(msg)
            | SpawnError::Protocol(msg)
            | SpawnError::Io(msg) => write!(f, "{}: {}", self.kind(), msg),
        }
    }
}

impl std::error::Error for SpawnError {}

impl From<std::io::Error> for SpawnError {
    fn from(err: std::io::Error) -> Self {
        SpawnError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_tag() {
        let err = SpawnError::config("SPAWN_SH must be either \"ssh\" or \"rsh\"");
        assert_eq!(
            err.to_string(),
            "ConfigError: SPAWN_SH must be either \"ssh\" or \"rsh\""
        );
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err: SpawnError = io.into();
        assert_eq!(err.kind(), "IOError");
    }

    #[test]
    fn kind_tags_cover_all_variants() {
        assert_eq!(SpawnError::transport("x").kind(), "TransportError");
        assert_eq!(SpawnError::launch("x").kind(), "LaunchError");
        assert_eq!(SpawnError::protocol("x").kind(), "ProtocolError");
    }
}
