//! Endpoints and channels, dispatched over the compiled-in transports.
//!
//! `Endpoint` and `Channel` are enums over the per-transport types, the
//! way a stream that may or may not be wrapped is handled elsewhere in
//! this workspace: one match per operation, no trait objects. Adding a
//! transport means adding a variant and a prefix.

use std::fmt;

use grove_common::{Result, SpawnError};

use crate::fifo::{FifoChannel, FifoEndpoint};
use crate::tcp::{TcpChannel, TcpEndpoint};

/// Address prefix for the TCP transport.
pub const TCP_PREFIX: &str = "tcp:";
/// Address prefix for the local FIFO transport.
pub const FIFO_PREFIX: &str = "fifo:";

/// The transport kinds a channel or endpoint may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// TCP sockets, usable between hosts.
    Tcp,
    /// Named-pipe pairs, local to one host.
    Fifo,
}

impl Transport {
    /// Infer the transport kind from a printable address.
    pub fn infer(addr: &str) -> Result<Transport> {
        if addr.starts_with(TCP_PREFIX) {
            Ok(Transport::Tcp)
        } else if addr.starts_with(FIFO_PREFIX) {
            Ok(Transport::Fifo)
        } else {
            Err(SpawnError::transport(format!(
                "address `{addr}` has no known transport prefix"
            )))
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Fifo => write!(f, "fifo"),
        }
    }
}

/// A passive listener other spawn or application processes connect to.
pub enum Endpoint {
    Tcp(TcpEndpoint),
    Fifo(FifoEndpoint),
}

impl Endpoint {
    /// Open a listening endpoint of the given kind.
    pub fn open(kind: Transport) -> Result<Endpoint> {
        match kind {
            Transport::Tcp => Ok(Endpoint::Tcp(TcpEndpoint::open()?)),
            Transport::Fifo => Ok(Endpoint::Fifo(FifoEndpoint::open()?)),
        }
    }

    /// Printable address peers pass to [`Channel::connect`].
    pub fn name(&self) -> &str {
        match self {
            Endpoint::Tcp(ep) => ep.name(),
            Endpoint::Fifo(ep) => ep.name(),
        }
    }

    /// Block until a client connects, returning the new channel.
    pub fn accept(&self) -> Result<Channel> {
        let ch = match self {
            Endpoint::Tcp(ep) => Channel::Tcp(ep.accept()?),
            Endpoint::Fifo(ep) => Channel::Fifo(ep.accept()?),
        };
        tracing::debug!(endpoint = self.name(), peer = ch.name(), "accepted");
        Ok(ch)
    }
}

/// A reliable, ordered, duplex byte stream between two endpoints.
///
/// Reads and writes transfer exactly the requested number of bytes or
/// fail; no partial transfer is ever exposed. At most one reader and one
/// writer use a channel at a time.
pub enum Channel {
    Tcp(TcpChannel),
    Fifo(FifoChannel),
}

impl Channel {
    /// Connect to a peer endpoint by its printable address.
    pub fn connect(addr: &str) -> Result<Channel> {
        let ch = match Transport::infer(addr)? {
            Transport::Tcp => Channel::Tcp(TcpChannel::connect(addr)?),
            Transport::Fifo => Channel::Fifo(FifoChannel::connect(addr)?),
        };
        tracing::debug!(peer = addr, "connected");
        Ok(ch)
    }

    /// Printable name of the remote side.
    pub fn name(&self) -> &str {
        match self {
            Channel::Tcp(ch) => ch.name(),
            Channel::Fifo(ch) => ch.name(),
        }
    }

    /// Read exactly `buf.len()` bytes.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self {
            Channel::Tcp(ch) => ch.read_exact(buf),
            Channel::Fifo(ch) => ch.read_exact(buf),
        }
    }

    /// Write all of `buf`.
    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match self {
            Channel::Tcp(ch) => ch.write_all(buf),
            Channel::Fifo(ch) => ch.write_all(buf),
        }
    }

    /// Close the channel. Safe to call more than once; reads and writes
    /// after disconnect fail with a transport error.
    pub fn disconnect(&mut self) {
        match self {
            Channel::Tcp(ch) => ch.disconnect(),
            Channel::Fifo(ch) => ch.disconnect(),
        }
    }
}
