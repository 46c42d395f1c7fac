//! TCP transport driver.
//!
//! The endpoint binds an ephemeral port on all interfaces and advertises
//! `tcp:<hostname>:<port>`, so the printable name is enough for any peer
//! that can resolve this host. Nagle is disabled on every channel; the
//! tree protocol is made of many small frames and latency on them is the
//! critical path of the whole launch.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};

use grove_common::{Result, SpawnError};

use crate::endpoint::TCP_PREFIX;

/// Listening TCP endpoint.
pub struct TcpEndpoint {
    listener: TcpListener,
    name: String,
}

impl TcpEndpoint {
    /// Bind an ephemeral port and build the printable name.
    pub fn open() -> Result<TcpEndpoint> {
        let listener = TcpListener::bind(("0.0.0.0", 0))
            .map_err(|e| SpawnError::transport(format!("failed to bind TCP endpoint: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| SpawnError::transport(format!("failed to read bound address: {e}")))?
            .port();
        let host = local_hostname()?;
        let name = format!("{TCP_PREFIX}{host}:{port}");
        Ok(TcpEndpoint { listener, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until a client connects.
    pub fn accept(&self) -> Result<TcpChannel> {
        let (stream, peer) = self
            .listener
            .accept()
            .map_err(|e| SpawnError::transport(format!("accept on `{}` failed: {e}", self.name)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| SpawnError::transport(format!("set_nodelay failed: {e}")))?;
        Ok(TcpChannel {
            stream: Some(stream),
            name: format!("{TCP_PREFIX}{peer}"),
        })
    }
}

/// One side of an established TCP channel.
#[derive(Debug)]
pub struct TcpChannel {
    /// `None` once disconnected.
    stream: Option<TcpStream>,
    name: String,
}

impl TcpChannel {
    /// Connect to a `tcp:<host>:<port>` address.
    pub fn connect(addr: &str) -> Result<TcpChannel> {
        let hostport = addr
            .strip_prefix(TCP_PREFIX)
            .ok_or_else(|| SpawnError::transport(format!("`{addr}` is not a TCP address")))?;
        let stream = TcpStream::connect(hostport)
            .map_err(|e| SpawnError::transport(format!("connect to `{addr}` failed: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| SpawnError::transport(format!("set_nodelay failed: {e}")))?;
        Ok(TcpChannel {
            stream: Some(stream),
            name: addr.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| SpawnError::transport(format!("channel to `{}` is closed", self.name)))
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let name = self.name.clone();
        self.stream()?
            .read_exact(buf)
            .map_err(|e| SpawnError::transport(format!("read from `{name}` failed: {e}")))
    }

    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let name = self.name.clone();
        self.stream()?
            .write_all(buf)
            .map_err(|e| SpawnError::transport(format!("write to `{name}` failed: {e}")))
    }

    pub fn disconnect(&mut self) {
        self.stream = None;
    }
}

/// Hostname of this machine, used to build printable TCP names.
pub fn local_hostname() -> Result<String> {
    let name = nix::unistd::gethostname()
        .map_err(|e| SpawnError::transport(format!("gethostname failed: {e}")))?;
    name.into_string()
        .map_err(|_| SpawnError::transport("hostname is not valid UTF-8"))
}
