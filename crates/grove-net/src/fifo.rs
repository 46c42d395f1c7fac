//! Local FIFO transport driver.
//!
//! Used for the rendezvous between a spawn process and the application
//! processes it forked on the same node, where a TCP round through the
//! loopback stack is pure overhead.
//!
//! ## Rendezvous protocol
//!
//! The endpoint owns a control FIFO at a unique path under the system
//! temp directory and advertises `fifo:<control-path>`. A connecting
//! client creates its own pair of data FIFOs (`<stem>.c2s`, `<stem>.s2c`),
//! writes `<stem>\n` into the control FIFO, then opens client-to-server
//! for writing and server-to-client for reading. `accept` reads one stem
//! line, opens the pair from the other end, and unlinks both paths; FIFO
//! opens block until the counterpart arrives, so once both `accept` opens
//! return the client holds its descriptors too.
//!
//! The endpoint holds its control FIFO open read+write for its whole
//! life: the write half keeps reads from hitting EOF between clients,
//! and stem lines are shorter than `PIPE_BUF`, so concurrent client
//! writes land whole.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use parking_lot::Mutex;

use grove_common::{Result, SpawnError};

use crate::endpoint::FIFO_PREFIX;

/// Distinguishes FIFOs of concurrent endpoints and channels in one process.
static SEQ: AtomicU64 = AtomicU64::new(0);

fn make_fifo(path: &std::path::Path) -> Result<()> {
    mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
        .map_err(|e| SpawnError::transport(format!("mkfifo `{}` failed: {e}", path.display())))
}

/// Listening FIFO endpoint.
pub struct FifoEndpoint {
    control: Mutex<BufReader<File>>,
    control_path: PathBuf,
    name: String,
}

impl FifoEndpoint {
    /// Create the control FIFO and open it for the endpoint's lifetime.
    pub fn open() -> Result<FifoEndpoint> {
        let pid = nix::unistd::getpid();
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        let control_path = std::env::temp_dir().join(format!("grove-{pid}-{seq}.ctl"));
        make_fifo(&control_path)?;
        let control = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&control_path)
            .map_err(|e| {
                SpawnError::transport(format!(
                    "open control FIFO `{}` failed: {e}",
                    control_path.display()
                ))
            })?;
        let name = format!("{FIFO_PREFIX}{}", control_path.display());
        Ok(FifoEndpoint {
            control: Mutex::new(BufReader::new(control)),
            control_path,
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until a client announces itself on the control FIFO.
    pub fn accept(&self) -> Result<FifoChannel> {
        let mut control = self.control.lock();
        let mut line = String::new();
        control
            .read_line(&mut line)
            .map_err(|e| SpawnError::transport(format!("read on `{}` failed: {e}", self.name)))?;
        let stem = line.trim_end_matches('\n');
        if stem.is_empty() {
            return Err(SpawnError::transport(format!(
                "empty rendezvous line on `{}`",
                self.name
            )));
        }

        let c2s_path = PathBuf::from(format!("{stem}.c2s"));
        let s2c_path = PathBuf::from(format!("{stem}.s2c"));
        let reader = File::open(&c2s_path).map_err(|e| {
            SpawnError::transport(format!("open `{}` failed: {e}", c2s_path.display()))
        })?;
        let writer = OpenOptions::new().write(true).open(&s2c_path).map_err(|e| {
            SpawnError::transport(format!("open `{}` failed: {e}", s2c_path.display()))
        })?;

        // Both sides hold descriptors now; the names are no longer needed.
        let _ = std::fs::remove_file(&c2s_path);
        let _ = std::fs::remove_file(&s2c_path);

        Ok(FifoChannel {
            reader: Some(reader),
            writer: Some(writer),
            name: format!("{FIFO_PREFIX}{stem}"),
        })
    }
}

impl Drop for FifoEndpoint {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.control_path);
    }
}

/// One side of an established FIFO channel: a read FIFO and a write FIFO.
pub struct FifoChannel {
    reader: Option<File>,
    writer: Option<File>,
    name: String,
}

impl FifoChannel {
    /// Connect to a `fifo:<control-path>` address.
    pub fn connect(addr: &str) -> Result<FifoChannel> {
        let control_path = addr
            .strip_prefix(FIFO_PREFIX)
            .ok_or_else(|| SpawnError::transport(format!("`{addr}` is not a FIFO address")))?;

        let pid = nix::unistd::getpid();
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        let stem = format!("{control_path}.{pid}.{seq}");
        let c2s_path = PathBuf::from(format!("{stem}.c2s"));
        let s2c_path = PathBuf::from(format!("{stem}.s2c"));
        make_fifo(&c2s_path)?;
        make_fifo(&s2c_path)?;

        let mut control = OpenOptions::new()
            .write(true)
            .open(control_path)
            .map_err(|e| SpawnError::transport(format!("open `{control_path}` failed: {e}")))?;
        control
            .write_all(format!("{stem}\n").as_bytes())
            .map_err(|e| SpawnError::transport(format!("write to `{control_path}` failed: {e}")))?;
        drop(control);

        // Mirror image of accept's open order: our write-open of c2s
        // pairs with the server's read-open, then our read-open of s2c
        // pairs with its write-open.
        let writer = OpenOptions::new().write(true).open(&c2s_path).map_err(|e| {
            SpawnError::transport(format!("open `{}` failed: {e}", c2s_path.display()))
        })?;
        let reader = File::open(&s2c_path).map_err(|e| {
            SpawnError::transport(format!("open `{}` failed: {e}", s2c_path.display()))
        })?;

        Ok(FifoChannel {
            reader: Some(reader),
            writer: Some(writer),
            name: addr.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let name = self.name.clone();
        self.reader
            .as_mut()
            .ok_or_else(|| SpawnError::transport(format!("channel to `{name}` is closed")))?
            .read_exact(buf)
            .map_err(|e| SpawnError::transport(format!("read from `{name}` failed: {e}")))
    }

    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let name = self.name.clone();
        self.writer
            .as_mut()
            .ok_or_else(|| SpawnError::transport(format!("channel to `{name}` is closed")))?
            .write_all(buf)
            .map_err(|e| SpawnError::transport(format!("write to `{name}` failed: {e}")))
    }

    pub fn disconnect(&mut self) {
        self.reader = None;
        self.writer = None;
    }
}
