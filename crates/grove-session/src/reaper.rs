//! Background child reaper.
//!
//! One dedicated thread owns `waitpid(-1)` for the whole process: it
//! collects every exited child (tree children and app procs alike),
//! bumps the shared exited counter, and forwards an event on a channel.
//! The main thread shares nothing with it but that counter and the
//! pid→group index; the terminal wait at the end of a session is a
//! condvar wait on the counter rather than a poll of `waitpid`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::group::GroupId;

/// One reaped child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitEvent {
    pub pid: i32,
    /// Exit code, or 128 + signal number for a signaled child.
    pub status: i32,
}

struct Shared {
    exited: Mutex<usize>,
    wakeup: Condvar,
    shutdown: AtomicBool,
}

/// Handle to the reaper thread.
pub struct Reaper {
    shared: Arc<Shared>,
    events: Receiver<ExitEvent>,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    /// Start the reaper thread. `pid_index` is the session's pid→group
    /// index, read here only to label exit events in the log.
    pub fn start(pid_index: Arc<Mutex<FxHashMap<i32, GroupId>>>) -> Reaper {
        let shared = Arc::new(Shared {
            exited: Mutex::new(0),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let (tx, rx) = crossbeam_channel::unbounded();
        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("grove-reaper".to_string())
            .spawn(move || reap_loop(thread_shared, pid_index, tx))
            .expect("failed to spawn reaper thread");
        Reaper {
            shared,
            events: rx,
            handle: Some(handle),
        }
    }

    /// Number of children reaped so far.
    pub fn exited_count(&self) -> usize {
        *self.shared.exited.lock()
    }

    /// Block until at least `count` children have exited.
    pub fn wait_for(&self, count: usize) {
        let mut exited = self.shared.exited.lock();
        while *exited < count {
            self.shared.wakeup.wait(&mut exited);
        }
    }

    /// Drain the exit events collected so far.
    pub fn drain_events(&self) -> Vec<ExitEvent> {
        self.events.try_iter().collect()
    }

    /// Ask the thread to stop and join it. Only meaningful once every
    /// child has been reaped; a reaper blocked on live children keeps
    /// running until they exit.
    pub fn stop(mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn reap_loop(
    shared: Arc<Shared>,
    pid_index: Arc<Mutex<FxHashMap<i32, GroupId>>>,
    events: Sender<ExitEvent>,
) {
    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            return;
        }
        match waitpid(None::<nix::unistd::Pid>, None) {
            Ok(WaitStatus::Exited(pid, code)) => {
                record(&shared, &pid_index, &events, pid.as_raw(), code);
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                record(
                    &shared,
                    &pid_index,
                    &events,
                    pid.as_raw(),
                    128 + signal as i32,
                );
            }
            Ok(_) => {} // stop/continue events are not exits
            Err(Errno::ECHILD) => {
                // Nothing to wait for right now; children may be forked
                // later, so back off instead of spinning.
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(Errno::EINTR) => {}
            Err(err) => {
                tracing::error!(%err, "waitpid failed in reaper");
                return;
            }
        }
    }
}

fn record(
    shared: &Shared,
    pid_index: &Mutex<FxHashMap<i32, GroupId>>,
    events: &Sender<ExitEvent>,
    pid: i32,
    status: i32,
) {
    let group = pid_index.lock().get(&pid).copied();
    tracing::debug!(pid, status, ?group, "child exited");
    {
        let mut exited = shared.exited.lock();
        *exited += 1;
        shared.wakeup.notify_all();
    }
    let _ = events.send(ExitEvent { pid, status });
}

// The reaper owns waitpid(-1) for the whole process, so its tests live
// in their own integration binary (tests/reaper.rs) where no other test
// is waiting on children of its own.
