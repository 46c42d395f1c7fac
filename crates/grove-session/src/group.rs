//! Process groups and the session's group registry.
//!
//! A process group is the set of application processes one spawn
//! process forked from one `start_group` call. Groups live in a slab
//! arena under stable integer ids; `name → id` and `pid → id` are plain
//! integer indices. The pid index is the one piece of state shared with
//! the reaper thread, so it sits behind a mutex; everything else belongs
//! to the main thread.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use slab::Slab;

use grove_common::StrMap;

/// Stable id of a process group within one session.
pub type GroupId = usize;

/// The app processes one spawn process started for one group.
pub struct ProcessGroup {
    /// Group name, unique within the session.
    pub name: String,
    /// Copy of the parameters the group was started with.
    pub params: StrMap,
    /// Pids of the local app processes, in launch order.
    pub pids: Vec<i32>,
}

/// Arena of process groups plus the lookup indices.
pub struct GroupRegistry {
    groups: Slab<ProcessGroup>,
    by_name: FxHashMap<String, GroupId>,
    by_pid: Arc<Mutex<FxHashMap<i32, GroupId>>>,
}

impl GroupRegistry {
    pub fn new() -> GroupRegistry {
        GroupRegistry {
            groups: Slab::new(),
            by_name: FxHashMap::default(),
            by_pid: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    /// Allocate a group and record its name in the index.
    pub fn insert(&mut self, name: &str, params: StrMap) -> GroupId {
        let id = self.groups.insert(ProcessGroup {
            name: name.to_string(),
            params,
            pids: Vec::new(),
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Record a launched app-proc pid in the group and the pid index.
    pub fn record_pid(&mut self, id: GroupId, pid: i32) {
        self.groups[id].pids.push(pid);
        self.by_pid.lock().insert(pid, id);
    }

    pub fn group(&self, id: GroupId) -> &ProcessGroup {
        &self.groups[id]
    }

    pub fn id_by_name(&self, name: &str) -> Option<GroupId> {
        self.by_name.get(name).copied()
    }

    /// Group owning `pid`, if any. Also usable from the reaper through
    /// [`pid_index`](Self::pid_index).
    pub fn id_by_pid(&self, pid: i32) -> Option<GroupId> {
        self.by_pid.lock().get(&pid).copied()
    }

    /// Total app procs recorded across all groups.
    pub fn total_pids(&self) -> usize {
        self.groups.iter().map(|(_, g)| g.pids.len()).sum()
    }

    /// Shared handle to the pid index for the reaper thread.
    pub fn pid_index(&self) -> Arc<Mutex<FxHashMap<i32, GroupId>>> {
        Arc::clone(&self.by_pid)
    }
}

impl Default for GroupRegistry {
    fn default() -> Self {
        GroupRegistry::new()
    }
}
