//! The spawn tree and its collectives.
//!
//! A [`SpawnTree`] is one process's view of the k-ary tree: an optional
//! channel to the parent and an ordered slot per child (rank, channel,
//! host, pid). Topology is fixed at construction; channels and pids are
//! filled in as the tree unfurls and torn down in reverse.
//!
//! Every collective here is blocking and synchronous: each process
//! participates exactly once per call, per-child work proceeds in child
//! index order, and one child's turn completes fully before the next
//! begins. Only one collective runs on a tree at a time.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use grove_common::{Result, SpawnError, StrMap};
use grove_net::{wire, Channel};

use crate::topology;

/// Byte carried by the signal waves. The value is never inspected.
const SIGNAL_BYTE: u8 = b'A';

/// Per-child state, filled in as the tree unfurls.
pub struct ChildSlot {
    /// Global rank of this child.
    pub rank: usize,
    /// Channel to the child, present once it has connected back.
    pub channel: Option<Channel>,
    /// Host the child was launched on.
    pub host: Option<String>,
    /// Pid of the local process that started the child (the remote
    /// shell client, or the child itself for a local launch).
    pub pid: Option<i32>,
}

/// One process's connection into the spawn tree.
pub struct SpawnTree {
    rank: usize,
    ranks: usize,
    parent: Option<Channel>,
    children: Vec<ChildSlot>,
}

impl SpawnTree {
    /// Compute the topology for `rank` and allocate empty child slots.
    pub fn new(rank: usize, ranks: usize, degree: usize) -> Result<SpawnTree> {
        let child_ranks = topology::children(rank, ranks, degree)?;
        let children = child_ranks
            .into_iter()
            .map(|rank| ChildSlot {
                rank,
                channel: None,
                host: None,
                pid: None,
            })
            .collect();
        Ok(SpawnTree {
            rank,
            ranks,
            parent: None,
            children,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn ranks(&self) -> usize {
        self.ranks
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Global rank of child slot `index`.
    pub fn child_rank(&self, index: usize) -> usize {
        self.children[index].rank
    }

    /// Child slots in child order.
    pub fn child_slots(&self) -> &[ChildSlot] {
        &self.children
    }

    /// Record the channel to the parent after connecting back to it.
    pub fn set_parent_channel(&mut self, ch: Channel) {
        self.parent = Some(ch);
    }

    /// Record where and how child `index` was launched.
    pub fn set_child_launch(&mut self, index: usize, host: String, pid: i32) {
        self.children[index].host = Some(host);
        self.children[index].pid = Some(pid);
    }

    /// Record the channel to child `index` after accepting it.
    pub fn set_child_channel(&mut self, index: usize, ch: Channel) {
        self.children[index].channel = Some(ch);
    }

    /// True for rank 0, the only rank without a parent.
    pub fn is_root(&self) -> bool {
        self.rank == 0
    }

    fn parent_channel(&mut self) -> Result<&mut Channel> {
        self.parent
            .as_mut()
            .ok_or_else(|| SpawnError::protocol("root has no parent channel"))
    }

    /// Send one map to the parent.
    pub fn send_map_to_parent(&mut self, map: &StrMap) -> Result<()> {
        wire::write_map(self.parent_channel()?, map)
    }

    /// Receive one map from the parent.
    pub fn recv_map_from_parent(&mut self) -> Result<StrMap> {
        wire::read_map(self.parent_channel()?)
    }

    /// Send one map to child slot `index`.
    pub fn send_map_to_child(&mut self, index: usize, map: &StrMap) -> Result<()> {
        wire::write_map(self.child_channel(index)?, map)
    }

    /// Receive one map from child slot `index`.
    pub fn recv_map_from_child(&mut self, index: usize) -> Result<StrMap> {
        wire::read_map(self.child_channel(index)?)
    }

    fn child_channel(&mut self, index: usize) -> Result<&mut Channel> {
        let rank = self.children[index].rank;
        self.children[index]
            .channel
            .as_mut()
            .ok_or_else(|| SpawnError::protocol(format!("no channel to child rank {rank}")))
    }

    /// Disconnect all channels, children first, then the parent.
    pub fn teardown(&mut self) {
        for slot in &mut self.children {
            if let Some(ch) = slot.channel.as_mut() {
                ch.disconnect();
            }
        }
        if let Some(ch) = self.parent.as_mut() {
            ch.disconnect();
        }
    }

    // ── Signal waves ─────────────────────────────────────────────────

    /// Absorb one byte from every child, then signal the parent. The
    /// root terminates the wave: once this returns there, every process
    /// in the tree has entered the call.
    pub fn signal_to_root(&mut self) -> Result<()> {
        let mut byte = [0u8; 1];
        for i in 0..self.children.len() {
            self.child_channel(i)?.read_exact(&mut byte)?;
        }
        if let Some(parent) = self.parent.as_mut() {
            parent.write_all(&[SIGNAL_BYTE])?;
        }
        Ok(())
    }

    /// Wait for the parent's signal, then release every child in order.
    /// Following a [`signal_to_root`](Self::signal_to_root) this
    /// completes a tree-wide barrier.
    pub fn signal_from_root(&mut self) -> Result<()> {
        if let Some(parent) = self.parent.as_mut() {
            let mut byte = [0u8; 1];
            parent.read_exact(&mut byte)?;
        }
        for i in 0..self.children.len() {
            self.child_channel(i)?.write_all(&[SIGNAL_BYTE])?;
        }
        Ok(())
    }

    // ── Broadcast / gather ───────────────────────────────────────────

    /// Broadcast a fixed-size byte block from the root. Non-roots
    /// receive into `buf` before forwarding.
    pub fn bcast_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        if let Some(parent) = self.parent.as_mut() {
            parent.read_exact(buf)?;
        }
        for i in 0..self.children.len() {
            self.child_channel(i)?.write_all(buf)?;
        }
        Ok(())
    }

    /// Broadcast a map from the root. Non-roots replace `map` with the
    /// received copy before forwarding, so after the call every process
    /// holds an identical map in identical entry order.
    pub fn bcast_map(&mut self, map: &mut StrMap) -> Result<()> {
        if let Some(parent) = self.parent.as_mut() {
            *map = wire::read_map(parent)?;
        }
        for i in 0..self.children.len() {
            wire::write_map(self.child_channel(i)?, map)?;
        }
        Ok(())
    }

    /// Gather maps toward the root: merge each child's map into `map`
    /// in child order (later keys overwrite earlier), then forward the
    /// merged map to the parent.
    pub fn gather_map(&mut self, map: &mut StrMap) -> Result<()> {
        for i in 0..self.children.len() {
            let child = wire::read_map(self.child_channel(i)?)?;
            map.merge(&child);
        }
        if let Some(parent) = self.parent.as_mut() {
            wire::write_map(parent, map)?;
        }
        Ok(())
    }

    /// Allgather: gather to the root, then broadcast the union back
    /// down. Every process ends with the root's merged map.
    pub fn allgather_map(&mut self, map: &mut StrMap) -> Result<()> {
        self.gather_map(map)?;
        self.bcast_map(map)
    }

    // ── Critical-path reduction ──────────────────────────────────────

    /// Combine per-rank phase timings into the cost of the slowest
    /// root-to-leaf path: take the element-wise maximum over all
    /// children, add this rank's own `values`, and forward the result
    /// up. The root returns the final vector and prints one
    /// `label = seconds` line per element.
    pub fn reduce_critical_path(
        &mut self,
        values: &[u64],
        labels: &[&str],
    ) -> Result<Option<Vec<u64>>> {
        let count = values.len();
        let mut max = vec![0u64; count];
        let mut buf = vec![0u8; count * 8];
        for i in 0..self.children.len() {
            self.child_channel(i)?.read_exact(&mut buf)?;
            for (j, chunk) in buf.chunks_exact(8).enumerate() {
                let v = u64::from_be_bytes(chunk.try_into().expect("8-byte chunk"));
                if i == 0 || v > max[j] {
                    max[j] = v;
                }
            }
        }

        let total: Vec<u64> = if self.children.is_empty() {
            values.to_vec()
        } else {
            max.iter().zip(values).map(|(m, v)| m + v).collect()
        };

        match self.parent.as_mut() {
            Some(parent) => {
                let mut out = Vec::with_capacity(count * 8);
                for v in &total {
                    out.extend_from_slice(&v.to_be_bytes());
                }
                parent.write_all(&out)?;
                Ok(None)
            }
            None => {
                for (label, v) in labels.iter().zip(&total) {
                    println!("{label} = {:.6}", *v as f64 / 1e9);
                }
                Ok(Some(total))
            }
        }
    }

    // ── File broadcast ───────────────────────────────────────────────

    /// Broadcast a file's bytes from the root's filesystem to
    /// `/tmp/<basename>` on every rank (the root included), returning
    /// the staged path. The size goes first, then the content in one
    /// block.
    pub fn bcast_file(&mut self, file: &str) -> Result<PathBuf> {
        let mut size_buf = [0u8; 8];
        if self.rank == 0 {
            let size = std::fs::metadata(file)
                .map_err(|e| SpawnError::io(format!("stat `{file}` failed: {e}")))?
                .len();
            size_buf = size.to_be_bytes();
        }
        self.bcast_bytes(&mut size_buf)?;
        let size = u64::from_be_bytes(size_buf) as usize;

        let mut content = vec![0u8; size];
        if self.rank == 0 {
            let mut src = std::fs::File::open(file)
                .map_err(|e| SpawnError::io(format!("open `{file}` failed: {e}")))?;
            src.read_exact(&mut content)
                .map_err(|e| SpawnError::io(format!("read `{file}` failed: {e}")))?;
        }
        self.bcast_bytes(&mut content)?;

        let dst = tmp_path_for(file)?;
        let mut out = std::fs::File::create(&dst)
            .map_err(|e| SpawnError::io(format!("create `{}` failed: {e}", dst.display())))?;
        out.write_all(&content)
            .map_err(|e| SpawnError::io(format!("write `{}` failed: {e}", dst.display())))?;
        out.sync_all()
            .map_err(|e| SpawnError::io(format!("fsync `{}` failed: {e}", dst.display())))?;
        set_executable(&dst)?;
        Ok(dst)
    }
}

/// Staging path for a relayed binary: `/tmp/<basename>`.
pub fn tmp_path_for(file: &str) -> Result<PathBuf> {
    let base = Path::new(file)
        .file_name()
        .ok_or_else(|| SpawnError::io(format!("`{file}` has no basename")))?;
    Ok(Path::new("/tmp").join(base))
}

/// Mark a staged binary executable.
pub fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .map_err(|e| SpawnError::io(format!("chmod `{}` failed: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_tree_has_empty_slots() {
        let tree = SpawnTree::new(1, 7, 2).unwrap();
        assert_eq!(tree.rank(), 1);
        assert_eq!(tree.ranks(), 7);
        assert_eq!(tree.child_count(), 2);
        assert_eq!(tree.child_rank(0), 3);
        assert_eq!(tree.child_rank(1), 4);
        assert!(tree.child_slots().iter().all(|s| s.channel.is_none()));
    }

    #[test]
    fn bad_topology_is_rejected_at_construction() {
        assert!(SpawnTree::new(0, 0, 2).is_err());
        assert!(SpawnTree::new(0, 4, 1).is_err());
    }

    #[test]
    fn tmp_path_uses_basename() {
        let p = tmp_path_for("/home/u/bin/launcher").unwrap();
        assert_eq!(p, PathBuf::from("/tmp/launcher"));
    }
}
