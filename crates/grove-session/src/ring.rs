//! Ring neighbor discovery: a double scan over the spawn tree.
//!
//! Each application process advertises one address and gets back the
//! addresses of the processes to its left and right on a ring spanning
//! the whole job. The ring follows the tree's scan order — each spawn
//! process ahead of its children, children in child order — and wraps
//! at the ends.
//!
//! [`ring_scan`] runs the scan among the spawn processes; [`ring_exchange`]
//! wraps it with the per-app-proc address collection and reply.
//!
//! Participants that contribute no addresses (spawns that started no
//! app procs) are skipped: the scan searches past them for the nearest
//! contributing neighbor in either direction, so the remaining
//! participants still close a single ring.

use grove_common::{Result, StrMap};
use grove_net::{wire, Endpoint};

use crate::timing::Phase;
use crate::tree::SpawnTree;

/// Key for the address of a subtree's (or proc's) leftmost member.
const KEY_LEFT: &str = "LEFT";
/// Key for the address of a subtree's (or proc's) rightmost member.
const KEY_RIGHT: &str = "RIGHT";

/// Copy `key` from `src` into `dst` when present.
fn copy_key(dst: &mut StrMap, src: &StrMap, key: &str) {
    if let Some(v) = src.get(key) {
        dst.set(key, v);
    }
}

/// Run the double scan across the spawn tree.
///
/// `input` carries this spawn's own contribution: `LEFT`/`RIGHT` set to
/// the leftmost and rightmost app-proc addresses it hosts, or neither
/// when it hosts none. The returned map carries the `LEFT`/`RIGHT`
/// ring-neighbor addresses for this spawn's boundary, absent when the
/// whole job contributed nothing.
pub fn ring_scan(tree: &mut SpawnTree, input: &StrMap) -> Result<StrMap> {
    let children = tree.child_count();

    // Upward phase: collect each child subtree's boundary addresses.
    let mut child_maps = Vec::with_capacity(children);
    for i in 0..children {
        child_maps.push(tree.recv_map_from_child(i)?);
    }

    // This subtree's leftmost address: first contribution scanning
    // self, child 0, child 1, …; rightmost: first scanning the reverse.
    let leftmost = std::iter::once(input)
        .chain(child_maps.iter())
        .find_map(|m| m.get(KEY_LEFT));
    let rightmost = child_maps
        .iter()
        .rev()
        .chain(std::iter::once(input))
        .find_map(|m| m.get(KEY_RIGHT));

    // Exchange with the parent; the root wraps the ends instead.
    let recv = if tree.is_root() {
        let mut recv = StrMap::new();
        if let (Some(l), Some(r)) = (leftmost, rightmost) {
            recv.set(KEY_LEFT, r);
            recv.set(KEY_RIGHT, l);
        }
        recv
    } else {
        let mut send = StrMap::new();
        if let (Some(l), Some(r)) = (leftmost, rightmost) {
            send.set(KEY_LEFT, l);
            send.set(KEY_RIGHT, r);
        }
        tree.send_map_to_parent(&send)?;
        tree.recv_map_from_parent()?
    };

    // Downward phase: each child's LEFT is the nearest preceding
    // participant's RIGHT, and its RIGHT the nearest following
    // participant's LEFT, falling through empty subtrees.
    for i in 0..children {
        let mut send = StrMap::new();

        let left = child_maps[..i]
            .iter()
            .rev()
            .find_map(|m| m.get(KEY_RIGHT))
            .or_else(|| input.get(KEY_RIGHT))
            .or_else(|| recv.get(KEY_LEFT));
        if let Some(left) = left {
            send.set(KEY_LEFT, left);
        }

        let right = child_maps[i + 1..]
            .iter()
            .find_map(|m| m.get(KEY_LEFT))
            .or_else(|| recv.get(KEY_RIGHT));
        if let Some(right) = right {
            send.set(KEY_RIGHT, right);
        }

        tree.send_map_to_child(i, &send)?;
    }

    // Own boundary: LEFT comes from above; RIGHT is the first
    // contributing child, else from above.
    let mut output = StrMap::new();
    copy_key(&mut output, &recv, KEY_LEFT);
    match child_maps.iter().find_map(|m| m.get(KEY_LEFT)) {
        Some(right) => output.set(KEY_RIGHT, right),
        None => copy_key(&mut output, &recv, KEY_RIGHT),
    }
    Ok(output)
}

/// Run the ring exchange with this spawn's local app procs.
///
/// Accepts one channel per proc, reads each proc's advertised `ADDR`,
/// feeds the boundary addresses through [`ring_scan`], and writes back
/// `{RANK, RANKS, LEFT, RIGHT}` to every proc. Every phase is bracketed
/// by signal waves so the rank-0 timings line up across the job.
pub fn ring_exchange(tree: &mut SpawnTree, ep: &Endpoint, num_procs: usize) -> Result<()> {
    let rank = tree.rank();
    let root = rank == 0;
    let _whole = Phase::begin(root, "ring exchange");
    tree.signal_from_root()?;

    let ranks = tree.ranks() * num_procs;

    // Wait for the app procs to connect.
    let mut channels = Vec::with_capacity(num_procs);
    {
        let _p = Phase::begin(root, "ring accept");
        tree.signal_from_root()?;
        for _ in 0..num_procs {
            channels.push(ep.accept()?);
        }
        tree.signal_to_root()?;
    }

    // Read the address each proc advertises.
    let mut proc_maps = Vec::with_capacity(num_procs);
    {
        let _p = Phase::begin(root, "ring read procs");
        tree.signal_from_root()?;
        for ch in channels.iter_mut() {
            proc_maps.push(wire::read_map(ch)?);
        }
        tree.signal_to_root()?;
    }

    // Scan over the tree with our procs' boundary addresses as input.
    let output;
    {
        let _p = Phase::begin(root, "ring scan");
        tree.signal_from_root()?;
        let mut input = StrMap::new();
        if num_procs > 0 {
            if let Some(leftmost) = proc_maps[0].get("ADDR") {
                input.set(KEY_LEFT, leftmost);
            }
            if let Some(rightmost) = proc_maps[num_procs - 1].get("ADDR") {
                input.set(KEY_RIGHT, rightmost);
            }
        }
        output = ring_scan(tree, &input)?;
        tree.signal_to_root()?;
    }

    // Tell each proc its ring rank and neighbors.
    {
        let _p = Phase::begin(root, "ring write procs");
        tree.signal_from_root()?;
        for (i, ch) in channels.iter_mut().enumerate() {
            let mut init = StrMap::new();
            init.set("RANK", (rank * num_procs + i).to_string());
            init.set("RANKS", ranks.to_string());

            let left = if i == 0 {
                output.get(KEY_LEFT)
            } else {
                proc_maps[i - 1].get("ADDR")
            };
            if let Some(left) = left {
                init.set(KEY_LEFT, left);
            }

            let right = if i + 1 < num_procs {
                proc_maps[i + 1].get("ADDR")
            } else {
                output.get(KEY_RIGHT)
            };
            if let Some(right) = right {
                init.set(KEY_RIGHT, right);
            }

            wire::write_map(ch, &init)?;
        }
        tree.signal_to_root()?;
    }

    // Drop the proc channels.
    {
        let _p = Phase::begin(root, "ring disconnect");
        tree.signal_from_root()?;
        for ch in channels.iter_mut() {
            ch.disconnect();
        }
        tree.signal_to_root()?;
    }

    tree.signal_to_root()
}
