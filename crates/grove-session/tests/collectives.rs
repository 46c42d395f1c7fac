//! Collective and scan tests over an in-process tree.
//!
//! Every test wires up a real k-ary tree of `SpawnTree`s over loopback
//! TCP channels, runs one rank per thread, and asserts on the values
//! each rank ends up with.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use grove_common::StrMap;
use grove_session::ring::ring_scan;

mod common;
use common::{build_forest, run_ranks};

#[test]
fn signal_waves_form_a_total_barrier() {
    let ranks = 7;
    let arrived = Arc::new(AtomicUsize::new(0));
    let forest = build_forest(ranks, 2);

    let counts = {
        let arrived = Arc::clone(&arrived);
        run_ranks(forest, move |_rank, tree| {
            arrived.fetch_add(1, Ordering::SeqCst);
            tree.signal_to_root().unwrap();
            tree.signal_from_root().unwrap();
            // Nobody may pass the down-wave before everyone reached
            // the up-wave.
            arrived.load(Ordering::SeqCst)
        })
    };
    assert_eq!(counts, vec![ranks; ranks]);
}

#[test]
fn bcast_map_delivers_identical_copies() {
    let forest = build_forest(7, 2);
    let maps = run_ranks(forest, |rank, tree| {
        let mut map = StrMap::new();
        if rank == 0 {
            map.set("EXE", "/bin/app");
            map.set("PPN", "4");
        }
        tree.bcast_map(&mut map).unwrap();
        map
    });
    for map in &maps {
        assert_eq!(map, &maps[0]);
    }
    assert_eq!(maps[0].get("EXE"), Some("/bin/app"));
}

#[test]
fn allgather_collects_every_contribution_everywhere() {
    let ranks = 7;
    let forest = build_forest(ranks, 2);
    let maps = run_ranks(forest, move |rank, tree| {
        let mut map = StrMap::new();
        map.set(format!("k{rank}"), format!("v{rank}"));
        tree.allgather_map(&mut map).unwrap();
        map
    });
    for map in &maps {
        assert_eq!(map.len(), ranks);
        for i in 0..ranks {
            assert_eq!(map.get(&format!("k{i}")), Some(format!("v{i}").as_str()));
        }
        // The broadcast replaces local state, so entry order is the
        // root's merged order on every rank.
        assert_eq!(map, &maps[0]);
    }
}

#[test]
fn allgather_order_is_ascending_on_a_two_level_tree() {
    // Root plus leaves only: gather order equals rank order.
    let ranks = 4;
    let forest = build_forest(ranks, 4);
    let maps = run_ranks(forest, move |rank, tree| {
        let mut map = StrMap::new();
        map.set(format!("k{rank}"), format!("v{rank}"));
        tree.allgather_map(&mut map).unwrap();
        map
    });
    let keys: Vec<String> = maps[1].iter().map(|(k, _)| k.to_string()).collect();
    assert_eq!(keys, vec!["k0", "k1", "k2", "k3"]);
}

#[test]
fn critical_path_is_the_heaviest_root_to_leaf_sum() {
    // Binary tree of 7: paths are 0+1+3, 0+1+4, 0+2+5, 0+2+6; the
    // heaviest is 0+2+6 = 8.
    let forest = build_forest(7, 2);
    let results = run_ranks(forest, |rank, tree| {
        tree.reduce_critical_path(&[rank as u64], &["sum"]).unwrap()
    });
    assert_eq!(results[0], Some(vec![8]));
    for r in &results[1..] {
        assert_eq!(*r, None);
    }
}

#[test]
fn bcast_bytes_relays_a_block() {
    let forest = build_forest(5, 2);
    let blocks = run_ranks(forest, |rank, tree| {
        let mut block = [0u8; 16];
        if rank == 0 {
            block.copy_from_slice(b"grove-broadcast!");
        }
        tree.bcast_bytes(&mut block).unwrap();
        block
    });
    for block in &blocks {
        assert_eq!(block, b"grove-broadcast!");
    }
}

#[test]
fn ring_scan_closes_the_ring_when_everyone_contributes() {
    // Two-level tree (root plus 4 leaves): scan order is rank order,
    // so the ring is 0-1-2-3-4 with wraparound.
    let ranks = 5;
    let forest = build_forest(ranks, 4);
    let outputs = run_ranks(forest, move |rank, tree| {
        let mut input = StrMap::new();
        input.set("LEFT", format!("addr{rank}"));
        input.set("RIGHT", format!("addr{rank}"));
        ring_scan(tree, &input).unwrap()
    });
    for (rank, out) in outputs.iter().enumerate() {
        let left = (rank + ranks - 1) % ranks;
        let right = (rank + 1) % ranks;
        assert_eq!(out.get("LEFT"), Some(format!("addr{left}").as_str()));
        assert_eq!(out.get("RIGHT"), Some(format!("addr{right}").as_str()));
    }
}

#[test]
fn ring_scan_skips_ranks_with_no_contribution() {
    // Ranks 1 and 3 contribute nothing; 0, 2, 4 close a ring among
    // themselves in ascending order.
    let ranks = 5;
    let forest = build_forest(ranks, 4);
    let outputs = run_ranks(forest, move |rank, tree| {
        let mut input = StrMap::new();
        if rank % 2 == 0 {
            input.set("LEFT", format!("addr{rank}"));
            input.set("RIGHT", format!("addr{rank}"));
        }
        ring_scan(tree, &input).unwrap()
    });
    let expect = [(0, 4, 2), (2, 0, 4), (4, 2, 0)];
    for (rank, left, right) in expect {
        assert_eq!(
            outputs[rank].get("LEFT"),
            Some(format!("addr{left}").as_str()),
            "rank {rank} LEFT"
        );
        assert_eq!(
            outputs[rank].get("RIGHT"),
            Some(format!("addr{right}").as_str()),
            "rank {rank} RIGHT"
        );
    }
}

#[test]
fn ring_scan_on_a_deep_tree_follows_scan_order() {
    // Binary tree of 7: the scan order is each node ahead of its
    // children's subtrees — 0, 1, 3, 4, 2, 5, 6 — and wraps.
    let scan_order = [0usize, 1, 3, 4, 2, 5, 6];
    let forest = build_forest(7, 2);
    let outputs = run_ranks(forest, move |rank, tree| {
        let mut input = StrMap::new();
        input.set("LEFT", format!("addr{rank}"));
        input.set("RIGHT", format!("addr{rank}"));
        ring_scan(tree, &input).unwrap()
    });
    for (pos, &rank) in scan_order.iter().enumerate() {
        let left = scan_order[(pos + scan_order.len() - 1) % scan_order.len()];
        let right = scan_order[(pos + 1) % scan_order.len()];
        assert_eq!(
            outputs[rank].get("LEFT"),
            Some(format!("addr{left}").as_str()),
            "rank {rank} LEFT"
        );
        assert_eq!(
            outputs[rank].get("RIGHT"),
            Some(format!("addr{right}").as_str()),
            "rank {rank} RIGHT"
        );
    }
}

#[test]
fn bcast_file_stages_identical_bytes_on_every_rank() {
    use std::io::Write;

    // Source file exists only on "rank 0's filesystem"; the staged
    // copy must hold identical bytes on every rank.
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join(format!("grove-relay-{}", std::process::id()));
    let payload: Vec<u8> = (0u32..4096).flat_map(|i| i.to_le_bytes()).collect();
    std::fs::File::create(&src)
        .unwrap()
        .write_all(&payload)
        .unwrap();
    let src_str = src.to_string_lossy().into_owned();

    let forest = build_forest(4, 2);
    let staged = {
        let src_str = src_str.clone();
        run_ranks(forest, move |_rank, tree| {
            tree.bcast_file(&src_str).unwrap()
        })
    };

    let expected = grove_session::tree::tmp_path_for(&src_str).unwrap();
    for path in &staged {
        assert_eq!(path, &expected);
    }
    assert_eq!(std::fs::read(&expected).unwrap(), payload);
    let _ = std::fs::remove_file(&expected);
}

#[test]
fn gather_map_merges_toward_the_root_only() {
    let forest = build_forest(3, 2);
    let maps = run_ranks(forest, |rank, tree| {
        let mut map = StrMap::new();
        map.set(format!("k{rank}"), "x");
        tree.gather_map(&mut map).unwrap();
        map
    });
    assert_eq!(maps[0].len(), 3);
    assert_eq!(maps[1].len(), 1);
    assert_eq!(maps[2].len(), 1);
}
