//! End-to-end rendezvous tests: threads play the application processes
//! against real `pmi_exchange` / `ring_exchange` servers running on an
//! in-process spawn tree.

use grove_common::StrMap;
use grove_net::{wire, Channel, Endpoint, Transport};

use grove_session::pmi::pmi_exchange;
use grove_session::ring::ring_exchange;

mod common;
use common::{build_forest, loopback, run_ranks};

/// Drive one PMI client: put a key, barrier, get two keys, finalize.
/// Returns the two fetched values.
fn pmi_client(addr: String, rank: usize, ranks: usize, get1: String, get2: String) -> (String, String) {
    let mut ch = Channel::connect(&addr).unwrap();

    let init = wire::read_map(&mut ch).unwrap();
    assert_eq!(init.get("RANK"), Some(rank.to_string().as_str()));
    assert_eq!(init.get("RANKS"), Some(ranks.to_string().as_str()));
    assert_eq!(init.get("JOBID"), Some("42"));

    let mut committed = StrMap::new();
    committed.set(format!("KEY{rank}"), format!("rank{rank}"));
    wire::write_str(&mut ch, "BARRIER").unwrap();
    wire::write_map(&mut ch, &committed).unwrap();
    assert_eq!(wire::read_str(&mut ch).unwrap(), "BARRIER");

    wire::write_str(&mut ch, "GET").unwrap();
    wire::write_str(&mut ch, &get1).unwrap();
    let v1 = wire::read_str(&mut ch).unwrap();

    wire::write_str(&mut ch, "GET").unwrap();
    wire::write_str(&mut ch, &get2).unwrap();
    let v2 = wire::read_str(&mut ch).unwrap();

    wire::write_str(&mut ch, "FINALIZE").unwrap();
    (v1, v2)
}

#[test]
fn pmi_exchange_serves_the_global_database() {
    let ranks = 3;
    let forest = build_forest(ranks, 2);

    let results = run_ranks(forest, move |rank, tree| {
        let ep = Endpoint::open(Transport::Tcp).unwrap();
        let addr = loopback(&ep);

        // One local app proc per spawn, fetching its neighbors' keys
        // and one key nobody put.
        let get1 = format!("KEY{}", (rank + 1) % ranks);
        let get2 = if rank == 0 {
            "KEY_MISSING".to_string()
        } else {
            format!("KEY{}", (rank + 2) % ranks)
        };
        let client =
            std::thread::spawn(move || pmi_client(addr, rank, ranks, get1, get2));

        let db = pmi_exchange(tree, &ep, 1, "42").unwrap();
        (db, client.join().unwrap())
    });

    for (rank, (db, (v1, v2))) in results.iter().enumerate() {
        // Every spawn holds the full database after the allgather.
        assert_eq!(db.len(), ranks);
        assert_eq!(*v1, format!("rank{}", (rank + 1) % ranks));
        if rank == 0 {
            assert_eq!(v2, "", "missing keys read back as empty strings");
        } else {
            assert_eq!(*v2, format!("rank{}", (rank + 2) % ranks));
        }
    }
}

/// Drive one ring client: advertise an address, read back the
/// neighborhood.
fn ring_client(addr: String, own_addr: String) -> StrMap {
    let mut ch = Channel::connect(&addr).unwrap();
    let mut advert = StrMap::new();
    advert.set("ADDR", own_addr);
    wire::write_map(&mut ch, &advert).unwrap();
    wire::read_map(&mut ch).unwrap()
}

#[test]
fn ring_exchange_links_app_procs_in_scan_order() {
    // Two-level tree: scan order equals rank order, so with one proc
    // per spawn the app ring is 0-1-2 with wraparound.
    let ranks = 3;
    let forest = build_forest(ranks, 4);

    let results = run_ranks(forest, move |rank, tree| {
        let ep = Endpoint::open(Transport::Tcp).unwrap();
        let addr = loopback(&ep);
        let own_addr = format!("app-addr-{rank}");
        let client = std::thread::spawn(move || ring_client(addr, own_addr));

        ring_exchange(tree, &ep, 1).unwrap();
        client.join().unwrap()
    });

    for (rank, init) in results.iter().enumerate() {
        let left = (rank + ranks - 1) % ranks;
        let right = (rank + 1) % ranks;
        assert_eq!(init.get("RANK"), Some(rank.to_string().as_str()));
        assert_eq!(init.get("RANKS"), Some(ranks.to_string().as_str()));
        assert_eq!(init.get("LEFT"), Some(format!("app-addr-{left}").as_str()));
        assert_eq!(
            init.get("RIGHT"),
            Some(format!("app-addr-{right}").as_str())
        );
    }
}

#[test]
fn ring_exchange_with_two_procs_per_spawn() {
    // ppn=2 on a two-level 3-spawn tree. A proc's ring rank follows
    // the order its connection was accepted in, so the assertion maps
    // advertised addresses through the server-assigned ranks instead
    // of assuming a connect order.
    let ranks = 3;
    let ppn = 2;
    let forest = build_forest(ranks, 4);

    let results = run_ranks(forest, move |rank, tree| {
        let ep = Endpoint::open(Transport::Tcp).unwrap();
        let clients: Vec<_> = (0..ppn)
            .map(|i| {
                let addr = loopback(&ep);
                let own_addr = format!("app-{rank}-{i}");
                std::thread::spawn(move || {
                    let init = ring_client(addr, own_addr.clone());
                    (own_addr, init)
                })
            })
            .collect();

        ring_exchange(tree, &ep, ppn).unwrap();
        clients
            .into_iter()
            .map(|c| c.join().unwrap())
            .collect::<Vec<_>>()
    });

    // Rebuild the rank → address table from what each proc was told.
    let total = ranks * ppn;
    let mut addr_of = vec![String::new(); total];
    for inits in &results {
        for (own_addr, init) in inits {
            let r: usize = init.get("RANK").unwrap().parse().unwrap();
            assert_eq!(init.get("RANKS"), Some(total.to_string().as_str()));
            addr_of[r] = own_addr.clone();
        }
    }
    assert!(addr_of.iter().all(|a| !a.is_empty()), "every rank assigned");

    // Every proc's neighbors are the adjacent ring ranks' addresses.
    for inits in &results {
        for (_, init) in inits {
            let r: usize = init.get("RANK").unwrap().parse().unwrap();
            let left = (r + total - 1) % total;
            let right = (r + 1) % total;
            assert_eq!(init.get("LEFT"), Some(addr_of[left].as_str()), "rank {r} LEFT");
            assert_eq!(
                init.get("RIGHT"),
                Some(addr_of[right].as_str()),
                "rank {r} RIGHT"
            );
        }
    }
}
