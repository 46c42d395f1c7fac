//! Shared harness: in-process spawn trees over loopback TCP.

use std::sync::Arc;

use grove_net::{Channel, Endpoint, Transport};
use grove_session::tree::SpawnTree;

/// Loopback address for an endpoint, so tests do not depend on the
/// host name resolving.
pub fn loopback(ep: &Endpoint) -> String {
    let port = ep.name().rsplit(':').next().unwrap();
    format!("tcp:127.0.0.1:{port}")
}

/// Build a fully connected tree of `ranks` nodes with the given degree.
pub fn build_forest(ranks: usize, degree: usize) -> Vec<SpawnTree> {
    let mut forest: Vec<SpawnTree> = (0..ranks)
        .map(|r| SpawnTree::new(r, ranks, degree).unwrap())
        .collect();

    for parent in 0..ranks {
        let child_ranks: Vec<usize> = (0..forest[parent].child_count())
            .map(|i| forest[parent].child_rank(i))
            .collect();
        for (slot, child) in child_ranks.into_iter().enumerate() {
            let ep = Endpoint::open(Transport::Tcp).unwrap();
            let addr = loopback(&ep);
            let connector = std::thread::spawn(move || Channel::connect(&addr).unwrap());
            let accepted = ep.accept().unwrap();
            forest[parent].set_child_channel(slot, accepted);
            forest[child].set_parent_channel(connector.join().unwrap());
        }
    }
    forest
}

/// Run one closure per rank on its own thread and collect the results
/// in rank order.
pub fn run_ranks<T, F>(forest: Vec<SpawnTree>, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(usize, &mut SpawnTree) -> T + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let handles: Vec<_> = forest
        .into_iter()
        .enumerate()
        .map(|(rank, mut tree)| {
            let f = Arc::clone(&f);
            std::thread::spawn(move || f(rank, &mut tree))
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}
