//! Minimal PMI rendezvous served to local application processes.
//!
//! The served subset is fixed: each app proc puts zero or more
//! key/value pairs and commits them, reaches a barrier, issues exactly
//! two gets, and finalizes. At the barrier the committed pairs are
//! allgathered across the spawn tree, so afterwards every spawn process
//! can answer gets for any rank's keys out of its own copy.
//!
//! ## Per-proc protocol
//!
//! 1. proc connects; spawn accepts.
//! 2. spawn sends `{RANK, RANKS, JOBID}`.
//! 3. proc sends the literal `"BARRIER"` and its committed map.
//! 4. (all local procs arrived) spawns allgather the combined map.
//! 5. spawn sends `"BARRIER"` back.
//! 6. twice: proc sends `"GET"` and a key; spawn replies with the value,
//!    or an empty string for a missing key.
//! 7. proc sends `"FINALIZE"`; spawn disconnects it.
//!
//! Any other command is a protocol error and fatal.

use grove_common::{Result, SpawnError, StrMap};
use grove_net::{wire, Channel, Endpoint};

use crate::timing::Phase;
use crate::tree::SpawnTree;

const CMD_BARRIER: &str = "BARRIER";
const CMD_GET: &str = "GET";
const CMD_FINALIZE: &str = "FINALIZE";

/// Read one command string and check it is the expected literal.
fn expect_cmd(ch: &mut Channel, expected: &str) -> Result<()> {
    let cmd = wire::read_str(ch)?;
    if cmd != expected {
        return Err(SpawnError::protocol(format!(
            "expected `{expected}` from `{}`, got `{cmd}`",
            ch.name()
        )));
    }
    Ok(())
}

/// Serve one GET round for every proc, in proc order.
fn serve_gets(channels: &mut [Channel], db: &StrMap) -> Result<()> {
    for ch in channels.iter_mut() {
        expect_cmd(ch, CMD_GET)?;
        let key = wire::read_str(ch)?;
        let value = db.get(&key).unwrap_or("");
        wire::write_str(ch, value)?;
    }
    Ok(())
}

/// Run the PMI exchange with this spawn's local app procs, returning
/// the job-wide key/value database. Phases run in lockstep across the
/// tree under signal waves; rank 0 logs a timing per phase.
pub fn pmi_exchange(
    tree: &mut SpawnTree,
    ep: &Endpoint,
    num_procs: usize,
    jobid: &str,
) -> Result<StrMap> {
    let rank = tree.rank();
    let root = rank == 0;
    let _whole = Phase::begin(root, "pmi exchange");
    tree.signal_from_root()?;

    let ranks = tree.ranks() * num_procs;
    let mut db = StrMap::new();

    // Wait for the app procs to connect.
    let mut channels = Vec::with_capacity(num_procs);
    {
        let _p = Phase::begin(root, "pmi accept");
        tree.signal_from_root()?;
        for _ in 0..num_procs {
            channels.push(ep.accept()?);
        }
        tree.signal_to_root()?;
    }

    // Hand each proc its identity.
    {
        let _p = Phase::begin(root, "pmi init info");
        tree.signal_from_root()?;
        for (i, ch) in channels.iter_mut().enumerate() {
            let mut init = StrMap::new();
            init.set("RANK", (rank * num_procs + i).to_string());
            init.set("RANKS", ranks.to_string());
            init.set("JOBID", jobid);
            wire::write_map(ch, &init)?;
        }
        tree.signal_to_root()?;
    }

    // Collect every proc's committed pairs at its barrier.
    {
        let _p = Phase::begin(root, "pmi read procs");
        tree.signal_from_root()?;
        for ch in channels.iter_mut() {
            expect_cmd(ch, CMD_BARRIER)?;
            let committed = wire::read_map(ch)?;
            db.merge(&committed);
        }
        tree.signal_to_root()?;
    }

    // One allgather makes the database global.
    {
        let _p = Phase::begin(root, "pmi allgather");
        tree.signal_from_root()?;
        tree.allgather_map(&mut db)?;
        tree.signal_to_root()?;
    }

    // Release the procs and serve both GET rounds.
    {
        let _p = Phase::begin(root, "pmi write procs");
        tree.signal_from_root()?;
        for ch in channels.iter_mut() {
            wire::write_str(ch, CMD_BARRIER)?;
        }
        serve_gets(&mut channels, &db)?;
        serve_gets(&mut channels, &db)?;
        tree.signal_to_root()?;
    }

    // Wait for every proc to finalize.
    {
        let _p = Phase::begin(root, "pmi finalize");
        tree.signal_from_root()?;
        for ch in channels.iter_mut() {
            expect_cmd(ch, CMD_FINALIZE)?;
            ch.disconnect();
        }
        tree.signal_to_root()?;
    }

    tree.signal_to_root()?;

    if root {
        println!("PMI map:");
        print!("{db}");
        println!();
    }
    Ok(db)
}
