//! k-ary tree topology over a contiguous rank range.
//!
//! Ranks are laid out in levels of geometrically growing size (1, k, k²,
//! …). A node at level L with position p within its level parents the
//! contiguous ranks `levelStart(L+1) + p·k .. + k − 1`, clipped to the
//! rank count. Rank 0 is the root and has no parent; every other rank
//! has exactly one.

use grove_common::{Result, SpawnError};

/// Validate the (ranks, degree) pair shared by both computations.
fn validate(ranks: usize, degree: usize) -> Result<()> {
    if ranks < 1 {
        return Err(SpawnError::config(format!(
            "tree must have at least one rank, got {ranks}"
        )));
    }
    if degree < 2 {
        return Err(SpawnError::config(format!(
            "tree degree must be at least 2, got {degree}"
        )));
    }
    Ok(())
}

/// Ranks of the children of `rank` in the k-ary tree over `ranks` ranks.
pub fn children(rank: usize, ranks: usize, degree: usize) -> Result<Vec<usize>> {
    validate(ranks, degree)?;
    if rank >= ranks {
        return Err(SpawnError::config(format!(
            "rank {rank} out of range for {ranks} ranks"
        )));
    }

    let mut level_start = 0;
    let mut level_size = 1;
    while rank >= level_start + level_size {
        level_start += level_size;
        level_size *= degree;
    }

    let pos = rank - level_start;
    let first = level_start + level_size + pos * degree;
    if first >= ranks {
        return Ok(Vec::new());
    }
    let last = (first + degree - 1).min(ranks - 1);
    Ok((first..=last).collect())
}

/// Parent of `rank`, or `None` for the root.
pub fn parent(rank: usize, ranks: usize, degree: usize) -> Result<Option<usize>> {
    validate(ranks, degree)?;
    if rank >= ranks {
        return Err(SpawnError::config(format!(
            "rank {rank} out of range for {ranks} ranks"
        )));
    }
    if rank == 0 {
        return Ok(None);
    }

    let mut level_start = 0;
    let mut level_size = 1;
    while rank >= level_start + level_size {
        level_start += level_size;
        level_size *= degree;
    }

    let prev_size = level_size / degree;
    let prev_start = level_start - prev_size;
    let pos = rank - level_start;
    Ok(Some(prev_start + pos / degree))
}
