//! Program helpers shared by the auto-parallel passes.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use hashbrown::HashSet;
use log::debug;

use crate::program::{OpId, Program, ProgramError, ValueId};
use crate::sharding::{NO_CHUNK, ProcessId};

/// Chunk id of the first scheduled operation reached from the users of `value`.
///
/// Users are visited breadth first, following their results when they carry no chunk id
/// themselves. Returns [`NO_CHUNK`] when no such operation exists.
pub fn find_var_used_op_chunk_id(program: &Program, value: ValueId) -> i64 {
    let mut visited: HashSet<OpId> = HashSet::new();
    let mut queue = VecDeque::from([value]);

    while let Some(value) = queue.pop_front() {
        for (id, op) in program.users(value) {
            if !visited.insert(id) {
                continue;
            }
            match op.dist_attr().map(|attr| attr.chunk_id()) {
                Some(chunk_id) if chunk_id != NO_CHUNK => return chunk_id,
                _ => queue.extend(op.results().iter().copied()),
            }
        }
    }

    NO_CHUNK
}

/// Removes the operations `rank` does not execute.
///
/// An operation is dropped when it is a placeholder relocation or runs on a mesh that does not
/// contain `rank`, once none of its results is used anymore. Returns how many were removed.
pub fn remove_other_rank_ops(
    program: &mut Program,
    rank: ProcessId,
) -> Result<usize, ProgramError> {
    let mut removed = 0;

    loop {
        let candidates: Vec<OpId> = program
            .ops()
            .rev()
            .filter(|(_, op)| {
                op.is_placeholder()
                    || op
                        .dist_attr()
                        .is_some_and(|attr| !attr.process_mesh().contains(rank))
            })
            .filter(|(_, op)| op.results().iter().all(|v| !program.has_users(*v)))
            .map(|(id, _)| id)
            .collect();

        if candidates.is_empty() {
            break;
        }
        for id in candidates {
            program.remove_op(id)?;
            removed += 1;
        }
    }

    debug!("Removed {removed} operation(s) not executed by rank {rank}");
    Ok(removed)
}
