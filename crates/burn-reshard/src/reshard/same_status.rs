use alloc::vec;
use alloc::vec::Vec;
use hashbrown::HashSet;
use log::{debug, trace, warn};

use super::{ReshardContext, ReshardError, ReshardFunction};
use crate::passes::find_var_used_op_chunk_id;
use crate::process_group::{GroupType, ProcessGroupRegistry};
use crate::program::{OpKind, TensorType, ValueId};
use crate::sharding::{NO_CHUNK, OperationDistAttr, ProcessId, ProcessMesh, TensorDistAttr};

/// Local rank of the sender in a forward `[src, dst]` group.
const SRC_LOCAL_RANK: usize = 0;
/// Local rank of the receiver in a forward `[src, dst]` group.
const DST_LOCAL_RANK: usize = 1;

/// Part a worker plays when a value moves between two meshes of the same shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Holds the data and sends it to `peer`.
    Sender {
        /// Receiving rank.
        peer: ProcessId,
    },
    /// Receives the data from `peer`.
    Receiver {
        /// Sending rank.
        peer: ProcessId,
    },
    /// Sits at the same position in both meshes: the data is already local.
    Local,
    /// Takes no part in the transfer.
    Bystander,
}

/// Pairs the *i*-th process of `src_mesh` with the *i*-th process of `dst_mesh`.
pub fn pairing(src_mesh: &ProcessMesh, dst_mesh: &ProcessMesh) -> Vec<(ProcessId, ProcessId)> {
    src_mesh
        .process_ids()
        .iter()
        .copied()
        .zip(dst_mesh.process_ids().iter().copied())
        .collect()
}

/// First rank named by two different pairs, if any.
///
/// A pair `(r, r)` names `r` once. When the meshes share ranks at different positions, e.g.
/// `[0, 1] -> [1, 2]`, rank `1` would have to receive and send in the same step, which the
/// single-role rewrite cannot express.
pub fn overlapping_rank(pairs: &[(ProcessId, ProcessId)]) -> Option<ProcessId> {
    let mut seen = HashSet::with_capacity(pairs.len() * 2);
    for &(src, dst) in pairs {
        if !seen.insert(src) {
            return Some(src);
        }
        if src != dst && !seen.insert(dst) {
            return Some(dst);
        }
    }
    None
}

/// Role of `rank`, decided by the first pair naming it.
///
/// Every worker evaluates this on the same pairs, so they all agree on who sends to whom
/// without exchanging a message. Only meaningful when [`overlapping_rank`] finds nothing.
pub fn resolve_role(pairs: &[(ProcessId, ProcessId)], rank: ProcessId) -> Role {
    pairs
        .iter()
        .find_map(|&(src, dst)| match (src == rank, dst == rank) {
            (true, true) => Some(Role::Local),
            (true, false) => Some(Role::Sender { peer: dst }),
            (false, true) => Some(Role::Receiver { peer: src }),
            (false, false) => None,
        })
        .unwrap_or(Role::Bystander)
}

/// Creates the point-to-point groups of every pair and returns the pairing.
///
/// Each pair of distinct processes gets a forward `[src, dst]` group and, when
/// `eager_reverse` is set, a reverse `[dst, src]` one.
pub fn plan_channels(
    groups: &ProcessGroupRegistry,
    src_mesh: &ProcessMesh,
    dst_mesh: &ProcessMesh,
    eager_reverse: bool,
) -> Vec<(ProcessId, ProcessId)> {
    let pairs = pairing(src_mesh, dst_mesh);
    request_channels(groups, &pairs, None, eager_reverse);
    pairs
}

/// Same as [`plan_channels`], restricted to the groups `rank` is a member of.
///
/// Group creation is collective between the two members, so a worker only ever requests the
/// groups naming it.
pub fn plan_channels_for(
    groups: &ProcessGroupRegistry,
    src_mesh: &ProcessMesh,
    dst_mesh: &ProcessMesh,
    rank: ProcessId,
    eager_reverse: bool,
) -> Vec<(ProcessId, ProcessId)> {
    let pairs = pairing(src_mesh, dst_mesh);
    request_channels(groups, &pairs, Some(rank), eager_reverse);
    pairs
}

fn request_channels(
    groups: &ProcessGroupRegistry,
    pairs: &[(ProcessId, ProcessId)],
    rank: Option<ProcessId>,
    eager_reverse: bool,
) {
    for &(src, dst) in pairs {
        if src == dst {
            continue;
        }
        if rank.is_some_and(|rank| rank != src && rank != dst) {
            continue;
        }
        groups.get_or_create(&[src, dst], GroupType::P2P);
        if eager_reverse {
            groups.get_or_create(&[dst, src], GroupType::P2P);
        }
    }
}

/// Moves a value between two meshes of the same shape without changing how it is split,
/// replicated or reduced.
///
/// The *i*-th process of the source mesh sends its local shard to the *i*-th process of the
/// destination mesh. Other workers get a placeholder that keeps their copy of the program well
/// typed until [`remove_other_rank_ops`](crate::passes::remove_other_rank_ops) drops it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SameStatusReshardFunction;

impl ReshardFunction for SameStatusReshardFunction {
    fn name(&self) -> &'static str {
        "same_status"
    }

    fn is_suitable(&self, src: &TensorDistAttr, dst: &TensorDistAttr) -> bool {
        if !src.is_same_status(dst) {
            return false;
        }

        let in_mesh = src.process_mesh();
        let out_mesh = dst.process_mesh();

        if in_mesh == out_mesh {
            return false;
        }
        if in_mesh.shape() != out_mesh.shape() {
            return false;
        }
        overlapping_rank(&pairing(in_mesh, out_mesh)).is_none()
    }

    fn reshard(
        &self,
        ctx: &mut ReshardContext<'_>,
        src: &TensorDistAttr,
        dst: &TensorDistAttr,
        src_value: ValueId,
        dst_type: &TensorType,
    ) -> Result<ValueId, ReshardError> {
        let src_mesh = src.process_mesh();
        let dst_mesh = dst.process_mesh();
        let rank = ctx.cur_rank;

        let pairs = pairing(src_mesh, dst_mesh);
        // Checked on every rank before any channel or op, so all ranks fail together.
        if let Some(shared) = overlapping_rank(&pairs) {
            warn!("Rank {shared} appears in more than one pair of {pairs:?}");
            return Err(ReshardError::OverlappingPairs { rank: shared });
        }
        request_channels(ctx.groups, &pairs, Some(rank), ctx.config.eager_reverse_channels);
        let role = resolve_role(&pairs, rank);
        debug!("Rank {rank} resolved to {role:?} for {src_value}");

        match role {
            Role::Sender { peer } => {
                self.send(ctx, src, src_value, peer)?;
                // The sent value has no use downstream on this rank.
                self.placeholder(ctx, src, dst, src_value, dst_type)
            }
            Role::Receiver { peer } => self.recv(ctx, dst, src_value, dst_type, peer),
            Role::Local => Ok(src_value),
            Role::Bystander if src_mesh.contains(rank) || dst_mesh.contains(rank) => {
                warn!("Rank {rank} is in a mesh but in no pair of {pairs:?}");
                Err(ReshardError::UnassignedRole { rank })
            }
            Role::Bystander => self.placeholder(ctx, src, dst, src_value, dst_type),
        }
    }
}

impl SameStatusReshardFunction {
    fn send(
        &self,
        ctx: &mut ReshardContext<'_>,
        src: &TensorDistAttr,
        src_value: ValueId,
        peer: ProcessId,
    ) -> Result<(), ReshardError> {
        let program = &mut *ctx.program;
        let chunk_id = match program.defining_op(src_value)? {
            Some(op) => program
                .op(op)?
                .dist_attr()
                .map_or(NO_CHUNK, OperationDistAttr::chunk_id),
            None => NO_CHUNK,
        };

        let group = ctx.groups.get_or_create(&[ctx.cur_rank, peer], GroupType::P2P);
        debug_assert_eq!(group.local_rank(peer), Some(DST_LOCAL_RANK));

        let op = program.insert_op(
            OpKind::Send {
                ring_id: group.id(),
                peer: DST_LOCAL_RANK,
                dynamic_shape: false,
            },
            vec![src_value],
            vec![],
        )?;
        program.set_op_dist_attr(
            op,
            OperationDistAttr::new(
                src.process_mesh().clone(),
                vec![src.clone()],
                vec![],
                chunk_id,
            ),
        )?;
        program.set_execution_stream(op, ctx.config.comm_stream)?;
        trace!(
            "Sending {src_value} to rank {peer} over group {} (chunk {chunk_id})",
            group.id()
        );
        Ok(())
    }

    fn recv(
        &self,
        ctx: &mut ReshardContext<'_>,
        dst: &TensorDistAttr,
        src_value: ValueId,
        dst_type: &TensorType,
        peer: ProcessId,
    ) -> Result<ValueId, ReshardError> {
        let program = &mut *ctx.program;
        let dst_mesh = dst.process_mesh();

        // Schedule the receive with the stage that consumes the value on the destination mesh.
        let chunk_id = program
            .users(src_value)
            .filter_map(|(_, op)| op.results().first().map(|&result| (op, result)))
            .filter(|&(_, result)| {
                matches!(
                    program.value_dist_attr(result),
                    Ok(Some(attr)) if attr.process_mesh() == dst_mesh
                )
            })
            .last()
            .map_or(NO_CHUNK, |(op, result)| {
                match op.dist_attr().map(OperationDistAttr::chunk_id) {
                    Some(chunk_id) if chunk_id != NO_CHUNK => chunk_id,
                    _ => find_var_used_op_chunk_id(program, result),
                }
            });

        if dst_type.is_dynamic() {
            return Err(ReshardError::DynamicShape {
                value: src_value,
                ty: dst_type.clone(),
            });
        }

        let group = ctx.groups.get_or_create(&[peer, ctx.cur_rank], GroupType::P2P);
        debug_assert_eq!(group.local_rank(peer), Some(SRC_LOCAL_RANK));

        let op = program.insert_op(
            OpKind::Recv {
                ring_id: group.id(),
                peer: SRC_LOCAL_RANK,
                dtype: dst_type.dtype(),
                dynamic_shape: false,
            },
            vec![],
            vec![TensorType::new(Vec::new(), dst_type.dtype())],
        )?;
        program.set_op_dist_attr(
            op,
            OperationDistAttr::new(dst_mesh.clone(), vec![], vec![dst.clone()], chunk_id),
        )?;
        let recv_value = program.op(op)?.results()[0];
        program.set_type(recv_value, dst_type.clone())?;
        program.set_execution_stream(op, ctx.config.comm_stream)?;
        trace!(
            "Receiving {recv_value} from rank {peer} over group {} (chunk {chunk_id})",
            group.id()
        );
        Ok(recv_value)
    }

    fn placeholder(
        &self,
        ctx: &mut ReshardContext<'_>,
        src: &TensorDistAttr,
        dst: &TensorDistAttr,
        src_value: ValueId,
        dst_type: &TensorType,
    ) -> Result<ValueId, ReshardError> {
        let program = &mut *ctx.program;
        let op = program.insert_op(
            OpKind::Reshard {
                dst_dist_attr: dst.clone(),
            },
            vec![src_value],
            vec![dst_type.clone()],
        )?;
        program.set_op_dist_attr(
            op,
            OperationDistAttr::new(
                dst.process_mesh().clone(),
                vec![src.clone()],
                vec![dst.clone()],
                NO_CHUNK,
            ),
        )?;
        Ok(program.op(op)?.results()[0])
    }
}
