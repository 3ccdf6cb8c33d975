//! A minimal tensor program: operations producing and consuming typed values.
//!
//! The program is replicated on every worker. Each worker rewrites its own copy, so nothing in
//! here is shared across processes.

mod types;

pub use types::*;

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use log::trace;
use thiserror::Error;

use crate::process_group::GroupId;
use crate::sharding::{OperationDistAttr, TensorDistAttr};

/// Handle to an operation of a [`Program`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(usize);

/// Handle to a value of a [`Program`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(usize);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Errors raised by program lookups and mutations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProgramError {
    /// The operation does not exist or was removed.
    #[error("unknown operation {0}")]
    UnknownOp(OpId),
    /// The value does not exist.
    #[error("unknown value {0}")]
    UnknownValue(ValueId),
    /// An operation cannot be removed while its results are used.
    #[error("cannot remove {op}: result {value} is still used")]
    ResultInUse {
        /// Operation being removed.
        op: OpId,
        /// Result with remaining users.
        value: ValueId,
    },
}

/// What an operation does.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    /// Any computation this crate does not need to understand.
    Compute {
        /// Operation name.
        name: String,
    },
    /// Point-to-point send of the single operand.
    Send {
        /// Group carrying the transfer.
        ring_id: GroupId,
        /// Local rank of the receiver inside the group.
        peer: usize,
        /// Whether the shape travels with the data.
        dynamic_shape: bool,
    },
    /// Point-to-point receive producing a single result.
    Recv {
        /// Group carrying the transfer.
        ring_id: GroupId,
        /// Local rank of the sender inside the group.
        peer: usize,
        /// Element type of the received tensor.
        dtype: DataType,
        /// Whether the shape travels with the data.
        dynamic_shape: bool,
    },
    /// Placeholder relocation with no communication semantics. Only keeps the local program
    /// well typed on workers that take no part in a transfer, and is pruned afterwards.
    Reshard {
        /// Distribution the placeholder stands for.
        dst_dist_attr: TensorDistAttr,
    },
}

impl OpKind {
    /// A computation named `name`.
    pub fn compute<S: Into<String>>(name: S) -> Self {
        OpKind::Compute { name: name.into() }
    }

    /// Name of the operation.
    pub fn name(&self) -> &str {
        match self {
            OpKind::Compute { name } => name,
            OpKind::Send { .. } => "p_send",
            OpKind::Recv { .. } => "p_recv",
            OpKind::Reshard { .. } => "reshard",
        }
    }
}

/// An operation of the program.
#[derive(Debug, Clone)]
pub struct Operation {
    kind: OpKind,
    operands: Vec<ValueId>,
    results: Vec<ValueId>,
    dist_attr: Option<OperationDistAttr>,
    execution_stream: Option<ExecutionStream>,
}

impl Operation {
    /// What the operation does.
    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    /// Name of the operation.
    pub fn name(&self) -> &str {
        self.kind.name()
    }

    /// Consumed values.
    pub fn operands(&self) -> &[ValueId] {
        &self.operands
    }

    /// Produced values.
    pub fn results(&self) -> &[ValueId] {
        &self.results
    }

    /// Distribution metadata, if any was attached.
    pub fn dist_attr(&self) -> Option<&OperationDistAttr> {
        self.dist_attr.as_ref()
    }

    /// Stream the operation is issued on, if assigned.
    pub fn execution_stream(&self) -> Option<ExecutionStream> {
        self.execution_stream
    }

    /// Whether this is a placeholder relocation.
    pub fn is_placeholder(&self) -> bool {
        matches!(self.kind, OpKind::Reshard { .. })
    }
}

#[derive(Debug, Clone)]
struct Value {
    ty: TensorType,
    defining_op: Option<(OpId, usize)>,
    dist_attr: Option<TensorDistAttr>,
}

/// A program whose operations are kept in execution order.
///
/// New operations are inserted at the insertion point, which defaults to the end of the
/// program.
#[derive(Debug, Clone, Default)]
pub struct Program {
    ops: Vec<Option<Operation>>,
    values: Vec<Value>,
    order: Vec<OpId>,
    insertion_point: Option<usize>,
}

impl Program {
    /// An empty program.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a program input, a value with no defining operation.
    pub fn add_input(&mut self, ty: TensorType, dist_attr: Option<TensorDistAttr>) -> ValueId {
        let id = ValueId(self.values.len());
        self.values.push(Value {
            ty,
            defining_op: None,
            dist_attr,
        });
        id
    }

    /// Inserts an operation at the insertion point and returns it.
    pub fn insert_op(
        &mut self,
        kind: OpKind,
        operands: Vec<ValueId>,
        result_types: Vec<TensorType>,
    ) -> Result<OpId, ProgramError> {
        if let Some(unknown) = operands.iter().find(|v| v.0 >= self.values.len()) {
            return Err(ProgramError::UnknownValue(*unknown));
        }

        let op_id = OpId(self.ops.len());
        let results = result_types
            .into_iter()
            .enumerate()
            .map(|(index, ty)| {
                let id = ValueId(self.values.len());
                self.values.push(Value {
                    ty,
                    defining_op: Some((op_id, index)),
                    dist_attr: None,
                });
                id
            })
            .collect();

        trace!("Inserting {} as {}", kind.name(), op_id);
        self.ops.push(Some(Operation {
            kind,
            operands,
            results,
            dist_attr: None,
            execution_stream: None,
        }));

        match self.insertion_point.as_mut() {
            Some(position) => {
                self.order.insert(*position, op_id);
                *position += 1;
            }
            None => self.order.push(op_id),
        }
        Ok(op_id)
    }

    /// Makes later insertions land right before `op`.
    pub fn set_insertion_point_before(&mut self, op: OpId) -> Result<(), ProgramError> {
        let position = self.position(op)?;
        self.insertion_point = Some(position);
        Ok(())
    }

    /// Makes later insertions land right after `op`.
    pub fn set_insertion_point_after(&mut self, op: OpId) -> Result<(), ProgramError> {
        let position = self.position(op)?;
        self.insertion_point = Some(position + 1);
        Ok(())
    }

    /// Makes later insertions append to the program.
    pub fn set_insertion_point_to_end(&mut self) {
        self.insertion_point = None;
    }

    /// Removes `op`, which must have no used result.
    pub fn remove_op(&mut self, op: OpId) -> Result<(), ProgramError> {
        let position = self.position(op)?;
        let operation = self.op(op)?;
        if let Some(value) = operation.results.iter().find(|v| self.has_users(**v)) {
            return Err(ProgramError::ResultInUse { op, value: *value });
        }

        trace!("Removing {} ({})", op, operation.name());
        self.order.remove(position);
        self.ops[op.0] = None;
        if let Some(point) = self.insertion_point.as_mut() {
            if *point > position {
                *point -= 1;
            }
        }
        Ok(())
    }

    /// The operation `op`.
    pub fn op(&self, op: OpId) -> Result<&Operation, ProgramError> {
        self.ops
            .get(op.0)
            .and_then(Option::as_ref)
            .ok_or(ProgramError::UnknownOp(op))
    }

    fn op_mut(&mut self, op: OpId) -> Result<&mut Operation, ProgramError> {
        self.ops
            .get_mut(op.0)
            .and_then(Option::as_mut)
            .ok_or(ProgramError::UnknownOp(op))
    }

    fn value(&self, value: ValueId) -> Result<&Value, ProgramError> {
        self.values
            .get(value.0)
            .ok_or(ProgramError::UnknownValue(value))
    }

    /// Operations in execution order.
    pub fn ops(&self) -> impl DoubleEndedIterator<Item = (OpId, &Operation)> {
        self.order
            .iter()
            .filter_map(|&id| self.ops[id.0].as_ref().map(|op| (id, op)))
    }

    /// Number of live operations.
    pub fn num_ops(&self) -> usize {
        self.order.len()
    }

    /// Attaches distribution metadata to `op`.
    ///
    /// The result descriptors become the descriptors of the operation's results.
    pub fn set_op_dist_attr(
        &mut self,
        op: OpId,
        dist_attr: OperationDistAttr,
    ) -> Result<(), ProgramError> {
        self.op_mut(op)?.dist_attr = Some(dist_attr);
        Ok(())
    }

    /// Assigns the stream `op` is issued on.
    pub fn set_execution_stream(
        &mut self,
        op: OpId,
        stream: ExecutionStream,
    ) -> Result<(), ProgramError> {
        self.op_mut(op)?.execution_stream = Some(stream);
        Ok(())
    }

    /// Type of `value`.
    pub fn value_type(&self, value: ValueId) -> Result<&TensorType, ProgramError> {
        Ok(&self.value(value)?.ty)
    }

    /// Overrides the type of `value`.
    pub fn set_type(&mut self, value: ValueId, ty: TensorType) -> Result<(), ProgramError> {
        self.values
            .get_mut(value.0)
            .ok_or(ProgramError::UnknownValue(value))?
            .ty = ty;
        Ok(())
    }

    /// Distribution of `value`.
    ///
    /// Results take the descriptor their defining operation declares for them; inputs keep
    /// the one they were added with.
    pub fn value_dist_attr(
        &self,
        value: ValueId,
    ) -> Result<Option<&TensorDistAttr>, ProgramError> {
        let entry = self.value(value)?;
        match entry.defining_op {
            Some((op, index)) => Ok(self
                .op(op)?
                .dist_attr()
                .and_then(|attr| attr.results().get(index))),
            None => Ok(entry.dist_attr.as_ref()),
        }
    }

    /// Operation producing `value`, `None` for inputs.
    pub fn defining_op(&self, value: ValueId) -> Result<Option<OpId>, ProgramError> {
        Ok(self.value(value)?.defining_op.map(|(op, _)| op))
    }

    /// Operations consuming `value`, in execution order.
    pub fn users(&self, value: ValueId) -> impl Iterator<Item = (OpId, &Operation)> {
        self.ops()
            .filter(move |(_, op)| op.operands.contains(&value))
    }

    /// Whether any operation consumes `value`.
    pub fn has_users(&self, value: ValueId) -> bool {
        self.users(value).next().is_some()
    }

    fn position(&self, op: OpId) -> Result<usize, ProgramError> {
        self.order
            .iter()
            .position(|&id| id == op)
            .ok_or(ProgramError::UnknownOp(op))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharding::{NO_CHUNK, ProcessMesh};
    use alloc::vec;

    fn f32_type() -> TensorType {
        TensorType::new(vec![4, 4], DataType::F32)
    }

    #[test]
    fn test_users_follow_execution_order() {
        let mut program = Program::new();
        let x = program.add_input(f32_type(), None);
        let relu = program
            .insert_op(OpKind::compute("relu"), vec![x], vec![f32_type()])
            .unwrap();
        let first = program.op(relu).unwrap().results()[0];
        let add = program
            .insert_op(OpKind::compute("add"), vec![x, first], vec![f32_type()])
            .unwrap();

        let users: Vec<_> = program.users(x).map(|(id, _)| id).collect();
        assert_eq!(users, vec![relu, add]);
        assert_eq!(program.defining_op(first).unwrap(), Some(relu));
        assert_eq!(program.defining_op(x).unwrap(), None);
    }

    #[test]
    fn test_insertion_point() {
        let mut program = Program::new();
        let x = program.add_input(f32_type(), None);
        let a = program
            .insert_op(OpKind::compute("a"), vec![x], vec![])
            .unwrap();
        let c = program
            .insert_op(OpKind::compute("c"), vec![x], vec![])
            .unwrap();

        program.set_insertion_point_before(c).unwrap();
        let b = program
            .insert_op(OpKind::compute("b"), vec![x], vec![])
            .unwrap();
        program.set_insertion_point_to_end();
        let d = program
            .insert_op(OpKind::compute("d"), vec![x], vec![])
            .unwrap();

        let order: Vec<_> = program.ops().map(|(id, _)| id).collect();
        assert_eq!(order, vec![a, b, c, d]);
    }

    #[test]
    fn test_result_dist_attr_comes_from_defining_op() {
        let mesh = ProcessMesh::new(vec![0, 1], [2]).unwrap();
        let attr = TensorDistAttr::replicated(mesh.clone(), 2);
        let mut program = Program::new();
        let x = program.add_input(f32_type(), Some(attr.clone()));
        let op = program
            .insert_op(OpKind::compute("relu"), vec![x], vec![f32_type()])
            .unwrap();
        let y = program.op(op).unwrap().results()[0];

        assert_eq!(program.value_dist_attr(x).unwrap(), Some(&attr));
        assert_eq!(program.value_dist_attr(y).unwrap(), None);

        program
            .set_op_dist_attr(
                op,
                OperationDistAttr::new(mesh, vec![attr.clone()], vec![attr.clone()], NO_CHUNK),
            )
            .unwrap();
        assert_eq!(program.value_dist_attr(y).unwrap(), Some(&attr));
    }

    #[test]
    fn test_remove_op_requires_unused_results() {
        let mut program = Program::new();
        let x = program.add_input(f32_type(), None);
        let relu = program
            .insert_op(OpKind::compute("relu"), vec![x], vec![f32_type()])
            .unwrap();
        let y = program.op(relu).unwrap().results()[0];
        let exp = program
            .insert_op(OpKind::compute("exp"), vec![y], vec![f32_type()])
            .unwrap();

        assert_eq!(
            program.remove_op(relu),
            Err(ProgramError::ResultInUse { op: relu, value: y })
        );
        program.remove_op(exp).unwrap();
        program.remove_op(relu).unwrap();
        assert_eq!(program.num_ops(), 0);
        assert_eq!(program.op(relu).unwrap_err(), ProgramError::UnknownOp(relu));
    }

    #[test]
    fn test_unknown_operand_is_rejected() {
        let mut other = Program::new();
        let foreign = other.add_input(f32_type(), None);
        let mut program = Program::new();

        assert_eq!(
            program.insert_op(OpKind::compute("relu"), vec![foreign], vec![]),
            Err(ProgramError::UnknownValue(foreign))
        );
    }
}
