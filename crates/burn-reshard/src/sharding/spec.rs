use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use derive_new::new;

use super::ProcessMesh;

/// Chunk id of an operation that no pipeline stage has claimed yet.
pub const NO_CHUNK: i64 = -1;

/// Describes how a tensor is distributed across the processes of a mesh.
///
/// `dims_mapping[i]` is the mesh axis tensor axis `i` is split over, or `-1` when the axis is
/// replicated. `partial_dims` holds the mesh axes over which the tensor still awaits a
/// reduction.
#[derive(new, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TensorDistAttr {
    /// Mesh the tensor lives on.
    process_mesh: ProcessMesh,
    /// Tensor axis to mesh axis mapping.
    dims_mapping: Vec<i64>,
    /// Mesh axes over which the tensor is partial.
    partial_dims: BTreeSet<usize>,
}

impl TensorDistAttr {
    /// A tensor of rank `ndim` fully replicated on `process_mesh`.
    pub fn replicated(process_mesh: ProcessMesh, ndim: usize) -> Self {
        Self::new(process_mesh, alloc::vec![-1; ndim], BTreeSet::new())
    }

    /// The same distribution status placed on another mesh.
    pub fn with_process_mesh(&self, process_mesh: ProcessMesh) -> Self {
        Self {
            process_mesh,
            ..self.clone()
        }
    }

    /// Mesh the tensor lives on.
    pub fn process_mesh(&self) -> &ProcessMesh {
        &self.process_mesh
    }

    /// Tensor axis to mesh axis mapping, `-1` for replicated axes.
    pub fn dims_mapping(&self) -> &[i64] {
        &self.dims_mapping
    }

    /// Mesh axes over which the tensor is partial.
    pub fn partial_dims(&self) -> &BTreeSet<usize> {
        &self.partial_dims
    }

    /// Whether both descriptors split, replicate and reduce the tensor the same way,
    /// whatever mesh they live on.
    pub fn is_same_status(&self, other: &Self) -> bool {
        self.dims_mapping == other.dims_mapping && self.partial_dims == other.partial_dims
    }
}

/// Distribution metadata attached to an operation.
#[derive(new, Clone, Debug, PartialEq, Eq)]
pub struct OperationDistAttr {
    /// Mesh the operation executes on.
    process_mesh: ProcessMesh,
    /// Distribution of each operand.
    operands: Vec<TensorDistAttr>,
    /// Distribution of each result.
    results: Vec<TensorDistAttr>,
    /// Pipeline chunk scheduling the operation, [`NO_CHUNK`] when unassigned.
    chunk_id: i64,
}

impl OperationDistAttr {
    /// Mesh the operation executes on.
    pub fn process_mesh(&self) -> &ProcessMesh {
        &self.process_mesh
    }

    /// Distribution of each operand.
    pub fn operands(&self) -> &[TensorDistAttr] {
        &self.operands
    }

    /// Distribution of each result.
    pub fn results(&self) -> &[TensorDistAttr] {
        &self.results
    }

    /// Pipeline chunk scheduling the operation.
    pub fn chunk_id(&self) -> i64 {
        self.chunk_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn mesh(ids: Vec<usize>) -> ProcessMesh {
        let n = ids.len();
        ProcessMesh::new(ids, [n]).unwrap()
    }

    #[test]
    fn test_same_status_ignores_mesh() {
        let src = TensorDistAttr::new(mesh(vec![0, 1]), vec![0, -1], BTreeSet::new());
        let dst = src.with_process_mesh(mesh(vec![2, 3]));

        assert!(src.is_same_status(&dst));
        assert_ne!(src, dst);
    }

    #[test]
    fn test_same_status_compares_partial_dims() {
        let src = TensorDistAttr::replicated(mesh(vec![0, 1]), 2);
        let dst = TensorDistAttr::new(mesh(vec![0, 1]), vec![-1, -1], BTreeSet::from([0]));

        assert!(!src.is_same_status(&dst));
    }
}
