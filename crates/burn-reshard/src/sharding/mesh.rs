use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use hashbrown::{HashMap, HashSet};
use thiserror::Error;

/// Global identity of a worker process (its rank in the world).
pub type ProcessId = usize;

/// Named axis of a [`ProcessMesh`].
///
/// `dims_mapping` and `partial_dims` refer to axes by position; the name only labels an axis
/// in logs and lets two meshes with equal ids and shape still differ by their axis names.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct MeshDim {
    /// A name that uniquely identifies the mesh dimension.
    name: String,
}

impl MeshDim {
    /// Constructs a new [`MeshDim`] with the given name.
    pub fn new<S: Into<String>>(name: S) -> Self {
        MeshDim { name: name.into() }
    }

    /// The name of the dimension.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Represents a logical arrangement of worker processes.
///
/// A `ProcessMesh` defines a structured, N-dimensional topology over a set of process ids,
/// stored in row-major order. Two meshes with the same shape are topologically compatible
/// regardless of which processes populate them: the *i*-th process of one mesh plays the
/// same logical role as the *i*-th process of the other.
///
/// For example, a 2D mesh with shape `[2, 4]` and dimensions `["dp", "tp"]` represents
/// a logical grid of processes for 2-way data parallelism and 4-way tensor parallelism.
///
/// A process id appears at most once in a mesh.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProcessMesh {
    /// Process ids in row-major order.
    process_ids: Vec<ProcessId>,
    /// Shape of the logical mesh.
    shape: Vec<usize>,
    /// Dimension names, ordered by mesh axis.
    dims: Vec<MeshDim>,
}

/// Represents errors that can occur when constructing a `ProcessMesh`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProcessMeshError {
    /// An invalid dimension was specified.
    #[error("invalid mesh dimension: {0}")]
    InvalidDimension(String),
    /// The mesh configuration is invalid.
    #[error("invalid process mesh: {0}")]
    InvalidMesh(String),
}

impl ProcessMesh {
    /// Creates a mesh whose dimensions are named `d0`, `d1`, ...
    pub fn new<S: Into<Vec<usize>>>(
        process_ids: Vec<ProcessId>,
        shape: S,
    ) -> Result<Self, ProcessMeshError> {
        let shape = shape.into();
        let ndim = shape.len();
        (0..ndim)
            .fold(ProcessMeshBuilder::new(process_ids, shape), |builder, idx| {
                builder.with_dim(idx, MeshDim::new(format!("d{idx}")))
            })
            .build()
    }

    /// Process ids in row-major order.
    pub fn process_ids(&self) -> &[ProcessId] {
        &self.process_ids
    }

    /// Shape of the mesh.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of mesh dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Dimension names, ordered by mesh axis.
    pub fn dim_names(&self) -> impl Iterator<Item = &str> {
        self.dims.iter().map(MeshDim::name)
    }

    /// Whether `process_id` belongs to the mesh.
    pub fn contains(&self, process_id: ProcessId) -> bool {
        self.process_ids.contains(&process_id)
    }
}

/// A builder for constructing a [`ProcessMesh`].
///
/// This builder allows you to define a logical mesh structure with a shape and
/// specific dimension mappings. Once all dimensions are mapped, the builder can
/// be used to construct the [`ProcessMesh`] instance.
#[derive(Clone, Debug)]
pub struct ProcessMeshBuilder {
    /// Process ids in an n-dimensional logical arrangement.
    process_ids: Vec<ProcessId>,
    /// Shape of the logical mesh.
    shape: Vec<usize>,
    /// Maps dimension names to their indices in the mesh.
    dims: HashMap<MeshDim, usize>,
}

impl ProcessMeshBuilder {
    /// Creates a new [`ProcessMeshBuilder`] with the given process ids and shape.
    ///
    /// # Arguments
    /// * `process_ids` - The process ids to be arranged in the mesh, row-major.
    /// * `shape` - A vector representing the shape (dimensions) of the mesh.
    pub fn new<S: Into<Vec<usize>>>(process_ids: Vec<ProcessId>, shape: S) -> Self {
        Self {
            process_ids,
            shape: shape.into(),
            dims: HashMap::new(),
        }
    }

    /// Adds a dimension to the logical mesh, associating it with a specific index.
    ///
    /// Each dimension represents a logical axis of parallelism and should correspond
    /// to a unique index in the shape of the mesh. Validation happens in [`build`](Self::build).
    ///
    /// # Example
    ///
    /// ```rust
    /// use burn_reshard::sharding::{MeshDim, ProcessMeshBuilder};
    ///
    /// let mesh = ProcessMeshBuilder::new(vec![0, 1, 2, 3], [2, 2])
    ///     .with_dim(0, MeshDim::new("data_parallel"))
    ///     .with_dim(1, MeshDim::new("tensor_parallel"))
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(mesh.shape(), &[2, 2]);
    /// ```
    pub fn with_dim(mut self, idx: usize, dim: MeshDim) -> Self {
        self.dims.insert(dim, idx);
        self
    }

    /// Builds a [`ProcessMesh`] from the current configuration.
    ///
    /// This method checks that all dimensions are correctly mapped, that the number of
    /// processes matches the expected shape and that no process appears twice. The last
    /// check is what makes positional pairing between two meshes a bijection.
    pub fn build(self) -> Result<ProcessMesh, ProcessMeshError> {
        let ndim = self.shape.len();
        let mut by_index: Vec<Option<MeshDim>> = alloc::vec![None; ndim];

        for (dim, &idx) in self.dims.iter() {
            if idx >= ndim {
                return Err(ProcessMeshError::InvalidDimension(format!(
                    "Index {} exceeds mesh shape {:?}",
                    idx, self.shape
                )));
            }
            if by_index[idx].is_some() {
                return Err(ProcessMeshError::InvalidDimension(format!(
                    "Dimension {} already mapped",
                    idx
                )));
            }
            by_index[idx] = Some(dim.clone());
        }

        let dims: Vec<MeshDim> = by_index.into_iter().flatten().collect();
        if dims.len() != ndim {
            return Err(ProcessMeshError::InvalidMesh(format!(
                "Not all mesh dimensions are mapped. Got {}, expected {}",
                dims.len(),
                ndim
            )));
        }

        let expected = self.shape.iter().product::<usize>();
        if self.process_ids.len() != expected {
            return Err(ProcessMeshError::InvalidMesh(format!(
                "Process count ({}) doesn't match mesh shape {:?}",
                self.process_ids.len(),
                self.shape,
            )));
        }

        let mut seen = HashSet::new();
        if let Some(dup) = self.process_ids.iter().find(|id| !seen.insert(**id)) {
            return Err(ProcessMeshError::InvalidMesh(format!(
                "Process {} appears more than once",
                dup
            )));
        }

        Ok(ProcessMesh {
            process_ids: self.process_ids,
            shape: self.shape,
            dims,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_process_mesh_2x2() {
        let mesh = ProcessMeshBuilder::new(vec![0, 1, 2, 3], [2, 2])
            .with_dim(0, MeshDim::new("x"))
            .with_dim(1, MeshDim::new("y"))
            .build()
            .unwrap();

        assert_eq!(mesh.ndim(), 2);
        assert_eq!(mesh.dim_names().collect::<Vec<_>>(), vec!["x", "y"]);
        assert!(mesh.contains(3));
        assert!(!mesh.contains(4));
    }

    #[test]
    fn test_process_mesh_default_dim_names() {
        let mesh = ProcessMesh::new(vec![4, 5, 6, 7], [2, 2]).unwrap();

        assert_eq!(mesh.dim_names().collect::<Vec<_>>(), vec!["d0", "d1"]);
        assert_eq!(mesh.process_ids(), &[4, 5, 6, 7]);
    }

    #[test]
    fn test_process_mesh_equality_depends_on_order() {
        let a = ProcessMesh::new(vec![0, 1], [2]).unwrap();
        let b = ProcessMesh::new(vec![1, 0], [2]).unwrap();

        assert_ne!(a, b);
        assert_eq!(a, ProcessMesh::new(vec![0, 1], [2]).unwrap());
    }

    #[test]
    #[should_panic = "InvalidDimension(\"Index 2 exceeds mesh shape [2, 2]\")"]
    fn test_process_mesh_dim_should_be_in_bound() {
        let _mesh = ProcessMeshBuilder::new(vec![0, 1, 2, 3], [2, 2])
            .with_dim(0, MeshDim::new("x"))
            .with_dim(2, MeshDim::new("y")) // out of bounds
            .build()
            .unwrap();
    }

    #[test]
    #[should_panic = "InvalidDimension(\"Dimension 0 already mapped\")"]
    fn test_process_mesh_dim_should_be_unique() {
        let _mesh = ProcessMeshBuilder::new(vec![0, 1, 2, 3], [2, 2])
            .with_dim(0, MeshDim::new("x"))
            .with_dim(0, MeshDim::new("y")) // already mapped
            .build()
            .unwrap();
    }

    #[test]
    #[should_panic = "InvalidMesh(\"Not all mesh dimensions are mapped."]
    fn test_process_mesh_dim_should_be_all_mapped() {
        let _mesh = ProcessMeshBuilder::new(vec![0, 1, 2, 3], [2, 2])
            .with_dim(0, MeshDim::new("x"))
            .build()
            .unwrap();
    }

    #[test]
    #[should_panic = "InvalidMesh(\"Process count (4) doesn't match mesh shape [3, 2]"]
    fn test_process_mesh_ids_should_match_shape() {
        let _mesh = ProcessMesh::new(vec![0, 1, 2, 3], [3, 2]).unwrap();
    }

    #[test]
    fn test_process_mesh_ids_should_be_unique() {
        let err = ProcessMesh::new(vec![0, 1, 1, 3], [2, 2]).unwrap_err();

        assert_eq!(
            err,
            ProcessMeshError::InvalidMesh("Process 1 appears more than once".into())
        );
    }
}
