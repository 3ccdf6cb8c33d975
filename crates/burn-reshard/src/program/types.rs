use alloc::vec::Vec;
use core::fmt;
use derive_new::new;
use serde::{Deserialize, Serialize};

/// Marker for a dimension whose size is only known at run time.
pub const DYNAMIC_DIM: i64 = -1;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// 16-bit float.
    F16,
    /// 16-bit brain float.
    BF16,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
    /// Boolean.
    Bool,
}

/// Static type of a program value: its local shape and element type.
#[derive(new, Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorType {
    shape: Vec<i64>,
    dtype: DataType,
}

impl TensorType {
    /// Local shape; [`DYNAMIC_DIM`] marks unknown sizes.
    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    /// Element type.
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Whether any dimension is unknown at compile time.
    pub fn is_dynamic(&self) -> bool {
        self.shape.contains(&DYNAMIC_DIM)
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor<")?;
        for dim in &self.shape {
            if *dim == DYNAMIC_DIM {
                write!(f, "?x")?;
            } else {
                write!(f, "{dim}x")?;
            }
        }
        write!(f, "{:?}>", self.dtype)
    }
}

/// Stream an operation is issued on.
///
/// Communication inserted by auto-parallel passes goes to [`ExecutionStream::Calc`] so that
/// it keeps a deterministic order with the computation around it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExecutionStream {
    /// The default calculation stream.
    #[default]
    #[serde(rename = "default")]
    Calc,
    /// Stream reserved for model-parallel communication.
    #[serde(rename = "auto_parallel_mp")]
    ModelParallel,
    /// Stream reserved for sharding communication.
    #[serde(rename = "auto_parallel_sharding")]
    Sharding,
}

impl ExecutionStream {
    /// Name of the stream as understood by the executor.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStream::Calc => "default",
            ExecutionStream::ModelParallel => "auto_parallel_mp",
            ExecutionStream::Sharding => "auto_parallel_sharding",
        }
    }
}
