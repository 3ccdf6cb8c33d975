//! Resharding strategies.
//!
//! A strategy turns a value distributed as `src` into a value distributed as `dst` by
//! rewriting the local copy of the program. Every worker runs the same strategy on its own
//! copy; the inserted communication is what ties the copies together.

mod same_status;

pub use same_status::*;

use alloc::boxed::Box;
use alloc::vec::Vec;
use log::debug;
use thiserror::Error;

use crate::config::ReshardConfig;
use crate::process_group::ProcessGroupRegistry;
use crate::program::{Program, ProgramError, TensorType, ValueId};
use crate::sharding::{ProcessId, TensorDistAttr};

/// Errors raised while resharding a value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReshardError {
    /// A received tensor must have a fully static type.
    #[error(
        "cannot receive {value} with dynamic type {ty}: \
         dynamic shapes are not supported by cross-mesh resharding"
    )]
    DynamicShape {
        /// Value being resharded.
        value: ValueId,
        /// Requested destination type.
        ty: TensorType,
    },
    /// The rank belongs to one of the meshes but to none of the transfer pairs.
    #[error("rank {rank} belongs to the source or destination mesh but to no transfer pair")]
    UnassignedRole {
        /// The current rank.
        rank: ProcessId,
    },
    /// The meshes share a rank at different positions, so it would both send and receive.
    #[error("rank {rank} appears in more than one transfer pair")]
    OverlappingPairs {
        /// The shared rank.
        rank: ProcessId,
    },
    /// No registered strategy can perform the relocation.
    #[error("no reshard function can convert {value} from {src:?} to {dst:?}")]
    Unsupported {
        /// Value being resharded.
        value: ValueId,
        /// Source distribution.
        src: TensorDistAttr,
        /// Destination distribution.
        dst: TensorDistAttr,
    },
    /// The program rejected a lookup or mutation.
    #[error(transparent)]
    Program(#[from] ProgramError),
}

/// Everything a strategy may touch on the current worker.
pub struct ReshardContext<'a> {
    /// Local copy of the program.
    pub program: &'a mut Program,
    /// Process-wide group cache.
    pub groups: &'a ProcessGroupRegistry,
    /// Global rank of the current worker.
    pub cur_rank: ProcessId,
    /// Rewrite settings.
    pub config: ReshardConfig,
}

impl<'a> ReshardContext<'a> {
    /// A context with the default config.
    pub fn new(
        program: &'a mut Program,
        groups: &'a ProcessGroupRegistry,
        cur_rank: ProcessId,
    ) -> Self {
        Self {
            program,
            groups,
            cur_rank,
            config: ReshardConfig::default(),
        }
    }

    /// Replaces the config.
    pub fn with_config(mut self, config: ReshardConfig) -> Self {
        self.config = config;
        self
    }
}

/// A way of converting a value between two distributions.
pub trait ReshardFunction: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Whether this strategy can convert `src` into `dst`. Has no side effect.
    fn is_suitable(&self, src: &TensorDistAttr, dst: &TensorDistAttr) -> bool;

    /// Rewrites the local program so that it produces `src_value` distributed as `dst`, and
    /// returns the value standing for it on the current worker.
    fn reshard(
        &self,
        ctx: &mut ReshardContext<'_>,
        src: &TensorDistAttr,
        dst: &TensorDistAttr,
        src_value: ValueId,
        dst_type: &TensorType,
    ) -> Result<ValueId, ReshardError>;
}

/// Strategies tried in priority order.
pub struct ReshardFunctionRegistry {
    functions: Vec<Box<dyn ReshardFunction>>,
}

impl Default for ReshardFunctionRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(SameStatusReshardFunction);
        registry
    }
}

impl ReshardFunctionRegistry {
    /// A registry with no strategy.
    pub fn empty() -> Self {
        Self {
            functions: Vec::new(),
        }
    }

    /// Appends a strategy with the lowest priority so far.
    pub fn register<F: ReshardFunction + 'static>(&mut self, function: F) {
        self.functions.push(Box::new(function));
    }

    /// First strategy able to convert `src` into `dst`.
    pub fn choose(
        &self,
        src: &TensorDistAttr,
        dst: &TensorDistAttr,
    ) -> Option<&dyn ReshardFunction> {
        self.functions
            .iter()
            .map(|function| &**function)
            .find(|function| function.is_suitable(src, dst))
    }

    /// Reshards with the first suitable strategy.
    pub fn reshard(
        &self,
        ctx: &mut ReshardContext<'_>,
        src: &TensorDistAttr,
        dst: &TensorDistAttr,
        src_value: ValueId,
        dst_type: &TensorType,
    ) -> Result<ValueId, ReshardError> {
        let function = self.choose(src, dst).ok_or_else(|| ReshardError::Unsupported {
            value: src_value,
            src: src.clone(),
            dst: dst.clone(),
        })?;
        debug!("Resharding {} with {}", src_value, function.name());
        function.reshard(ctx, src, dst, src_value, dst_type)
    }
}
