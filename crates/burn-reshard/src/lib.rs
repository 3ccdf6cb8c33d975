#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Burn cross-mesh resharding.
//!
//! Relocates a distributed tensor from one process mesh to another mesh of the same shape,
//! keeping how it is split, replicated and reduced. Every worker rewrites its own replica of
//! the program and works out whether it sends, receives or only keeps a placeholder, without
//! talking to the others.

extern crate alloc;

mod config;

pub mod passes;
pub mod process_group;
pub mod program;
pub mod reshard;
pub mod sharding;

pub use config::*;
