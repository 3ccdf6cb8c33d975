//! Process meshes and tensor distribution descriptors.

mod mesh;
mod spec;

pub use mesh::*;
pub use spec::*;
