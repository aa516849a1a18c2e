//! Shader graph subsystem: the finalized node network handed to the compiler.
//!
//! This module groups typed sockets, the closed set of node kinds, and the [`ShaderGraph`]
//! arena that owns every node and link of one shader. Graphs are assumed acyclic and already
//! finalized (bump expansion, closure weighting and constant folding happen upstream).
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub mod node;
pub mod shader_graph;
pub mod socket;
pub mod variant;

pub use node::{
    AovParams, DisplacementSpace, InputDecl, MathOp, MicrofacetDistribution, MixBlend, NodeKind,
    NodeRole, OutputDecl, SubsurfaceMethod, VectorMathOp,
};
pub use shader_graph::{ShaderGraph, ShaderNode};
pub use socket::{InputRef, OutputRef, ShaderInput, ShaderOutput, SocketType, SocketValue};
pub use variant::{ShaderType, VariantSet};

/// Dense node identifier, unique within one graph.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
