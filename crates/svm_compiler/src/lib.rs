#![forbid(unsafe_code)]
//! svm_compiler: compile finalized shading node graphs into stack-machine (SVM) bytecode.
//!
//! Modules:
//! - graph: typed sockets, node kinds and the shader graph arena
//! - svm: opcodes, stack allocator, dependency scheduler, closure-tree compiler and node emitters
//! - scene: shader-variant driver, scene assembly with jump tables, program cache, runner, events
//!
//! The compiler is single-threaded per shader. Independent shaders may be compiled on
//! separate threads and stitched together with [`scene::assemble::SceneProgram::assemble`].
pub mod error;
pub mod graph;
pub mod scene;
pub mod svm;

/// Convenient re-exports for common types. Import with `use svm_compiler::prelude::*;`.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::graph::{
        AovParams, DisplacementSpace, MathOp, MicrofacetDistribution, MixBlend, NodeId, NodeKind,
        NodeRole, OutputRef, ShaderGraph, ShaderInput, ShaderNode, ShaderOutput, ShaderType,
        SocketType, SocketValue, SubsurfaceMethod, VariantSet, VectorMathOp,
    };
    pub use crate::scene::assemble::{SceneProgram, ShaderEntry};
    pub use crate::scene::cache::ShaderProgramCache;
    pub use crate::scene::events::{
        CompileEvent, CompileEventKind, EventSink, FnSink, MultiSink, VecSink,
    };
    pub use crate::scene::runner::{compile_scene, compile_scene_with_events, CancelFlag, SceneCompiler};
    pub use crate::scene::{compile_shader, DisplacementMethod, Shader};
    pub use crate::svm::compiler::{CompileOptions, SvmCompiler};
    pub use crate::svm::opcode::{ClosureType, SvmNode, SvmOpcode, JUMP_ABSENT, STACK_INVALID};
    pub use crate::svm::program::{CompileSummary, JumpTable, ShaderFlags, ShaderProgram};
}
