//! Scene-level compilation: shaders, the empty-program fallback, assembly into one global
//! program, caching and batch runs with events.
pub mod assemble;
pub mod cache;
pub mod events;
pub mod runner;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::Error;
use crate::graph::ShaderGraph;
use crate::svm::compiler::{CompileOptions, SvmCompiler};
use crate::svm::program::ShaderProgram;

/// How a shader's displacement output is applied.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DisplacementMethod {
    /// Shading normals only, through the bump program.
    #[default]
    Bump,
    /// Actual geometry displacement, no bump program.
    True,
    /// Displace geometry and bump the remaining detail.
    Both,
}

/// A named shading graph ready for compilation.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug)]
pub struct Shader {
    pub name: String,
    pub graph: ShaderGraph,
    #[cfg_attr(feature = "serde", serde(default))]
    pub displacement_method: DisplacementMethod,
}

impl Shader {
    pub fn new(name: impl Into<String>, graph: ShaderGraph) -> Self {
        Self {
            name: name.into(),
            graph,
            displacement_method: DisplacementMethod::default(),
        }
    }

    pub fn with_displacement_method(mut self, method: DisplacementMethod) -> Self {
        self.displacement_method = method;
        self
    }
}

/// Compiles a shader, substituting the empty program when compilation fails.
///
/// Stack exhaustion is an expected outcome for oversized shaders and logs a warning; any
/// other failure points at a malformed graph and logs an error. The cause is kept in
/// [`ShaderProgram::fallback`].
pub fn compile_shader(shader: &Shader, opts: &CompileOptions) -> ShaderProgram {
    match SvmCompiler::compile(shader, opts) {
        Ok(program) => program,
        Err(err) => {
            match &err {
                Error::StackOverflow { .. } => warn!(
                    "Out of SVM stack space, shader \"{}\" too big; using empty program.",
                    shader.name
                ),
                _ => error!(
                    "Failed to compile shader \"{}\": {}; using empty program.",
                    shader.name, err
                ),
            }
            ShaderProgram::empty(&shader.name, err)
        }
    }
}
