//! Cache for compiled shader programs.
//!
//! Entries are keyed by shader name and invalidated by a fingerprint over the graph, the
//! displacement method and the compile options. Empty fallback programs are cached like any
//! other result, so a shader that does not fit is not recompiled every run.
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::scene::{compile_shader, Shader};
use crate::svm::compiler::CompileOptions;
use crate::svm::program::ShaderProgram;

struct ProgramEntry {
    program: ShaderProgram,
    fingerprint: u64,
}

/// Cache for compiled shader programs, keyed by shader name.
#[derive(Default)]
pub struct ShaderProgramCache {
    entries: HashMap<String, ProgramEntry>,
}

impl ShaderProgramCache {
    /// Creates a new, empty cache.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Cached program of the shader named `name`, stale or not.
    pub fn get(&self, name: &str) -> Option<&ShaderProgram> {
        self.entries.get(name).map(|e| &e.program)
    }

    /// Stores a program under `name`, replacing any previous entry.
    pub fn insert(&mut self, name: impl Into<String>, fingerprint: u64, program: ShaderProgram) {
        self.entries.insert(
            name.into(),
            ProgramEntry {
                program,
                fingerprint,
            },
        );
    }

    /// Removes and returns the entry for `name`.
    pub fn remove(&mut self, name: &str) -> Option<ShaderProgram> {
        self.entries.remove(name).map(|e| e.program)
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of cached shaders.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether [`Self::get_or_compile`] would compile `shader` instead of reusing an entry.
    pub fn needs_compile(&self, shader: &Shader, opts: &CompileOptions) -> bool {
        self.entries
            .get(&shader.name)
            .is_none_or(|entry| entry.fingerprint != fingerprint(shader, opts))
    }

    /// Returns the cached program for `shader`, compiling it when missing or stale.
    pub fn get_or_compile(&mut self, shader: &Shader, opts: &CompileOptions) -> &ShaderProgram {
        let fp = fingerprint(shader, opts);
        let entry = self
            .entries
            .entry(shader.name.clone())
            .and_modify(|entry| {
                if entry.fingerprint != fp {
                    entry.program = compile_shader(shader, opts);
                    entry.fingerprint = fp;
                }
            })
            .or_insert_with(|| ProgramEntry {
                program: compile_shader(shader, opts),
                fingerprint: fp,
            });
        &entry.program
    }
}

/// Hash of everything that affects the compiled words of `shader`.
pub fn fingerprint(shader: &Shader, opts: &CompileOptions) -> u64 {
    let mut hasher = DefaultHasher::new();
    shader.displacement_method.hash(&mut hasher);
    opts.hash(&mut hasher);

    for node in shader.graph.nodes_by_id() {
        node.id.hash(&mut hasher);
        node.kind.hash_params(&mut hasher);
        for input in &node.inputs {
            input.name.hash(&mut hasher);
            input.ty.hash(&mut hasher);
            input.value.hash_bits(&mut hasher);
            input.link.hash(&mut hasher);
            input.skip.bits().hash(&mut hasher);
        }
        for output in &node.outputs {
            output.name.hash(&mut hasher);
            output.ty.hash(&mut hasher);
        }
    }

    hasher.finish()
}
