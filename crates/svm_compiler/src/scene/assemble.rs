//! Assembly of per-shader programs into the global program the kernel reads.
//!
//! The global program starts with one jump word per shader, in shader order, so the kernel
//! finds shader `i` at word `i`. Shader bodies follow back to back. Each jump word is
//! rewritten from the shader's local offsets to the global position of its body.
use std::fmt;

use crate::graph::ShaderType;
use crate::svm::opcode::SvmNode;
use crate::svm::program::{write_listing, CompileSummary, JumpTable, ShaderFlags, ShaderProgram};

/// Per-shader metadata of an assembled scene.
#[derive(Clone, Debug, PartialEq)]
pub struct ShaderEntry {
    pub name: String,
    /// Entry points in global offsets.
    pub table: JumpTable,
    pub flags: ShaderFlags,
    pub summary: CompileSummary,
    /// Whether the shader was replaced by the empty program.
    pub failed: bool,
}

/// The global program of a scene.
#[derive(Clone, Debug, Default)]
pub struct SceneProgram {
    words: Vec<SvmNode>,
    shaders: Vec<ShaderEntry>,
}

impl SceneProgram {
    /// Concatenates compiled shaders in iteration order.
    pub fn assemble<'p>(programs: impl IntoIterator<Item = &'p ShaderProgram>) -> Self {
        let programs: Vec<&ShaderProgram> = programs.into_iter().collect();
        let body_words: usize = programs.iter().map(|p| p.body().len()).sum();

        let mut words = Vec::with_capacity(programs.len() + body_words);
        words.resize(programs.len(), SvmNode::default());
        let mut shaders = Vec::with_capacity(programs.len());

        for (index, program) in programs.iter().enumerate() {
            let table = program.table.rebase(words.len() as u32);
            words[index] = table.jump_word();
            words.extend_from_slice(program.body());
            shaders.push(ShaderEntry {
                name: program.name.clone(),
                table,
                flags: program.flags,
                summary: program.summary.clone(),
                failed: program.is_fallback(),
            });
        }

        Self { words, shaders }
    }

    /// Every word of the scene, jump words first.
    pub fn words(&self) -> &[SvmNode] {
        &self.words
    }

    pub fn into_words(self) -> Vec<SvmNode> {
        self.words
    }

    pub fn shaders(&self) -> &[ShaderEntry] {
        &self.shaders
    }

    /// Metadata of the shader at `index`.
    pub fn shader(&self, index: usize) -> Option<&ShaderEntry> {
        self.shaders.get(index)
    }

    /// Index of the first shader with this name.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.shaders.iter().position(|s| s.name == name)
    }

    /// Global offset of a variant program, `None` when the shader has none.
    pub fn entry(&self, index: usize, variant: ShaderType) -> Option<u32> {
        self.shaders.get(index)?.table.entry(variant)
    }

    /// Number of shaders replaced by the empty program.
    pub fn failed_count(&self) -> usize {
        self.shaders.iter().filter(|s| s.failed).count()
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

impl fmt::Display for SceneProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, shader) in self.shaders.iter().enumerate() {
            let status = if shader.failed { " (empty program)" } else { "" };
            writeln!(f, "; shader {index} \"{}\"{status} flags={:?}", shader.name, shader.flags)?;
        }
        write_listing(f, &self.words, 0)
    }
}
