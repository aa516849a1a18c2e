//! Compiled shader programs.
//!
//! This module defines the data produced by compiling one [`crate::scene::Shader`]: the
//! instruction words of all its variants, the jump table locating each variant, the feature
//! flags the renderer uses to enable kernel features, and a listing ([`fmt::Display`]) for
//! debugging.
use std::fmt;
use std::ops::Range;

use bitflags::bitflags;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::graph::{ShaderType, VariantSet};
use crate::svm::opcode::{SvmNode, SvmOpcode, JUMP_ABSENT};

bitflags! {
    /// Features a compiled shader uses.
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ShaderFlags: u32 {
        const HAS_SURFACE = 1 << 0;
        const HAS_VOLUME = 1 << 1;
        const HAS_DISPLACEMENT = 1 << 2;
        const HAS_BUMP_VARIANT = 1 << 3;
        const HAS_SURFACE_TRANSPARENT = 1 << 4;
        const HAS_SURFACE_EMISSION = 1 << 5;
        const HAS_SURFACE_BSSRDF = 1 << 6;
        const HAS_BSSRDF_BUMP = 1 << 7;
        const HAS_BUMP = 1 << 8;
        const HAS_SURFACE_RAYTRACE = 1 << 9;
        const HAS_SURFACE_SPATIAL_VARYING = 1 << 10;
        const HAS_VOLUME_SPATIAL_VARYING = 1 << 11;
        const HAS_VOLUME_ATTRIBUTE_DEPENDENCY = 1 << 12;
        const HAS_INTEGRATOR_DEPENDENCY = 1 << 13;
        const HAS_AOV = 1 << 14;
    }
}

/// Entry offsets of a shader's variants; [`JUMP_ABSENT`] marks a variant without a program.
///
/// `bump` is where surface evaluation starts: the bump program when one exists, the surface
/// program otherwise.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct JumpTable {
    pub bump: u32,
    pub surface: u32,
    pub volume: u32,
    pub displacement: u32,
}

impl Default for JumpTable {
    fn default() -> Self {
        Self {
            bump: JUMP_ABSENT,
            surface: JUMP_ABSENT,
            volume: JUMP_ABSENT,
            displacement: JUMP_ABSENT,
        }
    }
}

impl JumpTable {
    pub fn entry(&self, variant: ShaderType) -> Option<u32> {
        let offset = match variant {
            ShaderType::Bump => self.bump,
            ShaderType::Surface => self.surface,
            ShaderType::Volume => self.volume,
            ShaderType::Displacement => self.displacement,
        };
        (offset != JUMP_ABSENT).then_some(offset)
    }

    /// Moves local offsets (body starting at 1) to a body starting at `node_offset`.
    pub(crate) fn rebase(&self, node_offset: u32) -> Self {
        let shift = |offset: u32| {
            if offset == JUMP_ABSENT {
                JUMP_ABSENT
            } else {
                offset - 1 + node_offset
            }
        };
        Self {
            bump: shift(self.bump),
            surface: shift(self.surface),
            volume: shift(self.volume),
            displacement: shift(self.displacement),
        }
    }

    /// The word the kernel reads to find this shader's programs.
    pub fn jump_word(&self) -> SvmNode {
        SvmNode::op(SvmOpcode::ShaderJump, self.bump, self.volume, self.displacement)
    }
}

/// Statistics of one shader compile.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompileSummary {
    /// Highest stack cell used by any variant, plus one.
    pub peak_stack_usage: usize,
    /// Words in the shader body, excluding its jump word.
    pub num_words: usize,
    /// Words per variant, indexed by [`ShaderType::index`].
    pub variant_words: [usize; 4],
}

impl CompileSummary {
    pub fn words_for(&self, variant: ShaderType) -> usize {
        self.variant_words[variant.index()]
    }
}

/// Output of compiling one variant.
#[derive(Clone, Debug, Default)]
pub(crate) struct VariantProgram {
    pub words: Vec<SvmNode>,
    pub peak_stack: usize,
    pub flags: ShaderFlags,
}

/// Concatenates variant programs behind a local jump word.
pub(crate) struct ProgramBuilder {
    words: Vec<SvmNode>,
    sections: [Option<Range<usize>>; 4],
    flags: ShaderFlags,
    summary: CompileSummary,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self {
            words: vec![SvmNode::default()],
            sections: Default::default(),
            flags: ShaderFlags::empty(),
            summary: CompileSummary::default(),
        }
    }

    pub fn append(&mut self, variant: ShaderType, program: VariantProgram) {
        let start = self.words.len();
        self.summary.variant_words[variant.index()] = program.words.len();
        self.summary.peak_stack_usage = self.summary.peak_stack_usage.max(program.peak_stack);
        self.flags |= program.flags;
        self.words.extend(program.words);
        self.sections[variant.index()] = Some(start..self.words.len());
    }

    pub fn insert_flags(&mut self, flags: ShaderFlags) {
        self.flags |= flags;
    }

    /// Builds the program; variants outside `linked` keep their stub but get no table entry.
    pub fn finish(mut self, name: &str, linked: VariantSet) -> ShaderProgram {
        let start = |variant: ShaderType| {
            self.sections[variant.index()]
                .as_ref()
                .filter(|_| linked.contains(variant.into()))
                .map_or(JUMP_ABSENT, |r| r.start as u32)
        };
        let surface = start(ShaderType::Surface);
        let table = JumpTable {
            bump: self.sections[ShaderType::Bump.index()]
                .as_ref()
                .map_or(surface, |r| r.start as u32),
            surface,
            volume: start(ShaderType::Volume),
            displacement: start(ShaderType::Displacement),
        };
        self.words[0] = table.jump_word();
        self.summary.num_words = self.words.len() - 1;
        ShaderProgram {
            name: name.to_string(),
            words: self.words,
            table,
            flags: self.flags,
            summary: self.summary,
            fallback: None,
            sections: self.sections,
        }
    }
}

/// All variant programs of one shader, as a self-contained block.
///
/// `words[0]` is the shader's jump word with local offsets; the body follows from index 1.
/// [`crate::scene::assemble::SceneProgram::assemble`] relocates bodies into the global program.
#[derive(Clone, Debug)]
pub struct ShaderProgram {
    pub name: String,
    pub words: Vec<SvmNode>,
    pub table: JumpTable,
    pub flags: ShaderFlags,
    pub summary: CompileSummary,
    /// Why this program was replaced by the empty program, if it was.
    pub fallback: Option<Error>,
    sections: [Option<Range<usize>>; 4],
}

impl ShaderProgram {
    /// The no-op program substituted when compilation fails: a single `end` that surface
    /// evaluation jumps to, with no volume or displacement program.
    pub fn empty(name: &str, reason: Error) -> Self {
        let mut builder = ProgramBuilder::new();
        builder.append(
            ShaderType::Surface,
            VariantProgram {
                words: vec![SvmNode::op(SvmOpcode::End, 0, 0, 0)],
                ..Default::default()
            },
        );
        let mut program = builder.finish(name, VariantSet::SURFACE);
        program.fallback = Some(reason);
        program
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    /// Words after the jump word.
    pub fn body(&self) -> &[SvmNode] {
        &self.words[1..]
    }

    /// Local words of one variant, including stubs of unlinked variants.
    pub fn section(&self, variant: ShaderType) -> Option<&[SvmNode]> {
        self.sections[variant.index()]
            .clone()
            .map(|range| &self.words[range])
    }

    pub fn section_start(&self, variant: ShaderType) -> Option<usize> {
        self.sections[variant.index()].as_ref().map(|r| r.start)
    }
}

impl fmt::Display for ShaderProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "shader \"{}\" flags={:?}", self.name, self.flags)?;
        if let Some(reason) = &self.fallback {
            writeln!(f, "; empty program: {reason}")?;
        }
        write_listing(f, &self.words, 0)
    }
}

fn offset_text(offset: u32) -> String {
    if offset == JUMP_ABSENT {
        "-".to_string()
    } else {
        offset.to_string()
    }
}

/// Writes one line per instruction; `base` is the global index of `words[0]`.
pub(crate) fn write_listing(f: &mut fmt::Formatter<'_>, words: &[SvmNode], base: usize) -> fmt::Result {
    let mut i = 0;
    while i < words.len() {
        let word = words[i];
        let at = base + i;
        let Some(op) = word.opcode() else {
            writeln!(f, "{at:>6}: .data {} {} {} {}", word.x, word.y, word.z, word.w)?;
            i += 1;
            continue;
        };
        match op {
            SvmOpcode::End | SvmOpcode::AovStart => writeln!(f, "{at:>6}: {}", op.name())?,
            SvmOpcode::ShaderJump => writeln!(
                f,
                "{at:>6}: {} surface={} volume={} displacement={}",
                op.name(),
                offset_text(word.y),
                offset_text(word.z),
                offset_text(word.w)
            )?,
            SvmOpcode::JumpIfZero | SvmOpcode::JumpIfOne => writeln!(
                f,
                "{at:>6}: {} +{} (-> {}) fac={}",
                op.name(),
                word.y,
                at + word.y as usize,
                word.z
            )?,
            SvmOpcode::ValueF => writeln!(
                f,
                "{at:>6}: {} {} -> {}",
                op.name(),
                f32::from_bits(word.y),
                word.z
            )?,
            SvmOpcode::ClosureSetWeight => writeln!(
                f,
                "{at:>6}: {} ({}, {}, {})",
                op.name(),
                f32::from_bits(word.y),
                f32::from_bits(word.z),
                f32::from_bits(word.w)
            )?,
            SvmOpcode::ValueV => {
                let value = words.get(i + 1).copied().unwrap_or_default();
                writeln!(
                    f,
                    "{at:>6}: {} ({}, {}, {}) -> {}",
                    op.name(),
                    f32::from_bits(value.y),
                    f32::from_bits(value.z),
                    f32::from_bits(value.w),
                    word.y
                )?;
            }
            _ => writeln!(f, "{at:>6}: {} {} {} {}", op.name(), word.y, word.z, word.w)?,
        }
        if op == SvmOpcode::ClosureBsdf {
            if let Some(data) = words.get(i + 1) {
                writeln!(
                    f,
                    "{:>6}: .data {} {} {} {}",
                    at + 1,
                    data.x,
                    data.y,
                    data.z,
                    data.w
                )?;
            }
        }
        i += op.word_count();
    }
    Ok(())
}
