//! Instruction words and opcodes of the shader virtual machine.
use glam::Vec3;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Stack offset meaning "no slot": an unlinked optional input or an unused output.
pub const STACK_INVALID: u32 = 255;

/// Largest stack the kernel provides, in cells.
pub const SVM_STACK_SIZE: usize = 255;

/// Cells reserved to save shading state around the bump program.
pub const BUMP_EVAL_STATE_SIZE: usize = 9;

/// Jump-table entry for a variant with no program. Offset 0 is always a jump-table word,
/// never the start of a body.
pub const JUMP_ABSENT: u32 = 0;

/// Packs four 8-bit operands into one lane, `x` in the low byte.
#[inline]
pub fn encode_uchar4(x: u32, y: u32, z: u32, w: u32) -> u32 {
    debug_assert!(x <= 0xff && y <= 0xff && z <= 0xff && w <= 0xff);
    x | (y << 8) | (z << 16) | (w << 24)
}

/// Inverse of [`encode_uchar4`].
#[inline]
pub fn decode_uchar4(v: u32) -> [u32; 4] {
    [v & 0xff, (v >> 8) & 0xff, (v >> 16) & 0xff, v >> 24]
}

/// One 4-lane instruction word. Lane `x` holds the opcode except in continuation words.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SvmNode {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub w: u32,
}

impl SvmNode {
    #[inline]
    pub const fn new(x: u32, y: u32, z: u32, w: u32) -> Self {
        Self { x, y, z, w }
    }

    #[inline]
    pub const fn op(op: SvmOpcode, y: u32, z: u32, w: u32) -> Self {
        Self::new(op as u32, y, z, w)
    }

    /// Opcode word followed by a vector stored as float bits in the remaining lanes.
    #[inline]
    pub fn vector(op: SvmOpcode, v: Vec3) -> Self {
        Self::new(op as u32, v.x.to_bits(), v.y.to_bits(), v.z.to_bits())
    }

    pub fn opcode(&self) -> Option<SvmOpcode> {
        SvmOpcode::from_u32(self.x)
    }
}

macro_rules! opcodes {
    ($($name:ident => $text:literal, $words:literal;)*) => {
        /// Instruction opcodes understood by the kernel.
        #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum SvmOpcode {
            $($name,)*
        }

        impl SvmOpcode {
            const ALL: &'static [SvmOpcode] = &[$(SvmOpcode::$name,)*];

            pub fn from_u32(v: u32) -> Option<Self> {
                Self::ALL.get(v as usize).copied()
            }

            /// Mnemonic used in disassembly.
            pub fn name(self) -> &'static str {
                match self {
                    $(SvmOpcode::$name => $text,)*
                }
            }

            /// Words occupied by one instruction, including continuation words.
            pub fn word_count(self) -> usize {
                match self {
                    $(SvmOpcode::$name => $words,)*
                }
            }
        }
    };
}

opcodes! {
    End => "end", 1;
    ShaderJump => "shader_jump", 1;
    JumpIfZero => "jump_if_zero", 1;
    JumpIfOne => "jump_if_one", 1;
    ValueF => "value_f", 1;
    ValueV => "value_v", 2;
    ClosureSetWeight => "closure_set_weight", 1;
    ClosureWeight => "closure_weight", 1;
    ClosureBsdf => "closure_bsdf", 2;
    ClosureEmission => "closure_emission", 1;
    ClosureBackground => "closure_background", 1;
    ClosureHoldout => "closure_holdout", 1;
    ClosureVolume => "closure_volume", 1;
    ClosureSetNormal => "closure_set_normal", 1;
    MixClosure => "mix_closure", 1;
    Math => "math", 1;
    VectorMath => "vector_math", 1;
    Mix => "mix", 1;
    Invert => "invert", 1;
    Convert => "convert", 1;
    TexImage => "tex_image", 1;
    TexNoise => "tex_noise", 1;
    TexChecker => "tex_checker", 1;
    TexCoord => "tex_coord", 1;
    Geometry => "geometry", 1;
    Fresnel => "fresnel", 1;
    LayerWeight => "layer_weight", 1;
    LightPath => "light_path", 1;
    Attribute => "attribute", 1;
    AmbientOcclusion => "ambient_occlusion", 1;
    Bevel => "bevel", 1;
    SetBump => "set_bump", 1;
    EnterBumpEval => "enter_bump_eval", 1;
    LeaveBumpEval => "leave_bump_eval", 1;
    SetDisplacement => "set_displacement", 1;
    Displacement => "displacement", 1;
    AovStart => "aov_start", 1;
    AovColor => "aov_color", 1;
    AovValue => "aov_value", 1;
}

/// Closure identifiers encoded into closure instructions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ClosureType {
    BsdfDiffuse = 1,
    BsdfMicrofacetBeckmann,
    BsdfMicrofacetGgx,
    BsdfMicrofacetMultiGgx,
    BsdfAshikhminShirley,
    BsdfMicrofacetBeckmannGlass,
    BsdfMicrofacetGgxGlass,
    BsdfMicrofacetMultiGgxGlass,
    BsdfTransparent,
    BssrdfBurley,
    BssrdfRandomWalk,
    BssrdfRandomWalkFixedRadius,
    Emission,
    Background,
    Holdout,
    VolumeAbsorption,
    VolumeHenyeyGreenstein,
}
