//! Shader program variants and per-variant input masks.
use std::fmt;

use bitflags::bitflags;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// One of the programs a shader is compiled into.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderType {
    /// Surface scattering closures.
    Surface,
    /// Participating media closures.
    Volume,
    /// Geometric displacement vector.
    Displacement,
    /// Perturbed shading normal evaluated ahead of the surface program.
    Bump,
}

impl ShaderType {
    /// All variants in scene layout order.
    pub const ALL: [ShaderType; 4] = [
        ShaderType::Bump,
        ShaderType::Surface,
        ShaderType::Volume,
        ShaderType::Displacement,
    ];

    /// Name of the output-node input this variant compiles from.
    pub fn terminal(self) -> &'static str {
        match self {
            ShaderType::Surface => "Surface",
            ShaderType::Volume => "Volume",
            ShaderType::Displacement => "Displacement",
            ShaderType::Bump => "Normal",
        }
    }

    /// Name of the hidden closure input carrying the mix weight in this variant.
    pub fn mix_weight_input(self) -> &'static str {
        match self {
            ShaderType::Volume => "VolumeMixWeight",
            _ => "SurfaceMixWeight",
        }
    }

    /// Dense index, stable across runs.
    pub fn index(self) -> usize {
        match self {
            ShaderType::Bump => 0,
            ShaderType::Surface => 1,
            ShaderType::Volume => 2,
            ShaderType::Displacement => 3,
        }
    }
}

impl fmt::Display for ShaderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShaderType::Surface => "surface",
            ShaderType::Volume => "volume",
            ShaderType::Displacement => "displacement",
            ShaderType::Bump => "bump",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Set of [`ShaderType`]s, used to mark inputs that are ignored in some variants.
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct VariantSet: u8 {
        const SURFACE = 1 << 0;
        const VOLUME = 1 << 1;
        const DISPLACEMENT = 1 << 2;
        const BUMP = 1 << 3;
    }
}

impl From<ShaderType> for VariantSet {
    fn from(value: ShaderType) -> Self {
        match value {
            ShaderType::Surface => VariantSet::SURFACE,
            ShaderType::Volume => VariantSet::VOLUME,
            ShaderType::Displacement => VariantSet::DISPLACEMENT,
            ShaderType::Bump => VariantSet::BUMP,
        }
    }
}
