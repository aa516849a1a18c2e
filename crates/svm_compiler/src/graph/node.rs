//! Node kinds of a finalized shading network.
//!
//! A [`NodeKind`] fixes the socket layout of a node (see [`NodeKind::input_decls`] and
//! [`NodeKind::output_decls`]), its structural [`NodeRole`] and the feature bits the compiler
//! folds into per-shader flags. Kinds are a closed set; each maps to one emitter in
//! [`crate::svm::emit`].
use std::hash::{Hash, Hasher};

use glam::Vec3;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::graph::socket::{SocketType, SocketValue};

/// Structural role of a node as seen by the closure-tree compiler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeRole {
    /// Computes values from values.
    Plain,
    /// Produces a closure (BSDF, emission, volume, ...).
    Closure,
    /// Mix or add of two closures.
    CombineClosure,
    /// The shader output terminal.
    Output,
    /// Normal perturbation; dropped from the displacement program.
    Bump,
    /// Arbitrary output variable written after the surface program.
    Aov,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MathOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Power,
    Minimum,
    Maximum,
    Sine,
    Cosine,
    Absolute,
    MultiplyAdd,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VectorMathOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Cross,
    Dot,
    Normalize,
    Length,
    Scale,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MixBlend {
    Mix,
    Add,
    Multiply,
    Screen,
    Overlay,
    Subtract,
    Divide,
    Difference,
    Darken,
    Lighten,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MicrofacetDistribution {
    Beckmann,
    Ggx,
    MultiGgx,
    AshikhminShirley,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubsurfaceMethod {
    Burley,
    RandomWalk,
    RandomWalkFixedRadius,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DisplacementSpace {
    Object,
    World,
}

/// Parameters of an output-variable node.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AovParams {
    pub name: String,
    /// Film pass slot; `None` when the film has no pass of this name and the node is dead.
    pub slot: Option<u32>,
    /// Write the `Color` input instead of `Value`.
    pub is_color: bool,
}

/// Operation performed by a node.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub enum NodeKind {
    Output,
    OutputAov(AovParams),

    Value { value: f32 },
    Color { value: Vec3 },
    Math { op: MathOp, clamp: bool },
    VectorMath { op: VectorMathOp },
    MixColor { blend: MixBlend, clamp: bool },
    Invert,
    Convert { from: SocketType, to: SocketType },
    ImageTexture { slot: u32 },
    NoiseTexture,
    CheckerTexture,
    TextureCoordinate,
    Geometry,
    Fresnel,
    LayerWeight,
    LightPath,
    Attribute { id: u32 },
    AmbientOcclusion { samples: u32 },
    Bevel { samples: u32 },

    MixClosureWeight,
    Bump { invert: bool, object_space: bool },
    SetNormal,
    Displacement { space: DisplacementSpace },

    DiffuseBsdf,
    GlossyBsdf { distribution: MicrofacetDistribution },
    GlassBsdf { distribution: MicrofacetDistribution },
    TransparentBsdf,
    SubsurfaceScattering { method: SubsurfaceMethod },
    Emission,
    Background,
    Holdout,
    AbsorptionVolume,
    ScatterVolume,

    MixClosure,
    AddClosure,
}

/// Declaration of an input socket in a node kind's layout.
#[derive(Clone, Debug, PartialEq)]
pub struct InputDecl {
    pub name: &'static str,
    pub ty: SocketType,
    pub default: SocketValue,
}

/// Declaration of an output socket in a node kind's layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputDecl {
    pub name: &'static str,
    pub ty: SocketType,
}

fn float_in(name: &'static str, value: f32) -> InputDecl {
    InputDecl {
        name,
        ty: SocketType::Float,
        default: SocketValue::Float(value),
    }
}

fn color_in(name: &'static str, value: f32) -> InputDecl {
    InputDecl {
        name,
        ty: SocketType::Color,
        default: SocketValue::Vector(Vec3::splat(value)),
    }
}

fn vector_in(name: &'static str, ty: SocketType) -> InputDecl {
    InputDecl {
        name,
        ty,
        default: SocketValue::Vector(Vec3::ZERO),
    }
}

fn closure_in(name: &'static str) -> InputDecl {
    InputDecl {
        name,
        ty: SocketType::Closure,
        default: SocketValue::None,
    }
}

fn surface_weight() -> InputDecl {
    float_in("SurfaceMixWeight", 1.0)
}

fn volume_weight() -> InputDecl {
    float_in("VolumeMixWeight", 1.0)
}

fn out(name: &'static str, ty: SocketType) -> OutputDecl {
    OutputDecl { name, ty }
}

impl NodeKind {
    pub fn value(value: f32) -> Self {
        NodeKind::Value { value }
    }

    pub fn color(value: Vec3) -> Self {
        NodeKind::Color { value }
    }

    pub fn math(op: MathOp) -> Self {
        NodeKind::Math { op, clamp: false }
    }

    pub fn vector_math(op: VectorMathOp) -> Self {
        NodeKind::VectorMath { op }
    }

    pub fn mix_color(blend: MixBlend) -> Self {
        NodeKind::MixColor {
            blend,
            clamp: false,
        }
    }

    pub fn glossy(distribution: MicrofacetDistribution) -> Self {
        NodeKind::GlossyBsdf { distribution }
    }

    pub fn glass(distribution: MicrofacetDistribution) -> Self {
        NodeKind::GlassBsdf { distribution }
    }

    pub fn bump() -> Self {
        NodeKind::Bump {
            invert: false,
            object_space: false,
        }
    }

    pub fn aov_color(name: impl Into<String>, slot: u32) -> Self {
        NodeKind::OutputAov(AovParams {
            name: name.into(),
            slot: Some(slot),
            is_color: true,
        })
    }

    pub fn aov_value(name: impl Into<String>, slot: u32) -> Self {
        NodeKind::OutputAov(AovParams {
            name: name.into(),
            slot: Some(slot),
            is_color: false,
        })
    }

    /// Short type tag used in logs and disassembly.
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Output => "output",
            NodeKind::OutputAov(_) => "output_aov",
            NodeKind::Value { .. } => "value",
            NodeKind::Color { .. } => "color",
            NodeKind::Math { .. } => "math",
            NodeKind::VectorMath { .. } => "vector_math",
            NodeKind::MixColor { .. } => "mix",
            NodeKind::Invert => "invert",
            NodeKind::Convert { .. } => "convert",
            NodeKind::ImageTexture { .. } => "image_texture",
            NodeKind::NoiseTexture => "noise_texture",
            NodeKind::CheckerTexture => "checker_texture",
            NodeKind::TextureCoordinate => "texture_coordinate",
            NodeKind::Geometry => "geometry",
            NodeKind::Fresnel => "fresnel",
            NodeKind::LayerWeight => "layer_weight",
            NodeKind::LightPath => "light_path",
            NodeKind::Attribute { .. } => "attribute",
            NodeKind::AmbientOcclusion { .. } => "ambient_occlusion",
            NodeKind::Bevel { .. } => "bevel",
            NodeKind::MixClosureWeight => "mix_closure_weight",
            NodeKind::Bump { .. } => "bump",
            NodeKind::SetNormal => "set_normal",
            NodeKind::Displacement { .. } => "displacement",
            NodeKind::DiffuseBsdf => "diffuse_bsdf",
            NodeKind::GlossyBsdf { .. } => "glossy_bsdf",
            NodeKind::GlassBsdf { .. } => "glass_bsdf",
            NodeKind::TransparentBsdf => "transparent_bsdf",
            NodeKind::SubsurfaceScattering { .. } => "subsurface_scattering",
            NodeKind::Emission => "emission",
            NodeKind::Background => "background",
            NodeKind::Holdout => "holdout",
            NodeKind::AbsorptionVolume => "absorption_volume",
            NodeKind::ScatterVolume => "scatter_volume",
            NodeKind::MixClosure => "mix_closure",
            NodeKind::AddClosure => "add_closure",
        }
    }

    pub fn role(&self) -> NodeRole {
        match self {
            NodeKind::Output => NodeRole::Output,
            NodeKind::OutputAov(_) => NodeRole::Aov,
            NodeKind::Bump { .. } => NodeRole::Bump,
            NodeKind::MixClosure | NodeKind::AddClosure => NodeRole::CombineClosure,
            NodeKind::DiffuseBsdf
            | NodeKind::GlossyBsdf { .. }
            | NodeKind::GlassBsdf { .. }
            | NodeKind::TransparentBsdf
            | NodeKind::SubsurfaceScattering { .. }
            | NodeKind::Emission
            | NodeKind::Background
            | NodeKind::Holdout
            | NodeKind::AbsorptionVolume
            | NodeKind::ScatterVolume => NodeRole::Closure,
            _ => NodeRole::Plain,
        }
    }

    /// Input sockets in declaration order.
    pub fn input_decls(&self) -> Vec<InputDecl> {
        use SocketType::*;
        match self {
            NodeKind::Output => vec![
                closure_in("Surface"),
                closure_in("Volume"),
                vector_in("Displacement", Vector),
                vector_in("Normal", Normal),
            ],
            NodeKind::OutputAov(_) => vec![color_in("Color", 0.0), float_in("Value", 0.0)],
            NodeKind::Value { .. }
            | NodeKind::Color { .. }
            | NodeKind::TextureCoordinate
            | NodeKind::Geometry
            | NodeKind::LightPath
            | NodeKind::Attribute { .. } => Vec::new(),
            NodeKind::Math { .. } => vec![
                float_in("Value1", 0.5),
                float_in("Value2", 0.5),
                float_in("Value3", 0.0),
            ],
            NodeKind::VectorMath { .. } => vec![
                vector_in("Vector1", Vector),
                vector_in("Vector2", Vector),
                vector_in("Vector3", Vector),
                float_in("Scale", 1.0),
            ],
            NodeKind::MixColor { .. } => vec![
                float_in("Fac", 0.5),
                color_in("Color1", 0.0),
                color_in("Color2", 0.0),
            ],
            NodeKind::Invert => vec![float_in("Fac", 1.0), color_in("Color", 0.0)],
            NodeKind::Convert { from, .. } => vec![InputDecl {
                name: "Value",
                ty: *from,
                default: if from.stack_size() == 3 {
                    SocketValue::Vector(Vec3::ZERO)
                } else {
                    SocketValue::Float(0.0)
                },
            }],
            NodeKind::ImageTexture { .. } => vec![vector_in("Vector", Point)],
            NodeKind::NoiseTexture => vec![
                vector_in("Vector", Point),
                float_in("Scale", 5.0),
                float_in("Detail", 2.0),
                float_in("Roughness", 0.5),
                float_in("Distortion", 0.0),
            ],
            NodeKind::CheckerTexture => vec![
                vector_in("Vector", Point),
                color_in("Color1", 0.8),
                color_in("Color2", 0.2),
                float_in("Scale", 1.0),
            ],
            NodeKind::Fresnel => vec![vector_in("Normal", Normal), float_in("IOR", 1.45)],
            NodeKind::LayerWeight => vec![vector_in("Normal", Normal), float_in("Blend", 0.5)],
            NodeKind::AmbientOcclusion { .. } => vec![
                color_in("Color", 1.0),
                float_in("Distance", 1.0),
                vector_in("Normal", Normal),
            ],
            NodeKind::Bevel { .. } => vec![float_in("Radius", 0.05), vector_in("Normal", Normal)],
            NodeKind::MixClosureWeight => vec![float_in("Weight", 1.0), float_in("Fac", 1.0)],
            NodeKind::Bump { .. } => vec![
                float_in("SampleCenter", 0.0),
                float_in("SampleX", 0.0),
                float_in("SampleY", 0.0),
                vector_in("Normal", Normal),
                float_in("Strength", 1.0),
                float_in("Distance", 0.1),
            ],
            NodeKind::SetNormal => vec![vector_in("Direction", Vector)],
            NodeKind::Displacement { .. } => vec![
                float_in("Height", 0.0),
                float_in("Midlevel", 0.5),
                float_in("Scale", 1.0),
                vector_in("Normal", Normal),
            ],
            NodeKind::DiffuseBsdf => vec![
                color_in("Color", 0.8),
                float_in("Roughness", 0.0),
                vector_in("Normal", Normal),
                surface_weight(),
            ],
            NodeKind::GlossyBsdf { .. } => vec![
                color_in("Color", 0.8),
                float_in("Roughness", 0.5),
                vector_in("Normal", Normal),
                vector_in("Tangent", Vector),
                surface_weight(),
            ],
            NodeKind::GlassBsdf { .. } => vec![
                color_in("Color", 1.0),
                float_in("Roughness", 0.0),
                float_in("IOR", 1.45),
                vector_in("Normal", Normal),
                surface_weight(),
            ],
            NodeKind::TransparentBsdf => vec![color_in("Color", 1.0), surface_weight()],
            NodeKind::SubsurfaceScattering { .. } => vec![
                color_in("Color", 0.8),
                float_in("Scale", 0.01),
                InputDecl {
                    name: "Radius",
                    ty: Vector,
                    default: SocketValue::Vector(Vec3::new(1.0, 0.2, 0.1)),
                },
                float_in("IOR", 1.4),
                float_in("Anisotropy", 0.0),
                vector_in("Normal", Normal),
                surface_weight(),
            ],
            NodeKind::Emission | NodeKind::Background => vec![
                color_in("Color", 0.8),
                float_in("Strength", 1.0),
                surface_weight(),
            ],
            NodeKind::Holdout => vec![surface_weight(), volume_weight()],
            NodeKind::AbsorptionVolume => vec![
                color_in("Color", 0.8),
                float_in("Density", 1.0),
                volume_weight(),
            ],
            NodeKind::ScatterVolume => vec![
                color_in("Color", 0.8),
                float_in("Density", 1.0),
                float_in("Anisotropy", 0.0),
                volume_weight(),
            ],
            NodeKind::MixClosure => vec![
                float_in("Fac", 0.5),
                closure_in("Closure1"),
                closure_in("Closure2"),
            ],
            NodeKind::AddClosure => vec![closure_in("Closure1"), closure_in("Closure2")],
        }
    }

    /// Output sockets in declaration order.
    pub fn output_decls(&self) -> Vec<OutputDecl> {
        use SocketType::*;
        match self {
            NodeKind::Output | NodeKind::OutputAov(_) => Vec::new(),
            NodeKind::Value { .. } => vec![out("Value", Float)],
            NodeKind::Color { .. } => vec![out("Color", Color)],
            NodeKind::Math { .. } => vec![out("Value", Float)],
            NodeKind::VectorMath { .. } => vec![out("Value", Float), out("Vector", Vector)],
            NodeKind::MixColor { .. } | NodeKind::Invert => vec![out("Color", Color)],
            NodeKind::Convert { to, .. } => vec![out("Value", *to)],
            NodeKind::ImageTexture { .. } => vec![out("Color", Color), out("Alpha", Float)],
            NodeKind::NoiseTexture => vec![out("Fac", Float), out("Color", Color)],
            NodeKind::CheckerTexture => vec![out("Color", Color), out("Fac", Float)],
            NodeKind::TextureCoordinate => vec![
                out("Generated", Point),
                out("Normal", Normal),
                out("UV", Point),
                out("Object", Point),
                out("Camera", Point),
                out("Window", Point),
                out("Reflection", Normal),
            ],
            NodeKind::Geometry => vec![
                out("Position", Point),
                out("Normal", Normal),
                out("Tangent", Normal),
                out("TrueNormal", Normal),
                out("Incoming", Vector),
                out("Parametric", Point),
                out("Backfacing", Float),
                out("Pointiness", Float),
            ],
            NodeKind::Fresnel => vec![out("Fac", Float)],
            NodeKind::LayerWeight => vec![out("Fresnel", Float), out("Facing", Float)],
            NodeKind::LightPath => vec![
                out("IsCameraRay", Float),
                out("IsShadowRay", Float),
                out("IsDiffuseRay", Float),
                out("IsGlossyRay", Float),
                out("RayLength", Float),
                out("RayDepth", Float),
            ],
            NodeKind::Attribute { .. } => vec![
                out("Color", Color),
                out("Vector", Vector),
                out("Fac", Float),
            ],
            NodeKind::AmbientOcclusion { .. } => vec![out("Color", Color), out("AO", Float)],
            NodeKind::Bevel { .. } | NodeKind::Bump { .. } | NodeKind::SetNormal => {
                vec![out("Normal", Normal)]
            }
            NodeKind::MixClosureWeight => vec![out("Weight1", Float), out("Weight2", Float)],
            NodeKind::Displacement { .. } => vec![out("Displacement", Vector)],
            NodeKind::DiffuseBsdf
            | NodeKind::GlossyBsdf { .. }
            | NodeKind::GlassBsdf { .. }
            | NodeKind::TransparentBsdf
            | NodeKind::SubsurfaceScattering { .. } => vec![out("BSDF", Closure)],
            NodeKind::Emission => vec![out("Emission", Closure)],
            NodeKind::Background => vec![out("Background", Closure)],
            NodeKind::Holdout => vec![out("Holdout", Closure)],
            NodeKind::AbsorptionVolume | NodeKind::ScatterVolume => {
                vec![out("Volume", Closure)]
            }
            NodeKind::MixClosure | NodeKind::AddClosure => vec![out("Closure", Closure)],
        }
    }

    /// Result depends on the shading point's position.
    pub fn has_spatial_varying(&self) -> bool {
        matches!(
            self,
            NodeKind::ImageTexture { .. }
                | NodeKind::NoiseTexture
                | NodeKind::CheckerTexture
                | NodeKind::TextureCoordinate
                | NodeKind::Geometry
                | NodeKind::Attribute { .. }
                | NodeKind::AmbientOcclusion { .. }
                | NodeKind::Bevel { .. }
                | NodeKind::Bump { .. }
        )
    }

    /// Traces rays while evaluating.
    pub fn requires_raytrace(&self) -> bool {
        matches!(
            self,
            NodeKind::AmbientOcclusion { .. } | NodeKind::Bevel { .. }
        )
    }

    /// Reads mesh or volume attributes.
    pub fn has_attribute_dependency(&self) -> bool {
        matches!(self, NodeKind::Attribute { .. })
    }

    /// Reads integrator path state.
    pub fn has_integrator_dependency(&self) -> bool {
        matches!(self, NodeKind::LightPath)
    }

    pub fn has_surface_transparent(&self) -> bool {
        matches!(self, NodeKind::TransparentBsdf)
    }

    pub fn has_surface_emission(&self) -> bool {
        matches!(self, NodeKind::Emission | NodeKind::Background)
    }

    pub fn has_surface_bssrdf(&self) -> bool {
        matches!(self, NodeKind::SubsurfaceScattering { .. })
    }

    pub(crate) fn hash_params<H: Hasher>(&self, state: &mut H) {
        self.name().hash(state);
        match self {
            NodeKind::OutputAov(params) => params.hash(state),
            NodeKind::Value { value } => value.to_bits().hash(state),
            NodeKind::Color { value } => {
                value.x.to_bits().hash(state);
                value.y.to_bits().hash(state);
                value.z.to_bits().hash(state);
            }
            NodeKind::Math { op, clamp } => {
                op.hash(state);
                clamp.hash(state);
            }
            NodeKind::VectorMath { op } => op.hash(state),
            NodeKind::MixColor { blend, clamp } => {
                blend.hash(state);
                clamp.hash(state);
            }
            NodeKind::Convert { from, to } => {
                from.hash(state);
                to.hash(state);
            }
            NodeKind::ImageTexture { slot } => slot.hash(state),
            NodeKind::Attribute { id } => id.hash(state),
            NodeKind::AmbientOcclusion { samples } | NodeKind::Bevel { samples } => {
                samples.hash(state)
            }
            NodeKind::Bump {
                invert,
                object_space,
            } => {
                invert.hash(state);
                object_space.hash(state);
            }
            NodeKind::Displacement { space } => space.hash(state),
            NodeKind::GlossyBsdf { distribution } | NodeKind::GlassBsdf { distribution } => {
                distribution.hash(state)
            }
            NodeKind::SubsurfaceScattering { method } => method.hash(state),
            _ => {}
        }
    }
}
