//! Per-kind instruction emitters.
//!
//! Each emitter reserves slots for the node's inputs and outputs through the
//! [`CompileContext`] and appends the node's words. Inputs are assigned in declaration order,
//! so constant loads for unlinked inputs precede the instruction that reads them.
use glam::Vec3;

use crate::graph::{
    DisplacementSpace, MicrofacetDistribution, NodeKind, ShaderNode, ShaderType, SocketType,
    SubsurfaceMethod,
};
use crate::svm::compiler::CompileContext;
use crate::svm::opcode::{encode_uchar4, ClosureType, SvmNode, SvmOpcode, STACK_INVALID};

fn socket_code(ty: SocketType) -> u32 {
    match ty {
        SocketType::Float => 0,
        SocketType::Int => 1,
        SocketType::Color => 2,
        SocketType::Vector => 3,
        SocketType::Normal => 4,
        SocketType::Point => 5,
        SocketType::Closure => 6,
    }
}

fn glossy_closure(distribution: MicrofacetDistribution) -> ClosureType {
    match distribution {
        MicrofacetDistribution::Beckmann => ClosureType::BsdfMicrofacetBeckmann,
        MicrofacetDistribution::Ggx => ClosureType::BsdfMicrofacetGgx,
        MicrofacetDistribution::MultiGgx => ClosureType::BsdfMicrofacetMultiGgx,
        MicrofacetDistribution::AshikhminShirley => ClosureType::BsdfAshikhminShirley,
    }
}

fn glass_closure(distribution: MicrofacetDistribution) -> ClosureType {
    match distribution {
        MicrofacetDistribution::Beckmann => ClosureType::BsdfMicrofacetBeckmannGlass,
        MicrofacetDistribution::MultiGgx => ClosureType::BsdfMicrofacetMultiGgxGlass,
        // No anisotropic glass closure; GGX is the closest refractive lobe.
        MicrofacetDistribution::Ggx | MicrofacetDistribution::AshikhminShirley => {
            ClosureType::BsdfMicrofacetGgxGlass
        }
    }
}

fn subsurface_closure(method: SubsurfaceMethod) -> ClosureType {
    match method {
        SubsurfaceMethod::Burley => ClosureType::BssrdfBurley,
        SubsurfaceMethod::RandomWalk => ClosureType::BssrdfRandomWalk,
        SubsurfaceMethod::RandomWalkFixedRadius => ClosureType::BssrdfRandomWalkFixedRadius,
    }
}

/// Optional scalar parameter of a closure: its slot and its constant value.
struct Param {
    offset: u32,
    bits: u32,
}

impl Param {
    const NONE: Param = Param {
        offset: STACK_INVALID,
        bits: 0,
    };
}

impl CompileContext<'_> {
    /// Appends the instructions of one node.
    pub(crate) fn compile_node(&mut self, node: &ShaderNode) {
        match &node.kind {
            NodeKind::Output => self.compile_output(node),
            NodeKind::OutputAov(params) => {
                let Some(slot) = params.slot else {
                    return;
                };
                if params.is_color {
                    let color = self.stack_assign(node, "Color");
                    self.add_node(SvmOpcode::AovColor, color, slot, 0);
                } else {
                    let value = self.stack_assign(node, "Value");
                    self.add_node(SvmOpcode::AovValue, value, slot, 0);
                }
            }

            NodeKind::Value { value } => {
                let out = self.stack_assign_output_if_linked(node, "Value");
                if out != STACK_INVALID {
                    self.add_node(SvmOpcode::ValueF, value.to_bits(), out, 0);
                }
            }
            NodeKind::Color { value } => {
                let out = self.stack_assign_output_if_linked(node, "Color");
                if out != STACK_INVALID {
                    self.add_node(SvmOpcode::ValueV, out, 0, 0);
                    self.add_word(SvmNode::vector(SvmOpcode::ValueV, *value));
                }
            }
            NodeKind::Math { op, clamp } => {
                let v1 = self.stack_assign(node, "Value1");
                let v2 = self.stack_assign(node, "Value2");
                let v3 = self.stack_assign(node, "Value3");
                let out = self.stack_assign_output_if_linked(node, "Value");
                self.add_node(
                    SvmOpcode::Math,
                    *op as u32,
                    encode_uchar4(v1, v2, v3, *clamp as u32),
                    out,
                );
            }
            NodeKind::VectorMath { op } => {
                let v1 = self.stack_assign(node, "Vector1");
                let v2 = self.stack_assign(node, "Vector2");
                let v3 = self.stack_assign(node, "Vector3");
                let scale = self.stack_assign(node, "Scale");
                let value_out = self.stack_assign_output_if_linked(node, "Value");
                let vector_out = self.stack_assign_output_if_linked(node, "Vector");
                self.add_node(
                    SvmOpcode::VectorMath,
                    *op as u32,
                    encode_uchar4(v1, v2, v3, scale),
                    encode_uchar4(value_out, vector_out, 0, 0),
                );
            }
            NodeKind::MixColor { blend, clamp } => {
                let fac = self.stack_assign(node, "Fac");
                let c1 = self.stack_assign(node, "Color1");
                let c2 = self.stack_assign(node, "Color2");
                let out = self.stack_assign_output_if_linked(node, "Color");
                self.add_node(
                    SvmOpcode::Mix,
                    encode_uchar4(fac, c1, c2, out),
                    *blend as u32,
                    *clamp as u32,
                );
            }
            NodeKind::Invert => {
                let fac = self.stack_assign(node, "Fac");
                let color = self.stack_assign(node, "Color");
                let out = self.stack_assign_output_if_linked(node, "Color");
                self.add_node(SvmOpcode::Invert, fac, color, out);
            }
            NodeKind::Convert { from, to } => {
                let input = self.stack_assign(node, "Value");
                let out = self.stack_assign_output_if_linked(node, "Value");
                self.add_node(
                    SvmOpcode::Convert,
                    encode_uchar4(socket_code(*from), socket_code(*to), 0, 0),
                    input,
                    out,
                );
            }

            NodeKind::ImageTexture { slot } => {
                let vector = self.stack_assign_if_linked(node, "Vector");
                let color = self.stack_assign_output_if_linked(node, "Color");
                let alpha = self.stack_assign_output_if_linked(node, "Alpha");
                self.add_node(
                    SvmOpcode::TexImage,
                    *slot,
                    encode_uchar4(vector, color, alpha, 0),
                    0,
                );
            }
            NodeKind::NoiseTexture => {
                let vector = self.stack_assign_if_linked(node, "Vector");
                let scale = self.stack_assign(node, "Scale");
                let detail = self.stack_assign(node, "Detail");
                let roughness = self.stack_assign(node, "Roughness");
                let distortion = self.stack_assign(node, "Distortion");
                let fac = self.stack_assign_output_if_linked(node, "Fac");
                let color = self.stack_assign_output_if_linked(node, "Color");
                self.add_node(
                    SvmOpcode::TexNoise,
                    encode_uchar4(vector, scale, detail, roughness),
                    encode_uchar4(distortion, fac, color, 0),
                    0,
                );
            }
            NodeKind::CheckerTexture => {
                let vector = self.stack_assign_if_linked(node, "Vector");
                let c1 = self.stack_assign(node, "Color1");
                let c2 = self.stack_assign(node, "Color2");
                let scale = self.stack_assign(node, "Scale");
                let color = self.stack_assign_output_if_linked(node, "Color");
                let fac = self.stack_assign_output_if_linked(node, "Fac");
                self.add_node(
                    SvmOpcode::TexChecker,
                    encode_uchar4(vector, c1, c2, scale),
                    encode_uchar4(color, fac, 0, 0),
                    0,
                );
            }
            NodeKind::TextureCoordinate => self.compile_lookups(node, SvmOpcode::TexCoord, 0),
            NodeKind::Geometry => self.compile_lookups(node, SvmOpcode::Geometry, 0),
            NodeKind::LightPath => self.compile_lookups(node, SvmOpcode::LightPath, 0),
            NodeKind::Attribute { id } => self.compile_lookups(node, SvmOpcode::Attribute, *id),
            NodeKind::Fresnel => {
                let normal = self.stack_assign_if_linked(node, "Normal");
                let ior = self.stack_assign(node, "IOR");
                let out = self.stack_assign_output_if_linked(node, "Fac");
                self.add_node(SvmOpcode::Fresnel, normal, encode_uchar4(ior, out, 0, 0), 0);
            }
            NodeKind::LayerWeight => {
                let normal = self.stack_assign_if_linked(node, "Normal");
                let blend = self.stack_assign(node, "Blend");
                let fresnel = self.stack_assign_output_if_linked(node, "Fresnel");
                let facing = self.stack_assign_output_if_linked(node, "Facing");
                self.add_node(
                    SvmOpcode::LayerWeight,
                    normal,
                    encode_uchar4(blend, fresnel, facing, 0),
                    0,
                );
            }
            NodeKind::AmbientOcclusion { samples } => {
                let color = self.stack_assign(node, "Color");
                let distance = self.stack_assign(node, "Distance");
                let normal = self.stack_assign_if_linked(node, "Normal");
                let color_out = self.stack_assign_output_if_linked(node, "Color");
                let ao_out = self.stack_assign_output_if_linked(node, "AO");
                self.add_node(
                    SvmOpcode::AmbientOcclusion,
                    *samples,
                    encode_uchar4(color, distance, normal, color_out),
                    ao_out,
                );
            }
            NodeKind::Bevel { samples } => {
                let radius = self.stack_assign(node, "Radius");
                let normal = self.stack_assign_if_linked(node, "Normal");
                let out = self.stack_assign_output_if_linked(node, "Normal");
                self.add_node(SvmOpcode::Bevel, *samples, encode_uchar4(radius, normal, out, 0), 0);
            }

            NodeKind::MixClosureWeight => {
                let fac = self.stack_assign(node, "Fac");
                let weight = self.stack_assign(node, "Weight");
                let w1 = self.stack_assign_output_if_linked(node, "Weight1");
                let w2 = self.stack_assign_output_if_linked(node, "Weight2");
                self.add_node(SvmOpcode::MixClosure, encode_uchar4(fac, weight, w1, w2), 0, 0);
            }
            NodeKind::Bump {
                invert,
                object_space,
            } => {
                let normal = self.stack_assign_if_linked(node, "Normal");
                let distance = self.stack_assign(node, "Distance");
                let center = self.stack_assign(node, "SampleCenter");
                let dx = self.stack_assign(node, "SampleX");
                let dy = self.stack_assign(node, "SampleY");
                let strength = self.stack_assign(node, "Strength");
                let out = self.stack_assign_output_if_linked(node, "Normal");
                self.add_node(
                    SvmOpcode::SetBump,
                    encode_uchar4(normal, distance, *invert as u32, *object_space as u32),
                    encode_uchar4(center, dx, dy, strength),
                    out,
                );
            }
            NodeKind::SetNormal => {
                let direction = self.stack_assign(node, "Direction");
                let out = self.stack_assign_output_if_linked(node, "Normal");
                self.add_node(SvmOpcode::ClosureSetNormal, direction, out, 0);
            }
            NodeKind::Displacement { space } => {
                let height = self.stack_assign(node, "Height");
                let midlevel = self.stack_assign(node, "Midlevel");
                let scale = self.stack_assign(node, "Scale");
                let normal = self.stack_assign_if_linked(node, "Normal");
                let out = self.stack_assign_output_if_linked(node, "Displacement");
                let space = match space {
                    DisplacementSpace::Object => 0,
                    DisplacementSpace::World => 1,
                };
                self.add_node(
                    SvmOpcode::Displacement,
                    encode_uchar4(height, midlevel, scale, normal),
                    out,
                    space,
                );
            }

            NodeKind::DiffuseBsdf => {
                self.compile_bsdf(node, ClosureType::BsdfDiffuse, [Some("Roughness"), None], [None, None]);
            }
            NodeKind::GlossyBsdf { distribution } => {
                let closure = glossy_closure(*distribution);
                self.compile_bsdf(node, closure, [Some("Roughness"), None], [None, None]);
            }
            NodeKind::GlassBsdf { distribution } => {
                let closure = glass_closure(*distribution);
                self.compile_bsdf(node, closure, [Some("Roughness"), Some("IOR")], [None, None]);
            }
            NodeKind::TransparentBsdf => {
                self.compile_bsdf(node, ClosureType::BsdfTransparent, [None, None], [None, None]);
            }
            NodeKind::SubsurfaceScattering { method } => {
                self.compile_bsdf(
                    node,
                    subsurface_closure(*method),
                    [Some("Scale"), Some("IOR")],
                    [Some("Radius"), Some("Anisotropy")],
                );
            }
            NodeKind::Emission | NodeKind::Background => {
                let color = self.stack_assign(node, "Color");
                let strength = self.stack_assign(node, "Strength");
                let op = if matches!(node.kind, NodeKind::Emission) {
                    SvmOpcode::ClosureEmission
                } else {
                    SvmOpcode::ClosureBackground
                };
                let mix = self.closure_mix_weight_offset();
                self.add_node(op, color, strength, mix);
            }
            NodeKind::Holdout => {
                let mix = self.closure_mix_weight_offset();
                self.add_node(SvmOpcode::ClosureHoldout, mix, 0, 0);
            }
            NodeKind::AbsorptionVolume => {
                self.compile_volume(node, ClosureType::VolumeAbsorption, None);
            }
            NodeKind::ScatterVolume => {
                self.compile_volume(node, ClosureType::VolumeHenyeyGreenstein, Some("Anisotropy"));
            }

            // Branches and weights are handled by the closure-tree compiler.
            NodeKind::MixClosure | NodeKind::AddClosure => {}
        }
    }

    fn compile_output(&mut self, node: &ShaderNode) {
        if self.variant != ShaderType::Displacement {
            return;
        }
        if node.input_index("Displacement").and_then(|idx| self.input_link(node, idx)).is_some() {
            let offset = self.stack_assign(node, "Displacement");
            self.add_node(SvmOpcode::SetDisplacement, offset, 0, 0);
        }
    }

    /// One lookup per consumed output, `y` selecting which value to write.
    fn compile_lookups(&mut self, node: &ShaderNode, op: SvmOpcode, id: u32) {
        for idx in 0..node.outputs.len() {
            if node.outputs[idx].links.is_empty() {
                continue;
            }
            let name = node.outputs[idx].name.as_str();
            let out = self.stack_assign_output(node, name);
            self.add_node(op, idx as u32, out, id);
        }
    }

    fn param(&mut self, node: &ShaderNode, name: Option<&str>) -> Param {
        let Some(name) = name else {
            return Param::NONE;
        };
        let offset = self.stack_assign(node, name);
        let bits = node.input(name).map_or(0, |i| i.value.as_float().to_bits());
        Param { offset, bits }
    }

    /// Slot of an input some closures lack, [`STACK_INVALID`] when absent or unlinked.
    fn optional_input(&mut self, node: &ShaderNode, name: &str) -> u32 {
        match node.input_index(name) {
            Some(_) => self.stack_assign_if_linked(node, name),
            None => STACK_INVALID,
        }
    }

    /// Sets the closure weight from the `Color` input: a slot when linked, else a constant.
    fn compile_closure_weight(&mut self, node: &ShaderNode) {
        let linked = node.input_index("Color").and_then(|idx| self.input_link(node, idx));
        if linked.is_some() {
            let color = self.stack_assign(node, "Color");
            self.add_node(SvmOpcode::ClosureWeight, color, 0, 0);
        } else {
            let color = node.input("Color").map_or(Vec3::ONE, |i| i.value.as_vec3());
            self.add_word(SvmNode::vector(SvmOpcode::ClosureSetWeight, color));
        }
    }

    /// Weight word, parameter loads, then the closure and its data word. `params` are read
    /// from the stack or inlined as constants; `extra` are slot-only.
    fn compile_bsdf(
        &mut self,
        node: &ShaderNode,
        closure: ClosureType,
        params: [Option<&str>; 2],
        extra: [Option<&str>; 2],
    ) {
        self.compile_closure_weight(node);
        let p1 = self.param(node, params[0]);
        let p2 = self.param(node, params[1]);
        let [p3, p4] = extra.map(|name| name.map_or(STACK_INVALID, |n| self.stack_assign(node, n)));
        let normal = self.optional_input(node, "Normal");
        let tangent = self.optional_input(node, "Tangent");
        let mix = self.closure_mix_weight_offset();
        self.add_node(
            SvmOpcode::ClosureBsdf,
            encode_uchar4(closure as u32, p1.offset, p2.offset, mix),
            p1.bits,
            p2.bits,
        );
        self.add_word(SvmNode::new(normal, tangent, p3, p4));
    }

    fn compile_volume(&mut self, node: &ShaderNode, closure: ClosureType, p2: Option<&str>) {
        self.compile_closure_weight(node);
        let density = self.param(node, Some("Density"));
        let p2 = self.param(node, p2);
        let mix = self.closure_mix_weight_offset();
        self.add_node(
            SvmOpcode::ClosureVolume,
            encode_uchar4(closure as u32, density.offset, p2.offset, mix),
            density.bits,
            p2.bits,
        );
    }
}
