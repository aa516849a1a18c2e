use std::time::Duration;

use criterion::{Criterion, Throughput};
use glam::Vec3;
use svm_compiler::prelude::{MicrofacetDistribution, NodeId, NodeKind, Shader, ShaderGraph};

pub const SAMPLE_SIZE: usize = 20;
pub const WARM_UP: Duration = Duration::from_secs(1);
pub const MEASUREMENT_TIME: Duration = Duration::from_secs(2);

pub fn default_criterion() -> Criterion {
    Criterion::default()
        .configure_from_args()
        .sample_size(SAMPLE_SIZE)
        .warm_up_time(WARM_UP)
        .measurement_time(MEASUREMENT_TIME)
}

pub fn elements_throughput(elements: usize) -> Throughput {
    Throughput::Elements(elements.max(1) as u64)
}

/// Balanced tree of closure mixes with `depth` levels, each factor driven by a texture
/// shared with the closure colors.
pub fn mix_tree_shader(name: &str, depth: u32) -> Shader {
    let mut graph = ShaderGraph::new();
    let tex = graph.add(NodeKind::ImageTexture { slot: 0 });
    let root = build_level(&mut graph, tex, depth);
    graph
        .connect(root, "Closure", NodeId(0), "Surface")
        .expect("surface");
    Shader::new(name, graph)
}

fn build_level(graph: &mut ShaderGraph, tex: NodeId, depth: u32) -> NodeId {
    if depth == 0 {
        let bsdf = graph.add(NodeKind::glossy(MicrofacetDistribution::Ggx));
        graph.connect(tex, "Color", bsdf, "Color").expect("color");
        let emission = graph.add(NodeKind::Emission);
        graph
            .set_vector(emission, "Color", Vec3::new(1.0, 0.9, 0.8))
            .expect("color");
        let add = graph.add(NodeKind::AddClosure);
        graph.connect(bsdf, "BSDF", add, "Closure1").expect("cl1");
        graph
            .connect(emission, "Emission", add, "Closure2")
            .expect("cl2");
        return add;
    }
    let left = build_level(graph, tex, depth - 1);
    let right = build_level(graph, tex, depth - 1);
    let mix = graph.add(NodeKind::MixClosure);
    graph.connect(tex, "Alpha", mix, "Fac").expect("fac");
    graph.connect(left, "Closure", mix, "Closure1").expect("cl1");
    graph.connect(right, "Closure", mix, "Closure2").expect("cl2");
    mix
}
