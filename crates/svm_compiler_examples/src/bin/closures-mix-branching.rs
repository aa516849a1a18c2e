use svm_compiler::prelude::*;
use svm_compiler_examples::{init_tracing, print_program};

fn main() -> anyhow::Result<()> {
    init_tracing();

    // Closure tree:
    // - mix(fac = noise.Fac, diffuse, glossy)
    // - the noise texture drives the mix, so the compiler emits jumps around each branch
    // - the texture coordinate is shared by both branches and is hoisted above the jumps
    let mut graph = ShaderGraph::new();
    let coords = graph.add(NodeKind::TextureCoordinate);
    let noise = graph.add(NodeKind::NoiseTexture);
    let checker = graph.add(NodeKind::CheckerTexture);
    let diffuse = graph.add(NodeKind::DiffuseBsdf);
    let glossy = graph.add(NodeKind::glossy(MicrofacetDistribution::Ggx));
    let mix = graph.add(NodeKind::MixClosure);

    graph.connect(coords, "UV", noise, "Vector")?;
    graph.connect(coords, "UV", checker, "Vector")?;
    graph.connect(checker, "Color", diffuse, "Color")?;
    graph.connect(checker, "Fac", glossy, "Roughness")?;
    graph.connect(noise, "Fac", mix, "Fac")?;
    graph.connect(diffuse, "BSDF", mix, "Closure1")?;
    graph.connect(glossy, "BSDF", mix, "Closure2")?;
    graph.connect(mix, "Closure", NodeId(0), "Surface")?;

    let shader = Shader::new("mix_branching", graph);
    let program = SvmCompiler::compile(&shader, &CompileOptions::default())?;
    print_program(&program);

    // Same tree with a constant factor: the branch with zero weight is dropped entirely.
    let mut graph = ShaderGraph::new();
    let diffuse = graph.add(NodeKind::DiffuseBsdf);
    let glossy = graph.add(NodeKind::glossy(MicrofacetDistribution::Ggx));
    let mix = graph.add(NodeKind::MixClosure);
    graph.set_float(mix, "Fac", 0.0)?;
    graph.connect(diffuse, "BSDF", mix, "Closure1")?;
    graph.connect(glossy, "BSDF", mix, "Closure2")?;
    graph.connect(mix, "Closure", NodeId(0), "Surface")?;

    let shader = Shader::new("mix_pruned", graph);
    let pruned = SvmCompiler::compile(&shader, &CompileOptions::default())?;
    print_program(&pruned);

    Ok(())
}
