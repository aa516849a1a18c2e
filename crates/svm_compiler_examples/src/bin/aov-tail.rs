use svm_compiler::prelude::*;
use svm_compiler_examples::{init_tracing, print_program};

fn main() -> anyhow::Result<()> {
    init_tracing();

    // Surface shader with two output variables:
    // - "albedo" writes the checker color that also drives the diffuse closure
    // - "depth" writes the ray length, which nothing else consumes
    // Both are compiled after the closure tree, behind an AOV start word.
    let mut graph = ShaderGraph::new();
    let checker = graph.add(NodeKind::CheckerTexture);
    let diffuse = graph.add(NodeKind::DiffuseBsdf);
    let light_path = graph.add(NodeKind::LightPath);
    let albedo = graph.add(NodeKind::aov_color("albedo", 0));
    let depth = graph.add(NodeKind::aov_value("depth", 1));

    graph.connect(checker, "Color", diffuse, "Color")?;
    graph.connect(diffuse, "BSDF", NodeId(0), "Surface")?;
    graph.connect(checker, "Color", albedo, "Color")?;
    graph.connect(light_path, "RayLength", depth, "Value")?;

    let shader = Shader::new("with_aovs", graph);
    print_program(&SvmCompiler::compile(&shader, &CompileOptions::default())?);

    // Without AOV passes the tail is left out.
    let opts = CompileOptions::default().with_emit_aov(false);
    print_program(&SvmCompiler::compile(&shader, &opts)?);

    Ok(())
}
