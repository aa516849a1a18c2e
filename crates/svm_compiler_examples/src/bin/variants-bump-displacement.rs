use svm_compiler::prelude::*;
use svm_compiler_examples::{init_tracing, print_program};

fn main() -> anyhow::Result<()> {
    init_tracing();

    // One graph, three displacement methods:
    // - Bump: the displacement height feeds a bump program ahead of the surface program
    // - True: geometry is displaced, no bump program
    // - Both: both programs, with the bump state saved around the bump evaluation
    for method in [
        DisplacementMethod::Bump,
        DisplacementMethod::True,
        DisplacementMethod::Both,
    ] {
        let shader = Shader::new(format!("rocky_{method:?}").to_lowercase(), rocky_graph()?)
            .with_displacement_method(method);
        let program = compile_shader(&shader, &CompileOptions::default());
        print_program(&program);
    }

    Ok(())
}

fn rocky_graph() -> anyhow::Result<ShaderGraph> {
    let mut graph = ShaderGraph::new();
    let noise = graph.add(NodeKind::NoiseTexture);
    let bump = graph.add(NodeKind::bump());
    let diffuse = graph.add(NodeKind::DiffuseBsdf);
    let displacement = graph.add(NodeKind::Displacement {
        space: DisplacementSpace::Object,
    });

    graph.set_float(noise, "Scale", 12.0)?;
    graph.connect(noise, "Fac", bump, "SampleCenter")?;
    graph.connect(bump, "Normal", diffuse, "Normal")?;
    graph.connect(noise, "Color", diffuse, "Color")?;
    graph.connect(noise, "Fac", displacement, "Height")?;
    graph.set_float(displacement, "Scale", 0.2)?;

    graph.connect(diffuse, "BSDF", NodeId(0), "Surface")?;
    graph.connect(displacement, "Displacement", NodeId(0), "Displacement")?;
    Ok(graph)
}
