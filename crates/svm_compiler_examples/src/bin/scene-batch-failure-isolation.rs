use glam::Vec3;
use svm_compiler::prelude::*;
use svm_compiler_examples::{init_tracing, print_scene};
use tracing::info;

fn main() -> anyhow::Result<()> {
    init_tracing();

    // Scene of three shaders; the middle one needs more stack cells than the machine has.
    // It is replaced by the empty program and the others still compile.
    let shaders = vec![
        lamp("lamp", 4.0)?,
        oversized("huge", 120)?,
        fog("fog", 0.3)?,
    ];

    let mut cache = ShaderProgramCache::new();
    let mut compiler = SceneCompiler::try_new(CompileOptions::default(), &mut cache)?;

    let mut sink = FnSink::new(|event| match event {
        CompileEvent::ShaderFinished {
            name,
            summary,
            cached,
            ..
        } => info!(
            "{name}: {} words, peak stack {} (cached: {cached})",
            summary.num_words, summary.peak_stack_usage
        ),
        CompileEvent::ShaderFailed { name, error, .. } => info!("{name}: failed ({error})"),
        _ => {}
    });

    let scene = compiler.compile_with_events(&shaders, &mut sink)?;
    print_scene(&scene);

    // A second run only looks shaders up in the cache.
    let mut record = VecSink::new();
    let again = compiler.compile_with_events(&shaders, &mut record)?;
    anyhow::ensure!(again.words() == scene.words(), "cached scene differs");
    for name in record.cached() {
        info!("{name}: reused from cache");
    }
    for (name, error) in record.failures() {
        info!("{name}: still on the empty program ({error})");
    }

    Ok(())
}

fn lamp(name: &str, strength: f32) -> anyhow::Result<Shader> {
    let mut graph = ShaderGraph::new();
    let emission = graph.add(NodeKind::Emission);
    graph.set_vector(emission, "Color", Vec3::new(1.0, 0.9, 0.7))?;
    graph.set_float(emission, "Strength", strength)?;
    graph.connect(emission, "Emission", NodeId(0), "Surface")?;
    Ok(Shader::new(name, graph))
}

fn fog(name: &str, density: f32) -> anyhow::Result<Shader> {
    let mut graph = ShaderGraph::new();
    let scatter = graph.add(NodeKind::ScatterVolume);
    graph.set_float(scatter, "Density", density)?;
    graph.connect(scatter, "Volume", NodeId(0), "Volume")?;
    Ok(Shader::new(name, graph))
}

/// Sums `count` colors in a chain whose constants are all loaded up front.
fn oversized(name: &str, count: usize) -> anyhow::Result<Shader> {
    let mut graph = ShaderGraph::new();
    let colors: Vec<NodeId> = (0..count)
        .map(|i| graph.add(NodeKind::color(Vec3::splat(i as f32 / count as f32))))
        .collect();
    let mut acc = (colors[0], "Color");
    for &color in &colors[1..] {
        let add = graph.add(NodeKind::vector_math(VectorMathOp::Add));
        graph.connect(acc.0, acc.1, add, "Vector1")?;
        graph.connect(color, "Color", add, "Vector2")?;
        acc = (add, "Vector");
    }
    let emission = graph.add(NodeKind::Emission);
    graph.connect(acc.0, acc.1, emission, "Color")?;
    graph.connect(emission, "Emission", NodeId(0), "Surface")?;
    Ok(Shader::new(name, graph))
}
