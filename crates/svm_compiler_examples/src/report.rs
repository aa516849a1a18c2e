use svm_compiler::prelude::*;
use tracing_subscriber::EnvFilter;

/// Installs a compact stdout subscriber, honoring `RUST_LOG` and defaulting to `info`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Prints the entry points of a shader program followed by its listing.
pub fn print_program(program: &ShaderProgram) {
    for variant in ShaderType::ALL {
        match program.table.entry(variant) {
            Some(offset) => println!(
                "; {variant}: entry {offset}, {} words",
                program.summary.words_for(variant)
            ),
            None => println!("; {variant}: absent"),
        }
    }
    println!("; peak stack: {}", program.summary.peak_stack_usage);
    println!("{program}");
}

pub fn print_scene(scene: &SceneProgram) {
    println!(
        "; {} shader(s), {} words, {} failed",
        scene.shaders().len(),
        scene.len(),
        scene.failed_count()
    );
    println!("{scene}");
}
