//! Batch compilation of a scene's shaders into one [`SceneProgram`].
//!
//! Shaders are compiled in order through a [`ShaderProgramCache`]. A shader that fails is
//! replaced by the empty program and reported; it never aborts the batch. Only invalid
//! options or a raised [`CancelFlag`] stop a run early.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::scene::assemble::SceneProgram;
use crate::scene::cache::ShaderProgramCache;
use crate::scene::events::{CompileEvent, CompileEventKind, EventSink};
use crate::scene::Shader;
use crate::svm::compiler::CompileOptions;
use crate::svm::program::ShaderProgram;

/// Shared flag to stop a scene compile between two shaders.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates a flag that is not raised.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag; the running compile stops before its next shader.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether the flag is raised.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Lowers the flag so the compiler can run again.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// Compiles scenes through a borrowed program cache.
pub struct SceneCompiler<'a> {
    /// Options applied to every shader.
    pub options: CompileOptions,
    /// Program cache reused across runs.
    pub cache: &'a mut ShaderProgramCache,
    cancel: Option<CancelFlag>,
}

impl<'a> SceneCompiler<'a> {
    /// Creates a compiler after validating `options`.
    pub fn try_new(options: CompileOptions, cache: &'a mut ShaderProgramCache) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            cache,
            cancel: None,
        })
    }

    /// Creates a compiler; `options` are only checked in debug builds.
    pub fn new(options: CompileOptions, cache: &'a mut ShaderProgramCache) -> Self {
        debug_assert!(options.validate().is_ok(), "invalid compile options");
        Self {
            options,
            cache,
            cancel: None,
        }
    }

    /// Checks `cancel` before each shader.
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Compiles and assembles `shaders`.
    pub fn compile(&mut self, shaders: &[Shader]) -> Result<SceneProgram> {
        compile_scene(shaders, &self.options, self.cache, self.cancel.as_ref(), None)
    }

    /// Like [`Self::compile`], reporting progress to `sink`.
    pub fn compile_with_events(
        &mut self,
        shaders: &[Shader],
        sink: &mut dyn EventSink,
    ) -> Result<SceneProgram> {
        compile_scene(
            shaders,
            &self.options,
            self.cache,
            self.cancel.as_ref(),
            Some(sink),
        )
    }
}

/// Compiles `shaders` in order and assembles them into one program.
///
/// Failing shaders get the empty program. Only invalid options or cancellation return `Err`.
pub fn compile_scene(
    shaders: &[Shader],
    options: &CompileOptions,
    cache: &mut ShaderProgramCache,
    cancel: Option<&CancelFlag>,
    sink: Option<&mut dyn EventSink>,
) -> Result<SceneProgram> {
    if let Some(s) = sink {
        compile_scene_with_events(shaders, options, cache, cancel, s)
    } else {
        compile_scene_with_events(shaders, options, cache, cancel, &mut ())
    }
}

/// [`compile_scene`] with a required sink.
pub fn compile_scene_with_events(
    shaders: &[Shader],
    options: &CompileOptions,
    cache: &mut ShaderProgramCache,
    cancel: Option<&CancelFlag>,
    sink: &mut dyn EventSink,
) -> Result<SceneProgram> {
    options.validate()?;

    if sink.wants(CompileEventKind::RunStarted) {
        sink.send(CompileEvent::RunStarted {
            options: options.clone(),
            shader_count: shaders.len(),
        });
    }

    if shaders.is_empty() {
        warn!("Scene has no shaders.");
        if sink.wants(CompileEventKind::Warning) {
            sink.send(CompileEvent::Warning {
                context: "scene".into(),
                message: "Scene has no shaders".into(),
            });
        }
    }

    let mut programs: Vec<ShaderProgram> = Vec::with_capacity(shaders.len());
    for (index, shader) in shaders.iter().enumerate() {
        if cancel.is_some_and(CancelFlag::is_cancelled) {
            warn!("Scene compile cancelled after {} shader(s).", index);
            if sink.wants(CompileEventKind::Cancelled) {
                sink.send(CompileEvent::Cancelled { compiled: index });
            }
            return Err(Error::Cancelled { compiled: index });
        }

        if sink.wants(CompileEventKind::ShaderStarted) {
            sink.send(CompileEvent::ShaderStarted {
                index,
                name: shader.name.clone(),
            });
        }

        let cached = !cache.needs_compile(shader, options);
        let program = cache.get_or_compile(shader, options).clone();

        match &program.fallback {
            Some(error) => {
                if sink.wants(CompileEventKind::Warning) {
                    sink.send(CompileEvent::Warning {
                        context: format!("shader:{}", shader.name),
                        message: format!("using empty program: {error}"),
                    });
                }
                if sink.wants(CompileEventKind::ShaderFailed) {
                    sink.send(CompileEvent::ShaderFailed {
                        index,
                        name: shader.name.clone(),
                        error: error.clone(),
                    });
                }
            }
            None => {
                if sink.wants(CompileEventKind::ShaderFinished) {
                    sink.send(CompileEvent::ShaderFinished {
                        index,
                        name: shader.name.clone(),
                        summary: program.summary.clone(),
                        flags: program.flags,
                        cached,
                    });
                }
            }
        }
        programs.push(program);
    }

    let scene = SceneProgram::assemble(&programs);
    info!(
        "Compiled {} shader(s) into {} words | failed: {}.",
        shaders.len(),
        scene.len(),
        scene.failed_count(),
    );

    if sink.wants(CompileEventKind::RunFinished) {
        sink.send(CompileEvent::RunFinished {
            shader_count: shaders.len(),
            words: scene.len(),
            failed: scene.failed_count(),
        });
    }

    Ok(scene)
}
