//! Event types and sinks for observing scene compiles.
//!
//! This module defines [`CompileEvent`] and the sinks that collect, filter or
//! forward events while compiling shaders via [`crate::scene::runner::SceneCompiler`] or
//! [`crate::scene::runner::compile_scene`].
use crate::error::Error;
use crate::svm::compiler::CompileOptions;
use crate::svm::program::{CompileSummary, ShaderFlags};

/// Describes events emitted while compiling a scene.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum CompileEvent {
    /// Emitted when a scene compile starts.
    RunStarted {
        /// The compile options used for every shader.
        options: CompileOptions,
        /// Number of shaders in the scene.
        shader_count: usize,
    },

    /// Emitted before a shader is looked up or compiled.
    ShaderStarted {
        /// Index of the shader in the scene.
        index: usize,
        /// The shader name.
        name: String,
    },

    /// Emitted when a shader produced a usable program.
    ShaderFinished {
        index: usize,
        name: String,
        summary: CompileSummary,
        flags: ShaderFlags,
        /// Whether the program came from the cache.
        cached: bool,
    },

    /// Emitted when a shader was replaced by the empty program.
    ShaderFailed {
        index: usize,
        name: String,
        /// Why compilation failed.
        error: Error,
    },

    /// Non-fatal warning generated during the compile.
    Warning {
        /// Context string (e.g. `shader:<name>`).
        context: String,
        /// Human-readable message.
        message: String,
    },

    /// Emitted when every shader was processed and the scene assembled.
    RunFinished {
        shader_count: usize,
        /// Words in the assembled scene program.
        words: usize,
        /// Shaders replaced by the empty program.
        failed: usize,
    },

    /// Emitted when the compile stopped early through a cancel flag.
    Cancelled {
        /// Shaders processed before cancellation.
        compiled: usize,
    },
}

/// Discriminant of [`CompileEvent`], for sinks that filter cheaply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompileEventKind {
    RunStarted,
    ShaderStarted,
    ShaderFinished,
    ShaderFailed,
    Warning,
    RunFinished,
    Cancelled,
}

impl CompileEvent {
    pub fn kind(&self) -> CompileEventKind {
        match self {
            CompileEvent::RunStarted { .. } => CompileEventKind::RunStarted,
            CompileEvent::ShaderStarted { .. } => CompileEventKind::ShaderStarted,
            CompileEvent::ShaderFinished { .. } => CompileEventKind::ShaderFinished,
            CompileEvent::ShaderFailed { .. } => CompileEventKind::ShaderFailed,
            CompileEvent::Warning { .. } => CompileEventKind::Warning,
            CompileEvent::RunFinished { .. } => CompileEventKind::RunFinished,
            CompileEvent::Cancelled { .. } => CompileEventKind::Cancelled,
        }
    }
}

/// A generic event sink that accepts [`CompileEvent`]s.
pub trait EventSink {
    fn send(&mut self, event: CompileEvent);

    /// Whether events of this kind should be built at all.
    fn wants(&self, _kind: CompileEventKind) -> bool {
        true
    }
}

/// Sink used when the caller passes none; no event is ever built.
impl EventSink for () {
    #[inline]
    fn send(&mut self, _event: CompileEvent) {}

    #[inline]
    fn wants(&self, _kind: CompileEventKind) -> bool {
        false
    }
}

/// Forwards every event to a closure, e.g. to log progress.
pub struct FnSink<F>
where
    F: FnMut(CompileEvent),
{
    f: F,
}

impl<F> FnSink<F>
where
    F: FnMut(CompileEvent),
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> EventSink for FnSink<F>
where
    F: FnMut(CompileEvent),
{
    #[inline]
    fn send(&mut self, event: CompileEvent) {
        (self.f)(event);
    }
}

/// Records events of a run for later inspection.
#[derive(Default)]
pub struct VecSink {
    events: Vec<CompileEvent>,
}

impl VecSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Recorded events in emission order.
    pub fn as_slice(&self) -> &[CompileEvent] {
        &self.events
    }

    /// Kinds of the recorded events, in emission order.
    pub fn kinds(&self) -> Vec<CompileEventKind> {
        self.events.iter().map(CompileEvent::kind).collect()
    }

    /// Shaders replaced by the empty program, with the reason.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &Error)> + '_ {
        self.events.iter().filter_map(|e| match e {
            CompileEvent::ShaderFailed { name, error, .. } => Some((name.as_str(), error)),
            _ => None,
        })
    }

    /// Names of shaders that were served from the cache.
    pub fn cached(&self) -> impl Iterator<Item = &str> + '_ {
        self.events.iter().filter_map(|e| match e {
            CompileEvent::ShaderFinished {
                name, cached: true, ..
            } => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl EventSink for VecSink {
    #[inline]
    fn send(&mut self, event: CompileEvent) {
        self.events.push(event);
    }
}

/// Fan-out sink. Each event goes only to the sinks that want its kind, and is built only
/// when at least one of them does.
pub struct MultiSink<S: EventSink> {
    pub(crate) sinks: Vec<S>,
}

impl<S: EventSink> MultiSink<S> {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn with_sinks(sinks: Vec<S>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: S) {
        self.sinks.push(sink);
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }
}

impl<S: EventSink> Default for MultiSink<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: EventSink> EventSink for MultiSink<S> {
    fn send(&mut self, event: CompileEvent) {
        let kind = event.kind();
        let targets: Vec<usize> = (0..self.sinks.len())
            .filter(|&i| self.sinks[i].wants(kind))
            .collect();
        let Some((&last, rest)) = targets.split_last() else {
            return;
        };
        for &i in rest {
            self.sinks[i].send(event.clone());
        }
        self.sinks[last].send(event);
    }

    fn wants(&self, kind: CompileEventKind) -> bool {
        self.sinks.iter().any(|s| s.wants(kind))
    }
}
