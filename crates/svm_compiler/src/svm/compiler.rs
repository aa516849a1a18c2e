//! Compiler from shader graphs to SVM programs.
//!
//! [`SvmCompiler::compile`] lowers one [`Shader`] into up to four variant programs (bump,
//! surface, volume, displacement). Each variant is compiled by a fresh [`CompileContext`],
//! which owns the per-variant state: stack slot assignments, the set of emitted nodes, the
//! instruction buffer and the active closure mix weight.
//!
//! Closure trees are compiled top-down. A mix with a linked factor compiles to two guarded
//! branches so the kernel skips a closure (and the nodes only it needs) when its weight is
//! zero; nodes needed on more than one path are hoisted ahead of the branches. Everything
//! else is scheduled bottom-up in ascending node id order, which keeps output deterministic
//! regardless of how the graph is stored.
use std::collections::BTreeSet;
use std::mem;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

use crate::error::{Error, Result};
use crate::graph::{
    NodeId, NodeKind, NodeRole, OutputRef, ShaderGraph, ShaderNode, ShaderType, SocketType,
    VariantSet,
};
use crate::scene::{DisplacementMethod, Shader};
use crate::svm::opcode::{
    SvmNode, SvmOpcode, BUMP_EVAL_STATE_SIZE, STACK_INVALID, SVM_STACK_SIZE,
};
use crate::svm::program::{ProgramBuilder, ShaderFlags, ShaderProgram, VariantProgram};
use crate::svm::stack::StackAllocator;

/// Options for compiling shaders.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub struct CompileOptions {
    /// Stack cells available to one variant program, at most [`SVM_STACK_SIZE`].
    pub stack_size: usize,
    /// Append the output-variable tail to surface programs.
    pub emit_aov: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            stack_size: SVM_STACK_SIZE,
            emit_aov: true,
        }
    }
}

impl CompileOptions {
    /// Sets the number of stack cells per variant program.
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Enables or disables the output-variable tail.
    pub fn with_emit_aov(mut self, emit_aov: bool) -> Self {
        self.emit_aov = emit_aov;
        self
    }

    /// Validates the options; `stack_size` must lie in `1..=255`.
    pub fn validate(&self) -> Result<()> {
        if self.stack_size == 0 || self.stack_size > SVM_STACK_SIZE {
            return Err(Error::InvalidConfig(format!(
                "stack_size must be in 1..={SVM_STACK_SIZE}, got {}",
                self.stack_size
            )));
        }
        Ok(())
    }
}

/// Compiler for shaders into [`ShaderProgram`]s.
pub struct SvmCompiler;

impl SvmCompiler {
    /// Compiles every variant of `shader`.
    ///
    /// Fails on invalid options, a graph without output node, stack exhaustion or a graph the
    /// scheduler cannot order. [`crate::scene::compile_shader`] turns failures into the empty
    /// program instead.
    pub fn compile(shader: &Shader, opts: &CompileOptions) -> Result<ShaderProgram> {
        opts.validate()?;
        let graph = &shader.graph;
        let output = graph.output().ok_or_else(|| Error::MissingOutput {
            shader: shader.name.clone(),
        })?;

        let mut linked = VariantSet::empty();
        for variant in [ShaderType::Surface, ShaderType::Volume, ShaderType::Displacement] {
            let terminal = output.input(variant.terminal());
            if terminal.is_some_and(|i| i.link.is_some() && !i.skip.contains(variant.into())) {
                linked |= variant.into();
            }
        }

        let has_bump = shader.displacement_method != DisplacementMethod::True
            && linked.contains(VariantSet::SURFACE | VariantSet::DISPLACEMENT);

        let mut builder = ProgramBuilder::new();
        if has_bump {
            let save_state = shader.displacement_method == DisplacementMethod::Both;
            let bump = compile_variant(graph, output, &shader.name, ShaderType::Bump, save_state, opts)?;
            builder.append(ShaderType::Bump, bump);
            builder.insert_flags(ShaderFlags::HAS_BUMP_VARIANT);
        }
        for variant in [ShaderType::Surface, ShaderType::Volume, ShaderType::Displacement] {
            let program = compile_variant(graph, output, &shader.name, variant, false, opts)?;
            builder.append(variant, program);
        }

        let program = builder.finish(&shader.name, linked);
        debug!(
            shader = %shader.name,
            words = program.summary.num_words,
            peak_stack = program.summary.peak_stack_usage,
            "compiled shader"
        );
        Ok(program)
    }
}

/// Compiles the program of one variant, ending in `end` except for the bump program, which
/// falls through into the surface program.
pub(crate) fn compile_variant(
    graph: &ShaderGraph,
    output: &ShaderNode,
    shader: &str,
    variant: ShaderType,
    save_bump_state: bool,
    opts: &CompileOptions,
) -> Result<VariantProgram> {
    let mut ctx = CompileContext::new(graph, shader, variant, opts);

    let bump_state = save_bump_state.then(|| {
        let offset = ctx.stack.find_offset(BUMP_EVAL_STATE_SIZE);
        ctx.add_node(SvmOpcode::EnterBumpEval, offset, 0, 0);
        offset
    });

    let terminal = output.input_index(variant.terminal());
    if let Some(link) = terminal.and_then(|idx| ctx.input_link(output, idx)) {
        ctx.flags |= match variant {
            ShaderType::Surface => ShaderFlags::HAS_SURFACE,
            ShaderType::Volume => ShaderFlags::HAS_VOLUME,
            ShaderType::Displacement => ShaderFlags::HAS_DISPLACEMENT,
            ShaderType::Bump => ShaderFlags::empty(),
        };
        if variant == ShaderType::Surface && opts.emit_aov {
            ctx.find_aov_nodes_and_dependencies();
        }
        ctx.generate_multi_closure(link.node, link.node);
    }

    ctx.compile_node(output);

    if !ctx.aov_nodes.is_empty() {
        ctx.add_node(SvmOpcode::AovStart, 0, 0, 0);
        let aov_nodes = mem::take(&mut ctx.aov_nodes);
        ctx.generate_svm_nodes(&aov_nodes);
        ctx.flags |= ShaderFlags::HAS_AOV;
    }

    if let Some(offset) = bump_state {
        ctx.add_node(SvmOpcode::LeaveBumpEval, offset, 0, 0);
    }

    ctx.finish()
}

/// Handle of an emitted jump whose target is filled in later.
#[must_use]
pub(crate) struct JumpPatch(usize);

/// Mutable state of one variant compile.
pub(crate) struct CompileContext<'g> {
    pub(crate) graph: &'g ShaderGraph,
    shader: &'g str,
    pub(crate) variant: ShaderType,
    pub(crate) stack: StackAllocator,
    pub(crate) words: Vec<SvmNode>,
    input_slots: Vec<Vec<u32>>,
    output_slots: Vec<Vec<u32>>,
    pub(crate) nodes_done: Vec<bool>,
    closure_done: Vec<bool>,
    aov_nodes: BTreeSet<NodeId>,
    mix_weight_offset: u32,
    pub(crate) flags: ShaderFlags,
    failure: Option<Error>,
}

impl<'g> CompileContext<'g> {
    pub(crate) fn new(
        graph: &'g ShaderGraph,
        shader: &'g str,
        variant: ShaderType,
        opts: &CompileOptions,
    ) -> Self {
        let input_slots = graph
            .nodes_by_id()
            .map(|n| vec![STACK_INVALID; n.inputs.len()])
            .collect();
        let output_slots = graph
            .nodes_by_id()
            .map(|n| vec![STACK_INVALID; n.outputs.len()])
            .collect();
        Self {
            graph,
            shader,
            variant,
            stack: StackAllocator::new(opts.stack_size),
            words: Vec::new(),
            input_slots,
            output_slots,
            nodes_done: vec![false; graph.len()],
            closure_done: vec![false; graph.len()],
            aov_nodes: BTreeSet::new(),
            mix_weight_offset: STACK_INVALID,
            flags: ShaderFlags::empty(),
            failure: None,
        }
    }

    fn finish(mut self) -> Result<VariantProgram> {
        if let Some(err) = self.failure.take() {
            return Err(err);
        }
        if self.stack.is_exhausted() {
            return Err(Error::StackOverflow {
                shader: self.shader.to_string(),
                variant: self.variant,
                capacity: self.stack.capacity(),
            });
        }
        if self.variant != ShaderType::Bump {
            self.add_node(SvmOpcode::End, 0, 0, 0);
        }
        Ok(VariantProgram {
            words: self.words,
            peak_stack: self.stack.peak_usage(),
            flags: self.flags,
        })
    }

    /// Records the first failure; compilation carries on so later diagnostics stay quiet.
    pub(crate) fn fail(&mut self, err: Error) {
        if self.failure.is_none() {
            self.failure = Some(err);
        }
    }

    /// Link feeding input `idx` of `node` in this variant, if it is not skipped.
    ///
    /// Displacement programs never read bump outputs: bump nodes depend on the displaced
    /// surface themselves.
    pub(crate) fn input_link(&self, node: &ShaderNode, idx: usize) -> Option<OutputRef> {
        let input = &node.inputs[idx];
        let link = input.link?;
        if input.skip.contains(self.variant.into()) {
            return None;
        }
        if self.variant == ShaderType::Displacement
            && self.graph.get(link.node).role() == NodeRole::Bump
        {
            return None;
        }
        Some(link)
    }

    // Instruction buffer.

    #[inline]
    pub(crate) fn add_node(&mut self, op: SvmOpcode, y: u32, z: u32, w: u32) {
        self.words.push(SvmNode::op(op, y, z, w));
    }

    #[inline]
    pub(crate) fn add_word(&mut self, word: SvmNode) {
        self.words.push(word);
    }

    fn emit_jump(&mut self, op: SvmOpcode, condition: u32) -> JumpPatch {
        let at = self.words.len();
        self.add_node(op, 0, condition, 0);
        JumpPatch(at)
    }

    /// Points a jump at the next instruction to be emitted, relative to the jump itself.
    fn patch_jump(&mut self, patch: JumpPatch) {
        let distance = self.words.len() - patch.0;
        self.words[patch.0].y = distance as u32;
    }

    pub(crate) fn closure_mix_weight_offset(&self) -> u32 {
        self.mix_weight_offset
    }

    // Stack slots.

    fn input_index(&mut self, node: &ShaderNode, name: &str) -> Option<usize> {
        let idx = node.input_index(name);
        if idx.is_none() {
            self.fail(Error::UnknownSocket {
                node: node.id,
                socket: name.to_string(),
            });
        }
        idx
    }

    fn output_index(&mut self, node: &ShaderNode, name: &str) -> Option<usize> {
        let idx = node.output_index(name);
        if idx.is_none() {
            self.fail(Error::UnknownSocket {
                node: node.id,
                socket: name.to_string(),
            });
        }
        idx
    }

    /// Slot holding the value of an input, loading its constant when it is unlinked.
    pub(crate) fn stack_assign(&mut self, node: &ShaderNode, name: &str) -> u32 {
        match self.input_index(node, name) {
            Some(idx) => self.assign_input(node, idx),
            None => STACK_INVALID,
        }
    }

    /// Slot of a linked input, or [`STACK_INVALID`] for optional inputs left unlinked.
    pub(crate) fn stack_assign_if_linked(&mut self, node: &ShaderNode, name: &str) -> u32 {
        match self.input_index(node, name) {
            Some(idx) if self.input_link(node, idx).is_some() => self.assign_input(node, idx),
            _ => STACK_INVALID,
        }
    }

    /// Slot an output is written to, reserved on first request.
    pub(crate) fn stack_assign_output(&mut self, node: &ShaderNode, name: &str) -> u32 {
        match self.output_index(node, name) {
            Some(idx) => self.assign_output(node, idx),
            None => STACK_INVALID,
        }
    }

    /// Slot of an output that has consumers, or [`STACK_INVALID`] for an unused one.
    pub(crate) fn stack_assign_output_if_linked(&mut self, node: &ShaderNode, name: &str) -> u32 {
        match self.output_index(node, name) {
            Some(idx) if !node.outputs[idx].links.is_empty() => self.assign_output(node, idx),
            _ => STACK_INVALID,
        }
    }

    pub(crate) fn assign_input(&mut self, node: &ShaderNode, idx: usize) -> u32 {
        let slot = self.input_slots[node.id.index()][idx];
        if slot != STACK_INVALID {
            return slot;
        }
        let input = &node.inputs[idx];
        let offset = match self.input_link(node, idx) {
            Some(src) => {
                let offset = self.output_slots[src.node.index()][src.socket];
                if input.ty == SocketType::Closure {
                    return offset;
                }
                if offset == STACK_INVALID {
                    self.fail(Error::UnresolvedLink {
                        node: node.id,
                        socket: input.name.clone(),
                    });
                } else if !self.stack.is_exhausted()
                    && self.stack.is_free(offset, input.ty.stack_size())
                {
                    self.fail(Error::ReleasedSlot {
                        node: node.id,
                        socket: input.name.clone(),
                        offset,
                    });
                }
                offset
            }
            None => {
                let offset = self.stack.find_offset(input.ty.stack_size());
                match input.ty.stack_size() {
                    1 => self.add_node(
                        SvmOpcode::ValueF,
                        input.value.as_float().to_bits(),
                        offset,
                        0,
                    ),
                    3 => {
                        self.add_node(SvmOpcode::ValueV, offset, 0, 0);
                        self.add_word(SvmNode::vector(SvmOpcode::ValueV, input.value.as_vec3()));
                    }
                    _ => {}
                }
                offset
            }
        };
        self.input_slots[node.id.index()][idx] = offset;
        offset
    }

    fn assign_output(&mut self, node: &ShaderNode, idx: usize) -> u32 {
        let slot = &mut self.output_slots[node.id.index()][idx];
        if *slot == STACK_INVALID {
            *slot = self.stack.find_offset(node.outputs[idx].ty.stack_size());
        }
        *slot
    }

    /// Frees producer slots read by `node` once every consumer of them has been emitted.
    fn stack_clear_users(&mut self, node: &ShaderNode) {
        for idx in 0..node.inputs.len() {
            let Some(src) = self.input_link(node, idx) else {
                continue;
            };
            let offset = self.output_slots[src.node.index()][src.socket];
            if offset == STACK_INVALID {
                continue;
            }
            let output = &self.graph.get(src.node).outputs[src.socket];
            let all_done = output
                .links
                .iter()
                .all(|c| c.node == node.id || self.nodes_done[c.node.index()]);
            if all_done {
                self.stack.release(offset, output.ty.stack_size());
                self.output_slots[src.node.index()][src.socket] = STACK_INVALID;
                for consumer in &output.links {
                    self.input_slots[consumer.node.index()][consumer.socket] = STACK_INVALID;
                }
            }
        }
    }

    /// Frees the constants loaded for unlinked inputs of `node`.
    fn stack_clear_temporary(&mut self, node: &ShaderNode) {
        for (idx, input) in node.inputs.iter().enumerate() {
            let slot = self.input_slots[node.id.index()][idx];
            if slot != STACK_INVALID && self.input_link(node, idx).is_none() {
                self.stack.release(slot, input.ty.stack_size());
                self.input_slots[node.id.index()][idx] = STACK_INVALID;
            }
        }
    }

    // Scheduling.

    /// Adds every not-yet-emitted node reachable upstream of input `idx` of `node` to `deps`,
    /// without walking through `skip_node`.
    pub(crate) fn find_dependencies(
        &self,
        deps: &mut BTreeSet<NodeId>,
        node: &ShaderNode,
        idx: usize,
        skip_node: Option<NodeId>,
    ) {
        let mut pending: Vec<NodeId> = self.input_link(node, idx).map(|l| l.node).into_iter().collect();
        while let Some(id) = pending.pop() {
            if self.nodes_done[id.index()] || Some(id) == skip_node || !deps.insert(id) {
                continue;
            }
            let dep = self.graph.get(id);
            for i in 0..dep.inputs.len() {
                if let Some(link) = self.input_link(dep, i) {
                    pending.push(link.node);
                }
            }
        }
    }

    fn inputs_done(&self, node: &ShaderNode) -> bool {
        (0..node.inputs.len()).all(|idx| {
            self.input_link(node, idx)
                .is_none_or(|link| self.nodes_done[link.node.index()])
        })
    }

    /// Emits every node of `targets` after all of its producers, in ascending id order within
    /// each pass. Gives up when a pass makes no progress.
    pub(crate) fn generate_svm_nodes(&mut self, targets: &BTreeSet<NodeId>) {
        let graph = self.graph;
        loop {
            let mut remaining = 0;
            let mut progressed = false;
            for &id in targets {
                if self.nodes_done[id.index()] {
                    continue;
                }
                let node = graph.get(id);
                if self.inputs_done(node) {
                    self.generate_node(node);
                    self.nodes_done[id.index()] = true;
                    progressed = true;
                } else {
                    remaining += 1;
                }
            }
            if remaining == 0 {
                return;
            }
            if !progressed {
                error!(
                    shader = self.shader,
                    variant = %self.variant,
                    remaining,
                    "scheduler made no progress; graph has a cycle or a dangling link"
                );
                self.fail(Error::SchedulerStalled {
                    shader: self.shader.to_string(),
                    variant: self.variant,
                    remaining,
                });
                return;
            }
        }
    }

    fn generate_node(&mut self, node: &ShaderNode) {
        trace!(node = %node.id, kind = node.kind.name(), at = self.words.len(), "emit");
        self.compile_node(node);
        self.stack_clear_users(node);
        self.stack_clear_temporary(node);

        let kind = &node.kind;
        match self.variant {
            ShaderType::Surface => {
                if kind.has_spatial_varying() {
                    self.flags |= ShaderFlags::HAS_SURFACE_SPATIAL_VARYING;
                }
                if kind.requires_raytrace() {
                    self.flags |= ShaderFlags::HAS_SURFACE_RAYTRACE;
                }
            }
            ShaderType::Volume => {
                if kind.has_spatial_varying() {
                    self.flags |= ShaderFlags::HAS_VOLUME_SPATIAL_VARYING;
                }
                if kind.has_attribute_dependency() {
                    self.flags |= ShaderFlags::HAS_VOLUME_ATTRIBUTE_DEPENDENCY;
                }
            }
            ShaderType::Displacement | ShaderType::Bump => {}
        }
        if kind.has_integrator_dependency() {
            self.flags |= ShaderFlags::HAS_INTEGRATOR_DEPENDENCY;
        }
    }

    // Closure trees.

    /// Whether the node's `Normal` input is fed by something other than plain geometry.
    fn has_normal_bump(&self, node: &ShaderNode) -> bool {
        node.input_index("Normal")
            .and_then(|idx| self.input_link(node, idx))
            .is_some_and(|link| !matches!(self.graph.get(link.node).kind, NodeKind::Geometry))
    }

    /// Emits a closure (or the plain node at the root of a bump or displacement program)
    /// after its dependencies, with the mix weight it should be scaled by.
    fn generate_closure_node(&mut self, node: &ShaderNode) {
        for idx in 0..node.inputs.len() {
            if self.input_link(node, idx).is_some() {
                let mut deps = BTreeSet::new();
                self.find_dependencies(&mut deps, node, idx, None);
                self.generate_svm_nodes(&deps);
            }
        }

        self.mix_weight_offset = match node.input_index(self.variant.mix_weight_input()) {
            Some(idx)
                if self.input_link(node, idx).is_some()
                    || node.inputs[idx].value.as_float() != 1.0 =>
            {
                self.assign_input(node, idx)
            }
            _ => STACK_INVALID,
        };
        self.generate_node(node);
        self.mix_weight_offset = STACK_INVALID;

        if self.variant == ShaderType::Surface {
            let kind = &node.kind;
            if kind.has_surface_transparent() {
                self.flags |= ShaderFlags::HAS_SURFACE_TRANSPARENT;
            }
            if kind.has_surface_emission() {
                self.flags |= ShaderFlags::HAS_SURFACE_EMISSION;
            }
            if kind.has_surface_bssrdf() {
                self.flags |= ShaderFlags::HAS_SURFACE_BSSRDF;
                if self.has_normal_bump(node) {
                    self.flags |= ShaderFlags::HAS_BSSRDF_BUMP;
                }
            }
            if node.role() == NodeRole::Closure && self.has_normal_bump(node) {
                self.flags |= ShaderFlags::HAS_BUMP;
            }
        }
    }

    /// Nodes upstream of both branches of `node`, or of a branch and of the rest of the
    /// tree under `root`, or of a branch and an output variable. They must run before the
    /// branch jumps since skipping one branch must not skip them.
    fn shared_dependencies(
        &self,
        root: NodeId,
        node: &ShaderNode,
        cl1: Option<usize>,
        cl2: Option<usize>,
    ) -> BTreeSet<NodeId> {
        let mut cl1deps = BTreeSet::new();
        let mut cl2deps = BTreeSet::new();
        if let Some(idx) = cl1 {
            self.find_dependencies(&mut cl1deps, node, idx, None);
        }
        if let Some(idx) = cl2 {
            self.find_dependencies(&mut cl2deps, node, idx, None);
        }

        let mut shared: BTreeSet<NodeId> = cl1deps.intersection(&cl2deps).copied().collect();

        if root != node.id {
            let root_node = self.graph.get(root);
            for idx in 0..root_node.inputs.len() {
                let mut rootdeps = BTreeSet::new();
                self.find_dependencies(&mut rootdeps, root_node, idx, Some(node.id));
                shared.extend(rootdeps.intersection(&cl1deps));
                shared.extend(rootdeps.intersection(&cl2deps));
            }
        }

        if !self.aov_nodes.is_empty() {
            shared.extend(self.aov_nodes.intersection(&cl1deps));
            shared.extend(self.aov_nodes.intersection(&cl2deps));
        }

        shared
    }

    /// Compiles closures found in `shared` below `id`, stopping at the first shared node on
    /// each path.
    fn generate_shared_closure_nodes(&mut self, root: NodeId, id: NodeId, shared: &BTreeSet<NodeId>) {
        if shared.contains(&id) {
            self.generate_multi_closure(root, id);
            return;
        }
        let node = self.graph.get(id);
        for idx in 0..node.inputs.len() {
            if node.inputs[idx].ty != SocketType::Closure {
                continue;
            }
            if let Some(link) = self.input_link(node, idx) {
                self.generate_shared_closure_nodes(root, link.node, shared);
            }
        }
    }

    /// Compiles the closure tree under `id`; `root` is the node linked into the output.
    pub(crate) fn generate_multi_closure(&mut self, root: NodeId, id: NodeId) {
        if self.closure_done[id.index()] {
            return;
        }
        self.closure_done[id.index()] = true;

        let node = self.graph.get(id);
        if node.role() == NodeRole::CombineClosure {
            let cl1 = node.input_index("Closure1");
            let cl2 = node.input_index("Closure2");
            let cl1_link = cl1.and_then(|idx| self.input_link(node, idx));
            let cl2_link = cl2.and_then(|idx| self.input_link(node, idx));
            if cl1_link.is_none() && cl2_link.is_none() {
                return;
            }

            let fac = node.input_index("Fac");
            match fac {
                Some(fac_idx) if self.input_link(node, fac_idx).is_some() => {
                    let mut deps = BTreeSet::new();
                    self.find_dependencies(&mut deps, node, fac_idx, None);
                    self.generate_svm_nodes(&deps);

                    let shared = self.shared_dependencies(root, node, cl1, cl2);
                    if !shared.is_empty() {
                        if let Some(link) = cl1_link {
                            self.generate_shared_closure_nodes(root, link.node, &shared);
                        }
                        if let Some(link) = cl2_link {
                            self.generate_shared_closure_nodes(root, link.node, &shared);
                        }
                        self.generate_svm_nodes(&shared);
                    }

                    if let Some(link) = cl1_link {
                        let fac_offset = self.assign_input(node, fac_idx);
                        let jump = self.emit_jump(SvmOpcode::JumpIfOne, fac_offset);
                        self.generate_multi_closure(root, link.node);
                        self.patch_jump(jump);
                    }
                    if let Some(link) = cl2_link {
                        let fac_offset = self.assign_input(node, fac_idx);
                        let jump = self.emit_jump(SvmOpcode::JumpIfZero, fac_offset);
                        self.generate_multi_closure(root, link.node);
                        self.patch_jump(jump);
                    }
                }
                _ => {
                    // Constant factor: a branch with zero weight is left out entirely.
                    let weight = fac.map(|idx| node.inputs[idx].value.as_float());
                    if let Some(link) = cl1_link.filter(|_| weight.is_none_or(|w| w < 1.0)) {
                        self.generate_multi_closure(root, link.node);
                    }
                    if let Some(link) = cl2_link.filter(|_| weight.is_none_or(|w| w > 0.0)) {
                        self.generate_multi_closure(root, link.node);
                    }
                }
            }

            self.stack_clear_users(node);
            self.stack_clear_temporary(node);
        } else {
            self.generate_closure_node(node);
        }

        self.nodes_done[id.index()] = true;
    }

    /// Collects live output-variable nodes and everything they read.
    fn find_aov_nodes_and_dependencies(&mut self) {
        let mut aov_nodes = BTreeSet::new();
        for node in self.graph.nodes_by_id() {
            let NodeKind::OutputAov(params) = &node.kind else {
                continue;
            };
            if params.slot.is_none() {
                continue;
            }
            aov_nodes.insert(node.id);
            for idx in 0..node.inputs.len() {
                self.find_dependencies(&mut aov_nodes, node, idx, None);
            }
        }
        self.aov_nodes = aov_nodes;
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::graph::{
        DisplacementSpace, MathOp, MicrofacetDistribution, MixBlend, ShaderNode, SubsurfaceMethod,
        VectorMathOp,
    };
    use crate::svm::opcode::{decode_uchar4, ClosureType, JUMP_ABSENT};

    const OUT: NodeId = NodeId(0);

    fn shader(graph: ShaderGraph) -> Shader {
        Shader::new("test", graph)
    }

    fn compile(graph: ShaderGraph) -> ShaderProgram {
        SvmCompiler::compile(&shader(graph), &CompileOptions::default()).expect("compile")
    }

    fn ops(words: &[SvmNode]) -> Vec<Option<SvmOpcode>> {
        words.iter().map(|w| w.opcode()).collect()
    }

    fn count(words: &[SvmNode], op: SvmOpcode) -> usize {
        words.iter().filter(|w| w.x == op as u32).count()
    }

    fn position(words: &[SvmNode], op: SvmOpcode) -> usize {
        words
            .iter()
            .position(|w| w.x == op as u32)
            .expect("opcode present")
    }

    fn surface(program: &ShaderProgram) -> &[SvmNode] {
        program.section(ShaderType::Surface).expect("surface section")
    }

    /// Texture alpha mixing a diffuse and a glossy closure.
    fn mix_graph() -> ShaderGraph {
        let mut graph = ShaderGraph::new();
        let tex = graph.add(NodeKind::ImageTexture { slot: 7 });
        let diffuse = graph.add(NodeKind::DiffuseBsdf);
        let glossy = graph.add(NodeKind::glossy(MicrofacetDistribution::Ggx));
        let mix = graph.add(NodeKind::MixClosure);
        graph.connect(tex, "Alpha", mix, "Fac").expect("fac");
        graph.connect(diffuse, "BSDF", mix, "Closure1").expect("cl1");
        graph.connect(glossy, "BSDF", mix, "Closure2").expect("cl2");
        graph.connect(mix, "Closure", OUT, "Surface").expect("surface");
        graph
    }

    #[test]
    fn options_validate_stack_size() {
        assert!(CompileOptions::default().validate().is_ok());
        assert!(CompileOptions::default().with_stack_size(0).validate().is_err());
        assert!(CompileOptions::default().with_stack_size(256).validate().is_err());
        assert!(CompileOptions::default().with_stack_size(9).validate().is_ok());
    }

    #[test]
    fn single_emission_loads_constants_then_emits() {
        let mut graph = ShaderGraph::new();
        let emission = graph.add(NodeKind::Emission);
        graph
            .set_vector(emission, "Color", Vec3::new(1.0, 0.5, 0.25))
            .expect("color");
        graph.set_float(emission, "Strength", 2.0).expect("strength");
        graph.connect(emission, "Emission", OUT, "Surface").expect("link");

        let program = compile(graph);
        let words = surface(&program);
        assert_eq!(
            ops(words),
            vec![
                Some(SvmOpcode::ValueV),
                Some(SvmOpcode::ValueV),
                Some(SvmOpcode::ValueF),
                Some(SvmOpcode::ClosureEmission),
                Some(SvmOpcode::End),
            ]
        );
        assert_eq!(words[0].y, 0);
        assert_eq!(f32::from_bits(words[1].z), 0.5);
        assert_eq!(f32::from_bits(words[2].y), 2.0);
        assert_eq!(words[2].z, 3);
        assert_eq!(words[3], SvmNode::op(SvmOpcode::ClosureEmission, 0, 3, STACK_INVALID));

        assert_eq!(program.table.surface, 1);
        assert_eq!(program.table.bump, 1);
        assert_eq!(program.table.volume, JUMP_ABSENT);
        assert_eq!(program.table.displacement, JUMP_ABSENT);
        assert_eq!(program.section(ShaderType::Volume).map(ops), Some(vec![Some(SvmOpcode::End)]));
        assert!(program.flags.contains(ShaderFlags::HAS_SURFACE | ShaderFlags::HAS_SURFACE_EMISSION));
        assert_eq!(program.summary.peak_stack_usage, 4);
    }

    #[test]
    fn linked_mix_factor_branches_around_each_closure() {
        let program = compile(mix_graph());
        let words = surface(&program);

        assert_eq!(words[0].x, SvmOpcode::TexImage as u32);
        let alpha = decode_uchar4(words[0].z)[2];

        let one = position(words, SvmOpcode::JumpIfOne);
        let zero = position(words, SvmOpcode::JumpIfZero);
        assert!(one < zero);
        assert_eq!(words[one].z, alpha);
        assert_eq!(words[zero].z, alpha);

        // The first jump lands on the second one, the second on the terminator.
        assert_eq!(one + words[one].y as usize, zero);
        assert_eq!(zero + words[zero].y as usize, words.len() - 1);
        assert_eq!(words[words.len() - 1].x, SvmOpcode::End as u32);

        let bsdfs: Vec<usize> = words
            .iter()
            .enumerate()
            .filter(|(_, w)| w.x == SvmOpcode::ClosureBsdf as u32)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(bsdfs.len(), 2);
        assert!(one < bsdfs[0] && bsdfs[0] < zero && zero < bsdfs[1]);
        assert_eq!(decode_uchar4(words[bsdfs[0]].y)[0], ClosureType::BsdfDiffuse as u32);
        assert_eq!(decode_uchar4(words[bsdfs[1]].y)[0], ClosureType::BsdfMicrofacetGgx as u32);
    }

    #[test]
    fn constant_mix_factor_skips_jumps() {
        let mut graph = mix_graph();
        let mix = NodeId(4);
        graph.disconnect(mix, "Fac").expect("unlink fac");
        graph.set_float(mix, "Fac", 0.25).expect("fac");
        let words = surface(&compile(graph)).to_vec();
        assert_eq!(count(&words, SvmOpcode::JumpIfOne), 0);
        assert_eq!(count(&words, SvmOpcode::JumpIfZero), 0);
        assert_eq!(count(&words, SvmOpcode::ClosureBsdf), 2);
        assert_eq!(count(&words, SvmOpcode::TexImage), 0);
    }

    #[test]
    fn constant_mix_factor_of_one_drops_first_closure() {
        let mut graph = mix_graph();
        let mix = NodeId(4);
        graph.disconnect(mix, "Fac").expect("unlink fac");
        graph.set_float(mix, "Fac", 1.0).expect("fac");
        let words = surface(&compile(graph)).to_vec();
        let bsdf = position(&words, SvmOpcode::ClosureBsdf);
        assert_eq!(count(&words, SvmOpcode::ClosureBsdf), 1);
        assert_eq!(decode_uchar4(words[bsdf].y)[0], ClosureType::BsdfMicrofacetGgx as u32);
    }

    #[test]
    fn add_closure_emits_both_without_jumps() {
        let mut graph = ShaderGraph::new();
        let diffuse = graph.add(NodeKind::DiffuseBsdf);
        let emission = graph.add(NodeKind::Emission);
        let add = graph.add(NodeKind::AddClosure);
        graph.connect(diffuse, "BSDF", add, "Closure1").expect("cl1");
        graph.connect(emission, "Emission", add, "Closure2").expect("cl2");
        graph.connect(add, "Closure", OUT, "Surface").expect("surface");
        let words = surface(&compile(graph)).to_vec();
        assert_eq!(count(&words, SvmOpcode::JumpIfOne) + count(&words, SvmOpcode::JumpIfZero), 0);
        assert!(position(&words, SvmOpcode::ClosureBsdf) < position(&words, SvmOpcode::ClosureEmission));
    }

    #[test]
    fn empty_combine_emits_nothing() {
        let mut graph = ShaderGraph::new();
        let mix = graph.add(NodeKind::MixClosure);
        graph.connect(mix, "Closure", OUT, "Surface").expect("surface");
        let words = surface(&compile(graph)).to_vec();
        assert_eq!(ops(&words), vec![Some(SvmOpcode::End)]);
    }

    #[test]
    fn node_shared_by_both_branches_runs_before_the_jumps() {
        let mut graph = mix_graph();
        let shared = graph.add(NodeKind::ImageTexture { slot: 42 });
        graph.connect(shared, "Color", NodeId(2), "Color").expect("diffuse color");
        graph.connect(shared, "Color", NodeId(3), "Color").expect("glossy color");
        let words = surface(&compile(graph)).to_vec();

        let shared_at: Vec<usize> = words
            .iter()
            .enumerate()
            .filter(|(_, w)| w.x == SvmOpcode::TexImage as u32 && w.y == 42)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(shared_at.len(), 1);
        assert!(shared_at[0] < position(&words, SvmOpcode::JumpIfOne));
        // Both closures weight by the texture slot instead of a constant.
        assert_eq!(count(&words, SvmOpcode::ClosureWeight), 2);
    }

    #[test]
    fn node_only_one_branch_needs_stays_inside_it() {
        let mut graph = mix_graph();
        let private = graph.add(NodeKind::ImageTexture { slot: 42 });
        graph.connect(private, "Color", NodeId(3), "Color").expect("glossy color");
        let words = surface(&compile(graph)).to_vec();
        let at = words
            .iter()
            .position(|w| w.x == SvmOpcode::TexImage as u32 && w.y == 42)
            .expect("private texture");
        assert!(at > position(&words, SvmOpcode::JumpIfZero));
    }

    #[test]
    fn node_shared_with_an_ancestor_branch_is_hoisted() {
        // add(mix(fac, diffuse(tex), glossy), emission(tex)): tex must not hide in the
        // diffuse branch because the emission reads it unconditionally.
        let mut graph = mix_graph();
        let tex = graph.add(NodeKind::ImageTexture { slot: 42 });
        let emission = graph.add(NodeKind::Emission);
        let add = graph.add(NodeKind::AddClosure);
        graph.connect(tex, "Color", NodeId(2), "Color").expect("diffuse color");
        graph.connect(tex, "Color", emission, "Color").expect("emission color");
        graph.connect(NodeId(4), "Closure", add, "Closure1").expect("cl1");
        graph.connect(emission, "Emission", add, "Closure2").expect("cl2");
        graph.connect(add, "Closure", OUT, "Surface").expect("surface");

        let program = compile(graph);
        assert!(!program.is_fallback());
        let words = surface(&program);
        let at = words
            .iter()
            .position(|w| w.x == SvmOpcode::TexImage as u32 && w.y == 42)
            .expect("shared texture");
        assert!(at < position(words, SvmOpcode::JumpIfOne));
        assert!(position(words, SvmOpcode::ClosureEmission) > position(words, SvmOpcode::JumpIfZero));
    }

    #[test]
    fn nested_mixes_patch_every_jump() {
        let mut graph = mix_graph();
        let fac = graph.add(NodeKind::value(0.3));
        let emission = graph.add(NodeKind::Emission);
        let outer = graph.add(NodeKind::MixClosure);
        graph.connect(fac, "Value", outer, "Fac").expect("fac");
        graph.connect(NodeId(4), "Closure", outer, "Closure1").expect("cl1");
        graph.connect(emission, "Emission", outer, "Closure2").expect("cl2");
        graph.connect(outer, "Closure", OUT, "Surface").expect("surface");

        let words = surface(&compile(graph)).to_vec();
        let jumps: Vec<usize> = words
            .iter()
            .enumerate()
            .filter(|(_, w)| {
                w.x == SvmOpcode::JumpIfOne as u32 || w.x == SvmOpcode::JumpIfZero as u32
            })
            .map(|(i, _)| i)
            .collect();
        assert_eq!(jumps.len(), 4);
        for &at in &jumps {
            let target = at + words[at].y as usize;
            assert!(target > at && target < words.len());
        }
        // Outer first branch skips the whole inner mix.
        assert_eq!(jumps[0] + words[jumps[0]].y as usize, jumps[3]);
    }

    #[test]
    fn shared_producer_slot_lives_until_last_consumer() {
        let mut graph = ShaderGraph::new();
        let a = graph.add(NodeKind::value(2.0));
        let m1 = graph.add(NodeKind::math(MathOp::Add));
        let m2 = graph.add(NodeKind::math(MathOp::Multiply));
        graph.connect(a, "Value", m1, "Value1").expect("a->m1");
        graph.connect(a, "Value", m2, "Value1").expect("a->m2");

        let opts = CompileOptions::default();
        let mut ctx = CompileContext::new(&graph, "diamond", ShaderType::Surface, &opts);
        ctx.generate_svm_nodes(&BTreeSet::from([a, m1]));
        let slot = ctx.output_slots[a.index()][0];
        assert_ne!(slot, STACK_INVALID);
        assert!(!ctx.stack.is_free(slot, 1));

        ctx.generate_svm_nodes(&BTreeSet::from([m2]));
        assert_eq!(ctx.output_slots[a.index()][0], STACK_INVALID);
        assert!(ctx.stack.is_free(slot, 1));
        assert!(ctx.failure.is_none());
    }

    #[test]
    fn temporaries_are_released_after_each_node() {
        let mut graph = ShaderGraph::new();
        let m = graph.add(NodeKind::math(MathOp::Power));
        let opts = CompileOptions::default();
        let mut ctx = CompileContext::new(&graph, "temps", ShaderType::Surface, &opts);
        ctx.generate_svm_nodes(&BTreeSet::from([m]));
        assert_eq!(count(&ctx.words, SvmOpcode::ValueF), 3);
        // Only the (unused) output could stay reserved; it has no consumers so it was never
        // allocated.
        assert_eq!(ctx.stack.live_cells(), 0);
    }

    #[test]
    fn fully_consumed_graph_leaves_no_live_slots() {
        let mut graph = ShaderGraph::new();
        let mut previous: Option<NodeId> = None;
        for i in 0..40 {
            let v = graph.add(NodeKind::value(i as f32));
            let m = graph.add(NodeKind::math(MathOp::Add));
            graph.connect(v, "Value", m, "Value1").expect("v");
            if let Some(p) = previous {
                graph.connect(p, "Value", m, "Value2").expect("chain");
                graph.connect(v, "Value", m, "Value3").expect("fan");
            }
            previous = Some(m);
        }
        let emission = graph.add(NodeKind::Emission);
        graph
            .connect(previous.expect("chain"), "Value", emission, "Strength")
            .expect("strength");
        graph.connect(emission, "Emission", OUT, "Surface").expect("surface");

        let output = graph.output().expect("output");
        let opts = CompileOptions::default();
        let mut ctx = CompileContext::new(&graph, "chain", ShaderType::Surface, &opts);
        let root = graph.get(OUT).inputs[0].link.expect("linked").node;
        ctx.generate_multi_closure(root, root);
        ctx.compile_node(output);
        assert!(ctx.failure.is_none());
        assert!(!ctx.stack.is_exhausted());
        assert_eq!(ctx.stack.live_cells(), 0);
    }

    #[test]
    fn displacement_ignores_bump_inputs() {
        let mut graph = ShaderGraph::new();
        let diffuse = graph.add(NodeKind::DiffuseBsdf);
        let bump = graph.add(NodeKind::bump());
        let disp = graph.add(NodeKind::Displacement {
            space: crate::graph::DisplacementSpace::Object,
        });
        let height = graph.add(NodeKind::NoiseTexture);
        graph.connect(height, "Fac", disp, "Height").expect("height");
        graph.connect(height, "Fac", bump, "SampleCenter").expect("center");
        graph.connect(bump, "Normal", diffuse, "Normal").expect("normal");
        graph.connect(bump, "Normal", disp, "Normal").expect("disp normal");
        graph.connect(diffuse, "BSDF", OUT, "Surface").expect("surface");
        graph.connect(disp, "Displacement", OUT, "Displacement").expect("disp");

        let program = SvmCompiler::compile(
            &shader(graph).with_displacement_method(DisplacementMethod::True),
            &CompileOptions::default(),
        )
        .expect("compile");
        let displacement = program.section(ShaderType::Displacement).expect("disp");
        assert_eq!(count(displacement, SvmOpcode::SetBump), 0);
        assert_eq!(count(displacement, SvmOpcode::Displacement), 1);
        assert_eq!(count(displacement, SvmOpcode::SetDisplacement), 1);
        // The normal operand of the displacement instruction is unassigned.
        let at = position(displacement, SvmOpcode::Displacement);
        assert_eq!(decode_uchar4(displacement[at].y)[3], STACK_INVALID);

        let surface = surface(&program);
        assert_eq!(count(surface, SvmOpcode::SetBump), 1);
        assert!(program.flags.contains(ShaderFlags::HAS_BUMP | ShaderFlags::HAS_DISPLACEMENT));
    }

    #[test]
    fn skipped_input_behaves_as_unlinked() {
        let mut graph = ShaderGraph::new();
        let tex = graph.add(NodeKind::ImageTexture { slot: 1 });
        let emission = graph.add(NodeKind::Emission);
        graph.connect(tex, "Color", emission, "Color").expect("color");
        graph.connect(emission, "Emission", OUT, "Surface").expect("surface");
        graph
            .skip_input(emission, "Color", VariantSet::SURFACE)
            .expect("skip");
        let words = surface(&compile(graph)).to_vec();
        assert_eq!(count(&words, SvmOpcode::TexImage), 0);
        assert_eq!(words[0].x, SvmOpcode::ValueV as u32);
    }

    #[test]
    fn volume_closures_use_volume_mix_weight() {
        let mut graph = ShaderGraph::new();
        let absorb = graph.add(NodeKind::AbsorptionVolume);
        let scatter = graph.add(NodeKind::ScatterVolume);
        let weights = graph.add(NodeKind::MixClosureWeight);
        let fac = graph.add(NodeKind::value(0.5));
        let add = graph.add(NodeKind::AddClosure);
        graph.connect(fac, "Value", weights, "Fac").expect("fac");
        graph.connect(weights, "Weight1", absorb, "VolumeMixWeight").expect("w1");
        graph.connect(weights, "Weight2", scatter, "VolumeMixWeight").expect("w2");
        graph.connect(absorb, "Volume", add, "Closure1").expect("cl1");
        graph.connect(scatter, "Volume", add, "Closure2").expect("cl2");
        graph.connect(add, "Closure", OUT, "Volume").expect("volume");

        let program = compile(graph);
        assert_ne!(program.table.volume, JUMP_ABSENT);
        assert_eq!(program.table.surface, JUMP_ABSENT);
        assert!(program.flags.contains(ShaderFlags::HAS_VOLUME));
        let volume = program.section(ShaderType::Volume).expect("volume");
        let mix = position(volume, SvmOpcode::MixClosure);
        let [_, _, w1, w2] = decode_uchar4(volume[mix].y);
        let closures: Vec<&SvmNode> = volume
            .iter()
            .filter(|w| w.x == SvmOpcode::ClosureVolume as u32)
            .collect();
        assert_eq!(closures.len(), 2);
        assert_eq!(decode_uchar4(closures[0].y)[3], w1);
        assert_eq!(decode_uchar4(closures[1].y)[3], w2);
    }

    #[test]
    fn bump_variant_precedes_surface_and_falls_through() {
        let mut graph = ShaderGraph::new();
        let diffuse = graph.add(NodeKind::DiffuseBsdf);
        let bump = graph.add(NodeKind::bump());
        let set_normal = graph.add(NodeKind::SetNormal);
        let disp = graph.add(NodeKind::Displacement {
            space: crate::graph::DisplacementSpace::World,
        });
        graph.connect(bump, "Normal", set_normal, "Direction").expect("dir");
        graph.connect(set_normal, "Normal", OUT, "Normal").expect("normal");
        graph.connect(diffuse, "BSDF", OUT, "Surface").expect("surface");
        graph.connect(disp, "Displacement", OUT, "Displacement").expect("disp");

        for (method, saves_state) in [(DisplacementMethod::Bump, false), (DisplacementMethod::Both, true)] {
            let program = SvmCompiler::compile(
                &shader(graph.clone()).with_displacement_method(method),
                &CompileOptions::default(),
            )
            .expect("compile");
            assert!(program.flags.contains(ShaderFlags::HAS_BUMP_VARIANT));
            assert_eq!(program.table.bump, 1);
            let bump_words = program.section(ShaderType::Bump).expect("bump");
            assert_eq!(program.table.surface as usize, 1 + bump_words.len());
            assert_ne!(bump_words[bump_words.len() - 1].x, SvmOpcode::End as u32);
            assert_eq!(count(bump_words, SvmOpcode::ClosureSetNormal), 1);
            assert_eq!(bump_words[0].x == SvmOpcode::EnterBumpEval as u32, saves_state);
            assert_eq!(
                bump_words[bump_words.len() - 1].x == SvmOpcode::LeaveBumpEval as u32,
                saves_state
            );
            if saves_state {
                assert_eq!(bump_words[0].y, bump_words[bump_words.len() - 1].y);
            }
        }

        let program = SvmCompiler::compile(
            &shader(graph).with_displacement_method(DisplacementMethod::True),
            &CompileOptions::default(),
        )
        .expect("compile");
        assert!(program.section(ShaderType::Bump).is_none());
        assert_eq!(program.table.bump, program.table.surface);
    }

    #[test]
    fn flags_follow_closure_features() {
        let mut graph = ShaderGraph::new();
        let transparent = graph.add(NodeKind::TransparentBsdf);
        let sss = graph.add(NodeKind::SubsurfaceScattering {
            method: crate::graph::SubsurfaceMethod::RandomWalk,
        });
        let bump = graph.add(NodeKind::bump());
        let ao = graph.add(NodeKind::AmbientOcclusion { samples: 8 });
        let add = graph.add(NodeKind::AddClosure);
        graph.connect(ao, "Color", sss, "Color").expect("ao");
        graph.connect(bump, "Normal", sss, "Normal").expect("bump");
        graph.connect(transparent, "BSDF", add, "Closure1").expect("cl1");
        graph.connect(sss, "BSDF", add, "Closure2").expect("cl2");
        graph.connect(add, "Closure", OUT, "Surface").expect("surface");

        let flags = compile(graph).flags;
        for flag in [
            ShaderFlags::HAS_SURFACE_TRANSPARENT,
            ShaderFlags::HAS_SURFACE_BSSRDF,
            ShaderFlags::HAS_BSSRDF_BUMP,
            ShaderFlags::HAS_BUMP,
            ShaderFlags::HAS_SURFACE_RAYTRACE,
            ShaderFlags::HAS_SURFACE_SPATIAL_VARYING,
        ] {
            assert!(flags.contains(flag), "missing {flag:?}");
        }
        assert!(!flags.contains(ShaderFlags::HAS_SURFACE_EMISSION));
    }

    #[test]
    fn geometry_normal_is_not_a_bump() {
        let mut graph = ShaderGraph::new();
        let geometry = graph.add(NodeKind::Geometry);
        let diffuse = graph.add(NodeKind::DiffuseBsdf);
        graph.connect(geometry, "Normal", diffuse, "Normal").expect("normal");
        graph.connect(diffuse, "BSDF", OUT, "Surface").expect("surface");
        assert!(!compile(graph).flags.contains(ShaderFlags::HAS_BUMP));
    }

    #[test]
    fn aov_tail_follows_surface_and_reads_shared_values() {
        let mut graph = mix_graph();
        let tex = graph.add(NodeKind::ImageTexture { slot: 42 });
        let aov = graph.add(NodeKind::aov_color("albedo", 3));
        let dead = graph.add(NodeKind::OutputAov(crate::graph::AovParams {
            name: "unused".into(),
            slot: None,
            is_color: false,
        }));
        graph.connect(tex, "Color", NodeId(2), "Color").expect("diffuse color");
        graph.connect(tex, "Color", aov, "Color").expect("aov color");
        graph.connect(tex, "Alpha", dead, "Value").expect("dead aov");

        let program = compile(graph.clone());
        let words = surface(&program);
        let tex_at = words
            .iter()
            .position(|w| w.x == SvmOpcode::TexImage as u32 && w.y == 42)
            .expect("aov texture");
        let start = position(words, SvmOpcode::AovStart);
        let write = position(words, SvmOpcode::AovColor);
        assert!(tex_at < position(words, SvmOpcode::JumpIfOne));
        assert!(position(words, SvmOpcode::JumpIfZero) < start);
        assert!(start < write && write < words.len() - 1);
        assert_eq!(words[write].z, 3);
        assert_eq!(count(words, SvmOpcode::AovValue), 0);
        assert!(program.flags.contains(ShaderFlags::HAS_AOV));

        let quiet = SvmCompiler::compile(&shader(graph), &CompileOptions::default().with_emit_aov(false))
            .expect("compile");
        assert_eq!(count(surface(&quiet), SvmOpcode::AovStart), 0);
    }

    #[test]
    fn too_many_live_values_overflow_the_stack() {
        let mut graph = ShaderGraph::new();
        let colors: Vec<NodeId> = (0..50)
            .map(|i| graph.add(NodeKind::color(Vec3::splat(i as f32))))
            .collect();
        let mut acc = (colors[0], "Color");
        for &c in &colors[1..] {
            let add = graph.add(NodeKind::vector_math(VectorMathOp::Add));
            graph.connect(acc.0, acc.1, add, "Vector1").expect("acc");
            graph.connect(c, "Color", add, "Vector2").expect("color");
            acc = (add, "Vector");
        }
        let emission = graph.add(NodeKind::Emission);
        graph.connect(acc.0, acc.1, emission, "Color").expect("color");
        graph.connect(emission, "Emission", OUT, "Surface").expect("surface");

        let err = SvmCompiler::compile(&shader(graph.clone()), &CompileOptions::default().with_stack_size(128))
            .expect_err("overflow");
        assert!(matches!(err, Error::StackOverflow { capacity: 128, variant: ShaderType::Surface, .. }));

        let program = compile(graph);
        assert!(program.summary.peak_stack_usage >= 150);
    }

    #[test]
    fn cycle_stalls_the_scheduler() {
        let mut graph = ShaderGraph::new();
        let a = graph.add(NodeKind::math(MathOp::Add));
        let b = graph.add(NodeKind::math(MathOp::Add));
        let emission = graph.add(NodeKind::Emission);
        graph.connect(a, "Value", b, "Value1").expect("a->b");
        graph.connect(b, "Value", a, "Value1").expect("b->a");
        graph.connect(b, "Value", emission, "Strength").expect("strength");
        graph.connect(emission, "Emission", OUT, "Surface").expect("surface");

        let err = SvmCompiler::compile(&shader(graph), &CompileOptions::default()).expect_err("stall");
        assert!(matches!(err, Error::SchedulerStalled { remaining: 2, .. }));
    }

    #[test]
    fn missing_output_is_reported() {
        let graph = ShaderGraph::from_nodes(vec![ShaderNode::new(NodeId(0), NodeKind::Emission)])
            .expect("graph");
        let err = SvmCompiler::compile(&shader(graph), &CompileOptions::default()).expect_err("no output");
        assert!(matches!(err, Error::MissingOutput { .. }));
    }

    #[test]
    fn storage_order_does_not_change_output() {
        let mut graph = mix_graph();
        let shared = graph.add(NodeKind::NoiseTexture);
        graph.connect(shared, "Color", NodeId(2), "Color").expect("diffuse");
        graph.connect(shared, "Fac", NodeId(3), "Roughness").expect("glossy");
        let reference = compile(graph.clone()).words;

        let nodes = graph.into_nodes();
        let mut reversed = nodes.clone();
        reversed.reverse();
        let mut rotated = nodes;
        rotated.rotate_left(3);
        for order in [reversed, rotated] {
            let shuffled = ShaderGraph::from_nodes(order).expect("valid");
            assert_eq!(compile(shuffled).words, reference);
        }
    }

    #[test]
    fn every_closure_kind_compiles_on_its_own() {
        let mut kinds = vec![
            (NodeKind::DiffuseBsdf, ShaderType::Surface),
            (NodeKind::TransparentBsdf, ShaderType::Surface),
            (NodeKind::Emission, ShaderType::Surface),
            (NodeKind::Background, ShaderType::Surface),
            (NodeKind::Holdout, ShaderType::Surface),
            (NodeKind::AbsorptionVolume, ShaderType::Volume),
            (NodeKind::ScatterVolume, ShaderType::Volume),
        ];
        for distribution in [
            MicrofacetDistribution::Beckmann,
            MicrofacetDistribution::Ggx,
            MicrofacetDistribution::MultiGgx,
            MicrofacetDistribution::AshikhminShirley,
        ] {
            kinds.push((NodeKind::glossy(distribution), ShaderType::Surface));
            kinds.push((NodeKind::glass(distribution), ShaderType::Surface));
        }
        for method in [
            SubsurfaceMethod::Burley,
            SubsurfaceMethod::RandomWalk,
            SubsurfaceMethod::RandomWalkFixedRadius,
        ] {
            kinds.push((NodeKind::SubsurfaceScattering { method }, ShaderType::Surface));
        }

        for (kind, variant) in kinds {
            let name = kind.name();
            let mut graph = ShaderGraph::new();
            let closure = graph.add(kind);
            let socket = graph.node(closure).expect("closure").outputs[0].name.clone();
            graph
                .connect(closure, &socket, OUT, variant.terminal())
                .expect("terminal");
            let program = SvmCompiler::compile(&shader(graph), &CompileOptions::default())
                .unwrap_or_else(|err| panic!("{name}: {err}"));
            assert!(program.table.entry(variant).is_some(), "{name} has no entry");
            assert!(
                program.section(variant).is_some_and(|words| words.len() > 1),
                "{name} emitted nothing"
            );
        }
    }

    #[test]
    fn transparent_closure_sets_its_flag() {
        let mut graph = ShaderGraph::new();
        let transparent = graph.add(NodeKind::TransparentBsdf);
        graph.connect(transparent, "BSDF", OUT, "Surface").expect("surface");
        let program = compile(graph);
        assert!(program.flags.contains(ShaderFlags::HAS_SURFACE_TRANSPARENT));
        let words = surface(&program);
        let bsdf = position(words, SvmOpcode::ClosureBsdf);
        assert_eq!(decode_uchar4(words[bsdf].y)[0], ClosureType::BsdfTransparent as u32);
        assert_eq!(words[bsdf + 1], SvmNode::new(STACK_INVALID, STACK_INVALID, STACK_INVALID, STACK_INVALID));
    }

    #[test]
    fn every_data_kind_compiles_when_consumed() {
        let kinds = vec![
            NodeKind::value(0.5),
            NodeKind::color(Vec3::ONE),
            NodeKind::math(MathOp::Add),
            NodeKind::vector_math(VectorMathOp::Add),
            NodeKind::mix_color(MixBlend::Multiply),
            NodeKind::Invert,
            NodeKind::Convert {
                from: SocketType::Float,
                to: SocketType::Color,
            },
            NodeKind::Convert {
                from: SocketType::Color,
                to: SocketType::Float,
            },
            NodeKind::ImageTexture { slot: 2 },
            NodeKind::NoiseTexture,
            NodeKind::CheckerTexture,
            NodeKind::TextureCoordinate,
            NodeKind::Geometry,
            NodeKind::Fresnel,
            NodeKind::LayerWeight,
            NodeKind::LightPath,
            NodeKind::Attribute { id: 3 },
            NodeKind::AmbientOcclusion { samples: 4 },
            NodeKind::Bevel { samples: 4 },
            NodeKind::MixClosureWeight,
            NodeKind::bump(),
            NodeKind::SetNormal,
            NodeKind::Displacement {
                space: DisplacementSpace::World,
            },
        ];

        for kind in kinds {
            let name = kind.name();
            let mut graph = ShaderGraph::new();
            let emission = graph.add(NodeKind::Emission);
            graph.connect(emission, "Emission", OUT, "Surface").expect("surface");

            // Every output is written to its own output variable.
            let node = graph.add(kind);
            let outputs: Vec<(String, SocketType)> = graph
                .node(node)
                .expect("node")
                .outputs
                .iter()
                .map(|o| (o.name.clone(), o.ty))
                .collect();
            for (slot, (socket, ty)) in outputs.iter().enumerate() {
                let (aov, input) = if ty.stack_size() == 3 {
                    (NodeKind::aov_color(format!("{name}.{socket}"), slot as u32), "Color")
                } else {
                    (NodeKind::aov_value(format!("{name}.{socket}"), slot as u32), "Value")
                };
                let aov = graph.add(aov);
                graph.connect(node, socket, aov, input).expect("aov");
            }

            let program = SvmCompiler::compile(&shader(graph), &CompileOptions::default())
                .unwrap_or_else(|err| panic!("{name}: {err}"));
            let words = surface(&program);
            let writes = count(words, SvmOpcode::AovColor) + count(words, SvmOpcode::AovValue);
            assert_eq!(writes, outputs.len(), "{name}");
            assert!(program.flags.contains(ShaderFlags::HAS_AOV), "{name}");
        }
    }

    #[test]
    fn reading_a_released_slot_is_a_logic_error() {
        let mut graph = ShaderGraph::new();
        let value = graph.add(NodeKind::value(0.5));
        let math = graph.add(NodeKind::math(MathOp::Add));
        graph.connect(value, "Value", math, "Value1").expect("link");

        let opts = CompileOptions::default();
        let mut ctx = CompileContext::new(&graph, "released", ShaderType::Surface, &opts);
        let producer = graph.node(value).expect("value");
        let consumer = graph.node(math).expect("math");
        let slot = ctx.stack_assign_output(producer, "Value");
        ctx.stack.release(slot, 1);
        ctx.stack_assign(consumer, "Value1");

        let err = ctx.finish().expect_err("released slot");
        assert!(err.is_logic_error());
        assert!(matches!(err, Error::ReleasedSlot { offset: 0, .. }));
    }

    /// Producers shared across a generated closure tree.
    struct Pool {
        floats: Vec<(NodeId, &'static str)>,
        colors: Vec<(NodeId, &'static str)>,
    }

    impl Pool {
        fn new(graph: &mut ShaderGraph) -> Self {
            let coords = graph.add(NodeKind::TextureCoordinate);
            let noise = graph.add(NodeKind::NoiseTexture);
            let checker = graph.add(NodeKind::CheckerTexture);
            let math = graph.add(NodeKind::math(MathOp::Multiply));
            let mix = graph.add(NodeKind::mix_color(MixBlend::Mix));
            graph.connect(coords, "UV", noise, "Vector").expect("noise uv");
            graph.connect(coords, "Object", checker, "Vector").expect("checker uv");
            graph.connect(noise, "Fac", math, "Value1").expect("math a");
            graph.connect(checker, "Fac", math, "Value2").expect("math b");
            graph.connect(math, "Value", mix, "Fac").expect("mix fac");
            graph.connect(noise, "Color", mix, "Color1").expect("mix a");
            graph.connect(checker, "Color", mix, "Color2").expect("mix b");
            Self {
                floats: vec![(noise, "Fac"), (checker, "Fac"), (math, "Value")],
                colors: vec![(noise, "Color"), (checker, "Color"), (mix, "Color")],
            }
        }
    }

    fn pick<T: Copy>(rng: &mut StdRng, items: &[T]) -> T {
        items[rng.next_u32() as usize % items.len()]
    }

    fn random_closure(
        graph: &mut ShaderGraph,
        rng: &mut StdRng,
        pool: &Pool,
        depth: u32,
    ) -> (NodeId, &'static str) {
        if depth == 0 || rng.next_u32() % 3 == 0 {
            let (kind, socket) = match rng.next_u32() % 3 {
                0 => (NodeKind::DiffuseBsdf, "BSDF"),
                1 => (NodeKind::glossy(MicrofacetDistribution::Ggx), "BSDF"),
                _ => (NodeKind::Emission, "Emission"),
            };
            let leaf = graph.add(kind);
            if rng.next_u32() % 3 != 0 {
                let (src, out) = pick(rng, &pool.colors);
                graph.connect(src, out, leaf, "Color").expect("leaf color");
            }
            if socket == "BSDF" && rng.next_u32() % 2 == 0 {
                let (src, out) = pick(rng, &pool.floats);
                graph.connect(src, out, leaf, "Roughness").expect("leaf roughness");
            }
            return (leaf, socket);
        }

        let combine = if rng.next_u32() % 4 == 0 {
            graph.add(NodeKind::AddClosure)
        } else {
            let mix = graph.add(NodeKind::MixClosure);
            if rng.next_u32() % 3 == 0 {
                graph
                    .set_float(mix, "Fac", pick(rng, &[0.0, 0.4, 1.0]))
                    .expect("constant fac");
            } else {
                let (src, out) = pick(rng, &pool.floats);
                graph.connect(src, out, mix, "Fac").expect("linked fac");
            }
            mix
        };
        for input in ["Closure1", "Closure2"] {
            let (child, socket) = random_closure(graph, rng, pool, depth - 1);
            graph.connect(child, socket, combine, input).expect("branch");
        }
        (combine, "Closure")
    }

    #[test]
    fn generated_closure_trees_never_read_released_slots() {
        for seed in 0..500 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut graph = ShaderGraph::new();
            let pool = Pool::new(&mut graph);
            let (root, socket) = random_closure(&mut graph, &mut rng, &pool, 4);
            graph.connect(root, socket, OUT, "Surface").expect("surface");
            for slot in 0..rng.next_u32() % 3 {
                if slot % 2 == 0 {
                    let aov = graph.add(NodeKind::aov_color("color", slot));
                    let (src, out) = pick(&mut rng, &pool.colors);
                    graph.connect(src, out, aov, "Color").expect("aov color");
                } else {
                    let aov = graph.add(NodeKind::aov_value("value", slot));
                    let (src, out) = pick(&mut rng, &pool.floats);
                    graph.connect(src, out, aov, "Value").expect("aov value");
                }
            }

            let program = SvmCompiler::compile(&shader(graph), &CompileOptions::default())
                .unwrap_or_else(|err| panic!("seed {seed}: {err}"));
            let words = surface(&program);
            assert_eq!(words.last().map(|w| w.x), Some(SvmOpcode::End as u32), "seed {seed}");
            let mut at = 0;
            while at < words.len() {
                let op = words[at].opcode().expect("opcode word");
                if matches!(op, SvmOpcode::JumpIfOne | SvmOpcode::JumpIfZero) {
                    assert!(at + (words[at].y as usize) < words.len(), "seed {seed}: jump past end");
                }
                at += op.word_count();
            }
        }
    }
}
