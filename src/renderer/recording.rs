use anyhow::{bail, Result};
use glam::Mat4;
use std::collections::{HashMap, HashSet};

use super::backend::{
    BufferHandle, ColorTargetDesc, CullFace, DepthArrayDesc, MeshHandle, PassDesc, PassTarget,
    ProgramId, ProgramKind, RenderBackend, TargetHandle, TargetInfo, TargetKind, TargetStatus, TextureHandle,
    UniformValue, Viewport,
};
use crate::mesh::Mesh;
use crate::texture::TextureData;

/// Every call a [`RecordingBackend`] observed, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum GpuCall {
    CreateDepthArray { target: TargetHandle, resolution: u32, layers: u32 },
    CreateColorTarget { target: TargetHandle, width: u32, height: u32 },
    ReleaseTarget(TargetHandle),
    CreateTransformBuffer(BufferHandle),
    WriteTransforms { buffer: BufferHandle, matrices: Vec<Mat4> },
    BindTransformBuffer(BufferHandle),
    CompileProgram { kind: ProgramKind, program: ProgramId },
    DestroyProgram(ProgramId),
    UploadMesh(MeshHandle),
    UploadTexture(TextureHandle),
    ResizeSurface { width: u32, height: u32 },
    BeginFrame,
    BeginPass(PassDesc),
    BindProgram(ProgramId),
    SetUniform { name: String, value: UniformValue },
    BindSampledTarget { slot: u32, target: TargetHandle },
    BindTexture { slot: u32, texture: TextureHandle },
    DrawMesh(MeshHandle),
    DrawFullscreenQuad,
    EndPass,
    EndFrame,
}

/// Summary of one pass rebuilt from the call log.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPass {
    pub desc: PassDesc,
    pub program: Option<ProgramId>,
    pub uniforms: Vec<(String, UniformValue)>,
    pub sampled: Vec<(u32, TargetHandle)>,
    pub transforms: Option<BufferHandle>,
    pub texture_binds: Vec<TextureHandle>,
    pub mesh_draws: Vec<MeshHandle>,
    pub fullscreen_draws: usize,
}

impl RecordedPass {
    fn new(desc: PassDesc) -> Self {
        Self {
            desc,
            program: None,
            uniforms: Vec::new(),
            sampled: Vec::new(),
            transforms: None,
            texture_binds: Vec::new(),
            mesh_draws: Vec::new(),
            fullscreen_draws: 0,
        }
    }

    pub fn label(&self) -> &'static str {
        self.desc.label
    }

    pub fn uniform(&self, name: &str) -> Option<UniformValue> {
        self.uniforms.iter().rev().find(|(n, _)| n == name).map(|(_, v)| *v)
    }
}

#[derive(Debug, Clone)]
struct RecordedTarget {
    info: TargetInfo,
    status: TargetStatus,
}

#[derive(Debug, Clone, Copy, Default)]
struct FixedState {
    cull: CullFace,
    viewport: Option<Viewport>,
    in_pass: bool,
}

/// GPU-free backend that records calls for inspection.
///
/// Also lets callers force target incompleteness and shader compile failures.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    calls: Vec<GpuCall>,
    next_handle: u64,
    next_program: u32,
    targets: HashMap<TargetHandle, RecordedTarget>,
    released: Vec<TargetHandle>,
    programs: HashMap<ProgramId, ProgramKind>,
    failing_programs: HashSet<ProgramKind>,
    incomplete_budget: usize,
    state: FixedState,
    frames: u64,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> &[GpuCall] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    pub fn frames_ended(&self) -> u64 {
        self.frames
    }

    /// The next `count` targets created report as incomplete.
    pub fn fail_next_targets(&mut self, count: usize) {
        self.incomplete_budget = count;
    }

    /// Compiles of `kind` fail until [`Self::heal_program`] is called.
    pub fn fail_program(&mut self, kind: ProgramKind) {
        self.failing_programs.insert(kind);
    }

    pub fn heal_program(&mut self, kind: ProgramKind) {
        self.failing_programs.remove(&kind);
    }

    pub fn program_kind(&self, program: ProgramId) -> Option<ProgramKind> {
        self.programs.get(&program).copied()
    }

    pub fn live_targets(&self) -> Vec<TargetHandle> {
        let mut live: Vec<TargetHandle> = self.targets.keys().copied().collect();
        live.sort();
        live
    }

    pub fn is_released(&self, target: TargetHandle) -> bool {
        self.released.contains(&target)
    }

    pub fn current_cull(&self) -> CullFace {
        self.state.cull
    }

    pub fn current_viewport(&self) -> Option<Viewport> {
        self.state.viewport
    }

    /// Passes in call order, across every frame still in the log.
    pub fn passes(&self) -> Vec<RecordedPass> {
        let mut passes = Vec::new();
        let mut current: Option<RecordedPass> = None;
        for call in &self.calls {
            match call {
                GpuCall::BeginPass(desc) => current = Some(RecordedPass::new(*desc)),
                GpuCall::EndPass => {
                    if let Some(pass) = current.take() {
                        passes.push(pass);
                    }
                }
                other => {
                    let Some(pass) = current.as_mut() else { continue };
                    match other {
                        GpuCall::BindProgram(program) => pass.program = Some(*program),
                        GpuCall::SetUniform { name, value } => pass.uniforms.push((name.clone(), *value)),
                        GpuCall::BindSampledTarget { slot, target } => pass.sampled.push((*slot, *target)),
                        GpuCall::BindTransformBuffer(buffer) => pass.transforms = Some(*buffer),
                        GpuCall::BindTexture { texture, .. } => pass.texture_binds.push(*texture),
                        GpuCall::DrawMesh(mesh) => pass.mesh_draws.push(*mesh),
                        GpuCall::DrawFullscreenQuad => pass.fullscreen_draws += 1,
                        _ => {}
                    }
                }
            }
        }
        passes
    }

    pub fn pass_labels(&self) -> Vec<&'static str> {
        self.passes().iter().map(RecordedPass::label).collect()
    }

    pub fn last_transforms(&self) -> Option<&[Mat4]> {
        self.calls.iter().rev().find_map(|call| match call {
            GpuCall::WriteTransforms { matrices, .. } => Some(matrices.as_slice()),
            _ => None,
        })
    }

    fn allocate(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn register_target(&mut self, info: TargetInfo) -> TargetHandle {
        let target = TargetHandle(self.allocate());
        let status = if self.incomplete_budget > 0 {
            self.incomplete_budget -= 1;
            TargetStatus::Incomplete("forced incomplete attachment".to_string())
        } else {
            TargetStatus::Complete
        };
        self.targets.insert(target, RecordedTarget { info, status });
        target
    }
}

impl RenderBackend for RecordingBackend {
    fn create_depth_array(&mut self, desc: &DepthArrayDesc) -> TargetHandle {
        let target = self.register_target(TargetInfo {
            kind: TargetKind::DepthArray,
            width: desc.resolution,
            height: desc.resolution,
            layers: desc.layers,
        });
        self.calls.push(GpuCall::CreateDepthArray { target, resolution: desc.resolution, layers: desc.layers });
        target
    }

    fn create_color_target(&mut self, desc: &ColorTargetDesc) -> TargetHandle {
        let target = self.register_target(TargetInfo {
            kind: TargetKind::Color,
            width: desc.width,
            height: desc.height,
            layers: 1,
        });
        self.calls.push(GpuCall::CreateColorTarget { target, width: desc.width, height: desc.height });
        target
    }

    fn release_target(&mut self, target: TargetHandle) {
        if self.targets.remove(&target).is_some() {
            self.released.push(target);
        }
        self.calls.push(GpuCall::ReleaseTarget(target));
    }

    fn validate_target(&self, target: TargetHandle) -> TargetStatus {
        match self.targets.get(&target) {
            Some(recorded) => recorded.status.clone(),
            None => TargetStatus::Incomplete(format!("unknown target {target:?}")),
        }
    }

    fn target_info(&self, target: TargetHandle) -> Option<TargetInfo> {
        self.targets.get(&target).map(|recorded| recorded.info)
    }

    fn create_transform_buffer(&mut self, _capacity: usize) -> BufferHandle {
        let buffer = BufferHandle(self.allocate());
        self.calls.push(GpuCall::CreateTransformBuffer(buffer));
        buffer
    }

    fn write_transforms(&mut self, buffer: BufferHandle, matrices: &[Mat4]) {
        self.calls.push(GpuCall::WriteTransforms { buffer, matrices: matrices.to_vec() });
    }

    fn bind_transform_buffer(&mut self, buffer: BufferHandle) {
        self.calls.push(GpuCall::BindTransformBuffer(buffer));
    }

    fn compile_program(&mut self, kind: ProgramKind, source: &str) -> Result<ProgramId> {
        if self.failing_programs.contains(&kind) {
            bail!("forced compile failure for '{}'", kind.name());
        }
        if source.trim().is_empty() {
            bail!("empty source for '{}'", kind.name());
        }
        self.next_program += 1;
        let program = ProgramId(self.next_program);
        self.programs.insert(program, kind);
        self.calls.push(GpuCall::CompileProgram { kind, program });
        Ok(program)
    }

    fn destroy_program(&mut self, program: ProgramId) {
        self.programs.remove(&program);
        self.calls.push(GpuCall::DestroyProgram(program));
    }

    fn upload_mesh(&mut self, mesh: &Mesh) -> Result<MeshHandle> {
        if mesh.indices.is_empty() {
            bail!("mesh has no indices");
        }
        let handle = MeshHandle(self.allocate());
        self.calls.push(GpuCall::UploadMesh(handle));
        Ok(handle)
    }

    fn upload_texture(&mut self, texture: &TextureData) -> Result<TextureHandle> {
        if texture.pixels.len() != (texture.width * texture.height * 4) as usize {
            bail!("texture pixel buffer does not match its dimensions");
        }
        let handle = TextureHandle(self.allocate());
        self.calls.push(GpuCall::UploadTexture(handle));
        Ok(handle)
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        self.calls.push(GpuCall::ResizeSurface { width, height });
    }

    fn begin_frame(&mut self) -> Result<()> {
        self.calls.push(GpuCall::BeginFrame);
        Ok(())
    }

    fn begin_pass(&mut self, pass: &PassDesc) {
        debug_assert!(!self.state.in_pass, "pass '{}' began inside another pass", pass.label);
        if let PassTarget::Offscreen(target) = pass.target {
            debug_assert!(self.targets.contains_key(&target), "pass '{}' targets a released handle", pass.label);
        }
        self.state = FixedState { cull: pass.cull, viewport: Some(pass.viewport), in_pass: true };
        self.calls.push(GpuCall::BeginPass(*pass));
    }

    fn bind_program(&mut self, program: ProgramId) {
        self.calls.push(GpuCall::BindProgram(program));
    }

    fn set_uniform(&mut self, name: &str, value: UniformValue) {
        self.calls.push(GpuCall::SetUniform { name: name.to_string(), value });
    }

    fn bind_sampled_target(&mut self, slot: u32, target: TargetHandle) {
        self.calls.push(GpuCall::BindSampledTarget { slot, target });
    }

    fn bind_texture(&mut self, slot: u32, texture: TextureHandle) {
        self.calls.push(GpuCall::BindTexture { slot, texture });
    }

    fn draw_mesh(&mut self, mesh: MeshHandle) {
        self.calls.push(GpuCall::DrawMesh(mesh));
    }

    fn draw_fullscreen_quad(&mut self) {
        self.calls.push(GpuCall::DrawFullscreenQuad);
    }

    fn end_pass(&mut self) {
        self.state = FixedState::default();
        self.calls.push(GpuCall::EndPass);
    }

    fn end_frame(&mut self) -> Result<()> {
        self.frames += 1;
        self.calls.push(GpuCall::EndFrame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::backend::ClearFlags;

    #[test]
    fn handles_are_never_reused() {
        let mut backend = RecordingBackend::new();
        let a = backend.create_depth_array(&DepthArrayDesc { resolution: 512, layers: 3 });
        backend.release_target(a);
        let b = backend.create_depth_array(&DepthArrayDesc { resolution: 512, layers: 3 });
        assert_ne!(a, b);
        assert!(backend.is_released(a));
        assert_eq!(backend.live_targets(), vec![b]);
    }

    #[test]
    fn forced_failures_surface_through_the_trait() {
        let mut backend = RecordingBackend::new();
        backend.fail_next_targets(1);
        let broken = backend.create_depth_array(&DepthArrayDesc { resolution: 16, layers: 1 });
        let fine = backend.create_depth_array(&DepthArrayDesc { resolution: 16, layers: 1 });
        assert!(!backend.validate_target(broken).is_complete());
        assert!(backend.validate_target(fine).is_complete());

        backend.fail_program(ProgramKind::Lit);
        assert!(backend.compile_program(ProgramKind::Lit, "fn main() {}").is_err());
        backend.heal_program(ProgramKind::Lit);
        let program = backend.compile_program(ProgramKind::Lit, "fn main() {}").expect("compiles");
        assert!(program.is_valid());
        assert_eq!(backend.program_kind(program), Some(ProgramKind::Lit));
    }

    #[test]
    fn pass_state_resets_after_end_pass() {
        let mut backend = RecordingBackend::new();
        let target = backend.create_depth_array(&DepthArrayDesc { resolution: 64, layers: 2 });
        backend.begin_pass(&PassDesc {
            label: "Test Pass",
            target: PassTarget::Offscreen(target),
            clear: ClearFlags::DEPTH,
            clear_color: [0.0; 4],
            clear_depth: 1.0,
            viewport: Viewport::sized(64, 64),
            cull: CullFace::Front,
        });
        assert_eq!(backend.current_cull(), CullFace::Front);
        backend.draw_fullscreen_quad();
        backend.end_pass();
        assert_eq!(backend.current_cull(), CullFace::Back);
        assert_eq!(backend.current_viewport(), None);
        let passes = backend.passes();
        assert_eq!(passes.len(), 1);
        assert_eq!(passes[0].fullscreen_draws, 1);
    }
}
