use anyhow::Result;
use bitflags::bitflags;
use glam::{Mat4, Vec3};

use crate::mesh::Mesh;
use crate::texture::TextureData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u64);

/// Compiled shader program. Id 0 is reserved for programs that failed to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProgramId(pub u32);

impl ProgramId {
    pub const INVALID: ProgramId = ProgramId(0);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// The fixed set of programs, one per named pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProgramKind {
    ShadowDepth,
    Lit,
    Composite,
    DepthDebug,
}

impl ProgramKind {
    pub const ALL: [ProgramKind; 4] =
        [ProgramKind::ShadowDepth, ProgramKind::Lit, ProgramKind::Composite, ProgramKind::DepthDebug];

    pub fn name(self) -> &'static str {
        match self {
            ProgramKind::ShadowDepth => "shadowDepth",
            ProgramKind::Lit => "shadow",
            ProgramKind::Composite => "screen",
            ProgramKind::DepthDebug => "debugDepth",
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            ProgramKind::ShadowDepth => "shadow_depth.wgsl",
            ProgramKind::Lit => "shadow_lit.wgsl",
            ProgramKind::Composite => "screen.wgsl",
            ProgramKind::DepthDebug => "debug_depth.wgsl",
        }
    }

    /// Scene programs consume mesh vertices; the rest draw a fullscreen triangle.
    pub fn draws_meshes(self) -> bool {
        matches!(self, ProgramKind::ShadowDepth | ProgramKind::Lit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthArrayDesc {
    pub resolution: u32,
    pub layers: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorFormat {
    /// Linear HDR scene color.
    Hdr,
    /// 8-bit visualization output.
    Ldr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorTargetDesc {
    pub label: &'static str,
    pub width: u32,
    pub height: u32,
    pub format: ColorFormat,
    pub with_depth: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetStatus {
    Complete,
    Incomplete(String),
}

impl TargetStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, TargetStatus::Complete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    DepthArray,
    Color,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetInfo {
    pub kind: TargetKind,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassTarget {
    Surface,
    Offscreen(TargetHandle),
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClearFlags: u8 {
        const COLOR = 1;
        const DEPTH = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullFace {
    #[default]
    Back,
    Front,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn sized(width: u32, height: u32) -> Self {
        Self { x: 0, y: 0, width, height }
    }
}

/// Fixed-function state for one pass. Culling and viewport revert when the pass ends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassDesc {
    pub label: &'static str,
    pub target: PassTarget,
    pub clear: ClearFlags,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
    pub viewport: Viewport,
    pub cull: CullFace,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    Int(i32),
    Float(f32),
    Vec3(Vec3),
    Mat4(Mat4),
}

/// Immediate-mode GPU seam the pipeline drives.
///
/// Uniform writes are fire-and-forget: names the bound program does not declare are ignored
/// without reporting. Resource handles are never reused after release.
pub trait RenderBackend {
    fn create_depth_array(&mut self, desc: &DepthArrayDesc) -> TargetHandle;
    fn create_color_target(&mut self, desc: &ColorTargetDesc) -> TargetHandle;
    fn release_target(&mut self, target: TargetHandle);
    fn validate_target(&self, target: TargetHandle) -> TargetStatus;
    fn target_info(&self, target: TargetHandle) -> Option<TargetInfo>;

    fn create_transform_buffer(&mut self, capacity: usize) -> BufferHandle;
    fn write_transforms(&mut self, buffer: BufferHandle, matrices: &[Mat4]);
    fn bind_transform_buffer(&mut self, buffer: BufferHandle);

    fn compile_program(&mut self, kind: ProgramKind, source: &str) -> Result<ProgramId>;
    fn destroy_program(&mut self, program: ProgramId);

    fn upload_mesh(&mut self, mesh: &Mesh) -> Result<MeshHandle>;
    fn upload_texture(&mut self, texture: &TextureData) -> Result<TextureHandle>;

    /// Matches the presentation surface to a new window size.
    fn resize_surface(&mut self, width: u32, height: u32);

    fn begin_frame(&mut self) -> Result<()>;
    fn begin_pass(&mut self, pass: &PassDesc);
    fn bind_program(&mut self, program: ProgramId);
    fn set_uniform(&mut self, name: &str, value: UniformValue);
    fn bind_sampled_target(&mut self, slot: u32, target: TargetHandle);
    fn bind_texture(&mut self, slot: u32, texture: TextureHandle);
    fn draw_mesh(&mut self, mesh: MeshHandle);
    fn draw_fullscreen_quad(&mut self);
    fn end_pass(&mut self);
    fn end_frame(&mut self) -> Result<()>;
}
