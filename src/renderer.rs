pub mod backend;
pub mod cascades;
pub mod pipeline;
pub mod recording;
pub mod shaders;
pub mod targets;
pub mod transforms;
pub mod walker;
pub mod wgpu_backend;
pub mod window_surface;

pub use backend::{ProgramId, ProgramKind, RenderBackend};
pub use cascades::{Cascade, CascadeCalculator};
pub use pipeline::{FrameReport, RenderPipeline, RendererState};
pub use recording::RecordingBackend;
pub use shaders::ShaderLibrary;
pub use targets::{RenderTargetManager, RenderTargetSet};
pub use transforms::SharedTransformBuffer;
pub use walker::SceneRenderWalker;
pub use wgpu_backend::WgpuBackend;

pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;
pub const HDR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;
pub const DEBUG_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
