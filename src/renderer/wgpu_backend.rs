use anyhow::{bail, Context, Result};
use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroU64;
use wgpu::util::DeviceExt;
use winit::dpi::PhysicalSize;

use super::backend::{
    BufferHandle, ClearFlags, ColorFormat, ColorTargetDesc, CullFace, DepthArrayDesc, MeshHandle, PassDesc,
    PassTarget, ProgramId, ProgramKind, RenderBackend, TargetHandle, TargetInfo, TargetKind, TargetStatus,
    TextureHandle, UniformValue, Viewport,
};
use super::pipeline::{SCREEN_SLOT, SHADOW_MAP_SLOT};
use super::transforms::MAX_CASCADES;
use super::window_surface::WindowSurface;
use super::{DEBUG_FORMAT, DEPTH_FORMAT, HDR_FORMAT};
use crate::mesh::{Mesh, MeshVertex};
use crate::texture::TextureData;

const MATERIAL_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;
const MAX_PLANE_DISTANCES: usize = 16;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct FrameUniform {
    view: [[f32; 4]; 4],
    projection: [[f32; 4]; 4],
    view_pos: [f32; 4],
    light_dir: [f32; 4],
    // far plane, exposure
    scalars: [f32; 4],
    // cascade count, debug layer
    counts: [i32; 4],
    cascade_planes: [[f32; 4]; 4],
}

impl Default for FrameUniform {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY.to_cols_array_2d(),
            projection: Mat4::IDENTITY.to_cols_array_2d(),
            view_pos: [0.0; 4],
            light_dir: [0.0, 1.0, 0.0, 0.0],
            scalars: [1.0, 1.0, 0.0, 0.0],
            counts: [0; 4],
            cascade_planes: [[0.0; 4]; 4],
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct DrawUniform {
    model: [[f32; 4]; 4],
    normal: [[f32; 4]; 4],
}

impl DrawUniform {
    fn from_model(model: Mat4) -> Self {
        let normal = if model.determinant().abs() > f32::EPSILON {
            model.inverse().transpose()
        } else {
            Mat4::IDENTITY
        };
        Self { model: model.to_cols_array_2d(), normal: normal.to_cols_array_2d() }
    }
}

struct GpuTarget {
    info: TargetInfo,
    status: TargetStatus,
    format: wgpu::TextureFormat,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    layer_views: Vec<wgpu::TextureView>,
    depth: Option<(wgpu::Texture, wgpu::TextureView)>,
}

struct GpuMesh {
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    index_count: u32,
}

struct GpuProgram {
    kind: ProgramKind,
    module: wgpu::ShaderModule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PipelineKey {
    program: ProgramId,
    cull: CullFace,
    color: Option<wgpu::TextureFormat>,
    depth: bool,
}

struct Layouts {
    shadow_frame: wgpu::BindGroupLayout,
    lit_frame: wgpu::BindGroupLayout,
    draw: wgpu::BindGroupLayout,
    material: wgpu::BindGroupLayout,
    composite: wgpu::BindGroupLayout,
    debug: wgpu::BindGroupLayout,
    shadow_pipeline: wgpu::PipelineLayout,
    lit_pipeline: wgpu::PipelineLayout,
    composite_pipeline: wgpu::PipelineLayout,
    debug_pipeline: wgpu::PipelineLayout,
}

#[derive(Debug, Clone, Copy)]
enum DrawRecord {
    Mesh { mesh: MeshHandle, model: Mat4, texture: Option<TextureHandle> },
    Fullscreen,
}

struct PassRecord {
    desc: PassDesc,
    program: ProgramId,
    frame: FrameUniform,
    transforms: Option<BufferHandle>,
    sampled: SmallVec<[(u32, TargetHandle); 2]>,
    model: Mat4,
    texture: Option<TextureHandle>,
    draws: Vec<DrawRecord>,
}

impl PassRecord {
    fn new(desc: PassDesc) -> Self {
        Self {
            desc,
            program: ProgramId::INVALID,
            frame: FrameUniform::default(),
            transforms: None,
            sampled: SmallVec::new(),
            model: Mat4::IDENTITY,
            texture: None,
            draws: Vec::new(),
        }
    }

    /// Captures the current model and texture. The texture binding lasts for one draw only.
    fn record_mesh(&mut self, mesh: MeshHandle) {
        let texture = self.texture.take();
        self.draws.push(DrawRecord::Mesh { mesh, model: self.model, texture });
    }

    fn sampled(&self, slot: u32) -> Option<TargetHandle> {
        self.sampled.iter().rev().find(|(s, _)| *s == slot).map(|(_, target)| *target)
    }

    fn apply_uniform(&mut self, name: &str, value: UniformValue) {
        match (name, value) {
            ("model", UniformValue::Mat4(m)) => self.model = m,
            ("view", UniformValue::Mat4(m)) => self.frame.view = m.to_cols_array_2d(),
            ("projection", UniformValue::Mat4(m)) => self.frame.projection = m.to_cols_array_2d(),
            ("viewPos", UniformValue::Vec3(v)) => self.frame.view_pos = v.extend(1.0).to_array(),
            ("lightDir", UniformValue::Vec3(v)) => self.frame.light_dir = v.extend(0.0).to_array(),
            ("farPlane", UniformValue::Float(f)) => self.frame.scalars[0] = f,
            ("exposure", UniformValue::Float(f)) => self.frame.scalars[1] = f,
            ("cascadeCount", UniformValue::Int(i)) => self.frame.counts[0] = i,
            ("layer", UniformValue::Int(i)) => self.frame.counts[1] = i,
            (name, UniformValue::Float(f)) => match plane_distance_index(name) {
                Some(index) if index < MAX_PLANE_DISTANCES => self.frame.cascade_planes[index / 4][index % 4] = f,
                _ => log::trace!("Uniform '{name}' is not declared by pass '{}'", self.desc.label),
            },
            (name, _) => log::trace!("Uniform '{name}' is not declared by pass '{}'", self.desc.label),
        }
    }
}

fn plane_distance_index(name: &str) -> Option<usize> {
    name.strip_prefix("cascadePlaneDistances[")?.strip_suffix(']')?.parse().ok()
}

fn align_to(value: u64, alignment: u64) -> u64 {
    let alignment = alignment.max(1);
    value.div_ceil(alignment) * alignment
}

fn clear_color(color: [f32; 4]) -> wgpu::Color {
    wgpu::Color { r: color[0] as f64, g: color[1] as f64, b: color[2] as f64, a: color[3] as f64 }
}

fn fit_viewport(viewport: Viewport, width: u32, height: u32) -> Option<(f32, f32, f32, f32)> {
    let x = viewport.x.min(width);
    let y = viewport.y.min(height);
    let w = viewport.width.min(width - x);
    let h = viewport.height.min(height - y);
    (w > 0 && h > 0).then_some((x as f32, y as f32, w as f32, h as f32))
}

/// Where a pass writes, resolved from its [`PassTarget`].
struct Attachments<'a> {
    color: Option<(&'a wgpu::TextureView, wgpu::TextureFormat)>,
    depth: Option<&'a wgpu::TextureView>,
    layers: &'a [wgpu::TextureView],
    size: (u32, u32),
}

/// [`RenderBackend`] on top of wgpu.
///
/// Calls between `begin_frame` and `end_frame` are recorded, then encoded into a single command
/// buffer and submitted together with the surface present. Shadow passes fan out into one render
/// pass per array layer; the layer reaches the shader as the instance index.
pub struct WgpuBackend {
    surface: WindowSurface,
    device: wgpu::Device,
    queue: wgpu::Queue,
    layouts: Layouts,
    linear_sampler: wgpu::Sampler,
    material_sampler: wgpu::Sampler,
    shadow_sampler: wgpu::Sampler,
    white_texture: wgpu::BindGroup,
    targets: HashMap<TargetHandle, GpuTarget>,
    buffers: HashMap<BufferHandle, (wgpu::Buffer, usize)>,
    meshes: HashMap<MeshHandle, GpuMesh>,
    textures: HashMap<TextureHandle, (wgpu::Texture, wgpu::BindGroup)>,
    programs: HashMap<ProgramId, GpuProgram>,
    pipelines: HashMap<PipelineKey, Option<wgpu::RenderPipeline>>,
    draw_stride: u64,
    next_handle: u64,
    next_program: u32,
    passes: Vec<PassRecord>,
    current: Option<PassRecord>,
    warned: HashSet<String>,
}

impl WgpuBackend {
    /// Takes over an initialized surface (windowed or headless).
    pub fn new(surface: WindowSurface) -> Result<Self> {
        let device = surface.device()?.clone();
        let queue = surface.queue()?.clone();
        let layouts = create_layouts(&device);
        let border = surface.clamp_to_border_supported();
        let (shadow_address, border_color) = if border {
            (wgpu::AddressMode::ClampToBorder, Some(wgpu::SamplerBorderColor::OpaqueWhite))
        } else {
            (wgpu::AddressMode::ClampToEdge, None)
        };
        let shadow_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Shadow Compare Sampler"),
            address_mode_u: shadow_address,
            address_mode_v: shadow_address,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            compare: Some(wgpu::CompareFunction::LessEqual),
            border_color,
            ..Default::default()
        });
        let linear_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Screen Sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        let material_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Material Sampler"),
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        let alignment = device.limits().min_uniform_buffer_offset_alignment as u64;
        let draw_stride = align_to(std::mem::size_of::<DrawUniform>() as u64, alignment);

        let (_, white_texture) = upload_material(
            &device,
            &queue,
            &layouts.material,
            &material_sampler,
            &TextureData::solid([255, 255, 255, 255]),
        );

        Ok(Self {
            surface,
            device,
            queue,
            layouts,
            linear_sampler,
            material_sampler,
            shadow_sampler,
            white_texture,
            targets: HashMap::new(),
            buffers: HashMap::new(),
            meshes: HashMap::new(),
            textures: HashMap::new(),
            programs: HashMap::new(),
            pipelines: HashMap::new(),
            draw_stride,
            next_handle: 0,
            next_program: 0,
            passes: Vec::new(),
            current: None,
            warned: HashSet::new(),
        })
    }

    pub fn surface(&self) -> &WindowSurface {
        &self.surface
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    fn allocate(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn warn_once(&mut self, key: String, message: impl FnOnce() -> String) {
        if self.warned.insert(key) {
            log::warn!("{}", message());
        }
    }

    fn scoped<T>(&self, create: impl FnOnce(&wgpu::Device) -> T) -> (T, Option<wgpu::Error>) {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = create(&self.device);
        let error = pollster::block_on(self.device.pop_error_scope());
        (value, error)
    }

    fn insert_target(&mut self, target: GpuTarget) -> TargetHandle {
        let handle = TargetHandle(self.allocate());
        self.targets.insert(handle, target);
        handle
    }

    fn pipeline_for(&mut self, key: PipelineKey) -> Option<wgpu::RenderPipeline> {
        if let Some(cached) = self.pipelines.get(&key) {
            return cached.clone();
        }
        let program = self.programs.get(&key.program)?;
        let kind = program.kind;
        let layout = match kind {
            ProgramKind::ShadowDepth => &self.layouts.shadow_pipeline,
            ProgramKind::Lit => &self.layouts.lit_pipeline,
            ProgramKind::Composite => &self.layouts.composite_pipeline,
            ProgramKind::DepthDebug => &self.layouts.debug_pipeline,
        };
        let mesh_layout = [MeshVertex::layout()];
        let vertex_buffers: &[wgpu::VertexBufferLayout] = if kind.draws_meshes() { &mesh_layout } else { &[] };
        let color_targets = [key.color.map(|format| wgpu::ColorTargetState {
            format,
            blend: None,
            write_mask: wgpu::ColorWrites::ALL,
        })];
        let cull_mode = match (kind.draws_meshes(), key.cull) {
            (false, _) => None,
            (true, CullFace::Back) => Some(wgpu::Face::Back),
            (true, CullFace::Front) => Some(wgpu::Face::Front),
        };
        let depth_compare = match kind {
            ProgramKind::ShadowDepth => wgpu::CompareFunction::LessEqual,
            _ => wgpu::CompareFunction::Less,
        };
        let module = &program.module;
        let label = format!("{} Pipeline", kind.name());
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(&label),
            layout: Some(layout),
            vertex: wgpu::VertexState {
                module,
                entry_point: Some("vs_main"),
                buffers: vertex_buffers,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: key.color.map(|_| wgpu::FragmentState {
                module,
                entry_point: Some("fs_main"),
                targets: &color_targets,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode,
                ..Default::default()
            },
            depth_stencil: key.depth.then(|| wgpu::DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: true,
                depth_compare,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });
        let pipeline = match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => {
                log::error!("Pipeline for program '{}' failed validation: {err}", kind.name());
                None
            }
            None => Some(pipeline),
        };
        self.pipelines.insert(key, pipeline.clone());
        pipeline
    }

    fn attachments<'a>(
        &'a self,
        target: PassTarget,
        surface_view: &'a wgpu::TextureView,
        surface_format: wgpu::TextureFormat,
    ) -> Option<Attachments<'a>> {
        match target {
            PassTarget::Surface => {
                let size = self.surface.size();
                Some(Attachments {
                    color: Some((surface_view, surface_format)),
                    depth: None,
                    layers: &[],
                    size: (size.width.max(1), size.height.max(1)),
                })
            }
            PassTarget::Offscreen(handle) => {
                let target = self.targets.get(&handle)?;
                let size = (target.info.width, target.info.height);
                Some(match target.info.kind {
                    TargetKind::DepthArray => {
                        Attachments { color: None, depth: None, layers: &target.layer_views, size }
                    }
                    TargetKind::Color => Attachments {
                        color: Some((&target.view, target.format)),
                        depth: target.depth.as_ref().map(|(_, view)| view),
                        layers: &[],
                        size,
                    },
                })
            }
        }
    }

    /// Why a pass cannot draw, if it cannot.
    fn degradation(&self, pass: &PassRecord) -> Option<String> {
        let Some(program) = self.programs.get(&pass.program) else {
            return Some(format!("program {:?} is not available", pass.program));
        };
        let complete = |handle: TargetHandle, kind: TargetKind| match self.targets.get(&handle) {
            Some(target) if target.info.kind != kind => Err(format!("target {handle:?} has the wrong kind")),
            Some(target) => match &target.status {
                TargetStatus::Complete => Ok(()),
                TargetStatus::Incomplete(reason) => Err(format!("target {handle:?} is incomplete: {reason}")),
            },
            None => Err(format!("target {handle:?} does not exist")),
        };
        let output = match (program.kind, pass.desc.target) {
            (ProgramKind::ShadowDepth, PassTarget::Offscreen(handle)) => complete(handle, TargetKind::DepthArray),
            (ProgramKind::ShadowDepth, PassTarget::Surface) => Err("depth program bound to the surface".into()),
            (_, PassTarget::Offscreen(handle)) => complete(handle, TargetKind::Color),
            (_, PassTarget::Surface) => Ok(()),
        };
        if let Err(reason) = output {
            return Some(reason);
        }
        let input = match program.kind {
            ProgramKind::ShadowDepth => Ok(()),
            ProgramKind::Lit => match pass.sampled(SHADOW_MAP_SLOT) {
                Some(handle) => complete(handle, TargetKind::DepthArray),
                None => Err("no shadow map bound".into()),
            },
            ProgramKind::Composite => match pass.sampled(SCREEN_SLOT) {
                Some(handle) => complete(handle, TargetKind::Color),
                None => Err("no scene color bound".into()),
            },
            ProgramKind::DepthDebug => match pass.sampled(SCREEN_SLOT) {
                Some(handle) => complete(handle, TargetKind::DepthArray),
                None => Err("no depth array bound".into()),
            },
        };
        if let Err(reason) = input {
            return Some(reason);
        }
        if program.kind.draws_meshes() {
            match pass.transforms {
                Some(buffer) if self.buffers.contains_key(&buffer) => {}
                _ => return Some("no transform buffer bound".into()),
            }
        }
        None
    }

    fn frame_bind_group(&self, kind: ProgramKind, pass: &PassRecord, frame: &wgpu::Buffer) -> Option<wgpu::BindGroup> {
        let transforms = pass.transforms.and_then(|handle| self.buffers.get(&handle)).map(|(buffer, _)| buffer);
        let sampled_view = |slot: u32| pass.sampled(slot).and_then(|h| self.targets.get(&h)).map(|t| &t.view);
        let label = Some("Frame Bind Group");
        let group = match kind {
            ProgramKind::ShadowDepth => self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label,
                layout: &self.layouts.shadow_frame,
                entries: &[
                    wgpu::BindGroupEntry { binding: 0, resource: frame.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 1, resource: transforms?.as_entire_binding() },
                ],
            }),
            ProgramKind::Lit => self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label,
                layout: &self.layouts.lit_frame,
                entries: &[
                    wgpu::BindGroupEntry { binding: 0, resource: frame.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 1, resource: transforms?.as_entire_binding() },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::TextureView(sampled_view(SHADOW_MAP_SLOT)?),
                    },
                    wgpu::BindGroupEntry { binding: 3, resource: wgpu::BindingResource::Sampler(&self.shadow_sampler) },
                ],
            }),
            ProgramKind::Composite => self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label,
                layout: &self.layouts.composite,
                entries: &[
                    wgpu::BindGroupEntry { binding: 0, resource: frame.as_entire_binding() },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(sampled_view(SCREEN_SLOT)?),
                    },
                    wgpu::BindGroupEntry { binding: 2, resource: wgpu::BindingResource::Sampler(&self.linear_sampler) },
                ],
            }),
            ProgramKind::DepthDebug => self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label,
                layout: &self.layouts.debug,
                entries: &[
                    wgpu::BindGroupEntry { binding: 0, resource: frame.as_entire_binding() },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(sampled_view(SCREEN_SLOT)?),
                    },
                ],
            }),
        };
        Some(group)
    }

    fn encode_clear_only(&self, encoder: &mut wgpu::CommandEncoder, pass: &PassRecord, attachments: &Attachments<'_>) {
        self.encode_layers(encoder, pass, attachments, |_, _| {});
    }

    /// Opens one render pass per depth layer (or a single pass for color targets) and hands each to `draw`.
    fn encode_layers(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        pass: &PassRecord,
        attachments: &Attachments<'_>,
        mut draw: impl FnMut(&mut wgpu::RenderPass<'_>, u32),
    ) {
        let color_load = if pass.desc.clear.contains(ClearFlags::COLOR) {
            wgpu::LoadOp::Clear(clear_color(pass.desc.clear_color))
        } else {
            wgpu::LoadOp::Load
        };
        let depth_ops = Some(wgpu::Operations {
            load: if pass.desc.clear.contains(ClearFlags::DEPTH) {
                wgpu::LoadOp::Clear(pass.desc.clear_depth)
            } else {
                wgpu::LoadOp::Load
            },
            store: wgpu::StoreOp::Store,
        });
        let viewport = fit_viewport(pass.desc.viewport, attachments.size.0, attachments.size.1);

        if attachments.color.is_none() {
            for (layer, view) in attachments.layers.iter().enumerate() {
                let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some(pass.desc.label),
                    color_attachments: &[],
                    depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                        view,
                        depth_ops,
                        stencil_ops: None,
                    }),
                    occlusion_query_set: None,
                    timestamp_writes: None,
                });
                if let Some((x, y, w, h)) = viewport {
                    render_pass.set_viewport(x, y, w, h, 0.0, 1.0);
                    draw(&mut render_pass, layer as u32);
                }
            }
            return;
        }

        let color_attachments = [attachments.color.map(|(view, _)| wgpu::RenderPassColorAttachment {
            view,
            depth_slice: None,
            resolve_target: None,
            ops: wgpu::Operations { load: color_load, store: wgpu::StoreOp::Store },
        })];
        let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(pass.desc.label),
            color_attachments: &color_attachments,
            depth_stencil_attachment: attachments.depth.map(|view| wgpu::RenderPassDepthStencilAttachment {
                view,
                depth_ops,
                stencil_ops: None,
            }),
            occlusion_query_set: None,
            timestamp_writes: None,
        });
        if let Some((x, y, w, h)) = viewport {
            render_pass.set_viewport(x, y, w, h, 0.0, 1.0);
            draw(&mut render_pass, 0);
        }
    }

    fn encode_pass(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        pass: &PassRecord,
        surface_view: &wgpu::TextureView,
        surface_format: wgpu::TextureFormat,
    ) {
        let degradation = self.degradation(pass);
        let pipeline = match degradation {
            None => {
                let key = {
                    let Some(attachments) = self.attachments(pass.desc.target, surface_view, surface_format) else {
                        return;
                    };
                    PipelineKey {
                        program: pass.program,
                        cull: pass.desc.cull,
                        color: attachments.color.map(|(_, format)| format),
                        depth: attachments.depth.is_some() || !attachments.layers.is_empty(),
                    }
                };
                self.pipeline_for(key)
            }
            Some(reason) => {
                self.warn_once(format!("{}:{reason}", pass.desc.label), || {
                    format!("{} drawing disabled: {reason}; the pass only clears", pass.desc.label)
                });
                None
            }
        };
        let Some(attachments) = self.attachments(pass.desc.target, surface_view, surface_format) else {
            self.warn_once(format!("{}:missing", pass.desc.label), || {
                format!("{} targets a released render target", pass.desc.label)
            });
            return;
        };
        let Some(pipeline) = pipeline else {
            self.encode_clear_only(encoder, pass, &attachments);
            return;
        };
        let Some(kind) = self.programs.get(&pass.program).map(|program| program.kind) else {
            return;
        };

        let frame_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Frame Uniform Buffer"),
            contents: bytemuck::bytes_of(&pass.frame),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let Some(frame_group) = self.frame_bind_group(kind, pass, &frame_buffer) else {
            self.encode_clear_only(encoder, pass, &attachments);
            return;
        };

        let mesh_draws: Vec<(&GpuMesh, Mat4, &wgpu::BindGroup)> = pass
            .draws
            .iter()
            .filter_map(|draw| match draw {
                DrawRecord::Mesh { mesh, model, texture } => {
                    let gpu_mesh = self.meshes.get(mesh)?;
                    let material = texture
                        .and_then(|texture| self.textures.get(&texture))
                        .map(|(_, group)| group)
                        .unwrap_or(&self.white_texture);
                    Some((gpu_mesh, *model, material))
                }
                DrawRecord::Fullscreen => None,
            })
            .collect();
        let fullscreen_draws = pass.draws.iter().filter(|draw| matches!(draw, DrawRecord::Fullscreen)).count();

        let stride = self.draw_stride as usize;
        let mut draw_bytes = vec![0u8; stride * mesh_draws.len().max(1)];
        for (index, (_, model, _)) in mesh_draws.iter().enumerate() {
            let uniform = DrawUniform::from_model(*model);
            let offset = index * stride;
            draw_bytes[offset..offset + std::mem::size_of::<DrawUniform>()]
                .copy_from_slice(bytemuck::bytes_of(&uniform));
        }
        let draw_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Draw Uniform Buffer"),
            contents: &draw_bytes,
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let draw_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Draw Bind Group"),
            layout: &self.layouts.draw,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &draw_buffer,
                    offset: 0,
                    size: NonZeroU64::new(std::mem::size_of::<DrawUniform>() as u64),
                }),
            }],
        });

        self.encode_layers(encoder, pass, &attachments, |render_pass, layer| {
            render_pass.set_pipeline(&pipeline);
            render_pass.set_bind_group(0, &frame_group, &[]);
            if kind.draws_meshes() {
                for (index, (mesh, _, material)) in mesh_draws.iter().enumerate() {
                    render_pass.set_bind_group(1, &draw_group, &[(index * stride) as u32]);
                    if kind == ProgramKind::Lit {
                        render_pass.set_bind_group(2, *material, &[]);
                    }
                    render_pass.set_vertex_buffer(0, mesh.vertex_buffer.slice(..));
                    render_pass.set_index_buffer(mesh.index_buffer.slice(..), wgpu::IndexFormat::Uint32);
                    render_pass.draw_indexed(0..mesh.index_count, 0, layer..layer + 1);
                }
            } else {
                for _ in 0..fullscreen_draws {
                    render_pass.draw(0..3, 0..1);
                }
            }
        });
    }
}

fn uniform_entry(binding: u32, visibility: wgpu::ShaderStages, dynamic: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: dynamic,
            min_binding_size: None,
        },
        count: None,
    }
}

fn texture_entry(
    binding: u32,
    sample_type: wgpu::TextureSampleType,
    view_dimension: wgpu::TextureViewDimension,
) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture { sample_type, view_dimension, multisampled: false },
        count: None,
    }
}

fn sampler_entry(binding: u32, ty: wgpu::SamplerBindingType) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Sampler(ty),
        count: None,
    }
}

fn create_layouts(device: &wgpu::Device) -> Layouts {
    let vertex_fragment = wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT;
    let shadow_frame = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("Shadow Frame BGL"),
        entries: &[
            uniform_entry(0, wgpu::ShaderStages::VERTEX, false),
            uniform_entry(1, wgpu::ShaderStages::VERTEX, false),
        ],
    });
    let lit_frame = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("Lit Frame BGL"),
        entries: &[
            uniform_entry(0, vertex_fragment, false),
            uniform_entry(1, vertex_fragment, false),
            texture_entry(2, wgpu::TextureSampleType::Depth, wgpu::TextureViewDimension::D2Array),
            sampler_entry(3, wgpu::SamplerBindingType::Comparison),
        ],
    });
    let draw = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("Draw BGL"),
        entries: &[uniform_entry(0, wgpu::ShaderStages::VERTEX, true)],
    });
    let material = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("Material BGL"),
        entries: &[
            texture_entry(
                0,
                wgpu::TextureSampleType::Float { filterable: true },
                wgpu::TextureViewDimension::D2,
            ),
            sampler_entry(1, wgpu::SamplerBindingType::Filtering),
        ],
    });
    let composite = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("Composite BGL"),
        entries: &[
            uniform_entry(0, wgpu::ShaderStages::FRAGMENT, false),
            texture_entry(
                1,
                wgpu::TextureSampleType::Float { filterable: true },
                wgpu::TextureViewDimension::D2,
            ),
            sampler_entry(2, wgpu::SamplerBindingType::Filtering),
        ],
    });
    let debug = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("Depth Debug BGL"),
        entries: &[
            uniform_entry(0, wgpu::ShaderStages::FRAGMENT, false),
            texture_entry(1, wgpu::TextureSampleType::Depth, wgpu::TextureViewDimension::D2Array),
        ],
    });
    let pipeline_layout = |label: &str, groups: &[&wgpu::BindGroupLayout]| {
        device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(label),
            bind_group_layouts: groups,
            push_constant_ranges: &[],
        })
    };
    let shadow_pipeline = pipeline_layout("Shadow Pipeline Layout", &[&shadow_frame, &draw]);
    let lit_pipeline = pipeline_layout("Lit Pipeline Layout", &[&lit_frame, &draw, &material]);
    let composite_pipeline = pipeline_layout("Composite Pipeline Layout", &[&composite]);
    let debug_pipeline = pipeline_layout("Depth Debug Pipeline Layout", &[&debug]);
    Layouts {
        shadow_frame,
        lit_frame,
        draw,
        material,
        composite,
        debug,
        shadow_pipeline,
        lit_pipeline,
        composite_pipeline,
        debug_pipeline,
    }
}

fn upload_material(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    layout: &wgpu::BindGroupLayout,
    sampler: &wgpu::Sampler,
    data: &TextureData,
) -> (wgpu::Texture, wgpu::BindGroup) {
    let size = wgpu::Extent3d { width: data.width, height: data.height, depth_or_array_layers: 1 };
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Material Texture"),
        size,
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: MATERIAL_FORMAT,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    queue.write_texture(
        wgpu::TexelCopyTextureInfo {
            texture: &texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        &data.pixels,
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(data.bytes_per_row()),
            rows_per_image: Some(data.height),
        },
        size,
    );
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("Material Bind Group"),
        layout,
        entries: &[
            wgpu::BindGroupEntry { binding: 0, resource: wgpu::BindingResource::TextureView(&view) },
            wgpu::BindGroupEntry { binding: 1, resource: wgpu::BindingResource::Sampler(sampler) },
        ],
    });
    (texture, bind_group)
}

fn status_from(error: Option<wgpu::Error>) -> TargetStatus {
    match error {
        Some(err) => TargetStatus::Incomplete(err.to_string()),
        None => TargetStatus::Complete,
    }
}

impl RenderBackend for WgpuBackend {
    fn create_depth_array(&mut self, desc: &DepthArrayDesc) -> TargetHandle {
        let layers = desc.layers.max(1);
        let ((texture, view, layer_views), error) = self.scoped(|device| {
            let texture = device.create_texture(&wgpu::TextureDescriptor {
                label: Some("Shadow Depth Array"),
                size: wgpu::Extent3d {
                    width: desc.resolution,
                    height: desc.resolution,
                    depth_or_array_layers: layers,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: DEPTH_FORMAT,
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            });
            let view = texture.create_view(&wgpu::TextureViewDescriptor {
                label: Some("Shadow Depth Array View"),
                format: Some(DEPTH_FORMAT),
                dimension: Some(wgpu::TextureViewDimension::D2Array),
                array_layer_count: Some(layers),
                ..Default::default()
            });
            let layer_views = (0..layers)
                .map(|layer| {
                    texture.create_view(&wgpu::TextureViewDescriptor {
                        label: Some("Shadow Depth Layer"),
                        format: Some(DEPTH_FORMAT),
                        dimension: Some(wgpu::TextureViewDimension::D2),
                        base_array_layer: layer,
                        array_layer_count: Some(1),
                        ..Default::default()
                    })
                })
                .collect::<Vec<_>>();
            (texture, view, layer_views)
        });
        self.insert_target(GpuTarget {
            info: TargetInfo {
                kind: TargetKind::DepthArray,
                width: desc.resolution,
                height: desc.resolution,
                layers,
            },
            status: status_from(error),
            format: DEPTH_FORMAT,
            texture,
            view,
            layer_views,
            depth: None,
        })
    }

    fn create_color_target(&mut self, desc: &ColorTargetDesc) -> TargetHandle {
        let format = match desc.format {
            ColorFormat::Hdr => HDR_FORMAT,
            ColorFormat::Ldr => DEBUG_FORMAT,
        };
        let size = wgpu::Extent3d { width: desc.width, height: desc.height, depth_or_array_layers: 1 };
        let ((texture, view, depth), error) = self.scoped(|device| {
            let texture = device.create_texture(&wgpu::TextureDescriptor {
                label: Some(desc.label),
                size,
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format,
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                    | wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_SRC,
                view_formats: &[],
            });
            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            let depth = desc.with_depth.then(|| {
                let depth = device.create_texture(&wgpu::TextureDescriptor {
                    label: Some("Viewport Depth"),
                    size,
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: DEPTH_FORMAT,
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                    view_formats: &[],
                });
                let view = depth.create_view(&wgpu::TextureViewDescriptor::default());
                (depth, view)
            });
            (texture, view, depth)
        });
        self.insert_target(GpuTarget {
            info: TargetInfo { kind: TargetKind::Color, width: desc.width, height: desc.height, layers: 1 },
            status: status_from(error),
            format,
            texture,
            view,
            layer_views: Vec::new(),
            depth,
        })
    }

    fn release_target(&mut self, target: TargetHandle) {
        if let Some(gpu) = self.targets.remove(&target) {
            gpu.texture.destroy();
            if let Some((depth, _)) = gpu.depth {
                depth.destroy();
            }
        }
    }

    fn validate_target(&self, target: TargetHandle) -> TargetStatus {
        match self.targets.get(&target) {
            Some(gpu) => gpu.status.clone(),
            None => TargetStatus::Incomplete(format!("unknown target {target:?}")),
        }
    }

    fn target_info(&self, target: TargetHandle) -> Option<TargetInfo> {
        self.targets.get(&target).map(|gpu| gpu.info)
    }

    fn create_transform_buffer(&mut self, capacity: usize) -> BufferHandle {
        let capacity = capacity.clamp(1, MAX_CASCADES);
        let identity = vec![Mat4::IDENTITY.to_cols_array(); MAX_CASCADES];
        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Cascade Transform Buffer"),
            contents: bytemuck::cast_slice(&identity),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let handle = BufferHandle(self.allocate());
        self.buffers.insert(handle, (buffer, capacity));
        handle
    }

    fn write_transforms(&mut self, buffer: BufferHandle, matrices: &[Mat4]) {
        let Some((gpu, capacity)) = self.buffers.get(&buffer) else {
            log::warn!("Transform write to unknown buffer {buffer:?}");
            return;
        };
        let columns: Vec<[f32; 16]> = matrices.iter().take(*capacity).map(Mat4::to_cols_array).collect();
        self.queue.write_buffer(gpu, 0, bytemuck::cast_slice(&columns));
    }

    fn bind_transform_buffer(&mut self, buffer: BufferHandle) {
        if let Some(pass) = self.current.as_mut() {
            pass.transforms = Some(buffer);
        }
    }

    fn compile_program(&mut self, kind: ProgramKind, source: &str) -> Result<ProgramId> {
        if source.trim().is_empty() {
            bail!("empty source for '{}'", kind.name());
        }
        let (module, error) = self.scoped(|device| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(kind.name()),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            })
        });
        if let Some(err) = error {
            bail!("shader '{}' failed to compile: {err}", kind.name());
        }
        self.next_program += 1;
        let program = ProgramId(self.next_program);
        self.programs.insert(program, GpuProgram { kind, module });
        Ok(program)
    }

    fn destroy_program(&mut self, program: ProgramId) {
        self.programs.remove(&program);
        self.pipelines.retain(|key, _| key.program != program);
    }

    fn upload_mesh(&mut self, mesh: &Mesh) -> Result<MeshHandle> {
        if mesh.indices.is_empty() || mesh.vertices.is_empty() {
            bail!("mesh has no geometry");
        }
        let vertex_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Mesh Vertex Buffer"),
            contents: bytemuck::cast_slice(&mesh.vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Mesh Index Buffer"),
            contents: bytemuck::cast_slice(&mesh.indices),
            usage: wgpu::BufferUsages::INDEX,
        });
        let handle = MeshHandle(self.allocate());
        self.meshes.insert(handle, GpuMesh { vertex_buffer, index_buffer, index_count: mesh.index_count() });
        Ok(handle)
    }

    fn upload_texture(&mut self, texture: &TextureData) -> Result<TextureHandle> {
        let expected = texture.width as usize * texture.height as usize * 4;
        if texture.width == 0 || texture.height == 0 || texture.pixels.len() != expected {
            bail!("texture pixel buffer does not match {}x{}", texture.width, texture.height);
        }
        let limit = self.device.limits().max_texture_dimension_2d;
        if texture.width > limit || texture.height > limit {
            bail!("texture {}x{} exceeds the device limit of {limit}", texture.width, texture.height);
        }
        let uploaded =
            upload_material(&self.device, &self.queue, &self.layouts.material, &self.material_sampler, texture);
        let handle = TextureHandle(self.allocate());
        self.textures.insert(handle, uploaded);
        Ok(handle)
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        self.surface.resize(PhysicalSize::new(width, height));
    }

    fn begin_frame(&mut self) -> Result<()> {
        self.passes.clear();
        self.current = None;
        Ok(())
    }

    fn begin_pass(&mut self, pass: &PassDesc) {
        if let Some(open) = self.current.take() {
            log::warn!("Pass '{}' began before '{}' ended", pass.label, open.desc.label);
            self.passes.push(open);
        }
        self.current = Some(PassRecord::new(*pass));
    }

    fn bind_program(&mut self, program: ProgramId) {
        if let Some(pass) = self.current.as_mut() {
            pass.program = program;
        }
    }

    fn set_uniform(&mut self, name: &str, value: UniformValue) {
        if let Some(pass) = self.current.as_mut() {
            pass.apply_uniform(name, value);
        }
    }

    fn bind_sampled_target(&mut self, slot: u32, target: TargetHandle) {
        if let Some(pass) = self.current.as_mut() {
            pass.sampled.push((slot, target));
        }
    }

    fn bind_texture(&mut self, _slot: u32, texture: TextureHandle) {
        if let Some(pass) = self.current.as_mut() {
            pass.texture = Some(texture);
        }
    }

    fn draw_mesh(&mut self, mesh: MeshHandle) {
        if let Some(pass) = self.current.as_mut() {
            pass.record_mesh(mesh);
        }
    }

    fn draw_fullscreen_quad(&mut self) {
        if let Some(pass) = self.current.as_mut() {
            pass.draws.push(DrawRecord::Fullscreen);
        }
    }

    fn end_pass(&mut self) {
        if let Some(pass) = self.current.take() {
            self.passes.push(pass);
        }
    }

    fn end_frame(&mut self) -> Result<()> {
        if let Some(open) = self.current.take() {
            self.passes.push(open);
        }
        let mut passes = std::mem::take(&mut self.passes);
        let frame = self.surface.acquire_surface_frame().context("Failed to acquire surface frame")?;
        let surface_format = self.surface.surface_format()?;
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Frame Encoder"),
        });
        for pass in &passes {
            self.encode_pass(&mut encoder, pass, frame.view(), surface_format);
        }
        self.queue.submit(Some(encoder.finish()));
        frame.present();
        passes.clear();
        self.passes = passes;
        Ok(())
    }
}
