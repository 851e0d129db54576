use anyhow::{Context, Result};
use glam::Vec3;
use smallvec::SmallVec;

use super::backend::{
    ClearFlags, CullFace, PassDesc, PassTarget, ProgramKind, RenderBackend, UniformValue, Viewport,
};
use super::cascades::{
    validate_light_direction, validate_split_distances, Cascade, CascadeCalculator, CascadeList,
};
use super::shaders::ShaderLibrary;
use super::targets::{RenderTargetManager, RenderTargetSet};
use super::transforms::SharedTransformBuffer;
use super::walker::{SceneRenderWalker, WalkStats};
use crate::config::AppConfig;
use crate::events::{CommandQueue, RenderCommand};
use crate::resources::ResourceTables;
use crate::scene::Scene;

/// Sampler unit the lit program reads the shadow array from.
pub const SHADOW_MAP_SLOT: u32 = 1;
/// Sampler unit fullscreen programs read their input from.
pub const SCREEN_SLOT: u32 = 0;

const DEBUG_CLEAR_COLOR: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

/// Process-lifetime renderer state, mutated only by resize and per-frame cascade updates.
pub struct RendererState {
    pub light_direction: Vec3,
    pub depth_map_resolution: u32,
    pub cascade_split_distances: SmallVec<[f32; 8]>,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub transform_buffer: SharedTransformBuffer,
}

impl RendererState {
    pub fn cascade_count(&self) -> u32 {
        self.cascade_split_distances.len() as u32 + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameReport {
    pub cascades: usize,
    pub shadow: WalkStats,
    pub lighting: WalkStats,
    pub debug_layer: Option<u32>,
}

/// Runs shadow, lighting, composite and the optional depth debug pass in that order.
pub struct RenderPipeline<B: RenderBackend> {
    backend: B,
    state: RendererState,
    targets: RenderTargetManager,
    target_set: RenderTargetSet,
    calculator: CascadeCalculator,
    shaders: ShaderLibrary,
    commands: CommandQueue,
    debug_layer: Option<u32>,
    exposure: f32,
    scene_clear_color: [f32; 4],
    present_clear_color: [f32; 4],
    cascades: CascadeList,
    frames: u64,
}

impl<B: RenderBackend> RenderPipeline<B> {
    /// Compiles the programs and allocates every target for the initial viewport.
    ///
    /// Fails only on configuration preconditions such as a light parallel to world up or split
    /// distances outside the scene camera's depth range. Incomplete targets and shader failures
    /// are logged and leave the pipeline running degraded.
    pub fn new(
        mut backend: B,
        mut shaders: ShaderLibrary,
        config: &AppConfig,
        scene: &Scene,
        viewport: (u32, u32),
    ) -> Result<Self> {
        config.validate().context("Renderer configuration rejected")?;
        let light_direction =
            validate_light_direction(scene.light_direction).context("Scene light direction rejected")?;
        let far = scene.camera.far_plane();
        let cascade_split_distances: SmallVec<[f32; 8]> =
            config.shadow.split_fractions.iter().map(|fraction| fraction * far).collect();
        validate_split_distances(scene.camera.near_plane(), far, &cascade_split_distances)
            .context("Cascade splits do not fit the scene camera")?;

        shaders.compile_all(&mut backend);
        let transform_buffer = SharedTransformBuffer::new(&mut backend);
        let depth_map_resolution = config.shadow.resolution.texels();
        let mut targets = RenderTargetManager::new(depth_map_resolution, config.render.debug_target);
        let state = RendererState {
            light_direction,
            depth_map_resolution,
            cascade_split_distances,
            viewport_width: viewport.0.max(1),
            viewport_height: viewport.1.max(1),
            transform_buffer,
        };
        let target_set = targets.create_or_resize(
            &mut backend,
            state.viewport_width,
            state.viewport_height,
            state.cascade_count(),
        );
        log::info!(
            "Renderer ready: {}x{} viewport, {} cascades at {}px, splits {:?}",
            state.viewport_width,
            state.viewport_height,
            state.cascade_count(),
            depth_map_resolution,
            state.cascade_split_distances.as_slice()
        );
        Ok(Self {
            backend,
            state,
            targets,
            target_set,
            calculator: CascadeCalculator::new(config.shadow.z_mult),
            shaders,
            commands: CommandQueue::default(),
            debug_layer: None,
            exposure: config.render.exposure,
            scene_clear_color: config.render.scene_clear_color,
            present_clear_color: config.render.present_clear_color,
            cascades: CascadeList::new(),
            frames: 0,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn state(&self) -> &RendererState {
        &self.state
    }

    pub fn target_set(&self) -> RenderTargetSet {
        self.target_set
    }

    pub fn targets_degraded(&self) -> bool {
        self.targets.is_degraded()
    }

    pub fn shaders(&self) -> &ShaderLibrary {
        &self.shaders
    }

    /// Cascades computed by the most recent frame.
    pub fn cascades(&self) -> &[Cascade] {
        &self.cascades
    }

    pub fn debug_layer(&self) -> Option<u32> {
        self.debug_layer
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames
    }

    pub fn pending_commands(&self) -> usize {
        self.commands.len()
    }

    /// Queues a resize; it takes effect before the next frame's passes.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.commands.push(RenderCommand::Resize { width, height });
    }

    pub fn show_depth_layer(&mut self, layer: Option<u32>) {
        self.commands.push(RenderCommand::ShowDepthLayer(layer));
    }

    pub fn request_shader_reload(&mut self) {
        self.commands.push(RenderCommand::ReloadShaders);
    }

    pub fn push_command(&mut self, command: RenderCommand) {
        self.commands.push(command);
    }

    pub fn apply_pending_commands(&mut self) {
        for command in self.commands.drain() {
            log::debug!("Applying render command: {command}");
            match command {
                RenderCommand::Resize { width, height } => self.apply_resize(width, height),
                RenderCommand::ShowDepthLayer(layer) => self.apply_debug_layer(layer),
                RenderCommand::ReloadShaders => {
                    let reloaded = self.shaders.reload_all(&mut self.backend);
                    log::info!("Reloaded {} shader programs", reloaded.len());
                }
            }
        }
    }

    /// Picks up shader edits from disk. Never runs inside a frame.
    pub fn check_and_reload_shaders(&mut self) -> Vec<ProgramKind> {
        self.shaders.check_and_reload(&mut self.backend)
    }

    fn apply_resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            log::debug!("Ignoring resize to {width}x{height}");
            return;
        }
        let same_size = (width, height) == (self.state.viewport_width, self.state.viewport_height);
        if same_size && !self.targets.is_degraded() {
            return;
        }
        if !same_size {
            self.state.viewport_width = width;
            self.state.viewport_height = height;
            self.backend.resize_surface(width, height);
        }
        self.target_set =
            self.targets.create_or_resize(&mut self.backend, width, height, self.state.cascade_count());
        if same_size {
            log::info!("Retried incomplete render targets at {width}x{height}");
        } else {
            log::info!("Viewport resized to {width}x{height}");
        }
    }

    fn apply_debug_layer(&mut self, layer: Option<u32>) {
        match layer {
            Some(layer) if layer >= self.state.cascade_count() => {
                log::warn!(
                    "Depth layer {layer} does not exist; {} cascades are rendered",
                    self.state.cascade_count()
                );
            }
            Some(_) if self.target_set.debug_color.is_none() => {
                log::warn!("Depth layer view requested but the debug target is disabled");
            }
            other => self.debug_layer = other,
        }
    }

    pub fn render_frame(&mut self, scene: &Scene, resources: &ResourceTables) -> Result<FrameReport> {
        self.apply_pending_commands();

        let (width, height) = (self.state.viewport_width, self.state.viewport_height);
        let camera = scene.camera.with_viewport(width, height);
        self.cascades = self.calculator.compute_cascades(
            &camera,
            &self.state.cascade_split_distances,
            self.state.light_direction,
        );
        self.state.transform_buffer.upload(&mut self.backend, &self.cascades);

        self.backend.begin_frame()?;
        let walker = SceneRenderWalker::new(&scene.objects, resources);
        let transforms = self.state.transform_buffer.handle();
        let targets = self.target_set;

        let resolution = self.state.depth_map_resolution;
        self.backend.begin_pass(&PassDesc {
            label: "Shadow Pass",
            target: PassTarget::Offscreen(targets.shadow_depth_array),
            clear: ClearFlags::DEPTH,
            clear_color: [0.0; 4],
            clear_depth: 1.0,
            viewport: Viewport::sized(resolution, resolution),
            cull: CullFace::Front,
        });
        self.backend.bind_program(self.shaders.program(ProgramKind::ShadowDepth));
        self.backend.bind_transform_buffer(transforms);
        let shadow = walker.draw(&mut self.backend);
        self.backend.end_pass();

        self.backend.begin_pass(&PassDesc {
            label: "Lighting Pass",
            target: PassTarget::Offscreen(targets.scene_color),
            clear: ClearFlags::COLOR | ClearFlags::DEPTH,
            clear_color: self.scene_clear_color,
            clear_depth: 1.0,
            viewport: Viewport::sized(width, height),
            cull: CullFace::Back,
        });
        self.backend.bind_program(self.shaders.program(ProgramKind::Lit));
        self.backend.set_uniform("projection", UniformValue::Mat4(camera.projection()));
        self.backend.set_uniform("view", UniformValue::Mat4(camera.view()));
        self.backend.set_uniform("viewPos", UniformValue::Vec3(camera.position()));
        self.backend.set_uniform("lightDir", UniformValue::Vec3(self.state.light_direction));
        self.backend.set_uniform("farPlane", UniformValue::Float(camera.far_plane()));
        self.backend
            .set_uniform("cascadeCount", UniformValue::Int(self.state.cascade_split_distances.len() as i32));
        for (index, distance) in self.state.cascade_split_distances.iter().enumerate() {
            self.backend.set_uniform(&format!("cascadePlaneDistances[{index}]"), UniformValue::Float(*distance));
        }
        self.backend.bind_transform_buffer(transforms);
        self.backend.bind_sampled_target(SHADOW_MAP_SLOT, targets.shadow_depth_array);
        let lighting = walker.draw(&mut self.backend);
        self.backend.end_pass();

        self.backend.begin_pass(&PassDesc {
            label: "Composite Pass",
            target: PassTarget::Surface,
            clear: ClearFlags::COLOR,
            clear_color: self.present_clear_color,
            clear_depth: 1.0,
            viewport: Viewport::sized(width, height),
            cull: CullFace::Back,
        });
        self.backend.bind_program(self.shaders.program(ProgramKind::Composite));
        self.backend.set_uniform("exposure", UniformValue::Float(self.exposure));
        self.backend.bind_sampled_target(SCREEN_SLOT, targets.scene_color);
        self.backend.draw_fullscreen_quad();
        self.backend.end_pass();

        let mut debug_layer = None;
        if let (Some(layer), Some(debug_target)) = (self.debug_layer, targets.debug_color) {
            self.backend.begin_pass(&PassDesc {
                label: "Depth Debug Pass",
                target: PassTarget::Offscreen(debug_target),
                clear: ClearFlags::COLOR,
                clear_color: DEBUG_CLEAR_COLOR,
                clear_depth: 1.0,
                viewport: Viewport::sized(width, height),
                cull: CullFace::Back,
            });
            self.backend.bind_program(self.shaders.program(ProgramKind::DepthDebug));
            self.backend.set_uniform("layer", UniformValue::Int(layer as i32));
            self.backend.bind_sampled_target(SCREEN_SLOT, targets.shadow_depth_array);
            self.backend.draw_fullscreen_quad();
            self.backend.end_pass();
            debug_layer = Some(layer);
        }

        self.backend.end_frame()?;
        self.frames += 1;
        log::trace!(
            "Frame {}: {} shadow draws, {} lit draws, {} objects skipped",
            self.frames,
            shadow.draws,
            lighting.draws,
            lighting.skipped()
        );
        Ok(FrameReport { cascades: self.cascades.len(), shadow, lighting, debug_layer })
    }

    /// Releases every target and program; the backend is returned for reuse or inspection.
    pub fn shutdown(mut self) -> B {
        self.targets.release_all(&mut self.backend);
        self.shaders.destroy_all(&mut self.backend);
        self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::recording::RecordingBackend;

    fn pipeline() -> RenderPipeline<RecordingBackend> {
        let config = AppConfig::default();
        let scene = Scene::demo(&config);
        RenderPipeline::new(RecordingBackend::new(), ShaderLibrary::embedded(), &config, &scene, (1280, 720))
            .expect("pipeline")
    }

    #[test]
    fn split_distances_scale_with_far_plane() {
        let pipeline = pipeline();
        assert_eq!(pipeline.state().cascade_split_distances.as_slice(), &[10.0, 20.0, 50.0, 250.0]);
        assert_eq!(pipeline.state().cascade_count(), 5);
    }

    #[test]
    fn resize_is_deferred_until_commands_apply() {
        let mut pipeline = pipeline();
        let before = pipeline.target_set();
        pipeline.resize(1920, 1080);
        assert_eq!(pipeline.target_set(), before);
        assert_eq!(pipeline.pending_commands(), 1);
        pipeline.apply_pending_commands();
        assert_ne!(pipeline.target_set().scene_color, before.scene_color);
        assert_eq!(pipeline.state().viewport_width, 1920);
    }

    #[test]
    fn out_of_range_debug_layer_is_rejected() {
        let mut pipeline = pipeline();
        pipeline.show_depth_layer(Some(9));
        pipeline.apply_pending_commands();
        assert_eq!(pipeline.debug_layer(), None);
        pipeline.show_depth_layer(Some(4));
        pipeline.apply_pending_commands();
        assert_eq!(pipeline.debug_layer(), Some(4));
    }

    #[test]
    fn vertical_light_is_a_construction_error() {
        let config = AppConfig::default();
        let mut scene = Scene::demo(&config);
        scene.light_direction = Vec3::Y;
        let result =
            RenderPipeline::new(RecordingBackend::new(), ShaderLibrary::embedded(), &config, &scene, (64, 64));
        assert!(result.is_err());
    }
}
