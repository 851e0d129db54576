use crate::cli::CliOverrides;
use crate::config::AppConfig;
use crate::renderer::window_surface::WindowSurface;
use crate::renderer::{RenderPipeline, ShaderLibrary, WgpuBackend};
use crate::resources::ResourceTables;
use crate::scene::Scene;
use crate::time::Time;
use anyhow::{Context, Result};
use winit::application::ApplicationHandler;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::WindowId;

const DEFAULT_CONFIG_PATH: &str = "config/app.json";

pub async fn run() -> Result<()> {
    run_with_overrides(CliOverrides::default()).await
}

pub async fn run_with_overrides(cli: CliOverrides) -> Result<()> {
    let mut config = match cli.config_path() {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_or_default(DEFAULT_CONFIG_PATH),
    };
    let overrides = cli.into_config_overrides();
    if !overrides.is_empty() {
        log::info!("Applying command-line overrides: {}", overrides.applied_fields().join(", "));
        config.apply_overrides(&overrides);
    }
    let event_loop = EventLoop::new().context("Failed to create winit event loop")?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app).context("Event loop execution failed")?;
    Ok(())
}

struct Renderer {
    pipeline: RenderPipeline<WgpuBackend>,
    resources: ResourceTables,
}

pub struct App {
    config: AppConfig,
    scene: Scene,
    time: Time,
    renderer: Option<Renderer>,
    should_close: bool,
}

impl App {
    pub fn new(config: AppConfig) -> Self {
        let scene = Scene::demo(&config);
        Self { config, scene, time: Time::new(), renderer: None, should_close: false }
    }

    fn init_renderer(&mut self, event_loop: &ActiveEventLoop) -> Result<Renderer> {
        let mut surface = WindowSurface::new(&self.config.window);
        surface.ensure_window(event_loop)?;
        let size = surface.size();
        let mut backend = WgpuBackend::new(surface)?;
        let resources = ResourceTables::upload_demo(&mut backend)?;
        let shaders = match self.config.render.shader_dir.as_ref() {
            Some(dir) => ShaderLibrary::from_dir(dir).unwrap_or_else(|err| {
                log::warn!("Shader directory unavailable ({err:#}); using embedded shaders");
                ShaderLibrary::embedded()
            }),
            None => ShaderLibrary::embedded(),
        };
        let pipeline =
            RenderPipeline::new(backend, shaders, &self.config, &self.scene, (size.width, size.height))?;
        Ok(Renderer { pipeline, resources })
    }

    fn handle_key(&mut self, key: &Key) {
        let Some(renderer) = self.renderer.as_mut() else {
            if matches!(key, Key::Named(NamedKey::Escape)) {
                self.should_close = true;
            }
            return;
        };
        match key {
            Key::Named(NamedKey::Escape) => self.should_close = true,
            Key::Character(text) => match text.as_str() {
                "0" => renderer.pipeline.show_depth_layer(None),
                "r" | "R" => renderer.pipeline.request_shader_reload(),
                digit => {
                    if let Some(layer) = digit.parse::<u32>().ok().filter(|n| (1..=9).contains(n)) {
                        renderer.pipeline.show_depth_layer(Some(layer - 1));
                    }
                }
            },
            _ => {}
        }
    }

    fn render(&mut self) {
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };
        let reloaded = renderer.pipeline.check_and_reload_shaders();
        if !reloaded.is_empty() {
            log::info!("Shader change picked up for {reloaded:?}");
        }
        if let Err(err) = renderer.pipeline.render_frame(&self.scene, &renderer.resources) {
            log::warn!("Frame skipped: {err:#}");
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.renderer.is_some() {
            return;
        }
        event_loop.set_control_flow(ControlFlow::Poll);
        match self.init_renderer(event_loop) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(err) => {
                log::error!("Renderer initialization error: {err:?}");
                self.should_close = true;
            }
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => self.should_close = true,
            WindowEvent::Resized(size) => {
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.pipeline.resize(size.width, size.height);
                }
            }
            WindowEvent::KeyboardInput { event: KeyEvent { logical_key, state, .. }, .. } => {
                if state == ElementState::Pressed {
                    self.handle_key(&logical_key);
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.should_close {
            event_loop.exit();
            return;
        }
        self.time.tick();
        if let Some(frame_ms) = self.time.take_report() {
            log::debug!("Average frame time {frame_ms:.2} ms over {} frames", self.time.frame_count());
        }
        self.render();
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(renderer) = self.renderer.take() {
            let frames = renderer.pipeline.frames_rendered();
            drop(renderer.pipeline.shutdown());
            log::info!("Renderer shut down after {frames} frames");
        }
    }
}
