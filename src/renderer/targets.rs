use super::backend::{
    ColorFormat, ColorTargetDesc, DepthArrayDesc, RenderBackend, TargetHandle, TargetStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTargetSet {
    pub shadow_depth_array: TargetHandle,
    pub scene_color: TargetHandle,
    pub debug_color: Option<TargetHandle>,
}

impl RenderTargetSet {
    pub fn handles(&self) -> impl Iterator<Item = TargetHandle> {
        [Some(self.shadow_depth_array), Some(self.scene_color), self.debug_color].into_iter().flatten()
    }
}

/// Owns the off-screen targets. The shadow array follows the cascade layout; the rest follow the viewport.
pub struct RenderTargetManager {
    shadow_resolution: u32,
    with_debug: bool,
    shadow_layers: u32,
    viewport: (u32, u32),
    current: Option<RenderTargetSet>,
    incomplete: Vec<TargetHandle>,
}

impl RenderTargetManager {
    pub fn new(shadow_resolution: u32, with_debug: bool) -> Self {
        Self {
            shadow_resolution: shadow_resolution.max(1),
            with_debug,
            shadow_layers: 0,
            viewport: (0, 0),
            current: None,
            incomplete: Vec::new(),
        }
    }

    pub fn shadow_resolution(&self) -> u32 {
        self.shadow_resolution
    }

    pub fn viewport(&self) -> (u32, u32) {
        self.viewport
    }

    pub fn targets(&self) -> Option<&RenderTargetSet> {
        self.current.as_ref()
    }

    /// True while any current target failed its completeness check.
    pub fn is_degraded(&self) -> bool {
        !self.incomplete.is_empty()
    }

    /// Creates the set on first use, then only replaces targets whose size or layer count changed
    /// or that failed their completeness check.
    ///
    /// Replaced targets are released before their successors are allocated. A zero-sized viewport
    /// keeps the existing set (a minimized window) or falls back to 1x1 when nothing exists yet.
    pub fn create_or_resize<B: RenderBackend>(
        &mut self,
        backend: &mut B,
        width: u32,
        height: u32,
        cascade_count: u32,
    ) -> RenderTargetSet {
        let (width, height) = match (width, height, self.current) {
            (0, _, Some(current)) | (_, 0, Some(current)) => {
                log::debug!("Ignoring zero-sized render target request {width}x{height}");
                return current;
            }
            (w, h, _) => (w.max(1), h.max(1)),
        };
        let layers = cascade_count.max(1);

        let shadow_depth_array = match self.current {
            Some(current) if self.shadow_layers == layers && !self.is_incomplete(current.shadow_depth_array) => {
                current.shadow_depth_array
            }
            previous => {
                if let Some(previous) = previous {
                    self.release(backend, previous.shadow_depth_array);
                }
                let desc = DepthArrayDesc { resolution: self.shadow_resolution, layers };
                let handle = backend.create_depth_array(&desc);
                log::info!(
                    "Created shadow depth array {res}x{res} with {layers} layers",
                    res = self.shadow_resolution
                );
                self.check(backend, handle, "shadow depth array");
                self.shadow_layers = layers;
                handle
            }
        };

        let (scene_color, debug_color) = match self.current {
            Some(current)
                if self.viewport == (width, height)
                    && !self.is_incomplete(current.scene_color)
                    && !current.debug_color.is_some_and(|debug| self.is_incomplete(debug)) =>
            {
                (current.scene_color, current.debug_color)
            }
            previous => {
                if let Some(previous) = previous {
                    self.release(backend, previous.scene_color);
                    if let Some(debug) = previous.debug_color {
                        self.release(backend, debug);
                    }
                }
                let scene = backend.create_color_target(&ColorTargetDesc {
                    label: "Scene Color",
                    width,
                    height,
                    format: ColorFormat::Hdr,
                    with_depth: true,
                });
                self.check(backend, scene, "scene color");
                let debug = if self.with_debug {
                    let debug = backend.create_color_target(&ColorTargetDesc {
                        label: "Depth Debug",
                        width,
                        height,
                        format: ColorFormat::Ldr,
                        with_depth: false,
                    });
                    self.check(backend, debug, "depth debug");
                    Some(debug)
                } else {
                    None
                };
                log::info!("Created viewport targets at {width}x{height}");
                self.viewport = (width, height);
                (scene, debug)
            }
        };

        let set = RenderTargetSet { shadow_depth_array, scene_color, debug_color };
        self.current = Some(set);
        set
    }

    pub fn release_all<B: RenderBackend>(&mut self, backend: &mut B) {
        if let Some(current) = self.current.take() {
            for handle in current.handles() {
                backend.release_target(handle);
            }
        }
        self.incomplete.clear();
        self.shadow_layers = 0;
        self.viewport = (0, 0);
    }

    fn is_incomplete(&self, handle: TargetHandle) -> bool {
        self.incomplete.contains(&handle)
    }

    fn release<B: RenderBackend>(&mut self, backend: &mut B, handle: TargetHandle) {
        self.incomplete.retain(|h| *h != handle);
        backend.release_target(handle);
    }

    fn check<B: RenderBackend>(&mut self, backend: &B, handle: TargetHandle, label: &str) {
        if let TargetStatus::Incomplete(reason) = backend.validate_target(handle) {
            log::error!("Render target '{label}' is incomplete: {reason}. Rendering will be degraded.");
            self.incomplete.push(handle);
        }
    }
}
