use glam::{Mat4, Vec3};

use crate::config::CameraConfig;

const DEFAULT_UP: Vec3 = Vec3::Y;
const DEFAULT_ASPECT: f32 = 16.0 / 9.0;

/// Perspective camera consumed read-only by the renderer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub forward: Vec3,
    pub up: Vec3,
    pub fov_y_radians: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Camera {
    pub fn new(position: Vec3, target: Vec3, fov_y_radians: f32, aspect: f32, near: f32, far: f32) -> Self {
        let forward = (target - position).try_normalize().unwrap_or(Vec3::NEG_Z);
        Self { position, forward, up: DEFAULT_UP, fov_y_radians, aspect: aspect.max(0.0001), near, far }
    }

    pub fn from_config(cfg: &CameraConfig) -> Self {
        Self::new(
            Vec3::from_array(cfg.position),
            Vec3::from_array(cfg.target),
            cfg.fov_y_degrees.to_radians(),
            DEFAULT_ASPECT,
            cfg.near,
            cfg.far,
        )
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.position + self.forward, self.up)
    }

    /// Projection into wgpu clip space (depth 0..1).
    pub fn projection(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y_radians, self.aspect, self.near, self.far)
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection() * self.view()
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn near_plane(&self) -> f32 {
        self.near
    }

    pub fn far_plane(&self) -> f32 {
        self.far
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.aspect
    }

    pub fn fov_y_radians(&self) -> f32 {
        self.fov_y_radians
    }

    pub fn set_viewport(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.aspect = width as f32 / height as f32;
        }
    }

    pub fn with_viewport(mut self, width: u32, height: u32) -> Self {
        self.set_viewport(width, height);
        self
    }
}
