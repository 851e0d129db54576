use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::renderer::cascades::validate_light_direction;
use crate::renderer::transforms::MAX_CASCADES;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    pub fullscreen: bool,
}

/// Square texel size of every shadow cascade layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ShadowResolution {
    Low,
    Medium,
    #[default]
    High,
    Ultra,
    Extreme,
}

impl ShadowResolution {
    pub fn texels(self) -> u32 {
        match self {
            ShadowResolution::Low => 512,
            ShadowResolution::Medium => 1024,
            ShadowResolution::High => 2048,
            ShadowResolution::Ultra => 4096,
            ShadowResolution::Extreme => 8192,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "low" | "512" => Some(ShadowResolution::Low),
            "medium" | "1024" => Some(ShadowResolution::Medium),
            "high" | "2048" => Some(ShadowResolution::High),
            "ultra" | "4096" => Some(ShadowResolution::Ultra),
            "extreme" | "8192" => Some(ShadowResolution::Extreme),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShadowConfig {
    #[serde(default)]
    pub resolution: ShadowResolution,
    /// Cascade boundaries as fractions of the camera far plane.
    #[serde(default = "ShadowConfig::default_split_fractions")]
    pub split_fractions: Vec<f32>,
    #[serde(default = "ShadowConfig::default_z_mult")]
    pub z_mult: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenderConfig {
    #[serde(default = "RenderConfig::default_exposure")]
    pub exposure: f32,
    #[serde(default = "RenderConfig::default_scene_clear_color")]
    pub scene_clear_color: [f32; 4],
    #[serde(default = "RenderConfig::default_present_clear_color")]
    pub present_clear_color: [f32; 4],
    #[serde(default = "RenderConfig::default_debug_target")]
    pub debug_target: bool,
    #[serde(default)]
    pub shader_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "CameraConfig::default_fov")]
    pub fov_y_degrees: f32,
    #[serde(default = "CameraConfig::default_near")]
    pub near: f32,
    #[serde(default = "CameraConfig::default_far")]
    pub far: f32,
    #[serde(default = "CameraConfig::default_position")]
    pub position: [f32; 3],
    #[serde(default = "CameraConfig::default_target")]
    pub target: [f32; 3],
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub shadow: ShadowConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default = "AppConfig::default_light_direction")]
    pub light_direction: [f32; 3],
}

#[derive(Debug, Clone, Default)]
pub struct AppConfigOverrides {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub vsync: Option<bool>,
    pub shadow_resolution: Option<ShadowResolution>,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self { title: "Umbra".to_string(), width: 1280, height: 720, vsync: true, fullscreen: false }
    }
}

impl ShadowConfig {
    fn default_split_fractions() -> Vec<f32> {
        vec![1.0 / 50.0, 1.0 / 25.0, 1.0 / 10.0, 1.0 / 2.0]
    }

    const fn default_z_mult() -> f32 {
        10.0
    }

    pub fn cascade_count(&self) -> usize {
        self.split_fractions.len() + 1
    }
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            resolution: ShadowResolution::default(),
            split_fractions: Self::default_split_fractions(),
            z_mult: Self::default_z_mult(),
        }
    }
}

impl RenderConfig {
    const fn default_exposure() -> f32 {
        1.0
    }

    const fn default_scene_clear_color() -> [f32; 4] {
        [0.1, 0.1, 0.1, 1.0]
    }

    const fn default_present_clear_color() -> [f32; 4] {
        [1.0, 1.0, 1.0, 1.0]
    }

    const fn default_debug_target() -> bool {
        true
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            exposure: Self::default_exposure(),
            scene_clear_color: Self::default_scene_clear_color(),
            present_clear_color: Self::default_present_clear_color(),
            debug_target: Self::default_debug_target(),
            shader_dir: None,
        }
    }
}

impl CameraConfig {
    const fn default_fov() -> f32 {
        70.0
    }

    const fn default_near() -> f32 {
        0.1
    }

    const fn default_far() -> f32 {
        500.0
    }

    const fn default_position() -> [f32; 3] {
        [0.0, 0.0, 3.0]
    }

    const fn default_target() -> [f32; 3] {
        [0.0, 0.0, 2.0]
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            fov_y_degrees: Self::default_fov(),
            near: Self::default_near(),
            far: Self::default_far(),
            position: Self::default_position(),
            target: Self::default_target(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            shadow: ShadowConfig::default(),
            render: RenderConfig::default(),
            camera: CameraConfig::default(),
            light_direction: Self::default_light_direction(),
        }
    }
}

impl AppConfig {
    fn default_light_direction() -> [f32; 3] {
        [20.0, 50.0, 20.0]
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg: AppConfig = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        cfg.validate().with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                log::warn!("Config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let camera = &self.camera;
        if !(camera.near > 0.0 && camera.far > camera.near) {
            bail!("Camera planes must satisfy 0 < near < far (near={}, far={})", camera.near, camera.far);
        }
        if camera.fov_y_degrees <= 0.0 || camera.fov_y_degrees >= 180.0 {
            bail!("Camera fov must be within (0, 180) degrees (got {})", camera.fov_y_degrees);
        }
        let fractions = &self.shadow.split_fractions;
        if fractions.len() + 1 > MAX_CASCADES {
            bail!("At most {} cascade splits are supported (got {})", MAX_CASCADES - 1, fractions.len());
        }
        let min_fraction = camera.near / camera.far;
        let mut previous = min_fraction;
        for &fraction in fractions {
            if fraction.is_nan() || fraction <= previous || fraction >= 1.0 {
                bail!(
                    "Cascade split fractions must increase strictly within ({min_fraction}, 1): {fractions:?}"
                );
            }
            previous = fraction;
        }
        if self.shadow.z_mult.is_nan() || self.shadow.z_mult < 1.0 {
            bail!("Shadow z_mult must be at least 1.0 (got {})", self.shadow.z_mult);
        }
        if self.render.exposure.is_nan() || self.render.exposure <= 0.0 {
            bail!("Exposure must be positive (got {})", self.render.exposure);
        }
        validate_light_direction(glam::Vec3::from_array(self.light_direction))?;
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: &AppConfigOverrides) {
        if let Some(width) = overrides.width {
            self.window.width = width;
        }
        if let Some(height) = overrides.height {
            self.window.height = height;
        }
        if let Some(vsync) = overrides.vsync {
            self.window.vsync = vsync;
        }
        if let Some(resolution) = overrides.shadow_resolution {
            self.shadow.resolution = resolution;
        }
    }
}

impl AppConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.width.is_none() && self.height.is_none() && self.vsync.is_none() && self.shadow_resolution.is_none()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.width.is_some() {
            fields.push("width");
        }
        if self.height.is_some() {
            fields.push("height");
        }
        if self.vsync.is_some() {
            fields.push("vsync");
        }
        if self.shadow_resolution.is_some() {
            fields.push("shadow_resolution");
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AppConfig::default();
        cfg.validate().expect("default config validates");
        assert_eq!(cfg.shadow.resolution.texels(), 2048);
        assert_eq!(cfg.shadow.cascade_count(), 5);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: AppConfig = serde_json::from_str(r#"{ "shadow": { "resolution": "ultra" } }"#).expect("parse");
        assert_eq!(cfg.shadow.resolution, ShadowResolution::Ultra);
        assert_eq!(cfg.shadow.split_fractions.len(), 4);
        assert_eq!(cfg.window.width, 1280);
        assert_eq!(cfg.render.scene_clear_color, [0.1, 0.1, 0.1, 1.0]);
    }

    #[test]
    fn rejects_non_increasing_splits() {
        let mut cfg = AppConfig::default();
        cfg.shadow.split_fractions = vec![0.1, 0.05];
        assert!(cfg.validate().is_err());
        cfg.shadow.split_fractions = vec![0.5, 1.0];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_vertical_light() {
        let mut cfg = AppConfig::default();
        cfg.light_direction = [0.0, 3.0, 0.0];
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("parallel"), "unexpected error: {err}");
    }

    #[test]
    fn overrides_replace_selected_fields() {
        let mut cfg = AppConfig::default();
        let overrides = AppConfigOverrides {
            width: Some(1920),
            shadow_resolution: Some(ShadowResolution::Low),
            ..Default::default()
        };
        cfg.apply_overrides(&overrides);
        assert_eq!(cfg.window.width, 1920);
        assert_eq!(cfg.window.height, 720);
        assert_eq!(cfg.shadow.resolution, ShadowResolution::Low);
        assert_eq!(overrides.applied_fields(), vec!["width", "shadow_resolution"]);
    }
}
