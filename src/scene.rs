use glam::Vec3;

use crate::camera::Camera;
use crate::config::AppConfig;

/// Read-only view of one drawable object. Empty mesh or texture names skip that resource.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneObjectView {
    pub name: String,
    pub world_position: Vec3,
    pub euler_rotation_degrees: Vec3,
    pub scale: Vec3,
    pub mesh: String,
    pub texture: String,
}

impl SceneObjectView {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            world_position: Vec3::ZERO,
            euler_rotation_degrees: Vec3::ZERO,
            scale: Vec3::ONE,
            mesh: String::new(),
            texture: String::new(),
        }
    }

    pub fn with_mesh(mut self, mesh: impl Into<String>) -> Self {
        self.mesh = mesh.into();
        self
    }

    pub fn with_texture(mut self, texture: impl Into<String>) -> Self {
        self.texture = texture.into();
        self
    }

    pub fn at(mut self, position: Vec3) -> Self {
        self.world_position = position;
        self
    }

    pub fn rotated(mut self, degrees: Vec3) -> Self {
        self.euler_rotation_degrees = degrees;
        self
    }

    pub fn scaled(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }
}

/// Flat draw list plus the light and active camera. Object order is draw order.
#[derive(Debug, Clone)]
pub struct Scene {
    pub light_direction: Vec3,
    pub camera: Camera,
    pub objects: Vec<SceneObjectView>,
}

impl Scene {
    pub fn new(light_direction: Vec3, camera: Camera) -> Self {
        Self { light_direction: light_direction.normalize_or_zero(), camera, objects: Vec::new() }
    }

    pub fn push(&mut self, object: SceneObjectView) {
        self.objects.push(object);
    }

    /// Sphere and cube resting above a wide ground slab.
    pub fn demo(config: &AppConfig) -> Self {
        let mut scene =
            Scene::new(Vec3::from_array(config.light_direction), Camera::from_config(&config.camera));
        scene.push(
            SceneObjectView::new("sphere").with_mesh("sphere").with_texture("wood").at(Vec3::new(5.0, 0.0, 0.0)),
        );
        scene.push(SceneObjectView::new("cube").with_mesh("cube").with_texture("brick"));
        scene.push(
            SceneObjectView::new("ground")
                .with_mesh("cube")
                .with_texture("wood")
                .at(Vec3::new(0.0, -15.0, 0.0))
                .scaled(Vec3::new(100.0, 5.0, 100.0)),
        );
        scene
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_scene_matches_layout() {
        let scene = Scene::demo(&AppConfig::default());
        let names: Vec<&str> = scene.objects.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["sphere", "cube", "ground"]);
        assert!((scene.light_direction.length() - 1.0).abs() < 1e-5);
        assert_eq!(scene.objects[2].scale, Vec3::new(100.0, 5.0, 100.0));
        assert!((scene.camera.far_plane() - 500.0).abs() < f32::EPSILON);
    }
}
