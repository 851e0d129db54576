use glam::Mat4;

use super::backend::{RenderBackend, UniformValue};
use crate::resources::ResourceTables;
use crate::scene::SceneObjectView;

/// Texture unit the lit program reads its diffuse texture from.
pub const DIFFUSE_SLOT: u32 = 0;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WalkStats {
    pub objects: usize,
    pub draws: usize,
    pub texture_binds: usize,
}

/// translate * rotX * rotY * rotZ * scale, angles in degrees.
pub fn model_matrix(object: &SceneObjectView) -> Mat4 {
    let rotation = object.euler_rotation_degrees;
    Mat4::from_translation(object.world_position)
        * Mat4::from_rotation_x(rotation.x.to_radians())
        * Mat4::from_rotation_y(rotation.y.to_radians())
        * Mat4::from_rotation_z(rotation.z.to_radians())
        * Mat4::from_scale(object.scale)
}

/// Issues one draw per object in stored order against whichever program is bound.
pub struct SceneRenderWalker<'a> {
    objects: &'a [SceneObjectView],
    resources: &'a ResourceTables,
}

impl<'a> SceneRenderWalker<'a> {
    pub fn new(objects: &'a [SceneObjectView], resources: &'a ResourceTables) -> Self {
        Self { objects, resources }
    }

    pub fn draw<B: RenderBackend>(&self, backend: &mut B) -> WalkStats {
        let mut stats = WalkStats::default();
        for object in self.objects {
            stats.objects += 1;
            backend.set_uniform("model", UniformValue::Mat4(model_matrix(object)));
            if !object.texture.is_empty() {
                backend.bind_texture(DIFFUSE_SLOT, self.resources.texture(&object.texture));
                stats.texture_binds += 1;
            }
            if !object.mesh.is_empty() {
                backend.draw_mesh(self.resources.mesh(&object.mesh));
                stats.draws += 1;
            }
        }
        stats
    }
}

impl WalkStats {
    pub fn skipped(&self) -> usize {
        self.objects - self.draws
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn model_matrix_applies_scale_then_rotation_then_translation() {
        let object = SceneObjectView::new("crate")
            .at(Vec3::new(1.0, 2.0, 3.0))
            .rotated(Vec3::new(0.0, 90.0, 0.0))
            .scaled(Vec3::splat(2.0));
        let point = model_matrix(&object).transform_point3(Vec3::X);
        assert!((point - Vec3::new(1.0, 2.0, 1.0)).length() < 1e-5, "got {point}");
    }

    #[test]
    fn rotation_order_is_x_then_y_then_z() {
        let object = SceneObjectView::new("crate").rotated(Vec3::new(90.0, 0.0, 90.0));
        let expected = Mat4::from_rotation_x(90f32.to_radians()) * Mat4::from_rotation_z(90f32.to_radians());
        assert!(model_matrix(&object).abs_diff_eq(expected, 1e-6));
        let point = model_matrix(&object).transform_point3(Vec3::X);
        assert!((point - Vec3::Z).length() < 1e-5, "got {point}");
    }
}
