use anyhow::{bail, Result};
use glam::{Mat4, Vec3, Vec4};
use smallvec::SmallVec;

use crate::camera::Camera;

pub const DEFAULT_Z_MULT: f32 = 10.0;
const WORLD_UP: Vec3 = Vec3::Y;
const PARALLEL_EPS: f32 = 1e-4;

/// One slice of the view depth range and the light transform covering it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cascade {
    pub near_split: f32,
    pub far_split: f32,
    pub light_view_projection: Mat4,
}

pub type CascadeList = SmallVec<[Cascade; 8]>;

/// Fits an orthographic light volume around each camera sub-frustum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeCalculator {
    z_mult: f32,
}

impl Default for CascadeCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_Z_MULT)
    }
}

impl CascadeCalculator {
    pub fn new(z_mult: f32) -> Self {
        Self { z_mult: z_mult.max(1.0) }
    }

    pub fn z_mult(&self) -> f32 {
        self.z_mult
    }

    /// `splits` must increase strictly inside (near, far). The last cascade ends at the far plane.
    pub fn compute_cascades(&self, camera: &Camera, splits: &[f32], light_direction: Vec3) -> CascadeList {
        debug_assert!(
            validate_light_direction(light_direction).is_ok(),
            "light direction {light_direction} is not usable"
        );
        cascade_ranges(camera.near_plane(), camera.far_plane(), splits)
            .into_iter()
            .map(|(near, far)| Cascade {
                near_split: near,
                far_split: far,
                light_view_projection: self.light_space_matrix(camera, near, far, light_direction),
            })
            .collect()
    }

    pub fn light_space_matrix(&self, camera: &Camera, near: f32, far: f32, light_direction: Vec3) -> Mat4 {
        let corners = frustum_corners_world(camera, near, far);
        let center = corners.iter().copied().sum::<Vec3>() / corners.len() as f32;
        let light_view = Mat4::look_at_rh(center + light_direction, center, WORLD_UP);

        let mut min = Vec3::splat(f32::MAX);
        let mut max = Vec3::splat(f32::MIN);
        for corner in corners {
            let light_space = light_view.transform_point3(corner);
            min = min.min(light_space);
            max = max.max(light_space);
        }
        let (min_z, max_z) = pad_depth_range(min.z, max.z, self.z_mult);
        // View space looks down -z, so the nearest plane sits at -max_z.
        let light_projection = Mat4::orthographic_rh(min.x, max.x, min.y, max.y, -max_z, -min_z);
        light_projection * light_view
    }
}

/// Consecutive (near, far) pairs: camera near to the first split, through to camera far.
pub fn cascade_ranges(near: f32, far: f32, splits: &[f32]) -> SmallVec<[(f32, f32); 8]> {
    let mut ranges = SmallVec::new();
    let mut previous = near;
    for &split in splits {
        ranges.push((previous, split));
        previous = split;
    }
    ranges.push((previous, far));
    ranges
}

/// The eight corners of the camera frustum clipped to [near, far], in world space.
pub fn frustum_corners_world(camera: &Camera, near: f32, far: f32) -> [Vec3; 8] {
    let projection = Mat4::perspective_rh_gl(camera.fov_y_radians(), camera.aspect_ratio(), near, far);
    let inverse = (projection * camera.view()).inverse();
    let mut corners = [Vec3::ZERO; 8];
    let mut idx = 0;
    for &x in &[-1.0, 1.0] {
        for &y in &[-1.0, 1.0] {
            for &z in &[-1.0, 1.0] {
                let world = inverse * Vec4::new(x, y, z, 1.0);
                corners[idx] = world.truncate() / world.w;
                idx += 1;
            }
        }
    }
    corners
}

/// Widens the light-space depth range so off-frustum casters are not clipped.
pub fn pad_depth_range(mut min_z: f32, mut max_z: f32, z_mult: f32) -> (f32, f32) {
    if min_z < 0.0 {
        min_z *= z_mult;
    } else {
        min_z /= z_mult;
    }
    if max_z < 0.0 {
        max_z /= z_mult;
    } else {
        max_z *= z_mult;
    }
    (min_z, max_z)
}

/// Split distances must increase strictly and lie inside the camera's open (near, far) range.
pub fn validate_split_distances(near: f32, far: f32, splits: &[f32]) -> Result<()> {
    if !(near > 0.0 && far > near) {
        bail!("Camera planes must satisfy 0 < near < far (near={near}, far={far})");
    }
    let mut previous = near;
    for &split in splits {
        if split.is_nan() || split <= previous || split >= far {
            bail!("Cascade split distances {splits:?} must increase strictly within ({near}, {far})");
        }
        previous = split;
    }
    Ok(())
}

/// Normalizes a light direction, rejecting zero vectors and directions parallel to world up.
pub fn validate_light_direction(direction: Vec3) -> Result<Vec3> {
    let Some(unit) = direction.try_normalize() else {
        bail!("Light direction must be non-zero and finite (got {direction})");
    };
    if unit.cross(WORLD_UP).length_squared() < PARALLEL_EPS * PARALLEL_EPS {
        bail!("Light direction {direction} is parallel to world up; the light view would be singular");
    }
    Ok(unit)
}
