use glam::{Vec3, Vec4};
use umbra::camera::Camera;
use umbra::config::{AppConfig, CameraConfig};
use umbra::renderer::cascades::{frustum_corners_world, CascadeCalculator};

fn camera() -> Camera {
    Camera::from_config(&CameraConfig::default()).with_viewport(1280, 720)
}

fn light() -> Vec3 {
    Vec3::new(20.0, 50.0, 20.0).normalize()
}

const SPLITS: [f32; 4] = [10.0, 20.0, 50.0, 250.0];

#[test]
fn cascades_tile_the_view_range_without_gaps() {
    let camera = camera();
    let cascades = CascadeCalculator::default().compute_cascades(&camera, &SPLITS, light());
    assert_eq!(cascades.len(), SPLITS.len() + 1);
    assert_eq!(cascades[0].near_split, camera.near_plane());
    assert_eq!(cascades.last().map(|c| c.far_split), Some(camera.far_plane()));
    for pair in cascades.windows(2) {
        assert_eq!(pair[0].far_split, pair[1].near_split);
        assert!(pair[0].near_split < pair[0].far_split);
    }
}

#[test]
fn every_sub_frustum_corner_lands_inside_its_light_volume() {
    let camera = camera();
    let cascades = CascadeCalculator::default().compute_cascades(&camera, &SPLITS, light());
    for (index, cascade) in cascades.iter().enumerate() {
        for corner in frustum_corners_world(&camera, cascade.near_split, cascade.far_split) {
            let clip = cascade.light_view_projection * Vec4::new(corner.x, corner.y, corner.z, 1.0);
            let ndc = clip.truncate() / clip.w;
            let eps = 1e-3;
            assert!(ndc.x.abs() <= 1.0 + eps && ndc.y.abs() <= 1.0 + eps, "cascade {index}: {ndc}");
            assert!(ndc.z >= -eps && ndc.z <= 1.0 + eps, "cascade {index} depth {}", ndc.z);
        }
    }
}

#[test]
fn identical_inputs_give_identical_cascades() {
    let camera = camera();
    let calculator = CascadeCalculator::default();
    let first = calculator.compute_cascades(&camera, &SPLITS, light());
    let second = calculator.compute_cascades(&camera, &SPLITS, light());
    assert_eq!(first.as_slice(), second.as_slice());
}

#[test]
fn no_splits_yields_a_single_full_range_cascade() {
    let camera = camera();
    let cascades = CascadeCalculator::default().compute_cascades(&camera, &[], light());
    assert_eq!(cascades.len(), 1);
    assert_eq!((cascades[0].near_split, cascades[0].far_split), (camera.near_plane(), camera.far_plane()));
}

#[test]
fn default_configuration_produces_five_cascades() {
    let config = AppConfig::default();
    let far = config.camera.far;
    let splits: Vec<f32> = config.shadow.split_fractions.iter().map(|f| f * far).collect();
    assert_eq!(splits, SPLITS.to_vec());
    let cascades =
        CascadeCalculator::new(config.shadow.z_mult).compute_cascades(&camera(), &splits, light());
    let ranges: Vec<(f32, f32)> = cascades.iter().map(|c| (c.near_split, c.far_split)).collect();
    assert_eq!(ranges, vec![(0.1, 10.0), (10.0, 20.0), (20.0, 50.0), (50.0, 250.0), (250.0, 500.0)]);
}

#[test]
fn larger_depth_multiplier_reaches_further_casters() {
    let camera = camera();
    let tight = CascadeCalculator::new(1.0).light_space_matrix(&camera, 0.1, 10.0, light());
    let padded = CascadeCalculator::new(10.0).light_space_matrix(&camera, 0.1, 10.0, light());
    // A caster high above the slice along the light direction.
    let caster = Vec3::new(0.0, 0.0, -5.0) + light() * 40.0;
    let depth = |m: glam::Mat4| {
        let clip = m * caster.extend(1.0);
        clip.z / clip.w
    };
    assert!(depth(tight) < 0.0, "unpadded volume should clip the caster");
    assert!((0.0..=1.0).contains(&depth(padded)), "padded volume should contain the caster");
}
