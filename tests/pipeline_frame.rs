use glam::{Mat4, Vec3};
use umbra::config::AppConfig;
use umbra::renderer::backend::{
    ClearFlags, CullFace, PassTarget, ProgramId, ProgramKind, RenderBackend, TargetKind, UniformValue,
    Viewport,
};
use umbra::renderer::recording::{GpuCall, RecordingBackend};
use umbra::renderer::{RenderPipeline, ShaderLibrary};
use umbra::resources::ResourceTables;
use umbra::scene::{Scene, SceneObjectView};

struct Harness {
    config: AppConfig,
    scene: Scene,
    resources: ResourceTables,
    pipeline: RenderPipeline<RecordingBackend>,
}

fn harness_with(mut backend: RecordingBackend) -> Harness {
    let config = AppConfig::default();
    let scene = Scene::demo(&config);
    let resources = ResourceTables::upload_demo(&mut backend).expect("demo resources");
    let mut pipeline =
        RenderPipeline::new(backend, ShaderLibrary::embedded(), &config, &scene, (1280, 720)).expect("pipeline");
    pipeline.backend_mut().clear_calls();
    Harness { config, scene, resources, pipeline }
}

fn harness() -> Harness {
    harness_with(RecordingBackend::new())
}

#[test]
fn frame_runs_shadow_lighting_composite_in_order() {
    let mut h = harness();
    let report = h.pipeline.render_frame(&h.scene, &h.resources).expect("frame");
    assert_eq!(report.cascades, 5);
    assert_eq!(report.debug_layer, None);

    let backend = h.pipeline.backend();
    assert_eq!(backend.pass_labels(), vec!["Shadow Pass", "Lighting Pass", "Composite Pass"]);
    assert_eq!(backend.calls().first(), Some(&GpuCall::WriteTransforms {
        buffer: h.pipeline.state().transform_buffer.handle(),
        matrices: backend.last_transforms().expect("transforms").to_vec(),
    }));
    assert_eq!(backend.calls().last(), Some(&GpuCall::EndFrame));
    assert_eq!(backend.frames_ended(), 1);
    assert_eq!(h.pipeline.frames_rendered(), 1);
}

#[test]
fn shadow_pass_renders_every_layer_from_the_light() {
    let mut h = harness();
    h.pipeline.render_frame(&h.scene, &h.resources).expect("frame");
    let targets = h.pipeline.target_set();
    let passes = h.pipeline.backend().passes();
    let shadow = &passes[0];
    assert_eq!(shadow.desc.target, PassTarget::Offscreen(targets.shadow_depth_array));
    assert_eq!(shadow.desc.clear, ClearFlags::DEPTH);
    assert_eq!(shadow.desc.cull, CullFace::Front);
    assert_eq!(shadow.desc.viewport, Viewport::sized(2048, 2048));
    assert_eq!(shadow.program, Some(h.pipeline.shaders().program(ProgramKind::ShadowDepth)));
    assert_eq!(shadow.transforms, Some(h.pipeline.state().transform_buffer.handle()));
    assert_eq!(shadow.mesh_draws.len(), 3);

    let info = h.pipeline.backend().target_info(targets.shadow_depth_array).expect("shadow info");
    assert_eq!(info.kind, TargetKind::DepthArray);
    assert_eq!(info.layers, 5);

    // Culling state does not leak out of the pass.
    assert_eq!(h.pipeline.backend().current_cull(), CullFace::Back);
}

#[test]
fn transform_buffer_holds_cascades_then_identity() {
    let mut h = harness();
    h.pipeline.render_frame(&h.scene, &h.resources).expect("frame");
    let uploaded = h.pipeline.backend().last_transforms().expect("transforms").to_vec();
    assert_eq!(uploaded.len(), 16);
    let cascades = h.pipeline.cascades();
    for (matrix, cascade) in uploaded.iter().zip(cascades) {
        assert_eq!(*matrix, cascade.light_view_projection);
    }
    assert!(uploaded[cascades.len()..].iter().all(|m| *m == Mat4::IDENTITY));
}

#[test]
fn lighting_pass_receives_camera_light_and_split_uniforms() {
    let mut h = harness();
    h.pipeline.render_frame(&h.scene, &h.resources).expect("frame");
    let targets = h.pipeline.target_set();
    let passes = h.pipeline.backend().passes();
    let lighting = &passes[1];
    assert_eq!(lighting.desc.target, PassTarget::Offscreen(targets.scene_color));
    assert_eq!(lighting.desc.clear, ClearFlags::COLOR | ClearFlags::DEPTH);
    assert_eq!(lighting.desc.clear_color, h.config.render.scene_clear_color);
    assert_eq!(lighting.desc.viewport, Viewport::sized(1280, 720));
    assert_eq!(lighting.sampled, vec![(1, targets.shadow_depth_array)]);
    assert_eq!(lighting.uniform("cascadeCount"), Some(UniformValue::Int(4)));
    assert_eq!(lighting.uniform("farPlane"), Some(UniformValue::Float(500.0)));
    assert_eq!(lighting.uniform("cascadePlaneDistances[0]"), Some(UniformValue::Float(10.0)));
    assert_eq!(lighting.uniform("cascadePlaneDistances[3]"), Some(UniformValue::Float(250.0)));
    assert_eq!(lighting.uniform("viewPos"), Some(UniformValue::Vec3(Vec3::new(0.0, 0.0, 3.0))));
    let Some(UniformValue::Vec3(light)) = lighting.uniform("lightDir") else {
        panic!("lightDir uniform missing");
    };
    assert!((light - h.scene.light_direction).length() < 1e-5);
    assert_eq!(lighting.mesh_draws.len(), 3);
    assert_eq!(lighting.texture_binds.len(), 3);

    let composite = &passes[2];
    assert_eq!(composite.desc.target, PassTarget::Surface);
    assert_eq!(composite.desc.clear_color, h.config.render.present_clear_color);
    assert_eq!(composite.sampled, vec![(0, targets.scene_color)]);
    assert_eq!(composite.uniform("exposure"), Some(UniformValue::Float(1.0)));
    assert_eq!(composite.fullscreen_draws, 1);
    assert!(composite.mesh_draws.is_empty());
}

#[test]
fn objects_without_mesh_or_texture_are_skipped_quietly() {
    let mut h = harness();
    h.scene.push(SceneObjectView::new("marker"));
    h.scene.push(SceneObjectView::new("bare").with_mesh("cube").at(Vec3::new(-4.0, 0.0, 0.0)));
    let report = h.pipeline.render_frame(&h.scene, &h.resources).expect("frame");
    assert_eq!(report.lighting.objects, 5);
    assert_eq!(report.lighting.draws, 4);
    assert_eq!(report.lighting.texture_binds, 3);
    assert_eq!(report.lighting.skipped(), 1);
    assert_eq!(report.shadow, report.lighting);
}

#[test]
fn depth_debug_pass_follows_composite_when_requested() {
    let mut h = harness();
    h.pipeline.show_depth_layer(Some(2));
    let report = h.pipeline.render_frame(&h.scene, &h.resources).expect("frame");
    assert_eq!(report.debug_layer, Some(2));
    let targets = h.pipeline.target_set();
    let passes = h.pipeline.backend().passes();
    let labels: Vec<&str> = passes.iter().map(|p| p.label()).collect();
    assert_eq!(labels, vec!["Shadow Pass", "Lighting Pass", "Composite Pass", "Depth Debug Pass"]);
    let debug = &passes[3];
    assert_eq!(Some(debug.desc.target), targets.debug_color.map(PassTarget::Offscreen));
    assert_eq!(debug.uniform("layer"), Some(UniformValue::Int(2)));
    assert_eq!(debug.sampled, vec![(0, targets.shadow_depth_array)]);

    h.pipeline.backend_mut().clear_calls();
    h.pipeline.show_depth_layer(None);
    h.pipeline.render_frame(&h.scene, &h.resources).expect("frame");
    assert_eq!(h.pipeline.backend().pass_labels().len(), 3);
}

#[test]
fn resize_recreates_viewport_targets_only() {
    let mut h = harness();
    let before = h.pipeline.target_set();
    h.pipeline.resize(1920, 1080);
    h.pipeline.render_frame(&h.scene, &h.resources).expect("frame");
    let after = h.pipeline.target_set();

    assert_eq!(after.shadow_depth_array, before.shadow_depth_array);
    assert_ne!(after.scene_color, before.scene_color);
    assert_ne!(after.debug_color, before.debug_color);
    let backend = h.pipeline.backend();
    assert!(backend.is_released(before.scene_color));
    assert!(!backend.is_released(before.shadow_depth_array));
    assert!(backend.calls().contains(&GpuCall::ResizeSurface { width: 1920, height: 1080 }));

    let scene_info = backend.target_info(after.scene_color).expect("scene color");
    assert_eq!((scene_info.width, scene_info.height), (1920, 1080));
    let debug_info = backend.target_info(after.debug_color.expect("debug target")).expect("debug color");
    assert_eq!((debug_info.width, debug_info.height), (1920, 1080));
    assert!(backend.is_released(before.debug_color.expect("debug target")));
    let shadow_info = backend.target_info(after.shadow_depth_array).expect("shadow array");
    assert_eq!((shadow_info.width, shadow_info.height), (2048, 2048));

    let passes = backend.passes();
    assert_eq!(passes[0].desc.viewport, Viewport::sized(2048, 2048));
    assert_eq!(passes[1].desc.viewport, Viewport::sized(1920, 1080));
    let resized_projection = h.scene.camera.with_viewport(1920, 1080).projection();
    assert_eq!(passes[1].uniform("projection"), Some(UniformValue::Mat4(resized_projection)));
    assert_eq!(h.pipeline.state().viewport_width, 1920);
}

#[test]
fn zero_sized_resize_keeps_everything() {
    let mut h = harness();
    let before = h.pipeline.target_set();
    h.pipeline.resize(0, 0);
    h.pipeline.render_frame(&h.scene, &h.resources).expect("frame");
    assert_eq!(h.pipeline.target_set(), before);
    assert_eq!((h.pipeline.state().viewport_width, h.pipeline.state().viewport_height), (1280, 720));
}

#[test]
fn incomplete_targets_degrade_without_failing_frames() {
    let mut backend = RecordingBackend::new();
    backend.fail_next_targets(1);
    let mut h = harness_with(backend);
    assert!(h.pipeline.targets_degraded());
    h.pipeline.render_frame(&h.scene, &h.resources).expect("frame still renders");
    assert_eq!(h.pipeline.backend().pass_labels().len(), 3);
}

#[test]
fn same_size_resize_retries_incomplete_targets() {
    let mut backend = RecordingBackend::new();
    backend.fail_next_targets(1);
    let mut h = harness_with(backend);
    let before = h.pipeline.target_set();
    assert!(h.pipeline.targets_degraded());

    h.pipeline.resize(1280, 720);
    h.pipeline.render_frame(&h.scene, &h.resources).expect("frame");
    let after = h.pipeline.target_set();
    assert!(!h.pipeline.targets_degraded());
    assert_ne!(after.shadow_depth_array, before.shadow_depth_array);
    assert_eq!(after.scene_color, before.scene_color);
    let backend = h.pipeline.backend();
    assert!(backend.is_released(before.shadow_depth_array));
    assert!(!backend.calls().iter().any(|call| matches!(call, GpuCall::ResizeSurface { .. })));
}

#[test]
fn splits_outside_the_scene_camera_range_are_rejected() {
    let config = AppConfig::default();
    let mut scene = Scene::demo(&config);
    scene.camera.near = 1.0;
    scene.camera.far = 40.0;
    let result = RenderPipeline::new(RecordingBackend::new(), ShaderLibrary::embedded(), &config, &scene, (64, 64));
    let err = result.err().expect("first split 0.8 lies before the near plane");
    assert!(format!("{err:#}").contains("scene camera"), "unexpected error: {err:#}");

    scene.camera.near = 0.1;
    let mut backend = RecordingBackend::new();
    let resources = ResourceTables::upload_demo(&mut backend).expect("demo resources");
    let mut pipeline = RenderPipeline::new(backend, ShaderLibrary::embedded(), &config, &scene, (64, 64))
        .expect("splits fit the near plane");
    pipeline.render_frame(&scene, &resources).expect("frame");
    for cascade in pipeline.cascades() {
        assert!(cascade.near_split < cascade.far_split, "{cascade:?}");
    }
    assert_eq!(pipeline.cascades().last().map(|c| c.far_split), Some(40.0));
}

#[test]
fn failed_program_leaves_its_pass_bound_to_the_invalid_id() {
    let mut backend = RecordingBackend::new();
    backend.fail_program(ProgramKind::Lit);
    let mut h = harness_with(backend);
    assert_eq!(h.pipeline.shaders().program(ProgramKind::Lit), ProgramId::INVALID);
    h.pipeline.render_frame(&h.scene, &h.resources).expect("frame");
    let passes = h.pipeline.backend().passes();
    assert_eq!(passes[1].program, Some(ProgramId::INVALID));
    assert!(passes[0].program.is_some_and(ProgramId::is_valid));

    h.pipeline.backend_mut().heal_program(ProgramKind::Lit);
    h.pipeline.request_shader_reload();
    h.pipeline.render_frame(&h.scene, &h.resources).expect("frame");
    assert!(h.pipeline.shaders().program(ProgramKind::Lit).is_valid());
}

#[test]
fn shutdown_releases_every_target() {
    let h = harness();
    let backend = h.pipeline.shutdown();
    assert!(backend.live_targets().is_empty());
}
