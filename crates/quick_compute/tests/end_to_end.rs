use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use quick_compute::rhi::Command;
use quick_compute::scene::Rect;
use quick_compute::{
    BufferArena, ComputeUnit, ImageBuffer, PointCloudView, RecordingDevice, RenderSurface, Scene,
    SceneConfig, SceneGraph, StorageBuffer, TextureFormat, TextureView,
};

fn shader_file(tag: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("qc-e2e-{tag}-{}.spv", std::process::id()));
    std::fs::write(&path, [0x03, 0x02, 0x23, 0x07]).unwrap();
    path
}

fn count_completions(unit: &ComputeUnit) -> Rc<Cell<u32>> {
    let count = Rc::new(Cell::new(0));
    let c = count.clone();
    unit.on_completed(move |_| c.set(c.get() + 1));
    count
}

fn frame(surface: &RenderSurface, device: &mut RecordingDevice) {
    surface.render_frame(device, &mut SceneGraph::new());
}

#[test]
fn storage_and_image_build_and_dispatch() {
    let surface = RenderSurface::new(64, 64, 1.0);
    let mut device = RecordingDevice::new();
    let arena = BufferArena::new();

    let unit = ComputeUnit::with_surface(&arena, Some(surface.clone()));
    let storage = arena.insert(StorageBuffer::new(vec![0u8; 64]));
    let image = arena.insert(
        ImageBuffer::new()
            .with_size(64, 64)
            .with_format(TextureFormat::Rgba8)
            .with_payload(vec![0u8; 64 * 64 * 4]),
    );
    assert!(unit.attach(storage));
    assert!(unit.attach(image));
    unit.declare_property("time", 0.0);
    unit.set_compute_shader(shader_file("ok"));
    unit.complete();
    let completions = count_completions(&unit);

    frame(&surface, &mut device);

    assert!(!unit.has_errors());
    assert!(unit.rhi_buffer_at(0).is_some());
    assert!(unit.rhi_buffer_at(1).is_none());
    assert!(unit.texture_at(1).is_some());
    assert!(arena.presented_texture(image).is_some());
    assert_eq!(completions.get(), 1);
    assert!(device.commands().contains(&Command::Dispatch(1, 1, 1)));
}

#[test]
fn mismatched_image_payload_blocks_dispatch_but_storage_builds() {
    let surface = RenderSurface::new(64, 64, 1.0);
    let mut device = RecordingDevice::new();
    let arena = BufferArena::new();

    let unit = ComputeUnit::with_surface(&arena, Some(surface.clone()));
    unit.attach(arena.insert(StorageBuffer::new(vec![0u8; 64])));
    let image = arena.insert(ImageBuffer::new().with_size(64, 64).with_payload(vec![0u8; 100]));
    unit.attach(image);
    unit.set_compute_shader(shader_file("mismatch"));
    unit.complete();
    let completions = count_completions(&unit);

    frame(&surface, &mut device);

    assert!(unit.has_errors());
    assert!(unit.rhi_buffer_at(0).is_some());
    assert!(arena.presented_texture(image).is_none());
    assert_eq!(device.dispatch_count(), 0);
    assert_eq!(completions.get(), 0);
}

#[test]
fn mirror_lists_track_attached_buffers() {
    let surface = RenderSurface::new(8, 8, 1.0);
    let arena = BufferArena::new();
    let unit = ComputeUnit::with_surface(&arena, Some(surface));
    let a = arena.insert(StorageBuffer::new(vec![1u8; 4]));
    let b = arena.insert(ImageBuffer::new().with_size(1, 1).with_payload(vec![0u8; 4]));

    assert!(unit.attach(a));
    assert!(!unit.attach(a));
    assert!(unit.attach(b));
    assert_eq!(unit.buffer_count(), 2);
    assert_eq!(unit.index_of(b), Some(1));
    // mirrors exist per slot even before the first build
    assert!(unit.rhi_buffer_at(1).is_none());
    assert!(unit.texture_at(1).is_none());
    assert!(unit.buffer_at(2).is_none());
}

#[test]
fn uniform_size_does_not_depend_on_declaration_order() {
    let arena = BufferArena::new();
    let first = ComputeUnit::with_surface(&arena, None);
    first.declare_property("a", 1);
    first.declare_property("b", 2.0);
    first.declare_property("c", false);
    first.complete();

    let second = ComputeUnit::with_surface(&arena, None);
    second.declare_property("c", false);
    second.declare_property("a", 1);
    second.declare_property("b", 2.0);
    second.complete();

    assert_eq!(first.uniform_buffer_size(), 12);
    assert_eq!(first.uniform_buffer_size(), second.uniform_buffer_size());
}

#[test]
fn stop_then_compute_once_dispatches_exactly_once() {
    let surface = RenderSurface::new(16, 16, 1.0);
    let mut device = RecordingDevice::new();
    let arena = BufferArena::new();
    let unit = ComputeUnit::with_surface(&arena, Some(surface.clone()));
    unit.attach(arena.insert(StorageBuffer::new(vec![0u8; 16])));
    unit.set_compute_shader(shader_file("stop"));
    unit.complete();
    let completions = count_completions(&unit);

    unit.compute_continuously();
    assert!(unit.is_running());
    frame(&surface, &mut device);
    let after_first = device.dispatch_count();
    assert_eq!(after_first, 2);
    assert_eq!(completions.get(), 2);

    unit.stop();
    assert!(!unit.is_running());
    frame(&surface, &mut device);
    frame(&surface, &mut device);
    assert_eq!(device.dispatch_count(), after_first);
    assert_eq!(completions.get(), 2);

    unit.compute_once();
    frame(&surface, &mut device);
    frame(&surface, &mut device);
    assert_eq!(device.dispatch_count(), after_first + 1);
    assert_eq!(completions.get(), 3);
}

#[test]
fn point_cloud_refuses_narrow_stride() {
    let mut view = PointCloudView::new(Rect::default());
    assert!(!view.set_stride_in_byte(16));
    assert_eq!(view.stride_in_byte(), 24);
    assert!(view.set_stride_in_byte(32));
    assert_eq!(view.stride_in_byte(), 32);
}

#[test]
fn views_render_after_first_dispatch() {
    let surface = RenderSurface::new(100, 50, 2.0);
    let mut device = RecordingDevice::new();
    let arena = BufferArena::new();

    let unit = ComputeUnit::with_surface(&arena, Some(surface.clone()));
    let points = arena.insert(StorageBuffer::new(vec![0u8; 24 * 10]));
    let image = arena.insert(ImageBuffer::new().with_size(2, 2).with_payload(vec![0u8; 16]));
    unit.attach(points);
    unit.attach(image);
    unit.set_compute_shader(shader_file("views"));
    unit.complete();

    let mut graph = SceneGraph::new();
    let mut cloud = PointCloudView::new(Rect::new(0.0, 0.0, 100.0, 50.0));
    cloud.set_compute_unit(&unit);
    assert!(cloud.set_result_buffer(points));
    cloud.set_number_of_points(10);
    let cloud_id = graph.add(cloud);

    let mut quad = TextureView::new(Rect::new(10.0, 10.0, 20.0, 20.0));
    quad.set_compute_unit(&unit);
    assert!(quad.set_image_buffer(image));
    let quad_id = graph.add(quad);

    surface.render_frame(&mut device, &mut graph);

    assert!(graph.node(cloud_id).is_some());
    assert!(graph.node(quad_id).is_some());
    let texture = arena.presented_texture(image).unwrap().rhi_texture();
    let commands = device.commands();
    assert!(commands.contains(&Command::Draw(10)));
    assert!(commands.iter().any(|c| matches!(
        c,
        Command::DrawTexture { texture: t, rect, .. }
            if *t == texture && *rect == Rect::new(10.0, 10.0, 20.0, 20.0)
    )));
}

#[test]
fn scene_file_loads_and_runs() {
    let dir = std::env::temp_dir().join(format!("qc-e2e-scene-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::copy(shader_file("scene"), dir.join("sim.spv")).unwrap();
    let scene_path = dir.join("scene.json");
    std::fs::write(
        &scene_path,
        r#"{
            "buffers": [ { "name": "p", "kind": "storage", "payload": { "zeroed": 48 } } ],
            "computeUnits": [ { "name": "sim", "computeShader": "sim.spv", "buffers": ["p"],
                                "continuous": true } ],
            "views": [ { "type": "pointCloud", "computeUnit": "sim", "resultBuffer": "p",
                         "numberOfPoints": 2 } ]
        }"#,
    )
    .unwrap();

    let surface = RenderSurface::new(32, 32, 1.0);
    let mut device = RecordingDevice::new();
    let mut scene = Scene::load(&scene_path, Some(surface.clone()), Rect::new(0.0, 0.0, 32.0, 32.0)).unwrap();
    assert!(scene.unit("sim").unwrap().is_running());

    surface.render_frame(&mut device, scene.graph_mut());
    surface.render_frame(&mut device, scene.graph_mut());
    assert_eq!(device.dispatch_count(), 3);
    assert!(device.commands().contains(&Command::Draw(2)));
    assert!(surface.take_update_request());
}

#[test]
fn missing_scene_file_is_an_io_error() {
    let err = SceneConfig::from_path(Path::new("/no/such/scene.json")).unwrap_err();
    assert!(matches!(err, quick_compute::ConfigError::Io { .. }));
}
