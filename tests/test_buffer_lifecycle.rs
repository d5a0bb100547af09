//! Buffer-size invariants across the render thread's working set.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, RwLock};

use trace3d::config::{KernelCacheMode, RenderConfig, SamplerType};
use trace3d::device::{Device, MissEverything, NativeDevice};
use trace3d::engine::{DeviceRenderThread, RenderThreadShared};
use trace3d::film::Film;
use trace3d::kernel::cache::NoKernelCache;
use trace3d::scene::{
    CompiledLight, CompiledMaterial, CompiledMesh, CompiledScene, CompiledSceneObject,
    MaterialKind, Scene, SceneLight, SceneMaterial, SceneMesh,
};

fn test_config() -> RenderConfig {
    let mut config = RenderConfig::default();
    config.task_count = 8;
    config.kernel_cache = KernelCacheMode::None;
    config.sampler.sampler_type = SamplerType::Random;
    config
}

fn make_thread(scene: &Scene) -> (DeviceRenderThread, Arc<NativeDevice>) {
    let device = NativeDevice::new("cpu:lifecycle");
    let cscene = CompiledScene::compile(scene, 1 << 24).unwrap();
    let shared = RenderThreadShared {
        config: Arc::new(test_config()),
        cscene: Arc::new(RwLock::new(cscene)),
        engine_film: Arc::new(Mutex::new(Film::new(4, 4))),
        kernel_cache: Arc::new(NoKernelCache),
        set_kernel_args_mutex: Arc::new(Mutex::new(())),
        pause: Arc::new(AtomicBool::new(false)),
        intersector: Arc::new(MissEverything),
        seed_base: 131,
    };
    let thread = DeviceRenderThread::new(0, device.clone() as Arc<dyn Device>, shared);
    (thread, device)
}

fn size_of(sizes: &[(&'static str, u64)], name: &str) -> u64 {
    sizes
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, s)| *s)
        .expect("known buffer name")
}

#[test]
fn buffer_sizes_match_element_counts() {
    let mut scene = Scene::new();
    let mat = scene.add_material(SceneMaterial {
        kind: MaterialKind::Matte,
        base_color: [0.5; 3],
        emission: [0.0; 3],
        texture_index: None,
    });
    scene.add_mesh(
        SceneMesh {
            verts: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            normals: vec![[0.0, 0.0, 1.0]; 3],
            tris: vec![[0, 1, 2]],
            ..Default::default()
        },
        mat,
    );
    scene.add_light(SceneLight::environment([1.0; 3]));
    scene.add_light(SceneLight::environment([0.5; 3]));

    let (mut thread, device) = make_thread(&scene);
    thread.start().unwrap();

    let sizes = thread.buffer_sizes();
    assert_eq!(
        size_of(&sizes, "lights"),
        2 * std::mem::size_of::<CompiledLight>() as u64
    );
    assert_eq!(
        size_of(&sizes, "materials"),
        std::mem::size_of::<CompiledMaterial>() as u64
    );
    assert_eq!(
        size_of(&sizes, "mesh_descs"),
        std::mem::size_of::<CompiledMesh>() as u64
    );
    assert_eq!(
        size_of(&sizes, "scene_objs"),
        std::mem::size_of::<CompiledSceneObject>() as u64
    );
    // Vertices are padded vec4s, triangles padded uvec4s
    assert_eq!(size_of(&sizes, "verts"), 3 * 16);
    assert_eq!(size_of(&sizes, "triangles"), 16);
    assert_eq!(size_of(&sizes, "env_light_indices"), 2 * 4);

    thread.interrupt();
    thread.stop().unwrap();
    assert_eq!(device.memory().used_bytes(), 0);
}

#[test]
fn empty_subsystems_have_null_buffers() {
    // No lights, no image maps, no photon cache
    let mut scene = Scene::new();
    let mat = scene.add_material(SceneMaterial {
        kind: MaterialKind::Matte,
        base_color: [0.5; 3],
        emission: [0.0; 3],
        texture_index: None,
    });
    scene.add_mesh(
        SceneMesh {
            verts: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            normals: vec![[0.0, 0.0, 1.0]; 3],
            tris: vec![[0, 1, 2]],
            ..Default::default()
        },
        mat,
    );

    let (mut thread, _device) = make_thread(&scene);
    thread.start().unwrap();

    let sizes = thread.buffer_sizes();
    // size-in-bytes == element-size x element-count holds for zero counts
    assert_eq!(size_of(&sizes, "lights"), 0);
    assert_eq!(size_of(&sizes, "env_light_indices"), 0);
    assert_eq!(size_of(&sizes, "image_map_descs"), 0);
    assert_eq!(size_of(&sizes, "pgic_radiance_photons"), 0);
    assert_ne!(size_of(&sizes, "camera"), 0);

    thread.interrupt();
    thread.stop().unwrap();
}

#[test]
fn thread_survives_multiple_start_stop_cycles() {
    let mut scene = Scene::new();
    scene.add_material(SceneMaterial {
        kind: MaterialKind::Matte,
        base_color: [0.5; 3],
        emission: [0.0; 3],
        texture_index: None,
    });
    scene.add_light(SceneLight::environment([1.0; 3]));

    let (mut thread, device) = make_thread(&scene);
    for _ in 0..3 {
        thread.start().unwrap();
        assert!(device.memory().used_bytes() > 0);
        thread.interrupt();
        thread.stop().unwrap();
        assert_eq!(device.memory().used_bytes(), 0);
    }
}
