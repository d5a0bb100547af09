//! Cross-thread film merge semantics.

use std::sync::Arc;

use trace3d::config::{KernelCacheMode, RenderConfig, SamplerType};
use trace3d::device::{Device, NativeDevice};
use trace3d::film::{Film, RadianceChannelScale};
use trace3d::scene::{MaterialKind, Scene, SceneLight, SceneMaterial};
use trace3d::RenderEngine;

fn cpu(name: &str) -> Arc<dyn Device> {
    NativeDevice::new(name)
}

fn test_scene(emission: f32) -> Scene {
    let mut scene = Scene::new();
    scene.add_material(SceneMaterial {
        kind: MaterialKind::Matte,
        base_color: [0.8; 3],
        emission: [0.0; 3],
        texture_index: None,
    });
    scene.add_light(SceneLight::environment([emission; 3]));
    scene.take_edit_actions();
    scene
}

fn test_config() -> RenderConfig {
    let mut config = RenderConfig::default();
    config.task_count = 16;
    config.kernel_cache = KernelCacheMode::None;
    config.sampler.sampler_type = SamplerType::Random;
    config
}

/// Two device threads, one radiance group, per-pixel normalization only:
/// a pixel receiving uniform radiance 1.0 at scale 1.0 accumulates weight
/// equal to its sample count and normalizes to exactly 1.0.
#[test]
fn uniform_radiance_merges_to_unit_value() {
    let mut config = test_config();
    config.halt_spp = 4;
    let mut engine = RenderEngine::new(
        config,
        test_scene(1.0),
        Film::new(4, 4),
        vec![cpu("cpu:0"), cpu("cpu:1")],
        0,
    )
    .unwrap();

    engine.start().unwrap();
    engine.wait_for_done();
    engine.update_film().unwrap();

    let film = engine.film();
    let film = film.lock().unwrap();
    let plane = &film.radiance_per_pixel_normalized[0];
    let total_weight: f32 = (0..film.pixel_count() as usize)
        .map(|i| plane[i * 4 + 3])
        .sum();
    assert!(
        (total_weight as f64 - film.total_sample_count()).abs() < 1e-6,
        "sum of weights {} != sample count {}",
        total_weight,
        film.total_sample_count()
    );

    for i in 0..film.pixel_count() as usize {
        let weight = plane[i * 4 + 3];
        assert!(weight > 0.0, "pixel {i} received no samples");
        let value = plane[i * 4] / weight;
        assert!((value - 1.0).abs() < 1e-5, "pixel {i} merged to {value}");
        let merged = film.image_pipeline_planes[0][i * 3];
        assert!((merged - 1.0).abs() < 1e-5);
    }

    drop(film);
    engine.stop().unwrap();
}

/// Merging thread films A then B equals merging B then A.
#[test]
fn thread_film_merge_is_commutative() {
    let make_film = |seed: f32| {
        let mut film = Film::new(2, 2);
        film.init();
        let plane = &mut film.radiance_per_pixel_normalized[0];
        for i in 0..4 {
            plane[i * 4] = seed * (i + 1) as f32;
            plane[i * 4 + 3] = seed;
        }
        film.add_sample_counts(seed as f64, 0.0);
        film
    };

    let a = make_film(1.0);
    let b = make_film(3.0);

    let mut ab = Film::new(2, 2);
    ab.init();
    ab.add_film(&a).unwrap();
    ab.add_film(&b).unwrap();
    ab.merge_sample_buffers(0).unwrap();

    let mut ba = Film::new(2, 2);
    ba.init();
    ba.add_film(&b).unwrap();
    ba.add_film(&a).unwrap();
    ba.merge_sample_buffers(0).unwrap();

    for (x, y) in ab.image_pipeline_planes[0]
        .iter()
        .zip(ba.image_pipeline_planes[0].iter())
    {
        assert!((x - y).abs() < 1e-6);
    }
    assert_eq!(ab.total_sample_count(), ba.total_sample_count());
}

/// Interactive exposure change: re-merge with a new scale, no re-render.
#[test]
fn exposure_change_requires_only_a_re_merge() {
    let mut config = test_config();
    config.halt_spp = 2;
    let mut engine = RenderEngine::new(
        config,
        test_scene(1.0),
        Film::new(4, 4),
        vec![cpu("cpu:0")],
        0,
    )
    .unwrap();

    engine.start().unwrap();
    engine.wait_for_done();
    engine.update_film().unwrap();

    let film = engine.film();
    {
        let film = film.lock().unwrap();
        assert!((film.image_pipeline_planes[0][0] - 1.0).abs() < 1e-5);
    }

    {
        let mut film = film.lock().unwrap();
        film.image_pipelines_mut()[0].radiance_channel_scales[0] =
            RadianceChannelScale::uniform(2.0);
        film.merge_sample_buffers(0).unwrap();
        assert!((film.image_pipeline_planes[0][0] - 2.0).abs() < 1e-5);
    }

    engine.stop().unwrap();
}

/// Native (CPU) threads fold into the same film as device threads.
#[test]
fn native_and_device_threads_merge_together() {
    let mut config = test_config();
    config.halt_spp = 2;
    let mut engine = RenderEngine::new(
        config,
        test_scene(1.0),
        Film::new(4, 4),
        vec![cpu("cpu:0")],
        1,
    )
    .unwrap();

    engine.start().unwrap();
    engine.wait_for_done();
    engine.update_film().unwrap();

    let film = engine.film();
    let film = film.lock().unwrap();
    // Both populations contribute weight; the normalized value stays 1.0
    for i in 0..film.pixel_count() as usize {
        let plane = &film.radiance_per_pixel_normalized[0];
        let weight = plane[i * 4 + 3];
        if weight > 0.0 {
            assert!((plane[i * 4] / weight - 1.0).abs() < 1e-5);
        }
    }

    drop(film);
    engine.stop().unwrap();
}
