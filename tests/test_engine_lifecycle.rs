//! Engine start/stop/edit lifecycle against the native device.

use std::sync::Arc;
use std::time::Duration;

use trace3d::config::{KernelCacheMode, RenderConfig, SamplerType};
use trace3d::device::{
    BufferRole, BufferSlot, Device, MemoryTracker, NativeDevice, Program, ProgramBlob,
};
use trace3d::error::{RenderError, RenderResult};
use trace3d::film::Film;
use trace3d::scene::{MaterialKind, Scene, SceneLight, SceneMaterial, SceneMesh};
use trace3d::{EngineState, RenderEngine};

fn cpu(name: &str) -> Arc<dyn Device> {
    NativeDevice::new(name)
}

fn test_scene() -> Scene {
    let mut scene = Scene::new();
    let mat = scene.add_material(SceneMaterial {
        kind: MaterialKind::Matte,
        base_color: [0.8; 3],
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
    scene.add_light(SceneLight::environment([1.0, 1.0, 1.0]));
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

#[test]
fn start_render_and_stop() {
    let device = NativeDevice::new("cpu:0");
    let mut engine = RenderEngine::new(
        test_config(),
        test_scene(),
        Film::new(4, 4),
        vec![device.clone() as Arc<dyn Device>],
        0,
    )
    .unwrap();

    engine.start().unwrap();
    assert_eq!(engine.state(), EngineState::Started);
    std::thread::sleep(Duration::from_millis(100));

    engine.update_film().unwrap();
    engine.stop().unwrap();
    assert_eq!(engine.state(), EngineState::Stopped);

    // Every device allocation is released on stop
    assert_eq!(device.memory().used_bytes(), 0);

    // The film stays readable after stop, with accumulated samples
    let film = engine.film();
    let film = film.lock().unwrap();
    assert!(film.total_sample_count() > 0.0);
    let plane = &film.radiance_per_pixel_normalized[0];
    assert!(plane[3] > 0.0, "pixel 0 accumulated no weight");
}

#[test]
fn quiescence_on_edit() {
    let mut engine = RenderEngine::new(
        test_config(),
        test_scene(),
        Film::new(4, 4),
        vec![cpu("cpu:0"), cpu("cpu:1")],
        1,
    )
    .unwrap();

    engine.start().unwrap();
    std::thread::sleep(Duration::from_millis(50));

    engine.begin_scene_edit().unwrap();
    // No launch may be in flight once begin_scene_edit returns
    assert!(engine.has_done());
    assert_eq!(engine.state(), EngineState::EditSuspended);

    engine
        .end_scene_edit(trace3d::EditActionList::new())
        .unwrap();
    assert_eq!(engine.state(), EngineState::Started);

    engine.stop().unwrap();
}

#[test]
fn halt_spp_finishes_the_render() {
    let mut config = test_config();
    config.halt_spp = 2;
    let mut engine = RenderEngine::new(
        config,
        test_scene(),
        Film::new(4, 4),
        vec![cpu("cpu:0")],
        0,
    )
    .unwrap();

    engine.start().unwrap();
    engine.wait_for_done();
    assert!(engine.has_done());
    engine.stop().unwrap();
}

#[test]
fn pause_idles_the_loops() {
    let mut engine = RenderEngine::new(
        test_config(),
        test_scene(),
        Film::new(4, 4),
        vec![cpu("cpu:0")],
        0,
    )
    .unwrap();

    engine.start().unwrap();
    engine.pause();
    assert!(engine.is_paused());
    std::thread::sleep(Duration::from_millis(50));
    engine.resume();
    assert!(!engine.is_paused());
    engine.stop().unwrap();
}

/// A device whose compiler always fails, for start-rollback coverage.
struct BrokenCompilerDevice {
    inner: Arc<NativeDevice>,
}

impl Device for BrokenCompilerDevice {
    fn name(&self) -> &str {
        "broken-compiler"
    }
    fn memory(&self) -> &MemoryTracker {
        self.inner.memory()
    }
    fn max_memory_alloc_size(&self) -> u64 {
        self.inner.max_memory_alloc_size()
    }
    fn push_current(&self) {}
    fn pop_current(&self) {}
    fn alloc_buffer_ro(
        &self,
        slot: &mut BufferSlot,
        src: &[u8],
        role: BufferRole,
    ) -> RenderResult<()> {
        self.inner.alloc_buffer_ro(slot, src, role)
    }
    fn alloc_buffer_rw(
        &self,
        slot: &mut BufferSlot,
        size: u64,
        role: BufferRole,
    ) -> RenderResult<()> {
        self.inner.alloc_buffer_rw(slot, size, role)
    }
    fn free_buffer(&self, slot: &mut BufferSlot) {
        self.inner.free_buffer(slot)
    }
    fn compile_program(&self, _params: &str, _source: &str) -> RenderResult<ProgramBlob> {
        Err(RenderError::kernel_compile("deliberately broken compiler"))
    }
    fn load_program(&self, blob: &ProgramBlob) -> RenderResult<Box<dyn Program>> {
        self.inner.load_program(blob)
    }
    fn enqueue_read_buffer(
        &self,
        buf: &trace3d::device::DeviceBuffer,
        blocking: bool,
        dst: &mut [u8],
    ) -> RenderResult<()> {
        self.inner.enqueue_read_buffer(buf, blocking, dst)
    }
    fn enqueue_write_buffer(
        &self,
        buf: &trace3d::device::DeviceBuffer,
        blocking: bool,
        src: &[u8],
    ) -> RenderResult<()> {
        self.inner.enqueue_write_buffer(buf, blocking, src)
    }
    fn finish(&self) -> RenderResult<()> {
        self.inner.finish()
    }
}

#[test]
fn failed_start_leaves_no_partial_render_state() {
    let good = NativeDevice::new("cpu:0");
    let broken = Arc::new(BrokenCompilerDevice {
        inner: NativeDevice::new("cpu:broken"),
    });

    let mut engine = RenderEngine::new(
        test_config(),
        test_scene(),
        Film::new(4, 4),
        vec![good.clone() as Arc<dyn Device>, broken],
        0,
    )
    .unwrap();

    let err = engine.start().unwrap_err();
    assert!(matches!(err, RenderError::KernelCompile(_)));
    assert_eq!(engine.state(), EngineState::Stopped);

    // The thread that did start was interrupted, stopped and freed
    assert_eq!(good.memory().used_bytes(), 0);
}

#[test]
fn engine_needs_at_least_one_thread() {
    let err = RenderEngine::new(test_config(), test_scene(), Film::new(4, 4), Vec::new(), 0)
        .unwrap_err();
    assert!(matches!(err, RenderError::Config(_)));
}
