//! Kernel cache behavior: content-addressed keys, persistent hits across
//! "process" boundaries, known-good markers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use trace3d::config::{KernelCacheMode, RenderConfig, SamplerType};
use trace3d::device::{
    BufferRole, BufferSlot, Device, DeviceBuffer, MemoryTracker, NativeDevice, Program,
    ProgramBlob,
};
use trace3d::error::RenderResult;
use trace3d::film::Film;
use trace3d::kernel::cache::{
    cache_key, KernelCache, NoKernelCache, PersistentKernelCache, VolatileKernelCache,
};
use trace3d::kernel::params::derive_kernel_params;
use trace3d::kernel::source::assemble_kernel_source;
use trace3d::scene::{CompiledScene, MaterialKind, Scene, SceneLight, SceneMaterial};
use trace3d::RenderEngine;

fn cpu(name: &str) -> Arc<dyn Device> {
    NativeDevice::new(name)
}

fn test_scene() -> Scene {
    let mut scene = Scene::new();
    scene.add_material(SceneMaterial {
        kind: MaterialKind::Matte,
        base_color: [0.8; 3],
        emission: [0.0; 3],
        texture_index: None,
    });
    scene.add_light(SceneLight::environment([1.0; 3]));
    scene.take_edit_actions();
    scene
}

/// Wraps a native device and counts compiler invocations.
struct CountingDevice {
    inner: Arc<NativeDevice>,
    compiles: AtomicUsize,
}

impl CountingDevice {
    fn new() -> Arc<Self> {
        Arc::new(CountingDevice {
            inner: NativeDevice::new("cpu:counting"),
            compiles: AtomicUsize::new(0),
        })
    }

    fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::Relaxed)
    }
}

impl Device for CountingDevice {
    fn name(&self) -> &str {
        self.inner.name()
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
    fn compile_program(&self, params: &str, source: &str) -> RenderResult<ProgramBlob> {
        self.compiles.fetch_add(1, Ordering::Relaxed);
        self.inner.compile_program(params, source)
    }
    fn load_program(&self, blob: &ProgramBlob) -> RenderResult<Box<dyn Program>> {
        self.inner.load_program(blob)
    }
    fn enqueue_read_buffer(
        &self,
        buf: &DeviceBuffer,
        blocking: bool,
        dst: &mut [u8],
    ) -> RenderResult<()> {
        self.inner.enqueue_read_buffer(buf, blocking, dst)
    }
    fn enqueue_write_buffer(
        &self,
        buf: &DeviceBuffer,
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
fn cache_key_is_deterministic_for_an_unchanged_scene() {
    let scene = test_scene();
    let cscene = CompiledScene::compile(&scene, 1 << 20).unwrap();
    let film = Film::new(8, 8);
    let config = RenderConfig::default();

    let key = |cscene: &CompiledScene| {
        let params = derive_kernel_params(&config, cscene, &film).unwrap();
        let source = assemble_kernel_source(&params, cscene, config.sampler.sampler_type);
        cache_key(&params, &source)
    };
    assert_eq!(key(&cscene), key(&cscene));
}

#[test]
fn persistent_cache_hits_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    let device = CountingDevice::new();
    let params = " -D PARAM_MAX_PATH_DEPTH=4";
    let source = "fn main() {}";

    {
        let cache =
            PersistentKernelCache::new("test-suite", Some(dir.path().to_path_buf())).unwrap();
        let first = cache.compile(device.as_ref(), params, source).unwrap();
        assert!(!first.cached);
        assert_eq!(device.compile_count(), 1);
    }

    // A fresh cache instance over the same directory simulates a new
    // process: the compiler must not run again.
    {
        let cache =
            PersistentKernelCache::new("test-suite", Some(dir.path().to_path_buf())).unwrap();
        let second = cache.compile(device.as_ref(), params, source).unwrap();
        assert!(second.cached);
        assert_eq!(device.compile_count(), 1);
    }
}

#[test]
fn volatile_cache_hits_within_the_process() {
    let device = CountingDevice::new();
    let cache = VolatileKernelCache::new();
    let a = cache.compile(device.as_ref(), "-D A", "src").unwrap();
    let b = cache.compile(device.as_ref(), "-D A", "src").unwrap();
    assert!(!a.cached);
    assert!(b.cached);
    assert_eq!(device.compile_count(), 1);

    let c = cache.compile(device.as_ref(), "-D B", "src").unwrap();
    assert!(!c.cached);
    assert_eq!(device.compile_count(), 2);
}

#[test]
fn no_cache_always_compiles() {
    let device = CountingDevice::new();
    let cache = NoKernelCache;
    cache.compile(device.as_ref(), "-D A", "src").unwrap();
    cache.compile(device.as_ref(), "-D A", "src").unwrap();
    assert_eq!(device.compile_count(), 2);
}

#[test]
fn second_engine_start_uses_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = RenderConfig::default();
    config.task_count = 16;
    config.kernel_cache = KernelCacheMode::Persistent;
    config.kernel_cache_dir = Some(dir.path().to_path_buf());
    config.sampler.sampler_type = SamplerType::Random;
    config.halt_spp = 1;

    let run = |config: RenderConfig| -> usize {
        let device = CountingDevice::new();
        let mut engine = RenderEngine::new(
            config,
            test_scene(),
            Film::new(4, 4),
            vec![device.clone() as Arc<dyn Device>],
            0,
        )
        .unwrap();
        engine.start().unwrap();
        engine.wait_for_done();
        engine.stop().unwrap();
        device.compile_count()
    };

    // First run compiles, the identical second run is served from disk
    assert_eq!(run(config.clone()), 1);
    assert_eq!(run(config), 0);
}

#[test]
fn known_good_marker_is_written_after_start() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = RenderConfig::default();
    config.task_count = 16;
    config.kernel_cache = KernelCacheMode::Persistent;
    config.kernel_cache_dir = Some(dir.path().to_path_buf());
    config.sampler.sampler_type = SamplerType::Random;

    let mut engine = RenderEngine::new(
        config.clone(),
        test_scene(),
        Film::new(4, 4),
        vec![cpu("cpu:0")],
        0,
    )
    .unwrap();
    engine.start().unwrap();
    let hash = engine.device_threads()[0].kernel_src_hash();
    engine.stop().unwrap();

    let cache = PersistentKernelCache::new(
        concat!("trace3d-", env!("CARGO_PKG_VERSION")),
        Some(dir.path().to_path_buf()),
    )
    .unwrap();
    assert_eq!(cache.read_known_good_marker(), vec![hash]);
}
