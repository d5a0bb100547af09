//! Render engine orchestration
//!
//! The engine owns the thread pool, the compiled scene and the single
//! authoritative film. All scene mutation happens inside the
//! begin/end-scene-edit bracket, during which every render thread is
//! quiesced (stopped, not merely paused); that is the invariant that makes
//! concurrent editing safe without per-field locking.

pub mod tasks;
mod thread;

pub use thread::{DeviceRenderThread, NativeRenderThread, RenderThreadShared, SceneBuffers};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::config::{KernelCacheMode, RenderConfig};
use crate::device::{Device, Intersector, MissEverything};
use crate::error::{RenderError, RenderResult};
use crate::film::Film;
use crate::kernel::cache::{
    KernelCache, NoKernelCache, PersistentKernelCache, VolatileKernelCache,
};
use crate::scene::{CompiledScene, EditActionList, Scene};

/// Cache namespace, versioned so incompatible kernels never collide.
const KERNEL_CACHE_APP_NAME: &str = concat!("trace3d-", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Started,
    EditSuspended,
    Stopped,
}

pub struct RenderEngine {
    config: Arc<RenderConfig>,
    scene: Scene,
    devices: Vec<Arc<dyn Device>>,
    native_thread_count: u32,
    film: Arc<Mutex<Film>>,
    cscene: Option<Arc<RwLock<CompiledScene>>>,
    device_threads: Vec<DeviceRenderThread>,
    native_threads: Vec<NativeRenderThread>,
    kernel_cache: Arc<dyn KernelCache>,
    persistent_cache: Option<Arc<PersistentKernelCache>>,
    set_kernel_args_mutex: Arc<Mutex<()>>,
    pause: Arc<AtomicBool>,
    intersector: Arc<dyn Intersector>,
    state: EngineState,
    seed_base: u32,
    has_start_film: bool,
}

impl std::fmt::Debug for RenderEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderEngine")
            .field("native_thread_count", &self.native_thread_count)
            .field("device_count", &self.devices.len())
            .field("state", &self.state)
            .field("seed_base", &self.seed_base)
            .field("has_start_film", &self.has_start_film)
            .finish_non_exhaustive()
    }
}

impl RenderEngine {
    pub fn new(
        config: RenderConfig,
        scene: Scene,
        film: Film,
        devices: Vec<Arc<dyn Device>>,
        native_thread_count: u32,
    ) -> RenderResult<Self> {
        if devices.is_empty() && native_thread_count == 0 {
            return Err(RenderError::config(
                "a render engine needs at least one device or native thread",
            ));
        }

        let mut persistent_cache = None;
        let kernel_cache: Arc<dyn KernelCache> = match config.kernel_cache {
            KernelCacheMode::Persistent => {
                let cache = Arc::new(PersistentKernelCache::new(
                    KERNEL_CACHE_APP_NAME,
                    config.kernel_cache_dir.clone(),
                )?);
                persistent_cache = Some(cache.clone());
                cache
            }
            KernelCacheMode::Volatile => Arc::new(VolatileKernelCache::new()),
            KernelCacheMode::None => Arc::new(NoKernelCache),
        };

        let seed_base = (config.seed % u32::MAX as u64) as u32;

        Ok(RenderEngine {
            config: Arc::new(config),
            scene,
            devices,
            native_thread_count,
            film: Arc::new(Mutex::new(film)),
            cscene: None,
            device_threads: Vec::new(),
            native_threads: Vec::new(),
            kernel_cache,
            persistent_cache,
            set_kernel_args_mutex: Arc::new(Mutex::new(())),
            pause: Arc::new(AtomicBool::new(false)),
            intersector: Arc::new(MissEverything),
            state: EngineState::Idle,
            seed_base,
            has_start_film: false,
        })
    }

    /// Replace the default miss-everything intersection collaborator.
    /// Only meaningful before `start`.
    pub fn set_intersector(&mut self, intersector: Arc<dyn Intersector>) {
        self.intersector = intersector;
    }

    /// Resume accumulation from the film's current content.
    pub fn set_start_film(&mut self, enabled: bool) {
        self.has_start_film = enabled;
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn film(&self) -> Arc<Mutex<Film>> {
        self.film.clone()
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    /// Mutable scene access; only sound inside the scene-edit bracket or
    /// before the engine is started.
    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    pub fn device_threads(&self) -> &[DeviceRenderThread] {
        &self.device_threads
    }

    //--------------------------------------------------------------------------
    // Start / stop
    //--------------------------------------------------------------------------

    pub fn start(&mut self) -> RenderResult<()> {
        match self.state {
            EngineState::Idle | EngineState::Stopped => {}
            _ => return Err(RenderError::config("engine is already started")),
        }
        self.start_lockless()
    }

    fn start_lockless(&mut self) -> RenderResult<()> {
        // Largest single allocation across the device pool bounds the
        // image-map page size
        let max_mem_page_size = self.config.max_mem_page_size.unwrap_or_else(|| {
            self.devices
                .iter()
                .map(|d| d.max_memory_alloc_size())
                .min()
                .unwrap_or(512 * 1024 * 1024)
        });
        log::info!("Max. memory page size: {} Kbytes", max_mem_page_size / 1024);

        // Compile the scene once for the whole pool
        let cscene = CompiledScene::compile(&self.scene, max_mem_page_size)?;
        let cscene = Arc::new(RwLock::new(cscene));
        self.cscene = Some(cscene.clone());

        let shared = RenderThreadShared {
            config: self.config.clone(),
            cscene,
            engine_film: self.film.clone(),
            kernel_cache: self.kernel_cache.clone(),
            set_kernel_args_mutex: self.set_kernel_args_mutex.clone(),
            pause: self.pause.clone(),
            intersector: self.intersector.clone(),
            seed_base: self.seed_base,
        };

        // Device threads first, in device order, then native threads
        log::info!(
            "Starting {} device and {} native render threads",
            self.devices.len(),
            self.native_thread_count
        );
        self.device_threads = self
            .devices
            .iter()
            .enumerate()
            .map(|(i, device)| DeviceRenderThread::new(i as u32, device.clone(), shared.clone()))
            .collect();
        if self.has_start_film {
            if let Some(first) = self.device_threads.first_mut() {
                first.set_start_film(true);
            }
        }
        self.native_threads = (0..self.native_thread_count)
            .map(|i| NativeRenderThread::new(i, shared.clone()))
            .collect();

        for i in 0..self.device_threads.len() {
            if let Err(err) = self.device_threads[i].start() {
                // No partial render state may be left running
                for thread in &self.device_threads[..i] {
                    thread.interrupt();
                }
                for thread in &mut self.device_threads[..i] {
                    let _ = thread.stop();
                }
                self.device_threads.clear();
                self.native_threads.clear();
                self.cscene = None;
                self.state = EngineState::Stopped;
                return Err(err);
            }
        }
        for thread in &mut self.native_threads {
            thread.start()?;
        }

        // Only after every device thread compiled is the kernel combination
        // marked as known good
        if let Some(cache) = &self.persistent_cache {
            let keys: Vec<String> = self
                .device_threads
                .iter()
                .map(|t| t.kernel_src_hash())
                .collect();
            if let Err(err) = cache.write_known_good_marker(&keys) {
                log::warn!("Unable to write the kernel cache marker: {err}");
            }
        }

        self.state = EngineState::Started;
        Ok(())
    }

    pub fn stop(&mut self) -> RenderResult<()> {
        match self.state {
            EngineState::Started | EngineState::EditSuspended => {}
            _ => return Err(RenderError::config("engine is not started")),
        }
        self.stop_lockless()
    }

    fn stop_lockless(&mut self) -> RenderResult<()> {
        // Fully drain one population's interrupts before issuing any stop,
        // so no thread blocks on a queue a sibling is still using
        for thread in &self.device_threads {
            thread.interrupt();
        }
        for thread in &self.native_threads {
            thread.interrupt();
        }

        let mut first_error = None;
        for thread in &mut self.native_threads {
            if let Err(err) = thread.stop() {
                first_error.get_or_insert(err);
            }
        }
        for thread in &mut self.device_threads {
            if let Err(err) = thread.stop() {
                first_error.get_or_insert(err);
            }
        }

        // Final fold of the host film mirrors
        self.merge_host_films()?;

        self.cscene = None;
        self.state = EngineState::Stopped;

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    //--------------------------------------------------------------------------
    // Scene edits
    //--------------------------------------------------------------------------

    /// Quiesce every render thread ahead of scene mutation.
    ///
    /// After this returns, no thread has a launch in flight.
    pub fn begin_scene_edit(&mut self) -> RenderResult<()> {
        if self.state != EngineState::Started {
            return Err(RenderError::config("engine is not started"));
        }
        self.begin_scene_edit_lockless();
        Ok(())
    }

    fn begin_scene_edit_lockless(&mut self) {
        for thread in &self.device_threads {
            thread.interrupt();
        }
        for thread in &self.native_threads {
            thread.interrupt();
        }
        for thread in &mut self.device_threads {
            thread.begin_scene_edit();
        }
        for thread in &mut self.native_threads {
            thread.begin_scene_edit();
        }
        self.state = EngineState::EditSuspended;
    }

    /// Recompile the scene once at the engine level, then let every thread
    /// independently refresh exactly what the actions made dirty.
    pub fn end_scene_edit(&mut self, edit_actions: EditActionList) -> RenderResult<()> {
        if self.state != EngineState::EditSuspended {
            return Err(RenderError::config("engine is not inside a scene edit"));
        }
        self.end_scene_edit_lockless(edit_actions)
    }

    fn end_scene_edit_lockless(&mut self, edit_actions: EditActionList) -> RenderResult<()> {
        {
            let cscene = self.cscene.as_ref().expect("compiled scene present");
            let mut cscene = cscene.write().unwrap();
            cscene.recompile(&self.scene, &edit_actions)?;
        }

        for thread in &mut self.device_threads {
            thread.end_scene_edit(&edit_actions)?;
        }
        for thread in &mut self.native_threads {
            thread.end_scene_edit(&edit_actions)?;
        }

        self.state = EngineState::Started;
        Ok(())
    }

    //--------------------------------------------------------------------------
    // Film
    //--------------------------------------------------------------------------

    /// Fold every thread film into the authoritative film and run the
    /// two-phase merge.
    ///
    /// Readers of the film observe a snapshot consistent up to the last
    /// completed merge; this core adds no further synchronization.
    pub fn update_film(&mut self) -> RenderResult<()> {
        if self.state != EngineState::Started {
            return Err(RenderError::config("engine is not started"));
        }

        {
            let mut film = self.film.lock().unwrap();
            film.clear();
        }
        for thread in &self.device_threads {
            thread.transfer_and_merge()?;
        }
        {
            let mut film = self.film.lock().unwrap();
            for thread in &self.native_threads {
                thread.merge_into(&mut film)?;
            }

            if film.has_channel(crate::film::FilmChannel::ImagePipeline) {
                let previous = film.image_pipeline_planes.first().cloned().unwrap_or_default();
                film.merge_sample_buffers(0)?;
                film.update_noise_estimate(&previous);
                film.update_convergence_estimate(1e-3);
            }
        }
        Ok(())
    }

    fn merge_host_films(&mut self) -> RenderResult<()> {
        let mut film = self.film.lock().unwrap();
        film.clear();
        for thread in &self.device_threads {
            thread.merge_host_film(&mut film)?;
        }
        for thread in &self.native_threads {
            thread.merge_into(&mut film)?;
        }
        if film.has_channel(crate::film::FilmChannel::ImagePipeline) {
            film.merge_sample_buffers(0)?;
        }
        Ok(())
    }

    //--------------------------------------------------------------------------
    // Pause / completion
    //--------------------------------------------------------------------------

    /// Idle every render loop without stopping it.
    pub fn pause(&self) {
        self.pause.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.pause.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.pause.load(Ordering::Acquire)
    }

    /// True when every render loop has exited.
    pub fn has_done(&self) -> bool {
        self.device_threads.iter().all(|t| t.has_done())
            && self.native_threads.iter().all(|t| t.has_done())
    }

    pub fn wait_for_done(&mut self) {
        for thread in &mut self.device_threads {
            thread.wait_for_done();
        }
        for thread in &mut self.native_threads {
            thread.wait_for_done();
        }
    }
}

impl Drop for RenderEngine {
    fn drop(&mut self) {
        if self.state == EngineState::EditSuspended {
            let _ = self.end_scene_edit(EditActionList::new());
        }
        if self.state == EngineState::Started {
            let _ = self.stop();
        }
    }
}
