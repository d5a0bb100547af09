//! Render threads
//!
//! A render thread autonomously advances a batch of path tasks, committing
//! samples into its private thread film. Two variants exist: the device
//! thread drives a compute device through the micro-kernel pipeline, the
//! native thread traces on its CPU core directly. Both are interruptible
//! between iterations and resumable without losing committed samples.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::RenderConfig;
use crate::device::{BufferRole, BufferSlot, Device, Intersector, KernelArg};
use crate::engine::tasks::{
    self, build_filter_distribution, GpuTaskConfiguration, GpuTaskStats,
};
use crate::error::{RenderError, RenderResult};
use crate::film::{Film, FilmChannel, ThreadFilm};
use crate::kernel::cache::{cache_key, KernelCache};
use crate::kernel::params::derive_kernel_params;
use crate::kernel::source::assemble_kernel_source;
use crate::kernel::{arg_index, KernelSet};
use crate::scene::{CompiledScene, EditActionList, MAX_IMAGE_MAP_PAGES};

/// The film refresh time target for the device loop.
const TARGET_ITERATION_SECS: f64 = 0.2;
const MAX_ITERATIONS_PER_PASS: u32 = 512;
const PAUSE_POLL: Duration = Duration::from_millis(100);

/// Engine-owned state shared by every render thread.
#[derive(Clone)]
pub struct RenderThreadShared {
    pub config: Arc<RenderConfig>,
    pub cscene: Arc<RwLock<CompiledScene>>,
    pub engine_film: Arc<Mutex<Film>>,
    pub kernel_cache: Arc<dyn KernelCache>,
    /// Kernel argument binding is the one shared, serialized operation
    /// across threads on a driver context.
    pub set_kernel_args_mutex: Arc<Mutex<()>>,
    pub pause: Arc<AtomicBool>,
    pub intersector: Arc<dyn Intersector>,
    pub seed_base: u32,
}

//------------------------------------------------------------------------------
// Device thread buffers
//------------------------------------------------------------------------------

/// One slot per scene/task buffer role a device thread owns.
#[derive(Default)]
pub struct SceneBuffers {
    // Scene subsystems
    pub camera: BufferSlot,
    pub verts: BufferSlot,
    pub normals: BufferSlot,
    pub tri_normals: BufferSlot,
    pub uvs: BufferSlot,
    pub cols: BufferSlot,
    pub alphas: BufferSlot,
    pub triangles: BufferSlot,
    pub mesh_descs: BufferSlot,
    pub scene_objs: BufferSlot,
    pub materials: BufferSlot,
    pub textures: BufferSlot,
    pub lights: BufferSlot,
    pub env_light_indices: BufferSlot,
    pub light_index_offset_by_mesh: BufferSlot,
    pub light_index_by_tri: BufferSlot,
    pub lights_distribution: BufferSlot,
    pub infinite_light_distribution: BufferSlot,
    pub env_light_distributions: BufferSlot,
    pub image_map_descs: BufferSlot,
    pub image_map_pages: Vec<BufferSlot>,
    pub pgic_radiance_photons: BufferSlot,
    pub pgic_caustic_photons: BufferSlot,
    // Task working set
    pub task_config: BufferSlot,
    pub tasks: BufferSlot,
    pub tasks_direct_light: BufferSlot,
    pub tasks_state: BufferSlot,
    pub task_stats: BufferSlot,
    pub sampler_shared: BufferSlot,
    pub samples: BufferSlot,
    pub sample_data: BufferSlot,
    pub sample_results: BufferSlot,
    pub eye_path_infos: BufferSlot,
    pub direct_light_vol_infos: BufferSlot,
    pub pixel_filter: BufferSlot,
    pub rays: BufferSlot,
    pub hits: BufferSlot,
}

impl SceneBuffers {
    fn free_all(&mut self, device: &dyn Device) {
        for slot in self.all_slots_mut() {
            device.free_buffer(slot);
        }
        self.image_map_pages.clear();
    }

    fn all_slots_mut(&mut self) -> Vec<&mut BufferSlot> {
        let mut slots = vec![
            &mut self.camera,
            &mut self.verts,
            &mut self.normals,
            &mut self.tri_normals,
            &mut self.uvs,
            &mut self.cols,
            &mut self.alphas,
            &mut self.triangles,
            &mut self.mesh_descs,
            &mut self.scene_objs,
            &mut self.materials,
            &mut self.textures,
            &mut self.lights,
            &mut self.env_light_indices,
            &mut self.light_index_offset_by_mesh,
            &mut self.light_index_by_tri,
            &mut self.lights_distribution,
            &mut self.infinite_light_distribution,
            &mut self.env_light_distributions,
            &mut self.image_map_descs,
            &mut self.pgic_radiance_photons,
            &mut self.pgic_caustic_photons,
            &mut self.task_config,
            &mut self.tasks,
            &mut self.tasks_direct_light,
            &mut self.tasks_state,
            &mut self.task_stats,
            &mut self.sampler_shared,
            &mut self.samples,
            &mut self.sample_data,
            &mut self.sample_results,
            &mut self.eye_path_infos,
            &mut self.direct_light_vol_infos,
            &mut self.pixel_filter,
            &mut self.rays,
            &mut self.hits,
        ];
        slots.extend(self.image_map_pages.iter_mut());
        slots
    }

    /// Byte-size snapshot of the scene-subsystem buffers.
    pub fn subsystem_sizes(&self) -> Vec<(&'static str, u64)> {
        self.subsystem_ids()
            .into_iter()
            .map(|(name, _)| name)
            .zip(
                [
                    self.camera.size(),
                    self.verts.size(),
                    self.normals.size(),
                    self.triangles.size(),
                    self.mesh_descs.size(),
                    self.scene_objs.size(),
                    self.materials.size(),
                    self.textures.size(),
                    self.lights.size(),
                    self.env_light_indices.size(),
                    self.image_map_descs.size(),
                    self.pgic_radiance_photons.size(),
                ]
                .into_iter(),
            )
            .collect()
    }

    /// Identity snapshot of the scene-subsystem buffers, for reallocation
    /// checks.
    pub fn subsystem_ids(&self) -> Vec<(&'static str, Option<u64>)> {
        vec![
            ("camera", self.camera.id()),
            ("verts", self.verts.id()),
            ("normals", self.normals.id()),
            ("triangles", self.triangles.id()),
            ("mesh_descs", self.mesh_descs.id()),
            ("scene_objs", self.scene_objs.id()),
            ("materials", self.materials.id()),
            ("textures", self.textures.id()),
            ("lights", self.lights.id()),
            ("env_light_indices", self.env_light_indices.id()),
            ("image_map_descs", self.image_map_descs.id()),
            ("pgic_radiance_photons", self.pgic_radiance_photons.id()),
        ]
    }
}

fn alloc_ro_or_free(
    device: &dyn Device,
    slot: &mut BufferSlot,
    bytes: &[u8],
    role: BufferRole,
) -> RenderResult<()> {
    if bytes.is_empty() {
        device.free_buffer(slot);
        Ok(())
    } else {
        device.alloc_buffer_ro(slot, bytes, role)
    }
}

//------------------------------------------------------------------------------
// Device render thread
//------------------------------------------------------------------------------

struct ThreadState {
    buffers: SceneBuffers,
    kernels: Option<KernelSet>,
    kernel_src_hash: String,
    thread_film: ThreadFilm,
    last_error: Option<RenderError>,
}

/// A render thread driving one compute device.
pub struct DeviceRenderThread {
    index: u32,
    device: Arc<dyn Device>,
    shared: RenderThreadShared,
    state: Arc<Mutex<ThreadState>>,
    interrupt: Arc<AtomicBool>,
    thread_done: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
    started: bool,
    edit_mode: bool,
    has_start_film: bool,
}

impl DeviceRenderThread {
    pub fn new(index: u32, device: Arc<dyn Device>, shared: RenderThreadShared) -> Self {
        let thread_film = ThreadFilm::new(device.clone());
        DeviceRenderThread {
            index,
            device,
            shared,
            state: Arc::new(Mutex::new(ThreadState {
                buffers: SceneBuffers::default(),
                kernels: None,
                kernel_src_hash: String::new(),
                thread_film,
                last_error: None,
            })),
            interrupt: Arc::new(AtomicBool::new(false)),
            thread_done: Arc::new(AtomicBool::new(false)),
            join: None,
            started: false,
            edit_mode: false,
            has_start_film: false,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    /// Seed the thread film from previously accumulated engine content
    /// before the first iteration (resume-render path; thread 0 only).
    pub fn set_start_film(&mut self, enabled: bool) {
        self.has_start_film = enabled;
    }

    /// Allocate every buffer, compile or fetch kernels, bind arguments and
    /// launch the render loop. Compile and allocation failures are fatal
    /// and propagate.
    pub fn start(&mut self) -> RenderResult<()> {
        self.started = true;
        self.init_render()?;
        self.start_render_thread();
        Ok(())
    }

    /// Request cooperative cancellation; does not block.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::Release);
    }

    /// Block until the loop exits, read the thread film back and free all
    /// device buffers. The film object stays readable afterwards.
    pub fn stop(&mut self) -> RenderResult<()> {
        self.stop_render_thread();

        self.device.push_current();
        let result = (|| -> RenderResult<()> {
            let mut state = self.state.lock().unwrap();
            {
                let engine_film = self.shared.engine_film.lock().unwrap();
                state.thread_film.recv_film(&engine_film)?;
            }
            let mut stats =
                vec![GpuTaskStats::default(); self.shared.config.task_count as usize];
            if let Some(buf) = state.buffers.task_stats.get() {
                self.device
                    .enqueue_read_buffer(buf, false, bytemuck::cast_slice_mut(&mut stats))?;
            }
            self.device.finish()?;
            let total: f64 = stats.iter().map(|s| s.sample_count as f64).sum();
            state.thread_film.film.set_sample_counts(total, 0.0);
            state.thread_film.free_all_buffers();
            state.buffers.free_all(self.device.as_ref());
            state.kernels = None;
            Ok(())
        })();
        self.device.pop_current();

        self.started = false;
        self.edit_mode = false;

        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.last_error.take() {
            return Err(err);
        }
        result
    }

    /// Quiesce the loop for a scene edit; committed film content is kept.
    pub fn begin_scene_edit(&mut self) {
        self.stop_render_thread();
        self.edit_mode = true;
    }

    /// Refresh exactly the dirty buffer groups, recompile kernels only if
    /// the source/parameter hash moved, then resume the loop.
    pub fn end_scene_edit(&mut self, edit_actions: &EditActionList) -> RenderResult<()> {
        self.device.push_current();
        let result = self.end_scene_edit_inner(edit_actions);
        self.device.pop_current();
        result?;

        self.edit_mode = false;
        self.start_render_thread();
        Ok(())
    }

    fn end_scene_edit_inner(&mut self, edit_actions: &EditActionList) -> RenderResult<()> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let cscene = self.shared.cscene.read().unwrap();

        if cscene.was_camera_compiled {
            Self::init_camera(self.device.as_ref(), &mut state.buffers, &cscene)?;
        }
        if cscene.was_geometry_compiled {
            Self::init_geometry(self.device.as_ref(), &mut state.buffers, &cscene)?;
        }
        if cscene.was_image_maps_compiled {
            Self::init_image_maps(self.device.as_ref(), &mut state.buffers, &cscene)?;
        }
        if cscene.was_materials_compiled {
            Self::init_textures(self.device.as_ref(), &mut state.buffers, &cscene)?;
            Self::init_materials(self.device.as_ref(), &mut state.buffers, &cscene)?;
        }
        if cscene.was_scene_objects_compiled {
            Self::init_scene_objects(self.device.as_ref(), &mut state.buffers, &cscene)?;
        }
        if cscene.was_lights_compiled {
            Self::init_lights(self.device.as_ref(), &mut state.buffers, &cscene)?;
        }
        if cscene.was_photon_gi_compiled {
            Self::init_photon_gi(self.device.as_ref(), &mut state.buffers, &cscene)?;
        }

        // A feature-set change may require new kernel code; the hash check
        // inside makes the unchanged case a no-op.
        self.init_kernels(state, &cscene)?;

        if edit_actions.has_any() {
            // The task configuration is immutable per edit epoch
            let task_config =
                GpuTaskConfiguration::derive(&self.shared.config, &cscene, &state.thread_film.film);
            self.device.alloc_buffer_ro(
                &mut state.buffers.task_config,
                bytemuck::bytes_of(&task_config),
                BufferRole::TaskConfig,
            )?;

            self.set_kernel_args(state, &cscene)?;

            // Post-edit geometry/materials invalidate prior samples
            let ThreadState {
                kernels,
                thread_film,
                ..
            } = state;
            let kernels = kernels.as_ref().expect("kernels initialized");
            thread_film.clear(
                kernels.film_clear.as_ref(),
                kernels.film_clear_work_group_size,
            )?;
            self.device.finish()?;
        }

        Ok(())
    }

    /// Non-blocking completion poll.
    pub fn has_done(&self) -> bool {
        self.join.is_none() || self.thread_done.load(Ordering::Acquire)
    }

    /// Block until the loop thread has exited.
    pub fn wait_for_done(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    /// Current kernel cache key bound on this thread.
    pub fn kernel_src_hash(&self) -> String {
        self.state.lock().unwrap().kernel_src_hash.clone()
    }

    /// Identity snapshot of the subsystem buffers, for tests and
    /// diagnostics.
    pub fn buffer_ids(&self) -> Vec<(&'static str, Option<u64>)> {
        self.state.lock().unwrap().buffers.subsystem_ids()
    }

    /// Byte-size snapshot of the subsystem buffers.
    pub fn buffer_sizes(&self) -> Vec<(&'static str, u64)> {
        self.state.lock().unwrap().buffers.subsystem_sizes()
    }

    /// Fold the host film mirror into the engine film without touching the
    /// device (valid after `stop`, when device buffers are gone).
    pub fn merge_host_film(&self, engine_film: &mut Film) -> RenderResult<()> {
        let state = self.state.lock().unwrap();
        engine_film.add_film(&state.thread_film.film)
    }

    /// Read the thread film back and fold it into the engine film.
    ///
    /// Lock order is thread state before engine film, everywhere.
    pub fn transfer_and_merge(&self) -> RenderResult<()> {
        let mut state = self.state.lock().unwrap();
        self.device.push_current();
        let result = (|| -> RenderResult<()> {
            let mut engine_film = self.shared.engine_film.lock().unwrap();
            state.thread_film.recv_film(&engine_film)?;
            let mut stats =
                vec![GpuTaskStats::default(); self.shared.config.task_count as usize];
            if let Some(buf) = state.buffers.task_stats.get() {
                self.device
                    .enqueue_read_buffer(buf, false, bytemuck::cast_slice_mut(&mut stats))?;
            }
            self.device.finish()?;
            let total: f64 = stats.iter().map(|s| s.sample_count as f64).sum();
            state.thread_film.film.set_sample_counts(total, 0.0);
            engine_film.add_film(&state.thread_film.film)
        })();
        self.device.pop_current();
        result
    }

    //--------------------------------------------------------------------------
    // Initialization
    //--------------------------------------------------------------------------

    fn init_render(&mut self) -> RenderResult<()> {
        self.device.push_current();
        let result = self.init_render_inner();
        self.device.pop_current();
        result
    }

    fn init_render_inner(&mut self) -> RenderResult<()> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let cscene = self.shared.cscene.read().unwrap();
        let device = self.device.as_ref();

        // Film definition
        {
            let engine_film = self.shared.engine_film.lock().unwrap();
            let width = engine_film.width();
            let height = engine_film.height();
            let sub_region = engine_film.sub_region();
            state
                .thread_film
                .init(&engine_film, width, height, sub_region)?;
        }

        // Scene subsystems
        Self::init_camera(device, &mut state.buffers, &cscene)?;
        Self::init_geometry(device, &mut state.buffers, &cscene)?;
        Self::init_image_maps(device, &mut state.buffers, &cscene)?;
        Self::init_textures(device, &mut state.buffers, &cscene)?;
        Self::init_materials(device, &mut state.buffers, &cscene)?;
        Self::init_scene_objects(device, &mut state.buffers, &cscene)?;
        Self::init_lights(device, &mut state.buffers, &cscene)?;
        Self::init_photon_gi(device, &mut state.buffers, &cscene)?;

        // Task working set
        self.init_task_buffers(state, &cscene)?;

        // Kernels
        self.init_kernels(state, &cscene)?;

        // Bind arguments, then clear the fresh film
        self.set_kernel_args(state, &cscene)?;
        {
            let ThreadState {
                kernels,
                thread_film,
                ..
            } = state;
            let kernels = kernels.as_ref().expect("kernels initialized");
            thread_film.clear(
                kernels.film_clear.as_ref(),
                kernels.film_clear_work_group_size,
            )?;
        }
        self.device.finish()?;

        Ok(())
    }

    fn init_camera(
        device: &dyn Device,
        buffers: &mut SceneBuffers,
        cscene: &CompiledScene,
    ) -> RenderResult<()> {
        device.alloc_buffer_ro(
            &mut buffers.camera,
            bytemuck::bytes_of(&cscene.camera),
            BufferRole::Camera,
        )
    }

    fn init_geometry(
        device: &dyn Device,
        buffers: &mut SceneBuffers,
        cscene: &CompiledScene,
    ) -> RenderResult<()> {
        alloc_ro_or_free(
            device,
            &mut buffers.verts,
            bytemuck::cast_slice(&cscene.verts),
            BufferRole::Vertices,
        )?;
        alloc_ro_or_free(
            device,
            &mut buffers.normals,
            bytemuck::cast_slice(&cscene.normals),
            BufferRole::Normals,
        )?;
        alloc_ro_or_free(
            device,
            &mut buffers.tri_normals,
            bytemuck::cast_slice(&cscene.tri_normals),
            BufferRole::TriangleNormals,
        )?;
        alloc_ro_or_free(
            device,
            &mut buffers.uvs,
            bytemuck::cast_slice(&cscene.uvs),
            BufferRole::Uvs,
        )?;
        alloc_ro_or_free(
            device,
            &mut buffers.cols,
            bytemuck::cast_slice(&cscene.cols),
            BufferRole::Colors,
        )?;
        alloc_ro_or_free(
            device,
            &mut buffers.alphas,
            bytemuck::cast_slice(&cscene.alphas),
            BufferRole::Alphas,
        )?;
        alloc_ro_or_free(
            device,
            &mut buffers.triangles,
            bytemuck::cast_slice(&cscene.tris),
            BufferRole::Triangles,
        )?;
        alloc_ro_or_free(
            device,
            &mut buffers.mesh_descs,
            bytemuck::cast_slice(&cscene.mesh_descs),
            BufferRole::MeshDescs,
        )
    }

    fn init_materials(
        device: &dyn Device,
        buffers: &mut SceneBuffers,
        cscene: &CompiledScene,
    ) -> RenderResult<()> {
        alloc_ro_or_free(
            device,
            &mut buffers.materials,
            bytemuck::cast_slice(&cscene.mats),
            BufferRole::Materials,
        )
    }

    fn init_textures(
        device: &dyn Device,
        buffers: &mut SceneBuffers,
        cscene: &CompiledScene,
    ) -> RenderResult<()> {
        alloc_ro_or_free(
            device,
            &mut buffers.textures,
            bytemuck::cast_slice(&cscene.texs),
            BufferRole::Textures,
        )
    }

    fn init_scene_objects(
        device: &dyn Device,
        buffers: &mut SceneBuffers,
        cscene: &CompiledScene,
    ) -> RenderResult<()> {
        alloc_ro_or_free(
            device,
            &mut buffers.scene_objs,
            bytemuck::cast_slice(&cscene.scene_objs),
            BufferRole::SceneObjects,
        )
    }

    fn init_lights(
        device: &dyn Device,
        buffers: &mut SceneBuffers,
        cscene: &CompiledScene,
    ) -> RenderResult<()> {
        alloc_ro_or_free(
            device,
            &mut buffers.lights,
            bytemuck::cast_slice(&cscene.light_defs),
            BufferRole::Lights,
        )?;
        alloc_ro_or_free(
            device,
            &mut buffers.env_light_indices,
            bytemuck::cast_slice(&cscene.env_light_indices),
            BufferRole::EnvLightIndices,
        )?;
        alloc_ro_or_free(
            device,
            &mut buffers.light_index_offset_by_mesh,
            bytemuck::cast_slice(&cscene.light_index_offset_by_mesh),
            BufferRole::LightIndexOffsetByMesh,
        )?;
        alloc_ro_or_free(
            device,
            &mut buffers.light_index_by_tri,
            bytemuck::cast_slice(&cscene.light_index_by_tri),
            BufferRole::LightIndexByTri,
        )?;
        alloc_ro_or_free(
            device,
            &mut buffers.lights_distribution,
            bytemuck::cast_slice(&cscene.lights_distribution),
            BufferRole::LightsDistribution,
        )?;
        alloc_ro_or_free(
            device,
            &mut buffers.infinite_light_distribution,
            bytemuck::cast_slice(&cscene.infinite_light_distribution),
            BufferRole::InfiniteLightDistribution,
        )?;
        alloc_ro_or_free(
            device,
            &mut buffers.env_light_distributions,
            bytemuck::cast_slice(&cscene.env_light_distributions),
            BufferRole::EnvLightDistributions,
        )
    }

    fn init_image_maps(
        device: &dyn Device,
        buffers: &mut SceneBuffers,
        cscene: &CompiledScene,
    ) -> RenderResult<()> {
        if cscene.image_map_descs.is_empty() {
            device.free_buffer(&mut buffers.image_map_descs);
            for slot in &mut buffers.image_map_pages {
                device.free_buffer(slot);
            }
            buffers.image_map_pages.clear();
            return Ok(());
        }

        device.alloc_buffer_ro(
            &mut buffers.image_map_descs,
            bytemuck::cast_slice(&cscene.image_map_descs),
            BufferRole::ImageMapDescs,
        )?;

        // Free pages beyond the current count
        while buffers.image_map_pages.len() > cscene.image_map_pages.len() {
            let mut slot = buffers.image_map_pages.pop().expect("non-empty");
            device.free_buffer(&mut slot);
        }
        while buffers.image_map_pages.len() < cscene.image_map_pages.len() {
            buffers.image_map_pages.push(BufferSlot::new());
        }
        for (slot, page) in buffers
            .image_map_pages
            .iter_mut()
            .zip(cscene.image_map_pages.iter())
        {
            device.alloc_buffer_ro(slot, bytemuck::cast_slice(page), BufferRole::ImageMapPage)?;
        }
        Ok(())
    }

    fn init_photon_gi(
        device: &dyn Device,
        buffers: &mut SceneBuffers,
        cscene: &CompiledScene,
    ) -> RenderResult<()> {
        alloc_ro_or_free(
            device,
            &mut buffers.pgic_radiance_photons,
            bytemuck::cast_slice(&cscene.pgic_radiance_photons),
            BufferRole::PhotonRadianceEntries,
        )?;
        alloc_ro_or_free(
            device,
            &mut buffers.pgic_caustic_photons,
            bytemuck::cast_slice(&cscene.pgic_caustic_photons),
            BufferRole::PhotonCausticEntries,
        )
    }

    fn init_task_buffers(
        &self,
        state: &mut ThreadState,
        cscene: &CompiledScene,
    ) -> RenderResult<()> {
        let device = self.device.as_ref();
        let buffers = &mut state.buffers;
        let config = &self.shared.config;
        let task_count = config.task_count as u64;

        let task_config =
            GpuTaskConfiguration::derive(config, cscene, &state.thread_film.film);
        device.alloc_buffer_ro(
            &mut buffers.task_config,
            bytemuck::bytes_of(&task_config),
            BufferRole::TaskConfig,
        )?;

        let task_size = tasks::path_task_size();
        log::debug!(
            "[RenderThread::{}] Size of a path task: {} bytes",
            self.index,
            task_size
        );
        device.alloc_buffer_rw(&mut buffers.tasks, task_size * task_count, BufferRole::Tasks)?;
        device.alloc_buffer_rw(
            &mut buffers.tasks_direct_light,
            tasks::direct_light_task_size() * task_count,
            BufferRole::TasksDirectLight,
        )?;
        device.alloc_buffer_rw(
            &mut buffers.tasks_state,
            tasks::path_task_state_size() * task_count,
            BufferRole::TasksState,
        )?;
        device.alloc_buffer_rw(
            &mut buffers.task_stats,
            std::mem::size_of::<GpuTaskStats>() as u64 * task_count,
            BufferRole::TaskStats,
        )?;

        let sub_region = state.thread_film.film.sub_region();
        let region_pixels = (sub_region[1] - sub_region[0] + 1) * (sub_region[3] - sub_region[2] + 1);
        let sampler_kind = config.sampler.sampler_type.id();
        let shared_size = tasks::sampler_shared_data_size(sampler_kind, region_pixels);
        if shared_size == 0 {
            device.free_buffer(&mut buffers.sampler_shared);
        } else {
            device.alloc_buffer_rw(
                &mut buffers.sampler_shared,
                shared_size,
                BufferRole::SamplerSharedData,
            )?;
        }

        device.alloc_buffer_rw(
            &mut buffers.samples,
            tasks::sample_size(sampler_kind) * task_count,
            BufferRole::Samples,
        )?;
        device.alloc_buffer_rw(
            &mut buffers.sample_data,
            2 * 4 * task_count,
            BufferRole::SampleData,
        )?;
        device.alloc_buffer_rw(
            &mut buffers.sample_results,
            tasks::sample_result_size() * task_count,
            BufferRole::SampleResults,
        )?;
        device.alloc_buffer_rw(
            &mut buffers.eye_path_infos,
            tasks::eye_path_info_size() * task_count,
            BufferRole::EyePathInfos,
        )?;
        device.alloc_buffer_rw(
            &mut buffers.direct_light_vol_infos,
            4 * task_count,
            BufferRole::DirectLightVolInfos,
        )?;

        let filter_table = build_filter_distribution(&task_config.filter);
        device.alloc_buffer_ro(
            &mut buffers.pixel_filter,
            bytemuck::cast_slice(&filter_table),
            BufferRole::PixelFilter,
        )?;

        device.alloc_buffer_rw(
            &mut buffers.rays,
            std::mem::size_of::<tasks::Ray>() as u64 * task_count,
            BufferRole::Rays,
        )?;
        device.alloc_buffer_rw(
            &mut buffers.hits,
            std::mem::size_of::<tasks::RayHit>() as u64 * task_count,
            BufferRole::Hits,
        )?;
        Ok(())
    }

    /// Assemble source and parameters, and only recompile when the hash
    /// pair moved; on a move, fetch through the kernel cache.
    fn init_kernels(&self, state: &mut ThreadState, cscene: &CompiledScene) -> RenderResult<()> {
        let config = &self.shared.config;
        let params = derive_kernel_params(config, cscene, &state.thread_film.film)?;
        let source = assemble_kernel_source(&params, cscene, config.sampler.sampler_type);

        let new_hash = cache_key(&params, &source);
        if new_hash == state.kernel_src_hash && state.kernels.is_some() {
            // Dominant fast path during scene edits that do not change
            // enabled feature sets
            return Ok(());
        }
        state.kernel_src_hash = new_hash;

        log::info!("[RenderThread::{}] Defined symbols:{}", self.index, params);
        log::info!("[RenderThread::{}] Compiling kernels", self.index);

        if config.write_kernels_to_file {
            let file_name = format!("kernel_source_device_{}.wgsl", self.index);
            let dump = format!("// {}\n\n{}", params.trim(), source);
            std::fs::write(&file_name, dump)?;
        }

        let start = Instant::now();
        let compiled = self
            .shared
            .kernel_cache
            .compile(self.device.as_ref(), &params, &source)?;
        if compiled.cached {
            log::info!("[RenderThread::{}] Kernels cached", self.index);
        } else {
            log::info!("[RenderThread::{}] Kernels not cached", self.index);
        }

        let program = self.device.load_program(&compiled.blob)?;
        state.kernels = Some(KernelSet::from_program(program.as_ref())?);

        log::info!(
            "[RenderThread::{}] Kernels compilation time: {}ms",
            self.index,
            start.elapsed().as_millis()
        );
        Ok(())
    }

    /// Bind the full ordinal argument list on every entry point.
    ///
    /// Argument binding is not thread safe on a shared driver context, so
    /// the engine-wide mutex serializes it.
    fn set_kernel_args(&self, state: &mut ThreadState, cscene: &CompiledScene) -> RenderResult<()> {
        let task_count = self.shared.config.task_count;
        let seed_base = self
            .shared
            .seed_base
            .wrapping_add(self.index.wrapping_mul(task_count));

        let ThreadState {
            buffers,
            kernels,
            thread_film,
            ..
        } = state;
        let kernels = kernels
            .as_mut()
            .ok_or_else(|| RenderError::device("kernel arguments bound before kernels exist"))?;

        let mut args: Vec<KernelArg<'_>> = Vec::with_capacity(arg_index::COUNT);
        args.push(KernelArg::Buffer(buffers.task_config.get()));
        args.push(KernelArg::Buffer(buffers.tasks.get()));
        args.push(KernelArg::Buffer(buffers.tasks_direct_light.get()));
        args.push(KernelArg::Buffer(buffers.tasks_state.get()));
        args.push(KernelArg::Buffer(buffers.task_stats.get()));
        args.push(KernelArg::Buffer(buffers.pixel_filter.get()));
        args.push(KernelArg::Buffer(buffers.sampler_shared.get()));
        args.push(KernelArg::Buffer(buffers.samples.get()));
        args.push(KernelArg::Buffer(buffers.sample_data.get()));
        args.push(KernelArg::Buffer(buffers.sample_results.get()));
        args.push(KernelArg::Buffer(buffers.eye_path_infos.get()));
        args.push(KernelArg::Buffer(buffers.direct_light_vol_infos.get()));
        args.push(KernelArg::Buffer(buffers.rays.get()));
        args.push(KernelArg::Buffer(buffers.hits.get()));

        thread_film.push_film_kernel_args(&mut args);

        args.push(KernelArg::Buffer(buffers.camera.get()));
        args.push(KernelArg::Buffer(buffers.materials.get()));
        args.push(KernelArg::Buffer(buffers.textures.get()));
        args.push(KernelArg::Buffer(buffers.scene_objs.get()));
        args.push(KernelArg::Buffer(buffers.mesh_descs.get()));
        args.push(KernelArg::Buffer(buffers.verts.get()));
        args.push(KernelArg::Buffer(buffers.normals.get()));
        args.push(KernelArg::Buffer(buffers.tri_normals.get()));
        args.push(KernelArg::Buffer(buffers.uvs.get()));
        args.push(KernelArg::Buffer(buffers.triangles.get()));
        args.push(KernelArg::Buffer(buffers.lights.get()));
        args.push(KernelArg::Buffer(buffers.env_light_indices.get()));
        args.push(KernelArg::U32(cscene.env_light_indices.len() as u32));
        args.push(KernelArg::Buffer(buffers.lights_distribution.get()));
        args.push(KernelArg::Buffer(buffers.image_map_descs.get()));
        for page in 0..MAX_IMAGE_MAP_PAGES {
            args.push(KernelArg::Buffer(
                buffers.image_map_pages.get(page).and_then(|s| s.get()),
            ));
        }
        args.push(KernelArg::Buffer(buffers.pgic_radiance_photons.get()));
        args.push(KernelArg::Buffer(buffers.pgic_caustic_photons.get()));

        args.push(KernelArg::F32(cscene.world_bsphere_center.x));
        args.push(KernelArg::F32(cscene.world_bsphere_center.y));
        args.push(KernelArg::F32(cscene.world_bsphere_center.z));
        args.push(KernelArg::F32(cscene.world_bsphere_radius));
        args.push(KernelArg::U32(seed_base));
        args.push(KernelArg::U32(task_count));
        debug_assert_eq!(args.len(), arg_index::COUNT);

        let _guard = self.shared.set_kernel_args_mutex.lock().unwrap();
        kernels.init_seed.set_args(&args)?;
        kernels.init.set_args(&args)?;
        kernels.film_clear.set_args(&args)?;
        for kernel in &mut kernels.advance_paths {
            kernel.set_args(&args)?;
        }
        Ok(())
    }

    //--------------------------------------------------------------------------
    // Render loop
    //--------------------------------------------------------------------------

    fn start_render_thread(&mut self) {
        self.thread_done.store(false, Ordering::Release);
        self.interrupt.store(false, Ordering::Release);

        let device = self.device.clone();
        let state = self.state.clone();
        let shared = self.shared.clone();
        let interrupt = self.interrupt.clone();
        let thread_done = self.thread_done.clone();
        let index = self.index;
        let send_start_film = self.has_start_film && self.index == 0;

        self.join = Some(std::thread::spawn(move || {
            let result = Self::render_loop(
                index,
                device,
                state.clone(),
                shared,
                interrupt,
                send_start_film,
            );
            if let Err(err) = result {
                log::error!("[RenderThread::{index}] render loop failed: {err}");
                state.lock().unwrap().last_error = Some(err);
            }
            thread_done.store(true, Ordering::Release);
        }));
    }

    fn stop_render_thread(&mut self) {
        if let Some(join) = self.join.take() {
            self.interrupt.store(true, Ordering::Release);
            let _ = join.join();
        }
    }

    fn render_loop(
        index: u32,
        device: Arc<dyn Device>,
        state: Arc<Mutex<ThreadState>>,
        shared: RenderThreadShared,
        interrupt: Arc<AtomicBool>,
        send_start_film: bool,
    ) -> RenderResult<()> {
        log::debug!("[RenderThread::{index}] Rendering thread started");
        let task_count = shared.config.task_count;

        // Initialization launches
        device.push_current();
        let init_result = (|| -> RenderResult<()> {
            let mut state = state.lock().unwrap();
            let ThreadState {
                kernels,
                thread_film,
                ..
            } = &mut *state;
            let kernels = kernels
                .as_ref()
                .ok_or_else(|| RenderError::device("render loop started without kernels"))?;
            kernels
                .init_seed
                .enqueue(task_count, kernels.init_work_group_size)?;
            kernels.init.enqueue(task_count, kernels.init_work_group_size)?;
            if send_start_film {
                // Seed accumulation from the engine film's current content
                let engine_film = shared.engine_film.lock().unwrap();
                thread_film.film.add_film(&engine_film)?;
                thread_film.send_film()?;
            }
            device.finish()
        })();
        device.pop_current();
        init_result?;

        let mut iterations: u32 = 4;
        let mut total_transfer_time = 0.0f64;
        let mut total_kernel_time = 0.0f64;
        let start_time = Instant::now();

        while !interrupt.load(Ordering::Acquire) {
            if shared.pause.load(Ordering::Acquire) {
                std::thread::sleep(PAUSE_POLL);
                continue;
            }

            // Transfer the film only when transfer time stays below 1% of
            // kernel time, so large films do not starve the device queue.
            if total_transfer_time < total_kernel_time * 0.01 {
                let t0 = Instant::now();
                device.push_current();
                let transfer = (|| -> RenderResult<()> {
                    let mut state = state.lock().unwrap();
                    {
                        let engine_film = shared.engine_film.lock().unwrap();
                        state.thread_film.recv_film(&engine_film)?;
                    }
                    // Task statistics drive the film sample count
                    let mut stats = vec![GpuTaskStats::default(); task_count as usize];
                    if let Some(buf) = state.buffers.task_stats.get() {
                        device.enqueue_read_buffer(
                            buf,
                            false,
                            bytemuck::cast_slice_mut(&mut stats),
                        )?;
                    }
                    device.finish()?;
                    let total: f64 = stats.iter().map(|s| s.sample_count as f64).sum();
                    state.thread_film.film.set_sample_counts(total, 0.0);
                    Ok(())
                })();
                device.pop_current();
                transfer?;
                total_transfer_time += t0.elapsed().as_secs_f64();
            }

            // Kernel launches; an iteration is uninterruptible once started
            let t0 = Instant::now();
            device.push_current();
            let launch = (|| -> RenderResult<()> {
                let state = state.lock().unwrap();
                let kernels = state
                    .kernels
                    .as_ref()
                    .ok_or_else(|| RenderError::device("render loop lost its kernels"))?;
                for _ in 0..iterations {
                    for kernel in &kernels.advance_paths {
                        kernel.enqueue(task_count, kernels.advance_paths_work_group_size)?;
                    }
                }
                device.finish()
            })();
            device.pop_current();
            launch?;
            let kernel_time = t0.elapsed().as_secs_f64();
            total_kernel_time += kernel_time;

            // Keep each pass near the refresh target
            if kernel_time < TARGET_ITERATION_SECS * 0.5 && iterations < MAX_ITERATIONS_PER_PASS {
                iterations *= 2;
            } else if kernel_time > TARGET_ITERATION_SECS * 2.0 && iterations > 1 {
                iterations /= 2;
            }

            // Halt conditions
            let config = &shared.config;
            if config.halt_time_secs > 0.0
                && start_time.elapsed().as_secs_f32() >= config.halt_time_secs
            {
                break;
            }
            if config.halt_spp > 0 {
                // The task statistics are authoritative for progress; the
                // film sample count only refreshes on throttled transfers
                device.push_current();
                let total = (|| -> RenderResult<f64> {
                    let state = state.lock().unwrap();
                    let mut stats = vec![GpuTaskStats::default(); task_count as usize];
                    if let Some(buf) = state.buffers.task_stats.get() {
                        device.enqueue_read_buffer(
                            buf,
                            true,
                            bytemuck::cast_slice_mut(&mut stats),
                        )?;
                    }
                    Ok(stats.iter().map(|s| s.sample_count as f64).sum())
                })();
                device.pop_current();
                let total = total?;
                let state = state.lock().unwrap();
                let pixels = state.thread_film.film.pixel_count().max(1) as f64;
                if total / pixels >= config.halt_spp as f64 {
                    break;
                }
            }
        }

        log::debug!("[RenderThread::{index}] Rendering thread halted");
        Ok(())
    }
}

impl Drop for DeviceRenderThread {
    fn drop(&mut self) {
        if self.edit_mode {
            let _ = self.end_scene_edit(&EditActionList::new());
        }
        if self.started {
            let _ = self.stop();
        }
    }
}

//------------------------------------------------------------------------------
// Native render thread
//------------------------------------------------------------------------------

/// A render thread tracing on one CPU core, without a compute device.
pub struct NativeRenderThread {
    index: u32,
    shared: RenderThreadShared,
    film: Arc<Mutex<Film>>,
    last_error: Arc<Mutex<Option<RenderError>>>,
    interrupt: Arc<AtomicBool>,
    thread_done: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
    started: bool,
    edit_mode: bool,
}

impl NativeRenderThread {
    pub fn new(index: u32, shared: RenderThreadShared) -> Self {
        NativeRenderThread {
            index,
            shared,
            film: Arc::new(Mutex::new(Film::new(1, 1))),
            last_error: Arc::new(Mutex::new(None)),
            interrupt: Arc::new(AtomicBool::new(false)),
            thread_done: Arc::new(AtomicBool::new(false)),
            join: None,
            started: false,
            edit_mode: false,
        }
    }

    pub fn start(&mut self) -> RenderResult<()> {
        self.started = true;

        {
            let engine_film = self.shared.engine_film.lock().unwrap();
            let mut film = Film::new(engine_film.width(), engine_film.height());
            film.copy_channel_settings(&engine_film);
            // Samples merge through the engine film's pipeline; the thread
            // keeps sample buffers only
            film.remove_channel(FilmChannel::ImagePipeline);
            film.set_sub_region(engine_film.sub_region());
            film.init();
            *self.film.lock().unwrap() = film;
        }

        self.start_render_thread();
        Ok(())
    }

    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::Release);
    }

    pub fn stop(&mut self) -> RenderResult<()> {
        self.stop_render_thread();
        self.started = false;
        self.edit_mode = false;
        if let Some(err) = self.last_error.lock().unwrap().take() {
            return Err(err);
        }
        Ok(())
    }

    pub fn begin_scene_edit(&mut self) {
        self.stop_render_thread();
        self.edit_mode = true;
    }

    pub fn end_scene_edit(&mut self, edit_actions: &EditActionList) -> RenderResult<()> {
        if edit_actions.has_any() {
            self.film.lock().unwrap().clear();
        }
        self.edit_mode = false;
        self.start_render_thread();
        Ok(())
    }

    pub fn has_done(&self) -> bool {
        self.join.is_none() || self.thread_done.load(Ordering::Acquire)
    }

    pub fn wait_for_done(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    /// Fold this thread's film into the engine film.
    pub fn merge_into(&self, engine_film: &mut Film) -> RenderResult<()> {
        let film = self.film.lock().unwrap();
        engine_film.add_film(&film)
    }

    fn start_render_thread(&mut self) {
        self.thread_done.store(false, Ordering::Release);
        self.interrupt.store(false, Ordering::Release);

        let shared = self.shared.clone();
        let film = self.film.clone();
        let interrupt = self.interrupt.clone();
        let thread_done = self.thread_done.clone();
        let last_error = self.last_error.clone();
        let index = self.index;

        self.join = Some(std::thread::spawn(move || {
            if let Err(err) = Self::render_loop(index, shared, film, interrupt) {
                log::error!("[NativeRenderThread::{index}] render loop failed: {err}");
                *last_error.lock().unwrap() = Some(err);
            }
            thread_done.store(true, Ordering::Release);
        }));
    }

    fn stop_render_thread(&mut self) {
        if let Some(join) = self.join.take() {
            self.interrupt.store(true, Ordering::Release);
            let _ = join.join();
        }
    }

    fn render_loop(
        index: u32,
        shared: RenderThreadShared,
        film: Arc<Mutex<Film>>,
        interrupt: Arc<AtomicBool>,
    ) -> RenderResult<()> {
        log::debug!("[NativeRenderThread::{index}] Rendering thread started");

        let mut seed = tasks::Seed::init(shared.seed_base.wrapping_add(1 + index));
        let start_time = Instant::now();
        let mut step: u64 = 0;

        loop {
            if interrupt.load(Ordering::Acquire) {
                break;
            }
            if shared.pause.load(Ordering::Acquire) {
                std::thread::sleep(PAUSE_POLL);
                continue;
            }

            // A small batch of samples per film lock
            let batch = 64;
            {
                let cscene = shared.cscene.read().unwrap();
                let mut film = film.lock().unwrap();
                let sub_region = film.sub_region();
                let width = film.width();
                let region_w = sub_region[1] - sub_region[0] + 1;
                let region_pixels =
                    (region_w * (sub_region[3] - sub_region[2] + 1)).max(1) as u64;

                for _ in 0..batch {
                    let region_index = (step + index as u64) % region_pixels;
                    let x = sub_region[0] + (region_index as u32) % region_w;
                    let y = sub_region[2] + (region_index as u32) / region_w;
                    let pixel = (y * width + x) as usize;

                    let jx = native_rng(&mut seed);
                    let jy = native_rng(&mut seed);
                    let ray = native_camera_ray(
                        &cscene.camera,
                        x as f32 + jx,
                        y as f32 + jy,
                        width as f32,
                        film.height() as f32,
                    );
                    let hit = shared.intersector.intersect(&ray);

                    let mut radiance = [0.0f32; 3];
                    if hit.is_miss() {
                        for &e in &cscene.env_light_indices {
                            let light = &cscene.light_defs[e as usize];
                            for c in 0..3 {
                                radiance[c] += light.emission[c];
                            }
                        }
                    } else if (hit.mesh_index as usize) < cscene.scene_objs.len() {
                        let obj = &cscene.scene_objs[hit.mesh_index as usize];
                        if (obj.material_index as usize) < cscene.mats.len() {
                            let mat = &cscene.mats[obj.material_index as usize];
                            for c in 0..3 {
                                radiance[c] += mat.emission[c];
                            }
                        }
                    }

                    if !film.radiance_per_pixel_normalized.is_empty() {
                        let plane = &mut film.radiance_per_pixel_normalized[0];
                        plane[pixel * 4] += radiance[0];
                        plane[pixel * 4 + 1] += radiance[1];
                        plane[pixel * 4 + 2] += radiance[2];
                        plane[pixel * 4 + 3] += 1.0;
                    }
                    step += 1;
                }
                film.add_sample_counts(batch as f64, 0.0);

                // Halt conditions
                let config = &shared.config;
                if config.halt_time_secs > 0.0
                    && start_time.elapsed().as_secs_f32() >= config.halt_time_secs
                {
                    break;
                }
                if config.halt_spp > 0 {
                    let pixels = film.pixel_count().max(1) as f64;
                    if film.total_sample_count() / pixels >= config.halt_spp as f64 {
                        break;
                    }
                }
            }

            std::thread::yield_now();
        }

        log::debug!("[NativeRenderThread::{index}] Rendering thread halted");
        Ok(())
    }
}

fn native_rng(seed: &mut tasks::Seed) -> f32 {
    fn taus(s: u32, a: u32, b: u32, c: u32, m: u32) -> u32 {
        (((s & m) << c) ^ (((s << a) ^ s) >> b)).max(2)
    }
    seed.s1 = taus(seed.s1, 13, 19, 12, 0xfffffffe);
    seed.s2 = taus(seed.s2, 2, 25, 4, 0xfffffff8);
    seed.s3 = taus(seed.s3, 3, 11, 17, 0xfffffff0);
    ((seed.s1 ^ seed.s2 ^ seed.s3) >> 8) as f32 / (1u32 << 24) as f32
}

/// Perspective eye ray for the native sample loop; the richer camera kinds
/// are a device-path concern.
fn native_camera_ray(
    camera: &crate::scene::CompiledCamera,
    film_x: f32,
    film_y: f32,
    width: f32,
    height: f32,
) -> tasks::Ray {
    let ndc_x = 2.0 * film_x / width - 1.0;
    let ndc_y = 1.0 - 2.0 * film_y / height;
    let tan_half = (camera.fov_y * 0.5).tan();
    let aspect = width / height;

    let forward = glam::Vec3::from_array(camera.forward);
    let right = glam::Vec3::from_array(camera.right);
    let up = glam::Vec3::from_array(camera.up);
    let direction = (forward + right * ndc_x * tan_half * aspect + up * ndc_y * tan_half)
        .normalize_or_zero();

    tasks::Ray {
        origin: camera.eye,
        tmin: 1e-3,
        direction: direction.to_array(),
        tmax: f32::MAX,
    }
}

impl Drop for NativeRenderThread {
    fn drop(&mut self) {
        if self.edit_mode {
            let _ = self.end_scene_edit(&EditActionList::new());
        }
        if self.started {
            let _ = self.stop();
        }
    }
}
