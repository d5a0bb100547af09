//! Native (CPU) compute device
//!
//! Executes the same micro-kernel pipeline as the device kernel path, with
//! buffers in host memory and entry points dispatched through a function
//! table derived once from the compile parameters. Ray intersection is an
//! injected collaborator; the default misses everything, which leaves the
//! environment lights as the only radiance source.

use std::sync::{Arc, Mutex};

use bytemuck::Pod;
use serde::{Deserialize, Serialize};

use crate::device::{
    check_alloc_size, BufferAccess, BufferRole, BufferSlot, BufferStorage, Device, DeviceBuffer,
    Kernel, KernelArg, MemoryTracker, Program, ProgramBlob,
};
use crate::engine::tasks::{
    task_state, DirectLightTask, GpuTaskStats, PathTask, PathTaskState, Ray, RayHit, SampleResult,
    Seed,
};
use crate::error::{RenderError, RenderResult};
use crate::film::FILM_MAX_RADIANCE_GROUP_COUNT;
use crate::kernel::arg_index;
use crate::kernel::MicroKernel;
use crate::scene::{CompiledCamera, CompiledLight, CompiledMaterial, CompiledSceneObject};

/// Ray intersection collaborator.
///
/// The acceleration-structure math is external; render threads only need
/// an opaque entry point.
pub trait Intersector: Send + Sync {
    fn intersect(&self, ray: &Ray) -> RayHit;
}

/// Default collaborator: every ray escapes the scene.
pub struct MissEverything;

impl Intersector for MissEverything {
    fn intersect(&self, _ray: &Ray) -> RayHit {
        RayHit::miss()
    }
}

/// CPU compute device.
pub struct NativeDevice {
    name: String,
    tracker: Arc<MemoryTracker>,
    intersector: Arc<dyn Intersector>,
}

impl NativeDevice {
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_intersector(name, Arc::new(MissEverything))
    }

    pub fn with_intersector(name: &str, intersector: Arc<dyn Intersector>) -> Arc<Self> {
        Arc::new(NativeDevice {
            name: name.to_string(),
            tracker: Arc::new(MemoryTracker::new()),
            intersector,
        })
    }
}

/// Kernel configuration derived from the compile-parameter string.
///
/// The native "binary" is this configuration serialized; loading it builds
/// the dispatch table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NativeKernelConfig {
    pub sampler_kind: u32,
    pub max_path_depth: u32,
    pub force_black_background: bool,
    pub has_env_lights: bool,
    pub camera_kind: u32,
}

impl NativeKernelConfig {
    fn from_params(params: &str) -> Self {
        let value_of = |name: &str| -> Option<u32> {
            params
                .split(" -D ")
                .find_map(|tok| tok.trim().strip_prefix(name)?.strip_prefix('=')?.parse().ok())
        };
        NativeKernelConfig {
            sampler_kind: value_of("PARAM_SAMPLER_TYPE").unwrap_or(0),
            max_path_depth: value_of("PARAM_MAX_PATH_DEPTH").unwrap_or(1),
            force_black_background: params.contains("PARAM_FORCE_BLACK_BACKGROUND"),
            has_env_lights: params.contains("PARAM_HAS_ENVLIGHTS"),
            camera_kind: value_of("PARAM_CAMERA_TYPE").unwrap_or(0),
        }
    }
}

impl Device for NativeDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn memory(&self) -> &MemoryTracker {
        &self.tracker
    }

    fn max_memory_alloc_size(&self) -> u64 {
        // Half a GiB per allocation keeps host memory use sane
        512 * 1024 * 1024
    }

    fn push_current(&self) {}
    fn pop_current(&self) {}

    fn alloc_buffer_ro(
        &self,
        slot: &mut BufferSlot,
        src: &[u8],
        role: BufferRole,
    ) -> RenderResult<()> {
        let size = src.len() as u64;
        check_alloc_size(&self.name, role, size, self.max_memory_alloc_size())?;

        // Same-size live allocation: rewrite content in place, identity kept
        if let Some(buf) = slot.get() {
            if buf.size() == size && buf.role() == role {
                let host = buf.host().expect("native buffer has host storage");
                host.lock().unwrap().copy_from_slice(src);
                return Ok(());
            }
        }

        slot.free();
        log::debug!("[{}] Allocating {} buffer: {} bytes", self.name, role.name(), size);
        slot.replace(DeviceBuffer::new(
            size,
            role,
            BufferAccess::ReadOnly,
            BufferStorage::Host(Arc::new(Mutex::new(src.to_vec()))),
            self.tracker.clone(),
        ));
        Ok(())
    }

    fn alloc_buffer_rw(
        &self,
        slot: &mut BufferSlot,
        size: u64,
        role: BufferRole,
    ) -> RenderResult<()> {
        check_alloc_size(&self.name, role, size, self.max_memory_alloc_size())?;

        if let Some(buf) = slot.get() {
            if buf.size() == size && buf.role() == role {
                return Ok(());
            }
        }

        slot.free();
        log::debug!("[{}] Allocating {} buffer: {} bytes", self.name, role.name(), size);
        slot.replace(DeviceBuffer::new(
            size,
            role,
            BufferAccess::ReadWrite,
            BufferStorage::Host(Arc::new(Mutex::new(vec![0u8; size as usize]))),
            self.tracker.clone(),
        ));
        Ok(())
    }

    fn free_buffer(&self, slot: &mut BufferSlot) {
        slot.free();
    }

    fn compile_program(&self, params: &str, source: &str) -> RenderResult<ProgramBlob> {
        if source.is_empty() {
            return Err(RenderError::kernel_compile("empty kernel source"));
        }
        let config = NativeKernelConfig::from_params(params);
        let data = serde_json::to_vec(&config)
            .map_err(|e| RenderError::kernel_compile(format!("config serialization: {e}")))?;
        Ok(ProgramBlob { data })
    }

    fn load_program(&self, blob: &ProgramBlob) -> RenderResult<Box<dyn Program>> {
        let config: NativeKernelConfig = serde_json::from_slice(&blob.data)
            .map_err(|e| RenderError::kernel_compile(format!("bad native program blob: {e}")))?;
        Ok(Box::new(NativeProgram {
            config,
            intersector: self.intersector.clone(),
        }))
    }

    fn enqueue_read_buffer(
        &self,
        buf: &DeviceBuffer,
        _blocking: bool,
        dst: &mut [u8],
    ) -> RenderResult<()> {
        let host = buf
            .host()
            .ok_or_else(|| RenderError::readback("buffer is not host-resident"))?;
        let data = host.lock().unwrap();
        if dst.len() > data.len() {
            return Err(RenderError::readback(format!(
                "read of {} bytes from a {} byte buffer",
                dst.len(),
                data.len()
            )));
        }
        dst.copy_from_slice(&data[..dst.len()]);
        Ok(())
    }

    fn enqueue_write_buffer(
        &self,
        buf: &DeviceBuffer,
        _blocking: bool,
        src: &[u8],
    ) -> RenderResult<()> {
        let host = buf
            .host()
            .ok_or_else(|| RenderError::upload("buffer is not host-resident"))?;
        let mut data = host.lock().unwrap();
        if src.len() > data.len() {
            return Err(RenderError::upload(format!(
                "write of {} bytes into a {} byte buffer",
                src.len(),
                data.len()
            )));
        }
        data[..src.len()].copy_from_slice(src);
        Ok(())
    }

    fn finish(&self) -> RenderResult<()> {
        // Enqueues execute synchronously in order
        Ok(())
    }
}

//------------------------------------------------------------------------------
// Program / kernel
//------------------------------------------------------------------------------

struct NativeProgram {
    config: NativeKernelConfig,
    intersector: Arc<dyn Intersector>,
}

impl Program for NativeProgram {
    fn kernel(&self, name: &str) -> RenderResult<Box<dyn Kernel>> {
        let entry = entry_from_name(name)
            .ok_or_else(|| RenderError::kernel_compile(format!("unknown kernel entry {name}")))?;
        Ok(Box::new(NativeKernel {
            entry,
            config: self.config.clone(),
            intersector: self.intersector.clone(),
            args: Vec::new(),
        }))
    }
}

fn entry_from_name(name: &str) -> Option<MicroKernel> {
    [
        MicroKernel::InitSeed,
        MicroKernel::Init,
        MicroKernel::FilmClear,
        MicroKernel::RtNextVertex,
        MicroKernel::HitNothing,
        MicroKernel::HitObject,
        MicroKernel::RtDirectLight,
        MicroKernel::DirectLightIlluminate,
        MicroKernel::DirectLightSampleBsdf,
        MicroKernel::GenerateNextVertexRay,
        MicroKernel::SplatSample,
        MicroKernel::NextSample,
        MicroKernel::GenerateCameraRay,
    ]
    .into_iter()
    .find(|mk| mk.entry_name() == name)
}

enum OwnedArg {
    Buffer(Option<Arc<DeviceBuffer>>),
    U32(u32),
    F32(f32),
}

struct NativeKernel {
    entry: MicroKernel,
    config: NativeKernelConfig,
    intersector: Arc<dyn Intersector>,
    args: Vec<OwnedArg>,
}

impl Kernel for NativeKernel {
    fn name(&self) -> &str {
        self.entry.entry_name()
    }

    fn preferred_work_group_size(&self) -> u32 {
        1
    }

    fn set_args(&mut self, args: &[KernelArg<'_>]) -> RenderResult<()> {
        self.args = args
            .iter()
            .map(|a| match a {
                KernelArg::Buffer(b) => OwnedArg::Buffer(b.map(Arc::clone)),
                KernelArg::U32(v) => OwnedArg::U32(*v),
                KernelArg::F32(v) => OwnedArg::F32(*v),
            })
            .collect();
        Ok(())
    }

    fn enqueue(&self, global: u32, _local: u32) -> RenderResult<()> {
        let ctx = ArgView::new(&self.args)?;
        match self.entry {
            MicroKernel::InitSeed => self.run_init_seed(&ctx, global),
            MicroKernel::Init => self.run_init(&ctx, global),
            MicroKernel::FilmClear => self.run_film_clear(&ctx, global),
            MicroKernel::RtNextVertex => self.run_rt_next_vertex(&ctx, global),
            MicroKernel::HitNothing => self.run_hit_nothing(&ctx, global),
            MicroKernel::HitObject => self.run_hit_object(&ctx, global),
            MicroKernel::RtDirectLight => self.run_rt_dl(&ctx, global),
            MicroKernel::DirectLightIlluminate => self.run_dl_illuminate(&ctx, global),
            MicroKernel::DirectLightSampleBsdf => self.run_dl_sample_bsdf(&ctx, global),
            MicroKernel::GenerateNextVertexRay => self.run_generate_next_vertex_ray(&ctx, global),
            MicroKernel::SplatSample => self.run_splat_sample(&ctx, global),
            MicroKernel::NextSample => self.run_next_sample(&ctx, global),
            MicroKernel::GenerateCameraRay => self.run_generate_camera_ray(&ctx, global),
        }
    }
}

//------------------------------------------------------------------------------
// Argument access
//------------------------------------------------------------------------------

struct ArgView<'a> {
    args: &'a [OwnedArg],
}

impl<'a> ArgView<'a> {
    fn new(args: &'a [OwnedArg]) -> RenderResult<Self> {
        if args.is_empty() {
            return Err(RenderError::device("kernel launched with no bound arguments"));
        }
        Ok(ArgView { args })
    }

    fn buffer(&self, index: usize) -> RenderResult<&Arc<DeviceBuffer>> {
        match self.args.get(index) {
            Some(OwnedArg::Buffer(Some(b))) => Ok(b),
            Some(OwnedArg::Buffer(None)) => Err(RenderError::device(format!(
                "kernel argument {index} is a null buffer"
            ))),
            _ => Err(RenderError::device(format!(
                "kernel argument {index} is not a buffer"
            ))),
        }
    }

    fn opt_buffer(&self, index: usize) -> Option<&Arc<DeviceBuffer>> {
        match self.args.get(index) {
            Some(OwnedArg::Buffer(Some(b))) => Some(b),
            _ => None,
        }
    }

    fn u32(&self, index: usize) -> RenderResult<u32> {
        match self.args.get(index) {
            Some(OwnedArg::U32(v)) => Ok(*v),
            _ => Err(RenderError::device(format!(
                "kernel argument {index} is not a u32"
            ))),
        }
    }
}

fn read_pod<T: Pod>(buf: &Arc<DeviceBuffer>, index: usize) -> T {
    let host = buf.host().expect("native buffer");
    let data = host.lock().unwrap();
    let size = std::mem::size_of::<T>();
    bytemuck::pod_read_unaligned(&data[index * size..(index + 1) * size])
}

fn write_pod<T: Pod>(buf: &Arc<DeviceBuffer>, index: usize, value: &T) {
    let host = buf.host().expect("native buffer");
    let mut data = host.lock().unwrap();
    let size = std::mem::size_of::<T>();
    data[index * size..(index + 1) * size].copy_from_slice(bytemuck::bytes_of(value));
}

fn pod_count<T: Pod>(buf: &Arc<DeviceBuffer>) -> usize {
    buf.size() as usize / std::mem::size_of::<T>()
}

/// Tausworthe step shared with the device random fragment.
fn rng_next(seed: &mut Seed) -> f32 {
    fn taus(s: u32, a: u32, b: u32, c: u32, m: u32) -> u32 {
        (((s & m) << c) ^ (((s << a) ^ s) >> b)).max(2)
    }
    seed.s1 = taus(seed.s1, 13, 19, 12, 0xfffffffe);
    seed.s2 = taus(seed.s2, 2, 25, 4, 0xfffffff8);
    seed.s3 = taus(seed.s3, 3, 11, 17, 0xfffffff0);
    let bits = seed.s1 ^ seed.s2 ^ seed.s3;
    (bits >> 8) as f32 / (1u32 << 24) as f32
}

struct FilmView<'a> {
    width: u32,
    sub_region: [u32; 4],
    view: &'a ArgView<'a>,
}

impl<'a> FilmView<'a> {
    fn new(view: &'a ArgView<'a>) -> RenderResult<Self> {
        Ok(FilmView {
            width: view.u32(arg_index::FILM_WIDTH)?,
            sub_region: [
                view.u32(arg_index::FILM_SUB_REGION_0)?,
                view.u32(arg_index::FILM_SUB_REGION_1)?,
                view.u32(arg_index::FILM_SUB_REGION_2)?,
                view.u32(arg_index::FILM_SUB_REGION_3)?,
            ],
            view,
        })
    }

    fn region_width(&self) -> u32 {
        self.sub_region[1] - self.sub_region[0] + 1
    }

    fn region_pixel_count(&self) -> u32 {
        self.region_width() * (self.sub_region[3] - self.sub_region[2] + 1)
    }

    /// Film plane index for a region pixel index.
    fn film_pixel(&self, region_index: u32) -> u32 {
        let x = self.sub_region[0] + region_index % self.region_width();
        let y = self.sub_region[2] + region_index / self.region_width();
        y * self.width + x
    }

    fn radiance_group(&self, group: usize) -> Option<&Arc<DeviceBuffer>> {
        if group >= FILM_MAX_RADIANCE_GROUP_COUNT as usize {
            return None;
        }
        self.view
            .opt_buffer(arg_index::FILM_RADIANCE_GROUP_FIRST + group)
    }
}

//------------------------------------------------------------------------------
// Kernel bodies
//------------------------------------------------------------------------------

impl NativeKernel {
    fn run_init_seed(&self, ctx: &ArgView<'_>, global: u32) -> RenderResult<()> {
        let tasks = ctx.buffer(arg_index::TASKS)?;
        let seed_base = ctx.u32(arg_index::SEED_BASE)?;
        for i in 0..global as usize {
            if i >= pod_count::<PathTask>(tasks) {
                break;
            }
            let task = PathTask {
                seed: Seed::init(seed_base.wrapping_add(i as u32)),
            };
            write_pod(tasks, i, &task);
        }
        Ok(())
    }

    fn run_init(&self, ctx: &ArgView<'_>, global: u32) -> RenderResult<()> {
        let states = ctx.buffer(arg_index::TASKS_STATE)?;
        let stats = ctx.buffer(arg_index::TASK_STATS)?;
        let results = ctx.buffer(arg_index::SAMPLE_RESULTS)?;
        let film = FilmView::new(ctx)?;
        let region_count = film.region_pixel_count().max(1);

        for i in 0..global as usize {
            if i >= pod_count::<PathTaskState>(states) {
                break;
            }
            let state = PathTaskState {
                state: task_state::GENERATE_CAMERA_RAY,
                depth: 0,
                pixel_index: i as u32 % region_count,
                sample_index: 0,
                throughput: [1.0; 3],
                _pad: 0,
            };
            write_pod(states, i, &state);
            write_pod(stats, i, &GpuTaskStats { sample_count: 0 });
            write_pod(results, i, &SampleResult::default());
        }
        Ok(())
    }

    fn run_film_clear(&self, ctx: &ArgView<'_>, global: u32) -> RenderResult<()> {
        FilmView::new(ctx)?;
        let zero_plane = |buf: Option<&Arc<DeviceBuffer>>| {
            if let Some(buf) = buf {
                if let Some(host) = buf.host() {
                    host.lock().unwrap().fill(0);
                }
            }
        };
        // The launch covers the film rounded up to work-group granularity;
        // the whole plane is cleared regardless.
        let _ = global;
        for group in 0..FILM_MAX_RADIANCE_GROUP_COUNT as usize {
            zero_plane(ctx.opt_buffer(arg_index::FILM_RADIANCE_GROUP_FIRST + group));
        }
        zero_plane(ctx.opt_buffer(arg_index::FILM_ALPHA));
        zero_plane(ctx.opt_buffer(arg_index::FILM_DEPTH));
        zero_plane(ctx.opt_buffer(arg_index::FILM_SAMPLE_COUNT));
        zero_plane(ctx.opt_buffer(arg_index::FILM_CONVERGENCE));
        zero_plane(ctx.opt_buffer(arg_index::FILM_NOISE));
        zero_plane(ctx.opt_buffer(arg_index::FILM_USER_IMPORTANCE));
        Ok(())
    }

    fn run_generate_camera_ray(&self, ctx: &ArgView<'_>, global: u32) -> RenderResult<()> {
        let tasks = ctx.buffer(arg_index::TASKS)?;
        let states = ctx.buffer(arg_index::TASKS_STATE)?;
        let rays = ctx.buffer(arg_index::RAYS)?;
        let results = ctx.buffer(arg_index::SAMPLE_RESULTS)?;
        let camera_buf = ctx.buffer(arg_index::CAMERA)?;
        let camera: CompiledCamera = read_pod(camera_buf, 0);
        let film = FilmView::new(ctx)?;
        let height = ctx.u32(arg_index::FILM_HEIGHT)? as f32;
        let width = film.width as f32;

        for i in 0..global as usize {
            if i >= pod_count::<PathTaskState>(states) {
                break;
            }
            let mut state: PathTaskState = read_pod(states, i);
            if state.state != task_state::GENERATE_CAMERA_RAY {
                continue;
            }

            let mut task: PathTask = read_pod(tasks, i);
            let jitter_x = rng_next(&mut task.seed);
            let jitter_y = rng_next(&mut task.seed);
            write_pod(tasks, i, &task);

            let film_pixel = film.film_pixel(state.pixel_index);
            let px = (film_pixel % film.width) as f32;
            let py = (film_pixel / film.width) as f32;
            let film_x = px + jitter_x;
            let film_y = py + jitter_y;

            let ndc_x = 2.0 * film_x / width - 1.0;
            let ndc_y = 1.0 - 2.0 * film_y / height;
            let tan_half = (camera.fov_y * 0.5).tan();
            let aspect = width / height;

            let forward = glam::Vec3::from_array(camera.forward);
            let right = glam::Vec3::from_array(camera.right);
            let up = glam::Vec3::from_array(camera.up);
            let eye = glam::Vec3::from_array(camera.eye);

            let ray = match camera.kind {
                // Orthographic: parallel rays offset across the plane
                1 => Ray {
                    origin: (eye + right * ndc_x * aspect + up * ndc_y).to_array(),
                    tmin: 1e-3,
                    direction: forward.to_array(),
                    tmax: f32::MAX,
                },
                // Environment: latitude/longitude sphere
                2 => {
                    let phi = std::f32::consts::PI * (ndc_x + 1.0);
                    let theta = std::f32::consts::FRAC_PI_2 * ndc_y;
                    let dir = glam::Vec3::new(
                        theta.cos() * phi.sin(),
                        theta.sin(),
                        theta.cos() * phi.cos(),
                    );
                    Ray {
                        origin: eye.to_array(),
                        tmin: 1e-3,
                        direction: dir.to_array(),
                        tmax: f32::MAX,
                    }
                }
                // Perspective and stereo (stereo alternates the eye offset)
                _ => {
                    let eye = if camera.kind == 3 && i % 2 == 1 {
                        eye + right * 0.03
                    } else {
                        eye
                    };
                    let dir = (forward + right * ndc_x * tan_half * aspect + up * ndc_y * tan_half)
                        .normalize_or_zero();
                    Ray {
                        origin: eye.to_array(),
                        tmin: 1e-3,
                        direction: dir.to_array(),
                        tmax: f32::MAX,
                    }
                }
            };
            write_pod(rays, i, &ray);

            let result = SampleResult {
                film_x,
                film_y,
                pixel_index: state.pixel_index,
                radiance_group: 0,
                radiance: [0.0; 3],
                weight: 1.0,
                alpha: 0.0,
                depth: 0.0,
                _pad: [0; 2],
            };
            write_pod(results, i, &result);

            state.state = task_state::RT_NEXT_VERTEX;
            write_pod(states, i, &state);
        }
        Ok(())
    }

    fn run_rt_next_vertex(&self, ctx: &ArgView<'_>, global: u32) -> RenderResult<()> {
        let states = ctx.buffer(arg_index::TASKS_STATE)?;
        let rays = ctx.buffer(arg_index::RAYS)?;
        let hits = ctx.buffer(arg_index::HITS)?;

        for i in 0..global as usize {
            if i >= pod_count::<PathTaskState>(states) {
                break;
            }
            let mut state: PathTaskState = read_pod(states, i);
            if state.state != task_state::RT_NEXT_VERTEX {
                continue;
            }
            let ray: Ray = read_pod(rays, i);
            let hit = self.intersector.intersect(&ray);
            write_pod(hits, i, &hit);
            state.state = if hit.is_miss() {
                task_state::HIT_NOTHING
            } else {
                task_state::HIT_OBJECT
            };
            write_pod(states, i, &state);
        }
        Ok(())
    }

    fn run_hit_nothing(&self, ctx: &ArgView<'_>, global: u32) -> RenderResult<()> {
        let states = ctx.buffer(arg_index::TASKS_STATE)?;
        let results = ctx.buffer(arg_index::SAMPLE_RESULTS)?;
        let lights = ctx.opt_buffer(arg_index::LIGHTS);
        let env_indices = ctx.opt_buffer(arg_index::ENV_LIGHT_INDICES);
        let env_count = ctx.u32(arg_index::ENV_LIGHT_COUNT)? as usize;

        for i in 0..global as usize {
            if i >= pod_count::<PathTaskState>(states) {
                break;
            }
            let mut state: PathTaskState = read_pod(states, i);
            if state.state != task_state::HIT_NOTHING {
                continue;
            }

            let background_visible = !(self.config.force_black_background && state.depth == 0);
            if background_visible && self.config.has_env_lights {
                if let (Some(lights), Some(env_indices)) = (lights, env_indices) {
                    let mut result: SampleResult = read_pod(results, i);
                    for e in 0..env_count {
                        let light_index: u32 = read_pod(env_indices, e);
                        let light: CompiledLight = read_pod(lights, light_index as usize);
                        for c in 0..3 {
                            result.radiance[c] += state.throughput[c] * light.emission[c];
                        }
                    }
                    result.alpha = 0.0;
                    write_pod(results, i, &result);
                }
            }

            state.state = task_state::SPLAT_SAMPLE;
            write_pod(states, i, &state);
        }
        Ok(())
    }

    fn run_hit_object(&self, ctx: &ArgView<'_>, global: u32) -> RenderResult<()> {
        let states = ctx.buffer(arg_index::TASKS_STATE)?;
        let results = ctx.buffer(arg_index::SAMPLE_RESULTS)?;
        let hits = ctx.buffer(arg_index::HITS)?;
        let materials = ctx.opt_buffer(arg_index::MATERIALS);
        let scene_objs = ctx.opt_buffer(arg_index::SCENE_OBJECTS);

        for i in 0..global as usize {
            if i >= pod_count::<PathTaskState>(states) {
                break;
            }
            let mut state: PathTaskState = read_pod(states, i);
            if state.state != task_state::HIT_OBJECT {
                continue;
            }

            let hit: RayHit = read_pod(hits, i);
            let mut result: SampleResult = read_pod(results, i);
            if let (Some(materials), Some(scene_objs)) = (materials, scene_objs) {
                if (hit.mesh_index as usize) < pod_count::<CompiledSceneObject>(scene_objs) {
                    let obj: CompiledSceneObject = read_pod(scene_objs, hit.mesh_index as usize);
                    if (obj.material_index as usize) < pod_count::<CompiledMaterial>(materials) {
                        let mat: CompiledMaterial = read_pod(materials, obj.material_index as usize);
                        for c in 0..3 {
                            result.radiance[c] += state.throughput[c] * mat.emission[c];
                        }
                    }
                }
            }
            result.alpha = 1.0;
            result.depth = hit.t;
            write_pod(results, i, &result);

            state.state = task_state::DL_ILLUMINATE;
            write_pod(states, i, &state);
        }
        Ok(())
    }

    fn run_dl_illuminate(&self, ctx: &ArgView<'_>, global: u32) -> RenderResult<()> {
        let states = ctx.buffer(arg_index::TASKS_STATE)?;
        let tasks = ctx.buffer(arg_index::TASKS)?;
        let dl_tasks = ctx.buffer(arg_index::TASKS_DIRECT_LIGHT)?;
        let rays = ctx.buffer(arg_index::RAYS)?;
        let hits = ctx.buffer(arg_index::HITS)?;
        let lights = ctx.opt_buffer(arg_index::LIGHTS);

        for i in 0..global as usize {
            if i >= pod_count::<PathTaskState>(states) {
                break;
            }
            let mut state: PathTaskState = read_pod(states, i);
            if state.state != task_state::DL_ILLUMINATE {
                continue;
            }

            let light_count = lights.map_or(0, pod_count::<CompiledLight>);
            if light_count == 0 {
                state.state = task_state::GENERATE_NEXT_VERTEX_RAY;
                write_pod(states, i, &state);
                continue;
            }

            let mut task: PathTask = read_pod(tasks, i);
            let pick = (rng_next(&mut task.seed) * light_count as f32) as usize % light_count;
            write_pod(tasks, i, &task);

            let light: CompiledLight = read_pod(lights.unwrap(), pick);
            let ray: Ray = read_pod(rays, i);
            let hit: RayHit = read_pod(hits, i);
            let hit_point = [
                ray.origin[0] + ray.direction[0] * hit.t,
                ray.origin[1] + ray.direction[1] * hit.t,
                ray.origin[2] + ray.direction[2] * hit.t,
            ];
            let to_light = [
                light.position[0] - hit_point[0],
                light.position[1] - hit_point[1],
                light.position[2] - hit_point[2],
            ];
            let dist = (to_light[0] * to_light[0]
                + to_light[1] * to_light[1]
                + to_light[2] * to_light[2])
                .sqrt()
                .max(1e-6);

            let dl = DirectLightTask {
                radiance: light.emission,
                light_index: pick as u32,
                shadow_ray: Ray {
                    origin: hit_point,
                    tmin: 1e-3,
                    direction: [
                        to_light[0] / dist,
                        to_light[1] / dist,
                        to_light[2] / dist,
                    ],
                    tmax: dist - 1e-3,
                },
                result: 0,
                _pad: [0; 3],
            };
            write_pod(dl_tasks, i, &dl);

            state.state = task_state::RT_DL;
            write_pod(states, i, &state);
        }
        Ok(())
    }

    fn run_rt_dl(&self, ctx: &ArgView<'_>, global: u32) -> RenderResult<()> {
        let states = ctx.buffer(arg_index::TASKS_STATE)?;
        let dl_tasks = ctx.buffer(arg_index::TASKS_DIRECT_LIGHT)?;
        let results = ctx.buffer(arg_index::SAMPLE_RESULTS)?;

        for i in 0..global as usize {
            if i >= pod_count::<PathTaskState>(states) {
                break;
            }
            let mut state: PathTaskState = read_pod(states, i);
            if state.state != task_state::RT_DL {
                continue;
            }

            let mut dl: DirectLightTask = read_pod(dl_tasks, i);
            let shadow_hit = self.intersector.intersect(&dl.shadow_ray);
            dl.result = shadow_hit.is_miss() as u32;
            write_pod(dl_tasks, i, &dl);

            if dl.result == 1 {
                let mut result: SampleResult = read_pod(results, i);
                for c in 0..3 {
                    result.radiance[c] += state.throughput[c] * dl.radiance[c];
                }
                write_pod(results, i, &result);
            }

            state.state = task_state::DL_SAMPLE_BSDF;
            write_pod(states, i, &state);
        }
        Ok(())
    }

    fn run_dl_sample_bsdf(&self, ctx: &ArgView<'_>, global: u32) -> RenderResult<()> {
        let states = ctx.buffer(arg_index::TASKS_STATE)?;

        for i in 0..global as usize {
            if i >= pod_count::<PathTaskState>(states) {
                break;
            }
            let mut state: PathTaskState = read_pod(states, i);
            if state.state != task_state::DL_SAMPLE_BSDF {
                continue;
            }
            // Scatter evaluation is a collaborator concern; the path moves
            // on to its continuation decision.
            state.state = task_state::GENERATE_NEXT_VERTEX_RAY;
            write_pod(states, i, &state);
        }
        Ok(())
    }

    fn run_generate_next_vertex_ray(&self, ctx: &ArgView<'_>, global: u32) -> RenderResult<()> {
        let states = ctx.buffer(arg_index::TASKS_STATE)?;

        for i in 0..global as usize {
            if i >= pod_count::<PathTaskState>(states) {
                break;
            }
            let mut state: PathTaskState = read_pod(states, i);
            if state.state != task_state::GENERATE_NEXT_VERTEX_RAY {
                continue;
            }
            // Scatter evaluation is a collaborator concern, so every path
            // terminates at its first vertex; the depth cap bounds any
            // collaborator-driven continuation.
            state.depth = (state.depth + 1).min(self.config.max_path_depth);
            state.state = task_state::SPLAT_SAMPLE;
            write_pod(states, i, &state);
        }
        Ok(())
    }

    fn run_splat_sample(&self, ctx: &ArgView<'_>, global: u32) -> RenderResult<()> {
        let states = ctx.buffer(arg_index::TASKS_STATE)?;
        let stats = ctx.buffer(arg_index::TASK_STATS)?;
        let results = ctx.buffer(arg_index::SAMPLE_RESULTS)?;
        let film = FilmView::new(ctx)?;

        for i in 0..global as usize {
            if i >= pod_count::<PathTaskState>(states) {
                break;
            }
            let mut state: PathTaskState = read_pod(states, i);
            if state.state != task_state::SPLAT_SAMPLE {
                continue;
            }

            let result: SampleResult = read_pod(results, i);
            let pixel = film.film_pixel(result.pixel_index) as usize;

            if let Some(plane) = film.radiance_group(result.radiance_group as usize) {
                let host = plane.host().expect("native buffer");
                let mut data = host.lock().unwrap();
                let floats: &mut [f32] = bytemuck::cast_slice_mut(&mut data[..]);
                floats[pixel * 4] += result.radiance[0] * result.weight;
                floats[pixel * 4 + 1] += result.radiance[1] * result.weight;
                floats[pixel * 4 + 2] += result.radiance[2] * result.weight;
                floats[pixel * 4 + 3] += result.weight;
            }
            if let Some(plane) = ctx.opt_buffer(arg_index::FILM_ALPHA) {
                let host = plane.host().expect("native buffer");
                let mut data = host.lock().unwrap();
                let floats: &mut [f32] = bytemuck::cast_slice_mut(&mut data[..]);
                floats[pixel * 2] += result.alpha * result.weight;
                floats[pixel * 2 + 1] += result.weight;
            }
            if let Some(plane) = ctx.opt_buffer(arg_index::FILM_DEPTH) {
                let host = plane.host().expect("native buffer");
                let mut data = host.lock().unwrap();
                let floats: &mut [f32] = bytemuck::cast_slice_mut(&mut data[..]);
                if result.depth > 0.0 && (floats[pixel] == 0.0 || result.depth < floats[pixel]) {
                    floats[pixel] = result.depth;
                }
            }
            if let Some(plane) = ctx.opt_buffer(arg_index::FILM_SAMPLE_COUNT) {
                let host = plane.host().expect("native buffer");
                let mut data = host.lock().unwrap();
                let floats: &mut [f32] = bytemuck::cast_slice_mut(&mut data[..]);
                floats[pixel] += 1.0;
            }

            let mut stat: GpuTaskStats = read_pod(stats, i);
            stat.sample_count += 1;
            write_pod(stats, i, &stat);

            state.state = task_state::NEXT_SAMPLE;
            write_pod(states, i, &state);
        }
        Ok(())
    }

    fn run_next_sample(&self, ctx: &ArgView<'_>, global: u32) -> RenderResult<()> {
        let states = ctx.buffer(arg_index::TASKS_STATE)?;
        let task_count = ctx.u32(arg_index::TASK_COUNT)?;
        let film = FilmView::new(ctx)?;
        let region_count = film.region_pixel_count().max(1);

        for i in 0..global as usize {
            if i >= pod_count::<PathTaskState>(states) {
                break;
            }
            let mut state: PathTaskState = read_pod(states, i);
            if state.state != task_state::NEXT_SAMPLE {
                continue;
            }
            state.pixel_index = (state.pixel_index + task_count) % region_count;
            state.sample_index += 1;
            state.depth = 0;
            state.throughput = [1.0; 3];
            state.state = task_state::GENERATE_CAMERA_RAY;
            write_pod(states, i, &state);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parses_from_params() {
        let config = NativeKernelConfig::from_params(
            " -D PARAM_SAMPLER_TYPE=1 -D PARAM_MAX_PATH_DEPTH=6 -D PARAM_HAS_ENVLIGHTS -D PARAM_CAMERA_TYPE=0",
        );
        assert_eq!(config.sampler_kind, 1);
        assert_eq!(config.max_path_depth, 6);
        assert!(config.has_env_lights);
        assert!(!config.force_black_background);
    }

    #[test]
    fn ro_alloc_reuses_same_size_buffer() {
        let device = NativeDevice::new("cpu-test");
        let mut slot = BufferSlot::new();
        device
            .alloc_buffer_ro(&mut slot, &[1, 2, 3, 4], BufferRole::Lights)
            .unwrap();
        let first_id = slot.id().unwrap();

        device
            .alloc_buffer_ro(&mut slot, &[5, 6, 7, 8], BufferRole::Lights)
            .unwrap();
        assert_eq!(slot.id().unwrap(), first_id);

        let mut back = [0u8; 4];
        device
            .enqueue_read_buffer(slot.get().unwrap(), true, &mut back)
            .unwrap();
        assert_eq!(back, [5, 6, 7, 8]);

        device
            .alloc_buffer_ro(&mut slot, &[9, 9], BufferRole::Lights)
            .unwrap();
        assert_ne!(slot.id().unwrap(), first_id);
        assert_eq!(slot.size(), 2);
    }

    #[test]
    fn program_blob_round_trips() {
        let device = NativeDevice::new("cpu-test");
        let blob = device
            .compile_program(" -D PARAM_MAX_PATH_DEPTH=3", "fn main() {}")
            .unwrap();
        let program = device.load_program(&blob).unwrap();
        let kernel = program.kernel("init").unwrap();
        assert_eq!(kernel.name(), "init");
        assert!(program.kernel("no_such_kernel").is_err());
    }

    #[test]
    fn empty_source_fails_to_compile() {
        let device = NativeDevice::new("cpu-test");
        let err = device.compile_program("", "").unwrap_err();
        assert!(matches!(err, RenderError::KernelCompile(_)));
    }
}
