//! GPU task state and configuration
//!
//! A path task is one unit of concurrent work: an index into the flat
//! ray/hit/state/sample arrays advanced across kernel launches until a
//! pixel sample completes. Structs here match the WGSL kernel layout.

use bytemuck::{Pod, Zeroable};

use crate::config::RenderConfig;
use crate::film::Film;
use crate::scene::CompiledScene;

/// Path state machine values shared with the micro kernels.
pub mod task_state {
    pub const GENERATE_CAMERA_RAY: u32 = 0;
    pub const RT_NEXT_VERTEX: u32 = 1;
    pub const HIT_NOTHING: u32 = 2;
    pub const HIT_OBJECT: u32 = 3;
    pub const RT_DL: u32 = 4;
    pub const DL_ILLUMINATE: u32 = 5;
    pub const DL_SAMPLE_BSDF: u32 = 6;
    pub const GENERATE_NEXT_VERTEX_RAY: u32 = 7;
    pub const SPLAT_SAMPLE: u32 = 8;
    pub const NEXT_SAMPLE: u32 = 9;
    pub const DONE: u32 = 10;
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct Ray {
    pub origin: [f32; 3],
    pub tmin: f32,
    pub direction: [f32; 3],
    pub tmax: f32,
}

/// Intersection result; `mesh_index == u32::MAX` marks a miss.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct RayHit {
    pub t: f32,
    pub b1: f32,
    pub b2: f32,
    pub mesh_index: u32,
    pub tri_index: u32,
    pub _pad: [u32; 3],
}

impl RayHit {
    pub fn miss() -> Self {
        RayHit {
            mesh_index: u32::MAX,
            ..Default::default()
        }
    }

    pub fn is_miss(&self) -> bool {
        self.mesh_index == u32::MAX
    }
}

/// Tausworthe generator state, one per task.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct Seed {
    pub s1: u32,
    pub s2: u32,
    pub s3: u32,
    pub _pad: u32,
}

impl Seed {
    pub fn init(value: u32) -> Self {
        // Each word must stay above the generator's threshold
        let v = value.wrapping_mul(2654435761).max(128);
        Seed {
            s1: v.max(2),
            s2: v.rotate_left(8).max(8),
            s3: v.rotate_left(16).max(16),
            _pad: 0,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct PathTask {
    pub seed: Seed,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct PathTaskState {
    pub state: u32,
    pub depth: u32,
    pub pixel_index: u32,
    pub sample_index: u32,
    pub throughput: [f32; 3],
    pub _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct DirectLightTask {
    pub radiance: [f32; 3],
    pub light_index: u32,
    pub shadow_ray: Ray,
    pub result: u32,
    pub _pad: [u32; 3],
}

/// One completed (or in-flight) sample's contribution.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct SampleResult {
    pub film_x: f32,
    pub film_y: f32,
    pub pixel_index: u32,
    pub radiance_group: u32,
    pub radiance: [f32; 3],
    pub weight: f32,
    pub alpha: f32,
    pub depth: f32,
    pub _pad: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct EyePathInfo {
    pub depth_diffuse: u32,
    pub depth_glossy: u32,
    pub depth_specular: u32,
    pub is_passthrough: u32,
    pub last_pdf: f32,
    pub last_glossiness: f32,
    pub _pad: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct GpuTaskStats {
    pub sample_count: u32,
}

//------------------------------------------------------------------------------
// GPU task configuration
//------------------------------------------------------------------------------

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct SamplerTaskConfig {
    pub kind: u32,
    pub adaptive_strength: f32,
    pub large_mutation_probability: f32,
    pub image_mutation_range: f32,
    pub max_consecutive_rejects: u32,
    pub _pad: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct PathTaskConfig {
    pub max_depth: u32,
    pub max_diffuse_depth: u32,
    pub max_glossy_depth: u32,
    pub max_specular_depth: u32,
    pub rr_depth: u32,
    pub rr_importance_cap: f32,
    pub sqrt_variance_clamp_max_value: f32,
    pub force_black_background: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct FilterTaskConfig {
    pub kind: u32,
    pub width_x: f32,
    pub width_y: f32,
    pub gaussian_alpha: f32,
    pub pixel_width_x: u32,
    pub pixel_width_y: u32,
    pub _pad: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct FilmTaskConfig {
    pub radiance_group_count: u32,
    pub channel_flags: u32,
    pub use_pixel_atomics: u32,
    pub _pad: u32,
}

/// Immutable-per-edit-epoch bundle read by every in-flight path task.
///
/// Rebuilt whenever a contributing subsystem changes; uploaded read-only.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct GpuTaskConfiguration {
    pub default_volume_index: u32,
    pub _pad: [u32; 3],
    pub sampler: SamplerTaskConfig,
    pub path: PathTaskConfig,
    pub filter: FilterTaskConfig,
    pub film: FilmTaskConfig,
}

impl GpuTaskConfiguration {
    pub fn derive(config: &RenderConfig, cscene: &CompiledScene, film: &Film) -> Self {
        let mut channel_flags = 0;
        for channel in film.channels() {
            channel_flags |= channel.flag_bit();
        }

        GpuTaskConfiguration {
            default_volume_index: cscene.default_volume_index,
            _pad: [0; 3],
            sampler: SamplerTaskConfig {
                kind: config.sampler.sampler_type.id(),
                adaptive_strength: config.sampler.adaptive_strength,
                large_mutation_probability: config.sampler.large_mutation_probability,
                image_mutation_range: config.sampler.image_mutation_range,
                max_consecutive_rejects: config.sampler.max_consecutive_rejects,
                _pad: [0; 3],
            },
            path: PathTaskConfig {
                max_depth: config.path.max_depth,
                max_diffuse_depth: config.path.max_diffuse_depth,
                max_glossy_depth: config.path.max_glossy_depth,
                max_specular_depth: config.path.max_specular_depth,
                rr_depth: config.path.rr_depth,
                rr_importance_cap: config.path.rr_importance_cap,
                sqrt_variance_clamp_max_value: config.path.sqrt_variance_clamp_max_value,
                force_black_background: config.path.force_black_background as u32,
            },
            filter: FilterTaskConfig {
                kind: config.filter.filter_type.id(),
                width_x: config.filter.width_x,
                width_y: config.filter.width_y,
                gaussian_alpha: config.filter.gaussian_alpha,
                pixel_width_x: (config.filter.width_x * 0.5 + 0.5).floor() as u32,
                pixel_width_y: (config.filter.width_y * 0.5 + 0.5).floor() as u32,
                _pad: [0; 2],
            },
            film: FilmTaskConfig {
                radiance_group_count: film.radiance_group_count(),
                channel_flags,
                use_pixel_atomics: config.use_pixel_atomics as u32,
                _pad: 0,
            },
        }
    }
}

//------------------------------------------------------------------------------
// Buffer sizing
//------------------------------------------------------------------------------

/// Pixel filter importance table resolution per axis.
pub const FILTER_DISTRIBUTION_RES: usize = 64;

/// Filter importance distribution uploaded once per start.
pub fn build_filter_distribution(filter: &FilterTaskConfig) -> Vec<f32> {
    let res = FILTER_DISTRIBUTION_RES;
    let mut table = vec![0.0f32; res * res];
    for y in 0..res {
        for x in 0..res {
            // Position in filter space, [-width/2, width/2]
            let fx = (x as f32 + 0.5) / res as f32 - 0.5;
            let fy = (y as f32 + 0.5) / res as f32 - 0.5;
            let v = match filter.kind {
                0 => 1.0,
                1 => 1.0,
                2 => {
                    let a = filter.gaussian_alpha;
                    let gx = (-a * fx * fx).exp();
                    let gy = (-a * fy * fy).exp();
                    gx * gy
                }
                _ => {
                    // Windowed filters share the cosine-window shape here
                    let wx = (std::f32::consts::PI * (fx + 0.5)).sin();
                    let wy = (std::f32::consts::PI * (fy + 0.5)).sin();
                    (wx * wy).max(0.0)
                }
            };
            table[y * res + x] = v;
        }
    }
    table
}

pub fn path_task_size() -> u64 {
    std::mem::size_of::<PathTask>() as u64
}

pub fn path_task_state_size() -> u64 {
    std::mem::size_of::<PathTaskState>() as u64
}

pub fn direct_light_task_size() -> u64 {
    std::mem::size_of::<DirectLightTask>() as u64
}

pub fn sample_result_size() -> u64 {
    std::mem::size_of::<SampleResult>() as u64
}

pub fn eye_path_info_size() -> u64 {
    std::mem::size_of::<EyePathInfo>() as u64
}

/// Per-task sampler state size in bytes.
pub fn sample_size(sampler_kind: u32) -> u64 {
    match sampler_kind {
        // Random / Sobol: screen x/y plus the pass counter
        0 | 1 => 3 * 4,
        // Metropolis: current and proposed sample plus bookkeeping
        _ => (2 * 2 + 5) * 4 + sample_result_size(),
    }
}

/// Shared sampler data size for the film sub-region.
pub fn sampler_shared_data_size(sampler_kind: u32, film_region_pixel_count: u32) -> u64 {
    match sampler_kind {
        // Random: bucket index + adaptive settings
        0 => 3 * 4,
        // Sobol: header plus one pass word per pixel in the region
        1 => 4 * 4 + 4 * film_region_pixel_count as u64,
        // Metropolis keeps everything per-task
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::film::FilmChannel;
    use crate::scene::Scene;

    #[test]
    fn pod_sizes_are_stable() {
        assert_eq!(std::mem::size_of::<Ray>(), 32);
        assert_eq!(std::mem::size_of::<RayHit>(), 32);
        assert_eq!(std::mem::size_of::<PathTaskState>(), 32);
        assert_eq!(std::mem::size_of::<SampleResult>(), 48);
        assert_eq!(std::mem::size_of::<GpuTaskStats>(), 4);
        assert_eq!(std::mem::size_of::<GpuTaskConfiguration>() % 16, 0);
    }

    #[test]
    fn task_config_reflects_film_channels() {
        let scene = Scene::new();
        let cscene = CompiledScene::compile(&scene, 1 << 20).unwrap();
        let film = Film::new(8, 8);
        let config = RenderConfig::default();
        let tc = GpuTaskConfiguration::derive(&config, &cscene, &film);
        assert_eq!(tc.film.radiance_group_count, 1);
        assert_ne!(
            tc.film.channel_flags & FilmChannel::RadiancePerPixelNormalized.flag_bit(),
            0
        );
        assert_eq!(tc.film.channel_flags & FilmChannel::Depth.flag_bit(), 0);
    }

    #[test]
    fn sobol_shared_data_scales_with_region() {
        let small = sampler_shared_data_size(1, 16);
        let large = sampler_shared_data_size(1, 64);
        assert_eq!(large - small, 4 * 48);
    }

    #[test]
    fn filter_distribution_has_fixed_resolution() {
        let filter = FilterTaskConfig {
            kind: 2,
            width_x: 2.0,
            width_y: 2.0,
            gaussian_alpha: 2.0,
            ..Default::default()
        };
        let table = build_filter_distribution(&filter);
        assert_eq!(table.len(), FILTER_DISTRIBUTION_RES * FILTER_DISTRIBUTION_RES);
        // Center of a Gaussian beats the corner
        let center = table[(FILTER_DISTRIBUTION_RES / 2) * FILTER_DISTRIBUTION_RES
            + FILTER_DISTRIBUTION_RES / 2];
        assert!(center > table[0]);
    }
}
