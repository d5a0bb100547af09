//! Kernel entry points and the shared argument layout
//!
//! Every path-tracing step is a separate compiled entry point; all of them
//! share one argument list bound in a fixed, engine-defined ordinal order.
//! The launch order of the advance-paths micro kernels is fixed per
//! iteration.

pub mod cache;
pub mod params;
pub mod source;

use crate::device::{Kernel, Program};
use crate::error::RenderResult;

/// Kernel entry points, one per path-tracing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MicroKernel {
    InitSeed,
    Init,
    FilmClear,
    RtNextVertex,
    HitNothing,
    HitObject,
    RtDirectLight,
    DirectLightIlluminate,
    DirectLightSampleBsdf,
    GenerateNextVertexRay,
    SplatSample,
    NextSample,
    GenerateCameraRay,
}

impl MicroKernel {
    pub fn entry_name(self) -> &'static str {
        match self {
            MicroKernel::InitSeed => "init_seed",
            MicroKernel::Init => "init",
            MicroKernel::FilmClear => "film_clear",
            MicroKernel::RtNextVertex => "advance_paths_rt_next_vertex",
            MicroKernel::HitNothing => "advance_paths_hit_nothing",
            MicroKernel::HitObject => "advance_paths_hit_object",
            MicroKernel::RtDirectLight => "advance_paths_rt_dl",
            MicroKernel::DirectLightIlluminate => "advance_paths_dl_illuminate",
            MicroKernel::DirectLightSampleBsdf => "advance_paths_dl_sample_bsdf",
            MicroKernel::GenerateNextVertexRay => "advance_paths_generate_next_vertex_ray",
            MicroKernel::SplatSample => "advance_paths_splat_sample",
            MicroKernel::NextSample => "advance_paths_next_sample",
            MicroKernel::GenerateCameraRay => "advance_paths_generate_camera_ray",
        }
    }

    /// The advance-paths micro kernels in their fixed launch order.
    pub fn advance_paths_order() -> &'static [MicroKernel] {
        &[
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
    }
}

/// The fixed ordinal positions of the shared kernel argument list.
///
/// Init and every advance-paths kernel bind this exact list; the film-clear
/// kernel binds only the film block (see `ThreadFilm`). Changing an ordinal
/// is an ABI change against the WGSL side.
pub mod arg_index {
    // Per-task block
    pub const TASK_CONFIG: usize = 0;
    pub const TASKS: usize = 1;
    pub const TASKS_DIRECT_LIGHT: usize = 2;
    pub const TASKS_STATE: usize = 3;
    pub const TASK_STATS: usize = 4;
    pub const PIXEL_FILTER: usize = 5;
    pub const SAMPLER_SHARED: usize = 6;
    pub const SAMPLES: usize = 7;
    pub const SAMPLE_DATA: usize = 8;
    pub const SAMPLE_RESULTS: usize = 9;
    pub const EYE_PATH_INFOS: usize = 10;
    pub const DIRECT_LIGHT_VOL_INFOS: usize = 11;
    pub const RAYS: usize = 12;
    pub const HITS: usize = 13;

    // Film block (width/height/sub-region scalars, then planes)
    pub const FILM_WIDTH: usize = 14;
    pub const FILM_HEIGHT: usize = 15;
    pub const FILM_SUB_REGION_0: usize = 16;
    pub const FILM_SUB_REGION_1: usize = 17;
    pub const FILM_SUB_REGION_2: usize = 18;
    pub const FILM_SUB_REGION_3: usize = 19;
    pub const FILM_RADIANCE_GROUP_FIRST: usize = 20;
    // .. one slot per group up to FILM_MAX_RADIANCE_GROUP_COUNT (8)
    pub const FILM_ALPHA: usize = 28;
    pub const FILM_DEPTH: usize = 29;
    pub const FILM_SAMPLE_COUNT: usize = 30;
    pub const FILM_CONVERGENCE: usize = 31;
    pub const FILM_NOISE: usize = 32;
    pub const FILM_USER_IMPORTANCE: usize = 33;

    // Scene block
    pub const CAMERA: usize = 34;
    pub const MATERIALS: usize = 35;
    pub const TEXTURES: usize = 36;
    pub const SCENE_OBJECTS: usize = 37;
    pub const MESH_DESCS: usize = 38;
    pub const VERTICES: usize = 39;
    pub const NORMALS: usize = 40;
    pub const TRIANGLE_NORMALS: usize = 41;
    pub const UVS: usize = 42;
    pub const TRIANGLES: usize = 43;
    pub const LIGHTS: usize = 44;
    pub const ENV_LIGHT_INDICES: usize = 45;
    pub const ENV_LIGHT_COUNT: usize = 46;
    pub const LIGHTS_DISTRIBUTION: usize = 47;
    pub const IMAGE_MAP_DESCS: usize = 48;
    pub const IMAGE_MAP_PAGE_FIRST: usize = 49;
    // .. one slot per page up to MAX_IMAGE_MAP_PAGES (8)
    pub const PGIC_RADIANCE_PHOTONS: usize = 57;
    pub const PGIC_CAUSTIC_PHOTONS: usize = 58;

    // Scene scalars
    pub const WORLD_CENTER_X: usize = 59;
    pub const WORLD_CENTER_Y: usize = 60;
    pub const WORLD_CENTER_Z: usize = 61;
    pub const WORLD_RADIUS: usize = 62;

    // Thread scalars
    pub const SEED_BASE: usize = 63;
    pub const TASK_COUNT: usize = 64;

    pub const COUNT: usize = 65;
}

/// The compiled entry points a render thread launches, bound as a set.
///
/// Rebuilt whenever the program changes; the per-group work sizes are the
/// minimum of the member kernels' preferred sizes, computed once here.
pub struct KernelSet {
    pub init_seed: Box<dyn Kernel>,
    pub init: Box<dyn Kernel>,
    pub film_clear: Box<dyn Kernel>,
    /// Indexed in `MicroKernel::advance_paths_order()` order.
    pub advance_paths: Vec<Box<dyn Kernel>>,
    pub init_work_group_size: u32,
    pub film_clear_work_group_size: u32,
    pub advance_paths_work_group_size: u32,
}

impl KernelSet {
    pub fn from_program(program: &dyn Program) -> RenderResult<Self> {
        let init_seed = program.kernel(MicroKernel::InitSeed.entry_name())?;
        let init = program.kernel(MicroKernel::Init.entry_name())?;
        let film_clear = program.kernel(MicroKernel::FilmClear.entry_name())?;

        let mut advance_paths = Vec::new();
        let mut advance_wg = u32::MAX;
        for mk in MicroKernel::advance_paths_order() {
            let kernel = program.kernel(mk.entry_name())?;
            advance_wg = advance_wg.min(kernel.preferred_work_group_size());
            advance_paths.push(kernel);
        }

        let init_work_group_size = init_seed
            .preferred_work_group_size()
            .min(init.preferred_work_group_size());
        let film_clear_work_group_size = film_clear.preferred_work_group_size();

        Ok(KernelSet {
            init_seed,
            init,
            film_clear,
            advance_paths,
            init_work_group_size,
            film_clear_work_group_size,
            advance_paths_work_group_size: advance_wg,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_paths_order_is_complete_and_fixed() {
        let order = MicroKernel::advance_paths_order();
        assert_eq!(order.len(), 10);
        assert_eq!(order[0], MicroKernel::RtNextVertex);
        assert_eq!(order[9], MicroKernel::GenerateCameraRay);
    }

    #[test]
    fn arg_layout_has_no_overlaps() {
        use arg_index::*;
        assert_eq!(FILM_RADIANCE_GROUP_FIRST + 8, FILM_ALPHA);
        assert_eq!(IMAGE_MAP_PAGE_FIRST + 8, PGIC_RADIANCE_PHOTONS);
        assert_eq!(TASK_COUNT + 1, COUNT);
    }
}
