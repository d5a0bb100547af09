//! trace3d: the compute-orchestration core of a wavefront path tracer.
//!
//! Drives image synthesis across a heterogeneous pool of compute devices
//! (wgpu compute devices plus CPU fallback threads), each running the same
//! micro-kernel pipeline against a shared, device-resident copy of the
//! scene. The crate covers render-thread / device / buffer lifecycle
//! management, kernel source assembly with a persistent compilation cache,
//! and the partial-framebuffer merge into one authoritative film.
//!
//! Ray generation math, BSDF evaluation, mesh refinement, scene parsing,
//! image decoding and acceleration-structure traversal are consumed as
//! opaque collaborators.

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod film;
pub mod gpu;
pub mod kernel;
pub mod scene;

pub use config::{
    AcceleratorType, FilterType, KernelCacheMode, RenderConfig, SamplerType,
};
pub use engine::{EngineState, RenderEngine};
pub use error::{RenderError, RenderResult};
pub use film::{Film, FilmChannel, ImagePipeline, RadianceChannelScale, ThreadFilm};
pub use scene::{CompiledScene, EditActionList, Scene};
