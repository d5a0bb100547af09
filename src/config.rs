//! Render configuration
//!
//! Deserializable settings consumed once at engine start; the derived
//! `GpuTaskConfiguration` value object (see `engine::tasks`) is what the
//! in-flight path tasks actually read.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{RenderError, RenderResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplerType {
    Random,
    Sobol,
    Metropolis,
}

impl SamplerType {
    pub fn id(self) -> u32 {
        match self {
            SamplerType::Random => 0,
            SamplerType::Sobol => 1,
            SamplerType::Metropolis => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterType {
    None,
    Box,
    Gaussian,
    Mitchell,
    BlackmanHarris,
}

impl FilterType {
    pub fn id(self) -> u32 {
        match self {
            FilterType::None => 0,
            FilterType::Box => 1,
            FilterType::Gaussian => 2,
            FilterType::Mitchell => 3,
            FilterType::BlackmanHarris => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcceleratorType {
    Bvh,
    Mbvh,
    /// CPU-only accelerator; rejected by the device kernel path.
    Embree,
}

impl AcceleratorType {
    pub fn name(self) -> &'static str {
        match self {
            AcceleratorType::Bvh => "BVH",
            AcceleratorType::Mbvh => "MBVH",
            AcceleratorType::Embree => "EMBREE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelCacheMode {
    Persistent,
    Volatile,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerSettings {
    pub sampler_type: SamplerType,
    pub adaptive_strength: f32,
    /// Metropolis: probability of a large mutation step.
    pub large_mutation_probability: f32,
    /// Metropolis: image-space mutation range.
    pub image_mutation_range: f32,
    /// Metropolis: consecutive rejects before a forced large step.
    pub max_consecutive_rejects: u32,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        SamplerSettings {
            sampler_type: SamplerType::Sobol,
            adaptive_strength: 0.95,
            large_mutation_probability: 0.4,
            image_mutation_range: 0.1,
            max_consecutive_rejects: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSettings {
    pub filter_type: FilterType,
    pub width_x: f32,
    pub width_y: f32,
    pub gaussian_alpha: f32,
}

impl Default for FilterSettings {
    fn default() -> Self {
        FilterSettings {
            filter_type: FilterType::BlackmanHarris,
            width_x: 2.0,
            width_y: 2.0,
            gaussian_alpha: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    pub max_depth: u32,
    pub max_diffuse_depth: u32,
    pub max_glossy_depth: u32,
    pub max_specular_depth: u32,
    /// Depth at which Russian roulette starts.
    pub rr_depth: u32,
    pub rr_importance_cap: f32,
    pub sqrt_variance_clamp_max_value: f32,
    pub force_black_background: bool,
}

impl Default for PathSettings {
    fn default() -> Self {
        PathSettings {
            max_depth: 6,
            max_diffuse_depth: 4,
            max_glossy_depth: 4,
            max_specular_depth: 6,
            rr_depth: 3,
            rr_importance_cap: 0.125,
            sqrt_variance_clamp_max_value: 0.0,
            force_black_background: false,
        }
    }
}

/// Top-level render configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// In-flight path tasks per device thread; fixed for a thread's lifetime.
    pub task_count: u32,
    pub sampler: SamplerSettings,
    pub filter: FilterSettings,
    pub path: PathSettings,
    pub accelerator: AcceleratorType,
    pub kernel_cache: KernelCacheMode,
    /// Cache root; defaults to a per-user location under the temp directory.
    pub kernel_cache_dir: Option<PathBuf>,
    pub use_pixel_atomics: bool,
    /// Dump assembled kernel params + source next to the working directory.
    pub write_kernels_to_file: bool,
    /// Stop a thread once every pixel has this many samples (0 = never).
    pub halt_spp: u32,
    /// Stop a thread after this much wall time in seconds (0 = never).
    pub halt_time_secs: f32,
    /// Largest single device allocation; defaults to the device limit.
    pub max_mem_page_size: Option<u64>,
    pub seed: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        RenderConfig {
            task_count: 64 * 1024,
            sampler: SamplerSettings::default(),
            filter: FilterSettings::default(),
            path: PathSettings::default(),
            accelerator: AcceleratorType::Bvh,
            kernel_cache: KernelCacheMode::Persistent,
            kernel_cache_dir: None,
            use_pixel_atomics: false,
            write_kernels_to_file: false,
            halt_spp: 0,
            halt_time_secs: 0.0,
            max_mem_page_size: None,
            seed: 131,
        }
    }
}

impl RenderConfig {
    pub fn from_json(json: &str) -> RenderResult<Self> {
        serde_json::from_str(json).map_err(|e| RenderError::config(format!("bad config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips_through_json() {
        let config = RenderConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back = RenderConfig::from_json(&json).unwrap();
        assert_eq!(back.task_count, config.task_count);
        assert_eq!(back.accelerator, config.accelerator);
        assert_eq!(back.kernel_cache, config.kernel_cache);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config = RenderConfig::from_json(r#"{"task_count": 128}"#).unwrap();
        assert_eq!(config.task_count, 128);
        assert_eq!(config.sampler.sampler_type, SamplerType::Sobol);
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = RenderConfig::from_json("{").unwrap_err();
        assert!(matches!(err, RenderError::Config(_)));
    }
}
