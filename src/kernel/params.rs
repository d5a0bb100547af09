//! Kernel compile-parameter derivation
//!
//! The parameter string is half of the kernel cache key, so its emission
//! order is fixed: two identical scene/film/config states must produce the
//! same string byte for byte.

use std::fmt::Write;

use crate::config::{AcceleratorType, RenderConfig};
use crate::error::{RenderError, RenderResult};
use crate::film::{Film, FilmChannel};
use crate::scene::{
    CompiledScene, ImageMapFormat, LightKind, MaterialKind, TextureKind,
};

/// Derive the `-D NAME[=VALUE]` parameter string for a device kernel build.
///
/// Raised errors here are configuration errors: they fire before any device
/// work starts.
pub fn derive_kernel_params(
    config: &RenderConfig,
    cscene: &CompiledScene,
    film: &Film,
) -> RenderResult<String> {
    let mut p = String::new();

    p.push_str(" -D TRACE3D_DEVICE_KERNEL");

    match config.accelerator {
        AcceleratorType::Bvh => p.push_str(" -D PARAM_ACCEL_BVH"),
        AcceleratorType::Mbvh => p.push_str(" -D PARAM_ACCEL_MBVH"),
        AcceleratorType::Embree => {
            return Err(RenderError::config(
                "EMBREE accelerator is not supported by the device kernel path",
            ))
        }
    }

    // Film channels
    let group_count = film.radiance_group_count();
    for i in 0..group_count {
        write!(p, " -D PARAM_FILM_RADIANCE_GROUP_{i}").unwrap();
    }
    write!(p, " -D PARAM_FILM_RADIANCE_GROUP_COUNT={group_count}").unwrap();
    for channel in [
        FilmChannel::RadiancePerScreenNormalized,
        FilmChannel::Alpha,
        FilmChannel::Depth,
        FilmChannel::Position,
        FilmChannel::GeometryNormal,
        FilmChannel::ShadingNormal,
        FilmChannel::MaterialId,
        FilmChannel::ObjectId,
        FilmChannel::Albedo,
        FilmChannel::AvgShadingNormal,
        FilmChannel::SampleCount,
        FilmChannel::Convergence,
        FilmChannel::Noise,
        FilmChannel::UserImportance,
    ] {
        if film.has_channel(channel) {
            write!(p, " -D PARAM_FILM_CHANNELS_HAS_{}", channel.name()).unwrap();
        }
    }

    // Enabled texture kinds
    for kind in [
        TextureKind::ConstFloat,
        TextureKind::ConstSpectrum,
        TextureKind::ImageMap,
        TextureKind::Scale,
        TextureKind::Mix,
        TextureKind::Checkerboard,
    ] {
        if cscene.is_texture_compiled(kind) {
            write!(p, " -D PARAM_ENABLE_TEX_{}", kind.name()).unwrap();
        }
    }

    // Enabled material kinds
    for kind in [
        MaterialKind::Matte,
        MaterialKind::Mirror,
        MaterialKind::Glass,
        MaterialKind::Glossy,
        MaterialKind::Metal,
        MaterialKind::Null,
    ] {
        if cscene.is_material_compiled(kind) {
            write!(p, " -D PARAM_ENABLE_MAT_{}", kind.name()).unwrap();
        }
    }

    // Camera
    write!(p, " -D PARAM_CAMERA_TYPE={}", cscene.camera_kind.id()).unwrap();
    if cscene.enable_camera_clipping_plane {
        p.push_str(" -D PARAM_CAMERA_ENABLE_CLIPPING_PLANE");
    }

    // Enabled light kinds
    for kind in [
        LightKind::Infinite,
        LightKind::ConstantInfinite,
        LightKind::Sky,
        LightKind::Sun,
        LightKind::Point,
        LightKind::Spot,
        LightKind::Distant,
        LightKind::Triangle,
    ] {
        if cscene.is_light_compiled(kind) {
            write!(p, " -D PARAM_HAS_{}LIGHT", kind.name()).unwrap();
        }
    }
    if cscene.has_env_lights {
        p.push_str(" -D PARAM_HAS_ENVLIGHTS");
    }

    // Image maps
    if cscene.has_image_maps() {
        p.push_str(" -D PARAM_HAS_IMAGEMAPS");
        for i in 0..cscene.image_map_pages.len() {
            write!(p, " -D PARAM_IMAGEMAPS_PAGE_{i}").unwrap();
        }
        write!(p, " -D PARAM_IMAGEMAPS_COUNT={}", cscene.image_map_pages.len()).unwrap();
        for format in [
            ImageMapFormat::Byte,
            ImageMapFormat::Half,
            ImageMapFormat::Float,
        ] {
            if cscene.is_image_map_format_compiled(format) {
                write!(p, " -D PARAM_HAS_IMAGEMAPS_{}_FORMAT", format.name()).unwrap();
            }
        }
        for channels in 1..=4u32 {
            if cscene.is_image_map_channel_count_compiled(channels) {
                write!(p, " -D PARAM_HAS_IMAGEMAPS_{channels}xCHANNELS").unwrap();
            }
        }
    }

    // Photon GI
    if cscene.has_photon_gi() {
        p.push_str(" -D PARAM_PGIC_ENABLED");
    }

    // Volumes
    if cscene.has_volumes() {
        p.push_str(" -D PARAM_HAS_VOLUMES");
        write!(
            p,
            " -D SCENE_DEFAULT_VOLUME_INDEX={}",
            cscene.default_volume_index
        )
        .unwrap();
    }

    // Path settings
    write!(
        p,
        " -D PARAM_MAX_PATH_DEPTH={} -D PARAM_MAX_PATH_DEPTH_DIFFUSE={} \
         -D PARAM_MAX_PATH_DEPTH_GLOSSY={} -D PARAM_MAX_PATH_DEPTH_SPECULAR={} \
         -D PARAM_RR_DEPTH={} -D PARAM_RR_CAP={:.6} -D PARAM_SQRT_VARIANCE_CLAMP_MAX_VALUE={:.6}",
        config.path.max_depth,
        config.path.max_diffuse_depth,
        config.path.max_glossy_depth,
        config.path.max_specular_depth,
        config.path.rr_depth,
        config.path.rr_importance_cap,
        config.path.sqrt_variance_clamp_max_value,
    )
    .unwrap();
    if config.path.force_black_background {
        p.push_str(" -D PARAM_FORCE_BLACK_BACKGROUND");
    }

    // Pixel filter
    write!(
        p,
        " -D PARAM_IMAGE_FILTER_TYPE={} -D PARAM_IMAGE_FILTER_WIDTH_X={:.6} \
         -D PARAM_IMAGE_FILTER_WIDTH_Y={:.6}",
        config.filter.filter_type.id(),
        config.filter.width_x,
        config.filter.width_y,
    )
    .unwrap();
    if config.filter.filter_type == crate::config::FilterType::Gaussian {
        write!(
            p,
            " -D PARAM_IMAGE_FILTER_GAUSSIAN_ALPHA={:.6}",
            config.filter.gaussian_alpha
        )
        .unwrap();
    }

    if config.use_pixel_atomics {
        p.push_str(" -D PARAM_USE_PIXEL_ATOMICS");
    }

    // Sampler
    write!(p, " -D PARAM_SAMPLER_TYPE={}", config.sampler.sampler_type.id()).unwrap();

    // A doubled space breaks option parsing on some drivers
    let mut params = p;
    while params.contains("  ") {
        params = params.replace("  ", " ");
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelCacheMode;
    use crate::scene::{Scene, SceneLight, SceneMaterial};

    fn setup() -> (RenderConfig, CompiledScene, Film) {
        let mut scene = Scene::new();
        scene.add_material(SceneMaterial {
            kind: MaterialKind::Matte,
            base_color: [0.5; 3],
            emission: [0.0; 3],
            texture_index: None,
        });
        scene.add_light(SceneLight::environment([1.0; 3]));
        let cscene = CompiledScene::compile(&scene, 1 << 20).unwrap();
        let film = Film::new(8, 8);
        let mut config = RenderConfig::default();
        config.kernel_cache = KernelCacheMode::None;
        (config, cscene, film)
    }

    #[test]
    fn derivation_is_deterministic() {
        let (config, cscene, film) = setup();
        let a = derive_kernel_params(&config, &cscene, &film).unwrap();
        let b = derive_kernel_params(&config, &cscene, &film).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn embree_accelerator_is_a_config_error() {
        let (mut config, cscene, film) = setup();
        config.accelerator = AcceleratorType::Embree;
        let err = derive_kernel_params(&config, &cscene, &film).unwrap_err();
        assert!(matches!(err, RenderError::Config(_)));
    }

    #[test]
    fn enabled_feature_sets_show_up() {
        let (config, cscene, film) = setup();
        let params = derive_kernel_params(&config, &cscene, &film).unwrap();
        assert!(params.contains("PARAM_ENABLE_MAT_MATTE"));
        assert!(params.contains("PARAM_HAS_CONSTANTINFINITELIGHT"));
        assert!(params.contains("PARAM_HAS_ENVLIGHTS"));
        assert!(!params.contains("PARAM_ENABLE_MAT_GLASS"));
        assert!(!params.contains("PARAM_HAS_IMAGEMAPS"));
        assert!(!params.contains("  "));
    }

    #[test]
    fn light_kind_changes_change_the_params() {
        let (config, cscene, film) = setup();
        let before = derive_kernel_params(&config, &cscene, &film).unwrap();

        let mut scene = Scene::new();
        scene.add_material(SceneMaterial {
            kind: MaterialKind::Matte,
            base_color: [0.5; 3],
            emission: [0.0; 3],
            texture_index: None,
        });
        scene.add_light(SceneLight::environment([1.0; 3]));
        scene.add_light(SceneLight {
            kind: LightKind::Point,
            emission: [1.0; 3],
            position: glam::Vec3::ONE,
            direction: glam::Vec3::NEG_Y,
        });
        let cscene2 = CompiledScene::compile(&scene, 1 << 20).unwrap();
        let after = derive_kernel_params(&config, &cscene2, &film).unwrap();
        assert_ne!(before, after);
        assert!(after.contains("PARAM_HAS_POINTLIGHT"));
    }
}
