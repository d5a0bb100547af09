//! Film: the authoritative accumulation framebuffer
//!
//! The engine owns one `Film`; every render thread accumulates into its own
//! `ThreadFilm` mirror and the engine folds those into this one. Radiance is
//! kept in per-group sample buffers with channel-specific normalization and
//! only collapsed into a displayable plane by the two-phase merge.

mod thread_film;

pub use thread_film::ThreadFilm;

use crate::error::{RenderError, RenderResult};

/// Hard upper bound on radiance groups; exceeding it is an error, never a
/// silent truncation.
pub const FILM_MAX_RADIANCE_GROUP_COUNT: u32 = 8;

/// Film output channels.
///
/// `RadiancePerPixelNormalized` stores rgb plus an accumulated weight and is
/// normalized per pixel; `RadiancePerScreenNormalized` is normalized by the
/// whole-screen sample count at merge time. `Convergence`, `Noise` and
/// `UserImportance` are computed by the engine on the host; the device copy
/// is a mirror, which inverts their transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilmChannel {
    RadiancePerPixelNormalized,
    RadiancePerScreenNormalized,
    Alpha,
    Depth,
    Position,
    GeometryNormal,
    ShadingNormal,
    MaterialId,
    ObjectId,
    Albedo,
    AvgShadingNormal,
    SampleCount,
    Convergence,
    Noise,
    UserImportance,
    ImagePipeline,
}

impl FilmChannel {
    /// Floats per pixel in this channel's plane.
    pub fn float_count(self) -> usize {
        match self {
            FilmChannel::RadiancePerPixelNormalized => 4,
            FilmChannel::RadiancePerScreenNormalized => 4,
            FilmChannel::Alpha => 2,
            FilmChannel::Depth => 1,
            FilmChannel::Position => 3,
            FilmChannel::GeometryNormal => 3,
            FilmChannel::ShadingNormal => 3,
            FilmChannel::MaterialId => 1,
            FilmChannel::ObjectId => 1,
            FilmChannel::Albedo => 4,
            FilmChannel::AvgShadingNormal => 4,
            FilmChannel::SampleCount => 1,
            FilmChannel::Convergence => 1,
            FilmChannel::Noise => 1,
            FilmChannel::UserImportance => 1,
            FilmChannel::ImagePipeline => 3,
        }
    }

    /// Bit for the kernel-parameter channel mask.
    pub fn flag_bit(self) -> u32 {
        match self {
            FilmChannel::RadiancePerPixelNormalized => 1 << 0,
            FilmChannel::RadiancePerScreenNormalized => 1 << 1,
            FilmChannel::Alpha => 1 << 2,
            FilmChannel::Depth => 1 << 3,
            FilmChannel::Position => 1 << 4,
            FilmChannel::GeometryNormal => 1 << 5,
            FilmChannel::ShadingNormal => 1 << 6,
            FilmChannel::MaterialId => 1 << 7,
            FilmChannel::ObjectId => 1 << 8,
            FilmChannel::Albedo => 1 << 9,
            FilmChannel::AvgShadingNormal => 1 << 10,
            FilmChannel::SampleCount => 1 << 11,
            FilmChannel::Convergence => 1 << 12,
            FilmChannel::Noise => 1 << 13,
            FilmChannel::UserImportance => 1 << 14,
            FilmChannel::ImagePipeline => 1 << 15,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FilmChannel::RadiancePerPixelNormalized => "RADIANCE_PER_PIXEL_NORMALIZED",
            FilmChannel::RadiancePerScreenNormalized => "RADIANCE_PER_SCREEN_NORMALIZED",
            FilmChannel::Alpha => "ALPHA",
            FilmChannel::Depth => "DEPTH",
            FilmChannel::Position => "POSITION",
            FilmChannel::GeometryNormal => "GEOMETRY_NORMAL",
            FilmChannel::ShadingNormal => "SHADING_NORMAL",
            FilmChannel::MaterialId => "MATERIAL_ID",
            FilmChannel::ObjectId => "OBJECT_ID",
            FilmChannel::Albedo => "ALBEDO",
            FilmChannel::AvgShadingNormal => "AVG_SHADING_NORMAL",
            FilmChannel::SampleCount => "SAMPLECOUNT",
            FilmChannel::Convergence => "CONVERGENCE",
            FilmChannel::Noise => "NOISE",
            FilmChannel::UserImportance => "USER_IMPORTANCE",
            FilmChannel::ImagePipeline => "IMAGEPIPELINE",
        }
    }

    /// Channels whose authoritative value lives on the host (engine side).
    ///
    /// Their device mirrors are refreshed host→device during `recv_film`;
    /// this asymmetry is intentional and must not be "fixed".
    pub fn is_host_authoritative(self) -> bool {
        matches!(
            self,
            FilmChannel::Convergence | FilmChannel::Noise | FilmChannel::UserImportance
        )
    }

    fn all() -> &'static [FilmChannel] {
        &[
            FilmChannel::RadiancePerPixelNormalized,
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
            FilmChannel::ImagePipeline,
        ]
    }
}

/// Per-group scale applied at merge time.
///
/// Changing a scale requires only a re-merge, never a re-render.
#[derive(Debug, Clone, Copy)]
pub struct RadianceChannelScale {
    pub scale: [f32; 3],
    pub enabled: bool,
}

impl Default for RadianceChannelScale {
    fn default() -> Self {
        RadianceChannelScale {
            scale: [1.0; 3],
            enabled: true,
        }
    }
}

impl RadianceChannelScale {
    pub fn uniform(s: f32) -> Self {
        RadianceChannelScale {
            scale: [s; 3],
            enabled: true,
        }
    }
}

/// One image pipeline instance: the per-group scales feeding a merge.
#[derive(Debug, Clone, Default)]
pub struct ImagePipeline {
    pub radiance_channel_scales: Vec<RadianceChannelScale>,
}

impl ImagePipeline {
    pub fn with_group_count(count: u32) -> Self {
        ImagePipeline {
            radiance_channel_scales: vec![RadianceChannelScale::default(); count as usize],
        }
    }

    fn scale_for(&self, group: usize) -> Option<[f32; 3]> {
        match self.radiance_channel_scales.get(group) {
            Some(s) if s.enabled => Some(s.scale),
            Some(_) => None,
            // No explicit scale configured: group passes through unscaled
            None => Some([1.0; 3]),
        }
    }
}

/// The accumulation framebuffer.
pub struct Film {
    width: u32,
    height: u32,
    sub_region: [u32; 4],
    channels: Vec<FilmChannel>,
    radiance_group_count: u32,

    // Sample buffers: one plane per radiance group and channel
    pub radiance_per_pixel_normalized: Vec<Vec<f32>>,
    pub radiance_per_screen_normalized: Vec<Vec<f32>>,
    pub alpha: Vec<f32>,
    pub depth: Vec<f32>,
    pub position: Vec<f32>,
    pub geometry_normal: Vec<f32>,
    pub shading_normal: Vec<f32>,
    pub material_id: Vec<f32>,
    pub object_id: Vec<f32>,
    pub albedo: Vec<f32>,
    pub avg_shading_normal: Vec<f32>,
    pub sample_count: Vec<f32>,
    pub convergence: Vec<f32>,
    pub noise: Vec<f32>,
    pub user_importance: Vec<f32>,
    /// One finalized plane per image pipeline.
    pub image_pipeline_planes: Vec<Vec<f32>>,

    image_pipelines: Vec<ImagePipeline>,
    denoiser_enabled: bool,

    total_sample_count: f64,
    screen_normalized_sample_count: f64,
}

impl Film {
    /// A film with one per-pixel-normalized radiance group and a single
    /// image pipeline.
    pub fn new(width: u32, height: u32) -> Self {
        let mut film = Film {
            width,
            height,
            sub_region: [0, width.saturating_sub(1), 0, height.saturating_sub(1)],
            channels: vec![
                FilmChannel::RadiancePerPixelNormalized,
                FilmChannel::ImagePipeline,
            ],
            radiance_group_count: 1,
            radiance_per_pixel_normalized: Vec::new(),
            radiance_per_screen_normalized: Vec::new(),
            alpha: Vec::new(),
            depth: Vec::new(),
            position: Vec::new(),
            geometry_normal: Vec::new(),
            shading_normal: Vec::new(),
            material_id: Vec::new(),
            object_id: Vec::new(),
            albedo: Vec::new(),
            avg_shading_normal: Vec::new(),
            sample_count: Vec::new(),
            convergence: Vec::new(),
            noise: Vec::new(),
            user_importance: Vec::new(),
            image_pipeline_planes: Vec::new(),
            image_pipelines: vec![ImagePipeline::with_group_count(1)],
            denoiser_enabled: false,
            total_sample_count: 0.0,
            screen_normalized_sample_count: 0.0,
        };
        film.init();
        film
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_count(&self) -> u32 {
        self.width * self.height
    }

    /// Inclusive sub-region [x0, x1, y0, y1] the samples cover.
    pub fn sub_region(&self) -> [u32; 4] {
        self.sub_region
    }

    pub fn set_sub_region(&mut self, sub_region: [u32; 4]) {
        self.sub_region = sub_region;
    }

    pub fn has_channel(&self, channel: FilmChannel) -> bool {
        self.channels.contains(&channel)
    }

    pub fn add_channel(&mut self, channel: FilmChannel) {
        if !self.has_channel(channel) {
            self.channels.push(channel);
        }
    }

    pub fn remove_channel(&mut self, channel: FilmChannel) {
        self.channels.retain(|c| *c != channel);
    }

    pub fn channels(&self) -> &[FilmChannel] {
        &self.channels
    }

    pub fn radiance_group_count(&self) -> u32 {
        self.radiance_group_count
    }

    pub fn set_radiance_group_count(&mut self, count: u32) -> RenderResult<()> {
        if count > FILM_MAX_RADIANCE_GROUP_COUNT {
            return Err(RenderError::film(format!(
                "{count} radiance groups requested, the maximum is {FILM_MAX_RADIANCE_GROUP_COUNT}"
            )));
        }
        self.radiance_group_count = count;
        for ip in &mut self.image_pipelines {
            ip.radiance_channel_scales
                .resize(count as usize, RadianceChannelScale::default());
        }
        Ok(())
    }

    pub fn denoiser_enabled(&self) -> bool {
        self.denoiser_enabled
    }

    pub fn set_denoiser_enabled(&mut self, enabled: bool) {
        self.denoiser_enabled = enabled;
    }

    pub fn image_pipelines(&self) -> &[ImagePipeline] {
        &self.image_pipelines
    }

    pub fn image_pipelines_mut(&mut self) -> &mut [ImagePipeline] {
        &mut self.image_pipelines
    }

    pub fn set_image_pipelines(&mut self, pipelines: Vec<ImagePipeline>) {
        self.image_pipelines = pipelines;
        self.image_pipeline_planes.clear();
    }

    /// (Re)allocate planes for exactly the enabled channel set.
    ///
    /// Planes for channels no longer enabled are dropped, not left stale.
    pub fn init(&mut self) {
        let n = self.pixel_count() as usize;
        let plane = |enabled: bool, floats: usize| if enabled { vec![0.0; n * floats] } else { Vec::new() };

        let groups = self.radiance_group_count as usize;
        self.radiance_per_pixel_normalized =
            if self.has_channel(FilmChannel::RadiancePerPixelNormalized) {
                vec![vec![0.0; n * 4]; groups]
            } else {
                Vec::new()
            };
        self.radiance_per_screen_normalized =
            if self.has_channel(FilmChannel::RadiancePerScreenNormalized) {
                vec![vec![0.0; n * 4]; groups]
            } else {
                Vec::new()
            };
        self.alpha = plane(self.has_channel(FilmChannel::Alpha), 2);
        self.depth = plane(self.has_channel(FilmChannel::Depth), 1);
        self.position = plane(self.has_channel(FilmChannel::Position), 3);
        self.geometry_normal = plane(self.has_channel(FilmChannel::GeometryNormal), 3);
        self.shading_normal = plane(self.has_channel(FilmChannel::ShadingNormal), 3);
        self.material_id = plane(self.has_channel(FilmChannel::MaterialId), 1);
        self.object_id = plane(self.has_channel(FilmChannel::ObjectId), 1);
        self.albedo = plane(self.has_channel(FilmChannel::Albedo), 4);
        self.avg_shading_normal = plane(self.has_channel(FilmChannel::AvgShadingNormal), 4);
        self.sample_count = plane(self.has_channel(FilmChannel::SampleCount), 1);
        self.convergence = plane(self.has_channel(FilmChannel::Convergence), 1);
        self.noise = plane(self.has_channel(FilmChannel::Noise), 1);
        self.user_importance = plane(self.has_channel(FilmChannel::UserImportance), 1);
        self.image_pipeline_planes = if self.has_channel(FilmChannel::ImagePipeline) {
            vec![vec![0.0; n * 3]; self.image_pipelines.len()]
        } else {
            Vec::new()
        };
        self.total_sample_count = 0.0;
        self.screen_normalized_sample_count = 0.0;
    }

    /// Zero every sample buffer without reallocating.
    pub fn clear(&mut self) {
        for plane in self
            .radiance_per_pixel_normalized
            .iter_mut()
            .chain(self.radiance_per_screen_normalized.iter_mut())
        {
            plane.fill(0.0);
        }
        for plane in [
            &mut self.alpha,
            &mut self.depth,
            &mut self.position,
            &mut self.geometry_normal,
            &mut self.shading_normal,
            &mut self.material_id,
            &mut self.object_id,
            &mut self.albedo,
            &mut self.avg_shading_normal,
            &mut self.sample_count,
        ] {
            plane.fill(0.0);
        }
        self.total_sample_count = 0.0;
        self.screen_normalized_sample_count = 0.0;
    }

    pub fn total_sample_count(&self) -> f64 {
        self.total_sample_count
    }

    pub fn set_sample_counts(&mut self, total: f64, screen_normalized: f64) {
        self.total_sample_count = total;
        self.screen_normalized_sample_count = screen_normalized;
    }

    pub fn add_sample_counts(&mut self, total: f64, screen_normalized: f64) {
        self.total_sample_count += total;
        self.screen_normalized_sample_count += screen_normalized;
    }

    /// Fold another film's sample buffers into this one.
    ///
    /// Plane-wise sums only, so the fold is commutative across source films
    /// up to floating-point summation order.
    pub fn add_film(&mut self, other: &Film) -> RenderResult<()> {
        if other.width != self.width || other.height != self.height {
            return Err(RenderError::film(format!(
                "cannot add a {}x{} film into a {}x{} film",
                other.width, other.height, self.width, self.height
            )));
        }

        let add = |dst: &mut Vec<f32>, src: &Vec<f32>| {
            if !dst.is_empty() && dst.len() == src.len() {
                for (d, s) in dst.iter_mut().zip(src.iter()) {
                    *d += *s;
                }
            }
        };

        for (dst, src) in self
            .radiance_per_pixel_normalized
            .iter_mut()
            .zip(other.radiance_per_pixel_normalized.iter())
        {
            for (d, s) in dst.iter_mut().zip(src.iter()) {
                *d += *s;
            }
        }
        for (dst, src) in self
            .radiance_per_screen_normalized
            .iter_mut()
            .zip(other.radiance_per_screen_normalized.iter())
        {
            for (d, s) in dst.iter_mut().zip(src.iter()) {
                *d += *s;
            }
        }
        add(&mut self.alpha, &other.alpha);
        add(&mut self.sample_count, &other.sample_count);
        add(&mut self.albedo, &other.albedo);
        add(&mut self.avg_shading_normal, &other.avg_shading_normal);
        // Depth keeps the nearest value
        if !self.depth.is_empty() && self.depth.len() == other.depth.len() {
            for (d, s) in self.depth.iter_mut().zip(other.depth.iter()) {
                if *s > 0.0 && (*d == 0.0 || *s < *d) {
                    *d = *s;
                }
            }
        }

        self.total_sample_count += other.total_sample_count;
        self.screen_normalized_sample_count += other.screen_normalized_sample_count;
        Ok(())
    }

    /// Two-phase merge of the radiance sample buffers into the image
    /// pipeline plane.
    ///
    /// Phase one initializes an accumulation buffer and folds in each
    /// enabled radiance group scaled by its channel scale; per-screen
    /// normalized groups carry the extra `pixel_count / total_sample_count`
    /// factor. Phase two finalizes into the displayable plane. Because the
    /// inputs are untouched, a scale change needs only a re-merge.
    pub fn merge_sample_buffers(&mut self, pipeline_index: usize) -> RenderResult<()> {
        if !self.has_channel(FilmChannel::ImagePipeline) {
            return Err(RenderError::film("film has no IMAGEPIPELINE channel"));
        }
        if pipeline_index >= self.image_pipelines.len() {
            return Err(RenderError::film(format!(
                "image pipeline {pipeline_index} does not exist"
            )));
        }

        let n = self.pixel_count() as usize;
        let mut acc = vec![0.0f32; n * 3];
        let mut mask = vec![false; n];

        // Accumulate per-pixel-normalized groups
        let ip = &self.image_pipelines[pipeline_index];
        for (group, plane) in self.radiance_per_pixel_normalized.iter().enumerate() {
            let Some(scale) = ip.scale_for(group) else {
                continue;
            };
            for i in 0..n {
                let sp = &plane[i * 4..i * 4 + 4];
                let weight = sp[3];
                if weight > 0.0 {
                    acc[i * 3] += sp[0] / weight * scale[0];
                    acc[i * 3 + 1] += sp[1] / weight * scale[1];
                    acc[i * 3 + 2] += sp[2] / weight * scale[2];
                    mask[i] = true;
                }
            }
        }

        // Accumulate per-screen-normalized groups
        if !self.radiance_per_screen_normalized.is_empty() {
            let factor = if self.screen_normalized_sample_count > 0.0 {
                self.pixel_count() as f64 / self.screen_normalized_sample_count
            } else {
                1.0
            } as f32;
            for (group, plane) in self.radiance_per_screen_normalized.iter().enumerate() {
                let Some(scale) = ip.scale_for(group) else {
                    continue;
                };
                for i in 0..n {
                    let sp = &plane[i * 4..i * 4 + 4];
                    if sp[3] > 0.0 {
                        acc[i * 3] += sp[0] * factor * scale[0];
                        acc[i * 3 + 1] += sp[1] * factor * scale[1];
                        acc[i * 3 + 2] += sp[2] * factor * scale[2];
                        mask[i] = true;
                    }
                }
            }
        }

        // Finalize
        let out = &mut self.image_pipeline_planes[pipeline_index];
        for i in 0..n {
            if mask[i] {
                out[i * 3..i * 3 + 3].copy_from_slice(&acc[i * 3..i * 3 + 3]);
            } else {
                out[i * 3..i * 3 + 3].fill(0.0);
            }
        }
        Ok(())
    }

    /// Host-side noise estimate: luminance delta against the previous
    /// finalized plane. Engine-owned; the device copy is only a mirror.
    pub fn update_noise_estimate(&mut self, previous_plane: &[f32]) {
        if self.noise.is_empty() || self.image_pipeline_planes.is_empty() {
            return;
        }
        let current = &self.image_pipeline_planes[0];
        if previous_plane.len() != current.len() {
            return;
        }
        for (i, noise) in self.noise.iter_mut().enumerate() {
            let lum = |p: &[f32]| 0.2126 * p[i * 3] + 0.7152 * p[i * 3 + 1] + 0.0722 * p[i * 3 + 2];
            *noise = (lum(current) - lum(previous_plane)).abs();
        }
    }

    /// Host-side convergence estimate from the noise plane.
    pub fn update_convergence_estimate(&mut self, threshold: f32) {
        if self.convergence.is_empty() || self.noise.is_empty() {
            return;
        }
        for (c, noise) in self.convergence.iter_mut().zip(self.noise.iter()) {
            *c = if *noise <= threshold { 1.0 } else { 0.0 };
        }
    }

    /// Write the finalized pipeline plane as an 8-bit PNG.
    pub fn write_png(&self, path: &std::path::Path, pipeline_index: usize) -> RenderResult<()> {
        let plane = self
            .image_pipeline_planes
            .get(pipeline_index)
            .ok_or_else(|| RenderError::film("image pipeline plane not merged"))?;
        let mut rgb = Vec::with_capacity(plane.len());
        for v in plane {
            rgb.push((v.clamp(0.0, 1.0) * 255.0 + 0.5) as u8);
        }
        let img = image::RgbImage::from_raw(self.width, self.height, rgb)
            .ok_or_else(|| RenderError::film("image pipeline plane has wrong size"))?;
        img.save(path)
            .map_err(|e| RenderError::film(format!("PNG save failed: {e}")))?;
        Ok(())
    }

    /// Copy channel configuration (not pixel data) from another film.
    pub fn copy_channel_settings(&mut self, other: &Film) {
        self.channels = other.channels.clone();
        self.radiance_group_count = other.radiance_group_count;
        self.image_pipelines = other.image_pipelines.clone();
        self.denoiser_enabled = other.denoiser_enabled;
        self.init();
    }

    /// All channels enabled, for diagnostics.
    pub fn enable_all_channels(&mut self) {
        self.channels = FilmChannel::all().to_vec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn splat(film: &mut Film, group: usize, pixel: usize, rgb: [f32; 3], weight: f32) {
        let plane = &mut film.radiance_per_pixel_normalized[group];
        plane[pixel * 4] += rgb[0];
        plane[pixel * 4 + 1] += rgb[1];
        plane[pixel * 4 + 2] += rgb[2];
        plane[pixel * 4 + 3] += weight;
    }

    #[test]
    fn radiance_group_count_is_capped() {
        let mut film = Film::new(4, 4);
        assert!(film.set_radiance_group_count(8).is_ok());
        let err = film.set_radiance_group_count(9).unwrap_err();
        assert!(matches!(err, RenderError::Film(_)));
    }

    #[test]
    fn merge_normalizes_per_pixel_radiance() {
        let mut film = Film::new(2, 1);
        film.init();
        splat(&mut film, 0, 0, [2.0, 2.0, 2.0], 2.0);
        film.merge_sample_buffers(0).unwrap();
        let out = &film.image_pipeline_planes[0];
        assert_eq!(&out[0..3], &[1.0, 1.0, 1.0]);
        // Untouched pixel finalizes to zero
        assert_eq!(&out[3..6], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn merge_is_commutative_across_groups() {
        let build = |order: [usize; 2]| {
            let mut film = Film::new(1, 1);
            film.set_radiance_group_count(2).unwrap();
            film.init();
            for &g in &order {
                splat(&mut film, g, 0, [(g + 1) as f32; 3], 1.0);
            }
            film.merge_sample_buffers(0).unwrap();
            film.image_pipeline_planes[0].clone()
        };
        let ab = build([0, 1]);
        let ba = build([1, 0]);
        for (x, y) in ab.iter().zip(ba.iter()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn per_screen_groups_use_total_sample_count_factor() {
        let mut film = Film::new(2, 2);
        film.remove_channel(FilmChannel::RadiancePerPixelNormalized);
        film.add_channel(FilmChannel::RadiancePerScreenNormalized);
        film.init();
        // 16 samples across a 4 pixel screen: factor = 4 / 16
        film.set_sample_counts(16.0, 16.0);
        let plane = &mut film.radiance_per_screen_normalized[0];
        plane[0] = 8.0;
        plane[1] = 8.0;
        plane[2] = 8.0;
        plane[3] = 1.0;
        film.merge_sample_buffers(0).unwrap();
        assert_eq!(&film.image_pipeline_planes[0][0..3], &[2.0, 2.0, 2.0]);
    }

    #[test]
    fn scale_change_needs_only_a_re_merge() {
        let mut film = Film::new(1, 1);
        film.init();
        splat(&mut film, 0, 0, [1.0, 1.0, 1.0], 1.0);
        film.merge_sample_buffers(0).unwrap();
        assert_eq!(film.image_pipeline_planes[0][0], 1.0);

        film.image_pipelines_mut()[0].radiance_channel_scales[0] =
            RadianceChannelScale::uniform(0.5);
        film.merge_sample_buffers(0).unwrap();
        assert_eq!(film.image_pipeline_planes[0][0], 0.5);
        // Sample buffer itself is untouched
        assert_eq!(film.radiance_per_pixel_normalized[0][0], 1.0);
    }

    #[test]
    fn disabled_groups_are_skipped_by_the_merge() {
        let mut film = Film::new(1, 1);
        film.set_radiance_group_count(2).unwrap();
        film.init();
        splat(&mut film, 0, 0, [1.0; 3], 1.0);
        splat(&mut film, 1, 0, [10.0; 3], 1.0);
        film.image_pipelines_mut()[0].radiance_channel_scales[1].enabled = false;
        film.merge_sample_buffers(0).unwrap();
        assert_eq!(film.image_pipeline_planes[0][0], 1.0);
    }

    #[test]
    fn add_film_sums_planes_and_counts() {
        let mut a = Film::new(2, 1);
        let mut b = Film::new(2, 1);
        a.init();
        b.init();
        splat(&mut a, 0, 0, [1.0; 3], 1.0);
        splat(&mut b, 0, 0, [2.0; 3], 1.0);
        a.add_sample_counts(1.0, 0.0);
        b.add_sample_counts(1.0, 0.0);

        a.add_film(&b).unwrap();
        assert_eq!(a.radiance_per_pixel_normalized[0][0], 3.0);
        assert_eq!(a.radiance_per_pixel_normalized[0][3], 2.0);
        assert_eq!(a.total_sample_count(), 2.0);
    }

    #[test]
    fn add_film_rejects_mismatched_dimensions() {
        let mut a = Film::new(2, 2);
        let b = Film::new(4, 4);
        assert!(a.add_film(&b).is_err());
    }

    #[test]
    fn init_frees_disabled_channel_planes() {
        let mut film = Film::new(2, 2);
        film.add_channel(FilmChannel::Depth);
        film.init();
        assert!(!film.depth.is_empty());

        film.remove_channel(FilmChannel::Depth);
        film.init();
        assert!(film.depth.is_empty());
    }
}
