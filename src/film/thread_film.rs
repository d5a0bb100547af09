//! Per-thread device film mirror
//!
//! Each render thread accumulates into a private ThreadFilm: a host film
//! plus one device buffer per enabled channel. The film object stays
//! readable after the device buffers are freed, so an image can be saved
//! after the thread has stopped.

use std::sync::Arc;

use crate::device::{BufferRole, BufferSlot, Device, Kernel, KernelArg};
use crate::error::{RenderError, RenderResult};
use crate::film::{Film, FilmChannel, FILM_MAX_RADIANCE_GROUP_COUNT};
use crate::gpu::round_up;

pub struct ThreadFilm {
    /// Host mirror; the authoritative copy of this thread's accumulation.
    pub film: Film,
    device: Arc<dyn Device>,

    // Device channel buffers
    radiance_per_pixel_normalized: Vec<BufferSlot>,
    alpha: BufferSlot,
    depth: BufferSlot,
    position: BufferSlot,
    geometry_normal: BufferSlot,
    shading_normal: BufferSlot,
    material_id: BufferSlot,
    object_id: BufferSlot,
    albedo: BufferSlot,
    avg_shading_normal: BufferSlot,
    sample_count: BufferSlot,
    convergence: BufferSlot,
    noise: BufferSlot,
    user_importance: BufferSlot,

    // Denoiser sample accumulators (lifecycle only)
    denoiser_sample_count: BufferSlot,
    denoiser_squared_weight: BufferSlot,
    denoiser_mean: BufferSlot,
    denoiser_covariance: BufferSlot,
    denoiser_histogram: BufferSlot,
}

impl ThreadFilm {
    pub fn new(device: Arc<dyn Device>) -> Self {
        ThreadFilm {
            film: Film::new(1, 1),
            device,
            radiance_per_pixel_normalized: Vec::new(),
            alpha: BufferSlot::new(),
            depth: BufferSlot::new(),
            position: BufferSlot::new(),
            geometry_normal: BufferSlot::new(),
            shading_normal: BufferSlot::new(),
            material_id: BufferSlot::new(),
            object_id: BufferSlot::new(),
            albedo: BufferSlot::new(),
            avg_shading_normal: BufferSlot::new(),
            sample_count: BufferSlot::new(),
            convergence: BufferSlot::new(),
            noise: BufferSlot::new(),
            user_importance: BufferSlot::new(),
            denoiser_sample_count: BufferSlot::new(),
            denoiser_squared_weight: BufferSlot::new(),
            denoiser_mean: BufferSlot::new(),
            denoiser_covariance: BufferSlot::new(),
            denoiser_histogram: BufferSlot::new(),
        }
    }

    /// (Re)allocate device buffers for exactly the engine film's enabled
    /// channel set; buffers of disabled channels are freed, not left stale.
    pub fn init(
        &mut self,
        engine_film: &Film,
        width: u32,
        height: u32,
        sub_region: [u32; 4],
    ) -> RenderResult<()> {
        let group_count = engine_film.radiance_group_count();
        if group_count > FILM_MAX_RADIANCE_GROUP_COUNT {
            return Err(RenderError::film(format!(
                "thread film cannot mirror {group_count} radiance groups (maximum {FILM_MAX_RADIANCE_GROUP_COUNT})"
            )));
        }

        self.film = Film::new(width, height);
        self.film.copy_channel_settings(engine_film);
        self.film.set_sub_region(sub_region);

        let n = (width * height) as u64;
        let device = self.device.clone();

        // Radiance groups
        while self.radiance_per_pixel_normalized.len() > group_count as usize {
            let mut slot = self.radiance_per_pixel_normalized.pop().expect("non-empty");
            device.free_buffer(&mut slot);
        }
        while self.radiance_per_pixel_normalized.len() < group_count as usize {
            self.radiance_per_pixel_normalized.push(BufferSlot::new());
        }
        if engine_film.has_channel(FilmChannel::RadiancePerPixelNormalized) {
            for slot in &mut self.radiance_per_pixel_normalized {
                device.alloc_buffer_rw(slot, n * 4 * 4, BufferRole::FilmRadianceGroup)?;
            }
        } else {
            for slot in &mut self.radiance_per_pixel_normalized {
                device.free_buffer(slot);
            }
        }

        let channel_slot = |slot: &mut BufferSlot,
                            channel: FilmChannel,
                            role: BufferRole|
         -> RenderResult<()> {
            if engine_film.has_channel(channel) {
                device.alloc_buffer_rw(slot, n * channel.float_count() as u64 * 4, role)
            } else {
                device.free_buffer(slot);
                Ok(())
            }
        };

        channel_slot(&mut self.alpha, FilmChannel::Alpha, BufferRole::FilmAlpha)?;
        channel_slot(&mut self.depth, FilmChannel::Depth, BufferRole::FilmDepth)?;
        channel_slot(&mut self.position, FilmChannel::Position, BufferRole::FilmPosition)?;
        channel_slot(
            &mut self.geometry_normal,
            FilmChannel::GeometryNormal,
            BufferRole::FilmGeometryNormal,
        )?;
        channel_slot(
            &mut self.shading_normal,
            FilmChannel::ShadingNormal,
            BufferRole::FilmShadingNormal,
        )?;
        channel_slot(
            &mut self.material_id,
            FilmChannel::MaterialId,
            BufferRole::FilmMaterialId,
        )?;
        channel_slot(&mut self.object_id, FilmChannel::ObjectId, BufferRole::FilmObjectId)?;
        channel_slot(&mut self.albedo, FilmChannel::Albedo, BufferRole::FilmAlbedo)?;
        channel_slot(
            &mut self.avg_shading_normal,
            FilmChannel::AvgShadingNormal,
            BufferRole::FilmAvgShadingNormal,
        )?;
        channel_slot(
            &mut self.sample_count,
            FilmChannel::SampleCount,
            BufferRole::FilmSampleCount,
        )?;
        channel_slot(
            &mut self.convergence,
            FilmChannel::Convergence,
            BufferRole::FilmConvergence,
        )?;
        channel_slot(&mut self.noise, FilmChannel::Noise, BufferRole::FilmNoise)?;
        channel_slot(
            &mut self.user_importance,
            FilmChannel::UserImportance,
            BufferRole::FilmUserImportance,
        )?;

        // Denoiser sample accumulators
        if engine_film.denoiser_enabled() {
            device.alloc_buffer_rw(&mut self.denoiser_sample_count, n * 4, BufferRole::DenoiserSampleCount)?;
            device.alloc_buffer_rw(
                &mut self.denoiser_squared_weight,
                n * 4,
                BufferRole::DenoiserSquaredWeight,
            )?;
            device.alloc_buffer_rw(&mut self.denoiser_mean, n * 3 * 4, BufferRole::DenoiserMean)?;
            device.alloc_buffer_rw(
                &mut self.denoiser_covariance,
                n * 6 * 4,
                BufferRole::DenoiserCovariance,
            )?;
            device.alloc_buffer_rw(
                &mut self.denoiser_histogram,
                n * 3 * 4 * 20,
                BufferRole::DenoiserHistogram,
            )?;
        } else {
            device.free_buffer(&mut self.denoiser_sample_count);
            device.free_buffer(&mut self.denoiser_squared_weight);
            device.free_buffer(&mut self.denoiser_mean);
            device.free_buffer(&mut self.denoiser_covariance);
            device.free_buffer(&mut self.denoiser_histogram);
        }

        Ok(())
    }

    pub fn free_all_buffers(&mut self) {
        let device = self.device.clone();
        for slot in &mut self.radiance_per_pixel_normalized {
            device.free_buffer(slot);
        }
        self.radiance_per_pixel_normalized.clear();
        for slot in [
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
            &mut self.convergence,
            &mut self.noise,
            &mut self.user_importance,
            &mut self.denoiser_sample_count,
            &mut self.denoiser_squared_weight,
            &mut self.denoiser_mean,
            &mut self.denoiser_covariance,
            &mut self.denoiser_histogram,
        ] {
            device.free_buffer(slot);
        }
    }

    /// Launch the film-clear kernel over the film rounded up to the
    /// kernel's work-group granularity, then zero the host mirror.
    pub fn clear(&mut self, film_clear: &dyn Kernel, work_group_size: u32) -> RenderResult<()> {
        let pixel_count = self.film.pixel_count();
        film_clear.enqueue(round_up(pixel_count, work_group_size), work_group_size)?;
        self.film.clear();
        Ok(())
    }

    /// Transfer the device planes into the host mirror.
    ///
    /// CONVERGENCE, NOISE and USER_IMPORTANCE go the other way: the engine
    /// computes them on the host, so "receiving" those channels means
    /// synchronizing the device copy from `engine_film`.
    pub fn recv_film(&mut self, engine_film: &Film) -> RenderResult<()> {
        let device = self.device.clone();

        for (slot, plane) in self
            .radiance_per_pixel_normalized
            .iter()
            .zip(self.film.radiance_per_pixel_normalized.iter_mut())
        {
            if let Some(buf) = slot.get() {
                device.enqueue_read_buffer(buf, false, bytemuck::cast_slice_mut(plane))?;
            }
        }

        if let Some(buf) = self.alpha.get() {
            device.enqueue_read_buffer(buf, false, bytemuck::cast_slice_mut(&mut self.film.alpha))?;
        }
        if let Some(buf) = self.depth.get() {
            device.enqueue_read_buffer(buf, false, bytemuck::cast_slice_mut(&mut self.film.depth))?;
        }
        if let Some(buf) = self.sample_count.get() {
            device.enqueue_read_buffer(
                buf,
                false,
                bytemuck::cast_slice_mut(&mut self.film.sample_count),
            )?;
        }
        if let Some(buf) = self.albedo.get() {
            device.enqueue_read_buffer(buf, false, bytemuck::cast_slice_mut(&mut self.film.albedo))?;
        }
        if let Some(buf) = self.avg_shading_normal.get() {
            device.enqueue_read_buffer(
                buf,
                false,
                bytemuck::cast_slice_mut(&mut self.film.avg_shading_normal),
            )?;
        }

        // Host-authoritative channels: device copy is refreshed from the
        // engine film instead of being read back.
        if let Some(buf) = self.convergence.get() {
            if engine_film.convergence.len() == self.film.convergence.len() {
                device.enqueue_write_buffer(
                    buf,
                    false,
                    bytemuck::cast_slice(&engine_film.convergence),
                )?;
            }
        }
        if let Some(buf) = self.noise.get() {
            if engine_film.noise.len() == self.film.noise.len() {
                device.enqueue_write_buffer(buf, false, bytemuck::cast_slice(&engine_film.noise))?;
            }
        }
        if let Some(buf) = self.user_importance.get() {
            if engine_film.user_importance.len() == self.film.user_importance.len() {
                device.enqueue_write_buffer(
                    buf,
                    false,
                    bytemuck::cast_slice(&engine_film.user_importance),
                )?;
            }
        }

        Ok(())
    }

    /// Push the host mirror's sample buffers to the device (start-film
    /// resume path).
    pub fn send_film(&self) -> RenderResult<()> {
        let device = self.device.clone();
        for (slot, plane) in self
            .radiance_per_pixel_normalized
            .iter()
            .zip(self.film.radiance_per_pixel_normalized.iter())
        {
            if let Some(buf) = slot.get() {
                device.enqueue_write_buffer(buf, false, bytemuck::cast_slice(plane))?;
            }
        }
        if let Some(buf) = self.alpha.get() {
            device.enqueue_write_buffer(buf, false, bytemuck::cast_slice(&self.film.alpha))?;
        }
        if let Some(buf) = self.depth.get() {
            device.enqueue_write_buffer(buf, false, bytemuck::cast_slice(&self.film.depth))?;
        }
        if let Some(buf) = self.sample_count.get() {
            device.enqueue_write_buffer(buf, false, bytemuck::cast_slice(&self.film.sample_count))?;
        }
        Ok(())
    }

    /// Append the film block of the shared kernel argument list, in
    /// ordinal order.
    pub fn push_film_kernel_args<'a>(&'a self, args: &mut Vec<KernelArg<'a>>) {
        args.push(KernelArg::U32(self.film.width()));
        args.push(KernelArg::U32(self.film.height()));
        for v in self.film.sub_region() {
            args.push(KernelArg::U32(v));
        }
        for group in 0..FILM_MAX_RADIANCE_GROUP_COUNT as usize {
            args.push(KernelArg::Buffer(
                self.radiance_per_pixel_normalized
                    .get(group)
                    .and_then(|slot| slot.get()),
            ));
        }
        args.push(KernelArg::Buffer(self.alpha.get()));
        args.push(KernelArg::Buffer(self.depth.get()));
        args.push(KernelArg::Buffer(self.sample_count.get()));
        args.push(KernelArg::Buffer(self.convergence.get()));
        args.push(KernelArg::Buffer(self.noise.get()));
        args.push(KernelArg::Buffer(self.user_importance.get()));
    }

    /// Identity of every live channel buffer, for reallocation checks.
    pub fn buffer_ids(&self) -> Vec<Option<u64>> {
        let mut ids: Vec<Option<u64>> = self
            .radiance_per_pixel_normalized
            .iter()
            .map(|s| s.id())
            .collect();
        ids.extend([
            self.alpha.id(),
            self.depth.id(),
            self.sample_count.id(),
            self.convergence.id(),
            self.noise.id(),
            self.user_importance.id(),
        ]);
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::NativeDevice;

    #[test]
    fn init_allocates_exactly_the_enabled_channels() {
        let device = NativeDevice::new("cpu-test");
        let mut engine_film = Film::new(8, 8);
        engine_film.add_channel(FilmChannel::Depth);
        engine_film.init();

        let mut tf = ThreadFilm::new(device.clone());
        tf.init(&engine_film, 8, 8, [0, 7, 0, 7]).unwrap();

        assert_eq!(tf.radiance_per_pixel_normalized.len(), 1);
        assert!(!tf.radiance_per_pixel_normalized[0].is_null());
        assert_eq!(tf.radiance_per_pixel_normalized[0].size(), 8 * 8 * 4 * 4);
        assert!(!tf.depth.is_null());
        assert_eq!(tf.depth.size(), 8 * 8 * 4);
        assert!(tf.alpha.is_null());

        // Disabling a channel frees its buffer on re-init
        engine_film.remove_channel(FilmChannel::Depth);
        tf.init(&engine_film, 8, 8, [0, 7, 0, 7]).unwrap();
        assert!(tf.depth.is_null());
    }

    #[test]
    fn too_many_radiance_groups_is_a_hard_error() {
        let device = NativeDevice::new("cpu-test");
        let mut engine_film = Film::new(8, 8);
        // The film itself refuses more than the maximum; nothing gets
        // allocated on the device for a rejected request.
        assert!(engine_film.set_radiance_group_count(9).is_err());
        assert_eq!(device.memory().buffer_count(), 0);

        // The maximum itself is fine
        engine_film.set_radiance_group_count(8).unwrap();
        engine_film.init();
        let mut tf = ThreadFilm::new(device.clone());
        tf.init(&engine_film, 8, 8, [0, 7, 0, 7]).unwrap();
        assert_eq!(device.memory().buffer_count(), 8);
    }

    #[test]
    fn free_all_buffers_releases_device_memory_but_keeps_the_film() {
        let device = NativeDevice::new("cpu-test");
        let engine_film = Film::new(4, 4);
        let mut tf = ThreadFilm::new(device.clone());
        tf.init(&engine_film, 4, 4, [0, 3, 0, 3]).unwrap();
        assert!(device.memory().used_bytes() > 0);

        tf.film.radiance_per_pixel_normalized[0][0] = 42.0;
        tf.free_all_buffers();
        assert_eq!(device.memory().used_bytes(), 0);
        // Host mirror survives for image saving
        assert_eq!(tf.film.radiance_per_pixel_normalized[0][0], 42.0);
    }
}
