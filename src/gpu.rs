use crate::error::{RenderError, RenderResult};

/// Owned wgpu device/queue/adapter bundle.
///
/// Constructed explicitly by the caller and handed to `WgpuDevice::new`;
/// several render threads may share one context, each bracketing its device
/// calls with the push/pop current-device discipline.
pub struct WgpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter: wgpu::Adapter,
}

impl WgpuContext {
    /// Create a context on the best available adapter.
    ///
    /// The kernel argument list binds one storage buffer per ordinal, so the
    /// device is requested with raised bind-group and storage-buffer limits.
    /// An adapter that cannot satisfy them is unusable for the device kernel
    /// path and the error is fatal.
    pub fn create() -> RenderResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| RenderError::device("no suitable GPU adapter"))?;

        let limits = wgpu::Limits {
            max_bind_groups: 8,
            max_storage_buffers_per_shader_stage: 64,
            ..wgpu::Limits::default()
        };

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                required_features: wgpu::Features::empty(),
                required_limits: limits,
                label: Some("trace3d-device"),
            },
            None,
        ))
        .map_err(|e| RenderError::device(format!("request_device failed: {e}")))?;

        Ok(WgpuContext {
            device,
            queue,
            adapter,
        })
    }
}

/// Align to WebGPU's required bytes-per-row for copies.
#[inline]
pub fn align_copy_bpr(unpadded: u32) -> u32 {
    let a = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    ((unpadded + a - 1) / a) * a
}

/// Round `count` up to a multiple of the work-group granularity.
#[inline]
pub fn round_up(count: u32, work_group_size: u32) -> u32 {
    debug_assert!(work_group_size > 0);
    ((count + work_group_size - 1) / work_group_size) * work_group_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_to_work_group_granularity() {
        assert_eq!(round_up(0, 64), 0);
        assert_eq!(round_up(1, 64), 64);
        assert_eq!(round_up(64, 64), 64);
        assert_eq!(round_up(65, 64), 128);
    }
}
