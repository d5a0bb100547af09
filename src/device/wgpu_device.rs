//! wgpu compute device
//!
//! Buffers are storage buffers; a compiled program is a validated WGSL
//! module and the cacheable "binary" is the fully assembled source text.
//! Kernel arguments arrive as one flat ordinal list and are packed into
//! bind groups of eight bindings, with every scalar argument folded into a
//! single uniform block bound after the last buffer group — the WGSL side
//! declares the same coordinates.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::device::{
    check_alloc_size, BufferAccess, BufferRole, BufferSlot, BufferStorage, Device, DeviceBuffer,
    Kernel, KernelArg, MemoryTracker, Program, ProgramBlob,
};
use crate::error::{RenderError, RenderResult};
use crate::gpu::WgpuContext;

/// Bindings per bind group; with the 8 bind-group limit this bounds the
/// argument list at 64 slots.
const BINDINGS_PER_GROUP: usize = 8;

/// Work-group size every kernel is authored with.
pub const WORK_GROUP_SIZE: u32 = 64;

pub struct WgpuDevice {
    name: String,
    context: Arc<WgpuContext>,
    tracker: Arc<MemoryTracker>,
    current_depth: AtomicUsize,
}

impl WgpuDevice {
    pub fn new(context: Arc<WgpuContext>) -> Arc<Self> {
        let name = context.adapter.get_info().name;
        Arc::new(WgpuDevice {
            name,
            context,
            tracker: Arc::new(MemoryTracker::new()),
            current_depth: AtomicUsize::new(0),
        })
    }

    fn create_storage_buffer(&self, size: u64, role: BufferRole) -> wgpu::Buffer {
        self.context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(role.name()),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }
}

impl Device for WgpuDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn memory(&self) -> &MemoryTracker {
        &self.tracker
    }

    fn max_memory_alloc_size(&self) -> u64 {
        self.context.device.limits().max_buffer_size
    }

    fn push_current(&self) {
        self.current_depth.fetch_add(1, Ordering::AcqRel);
    }

    fn pop_current(&self) {
        let prev = self.current_depth.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "pop_current without a matching push_current");
    }

    fn alloc_buffer_ro(
        &self,
        slot: &mut BufferSlot,
        src: &[u8],
        role: BufferRole,
    ) -> RenderResult<()> {
        let size = src.len() as u64;
        check_alloc_size(&self.name, role, size, self.max_memory_alloc_size())?;

        // Same-size live allocation: rewrite in place, identity kept
        if let Some(buf) = slot.get() {
            if buf.size() == size && buf.role() == role {
                let gpu = buf.gpu().expect("wgpu buffer storage");
                self.context.queue.write_buffer(gpu, 0, src);
                return Ok(());
            }
        }

        slot.free();
        log::debug!("[{}] Allocating {} buffer: {} bytes", self.name, role.name(), size);
        let buffer = self.create_storage_buffer(size.max(4), role);
        self.context.queue.write_buffer(&buffer, 0, src);
        slot.replace(DeviceBuffer::new(
            size,
            role,
            BufferAccess::ReadOnly,
            BufferStorage::Gpu(buffer),
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
        let buffer = self.create_storage_buffer(size.max(4), role);
        slot.replace(DeviceBuffer::new(
            size,
            role,
            BufferAccess::ReadWrite,
            BufferStorage::Gpu(buffer),
            self.tracker.clone(),
        ));
        Ok(())
    }

    fn free_buffer(&self, slot: &mut BufferSlot) {
        slot.free();
    }

    fn compile_program(&self, params: &str, source: &str) -> RenderResult<ProgramBlob> {
        let _ = params; // folded into the source's const block by assembly
        if source.is_empty() {
            return Err(RenderError::kernel_compile("empty kernel source"));
        }

        self.context
            .device
            .push_error_scope(wgpu::ErrorFilter::Validation);
        let _module = self
            .context
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("trace3d-kernels"),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        if let Some(err) = pollster::block_on(self.context.device.pop_error_scope()) {
            return Err(RenderError::kernel_compile(format!("{err}")));
        }

        Ok(ProgramBlob {
            data: source.as_bytes().to_vec(),
        })
    }

    fn load_program(&self, blob: &ProgramBlob) -> RenderResult<Box<dyn Program>> {
        let source = std::str::from_utf8(&blob.data)
            .map_err(|_| RenderError::kernel_compile("program blob is not UTF-8 WGSL"))?;

        self.context
            .device
            .push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .context
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("trace3d-kernels"),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        if let Some(err) = pollster::block_on(self.context.device.pop_error_scope()) {
            return Err(RenderError::kernel_compile(format!("{err}")));
        }

        Ok(Box::new(WgpuProgram {
            module: Arc::new(module),
            context: self.context.clone(),
        }))
    }

    fn enqueue_read_buffer(
        &self,
        buf: &DeviceBuffer,
        _blocking: bool,
        dst: &mut [u8],
    ) -> RenderResult<()> {
        let gpu = buf
            .gpu()
            .ok_or_else(|| RenderError::readback("buffer is not device-resident"))?;
        let size = dst.len() as u64;
        if size > buf.size() {
            return Err(RenderError::readback(format!(
                "read of {size} bytes from a {} byte buffer",
                buf.size()
            )));
        }

        let staging = self.context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback-staging"),
            size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback-encoder"),
            });
        encoder.copy_buffer_to_buffer(gpu, 0, &staging, 0, size);
        self.context.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.context.device.poll(wgpu::Maintain::Wait);
        match pollster::block_on(receiver.receive()) {
            Some(Ok(())) => {}
            _ => return Err(RenderError::readback("buffer map failed")),
        }
        dst.copy_from_slice(&slice.get_mapped_range());
        staging.unmap();
        Ok(())
    }

    fn enqueue_write_buffer(
        &self,
        buf: &DeviceBuffer,
        _blocking: bool,
        src: &[u8],
    ) -> RenderResult<()> {
        let gpu = buf
            .gpu()
            .ok_or_else(|| RenderError::upload("buffer is not device-resident"))?;
        if src.len() as u64 > buf.size() {
            return Err(RenderError::upload(format!(
                "write of {} bytes into a {} byte buffer",
                src.len(),
                buf.size()
            )));
        }
        self.context.queue.write_buffer(gpu, 0, src);
        Ok(())
    }

    fn finish(&self) -> RenderResult<()> {
        self.context.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }
}

//------------------------------------------------------------------------------
// Program / kernel
//------------------------------------------------------------------------------

struct WgpuProgram {
    module: Arc<wgpu::ShaderModule>,
    context: Arc<WgpuContext>,
}

impl Program for WgpuProgram {
    fn kernel(&self, name: &str) -> RenderResult<Box<dyn Kernel>> {
        Ok(Box::new(WgpuKernel {
            entry: name.to_string(),
            module: self.module.clone(),
            context: self.context.clone(),
            bound: Mutex::new(None),
        }))
    }
}

struct BoundState {
    pipeline: wgpu::ComputePipeline,
    bind_groups: Vec<wgpu::BindGroup>,
    // Keeps dummy and scalar buffers alive alongside the bind groups
    _scalar_buffer: wgpu::Buffer,
    _dummy_buffer: wgpu::Buffer,
}

struct WgpuKernel {
    entry: String,
    module: Arc<wgpu::ShaderModule>,
    context: Arc<WgpuContext>,
    bound: Mutex<Option<BoundState>>,
}

impl Kernel for WgpuKernel {
    fn name(&self) -> &str {
        &self.entry
    }

    fn preferred_work_group_size(&self) -> u32 {
        // wgpu exposes no per-kernel preferred size query; kernels are
        // authored with one fixed workgroup size.
        WORK_GROUP_SIZE
    }

    fn set_args(&mut self, args: &[KernelArg<'_>]) -> RenderResult<()> {
        let device = &self.context.device;

        // Split the ordinal list: buffers keep their relative order, all
        // scalars are packed into one uniform block.
        let mut buffers: Vec<Option<&DeviceBuffer>> = Vec::new();
        let mut scalars: Vec<u32> = Vec::new();
        for arg in args {
            match arg {
                KernelArg::Buffer(b) => buffers.push(b.map(|b| b.as_ref())),
                KernelArg::U32(v) => scalars.push(*v),
                KernelArg::F32(v) => scalars.push(v.to_bits()),
            }
        }

        let dummy_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("null-binding"),
            size: 4,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });

        // Uniform blocks round up to 16 bytes
        while scalars.len() % 4 != 0 {
            scalars.push(0);
        }
        let scalar_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("scalar-args"),
            size: (scalars.len() * 4).max(16) as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.context
            .queue
            .write_buffer(&scalar_buffer, 0, bytemuck::cast_slice(&scalars));

        // Buffer bind groups, eight bindings each
        let mut layouts = Vec::new();
        let mut bind_groups = Vec::new();
        for chunk in buffers.chunks(BINDINGS_PER_GROUP) {
            let layout_entries: Vec<wgpu::BindGroupLayoutEntry> = (0..chunk.len())
                .map(|i| wgpu::BindGroupLayoutEntry {
                    binding: i as u32,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                })
                .collect();
            let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("kernel-args-layout"),
                entries: &layout_entries,
            });

            let group_entries: Vec<wgpu::BindGroupEntry> = chunk
                .iter()
                .enumerate()
                .map(|(i, buf)| wgpu::BindGroupEntry {
                    binding: i as u32,
                    resource: match buf {
                        Some(b) => b
                            .gpu()
                            .expect("wgpu buffer storage")
                            .as_entire_binding(),
                        None => dummy_buffer.as_entire_binding(),
                    },
                })
                .collect();
            bind_groups.push(device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("kernel-args"),
                layout: &layout,
                entries: &group_entries,
            }));
            layouts.push(layout);
        }

        // Scalar uniform group, bound after the last buffer group
        let scalar_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("scalar-args-layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });
        bind_groups.push(device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("scalar-args"),
            layout: &scalar_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: scalar_buffer.as_entire_binding(),
            }],
        }));
        layouts.push(scalar_layout);

        let layout_refs: Vec<&wgpu::BindGroupLayout> = layouts.iter().collect();
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("kernel-pipeline-layout"),
            bind_group_layouts: &layout_refs,
            push_constant_ranges: &[],
        });

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(&self.entry),
            layout: Some(&pipeline_layout),
            module: &self.module,
            entry_point: &self.entry,
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(RenderError::kernel_compile(format!(
                "pipeline for {}: {err}",
                self.entry
            )));
        }

        *self.bound.lock().unwrap() = Some(BoundState {
            pipeline,
            bind_groups,
            _scalar_buffer: scalar_buffer,
            _dummy_buffer: dummy_buffer,
        });
        Ok(())
    }

    fn enqueue(&self, global: u32, local: u32) -> RenderResult<()> {
        let bound = self.bound.lock().unwrap();
        let bound = bound
            .as_ref()
            .ok_or_else(|| RenderError::device("kernel launched before set_args"))?;

        let mut encoder = self
            .context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("kernel-launch"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&self.entry),
                timestamp_writes: None,
            });
            pass.set_pipeline(&bound.pipeline);
            for (i, group) in bound.bind_groups.iter().enumerate() {
                pass.set_bind_group(i as u32, group, &[]);
            }
            let local = local.max(1);
            pass.dispatch_workgroups((global + local - 1) / local, 1, 1);
        }
        self.context.queue.submit(Some(encoder.finish()));
        Ok(())
    }
}
