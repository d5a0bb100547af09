//! Compute device abstraction
//!
//! A `Device` is one compute unit (GPU or CPU) able to hold role-tagged
//! memory buffers, compile kernel programs and enqueue kernel launches.
//! Render threads own their buffers through `BufferSlot`, a scoped slot
//! that releases the underlying allocation when freed or dropped, so no
//! exit path of a thread can leak device memory.

mod native;
mod wgpu_device;

pub use native::{Intersector, MissEverything, NativeDevice};
pub use wgpu_device::WgpuDevice;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{RenderError, RenderResult};

/// Content role of a device buffer.
///
/// Every allocation carries the role of the data it holds; the role ties a
/// buffer's lifetime to the scene subsystem (or task/film group) that last
/// populated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    // Scene subsystems
    Camera,
    Vertices,
    Normals,
    TriangleNormals,
    Uvs,
    Colors,
    Alphas,
    Triangles,
    InterpolatedTransforms,
    MeshDescs,
    SceneObjects,
    Materials,
    Textures,
    Lights,
    EnvLightIndices,
    LightIndexOffsetByMesh,
    LightIndexByTri,
    EnvLightDistributions,
    LightsDistribution,
    InfiniteLightDistribution,
    ImageMapDescs,
    ImageMapPage,
    PhotonRadianceEntries,
    PhotonRadianceBvhNodes,
    PhotonCausticEntries,
    PhotonCausticBvhNodes,
    // Per-task state
    TaskConfig,
    Tasks,
    TasksDirectLight,
    TasksState,
    TaskStats,
    SamplerSharedData,
    Samples,
    SampleData,
    SampleResults,
    EyePathInfos,
    DirectLightVolInfos,
    PixelFilter,
    Rays,
    Hits,
    // Per-film channel planes
    FilmRadianceGroup,
    FilmAlpha,
    FilmDepth,
    FilmPosition,
    FilmGeometryNormal,
    FilmShadingNormal,
    FilmMaterialId,
    FilmObjectId,
    FilmAlbedo,
    FilmAvgShadingNormal,
    FilmSampleCount,
    FilmConvergence,
    FilmNoise,
    FilmUserImportance,
    DenoiserSampleCount,
    DenoiserSquaredWeight,
    DenoiserMean,
    DenoiserCovariance,
    DenoiserHistogram,
    MergeAccumulator,
}

impl BufferRole {
    pub fn name(self) -> &'static str {
        match self {
            BufferRole::Camera => "Camera",
            BufferRole::Vertices => "Vertices",
            BufferRole::Normals => "Normals",
            BufferRole::TriangleNormals => "TriangleNormals",
            BufferRole::Uvs => "UVs",
            BufferRole::Colors => "Colors",
            BufferRole::Alphas => "Alphas",
            BufferRole::Triangles => "Triangles",
            BufferRole::InterpolatedTransforms => "InterpolatedTransforms",
            BufferRole::MeshDescs => "MeshDescs",
            BufferRole::SceneObjects => "SceneObjects",
            BufferRole::Materials => "Materials",
            BufferRole::Textures => "Textures",
            BufferRole::Lights => "Lights",
            BufferRole::EnvLightIndices => "EnvLightIndices",
            BufferRole::LightIndexOffsetByMesh => "LightIndexOffsetByMesh",
            BufferRole::LightIndexByTri => "LightIndexByTri",
            BufferRole::EnvLightDistributions => "EnvLightDistributions",
            BufferRole::LightsDistribution => "LightsDistribution",
            BufferRole::InfiniteLightDistribution => "InfiniteLightDistribution",
            BufferRole::ImageMapDescs => "ImageMapDescs",
            BufferRole::ImageMapPage => "ImageMapPage",
            BufferRole::PhotonRadianceEntries => "PhotonRadianceEntries",
            BufferRole::PhotonRadianceBvhNodes => "PhotonRadianceBvhNodes",
            BufferRole::PhotonCausticEntries => "PhotonCausticEntries",
            BufferRole::PhotonCausticBvhNodes => "PhotonCausticBvhNodes",
            BufferRole::TaskConfig => "TaskConfig",
            BufferRole::Tasks => "Tasks",
            BufferRole::TasksDirectLight => "TasksDirectLight",
            BufferRole::TasksState => "TasksState",
            BufferRole::TaskStats => "TaskStats",
            BufferRole::SamplerSharedData => "SamplerSharedData",
            BufferRole::Samples => "Samples",
            BufferRole::SampleData => "SampleData",
            BufferRole::SampleResults => "SampleResults",
            BufferRole::EyePathInfos => "EyePathInfos",
            BufferRole::DirectLightVolInfos => "DirectLightVolInfos",
            BufferRole::PixelFilter => "PixelFilter",
            BufferRole::Rays => "Rays",
            BufferRole::Hits => "Hits",
            BufferRole::FilmRadianceGroup => "FilmRadianceGroup",
            BufferRole::FilmAlpha => "FilmAlpha",
            BufferRole::FilmDepth => "FilmDepth",
            BufferRole::FilmPosition => "FilmPosition",
            BufferRole::FilmGeometryNormal => "FilmGeometryNormal",
            BufferRole::FilmShadingNormal => "FilmShadingNormal",
            BufferRole::FilmMaterialId => "FilmMaterialId",
            BufferRole::FilmObjectId => "FilmObjectId",
            BufferRole::FilmAlbedo => "FilmAlbedo",
            BufferRole::FilmAvgShadingNormal => "FilmAvgShadingNormal",
            BufferRole::FilmSampleCount => "FilmSampleCount",
            BufferRole::FilmConvergence => "FilmConvergence",
            BufferRole::FilmNoise => "FilmNoise",
            BufferRole::FilmUserImportance => "FilmUserImportance",
            BufferRole::DenoiserSampleCount => "DenoiserSampleCount",
            BufferRole::DenoiserSquaredWeight => "DenoiserSquaredWeight",
            BufferRole::DenoiserMean => "DenoiserMean",
            BufferRole::DenoiserCovariance => "DenoiserCovariance",
            BufferRole::DenoiserHistogram => "DenoiserHistogram",
            BufferRole::MergeAccumulator => "MergeAccumulator",
        }
    }
}

/// Host visibility of a buffer's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferAccess {
    /// Uploaded once from host data, read-only on the device.
    ReadOnly,
    /// Device read-write working memory.
    ReadWrite,
}

/// Backend storage behind a device buffer.
pub enum BufferStorage {
    Gpu(wgpu::Buffer),
    Host(Arc<Mutex<Vec<u8>>>),
}

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// One block of device memory with an owner-visible identity.
///
/// The allocation is released when the last reference drops; the per-device
/// memory tracker is decremented at that point.
pub struct DeviceBuffer {
    id: u64,
    size: u64,
    role: BufferRole,
    access: BufferAccess,
    storage: BufferStorage,
    tracker: Arc<MemoryTracker>,
}

impl DeviceBuffer {
    pub(crate) fn new(
        size: u64,
        role: BufferRole,
        access: BufferAccess,
        storage: BufferStorage,
        tracker: Arc<MemoryTracker>,
    ) -> Self {
        tracker.track_alloc(size);
        let id = NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed);
        DeviceBuffer {
            id,
            size,
            role,
            access,
            storage,
            tracker,
        }
    }

    /// Unique identity of this allocation; a re-used slot keeps its id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn role(&self) -> BufferRole {
        self.role
    }

    pub fn access(&self) -> BufferAccess {
        self.access
    }

    pub fn gpu(&self) -> Option<&wgpu::Buffer> {
        match &self.storage {
            BufferStorage::Gpu(b) => Some(b),
            BufferStorage::Host(_) => None,
        }
    }

    pub fn host(&self) -> Option<&Arc<Mutex<Vec<u8>>>> {
        match &self.storage {
            BufferStorage::Host(v) => Some(v),
            BufferStorage::Gpu(_) => None,
        }
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.tracker.track_free(self.size);
    }
}

/// Owned slot for one device buffer.
///
/// A slot is either null or holds memory sized exactly for the current
/// subsystem instance; re-populating a subsystem goes through the owning
/// device's alloc methods, which free a stale allocation first.
#[derive(Default)]
pub struct BufferSlot(Option<Arc<DeviceBuffer>>);

impl BufferSlot {
    pub fn new() -> Self {
        BufferSlot(None)
    }

    pub fn is_null(&self) -> bool {
        self.0.is_none()
    }

    pub fn get(&self) -> Option<&Arc<DeviceBuffer>> {
        self.0.as_ref()
    }

    /// Byte size of the held allocation; 0 when null.
    pub fn size(&self) -> u64 {
        self.0.as_ref().map_or(0, |b| b.size())
    }

    /// Identity of the held allocation, for reallocation checks.
    pub fn id(&self) -> Option<u64> {
        self.0.as_ref().map(|b| b.id())
    }

    pub fn free(&mut self) {
        self.0 = None;
    }

    pub(crate) fn replace(&mut self, buf: DeviceBuffer) {
        self.0 = Some(Arc::new(buf));
    }
}

/// Per-device memory accounting.
///
/// Lock-free counters consulted on every allocation; the single-allocation
/// limit is enforced by the device itself.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    used_bytes: AtomicU64,
    peak_bytes: AtomicU64,
    buffer_count: AtomicUsize,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track_alloc(&self, size: u64) {
        let used = self.used_bytes.fetch_add(size, Ordering::Relaxed) + size;
        self.peak_bytes.fetch_max(used, Ordering::Relaxed);
        self.buffer_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn track_free(&self, size: u64) {
        self.used_bytes.fetch_sub(size, Ordering::Relaxed);
        self.buffer_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Relaxed)
    }

    pub fn peak_bytes(&self) -> u64 {
        self.peak_bytes.load(Ordering::Relaxed)
    }

    pub fn buffer_count(&self) -> usize {
        self.buffer_count.load(Ordering::Relaxed)
    }
}

/// Compiled program bytes as produced by `Device::compile_program`.
///
/// Opaque to everything but the device that produced it; the kernel cache
/// stores these verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramBlob {
    pub data: Vec<u8>,
}

/// One kernel argument, bound by ordinal position.
pub enum KernelArg<'a> {
    /// A device buffer, or a null binding for an absent optional buffer.
    Buffer(Option<&'a Arc<DeviceBuffer>>),
    U32(u32),
    F32(f32),
}

/// A bound, launchable kernel entry point.
pub trait Kernel: Send {
    fn name(&self) -> &str;

    /// Device-reported preferred work-group size for this entry point.
    fn preferred_work_group_size(&self) -> u32;

    /// Bind the full argument list in ordinal order.
    ///
    /// Must be re-run after every program reload or buffer reallocation;
    /// previously bound arguments are invalid after either event.
    fn set_args(&mut self, args: &[KernelArg<'_>]) -> RenderResult<()>;

    /// Enqueue a launch over `global` items in groups of `local`.
    ///
    /// Enqueues are ordered per device; completion is observed via
    /// `Device::finish`.
    fn enqueue(&self, global: u32, local: u32) -> RenderResult<()>;
}

/// A compiled program holding one or more kernel entry points.
pub trait Program: Send {
    fn kernel(&self, name: &str) -> RenderResult<Box<dyn Kernel>>;
}

/// One compute unit.
pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    fn memory(&self) -> &MemoryTracker;

    /// Largest single allocation this device accepts.
    fn max_memory_alloc_size(&self) -> u64;

    /// Enter a device-call bracket on the calling thread.
    ///
    /// Several render threads may share one driver context; every device
    /// call sequence is wrapped in push/pop so the association is explicit.
    fn push_current(&self);
    fn pop_current(&self);

    /// Upload `src` into `slot` as read-only data.
    ///
    /// A same-size live allocation is reused (content rewritten in place,
    /// identity kept); a differently sized one is freed first.
    fn alloc_buffer_ro(
        &self,
        slot: &mut BufferSlot,
        src: &[u8],
        role: BufferRole,
    ) -> RenderResult<()>;

    /// Allocate `size` bytes of device working memory into `slot`.
    fn alloc_buffer_rw(&self, slot: &mut BufferSlot, size: u64, role: BufferRole)
        -> RenderResult<()>;

    fn free_buffer(&self, slot: &mut BufferSlot);

    /// Compile `source` under `params` into an opaque program blob.
    ///
    /// The blob is what the persistent kernel cache stores; it must be
    /// loadable by `load_program` on a device of the same kind.
    fn compile_program(&self, params: &str, source: &str) -> RenderResult<ProgramBlob>;

    fn load_program(&self, blob: &ProgramBlob) -> RenderResult<Box<dyn Program>>;

    /// Ordered device→host transfer; waits for completion when `blocking`.
    fn enqueue_read_buffer(
        &self,
        buf: &DeviceBuffer,
        blocking: bool,
        dst: &mut [u8],
    ) -> RenderResult<()>;

    /// Ordered host→device transfer; waits for completion when `blocking`.
    fn enqueue_write_buffer(
        &self,
        buf: &DeviceBuffer,
        blocking: bool,
        src: &[u8],
    ) -> RenderResult<()>;

    /// Block until all enqueued work has drained.
    fn finish(&self) -> RenderResult<()>;
}

/// Shared allocation-size validation for device implementations.
pub(crate) fn check_alloc_size(
    device_name: &str,
    role: BufferRole,
    size: u64,
    max: u64,
) -> RenderResult<()> {
    if size > max {
        return Err(RenderError::out_of_device_memory(format!(
            "{} buffer of {} bytes exceeds the {} byte allocation limit of device {}",
            role.name(),
            size,
            max,
            device_name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_counts_alloc_and_free() {
        let tracker = Arc::new(MemoryTracker::new());
        let buf = DeviceBuffer::new(
            256,
            BufferRole::Materials,
            BufferAccess::ReadOnly,
            BufferStorage::Host(Arc::new(Mutex::new(vec![0u8; 256]))),
            tracker.clone(),
        );
        assert_eq!(tracker.used_bytes(), 256);
        assert_eq!(tracker.buffer_count(), 1);
        drop(buf);
        assert_eq!(tracker.used_bytes(), 0);
        assert_eq!(tracker.buffer_count(), 0);
        assert_eq!(tracker.peak_bytes(), 256);
    }

    #[test]
    fn slot_reports_size_and_identity() {
        let tracker = Arc::new(MemoryTracker::new());
        let mut slot = BufferSlot::new();
        assert!(slot.is_null());
        assert_eq!(slot.size(), 0);

        slot.replace(DeviceBuffer::new(
            64,
            BufferRole::Lights,
            BufferAccess::ReadOnly,
            BufferStorage::Host(Arc::new(Mutex::new(vec![0u8; 64]))),
            tracker.clone(),
        ));
        assert_eq!(slot.size(), 64);
        let id = slot.id().unwrap();

        slot.free();
        assert!(slot.is_null());
        assert_eq!(tracker.used_bytes(), 0);
        assert_ne!(Some(id), slot.id());
    }

    #[test]
    fn oversized_allocation_is_rejected() {
        let err = check_alloc_size("cpu", BufferRole::ImageMapPage, 1 << 30, 1 << 20).unwrap_err();
        assert!(matches!(
            err,
            crate::error::RenderError::OutOfDeviceMemory(_)
        ));
    }
}
