use std::ptr::NonNull;

use ash::{prelude::VkResult, vk};

use crate::MemoryBarrier;

/// Ray tracing capabilities reported by the running driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RayTracingSupport {
    pub acceleration_structure: bool,
    pub ray_tracing_pipeline: bool,
    pub ray_query: bool,
}

impl RayTracingSupport {
    pub const NONE: Self = Self {
        acceleration_structure: false,
        ray_tracing_pipeline: false,
        ray_query: false,
    };
    pub const FULL: Self = Self {
        acceleration_structure: true,
        ray_tracing_pipeline: true,
        ray_query: true,
    };

    /// Acceleration structures alone are useless without a way to trace against them.
    pub fn is_supported(&self) -> bool {
        self.acceleration_structure && (self.ray_tracing_pipeline || self.ray_query)
    }
}

#[derive(Debug, Clone)]
pub struct BufferInfo<'a> {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    /// Host visible buffers are persistently mapped, see [`RtDevice::mapped_ptr`].
    pub host_visible: bool,
    pub name: &'a str,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccelStructSizes {
    pub size: vk::DeviceSize,
    pub build_scratch_size: vk::DeviceSize,
    pub update_scratch_size: vk::DeviceSize,
}

/// One triangle geometry of a bottom level acceleration structure.
/// All data pointers are absolute device addresses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlasGeometry {
    pub vertex_format: vk::Format,
    pub vertex_data: vk::DeviceAddress,
    pub vertex_stride: vk::DeviceSize,
    pub max_vertex: u32,
    pub index_type: vk::IndexType,
    pub index_data: vk::DeviceAddress,
    /// Number of triangles to be built, where each triangle is treated as 3 indices.
    pub primitive_count: u32,
    pub flags: vk::GeometryFlagsKHR,
}

pub struct BlasBuildInfo<'a, D: RtDevice + ?Sized> {
    pub dst: &'a D::AccelStruct,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub geometries: &'a [BlasGeometry],
    pub scratch_data: vk::DeviceAddress,
}

pub struct TlasBuildInfo<'a, D: RtDevice + ?Sized> {
    pub dst: &'a D::AccelStruct,
    /// Must be `Some` when `mode` is `UPDATE`.
    pub src: Option<&'a D::AccelStruct>,
    pub mode: vk::BuildAccelerationStructureModeKHR,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    /// Tightly packed `vk::AccelerationStructureInstanceKHR` records.
    pub instance_data: vk::DeviceAddress,
    pub instance_count: u32,
    pub scratch_data: vk::DeviceAddress,
}

/// The narrow set of graphics API capabilities the acceleration structure manager relies on.
///
/// Command recording methods take the backend's command buffer explicitly; submission
/// and queue synchronization stay with the caller.
pub trait RtDevice: Send + Sync + 'static {
    type Buffer: Send + Sync + 'static;
    type AccelStruct: Send + Sync + 'static;
    type CommandBuffer;

    fn ray_tracing_support(&self) -> RayTracingSupport;
    fn min_scratch_offset_alignment(&self) -> u32;

    fn create_buffer(&self, info: &BufferInfo) -> VkResult<Self::Buffer>;
    fn destroy_buffer(&self, buffer: Self::Buffer);
    fn buffer_device_address(&self, buffer: &Self::Buffer) -> vk::DeviceAddress;
    /// Start of the persistent mapping of a host visible buffer. `None` for device local buffers.
    fn mapped_ptr(&self, buffer: &Self::Buffer) -> Option<NonNull<u8>>;

    fn blas_build_sizes(
        &self,
        flags: vk::BuildAccelerationStructureFlagsKHR,
        geometries: &[BlasGeometry],
    ) -> AccelStructSizes;
    fn tlas_build_sizes(
        &self,
        flags: vk::BuildAccelerationStructureFlagsKHR,
        instance_count: u32,
    ) -> AccelStructSizes;
    fn create_accel_struct(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        size: vk::DeviceSize,
        name: &str,
    ) -> VkResult<Self::AccelStruct>;
    fn destroy_accel_struct(&self, accel_struct: Self::AccelStruct);
    fn accel_struct_device_address(&self, accel_struct: &Self::AccelStruct) -> vk::DeviceAddress;

    fn cmd_copy_buffer(
        &self,
        cmd: &mut Self::CommandBuffer,
        src: &Self::Buffer,
        dst: &Self::Buffer,
        regions: &[vk::BufferCopy],
    );
    fn cmd_pipeline_barrier(&self, cmd: &mut Self::CommandBuffer, barrier: &MemoryBarrier);
    fn cmd_build_blas(&self, cmd: &mut Self::CommandBuffer, infos: &[BlasBuildInfo<'_, Self>]);
    fn cmd_build_tlas(&self, cmd: &mut Self::CommandBuffer, info: &TlasBuildInfo<'_, Self>);

    /// Records `barrier` unless it is empty.
    fn cmd_barrier_if_needed(&self, cmd: &mut Self::CommandBuffer, barrier: MemoryBarrier) {
        if !barrier.is_empty() {
            self.cmd_pipeline_barrier(cmd, &barrier);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_support_requires_a_tracing_path() {
        assert!(!RayTracingSupport::NONE.is_supported());
        assert!(RayTracingSupport::FULL.is_supported());
        assert!(!RayTracingSupport {
            acceleration_structure: true,
            ..Default::default()
        }
        .is_supported());
        assert!(RayTracingSupport {
            acceleration_structure: true,
            ray_query: true,
            ..Default::default()
        }
        .is_supported());
    }
}
