//! An [`RtDevice`] without a GPU.
//!
//! Buffers are backed by host memory, copies execute while they are recorded and every
//! command is appended to the command buffer (a plain `Vec<HeadlessCommand>`), so the
//! behaviour of the acceleration structure manager can be inspected without a driver.
//! Misuse that a validation layer would catch (double destruction, building a destroyed
//! structure, updating without a source) panics.

use std::{collections::HashMap, ptr::NonNull, sync::Mutex};

use ash::{prelude::VkResult, vk};

use crate::{
    AccelStructSizes, BlasBuildInfo, BlasGeometry, BufferInfo, MemoryBarrier, RayTracingSupport,
    RtDevice, TlasBuildInfo,
};

#[derive(Debug, Clone, PartialEq)]
pub enum HeadlessCommand {
    CopyBuffer {
        src: u64,
        dst: u64,
        size: vk::DeviceSize,
    },
    Barrier(MemoryBarrier),
    BuildBlas {
        dst: u64,
        geometry_count: usize,
        primitive_count: u32,
    },
    BuildTlas {
        dst: u64,
        mode: vk::BuildAccelerationStructureModeKHR,
        instance_count: u32,
        instance_data: vk::DeviceAddress,
    },
}

pub struct HeadlessBuffer {
    id: u64,
    address: vk::DeviceAddress,
    size: vk::DeviceSize,
    host_visible: bool,
    memory: NonNull<u64>,
    words: usize,
}
unsafe impl Send for HeadlessBuffer {}
unsafe impl Sync for HeadlessBuffer {}

impl Drop for HeadlessBuffer {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.memory.as_ptr(),
                self.words,
            )));
        }
    }
}

impl HeadlessBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
    fn bytes(&self) -> *mut u8 {
        self.memory.as_ptr().cast()
    }
}

#[derive(Debug)]
pub struct HeadlessAccelStruct {
    id: u64,
    address: vk::DeviceAddress,
    ty: vk::AccelerationStructureTypeKHR,
    size: vk::DeviceSize,
}

impl HeadlessAccelStruct {
    pub fn id(&self) -> u64 {
        self.id
    }
    pub fn ty(&self) -> vk::AccelerationStructureTypeKHR {
        self.ty
    }
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub live_buffers: usize,
    pub live_blas: usize,
    pub live_tlas: usize,
    pub blas_created: u64,
    pub blas_destroyed: u64,
    pub tlas_created: u64,
    pub tlas_destroyed: u64,
    pub blas_builds: u64,
    pub tlas_builds: u64,
    pub tlas_updates: u64,
}

#[derive(Default)]
struct HeadlessState {
    next_id: u64,
    next_address: vk::DeviceAddress,
    live_accel_structs: HashMap<u64, vk::AccelerationStructureTypeKHR>,
    builds_per_accel_struct: HashMap<u64, u32>,
    stats: HeadlessStats,
}

impl HeadlessState {
    fn allocate(&mut self, size: vk::DeviceSize) -> (u64, vk::DeviceAddress) {
        self.next_id += 1;
        let address = self.next_address;
        self.next_address += size.max(1).next_multiple_of(256);
        (self.next_id, address)
    }
}

pub struct HeadlessDevice {
    support: RayTracingSupport,
    state: Mutex<HeadlessState>,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self::with_support(RayTracingSupport::FULL)
    }
    pub fn with_support(support: RayTracingSupport) -> Self {
        Self {
            support,
            state: Mutex::new(HeadlessState {
                next_address: 0x1000_0000,
                ..Default::default()
            }),
        }
    }

    pub fn stats(&self) -> HeadlessStats {
        self.state.lock().unwrap().stats.clone()
    }

    /// Number of build commands recorded against `accel_struct`, updates included.
    pub fn build_count(&self, accel_struct: &HeadlessAccelStruct) -> u32 {
        self.state
            .lock()
            .unwrap()
            .builds_per_accel_struct
            .get(&accel_struct.id)
            .copied()
            .unwrap_or(0)
    }

    /// Largest number of builds any single BLAS received.
    pub fn max_blas_builds(&self) -> u32 {
        let state = self.state.lock().unwrap();
        state
            .builds_per_accel_struct
            .iter()
            .filter(|(id, _)| {
                state.live_accel_structs.get(id).copied()
                    != Some(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            })
            .map(|(_, count)| *count)
            .max()
            .unwrap_or(0)
    }

    /// Whether the acceleration structure with this id was created and not yet destroyed.
    pub fn is_alive(&self, accel_struct_id: u64) -> bool {
        self.state
            .lock()
            .unwrap()
            .live_accel_structs
            .contains_key(&accel_struct_id)
    }

    /// Read `count` elements of `T` starting at element `first`.
    pub fn read_buffer<T: Copy>(&self, buffer: &HeadlessBuffer, first: usize, count: usize) -> Vec<T> {
        let end = (first + count) * std::mem::size_of::<T>();
        assert!(end as vk::DeviceSize <= buffer.size, "read past the end of the buffer");
        let ptr = buffer.memory.as_ptr().cast::<T>();
        (first..first + count)
            .map(|i| unsafe { ptr.add(i).read() })
            .collect()
    }
}

impl RtDevice for HeadlessDevice {
    type Buffer = HeadlessBuffer;
    type AccelStruct = HeadlessAccelStruct;
    type CommandBuffer = Vec<HeadlessCommand>;

    fn ray_tracing_support(&self) -> RayTracingSupport {
        self.support
    }

    fn min_scratch_offset_alignment(&self) -> u32 {
        128
    }

    fn create_buffer(&self, info: &BufferInfo) -> VkResult<Self::Buffer> {
        if info.size == 0 {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        let mut state = self.state.lock().unwrap();
        let (id, address) = state.allocate(info.size);
        state.stats.live_buffers += 1;
        let words = (info.size as usize).div_ceil(8);
        let memory = Box::into_raw(vec![0u64; words].into_boxed_slice());
        Ok(HeadlessBuffer {
            id,
            address,
            size: info.size,
            host_visible: info.host_visible,
            memory: NonNull::new(memory.cast::<u64>()).ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)?,
            words,
        })
    }

    fn destroy_buffer(&self, buffer: Self::Buffer) {
        self.state.lock().unwrap().stats.live_buffers -= 1;
        drop(buffer);
    }

    fn buffer_device_address(&self, buffer: &Self::Buffer) -> vk::DeviceAddress {
        buffer.address
    }

    fn mapped_ptr(&self, buffer: &Self::Buffer) -> Option<NonNull<u8>> {
        if buffer.host_visible {
            NonNull::new(buffer.bytes())
        } else {
            None
        }
    }

    fn blas_build_sizes(
        &self,
        _flags: vk::BuildAccelerationStructureFlagsKHR,
        geometries: &[BlasGeometry],
    ) -> AccelStructSizes {
        let primitives: u64 = geometries.iter().map(|g| g.primitive_count as u64).sum();
        AccelStructSizes {
            size: 256 + primitives * 64,
            build_scratch_size: 128 + primitives * 32,
            update_scratch_size: 128 + primitives * 16,
        }
    }

    fn tlas_build_sizes(
        &self,
        _flags: vk::BuildAccelerationStructureFlagsKHR,
        instance_count: u32,
    ) -> AccelStructSizes {
        AccelStructSizes {
            size: 256 + instance_count as u64 * 128,
            build_scratch_size: 128 + instance_count as u64 * 64,
            update_scratch_size: 128 + instance_count as u64 * 32,
        }
    }

    fn create_accel_struct(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        size: vk::DeviceSize,
        _name: &str,
    ) -> VkResult<Self::AccelStruct> {
        let mut state = self.state.lock().unwrap();
        let (id, address) = state.allocate(size);
        state.live_accel_structs.insert(id, ty);
        if ty == vk::AccelerationStructureTypeKHR::TOP_LEVEL {
            state.stats.live_tlas += 1;
            state.stats.tlas_created += 1;
        } else {
            state.stats.live_blas += 1;
            state.stats.blas_created += 1;
        }
        Ok(HeadlessAccelStruct {
            id,
            address,
            ty,
            size,
        })
    }

    fn destroy_accel_struct(&self, accel_struct: Self::AccelStruct) {
        let mut state = self.state.lock().unwrap();
        assert!(
            state.live_accel_structs.remove(&accel_struct.id).is_some(),
            "acceleration structure {} destroyed twice",
            accel_struct.id
        );
        if accel_struct.ty == vk::AccelerationStructureTypeKHR::TOP_LEVEL {
            state.stats.live_tlas -= 1;
            state.stats.tlas_destroyed += 1;
        } else {
            state.stats.live_blas -= 1;
            state.stats.blas_destroyed += 1;
        }
    }

    fn accel_struct_device_address(&self, accel_struct: &Self::AccelStruct) -> vk::DeviceAddress {
        accel_struct.address
    }

    fn cmd_copy_buffer(
        &self,
        cmd: &mut Self::CommandBuffer,
        src: &Self::Buffer,
        dst: &Self::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        for region in regions {
            assert!(region.src_offset + region.size <= src.size, "copy reads past the source");
            assert!(region.dst_offset + region.size <= dst.size, "copy writes past the destination");
            unsafe {
                std::ptr::copy(
                    src.bytes().add(region.src_offset as usize),
                    dst.bytes().add(region.dst_offset as usize),
                    region.size as usize,
                );
            }
            cmd.push(HeadlessCommand::CopyBuffer {
                src: src.id,
                dst: dst.id,
                size: region.size,
            });
        }
    }

    fn cmd_pipeline_barrier(&self, cmd: &mut Self::CommandBuffer, barrier: &MemoryBarrier) {
        cmd.push(HeadlessCommand::Barrier(*barrier));
    }

    fn cmd_build_blas(&self, cmd: &mut Self::CommandBuffer, infos: &[BlasBuildInfo<'_, Self>]) {
        let mut state = self.state.lock().unwrap();
        for info in infos {
            assert!(
                state.live_accel_structs.contains_key(&info.dst.id),
                "building a destroyed BLAS"
            );
            assert_ne!(info.scratch_data, 0, "BLAS build without scratch memory");
            *state.builds_per_accel_struct.entry(info.dst.id).or_default() += 1;
            state.stats.blas_builds += 1;
            cmd.push(HeadlessCommand::BuildBlas {
                dst: info.dst.id,
                geometry_count: info.geometries.len(),
                primitive_count: info.geometries.iter().map(|g| g.primitive_count).sum(),
            });
        }
    }

    fn cmd_build_tlas(&self, cmd: &mut Self::CommandBuffer, info: &TlasBuildInfo<'_, Self>) {
        let mut state = self.state.lock().unwrap();
        assert!(
            state.live_accel_structs.contains_key(&info.dst.id),
            "building a destroyed TLAS"
        );
        if info.mode == vk::BuildAccelerationStructureModeKHR::UPDATE {
            let src = info.src.expect("TLAS update without a source structure");
            assert!(
                info.flags
                    .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE),
                "TLAS update without ALLOW_UPDATE"
            );
            assert!(
                state.live_accel_structs.contains_key(&src.id),
                "updating from a destroyed TLAS"
            );
            state.stats.tlas_updates += 1;
        } else {
            state.stats.tlas_builds += 1;
        }
        *state.builds_per_accel_struct.entry(info.dst.id).or_default() += 1;
        cmd.push(HeadlessCommand::BuildTlas {
            dst: info.dst.id,
            mode: info.mode,
            instance_count: info.instance_count,
            instance_data: info.instance_data,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_executes_immediately() {
        let device = HeadlessDevice::new();
        let src = device
            .create_buffer(&BufferInfo {
                size: 32,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                host_visible: true,
                name: "src",
            })
            .unwrap();
        let dst = device
            .create_buffer(&BufferInfo {
                size: 32,
                usage: vk::BufferUsageFlags::TRANSFER_DST,
                host_visible: false,
                name: "dst",
            })
            .unwrap();
        assert!(device.mapped_ptr(&dst).is_none());
        let ptr = device.mapped_ptr(&src).unwrap().cast::<u32>();
        unsafe {
            for i in 0..8 {
                ptr.as_ptr().add(i).write(i as u32);
            }
        }
        let mut cmd = Vec::new();
        device.cmd_copy_buffer(
            &mut cmd,
            &src,
            &dst,
            &[vk::BufferCopy {
                src_offset: 8,
                dst_offset: 0,
                size: 16,
            }],
        );
        assert_eq!(device.read_buffer::<u32>(&dst, 0, 4), vec![2, 3, 4, 5]);
        assert_eq!(cmd.len(), 1);
        device.destroy_buffer(src);
        device.destroy_buffer(dst);
        assert_eq!(device.stats().live_buffers, 0);
    }

    #[test]
    #[should_panic(expected = "destroyed twice")]
    fn test_double_destroy_panics() {
        let device = HeadlessDevice::new();
        let blas = device
            .create_accel_struct(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL, 64, "blas")
            .unwrap();
        let twin = HeadlessAccelStruct {
            id: blas.id,
            address: blas.address,
            ty: blas.ty,
            size: blas.size,
        };
        device.destroy_accel_struct(blas);
        device.destroy_accel_struct(twin);
    }
}
