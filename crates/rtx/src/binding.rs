use bytemuck::{Pod, Zeroable};
use scoria::{
    ash::{prelude::VkResult, vk},
    buffer::UploadRing,
    Access, DeferredDestroyer, RtDevice,
};

use crate::PrimitiveGroup;

/// Per instance record read by hit shaders through `gl_InstanceCustomIndexEXT`.
/// Mirrors the instance record at the same slot index.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ObjectBinding {
    pub position_address: u64,
    pub index_address: u64,
    /// Zero when the geometry has no attribute stream.
    pub attribute_address: u64,
    pub material_offset: u32,
    pub flags: u32,
    pub vertex_stride: u32,
    pub attribute_stride: u32,
}

impl ObjectBinding {
    pub const FLAG_INDEX_32: u32 = 1;

    pub fn new(group: &PrimitiveGroup, material_offset: u32) -> Self {
        Self {
            position_address: group.vertex_address(),
            index_address: group.index_address(),
            attribute_address: group.attribute_address(),
            material_offset,
            flags: if group.index_type == vk::IndexType::UINT32 {
                Self::FLAG_INDEX_32
            } else {
                0
            },
            vertex_stride: group.vertex_stride,
            attribute_stride: group
                .attributes
                .as_ref()
                .map_or(0, |stream| stream.stride),
        }
    }

    pub fn is_index_32(&self) -> bool {
        self.flags & Self::FLAG_INDEX_32 != 0
    }
}

/// Object bindings of every instance slot, uploaded through its own staging ring.
pub struct ObjectBindingTable<D: RtDevice> {
    ring: UploadRing<D, ObjectBinding>,
    dirty: bool,
}

impl<D: RtDevice> ObjectBindingTable<D> {
    pub fn new(device: &D, capacity: usize, frames_in_flight: usize) -> VkResult<Self> {
        Ok(Self {
            ring: UploadRing::new(
                device,
                "Object bindings",
                capacity,
                frames_in_flight,
                vk::BufferUsageFlags::STORAGE_BUFFER,
            )?,
            dirty: false,
        })
    }

    pub fn write(&mut self, slot: u32, binding: ObjectBinding) {
        self.ring.write(slot as usize, binding);
        self.dirty = true;
    }

    pub fn clear(&mut self, slot: u32) {
        self.write(slot, ObjectBinding::zeroed());
    }

    pub fn read(&self, slot: u32) -> ObjectBinding {
        self.ring.read(slot as usize)
    }

    pub fn read_frame(&self, frame: usize, slot: u32) -> ObjectBinding {
        self.ring.read_frame(frame, slot as usize)
    }

    pub fn current_frame(&self) -> usize {
        self.ring.current_frame()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn advance(&mut self) {
        self.ring.advance();
    }

    /// Upload `[0, count)` if anything changed since the last flush.
    pub fn flush(&mut self, device: &D, cmd: &mut D::CommandBuffer, count: u32) -> vk::DeviceSize {
        if !self.dirty {
            return 0;
        }
        self.dirty = false;
        self.ring
            .flush(device, cmd, count as usize, Access::RAY_TRACING_SHADER_READ)
    }

    pub fn device_address(&self, device: &D) -> vk::DeviceAddress {
        self.ring.device_address(device)
    }

    pub fn retire(self, destroyer: &DeferredDestroyer<D>) {
        self.ring.retire(destroyer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::mesh;
    use scoria::headless::HeadlessDevice;

    #[test]
    fn test_layout() {
        assert_eq!(std::mem::size_of::<ObjectBinding>(), 40);
    }

    #[test]
    fn test_binding_from_group() {
        let mut m = mesh(1, 1);
        let binding = ObjectBinding::new(&m.groups[0], 3);
        assert!(binding.is_index_32());
        assert_eq!(binding.position_address, 0x8010_0000);
        assert_eq!(binding.index_address, 0x8010_1000);
        assert_eq!(binding.vertex_stride, 12);

        m.groups[0].index_type = vk::IndexType::UINT16;
        assert!(!ObjectBinding::new(&m.groups[0], 3).is_index_32());
    }

    #[test]
    fn test_flush_only_when_dirty() {
        let device = HeadlessDevice::new();
        let mut table = ObjectBindingTable::new(&device, 8, 2).unwrap();
        let m = mesh(2, 1);
        let mut cmd = Vec::new();
        assert_eq!(table.flush(&device, &mut cmd, 1), 0);

        table.write(0, ObjectBinding::new(&m.groups[0], 1));
        assert_eq!(table.flush(&device, &mut cmd, 1), 40);
        assert_eq!(table.flush(&device, &mut cmd, 1), 0);

        table.clear(0);
        assert_eq!(table.read(0), ObjectBinding::default());
        assert!(table.is_dirty());
    }
}
