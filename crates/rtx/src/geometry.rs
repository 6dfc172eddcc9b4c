//! Geometry and material descriptions handed over by the resource loader.

use std::sync::{Arc, RwLock};

use bevy::math::Mat4;
use scoria::{ash::vk, BlasGeometry};

use crate::Mobility;

/// Identity of a loaded mesh. BLASes are shared between every entity using the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(pub u64);

/// Device address of a vertex or index buffer owned by the resource loader.
///
/// The loader may reallocate the buffer, in which case it publishes the new address with
/// [`GeometryBuffer::relocate`]. Readers only hold the lock while copying the address out.
#[derive(Debug)]
pub struct GeometryBuffer {
    address: RwLock<vk::DeviceAddress>,
}

impl GeometryBuffer {
    pub fn new(address: vk::DeviceAddress) -> Self {
        Self {
            address: RwLock::new(address),
        }
    }
    pub fn address(&self) -> vk::DeviceAddress {
        *self.address.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
    pub fn relocate(&self, address: vk::DeviceAddress) {
        *self
            .address
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = address;
    }
}

#[derive(Debug, Clone)]
pub struct AttributeStream {
    pub buffer: Arc<GeometryBuffer>,
    pub offset: vk::DeviceSize,
    pub stride: u32,
}

/// One draw range of a mesh. Each group becomes its own BLAS and its own instance.
#[derive(Debug, Clone)]
pub struct PrimitiveGroup {
    pub vertex_buffer: Arc<GeometryBuffer>,
    pub vertex_offset: vk::DeviceSize,
    pub vertex_stride: u32,
    pub vertex_format: vk::Format,
    pub vertex_count: u32,
    pub index_buffer: Arc<GeometryBuffer>,
    pub index_offset: vk::DeviceSize,
    pub index_type: vk::IndexType,
    pub index_count: u32,
    pub attributes: Option<AttributeStream>,
    pub opaque: bool,
}

impl PrimitiveGroup {
    pub fn vertex_address(&self) -> vk::DeviceAddress {
        self.vertex_buffer.address() + self.vertex_offset
    }
    pub fn index_address(&self) -> vk::DeviceAddress {
        self.index_buffer.address() + self.index_offset
    }
    pub fn attribute_address(&self) -> vk::DeviceAddress {
        self.attributes
            .as_ref()
            .map(|stream| stream.buffer.address() + stream.offset)
            .unwrap_or(0)
    }
    pub fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }

    /// Build input with the buffer addresses as they are right now.
    pub fn blas_geometry(&self) -> BlasGeometry {
        BlasGeometry {
            vertex_format: self.vertex_format,
            vertex_data: self.vertex_address(),
            vertex_stride: self.vertex_stride as vk::DeviceSize,
            max_vertex: self.vertex_count.saturating_sub(1),
            index_type: self.index_type,
            index_data: self.index_address(),
            primitive_count: self.triangle_count(),
            flags: if self.opaque {
                vk::GeometryFlagsKHR::OPAQUE
            } else {
                vk::GeometryFlagsKHR::empty()
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct MeshGeometry {
    pub id: MeshId,
    pub groups: Vec<PrimitiveGroup>,
}

/// Material property category, used to pick the hit group of an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MaterialCategory(pub u32);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterialRef {
    pub category: MaterialCategory,
    /// Index of the material's resources in the bindless material table.
    pub binding: u32,
}

/// Per primitive group placement of a model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelPart {
    /// Index into the entity's node transforms.
    pub node: u32,
    pub material: MaterialRef,
}

/// Everything needed to register a mesh backed entity. `parts[i]` describes `mesh.groups[i]`.
#[derive(Debug, Clone)]
pub struct ModelDesc {
    pub mesh: Arc<MeshGeometry>,
    pub parts: Vec<ModelPart>,
    pub mobility: Mobility,
    pub visibility_mask: u8,
}

/// A piece of geometry that belongs to one entity only and never moves.
#[derive(Debug, Clone)]
pub struct TerrainPatch {
    pub group: PrimitiveGroup,
    pub transform: Mat4,
    pub material: MaterialRef,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relocation_is_observed() {
        let buffer = Arc::new(GeometryBuffer::new(0x1000));
        let group = PrimitiveGroup {
            vertex_buffer: buffer.clone(),
            vertex_offset: 0x40,
            vertex_stride: 12,
            vertex_format: vk::Format::R32G32B32_SFLOAT,
            vertex_count: 3,
            index_buffer: buffer.clone(),
            index_offset: 0x80,
            index_type: vk::IndexType::UINT16,
            index_count: 6,
            attributes: None,
            opaque: true,
        };
        let geometry = group.blas_geometry();
        assert_eq!(geometry.vertex_data, 0x1040);
        assert_eq!(geometry.index_data, 0x1080);
        assert_eq!(geometry.primitive_count, 2);
        assert_eq!(geometry.max_vertex, 2);
        assert_eq!(group.attribute_address(), 0);

        buffer.relocate(0x9000);
        assert_eq!(group.vertex_address(), 0x9040);
    }
}
