use std::sync::Arc;

use scoria::ash::vk;

use crate::{GeometryBuffer, MeshGeometry, MeshId, PrimitiveGroup};

pub fn group(buffer: &Arc<GeometryBuffer>, triangles: u32) -> PrimitiveGroup {
    PrimitiveGroup {
        vertex_buffer: buffer.clone(),
        vertex_offset: 0,
        vertex_stride: 12,
        vertex_format: vk::Format::R32G32B32_SFLOAT,
        vertex_count: triangles * 3,
        index_buffer: buffer.clone(),
        index_offset: 0x1000,
        index_type: vk::IndexType::UINT32,
        index_count: triangles * 3,
        attributes: None,
        opaque: true,
    }
}

pub fn mesh(id: u64, groups: usize) -> MeshGeometry {
    let buffer = Arc::new(GeometryBuffer::new(0x8000_0000 + id * 0x10_0000));
    MeshGeometry {
        id: MeshId(id),
        groups: (0..groups).map(|i| group(&buffer, i as u32 + 1)).collect(),
    }
}
