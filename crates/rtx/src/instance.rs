use bevy::math::Mat4;
use scoria::ash::vk;

pub type InstanceRecord = vk::AccelerationStructureInstanceKHR;

/// Row major 3x4 matrix as consumed by the TLAS build.
pub fn transform_matrix(transform: &Mat4) -> vk::TransformMatrixKHR {
    let mut matrix = [0.0; 12];
    matrix.copy_from_slice(&transform.transpose().to_cols_array()[0..12]);
    vk::TransformMatrixKHR { matrix }
}

pub fn instance_record(
    slot: u32,
    transform: &Mat4,
    mask: u8,
    shader_offset: u32,
    blas_address: vk::DeviceAddress,
) -> InstanceRecord {
    assert_eq!(slot & !0xffffff, 0, "Custom index must be in the range 0 ..= 2^24");
    assert_eq!(
        shader_offset & !0xffffff,
        0,
        "SBT offset must be in the range 0 ..= 2^24"
    );
    InstanceRecord {
        transform: transform_matrix(transform),
        instance_custom_index_and_mask: vk::Packed24_8::new(slot, mask),
        instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
            shader_offset,
            vk::GeometryInstanceFlagsKHR::empty().as_raw() as u8,
        ),
        acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
            device_handle: blas_address,
        },
    }
}

/// A hole below the high water mark. Masked out and referencing no BLAS.
pub fn inactive_record(slot: u32) -> InstanceRecord {
    instance_record(slot, &Mat4::IDENTITY, 0, 0, 0)
}

pub fn set_mask(record: &mut InstanceRecord, mask: u8) {
    let custom_index = record.instance_custom_index_and_mask.low_24();
    record.instance_custom_index_and_mask = vk::Packed24_8::new(custom_index, mask);
}

pub fn set_shader_offset(record: &mut InstanceRecord, shader_offset: u32) {
    let flags = record
        .instance_shader_binding_table_record_offset_and_flags
        .high_8();
    record.instance_shader_binding_table_record_offset_and_flags =
        vk::Packed24_8::new(shader_offset, flags);
}

pub fn blas_address(record: &InstanceRecord) -> vk::DeviceAddress {
    unsafe { record.acceleration_structure_reference.device_handle }
}
