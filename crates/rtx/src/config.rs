use scoria::ash::vk;

use crate::MaterialCategory;

/// Largest value representable by the 24 bit instance custom index, which carries the slot index.
pub const MAX_INSTANCE_CAPACITY: u32 = 1 << 24;

#[derive(Debug, Clone)]
pub struct RayTracingConfig {
    /// Size of the instance slot address space. Every instance and object binding buffer is
    /// allocated with this many records up front.
    pub max_instances: u32,
    pub frames_in_flight: usize,
    /// Entities per transform job batch.
    pub transform_batch_size: usize,
    /// `ALLOW_UPDATE` is always added.
    pub tlas_build_flags: vk::BuildAccelerationStructureFlagsKHR,
    pub blas_build_flags: vk::BuildAccelerationStructureFlagsKHR,
    /// Hit group offset per material category.
    pub material_shader_offsets: Vec<u32>,
}

impl Default for RayTracingConfig {
    fn default() -> Self {
        Self {
            max_instances: 65536,
            frames_in_flight: 2,
            transform_batch_size: 64,
            tlas_build_flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
                | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE,
            blas_build_flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
                | vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION,
            material_shader_offsets: Vec::new(),
        }
    }
}

impl RayTracingConfig {
    pub fn tlas_flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        self.tlas_build_flags | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE
    }

    /// Unknown categories fall back to the first hit group.
    pub fn shader_offset(&self, category: MaterialCategory) -> u32 {
        self.material_shader_offsets
            .get(category.0 as usize)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn validate(&self) {
        assert!(
            (1..=MAX_INSTANCE_CAPACITY).contains(&self.max_instances),
            "max_instances must be within 1..={MAX_INSTANCE_CAPACITY}"
        );
        assert!(
            (1..=scoria::buffer::MAX_FRAMES_IN_FLIGHT).contains(&self.frames_in_flight),
            "frames_in_flight must be within 1..={}",
            scoria::buffer::MAX_FRAMES_IN_FLIGHT
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_update_is_forced() {
        let config = RayTracingConfig {
            tlas_build_flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD,
            ..Default::default()
        };
        assert!(config
            .tlas_flags()
            .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE));
    }

    #[test]
    fn test_shader_offset_lookup() {
        let config = RayTracingConfig {
            material_shader_offsets: vec![0, 2, 5],
            ..Default::default()
        };
        assert_eq!(config.shader_offset(MaterialCategory(2)), 5);
        assert_eq!(config.shader_offset(MaterialCategory(9)), 0);
    }
}
