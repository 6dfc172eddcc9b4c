use ash::vk;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Access {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

impl Access {
    pub const NONE: Access = Access {
        stage: vk::PipelineStageFlags2::NONE,
        access: vk::AccessFlags2::NONE,
    };
    pub const HOST_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::HOST,
        access: vk::AccessFlags2::HOST_WRITE,
    };
    pub const COPY_READ: Access = Access {
        stage: vk::PipelineStageFlags2::COPY,
        access: vk::AccessFlags2::TRANSFER_READ,
    };
    pub const COPY_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::COPY,
        access: vk::AccessFlags2::TRANSFER_WRITE,
    };
    /// Instance buffers and geometry consumed by an acceleration structure build.
    pub const ACCELERATION_STRUCTURE_BUILD_INPUT: Access = Access {
        stage: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        access: vk::AccessFlags2::SHADER_READ,
    };
    pub const ACCELERATION_STRUCTURE_READ: Access = Access {
        stage: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        access: vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
    };
    pub const ACCELERATION_STRUCTURE_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        access: vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
    };
    pub const ACCELERATION_STRUCTURE_SCRATCH: Access = Access {
        stage: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR.as_raw()
                | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR.as_raw(),
        ),
    };
    /// A TLAS traced against from ray tracing shaders.
    pub const RAY_TRACING_READ: Access = Access {
        stage: vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
        access: vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
    };
    /// Storage buffers read from ray tracing shaders, e.g. the object binding table.
    pub const RAY_TRACING_SHADER_READ: Access = Access {
        stage: vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
        access: vk::AccessFlags2::SHADER_STORAGE_READ,
    };

    pub fn is_empty(&self) -> bool {
        self.stage.is_empty() && self.access.is_empty()
    }

    pub fn is_writeonly(&self) -> bool {
        if self.access == vk::AccessFlags2::empty() {
            return false;
        }
        // Clear all the write bits. If nothing is left, that means there's no read bits.
        self.access & !ALL_WRITE_BITS == vk::AccessFlags2::NONE
    }

    pub fn is_readonly(&self) -> bool {
        if self.access == vk::AccessFlags2::empty() {
            return false;
        }
        self.access & !ALL_READ_BITS == vk::AccessFlags2::NONE
    }
}

const ALL_WRITE_BITS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
    vk::AccessFlags2::SHADER_WRITE.as_raw()
        | vk::AccessFlags2::TRANSFER_WRITE.as_raw()
        | vk::AccessFlags2::HOST_WRITE.as_raw()
        | vk::AccessFlags2::MEMORY_WRITE.as_raw()
        | vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw()
        | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR.as_raw(),
);
const ALL_READ_BITS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
    vk::AccessFlags2::SHADER_READ.as_raw()
        | vk::AccessFlags2::TRANSFER_READ.as_raw()
        | vk::AccessFlags2::HOST_READ.as_raw()
        | vk::AccessFlags2::MEMORY_READ.as_raw()
        | vk::AccessFlags2::SHADER_STORAGE_READ.as_raw()
        | vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR.as_raw(),
);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryBarrier {
    pub src_stage_mask: vk::PipelineStageFlags2,
    pub src_access_mask: vk::AccessFlags2,
    pub dst_stage_mask: vk::PipelineStageFlags2,
    pub dst_access_mask: vk::AccessFlags2,
}

impl MemoryBarrier {
    pub fn is_empty(&self) -> bool {
        self.src_stage_mask.is_empty() && self.dst_stage_mask.is_empty()
    }
}

/// Last write and accumulated reads of a single GPU resource.
#[derive(Debug, Clone, Default)]
pub struct ResourceState {
    read: Access,
    write: Access,
}

impl ResourceState {
    /// Move the resource into `next`, returning the barrier required to do so.
    /// The returned barrier is empty when no synchronization is needed.
    pub fn transition(&mut self, next: Access) -> MemoryBarrier {
        let mut barrier = MemoryBarrier::default();
        if next.is_readonly() {
            if !self.write.is_empty() && !self.read.stage.contains(next.stage) {
                barrier = MemoryBarrier {
                    src_stage_mask: self.write.stage,
                    src_access_mask: self.write.access,
                    dst_stage_mask: next.stage,
                    dst_access_mask: next.access,
                };
            }
            self.read.stage |= next.stage;
            self.read.access |= next.access;
        } else {
            if !self.read.stage.is_empty() {
                // Write-after-read only needs an execution dependency. The reads already made
                // the previous write visible.
                barrier = MemoryBarrier {
                    src_stage_mask: self.read.stage,
                    src_access_mask: vk::AccessFlags2::empty(),
                    dst_stage_mask: next.stage,
                    dst_access_mask: vk::AccessFlags2::empty(),
                };
            } else if !self.write.is_empty() {
                barrier = MemoryBarrier {
                    src_stage_mask: self.write.stage,
                    src_access_mask: self.write.access,
                    dst_stage_mask: next.stage,
                    dst_access_mask: next.access,
                };
            }
            self.write = next;
            self.read = Access::default();
        }
        barrier
    }

    pub fn last_write(&self) -> Access {
        self.write
    }
}
