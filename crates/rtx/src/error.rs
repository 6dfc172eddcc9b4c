use bevy::ecs::entity::Entity;
use scoria::ash::vk;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RayTracingError {
    #[error("instance capacity exceeded: {requested} slots requested, capacity is {capacity}")]
    CapacityExceeded { requested: u32, capacity: u32 },
    #[error("vulkan error: {0}")]
    Vk(#[from] vk::Result),
    #[error("entity {0:?} is not registered for ray tracing")]
    UnknownEntity(Entity),
    #[error("mesh has {groups} primitive groups but {parts} parts were supplied")]
    PartCountMismatch { groups: usize, parts: usize },
}
