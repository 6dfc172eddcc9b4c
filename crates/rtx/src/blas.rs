use std::{collections::HashMap, sync::Mutex};

use bevy::utils::tracing;
use nonmax::NonMaxU32;
use scoria::{
    ash::{prelude::VkResult, vk},
    Access, BlasBuildInfo, BufferInfo, DeferredDestroyer, ResourceState, RtDevice,
};
use smallvec::SmallVec;

use crate::{MeshGeometry, MeshId, PrimitiveGroup};

/// Built BLASes are read by TLAS builds and traversed from ray tracing shaders.
const BLAS_CONSUMERS: Access = Access {
    stage: vk::PipelineStageFlags2::from_raw(
        vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR.as_raw()
            | vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR.as_raw(),
    ),
    access: vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
};

/// Lookup key of a BLAS owned by [`BlasRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlasHandle(NonMaxU32);

impl BlasHandle {
    pub fn index(&self) -> u32 {
        self.0.get()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlasOwner {
    Mesh(MeshId),
    Private,
}

struct BlasEntry<D: RtDevice> {
    accel_struct: D::AccelStruct,
    address: vk::DeviceAddress,
    group: PrimitiveGroup,
    build_scratch_size: vk::DeviceSize,
    owner: BlasOwner,
}

struct MeshBlas {
    /// Number of instance slots referencing the mesh's BLASes.
    ref_count: u32,
    handles: SmallVec<[BlasHandle; 4]>,
}

struct RegistryInner<D: RtDevice> {
    entries: Vec<Option<BlasEntry<D>>>,
    free_entries: Vec<u32>,
    meshes: HashMap<MeshId, MeshBlas>,
    pending_build: Vec<BlasHandle>,
    builds_issued: u64,
}

impl<D: RtDevice> RegistryInner<D> {
    fn create(
        &mut self,
        device: &D,
        flags: vk::BuildAccelerationStructureFlagsKHR,
        group: &PrimitiveGroup,
        owner: BlasOwner,
    ) -> VkResult<BlasHandle> {
        let sizes = device.blas_build_sizes(flags, &[group.blas_geometry()]);
        let name = match owner {
            BlasOwner::Mesh(mesh) => format!("BLAS mesh {}", mesh.0),
            BlasOwner::Private => "BLAS private".to_string(),
        };
        let accel_struct = device.create_accel_struct(
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            sizes.size,
            &name,
        )?;
        let entry = BlasEntry {
            address: device.accel_struct_device_address(&accel_struct),
            accel_struct,
            group: group.clone(),
            build_scratch_size: sizes.build_scratch_size,
            owner,
        };
        let index = match self.free_entries.pop() {
            Some(index) => {
                self.entries[index as usize] = Some(entry);
                index
            }
            None => {
                self.entries.push(Some(entry));
                self.entries.len() as u32 - 1
            }
        };
        let handle = BlasHandle(NonMaxU32::new(index).unwrap());
        self.pending_build.push(handle);
        tracing::debug!("Created {} ({} bytes) as {:?}", name, sizes.size, handle);
        Ok(handle)
    }

    fn take(&mut self, handle: BlasHandle) -> BlasEntry<D> {
        let entry = self.entries[handle.index() as usize]
            .take()
            .unwrap_or_else(|| panic!("{handle:?} released twice"));
        self.free_entries.push(handle.index());
        self.pending_build.retain(|pending| *pending != handle);
        entry
    }
}

/// Owner of every bottom level acceleration structure.
///
/// Mesh backed BLASes are shared between all instances of a mesh and reference counted per
/// instance slot. Private BLASes belong to exactly one slot. All mutation happens under a
/// single lock, so registration may happen from loader callbacks as well as the main thread.
pub struct BlasRegistry<D: RtDevice> {
    flags: vk::BuildAccelerationStructureFlagsKHR,
    inner: Mutex<RegistryInner<D>>,
}

impl<D: RtDevice> BlasRegistry<D> {
    pub fn new(flags: vk::BuildAccelerationStructureFlagsKHR) -> Self {
        Self {
            flags,
            inner: Mutex::new(RegistryInner {
                entries: Vec::new(),
                free_entries: Vec::new(),
                meshes: HashMap::new(),
                pending_build: Vec::new(),
                builds_issued: 0,
            }),
        }
    }

    /// One handle per primitive group of `mesh`. The first resolution of a mesh creates its
    /// BLASes and queues them for building, later ones only add references.
    /// Every resolution adds one reference per primitive group.
    pub fn resolve(&self, device: &D, mesh: &MeshGeometry) -> VkResult<SmallVec<[BlasHandle; 4]>> {
        if mesh.groups.is_empty() {
            return Ok(SmallVec::new());
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(cached) = inner.meshes.get_mut(&mesh.id) {
            cached.ref_count += mesh.groups.len() as u32;
            return Ok(cached.handles.clone());
        }
        let mut handles: SmallVec<[BlasHandle; 4]> = SmallVec::new();
        for group in &mesh.groups {
            match inner.create(device, self.flags, group, BlasOwner::Mesh(mesh.id)) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    // Never built, nothing on the GPU can reference them.
                    for handle in handles {
                        device.destroy_accel_struct(inner.take(handle).accel_struct);
                    }
                    return Err(err);
                }
            }
        }
        inner.meshes.insert(
            mesh.id,
            MeshBlas {
                ref_count: mesh.groups.len() as u32,
                handles: handles.clone(),
            },
        );
        Ok(handles)
    }

    /// Drop one slot reference to `mesh`. At zero, every BLAS of the mesh is retired.
    /// Returns true if the BLASes were retired.
    pub fn release(&self, mesh: MeshId, destroyer: &DeferredDestroyer<D>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let cached = inner
            .meshes
            .get_mut(&mesh)
            .unwrap_or_else(|| panic!("release of unresolved mesh {mesh:?}"));
        cached.ref_count -= 1;
        if cached.ref_count > 0 {
            return false;
        }
        let Some(cached) = inner.meshes.remove(&mesh) else {
            return false;
        };
        for handle in cached.handles {
            destroyer.destroy_accel_struct(inner.take(handle).accel_struct);
        }
        tracing::debug!("Retired BLASes of {:?}", mesh);
        true
    }

    pub fn register_private(&self, device: &D, group: &PrimitiveGroup) -> VkResult<BlasHandle> {
        self.inner
            .lock()
            .unwrap()
            .create(device, self.flags, group, BlasOwner::Private)
    }

    pub fn release_private(&self, handle: BlasHandle, destroyer: &DeferredDestroyer<D>) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.take(handle);
        debug_assert_eq!(entry.owner, BlasOwner::Private);
        destroyer.destroy_accel_struct(entry.accel_struct);
    }

    /// Record builds for every BLAS created since the last call, followed by a barrier
    /// making them visible to TLAS builds and ray tracing. Returns the number of builds.
    pub fn build_pending(
        &self,
        device: &D,
        cmd: &mut D::CommandBuffer,
        destroyer: &DeferredDestroyer<D>,
    ) -> VkResult<usize> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if inner.pending_build.is_empty() {
            return Ok(0);
        }
        let alignment = device.min_scratch_offset_alignment().max(1) as vk::DeviceSize;
        let mut scratch_offsets = Vec::with_capacity(inner.pending_build.len());
        let mut scratch_size: vk::DeviceSize = 0;
        for handle in &inner.pending_build {
            let entry = inner.entries[handle.index() as usize]
                .as_ref()
                .unwrap_or_else(|| panic!("pending {handle:?} was released"));
            scratch_offsets.push(scratch_size);
            scratch_size += entry.build_scratch_size.next_multiple_of(alignment);
        }
        let scratch = device.create_buffer(&BufferInfo {
            size: scratch_size + alignment,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            host_visible: false,
            name: "BLAS scratch",
        })?;
        let scratch_base = device
            .buffer_device_address(&scratch)
            .next_multiple_of(alignment);

        let geometries: Vec<[_; 1]> = inner
            .pending_build
            .iter()
            .map(|handle| {
                let entry = inner.entries[handle.index() as usize].as_ref().unwrap();
                [entry.group.blas_geometry()]
            })
            .collect();
        let infos: Vec<BlasBuildInfo<D>> = inner
            .pending_build
            .iter()
            .zip(geometries.iter())
            .zip(scratch_offsets)
            .map(|((handle, geometry), offset)| BlasBuildInfo {
                dst: &inner.entries[handle.index() as usize]
                    .as_ref()
                    .unwrap()
                    .accel_struct,
                flags: self.flags,
                geometries: geometry,
                scratch_data: scratch_base + offset,
            })
            .collect();
        device.cmd_build_blas(cmd, &infos);
        let built = infos.len();
        drop(infos);

        let mut state = ResourceState::default();
        state.transition(Access::ACCELERATION_STRUCTURE_WRITE);
        device.cmd_barrier_if_needed(cmd, state.transition(BLAS_CONSUMERS));
        destroyer.destroy_buffer(scratch);

        inner.pending_build.clear();
        inner.builds_issued += built as u64;
        tracing::debug!("Recorded {} BLAS builds, {} bytes of scratch", built, scratch_size);
        Ok(built)
    }

    pub fn device_address(&self, handle: BlasHandle) -> Option<vk::DeviceAddress> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(handle.index() as usize)?
            .as_ref()
            .map(|entry| entry.address)
    }

    /// Number of instance slots referencing `mesh`, zero if it has no BLASes.
    pub fn ref_count(&self, mesh: MeshId) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .meshes
            .get(&mesh)
            .map_or(0, |cached| cached.ref_count)
    }

    pub fn mesh_handles(&self, mesh: MeshId) -> SmallVec<[BlasHandle; 4]> {
        self.inner
            .lock()
            .unwrap()
            .meshes
            .get(&mesh)
            .map(|cached| cached.handles.clone())
            .unwrap_or_default()
    }

    pub fn live_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.entries.len() - inner.free_entries.len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().pending_build.len()
    }

    pub fn builds_issued(&self) -> u64 {
        self.inner.lock().unwrap().builds_issued
    }

    /// Retire every BLAS regardless of references.
    pub fn retire_all(&self, destroyer: &DeferredDestroyer<D>) {
        let mut inner = self.inner.lock().unwrap();
        for entry in inner.entries.drain(..).flatten() {
            destroyer.destroy_accel_struct(entry.accel_struct);
        }
        inner.free_entries.clear();
        inner.meshes.clear();
        inner.pending_build.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::mesh;
    use scoria::headless::{HeadlessCommand, HeadlessDevice};

    fn registry() -> BlasRegistry<HeadlessDevice> {
        BlasRegistry::new(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
    }

    #[test]
    fn test_resolve_deduplicates() {
        let device = HeadlessDevice::new();
        let destroyer = DeferredDestroyer::new(2);
        let registry = registry();
        let m = mesh(1, 2);
        let first = registry.resolve(&device, &m).unwrap();
        let second = registry.resolve(&device, &m).unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.ref_count(m.id), 4);
        assert_eq!(registry.live_count(), 2);
        assert_eq!(registry.pending_count(), 2);

        let mut cmd = Vec::new();
        assert_eq!(registry.build_pending(&device, &mut cmd, &destroyer).unwrap(), 2);
        assert_eq!(registry.build_pending(&device, &mut cmd, &destroyer).unwrap(), 0);
        assert_eq!(device.stats().blas_builds, 2);
        assert_eq!(device.max_blas_builds(), 1);
        assert!(matches!(
            cmd.as_slice(),
            [
                HeadlessCommand::BuildBlas { .. },
                HeadlessCommand::BuildBlas { .. },
                HeadlessCommand::Barrier(_)
            ]
        ));
    }

    #[test]
    fn test_release_destroys_once_at_zero() {
        let device = HeadlessDevice::new();
        let destroyer = DeferredDestroyer::new(1);
        let registry = registry();
        let m = mesh(7, 1);
        for _ in 0..3 {
            registry.resolve(&device, &m).unwrap();
        }
        assert!(!registry.release(m.id, &destroyer));
        assert!(!registry.release(m.id, &destroyer));
        assert_eq!(destroyer.pending(), 0);
        assert!(registry.release(m.id, &destroyer));
        assert_eq!(registry.ref_count(m.id), 0);
        assert_eq!(registry.live_count(), 0);
        destroyer.flush(&device);
        assert_eq!(device.stats().blas_destroyed, 1);
        assert_eq!(device.stats().live_blas, 0);
    }

    #[test]
    fn test_released_before_build_is_never_built() {
        let device = HeadlessDevice::new();
        let destroyer = DeferredDestroyer::new(1);
        let registry = registry();
        let m = mesh(3, 2);
        registry.resolve(&device, &m).unwrap();
        registry.release(m.id, &destroyer);
        registry.release(m.id, &destroyer);
        assert_eq!(registry.pending_count(), 0);
        let mut cmd = Vec::new();
        assert_eq!(registry.build_pending(&device, &mut cmd, &destroyer).unwrap(), 0);
        assert!(cmd.is_empty());
    }

    #[test]
    fn test_private_blas_bypasses_cache() {
        let device = HeadlessDevice::new();
        let destroyer = DeferredDestroyer::new(1);
        let registry = registry();
        let m = mesh(5, 1);
        let a = registry.register_private(&device, &m.groups[0]).unwrap();
        let b = registry.register_private(&device, &m.groups[0]).unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.ref_count(m.id), 0);
        registry.release_private(a, &destroyer);
        assert_eq!(registry.live_count(), 1);
        assert!(registry.device_address(a).is_none());
        assert!(registry.device_address(b).is_some());
        // The freed arena index is reused.
        let c = registry.register_private(&device, &m.groups[0]).unwrap();
        assert_eq!(c.index(), a.index());
    }
}
