use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use bevy::{
    ecs::{entity::Entity, system::Resource},
    math::Mat4,
    utils::tracing,
};
use itertools::Itertools;
use scoria::{
    ash::vk, buffer::UploadRing, Access, DeferredDestroyer, JobEvent, JobScheduler, RtDevice,
};

use crate::{
    instance::{self, inactive_record, instance_record, InstanceRecord},
    Allocation, BlasHandle, BlasRegistry, InstanceAllocator, InstanceSlot, MaterialRef,
    MeshGeometry, MeshId, ModelDesc, ModelLoadQueue, Mobility, ObjectBinding, ObjectBindingTable,
    PrimitiveGroup, RayTracingConfig, RayTracingError, TerrainPatch, TlasAction, TlasFlags,
    TlasManager, TlasState, TransformSource, TransformSynchronizer,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RayTracingStats {
    pub entities: usize,
    pub live_instances: u32,
    pub high_water: u32,
    pub live_blas: usize,
    pub pending_blas: usize,
    pub blas_builds: u64,
    pub tlas_builds: u64,
    pub tlas_updates: u64,
    pub tlas_reconstructions: u64,
}

/// What a single frame recorded.
#[derive(Resource, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameReport {
    pub frame: u64,
    pub static_writes: usize,
    pub transform_batches: usize,
    pub blas_builds: usize,
    pub instance_count: u32,
    pub instance_bytes: vk::DeviceSize,
    pub binding_bytes: vk::DeviceSize,
    pub reconstructed: bool,
    pub tlas: TlasAction,
}

enum EntityGeometry {
    Mesh(Arc<MeshGeometry>),
    Private(Vec<PrimitiveGroup>),
}

impl EntityGeometry {
    fn groups(&self) -> &[PrimitiveGroup] {
        match self {
            EntityGeometry::Mesh(mesh) => &mesh.groups,
            EntityGeometry::Private(groups) => groups,
        }
    }
}

struct RegisteredEntity {
    allocation: Allocation,
    geometry: EntityGeometry,
    writes: Arc<AtomicU64>,
}

/// GPU side state. Only exists when the device supports ray tracing.
struct Scene<D: RtDevice> {
    allocator: InstanceAllocator,
    slots: Vec<InstanceSlot>,
    blas: BlasRegistry<D>,
    instances: UploadRing<D, InstanceRecord>,
    bindings: ObjectBindingTable<D>,
    transforms: TransformSynchronizer,
    tlas: TlasManager<D>,
    destroyer: DeferredDestroyer<D>,
    entities: HashMap<Entity, RegisteredEntity>,
    transform_job: Option<JobEvent>,
    /// Set once a frame recorded copies out of the current staging buffers.
    submitted: bool,
    report: FrameReport,
}

impl<D: RtDevice> Scene<D> {
    fn new(device: &D, config: &RayTracingConfig) -> Result<Self, RayTracingError> {
        let capacity = config.max_instances as usize;
        let destroyer = DeferredDestroyer::new(config.frames_in_flight);
        let instances = UploadRing::new(
            device,
            "TLAS instances",
            capacity,
            config.frames_in_flight,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
        )?;
        let bindings = match ObjectBindingTable::new(device, capacity, config.frames_in_flight) {
            Ok(bindings) => bindings,
            Err(err) => {
                instances.retire(&destroyer);
                destroyer.flush(device);
                return Err(err.into());
            }
        };
        Ok(Self {
            allocator: InstanceAllocator::new(config.max_instances),
            slots: Vec::new(),
            blas: BlasRegistry::new(config.blas_build_flags),
            instances,
            bindings,
            transforms: TransformSynchronizer::new(config.transform_batch_size),
            tlas: TlasManager::new(config.tlas_flags()),
            destroyer,
            entities: HashMap::new(),
            transform_job: None,
            submitted: false,
            report: FrameReport::default(),
        })
    }

    /// Wait for the transform job, if one is running. Every access to the instance ring
    /// goes through here first.
    fn sync(&mut self) {
        if let Some(job) = self.transform_job.take() {
            job.wait();
        }
    }

    /// Prepare the staging rings for writes. After a recorded frame both rings move on to
    /// the next frame's buffers, leaving the ones the GPU copies from untouched.
    fn begin_writes(&mut self) {
        self.sync();
        if std::mem::take(&mut self.submitted) {
            self.instances.advance();
            self.bindings.advance();
        }
    }

    fn grow_slots(&mut self, end: u32) {
        if self.slots.len() < end as usize {
            self.slots.resize_with(end as usize, Default::default);
        }
    }

    fn setup_model(
        &mut self,
        device: &D,
        config: &RayTracingConfig,
        entity: Entity,
        desc: ModelDesc,
    ) -> Result<(), RayTracingError> {
        assert!(
            !self.entities.contains_key(&entity),
            "{entity:?} registered for ray tracing twice"
        );
        let mesh = desc.mesh;
        if desc.parts.len() != mesh.groups.len() {
            return Err(RayTracingError::PartCountMismatch {
                groups: mesh.groups.len(),
                parts: desc.parts.len(),
            });
        }
        self.begin_writes();
        let allocation = self.allocator.allocate(mesh.groups.len() as u32)?;
        let handles = match self.blas.resolve(device, &mesh) {
            Ok(handles) => handles,
            Err(err) => {
                self.allocator.free(allocation);
                return Err(err.into());
            }
        };
        self.grow_slots(allocation.end());
        for (slot, (group, part, handle)) in allocation
            .slots()
            .zip(itertools::multizip((&mesh.groups, &desc.parts, &handles)))
        {
            let shader_offset = config.shader_offset(part.material.category);
            self.instances.write(
                slot as usize,
                instance_record(
                    slot,
                    &Mat4::IDENTITY,
                    desc.visibility_mask,
                    shader_offset,
                    self.blas.device_address(*handle).unwrap_or(0),
                ),
            );
            self.bindings
                .write(slot, ObjectBinding::new(group, part.material.binding));
            self.slots[slot as usize] = InstanceSlot {
                owner: Some(entity),
                blas: Some(*handle),
                mobility: desc.mobility,
                mask: desc.visibility_mask,
                shader_offset,
            };
        }
        let writes = self.transforms.insert(
            entity,
            allocation.offset,
            desc.parts.iter().map(|part| part.node),
            desc.mobility,
        );
        tracing::debug!(
            "Registered {:?} with {:?} in slots {:?}",
            entity,
            mesh.id,
            allocation.slots()
        );
        self.entities.insert(
            entity,
            RegisteredEntity {
                allocation,
                geometry: EntityGeometry::Mesh(mesh),
                writes,
            },
        );
        self.tlas.mark_reconstruction();
        Ok(())
    }

    fn setup_terrain(
        &mut self,
        device: &D,
        config: &RayTracingConfig,
        entity: Entity,
        patches: &[TerrainPatch],
        visibility_mask: u8,
    ) -> Result<(), RayTracingError> {
        assert!(
            !self.entities.contains_key(&entity),
            "{entity:?} registered for ray tracing twice"
        );
        self.begin_writes();
        let allocation = self.allocator.allocate(patches.len() as u32)?;
        let mut handles: Vec<BlasHandle> = Vec::with_capacity(patches.len());
        for patch in patches {
            match self.blas.register_private(device, &patch.group) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    for handle in handles {
                        self.blas.release_private(handle, &self.destroyer);
                    }
                    self.allocator.free(allocation);
                    return Err(err.into());
                }
            }
        }
        self.grow_slots(allocation.end());
        for (slot, (patch, handle)) in allocation.slots().zip_eq(patches.iter().zip_eq(&handles)) {
            let shader_offset = config.shader_offset(patch.material.category);
            self.instances.write(
                slot as usize,
                instance_record(
                    slot,
                    &patch.transform,
                    visibility_mask,
                    shader_offset,
                    self.blas.device_address(*handle).unwrap_or(0),
                ),
            );
            self.bindings
                .write(slot, ObjectBinding::new(&patch.group, patch.material.binding));
            self.slots[slot as usize] = InstanceSlot {
                owner: Some(entity),
                blas: Some(*handle),
                mobility: Mobility::Static,
                mask: visibility_mask,
                shader_offset,
            };
        }
        tracing::debug!(
            "Registered {} terrain patches of {:?} in slots {:?}",
            patches.len(),
            entity,
            allocation.slots()
        );
        self.entities.insert(
            entity,
            RegisteredEntity {
                allocation,
                geometry: EntityGeometry::Private(
                    patches.iter().map(|patch| patch.group.clone()).collect(),
                ),
                // Terrain transforms are final at registration.
                writes: Arc::new(AtomicU64::new(1)),
            },
        );
        self.tlas.mark_reconstruction();
        Ok(())
    }

    fn remove(&mut self, entity: Entity) -> Result<(), RayTracingError> {
        self.begin_writes();
        let registered = self
            .entities
            .remove(&entity)
            .ok_or(RayTracingError::UnknownEntity(entity))?;
        for slot in registered.allocation.slots() {
            self.instances.write(slot as usize, inactive_record(slot));
            self.bindings.clear(slot);
            let released = std::mem::take(&mut self.slots[slot as usize]);
            let Some(handle) = released.blas else {
                continue;
            };
            match &registered.geometry {
                EntityGeometry::Mesh(mesh) => {
                    self.blas.release(mesh.id, &self.destroyer);
                }
                EntityGeometry::Private(_) => self.blas.release_private(handle, &self.destroyer),
            }
        }
        self.allocator.free(registered.allocation);
        self.transforms.remove(entity);
        self.slots.truncate(self.allocator.high_water() as usize);
        self.tlas.mark_reconstruction();
        tracing::debug!("Removed {:?} from slots {:?}", entity, registered.allocation.slots());
        Ok(())
    }

    fn allocation(&self, entity: Entity) -> Result<Allocation, RayTracingError> {
        self.entities
            .get(&entity)
            .map(|registered| registered.allocation)
            .ok_or(RayTracingError::UnknownEntity(entity))
    }

    fn update_records(
        &mut self,
        slots: impl Iterator<Item = u32>,
        mut f: impl FnMut(&mut InstanceRecord, &mut InstanceSlot),
    ) {
        self.begin_writes();
        for slot in slots {
            let mut record = self.instances.read(slot as usize);
            f(&mut record, &mut self.slots[slot as usize]);
            self.instances.write(slot as usize, record);
        }
    }

    fn swap_mesh(
        &mut self,
        device: &D,
        entity: Entity,
        mesh: Arc<MeshGeometry>,
    ) -> Result<(), RayTracingError> {
        self.begin_writes();
        let registered = self
            .entities
            .get_mut(&entity)
            .ok_or(RayTracingError::UnknownEntity(entity))?;
        let old = match &registered.geometry {
            EntityGeometry::Mesh(old) => old.id,
            EntityGeometry::Private(_) => panic!("{entity:?} has no mesh to swap"),
        };
        if mesh.groups.len() != registered.allocation.count as usize {
            return Err(RayTracingError::PartCountMismatch {
                groups: mesh.groups.len(),
                parts: registered.allocation.count as usize,
            });
        }
        // Resolve before releasing, so swapping to the same mesh never drops it to zero.
        let handles = self.blas.resolve(device, &mesh)?;
        for (slot, (group, handle)) in registered
            .allocation
            .slots()
            .zip_eq(mesh.groups.iter().zip_eq(&handles))
        {
            self.blas.release(old, &self.destroyer);
            let mut record = self.instances.read(slot as usize);
            record.acceleration_structure_reference = vk::AccelerationStructureReferenceKHR {
                device_handle: self.blas.device_address(*handle).unwrap_or(0),
            };
            self.instances.write(slot as usize, record);
            let material_offset = self.bindings.read(slot).material_offset;
            self.bindings
                .write(slot, ObjectBinding::new(group, material_offset));
            self.slots[slot as usize].blas = Some(*handle);
        }
        tracing::debug!("Swapped {:?} from {:?} to {:?}", entity, old, mesh.id);
        registered.geometry = EntityGeometry::Mesh(mesh);
        self.tlas.mark_reconstruction();
        Ok(())
    }

    fn refresh_bindings(&mut self, entity: Entity) -> Result<(), RayTracingError> {
        if !self.entities.contains_key(&entity) {
            return Err(RayTracingError::UnknownEntity(entity));
        }
        self.begin_writes();
        let registered = self
            .entities
            .get(&entity)
            .ok_or(RayTracingError::UnknownEntity(entity))?;
        for (slot, group) in registered
            .allocation
            .slots()
            .zip_eq(registered.geometry.groups())
        {
            let material_offset = self.bindings.read(slot).material_offset;
            self.bindings
                .write(slot, ObjectBinding::new(group, material_offset));
        }
        Ok(())
    }

    fn retire(mut self, device: &D) {
        self.sync();
        let Scene {
            blas,
            instances,
            bindings,
            tlas,
            destroyer,
            ..
        } = self;
        blas.retire_all(&destroyer);
        instances.retire(&destroyer);
        bindings.retire(&destroyer);
        tlas.retire(&destroyer);
        destroyer.flush(device);
    }
}

/// Owns every ray tracing structure of the scene.
///
/// Registration happens through [`RayTracingContext::setup_model`] and friends, or through the
/// [`ModelLoadQueue`] once geometry finished loading. Each frame is bracketed by
/// [`RayTracingContext::begin_frame`], which starts the transform job, and
/// [`RayTracingContext::end_frame`], which records uploads and builds.
///
/// On devices without ray tracing support every method returns immediately without side effects.
#[derive(Resource)]
pub struct RayTracingContext<D: RtDevice> {
    device: Arc<D>,
    config: RayTracingConfig,
    scheduler: Arc<dyn JobScheduler>,
    loads: ModelLoadQueue,
    frame: u64,
    scene: Option<Scene<D>>,
}

impl<D: RtDevice> RayTracingContext<D> {
    pub fn new(
        device: Arc<D>,
        config: RayTracingConfig,
        scheduler: Arc<dyn JobScheduler>,
    ) -> Result<Self, RayTracingError> {
        config.validate();
        let scene = if device.ray_tracing_support().is_supported() {
            tracing::info!(
                "Ray tracing enabled with {} instance slots and {} frames in flight",
                config.max_instances,
                config.frames_in_flight
            );
            Some(Scene::new(device.as_ref(), &config)?)
        } else {
            tracing::warn!("Ray tracing is not supported by the device, ray tracing is disabled");
            None
        };
        Ok(Self {
            device,
            config,
            scheduler,
            loads: ModelLoadQueue::default(),
            frame: 0,
            scene,
        })
    }

    /// A context on which every operation is a no-op.
    pub fn disabled(
        device: Arc<D>,
        config: RayTracingConfig,
        scheduler: Arc<dyn JobScheduler>,
    ) -> Self {
        Self {
            device,
            config,
            scheduler,
            loads: ModelLoadQueue::default(),
            frame: 0,
            scene: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.scene.is_some()
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn config(&self) -> &RayTracingConfig {
        &self.config
    }

    /// Number of completed [`RayTracingContext::end_frame`] calls.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn load_queue(&self) -> &ModelLoadQueue {
        &self.loads
    }

    pub fn setup_model(&mut self, entity: Entity, desc: ModelDesc) -> Result<(), RayTracingError> {
        let Some(scene) = self.scene.as_mut() else {
            return Ok(());
        };
        scene.setup_model(&self.device, &self.config, entity, desc)
    }

    /// Register per entity geometry with one private BLAS per patch.
    pub fn setup_terrain(
        &mut self,
        entity: Entity,
        patches: &[TerrainPatch],
        visibility_mask: u8,
    ) -> Result<(), RayTracingError> {
        let Some(scene) = self.scene.as_mut() else {
            return Ok(());
        };
        scene.setup_terrain(&self.device, &self.config, entity, patches, visibility_mask)
    }

    pub fn remove(&mut self, entity: Entity) -> Result<(), RayTracingError> {
        let Some(scene) = self.scene.as_mut() else {
            return Ok(());
        };
        scene.remove(entity)
    }

    pub fn set_visibility_mask(&mut self, entity: Entity, mask: u8) -> Result<(), RayTracingError> {
        let Some(scene) = self.scene.as_mut() else {
            return Ok(());
        };
        let allocation = scene.allocation(entity)?;
        scene.update_records(allocation.slots(), |record, slot| {
            instance::set_mask(record, mask);
            slot.mask = mask;
        });
        scene.tlas.mark_update();
        Ok(())
    }

    /// Change the material of primitive group `part` of `entity`.
    pub fn set_material(
        &mut self,
        entity: Entity,
        part: usize,
        material: MaterialRef,
    ) -> Result<(), RayTracingError> {
        let Some(scene) = self.scene.as_mut() else {
            return Ok(());
        };
        let allocation = scene.allocation(entity)?;
        assert!(
            part < allocation.count as usize,
            "{entity:?} has no part {part}"
        );
        let slot = allocation.offset + part as u32;
        let shader_offset = self.config.shader_offset(material.category);
        scene.update_records(std::iter::once(slot), |record, slot| {
            instance::set_shader_offset(record, shader_offset);
            slot.shader_offset = shader_offset;
        });
        let mut binding = scene.bindings.read(slot);
        binding.material_offset = material.binding;
        scene.bindings.write(slot, binding);
        scene.tlas.mark_update();
        Ok(())
    }

    /// Replace the mesh of `entity` with one that has the same number of primitive groups.
    /// The slot to BLAS assignment changes, so the TLAS is reconstructed.
    pub fn swap_mesh(
        &mut self,
        entity: Entity,
        mesh: Arc<MeshGeometry>,
    ) -> Result<(), RayTracingError> {
        let Some(scene) = self.scene.as_mut() else {
            return Ok(());
        };
        scene.swap_mesh(&self.device, entity, mesh)
    }

    /// Rewrite the object bindings of `entity` after its geometry buffers were relocated.
    pub fn refresh_bindings(&mut self, entity: Entity) -> Result<(), RayTracingError> {
        let Some(scene) = self.scene.as_mut() else {
            return Ok(());
        };
        scene.refresh_bindings(entity)
    }

    /// Register models that finished loading, advance the staging rings and start rewriting
    /// dynamic transforms. `source` is shared with the worker threads until
    /// [`RayTracingContext::end_frame`].
    pub fn begin_frame(&mut self, source: Arc<dyn TransformSource>) {
        let Some(scene) = self.scene.as_mut() else {
            // Completions are meaningless without ray tracing.
            self.loads.drain().for_each(drop);
            return;
        };
        scene.begin_writes();
        for pending in self.loads.drain() {
            if scene.entities.contains_key(&pending.entity) {
                tracing::error!(
                    "{:?} finished loading but is already registered for ray tracing",
                    pending.entity
                );
                continue;
            }
            if let Err(err) =
                scene.setup_model(&self.device, &self.config, pending.entity, pending.desc)
            {
                tracing::error!("Failed to register {:?} for ray tracing: {}", pending.entity, err);
            }
        }

        scene.destroyer.set_frame(&self.device, self.frame);

        let static_writes = scene
            .transforms
            .write_static(source.as_ref(), &mut scene.instances);
        if static_writes > 0 {
            scene.tlas.mark_update();
        }
        // SAFETY: the writer points into the current host buffer, which is neither advanced,
        // flushed nor written until `sync` waited for the job.
        let job = unsafe {
            scene
                .transforms
                .dispatch(self.scheduler.as_ref(), source, scene.instances.writer())
        };
        let transform_batches = job.as_ref().map_or(0, JobEvent::batch_count);
        if job.is_some() {
            scene.tlas.mark_update();
        }
        scene.transform_job = job;
        scene.report = FrameReport {
            frame: self.frame,
            static_writes,
            transform_batches,
            ..Default::default()
        };
    }

    /// Wait for the transform job and record BLAS builds, staging uploads and the TLAS
    /// build or update into `cmd`.
    pub fn end_frame(&mut self, cmd: &mut D::CommandBuffer) -> Result<FrameReport, RayTracingError> {
        let Some(scene) = self.scene.as_mut() else {
            return Ok(FrameReport::default());
        };
        let device = self.device.as_ref();
        scene.sync();
        let mut report = std::mem::take(&mut scene.report);
        report.frame = self.frame;
        report.blas_builds = scene.blas.build_pending(device, cmd, &scene.destroyer)?;

        let instance_count = scene.allocator.high_water();
        report.instance_count = instance_count;
        if scene.tlas.flags().any() {
            report.instance_bytes = scene.instances.flush(
                device,
                cmd,
                instance_count as usize,
                Access::ACCELERATION_STRUCTURE_BUILD_INPUT,
            );
        }
        report.binding_bytes = scene.bindings.flush(device, cmd, instance_count);
        scene.submitted = true;
        report.reconstructed = scene.tlas.flags().needs_reconstruction;
        report.tlas = scene.tlas.record(
            device,
            cmd,
            &scene.destroyer,
            instance_count,
            scene.instances.device_address(device),
        )?;
        self.frame += 1;
        Ok(report)
    }

    /// `None` until a TLAS was created, and again once the scene is empty.
    pub fn tlas(&self) -> Option<&D::AccelStruct> {
        self.scene.as_ref()?.tlas.accel_struct()
    }

    pub fn tlas_address(&self) -> Option<vk::DeviceAddress> {
        self.tlas()
            .map(|tlas| self.device.accel_struct_device_address(tlas))
    }

    /// Device address of the object binding table, indexed by instance custom index.
    pub fn binding_table_address(&self) -> Option<vk::DeviceAddress> {
        let scene = self.scene.as_ref()?;
        Some(scene.bindings.device_address(&self.device))
    }

    pub fn tlas_flags(&self) -> TlasFlags {
        self.scene
            .as_ref()
            .map(|scene| scene.tlas.flags())
            .unwrap_or_default()
    }

    pub fn tlas_state(&self) -> TlasState {
        self.scene
            .as_ref()
            .map(|scene| scene.tlas.state())
            .unwrap_or_default()
    }

    pub fn is_registered(&self, entity: Entity) -> bool {
        self.scene
            .as_ref()
            .is_some_and(|scene| scene.entities.contains_key(&entity))
    }

    pub fn allocation(&self, entity: Entity) -> Option<Allocation> {
        self.scene.as_ref()?.allocation(entity).ok()
    }

    pub fn slot(&self, index: u32) -> Option<&InstanceSlot> {
        self.scene.as_ref()?.slots.get(index as usize)
    }

    /// Instance record of `slot` as staged for the current frame. Waits for a running
    /// transform job.
    pub fn instance_record(&mut self, slot: u32) -> Option<InstanceRecord> {
        let scene = self.scene.as_mut()?;
        scene.sync();
        (slot < scene.allocator.capacity()).then(|| scene.instances.read(slot as usize))
    }

    pub fn object_binding(&self, slot: u32) -> Option<ObjectBinding> {
        let scene = self.scene.as_ref()?;
        (slot < scene.allocator.capacity()).then(|| scene.bindings.read(slot))
    }

    /// Number of frames in which the transform of `entity` was written to the staging ring.
    pub fn transform_writes(&self, entity: Entity) -> Option<u64> {
        let scene = self.scene.as_ref()?;
        let registered = scene.entities.get(&entity)?;
        Some(registered.writes.load(Ordering::Relaxed))
    }

    pub fn blas_ref_count(&self, mesh: MeshId) -> u32 {
        self.scene
            .as_ref()
            .map_or(0, |scene| scene.blas.ref_count(mesh))
    }

    pub fn stats(&self) -> RayTracingStats {
        let Some(scene) = self.scene.as_ref() else {
            return RayTracingStats::default();
        };
        RayTracingStats {
            entities: scene.entities.len(),
            live_instances: scene.allocator.live_slots(),
            high_water: scene.allocator.high_water(),
            live_blas: scene.blas.live_count(),
            pending_blas: scene.blas.pending_count(),
            blas_builds: scene.blas.builds_issued(),
            tlas_builds: scene.tlas.builds(),
            tlas_updates: scene.tlas.updates(),
            tlas_reconstructions: scene.tlas.reconstructions(),
        }
    }
}

impl<D: RtDevice> Drop for RayTracingContext<D> {
    /// Destroys every GPU object right away. The GPU must be idle.
    fn drop(&mut self) {
        if let Some(scene) = self.scene.take() {
            scene.retire(&self.device);
        }
    }
}
