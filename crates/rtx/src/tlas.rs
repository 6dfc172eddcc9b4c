use bevy::utils::tracing;
use scoria::{
    ash::{prelude::VkResult, vk},
    Access, BufferInfo, DeferredDestroyer, ResourceState, RtDevice, TlasBuildInfo,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TlasState {
    /// No TLAS exists.
    #[default]
    Uninitialized,
    /// Recreated this frame and waiting for its first build.
    Reconstructing,
    /// Fully built from the current instance topology.
    Built,
    /// Refreshed in place at least once since the last full build.
    Steady,
}

/// Sticky dirty flags, set by scene changes and consumed by [`TlasManager::record`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlasFlags {
    /// Instance count or slot to BLAS assignment changed.
    pub needs_reconstruction: bool,
    pub needs_build: bool,
    /// Only transforms, masks or shader offsets changed.
    pub needs_update: bool,
}

impl TlasFlags {
    pub fn any(&self) -> bool {
        self.needs_reconstruction || self.needs_build || self.needs_update
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TlasAction {
    #[default]
    None,
    Build,
    Update,
}

struct ScratchBuffer<D: RtDevice> {
    buffer: D::Buffer,
    size: vk::DeviceSize,
    address: vk::DeviceAddress,
    state: ResourceState,
}

/// The single top level acceleration structure and the decision of how to refresh it.
pub struct TlasManager<D: RtDevice> {
    flags: vk::BuildAccelerationStructureFlagsKHR,
    state: TlasState,
    dirty: TlasFlags,
    accel_struct: Option<D::AccelStruct>,
    access: ResourceState,
    instance_count: u32,
    scratch: Option<ScratchBuffer<D>>,
    builds: u64,
    updates: u64,
    reconstructions: u64,
}

impl<D: RtDevice> TlasManager<D> {
    pub fn new(flags: vk::BuildAccelerationStructureFlagsKHR) -> Self {
        Self {
            flags: flags | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE,
            state: TlasState::Uninitialized,
            dirty: TlasFlags::default(),
            accel_struct: None,
            access: ResourceState::default(),
            instance_count: 0,
            scratch: None,
            builds: 0,
            updates: 0,
            reconstructions: 0,
        }
    }

    pub fn mark_reconstruction(&mut self) {
        self.dirty.needs_reconstruction = true;
    }

    pub fn mark_update(&mut self) {
        self.dirty.needs_update = true;
    }

    pub fn flags(&self) -> TlasFlags {
        self.dirty
    }

    pub fn state(&self) -> TlasState {
        self.state
    }

    pub fn accel_struct(&self) -> Option<&D::AccelStruct> {
        self.accel_struct.as_ref()
    }

    /// Instance count the current TLAS was created for.
    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    pub fn builds(&self) -> u64 {
        self.builds
    }
    pub fn updates(&self) -> u64 {
        self.updates
    }
    pub fn reconstructions(&self) -> u64 {
        self.reconstructions
    }

    /// Consume the dirty flags and record whatever they call for.
    ///
    /// `instance_count` records starting at `instance_data` must already be visible to
    /// acceleration structure builds.
    pub fn record(
        &mut self,
        device: &D,
        cmd: &mut D::CommandBuffer,
        destroyer: &DeferredDestroyer<D>,
        instance_count: u32,
        instance_data: vk::DeviceAddress,
    ) -> VkResult<TlasAction> {
        if self.dirty.needs_reconstruction {
            self.reconstruct(device, destroyer, instance_count)?;
        }
        let Some(accel_struct) = self.accel_struct.as_ref() else {
            self.dirty = TlasFlags::default();
            return Ok(TlasAction::None);
        };
        let (action, mode) = if self.dirty.needs_build {
            (TlasAction::Build, vk::BuildAccelerationStructureModeKHR::BUILD)
        } else if self.dirty.needs_update {
            (TlasAction::Update, vk::BuildAccelerationStructureModeKHR::UPDATE)
        } else {
            return Ok(TlasAction::None);
        };
        let Some(scratch) = self.scratch.as_mut() else {
            unreachable!("a TLAS always has scratch memory");
        };
        device.cmd_barrier_if_needed(
            cmd,
            self.access.transition(Access::ACCELERATION_STRUCTURE_WRITE),
        );
        device.cmd_barrier_if_needed(
            cmd,
            scratch
                .state
                .transition(Access::ACCELERATION_STRUCTURE_SCRATCH),
        );
        device.cmd_build_tlas(
            cmd,
            &TlasBuildInfo {
                dst: accel_struct,
                src: (action == TlasAction::Update).then_some(accel_struct),
                mode,
                flags: self.flags,
                instance_data,
                instance_count: self.instance_count,
                scratch_data: scratch.address,
            },
        );
        device.cmd_barrier_if_needed(cmd, self.access.transition(Access::RAY_TRACING_READ));

        match action {
            TlasAction::Build => {
                self.builds += 1;
                self.state = TlasState::Built;
            }
            TlasAction::Update => {
                self.updates += 1;
                self.state = TlasState::Steady;
            }
            TlasAction::None => {}
        }
        self.dirty = TlasFlags::default();
        tracing::debug!("TLAS {:?} over {} instances", action, self.instance_count);
        Ok(action)
    }

    fn reconstruct(
        &mut self,
        device: &D,
        destroyer: &DeferredDestroyer<D>,
        instance_count: u32,
    ) -> VkResult<()> {
        if let Some(old) = self.accel_struct.take() {
            destroyer.destroy_accel_struct(old);
        }
        self.access = ResourceState::default();
        self.instance_count = 0;
        self.dirty.needs_reconstruction = false;
        if instance_count == 0 {
            self.state = TlasState::Uninitialized;
            return Ok(());
        }

        let sizes = device.tlas_build_sizes(self.flags, instance_count);
        let scratch_size = sizes.build_scratch_size.max(sizes.update_scratch_size);
        let alignment = device.min_scratch_offset_alignment().max(1) as vk::DeviceSize;
        if self
            .scratch
            .as_ref()
            .map_or(true, |scratch| scratch.size < scratch_size)
        {
            let buffer = device.create_buffer(&BufferInfo {
                size: scratch_size + alignment,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                host_visible: false,
                name: "TLAS scratch",
            });
            let buffer = match buffer {
                Ok(buffer) => buffer,
                Err(err) => {
                    self.dirty.needs_reconstruction = true;
                    return Err(err);
                }
            };
            let address = device
                .buffer_device_address(&buffer)
                .next_multiple_of(alignment);
            if let Some(old) = self.scratch.replace(ScratchBuffer {
                buffer,
                size: scratch_size,
                address,
                state: ResourceState::default(),
            }) {
                destroyer.destroy_buffer(old.buffer);
            }
        }

        let accel_struct = match device.create_accel_struct(
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            sizes.size,
            "TLAS",
        ) {
            Ok(accel_struct) => accel_struct,
            Err(err) => {
                self.dirty.needs_reconstruction = true;
                return Err(err);
            }
        };
        tracing::info!(
            "Reconstructed TLAS for {} instances ({} bytes)",
            instance_count,
            sizes.size
        );
        self.accel_struct = Some(accel_struct);
        self.instance_count = instance_count;
        self.state = TlasState::Reconstructing;
        self.dirty.needs_build = true;
        self.reconstructions += 1;
        Ok(())
    }

    pub fn retire(self, destroyer: &DeferredDestroyer<D>) {
        if let Some(accel_struct) = self.accel_struct {
            destroyer.destroy_accel_struct(accel_struct);
        }
        if let Some(scratch) = self.scratch {
            destroyer.destroy_buffer(scratch.buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scoria::headless::{HeadlessCommand, HeadlessDevice};

    fn manager() -> TlasManager<HeadlessDevice> {
        TlasManager::new(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
    }

    fn tlas_commands(cmd: &[HeadlessCommand]) -> Vec<vk::BuildAccelerationStructureModeKHR> {
        cmd.iter()
            .filter_map(|command| match command {
                HeadlessCommand::BuildTlas { mode, .. } => Some(*mode),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_nothing_happens_without_flags() {
        let device = HeadlessDevice::new();
        let destroyer = DeferredDestroyer::new(2);
        let mut tlas = manager();
        let mut cmd = Vec::new();
        assert_eq!(
            tlas.record(&device, &mut cmd, &destroyer, 4, 0x100).unwrap(),
            TlasAction::None
        );
        assert_eq!(tlas.state(), TlasState::Uninitialized);
        assert!(cmd.is_empty());
    }

    #[test]
    fn test_reconstruct_then_build_then_update() {
        let device = HeadlessDevice::new();
        let destroyer = DeferredDestroyer::new(2);
        let mut tlas = manager();
        let mut cmd = Vec::new();

        tlas.mark_reconstruction();
        tlas.mark_update();
        assert_eq!(
            tlas.record(&device, &mut cmd, &destroyer, 4, 0x100).unwrap(),
            TlasAction::Build
        );
        assert_eq!(tlas.state(), TlasState::Built);
        assert_eq!(tlas.instance_count(), 4);
        assert_eq!(tlas.flags(), TlasFlags::default());

        tlas.mark_update();
        assert_eq!(
            tlas.record(&device, &mut cmd, &destroyer, 4, 0x100).unwrap(),
            TlasAction::Update
        );
        assert_eq!(tlas.state(), TlasState::Steady);
        assert_eq!(
            tlas_commands(&cmd),
            vec![
                vk::BuildAccelerationStructureModeKHR::BUILD,
                vk::BuildAccelerationStructureModeKHR::UPDATE
            ]
        );
        assert_eq!(device.stats().tlas_builds, 1);
        assert_eq!(device.stats().tlas_updates, 1);
        // The update waits for the previous frame's ray tracing reads.
        let update_start = cmd
            .iter()
            .rposition(|command| matches!(command, HeadlessCommand::BuildTlas { .. }))
            .unwrap();
        assert!(matches!(cmd[update_start - 1], HeadlessCommand::Barrier(_)));
        assert!(matches!(cmd.last(), Some(HeadlessCommand::Barrier(_))));
    }

    #[test]
    fn test_reconstruction_replaces_the_old_tlas() {
        let device = HeadlessDevice::new();
        let destroyer = DeferredDestroyer::new(1);
        let mut tlas = manager();
        let mut cmd = Vec::new();
        tlas.mark_reconstruction();
        tlas.record(&device, &mut cmd, &destroyer, 2, 0x100).unwrap();
        tlas.mark_reconstruction();
        tlas.record(&device, &mut cmd, &destroyer, 3, 0x100).unwrap();
        assert_eq!(tlas.reconstructions(), 2);
        // The old TLAS and the scratch buffer that became too small.
        assert_eq!(destroyer.pending(), 2);
        destroyer.flush(&device);
        assert_eq!(device.stats().tlas_destroyed, 1);
        assert_eq!(device.stats().live_tlas, 1);
        assert_eq!(device.stats().live_buffers, 1);
        assert_eq!(
            tlas_commands(&cmd),
            vec![vk::BuildAccelerationStructureModeKHR::BUILD; 2]
        );
    }

    #[test]
    fn test_empty_scene_drops_the_tlas() {
        let device = HeadlessDevice::new();
        let destroyer = DeferredDestroyer::new(1);
        let mut tlas = manager();
        let mut cmd = Vec::new();
        tlas.mark_reconstruction();
        tlas.record(&device, &mut cmd, &destroyer, 2, 0x100).unwrap();
        tlas.mark_reconstruction();
        tlas.mark_update();
        assert_eq!(
            tlas.record(&device, &mut cmd, &destroyer, 0, 0x100).unwrap(),
            TlasAction::None
        );
        assert!(tlas.accel_struct().is_none());
        assert_eq!(tlas.state(), TlasState::Uninitialized);
        assert_eq!(tlas.flags(), TlasFlags::default());
    }
}
