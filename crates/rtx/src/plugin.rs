use std::sync::Arc;

use bevy::{
    app::{App, Last, Plugin, PostUpdate},
    ecs::system::{Res, ResMut, Resource},
    utils::tracing,
};
use scoria::{JobScheduler, RtDevice, TaskPoolScheduler};

use crate::{FrameReport, RayTracingConfig, RayTracingContext, SceneTransforms};

/// Command buffer the ray tracing work of a frame is recorded into. Submission is up to the
/// renderer, between `Last` and the next `PostUpdate`, where it is replaced by an empty one.
#[derive(Resource)]
pub struct RayTracingCommands<D: RtDevice>(pub D::CommandBuffer);

pub struct RayTracingPlugin<D: RtDevice> {
    pub device: Arc<D>,
    pub config: RayTracingConfig,
}

impl<D: RtDevice> RayTracingPlugin<D> {
    pub fn new(device: Arc<D>) -> Self {
        Self {
            device,
            config: RayTracingConfig::default(),
        }
    }
    pub fn with_config(mut self, config: RayTracingConfig) -> Self {
        self.config = config;
        self
    }
}

impl<D: RtDevice> Plugin for RayTracingPlugin<D>
where
    D::CommandBuffer: Default + Send + Sync + 'static,
{
    fn build(&self, app: &mut App) {
        let scheduler: Arc<dyn JobScheduler> = Arc::new(TaskPoolScheduler::compute());
        let context = match RayTracingContext::new(
            self.device.clone(),
            self.config.clone(),
            scheduler.clone(),
        ) {
            Ok(context) => context,
            Err(err) => {
                tracing::error!("Failed to create the ray tracing context, disabling ray tracing: {}", err);
                RayTracingContext::disabled(self.device.clone(), self.config.clone(), scheduler)
            }
        };
        app.insert_resource(context)
            .insert_resource(RayTracingCommands::<D>(Default::default()))
            .init_resource::<SceneTransforms>()
            .init_resource::<FrameReport>()
            .add_systems(PostUpdate, begin_frame::<D>)
            .add_systems(Last, end_frame::<D>);
    }
}

fn begin_frame<D: RtDevice>(
    mut context: ResMut<RayTracingContext<D>>,
    mut commands: ResMut<RayTracingCommands<D>>,
    transforms: Res<SceneTransforms>,
) where
    D::CommandBuffer: Default + Send + Sync + 'static,
{
    commands.0 = Default::default();
    context.begin_frame(Arc::new(transforms.clone()));
}

fn end_frame<D: RtDevice>(
    mut context: ResMut<RayTracingContext<D>>,
    mut commands: ResMut<RayTracingCommands<D>>,
    mut report: ResMut<FrameReport>,
) where
    D::CommandBuffer: Send + Sync + 'static,
{
    match context.end_frame(&mut commands.0) {
        Ok(frame) => *report = frame,
        Err(err) => tracing::error!("Failed to record ray tracing frame: {}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_support::mesh, ModelDesc, ModelPart, Mobility, TlasAction};
    use bevy::{ecs::entity::Entity, math::Mat4};
    use scoria::headless::{HeadlessCommand, HeadlessDevice};

    #[test]
    fn test_frames_run_through_schedules() {
        let device = Arc::new(HeadlessDevice::new());
        let mut app = App::new();
        app.add_plugins(RayTracingPlugin::new(device.clone()).with_config(RayTracingConfig {
            max_instances: 64,
            ..Default::default()
        }));

        let entity = Entity::from_raw(7);
        let m = Arc::new(mesh(1, 2));
        app.world_mut()
            .resource_mut::<RayTracingContext<HeadlessDevice>>()
            .setup_model(
                entity,
                ModelDesc {
                    mesh: m,
                    parts: vec![ModelPart::default(), ModelPart { node: 1, ..Default::default() }],
                    mobility: Mobility::Dynamic,
                    visibility_mask: 0xff,
                },
            )
            .unwrap();
        app.world_mut()
            .resource_mut::<SceneTransforms>()
            .set(entity, vec![Mat4::IDENTITY; 2]);

        app.update();
        let report = *app.world().resource::<FrameReport>();
        assert_eq!(report.tlas, TlasAction::Build);
        assert_eq!(report.blas_builds, 2);
        assert_eq!(report.transform_batches, 1);
        assert!(app
            .world()
            .resource::<RayTracingCommands<HeadlessDevice>>()
            .0
            .iter()
            .any(|command| matches!(command, HeadlessCommand::BuildTlas { .. })));

        app.update();
        let context = app.world().resource::<RayTracingContext<HeadlessDevice>>();
        assert_eq!(context.frame(), 2);
        assert_eq!(context.transform_writes(entity), Some(2));
        assert_eq!(app.world().resource::<FrameReport>().tlas, TlasAction::Update);
    }

    #[test]
    fn test_commands_hold_a_single_frame() {
        let device = Arc::new(HeadlessDevice::new());
        let mut app = App::new();
        app.add_plugins(RayTracingPlugin::new(device.clone()));
        let m = Arc::new(mesh(1, 1));
        for index in 0..3 {
            app.world_mut()
                .resource_mut::<RayTracingContext<HeadlessDevice>>()
                .setup_model(
                    Entity::from_raw(index),
                    ModelDesc {
                        mesh: m.clone(),
                        parts: vec![ModelPart::default()],
                        mobility: Mobility::Static,
                        visibility_mask: 0xff,
                    },
                )
                .unwrap();
            app.update();
            let commands = &app.world().resource::<RayTracingCommands<HeadlessDevice>>().0;
            let builds = commands
                .iter()
                .filter(|command| matches!(command, HeadlessCommand::BuildTlas { .. }))
                .count();
            assert_eq!(builds, 1);
            assert_eq!(
                commands
                    .iter()
                    .filter(|command| matches!(command, HeadlessCommand::BuildBlas { .. }))
                    .count(),
                usize::from(index == 0)
            );
        }
    }
}
