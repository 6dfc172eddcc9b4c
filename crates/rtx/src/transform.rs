use std::{
    collections::HashMap,
    ops::Range,
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
use scoria::{buffer::StagingWriter, buffer::UploadRing, JobEvent, JobScheduler, RtDevice};

use crate::instance::{transform_matrix, InstanceRecord};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Mobility {
    /// Transform written once, the first frame the scene graph knows the entity.
    #[default]
    Static,
    /// Transform rewritten every frame.
    Dynamic,
}

/// Read access to world space node transforms of the scene graph.
pub trait TransformSource: Send + Sync + 'static {
    fn node_transforms(&self, entity: Entity) -> Option<&[Mat4]>;
}

/// Node transforms keyed by entity. Cloning is cheap, so a snapshot can be handed to the
/// transform job every frame while the main thread keeps editing its own copy.
#[derive(Resource, Clone, Default)]
pub struct SceneTransforms {
    nodes: Arc<HashMap<Entity, Vec<Mat4>>>,
}

impl SceneTransforms {
    pub fn set(&mut self, entity: Entity, nodes: Vec<Mat4>) {
        Arc::make_mut(&mut self.nodes).insert(entity, nodes);
    }
    pub fn remove(&mut self, entity: Entity) {
        Arc::make_mut(&mut self.nodes).remove(&entity);
    }
}

impl TransformSource for SceneTransforms {
    fn node_transforms(&self, entity: Entity) -> Option<&[Mat4]> {
        self.nodes.get(&entity).map(Vec::as_slice)
    }
}

#[derive(Clone)]
struct TransformTarget {
    entity: Entity,
    first_slot: u32,
    /// Node index per slot of the allocation.
    nodes: Arc<[u32]>,
    writes: Arc<AtomicU64>,
}

impl TransformTarget {
    /// Returns false when the scene graph does not know the entity yet.
    fn write(&self, source: &dyn TransformSource, mut write: impl FnMut(usize, &Mat4)) -> bool {
        let Some(transforms) = source.node_transforms(self.entity) else {
            return false;
        };
        for (i, &node) in self.nodes.iter().enumerate() {
            match transforms.get(node as usize) {
                Some(transform) => write(self.first_slot as usize + i, transform),
                None => tracing::warn!(
                    "Node {} of {:?} has no transform, keeping the previous one",
                    node,
                    self.entity
                ),
            }
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        true
    }
}

/// Keeps instance transforms in the staging ring in sync with the scene graph.
///
/// Static entities are written once, on the main thread, with a write that persists into
/// every buffered frame. Dynamic entities are rewritten every frame by a parallel job that
/// only touches the transform of their own slots in the current frame's buffer.
pub struct TransformSynchronizer {
    batch_size: usize,
    dynamic: Vec<TransformTarget>,
    dynamic_snapshot: Option<Arc<[TransformTarget]>>,
    pending_static: Vec<TransformTarget>,
}

impl TransformSynchronizer {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            dynamic: Vec::new(),
            dynamic_snapshot: None,
            pending_static: Vec::new(),
        }
    }

    /// Start tracking `entity`. Returns its write counter.
    pub fn insert(
        &mut self,
        entity: Entity,
        first_slot: u32,
        nodes: impl IntoIterator<Item = u32>,
        mobility: Mobility,
    ) -> Arc<AtomicU64> {
        let writes = Arc::new(AtomicU64::new(0));
        let target = TransformTarget {
            entity,
            first_slot,
            nodes: nodes.into_iter().collect(),
            writes: writes.clone(),
        };
        match mobility {
            Mobility::Static => self.pending_static.push(target),
            Mobility::Dynamic => {
                self.dynamic.push(target);
                self.dynamic_snapshot = None;
            }
        }
        writes
    }

    pub fn remove(&mut self, entity: Entity) {
        self.pending_static.retain(|target| target.entity != entity);
        let before = self.dynamic.len();
        self.dynamic.retain(|target| target.entity != entity);
        if self.dynamic.len() != before {
            self.dynamic_snapshot = None;
        }
    }

    pub fn dynamic_count(&self) -> usize {
        self.dynamic.len()
    }

    pub fn pending_static_count(&self) -> usize {
        self.pending_static.len()
    }

    /// Write the transforms of static entities registered since the last call. Entities the
    /// scene graph does not know yet stay pending. Returns the number of entities written.
    pub fn write_static<D: RtDevice>(
        &mut self,
        source: &dyn TransformSource,
        instances: &mut UploadRing<D, InstanceRecord>,
    ) -> usize {
        let before = self.pending_static.len();
        self.pending_static.retain(|target| {
            let written = target.write(source, |slot, transform| {
                let mut record = instances.read(slot);
                record.transform = transform_matrix(transform);
                instances.write(slot, record);
            });
            !written
        });
        before - self.pending_static.len()
    }

    /// Dispatch the per frame job rewriting every dynamic transform through `writer`.
    ///
    /// # Safety
    /// `writer` must stay valid until the returned event is signaled, and nothing else may
    /// access the slots of dynamic entities in the meantime.
    pub unsafe fn dispatch(
        &mut self,
        scheduler: &dyn JobScheduler,
        source: Arc<dyn TransformSource>,
        writer: StagingWriter<InstanceRecord>,
    ) -> Option<JobEvent> {
        if self.dynamic.is_empty() {
            return None;
        }
        let targets = self
            .dynamic_snapshot
            .get_or_insert_with(|| self.dynamic.iter().cloned().collect())
            .clone();
        let total = targets.len();
        let event = scheduler.dispatch(
            total,
            self.batch_size,
            Arc::new(move |range: Range<usize>| {
                for target in &targets[range] {
                    // Batches own disjoint entities, and entities own disjoint slot ranges.
                    target.write(source.as_ref(), |slot, transform| {
                        writer.update(slot, |record| record.transform = transform_matrix(transform));
                    });
                }
            }),
        );
        Some(event)
    }
}
