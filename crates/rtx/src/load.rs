use bevy::ecs::entity::Entity;
use crossbeam_channel::{Receiver, Sender, TryIter};

use crate::ModelDesc;

/// A model whose geometry finished loading, waiting to be registered.
#[derive(Debug, Clone)]
pub struct PendingModel {
    pub entity: Entity,
    pub desc: ModelDesc,
}

/// Completion queue between loader threads and the main thread.
///
/// Loaders push through any clone of [`ModelLoadQueue::sender`]; the context drains the
/// queue once per frame, so ray tracing state is only ever touched by its owner.
pub struct ModelLoadQueue {
    sender: Sender<PendingModel>,
    receiver: Receiver<PendingModel>,
}

impl Default for ModelLoadQueue {
    fn default() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self { sender, receiver }
    }
}

impl ModelLoadQueue {
    pub fn sender(&self) -> Sender<PendingModel> {
        self.sender.clone()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub(crate) fn drain(&self) -> TryIter<'_, PendingModel> {
        self.receiver.try_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_support::mesh, Mobility};
    use std::sync::Arc;

    #[test]
    fn test_completions_from_other_threads() {
        let queue = ModelLoadQueue::default();
        let mesh = Arc::new(mesh(1, 1));
        std::thread::scope(|scope| {
            for i in 0..4 {
                let sender = queue.sender();
                let mesh = mesh.clone();
                scope.spawn(move || {
                    sender
                        .send(PendingModel {
                            entity: Entity::from_raw(i),
                            desc: ModelDesc {
                                mesh,
                                parts: vec![Default::default()],
                                mobility: Mobility::Static,
                                visibility_mask: 0xff,
                            },
                        })
                        .unwrap();
                });
            }
        });
        assert_eq!(queue.len(), 4);
        let mut entities: Vec<_> = queue.drain().map(|pending| pending.entity.index()).collect();
        entities.sort();
        assert_eq!(entities, vec![0, 1, 2, 3]);
        assert!(queue.is_empty());
    }
}
