//! The coordinator's view of its workers.

use std::collections::BTreeMap;

use tokio::sync::mpsc;

use crate::chunk::ChunkId;
use crate::protocol::{CoordinatorMessage, WorkerEnvelope, WorkerId, WorkerInit};
use crate::worker::{Worker, WorkerContext, WorkerHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    /// Spawned, `ready` not seen yet.
    Starting,
    Idle,
    Busy(ChunkId),
}

#[derive(Debug)]
pub(crate) struct Slot {
    pub handle: WorkerHandle,
    pub state: SlotState,
    /// Canonical cache entries this worker has been sent so far.
    pub cache_cursor: usize,
}

#[derive(Debug, Default)]
pub(crate) struct WorkerPool {
    slots: BTreeMap<WorkerId, Slot>,
}

impl WorkerPool {
    /// Spawn `count` workers and send each of them `init`.
    pub fn spawn(
        count: usize,
        ctx: &WorkerContext,
        outbound: &mpsc::UnboundedSender<WorkerEnvelope>,
        init: &WorkerInit,
    ) -> Self {
        let mut slots = BTreeMap::new();
        for id in 1..=count as WorkerId {
            let handle = Worker::spawn(id, ctx.clone(), outbound.clone());
            handle.send(CoordinatorMessage::Initialize(init.clone()));
            slots.insert(
                id,
                Slot {
                    handle,
                    state: SlotState::Starting,
                    cache_cursor: init.cache_entries.len(),
                },
            );
        }
        Self { slots }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn any_busy(&self) -> bool {
        self.slots.values().any(|s| matches!(s.state, SlotState::Busy(_)))
    }

    /// Idle workers in id order.
    pub fn idle(&self) -> Vec<WorkerId> {
        self.slots
            .iter()
            .filter(|(_, s)| s.state == SlotState::Idle)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn get(&self, id: WorkerId) -> Option<&Slot> {
        self.slots.get(&id)
    }

    pub fn get_mut(&mut self, id: WorkerId) -> Option<&mut Slot> {
        self.slots.get_mut(&id)
    }

    pub fn remove(&mut self, id: WorkerId) -> Option<Slot> {
        self.slots.remove(&id)
    }

    /// Ask every worker to stop. Acks arrive as `shutdown-ack` messages.
    pub fn shutdown_all(&self) {
        for slot in self.slots.values() {
            slot.handle.send(CoordinatorMessage::Shutdown);
        }
    }
}
