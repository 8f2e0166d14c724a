//! The pending-step queue.
//!
//! Holds at most one pending step per instance. Ready steps are handed out
//! in round-robin order across instances, and a step for an instance that
//! is already running is parked until the running step finishes.

use dealflow_core::WorkflowInstanceId;
use dealflow_workflow::StepTrigger;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Pending {
    trigger: StepTrigger,
    not_before: Instant,
}

/// Pending steps keyed by instance.
#[derive(Debug, Default)]
pub struct StepQueue {
    pending: HashMap<WorkflowInstanceId, Pending>,
    ring: VecDeque<WorkflowInstanceId>,
    in_flight: HashSet<WorkflowInstanceId>,
    /// Triggers that arrived while the instance was in flight.
    dirty: HashMap<WorkflowInstanceId, StepTrigger>,
}

impl StepQueue {
    /// An empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a step that is ready now. Returns false if the trigger was
    /// merged into an existing pending or running step.
    pub fn push(&mut self, instance_id: WorkflowInstanceId, trigger: StepTrigger) -> bool {
        self.push_at(instance_id, trigger, Instant::now())
    }

    /// Queues a step that must not start before `not_before`. A pending
    /// step for the same instance keeps the later of the two deadlines.
    pub fn push_at(
        &mut self,
        instance_id: WorkflowInstanceId,
        trigger: StepTrigger,
        not_before: Instant,
    ) -> bool {
        if self.in_flight.contains(&instance_id) {
            self.dirty.insert(instance_id, trigger);
            return false;
        }
        match self.pending.get_mut(&instance_id) {
            Some(pending) => {
                pending.trigger = trigger;
                pending.not_before = pending.not_before.max(not_before);
                false
            }
            None => {
                self.pending.insert(
                    instance_id,
                    Pending {
                        trigger,
                        not_before,
                    },
                );
                self.ring.push_back(instance_id);
                true
            }
        }
    }

    /// Takes the next ready step and marks its instance in flight.
    pub fn pop_ready(&mut self, now: Instant) -> Option<(WorkflowInstanceId, StepTrigger)> {
        for _ in 0..self.ring.len() {
            let instance_id = self.ring.pop_front()?;
            let ready = self
                .pending
                .get(&instance_id)
                .is_some_and(|p| p.not_before <= now);
            if ready {
                let pending = self.pending.remove(&instance_id)?;
                self.in_flight.insert(instance_id);
                return Some((instance_id, pending.trigger));
            }
            self.ring.push_back(instance_id);
        }
        None
    }

    /// Marks a step finished. Returns the trigger that arrived while it
    /// was running, which the caller should queue again.
    pub fn complete(&mut self, instance_id: WorkflowInstanceId) -> Option<StepTrigger> {
        self.in_flight.remove(&instance_id);
        self.dirty.remove(&instance_id)
    }

    /// The earliest time a pending step becomes ready.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.not_before).min()
    }

    /// True if the instance is queued or parked.
    #[must_use]
    pub fn contains(&self, instance_id: WorkflowInstanceId) -> bool {
        self.pending.contains_key(&instance_id)
    }

    /// True while a step for the instance is running.
    #[must_use]
    pub fn is_in_flight(&self, instance_id: WorkflowInstanceId) -> bool {
        self.in_flight.contains(&instance_id)
    }

    /// Number of queued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of instances with a step running.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}
