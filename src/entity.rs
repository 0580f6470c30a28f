// SPDX-License-Identifier: MPL-2.0

//! Schedulable entities.
//!
//! An entity is one node of the scheduling hierarchy: either a leaf queue
//! (the pending I/O of one producer) or a group owning a nested scheduler.
//! Entities are arena slots; the red-black linkage, the virtual timestamps
//! and the budget all live inline, while the queue/group payload is reached
//! through a typed handle.

use crate::{
    arena::{define_handle, Arena},
    prelude::*,
    request::IoClass,
    service_tree::RbNode,
};

define_handle!(
    /// Handle of an [`Entity`] in the entity arena.
    pub(crate) struct EntityId
);

define_handle!(
    /// Handle of a producer queue in the queue arena.
    pub(crate) struct QueueId
);

define_handle!(
    /// Handle of a scheduling group.
    ///
    /// Groups are created by the host to mirror its resource-control
    /// hierarchy; every producer queue is attached to exactly one group.
    pub struct GroupId
);

/// Which service tree of the parent scheduler currently links the entity.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum TreeKind {
    Active,
    Idle,
}

/// What an entity stands for.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum EntityPayload {
    Queue(QueueId),
    Group(GroupId),
}

#[derive(Debug)]
pub(crate) struct Entity {
    /// Red-black linkage within the parent's service tree.
    pub rb: RbNode,
    /// The tree (if any) currently holding this entity.
    pub on_tree: Option<TreeKind>,
    /// Smallest virtual start time in this node's subtree.
    pub min_start: u64,
    /// Virtual start time of the current activation.
    pub start: u64,
    /// Virtual finish time: `start + budget / weight`.
    pub finish: u64,
    /// Effective weight currently accounted in the tree's weight sum; equals
    /// `orig_weight` times the queue's raising coefficient.
    pub weight: u64,
    /// Base weight, without raising.
    pub orig_weight: u64,
    /// Pending base weight; applied on the next (re)insertion so that an
    /// in-service entity is never re-keyed.
    pub new_weight: u64,
    /// Set when `new_weight` or the raising coefficient changed and the
    /// effective weight must be recomputed before the next insertion.
    pub prio_changed: bool,
    /// Service allowance of the current activation, in sectors.
    pub budget: u64,
    /// Service received in the current activation, in sectors.
    pub service: u64,
    /// Whether the entity is anywhere in the tree system (active tree, idle
    /// tree, or off-tree while in service). Its weight stays in `wsum`
    /// exactly while this is set.
    pub on_st: bool,
    /// Priority class, selecting the service tree within the parent.
    pub class: IoClass,
    /// The group whose scheduler queues this entity; `None` only for the
    /// root group's own entity, which is never scheduled.
    pub parent_group: Option<GroupId>,
    pub payload: EntityPayload,
    /// The weight under which this entity is currently counted in the
    /// weight-counter tree, if any.
    pub weight_counter: Option<u64>,
}

impl Entity {
    pub(crate) fn new(
        payload: EntityPayload,
        class: IoClass,
        weight: u32,
        parent_group: Option<GroupId>,
    ) -> Self {
        Self {
            rb: RbNode::detached(),
            on_tree: None,
            min_start: 0,
            start: 0,
            finish: 0,
            weight: weight as u64,
            orig_weight: weight as u64,
            new_weight: weight as u64,
            prio_changed: false,
            budget: 0,
            service: 0,
            on_st: false,
            class,
            parent_group,
            payload,
            weight_counter: None,
        }
    }

    pub(crate) fn budget_left(&self) -> u64 {
        self.budget.saturating_sub(self.service)
    }

    pub(crate) fn as_queue(&self) -> Option<QueueId> {
        match self.payload {
            EntityPayload::Queue(queue) => Some(queue),
            EntityPayload::Group(_) => None,
        }
    }

    pub(crate) fn as_group(&self) -> Option<GroupId> {
        match self.payload {
            EntityPayload::Group(group) => Some(group),
            EntityPayload::Queue(_) => None,
        }
    }
}

pub(crate) type EntityArena = Arena<Entity, EntityId>;

/// Reference-counted multisets of the distinct weights currently active,
/// one for queues and one for groups.
///
/// These exist for a single question: does every active entity carry the
/// same weight? When they do (and no group has more than one active child),
/// fairness holds without device idling and the idle window can be skipped.
#[derive(Debug, Default)]
pub(crate) struct WeightCounters {
    queue_weights: BTreeMap<u64, u32>,
    group_weights: BTreeMap<u64, u32>,
}

impl WeightCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts counting `entity` under its current effective weight.
    ///
    /// Idempotent: an entity that is already counted is left untouched, no
    /// matter how many activation paths re-invoke this.
    pub fn add(&mut self, arena: &mut EntityArena, id: EntityId) {
        let entity = arena.get(id);
        if entity.weight_counter.is_some() {
            return;
        }
        let weight = entity.weight;
        let tree = match entity.payload {
            EntityPayload::Queue(_) => &mut self.queue_weights,
            EntityPayload::Group(_) => &mut self.group_weights,
        };
        *tree.entry(weight).or_insert(0) += 1;
        arena.get_mut(id).weight_counter = Some(weight);
    }

    /// Stops counting `entity`; drops the weight node on its last reference.
    pub fn remove(&mut self, arena: &mut EntityArena, id: EntityId) {
        let entity = arena.get(id);
        let Some(weight) = entity.weight_counter else {
            return;
        };
        let tree = match entity.payload {
            EntityPayload::Queue(_) => &mut self.queue_weights,
            EntityPayload::Group(_) => &mut self.group_weights,
        };
        let counter = tree.get_mut(&weight).expect("weight node missing");
        assert!(*counter > 0);
        *counter -= 1;
        if *counter == 0 {
            tree.remove(&weight);
        }
        arena.get_mut(id).weight_counter = None;
    }

    /// Whether active queues or active groups span more than one weight.
    pub fn differentiated(&self) -> bool {
        self.queue_weights.len() > 1 || self.group_weights.len() > 1
    }

    #[cfg(test)]
    pub fn distinct_queue_weights(&self) -> usize {
        self.queue_weights.len()
    }
}
