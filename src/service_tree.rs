// SPDX-License-Identifier: MPL-2.0

//! Service trees: the per-class red-black trees that order schedulable
//! entities by virtual finish time.
//!
//! Each scheduler level keeps one [`ServiceTree`] per priority class. The
//! *active* tree holds backlogged entities keyed by their virtual finish
//! time, augmented so that every node also records the minimum virtual start
//! time found in its subtree. The augmentation is what makes the fair-queueing
//! selection rule cheap: the tree can be pruned to the subtrees that contain
//! at least one *eligible* entity (start not after the tree's virtual time)
//! and the leftmost such entity is the one with the smallest finish time.
//! The *idle* tree holds entities that recently emptied, so that a quick
//! reactivation can resume from the old finish time instead of re-baselining.
//!
//! Nodes are arena slots; all links are [`EntityId`] handles. An entity is on
//! at most one tree at any moment, so the link fields live directly in
//! [`Entity`].

use crate::{
    arena::Arena,
    entity::{Entity, EntityId, TreeKind},
};

/// Fixed-point shift of the virtual-time domain: one sector of service at
/// weight 1 advances a virtual clock by `1 << WFQ_SERVICE_SHIFT`.
///
/// With 64-bit virtual times this leaves room for 2^42 sectors (2 PiB) of
/// cumulative service per service tree before the clock wraps; comparisons
/// are wrapping, so even the wrap is harmless as long as concurrently live
/// timestamps stay within half the range of each other.
pub(crate) const WFQ_SERVICE_SHIFT: u32 = 22;

static_assertions::const_assert!(WFQ_SERVICE_SHIFT < 32);

/// Virtual-time advance produced by `service` sectors at the given weight.
pub(crate) fn vt_delta(service: u64, weight: u64) -> u64 {
    debug_assert!(weight > 0);
    (service << WFQ_SERVICE_SHIFT) / weight
}

/// Wrapping "strictly later" comparison on the virtual-time domain.
pub(crate) fn vt_after(a: u64, b: u64) -> bool {
    (b.wrapping_sub(a) as i64) < 0
}

/// Wrapping max on the virtual-time domain.
pub(crate) fn vt_max(a: u64, b: u64) -> u64 {
    if vt_after(a, b) {
        a
    } else {
        b
    }
}

/// Red-black linkage of one entity. All handles point into the entity arena.
#[derive(Copy, Clone, Debug)]
pub(crate) struct RbNode {
    pub parent: Option<EntityId>,
    pub left: Option<EntityId>,
    pub right: Option<EntityId>,
    pub red: bool,
}

impl RbNode {
    pub(crate) const fn detached() -> Self {
        Self {
            parent: None,
            left: None,
            right: None,
            red: false,
        }
    }
}

/// The root of one red-black tree.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct RbRoot {
    pub node: Option<EntityId>,
}

impl RbRoot {
    pub(crate) fn is_empty(&self) -> bool {
        self.node.is_none()
    }
}

type EntityArena = Arena<Entity, EntityId>;

fn is_red(arena: &EntityArena, id: Option<EntityId>) -> bool {
    id.map_or(false, |id| arena.get(id).rb.red)
}

/// Recomputes `min_start` of one node from its own start and its children.
/// Exact as long as the children's `min_start` values are themselves exact.
fn recompute_min_start(arena: &mut EntityArena, id: EntityId) {
    let node = arena.get(id);
    let mut min_start = node.start;
    if let Some(left) = node.rb.left {
        let left_min = arena.get(left).min_start;
        if vt_after(min_start, left_min) {
            min_start = left_min;
        }
    }
    if let Some(right) = arena.get(id).rb.right {
        let right_min = arena.get(right).min_start;
        if vt_after(min_start, right_min) {
            min_start = right_min;
        }
    }
    arena.get_mut(id).min_start = min_start;
}

/// Recomputes `min_start` from `from` up to the root. Every structural
/// change ends with this walk, so ancestors of the change always see fresh
/// subtree minima.
fn update_min_start_upward(arena: &mut EntityArena, mut from: Option<EntityId>) {
    while let Some(id) = from {
        recompute_min_start(arena, id);
        from = arena.get(id).rb.parent;
    }
}

fn rotate_left(arena: &mut EntityArena, root: &mut RbRoot, x: EntityId) {
    let y = arena.get(x).rb.right.expect("rotate_left without right child");
    let y_left = arena.get(y).rb.left;
    arena.get_mut(x).rb.right = y_left;
    if let Some(y_left) = y_left {
        arena.get_mut(y_left).rb.parent = Some(x);
    }
    let x_parent = arena.get(x).rb.parent;
    arena.get_mut(y).rb.parent = x_parent;
    match x_parent {
        None => root.node = Some(y),
        Some(p) => {
            if arena.get(p).rb.left == Some(x) {
                arena.get_mut(p).rb.left = Some(y);
            } else {
                arena.get_mut(p).rb.right = Some(y);
            }
        }
    }
    arena.get_mut(y).rb.left = Some(x);
    arena.get_mut(x).rb.parent = Some(y);
    // x is now below y; fix the pair bottom-up.
    recompute_min_start(arena, x);
    recompute_min_start(arena, y);
}

fn rotate_right(arena: &mut EntityArena, root: &mut RbRoot, x: EntityId) {
    let y = arena.get(x).rb.left.expect("rotate_right without left child");
    let y_right = arena.get(y).rb.right;
    arena.get_mut(x).rb.left = y_right;
    if let Some(y_right) = y_right {
        arena.get_mut(y_right).rb.parent = Some(x);
    }
    let x_parent = arena.get(x).rb.parent;
    arena.get_mut(y).rb.parent = x_parent;
    match x_parent {
        None => root.node = Some(y),
        Some(p) => {
            if arena.get(p).rb.left == Some(x) {
                arena.get_mut(p).rb.left = Some(y);
            } else {
                arena.get_mut(p).rb.right = Some(y);
            }
        }
    }
    arena.get_mut(y).rb.right = Some(x);
    arena.get_mut(x).rb.parent = Some(y);
    recompute_min_start(arena, x);
    recompute_min_start(arena, y);
}

/// Inserts `id` keyed by its virtual finish time. Duplicate keys go right,
/// so entities with equal finish are served in insertion order.
pub(crate) fn rb_insert(arena: &mut EntityArena, root: &mut RbRoot, id: EntityId) {
    let finish = arena.get(id).finish;
    let mut parent = None;
    let mut go_left = false;
    let mut cursor = root.node;
    while let Some(cur) = cursor {
        parent = Some(cur);
        go_left = vt_after(arena.get(cur).finish, finish);
        cursor = if go_left {
            arena.get(cur).rb.left
        } else {
            arena.get(cur).rb.right
        };
    }

    {
        let entity = arena.get_mut(id);
        entity.rb = RbNode {
            parent,
            left: None,
            right: None,
            red: true,
        };
        entity.min_start = entity.start;
    }
    match parent {
        None => root.node = Some(id),
        Some(p) => {
            if go_left {
                arena.get_mut(p).rb.left = Some(id);
            } else {
                arena.get_mut(p).rb.right = Some(id);
            }
        }
    }

    insert_fixup(arena, root, id);
    update_min_start_upward(arena, Some(id));
}

fn insert_fixup(arena: &mut EntityArena, root: &mut RbRoot, mut z: EntityId) {
    loop {
        let Some(p) = arena.get(z).rb.parent else {
            break;
        };
        if !arena.get(p).rb.red {
            break;
        }
        // A red parent is never the root, so the grandparent exists.
        let g = arena.get(p).rb.parent.expect("red root");
        let p_is_left = arena.get(g).rb.left == Some(p);
        let uncle = if p_is_left {
            arena.get(g).rb.right
        } else {
            arena.get(g).rb.left
        };

        if is_red(arena, uncle) {
            arena.get_mut(p).rb.red = false;
            arena.get_mut(uncle.unwrap()).rb.red = false;
            arena.get_mut(g).rb.red = true;
            z = g;
            continue;
        }

        if p_is_left {
            if arena.get(p).rb.right == Some(z) {
                z = p;
                rotate_left(arena, root, z);
            }
            let p = arena.get(z).rb.parent.unwrap();
            let g = arena.get(p).rb.parent.unwrap();
            arena.get_mut(p).rb.red = false;
            arena.get_mut(g).rb.red = true;
            rotate_right(arena, root, g);
        } else {
            if arena.get(p).rb.left == Some(z) {
                z = p;
                rotate_right(arena, root, z);
            }
            let p = arena.get(z).rb.parent.unwrap();
            let g = arena.get(p).rb.parent.unwrap();
            arena.get_mut(p).rb.red = false;
            arena.get_mut(g).rb.red = true;
            rotate_left(arena, root, g);
        }
    }
    let r = root.node.expect("fixup on empty tree");
    arena.get_mut(r).rb.red = false;
}

/// Replaces the subtree rooted at `u` with the subtree rooted at `v`.
fn transplant(
    arena: &mut EntityArena,
    root: &mut RbRoot,
    u: EntityId,
    v: Option<EntityId>,
) {
    let u_parent = arena.get(u).rb.parent;
    match u_parent {
        None => root.node = v,
        Some(p) => {
            if arena.get(p).rb.left == Some(u) {
                arena.get_mut(p).rb.left = v;
            } else {
                arena.get_mut(p).rb.right = v;
            }
        }
    }
    if let Some(v) = v {
        arena.get_mut(v).rb.parent = u_parent;
    }
}

fn subtree_min(arena: &EntityArena, mut id: EntityId) -> EntityId {
    while let Some(left) = arena.get(id).rb.left {
        id = left;
    }
    id
}

fn subtree_max(arena: &EntityArena, mut id: EntityId) -> EntityId {
    while let Some(right) = arena.get(id).rb.right {
        id = right;
    }
    id
}

/// Leftmost (smallest finish) node of the tree.
pub(crate) fn rb_first(arena: &EntityArena, root: &RbRoot) -> Option<EntityId> {
    root.node.map(|id| subtree_min(arena, id))
}

/// In-order successor.
pub(crate) fn rb_next(arena: &EntityArena, id: EntityId) -> Option<EntityId> {
    if let Some(right) = arena.get(id).rb.right {
        return Some(subtree_min(arena, right));
    }
    let mut child = id;
    let mut parent = arena.get(id).rb.parent;
    while let Some(p) = parent {
        if arena.get(p).rb.left == Some(child) {
            return Some(p);
        }
        child = p;
        parent = arena.get(p).rb.parent;
    }
    None
}

/// In-order predecessor.
pub(crate) fn rb_prev(arena: &EntityArena, id: EntityId) -> Option<EntityId> {
    if let Some(left) = arena.get(id).rb.left {
        return Some(subtree_max(arena, left));
    }
    let mut child = id;
    let mut parent = arena.get(id).rb.parent;
    while let Some(p) = parent {
        if arena.get(p).rb.right == Some(child) {
            return Some(p);
        }
        child = p;
        parent = arena.get(p).rb.parent;
    }
    None
}

/// Removes `z` from the tree, rebalancing and refreshing the augmentation.
pub(crate) fn rb_remove(arena: &mut EntityArena, root: &mut RbRoot, z: EntityId) {
    let z_left = arena.get(z).rb.left;
    let z_right = arena.get(z).rb.right;

    let removed_red;
    let x: Option<EntityId>;
    let x_parent: Option<EntityId>;

    if z_left.is_none() {
        removed_red = arena.get(z).rb.red;
        x = z_right;
        x_parent = arena.get(z).rb.parent;
        transplant(arena, root, z, z_right);
    } else if z_right.is_none() {
        removed_red = arena.get(z).rb.red;
        x = z_left;
        x_parent = arena.get(z).rb.parent;
        transplant(arena, root, z, z_left);
    } else {
        // Two children: splice the in-order successor into z's position.
        // The successor is relinked, not copied, because handles are the
        // identity of the nodes.
        let y = subtree_min(arena, z_right.unwrap());
        removed_red = arena.get(y).rb.red;
        x = arena.get(y).rb.right;
        if arena.get(y).rb.parent == Some(z) {
            x_parent = Some(y);
        } else {
            x_parent = arena.get(y).rb.parent;
            transplant(arena, root, y, x);
            let z_right = arena.get(z).rb.right;
            arena.get_mut(y).rb.right = z_right;
            arena.get_mut(z_right.unwrap()).rb.parent = Some(y);
        }
        transplant(arena, root, z, Some(y));
        let z_left = arena.get(z).rb.left;
        arena.get_mut(y).rb.left = z_left;
        arena.get_mut(z_left.unwrap()).rb.parent = Some(y);
        let z_red = arena.get(z).rb.red;
        arena.get_mut(y).rb.red = z_red;
        recompute_min_start(arena, y);
    }

    arena.get_mut(z).rb = RbNode::detached();

    if !removed_red {
        remove_fixup(arena, root, x, x_parent);
    }
    update_min_start_upward(arena, x_parent);
}

fn remove_fixup(
    arena: &mut EntityArena,
    root: &mut RbRoot,
    mut x: Option<EntityId>,
    mut parent: Option<EntityId>,
) {
    loop {
        let Some(p) = parent else {
            break;
        };
        if x.is_some() && x == root.node {
            break;
        }
        if is_red(arena, x) {
            break;
        }

        let x_is_left = arena.get(p).rb.left == x;
        if x_is_left {
            let mut w = arena.get(p).rb.right.expect("missing sibling");
            if arena.get(w).rb.red {
                arena.get_mut(w).rb.red = false;
                arena.get_mut(p).rb.red = true;
                rotate_left(arena, root, p);
                w = arena.get(p).rb.right.expect("missing sibling");
            }
            let w_left = arena.get(w).rb.left;
            let w_right = arena.get(w).rb.right;
            if !is_red(arena, w_left) && !is_red(arena, w_right) {
                arena.get_mut(w).rb.red = true;
                x = Some(p);
                parent = arena.get(p).rb.parent;
            } else {
                if !is_red(arena, w_right) {
                    let w_left = w_left.unwrap();
                    arena.get_mut(w_left).rb.red = false;
                    arena.get_mut(w).rb.red = true;
                    rotate_right(arena, root, w);
                    w = arena.get(p).rb.right.unwrap();
                }
                let p_red = arena.get(p).rb.red;
                arena.get_mut(w).rb.red = p_red;
                arena.get_mut(p).rb.red = false;
                if let Some(w_right) = arena.get(w).rb.right {
                    arena.get_mut(w_right).rb.red = false;
                }
                rotate_left(arena, root, p);
                x = root.node;
                parent = None;
            }
        } else {
            let mut w = arena.get(p).rb.left.expect("missing sibling");
            if arena.get(w).rb.red {
                arena.get_mut(w).rb.red = false;
                arena.get_mut(p).rb.red = true;
                rotate_right(arena, root, p);
                w = arena.get(p).rb.left.expect("missing sibling");
            }
            let w_left = arena.get(w).rb.left;
            let w_right = arena.get(w).rb.right;
            if !is_red(arena, w_left) && !is_red(arena, w_right) {
                arena.get_mut(w).rb.red = true;
                x = Some(p);
                parent = arena.get(p).rb.parent;
            } else {
                if !is_red(arena, w_left) {
                    let w_right = w_right.unwrap();
                    arena.get_mut(w_right).rb.red = false;
                    arena.get_mut(w).rb.red = true;
                    rotate_left(arena, root, w);
                    w = arena.get(p).rb.left.unwrap();
                }
                let p_red = arena.get(p).rb.red;
                arena.get_mut(w).rb.red = p_red;
                arena.get_mut(p).rb.red = false;
                if let Some(w_left) = arena.get(w).rb.left {
                    arena.get_mut(w_left).rb.red = false;
                }
                rotate_right(arena, root, p);
                x = root.node;
                parent = None;
            }
        }
    }
    if let Some(x) = x {
        arena.get_mut(x).rb.red = false;
    }
}

/// One priority class of one scheduler level.
#[derive(Debug, Default)]
pub(crate) struct ServiceTree {
    pub active: RbRoot,
    pub idle: RbRoot,
    pub first_idle: Option<EntityId>,
    pub last_idle: Option<EntityId>,
    /// The virtual clock of this tree, advanced by delivered service divided
    /// by the sum of on-tree weights.
    pub vtime: u64,
    /// Sum of the weights of every on-tree entity, including idle ones that
    /// have not been forgotten yet.
    pub wsum: u64,
}

impl ServiceTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_insert(&mut self, arena: &mut EntityArena, id: EntityId) {
        debug_assert!(arena.get(id).on_tree.is_none());
        rb_insert(arena, &mut self.active, id);
        arena.get_mut(id).on_tree = Some(TreeKind::Active);
    }

    pub fn active_extract(&mut self, arena: &mut EntityArena, id: EntityId) {
        assert_eq!(arena.get(id).on_tree, Some(TreeKind::Active));
        rb_remove(arena, &mut self.active, id);
        arena.get_mut(id).on_tree = None;
    }

    pub fn idle_insert(&mut self, arena: &mut EntityArena, id: EntityId) {
        debug_assert!(arena.get(id).on_tree.is_none());
        let finish = arena.get(id).finish;
        if self
            .first_idle
            .map_or(true, |first| vt_after(arena.get(first).finish, finish))
        {
            self.first_idle = Some(id);
        }
        if self
            .last_idle
            .map_or(true, |last| vt_after(finish, arena.get(last).finish))
        {
            self.last_idle = Some(id);
        }
        rb_insert(arena, &mut self.idle, id);
        arena.get_mut(id).on_tree = Some(TreeKind::Idle);
    }

    pub fn idle_extract(&mut self, arena: &mut EntityArena, id: EntityId) {
        assert_eq!(arena.get(id).on_tree, Some(TreeKind::Idle));
        if self.first_idle == Some(id) {
            self.first_idle = rb_next(arena, id);
        }
        if self.last_idle == Some(id) {
            self.last_idle = rb_prev(arena, id);
        }
        rb_remove(arena, &mut self.idle, id);
        arena.get_mut(id).on_tree = None;
    }

    /// Jumps the virtual clock forward when nothing on the active tree is
    /// eligible, so that the next lookup always finds a winner.
    pub fn update_vtime(&mut self, arena: &EntityArena) {
        if let Some(rootid) = self.active.node {
            let min_start = arena.get(rootid).min_start;
            if vt_after(min_start, self.vtime) {
                self.vtime = min_start;
            }
        }
    }

    /// The eligible entity with the smallest virtual finish time.
    ///
    /// Walks down preferring the left subtree whenever its `min_start`
    /// proves it holds an eligible entity; the last eligible node seen on
    /// the way down is the answer. Callers must have called
    /// [`Self::update_vtime`] first, which guarantees an eligible entity
    /// exists in a non-empty tree.
    pub fn first_active(&self, arena: &EntityArena) -> Option<EntityId> {
        let mut node = self.active.node;
        let mut first = None;
        while let Some(id) = node {
            let entity = arena.get(id);
            if !vt_after(entity.start, self.vtime) {
                first = Some(id);
            }
            if let Some(left) = entity.rb.left {
                if !vt_after(arena.get(left).min_start, self.vtime) {
                    node = Some(left);
                    continue;
                }
            }
            if first.is_some() {
                break;
            }
            node = entity.rb.right;
        }
        first
    }
}
