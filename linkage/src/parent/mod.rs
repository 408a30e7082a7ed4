//! Parent side of the linkage.
//!
//! A [`ParentNode`] owns an array of [`ChildSlot`]s, one per in-node
//! position, plus the bookkeeping that lets a pending node resolve children
//! it has not copied yet.
//!
//! # Invariants
//!
//! 1. Stable nodes:
//!    - children point at this node through its tracker
//!    - no prior instance
//!    - the array holds the live stable children; resolution is direct
//!    - `copy_sources` is empty
//! 2. Mutation-pending nodes:
//!    - no parent of their own until commit
//!    - the prior instance is the stable version
//!    - the array only holds children created in this transaction; anything
//!      else resolves through the prior instance, and is copied over on
//!      commit
//!    - `copy_sources` is empty
//! 3. Initial-pending nodes:
//!    - the parent is a pending node of the same transaction
//!    - no prior instance, or the rewritten stable node
//!    - the array only holds children created in this transaction; anything
//!      else resolves through the `copy_sources` entry covering the key, and
//!      is copied over on commit
//!    - `copy_sources` holds the stable nodes of the same level whose range
//!      overlaps this node (just the prior instance for a rewrite)
//! 4. Exist-clean and exist-mutation-pending nodes follow 3, but are never
//!    rewrites.
//!
//! A stable node's copy destinations mirror the copy sources: for every
//! transaction, the pending nodes listing it as a copy source.

mod commit;
mod copy;
mod surgery;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::child::{BaseChild, ChildNode, ChildPos, ChildSlot, GetChild, downcast_child};
use crate::config::LinkageConfig;
use crate::extent::TreeExtent;
use crate::lock;
use crate::retriever::{ExtentTransViewRetriever, get_viewable_as};
use crate::tracker::ParentTracker;
use crate::transaction::{TransId, Transaction};

/// Link state embedded in every parent node version.
pub struct ParentLinks<P: ParentNode> {
    /// One slot per position; `len()` is the array capacity.
    pub(crate) children: Vec<ChildSlot<P>>,
    /// Stable nodes this pending node still resolves through, by begin key.
    pub(crate) copy_sources: BTreeMap<P::Key, Arc<P>>,
    /// Per transaction, the pending nodes using this stable node as a copy
    /// source, by begin key. Entries are dropped when the transaction ends.
    pub(crate) copy_dests_by_trans: BTreeMap<TransId, BTreeMap<P::Key, Arc<P>>>,
    /// The tracker this node's children share, while any child holds it.
    pub(crate) my_tracker: Option<Weak<ParentTracker<P>>>,
    pub(crate) config: LinkageConfig,
}

impl<P: ParentNode> ParentLinks<P> {
    /// Empty link state with room for `capacity` children.
    #[must_use]
    pub fn new(capacity: usize, config: LinkageConfig) -> Self {
        Self {
            children: vec![ChildSlot::Empty; capacity],
            copy_sources: BTreeMap::new(),
            copy_dests_by_trans: BTreeMap::new(),
            my_tracker: None,
            config,
        }
    }

    /// Link state for a new version of the same node: same capacity,
    /// nothing linked.
    #[must_use]
    pub fn fresh_like(&self) -> Self {
        Self::new(self.children.len(), self.config)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.children.len()
    }

    #[must_use]
    pub const fn config(&self) -> &LinkageConfig {
        &self.config
    }

    pub(crate) fn tracker(&self) -> Option<Arc<ParentTracker<P>>> {
        self.my_tracker.as_ref().and_then(Weak::upgrade)
    }

    /// Checks liveness without upgrading: a temporary strong reference
    /// released under this lock could run the tracker's drop and deadlock.
    pub(crate) fn has_tracker(&self) -> bool {
        self.my_tracker
            .as_ref()
            .is_some_and(|tracker| tracker.strong_count() > 0)
    }

    /// Point `child` at this node's tracker, creating it on first use.
    ///
    /// Returns the child's previous tracker; drop it only once this link
    /// state is unlocked.
    pub(crate) fn set_child_ptracker(
        &mut self,
        me: &Arc<P>,
        child: &dyn BaseChild<P>,
    ) -> Option<Arc<ParentTracker<P>>> {
        let tracker = if let Some(tracker) = self.tracker() {
            tracker
        } else {
            let tracker = ParentTracker::new(Arc::clone(me));
            tracing::trace!("new parent tracker {tracker}");
            self.my_tracker = Some(Arc::downgrade(&tracker));
            tracker
        };
        child.reset_parent_tracker(Some(tracker))
    }

    pub(crate) fn maybe_expand_children(&mut self, size: usize) {
        if P::CHILD_VEC_UNIT == 0 {
            assert!(
                size <= self.children.len(),
                "fixed child array of capacity {} cannot hold {size} children",
                self.children.len()
            );
        } else if size > self.children.len() {
            self.children
                .resize(size.next_multiple_of(P::CHILD_VEC_UNIT), ChildSlot::Empty);
        }
    }

    pub(crate) fn maybe_shrink_children(&mut self, size: usize) {
        if P::CHILD_VEC_UNIT == 0 {
            return;
        }
        let capacity = self.children.len();
        if capacity > P::CHILD_VEC_UNIT && size < capacity / self.config.shrink_divisor {
            self.children
                .truncate(size.next_multiple_of(P::CHILD_VEC_UNIT).max(P::CHILD_VEC_UNIT));
            self.children.shrink_to_fit();
        }
    }
}

impl<P: ParentNode> fmt::Debug for ParentLinks<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParentLinks")
            .field("capacity", &self.children.len())
            .field("copy_sources", &self.copy_sources.keys().collect::<Vec<_>>())
            .field(
                "copy_dests_by_trans",
                &self.copy_dests_by_trans.keys().collect::<Vec<_>>(),
            )
            .field("has_tracker", &self.has_tracker())
            .finish_non_exhaustive()
    }
}

/// Index of the first position for which `pred` is false.
fn partition_point(len: usize, pred: impl Fn(usize) -> bool) -> usize {
    let (mut lo, mut hi) = (0, len);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if pred(mid) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Tree nodes that have children.
///
/// Leaf nodes whose entries point at logical extents are parents too.
/// Implementors supply the node geometry (size, keys, range) and storage for
/// [`ParentLinks`]; everything else is provided.
pub trait ParentNode: TreeExtent {
    /// Growth unit of the child array. Zero means the capacity is fixed at
    /// construction and must never be exceeded.
    const CHILD_VEC_UNIT: usize = 0;

    fn links(&self) -> &Mutex<ParentLinks<Self>>;

    /// Number of entries in the node.
    fn size(&self) -> usize;

    /// Key of the entry at `pos`.
    fn key_at(&self, pos: usize) -> Self::Key;

    /// The mutation-pending copy of this stable node held by `trans_id`.
    fn mutation_pending_version(&self, trans_id: TransId) -> Option<Arc<Self>>;

    /// Position a split divides this node at.
    fn split_pivot(&self) -> usize {
        self.size() / 2
    }

    /// First position whose key is not less than `key`.
    fn lower_bound(&self, key: Self::Key) -> usize {
        partition_point(self.size(), |pos| self.key_at(pos) < key)
    }

    /// First position whose key is greater than `key`.
    fn upper_bound(&self, key: Self::Key) -> usize {
        partition_point(self.size(), |pos| self.key_at(pos) <= key)
    }

    /// Copy of the slot at `pos`; empty past the end of the child array.
    fn slot(&self, pos: usize) -> ChildSlot<Self> {
        lock(self.links())
            .children
            .get(pos)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether some child currently holds this node's tracker.
    fn has_tracker(&self) -> bool {
        lock(self.links()).has_tracker()
    }

    /// Current copy sources, in key order.
    fn copy_sources(&self) -> Vec<Arc<Self>> {
        lock(self.links()).copy_sources.values().cloned().collect()
    }

    /// Pending nodes of `trans_id` registered against this stable node.
    fn copy_dests(&self, trans_id: TransId) -> Vec<Arc<Self>> {
        lock(self.links())
            .copy_dests_by_trans
            .get(&trans_id)
            .map(|dests| dests.values().cloned().collect())
            .unwrap_or_default()
    }

    /// The version of this node visible to `t`.
    ///
    /// Returns `(true, self)` when this version is visible; otherwise the
    /// pending version of `t` covering `key`, found through this node's
    /// mutation-pending copy or its copy destinations.
    fn resolve_transaction(self: &Arc<Self>, t: &Transaction, key: Self::Key) -> (bool, Arc<Self>) {
        assert!(self.is_valid(), "resolving through an invalid node");
        let (viewable, state) = self.is_viewable_by_trans(t);
        if viewable {
            return (true, Arc::clone(self));
        }
        (false, copy::find_pending_version(self, t, key, state))
    }

    /// Resolve the child at `pos` (holding `key`) for `t`.
    ///
    /// Prefers the local slot, then the stable node this pending node
    /// derives from. When neither holds a loaded child, returns the stable
    /// slot the child will be linked into.
    fn get_child<'a, C: ChildNode<Self>>(
        self: &Arc<Self>,
        t: &'a Transaction,
        etvr: &'a dyn ExtentTransViewRetriever,
        pos: usize,
        key: Self::Key,
    ) -> GetChild<'a, Self, C> {
        debug_assert_eq!(key, self.key_at(pos));
        let slot = {
            let links = lock(self.links());
            assert!(!links.children.is_empty(), "node has no child array");
            links.children[pos].clone()
        };
        assert!(!slot.is_reserved(), "resolving a reserved slot at {pos}");
        if let Some(child) = slot.child() {
            return GetChild::Child(get_viewable_as(etvr, t, downcast_child::<Self, C>(child)));
        }
        if !self.is_pending() {
            return GetChild::Pos(ChildPos::new(Arc::clone(self), pos));
        }

        let Some((sparent, spos)) = self.find_stable_slot(key) else {
            // Created in this transaction and gone since: relink it here.
            return GetChild::Pos(ChildPos::new(Arc::clone(self), pos));
        };
        match sparent.slot(spos).child() {
            Some(child) => {
                GetChild::Child(get_viewable_as(etvr, t, downcast_child::<Self, C>(child)))
            }
            None => GetChild::Pos(ChildPos::new(sparent, spos)),
        }
    }

    /// Attach a stable child to an empty slot of this stable node.
    fn link_child<C: ChildNode<Self>>(self: &Arc<Self>, child: &Arc<C>, pos: usize) {
        assert!(pos < self.size(), "position {pos} out of range");
        assert!(self.is_stable(), "linking a child into a pending node");
        assert!(child.is_stable(), "linking a pending child");
        {
            let links = lock(self.links());
            assert!(pos < links.children.len());
            assert!(links.children[pos].is_empty(), "slot {pos} is already linked");
        }
        self.update_child_ptr(pos, ChildSlot::from_child(child));
    }

    /// Insert a slot at `offset`, shifting later slots right.
    ///
    /// `size` is the node's entry count before the insert; `None` reads it
    /// from the node.
    fn insert_child_ptr(self: &Arc<Self>, offset: usize, child: ChildSlot<Self>, size: Option<usize>) {
        assert!(!matches!(child, ChildSlot::Empty), "inserting an empty slot");
        let size = size.unwrap_or_else(|| self.size());
        let mut links = lock(self.links());
        links.maybe_expand_children(size + 1);
        assert!(size < links.children.len());
        links.children[offset..=size].rotate_right(1);
        links.children[offset] = child.clone();
        let held = child.child();
        let displaced = held
            .as_ref()
            .and_then(|c| links.set_child_ptracker(self, c.as_ref()));
        drop(links);
        drop(displaced);
        drop(held);
    }

    /// Overwrite the slot at `pos`, pointing a real child at this node.
    fn update_child_ptr(self: &Arc<Self>, pos: usize, child: ChildSlot<Self>) {
        let mut links = lock(self.links());
        links.children[pos] = child.clone();
        let held = child.child();
        let displaced = held
            .as_ref()
            .and_then(|c| links.set_child_ptracker(self, c.as_ref()));
        drop(links);
        drop(displaced);
        drop(held);
    }

    /// Remove the slot at `offset`, shifting later slots left.
    ///
    /// Called while the node still counts the removed entry. The removed
    /// child keeps its tracker until it is invalidated.
    fn remove_child_ptr(&self, offset: usize) {
        let size = self.size();
        let mut links = lock(self.links());
        tracing::trace!(
            "trans.{:?}, pos {}, total size {}, child {:?}",
            self.pending_for_transaction(),
            offset,
            size,
            links.children[offset]
        );
        links.children[offset..size].rotate_left(1);
        links.children[size - 1] = ChildSlot::Empty;
        links.maybe_shrink_children(size);
    }

    /// Overwrite the slot at `pos`, which must currently reference the
    /// object at `expected`. Trackers are left untouched.
    fn replace_child(&self, pos: usize, expected: *const (), child: ChildSlot<Self>) {
        let mut links = lock(self.links());
        assert!(
            links.children[pos].points_to(expected),
            "slot {pos} does not reference the expected child"
        );
        links.children[pos] = child;
    }

    /// Grow the child array to the node's current size.
    fn sync_children_capacity(&self) {
        let size = self.size();
        lock(self.links()).maybe_expand_children(size);
    }

    /// Register `dest`, a pending node of `t`, against this stable node.
    fn add_copy_dest(self: &Arc<Self>, t: &Transaction, dest: &Arc<Self>) {
        copy::add_copy_dest(self, t, dest);
    }

    /// Undo [`ParentNode::add_copy_dest`].
    fn del_copy_dest(&self, trans_id: TransId, dest: &Arc<Self>) {
        copy::del_copy_dest(self, trans_id, dest);
    }

    /// Adopt `foreign` as the single copy source of this rewrite.
    fn on_rewrite(self: &Arc<Self>, t: &Transaction, foreign: &Arc<Self>) {
        copy::on_rewrite(self, t, foreign);
    }

    /// The stable node a pending node resolves `key` through.
    fn get_stable_for_key(&self, key: Self::Key) -> Arc<Self> {
        copy::get_stable_for_key(self, key)
    }

    /// Like [`ParentNode::get_stable_for_key`], also locating `key` there.
    /// `None` if no stable predecessor holds `key`.
    fn find_stable_slot(&self, key: Self::Key) -> Option<(Arc<Self>, usize)> {
        copy::find_stable_slot(self, key)
    }

    /// Make `dest` resolve through whatever `src` resolves through.
    fn push_copy_sources(t: &Transaction, dest: &Arc<Self>, src: &Arc<Self>) {
        copy::push_copy_sources(t, dest, src);
    }

    /// Move this node's child pointers into the halves of a split.
    fn split_child_ptrs(self: &Arc<Self>, t: &Transaction, left: &Arc<Self>, right: &Arc<Self>) {
        surgery::split_child_ptrs(self, t, left, right);
    }

    fn adjust_copy_src_dest_on_split(
        self: &Arc<Self>,
        t: &Transaction,
        left: &Arc<Self>,
        right: &Arc<Self>,
    ) {
        surgery::adjust_copy_src_dest_on_split(self, t, left, right);
    }

    /// Move the child pointers of `left` and `right` into this merged node.
    fn merge_child_ptrs(self: &Arc<Self>, t: &Transaction, left: &Arc<Self>, right: &Arc<Self>) {
        surgery::merge_child_ptrs(self, t, left, right);
    }

    fn adjust_copy_src_dest_on_merge(
        self: &Arc<Self>,
        t: &Transaction,
        left: &Arc<Self>,
        right: &Arc<Self>,
    ) {
        surgery::adjust_copy_src_dest_on_merge(self, t, left, right);
    }

    /// Redistribute the child pointers of `left` and `right` around
    /// `pivot_idx` into two replacement nodes.
    fn balance_child_ptrs(
        t: &Transaction,
        left: &Arc<Self>,
        right: &Arc<Self>,
        pivot_idx: usize,
        replacement_left: &Arc<Self>,
        replacement_right: &Arc<Self>,
    ) {
        surgery::balance_child_ptrs(
            t,
            left,
            right,
            pivot_idx,
            replacement_left,
            replacement_right,
        );
    }

    fn adjust_copy_src_dest_on_balance(
        t: &Transaction,
        left: &Arc<Self>,
        right: &Arc<Self>,
        pivot_idx: usize,
        replacement_left: &Arc<Self>,
        replacement_right: &Arc<Self>,
    ) {
        surgery::adjust_copy_src_dest_on_balance(
            t,
            left,
            right,
            pivot_idx,
            replacement_left,
            replacement_right,
        );
    }

    /// Point every child in the array at this node's tracker.
    fn adjust_ptracker_for_children(self: &Arc<Self>) {
        commit::adjust_ptracker_for_children(self);
    }

    /// Take over the prior instance's tracker, retargeting it here.
    fn set_children_from_prior_instance(self: &Arc<Self>) {
        commit::set_children_from_prior_instance(self);
    }

    /// Copy the prior instance's children into this node's empty slots.
    fn take_children_from_prior_instance(self: &Arc<Self>) {
        commit::take_children_from_prior_instance(self);
    }

    /// Copy children from every overlapping copy source.
    fn take_children_from_stable_sources(self: &Arc<Self>) {
        commit::take_children_from_stable_sources(self);
    }

    /// Merge-walk the copy sources in key order, filling empty slots.
    fn copy_children_from_stable_sources(self: &Arc<Self>) {
        commit::copy_children_from_stable_sources(self);
    }

    /// Merge-walk `source[foreign_start..foreign_end)` against this node
    /// from `local_start`. Returns the local position the walk stopped at.
    fn copy_children_from_stable_source(
        &self,
        source: &Self,
        foreign_start: usize,
        foreign_end: usize,
        local_start: usize,
    ) -> usize {
        commit::copy_children_from_stable_source(self, source, foreign_start, foreign_end, local_start)
    }

    /// Pull child pointers forward before an initial-pending node commits.
    fn prepare_commit(self: &Arc<Self>) {
        commit::prepare_commit(self);
    }

    /// Take the children of the prior instance this committed mutation
    /// replaces.
    fn replace_prior_children(self: &Arc<Self>) {
        commit::replace_prior_children(self);
    }

    /// Whether the child at `pos` is stable (or data-stable) for `t`.
    ///
    /// Reserved and absent children count as stable.
    fn is_child_stable(
        &self,
        t: &Transaction,
        etvr: &dyn ExtentTransViewRetriever,
        pos: usize,
        key: Self::Key,
        data_only: bool,
    ) -> bool {
        commit::is_child_stable(self, t, etvr, pos, key, data_only)
    }
}
