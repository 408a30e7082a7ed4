//! Child side of the linkage.
//!
//! Anything a [`ParentNode`] indexes (inner tree nodes, logical extents under
//! a leaf) is a child. A child knows its parent only through a shared
//! [`ParentTracker`], and a parent knows its children through an array of
//! [`ChildSlot`]s.
//!
//! # Child slots
//!
//! A slot is empty (child not resolved locally), reserved (the position has
//! no child by design, e.g. reserved ranges or indirect mappings), or holds a
//! weak reference to a live child. Reserved slots must never be treated as a
//! child.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::extent::{CachedExtent, TreeExtent};
use crate::lock;
use crate::parent::ParentNode;
use crate::retriever::{CachedExtentRef, ExtentTransViewRetriever, ResolveResult};
use crate::tracker::ParentTracker;
use crate::transaction::Transaction;

/// One position of a parent's child array.
pub enum ChildSlot<P: ParentNode> {
    /// No child resolved at this position.
    Empty,
    /// The position has no child by design.
    Reserved,
    /// A child extent. Reads as empty once the child is gone.
    Present(Weak<dyn BaseChild<P>>),
}

impl<P: ParentNode> ChildSlot<P> {
    /// Slot pointing at `child`.
    #[must_use]
    pub fn from_child<C: ChildNode<P>>(child: &Arc<C>) -> Self {
        let weak: Weak<dyn BaseChild<P>> = Arc::downgrade(child) as Weak<dyn BaseChild<P>>;
        Self::Present(weak)
    }

    #[must_use]
    pub const fn is_reserved(&self) -> bool {
        matches!(self, Self::Reserved)
    }

    /// Empty, or pointing at a child that no longer exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Reserved => false,
            Self::Present(weak) => weak.strong_count() == 0,
        }
    }

    /// The live child in this slot, if any.
    #[must_use]
    pub fn child(&self) -> Option<Arc<dyn BaseChild<P>>> {
        match self {
            Self::Present(weak) => weak.upgrade(),
            Self::Empty | Self::Reserved => None,
        }
    }

    /// Whether the slot references the object at `addr`.
    #[must_use]
    pub fn points_to(&self, addr: *const ()) -> bool {
        match self {
            Self::Present(weak) => std::ptr::eq(weak.as_ptr().cast::<()>(), addr),
            Self::Empty | Self::Reserved => false,
        }
    }
}

impl<P: ParentNode> Clone for ChildSlot<P> {
    fn clone(&self) -> Self {
        match self {
            Self::Empty => Self::Empty,
            Self::Reserved => Self::Reserved,
            Self::Present(weak) => Self::Present(Weak::clone(weak)),
        }
    }
}

impl<P: ParentNode> Default for ChildSlot<P> {
    fn default() -> Self {
        Self::Empty
    }
}

impl<P: ParentNode> fmt::Debug for ChildSlot<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Reserved => f.write_str("Reserved"),
            Self::Present(weak) => write!(f, "Present({:p})", weak.as_ptr().cast::<()>()),
        }
    }
}

/// A child's reference to its parent tracker.
pub struct ChildLink<P: ParentNode> {
    tracker: Mutex<Option<Arc<ParentTracker<P>>>>,
}

impl<P: ParentNode> ChildLink<P> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            tracker: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn get(&self) -> Option<Arc<ParentTracker<P>>> {
        lock(&self.tracker).clone()
    }

    /// Swap in a new tracker, handing back the old one.
    ///
    /// The caller decides where the old tracker is released; see
    /// [`crate::tracker`] for why that matters.
    pub fn replace(&self, tracker: Option<Arc<ParentTracker<P>>>) -> Option<Arc<ParentTracker<P>>> {
        std::mem::replace(&mut *lock(&self.tracker), tracker)
    }
}

impl<P: ParentNode> Default for ChildLink<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: ParentNode> fmt::Debug for ChildLink<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(tracker) => write!(f, "ChildLink({tracker})"),
            None => f.write_str("ChildLink(none)"),
        }
    }
}

/// The capability a parent needs from whatever sits in its child array.
///
/// Implemented for every [`ChildNode`]; parents only ever see children
/// through `dyn BaseChild`.
pub trait BaseChild<P: ParentNode>: Send + Sync {
    fn tracker_link(&self) -> &ChildLink<P>;

    /// The child's first key.
    fn node_begin(&self) -> P::Key;

    fn is_extent_valid(&self) -> bool;

    fn is_extent_stable(&self) -> bool;

    fn as_cached_extent(&self) -> &dyn CachedExtent;

    fn into_cached_extent(self: Arc<Self>) -> CachedExtentRef;

    fn has_parent_tracker(&self) -> bool {
        self.tracker_link().get().is_some()
    }

    /// Install `tracker` (or clear it), returning the displaced one.
    fn reset_parent_tracker(
        &self,
        tracker: Option<Arc<ParentTracker<P>>>,
    ) -> Option<Arc<ParentTracker<P>>> {
        self.tracker_link().replace(tracker)
    }

    /// Tracker present and its parent still valid.
    fn is_parent_valid(&self) -> bool {
        self.tracker_link()
            .get()
            .is_some_and(|tracker| tracker.is_valid())
    }

    fn peek_tracker(&self) -> Option<Arc<ParentTracker<P>>> {
        self.tracker_link().get()
    }

    /// The parent the tracker currently names.
    ///
    /// Only for assertions and logs: the parent may still be under write and
    /// has to be waited on before it is inspected for real
    /// ([`ChildNode::get_parent_node`]).
    fn peek_parent_node(&self) -> Arc<P> {
        let Some(tracker) = self.tracker_link().get() else {
            panic!("child at {:?} has no parent tracker", self.node_begin());
        };
        tracker.get_parent()
    }
}

/// Non-root tree nodes and logical extents that live under a parent node.
pub trait ChildNode<P: ParentNode>: TreeExtent<Key = P::Key> {
    fn child_link(&self) -> &ChildLink<P>;

    fn is_btree_root(&self) -> bool {
        false
    }

    /// Resolve the parent version visible to `t`.
    ///
    /// Waits for the parent to become accessible first. A mutation-pending
    /// child that has no tracker of its own yet resolves through its prior
    /// instance.
    fn get_parent_node<'a>(
        &'a self,
        t: &'a Transaction,
        etvr: &'a dyn ExtentTransViewRetriever,
    ) -> BoxFuture<'a, ResolveResult<Arc<P>>> {
        if self.has_parent_tracker() {
            return resolve_parent(self, t, etvr, self.begin());
        }
        assert!(
            self.is_mutation_pending(),
            "only a mutation-pending child may lack a parent tracker"
        );
        let Some(prior) = self.prior_instance() else {
            panic!("mutation-pending child at {:?} has no prior instance", self.begin());
        };
        async move {
            let key = prior.begin();
            resolve_parent(&*prior, t, etvr, key).await
        }
        .boxed()
    }

    /// Detach from the parent tracker.
    ///
    /// The parent's slot is left alone; [`ChildNode::destroy`] clears it.
    fn on_invalidated(&self) {
        drop(self.reset_parent_tracker(None));
    }

    /// Inherit the prior instance's tracker and take over its parent slot.
    fn take_parent_from_prior(self: &Arc<Self>) {
        assert!(!self.is_btree_root(), "the root has no parent node");
        let Some(prior) = self.prior_instance() else {
            panic!("no prior instance to take the parent from");
        };
        let Some(tracker) = prior.tracker_link().get() else {
            panic!("prior instance at {:?} has no parent tracker", prior.begin());
        };
        drop(self.reset_parent_tracker(Some(tracker)));

        let pos = self.get_parent_pos();
        let parent = self.peek_parent_node();
        parent.replace_child(
            pos,
            Arc::as_ptr(&prior).cast::<()>(),
            ChildSlot::from_child(self),
        );
    }

    fn on_replace_prior(self: &Arc<Self>) {
        self.take_parent_from_prior();
    }

    /// Clear the parent's slot for this child.
    ///
    /// May be skipped for pending children: they go away together with
    /// their pending parents when the transaction is invalidated.
    fn destroy(&self) {
        assert!(!self.is_btree_root(), "the root is unlinked from its root block instead");
        assert!(self.has_parent_tracker(), "destroying a child without a parent");
        let pos = self.get_parent_pos();
        let parent = self.peek_parent_node();
        let me: *const Self = self;
        parent.replace_child(pos, me.cast::<()>(), ChildSlot::Empty);
    }

    /// Position of this child in its parent's array.
    ///
    /// Lower-bound search on the child's begin key, stepping back one slot
    /// when the located key is greater (range children start inside the
    /// slot of the key before them).
    fn get_parent_pos(&self) -> usize {
        let parent = self.peek_parent_node();
        let key = self.begin();
        let mut pos = parent.lower_bound(key);
        if pos == parent.size() || parent.key_at(pos) > key {
            assert!(pos > 0, "child key {key:?} precedes its parent's range");
            pos -= 1;
        }
        debug_assert_eq!(parent.key_at(pos), key);
        pos
    }
}

impl<P, C> BaseChild<P> for C
where
    P: ParentNode,
    C: ChildNode<P>,
{
    fn tracker_link(&self) -> &ChildLink<P> {
        self.child_link()
    }

    fn node_begin(&self) -> P::Key {
        self.begin()
    }

    fn is_extent_valid(&self) -> bool {
        self.is_valid()
    }

    fn is_extent_stable(&self) -> bool {
        self.is_stable()
    }

    fn as_cached_extent(&self) -> &dyn CachedExtent {
        self
    }

    fn into_cached_extent(self: Arc<Self>) -> CachedExtentRef {
        self
    }
}

fn resolve_parent<'a, P, C>(
    child: &'a C,
    t: &'a Transaction,
    etvr: &'a dyn ExtentTransViewRetriever,
    key: P::Key,
) -> BoxFuture<'a, ResolveResult<Arc<P>>>
where
    P: ParentNode,
    C: BaseChild<P> + ?Sized,
{
    async move {
        let parent = child.peek_parent_node();
        etvr.maybe_wait_accessible(t, &*parent).await?;
        // The tracker may have been retargeted while we waited.
        let parent = child.peek_parent_node();
        Ok(parent.resolve_transaction(t, key).1)
    }
    .boxed()
}

/// Downcast a child from a parent's array to its concrete type.
///
/// # Panics
///
/// Panics if the child is not a `C`.
pub(crate) fn downcast_child<P, C>(child: Arc<dyn BaseChild<P>>) -> Arc<C>
where
    P: ParentNode,
    C: ChildNode<P>,
{
    let Ok(typed) = child.into_cached_extent().into_any().downcast::<C>() else {
        panic!(
            "child slot does not hold a {}",
            std::any::type_name::<C>()
        );
    };
    typed
}

/// A slot whose child is not loaded.
///
/// Returned instead of a child when resolution can only name where the
/// child will be linked once it is read in. Usually a stable slot; a
/// pending slot when the child was created in the transaction and has
/// been dropped since.
pub struct ChildPos<P: ParentNode> {
    parent: Arc<P>,
    pos: usize,
}

impl<P: ParentNode> ChildPos<P> {
    pub(crate) const fn new(parent: Arc<P>, pos: usize) -> Self {
        Self { parent, pos }
    }

    #[must_use]
    pub fn get_parent(&self) -> Arc<P> {
        Arc::clone(&self.parent)
    }

    #[must_use]
    pub const fn get_pos(&self) -> usize {
        self.pos
    }

    /// Link a freshly loaded child into the named slot.
    pub fn link_child<C: ChildNode<P>>(&self, child: &Arc<C>) {
        if self.parent.is_pending() {
            self.parent.update_child_ptr(self.pos, ChildSlot::from_child(child));
        } else {
            self.parent.link_child(child, self.pos);
        }
    }
}

impl<P: ParentNode> fmt::Debug for ChildPos<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildPos")
            .field("parent", &self.parent)
            .field("pos", &self.pos)
            .finish()
    }
}

/// Outcome of [`ParentNode::get_child`].
pub enum GetChild<'a, P: ParentNode, C> {
    /// The child exists; the future yields the version visible to the
    /// transaction.
    Child(BoxFuture<'a, ResolveResult<Arc<C>>>),
    /// The child is not in memory; this names the stable slot for it.
    Pos(ChildPos<P>),
}

impl<P: ParentNode, C> GetChild<'_, P, C> {
    #[must_use]
    pub const fn has_child(&self) -> bool {
        matches!(self, Self::Child(_))
    }
}
