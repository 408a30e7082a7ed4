//! Root linkage.
//!
//! The root of a tree has no tree node above it. Its parent is a fixed
//! root block, which only ever points at one root at a time. The root
//! holds the block strongly and the block points back weakly.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::extent::TreeExtent;
use crate::lock;

/// The fixed parent a tree root links to.
pub trait TreeRootLinker<R>: Send + Sync {
    /// Make `root` the block's current root.
    fn link_root(&self, root: &Arc<R>);

    /// Forget `root`, if it is still the block's current root.
    fn unlink_root(&self, root: &R);
}

/// A root block holding the current root of one tree.
pub struct RootBlock<R> {
    root: Mutex<Option<Weak<R>>>,
}

impl<R> RootBlock<R> {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            root: Mutex::new(None),
        })
    }

    /// The currently linked root, if it is still alive.
    #[must_use]
    pub fn root(&self) -> Option<Arc<R>> {
        lock(&self.root).as_ref().and_then(Weak::upgrade)
    }
}

impl<R: TreeExtent> TreeRootLinker<R> for RootBlock<R> {
    fn link_root(&self, root: &Arc<R>) {
        tracing::debug!("link root at {:?}, state {:?}", root.begin(), root.extent_state());
        *lock(&self.root) = Some(Arc::downgrade(root));
    }

    fn unlink_root(&self, root: &R) {
        let mut current = lock(&self.root);
        if current
            .as_ref()
            .is_some_and(|linked| std::ptr::eq(linked.as_ptr(), root))
        {
            tracing::debug!("unlink root at {:?}", root.begin());
            *current = None;
        }
    }
}

impl<R> fmt::Debug for RootBlock<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let linked = lock(&self.root)
            .as_ref()
            .map(|root| root.as_ptr().cast::<()>());
        f.debug_struct("RootBlock").field("root", &linked).finish()
    }
}

/// A root's reference to its root block.
pub struct RootLink<B> {
    parent_of_root: Mutex<Option<Arc<B>>>,
}

impl<B> RootLink<B> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            parent_of_root: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn get(&self) -> Option<Arc<B>> {
        lock(&self.parent_of_root).clone()
    }

    pub fn set(&self, block: Arc<B>) {
        *lock(&self.parent_of_root) = Some(block);
    }
}

impl<B> Default for RootLink<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B> fmt::Debug for RootLink<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let block = lock(&self.parent_of_root)
            .as_ref()
            .map(|block| Arc::as_ptr(block).cast::<()>());
        f.debug_tuple("RootLink").field(&block).finish()
    }
}

/// A node that is (or can become) the root of the tree.
///
/// A node is the root exactly while it is linked to a root block.
pub trait RootChildNode<B: TreeRootLinker<Self>>: TreeExtent {
    fn root_link(&self) -> &RootLink<B>;

    /// Drop the child-side parent tracker, if any.
    fn discard_parent_tracker(&self);

    fn has_root_parent(&self) -> bool {
        self.root_link().get().is_some()
    }

    /// Link this node under `block` as the tree root.
    fn link_root_parent(self: &Arc<Self>, block: Arc<B>) {
        block.link_root(self);
        self.root_link().set(block);
    }

    /// Take over the prior instance's root block.
    fn set_root_parent_from_prior_instance(self: &Arc<Self>) {
        assert!(
            self.is_mutation_pending(),
            "only a mutation-pending root inherits its root block"
        );
        assert!(self.pending_for_transaction().is_some());
        let Some(prior) = self.prior_instance() else {
            panic!("root at {:?} has no prior instance", self.begin());
        };
        let Some(block) = prior.root_link().get() else {
            panic!("prior root at {:?} is not linked to a root block", prior.begin());
        };
        self.link_root_parent(block);
    }

    fn on_replace_prior_root(self: &Arc<Self>) {
        self.set_root_parent_from_prior_instance();
    }

    /// Unlink this root from its root block.
    fn destroy_root(&self) {
        assert!(
            self.has_root_parent(),
            "destroying node at {:?}, which is not the tree root",
            self.begin()
        );
        if let Some(block) = self.root_link().get() {
            block.unlink_root(self);
        }
    }

    /// A freshly written root has nothing above it in the tree.
    fn on_initial_write(&self) {
        assert!(
            self.has_root_parent(),
            "node at {:?} is written as root without a root block",
            self.begin()
        );
        self.discard_parent_tracker();
    }
}
