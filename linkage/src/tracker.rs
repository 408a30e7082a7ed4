//! Shared parent tracker.
//!
//! Children never point at their parent directly. They share one
//! [`ParentTracker`] per parent version, and the tracker points at the parent.
//! When a node is replaced by a new version (commit of a mutation, rewrite),
//! retargeting the tracker moves every child over in O(1) instead of walking
//! the subtree.
//!
//! # Ownership
//!
//! - Children hold `Arc<ParentTracker>`; the tracker lives as long as the
//!   longest-lived child
//! - The tracker holds a strong reference to its current parent
//! - The parent refers back to "its" tracker weakly
//!   ([`crate::ParentLinks`]), and the tracker clears that back-reference
//!   when it is dropped
//!
//! A tracker must never be dropped while its parent's link state is locked;
//! code that displaces trackers under a lock collects them and drops them
//! after releasing it.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::lock;
use crate::parent::ParentNode;

/// The "current parent" cell shared by all children of one node version.
pub struct ParentTracker<P: ParentNode> {
    parent: Mutex<Arc<P>>,
}

impl<P: ParentNode> ParentTracker<P> {
    pub(crate) fn new(parent: Arc<P>) -> Arc<Self> {
        Arc::new(Self {
            parent: Mutex::new(parent),
        })
    }

    /// The node currently acting as parent.
    #[must_use]
    pub fn get_parent(&self) -> Arc<P> {
        Arc::clone(&lock(&self.parent))
    }

    /// Retarget every child sharing this tracker to `parent`.
    pub fn reset_parent(&self, parent: Arc<P>) {
        // The displaced parent reference is released after the lock.
        let _previous = std::mem::replace(&mut *lock(&self.parent), parent);
    }

    /// Whether the tracked parent is still a live extent.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        lock(&self.parent).is_valid()
    }
}

impl<P: ParentNode> Drop for ParentTracker<P> {
    fn drop(&mut self) {
        let me: *const Self = self;
        let parent = self
            .parent
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut links = lock(parent.links());
        if links
            .my_tracker
            .as_ref()
            .is_some_and(|tracker| std::ptr::eq(tracker.as_ptr(), me))
        {
            links.my_tracker = None;
        }
    }
}

impl<P: ParentNode> fmt::Display for ParentTracker<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tracker_ptr={:p}, parent_ptr={:p}",
            self,
            Arc::as_ptr(&lock(&self.parent))
        )
    }
}

impl<P: ParentNode> fmt::Debug for ParentTracker<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
