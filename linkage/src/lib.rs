#![cfg_attr(test, allow(clippy::disallowed_methods, clippy::unwrap_used, clippy::expect_used))]
//! Parent/child linkage for a copy-on-write, multi-version fixed-key B-tree.
//!
//! Tree nodes (parents) and the extents they index (children) keep pointers
//! to each other while several transactions each hold their own pending copy
//! of nodes on a root-to-leaf path.
//!
//! # Structure
//!
//! - [`extent`]: lifecycle contract of a cached extent plus [`ExtentVersion`],
//!   a reusable implementation of it
//! - [`transaction`]: transaction ids and the per-transaction view registry
//! - [`retriever`]: the transactional view retriever consulted on resolution
//! - [`tracker`]: the shared "current parent" cell all children of a node hold
//! - [`child`]: child capability, child slots and parent resolution
//! - [`parent`]: the child-pointer array, copy sources/destinations, pointer
//!   surgery for split/merge/balance, and commit-time adoption
//! - [`root`]: linkage of the tree root to its root block
//! - [`validate`]: optional consistency pass
//!
//! # Life of a lookup
//!
//! 1. A transaction asks a parent for the child at some position.
//! 2. The parent checks its own array, then its stable predecessor (prior
//!    instance or copy source).
//! 3. It hands back either a future resolving to the child, or a
//!    [`ChildPos`] naming the stable slot the child will be linked into.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod child;
pub mod config;
pub mod extent;
pub mod parent;
pub mod retriever;
pub mod root;
pub mod tracker;
pub mod transaction;
pub mod validate;

#[cfg(test)]
mod testing;

pub use child::{BaseChild, ChildLink, ChildNode, ChildPos, ChildSlot, GetChild};
pub use config::{ConfigError, LinkageConfig};
pub use extent::{CachedExtent, ExtentState, ExtentVersion, TreeExtent, ViewableState};
pub use parent::{ParentLinks, ParentNode};
pub use retriever::{
    CachedExtentRef, ExtentTransViewRetriever, ResolveError, ResolveResult, get_viewable_as,
};
pub use root::{RootBlock, RootChildNode, RootLink, TreeRootLinker};
pub use tracker::ParentTracker;
pub use transaction::{TransId, Transaction, TransactionalView};
pub use validate::{InvariantViolation, LinkageChecker};

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// Link state is only mutated under external single-writer discipline, so a
/// poisoned lock carries no information the engine could act on.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
