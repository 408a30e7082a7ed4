//! Extent lifecycle contract.
//!
//! Every tree node and every logical extent indexed by a leaf is a cached
//! extent with a lifecycle state and, while pending, an optional prior
//! instance. The linkage engine only consumes this contract;
//! [`ExtentVersion`] is a ready-made implementation extent types can embed.
//!
//! # States
//!
//! | state                    | visible to                | prior instance        |
//! |--------------------------|---------------------------|-----------------------|
//! | `Stable`                 | every transaction         | none                  |
//! | `MutationPending`        | its own transaction       | the stable version    |
//! | `InitialPending`         | its own transaction       | none, or the rewritten stable node |
//! | `ExistClean`             | its own transaction       | none                  |
//! | `ExistMutationPending`   | its own transaction       | none                  |

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::lock;
use crate::transaction::{TransId, Transaction};

/// Lifecycle state of an extent version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtentState {
    /// Committed, visible to all transactions.
    Stable,
    /// A transaction-local copy of a stable extent.
    MutationPending,
    /// Created in this transaction.
    InitialPending,
    /// Remapped from existing on-disk data without modification.
    ExistClean,
    /// An exist-clean extent that has since been modified.
    ExistMutationPending,
}

/// How an extent relates to a given transaction's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewableState {
    /// Stable and untouched by the transaction.
    Stable,
    /// Pending in some transaction.
    Pending,
    /// Stable, but the transaction holds a mutation-pending copy.
    StableBecomePending,
    /// Stable, but the transaction retired it (split, merged, rewritten...).
    StableBecomeRetired,
}

/// The lifecycle queries the linkage engine relies on.
pub trait CachedExtent: Any + Send + Sync + fmt::Debug {
    /// Current lifecycle state.
    fn extent_state(&self) -> ExtentState;

    /// Whether the extent is still live (not invalidated or retired for good).
    fn is_valid(&self) -> bool;

    /// The transaction a pending extent belongs to.
    fn pending_for_transaction(&self) -> Option<TransId>;

    /// Whether this initial-pending extent replaces exactly one stable one.
    fn is_rewrite(&self) -> bool {
        false
    }

    /// Whether the extent is visible to `t`, and why (not).
    fn is_viewable_by_trans(&self, t: &Transaction) -> (bool, ViewableState);

    /// Erase to `Any` for downcasting to the concrete extent type.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    fn is_stable(&self) -> bool {
        self.extent_state() == ExtentState::Stable
    }

    fn is_pending(&self) -> bool {
        !self.is_stable()
    }

    fn is_mutation_pending(&self) -> bool {
        self.extent_state() == ExtentState::MutationPending
    }

    /// Fresh in this transaction. The exist-* states count as initial
    /// pending too; they only differ in never being rewrites.
    fn is_initial_pending(&self) -> bool {
        matches!(
            self.extent_state(),
            ExtentState::InitialPending
                | ExtentState::ExistClean
                | ExtentState::ExistMutationPending
        )
    }

    fn is_exist(&self) -> bool {
        matches!(
            self.extent_state(),
            ExtentState::ExistClean | ExtentState::ExistMutationPending
        )
    }

    fn is_pending_in_trans(&self, trans_id: TransId) -> bool {
        self.is_pending() && self.pending_for_transaction() == Some(trans_id)
    }
}

/// An extent that covers a key range and may supersede a prior version.
pub trait TreeExtent: CachedExtent + Sized + 'static {
    /// Key type of the tree.
    type Key: Ord + Copy + fmt::Debug + Send + Sync + 'static;

    /// First key covered (inclusive).
    fn begin(&self) -> Self::Key;

    /// End of the covered range (exclusive).
    fn end(&self) -> Self::Key;

    /// The version this pending extent supersedes.
    fn prior_instance(&self) -> Option<Arc<Self>>;

    fn is_in_range(&self, key: Self::Key) -> bool {
        self.begin() <= key && key < self.end()
    }
}

/// Lifecycle bookkeeping for one extent version.
///
/// Tracks state, validity, owning transaction and prior instance, plus, for
/// stable versions, which transactions hold a mutation-pending copy and
/// which have retired it.
pub struct ExtentVersion<T> {
    inner: Mutex<VersionInner<T>>,
}

struct VersionInner<T> {
    state: ExtentState,
    valid: bool,
    pending_for: Option<TransId>,
    prior_instance: Option<Arc<T>>,
    rewrite: bool,
    mutation_pending: BTreeMap<TransId, Weak<T>>,
    retired_in: BTreeSet<TransId>,
}

impl<T> ExtentVersion<T> {
    fn with(state: ExtentState, pending_for: Option<TransId>, prior: Option<Arc<T>>) -> Self {
        Self {
            inner: Mutex::new(VersionInner {
                state,
                valid: true,
                pending_for,
                prior_instance: prior,
                rewrite: false,
                mutation_pending: BTreeMap::new(),
                retired_in: BTreeSet::new(),
            }),
        }
    }

    /// A committed version.
    #[must_use]
    pub fn stable() -> Self {
        Self::with(ExtentState::Stable, None, None)
    }

    /// A version created fresh in `trans_id`.
    #[must_use]
    pub fn initial_pending(trans_id: TransId) -> Self {
        Self::with(ExtentState::InitialPending, Some(trans_id), None)
    }

    /// A version remapped from existing data in `trans_id`.
    #[must_use]
    pub fn exist_clean(trans_id: TransId) -> Self {
        Self::with(ExtentState::ExistClean, Some(trans_id), None)
    }

    /// A fresh version in `trans_id` that rewrites the stable `prior`.
    #[must_use]
    pub fn rewrite_of(trans_id: TransId, prior: Arc<T>) -> Self {
        let version = Self::with(ExtentState::InitialPending, Some(trans_id), Some(prior));
        lock(&version.inner).rewrite = true;
        version
    }

    /// A transaction-local mutable copy of the stable `prior`.
    #[must_use]
    pub fn mutation_of(trans_id: TransId, prior: Arc<T>) -> Self {
        Self::with(ExtentState::MutationPending, Some(trans_id), Some(prior))
    }

    #[must_use]
    pub fn state(&self) -> ExtentState {
        lock(&self.inner).state
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        lock(&self.inner).valid
    }

    #[must_use]
    pub fn is_rewrite(&self) -> bool {
        lock(&self.inner).rewrite
    }

    #[must_use]
    pub fn pending_for_transaction(&self) -> Option<TransId> {
        lock(&self.inner).pending_for
    }

    #[must_use]
    pub fn prior_instance(&self) -> Option<Arc<T>> {
        lock(&self.inner).prior_instance.clone()
    }

    /// Record `version` as the mutation-pending copy of this stable extent
    /// in `trans_id`.
    ///
    /// # Panics
    ///
    /// Panics if this version is not stable, or the transaction already has
    /// a different pending copy.
    pub fn add_mutation_pending(&self, trans_id: TransId, version: &Arc<T>) {
        let mut inner = lock(&self.inner);
        assert_eq!(
            inner.state,
            ExtentState::Stable,
            "only stable extents have mutation-pending copies"
        );
        let previous = inner
            .mutation_pending
            .insert(trans_id, Arc::downgrade(version));
        assert!(
            previous.is_none_or(|p| std::ptr::eq(p.as_ptr(), Arc::as_ptr(version))),
            "trans.{trans_id} already holds a pending copy"
        );
    }

    /// The mutation-pending copy `trans_id` holds, if any.
    #[must_use]
    pub fn mutation_pending_for(&self, trans_id: TransId) -> Option<Arc<T>> {
        lock(&self.inner)
            .mutation_pending
            .get(&trans_id)
            .and_then(Weak::upgrade)
    }

    /// Mark this stable extent as retired within `trans_id`.
    pub fn retire_in(&self, trans_id: TransId) {
        lock(&self.inner).retired_in.insert(trans_id);
    }

    /// Visibility of this version to `trans_id`.
    #[must_use]
    pub fn viewable_state(&self, trans_id: TransId) -> (bool, ViewableState) {
        let inner = lock(&self.inner);
        if inner.state != ExtentState::Stable {
            return (inner.pending_for == Some(trans_id), ViewableState::Pending);
        }
        if inner.mutation_pending.contains_key(&trans_id) {
            (false, ViewableState::StableBecomePending)
        } else if inner.retired_in.contains(&trans_id) {
            (false, ViewableState::StableBecomeRetired)
        } else {
            (true, ViewableState::Stable)
        }
    }

    /// Exist-clean becomes exist-mutation-pending on first modification.
    pub fn mark_mutated(&self) {
        let mut inner = lock(&self.inner);
        if inner.state == ExtentState::ExistClean {
            inner.state = ExtentState::ExistMutationPending;
        }
    }

    /// Transition to stable once the owning transaction committed.
    ///
    /// Returns the prior instance that was dropped from this version.
    pub fn complete_commit(&self) -> Option<Arc<T>> {
        let mut inner = lock(&self.inner);
        assert_ne!(
            inner.state,
            ExtentState::Stable,
            "committing an extent that is already stable"
        );
        inner.state = ExtentState::Stable;
        inner.pending_for = None;
        inner.rewrite = false;
        inner.prior_instance.take()
    }

    pub fn invalidate(&self) {
        lock(&self.inner).valid = false;
    }

    /// Forget everything recorded on behalf of `trans_id`.
    pub fn forget_transaction(&self, trans_id: TransId) {
        let mut inner = lock(&self.inner);
        inner.mutation_pending.remove(&trans_id);
        inner.retired_in.remove(&trans_id);
    }
}

impl<T> fmt::Debug for ExtentVersion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("ExtentVersion")
            .field("state", &inner.state)
            .field("valid", &inner.valid)
            .field("pending_for", &inner.pending_for)
            .field("has_prior", &inner.prior_instance.is_some())
            .field("rewrite", &inner.rewrite)
            .finish_non_exhaustive()
    }
}
