//! Test fixtures.
//!
//! A fixed-key tree node over `u64` keys, a logical extent that lives
//! under it, a root block for it, and a retriever with injectable failures.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::child::{BaseChild, ChildLink, ChildNode};
use crate::config::LinkageConfig;
use crate::extent::{CachedExtent, ExtentState, ExtentVersion, TreeExtent, ViewableState};
use crate::lock;
use crate::parent::{ParentLinks, ParentNode};
use crate::retriever::{CachedExtentRef, ExtentTransViewRetriever, ResolveError, ResolveResult};
use crate::root::{RootBlock, RootChildNode, RootLink};
use crate::transaction::{TransId, Transaction};

mod simulation;

/// Install a fmt subscriber filtered by `RUST_LOG`, once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// A fixed-key tree node; `UNIT` is the growth unit of its child array.
pub struct FixedKvNode<const UNIT: usize> {
    version: ExtentVersion<Self>,
    begin: u64,
    end: u64,
    keys: RwLock<Vec<u64>>,
    links: Mutex<ParentLinks<Self>>,
    child: ChildLink<Self>,
    root: RootLink<RootBlock<Self>>,
}

/// Node with a dynamically sized child array.
pub type TestNode = FixedKvNode<4>;
/// Node whose child array capacity is fixed at construction.
pub type FixedTestNode = FixedKvNode<0>;
pub type TestRootBlock = RootBlock<TestNode>;

impl<const UNIT: usize> FixedKvNode<UNIT> {
    fn build(
        version: ExtentVersion<Self>,
        begin: u64,
        end: u64,
        keys: Vec<u64>,
        links: ParentLinks<Self>,
    ) -> Arc<Self> {
        assert!(keys.windows(2).all(|w| w[0] < w[1]), "keys must be sorted");
        assert!(keys.iter().all(|k| (begin..end).contains(k)), "keys out of range");
        Arc::new(Self {
            version,
            begin,
            end,
            keys: RwLock::new(keys),
            links: Mutex::new(links),
            child: ChildLink::new(),
            root: RootLink::new(),
        })
    }

    fn fresh_links(len: usize) -> ParentLinks<Self> {
        let capacity = if UNIT == 0 {
            len
        } else {
            len.next_multiple_of(UNIT).max(UNIT)
        };
        ParentLinks::new(capacity, LinkageConfig::default())
    }

    pub fn stable(begin: u64, end: u64, keys: &[u64]) -> Arc<Self> {
        Self::build(
            ExtentVersion::stable(),
            begin,
            end,
            keys.to_vec(),
            Self::fresh_links(keys.len()),
        )
    }

    pub fn initial_pending(t: &Transaction, begin: u64, end: u64, keys: &[u64]) -> Arc<Self> {
        Self::build(
            ExtentVersion::initial_pending(t.trans_id()),
            begin,
            end,
            keys.to_vec(),
            Self::fresh_links(keys.len()),
        )
    }

    pub fn exist_clean(t: &Transaction, begin: u64, end: u64, keys: &[u64]) -> Arc<Self> {
        Self::build(
            ExtentVersion::exist_clean(t.trans_id()),
            begin,
            end,
            keys.to_vec(),
            Self::fresh_links(keys.len()),
        )
    }

    /// A mutation-pending copy of `prior`, registered with it.
    pub fn mutation_of(t: &Transaction, prior: &Arc<Self>) -> Arc<Self> {
        let links = lock(&prior.links).fresh_like();
        let node = Self::build(
            ExtentVersion::mutation_of(t.trans_id(), Arc::clone(prior)),
            prior.begin,
            prior.end,
            prior.read_keys().clone(),
            links,
        );
        prior.version.add_mutation_pending(t.trans_id(), &node);
        node
    }

    /// A fresh node replacing `prior`, which is retired in `t`.
    pub fn rewrite_of(t: &Transaction, prior: &Arc<Self>) -> Arc<Self> {
        let links = lock(&prior.links).fresh_like();
        prior.retire(t);
        Self::build(
            ExtentVersion::rewrite_of(t.trans_id(), Arc::clone(prior)),
            prior.begin,
            prior.end,
            prior.read_keys().clone(),
            links,
        )
    }

    pub fn retire(&self, t: &Transaction) {
        self.version.retire_in(t.trans_id());
    }

    pub fn complete_commit(&self) {
        drop(self.version.complete_commit());
    }

    pub fn invalidate(&self) {
        self.version.invalidate();
    }

    pub fn mark_mutated(&self) {
        self.version.mark_mutated();
    }

    pub fn forget_transaction(&self, trans_id: TransId) {
        self.version.forget_transaction(trans_id);
    }

    pub fn keys(&self) -> Vec<u64> {
        self.read_keys().clone()
    }

    pub fn insert_key(&self, pos: usize, key: u64) {
        self.write_keys().insert(pos, key);
    }

    pub fn remove_key(&self, pos: usize) {
        self.write_keys().remove(pos);
    }

    fn read_keys(&self) -> RwLockReadGuard<'_, Vec<u64>> {
        self.keys.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_keys(&self) -> RwLockWriteGuard<'_, Vec<u64>> {
        self.keys.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<const UNIT: usize> fmt::Debug for FixedKvNode<UNIT> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedKvNode")
            .field("range", &(self.begin..self.end))
            .field("size", &self.read_keys().len())
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl<const UNIT: usize> CachedExtent for FixedKvNode<UNIT> {
    fn extent_state(&self) -> ExtentState {
        self.version.state()
    }

    fn is_valid(&self) -> bool {
        self.version.is_valid()
    }

    fn pending_for_transaction(&self) -> Option<TransId> {
        self.version.pending_for_transaction()
    }

    fn is_rewrite(&self) -> bool {
        self.version.is_rewrite()
    }

    fn is_viewable_by_trans(&self, t: &Transaction) -> (bool, ViewableState) {
        self.version.viewable_state(t.trans_id())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

impl<const UNIT: usize> TreeExtent for FixedKvNode<UNIT> {
    type Key = u64;

    fn begin(&self) -> u64 {
        self.begin
    }

    fn end(&self) -> u64 {
        self.end
    }

    fn prior_instance(&self) -> Option<Arc<Self>> {
        self.version.prior_instance()
    }
}

impl<const UNIT: usize> ParentNode for FixedKvNode<UNIT> {
    const CHILD_VEC_UNIT: usize = UNIT;

    fn links(&self) -> &Mutex<ParentLinks<Self>> {
        &self.links
    }

    fn size(&self) -> usize {
        self.read_keys().len()
    }

    fn key_at(&self, pos: usize) -> u64 {
        self.read_keys()[pos]
    }

    fn mutation_pending_version(&self, trans_id: TransId) -> Option<Arc<Self>> {
        self.version.mutation_pending_for(trans_id)
    }
}

impl<const UNIT: usize> ChildNode<Self> for FixedKvNode<UNIT> {
    fn child_link(&self) -> &ChildLink<Self> {
        &self.child
    }

    fn is_btree_root(&self) -> bool {
        <Self as RootChildNode<RootBlock<Self>>>::has_root_parent(self)
    }
}

impl<const UNIT: usize> RootChildNode<RootBlock<Self>> for FixedKvNode<UNIT> {
    fn root_link(&self) -> &RootLink<RootBlock<Self>> {
        &self.root
    }

    fn discard_parent_tracker(&self) {
        drop(<Self as BaseChild<Self>>::reset_parent_tracker(self, None));
    }
}

/// A logical extent indexed by a [`TestNode`] leaf; covers `[key, key + 1)`.
pub struct TestLeaf {
    version: ExtentVersion<Self>,
    key: u64,
    child: ChildLink<TestNode>,
}

impl TestLeaf {
    fn build(version: ExtentVersion<Self>, key: u64) -> Arc<Self> {
        Arc::new(Self {
            version,
            key,
            child: ChildLink::new(),
        })
    }

    pub fn stable(key: u64) -> Arc<Self> {
        Self::build(ExtentVersion::stable(), key)
    }

    pub fn initial_pending(t: &Transaction, key: u64) -> Arc<Self> {
        Self::build(ExtentVersion::initial_pending(t.trans_id()), key)
    }

    pub fn mutation_of(t: &Transaction, prior: &Arc<Self>) -> Arc<Self> {
        let leaf = Self::build(
            ExtentVersion::mutation_of(t.trans_id(), Arc::clone(prior)),
            prior.key,
        );
        prior.version.add_mutation_pending(t.trans_id(), &leaf);
        leaf
    }

    pub fn complete_commit(&self) {
        drop(self.version.complete_commit());
    }

    pub fn invalidate(&self) {
        self.version.invalidate();
    }
}

impl fmt::Debug for TestLeaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestLeaf")
            .field("key", &self.key)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl CachedExtent for TestLeaf {
    fn extent_state(&self) -> ExtentState {
        self.version.state()
    }

    fn is_valid(&self) -> bool {
        self.version.is_valid()
    }

    fn pending_for_transaction(&self) -> Option<TransId> {
        self.version.pending_for_transaction()
    }

    fn is_viewable_by_trans(&self, t: &Transaction) -> (bool, ViewableState) {
        self.version.viewable_state(t.trans_id())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

impl TreeExtent for TestLeaf {
    type Key = u64;

    fn begin(&self) -> u64 {
        self.key
    }

    fn end(&self) -> u64 {
        self.key + 1
    }

    fn prior_instance(&self) -> Option<Arc<Self>> {
        self.version.prior_instance()
    }
}

impl ChildNode<TestNode> for TestLeaf {
    fn child_link(&self) -> &ChildLink<TestNode> {
        &self.child
    }
}

/// Retriever that hands extents back as-is, after one scheduler yield.
#[derive(Default)]
pub struct TestRetriever {
    fail: AtomicBool,
    waits: AtomicUsize,
    loads: AtomicUsize,
    unstable: Mutex<HashSet<usize>>,
}

impl TestRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every suspending call fail with an I/O error.
    pub fn fail_io(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn wait_count(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Report `extent` as not stable (its data stays stable).
    pub fn mark_unstable<C: CachedExtent>(&self, extent: &Arc<C>) {
        lock(&self.unstable).insert(Arc::as_ptr(extent).cast::<()>().addr());
    }

    fn check_io(&self) -> ResolveResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ResolveError::InputOutput {
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

impl ExtentTransViewRetriever for TestRetriever {
    fn maybe_wait_accessible<'a>(
        &'a self,
        _t: &'a Transaction,
        _extent: &'a dyn CachedExtent,
    ) -> BoxFuture<'a, ResolveResult<()>> {
        async move {
            self.waits.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.check_io()
        }
        .boxed()
    }

    fn is_viewable_extent_data_stable(&self, _t: &Transaction, extent: &CachedExtentRef) -> bool {
        extent.is_stable()
    }

    fn is_viewable_extent_stable(&self, _t: &Transaction, extent: &CachedExtentRef) -> bool {
        let addr = Arc::as_ptr(extent).cast::<()>().addr();
        extent.is_stable() && !lock(&self.unstable).contains(&addr)
    }

    fn get_extent_viewable_by_trans<'a>(
        &'a self,
        _t: &'a Transaction,
        extent: CachedExtentRef,
    ) -> BoxFuture<'a, ResolveResult<CachedExtentRef>> {
        async move {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.check_io()?;
            Ok(extent)
        }
        .boxed()
    }
}
