//! Copy sources and copy destinations.
//!
//! A pending node that took over (part of) the key range of stable nodes
//! lists them as copy sources, and each of those stable nodes lists the
//! pending node as a copy destination under the pending node's transaction.
//! Lookups go both ways: a pending node resolves unloaded children through
//! its sources, and a stable node retired by a transaction resolves to that
//! transaction's replacement through its destinations.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Weak};

use super::{ParentLinks, ParentNode};
use crate::extent::ViewableState;
use crate::lock;
use crate::transaction::{TransId, Transaction, TransactionalView};

/// The per-transaction entry of a stable node's copy-dest index.
///
/// Registered with the transaction when the first destination is added,
/// and removes the entry again when the transaction ends.
struct CopyDestsView<P: ParentNode> {
    trans_id: TransId,
    owner: Weak<P>,
}

impl<P: ParentNode> TransactionalView for CopyDestsView<P> {
    fn trans_id(&self) -> TransId {
        self.trans_id
    }

    fn on_transaction_end(&self) {
        let Some(owner) = self.owner.upgrade() else {
            return;
        };
        let removed = lock(owner.links()).copy_dests_by_trans.remove(&self.trans_id);
        tracing::trace!(
            "trans.{} copy_dests destroyed, {} dests",
            self.trans_id,
            removed.as_ref().map_or(0, BTreeMap::len)
        );
        drop(removed);
    }
}

pub(super) fn find_pending_version<P: ParentNode>(
    me: &Arc<P>,
    t: &Transaction,
    key: P::Key,
    state: ViewableState,
) -> Arc<P> {
    assert!(me.is_stable(), "pending versions are looked up from stable nodes");
    let trans_id = t.trans_id();
    match state {
        ViewableState::StableBecomePending => {
            debug_assert!(
                !lock(me.links()).copy_dests_by_trans.contains_key(&trans_id),
                "mutated node also has copy dests in trans.{trans_id}"
            );
            let Some(pending) = me.mutation_pending_version(trans_id) else {
                panic!("trans.{trans_id} has no mutation-pending copy of the node at {:?}", me.begin());
            };
            pending
        }
        ViewableState::StableBecomeRetired => {
            let links = lock(me.links());
            let Some(dests) = links.copy_dests_by_trans.get(&trans_id) else {
                panic!("retired node at {:?} has no copy dests in trans.{trans_id}", me.begin());
            };
            let Some((_, dest)) = dests.range(..=key).next_back() else {
                panic!("no copy dest of trans.{trans_id} starts at or before {key:?}");
            };
            assert!(
                dest.is_in_range(key),
                "copy dest at {:?} does not cover {key:?}",
                dest.begin()
            );
            Arc::clone(dest)
        }
        ViewableState::Stable | ViewableState::Pending => {
            panic!("node at {:?} is {state:?}, nothing to resolve to", me.begin())
        }
    }
}

pub(super) fn add_copy_dest<P: ParentNode>(me: &Arc<P>, t: &Transaction, dest: &Arc<P>) {
    assert!(me.is_stable(), "copy dests hang off stable nodes only");
    assert!(dest.is_pending(), "a copy dest must be pending");
    let trans_id = t.trans_id();
    let new_view = {
        let mut links = lock(me.links());
        let new_view = !links.copy_dests_by_trans.contains_key(&trans_id);
        let dests = links.copy_dests_by_trans.entry(trans_id).or_default();
        let existing = dests.entry(dest.begin()).or_insert_with(|| Arc::clone(dest));
        assert!(
            Arc::ptr_eq(existing, dest),
            "another copy dest of trans.{trans_id} already starts at {:?}",
            dest.begin()
        );
        new_view
    };
    if new_view {
        t.add_transactional_view(Arc::new(CopyDestsView {
            trans_id,
            owner: Arc::downgrade(me),
        }));
    }
}

pub(super) fn del_copy_dest<P: ParentNode>(me: &P, trans_id: TransId, dest: &Arc<P>) {
    let removed = {
        let mut links = lock(me.links());
        let Some(dests) = links.copy_dests_by_trans.get_mut(&trans_id) else {
            panic!("no copy dests registered for trans.{trans_id}");
        };
        dests.remove(&dest.begin())
    };
    assert!(
        removed.as_ref().is_some_and(|r| Arc::ptr_eq(r, dest)),
        "node at {:?} is not a copy dest of trans.{trans_id}",
        dest.begin()
    );
}

/// Insert `src` into `links.copy_sources`.
///
/// Sources are keyed by begin; two sources either cover disjoint ranges or
/// are the same node.
fn insert_copy_source<P: ParentNode>(links: &mut ParentLinks<P>, src: &Arc<P>) {
    let begin = src.begin();
    if let Some((_, prev)) = links.copy_sources.range(..=begin).next_back() {
        if prev.begin() == begin {
            assert!(
                Arc::ptr_eq(prev, src),
                "two copy sources start at {begin:?}"
            );
            return;
        }
        assert!(
            prev.end() <= begin,
            "copy source at {:?} overlaps the one at {begin:?}",
            prev.begin()
        );
    }
    if let Some((_, next)) = links
        .copy_sources
        .range((Bound::Excluded(begin), Bound::Unbounded))
        .next()
    {
        assert!(
            src.end() <= next.begin(),
            "copy source at {begin:?} overlaps the one at {:?}",
            next.begin()
        );
    }
    links.copy_sources.insert(begin, Arc::clone(src));
}

fn register_source<P: ParentNode>(t: &Transaction, dest: &Arc<P>, src: &Arc<P>) {
    src.add_copy_dest(t, dest);
    insert_copy_source(&mut lock(dest.links()), src);
}

pub(super) fn get_stable_for_key<P: ParentNode>(me: &P, key: P::Key) -> Arc<P> {
    assert!(me.is_pending(), "stable nodes resolve children directly");
    if me.is_mutation_pending() {
        let Some(prior) = me.prior_instance() else {
            panic!("mutation-pending node at {:?} has no prior instance", me.begin());
        };
        return prior;
    }
    let links = lock(me.links());
    let Some((_, source)) = links.copy_sources.range(..=key).next_back() else {
        panic!("no copy source covers {key:?}");
    };
    assert!(
        source.is_in_range(key),
        "copy source at {:?} does not cover {key:?}",
        source.begin()
    );
    Arc::clone(source)
}

/// The stable node and position holding `key` for the pending node `me`.
///
/// `None` when nothing `me` resolves through holds `key`, e.g. a key
/// inserted in this transaction.
pub(super) fn find_stable_slot<P: ParentNode>(me: &P, key: P::Key) -> Option<(Arc<P>, usize)> {
    assert!(me.is_pending(), "stable nodes resolve children directly");
    let sparent = if me.is_mutation_pending() {
        me.prior_instance()?
    } else {
        let links = lock(me.links());
        let (_, source) = links.copy_sources.range(..=key).next_back()?;
        if !source.is_in_range(key) {
            return None;
        }
        Arc::clone(source)
    };
    let spos = sparent.lower_bound(key);
    (spos < sparent.size() && sparent.key_at(spos) == key).then_some((sparent, spos))
}

pub(super) fn push_copy_sources<P: ParentNode>(t: &Transaction, dest: &Arc<P>, src: &Arc<P>) {
    assert!(dest.is_initial_pending(), "only fresh nodes take copy sources");
    if src.is_stable() {
        register_source(t, dest, src);
    } else if src.is_mutation_pending() {
        let Some(prior) = src.prior_instance() else {
            panic!("mutation-pending node at {:?} has no prior instance", src.begin());
        };
        register_source(t, dest, &prior);
    } else {
        assert!(src.is_initial_pending());
        for source in src.copy_sources() {
            register_source(t, dest, &source);
        }
    }
}

pub(super) fn on_rewrite<P: ParentNode>(me: &Arc<P>, t: &Transaction, foreign: &Arc<P>) {
    if foreign.is_stable() {
        register_source(t, me, foreign);
        return;
    }
    assert!(
        foreign.is_mutation_pending(),
        "only stable or mutation-pending nodes are rewritten"
    );
    let Some(prior) = foreign.prior_instance() else {
        panic!("mutation-pending node at {:?} has no prior instance", foreign.begin());
    };
    register_source(t, me, &prior);
    let children = std::mem::take(&mut lock(foreign.links()).children);
    lock(me.links()).children = children;
    me.adjust_ptracker_for_children();
}

/// Remove `me` from the copy-dest index of each of its copy sources.
pub(super) fn unregister_from_sources<P: ParentNode>(me: &Arc<P>, trans_id: TransId) {
    for source in me.copy_sources() {
        source.del_copy_dest(trans_id, me);
    }
}

pub(super) fn clear_copy_sources<P: ParentNode>(me: &P) {
    let cleared = std::mem::take(&mut lock(me.links()).copy_sources);
    drop(cleared);
}

/// The transaction a pending node belongs to.
pub(super) fn owning_trans<P: ParentNode>(me: &P) -> TransId {
    let Some(trans_id) = me.pending_for_transaction() else {
        panic!("pending node at {:?} has no transaction", me.begin());
    };
    trans_id
}
