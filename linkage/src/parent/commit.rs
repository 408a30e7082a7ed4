//! Commit-time adoption of child pointers.
//!
//! A pending node only holds the children created in its own transaction.
//! Before it becomes stable it pulls the remaining pointers forward from
//! whatever it resolved through: its prior instance (mutations, rewrites) or
//! its copy sources (split/merge/balance products).

use std::sync::Arc;

use super::ParentNode;
use super::copy::{clear_copy_sources, owning_trans, unregister_from_sources};
use crate::child::{BaseChild, ChildSlot};
use crate::lock;
use crate::retriever::{CachedExtentRef, ExtentTransViewRetriever};
use crate::transaction::Transaction;
use crate::validate;

pub(super) fn adjust_ptracker_for_children<P: ParentNode>(me: &Arc<P>) {
    let size = me.size();
    let mut held: Vec<Arc<dyn BaseChild<P>>> = Vec::new();
    let mut displaced = Vec::new();
    let mut links = lock(me.links());
    assert!(
        size <= links.children.len(),
        "node of {size} entries has a child array of {}",
        links.children.len()
    );
    for pos in 0..size {
        let Some(child) = links.children[pos].child() else {
            continue;
        };
        displaced.extend(links.set_child_ptracker(me, child.as_ref()));
        held.push(child);
    }
    drop(links);
    drop(displaced);
    drop(held);
}

pub(super) fn set_children_from_prior_instance<P: ParentNode>(me: &Arc<P>) {
    let Some(prior) = me.prior_instance() else {
        panic!("node at {:?} has no prior instance", me.begin());
    };
    let prior_tracker = lock(prior.links()).my_tracker.take();
    let Some(tracker) = prior_tracker.as_ref().and_then(std::sync::Weak::upgrade) else {
        debug_assert!(validate::is_children_empty(&*prior));
        return;
    };
    tracker.reset_parent(Arc::clone(me));
    lock(me.links()).my_tracker = prior_tracker;
    // Children created in this transaction still hold this node's old
    // tracker; move them onto the inherited one.
    adjust_ptracker_for_children(me);
    drop(tracker);
}

pub(super) fn copy_children_from_stable_source<P: ParentNode>(
    me: &P,
    source: &P,
    foreign_start: usize,
    foreign_end: usize,
    local_start: usize,
) -> usize {
    let foreign: Vec<ChildSlot<P>> = {
        let links = lock(source.links());
        assert!(
            foreign_end <= links.children.len(),
            "copy source has a child array of {}, walking to {foreign_end}",
            links.children.len()
        );
        links.children[..foreign_end].to_vec()
    };

    let size = me.size();
    let mut links = lock(me.links());
    links.maybe_expand_children(size);
    let (mut foreign_pos, mut local_pos) = (foreign_start, local_start);
    while foreign_pos < foreign_end && local_pos < size {
        let foreign_key = source.key_at(foreign_pos);
        let local_key = me.key_at(local_pos);
        match foreign_key.cmp(&local_key) {
            std::cmp::Ordering::Equal => {
                // Local pointers win: they were set in this transaction.
                if links.children[local_pos].is_empty() {
                    links.children[local_pos] = foreign[foreign_pos].clone();
                }
                foreign_pos += 1;
                local_pos += 1;
            }
            // Removed in this transaction.
            std::cmp::Ordering::Less => foreign_pos += 1,
            // Inserted in this transaction.
            std::cmp::Ordering::Greater => local_pos += 1,
        }
    }
    local_pos
}

pub(super) fn copy_children_from_stable_sources<P: ParentNode>(me: &Arc<P>) {
    let sources = me.copy_sources();
    if sources.is_empty() {
        return;
    }
    let begin = me.begin();
    let first = sources.partition_point(|source| source.begin() <= begin);
    assert!(first > 0, "no copy source covers the start of {me:?}");
    let mut idx = first - 1;
    let mut start_pos = sources[idx].lower_bound(begin);
    if start_pos == sources[idx].size() {
        idx += 1;
        start_pos = 0;
    }

    let end = me.end();
    let mut local_next = 0;
    for source in &sources[idx..] {
        let end_pos = if source.is_in_range(end) {
            source.upper_bound(end)
        } else {
            source.size()
        };
        local_next = me.copy_children_from_stable_source(source, start_pos, end_pos, local_next);
        if end_pos != source.size() {
            break;
        }
        start_pos = 0;
    }
}

pub(super) fn take_children_from_prior_instance<P: ParentNode>(me: &Arc<P>) {
    let Some(prior) = me.prior_instance() else {
        panic!("node at {:?} has no prior instance", me.begin());
    };
    if !me.is_mutation_pending() {
        let sources = me.copy_sources();
        debug_assert!(
            sources.len() == 1 && Arc::ptr_eq(&sources[0], &prior),
            "a rewrite copies from its prior instance only"
        );
    }
    me.set_children_from_prior_instance();
    let copied = me.copy_children_from_stable_source(&prior, 0, prior.size(), 0);
    assert!(copied <= me.size());
}

pub(super) fn take_children_from_stable_sources<P: ParentNode>(me: &Arc<P>) {
    me.copy_children_from_stable_sources();
    me.adjust_ptracker_for_children();
}

fn validate_if_enabled<P: ParentNode>(me: &P) {
    if lock(me.links()).config.validate {
        assert!(
            validate::validate_stable_children(me),
            "node at {:?} has no child array",
            me.begin()
        );
    }
}

pub(super) fn prepare_commit<P: ParentNode>(me: &Arc<P>) {
    if !me.is_initial_pending() {
        return;
    }
    let rewrite = me.is_rewrite();
    if rewrite {
        me.take_children_from_prior_instance();
    } else {
        me.take_children_from_stable_sources();
    }
    validate_if_enabled(&**me);
    let trans_id = owning_trans(&**me);
    unregister_from_sources(me, trans_id);
    clear_copy_sources(&**me);
    tracing::debug!("trans.{trans_id} prepared {me:?} for commit, rewrite: {rewrite}");
}

pub(super) fn replace_prior_children<P: ParentNode>(me: &Arc<P>) {
    assert!(!me.is_rewrite(), "rewrites adopt children in prepare_commit");
    me.take_children_from_prior_instance();
    validate_if_enabled(&**me);
}

fn viewable_stable(
    t: &Transaction,
    etvr: &dyn ExtentTransViewRetriever,
    extent: &CachedExtentRef,
    data_only: bool,
) -> bool {
    if data_only {
        etvr.is_viewable_extent_data_stable(t, extent)
    } else {
        etvr.is_viewable_extent_stable(t, extent)
    }
}

pub(super) fn is_child_stable<P: ParentNode>(
    me: &P,
    t: &Transaction,
    etvr: &dyn ExtentTransViewRetriever,
    pos: usize,
    key: P::Key,
    data_only: bool,
) -> bool {
    debug_assert_eq!(key, me.key_at(pos));
    let slot = me.slot(pos);
    if slot.is_reserved() {
        return true;
    }
    if let Some(child) = slot.child() {
        return viewable_stable(t, etvr, &child.into_cached_extent(), data_only);
    }
    if !me.is_pending() {
        return true;
    }
    let Some((sparent, spos)) = me.find_stable_slot(key) else {
        return true;
    };
    sparent.slot(spos).child().is_none_or(|child| {
        viewable_stable(t, etvr, &child.into_cached_extent(), data_only)
    })
}
