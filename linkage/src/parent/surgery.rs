//! Child-pointer surgery for split, merge and balance.
//!
//! Only pending donors own children that must move: a stable donor's
//! children stay linked to it and are reached through the copy sources of
//! the replacement nodes until commit.

use std::sync::Arc;

use super::ParentNode;
use super::copy::{clear_copy_sources, unregister_from_sources};
use crate::child::BaseChild;
use crate::lock;
use crate::transaction::Transaction;

/// Copy `src[src_start..src_end)` into `dest` starting at `dest_start`,
/// pointing every moved child at `dest`'s tracker.
fn move_child_ptrs<P: ParentNode>(
    dest: &Arc<P>,
    src: &P,
    dest_start: usize,
    src_start: usize,
    src_end: usize,
) {
    if src_start == src_end {
        return;
    }
    assert!(src_start < src_end);
    let moved = {
        let links = lock(src.links());
        assert!(
            src_end <= links.children.len(),
            "moving slots {src_start}..{src_end} out of a child array of {}",
            links.children.len()
        );
        links.children[src_start..src_end].to_vec()
    };

    let mut held: Vec<Arc<dyn BaseChild<P>>> = Vec::new();
    let mut displaced = Vec::new();
    let mut links = lock(dest.links());
    assert!(dest_start + moved.len() <= links.children.len());
    for (offset, slot) in moved.into_iter().enumerate() {
        if let Some(child) = slot.child() {
            displaced.extend(links.set_child_ptracker(dest, child.as_ref()));
            held.push(child);
        }
        links.children[dest_start + offset] = slot;
    }
    drop(links);
    drop(displaced);
    drop(held);
}

fn release_tracker<P: ParentNode>(donor: &P) {
    lock(donor.links()).my_tracker = None;
}

fn expand<P: ParentNode>(node: &P, size: usize) {
    lock(node.links()).maybe_expand_children(size);
}

pub(super) fn split_child_ptrs<P: ParentNode>(
    me: &Arc<P>,
    t: &Transaction,
    left: &Arc<P>,
    right: &Arc<P>,
) {
    debug_assert!(!left.has_tracker());
    debug_assert!(!right.has_tracker());
    let pivot = me.split_pivot();
    let size = me.size();
    expand(&**left, pivot);
    expand(&**right, size - pivot);
    if me.is_pending() {
        move_child_ptrs(left, &**me, 0, 0, pivot);
        move_child_ptrs(right, &**me, 0, pivot, size);
        release_tracker(&**me);
    }
    tracing::debug!(
        "trans.{} split {:?} at pivot {pivot} of {size}, pending donor: {}",
        t.trans_id(),
        me,
        me.is_pending()
    );
}

pub(super) fn adjust_copy_src_dest_on_split<P: ParentNode>(
    me: &Arc<P>,
    t: &Transaction,
    left: &Arc<P>,
    right: &Arc<P>,
) {
    let initial_pending = me.is_initial_pending();
    if initial_pending {
        unregister_from_sources(me, t.trans_id());
    }
    P::push_copy_sources(t, left, me);
    P::push_copy_sources(t, right, me);
    if initial_pending {
        clear_copy_sources(&**me);
    }
}

pub(super) fn merge_child_ptrs<P: ParentNode>(
    me: &Arc<P>,
    t: &Transaction,
    left: &Arc<P>,
    right: &Arc<P>,
) {
    assert!(!me.has_tracker(), "merge target already owns children");
    let (l_size, r_size) = (left.size(), right.size());
    expand(&**me, l_size + r_size);
    if left.is_pending() {
        move_child_ptrs(me, &**left, 0, 0, l_size);
        release_tracker(&**left);
    }
    if right.is_pending() {
        move_child_ptrs(me, &**right, l_size, 0, r_size);
        release_tracker(&**right);
    }
    tracing::debug!(
        "trans.{} merged {l_size} + {r_size} children into {:?}",
        t.trans_id(),
        me
    );
}

fn unregister_donor<P: ParentNode>(t: &Transaction, donor: &Arc<P>) -> bool {
    let initial_pending = donor.is_initial_pending();
    if initial_pending {
        unregister_from_sources(donor, t.trans_id());
    }
    initial_pending
}

pub(super) fn adjust_copy_src_dest_on_merge<P: ParentNode>(
    me: &Arc<P>,
    t: &Transaction,
    left: &Arc<P>,
    right: &Arc<P>,
) {
    let clear_left = unregister_donor(t, left);
    let clear_right = unregister_donor(t, right);
    P::push_copy_sources(t, me, left);
    P::push_copy_sources(t, me, right);
    if clear_left {
        clear_copy_sources(&**left);
    }
    if clear_right {
        clear_copy_sources(&**right);
    }
}

pub(super) fn balance_child_ptrs<P: ParentNode>(
    t: &Transaction,
    left: &Arc<P>,
    right: &Arc<P>,
    pivot_idx: usize,
    replacement_left: &Arc<P>,
    replacement_right: &Arc<P>,
) {
    let (l_size, r_size) = (left.size(), right.size());
    assert!(
        pivot_idx != l_size && pivot_idx != r_size,
        "balance pivot {pivot_idx} moves nothing (sizes {l_size} and {r_size})"
    );
    expand(&**replacement_left, pivot_idx);
    expand(&**replacement_right, l_size + r_size - pivot_idx);
    debug_assert!(!replacement_left.has_tracker());
    debug_assert!(!replacement_right.has_tracker());

    if pivot_idx < l_size {
        if left.is_pending() {
            move_child_ptrs(replacement_left, &**left, 0, 0, pivot_idx);
            move_child_ptrs(replacement_right, &**left, 0, pivot_idx, l_size);
            release_tracker(&**left);
        }
        if right.is_pending() {
            move_child_ptrs(replacement_right, &**right, l_size - pivot_idx, 0, r_size);
            release_tracker(&**right);
        }
    } else {
        if left.is_pending() {
            move_child_ptrs(replacement_left, &**left, 0, 0, l_size);
            release_tracker(&**left);
        }
        if right.is_pending() {
            move_child_ptrs(replacement_left, &**right, l_size, 0, pivot_idx - l_size);
            move_child_ptrs(replacement_right, &**right, 0, pivot_idx - l_size, r_size);
            release_tracker(&**right);
        }
    }
    tracing::debug!(
        "trans.{} balanced {l_size} + {r_size} children at pivot {pivot_idx}",
        t.trans_id()
    );
}

pub(super) fn adjust_copy_src_dest_on_balance<P: ParentNode>(
    t: &Transaction,
    left: &Arc<P>,
    right: &Arc<P>,
    pivot_idx: usize,
    replacement_left: &Arc<P>,
    replacement_right: &Arc<P>,
) {
    let l_size = left.size();
    let clear_left = unregister_donor(t, left);
    let clear_right = unregister_donor(t, right);

    if pivot_idx < l_size {
        P::push_copy_sources(t, replacement_left, left);
        P::push_copy_sources(t, replacement_right, left);
        P::push_copy_sources(t, replacement_right, right);
    } else {
        P::push_copy_sources(t, replacement_left, left);
        P::push_copy_sources(t, replacement_left, right);
        P::push_copy_sources(t, replacement_right, right);
    }

    if clear_left {
        clear_copy_sources(&**left);
    }
    if clear_right {
        clear_copy_sources(&**right);
    }
}
