//! Consistency checks for the linkage.
//!
//! [`validate_stable_children`] runs on commit paths when
//! [`crate::LinkageConfig::validate`] is set. [`LinkageChecker`] collects
//! violations across a set of nodes instead of aborting on the first one,
//! for tests and debugging sessions that want the whole picture.

use std::sync::Arc;

use crate::child::{BaseChild, ChildSlot};
use crate::extent::ExtentState;
use crate::lock;
use crate::parent::ParentNode;
use crate::transaction::TransId;

/// No valid child is linked at any position of `node`.
#[must_use]
pub fn is_children_empty<P: ParentNode>(node: &P) -> bool {
    let size = node.size();
    let slots = lock(node.links()).children.clone();
    slots
        .iter()
        .take(size)
        .filter_map(ChildSlot::child)
        .all(|child| !child.is_extent_valid())
}

/// Every linked child starts at the key of its slot.
///
/// Returns `false` if the node has no child array at all.
///
/// # Panics
///
/// Panics (after logging) on the first child whose begin key differs from
/// its slot key.
#[must_use]
pub fn validate_stable_children<P: ParentNode>(node: &P) -> bool {
    let slots = lock(node.links()).children.clone();
    if slots.is_empty() {
        return false;
    }
    for (pos, slot) in slots.iter().enumerate().take(node.size()) {
        let Some(child) = slot.child() else {
            continue;
        };
        let key = node.key_at(pos);
        if child.node_begin() != key {
            tracing::error!(
                "stable child not valid: child {:?}, key {:?}",
                child.as_cached_extent(),
                key
            );
            panic!("child at {:?} linked in the slot of {key:?}", child.node_begin());
        }
    }
    true
}

/// A linkage invariant found broken.
#[derive(Debug, Clone)]
pub struct InvariantViolation {
    /// Description of the violation.
    pub description: String,
    /// Additional context.
    pub context: String,
}

/// Collects linkage invariant violations.
#[derive(Debug, Default)]
pub struct LinkageChecker {
    violations: Vec<InvariantViolation>,
}

impl LinkageChecker {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            violations: Vec::new(),
        }
    }

    #[must_use]
    pub fn violations(&self) -> &[InvariantViolation] {
        &self.violations
    }

    #[must_use]
    pub const fn has_violations(&self) -> bool {
        !self.violations.is_empty()
    }

    pub fn clear(&mut self) {
        self.violations.clear();
    }

    fn violation(&mut self, description: &str, context: String) {
        self.violations.push(InvariantViolation {
            description: description.to_owned(),
            context,
        });
    }

    /// A child with a tracker sits in its tracker parent's slot for its key.
    pub fn check_tracker_agreement<P: ParentNode>(&mut self, child: &dyn BaseChild<P>) {
        let Some(tracker) = child.peek_tracker() else {
            return;
        };
        let parent = tracker.get_parent();
        let key = child.node_begin();
        let pos = parent.lower_bound(key);
        if pos == parent.size() || parent.key_at(pos) != key {
            self.violation(
                "Child key missing from its tracker parent",
                format!("key {key:?}, parent {parent:?}"),
            );
            return;
        }
        let me: *const dyn BaseChild<P> = child;
        if !parent.slot(pos).points_to(me.cast::<()>()) {
            self.violation(
                "Tracker parent slot references another child",
                format!("key {key:?}, pos {pos}, slot {:?}", parent.slot(pos)),
            );
        }
    }

    /// Every copy source of `pending` lists it as a copy dest.
    pub fn check_copy_symmetry<P: ParentNode>(&mut self, pending: &Arc<P>) {
        let sources = pending.copy_sources();
        if sources.is_empty() {
            return;
        }
        let Some(trans_id) = pending.pending_for_transaction() else {
            self.violation(
                "Node with copy sources belongs to no transaction",
                format!("{pending:?}"),
            );
            return;
        };
        for source in sources {
            if !source
                .copy_dests(trans_id)
                .iter()
                .any(|dest| Arc::ptr_eq(dest, pending))
            {
                self.violation(
                    "Copy source does not list its dest",
                    format!("trans.{trans_id}, source {source:?}, dest {pending:?}"),
                );
            }
        }
    }

    /// Every copy dest of `stable` in `trans_id` lists it as a copy source.
    pub fn check_stable_copy_dests<P: ParentNode>(&mut self, stable: &Arc<P>, trans_id: TransId) {
        for dest in stable.copy_dests(trans_id) {
            if !dest
                .copy_sources()
                .iter()
                .any(|source| Arc::ptr_eq(source, stable))
            {
                self.violation(
                    "Copy dest does not list its source",
                    format!("trans.{trans_id}, source {stable:?}, dest {dest:?}"),
                );
            }
            if dest.pending_for_transaction() != Some(trans_id) {
                self.violation(
                    "Copy dest filed under the wrong transaction",
                    format!("trans.{trans_id}, dest {dest:?}"),
                );
            }
        }
    }

    /// The per-state rules for prior instance and copy sources.
    pub fn check_state_invariants<P: ParentNode>(&mut self, node: &Arc<P>) {
        let state = node.extent_state();
        let prior = node.prior_instance();
        let sources = node.copy_sources();
        let context = || format!("{state:?} node {node:?}");
        match state {
            ExtentState::Stable => {
                if prior.is_some() {
                    self.violation("Stable node has a prior instance", context());
                }
                if !sources.is_empty() {
                    self.violation("Stable node has copy sources", context());
                }
            }
            ExtentState::MutationPending => {
                if !prior.as_ref().is_some_and(|p| p.is_stable()) {
                    self.violation("Mutation-pending node without stable prior", context());
                }
                if !sources.is_empty() {
                    self.violation("Mutation-pending node has copy sources", context());
                }
            }
            ExtentState::InitialPending | ExtentState::ExistClean | ExtentState::ExistMutationPending => {
                if node.is_rewrite() {
                    if node.is_exist() {
                        self.violation("Exist node marked as rewrite", context());
                    }
                    let single_prior = sources.len() <= 1
                        && sources
                            .iter()
                            .all(|s| prior.as_ref().is_some_and(|p| Arc::ptr_eq(p, s)));
                    if !single_prior {
                        self.violation("Rewrite resolves through other than its prior", context());
                    }
                } else if prior.is_some() {
                    self.violation("Fresh node has a prior instance", context());
                }
                if sources.iter().any(|s| !s.is_stable()) {
                    self.violation("Pending copy source", context());
                }
            }
        }
        if !node.is_pending() && node.has_tracker() {
            let size = node.size();
            let slots: Vec<_> = (0..size).map(|pos| node.slot(pos)).collect();
            for (pos, slot) in slots.iter().enumerate() {
                if let Some(child) = slot.child()
                    && child.is_extent_valid()
                    && !child.is_extent_stable()
                {
                    self.violation(
                        "Stable node links a pending child",
                        format!("pos {pos}, {}", context()),
                    );
                }
            }
        }
    }

    /// Tracker agreement for every child of `node`.
    pub fn check_children<P: ParentNode>(&mut self, node: &Arc<P>) {
        let size = node.size();
        for pos in 0..size {
            if let Some(child) = node.slot(pos).child() {
                if !child.is_extent_valid() {
                    continue;
                }
                let Some(tracker) = child.peek_tracker() else {
                    continue;
                };
                // Children of a donor that moved on are checked with their
                // new parent.
                if Arc::ptr_eq(&tracker.get_parent(), node) {
                    self.check_tracker_agreement(child.as_ref());
                }
            }
        }
    }

    /// Run every per-node check on `node`.
    pub fn check_node<P: ParentNode>(&mut self, node: &Arc<P>) {
        self.check_state_invariants(node);
        self.check_children(node);
        if node.is_pending() {
            self.check_copy_symmetry(node);
        }
    }

    /// Log every violation and abort if there were any.
    pub fn assert_clean(&self) {
        for violation in &self.violations {
            tracing::error!("{}: {}", violation.description, violation.context);
        }
        assert!(
            self.violations.is_empty(),
            "{} linkage invariant violations",
            self.violations.len()
        );
    }
}
