//! Deterministic simulation of transactions over one tree level.
//!
//! A row of contiguous stable nodes indexes one leaf per key. Each round
//! opens a transaction, applies a random mix of splits, merges, balances
//! and mutations, checks that every key still resolves to its leaf, then
//! commits or aborts. The same seed always produces the same run.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{TestLeaf, TestNode, TestRetriever};
use crate::child::{BaseChild, ChildSlot, GetChild};
use crate::extent::{CachedExtent, TreeExtent};
use crate::parent::ParentNode;
use crate::transaction::{TransId, Transaction};
use crate::validate::LinkageChecker;

const NODE_SPAN: u64 = 100;
const MAX_NODE_SIZE: usize = 12;

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub seed: u64,
    pub nodes: usize,
    pub keys_per_node: usize,
    pub max_ops_per_round: usize,
    /// Probability that a round aborts instead of committing.
    pub abort_rate: f64,
}

impl SimulationConfig {
    pub const fn new(seed: u64) -> Self {
        Self {
            seed,
            nodes: 4,
            keys_per_node: 4,
            max_ops_per_round: 4,
            abort_rate: 0.2,
        }
    }

    pub const fn with_abort_rate(mut self, rate: f64) -> Self {
        self.abort_rate = rate;
        self
    }

    pub const fn with_max_ops(mut self, ops: usize) -> Self {
        self.max_ops_per_round = ops;
        self
    }
}

#[derive(Debug, Default, Clone)]
pub struct SimulationStats {
    pub splits: usize,
    pub merges: usize,
    pub balances: usize,
    pub inserts: usize,
    pub removes: usize,
    pub commits: usize,
    pub aborts: usize,
}

/// State of the transaction in flight.
struct Round {
    t: Transaction,
    working: Vec<Arc<TestNode>>,
    /// Stable nodes retired or mutated in this round.
    touched: Vec<Arc<TestNode>>,
    inserted: Vec<Arc<TestLeaf>>,
    removed: Vec<u64>,
}

pub struct LevelSimulator {
    config: SimulationConfig,
    rng: StdRng,
    level: Vec<Arc<TestNode>>,
    leaves: BTreeMap<u64, Arc<TestLeaf>>,
    etvr: TestRetriever,
    next_trans: TransId,
    stats: SimulationStats,
}

impl LevelSimulator {
    pub fn new(config: SimulationConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut level = Vec::with_capacity(config.nodes);
        let mut leaves = BTreeMap::new();
        for i in 0..config.nodes as u64 {
            let begin = i * NODE_SPAN;
            // The first key of a node is its begin key.
            let mut keys = vec![begin];
            while keys.len() < config.keys_per_node {
                let key = rng.random_range(begin + 1..begin + NODE_SPAN);
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
            keys.sort_unstable();
            let node = TestNode::stable(begin, begin + NODE_SPAN, &keys);
            for (pos, &key) in keys.iter().enumerate() {
                let leaf = TestLeaf::stable(key);
                node.link_child(&leaf, pos);
                leaves.insert(key, leaf);
            }
            level.push(node);
        }
        Self {
            config,
            rng,
            level,
            leaves,
            etvr: TestRetriever::new(),
            next_trans: 1,
            stats: SimulationStats::default(),
        }
    }

    pub const fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    pub fn level(&self) -> &[Arc<TestNode>] {
        &self.level
    }

    /// Run `rounds` transactions, checking the level after each.
    pub async fn run(&mut self, rounds: usize) {
        for _ in 0..rounds {
            self.round().await;
            self.check_level();
        }
        tracing::debug!("seed {} finished: {:?}", self.config.seed, self.stats);
    }

    async fn round(&mut self) {
        let t = Transaction::new(self.next_trans);
        self.next_trans += 1;
        let mut round = Round {
            t,
            working: self.level.clone(),
            touched: Vec::new(),
            inserted: Vec::new(),
            removed: Vec::new(),
        };
        let ops = self.rng.random_range(1..=self.config.max_ops_per_round);
        for _ in 0..ops {
            match self.rng.random_range(0..5) {
                0 => self.split(&mut round),
                1 => self.merge(&mut round),
                2 => self.balance(&mut round),
                3 => self.insert(&mut round),
                _ => self.remove(&mut round),
            }
        }
        self.check_pending(&round).await;

        if self.rng.random::<f64>() < self.config.abort_rate {
            self.abort(round);
        } else {
            self.commit(round);
        }
    }

    fn pick(&mut self, candidates: &[usize]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(candidates[self.rng.random_range(0..candidates.len())])
    }

    /// Stable nodes go away in this transaction once replaced.
    fn retire(round: &mut Round, node: &Arc<TestNode>) {
        if node.is_stable() {
            node.retire(&round.t);
            round.touched.push(Arc::clone(node));
        }
    }

    fn split(&mut self, round: &mut Round) {
        let candidates: Vec<usize> = (0..round.working.len())
            .filter(|&i| {
                let node = &round.working[i];
                !node.is_mutation_pending() && node.size() >= 2
            })
            .collect();
        let Some(i) = self.pick(&candidates) else {
            return;
        };
        let node = Arc::clone(&round.working[i]);
        let keys = node.keys();
        let pivot = node.split_pivot();
        let left = TestNode::initial_pending(&round.t, node.begin(), keys[pivot], &keys[..pivot]);
        let right = TestNode::initial_pending(&round.t, keys[pivot], node.end(), &keys[pivot..]);
        Self::retire(round, &node);
        node.split_child_ptrs(&round.t, &left, &right);
        node.adjust_copy_src_dest_on_split(&round.t, &left, &right);
        round.working[i] = left;
        round.working.insert(i + 1, right);
        self.stats.splits += 1;
    }

    fn mergeable_pairs(round: &Round, fits: impl Fn(usize, usize) -> bool) -> Vec<usize> {
        (0..round.working.len().saturating_sub(1))
            .filter(|&i| {
                let (left, right) = (&round.working[i], &round.working[i + 1]);
                !left.is_mutation_pending()
                    && !right.is_mutation_pending()
                    && fits(left.size(), right.size())
            })
            .collect()
    }

    fn merge(&mut self, round: &mut Round) {
        let candidates = Self::mergeable_pairs(round, |l, r| l + r <= MAX_NODE_SIZE);
        let Some(i) = self.pick(&candidates) else {
            return;
        };
        let left = Arc::clone(&round.working[i]);
        let right = Arc::clone(&round.working[i + 1]);
        let mut keys = left.keys();
        keys.extend(right.keys());
        let merged = TestNode::initial_pending(&round.t, left.begin(), right.end(), &keys);
        Self::retire(round, &left);
        Self::retire(round, &right);
        merged.merge_child_ptrs(&round.t, &left, &right);
        merged.adjust_copy_src_dest_on_merge(&round.t, &left, &right);
        round.working[i] = merged;
        drop(round.working.remove(i + 1));
        self.stats.merges += 1;
    }

    fn balance(&mut self, round: &mut Round) {
        let candidates = Self::mergeable_pairs(round, |l, r| {
            let pivot = (l + r) / 2;
            pivot != l && pivot != r
        });
        let Some(i) = self.pick(&candidates) else {
            return;
        };
        let left = Arc::clone(&round.working[i]);
        let right = Arc::clone(&round.working[i + 1]);
        let pivot = (left.size() + right.size()) / 2;
        let mut keys = left.keys();
        keys.extend(right.keys());
        let new_left = TestNode::initial_pending(&round.t, left.begin(), keys[pivot], &keys[..pivot]);
        let new_right = TestNode::initial_pending(&round.t, keys[pivot], right.end(), &keys[pivot..]);
        Self::retire(round, &left);
        Self::retire(round, &right);
        TestNode::balance_child_ptrs(&round.t, &left, &right, pivot, &new_left, &new_right);
        TestNode::adjust_copy_src_dest_on_balance(&round.t, &left, &right, pivot, &new_left, &new_right);
        round.working[i] = new_left;
        round.working[i + 1] = new_right;
        self.stats.balances += 1;
    }

    /// The mutation-pending version of `working[i]`, creating it from the
    /// stable node if needed.
    fn mutable(round: &mut Round, i: usize) -> Arc<TestNode> {
        let node = Arc::clone(&round.working[i]);
        if node.is_mutation_pending() {
            return node;
        }
        let mutated = TestNode::mutation_of(&round.t, &node);
        round.touched.push(node);
        round.working[i] = Arc::clone(&mutated);
        mutated
    }

    fn mutable_candidates(round: &Round, min_size: usize) -> Vec<usize> {
        (0..round.working.len())
            .filter(|&i| {
                let node = &round.working[i];
                (node.is_stable() || node.is_mutation_pending()) && node.size() >= min_size
            })
            .collect()
    }

    fn insert(&mut self, round: &mut Round) {
        let candidates = Self::mutable_candidates(round, 0);
        let Some(i) = self.pick(&candidates) else {
            return;
        };
        let (begin, end) = (round.working[i].begin(), round.working[i].end());
        let existing = round.working[i].keys();
        let Some(key) = (0..8)
            .map(|_| self.rng.random_range(begin..end))
            .find(|key| !existing.contains(key))
        else {
            return;
        };
        let node = Self::mutable(round, i);
        let leaf = TestLeaf::initial_pending(&round.t, key);
        let pos = node.lower_bound(key);
        node.insert_child_ptr(pos, ChildSlot::from_child(&leaf), None);
        node.insert_key(pos, key);
        round.inserted.push(leaf);
        self.stats.inserts += 1;
    }

    fn remove(&mut self, round: &mut Round) {
        let candidates = Self::mutable_candidates(round, 2);
        let Some(i) = self.pick(&candidates) else {
            return;
        };
        let pos = self.rng.random_range(0..round.working[i].size());
        let node = Self::mutable(round, i);
        let key = node.key_at(pos);
        node.remove_child_ptr(pos);
        node.remove_key(pos);
        if let Some(idx) = round.inserted.iter().position(|leaf| leaf.begin() == key) {
            round.inserted.remove(idx);
        } else {
            round.removed.push(key);
        }
        self.stats.removes += 1;
    }

    fn covering(nodes: &[Arc<TestNode>], key: u64) -> Option<&Arc<TestNode>> {
        nodes.iter().find(|node| node.is_in_range(key))
    }

    /// Checks made while the transaction is still open.
    async fn check_pending(&self, round: &Round) {
        let t = &round.t;
        let mut checker = LinkageChecker::new();
        for node in &round.working {
            checker.check_node(node);
            for pos in 0..node.size() {
                let key = node.key_at(pos);
                let GetChild::Child(resolving) = node.get_child::<TestLeaf>(t, &self.etvr, pos, key)
                else {
                    panic!("key {key} of {node:?} has no loaded child");
                };
                let leaf = resolving.await.unwrap();
                assert_eq!(leaf.begin(), key);
            }
        }
        for stable in &round.touched {
            checker.check_stable_copy_dests(stable, t.trans_id());
            for key in stable.keys() {
                if round.removed.contains(&key) {
                    continue;
                }
                let (viewable, pending) = stable.resolve_transaction(t, key);
                assert!(!viewable, "{stable:?} is still visible to {t:?}");
                let expected = Self::covering(&round.working, key).unwrap();
                assert!(
                    Arc::ptr_eq(&pending, expected),
                    "key {key} resolved to {pending:?}, expected {expected:?}"
                );
            }
        }
        checker.assert_clean();
    }

    fn commit(&mut self, round: Round) {
        let Round {
            t,
            working,
            touched,
            inserted,
            removed,
        } = round;
        for node in &working {
            if node.is_mutation_pending() {
                node.replace_prior_children();
            } else if node.is_initial_pending() {
                node.prepare_commit();
            }
        }
        for node in working.iter().filter(|node| node.is_pending()) {
            node.complete_commit();
        }
        for node in &touched {
            node.invalidate();
        }
        for key in removed {
            if let Some(leaf) = self.leaves.remove(&key) {
                leaf.invalidate();
            }
        }
        for leaf in inserted {
            leaf.complete_commit();
            self.leaves.insert(leaf.begin(), leaf);
        }
        let trans_id = t.trans_id();
        drop(t);
        for node in &touched {
            assert!(node.copy_dests(trans_id).is_empty());
        }
        self.level = working;
        self.stats.commits += 1;
    }

    fn abort(&mut self, round: Round) {
        let trans_id = round.t.trans_id();
        drop(round.working);
        drop(round.inserted);
        drop(round.t);
        for node in &round.touched {
            node.forget_transaction(trans_id);
            assert!(node.copy_dests(trans_id).is_empty());
        }
        self.stats.aborts += 1;
    }

    /// The committed level covers the key space and links every leaf.
    fn check_level(&self) {
        let mut checker = LinkageChecker::new();
        let mut expected_begin = 0;
        let mut keys = Vec::new();
        for node in &self.level {
            assert!(node.is_stable(), "{node:?} left pending");
            assert_eq!(node.begin(), expected_begin, "gap before {node:?}");
            expected_begin = node.end();
            checker.check_node(node);
            for (pos, key) in node.keys().into_iter().enumerate() {
                let slot = node.slot(pos);
                assert!(slot.child().is_some(), "key {key} of {node:?} lost its child");
                let leaf = &self.leaves[&key];
                assert!(
                    slot.points_to(Arc::as_ptr(leaf).cast()),
                    "key {key} links a stale leaf"
                );
                keys.push(key);
            }
        }
        assert_eq!(expected_begin, self.config.nodes as u64 * NODE_SPAN);
        assert!(keys.iter().eq(self.leaves.keys()));

        for (key, leaf) in &self.leaves {
            assert!(leaf.is_stable());
            checker.check_tracker_agreement::<TestNode>(&**leaf);
            let parent = leaf.peek_tracker().map(|tracker| tracker.get_parent());
            let expected = Self::covering(&self.level, *key);
            assert!(
                parent
                    .as_ref()
                    .zip(expected)
                    .is_some_and(|(parent, node)| Arc::ptr_eq(parent, node)),
                "leaf {key} tracks {parent:?}"
            );
        }
        checker.assert_clean();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::init_tracing;

    #[tokio::test]
    async fn test_simulation_single_seed() {
        init_tracing();
        let mut sim = LevelSimulator::new(SimulationConfig::new(42));
        sim.run(50).await;
        let stats = sim.stats();
        assert_eq!(stats.commits + stats.aborts, 50);
        assert!(stats.splits > 0);
        assert!(stats.merges > 0);
    }

    #[tokio::test]
    async fn test_simulation_multiple_seeds() {
        for seed in 0..20 {
            let mut sim = LevelSimulator::new(SimulationConfig::new(seed));
            sim.run(30).await;
        }
    }

    #[tokio::test]
    async fn test_simulation_commits_only() {
        let config = SimulationConfig::new(7).with_abort_rate(0.0).with_max_ops(8);
        let mut sim = LevelSimulator::new(config);
        sim.run(40).await;
        assert_eq!(sim.stats().aborts, 0);
    }

    #[tokio::test]
    async fn test_aborted_rounds_leave_level_untouched() {
        let config = SimulationConfig::new(3).with_abort_rate(1.0).with_max_ops(8);
        let mut sim = LevelSimulator::new(config);
        let before: Vec<_> = sim.level().to_vec();
        sim.run(25).await;
        assert_eq!(sim.stats().commits, 0);
        assert_eq!(sim.level().len(), before.len());
        for (node, original) in sim.level().iter().zip(&before) {
            assert!(Arc::ptr_eq(node, original));
            assert!(node.has_tracker());
        }
    }

    #[tokio::test]
    async fn test_simulation_is_deterministic() {
        let shape = |sim: &LevelSimulator| -> Vec<(u64, Vec<u64>)> {
            sim.level().iter().map(|node| (node.begin(), node.keys())).collect()
        };
        let mut a = LevelSimulator::new(SimulationConfig::new(99));
        let mut b = LevelSimulator::new(SimulationConfig::new(99));
        a.run(20).await;
        b.run(20).await;
        assert_eq!(shape(&a), shape(&b));
        assert!(a.leaves.values().all(|leaf| leaf.has_parent_tracker()));
    }
}
