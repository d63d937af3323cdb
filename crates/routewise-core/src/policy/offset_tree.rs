//! Offset Tree bandit
//!
//! A binary tree over the context space. Internal nodes compare one feature
//! against a threshold (`x[feature] <= threshold` goes left); every leaf owns
//! an independent [`ThompsonSamplingBandit`].
//!
//! ## Splitting
//!
//! Each leaf buffers its recent observations. Every time a leaf's sample count
//! reaches a multiple of `min_samples_split`, all (feature, threshold) pairs
//! are scored by how much they reduce per-arm reward impurity (variance, or
//! binary entropy of "success" for information gain). Thresholds are midpoints
//! between consecutive distinct feature values. The best pair splits the leaf
//! when its gain exceeds `split_threshold` and the leaf is shallower than
//! `max_depth`.
//!
//! Ties go to the lowest feature index, then the lowest threshold. The two
//! fresh leaves start with no samples and with arm priors derived from the
//! parent's posteriors.
//!
//! Nodes live in an arena. Leaves are reference counted so cloning the tree
//! for a copy-on-write update only copies the leaf being changed.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

use super::thompson::{ThompsonConfig, ThompsonSamplingBandit};
use super::types::{ArmSummary, ArmTable, Context, RewardTally};
use super::{
    BanditPolicy, PolicyDiagnostics, PolicyType, ensure, validate_propensity, validate_request,
};
use crate::error::Result;

/// Gains closer than this are treated as equal
const GAIN_EPSILON: f64 = 1e-12;

/// Impurity measure used to score candidate splits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitStrategy {
    #[default]
    VarianceReduction,
    InformationGain,
}

/// Configuration for [`OffsetTreeBandit`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OffsetTreeConfig {
    /// Context length; must be positive
    pub dim: usize,
    /// Leaves at this depth never split (the root is depth 0)
    pub max_depth: usize,
    /// Leaf sample count between split evaluations
    pub min_samples_split: u64,
    /// Minimum buffered observations on each side of a split
    pub min_samples_leaf: usize,
    /// Gain a split must exceed to be applied
    pub split_threshold: f64,
    pub split_strategy: SplitStrategy,
    /// Pseudo-count given to the parent's posterior mean in child priors
    pub prior_strength: f64,
    /// Observations kept per leaf for split evaluation
    pub max_leaf_buffer: usize,
    /// Leaf bandit settings; its `dim` must be 0 or equal to the tree's
    pub base: ThompsonConfig,
}

impl Default for OffsetTreeConfig {
    fn default() -> Self {
        Self {
            dim: 1,
            max_depth: 4,
            min_samples_split: 50,
            min_samples_leaf: 5,
            split_threshold: 0.01,
            split_strategy: SplitStrategy::VarianceReduction,
            prior_strength: 5.0,
            max_leaf_buffer: 1000,
            base: ThompsonConfig::default(),
        }
    }
}

impl OffsetTreeConfig {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            ..Default::default()
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_min_samples_split(mut self, samples: u64) -> Self {
        self.min_samples_split = samples;
        self
    }

    pub fn with_min_samples_leaf(mut self, samples: usize) -> Self {
        self.min_samples_leaf = samples;
        self
    }

    pub fn with_split_threshold(mut self, threshold: f64) -> Self {
        self.split_threshold = threshold;
        self
    }

    pub fn with_split_strategy(mut self, strategy: SplitStrategy) -> Self {
        self.split_strategy = strategy;
        self
    }

    pub fn with_base(mut self, base: ThompsonConfig) -> Self {
        self.base = base;
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure(self.dim > 0, || "offset_tree requires dim > 0".to_string())?;
        ensure(self.min_samples_split >= 2, || {
            format!(
                "min_samples_split must be >= 2, got {}",
                self.min_samples_split
            )
        })?;
        ensure(self.min_samples_leaf >= 1, || {
            "min_samples_leaf must be >= 1".to_string()
        })?;
        ensure(
            self.max_leaf_buffer as u64 >= self.min_samples_split,
            || {
                format!(
                    "max_leaf_buffer ({}) must hold at least min_samples_split ({}) observations",
                    self.max_leaf_buffer, self.min_samples_split
                )
            },
        )?;
        ensure(
            self.split_threshold.is_finite() && self.split_threshold >= 0.0,
            || format!("split_threshold must be non-negative, got {}", self.split_threshold),
        )?;
        ensure(
            self.prior_strength.is_finite() && self.prior_strength >= 0.0,
            || format!("prior_strength must be non-negative, got {}", self.prior_strength),
        )?;
        ensure(self.base.dim == 0 || self.base.dim == self.dim, || {
            format!(
                "base dim {} does not match tree dim {}",
                self.base.dim, self.dim
            )
        })?;
        self.base.validate()
    }

    fn leaf_config(&self) -> ThompsonConfig {
        ThompsonConfig {
            dim: self.dim,
            ..self.base.clone()
        }
    }
}

/// A split applied to the tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitRecord {
    /// Arena index of the node that became internal
    pub node: usize,
    pub depth: usize,
    pub feature: usize,
    pub feature_name: String,
    pub threshold: f64,
    pub gain: f64,
    /// Leaf sample count when the split was applied
    pub samples: u64,
}

#[derive(Debug, Clone)]
struct Observation {
    features: Arc<[f64]>,
    arm: Arc<str>,
    /// Reward normalized onto [0, 1]
    reward: f64,
}

#[derive(Debug, Clone)]
struct Leaf {
    bandit: ThompsonSamplingBandit,
    samples: u64,
    buffer: VecDeque<Observation>,
}

impl Leaf {
    fn new(bandit: ThompsonSamplingBandit) -> Self {
        Self {
            bandit,
            samples: 0,
            buffer: VecDeque::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum NodeKind {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    /// Index into the leaf slots
    Leaf(usize),
}

#[derive(Debug, Clone, Copy)]
struct Node {
    depth: usize,
    kind: NodeKind,
}

#[derive(Debug, Clone, Copy)]
struct SplitCandidate {
    feature: usize,
    threshold: f64,
    gain: f64,
}

/// Per-arm reward aggregate used while scoring splits
#[derive(Debug, Clone, Copy, Default)]
struct Aggregate {
    count: u64,
    sum: f64,
    sum_sq: f64,
    successes: u64,
}

impl Aggregate {
    fn add(&mut self, reward: f64) {
        self.count += 1;
        self.sum += reward;
        self.sum_sq += reward * reward;
        if reward > 0.5 {
            self.successes += 1;
        }
    }

    fn minus(&self, other: &Aggregate) -> Aggregate {
        Aggregate {
            count: self.count - other.count,
            sum: self.sum - other.sum,
            sum_sq: self.sum_sq - other.sum_sq,
            successes: self.successes - other.successes,
        }
    }

    fn variance(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let n = self.count as f64;
        let mean = self.sum / n;
        (self.sum_sq / n - mean * mean).max(0.0)
    }

    fn entropy(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let p = self.successes as f64 / self.count as f64;
        [p, 1.0 - p]
            .iter()
            .filter(|&&q| q > 0.0)
            .map(|&q| -q * q.log2())
            .sum()
    }
}

fn impurity(aggregates: &[Aggregate], strategy: SplitStrategy) -> f64 {
    let total: u64 = aggregates.iter().map(|a| a.count).sum();
    if total == 0 {
        return 0.0;
    }
    aggregates
        .iter()
        .filter(|a| a.count > 0)
        .map(|a| {
            let share = a.count as f64 / total as f64;
            let measure = match strategy {
                SplitStrategy::VarianceReduction => a.variance(),
                SplitStrategy::InformationGain => a.entropy(),
            };
            share * measure
        })
        .sum()
}

/// Find the highest-gain split of `observations`, if any is admissible
fn best_split(
    observations: &VecDeque<Observation>,
    dim: usize,
    min_samples_leaf: usize,
    strategy: SplitStrategy,
) -> Option<SplitCandidate> {
    let n = observations.len();
    if n < 2 * min_samples_leaf {
        return None;
    }

    let mut arm_ids: HashMap<&str, usize> = HashMap::new();
    let arm_of: Vec<usize> = observations
        .iter()
        .map(|o| {
            let next = arm_ids.len();
            *arm_ids.entry(&*o.arm).or_insert(next)
        })
        .collect();

    let mut parent = vec![Aggregate::default(); arm_ids.len()];
    for (obs, &arm) in observations.iter().zip(&arm_of) {
        parent[arm].add(obs.reward);
    }
    let parent_impurity = impurity(&parent, strategy);

    let mut best: Option<SplitCandidate> = None;
    for feature in 0..dim {
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| {
            observations[a].features[feature].total_cmp(&observations[b].features[feature])
        });

        let mut left = vec![Aggregate::default(); parent.len()];
        for pos in 0..n - 1 {
            let idx = order[pos];
            left[arm_of[idx]].add(observations[idx].reward);

            let value = observations[idx].features[feature];
            let next = observations[order[pos + 1]].features[feature];
            if next <= value {
                continue;
            }

            let left_count = pos + 1;
            let right_count = n - left_count;
            if left_count < min_samples_leaf || right_count < min_samples_leaf {
                continue;
            }

            let right: Vec<Aggregate> = parent
                .iter()
                .zip(&left)
                .map(|(p, l)| p.minus(l))
                .collect();
            let gain = parent_impurity
                - (left_count as f64 / n as f64) * impurity(&left, strategy)
                - (right_count as f64 / n as f64) * impurity(&right, strategy);

            if best.is_none_or(|b| gain > b.gain + GAIN_EPSILON) {
                best = Some(SplitCandidate {
                    feature,
                    threshold: value + (next - value) / 2.0,
                    gain,
                });
            }
        }
    }

    best
}

/// Context-partitioning bandit with Thompson leaves
#[derive(Debug, Clone)]
pub struct OffsetTreeBandit {
    config: OffsetTreeConfig,
    nodes: Vec<Node>,
    leaves: Vec<Arc<Leaf>>,
    splits: Vec<SplitRecord>,
    arm_totals: ArmTable<RewardTally>,
    total_updates: u64,
}

impl OffsetTreeBandit {
    /// Create a single-leaf tree; `config` is assumed validated
    pub fn new(config: OffsetTreeConfig) -> Self {
        let root = Leaf::new(ThompsonSamplingBandit::new(config.leaf_config()));
        Self {
            config,
            nodes: vec![Node {
                depth: 0,
                kind: NodeKind::Leaf(0),
            }],
            leaves: vec![Arc::new(root)],
            splits: Vec::new(),
            arm_totals: ArmTable::new(),
            total_updates: 0,
        }
    }

    pub fn config(&self) -> &OffsetTreeConfig {
        &self.config
    }

    /// Splits applied so far, in order
    pub fn splits(&self) -> &[SplitRecord] {
        &self.splits
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Depth of the deepest leaf
    pub fn depth(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Leaf(_)))
            .map(|n| n.depth)
            .max()
            .unwrap_or(0)
    }

    /// Samples seen by the leaf that `context` routes to since it was created
    pub fn leaf_samples(&self, context: &Context) -> Result<u64> {
        context.validate(self.config.dim)?;
        let (_, slot) = self.locate(context.values());
        Ok(self.leaves[slot].samples)
    }

    /// Walk from the root to the leaf owning `features`
    ///
    /// Returns the arena index of the leaf node and its leaf slot.
    fn locate(&self, features: &[f64]) -> (usize, usize) {
        let mut idx = 0;
        loop {
            match self.nodes[idx].kind {
                NodeKind::Leaf(slot) => return (idx, slot),
                NodeKind::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if features[feature] <= threshold {
                        left
                    } else {
                        right
                    };
                }
            }
        }
    }

    fn try_split(&mut self, node: usize, slot: usize, names: &[String]) {
        let depth = self.nodes[node].depth;
        let parent = Arc::clone(&self.leaves[slot]);

        let Some(candidate) = best_split(
            &parent.buffer,
            self.config.dim,
            self.config.min_samples_leaf,
            self.config.split_strategy,
        ) else {
            debug!(node, samples = parent.samples, "No admissible split");
            return;
        };

        if candidate.gain <= self.config.split_threshold {
            debug!(
                node,
                gain = candidate.gain,
                threshold = self.config.split_threshold,
                "Best split below threshold"
            );
            return;
        }

        let child = || {
            Arc::new(Leaf::new(ThompsonSamplingBandit::inherit(
                &parent.bandit,
                self.config.prior_strength,
            )))
        };
        let (left_leaf, right_leaf) = (child(), child());

        self.leaves[slot] = left_leaf;
        self.leaves.push(right_leaf);
        let right_slot = self.leaves.len() - 1;

        let left = self.nodes.len();
        self.nodes.push(Node {
            depth: depth + 1,
            kind: NodeKind::Leaf(slot),
        });
        self.nodes.push(Node {
            depth: depth + 1,
            kind: NodeKind::Leaf(right_slot),
        });
        self.nodes[node].kind = NodeKind::Split {
            feature: candidate.feature,
            threshold: candidate.threshold,
            left,
            right: left + 1,
        };

        let record = SplitRecord {
            node,
            depth,
            feature: candidate.feature,
            feature_name: names
                .get(candidate.feature)
                .cloned()
                .unwrap_or_else(|| format!("x{}", candidate.feature)),
            threshold: candidate.threshold,
            gain: candidate.gain,
            samples: parent.samples,
        };
        info!(
            node,
            depth,
            feature = %record.feature_name,
            threshold = record.threshold,
            gain = record.gain,
            "Split offset tree leaf"
        );
        self.splits.push(record);
    }
}

impl BanditPolicy for OffsetTreeBandit {
    fn policy_type(&self) -> PolicyType {
        PolicyType::OffsetTree
    }

    fn dim(&self) -> usize {
        self.config.dim
    }

    fn recommend(
        &self,
        context: &Context,
        candidates: &[&str],
        rng: &mut dyn RngCore,
    ) -> Result<String> {
        validate_request(context, self.config.dim, candidates)?;
        let (_, slot) = self.locate(context.values());
        self.leaves[slot].bandit.recommend(context, candidates, rng)
    }

    fn update(
        &mut self,
        arm: &str,
        reward: f64,
        context: &Context,
        propensity: Option<f64>,
    ) -> Result<()> {
        context.validate(self.config.dim)?;
        validate_propensity(propensity)?;
        let bounds = self.config.base.reward_bounds;
        let reward = bounds.apply(reward)?;

        let (node, slot) = self.locate(context.values());
        let leaf = Arc::make_mut(&mut self.leaves[slot]);
        leaf.bandit.update(arm, reward, context, None)?;
        leaf.samples += 1;
        leaf.buffer.push_back(Observation {
            features: Arc::from(context.values()),
            arm: Arc::from(arm),
            reward: bounds.normalize(reward),
        });
        if leaf.buffer.len() > self.config.max_leaf_buffer {
            leaf.buffer.pop_front();
        }
        let samples = leaf.samples;

        self.arm_totals
            .get_or_insert_with(arm, RewardTally::default)
            .observe(reward);
        self.total_updates += 1;

        if samples % self.config.min_samples_split == 0
            && self.nodes[node].depth < self.config.max_depth
        {
            self.try_split(node, slot, context.names());
        }
        Ok(())
    }

    fn total_updates(&self) -> u64 {
        self.total_updates
    }

    /// Leaf posterior means averaged with weight `1 + leaf samples`
    fn expected_values(&self) -> HashMap<String, f64> {
        let mut weighted: HashMap<String, (f64, f64)> = HashMap::new();
        for leaf in &self.leaves {
            let weight = 1.0 + leaf.samples as f64;
            for (arm, value) in leaf.bandit.expected_values() {
                let entry = weighted.entry(arm).or_insert((0.0, 0.0));
                entry.0 += weight * value;
                entry.1 += weight;
            }
        }
        weighted
            .into_iter()
            .map(|(arm, (sum, weight))| (arm, sum / weight))
            .collect()
    }

    fn arm_summaries(&self) -> Vec<ArmSummary> {
        self.arm_totals
            .iter()
            .map(|(arm, tally)| tally.summary(arm))
            .collect()
    }

    fn diagnostics(&self) -> PolicyDiagnostics {
        PolicyDiagnostics::OffsetTree {
            depth: self.depth(),
            leaf_count: self.leaves.len(),
            node_count: self.nodes.len(),
            splits: self.splits.clone(),
        }
    }
}
