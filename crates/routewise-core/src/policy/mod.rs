//! Bandit policies
//!
//! Every learning strategy implements [`BanditPolicy`]:
//!
//! - **Thompson Sampling**: context-free Beta posteriors per arm; also the
//!   leaf learner of the offset tree.
//! - **Doubly Robust**: per-arm online linear reward regression with
//!   importance-weighted, variance-capped updates.
//! - **Offset Tree**: a binary partition of the context space whose leaves
//!   each own an independent Thompson bandit.
//!
//! Policies are selected explicitly at registration time through the closed
//! [`Policy`] enum, built from a validated [`PolicyConfig`].
//!
//! `recommend` never mutates a policy. Randomness is injected by the caller so
//! a seeded source makes every choice reproducible.

mod doubly_robust;
mod offset_tree;
mod thompson;
mod types;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};

pub use doubly_robust::{DoublyRobustBandit, DoublyRobustConfig};
pub use offset_tree::{OffsetTreeBandit, OffsetTreeConfig, SplitRecord, SplitStrategy};
pub use thompson::{ArmStats, ThompsonConfig, ThompsonSamplingBandit};
pub use types::{ArmSummary, ArmTable, Context, OutOfRange, RewardBounds, RewardTally};

pub(crate) use types::{validate_propensity, validate_request};

/// Common contract of every learning strategy
pub trait BanditPolicy: Send + Sync {
    /// Which strategy this is
    fn policy_type(&self) -> PolicyType;

    /// Context dimensionality the policy was configured with
    fn dim(&self) -> usize;

    /// Pick one of `candidates` for `context` (pure read of the parameters)
    fn recommend(
        &self,
        context: &Context,
        candidates: &[&str],
        rng: &mut dyn RngCore,
    ) -> Result<String>;

    /// Learn from an observed outcome
    ///
    /// Inputs are validated before any state changes, so a failed update
    /// leaves the policy untouched. `propensity` is the probability with which
    /// the logging policy served `arm`, when known.
    fn update(
        &mut self,
        arm: &str,
        reward: f64,
        context: &Context,
        propensity: Option<f64>,
    ) -> Result<()>;

    /// Number of successful updates applied
    fn total_updates(&self) -> u64;

    /// Expected reward per known arm
    fn expected_values(&self) -> HashMap<String, f64>;

    /// Observed reward aggregates per known arm, in first-seen order
    fn arm_summaries(&self) -> Vec<ArmSummary>;

    /// Policy-specific diagnostics
    fn diagnostics(&self) -> PolicyDiagnostics;
}

/// Available policy strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyType {
    ThompsonSampling,
    DoublyRobust,
    OffsetTree,
}

impl std::fmt::Display for PolicyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ThompsonSampling => write!(f, "thompson_sampling"),
            Self::DoublyRobust => write!(f, "doubly_robust"),
            Self::OffsetTree => write!(f, "offset_tree"),
        }
    }
}

impl std::str::FromStr for PolicyType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "thompson_sampling" | "thompson" => Ok(Self::ThompsonSampling),
            "doubly_robust" | "dr" => Ok(Self::DoublyRobust),
            "offset_tree" | "tree" => Ok(Self::OffsetTree),
            _ => Err(format!("Unknown policy type: {}", s)),
        }
    }
}

/// Policy selection plus its configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyConfig {
    ThompsonSampling(ThompsonConfig),
    DoublyRobust(DoublyRobustConfig),
    OffsetTree(OffsetTreeConfig),
}

impl PolicyConfig {
    pub fn policy_type(&self) -> PolicyType {
        match self {
            Self::ThompsonSampling(_) => PolicyType::ThompsonSampling,
            Self::DoublyRobust(_) => PolicyType::DoublyRobust,
            Self::OffsetTree(_) => PolicyType::OffsetTree,
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            Self::ThompsonSampling(c) => c.dim,
            Self::DoublyRobust(c) => c.dim,
            Self::OffsetTree(c) => c.dim,
        }
    }

    /// Reject invalid parameter combinations
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::ThompsonSampling(c) => c.validate(),
            Self::DoublyRobust(c) => c.validate(),
            Self::OffsetTree(c) => c.validate(),
        }
    }

    /// Build a fresh policy instance
    pub fn build(&self) -> Result<Policy> {
        Policy::from_config(self)
    }
}

impl From<ThompsonConfig> for PolicyConfig {
    fn from(config: ThompsonConfig) -> Self {
        Self::ThompsonSampling(config)
    }
}

impl From<DoublyRobustConfig> for PolicyConfig {
    fn from(config: DoublyRobustConfig) -> Self {
        Self::DoublyRobust(config)
    }
}

impl From<OffsetTreeConfig> for PolicyConfig {
    fn from(config: OffsetTreeConfig) -> Self {
        Self::OffsetTree(config)
    }
}

/// Beta posterior parameters for one arm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetaPosterior {
    pub arm: String,
    pub alpha: f64,
    pub beta: f64,
}

/// Policy-specific diagnostics included in stats snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum PolicyDiagnostics {
    ThompsonSampling {
        posteriors: Vec<BetaPosterior>,
    },
    DoublyRobust {
        weights: BTreeMap<String, Vec<f64>>,
        mean_abs_residual: f64,
        current_learning_rate: f64,
    },
    OffsetTree {
        depth: usize,
        leaf_count: usize,
        node_count: usize,
        splits: Vec<SplitRecord>,
    },
}

/// A policy instance owned by one domain or experiment variant
#[derive(Debug, Clone)]
pub enum Policy {
    ThompsonSampling(ThompsonSamplingBandit),
    DoublyRobust(DoublyRobustBandit),
    OffsetTree(OffsetTreeBandit),
}

impl Policy {
    /// Validate `config` and build the matching policy
    pub fn from_config(config: &PolicyConfig) -> Result<Self> {
        config.validate()?;
        Ok(match config {
            PolicyConfig::ThompsonSampling(c) => {
                Self::ThompsonSampling(ThompsonSamplingBandit::new(c.clone()))
            }
            PolicyConfig::DoublyRobust(c) => Self::DoublyRobust(DoublyRobustBandit::new(c.clone())),
            PolicyConfig::OffsetTree(c) => Self::OffsetTree(OffsetTreeBandit::new(c.clone())),
        })
    }

    fn inner(&self) -> &dyn BanditPolicy {
        match self {
            Self::ThompsonSampling(p) => p,
            Self::DoublyRobust(p) => p,
            Self::OffsetTree(p) => p,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn BanditPolicy {
        match self {
            Self::ThompsonSampling(p) => p,
            Self::DoublyRobust(p) => p,
            Self::OffsetTree(p) => p,
        }
    }
}

impl BanditPolicy for Policy {
    fn policy_type(&self) -> PolicyType {
        self.inner().policy_type()
    }

    fn dim(&self) -> usize {
        self.inner().dim()
    }

    fn recommend(
        &self,
        context: &Context,
        candidates: &[&str],
        rng: &mut dyn RngCore,
    ) -> Result<String> {
        self.inner().recommend(context, candidates, rng)
    }

    fn update(
        &mut self,
        arm: &str,
        reward: f64,
        context: &Context,
        propensity: Option<f64>,
    ) -> Result<()> {
        self.inner_mut().update(arm, reward, context, propensity)
    }

    fn total_updates(&self) -> u64 {
        self.inner().total_updates()
    }

    fn expected_values(&self) -> HashMap<String, f64> {
        self.inner().expected_values()
    }

    fn arm_summaries(&self) -> Vec<ArmSummary> {
        self.inner().arm_summaries()
    }

    fn diagnostics(&self) -> PolicyDiagnostics {
        self.inner().diagnostics()
    }
}

/// Validation helper shared by the policy configs
pub(crate) fn ensure(condition: bool, msg: impl FnOnce() -> String) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(Error::invalid_config(msg()))
    }
}
