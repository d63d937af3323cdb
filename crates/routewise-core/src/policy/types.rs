//! Types shared by every bandit policy
//!
//! A [`Context`] is the feature vector describing one request, [`RewardBounds`]
//! declares how a policy treats rewards outside its range, and [`ArmTable`]
//! keeps per-arm state in first-seen order so iteration is deterministic.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use crate::error::{Error, Result};

/// Ordered feature map describing one request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    names: Vec<String>,
    values: Vec<f64>,
}

impl Context {
    /// Create an empty context (valid for context-free policies with `dim = 0`)
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context from raw values, naming features `x0`, `x1`, ...
    pub fn from_values(values: Vec<f64>) -> Self {
        let names = (0..values.len()).map(|i| format!("x{}", i)).collect();
        Self { names, values }
    }

    /// Set a feature; an existing feature keeps its position
    pub fn with_feature(mut self, name: impl Into<String>, value: f64) -> Self {
        self.set(name, value);
        self
    }

    /// Set a feature in place
    pub fn set(&mut self, name: impl Into<String>, value: f64) {
        let name = name.into();
        match self.names.iter().position(|n| *n == name) {
            Some(idx) => self.values[idx] = value,
            None => {
                self.names.push(name);
                self.values.push(value);
            }
        }
    }

    /// Look up a feature by name
    pub fn get(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|idx| self.values[idx])
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Check that the context has exactly `dim` finite features
    pub fn validate(&self, dim: usize) -> Result<()> {
        if self.values.len() != dim {
            return Err(Error::invalid_input(format!(
                "context has {} features, policy expects {}",
                self.values.len(),
                dim
            )));
        }
        if let Some(idx) = self.values.iter().position(|v| !v.is_finite()) {
            return Err(Error::invalid_input(format!(
                "feature '{}' is not finite ({})",
                self.names[idx], self.values[idx]
            )));
        }
        Ok(())
    }

    /// Dot product against a weight vector of the same length
    pub fn dot(&self, weights: &[f64]) -> f64 {
        self.values
            .iter()
            .zip(weights.iter())
            .map(|(x, w)| x * w)
            .sum()
    }

    /// Squared Euclidean norm
    pub fn norm_sq(&self) -> f64 {
        self.values.iter().map(|x| x * x).sum()
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for Context {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        let mut context = Context::new();
        for (name, value) in iter {
            context.set(name, value);
        }
        context
    }
}

/// What a policy does with a reward outside its bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutOfRange {
    /// Clamp into range and log a warning
    #[default]
    Clip,
    /// Fail with `InvalidInput`
    Reject,
}

/// Accepted reward range for a policy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RewardBounds {
    pub min: f64,
    pub max: f64,
    #[serde(default)]
    pub on_violation: OutOfRange,
}

impl RewardBounds {
    pub fn new(min: f64, max: f64, on_violation: OutOfRange) -> Self {
        Self {
            min,
            max,
            on_violation,
        }
    }

    /// `[0, 1]`, clipped
    pub fn unit() -> Self {
        Self::new(0.0, 1.0, OutOfRange::Clip)
    }

    /// `[-1, 1]`, rejected
    pub fn symmetric() -> Self {
        Self::new(-1.0, 1.0, OutOfRange::Reject)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.min.is_finite() || !self.max.is_finite() || self.min >= self.max {
            return Err(Error::invalid_config(format!(
                "reward bounds [{}, {}] must be finite with min < max",
                self.min, self.max
            )));
        }
        Ok(())
    }

    /// Apply the bounds, returning the reward the policy will learn from
    pub fn apply(&self, reward: f64) -> Result<f64> {
        if !reward.is_finite() {
            return Err(Error::invalid_input(format!(
                "reward must be finite, got {}",
                reward
            )));
        }
        if (self.min..=self.max).contains(&reward) {
            return Ok(reward);
        }
        match self.on_violation {
            OutOfRange::Clip => {
                let clipped = reward.clamp(self.min, self.max);
                warn!(
                    reward,
                    clipped,
                    min = self.min,
                    max = self.max,
                    "Reward outside bounds, clipping"
                );
                Ok(clipped)
            }
            OutOfRange::Reject => Err(Error::invalid_input(format!(
                "reward {} outside [{}, {}]",
                reward, self.min, self.max
            ))),
        }
    }

    /// Map an in-range reward onto `[0, 1]`
    pub fn normalize(&self, reward: f64) -> f64 {
        ((reward - self.min) / (self.max - self.min)).clamp(0.0, 1.0)
    }
}

/// Running reward totals for one arm
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardTally {
    pub pulls: u64,
    pub reward_sum: f64,
    pub reward_sum_sq: f64,
}

impl RewardTally {
    pub fn observe(&mut self, reward: f64) {
        self.pulls += 1;
        self.reward_sum += reward;
        self.reward_sum_sq += reward * reward;
    }

    /// Mean observed reward (0 before any pull)
    pub fn mean(&self) -> f64 {
        if self.pulls == 0 {
            return 0.0;
        }
        self.reward_sum / self.pulls as f64
    }

    /// Population variance of observed rewards
    pub fn variance(&self) -> f64 {
        if self.pulls < 2 {
            return 0.0;
        }
        let n = self.pulls as f64;
        let mean = self.mean();
        ((self.reward_sum_sq / n) - mean * mean).max(0.0)
    }

    pub fn summary(&self, arm: &str) -> ArmSummary {
        ArmSummary {
            arm: arm.to_string(),
            pulls: self.pulls,
            mean_reward: self.mean(),
            reward_variance: self.variance(),
        }
    }
}

/// Serializable per-arm view returned in stats snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmSummary {
    pub arm: String,
    pub pulls: u64,
    pub mean_reward: f64,
    pub reward_variance: f64,
}

/// Per-arm state kept in first-seen order
#[derive(Debug, Clone)]
pub struct ArmTable<T> {
    entries: Vec<(String, T)>,
    index: HashMap<String, usize>,
}

impl<T> Default for ArmTable<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T> ArmTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, arm: &str) -> Option<&T> {
        self.index.get(arm).map(|&idx| &self.entries[idx].1)
    }

    pub fn get_mut(&mut self, arm: &str) -> Option<&mut T> {
        self.index.get(arm).map(|&idx| &mut self.entries[idx].1)
    }

    /// Get the entry for `arm`, creating it on first encounter
    pub fn get_or_insert_with(&mut self, arm: &str, init: impl FnOnce() -> T) -> &mut T {
        let idx = match self.index.get(arm) {
            Some(&idx) => idx,
            None => {
                self.entries.push((arm.to_string(), init()));
                let idx = self.entries.len() - 1;
                self.index.insert(arm.to_string(), idx);
                idx
            }
        };
        &mut self.entries[idx].1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(arm, value)| (arm.as_str(), value))
    }
}

/// Reject empty candidate sets and malformed contexts before any policy work
pub(crate) fn validate_request(context: &Context, dim: usize, candidates: &[&str]) -> Result<()> {
    if candidates.is_empty() {
        return Err(Error::invalid_input("candidate set is empty"));
    }
    context.validate(dim)
}

/// Check an optional logging propensity
pub(crate) fn validate_propensity(propensity: Option<f64>) -> Result<()> {
    match propensity {
        Some(p) if !(p > 0.0 && p <= 1.0) => Err(Error::invalid_input(format!(
            "propensity must be in (0, 1], got {}",
            p
        ))),
        _ => Ok(()),
    }
}
