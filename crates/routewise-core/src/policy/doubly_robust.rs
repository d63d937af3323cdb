//! Doubly Robust contextual bandit
//!
//! Each arm owns a linear reward model `μ_a(x) = x · w_a`, created lazily with
//! zero weights the first time the arm is updated.
//!
//! Selection scores every candidate with its predicted reward plus a
//! randomized exploration bonus `alpha · u · ‖x‖ / sqrt(1 + n_a)` with
//! `u ~ U(0, 1)`, so rarely pulled arms get larger perturbations and the bonus
//! fades as evidence accumulates.
//!
//! Updates take a gradient step on the squared prediction error, scaled by a
//! capped importance weight and a decaying learning rate:
//!
//! ```text
//! w_a += lr_t · min(1/p, max_weight) · (r - x · w_a) · x,   lr_t = lr · decay^t
//! ```
//!
//! `p` is the logging propensity of the served arm when the caller knows it;
//! otherwise uniform logging over the known arms is assumed. The effective step
//! is bounded by `1 / ‖x‖²` so a single update never overshoots its target.

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::types::{ArmSummary, ArmTable, Context, RewardBounds, RewardTally};
use super::{
    BanditPolicy, PolicyDiagnostics, PolicyType, ensure, validate_propensity, validate_request,
};
use crate::error::Result;

/// Configuration for [`DoublyRobustBandit`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DoublyRobustConfig {
    /// Context length; must be positive
    pub dim: usize,
    /// Exploration strength (0 disables exploration)
    pub alpha: f64,
    /// Initial learning rate
    pub learning_rate: f64,
    /// Multiplicative learning-rate decay per update, in (0, 1]
    pub lr_decay: f64,
    /// Cap on the importance weight
    pub max_weight: f64,
    /// Accepted reward range
    pub reward_bounds: RewardBounds,
}

impl Default for DoublyRobustConfig {
    fn default() -> Self {
        Self {
            dim: 1,
            alpha: 1.0,
            learning_rate: 0.1,
            lr_decay: 0.999,
            max_weight: 10.0,
            reward_bounds: RewardBounds::symmetric(),
        }
    }
}

impl DoublyRobustConfig {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            ..Default::default()
        }
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_lr_decay(mut self, decay: f64) -> Self {
        self.lr_decay = decay;
        self
    }

    pub fn with_max_weight(mut self, max_weight: f64) -> Self {
        self.max_weight = max_weight;
        self
    }

    pub fn with_reward_bounds(mut self, bounds: RewardBounds) -> Self {
        self.reward_bounds = bounds;
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure(self.dim > 0, || "doubly_robust requires dim > 0".to_string())?;
        ensure(self.alpha.is_finite() && self.alpha >= 0.0, || {
            format!("alpha must be non-negative, got {}", self.alpha)
        })?;
        ensure(
            self.learning_rate.is_finite() && self.learning_rate > 0.0,
            || format!("learning_rate must be positive, got {}", self.learning_rate),
        )?;
        ensure(self.lr_decay > 0.0 && self.lr_decay <= 1.0, || {
            format!("lr_decay must be in (0, 1], got {}", self.lr_decay)
        })?;
        ensure(self.max_weight.is_finite() && self.max_weight >= 1.0, || {
            format!("max_weight must be >= 1, got {}", self.max_weight)
        })?;
        self.reward_bounds.validate()
    }
}

/// Linear reward model for one arm
#[derive(Debug, Clone)]
struct ArmModel {
    weights: Vec<f64>,
    tally: RewardTally,
}

impl ArmModel {
    fn new(dim: usize) -> Self {
        Self {
            weights: vec![0.0; dim],
            tally: RewardTally::default(),
        }
    }
}

/// Per-arm online linear regression with importance-weighted updates
#[derive(Debug, Clone)]
pub struct DoublyRobustBandit {
    config: DoublyRobustConfig,
    arms: ArmTable<ArmModel>,
    updates: u64,
    mean_abs_residual: f64,
}

impl DoublyRobustBandit {
    /// Create a bandit; `config` is assumed validated
    pub fn new(config: DoublyRobustConfig) -> Self {
        Self {
            config,
            arms: ArmTable::new(),
            updates: 0,
            mean_abs_residual: 0.0,
        }
    }

    pub fn config(&self) -> &DoublyRobustConfig {
        &self.config
    }

    /// Current weight vector of an arm
    pub fn weights(&self, arm: &str) -> Option<&[f64]> {
        self.arms.get(arm).map(|m| m.weights.as_slice())
    }

    /// Predicted reward of `arm` for `context` (0 for unseen arms)
    pub fn predict(&self, arm: &str, context: &Context) -> f64 {
        self.arms
            .get(arm)
            .map(|m| context.dot(&m.weights))
            .unwrap_or(0.0)
    }

    /// Learning rate that the next update will use
    pub fn current_learning_rate(&self) -> f64 {
        self.config.learning_rate * self.config.lr_decay.powf(self.updates as f64)
    }

    /// Importance weight for an update of `arm`
    fn importance_weight(&self, arm: &str, propensity: Option<f64>) -> f64 {
        let propensity = propensity.unwrap_or_else(|| {
            let known = self.arms.len() + usize::from(self.arms.get(arm).is_none());
            1.0 / known as f64
        });
        (1.0 / propensity).min(self.config.max_weight)
    }
}

impl BanditPolicy for DoublyRobustBandit {
    fn policy_type(&self) -> PolicyType {
        PolicyType::DoublyRobust
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

        let norm = context.norm_sq().sqrt();
        let mut best = candidates[0];
        let mut best_score = f64::NEG_INFINITY;

        for &candidate in candidates {
            let pulls = self.arms.get(candidate).map(|m| m.tally.pulls).unwrap_or(0);
            let u: f64 = rng.gen_range(0.0..1.0);
            let bonus = self.config.alpha * u * norm / (1.0 + pulls as f64).sqrt();
            let score = self.predict(candidate, context) + bonus;
            if score > best_score {
                best_score = score;
                best = candidate;
            }
        }

        Ok(best.to_string())
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
        let reward = self.config.reward_bounds.apply(reward)?;

        let weight = self.importance_weight(arm, propensity);
        let mut step = self.current_learning_rate() * weight;
        let norm_sq = context.norm_sq();
        if norm_sq > 0.0 {
            step = step.min(1.0 / norm_sq);
        }

        let dim = self.config.dim;
        let model = self.arms.get_or_insert_with(arm, || ArmModel::new(dim));
        let error = reward - context.dot(&model.weights);
        for (w, x) in model.weights.iter_mut().zip(context.values()) {
            *w += step * error * x;
        }
        model.tally.observe(reward);

        self.updates += 1;
        self.mean_abs_residual += (error.abs() - self.mean_abs_residual) / self.updates as f64;
        Ok(())
    }

    fn total_updates(&self) -> u64 {
        self.updates
    }

    fn expected_values(&self) -> HashMap<String, f64> {
        self.arms
            .iter()
            .map(|(arm, model)| (arm.to_string(), model.tally.mean()))
            .collect()
    }

    fn arm_summaries(&self) -> Vec<ArmSummary> {
        self.arms
            .iter()
            .map(|(arm, model)| model.tally.summary(arm))
            .collect()
    }

    fn diagnostics(&self) -> PolicyDiagnostics {
        PolicyDiagnostics::DoublyRobust {
            weights: self
                .arms
                .iter()
                .map(|(arm, model)| (arm.to_string(), model.weights.clone()))
                .collect::<BTreeMap<_, _>>(),
            mean_abs_residual: self.mean_abs_residual,
            current_learning_rate: self.current_learning_rate(),
        }
    }
}
