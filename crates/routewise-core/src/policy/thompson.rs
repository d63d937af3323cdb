//! Thompson Sampling Multi-Armed Bandit
//!
//! Each arm maintains a Beta distribution over its expected (normalized)
//! reward, and we sample from these distributions to make selection decisions.
//!
//! ## Algorithm Overview
//!
//! 1. For each arm, maintain Beta(α, β) over its success probability
//! 2. Sample from each candidate's distribution: θ ~ Beta(α, β)
//! 3. Select the candidate with the highest sample (first candidate wins ties)
//! 4. Observe reward r, normalize it onto [0, 1] and update:
//!    α += r, β += (1 - r)
//!
//! Arms are created lazily: a candidate never updated samples from the prior.
//! The context is ignored beyond validating its length against `dim`.

use rand::RngCore;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::types::{ArmSummary, ArmTable, Context, RewardBounds, RewardTally};
use super::{
    BanditPolicy, BetaPosterior, PolicyDiagnostics, PolicyType, ensure, validate_propensity,
    validate_request,
};
use crate::error::Result;

/// Configuration for [`ThompsonSamplingBandit`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThompsonConfig {
    /// Expected context length (0 for context-free domains)
    pub dim: usize,
    /// Prior pseudo-successes for unseen arms
    pub prior_alpha: f64,
    /// Prior pseudo-failures for unseen arms
    pub prior_beta: f64,
    /// Accepted reward range; rewards are normalized onto [0, 1]
    pub reward_bounds: RewardBounds,
}

impl Default for ThompsonConfig {
    fn default() -> Self {
        Self {
            dim: 0,
            prior_alpha: 1.0,
            prior_beta: 1.0,
            reward_bounds: RewardBounds::unit(),
        }
    }
}

impl ThompsonConfig {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            ..Default::default()
        }
    }

    /// Set the Beta prior for unseen arms
    pub fn with_prior(mut self, alpha: f64, beta: f64) -> Self {
        self.prior_alpha = alpha;
        self.prior_beta = beta;
        self
    }

    pub fn with_reward_bounds(mut self, bounds: RewardBounds) -> Self {
        self.reward_bounds = bounds;
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure(
            self.prior_alpha.is_finite() && self.prior_alpha > 0.0,
            || format!("prior_alpha must be positive, got {}", self.prior_alpha),
        )?;
        ensure(
            self.prior_beta.is_finite() && self.prior_beta > 0.0,
            || format!("prior_beta must be positive, got {}", self.prior_beta),
        )?;
        self.reward_bounds.validate()
    }
}

/// Posterior and reward totals for one arm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmStats {
    /// Beta distribution alpha parameter
    pub alpha: f64,
    /// Beta distribution beta parameter
    pub beta: f64,
    /// Observed (bounded, unnormalized) rewards
    pub tally: RewardTally,
}

impl ArmStats {
    /// Create stats with an explicit prior
    pub fn new(alpha: f64, beta: f64) -> Self {
        Self {
            alpha,
            beta,
            tally: RewardTally::default(),
        }
    }

    /// Create stats whose prior leans towards `mean` with weight `strength`
    ///
    /// E.g. mean 0.8, strength 5 on a Beta(1, 1) base gives alpha=5, beta=2.
    pub fn with_prior(base_alpha: f64, base_beta: f64, mean: f64, strength: f64) -> Self {
        let mean = mean.clamp(0.0, 1.0);
        Self::new(
            base_alpha + mean * strength,
            base_beta + (1.0 - mean) * strength,
        )
    }

    /// Record one reward; `normalized` is the same reward mapped onto [0, 1]
    pub fn observe(&mut self, reward: f64, normalized: f64) {
        self.alpha += normalized;
        self.beta += 1.0 - normalized;
        self.tally.observe(reward);
    }

    /// Mean of the Beta posterior
    pub fn expected_value(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    /// Standard deviation of the Beta posterior
    pub fn uncertainty(&self) -> f64 {
        let ab = self.alpha + self.beta;
        ((self.alpha * self.beta) / (ab * ab * (ab + 1.0))).sqrt()
    }
}

/// Thompson Sampling bandit over lazily discovered arms
#[derive(Debug, Clone)]
pub struct ThompsonSamplingBandit {
    config: ThompsonConfig,
    arms: ArmTable<ArmStats>,
    total_updates: u64,
}

impl ThompsonSamplingBandit {
    /// Create a bandit; `config` is assumed validated
    pub fn new(config: ThompsonConfig) -> Self {
        Self {
            config,
            arms: ArmTable::new(),
            total_updates: 0,
        }
    }

    /// Create a fresh bandit whose arm priors come from `parent`'s posteriors
    ///
    /// Each known arm starts from the configured prior shifted towards the
    /// parent's posterior mean with weight `strength`. No rewards carry over.
    pub fn inherit(parent: &ThompsonSamplingBandit, strength: f64) -> Self {
        let mut child = Self::new(parent.config.clone());
        for (arm, stats) in parent.arms.iter() {
            let seeded = ArmStats::with_prior(
                parent.config.prior_alpha,
                parent.config.prior_beta,
                stats.expected_value(),
                strength,
            );
            child.arms.get_or_insert_with(arm, || seeded);
        }
        child
    }

    pub fn config(&self) -> &ThompsonConfig {
        &self.config
    }

    /// Get stats for an arm if it has been seen
    pub fn get_stats(&self, arm: &str) -> Option<&ArmStats> {
        self.arms.get(arm)
    }

    /// Sample from the Beta distribution for an arm
    fn sample_beta(alpha: f64, beta: f64, rng: &mut dyn RngCore) -> f64 {
        if alpha <= 0.0 || beta <= 0.0 {
            return 0.5;
        }

        match Beta::new(alpha, beta) {
            Ok(dist) => dist.sample(rng),
            Err(_) => alpha / (alpha + beta),
        }
    }

    /// Posterior parameters used for a candidate (prior when unseen)
    fn posterior(&self, arm: &str) -> (f64, f64) {
        self.arms
            .get(arm)
            .map(|s| (s.alpha, s.beta))
            .unwrap_or((self.config.prior_alpha, self.config.prior_beta))
    }
}

impl BanditPolicy for ThompsonSamplingBandit {
    fn policy_type(&self) -> PolicyType {
        PolicyType::ThompsonSampling
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

        let mut best = candidates[0];
        let mut best_sample = f64::NEG_INFINITY;

        for &candidate in candidates {
            let (alpha, beta) = self.posterior(candidate);
            let sample = Self::sample_beta(alpha, beta, rng);
            if sample > best_sample {
                best_sample = sample;
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
        let normalized = self.config.reward_bounds.normalize(reward);

        let (prior_alpha, prior_beta) = (self.config.prior_alpha, self.config.prior_beta);
        self.arms
            .get_or_insert_with(arm, || ArmStats::new(prior_alpha, prior_beta))
            .observe(reward, normalized);
        self.total_updates += 1;
        Ok(())
    }

    fn total_updates(&self) -> u64 {
        self.total_updates
    }

    fn expected_values(&self) -> HashMap<String, f64> {
        self.arms
            .iter()
            .map(|(arm, stats)| (arm.to_string(), stats.expected_value()))
            .collect()
    }

    fn arm_summaries(&self) -> Vec<ArmSummary> {
        self.arms
            .iter()
            .map(|(arm, stats)| stats.tally.summary(arm))
            .collect()
    }

    fn diagnostics(&self) -> PolicyDiagnostics {
        PolicyDiagnostics::ThompsonSampling {
            posteriors: self
                .arms
                .iter()
                .map(|(arm, stats)| BetaPosterior {
                    arm: arm.to_string(),
                    alpha: stats.alpha,
                    beta: stats.beta,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::OutOfRange;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn bandit() -> ThompsonSamplingBandit {
        ThompsonSamplingBandit::new(ThompsonConfig::default())
    }

    #[test]
    fn test_bandit_select_single_candidate() {
        let bandit = bandit();
        let mut rng = StdRng::seed_from_u64(42);

        let arm = bandit
            .recommend(&Context::new(), &["only-arm"], &mut rng)
            .unwrap();
        assert_eq!(arm, "only-arm");
    }

    #[test]
    fn test_bandit_explores_multiple_candidates() {
        let bandit = bandit();
        let mut rng = StdRng::seed_from_u64(42);
        let mut selections: HashMap<String, u32> = HashMap::new();

        for _ in 0..100 {
            let arm = bandit
                .recommend(&Context::new(), &["a", "b", "c"], &mut rng)
                .unwrap();
            *selections.entry(arm).or_default() += 1;
        }

        assert!(
            selections.len() >= 2,
            "Expected exploration of multiple arms"
        );
    }

    #[test]
    fn test_bandit_same_seed_same_choices() {
        let bandit = bandit();
        let mut rng_a = StdRng::seed_from_u64(9);
        let mut rng_b = StdRng::seed_from_u64(9);

        for _ in 0..20 {
            assert_eq!(
                bandit.recommend(&Context::new(), &["a", "b"], &mut rng_a).unwrap(),
                bandit.recommend(&Context::new(), &["a", "b"], &mut rng_b).unwrap()
            );
        }
    }

    #[test]
    fn test_bandit_update_affects_selection() {
        let mut bandit = bandit();
        let mut rng = StdRng::seed_from_u64(42);
        let context = Context::new();

        for _ in 0..20 {
            bandit.update("arm-a", 1.0, &context, None).unwrap();
            bandit.update("arm-b", 0.0, &context, None).unwrap();
        }

        let mut a_count = 0;
        for _ in 0..50 {
            if bandit.recommend(&context, &["arm-a", "arm-b"], &mut rng).unwrap() == "arm-a" {
                a_count += 1;
            }
        }

        assert!(
            a_count > 45,
            "Expected arm-a to be selected most often, got {} out of 50",
            a_count
        );
    }

    #[test]
    fn test_bandit_converges_to_dominant_arm() {
        let mut bandit = bandit();
        let mut rng = StdRng::seed_from_u64(1234);
        let context = Context::new();
        let arms = ["low", "mid", "high"];
        let success_rate = |arm: &str| match arm {
            "high" => 0.8,
            "mid" => 0.5,
            _ => 0.3,
        };

        for _ in 0..1000 {
            let arm = bandit.recommend(&context, &arms, &mut rng).unwrap();
            let reward = if rng.gen_bool(success_rate(arm.as_str())) { 1.0 } else { 0.0 };
            bandit.update(&arm, reward, &context, None).unwrap();
        }

        let trials = 1000;
        let mut high = 0;
        for _ in 0..trials {
            if bandit.recommend(&context, &arms, &mut rng).unwrap() == "high" {
                high += 1;
            }
        }
        let rate = high as f64 / trials as f64;
        assert!(rate > 0.9, "dominant arm chosen {:.3} of the time", rate);
    }

    #[test]
    fn test_reward_normalized_and_clipped() {
        let config = ThompsonConfig::default()
            .with_reward_bounds(RewardBounds::new(-1.0, 1.0, OutOfRange::Clip));
        let mut bandit = ThompsonSamplingBandit::new(config);

        bandit.update("a", 0.0, &Context::new(), None).unwrap();
        bandit.update("a", 5.0, &Context::new(), None).unwrap();

        let stats = bandit.get_stats("a").unwrap();
        // 0.0 maps to 0.5, 5.0 clips to 1.0 which maps to 1.0
        assert!((stats.alpha - 2.5).abs() < 1e-12);
        assert!((stats.beta - 1.5).abs() < 1e-12);
        assert!((stats.tally.mean() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_expected_values() {
        let mut bandit = bandit();
        let context = Context::new();
        bandit.update("arm-a", 0.9, &context, None).unwrap();
        bandit.update("arm-b", 0.5, &context, None).unwrap();
        bandit.update("arm-c", 0.3, &context, None).unwrap();

        let expected = bandit.expected_values();
        assert!(expected["arm-a"] > expected["arm-b"]);
        assert!(expected["arm-b"] > expected["arm-c"]);
    }

    #[test]
    fn test_inherit_seeds_priors_without_rewards() {
        let mut parent = bandit();
        let context = Context::new();
        for _ in 0..30 {
            parent.update("good", 1.0, &context, None).unwrap();
            parent.update("bad", 0.0, &context, None).unwrap();
        }

        let child = ThompsonSamplingBandit::inherit(&parent, 5.0);
        assert_eq!(child.total_updates(), 0);

        let good = child.get_stats("good").unwrap();
        let bad = child.get_stats("bad").unwrap();
        assert_eq!(good.tally.pulls, 0);
        assert!(good.expected_value() > 0.75);
        assert!(bad.expected_value() < 0.25);
        assert!((good.alpha + good.beta - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_prior_rejected() {
        assert!(ThompsonConfig::default().with_prior(0.0, 1.0).validate().is_err());
        assert!(ThompsonConfig::default().with_prior(1.0, f64::NAN).validate().is_err());
        assert!(ThompsonConfig::default().validate().is_ok());
    }
}
