//! Shadow experiments
//!
//! An experiment pits alternative policies (variants) against the live policy
//! of a baseline domain. The baseline keeps serving every request; variants
//! only watch the `(context, arm, reward)` tuples it produces.
//!
//! ## Off-policy evaluation
//!
//! A reward observed for the served arm says nothing about an arm the variant
//! would have picked instead. Variants therefore use replay evaluation: on each
//! admitted observation the variant makes its own choice over the same
//! context and candidates, and learns from (and is scored on) the observation
//! only when that choice equals the served arm. Mismatches are counted and
//! dropped. The matched subset is an unbiased sample of the variant's own
//! behaviour only when the baseline picks arms uniformly at random. A learning
//! baseline serves its favourite arms more often, so matched observations
//! over-represent those arms and variant means are biased toward the
//! baseline's preferences. Read reports from a converged baseline with that in
//! mind.
//!
//! Variants never touch the baseline domain and are never promoted
//! automatically; [`Recommendation`]s are advisory.

mod stats;
mod types;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::Rng;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::engine::{LearningEngine, RngSource};
use crate::error::{Error, Result};
use crate::policy::{BanditPolicy, Context, Policy, PolicyType};

pub use stats::RunningStats;
pub use types::{
    BaselineReport, ExperimentReport, ExperimentSpec, Recommendation, VariantComparison,
    VariantReport, VariantSpec, VariantStatus, improvement_pct, recommend_action,
};

/// What happened to the variants on one recorded observation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShadowOutcome {
    pub updated: usize,
    pub skipped_mismatch: usize,
    pub gated_out: usize,
    pub rejected: usize,
}

struct VariantState {
    spec: VariantSpec,
    policy: Policy,
    stats: RunningStats,
    skipped_mismatch: u64,
    gated_out: u64,
    rejected: u64,
}

impl VariantState {
    fn observe(&mut self, arm: &str, reward: f64, context: &Context) -> Result<()> {
        self.policy.update(arm, reward, context, None)?;
        self.stats.push(reward);
        Ok(())
    }
}

struct Experiment {
    spec: ExperimentSpec,
    /// Baseline policy type at registration
    baseline_type: PolicyType,
    baseline: Mutex<RunningStats>,
    variants: Vec<Mutex<VariantState>>,
    rng: RngSource,
    started_at: DateTime<Utc>,
}

impl Experiment {
    fn variant(&self, name: &str) -> Result<&Mutex<VariantState>> {
        // Same order as the experiment's variant list
        self.spec
            .variants
            .iter()
            .position(|v| v.name == name)
            .map(|idx| &self.variants[idx])
            .ok_or_else(|| Error::VariantNotFound(self.spec.id.clone(), name.to_string()))
    }

    /// `baseline_type` is the baseline domain's current policy type
    fn report(&self, baseline_type: PolicyType) -> ExperimentReport {
        let baseline = *lock(&self.baseline);
        let spec = &self.spec;

        let variants = self
            .variants
            .iter()
            .map(|cell| {
                let v = lock(cell);
                let ready = v.stats.count() >= spec.shadow_samples;
                let improvement = if ready && baseline.count() > 0 {
                    improvement_pct(baseline.mean(), v.stats.mean())
                } else {
                    None
                };
                let recommendation = if ready && baseline.count() > 0 {
                    recommend_action(
                        improvement,
                        spec.promote_threshold_pct,
                        spec.reject_threshold_pct,
                    )
                } else {
                    Recommendation::InsufficientData
                };

                VariantReport {
                    name: v.spec.name.clone(),
                    policy_type: v.policy.policy_type(),
                    traffic_fraction: v.spec.traffic_fraction,
                    status: if ready {
                        VariantStatus::Ready
                    } else {
                        VariantStatus::InsufficientData
                    },
                    pulls: v.stats.count(),
                    mean_reward: v.stats.mean(),
                    reward_variance: v.stats.variance(),
                    skipped_mismatch: v.skipped_mismatch,
                    gated_out: v.gated_out,
                    rejected: v.rejected,
                    reward_improvement_pct: improvement,
                    recommendation,
                    diagnostics: v.policy.diagnostics(),
                }
            })
            .collect();

        ExperimentReport {
            id: spec.id.clone(),
            description: spec.description.clone(),
            shadow_samples: spec.shadow_samples,
            started_at: self.started_at,
            baseline: BaselineReport {
                domain: spec.domain.clone(),
                policy_type: baseline_type,
                pulls: baseline.count(),
                mean_reward: baseline.mean(),
                reward_variance: baseline.variance(),
            },
            variants,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs shadow experiments on top of a [`LearningEngine`]
pub struct ExperimentManager {
    engine: Arc<LearningEngine>,
    experiments: DashMap<String, Arc<Experiment>>,
}

impl ExperimentManager {
    pub fn new(engine: Arc<LearningEngine>) -> Self {
        Self {
            engine,
            experiments: DashMap::new(),
        }
    }

    /// Build the engine and every experiment described by `config`
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let manager = Self::new(Arc::new(LearningEngine::from_config(config)?));
        for spec in &config.experiments {
            manager.register_experiment(spec.clone())?;
        }
        Ok(manager)
    }

    pub fn engine(&self) -> &Arc<LearningEngine> {
        &self.engine
    }

    /// Register an experiment against an existing domain
    ///
    /// Every variant policy must match the baseline's context dimension.
    pub fn register_experiment(&self, spec: ExperimentSpec) -> Result<()> {
        spec.validate()?;
        let baseline = self.engine.domain_config(&spec.domain)?;

        let mut variants = Vec::with_capacity(spec.variants.len());
        for variant in &spec.variants {
            if variant.policy.dim() != baseline.dim() {
                return Err(Error::invalid_config(format!(
                    "variant '{}' has dim {}, baseline domain '{}' has dim {}",
                    variant.name,
                    variant.policy.dim(),
                    spec.domain,
                    baseline.dim()
                )));
            }
            variants.push(Mutex::new(VariantState {
                spec: variant.clone(),
                policy: Policy::from_config(&variant.policy)?,
                stats: RunningStats::new(),
                skipped_mismatch: 0,
                gated_out: 0,
                rejected: 0,
            }));
        }

        let id = spec.id.clone();
        let experiment = Arc::new(Experiment {
            rng: RngSource::new(spec.seed),
            baseline_type: baseline.policy_type(),
            baseline: Mutex::new(RunningStats::new()),
            variants,
            started_at: Utc::now(),
            spec,
        });

        match self.experiments.entry(id.clone()) {
            Entry::Occupied(_) => return Err(Error::ExperimentExists(id)),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&experiment));
            }
        }

        info!(
            experiment = %id,
            domain = %experiment.spec.domain,
            variants = experiment.variants.len(),
            shadow_samples = experiment.spec.shadow_samples,
            "Registered experiment"
        );
        Ok(())
    }

    /// Serve the baseline domain's choice; variants have no say
    pub fn recommend<S: AsRef<str>>(
        &self,
        id: &str,
        context: &Context,
        candidates: &[S],
    ) -> Result<String> {
        let experiment = self.get(id)?;
        self.engine
            .recommend(&experiment.spec.domain, context, candidates)
    }

    /// Record a served outcome for the baseline and every admitted variant
    ///
    /// The baseline domain is updated first; if it rejects the observation
    /// nothing else changes. A variant that rejects it is counted and skipped.
    pub fn record<S: AsRef<str>>(
        &self,
        id: &str,
        context: &Context,
        candidates: &[S],
        served_arm: &str,
        reward: f64,
    ) -> Result<ShadowOutcome> {
        let experiment = self.get(id)?;
        let candidates: Vec<&str> = candidates.iter().map(AsRef::as_ref).collect();
        if !candidates.contains(&served_arm) {
            return Err(Error::invalid_input(format!(
                "served arm '{}' is not among the candidates",
                served_arm
            )));
        }

        self.engine
            .record(&experiment.spec.domain, context, served_arm, reward)?;
        lock(&experiment.baseline).push(reward);

        let mut outcome = ShadowOutcome::default();
        for cell in &experiment.variants {
            let mut rng = experiment.rng.next_rng();
            let mut variant = lock(cell);

            if !rng.gen_bool(variant.spec.traffic_fraction) {
                variant.gated_out += 1;
                outcome.gated_out += 1;
                continue;
            }

            let verdict = variant
                .policy
                .recommend(context, &candidates, &mut rng)
                .and_then(|choice| {
                    if choice == served_arm {
                        variant.observe(served_arm, reward, context).map(|()| true)
                    } else {
                        Ok(false)
                    }
                });

            match verdict {
                Ok(true) => outcome.updated += 1,
                Ok(false) => {
                    variant.skipped_mismatch += 1;
                    outcome.skipped_mismatch += 1;
                }
                Err(err) => {
                    warn!(
                        experiment = %id,
                        variant = %variant.spec.name,
                        error = %err,
                        "Variant rejected observation"
                    );
                    variant.rejected += 1;
                    outcome.rejected += 1;
                }
            }
        }

        debug!(
            experiment = %id,
            arm = served_arm,
            reward,
            updated = outcome.updated,
            skipped = outcome.skipped_mismatch,
            "Recorded experiment outcome"
        );
        Ok(outcome)
    }

    /// Feed one observation straight into a variant's learner and statistics
    pub fn record_advanced_metrics(
        &self,
        id: &str,
        variant: &str,
        arm: &str,
        reward: f64,
        context: &Context,
    ) -> Result<()> {
        let experiment = self.get(id)?;
        let cell = experiment.variant(variant)?;
        lock(cell).observe(arm, reward, context)
    }

    /// Current state of every variant against the baseline
    pub fn report(&self, id: &str) -> Result<ExperimentReport> {
        let experiment = self.get(id)?;
        Ok(experiment.report(self.baseline_type(&experiment)))
    }

    /// Compare one variant against the baseline
    ///
    /// Fails with `InsufficientData` until the variant has `shadow_samples`
    /// matched observations and the baseline has at least one.
    pub fn compare(&self, id: &str, variant: &str) -> Result<VariantComparison> {
        let experiment = self.get(id)?;
        let spec = &experiment.spec;
        let (variant_name, stats) = {
            let v = lock(experiment.variant(variant)?);
            (v.spec.name.clone(), v.stats)
        };
        let baseline = *lock(&experiment.baseline);

        if stats.count() < spec.shadow_samples {
            return Err(Error::InsufficientData {
                variant: variant_name,
                pulls: stats.count(),
                required: spec.shadow_samples,
            });
        }
        if baseline.count() == 0 {
            return Err(Error::InsufficientData {
                variant: spec.domain.clone(),
                pulls: 0,
                required: 1,
            });
        }

        let improvement = improvement_pct(baseline.mean(), stats.mean());
        Ok(VariantComparison {
            experiment: spec.id.clone(),
            variant: variant_name,
            baseline_pulls: baseline.count(),
            baseline_mean: baseline.mean(),
            variant_pulls: stats.count(),
            variant_mean: stats.mean(),
            reward_improvement_pct: improvement,
            recommendation: recommend_action(
                improvement,
                spec.promote_threshold_pct,
                spec.reject_threshold_pct,
            ),
        })
    }

    /// Registered experiment ids, sorted
    pub fn list_experiments(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.experiments.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Remove an experiment and return its final report
    ///
    /// The baseline domain keeps everything it learned.
    pub fn end_experiment(&self, id: &str) -> Result<ExperimentReport> {
        let (_, experiment) = self
            .experiments
            .remove(id)
            .ok_or_else(|| Error::ExperimentNotFound(id.to_string()))?;
        let report = experiment.report(self.baseline_type(&experiment));
        info!(experiment = %id, "Ended experiment");
        Ok(report)
    }

    /// The domain may have been re-registered with another policy since the
    /// experiment started; fall back to the original type once it is gone.
    fn baseline_type(&self, experiment: &Experiment) -> PolicyType {
        self.engine
            .domain_config(&experiment.spec.domain)
            .map(|config| config.policy_type())
            .unwrap_or(experiment.baseline_type)
    }

    fn get(&self, id: &str) -> Result<Arc<Experiment>> {
        self.experiments
            .get(id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| Error::ExperimentNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DomainOptions;
    use crate::error::ErrorKind;
    use crate::policy::{DoublyRobustConfig, OffsetTreeConfig, ThompsonConfig};

    fn manager_with_domain(seed: u64) -> ExperimentManager {
        let engine = LearningEngine::new();
        engine
            .register_domain("checkout", ThompsonConfig::new(0).into(), DomainOptions::seeded(seed))
            .unwrap();
        ExperimentManager::new(Arc::new(engine))
    }

    #[test]
    fn test_registration_errors() {
        let manager = manager_with_domain(1);

        let err = manager
            .register_experiment(
                ExperimentSpec::new("exp", "missing").with_variant("v", 0.5, ThompsonConfig::new(0)),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = manager
            .register_experiment(
                ExperimentSpec::new("exp", "checkout").with_variant("dr", 0.5, DoublyRobustConfig::new(2)),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);

        let spec = ExperimentSpec::new("exp", "checkout").with_variant("ts", 0.5, ThompsonConfig::new(0));
        manager.register_experiment(spec.clone()).unwrap();
        let err = manager.register_experiment(spec).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(manager.list_experiments(), vec!["exp".to_string()]);
    }

    #[test]
    fn test_insufficient_data_below_shadow_samples() {
        let manager = manager_with_domain(2);
        manager
            .register_experiment(
                ExperimentSpec::new("exp", "checkout")
                    .with_variant("ts", 1.0, ThompsonConfig::new(0))
                    .with_shadow_samples(50)
                    .with_seed(3),
            )
            .unwrap();

        let context = Context::new();
        for _ in 0..10 {
            let arm = manager.recommend("exp", &context, &["a", "b"]).unwrap();
            manager.record("exp", &context, &["a", "b"], &arm, 1.0).unwrap();
        }

        let report = manager.report("exp").unwrap();
        let variant = report.variant("ts").unwrap();
        assert_eq!(variant.status, VariantStatus::InsufficientData);
        assert_eq!(variant.recommendation, Recommendation::InsufficientData);
        assert_eq!(variant.reward_improvement_pct, None);
        assert!(variant.pulls < 50);

        let err = manager.compare("exp", "ts").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientData);
    }

    #[test]
    fn test_improvement_sign_follows_reward_differential() {
        let manager = manager_with_domain(4);
        manager
            .register_experiment(
                ExperimentSpec::new("exp", "checkout")
                    .with_variant("better", 0.0, ThompsonConfig::new(0))
                    .with_variant("worse", 0.0, ThompsonConfig::new(0))
                    .with_shadow_samples(20),
            )
            .unwrap();

        let context = Context::new();
        for _ in 0..30 {
            let outcome = manager.record("exp", &context, &["a"], "a", 0.8).unwrap();
            assert_eq!(outcome.gated_out, 2);
        }
        for _ in 0..20 {
            manager
                .record_advanced_metrics("exp", "better", "a", 1.0, &context)
                .unwrap();
            manager
                .record_advanced_metrics("exp", "worse", "a", 0.4, &context)
                .unwrap();
        }

        let better = manager.compare("exp", "better").unwrap();
        assert!((better.reward_improvement_pct.unwrap() - 25.0).abs() < 1e-9);
        assert_eq!(better.recommendation, Recommendation::Promote);

        let worse = manager.compare("exp", "worse").unwrap();
        assert!(worse.reward_improvement_pct.unwrap() < 0.0);
        assert_eq!(worse.recommendation, Recommendation::KeepBaseline);

        let report = manager.report("exp").unwrap();
        assert_eq!(report.baseline.pulls, 30);
        assert_eq!(report.variant("better").unwrap().status, VariantStatus::Ready);
        assert_eq!(report.variant("worse").unwrap().gated_out, 30);
    }

    #[test]
    fn test_variants_never_change_served_arm() {
        let plain = manager_with_domain(9);
        let shadowed = manager_with_domain(9);
        shadowed
            .register_experiment(
                ExperimentSpec::new("exp", "checkout")
                    .with_variant("ts", 1.0, ThompsonConfig::new(0))
                    .with_seed(5),
            )
            .unwrap();

        let context = Context::new();
        let candidates = ["a", "b", "c"];
        for round in 0..100 {
            let expected = plain.engine().recommend("checkout", &context, &candidates).unwrap();
            let served = shadowed.recommend("exp", &context, &candidates).unwrap();
            assert_eq!(expected, served, "round {}", round);

            let reward = if served == "b" { 1.0 } else { 0.0 };
            plain.engine().record("checkout", &context, &served, reward).unwrap();
            shadowed.record("exp", &context, &candidates, &served, reward).unwrap();
        }
    }

    #[test]
    fn test_replay_only_learns_from_matching_choices() {
        let manager = manager_with_domain(6);
        manager
            .register_experiment(
                ExperimentSpec::new("exp", "checkout")
                    .with_variant("ts", 1.0, ThompsonConfig::new(0))
                    .with_seed(8),
            )
            .unwrap();

        let context = Context::new();
        for _ in 0..200 {
            manager.record("exp", &context, &["a", "b"], "a", 1.0).unwrap();
        }

        let report = manager.report("exp").unwrap();
        let variant = report.variant("ts").unwrap();
        assert_eq!(variant.pulls + variant.skipped_mismatch, 200);
        assert!(variant.skipped_mismatch > 0);
        assert!(variant.pulls > variant.skipped_mismatch);
        match &variant.diagnostics {
            crate::policy::PolicyDiagnostics::ThompsonSampling { posteriors } => {
                assert_eq!(posteriors.len(), 1);
                assert_eq!(posteriors[0].arm, "a");
            }
            other => panic!("unexpected diagnostics {:?}", other),
        }
    }

    #[test]
    fn test_served_arm_must_be_candidate() {
        let manager = manager_with_domain(1);
        manager
            .register_experiment(
                ExperimentSpec::new("exp", "checkout").with_variant("ts", 1.0, ThompsonConfig::new(0)),
            )
            .unwrap();

        let err = manager
            .record("exp", &Context::new(), &["a"], "z", 1.0)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(manager.report("exp").unwrap().baseline.pulls, 0);
    }

    #[test]
    fn test_variant_rejection_counted() {
        let engine = LearningEngine::new();
        engine
            .register_domain("ctx", ThompsonConfig::new(1).into(), DomainOptions::default())
            .unwrap();
        let manager = ExperimentManager::new(Arc::new(engine));
        manager
            .register_experiment(
                ExperimentSpec::new("exp", "ctx").with_variant(
                    "dr",
                    1.0,
                    DoublyRobustConfig::new(1).with_reward_bounds(crate::policy::RewardBounds::new(
                        0.0,
                        0.5,
                        crate::policy::OutOfRange::Reject,
                    )),
                ),
            )
            .unwrap();

        let context = Context::from_values(vec![1.0]);
        let outcome = manager.record("exp", &context, &["only"], "only", 0.9).unwrap();
        assert_eq!(outcome.rejected, 1);
        assert_eq!(manager.report("exp").unwrap().variant("dr").unwrap().rejected, 1);
        assert_eq!(manager.engine().get_stats("ctx").unwrap().total_updates, 1);
    }

    #[test]
    fn test_end_experiment_keeps_domain() {
        let engine = LearningEngine::new();
        engine
            .register_domain("tree", OffsetTreeConfig::new(2).into(), DomainOptions::default())
            .unwrap();
        let manager = ExperimentManager::new(Arc::new(engine));
        manager
            .register_experiment(
                ExperimentSpec::new("exp", "tree").with_variant("dr", 0.5, DoublyRobustConfig::new(2)),
            )
            .unwrap();

        let context = Context::from_values(vec![0.1, 0.9]);
        manager.record("exp", &context, &["a", "b"], "a", 0.5).unwrap();

        let report = manager.end_experiment("exp").unwrap();
        assert_eq!(report.baseline.pulls, 1);
        assert_eq!(report.baseline.policy_type, PolicyType::OffsetTree);
        assert!(manager.list_experiments().is_empty());
        assert_eq!(
            manager.report("exp").unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert!(manager.engine().contains_domain("tree"));
        assert_eq!(manager.engine().get_stats("tree").unwrap().total_updates, 1);
    }

    #[test]
    fn test_report_follows_overwritten_baseline_policy() {
        let engine = LearningEngine::new();
        engine
            .register_domain("search", ThompsonConfig::new(2).into(), DomainOptions::seeded(5))
            .unwrap();
        let manager = ExperimentManager::new(Arc::new(engine));
        manager
            .register_experiment(
                ExperimentSpec::new("exp", "search").with_variant("ts", 1.0, ThompsonConfig::new(2)),
            )
            .unwrap();
        assert_eq!(
            manager.report("exp").unwrap().baseline.policy_type,
            PolicyType::ThompsonSampling
        );

        manager
            .engine()
            .register_domain("search", DoublyRobustConfig::new(2).into(), DomainOptions::overwrite())
            .unwrap();
        let context = Context::from_values(vec![0.3, 0.7]);
        manager.record("exp", &context, &["a", "b"], "a", 0.5).unwrap();

        let report = manager.report("exp").unwrap();
        assert_eq!(report.baseline.policy_type, PolicyType::DoublyRobust);
        assert_eq!(report.baseline.pulls, 1);

        // Once the domain is gone the registration-time type is reported
        manager.engine().unregister_domain("search").unwrap();
        let report = manager.end_experiment("exp").unwrap();
        assert_eq!(report.baseline.policy_type, PolicyType::ThompsonSampling);
    }

    #[test]
    fn test_unknown_variant() {
        let manager = manager_with_domain(1);
        manager
            .register_experiment(
                ExperimentSpec::new("exp", "checkout").with_variant("ts", 1.0, ThompsonConfig::new(0)),
            )
            .unwrap();
        let err = manager
            .record_advanced_metrics("exp", "nope", "a", 1.0, &Context::new())
            .unwrap_err();
        assert!(matches!(err, Error::VariantNotFound(..)));
    }
}
