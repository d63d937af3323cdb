//! Experiment definitions and reports

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::policy::{PolicyConfig, PolicyDiagnostics, PolicyType};

fn default_shadow_samples() -> u64 {
    100
}

fn default_promote_threshold() -> f64 {
    5.0
}

fn default_reject_threshold() -> f64 {
    -5.0
}

/// One alternative policy evaluated in shadow mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantSpec {
    pub name: String,
    /// Share of recorded traffic the variant gets to observe, in [0, 1]
    pub traffic_fraction: f64,
    pub policy: PolicyConfig,
}

impl VariantSpec {
    pub fn new(name: impl Into<String>, traffic_fraction: f64, policy: PolicyConfig) -> Self {
        Self {
            name: name.into(),
            traffic_fraction,
            policy,
        }
    }
}

/// Definition of a shadow experiment against a baseline domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSpec {
    pub id: String,
    /// Baseline domain whose policy serves live traffic
    pub domain: String,
    #[serde(default)]
    pub variants: Vec<VariantSpec>,
    /// Matched observations a variant needs before it is compared
    #[serde(default = "default_shadow_samples")]
    pub shadow_samples: u64,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_promote_threshold")]
    pub promote_threshold_pct: f64,
    #[serde(default = "default_reject_threshold")]
    pub reject_threshold_pct: f64,
    /// Seed for the traffic gate and variant choices
    #[serde(default)]
    pub seed: Option<u64>,
}

impl ExperimentSpec {
    pub fn new(id: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            domain: domain.into(),
            variants: Vec::new(),
            shadow_samples: default_shadow_samples(),
            description: String::new(),
            promote_threshold_pct: default_promote_threshold(),
            reject_threshold_pct: default_reject_threshold(),
            seed: None,
        }
    }

    pub fn with_variant(
        mut self,
        name: impl Into<String>,
        traffic_fraction: f64,
        policy: impl Into<PolicyConfig>,
    ) -> Self {
        self.variants
            .push(VariantSpec::new(name, traffic_fraction, policy.into()));
        self
    }

    pub fn with_shadow_samples(mut self, samples: u64) -> Self {
        self.shadow_samples = samples;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_thresholds(mut self, promote_pct: f64, reject_pct: f64) -> Self {
        self.promote_threshold_pct = promote_pct;
        self.reject_threshold_pct = reject_pct;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Checks that do not need the baseline domain
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::invalid_config("experiment id must not be empty"));
        }
        if self.variants.is_empty() {
            return Err(Error::invalid_config(format!(
                "experiment '{}' has no variants",
                self.id
            )));
        }
        if !(self.promote_threshold_pct.is_finite()
            && self.reject_threshold_pct.is_finite()
            && self.reject_threshold_pct < self.promote_threshold_pct)
        {
            return Err(Error::invalid_config(format!(
                "experiment '{}': reject threshold {} must be below promote threshold {}",
                self.id, self.reject_threshold_pct, self.promote_threshold_pct
            )));
        }

        let mut seen = HashSet::new();
        for variant in &self.variants {
            if variant.name.trim().is_empty() {
                return Err(Error::invalid_config(format!(
                    "experiment '{}' has a variant without a name",
                    self.id
                )));
            }
            if !seen.insert(variant.name.as_str()) {
                return Err(Error::invalid_config(format!(
                    "experiment '{}' has duplicate variant '{}'",
                    self.id, variant.name
                )));
            }
            if !(0.0..=1.0).contains(&variant.traffic_fraction) {
                return Err(Error::invalid_config(format!(
                    "variant '{}' traffic_fraction must be in [0, 1], got {}",
                    variant.name, variant.traffic_fraction
                )));
            }
            variant.policy.validate()?;
        }
        Ok(())
    }
}

/// Qualitative verdict for a variant; never acted on automatically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    InsufficientData,
    Promote,
    Investigate,
    KeepBaseline,
}

impl std::fmt::Display for Recommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "insufficient data"),
            Self::Promote => write!(f, "promote"),
            Self::Investigate => write!(f, "investigate"),
            Self::KeepBaseline => write!(f, "keep baseline"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantStatus {
    InsufficientData,
    Ready,
}

impl std::fmt::Display for VariantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "insufficient_data"),
            Self::Ready => write!(f, "ready"),
        }
    }
}

/// Reward statistics of the baseline domain as seen through the experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineReport {
    pub domain: String,
    pub policy_type: PolicyType,
    pub pulls: u64,
    pub mean_reward: f64,
    pub reward_variance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantReport {
    pub name: String,
    pub policy_type: PolicyType,
    pub traffic_fraction: f64,
    pub status: VariantStatus,
    /// Observations the variant learned from
    pub pulls: u64,
    pub mean_reward: f64,
    pub reward_variance: f64,
    /// Observations discarded because the variant would have served another arm
    pub skipped_mismatch: u64,
    /// Observations the traffic gate withheld
    pub gated_out: u64,
    /// Observations the variant's policy refused (e.g. reward out of bounds)
    pub rejected: u64,
    /// Only present once the variant is past `shadow_samples`
    pub reward_improvement_pct: Option<f64>,
    pub recommendation: Recommendation,
    pub diagnostics: PolicyDiagnostics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentReport {
    pub id: String,
    pub description: String,
    pub shadow_samples: u64,
    pub started_at: DateTime<Utc>,
    pub baseline: BaselineReport,
    pub variants: Vec<VariantReport>,
}

impl ExperimentReport {
    pub fn variant(&self, name: &str) -> Option<&VariantReport> {
        self.variants.iter().find(|v| v.name == name)
    }
}

/// Head-to-head comparison of one ready variant against the baseline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantComparison {
    pub experiment: String,
    pub variant: String,
    pub baseline_pulls: u64,
    pub baseline_mean: f64,
    pub variant_pulls: u64,
    pub variant_mean: f64,
    pub reward_improvement_pct: Option<f64>,
    pub recommendation: Recommendation,
}

/// `(variant - baseline) / |baseline| * 100`, undefined for a zero baseline
pub fn improvement_pct(baseline_mean: f64, variant_mean: f64) -> Option<f64> {
    if baseline_mean == 0.0 {
        return None;
    }
    Some((variant_mean - baseline_mean) / baseline_mean.abs() * 100.0)
}

/// Map an improvement onto a verdict
pub fn recommend_action(improvement: Option<f64>, promote_pct: f64, reject_pct: f64) -> Recommendation {
    match improvement {
        Some(pct) if pct >= promote_pct => Recommendation::Promote,
        Some(pct) if pct <= reject_pct => Recommendation::KeepBaseline,
        _ => Recommendation::Investigate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ThompsonConfig;

    #[test]
    fn test_improvement_sign_and_zero_baseline() {
        assert!((improvement_pct(0.8, 1.0).unwrap() - 25.0).abs() < 1e-9);
        assert!((improvement_pct(0.8, 0.4).unwrap() + 50.0).abs() < 1e-9);
        // Negative baseline: improvement still positive when the variant is higher
        assert!(improvement_pct(-0.5, -0.25).unwrap() > 0.0);
        assert_eq!(improvement_pct(0.0, 0.3), None);
    }

    #[test]
    fn test_recommend_action_thresholds() {
        assert_eq!(recommend_action(Some(25.0), 5.0, -5.0), Recommendation::Promote);
        assert_eq!(recommend_action(Some(5.0), 5.0, -5.0), Recommendation::Promote);
        assert_eq!(recommend_action(Some(1.0), 5.0, -5.0), Recommendation::Investigate);
        assert_eq!(recommend_action(Some(-50.0), 5.0, -5.0), Recommendation::KeepBaseline);
        assert_eq!(recommend_action(None, 5.0, -5.0), Recommendation::Investigate);
    }

    #[test]
    fn test_spec_validation() {
        let ok = ExperimentSpec::new("exp", "routing").with_variant("ts", 0.5, ThompsonConfig::new(0));
        assert!(ok.validate().is_ok());

        assert!(ExperimentSpec::new("exp", "routing").validate().is_err());
        assert!(ok.clone().with_variant("ts", 0.2, ThompsonConfig::new(0)).validate().is_err());
        assert!(ExperimentSpec::new("exp", "routing")
            .with_variant("ts", 1.5, ThompsonConfig::new(0))
            .validate()
            .is_err());
        assert!(ok.clone().with_thresholds(-5.0, 5.0).validate().is_err());
    }

    #[test]
    fn test_spec_serde_defaults() {
        let spec: ExperimentSpec = serde_json::from_str(
            r#"{"id": "e", "domain": "d",
                "variants": [{"name": "v", "traffic_fraction": 0.3,
                              "policy": {"type": "thompson_sampling"}}]}"#,
        )
        .unwrap();
        assert_eq!(spec.shadow_samples, 100);
        assert_eq!(spec.promote_threshold_pct, 5.0);
        assert_eq!(spec.reject_threshold_pct, -5.0);
        assert_eq!(spec.variants[0].policy.dim(), 0);

        let status = serde_json::to_value(VariantStatus::InsufficientData).unwrap();
        assert_eq!(status, "insufficient_data");
    }
}
