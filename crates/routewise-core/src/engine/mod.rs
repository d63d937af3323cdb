//! Domain registry
//!
//! The [`LearningEngine`] owns one policy per named domain and dispatches
//! `recommend`/`record` calls to it.
//!
//! Domains are stored in a sharded map whose shard locks are only held long
//! enough to clone the entry's `Arc`, so work in one domain never waits on
//! another. Inside a domain the policy sits in a [`SnapshotCell`]:
//! recommendations read the published snapshot without locking out other
//! readers, while updates are serialized per domain and published whole.

mod rng;
mod snapshot;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::policy::{
    ArmSummary, BanditPolicy, Context, Policy, PolicyConfig, PolicyDiagnostics, PolicyType,
};

pub use rng::RngSource;
pub use snapshot::{Snapshot, SnapshotCell};

/// Decisions kept per domain for the recent-window summary
pub const RECENT_WINDOW: usize = 256;

/// Registration options for a domain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainOptions {
    /// Replace an existing domain of the same name instead of failing
    pub overwrite: bool,
    /// Seed for reproducible recommendations
    pub seed: Option<u64>,
}

impl DomainOptions {
    pub fn seeded(seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..Default::default()
        }
    }

    pub fn overwrite() -> Self {
        Self {
            overwrite: true,
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_overwrite(mut self) -> Self {
        self.overwrite = true;
        self
    }
}

/// One observed outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: Uuid,
    pub context: Context,
    pub arm: String,
    pub reward: f64,
    pub timestamp: DateTime<Utc>,
}

/// Serializable view of a domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainStats {
    pub domain: String,
    pub policy_type: PolicyType,
    pub dim: usize,
    /// Snapshot version, incremented by every successful update
    pub version: u64,
    pub total_updates: u64,
    pub arms: Vec<ArmSummary>,
    /// Decisions in the recent window
    pub recent_decisions: usize,
    pub recent_mean_reward: Option<f64>,
    pub diagnostics: PolicyDiagnostics,
    pub seed: Option<u64>,
    pub registered_at: DateTime<Utc>,
}

struct DomainEntry {
    config: PolicyConfig,
    policy: SnapshotCell<Policy>,
    rng: RngSource,
    recent: Mutex<VecDeque<DecisionRecord>>,
    registered_at: DateTime<Utc>,
}

impl DomainEntry {
    fn push_recent(&self, record: DecisionRecord) {
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        if recent.len() == RECENT_WINDOW {
            recent.pop_front();
        }
        recent.push_back(record);
    }
}

/// Registry of named domains, each owning one policy
#[derive(Default)]
pub struct LearningEngine {
    domains: DashMap<String, Arc<DomainEntry>>,
}

impl LearningEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an engine with every domain of `config` registered
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let engine = Self::new();
        for domain in &config.domains {
            let options = DomainOptions {
                overwrite: false,
                seed: domain.seed,
            };
            engine.register_domain(&domain.name, domain.policy.clone(), options)?;
        }
        Ok(engine)
    }

    /// Register `name` with a freshly built policy
    ///
    /// The configuration is validated here, so a bad `dim` or parameter fails
    /// registration rather than the first request.
    pub fn register_domain(
        &self,
        name: impl Into<String>,
        config: PolicyConfig,
        options: DomainOptions,
    ) -> Result<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::invalid_config("domain name must not be empty"));
        }
        let policy = Policy::from_config(&config)?;
        let policy_type = config.policy_type();
        let entry = Arc::new(DomainEntry {
            config,
            policy: SnapshotCell::new(policy),
            rng: RngSource::new(options.seed),
            recent: Mutex::new(VecDeque::new()),
            registered_at: Utc::now(),
        });

        match self.domains.entry(name.clone()) {
            Entry::Occupied(mut occupied) => {
                if !options.overwrite {
                    return Err(Error::DomainExists(name));
                }
                warn!(domain = %name, policy = %policy_type, "Replacing existing domain");
                occupied.insert(entry);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }

        info!(domain = %name, policy = %policy_type, seed = ?options.seed, "Registered domain");
        Ok(())
    }

    /// Remove a domain and its learned state
    pub fn unregister_domain(&self, name: &str) -> Result<()> {
        self.domains
            .remove(name)
            .ok_or_else(|| Error::DomainNotFound(name.to_string()))?;
        info!(domain = %name, "Unregistered domain");
        Ok(())
    }

    pub fn contains_domain(&self, name: &str) -> bool {
        self.domains.contains_key(name)
    }

    /// Registered domain names, sorted
    pub fn list_domains(&self) -> Vec<String> {
        let mut names: Vec<String> = self.domains.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Configuration the domain was registered with
    pub fn domain_config(&self, name: &str) -> Result<PolicyConfig> {
        Ok(self.entry(name)?.config.clone())
    }

    /// Pick one of `candidates` for `context`
    pub fn recommend<S: AsRef<str>>(
        &self,
        domain: &str,
        context: &Context,
        candidates: &[S],
    ) -> Result<String> {
        let entry = self.entry(domain)?;
        let candidates: Vec<&str> = candidates.iter().map(AsRef::as_ref).collect();
        let snapshot = entry.policy.load();
        let mut rng = entry.rng.next_rng();
        let arm = snapshot.recommend(context, &candidates, &mut rng)?;
        debug!(domain, arm = %arm, version = snapshot.version(), "Recommended arm");
        Ok(arm)
    }

    /// Feed an observed outcome back to the domain's policy
    pub fn record(&self, domain: &str, context: &Context, arm: &str, reward: f64) -> Result<()> {
        self.record_inner(domain, context, arm, reward, None)
    }

    /// Like [`record`](Self::record), with the probability the served arm had
    /// under the logging policy
    pub fn record_with_propensity(
        &self,
        domain: &str,
        context: &Context,
        arm: &str,
        reward: f64,
        propensity: f64,
    ) -> Result<()> {
        self.record_inner(domain, context, arm, reward, Some(propensity))
    }

    fn record_inner(
        &self,
        domain: &str,
        context: &Context,
        arm: &str,
        reward: f64,
        propensity: Option<f64>,
    ) -> Result<()> {
        let entry = self.entry(domain)?;
        let ((), version) = entry
            .policy
            .update(|policy| policy.update(arm, reward, context, propensity))?;

        entry.push_recent(DecisionRecord {
            id: Uuid::new_v4(),
            context: context.clone(),
            arm: arm.to_string(),
            reward,
            timestamp: Utc::now(),
        });
        debug!(domain, arm, reward, version, "Recorded outcome");
        Ok(())
    }

    /// Expected reward per known arm
    pub fn expected_values(&self, domain: &str) -> Result<HashMap<String, f64>> {
        Ok(self.entry(domain)?.policy.load().expected_values())
    }

    /// Current published policy, for read-only inspection
    pub fn policy_snapshot(&self, domain: &str) -> Result<Snapshot<Policy>> {
        Ok(self.entry(domain)?.policy.load())
    }

    /// Most recent decisions, oldest first
    pub fn recent_decisions(&self, domain: &str) -> Result<Vec<DecisionRecord>> {
        let entry = self.entry(domain)?;
        let recent = entry.recent.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(recent.iter().cloned().collect())
    }

    /// Serializable snapshot of a domain
    pub fn get_stats(&self, domain: &str) -> Result<DomainStats> {
        let entry = self.entry(domain)?;
        let snapshot = entry.policy.load();

        let (recent_decisions, recent_mean_reward) = {
            let recent = entry.recent.lock().unwrap_or_else(PoisonError::into_inner);
            let mean = (!recent.is_empty())
                .then(|| recent.iter().map(|r| r.reward).sum::<f64>() / recent.len() as f64);
            (recent.len(), mean)
        };

        Ok(DomainStats {
            domain: domain.to_string(),
            policy_type: snapshot.policy_type(),
            dim: snapshot.dim(),
            version: snapshot.version(),
            total_updates: snapshot.total_updates(),
            arms: snapshot.arm_summaries(),
            recent_decisions,
            recent_mean_reward,
            diagnostics: snapshot.diagnostics(),
            seed: entry.rng.seed(),
            registered_at: entry.registered_at,
        })
    }

    fn entry(&self, domain: &str) -> Result<Arc<DomainEntry>> {
        self.domains
            .get(domain)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| Error::DomainNotFound(domain.to_string()))
    }
}
