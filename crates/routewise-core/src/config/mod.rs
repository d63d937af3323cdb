//! Engine configuration with file persistence
//!
//! An [`EngineConfig`] lists the domains to register and the experiments to
//! run against them. It is usually written as TOML:
//!
//! ```toml
//! [[domains]]
//! name = "routing"
//! seed = 42
//!
//! [domains.policy]
//! type = "doubly_robust"
//! dim = 3
//! learning_rate = 0.1
//!
//! [[experiments]]
//! id = "tree-vs-dr"
//! domain = "routing"
//! shadow_samples = 200
//!
//! [[experiments.variants]]
//! name = "tree"
//! traffic_fraction = 0.5
//!
//! [experiments.variants.policy]
//! type = "offset_tree"
//! dim = 3
//! ```

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::experiment::ExperimentSpec;
use crate::policy::PolicyConfig;

/// A domain to register at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub policy: PolicyConfig,
}

/// Routewise engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub domains: Vec<DomainConfig>,
    pub experiments: Vec<ExperimentSpec>,
}

impl EngineConfig {
    /// Read, parse and validate a TOML config file
    ///
    /// File access failures carry an [`Error::Io`] that callers can recover
    /// with `downcast_ref`.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(Error::Io)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Write the config as TOML, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .map_err(Error::Io)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }
        let contents = self.to_toml_string()?;
        fs::write(path, contents)
            .map_err(Error::Io)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Check names, references and dimensions across the whole config
    pub fn validate(&self) -> Result<()> {
        let mut dims: HashMap<&str, usize> = HashMap::new();
        for domain in &self.domains {
            if domain.name.trim().is_empty() {
                return Err(Error::invalid_config("domain name must not be empty"));
            }
            domain.policy.validate().map_err(|err| {
                Error::invalid_config(format!("domain '{}': {}", domain.name, err))
            })?;
            if dims.insert(&domain.name, domain.policy.dim()).is_some() {
                return Err(Error::invalid_config(format!(
                    "domain '{}' is defined more than once",
                    domain.name
                )));
            }
        }

        let mut ids = HashSet::new();
        for experiment in &self.experiments {
            experiment.validate()?;
            if !ids.insert(experiment.id.as_str()) {
                return Err(Error::invalid_config(format!(
                    "experiment '{}' is defined more than once",
                    experiment.id
                )));
            }
            let dim = *dims.get(experiment.domain.as_str()).ok_or_else(|| {
                Error::invalid_config(format!(
                    "experiment '{}' references unknown domain '{}'",
                    experiment.id, experiment.domain
                ))
            })?;
            if let Some(variant) = experiment.variants.iter().find(|v| v.policy.dim() != dim) {
                return Err(Error::invalid_config(format!(
                    "variant '{}' of experiment '{}' has dim {}, domain '{}' has dim {}",
                    variant.name,
                    experiment.id,
                    variant.policy.dim(),
                    experiment.domain,
                    dim
                )));
            }
        }
        Ok(())
    }

    pub fn domain(&self, name: &str) -> Option<&DomainConfig> {
        self.domains.iter().find(|d| d.name == name)
    }

    pub fn experiment(&self, id: &str) -> Option<&ExperimentSpec> {
        self.experiments.iter().find(|e| e.id == id)
    }
}
