//! Routewise Core Library
//!
//! Adaptive routing with online bandit learning:
//! - Bandit policies (Thompson Sampling, Doubly Robust, Offset Tree)
//! - Domain registry with copy-on-write policy snapshots
//! - Shadow experiments comparing alternative policies against live traffic
//! - TOML engine configuration
//!
//! A caller registers a domain, asks it for an arm per request, runs the
//! action, and records the reward:
//!
//! ```no_run
//! use routewise_core::prelude::*;
//!
//! # fn main() -> routewise_core::Result<()> {
//! let engine = LearningEngine::new();
//! engine.register_domain(
//!     "routing",
//!     DoublyRobustConfig::new(3).into(),
//!     DomainOptions::seeded(42),
//! )?;
//!
//! let context = Context::new()
//!     .with_feature("a", 1.0)
//!     .with_feature("b", 0.0)
//!     .with_feature("c", 0.0);
//! let arm = engine.recommend("routing", &context, &["X", "Y"])?;
//! engine.record("routing", &context, &arm, 1.0)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod experiment;
pub mod policy;

pub use error::{Error, ErrorKind, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{DomainConfig, EngineConfig};
    pub use crate::engine::{DomainOptions, DomainStats, LearningEngine};
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::experiment::{ExperimentManager, ExperimentSpec, Recommendation};
    pub use crate::policy::{
        BanditPolicy, Context, DoublyRobustConfig, OffsetTreeConfig, PolicyConfig, PolicyType,
        ThompsonConfig,
    };
}
