//! Error types for Routewise

use thiserror::Error;

/// Result type alias using Routewise's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classes exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    AlreadyExists,
    InsufficientData,
    InvalidConfig,
    Io,
}

/// Routewise error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Input errors (E100-E199)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Lookup errors (E200-E299)
    #[error("Domain '{0}' not found. Register it before routing traffic to it.")]
    DomainNotFound(String),

    #[error("Experiment '{0}' not found.")]
    ExperimentNotFound(String),

    #[error("Variant '{1}' not found in experiment '{0}'.")]
    VariantNotFound(String, String),

    // Registration errors (E300-E399)
    #[error("Domain '{0}' is already registered. Pass `overwrite` to replace it.")]
    DomainExists(String),

    #[error("Experiment '{0}' is already registered.")]
    ExperimentExists(String),

    // Experiment errors (E400-E499)
    #[error("Variant '{variant}' has {pulls} of {required} shadow samples; not enough data to compare.")]
    InsufficientData {
        variant: String,
        pulls: u64,
        required: u64,
    },

    // Config errors (E500-E599)
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "E100",
            Self::DomainNotFound(_) => "E200",
            Self::ExperimentNotFound(_) => "E201",
            Self::VariantNotFound(..) => "E202",
            Self::DomainExists(_) => "E300",
            Self::ExperimentExists(_) => "E301",
            Self::InsufficientData { .. } => "E400",
            Self::InvalidConfig(_) => "E500",
            Self::Io(_) => "E900",
        }
    }

    /// Map onto the caller-facing error class
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::DomainNotFound(_) | Self::ExperimentNotFound(_) | Self::VariantNotFound(..) => {
                ErrorKind::NotFound
            }
            Self::DomainExists(_) | Self::ExperimentExists(_) => ErrorKind::AlreadyExists,
            Self::InsufficientData { .. } => ErrorKind::InsufficientData,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::DomainNotFound(name) => Some(format!("routewise check <config> (domain '{}')", name)),
            Self::DomainExists(_) => Some("register with DomainOptions::overwrite()".to_string()),
            Self::InsufficientData { required, pulls, .. } => Some(format!(
                "wait for {} more matched observations",
                required.saturating_sub(*pulls)
            )),
            _ => None,
        }
    }

    pub(crate) fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub(crate) fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}
