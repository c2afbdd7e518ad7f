//! Error taxonomy for kernel operations.
//!
//! Only structural and format failures surface here. Per-step numerical
//! shortfalls (a solver exhausting its budget, Newton assembly stopping at
//! its iteration cap) are absorbed into state flags on the system and never
//! become errors.

use thiserror::Error;

/// Errors that can occur during system operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MbdError {
    /// A body handle did not resolve in this system.
    #[error("body not found: {0}")]
    BodyNotFound(u64),

    /// A link handle did not resolve in this system.
    #[error("link not found: {0}")]
    LinkNotFound(u64),

    /// A marker id did not resolve on any attached body.
    #[error("marker not found: {0}")]
    MarkerNotFound(u64),

    /// Invalid timestep.
    #[error("invalid timestep: {0} (must be positive and finite)")]
    InvalidTimestep(f64),

    /// Simulation diverged (`NaN` or `Inf` detected).
    #[error("simulation diverged: {reason}")]
    Diverged {
        /// Description of what went wrong.
        reason: String,
    },

    /// Invalid configuration value.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// Invalid mass properties.
    #[error("invalid mass properties: {reason}")]
    InvalidMassProperties {
        /// Description of what's wrong.
        reason: String,
    },

    /// A snapshot could not be restored.
    #[error("snapshot restore failed: {reason}")]
    Snapshot {
        /// Description of the malformed or missing data.
        reason: String,
    },
}

impl MbdError {
    /// Create a diverged error.
    #[must_use]
    pub fn diverged(reason: impl Into<String>) -> Self {
        Self::Diverged {
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error.
    #[must_use]
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create an invalid mass properties error.
    #[must_use]
    pub fn invalid_mass(reason: impl Into<String>) -> Self {
        Self::InvalidMassProperties {
            reason: reason.into(),
        }
    }

    /// Create a snapshot restore error.
    #[must_use]
    pub fn snapshot(reason: impl Into<String>) -> Self {
        Self::Snapshot {
            reason: reason.into(),
        }
    }

    /// Check if this is a divergence error.
    #[must_use]
    pub fn is_diverged(&self) -> bool {
        matches!(self, Self::Diverged { .. })
    }
}
