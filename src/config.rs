//! Numerical settings consumed by the diagonalization.
//!
//! The settings are an explicit value passed into every call rather than process-wide
//! state, so two diagonalizations with different settings can run side by side.

use crate::error::DiagonalizationError;
use serde::{Deserialize, Serialize};

/// Default coefficient of the diagonal jitter added to the tridiagonal matrix.
pub const DEFAULT_TRIDIAGONAL_JITTER: f64 = 1e-6;

/// Default relative threshold below which a Lanczos residual counts as a breakdown.
pub const DEFAULT_BREAKDOWN_TOLERANCE: f64 = 1e-10;

/// Settings for [`crate::diagonalization::Diagonalization`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagonalizationConfig {
    /// The tridiagonal matrix is shifted by `tridiagonal_jitter * min(diag(T))` before it is
    /// diagonalized.
    pub tridiagonal_jitter: f64,
    /// When set, the saved state keeps only the operator's parameters; the operator is
    /// rebuilt from its representation when needed.
    pub memory_efficient: bool,
    /// Re-orthogonalize every Lanczos residual against the whole basis.
    pub reorthogonalize: bool,
    /// Residual norms at or below `breakdown_tolerance * ||A q_j||` end the iteration.
    pub breakdown_tolerance: f64,
    /// Process independent batch and probe elements on the `rayon` thread pool.
    pub parallel: bool,
}

impl Default for DiagonalizationConfig {
    fn default() -> Self {
        Self {
            tridiagonal_jitter: DEFAULT_TRIDIAGONAL_JITTER,
            memory_efficient: false,
            reorthogonalize: true,
            breakdown_tolerance: DEFAULT_BREAKDOWN_TOLERANCE,
            parallel: false,
        }
    }
}

impl DiagonalizationConfig {
    pub fn with_tridiagonal_jitter(mut self, jitter: f64) -> Self {
        self.tridiagonal_jitter = jitter;
        self
    }

    pub fn with_memory_efficient(mut self, memory_efficient: bool) -> Self {
        self.memory_efficient = memory_efficient;
        self
    }

    pub fn with_reorthogonalize(mut self, reorthogonalize: bool) -> Self {
        self.reorthogonalize = reorthogonalize;
        self
    }

    pub fn with_breakdown_tolerance(mut self, tolerance: f64) -> Self {
        self.breakdown_tolerance = tolerance;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Rejects settings that would make the iteration meaningless.
    pub fn validate(&self) -> Result<(), DiagonalizationError> {
        if !self.tridiagonal_jitter.is_finite() {
            return Err(DiagonalizationError::input(format!(
                "`tridiagonal_jitter` must be finite, got {}.",
                self.tridiagonal_jitter
            )));
        }
        if !(self.breakdown_tolerance.is_finite() && self.breakdown_tolerance >= 0.0) {
            return Err(DiagonalizationError::input(format!(
                "`breakdown_tolerance` must be a finite non-negative number, got {}.",
                self.breakdown_tolerance
            )));
        }
        if self.tridiagonal_jitter < 0.0 {
            log::warn!(
                "Negative tridiagonal jitter {:e} shifts eigenvalues towards zero.",
                self.tridiagonal_jitter
            );
        }
        if !self.reorthogonalize {
            log::warn!("Reorthogonalization is disabled; the basis may lose orthogonality.");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DiagonalizationConfig::default();
        assert_eq!(config.tridiagonal_jitter, 1e-6);
        assert!(!config.memory_efficient);
        assert!(config.reorthogonalize);
        assert!(!config.parallel);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_setters_chain() {
        let config = DiagonalizationConfig::default()
            .with_tridiagonal_jitter(0.0)
            .with_memory_efficient(true)
            .with_parallel(true);
        assert_eq!(config.tridiagonal_jitter, 0.0);
        assert!(config.memory_efficient);
        assert!(config.parallel);
    }

    #[test]
    fn test_validate_rejects_non_finite() {
        let config = DiagonalizationConfig::default().with_tridiagonal_jitter(f64::NAN);
        assert!(config.validate().unwrap_err().is_input_error());

        let config = DiagonalizationConfig::default().with_breakdown_tolerance(-1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_missing_fields_fall_back_to_defaults() {
        let config: DiagonalizationConfig =
            serde_json::from_str(r#"{ "memory_efficient": true }"#).unwrap();
        assert!(config.memory_efficient);
        assert_eq!(config.tridiagonal_jitter, DEFAULT_TRIDIAGONAL_JITTER);

        let round = serde_json::to_string(&config).unwrap();
        let back: DiagonalizationConfig = serde_json::from_str(&round).unwrap();
        assert_eq!(back, config);
    }
}
