//! Error types for the diagonalization and its gradient.
//!
//! Every failure that can arise while tridiagonalizing, diagonalizing, or back-propagating
//! through an implicit operator is one variant of a private kind enum, hidden behind the
//! opaque public [`DiagonalizationError`]. Callers branch on the kind through the `is_*`
//! accessors.
//!
//! [`faer::linalg::evd::EvdError`] does not implement [`std::error::Error`], so it is
//! carried as a plain field and formatted with `Debug`.
//!
//! A Lanczos breakdown is not an error: an invariant Krylov subspace ends the iteration
//! early and the caller receives fewer columns.
use thiserror::Error;

/// Represents all possible errors that can occur during a diagonalization or its gradient.
#[derive(Error, Debug)]
#[error(transparent)]
pub struct DiagonalizationError(#[from] DiagonalizationErrorKind);

/// The distinct kinds of failure.
#[derive(Error, Debug, PartialEq)]
pub(crate) enum DiagonalizationErrorKind {
    /// A declared shape disagrees with what was actually supplied or produced.
    #[error("Invalid shape for {what}: expected {expected}, found {actual}.")]
    InvalidShape {
        what: String,
        expected: String,
        actual: String,
    },

    /// Indicates that an invalid input parameter was provided to a function.
    #[error("Invalid input parameter: {0}")]
    InputError(String),

    /// The operator representation could not build an operator from its parameters.
    #[error("Failed to build the operator from its parameters: {0}")]
    Representation(String),

    /// Wraps an error originating from [`faer`]'s eigendecomposition module.
    #[error("A numerical error occurred during the eigendecomposition of the tridiagonal matrix: {0:?}")]
    NumericalFailure(faer::linalg::evd::EvdError),
}

impl DiagonalizationError {
    pub(crate) fn invalid_shape(
        what: impl Into<String>,
        expected: impl std::fmt::Debug,
        actual: impl std::fmt::Debug,
    ) -> Self {
        DiagonalizationErrorKind::InvalidShape {
            what: what.into(),
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
        .into()
    }

    pub(crate) fn input(message: impl Into<String>) -> Self {
        DiagonalizationErrorKind::InputError(message.into()).into()
    }

    /// Builds the error a representation returns when its parameters are unusable.
    pub fn representation(message: impl Into<String>) -> Self {
        DiagonalizationErrorKind::Representation(message.into()).into()
    }

    /// True if a declared shape did not match the data.
    pub fn is_invalid_shape(&self) -> bool {
        matches!(self.0, DiagonalizationErrorKind::InvalidShape { .. })
    }

    /// True if the tridiagonal eigensolver failed to converge.
    pub fn is_numerical_failure(&self) -> bool {
        matches!(self.0, DiagonalizationErrorKind::NumericalFailure(_))
    }

    /// True if a scalar input (iteration count, probe vector, configuration) was rejected.
    pub fn is_input_error(&self) -> bool {
        matches!(self.0, DiagonalizationErrorKind::InputError(_))
    }
}

impl From<faer::linalg::evd::EvdError> for DiagonalizationError {
    fn from(err: faer::linalg::evd::EvdError) -> Self {
        DiagonalizationErrorKind::NumericalFailure(err).into()
    }
}

// Manually implement PartialEq for the public error type.
// We compare the inner `DiagonalizationErrorKind`.
impl PartialEq for DiagonalizationError {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

// Unit tests to ensure error messages are formatted correctly.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_shape_error_message() {
        let error = DiagonalizationError::invalid_shape("operator output", (5, 1), (4, 1));
        let expected_message = "Invalid shape for operator output: expected (5, 1), found (4, 1).";
        assert_eq!(error.to_string(), expected_message);
        assert!(error.is_invalid_shape());
        assert!(!error.is_input_error());
    }

    #[test]
    fn test_input_error_message() {
        let error = DiagonalizationError::input("`max_iter` must be at least 1.");
        let expected_message = "Invalid input parameter: `max_iter` must be at least 1.";
        assert_eq!(error.to_string(), expected_message);
        assert!(error.is_input_error());
    }

    #[test]
    fn test_representation_error_message() {
        let error = DiagonalizationError::representation("expected 2 parameter tensors, got 1");
        let expected_message =
            "Failed to build the operator from its parameters: expected 2 parameter tensors, got 1";
        assert_eq!(error.to_string(), expected_message);
    }

    #[test]
    fn test_numerical_failure_message() {
        let evd_error = faer::linalg::evd::EvdError::NoConvergence;
        let error = DiagonalizationError::from(evd_error);
        // Note: The message uses the `Debug` format for the inner error.
        let expected_message = "A numerical error occurred during the eigendecomposition of the tridiagonal matrix: NoConvergence";
        assert_eq!(error.to_string(), expected_message);
        assert!(error.is_numerical_failure());
    }

    #[test]
    fn test_errors_compare_by_kind() {
        assert_eq!(
            DiagonalizationError::input("a"),
            DiagonalizationError::input("a")
        );
        assert_ne!(
            DiagonalizationError::input("a"),
            DiagonalizationError::representation("a")
        );
    }
}
