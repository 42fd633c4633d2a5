//! Error types for classification calls

use crate::source::SourceError;

/// Errors that can occur during a classification call.
///
/// Every variant aborts the whole call: no partial results are returned.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    /// Rejected before any tokenization or model call.
    #[error("invalid input{}: {message}", unit_suffix(.unit))]
    InvalidInput {
        unit: Option<usize>,
        message: String,
    },

    /// A completion has no scorable tokens after its prompt.
    #[error("cannot tokenize completion {completion} of unit {unit}: {reason}")]
    Tokenization {
        unit: usize,
        completion: usize,
        reason: String,
    },

    /// The log-probability source failed while scoring a batch.
    #[error("log-probability source failed on batch {batch} (unit {unit})")]
    Source {
        batch: usize,
        unit: usize,
        #[source]
        source: SourceError,
    },

    /// Scores of a unit are NaN or leave no probability mass after the prior.
    #[error("scores of unit {unit} cannot be normalized")]
    DegenerateScores { unit: usize },
}

fn unit_suffix(unit: &Option<usize>) -> String {
    match unit {
        Some(unit) => format!(" (unit {})", unit),
        None => String::new(),
    }
}

impl ClassifyError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        ClassifyError::InvalidInput {
            unit: None,
            message: message.into(),
        }
    }

    pub(crate) fn invalid_unit(unit: usize, message: impl Into<String>) -> Self {
        ClassifyError::InvalidInput {
            unit: Some(unit),
            message: message.into(),
        }
    }

    /// Index of the unit the error refers to, if any.
    pub fn unit(&self) -> Option<usize> {
        match self {
            ClassifyError::InvalidInput { unit, .. } => *unit,
            ClassifyError::Tokenization { unit, .. }
            | ClassifyError::Source { unit, .. }
            | ClassifyError::DegenerateScores { unit } => Some(*unit),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClassifyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_unit() {
        let err = ClassifyError::invalid_unit(3, "prior has 2 entries, expected 3");
        assert_eq!(
            err.to_string(),
            "invalid input (unit 3): prior has 2 entries, expected 3"
        );
        assert_eq!(err.unit(), Some(3));

        let err = ClassifyError::invalid("prompts must not be empty");
        assert_eq!(err.to_string(), "invalid input: prompts must not be empty");
        assert_eq!(err.unit(), None);
    }

    #[test]
    fn test_source_error_is_chained() {
        use std::error::Error;
        let err = ClassifyError::Source {
            batch: 1,
            unit: 4,
            source: SourceError::Unsupported("prefix state"),
        };
        assert!(err.source().is_some());
        assert_eq!(err.unit(), Some(4));
    }
}
