use thiserror::Error;

/// Errors from repository operations (used by trait definitions in stepwise-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors related to workflow definition lifecycle operations.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("workflow not found")]
    NotFound,

    #[error("no active version for workflow")]
    NoActiveVersion,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("workflow file error: {0}")]
    File(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Errors related to approval operations.
#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("approval request not found")]
    NotFound,

    #[error("approval request is not pending")]
    NotPending,

    #[error("'{0}' has already decided on this request")]
    AlreadyDecided(String),

    #[error("'{0}' is not an eligible approver")]
    NotEligible(String),

    #[error("storage error: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn test_definition_error_display() {
        let err = DefinitionError::Validation("duplicate step id 'a'".to_string());
        assert!(err.to_string().contains("duplicate step id"));
    }

    #[test]
    fn test_approval_error_display() {
        let err = ApprovalError::AlreadyDecided("alice".to_string());
        assert_eq!(err.to_string(), "'alice' has already decided on this request");
    }
}
