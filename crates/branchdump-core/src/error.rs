use std::fmt;
use thiserror::Error;

/// A table whose restore failed, with the statement error that stopped it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFailure {
    pub table: String,
    pub error: String,
}

impl fmt::Display for TableFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.table, self.error)
    }
}

/// Error taxonomy shared by every stage of a restore run.
#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("Validation Error: {0}")]
    Validation(String),
    #[error("Not Found: {0}")]
    NotFound(String),
    #[error("database branch {0} is not ready yet, please try again in a few minutes")]
    NotReady(String),
    #[error("Authorization Error: {0}")]
    Authorization(String),
    #[error("Transient Error: {0}")]
    Transient(String),
    #[error("Connection Error: {0}")]
    Connection(String),
    #[error("Statement Error: all {} tables failed to restore (first: {})", failures.len(), first_failure(failures))]
    Statement { failures: Vec<TableFailure> },
    #[error("Credential Error: {0}")]
    CredentialExpired(String),
    #[error("restore cancelled")]
    Cancelled,
}

fn first_failure(failures: &[TableFailure]) -> String {
    failures
        .first()
        .map(ToString::to_string)
        .unwrap_or_else(|| "none".to_string())
}

impl RestoreError {
    /// True for user-requested cancellation, which is reported apart from failures.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RestoreError::Cancelled)
    }

    /// Short follow-up advice printed under the error, when there is any.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            RestoreError::NotReady(_) => Some("the branch is still provisioning, retry shortly"),
            RestoreError::Authorization(_) => {
                Some("check that your service token can create passwords for this branch")
            }
            RestoreError::Transient(_) => Some("the management API is unavailable, retry shortly"),
            RestoreError::Cancelled => {
                Some("tables restored before the cancellation are kept; resume with --starting-table")
            }
            RestoreError::Statement { .. } => {
                Some("use --overwrite-tables to replace tables that already exist")
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RestoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_error_names_first_failure() {
        let err = RestoreError::Statement {
            failures: vec![
                TableFailure {
                    table: "users".into(),
                    error: "table exists".into(),
                },
                TableFailure {
                    table: "logs".into(),
                    error: "table exists".into(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("all 2 tables"));
        assert!(msg.contains("users: table exists"));
    }

    #[test]
    fn test_cancelled_is_distinct() {
        assert!(RestoreError::Cancelled.is_cancelled());
        assert!(!RestoreError::Connection("reset".into()).is_cancelled());
        assert!(RestoreError::NotReady("main".into()).hint().is_some());
    }
}
