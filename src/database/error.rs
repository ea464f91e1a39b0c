use crate::error::{AppError, AppErrorKind, InfrastructureError};

/// What went wrong at the datastore boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseErrorKind {
    Connection { message: String },
    Query { message: String },
    UniqueViolation { constraint: String },
    NotFound { entity: String, id: String },
    Serialization { message: String },
    Unknown { message: String },
}

#[derive(Debug, Clone)]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
}

impl DatabaseError {
    pub fn new(kind: DatabaseErrorKind) -> Self {
        Self { kind }
    }

    pub fn from_sqlx(error: sqlx::Error) -> Self {
        let kind = match &error {
            sqlx::Error::RowNotFound => DatabaseErrorKind::NotFound {
                entity: "row".to_string(),
                id: String::new(),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseErrorKind::Connection {
                    message: error.to_string(),
                }
            }
            sqlx::Error::Database(db_error) => {
                if db_error.is_unique_violation() {
                    DatabaseErrorKind::UniqueViolation {
                        constraint: db_error.constraint().unwrap_or("unknown").to_string(),
                    }
                } else {
                    DatabaseErrorKind::Query {
                        message: db_error.message().to_string(),
                    }
                }
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                DatabaseErrorKind::Serialization {
                    message: error.to_string(),
                }
            }
            _ => DatabaseErrorKind::Unknown {
                message: error.to_string(),
            },
        };
        Self { kind }
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::UniqueViolation { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::NotFound { .. })
    }

    /// Connection-level failures are worth retrying; query and constraint
    /// failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::Connection { .. })
    }
}

impl std::fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            DatabaseErrorKind::Connection { message } => {
                write!(f, "database connection error: {}", message)
            }
            DatabaseErrorKind::Query { message } => write!(f, "database query error: {}", message),
            DatabaseErrorKind::UniqueViolation { constraint } => {
                write!(f, "unique constraint violated: {}", constraint)
            }
            DatabaseErrorKind::NotFound { entity, id } => {
                write!(f, "{} not found: {}", entity, id)
            }
            DatabaseErrorKind::Serialization { message } => {
                write!(f, "database serialization error: {}", message)
            }
            DatabaseErrorKind::Unknown { message } => write!(f, "database error: {}", message),
        }
    }
}

impl std::error::Error for DatabaseError {}

impl From<sqlx::Error> for DatabaseError {
    fn from(error: sqlx::Error) -> Self {
        Self::from_sqlx(error)
    }
}

impl From<DatabaseError> for AppError {
    fn from(error: DatabaseError) -> Self {
        let is_retryable = error.is_retryable();
        AppError::new(AppErrorKind::Infrastructure(
            InfrastructureError::Database {
                message: error.to_string(),
                is_retryable,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_are_retryable() {
        let error = DatabaseError::new(DatabaseErrorKind::Connection {
            message: "pool timed out".to_string(),
        });
        assert!(error.is_retryable());

        let error = DatabaseError::new(DatabaseErrorKind::Query {
            message: "syntax error".to_string(),
        });
        assert!(!error.is_retryable());
    }

    #[test]
    fn unique_violation_is_detectable() {
        let error = DatabaseError::new(DatabaseErrorKind::UniqueViolation {
            constraint: "payment_transactions_merchant_transaction_id_key".to_string(),
        });
        assert!(error.is_unique_violation());
        assert!(!error.is_not_found());
    }

    #[test]
    fn row_not_found_maps_to_not_found_kind() {
        let error = DatabaseError::from_sqlx(sqlx::Error::RowNotFound);
        assert!(error.is_not_found());
    }
}
