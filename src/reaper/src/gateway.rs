//! Collaborator contracts consumed by the reaper.
//!
//! The reaper never talks to the catalog store directly; it reads expired
//! candidates through [`WorkSource`] and removes them through
//! [`DeletionGateway`]. Both are implemented for [`common::Catalog`], and
//! both are mockable for tests.

use async_trait::async_trait;
use thiserror::Error;

use common::{Catalog, EntryKey};

/// Failure raised by the work source or the deletion gateway.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The backend rejected the operation. `code` and `message` carry the
    /// driver-specific detail the classifier matches on.
    #[error("database error: {message}")]
    Database {
        code: Option<String>,
        message: String,
    },

    /// A dependent record was already removed by a concurrent operation.
    /// Expected under concurrent reaping, not a hard error.
    #[error("dependent record already gone: {detail}")]
    DependencyGone { detail: String },

    /// The store does not support the requested operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl From<sqlx::Error> for GatewayError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::Database(db) => GatewayError::Database {
                code: db.code().map(|c| c.into_owned()),
                message: db.message().to_string(),
            },
            _ => GatewayError::Database {
                code: None,
                message: error.to_string(),
            },
        }
    }
}

/// Read-only source of expired candidates restricted to a worker's shard.
///
/// Must be safe to call repeatedly; each call is a fresh snapshot and no
/// cursor is retained between calls.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkSource: Send + Sync {
    async fn list_expired(
        &self,
        worker_number: usize,
        total_workers: usize,
        limit: usize,
    ) -> Result<Vec<EntryKey>, GatewayError>;
}

/// Cascading removal of a batch of candidates.
///
/// Either fully applies the batch or errors; partial application is not
/// distinguished by the reaper (the store must be atomic or safely
/// retryable).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeletionGateway: Send + Sync {
    async fn delete(&self, batch: &[EntryKey], cascade: bool) -> Result<(), GatewayError>;
}

#[async_trait]
impl WorkSource for Catalog {
    async fn list_expired(
        &self,
        worker_number: usize,
        total_workers: usize,
        limit: usize,
    ) -> Result<Vec<EntryKey>, GatewayError> {
        let keys = Catalog::list_expired(self, worker_number, total_workers, limit).await?;
        Ok(keys)
    }
}

#[async_trait]
impl DeletionGateway for Catalog {
    async fn delete(&self, batch: &[EntryKey], cascade: bool) -> Result<(), GatewayError> {
        if !cascade {
            return Err(GatewayError::Unsupported(String::from(
                "entries must be removed together with their replication obligations",
            )));
        }

        let removed = self.delete_cascade(batch).await?;
        if removed < batch.len() as u64 {
            // Another worker or a prior cascade got there first
            return Err(GatewayError::DependencyGone {
                detail: format!(
                    "{} of {} entries already removed",
                    batch.len() as u64 - removed,
                    batch.len()
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_error_display() {
        let error = GatewayError::Database {
            code: Some("55P03".to_string()),
            message: "could not obtain lock on relation".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "database error: could not obtain lock on relation"
        );
    }
}
