use chrono::{DateTime, Utc};
use thiserror::Error;

use leaveflow_core::errors::ApplicationError;

pub mod directory;
pub mod memory;
pub mod outbox;
pub mod policy;
pub mod step;

pub use directory::SqlUserDirectory;
pub use memory::{InMemoryPolicyRepository, InMemoryStepRepository};
pub use outbox::{OutboxEntry, OutboxStatus, SqlNotificationOutbox};
pub use policy::SqlPolicyRepository;
pub use step::SqlStepRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for ApplicationError {
    fn from(error: RepositoryError) -> Self {
        Self::Persistence(error.to_string())
    }
}

pub(crate) fn decode_error(error: impl ToString) -> RepositoryError {
    RepositoryError::Decode(error.to_string())
}

pub(crate) fn parse_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("{column} `{raw}`: {error}")))
}

pub(crate) fn flag(value: bool) -> i64 {
    i64::from(value)
}
