//! Error types surfaced by the job service.

use thiserror::Error;

use super::JobId;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("JobError - Sqlx: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("JobError - Migrate: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("JobError - Config: {0}")]
    Config(String),
    #[error("JobError - NotFound: {0}")]
    NotFound(JobId),
    #[error("JobError - InvalidSearch: must provide an owner or a status filter")]
    InvalidSearch,
    #[error("JobError - CouldNotSerializeArgs: {0}")]
    CouldNotSerializeArgs(serde_json::Error),
    #[error("JobError - Store: {0}")]
    Store(String),
}
