//! Core job records persisted in the job store.

use chrono::{DateTime, Utc};
use derive_builder::Builder;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use std::borrow::Cow;

use crate::error::JobError;

#[derive(
    Clone, Copy, Eq, Hash, PartialEq, PartialOrd, Ord, Debug, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
#[serde(transparent)]
/// Globally unique job identifier.
///
/// Backed by a UUID v7 so ids sort by creation time and can be generated
/// before the row is persisted.
pub struct JobId(Uuid);

impl JobId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<JobId> for Uuid {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Eq, Hash, PartialEq, Debug, Serialize, Deserialize)]
#[serde(transparent)]
/// Key selecting the handler that executes a job.
///
/// # Examples
///
/// ```rust
/// use job_queue::JobType;
///
/// const CLEANUP_JOB: JobType = JobType::new("cleanup-job");
/// ```
pub struct JobType(Cow<'static, str>);

impl JobType {
    pub const fn new(job_type: &'static str) -> Self {
        JobType(Cow::Borrowed(job_type))
    }

    pub fn from_owned(job_type: String) -> Self {
        JobType(Cow::Owned(job_type))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Eq, Hash, PartialEq, Debug, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// `completed` and `failed` accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Scheduled, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Scheduled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
/// Structured failure descriptor stored as a job's result when it fails.
pub struct JobFailure {
    pub error: String,
}

impl JobFailure {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }

    pub fn no_handler() -> Self {
        Self::new("No job handler registered")
    }

    pub fn timed_out() -> Self {
        Self::new("timed out")
    }

    /// Uses the error's message, falling back to its debug representation
    /// when the message is empty.
    pub fn from_error<E: std::fmt::Debug + std::fmt::Display + ?Sized>(error: &E) -> Self {
        let message = error.to_string();
        if message.is_empty() {
            Self::new(format!("{error:?}"))
        } else {
            Self::new(message)
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "error": self.error })
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.error)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
/// One row of the job table.
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub args: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub attempts: u32,
    pub owner_id: String,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Decode the stored arguments into a typed struct.
    pub fn args<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.args.clone())
    }

    /// Decode the stored result, if any.
    pub fn result<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.result
            .as_ref()
            .map(|result| serde_json::from_value(result.clone()))
            .transpose()
    }

    /// Parent id recorded by a fan-out handler in this job's arguments.
    pub fn parent_job(&self) -> Option<JobId> {
        self.args
            .get(PARENT_JOB_KEY)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }

    pub fn completed(&self) -> bool {
        self.status == JobStatus::Completed
    }

    pub fn failed(&self) -> bool {
        self.status == JobStatus::Failed
    }
}

/// Key under which child jobs reference the job that spawned them.
pub const PARENT_JOB_KEY: &str = "parentJob";

#[derive(Debug, Builder)]
#[builder(build_fn(error = "JobError"))]
pub struct NewJob {
    #[builder(setter(into), default = "JobId::new()")]
    pub(crate) id: JobId,
    pub(crate) job_type: JobType,
    #[builder(setter(into))]
    pub(crate) owner_id: String,
    #[builder(setter(custom))]
    pub(crate) args: serde_json::Value,
    #[builder(setter(strip_option), default)]
    pub(crate) run_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn builder() -> NewJobBuilder {
        NewJobBuilder::default()
    }

    pub fn id(&self) -> JobId {
        self.id
    }
}

impl NewJobBuilder {
    pub fn args<A: Serialize>(&mut self, args: A) -> Result<&mut Self, JobError> {
        self.args = Some(serde_json::to_value(args).map_err(JobError::CouldNotSerializeArgs)?);
        Ok(self)
    }

    pub fn raw_args(&mut self, args: serde_json::Value) -> &mut Self {
        self.args = Some(args);
        self
    }
}

impl From<derive_builder::UninitializedFieldError> for JobError {
    fn from(e: derive_builder::UninitializedFieldError) -> Self {
        JobError::Config(e.to_string())
    }
}
