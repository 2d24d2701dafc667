//! Composite status and result of fan-out jobs, derived from their children.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::instrument;

use std::{collections::HashSet, sync::Arc};

use super::{
    JobId,
    entity::{Job, JobStatus, JobType},
    error::JobError,
    store::JobStore,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompositeStatus {
    InProgress,
    Completed,
    Failed,
}

impl CompositeStatus {
    /// Job statuses that map onto this composite status.
    pub fn job_statuses(&self) -> &'static [JobStatus] {
        match self {
            CompositeStatus::InProgress => &[JobStatus::Scheduled, JobStatus::Running],
            CompositeStatus::Completed => &[JobStatus::Completed],
            CompositeStatus::Failed => &[JobStatus::Failed],
        }
    }
}

impl From<JobStatus> for CompositeStatus {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Scheduled | JobStatus::Running => CompositeStatus::InProgress,
            JobStatus::Completed => CompositeStatus::Completed,
            JobStatus::Failed => CompositeStatus::Failed,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkStatus {
    pub idx: usize,
    pub job_id: JobId,
    pub label: String,
    pub status: CompositeStatus,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Answer to "what is the overall state of this fan-out job".
pub struct CompositeResult {
    pub job_id: JobId,
    pub job_status: CompositeStatus,
    /// Concatenated child results, present only once every child completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_text: Option<String>,
    /// Per-child statuses ordered by the child's index within the fan-out.
    pub chunk_statuses: Vec<ChunkStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
/// Describes one fan-out relationship: which parent type spawns which child type,
/// and how to read each child.
pub struct FanOut {
    pub parent_type: JobType,
    pub child_type: JobType,
    /// Text contributed by a completed child's result.
    pub result_text: fn(&JsonValue) -> Option<String>,
    /// Label shown for a child in [`CompositeResult::chunk_statuses`].
    pub chunk_label: fn(&Job) -> String,
}

impl FanOut {
    pub const fn new(parent_type: JobType, child_type: JobType) -> Self {
        Self {
            parent_type,
            child_type,
            result_text: default_result_text,
            chunk_label: default_chunk_label,
        }
    }
}

fn default_result_text(result: &JsonValue) -> Option<String> {
    match result {
        JsonValue::String(s) => Some(s.clone()),
        other => other.get("text").and_then(|t| t.as_str()).map(str::to_owned),
    }
}

fn default_chunk_label(child: &Job) -> String {
    child_index(child).to_string()
}

/// Index a child declared within its fan-out, read from its `idx` argument.
pub fn child_index(child: &Job) -> usize {
    child
        .args
        .get("idx")
        .and_then(|v| v.as_u64())
        .map(|idx| idx as usize)
        .unwrap_or(usize::MAX)
}

/// Answers status and search queries for one [`FanOut`].
#[derive(Clone)]
pub struct ResultAggregator {
    store: Arc<dyn JobStore>,
    fan_out: FanOut,
}

impl ResultAggregator {
    pub fn new(store: Arc<dyn JobStore>, fan_out: FanOut) -> Self {
        Self { store, fan_out }
    }

    /// Composite result for the fan-out job `job_id`, or `None` if it does not exist.
    #[instrument(
        name = "job.aggregate.get_result",
        skip(self),
        fields(parent_type = %self.fan_out.parent_type),
        err
    )]
    pub async fn get_result(&self, job_id: JobId) -> Result<Option<CompositeResult>, JobError> {
        let children = self
            .store
            .find_by_parent(&self.fan_out.child_type, job_id)
            .await?;
        if !children.is_empty() {
            return Ok(Some(aggregate_children(&self.fan_out, job_id, children)));
        }

        // Children not spawned yet, fan-out failed before spawning, or the list was empty.
        let Some(parent) = self
            .store
            .find_by_type_and_id(&self.fan_out.parent_type, job_id)
            .await?
        else {
            return Ok(None);
        };
        let job_status = CompositeStatus::from(parent.status);
        Ok(Some(CompositeResult {
            job_id,
            job_status,
            result_text: None,
            chunk_statuses: Vec::new(),
            completed_at: (job_status != CompositeStatus::InProgress).then_some(parent.updated_at),
        }))
    }

    /// Composite results for every fan-out touched by jobs matching the filters.
    ///
    /// A match on a child job resolves to its parent, so each composite is
    /// returned once. Fails with [`JobError::InvalidSearch`] when no filter is given.
    #[instrument(name = "job.aggregate.search", skip(self), err)]
    pub async fn search(
        &self,
        statuses: Option<&[JobStatus]>,
        owner_id: Option<&str>,
    ) -> Result<Vec<CompositeResult>, JobError> {
        if statuses.is_none() && owner_id.is_none() {
            return Err(JobError::InvalidSearch);
        }
        let jobs = self
            .store
            .find_by_status_and_owner(statuses, owner_id)
            .await?;

        let mut seen = HashSet::new();
        let mut parent_ids = Vec::new();
        for job in jobs.iter() {
            let parent_id = if job.job_type == self.fan_out.child_type {
                job.parent_job()
            } else if job.job_type == self.fan_out.parent_type {
                Some(job.id)
            } else {
                None
            };
            if let Some(id) = parent_id {
                if seen.insert(id) {
                    parent_ids.push(id);
                }
            }
        }

        let results = futures::future::try_join_all(
            parent_ids.into_iter().map(|id| self.get_result(id)),
        )
        .await?;
        Ok(results.into_iter().flatten().collect())
    }
}

/// Fold children into a composite: any `failed` child fails the whole, any
/// non-terminal child keeps it in progress, otherwise it is completed.
pub(crate) fn aggregate_children(
    fan_out: &FanOut,
    job_id: JobId,
    mut children: Vec<Job>,
) -> CompositeResult {
    children.sort_by_key(|child| (child_index(child), child.id));

    let mut job_status = CompositeStatus::Completed;
    let mut texts = Vec::with_capacity(children.len());
    let mut completed_at: Option<DateTime<Utc>> = None;
    let mut chunk_statuses = Vec::with_capacity(children.len());

    for child in children.iter() {
        let status = CompositeStatus::from(child.status);
        completed_at = Some(match completed_at {
            Some(at) if at >= child.updated_at => at,
            _ => child.updated_at,
        });
        if status == CompositeStatus::Completed {
            if let Some(text) = child.result.as_ref().and_then(fan_out.result_text) {
                texts.push(text);
            }
        }
        job_status = match (job_status, status) {
            (CompositeStatus::Failed, _) | (_, CompositeStatus::Failed) => CompositeStatus::Failed,
            (CompositeStatus::InProgress, _) | (_, CompositeStatus::InProgress) => {
                CompositeStatus::InProgress
            }
            _ => CompositeStatus::Completed,
        };
        chunk_statuses.push(ChunkStatus {
            idx: child_index(child),
            job_id: child.id,
            label: (fan_out.chunk_label)(child),
            status,
        });
    }

    let (result_text, completed_at) = match job_status {
        CompositeStatus::Completed => (Some(texts.join("\n")), completed_at),
        CompositeStatus::Failed => (None, completed_at),
        CompositeStatus::InProgress => (None, None),
    };

    CompositeResult {
        job_id,
        job_status,
        result_text,
        chunk_statuses,
        completed_at,
    }
}
