//! Traits and types used when defining job logic.

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;

use std::panic::AssertUnwindSafe;

use super::{
    current::CurrentJob,
    entity::{JobFailure, JobType},
};

/// Error type returned by handlers. Any error converts into it with `?`.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait]
/// Implemented by the code that performs one job type's work.
///
/// Arguments and output are typed per job type; the engine stores them as
/// opaque JSON and only the matching handler decodes them. A handler may run
/// more than once for the same logical unit of work (a reclaimed job can be
/// claimed again while the first run is still in flight), so it must be safe
/// to repeat.
pub trait JobHandler: Send + Sync + 'static {
    /// Payload stored in the job's `args`.
    type Args: Serialize + DeserializeOwned + Send + Sync + 'static;
    /// Value stored in the job's `result` on success.
    type Output: Serialize + Send + 'static;

    /// Returns the job type identifier.
    fn job_type(&self) -> JobType;

    /// Execute the job. Returning an error routes it through the retry path.
    async fn run(&self, args: Self::Args, current_job: CurrentJob)
    -> Result<Self::Output, HandlerError>;
}

#[async_trait]
/// Type-erased view over a registered [`JobHandler`].
pub(crate) trait DynJobHandler: Send + Sync {
    async fn execute(&self, current_job: CurrentJob) -> Result<JsonValue, JobFailure>;
}

pub(crate) struct TypedHandler<H>(pub H);

#[async_trait]
impl<H: JobHandler> DynJobHandler for TypedHandler<H> {
    async fn execute(&self, current_job: CurrentJob) -> Result<JsonValue, JobFailure> {
        let args: H::Args = current_job
            .args()
            .map_err(|e| JobFailure::new(format!("Invalid job args: {e}")))?;
        let output = match AssertUnwindSafe(self.0.run(args, current_job))
            .catch_unwind()
            .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(JobFailure::from_error(e.as_ref())),
            Err(panic) => {
                let message = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic payload".to_string()
                };
                tracing::error!(
                    target: "job.panic",
                    panic_message = %message,
                    "Job panicked during execution"
                );
                return Err(JobFailure::new(format!("Job panicked: {message}")));
            }
        };
        serde_json::to_value(output).map_err(|e| JobFailure::new(format!("Invalid job output: {e}")))
    }
}
