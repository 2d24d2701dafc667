//! Registry mapping job types to their handlers.

use std::{collections::HashMap, sync::Arc};

use super::{entity::JobType, runner::*};

/// Table of registered handlers, built before the scheduler starts.
pub struct JobRegistry {
    handlers: HashMap<JobType, Arc<dyn DynJobHandler>>,
}

impl JobRegistry {
    pub(crate) fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a [`JobHandler`]. A later registration for the same type replaces the earlier one.
    pub fn add_handler<H: JobHandler>(&mut self, handler: H) -> JobType {
        let job_type = handler.job_type();
        if self
            .handlers
            .insert(job_type.clone(), Arc::new(TypedHandler(handler)))
            .is_some()
        {
            tracing::warn!(job_type = %job_type, "replacing previously registered job handler");
        }
        job_type
    }

    pub(crate) fn handler(&self, job_type: &JobType) -> Option<Arc<dyn DynJobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    /// Get a list of all registered job types.
    pub(crate) fn registered_job_types(&self) -> Vec<JobType> {
        self.handlers.keys().cloned().collect()
    }
}
