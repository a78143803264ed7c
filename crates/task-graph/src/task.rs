//! Task graph nodes.
//!
//! A [`Task`] computes one request on one source after all of its parents
//! have been resolved. Parents that were already cache-resident when the
//! graph was built are represented by a [`TaskGraph::Resident`] reservation,
//! which keeps the item alive until the dependent task has run.

use std::fmt;
use std::sync::Arc;

use jet_common::{JetResult, Request};

use crate::memory::{Reservation, SourceId};

/// Type-erased access to the source that executes a task.
pub trait TaskRunner: Send + Sync {
    fn source_id(&self) -> SourceId;

    fn source_name(&self) -> &str;

    /// Normalized cache key for `request` on this source.
    fn cache_key(&self, request: &Request) -> JetResult<String>;

    /// Resolve `request`, computing it if necessary, and keep one reference.
    fn run(&self, request: &Request) -> JetResult<Reservation>;
}

/// One node of a dependency DAG.
pub struct Task {
    runner: Arc<dyn TaskRunner>,
    request: Request,
    parents: Vec<TaskGraph>,
    disk_reader: bool,
}

impl Task {
    pub fn new(runner: Arc<dyn TaskRunner>, request: Request) -> Self {
        Self {
            runner,
            request,
            parents: Vec::new(),
            disk_reader: false,
        }
    }

    /// Declare a dependency that must be resolved before this task runs.
    pub fn add_parent(&mut self, parent: TaskGraph) {
        self.parents.push(parent);
    }

    /// Mark this task as performing disk I/O.
    pub fn set_disk_reader(&mut self, disk_reader: bool) {
        self.disk_reader = disk_reader;
    }

    pub fn is_disk_reader(&self) -> bool {
        self.disk_reader
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn runner(&self) -> &Arc<dyn TaskRunner> {
        &self.runner
    }

    pub fn parents(&self) -> &[TaskGraph] {
        &self.parents
    }

    pub(crate) fn into_parts(self) -> (Arc<dyn TaskRunner>, Request, Vec<TaskGraph>, bool) {
        (self.runner, self.request, self.parents, self.disk_reader)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("source", &self.runner.source_name())
            .field("request", &self.request.canonical())
            .field("disk_reader", &self.disk_reader)
            .field("parents", &self.parents)
            .finish()
    }
}

/// Result of building the graph for one request.
#[derive(Debug)]
pub enum TaskGraph {
    /// The result is already cached; the reservation holds one reference.
    Resident(Reservation),
    /// The result must be computed.
    Pending(Task),
}

impl TaskGraph {
    pub fn is_resident(&self) -> bool {
        matches!(self, TaskGraph::Resident(_))
    }

    /// Number of tasks that still need to run, counting shared nodes once
    /// per occurrence.
    pub fn num_pending_tasks(&self) -> usize {
        match self {
            TaskGraph::Resident(_) => 0,
            TaskGraph::Pending(task) => {
                1 + task
                    .parents
                    .iter()
                    .map(TaskGraph::num_pending_tasks)
                    .sum::<usize>()
            }
        }
    }
}
