//! The contract implemented by every pipeline stage.
//!
//! A stage consumes part of a request (its *locally required keys*) and
//! forwards the rest upstream. Its cache key is the request stripped down
//! to [`ScheduledDataSource::required_keys`], so keys no stage on the path
//! reads never cause duplicate cache entries.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use jet_common::{DataItem, JetError, JetResult, Request};
use tracing::debug;

use crate::memory::{CacheHandle, MemoryManager, Reservation, SourceId};
use crate::scheduler::Scheduler;
use crate::task::{Task, TaskGraph, TaskRunner};

/// Shared handle to a stage producing `O`.
pub type SharedSource<O> = Arc<dyn ScheduledDataSource<Output = O>>;

/// Identity and cache shared by every stage implementation.
pub struct SourceCore {
    id: SourceId,
    name: String,
    memory: Arc<MemoryManager>,
}

impl SourceCore {
    pub fn new(name: impl Into<String>, memory: Arc<MemoryManager>) -> Self {
        Self {
            id: SourceId::next(),
            name: name.into(),
            memory,
        }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }
}

impl fmt::Debug for SourceCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceCore")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Build a key set from string slices.
pub fn key_set(keys: &[&str]) -> BTreeSet<String> {
    keys.iter().map(|k| k.to_string()).collect()
}

/// A cached, demand-driven pipeline stage.
pub trait ScheduledDataSource: Send + Sync + 'static {
    type Output: DataItem;

    fn core(&self) -> &SourceCore;

    /// Keys this stage consumes; a request lacking any of them is rejected
    /// or, with pass-through enabled, forwarded upstream.
    fn locally_required_keys(&self) -> &[&'static str];

    /// All keys that influence this stage's result, including optional
    /// local keys and the required keys of every upstream source.
    fn required_keys(&self) -> BTreeSet<String>;

    /// Compute the result. Runs on a normalized request.
    fn produce_data(&self, request: &Request) -> JetResult<Self::Output>;

    /// Add the parent requests `task` depends on.
    fn create_task_graph(&self, request: &Request, task: &mut Task) -> JetResult<()>;

    fn is_disk_reader(&self) -> bool {
        false
    }

    /// Upstream source whose result is forwarded unchanged when the
    /// request lacks this stage's keys.
    fn pass_through(&self) -> Option<&SharedSource<Self::Output>> {
        None
    }

    /// The pass-through source if `request` should be forwarded to it.
    fn passes_through(&self, request: &Request) -> Option<&SharedSource<Self::Output>> {
        let upstream = self.pass_through()?;
        (!request.contains_all(self.locally_required_keys())).then_some(upstream)
    }

    /// Check the local keys and strip `request` down to the required keys.
    fn normalized_request(&self, request: &Request) -> JetResult<Request> {
        let missing = request.missing_keys(self.locally_required_keys());
        if !missing.is_empty() {
            return Err(JetError::missing_keys(request.canonical(), missing));
        }
        let required = self.required_keys();
        let mut reduced = request.clone();
        reduced.retain_only(required.iter().map(String::as_str));
        Ok(reduced)
    }

    /// Resolve `request` from the cache, computing it if absent.
    fn get_data(&self, request: &Request) -> JetResult<CacheHandle<Self::Output>> {
        if let Some(upstream) = self.passes_through(request) {
            return upstream.get_data(request);
        }
        let reduced = self.normalized_request(request)?;
        let key = reduced.canonical();
        let core = self.core();
        core.memory()
            .get_or_compute(core.id(), &key, || self.produce_data(&reduced))
    }

    /// Give back a handle obtained from [`ScheduledDataSource::get_data`].
    fn release_data(&self, handle: CacheHandle<Self::Output>) {
        self.core().memory().release_data(handle);
    }
}

struct SourceRunner<O: DataItem>(SharedSource<O>);

impl<O: DataItem> TaskRunner for SourceRunner<O> {
    fn source_id(&self) -> SourceId {
        self.0.core().id()
    }

    fn source_name(&self) -> &str {
        self.0.core().name()
    }

    fn cache_key(&self, request: &Request) -> JetResult<String> {
        Ok(self.0.normalized_request(request)?.canonical())
    }

    fn run(&self, request: &Request) -> JetResult<Reservation> {
        Ok(self.0.get_data(request)?.into_reservation())
    }
}

/// Build the task graph resolving `request` on `source`.
///
/// Returns [`TaskGraph::Resident`] if the result is already cached.
pub fn get_task_graph<O: DataItem>(
    source: &SharedSource<O>,
    request: &Request,
) -> JetResult<TaskGraph> {
    if let Some(upstream) = source.passes_through(request) {
        return get_task_graph(upstream, request);
    }

    let reduced = source.normalized_request(request)?;
    let core = source.core();
    if let Some(reservation) = core.memory().reserve(core.id(), &reduced.canonical()) {
        debug!(source = core.name(), request = %reduced, "Request already cached");
        return Ok(TaskGraph::Resident(reservation));
    }

    let mut task = Task::new(Arc::new(SourceRunner(Arc::clone(source))), request.clone());
    task.set_disk_reader(source.is_disk_reader());
    source.create_task_graph(request, &mut task)?;
    Ok(TaskGraph::Pending(task))
}

/// Schedule `request` on `source`; completion is announced by `scheduler`
/// under the request's canonical string.
pub fn request_data<O: DataItem>(
    source: &SharedSource<O>,
    scheduler: &dyn Scheduler,
    request: &Request,
) -> JetResult<()> {
    let graph = get_task_graph(source, request)?;
    debug!(
        source = source.core().name(),
        request = %request,
        tasks = graph.num_pending_tasks(),
        "Scheduling request"
    );
    scheduler.schedule_task_graph(graph, &request.canonical());
    Ok(())
}
