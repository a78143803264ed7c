//! Schedulers executing task graphs.
//!
//! Both schedulers run parents before children and report the outcome of
//! every submitted request on a broadcast channel.
//!
//! ```text
//!                      schedule_task_graph(graph, request)
//!                                   │
//!                     ┌─────────────┴──────────────┐
//!                     ▼                            ▼
//!              Resident: notify           Pending: merge nodes by
//!              completion at once         (source, cache key)
//!                                                  │
//!                          ┌───────────────────────┴──────────┐
//!                          ▼                                  ▼
//!                   rayon cpu pool                     rayon disk pool
//!                  (cpu_workers threads)            (disk_workers threads)
//!                          │                                  │
//!                          └──────────► complete(node) ◄──────┘
//!                                  release children,
//!                                  unpin parents, notify
//! ```

use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use jet_common::{JetError, JetResult, Request};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::memory::{Reservation, SourceId};
use crate::task::{Task, TaskGraph, TaskRunner};

const COMPLETION_CHANNEL_CAPACITY: usize = 1024;

/// Outcome of a scheduled request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RequestOutcome {
    Completed,
    Failed(String),
}

/// Completion notification, keyed by the submitted request string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataRequestCompleted {
    pub request: String,
    pub outcome: RequestOutcome,
}

impl DataRequestCompleted {
    pub fn is_success(&self) -> bool {
        self.outcome == RequestOutcome::Completed
    }
}

/// Executes task graphs.
pub trait Scheduler: Send + Sync {
    /// Submit a graph; completion of `request` is announced on
    /// [`Scheduler::subscribe`].
    fn schedule_task_graph(&self, graph: TaskGraph, request: &str);

    fn subscribe(&self) -> broadcast::Receiver<DataRequestCompleted>;

    /// Block until all submitted work has finished.
    fn wait_until_idle(&self);

    fn is_busy(&self) -> bool;
}

fn notify(sender: &broadcast::Sender<DataRequestCompleted>, request: String, outcome: RequestOutcome) {
    // No subscribers is fine.
    let _ = sender.send(DataRequestCompleted { request, outcome });
}

fn node_key(runner: &Arc<dyn TaskRunner>, request: &Request) -> (SourceId, String) {
    let key = runner
        .cache_key(request)
        .unwrap_or_else(|_| request.canonical());
    (runner.source_id(), key)
}

/// Run one task, turning a panic into a task failure.
fn run_task(runner: &Arc<dyn TaskRunner>, request: &Request) -> JetResult<Reservation> {
    debug!(source = runner.source_name(), request = %request, "Running task");
    panic::catch_unwind(AssertUnwindSafe(|| runner.run(request))).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(source = runner.source_name(), request = %request, %message, "Task panicked");
        Err(JetError::Scheduler(format!(
            "task on {} panicked: {}",
            runner.source_name(),
            message
        )))
    })
}

// ============================================================================
// Single-thread scheduler
// ============================================================================

/// Runs graphs synchronously on the submitting thread.
pub struct SingleThreadScheduler {
    completions: broadcast::Sender<DataRequestCompleted>,
}

impl SingleThreadScheduler {
    pub fn new() -> Self {
        let (completions, _) = broadcast::channel(COMPLETION_CHANNEL_CAPACITY);
        Self { completions }
    }

    /// Run `task` after its parents, depth first. Each key runs once per graph.
    fn execute(
        &self,
        task: Task,
        seen: &mut HashSet<(SourceId, String)>,
    ) -> JetResult<Option<Reservation>> {
        let (runner, request, parents, _) = task.into_parts();
        let key = node_key(&runner, &request);
        if seen.contains(&key) {
            return Ok(None);
        }

        let mut pins = Vec::with_capacity(parents.len());
        for parent in parents {
            match parent {
                TaskGraph::Resident(reservation) => pins.push(reservation),
                TaskGraph::Pending(parent) => {
                    if let Some(reservation) = self.execute(parent, seen).map_err(|e| {
                        JetError::Scheduler(format!("upstream task failed: {}", e))
                    })? {
                        pins.push(reservation);
                    }
                }
            }
        }

        let result = run_task(&runner, &request)?;
        seen.insert(key);
        Ok(Some(result))
    }
}

impl Default for SingleThreadScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for SingleThreadScheduler {
    fn schedule_task_graph(&self, graph: TaskGraph, request: &str) {
        let outcome = match graph {
            TaskGraph::Resident(_) => RequestOutcome::Completed,
            TaskGraph::Pending(task) => match self.execute(task, &mut HashSet::new()) {
                Ok(_) => RequestOutcome::Completed,
                Err(e) => {
                    warn!(request, error = %e, "Request failed");
                    RequestOutcome::Failed(e.to_string())
                }
            },
        };
        notify(&self.completions, request.to_string(), outcome);
    }

    fn subscribe(&self) -> broadcast::Receiver<DataRequestCompleted> {
        self.completions.subscribe()
    }

    fn wait_until_idle(&self) {}

    fn is_busy(&self) -> bool {
        false
    }
}

// ============================================================================
// Multi-thread scheduler
// ============================================================================

type NodeId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeStatus {
    Waiting,
    Ready,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    Cpu,
    Disk,
}

struct Node {
    runner: Arc<dyn TaskRunner>,
    request: Request,
    key: (SourceId, String),
    lane: Lane,
    status: NodeStatus,
    /// Parents that have not completed yet.
    waiting_on: usize,
    parent_failure: Option<String>,
    failure: Option<String>,
    parents: Vec<NodeId>,
    children: Vec<NodeId>,
    /// Children that still need this node's result.
    dependents: usize,
    pins: Vec<Reservation>,
    result: Option<Reservation>,
    notify: Vec<String>,
}

impl Node {
    fn is_finished(&self) -> bool {
        matches!(self.status, NodeStatus::Done | NodeStatus::Failed)
    }
}

#[derive(Default)]
struct GraphState {
    nodes: HashMap<NodeId, Node>,
    index: HashMap<(SourceId, String), NodeId>,
    /// Nodes that became runnable and still need to be spawned.
    ready: Vec<(NodeId, Lane)>,
    next_id: NodeId,
    shutdown: bool,
}

impl GraphState {
    /// Add `task` and its pending ancestors, merging nodes already known.
    fn insert_task(&mut self, task: Task) -> NodeId {
        let (runner, request, parents, disk_reader) = task.into_parts();
        let key = node_key(&runner, &request);
        if let Some(&existing) = self.index.get(&key) {
            // The duplicate's parent reservations are released here.
            return existing;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.index.insert(key.clone(), id);
        self.nodes.insert(
            id,
            Node {
                runner,
                request,
                key,
                lane: if disk_reader { Lane::Disk } else { Lane::Cpu },
                status: NodeStatus::Waiting,
                waiting_on: 0,
                parent_failure: None,
                failure: None,
                parents: Vec::new(),
                children: Vec::new(),
                dependents: 0,
                pins: Vec::new(),
                result: None,
                notify: Vec::new(),
            },
        );

        for parent in parents {
            match parent {
                TaskGraph::Resident(reservation) => {
                    if let Some(node) = self.nodes.get_mut(&id) {
                        node.pins.push(reservation);
                    }
                }
                TaskGraph::Pending(parent) => {
                    let parent_id = self.insert_task(parent);
                    self.link(parent_id, id);
                }
            }
        }

        if self.nodes.get(&id).is_some_and(|n| n.waiting_on == 0) {
            self.make_ready(id);
        }
        id
    }

    fn link(&mut self, parent_id: NodeId, child_id: NodeId) {
        let Some(parent) = self.nodes.get_mut(&parent_id) else {
            return;
        };
        parent.dependents += 1;
        let status = parent.status;
        let failure = parent.failure.clone();
        if !parent.is_finished() {
            parent.children.push(child_id);
        }

        if let Some(child) = self.nodes.get_mut(&child_id) {
            child.parents.push(parent_id);
            match status {
                NodeStatus::Done => {}
                NodeStatus::Failed => {
                    child.parent_failure.get_or_insert(failure.unwrap_or_default());
                }
                _ => child.waiting_on += 1,
            }
        }
    }

    fn make_ready(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        node.status = NodeStatus::Ready;
        self.ready.push((id, node.lane));
    }

    fn take_ready(&mut self) -> Vec<(NodeId, Lane)> {
        std::mem::take(&mut self.ready)
    }

    fn remove_node(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.remove(&id) {
            if self.index.get(&node.key) == Some(&id) {
                self.index.remove(&node.key);
            }
        }
    }

    /// Record the outcome of node `id` and release whatever it unblocks.
    fn complete(
        &mut self,
        id: NodeId,
        outcome: JetResult<Reservation>,
        completions: &broadcast::Sender<DataRequestCompleted>,
    ) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        let pins = std::mem::take(&mut node.pins);
        match outcome {
            Ok(reservation) => {
                node.status = NodeStatus::Done;
                node.result = Some(reservation);
                debug!(source = node.runner.source_name(), request = %node.request, "Task completed");
            }
            Err(e) => {
                node.status = NodeStatus::Failed;
                node.failure = Some(e.to_string());
                warn!(
                    source = node.runner.source_name(),
                    request = %node.request,
                    error = %e,
                    "Task failed"
                );
            }
        }

        let children = std::mem::take(&mut node.children);
        let parents = node.parents.clone();
        let notify_requests = std::mem::take(&mut node.notify);
        let failure = node.failure.clone();
        let dependents = node.dependents;

        for child_id in children {
            let Some(child) = self.nodes.get_mut(&child_id) else {
                continue;
            };
            child.waiting_on -= 1;
            if let Some(f) = &failure {
                child.parent_failure.get_or_insert_with(|| f.clone());
            }
            if child.waiting_on == 0 && child.status == NodeStatus::Waiting {
                self.make_ready(child_id);
            }
        }

        let outcome = match &failure {
            None => RequestOutcome::Completed,
            Some(f) => RequestOutcome::Failed(f.clone()),
        };
        for request in notify_requests {
            notify(completions, request, outcome.clone());
        }

        for parent_id in parents {
            let release = match self.nodes.get_mut(&parent_id) {
                Some(parent) => {
                    parent.dependents -= 1;
                    parent.dependents == 0 && parent.is_finished()
                }
                None => false,
            };
            if release {
                self.remove_node(parent_id);
            }
        }

        if dependents == 0 {
            self.remove_node(id);
        }
        drop(pins);
    }
}

struct Shared {
    state: Mutex<GraphState>,
    idle: Condvar,
    completions: broadcast::Sender<DataRequestCompleted>,
    cpu_pool: ThreadPool,
    disk_pool: ThreadPool,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, GraphState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pool(&self, lane: Lane) -> &ThreadPool {
        match lane {
            Lane::Cpu => &self.cpu_pool,
            Lane::Disk => &self.disk_pool,
        }
    }
}

fn build_pool(lane: &'static str, threads: usize) -> JetResult<ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(move |n| format!("jetcore-{}-{}", lane, n))
        .build()
        .map_err(|e| JetError::Scheduler(format!("failed to start {} pool: {}", lane, e)))
}

/// Runs tasks on a rayon pool for computation and a separate, usually
/// smaller pool for disk readers.
pub struct MultiThreadScheduler {
    shared: Arc<Shared>,
}

impl MultiThreadScheduler {
    /// Start `cpu_workers` CPU threads and `disk_workers` disk threads.
    pub fn new(cpu_workers: usize, disk_workers: usize) -> JetResult<Self> {
        if cpu_workers == 0 || disk_workers == 0 {
            return Err(JetError::config("scheduler needs at least one worker per lane"));
        }
        let (completions, _) = broadcast::channel(COMPLETION_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            state: Mutex::new(GraphState::default()),
            idle: Condvar::new(),
            completions,
            cpu_pool: build_pool("cpu", cpu_workers)?,
            disk_pool: build_pool("disk", disk_workers)?,
        });

        info!(cpu_workers, disk_workers, "Started multi-thread scheduler");
        Ok(Self { shared })
    }

    pub fn from_config(config: &PipelineConfig) -> JetResult<Self> {
        Self::new(config.cpu_workers, config.disk_workers)
    }

    /// Number of tasks known to the scheduler, including finished tasks
    /// whose results are still pinned for dependents.
    pub fn num_tasks(&self) -> usize {
        self.shared.lock_state().nodes.len()
    }
}

/// Spawn each ready node on the pool of its lane.
fn dispatch(shared: &Arc<Shared>, ready: Vec<(NodeId, Lane)>) {
    for (id, lane) in ready {
        let job = Arc::clone(shared);
        shared.pool(lane).spawn(move || run_node(job, id));
    }
}

fn run_node(shared: Arc<Shared>, id: NodeId) {
    let (runner, request, failure) = {
        let mut state = shared.lock_state();
        let shutdown = state.shutdown;
        let Some(node) = state.nodes.get_mut(&id) else {
            return;
        };
        node.status = NodeStatus::Running;
        let failure = match (&node.parent_failure, shutdown) {
            (Some(f), _) => Some(format!("upstream task failed: {}", f)),
            (None, true) => Some("scheduler shut down".to_string()),
            (None, false) => None,
        };
        (Arc::clone(&node.runner), node.request.clone(), failure)
    };

    let outcome = match failure {
        Some(failure) => Err(JetError::Scheduler(failure)),
        None => run_task(&runner, &request),
    };

    let ready = {
        let mut state = shared.lock_state();
        state.complete(id, outcome, &shared.completions);
        if state.nodes.is_empty() {
            shared.idle.notify_all();
        }
        state.take_ready()
    };
    dispatch(&shared, ready);
}

impl Scheduler for MultiThreadScheduler {
    fn schedule_task_graph(&self, graph: TaskGraph, request: &str) {
        let task = match graph {
            TaskGraph::Resident(_) => {
                notify(&self.shared.completions, request.to_string(), RequestOutcome::Completed);
                return;
            }
            TaskGraph::Pending(task) => task,
        };

        let mut state = self.shared.lock_state();
        let id = state.insert_task(task);
        let immediate = match state.nodes.get_mut(&id) {
            Some(node) => match node.status {
                NodeStatus::Done => Some(RequestOutcome::Completed),
                NodeStatus::Failed => Some(RequestOutcome::Failed(
                    node.failure.clone().unwrap_or_default(),
                )),
                _ => {
                    node.notify.push(request.to_string());
                    None
                }
            },
            None => None,
        };
        let ready = state.take_ready();
        drop(state);

        if let Some(outcome) = immediate {
            notify(&self.shared.completions, request.to_string(), outcome);
        }
        dispatch(&self.shared, ready);
    }

    fn subscribe(&self) -> broadcast::Receiver<DataRequestCompleted> {
        self.shared.completions.subscribe()
    }

    fn wait_until_idle(&self) {
        let mut state = self.shared.lock_state();
        while !state.nodes.is_empty() {
            state = self
                .shared
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn is_busy(&self) -> bool {
        !self.shared.lock_state().nodes.is_empty()
    }
}

impl Drop for MultiThreadScheduler {
    fn drop(&mut self) {
        // Queued tasks still drain; they fail fast so dependents release.
        self.shared.lock_state().shutdown = true;
    }
}
