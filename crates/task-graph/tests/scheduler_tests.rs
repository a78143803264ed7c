//! Integration tests for sources, task graphs and schedulers.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use jet_common::{DataItem, JetError, JetResult, Request};
use task_graph::{
    get_task_graph, key_set, request_data, CacheHandle, MemoryManager, MultiThreadScheduler,
    RequestOutcome, ScheduledDataSource, Scheduler, SharedSource, SingleThreadScheduler,
    SourceCore, Task, TaskGraph,
};

// ============================================================================
// Test sources
// ============================================================================

#[derive(Debug)]
struct Number(i64);

impl DataItem for Number {
    fn memory_size_kb(&self) -> usize {
        1
    }
}

/// Leaf producing `X * 10`.
struct LeafSource {
    core: SourceCore,
    calls: AtomicUsize,
    disk: bool,
    fail_on: Option<i64>,
    panic_on: Option<i64>,
    threads: Mutex<Vec<String>>,
}

impl LeafSource {
    fn new(memory: &Arc<MemoryManager>) -> Self {
        Self {
            core: SourceCore::new("leaf", Arc::clone(memory)),
            calls: AtomicUsize::new(0),
            disk: false,
            fail_on: None,
            panic_on: None,
            threads: Mutex::new(Vec::new()),
        }
    }
}

impl ScheduledDataSource for LeafSource {
    type Output = Number;

    fn core(&self) -> &SourceCore {
        &self.core
    }

    fn locally_required_keys(&self) -> &[&'static str] {
        &["X"]
    }

    fn required_keys(&self) -> BTreeSet<String> {
        key_set(&["X"])
    }

    fn produce_data(&self, request: &Request) -> JetResult<Number> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let name = thread::current().name().unwrap_or("unnamed").to_string();
        self.threads.lock().unwrap().push(name);
        thread::sleep(Duration::from_millis(10));
        let x = request.int_value("X")?;
        if Some(x) == self.fail_on {
            return Err(JetError::unavailable(format!("no data for X={}", x)));
        }
        if Some(x) == self.panic_on {
            panic!("index {} out of bounds", x);
        }
        Ok(Number(x * 10))
    }

    fn create_task_graph(&self, _request: &Request, _task: &mut Task) -> JetResult<()> {
        Ok(())
    }

    fn is_disk_reader(&self) -> bool {
        self.disk
    }
}

/// Sums the leaf results for every value in `SUM_OF`.
struct SumSource {
    core: SourceCore,
    input: SharedSource<Number>,
    calls: AtomicUsize,
}

impl SumSource {
    fn leaf_request(request: &Request, x: &str) -> Request {
        let mut leaf = request.without(&["SUM_OF"]);
        leaf.insert("X", x);
        leaf
    }
}

impl ScheduledDataSource for SumSource {
    type Output = Number;

    fn core(&self) -> &SourceCore {
        &self.core
    }

    fn locally_required_keys(&self) -> &[&'static str] {
        &["SUM_OF"]
    }

    fn required_keys(&self) -> BTreeSet<String> {
        let mut keys = key_set(&["SUM_OF"]);
        keys.extend(self.input.required_keys());
        keys
    }

    fn produce_data(&self, request: &Request) -> JetResult<Number> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut sum = 0;
        for x in request.str_list_value("SUM_OF")? {
            let value = self.input.get_data(&Self::leaf_request(request, &x))?;
            sum += value.0;
        }
        Ok(Number(sum))
    }

    fn create_task_graph(&self, request: &Request, task: &mut Task) -> JetResult<()> {
        for x in request.str_list_value("SUM_OF")? {
            task.add_parent(get_task_graph(&self.input, &Self::leaf_request(request, &x))?);
        }
        Ok(())
    }
}

/// Multiplies by `SCALE`, or forwards its input when pass-through is on.
struct ScaleSource {
    core: SourceCore,
    input: SharedSource<Number>,
    forward: bool,
}

impl ScheduledDataSource for ScaleSource {
    type Output = Number;

    fn core(&self) -> &SourceCore {
        &self.core
    }

    fn locally_required_keys(&self) -> &[&'static str] {
        &["SCALE"]
    }

    fn required_keys(&self) -> BTreeSet<String> {
        let mut keys = key_set(&["SCALE"]);
        keys.extend(self.input.required_keys());
        keys
    }

    fn produce_data(&self, request: &Request) -> JetResult<Number> {
        let scale = request.int_value("SCALE")?;
        let value = self.input.get_data(&request.without(&["SCALE"]))?;
        Ok(Number(value.0 * scale))
    }

    fn create_task_graph(&self, request: &Request, task: &mut Task) -> JetResult<()> {
        task.add_parent(get_task_graph(&self.input, &request.without(&["SCALE"]))?);
        Ok(())
    }

    fn pass_through(&self) -> Option<&SharedSource<Number>> {
        self.forward.then_some(&self.input)
    }
}

fn setup() -> (Arc<MemoryManager>, Arc<LeafSource>, SharedSource<Number>) {
    let memory = MemoryManager::new("test", 1024 * 1024);
    let leaf = Arc::new(LeafSource::new(&memory));
    let shared: SharedSource<Number> = leaf.clone();
    (memory, leaf, shared)
}

fn sum_source(memory: &Arc<MemoryManager>, input: SharedSource<Number>) -> Arc<SumSource> {
    Arc::new(SumSource {
        core: SourceCore::new("sum", Arc::clone(memory)),
        input,
        calls: AtomicUsize::new(0),
    })
}

fn req(s: &str) -> Request {
    Request::parse(s).unwrap()
}

// ============================================================================
// Cache behaviour through the source contract
// ============================================================================

#[test]
fn test_concurrent_get_data_returns_same_object() {
    let (memory, leaf, shared) = setup();

    let threads: Vec<_> = (0..2)
        .map(|_| {
            let source = Arc::clone(&shared);
            thread::spawn(move || source.get_data(&req("X=4")).unwrap())
        })
        .collect();
    let handles: Vec<CacheHandle<Number>> = threads.into_iter().map(|t| t.join().unwrap()).collect();

    assert!(CacheHandle::ptr_eq(&handles[0], &handles[1]));
    assert_eq!(leaf.calls.load(Ordering::SeqCst), 1);
    assert_eq!(memory.reference_count(leaf.core.id(), "X=4;"), 2);
    assert_eq!(handles[0].0, 40);
}

#[test]
fn test_irrelevant_keys_share_cache_entry() {
    let (_memory, leaf, shared) = setup();

    let a = shared.get_data(&req("X=2;COLOUR=red")).unwrap();
    let b = shared.get_data(&req("X=2;COLOUR=blue;SIZE=3")).unwrap();

    assert!(CacheHandle::ptr_eq(&a, &b));
    assert_eq!(leaf.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_missing_local_keys_are_rejected() {
    let (_memory, _leaf, shared) = setup();
    let err = shared.get_data(&req("Y=1")).unwrap_err();
    assert!(matches!(err, JetError::MissingKeys { missing, .. } if missing == vec!["X".to_string()]));
}

#[test]
fn test_released_handle_stays_cached() {
    let (memory, leaf, shared) = setup();

    let handle = shared.get_data(&req("X=1")).unwrap();
    shared.release_data(handle);
    assert_eq!(memory.reference_count(leaf.core.id(), "X=1;"), 0);

    let again = shared.get_data(&req("X=1")).unwrap();
    assert_eq!(again.0, 10);
    assert_eq!(leaf.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_pass_through_forwards_upstream_result() {
    let (memory, _leaf, shared) = setup();
    let scale = ScaleSource {
        core: SourceCore::new("scale", Arc::clone(&memory)),
        input: Arc::clone(&shared),
        forward: true,
    };

    let forwarded = scale.get_data(&req("X=3")).unwrap();
    let direct = shared.get_data(&req("X=3")).unwrap();
    assert!(CacheHandle::ptr_eq(&forwarded, &direct));

    let scaled = scale.get_data(&req("X=3;SCALE=2")).unwrap();
    assert_eq!(scaled.0, 60);
}

#[test]
fn test_without_pass_through_missing_keys_fail() {
    let (memory, _leaf, shared) = setup();
    let scale = ScaleSource {
        core: SourceCore::new("scale", Arc::clone(&memory)),
        input: shared,
        forward: false,
    };
    assert!(scale.get_data(&req("X=3")).is_err());
}

// ============================================================================
// Task graphs
// ============================================================================

#[test]
fn test_task_graph_declares_parents() {
    let (memory, _leaf, shared) = setup();
    let sum: SharedSource<Number> = sum_source(&memory, shared);

    let graph = get_task_graph(&sum, &req("SUM_OF=1/2/3")).unwrap();
    assert_eq!(graph.num_pending_tasks(), 4);
    match graph {
        TaskGraph::Pending(task) => assert_eq!(task.parents().len(), 3),
        TaskGraph::Resident(_) => panic!("nothing is cached yet"),
    }
}

#[test]
fn test_cached_request_short_circuits_graph() {
    let (memory, leaf, shared) = setup();
    let _held = shared.get_data(&req("X=5")).unwrap();

    let graph = get_task_graph(&shared, &req("X=5")).unwrap();
    assert!(graph.is_resident());
    assert_eq!(memory.reference_count(leaf.core.id(), "X=5;"), 2);

    drop(graph);
    assert_eq!(memory.reference_count(leaf.core.id(), "X=5;"), 1);
}

#[test]
fn test_cached_parents_are_resident() {
    let (memory, _leaf, shared) = setup();
    let _one = shared.get_data(&req("X=1")).unwrap();
    let sum: SharedSource<Number> = sum_source(&memory, Arc::clone(&shared));

    let graph = get_task_graph(&sum, &req("SUM_OF=1/2")).unwrap();
    assert_eq!(graph.num_pending_tasks(), 2);
}

// ============================================================================
// Single-thread scheduler
// ============================================================================

#[test]
fn test_single_thread_scheduler_completes_request() {
    let (memory, leaf, shared) = setup();
    let sum = sum_source(&memory, shared);
    let sum_shared: SharedSource<Number> = sum.clone();
    let scheduler = SingleThreadScheduler::new();
    let mut completions = scheduler.subscribe();

    let request = req("SUM_OF=1/2/3");
    request_data(&sum_shared, &scheduler, &request).unwrap();

    let event = completions.try_recv().unwrap();
    assert_eq!(event.request, request.canonical());
    assert!(event.is_success());
    assert_eq!(leaf.calls.load(Ordering::SeqCst), 3);
    assert_eq!(sum.calls.load(Ordering::SeqCst), 1);

    assert_eq!(sum_shared.get_data(&request).unwrap().0, 60);
    assert_eq!(sum.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_single_thread_scheduler_reports_failure() {
    let memory = MemoryManager::new("test", 1024);
    let mut leaf = LeafSource::new(&memory);
    leaf.fail_on = Some(13);
    let leaf: SharedSource<Number> = Arc::new(leaf);
    let sum = sum_source(&memory, leaf);
    let sum_shared: SharedSource<Number> = sum.clone();
    let scheduler = SingleThreadScheduler::new();
    let mut completions = scheduler.subscribe();

    request_data(&sum_shared, &scheduler, &req("SUM_OF=1/13")).unwrap();

    let event = completions.try_recv().unwrap();
    assert!(matches!(event.outcome, RequestOutcome::Failed(_)));
    assert_eq!(sum.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_single_thread_scheduler_reports_panic() {
    let memory = MemoryManager::new("test", 1024);
    let mut leaf = LeafSource::new(&memory);
    leaf.panic_on = Some(5);
    let leaf: SharedSource<Number> = Arc::new(leaf);
    let sum: SharedSource<Number> = sum_source(&memory, leaf);
    let scheduler = SingleThreadScheduler::new();
    let mut completions = scheduler.subscribe();

    request_data(&sum, &scheduler, &req("SUM_OF=1/5")).unwrap();

    let event = completions.try_recv().unwrap();
    assert!(matches!(event.outcome, RequestOutcome::Failed(ref m) if m.contains("panicked")));
}

// ============================================================================
// Multi-thread scheduler
// ============================================================================

#[test]
fn test_multi_thread_scheduler_completes_request() {
    let (memory, leaf, shared) = setup();
    let sum: SharedSource<Number> = sum_source(&memory, shared);
    let scheduler = MultiThreadScheduler::new(3, 1).unwrap();
    let mut completions = scheduler.subscribe();

    let request = req("SUM_OF=1/2/3/4");
    request_data(&sum, &scheduler, &request).unwrap();

    let event = completions.blocking_recv().unwrap();
    assert_eq!(event.request, request.canonical());
    assert!(event.is_success());

    scheduler.wait_until_idle();
    assert!(!scheduler.is_busy());
    assert_eq!(leaf.calls.load(Ordering::SeqCst), 4);
    assert_eq!(sum.get_data(&request).unwrap().0, 100);
}

#[test]
fn test_multi_thread_scheduler_merges_shared_parents() {
    let (memory, leaf, shared) = setup();
    let sum = sum_source(&memory, shared);
    let sum_shared: SharedSource<Number> = sum.clone();
    let scheduler = MultiThreadScheduler::new(4, 1).unwrap();

    request_data(&sum_shared, &scheduler, &req("SUM_OF=1/2/3")).unwrap();
    request_data(&sum_shared, &scheduler, &req("SUM_OF=2/3/4")).unwrap();
    request_data(&sum_shared, &scheduler, &req("SUM_OF=1/2/3")).unwrap();
    scheduler.wait_until_idle();

    assert_eq!(leaf.calls.load(Ordering::SeqCst), 4);
    assert_eq!(sum.calls.load(Ordering::SeqCst), 2);
    // Everything was released once the graphs finished.
    assert_eq!(memory.stats().active_entries, 0);
}

#[test]
fn test_multi_thread_scheduler_propagates_failure() {
    let memory = MemoryManager::new("test", 1024);
    let mut leaf = LeafSource::new(&memory);
    leaf.fail_on = Some(7);
    let leaf: SharedSource<Number> = Arc::new(leaf);
    let sum = sum_source(&memory, leaf);
    let sum_shared: SharedSource<Number> = sum.clone();
    let scheduler = MultiThreadScheduler::new(2, 1).unwrap();
    let mut completions = scheduler.subscribe();

    request_data(&sum_shared, &scheduler, &req("SUM_OF=7/8")).unwrap();

    let event = completions.blocking_recv().unwrap();
    assert!(matches!(event.outcome, RequestOutcome::Failed(_)));
    scheduler.wait_until_idle();
    assert_eq!(sum.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_disk_reader_tasks_use_disk_lane() {
    let memory = MemoryManager::new("test", 1024);
    let mut leaf = LeafSource::new(&memory);
    leaf.disk = true;
    let leaf = Arc::new(leaf);
    let leaf_shared: SharedSource<Number> = leaf.clone();
    let sum: SharedSource<Number> = sum_source(&memory, leaf_shared);
    let scheduler = MultiThreadScheduler::new(2, 1).unwrap();

    request_data(&sum, &scheduler, &req("SUM_OF=1/2/3")).unwrap();
    scheduler.wait_until_idle();

    let threads = leaf.threads.lock().unwrap();
    assert_eq!(threads.len(), 3);
    assert!(threads.iter().all(|t| t.starts_with("jetcore-disk")));
}

#[test]
fn test_resident_request_completes_immediately() {
    let (_memory, _leaf, shared) = setup();
    let _held = shared.get_data(&req("X=9")).unwrap();
    let scheduler = MultiThreadScheduler::new(1, 1).unwrap();
    let mut completions = scheduler.subscribe();

    request_data(&shared, &scheduler, &req("X=9")).unwrap();

    let event = completions.blocking_recv().unwrap();
    assert!(event.is_success());
    assert_eq!(scheduler.num_tasks(), 0);
}

#[test]
fn test_multi_thread_scheduler_survives_panicking_task() {
    let memory = MemoryManager::new("test", 1024);
    let mut leaf = LeafSource::new(&memory);
    leaf.panic_on = Some(5);
    let leaf: SharedSource<Number> = Arc::new(leaf);
    let sum = sum_source(&memory, leaf);
    let sum_shared: SharedSource<Number> = sum.clone();
    let scheduler = MultiThreadScheduler::new(2, 1).unwrap();
    let mut completions = scheduler.subscribe();

    request_data(&sum_shared, &scheduler, &req("SUM_OF=1/5")).unwrap();
    let event = completions.blocking_recv().unwrap();
    assert!(matches!(event.outcome, RequestOutcome::Failed(ref m) if m.contains("panicked")));
    scheduler.wait_until_idle();
    assert_eq!(sum.calls.load(Ordering::SeqCst), 0);

    // The pool keeps serving requests afterwards.
    request_data(&sum_shared, &scheduler, &req("SUM_OF=1/2")).unwrap();
    let event = completions.blocking_recv().unwrap();
    assert!(event.is_success());
    scheduler.wait_until_idle();
    assert_eq!(sum_shared.get_data(&req("SUM_OF=1/2")).unwrap().0, 30);
}
