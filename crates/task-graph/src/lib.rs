//! Demand-driven computation substrate for the jet-core pipeline.
//!
//! Turns "give me the data for request K" into a deduplicated,
//! dependency-ordered computation whose results live in a shared,
//! reference-counted cache.
//!
//! # Architecture
//!
//! ```text
//! request_data(source, K)
//!      │
//!      ▼
//! get_task_graph(source, K)
//!      │
//!      ├─► K cached?  ──yes──► TaskGraph::Resident (reference taken)
//!      │
//!      └─► Task(source, K) + create_task_graph() adds parent graphs
//!               │
//!               ▼
//!          Scheduler ──► parents first ──► ScheduledDataSource::get_data
//!               │                                 │
//!               │                                 ▼
//!               │                     MemoryManager::get_or_compute
//!               │                     (one computation per key)
//!               ▼
//!          DataRequestCompleted { request: K }
//! ```

pub mod access;
pub mod config;
pub mod memory;
pub mod scheduler;
pub mod source;
pub mod task;

pub use access::{FileAccess, FileAccessToken};
pub use config::PipelineConfig;
pub use memory::{CacheHandle, CacheKey, CacheStats, MemoryManager, Reservation, SourceId};
pub use scheduler::{
    DataRequestCompleted, MultiThreadScheduler, RequestOutcome, Scheduler, SingleThreadScheduler,
};
pub use source::{get_task_graph, key_set, request_data, ScheduledDataSource, SharedSource, SourceCore};
pub use task::{Task, TaskGraph, TaskRunner};
