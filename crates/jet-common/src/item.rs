//! Items that can be held by the pipeline's memory manager.

/// A computed result that can live in the shared cache.
///
/// Items are immutable once stored; they are shared between consumers
/// through `Arc`.
pub trait DataItem: Send + Sync + 'static {
    /// Approximate memory footprint in kilobytes, used for the cache limit.
    fn memory_size_kb(&self) -> usize;
}
