//! Balanced partition of taxa for data-parallel per-taxon reductions.

use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use rayon::{ThreadPool, ThreadPoolBuilder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskPoolError {
    #[error("failed to build worker pool: {0}")]
    Build(#[from] rayon::ThreadPoolBuildError),
}

/// One worker's contiguous taxon range. Immutable after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaxonTaskIndices {
    pub start: usize,
    pub stop: usize,
    pub task: usize,
}

impl TaxonTaskIndices {
    pub fn len(&self) -> usize {
        self.stop - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.stop == self.start
    }
}

/// Partitions `[0, taxon_count)` into balanced contiguous blocks and owns the
/// worker pool that processes them.
///
/// The `threads` argument keeps the signed contract of the original system:
/// positive builds a fixed pool of that size, negative a pool sized by its
/// magnitude, zero runs everything synchronously on the calling thread.
/// Blocks are `ceil(taxon_count / |threads|)` taxa wide, the last possibly
/// shorter, so `num_tasks()` can come out below the requested thread count
/// when there are few taxa.
///
/// The pool is built once here and shared by every provider holding an `Arc`
/// to this instance; it is torn down when the last `Arc` drops. The raw
/// executor is never exposed: the only capability offered is "run one closure
/// per block and wait for all of them".
pub struct TaxonTaskPool {
    taxon_count: usize,
    indices: Vec<TaxonTaskIndices>,
    pool: Option<ThreadPool>,
}

impl TaxonTaskPool {
    pub fn new(taxon_count: usize, threads: i32) -> Result<Self, TaskPoolError> {
        let requested = if threads == 0 {
            1
        } else {
            threads.unsigned_abs() as usize
        };
        let indices = partition(taxon_count, requested);

        let pool = if threads != 0 && indices.len() > 1 {
            Some(ThreadPoolBuilder::new().num_threads(requested).build()?)
        } else {
            None
        };

        Ok(Self {
            taxon_count,
            indices,
            pool,
        })
    }

    pub fn taxon_count(&self) -> usize {
        self.taxon_count
    }

    /// Number of blocks actually created; may be less than the requested
    /// thread count.
    pub fn num_tasks(&self) -> usize {
        self.indices.len()
    }

    pub fn indices(&self) -> &[TaxonTaskIndices] {
        &self.indices
    }

    /// Run `f` once per block and block until every invocation completes.
    /// Results come back in task order regardless of execution order, so
    /// callers can reduce them deterministically.
    pub fn map_tasks<R, F>(&self, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(&TaxonTaskIndices) -> R + Send + Sync,
    {
        match &self.pool {
            None => self.indices.iter().map(f).collect(),
            Some(pool) => pool.install(|| self.indices.par_iter().map(f).collect()),
        }
    }
}

fn partition(taxon_count: usize, requested: usize) -> Vec<TaxonTaskIndices> {
    if taxon_count == 0 {
        return Vec::new();
    }
    let block = taxon_count.div_ceil(requested);
    let mut indices = Vec::new();
    let mut start = 0;
    let mut task = 0;
    while start < taxon_count {
        let stop = (start + block).min(taxon_count);
        indices.push(TaxonTaskIndices { start, stop, task });
        start = stop;
        task += 1;
    }
    indices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_cover_range_without_overlap() {
        let pool = TaxonTaskPool::new(10, 4).unwrap();
        let indices = pool.indices();
        assert_eq!(indices.len(), 4);
        assert_eq!(indices[0], TaxonTaskIndices { start: 0, stop: 3, task: 0 });
        assert_eq!(indices[3], TaxonTaskIndices { start: 9, stop: 10, task: 3 });
        let covered: usize = indices.iter().map(TaxonTaskIndices::len).sum();
        assert_eq!(covered, 10);
    }

    #[test]
    fn fewer_taxa_than_threads_shrinks_task_count() {
        let pool = TaxonTaskPool::new(3, 8).unwrap();
        assert_eq!(pool.num_tasks(), 3);
        assert!(pool.indices().iter().all(|idx| idx.len() == 1));
    }

    #[test]
    fn zero_threads_runs_synchronously() {
        let pool = TaxonTaskPool::new(5, 0).unwrap();
        assert_eq!(pool.num_tasks(), 1);
        let sums = pool.map_tasks(|idx| (idx.start..idx.stop).sum::<usize>());
        assert_eq!(sums, vec![10]);
    }

    #[test]
    fn negative_thread_count_uses_magnitude() {
        let pool = TaxonTaskPool::new(8, -2).unwrap();
        assert_eq!(pool.num_tasks(), 2);
        let sums = pool.map_tasks(|idx| idx.len());
        assert_eq!(sums, vec![4, 4]);
    }

    #[test]
    fn map_tasks_preserves_task_order() {
        let pool = TaxonTaskPool::new(100, 4).unwrap();
        let ids = pool.map_tasks(|idx| idx.task);
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }
}
