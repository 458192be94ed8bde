//! Work partitioning
//!
//! Splits an index range or an input sequence into batches that workers claim
//! one at a time. Every index or item lands in exactly one batch; batches never
//! overlap, and reordering their union reconstructs the input.
//!
//! Within a batch indices are contiguous and ascending, which is what lets a
//! worker stop early once it walks past a break point.

use crate::error::{ParallelError, Result};
use std::ops::Range;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::trace;

/// A single unit of work: its index plus the value it carries
///
/// Range loops carry `()` as the value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem<T> {
    pub index: i64,
    pub value: T,
}

/// A contiguous run of work items claimed by one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<T> {
    start: i64,
    values: Vec<T>,
}

impl<T> Batch<T> {
    /// Create a batch whose first item has index `start`
    pub fn new(start: i64, values: Vec<T>) -> Self {
        Self { start, values }
    }

    /// Index of the first item
    pub fn start(&self) -> i64 {
        self.start
    }

    /// One past the index of the last item
    pub fn end(&self) -> i64 {
        self.start + self.values.len() as i64
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Consume the batch, yielding items in ascending index order
    pub fn into_items(self) -> impl Iterator<Item = WorkItem<T>> {
        let start = self.start;
        self.values
            .into_iter()
            .enumerate()
            .map(move |(offset, value)| WorkItem {
                index: start + offset as i64,
                value,
            })
    }
}

/// Source of batches shared by all workers of one run
///
/// `next_batch` may be called concurrently from every worker; each call hands
/// out a batch no other caller will ever see.
pub trait Partitioner<T>: Send + Sync {
    /// Claim the next batch, `None` once the input is exhausted
    ///
    /// An `Err` reports that the input itself failed; no further batches follow.
    fn next_batch(&self) -> Option<Result<Batch<T>>>;

    /// Total number of items, when known up front
    fn len_hint(&self) -> Option<u64> {
        None
    }
}

/// Batch size for a range of `len` items spread over `workers`
///
/// Aims for `chunks_per_worker` batches per worker: small enough to even out
/// load imbalance, large enough to keep per-batch overhead down.
pub fn default_chunk_size(len: u64, workers: usize, chunks_per_worker: usize) -> usize {
    let slots = (workers.max(1) as u64).saturating_mul(chunks_per_worker.max(1) as u64);
    let chunk = len.div_ceil(slots).max(1);
    usize::try_from(chunk).unwrap_or(usize::MAX)
}

/// Lock-free partitioner over an integer range `[start, end)`
#[derive(Debug)]
pub struct RangePartitioner {
    next: AtomicI64,
    end: i64,
    chunk: i64,
}

impl RangePartitioner {
    /// Partition `range` into batches of `chunk_size` (the last may be shorter)
    pub fn new(range: Range<i64>, chunk_size: usize) -> Self {
        let chunk = i64::try_from(chunk_size.max(1)).unwrap_or(i64::MAX);
        Self {
            next: AtomicI64::new(range.start),
            end: range.end.max(range.start),
            chunk,
        }
    }

    /// Partition `range` with a batch size derived from the worker count
    pub fn with_parallelism(range: Range<i64>, workers: usize, chunks_per_worker: usize) -> Self {
        let len = range_len(&range);
        Self::new(range, default_chunk_size(len, workers, chunks_per_worker))
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk as usize
    }
}

impl Partitioner<()> for RangePartitioner {
    fn next_batch(&self) -> Option<Result<Batch<()>>> {
        let end = self.end;
        let chunk = self.chunk;

        let start = self
            .next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                (cur < end).then(|| cur.saturating_add(chunk).min(end))
            })
            .ok()?;

        let stop = start.saturating_add(chunk).min(end);
        trace!("Claimed range batch [{}, {})", start, stop);
        Some(Ok(Batch::new(start, vec![(); (stop - start) as usize])))
    }

    fn len_hint(&self) -> Option<u64> {
        let next = self.next.load(Ordering::SeqCst);
        Some(range_len(&(next..self.end)))
    }
}

fn range_len(range: &Range<i64>) -> u64 {
    if range.end <= range.start {
        0
    } else {
        range.end.abs_diff(range.start)
    }
}

type FallibleSource<'a, T> = Box<dyn Iterator<Item = anyhow::Result<T>> + Send + 'a>;

struct SequenceState<'a, T> {
    source: FallibleSource<'a, T>,
    next_index: i64,
    chunk: usize,
    exhausted: bool,
    pending_error: Option<ParallelError>,
}

/// Partitioner over a (possibly lazy, possibly side-effecting) sequence
///
/// Pulling from the source is a single serialized section: only one worker
/// advances the iterator at a time, so sources that are not thread-safe (a
/// shared pseudo-random generator, say) behave exactly as if consumed by one
/// thread. This is a deliberate throughput bottleneck.
///
/// Batches start at one item and double on every pull up to `max_chunk`.
/// Items are indexed from 0 in the order the source yields them.
pub struct SequencePartitioner<'a, T> {
    state: parking_lot::Mutex<SequenceState<'a, T>>,
    max_chunk: usize,
}

impl<'a, T: Send + 'a> SequencePartitioner<'a, T> {
    /// Partition an infallible sequence
    pub fn new<I>(source: I, max_chunk: usize) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'a,
    {
        Self::fallible(source.into_iter().map(Ok), max_chunk)
    }

    /// Partition a sequence whose elements may fail to materialize
    pub fn fallible<I>(source: I, max_chunk: usize) -> Self
    where
        I: IntoIterator<Item = anyhow::Result<T>>,
        I::IntoIter: Send + 'a,
    {
        Self {
            state: parking_lot::Mutex::new(SequenceState {
                source: Box::new(source.into_iter()),
                next_index: 0,
                chunk: 1,
                exhausted: false,
                pending_error: None,
            }),
            max_chunk: max_chunk.max(1),
        }
    }
}

impl<'a, T: Send + 'a> Partitioner<T> for SequencePartitioner<'a, T> {
    fn next_batch(&self) -> Option<Result<Batch<T>>> {
        let mut state = self.state.lock();

        if let Some(err) = state.pending_error.take() {
            return Some(Err(err));
        }
        if state.exhausted {
            return None;
        }

        let start = state.next_index;
        let want = state.chunk;
        let mut values = Vec::with_capacity(want);

        while values.len() < want {
            match state.source.next() {
                Some(Ok(value)) => values.push(value),
                Some(Err(error)) => {
                    state.exhausted = true;
                    state.pending_error = Some(ParallelError::PartitionExhausted {
                        index: start + values.len() as i64,
                        source: error.into(),
                    });
                    break;
                }
                None => {
                    state.exhausted = true;
                    break;
                }
            }
        }

        state.next_index += values.len() as i64;
        state.chunk = state.chunk.saturating_mul(2).min(self.max_chunk);

        if values.is_empty() {
            // Either plain exhaustion or a failure on the very first pull.
            return state.pending_error.take().map(Err);
        }

        trace!("Pulled sequence batch of {} items at {}", values.len(), start);
        Some(Ok(Batch::new(start, values)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn drain<T, P: Partitioner<T>>(partitioner: &P) -> Vec<Batch<T>> {
        let mut batches = Vec::new();
        while let Some(batch) = partitioner.next_batch() {
            batches.push(batch.unwrap());
        }
        batches
    }

    #[test]
    fn test_batch_items_are_ascending() {
        let batch = Batch::new(10, vec!['a', 'b', 'c']);
        assert_eq!(batch.start(), 10);
        assert_eq!(batch.end(), 13);

        let items: Vec<_> = batch.into_items().collect();
        assert_eq!(
            items,
            vec![
                WorkItem { index: 10, value: 'a' },
                WorkItem { index: 11, value: 'b' },
                WorkItem { index: 12, value: 'c' },
            ]
        );
    }

    #[test]
    fn test_default_chunk_size() {
        assert_eq!(default_chunk_size(1000, 4, 4), 63);
        assert_eq!(default_chunk_size(16, 4, 4), 1);
        assert_eq!(default_chunk_size(0, 4, 4), 1);
        assert_eq!(default_chunk_size(10, 0, 0), 10);
    }

    #[test]
    fn test_range_partitioner_covers_range() {
        let partitioner = RangePartitioner::new(1..100, 8);
        let batches = drain(&partitioner);

        assert_eq!(batches.len(), 13);
        assert_eq!(batches.first().unwrap().start(), 1);
        assert_eq!(batches.last().unwrap().end(), 100);
        assert_eq!(batches.last().unwrap().len(), 3);
        assert!(partitioner.next_batch().is_none());
        assert_eq!(partitioner.len_hint(), Some(0));
    }

    #[test]
    fn test_empty_and_inverted_ranges() {
        assert!(RangePartitioner::new(5..5, 4).next_batch().is_none());
        #[allow(clippy::reversed_empty_ranges)]
        let inverted = RangePartitioner::new(10..0, 4);
        assert!(inverted.next_batch().is_none());
        assert_eq!(inverted.len_hint(), Some(0));
    }

    #[test]
    fn test_range_near_i64_max() {
        let partitioner = RangePartitioner::new(i64::MAX - 5..i64::MAX, 4);
        let batches = drain(&partitioner);
        let total: usize = batches.iter().map(Batch::len).sum();
        assert_eq!(total, 5);
    }

    #[test]
    fn test_range_partitioner_concurrent_claims() {
        let partitioner = Arc::new(RangePartitioner::new(0..10_000, 7));

        let claimed: Vec<i64> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let partitioner = Arc::clone(&partitioner);
                    scope.spawn(move || {
                        let mut seen = Vec::new();
                        while let Some(Ok(batch)) = partitioner.next_batch() {
                            seen.extend(batch.into_items().map(|item| item.index));
                        }
                        seen
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });

        let unique: HashSet<_> = claimed.iter().copied().collect();
        assert_eq!(claimed.len(), 10_000);
        assert_eq!(unique.len(), 10_000);
    }

    #[test]
    fn test_sequence_chunks_grow_to_cap() {
        let partitioner = SequencePartitioner::new(0..100, 8);
        let sizes: Vec<usize> = drain(&partitioner).iter().map(Batch::len).collect();

        assert_eq!(&sizes[..5], &[1, 2, 4, 8, 8]);
        assert_eq!(sizes.iter().sum::<usize>(), 100);
    }

    #[test]
    fn test_sequence_indices_follow_source_order() {
        let partitioner = SequencePartitioner::new(vec!["a", "b", "c", "d"], 2);
        let items: Vec<_> = drain(&partitioner)
            .into_iter()
            .flat_map(Batch::into_items)
            .collect();

        assert_eq!(items.len(), 4);
        for (expected, item) in items.iter().enumerate() {
            assert_eq!(item.index, expected as i64);
        }
        assert_eq!(items[3].value, "d");
    }

    #[test]
    fn test_sequence_failure_surfaces_after_partial_batch() {
        let source = (0..10).map(|i| {
            if i == 5 {
                Err(anyhow::anyhow!("generator broke"))
            } else {
                Ok(i)
            }
        });
        let partitioner = SequencePartitioner::fallible(source, 16);

        let mut values = Vec::new();
        let mut failure = None;
        while let Some(batch) = partitioner.next_batch() {
            match batch {
                Ok(batch) => values.extend(batch.into_items().map(|item| item.value)),
                Err(err) => failure = Some(err),
            }
        }

        assert_eq!(values, vec![0, 1, 2, 3, 4]);
        match failure {
            Some(ParallelError::PartitionExhausted { index, .. }) => assert_eq!(index, 5),
            other => panic!("expected partition failure, got {other:?}"),
        }
        assert!(partitioner.next_batch().is_none());
    }

    #[test]
    fn test_shared_generator_no_drops_or_duplicates() {
        // A single non-thread-safe generator drained by many workers at once.
        let mut rng = StdRng::seed_from_u64(7);
        let expected: Vec<u64> = (0..1000).map(|_| rng.gen_range(0..100_000_000)).collect();

        let mut rng = StdRng::seed_from_u64(7);
        let generated = (0..1000).map(move |_| rng.gen_range(0..100_000_000u64));
        let partitioner = SequencePartitioner::new(generated, 32);

        let mut consumed: Vec<WorkItem<u64>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..6)
                .map(|_| {
                    scope.spawn(|| {
                        let mut seen = Vec::new();
                        while let Some(Ok(batch)) = partitioner.next_batch() {
                            seen.extend(batch.into_items());
                        }
                        seen
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });

        consumed.sort_by_key(|item| item.index);
        let values: Vec<u64> = consumed.into_iter().map(|item| item.value).collect();
        assert_eq!(values, expected);
    }

    proptest! {
        #[test]
        fn prop_range_batches_partition_exactly(
            start in -1_000i64..1_000,
            len in 0i64..2_000,
            chunk in 1usize..300,
        ) {
            let partitioner = RangePartitioner::new(start..start + len, chunk);
            let batches = drain(&partitioner);

            let mut expected_start = start;
            for batch in &batches {
                prop_assert_eq!(batch.start(), expected_start);
                prop_assert!(batch.len() <= chunk);
                prop_assert!(!batch.is_empty());
                expected_start = batch.end();
            }
            prop_assert_eq!(expected_start, start + len);
        }

        #[test]
        fn prop_sequence_batches_partition_exactly(
            items in proptest::collection::vec(any::<u32>(), 0..500),
            cap in 1usize..64,
        ) {
            let partitioner = SequencePartitioner::new(items.clone(), cap);
            let rebuilt: Vec<u32> = drain(&partitioner)
                .into_iter()
                .flat_map(|b| b.into_items().map(|item| item.value))
                .collect();
            prop_assert_eq!(rebuilt, items);
        }
    }
}
