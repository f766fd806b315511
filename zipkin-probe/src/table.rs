//! The in-flight span table: maps the task currently handling an inbound
//! request to its server span.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

#[cfg(feature = "use_parking_lot")]
use parking_lot::{Mutex, MutexGuard};
#[cfg(not(feature = "use_parking_lot"))]
use std::sync::{Mutex, MutexGuard};

use crate::span::{now_micros, TraceSpan};

const SHARD_COUNT: usize = 1024;

/// Spans older than this are presumed abandoned (their closing hook never
/// fired) and are dropped without emission.
const SPAN_TTL_US: i64 = 240 * 1_000_000;

/// Minimum interval between sweeps of consecutive shards.
const SCAN_INTERVAL_US: i64 = 60 * 1_000;

#[derive(Debug, Default)]
struct Shard {
    spans: Mutex<Vec<TraceSpan>>,
}

impl Shard {
    fn lock(&self) -> MutexGuard<'_, Vec<TraceSpan>> {
        #[cfg(not(feature = "use_parking_lot"))]
        {
            // succeed or die. failure is unrecoverable (mutex poisoned)
            self.spans.lock().unwrap()
        }
        #[cfg(feature = "use_parking_lot")]
        {
            self.spans.lock()
        }
    }
}

/// Sharded `task_id -> span` map. 1024 shards, each a mutex-protected list;
/// no operation takes more than one shard lock at a time.
#[derive(Debug)]
pub(crate) struct SpanTable {
    shards: Box<[Shard; SHARD_COUNT]>,
    scan_idx: AtomicUsize,
    last_scan_us: AtomicI64,
}

impl SpanTable {
    pub(crate) fn new() -> Self {
        SpanTable {
            shards: Box::new(std::array::from_fn(|_| Shard::default())),
            scan_idx: AtomicUsize::new(0),
            last_scan_us: AtomicI64::new(0),
        }
    }

    fn shard(&self, task_id: u64) -> &Shard {
        &self.shards[(task_id % SHARD_COUNT as u64) as usize]
    }

    /// Stores `span` under `task_id`. An existing span for the same task is
    /// replaced in place: a second inbound handled by the same task
    /// supersedes the older record.
    pub(crate) fn upsert(&self, task_id: u64, mut span: TraceSpan) {
        span.task_id = task_id;
        {
            let mut spans = self.shard(task_id).lock();
            match spans.iter_mut().find(|s| s.task_id == task_id) {
                Some(slot) => *slot = span,
                None => spans.push(span),
            }
        }
        self.expire(now_micros());
    }

    pub(crate) fn lookup(&self, task_id: u64) -> Option<TraceSpan> {
        let spans = self.shard(task_id).lock();
        spans.iter().find(|s| s.task_id == task_id).cloned()
    }

    /// Runs `f` against the span stored for `task_id`, if any.
    pub(crate) fn update<R>(
        &self,
        task_id: u64,
        f: impl FnOnce(&mut TraceSpan) -> R,
    ) -> Option<R> {
        let mut spans = self.shard(task_id).lock();
        spans.iter_mut().find(|s| s.task_id == task_id).map(f)
    }

    /// Removes and returns the span stored for `task_id`.
    pub(crate) fn remove(&self, task_id: u64) -> Option<TraceSpan> {
        let mut spans = self.shard(task_id).lock();
        let idx = spans.iter().position(|s| s.task_id == task_id)?;
        Some(spans.remove(idx))
    }

    /// Sweeps at most one shard, chosen round-robin, no more often than once
    /// per scan interval. A safety net for spans whose closing hook never
    /// fired; swept spans are dropped, not emitted.
    fn expire(&self, now_us: i64) {
        let last = self.last_scan_us.load(Ordering::Relaxed);
        if now_us.saturating_sub(last) < SCAN_INTERVAL_US {
            return;
        }
        self.last_scan_us.store(now_us, Ordering::Relaxed);

        let idx = self.scan_idx.fetch_add(1, Ordering::Relaxed) % SHARD_COUNT;
        let mut spans = self.shards[idx].lock();
        let before = spans.len();
        spans.retain(|s| now_us.saturating_sub(s.timestamp) <= SPAN_TTL_US);
        if spans.len() < before {
            tracing::debug!(
                shard = idx,
                dropped = before - spans.len(),
                "expired abandoned spans"
            );
        }
    }

    /// Total spans currently held, across all shards.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }
}
