use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use once_cell::sync::Lazy;

const SHARD_COUNT: usize = 8;

/// Records older than this are dropped by the sweep even if still live.
const RECORD_TTL_NS: u64 = 120 * 1_000_000_000;

/// Minimum interval between sweeps of consecutive shards.
const SCAN_INTERVAL_NS: u64 = 60 * 1_000_000;

static GLOBAL_REGISTRY: Lazy<SpawnRegistry> = Lazy::new(SpawnRegistry::new);

static PROCESS_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// The process-wide spawn registry used by [`crate::spawn`].
pub fn registry() -> &'static SpawnRegistry {
    &GLOBAL_REGISTRY
}

pub(crate) fn monotonic_ns() -> u64 {
    PROCESS_EPOCH.elapsed().as_nanos() as u64
}

#[derive(Debug, Clone, Copy)]
struct SpawnRecord {
    child: u64,
    parent: u64,
    created_at_ns: u64,
    live: bool,
}

#[derive(Debug, Default)]
struct Shard {
    records: Mutex<Vec<SpawnRecord>>,
}

impl Shard {
    fn lock(&self) -> MutexGuard<'_, Vec<SpawnRecord>> {
        // succeed or die. failure is unrecoverable (mutex poisoned)
        self.records.lock().unwrap()
    }
}

/// A sharded table of `(child, parent)` task edges.
///
/// Each shard holds an append-only record list under its own mutex; no
/// operation ever takes more than one shard lock. Lookups scan the shard
/// linearly, which stays cheap because entries expire and lookups happen on
/// request ingress rather than per spawn.
#[derive(Debug)]
pub struct SpawnRegistry {
    shards: [Shard; SHARD_COUNT],
    scan_idx: AtomicUsize,
    last_scan_ns: AtomicU64,
}

impl SpawnRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        SpawnRegistry {
            shards: std::array::from_fn(|_| Shard::default()),
            scan_idx: AtomicUsize::new(0),
            last_scan_ns: AtomicU64::new(0),
        }
    }

    fn shard(&self, child: u64) -> &Shard {
        &self.shards[(child % SHARD_COUNT as u64) as usize]
    }

    /// Records a `child -> parent` edge. Call exactly once per task creation,
    /// from the child or the creator, before the child does any traced work.
    pub fn record_spawn(&self, child: u64, parent: u64) {
        self.record_spawn_at(child, parent, monotonic_ns());
        self.scavenge(monotonic_ns());
    }

    fn record_spawn_at(&self, child: u64, parent: u64, now_ns: u64) {
        let mut records = self.shard(child).lock();
        records.push(SpawnRecord {
            child,
            parent,
            created_at_ns: now_ns,
            live: true,
        });
    }

    /// Returns the ancestor chain of `task_id`, starting with `task_id`
    /// itself, then its parent, and so on until the chain is exhausted or
    /// `max_depth` ids have been produced.
    pub fn ancestors(&self, task_id: u64, max_depth: usize) -> Vec<u64> {
        let walk = itertools::unfold(Some(task_id), |state| {
            let current = (*state).filter(|id| *id != 0)?;
            *state = self.parent_of(current);
            Some(current)
        });
        walk.take(max_depth).collect()
    }

    /// Looks up the parent recorded for `child`. When the same child id
    /// appears more than once (id reuse after a sweep), the record with the
    /// largest creation time wins and the older duplicates are marked dead so
    /// the next sweep reclaims them.
    fn parent_of(&self, child: u64) -> Option<u64> {
        let mut records = self.shard(child).lock();
        let mut best: Option<usize> = None;
        for i in 0..records.len() {
            if records[i].child != child {
                continue;
            }
            match best {
                None => best = Some(i),
                Some(j) if records[i].created_at_ns > records[j].created_at_ns => {
                    records[j].live = false;
                    best = Some(i);
                }
                Some(_) => records[i].live = false,
            }
        }
        best.map(|i| records[i].parent)
    }

    /// Sweeps at most one shard, chosen round-robin, and no more often than
    /// once per scan interval. Removes records marked dead by lookups as well
    /// as records past the TTL, the fallback for tasks that died without any
    /// id reuse ever flagging them.
    fn scavenge(&self, now_ns: u64) {
        let last = self.last_scan_ns.load(Ordering::Relaxed);
        if now_ns.saturating_sub(last) < SCAN_INTERVAL_NS {
            return;
        }
        // best-effort throttle: a racing writer just moves the next sweep out
        self.last_scan_ns.store(now_ns, Ordering::Relaxed);

        let idx = self.scan_idx.fetch_add(1, Ordering::Relaxed) % SHARD_COUNT;
        let mut records = self.shards[idx].lock();
        let before = records.len();
        records.retain(|r| r.live && now_ns.saturating_sub(r.created_at_ns) <= RECORD_TTL_NS);
        if records.len() < before {
            tracing::debug!(
                shard = idx,
                removed = before - records.len(),
                "reclaimed spawn records"
            );
        }
    }

    /// Visits every record in the registry, across all shards, as
    /// `(child, parent, created_at_ns, live)`. Diagnostics only.
    pub fn dump<F: FnMut(u64, u64, u64, bool)>(&self, mut f: F) {
        for shard in &self.shards {
            for r in shard.lock().iter() {
                f(r.child, r.parent, r.created_at_ns, r.live);
            }
        }
    }
}

impl Default for SpawnRegistry {
    fn default() -> Self {
        SpawnRegistry::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn record_count(reg: &SpawnRegistry) -> usize {
        let mut n = 0;
        reg.dump(|_, _, _, _| n += 1);
        n
    }

    #[test]
    fn ancestors_walks_parent_links() {
        let reg = SpawnRegistry::new();
        reg.record_spawn(2, 1);
        reg.record_spawn(3, 2);
        reg.record_spawn(4, 3);

        assert_eq!(reg.ancestors(4, 10), vec![4, 3, 2, 1]);
        assert_eq!(reg.ancestors(3, 10), vec![3, 2, 1]);
        // unknown ids produce a chain of just themselves
        assert_eq!(reg.ancestors(99, 10), vec![99]);
    }

    #[test]
    fn ancestors_respects_max_depth() {
        let reg = SpawnRegistry::new();
        reg.record_spawn(2, 1);
        reg.record_spawn(3, 2);
        reg.record_spawn(4, 3);

        assert_eq!(reg.ancestors(4, 2), vec![4, 3]);
        assert_eq!(reg.ancestors(4, 1), vec![4]);
        assert!(reg.ancestors(4, 0).is_empty());
    }

    #[test]
    fn newest_record_wins_on_id_reuse() {
        let reg = SpawnRegistry::new();
        reg.record_spawn_at(7, 1, 100);
        reg.record_spawn_at(7, 2, 200);

        assert_eq!(reg.parent_of(7), Some(2));

        // the older duplicate was flagged dead by the lookup
        let mut dead = 0;
        reg.dump(|_, parent, _, live| {
            if !live {
                assert_eq!(parent, 1);
                dead += 1;
            }
        });
        assert_eq!(dead, 1);
    }

    #[test]
    fn scavenge_removes_dead_and_expired_records() {
        let reg = SpawnRegistry::new();
        // shard 0: one dead record (after lookup), one fresh, one expired
        reg.record_spawn_at(8, 1, 100);
        reg.record_spawn_at(8, 2, 200);
        reg.parent_of(8); // marks the older duplicate dead
        reg.record_spawn_at(16, 3, RECORD_TTL_NS + 10_000);
        assert_eq!(record_count(&reg), 3);

        // first sweep targets shard 0
        reg.scavenge(RECORD_TTL_NS + 20_000);

        let mut survivors = Vec::new();
        reg.dump(|child, parent, _, _| survivors.push((child, parent)));
        assert_eq!(survivors, vec![(16, 3)]);
    }

    #[test]
    fn scavenge_is_rate_limited() {
        let reg = SpawnRegistry::new();
        reg.record_spawn_at(8, 1, 0);
        reg.parent_of(8);
        reg.record_spawn_at(8, 2, 10);
        reg.parent_of(8); // older record now dead

        let now = RECORD_TTL_NS + 1_000_000_000;
        reg.scavenge(now);
        assert_eq!(record_count(&reg), 0, "first sweep reclaims shard 0");

        reg.record_spawn_at(8, 3, 0);
        // within the scan interval of the previous sweep: no-op
        reg.scavenge(now + SCAN_INTERVAL_NS - 1);
        assert_eq!(record_count(&reg), 1);
    }

    #[test]
    fn sweeps_rotate_through_shards() {
        let reg = SpawnRegistry::new();
        for shard in 0..SHARD_COUNT as u64 {
            reg.record_spawn_at(shard, 1, 0);
        }

        let mut now = RECORD_TTL_NS + 1_000_000_000;
        for _ in 0..SHARD_COUNT {
            reg.scavenge(now);
            now += SCAN_INTERVAL_NS + 1;
        }
        assert_eq!(record_count(&reg), 0, "every shard swept once");
    }
}
