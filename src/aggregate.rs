//! Frequency-ranked index of received events for status reporting.
//!
//! Records are keyed by [`Event::identity_key`]. The number of records is
//! capped; inserting a new key at the cap evicts the least frequent record,
//! least recently touched first among equals.

use crate::event::{Event, EventType};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregateRecord {
    pub identity_key: String,
    pub event_type: EventType,
    pub count: u64,
    /// Capture time (ms) of the latest occurrence
    pub last_seen: i64,
}

struct Slot {
    record: AggregateRecord,
    touched: u64,
}

struct Index {
    slots: HashMap<String, Slot>,
    /// Eviction order: (count, touched) -> key. Ticks are unique, so the
    /// first entry is always the next victim.
    coldest: BTreeMap<(u64, u64), String>,
    tick: u64,
}

pub struct Aggregator {
    max_records: usize,
    index: Mutex<Index>,
    evicted: AtomicU64,
}

impl Aggregator {
    pub fn new(max_records: usize) -> Self {
        Self {
            max_records: max_records.max(1),
            index: Mutex::new(Index {
                slots: HashMap::new(),
                coldest: BTreeMap::new(),
                tick: 0,
            }),
            evicted: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Index> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, event: &Event) {
        let key = event.identity_key();
        let mut guard = self.lock();
        let index = &mut *guard;
        index.tick += 1;
        let tick = index.tick;
        if let Some(slot) = index.slots.get_mut(&key) {
            let old = (slot.record.count, slot.touched);
            slot.record.count += 1;
            slot.record.last_seen = slot.record.last_seen.max(event.timestamp_millis);
            slot.touched = tick;
            let rank = (slot.record.count, tick);
            if let Some(k) = index.coldest.remove(&old) {
                index.coldest.insert(rank, k);
            }
            return;
        }
        if index.slots.len() >= self.max_records {
            if let Some((_, victim)) = index.coldest.pop_first() {
                index.slots.remove(&victim);
                self.evicted.fetch_add(1, Ordering::Relaxed);
            }
        }
        index.coldest.insert((1, tick), key.clone());
        index.slots.insert(
            key.clone(),
            Slot {
                record: AggregateRecord {
                    identity_key: key,
                    event_type: event.event_type,
                    count: 1,
                    last_seen: event.timestamp_millis,
                },
                touched: tick,
            },
        );
    }

    /// All records, count descending, identity key ascending among equal counts.
    pub fn snapshot(&self) -> Vec<AggregateRecord> {
        let mut out: Vec<AggregateRecord> =
            self.lock().slots.values().map(|s| s.record.clone()).collect();
        out.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.identity_key.cmp(&b.identity_key))
        });
        out
    }

    pub fn top(&self, n: usize) -> Vec<AggregateRecord> {
        let mut all = self.snapshot();
        all.truncate(n);
        all
    }

    pub fn get(&self, identity_key: &str) -> Option<AggregateRecord> {
        self.lock().slots.get(identity_key).map(|s| s.record.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    pub fn max_records(&self) -> usize {
        self.max_records
    }
}
