use serde::Deserialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// How repeated enqueues for the same key are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMode {
    /// Last write wins per key.
    #[default]
    Coalesce,
    /// Every record is kept, in enqueue order per key.
    PreserveAll,
}

impl std::str::FromStr for AggregationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "coalesce" => Ok(AggregationMode::Coalesce),
            "preserve_all" | "preserve-all" => Ok(AggregationMode::PreserveAll),
            other => Err(other.to_string()),
        }
    }
}

enum Entries<K, R> {
    Coalesced(HashMap<K, R>),
    Appended(HashMap<K, Vec<R>>),
}

struct Buffer<K, R> {
    entries: Entries<K, R>,
    records: usize,
}

impl<K: Eq + Hash, R> Buffer<K, R> {
    fn empty(mode: AggregationMode) -> Self {
        let entries = match mode {
            AggregationMode::Coalesce => Entries::Coalesced(HashMap::new()),
            AggregationMode::PreserveAll => Entries::Appended(HashMap::new()),
        };
        Self {
            entries,
            records: 0,
        }
    }

    fn push(&mut self, key: K, record: R) {
        match &mut self.entries {
            Entries::Coalesced(map) => {
                if map.insert(key, record).is_none() {
                    self.records += 1;
                }
            }
            Entries::Appended(map) => {
                map.entry(key).or_default().push(record);
                self.records += 1;
            }
        }
    }

    /// Re-admits older records. Returns how many were restored; the rest were
    /// superseded by live records for the same key.
    fn restore(&mut self, older: Entries<K, R>) -> usize {
        let mut restored = 0;
        match (&mut self.entries, older) {
            (Entries::Coalesced(live), Entries::Coalesced(retried)) => {
                for (key, record) in retried {
                    if let Entry::Vacant(slot) = live.entry(key) {
                        slot.insert(record);
                        restored += 1;
                    }
                }
            }
            (Entries::Appended(live), Entries::Appended(retried)) => {
                for (key, mut records) in retried {
                    restored += records.len();
                    match live.entry(key) {
                        Entry::Occupied(mut slot) => {
                            records.append(slot.get_mut());
                            *slot.get_mut() = records;
                        }
                        Entry::Vacant(slot) => {
                            slot.insert(records);
                        }
                    }
                }
            }
            (Entries::Coalesced(live), Entries::Appended(retried)) => {
                for (key, records) in retried {
                    if let (Entry::Vacant(slot), Some(latest)) =
                        (live.entry(key), records.into_iter().last())
                    {
                        slot.insert(latest);
                        restored += 1;
                    }
                }
            }
            (Entries::Appended(live), Entries::Coalesced(retried)) => {
                for (key, record) in retried {
                    live.entry(key).or_default().insert(0, record);
                    restored += 1;
                }
            }
        }
        self.records += restored;
        restored
    }
}

/// Contents of an aggregator captured by [`KeyedAggregator::drain_and_reset`].
pub struct Snapshot<K, R> {
    entries: Entries<K, R>,
    records: usize,
}

impl<K, R> Snapshot<K, R> {
    pub fn len(&self) -> usize {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Records in per-key order. Ordering across keys is unspecified.
    pub fn iter(&self) -> Box<dyn Iterator<Item = (&K, &R)> + '_> {
        match &self.entries {
            Entries::Coalesced(map) => Box::new(map.iter()),
            Entries::Appended(map) => Box::new(
                map.iter()
                    .flat_map(|(key, records)| records.iter().map(move |record| (key, record))),
            ),
        }
    }

    pub fn into_entries(self) -> Vec<(K, R)>
    where
        K: Clone,
    {
        match self.entries {
            Entries::Coalesced(map) => map.into_iter().collect(),
            Entries::Appended(map) => map
                .into_iter()
                .flat_map(|(key, records)| {
                    records.into_iter().map(move |record| (key.clone(), record))
                })
                .collect(),
        }
    }
}

/// Mutex-protected buffer of pending records keyed by entity.
///
/// `enqueue` never performs I/O and is safe to call from synchronous request
/// code. Records only leave the live buffer through `drain_and_reset`; a
/// failed delivery hands them back with `merge_back`.
pub struct KeyedAggregator<K, R> {
    mode: AggregationMode,
    buffer: Mutex<Buffer<K, R>>,
}

impl<K: Eq + Hash, R> KeyedAggregator<K, R> {
    pub fn new(mode: AggregationMode) -> Self {
        Self {
            mode,
            buffer: Mutex::new(Buffer::empty(mode)),
        }
    }

    pub fn mode(&self) -> AggregationMode {
        self.mode
    }

    // A panic while holding the lock cannot leave the map half-written, so a
    // poisoned buffer is still usable.
    fn lock(&self) -> MutexGuard<'_, Buffer<K, R>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, key: K, record: R) {
        self.lock().push(key, record);
    }

    /// Swaps the live buffer for an empty one. `None` means there was nothing
    /// pending.
    pub fn drain_and_reset(&self) -> Option<Snapshot<K, R>> {
        let mut guard = self.lock();
        if guard.records == 0 {
            return None;
        }
        let drained = std::mem::replace(&mut *guard, Buffer::empty(self.mode));
        Some(Snapshot {
            entries: drained.entries,
            records: drained.records,
        })
    }

    /// Puts a previously drained snapshot back. Keys enqueued again since the
    /// drain keep their newer value (coalescing) or stay behind the restored
    /// records (preserve-all). Returns the number of records restored.
    pub fn merge_back(&self, snapshot: Snapshot<K, R>) -> usize {
        if snapshot.is_empty() {
            return 0;
        }
        self.lock().restore(snapshot.entries)
    }

    pub fn len(&self) -> usize {
        self.lock().records
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
