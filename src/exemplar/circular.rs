//! Circular exemplar buffer
//!
//! All series share one fixed-size ring. Each occupied slot links to the
//! next newer exemplar of the same series, and the index keeps the oldest
//! and newest slot of every series:
//!
//! ```text
//! index: {a} → oldest 0, newest 3        {b} → oldest 1, newest 2
//! slots: [a ─next→ 3] [b ─next→ 2] [b] [a] [ ] …
//! ```
//!
//! Overwriting a slot drops the evicted exemplar from its series chain,
//! and the series from the index once its last exemplar is gone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use super::{
    Exemplar, ExemplarAppender, ExemplarError, ExemplarQueryResult, ExemplarResult,
    MAX_LABEL_SET_LENGTH,
};
use crate::config::ExemplarConfig;
use crate::storage::{Labels, Matcher};

#[derive(Debug, Clone)]
struct BufferEntry {
    exemplar: Exemplar,
    series: Labels,
    /// Slot of the next newer exemplar of the same series
    next: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    oldest: usize,
    newest: usize,
}

#[derive(Debug, Default)]
struct Ring {
    slots: Vec<Option<BufferEntry>>,
    index: HashMap<Labels, IndexEntry>,
    next_index: usize,
}

impl Ring {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            index: HashMap::new(),
            next_index: 0,
        }
    }

    fn check(&self, series: &Labels, exemplar: &Exemplar) -> ExemplarResult<()> {
        if self.slots.is_empty() {
            return Err(ExemplarError::Disabled);
        }

        // Only names and values count, not the quoting around them
        let mut length = 0;
        for label in exemplar.labels.iter() {
            length += label.name.chars().count() + label.value.chars().count();
            if length > MAX_LABEL_SET_LENGTH {
                return Err(ExemplarError::LabelLength(length));
            }
        }

        let newest = self
            .index
            .get(series)
            .and_then(|entry| self.slots[entry.newest].as_ref());
        let Some(newest) = newest else {
            return Ok(());
        };
        if newest.exemplar.same_as(exemplar) {
            return Err(ExemplarError::Duplicate);
        }
        if exemplar.ts <= newest.exemplar.ts {
            return Err(ExemplarError::OutOfOrder);
        }
        Ok(())
    }

    /// Write into the next slot, evicting whatever was there
    fn push(&mut self, series: &Labels, exemplar: Exemplar) {
        let slot = self.next_index;

        if let Some(evicted) = self.slots[slot].take() {
            match evicted.next {
                None => {
                    self.index.remove(&evicted.series);
                }
                Some(next) => {
                    if let Some(entry) = self.index.get_mut(&evicted.series) {
                        entry.oldest = next;
                    }
                }
            }
        }

        match self.index.get_mut(series) {
            Some(entry) => {
                let previous = entry.newest;
                entry.newest = slot;
                if let Some(prev) = self.slots[previous].as_mut() {
                    prev.next = Some(slot);
                }
            }
            None => {
                self.index.insert(
                    series.clone(),
                    IndexEntry {
                        oldest: slot,
                        newest: slot,
                    },
                );
            }
        }

        self.slots[slot] = Some(BufferEntry {
            exemplar,
            series: series.clone(),
            next: None,
        });
        self.next_index = (slot + 1) % self.slots.len();
    }
}

/// Point-in-time counters of the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExemplarStats {
    pub max_exemplars: usize,
    pub exemplars_in_storage: usize,
    pub series_in_storage: usize,
    pub exemplars_appended: u64,
    pub out_of_order_exemplars: u64,
    pub duplicate_exemplars: u64,
}

/// Fixed-capacity exemplar store shared by all series
pub struct CircularExemplarStorage {
    ring: RwLock<Ring>,
    secondaries: RwLock<Vec<Arc<dyn ExemplarAppender>>>,
    appended: AtomicU64,
    out_of_order: AtomicU64,
    duplicates: AtomicU64,
}

impl CircularExemplarStorage {
    /// A store holding at most `capacity` exemplars; zero disables it
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RwLock::new(Ring::with_capacity(capacity)),
            secondaries: RwLock::new(Vec::new()),
            appended: AtomicU64::new(0),
            out_of_order: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &ExemplarConfig) -> Self {
        Self::new(config.max_exemplars)
    }

    /// Appenders that receive every exemplar this store accepts
    pub fn set_secondaries(&self, secondaries: Vec<Arc<dyn ExemplarAppender>>) {
        *self
            .secondaries
            .write()
            .unwrap_or_else(PoisonError::into_inner) = secondaries;
    }

    pub fn appender(&self) -> &dyn ExemplarAppender {
        self
    }

    pub fn capacity(&self) -> usize {
        self.ring
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .slots
            .len()
    }

    /// Check whether `add` would accept the exemplar, without storing it
    pub fn validate(&self, series: &Labels, exemplar: &Exemplar) -> ExemplarResult<()> {
        self.ring
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .check(series, exemplar)
    }

    /// Store an exemplar for `series`, then hand it to the secondaries
    pub fn add(&self, series: &Labels, exemplar: &Exemplar) -> ExemplarResult<()> {
        {
            let mut ring = self.ring.write().unwrap_or_else(PoisonError::into_inner);
            if let Err(err) = ring.check(series, exemplar) {
                match err {
                    ExemplarError::Duplicate => {
                        self.duplicates.fetch_add(1, Ordering::Relaxed);
                    }
                    ExemplarError::OutOfOrder => {
                        self.out_of_order.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
                return Err(err);
            }
            ring.push(series, exemplar.clone());
            self.appended.fetch_add(1, Ordering::Relaxed);
        }

        let secondaries = self
            .secondaries
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for secondary in secondaries.iter() {
            secondary.add_exemplar(series, exemplar)?;
        }
        Ok(())
    }

    /// Exemplars of exactly `series` in `[start, end]`, oldest first
    pub fn select_series(&self, start: i64, end: i64, series: &Labels) -> Vec<Exemplar> {
        let ring = self.ring.read().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = ring.index.get(series) else {
            return Vec::new();
        };

        let mut exemplars = Vec::new();
        let mut current = ring.slots[entry.oldest].as_ref();
        while let Some(buffered) = current {
            if buffered.exemplar.ts > end {
                break;
            }
            if buffered.exemplar.ts >= start {
                exemplars.push(buffered.exemplar.clone());
            }
            current = buffered.next.and_then(|next| ring.slots[next].as_ref());
        }
        exemplars
    }

    /// Exemplars in `[start, end]` of every series matching at least one
    /// matcher set, sorted by series labels. A set of equality matchers on
    /// every label selects a single series, like [`select_series`].
    ///
    /// [`select_series`]: CircularExemplarStorage::select_series
    pub fn select(
        &self,
        start: i64,
        end: i64,
        matcher_sets: &[Vec<Matcher>],
    ) -> Vec<ExemplarQueryResult> {
        let ring = self.ring.read().unwrap_or_else(PoisonError::into_inner);
        let mut results = Vec::new();

        for (series, entry) in &ring.index {
            let (Some(oldest), Some(newest)) = (
                ring.slots[entry.oldest].as_ref(),
                ring.slots[entry.newest].as_ref(),
            ) else {
                continue;
            };
            if oldest.exemplar.ts > end || newest.exemplar.ts < start {
                continue;
            }
            let matched = matcher_sets
                .iter()
                .any(|set| set.iter().all(|m| m.matches_labels(series)));
            if !matched {
                continue;
            }

            let mut exemplars = Vec::new();
            let mut current = Some(oldest);
            while let Some(buffered) = current {
                if buffered.exemplar.ts > end {
                    break;
                }
                if buffered.exemplar.ts >= start {
                    exemplars.push(buffered.exemplar.clone());
                }
                current = buffered.next.and_then(|next| ring.slots[next].as_ref());
            }

            if !exemplars.is_empty() {
                results.push(ExemplarQueryResult {
                    series_labels: series.clone(),
                    exemplars,
                });
            }
        }

        results.sort_by(|a, b| a.series_labels.cmp(&b.series_labels));
        results
    }

    /// Drop every exemplar, keeping the capacity
    pub fn reset(&self) {
        let mut ring = self.ring.write().unwrap_or_else(PoisonError::into_inner);
        let capacity = ring.slots.len();
        *ring = Ring::with_capacity(capacity);
    }

    /// Change the capacity, keeping the newest exemplars that still fit.
    /// Returns how many were carried over.
    pub fn resize(&self, capacity: usize) -> usize {
        let mut ring = self.ring.write().unwrap_or_else(PoisonError::into_inner);
        let old_capacity = ring.slots.len();
        if capacity == old_capacity {
            return 0;
        }

        let old = std::mem::replace(&mut *ring, Ring::with_capacity(capacity));
        let count = capacity.min(old_capacity);
        let mut migrated = 0;
        if count > 0 {
            // Oldest slot among the newest `count` entries
            let start = (old.next_index + old_capacity - count) % old_capacity;
            let mut slots = old.slots;
            for i in 0..count {
                if let Some(entry) = slots[(start + i) % old_capacity].take() {
                    ring.push(&entry.series, entry.exemplar);
                    migrated += 1;
                }
            }
        }

        tracing::info!(
            from = old_capacity,
            to = capacity,
            migrated,
            "Exemplar storage resized"
        );
        migrated
    }

    pub fn stats(&self) -> ExemplarStats {
        let ring = self.ring.read().unwrap_or_else(PoisonError::into_inner);
        ExemplarStats {
            max_exemplars: ring.slots.len(),
            exemplars_in_storage: ring.slots.iter().filter(|s| s.is_some()).count(),
            series_in_storage: ring.index.len(),
            exemplars_appended: self.appended.load(Ordering::Relaxed),
            out_of_order_exemplars: self.out_of_order.load(Ordering::Relaxed),
            duplicate_exemplars: self.duplicates.load(Ordering::Relaxed),
        }
    }
}

impl ExemplarAppender for CircularExemplarStorage {
    fn add_exemplar(&self, series: &Labels, exemplar: &Exemplar) -> ExemplarResult<()> {
        self.add(series, exemplar)
    }
}
