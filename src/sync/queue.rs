// src/sync/queue.rs
//! Ordered, durable queue of pending mutations
//!
//! Entries carry a strictly increasing sequence number. A flush transmits a
//! prefix of the queue and remembers the last sequence number it sent; only
//! entries up to that number are removed when the backend accepts the batch,
//! so anything enqueued while the request was out survives.

use super::mutation::{Mutation, PendingMutation};
use crate::delivery::{reduce, DeliveryState, Transition};
use crate::error::Result;
use crate::storage::{load_json, save_json, KeyValueStore, QUEUE_KEY};
use crate::tracking::TrackingSample;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info};

/// When queued tracking samples are worth a request
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchPolicy {
    /// Flush as soon as this many samples are queued
    pub high_water: usize,
    /// Minimum samples for a flush once `stale_after_secs` has passed
    pub low_water: usize,
    pub stale_after_secs: i64,
    /// Upper bound on queue entries per request
    pub max_entries: usize,
    /// Periodic flush while tracking is active
    pub periodic_secs: u64,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            high_water: 20,
            low_water: 5,
            stale_after_secs: 5 * 60,
            max_entries: 100,
            periodic_secs: 60,
        }
    }
}

/// One outstanding transmission
#[derive(Debug, Clone, PartialEq)]
pub struct FlushBatch {
    /// Highest sequence number included
    pub up_to: u64,
    pub entries: Vec<PendingMutation>,
}

impl FlushBatch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedQueue {
    next_seq: u64,
    entries: Vec<PendingMutation>,
}

#[derive(Debug)]
pub struct SyncQueue {
    entries: VecDeque<PendingMutation>,
    next_seq: u64,
    in_flight: Option<u64>,
    last_flush: DateTime<Utc>,
    policy: BatchPolicy,
}

impl SyncQueue {
    pub fn new(policy: BatchPolicy, now: DateTime<Utc>) -> Self {
        Self {
            entries: VecDeque::new(),
            next_seq: 1,
            in_flight: None,
            last_flush: now,
            policy,
        }
    }

    /// Reload what a previous process left behind. Nothing is in flight
    /// after a restart; the next flush starts again from the front.
    pub fn restore(store: &dyn KeyValueStore, policy: BatchPolicy, now: DateTime<Utc>) -> Result<Self> {
        let mut queue = Self::new(policy, now);
        if let Some(persisted) = load_json::<PersistedQueue>(store, QUEUE_KEY)? {
            let max_seq = persisted.entries.iter().map(|e| e.seq).max().unwrap_or(0);
            queue.next_seq = persisted.next_seq.max(max_seq + 1);
            queue.entries = persisted.entries.into();
            info!(pending = queue.entries.len(), "restored sync queue");
        }
        Ok(queue)
    }

    pub fn persist(&self, store: &dyn KeyValueStore) -> Result<()> {
        let persisted = PersistedQueue {
            next_seq: self.next_seq,
            entries: self.entries.iter().cloned().collect(),
        };
        save_json(store, QUEUE_KEY, &persisted)
    }

    pub fn policy(&self) -> &BatchPolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &PendingMutation> {
        self.entries.iter()
    }

    pub fn is_flushing(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn oldest_seq(&self) -> Option<u64> {
        self.entries.front().map(|e| e.seq)
    }

    pub fn newest_seq(&self) -> Option<u64> {
        self.entries.back().map(|e| e.seq)
    }

    pub fn last_flush(&self) -> DateTime<Utc> {
        self.last_flush
    }

    pub fn sample_count(&self) -> usize {
        self.entries.iter().map(|e| e.mutation.sample_count()).sum()
    }

    /// Lifecycle mutations queued, as opposed to location batches only
    pub fn has_lifecycle(&self) -> bool {
        self.entries
            .iter()
            .any(|e| !matches!(e.mutation, Mutation::LocationBatch { .. }))
    }

    fn push(&mut self, mutation: Mutation, at: DateTime<Utc>) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        debug!(seq, kind = mutation.kind(), "enqueued");
        self.entries.push_back(PendingMutation {
            seq,
            enqueued_at: at,
            mutation,
        });
        seq
    }

    /// Apply the mutation to `state` and queue it.
    ///
    /// A mutation the reducer rejects is not queued and never reaches the
    /// network. The returned transition is what the caller commits.
    pub fn enqueue(&mut self, state: &DeliveryState, mutation: Mutation, at: DateTime<Utc>) -> Result<Transition> {
        let transition = match mutation.action() {
            Some(action) => reduce(state, action)?,
            None => Transition {
                state: state.clone(),
                effects: Vec::new(),
            },
        };
        self.push(mutation, at);
        Ok(transition)
    }

    /// Append a retained sample to the open location batch, or open a new
    /// one. Batches already handed to a flush are never extended.
    pub fn push_sample(&mut self, sample: TrackingSample, at: DateTime<Utc>) {
        let in_flight = self.in_flight;
        if let Some(PendingMutation {
            seq,
            mutation: Mutation::LocationBatch { samples },
            ..
        }) = self.entries.back_mut()
        {
            if in_flight.map_or(true, |up_to| *seq > up_to) {
                samples.push(sample);
                return;
            }
        }
        self.push(Mutation::LocationBatch { samples: vec![sample] }, at);
    }

    /// Sample thresholds: the high-water mark, or the low-water mark once
    /// the last flush is stale.
    pub fn should_flush_samples(&self, now: DateTime<Utc>) -> bool {
        let samples = self.sample_count();
        if samples >= self.policy.high_water {
            return true;
        }
        let stale = now.signed_duration_since(self.last_flush) >= Duration::seconds(self.policy.stale_after_secs);
        stale && samples >= self.policy.low_water
    }

    /// Take the next prefix to transmit. `None` while another flush is
    /// outstanding or when there is nothing to send.
    pub fn begin_flush(&mut self) -> Option<FlushBatch> {
        if self.in_flight.is_some() || self.entries.is_empty() {
            return None;
        }

        let entries: Vec<PendingMutation> = self
            .entries
            .iter()
            .take(self.policy.max_entries.max(1))
            .cloned()
            .collect();
        let up_to = entries.last()?.seq;
        self.in_flight = Some(up_to);

        Some(FlushBatch { up_to, entries })
    }

    /// The backend accepted everything up to `up_to`. Returns how many
    /// entries were removed.
    pub fn complete_flush(&mut self, up_to: u64, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        while self.entries.front().is_some_and(|e| e.seq <= up_to) {
            self.entries.pop_front();
        }
        self.in_flight = None;
        self.last_flush = now;

        let removed = before - self.entries.len();
        info!(removed, pending = self.entries.len(), "flush confirmed");
        removed
    }

    /// The transmission failed; everything stays queued.
    pub fn abort_flush(&mut self) {
        self.in_flight = None;
    }
}
