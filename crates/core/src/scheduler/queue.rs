//! Strict-priority buckets, FIFO within a bucket.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::job::Priority;

#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub job_id: String,
    pub batch_id: Option<String>,
    /// Bucket the entry currently sits in.
    pub priority: Priority,
    pub promoted: bool,
    /// Submission order; each bucket is sorted by it.
    pub seq: u64,
    pub enqueued_at: Instant,
}

/// A starvation promotion performed by [`PriorityQueue::promote_starved`].
#[derive(Debug, Clone, PartialEq)]
pub struct Promotion {
    pub job_id: String,
    pub from: Priority,
    pub to: Priority,
}

#[derive(Debug, Default)]
pub struct PriorityQueue {
    buckets: [VecDeque<QueueEntry>; 5],
    next_seq: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the back of the priority's bucket.
    pub fn push(
        &mut self,
        job_id: impl Into<String>,
        batch_id: Option<String>,
        priority: Priority,
        promoted: bool,
        enqueued_at: Instant,
    ) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.buckets[priority.rank()].push_back(QueueEntry {
            job_id: job_id.into(),
            batch_id,
            priority,
            promoted,
            seq,
            enqueued_at,
        });
        seq
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(VecDeque::is_empty)
    }

    pub fn depth(&self, priority: Priority) -> usize {
        self.buckets[priority.rank()].len()
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.iter().any(|e| e.job_id == job_id)
    }

    /// Entries in dequeue order, ignoring admission.
    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.buckets.iter().flat_map(|bucket| bucket.iter())
    }

    pub fn remove(&mut self, job_id: &str) -> Option<QueueEntry> {
        for bucket in self.buckets.iter_mut() {
            if let Some(pos) = bucket.iter().position(|e| e.job_id == job_id) {
                return bucket.remove(pos);
            }
        }
        None
    }

    /// Remove every entry belonging to a batch.
    pub fn remove_batch(&mut self, batch_id: &str) -> Vec<QueueEntry> {
        let mut removed = Vec::new();
        for bucket in self.buckets.iter_mut() {
            let (drop, keep): (VecDeque<_>, VecDeque<_>) = bucket
                .drain(..)
                .partition(|e| e.batch_id.as_deref() == Some(batch_id));
            *bucket = keep;
            removed.extend(drop);
        }
        removed
    }

    /// Move every entry that has waited longer than `max_wait` up one level.
    /// An entry is promoted at most once and keeps its submission order.
    pub fn promote_starved(&mut self, now: Instant, max_wait: Duration) -> Vec<Promotion> {
        let mut promotions = Vec::new();
        // Urgent cannot go higher.
        for rank in 1..self.buckets.len() {
            let starved: Vec<QueueEntry> = {
                let bucket = &mut self.buckets[rank];
                let (starved, keep): (VecDeque<_>, VecDeque<_>) =
                    bucket.drain(..).partition(|e| {
                        !e.promoted && now.saturating_duration_since(e.enqueued_at) > max_wait
                    });
                *bucket = keep;
                starved.into()
            };

            for mut entry in starved {
                let from = entry.priority;
                entry.priority = from.promoted();
                entry.promoted = true;
                promotions.push(Promotion {
                    job_id: entry.job_id.clone(),
                    from,
                    to: entry.priority,
                });
                let target = &mut self.buckets[entry.priority.rank()];
                let pos = target.partition_point(|e| e.seq < entry.seq);
                target.insert(pos, entry);
            }
        }
        promotions
    }

    /// Remove and return the first entry, in priority then FIFO order, that
    /// `admit` accepts. Entries `admit` rejects stay where they are.
    pub fn pop_first_with<T, F>(&mut self, mut admit: F) -> Option<(QueueEntry, T)>
    where
        F: FnMut(&QueueEntry) -> Option<T>,
    {
        for bucket in self.buckets.iter_mut() {
            let found = bucket
                .iter()
                .enumerate()
                .find_map(|(pos, entry)| admit(entry).map(|token| (pos, token)));
            if let Some((pos, token)) = found {
                return bucket.remove(pos).map(|entry| (entry, token));
            }
        }
        None
    }

    pub fn pop(&mut self) -> Option<QueueEntry> {
        self.pop_first_with(|_| Some(())).map(|(entry, _)| entry)
    }
}
