//! The timeline: canonical per-tick ordering of a room's posts.
//!
//! Remote posts are deduplicated by their broker index and bucketed by
//! official tick, sorted by index within the bucket. Local predictions are
//! bucketed by the same rule in insertion order and keyed by name so the
//! authoritative echo can replace them. The canonical application order at
//! any tick is: `on_tick`, then every remote post by ascending index, then
//! every local post in insertion order. State never depends on wall-clock
//! arrival order.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::post::{official_tick, official_time, Post};

/// Posts taking effect at one tick.
#[derive(Debug, Default, Clone)]
pub struct TickBucket {
    /// Authoritative posts, ascending index.
    pub remote: Vec<Post>,
    /// Local predictions, insertion order.
    pub local: Vec<Post>,
}

impl TickBucket {
    fn is_empty(&self) -> bool {
        self.remote.is_empty() && self.local.is_empty()
    }
}

/// Result of ingesting a remote post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// Newly inserted; state from `tick` onward must be recomputed.
    Inserted {
        /// The post's official tick.
        tick: u64,
    },
    /// Same index already ingested; dropped.
    Duplicate,
    /// Official tick precedes the snapshot window; dropped.
    BeforeWindow,
}

/// Dedup, bucketing, and reconciliation for one room.
#[derive(Debug)]
pub struct Timeline {
    tick_rate: u32,
    tolerance_ms: i64,
    /// index -> official tick, for dedup and pruning.
    remote_ticks: BTreeMap<i64, u64>,
    /// local post name -> official tick.
    local_ticks: FxHashMap<String, u64>,
    buckets: BTreeMap<u64, TickBucket>,
    /// Pinned when post index 0 arrives: (official_time, official_tick).
    initial: Option<(i64, u64)>,
}

impl Timeline {
    /// An empty timeline for a room replayed at `tick_rate` with the given
    /// clock tolerance.
    pub fn new(tick_rate: u32, tolerance_ms: i64) -> Self {
        Self {
            tick_rate,
            tolerance_ms,
            remote_ticks: BTreeMap::new(),
            local_ticks: FxHashMap::default(),
            buckets: BTreeMap::new(),
            initial: None,
        }
    }

    /// The deterministic tick at which `post` takes effect.
    pub fn official_tick_of(&self, post: &Post) -> u64 {
        official_tick(post, self.tolerance_ms, self.tick_rate)
    }

    /// Ingests an authoritative post. `window_start` is the current
    /// snapshot-window start, if the cache has established one; posts whose
    /// tick falls before it cannot be replayed and are dropped.
    pub fn add_remote(&mut self, post: Post, window_start: Option<u64>) -> RemoteOutcome {
        let tick = self.official_tick_of(&post);

        // The very first entry of the log pins the room origin, once.
        if post.index == 0 && self.initial.is_none() {
            let time = official_time(post.client_time, post.server_time, self.tolerance_ms);
            self.initial = Some((time, tick));
        }

        if window_start.is_some_and(|start| tick < start) {
            return RemoteOutcome::BeforeWindow;
        }
        if self.remote_ticks.contains_key(&post.index) {
            return RemoteOutcome::Duplicate;
        }

        self.remote_ticks.insert(post.index, tick);
        let bucket = self.buckets.entry(tick).or_default();
        let at = bucket.remote.partition_point(|p| p.index < post.index);
        bucket.remote.insert(at, post);
        RemoteOutcome::Inserted { tick }
    }

    /// Ingests a local prediction. A live prediction with the same name is
    /// replaced first, so re-posting is idempotent.
    ///
    /// Returns the tick to invalidate from, or `None` if nothing changed.
    pub fn add_local(&mut self, post: Post, window_start: Option<u64>) -> Option<u64> {
        let replaced = self.remove_local(&post.name);

        let tick = self.official_tick_of(&post);
        if window_start.is_some_and(|start| tick < start) {
            return replaced;
        }

        self.local_ticks.insert(post.name.clone(), tick);
        self.buckets.entry(tick).or_default().local.push(post);
        Some(match replaced {
            Some(old) => old.min(tick),
            None => tick,
        })
    }

    /// Removes the live local prediction named `name`, if any, returning
    /// the tick it vacated (state from there onward must be recomputed).
    pub fn remove_local(&mut self, name: &str) -> Option<u64> {
        let tick = self.local_ticks.remove(name)?;
        if let Some(bucket) = self.buckets.get_mut(&tick) {
            bucket.local.retain(|p| p.name != name);
            if bucket.is_empty() {
                self.buckets.remove(&tick);
            }
        }
        Some(tick)
    }

    /// The bucket at `tick`, if any post takes effect there.
    pub fn bucket(&self, tick: u64) -> Option<&TickBucket> {
        self.buckets.get(&tick)
    }

    /// Posts taking effect at `tick` in canonical order: remote by
    /// ascending index, then local in insertion order.
    pub fn posts_at(&self, tick: u64) -> impl Iterator<Item = &Post> {
        self.buckets
            .get(&tick)
            .into_iter()
            .flat_map(|b| b.remote.iter().chain(b.local.iter()))
    }

    /// Drops every post bucketed before `tick`. Called after the snapshot
    /// window slides; nothing below the window can be replayed again.
    pub fn prune_below(&mut self, tick: u64) {
        self.buckets = self.buckets.split_off(&tick);
        self.remote_ticks.retain(|_, t| *t >= tick);
        self.local_ticks.retain(|_, t| *t >= tick);
    }

    /// Retained authoritative posts.
    pub fn post_count(&self) -> usize {
        self.remote_ticks.len()
    }

    /// Live local predictions.
    pub fn local_count(&self) -> usize {
        self.local_ticks.len()
    }

    /// Official time of post index 0; `None` until it has been seen.
    pub fn initial_time(&self) -> Option<i64> {
        self.initial.map(|(time, _)| time)
    }

    /// Official tick of post index 0; `None` until it has been seen.
    pub fn initial_tick(&self) -> Option<u64> {
        self.initial.map(|(_, tick)| tick)
    }
}
