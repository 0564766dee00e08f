//! Bounded fixed-stride state checkpoints.
//!
//! The cache holds at most `capacity` states at ticks `start_tick`,
//! `start_tick + stride`, … so any in-window state query costs at most one
//! checkpoint clone plus `stride` replayed ticks. Late arrivals invalidate
//! every checkpoint at or after their tick; the next query refills forward
//! from the nearest surviving checkpoint. When the cache overflows it
//! drops its oldest entries and reports the slide so the caller can prune
//! everything that fell out of the window.

/// Report that the window slid forward during [`SnapshotCache::ensure_through`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prune {
    /// New first checkpoint tick; nothing below it can be replayed again.
    pub new_start_tick: u64,
    /// Checkpoints dropped from the front.
    pub dropped: usize,
}

/// Evenly spaced, capacity-bounded `(tick, state)` checkpoints.
#[derive(Debug)]
pub struct SnapshotCache<S> {
    stride: u64,
    capacity: usize,
    start_tick: u64,
    /// Entry `k` is the state at `start_tick + k * stride`.
    states: std::collections::VecDeque<S>,
}

impl<S> SnapshotCache<S> {
    /// A cache anchored at `start_tick` (the room's initial tick) holding
    /// up to `capacity` checkpoints every `stride` ticks. Both parameters
    /// are clamped to at least 1.
    pub fn new(start_tick: u64, stride: u64, capacity: usize) -> Self {
        Self {
            stride: stride.max(1),
            capacity: capacity.max(1),
            start_tick,
            states: std::collections::VecDeque::new(),
        }
    }

    /// Tick of the first (oldest) checkpoint slot.
    pub fn start_tick(&self) -> u64 {
        self.start_tick
    }

    /// Checkpoint spacing in ticks.
    pub fn stride(&self) -> u64 {
        self.stride
    }

    /// Stored checkpoints.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// `true` if no checkpoints are stored.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Tick of the newest stored checkpoint.
    pub fn last_tick(&self) -> Option<u64> {
        let len = self.states.len() as u64;
        (len > 0).then(|| self.start_tick + (len - 1) * self.stride)
    }

    /// Ensures checkpoints exist for every stride multiple from
    /// `start_tick` through the greatest one at or before `at_tick`.
    ///
    /// `seed(tick)` produces the state at `start_tick` by full replay when
    /// the cache is empty; `advance(prev, prev_tick, next_tick)` replays
    /// the ticks in `(prev_tick, next_tick]`. Overflow drops the oldest
    /// checkpoints and returns the slide.
    pub fn ensure_through<G, F>(&mut self, at_tick: u64, seed: G, mut advance: F) -> Option<Prune>
    where
        G: FnOnce(u64) -> S,
        F: FnMut(&S, u64, u64) -> S,
    {
        let target = if at_tick <= self.start_tick {
            self.start_tick
        } else {
            self.start_tick + (at_tick - self.start_tick) / self.stride * self.stride
        };

        if self.states.is_empty() {
            self.states.push_back(seed(self.start_tick));
        }

        // Safe: non-empty by the push above.
        while self.last_tick().unwrap_or(self.start_tick) < target {
            let prev_tick = self.last_tick().unwrap_or(self.start_tick);
            let next_tick = prev_tick + self.stride;
            let prev = self
                .states
                .back()
                .expect("cache seeded before filling forward");
            let next = advance(prev, prev_tick, next_tick);
            self.states.push_back(next);
        }

        if self.states.len() > self.capacity {
            let dropped = self.states.len() - self.capacity;
            self.states.drain(..dropped);
            self.start_tick += dropped as u64 * self.stride;
            return Some(Prune {
                new_start_tick: self.start_tick,
                dropped,
            });
        }
        None
    }

    /// Drops every checkpoint whose tick is `>= tick`. Clears everything
    /// when `tick <= start_tick`; a tick past the newest checkpoint is a
    /// no-op.
    pub fn invalidate_from(&mut self, tick: u64) {
        if tick <= self.start_tick {
            self.states.clear();
            return;
        }
        // First slot at or above `tick`; slots below survive.
        let keep = ((tick - self.start_tick).div_ceil(self.stride)) as usize;
        if keep < self.states.len() {
            self.states.truncate(keep);
        }
    }

    /// The newest checkpoint at or before `at_tick`.
    pub fn nearest_at_or_before(&self, at_tick: u64) -> Option<(u64, &S)> {
        if at_tick < self.start_tick {
            return None;
        }
        let slot = ((at_tick - self.start_tick) / self.stride) as usize;
        let slot = slot.min(self.states.len().checked_sub(1)?);
        Some((self.start_tick + slot as u64 * self.stride, &self.states[slot]))
    }
}
