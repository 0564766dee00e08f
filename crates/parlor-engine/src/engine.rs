//! The engine: one room's replicated state.
//!
//! The engine ingests authoritative posts from its transport, tracks its
//! own optimistic posts until their echoes arrive, and answers state
//! queries by deterministic replay over the timeline, accelerated by the
//! snapshot cache. All handlers are pure functions of their inputs; two
//! engines that have ingested the same set of posts agree on `state_at`
//! for every tick, whatever order the network delivered them in.
//!
//! The core is single-threaded by contract. It is confined behind one
//! mutex so transport callbacks and callers serialize; no public method
//! suspends or re-enters.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace, warn};

use crate::error::EngineError;
use crate::post::{time_to_tick, Post};
use crate::snapshot::SnapshotCache;
use crate::timeline::{RemoteOutcome, Timeline};
use crate::transport::{PostHandler, Transport};

/// Application hooks driving one room's state.
///
/// All three functions must be pure and treat state as immutable: build
/// and return new values. States should be cheap to clone (small values,
/// or structurally shared containers) — every checkpoint holds one.
pub trait Simulation: Send + 'static {
    /// Room state.
    type State: Clone + Send;

    /// State before any post has been applied.
    fn init(&self) -> Self::State;

    /// Advances state across one tick boundary.
    fn on_tick(&self, state: &Self::State, tick: u64) -> Self::State;

    /// Applies one post taking effect at its official tick.
    fn on_post(&self, state: &Self::State, post: &Post) -> Self::State;

    /// Blends the lagged authoritative state with the predicted current
    /// state for rendering.
    fn smooth(&self, remote: &Self::State, current: &Self::State) -> Self::State;
}

/// Engine tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Ticks per second.
    pub tick_rate: u32,
    /// How far a client clock may lead the broker's view, in ms.
    pub tolerance_ms: i64,
    /// Disable to force full replay on every query (reference mode).
    pub cache_enabled: bool,
    /// Checkpoint spacing in ticks.
    pub snapshot_stride: u64,
    /// Checkpoint capacity; together with the stride this bounds both
    /// memory and how far back a late post can still be reconciled.
    pub snapshot_count: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_rate: 24,
            tolerance_ms: 300,
            cache_enabled: true,
            snapshot_stride: 8,
            snapshot_count: 256,
        }
    }
}

/// The render-time lag, in ticks, behind which the authoritative log is
/// very likely complete: past the tolerance window and past any in-flight
/// post half an RTT away.
pub fn remote_lag_ticks(tick_rate: u32, tolerance_ms: i64, rtt_ms: Option<u64>) -> u64 {
    let tol_ticks = ceil_ticks(tolerance_ms.max(0) as u64, tick_rate);
    match rtt_ms {
        Some(rtt) => tol_ticks.max(ceil_ticks(rtt / 2, tick_rate) + 1),
        None => tol_ticks,
    }
}

fn ceil_ticks(ms: u64, tick_rate: u32) -> u64 {
    (ms * tick_rate as u64).div_ceil(1000)
}

/// Mutable interior: everything the watch handler and the public methods
/// share.
struct Core<G: Simulation> {
    sim: G,
    config: EngineConfig,
    timeline: Timeline,
    /// Created once the room origin (post index 0) is known.
    cache: Option<SnapshotCache<G::State>>,
}

impl<G: Simulation> Core<G> {
    fn window_start(&self) -> Option<u64> {
        if !self.config.cache_enabled {
            return None;
        }
        self.cache.as_ref().map(SnapshotCache::start_tick)
    }

    fn invalidate(&mut self, tick: u64) {
        if let Some(cache) = &mut self.cache {
            cache.invalidate_from(tick);
        }
    }

    /// Ingests one arrival from the transport: reconcile any prediction
    /// with the same name, then insert the authoritative copy.
    fn ingest(&mut self, post: Post) {
        if !post.name.is_empty() {
            if let Some(tick) = self.timeline.remove_local(&post.name) {
                self.invalidate(tick);
            }
        }

        let tick = self.timeline.official_tick_of(&post);
        let room = post.room.clone();
        let index = post.index;
        let window_start = self.window_start();
        match self.timeline.add_remote(post, window_start) {
            RemoteOutcome::Inserted { tick } => self.invalidate(tick),
            RemoteOutcome::Duplicate => {
                trace!("duplicate post {index} for {room} dropped");
            }
            RemoteOutcome::BeforeWindow => {
                // Unrecoverable without a full reload; the engine stays
                // valid but may diverge from peers whose window still
                // holds this tick.
                warn!("post {index} for {room} at tick {tick} predates the snapshot window");
            }
        }
    }

    fn add_local(&mut self, post: Post) {
        let window_start = self.window_start();
        if let Some(tick) = self.timeline.add_local(post, window_start) {
            self.invalidate(tick);
        }
    }

    /// Deterministic state at `at_tick` given current timeline contents.
    fn state_at(&mut self, at_tick: u64) -> G::State {
        let Some(initial_tick) = self.timeline.initial_tick() else {
            return self.sim.init();
        };
        if at_tick < initial_tick {
            return self.sim.init();
        }
        if !self.config.cache_enabled {
            return replay_from_init(&self.sim, &self.timeline, at_tick);
        }

        if self.cache.is_none() {
            self.cache = Some(SnapshotCache::new(
                initial_tick,
                self.config.snapshot_stride,
                self.config.snapshot_count,
            ));
        }

        let prune = {
            let sim = &self.sim;
            let timeline = &self.timeline;
            let cache = self.cache.as_mut().expect("cache created above");
            let target = at_tick.max(cache.start_tick());
            cache.ensure_through(
                target,
                |tick| replay_from_init(sim, timeline, tick),
                |prev, from, to| {
                    let mut state = prev.clone();
                    replay_span(sim, timeline, &mut state, from + 1, to);
                    state
                },
            )
        };
        if let Some(prune) = prune {
            debug!(
                "snapshot window slid to tick {} ({} checkpoints dropped)",
                prune.new_start_tick, prune.dropped
            );
            self.timeline.prune_below(prune.new_start_tick);
        }

        let cache = self.cache.as_ref().expect("cache created above");
        // A query older than the window answers with the oldest retained
        // checkpoint: the best available authoritative state.
        let query = at_tick.max(cache.start_tick());
        let (snap_tick, snap) = cache
            .nearest_at_or_before(query)
            .expect("ensure_through populated the cache");
        let mut state = snap.clone();
        replay_span(&self.sim, &self.timeline, &mut state, snap_tick + 1, query);
        state
    }
}

/// Full replay from the room origin through `to`.
fn replay_from_init<G: Simulation>(sim: &G, timeline: &Timeline, to: u64) -> G::State {
    let mut state = sim.init();
    if let Some(initial_tick) = timeline.initial_tick() {
        replay_span(sim, timeline, &mut state, initial_tick, to);
    }
    state
}

/// Replays the ticks `from..=to` onto `state`: `on_tick`, then the tick's
/// posts in canonical order. Empty when `from > to`.
fn replay_span<G: Simulation>(sim: &G, timeline: &Timeline, state: &mut G::State, from: u64, to: u64) {
    for tick in from..=to {
        *state = sim.on_tick(state, tick);
        for post in timeline.posts_at(tick) {
            *state = sim.on_post(state, post);
        }
    }
}

/// One room's replicated state engine.
pub struct Engine<G: Simulation, T: Transport + 'static> {
    room: String,
    config: EngineConfig,
    transport: Arc<T>,
    core: Arc<Mutex<Core<G>>>,
}

impl<G: Simulation, T: Transport + 'static> Engine<G, T> {
    /// Creates the engine and schedules its bootstrap: once the transport
    /// reports the clock synced, the engine subscribes to the room and
    /// requests the full log from index 0.
    pub fn new(room: impl Into<String>, sim: G, config: EngineConfig, transport: Arc<T>) -> Self {
        let room = room.into();
        let core = Arc::new(Mutex::new(Core {
            sim,
            config,
            timeline: Timeline::new(config.tick_rate, config.tolerance_ms),
            cache: None,
        }));

        let sync_transport = Arc::clone(&transport);
        let sync_core = Arc::clone(&core);
        let sync_room = room.clone();
        transport.on_sync(Box::new(move || {
            let handler_core = Arc::clone(&sync_core);
            let handler: PostHandler = Box::new(move |post| {
                lock_core(&handler_core).ingest(post);
            });
            if let Err(err) = sync_transport.watch(&sync_room, handler) {
                warn!("watch registration for {sync_room} failed: {err}");
                return;
            }
            if let Err(err) = sync_transport.load(&sync_room, 0) {
                warn!("backlog request for {sync_room} failed: {err}");
            }
        }));

        Self {
            room,
            config,
            transport,
            core,
        }
    }

    /// The room this engine replicates.
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Deterministic state at `tick`. Before the room origin is known
    /// (or for ticks preceding it) this is the initial state.
    pub fn state_at(&self, tick: u64) -> G::State {
        lock_core(&self.core).state_at(tick)
    }

    /// State at the current server tick; initial state before sync.
    pub fn current_state(&self) -> G::State {
        match self.server_tick() {
            Ok(tick) => self.state_at(tick),
            Err(_) => lock_core(&self.core).sim.init(),
        }
    }

    /// The rendered state: `smooth` over a lagged authoritative past and
    /// the predicted present. Initial state before sync.
    pub fn render_state(&self) -> G::State {
        let mut core = lock_core(&self.core);
        let Ok(now) = self.transport.server_time() else {
            return core.sim.init();
        };
        let curr_tick = time_to_tick(now, self.config.tick_rate);
        let lag = remote_lag_ticks(
            self.config.tick_rate,
            self.config.tolerance_ms,
            self.transport.ping(),
        );
        let remote = core.state_at(curr_tick.saturating_sub(lag));
        let current = core.state_at(curr_tick);
        core.sim.smooth(&remote, &current)
    }

    /// Publishes a post and applies it optimistically at the current
    /// server time. Fails with [`EngineError::NotSynced`] before the
    /// first clock sync and [`EngineError::NotOpen`] if the transport is
    /// down.
    pub fn post(&self, data: serde_json::Value) -> Result<String, EngineError> {
        let now = self.transport.server_time()?;
        let name = self.transport.post(&self.room, data.clone())?;
        let local = Post::local(&self.room, &name, now, data);
        lock_core(&self.core).add_local(local);
        Ok(name)
    }

    /// Estimated broker time in ms.
    pub fn server_time(&self) -> Result<i64, EngineError> {
        self.transport.server_time()
    }

    /// Current tick on the broker timeline.
    pub fn server_tick(&self) -> Result<u64, EngineError> {
        Ok(time_to_tick(self.server_time()?, self.config.tick_rate))
    }

    /// Maps a broker-timeline millisecond value to a tick.
    pub fn time_to_tick(&self, ms: i64) -> u64 {
        time_to_tick(ms, self.config.tick_rate)
    }

    /// Official time of the room's first post; `None` until it arrives.
    pub fn initial_time(&self) -> Option<i64> {
        lock_core(&self.core).timeline.initial_time()
    }

    /// Official tick of the room's first post; `None` until it arrives.
    pub fn initial_tick(&self) -> Option<u64> {
        lock_core(&self.core).timeline.initial_tick()
    }

    /// Retained authoritative posts.
    pub fn post_count(&self) -> usize {
        lock_core(&self.core).timeline.post_count()
    }

    /// First tick of the snapshot window, once established.
    pub fn window_start(&self) -> Option<u64> {
        lock_core(&self.core).window_start()
    }
}

fn lock_core<G: Simulation>(core: &Arc<Mutex<Core<G>>>) -> MutexGuard<'_, Core<G>> {
    core.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
