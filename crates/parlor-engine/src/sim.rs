//! In-memory broker with a virtual clock.
//!
//! [`SimNet`] is a deterministic stand-in for a broker plus every client
//! link: posts travel through seeded per-client latency, jitter, and
//! duplication schedules, and time only advances inside
//! [`SimNet::run_until`]. A [`SimTransport`] handed out by
//! [`SimNet::client`] implements [`Transport`] exactly as the real TCP
//! client does, so whole-engine scenarios — convergence under jitter, late
//! joiners, duplicate deliveries — run without sockets and reproduce from
//! a seed.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::EngineError;
use crate::post::Post;
use crate::transport::{PostHandler, SyncHandler, Transport};

/// Link characteristics for one simulated client.
#[derive(Debug, Clone)]
pub struct LinkProfile {
    /// Uplink delay range in ms, inclusive.
    pub up_ms: (u64, u64),
    /// Downlink delay range in ms, inclusive.
    pub down_ms: (u64, u64),
    /// Extra downlink jitter in ms, sampled per delivery.
    pub jitter_ms: u64,
    /// Percent chance each delivery is duplicated.
    pub duplicate_pct: u8,
}

impl LinkProfile {
    /// Zero-latency, loss-free link.
    pub fn ideal() -> Self {
        Self {
            up_ms: (0, 0),
            down_ms: (0, 0),
            jitter_ms: 0,
            duplicate_pct: 0,
        }
    }

    /// Symmetric link with the given delay range on both directions.
    pub fn symmetric(min_ms: u64, max_ms: u64) -> Self {
        Self {
            up_ms: (min_ms, max_ms),
            down_ms: (min_ms, max_ms),
            jitter_ms: 0,
            duplicate_pct: 0,
        }
    }
}

impl Default for LinkProfile {
    fn default() -> Self {
        Self::ideal()
    }
}

#[derive(Debug)]
enum EventKind {
    /// The client's first time-probe round trip completed.
    Sync { client: usize },
    /// A post request reached the broker.
    ToBroker {
        client: usize,
        room: String,
        client_time: i64,
        name: String,
        data: serde_json::Value,
    },
    /// A backlog request reached the broker.
    LoadArrive {
        client: usize,
        room: String,
        from: u64,
    },
    /// An `info_post` reached a client.
    ToClient { client: usize, post: Post },
}

struct Event {
    at: i64,
    seq: u64,
    kind: EventKind,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        (self.at, self.seq) == (other.at, other.seq)
    }
}
impl Eq for Event {}
impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

struct LogEntry {
    server_time: i64,
    client_time: i64,
    name: String,
    data: serde_json::Value,
}

struct ClientState {
    link: LinkProfile,
    rng: ChaCha8Rng,
    synced: bool,
    ping_ms: Option<u64>,
    /// RTT of the in-flight first probe; becomes `ping_ms` at sync.
    pending_ping: Option<u64>,
    /// Broker-side view of this client's subscriptions.
    watching: HashSet<String>,
}

struct SimState {
    now_ms: i64,
    seq: u64,
    last_stamp: i64,
    rng: ChaCha8Rng,
    rooms: HashMap<String, Vec<LogEntry>>,
    clients: Vec<ClientState>,
    queue: BinaryHeap<Reverse<Event>>,
}

impl SimState {
    fn schedule(&mut self, at: i64, kind: EventKind) {
        let seq = self.seq;
        self.seq += 1;
        self.queue.push(Reverse(Event { at, seq, kind }));
    }

    fn up_delay(&mut self, client: usize) -> u64 {
        let (lo, hi) = self.clients[client].link.up_ms;
        self.clients[client].rng.gen_range(lo..=hi)
    }

    fn down_delay(&mut self, client: usize) -> u64 {
        let (lo, hi) = self.clients[client].link.down_ms;
        let jitter = self.clients[client].link.jitter_ms;
        let base = self.clients[client].rng.gen_range(lo..=hi);
        base + self.clients[client].rng.gen_range(0..=jitter)
    }

    /// Monotonic non-decreasing broker stamp.
    fn stamp(&mut self) -> i64 {
        self.last_stamp = self.last_stamp.max(self.now_ms);
        self.last_stamp
    }

    /// Appends to the room log and fans the echo out to every watcher.
    fn broker_append(
        &mut self,
        room: &str,
        client_time: i64,
        name: String,
        data: serde_json::Value,
    ) {
        let server_time = self.stamp();
        let log = self.rooms.entry(room.to_string()).or_default();
        let index = log.len() as i64;
        log.push(LogEntry {
            server_time,
            client_time,
            name: name.clone(),
            data: data.clone(),
        });

        let watchers: Vec<usize> = (0..self.clients.len())
            .filter(|&c| self.clients[c].watching.contains(room))
            .collect();
        for client in watchers {
            let post = Post {
                room: room.to_string(),
                index,
                server_time,
                client_time,
                name: name.clone(),
                data: data.clone(),
            };
            let delay = self.down_delay(client) as i64;
            self.schedule(self.now_ms + delay, EventKind::ToClient { client, post: post.clone() });

            let dup_pct = self.clients[client].link.duplicate_pct;
            if dup_pct > 0 && self.clients[client].rng.gen_range(0..100) < dup_pct {
                let delay = self.down_delay(client) as i64;
                self.schedule(self.now_ms + delay, EventKind::ToClient { client, post });
            }
        }
    }
}

#[derive(Default)]
struct HandlerTable {
    sync: Vec<Vec<SyncHandler>>,
    watch: Vec<HashMap<String, Arc<Mutex<PostHandler>>>>,
}

struct SimShared {
    state: Mutex<SimState>,
    handlers: Mutex<HandlerTable>,
}

/// Deterministic in-memory broker + network.
pub struct SimNet {
    shared: Arc<SimShared>,
}

impl SimNet {
    /// A fresh network; every latency, jitter, duplication, and name draw
    /// derives from `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            shared: Arc::new(SimShared {
                state: Mutex::new(SimState {
                    now_ms: 0,
                    seq: 0,
                    last_stamp: 0,
                    rng: ChaCha8Rng::seed_from_u64(seed),
                    rooms: HashMap::new(),
                    clients: Vec::new(),
                    queue: BinaryHeap::new(),
                }),
                handlers: Mutex::new(HandlerTable::default()),
            }),
        }
    }

    /// Attaches a client behind `link` and schedules its first time-probe
    /// round trip; the client reports synced once it completes.
    pub fn client(&self, link: LinkProfile) -> SimTransport {
        let id = {
            let mut state = lock(&self.shared.state);
            let id = state.clients.len();
            let client_seed = {
                let base: u64 = state.rng.gen();
                base.wrapping_add(id as u64)
            };
            state.clients.push(ClientState {
                link,
                rng: ChaCha8Rng::seed_from_u64(client_seed),
                synced: false,
                ping_ms: None,
                pending_ping: None,
                watching: HashSet::new(),
            });
            let rtt = state.up_delay(id) + state.down_delay(id);
            state.clients[id].pending_ping = Some(rtt);
            let at = state.now_ms + rtt as i64;
            state.schedule(at, EventKind::Sync { client: id });
            id
        };
        {
            let mut handlers = lock(&self.shared.handlers);
            handlers.sync.push(Vec::new());
            handlers.watch.push(HashMap::new());
        }
        SimTransport {
            shared: Arc::clone(&self.shared),
            id,
        }
    }

    /// Virtual time in ms.
    pub fn now(&self) -> i64 {
        lock(&self.shared.state).now_ms
    }

    /// Advances virtual time to `until_ms`, delivering everything due.
    pub fn run_until(&self, until_ms: i64) {
        loop {
            let event = {
                let mut state = lock(&self.shared.state);
                let due = state
                    .queue
                    .peek()
                    .is_some_and(|Reverse(next)| next.at <= until_ms);
                if !due {
                    state.now_ms = state.now_ms.max(until_ms);
                    return;
                }
                let Reverse(event) = state.queue.pop().expect("due event exists");
                state.now_ms = state.now_ms.max(event.at);
                event
            };
            self.dispatch(event);
        }
    }

    /// Appends a post to a room log directly, bypassing any client link.
    /// `client_time` is taken verbatim, which lets tests place the post at
    /// an arbitrary official tick. Returns the generated name.
    pub fn inject_post(&self, room: &str, client_time: i64, data: serde_json::Value) -> String {
        let mut state = lock(&self.shared.state);
        let name = {
            let hi: u64 = state.rng.gen();
            let lo: u64 = state.rng.gen();
            format!("{hi:016x}{lo:016x}")
        };
        state.broker_append(room, client_time, name.clone(), data);
        name
    }

    /// Number of entries in a room's log.
    pub fn log_len(&self, room: &str) -> usize {
        lock(&self.shared.state)
            .rooms
            .get(room)
            .map_or(0, Vec::len)
    }

    /// The room log as authoritative posts, for reference replays.
    pub fn log_posts(&self, room: &str) -> Vec<Post> {
        let state = lock(&self.shared.state);
        let Some(log) = state.rooms.get(room) else {
            return Vec::new();
        };
        log.iter()
            .enumerate()
            .map(|(index, entry)| Post {
                room: room.to_string(),
                index: index as i64,
                server_time: entry.server_time,
                client_time: entry.client_time,
                name: entry.name.clone(),
                data: entry.data.clone(),
            })
            .collect()
    }

    fn dispatch(&self, event: Event) {
        match event.kind {
            EventKind::Sync { client } => {
                {
                    let mut state = lock(&self.shared.state);
                    state.clients[client].synced = true;
                    state.clients[client].ping_ms = state.clients[client].pending_ping.take();
                }
                let waiters = {
                    let mut handlers = lock(&self.shared.handlers);
                    std::mem::take(&mut handlers.sync[client])
                };
                for waiter in waiters {
                    waiter();
                }
            }
            EventKind::ToBroker {
                client: _,
                room,
                client_time,
                name,
                data,
            } => {
                let mut state = lock(&self.shared.state);
                state.broker_append(&room, client_time, name, data);
            }
            EventKind::LoadArrive { client, room, from } => {
                let mut state = lock(&self.shared.state);
                let entries: Vec<Post> = state
                    .rooms
                    .get(&room)
                    .map(|log| {
                        log.iter()
                            .enumerate()
                            .skip(from as usize)
                            .map(|(index, entry)| Post {
                                room: room.clone(),
                                index: index as i64,
                                server_time: entry.server_time,
                                client_time: entry.client_time,
                                name: entry.name.clone(),
                                data: entry.data.clone(),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                for post in entries {
                    let delay = state.down_delay(client) as i64;
                    let at = state.now_ms + delay;
                    state.schedule(at, EventKind::ToClient { client, post });
                }
            }
            EventKind::ToClient { client, post } => {
                let handler = {
                    let handlers = lock(&self.shared.handlers);
                    handlers.watch[client].get(&post.room).map(Arc::clone)
                };
                if let Some(handler) = handler {
                    (*lock(&handler))(post);
                }
            }
        }
    }
}

/// One client's connection to a [`SimNet`].
pub struct SimTransport {
    shared: Arc<SimShared>,
    id: usize,
}

impl Transport for SimTransport {
    fn on_sync(&self, cb: SyncHandler) {
        let synced = lock(&self.shared.state).clients[self.id].synced;
        if synced {
            cb();
        } else {
            lock(&self.shared.handlers).sync[self.id].push(cb);
        }
    }

    fn watch(&self, room: &str, handler: PostHandler) -> Result<(), EngineError> {
        {
            let mut handlers = lock(&self.shared.handlers);
            let slot = &mut handlers.watch[self.id];
            if slot.contains_key(room) {
                return Err(EngineError::DuplicateHandler(room.to_string()));
            }
            slot.insert(room.to_string(), Arc::new(Mutex::new(handler)));
        }
        lock(&self.shared.state).clients[self.id]
            .watching
            .insert(room.to_string());
        Ok(())
    }

    fn load(&self, room: &str, from: u64) -> Result<(), EngineError> {
        let mut state = lock(&self.shared.state);
        let delay = state.up_delay(self.id) as i64;
        let at = state.now_ms + delay;
        state.schedule(
            at,
            EventKind::LoadArrive {
                client: self.id,
                room: room.to_string(),
                from,
            },
        );
        Ok(())
    }

    fn post(&self, room: &str, data: serde_json::Value) -> Result<String, EngineError> {
        let mut state = lock(&self.shared.state);
        if !state.clients[self.id].synced {
            return Err(EngineError::NotSynced);
        }
        let name = {
            let rng = &mut state.clients[self.id].rng;
            let hi: u64 = rng.gen();
            let lo: u64 = rng.gen();
            format!("{hi:016x}{lo:016x}")
        };
        let client_time = state.now_ms;
        let delay = state.up_delay(self.id) as i64;
        let at = state.now_ms + delay;
        state.schedule(
            at,
            EventKind::ToBroker {
                client: self.id,
                room: room.to_string(),
                client_time,
                name: name.clone(),
                data,
            },
        );
        Ok(name)
    }

    fn server_time(&self) -> Result<i64, EngineError> {
        let state = lock(&self.shared.state);
        if !state.clients[self.id].synced {
            return Err(EngineError::NotSynced);
        }
        Ok(state.now_ms)
    }

    fn ping(&self) -> Option<u64> {
        lock(&self.shared.state).clients[self.id].ping_ms
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
