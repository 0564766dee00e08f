//! TCP client for a parlor broker.
//!
//! Owns the connection lifecycle: connect, spawn reader/writer/probe
//! tasks, and clean shutdown via a [`watch`] channel. The client feeds
//! `info_time` replies into the engine's [`Clock`] and routes `info_post`
//! deliveries to per-room watch handlers, implementing the engine's
//! [`Transport`] seam over the wire schema in [`crate::wire`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::Rng;
use rustc_hash::FxHashMap;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use parlor_engine::{Clock, EngineError, Post, PostHandler, SyncHandler, Transport};

use crate::framing::{read_frame, write_frame, FrameConfig};
use crate::wire::{decode, encode, Message};

/// Cadence of `get_time` probes.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(2);

struct Shared {
    outbound: mpsc::UnboundedSender<Message>,
    clock: Mutex<Clock>,
    /// Origin of the local monotonic millisecond timeline.
    epoch: Instant,
    open: AtomicBool,
    watchers: Mutex<FxHashMap<String, Arc<Mutex<PostHandler>>>>,
    /// Local send time of the outstanding probe, if any.
    probe_sent_at: Mutex<Option<i64>>,
}

impl Shared {
    fn local_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }
}

/// Handle to a connected broker session.
///
/// Created via [`BrokerClient::connect`]. Cloneable handles are not
/// needed: the engine holds it behind an `Arc`.
pub struct BrokerClient {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
}

impl BrokerClient {
    /// Connects to the broker at `addr`, sets `TCP_NODELAY`, and spawns
    /// the reader, writer, and time-probe tasks. Returns right after the
    /// TCP handshake; the clock syncs in the background.
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, mut write_half) = stream.into_split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            outbound,
            clock: Mutex::new(Clock::new()),
            epoch: Instant::now(),
            open: AtomicBool::new(true),
            watchers: Mutex::new(FxHashMap::default()),
            probe_sent_at: Mutex::new(None),
        });

        // Writer task: drains the outbound queue onto the socket.
        let writer_shared = Arc::clone(&shared);
        let mut writer_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let config = FrameConfig::default();
            loop {
                tokio::select! {
                    message = outbound_rx.recv() => {
                        let Some(message) = message else { break };
                        let payload = match encode(&message) {
                            Ok(payload) => payload,
                            Err(err) => {
                                warn!(%err, "dropping unencodable message");
                                continue;
                            }
                        };
                        if let Err(err) = write_frame(&mut write_half, &payload, &config).await {
                            debug!(%err, "broker write failed");
                            writer_shared.open.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                    _ = writer_shutdown.changed() => {
                        if *writer_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        // Reader task: decodes frames and dispatches them.
        let reader_shared = Arc::clone(&shared);
        let mut reader_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let config = FrameConfig::default();
            let mut reader = BufReader::new(read_half);
            loop {
                tokio::select! {
                    frame = read_frame(&mut reader, &config) => {
                        match frame {
                            Ok(raw) => match decode(&raw) {
                                Ok(message) => dispatch(&reader_shared, message),
                                Err(err) if err.is_skippable() => {
                                    debug!(%err, "skipping frame")
                                }
                                Err(err) => warn!(%err, "malformed frame"),
                            },
                            Err(err) => {
                                debug!(%err, "broker read failed");
                                reader_shared.open.store(false, Ordering::SeqCst);
                                break;
                            }
                        }
                    }
                    _ = reader_shutdown.changed() => {
                        if *reader_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        // Probe task: one get_time roughly every two seconds.
        let probe_shared = Arc::clone(&shared);
        let mut probe_shutdown = shutdown_rx;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PROBE_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if !probe_shared.open.load(Ordering::SeqCst) {
                            break;
                        }
                        *lock(&probe_shared.probe_sent_at) = Some(probe_shared.local_ms());
                        if probe_shared.outbound.send(Message::GetTime).is_err() {
                            break;
                        }
                    }
                    _ = probe_shutdown.changed() => {
                        if *probe_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self {
            shared,
            shutdown_tx,
        })
    }

    /// `true` while the socket is believed healthy.
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Signals all background tasks to exit and marks the client closed.
    /// Reconnection means building a fresh client (and a fresh engine).
    pub fn disconnect(&self) {
        self.shared.open.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
    }

    /// Drops the watch handler for `room` and tells the broker.
    pub fn unwatch(&self, room: &str) -> Result<(), EngineError> {
        lock(&self.shared.watchers).remove(room);
        self.send(Message::Unwatch {
            room: room.to_string(),
        })
    }

    fn send(&self, message: Message) -> Result<(), EngineError> {
        if !self.is_open() {
            return Err(EngineError::NotOpen);
        }
        self.shared
            .outbound
            .send(message)
            .map_err(|_| EngineError::NotOpen)
    }
}

impl Transport for BrokerClient {
    fn on_sync(&self, cb: SyncHandler) {
        let immediate = lock(&self.shared.clock).on_sync(cb);
        if let Some(cb) = immediate {
            cb();
        }
    }

    fn watch(&self, room: &str, handler: PostHandler) -> Result<(), EngineError> {
        {
            let mut watchers = lock(&self.shared.watchers);
            if watchers.contains_key(room) {
                return Err(EngineError::DuplicateHandler(room.to_string()));
            }
            watchers.insert(room.to_string(), Arc::new(Mutex::new(handler)));
        }
        self.send(Message::Watch {
            room: room.to_string(),
        })
    }

    fn load(&self, room: &str, from: u64) -> Result<(), EngineError> {
        self.send(Message::Load {
            room: room.to_string(),
            from,
        })
    }

    fn post(&self, room: &str, data: serde_json::Value) -> Result<String, EngineError> {
        let time = self.server_time()?;
        let name = fresh_name();
        self.send(Message::Post {
            room: room.to_string(),
            time,
            name: name.clone(),
            data,
        })?;
        Ok(name)
    }

    fn server_time(&self) -> Result<i64, EngineError> {
        let local_now = self.shared.local_ms();
        lock(&self.shared.clock).server_time(local_now)
    }

    fn ping(&self) -> Option<u64> {
        lock(&self.shared.clock).ping()
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// 128 bits of entropy as lowercase hex.
fn fresh_name() -> String {
    let mut rng = rand::thread_rng();
    let hi: u64 = rng.gen();
    let lo: u64 = rng.gen();
    format!("{hi:016x}{lo:016x}")
}

fn dispatch(shared: &Shared, message: Message) {
    match message {
        Message::InfoTime { time } => {
            let recv_at = shared.local_ms();
            let sent_at = lock(&shared.probe_sent_at).take();
            let Some(sent_at) = sent_at else {
                debug!("info_time without an outstanding probe");
                return;
            };
            let waiters = lock(&shared.clock).on_time_sample(sent_at, recv_at, time);
            for waiter in waiters {
                waiter();
            }
        }
        Message::InfoPost {
            room,
            index,
            server_time,
            client_time,
            name,
            data,
        } => {
            let handler = lock(&shared.watchers).get(&room).map(Arc::clone);
            let Some(handler) = handler else {
                debug!("post {index} for unwatched room {room}");
                return;
            };
            let post = Post {
                room,
                index,
                server_time,
                client_time,
                name,
                data,
            };
            (*lock(&handler))(post);
        }
        other => debug!(?other, "unexpected message from broker"),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
