//! The broker server: accepts framed-JSON connections, stamps and appends
//! posts, and fans them out to room watchers.
//!
//! The broker never computes room state. Its only invariants are dense
//! indices per room (the store's append order) and monotonically
//! non-decreasing `server_time` stamps across them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use parlor_net::framing::{read_frame, write_frame, FrameConfig};
use parlor_net::wire::{decode, encode, Message};

use crate::store::{LogRecord, RoomStore, StoreError};

/// Unique identifier for a connection within a broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Configuration for [`Broker`].
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address to bind to. Default: `0.0.0.0:9440`.
    pub bind_addr: SocketAddr,
    /// Directory holding the room logs. Default: `./rooms`.
    pub data_dir: PathBuf,
    /// Maximum concurrent connections. Default: 256.
    pub max_connections: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9440".parse().expect("static addr"),
            data_dir: PathBuf::from("./rooms"),
            max_connections: 256,
        }
    }
}

struct Inner {
    store: Mutex<RoomStore>,
    /// room -> (connection -> its outbound queue).
    watchers: Mutex<HashMap<String, HashMap<ConnectionId, mpsc::UnboundedSender<Message>>>>,
    /// Last issued `server_time`; stamps never go backwards.
    last_stamp: AtomicI64,
}

impl Inner {
    /// Wall-clock ms, clamped to be non-decreasing across calls.
    fn stamp(&self) -> i64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        let prev = self.last_stamp.fetch_max(wall, Ordering::SeqCst);
        wall.max(prev)
    }
}

/// The broker server.
pub struct Broker {
    config: BrokerConfig,
    inner: Arc<Inner>,
    id_gen: IdGenerator,
    conn_count: Arc<AtomicUsize>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Broker {
    /// Opens the room store and prepares a broker for `run`.
    pub fn new(config: BrokerConfig) -> Result<Self, StoreError> {
        let store = RoomStore::open(&config.data_dir)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            config,
            inner: Arc::new(Inner {
                store: Mutex::new(store),
                watchers: Mutex::new(HashMap::new()),
                last_stamp: AtomicI64::new(0),
            }),
            id_gen: IdGenerator::new(),
            conn_count: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Binds to the configured address and runs the accept loop.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("broker listening on {}", self.config.bind_addr);
        self.run_with_listener(listener).await
    }

    /// Runs the accept loop with a pre-bound listener (useful for tests).
    pub async fn run_with_listener(&self, listener: TcpListener) -> std::io::Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = result?;
                    if self.conn_count.load(Ordering::SeqCst) >= self.config.max_connections {
                        warn!("connection limit reached, rejecting {peer_addr}");
                        continue;
                    }
                    stream.set_nodelay(true)?;

                    let id = self.id_gen.next_id();
                    self.conn_count.fetch_add(1, Ordering::SeqCst);
                    debug!("accepted connection {id:?} from {peer_addr}");

                    let inner = Arc::clone(&self.inner);
                    let conn_count = Arc::clone(&self.conn_count);
                    let mut session_shutdown = self.shutdown_rx.clone();
                    tokio::spawn(async move {
                        run_session(id, stream, &inner, &mut session_shutdown).await;
                        detach(&inner, id);
                        conn_count.fetch_sub(1, Ordering::SeqCst);
                        debug!("connection {id:?} closed");
                    });
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("broker shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Signals the broker to stop accepting and unwind its sessions.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Removes a closed connection from every room's watcher set.
fn detach(inner: &Inner, id: ConnectionId) {
    let mut watchers = lock(&inner.watchers);
    watchers.retain(|_, subs| {
        subs.remove(&id);
        !subs.is_empty()
    });
}

/// Per-connection session: a writer task draining the outbound queue and
/// a read loop handling requests until EOF or shutdown.
async fn run_session(
    id: ConnectionId,
    stream: tokio::net::TcpStream,
    inner: &Arc<Inner>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

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
                    if write_frame(&mut write_half, &payload, &config).await.is_err() {
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

    let config = FrameConfig::default();
    let mut reader = BufReader::new(read_half);
    loop {
        tokio::select! {
            frame = read_frame(&mut reader, &config) => {
                let raw = match frame {
                    Ok(raw) => raw,
                    Err(_) => break,
                };
                match decode(&raw) {
                    Ok(message) => handle_message(inner, id, &outbound, message),
                    Err(err) if err.is_skippable() => debug!(%err, "skipping frame"),
                    Err(err) => warn!(%err, "malformed frame from {id:?}"),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

fn handle_message(
    inner: &Inner,
    id: ConnectionId,
    outbound: &mpsc::UnboundedSender<Message>,
    message: Message,
) {
    match message {
        Message::GetTime => {
            let _ = outbound.send(Message::InfoTime {
                time: inner.stamp(),
            });
        }
        Message::Post {
            room,
            time,
            name,
            data,
        } => {
            let record = LogRecord {
                server_time: inner.stamp(),
                client_time: time,
                name,
                data,
            };
            let index = match lock(&inner.store).append(&room, &record) {
                Ok(index) => index,
                Err(err) => {
                    warn!("append to {room} failed, post dropped: {err}");
                    return;
                }
            };
            fan_out(inner, &room, index, &record);
        }
        Message::Load { room, from } => {
            let records = match lock(&inner.store).read_from(&room, from) {
                Ok(records) => records,
                Err(err) => {
                    warn!("backlog read for {room} failed: {err}");
                    return;
                }
            };
            for (index, record) in records {
                let _ = outbound.send(info_post(&room, index, &record));
            }
        }
        Message::Watch { room } => {
            lock(&inner.watchers)
                .entry(room)
                .or_default()
                .insert(id, outbound.clone());
        }
        Message::Unwatch { room } => {
            let mut watchers = lock(&inner.watchers);
            if let Some(subs) = watchers.get_mut(&room) {
                subs.remove(&id);
                if subs.is_empty() {
                    watchers.remove(&room);
                }
            }
        }
        other => debug!(?other, "client sent a server-only message"),
    }
}

/// Delivers a freshly appended post to every watcher of the room, the
/// poster included if it watches.
fn fan_out(inner: &Inner, room: &str, index: u64, record: &LogRecord) {
    let watchers = lock(&inner.watchers);
    let Some(subs) = watchers.get(room) else {
        return;
    };
    for sender in subs.values() {
        let _ = sender.send(info_post(room, index, record));
    }
}

fn info_post(room: &str, index: u64, record: &LogRecord) -> Message {
    Message::InfoPost {
        room: room.to_string(),
        index: index as i64,
        server_time: record.server_time,
        client_time: record.client_time,
        name: record.name.clone(),
        data: record.data.clone(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::BufReader;
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::TcpStream;

    struct RawClient {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
        config: FrameConfig,
    }

    impl RawClient {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read_half, writer) = stream.into_split();
            Self {
                reader: BufReader::new(read_half),
                writer,
                config: FrameConfig::default(),
            }
        }

        async fn send(&mut self, message: &Message) {
            let payload = encode(message).unwrap();
            write_frame(&mut self.writer, &payload, &self.config)
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> Message {
            let raw = tokio::time::timeout(
                Duration::from_secs(5),
                read_frame(&mut self.reader, &self.config),
            )
            .await
            .expect("reply within five seconds")
            .unwrap();
            decode(&raw).unwrap()
        }
    }

    async fn start_broker() -> (SocketAddr, Arc<Broker>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = BrokerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            data_dir: dir.path().to_path_buf(),
            max_connections: 16,
        };
        let broker = Arc::new(Broker::new(config).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let srv = Arc::clone(&broker);
        tokio::spawn(async move {
            srv.run_with_listener(listener).await.unwrap();
        });
        (addr, broker, dir)
    }

    #[tokio::test]
    async fn test_get_time_replies_monotonically() {
        let (addr, _broker, _dir) = start_broker().await;
        let mut client = RawClient::connect(addr).await;

        let mut last = 0;
        for _ in 0..3 {
            client.send(&Message::GetTime).await;
            match client.recv().await {
                Message::InfoTime { time } => {
                    assert!(time >= last);
                    last = time;
                }
                other => panic!("expected info_time, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_post_is_echoed_to_watching_poster() {
        let (addr, _broker, _dir) = start_broker().await;
        let mut client = RawClient::connect(addr).await;

        client
            .send(&Message::Watch {
                room: "lobby".to_string(),
            })
            .await;
        client
            .send(&Message::Post {
                room: "lobby".to_string(),
                time: 123,
                name: "abc".to_string(),
                data: serde_json::json!({ "kind": "join" }),
            })
            .await;

        match client.recv().await {
            Message::InfoPost {
                room,
                index,
                client_time,
                name,
                ..
            } => {
                assert_eq!(room, "lobby");
                assert_eq!(index, 0);
                assert_eq!(client_time, 123);
                assert_eq!(name, "abc");
            }
            other => panic!("expected info_post, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fan_out_reaches_other_watchers() {
        let (addr, _broker, _dir) = start_broker().await;
        let mut watcher = RawClient::connect(addr).await;
        let mut poster = RawClient::connect(addr).await;

        watcher
            .send(&Message::Watch {
                room: "lobby".to_string(),
            })
            .await;
        // Give the watch frame time to land before posting.
        tokio::time::sleep(Duration::from_millis(50)).await;

        poster
            .send(&Message::Post {
                room: "lobby".to_string(),
                time: 7,
                name: "n1".to_string(),
                data: serde_json::Value::Null,
            })
            .await;

        match watcher.recv().await {
            Message::InfoPost { index, name, .. } => {
                assert_eq!(index, 0);
                assert_eq!(name, "n1");
            }
            other => panic!("expected info_post, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_load_streams_backlog_in_order() {
        let (addr, _broker, _dir) = start_broker().await;
        let mut poster = RawClient::connect(addr).await;
        for n in 0..3 {
            poster
                .send(&Message::Post {
                    room: "lobby".to_string(),
                    time: n,
                    name: format!("n{n}"),
                    data: serde_json::Value::Null,
                })
                .await;
        }
        // Posts are handled in order; a get_time round trip flushes them.
        poster.send(&Message::GetTime).await;
        let _ = poster.recv().await;

        let mut late = RawClient::connect(addr).await;
        late.send(&Message::Load {
            room: "lobby".to_string(),
            from: 1,
        })
        .await;

        for expected in 1..3 {
            match late.recv().await {
                Message::InfoPost { index, name, .. } => {
                    assert_eq!(index, expected);
                    assert_eq!(name, format!("n{expected}"));
                }
                other => panic!("expected info_post, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_unwatch_stops_delivery() {
        let (addr, _broker, _dir) = start_broker().await;
        let mut client = RawClient::connect(addr).await;

        client
            .send(&Message::Watch {
                room: "lobby".to_string(),
            })
            .await;
        client
            .send(&Message::Unwatch {
                room: "lobby".to_string(),
            })
            .await;
        client
            .send(&Message::Post {
                room: "lobby".to_string(),
                time: 1,
                name: "gone".to_string(),
                data: serde_json::Value::Null,
            })
            .await;
        // The next reply must be the time answer, not an echo.
        client.send(&Message::GetTime).await;
        match client.recv().await {
            Message::InfoTime { .. } => {}
            other => panic!("expected info_time, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_kind_is_ignored() {
        let (addr, _broker, _dir) = start_broker().await;
        let mut client = RawClient::connect(addr).await;

        write_frame(
            &mut client.writer,
            r#"{"$":"info_future","x":1}"#,
            &client.config,
        )
        .await
        .unwrap();

        client.send(&Message::GetTime).await;
        assert!(matches!(client.recv().await, Message::InfoTime { .. }));
    }
}
