//! Broker + TCP client + engine, end to end over localhost: two live
//! participants and one late joiner converge on identical replayed state.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;

use parlor_broker::{Broker, BrokerConfig};
use parlor_engine::{Engine, EngineConfig, Post, Simulation, Transport};
use parlor_net::BrokerClient;

/// State is the ordered list of applied post names.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct NamesState {
    applied: Vec<String>,
}

struct NamesSim;

impl Simulation for NamesSim {
    type State = NamesState;

    fn init(&self) -> NamesState {
        NamesState::default()
    }

    fn on_tick(&self, state: &NamesState, _tick: u64) -> NamesState {
        state.clone()
    }

    fn on_post(&self, state: &NamesState, post: &Post) -> NamesState {
        let mut next = state.clone();
        next.applied.push(post.name.clone());
        next
    }

    fn smooth(&self, remote: &NamesState, _current: &NamesState) -> NamesState {
        remote.clone()
    }
}

async fn start_broker(dir: &tempfile::TempDir) -> SocketAddr {
    let config = BrokerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        data_dir: dir.path().to_path_buf(),
        max_connections: 16,
    };
    let broker = Arc::new(Broker::new(config).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        broker.run_with_listener(listener).await.unwrap();
    });
    addr
}

async fn synced_client(addr: SocketAddr) -> Arc<BrokerClient> {
    let client = Arc::new(BrokerClient::connect(addr).await.unwrap());
    let (tx, rx) = oneshot::channel();
    let tx = std::sync::Mutex::new(Some(tx));
    client.on_sync(Box::new(move || {
        if let Some(tx) = tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }));
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("clock sync within five seconds")
        .unwrap();
    client
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_participants_and_late_joiner_converge() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_broker(&dir).await;

    let ta = synced_client(addr).await;
    let tb = synced_client(addr).await;
    let a = Engine::new("e2e", NamesSim, EngineConfig::default(), Arc::clone(&ta));
    let b = Engine::new("e2e", NamesSim, EngineConfig::default(), Arc::clone(&tb));

    a.post(serde_json::json!({ "n": 1 })).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    b.post(serde_json::json!({ "n": 2 })).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    a.post(serde_json::json!({ "n": 3 })).unwrap();

    // Let echoes and cross-deliveries settle.
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(a.post_count(), 3);
    assert_eq!(b.post_count(), 3);
    assert_eq!(a.initial_tick(), b.initial_tick());

    let tick = a.server_tick().unwrap();
    assert_eq!(a.state_at(tick), b.state_at(tick));
    assert_eq!(a.state_at(tick).applied.len(), 3);

    // A late joiner loads the backlog from index 0 and lands on the same
    // state.
    let tc = synced_client(addr).await;
    let c = Engine::new("e2e", NamesSim, EngineConfig::default(), Arc::clone(&tc));
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(c.post_count(), 3);
    assert_eq!(c.initial_tick(), a.initial_tick());
    let tick = a.server_tick().unwrap();
    assert_eq!(c.state_at(tick), a.state_at(tick));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_room_log_survives_broker_restart() {
    let dir = tempfile::tempdir().unwrap();

    let addr = start_broker(&dir).await;
    let ta = synced_client(addr).await;
    let a = Engine::new("e2e", NamesSim, EngineConfig::default(), Arc::clone(&ta));
    a.post(serde_json::json!({ "n": 1 })).unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(a.post_count(), 1);
    ta.disconnect();

    // A second broker over the same data dir serves the same log.
    let addr = start_broker(&dir).await;
    let tb = synced_client(addr).await;
    let b = Engine::new("e2e", NamesSim, EngineConfig::default(), Arc::clone(&tb));
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(b.post_count(), 1);
    let tick = b.server_tick().unwrap();
    assert_eq!(b.state_at(tick).applied.len(), 1);
}
