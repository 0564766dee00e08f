//! Interactive arena host: join a room on a broker and drive it from stdin.
//!
//! Commands:
//!   /move <dx> <dy>          steer the local pawn
//!   /post <room> <json>      publish a raw payload
//!   /load <room> <from>      request a backlog
//!   /watch <room>            print a room's posts as they arrive
//!   /unwatch <room>          stop printing a room's posts
//!   /state                   print the rendered arena
//!   /quit                    leave and exit
//!
//! Run with: `cargo run -p parlor-demo -- --player alice --room arena`

mod game;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use parlor_config::{CliArgs, Config};
use parlor_engine::{Engine, EngineConfig, Transport};
use parlor_net::BrokerClient;

use game::{ArenaEvent, ArenaSim, ArenaState};

/// CLI arguments for the demo binary.
#[derive(Parser, Debug)]
#[command(name = "parlor-demo", about = "Shared-arena demo for parlor rooms")]
struct DemoArgs {
    /// Room to join.
    #[arg(long, default_value = "arena")]
    room: String,

    /// Local player name.
    #[arg(long, default_value = "player1")]
    player: String,

    /// Broker address.
    #[arg(long)]
    broker: Option<String>,

    /// Broker port.
    #[arg(long)]
    port: Option<u16>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    log_level: Option<String>,

    /// Path to the config directory.
    #[arg(long, default_value = "./config")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = DemoArgs::parse();

    let mut config = Config::load_or_create(&args.config).unwrap_or_else(|err| {
        eprintln!("config error: {err}");
        std::process::exit(1);
    });
    config.apply_cli_overrides(&CliArgs {
        broker: args.broker.clone(),
        port: args.port,
        log_level: args.log_level.clone(),
        ..CliArgs::default()
    });
    parlor_log::init_logging(None, Some(&config.debug.log_level));

    let host = format!(
        "{}:{}",
        config.network.broker_address, config.network.broker_port
    );
    let addr = match tokio::net::lookup_host(&host).await.ok().and_then(|mut a| a.next()) {
        Some(addr) => addr,
        None => {
            eprintln!("cannot resolve broker address {host}");
            std::process::exit(1);
        }
    };

    let client = match BrokerClient::connect(addr).await {
        Ok(client) => Arc::new(client),
        Err(err) => {
            eprintln!("cannot connect to broker at {addr}: {err}");
            std::process::exit(1);
        }
    };
    info!("connected to broker at {addr}");

    let engine_config = EngineConfig {
        tick_rate: config.engine.tick_rate,
        tolerance_ms: config.engine.tolerance_ms,
        cache_enabled: config.engine.cache_enabled,
        snapshot_stride: config.engine.snapshot_stride,
        snapshot_count: config.engine.snapshot_count,
    };
    let sim = ArenaSim {
        player: args.player.clone(),
    };
    let engine = Engine::new(args.room.clone(), sim, engine_config, Arc::clone(&client));

    // Wait for clock sync, then announce ourselves.
    let (sync_tx, sync_rx) = tokio::sync::oneshot::channel();
    let sync_tx = std::sync::Mutex::new(Some(sync_tx));
    client.on_sync(Box::new(move || {
        if let Some(tx) = sync_tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(());
        }
    }));
    if sync_rx.await.is_err() {
        eprintln!("broker connection lost before time sync");
        std::process::exit(1);
    }
    info!("clock synced, ping {:?} ms", client.ping());

    let join = serde_json::to_value(ArenaEvent::Join {
        player: args.player.clone(),
    })
    .expect("static event encodes");
    if let Err(err) = engine.post(join) {
        warn!(%err, "join post failed");
    }

    run_repl(&args, &engine, &client).await;

    let leave = serde_json::to_value(ArenaEvent::Leave {
        player: args.player.clone(),
    })
    .expect("static event encodes");
    let _ = engine.post(leave);
    client.disconnect();
}

async fn run_repl(
    args: &DemoArgs,
    engine: &Engine<ArenaSim, BrokerClient>,
    client: &Arc<BrokerClient>,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut render_timer = tokio::time::interval(std::time::Duration::from_secs(2));

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                if !handle_command(args, engine, client, line.trim()) {
                    break;
                }
            }
            _ = render_timer.tick() => {
                if engine.initial_tick().is_some() {
                    print_arena(&engine.render_state());
                }
            }
        }
    }
}

/// Returns `false` when the user asked to quit.
fn handle_command(
    args: &DemoArgs,
    engine: &Engine<ArenaSim, BrokerClient>,
    client: &Arc<BrokerClient>,
    line: &str,
) -> bool {
    let mut parts = line.splitn(3, ' ');
    let command = parts.next().unwrap_or_default();
    match command {
        "" => {}
        "/quit" => return false,
        "/state" => print_arena(&engine.render_state()),
        "/move" => {
            let dx = parts.next().and_then(|s| s.parse().ok());
            let dy = parts.next().and_then(|s| s.parse().ok());
            let (Some(dx), Some(dy)) = (dx, dy) else {
                println!("usage: /move <dx> <dy>");
                return true;
            };
            let event = ArenaEvent::Steer {
                player: args.player.clone(),
                dx,
                dy,
            };
            match engine.post(serde_json::to_value(event).expect("static event encodes")) {
                Ok(name) => info!("steer posted as {name}"),
                Err(err) => warn!(%err, "steer failed"),
            }
        }
        "/post" => {
            let (Some(room), Some(raw)) = (parts.next(), parts.next()) else {
                println!("usage: /post <room> <json>");
                return true;
            };
            match serde_json::from_str(raw) {
                Ok(data) => match client.post(room, data) {
                    Ok(name) => info!("posted to {room} as {name}"),
                    Err(err) => warn!(%err, "post failed"),
                },
                Err(err) => println!("bad json: {err}"),
            }
        }
        "/load" => {
            let (Some(room), Some(from)) = (parts.next(), parts.next()) else {
                println!("usage: /load <room> <from>");
                return true;
            };
            let Ok(from) = from.parse() else {
                println!("usage: /load <room> <from>");
                return true;
            };
            if let Err(err) = client.load(room, from) {
                warn!(%err, "load failed");
            }
        }
        "/watch" => {
            let Some(room) = parts.next() else {
                println!("usage: /watch <room>");
                return true;
            };
            let result = client.watch(
                room,
                Box::new(|post| {
                    println!(
                        "[{}] #{} {} {}",
                        post.room, post.index, post.name, post.data
                    );
                }),
            );
            if let Err(err) = result {
                warn!(%err, "watch failed");
            }
        }
        "/unwatch" => {
            let Some(room) = parts.next() else {
                println!("usage: /unwatch <room>");
                return true;
            };
            if let Err(err) = client.unwatch(room) {
                warn!(%err, "unwatch failed");
            }
        }
        other => println!("unknown command {other:?}"),
    }
    true
}

fn print_arena(state: &ArenaState) {
    if state.pawns.is_empty() {
        println!("(empty arena)");
        return;
    }
    for (player, pawn) in &state.pawns {
        println!(
            "{player:>12}  pos ({:>7.2}, {:>7.2})  vel ({:>6.2}, {:>6.2})",
            pawn.x as f64 / 1000.0,
            pawn.y as f64 / 1000.0,
            pawn.vx as f64 / 1000.0,
            pawn.vy as f64 / 1000.0,
        );
    }
}
