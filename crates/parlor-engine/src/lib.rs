//! Deterministic tick-based replicated state engine for shared rooms.
//!
//! A room is an authoritative, append-only log of posts held by a broker.
//! Every participant replays that log with the same pure `on_tick`/`on_post`
//! functions and therefore reconstructs identical state at any tick. Local
//! posts are applied optimistically and reconciled away when the broker
//! echoes them back with an authoritative index. Rendering blends a lagged
//! authoritative past with the predicted present.

pub mod clock;
pub mod engine;
pub mod error;
pub mod post;
pub mod sim;
pub mod snapshot;
pub mod timeline;
pub mod transport;

pub use clock::Clock;
pub use engine::{Engine, EngineConfig, Simulation};
pub use error::EngineError;
pub use post::{official_tick, official_time, time_to_tick, Post, LOCAL_INDEX};
pub use snapshot::SnapshotCache;
pub use timeline::{RemoteOutcome, TickBucket, Timeline};
pub use transport::{PostHandler, SyncHandler, Transport};
