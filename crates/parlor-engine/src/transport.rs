//! The transport seam the engine consumes.
//!
//! Anything that can reach a broker — a TCP client, an in-memory simulator
//! — implements [`Transport`]. The engine only assumes that (i) every
//! successful `post` is eventually echoed back through the room's watch
//! handler with the same name, a broker-assigned index, and server time;
//! (ii) arrival order is unrelated to index order; (iii) duplicates may
//! occur. Dedup is the engine's job, not the transport's.

use crate::error::EngineError;
use crate::post::Post;

/// Live-post callback registered per room.
pub type PostHandler = Box<dyn FnMut(Post) + Send>;

/// One-shot callback fired after the first clock sync.
pub type SyncHandler = Box<dyn FnOnce() + Send>;

/// A connection to a broker, real or simulated.
pub trait Transport: Send + Sync {
    /// Invokes `cb` exactly once after the clock has synced; immediately
    /// if it already has.
    fn on_sync(&self, cb: SyncHandler);

    /// Subscribes to live posts for `room`. At most one handler per room;
    /// re-registration fails with [`EngineError::DuplicateHandler`].
    fn watch(&self, room: &str, handler: PostHandler) -> Result<(), EngineError>;

    /// Requests the room backlog from `from` onward. Entries arrive
    /// through the room's watch handler exactly as live posts do.
    fn load(&self, room: &str, from: u64) -> Result<(), EngineError>;

    /// Publishes a post and returns its freshly generated opaque name.
    /// The broker will stamp the echo with the same name.
    fn post(&self, room: &str, data: serde_json::Value) -> Result<String, EngineError>;

    /// Estimated broker time in ms.
    fn server_time(&self) -> Result<i64, EngineError>;

    /// Last probe round-trip in ms; `None` until one completes.
    fn ping(&self) -> Option<u64>;
}
