//! Engine error types.

/// Errors surfaced by the engine and its transports.
///
/// Conditions the engine absorbs silently (duplicate remote posts, posts
/// older than the snapshot window, unknown wire kinds) are not represented
/// here; they are logged and dropped so the engine stays valid.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The clock has not completed its first time sync.
    #[error("clock has not completed its first time sync")]
    NotSynced,

    /// The transport is not connected to a broker.
    #[error("transport is not open")]
    NotOpen,

    /// The room already has a live watch handler.
    #[error("room {0:?} already has a watch handler")]
    DuplicateHandler(String),
}
