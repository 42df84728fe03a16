use thiserror::Error;

/// Errors surfaced to the `send` caller. Everything else the node contains:
/// invalid casts, parse failures, and transport trouble are logged or
/// reported as events, never returned here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("channel name contains reserved ':'")]
    InvalidChannel,
    #[error("payload is not valid utf-8")]
    InvalidPayload,
    #[error("request timed out before externalization")]
    RequestTimeout,
    #[error("engine: {0}")]
    Engine(String),
}
