//! Engine-level error type.

use thiserror::Error;

use crate::dispatch::DispatchError;
use crate::framing::FrameError;

/// Errors that stop the engine, plus the two `send_request` refusals.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Failed to read from transport: {0}")]
    Read(#[source] std::io::Error),

    #[error("Failed to write to transport: {0}")]
    Write(#[source] std::io::Error),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Engine is closed")]
    Closed,

    #[error("Blocking request issued from inside the I/O runtime")]
    WouldDeadlock,
}
