//! Wire protocol shared by the host and the worker process.
//!
//! Messages are JSON objects, one per line. The host writes `Run`,
//! `Kill` and `Response` frames; the worker writes `Ready`, `Return`,
//! `Request` and script-level notifications.

pub mod codec;
pub mod message;

pub use codec::{write_message, FrameReader, MAX_FRAME_LEN};
pub use message::Message;

/// Errors raised while framing or decoding protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` has an unexpected type")]
    InvalidField { field: &'static str },
    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },
    #[error("stream ended in the middle of a frame")]
    TruncatedFrame,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
