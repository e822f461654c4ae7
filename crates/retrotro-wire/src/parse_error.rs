/// An error encountered while parsing a client-facing message.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The frame was not valid UTF-8.
    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),
    /// The frame was not a valid `{type, payload}` JSON object.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// The `type` field did not name a known inbound message.
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    /// The `payload` field didn't match the shape expected for `type`.
    #[error("invalid payload for {0:?}: {1}")]
    InvalidPayload(String, serde_json::Error),
}
