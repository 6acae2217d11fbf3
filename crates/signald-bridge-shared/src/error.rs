use thiserror::Error;

#[derive(Error, Debug)]
pub enum GroupIdError {
    #[error("not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("decoded id is not valid UTF-8")]
    NotUtf8,
}

/// An inbound line that could not be turned into a frame.
///
/// `request_id` is set when the line was a JSON object with a string `id`,
/// so the waiter for that id can still be told.
#[derive(Error, Debug, Clone)]
#[error("{reason}")]
pub struct ProtocolError {
    pub request_id: Option<String>,
    pub reason: String,
}

impl ProtocolError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            request_id: None,
            reason: reason.into(),
        }
    }
}
