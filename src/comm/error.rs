use thiserror::Error;

use crate::comm::transport::RequestId;
use crate::comm::Tag;

/// Errors surfaced by the messaging layer.
///
/// Transport failures are *not* generally propagated: the transport may still be usable
///  for subsequent operations, so the messenger logs them at the call site that observes
///  them and carries on. The `Transport` variant exists for transport implementations to
///  report failures upward to that boundary.
#[derive(Debug, Error)]
pub enum CommError {
    /// send or receive on a tag that was never registered
    #[error("tag {0} is not registered")]
    UnregisteredTag(Tag),

    /// a completion references a request that does not match a posted receive
    #[error("completion for request {0:?} does not match a posted receive")]
    UnknownRequest(RequestId),

    #[error("transport: {0}")]
    Transport(String),

    /// packet or payload bytes ended before the announced content
    #[error("truncated read: needed {needed} bytes, {available} available")]
    TruncatedRead { needed: usize, available: usize },
}

impl From<bytes::TryGetError> for CommError {
    fn from(e: bytes::TryGetError) -> Self {
        CommError::TruncatedRead {
            needed: e.requested,
            available: e.available,
        }
    }
}

pub type Result<T> = std::result::Result<T, CommError>;
