//! Cache error types.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// `subscribe` called twice on the same stream.
    #[error("Stream already subscribed on channel: {channel}")]
    AlreadySubscribed { channel: String },
}
