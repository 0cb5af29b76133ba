//! Error types shared by the stream, channel and device layers.

use crate::capture::StreamId;

/// Convenience result type using [`Error`] as the error variant.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors surfaced by the synchronization core.
///
/// Every failing FSM dispatch maps to one of these. Stream and channel state
/// is left untouched on an error path; the device may fall back to a safe state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The event is not legal in the current state of a stream, channel or device.
    #[error("invalid operation {event} in state {state}")]
    InvalidOperation {
        state: &'static str,
        event: &'static str,
    },

    /// The stream handle is not known to the channel.
    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    /// The bundle already holds the maximum number of streams.
    #[error("bundle is full, no more streams allowed")]
    StreamLimit,

    /// One stream in a bundle failed to start; the whole start was rolled back.
    #[error("stream {stream} failed to start: {reason}")]
    StreamStartFailed { stream: StreamId, reason: String },

    /// The hardware collaborator rejected an operation.
    #[error("hardware error: {0}")]
    Hardware(String),

    /// A command could not be handed to a worker because it already exited.
    #[error("command worker {0} is not running")]
    WorkerStopped(&'static str),

    /// The underlying hardware daemon is gone; only a fresh device can recover.
    #[error("fatal: {0}")]
    Fatal(String),

    /// A synchronous API call did not get a reply in time.
    #[error("timed out waiting for a reply")]
    Timeout,

    /// Configuration could not be loaded or parsed.
    #[error("configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn invalid(state: &'static str, event: &'static str) -> Self {
        Error::InvalidOperation { state, event }
    }

    /// True for errors that leave the device unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}
