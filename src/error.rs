//! Error types for aes67-mux.
//!
//! Errors are split into two layers:
//! - **Multiplexer errors** ([`MuxError`]): returned synchronously from setup
//!   operations (config load, channel acquisition, reload)
//! - **Pipeline errors** ([`PipelineError`]): typed failures of a single
//!   [`Pipeline`](crate::Pipeline) operation
//!
//! Runtime faults after a pipeline has started are not errors in this sense.
//! They travel over a bounded channel to the owning stream and surface as
//! [`MuxEvent::RuntimeFault`](crate::MuxEvent::RuntimeFault).

use std::fmt;

/// Errors returned by multiplexer setup and session operations.
///
/// `ClockNotReady` and `LockUnavailable` are transient. Session read/write
/// paths absorb them and play silence instead, so callers of
/// [`CallSession::read`](crate::CallSession::read) never see them.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// A stream or endpoint definition is malformed or inconsistent.
    #[error("invalid config for '{entry}': {reason}")]
    ConfigInvalid {
        /// Name of the rejected stream or endpoint.
        entry: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A channel is already held, or an endpoint is in use.
    #[error("{resource} busy: {reason}")]
    ResourceBusy {
        /// The contended resource (`stream:chan` or endpoint name).
        resource: String,
        /// Why the request was rejected.
        reason: String,
    },

    /// Building the stream's pipeline failed; the stream is unusable.
    #[error("pipeline construction failed for stream '{stream}': {source}")]
    PipelineConstructionFailed {
        /// Stream whose pipeline could not be built.
        stream: String,
        /// The underlying pipeline failure.
        #[source]
        source: PipelineError,
    },

    /// No stream with this name is registered.
    #[error("unknown stream: {name}")]
    UnknownStream {
        /// The stream name that wasn't found.
        name: String,
    },

    /// No endpoint with this name is registered.
    #[error("unknown endpoint: {name}")]
    UnknownEndpoint {
        /// The endpoint name that wasn't found.
        name: String,
    },

    /// The stream was torn down and can no longer carry sessions.
    #[error("stream '{name}' is torn down")]
    StreamUnavailable {
        /// Name of the torn down stream.
        name: String,
    },

    /// No session with this id is registered.
    #[error("unknown session {id}")]
    UnknownSession {
        /// The session id that wasn't found.
        id: u64,
    },

    /// A session with this id is already registered.
    #[error("session {id} already exists")]
    SessionExists {
        /// The duplicated session id.
        id: u64,
    },

    /// The session was hung up after a runtime fault on one of its streams.
    #[error("session {id} was hung up: {reason}")]
    SessionHungUp {
        /// The affected session id.
        id: u64,
        /// The fault that caused the hangup.
        reason: String,
    },

    /// The stream's clock has not synchronized yet.
    #[error("clock not ready for stream '{stream}'")]
    ClockNotReady {
        /// The stream waiting for clock sync.
        stream: String,
    },

    /// The stream lock could not be taken because a reload is in progress.
    #[error("stream '{stream}' is reloading")]
    LockUnavailable {
        /// The reloading stream.
        stream: String,
    },
}

impl MuxError {
    /// Creates a `ConfigInvalid` error for the named entry.
    pub fn config_invalid(entry: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            entry: entry.into(),
            reason: reason.into(),
        }
    }

    /// Creates a `ResourceBusy` error for the named resource.
    pub fn busy(resource: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::ResourceBusy {
            resource: resource.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns true for errors that callers should treat as "play silence".
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ClockNotReady { .. } | Self::LockUnavailable { .. }
        )
    }
}

/// Typed failures of a single pipeline operation.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The channel index is outside the pipeline's channel count.
    #[error("channel {channel} not found (pipeline has {channels} channels)")]
    ChannelNotFound {
        /// The requested channel index.
        channel: usize,
        /// Number of channels the pipeline carries.
        channels: usize,
    },

    /// Two stages could not be linked.
    #[error("link failed: {reason}")]
    LinkFailed {
        /// Description of the failed link.
        reason: String,
    },

    /// A stage or buffer could not be allocated.
    #[error("allocation failed: {reason}")]
    AllocationFailed {
        /// Description of what could not be allocated.
        reason: String,
    },

    /// A branch for this channel and session already exists.
    #[error("branch for channel {channel} session {session} already attached")]
    BranchExists {
        /// Channel of the existing branch.
        channel: usize,
        /// Session owning the existing branch.
        session: u64,
    },

    /// No branch exists for this channel and session.
    #[error("no branch for channel {channel} session {session}")]
    BranchNotFound {
        /// Requested channel.
        channel: usize,
        /// Requested session.
        session: u64,
    },

    /// The operation requires a direction the pipeline was not built with.
    #[error("pipeline has no {direction} path")]
    NoPath {
        /// `"receive"` or `"transmit"`.
        direction: &'static str,
    },

    /// Opening or using a network socket failed.
    #[error("transport error on {address}: {source}")]
    Transport {
        /// Address the socket was bound or sending to.
        address: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The worker thread could not be started.
    #[error("worker start failed: {reason}")]
    WorkerStart {
        /// Why the worker did not start.
        reason: String,
    },
}

impl PipelineError {
    /// Creates a link failure with the given reason.
    pub fn link_failed(reason: impl Into<String>) -> Self {
        Self::LinkFailed {
            reason: reason.into(),
        }
    }

    /// Creates an allocation failure with the given reason.
    pub fn allocation_failed(reason: impl Into<String>) -> Self {
        Self::AllocationFailed {
            reason: reason.into(),
        }
    }

    /// Creates a transport error for the given address.
    pub fn transport(address: impl fmt::Display, source: std::io::Error) -> Self {
        Self::Transport {
            address: address.to_string(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_invalid_display() {
        let err = MuxError::config_invalid("s1", "no rx or tx address");
        assert_eq!(err.to_string(), "invalid config for 's1': no rx or tx address");
    }

    #[test]
    fn test_busy_display() {
        let err = MuxError::busy("s1:0", "input channel already in use");
        assert_eq!(err.to_string(), "s1:0 busy: input channel already in use");
    }

    #[test]
    fn test_transient_errors() {
        assert!(MuxError::ClockNotReady {
            stream: "s1".into()
        }
        .is_transient());
        assert!(MuxError::LockUnavailable {
            stream: "s1".into()
        }
        .is_transient());
        assert!(!MuxError::UnknownStream { name: "x".into() }.is_transient());
    }

    #[test]
    fn test_construction_failure_keeps_source() {
        let err = MuxError::PipelineConstructionFailed {
            stream: "s1".into(),
            source: PipelineError::link_failed("fan-out closed"),
        };
        assert!(err.to_string().contains("fan-out closed"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_transport_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let err = PipelineError::transport("239.69.0.1:5004", io_err);
        assert!(err.to_string().contains("239.69.0.1:5004"));
    }
}
