//! Runtime events for monitoring streams and sessions.
//!
//! Events are non-fatal notifications. The multiplexer keeps running after
//! any event is emitted; they exist for logging, metrics and for the call
//! core to react to hangups.

use std::sync::Arc;

use crate::clock::ClockStats;
use crate::session::SessionId;
use crate::stream::StreamId;

/// Runtime events emitted by the multiplexer.
///
/// # Example
///
/// ```
/// use aes67_mux::MuxEvent;
///
/// fn handle_event(event: MuxEvent) {
///     match event {
///         MuxEvent::RuntimeFault { stream, reason } => {
///             eprintln!("stream {stream} failed: {reason}");
///         }
///         MuxEvent::SessionHungUp { session, reason } => {
///             eprintln!("session {session} hung up: {reason}");
///         }
///         other => eprintln!("{other:?}"),
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub enum MuxEvent {
    /// A running pipeline reported an error.
    ///
    /// Every session using the stream is hung up; the stream itself stays
    /// registered and is rebuilt on the next reload or acquisition.
    RuntimeFault {
        /// Stream whose pipeline failed.
        stream: StreamId,
        /// Description of the fault.
        reason: String,
    },

    /// A session was hung up by the multiplexer.
    SessionHungUp {
        /// The affected session.
        session: SessionId,
        /// Why it was hung up.
        reason: String,
    },

    /// A stream's clock synchronized for the first time.
    ClockSynced {
        /// Stream whose clock is now usable.
        stream: StreamId,
    },

    /// Periodic clock quality report, emitted while clock stats are enabled.
    ClockStats {
        /// Reporting stream.
        stream: StreamId,
        /// Current clock state.
        stats: ClockStats,
    },

    /// The backup sender monitor muted this instance's transmitter.
    TxMuted {
        /// Stream whose transmitter was muted.
        stream: StreamId,
        /// Address of the active primary sender, when known.
        source: Option<std::net::SocketAddr>,
    },

    /// The backup sender monitor unmuted this instance's transmitter.
    TxUnmuted {
        /// Stream whose transmitter was unmuted.
        stream: StreamId,
    },

    /// A stream's pipeline was rebuilt with a new configuration.
    StreamReloaded {
        /// The reloaded stream.
        stream: StreamId,
    },

    /// A stream was removed from the registry.
    StreamRemoved {
        /// The removed stream.
        stream: StreamId,
    },

    /// One second of audio levels for a session.
    AudioLevel {
        /// Session the levels belong to.
        session: SessionId,
        /// Received level in dBFS, floored at -90.
        rx_db: f64,
        /// Transmitted level in dBFS, floored at -90.
        tx_db: f64,
    },
}

/// Callback type for receiving runtime events.
///
/// The callback runs on the thread that detected the event (a session
/// thread or the supervisor), never on a pipeline worker.
pub type EventCallback = Arc<dyn Fn(MuxEvent) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure.
///
/// # Example
///
/// ```
/// use aes67_mux::{event_callback, MuxEvent};
///
/// let callback = event_callback(|event| {
///     println!("Got event: {:?}", event);
/// });
/// ```
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(MuxEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mux_event_debug() {
        let event = MuxEvent::RuntimeFault {
            stream: StreamId::new("s1"),
            reason: "socket closed".into(),
        };
        let debug = format!("{:?}", event);
        assert!(debug.contains("RuntimeFault"));
        assert!(debug.contains("socket closed"));
    }

    #[test]
    fn test_event_callback_helper() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();

        let callback = event_callback(move |_| {
            called_clone.store(true, Ordering::SeqCst);
        });

        callback(MuxEvent::StreamReloaded {
            stream: StreamId::new("s1"),
        });
        assert!(called.load(Ordering::SeqCst));
    }
}
