//! Session branches on a shared receive graph.
//!
//! Both operations take the stream's read guard, so a branch can only be
//! changed while the pipeline it belongs to is pinned. The graph work
//! itself (locate the fan-out, link queue and sink, register, roll back on
//! failure) happens inside the pipeline. The stream records every attached
//! branch so a rebuild can restore them under its writer lock.

use crate::session::SessionId;
use crate::stream::StreamReadGuard;

/// Attaches a receive branch for `session` on `channel`.
///
/// Returns false, without side effects, if the stream has no pipeline or
/// the branch already exists.
pub fn attach(guard: &StreamReadGuard<'_>, channel: usize, session: SessionId) -> bool {
    let stream = guard.stream().id();
    let Some(pipeline) = guard.pipeline() else {
        tracing::debug!(stream = %stream, channel, %session, "no pipeline to attach to");
        return false;
    };
    match pipeline.attach_branch(channel, session) {
        Ok(()) => {
            guard.track_branch(channel, session);
            tracing::debug!(stream = %stream, channel, %session, "branch attached");
            true
        }
        Err(e) => {
            tracing::warn!(stream = %stream, channel, %session, error = %e, "branch attach failed");
            false
        }
    }
}

/// Detaches the receive branch of `session` on `channel`.
///
/// Returns false if there was nothing to detach.
pub fn detach(guard: &StreamReadGuard<'_>, channel: usize, session: SessionId) -> bool {
    guard.untrack_branch(channel, session);
    let stream = guard.stream().id();
    let Some(pipeline) = guard.pipeline() else {
        return false;
    };
    match pipeline.detach_branch(channel, session) {
        Ok(()) => {
            tracing::debug!(stream = %stream, channel, %session, "branch detached");
            true
        }
        Err(e) => {
            tracing::debug!(stream = %stream, channel, %session, error = %e, "branch detach skipped");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::{MediaAddress, StreamConfig};
    use crate::pipeline::{MemoryNetwork, RtpPipelineFactory};
    use crate::stream::{Direction, SharedStream};
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn stream() -> Arc<SharedStream> {
        let config = StreamConfig {
            name: "s1".into(),
            rx: Some(MediaAddress::new(Ipv4Addr::new(239, 69, 5, 1), 5004)),
            channels: 2,
            multi_listen: true,
            ..Default::default()
        };
        SharedStream::new(
            config,
            Arc::new(RtpPipelineFactory::new(Arc::new(MemoryNetwork::new()))),
            Arc::new(SystemClock::new()),
            None,
        )
    }

    #[test]
    fn test_attach_needs_pipeline() {
        let stream = stream();
        let guard = stream.read();
        assert!(!attach(&guard, 0, SessionId::new(1)));
    }

    #[test]
    fn test_attach_is_unique_per_key() {
        let stream = stream();
        stream.acquire_channel(0, Direction::Input).unwrap();
        let guard = stream.read();

        assert!(attach(&guard, 0, SessionId::new(1)));
        assert!(!attach(&guard, 0, SessionId::new(1)));
        assert!(attach(&guard, 0, SessionId::new(2)));
        assert!(attach(&guard, 1, SessionId::new(1)));
        assert_eq!(guard.pipeline().unwrap().stats().branches, 3);
        assert!(guard.has_branch(0, SessionId::new(2)));
        assert!(!guard.has_branch(1, SessionId::new(2)));
    }

    #[test]
    fn test_detach_reverses_attach() {
        let stream = stream();
        stream.acquire_channel(1, Direction::Input).unwrap();
        let guard = stream.read();

        assert!(!detach(&guard, 1, SessionId::new(3)));
        assert!(attach(&guard, 1, SessionId::new(3)));
        assert!(guard.has_branch(1, SessionId::new(3)));
        assert!(detach(&guard, 1, SessionId::new(3)));
        assert!(!guard.has_branch(1, SessionId::new(3)));
        assert!(!detach(&guard, 1, SessionId::new(3)));
        assert_eq!(guard.pipeline().unwrap().stats().branches, 0);
        // The key is free again
        assert!(attach(&guard, 1, SessionId::new(3)));
    }
}
