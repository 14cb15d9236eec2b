//! Hot reconfiguration of a shared stream.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::shared::{ReloadGate, SharedStream, StreamState};
use crate::config::StreamConfig;
use crate::event::MuxEvent;
use crate::MuxError;

/// What a reload did to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The configuration was identical; nothing was touched.
    Unchanged,
    /// Only runtime settings changed; the pipeline was kept.
    Updated,
    /// The pipeline was torn down and rebuilt.
    Rebuilt,
}

/// True if the two configurations need the same pipeline.
fn same_pipeline(old: &StreamConfig, new: &StreamConfig) -> bool {
    let runtime_only = |c: &StreamConfig| StreamConfig {
        tx_flow: true,
        multi_listen: false,
        ..c.clone()
    };
    runtime_only(old) == runtime_only(new)
}

impl SharedStream {
    /// Applies a new configuration to a live stream.
    ///
    /// A rebuild raises the reloading flag, takes the writer lock, destroys
    /// the current pipeline and builds the new one (if the stream had one),
    /// then re-attaches every branch recorded on the stream, reopens valves
    /// for held inputs and re-applies the transmit gate. A branch that can
    /// no longer be attached is forgotten and its session reads the
    /// channel's default sink. Sessions play silence meanwhile; they never
    /// block.
    ///
    /// On a construction failure the stream is left without a pipeline and
    /// the error is returned; the next acquisition tries again.
    pub fn reload(self: &Arc<Self>, config: StreamConfig) -> Result<ReloadOutcome, MuxError> {
        let old = self.config();
        if old == config {
            return Ok(ReloadOutcome::Unchanged);
        }

        if same_pipeline(&old, &config) {
            let tx_flow_changed = old.tx_flow != config.tx_flow;
            *self.config.write() = config.clone();
            if tx_flow_changed && config.tx.is_some() {
                self.set_tx_flow(config.tx_flow)?;
            }
            tracing::info!(stream = %self.id, "stream settings updated");
            return Ok(ReloadOutcome::Updated);
        }

        self.stop_backup();
        let result = self.rebuild(config);
        self.start_backup();

        if result.is_ok() {
            self.emit(MuxEvent::StreamReloaded {
                stream: self.id.clone(),
            });
        }
        result
    }

    fn rebuild(&self, config: StreamConfig) -> Result<ReloadOutcome, MuxError> {
        let gate = ReloadGate::raise(&self.reloading);
        let mut slot = self.inner.write();
        if slot.state == StreamState::TornDown {
            return Err(MuxError::StreamUnavailable {
                name: self.id.to_string(),
            });
        }

        let was_live = slot.pipeline.is_some() || !self.is_idle();
        if let Some(pipeline) = slot.pipeline.take() {
            pipeline.destroy();
        }
        slot.state = StreamState::Unconfigured;
        // Faults of the old worker no longer concern anyone
        let stale = self.drain_notices().len();
        if stale > 0 {
            tracing::debug!(stream = %self.id, stale, "dropped notices of replaced pipeline");
        }

        *self.clock.write() = self.clock_for(&config);
        self.tx_flow.store(config.tx_flow, Ordering::Release);
        *self.config.write() = config.clone();

        if was_live {
            let pipeline = match self.build_pipeline(&config) {
                Ok(pipeline) => pipeline,
                Err(e) => {
                    self.branches.lock().clear();
                    return Err(e);
                }
            };
            // Attaches made before the writer lock are all recorded by now
            self.branches.lock().retain(|&(channel, session)| {
                match pipeline.attach_branch(channel, session) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(
                            stream = %self.id,
                            channel,
                            %session,
                            error = %e,
                            "branch not restored after reload"
                        );
                        false
                    }
                }
            });
            self.install(&mut slot, pipeline);
        } else {
            self.branches.lock().clear();
        }

        drop(gate);
        drop(slot);
        tracing::info!(stream = %self.id, was_live, "stream reloaded");
        Ok(ReloadOutcome::Rebuilt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch;
    use crate::clock::SystemClock;
    use crate::session::SessionId;
    use crate::config::MediaAddress;
    use crate::pipeline::{MemoryNetwork, RtpPipelineFactory};
    use crate::stream::Direction;
    use std::net::Ipv4Addr;

    fn config(channels: usize) -> StreamConfig {
        StreamConfig {
            name: "s1".into(),
            rx: Some(MediaAddress::new(Ipv4Addr::new(239, 69, 3, 1), 5004)),
            tx: Some(MediaAddress::new(Ipv4Addr::new(239, 69, 3, 2), 5004)),
            sample_rate: 48000,
            channels,
            multi_listen: true,
            ..Default::default()
        }
    }

    fn stream(channels: usize) -> Arc<SharedStream> {
        SharedStream::new(
            config(channels),
            Arc::new(RtpPipelineFactory::new(Arc::new(MemoryNetwork::new()))),
            Arc::new(SystemClock::new()),
            None,
        )
    }

    #[test]
    fn test_identical_config_is_unchanged() {
        let stream = stream(2);
        assert_eq!(stream.reload(config(2)).unwrap(), ReloadOutcome::Unchanged);
    }

    #[test]
    fn test_runtime_settings_keep_pipeline() {
        let stream = stream(2);
        stream.acquire_channel(0, Direction::Output).unwrap();
        let mut next = config(2);
        next.tx_flow = false;
        assert_eq!(stream.reload(next).unwrap(), ReloadOutcome::Updated);
        assert!(stream.stats().unwrap().tx_dropping);
        assert!(!stream.tx_flow());
    }

    #[test]
    fn test_rebuild_restores_branches_and_valves() {
        let stream = stream(2);
        let session = SessionId::new(11);
        stream.acquire_channel(1, Direction::Input).unwrap();
        assert!(branch::attach(&stream.read(), 1, session));

        let mut next = config(2);
        next.jitter_latency_ms = 40;
        assert_eq!(stream.reload(next).unwrap(), ReloadOutcome::Rebuilt);

        let guard = stream.read();
        let pipeline = guard.pipeline().unwrap();
        assert_eq!(pipeline.spec().jitter_latency_ms, 40);
        assert_eq!(pipeline.stats().branches, 1);
        assert!(!pipeline.stats().channels[1].dropping);
        assert!(pipeline.stats().channels[0].dropping);

        assert!(guard.has_branch(1, session));

        // Re-attaching the restored branch fails without duplicating it
        assert!(pipeline.attach_branch(1, session).is_err());
        assert_eq!(pipeline.stats().branches, 1);
    }

    #[test]
    fn test_branch_attached_before_writer_lock_is_restored() {
        let stream = stream(2);
        let early = SessionId::new(1);
        let late = SessionId::new(2);
        stream.acquire_channel(0, Direction::Input).unwrap();
        assert!(branch::attach(&stream.read(), 0, early));

        // A session activating right before the rebuild takes the lock
        stream.acquire_channel(0, Direction::Input).unwrap();
        assert!(branch::attach(&stream.read(), 0, late));

        let mut next = config(2);
        next.frame_ms = 10;
        stream.reload(next).unwrap();

        let guard = stream.read();
        assert_eq!(guard.pipeline().unwrap().stats().branches, 2);
        assert!(guard.has_branch(0, early));
        assert!(guard.has_branch(0, late));
    }

    #[test]
    fn test_unrestorable_branch_is_forgotten() {
        let stream = stream(2);
        let session = SessionId::new(5);
        stream.acquire_channel(1, Direction::Input).unwrap();
        assert!(branch::attach(&stream.read(), 1, session));

        stream.reload(config(1)).unwrap();

        let guard = stream.read();
        assert!(!guard.has_branch(1, session));
        assert_eq!(guard.pipeline().unwrap().stats().branches, 0);
    }

    #[test]
    fn test_idle_stream_rebuild_stays_lazy() {
        let stream = stream(2);
        let mut next = config(2);
        next.sample_rate = 44100;
        assert_eq!(stream.reload(next).unwrap(), ReloadOutcome::Rebuilt);
        assert!(stream.stats().is_none());
        assert_eq!(stream.sample_rate(), 44100);
    }

    #[test]
    fn test_shrunk_stream_keeps_output_bit() {
        let stream = stream(2);
        stream.acquire_channel(1, Direction::Output).unwrap();
        stream.reload(config(1)).unwrap();

        assert_eq!(stream.outputs_in_use(), vec![1]);
        let guard = stream.read();
        let pipeline = guard.pipeline().unwrap();
        assert!(pipeline.push(1, &[0; 1920]).is_err());
    }

    #[test]
    fn test_readers_fail_fast_during_rebuild() {
        let stream = stream(2);
        stream.acquire_channel(0, Direction::Input).unwrap();

        let gate = ReloadGate::raise(&stream.reloading);
        assert!(stream.try_read().is_none());
        drop(gate);

        let mut next = config(2);
        next.frame_ms = 10;
        stream.reload(next).unwrap();
        let guard = stream.try_read().unwrap();
        assert_eq!(guard.pipeline().unwrap().spec().frame_ms, 10);
    }
}
