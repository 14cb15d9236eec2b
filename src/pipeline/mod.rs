//! Pipeline handles: the audio graph behind a shared stream.
//!
//! A pipeline carries one stream's audio between the network and the
//! sessions. The multiplexer only talks to it through the [`Pipeline`]
//! trait; [`RtpPipeline`] is the RTP/UDP implementation:
//!
//! ```text
//! receive:  socket → depayload → valve[ch] → fan-out[ch] → queue + sink (per branch)
//! transmit: push[ch] → ring buffer[ch] → interleave → tx valve → payload → socket
//! ```
//!
//! - **Worker thread**: owns the sockets and runs the receive, transmit and
//!   clock loops on a current-thread tokio runtime
//! - **Stage registry**: typed [`StageKey`]s locate valves, fan-outs and
//!   sinks without string parsing
//! - **Channel buffer**: adapts network unit sizes to the caller's frame size
//! - **Notices**: runtime faults go to the owning stream over a bounded
//!   channel; the worker never blocks on it

mod buffer;
mod graph;
mod network;
mod queue;
mod rtp;
mod rtp_pipeline;
mod worker;

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::sync::mpsc;

pub use buffer::ChannelBuffer;
pub use graph::{StageKey, StageKind};
pub use network::{MemoryNetwork, Network, RxSocket, TxSocket, UdpNetwork};
pub use queue::BranchQueue;
pub use rtp::{RtpHeader, RtpStats};
pub use rtp_pipeline::{RtpPipeline, RtpPipelineFactory};

use crate::clock::{ClockSource, ClockStats};
use crate::config::{Codec, MediaAddress, StreamConfig, MAX_FRAME_MS};
use crate::session::SessionId;
use crate::stream::StreamId;
use crate::PipelineError;

/// How long a single pull attempt waits for the next unit.
pub const PULL_WAIT: Duration = Duration::from_millis(10);

/// Capacity of the notice channel between a worker and its stream.
pub const NOTICE_CAPACITY: usize = 16;

/// Default upper bound on session branches per pipeline.
pub const MAX_BRANCHES: usize = 256;

/// Everything needed to build a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSpec {
    /// Owning stream.
    pub stream: StreamId,
    /// Receive address, if the pipeline receives.
    pub rx: Option<MediaAddress>,
    /// Transmit address, if the pipeline transmits.
    pub tx: Option<MediaAddress>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Frame duration in milliseconds.
    pub frame_ms: u32,
    /// Channel count.
    pub channels: usize,
    /// Wire codec.
    pub codec: Codec,
    /// RTP payload type.
    pub payload_type: u8,
    /// Extra RTP timestamp offset in milliseconds.
    pub rtp_ts_offset_ms: u32,
    /// Interface for multicast membership and transmission.
    pub interface: Option<Ipv4Addr>,
    /// Receive latency budget in milliseconds.
    pub jitter_latency_ms: u32,
    /// Whether our own transmissions loop back to local receivers.
    pub multicast_loop: bool,
    /// Upper bound on concurrently attached session branches.
    pub max_branches: usize,
}

impl PipelineSpec {
    /// Describes the main pipeline of a stream.
    #[must_use]
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            stream: StreamId::new(config.name.as_str()),
            rx: config.rx,
            tx: config.tx,
            sample_rate: config.sample_rate,
            frame_ms: config.frame_ms,
            channels: config.channels,
            codec: config.codec,
            payload_type: config.payload_type,
            rtp_ts_offset_ms: config.rtp_ts_offset_ms,
            interface: config.interface,
            jitter_latency_ms: config.jitter_latency_ms,
            multicast_loop: !config.backup_sender,
            max_branches: MAX_BRANCHES,
        }
    }

    /// Describes a receive-only pipeline watching the stream's
    /// transmit destination.
    #[must_use]
    pub fn observer(config: &StreamConfig) -> Self {
        Self {
            rx: config.tx,
            tx: None,
            max_branches: 0,
            ..Self::from_config(config)
        }
    }

    /// Samples per channel in one frame.
    #[must_use]
    pub fn samples_per_frame(&self) -> usize {
        (self.frame_ms as usize * self.sample_rate as usize) / 1000
    }

    /// Bytes of S16LE audio per channel in one frame.
    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        self.samples_per_frame() * 2
    }

    /// Largest S16LE unit per channel a single packet may carry.
    #[must_use]
    pub fn max_unit_bytes(&self) -> usize {
        (MAX_FRAME_MS as usize * self.sample_rate as usize) / 1000 * 2
    }

    /// Byte budget of one branch queue.
    #[must_use]
    pub fn queue_bytes(&self) -> usize {
        let ms = 3 * self.frame_ms + self.jitter_latency_ms;
        let bytes = (ms as usize * self.sample_rate as usize) / 1000 * 2;
        bytes.max(self.max_unit_bytes())
    }

    /// Bytes of transmit buffering per channel (three frames).
    #[must_use]
    pub fn tx_buffer_bytes(&self) -> usize {
        self.frame_bytes() * 3
    }

    /// RTP timestamp offset in samples: one frame plus the configured extra.
    #[must_use]
    pub fn rtp_offset_samples(&self) -> u32 {
        let ms = u64::from(self.frame_ms) + u64::from(self.rtp_ts_offset_ms);
        ((ms * u64::from(self.sample_rate)) / 1000 % (1u64 << 32)) as u32
    }
}

/// Run state of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Built, not started.
    Null,
    /// Running but not moving media (clock switch in progress).
    Paused,
    /// Moving media.
    Playing,
    /// Torn down.
    Stopped,
}

impl PipelineState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Paused => 1,
            Self::Playing => 2,
            Self::Stopped => 3,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Null,
            1 => Self::Paused,
            2 => Self::Playing,
            _ => Self::Stopped,
        }
    }
}

/// What happened to a pushed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The frame was queued for transmission.
    Queued,
    /// The pipeline is not moving media yet; the frame was dropped and the
    /// caller should wait out its own frame interval.
    Paced,
}

/// Asynchronous notices from a pipeline worker.
#[derive(Debug, Clone)]
pub enum PipelineNotice {
    /// The pipeline hit an error after starting.
    Fault {
        /// Description of the fault.
        reason: String,
    },
    /// The clock synchronized.
    ClockSynced,
}

/// Sending half of a pipeline's notice channel.
pub type NoticeSender = mpsc::Sender<PipelineNotice>;

/// Receiving half of a pipeline's notice channel.
pub type NoticeReceiver = mpsc::Receiver<PipelineNotice>;

/// Creates a bounded notice channel.
#[must_use]
pub fn notice_channel() -> (NoticeSender, NoticeReceiver) {
    mpsc::channel(NOTICE_CAPACITY)
}

/// Per-channel statistics of the default receive path.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    /// Whether the receive valve is dropping.
    pub dropping: bool,
    /// Bytes queued for the default sink.
    pub queued_bytes: usize,
    /// Leftover bytes retained by the default sink.
    pub leftover_bytes: usize,
    /// Units discarded because the queue was full.
    pub overflow_units: u64,
}

/// Snapshot of a pipeline's counters.
#[derive(Debug, Clone)]
pub struct PipelineStats {
    /// Current run state.
    pub state: PipelineState,
    /// Clock state.
    pub clock: ClockStats,
    /// Receive statistics.
    pub rtp: RtpStats,
    /// Packets transmitted.
    pub packets_sent: u64,
    /// Frames dropped by the transmit valve.
    pub tx_dropped_frames: u64,
    /// Pushed bytes discarded because the transmit buffer was full.
    pub tx_overflow_bytes: u64,
    /// Whether the transmit valve is dropping.
    pub tx_dropping: bool,
    /// Default receive path per channel.
    pub channels: Vec<ChannelStats>,
    /// Attached session branches.
    pub branches: usize,
}

/// A running audio graph for one stream.
///
/// All methods take `&self` and are called from session threads while the
/// owning stream's reader lock is held.
pub trait Pipeline: Send + Sync {
    /// The spec this pipeline was built from.
    fn spec(&self) -> &PipelineSpec;

    /// Current run state.
    fn state(&self) -> PipelineState;

    /// Queues one frame of S16LE audio for transmission on `channel`.
    ///
    /// Never blocks. Returns [`PushOutcome::Paced`] without transmitting when
    /// the pipeline is not playing or its clock is not synced.
    fn push(&self, channel: usize, bytes: &[u8]) -> Result<PushOutcome, PipelineError>;

    /// Reads up to `buf.len()` bytes of S16LE audio from `channel`.
    ///
    /// Reads from the session's branch when `session` is given, otherwise
    /// from the channel's default sink. Waits at most [`PULL_WAIT`] per
    /// attempt and returns what has accumulated, possibly zero.
    fn pull(&self, channel: usize, buf: &mut [u8], session: Option<SessionId>) -> usize;

    /// Pauses, installs a new clock source and resumes.
    fn set_clock(&self, clock: ClockSource);

    /// Opens or closes a valve: `None` is the transmit valve, `Some(ch)` the
    /// receive valve in front of channel `ch`.
    fn set_drop(&self, channel: Option<usize>, drop: bool) -> Result<(), PipelineError>;

    /// Current counters.
    fn stats(&self) -> PipelineStats;

    /// Attaches a receive branch for `session` on `channel`.
    fn attach_branch(&self, channel: usize, session: SessionId) -> Result<(), PipelineError>;

    /// Detaches the receive branch of `session` on `channel`.
    fn detach_branch(&self, channel: usize, session: SessionId) -> Result<(), PipelineError>;

    /// Returns true once the clock can be used for media.
    fn is_clock_synced(&self) -> bool;

    /// Current time on the pipeline's clock.
    fn clock_time(&self) -> Duration;

    /// Clock time of the last received packet and its sender.
    fn last_rx(&self) -> Option<(Duration, SocketAddr)>;

    /// Stops the worker and releases every stage. Idempotent.
    fn destroy(&self);
}

/// Builds pipelines.
pub trait PipelineFactory: Send + Sync {
    /// Builds and starts a pipeline.
    ///
    /// Runtime faults of the new pipeline are reported on `notices`.
    fn create(
        &self,
        spec: PipelineSpec,
        clock: ClockSource,
        notices: NoticeSender,
    ) -> Result<Box<dyn Pipeline>, PipelineError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaAddress;

    fn config() -> StreamConfig {
        StreamConfig {
            name: "s1".into(),
            rx: Some(MediaAddress::new(Ipv4Addr::new(239, 69, 0, 1), 5004)),
            tx: Some(MediaAddress::new(Ipv4Addr::new(239, 69, 0, 2), 5004)),
            sample_rate: 48000,
            channels: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_spec_sizes() {
        let spec = PipelineSpec::from_config(&config());
        assert_eq!(spec.samples_per_frame(), 960);
        assert_eq!(spec.frame_bytes(), 1920);
        assert_eq!(spec.tx_buffer_bytes(), 5760);
        assert_eq!(spec.max_unit_bytes(), 11520);
        assert!(spec.queue_bytes() >= spec.max_unit_bytes());
    }

    #[test]
    fn test_rtp_offset() {
        let mut config = config();
        config.rtp_ts_offset_ms = 5;
        let spec = PipelineSpec::from_config(&config);
        // (20 + 5) ms at 48kHz
        assert_eq!(spec.rtp_offset_samples(), 1200);
    }

    #[test]
    fn test_observer_watches_tx_address() {
        let config = config();
        let spec = PipelineSpec::observer(&config);
        assert_eq!(spec.rx, config.tx);
        assert!(spec.tx.is_none());
    }

    #[test]
    fn test_backup_sender_disables_loop() {
        let mut config = config();
        assert!(PipelineSpec::from_config(&config).multicast_loop);
        config.backup_sender = true;
        assert!(!PipelineSpec::from_config(&config).multicast_loop);
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            PipelineState::Null,
            PipelineState::Paused,
            PipelineState::Playing,
            PipelineState::Stopped,
        ] {
            assert_eq!(PipelineState::from_u8(state.as_u8()), state);
        }
    }
}
