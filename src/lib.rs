//! # aes67-mux
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! Shared AES67 multicast audio streams, multiplexed across many call
//! sessions.
//!
//! `aes67-mux` sits between a telephony call core and an audio-over-IP
//! network. Streams are configured once and shared: every call session
//! reads and writes fixed-size S16LE frames on one channel of a stream,
//! while the stream's pipeline, clock and transmitter are managed for it.
//! Streams can be reconfigured at runtime without dropping unrelated calls.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use aes67_mux::{Mux, MuxConfig, SessionId};
//! use std::time::Duration;
//!
//! # async fn run(config: MuxConfig) -> Result<(), aes67_mux::MuxError> {
//! let (context, _report) = Mux::builder()
//!     .config(config)
//!     .on_event(|e| tracing::warn!(?e, "mux event"))
//!     .build()?;
//! let context = std::sync::Arc::new(context);
//! let _supervisor = context.spawn_supervisor(Duration::from_millis(100));
//!
//! // Call answered on the default endpoint
//! let session = context.open(SessionId::new(1), None)?;
//! context.activate(session.id())?;
//!
//! let mut frame = vec![0u8; 320];
//! session.read(&mut frame)?;
//! session.write(&frame)?;
//!
//! context.teardown(session.id())?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! Each stream owns at most one pipeline behind a reader/writer lock:
//!
//! - **Session threads**: owned by the call core; read and write through a
//!   non-blocking try-lock and play silence whenever audio cannot move
//! - **Worker thread**: one per pipeline, running the receive, transmit and
//!   clock loops on a current-thread tokio runtime
//! - **Supervisor**: drains pipeline notices, hangs up sessions on runtime
//!   faults and reports clock state
//!
//! Reloads and clock switches take the writer lock briefly; sessions never
//! wait for them.

#![warn(missing_docs)]
// Audio code requires intentional numeric casts between sample formats
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
// unwrap/expect allowed in tests only
#![allow(clippy::unwrap_used)]
// These doc lints are too strict for internal implementation details
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

mod admin;
mod backup;
pub mod branch;
mod builder;
pub mod clock;
mod config;
mod context;
mod endpoint;
mod error;
mod event;
mod pacer;
pub mod pipeline;
mod session;
mod stream;

pub use admin::{AdminCommand, AdminReply};
pub use backup::{BackupMonitor, TxTransition};
pub use builder::{Mux, MuxBuilder};
pub use clock::{ClockMode, ClockSource, ClockStats, ManualClock, MediaClock, SystemClock};
pub use config::{
    ChannelRef, Codec, EndpointConfig, MediaAddress, MuxConfig, StreamConfig, ValidatedConfig,
    DEFAULT_RTP_PORT, MAX_CHANNELS, MAX_FRAME_MS, MIN_SAMPLE_RATE,
};
pub use context::{ConfigLoader, LoadReport, MuxContext};
pub use endpoint::{ChannelBinding, Endpoint};
pub use error::{MuxError, PipelineError};
pub use event::{event_callback, EventCallback, MuxEvent};
pub use pacer::Pacer;
pub use pipeline::{
    MemoryNetwork, Network, Pipeline, PipelineFactory, PipelineSpec, PipelineState, PipelineStats,
    PushOutcome, RtpPipelineFactory, UdpNetwork,
};
pub use session::{CallSession, LevelMeter, SessionId, SessionRegistry, LEVEL_FLOOR_DB};
pub use stream::{Direction, ReloadOutcome, SharedStream, StreamReadGuard, StreamState, StreamId};
