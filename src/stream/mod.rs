//! Shared streams: one pipeline per configured stream, shared by sessions.
//!
//! A [`SharedStream`] owns at most one live pipeline behind a reader/writer
//! lock. Sessions only ever take the reader side, and only with a try-lock
//! gated on the stream's "reloading" flag, so a reload or clock switch never
//! stalls a call thread: the session plays silence for that frame instead.
//!
//! Lock order is fixed: the stream lock first, then the channel-usage mutex.

mod reload;
mod shared;
mod stream_id;

pub use reload::ReloadOutcome;
pub use shared::{Direction, SharedStream, StreamReadGuard, StreamState};
pub use stream_id::StreamId;
