//! Call sessions: per-call audio I/O against shared streams.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::endpoint::Endpoint;
use crate::event::{EventCallback, MuxEvent};
use crate::pacer::Pacer;
use crate::pipeline::PushOutcome;
use crate::MuxError;

/// Identifier of a call session, assigned by the call core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Wraps a raw id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw id.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SessionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Floor of reported levels, in dBFS.
pub const LEVEL_FLOOR_DB: f64 = -90.0;

/// One-second EWMA of absolute sample values in both directions.
#[derive(Debug, Clone)]
pub struct LevelMeter {
    weight: f64,
    rx: f64,
    tx: f64,
    rx_samples: u64,
    report_every: u64,
}

impl LevelMeter {
    /// Creates a meter for audio at `sample_rate`.
    pub fn new(sample_rate: u32) -> Self {
        let rate = sample_rate.max(1);
        Self {
            weight: 1.0 / f64::from(rate),
            rx: 0.0,
            tx: 0.0,
            rx_samples: 0,
            report_every: u64::from(rate),
        }
    }

    fn accumulate(avg: &mut f64, weight: f64, bytes: &[u8]) -> u64 {
        let mut n = 0;
        for sample in bytes.chunks_exact(2) {
            let v = f64::from(i16::from_le_bytes([sample[0], sample[1]]).unsigned_abs());
            *avg += (v - *avg) * weight;
            n += 1;
        }
        n
    }

    /// Feeds received audio. Returns `(rx_db, tx_db)` once per second of it.
    pub fn rx(&mut self, bytes: &[u8]) -> Option<(f64, f64)> {
        self.rx_samples += Self::accumulate(&mut self.rx, self.weight, bytes);
        if self.rx_samples < self.report_every {
            return None;
        }
        self.rx_samples -= self.report_every;
        Some((Self::db(self.rx), Self::db(self.tx)))
    }

    /// Feeds transmitted audio.
    pub fn tx(&mut self, bytes: &[u8]) {
        Self::accumulate(&mut self.tx, self.weight, bytes);
    }

    /// Converts an average absolute sample value to dBFS.
    pub fn db(level: f64) -> f64 {
        if level <= 0.0 {
            return LEVEL_FLOOR_DB;
        }
        (20.0 * (level / f64::from(i16::MAX)).log10()).max(LEVEL_FLOOR_DB)
    }
}

/// Duration of `bytes` of mono S16 audio at `sample_rate`.
fn frame_duration(bytes: usize, sample_rate: u32) -> Duration {
    let samples = (bytes / 2) as u64;
    Duration::from_nanos(samples * 1_000_000_000 / u64::from(sample_rate.max(1)))
}

/// A call's view of its endpoint.
///
/// Created by [`MuxContext::open`](crate::MuxContext::open). Reads and
/// writes never fail because of reloads, clock sync or missing pipelines:
/// they play or discard silence at the frame cadence instead. The only
/// error a session surfaces is its own hangup.
pub struct CallSession {
    id: SessionId,
    endpoint: Arc<Endpoint>,
    in_call: AtomicBool,
    input_held: AtomicBool,
    output_held: AtomicBool,
    branch: AtomicBool,
    hangup: Mutex<Option<String>>,
    input_pacer: Mutex<Pacer>,
    output_pacer: Mutex<Pacer>,
    levels: Option<Mutex<LevelMeter>>,
    events: Option<EventCallback>,
}

impl CallSession {
    pub(crate) fn new(
        id: SessionId,
        endpoint: Arc<Endpoint>,
        level_report: bool,
        events: Option<EventCallback>,
    ) -> Self {
        let levels = level_report.then(|| Mutex::new(LevelMeter::new(endpoint.sample_rate())));
        Self {
            id,
            endpoint,
            in_call: AtomicBool::new(false),
            input_held: AtomicBool::new(false),
            output_held: AtomicBool::new(false),
            branch: AtomicBool::new(false),
            hangup: Mutex::new(None),
            input_pacer: Mutex::new(Pacer::new()),
            output_pacer: Mutex::new(Pacer::new()),
            levels,
            events,
        }
    }

    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The endpoint this session was opened on.
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Whether the call is active.
    pub fn is_in_call(&self) -> bool {
        self.in_call.load(Ordering::Acquire)
    }

    /// Whether a dedicated branch was attached when the call started.
    ///
    /// Reads use it only while the stream still has it; a branch lost to a
    /// reload falls back to the channel's default sink.
    pub fn has_branch(&self) -> bool {
        self.branch.load(Ordering::Acquire)
    }

    /// The hangup reason, once hung up.
    pub fn hangup_reason(&self) -> Option<String> {
        self.hangup.lock().clone()
    }

    pub(crate) fn set_in_call(&self, on: bool) {
        self.in_call.store(on, Ordering::Release);
    }

    pub(crate) fn set_input_held(&self, on: bool) {
        self.input_held.store(on, Ordering::Release);
    }

    pub(crate) fn input_held(&self) -> bool {
        self.input_held.load(Ordering::Acquire)
    }

    pub(crate) fn set_output_held(&self, on: bool) {
        self.output_held.store(on, Ordering::Release);
    }

    pub(crate) fn output_held(&self) -> bool {
        self.output_held.load(Ordering::Acquire)
    }

    pub(crate) fn set_branch(&self, on: bool) {
        self.branch.store(on, Ordering::Release);
    }

    /// Marks the session hung up. Returns false if it already was.
    pub(crate) fn hang_up(&self, reason: &str) -> bool {
        let mut hangup = self.hangup.lock();
        if hangup.is_some() {
            return false;
        }
        *hangup = Some(reason.to_owned());
        drop(hangup);
        tracing::warn!(session = %self.id, endpoint = self.endpoint.name(), reason, "session hung up");
        true
    }

    fn check_hangup(&self) -> Result<(), MuxError> {
        match self.hangup.lock().as_ref() {
            Some(reason) => Err(MuxError::SessionHungUp {
                id: self.id.get(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Reads received audio into `buf`.
    ///
    /// Returns the number of bytes written, which is `buf.len()` of silence
    /// whenever no audio could be read.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, MuxError> {
        self.check_hangup()?;
        match self.pull(buf) {
            Ok(n) if n > 0 => {
                self.input_pacer.lock().reset();
                self.meter_rx(&buf[..n]);
                Ok(n)
            }
            Ok(_) => Ok(self.read_silence(buf)),
            Err(e) if e.is_transient() => {
                tracing::trace!(session = %self.id, error = %e, "reading silence");
                Ok(self.read_silence(buf))
            }
            Err(e) => Err(e),
        }
    }

    fn pull(&self, buf: &mut [u8]) -> Result<usize, MuxError> {
        if !self.input_held() {
            return Ok(0);
        }
        let Some(input) = self.endpoint.input() else {
            return Ok(0);
        };
        let guard = input.stream.try_read().ok_or_else(|| MuxError::LockUnavailable {
            stream: input.stream.id().to_string(),
        })?;
        let Some(pipeline) = guard.pipeline() else {
            return Ok(0);
        };
        if !pipeline.is_clock_synced() {
            return Err(MuxError::ClockNotReady {
                stream: input.stream.id().to_string(),
            });
        }
        let session = guard.has_branch(input.channel, self.id).then_some(self.id);
        Ok(pipeline.pull(input.channel, buf, session))
    }

    fn read_silence(&self, buf: &mut [u8]) -> usize {
        buf.fill(0);
        let interval = frame_duration(buf.len(), self.endpoint.sample_rate());
        self.input_pacer.lock().tick(interval);
        buf.len()
    }

    /// Writes audio for transmission.
    ///
    /// Audio that cannot be transmitted right now is discarded at the frame
    /// cadence.
    pub fn write(&self, buf: &[u8]) -> Result<(), MuxError> {
        self.check_hangup()?;
        match self.push(buf) {
            Ok(PushOutcome::Queued) => {
                self.output_pacer.lock().reset();
                if let Some(levels) = &self.levels {
                    levels.lock().tx(buf);
                }
            }
            Ok(PushOutcome::Paced) => self.write_silence(buf.len()),
            Err(e) => {
                tracing::trace!(session = %self.id, error = %e, "discarding write");
                self.write_silence(buf.len());
            }
        }
        Ok(())
    }

    fn push(&self, buf: &[u8]) -> Result<PushOutcome, MuxError> {
        if !self.output_held() {
            return Ok(PushOutcome::Paced);
        }
        let Some(output) = self.endpoint.output() else {
            return Ok(PushOutcome::Paced);
        };
        let guard = output.stream.try_read().ok_or_else(|| MuxError::LockUnavailable {
            stream: output.stream.id().to_string(),
        })?;
        let Some(pipeline) = guard.pipeline() else {
            return Ok(PushOutcome::Paced);
        };
        match pipeline.push(output.channel, buf) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::debug!(
                    session = %self.id,
                    stream = %output.stream.id(),
                    channel = output.channel,
                    error = %e,
                    "write dropped"
                );
                Ok(PushOutcome::Paced)
            }
        }
    }

    fn write_silence(&self, len: usize) {
        let interval = frame_duration(len, self.endpoint.sample_rate());
        self.output_pacer.lock().tick(interval);
    }

    fn meter_rx(&self, bytes: &[u8]) {
        let Some(levels) = &self.levels else {
            return;
        };
        let report = levels.lock().rx(bytes);
        if let (Some((rx_db, tx_db)), Some(events)) = (report, &self.events) {
            events(MuxEvent::AudioLevel {
                session: self.id,
                rx_db,
                tx_db,
            });
        }
    }
}

impl fmt::Debug for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSession")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint.name())
            .field("in_call", &self.is_in_call())
            .field("branch", &self.has_branch())
            .finish_non_exhaustive()
    }
}

/// Registry of open sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<CallSession>>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session; fails if the id is taken.
    pub fn insert(&self, session: Arc<CallSession>) -> Result<(), MuxError> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&session.id()) {
            return Err(MuxError::SessionExists {
                id: session.id().get(),
            });
        }
        sessions.insert(session.id(), session);
        Ok(())
    }

    /// Looks a session up.
    pub fn get(&self, id: SessionId) -> Option<Arc<CallSession>> {
        self.sessions.read().get(&id).cloned()
    }

    /// Removes a session.
    pub fn remove(&self, id: SessionId) -> Option<Arc<CallSession>> {
        self.sessions.write().remove(&id)
    }

    /// Every open session.
    pub fn all(&self) -> Vec<Arc<CallSession>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// True when no session is open.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
