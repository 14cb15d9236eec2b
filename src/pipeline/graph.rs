//! Receive graph: valves, fan-outs and sinks in a typed stage registry.
//!
//! Each channel has a fixed path `valve → fan-out`, built with the graph.
//! Sinks hang off the fan-out: one default sink per channel (session `None`)
//! plus one branch per listening session, attached and detached at runtime.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{BranchQueue, ChannelBuffer, ChannelStats, PipelineState, PULL_WAIT};
use crate::session::SessionId;
use crate::stream::StreamId;
use crate::PipelineError;

/// Kinds of stages a pipeline registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Drops everything flowing into a channel's fan-out.
    RxValve,
    /// Copies a channel's units to every linked sink.
    FanOut,
    /// Queue and sink at the end of a branch.
    Sink,
}

/// Typed address of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StageKey {
    /// Owning stream.
    pub stream: StreamId,
    /// Stage kind.
    pub kind: StageKind,
    /// Channel the stage belongs to.
    pub channel: usize,
    /// Session of a branch sink; `None` for shared stages.
    pub session: Option<SessionId>,
}

impl StageKey {
    fn new(stream: &StreamId, kind: StageKind, channel: usize, session: Option<SessionId>) -> Self {
        Self {
            stream: stream.clone(),
            kind,
            channel,
            session,
        }
    }
}

/// A valve that can drop all data without tearing anything down.
#[derive(Debug, Default)]
pub(crate) struct Valve {
    dropping: AtomicBool,
    dropped: AtomicU64,
}

impl Valve {
    pub(crate) fn new(dropping: bool) -> Self {
        Self {
            dropping: AtomicBool::new(dropping),
            dropped: AtomicU64::new(0),
        }
    }

    pub(crate) fn set(&self, dropping: bool) {
        self.dropping.store(dropping, Ordering::Release);
    }

    pub(crate) fn is_dropping(&self) -> bool {
        self.dropping.load(Ordering::Acquire)
    }

    /// Returns true if data may pass, counting what is dropped.
    pub(crate) fn pass(&self) -> bool {
        if self.is_dropping() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            false
        } else {
            true
        }
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Identifier of a requested fan-out output.
pub(crate) type PadId = u64;

#[derive(Default)]
struct FanOutPads {
    next: PadId,
    requested: HashSet<PadId>,
    links: Vec<(PadId, Arc<BranchSink>)>,
}

/// Copies units to every linked sink.
#[derive(Default)]
pub(crate) struct FanOut {
    pads: Mutex<FanOutPads>,
    closed: AtomicBool,
}

impl FanOut {
    pub(crate) fn request_pad(&self) -> Result<PadId, PipelineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PipelineError::link_failed("fan-out is closed"));
        }
        let mut pads = self.pads.lock();
        let pad = pads.next;
        pads.next += 1;
        pads.requested.insert(pad);
        Ok(pad)
    }

    pub(crate) fn link(&self, pad: PadId, sink: Arc<BranchSink>) -> Result<(), PipelineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PipelineError::link_failed("fan-out is closed"));
        }
        let mut pads = self.pads.lock();
        if !pads.requested.contains(&pad) {
            return Err(PipelineError::link_failed(format!("pad {pad} was not requested")));
        }
        pads.links.push((pad, sink));
        Ok(())
    }

    pub(crate) fn unlink(&self, pad: PadId) -> Option<Arc<BranchSink>> {
        let mut pads = self.pads.lock();
        let idx = pads.links.iter().position(|(p, _)| *p == pad)?;
        Some(pads.links.remove(idx).1)
    }

    pub(crate) fn release_pad(&self, pad: PadId) {
        self.pads.lock().requested.remove(&pad);
    }

    pub(crate) fn push(&self, unit: Vec<u8>) {
        let pads = self.pads.lock();
        if let Some(((_, last), rest)) = pads.links.split_last() {
            for (_, sink) in rest {
                sink.offer(unit.clone());
            }
            last.offer(unit);
        }
    }

    pub(crate) fn link_count(&self) -> usize {
        self.pads.lock().links.len()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut pads = self.pads.lock();
        pads.links.clear();
        pads.requested.clear();
    }
}

/// Queue plus leftover adapter at the end of a branch.
pub(crate) struct BranchSink {
    queue: BranchQueue,
    buffer: Mutex<ChannelBuffer>,
    state: AtomicU8,
}

impl BranchSink {
    pub(crate) fn new(queue_bytes: usize, max_unit: usize) -> Self {
        Self {
            queue: BranchQueue::new(queue_bytes),
            buffer: Mutex::new(ChannelBuffer::new(max_unit)),
            state: AtomicU8::new(PipelineState::Null.as_u8()),
        }
    }

    fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn offer(&self, unit: Vec<u8>) {
        if self.state() == PipelineState::Playing {
            self.queue.push(unit);
        }
    }

    /// Brings the sink to the graph's run state.
    pub(crate) fn sync_state(&self, graph: PipelineState) -> Result<(), PipelineError> {
        if graph == PipelineState::Stopped || self.queue.is_closed() {
            return Err(PipelineError::link_failed("graph is stopped"));
        }
        self.state.store(graph.as_u8(), Ordering::Release);
        Ok(())
    }

    pub(crate) fn pull(&self, out: &mut [u8]) -> usize {
        if self.state() != PipelineState::Playing {
            return 0;
        }
        let mut buffer = self.buffer.lock();
        buffer.fill(out, || self.queue.pop_timeout(PULL_WAIT))
    }

    /// Returns the sink to its initial state and drops what it holds.
    pub(crate) fn reset(&self) {
        self.state
            .store(PipelineState::Null.as_u8(), Ordering::Release);
        self.queue.close();
        self.buffer.lock().clear();
    }

    fn stats(&self) -> (usize, usize, u64) {
        (
            self.queue.queued_bytes(),
            self.buffer.lock().leftover(),
            self.queue.overflow_units(),
        )
    }
}

enum Stage {
    Valve(Arc<Valve>),
    FanOut(Arc<FanOut>),
    Sink { sink: Arc<BranchSink>, pad: PadId },
}

struct RxPath {
    valve: Arc<Valve>,
    fanout: Arc<FanOut>,
}

/// The receive side of a pipeline.
pub(crate) struct Graph {
    stream: StreamId,
    paths: Vec<RxPath>,
    stages: RwLock<HashMap<StageKey, Stage>>,
    branches: Mutex<usize>,
    max_branches: usize,
    queue_bytes: usize,
    max_unit: usize,
}

impl Graph {
    /// Builds the fixed per-channel paths, each with a closed valve and a
    /// default sink.
    pub(crate) fn build(
        stream: StreamId,
        channels: usize,
        queue_bytes: usize,
        max_unit: usize,
        max_branches: usize,
    ) -> Result<Self, PipelineError> {
        let mut stages = HashMap::new();
        let mut paths = Vec::with_capacity(channels);

        for channel in 0..channels {
            let valve = Arc::new(Valve::new(true));
            let fanout = Arc::new(FanOut::default());
            let sink = Arc::new(BranchSink::new(queue_bytes, max_unit));
            let pad = fanout.request_pad()?;
            fanout.link(pad, sink.clone())?;

            stages.insert(
                StageKey::new(&stream, StageKind::RxValve, channel, None),
                Stage::Valve(valve.clone()),
            );
            stages.insert(
                StageKey::new(&stream, StageKind::FanOut, channel, None),
                Stage::FanOut(fanout.clone()),
            );
            stages.insert(
                StageKey::new(&stream, StageKind::Sink, channel, None),
                Stage::Sink { sink, pad },
            );
            paths.push(RxPath { valve, fanout });
        }

        Ok(Self {
            stream,
            paths,
            stages: RwLock::new(stages),
            branches: Mutex::new(0),
            max_branches,
            queue_bytes,
            max_unit,
        })
    }

    pub(crate) fn channels(&self) -> usize {
        self.paths.len()
    }

    fn check_channel(&self, channel: usize) -> Result<(), PipelineError> {
        if channel < self.paths.len() {
            Ok(())
        } else {
            Err(PipelineError::ChannelNotFound {
                channel,
                channels: self.paths.len(),
            })
        }
    }

    /// Feeds one received unit into a channel.
    pub(crate) fn deliver(&self, channel: usize, unit: Vec<u8>) {
        if let Some(path) = self.paths.get(channel) {
            if path.valve.pass() {
                path.fanout.push(unit);
            }
        }
    }

    /// Sets every stage's run state.
    pub(crate) fn set_state(&self, state: PipelineState) {
        for stage in self.stages.read().values() {
            if let Stage::Sink { sink, .. } = stage {
                if let Err(e) = sink.sync_state(state) {
                    tracing::debug!(stream = %self.stream, ?state, error = %e, "sink state not synced");
                }
            }
        }
    }

    pub(crate) fn set_drop(&self, channel: usize, dropping: bool) -> Result<(), PipelineError> {
        self.check_channel(channel)?;
        let key = StageKey::new(&self.stream, StageKind::RxValve, channel, None);
        match self.stages.read().get(&key) {
            Some(Stage::Valve(valve)) => {
                valve.set(dropping);
                Ok(())
            }
            _ => Err(PipelineError::ChannelNotFound {
                channel,
                channels: self.paths.len(),
            }),
        }
    }

    fn fanout(&self, channel: usize) -> Result<Arc<FanOut>, PipelineError> {
        self.check_channel(channel)?;
        let key = StageKey::new(&self.stream, StageKind::FanOut, channel, None);
        match self.stages.read().get(&key) {
            Some(Stage::FanOut(fanout)) => Ok(fanout.clone()),
            _ => Err(PipelineError::link_failed(format!(
                "no fan-out for channel {channel}"
            ))),
        }
    }

    /// Looks up the sink for a channel and optional session.
    pub(crate) fn sink(&self, channel: usize, session: Option<SessionId>) -> Option<Arc<BranchSink>> {
        let key = StageKey::new(&self.stream, StageKind::Sink, channel, session);
        match self.stages.read().get(&key) {
            Some(Stage::Sink { sink, .. }) => Some(sink.clone()),
            _ => None,
        }
    }

    /// Attaches a branch for `session` on `channel`.
    ///
    /// Locate fan-out, create queue and sink, link, register, then bring
    /// the sink to the graph's state. A failure after linking undoes every
    /// earlier step before returning.
    pub(crate) fn attach(
        &self,
        channel: usize,
        session: SessionId,
        state: PipelineState,
    ) -> Result<(), PipelineError> {
        let key = StageKey::new(&self.stream, StageKind::Sink, channel, Some(session));
        if self.stages.read().contains_key(&key) {
            return Err(PipelineError::BranchExists {
                channel,
                session: session.get(),
            });
        }

        let fanout = self.fanout(channel)?;
        let sink = Arc::new(BranchSink::new(self.queue_bytes, self.max_unit));

        let pad = fanout.request_pad()?;
        if let Err(e) = fanout.link(pad, sink.clone()) {
            fanout.release_pad(pad);
            return Err(e);
        }

        if let Err(e) = self.register(&key, &sink, pad) {
            self.unwind(&fanout, pad, &sink, None);
            return Err(e);
        }

        if let Err(e) = sink.sync_state(state) {
            self.unwind(&fanout, pad, &sink, Some(&key));
            return Err(e);
        }

        tracing::debug!(stream = %self.stream, channel, %session, "branch attached");
        Ok(())
    }

    fn register(&self, key: &StageKey, sink: &Arc<BranchSink>, pad: PadId) -> Result<(), PipelineError> {
        let mut branches = self.branches.lock();
        if *branches >= self.max_branches {
            return Err(PipelineError::allocation_failed(format!(
                "branch limit of {} reached",
                self.max_branches
            )));
        }

        let mut stages = self.stages.write();
        if stages.contains_key(key) {
            return Err(PipelineError::BranchExists {
                channel: key.channel,
                session: key.session.map_or(0, SessionId::get),
            });
        }
        stages.insert(
            key.clone(),
            Stage::Sink {
                sink: sink.clone(),
                pad,
            },
        );
        *branches += 1;
        Ok(())
    }

    fn unwind(&self, fanout: &FanOut, pad: PadId, sink: &BranchSink, key: Option<&StageKey>) {
        fanout.unlink(pad);
        fanout.release_pad(pad);
        if let Some(key) = key {
            if self.stages.write().remove(key).is_some() {
                *self.branches.lock() -= 1;
            }
        }
        sink.reset();
    }

    /// Detaches the branch of `session` on `channel`.
    ///
    /// Upstream goes first: the fan-out link is cut and its pad released
    /// before the sink is removed and reset, so nothing is ever pushed into
    /// a sink that is going away.
    pub(crate) fn detach(&self, channel: usize, session: SessionId) -> Result<(), PipelineError> {
        self.check_channel(channel)?;
        let key = StageKey::new(&self.stream, StageKind::Sink, channel, Some(session));
        let pad = match self.stages.read().get(&key) {
            Some(Stage::Sink { pad, .. }) => *pad,
            _ => {
                return Err(PipelineError::BranchNotFound {
                    channel,
                    session: session.get(),
                })
            }
        };

        let fanout = self.fanout(channel)?;
        fanout.unlink(pad);
        fanout.release_pad(pad);

        let removed = self.stages.write().remove(&key);
        if let Some(Stage::Sink { sink, .. }) = removed {
            *self.branches.lock() -= 1;
            sink.reset();
        }

        tracing::debug!(stream = %self.stream, channel, %session, "branch detached");
        Ok(())
    }

    pub(crate) fn branch_count(&self) -> usize {
        *self.branches.lock()
    }

    pub(crate) fn channel_stats(&self) -> Vec<ChannelStats> {
        (0..self.paths.len())
            .map(|channel| {
                let (queued_bytes, leftover_bytes, overflow_units) = self
                    .sink(channel, None)
                    .map(|s| s.stats())
                    .unwrap_or_default();
                ChannelStats {
                    dropping: self.paths[channel].valve.is_dropping(),
                    queued_bytes,
                    leftover_bytes,
                    overflow_units,
                }
            })
            .collect()
    }

    /// Units dropped by all receive valves.
    pub(crate) fn valve_drops(&self) -> u64 {
        self.paths.iter().map(|p| p.valve.dropped()).sum()
    }

    /// Closes every fan-out and resets every sink.
    pub(crate) fn close(&self) {
        for path in &self.paths {
            path.fanout.close();
        }
        {
            let mut stages = self.stages.write();
            for stage in stages.values() {
                if let Stage::Sink { sink, .. } = stage {
                    sink.reset();
                }
            }
            stages.retain(|key, _| key.session.is_none());
        }
        *self.branches.lock() = 0;
    }
}
