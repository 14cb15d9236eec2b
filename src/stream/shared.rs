//! The shared stream: lock, channel usage and pipeline lifecycle.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockUpgradableReadGuard};

use super::StreamId;
use crate::backup::BackupHandle;
use crate::clock::{ClockSource, MediaClock};
use crate::config::{StreamConfig, MAX_CHANNELS};
use crate::event::{EventCallback, MuxEvent};
use crate::pipeline::{
    notice_channel, NoticeReceiver, NoticeSender, Pipeline, PipelineFactory, PipelineNotice,
    PipelineSpec, PipelineStats,
};
use crate::session::SessionId;
use crate::MuxError;

/// Direction of a channel acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Reading audio received from the network.
    Input,
    /// Writing audio to be transmitted.
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

/// Lifecycle of a shared stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Configured; no pipeline has been built yet.
    Unconfigured,
    /// A pipeline is live.
    Active,
    /// A reload or clock switch holds the writer lock.
    Reloading,
    /// Torn down; refuses new use.
    TornDown,
}

/// Which channels are held, and by how many listeners.
#[derive(Debug, Default)]
pub(super) struct ChannelUsage {
    pub(super) inputs: u16,
    pub(super) listeners: [usize; MAX_CHANNELS],
    pub(super) outputs: u16,
}

impl ChannelUsage {
    fn bit(index: usize) -> u16 {
        1 << index
    }

    pub(super) fn output_held(&self, index: usize) -> bool {
        self.outputs & Self::bit(index) != 0
    }

    pub(super) fn held_inputs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.listeners
            .iter()
            .copied()
            .enumerate()
            .filter(|&(_, n)| n > 0)
    }

    fn held_outputs(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_CHANNELS).filter(|&i| self.output_held(i))
    }
}

pub(super) struct Slot {
    pub(super) pipeline: Option<Box<dyn Pipeline>>,
    pub(super) state: StreamState,
}

/// Raises the reloading flag for as long as it lives.
pub(super) struct ReloadGate<'a>(&'a AtomicBool);

impl<'a> ReloadGate<'a> {
    pub(super) fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for ReloadGate<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One configured stream, shared by every session that uses it.
///
/// Sessions hold an `Arc<SharedStream>`; the registry in
/// [`MuxContext`](crate::MuxContext) decides its lifetime. The pipeline is
/// created lazily by the first channel acquisition and lives until the
/// stream is torn down, rebuilt by a reload, or discarded after a runtime
/// fault.
pub struct SharedStream {
    pub(super) id: StreamId,
    pub(super) config: RwLock<StreamConfig>,
    pub(super) inner: RwLock<Slot>,
    pub(super) reloading: AtomicBool,
    pub(super) usage: Mutex<ChannelUsage>,
    /// Branches attached to the live pipeline, by channel and session.
    /// Changed under the reader lock, read by rebuilds under the writer lock.
    pub(super) branches: Mutex<BTreeSet<(usize, SessionId)>>,
    pub(super) clock: RwLock<ClockSource>,
    pub(super) tx_flow: AtomicBool,
    factory: Arc<dyn PipelineFactory>,
    external_clock: Arc<dyn MediaClock>,
    notice_tx: NoticeSender,
    notice_rx: Mutex<NoticeReceiver>,
    backup_muted: AtomicBool,
    backup: Mutex<Option<BackupHandle>>,
    retired: AtomicBool,
    events: Option<EventCallback>,
}

impl SharedStream {
    /// Registers a stream. No pipeline is built until a channel is acquired.
    ///
    /// A backup sender starts its monitor right away.
    pub fn new(
        config: StreamConfig,
        factory: Arc<dyn PipelineFactory>,
        external_clock: Arc<dyn MediaClock>,
        events: Option<EventCallback>,
    ) -> Arc<Self> {
        let (notice_tx, notice_rx) = notice_channel();
        let clock = clock_for(&config, &external_clock);
        let stream = Arc::new(Self {
            id: StreamId::new(config.name.as_str()),
            tx_flow: AtomicBool::new(config.tx_flow),
            config: RwLock::new(config),
            inner: RwLock::new(Slot {
                pipeline: None,
                state: StreamState::Unconfigured,
            }),
            reloading: AtomicBool::new(false),
            usage: Mutex::new(ChannelUsage::default()),
            branches: Mutex::new(BTreeSet::new()),
            clock: RwLock::new(clock),
            factory,
            external_clock,
            notice_tx,
            notice_rx: Mutex::new(notice_rx),
            backup_muted: AtomicBool::new(false),
            backup: Mutex::new(None),
            retired: AtomicBool::new(false),
            events,
        });
        stream.start_backup();
        stream
    }

    /// The stream's name.
    pub fn id(&self) -> &StreamId {
        &self.id
    }

    /// A copy of the current configuration.
    pub fn config(&self) -> StreamConfig {
        self.config.read().clone()
    }

    /// Sample rate of the current configuration.
    pub fn sample_rate(&self) -> u32 {
        self.config.read().sample_rate
    }

    /// Lifecycle state.
    pub fn state(&self) -> StreamState {
        if self.reloading.load(Ordering::Acquire) {
            return StreamState::Reloading;
        }
        self.inner.read().state
    }

    /// Takes the reader lock without waiting.
    ///
    /// Returns `None` while a reload or clock switch is in progress, or if
    /// the writer lock is held for any other reason. Session I/O treats
    /// that as "play silence this frame".
    pub fn try_read(&self) -> Option<StreamReadGuard<'_>> {
        if self.reloading.load(Ordering::Acquire) {
            return None;
        }
        let slot = self.inner.try_read()?;
        Some(StreamReadGuard { stream: self, slot })
    }

    /// Takes the reader lock, waiting out a reload if one is running.
    pub fn read(&self) -> StreamReadGuard<'_> {
        StreamReadGuard {
            stream: self,
            slot: self.inner.read(),
        }
    }

    /// Claims a channel for one holder.
    ///
    /// Output channels are exclusive. Input channels are exclusive unless
    /// the stream allows multiple listeners, in which case holders are
    /// counted. The first acquisition builds the pipeline; an input
    /// acquisition opens the channel's receive valve.
    pub fn acquire_channel(&self, index: usize, direction: Direction) -> Result<(), MuxError> {
        let resource = format!("{}:{index}", self.id);
        let multi_listen = {
            let config = self.config.read();
            if index >= config.channels {
                return Err(MuxError::config_invalid(
                    &resource,
                    format!("stream has {} channels", config.channels),
                ));
            }
            let missing = match direction {
                Direction::Input => config.rx.is_none(),
                Direction::Output => config.tx.is_none(),
            };
            if missing {
                return Err(MuxError::config_invalid(
                    &resource,
                    format!("stream has no {direction} address"),
                ));
            }
            config.multi_listen
        };

        {
            let mut usage = self.usage.lock();
            match direction {
                Direction::Output => {
                    if usage.output_held(index) {
                        tracing::warn!(stream = %self.id, channel = index, "output channel busy");
                        return Err(MuxError::busy(&resource, "output channel already in use"));
                    }
                    usage.outputs |= ChannelUsage::bit(index);
                }
                Direction::Input => {
                    if usage.listeners[index] > 0 && !multi_listen {
                        tracing::warn!(stream = %self.id, channel = index, "input channel busy");
                        return Err(MuxError::busy(&resource, "input channel already in use"));
                    }
                    usage.listeners[index] += 1;
                    usage.inputs |= ChannelUsage::bit(index);
                }
            }
        }

        if let Err(e) = self.ensure_pipeline() {
            self.unclaim(index, direction);
            return Err(e);
        }

        if direction == Direction::Input {
            let slot = self.inner.read();
            if let Some(pipeline) = slot.pipeline.as_deref() {
                self.sync_valve(pipeline, index);
            }
        }

        tracing::debug!(stream = %self.id, channel = index, %direction, "channel acquired");
        Ok(())
    }

    /// Gives a channel back.
    ///
    /// An input channel stays held until its last listener releases it; the
    /// receive valve closes at that point.
    pub fn release_channel(&self, index: usize, direction: Direction) {
        let slot = self.inner.read();
        let mut usage = self.usage.lock();
        if index >= MAX_CHANNELS {
            return;
        }
        match direction {
            Direction::Output => usage.outputs &= !ChannelUsage::bit(index),
            Direction::Input => {
                usage.listeners[index] = usage.listeners[index].saturating_sub(1);
                if usage.listeners[index] > 0 {
                    return;
                }
                usage.inputs &= !ChannelUsage::bit(index);
                if let Some(pipeline) = slot.pipeline.as_deref() {
                    if index < pipeline.spec().channels {
                        if let Err(e) = pipeline.set_drop(Some(index), true) {
                            tracing::debug!(stream = %self.id, channel = index, error = %e, "closing valve failed");
                        }
                    }
                }
            }
        }
        tracing::debug!(stream = %self.id, channel = index, %direction, "channel released");
    }

    fn unclaim(&self, index: usize, direction: Direction) {
        let mut usage = self.usage.lock();
        match direction {
            Direction::Output => usage.outputs &= !ChannelUsage::bit(index),
            Direction::Input => {
                usage.listeners[index] = usage.listeners[index].saturating_sub(1);
                if usage.listeners[index] == 0 {
                    usage.inputs &= !ChannelUsage::bit(index);
                }
            }
        }
    }

    /// Opens or closes `index`'s receive valve to match its listener count.
    fn sync_valve(&self, pipeline: &dyn Pipeline, index: usize) {
        let usage = self.usage.lock();
        let open = usage.listeners.get(index).is_some_and(|&n| n > 0);
        if index < pipeline.spec().channels {
            if let Err(e) = pipeline.set_drop(Some(index), !open) {
                tracing::debug!(stream = %self.id, channel = index, error = %e, "valve update failed");
            }
        }
    }

    fn ensure_pipeline(&self) -> Result<(), MuxError> {
        let slot = self.inner.upgradable_read();
        if slot.state == StreamState::TornDown {
            return Err(MuxError::StreamUnavailable {
                name: self.id.to_string(),
            });
        }
        if slot.pipeline.is_some() {
            return Ok(());
        }

        let mut slot = RwLockUpgradableReadGuard::upgrade(slot);
        let config = self.config.read().clone();
        let pipeline = self.build_pipeline(&config)?;
        self.install(&mut slot, pipeline);
        Ok(())
    }

    pub(super) fn build_pipeline(&self, config: &StreamConfig) -> Result<Box<dyn Pipeline>, MuxError> {
        let spec = PipelineSpec::from_config(config);
        let clock = self.clock.read().clone();
        self.factory
            .create(spec, clock, self.notice_tx.clone())
            .map_err(|source| {
                tracing::warn!(stream = %self.id, error = %source, "pipeline construction failed");
                MuxError::PipelineConstructionFailed {
                    stream: self.id.to_string(),
                    source,
                }
            })
    }

    /// Puts a freshly built pipeline in the slot and restores valves and
    /// the transmit gate from the stream's current holders.
    pub(super) fn install(&self, slot: &mut Slot, pipeline: Box<dyn Pipeline>) {
        {
            let usage = self.usage.lock();
            for (index, _) in usage.held_inputs() {
                if index < pipeline.spec().channels {
                    if let Err(e) = pipeline.set_drop(Some(index), false) {
                        tracing::debug!(stream = %self.id, channel = index, error = %e, "valve restore failed");
                    }
                }
            }
        }
        self.apply_tx_gate(pipeline.as_ref());
        slot.pipeline = Some(pipeline);
        slot.state = StreamState::Active;
        tracing::info!(stream = %self.id, "stream pipeline ready");
    }

    fn apply_tx_gate(&self, pipeline: &dyn Pipeline) {
        if pipeline.spec().tx.is_none() {
            return;
        }
        let drop = !self.tx_flow.load(Ordering::Acquire) || self.backup_muted.load(Ordering::Acquire);
        if let Err(e) = pipeline.set_drop(None, drop) {
            tracing::warn!(stream = %self.id, error = %e, "transmit valve update failed");
        }
    }

    /// Turns transmission on or off by operator request.
    pub fn set_tx_flow(&self, on: bool) -> Result<(), MuxError> {
        if self.config.read().tx.is_none() {
            return Err(MuxError::config_invalid(
                self.id.as_str(),
                "stream has no tx address",
            ));
        }
        self.tx_flow.store(on, Ordering::Release);
        let slot = self.inner.read();
        if let Some(pipeline) = slot.pipeline.as_deref() {
            self.apply_tx_gate(pipeline);
        }
        tracing::info!(stream = %self.id, on, "tx flow set");
        Ok(())
    }

    /// Whether the operator allows transmission.
    pub fn tx_flow(&self) -> bool {
        self.tx_flow.load(Ordering::Acquire)
    }

    /// Records the backup monitor's decision and applies it if the lock
    /// is free; a reload in progress re-applies it when done.
    pub(crate) fn set_backup_muted(&self, muted: bool) {
        self.backup_muted.store(muted, Ordering::Release);
        if let Some(guard) = self.try_read() {
            if let Some(pipeline) = guard.pipeline() {
                self.apply_tx_gate(pipeline);
            }
        }
    }

    /// Whether the backup monitor currently mutes this transmitter.
    pub fn is_backup_muted(&self) -> bool {
        self.backup_muted.load(Ordering::Acquire)
    }

    /// Replaces the clock of the live pipeline, pausing it meanwhile.
    ///
    /// Runs under the reloading flag and the writer lock, so sessions play
    /// silence for the duration of the switch.
    ///
    /// A stream without a receive address has nothing to derive a synthetic
    /// clock from; it stays on the external clock.
    pub fn switch_clock(&self, source: ClockSource) {
        let source = match source {
            ClockSource::Synthetic if self.config.read().rx.is_none() => {
                tracing::debug!(stream = %self.id, "no receive path, keeping external clock");
                ClockSource::External(self.external_clock.clone())
            }
            other => other,
        };
        let gate = ReloadGate::raise(&self.reloading);
        let slot = self.inner.write();
        *self.clock.write() = source.clone();
        if let Some(pipeline) = slot.pipeline.as_deref() {
            pipeline.set_clock(source);
        }
        drop(gate);
        drop(slot);
    }

    /// Tears the stream down for good. Idempotent.
    pub fn teardown(&self) {
        self.stop_backup();
        let gate = ReloadGate::raise(&self.reloading);
        let mut slot = self.inner.write();
        if let Some(pipeline) = slot.pipeline.take() {
            pipeline.destroy();
        }
        self.branches.lock().clear();
        let was = slot.state;
        slot.state = StreamState::TornDown;
        drop(gate);
        drop(slot);
        if was != StreamState::TornDown {
            tracing::info!(stream = %self.id, "stream torn down");
        }
    }

    /// Destroys a pipeline that reported a runtime fault. The next channel
    /// acquisition or reload builds a new one.
    pub(crate) fn discard_pipeline(&self) {
        let gate = ReloadGate::raise(&self.reloading);
        let mut slot = self.inner.write();
        if let Some(pipeline) = slot.pipeline.take() {
            pipeline.destroy();
        }
        self.branches.lock().clear();
        if slot.state == StreamState::Active {
            slot.state = StreamState::Unconfigured;
        }
        drop(gate);
        drop(slot);
    }

    /// Takes every pending notice from the pipeline worker.
    pub(crate) fn drain_notices(&self) -> Vec<PipelineNotice> {
        let mut rx = self.notice_rx.lock();
        let mut notices = Vec::new();
        while let Ok(notice) = rx.try_recv() {
            notices.push(notice);
        }
        notices
    }

    /// Counters of the live pipeline, if any.
    pub fn stats(&self) -> Option<PipelineStats> {
        self.read().pipeline().map(|p| p.stats())
    }

    /// Held input channels with their listener counts.
    pub fn inputs_in_use(&self) -> Vec<(usize, usize)> {
        self.usage.lock().held_inputs().collect()
    }

    /// Held output channels.
    pub fn outputs_in_use(&self) -> Vec<usize> {
        self.usage.lock().held_outputs().collect()
    }

    /// True when no channel is held.
    pub fn is_idle(&self) -> bool {
        let usage = self.usage.lock();
        usage.inputs == 0 && usage.outputs == 0
    }

    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    /// Takes a retired stream back into service.
    pub(crate) fn revive(&self) {
        self.retired.store(false, Ordering::Release);
    }

    /// True once the stream was dropped from the configuration but is
    /// still held by sessions in a call.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub(crate) fn factory(&self) -> &Arc<dyn PipelineFactory> {
        &self.factory
    }

    pub(crate) fn clock_for(&self, config: &StreamConfig) -> ClockSource {
        clock_for(config, &self.external_clock)
    }

    pub(crate) fn emit(&self, event: MuxEvent) {
        if let Some(events) = &self.events {
            events(event);
        }
    }

    pub(super) fn start_backup(self: &Arc<Self>) {
        let config = self.config.read().clone();
        if !config.backup_sender || config.tx.is_none() {
            return;
        }
        match BackupHandle::spawn(self, &config) {
            Ok(handle) => *self.backup.lock() = Some(handle),
            Err(e) => {
                tracing::warn!(stream = %self.id, error = %e, "backup monitor failed to start");
            }
        }
    }

    pub(super) fn stop_backup(&self) {
        let handle = self.backup.lock().take();
        if let Some(mut handle) = handle {
            handle.stop();
        }
    }

    /// Whether a backup monitor is running.
    pub fn has_backup_monitor(&self) -> bool {
        self.backup.lock().is_some()
    }
}

impl Drop for SharedStream {
    fn drop(&mut self) {
        self.stop_backup();
    }
}

impl fmt::Debug for SharedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedStream")
            .field("id", &self.id)
            .field("reloading", &self.reloading.load(Ordering::Relaxed))
            .field("retired", &self.retired.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Synthetic clocks are derived from received timestamps, so they need a
/// receive address.
fn clock_for(config: &StreamConfig, external: &Arc<dyn MediaClock>) -> ClockSource {
    if config.synthetic_clock && config.rx.is_some() {
        ClockSource::Synthetic
    } else {
        ClockSource::External(external.clone())
    }
}

/// Reader access to a stream's pipeline.
///
/// Holding this guard keeps the pipeline alive and prevents reloads; keep it
/// for the duration of one I/O operation only.
pub struct StreamReadGuard<'a> {
    stream: &'a SharedStream,
    slot: RwLockReadGuard<'a, Slot>,
}

impl StreamReadGuard<'_> {
    /// The stream this guard was taken on.
    pub fn stream(&self) -> &SharedStream {
        self.stream
    }

    /// The live pipeline, if one has been built.
    pub fn pipeline(&self) -> Option<&dyn Pipeline> {
        self.slot.pipeline.as_deref()
    }

    /// Lifecycle state as seen under the lock.
    pub fn state(&self) -> StreamState {
        self.slot.state
    }

    /// Whether `session` reads `channel` through its own branch of the
    /// live pipeline.
    pub fn has_branch(&self, channel: usize, session: SessionId) -> bool {
        self.stream.branches.lock().contains(&(channel, session))
    }

    pub(crate) fn track_branch(&self, channel: usize, session: SessionId) {
        self.stream.branches.lock().insert((channel, session));
    }

    pub(crate) fn untrack_branch(&self, channel: usize, session: SessionId) {
        self.stream.branches.lock().remove(&(channel, session));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::MediaAddress;
    use crate::pipeline::{MemoryNetwork, RtpPipelineFactory};
    use std::net::Ipv4Addr;

    fn stream(multi_listen: bool) -> Arc<SharedStream> {
        let config = StreamConfig {
            name: "s1".into(),
            rx: Some(MediaAddress::new(Ipv4Addr::new(239, 69, 2, 1), 5004)),
            tx: Some(MediaAddress::new(Ipv4Addr::new(239, 69, 2, 2), 5004)),
            sample_rate: 48000,
            channels: 2,
            multi_listen,
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
    fn test_single_listener_is_exclusive() {
        let stream = stream(false);
        stream.acquire_channel(0, Direction::Input).unwrap();
        let err = stream.acquire_channel(0, Direction::Input).unwrap_err();
        assert!(matches!(err, MuxError::ResourceBusy { .. }));
        assert_eq!(stream.inputs_in_use(), vec![(0, 1)]);
    }

    #[test]
    fn test_multi_listen_counts_holders() {
        let stream = stream(true);
        stream.acquire_channel(0, Direction::Input).unwrap();
        stream.acquire_channel(0, Direction::Input).unwrap();
        assert_eq!(stream.inputs_in_use(), vec![(0, 2)]);

        stream.release_channel(0, Direction::Input);
        assert_eq!(stream.inputs_in_use(), vec![(0, 1)]);
        let stats = stream.stats().unwrap();
        assert!(!stats.channels[0].dropping);

        stream.release_channel(0, Direction::Input);
        assert!(stream.is_idle());
        assert!(stream.stats().unwrap().channels[0].dropping);
    }

    #[test]
    fn test_output_is_always_exclusive() {
        let stream = stream(true);
        stream.acquire_channel(1, Direction::Output).unwrap();
        assert!(matches!(
            stream.acquire_channel(1, Direction::Output),
            Err(MuxError::ResourceBusy { .. })
        ));
        stream.release_channel(1, Direction::Output);
        stream.acquire_channel(1, Direction::Output).unwrap();
    }

    #[test]
    fn test_first_acquisition_builds_pipeline() {
        let stream = stream(false);
        assert_eq!(stream.state(), StreamState::Unconfigured);
        assert!(stream.stats().is_none());
        stream.acquire_channel(1, Direction::Input).unwrap();
        assert_eq!(stream.state(), StreamState::Active);
        let stats = stream.stats().unwrap();
        assert!(stats.channels[0].dropping);
        assert!(!stats.channels[1].dropping);
    }

    #[test]
    fn test_out_of_range_channel() {
        let stream = stream(false);
        assert!(matches!(
            stream.acquire_channel(2, Direction::Input),
            Err(MuxError::ConfigInvalid { .. })
        ));
        assert!(stream.is_idle());
    }

    #[test]
    fn test_try_read_fails_while_reloading() {
        let stream = stream(false);
        assert!(stream.try_read().is_some());
        let gate = ReloadGate::raise(&stream.reloading);
        assert!(stream.try_read().is_none());
        assert_eq!(stream.state(), StreamState::Reloading);
        drop(gate);
        assert!(stream.try_read().is_some());
    }

    #[test]
    fn test_tx_flow_closes_transmit_valve() {
        let stream = stream(false);
        stream.acquire_channel(0, Direction::Output).unwrap();
        assert!(!stream.stats().unwrap().tx_dropping);
        stream.set_tx_flow(false).unwrap();
        assert!(stream.stats().unwrap().tx_dropping);
        stream.set_tx_flow(true).unwrap();
        assert!(!stream.stats().unwrap().tx_dropping);
    }

    #[test]
    fn test_teardown_refuses_new_use() {
        let stream = stream(false);
        stream.acquire_channel(0, Direction::Input).unwrap();
        stream.teardown();
        assert_eq!(stream.state(), StreamState::TornDown);
        assert!(stream.stats().is_none());
        assert!(matches!(
            stream.acquire_channel(1, Direction::Input),
            Err(MuxError::StreamUnavailable { .. })
        ));
        // The failed attempt left no bit behind
        assert_eq!(stream.inputs_in_use(), vec![(0, 1)]);
    }

    #[test]
    fn test_switch_clock_to_synthetic_unsyncs() {
        let stream = stream(false);
        stream.acquire_channel(0, Direction::Input).unwrap();
        assert!(stream.stats().unwrap().clock.synced);
        stream.switch_clock(ClockSource::Synthetic);
        assert!(!stream.stats().unwrap().clock.synced);
        assert!(stream.try_read().is_some());
    }

    fn tx_only(synthetic_clock: bool) -> Arc<SharedStream> {
        let config = StreamConfig {
            name: "out".into(),
            tx: Some(MediaAddress::new(Ipv4Addr::new(239, 69, 2, 9), 5004)),
            synthetic_clock,
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
    fn test_tx_only_synthetic_stream_uses_external_clock() {
        let stream = tx_only(true);
        assert!(matches!(*stream.clock.read(), ClockSource::External(_)));
        stream.acquire_channel(0, Direction::Output).unwrap();
        assert!(stream.stats().unwrap().clock.synced);

        let guard = stream.read();
        let outcome = guard.pipeline().unwrap().push(0, &[0; 320]).unwrap();
        assert_eq!(outcome, crate::pipeline::PushOutcome::Queued);
    }

    #[test]
    fn test_tx_only_stream_ignores_switch_to_synthetic() {
        let stream = tx_only(false);
        stream.acquire_channel(0, Direction::Output).unwrap();
        stream.switch_clock(ClockSource::Synthetic);
        assert!(matches!(*stream.clock.read(), ClockSource::External(_)));
        assert!(stream.stats().unwrap().clock.synced);
    }

    #[test]
    fn test_discard_forgets_branches() {
        let stream = stream(true);
        stream.acquire_channel(0, Direction::Input).unwrap();
        {
            let guard = stream.read();
            guard.pipeline().unwrap().attach_branch(0, SessionId::new(4)).unwrap();
            guard.track_branch(0, SessionId::new(4));
            assert!(guard.has_branch(0, SessionId::new(4)));
        }
        stream.discard_pipeline();
        assert!(!stream.read().has_branch(0, SessionId::new(4)));
    }
}
