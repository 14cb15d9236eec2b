//! Pipeline worker: the thread that owns a pipeline's sockets.
//!
//! The worker runs a current-thread tokio runtime with up to three loops:
//! receive (parse, track, depayload, deliver), transmit (one frame per
//! tick from the per-channel rings) and clock (feeds the synthetic clock).
//! The first loop to end ends the worker; a stop signal ends all of them.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use futures::future::{select_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer};
use ringbuf::HeapCons;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

use super::graph::{Graph, Valve};
use super::network::{Network, RxSocket, TxSocket};
use super::rtp::{depayload, interleave, RtpHeader, RxTracker};
use super::{NoticeSender, PipelineNotice, PipelineSpec, PipelineState};
use crate::clock::{ClockSync, SYNTHETIC_TICK};
use crate::PipelineError;

/// Largest datagram the receive loop accepts.
const MAX_DATAGRAM: usize = 65536;

/// Frames the transmit loop may send per tick to catch up after a stall.
const MAX_FRAMES_PER_TICK: usize = 2;

/// State shared between a pipeline handle and its worker.
pub(crate) struct Shared {
    pub(crate) spec: PipelineSpec,
    pub(crate) graph: Graph,
    pub(crate) clock: ClockSync,
    pub(crate) tx_valve: Valve,
    pub(crate) packets_sent: AtomicU64,
    pub(crate) tx_overflow_bytes: AtomicU64,
    state: AtomicU8,
    tracker: Mutex<RxTracker>,
    last_rx: Mutex<Option<(Duration, SocketAddr)>>,
    observation: Mutex<Option<(Duration, u64)>>,
}

impl Shared {
    pub(crate) fn new(spec: PipelineSpec, graph: Graph, clock: ClockSync) -> Self {
        let tracker = RxTracker::new(spec.sample_rate);
        Self {
            spec,
            graph,
            clock,
            tx_valve: Valve::new(false),
            packets_sent: AtomicU64::new(0),
            tx_overflow_bytes: AtomicU64::new(0),
            state: AtomicU8::new(PipelineState::Null.as_u8()),
            tracker: Mutex::new(tracker),
            last_rx: Mutex::new(None),
            observation: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: PipelineState) {
        self.state.store(state.as_u8(), Ordering::Release);
        self.graph.set_state(state);
    }

    /// True when media may flow in either direction.
    pub(crate) fn moving_media(&self) -> bool {
        self.state() == PipelineState::Playing && self.clock.is_synced()
    }

    pub(crate) fn last_rx(&self) -> Option<(Duration, SocketAddr)> {
        *self.last_rx.lock()
    }

    pub(crate) fn rtp_stats(&self) -> super::RtpStats {
        self.tracker.lock().stats()
    }

    /// Handles one received datagram.
    pub(crate) fn on_packet(&self, packet: &[u8], from: SocketAddr) {
        let Some((header, payload)) = RtpHeader::parse(packet) else {
            self.tracker.lock().malformed();
            return;
        };
        if header.payload_type != self.spec.payload_type {
            self.tracker.lock().wrong_payload_type();
            return;
        }

        let arrival = self.clock.internal_now();
        let ext_ts = self.tracker.lock().record(&header, payload.len(), arrival);
        *self.last_rx.lock() = Some((self.clock.now(), from));
        *self.observation.lock() = Some((arrival, ext_ts));

        if !self.moving_media() {
            return;
        }

        let Some(units) = depayload(payload, self.spec.codec, self.spec.channels) else {
            self.tracker.lock().malformed();
            return;
        };
        let max_unit = self.spec.max_unit_bytes();
        for (channel, unit) in units.into_iter().enumerate() {
            if unit.len() > max_unit {
                tracing::debug!(stream = %self.spec.stream, bytes = unit.len(), "oversized unit dropped");
                continue;
            }
            self.graph.deliver(channel, unit);
        }
    }

    /// Feeds the most recent arrival to the clock. Returns true on sync.
    pub(crate) fn feed_clock(&self) -> bool {
        let Some((arrival, ext_ts)) = self.observation.lock().take() else {
            return false;
        };
        self.clock.observe(arrival, ext_ts)
    }

    fn fault(&self, notices: &NoticeSender, reason: String) {
        tracing::error!(stream = %self.spec.stream, %reason, "pipeline fault");
        if notices.try_send(PipelineNotice::Fault { reason }).is_err() {
            tracing::warn!(stream = %self.spec.stream, "notice channel full, fault dropped");
        }
    }
}

/// Random start values for a new RTP source: sequence number in the high
/// bits, SSRC in the low ones.
///
/// `RandomState` is keyed per process; the counter keeps two pipelines of
/// the same stream apart within one process.
fn source_seed(stream: &str) -> u64 {
    static SOURCES: AtomicU64 = AtomicU64::new(0);
    let mut hasher = RandomState::new().build_hasher();
    stream.hash(&mut hasher);
    SOURCES.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);
    SystemTime::now().hash(&mut hasher);
    hasher.finish()
}

/// Builds outgoing packets from the per-channel transmit rings.
pub(crate) struct TxFramer {
    rings: Vec<HeapCons<u8>>,
    sequence: u16,
    ssrc: u32,
    first: bool,
}

impl TxFramer {
    pub(crate) fn new(stream: &str, rings: Vec<HeapCons<u8>>) -> Self {
        let seed = source_seed(stream);
        Self {
            rings,
            sequence: (seed >> 32) as u16,
            ssrc: seed as u32,
            first: true,
        }
    }

    fn frame_ready(&self, frame_bytes: usize) -> bool {
        self.rings.iter().any(|r| r.occupied_len() >= frame_bytes)
    }

    /// Drops everything buffered.
    pub(crate) fn discard(&mut self) {
        for ring in &mut self.rings {
            ring.clear();
        }
    }

    /// Takes the next frame and returns it as a packet.
    ///
    /// Channels with less than a frame buffered are padded with silence.
    /// Frames caught by the transmit valve are consumed and counted.
    pub(crate) fn next_packet(&mut self, shared: &Shared) -> Option<Vec<u8>> {
        let spec = &shared.spec;
        let frame_bytes = spec.frame_bytes();

        while self.frame_ready(frame_bytes) {
            let units: Vec<Vec<u8>> = self
                .rings
                .iter_mut()
                .map(|ring| {
                    let mut unit = vec![0u8; frame_bytes];
                    ring.pop_slice(&mut unit);
                    unit
                })
                .collect();

            if !shared.tx_valve.pass() {
                continue;
            }

            let rate = u128::from(spec.sample_rate);
            let now = (shared.clock.now().as_nanos() * rate / 1_000_000_000) as u64;
            let timestamp = (now as u32).wrapping_add(spec.rtp_offset_samples());

            let header = RtpHeader {
                marker: self.first,
                payload_type: spec.payload_type,
                sequence: self.sequence,
                timestamp,
                ssrc: self.ssrc,
            };
            self.first = false;
            self.sequence = self.sequence.wrapping_add(1);

            let mut packet = Vec::with_capacity(
                super::rtp::RTP_HEADER_LEN + frame_bytes / 2 * units.len() * spec.codec.sample_width(),
            );
            header.write(&mut packet);
            interleave(&units, spec.codec, &mut packet);
            return Some(packet);
        }
        None
    }
}

/// Handle to a running worker thread.
pub(crate) struct WorkerHandle {
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Signals the worker to stop and waits for it. Idempotent.
    pub(crate) fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("pipeline worker panicked");
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Sockets {
    rx: Option<Box<dyn RxSocket>>,
    tx: Option<Box<dyn TxSocket>>,
}

async fn open_sockets(network: &dyn Network, spec: &PipelineSpec) -> Result<Sockets, PipelineError> {
    let rx = match spec.rx {
        Some(addr) => Some(
            network
                .open_rx(addr, spec.interface)
                .await
                .map_err(|e| PipelineError::transport(addr, e))?,
        ),
        None => None,
    };
    let tx = match spec.tx {
        Some(addr) => Some(
            network
                .open_tx(addr, spec.interface, spec.multicast_loop)
                .await
                .map_err(|e| PipelineError::transport(addr, e))?,
        ),
        None => None,
    };
    Ok(Sockets { rx, tx })
}

/// Starts the worker thread and waits until its sockets are open.
pub(crate) fn spawn(
    shared: Arc<Shared>,
    network: Arc<dyn Network>,
    framer: TxFramer,
    notices: NoticeSender,
) -> Result<WorkerHandle, PipelineError> {
    let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), PipelineError>>(1);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let name = format!("aes67-{}", shared.spec.stream);
    let thread = std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = ready_tx.send(Err(PipelineError::WorkerStart {
                        reason: e.to_string(),
                    }));
                    return;
                }
            };

            runtime.block_on(async move {
                let sockets = match open_sockets(network.as_ref(), &shared.spec).await {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                run(shared, sockets, framer, notices, stop_rx).await;
            });
        })
        .map_err(|e| PipelineError::WorkerStart {
            reason: e.to_string(),
        })?;

    let mut handle = WorkerHandle {
        stop: Some(stop_tx),
        thread: Some(thread),
    };

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => {
            handle.stop();
            Err(e)
        }
        Err(_) => {
            handle.stop();
            Err(PipelineError::WorkerStart {
                reason: "worker exited during startup".into(),
            })
        }
    }
}

async fn run(
    shared: Arc<Shared>,
    sockets: Sockets,
    framer: TxFramer,
    notices: NoticeSender,
    stop: oneshot::Receiver<()>,
) {
    let mut loops: Vec<BoxFuture<'static, ()>> = vec![async move {
        let _ = stop.await;
    }
    .boxed()];

    if let Some(socket) = sockets.rx {
        loops.push(rx_loop(shared.clone(), socket, notices.clone()).boxed());
        loops.push(clock_loop(shared.clone(), notices.clone()).boxed());
    }
    if let Some(socket) = sockets.tx {
        loops.push(tx_loop(shared.clone(), socket, framer, notices).boxed());
    }

    let _ = select_all(loops).await;
    tracing::debug!(stream = %shared.spec.stream, "pipeline worker exiting");
}

async fn rx_loop(shared: Arc<Shared>, mut socket: Box<dyn RxSocket>, notices: NoticeSender) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv(&mut buf).await {
            Ok((n, from)) => shared.on_packet(&buf[..n], from),
            Err(e) => {
                shared.fault(&notices, format!("receive failed: {e}"));
                return;
            }
        }
    }
}

async fn tx_loop(
    shared: Arc<Shared>,
    socket: Box<dyn TxSocket>,
    mut framer: TxFramer,
    notices: NoticeSender,
) {
    let frame = Duration::from_millis(u64::from(shared.spec.frame_ms));
    let mut tick = tokio::time::interval(frame);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tick.tick().await;
        if !shared.moving_media() {
            framer.discard();
            continue;
        }
        for _ in 0..MAX_FRAMES_PER_TICK {
            let Some(packet) = framer.next_packet(&shared) else {
                break;
            };
            if let Err(e) = socket.send(&packet).await {
                shared.fault(&notices, format!("send failed: {e}"));
                return;
            }
            shared.packets_sent.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn clock_loop(shared: Arc<Shared>, notices: NoticeSender) {
    let mut tick = tokio::time::interval(SYNTHETIC_TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tick.tick().await;
        if shared.feed_clock() {
            tracing::info!(stream = %shared.spec.stream, "synthetic clock synced");
            if notices.try_send(PipelineNotice::ClockSynced).is_err() {
                tracing::warn!(stream = %shared.spec.stream, "notice channel full, clock sync not reported");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ClockSource, ManualClock};
    use crate::config::{Codec, MediaAddress, StreamConfig};
    use ringbuf::traits::{Producer, Split};
    use ringbuf::HeapRb;
    use std::net::Ipv4Addr;

    fn spec(channels: usize) -> PipelineSpec {
        PipelineSpec::from_config(&StreamConfig {
            name: "s1".into(),
            rx: Some(MediaAddress::new(Ipv4Addr::new(239, 69, 0, 1), 5004)),
            tx: Some(MediaAddress::new(Ipv4Addr::new(239, 69, 0, 2), 5004)),
            sample_rate: 8000,
            channels,
            ..Default::default()
        })
    }

    fn shared(channels: usize, clock: ClockSource) -> Shared {
        let spec = spec(channels);
        let graph = Graph::build(
            spec.stream.clone(),
            channels,
            spec.queue_bytes(),
            spec.max_unit_bytes(),
            4,
        )
        .unwrap();
        let clock = ClockSync::new(clock, spec.sample_rate);
        Shared::new(spec, graph, clock)
    }

    fn external() -> ClockSource {
        ClockSource::External(Arc::new(ManualClock::new(Duration::from_secs(1))))
    }

    fn packet(sequence: u16, timestamp: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        RtpHeader {
            marker: false,
            payload_type: 96,
            sequence,
            timestamp,
            ssrc: 1,
        }
        .write(&mut out);
        out.extend_from_slice(payload);
        out
    }

    fn from() -> SocketAddr {
        "10.0.0.5:5004".parse().unwrap()
    }

    #[test]
    fn test_packet_reaches_open_channel() {
        let shared = shared(1, external());
        shared.set_state(PipelineState::Playing);
        shared.graph.set_drop(0, false).unwrap();

        shared.on_packet(&packet(1, 0, &[0x12, 0x34, 0x56, 0x78]), from());
        let mut out = [0u8; 4];
        let n = shared.graph.sink(0, None).unwrap().pull(&mut out);
        assert_eq!(n, 4);
        assert_eq!(out, [0x34, 0x12, 0x78, 0x56]);
        assert_eq!(shared.last_rx().unwrap().1, from());
    }

    #[test]
    fn test_wrong_payload_type_is_counted() {
        let shared = shared(1, external());
        shared.set_state(PipelineState::Playing);
        let mut bad = packet(1, 0, &[0, 0]);
        bad[1] = 0;
        shared.on_packet(&bad, from());
        shared.on_packet(&[1, 2, 3], from());

        let stats = shared.rtp_stats();
        assert_eq!(stats.wrong_payload_type, 1);
        assert_eq!(stats.malformed, 1);
        assert!(shared.last_rx().is_none());
    }

    #[test]
    fn test_unsynced_clock_holds_media_back() {
        let shared = shared(1, ClockSource::Synthetic);
        shared.set_state(PipelineState::Playing);
        shared.graph.set_drop(0, false).unwrap();

        shared.on_packet(&packet(1, 0, &[0, 1]), from());
        let mut out = [0u8; 2];
        assert_eq!(shared.graph.sink(0, None).unwrap().pull(&mut out), 0);
        // The arrival is still observed
        assert_eq!(shared.rtp_stats().packets_received, 1);
        assert!(shared.observation.lock().is_some());
    }

    #[test]
    fn test_source_seeds_differ_per_pipeline() {
        let seeds: std::collections::HashSet<u64> = (0..8).map(|_| source_seed("s1")).collect();
        assert_eq!(seeds.len(), 8);

        let (_p, a) = HeapRb::<u8>::new(64).split();
        let (_q, b) = HeapRb::<u8>::new(64).split();
        assert_ne!(TxFramer::new("s1", vec![a]).ssrc, TxFramer::new("s1", vec![b]).ssrc);
    }

    #[test]
    fn test_framer_pads_and_interleaves() {
        let shared = shared(2, external());
        let frame = shared.spec.frame_bytes();
        let (mut p0, c0) = HeapRb::<u8>::new(frame * 3).split();
        let (_p1, c1) = HeapRb::<u8>::new(frame * 3).split();
        let mut framer = TxFramer::new("s1", vec![c0, c1]);

        assert!(framer.next_packet(&shared).is_none());
        p0.push_slice(&vec![0x11; frame]);

        let packet = framer.next_packet(&shared).unwrap();
        let (header, payload) = RtpHeader::parse(&packet).unwrap();
        assert!(header.marker);
        assert_eq!(header.payload_type, 96);
        assert_eq!(payload.len(), frame * 2);
        assert_eq!(&payload[..4], &[0x11, 0x11, 0, 0]);
        assert!(framer.next_packet(&shared).is_none());
    }

    #[test]
    fn test_framer_sequence_and_valve() {
        let shared = shared(1, external());
        let frame = shared.spec.frame_bytes();
        let (mut prod, cons) = HeapRb::<u8>::new(frame * 3).split();
        let mut framer = TxFramer::new("s1", vec![cons]);

        prod.push_slice(&vec![0; frame * 2]);
        let a = RtpHeader::parse(&framer.next_packet(&shared).unwrap()).unwrap().0;
        let b = RtpHeader::parse(&framer.next_packet(&shared).unwrap()).unwrap().0;
        assert_eq!(b.sequence, a.sequence.wrapping_add(1));
        assert!(!b.marker);

        shared.tx_valve.set(true);
        prod.push_slice(&vec![0; frame * 2]);
        assert!(framer.next_packet(&shared).is_none());
        assert_eq!(shared.tx_valve.dropped(), 2);
    }

    #[test]
    fn test_rtp_timestamp_follows_clock() {
        let shared = shared(1, external());
        let frame = shared.spec.frame_bytes();
        let (mut prod, cons) = HeapRb::<u8>::new(frame * 3).split();
        let mut framer = TxFramer::new("s1", vec![cons]);
        prod.push_slice(&vec![0; frame]);

        let header = RtpHeader::parse(&framer.next_packet(&shared).unwrap()).unwrap().0;
        // 1s at 8kHz plus one 20ms frame
        assert_eq!(header.timestamp, 8000 + 160);
        assert_eq!(shared.spec.codec, Codec::L16);
    }
}
