//! RTP/UDP implementation of [`Pipeline`].

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ringbuf::traits::{Producer, Split};
use ringbuf::{HeapProd, HeapRb};

use super::graph::Graph;
use super::network::Network;
use super::worker::{self, Shared, TxFramer, WorkerHandle};
use super::{
    NoticeSender, Pipeline, PipelineFactory, PipelineSpec, PipelineState, PipelineStats,
    PushOutcome,
};
use crate::clock::{ClockSource, ClockSync};
use crate::session::SessionId;
use crate::PipelineError;

/// A stream's pipeline: receive graph, transmit rings and a worker thread.
pub struct RtpPipeline {
    shared: Arc<Shared>,
    tx_rings: Vec<Mutex<HeapProd<u8>>>,
    worker: Mutex<WorkerHandle>,
}

impl RtpPipeline {
    /// Builds the graph, opens the sockets and starts moving media.
    pub fn start(
        spec: PipelineSpec,
        clock: ClockSource,
        network: Arc<dyn Network>,
        notices: NoticeSender,
    ) -> Result<Self, PipelineError> {
        if spec.rx.is_none() && spec.tx.is_none() {
            return Err(PipelineError::NoPath {
                direction: "receive or transmit",
            });
        }

        let graph = Graph::build(
            spec.stream.clone(),
            spec.channels,
            spec.queue_bytes(),
            spec.max_unit_bytes(),
            spec.max_branches,
        )?;

        let mut producers = Vec::new();
        let mut consumers = Vec::new();
        if spec.tx.is_some() {
            for _ in 0..spec.channels {
                let (prod, cons) = HeapRb::<u8>::new(spec.tx_buffer_bytes()).split();
                producers.push(Mutex::new(prod));
                consumers.push(cons);
            }
        }

        let clock = ClockSync::new(clock, spec.sample_rate);
        let framer = TxFramer::new(spec.stream.as_str(), consumers);
        let shared = Arc::new(Shared::new(spec, graph, clock));

        let handle = worker::spawn(shared.clone(), network, framer, notices)?;
        shared.set_state(PipelineState::Playing);

        tracing::info!(
            stream = %shared.spec.stream,
            channels = shared.spec.channels,
            rx = ?shared.spec.rx,
            tx = ?shared.spec.tx,
            synced = shared.clock.is_synced(),
            "pipeline started"
        );

        Ok(Self {
            shared,
            tx_rings: producers,
            worker: Mutex::new(handle),
        })
    }

    fn check_channel(&self, channel: usize) -> Result<(), PipelineError> {
        if channel < self.shared.spec.channels {
            Ok(())
        } else {
            Err(PipelineError::ChannelNotFound {
                channel,
                channels: self.shared.spec.channels,
            })
        }
    }
}

impl Pipeline for RtpPipeline {
    fn spec(&self) -> &PipelineSpec {
        &self.shared.spec
    }

    fn state(&self) -> PipelineState {
        self.shared.state()
    }

    fn push(&self, channel: usize, bytes: &[u8]) -> Result<PushOutcome, PipelineError> {
        self.check_channel(channel)?;
        let ring = self.tx_rings.get(channel).ok_or(PipelineError::NoPath {
            direction: "transmit",
        })?;
        if !self.shared.moving_media() {
            return Ok(PushOutcome::Paced);
        }

        let written = ring.lock().push_slice(bytes);
        if written < bytes.len() {
            let lost = (bytes.len() - written) as u64;
            self.shared.tx_overflow_bytes.fetch_add(lost, Ordering::Relaxed);
            tracing::trace!(stream = %self.shared.spec.stream, channel, lost, "tx buffer full");
        }
        Ok(PushOutcome::Queued)
    }

    fn pull(&self, channel: usize, buf: &mut [u8], session: Option<SessionId>) -> usize {
        match self.shared.graph.sink(channel, session) {
            Some(sink) => sink.pull(buf),
            None => 0,
        }
    }

    fn set_clock(&self, clock: ClockSource) {
        let previous = self.shared.state();
        if previous == PipelineState::Stopped {
            return;
        }
        self.shared.set_state(PipelineState::Paused);
        self.shared.clock.install(clock);
        self.shared.set_state(previous);
        tracing::info!(
            stream = %self.shared.spec.stream,
            mode = ?self.shared.clock.mode(),
            "clock source switched"
        );
    }

    fn set_drop(&self, channel: Option<usize>, drop: bool) -> Result<(), PipelineError> {
        match channel {
            None => {
                if self.tx_rings.is_empty() {
                    return Err(PipelineError::NoPath {
                        direction: "transmit",
                    });
                }
                self.shared.tx_valve.set(drop);
                Ok(())
            }
            Some(channel) => {
                if self.shared.spec.rx.is_none() {
                    return Err(PipelineError::NoPath {
                        direction: "receive",
                    });
                }
                self.shared.graph.set_drop(channel, drop)
            }
        }
    }

    fn stats(&self) -> PipelineStats {
        let shared = &self.shared;
        PipelineStats {
            state: shared.state(),
            clock: shared.clock.stats(),
            rtp: shared.rtp_stats(),
            packets_sent: shared.packets_sent.load(Ordering::Relaxed),
            tx_dropped_frames: shared.tx_valve.dropped(),
            tx_overflow_bytes: shared.tx_overflow_bytes.load(Ordering::Relaxed),
            tx_dropping: shared.tx_valve.is_dropping(),
            channels: shared.graph.channel_stats(),
            branches: shared.graph.branch_count(),
        }
    }

    fn attach_branch(&self, channel: usize, session: SessionId) -> Result<(), PipelineError> {
        if self.shared.spec.rx.is_none() {
            return Err(PipelineError::NoPath {
                direction: "receive",
            });
        }
        self.shared.graph.attach(channel, session, self.shared.state())
    }

    fn detach_branch(&self, channel: usize, session: SessionId) -> Result<(), PipelineError> {
        self.shared.graph.detach(channel, session)
    }

    fn is_clock_synced(&self) -> bool {
        self.shared.clock.is_synced()
    }

    fn clock_time(&self) -> Duration {
        self.shared.clock.now()
    }

    fn last_rx(&self) -> Option<(Duration, SocketAddr)> {
        self.shared.last_rx()
    }

    fn destroy(&self) {
        if self.shared.state() == PipelineState::Stopped {
            return;
        }
        self.shared.set_state(PipelineState::Stopped);
        self.shared.graph.close();
        self.worker.lock().stop();
        tracing::info!(stream = %self.shared.spec.stream, "pipeline destroyed");
    }
}

impl Drop for RtpPipeline {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Builds [`RtpPipeline`]s on a given network.
#[derive(Clone)]
pub struct RtpPipelineFactory {
    network: Arc<dyn Network>,
}

impl RtpPipelineFactory {
    /// Creates a factory whose pipelines use `network`.
    pub fn new(network: Arc<dyn Network>) -> Self {
        Self { network }
    }
}

impl PipelineFactory for RtpPipelineFactory {
    fn create(
        &self,
        spec: PipelineSpec,
        clock: ClockSource,
        notices: NoticeSender,
    ) -> Result<Box<dyn Pipeline>, PipelineError> {
        let pipeline = RtpPipeline::start(spec, clock, self.network.clone(), notices)?;
        Ok(Box::new(pipeline))
    }
}
