//! Backup sender monitor.
//!
//! A backup instance transmits the same stream as a primary. While the
//! primary's packets are seen on the transmit destination, the backup mutes
//! its own transmitter; once they stop for longer than the idle wait, it
//! unmutes. A short overlap during handover is accepted.

use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::clock::{ClockSource, SystemClock};
use crate::config::StreamConfig;
use crate::event::MuxEvent;
use crate::pipeline::{notice_channel, NoticeReceiver, Pipeline, PipelineSpec};
use crate::stream::SharedStream;
use crate::PipelineError;

/// A change the monitor wants applied to the transmit valve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxTransition {
    /// Another sender is active: stop transmitting.
    Mute,
    /// The other sender went quiet: resume transmitting.
    Unmute,
}

/// The mute/unmute decision, separated from timers and sockets.
#[derive(Debug, Default)]
pub struct BackupMonitor {
    muted: bool,
}

impl BackupMonitor {
    /// Creates an unmuted monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the transmitter is currently muted.
    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Evaluates one observation.
    ///
    /// `delta` is the distance between the observing clock and the last
    /// packet seen from another sender (`None` if nothing was ever seen).
    /// `forced_off` is the operator's own tx-flow switch; while it is off
    /// the monitor never unmutes.
    pub fn update(
        &mut self,
        delta: Option<Duration>,
        threshold: Duration,
        forced_off: bool,
    ) -> Option<TxTransition> {
        let active = delta.is_some_and(|d| d < threshold);
        if active && !self.muted {
            self.muted = true;
            Some(TxTransition::Mute)
        } else if !active && self.muted && !forced_off {
            self.muted = false;
            Some(TxTransition::Unmute)
        } else {
            None
        }
    }
}

#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    /// Sleeps for `timeout` unless stopped first. Returns true if stopped.
    fn wait(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            let _ = self.wake.wait_for(&mut stopped, timeout);
        }
        *stopped
    }

    fn stop(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }
}

/// Handle on a running monitor thread.
pub(crate) struct BackupHandle {
    signal: Arc<StopSignal>,
    thread: Option<JoinHandle<()>>,
}

impl BackupHandle {
    /// Starts observing `config.tx` on behalf of `stream`.
    pub(crate) fn spawn(stream: &Arc<SharedStream>, config: &StreamConfig) -> Result<Self, PipelineError> {
        let spec = PipelineSpec::observer(config);
        let (notices, faults) = notice_channel();
        let observer = stream.factory().create(
            spec,
            ClockSource::External(Arc::new(SystemClock::new())),
            notices,
        )?;

        let signal = Arc::new(StopSignal::default());
        let weak = Arc::downgrade(stream);
        let idle_wait = config.idle_wait();
        let thread_signal = signal.clone();
        let thread = std::thread::Builder::new()
            .name(format!("aes67-backup-{}", config.name))
            .spawn(move || run(weak, observer, faults, idle_wait, &thread_signal))
            .map_err(|e| PipelineError::WorkerStart {
                reason: e.to_string(),
            })?;

        tracing::info!(stream = %config.name, ?idle_wait, "backup monitor started");
        Ok(Self {
            signal,
            thread: Some(thread),
        })
    }

    /// Stops the monitor and waits for it.
    pub(crate) fn stop(&mut self) {
        self.signal.stop();
        if let Some(thread) = self.thread.take() {
            // The last stream reference may be dropped on the monitor itself
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                tracing::error!("backup monitor panicked");
            }
        }
    }
}

impl Drop for BackupHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    stream: Weak<SharedStream>,
    observer: Box<dyn Pipeline>,
    mut faults: NoticeReceiver,
    idle_wait: Duration,
    signal: &StopSignal,
) {
    let mut monitor = BackupMonitor::new();
    while !signal.wait(idle_wait) {
        let Some(stream) = stream.upgrade() else {
            break;
        };
        while let Ok(notice) = faults.try_recv() {
            tracing::warn!(stream = %stream.id(), ?notice, "backup observer notice");
        }

        let now = observer.clock_time();
        let last = observer.last_rx();
        let delta = last.map(|(at, _)| if now > at { now - at } else { at - now });
        let forced_off = !stream.tx_flow();

        match monitor.update(delta, idle_wait, forced_off) {
            Some(TxTransition::Mute) => {
                let source = last.map(|(_, from)| from);
                tracing::info!(stream = %stream.id(), ?source, "other sender active, muting tx");
                stream.set_backup_muted(true);
                stream.emit(MuxEvent::TxMuted {
                    stream: stream.id().clone(),
                    source,
                });
            }
            Some(TxTransition::Unmute) => {
                tracing::info!(stream = %stream.id(), ?delta, "other sender idle, unmuting tx");
                stream.set_backup_muted(false);
                stream.emit(MuxEvent::TxUnmuted {
                    stream: stream.id().clone(),
                });
            }
            None => {}
        }
    }
    observer.destroy();
}
