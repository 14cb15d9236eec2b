//! The multiplexer context: registries of streams, endpoints and sessions.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::branch;
use crate::clock::{ClockSource, MediaClock};
use crate::config::{EndpointConfig, MuxConfig, StreamConfig};
use crate::endpoint::{ChannelBinding, Endpoint};
use crate::event::{EventCallback, MuxEvent};
use crate::pipeline::{PipelineFactory, PipelineNotice};
use crate::session::{CallSession, SessionId, SessionRegistry};
use crate::stream::{Direction, ReloadOutcome, SharedStream, StreamId};
use crate::MuxError;

/// Produces a fresh configuration for `reloadconf`.
pub type ConfigLoader = Arc<dyn Fn() -> Result<MuxConfig, MuxError> + Send + Sync>;

/// What a configuration load changed.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Streams registered for the first time.
    pub added: Vec<StreamId>,
    /// Streams whose pipeline was rebuilt or settings updated.
    pub reloaded: Vec<StreamId>,
    /// Streams torn down and removed.
    pub removed: Vec<StreamId>,
    /// Streams dropped from the configuration but still in use.
    pub deferred: Vec<StreamId>,
    /// Endpoints left untouched because a call is active on them.
    pub busy_endpoints: Vec<String>,
    /// Entries skipped as invalid, plus failed rebuilds.
    pub rejected: Vec<MuxError>,
}

#[derive(Default)]
struct Registry {
    streams: HashMap<StreamId, Arc<SharedStream>>,
    endpoints: HashMap<String, (EndpointConfig, Arc<Endpoint>)>,
    default_endpoint: Option<String>,
}

/// Owns every stream, endpoint and session of one multiplexer.
///
/// Built with [`MuxBuilder`](crate::MuxBuilder). All methods take `&self`;
/// the call core may share the context across its session threads.
pub struct MuxContext {
    factory: Arc<dyn PipelineFactory>,
    clock: Arc<dyn MediaClock>,
    events: Option<EventCallback>,
    loader: Option<ConfigLoader>,
    registry: RwLock<Registry>,
    retired: Mutex<Vec<Arc<SharedStream>>>,
    sessions: SessionRegistry,
    clock_stats: AtomicBool,
    level_report: AtomicBool,
    reload_lock: Mutex<()>,
}

impl MuxContext {
    pub(crate) fn new(
        factory: Arc<dyn PipelineFactory>,
        clock: Arc<dyn MediaClock>,
        events: Option<EventCallback>,
        loader: Option<ConfigLoader>,
    ) -> Self {
        Self {
            factory,
            clock,
            events,
            loader,
            registry: RwLock::new(Registry::default()),
            retired: Mutex::new(Vec::new()),
            sessions: SessionRegistry::new(),
            clock_stats: AtomicBool::new(false),
            level_report: AtomicBool::new(false),
            reload_lock: Mutex::new(()),
        }
    }

    fn emit(&self, event: MuxEvent) {
        if let Some(events) = &self.events {
            events(event);
        }
    }

    /// Applies a configuration.
    ///
    /// New streams are registered, changed streams reloaded in place and
    /// streams no longer configured removed, or retired until their last
    /// session ends. Endpoints with an active call keep their current
    /// definition. Invalid entries are skipped and reported.
    pub fn load(&self, config: &MuxConfig) -> LoadReport {
        let _serial = self.reload_lock.lock();
        let validated = config.validate();
        let mut report = LoadReport {
            rejected: validated.rejected,
            ..Default::default()
        };

        let (mut streams, old_endpoints) = {
            let registry = self.registry.read();
            (registry.streams.clone(), registry.endpoints.clone())
        };

        let wanted: HashSet<&str> = validated.streams.iter().map(|s| s.name.as_str()).collect();
        for stream_config in &validated.streams {
            self.load_stream(stream_config, &mut streams, &mut report);
        }

        let gone: Vec<StreamId> = streams
            .keys()
            .filter(|id| !wanted.contains(id.as_str()))
            .cloned()
            .collect();
        for id in gone {
            if let Some(stream) = streams.remove(&id) {
                self.remove_stream(stream, &mut report);
            }
        }

        let endpoints = self.load_endpoints(&validated.endpoints, old_endpoints, &streams, &mut report);

        {
            let mut registry = self.registry.write();
            registry.streams = streams;
            registry.endpoints = endpoints;
            registry.default_endpoint = config.default_endpoint.clone();
        }
        self.level_report.store(config.level_report, Ordering::Release);

        tracing::info!(
            added = report.added.len(),
            reloaded = report.reloaded.len(),
            removed = report.removed.len(),
            deferred = report.deferred.len(),
            rejected = report.rejected.len(),
            "configuration loaded"
        );
        report
    }

    fn load_stream(
        &self,
        config: &StreamConfig,
        streams: &mut HashMap<StreamId, Arc<SharedStream>>,
        report: &mut LoadReport,
    ) {
        let id = StreamId::new(config.name.as_str());
        let existing = streams.get(&id).cloned().or_else(|| self.take_retired(&id));

        let Some(stream) = existing else {
            let stream = SharedStream::new(
                config.clone(),
                self.factory.clone(),
                self.clock.clone(),
                self.events.clone(),
            );
            tracing::info!(stream = %id, "stream registered");
            streams.insert(id.clone(), stream);
            report.added.push(id);
            return;
        };

        streams.insert(id.clone(), stream.clone());
        match stream.reload(config.clone()) {
            Ok(ReloadOutcome::Unchanged) => {}
            Ok(_) => report.reloaded.push(id),
            Err(e) => {
                tracing::warn!(stream = %id, error = %e, "stream reload failed");
                report.rejected.push(e);
            }
        }
    }

    fn take_retired(&self, id: &StreamId) -> Option<Arc<SharedStream>> {
        let mut retired = self.retired.lock();
        let index = retired.iter().position(|s| s.id() == id)?;
        let stream = retired.swap_remove(index);
        stream.revive();
        tracing::info!(stream = %id, "retired stream back in configuration");
        Some(stream)
    }

    fn remove_stream(&self, stream: Arc<SharedStream>, report: &mut LoadReport) {
        let id = stream.id().clone();
        if stream.is_idle() {
            stream.teardown();
            self.emit(MuxEvent::StreamRemoved { stream: id.clone() });
            report.removed.push(id);
        } else {
            tracing::info!(stream = %id, "stream in use, removal deferred");
            stream.retire();
            self.retired.lock().push(stream);
            report.deferred.push(id);
        }
    }

    fn load_endpoints(
        &self,
        configs: &[EndpointConfig],
        mut old: HashMap<String, (EndpointConfig, Arc<Endpoint>)>,
        streams: &HashMap<StreamId, Arc<SharedStream>>,
        report: &mut LoadReport,
    ) -> HashMap<String, (EndpointConfig, Arc<Endpoint>)> {
        let mut endpoints = HashMap::new();

        for config in configs {
            if let Some((old_config, endpoint)) = old.remove(&config.name) {
                if endpoint.is_busy() {
                    if old_config != *config {
                        let e = MuxError::busy(&config.name, "endpoint in an active call");
                        tracing::warn!(error = %e, "endpoint left unchanged");
                        report.busy_endpoints.push(config.name.clone());
                    }
                    endpoints.insert(config.name.clone(), (old_config, endpoint));
                    continue;
                }
                if old_config == *config && still_bound(&endpoint, streams) {
                    endpoints.insert(config.name.clone(), (old_config, endpoint));
                    continue;
                }
            }

            match Endpoint::from_config(config, streams) {
                Ok(endpoint) => {
                    endpoints.insert(config.name.clone(), (config.clone(), Arc::new(endpoint)));
                }
                Err(e) => {
                    tracing::warn!(endpoint = %config.name, error = %e, "skipping endpoint");
                    report.rejected.push(e);
                }
            }
        }

        // Removed endpoints stay until their call ends
        for (name, entry) in old {
            if entry.1.is_busy() {
                tracing::warn!(endpoint = %name, "endpoint in an active call, removal deferred");
                report.busy_endpoints.push(name.clone());
                endpoints.insert(name, entry);
            }
        }

        endpoints
    }

    /// Reloads from the configured loader.
    pub fn reload(&self) -> Result<LoadReport, MuxError> {
        let loader = self
            .loader
            .as_ref()
            .ok_or_else(|| MuxError::config_invalid("reloadconf", "no configuration source"))?;
        let config = loader()?;
        Ok(self.load(&config))
    }

    /// Opens a session on an endpoint.
    ///
    /// `target` is an endpoint name, a direct `stream[:channel]` reference,
    /// or `None` for the default endpoint. No channel is claimed until
    /// [`activate`](Self::activate).
    pub fn open(&self, id: SessionId, target: Option<&str>) -> Result<Arc<CallSession>, MuxError> {
        let endpoint = self.resolve(target)?;
        let session = Arc::new(CallSession::new(
            id,
            endpoint,
            self.level_report.load(Ordering::Acquire),
            self.events.clone(),
        ));
        self.sessions.insert(session.clone())?;
        tracing::debug!(session = %id, endpoint = session.endpoint().name(), "session opened");
        Ok(session)
    }

    fn resolve(&self, target: Option<&str>) -> Result<Arc<Endpoint>, MuxError> {
        let registry = self.registry.read();
        let name = match target {
            Some(name) => name,
            None => registry
                .default_endpoint
                .as_deref()
                .ok_or_else(|| MuxError::UnknownEndpoint {
                    name: "<default>".into(),
                })?,
        };
        if let Some((_, endpoint)) = registry.endpoints.get(name) {
            return Ok(endpoint.clone());
        }
        if target.is_none() {
            return Err(MuxError::UnknownEndpoint { name: name.into() });
        }

        let (stream_name, channel) = match name.rsplit_once(':') {
            Some((stream, channel)) => match channel.parse() {
                Ok(channel) => (stream, channel),
                Err(_) => return Err(MuxError::UnknownEndpoint { name: name.into() }),
            },
            None => (name, 0),
        };
        let stream = registry
            .streams
            .get(stream_name)
            .ok_or_else(|| MuxError::UnknownEndpoint { name: name.into() })?;
        direct_endpoint(name, stream, channel).map(Arc::new)
    }

    /// Starts audio for an answered call: claims the endpoint's channels
    /// and, on a multi-listener input, attaches the session's branch.
    ///
    /// Idempotent. On failure nothing stays claimed.
    pub fn activate(&self, id: SessionId) -> Result<(), MuxError> {
        let session = self.session(id)?;
        if session.is_in_call() {
            return Ok(());
        }
        let endpoint = session.endpoint().clone();

        if let Some(input) = endpoint.input() {
            input.stream.acquire_channel(input.channel, Direction::Input)?;
            session.set_input_held(true);
            endpoint.add_listener();
            if input.stream.config().multi_listen {
                let guard = input.stream.read();
                session.set_branch(branch::attach(&guard, input.channel, id));
            }
        }

        if let Some(output) = endpoint.output() {
            if let Err(e) = output.stream.acquire_channel(output.channel, Direction::Output) {
                self.release_input(&session);
                return Err(e);
            }
            session.set_output_held(true);
        }

        endpoint.enter_call();
        session.set_in_call(true);
        tracing::info!(session = %id, endpoint = endpoint.name(), branch = session.has_branch(), "call active");
        Ok(())
    }

    fn release_input(&self, session: &CallSession) {
        let Some(input) = session.endpoint().input() else {
            return;
        };
        if !session.input_held() {
            return;
        }
        if session.has_branch() {
            let guard = input.stream.read();
            branch::detach(&guard, input.channel, session.id());
            session.set_branch(false);
        }
        input.stream.release_channel(input.channel, Direction::Input);
        session.endpoint().remove_listener();
        session.set_input_held(false);
    }

    /// Ends a session: detaches its branch, gives its channels back and
    /// finally removes streams that were only kept alive for it.
    pub fn teardown(&self, id: SessionId) -> Result<(), MuxError> {
        let session = self
            .sessions
            .remove(id)
            .ok_or(MuxError::UnknownSession { id: id.get() })?;

        self.release_input(&session);
        if session.output_held() {
            if let Some(output) = session.endpoint().output() {
                output.stream.release_channel(output.channel, Direction::Output);
            }
            session.set_output_held(false);
        }
        if session.is_in_call() {
            session.endpoint().leave_call();
            session.set_in_call(false);
        }
        tracing::debug!(session = %id, "session torn down");

        self.reap_retired();
        Ok(())
    }

    fn reap_retired(&self) {
        let idle: Vec<Arc<SharedStream>> = {
            let mut retired = self.retired.lock();
            let (idle, busy): (Vec<_>, Vec<_>) = retired.drain(..).partition(|s| s.is_idle());
            *retired = busy;
            idle
        };
        for stream in idle {
            stream.teardown();
            tracing::info!(stream = %stream.id(), "retired stream removed");
            self.emit(MuxEvent::StreamRemoved {
                stream: stream.id().clone(),
            });
        }
    }

    /// Handles pending pipeline notices of every stream.
    ///
    /// A runtime fault discards the stream's pipeline and hangs up every
    /// session using the stream. Returns the number of notices handled.
    pub fn supervise(&self) -> usize {
        let mut handled = 0;
        for stream in self.all_streams() {
            for notice in stream.drain_notices() {
                handled += 1;
                match notice {
                    PipelineNotice::Fault { reason } => self.on_fault(&stream, &reason),
                    PipelineNotice::ClockSynced => {
                        tracing::info!(stream = %stream.id(), "clock synced");
                        self.emit(MuxEvent::ClockSynced {
                            stream: stream.id().clone(),
                        });
                    }
                }
            }
            if self.clock_stats.load(Ordering::Acquire) {
                if let Some(stats) = stream.stats() {
                    self.emit(MuxEvent::ClockStats {
                        stream: stream.id().clone(),
                        stats: stats.clock,
                    });
                }
            }
        }
        handled
    }

    fn on_fault(&self, stream: &Arc<SharedStream>, reason: &str) {
        tracing::warn!(stream = %stream.id(), reason, "runtime fault, hanging up sessions");
        stream.discard_pipeline();
        self.emit(MuxEvent::RuntimeFault {
            stream: stream.id().clone(),
            reason: reason.to_owned(),
        });
        for session in self.sessions.all() {
            if session.endpoint().uses(stream.id()) && session.hang_up(reason) {
                self.emit(MuxEvent::SessionHungUp {
                    session: session.id(),
                    reason: reason.to_owned(),
                });
            }
        }
    }

    /// Runs [`supervise`](Self::supervise) every `interval` on the current
    /// tokio runtime until the context is dropped.
    pub fn spawn_supervisor(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(context) = weak.upgrade() else {
                    break;
                };
                // Discarding a pipeline joins its worker thread
                if tokio::task::spawn_blocking(move || context.supervise())
                    .await
                    .is_err()
                {
                    tracing::error!("supervisor pass panicked");
                }
            }
        })
    }

    /// Replaces the clock of a stream.
    pub fn switch_clock(&self, stream: &str, source: ClockSource) -> Result<(), MuxError> {
        self.stream(stream)?.switch_clock(source);
        Ok(())
    }

    /// Turns a stream's transmitter on or off.
    pub fn set_tx_flow(&self, stream: &str, on: bool) -> Result<(), MuxError> {
        self.stream(stream)?.set_tx_flow(on)
    }

    /// Enables or disables periodic clock statistics events.
    pub fn set_clock_stats(&self, on: bool) {
        self.clock_stats.store(on, Ordering::Release);
    }

    /// Whether clock statistics events are enabled.
    pub fn clock_stats_enabled(&self) -> bool {
        self.clock_stats.load(Ordering::Acquire)
    }

    /// A registered stream by name.
    pub fn stream(&self, name: &str) -> Result<Arc<SharedStream>, MuxError> {
        self.registry
            .read()
            .streams
            .get(name)
            .cloned()
            .ok_or_else(|| MuxError::UnknownStream { name: name.into() })
    }

    /// Registered streams sorted by name, followed by retired ones.
    pub fn streams(&self) -> Vec<Arc<SharedStream>> {
        let mut streams: Vec<_> = self.registry.read().streams.values().cloned().collect();
        streams.sort_by(|a, b| a.id().cmp(b.id()));
        streams.extend(self.retired.lock().iter().cloned());
        streams
    }

    fn all_streams(&self) -> Vec<Arc<SharedStream>> {
        self.streams()
    }

    /// A registered endpoint by name.
    pub fn endpoint(&self, name: &str) -> Result<Arc<Endpoint>, MuxError> {
        self.registry
            .read()
            .endpoints
            .get(name)
            .map(|(_, e)| e.clone())
            .ok_or_else(|| MuxError::UnknownEndpoint { name: name.into() })
    }

    /// Registered endpoints sorted by name.
    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        let mut endpoints: Vec<_> = self
            .registry
            .read()
            .endpoints
            .values()
            .map(|(_, e)| e.clone())
            .collect();
        endpoints.sort_by(|a, b| a.name().cmp(b.name()));
        endpoints
    }

    /// An open session by id.
    pub fn session(&self, id: SessionId) -> Result<Arc<CallSession>, MuxError> {
        self.sessions
            .get(id)
            .ok_or(MuxError::UnknownSession { id: id.get() })
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Hangs up every session and tears down every stream.
    pub fn shutdown(&self) {
        for session in self.sessions.all() {
            if session.hang_up("shutdown") {
                self.emit(MuxEvent::SessionHungUp {
                    session: session.id(),
                    reason: "shutdown".into(),
                });
            }
            if let Err(e) = self.teardown(session.id()) {
                tracing::debug!(session = %session.id(), error = %e, "session already gone");
            }
        }
        let streams: Vec<_> = {
            let mut registry = self.registry.write();
            registry.endpoints.clear();
            registry.streams.drain().map(|(_, s)| s).collect()
        };
        for stream in streams.into_iter().chain(self.retired.lock().drain(..)) {
            stream.teardown();
        }
        tracing::info!("multiplexer shut down");
    }
}

impl std::fmt::Debug for MuxContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.read();
        f.debug_struct("MuxContext")
            .field("streams", &registry.streams.len())
            .field("endpoints", &registry.endpoints.len())
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

/// True if every stream the endpoint is bound to is still the registered one.
fn still_bound(endpoint: &Endpoint, streams: &HashMap<StreamId, Arc<SharedStream>>) -> bool {
    endpoint
        .input()
        .into_iter()
        .chain(endpoint.output())
        .all(|b| streams.get(b.stream.id()).is_some_and(|s| Arc::ptr_eq(s, &b.stream)))
}

/// An ad-hoc endpoint on one channel of a stream, both ways where possible.
fn direct_endpoint(name: &str, stream: &Arc<SharedStream>, channel: usize) -> Result<Endpoint, MuxError> {
    let config = stream.config();
    if channel >= config.channels {
        return Err(MuxError::config_invalid(
            name,
            format!("stream has {} channels", config.channels),
        ));
    }
    let binding = || ChannelBinding {
        stream: stream.clone(),
        channel,
    };
    Ok(Endpoint::new(
        name,
        config.rx.is_some().then(binding),
        config.tx.is_some().then(binding),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::{ChannelRef, MediaAddress};
    use crate::pipeline::{MemoryNetwork, RtpPipelineFactory};
    use std::net::Ipv4Addr;

    fn context() -> MuxContext {
        MuxContext::new(
            Arc::new(RtpPipelineFactory::new(Arc::new(MemoryNetwork::new()))),
            Arc::new(SystemClock::new()),
            None,
            None,
        )
    }

    fn stream_config(name: &str, last_octet: u8) -> StreamConfig {
        StreamConfig {
            name: name.into(),
            rx: Some(MediaAddress::new(Ipv4Addr::new(239, 69, 6, last_octet), 5004)),
            tx: Some(MediaAddress::new(Ipv4Addr::new(239, 69, 7, last_octet), 5004)),
            channels: 2,
            ..Default::default()
        }
    }

    fn config() -> MuxConfig {
        MuxConfig {
            streams: vec![stream_config("s1", 1)],
            endpoints: vec![EndpointConfig {
                name: "desk".into(),
                input: Some(ChannelRef::new("s1", 0)),
                output: Some(ChannelRef::new("s1", 1)),
            }],
            default_endpoint: Some("desk".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_load_registers_streams_and_endpoints() {
        let ctx = context();
        let report = ctx.load(&config());
        assert_eq!(report.added, vec![StreamId::new("s1")]);
        assert!(report.rejected.is_empty());
        assert_eq!(ctx.streams().len(), 1);
        assert_eq!(ctx.endpoints()[0].name(), "desk");

        // Loading the same configuration again changes nothing
        let report = ctx.load(&config());
        assert!(report.added.is_empty() && report.reloaded.is_empty());
    }

    #[test]
    fn test_open_resolves_targets() {
        let ctx = context();
        ctx.load(&config());

        let default = ctx.open(SessionId::new(1), None).unwrap();
        assert_eq!(default.endpoint().name(), "desk");

        let direct = ctx.open(SessionId::new(2), Some("s1:1")).unwrap();
        assert_eq!(direct.endpoint().input().unwrap().channel, 1);
        assert_eq!(direct.endpoint().output().unwrap().channel, 1);

        let bare = ctx.open(SessionId::new(3), Some("s1")).unwrap();
        assert_eq!(bare.endpoint().input().unwrap().channel, 0);

        assert!(matches!(
            ctx.open(SessionId::new(4), Some("s1:9")),
            Err(MuxError::ConfigInvalid { .. })
        ));
        assert!(matches!(
            ctx.open(SessionId::new(4), Some("nowhere")),
            Err(MuxError::UnknownEndpoint { .. })
        ));
        assert!(matches!(
            ctx.open(SessionId::new(1), Some("desk")),
            Err(MuxError::SessionExists { id: 1 })
        ));
    }

    #[test]
    fn test_activate_and_teardown_claim_and_release() {
        let ctx = context();
        ctx.load(&config());
        let session = ctx.open(SessionId::new(1), Some("desk")).unwrap();
        ctx.activate(session.id()).unwrap();
        ctx.activate(session.id()).unwrap();

        let stream = ctx.stream("s1").unwrap();
        assert_eq!(stream.inputs_in_use(), vec![(0, 1)]);
        assert_eq!(stream.outputs_in_use(), vec![1]);
        assert!(ctx.endpoint("desk").unwrap().is_busy());

        ctx.teardown(session.id()).unwrap();
        assert!(stream.is_idle());
        assert!(!ctx.endpoint("desk").unwrap().is_busy());
        assert!(matches!(
            ctx.teardown(session.id()),
            Err(MuxError::UnknownSession { id: 1 })
        ));
    }

    #[test]
    fn test_failed_output_claim_rolls_back_input() {
        let ctx = context();
        ctx.load(&config());
        let first = ctx.open(SessionId::new(1), Some("s1:1")).unwrap();
        ctx.activate(first.id()).unwrap();

        // desk reads channel 0 but writes channel 1, which is taken
        let second = ctx.open(SessionId::new(2), Some("desk")).unwrap();
        assert!(matches!(
            ctx.activate(second.id()),
            Err(MuxError::ResourceBusy { .. })
        ));
        let stream = ctx.stream("s1").unwrap();
        assert_eq!(stream.inputs_in_use(), vec![(1, 1)]);
        assert!(!second.is_in_call());
    }

    #[test]
    fn test_in_use_stream_removal_is_deferred() {
        let ctx = context();
        ctx.load(&config());
        let session = ctx.open(SessionId::new(1), Some("desk")).unwrap();
        ctx.activate(session.id()).unwrap();

        let report = ctx.load(&MuxConfig::default());
        assert_eq!(report.deferred, vec![StreamId::new("s1")]);
        assert_eq!(report.busy_endpoints, vec!["desk".to_string()]);
        assert!(matches!(ctx.stream("s1"), Err(MuxError::UnknownStream { .. })));
        assert!(session.endpoint().input().unwrap().stream.is_retired());

        ctx.teardown(session.id()).unwrap();
        assert!(ctx.streams().is_empty());
    }

    #[test]
    fn test_busy_endpoint_keeps_definition() {
        let ctx = context();
        ctx.load(&config());
        let session = ctx.open(SessionId::new(1), None).unwrap();
        ctx.activate(session.id()).unwrap();

        let mut next = config();
        next.endpoints[0].output = None;
        let report = ctx.load(&next);
        assert_eq!(report.busy_endpoints, vec!["desk".to_string()]);
        assert!(ctx.endpoint("desk").unwrap().output().is_some());

        ctx.teardown(session.id()).unwrap();
        ctx.load(&next);
        assert!(ctx.endpoint("desk").unwrap().output().is_none());
    }

    #[test]
    fn test_reload_without_loader_fails() {
        let ctx = context();
        assert!(matches!(ctx.reload(), Err(MuxError::ConfigInvalid { .. })));
    }
}
