//! Builder pattern for `MuxContext`.

use std::sync::Arc;

use crate::clock::{MediaClock, SystemClock};
use crate::config::MuxConfig;
use crate::context::{ConfigLoader, LoadReport, MuxContext};
use crate::pipeline::{Network, PipelineFactory, RtpPipelineFactory, UdpNetwork};
use crate::{event_callback, EventCallback, MuxError, MuxEvent};

/// Builder for a [`MuxContext`].
///
/// # Example
///
/// ```
/// use aes67_mux::{MemoryNetwork, Mux, MuxConfig};
///
/// let (context, report) = Mux::builder()
///     .network(MemoryNetwork::new())
///     .config(MuxConfig::default())
///     .on_event(|e| eprintln!("{e:?}"))
///     .build()
///     .unwrap();
/// assert!(report.rejected.is_empty());
/// assert_eq!(context.session_count(), 0);
/// ```
pub struct MuxBuilder {
    factory: Option<Arc<dyn PipelineFactory>>,
    network: Option<Arc<dyn Network>>,
    clock: Option<Arc<dyn MediaClock>>,
    config: Option<MuxConfig>,
    loader: Option<ConfigLoader>,
    event_callback: Option<EventCallback>,
    clock_stats: bool,
}

impl MuxBuilder {
    /// Creates a builder with the UDP network and a free-running clock.
    pub fn new() -> Self {
        Self {
            factory: None,
            network: None,
            clock: None,
            config: None,
            loader: None,
            event_callback: None,
            clock_stats: false,
        }
    }

    /// Network the default RTP pipelines use.
    #[must_use]
    pub fn network(mut self, network: impl Network + 'static) -> Self {
        self.network = Some(Arc::new(network));
        self
    }

    /// Replaces the pipeline implementation altogether.
    ///
    /// Takes precedence over [`network`](Self::network).
    #[must_use]
    pub fn pipeline_factory(mut self, factory: Arc<dyn PipelineFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// External media clock, typically PTP-disciplined.
    ///
    /// Streams without a synthetic clock run on it.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn MediaClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Configuration applied by [`build`](Self::build).
    #[must_use]
    pub fn config(mut self, config: MuxConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Source of configuration for [`MuxContext::reload`].
    ///
    /// Without an explicit [`config`](Self::config), `build` loads from it
    /// too.
    #[must_use]
    pub fn config_loader<F>(mut self, loader: F) -> Self
    where
        F: Fn() -> Result<MuxConfig, MuxError> + Send + Sync + 'static,
    {
        self.loader = Some(Arc::new(loader));
        self
    }

    /// Emit clock statistics events from the supervisor.
    #[must_use]
    pub fn clock_stats(mut self, on: bool) -> Self {
        self.clock_stats = on;
        self
    }

    /// Set a callback for runtime events.
    ///
    /// The callback runs on session threads and the supervisor. Keep it
    /// fast.
    #[must_use]
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(MuxEvent) + Send + Sync + 'static,
    {
        self.event_callback = Some(event_callback(callback));
        self
    }

    /// Builds the context and applies the initial configuration.
    ///
    /// Invalid entries do not fail the build; they are listed in the
    /// returned report. Only a failing config loader does.
    pub fn build(self) -> Result<(MuxContext, LoadReport), MuxError> {
        let factory: Arc<dyn PipelineFactory> = match (self.factory, self.network) {
            (Some(factory), _) => factory,
            (None, Some(network)) => Arc::new(RtpPipelineFactory::new(network)),
            (None, None) => Arc::new(RtpPipelineFactory::new(Arc::new(UdpNetwork))),
        };
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()));

        let config = match (self.config, &self.loader) {
            (Some(config), _) => config,
            (None, Some(loader)) => loader()?,
            (None, None) => MuxConfig::default(),
        };

        let context = MuxContext::new(factory, clock, self.event_callback, self.loader);
        context.set_clock_stats(self.clock_stats);
        let report = context.load(&config);
        Ok((context, report))
    }
}

impl Default for MuxBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Main entry point for aes67-mux.
///
/// Use [`Mux::builder()`] to start configuring a multiplexer.
pub struct Mux;

impl Mux {
    /// Creates a new builder.
    pub fn builder() -> MuxBuilder {
        MuxBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MediaAddress, StreamConfig};
    use crate::pipeline::MemoryNetwork;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn stream(name: &str) -> StreamConfig {
        StreamConfig {
            name: name.into(),
            rx: Some(MediaAddress::new(Ipv4Addr::new(239, 69, 8, 1), 5004)),
            ..Default::default()
        }
    }

    #[test]
    fn test_builder_default() {
        let builder = MuxBuilder::new();
        assert!(builder.config.is_none());
        assert!(builder.event_callback.is_none());
        assert!(!builder.clock_stats);
    }

    #[test]
    fn test_build_applies_config() {
        let (context, report) = Mux::builder()
            .network(MemoryNetwork::new())
            .config(MuxConfig {
                streams: vec![stream("s1"), stream("")],
                ..Default::default()
            })
            .clock_stats(true)
            .build()
            .unwrap();
        assert_eq!(report.added.len(), 1);
        assert_eq!(report.rejected.len(), 1);
        assert!(context.clock_stats_enabled());
    }

    #[test]
    fn test_build_uses_loader() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let (context, report) = Mux::builder()
            .network(MemoryNetwork::new())
            .config_loader(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(MuxConfig {
                    streams: vec![stream("s1")],
                    ..Default::default()
                })
            })
            .build()
            .unwrap();
        assert_eq!(report.added.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let report = context.reload().unwrap();
        assert!(report.added.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_loader_failure_fails_build() {
        let result = Mux::builder()
            .network(MemoryNetwork::new())
            .config_loader(|| Err(MuxError::config_invalid("mux.toml", "unreadable")))
            .build();
        assert!(matches!(result, Err(MuxError::ConfigInvalid { .. })));
    }
}
