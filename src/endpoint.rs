//! Endpoints: the fixed input/output channels a call session plugs into.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::{ChannelRef, EndpointConfig};
use crate::stream::{SharedStream, StreamId};
use crate::MuxError;

/// A channel of a specific stream.
#[derive(Clone)]
pub struct ChannelBinding {
    /// The stream carrying the channel.
    pub stream: Arc<SharedStream>,
    /// Channel index within the stream.
    pub channel: usize,
}

impl ChannelBinding {
    fn resolve(
        endpoint: &str,
        reference: &ChannelRef,
        streams: &HashMap<StreamId, Arc<SharedStream>>,
    ) -> Result<Self, MuxError> {
        let stream = streams
            .get(reference.stream.as_str())
            .ok_or_else(|| MuxError::UnknownStream {
                name: reference.stream.clone(),
            })?;
        if reference.channel >= stream.config().channels {
            return Err(MuxError::config_invalid(
                endpoint,
                format!("channel {reference} out of range"),
            ));
        }
        Ok(Self {
            stream: stream.clone(),
            channel: reference.channel,
        })
    }
}

impl fmt::Debug for ChannelBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.stream.id(), self.channel)
    }
}

impl fmt::Display for ChannelBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.stream.id(), self.channel)
    }
}

/// A named pair of at most one input and one output channel.
#[derive(Debug)]
pub struct Endpoint {
    name: String,
    input: Option<ChannelBinding>,
    output: Option<ChannelBinding>,
    active_listeners: AtomicUsize,
    sessions_in_call: AtomicUsize,
}

impl Endpoint {
    /// Creates an endpoint over already resolved channels.
    pub fn new(
        name: impl Into<String>,
        input: Option<ChannelBinding>,
        output: Option<ChannelBinding>,
    ) -> Self {
        Self {
            name: name.into(),
            input,
            output,
            active_listeners: AtomicUsize::new(0),
            sessions_in_call: AtomicUsize::new(0),
        }
    }

    /// Resolves an endpoint definition against the registered streams.
    pub fn from_config(
        config: &EndpointConfig,
        streams: &HashMap<StreamId, Arc<SharedStream>>,
    ) -> Result<Self, MuxError> {
        let input = config
            .input
            .as_ref()
            .map(|r| ChannelBinding::resolve(&config.name, r, streams))
            .transpose()?;
        let output = config
            .output
            .as_ref()
            .map(|r| ChannelBinding::resolve(&config.name, r, streams))
            .transpose()?;
        Ok(Self::new(config.name.clone(), input, output))
    }

    /// Endpoint name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Channel sessions read from.
    pub fn input(&self) -> Option<&ChannelBinding> {
        self.input.as_ref()
    }

    /// Channel sessions write to.
    pub fn output(&self) -> Option<&ChannelBinding> {
        self.output.as_ref()
    }

    /// True if either side uses `stream`.
    pub fn uses(&self, stream: &StreamId) -> bool {
        self.input.iter().chain(&self.output).any(|b| b.stream.id() == stream)
    }

    /// Sessions currently consuming the input.
    pub fn active_listeners(&self) -> usize {
        self.active_listeners.load(Ordering::Acquire)
    }

    /// Sessions currently in an active call on this endpoint.
    pub fn sessions_in_call(&self) -> usize {
        self.sessions_in_call.load(Ordering::Acquire)
    }

    /// Whether a reload must leave this endpoint alone.
    ///
    /// An endpoint without an input stream is never busy.
    pub fn is_busy(&self) -> bool {
        self.input.is_some() && self.sessions_in_call() > 0
    }

    /// Sample rate used to pace silence.
    pub(crate) fn sample_rate(&self) -> u32 {
        self.input
            .iter()
            .chain(&self.output)
            .map(|b| b.stream.sample_rate())
            .next()
            .unwrap_or(crate::config::MIN_SAMPLE_RATE)
    }

    pub(crate) fn enter_call(&self) {
        self.sessions_in_call.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn leave_call(&self) {
        let _ = self
            .sessions_in_call
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub(crate) fn add_listener(&self) {
        self.active_listeners.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn remove_listener(&self) {
        let _ = self
            .active_listeners
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::{MediaAddress, StreamConfig};
    use crate::pipeline::{MemoryNetwork, RtpPipelineFactory};
    use std::net::Ipv4Addr;

    fn streams() -> HashMap<StreamId, Arc<SharedStream>> {
        let config = StreamConfig {
            name: "s1".into(),
            rx: Some(MediaAddress::new(Ipv4Addr::new(239, 69, 4, 1), 5004)),
            channels: 2,
            ..Default::default()
        };
        let stream = SharedStream::new(
            config,
            Arc::new(RtpPipelineFactory::new(Arc::new(MemoryNetwork::new()))),
            Arc::new(SystemClock::new()),
            None,
        );
        HashMap::from([(stream.id().clone(), stream)])
    }

    #[test]
    fn test_from_config_resolves_channels() {
        let streams = streams();
        let config = EndpointConfig {
            name: "desk".into(),
            input: Some(ChannelRef::new("s1", 1)),
            output: None,
        };
        let endpoint = Endpoint::from_config(&config, &streams).unwrap();
        assert_eq!(endpoint.input().unwrap().to_string(), "s1:1");
        assert!(endpoint.output().is_none());
        assert!(endpoint.uses(&StreamId::new("s1")));
    }

    #[test]
    fn test_unknown_stream() {
        let config = EndpointConfig {
            name: "desk".into(),
            input: Some(ChannelRef::new("nope", 0)),
            output: None,
        };
        assert!(matches!(
            Endpoint::from_config(&config, &streams()),
            Err(MuxError::UnknownStream { .. })
        ));
    }

    #[test]
    fn test_busy_check_is_null_safe() {
        let streams = streams();
        let output_only = Endpoint::new("out", None, None);
        output_only.enter_call();
        assert!(!output_only.is_busy());

        let config = EndpointConfig {
            name: "desk".into(),
            input: Some(ChannelRef::new("s1", 0)),
            output: None,
        };
        let endpoint = Endpoint::from_config(&config, &streams).unwrap();
        assert!(!endpoint.is_busy());
        endpoint.enter_call();
        assert!(endpoint.is_busy());
        endpoint.leave_call();
        endpoint.leave_call();
        assert_eq!(endpoint.sessions_in_call(), 0);
    }
}
