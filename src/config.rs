//! Configuration types for streams and endpoints.
//!
//! All types deserialize with `serde` so the host can load them from whatever
//! file format it already uses. Missing fields take the defaults below.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::MuxError;

/// Maximum number of channels a single stream can carry.
pub const MAX_CHANNELS: usize = 8;

/// Lowest accepted sample rate; lower values are raised to this.
pub const MIN_SAMPLE_RATE: u32 = 8000;

/// Frame durations must be strictly below this many milliseconds.
pub const MAX_FRAME_MS: u32 = 120;

/// Default RTP port for AES67 streams.
pub const DEFAULT_RTP_PORT: u16 = 5004;

/// Fixed-width linear PCM codecs carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Codec {
    /// 16-bit big-endian linear PCM.
    #[default]
    L16,
    /// 24-bit big-endian linear PCM.
    L24,
}

impl Codec {
    /// Bytes per sample on the wire.
    #[must_use]
    pub fn sample_width(&self) -> usize {
        match self {
            Self::L16 => 2,
            Self::L24 => 3,
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::L16 => write!(f, "L16"),
            Self::L24 => write!(f, "L24"),
        }
    }
}

/// A multicast (or unicast) address and port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub struct MediaAddress {
    /// Group or host address.
    pub ip: IpAddr,
    /// UDP port.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    DEFAULT_RTP_PORT
}

impl MediaAddress {
    /// Creates an address from its parts.
    pub fn new(ip: impl Into<IpAddr>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    /// Returns the address as a socket address.
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for MediaAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Configuration of one shared stream.
///
/// # Example
///
/// ```
/// use aes67_mux::{MediaAddress, StreamConfig};
/// use std::net::Ipv4Addr;
///
/// let config = StreamConfig {
///     name: "studio".into(),
///     rx: Some(MediaAddress::new(Ipv4Addr::new(239, 69, 1, 1), 5004)),
///     sample_rate: 48000,
///     channels: 2,
///     ..Default::default()
/// };
/// assert_eq!(config.samples_per_frame(), 960);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Unique stream name.
    pub name: String,

    /// Address to receive from. A stream needs `rx`, `tx`, or both.
    pub rx: Option<MediaAddress>,

    /// Address to transmit to.
    pub tx: Option<MediaAddress>,

    /// Sample rate in Hz.
    ///
    /// Default: 8000
    pub sample_rate: u32,

    /// Frame duration in milliseconds. Must divide 1000 and stay below
    /// [`MAX_FRAME_MS`].
    ///
    /// Default: 20
    pub frame_ms: u32,

    /// Number of channels, `1..=MAX_CHANNELS`.
    ///
    /// Default: 1
    pub channels: usize,

    /// Wire codec.
    pub codec: Codec,

    /// Extra RTP timestamp offset in milliseconds, added on top of one frame.
    pub rtp_ts_offset_ms: u32,

    /// Local interface used to join multicast groups.
    pub interface: Option<Ipv4Addr>,

    /// RTP payload type.
    ///
    /// Default: 96
    pub payload_type: u8,

    /// Receive latency budget in milliseconds. Sizes the per-branch queues.
    ///
    /// Default: 10
    pub jitter_latency_ms: u32,

    /// Whether the transmit valve is open when the stream starts.
    ///
    /// Default: true
    pub tx_flow: bool,

    /// Whether more than one session may listen to the same input channel.
    ///
    /// Default: false
    pub multi_listen: bool,

    /// Derive the clock from received RTP timestamps instead of using the
    /// externally supplied clock.
    pub synthetic_clock: bool,

    /// Run as a backup sender: watch the `tx` destination and mute while
    /// another sender is active there.
    pub backup_sender: bool,

    /// Idle threshold for the backup sender monitor, in milliseconds.
    ///
    /// Default: 1000
    pub idle_wait_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            rx: None,
            tx: None,
            sample_rate: MIN_SAMPLE_RATE,
            frame_ms: 20,
            channels: 1,
            codec: Codec::L16,
            rtp_ts_offset_ms: 0,
            interface: None,
            payload_type: 96,
            jitter_latency_ms: 10,
            tx_flow: true,
            multi_listen: false,
            synthetic_clock: false,
            backup_sender: false,
            idle_wait_ms: 1000,
        }
    }
}

impl StreamConfig {
    /// Samples per channel in one frame.
    #[must_use]
    pub fn samples_per_frame(&self) -> usize {
        (self.frame_ms as usize * self.sample_rate as usize) / 1000
    }

    /// Bytes of S16LE audio per channel in one frame, as seen by sessions.
    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        self.samples_per_frame() * 2
    }

    /// Frame duration.
    #[must_use]
    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(u64::from(self.frame_ms))
    }

    /// Idle threshold of the backup sender monitor.
    #[must_use]
    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    /// Checks the definition, normalizing the sample rate.
    ///
    /// A sample rate below [`MIN_SAMPLE_RATE`] is raised with a warning;
    /// everything else that is out of range rejects the stream.
    pub fn validate(&mut self) -> Result<(), MuxError> {
        if self.name.is_empty() {
            return Err(MuxError::config_invalid("<unnamed>", "stream has no name"));
        }
        if self.name.contains(':') {
            return Err(MuxError::config_invalid(&self.name, "stream name contains ':'"));
        }
        if self.rx.is_none() && self.tx.is_none() {
            return Err(MuxError::config_invalid(
                &self.name,
                "stream needs an rx or tx address",
            ));
        }
        if self.sample_rate < MIN_SAMPLE_RATE {
            tracing::warn!(
                stream = %self.name,
                sample_rate = self.sample_rate,
                "sample rate below minimum, using {MIN_SAMPLE_RATE}"
            );
            self.sample_rate = MIN_SAMPLE_RATE;
        }
        if self.frame_ms == 0 || 1000 % self.frame_ms != 0 || self.frame_ms >= MAX_FRAME_MS {
            return Err(MuxError::config_invalid(
                &self.name,
                format!(
                    "frame duration {}ms must divide 1000 and be below {MAX_FRAME_MS}ms",
                    self.frame_ms
                ),
            ));
        }
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(MuxError::config_invalid(
                &self.name,
                format!("channel count {} outside 1..={MAX_CHANNELS}", self.channels),
            ));
        }
        if self.payload_type > 127 {
            return Err(MuxError::config_invalid(
                &self.name,
                format!("payload type {} is not a 7-bit value", self.payload_type),
            ));
        }
        Ok(())
    }
}

/// A `stream:channel` reference used by endpoint definitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct ChannelRef {
    /// Name of the referenced stream.
    pub stream: String,
    /// Channel index within the stream.
    pub channel: usize,
}

impl ChannelRef {
    /// Creates a reference to `channel` of `stream`.
    pub fn new(stream: impl Into<String>, channel: usize) -> Self {
        Self {
            stream: stream.into(),
            channel,
        }
    }
}

impl FromStr for ChannelRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (stream, channel) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("'{s}' is not in stream:channel form"))?;
        if stream.is_empty() {
            return Err(format!("'{s}' has an empty stream name"));
        }
        let channel = channel
            .parse()
            .map_err(|_| format!("'{s}' has an invalid channel index"))?;
        Ok(Self::new(stream, channel))
    }
}

impl TryFrom<String> for ChannelRef {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.stream, self.channel)
    }
}

/// Configuration of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Unique endpoint name.
    pub name: String,
    /// Channel this endpoint reads from.
    pub input: Option<ChannelRef>,
    /// Channel this endpoint writes to.
    pub output: Option<ChannelRef>,
}

/// Top-level multiplexer configuration.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Shared stream definitions.
    pub streams: Vec<StreamConfig>,
    /// Endpoint definitions.
    pub endpoints: Vec<EndpointConfig>,
    /// Endpoint used when a session opens without a name.
    pub default_endpoint: Option<String>,
    /// Emit per-session audio level events.
    pub level_report: bool,
}

/// Result of validating a [`MuxConfig`].
///
/// Invalid entries are skipped, never fatal; they are listed in `rejected`.
#[derive(Debug, Default)]
pub struct ValidatedConfig {
    /// Streams that passed validation.
    pub streams: Vec<StreamConfig>,
    /// Endpoints that passed validation against the valid streams.
    pub endpoints: Vec<EndpointConfig>,
    /// One `ConfigInvalid` error per skipped entry.
    pub rejected: Vec<MuxError>,
}

impl MuxConfig {
    /// Validates all entries, skipping and logging the invalid ones.
    #[must_use]
    pub fn validate(&self) -> ValidatedConfig {
        let mut out = ValidatedConfig::default();
        let mut names = HashSet::new();

        for stream in &self.streams {
            let mut stream = stream.clone();
            let result = stream.validate().and_then(|()| {
                if names.insert(stream.name.clone()) {
                    Ok(())
                } else {
                    Err(MuxError::config_invalid(&stream.name, "duplicate stream name"))
                }
            });
            match result {
                Ok(()) => out.streams.push(stream),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping stream");
                    out.rejected.push(e);
                }
            }
        }

        let mut endpoint_names = HashSet::new();
        for endpoint in &self.endpoints {
            let result = validate_endpoint(endpoint, &out.streams).and_then(|()| {
                if endpoint_names.insert(endpoint.name.clone()) {
                    Ok(())
                } else {
                    Err(MuxError::config_invalid(&endpoint.name, "duplicate endpoint name"))
                }
            });
            match result {
                Ok(()) => out.endpoints.push(endpoint.clone()),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping endpoint");
                    out.rejected.push(e);
                }
            }
        }

        out
    }
}

/// Checks an endpoint against the set of valid streams.
pub(crate) fn validate_endpoint(
    endpoint: &EndpointConfig,
    streams: &[StreamConfig],
) -> Result<(), MuxError> {
    let invalid = |reason: String| MuxError::config_invalid(&endpoint.name, reason);
    let find = |r: &ChannelRef| {
        streams
            .iter()
            .find(|s| s.name == r.stream)
            .ok_or_else(|| invalid(format!("unknown stream '{}'", r.stream)))
    };

    if endpoint.name.is_empty() {
        return Err(MuxError::config_invalid("<unnamed>", "endpoint has no name"));
    }
    if endpoint.input.is_none() && endpoint.output.is_none() {
        return Err(invalid("endpoint needs an input or an output".into()));
    }

    let input = match &endpoint.input {
        Some(r) => {
            let stream = find(r)?;
            if stream.rx.is_none() {
                return Err(invalid(format!("stream '{}' has no rx address", r.stream)));
            }
            if r.channel >= stream.channels {
                return Err(invalid(format!("input channel {r} out of range")));
            }
            Some(stream)
        }
        None => None,
    };

    let output = match &endpoint.output {
        Some(r) => {
            let stream = find(r)?;
            if stream.tx.is_none() {
                return Err(invalid(format!("stream '{}' has no tx address", r.stream)));
            }
            if r.channel >= stream.channels {
                return Err(invalid(format!("output channel {r} out of range")));
            }
            Some(stream)
        }
        None => None,
    };

    if let (Some(i), Some(o)) = (input, output) {
        if i.sample_rate != o.sample_rate || i.frame_ms != o.frame_ms {
            return Err(invalid(format!(
                "input '{}' ({}Hz/{}ms) and output '{}' ({}Hz/{}ms) differ",
                i.name, i.sample_rate, i.frame_ms, o.name, o.sample_rate, o.frame_ms
            )));
        }
    }

    Ok(())
}
