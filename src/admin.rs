//! Administrative commands.
//!
//! A line-oriented command surface for operators. Every command reports
//! plain success or failure with human-readable output; none panics.

use std::fmt::{self, Write as _};
use std::str::FromStr;

use crate::context::MuxContext;
use crate::stream::StreamState;

/// A parsed administrative command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    /// List streams with their state and channel usage.
    Streams,
    /// List endpoints with their bindings and usage.
    Endpoints,
    /// Turn periodic clock statistics on or off.
    ClockStats(bool),
    /// Show receive statistics of a stream.
    RtpStats(String),
    /// Turn a stream's transmitter on or off.
    TxFlow(String, bool),
    /// Reload the configuration from its source.
    ReloadConf,
}

fn on_off(word: Option<&str>) -> Result<bool, String> {
    match word {
        Some("on") => Ok(true),
        Some("off") => Ok(false),
        Some(other) => Err(format!("expected on or off, got '{other}'")),
        None => Err("expected on or off".into()),
    }
}

impl FromStr for AdminCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let command = words.next().ok_or("empty command")?;
        let parsed = match command {
            "streams" => Self::Streams,
            "endpoints" => Self::Endpoints,
            "clockstats" => Self::ClockStats(on_off(words.next())?),
            "rtpstats" => Self::RtpStats(words.next().ok_or("usage: rtpstats <stream>")?.to_owned()),
            "txflow" => {
                let stream = words.next().ok_or("usage: txflow <stream> on|off")?;
                Self::TxFlow(stream.to_owned(), on_off(words.next())?)
            }
            "reloadconf" => Self::ReloadConf,
            other => return Err(format!("unknown command '{other}'")),
        };
        if let Some(extra) = words.next() {
            return Err(format!("unexpected argument '{extra}'"));
        }
        Ok(parsed)
    }
}

/// Result of an administrative command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminReply {
    /// Whether the command succeeded.
    pub success: bool,
    /// Command output or failure reason.
    pub output: String,
}

impl AdminReply {
    fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    fn fail(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

impl fmt::Display for AdminReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.success { "OK" } else { "FAILED" };
        if self.output.is_empty() {
            write!(f, "{status}")
        } else {
            write!(f, "{status}: {}", self.output)
        }
    }
}

impl MuxContext {
    /// Parses and runs one command line.
    pub fn admin(&self, line: &str) -> AdminReply {
        match line.parse::<AdminCommand>() {
            Ok(command) => self.run_admin(&command),
            Err(reason) => AdminReply::fail(reason),
        }
    }

    /// Runs a parsed command.
    pub fn run_admin(&self, command: &AdminCommand) -> AdminReply {
        tracing::debug!(?command, "admin command");
        match command {
            AdminCommand::Streams => AdminReply::ok(self.describe_streams()),
            AdminCommand::Endpoints => AdminReply::ok(self.describe_endpoints()),
            AdminCommand::ClockStats(on) => {
                self.set_clock_stats(*on);
                AdminReply::ok(format!("clock stats {}", if *on { "on" } else { "off" }))
            }
            AdminCommand::RtpStats(name) => match self.stream(name) {
                Ok(stream) => match stream.stats() {
                    Some(stats) => {
                        let rtp = stats.rtp;
                        AdminReply::ok(format!(
                            "{name}: received={} bytes={} lost={} reordered={} malformed={} \
                             wrong_pt={} jitter={:.3}ms sent={} tx_dropped={}",
                            rtp.packets_received,
                            rtp.bytes_received,
                            rtp.packets_lost,
                            rtp.out_of_order,
                            rtp.malformed,
                            rtp.wrong_payload_type,
                            rtp.jitter_ms,
                            stats.packets_sent,
                            stats.tx_dropped_frames,
                        ))
                    }
                    None => AdminReply::fail(format!("{name}: no pipeline")),
                },
                Err(e) => AdminReply::fail(e.to_string()),
            },
            AdminCommand::TxFlow(name, on) => match self.set_tx_flow(name, *on) {
                Ok(()) => AdminReply::ok(format!("{name}: tx {}", if *on { "on" } else { "off" })),
                Err(e) => AdminReply::fail(e.to_string()),
            },
            AdminCommand::ReloadConf => match self.reload() {
                Ok(report) => AdminReply::ok(format!(
                    "added={} reloaded={} removed={} deferred={} busy={} rejected={}",
                    report.added.len(),
                    report.reloaded.len(),
                    report.removed.len(),
                    report.deferred.len(),
                    report.busy_endpoints.len(),
                    report.rejected.len(),
                )),
                Err(e) => AdminReply::fail(e.to_string()),
            },
        }
    }

    fn describe_streams(&self) -> String {
        let mut out = String::new();
        for stream in self.streams() {
            let config = stream.config();
            let state = match stream.state() {
                StreamState::Unconfigured => "idle",
                StreamState::Active => "active",
                StreamState::Reloading => "reloading",
                StreamState::TornDown => "torn-down",
            };
            let addr = |a: Option<crate::config::MediaAddress>| {
                a.map_or_else(|| "-".to_owned(), |a| a.to_string())
            };
            let _ = writeln!(
                out,
                "{} {state}{} rx={} tx={} {}Hz {}ms {}ch {} inputs={:?} outputs={:?} tx_flow={} muted={}",
                stream.id(),
                if stream.is_retired() { " retired" } else { "" },
                addr(config.rx),
                addr(config.tx),
                config.sample_rate,
                config.frame_ms,
                config.channels,
                config.codec,
                stream.inputs_in_use(),
                stream.outputs_in_use(),
                if stream.tx_flow() { "on" } else { "off" },
                if stream.is_backup_muted() { "yes" } else { "no" },
            );
        }
        out
    }

    fn describe_endpoints(&self) -> String {
        let mut out = String::new();
        for endpoint in self.endpoints() {
            let side = |b: Option<&crate::endpoint::ChannelBinding>| {
                b.map_or_else(|| "-".to_owned(), ToString::to_string)
            };
            let _ = writeln!(
                out,
                "{} in={} out={} listeners={} calls={}",
                endpoint.name(),
                side(endpoint.input()),
                side(endpoint.output()),
                endpoint.active_listeners(),
                endpoint.sessions_in_call(),
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelRef, EndpointConfig, MediaAddress, MuxConfig, StreamConfig};
    use crate::pipeline::MemoryNetwork;
    use crate::session::SessionId;
    use crate::Mux;
    use std::net::Ipv4Addr;

    fn context() -> MuxContext {
        let config = MuxConfig {
            streams: vec![StreamConfig {
                name: "s1".into(),
                rx: Some(MediaAddress::new(Ipv4Addr::new(239, 69, 9, 1), 5004)),
                tx: Some(MediaAddress::new(Ipv4Addr::new(239, 69, 9, 2), 5004)),
                ..Default::default()
            }],
            endpoints: vec![EndpointConfig {
                name: "desk".into(),
                input: Some(ChannelRef::new("s1", 0)),
                output: Some(ChannelRef::new("s1", 0)),
            }],
            ..Default::default()
        };
        Mux::builder()
            .network(MemoryNetwork::new())
            .config(config)
            .build()
            .unwrap()
            .0
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!("streams".parse(), Ok(AdminCommand::Streams));
        assert_eq!("clockstats on".parse(), Ok(AdminCommand::ClockStats(true)));
        assert_eq!(
            "txflow s1 off".parse(),
            Ok(AdminCommand::TxFlow("s1".into(), false))
        );
        assert_eq!("rtpstats s1".parse(), Ok(AdminCommand::RtpStats("s1".into())));
        assert!("txflow s1".parse::<AdminCommand>().is_err());
        assert!("clockstats maybe".parse::<AdminCommand>().is_err());
        assert!("streams now".parse::<AdminCommand>().is_err());
        assert!("".parse::<AdminCommand>().is_err());
        assert!("reboot".parse::<AdminCommand>().is_err());
    }

    #[test]
    fn test_listing_commands() {
        let ctx = context();
        let reply = ctx.admin("streams");
        assert!(reply.success);
        assert!(reply.output.starts_with("s1 idle"));

        let reply = ctx.admin("endpoints");
        assert!(reply.output.contains("desk in=s1:0 out=s1:0 listeners=0 calls=0"));
    }

    #[test]
    fn test_clockstats_toggle() {
        let ctx = context();
        assert!(ctx.admin("clockstats on").success);
        assert!(ctx.clock_stats_enabled());
        assert!(ctx.admin("clockstats off").success);
        assert!(!ctx.clock_stats_enabled());
    }

    #[test]
    fn test_rtpstats_needs_pipeline() {
        let ctx = context();
        assert!(!ctx.admin("rtpstats s1").success);
        assert!(!ctx.admin("rtpstats nope").success);

        let session = ctx.open(SessionId::new(1), Some("desk")).unwrap();
        ctx.activate(session.id()).unwrap();
        let reply = ctx.admin("rtpstats s1");
        assert!(reply.success, "{reply}");
        assert!(reply.output.contains("received=0"));
    }

    #[test]
    fn test_txflow() {
        let ctx = context();
        let reply = ctx.admin("txflow s1 off");
        assert_eq!(reply.to_string(), "OK: s1: tx off");
        assert!(!ctx.stream("s1").unwrap().tx_flow());
        assert!(!ctx.admin("txflow nope on").success);
    }

    #[test]
    fn test_reloadconf_without_source_fails() {
        let reply = context().admin("reloadconf");
        assert!(!reply.success);
        assert!(reply.output.contains("no configuration source"));
    }
}
