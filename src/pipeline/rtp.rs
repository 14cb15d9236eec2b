//! RTP packet handling: header, L16/L24 conversion, receive statistics.

use std::time::Duration;

use crate::config::Codec;

/// Length of an RTP header without CSRCs or extensions.
pub const RTP_HEADER_LEN: usize = 12;

const RTP_VERSION: u8 = 2;

/// Fixed part of an RTP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    /// Marker bit.
    pub marker: bool,
    /// Payload type.
    pub payload_type: u8,
    /// Sequence number.
    pub sequence: u16,
    /// Media timestamp.
    pub timestamp: u32,
    /// Synchronization source.
    pub ssrc: u32,
}

impl RtpHeader {
    /// Parses a packet, returning the header and the payload.
    ///
    /// Skips CSRCs and header extensions and strips padding. Returns `None`
    /// for anything that is not a well-formed version 2 packet.
    pub fn parse(packet: &[u8]) -> Option<(Self, &[u8])> {
        if packet.len() < RTP_HEADER_LEN || packet[0] >> 6 != RTP_VERSION {
            return None;
        }
        let padding = packet[0] & 0x20 != 0;
        let extension = packet[0] & 0x10 != 0;
        let csrc_count = (packet[0] & 0x0f) as usize;

        let header = Self {
            marker: packet[1] & 0x80 != 0,
            payload_type: packet[1] & 0x7f,
            sequence: u16::from_be_bytes([packet[2], packet[3]]),
            timestamp: u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
            ssrc: u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]),
        };

        let mut start = RTP_HEADER_LEN + csrc_count * 4;
        if extension {
            let ext = packet.get(start..start + 4)?;
            let words = u16::from_be_bytes([ext[2], ext[3]]) as usize;
            start += 4 + words * 4;
        }

        let mut end = packet.len();
        if padding {
            let pad = *packet.last()? as usize;
            end = end.checked_sub(pad)?;
        }
        if start > end {
            return None;
        }
        Some((header, &packet[start..end]))
    }

    /// Appends the header to `out`.
    pub fn write(&self, out: &mut Vec<u8>) {
        out.push(RTP_VERSION << 6);
        out.push((u8::from(self.marker) << 7) | (self.payload_type & 0x7f));
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.ssrc.to_be_bytes());
    }
}

/// Splits an interleaved big-endian payload into one S16LE unit per channel.
///
/// L24 samples keep their two most significant bytes.
pub(crate) fn depayload(payload: &[u8], codec: Codec, channels: usize) -> Option<Vec<Vec<u8>>> {
    let width = codec.sample_width();
    let frame = width * channels;
    if channels == 0 || payload.is_empty() || payload.len() % frame != 0 {
        return None;
    }

    let samples = payload.len() / frame;
    let mut units = vec![Vec::with_capacity(samples * 2); channels];
    for frame in payload.chunks_exact(frame) {
        for (unit, sample) in units.iter_mut().zip(frame.chunks_exact(width)) {
            unit.push(sample[1]);
            unit.push(sample[0]);
        }
    }
    Some(units)
}

/// Interleaves per-channel S16LE units into a big-endian payload.
///
/// All units must be the same length.
pub(crate) fn interleave(units: &[Vec<u8>], codec: Codec, out: &mut Vec<u8>) {
    let samples = units.first().map_or(0, |u| u.len() / 2);
    out.reserve(samples * units.len() * codec.sample_width());
    for i in 0..samples {
        for unit in units {
            out.push(unit[2 * i + 1]);
            out.push(unit[2 * i]);
            if codec == Codec::L24 {
                out.push(0);
            }
        }
    }
}

/// Snapshot of receive statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RtpStats {
    /// Packets accepted.
    pub packets_received: u64,
    /// Payload bytes accepted.
    pub bytes_received: u64,
    /// Packets missing from the sequence.
    pub packets_lost: u64,
    /// Packets that arrived after a later one.
    pub out_of_order: u64,
    /// Packets that failed to parse or depayload.
    pub malformed: u64,
    /// Packets with an unexpected payload type.
    pub wrong_payload_type: u64,
    /// Interarrival jitter (RFC 3550) in milliseconds.
    pub jitter_ms: f64,
    /// Highest sequence number seen.
    pub last_sequence: Option<u16>,
    /// Synchronization source of the last packet.
    pub ssrc: Option<u32>,
}

/// Tracks sequence numbers, jitter and extended timestamps of one source.
#[derive(Debug)]
pub(crate) struct RxTracker {
    sample_rate: u32,
    stats: RtpStats,
    base_seq: u64,
    max_seq: u64,
    ext_ts: u64,
    last_ts: u32,
    last_transit: Option<i64>,
    jitter: f64,
}

impl RxTracker {
    pub(crate) fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            stats: RtpStats::default(),
            base_seq: 0,
            max_seq: 0,
            ext_ts: 0,
            last_ts: 0,
            last_transit: None,
            jitter: 0.0,
        }
    }

    pub(crate) fn malformed(&mut self) {
        self.stats.malformed += 1;
    }

    pub(crate) fn wrong_payload_type(&mut self) {
        self.stats.wrong_payload_type += 1;
    }

    /// Records an accepted packet and returns its extended timestamp.
    pub(crate) fn record(&mut self, header: &RtpHeader, payload_len: usize, arrival: Duration) -> u64 {
        let first = self.stats.packets_received == 0;
        self.stats.packets_received += 1;
        self.stats.bytes_received += payload_len as u64;
        self.stats.ssrc = Some(header.ssrc);

        if first {
            // Start one wrap up so early reordering never goes negative.
            self.base_seq = u64::from(header.sequence) + (1 << 16);
            self.max_seq = self.base_seq;
            self.ext_ts = u64::from(header.timestamp) + (1 << 32);
            self.last_ts = header.timestamp;
            self.stats.last_sequence = Some(header.sequence);
        } else {
            let max_low = (self.max_seq & 0xffff) as u16;
            let delta = header.sequence.wrapping_sub(max_low);
            if delta == 0 {
                // duplicate
            } else if delta < 0x8000 {
                self.max_seq += u64::from(delta);
                self.stats.last_sequence = Some(header.sequence);
            } else {
                self.stats.out_of_order += 1;
            }

            let ts_delta = header.timestamp.wrapping_sub(self.last_ts) as i32;
            self.ext_ts = (self.ext_ts as i64 + i64::from(ts_delta)) as u64;
            self.last_ts = header.timestamp;
        }

        let expected = self.max_seq - self.base_seq + 1;
        self.stats.packets_lost = expected.saturating_sub(self.stats.packets_received);

        let arrival_units =
            (arrival.as_nanos() * u128::from(self.sample_rate) / 1_000_000_000) as i64;
        let transit = arrival_units - i64::from(header.timestamp);
        if let Some(last) = self.last_transit {
            let d = (transit - last).abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.last_transit = Some(transit);

        self.ext_ts
    }

    pub(crate) fn stats(&self) -> RtpStats {
        RtpStats {
            jitter_ms: self.jitter * 1000.0 / f64::from(self.sample_rate),
            ..self.stats.clone()
        }
    }
}
