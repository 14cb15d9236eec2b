//! Leftover-byte adapter between network units and caller frames.

use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;

/// Reconciles the size of received units with the size callers ask for.
///
/// Units arrive with whatever duration the sender packetizes at; sessions
/// read fixed frames. Bytes of a unit that don't fit the current read are
/// kept as leftover and handed out first on the next read.
///
/// The leftover never exceeds the capacity given at construction, which is
/// the largest unit a single packet can carry.
pub struct ChannelBuffer {
    leftover: HeapRb<u8>,
    truncated_bytes: u64,
}

impl ChannelBuffer {
    /// Creates a buffer retaining at most `capacity` leftover bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            leftover: HeapRb::new(capacity.max(1)),
            truncated_bytes: 0,
        }
    }

    /// Fills `out` from the leftover, then from units returned by `next`.
    ///
    /// Stops when `out` is full or `next` returns `None`. Returns the number
    /// of bytes written; never more than `out.len()`.
    pub fn fill<F>(&mut self, out: &mut [u8], mut next: F) -> usize
    where
        F: FnMut() -> Option<Vec<u8>>,
    {
        let mut filled = self.leftover.pop_slice(out);

        while filled < out.len() {
            let Some(unit) = next() else {
                break;
            };

            let take = (out.len() - filled).min(unit.len());
            out[filled..filled + take].copy_from_slice(&unit[..take]);
            filled += take;

            let rest = &unit[take..];
            if !rest.is_empty() {
                let kept = self.leftover.push_slice(rest);
                if kept < rest.len() {
                    let lost = (rest.len() - kept) as u64;
                    self.truncated_bytes += lost;
                    tracing::warn!(lost, "unit larger than leftover capacity, truncated");
                }
            }
        }

        filled
    }

    /// Bytes currently retained.
    pub fn leftover(&self) -> usize {
        self.leftover.occupied_len()
    }

    /// Bytes discarded because a unit exceeded the capacity.
    pub fn truncated_bytes(&self) -> u64 {
        self.truncated_bytes
    }

    /// Drops the retained bytes.
    pub fn clear(&mut self) {
        self.leftover.clear();
    }
}
