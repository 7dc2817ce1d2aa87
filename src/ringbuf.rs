//! Shared-producer, many-consumer ring buffer for stream fan-out.
//!
//! One publisher appends whole TS datagrams at the head; any number of
//! subscribers read behind it through their own cursors. The writer never
//! waits for a reader: a reader that falls more than
//! `capacity - safety_margin` bytes behind is flagged as overrun on its next
//! read and its cursor is snapped back to a "skip to live" watermark so the
//! caller can decide whether to keep or drop it (the role layer drops).
//!
//! Head and cursor positions are monotonic `u64` byte offsets that never
//! wrap, so lag comparisons are plain unsigned subtraction and the registry
//! can enumerate readers without quiescing the writer.

use std::sync::atomic::{ AtomicU64, Ordering };

use parking_lot::RwLock;

use crate::constants::{ RING_REWIND_WATERMARK, RING_SAFETY_MARGIN, TS_PACKET_LEN };
use crate::error::{ RelayError, Result };

/// Where a new reader cursor starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorStart {
    /// At the current head; the reader sees only bytes written after attach.
    Latest,
    /// `k` bytes behind the head, clamped to the oldest retained byte.
    Rewind(u64),
}

/// A reader's monotonic position into the ring.
#[derive(Debug, Clone, Copy)]
pub struct Cursor {
    pos: u64,
}

impl Cursor {
    /// Byte offset of this cursor in the stream.
    pub fn position(&self) -> u64 {
        self.pos
    }
}

/// Outcome of a cursor read.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were copied into the output buffer and the cursor advanced.
    Data(usize),
    /// The cursor is at the head; nothing new to read.
    Empty,
    /// The cursor lagged past the retention window. It has been reset to the
    /// watermark distance behind the head; the caller chooses the policy.
    Overrun { lag: u64 },
}

#[derive(Debug)]
struct Inner {
    buf: Box<[u8]>,
    head: u64,
}

/// Fixed-capacity byte ring with a monotonic head.
#[derive(Debug)]
pub struct RingBuffer {
    capacity: usize,
    safety_margin: usize,
    watermark: usize,
    inner: RwLock<Inner>,
    /// Mirror of `inner.head` for lock-free emptiness checks.
    head_hint: AtomicU64,
}

impl RingBuffer {
    /// Create a ring with the default safety margin and rewind watermark,
    /// scaled down for rings smaller than the defaults assume.
    pub fn new(capacity: usize) -> Result<Self> {
        let margin = RING_SAFETY_MARGIN.min(capacity / 4);
        let watermark = RING_REWIND_WATERMARK.min(capacity / 4);
        Self::with_margins(capacity, margin, watermark)
    }

    pub fn with_margins(capacity: usize, safety_margin: usize, watermark: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(RelayError::config("ring capacity must be non-zero"));
        }
        if safety_margin >= capacity {
            return Err(RelayError::config("ring safety margin must be below capacity"));
        }
        if watermark > capacity - safety_margin {
            return Err(RelayError::config("ring watermark must fit in the retention window"));
        }
        Ok(Self {
            capacity,
            safety_margin,
            watermark,
            inner: RwLock::new(Inner {
                buf: vec![0u8; capacity].into_boxed_slice(),
                head: 0,
            }),
            head_hint: AtomicU64::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current head position without taking the lock.
    pub fn head(&self) -> u64 {
        self.head_hint.load(Ordering::Acquire)
    }

    /// Append one datagram at the head.
    ///
    /// Fails with `WouldOverrun` only when the datagram alone is larger than
    /// the whole ring; lagging readers never block or fail a write.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.capacity {
            return Err(RelayError::WouldOverrun {
                len: bytes.len(),
                capacity: self.capacity,
            });
        }
        if bytes.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.write();
        let start = (inner.head % (self.capacity as u64)) as usize;
        let first = bytes.len().min(self.capacity - start);
        inner.buf[start..start + first].copy_from_slice(&bytes[..first]);
        if first < bytes.len() {
            let rest = bytes.len() - first;
            inner.buf[..rest].copy_from_slice(&bytes[first..]);
        }
        inner.head += bytes.len() as u64;
        self.head_hint.store(inner.head, Ordering::Release);
        Ok(())
    }

    /// Create a reader cursor. Positions are aligned down to a TS packet
    /// boundary so rewound readers start on a packet edge.
    pub fn new_cursor(&self, start: CursorStart) -> Cursor {
        let head = self.head();
        let pos = match start {
            CursorStart::Latest => head,
            CursorStart::Rewind(k) => {
                let oldest = self.oldest_retained(head);
                align_to_packet(head.saturating_sub(k).max(oldest))
            }
        };
        Cursor { pos }
    }

    /// Copy up to `out.len()` bytes between the cursor and the head.
    pub fn read(&self, cursor: &mut Cursor, out: &mut [u8]) -> ReadOutcome {
        // Fast path: nothing new since the last read.
        if cursor.pos == self.head() {
            return ReadOutcome::Empty;
        }

        let inner = self.inner.read();
        let head = inner.head;
        let lag = head - cursor.pos;
        if lag > (self.capacity - self.safety_margin) as u64 {
            cursor.pos = align_to_packet(head.saturating_sub(self.watermark as u64));
            return ReadOutcome::Overrun { lag };
        }
        if lag == 0 {
            return ReadOutcome::Empty;
        }

        let n = (lag as usize).min(out.len());
        let start = (cursor.pos % (self.capacity as u64)) as usize;
        let first = n.min(self.capacity - start);
        out[..first].copy_from_slice(&inner.buf[start..start + first]);
        if first < n {
            out[first..n].copy_from_slice(&inner.buf[..n - first]);
        }
        drop(inner);

        cursor.pos += n as u64;
        ReadOutcome::Data(n)
    }

    fn oldest_retained(&self, head: u64) -> u64 {
        head.saturating_sub((self.capacity - self.safety_margin) as u64)
    }
}

fn align_to_packet(pos: u64) -> u64 {
    pos - pos % (TS_PACKET_LEN as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::TS_DATAGRAM_LEN;
    use proptest::prelude::*;

    fn small_ring() -> RingBuffer {
        // 16 datagrams of retention, 2 of margin, 4 of watermark.
        RingBuffer::with_margins(
            16 * TS_DATAGRAM_LEN,
            2 * TS_DATAGRAM_LEN,
            4 * TS_DATAGRAM_LEN
        ).unwrap()
    }

    fn datagram(tag: u8) -> Vec<u8> {
        vec![tag; TS_DATAGRAM_LEN]
    }

    #[test]
    fn roundtrip_single_datagram() {
        let ring = small_ring();
        let mut cursor = ring.new_cursor(CursorStart::Latest);
        ring.write(&datagram(7)).unwrap();

        let mut out = vec![0u8; TS_DATAGRAM_LEN];
        assert_eq!(ring.read(&mut cursor, &mut out), ReadOutcome::Data(TS_DATAGRAM_LEN));
        assert_eq!(out, datagram(7));
        assert_eq!(ring.read(&mut cursor, &mut out), ReadOutcome::Empty);
    }

    #[test]
    fn wraparound_preserves_bytes() {
        let ring = small_ring();
        // Fill past one full lap so the head wraps the backing array.
        for i in 0..40u8 {
            ring.write(&datagram(i)).unwrap();
        }
        let mut cursor = ring.new_cursor(CursorStart::Rewind((4 * TS_DATAGRAM_LEN) as u64));
        let mut out = vec![0u8; TS_DATAGRAM_LEN];
        for expect in 36..40u8 {
            assert_eq!(ring.read(&mut cursor, &mut out), ReadOutcome::Data(TS_DATAGRAM_LEN));
            assert_eq!(out, datagram(expect));
        }
    }

    #[test]
    fn oversized_write_rejected() {
        let ring = small_ring();
        let blob = vec![0u8; 17 * TS_DATAGRAM_LEN];
        assert!(matches!(ring.write(&blob), Err(RelayError::WouldOverrun { .. })));
    }

    #[test]
    fn slow_reader_overruns_and_resets_to_watermark() {
        let ring = small_ring();
        let mut slow = ring.new_cursor(CursorStart::Latest);
        for i in 0..20u8 {
            ring.write(&datagram(i)).unwrap();
        }
        let mut out = vec![0u8; TS_DATAGRAM_LEN];
        match ring.read(&mut slow, &mut out) {
            ReadOutcome::Overrun { lag } => {
                assert_eq!(lag, (20 * TS_DATAGRAM_LEN) as u64);
            }
            other => panic!("expected overrun, got {:?}", other),
        }
        // Cursor was snapped to the watermark: 4 datagrams behind head.
        assert_eq!(slow.position(), ring.head() - (4 * TS_DATAGRAM_LEN) as u64);
        assert_eq!(ring.read(&mut slow, &mut out), ReadOutcome::Data(TS_DATAGRAM_LEN));
        assert_eq!(out, datagram(16));
    }

    #[test]
    fn overrun_is_isolated_per_cursor() {
        let ring = small_ring();
        let mut slow = ring.new_cursor(CursorStart::Latest);
        let mut live = ring.new_cursor(CursorStart::Latest);
        let mut out = vec![0u8; TS_DATAGRAM_LEN];

        for i in 0..30u8 {
            ring.write(&datagram(i)).unwrap();
            // The live reader keeps up.
            assert_eq!(ring.read(&mut live, &mut out), ReadOutcome::Data(TS_DATAGRAM_LEN));
            assert_eq!(out, datagram(i));
        }
        assert!(matches!(ring.read(&mut slow, &mut out), ReadOutcome::Overrun { .. }));
        // The live reader is untouched by the other cursor's overrun.
        assert_eq!(ring.read(&mut live, &mut out), ReadOutcome::Empty);
    }

    #[test]
    fn rewind_clamps_to_oldest_retained() {
        let ring = small_ring();
        for i in 0..4u8 {
            ring.write(&datagram(i)).unwrap();
        }
        // Ask for far more history than exists; cursor lands on byte zero.
        let cursor = ring.new_cursor(CursorStart::Rewind(u64::MAX));
        assert_eq!(cursor.position(), 0);
    }

    proptest! {
        /// Any read that returns data must return exactly the bytes written
        /// at that stream offset, regardless of interleaving.
        #[test]
        fn reads_match_written_stream(ops in proptest::collection::vec(0u8..3, 1..120)) {
            let ring = small_ring();
            let mut model: Vec<u8> = Vec::new();
            let mut cursor = ring.new_cursor(CursorStart::Latest);
            let mut tag = 0u8;

            for op in ops {
                match op {
                    // write one datagram
                    0 | 1 => {
                        ring.write(&datagram(tag)).unwrap();
                        model.extend_from_slice(&datagram(tag));
                        tag = tag.wrapping_add(1);
                    }
                    // read one datagram
                    _ => {
                        let mut out = vec![0u8; TS_DATAGRAM_LEN];
                        match ring.read(&mut cursor, &mut out) {
                            ReadOutcome::Data(n) => {
                                let start = (cursor.position() as usize) - n;
                                prop_assert_eq!(&out[..n], &model[start..start + n]);
                            }
                            ReadOutcome::Empty => {
                                prop_assert_eq!(cursor.position(), ring.head());
                            }
                            ReadOutcome::Overrun { .. } => {
                                // Cursor must land inside the retention window.
                                let head = ring.head();
                                prop_assert!(cursor.position() <= head);
                                prop_assert!(head - cursor.position() <= (16 * TS_DATAGRAM_LEN) as u64);
                            }
                        }
                    }
                }
            }
        }
    }
}
