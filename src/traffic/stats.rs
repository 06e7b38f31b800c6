use std::sync::atomic::{AtomicU64, Ordering};

use super::frame::Timestamp;

/// Per-frame detail kept for each stream.
pub const MAX_RECORDS: usize = 6000;

/// Aggregate counters, written by the stream's workers and read by dispatch.
#[derive(Debug, Default)]
pub struct Counters {
    tx_act: AtomicU64,
    tx_frames: AtomicU64,
    tx_bytes: AtomicU64,
    rx_frames: AtomicU64,
    rx_bytes: AtomicU64,
    out_of_seq: AtomicU64,
    bad: AtomicU64,
}

impl Counters {
    /// One frame generated, whether or not the send succeeded.
    pub fn inc_tx_act(&self) {
        self.tx_act.fetch_add(1, Ordering::Relaxed);
    }
    pub fn add_tx(&self, bytes: usize) {
        self.tx_frames.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }
    pub fn add_rx(&self, bytes: usize) {
        self.rx_frames.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }
    pub fn inc_out_of_seq(&self) {
        self.out_of_seq.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_bad(&self) {
        self.bad.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for c in [
            &self.tx_act,
            &self.tx_frames,
            &self.tx_bytes,
            &self.rx_frames,
            &self.rx_bytes,
            &self.out_of_seq,
            &self.bad,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            tx_act_frames: self.tx_act.load(Ordering::Relaxed),
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            tx_payload_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            rx_payload_bytes: self.rx_bytes.load(Ordering::Relaxed),
            out_of_seq_frames: self.out_of_seq.load(Ordering::Relaxed),
            bad_frames: self.bad.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub tx_act_frames: u64,
    pub tx_frames: u64,
    pub tx_payload_bytes: u64,
    pub rx_frames: u64,
    pub rx_payload_bytes: u64,
    pub out_of_seq_frames: u64,
    pub bad_frames: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRecord {
    pub seq: u32,
    pub local: Timestamp,
    pub remote: Timestamp,
}

/// Bounded per-frame record store. Once full, new records are dropped and
/// the earliest ones kept.
#[derive(Debug, Clone)]
pub struct StatsBuffer {
    records: Vec<FrameRecord>,
    cap: usize,
    dropped: u64,
}

impl StatsBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            records: Vec::new(),
            cap,
            dropped: 0,
        }
    }

    /// Returns `false` when the record was dropped.
    pub fn push(&mut self, rec: FrameRecord) -> bool {
        if self.records.len() >= self.cap {
            self.dropped += 1;
            return false;
        }
        if self.records.capacity() == 0 {
            self.records.reserve(self.cap.min(1024));
        }
        self.records.push(rec);
        true
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Records in arrival order.
    pub fn records(&self) -> &[FrameRecord] {
        &self.records
    }

    pub fn clear(&mut self) {
        self.records = Vec::new();
        self.dropped = 0;
    }

    pub fn summary(&self) -> Summary {
        Summary::from_records(&self.records)
    }
}

/// Delay, jitter and loss derived from the stored records.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Summary {
    /// Sequence numbers missing between the lowest and highest stored.
    pub lost: u64,
    /// Mean of (local - remote), microseconds. Only meaningful when the
    /// two hosts share a clock.
    pub mean_delay_us: f64,
    /// Mean absolute change of transit time between consecutive arrivals.
    pub jitter_us: f64,
}

impl Summary {
    fn from_records(records: &[FrameRecord]) -> Self {
        if records.is_empty() {
            return Self::default();
        }

        let mut seqs: Vec<u32> = records.iter().map(|r| r.seq).collect();
        seqs.sort_unstable();
        seqs.dedup();
        let span = (seqs[seqs.len() - 1] - seqs[0]) as u64 + 1;
        let lost = span - seqs.len() as u64;

        let stamped: Vec<i64> = records
            .iter()
            .filter(|r| !r.remote.is_zero())
            .map(|r| r.local.as_micros() - r.remote.as_micros())
            .collect();
        let (mean_delay_us, jitter_us) = if stamped.is_empty() {
            (0.0, 0.0)
        } else {
            let mean = stamped.iter().sum::<i64>() as f64 / stamped.len() as f64;
            let jitter = if stamped.len() > 1 {
                stamped
                    .windows(2)
                    .map(|w| (w[1] - w[0]).unsigned_abs() as f64)
                    .sum::<f64>()
                    / (stamped.len() - 1) as f64
            } else {
                0.0
            };
            (mean, jitter)
        };

        Self {
            lost,
            mean_delay_us,
            jitter_us,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(seq: u32, local_us: u32, remote_us: u32) -> FrameRecord {
        FrameRecord {
            seq,
            local: Timestamp {
                sec: 100,
                usec: local_us,
            },
            remote: Timestamp {
                sec: 100,
                usec: remote_us,
            },
        }
    }

    #[test]
    fn buffer_keeps_oldest_when_full() {
        let counters = Counters::default();
        let mut buf = StatsBuffer::new(MAX_RECORDS);
        for seq in 1..=6100u32 {
            counters.add_rx(100);
            buf.push(rec(seq, 0, 0));
        }
        assert_eq!(buf.len(), MAX_RECORDS);
        assert_eq!(buf.dropped(), 100);
        assert_eq!(buf.records()[0].seq, 1);
        assert_eq!(buf.records()[MAX_RECORDS - 1].seq, 6000);
        assert_eq!(counters.snapshot().rx_frames, 6100);
    }

    #[test]
    fn summary_loss_and_jitter() {
        let mut buf = StatsBuffer::new(10);
        buf.push(rec(1, 1_100, 1_000));
        buf.push(rec(2, 2_300, 2_000));
        buf.push(rec(4, 4_100, 4_000));
        let s = buf.summary();
        assert_eq!(s.lost, 1);
        assert!((s.mean_delay_us - 500.0 / 3.0).abs() < 1e-6);
        // transits 100, 300, 100
        assert!((s.jitter_us - 200.0).abs() < 1e-6);
    }

    #[test]
    fn counters_reset() {
        let c = Counters::default();
        c.inc_tx_act();
        c.add_tx(10);
        c.inc_bad();
        c.reset();
        assert_eq!(c.snapshot(), CounterSnapshot::default());
    }
}
