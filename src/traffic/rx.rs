use std::io::ErrorKind;
use std::net::UdpSocket;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::frame::{Datagram, Timestamp, parse_frame};
use super::stats::FrameRecord;
use super::stream::{StreamShared, WorkerGuard, lock};

/// Per-datagram bookkeeping for a receiving stream.
pub struct RxTracker<'a> {
    shared: &'a StreamShared,
    highest: Option<u32>,
}

impl<'a> RxTracker<'a> {
    pub fn new(shared: &'a StreamShared) -> Self {
        Self {
            shared,
            highest: None,
        }
    }

    /// Account for one datagram received at `now`. Malformed datagrams are
    /// counted and yield `None`.
    pub fn on_datagram(&mut self, buf: &[u8], now: Timestamp) -> Option<Datagram> {
        let dgram = match parse_frame(buf) {
            Ok(d) => d,
            Err(e) => {
                self.shared.counters.inc_bad();
                debug!(stream_id = self.shared.id, error = %e, "bad frame");
                return None;
            }
        };

        if let Datagram::Data(f) = dgram {
            self.shared.counters.add_rx(f.len);
            match self.highest {
                Some(h) if f.seq < h => self.shared.counters.inc_out_of_seq(),
                _ => self.highest = Some(f.seq),
            }
            lock(&self.shared.records).push(FrameRecord {
                seq: f.seq,
                local: now,
                remote: f.sent,
            });
        }
        Some(dgram)
    }
}

pub(crate) struct RxOptions {
    /// Send every data frame back to where it came from.
    pub echo: bool,
    pub poll: Duration,
}

pub(crate) fn run(guard: WorkerGuard, sock: UdpSocket, opts: RxOptions) {
    let shared = guard.shared();
    if let Err(e) = sock.set_read_timeout(Some(opts.poll)) {
        warn!(stream_id = shared.id, error = %e, "cannot set receive timeout");
    }
    let mut tracker = RxTracker::new(shared);
    let mut buf = vec![0u8; 65_536];

    info!(
        stream_id = shared.id,
        local = ?shared.local_addr(),
        echo = opts.echo,
        "receiver started"
    );

    while !shared.stop_requested() {
        let (n, from) = match sock.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => {
                shared.counters.inc_bad();
                debug!(stream_id = shared.id, error = %e, "receive failed");
                thread::sleep(opts.poll);
                continue;
            }
        };

        match tracker.on_datagram(&buf[..n], Timestamp::now()) {
            Some(Datagram::Data(_)) if opts.echo => {
                if let Err(e) = sock.send_to(&buf[..n], from) {
                    debug!(stream_id = shared.id, error = %e, "echo failed");
                }
            }
            Some(Datagram::Trigger { cookie, sta_id }) => {
                if let Some(sync) = &shared.uapsd {
                    debug!(stream_id = shared.id, cookie, sta_id, %from, "uapsd trigger");
                    sync.on_trigger(cookie, sta_id, from);
                }
            }
            Some(Datagram::Awake) => {
                if let Some(sync) = &shared.uapsd {
                    debug!(stream_id = shared.id, %from, "station awake");
                    sync.on_awake(from);
                }
            }
            _ => {}
        }
    }

    let c = shared.counters.snapshot();
    info!(
        stream_id = shared.id,
        rx_frames = c.rx_frames,
        rx_bytes = c.rx_payload_bytes,
        out_of_seq = c.out_of_seq_frames,
        bad = c.bad_frames,
        "receiver done"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traffic::frame::build_frame;
    use crate::traffic::stream::{Role, StreamParams};

    fn receiver(max_records: usize) -> StreamShared {
        let params = StreamParams {
            role: Role::Receiver,
            ..Default::default()
        };
        StreamShared::new(1, params, max_records, 1)
    }

    fn frame(seq: u32) -> Vec<u8> {
        let mut out = Vec::new();
        build_frame(&mut out, seq, Some(Timestamp { sec: 1, usec: seq }), 100);
        out
    }

    #[test]
    fn out_of_order_counted() {
        let shared = receiver(6000);
        let mut t = RxTracker::new(&shared);
        for seq in [1, 2, 4, 3, 5] {
            t.on_datagram(&frame(seq), Timestamp::now());
        }
        let c = shared.counters.snapshot();
        assert_eq!(c.rx_frames, 5);
        assert_eq!(c.rx_payload_bytes, 500);
        assert_eq!(c.out_of_seq_frames, 1);

        let recs = lock(&shared.records);
        assert_eq!(recs.len(), 5);
        // arrival order, not sequence order
        let seqs: Vec<u32> = recs.records().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, [1, 2, 4, 3, 5]);
        assert_eq!(recs.records()[2].remote, Timestamp { sec: 1, usec: 4 });
    }

    #[test]
    fn malformed_frames_skipped() {
        let shared = receiver(10);
        let mut t = RxTracker::new(&shared);
        assert!(t.on_datagram(&[1, 2, 3], Timestamp::now()).is_none());
        assert!(t.on_datagram(&frame(1), Timestamp::now()).is_some());
        let c = shared.counters.snapshot();
        assert_eq!(c.bad_frames, 1);
        assert_eq!(c.rx_frames, 1);
    }

    #[test]
    fn record_cap_keeps_counting() {
        let shared = receiver(6000);
        let mut t = RxTracker::new(&shared);
        for seq in 1..=6500 {
            t.on_datagram(&frame(seq), Timestamp::now());
        }
        assert_eq!(shared.counters.snapshot().rx_frames, 6500);
        let recs = lock(&shared.records);
        assert_eq!(recs.len(), 6000);
        assert_eq!(recs.dropped(), 500);
    }
}
