use std::io::ErrorKind;
use std::net::UdpSocket;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::frame::{Datagram, Timestamp, build_frame, parse_frame};
use super::stream::{Profile, StreamShared, WorkerGuard};

/// Typed pacing model for a sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    Max,
    Fixed(Duration),
}

impl Pacing {
    pub fn from_rate(frames_per_sec: u32) -> Self {
        if frames_per_sec == 0 {
            Pacing::Max
        } else {
            Pacing::Fixed(Duration::from_nanos(1_000_000_000 / frames_per_sec as u64))
        }
    }

    /// When frame `sent + 1` is due, measured from `start`. Anchoring on the
    /// start time keeps the average rate exact despite sleep overshoot.
    pub fn deadline(self, start: Instant, sent: u64) -> Option<Instant> {
        match self {
            Pacing::Max => None,
            Pacing::Fixed(gap) => Some(start + gap.saturating_mul(sent.min(u32::MAX as u64) as u32)),
        }
    }
}

/// Sleep until `at`, waking every `poll` to honor a stop request.
pub(crate) fn sleep_until(at: Instant, shared: &StreamShared, poll: Duration) {
    loop {
        let now = Instant::now();
        if now >= at || shared.stop_requested() {
            return;
        }
        thread::sleep((at - now).min(poll));
    }
}

pub(crate) struct TxOptions {
    pub no_timestamps: bool,
    /// Overrides the stream payload size when non-zero.
    pub payload_override: usize,
    pub poll: Duration,
}

pub(crate) fn run(guard: WorkerGuard, sock: UdpSocket, opts: TxOptions) {
    let shared = guard.shared();
    let p = &shared.params;
    let dst = p.dst_addr();
    let payload = if opts.payload_override > 0 && p.profile == Profile::FileTransfer {
        opts.payload_override
    } else {
        p.payload_size
    };
    let expect_echo = p.profile == Profile::Transaction;
    if expect_echo
        && let Err(e) = sock.set_read_timeout(Some(opts.poll))
    {
        warn!(stream_id = shared.id, error = %e, "cannot set echo timeout");
    }

    if p.profile == Profile::StartSync && !p.start_delay.is_zero() {
        debug!(stream_id = shared.id, delay = ?p.start_delay, "start delay");
        sleep_until(Instant::now() + p.start_delay, shared, opts.poll);
    }

    let pacing = Pacing::from_rate(p.frame_rate);
    let start = Instant::now();
    let mut seq: u32 = 0;
    let mut out = Vec::with_capacity(payload);
    let mut echo = vec![0u8; 65_536];
    let mut send_errors: u64 = 0;

    info!(
        stream_id = shared.id,
        %dst,
        rate = p.frame_rate,
        payload,
        "sender started"
    );

    loop {
        if shared.stop_requested() {
            break;
        }
        if !p.duration.is_zero() && start.elapsed() >= p.duration {
            break;
        }
        if p.max_cnt > 0 && seq as u64 >= p.max_cnt {
            break;
        }

        seq = seq.wrapping_add(1);
        let stamp = (!opts.no_timestamps).then(Timestamp::now);
        build_frame(&mut out, seq, stamp, payload);
        shared.counters.inc_tx_act();
        match sock.send_to(&out, dst) {
            Ok(n) => shared.counters.add_tx(n),
            Err(e) => {
                shared.counters.inc_bad();
                send_errors += 1;
                if send_errors == 1 {
                    warn!(stream_id = shared.id, error = %e, "send failed");
                }
            }
        }

        if expect_echo {
            match sock.recv_from(&mut echo) {
                Ok((n, _)) => {
                    if let Ok(Datagram::Data(f)) = parse_frame(&echo[..n])
                        && f.seq == seq
                    {
                        shared.counters.add_rx(n);
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) => debug!(stream_id = shared.id, error = %e, "echo receive failed"),
            }
        }

        if let Some(at) = pacing.deadline(start, seq as u64) {
            sleep_until(at, shared, opts.poll);
        }
    }

    let c = shared.counters.snapshot();
    info!(
        stream_id = shared.id,
        tx_frames = c.tx_frames,
        tx_bytes = c.tx_payload_bytes,
        send_errors,
        elapsed = ?start.elapsed(),
        "sender done"
    );
}
