//! U-APSD hand-off between a stream's trigger receiver and its sender.
//!
//! The receiver thread watches for poll triggers from the station and opens a
//! delivery window; the sender thread blocks on [`UapsdSync::acquire`] until
//! the window allows another frame.

use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::frame::{Timestamp, build_frame, stamp_cookie};
use super::stream::{StreamShared, WorkerGuard, lock};
use super::tx::{Pacing, sleep_until};

/// Station power state as seen from its frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    Awake,
    PowerSave,
}

/// Whether the sender may transmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Hold,
    Release { remaining: u32 },
    Free,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Send one frame tagged with `cookie`.
    Send {
        cookie: u32,
        peer: Option<SocketAddr>,
    },
    /// Woke up without permission; retry counted.
    Idle,
    /// Too many consecutive attempts without a trigger.
    Exhausted,
}

#[derive(Debug)]
struct PsState {
    rx: RxState,
    tx: TxState,
    cookie: u32,
    sta_id: u32,
    peer: Option<SocketAddr>,
    retries: u32,
}

#[derive(Debug)]
pub struct UapsdSync {
    state: Mutex<PsState>,
    cond: Condvar,
    frames_per_trigger: u32,
    max_retry: u32,
}

impl UapsdSync {
    pub fn new(sta_id: u32, frames_per_trigger: u32, max_retry: u32) -> Self {
        Self {
            state: Mutex::new(PsState {
                rx: RxState::PowerSave,
                tx: TxState::Hold,
                cookie: 0,
                sta_id,
                peer: None,
                retries: 0,
            }),
            cond: Condvar::new(),
            frames_per_trigger,
            max_retry,
        }
    }

    pub fn on_trigger(&self, cookie: u32, sta_id: u32, from: SocketAddr) {
        let mut st = lock(&self.state);
        if st.sta_id != 0 && sta_id != st.sta_id {
            debug!(sta_id, expected = st.sta_id, "trigger from other station ignored");
            return;
        }
        st.rx = RxState::PowerSave;
        st.cookie = cookie;
        st.peer = Some(from);
        st.tx = TxState::Release {
            remaining: self.frames_per_trigger,
        };
        drop(st);
        self.cond.notify_all();
    }

    pub fn on_awake(&self, from: SocketAddr) {
        let mut st = lock(&self.state);
        st.rx = RxState::Awake;
        st.tx = TxState::Free;
        st.peer = Some(from);
        drop(st);
        self.cond.notify_all();
    }

    /// Wait up to `wait` for permission to send one frame.
    pub fn acquire(&self, wait: Duration) -> Permit {
        let mut st = lock(&self.state);
        if let Some(p) = take_permit(&mut st) {
            return p;
        }
        if st.retries >= self.max_retry {
            return Permit::Exhausted;
        }
        st = self
            .cond
            .wait_timeout(st, wait)
            .unwrap_or_else(PoisonError::into_inner)
            .0;
        if let Some(p) = take_permit(&mut st) {
            return p;
        }
        st.retries += 1;
        Permit::Idle
    }

    pub fn wake_all(&self) {
        self.cond.notify_all();
    }

    pub fn rx_state(&self) -> RxState {
        lock(&self.state).rx
    }

    pub fn tx_state(&self) -> TxState {
        lock(&self.state).tx
    }

    pub fn cookie(&self) -> u32 {
        lock(&self.state).cookie
    }

    pub(crate) fn reset(&self) {
        let mut st = lock(&self.state);
        st.rx = RxState::PowerSave;
        st.tx = TxState::Hold;
        st.cookie = 0;
        st.peer = None;
        st.retries = 0;
    }
}

fn take_permit(st: &mut PsState) -> Option<Permit> {
    let permit = Permit::Send {
        cookie: st.cookie,
        peer: st.peer,
    };
    match st.tx {
        TxState::Hold => return None,
        TxState::Free => {}
        TxState::Release { remaining } => {
            st.tx = if remaining <= 1 {
                TxState::Hold
            } else {
                TxState::Release {
                    remaining: remaining - 1,
                }
            };
        }
    }
    st.retries = 0;
    Some(permit)
}

/* ---------- sender thread ---------- */

pub(crate) struct UapsdTxOptions {
    pub no_timestamps: bool,
    pub retry_wait: Duration,
    pub poll: Duration,
}

/// Sender half of a U-APSD stream. The receiver half is the stream's normal
/// receive loop with the synchronizer attached.
pub(crate) fn run_sender(guard: WorkerGuard, sock: UdpSocket, opts: UapsdTxOptions) {
    let shared: &Arc<StreamShared> = guard.shared();
    let Some(sync) = shared.uapsd.as_ref() else {
        return;
    };
    let p = &shared.params;
    let pacing = Pacing::from_rate(p.frame_rate);
    let start = Instant::now();
    let mut seq: u32 = 0;
    let mut out = Vec::with_capacity(p.payload_size.max(16));

    info!(stream_id = shared.id, sta_id = p.sta_id, "uapsd sender waiting for trigger");

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

        let (cookie, peer) = match sync.acquire(opts.retry_wait) {
            Permit::Send { cookie, peer } => (cookie, peer),
            Permit::Idle => continue,
            Permit::Exhausted => {
                warn!(stream_id = shared.id, "uapsd sender gave up waiting for trigger");
                shared.set_error(format!(
                    "no trigger from station after {} retries",
                    sync.max_retry
                ));
                break;
            }
        };
        let dst = if p.dst.is_unspecified() {
            match peer {
                Some(a) => a,
                None => continue,
            }
        } else {
            p.dst_addr()
        };

        seq = seq.wrapping_add(1);
        let stamp = (!opts.no_timestamps).then(Timestamp::now);
        build_frame(&mut out, seq, stamp, p.payload_size);
        stamp_cookie(&mut out, cookie);
        shared.counters.inc_tx_act();
        match sock.send_to(&out, dst) {
            Ok(n) => shared.counters.add_tx(n),
            Err(e) => {
                shared.counters.inc_bad();
                debug!(stream_id = shared.id, error = %e, "uapsd send failed");
            }
        }

        if let Some(at) = pacing.deadline(start, seq as u64) {
            sleep_until(at, shared, opts.poll);
        }
    }

    info!(
        stream_id = shared.id,
        tx_frames = shared.counters.snapshot().tx_frames,
        station = ?sync.rx_state(),
        last_cookie = sync.cookie(),
        "uapsd sender done"
    );
}
