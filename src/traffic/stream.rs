use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::TrafficError;
use super::stats::{Counters, StatsBuffer};
use super::uapsd::UapsdSync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    FileTransfer,
    Multicast,
    Iptv,
    Transaction,
    StartSync,
    Uapsd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficClass {
    Voice,
    Video,
    Background,
    BestEffort,
}

impl TrafficClass {
    pub fn tos(self) -> u8 {
        match self {
            TrafficClass::Voice => 0xE0,
            TrafficClass::Video => 0xA0,
            TrafficClass::Background => 0x20,
            TrafficClass::BestEffort => 0x00,
        }
    }
}

/// Lifecycle of one stream. Only ever moves forward, except that a
/// stopped stream may be started again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Created,
    Running,
    Stopped,
    Destroyed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamParams {
    pub profile: Profile,
    pub role: Role,
    pub dst: Ipv4Addr,
    pub dst_port: u16,
    pub src: Ipv4Addr,
    pub src_port: u16,
    /// Frames per second, 0 = as fast as possible.
    pub frame_rate: u32,
    /// 0 = until stopped.
    pub duration: Duration,
    pub payload_size: usize,
    pub start_delay: Duration,
    /// 0 = unlimited.
    pub max_cnt: u64,
    pub tc: TrafficClass,
    pub user_priority: Option<u8>,
    pub frames_per_trigger: u32,
    pub sta_id: u32,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            profile: Profile::FileTransfer,
            role: Role::Sender,
            dst: Ipv4Addr::UNSPECIFIED,
            dst_port: 0,
            src: Ipv4Addr::UNSPECIFIED,
            src_port: 0,
            frame_rate: 0,
            duration: Duration::ZERO,
            payload_size: 1000,
            start_delay: Duration::ZERO,
            max_cnt: 0,
            tc: TrafficClass::BestEffort,
            user_priority: None,
            frames_per_trigger: 1,
            sta_id: 0,
        }
    }
}

impl StreamParams {
    pub fn tos(&self) -> u8 {
        match self.user_priority {
            Some(up) => (up & 0x07) << 5,
            None => self.tc.tos(),
        }
    }

    pub fn dst_addr(&self) -> SocketAddr {
        SocketAddr::from((self.dst, self.dst_port))
    }

    pub fn validate(&self) -> Result<(), TrafficError> {
        let bad = |why: &'static str| Err(TrafficError::InvalidParams(why));
        match (self.role, self.profile) {
            (Role::Sender, Profile::Uapsd) => {}
            (Role::Sender, _) if self.dst.is_unspecified() || self.dst_port == 0 => {
                return bad("sender needs destination and destinationPort");
            }
            (Role::Receiver, Profile::Multicast) if !self.dst.is_multicast() => {
                return bad("multicast receiver needs a multicast destination");
            }
            _ => {}
        }
        if let Some(up) = self.user_priority
            && up > 7
        {
            return bad("userPriority must be 0..7");
        }
        if self.profile == Profile::Uapsd && self.frames_per_trigger == 0 {
            return bad("framesPerTrigger must be positive");
        }
        if self.payload_size > 65_507 {
            return bad("payloadSize larger than a UDP datagram");
        }
        Ok(())
    }
}

// Allow simple FromStr for enums, matching the controller's spelling.

impl FromStr for Profile {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file_transfer" => Ok(Profile::FileTransfer),
            "multicast" => Ok(Profile::Multicast),
            "iptv" => Ok(Profile::Iptv),
            "transaction" => Ok(Profile::Transaction),
            "start_sync" => Ok(Profile::StartSync),
            "uapsd" => Ok(Profile::Uapsd),
            _ => Err(()),
        }
    }
}
impl FromStr for Role {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "send" => Ok(Role::Sender),
            "receive" => Ok(Role::Receiver),
            _ => Err(()),
        }
    }
}
impl FromStr for TrafficClass {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "voice" => Ok(TrafficClass::Voice),
            "video" => Ok(TrafficClass::Video),
            "background" => Ok(TrafficClass::Background),
            "besteffort" | "best_effort" => Ok(TrafficClass::BestEffort),
            _ => Err(()),
        }
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between a stream's workers and the dispatch thread.
///
/// Params are fixed at creation. Counters are atomics; the record buffer
/// is only written by the stream's receiving worker.
#[derive(Debug)]
pub struct StreamShared {
    pub id: u32,
    pub params: StreamParams,
    pub counters: Counters,
    pub records: Mutex<StatsBuffer>,
    pub(crate) uapsd: Option<UapsdSync>,
    stop: AtomicBool,
    active_workers: AtomicUsize,
    state: Mutex<StreamState>,
    state_cv: Condvar,
    error: Mutex<Option<String>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl StreamShared {
    pub fn new(id: u32, params: StreamParams, max_records: usize, uapsd_max_retry: u32) -> Self {
        let uapsd = (params.profile == Profile::Uapsd && params.role == Role::Sender).then(|| {
            UapsdSync::new(params.sta_id, params.frames_per_trigger, uapsd_max_retry)
        });
        Self {
            id,
            params,
            counters: Counters::default(),
            records: Mutex::new(StatsBuffer::new(max_records)),
            uapsd,
            stop: AtomicBool::new(false),
            active_workers: AtomicUsize::new(0),
            state: Mutex::new(StreamState::Created),
            state_cv: Condvar::new(),
            error: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    pub fn state(&self) -> StreamState {
        *lock(&self.state)
    }

    pub(crate) fn set_state(&self, next: StreamState) {
        *lock(&self.state) = next;
        self.state_cv.notify_all();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Ask every worker of this stream to exit at its next frame boundary.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(sync) = &self.uapsd {
            sync.wake_all();
        }
    }

    /// Block until the stream leaves `Running`, or `timeout` passes.
    /// Returns `true` if it is no longer running.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = lock(&self.state);
        while *st == StreamState::Running {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            st = self
                .state_cv
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    pub fn error(&self) -> Option<String> {
        lock(&self.error).clone()
    }

    pub(crate) fn set_error(&self, msg: String) {
        let mut e = lock(&self.error);
        if e.is_none() {
            *e = Some(msg);
        }
    }

    /// Address the stream's socket is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    pub(crate) fn set_local_addr(&self, addr: SocketAddr) {
        *lock(&self.local_addr) = Some(addr);
    }

    /// Clear everything a previous run left behind.
    pub(crate) fn reset_run(&self) {
        self.stop.store(false, Ordering::Release);
        self.counters.reset();
        lock(&self.records).clear();
        *lock(&self.error) = None;
        if let Some(sync) = &self.uapsd {
            sync.reset();
        }
    }

    pub(crate) fn enter_worker(self: &Arc<Self>) -> WorkerGuard {
        self.active_workers.fetch_add(1, Ordering::AcqRel);
        WorkerGuard {
            shared: Arc::clone(self),
        }
    }
}

/// Held by each worker thread; the last one out marks the stream stopped.
pub(crate) struct WorkerGuard {
    shared: Arc<StreamShared>,
}

impl WorkerGuard {
    pub(crate) fn shared(&self) -> &Arc<StreamShared> {
        &self.shared
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        // sibling workers (U-APSD receiver, echo) follow the one that quits
        self.shared.request_stop();
        if self.shared.active_workers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.set_state(StreamState::Stopped);
        }
    }
}
