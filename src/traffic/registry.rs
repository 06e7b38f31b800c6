use std::net::UdpSocket;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::TrafficError;
use super::rx::{self, RxOptions};
use super::socket::open_stream_socket;
use super::stats::{CounterSnapshot, FrameRecord, MAX_RECORDS, Summary};
use super::stream::{Profile, Role, StreamParams, StreamShared, StreamState, lock};
use super::tx::{self, TxOptions};
use super::uapsd::{self, UapsdTxOptions};

pub const MAX_STREAMS: usize = 16;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub max_streams: usize,
    pub max_records: usize,
    /// How long stop/destroy wait for workers before giving up.
    pub stop_grace: Duration,
    /// Receive timeout and stop-flag polling interval.
    pub recv_poll: Duration,
    pub uapsd_retry_wait: Duration,
    pub uapsd_max_retry: u32,
    pub no_timestamps: bool,
    /// Payload size override for file-transfer senders, 0 = off.
    pub payload_override: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_streams: MAX_STREAMS,
            max_records: MAX_RECORDS,
            stop_grace: Duration::from_secs(5),
            recv_poll: Duration::from_millis(100),
            uapsd_retry_wait: Duration::from_millis(100),
            uapsd_max_retry: 300,
            no_timestamps: false,
            payload_override: 0,
        }
    }
}

/// Point-in-time view of one stream.
#[derive(Debug, Clone)]
pub struct StreamReport {
    pub id: u32,
    pub state: StreamState,
    pub counters: CounterSnapshot,
    pub summary: Summary,
    pub dropped_records: u64,
    pub error: Option<String>,
    /// Per-frame records in arrival order, when asked for.
    pub records: Option<Vec<FrameRecord>>,
}

struct StreamEntry {
    shared: Arc<StreamShared>,
    workers: Vec<JoinHandle<()>>,
}

/// Bounded table of traffic streams, owned by the dispatch thread.
pub struct StreamRegistry {
    entries: Vec<StreamEntry>,
    next_id: u32,
    opts: EngineOptions,
}

impl StreamRegistry {
    pub fn new(opts: EngineOptions) -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
            opts,
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.opts
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<u32> {
        self.entries.iter().map(|e| e.shared.id).collect()
    }

    fn entry(&self, id: u32) -> Result<&StreamEntry, TrafficError> {
        self.entries
            .iter()
            .find(|e| e.shared.id == id)
            .ok_or(TrafficError::UnknownStream(id))
    }

    fn entry_mut(&mut self, id: u32) -> Result<&mut StreamEntry, TrafficError> {
        self.entries
            .iter_mut()
            .find(|e| e.shared.id == id)
            .ok_or(TrafficError::UnknownStream(id))
    }

    /// Shared handle for a stream, e.g. to wait on it from another thread.
    pub fn handle(&self, id: u32) -> Result<Arc<StreamShared>, TrafficError> {
        self.entry(id).map(|e| Arc::clone(&e.shared))
    }

    pub fn state(&self, id: u32) -> Option<StreamState> {
        self.entry(id).ok().map(|e| e.shared.state())
    }

    pub fn create_stream(&mut self, params: StreamParams) -> Result<u32, TrafficError> {
        params.validate()?;
        if self.entries.len() >= self.opts.max_streams {
            return Err(TrafficError::CapacityExceeded {
                max: self.opts.max_streams,
            });
        }
        let id = self.next_id;
        self.next_id += 1;
        debug!(stream_id = id, ?params, "stream created");
        let shared = StreamShared::new(id, params, self.opts.max_records, self.opts.uapsd_max_retry);
        self.entries.push(StreamEntry {
            shared: Arc::new(shared),
            workers: Vec::new(),
        });
        Ok(id)
    }

    pub fn start_stream(&mut self, id: u32) -> Result<(), TrafficError> {
        let opts = self.opts.clone();
        let entry = self.entry_mut(id)?;
        match entry.shared.state() {
            StreamState::Running => return Err(TrafficError::AlreadyRunning(id)),
            StreamState::Stopped => {
                join_workers(id, &mut entry.workers);
                entry.shared.reset_run();
            }
            StreamState::Created | StreamState::Destroyed => {}
        }

        entry.shared.set_state(StreamState::Running);
        match launch_workers(&entry.shared, &opts) {
            Ok(workers) => {
                entry.workers = workers;
                info!(stream_id = id, "stream running");
                Ok(())
            }
            Err(e) => {
                entry.shared.set_error(e.to_string());
                entry.shared.request_stop();
                entry.shared.set_state(StreamState::Stopped);
                Err(e)
            }
        }
    }

    /// Signal stop and wait (bounded) for the stream's workers to exit.
    /// Stopping a stream that is not running is a no-op.
    pub fn stop_stream(&mut self, id: u32) -> Result<(), TrafficError> {
        let grace = self.opts.stop_grace;
        let entry = self.entry_mut(id)?;
        entry.shared.request_stop();
        if !entry.shared.wait_stopped(grace) {
            error!(stream_id = id, ?grace, "stream workers did not stop");
            return Err(TrafficError::StopTimeout { id, grace });
        }
        join_workers(id, &mut entry.workers);
        Ok(())
    }

    /// Stop, join and forget a stream. Returns `false` if no such stream
    /// is registered (already destroyed).
    pub fn destroy_stream(&mut self, id: u32) -> Result<bool, TrafficError> {
        if self.entry(id).is_err() {
            return Ok(false);
        }
        self.stop_stream(id)?;
        if let Some(pos) = self.entries.iter().position(|e| e.shared.id == id) {
            let entry = self.entries.remove(pos);
            lock(&entry.shared.records).clear();
            entry.shared.set_state(StreamState::Destroyed);
        }
        info!(stream_id = id, "stream destroyed");
        Ok(true)
    }

    /// Destroy every stream. Keeps going past failures and reports the first.
    pub fn reset(&mut self) -> Result<(), TrafficError> {
        let mut first_err = None;
        for id in self.ids() {
            if let Err(e) = self.destroy_stream(id) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn stats(&self, id: u32, with_records: bool) -> Result<StreamReport, TrafficError> {
        let entry = self.entry(id)?;
        Ok(report(&entry.shared, with_records))
    }
}

impl Drop for StreamRegistry {
    fn drop(&mut self) {
        if let Err(e) = self.reset() {
            warn!(error = %e, "streams left running at shutdown");
        }
    }
}

/// Build a report straight from a stream's shared block.
pub fn report(shared: &StreamShared, with_records: bool) -> StreamReport {
    let buf = lock(&shared.records);
    StreamReport {
        id: shared.id,
        state: shared.state(),
        counters: shared.counters.snapshot(),
        summary: buf.summary(),
        dropped_records: buf.dropped(),
        error: shared.error(),
        records: with_records.then(|| buf.records().to_vec()),
    }
}

fn join_workers(id: u32, workers: &mut Vec<JoinHandle<()>>) {
    for h in workers.drain(..) {
        if h.join().is_err() {
            warn!(stream_id = id, "stream worker panicked");
        }
    }
}

fn launch_workers(
    shared: &Arc<StreamShared>,
    opts: &EngineOptions,
) -> Result<Vec<JoinHandle<()>>, TrafficError> {
    let id = shared.id;
    let io_err = |source| TrafficError::Io { id, source };
    let p = &shared.params;

    let sock = open_stream_socket(p).map_err(io_err)?;
    if let Ok(addr) = sock.local_addr() {
        shared.set_local_addr(addr);
    }

    let mut workers = Vec::with_capacity(2);
    if let Err(e) = spawn_workers(shared, opts, sock, &mut workers) {
        abort_launch(shared, &mut workers);
        return Err(e);
    }
    Ok(workers)
}

/// Undo a partial launch: stop and join whatever already started.
fn abort_launch(shared: &StreamShared, workers: &mut Vec<JoinHandle<()>>) {
    shared.request_stop();
    join_workers(shared.id, workers);
}

fn spawn_workers(
    shared: &Arc<StreamShared>,
    opts: &EngineOptions,
    sock: UdpSocket,
    workers: &mut Vec<JoinHandle<()>>,
) -> Result<(), TrafficError> {
    let id = shared.id;
    let io_err = |source| TrafficError::Io { id, source };
    let p = &shared.params;
    let rx_opts = RxOptions {
        echo: p.profile == Profile::Transaction,
        poll: opts.recv_poll,
    };

    match (p.role, p.profile) {
        (Role::Sender, Profile::Uapsd) => {
            let rx_sock = sock.try_clone().map_err(io_err)?;
            let guard = shared.enter_worker();
            workers.push(spawn(id, "ps-rx", move || {
                rx::run(
                    guard,
                    rx_sock,
                    RxOptions {
                        echo: false,
                        poll: rx_opts.poll,
                    },
                )
            })?);
            let guard = shared.enter_worker();
            let tx_opts = UapsdTxOptions {
                no_timestamps: opts.no_timestamps,
                retry_wait: opts.uapsd_retry_wait,
                poll: opts.recv_poll,
            };
            workers.push(spawn(id, "ps-tx", move || {
                uapsd::run_sender(guard, sock, tx_opts)
            })?);
        }
        (Role::Sender, _) => {
            let guard = shared.enter_worker();
            let tx_opts = TxOptions {
                no_timestamps: opts.no_timestamps,
                payload_override: opts.payload_override,
                poll: opts.recv_poll,
            };
            workers.push(spawn(id, "tx", move || tx::run(guard, sock, tx_opts))?);
        }
        (Role::Receiver, _) => {
            let guard = shared.enter_worker();
            workers.push(spawn(id, "rx", move || rx::run(guard, sock, rx_opts))?);
        }
    }
    Ok(())
}

fn spawn<F>(id: u32, role: &str, f: F) -> Result<JoinHandle<()>, TrafficError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(format!("stream{}-{}", id, role))
        .spawn(f)
        .map_err(|source| TrafficError::Io { id, source })
}
