//! `traffic_agent_*` commands: the controller's view of the traffic engine.

use std::fs;
use std::io::{BufWriter, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{info, warn};

use crate::agent::AgentState;
use crate::dispatch::{ConnContext, Outcome};
use crate::proto::{ParamSet, WireResponse};
use crate::traffic::registry::report;
use crate::traffic::{Profile, Role, StreamParams, StreamReport, StreamShared, TrafficError};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamError {
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("invalid {0}: {1}")]
    Bad(&'static str, String),
}

/* ---------- validators ---------- */

pub fn validate_config(p: &ParamSet) -> bool {
    p.contains("profile") && p.contains("direction")
}

pub fn validate_stream_ids(p: &ParamSet) -> bool {
    p.get("streamID").is_some_and(|v| !v.trim().is_empty())
}

/* ---------- processors ---------- */

pub fn config(agent: &mut AgentState, _: &ConnContext, p: &ParamSet) -> Outcome {
    let params = match stream_params(p) {
        Ok(sp) => sp,
        Err(e) => return Outcome::invalid(&e.to_string()),
    };
    match agent.streams.create_stream(params) {
        Ok(id) => Outcome::Complete(Some(format!("streamID,{}", id))),
        Err(e @ TrafficError::InvalidParams(_)) => Outcome::invalid(&e.to_string()),
        Err(e) => Outcome::error(&e.to_string()),
    }
}

pub fn reset(agent: &mut AgentState, _: &ConnContext, _: &ParamSet) -> Outcome {
    match agent.streams.reset() {
        Ok(()) => Outcome::Complete(None),
        Err(e) => traffic_failure(agent, e),
    }
}

/// Start every listed sender and answer `RUNNING`; the stats follow once
/// all of them have stopped on their own.
pub fn send(agent: &mut AgentState, conn: &ConnContext, p: &ParamSet) -> Outcome {
    let handles = match role_handles(agent, p, Role::Sender) {
        Ok(h) => h,
        Err(o) => return o,
    };
    let Some(limit) = handles
        .iter()
        .map(|h| expected_runtime(&h.params))
        .collect::<Option<Vec<_>>>()
        .and_then(|v| v.into_iter().max())
    else {
        return Outcome::invalid("Sender stream needs duration or maxCnt");
    };

    for (i, h) in handles.iter().enumerate() {
        if let Err(e) = agent.streams.start_stream(h.id) {
            for started in &handles[..i] {
                if let Err(stop_err) = agent.streams.stop_stream(started.id) {
                    warn!(stream_id = started.id, error = %stop_err, "cannot stop sender");
                    if stop_err.is_fatal() {
                        agent.set_fatal(stop_err.to_string());
                    }
                }
            }
            return traffic_failure(agent, e);
        }
    }

    let grace = agent.streams.options().stop_grace;
    let done = conn.completer();
    let spawned = thread::Builder::new()
        .name("send-watch".to_string())
        .spawn(move || match watch_senders(&handles, limit + grace, grace) {
            Ok(resp) => done.complete(resp),
            Err(e) => done.complete_fatal(
                WireResponse::error(Some(format!("errorCode,{}", e))),
                e.to_string(),
            ),
        });
    match spawned {
        Ok(_) => Outcome::Running,
        Err(e) => Outcome::error(&format!("cannot wait for senders: {}", e)),
    }
}

pub fn receive_start(agent: &mut AgentState, _: &ConnContext, p: &ParamSet) -> Outcome {
    let handles = match role_handles(agent, p, Role::Receiver) {
        Ok(h) => h,
        Err(o) => return o,
    };
    for h in &handles {
        if let Err(e) = agent.streams.start_stream(h.id) {
            return traffic_failure(agent, e);
        }
    }
    Outcome::Complete(None)
}

pub fn receive_stop(agent: &mut AgentState, _: &ConnContext, p: &ParamSet) -> Outcome {
    let handles = match role_handles(agent, p, Role::Receiver) {
        Ok(h) => h,
        Err(o) => return o,
    };
    for h in &handles {
        if let Err(e) = agent.streams.stop_stream(h.id) {
            return traffic_failure(agent, e);
        }
    }

    let with_records = agent.stats_dir.is_some();
    let reports: Vec<StreamReport> = handles.iter().map(|h| report(h, with_records)).collect();
    if let Some(dir) = &agent.stats_dir {
        for r in &reports {
            match write_e2e(dir, r) {
                Ok(path) => info!(stream_id = r.id, path = %path.display(), "wrote frame records"),
                Err(e) => warn!(stream_id = r.id, error = %e, "cannot write frame records"),
            }
        }
    }
    Outcome::Sent(WireResponse::complete(Some(format_stats(&reports))))
}

/* ---------- helpers ---------- */

fn traffic_failure(agent: &mut AgentState, e: TrafficError) -> Outcome {
    if e.is_fatal() {
        agent.set_fatal(e.to_string());
    }
    match e {
        TrafficError::UnknownStream(_) | TrafficError::AlreadyRunning(_) => {
            Outcome::invalid(&e.to_string())
        }
        _ => Outcome::error(&e.to_string()),
    }
}

/// Resolve `streamID` to stream handles, all of which must have `role`.
fn role_handles(
    agent: &AgentState,
    p: &ParamSet,
    role: Role,
) -> Result<Vec<Arc<StreamShared>>, Outcome> {
    let ids = parse_ids(p).map_err(|e| Outcome::invalid(&e.to_string()))?;
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        let h = agent
            .streams
            .handle(id)
            .map_err(|e| Outcome::invalid(&e.to_string()))?;
        if h.params.role != role {
            return Err(Outcome::invalid(&format!(
                "stream {} is not a {} stream",
                id,
                match role {
                    Role::Sender => "send",
                    Role::Receiver => "receive",
                }
            )));
        }
        out.push(h);
    }
    Ok(out)
}

/// How long a sender should take on its own, if it ends on its own.
fn expected_runtime(p: &StreamParams) -> Option<Duration> {
    let delay = if p.profile == Profile::StartSync {
        p.start_delay
    } else {
        Duration::ZERO
    };
    if !p.duration.is_zero() {
        return Some(p.duration + delay);
    }
    if p.max_cnt == 0 {
        return None;
    }
    let run = if p.frame_rate > 0 {
        Duration::from_secs_f64(p.max_cnt as f64 / p.frame_rate as f64)
    } else {
        Duration::from_secs(60)
    };
    Some(run + delay)
}

/// Wait for every sender to finish, stopping any that overrun `limit`.
/// A sender still running `grace` after its stop request is a
/// [`TrafficError::StopTimeout`].
fn watch_senders(
    handles: &[Arc<StreamShared>],
    limit: Duration,
    grace: Duration,
) -> Result<WireResponse, TrafficError> {
    for h in handles {
        if h.wait_stopped(limit) {
            continue;
        }
        warn!(stream_id = h.id, ?limit, "sender overran its schedule, stopping it");
        h.request_stop();
        if !h.wait_stopped(grace) {
            return Err(TrafficError::StopTimeout { id: h.id, grace });
        }
    }
    let reports: Vec<StreamReport> = handles.iter().map(|h| report(h, false)).collect();
    for r in &reports {
        if let Some(e) = &r.error {
            warn!(stream_id = r.id, error = e.as_str(), "sender ended with error");
        }
    }
    Ok(WireResponse::complete(Some(format_stats(&reports))))
}

pub fn parse_ids(p: &ParamSet) -> Result<Vec<u32>, ParamError> {
    let raw = p.get("streamID").ok_or(ParamError::Missing("streamID"))?;
    let ids = raw
        .split_whitespace()
        .map(|s| {
            s.parse::<u32>()
                .map_err(|_| ParamError::Bad("streamID", s.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if ids.is_empty() {
        return Err(ParamError::Missing("streamID"));
    }
    Ok(ids)
}

pub fn stream_params(p: &ParamSet) -> Result<StreamParams, ParamError> {
    let d = StreamParams::default();
    Ok(StreamParams {
        profile: req_enum(p, "profile")?,
        role: req_enum(p, "direction")?,
        dst: opt_parse(p, "destination")?.unwrap_or(Ipv4Addr::UNSPECIFIED),
        dst_port: opt_parse(p, "destinationPort")?.unwrap_or(0),
        src: opt_parse(p, "source")?.unwrap_or(Ipv4Addr::UNSPECIFIED),
        src_port: opt_parse(p, "sourcePort")?.unwrap_or(0),
        frame_rate: opt_parse(p, "frameRate")?.unwrap_or(d.frame_rate),
        duration: opt_parse(p, "duration")?
            .map(Duration::from_secs)
            .unwrap_or(d.duration),
        payload_size: opt_parse(p, "payloadSize")?.unwrap_or(d.payload_size),
        start_delay: opt_parse(p, "startDelay")?
            .map(Duration::from_secs)
            .unwrap_or(d.start_delay),
        max_cnt: opt_parse(p, "maxCnt")?.unwrap_or(d.max_cnt),
        tc: match p.get("trafficClass") {
            Some(_) => req_enum(p, "trafficClass")?,
            None => d.tc,
        },
        user_priority: opt_parse(p, "userPriority")?,
        frames_per_trigger: opt_parse(p, "framesPerTrigger")?.unwrap_or(d.frames_per_trigger),
        sta_id: opt_parse(p, "staID")?.unwrap_or(d.sta_id),
    })
}

fn req_enum<T: FromStr>(p: &ParamSet, k: &'static str) -> Result<T, ParamError> {
    let v = p.get(k).ok_or(ParamError::Missing(k))?;
    T::from_str(v).map_err(|_| ParamError::Bad(k, v.to_string()))
}

fn opt_parse<T: FromStr>(p: &ParamSet, k: &'static str) -> Result<Option<T>, ParamError> {
    match p.get(k).map(str::trim) {
        None | Some("") => Ok(None),
        Some(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|_| ParamError::Bad(k, v.to_string())),
    }
}

/// `streamID,1 2,txFrames,a b,...`: one space-separated column per stream.
/// Delay and jitter are whole microseconds from the stored records.
pub fn format_stats(reports: &[StreamReport]) -> String {
    format!(
        "streamID,{},txFrames,{},rxFrames,{},txPayloadBytes,{},rxPayloadBytes,{},\
         outSeqFrames,{},txActFrames,{},badFrames,{},lostFrames,{},droppedRecords,{},\
         meanDelayUs,{},jitterUs,{}",
        col(reports, |r| r.id.to_string()),
        col(reports, |r| r.counters.tx_frames.to_string()),
        col(reports, |r| r.counters.rx_frames.to_string()),
        col(reports, |r| r.counters.tx_payload_bytes.to_string()),
        col(reports, |r| r.counters.rx_payload_bytes.to_string()),
        col(reports, |r| r.counters.out_of_seq_frames.to_string()),
        col(reports, |r| r.counters.tx_act_frames.to_string()),
        col(reports, |r| r.counters.bad_frames.to_string()),
        col(reports, |r| r.summary.lost.to_string()),
        col(reports, |r| r.dropped_records.to_string()),
        col(reports, |r| format!("{:.0}", r.summary.mean_delay_us)),
        col(reports, |r| format!("{:.0}", r.summary.jitter_us)),
    )
}

fn col(reports: &[StreamReport], f: impl Fn(&StreamReport) -> String) -> String {
    reports.iter().map(f).collect::<Vec<_>>().join(" ")
}

/// Dump a receiver's frame records to `<dir>/e2e<id>.txt`, one line per
/// record: `seq local_sec.usec remote_sec.usec`.
pub fn write_e2e(dir: &Path, r: &StreamReport) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(format!("e2e{}.txt", r.id));
    let file = fs::File::create(&path).with_context(|| format!("creating {}", path.display()))?;
    let mut w = BufWriter::new(file);
    for rec in r.records.as_deref().unwrap_or_default() {
        writeln!(
            w,
            "{} {}.{:06} {}.{:06}",
            rec.seq, rec.local.sec, rec.local.usec, rec.remote.sec, rec.remote.usec
        )?;
    }
    w.flush().context("flushing frame records")?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Completion;
    use crate::proto::{Status, parse_command};
    use crate::traffic::CounterSnapshot;
    use crate::traffic::frame::Timestamp;
    use crate::traffic::{FrameRecord, StreamState, Summary, TrafficClass};
    use std::net::UdpSocket;
    use std::sync::mpsc;

    fn params(line: &str) -> ParamSet {
        parse_command(line).unwrap().params
    }

    fn conn() -> (ConnContext, mpsc::Receiver<Completion>) {
        let (tx, rx) = mpsc::channel();
        (ConnContext::new(7, tx), rx)
    }

    #[test]
    fn config_params_parsed() {
        let p = params(
            "traffic_agent_config,profile,Start_Sync,direction,send,destination,192.168.250.20,\
             destinationPort,5001,frameRate,50,duration,10,payloadSize,512,startDelay,2,\
             trafficClass,Voice,userPriority,6",
        );
        let sp = stream_params(&p).unwrap();
        assert_eq!(sp.profile, Profile::StartSync);
        assert_eq!(sp.role, Role::Sender);
        assert_eq!(sp.dst, Ipv4Addr::new(192, 168, 250, 20));
        assert_eq!(sp.dst_port, 5001);
        assert_eq!(sp.frame_rate, 50);
        assert_eq!(sp.duration, Duration::from_secs(10));
        assert_eq!(sp.payload_size, 512);
        assert_eq!(sp.start_delay, Duration::from_secs(2));
        assert_eq!(sp.tc, TrafficClass::Voice);
        assert_eq!(sp.user_priority, Some(6));
        assert_eq!(expected_runtime(&sp), Some(Duration::from_secs(12)));
    }

    #[test]
    fn config_param_errors() {
        assert_eq!(
            stream_params(&params("c,profile,bulk,direction,send")),
            Err(ParamError::Bad("profile", "bulk".into()))
        );
        assert_eq!(
            stream_params(&params("c,profile,IPTV,direction,send,destinationPort,x")),
            Err(ParamError::Bad("destinationPort", "x".into()))
        );
        assert_eq!(
            stream_params(&params("c,direction,send")),
            Err(ParamError::Missing("profile"))
        );
    }

    #[test]
    fn stream_id_lists() {
        assert_eq!(parse_ids(&params("c,streamID,1 2  3")).unwrap(), [1, 2, 3]);
        assert!(parse_ids(&params("c,streamID, ")).is_err());
        assert!(parse_ids(&params("c,streamID,1 two")).is_err());
    }

    #[test]
    fn stats_columns() {
        let mk = |id: u32, tx: u64, rx: u64| StreamReport {
            id,
            state: StreamState::Stopped,
            counters: CounterSnapshot {
                tx_act_frames: tx + 1,
                tx_frames: tx,
                rx_frames: rx,
                tx_payload_bytes: tx * 100,
                rx_payload_bytes: rx * 100,
                out_of_seq_frames: 0,
                bad_frames: 1,
            },
            summary: Summary {
                lost: rx / 3,
                mean_delay_us: 250.4,
                jitter_us: 12.6,
            },
            dropped_records: 0,
            error: None,
            records: None,
        };
        assert_eq!(
            format_stats(&[mk(1, 10, 0), mk(2, 0, 9)]),
            "streamID,1 2,txFrames,10 0,rxFrames,0 9,txPayloadBytes,1000 0,\
             rxPayloadBytes,0 900,outSeqFrames,0 0,txActFrames,11 1,badFrames,1 1,\
             lostFrames,0 3,droppedRecords,0 0,meanDelayUs,250 250,jitterUs,13 13"
        );
    }

    #[test]
    fn e2e_file_written() {
        let dir = tempfile::TempDir::new().unwrap();
        let r = StreamReport {
            id: 4,
            state: StreamState::Stopped,
            counters: CounterSnapshot::default(),
            summary: Summary::default(),
            dropped_records: 0,
            error: None,
            records: Some(vec![FrameRecord {
                seq: 1,
                local: Timestamp { sec: 10, usec: 5 },
                remote: Timestamp { sec: 9, usec: 999_000 },
            }]),
        };
        let path = write_e2e(&dir.path().join("stats"), &r).unwrap();
        assert!(path.ends_with("e2e4.txt"));
        assert_eq!(
            fs::read_to_string(path).unwrap(),
            "1 10.000005 9.999000\n"
        );
    }

    #[test]
    fn send_runs_then_completes_with_stats() {
        let sink = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = sink.local_addr().unwrap().port();
        let mut agent = AgentState::default();
        let (c, rx) = conn();

        let cfg = params(&format!(
            "traffic_agent_config,profile,File_Transfer,direction,send,destination,127.0.0.1,\
             destinationPort,{},frameRate,1000,maxCnt,25,payloadSize,100",
            port
        ));
        assert_eq!(config(&mut agent, &c, &cfg), Outcome::Complete(Some("streamID,1".into())));

        assert_eq!(send(&mut agent, &c, &params("s,streamID,1")), Outcome::Running);
        let done = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(done.conn_id, 7);
        assert_eq!(done.response.status, Status::Complete);
        assert_eq!(
            done.response.payload.as_deref(),
            Some(
                "streamID,1,txFrames,25,rxFrames,0,txPayloadBytes,2500,\
                 rxPayloadBytes,0,outSeqFrames,0,txActFrames,25,badFrames,0,\
                 lostFrames,0,droppedRecords,0,meanDelayUs,0,jitterUs,0"
            )
        );
        assert_eq!(done.fatal, None);
    }

    #[test]
    fn stuck_sender_is_a_stop_timeout() {
        let h = Arc::new(StreamShared::new(3, StreamParams::default(), 10, 1));
        // running with no worker to ever mark it stopped
        h.set_state(StreamState::Running);
        let r = watch_senders(
            &[Arc::clone(&h)],
            Duration::from_millis(20),
            Duration::from_millis(20),
        );
        assert!(matches!(r, Err(TrafficError::StopTimeout { id: 3, .. })));
        assert!(h.stop_requested());
    }

    #[test]
    fn failed_send_stops_senders_already_started() {
        let sink = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = sink.local_addr().unwrap().port();
        let mut agent = AgentState::default();
        let (c, _rx) = conn();
        let line = format!(
            "c,profile,File_Transfer,direction,send,destination,127.0.0.1,\
             destinationPort,{},frameRate,100,duration,30",
            port
        );
        config(&mut agent, &c, &params(&line));
        config(&mut agent, &c, &params(&line));
        agent.streams.start_stream(2).unwrap();

        assert!(matches!(
            send(&mut agent, &c, &params("s,streamID,1 2")),
            Outcome::Invalid(_)
        ));
        assert_eq!(agent.streams.state(1), Some(StreamState::Stopped));
        assert_eq!(agent.streams.state(2), Some(StreamState::Running));
        assert_eq!(agent.take_fatal(), None);
        agent.streams.reset().unwrap();
    }

    #[test]
    fn send_rejects_receivers_and_unbounded_streams() {
        let mut agent = AgentState::default();
        let (c, _rx) = conn();
        config(&mut agent, &c, &params("c,profile,IPTV,direction,receive,destinationPort,0"));
        config(
            &mut agent,
            &c,
            &params("c,profile,IPTV,direction,send,destination,127.0.0.1,destinationPort,9"),
        );
        assert!(matches!(
            send(&mut agent, &c, &params("s,streamID,1")),
            Outcome::Invalid(_)
        ));
        assert!(matches!(
            send(&mut agent, &c, &params("s,streamID,2")),
            Outcome::Invalid(_)
        ));
        assert!(matches!(
            send(&mut agent, &c, &params("s,streamID,9")),
            Outcome::Invalid(_)
        ));
    }

    #[test]
    fn receive_start_stop_reports_and_dumps() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut agent = AgentState::default();
        agent.stats_dir = Some(dir.path().to_path_buf());
        let (c, _rx) = conn();

        config(&mut agent, &c, &params("c,profile,File_Transfer,direction,receive"));
        assert_eq!(
            receive_start(&mut agent, &c, &params("r,streamID,1")),
            Outcome::Complete(None)
        );
        let port = agent.streams.handle(1).unwrap().local_addr().unwrap().port();

        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut out = Vec::new();
        for seq in [1, 2, 4, 3, 5] {
            crate::traffic::frame::build_frame(&mut out, seq, Some(Timestamp::now()), 64);
            tx.send_to(&out, ("127.0.0.1", port)).unwrap();
        }
        thread::sleep(Duration::from_millis(200));

        match receive_stop(&mut agent, &c, &params("r,streamID,1")) {
            Outcome::Sent(resp) => {
                let payload = resp.payload.unwrap();
                assert!(
                    payload.starts_with(
                        "streamID,1,txFrames,0,rxFrames,5,txPayloadBytes,0,rxPayloadBytes,320,\
                         outSeqFrames,1,txActFrames,0,badFrames,0,lostFrames,0,droppedRecords,0,\
                         meanDelayUs,"
                    ),
                    "{}",
                    payload
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        let dump = fs::read_to_string(dir.path().join("e2e1.txt")).unwrap();
        assert_eq!(dump.lines().count(), 5);

        assert_eq!(reset(&mut agent, &c, &ParamSet::new()), Outcome::Complete(None));
        assert!(agent.streams.is_empty());
    }
}
