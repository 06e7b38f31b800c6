//! Traffic frame layout.
//!
//! Every datagram starts with a 12 byte big-endian header: sequence number,
//! sender seconds, sender microseconds. The rest is a fill pattern. Two
//! reserved sequence numbers mark power-save control frames.

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

pub const HEADER_LEN: usize = 12;
/// Header plus the cookie word carried by power-save frames.
pub const COOKIE_FRAME_LEN: usize = HEADER_LEN + 4;
pub const TRIGGER_FRAME_LEN: usize = HEADER_LEN + 8;

pub const TRIGGER_SEQ: u32 = 0xFFFF_FFFF;
pub const AWAKE_SEQ: u32 = 0xFFFF_FFFE;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp {
    pub sec: u32,
    pub usec: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            sec: d.as_secs() as u32,
            usec: d.subsec_micros(),
        }
    }

    pub fn as_micros(self) -> i64 {
        self.sec as i64 * 1_000_000 + self.usec as i64
    }

    pub fn is_zero(self) -> bool {
        self.sec == 0 && self.usec == 0
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("short frame: {got} bytes, need {need}")]
    Short { got: usize, need: usize },
}

/// Header of a received data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub seq: u32,
    pub sent: Timestamp,
    pub len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datagram {
    Data(Frame),
    /// Power-save poll trigger from the station.
    Trigger { cookie: u32, sta_id: u32 },
    /// Station left power-save.
    Awake,
}

fn be32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

pub fn parse_frame(buf: &[u8]) -> Result<Datagram, FrameError> {
    if buf.len() < HEADER_LEN {
        return Err(FrameError::Short {
            got: buf.len(),
            need: HEADER_LEN,
        });
    }
    let seq = be32(buf, 0);
    match seq {
        TRIGGER_SEQ => {
            if buf.len() < TRIGGER_FRAME_LEN {
                return Err(FrameError::Short {
                    got: buf.len(),
                    need: TRIGGER_FRAME_LEN,
                });
            }
            Ok(Datagram::Trigger {
                cookie: be32(buf, HEADER_LEN),
                sta_id: be32(buf, HEADER_LEN + 4),
            })
        }
        AWAKE_SEQ => Ok(Datagram::Awake),
        _ => Ok(Datagram::Data(Frame {
            seq,
            sent: Timestamp {
                sec: be32(buf, 4),
                usec: be32(buf, 8),
            },
            len: buf.len(),
        })),
    }
}

/// Cookie word of a power-save data frame, if the frame is long enough.
pub fn frame_cookie(buf: &[u8]) -> Option<u32> {
    (buf.len() >= COOKIE_FRAME_LEN).then(|| be32(buf, HEADER_LEN))
}

/// Fill `out` with a data frame of `len` bytes (at least the header).
/// Payload byte `i` is `(i + seq) & 0xff`.
pub fn build_frame(out: &mut Vec<u8>, seq: u32, stamp: Option<Timestamp>, len: usize) {
    let len = len.max(HEADER_LEN);
    let ts = stamp.unwrap_or_default();
    out.clear();
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&ts.sec.to_be_bytes());
    out.extend_from_slice(&ts.usec.to_be_bytes());
    for i in HEADER_LEN..len {
        out.push(((i as u64 + seq as u64) & 0xFF) as u8);
    }
}

/// Overwrite the cookie word of a frame built by [`build_frame`].
pub fn stamp_cookie(out: &mut Vec<u8>, cookie: u32) {
    if out.len() < COOKIE_FRAME_LEN {
        out.resize(COOKIE_FRAME_LEN, 0);
    }
    out[HEADER_LEN..COOKIE_FRAME_LEN].copy_from_slice(&cookie.to_be_bytes());
}

pub fn build_trigger(cookie: u32, sta_id: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(TRIGGER_FRAME_LEN);
    build_frame(&mut out, TRIGGER_SEQ, Some(Timestamp::now()), HEADER_LEN);
    out.extend_from_slice(&cookie.to_be_bytes());
    out.extend_from_slice(&sta_id.to_be_bytes());
    out
}

pub fn build_awake() -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN);
    build_frame(&mut out, AWAKE_SEQ, Some(Timestamp::now()), HEADER_LEN);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_header() {
        let mut out = Vec::new();
        let ts = Timestamp { sec: 7, usec: 500 };
        build_frame(&mut out, 42, Some(ts), 64);
        assert_eq!(out.len(), 64);
        assert_eq!(out[HEADER_LEN], ((HEADER_LEN + 42) & 0xFF) as u8);
        match parse_frame(&out).unwrap() {
            Datagram::Data(f) => {
                assert_eq!(f.seq, 42);
                assert_eq!(f.sent, ts);
                assert_eq!(f.len, 64);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn small_payload_padded_to_header() {
        let mut out = Vec::new();
        build_frame(&mut out, 1, None, 4);
        assert_eq!(out.len(), HEADER_LEN);
        assert_eq!(&out[4..12], &[0u8; 8]);
    }

    #[test]
    fn short_frames_rejected() {
        assert_eq!(
            parse_frame(&[0u8; 5]),
            Err(FrameError::Short { got: 5, need: 12 })
        );
        let mut trig = build_trigger(9, 1);
        trig.truncate(14);
        assert!(parse_frame(&trig).is_err());
    }

    #[test]
    fn control_frames() {
        assert_eq!(
            parse_frame(&build_trigger(0xABCD, 3)),
            Ok(Datagram::Trigger {
                cookie: 0xABCD,
                sta_id: 3
            })
        );
        assert_eq!(parse_frame(&build_awake()), Ok(Datagram::Awake));
    }

    #[test]
    fn cookie_stamping() {
        let mut out = Vec::new();
        build_frame(&mut out, 5, None, HEADER_LEN);
        stamp_cookie(&mut out, 77);
        assert_eq!(out.len(), COOKIE_FRAME_LEN);
        assert_eq!(frame_cookie(&out), Some(77));
        assert_eq!(frame_cookie(&out[..HEADER_LEN]), None);
    }
}
