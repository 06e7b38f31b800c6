//! Splits the control byte stream into command lines.

use thiserror::Error;

/// Longest command line accepted, terminator excluded.
pub const MAX_CMD_LEN: usize = 2048;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramerError {
    #[error("command exceeds {limit} bytes")]
    OversizeCommand { limit: usize },
    #[error("command is not valid UTF-8")]
    NotUtf8,
}

/// Accumulates socket bytes and hands out complete lines.
///
/// `push` never blocks; the caller owns the read loop and calls
/// `next_line` until it returns `Ok(None)` ("need more data").
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    limit: usize,
    /// Set after an oversize line: swallow bytes up to the next terminator.
    discarding: bool,
}

impl LineFramer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit + 5),
            limit,
            discarding: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes currently held that do not yet form a complete line.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn next_line(&mut self) -> Result<Option<String>, FramerError> {
        loop {
            let Some(nl) = self.buf.iter().position(|&b| b == b'\n') else {
                if self.discarding {
                    self.buf.clear();
                    return Ok(None);
                }
                // a trailing '\r' may still be followed by its '\n'
                let held = self.buf.len() - usize::from(self.buf.last() == Some(&b'\r'));
                if held > self.limit {
                    self.buf.clear();
                    self.discarding = true;
                    return Err(FramerError::OversizeCommand { limit: self.limit });
                }
                return Ok(None);
            };

            let mut line: Vec<u8> = self.buf.drain(..=nl).collect();
            if self.discarding {
                // tail of the rejected line
                self.discarding = false;
                continue;
            }
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.len() > self.limit {
                return Err(FramerError::OversizeCommand { limit: self.limit });
            }
            if line.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }
            return String::from_utf8(line)
                .map(Some)
                .map_err(|_| FramerError::NotUtf8);
        }
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(MAX_CMD_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_then_complete() {
        let mut f = LineFramer::default();
        f.push(b"ca_get_");
        assert_eq!(f.next_line(), Ok(None));
        f.push(b"version\r\n");
        assert_eq!(f.next_line(), Ok(Some("ca_get_version".into())));
        assert_eq!(f.next_line(), Ok(None));
        assert_eq!(f.pending(), 0);
    }

    #[test]
    fn several_lines_in_one_read() {
        let mut f = LineFramer::default();
        f.push(b"a,k,v\r\n\r\nb\nc,x");
        assert_eq!(f.next_line(), Ok(Some("a,k,v".into())));
        assert_eq!(f.next_line(), Ok(Some("b".into())));
        assert_eq!(f.next_line(), Ok(None));
        assert_eq!(f.pending(), 3);
    }

    #[test]
    fn oversize_line_dropped() {
        let mut f = LineFramer::new(16);
        f.push(&[b'x'; 20]);
        assert_eq!(
            f.next_line(),
            Err(FramerError::OversizeCommand { limit: 16 })
        );
        // rest of the oversize line is swallowed, the next one survives
        f.push(b"yyyy\r\nok\r\n");
        assert_eq!(f.next_line(), Ok(Some("ok".into())));
    }

    #[test]
    fn full_length_line_with_split_terminator() {
        let mut f = LineFramer::new(16);
        f.push(b"xxxxxxxxxxxxxxxx\r");
        assert_eq!(f.next_line(), Ok(None));
        f.push(b"\n");
        assert_eq!(f.next_line(), Ok(Some("x".repeat(16))));

        // one byte more is still too long
        f.push(b"xxxxxxxxxxxxxxxxx\r");
        assert_eq!(
            f.next_line(),
            Err(FramerError::OversizeCommand { limit: 16 })
        );
        f.push(b"\nok\n");
        assert_eq!(f.next_line(), Ok(Some("ok".into())));
    }

    #[test]
    fn oversize_complete_line_rejected() {
        let mut f = LineFramer::new(4);
        f.push(b"abcdef\nab\n");
        assert!(f.next_line().is_err());
        assert_eq!(f.next_line(), Ok(Some("ab".into())));
    }
}
