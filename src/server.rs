//! TCP control loop.
//!
//! One controller connection is served at a time. Each complete line is
//! dispatched before more bytes are read; deferred completions are written
//! back between reads.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use crate::agent::AgentState;
use crate::dispatch::{Completion, ConnContext, Dispatcher};
use crate::proto::{FramerError, LineFramer, Status, WireResponse, format_response};

/// How often an idle connection checks for deferred completions.
const IDLE_POLL: Duration = Duration::from_millis(50);

enum ConnEnd {
    Closed,
    Fatal(String),
}

pub struct Server {
    listener: TcpListener,
    dispatcher: Dispatcher,
    agent: AgentState,
    max_cmd_len: usize,
    done_tx: Sender<Completion>,
    done_rx: Receiver<Completion>,
    next_conn: u64,
}

impl Server {
    pub fn bind(
        addr: &str,
        dispatcher: Dispatcher,
        agent: AgentState,
        max_cmd_len: usize,
    ) -> Result<Self> {
        let listener =
            TcpListener::bind(addr).with_context(|| format!("binding control port {}", addr))?;
        Ok(Self::from_listener(listener, dispatcher, agent, max_cmd_len))
    }

    pub fn from_listener(
        listener: TcpListener,
        dispatcher: Dispatcher,
        agent: AgentState,
        max_cmd_len: usize,
    ) -> Self {
        let (done_tx, done_rx) = mpsc::channel();
        Self {
            listener,
            dispatcher,
            agent,
            max_cmd_len,
            done_tx,
            done_rx,
            next_conn: 1,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("reading control listener address")
    }

    /// Serve controllers until a fatal internal error.
    pub fn run(mut self) -> Result<()> {
        info!(addr = %self.local_addr()?, "control server listening");
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let conn_id = self.next_conn;
            self.next_conn += 1;
            info!(conn_id, %peer, "controller connected");

            match self.serve_conn(stream, conn_id) {
                Ok(ConnEnd::Closed) => info!(conn_id, "controller disconnected"),
                Ok(ConnEnd::Fatal(why)) => bail!("fatal: {}", why),
                Err(e) => warn!(conn_id, error = %e, "connection dropped"),
            }
        }
    }

    fn serve_conn(&mut self, mut stream: TcpStream, conn_id: u64) -> Result<ConnEnd> {
        stream
            .set_read_timeout(Some(IDLE_POLL))
            .context("setting control read timeout")?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!(conn_id, error = %e, "cannot disable Nagle on control connection");
        }

        let mut conn = ConnContext::new(conn_id, self.done_tx.clone());
        let mut framer = LineFramer::new(self.max_cmd_len);
        let mut buf = [0u8; 1024];

        loop {
            while let Ok(c) = self.done_rx.try_recv() {
                if conn.finish(&c) {
                    debug!(conn_id, status = %c.response.status, "deferred command finished");
                    send(&mut stream, &c.response)?;
                } else {
                    debug!(conn_id = c.conn_id, "completion for a closed connection dropped");
                }
                if let Some(why) = c.fatal {
                    self.agent.set_fatal(why);
                }
                if let Some(why) = self.agent.take_fatal() {
                    return Ok(ConnEnd::Fatal(why));
                }
            }

            let n = match stream.read(&mut buf) {
                Ok(0) => return Ok(ConnEnd::Closed),
                Ok(n) => n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    continue;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("reading from controller"),
            };
            framer.push(&buf[..n]);

            loop {
                let resp = match framer.next_line() {
                    Ok(Some(line)) => {
                        self.dispatcher
                            .dispatch(&mut self.agent, &mut conn, &line)
                    }
                    Ok(None) => break,
                    Err(e @ FramerError::OversizeCommand { .. }) => {
                        warn!(conn_id, error = %e, "command line dropped");
                        WireResponse::with_error_code(Status::Invalid, "Command too long")
                    }
                    Err(e) => {
                        warn!(conn_id, error = %e, "command line dropped");
                        WireResponse::with_error_code(Status::Invalid, &e.to_string())
                    }
                };
                send(&mut stream, &resp)?;
                if let Some(why) = self.agent.take_fatal() {
                    return Ok(ConnEnd::Fatal(why));
                }
            }
        }
    }
}

fn send(stream: &mut TcpStream, resp: &WireResponse) -> Result<()> {
    stream
        .write_all(format_response(resp).as_bytes())
        .context("writing response")
}
