//! Command dispatch: parse, look up, validate, process, answer.

use std::sync::mpsc::Sender;

use tracing::{debug, info, warn};

use crate::agent::AgentState;
use crate::proto::{Status, WireResponse, parse_command};

pub mod registry;

pub use registry::{CommandRegistry, Processor, RegistryBuilder, RegistryError, Validator, any_params};

/// What a processor did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The processor built the whole response itself; it goes out as is.
    Sent(WireResponse),
    /// `status,COMPLETE` with an optional `field,value,...` tail.
    Complete(Option<String>),
    /// `status,INVALID`, tail usually `errorCode,...`.
    Invalid(Option<String>),
    /// `status,ERROR`, tail usually `errorCode,...`.
    Error(Option<String>),
    /// Work continues in the background; the final status arrives through
    /// the connection's [`Completer`].
    Running,
}

impl Outcome {
    pub fn invalid(reason: &str) -> Self {
        Outcome::Invalid(Some(format!("errorCode,{}", reason)))
    }

    pub fn error(reason: &str) -> Self {
        Outcome::Error(Some(format!("errorCode,{}", reason)))
    }
}

/// Terminal response for a command that answered `RUNNING`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub conn_id: u64,
    pub response: WireResponse,
    /// Set when the deferred work hit an error the process cannot recover
    /// from; the control loop shuts down once the response is written.
    pub fatal: Option<String>,
}

/// Delivers a deferred command's final status to its connection.
#[derive(Debug, Clone)]
pub struct Completer {
    conn_id: u64,
    tx: Sender<Completion>,
}

impl Completer {
    pub fn complete(self, response: WireResponse) {
        self.deliver(response, None);
    }

    /// Finish the command and take the agent down after the response.
    pub fn complete_fatal(self, response: WireResponse, why: String) {
        self.deliver(response, Some(why));
    }

    fn deliver(self, response: WireResponse, fatal: Option<String>) {
        let conn_id = self.conn_id;
        let c = Completion {
            conn_id,
            response,
            fatal,
        };
        if self.tx.send(c).is_err() {
            warn!(conn_id, "control loop gone, completion dropped");
        }
    }
}

/// Per-connection dispatch state.
#[derive(Debug)]
pub struct ConnContext {
    id: u64,
    waiting: bool,
    completions: Sender<Completion>,
}

impl ConnContext {
    pub fn new(id: u64, completions: Sender<Completion>) -> Self {
        Self {
            id,
            waiting: false,
            completions,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// A deferred command is outstanding on this connection.
    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    /// Handle a processor keeps to finish a command it answers with
    /// [`Outcome::Running`].
    pub fn completer(&self) -> Completer {
        Completer {
            conn_id: self.id,
            tx: self.completions.clone(),
        }
    }

    /// Accept a completion if it belongs to this connection's outstanding
    /// command.
    pub fn finish(&mut self, c: &Completion) -> bool {
        if c.conn_id != self.id || !self.waiting {
            return false;
        }
        self.waiting = false;
        true
    }
}

pub struct Dispatcher {
    registry: CommandRegistry,
}

impl Dispatcher {
    pub fn new(registry: CommandRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Run one command line to its immediate response.
    pub fn dispatch(&self, agent: &mut AgentState, conn: &mut ConnContext, line: &str) -> WireResponse {
        if conn.waiting {
            warn!(conn_id = conn.id, line, "command while another is in progress");
            return WireResponse::with_error_code(Status::Invalid, "Command in progress");
        }

        let cmd = match parse_command(line) {
            Ok(c) => c,
            Err(e) => {
                warn!(conn_id = conn.id, error = %e, line, "unparsable command");
                return WireResponse::with_error_code(Status::Invalid, &e.to_string());
            }
        };

        info!(conn_id = conn.id, cmd = cmd.name.as_str(), params = cmd.params.len(), "command");

        let Some(reg) = self.registry.get(&cmd.name) else {
            warn!(cmd = cmd.name.as_str(), "unknown command");
            return WireResponse::with_error_code(Status::Error, "Unknown command");
        };

        if !(reg.validate)(&cmd.params) {
            debug!(cmd = cmd.name.as_str(), "parameters rejected by validator");
            return WireResponse::with_error_code(Status::Invalid, "Invalid parameters");
        }

        let resp = match (reg.process)(agent, conn, &cmd.params) {
            Outcome::Sent(resp) => resp,
            Outcome::Complete(payload) => WireResponse::complete(payload),
            Outcome::Invalid(payload) => WireResponse::invalid(payload),
            Outcome::Error(payload) => WireResponse::error(payload),
            Outcome::Running => {
                conn.waiting = true;
                WireResponse::running()
            }
        };
        debug!(cmd = cmd.name.as_str(), status = %resp.status, "command done");
        resp
    }
}
