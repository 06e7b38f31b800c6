use std::fmt;

/// Maximum number of name/value pairs one command may carry.
pub const MAX_PARAMS: usize = 100;

/// Decoded name/value pairs of one command, in the order they arrived.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamSet {
    pairs: Vec<(String, String)>,
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pair. Returns `false` if `name` is already present
    /// (ASCII case-insensitive).
    pub(crate) fn insert(&mut self, name: &str, value: &str) -> bool {
        if self.contains(name) {
            return false;
        }
        self.pairs.push((name.to_string(), value.to_string()));
        true
    }

    /// Value for `name`, matched ASCII case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// One parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub params: ParamSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    Complete,
    Invalid,
    Error,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Running => "RUNNING",
            Status::Complete => "COMPLETE",
            Status::Invalid => "INVALID",
            Status::Error => "ERROR",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status line as sent to the controller: `status,<STATUS>[,<payload>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireResponse {
    pub status: Status,
    /// Comma-separated `field,value,...` tail, without the leading comma.
    pub payload: Option<String>,
}

impl WireResponse {
    pub fn new(status: Status, payload: Option<String>) -> Self {
        Self { status, payload }
    }

    pub fn running() -> Self {
        Self::new(Status::Running, None)
    }

    pub fn complete(payload: Option<String>) -> Self {
        Self::new(Status::Complete, payload)
    }

    pub fn invalid(payload: Option<String>) -> Self {
        Self::new(Status::Invalid, payload)
    }

    pub fn error(payload: Option<String>) -> Self {
        Self::new(Status::Error, payload)
    }

    /// `errorCode,<reason>` tail used for rejected commands.
    pub fn with_error_code(status: Status, reason: &str) -> Self {
        Self::new(status, Some(format!("errorCode,{}", reason)))
    }
}
