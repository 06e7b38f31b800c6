// src/proto/parser.rs
use thiserror::Error;

use super::command::{Command, MAX_PARAMS, ParamSet, WireResponse};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("missing command name")]
    MissingTag,
    #[error("parameter {0} has no value")]
    MissingValue(String),
    #[error("empty parameter name")]
    EmptyName,
    #[error("duplicate parameter: {0}")]
    Duplicate(String),
    #[error("too many parameters (max {MAX_PARAMS})")]
    TooMany,
}

const SEP: char = ',';

/// Public API: parse one framed line (`NAME,k1,v1,k2,v2,...`) into a command.
pub fn parse_command(line: &str) -> Result<Command, ParseError> {
    let s = line.trim_matches(|c| c == '\r' || c == '\n' || c == ' ');
    if s.is_empty() {
        return Err(ParseError::Empty);
    }

    let mut tokens = s.split(SEP);
    let name = tokens.next().map(str::trim).unwrap_or_default();
    if name.is_empty() {
        return Err(ParseError::MissingTag);
    }

    let mut params = ParamSet::new();
    while let Some(key) = tokens.next() {
        let key = key.trim();
        let value = tokens
            .next()
            .ok_or_else(|| ParseError::MissingValue(key.to_string()))?;
        if key.is_empty() {
            return Err(ParseError::EmptyName);
        }
        if params.len() >= MAX_PARAMS {
            return Err(ParseError::TooMany);
        }
        if !params.insert(key, value.trim()) {
            return Err(ParseError::Duplicate(key.to_string()));
        }
    }

    Ok(Command {
        name: name.to_string(),
        params,
    })
}

/// Public API: serialize a response to a CRLF-terminated status line.
pub fn format_response(resp: &WireResponse) -> String {
    let mut out = String::from("status,");
    out.push_str(resp.status.as_str());
    if let Some(p) = &resp.payload
        && !p.is_empty()
    {
        out.push(SEP);
        out.push_str(p);
    }
    out.push_str("\r\n");
    out
}

/* ---------- tests ---------- */
