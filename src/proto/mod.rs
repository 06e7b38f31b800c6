pub mod command;
pub mod framer;
pub mod parser;

pub use command::{Command, ParamSet, Status, WireResponse};
pub use framer::{FramerError, LineFramer, MAX_CMD_LEN};
pub use parser::{ParseError, format_response, parse_command};
