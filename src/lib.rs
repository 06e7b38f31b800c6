//! Test-control agent: a line-oriented TCP command server whose handlers
//! drive a UDP traffic generation and measurement engine.

pub mod agent;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod handlers;
pub mod logging;
pub mod proto;
pub mod server;
pub mod traffic;
