//! Error types for the recording core.
//!
//! Nothing here crosses the runtime boundary at steady state: posting and
//! flushing absorb their failures (sticky overflow, debug-level logs).
//! These types cover the fallible edges (init, option parsing, agent
//! startup) plus the upstream-call error the notifier logs and clears.

use thiserror::Error;

use crate::config::ParseError;

#[derive(Error, Debug)]
pub enum CrsError {
    #[error("option parse error: {0}")]
    Options(#[from] ParseError),

    #[error("arena size {0} too small for two buffers")]
    ArenaTooSmall(usize),

    #[error("reservation of {0} bytes of virtual memory failed")]
    Reserve(usize),

    #[error("initial buffer commit failed")]
    InitialCommit,

    #[error("subsystem disabled: {0}")]
    Disabled(String),

    #[error("agent startup failed: {0}")]
    Startup(#[from] UpstreamError),
}

/// A failed upstream invocation. The runtime has already cleared its
/// pending-exception slot by the time this is returned; the message is the
/// rendered exception text.
#[derive(Error, Debug, Clone)]
#[error("upstream call {method} failed: {message}")]
pub struct UpstreamError {
    pub method: String,
    pub message: String,
}

impl UpstreamError {
    pub fn new(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            message: message.into(),
        }
    }
}
