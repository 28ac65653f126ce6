//! Error taxonomy.
//!
//! Protocol violations are handled locally by tearing the offending link down;
//! fatal errors stop the node. The two are distinct types so a handler cannot
//! confuse them.

use std::fmt;
use thiserror::Error;

/// A peer broke the protocol. The link is torn down and a warning raised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Envelope belongs to another overlay.
    #[error("bus name mismatch: expected {expected}, got {actual}")]
    WrongBus { expected: String, actual: String },

    /// Envelope addressed to another node.
    #[error("message addressed to {actual}, local node is {expected}")]
    WrongTarget { expected: String, actual: String },

    /// Body could not be decoded or violates size limits.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Message not valid in the current context.
    #[error("unexpected message from {peer}: {detail}")]
    Unexpected { peer: String, detail: String },
}

/// Internal consistency violations that stop the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FatalErrorCode {
    /// A cached name is in neither the view nor the history.
    UnknownCachedNode,
    /// A name is present in both the view and the history.
    ViewHistoryOverlap,
    /// A peer reports a higher incarnation for a node that is alive locally.
    IncarnationAhead,
}

impl FatalErrorCode {
    /// Stable numeric code for external reporting.
    pub fn code(&self) -> u16 {
        match self {
            FatalErrorCode::UnknownCachedNode => 1,
            FatalErrorCode::ViewHistoryOverlap => 2,
            FatalErrorCode::IncarnationAhead => 3,
        }
    }
}

impl fmt::Display for FatalErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FatalErrorCode::UnknownCachedNode => "unknown-cached-node",
            FatalErrorCode::ViewHistoryOverlap => "view-history-overlap",
            FatalErrorCode::IncarnationAhead => "incarnation-ahead",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

/// Fatal error with its code and cause.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("fatal error {code}: {cause}")]
pub struct FatalError {
    pub code: FatalErrorCode,
    pub cause: String,
}

impl FatalError {
    pub fn new(code: FatalErrorCode, cause: impl Into<String>) -> Self {
        Self {
            code,
            cause: cause.into(),
        }
    }
}

/// Errors returned by the local attribute API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttributeError {
    /// Key is empty, padded or does not start with an alphanumeric character.
    #[error("invalid attribute key: {0:?}")]
    InvalidKey(String),

    /// The node was closed; attributes are no longer replicated.
    #[error("node is closed")]
    Closed,
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
