//! # Application Events
//!
//! Everything the node reports to the application goes through one tagged
//! enum delivered to the `EventSink` port.

use std::collections::BTreeMap;

use super::entities::NodeVersion;
use super::errors::{FatalError, FatalErrorCode};

/// Discriminant of `SpiderCastEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connectivity,
    ViewChanged,
    Warning,
    DuplicateNodeSuspected,
    FatalError,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpiderCastEvent {
    Connectivity(ConnectivityEvent),
    ViewChanged(ViewNotification),
    Warning(WarningEvent),
    DuplicateNodeSuspected(DuplicateNodeEvent),
    FatalError(FatalErrorEvent),
}

impl SpiderCastEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SpiderCastEvent::Connectivity(_) => EventKind::Connectivity,
            SpiderCastEvent::ViewChanged(_) => EventKind::ViewChanged,
            SpiderCastEvent::Warning(_) => EventKind::Warning,
            SpiderCastEvent::DuplicateNodeSuspected(_) => EventKind::DuplicateNodeSuspected,
            SpiderCastEvent::FatalError(_) => EventKind::FatalError,
        }
    }
}

/// Link counts per overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectivityEvent {
    /// Successor plus predecessors.
    pub ring: usize,
    pub random: usize,
    pub structured_out: usize,
    pub structured_in: usize,
}

/// A node as presented to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub name: String,
    pub version: NodeVersion,
    pub attributes: BTreeMap<String, Vec<u8>>,
}

/// Coalesced view change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewNotification {
    /// `nodes` holds the whole view rather than the changed part.
    pub full: bool,
    pub nodes: Vec<NodeSnapshot>,
    pub departed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    ProtocolViolation,
    SendFailure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarningEvent {
    pub kind: WarningKind,
    pub peer: Option<String>,
    pub message: String,
}

/// Another process claims the local node's name with a newer incarnation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateNodeEvent {
    pub name: String,
    pub local_version: NodeVersion,
    pub remote_version: NodeVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalErrorEvent {
    pub code: FatalErrorCode,
    pub cause: String,
}

impl From<&FatalError> for FatalErrorEvent {
    fn from(err: &FatalError) -> Self {
        Self {
            code: err.code,
            cause: err.cause.clone(),
        }
    }
}
