//! # Task Scheduler
//!
//! Cooperative single-threaded executor for the node's periodic work.
//!
//! Each task kind has one explicit state:
//!
//! - `Idle`: not scheduled
//! - `Scheduled(at)`: will run at `at`; scheduling again only moves it earlier
//! - `Running`: executing; scheduling re-arms it to run again once it completes
//!
//! Tasks always re-check their conditions when they run, so a spurious run is
//! harmless.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::domain::Timestamp;

/// Scheduled work items of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskKind {
    Discovery,
    EndFrequentDiscovery,
    ChangeSuccessor,
    RandomConnect,
    RandomDisconnect,
    StructuredConnect,
    StructuredRefresh,
    DegreeUpdate,
    AttributeUpdate,
    AttributeNotify,
    HistoryPurge,
    ConnectTimeouts,
}

/// Lifecycle state of one task kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Scheduled(Timestamp),
    Running { rearm: Option<Timestamp> },
}

/// Deadline-ordered queue with per-kind state.
#[derive(Debug, Default)]
pub struct TaskScheduler {
    states: HashMap<TaskKind, TaskState>,
    queue: BinaryHeap<Reverse<(Timestamp, u64, TaskKind)>>,
    seq: u64,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, kind: TaskKind) -> TaskState {
        self.states.get(&kind).copied().unwrap_or(TaskState::Idle)
    }

    pub fn is_scheduled(&self, kind: TaskKind) -> bool {
        matches!(self.state(kind), TaskState::Scheduled(_))
    }

    /// Schedule `kind` to run at `at`.
    ///
    /// A task already scheduled later is moved to `at`; one scheduled earlier
    /// is left alone. A running task is re-armed for after it completes.
    pub fn schedule(&mut self, kind: TaskKind, at: Timestamp) {
        let next = match self.state(kind) {
            TaskState::Idle => {
                self.enqueue(kind, at);
                TaskState::Scheduled(at)
            }
            TaskState::Scheduled(current) if at < current => {
                self.enqueue(kind, at);
                TaskState::Scheduled(at)
            }
            TaskState::Scheduled(current) => TaskState::Scheduled(current),
            TaskState::Running { rearm } => TaskState::Running {
                rearm: Some(rearm.map_or(at, |r| r.min(at))),
            },
        };
        self.states.insert(kind, next);
    }

    fn enqueue(&mut self, kind: TaskKind, at: Timestamp) {
        self.seq += 1;
        self.queue.push(Reverse((at, self.seq, kind)));
    }

    /// Pop the next task due at `now` and mark it running.
    pub fn pop_due(&mut self, now: Timestamp) -> Option<TaskKind> {
        while let Some(Reverse((at, _, kind))) = self.queue.peek().copied() {
            if at > now {
                return None;
            }
            self.queue.pop();
            // Entries superseded by an earlier reschedule are skipped.
            if self.state(kind) == TaskState::Scheduled(at) {
                self.states.insert(kind, TaskState::Running { rearm: None });
                return Some(kind);
            }
        }
        None
    }

    /// Finish a running task, applying any re-arm requested while it ran.
    pub fn complete(&mut self, kind: TaskKind) {
        match self.state(kind) {
            TaskState::Running { rearm: Some(at) } => {
                self.enqueue(kind, at);
                self.states.insert(kind, TaskState::Scheduled(at));
            }
            TaskState::Running { rearm: None } => {
                self.states.insert(kind, TaskState::Idle);
            }
            _ => {}
        }
    }

    /// Earliest live deadline.
    pub fn next_deadline(&mut self) -> Option<Timestamp> {
        while let Some(Reverse((at, _, kind))) = self.queue.peek().copied() {
            if self.state(kind) == TaskState::Scheduled(at) {
                return Some(at);
            }
            self.queue.pop();
        }
        None
    }

    /// Cancel every task.
    pub fn cancel_all(&mut self) {
        self.queue.clear();
        self.states.clear();
    }
}
