//! The closed set of events published on the orchestrator's event bus.
//!
//! Every variant carries its own timestamp and tag-specific payload. This
//! enum is intentionally exhaustive — subscribers `match` over it rather
//! than accepting a duck-typed base event, so the compiler enforces
//! coverage whenever a new event kind is added (see SPEC_FULL §9).

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::types::{AgentId, AgentKind, TicketId, TicketStatus};

/// Severity of a `log:entry` event, mirroring `tracing`'s level names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A single typed event on the bus. The tag used for `subscribe` is the
/// variant name in snake_case (see [`OrchEvent::tag`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchEvent {
    PlanLoaded {
        timestamp: Timestamp,
        ticket_count: usize,
        epic_count: usize,
    },
    TicketStatusChanged {
        timestamp: Timestamp,
        ticket_id: TicketId,
        from: TicketStatus,
        to: TicketStatus,
        reason: Option<String>,
    },
    TicketAssigned {
        timestamp: Timestamp,
        ticket_id: TicketId,
        agent_id: AgentId,
    },
    TicketsReady {
        timestamp: Timestamp,
        ticket_ids: Vec<TicketId>,
    },
    AgentSpawned {
        timestamp: Timestamp,
        agent_id: AgentId,
        kind: AgentKind,
        ticket_id: Option<TicketId>,
    },
    AgentProgress {
        timestamp: Timestamp,
        agent_id: AgentId,
        progress: u8,
        last_chunk: String,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
    },
    AgentCompleted {
        timestamp: Timestamp,
        agent_id: AgentId,
        ticket_id: Option<TicketId>,
    },
    AgentFailed {
        timestamp: Timestamp,
        agent_id: AgentId,
        ticket_id: Option<TicketId>,
        exit_code: Option<i32>,
        message: String,
    },
    AgentBlocked {
        timestamp: Timestamp,
        agent_id: AgentId,
        ticket_id: Option<TicketId>,
        reason: String,
    },
    AgentStopped {
        timestamp: Timestamp,
        agent_id: AgentId,
    },
    EpicWorktreeCreated {
        timestamp: Timestamp,
        epic: String,
        path: String,
        branch: String,
    },
    EpicWorktreeMerged {
        timestamp: Timestamp,
        epic: String,
        path: String,
        commit: String,
    },
    EpicConflict {
        timestamp: Timestamp,
        epic: String,
        path: String,
        conflict_files: Vec<String>,
    },
    LogEntry {
        timestamp: Timestamp,
        level: LogLevel,
        message: String,
    },
}

impl OrchEvent {
    /// The subscription tag for this event, e.g. `"ticket:status-changed"`.
    /// Mirrors the wire names in SPEC_FULL §3.
    pub fn tag(&self) -> &'static str {
        match self {
            OrchEvent::PlanLoaded { .. } => "plan:loaded",
            OrchEvent::TicketStatusChanged { .. } => "ticket:status-changed",
            OrchEvent::TicketAssigned { .. } => "ticket:assigned",
            OrchEvent::TicketsReady { .. } => "tickets:ready",
            OrchEvent::AgentSpawned { .. } => "agent:spawned",
            OrchEvent::AgentProgress { .. } => "agent:progress",
            OrchEvent::AgentCompleted { .. } => "agent:completed",
            OrchEvent::AgentFailed { .. } => "agent:failed",
            OrchEvent::AgentBlocked { .. } => "agent:blocked",
            OrchEvent::AgentStopped { .. } => "agent:stopped",
            OrchEvent::EpicWorktreeCreated { .. } => "epic:worktree-created",
            OrchEvent::EpicWorktreeMerged { .. } => "epic:worktree-merged",
            OrchEvent::EpicConflict { .. } => "epic:conflict",
            OrchEvent::LogEntry { .. } => "log:entry",
        }
    }

    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        OrchEvent::LogEntry {
            timestamp: Timestamp::now(),
            level,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::log(LogLevel::Info, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::log(LogLevel::Warn, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::log(LogLevel::Error, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_matches_spec_wire_name() {
        let e = OrchEvent::TicketsReady {
            timestamp: Timestamp::now(),
            ticket_ids: vec!["T1".into()],
        };
        assert_eq!(e.tag(), "tickets:ready");
    }

    #[test]
    fn log_helpers_set_expected_level() {
        match OrchEvent::warn("careful") {
            OrchEvent::LogEntry { level, message, .. } => {
                assert_eq!(level, LogLevel::Warn);
                assert_eq!(message, "careful");
            }
            _ => panic!("expected LogEntry"),
        }
    }
}
