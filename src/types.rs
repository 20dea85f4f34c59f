//! Core data model: tickets, epics, agents, worktree allocations.

use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::OrchError;
use crate::{enum_display, enum_display_fromstr};

/// A ticket identifier, e.g. `T042`. Always stored upper-cased; comparisons
/// and lookups elsewhere are case-insensitive via `unicase::UniCase`.
pub type TicketId = String;

pub fn normalize_ticket_id(raw: &str) -> TicketId {
    raw.trim().to_uppercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TicketPriority {
    #[default]
    P0,
    P1,
    P2,
}

enum_display_fromstr!(
    TicketPriority,
    OrchError::InvalidPriority,
    {
        P0 => "p0",
        P1 => "p1",
        P2 => "p2",
    }
);

/// Status pipeline states. Ordering here is declaration order only; the
/// legal transition table lives in [`crate::pipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    #[default]
    Todo,
    InProgress,
    Review,
    Qa,
    Done,
    Failed,
}

impl TicketStatus {
    /// Terminal statuses never transition on their own; `Done` is a
    /// successful terminal state, `Failed` awaits an explicit retry.
    pub fn is_terminal(self) -> bool {
        matches!(self, TicketStatus::Done | TicketStatus::Failed)
    }
}

enum_display_fromstr!(
    TicketStatus,
    OrchError::InvalidStatus,
    {
        Todo => "todo",
        InProgress => "in_progress",
        Review => "review",
        Qa => "qa",
        Done => "done",
        Failed => "failed",
    }
);

/// A single unit of schedulable work, parsed from an H3 ticket section in
/// the plan file. See `crate::plan::parser` for the section grammar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub title: String,
    pub description: Option<String>,
    pub priority: TicketPriority,
    pub status: TicketStatus,
    pub epic: Option<String>,
    pub owner: Option<String>,
    pub dependencies: Vec<TicketId>,
    pub acceptance_criteria: Vec<String>,
    pub validation_steps: Vec<String>,
    pub notes: Option<String>,
    pub feedback: Option<String>,
}

impl Ticket {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Ticket {
            id: normalize_ticket_id(&id.into()),
            title: title.into(),
            description: None,
            priority: TicketPriority::default(),
            status: TicketStatus::default(),
            epic: None,
            owner: None,
            dependencies: Vec::new(),
            acceptance_criteria: Vec::new(),
            validation_steps: Vec::new(),
            notes: None,
            feedback: None,
        }
    }

    pub fn task_body(&self) -> &str {
        self.description.as_deref().unwrap_or(&self.title)
    }
}

/// A named group of tickets sharing a filesystem subtree. Derived from
/// ticket `epic` fields on plan load; never independently persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epic {
    pub name: String,
    pub path: std::path::PathBuf,
}

/// The kind of agent spawned for a ticket. Each variant owns its own prompt
/// builder and output-decision parser (see `crate::agent::prompt`); dispatch
/// is a `match`, never a trait object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Implementation,
    Review,
    Qa,
    Refine,
}

enum_display!(AgentKind, {
    Implementation => "implementation",
    Review => "review",
    Qa => "qa",
    Refine => "refine",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Starting,
    Working,
    Blocked,
    Complete,
    Failed,
}

impl AgentStatus {
    pub fn is_active(self) -> bool {
        matches!(self, AgentStatus::Starting | AgentStatus::Working)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AgentStatus::Complete | AgentStatus::Failed)
    }
}

enum_display!(AgentStatus, {
    Starting => "starting",
    Working => "working",
    Blocked => "blocked",
    Complete => "complete",
    Failed => "failed",
});

pub type AgentId = u64;

/// A live or completed agent's accounting state, held by the agent manager's
/// concurrent registry.
#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub id: AgentId,
    pub kind: AgentKind,
    pub status: AgentStatus,
    pub ticket_id: Option<TicketId>,
    pub working_dir: std::path::PathBuf,
    pub started_at: SystemTime,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub progress: u8,
    pub last_action: Option<String>,
    pub pid: Option<u32>,
}

/// A claimed working directory for a ticket, owned exclusively by one agent
/// until released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeAllocation {
    pub path: std::path::PathBuf,
    pub epic: Option<String>,
    pub agent_id: AgentId,
    pub ticket_id: TicketId,
    pub branch: String,
    pub created_at: SystemTime,
    pub is_new: bool,
}

/// Result of a worktree merge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    pub success: bool,
    pub has_conflicts: bool,
    pub conflict_files: Vec<String>,
    pub commit: Option<String>,
}

impl fmt::Display for MergeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.success {
            write!(f, "merged ({})", self.commit.as_deref().unwrap_or("?"))
        } else if self.has_conflicts {
            write!(f, "conflict in {}", self.conflict_files.join(", "))
        } else {
            write!(f, "merge failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn priority_ordering_is_severity_order() {
        assert!(TicketPriority::P0 < TicketPriority::P1);
        assert!(TicketPriority::P1 < TicketPriority::P2);
    }

    #[test]
    fn status_display_roundtrips_through_fromstr() {
        for s in [
            TicketStatus::Todo,
            TicketStatus::InProgress,
            TicketStatus::Review,
            TicketStatus::Qa,
            TicketStatus::Done,
            TicketStatus::Failed,
        ] {
            assert_eq!(TicketStatus::from_str(&s.to_string()).unwrap(), s);
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(TicketStatus::Done.is_terminal());
        assert!(TicketStatus::Failed.is_terminal());
        assert!(!TicketStatus::InProgress.is_terminal());
    }

    #[test]
    fn normalize_uppercases_and_trims() {
        assert_eq!(normalize_ticket_id(" t42 "), "T42");
    }
}
