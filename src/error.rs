use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchError {
    #[error("ticket '{0}' not found")]
    TicketNotFound(String),

    #[error("invalid plan: {0}")]
    PlanParse(String),

    #[error("invalid status '{0}'")]
    InvalidStatus(String),

    #[error("invalid priority '{0}'")]
    InvalidPriority(String),

    #[error("invalid transition for ticket '{id}': {from} -> {to} is not allowed")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("ticket '{id}' depends on unknown ticket '{dependency}'")]
    UnknownDependency { id: String, dependency: String },

    #[error("ticket '{id}' is still blocked by unfinished dependencies: {blocked_by}")]
    TicketBlocked { id: String, blocked_by: String },

    #[error("circular dependencies detected: {0}")]
    CircularDependency(String),

    #[error("agent concurrency limit reached ({0} active)")]
    ConcurrencyLimit(usize),

    #[error("epic '{0}' has reached its worktree capacity")]
    EpicCapacity(String),

    #[error("epic '{0}' not found")]
    EpicNotFound(String),

    #[error("worktree operation failed: {operation}: {stderr}")]
    Worktree { operation: String, stderr: String },

    #[error("no merge in progress at '{0}'")]
    NoMergeInProgress(String),

    #[error("agent '{agent_id}' crashed running ticket '{ticket_id}' (exit code {exit_code:?})")]
    AgentCrash {
        agent_id: u64,
        ticket_id: String,
        exit_code: Option<i32>,
    },

    #[error("validation command '{command}' exceeded its {timeout_secs}s timeout")]
    ValidationTimeout { command: String, timeout_secs: u64 },

    #[error("the orchestrator is not running")]
    NotRunning,

    #[error("ticket '{0}' has no review/QA decision awaiting operator approval")]
    NoPendingDecision(String),

    #[error("session cost limit exceeded: {spent:.2} >= {limit:.2}")]
    CostLimitExceeded { spent: f64, limit: f64 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, OrchError>;
