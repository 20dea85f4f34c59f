//! Orchestrator: wires the plan store, dependency graph, worktree manager,
//! validation runner, and agent manager into the end-to-end ticket pipeline
//! (SPEC_FULL §4.8).
//!
//! State mutation follows the same single-writer discipline as
//! [`crate::agent`]: only the orchestrator's own event-subscriber callbacks
//! and its public methods touch [`crate::graph::DependencyGraph`], held
//! behind one `parking_lot::Mutex` alongside the scheduling decision they
//! drive, so a `tick()` always sees a consistent view of ticket status.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::agent::prompt::Decision;
use crate::agent::{AgentManager, SpawnRequest};
use crate::config::{Config, CostLimitAction};
use crate::error::{OrchError, Result};
use crate::events::{EventBus, OrchEvent};
use crate::graph::DependencyGraph;
use crate::pipeline;
use crate::plan::PlanStore;
use crate::types::{AgentId, AgentKind, TicketId, TicketStatus};
use crate::validation;
use crate::worktree::WorktreeManager;

/// A review/QA agent's parsed decision, held until an operator calls
/// `approve_review_decision`/`manual_reject_review` (SPEC_FULL §4.8.1,
/// `automation.review.mode`/`automation.qa.mode == "approval"`).
struct PendingDecision {
    decision: Option<Decision>,
    output: String,
}

/// Everything the orchestrator needs to decide what an agent's ticket does
/// next. Looked up from the live [`AgentManager`] registry rather than kept
/// as separate bookkeeping, since `AgentManager::info` is already the single
/// source of truth for an agent's kind and ticket (SPEC_FULL §9).
struct Dispatch {
    ticket_id: TicketId,
    kind: AgentKind,
}

/// Central coordinator. Construct one per session; `start` begins scheduling
/// and `stop` tears everything down.
pub struct Orchestrator {
    project_root: PathBuf,
    config: Arc<RwLock<Config>>,
    event_bus: Arc<EventBus>,
    plan: Arc<PlanStore>,
    graph: Mutex<DependencyGraph>,
    worktrees: Arc<WorktreeManager>,
    agents: Arc<AgentManager>,
    paused: std::sync::atomic::AtomicBool,
    pending_decisions: DashMap<TicketId, PendingDecision>,
}

impl Orchestrator {
    pub fn new(
        project_root: impl Into<PathBuf>,
        config: Arc<RwLock<Config>>,
        event_bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let project_root = project_root.into();
        let snapshot = config.read().clone();
        let plan_path = project_root.join(&snapshot.plan_file);

        let plan = Arc::new(PlanStore::new(plan_path, Arc::clone(&event_bus)));
        let worktrees = Arc::new(WorktreeManager::new(
            project_root.clone(),
            snapshot.epics.clone(),
            Arc::clone(&event_bus),
        ));
        let agents = Arc::new(AgentManager::new(&snapshot, project_root.clone(), Arc::clone(&event_bus)));

        let orchestrator = Arc::new(Orchestrator {
            project_root,
            config,
            event_bus: Arc::clone(&event_bus),
            plan,
            graph: Mutex::new(DependencyGraph::new()),
            worktrees,
            agents,
            paused: std::sync::atomic::AtomicBool::new(false),
            pending_decisions: DashMap::new(),
        });

        orchestrator.wire_events();
        orchestrator
    }

    /// Subscribe this orchestrator's handlers to its own event bus. Called
    /// once from `new`; the closures hold a weak-free `Arc` clone each since
    /// the orchestrator outlives the bus subscriptions for the session.
    fn wire_events(self: &Arc<Self>) {
        let completed = Arc::clone(self);
        self.event_bus.subscribe("agent:completed", move |event| {
            if let OrchEvent::AgentCompleted { agent_id, .. } = event {
                completed.handle_agent_completed(*agent_id);
            }
        });

        let failed = Arc::clone(self);
        self.event_bus.subscribe("agent:failed", move |event| {
            if let OrchEvent::AgentFailed { agent_id, .. } = event {
                failed.handle_agent_failed(*agent_id);
            }
        });

        let blocked = Arc::clone(self);
        self.event_bus.subscribe("agent:blocked", move |event| {
            if let OrchEvent::AgentBlocked { agent_id, reason, .. } = event {
                blocked.handle_agent_blocked(*agent_id, reason.clone());
            }
        });

        let progress = Arc::clone(self);
        self.event_bus.subscribe("agent:progress", move |event| {
            if let OrchEvent::AgentProgress { agent_id, cost, .. } = event {
                progress.enforce_cost_cap(*agent_id, *cost);
            }
        });
    }

    /// Load the plan, build the dependency graph, discover/initialize
    /// worktrees, and schedule every currently-ready ticket.
    pub fn start(&self) -> Result<()> {
        let snapshot = self.plan.load()?;
        self.graph.lock().build(snapshot.tickets.clone());

        let epics = self.worktrees.discover_epics(&snapshot.tickets);
        self.worktrees.initialize(epics)?;

        self.tick();
        Ok(())
    }

    /// Stop every active agent (SPEC_FULL §4.7: graceful-then-forceful) and
    /// mark the orchestrator paused so no further tickets are scheduled.
    pub async fn stop(&self) {
        self.paused.store(true, std::sync::atomic::Ordering::SeqCst);
        self.agents.stop_all().await;
    }

    fn is_paused(&self) -> bool {
        self.paused.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Re-evaluate readiness and, in `automatic` ticket-progression mode,
    /// assign as many ready tickets as current capacity allows. Idempotent:
    /// safe to call after every state transition (SPEC_FULL §4.8:
    /// "re-evaluates readiness after every ticket status change"). In
    /// `approval`/`manual` mode `tickets:ready` is still published so an
    /// operator can act, but nothing is auto-assigned.
    pub fn tick(&self) {
        if self.is_paused() {
            return;
        }

        let ready = self.graph.lock().get_ready_tickets();
        if ready.is_empty() {
            return;
        }

        self.event_bus.publish(OrchEvent::TicketsReady {
            timestamp: jiff::Timestamp::now(),
            ticket_ids: ready.clone(),
        });

        if self.config.read().automation.ticket_progression != "automatic" {
            return;
        }

        for ticket_id in ready {
            if !self.agents.can_spawn() {
                break;
            }
            if let Err(e) = self.assign_ticket(&ticket_id) {
                self.event_bus.publish(OrchEvent::error(format!(
                    "failed to assign {ticket_id}: {e}"
                )));
            }
        }
    }

    /// Spawn an Implementation agent for `ticket_id` and advance it to
    /// `InProgress`. Synchronous plan/graph bookkeeping happens before the
    /// subprocess is spawned so a spawn failure never leaves a ticket
    /// claimed with nothing running.
    fn assign_ticket(&self, ticket_id: &str) -> Result<()> {
        let ticket = self.plan.get_ticket(ticket_id).ok_or_else(|| {
            crate::error::OrchError::TicketNotFound(ticket_id.to_string())
        })?;

        let config = self.config.read().clone();

        pipeline::assert_valid_transition(
            ticket.status,
            TicketStatus::InProgress,
            ticket_id,
            &config.automation,
        )?;

        let blocked_by = self.graph.lock().get_blocked_by(ticket_id);
        if !blocked_by.is_empty() {
            return Err(crate::error::OrchError::TicketBlocked {
                id: ticket_id.to_string(),
                blocked_by: blocked_by.join(", "),
            });
        }

        if let Some(limit) = config.cost_limit.per_session {
            let spent = self.agents.session_cost();
            if spent >= limit && config.cost_limit.action() == CostLimitAction::Stop {
                return Err(crate::error::OrchError::CostLimitExceeded { spent, limit });
            }
        }

        self.plan
            .update_ticket_status(ticket_id, TicketStatus::InProgress, None)?;
        self.graph.lock().update_ticket_status(ticket_id, TicketStatus::InProgress)?;

        self.spawn_for_ticket(ticket, AgentKind::Implementation, &config, true)
    }

    /// Spawn an agent of `kind` for `ticket`. When `record_assignment` is
    /// set (only for the initial Implementation spawn from `assign_ticket`),
    /// the real agent id is recorded as the ticket's owner and `ticket:
    /// assigned` is published once the subprocess actually starts
    /// (SPEC_FULL §4.8: "records the mapping ... emits ticket:assigned").
    fn spawn_for_ticket(
        &self,
        ticket: crate::types::Ticket,
        kind: AgentKind,
        config: &Config,
        record_assignment: bool,
    ) -> Result<()> {
        if let Some(limit) = config.cost_limit.per_ticket {
            let spent = self.agents.ticket_cost(&ticket.id);
            if spent >= limit && config.cost_limit.action() == CostLimitAction::Stop {
                return Err(crate::error::OrchError::CostLimitExceeded { spent, limit });
            }
        }

        // The agent id is reserved up front so the worktree allocation below
        // is keyed on the same id the process will actually run under —
        // `release_worktree` is keyed the same way once the agent finishes,
        // so a stage's allocation never outlives the agent that made it.
        let agent_id = self.agents.reserve_id();
        let allocation = self.worktrees.allocate_worktree(&ticket, agent_id)?;

        let req = SpawnRequest {
            id: agent_id,
            ticket: ticket.clone(),
            kind,
            working_dir: allocation.path.clone(),
            branch: if allocation.branch == "main" { None } else { Some(allocation.branch.clone()) },
            model: None,
        };

        // `spawn` is async; the orchestrator's public surface is
        // deliberately synchronous where it can be (SPEC_FULL §4.8 keeps
        // scheduling decisions off the async hot path), so hand the actual
        // process spawn to the runtime via `tokio::spawn` and let the
        // agent's own terminal event drive what happens next.
        let agents = Arc::clone(&self.agents);
        let event_bus = Arc::clone(&self.event_bus);
        let plan = Arc::clone(&self.plan);
        let worktrees = Arc::clone(&self.worktrees);
        let ticket_id = ticket.id.clone();
        tokio::spawn(async move {
            match agents.spawn(req).await {
                Ok(agent_id) => {
                    if record_assignment {
                        let _ = plan.update_ticket_owner(&ticket_id, Some(agent_id.to_string()));
                        event_bus.publish(OrchEvent::TicketAssigned {
                            timestamp: jiff::Timestamp::now(),
                            ticket_id: ticket_id.clone(),
                            agent_id,
                        });
                    }
                }
                Err(e) => {
                    worktrees.release_worktree(agent_id);
                    event_bus.publish(OrchEvent::error(format!(
                        "failed to spawn {kind} agent for {ticket_id}: {e}"
                    )));
                }
            }
        });

        Ok(())
    }

    fn dispatch_for(&self, agent_id: AgentId) -> Option<Dispatch> {
        let info = self.agents.info(agent_id)?;
        Some(Dispatch {
            ticket_id: info.ticket_id?,
            kind: info.kind,
        })
    }

    fn handle_agent_completed(self: &Arc<Self>, agent_id: AgentId) {
        let Some(dispatch) = self.dispatch_for(agent_id) else {
            return;
        };
        let config = self.config.read().clone();

        match dispatch.kind {
            AgentKind::Implementation | AgentKind::Refine => {
                self.handle_implementation_done(&dispatch.ticket_id, agent_id, &config);
            }
            AgentKind::Review => {
                self.handle_decision(&dispatch.ticket_id, agent_id, AgentKind::Review);
            }
            AgentKind::Qa => {
                self.handle_decision(&dispatch.ticket_id, agent_id, AgentKind::Qa);
            }
        }
    }

    /// Runs validation, then always releases the worktree the agent was
    /// using regardless of outcome (SPEC_FULL §4.8: "Always releases the
    /// worktree").
    fn handle_implementation_done(self: &Arc<Self>, ticket_id: &str, agent_id: AgentId, config: &Config) {
        let Some(ticket) = self.plan.get_ticket(ticket_id) else {
            return;
        };
        let working_dir = self.project_root.join(ticket.epic.as_deref().unwrap_or(""));
        let working_dir = if ticket.epic.is_some() { working_dir } else { self.project_root.clone() };

        let this = Arc::clone(self);
        let ticket_id = ticket_id.to_string();
        let timeout_secs = config.validation.default_timeout_seconds;
        let steps = ticket.validation_steps.clone();
        tokio::spawn(async move {
            let report = match validation::run_validation(&steps, &working_dir, timeout_secs).await {
                Ok(report) => report,
                Err(e) => {
                    this.worktrees.release_worktree(agent_id);
                    this.event_bus.publish(OrchEvent::error(format!(
                        "validation runner failed for {ticket_id}: {e}"
                    )));
                    return;
                }
            };

            this.worktrees.release_worktree(agent_id);
            if report.passed {
                this.advance_ticket(&ticket_id);
            } else {
                let feedback = report.failure_summary().unwrap_or_else(|| "validation failed".to_string());
                let _ = this.plan.add_ticket_feedback(&ticket_id, feedback);
                this.fail_ticket(&ticket_id);
            }
        });
    }

    /// The configured automation mode for the stage a review/QA agent just
    /// finished (SPEC_FULL §4.8.1: review and QA modes are independent).
    fn stage_mode(config: &Config, kind: AgentKind) -> String {
        match kind {
            AgentKind::Qa => config.automation.qa.mode.clone(),
            _ => config.automation.review.mode.clone(),
        }
    }

    fn handle_decision(self: &Arc<Self>, ticket_id: &str, agent_id: AgentId, kind: AgentKind) {
        let output = self.agents.output(agent_id).join("\n");
        let decision = kind.parse_decision(&output);
        let config = self.config.read().clone();
        self.worktrees.release_worktree(agent_id);

        if Self::stage_mode(&config, kind) == "approval" {
            self.pending_decisions.insert(
                ticket_id.to_string(),
                PendingDecision { decision, output: output.clone() },
            );
            let summary = match decision {
                Some(Decision::Approved) => "approved",
                Some(Decision::Rejected) => "changes requested",
                None => "no parsable decision",
            };
            self.event_bus.publish(OrchEvent::info(format!(
                "{kind} decision for {ticket_id} pending operator approval ({summary})"
            )));
            return;
        }

        self.apply_decision(ticket_id, decision, output, kind);
    }

    fn apply_decision(self: &Arc<Self>, ticket_id: &str, decision: Option<Decision>, output: String, kind: AgentKind) {
        match decision {
            Some(Decision::Approved) => self.advance_ticket(ticket_id),
            Some(Decision::Rejected) | None => {
                let feedback = if output.trim().is_empty() {
                    format!("{kind} agent produced no parsable decision")
                } else {
                    output
                };
                let _ = self.plan.add_ticket_feedback(ticket_id, feedback);
                self.reject_ticket(ticket_id);
            }
        }
    }

    /// Apply an operator's approval of a pending review/QA decision
    /// (SPEC_FULL §4.8.1, `automation.*.mode == "approval"`).
    pub fn approve_review_decision(self: &Arc<Self>, ticket_id: &str) -> Result<()> {
        let (_, pending) = self
            .pending_decisions
            .remove(ticket_id)
            .ok_or_else(|| OrchError::NoPendingDecision(ticket_id.to_string()))?;
        self.apply_decision(ticket_id, pending.decision, pending.output, AgentKind::Review);
        Ok(())
    }

    /// Override a pending review/QA decision with an explicit operator
    /// rejection, regardless of what the agent actually reported.
    pub fn manual_reject_review(self: &Arc<Self>, ticket_id: &str, feedback: String) -> Result<()> {
        self.pending_decisions
            .remove(ticket_id)
            .ok_or_else(|| OrchError::NoPendingDecision(ticket_id.to_string()))?;
        let _ = self.plan.add_ticket_feedback(ticket_id, feedback);
        self.reject_ticket(ticket_id);
        Ok(())
    }

    /// Advance a ticket to its next pipeline status and either spawn the
    /// follow-up agent (Review/Qa) or, on reaching `Done`, merge its
    /// worktree and release it (SPEC_FULL §4.8.1).
    fn advance_ticket(self: &Arc<Self>, ticket_id: &str) {
        let config = self.config.read().clone();
        let Some(ticket) = self.plan.get_ticket(ticket_id) else {
            return;
        };
        let Some(next) = pipeline::get_next_status(ticket.status, &config.automation) else {
            return;
        };

        if self.plan.update_ticket_status(ticket_id, next, None).is_err() {
            return;
        }
        let _ = self.graph.lock().update_ticket_status(ticket_id, next);

        match next {
            TicketStatus::Review => self.enter_review_stage(ticket_id, ticket, AgentKind::Review, &config),
            TicketStatus::Qa => self.enter_review_stage(ticket_id, ticket, AgentKind::Qa, &config),
            TicketStatus::Done => {
                self.finish_ticket(ticket_id, &ticket);
            }
            _ => {}
        }

        self.tick();
    }

    /// Spawn the Review/QA agent for `ticket`, unless that stage's mode is
    /// `manual` — in which case the ticket simply sits in Review/QA until
    /// the operator acts (SPEC_FULL §4.8.1: "In manual mode, no review agent
    /// is spawned"). `approval` mode still spawns the agent; only the
    /// decision's application is deferred (see `handle_decision`).
    fn enter_review_stage(&self, ticket_id: &str, ticket: crate::types::Ticket, kind: AgentKind, config: &Config) {
        if Self::stage_mode(config, kind) == "manual" {
            self.event_bus.publish(OrchEvent::info(format!(
                "{ticket_id} awaiting manual {kind} review; no agent spawned"
            )));
            return;
        }
        let _ = self.spawn_for_ticket(ticket, kind, config, false);
    }

    fn finish_ticket(&self, ticket_id: &str, ticket: &crate::types::Ticket) {
        self.agents.reset_retry_count(ticket_id);
        if let Some(epic) = &ticket.epic {
            let probe_id = self.agents.reserve_id();
            if let Ok(allocation) = self.worktrees.allocate_worktree(ticket, probe_id) {
                self.worktrees.release_worktree(probe_id);
                if allocation.is_new || allocation.path != self.project_root {
                    match self.worktrees.merge_worktree(&allocation.path, "main") {
                        Ok(result) if result.success => {}
                        Ok(_) => {
                            self.event_bus.publish(OrchEvent::warn(format!(
                                "ticket {ticket_id} merge for epic {epic} needs manual resolution"
                            )));
                        }
                        Err(e) => {
                            self.event_bus.publish(OrchEvent::error(format!(
                                "merge failed for {ticket_id}: {e}"
                            )));
                        }
                    }
                }
            }
        }
    }

    /// Send a ticket back to `Todo` with the feedback already recorded by
    /// the caller (review/QA rejection).
    fn reject_ticket(self: &Arc<Self>, ticket_id: &str) {
        if self.plan.update_ticket_status(ticket_id, TicketStatus::Todo, None).is_err() {
            return;
        }
        let _ = self.graph.lock().update_ticket_status(ticket_id, TicketStatus::Todo);
        self.tick();
    }

    fn fail_ticket(self: &Arc<Self>, ticket_id: &str) {
        if self.agents.can_retry(ticket_id) {
            self.retry_ticket(ticket_id);
            return;
        }
        let _ = self.plan.update_ticket_status(ticket_id, TicketStatus::Failed, None);
        let _ = self.graph.lock().update_ticket_status(ticket_id, TicketStatus::Failed);
    }

    fn retry_ticket(self: &Arc<Self>, ticket_id: &str) {
        if self.plan.update_ticket_status(ticket_id, TicketStatus::Todo, None).is_err() {
            return;
        }
        let _ = self.graph.lock().update_ticket_status(ticket_id, TicketStatus::Todo);
        self.tick();
    }

    fn handle_agent_failed(self: &Arc<Self>, agent_id: AgentId) {
        let Some(dispatch) = self.dispatch_for(agent_id) else {
            return;
        };
        self.worktrees.release_worktree(agent_id);
        self.fail_ticket(&dispatch.ticket_id);
    }

    /// A blocked agent keeps its ticket in `InProgress` (SPEC_FULL §4.8:
    /// "keeps the ticket in InProgress, appends feedback, emits a warning
    /// log") — blocked is an operator-attention signal, not a failure.
    fn handle_agent_blocked(self: &Arc<Self>, agent_id: AgentId, reason: String) {
        let Some(dispatch) = self.dispatch_for(agent_id) else {
            return;
        };
        let _ = self.plan.add_ticket_feedback(&dispatch.ticket_id, reason.clone());
        self.event_bus.publish(OrchEvent::warn(format!(
            "ticket {} blocked: {reason}",
            dispatch.ticket_id
        )));
    }

    /// SPEC_FULL §4.8.2: during streaming, compare live cost against the
    /// configured per-ticket/per-session caps and act per `cost_limit.action`.
    fn enforce_cost_cap(&self, agent_id: AgentId, _cost: f64) {
        let config = self.config.read().clone();
        let Some(info) = self.agents.info(agent_id) else {
            return;
        };

        let over_session = config
            .cost_limit
            .per_session
            .map(|limit| self.agents.session_cost() >= limit)
            .unwrap_or(false);
        let over_ticket = match &info.ticket_id {
            Some(id) => config
                .cost_limit
                .per_ticket
                .map(|limit| self.agents.ticket_cost(id) >= limit)
                .unwrap_or(false),
            None => false,
        };

        if !over_session && !over_ticket {
            return;
        }

        match config.cost_limit.action() {
            CostLimitAction::Warn => {
                self.event_bus.publish(OrchEvent::warn(format!(
                    "agent {agent_id} exceeded a configured cost limit"
                )));
            }
            CostLimitAction::Pause => {
                self.paused.store(true, std::sync::atomic::Ordering::SeqCst);
                self.event_bus.publish(OrchEvent::warn(
                    "cost limit exceeded; pausing further ticket assignment".to_string(),
                ));
            }
            CostLimitAction::Stop => {
                let agents = Arc::clone(&self.agents);
                tokio::spawn(async move {
                    let _ = agents.stop(agent_id).await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_with(tickets: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("PLAN.md");
        std::fs::write(&path, tickets).unwrap();
        (dir, path)
    }

    const SINGLE_TICKET: &str = r#"# Demo

### Ticket: T001 First

**Priority**: p0
**Status**: todo
"#;

    #[tokio::test]
    async fn start_publishes_tickets_ready_for_a_ready_ticket() {
        let (dir, _path) = plan_with(SINGLE_TICKET);
        let mut config = Config::default();
        config.max_agents = 1;
        config.agent_command = "true".to_string();
        let config = Arc::new(RwLock::new(config));
        let bus = Arc::new(EventBus::new());

        let received = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&received);
        bus.subscribe("tickets:ready", move |e| r.lock().push(e.clone()));

        let orchestrator = Orchestrator::new(dir.path(), config, bus);
        orchestrator.start().unwrap();

        assert_eq!(received.lock().len(), 1);
    }

    #[tokio::test]
    async fn manual_ticket_progression_publishes_ready_but_does_not_assign() {
        let (dir, _path) = plan_with(SINGLE_TICKET);
        let mut config = Config::default();
        config.max_agents = 1;
        config.agent_command = "true".to_string();
        config.automation.ticket_progression = "manual".to_string();
        let config = Arc::new(RwLock::new(config));
        let bus = Arc::new(EventBus::new());

        let assigned = Arc::new(Mutex::new(Vec::new()));
        let a = Arc::clone(&assigned);
        bus.subscribe("ticket:assigned", move |e| a.lock().push(e.clone()));

        let orchestrator = Orchestrator::new(dir.path(), config, bus);
        orchestrator.start().unwrap();

        assert!(assigned.lock().is_empty());
    }

    const IN_PROGRESS_TICKET: &str = r#"# Demo

### Ticket: T001 First

**Priority**: p0
**Status**: in_progress
"#;

    #[tokio::test]
    async fn manual_review_mode_leaves_ticket_without_spawning_agent() {
        let (dir, _path) = plan_with(IN_PROGRESS_TICKET);
        let mut config = Config::default();
        config.max_agents = 1;
        config.agent_command = "true".to_string();
        config.automation.review.mode = "manual".to_string();
        let config = Arc::new(RwLock::new(config));
        let bus = Arc::new(EventBus::new());

        let spawned = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&spawned);
        bus.subscribe("agent:spawned", move |e| s.lock().push(e.clone()));

        let orchestrator = Orchestrator::new(dir.path(), config, bus);
        let snapshot = orchestrator.plan.load().unwrap();
        orchestrator.graph.lock().build(snapshot.tickets);
        orchestrator.advance_ticket("T001");

        assert!(spawned.lock().is_empty());
        assert_eq!(
            orchestrator.plan.get_ticket("T001").unwrap().status,
            TicketStatus::Review
        );
    }

    #[tokio::test]
    async fn assign_ticket_records_owner_and_publishes_ticket_assigned() {
        let (dir, _path) = plan_with(SINGLE_TICKET);
        let mut config = Config::default();
        config.max_agents = 1;
        config.agent_command = "true".to_string();
        let config = Arc::new(RwLock::new(config));
        let bus = Arc::new(EventBus::new());

        let assigned = Arc::new(Mutex::new(Vec::new()));
        let a = Arc::clone(&assigned);
        bus.subscribe("ticket:assigned", move |e| a.lock().push(e.clone()));

        let orchestrator = Orchestrator::new(dir.path(), config, bus);
        orchestrator.start().unwrap();

        for _ in 0..50 {
            if !assigned.lock().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let events = assigned.lock();
        assert_eq!(events.len(), 1);
        let OrchEvent::TicketAssigned { ticket_id, agent_id, .. } = &events[0] else {
            panic!("expected TicketAssigned event");
        };
        assert_eq!(ticket_id, "T001");

        let ticket = orchestrator.plan.get_ticket("T001").unwrap();
        assert_eq!(ticket.owner, Some(agent_id.to_string()));
    }

    #[tokio::test]
    async fn approve_review_decision_without_a_pending_decision_errors() {
        let (dir, _path) = plan_with(SINGLE_TICKET);
        let config = Arc::new(RwLock::new(Config::default()));
        let bus = Arc::new(EventBus::new());
        let orchestrator = Orchestrator::new(dir.path(), config, bus);

        assert!(orchestrator.approve_review_decision("T001").is_err());
    }
}
