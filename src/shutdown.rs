//! Graceful shutdown: traps `SIGINT`/`SIGTERM`, stops every active agent,
//! and emits a summary of the session's final ticket counts.
//!
//! Grounded on the teacher's CLI entry point, which races a `tokio::signal`
//! future against its main work loop rather than installing a handler via
//! `libc` directly (the `signal` feature of `tokio` is already part of the
//! dependency stack for this reason).

use std::collections::HashMap;
use std::sync::Arc;

use crate::events::{EventBus, OrchEvent};
use crate::orchestrator::Orchestrator;
use crate::types::TicketStatus;

/// Final per-status ticket counts, logged and returned to the caller so a
/// CLI can choose its own exit code from `failed`/`blocked` counts
/// (SPEC_FULL §6: "Orchestrator exits 0 on clean shutdown; non-zero on
/// unresolved failures").
#[derive(Debug, Clone, Default)]
pub struct ShutdownSummary {
    pub counts: HashMap<TicketStatus, usize>,
}

impl ShutdownSummary {
    pub fn from_tickets(tickets: &[crate::types::Ticket]) -> Self {
        let mut counts = HashMap::new();
        for ticket in tickets {
            *counts.entry(ticket.status).or_insert(0) += 1;
        }
        ShutdownSummary { counts }
    }

    pub fn failed_count(&self) -> usize {
        self.counts.get(&TicketStatus::Failed).copied().unwrap_or(0)
    }

    /// Exit code per SPEC_FULL §6: zero unless a ticket ended the session
    /// `Failed`.
    pub fn exit_code(&self) -> i32 {
        if self.failed_count() > 0 { 1 } else { 0 }
    }
}

/// Wait for either `SIGINT` or `SIGTERM` (Unix) or Ctrl-C (all platforms),
/// then stop the orchestrator and return the final summary. Intended to be
/// raced against the orchestrator's own run loop via `tokio::select!` in
/// `main`.
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Stop every active agent and publish the closing `log:entry` event with
/// the final ticket counts.
pub async fn shutdown(orchestrator: &Orchestrator, event_bus: &Arc<EventBus>, tickets: &[crate::types::Ticket]) -> ShutdownSummary {
    event_bus.publish(OrchEvent::info("shutdown signal received; stopping active agents"));
    orchestrator.stop().await;

    let summary = ShutdownSummary::from_tickets(tickets);
    event_bus.publish(OrchEvent::info(format!(
        "session ended: {} done, {} failed, {} in progress",
        summary.counts.get(&TicketStatus::Done).copied().unwrap_or(0),
        summary.failed_count(),
        summary.counts.get(&TicketStatus::InProgress).copied().unwrap_or(0),
    )));

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Ticket;

    fn ticket(status: TicketStatus) -> Ticket {
        let mut t = Ticket::new("T1", "x");
        t.status = status;
        t
    }

    #[test]
    fn summary_counts_by_status() {
        let tickets = vec![
            ticket(TicketStatus::Done),
            ticket(TicketStatus::Done),
            ticket(TicketStatus::Failed),
            ticket(TicketStatus::InProgress),
        ];
        let summary = ShutdownSummary::from_tickets(&tickets);
        assert_eq!(summary.counts[&TicketStatus::Done], 2);
        assert_eq!(summary.failed_count(), 1);
    }

    #[test]
    fn exit_code_is_nonzero_only_with_failures() {
        let clean = ShutdownSummary::from_tickets(&[ticket(TicketStatus::Done)]);
        assert_eq!(clean.exit_code(), 0);

        let dirty = ShutdownSummary::from_tickets(&[ticket(TicketStatus::Failed)]);
        assert_eq!(dirty.exit_code(), 1);
    }
}
