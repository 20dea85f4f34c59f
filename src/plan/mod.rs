//! Plan Store: owns the canonical markdown plan file and exposes a typed,
//! mutation-tracked view of its tickets.
//!
//! Persistence follows the teacher's `fs::write_file_atomic` pattern (see
//! [`crate::fsutil::write_file_atomic`]): an in-memory snapshot is mutated
//! under a `parking_lot::Mutex`, re-serialized, and written to a temp file
//! in the plan's own directory before being renamed over it. If the write
//! fails, the mutation is never committed to the in-memory snapshot either
//! (SPEC_FULL §7: "the pending snapshot is discarded and the prior
//! in-memory state stands").

pub mod parser;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use unicase::UniCase;

use crate::error::{OrchError, Result};
use crate::events::{EventBus, OrchEvent};
use crate::types::{Epic, Ticket, TicketId, TicketStatus, normalize_ticket_id};

#[derive(Debug, Clone, Default)]
struct Snapshot {
    title: Option<String>,
    preamble: String,
    tickets: Vec<Ticket>,
}

/// A read-only view of the plan returned by [`PlanStore::load`] /
/// [`PlanStore::snapshot`].
#[derive(Debug, Clone)]
pub struct PlanSnapshot {
    pub tickets: Vec<Ticket>,
    pub epics: Vec<Epic>,
}

pub struct PlanStore {
    path: PathBuf,
    inner: Mutex<Snapshot>,
    event_bus: Arc<EventBus>,
}

impl PlanStore {
    pub fn new(path: impl Into<PathBuf>, event_bus: Arc<EventBus>) -> Self {
        PlanStore {
            path: path.into(),
            inner: Mutex::new(Snapshot::default()),
            event_bus,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read, parse, and publish `plan:loaded`. Fails with
    /// `OrchError::PlanParse` naming the offending ticket.
    pub fn load(&self) -> Result<PlanSnapshot> {
        let content = std::fs::read_to_string(&self.path)?;
        let parsed = parser::parse_plan(&content)?;
        validate_dependencies(&parsed.tickets)?;

        let epics = derive_epics(&parsed.tickets, self.path.parent().unwrap_or(Path::new(".")));

        let snapshot = PlanSnapshot {
            tickets: parsed.tickets.clone(),
            epics,
        };

        *self.inner.lock() = Snapshot {
            title: parsed.title,
            preamble: parsed.preamble,
            tickets: parsed.tickets,
        };

        self.event_bus.publish(OrchEvent::PlanLoaded {
            timestamp: jiff::Timestamp::now(),
            ticket_count: snapshot.tickets.len(),
            epic_count: snapshot.epics.len(),
        });

        Ok(snapshot)
    }

    pub fn snapshot(&self) -> PlanSnapshot {
        let inner = self.inner.lock();
        let epics = derive_epics(&inner.tickets, self.path.parent().unwrap_or(Path::new(".")));
        PlanSnapshot {
            tickets: inner.tickets.clone(),
            epics,
        }
    }

    /// Case-insensitive lookup via `unicase::UniCase`.
    pub fn get_ticket(&self, id: &str) -> Option<Ticket> {
        let target = UniCase::new(id.to_string());
        self.inner
            .lock()
            .tickets
            .iter()
            .find(|t| UniCase::new(t.id.clone()) == target)
            .cloned()
    }

    pub fn update_ticket_status(
        &self,
        id: &str,
        new_status: TicketStatus,
        reason: Option<String>,
    ) -> Result<()> {
        let normalized = normalize_ticket_id(id);
        let from = self.mutate(|tickets| {
            let ticket = find_mut(tickets, &normalized).ok_or_else(|| {
                OrchError::TicketNotFound(normalized.clone())
            })?;
            let from = ticket.status;
            ticket.status = new_status;
            Ok(from)
        })?;

        self.event_bus.publish(OrchEvent::TicketStatusChanged {
            timestamp: jiff::Timestamp::now(),
            ticket_id: normalized,
            from,
            to: new_status,
            reason,
        });
        Ok(())
    }

    pub fn update_ticket_owner(&self, id: &str, owner: Option<String>) -> Result<()> {
        let normalized = normalize_ticket_id(id);
        self.mutate(|tickets| {
            let ticket = find_mut(tickets, &normalized)
                .ok_or_else(|| OrchError::TicketNotFound(normalized.clone()))?;
            ticket.owner = owner;
            Ok(())
        })
    }

    pub fn add_ticket_feedback(&self, id: &str, text: impl Into<String>) -> Result<()> {
        let normalized = normalize_ticket_id(id);
        let text = text.into();
        self.mutate(|tickets| {
            let ticket = find_mut(tickets, &normalized)
                .ok_or_else(|| OrchError::TicketNotFound(normalized.clone()))?;
            ticket.feedback = Some(text);
            Ok(())
        })
    }

    /// Apply `f` to a cloned copy of the ticket list, persist the result
    /// atomically, and only then commit it to the live snapshot. A write
    /// failure leaves the in-memory state untouched.
    fn mutate<T>(&self, f: impl FnOnce(&mut Vec<Ticket>) -> Result<T>) -> Result<T> {
        let mut guard = self.inner.lock();
        let mut pending = guard.tickets.clone();
        let result = f(&mut pending)?;

        let content = parser::serialize_plan(guard.title.as_deref(), &guard.preamble, &pending);
        crate::fsutil::write_file_atomic(&self.path, content.as_bytes())?;

        guard.tickets = pending;
        Ok(result)
    }
}

fn find_mut<'a>(tickets: &'a mut [Ticket], id: &str) -> Option<&'a mut Ticket> {
    let target = UniCase::new(id.to_string());
    tickets
        .iter_mut()
        .find(|t| UniCase::new(t.id.clone()) == target)
}

fn validate_dependencies(tickets: &[Ticket]) -> Result<()> {
    let known: std::collections::HashSet<&str> = tickets.iter().map(|t| t.id.as_str()).collect();
    for ticket in tickets {
        for dep in &ticket.dependencies {
            if !known.contains(dep.as_str()) {
                return Err(OrchError::UnknownDependency {
                    id: ticket.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

fn derive_epics(tickets: &[Ticket], root: &Path) -> Vec<Epic> {
    let mut seen = std::collections::BTreeSet::new();
    for ticket in tickets {
        if let Some(epic) = &ticket.epic {
            seen.insert(epic.clone());
        }
    }
    seen.into_iter()
        .map(|name| {
            let path = root.join(&name);
            Epic { name, path }
        })
        .collect()
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

    const TWO_TICKETS: &str = r#"# Demo

### Ticket: T001 First

**Priority**: p0
**Status**: todo
**Epic**: core

### Ticket: T002 Second

**Priority**: p1
**Status**: todo
**Dependencies**: t001
**Epic**: core
"#;

    #[test]
    fn load_parses_tickets_and_derives_epics() {
        let (_dir, path) = plan_with(TWO_TICKETS);
        let bus = Arc::new(EventBus::new());
        let store = PlanStore::new(&path, bus);
        let snapshot = store.load().unwrap();
        assert_eq!(snapshot.tickets.len(), 2);
        assert_eq!(snapshot.epics.len(), 1);
        assert_eq!(snapshot.epics[0].name, "core");
    }

    #[test]
    fn load_rejects_unknown_dependency() {
        let (_dir, path) = plan_with(
            "### Ticket: T001 First\n\n**Dependencies**: T999\n",
        );
        let bus = Arc::new(EventBus::new());
        let store = PlanStore::new(&path, bus);
        let err = store.load().unwrap_err();
        assert!(matches!(err, OrchError::UnknownDependency { .. }));
    }

    #[test]
    fn get_ticket_is_case_insensitive() {
        let (_dir, path) = plan_with(TWO_TICKETS);
        let bus = Arc::new(EventBus::new());
        let store = PlanStore::new(&path, bus);
        store.load().unwrap();
        assert!(store.get_ticket("t001").is_some());
        assert!(store.get_ticket("T001").is_some());
    }

    #[test]
    fn update_ticket_status_persists_and_publishes() {
        let (_dir, path) = plan_with(TWO_TICKETS);
        let bus = Arc::new(EventBus::new());
        let received = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&received);
        bus.subscribe("ticket:status-changed", move |e| r.lock().push(e.clone()));

        let store = PlanStore::new(&path, Arc::clone(&bus));
        store.load().unwrap();
        store
            .update_ticket_status("T001", TicketStatus::InProgress, None)
            .unwrap();

        assert_eq!(received.lock().len(), 1);

        let reloaded = PlanStore::new(&path, bus);
        let snapshot = reloaded.load().unwrap();
        let t1 = snapshot.tickets.iter().find(|t| t.id == "T001").unwrap();
        assert_eq!(t1.status, TicketStatus::InProgress);
    }

    #[test]
    fn update_nonexistent_ticket_fails_and_does_not_write() {
        let (_dir, path) = plan_with(TWO_TICKETS);
        let bus = Arc::new(EventBus::new());
        let store = PlanStore::new(&path, bus);
        store.load().unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        let err = store
            .update_ticket_status("T999", TicketStatus::Done, None)
            .unwrap_err();
        assert!(matches!(err, OrchError::TicketNotFound(_)));

        let after = std::fs::read_to_string(&path).unwrap();
        assert_eq!(before, after);
    }
}
