//! Dependency graph over tickets: forward (dependencies) and reverse
//! (dependents) adjacency, readiness queries, and cycle detection.
//!
//! The three-colour DFS and Kahn's-algorithm implementations here are
//! textbook; what is grounded in the teacher crate is the surrounding
//! idiom — a plain struct over two `HashMap<String, HashSet<String>>`s with
//! free functions operating on borrowed state, mirroring the pure-predicate
//! style of the teacher's `status::mod` ([`crate::pipeline`] follows the
//! same style for the transition table).

use std::collections::{HashMap, HashSet};

use crate::error::{OrchError, Result};
use crate::types::{Ticket, TicketId, TicketStatus};

#[derive(Debug, Clone)]
struct Node {
    ticket: Ticket,
}

/// Forward/reverse adjacency over a ticket set. Built once via [`build`],
/// then kept current via [`DependencyGraph::update_ticket_status`] as the
/// orchestrator advances tickets, avoiding a full rebuild per transition.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: HashMap<TicketId, Node>,
    dependencies: HashMap<TicketId, HashSet<TicketId>>,
    dependents: HashMap<TicketId, HashSet<TicketId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        DependencyGraph::default()
    }

    /// Clears and rebuilds both maps from `tickets`. Every ticket gets an
    /// entry in both maps, even with no edges, so `get_dependencies` and
    /// `get_dependents` never need `Option` handling at the call site.
    pub fn build(&mut self, tickets: Vec<Ticket>) {
        self.nodes.clear();
        self.dependencies.clear();
        self.dependents.clear();

        for ticket in &tickets {
            self.dependencies.entry(ticket.id.clone()).or_default();
            self.dependents.entry(ticket.id.clone()).or_default();
        }
        for ticket in tickets {
            for dep in &ticket.dependencies {
                self.dependencies
                    .entry(ticket.id.clone())
                    .or_default()
                    .insert(dep.clone());
                self.dependents.entry(dep.clone()).or_default().insert(ticket.id.clone());
            }
            self.nodes.insert(ticket.id.clone(), Node { ticket });
        }
    }

    pub fn get_dependencies(&self, id: &str) -> HashSet<TicketId> {
        self.dependencies.get(id).cloned().unwrap_or_default()
    }

    pub fn get_dependents(&self, id: &str) -> HashSet<TicketId> {
        self.dependents.get(id).cloned().unwrap_or_default()
    }

    pub fn ticket(&self, id: &str) -> Option<&Ticket> {
        self.nodes.get(id).map(|n| &n.ticket)
    }

    pub fn tickets(&self) -> impl Iterator<Item = &Ticket> {
        self.nodes.values().map(|n| &n.ticket)
    }

    pub fn are_dependencies_met(&self, id: &str, done: &HashSet<TicketId>) -> bool {
        self.get_dependencies(id).iter().all(|d| done.contains(d))
    }

    /// Dependencies of `id` that are not yet `Done`.
    pub fn get_blocked_by(&self, id: &str) -> Vec<TicketId> {
        self.get_dependencies(id)
            .into_iter()
            .filter(|d| {
                self.nodes
                    .get(d)
                    .map(|n| n.ticket.status != TicketStatus::Done)
                    .unwrap_or(true)
            })
            .collect()
    }

    /// Tickets that are `Todo` with every dependency `Done`, sorted by
    /// priority (P0 first) then ticket id for determinism.
    pub fn get_ready_tickets(&self) -> Vec<TicketId> {
        let done: HashSet<TicketId> = self
            .nodes
            .values()
            .filter(|n| n.ticket.status == TicketStatus::Done)
            .map(|n| n.ticket.id.clone())
            .collect();

        let mut ready: Vec<&Ticket> = self
            .nodes
            .values()
            .map(|n| &n.ticket)
            .filter(|t| t.status == TicketStatus::Todo && self.are_dependencies_met(&t.id, &done))
            .collect();

        ready.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        ready.into_iter().map(|t| t.id.clone()).collect()
    }

    pub fn update_ticket_status(&mut self, id: &str, status: TicketStatus) -> Result<()> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| OrchError::TicketNotFound(id.to_string()))?;
        node.ticket.status = status;
        Ok(())
    }

    /// Three-colour DFS. Returns each cycle found as the list of ticket ids
    /// forming it, starting and ending at the same id.
    pub fn detect_cycles(&self) -> Vec<Vec<TicketId>> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Colour {
            White,
            Gray,
            Black,
        }

        let mut colour: HashMap<&str, Colour> =
            self.nodes.keys().map(|k| (k.as_str(), Colour::White)).collect();
        let mut parent: HashMap<&str, &str> = HashMap::new();
        let mut cycles = Vec::new();

        // Iterative DFS (avoids borrow-checker friction from a recursive
        // closure holding `&self` while also mutating `colour`/`parent`).
        let ids: Vec<&str> = self.nodes.keys().map(|k| k.as_str()).collect();
        for start in ids {
            if colour[start] != Colour::White {
                continue;
            }
            let mut stack: Vec<(&str, std::vec::IntoIter<TicketId>)> = Vec::new();
            colour.insert(start, Colour::Gray);
            stack.push((start, self.get_dependencies(start).into_iter().collect::<Vec<_>>().into_iter()));

            while let Some((node, iter)) = stack.last_mut() {
                let node = *node;
                match iter.next() {
                    Some(dep) => {
                        let dep_colour = *colour.get(dep.as_str()).unwrap_or(&Colour::White);
                        match dep_colour {
                            Colour::White => {
                                colour.insert(
                                    self.nodes.get_key_value(&dep).map(|(k, _)| k.as_str()).unwrap_or(""),
                                    Colour::Gray,
                                );
                                parent.insert(
                                    self.nodes.get_key_value(&dep).map(|(k, _)| k.as_str()).unwrap_or(""),
                                    node,
                                );
                                let dep_key = self.nodes.get_key_value(&dep).map(|(k, _)| k.as_str()).unwrap_or("");
                                stack.push((
                                    dep_key,
                                    self.get_dependencies(dep_key).into_iter().collect::<Vec<_>>().into_iter(),
                                ));
                            }
                            Colour::Gray => {
                                // Found a back-edge: reconstruct the cycle via parent pointers.
                                let mut cycle = vec![dep.clone(), node.to_string()];
                                let mut cur = node;
                                while cur != dep.as_str() {
                                    if let Some(p) = parent.get(cur) {
                                        cycle.push(p.to_string());
                                        cur = p;
                                    } else {
                                        break;
                                    }
                                }
                                cycle.reverse();
                                cycles.push(cycle);
                            }
                            Colour::Black => {}
                        }
                    }
                    None => {
                        colour.insert(node, Colour::Black);
                        stack.pop();
                    }
                }
            }
        }

        cycles
    }

    /// Kahn's algorithm. Fails with `OrchError::CircularDependency` if the
    /// graph is not a DAG.
    pub fn get_topological_order(&self) -> Result<Vec<TicketId>> {
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .keys()
            .map(|id| (id.as_str(), self.get_dependencies(id).len()))
            .collect();

        let mut queue: std::collections::VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>()
            .into_iter()
            .collect();
        // Deterministic order among zero-in-degree starting nodes.
        let mut queue_vec: Vec<&str> = queue.drain(..).collect();
        queue_vec.sort();
        let mut queue: std::collections::VecDeque<&str> = queue_vec.into();

        let mut order = Vec::new();
        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            let mut unlocked: Vec<&str> = Vec::new();
            for dependent in self.get_dependents(id) {
                if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        unlocked.push(self.nodes.get_key_value(&dependent).map(|(k, _)| k.as_str()).unwrap());
                    }
                }
            }
            unlocked.sort();
            for id in unlocked {
                queue.push_back(id);
            }
        }

        if order.len() != self.nodes.len() {
            let cycles = self.detect_cycles();
            let detail = cycles
                .first()
                .map(|c| c.join(" -> "))
                .unwrap_or_else(|| "unknown cycle".to_string());
            return Err(OrchError::CircularDependency(detail));
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Ticket, TicketPriority};

    fn ticket(id: &str, deps: &[&str], status: TicketStatus, priority: TicketPriority) -> Ticket {
        let mut t = Ticket::new(id, id);
        t.status = status;
        t.priority = priority;
        t.dependencies = deps.iter().map(|d| d.to_string()).collect();
        t
    }

    #[test]
    fn linear_chain_ready_tickets_unblock_in_order() {
        let mut g = DependencyGraph::new();
        g.build(vec![
            ticket("A", &[], TicketStatus::Todo, TicketPriority::P1),
            ticket("B", &["A"], TicketStatus::Todo, TicketPriority::P1),
            ticket("C", &["B"], TicketStatus::Todo, TicketPriority::P1),
        ]);

        assert_eq!(g.get_ready_tickets(), vec!["A"]);
        g.update_ticket_status("A", TicketStatus::Done).unwrap();
        assert_eq!(g.get_ready_tickets(), vec!["B"]);
        g.update_ticket_status("B", TicketStatus::Done).unwrap();
        assert_eq!(g.get_ready_tickets(), vec!["C"]);
    }

    #[test]
    fn ready_tickets_sorted_by_priority_then_id() {
        let mut g = DependencyGraph::new();
        g.build(vec![
            ticket("C", &[], TicketStatus::Todo, TicketPriority::P2),
            ticket("A", &[], TicketStatus::Todo, TicketPriority::P0),
            ticket("B", &[], TicketStatus::Todo, TicketPriority::P1),
        ]);
        assert_eq!(g.get_ready_tickets(), vec!["A", "B", "C"]);
    }

    #[test]
    fn cycle_is_detected_and_topo_sort_fails() {
        let mut g = DependencyGraph::new();
        g.build(vec![
            ticket("A", &["B"], TicketStatus::Todo, TicketPriority::P1),
            ticket("B", &["A"], TicketStatus::Todo, TicketPriority::P1),
        ]);
        assert!(!g.detect_cycles().is_empty());
        let err = g.get_topological_order().unwrap_err();
        assert!(matches!(err, OrchError::CircularDependency(_)));
    }

    #[test]
    fn topo_order_respects_partial_order_when_acyclic() {
        let mut g = DependencyGraph::new();
        g.build(vec![
            ticket("A", &[], TicketStatus::Todo, TicketPriority::P1),
            ticket("B", &["A"], TicketStatus::Todo, TicketPriority::P1),
            ticket("C", &["A"], TicketStatus::Todo, TicketPriority::P1),
            ticket("D", &["B", "C"], TicketStatus::Todo, TicketPriority::P1),
        ]);
        let order = g.get_topological_order().unwrap();
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("A") < pos("B"));
        assert!(pos("A") < pos("C"));
        assert!(pos("B") < pos("D"));
        assert!(pos("C") < pos("D"));
    }

    #[test]
    fn get_blocked_by_lists_unmet_dependencies() {
        let mut g = DependencyGraph::new();
        g.build(vec![
            ticket("A", &[], TicketStatus::Todo, TicketPriority::P1),
            ticket("B", &["A"], TicketStatus::InProgress, TicketPriority::P1),
        ]);
        assert_eq!(g.get_blocked_by("B"), vec!["A".to_string()]);
    }

    proptest::proptest! {
        #[test]
        fn dependents_of_dependencies_always_include_self(n in 2usize..8) {
            let mut g = DependencyGraph::new();
            let mut tickets = Vec::new();
            for i in 0..n {
                let id = format!("T{i}");
                let deps: Vec<String> = if i > 0 { vec![format!("T{}", i - 1)] } else { vec![] };
                let mut t = Ticket::new(&id, &id);
                t.dependencies = deps;
                tickets.push(t);
            }
            g.build(tickets);

            for id in g.nodes.keys().cloned().collect::<Vec<_>>() {
                for dep in g.get_dependencies(&id) {
                    proptest::prop_assert!(g.get_dependents(&dep).contains(&id));
                }
            }
        }
    }
}
