//! Markdown plan parsing and serialization.
//!
//! Grounded on the teacher's `plan::parser::parse_plan_content`: walk the
//! document with `comrak`'s AST so headings inside fenced code blocks are
//! never mistaken for section boundaries, accumulate each section's body by
//! re-rendering its non-heading nodes back to CommonMark (the teacher's
//! `render_node_to_markdown`), then run targeted `regex` passes over that
//! body text to pull out the bold-label fields.

use comrak::nodes::{AstNode, NodeValue};
use comrak::{Arena, Options, parse_document};
use regex::Regex;
use std::sync::LazyLock;

use crate::error::{OrchError, Result};
use crate::types::{Ticket, TicketPriority, TicketStatus, normalize_ticket_id};

static TICKET_HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^Ticket:\s*(T\d+)\s+(.+)$").unwrap());

static LABEL_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\*\*(Priority|Status|Owner|Epic|Dependencies|Acceptance Criteria|Validation Steps|Notes|Feedback)\*\*:?\s*(.*)$",
    )
    .unwrap()
});

static LIST_ITEM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*-\s+(.+)$").unwrap());

/// The result of parsing a plan document: the H1 title (if present) and the
/// tickets found anywhere in the body as H3 `### Ticket: T<digits> <title>`
/// sections.
#[derive(Debug, Clone, Default)]
pub struct ParsedPlan {
    pub title: Option<String>,
    pub preamble: String,
    pub tickets: Vec<Ticket>,
}

pub fn parse_plan(content: &str) -> Result<ParsedPlan> {
    let arena = Arena::new();
    let options = Options::default();
    let root = parse_document(&arena, content, &options);

    let mut plan = ParsedPlan::default();
    let mut current_ticket: Option<(String, String, String)> = None; // (id, title, body)
    let mut preamble_done = false;

    for node in root.children() {
        match &node.data.borrow().value {
            NodeValue::Heading(heading) => {
                let text = extract_text_content(node);
                match heading.level {
                    1 => {
                        plan.title = Some(text.trim().to_string());
                        preamble_done = true;
                    }
                    3 => {
                        preamble_done = true;
                        if let Some((id, title, body)) = current_ticket.take() {
                            plan.tickets.push(parse_ticket_section(&id, &title, &body)?);
                        }
                        if let Some(caps) = TICKET_HEADING_RE.captures(text.trim()) {
                            let id = normalize_ticket_id(&caps[1]);
                            let title = caps[2].trim().to_string();
                            current_ticket = Some((id, title, String::new()));
                        }
                    }
                    _ => {
                        preamble_done = true;
                        if let Some((_, _, body)) = current_ticket.as_mut() {
                            body.push_str(&render_node_to_markdown(node, &options));
                        }
                    }
                }
            }
            _ => {
                let rendered = render_node_to_markdown(node, &options);
                if let Some((_, _, body)) = current_ticket.as_mut() {
                    body.push_str(&rendered);
                } else if !preamble_done {
                    plan.preamble.push_str(&rendered);
                }
            }
        }
    }

    if let Some((id, title, body)) = current_ticket.take() {
        plan.tickets.push(parse_ticket_section(&id, &title, &body)?);
    }

    Ok(plan)
}

fn parse_ticket_section(id: &str, title: &str, body: &str) -> Result<Ticket> {
    let mut ticket = Ticket::new(id, title);

    #[derive(PartialEq, Eq, Clone, Copy)]
    enum Collecting {
        None,
        AcceptanceCriteria,
        ValidationSteps,
    }
    let mut collecting = Collecting::None;
    let mut description_lines: Vec<String> = Vec::new();
    let mut in_fence = false;

    for line in body.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }

        if let Some(caps) = LABEL_LINE_RE.captures(line.trim()) {
            collecting = Collecting::None;
            let label = caps[1].to_lowercase();
            let value = caps[2].trim().to_string();
            match label.as_str() {
                "priority" => {
                    ticket.priority = value
                        .parse::<TicketPriority>()
                        .map_err(|_| OrchError::PlanParse(format!("ticket {id}: invalid priority '{value}'")))?;
                }
                "status" => {
                    ticket.status = value
                        .parse::<TicketStatus>()
                        .map_err(|_| OrchError::PlanParse(format!("ticket {id}: invalid status '{value}'")))?;
                }
                "owner" => {
                    ticket.owner = if value.is_empty() { None } else { Some(value) };
                }
                "epic" => {
                    ticket.epic = if value.is_empty() { None } else { Some(value) };
                }
                "dependencies" => {
                    ticket.dependencies = value
                        .split(',')
                        .map(|s| s.trim())
                        .filter(|s| !s.is_empty())
                        .map(normalize_ticket_id)
                        .collect();
                }
                "acceptance criteria" => {
                    collecting = Collecting::AcceptanceCriteria;
                    if !value.is_empty() {
                        ticket.acceptance_criteria.push(value);
                    }
                }
                "validation steps" => {
                    collecting = Collecting::ValidationSteps;
                    if !value.is_empty() {
                        ticket.validation_steps.push(value);
                    }
                }
                "notes" => {
                    ticket.notes = if value.is_empty() { None } else { Some(value) };
                }
                "feedback" => {
                    ticket.feedback = if value.is_empty() { None } else { Some(value) };
                }
                _ => {}
            }
            continue;
        }

        if let Some(caps) = LIST_ITEM_RE.captures(line) {
            let item = caps[1].trim().to_string();
            match collecting {
                Collecting::AcceptanceCriteria => ticket.acceptance_criteria.push(item),
                Collecting::ValidationSteps => ticket.validation_steps.push(item),
                Collecting::None => {}
            }
            continue;
        }

        if collecting == Collecting::None {
            let text = line.trim();
            if !text.is_empty() {
                description_lines.push(text.to_string());
            }
        }
    }

    if !description_lines.is_empty() {
        ticket.description = Some(description_lines.join(" "));
    }

    if ticket.dependencies.contains(&ticket.id) {
        return Err(OrchError::PlanParse(format!(
            "ticket {id}: cannot depend on itself"
        )));
    }

    Ok(ticket)
}

fn extract_text_content<'a>(node: &'a AstNode<'a>) -> String {
    let mut text = String::new();
    collect_text(node, &mut text);
    text
}

fn collect_text<'a>(node: &'a AstNode<'a>, text: &mut String) {
    match &node.data.borrow().value {
        NodeValue::Text(t) => text.push_str(t),
        NodeValue::Code(c) => text.push_str(&c.literal),
        NodeValue::SoftBreak | NodeValue::LineBreak => text.push(' '),
        _ => {
            for child in node.children() {
                collect_text(child, text);
            }
        }
    }
}

fn render_node_to_markdown<'a>(node: &'a AstNode<'a>, options: &Options) -> String {
    let mut output = Vec::new();
    comrak::format_commonmark(node, options, &mut output).unwrap_or_default();
    String::from_utf8_lossy(&output).to_string()
}

/// Serialize a ticket back into its `### Ticket:` section, emitting only
/// recognized fields. Unknown content introduced by hand-editing is not
/// round-tripped byte-for-byte; ticket *records* are (the property this
/// repo tests — see `plan::tests::round_trip_preserves_ticket_fields`).
pub fn serialize_ticket(ticket: &Ticket) -> String {
    let mut out = String::new();
    out.push_str(&format!("### Ticket: {} {}\n\n", ticket.id, ticket.title));
    out.push_str(&format!("**Priority**: {}\n", ticket.priority));
    out.push_str(&format!("**Status**: {}\n", ticket.status));
    if let Some(owner) = &ticket.owner {
        out.push_str(&format!("**Owner**: {owner}\n"));
    }
    if let Some(epic) = &ticket.epic {
        out.push_str(&format!("**Epic**: {epic}\n"));
    }
    if !ticket.dependencies.is_empty() {
        out.push_str(&format!("**Dependencies**: {}\n", ticket.dependencies.join(", ")));
    }
    if let Some(desc) = &ticket.description {
        out.push_str(&format!("\n{desc}\n"));
    }
    if !ticket.acceptance_criteria.is_empty() {
        out.push_str("\n**Acceptance Criteria**:\n");
        for item in &ticket.acceptance_criteria {
            out.push_str(&format!("- {item}\n"));
        }
    }
    if !ticket.validation_steps.is_empty() {
        out.push_str("\n**Validation Steps**:\n");
        for item in &ticket.validation_steps {
            out.push_str(&format!("- {item}\n"));
        }
    }
    if let Some(notes) = &ticket.notes {
        out.push_str(&format!("\n**Notes**: {notes}\n"));
    }
    if let Some(feedback) = &ticket.feedback {
        out.push_str(&format!("\n**Feedback**: {feedback}\n"));
    }
    out.push('\n');
    out
}

pub fn serialize_plan(title: Option<&str>, preamble: &str, tickets: &[Ticket]) -> String {
    let mut out = String::new();
    if let Some(title) = title {
        out.push_str(&format!("# {title}\n\n"));
    }
    if !preamble.trim().is_empty() {
        out.push_str(preamble.trim());
        out.push_str("\n\n");
    }
    for ticket in tickets {
        out.push_str(&serialize_ticket(ticket));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"# Example Plan

Ship the widget.

### Ticket: T001 Build the widget

**Priority**: p0
**Status**: todo
**Epic**: widget
**Dependencies**:

**Acceptance Criteria**:
- It spins
- It doesn't fall off

**Validation Steps**:
- cargo test

### Ticket: t002 Polish the widget

**Priority**: p1
**Status**: todo
**Dependencies**: t001

Some free-form notes paragraph that isn't a recognized label.

**Notes**: make it shiny
"#;

    #[test]
    fn parses_title_and_two_tickets() {
        let plan = parse_plan(SAMPLE).unwrap();
        assert_eq!(plan.title.as_deref(), Some("Example Plan"));
        assert_eq!(plan.tickets.len(), 2);
        assert_eq!(plan.tickets[0].id, "T001");
        assert_eq!(plan.tickets[1].id, "T002");
    }

    #[test]
    fn parses_fields_case_insensitively_and_normalizes_ids() {
        let plan = parse_plan(SAMPLE).unwrap();
        let t2 = &plan.tickets[1];
        assert_eq!(t2.dependencies, vec!["T001".to_string()]);
        assert_eq!(t2.notes.as_deref(), Some("make it shiny"));
    }

    #[test]
    fn parses_acceptance_criteria_and_validation_steps_lists() {
        let plan = parse_plan(SAMPLE).unwrap();
        let t1 = &plan.tickets[0];
        assert_eq!(
            t1.acceptance_criteria,
            vec!["It spins".to_string(), "It doesn't fall off".to_string()]
        );
        assert_eq!(t1.validation_steps, vec!["cargo test".to_string()]);
    }

    #[test]
    fn self_dependency_is_rejected() {
        let content = r#"### Ticket: T001 Loops forever

**Dependencies**: T001
"#;
        let err = parse_plan(content).unwrap_err();
        assert!(matches!(err, OrchError::PlanParse(_)));
    }

    #[test]
    fn fenced_code_hashes_do_not_create_fake_tickets() {
        let content = r#"### Ticket: T001 Real ticket

```
### Ticket: T999 Not a real heading, just text in a fence
```

**Priority**: p0
"#;
        let plan = parse_plan(content).unwrap();
        assert_eq!(plan.tickets.len(), 1);
        assert_eq!(plan.tickets[0].id, "T001");
    }

    #[test]
    fn round_trip_preserves_ticket_fields() {
        let plan = parse_plan(SAMPLE).unwrap();
        let rewritten = serialize_plan(plan.title.as_deref(), &plan.preamble, &plan.tickets);
        let reparsed = parse_plan(&rewritten).unwrap();
        assert_eq!(reparsed.tickets.len(), plan.tickets.len());
        for (a, b) in plan.tickets.iter().zip(reparsed.tickets.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.title, b.title);
            assert_eq!(a.priority, b.priority);
            assert_eq!(a.status, b.status);
            assert_eq!(a.dependencies, b.dependencies);
            assert_eq!(a.acceptance_criteria, b.acceptance_criteria);
            assert_eq!(a.validation_steps, b.validation_steps);
        }
    }
}
