//! Prompt construction and decision parsing for each [`AgentKind`].
//!
//! SPEC_FULL §4.7.2/§9 model the four agent kinds as a closed tag dispatched
//! by `match`, each carrying its own prompt builder and output-decision
//! parser — never a trait object or inheritance hierarchy. This mirrors the
//! teacher's preference for plain enums over `dyn Trait` seen throughout
//! `crate::status` and `crate::types`.

use crate::types::{AgentKind, Ticket};

/// Everything a prompt builder needs that isn't already on the [`Ticket`]
/// itself.
pub struct PromptContext<'a> {
    pub project_root: &'a str,
    pub working_dir: &'a str,
    pub branch: Option<&'a str>,
}

/// The literal completion marker the agent process is instructed to print.
pub fn completion_marker(ticket_id: &str) -> String {
    format!("=== TICKET {ticket_id} COMPLETE ===")
}

/// The literal blocked-marker template (with a `<reason>` placeholder) the
/// agent process is instructed to print when it cannot proceed.
pub fn blocked_marker_template(ticket_id: &str) -> String {
    format!("=== TICKET {ticket_id} BLOCKED: <reason> ===")
}

impl AgentKind {
    /// Build the prompt text for spawning this kind of agent against
    /// `ticket`, dispatched by tag (SPEC_FULL §9: "dispatch by tag, not
    /// inheritance").
    pub fn build_prompt(self, ticket: &Ticket, ctx: &PromptContext) -> String {
        match self {
            AgentKind::Implementation => build_implementation_prompt(ticket, ctx),
            AgentKind::Refine => build_implementation_prompt(ticket, ctx),
            AgentKind::Review => build_review_prompt(ticket, ctx),
            AgentKind::Qa => build_qa_prompt(ticket, ctx),
        }
    }

    /// Parse the final decision line from a completed review/QA agent's
    /// output. `None` for kinds that have no decision (Implementation,
    /// Refine advance purely on validation results).
    pub fn parse_decision(self, output: &str) -> Option<Decision> {
        match self {
            AgentKind::Review => last_matching_decision(
                output,
                &[("APPROVED", Decision::Approved), ("CHANGES_REQUESTED", Decision::Rejected)],
            ),
            AgentKind::Qa => last_matching_decision(
                output,
                &[("PASSED", Decision::Approved), ("FAILED", Decision::Rejected)],
            ),
            AgentKind::Implementation | AgentKind::Refine => None,
        }
    }
}

/// The outcome of a review/QA agent's decision line (SPEC_FULL §4.8.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approved,
    Rejected,
}

fn last_matching_decision(output: &str, needles: &[(&str, Decision)]) -> Option<Decision> {
    output
        .lines()
        .rev()
        .find_map(|line| needles.iter().find(|(needle, _)| line.contains(needle)).map(|(_, d)| *d))
}

fn context_block(ticket: &Ticket, ctx: &PromptContext) -> String {
    let mut block = format!(
        "## Context\n- Project: {}\n- Working directory: {}\n- Priority: {}\n",
        ctx.project_root, ctx.working_dir, ticket.priority
    );
    if let Some(epic) = &ticket.epic {
        block.push_str(&format!("- Epic: {epic}\n"));
    }
    if let Some(branch) = ctx.branch {
        block.push_str(&format!(
            "\n## Git Context\nWork on branch `{branch}`. Commit your changes to this branch; do not commit to the mainline.\n"
        ));
    }
    block
}

fn bulleted(label: &str, items: &[String]) -> String {
    if items.is_empty() {
        return String::new();
    }
    let mut s = format!("## {label}\n");
    for item in items {
        s.push_str(&format!("- {item}\n"));
    }
    s
}

fn dependencies_block(ticket: &Ticket) -> String {
    if ticket.dependencies.is_empty() {
        return String::new();
    }
    format!("## Dependencies\n{}\n", ticket.dependencies.join(", "))
}

fn notes_block(ticket: &Ticket) -> String {
    ticket
        .notes
        .as_ref()
        .map(|n| format!("## Notes\n{n}\n"))
        .unwrap_or_default()
}

fn feedback_block(ticket: &Ticket) -> String {
    ticket
        .feedback
        .as_ref()
        .map(|f| format!("## Previous Feedback\n{f}\n"))
        .unwrap_or_default()
}

fn build_implementation_prompt(ticket: &Ticket, ctx: &PromptContext) -> String {
    format!(
        "# Ticket {}: {}\n\n{}\n## Task\n{}\n\n{}{}{}{}\n## Constraints\n- Stay within the scope of this ticket; do not touch unrelated files.\n- Run the validation steps yourself before reporting completion.\n- Commit your work to the branch named above (if any).\n\nWhen finished, print exactly:\n{}\n\nIf you cannot proceed, print exactly (with your reason substituted):\n{}\n",
        ticket.id,
        ticket.title,
        context_block(ticket, ctx),
        ticket.task_body(),
        bulleted("Acceptance Criteria", &ticket.acceptance_criteria),
        bulleted("Validation Steps", &ticket.validation_steps),
        dependencies_block(ticket),
        format!("{}{}", notes_block(ticket), feedback_block(ticket)),
        completion_marker(&ticket.id),
        blocked_marker_template(&ticket.id),
    )
}

fn build_review_prompt(ticket: &Ticket, ctx: &PromptContext) -> String {
    format!(
        "# Review Ticket {}: {}\n\n{}\n## Task\nReview the implementation against the acceptance criteria below. Check for correctness, style, and scope creep.\n\n{}{}## Decision\nEnd your review with a single line containing exactly `APPROVED` or `CHANGES_REQUESTED`.\n\nWhen finished, print exactly:\n{}\n",
        ticket.id,
        ticket.title,
        context_block(ticket, ctx),
        bulleted("Acceptance Criteria", &ticket.acceptance_criteria),
        feedback_block(ticket),
        completion_marker(&ticket.id),
    )
}

fn build_qa_prompt(ticket: &Ticket, ctx: &PromptContext) -> String {
    format!(
        "# QA Ticket {}: {}\n\n{}\n## Task\nRun the validation steps below against the implementation and confirm the acceptance criteria hold end-to-end.\n\n{}{}## Decision\nEnd your report with a single line containing exactly `PASSED` or `FAILED`.\n\nWhen finished, print exactly:\n{}\n",
        ticket.id,
        ticket.title,
        context_block(ticket, ctx),
        bulleted("Validation Steps", &ticket.validation_steps),
        feedback_block(ticket),
        completion_marker(&ticket.id),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket() -> Ticket {
        let mut t = Ticket::new("T1", "Add widget");
        t.description = Some("Implement the widget.".to_string());
        t.acceptance_criteria = vec!["Widget renders".to_string()];
        t.validation_steps = vec!["cargo test".to_string()];
        t.dependencies = vec!["T0".to_string()];
        t
    }

    #[test]
    fn implementation_prompt_includes_marker_and_branch() {
        let ctx = PromptContext {
            project_root: "/proj",
            working_dir: "/proj/epic-worktree-1",
            branch: Some("ticket/T1"),
        };
        let prompt = AgentKind::Implementation.build_prompt(&ticket(), &ctx);
        assert!(prompt.contains("=== TICKET T1 COMPLETE ==="));
        assert!(prompt.contains("ticket/T1"));
        assert!(prompt.contains("Widget renders"));
        assert!(prompt.contains("cargo test"));
        assert!(prompt.contains("T0"));
    }

    #[test]
    fn implementation_prompt_omits_git_section_without_branch() {
        let ctx = PromptContext {
            project_root: "/proj",
            working_dir: "/proj",
            branch: None,
        };
        let prompt = AgentKind::Implementation.build_prompt(&ticket(), &ctx);
        assert!(!prompt.contains("Git Context"));
    }

    #[test]
    fn review_decision_picks_the_last_matching_line() {
        let output = "notes...\nAPPROVED\nmore trailing chatter\nCHANGES_REQUESTED\n";
        assert_eq!(AgentKind::Review.parse_decision(output), Some(Decision::Rejected));
    }

    #[test]
    fn qa_decision_parses_passed() {
        let output = "ran the suite\nPASSED\n";
        assert_eq!(AgentKind::Qa.parse_decision(output), Some(Decision::Approved));
    }

    #[test]
    fn implementation_has_no_decision() {
        assert_eq!(AgentKind::Implementation.parse_decision("APPROVED"), None);
    }
}
