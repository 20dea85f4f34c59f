//! Status pipeline: a pure table of legal ticket transitions.
//!
//! Grounded on the teacher's `status::mod` — free `const fn` predicates over
//! `TicketStatus`, colocated tests, no state. The default machine:
//!
//! ```text
//! Todo -> InProgress -> Review -> Qa -> Done
//!                ↘ Failed
//! Review/Qa -> Todo (rejection with feedback)
//! Failed -> Todo (retry)
//! ```
//!
//! `automation.review.mode = "skip"` collapses InProgress -> Qa directly;
//! `automation.qa.mode = "skip"` collapses the post-review step straight to
//! Done.

use crate::config::AutomationConfig;
use crate::error::{OrchError, Result};
use crate::types::TicketStatus;

/// The next status an advancing ticket should move to, given the current
/// automation config. Does not mutate anything; callers apply the result
/// via `Ticket` / `PlanStore::update_ticket_status`.
pub fn get_next_status(current: TicketStatus, automation: &AutomationConfig) -> Option<TicketStatus> {
    let review_skip = automation.review.mode == "skip";
    let qa_skip = automation.qa.mode == "skip";

    match current {
        TicketStatus::Todo => Some(TicketStatus::InProgress),
        TicketStatus::InProgress => {
            if review_skip && qa_skip {
                Some(TicketStatus::Done)
            } else if review_skip {
                Some(TicketStatus::Qa)
            } else {
                Some(TicketStatus::Review)
            }
        }
        TicketStatus::Review => {
            if qa_skip {
                Some(TicketStatus::Done)
            } else {
                Some(TicketStatus::Qa)
            }
        }
        TicketStatus::Qa => Some(TicketStatus::Done),
        TicketStatus::Done | TicketStatus::Failed => None,
    }
}

pub fn can_advance(from: TicketStatus, to: TicketStatus, automation: &AutomationConfig) -> bool {
    get_next_status(from, automation) == Some(to)
}

/// Rejection sends a ticket in Review or Qa back to Todo with feedback.
pub fn can_reject(from: TicketStatus, to: TicketStatus) -> bool {
    matches!(from, TicketStatus::Review | TicketStatus::Qa) && to == TicketStatus::Todo
}

/// Retry sends a Failed ticket back to Todo.
pub fn can_retry(from: TicketStatus, to: TicketStatus) -> bool {
    from == TicketStatus::Failed && to == TicketStatus::Todo
}

/// A ticket in any non-terminal status can fail.
pub fn can_fail(from: TicketStatus, to: TicketStatus) -> bool {
    !from.is_terminal() && to == TicketStatus::Failed
}

pub fn is_valid_transition(from: TicketStatus, to: TicketStatus, automation: &AutomationConfig) -> bool {
    can_advance(from, to, automation) || can_reject(from, to) || can_retry(from, to) || can_fail(from, to)
}

pub fn assert_valid_transition(
    from: TicketStatus,
    to: TicketStatus,
    id: &str,
    automation: &AutomationConfig,
) -> Result<()> {
    if is_valid_transition(from, to, automation) {
        Ok(())
    } else {
        Err(OrchError::InvalidTransition {
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn automatic() -> AutomationConfig {
        AutomationConfig::default()
    }

    fn with_modes(review: &str, qa: &str) -> AutomationConfig {
        let mut a = AutomationConfig::default();
        a.review.mode = review.to_string();
        a.qa.mode = qa.to_string();
        a
    }

    #[test]
    fn default_chain_goes_through_review_and_qa() {
        let a = automatic();
        assert_eq!(get_next_status(TicketStatus::Todo, &a), Some(TicketStatus::InProgress));
        assert_eq!(get_next_status(TicketStatus::InProgress, &a), Some(TicketStatus::Review));
        assert_eq!(get_next_status(TicketStatus::Review, &a), Some(TicketStatus::Qa));
        assert_eq!(get_next_status(TicketStatus::Qa, &a), Some(TicketStatus::Done));
    }

    #[test]
    fn review_skip_collapses_in_progress_to_qa() {
        let a = with_modes("skip", "automatic");
        assert_eq!(get_next_status(TicketStatus::InProgress, &a), Some(TicketStatus::Qa));
    }

    #[test]
    fn both_skip_collapses_straight_to_done() {
        let a = with_modes("skip", "skip");
        assert_eq!(get_next_status(TicketStatus::InProgress, &a), Some(TicketStatus::Done));
    }

    #[test]
    fn terminal_statuses_have_no_next() {
        let a = automatic();
        assert_eq!(get_next_status(TicketStatus::Done, &a), None);
        assert_eq!(get_next_status(TicketStatus::Failed, &a), None);
    }

    #[test]
    fn rejection_from_done_is_invalid() {
        // SPEC_FULL §8 seed scenario 5.
        let a = automatic();
        assert!(assert_valid_transition(TicketStatus::Done, TicketStatus::InProgress, "T1", &a).is_err());
    }

    #[test]
    fn retry_only_valid_from_failed() {
        assert!(can_retry(TicketStatus::Failed, TicketStatus::Todo));
        assert!(!can_retry(TicketStatus::Done, TicketStatus::Todo));
    }

    #[test]
    fn reject_only_valid_from_review_or_qa() {
        assert!(can_reject(TicketStatus::Review, TicketStatus::Todo));
        assert!(can_reject(TicketStatus::Qa, TicketStatus::Todo));
        assert!(!can_reject(TicketStatus::InProgress, TicketStatus::Todo));
    }

    proptest::proptest! {
        #[test]
        fn every_advance_satisfies_is_valid_transition(review_skip: bool, qa_skip: bool) {
            let a = with_modes(
                if review_skip { "skip" } else { "automatic" },
                if qa_skip { "skip" } else { "automatic" },
            );
            for from in [
                TicketStatus::Todo,
                TicketStatus::InProgress,
                TicketStatus::Review,
                TicketStatus::Qa,
            ] {
                if let Some(to) = get_next_status(from, &a) {
                    proptest::prop_assert!(is_valid_transition(from, to, &a));
                }
            }
        }
    }
}
