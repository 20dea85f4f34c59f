//! Worktree Manager: maps ticket work onto isolated working directories.
//!
//! Git invocation follows the teacher's `utils::get_git_user_name` idiom —
//! `std::process::Command::new("git")` with explicit `args`, output
//! captured and checked for a successful exit status — generalized to a
//! small set of worktree/merge subcommands (SPEC_FULL §6's version-control
//! subprocess contract).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::config::EpicsConfig;
use crate::error::{OrchError, Result};
use crate::events::{EventBus, OrchEvent};
use crate::types::{AgentId, Epic, MergeResult, Ticket, TicketId, WorktreeAllocation};

struct EpicState {
    epic: Epic,
    active: HashMap<AgentId, WorktreeAllocation>,
}

pub struct WorktreeManager {
    project_root: PathBuf,
    config: EpicsConfig,
    event_bus: Arc<EventBus>,
    epics: Mutex<HashMap<String, EpicState>>,
}

fn run_git(root: &Path, args: &[&str]) -> Result<std::process::Output> {
    Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .map_err(OrchError::Io)
}

fn run_git_ok(root: &Path, args: &[&str]) -> Result<String> {
    let output = run_git(root, args)?;
    if !output.status.success() {
        return Err(OrchError::Worktree {
            operation: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

impl WorktreeManager {
    pub fn new(project_root: impl Into<PathBuf>, config: EpicsConfig, event_bus: Arc<EventBus>) -> Self {
        WorktreeManager {
            project_root: project_root.into(),
            config,
            event_bus,
            epics: Mutex::new(HashMap::new()),
        }
    }

    /// Unique epic names referenced by `tickets`, each defaulting to a
    /// same-named subdirectory of the project root.
    pub fn discover_epics(&self, tickets: &[Ticket]) -> Vec<Epic> {
        let mut names: Vec<String> = tickets.iter().filter_map(|t| t.epic.clone()).collect();
        names.sort();
        names.dedup();
        names
            .into_iter()
            .map(|name| {
                let path = self.project_root.join(&name);
                Epic { name, path }
            })
            .collect()
    }

    /// Validate directories exist (warning only) and reconcile per-epic
    /// active counts by parsing `git worktree list --porcelain` for names
    /// matching `<epic>-worktree-<agent_id>`.
    pub fn initialize(&self, epics: Vec<Epic>) -> Result<()> {
        let mut state = self.epics.lock();
        state.clear();

        for epic in epics {
            if !epic.path.exists() {
                self.event_bus.publish(OrchEvent::warn(format!(
                    "epic '{}' directory does not exist at {}",
                    epic.name,
                    epic.path.display()
                )));
            }
            state.insert(
                epic.name.clone(),
                EpicState {
                    epic,
                    active: HashMap::new(),
                },
            );
        }
        drop(state);

        if let Ok(output) = run_git_ok(&self.project_root, &["worktree", "list", "--porcelain"]) {
            self.reconcile_from_porcelain(&output);
        }
        Ok(())
    }

    fn reconcile_from_porcelain(&self, porcelain: &str) {
        let mut state = self.epics.lock();
        for line in porcelain.lines() {
            let Some(path_str) = line.strip_prefix("worktree ") else {
                continue;
            };
            let path = PathBuf::from(path_str);
            let Some(dir_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            for epic_state in state.values_mut() {
                let prefix = format!("{}-worktree-", epic_state.epic.name);
                if let Some(agent_suffix) = dir_name.strip_prefix(&prefix) {
                    if let Ok(agent_id) = agent_suffix.parse::<AgentId>() {
                        epic_state.active.entry(agent_id).or_insert_with(|| WorktreeAllocation {
                            path: path.clone(),
                            epic: Some(epic_state.epic.name.clone()),
                            agent_id,
                            ticket_id: String::new(),
                            branch: String::new(),
                            created_at: SystemTime::now(),
                            is_new: false,
                        });
                    }
                }
            }
        }
    }

    pub fn allocate_worktree(&self, ticket: &Ticket, agent_id: AgentId) -> Result<WorktreeAllocation> {
        let Some(epic_name) = &ticket.epic else {
            return Ok(WorktreeAllocation {
                path: self.project_root.clone(),
                epic: None,
                agent_id,
                ticket_id: ticket.id.clone(),
                branch: "main".to_string(),
                created_at: SystemTime::now(),
                is_new: false,
            });
        };

        let branch = format!("ticket/{}", ticket.id);
        let mut state = self.epics.lock();
        let epic_state = state
            .get_mut(epic_name)
            .ok_or_else(|| OrchError::EpicNotFound(epic_name.clone()))?;

        if epic_state.active.is_empty() {
            let allocation = WorktreeAllocation {
                path: epic_state.epic.path.clone(),
                epic: Some(epic_name.clone()),
                agent_id,
                ticket_id: ticket.id.clone(),
                branch: branch.clone(),
                created_at: SystemTime::now(),
                is_new: false,
            };
            epic_state.active.insert(agent_id, allocation.clone());
            return Ok(allocation);
        }

        if !self.config.auto_create_worktrees {
            return Err(OrchError::EpicCapacity(epic_name.clone()));
        }
        if epic_state.active.len() >= self.config.max_worktrees_per_epic {
            return Err(OrchError::EpicCapacity(epic_name.clone()));
        }

        let worktree_path = self
            .project_root
            .join(format!("{epic_name}-worktree-{agent_id}"));

        run_git_ok(
            &self.project_root,
            &[
                "worktree",
                "add",
                "-b",
                &branch,
                worktree_path.to_str().unwrap_or_default(),
            ],
        )?;

        let allocation = WorktreeAllocation {
            path: worktree_path.clone(),
            epic: Some(epic_name.clone()),
            agent_id,
            ticket_id: ticket.id.clone(),
            branch: branch.clone(),
            created_at: SystemTime::now(),
            is_new: true,
        };
        epic_state.active.insert(agent_id, allocation.clone());
        drop(state);

        self.event_bus.publish(OrchEvent::EpicWorktreeCreated {
            timestamp: jiff::Timestamp::now(),
            epic: epic_name.clone(),
            path: worktree_path.display().to_string(),
            branch,
        });

        Ok(allocation)
    }

    pub fn release_worktree(&self, agent_id: AgentId) {
        let mut state = self.epics.lock();
        for epic_state in state.values_mut() {
            epic_state.active.remove(&agent_id);
        }
    }

    pub fn merge_worktree(&self, path: &Path, target_branch: &str) -> Result<MergeResult> {
        run_git_ok(&self.project_root, &["checkout", target_branch])?;

        let branch = run_git_ok(path, &["rev-parse", "--abbrev-ref", "HEAD"])?;
        let merge_output = run_git(&self.project_root, &["merge", "--no-edit", &branch])?;

        if merge_output.status.success() {
            let commit = run_git_ok(&self.project_root, &["rev-parse", "HEAD"])?;
            self.event_bus.publish(OrchEvent::EpicWorktreeMerged {
                timestamp: jiff::Timestamp::now(),
                epic: String::new(),
                path: path.display().to_string(),
                commit: commit.clone(),
            });

            if self.config.cleanup_on_merge && !self.is_epic_main(path) {
                self.cleanup_worktree(path)?;
            }

            return Ok(MergeResult {
                success: true,
                has_conflicts: false,
                conflict_files: Vec::new(),
                commit: Some(commit),
            });
        }

        let unresolved = run_git_ok(
            &self.project_root,
            &["diff", "--name-only", "--diff-filter=U"],
        )?;
        let conflict_files: Vec<String> = unresolved.lines().map(|s| s.to_string()).collect();

        if !conflict_files.is_empty() {
            self.event_bus.publish(OrchEvent::EpicConflict {
                timestamp: jiff::Timestamp::now(),
                epic: String::new(),
                path: path.display().to_string(),
                conflict_files: conflict_files.clone(),
            });
            return Ok(MergeResult {
                success: false,
                has_conflicts: true,
                conflict_files,
                commit: None,
            });
        }

        Err(OrchError::Worktree {
            operation: "merge".to_string(),
            stderr: String::from_utf8_lossy(&merge_output.stderr).into_owned(),
        })
    }

    fn is_epic_main(&self, path: &Path) -> bool {
        self.epics
            .lock()
            .values()
            .any(|s| s.epic.path == path)
    }

    pub fn retry_merge(&self, path: &Path) -> Result<MergeResult> {
        let merge_head = run_git(path, &["rev-parse", "-q", "--verify", "MERGE_HEAD"])?;
        if !merge_head.status.success() {
            return Err(OrchError::NoMergeInProgress(path.display().to_string()));
        }

        run_git_ok(path, &["commit", "--no-edit"])?;
        let commit = run_git_ok(path, &["rev-parse", "HEAD"])?;
        Ok(MergeResult {
            success: true,
            has_conflicts: false,
            conflict_files: Vec::new(),
            commit: Some(commit),
        })
    }

    pub fn cleanup_worktree(&self, path: &Path) -> Result<()> {
        run_git_ok(
            &self.project_root,
            &["worktree", "remove", "--force", path.to_str().unwrap_or_default()],
        )?;
        Ok(())
    }

    pub fn cleanup_stale_worktrees(&self, max_age: std::time::Duration) -> Result<Vec<PathBuf>> {
        let now = SystemTime::now();
        let stale: Vec<(PathBuf, bool)> = {
            let state = self.epics.lock();
            state
                .values()
                .flat_map(|s| {
                    let main_path = s.epic.path.clone();
                    s.active.values().map(move |a| {
                        let age_ok = now.duration_since(a.created_at).unwrap_or_default() >= max_age;
                        (a.path.clone(), age_ok && a.path != main_path)
                    })
                })
                .filter(|(_, should_remove)| *should_remove)
                .collect()
        };

        let mut removed = Vec::new();
        for (path, _) in stale {
            self.cleanup_worktree(&path)?;
            removed.push(path);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TicketPriority;

    fn ticket_with_epic(id: &str, epic: Option<&str>) -> Ticket {
        let mut t = Ticket::new(id, id);
        t.priority = TicketPriority::P1;
        t.epic = epic.map(|s| s.to_string());
        t
    }

    #[test]
    fn ticket_without_epic_uses_project_root_and_main_branch() {
        let bus = Arc::new(EventBus::new());
        let mgr = WorktreeManager::new("/tmp/proj", EpicsConfig::default(), bus);
        let allocation = mgr.allocate_worktree(&ticket_with_epic("T1", None), 1).unwrap();
        assert_eq!(allocation.branch, "main");
        assert!(!allocation.is_new);
    }

    #[test]
    fn allocate_without_discovered_epic_fails() {
        let bus = Arc::new(EventBus::new());
        let mgr = WorktreeManager::new("/tmp/proj", EpicsConfig::default(), bus);
        let err = mgr
            .allocate_worktree(&ticket_with_epic("T1", Some("core")), 1)
            .unwrap_err();
        assert!(matches!(err, OrchError::EpicNotFound(_)));
    }

    #[test]
    fn discover_epics_deduplicates_and_sorts() {
        let bus = Arc::new(EventBus::new());
        let mgr = WorktreeManager::new("/tmp/proj", EpicsConfig::default(), bus);
        let tickets = vec![
            ticket_with_epic("T1", Some("b")),
            ticket_with_epic("T2", Some("a")),
            ticket_with_epic("T3", Some("a")),
            ticket_with_epic("T4", None),
        ];
        let epics = mgr.discover_epics(&tickets);
        assert_eq!(epics.iter().map(|e| e.name.clone()).collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
