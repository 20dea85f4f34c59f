//! Layered application configuration.
//!
//! Effective configuration is assembled from, in increasing precedence:
//! built-in defaults, `orch.config.json` in the project root, `.orchrc`
//! (also JSON) in the project root, then environment variables. The
//! teacher's `config.rs` loads a single YAML file with serde defaults and
//! `is_default` skip helpers; here the same `Default`-impl/skip pattern
//! carries over, generalized to layer three additional sources.

pub mod watcher;

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{OrchError, Result};

fn default_max_agents() -> usize {
    5
}
fn default_agent_model() -> String {
    "sonnet".to_string()
}
fn default_agent_command() -> String {
    "agent".to_string()
}
fn default_plan_file() -> String {
    "PLAN.md".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_ticket_progression() -> String {
    "automatic".to_string()
}
fn default_review_mode() -> String {
    "automatic".to_string()
}
fn default_qa_mode() -> String {
    "automatic".to_string()
}
fn default_cost_action() -> String {
    "warn".to_string()
}
fn default_max_worktrees_per_epic() -> usize {
    3
}
fn default_max_retries() -> u32 {
    2
}
fn default_input_rate() -> f64 {
    3.00
}
fn default_output_rate() -> f64 {
    15.00
}
fn default_validation_timeout() -> u64 {
    300
}

/// `automation.ticketProgression` / `automation.review.mode` /
/// `automation.qa.mode`. Review and QA additionally allow `skip`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationMode {
    Automatic,
    Approval,
    Manual,
    Skip,
}

impl std::str::FromStr for AutomationMode {
    type Err = OrchError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "automatic" => Ok(AutomationMode::Automatic),
            "approval" => Ok(AutomationMode::Approval),
            "manual" => Ok(AutomationMode::Manual),
            "skip" => Ok(AutomationMode::Skip),
            other => Err(OrchError::Config(format!(
                "invalid automation mode '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostLimitAction {
    Warn,
    Pause,
    Stop,
}

impl std::str::FromStr for CostLimitAction {
    type Err = OrchError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "warn" => Ok(CostLimitAction::Warn),
            "pause" => Ok(CostLimitAction::Pause),
            "stop" => Ok(CostLimitAction::Stop),
            other => Err(OrchError::Config(format!(
                "invalid cost limit action '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationConfig {
    #[serde(default = "default_ticket_progression")]
    pub ticket_progression: String,
    #[serde(default)]
    pub review: ReviewQaConfig,
    #[serde(default)]
    pub qa: ReviewQaConfig,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        AutomationConfig {
            ticket_progression: default_ticket_progression(),
            review: ReviewQaConfig::default_review(),
            qa: ReviewQaConfig::default_qa(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewQaConfig {
    pub mode: String,
}

impl ReviewQaConfig {
    fn default_review() -> Self {
        ReviewQaConfig {
            mode: default_review_mode(),
        }
    }
    fn default_qa() -> Self {
        ReviewQaConfig {
            mode: default_qa_mode(),
        }
    }
}

impl Default for ReviewQaConfig {
    fn default() -> Self {
        Self::default_review()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostLimitConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_ticket: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_session: Option<f64>,
    #[serde(default = "default_cost_action")]
    pub action: String,
}

impl Default for CostLimitConfig {
    fn default() -> Self {
        CostLimitConfig {
            per_ticket: None,
            per_session: None,
            action: default_cost_action(),
        }
    }
}

impl CostLimitConfig {
    pub fn action(&self) -> CostLimitAction {
        self.action.parse().unwrap_or(CostLimitAction::Warn)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpicsConfig {
    #[serde(default = "default_true")]
    pub auto_create_worktrees: bool,
    #[serde(default = "default_max_worktrees_per_epic")]
    pub max_worktrees_per_epic: usize,
    #[serde(default = "default_true")]
    pub cleanup_on_merge: bool,
}

fn default_true() -> bool {
    true
}

impl Default for EpicsConfig {
    fn default() -> Self {
        EpicsConfig {
            auto_create_worktrees: true,
            max_worktrees_per_epic: default_max_worktrees_per_epic(),
            cleanup_on_merge: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecoveryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub malformed_output_is_failure: bool,
}

impl Default for ErrorRecoveryConfig {
    fn default() -> Self {
        ErrorRecoveryConfig {
            max_retries: default_max_retries(),
            malformed_output_is_failure: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRatesConfig {
    #[serde(default = "default_input_rate")]
    pub input_per_million: f64,
    #[serde(default = "default_output_rate")]
    pub output_per_million: f64,
}

impl Default for TokenRatesConfig {
    fn default() -> Self {
        TokenRatesConfig {
            input_per_million: default_input_rate(),
            output_per_million: default_output_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationConfig {
    #[serde(default = "default_validation_timeout")]
    pub default_timeout_seconds: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        ValidationConfig {
            default_timeout_seconds: default_validation_timeout(),
        }
    }
}

/// Main configuration structure. Mirrors the teacher's `Config`: a flat
/// top-level struct with `#[serde(default = ...)]` per-field fallbacks, so
/// any subset of keys can appear in `orch.config.json` or `.orchrc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,
    #[serde(default = "default_agent_model")]
    pub agent_model: String,
    /// Executable name for the external coding-agent CLI (SPEC_FULL §6).
    #[serde(default = "default_agent_command")]
    pub agent_command: String,
    #[serde(default = "default_plan_file")]
    pub plan_file: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub automation: AutomationConfig,
    #[serde(default)]
    pub cost_limit: CostLimitConfig,
    #[serde(default)]
    pub epics: EpicsConfig,
    #[serde(default)]
    pub error_recovery: ErrorRecoveryConfig,
    #[serde(default)]
    pub token_rates: TokenRatesConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_agents: default_max_agents(),
            agent_model: default_agent_model(),
            agent_command: default_agent_command(),
            plan_file: default_plan_file(),
            log_level: default_log_level(),
            automation: AutomationConfig::default(),
            cost_limit: CostLimitConfig::default(),
            epics: EpicsConfig::default(),
            error_recovery: ErrorRecoveryConfig::default(),
            token_rates: TokenRatesConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

/// A non-fatal problem found while applying an override layer: the prior
/// layer's value is retained and the detail is surfaced to the caller so it
/// can be logged via `log:entry` rather than silently swallowed.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub source: &'static str,
    pub detail: String,
}

impl Config {
    pub fn project_config_path(root: &Path) -> PathBuf {
        root.join("orch.config.json")
    }

    pub fn orchrc_path(root: &Path) -> PathBuf {
        root.join(".orchrc")
    }

    /// Load the effective configuration for `root`, silently ignoring
    /// invalid overrides. Prefer [`Config::load_with_details`] when the
    /// caller wants to report what was ignored.
    pub fn load(root: &Path) -> Result<Config> {
        let (config, _issues) = Config::load_with_details(root, &env::vars().collect())?;
        Ok(config)
    }

    /// Load the effective configuration, returning both the result and the
    /// list of overrides that were ignored because they failed validation
    /// (SPEC_FULL §6: "Invalid values are ignored with a validation error
    /// surfaced via `load_config_with_details`").
    pub fn load_with_details(
        root: &Path,
        env_vars: &HashMap<String, String>,
    ) -> Result<(Config, Vec<ConfigIssue>)> {
        let mut config = Config::default();
        let mut issues = Vec::new();

        for (path, source) in [
            (Config::project_config_path(root), "orch.config.json"),
            (Config::orchrc_path(root), ".orchrc"),
        ] {
            if let Some(layer) = read_json_layer(&path)? {
                merge_json_layer(&mut config, &layer, source, &mut issues);
            }
        }

        apply_env_overrides(&mut config, env_vars, &mut issues);
        validate(&config, &mut issues);

        Ok((config, issues))
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = Config::project_config_path(root);
        let json = serde_json::to_string_pretty(self)?;
        crate::fsutil::write_file_atomic(&path, json.as_bytes())
    }
}

fn read_json_layer(path: &Path) -> Result<Option<serde_json::Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(None);
    }
    let value: serde_json::Value = serde_json::from_str(&content)
        .map_err(|e| OrchError::Config(format!("{}: {e}", path.display())))?;
    Ok(Some(value))
}

/// Merge a JSON layer onto `config` by re-parsing `config` to JSON,
/// shallow-merging `layer` into it, then deserializing back. A layer that
/// fails to deserialize as a whole is recorded as an issue and skipped
/// rather than aborting the whole load, matching §7's "hot-reload errors
/// are logged and the previous valid config is retained" policy extended
/// to static layering.
fn merge_json_layer(
    config: &mut Config,
    layer: &serde_json::Value,
    source: &'static str,
    issues: &mut Vec<ConfigIssue>,
) {
    let mut base = match serde_json::to_value(&*config) {
        Ok(v) => v,
        Err(e) => {
            issues.push(ConfigIssue {
                source,
                detail: e.to_string(),
            });
            return;
        }
    };
    json_merge(&mut base, layer);
    match serde_json::from_value::<Config>(base) {
        Ok(merged) => *config = merged,
        Err(e) => issues.push(ConfigIssue {
            source,
            detail: e.to_string(),
        }),
    }
}

fn json_merge(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (k, v) in overlay_map {
                json_merge(base_map.entry(k.clone()).or_insert(serde_json::Value::Null), v);
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

fn apply_env_overrides(
    config: &mut Config,
    env_vars: &HashMap<String, String>,
    issues: &mut Vec<ConfigIssue>,
) {
    let mut get = |key: &str| env_vars.get(key).map(|s| s.as_str());

    if let Some(v) = get("ORCH_MAX_AGENTS") {
        match v.parse::<usize>() {
            Ok(n) if n >= 1 => config.max_agents = n,
            _ => issues.push(issue("ORCH_MAX_AGENTS", v)),
        }
    }
    if let Some(v) = get("ORCH_LOG_LEVEL") {
        if matches!(v, "debug" | "info" | "warn" | "error") {
            config.log_level = v.to_string();
        } else {
            issues.push(issue("ORCH_LOG_LEVEL", v));
        }
    }
    if let Some(v) = get("ORCH_AGENT_MODEL") {
        config.agent_model = v.to_string();
    }
    if let Some(v) = get("ORCH_PLAN_FILE") {
        config.plan_file = v.to_string();
    }
    if let Some(v) = get("ORCH_AUTOMATION_TICKET_PROGRESSION") {
        match v.parse::<AutomationMode>() {
            Ok(_) => config.automation.ticket_progression = v.to_string(),
            Err(_) => issues.push(issue("ORCH_AUTOMATION_TICKET_PROGRESSION", v)),
        }
    }
    if let Some(v) = get("ORCH_AUTOMATION_REVIEW_MODE") {
        match v.parse::<AutomationMode>() {
            Ok(_) => config.automation.review.mode = v.to_string(),
            Err(_) => issues.push(issue("ORCH_AUTOMATION_REVIEW_MODE", v)),
        }
    }
    if let Some(v) = get("ORCH_AUTOMATION_QA_MODE") {
        match v.parse::<AutomationMode>() {
            Ok(_) => config.automation.qa.mode = v.to_string(),
            Err(_) => issues.push(issue("ORCH_AUTOMATION_QA_MODE", v)),
        }
    }
    if let Some(v) = get("ORCH_COST_LIMIT_PER_TICKET") {
        match v.parse::<f64>() {
            Ok(n) => config.cost_limit.per_ticket = Some(n),
            Err(_) => issues.push(issue("ORCH_COST_LIMIT_PER_TICKET", v)),
        }
    }
    if let Some(v) = get("ORCH_COST_LIMIT_PER_SESSION") {
        match v.parse::<f64>() {
            Ok(n) => config.cost_limit.per_session = Some(n),
            Err(_) => issues.push(issue("ORCH_COST_LIMIT_PER_SESSION", v)),
        }
    }
    if let Some(v) = get("ORCH_COST_LIMIT_ACTION") {
        match v.parse::<CostLimitAction>() {
            Ok(_) => config.cost_limit.action = v.to_string(),
            Err(_) => issues.push(issue("ORCH_COST_LIMIT_ACTION", v)),
        }
    }
}

fn issue(key: &'static str, value: &str) -> ConfigIssue {
    ConfigIssue {
        source: key,
        detail: format!("invalid value '{value}'"),
    }
}

fn validate(config: &Config, issues: &mut Vec<ConfigIssue>) {
    if config.max_agents < 1 {
        issues.push(ConfigIssue {
            source: "maxAgents",
            detail: "must be >= 1".to_string(),
        });
    }
    if config.automation.ticket_progression.parse::<AutomationMode>().is_err() {
        issues.push(ConfigIssue {
            source: "automation.ticketProgression",
            detail: format!("invalid value '{}'", config.automation.ticket_progression),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn empty_env() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn defaults_match_spec_table() {
        let config = Config::default();
        assert_eq!(config.max_agents, 5);
        assert_eq!(config.agent_model, "sonnet");
        assert_eq!(config.plan_file, "PLAN.md");
        assert_eq!(config.error_recovery.malformed_output_is_failure, false);
        assert_eq!(config.token_rates.input_per_million, 3.00);
        assert_eq!(config.token_rates.output_per_million, 15.00);
        assert_eq!(config.validation.default_timeout_seconds, 300);
    }

    #[test]
    fn project_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            Config::project_config_path(dir.path()),
            r#"{"maxAgents": 3}"#,
        )
        .unwrap();

        let (config, issues) = Config::load_with_details(dir.path(), &empty_env()).unwrap();
        assert!(issues.is_empty());
        assert_eq!(config.max_agents, 3);
    }

    #[test]
    fn env_overrides_file_overrides_defaults() {
        // SPEC_FULL §8 seed scenario 7: default 5, file -> 3, env -> 8.
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            Config::project_config_path(dir.path()),
            r#"{"maxAgents": 3}"#,
        )
        .unwrap();

        let mut env = empty_env();
        env.insert("ORCH_MAX_AGENTS".to_string(), "8".to_string());

        let (config, issues) = Config::load_with_details(dir.path(), &env).unwrap();
        assert!(issues.is_empty());
        assert_eq!(config.max_agents, 8);
    }

    #[test]
    fn invalid_env_value_is_ignored_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = empty_env();
        env.insert("ORCH_MAX_AGENTS".to_string(), "not-a-number".to_string());

        let (config, issues) = Config::load_with_details(dir.path(), &env).unwrap();
        assert_eq!(config.max_agents, 5);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].source, "ORCH_MAX_AGENTS");
    }

    #[test]
    fn orchrc_outranks_project_config_but_not_env() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            Config::project_config_path(dir.path()),
            r#"{"maxAgents": 3, "agentModel": "haiku"}"#,
        )
        .unwrap();
        fs::write(Config::orchrc_path(dir.path()), r#"{"maxAgents": 4}"#).unwrap();

        let (config, _) = Config::load_with_details(dir.path(), &empty_env()).unwrap();
        assert_eq!(config.max_agents, 4);
        assert_eq!(config.agent_model, "haiku");
    }
}
