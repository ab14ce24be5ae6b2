//! Configuration loading for the operation orchestration core.
//!
//! Matches the key=value format of `.v0.rc`, with an optional per-user
//! `.v0.profile.rc` overlay. Precedence: CLI flags (applied by callers) >
//! `.v0.profile.rc` > `.v0.rc` > built-in defaults.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("missing required config key: {0}")]
    MissingRequired(&'static str),
}

/// Project configuration loaded from `.v0.rc` / `.v0.profile.rc`.
///
/// Field names match the config keys one-for-one, snake_cased.
#[derive(Debug, Clone)]
pub struct Config {
    pub project: Option<String>,
    pub issue_prefix: Option<String>,
    pub develop_branch: String,
    pub workspace_mode: Option<crate::types::WorkspaceMode>,
    pub git_remote: String,
    pub feature_branch_template: String,
    pub bugfix_branch_template: String,
    pub chore_branch_template: String,
    pub merge_queue_poll_sec: u64,
    pub conflict_timeout_sec: u64,
    pub lock_max_retries: u32,
    pub events_log_max_bytes: u64,
    pub events_log_rotate_keep: u32,
    pub resolve: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project: None,
            issue_prefix: None,
            develop_branch: "main".to_string(),
            workspace_mode: None,
            git_remote: "origin".to_string(),
            feature_branch_template: "feature/{name}".to_string(),
            bugfix_branch_template: "fix/{id}".to_string(),
            chore_branch_template: "chore/{id}".to_string(),
            merge_queue_poll_sec: 30,
            conflict_timeout_sec: 300,
            lock_max_retries: 8,
            events_log_max_bytes: 1_048_576,
            events_log_rotate_keep: 5,
            resolve: true,
        }
    }
}

impl Config {
    /// Load `.v0.rc` from a project root, then overlay `.v0.profile.rc` if
    /// present.
    pub fn load(project_root: &Path) -> Result<Self, ConfigError> {
        Self::load_with_fallback_root(project_root, None)
    }

    /// Like [`Config::load`], but when `root`'s own `.v0.profile.rc` is
    /// absent, falls back to `fallback_root`'s copy before giving up on a
    /// profile overlay entirely (§8.3: a workspace checkout has no
    /// `.v0.profile.rc` of its own, so the main repository's is
    /// consulted).
    pub fn load_with_fallback_root(root: &Path, fallback_root: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let rc = root.join(".v0.rc");
        if rc.exists() {
            config.load_file(&rc)?;
        }

        let profile = root.join(".v0.profile.rc");
        if profile.exists() {
            config.load_file(&profile)?;
        } else if let Some(fallback_root) = fallback_root {
            let fallback_profile = fallback_root.join(".v0.profile.rc");
            if fallback_profile.exists() {
                config.load_file(&fallback_profile)?;
            }
        }
        Ok(config)
    }

    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        self.parse_content(&content)
    }

    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };
            let key = key.trim();
            let value = Self::unquote(value.trim());
            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "PROJECT" => self.project = Some(value.to_string()),
            "ISSUE_PREFIX" => self.issue_prefix = Some(value.to_string()),
            "V0_DEVELOP_BRANCH" => self.develop_branch = value.to_string(),
            "V0_WORKSPACE_MODE" => {
                self.workspace_mode = Some(match value {
                    "worktree" => crate::types::WorkspaceMode::Worktree,
                    "clone" => crate::types::WorkspaceMode::Clone,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "V0_WORKSPACE_MODE must be 'worktree' or 'clone', got '{value}'"
                        )))
                    }
                });
            }
            "V0_GIT_REMOTE" => self.git_remote = value.to_string(),
            "V0_FEATURE_BRANCH" => self.feature_branch_template = value.to_string(),
            "V0_BUGFIX_BRANCH" => self.bugfix_branch_template = value.to_string(),
            "V0_CHORE_BRANCH" => self.chore_branch_template = value.to_string(),
            "V0_MERGE_QUEUE_POLL_SEC" => {
                self.merge_queue_poll_sec = Self::parse_int(key, value)?;
            }
            "V0_CONFLICT_TIMEOUT_SEC" => {
                self.conflict_timeout_sec = Self::parse_int(key, value)?;
            }
            "V0_LOCK_MAX_RETRIES" => {
                self.lock_max_retries = Self::parse_int(key, value)?;
            }
            "V0_EVENTS_LOG_MAX_BYTES" => {
                self.events_log_max_bytes = Self::parse_int(key, value)?;
            }
            "V0_EVENTS_LOG_ROTATE_KEEP" => {
                self.events_log_rotate_keep = Self::parse_int(key, value)?;
            }
            "V0_RESOLVE" => self.resolve = Self::parse_bool(key, value)?,
            _ => {
                eprintln!("warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Validate the two required keys are present; call after `load`.
    pub fn require_essentials(&self) -> Result<(), ConfigError> {
        if self.project.is_none() {
            return Err(ConfigError::MissingRequired("PROJECT"));
        }
        if self.issue_prefix.is_none() {
            return Err(ConfigError::MissingRequired("ISSUE_PREFIX"));
        }
        Ok(())
    }

    /// Resolve the configured or inferred workspace mode for the
    /// configured target branch.
    pub fn effective_workspace_mode(&self) -> crate::types::WorkspaceMode {
        self.workspace_mode
            .unwrap_or_else(|| crate::types::WorkspaceMode::infer(&self.develop_branch))
    }

    /// Expand a branch template, substituting `{name}` and `{id}` with the
    /// same value.
    pub fn expand_branch_template(template: &str, value: &str) -> String {
        template.replace("{name}", value).replace("{id}", value)
    }
}
