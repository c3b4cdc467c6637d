use anyhow::{Context, Result};
use genbatch_core::Scope;
use orchestrator::{CompletionPolicy, MonitorConfig, RunOptions};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const GENBATCH_DIR: &str = ".genbatch";
pub const CONFIG_FILE: &str = "config.toml";
pub const DEFAULT_DB_NAME: &str = "genbatch.db";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenbatchConfig {
    pub scope: ScopeConfig,
    pub store: StoreConfig,
    pub generator: GeneratorConfig,
    pub run: RunConfig,
    pub monitor: MonitorSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    pub owner: String,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            owner: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Sqlite,
    Rest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: BackendKind,
    /// SQLite file, relative to the `.genbatch` directory.
    pub database: String,
    pub rest_url: String,
    /// Environment variable holding the records service key.
    pub api_key_env: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Sqlite,
            database: DEFAULT_DB_NAME.to_string(),
            rest_url: "http://localhost:54321".to_string(),
            api_key_env: "GENBATCH_STORE_KEY".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub url: String,
    /// Transport timeout; the per-task step timeout lives in `[run]`.
    pub timeout_secs: u64,
    pub api_key_env: String,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            timeout_secs: 180,
            api_key_env: "GENBATCH_GENERATOR_KEY".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub max_concurrent: usize,
    pub batch_size: usize,
    pub languages: Vec<String>,
    pub skip_completed: bool,
    pub resume_from_failure: bool,
    pub cooldown_secs: u64,
    pub step_timeout_secs: u64,
    pub require_category: bool,
    pub page_size: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        let options = RunOptions::default();
        Self {
            max_concurrent: options.max_concurrent,
            batch_size: options.batch_size,
            languages: options.languages,
            skip_completed: options.skip_completed,
            resume_from_failure: options.resume_from_failure,
            cooldown_secs: options.cooldown.as_secs(),
            step_timeout_secs: options.step_timeout.as_secs(),
            require_category: options.require_category,
            page_size: options.page_size,
        }
    }
}

impl RunConfig {
    pub fn to_options(&self) -> RunOptions {
        RunOptions {
            max_concurrent: self.max_concurrent,
            batch_size: self.batch_size,
            languages: self.languages.clone(),
            skip_completed: self.skip_completed,
            resume_from_failure: self.resume_from_failure,
            cooldown: Duration::from_secs(self.cooldown_secs),
            step_timeout: Duration::from_secs(self.step_timeout_secs),
            max_rounds: None,
            max_items: None,
            require_category: self.require_category,
            page_size: self.page_size,
        }
    }
}

/// `[monitor]` table. Launched runs take `[run]` with the overrides below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub poll_interval_secs: u64,
    pub report_interval_secs: u64,
    pub retry_delay_secs: u64,
    pub target_total: Option<u64>,
    pub completion_policy: CompletionPolicy,
    pub stale_after_secs: Option<u64>,
    pub max_launches: Option<u32>,
    pub max_concurrent: usize,
    pub cooldown_secs: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        let unattended = RunOptions::unattended();
        Self {
            poll_interval_secs: 30,
            report_interval_secs: 300,
            retry_delay_secs: 60,
            target_total: None,
            completion_policy: CompletionPolicy::CompletedOnly,
            stale_after_secs: Some(3600),
            max_launches: None,
            max_concurrent: unattended.max_concurrent,
            cooldown_secs: unattended.cooldown.as_secs(),
        }
    }
}

impl MonitorSection {
    pub fn to_config(&self, scope: Scope, run: &RunConfig) -> MonitorConfig {
        let run_options = RunOptions {
            max_concurrent: self.max_concurrent,
            cooldown: Duration::from_secs(self.cooldown_secs),
            resume_from_failure: true,
            ..run.to_options()
        };

        MonitorConfig {
            scope,
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            report_interval: Duration::from_secs(self.report_interval_secs),
            target_total: self.target_total,
            completion_policy: self.completion_policy,
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            stale_after: self.stale_after_secs.map(Duration::from_secs),
            max_launches: self.max_launches,
            run_options,
        }
    }
}

impl GenbatchConfig {
    /// Loads `<dir>/config.toml`; a missing file yields defaults.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(dir.join(CONFIG_FILE), content)?;
        Ok(())
    }

    pub fn scope(&self) -> Scope {
        Scope::new(&self.scope.owner)
    }

    pub fn database_url(&self, dir: &Path) -> String {
        format!("sqlite:{}", dir.join(&self.store.database).display())
    }
}

/// Reads the secret named by `var`, if it is set and non-empty.
pub fn secret_from_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}
