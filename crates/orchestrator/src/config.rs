use std::collections::HashSet;
use std::time::Duration;

use crate::error::{OrchestratorError, Result};

pub const DEFAULT_MAX_CONCURRENT: usize = 3;
pub const DEFAULT_BATCH_SIZE: usize = 20;
pub const DEFAULT_PAGE_SIZE: usize = 500;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5);
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(120);

/// Options for one orchestrator run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    /// Upper bound on work-step calls in flight.
    pub max_concurrent: usize,
    /// Tasks pulled per round.
    pub batch_size: usize,
    pub languages: Vec<String>,
    /// When false, completed records are reopened once at run start.
    pub skip_completed: bool,
    /// Also pick up Failed tasks left by earlier runs.
    pub resume_from_failure: bool,
    /// Pause between rounds.
    pub cooldown: Duration,
    pub step_timeout: Duration,
    pub max_rounds: Option<u32>,
    pub max_items: Option<usize>,
    /// Only enumerate subjects that carry a category.
    pub require_category: bool,
    /// Descriptors fetched per enumeration page.
    pub page_size: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            batch_size: DEFAULT_BATCH_SIZE,
            languages: vec!["en".to_string()],
            skip_completed: true,
            resume_from_failure: false,
            cooldown: DEFAULT_COOLDOWN,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            max_rounds: None,
            max_items: None,
            require_category: true,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl RunOptions {
    /// Conservative profile for runs launched by the monitor.
    pub fn unattended() -> Self {
        Self {
            max_concurrent: 2,
            resume_from_failure: true,
            cooldown: Duration::from_secs(15),
            ..Self::default()
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_languages<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.languages = languages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_skip_completed(mut self, skip: bool) -> Self {
        self.skip_completed = skip;
        self
    }

    pub fn with_resume_from_failure(mut self, resume: bool) -> Self {
        self.resume_from_failure = resume;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = Some(rounds);
        self
    }

    pub fn with_max_items(mut self, items: usize) -> Self {
        self.max_items = Some(items);
        self
    }

    pub fn with_require_category(mut self, required: bool) -> Self {
        self.require_category = required;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(OrchestratorError::invalid_config(
                "max_concurrent must be at least 1",
            ));
        }
        if self.batch_size == 0 {
            return Err(OrchestratorError::invalid_config(
                "batch_size must be at least 1",
            ));
        }
        if self.page_size == 0 {
            return Err(OrchestratorError::invalid_config(
                "page_size must be at least 1",
            ));
        }
        if self.step_timeout.is_zero() {
            return Err(OrchestratorError::invalid_config(
                "step_timeout must be positive",
            ));
        }
        if self.languages.is_empty() {
            return Err(OrchestratorError::invalid_config(
                "at least one language is required",
            ));
        }

        let mut seen = HashSet::new();
        for language in &self.languages {
            if language.trim().is_empty() {
                return Err(OrchestratorError::invalid_config("language codes must not be blank"));
            }
            if !seen.insert(language.as_str()) {
                return Err(OrchestratorError::invalid_config(format!(
                    "language '{}' listed twice",
                    language
                )));
            }
        }
        Ok(())
    }
}
