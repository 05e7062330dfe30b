//! Queue Name Resolution
//!
//! Decides which task queue a step is routed to, from the study-wide queue
//! settings and the step's own `task_queue` override.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::model::StepTemplate;

/// Queue used when tagging is disabled and a step names no queue.
pub const DEFAULT_QUEUE_NAME: &str = "merlin";

/// Default prefix for every queue of a study.
pub const DEFAULT_QUEUE_TAG: &str = "[merlin]_";

#[derive(Debug, Error, PartialEq)]
pub enum QueueError {
    #[error("step '{step}': queue override '{queue}' must not contain whitespace")]
    InvalidOverride { step: String, queue: String },
}

/// Study-wide queue settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Prefix prepended to every queue name
    #[serde(default = "default_queue_tag")]
    pub queue_tag: String,

    /// Use overrides verbatim instead of prefixing them
    #[serde(default)]
    pub omit_queue_tag: bool,
}

fn default_queue_tag() -> String {
    DEFAULT_QUEUE_TAG.to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_tag: default_queue_tag(),
            omit_queue_tag: false,
        }
    }
}

/// Resolves queue names against a fixed [`QueueConfig`].
#[derive(Debug, Clone)]
pub struct QueueResolver {
    config: QueueConfig,
}

impl QueueResolver {
    pub fn new(config: QueueConfig) -> Self {
        Self { config }
    }

    /// Resolves an override to a concrete queue name.
    ///
    /// An absent, empty or `none` (any case) override falls back to the
    /// default queue.
    ///
    /// # Example
    ///
    /// ```
    /// use steprunner::workflow::queue::{QueueConfig, QueueResolver};
    ///
    /// let resolver = QueueResolver::new(QueueConfig {
    ///     queue_tag: "q_".to_string(),
    ///     omit_queue_tag: false,
    /// });
    /// assert_eq!(resolver.resolve(None).unwrap(), "q_");
    /// assert_eq!(resolver.resolve(Some("steps")).unwrap(), "q_steps");
    /// ```
    pub fn resolve(&self, task_queue: Option<&str>) -> Result<String, QueueError> {
        self.resolve_named("", task_queue)
    }

    /// Resolves the queue for a step template.
    pub fn resolve_step(&self, step: &StepTemplate) -> Result<String, QueueError> {
        self.resolve_named(&step.name, step.run.task_queue.as_deref())
    }

    /// Sorted, de-duplicated set of queues used by `steps`.
    pub fn queues_for<'a, I>(&self, steps: I) -> Result<BTreeSet<String>, QueueError>
    where
        I: IntoIterator<Item = &'a StepTemplate>,
    {
        steps.into_iter().map(|s| self.resolve_step(s)).collect()
    }

    fn resolve_named(&self, step: &str, task_queue: Option<&str>) -> Result<String, QueueError> {
        let task_queue = task_queue
            .map(str::trim)
            .filter(|q| !q.is_empty() && !q.eq_ignore_ascii_case("none"));

        if let Some(queue) = task_queue {
            if queue.chars().any(char::is_whitespace) {
                return Err(QueueError::InvalidOverride {
                    step: step.to_string(),
                    queue: queue.to_string(),
                });
            }
        }

        let resolved = match (self.config.omit_queue_tag, task_queue) {
            (true, Some(queue)) => queue.to_string(),
            (true, None) => DEFAULT_QUEUE_NAME.to_string(),
            (false, Some(queue)) => format!("{}{}", self.config.queue_tag, queue),
            (false, None) => self.config.queue_tag.clone(),
        };
        Ok(resolved)
    }
}
