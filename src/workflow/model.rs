//! Step Data Model
//!
//! Core data structures describing step templates and the parameter sets
//! that multiply them into concrete instances.
//!
//! # Example YAML Format
//!
//! ```yaml
//! parameters:
//!   X:
//!     label: X.%%
//!     values: [1, 2, 3]
//!
//! steps:
//!   - name: simulate
//!     run:
//!       cmd: ./sim --x $(X)
//!       restart: ./sim --x $(X) --resume
//!       task_queue: sim
//!       shell: /bin/bash
//!       batch:
//!         type: slurm
//!       max_retries: 3
//!       retry_delay: 5
//! ```

use std::fmt;

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default number of retries a step may consume before it is marked failed.
pub const DEFAULT_MAX_RETRIES: u32 = 30;

/// Default delay between resubmissions, in seconds.
pub const DEFAULT_RETRY_DELAY: u64 = 1;

/// Immutable description of one workflow step before parameter expansion.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepTemplate {
    /// Step name, unique within a study
    pub name: String,

    /// How the step is run
    pub run: RunConfig,
}

/// Run section of a step template.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Command text; may contain `$(NAME)` placeholders
    pub cmd: String,

    /// Command used instead of `cmd` when the step asks to be restarted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,

    /// Queue override; combined with the global queue tag at resolution time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_queue: Option<String>,

    /// Shell override for this step only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,

    /// Batch override for this step only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchConfig>,

    /// Restart/retry budget; 0 disables limit enforcement
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Seconds to wait before a resubmission
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,

    /// Set up the workspace and script without running anything
    #[serde(default)]
    pub dry_run: bool,
}

/// Step-level batch settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct BatchConfig {
    /// Scheduler type (e.g. `local`, `slurm`, `flux`)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub batch_type: Option<String>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_delay() -> u64 {
    DEFAULT_RETRY_DELAY
}

impl RunConfig {
    /// Creates a run section with the given command and default settings.
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            restart: None,
            task_queue: None,
            shell: None,
            batch: None,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            dry_run: false,
        }
    }

    /// Batch type override, if the step sets one.
    pub fn batch_type(&self) -> Option<&str> {
        self.batch.as_ref().and_then(|b| b.batch_type.as_deref())
    }
}

impl StepTemplate {
    /// Creates a new template.
    ///
    /// # Example
    ///
    /// ```
    /// use steprunner::workflow::StepTemplate;
    ///
    /// let step = StepTemplate::new("simulate", "./sim --x $(X)")
    ///     .with_restart("./sim --x $(X) --resume")
    ///     .with_task_queue("sim")
    ///     .with_max_retries(3);
    /// assert_eq!(step.run.max_retries, 3);
    /// ```
    pub fn new(name: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            run: RunConfig::new(cmd.into().trim()),
        }
    }

    /// Sets the restart command.
    pub fn with_restart(mut self, restart: impl Into<String>) -> Self {
        self.run.restart = Some(restart.into());
        self
    }

    /// Sets the task queue override.
    pub fn with_task_queue(mut self, queue: impl Into<String>) -> Self {
        self.run.task_queue = Some(queue.into());
        self
    }

    /// Sets the shell override.
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.run.shell = Some(shell.into());
        self
    }

    /// Sets the batch type override.
    pub fn with_batch_type(mut self, batch_type: impl Into<String>) -> Self {
        self.run.batch = Some(BatchConfig {
            batch_type: Some(batch_type.into()),
        });
        self
    }

    /// Sets the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.run.max_retries = max_retries;
        self
    }

    /// Sets the delay between resubmissions.
    pub fn with_retry_delay(mut self, seconds: u64) -> Self {
        self.run.retry_delay = seconds;
        self
    }

    /// Marks the step as dry-run only.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.run.dry_run = dry_run;
        self
    }

    /// Command text.
    pub fn cmd(&self) -> &str {
        &self.run.cmd
    }

    /// Restart command text, if any.
    pub fn restart_cmd(&self) -> Option<&str> {
        self.run.restart.as_deref()
    }
}

/// One named parameter: a label template and its ordered values.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    /// Name referenced as `$(NAME)` in commands
    pub name: String,
    /// Label template; `%%` is replaced by the current value
    pub label: String,
    /// Ordered values, one per expanded instance
    pub values: Vec<String>,
}

impl Parameter {
    /// Placeholder token for this parameter, e.g. `$(X)`.
    pub fn placeholder(&self) -> String {
        format!("$({})", self.name)
    }

    /// Label for the value at `index`, or `None` when out of range.
    pub fn label_for(&self, index: usize) -> Option<String> {
        self.values
            .get(index)
            .map(|value| self.label.replace("%%", value))
    }
}

/// Ordered collection of parameters.
///
/// Insertion order is preserved: it determines the order of labels in an
/// expanded step's display name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParameterSet {
    params: Vec<Parameter>,
}

impl ParameterSet {
    /// Creates an empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter, builder style.
    pub fn with_parameter<V, I>(mut self, name: &str, label: &str, values: I) -> Self
    where
        V: ToString,
        I: IntoIterator<Item = V>,
    {
        self.push(Parameter {
            name: name.to_string(),
            label: label.to_string(),
            values: values.into_iter().map(|v| v.to_string()).collect(),
        });
        self
    }

    /// Appends a parameter.
    pub fn push(&mut self, param: Parameter) {
        self.params.push(param);
    }

    /// Iterates the parameters in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    /// Looks up a parameter by name.
    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Number of parameters (not values).
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Returns true if there are no parameters.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Raw YAML shape of one parameter entry.
#[derive(Deserialize)]
struct ParameterEntry {
    #[serde(default)]
    label: Option<String>,
    #[serde(deserialize_with = "scalar_list")]
    values: Vec<String>,
}

impl<'de> Deserialize<'de> for ParameterSet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ParameterSetVisitor;

        impl<'de> Visitor<'de> for ParameterSetVisitor {
            type Value = ParameterSet;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of parameter name to {label, values}")
            }

            fn visit_unit<E: de::Error>(self) -> Result<ParameterSet, E> {
                Ok(ParameterSet::new())
            }

            fn visit_map<A>(self, mut map: A) -> Result<ParameterSet, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut set = ParameterSet::new();
                while let Some((name, entry)) = map.next_entry::<String, ParameterEntry>()? {
                    if set.get(&name).is_some() {
                        return Err(de::Error::custom(format!(
                            "parameter '{}' is defined twice",
                            name
                        )));
                    }
                    let label = entry.label.unwrap_or_else(|| format!("{}.%%", name));
                    set.push(Parameter {
                        name,
                        label,
                        values: entry.values,
                    });
                }
                Ok(set)
            }
        }

        deserializer.deserialize_any(ParameterSetVisitor)
    }
}

/// Deserializes a scalar or a list of scalars into strings.
fn scalar_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::Array(arr) => arr.into_iter().map(scalar_to_string).collect(),
        other => Ok(vec![scalar_to_string(other)?]),
    }
}

fn scalar_to_string<E: de::Error>(value: Value) -> Result<String, E> {
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(E::custom("parameter values must be scalars")),
    }
}
