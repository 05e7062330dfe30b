//! Parameter Expansion
//!
//! Multiplies one step template against a [`ParameterSet`]:
//! - Detects `$(NAME)` placeholders in the command and restart command
//! - Checks that every parameter has the same number of values
//! - Generates one [`StepInstance`] per value index

use std::collections::HashSet;
use std::path::Path;

use log::{debug, info};
use thiserror::Error;

use crate::execution::instance::StepInstance;
use crate::workflow::model::{ParameterSet, StepTemplate};

/// Reserved tokens that always mark a command as sample-dependent.
pub const SAMPLE_KEYWORDS: &[&str] = &[
    "MERLIN_SAMPLE_ID",
    "MERLIN_SAMPLE_PATH",
    "merlin_sample_id",
    "merlin_sample_path",
];

/// Configuration errors found while expanding a template.
#[derive(Debug, Error, PartialEq)]
pub enum ExpansionError {
    #[error("parameter '{param}' has {found} values, expected {expected}")]
    UnequalLengths {
        param: String,
        expected: usize,
        found: usize,
    },

    #[error("parameter '{0}' has no values")]
    EmptyValues(String),

    #[error("parameter name must not be empty")]
    EmptyName,

    #[error("parameter '{0}' is defined more than once")]
    DuplicateParameter(String),

    #[error("step '{step}': expansion produces '{name}' more than once")]
    DuplicateInstance { step: String, name: String },

    #[error("step '{step}': instance name '{name}' must not contain whitespace")]
    WhitespaceInName { step: String, name: String },
}

/// Result of asking a template to expand.
#[derive(Debug)]
pub enum Expansion {
    /// The template references no parameters; run it as-is.
    NotNeeded,
    /// One instance per parameter value index.
    Expanded(Vec<StepInstance>),
}

/// Formats `name` as a command placeholder, `$(name)`.
pub fn placeholder(name: &str) -> String {
    format!("$({})", name)
}

/// True if `text` contains the placeholder of any token.
pub fn references_any(text: &str, tokens: &[&str]) -> bool {
    tokens.iter().any(|token| text.contains(&placeholder(token)))
}

/// Checks a parameter set and returns its common value count.
pub fn validate_parameters(params: &ParameterSet) -> Result<usize, ExpansionError> {
    let mut seen = HashSet::new();
    let mut expected = None;

    for param in params.iter() {
        if param.name.trim().is_empty() {
            return Err(ExpansionError::EmptyName);
        }
        if !seen.insert(param.name.as_str()) {
            return Err(ExpansionError::DuplicateParameter(param.name.clone()));
        }
        if param.values.is_empty() {
            return Err(ExpansionError::EmptyValues(param.name.clone()));
        }

        match expected {
            None => expected = Some(param.values.len()),
            Some(n) if n != param.values.len() => {
                return Err(ExpansionError::UnequalLengths {
                    param: param.name.clone(),
                    expected: n,
                    found: param.values.len(),
                });
            }
            Some(_) => {}
        }
    }

    Ok(expected.unwrap_or(0))
}

/// True if the template references a parameter or a reserved sample token,
/// in either its command or its restart command.
pub fn needs_expansion(template: &StepTemplate, params: &ParameterSet) -> bool {
    let tokens: Vec<&str> = params
        .iter()
        .map(|p| p.name.as_str())
        .chain(SAMPLE_KEYWORDS.iter().copied())
        .collect();

    references_any(template.cmd(), &tokens)
        || template
            .restart_cmd()
            .is_some_and(|restart| references_any(restart, &tokens))
}

/// Expands a template into one instance per parameter value.
///
/// Instance `i` gets every `$(NAME)` replaced by `values[i]` and is named
/// `<template>_<label>.<label>...`, each label being the parameter's label
/// template with `%%` replaced by the value. Workspaces are laid out as
/// `<workspace_root>/<template>/<labels>`.
///
/// Nothing is returned unless the whole set expands cleanly.
///
/// # Example
///
/// ```
/// use steprunner::workflow::parameters::{expand_parameters, Expansion};
/// use steprunner::workflow::{ParameterSet, StepTemplate};
/// use std::path::Path;
///
/// let step = StepTemplate::new("sim", "./sim $(X)");
/// let params = ParameterSet::new().with_parameter("X", "X.%%", [1, 2]);
///
/// match expand_parameters(&step, &params, Path::new("study")).unwrap() {
///     Expansion::Expanded(instances) => {
///         assert_eq!(instances[1].name(), "sim_X.2");
///         assert_eq!(instances[1].cmd(), "./sim 2");
///     }
///     Expansion::NotNeeded => unreachable!(),
/// }
/// ```
pub fn expand_parameters(
    template: &StepTemplate,
    params: &ParameterSet,
    workspace_root: &Path,
) -> Result<Expansion, ExpansionError> {
    if params.is_empty() || !needs_expansion(template, params) {
        debug!("Step '{}' needs no parameter expansion", template.name);
        return Ok(Expansion::NotNeeded);
    }

    let count = validate_parameters(params)?;
    let seed = format!("{}_", template.name);
    let mut names = HashSet::new();
    let mut instances = Vec::with_capacity(count);

    for index in 0..count {
        let mut cmd = template.cmd().to_string();
        let mut restart = template.restart_cmd().map(str::to_string);
        let mut labels = Vec::new();

        for param in params.iter() {
            let value = &param.values[index];
            let token = param.placeholder();

            cmd = cmd.replace(&token, value);
            restart = restart.map(|r| r.replace(&token, value));

            let label = param.label.replace("%%", value);
            if !label.is_empty() {
                labels.push(label);
            }
        }

        let combined = labels.join(".");
        let name = format!("{}{}", seed, combined);
        check_instance_name(&template.name, &name)?;
        if !names.insert(name.clone()) {
            return Err(ExpansionError::DuplicateInstance {
                step: template.name.clone(),
                name,
            });
        }

        let workspace = workspace_root.join(&template.name).join(&combined);
        debug!("  Created instance '{}' with cmd={:?}", name, cmd);

        instances.push(
            StepInstance::expanded(template, name, cmd, restart, index, workspace)
                .with_study_root(workspace_root),
        );
    }

    info!(
        "Expanded step '{}' into {} instances",
        template.name,
        instances.len()
    );
    Ok(Expansion::Expanded(instances))
}

/// Expands a template, or passes it through as a single instance.
pub fn instances_for(
    template: &StepTemplate,
    params: &ParameterSet,
    workspace_root: &Path,
) -> Result<Vec<StepInstance>, ExpansionError> {
    match expand_parameters(template, params, workspace_root)? {
        Expansion::Expanded(instances) => Ok(instances),
        Expansion::NotNeeded => {
            check_instance_name(&template.name, &template.name)?;
            Ok(vec![StepInstance::from_template(
            template,
            workspace_root.join(&template.name),
        )
        .with_study_root(workspace_root)])
        }
    }
}

/// Instance names are a single field of the status line.
fn check_instance_name(step: &str, name: &str) -> Result<(), ExpansionError> {
    if name.chars().any(char::is_whitespace) {
        return Err(ExpansionError::WhitespaceInName {
            step: step.to_string(),
            name: name.to_string(),
        });
    }
    Ok(())
}
