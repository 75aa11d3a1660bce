//! The rule document: labels, actions, ignore lists and includes.
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::script::{ScriptEngine, ScriptEnv, ScriptError};

pub mod action;
pub mod colors;
pub mod ignore;
pub mod include;
pub mod label;

pub use action::{first_per_group, Action, Actions, ReviewerMode, ReviewerSource, Step};
pub use ignore::IgnoreActivityFrom;
pub use include::Include;
pub use label::{EvaluationResult, LabelRule, Labels, Strategy};

pub const DEFAULT_CONFIG_FILE: &str = ".scm-engine.yml";

/// Locations probed, in order, when the configured file does not exist locally.
pub const STANDARD_LOCATIONS: &[&str] = &[
    ".scm-engine.yml",
    ".gitlab/scm-engine.yml",
    ".github/scm-engine.yml",
];

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not find a configuration file at {0} or any of the standard locations")]
    NotFound(String),
    #[error("include: {0}")]
    Include(String),
}

/// Failures while evaluating the rules against one merge request.
#[derive(thiserror::Error, Debug)]
pub enum EvaluationError {
    #[error("label: {rule}; {source}")]
    Label { rule: String, source: ScriptError },
    #[error("action: {action}; {source}")]
    Action { action: String, source: ScriptError },
    #[error("A label was generated with an empty name, please check your configuration")]
    EmptyName,
    #[error(
        "The label {0:?} was generated multiple times, please check your configuration. Hint: use the uniq() function to remove duplicates from generated labels"
    )]
    DuplicateName(String),
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    /// Overrides the process-wide dry run setting when present.
    #[serde(default)]
    pub dry_run: Option<bool>,
    #[serde(default, rename = "include")]
    pub includes: Vec<Include>,
    #[serde(default)]
    pub ignore_activity_from: IgnoreActivityFrom,
    #[serde(default)]
    pub actions: Actions,
    #[serde(default, rename = "label")]
    pub labels: Labels,
}

impl Config {
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Loads `path`, or the first existing standard location if `path` does not exist.
    pub fn load_local(path: &str) -> Result<(PathBuf, Self), ConfigError> {
        let candidates = std::iter::once(path).chain(STANDARD_LOCATIONS.iter().copied());
        for candidate in candidates {
            let candidate = Path::new(candidate);
            if candidate.is_file() {
                tracing::debug!("Loading configuration from {}", candidate.display());
                return Ok((candidate.to_path_buf(), Self::load_file(candidate)?));
            }
        }
        Err(ConfigError::NotFound(path.to_string()))
    }

    /// Evaluates labels, then actions. Of the matched actions only the first per group is
    /// returned.
    pub fn evaluate(
        &self,
        engine: &ScriptEngine,
        env: &ScriptEnv,
    ) -> Result<(Vec<EvaluationResult>, Vec<&Action>), EvaluationError> {
        tracing::info!("Evaluating labels");
        let labels = self.labels.evaluate(engine, env)?;

        tracing::info!("Evaluating actions");
        let actions = first_per_group(self.actions.evaluate(engine, env)?);

        Ok((labels, actions))
    }

    /// Compiles every script of the document. Returns one message per failing script.
    pub fn lint(&self, engine: &ScriptEngine) -> Vec<String> {
        let mut problems = Vec::new();
        for (index, rule) in self.labels.iter().enumerate() {
            let name = if rule.name.is_empty() {
                format!("#{}", index + 1)
            } else {
                rule.name.clone()
            };
            if let Err(error) = engine.compile(&rule.script) {
                problems.push(format!("label: {name}; script: {error}"));
            }
            if let Some(skip_if) = &rule.skip_if {
                if let Err(error) = engine.compile(skip_if) {
                    problems.push(format!("label: {name}; skip_if: {error}"));
                }
            }
        }
        for action in self.actions.iter() {
            if let Err(error) = engine.compile(&action.condition) {
                problems.push(format!("action: {}; if: {error}", action.name));
            }
            for step in &action.steps {
                if let Step::UpdateDescription { replace } = step {
                    for (key, script) in replace {
                        if let Err(error) = engine.compile(script) {
                            problems.push(format!(
                                "action: {}; update_description[{key:?}]: {error}",
                                action.name
                            ));
                        }
                    }
                }
            }
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::tests::fixtures::{eval_context, MergeRequestBuilder};

    #[test]
    fn empty_document() {
        let config = Config::parse("").unwrap();
        assert!(config.labels.is_empty());
        assert!(config.actions.is_empty());
        assert_eq!(config.dry_run, None);
    }

    #[test]
    fn full_document() {
        let config = Config::parse(
            r##"
dry_run: true
ignore_activity_from:
  bots: true
  usernames: [renovate]
  emails: [ci@example.com]
include:
  - project: org/shared
    ref: main
    files: [labels.yml]
label:
  - name: bug
    color: "#ff0000"
    priority: 10
    script: "true"
actions:
  - name: close
    group: lifecycle
    if: "false"
    then:
      - action: close
"##,
        )
        .unwrap();
        assert_eq!(config.dry_run, Some(true));
        assert!(config.ignore_activity_from.bots);
        assert_eq!(config.ignore_activity_from.usernames, vec!["renovate"]);
        assert_eq!(config.includes[0].git_ref.as_deref(), Some("main"));
        let label = config.labels.iter().next().unwrap();
        assert_eq!(label.priority, Some(10));
        assert_eq!(label.color, "#ff0000");
        let action = config.actions.iter().next().unwrap();
        assert_eq!(action.group.as_deref(), Some("lifecycle"));
    }

    #[test]
    fn invalid_yaml() {
        assert!(matches!(
            Config::parse("label: {"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn evaluate_applies_group_filter() {
        let config = Config::parse(
            r#"
label:
  - name: bug
    script: "true"
actions:
  - name: a
    group: g
    if: "true"
  - name: b
    group: g
    if: "true"
"#,
        )
        .unwrap();
        let mr = MergeRequestBuilder::default().build().unwrap();
        let env = ScriptEnv::new(Arc::new(eval_context(mr)));
        let (labels, actions) = config.evaluate(&ScriptEngine::new(), &env).unwrap();
        assert_eq!(labels.len(), 1);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].name, "a");
    }

    #[test]
    fn lint_reports_compile_errors() {
        let config = Config::parse(
            r#"
label:
  - name: broken
    script: "merge_request.("
actions:
  - name: fine
    if: "true"
    then:
      - action: update_description
        replace:
          "x": "(("
"#,
        )
        .unwrap();
        let problems = config.lint(&ScriptEngine::new());
        assert_eq!(problems.len(), 2);
        assert!(problems[0].starts_with("label: broken; script:"));
        assert!(problems[1].starts_with("action: fine; update_description[\"x\"]:"));
    }

    #[test]
    fn load_local_missing() {
        let result = Config::load_local("/definitely/not/here.yml");
        // The working directory of the test run may contain a config at a standard location.
        if let Err(error) = result {
            assert!(matches!(error, ConfigError::NotFound(_)));
        }
    }
}
