use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;

use crate::config::EvaluationError;
use crate::script::{Script, ScriptEngine, ScriptEnv};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewerSource {
    /// Eligible approvers of the code owner approval rules.
    #[default]
    Codeowners,
    /// Members of the owning group in the Backstage catalog.
    Backstage,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewerMode {
    #[default]
    Random,
    Linear,
}

fn default_reviewer_limit() -> usize {
    1
}

/// One operation of an action's `then` list, discriminated by its `action` key.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    AddLabel {
        #[serde(alias = "name")]
        label: String,
    },
    RemoveLabel {
        #[serde(alias = "name")]
        label: String,
    },
    Close,
    Reopen,
    LockDiscussion,
    UnlockDiscussion,
    Approve,
    Unapprove,
    Comment {
        message: String,
    },
    /// Maps a literal substring of the description to a script producing its replacement.
    UpdateDescription {
        replace: BTreeMap<String, Script>,
    },
    AssignReviewers {
        #[serde(default)]
        source: ReviewerSource,
        #[serde(default = "default_reviewer_limit")]
        limit: usize,
        #[serde(default)]
        mode: ReviewerMode,
    },
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::AddLabel { .. } => "add_label",
            Step::RemoveLabel { .. } => "remove_label",
            Step::Close => "close",
            Step::Reopen => "reopen",
            Step::LockDiscussion => "lock_discussion",
            Step::UnlockDiscussion => "unlock_discussion",
            Step::Approve => "approve",
            Step::Unapprove => "unapprove",
            Step::Comment { .. } => "comment",
            Step::UpdateDescription { .. } => "update_description",
            Step::AssignReviewers { .. } => "assign_reviewers",
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Step::AddLabel { label } | Step::RemoveLabel { label } if label.is_empty() => {
                Err("step field 'label' must not be an empty string".to_string())
            }
            Step::Comment { message } if message.is_empty() => {
                Err("step field 'message' must not be an empty string".to_string())
            }
            Step::UpdateDescription { replace } if replace.is_empty() => {
                Err("step field 'replace' must contain at least one replacement".to_string())
            }
            Step::AssignReviewers { limit: 0, .. } => {
                Err("step field 'limit' must be at least 1".to_string())
            }
            _ => Ok(()),
        }
    }
}

#[derive(Deserialize)]
struct RawAction {
    #[serde(default)]
    name: String,
    #[serde(default)]
    group: Option<String>,
    #[serde(default, rename = "if")]
    condition: Script,
    #[serde(default)]
    then: Vec<serde_yaml::Value>,
}

/// One entry of the `actions` list.
#[derive(Clone, Debug, Deserialize)]
#[serde(try_from = "RawAction")]
pub struct Action {
    /// Only used for diagnostics.
    pub name: String,
    /// Of all matching actions sharing a group, only the first one is executed.
    pub group: Option<String>,
    pub condition: Script,
    pub steps: Vec<Step>,
}

impl TryFrom<RawAction> for Action {
    type Error = String;

    fn try_from(raw: RawAction) -> Result<Self, Self::Error> {
        if raw.condition.is_empty() {
            return Err(format!("action: {}; required 'if' field is empty", raw.name));
        }

        let steps = raw
            .then
            .into_iter()
            .enumerate()
            .map(|(index, value)| -> Result<Step, String> {
                let step: Step = serde_yaml::from_value(value).map_err(|error| {
                    format!("action: {}; step #{}: {error}", raw.name, index + 1)
                })?;
                step.validate().map_err(|error| {
                    format!("action: {}; step #{}: {error}", raw.name, index + 1)
                })?;
                Ok(step)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: raw.name,
            group: raw.group.filter(|group| !group.is_empty()),
            condition: raw.condition,
            steps,
        })
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(transparent)]
pub struct Actions(Vec<Action>);

impl Actions {
    pub fn iter(&self) -> impl Iterator<Item = &Action> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn extend(&mut self, other: Actions) {
        self.0.extend(other.0);
    }

    /// Runs the `if` script of every action and returns the matching ones in document order.
    /// Steps are not evaluated.
    pub fn evaluate(
        &self,
        engine: &ScriptEngine,
        env: &ScriptEnv,
    ) -> Result<Vec<&Action>, EvaluationError> {
        let mut matched = Vec::new();
        for action in &self.0 {
            let span = tracing::debug_span!("action", name = action.name.as_str());
            let _enter = span.enter();

            let result = engine
                .run_bool(&action.condition, env)
                .map_err(|source| EvaluationError::Action {
                    action: action.name.clone(),
                    source,
                })?;
            if result {
                tracing::debug!("Action matched");
                matched.push(action);
            } else {
                tracing::debug!("Action did not match");
            }
        }
        Ok(matched)
    }
}

impl From<Vec<Action>> for Actions {
    fn from(actions: Vec<Action>) -> Self {
        Self(actions)
    }
}

/// Keeps only the first action of every group. Actions without a group are always kept.
pub fn first_per_group<'a>(actions: Vec<&'a Action>) -> Vec<&'a Action> {
    let mut seen = HashSet::new();
    actions
        .into_iter()
        .filter(|action| match &action.group {
            Some(group) => {
                let first = seen.insert(group.clone());
                if !first {
                    tracing::debug!(
                        "Skipping action {} since group {group} already has a matching action",
                        action.name
                    );
                }
                first
            }
            None => true,
        })
        .collect()
}
