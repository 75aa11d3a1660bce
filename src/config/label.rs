use std::collections::HashSet;
use std::str::FromStr;

use serde::Deserialize;

use crate::config::{colors, EvaluationError};
use crate::scm::Label;
use crate::script::{ReturnKind, Script, ScriptEngine, ScriptEnv, ScriptError, ScriptValue};

/// Declared shape of a label rule's script output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Strategy {
    /// The script returns a boolean deciding whether the named label is present.
    #[default]
    Conditional,
    /// The script returns the list of label names to add.
    Generate,
}

impl Strategy {
    fn return_kind(self) -> ReturnKind {
        match self {
            Strategy::Conditional => ReturnKind::Bool,
            Strategy::Generate => ReturnKind::StringList,
        }
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "" | "conditional" => Ok(Strategy::Conditional),
            "generate" => Ok(Strategy::Generate),
            _ => Err(format!(
                "unknown label strategy {value:?}; use \"conditional\" or \"generate\""
            )),
        }
    }
}

#[derive(Deserialize)]
struct RawLabel {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    color: String,
    #[serde(default)]
    priority: Option<i64>,
    #[serde(default)]
    strategy: String,
    #[serde(default)]
    script: Script,
    #[serde(default)]
    skip_if: Option<Script>,
}

/// One entry of the `label` list.
#[derive(Clone, Debug, Deserialize)]
#[serde(try_from = "RawLabel")]
pub struct LabelRule {
    pub name: String,
    pub description: String,
    /// Hex colour, with palette tokens already resolved.
    pub color: String,
    pub priority: Option<i64>,
    pub strategy: Strategy,
    pub script: Script,
    pub skip_if: Option<Script>,
}

impl TryFrom<RawLabel> for LabelRule {
    type Error = String;

    fn try_from(raw: RawLabel) -> Result<Self, Self::Error> {
        let fail = |message: String| format!("label: {}; {message}", raw.name);

        if raw.script.is_empty() {
            return Err(fail("required 'script' field is empty".to_string()));
        }
        let strategy = raw.strategy.parse::<Strategy>().map_err(fail)?;
        match strategy {
            Strategy::Generate if !raw.name.is_empty() => {
                return Err(fail(
                    "'name' may only be specified when using strategy \"conditional\"".to_string(),
                ));
            }
            Strategy::Conditional if raw.name.is_empty() => {
                return Err(fail(
                    "'name' is required when using strategy \"conditional\"".to_string(),
                ));
            }
            _ => {}
        }
        let color = colors::resolve(&raw.color)
            .ok_or_else(|| fail(format!("unknown color {:?}", raw.color)))?;

        Ok(Self {
            name: raw.name,
            description: raw.description,
            color,
            priority: raw.priority,
            strategy,
            script: raw.script,
            skip_if: raw.skip_if.filter(|script| !script.is_empty()),
        })
    }
}

/// Desired state of one label after evaluation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvaluationResult {
    pub name: String,
    /// `true` if the label should be on the merge request, `false` if it should be removed.
    pub matched: bool,
    pub color: String,
    pub description: String,
    pub priority: Option<i64>,
}

impl EvaluationResult {
    /// The catalog entry this result requires.
    pub fn to_label(&self) -> Label {
        Label {
            name: self.name.clone(),
            color: self.color.clone(),
            description: self.description.clone(),
            priority: self.priority,
        }
    }
}

impl LabelRule {
    fn result(&self, name: &str, matched: bool) -> EvaluationResult {
        EvaluationResult {
            name: name.to_string(),
            matched,
            color: self.color.clone(),
            description: self.description.clone(),
            priority: self.priority,
        }
    }

    /// Runs `skip_if` and then `script`. A skipped rule yields no results.
    pub fn evaluate(
        &self,
        engine: &ScriptEngine,
        env: &ScriptEnv,
    ) -> Result<Vec<EvaluationResult>, ScriptError> {
        if let Some(skip_if) = &self.skip_if {
            if engine.run_bool(skip_if, env)? {
                tracing::debug!("Label skipped by skip_if");
                return Ok(vec![]);
            }
        }

        let expected = self.strategy.return_kind();
        match engine.run(&self.script, env, expected)? {
            ScriptValue::Bool(matched) => Ok(vec![self.result(&self.name, matched)]),
            ScriptValue::StringList(names) => Ok(names
                .iter()
                .map(|name| self.result(name, true))
                .collect()),
            ScriptValue::String(_) => Err(ScriptError::TypeMismatch {
                expected,
                actual: "string".to_string(),
            }),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(transparent)]
pub struct Labels(Vec<LabelRule>);

impl Labels {
    pub fn iter(&self) -> impl Iterator<Item = &LabelRule> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn extend(&mut self, other: Labels) {
        self.0.extend(other.0);
    }

    /// Evaluates every rule in document order and validates that the produced label names are
    /// non-empty and unique.
    pub fn evaluate(
        &self,
        engine: &ScriptEngine,
        env: &ScriptEnv,
    ) -> Result<Vec<EvaluationResult>, EvaluationError> {
        let mut results = Vec::new();
        for (index, rule) in self.0.iter().enumerate() {
            let rule_name = if rule.name.is_empty() {
                format!("#{}", index + 1)
            } else {
                rule.name.clone()
            };
            let span = tracing::debug_span!("label", name = rule_name.as_str());
            let _enter = span.enter();

            let evaluated = rule
                .evaluate(engine, env)
                .map_err(|source| EvaluationError::Label {
                    rule: rule_name.clone(),
                    source,
                })?;
            tracing::debug!("Label evaluation produced {} result(s)", evaluated.len());
            results.extend(evaluated);
        }

        let mut seen = HashSet::new();
        for result in &results {
            if result.name.is_empty() {
                return Err(EvaluationError::EmptyName);
            }
            if !seen.insert(result.name.as_str()) {
                return Err(EvaluationError::DuplicateName(result.name.clone()));
            }
        }

        Ok(results)
    }
}

impl From<Vec<LabelRule>> for Labels {
    fn from(rules: Vec<LabelRule>) -> Self {
        Self(rules)
    }
}
