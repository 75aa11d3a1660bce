//! Embedded scripting used by label rules and action predicates.
//!
//! Scripts are written in [rhai](https://rhai.rs). Each script is compiled at most once per
//! [`Script`] instance and its result is converted into a [`ScriptValue`] right after execution.
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use rhai::{Dynamic, Engine, Scope, AST};

use crate::scm::EvalContext;

mod stdlib;

#[derive(thiserror::Error, Debug)]
pub enum ScriptError {
    #[error("failed to compile script: {0}")]
    Compile(String),
    #[error("script failed: {0}")]
    Runtime(String),
    #[error("script returned {actual}, expected {expected}")]
    TypeMismatch { expected: ReturnKind, actual: String },
}

/// The shape a script must evaluate to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnKind {
    Bool,
    StringList,
    String,
}

impl Display for ReturnKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ReturnKind::Bool => f.write_str("a boolean"),
            ReturnKind::StringList => f.write_str("a list of strings"),
            ReturnKind::String => f.write_str("a string"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptValue {
    Bool(bool),
    StringList(Vec<String>),
    String(String),
}

impl ScriptValue {
    fn from_dynamic(value: Dynamic, expected: ReturnKind) -> Result<Self, ScriptError> {
        let mismatch = |value: &Dynamic| ScriptError::TypeMismatch {
            expected,
            actual: value.type_name().to_string(),
        };

        match expected {
            ReturnKind::Bool => value
                .as_bool()
                .map(ScriptValue::Bool)
                .map_err(|_| mismatch(&value)),
            ReturnKind::String => {
                if !value.is_string() {
                    return Err(mismatch(&value));
                }
                value
                    .into_string()
                    .map(ScriptValue::String)
                    .map_err(|actual| ScriptError::TypeMismatch {
                        expected,
                        actual: actual.to_string(),
                    })
            }
            ReturnKind::StringList => {
                if !value.is_array() {
                    return Err(mismatch(&value));
                }
                let items = value.into_array().map_err(|actual| ScriptError::TypeMismatch {
                    expected,
                    actual: actual.to_string(),
                })?;
                items
                    .into_iter()
                    .map(|item| {
                        item.into_string()
                            .map_err(|actual| ScriptError::TypeMismatch {
                                expected,
                                actual: format!("an array containing {actual}"),
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map(ScriptValue::StringList)
            }
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScriptValue::Bool(value) => Some(*value),
            _ => None,
        }
    }
}

/// Script source text together with its compiled form.
#[derive(Clone, Debug, Default, serde::Deserialize)]
#[serde(from = "String")]
pub struct Script {
    source: String,
    compiled: OnceLock<AST>,
}

impl Script {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            compiled: OnceLock::new(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_empty(&self) -> bool {
        self.source.trim().is_empty()
    }
}

impl From<String> for Script {
    fn from(source: String) -> Self {
        Self::new(source)
    }
}

impl PartialEq for Script {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

/// Variables visible to scripts while evaluating one merge request.
pub struct ScriptEnv {
    scope: Scope<'static>,
}

impl ScriptEnv {
    pub fn new(ctx: Arc<EvalContext>) -> Self {
        Self::at(ctx, Utc::now())
    }

    /// Builds the environment with a fixed "now", used by the time-relative predicates.
    pub fn at(ctx: Arc<EvalContext>, now: DateTime<Utc>) -> Self {
        let mut scope = Scope::new();

        let webhook_event = ctx
            .webhook_event()
            .and_then(|event| rhai::serde::to_dynamic(event).ok())
            .unwrap_or(Dynamic::UNIT);
        let group = if ctx.group.is_some() {
            Dynamic::from(stdlib::GroupView::new(ctx.clone()))
        } else {
            Dynamic::UNIT
        };

        scope.push_constant("merge_request", stdlib::MergeRequestView::new(ctx.clone(), now));
        scope.push_constant("project", stdlib::ProjectView::new(ctx.clone()));
        scope.push_constant_dynamic("group", group);
        scope.push_constant("current_user", stdlib::UserView::new(ctx.current_user.clone()));
        scope.push_constant_dynamic("webhook_event", webhook_event);

        Self { scope }
    }
}

/// Compiles and runs scripts.
pub struct ScriptEngine {
    engine: Engine,
    executions: AtomicU64,
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptEngine {
    pub fn new() -> Self {
        let mut engine = Engine::new();
        engine.on_print(|text| tracing::info!("script: {text}"));
        engine.on_debug(|text, source, position| {
            tracing::debug!("script debug ({source:?} @ {position}): {text}");
        });
        stdlib::register(&mut engine);

        Self {
            engine,
            executions: AtomicU64::new(0),
        }
    }

    /// Returns the compiled form of `script`, compiling it on first use.
    pub fn compile<'a>(&self, script: &'a Script) -> Result<&'a AST, ScriptError> {
        if let Some(ast) = script.compiled.get() {
            return Ok(ast);
        }
        let ast = self
            .engine
            .compile(&script.source)
            .map_err(|error| ScriptError::Compile(error.to_string()))?;
        Ok(script.compiled.get_or_init(|| ast))
    }

    pub fn run(
        &self,
        script: &Script,
        env: &ScriptEnv,
        expected: ReturnKind,
    ) -> Result<ScriptValue, ScriptError> {
        let ast = self.compile(script)?;
        let mut scope = env.scope.clone();

        self.executions.fetch_add(1, Ordering::Relaxed);
        let value = self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, ast)
            .map_err(|error| ScriptError::Runtime(error.to_string()))?;

        ScriptValue::from_dynamic(value, expected)
    }

    pub fn run_bool(&self, script: &Script, env: &ScriptEnv) -> Result<bool, ScriptError> {
        match self.run(script, env, ReturnKind::Bool)? {
            ScriptValue::Bool(value) => Ok(value),
            other => Err(ScriptError::TypeMismatch {
                expected: ReturnKind::Bool,
                actual: format!("{other:?}"),
            }),
        }
    }

    /// Number of script executions performed by this engine.
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }
}
