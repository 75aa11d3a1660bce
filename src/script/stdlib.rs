use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rhai::{Array, Dynamic, Engine, EvalAltResult};

use crate::scm::{Actor, EvalContext};
use crate::utils::duration::parse_duration;

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

#[derive(Clone)]
pub struct MergeRequestView {
    ctx: Arc<EvalContext>,
    now: DateTime<Utc>,
}

impl MergeRequestView {
    pub fn new(ctx: Arc<EvalContext>, now: DateTime<Utc>) -> Self {
        Self { ctx, now }
    }
}

#[derive(Clone)]
pub struct ProjectView(Arc<EvalContext>);

impl ProjectView {
    pub fn new(ctx: Arc<EvalContext>) -> Self {
        Self(ctx)
    }
}

#[derive(Clone)]
pub struct GroupView(Arc<EvalContext>);

impl GroupView {
    pub fn new(ctx: Arc<EvalContext>) -> Self {
        Self(ctx)
    }
}

#[derive(Clone)]
pub struct UserView(Actor);

impl UserView {
    pub fn new(actor: Actor) -> Self {
        Self(actor)
    }
}

fn strings(values: &[String]) -> Array {
    values.iter().cloned().map(Dynamic::from).collect()
}

fn usernames(actors: &[Actor]) -> Array {
    actors
        .iter()
        .map(|actor| Dynamic::from(actor.username.clone()))
        .collect()
}

fn seconds(duration: Option<Duration>) -> Dynamic {
    match duration {
        Some(duration) => Dynamic::from(duration.as_secs() as rhai::INT),
        None => Dynamic::UNIT,
    }
}

fn array_to_strings(values: Array) -> ScriptResult<Vec<String>> {
    values
        .into_iter()
        .map(|value| {
            value
                .into_string()
                .map_err(|actual| format!("expected a list of strings, found {actual}").into())
        })
        .collect()
}

fn to_duration(input: &str) -> ScriptResult<Duration> {
    parse_duration(input).map_err(|error| error.to_string().into())
}

fn from_seconds(seconds: rhai::INT) -> ScriptResult<Duration> {
    u64::try_from(seconds)
        .map(Duration::from_secs)
        .map_err(|_| format!("duration must not be negative, got {seconds}").into())
}

fn duration_fn(input: &str) -> ScriptResult<rhai::INT> {
    Ok(to_duration(input)?.as_secs() as rhai::INT)
}

fn uniq(values: Array) -> Array {
    let mut items: Vec<String> = values.into_iter().map(|value| value.to_string()).collect();
    items.sort();
    items.dedup();
    items.into_iter().map(Dynamic::from).collect()
}

fn filepath_dir(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        None if path.starts_with('/') => "/".to_string(),
        None => ".".to_string(),
        Some(0) => "/".to_string(),
        Some(index) => trimmed[..index].to_string(),
    }
}

fn limit_path_depth_to(path: &str, depth: rhai::INT) -> ScriptResult<String> {
    let depth = usize::try_from(depth)
        .map_err(|_| format!("limit_path_depth_to() depth must be positive, got {depth}"))?;
    let segments: Vec<&str> = path.split('/').collect();
    if segments.len() <= depth {
        return Ok(path.to_string());
    }
    Ok(segments[..depth].join("/"))
}

impl MergeRequestView {
    fn state_is(&self, states: &[String]) -> ScriptResult<bool> {
        self.ctx
            .merge_request
            .state_is(states)
            .map_err(|error| error.to_string().into())
    }

    fn modified_files_list(&self, patterns: &[String]) -> ScriptResult<Array> {
        self.ctx
            .merge_request
            .modified_files_list(patterns)
            .map(|files| strings(&files))
            .map_err(|error| error.to_string().into())
    }

    fn modified_files(&self, patterns: &[String]) -> ScriptResult<bool> {
        Ok(!self.modified_files_list(patterns)?.is_empty())
    }

    fn has_any_activity_within(&self, within: Duration) -> bool {
        let ignore = self.ctx.ignore_activity_from();
        self.ctx
            .merge_request
            .has_any_activity_within(within, &ignore, self.now)
    }

    fn has_user_activity_within(&self, within: Duration) -> bool {
        let ignore = self.ctx.ignore_activity_from();
        self.ctx.merge_request.has_user_activity_within(
            within,
            &ignore,
            &self.ctx.current_user,
            self.now,
        )
    }
}

pub fn register(engine: &mut Engine) {
    engine
        .register_fn("duration", duration_fn)
        .register_fn("uniq", uniq)
        .register_fn("filepath_dir", filepath_dir)
        .register_fn("limit_path_depth_to", limit_path_depth_to);

    register_merge_request(engine);
    register_merge_request_methods(engine);

    engine
        .register_type_with_name::<ProjectView>("Project")
        .register_get("id", |p: &mut ProjectView| p.0.project.id.clone())
        .register_get("name", |p: &mut ProjectView| p.0.project.name.clone())
        .register_get("full_path", |p: &mut ProjectView| p.0.project.full_path.clone())
        .register_get("topics", |p: &mut ProjectView| strings(&p.0.project.topics))
        .register_get("default_branch", |p: &mut ProjectView| {
            p.0.project.default_branch.clone()
        });

    engine
        .register_type_with_name::<GroupView>("Group")
        .register_get("name", |g: &mut GroupView| {
            g.0.group.as_ref().map(|g| g.name.clone()).unwrap_or_default()
        })
        .register_get("full_path", |g: &mut GroupView| {
            g.0.group
                .as_ref()
                .map(|g| g.full_path.clone())
                .unwrap_or_default()
        });

    engine
        .register_type_with_name::<UserView>("User")
        .register_get("username", |u: &mut UserView| u.0.username.clone())
        .register_get("is_bot", |u: &mut UserView| u.0.is_bot);
}

fn register_merge_request(engine: &mut Engine) {
    engine
        .register_type_with_name::<MergeRequestView>("MergeRequest")
        .register_get("id", |mr: &mut MergeRequestView| mr.ctx.merge_request.id.clone())
        .register_get("iid", |mr: &mut MergeRequestView| {
            mr.ctx.merge_request.iid.0 as rhai::INT
        })
        .register_get("title", |mr: &mut MergeRequestView| {
            mr.ctx.merge_request.title.clone()
        })
        .register_get("description", |mr: &mut MergeRequestView| {
            mr.ctx.description().to_string()
        })
        .register_get("state", |mr: &mut MergeRequestView| {
            mr.ctx.merge_request.state.to_string()
        })
        .register_get("draft", |mr: &mut MergeRequestView| mr.ctx.merge_request.draft)
        .register_get("mergeable", |mr: &mut MergeRequestView| {
            mr.ctx.merge_request.mergeable
        })
        .register_get("has_conflicts", |mr: &mut MergeRequestView| {
            mr.ctx.merge_request.has_conflicts
        })
        .register_get("diverged_from_target_branch", |mr: &mut MergeRequestView| {
            mr.ctx.merge_request.diverged_from_target_branch
        })
        .register_get("should_be_rebased", |mr: &mut MergeRequestView| {
            mr.ctx.merge_request.should_be_rebased
        })
        .register_get("source_branch", |mr: &mut MergeRequestView| {
            mr.ctx.merge_request.source_branch.clone()
        })
        .register_get("target_branch", |mr: &mut MergeRequestView| {
            mr.ctx.merge_request.target_branch.clone()
        })
        .register_get("labels", |mr: &mut MergeRequestView| {
            strings(&mr.ctx.merge_request.labels)
        })
        .register_get("author", |mr: &mut MergeRequestView| {
            mr.ctx.merge_request.author.username.clone()
        })
        .register_get("reviewers", |mr: &mut MergeRequestView| {
            usernames(&mr.ctx.merge_request.reviewers)
        })
        .register_get("assignees", |mr: &mut MergeRequestView| {
            usernames(&mr.ctx.merge_request.assignees)
        })
        .register_get("approved", |mr: &mut MergeRequestView| {
            mr.ctx.merge_request.approved
        })
        .register_get("created_at", |mr: &mut MergeRequestView| {
            mr.ctx.merge_request.created_at.timestamp() as rhai::INT
        })
        .register_get("updated_at", |mr: &mut MergeRequestView| {
            mr.ctx.merge_request.updated_at.timestamp() as rhai::INT
        })
        .register_get("time_since_first_commit", |mr: &mut MergeRequestView| {
            seconds(mr.ctx.merge_request.time_since_first_commit(mr.now))
        })
        .register_get("time_since_last_commit", |mr: &mut MergeRequestView| {
            seconds(mr.ctx.merge_request.time_since_last_commit(mr.now))
        })
        .register_get(
            "time_between_first_and_last_commit",
            |mr: &mut MergeRequestView| {
                seconds(mr.ctx.merge_request.time_between_first_and_last_commit())
            },
        )
        .register_get("modified_files_count", |mr: &mut MergeRequestView| {
            mr.ctx.merge_request.diff_stats.len() as rhai::INT
        });
}

fn register_merge_request_methods(engine: &mut Engine) {
    engine
        .register_fn("has_label", |mr: &mut MergeRequestView, name: &str| {
            mr.ctx.merge_request.has_label(name)
        })
        .register_fn("has_no_label", |mr: &mut MergeRequestView, name: &str| {
            !mr.ctx.merge_request.has_label(name)
        });

    // state_is / state_is_not accept one or more state names, or an array of them.
    engine
        .register_fn("state_is", |mr: &mut MergeRequestView, a: &str| {
            mr.state_is(&[a.to_string()])
        })
        .register_fn("state_is", |mr: &mut MergeRequestView, a: &str, b: &str| {
            mr.state_is(&[a.to_string(), b.to_string()])
        })
        .register_fn("state_is", |mr: &mut MergeRequestView, states: Array| -> ScriptResult<bool> {
            mr.state_is(&array_to_strings(states)?)
        })
        .register_fn("state_is_not", |mr: &mut MergeRequestView, a: &str| {
            mr.state_is(&[a.to_string()]).map(|matched| !matched)
        })
        .register_fn(
            "state_is_not",
            |mr: &mut MergeRequestView, a: &str, b: &str| {
                mr.state_is(&[a.to_string(), b.to_string()])
                    .map(|matched| !matched)
            },
        )
        .register_fn("state_is_not", |mr: &mut MergeRequestView, states: Array| -> ScriptResult<bool> {
            mr.state_is(&array_to_strings(states)?).map(|matched| !matched)
        });

    // Activity predicates take either a duration string ("7d") or seconds (duration("7d")).
    for name in ["has_activity_within", "has_any_activity_within"] {
        engine
            .register_fn(
                name,
                |mr: &mut MergeRequestView, within: &str| -> ScriptResult<bool> {
                    Ok(mr.has_any_activity_within(to_duration(within)?))
                },
            )
            .register_fn(
                name,
                |mr: &mut MergeRequestView, within: rhai::INT| -> ScriptResult<bool> {
                    Ok(mr.has_any_activity_within(from_seconds(within)?))
                },
            );
    }
    engine
        .register_fn(
            "has_no_activity_within",
            |mr: &mut MergeRequestView, within: &str| -> ScriptResult<bool> {
                Ok(!mr.has_any_activity_within(to_duration(within)?))
            },
        )
        .register_fn(
            "has_no_activity_within",
            |mr: &mut MergeRequestView, within: rhai::INT| -> ScriptResult<bool> {
                Ok(!mr.has_any_activity_within(from_seconds(within)?))
            },
        )
        .register_fn(
            "has_user_activity_within",
            |mr: &mut MergeRequestView, within: &str| -> ScriptResult<bool> {
                Ok(mr.has_user_activity_within(to_duration(within)?))
            },
        )
        .register_fn(
            "has_user_activity_within",
            |mr: &mut MergeRequestView, within: rhai::INT| -> ScriptResult<bool> {
                Ok(mr.has_user_activity_within(from_seconds(within)?))
            },
        )
        .register_fn(
            "has_no_user_activity_within",
            |mr: &mut MergeRequestView, within: &str| -> ScriptResult<bool> {
                Ok(!mr.has_user_activity_within(to_duration(within)?))
            },
        )
        .register_fn(
            "has_no_user_activity_within",
            |mr: &mut MergeRequestView, within: rhai::INT| -> ScriptResult<bool> {
                Ok(!mr.has_user_activity_within(from_seconds(within)?))
            },
        );

    engine
        .register_fn("modified_files", |mr: &mut MergeRequestView, a: &str| {
            mr.modified_files(&[a.to_string()])
        })
        .register_fn(
            "modified_files",
            |mr: &mut MergeRequestView, a: &str, b: &str| {
                mr.modified_files(&[a.to_string(), b.to_string()])
            },
        )
        .register_fn(
            "modified_files",
            |mr: &mut MergeRequestView, a: &str, b: &str, c: &str| {
                mr.modified_files(&[a.to_string(), b.to_string(), c.to_string()])
            },
        )
        .register_fn("modified_files", |mr: &mut MergeRequestView, patterns: Array| -> ScriptResult<bool> {
            mr.modified_files(&array_to_strings(patterns)?)
        })
        .register_fn("modified_files_list", |mr: &mut MergeRequestView| {
            strings(
                &mr.ctx
                    .merge_request
                    .modified_file_paths()
                    .into_iter()
                    .map(str::to_string)
                    .collect::<Vec<_>>(),
            )
        })
        .register_fn("modified_files_list", |mr: &mut MergeRequestView, a: &str| {
            mr.modified_files_list(&[a.to_string()])
        })
        .register_fn(
            "modified_files_list",
            |mr: &mut MergeRequestView, a: &str, b: &str| {
                mr.modified_files_list(&[a.to_string(), b.to_string()])
            },
        )
        .register_fn(
            "modified_files_list",
            |mr: &mut MergeRequestView, patterns: Array| -> ScriptResult<Array> {
                mr.modified_files_list(&array_to_strings(patterns)?)
            },
        );
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;
    use crate::config::{Config, IgnoreActivityFrom};
    use crate::script::{ReturnKind, Script, ScriptEngine, ScriptEnv, ScriptValue};
    use crate::tests::fixtures::{actor, eval_context, MergeRequestBuilder};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn eval(ctx: EvalContext, source: &str, expected: ReturnKind) -> ScriptValue {
        let env = ScriptEnv::at(Arc::new(ctx), now());
        ScriptEngine::new()
            .run(&Script::new(source), &env, expected)
            .unwrap()
    }

    fn eval_bool(ctx: EvalContext, source: &str) -> bool {
        eval(ctx, source, ReturnKind::Bool) == ScriptValue::Bool(true)
    }

    fn default_ctx() -> EvalContext {
        eval_context(MergeRequestBuilder::default().build().unwrap())
    }

    #[test]
    fn duration_function() {
        assert!(eval_bool(default_ctx(), r#"duration("1h") == 3600"#));
        assert!(eval_bool(default_ctx(), r#"duration("2w") == duration("14d")"#));
    }

    #[test]
    fn uniq_sorts_and_deduplicates() {
        let value = eval(default_ctx(), r#"uniq(["b", "a", "b"])"#, ReturnKind::StringList);
        assert_eq!(
            value,
            ScriptValue::StringList(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn path_helpers() {
        assert_eq!(filepath_dir("a/b/c.txt"), "a/b");
        assert_eq!(filepath_dir("c.txt"), ".");
        assert_eq!(filepath_dir("/c.txt"), "/");
        assert_eq!(limit_path_depth_to("a/b/c/d.txt", 2).unwrap(), "a/b");
        assert_eq!(limit_path_depth_to("a/b", 3).unwrap(), "a/b");
        assert!(limit_path_depth_to("a/b", -1).is_err());
    }

    #[test]
    fn state_predicates() {
        assert!(eval_bool(default_ctx(), r#"merge_request.state_is("opened")"#));
        assert!(eval_bool(
            default_ctx(),
            r#"merge_request.state_is_not("merged", "closed")"#
        ));
        assert!(eval_bool(
            default_ctx(),
            r#"merge_request.state_is(["merged", "opened"])"#
        ));
    }

    #[test]
    fn unknown_state_is_a_script_error() {
        let env = ScriptEnv::at(Arc::new(default_ctx()), now());
        let result = ScriptEngine::new().run(
            &Script::new(r#"merge_request.state_is("bogus")"#),
            &env,
            ReturnKind::Bool,
        );
        assert!(result.is_err());
    }

    #[test]
    fn activity_uses_config_ignore_list() {
        let mr = MergeRequestBuilder::default()
            .updated_at(now() - chrono::Duration::days(30))
            .notes(vec![crate::scm::Note {
                author: actor("renovate"),
                body: "bump".to_string(),
                created_at: now() - chrono::Duration::hours(1),
                updated_at: now() - chrono::Duration::hours(1),
            }])
            .build()
            .unwrap();

        let ctx = eval_context(mr.clone());
        assert!(eval_bool(ctx, r#"merge_request.has_activity_within("1d")"#));

        let mut ctx = eval_context(mr);
        ctx.set_config(Arc::new(Config {
            ignore_activity_from: IgnoreActivityFrom {
                usernames: vec!["renovate".to_string()],
                ..Default::default()
            },
            ..Default::default()
        }));
        assert!(eval_bool(
            ctx,
            r#"merge_request.has_no_activity_within(duration("1d"))"#
        ));
    }

    #[test]
    fn modified_files_variants() {
        let mr = MergeRequestBuilder::default()
            .files(vec!["src/a.go".to_string(), "README.md".to_string()])
            .build()
            .unwrap();
        assert!(eval_bool(
            eval_context(mr.clone()),
            r#"merge_request.modified_files("*.go")"#
        ));
        assert!(eval_bool(
            eval_context(mr.clone()),
            r#"merge_request.modified_files(["docs/", "README.md"])"#
        ));
        assert!(!eval_bool(
            eval_context(mr.clone()),
            r#"merge_request.modified_files("docs/")"#
        ));
        assert!(eval_bool(
            eval_context(mr),
            "merge_request.modified_files_count == 2"
        ));
    }

    #[test]
    fn commit_time_getters() {
        let mr = MergeRequestBuilder::default().build().unwrap();
        assert!(eval_bool(
            eval_context(mr),
            r#"type_of(merge_request.time_since_last_commit) == "()""#
        ));
    }

    #[test]
    fn webhook_event_is_exposed() {
        let mut ctx = default_ctx();
        ctx.set_webhook_event(serde_json::json!({"object_kind": "note"}));
        assert!(eval_bool(ctx, r#"webhook_event.object_kind == "note""#));
        assert!(eval_bool(default_ctx(), r#"type_of(webhook_event) == "()""#));
    }

    #[test]
    fn project_and_user_getters() {
        let ctx = default_ctx();
        assert!(eval_bool(
            ctx.clone(),
            r#"project.full_path == "group/project""#
        ));
        assert!(eval_bool(ctx, r#"current_user.username == "scm-engine""#));
    }
}
