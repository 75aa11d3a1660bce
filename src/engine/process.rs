//! Evaluates one merge request from start to finish.
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tracing::Instrument;

use crate::config::{Config, DEFAULT_CONFIG_FILE};
use crate::engine::actions::StepExecutor;
use crate::engine::context::EngineContext;
use crate::engine::reconcile::{partition_labels, LabelReconciler};
use crate::engine::status::StatusReporter;
use crate::scm::{
    CommitSha, MergeRequestNumber, MergeRequestPatch, ResourceKey, ScmClient,
};
use crate::script::ScriptEnv;
use crate::utils::text::short_id;

/// Settings of a single evaluation.
#[derive(Clone, Debug, Default)]
pub struct EvaluationState {
    pub project: String,
    pub merge_request: MergeRequestNumber,
    /// Head commit of the merge request. Used to report the commit status and to read the
    /// configuration file when none is given.
    pub commit_sha: Option<CommitSha>,
    pub dry_run: bool,
    pub update_pipeline: bool,
    pub update_pipeline_url: Option<String>,
    pub config_path: String,
    pub webhook_event: Option<serde_json::Value>,
    /// Seed for random reviewer selection.
    pub seed: Option<u64>,
}

impl EvaluationState {
    pub fn new(project: &str, merge_request: MergeRequestNumber) -> Self {
        Self {
            project: project.to_string(),
            merge_request,
            ..Default::default()
        }
    }

    pub fn config_path(&self) -> &str {
        if self.config_path.is_empty() {
            DEFAULT_CONFIG_FILE
        } else {
            &self.config_path
        }
    }
}

/// Reads and parses the configuration file stored in the repository at `git_ref`.
pub async fn load_remote_config(
    client: &dyn ScmClient,
    path: &str,
    git_ref: &str,
) -> anyhow::Result<Config> {
    let content = client
        .merge_requests()
        .get_remote_config(path, git_ref)
        .await
        .context("could not read remote config file")?;
    Config::parse(&content).context("could not parse config file")
}

/// Evaluates the rules against one merge request and applies the outcome.
///
/// Evaluations of the same merge request are serialized. When `config` is `None`, the
/// configuration file is read from the head commit of the merge request.
pub async fn process_merge_request(
    ctx: &EngineContext,
    state: EvaluationState,
    config: Option<Config>,
) -> anyhow::Result<()> {
    let eval_id = short_id();
    let span = tracing::info_span!(
        "MergeRequest",
        provider = %ctx.provider.provider(),
        project = state.project.as_str(),
        mr = %state.merge_request,
        eval_id = eval_id.as_str(),
    );

    async {
        let key = ResourceKey::new(ctx.provider.provider(), &state.project, state.merge_request);
        let _guard = ctx.locks().lock(&key).await;

        let started_at = Utc::now();
        let client = ctx.provider.client(&state.project);
        let reporter = StatusReporter::new(
            client.as_ref(),
            state.commit_sha.clone().unwrap_or_default(),
            state.merge_request,
            &eval_id,
            started_at,
        )
        .enabled(state.update_pipeline)
        .with_url_template(state.update_pipeline_url.clone());

        let mut allow_failure = false;
        let result = match reporter
            .start()
            .await
            .context("failed to update pipeline monitor")
        {
            Ok(()) => evaluate(ctx, &state, config, client.as_ref(), &mut allow_failure).await,
            Err(error) => Err(error),
        };

        if let Err(error) = reporter.stop(result.as_ref().err(), allow_failure).await {
            tracing::error!("Failed to update pipeline: {error:?}");
        }
        result
    }
    .instrument(span)
    .await
}

async fn evaluate(
    ctx: &EngineContext,
    state: &EvaluationState,
    config: Option<Config>,
    client: &dyn ScmClient,
    allow_failure: &mut bool,
) -> anyhow::Result<()> {
    tracing::info!("Creating evaluation context");
    let Some(mut eval_ctx) = client.eval_context(state.merge_request).await? else {
        tracing::warn!("Evaluation context is empty, does the merge request exist?");
        return Ok(());
    };
    *allow_failure = eval_ctx.allow_pipeline_failure(state.config_path());

    let mut config = config;
    let mut config_ref = state
        .commit_sha
        .clone()
        .unwrap_or_else(|| eval_ctx.merge_request.sha.clone())
        .0;
    if !eval_ctx.can_use_configuration_file_from_change_request() {
        config = None;
        config_ref = eval_ctx.merge_request.target_branch.clone();
    }
    let mut config = match config {
        Some(config) => config,
        None => {
            tracing::debug!("Downloading configuration from ref {config_ref}");
            load_remote_config(client, state.config_path(), &config_ref).await?
        }
    };
    config.load_includes(ctx.provider.as_ref()).await?;

    let dry_run = config.dry_run.unwrap_or(state.dry_run);
    let config = Arc::new(config);
    if let Some(event) = &state.webhook_event {
        eval_ctx.set_webhook_event(event.clone());
    }
    eval_ctx.set_config(config.clone());
    let eval_ctx = Arc::new(eval_ctx);
    let env = ScriptEnv::new(eval_ctx.clone());

    tracing::info!("Evaluating context");
    let (labels, actions) = config.evaluate(&ctx.scripts, &env)?;
    tracing::debug!(
        "Evaluation complete: {} label(s), {} action(s)",
        labels.len(),
        actions.len()
    );

    tracing::info!("Syncing labels");
    LabelReconciler::new(client, dry_run)
        .sync_catalog(&labels)
        .await?;
    let mut patch = MergeRequestPatch::default();
    partition_labels(&labels, &eval_ctx.merge_request.labels, &mut patch);

    if actions.is_empty() {
        tracing::debug!("No actions evaluated to true, skipping");
    } else {
        tracing::info!("Applying actions");
        let mut executor = StepExecutor::new(client, &ctx.scripts, &env, &eval_ctx)
            .with_catalog(ctx.catalog())
            .dry_run(dry_run);
        if let Some(seed) = state.seed {
            executor = executor.with_seed(seed);
        }
        executor.run_actions(&actions, &mut patch).await?;
    }

    update_merge_request(client, state.merge_request, &patch, dry_run).await
}

async fn update_merge_request(
    client: &dyn ScmClient,
    mr: MergeRequestNumber,
    patch: &MergeRequestPatch,
    dry_run: bool,
) -> anyhow::Result<()> {
    if patch.is_empty() {
        tracing::debug!("No changes to apply to the merge request");
        return Ok(());
    }
    if dry_run {
        tracing::info!(
            "In dry-run, the merge request would be updated with: {}",
            serde_json::to_string(patch)?
        );
        return Ok(());
    }

    tracing::info!("Updating merge request");
    client
        .merge_requests()
        .update(mr, patch)
        .await
        .context("Cannot update merge request")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scm::CommitStatusState;
    use crate::tests::fixtures::{eval_context, MergeRequestBuilder};
    use crate::tests::mock::{Call, MockProvider, MockScm};

    struct Harness {
        provider: Arc<MockProvider>,
        ctx: EngineContext,
    }

    impl Harness {
        fn new(client: MockScm) -> Self {
            let provider = Arc::new(MockProvider::default().with_client(client));
            Self {
                ctx: EngineContext::new(provider.clone()),
                provider,
            }
        }

        fn with_mr(mr: MergeRequestBuilder) -> Self {
            Self::new(MockScm::default().with_merge_request(eval_context(mr.build().unwrap())))
        }

        fn calls(&self) -> Vec<Call> {
            self.provider.client.calls()
        }

        async fn process(&self, config: &str) -> anyhow::Result<()> {
            self.process_with(state(), Some(config)).await
        }

        async fn process_with(
            &self,
            state: EvaluationState,
            config: Option<&str>,
        ) -> anyhow::Result<()> {
            let config = config.map(|yaml| Config::parse(yaml).unwrap());
            process_merge_request(&self.ctx, state, config).await
        }
    }

    fn state() -> EvaluationState {
        EvaluationState::new("group/project", 1.into())
    }

    const NEEDS_REBASE: &str = r#"
label:
  - name: needs-rebase
    color: $red
    script: "!merge_request.mergeable"
"#;

    #[tokio::test]
    async fn creates_label_and_patches_once() {
        let harness = Harness::with_mr(MergeRequestBuilder::default().mergeable(false));
        harness.process(NEEDS_REBASE).await.unwrap();

        assert_eq!(
            harness.calls(),
            vec![
                Call::CreateLabel("needs-rebase".to_string()),
                Call::UpdateMergeRequest(
                    1.into(),
                    MergeRequestPatch {
                        add_labels: vec!["needs-rebase".to_string()],
                        ..Default::default()
                    }
                ),
            ]
        );
    }

    #[tokio::test]
    async fn second_evaluation_changes_nothing() {
        let harness = Harness::with_mr(MergeRequestBuilder::default().mergeable(false));
        harness.process(NEEDS_REBASE).await.unwrap();
        harness.provider.client.clear_calls();

        harness.process(NEEDS_REBASE).await.unwrap();
        assert!(harness.calls().is_empty());
    }

    #[tokio::test]
    async fn unmatched_label_is_removed() {
        let harness = Harness::with_mr(
            MergeRequestBuilder::default().labels(vec!["needs-rebase".to_string()]),
        );
        harness.process(NEEDS_REBASE).await.unwrap();

        let patches = harness.provider.client.patches();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].remove_labels, vec!["needs-rebase"]);
        assert!(patches[0].add_labels.is_empty());
    }

    #[tokio::test]
    async fn comment_action_has_no_label_side_effects() {
        let harness = Harness::with_mr(
            MergeRequestBuilder::default().labels(vec!["stale".to_string()]),
        );
        harness
            .process(
                r#"
actions:
  - name: nag
    if: 'merge_request.has_label("stale")'
    then:
      - action: comment
        message: still stale
"#,
            )
            .await
            .unwrap();

        assert_eq!(
            harness.calls(),
            vec![Call::Comment(1.into(), "still stale".to_string())]
        );
    }

    #[tokio::test]
    async fn missing_merge_request_is_not_an_error() {
        let harness = Harness::new(MockScm::default());
        harness.process(NEEDS_REBASE).await.unwrap();
        assert!(harness.calls().is_empty());
    }

    #[tokio::test]
    async fn dry_run_from_config_prevents_mutations() {
        let harness = Harness::with_mr(MergeRequestBuilder::default().mergeable(false));
        harness
            .process(&format!("dry_run: true\n{NEEDS_REBASE}"))
            .await
            .unwrap();
        assert!(harness.calls().is_empty());
    }

    #[tokio::test]
    async fn reads_config_from_head_commit() {
        let mr = MergeRequestBuilder::default().mergeable(false).build().unwrap();
        let harness = Harness::new(
            MockScm::default()
                .with_merge_request(eval_context(mr))
                .with_remote_config("deadbeef", NEEDS_REBASE),
        );
        harness.process_with(state(), None).await.unwrap();
        assert_eq!(harness.provider.client.patches().len(), 1);
    }

    #[tokio::test]
    async fn stale_branch_uses_target_branch_config() {
        let mr = MergeRequestBuilder::default()
            .diverged(true)
            .build()
            .unwrap();
        let harness = Harness::new(
            MockScm::default()
                .with_merge_request(eval_context(mr))
                .with_remote_config(
                    "main",
                    "label:\n  - name: from-main\n    script: \"true\"\n",
                ),
        );
        harness
            .process("label:\n  - name: from-branch\n    script: \"true\"\n")
            .await
            .unwrap();

        assert_eq!(
            harness.calls()[0],
            Call::CreateLabel("from-main".to_string())
        );
    }

    #[tokio::test]
    async fn failed_step_skips_patch() {
        let harness = Harness::with_mr(
            MergeRequestBuilder::default()
                .mergeable(false)
                .description("here"),
        );
        let config = format!(
            r#"{NEEDS_REBASE}
actions:
  - name: broken
    if: "true"
    then:
      - action: comment
        message: hello
      - action: update_description
        replace:
          "here": '42'
"#
        );
        let error = harness.process(&config).await.unwrap_err();
        assert!(format!("{error:#}").contains("action: broken; step #2"));

        assert_eq!(
            harness.calls(),
            vec![
                Call::CreateLabel("needs-rebase".to_string()),
                Call::Comment(1.into(), "hello".to_string()),
            ]
        );
    }

    fn pipeline_state() -> EvaluationState {
        EvaluationState {
            commit_sha: Some(CommitSha("deadbeef".to_string())),
            update_pipeline: true,
            ..state()
        }
    }

    const BROKEN: &str = "label:\n  - name: broken\n    script: '\"yes\"'\n";

    #[tokio::test]
    async fn reports_pipeline_status() {
        let harness = Harness::with_mr(MergeRequestBuilder::default());
        harness
            .process_with(pipeline_state(), Some(NEEDS_REBASE))
            .await
            .unwrap();

        let states: Vec<_> = harness
            .provider
            .client
            .statuses()
            .into_iter()
            .map(|status| status.state)
            .collect();
        assert_eq!(
            states,
            vec![CommitStatusState::Running, CommitStatusState::Success]
        );
    }

    #[tokio::test]
    async fn config_change_may_fail_pipeline() {
        let harness = Harness::with_mr(
            MergeRequestBuilder::default().files(vec![".scm-engine.yml".to_string()]),
        );
        assert!(harness
            .process_with(pipeline_state(), Some(BROKEN))
            .await
            .is_err());
        let statuses = harness.provider.client.statuses();
        assert_eq!(statuses[1].state, CommitStatusState::Failed);
        assert!(statuses[1].description.contains("label: broken"));
    }

    #[tokio::test]
    async fn unrelated_change_skips_pipeline() {
        let harness = Harness::with_mr(
            MergeRequestBuilder::default().files(vec!["src/main.rs".to_string()]),
        );
        assert!(harness
            .process_with(pipeline_state(), Some(BROKEN))
            .await
            .is_err());
        let statuses = harness.provider.client.statuses();
        assert_eq!(statuses[1].state, CommitStatusState::Skipped);
    }

    #[tokio::test]
    async fn webhook_event_is_visible_to_scripts() {
        let harness = Harness::with_mr(MergeRequestBuilder::default());
        let state = EvaluationState {
            webhook_event: Some(serde_json::json!({"object_kind": "note"})),
            ..state()
        };
        harness
            .process_with(
                state,
                Some("label:\n  - name: from-note\n    script: 'webhook_event.object_kind == \"note\"'\n"),
            )
            .await
            .unwrap();
        assert_eq!(
            harness.provider.client.patches()[0].add_labels,
            vec!["from-note"]
        );
    }
}
