//! Executes the steps of matched actions.
use anyhow::Context;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::{Action, ReviewerMode, ReviewerSource, Step};
use crate::engine::catalog::OwnerCatalog;
use crate::engine::reviewers::{reviewer_ids, select_reviewers};
use crate::scm::{EvalContext, MergeRequestPatch, ScmClient, StateEvent};
use crate::script::{ReturnKind, Script, ScriptEngine, ScriptEnv, ScriptValue};

/// Applies steps to a pending patch. Steps that cannot be deferred (comments and approvals) are
/// sent to the SCM right away.
pub struct StepExecutor<'a> {
    client: &'a dyn ScmClient,
    engine: &'a ScriptEngine,
    env: &'a ScriptEnv,
    ctx: &'a EvalContext,
    catalog: Option<&'a dyn OwnerCatalog>,
    dry_run: bool,
    rng: StdRng,
}

impl<'a> StepExecutor<'a> {
    pub fn new(
        client: &'a dyn ScmClient,
        engine: &'a ScriptEngine,
        env: &'a ScriptEnv,
        ctx: &'a EvalContext,
    ) -> Self {
        Self {
            client,
            engine,
            env,
            ctx,
            catalog: None,
            dry_run: false,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_catalog(mut self, catalog: Option<&'a dyn OwnerCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Makes random reviewer selection reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Runs the steps of every action in order. The first failing step stops the whole run.
    pub async fn run_actions(
        &mut self,
        actions: &[&Action],
        patch: &mut MergeRequestPatch,
    ) -> anyhow::Result<()> {
        for action in actions {
            tracing::info!("Applying action {}", action.name);
            for (index, step) in action.steps.iter().enumerate() {
                self.apply_step(step, patch).await.with_context(|| {
                    format!(
                        "action: {}; step #{} ({})",
                        action.name,
                        index + 1,
                        step.name()
                    )
                })?;
            }
        }
        Ok(())
    }

    pub async fn apply_step(
        &mut self,
        step: &Step,
        patch: &mut MergeRequestPatch,
    ) -> anyhow::Result<()> {
        let mr = self.ctx.merge_request.iid;
        match step {
            Step::AddLabel { label } => patch.add_label(label),
            Step::RemoveLabel { label } => patch.remove_label(label),
            Step::Close => patch.state_event = Some(StateEvent::Close),
            Step::Reopen => patch.state_event = Some(StateEvent::Reopen),
            Step::LockDiscussion => patch.discussion_locked = Some(true),
            Step::UnlockDiscussion => patch.discussion_locked = Some(false),
            Step::UpdateDescription { replace } => self.update_description(replace, patch)?,
            Step::Approve => {
                if self.dry_run {
                    tracing::info!("Approving MR (dry run)");
                } else {
                    self.client.merge_requests().approve(mr).await?;
                }
            }
            Step::Unapprove => {
                if self.dry_run {
                    tracing::info!("Unapproving MR (dry run)");
                } else {
                    self.client.merge_requests().unapprove(mr).await?;
                }
            }
            Step::Comment { message } => {
                if self.dry_run {
                    tracing::info!("Commenting on MR (dry run): {message}");
                } else {
                    self.client.merge_requests().comment(mr, message).await?;
                }
            }
            Step::AssignReviewers {
                source,
                limit,
                mode,
            } => self.assign_reviewers(*source, *limit, *mode, patch).await?,
        }
        Ok(())
    }

    fn update_description(
        &self,
        replace: &std::collections::BTreeMap<String, Script>,
        patch: &mut MergeRequestPatch,
    ) -> anyhow::Result<()> {
        let mut description = patch
            .description
            .clone()
            .unwrap_or_else(|| self.ctx.description().to_string());

        let mut changed = false;
        for (needle, script) in replace {
            if !description.contains(needle.as_str()) {
                continue;
            }
            let replacement = match self.engine.run(script, self.env, ReturnKind::String) {
                Ok(ScriptValue::String(value)) => value,
                Ok(other) => anyhow::bail!("replacement for {needle:?} returned {other:?}"),
                Err(error) => {
                    return Err(error).with_context(|| format!("replacement for {needle:?}"))
                }
            };
            description = description.replace(needle.as_str(), &replacement);
            changed = true;
        }

        if changed {
            patch.description = Some(description);
        } else {
            tracing::debug!("No replacement key found in the description");
        }
        Ok(())
    }

    async fn assign_reviewers(
        &mut self,
        source: ReviewerSource,
        limit: usize,
        mode: ReviewerMode,
        patch: &mut MergeRequestPatch,
    ) -> anyhow::Result<()> {
        if !self.ctx.reviewers().is_empty() {
            tracing::debug!("Merge request already has reviewers, not assigning new ones");
            return Ok(());
        }

        let candidates = match source {
            ReviewerSource::Codeowners => self.ctx.code_owners(),
            ReviewerSource::Backstage => {
                let Some(catalog) = self.catalog else {
                    tracing::warn!(
                        "Reviewer source backstage requested but no Backstage catalog is configured"
                    );
                    return Ok(());
                };
                catalog
                    .owners(&self.ctx.project, &self.ctx.merge_request.author)
                    .await?
            }
        };
        if candidates.is_empty() {
            tracing::debug!("No eligible reviewers found");
            return Ok(());
        }

        let selected = select_reviewers(&candidates, limit, mode, &mut self.rng);
        let ids = reviewer_ids(&selected);
        tracing::info!("Assigning {} reviewer(s)", ids.len());
        patch.append_reviewer_ids(&ids);
        Ok(())
    }
}
