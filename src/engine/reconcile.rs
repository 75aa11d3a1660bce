//! Converges the project's label catalog and the merge request's labels towards the evaluated
//! state.
use std::collections::{HashMap, HashSet};

use anyhow::Context;
use itertools::{Either, Itertools};

use crate::config::EvaluationResult;
use crate::scm::{Label, MergeRequestPatch, ScmClient, ScmError};

/// Returns true if the remote label differs from the desired one in any attribute the engine
/// manages. Priority is only compared when the platform stores it.
pub fn label_needs_update(remote: &Label, desired: &Label, supports_priority: bool) -> bool {
    if remote.description != desired.description {
        return true;
    }
    if !remote
        .color
        .trim_start_matches('#')
        .eq_ignore_ascii_case(desired.color.trim_start_matches('#'))
    {
        return true;
    }
    supports_priority && remote.priority != desired.priority
}

/// Reconciles labels of one project. The label catalog is cached for the lifetime of the
/// reconciler and dropped after every create or update it performs.
pub struct LabelReconciler<'a> {
    client: &'a dyn ScmClient,
    dry_run: bool,
    cache: Option<HashMap<String, Label>>,
}

impl<'a> LabelReconciler<'a> {
    pub fn new(client: &'a dyn ScmClient, dry_run: bool) -> Self {
        Self {
            client,
            dry_run,
            cache: None,
        }
    }

    async fn catalog(&mut self) -> anyhow::Result<HashMap<String, Label>> {
        if let Some(cache) = &self.cache {
            return Ok(cache.clone());
        }
        let labels = self
            .client
            .labels()
            .list()
            .await
            .context("Cannot list project labels")?;
        let catalog: HashMap<String, Label> = labels
            .into_iter()
            .map(|label| (label.name.clone(), label))
            .collect();
        self.cache = Some(catalog.clone());
        Ok(catalog)
    }

    /// Makes sure every desired label exists in the catalog with the configured metadata.
    pub async fn sync_catalog(&mut self, desired: &[EvaluationResult]) -> anyhow::Result<()> {
        tracing::info!("Going to sync {} required label(s)", desired.len());
        let remote = self.catalog().await?;

        for result in desired.iter().filter(|r| !remote.contains_key(&r.name)) {
            tracing::info!("Creating label {}", result.name);
            if self.dry_run {
                continue;
            }
            self.cache = None;
            match self.client.labels().create(&result.to_label()).await {
                Ok(()) => {}
                Err(ScmError::Conflict(_)) => {
                    tracing::warn!("Label {} already exists", result.name);
                }
                Err(error) => {
                    return Err(error).with_context(|| format!("Cannot create label {}", result.name));
                }
            }
        }

        let supports_priority = self.client.supports_label_priority();
        for result in desired {
            let Some(existing) = remote.get(&result.name) else {
                continue;
            };
            let wanted = result.to_label();
            if !label_needs_update(existing, &wanted, supports_priority) {
                continue;
            }
            tracing::info!("Updating label {}", result.name);
            if self.dry_run {
                continue;
            }
            self.cache = None;
            self.client
                .labels()
                .update(&wanted)
                .await
                .with_context(|| format!("Cannot update label {}", result.name))?;
        }

        Ok(())
    }
}

/// Splits the evaluated labels into additions and removals on `patch`, keeping only those that
/// change the merge request's current `labels`.
pub fn partition_labels(
    results: &[EvaluationResult],
    labels: &[String],
    patch: &mut MergeRequestPatch,
) {
    let (add, remove): (Vec<&str>, Vec<&str>) =
        results.iter().partition_map(|result| {
            if result.matched {
                Either::Left(result.name.as_str())
            } else {
                Either::Right(result.name.as_str())
            }
        });

    let existing: HashSet<&str> = labels.iter().map(|label| label.as_str()).collect();
    for name in add.into_iter().filter(|name| !existing.contains(name)) {
        patch.add_label(name);
    }
    for name in remove.into_iter().filter(|name| existing.contains(name)) {
        patch.remove_label(name);
    }
    tracing::debug!(
        "Filtered labels: current = {existing:?}, add = {:?}, remove = {:?}",
        patch.add_labels,
        patch.remove_labels
    );
}
