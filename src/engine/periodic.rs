//! Background re-evaluation of every eligible open merge request.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::Config;
use crate::engine::context::EngineContext;
use crate::engine::process::{process_merge_request, EvaluationState};
use crate::scm::MergeRequestListFilters;
use crate::utils::logging::LogError;
use crate::utils::text::short_id;

/// Sweeps never run more often than this.
pub const MIN_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Clone, Debug, Default)]
pub struct PeriodicEvaluation {
    /// Zero disables the sweep.
    pub interval: Duration,
    pub filters: MergeRequestListFilters,
    pub dry_run: bool,
    pub update_pipeline: bool,
    pub update_pipeline_url: Option<String>,
}

impl PeriodicEvaluation {
    /// The interval actually used, or `None` if the sweep is disabled.
    pub fn effective_interval(&self) -> Option<Duration> {
        if self.interval.is_zero() {
            return None;
        }
        if self.interval < MIN_INTERVAL {
            tracing::warn!(
                "Periodic evaluation interval {:?} is below the minimum, using {:?}",
                self.interval,
                MIN_INTERVAL
            );
            return Some(MIN_INTERVAL);
        }
        Some(self.interval)
    }
}

/// Evaluates every merge request returned by the sweep query. Failures of individual merge
/// requests are logged and do not stop the sweep.
pub async fn periodic_tick(
    ctx: &EngineContext,
    settings: &PeriodicEvaluation,
) -> anyhow::Result<()> {
    let merge_requests = ctx
        .provider
        .find_merge_requests_for_periodic_evaluation(&settings.filters)
        .await?;
    tracing::info!(
        "Found {} merge request(s) to evaluate",
        merge_requests.len()
    );

    for mr in merge_requests {
        let Some(blob) = mr.config_blob.as_deref() else {
            tracing::debug!(
                "Project {} has no configuration file at {}, skipping !{}",
                mr.project,
                settings.filters.config_path(),
                mr.merge_request
            );
            continue;
        };
        let config = match Config::parse(blob) {
            Ok(config) => config,
            Err(error) => {
                tracing::warn!(
                    "Could not parse the configuration of project {}, skipping !{}: {error}",
                    mr.project,
                    mr.merge_request
                );
                continue;
            }
        };

        let update_pipeline = settings.update_pipeline && mr.should_update_pipeline();
        if settings.update_pipeline && !update_pipeline {
            tracing::debug!(
                "Head pipeline of {}!{} has already failed, not updating its status",
                mr.project,
                mr.merge_request
            );
        }

        let state = EvaluationState {
            project: mr.project.clone(),
            merge_request: mr.merge_request,
            commit_sha: Some(mr.sha.clone()),
            dry_run: settings.dry_run,
            update_pipeline,
            update_pipeline_url: settings.update_pipeline_url.clone(),
            config_path: settings.filters.config_path().to_string(),
            ..Default::default()
        };
        if let Err(error) = process_merge_request(ctx, state, Some(config)).await {
            tracing::error!(
                "Failed to evaluate {}!{}: {error:?}",
                mr.project,
                mr.merge_request
            );
        }
    }
    Ok(())
}

/// Returns the sweep loop, or `None` if the sweep is disabled.
///
/// The first sweep runs one interval after the start. Cancelling `cancel` prevents new sweeps
/// from starting; a sweep in progress is finished before the future resolves.
pub fn start_periodic_evaluation(
    ctx: Arc<EngineContext>,
    settings: PeriodicEvaluation,
    cancel: CancellationToken,
) -> Option<impl Future<Output = ()>> {
    let period = settings.effective_interval()?;
    tracing::info!("Starting periodic evaluation every {period:?}");

    Some(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let span = tracing::info_span!("PeriodicEvaluation", periodic_eval_id = short_id());
            if let Err(error) = periodic_tick(&ctx, &settings)
                .instrument(span.clone())
                .await
            {
                span.log_error(error);
            }
        }
        tracing::info!("Periodic evaluation stopped");
    })
}
