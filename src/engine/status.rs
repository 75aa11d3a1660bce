//! Reports the progress of an evaluation as an external commit status.
use chrono::{DateTime, Utc};

use crate::scm::{
    CommitSha, CommitStatus, CommitStatusState, MergeRequestNumber, ScmClient, ScmError,
    PIPELINE_NAME,
};
use crate::utils::text::truncate;

const MAX_DESCRIPTION_LENGTH: usize = 250;

pub struct StatusReporter<'a> {
    client: &'a dyn ScmClient,
    sha: CommitSha,
    merge_request: MergeRequestNumber,
    eval_id: String,
    url_template: Option<String>,
    started_at: DateTime<Utc>,
    enabled: bool,
}

impl<'a> StatusReporter<'a> {
    pub fn new(
        client: &'a dyn ScmClient,
        sha: CommitSha,
        merge_request: MergeRequestNumber,
        eval_id: &str,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            client,
            sha,
            merge_request,
            eval_id: eval_id.to_string(),
            url_template: None,
            started_at,
            enabled: true,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Link attached to the status. Supports the placeholders `__ID__`, `__MR_ID__`,
    /// `__PROJECT_ID__`, `__START_TS_MS__` and `__STOP_TS_MS__`.
    pub fn with_url_template(mut self, template: Option<String>) -> Self {
        self.url_template = template.filter(|template| !template.is_empty());
        self
    }

    fn render_url(&self, stopped_at: Option<DateTime<Utc>>) -> Option<String> {
        let template = self.url_template.as_ref()?;
        let stop = stopped_at
            .map(|at| at.timestamp_millis().to_string())
            .unwrap_or_default();
        Some(
            template
                .replace("__ID__", &self.eval_id)
                .replace("__MR_ID__", &self.merge_request.to_string())
                .replace("__PROJECT_ID__", self.client.project())
                .replace("__START_TS_MS__", &self.started_at.timestamp_millis().to_string())
                .replace("__STOP_TS_MS__", &stop),
        )
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.send(CommitStatus {
            state: CommitStatusState::Running,
            name: PIPELINE_NAME.to_string(),
            description: "Currently evaluating MR".to_string(),
            target_url: self.render_url(None),
        })
        .await
    }

    /// Reports the outcome. An error only fails the status if `allow_failure` is set; otherwise
    /// it is reported as skipped so that it never blocks merging.
    pub async fn stop(
        &self,
        error: Option<&anyhow::Error>,
        allow_failure: bool,
    ) -> anyhow::Result<()> {
        let (state, description) = match error {
            None => (CommitStatusState::Success, "OK".to_string()),
            Some(error) => {
                let state = if allow_failure {
                    CommitStatusState::Failed
                } else {
                    CommitStatusState::Skipped
                };
                let text = format!("{error:#}");
                (
                    state,
                    truncate(&text, MAX_DESCRIPTION_LENGTH, "...").into_owned(),
                )
            }
        };

        self.send(CommitStatus {
            state,
            name: PIPELINE_NAME.to_string(),
            description,
            target_url: self.render_url(Some(Utc::now())),
        })
        .await
    }

    async fn send(&self, status: CommitStatus) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.sha.0.is_empty() {
            tracing::debug!("No commit SHA known, not updating the pipeline status");
            return Ok(());
        }

        match self.client.set_commit_status(&self.sha, &status).await {
            Ok(()) => Ok(()),
            // The status name is already used by a regular CI job.
            Err(ScmError::BadRequest(error)) => {
                tracing::warn!("Could not update commit pipeline status: {error}");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::tests::mock::MockScm;

    fn started() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn reporter(client: &MockScm) -> StatusReporter<'_> {
        StatusReporter::new(
            client,
            CommitSha("deadbeef".to_string()),
            5.into(),
            "abc123",
            started(),
        )
    }

    #[tokio::test]
    async fn start_reports_running() {
        let client = MockScm::default();
        let url = "https://logs.example.com/?id=__ID__&mr=__MR_ID__&project=__PROJECT_ID__&from=__START_TS_MS__&to=__STOP_TS_MS__";
        reporter(&client)
            .with_url_template(Some(url.to_string()))
            .start()
            .await
            .unwrap();

        let statuses = client.statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].state, CommitStatusState::Running);
        assert_eq!(statuses[0].name, PIPELINE_NAME);
        insta::assert_snapshot!(
            statuses[0].target_url.clone().unwrap(),
            @"https://logs.example.com/?id=abc123&mr=5&project=group/project&from=1717243200000&to="
        );
    }

    #[tokio::test]
    async fn stop_without_error() {
        let client = MockScm::default();
        reporter(&client).stop(None, false).await.unwrap();
        let status = &client.statuses()[0];
        assert_eq!(status.state, CommitStatusState::Success);
        assert_eq!(status.description, "OK");
        assert_eq!(status.target_url, None);
    }

    #[tokio::test]
    async fn stop_with_error() {
        let client = MockScm::default();
        let error = anyhow::anyhow!("x".repeat(400));

        reporter(&client).stop(Some(&error), true).await.unwrap();
        reporter(&client).stop(Some(&error), false).await.unwrap();

        let statuses = client.statuses();
        assert_eq!(statuses[0].state, CommitStatusState::Failed);
        assert_eq!(statuses[1].state, CommitStatusState::Skipped);
        assert_eq!(statuses[0].description.chars().count(), 250);
        assert!(statuses[0].description.ends_with("..."));
    }

    #[tokio::test]
    async fn disabled_reporter_is_silent() {
        let client = MockScm::default();
        let reporter = reporter(&client).enabled(false);
        reporter.start().await.unwrap();
        reporter.stop(None, false).await.unwrap();
        assert!(client.statuses().is_empty());
    }

    #[tokio::test]
    async fn name_collision_is_not_an_error() {
        let client = MockScm::default().fail_status_with(400);
        reporter(&client).start().await.unwrap();
        assert_eq!(client.statuses().len(), 1);

        let client = MockScm::default().fail_status_with(500);
        assert!(reporter(&client).start().await.is_err());
    }
}
