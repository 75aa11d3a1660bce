//! GitLab client built on the REST (v4) and GraphQL APIs.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::async_trait;
use reqwest::{RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::scm::{
    CommitSha, CommitStatus, CommitStatusState, EvalContext, Label, LabelClient,
    MergeRequestClient, MergeRequestListFilters, MergeRequestNumber, MergeRequestPatch,
    PeriodicEvaluationMergeRequest, Provider, ScmClient, ScmError, ScmProvider, StateEvent,
};

mod graphql;

use graphql::{
    EvalContextData, GraphqlResponse, PeriodicEvaluationData, ProjectFilesData,
    EVAL_CONTEXT_QUERY, PERIODIC_EVALUATION_QUERY, PROJECT_FILES_QUERY,
};

const PER_PAGE: &str = "100";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Normalizes a user supplied base URL: `https://gitlab.com/api/v4/` becomes
/// `https://gitlab.com`.
pub fn normalize_base_url(url: &str) -> String {
    let url = url.trim_end_matches('/');
    url.strip_suffix("/api/v4").unwrap_or(url).to_string()
}

/// Percent-encodes a project path or file path so it can be used as a single URL segment.
fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Authenticated access to a GitLab instance.
pub struct GitlabApi {
    client: reqwest::Client,
    base_url: String,
    token: SecretString,
}

impl GitlabApi {
    pub fn new(base_url: &str, token: SecretString) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Cannot create GitLab HTTP client")?;
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url),
            token,
        })
    }

    fn rest(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/api/v4/{path}", self.base_url))
            .header("PRIVATE-TOKEN", self.token.expose_secret())
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ScmError> {
        let response = request
            .send()
            .await
            .map_err(|error| ScmError::Other(error.into()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        Err(ScmError::from_status(status.as_u16(), text))
    }

    /// Sends a request and returns the decoded body together with the `x-next-page` header.
    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> anyhow::Result<(T, Option<String>)> {
        let response = self.send(request).await?;
        let next_page = response
            .headers()
            .get("x-next-page")
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        let body = response
            .json::<T>()
            .await
            .context("Cannot deserialize GitLab response")?;
        Ok((body, next_page))
    }

    /// Runs a GraphQL query. Any reported error fails the whole query.
    async fn graphql<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> anyhow::Result<T> {
        let request = self
            .client
            .post(format!("{}/api/graphql", self.base_url))
            .bearer_auth(self.token.expose_secret())
            .json(&json!({ "query": query, "variables": variables }));
        let response: GraphqlResponse<T> = self
            .send(request)
            .await?
            .json()
            .await
            .context("Cannot deserialize GitLab GraphQL response")?;

        if !response.errors.is_empty() {
            let messages: Vec<&str> = response
                .errors
                .iter()
                .map(|error| error.message.as_str())
                .collect();
            anyhow::bail!("GitLab GraphQL query failed: {}", messages.join("; "));
        }
        response
            .data
            .ok_or_else(|| anyhow::anyhow!("GitLab GraphQL response contains no data"))
    }
}

/// Provides access to all projects visible to the configured token.
pub struct GitlabProvider {
    api: Arc<GitlabApi>,
}

impl GitlabProvider {
    pub fn new(base_url: &str, token: SecretString) -> anyhow::Result<Self> {
        Ok(Self {
            api: Arc::new(GitlabApi::new(base_url, token)?),
        })
    }
}

#[async_trait]
impl ScmProvider for GitlabProvider {
    fn provider(&self) -> Provider {
        Provider::Gitlab
    }

    fn client(&self, project: &str) -> Arc<dyn ScmClient> {
        Arc::new(GitlabClient {
            api: self.api.clone(),
            project: project.to_string(),
        })
    }

    async fn get_project_files(
        &self,
        project: &str,
        git_ref: Option<&str>,
        files: &[String],
    ) -> anyhow::Result<BTreeMap<String, String>> {
        let mut variables = json!({ "project": project, "files": files });
        if let Some(git_ref) = git_ref {
            variables["ref"] = json!(git_ref);
        }
        let data: ProjectFilesData = self
            .api
            .graphql(PROJECT_FILES_QUERY, variables)
            .await
            .with_context(|| format!("Cannot read files from project {project}"))?;

        let blobs = data
            .project
            .ok_or_else(|| anyhow::anyhow!("Project {project} not found"))?
            .repository
            .map(|repository| repository.blobs.nodes)
            .unwrap_or_default();
        Ok(blobs
            .into_iter()
            .filter_map(|blob| blob.raw_blob.map(|content| (blob.path, content)))
            .collect())
    }

    async fn find_merge_requests_for_periodic_evaluation(
        &self,
        filters: &MergeRequestListFilters,
    ) -> anyhow::Result<Vec<PeriodicEvaluationMergeRequest>> {
        let non_empty = |values: &[String]| (!values.is_empty()).then(|| values.to_vec());
        let variables = json!({
            "project_topics": non_empty(&filters.project_topics),
            "config_file": filters.config_path(),
            "project_membership": filters.only_project_membership,
            "mr_ignore_labels": non_empty(&filters.ignore_labels),
            "mr_require_labels": non_empty(&filters.require_labels),
        });
        let data: PeriodicEvaluationData = self
            .api
            .graphql(PERIODIC_EVALUATION_QUERY, variables)
            .await
            .context("Cannot list merge requests for periodic evaluation")?;
        Ok(data.into_merge_requests())
    }
}

/// Provides access to a single GitLab project.
pub struct GitlabClient {
    api: Arc<GitlabApi>,
    project: String,
}

impl GitlabClient {
    fn project_path(&self, path: &str) -> String {
        format!("projects/{}/{path}", encode(&self.project))
    }

    fn merge_request_path(&self, mr: MergeRequestNumber, path: &str) -> String {
        if path.is_empty() {
            self.project_path(&format!("merge_requests/{mr}"))
        } else {
            self.project_path(&format!("merge_requests/{mr}/{path}"))
        }
    }
}

#[derive(Deserialize)]
struct GitlabLabel {
    name: String,
    #[serde(default)]
    color: String,
    description: Option<String>,
    priority: Option<i64>,
}

#[derive(Serialize)]
struct LabelBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    color: &'a str,
    description: &'a str,
    priority: Option<i64>,
}

#[derive(Serialize)]
struct MergeRequestUpdateBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    add_labels: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remove_labels: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_event: Option<StateEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    discussion_locked: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    reviewer_ids: Vec<u64>,
}

impl<'a> From<&'a MergeRequestPatch> for MergeRequestUpdateBody<'a> {
    fn from(patch: &'a MergeRequestPatch) -> Self {
        let join = |labels: &[String]| (!labels.is_empty()).then(|| labels.join(","));
        Self {
            add_labels: join(&patch.add_labels),
            remove_labels: join(&patch.remove_labels),
            state_event: patch.state_event,
            discussion_locked: patch.discussion_locked,
            description: patch.description.as_deref(),
            reviewer_ids: patch.reviewer_ids.clone(),
        }
    }
}

#[derive(Deserialize)]
struct GitlabMergeRequestRef {
    iid: u64,
}

fn status_state(state: CommitStatusState) -> &'static str {
    match state {
        CommitStatusState::Running => "running",
        CommitStatusState::Success => "success",
        CommitStatusState::Failed => "failed",
        CommitStatusState::Skipped => "skipped",
    }
}

#[async_trait]
impl LabelClient for GitlabClient {
    async fn list(&self) -> anyhow::Result<Vec<Label>> {
        let mut labels = Vec::new();
        let mut page = "1".to_string();
        loop {
            let request = self
                .api
                .rest(reqwest::Method::GET, &self.project_path("labels"))
                .query(&[
                    ("include_ancestor_groups", "true"),
                    ("per_page", PER_PAGE),
                    ("page", page.as_str()),
                ]);
            let (batch, next_page): (Vec<GitlabLabel>, _) = self
                .api
                .send_json(request)
                .await
                .with_context(|| format!("Cannot list labels of project {}", self.project))?;

            labels.extend(batch.into_iter().map(|label| Label {
                name: label.name,
                color: label.color,
                description: label.description.unwrap_or_default(),
                priority: label.priority,
            }));
            match next_page {
                Some(next) => page = next,
                None => break,
            }
        }
        tracing::debug!("Loaded {} labels from project {}", labels.len(), self.project);
        Ok(labels)
    }

    async fn create(&self, label: &Label) -> Result<(), ScmError> {
        let body = LabelBody {
            name: Some(&label.name),
            color: &label.color,
            description: &label.description,
            priority: label.priority,
        };
        let request = self
            .api
            .rest(reqwest::Method::POST, &self.project_path("labels"))
            .json(&body);
        self.api.send(request).await?;
        Ok(())
    }

    async fn update(&self, label: &Label) -> Result<(), ScmError> {
        let body = LabelBody {
            name: None,
            color: &label.color,
            description: &label.description,
            priority: label.priority,
        };
        let path = self.project_path(&format!("labels/{}", encode(&label.name)));
        let request = self.api.rest(reqwest::Method::PUT, &path).json(&body);
        self.api.send(request).await?;
        Ok(())
    }
}

#[async_trait]
impl MergeRequestClient for GitlabClient {
    async fn update(
        &self,
        mr: MergeRequestNumber,
        patch: &MergeRequestPatch,
    ) -> anyhow::Result<()> {
        let request = self
            .api
            .rest(reqwest::Method::PUT, &self.merge_request_path(mr, ""))
            .json(&MergeRequestUpdateBody::from(patch));
        self.api
            .send(request)
            .await
            .with_context(|| format!("Cannot update merge request {}!{mr}", self.project))?;
        Ok(())
    }

    async fn get_remote_config(&self, path: &str, git_ref: &str) -> Result<String, ScmError> {
        let request = self
            .api
            .rest(
                reqwest::Method::GET,
                &self.project_path(&format!("repository/files/{}/raw", encode(path))),
            )
            .query(&[("ref", git_ref)]);
        let response = self.api.send(request).await?;
        response
            .text()
            .await
            .map_err(|error| ScmError::Other(error.into()))
    }

    async fn list(&self) -> anyhow::Result<Vec<MergeRequestNumber>> {
        let mut numbers = Vec::new();
        let mut page = "1".to_string();
        loop {
            let request = self
                .api
                .rest(reqwest::Method::GET, &self.project_path("merge_requests"))
                .query(&[
                    ("state", "opened"),
                    ("per_page", PER_PAGE),
                    ("page", page.as_str()),
                ]);
            let (batch, next_page): (Vec<GitlabMergeRequestRef>, _) =
                self.api.send_json(request).await.with_context(|| {
                    format!("Cannot list merge requests of project {}", self.project)
                })?;
            numbers.extend(batch.into_iter().map(|mr| MergeRequestNumber(mr.iid)));
            match next_page {
                Some(next) => page = next,
                None => break,
            }
        }
        Ok(numbers)
    }

    async fn comment(&self, mr: MergeRequestNumber, message: &str) -> anyhow::Result<()> {
        let request = self
            .api
            .rest(reqwest::Method::POST, &self.merge_request_path(mr, "notes"))
            .json(&json!({ "body": message }));
        self.api
            .send(request)
            .await
            .with_context(|| format!("Cannot comment on merge request {}!{mr}", self.project))?;
        Ok(())
    }

    async fn approve(&self, mr: MergeRequestNumber) -> anyhow::Result<()> {
        let request = self
            .api
            .rest(reqwest::Method::POST, &self.merge_request_path(mr, "approve"));
        self.api
            .send(request)
            .await
            .with_context(|| format!("Cannot approve merge request {}!{mr}", self.project))?;
        Ok(())
    }

    async fn unapprove(&self, mr: MergeRequestNumber) -> anyhow::Result<()> {
        let request = self
            .api
            .rest(reqwest::Method::POST, &self.merge_request_path(mr, "unapprove"));
        self.api
            .send(request)
            .await
            .with_context(|| format!("Cannot unapprove merge request {}!{mr}", self.project))?;
        Ok(())
    }
}

#[async_trait]
impl ScmClient for GitlabClient {
    fn provider(&self) -> Provider {
        Provider::Gitlab
    }

    fn project(&self) -> &str {
        &self.project
    }

    fn supports_label_priority(&self) -> bool {
        true
    }

    fn labels(&self) -> &dyn LabelClient {
        self
    }

    fn merge_requests(&self) -> &dyn MergeRequestClient {
        self
    }

    async fn eval_context(&self, mr: MergeRequestNumber) -> anyhow::Result<Option<EvalContext>> {
        let variables = json!({ "project_id": self.project, "mr_id": mr.to_string() });
        let data: EvalContextData = self
            .api
            .graphql(EVAL_CONTEXT_QUERY, variables)
            .await
            .with_context(|| format!("Cannot load merge request {}!{mr}", self.project))?;
        data.into_eval_context()
    }

    async fn set_commit_status(
        &self,
        sha: &CommitSha,
        status: &CommitStatus,
    ) -> Result<(), ScmError> {
        let body = json!({
            "state": status_state(status.state),
            "name": status.name,
            "description": status.description,
            "target_url": status.target_url,
        });
        let request = self
            .api
            .rest(
                reqwest::Method::POST,
                &self.project_path(&format!("statuses/{sha}")),
            )
            .json(&body);
        self.api.send(request).await?;
        Ok(())
    }
}
