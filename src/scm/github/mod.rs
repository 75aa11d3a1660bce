//! GitHub client built on octocrab. Pull requests play the role of merge requests.
//!
//! GitHub has no batched query for the periodic sweep and no code owner approval rules, so both
//! are reported as unsupported or empty.
use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use axum::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use http::StatusCode;
use octocrab::Octocrab;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::scm::{
    Actor, Commit, CommitSha, CommitStatus, CommitStatusState, DiffStat, EvalContext, Group,
    Label, LabelClient, MergeRequest, MergeRequestClient, MergeRequestListFilters,
    MergeRequestNumber, MergeRequestPatch, MergeRequestState, Note,
    PeriodicEvaluationMergeRequest, Project, Provider, ScmClient, ScmError, ScmProvider,
    StateEvent,
};

const PER_PAGE: usize = 100;

fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn split_repository(project: &str) -> anyhow::Result<(&str, &str)> {
    project
        .split_once('/')
        .filter(|(owner, name)| !owner.is_empty() && !name.is_empty() && !name.contains('/'))
        .ok_or_else(|| {
            anyhow::anyhow!("GitHub repository must be in the form owner/name, got {project:?}")
        })
}

/// Classifies an error response. GitHub answers 422 when a label already exists.
fn classify(status: StatusCode, text: String) -> ScmError {
    if status == StatusCode::UNPROCESSABLE_ENTITY && text.contains("already_exists") {
        return ScmError::Conflict(text);
    }
    ScmError::from_status(status.as_u16(), text)
}

fn decode<T: DeserializeOwned>(text: &str) -> anyhow::Result<T> {
    serde_json::from_str(text).context("Cannot deserialize GitHub response")
}

enum Verb {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

/// Authenticated access to the GitHub REST API.
struct GithubApi {
    client: Octocrab,
}

impl GithubApi {
    async fn call(
        &self,
        verb: Verb,
        route: String,
        body: Option<&Value>,
    ) -> Result<String, ScmError> {
        let response = match verb {
            Verb::Get => self.client._get(route).await,
            Verb::Post => self.client._post(route, body).await,
            Verb::Put => self.client._put(route, body).await,
            Verb::Patch => self.client._patch(route, body).await,
            Verb::Delete => self.client._delete(route, body).await,
        }
        .map_err(|error| ScmError::Other(error.into()))?;

        let status = response.status();
        let text = self
            .client
            .body_to_string(response)
            .await
            .unwrap_or_default();
        if status.is_success() {
            Ok(text)
        } else {
            Err(classify(status, text))
        }
    }

    async fn get<T: DeserializeOwned>(&self, route: String) -> Result<T, ScmError> {
        let text = self.call(Verb::Get, route, None).await?;
        Ok(decode(&text)?)
    }

    /// Reads a file through the contents API. Returns `None` if it does not exist.
    async fn file(
        &self,
        repository: &str,
        path: &str,
        git_ref: Option<&str>,
    ) -> Result<Option<String>, ScmError> {
        let mut route = format!("/repos/{repository}/contents/{}", encode_path(path));
        if let Some(git_ref) = git_ref {
            route.push_str(&format!("?ref={}", encode(git_ref)));
        }
        let content: GithubContent = match self.get(route).await {
            Ok(content) => content,
            Err(ScmError::NotFound(_)) => return Ok(None),
            Err(error) => return Err(error),
        };
        let encoded: String = content
            .content
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|error| ScmError::Other(error.into()))?;
        let text = String::from_utf8(bytes).map_err(|error| ScmError::Other(error.into()))?;
        Ok(Some(text))
    }
}

/// Encodes every segment of a repository path, keeping the separators.
fn encode_path(path: &str) -> String {
    path.split('/').map(encode).collect::<Vec<_>>().join("/")
}

/// Provides access to all repositories visible to the configured token.
pub struct GithubProvider {
    api: Arc<GithubApi>,
}

impl GithubProvider {
    pub fn new(base_url: Option<&str>, token: SecretString) -> anyhow::Result<Self> {
        let mut builder = Octocrab::builder().personal_token(token.expose_secret().clone());
        if let Some(base_url) = base_url.filter(|url| !url.is_empty()) {
            builder = builder
                .base_uri(base_url)
                .context("Invalid GitHub base URL")?;
        }
        let client = builder.build().context("Cannot create GitHub client")?;
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: Octocrab) -> Self {
        Self {
            api: Arc::new(GithubApi { client }),
        }
    }
}

#[async_trait]
impl ScmProvider for GithubProvider {
    fn provider(&self) -> Provider {
        Provider::Github
    }

    fn client(&self, project: &str) -> Arc<dyn ScmClient> {
        Arc::new(GithubClient {
            api: self.api.clone(),
            repository: project.to_string(),
        })
    }

    async fn get_project_files(
        &self,
        project: &str,
        git_ref: Option<&str>,
        files: &[String],
    ) -> anyhow::Result<BTreeMap<String, String>> {
        split_repository(project)?;
        let contents = try_join_all(files.iter().map(|file| async move {
            let content = self
                .api
                .file(project, file, git_ref)
                .await
                .with_context(|| format!("Cannot read {file} from repository {project}"))?;
            anyhow::Ok(content.map(|content| (file.clone(), content)))
        }))
        .await?;
        Ok(contents.into_iter().flatten().collect())
    }

    async fn find_merge_requests_for_periodic_evaluation(
        &self,
        _filters: &MergeRequestListFilters,
    ) -> anyhow::Result<Vec<PeriodicEvaluationMergeRequest>> {
        anyhow::bail!("Periodic evaluation is not supported by the GitHub provider")
    }
}

/// Provides access to a single GitHub repository.
pub struct GithubClient {
    api: Arc<GithubApi>,
    repository: String,
}

impl GithubClient {
    fn route(&self, path: &str) -> String {
        format!("/repos/{}/{path}", self.repository)
    }

    async fn current_user(&self) -> anyhow::Result<GithubUser> {
        self.api
            .get(String::from("/user"))
            .await
            .context("Cannot load the authenticated GitHub user")
    }

    /// Reads every page of a list endpoint.
    async fn list_all<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, ScmError> {
        let separator = if path.contains('?') { '&' } else { '?' };
        let mut items = Vec::new();
        for page in 1.. {
            let route = self.route(&format!("{path}{separator}per_page={PER_PAGE}&page={page}"));
            let batch: Vec<T> = self.api.get(route).await?;
            let done = batch.len() < PER_PAGE;
            items.extend(batch);
            if done {
                break;
            }
        }
        Ok(items)
    }
}

#[derive(Debug, Deserialize)]
struct GithubContent {
    #[serde(default)]
    content: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct GithubUser {
    id: u64,
    login: String,
    #[serde(rename = "type", default)]
    kind: String,
}

impl From<GithubUser> for Actor {
    fn from(user: GithubUser) -> Self {
        Actor {
            id: user.id.to_string(),
            username: user.login,
            email: None,
            is_bot: user.kind == "Bot",
        }
    }
}

#[derive(Debug, Deserialize)]
struct GithubLabel {
    name: String,
    #[serde(default)]
    color: String,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GithubBranch {
    #[serde(rename = "ref")]
    name: String,
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GithubPullRequest {
    id: u64,
    number: u64,
    #[serde(default)]
    title: String,
    body: Option<String>,
    state: String,
    merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    draft: bool,
    mergeable: Option<bool>,
    mergeable_state: Option<String>,
    head: GithubBranch,
    base: GithubBranch,
    user: Option<GithubUser>,
    #[serde(default)]
    labels: Vec<GithubLabel>,
    #[serde(default)]
    requested_reviewers: Vec<GithubUser>,
    #[serde(default)]
    assignees: Vec<GithubUser>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl GithubPullRequest {
    fn merge_request_state(&self) -> MergeRequestState {
        if self.merged_at.is_some() {
            MergeRequestState::Merged
        } else if self.state == "closed" {
            MergeRequestState::Closed
        } else {
            MergeRequestState::Opened
        }
    }
}

#[derive(Debug, Deserialize)]
struct GithubFile {
    filename: String,
    #[serde(default)]
    additions: u64,
    #[serde(default)]
    deletions: u64,
}

#[derive(Debug, Deserialize)]
struct GithubCommit {
    sha: String,
    commit: GithubCommitDetail,
}

#[derive(Debug, Deserialize)]
struct GithubCommitDetail {
    #[serde(default)]
    message: String,
    author: Option<GithubSignature>,
    committer: Option<GithubSignature>,
}

#[derive(Debug, Deserialize)]
struct GithubSignature {
    email: Option<String>,
    date: Option<DateTime<Utc>>,
}

impl GithubCommit {
    fn into_commit(self) -> Option<Commit> {
        let committed_date = self
            .commit
            .committer
            .as_ref()
            .and_then(|committer| committer.date)
            .or_else(|| self.commit.author.as_ref().and_then(|author| author.date))?;
        Some(Commit {
            sha: CommitSha(self.sha),
            title: self.commit.message.lines().next().unwrap_or_default().to_string(),
            author_email: self.commit.author.and_then(|author| author.email),
            committed_date,
        })
    }
}

#[derive(Debug, Deserialize)]
struct GithubComment {
    #[serde(default)]
    body: String,
    user: Option<GithubUser>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct GithubReview {
    id: u64,
    user: Option<GithubUser>,
    state: String,
}

#[derive(Debug, Deserialize)]
struct GithubRepository {
    id: u64,
    name: String,
    full_name: String,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    default_branch: String,
    owner: GithubUser,
}

#[derive(Debug, Deserialize)]
struct GithubPullRequestRef {
    number: u64,
}

fn status_state(state: CommitStatusState) -> &'static str {
    match state {
        CommitStatusState::Running => "pending",
        CommitStatusState::Success | CommitStatusState::Skipped => "success",
        CommitStatusState::Failed => "failure",
    }
}

#[async_trait]
impl LabelClient for GithubClient {
    async fn list(&self) -> anyhow::Result<Vec<Label>> {
        let labels: Vec<GithubLabel> = self
            .list_all("labels")
            .await
            .with_context(|| format!("Cannot list labels of repository {}", self.repository))?;
        Ok(labels
            .into_iter()
            .map(|label| Label {
                name: label.name,
                color: format!("#{}", label.color),
                description: label.description.unwrap_or_default(),
                priority: None,
            })
            .collect())
    }

    async fn create(&self, label: &Label) -> Result<(), ScmError> {
        let body = json!({
            "name": label.name,
            "color": label.color.trim_start_matches('#'),
            "description": label.description,
        });
        self.api
            .call(Verb::Post, self.route("labels"), Some(&body))
            .await?;
        Ok(())
    }

    async fn update(&self, label: &Label) -> Result<(), ScmError> {
        let body = json!({
            "color": label.color.trim_start_matches('#'),
            "description": label.description,
        });
        let route = self.route(&format!("labels/{}", encode(&label.name)));
        self.api.call(Verb::Patch, route, Some(&body)).await?;
        Ok(())
    }
}

#[async_trait]
impl MergeRequestClient for GithubClient {
    async fn update(
        &self,
        mr: MergeRequestNumber,
        patch: &MergeRequestPatch,
    ) -> anyhow::Result<()> {
        if !patch.add_labels.is_empty() {
            let body = json!({ "labels": patch.add_labels });
            self.api
                .call(Verb::Post, self.route(&format!("issues/{mr}/labels")), Some(&body))
                .await
                .with_context(|| format!("Cannot add labels to pull request #{mr}"))?;
        }

        // The API only removes labels one by one.
        for label in &patch.remove_labels {
            let route = self.route(&format!("issues/{mr}/labels/{}", encode(label)));
            match self.api.call(Verb::Delete, route, None).await {
                Ok(_) => {}
                Err(ScmError::NotFound(_)) => {
                    tracing::trace!("Label {label} is not present on pull request #{mr}");
                }
                Err(error) => {
                    return Err(error)
                        .with_context(|| format!("Cannot remove label {label} from #{mr}"))
                }
            }
        }

        let mut edit = serde_json::Map::new();
        if let Some(event) = patch.state_event {
            let state = match event {
                StateEvent::Close => "closed",
                StateEvent::Reopen => "open",
            };
            edit.insert("state".to_string(), json!(state));
        }
        if let Some(description) = &patch.description {
            edit.insert("body".to_string(), json!(description));
        }
        if !edit.is_empty() {
            self.api
                .call(
                    Verb::Patch,
                    self.route(&format!("pulls/{mr}")),
                    Some(&Value::Object(edit)),
                )
                .await
                .with_context(|| format!("Cannot update pull request #{mr}"))?;
        }

        if let Some(locked) = patch.discussion_locked {
            let verb = if locked { Verb::Put } else { Verb::Delete };
            self.api
                .call(verb, self.route(&format!("issues/{mr}/lock")), None)
                .await
                .with_context(|| format!("Cannot change the lock of pull request #{mr}"))?;
        }

        if !patch.reviewer_ids.is_empty() {
            tracing::warn!(
                "GitHub requests reviewers by login, dropping reviewer ids {:?} for #{mr}",
                patch.reviewer_ids
            );
        }
        Ok(())
    }

    async fn get_remote_config(&self, path: &str, git_ref: &str) -> Result<String, ScmError> {
        self.api
            .file(&self.repository, path, Some(git_ref))
            .await?
            .ok_or_else(|| ScmError::NotFound(format!("{path} at {git_ref}")))
    }

    async fn list(&self) -> anyhow::Result<Vec<MergeRequestNumber>> {
        let pulls: Vec<GithubPullRequestRef> = self
            .list_all("pulls?state=open")
            .await
            .with_context(|| format!("Cannot list pull requests of {}", self.repository))?;
        Ok(pulls
            .into_iter()
            .map(|pull| MergeRequestNumber(pull.number))
            .collect())
    }

    async fn comment(&self, mr: MergeRequestNumber, message: &str) -> anyhow::Result<()> {
        let body = json!({ "body": message });
        self.api
            .call(Verb::Post, self.route(&format!("issues/{mr}/comments")), Some(&body))
            .await
            .with_context(|| format!("Cannot comment on pull request #{mr}"))?;
        Ok(())
    }

    async fn approve(&self, mr: MergeRequestNumber) -> anyhow::Result<()> {
        let body = json!({ "event": "APPROVE" });
        self.api
            .call(Verb::Post, self.route(&format!("pulls/{mr}/reviews")), Some(&body))
            .await
            .with_context(|| format!("Cannot approve pull request #{mr}"))?;
        Ok(())
    }

    /// Dismisses every approval previously given by the authenticated user.
    async fn unapprove(&self, mr: MergeRequestNumber) -> anyhow::Result<()> {
        let me = self.current_user().await?;
        let reviews: Vec<GithubReview> = self
            .list_all(&format!("pulls/{mr}/reviews"))
            .await
            .with_context(|| format!("Cannot list reviews of pull request #{mr}"))?;

        let body = json!({ "message": "Approval withdrawn" });
        for review in reviews {
            let mine = review.user.as_ref().is_some_and(|user| user.id == me.id);
            if !mine || review.state != "APPROVED" {
                continue;
            }
            let route = self.route(&format!("pulls/{mr}/reviews/{}/dismissals", review.id));
            self.api
                .call(Verb::Put, route, Some(&body))
                .await
                .with_context(|| format!("Cannot dismiss review {} on #{mr}", review.id))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ScmClient for GithubClient {
    fn provider(&self) -> Provider {
        Provider::Github
    }

    fn project(&self) -> &str {
        &self.repository
    }

    fn supports_label_priority(&self) -> bool {
        false
    }

    fn labels(&self) -> &dyn LabelClient {
        self
    }

    fn merge_requests(&self) -> &dyn MergeRequestClient {
        self
    }

    async fn eval_context(&self, mr: MergeRequestNumber) -> anyhow::Result<Option<EvalContext>> {
        split_repository(&self.repository)?;
        let pull: GithubPullRequest = match self.api.get(self.route(&format!("pulls/{mr}"))).await
        {
            Ok(pull) => pull,
            Err(ScmError::NotFound(_)) => return Ok(None),
            Err(error) => {
                return Err(error).with_context(|| format!("Cannot load pull request #{mr}"))
            }
        };
        let repository: GithubRepository = self
            .api
            .get(format!("/repos/{}", self.repository))
            .await
            .with_context(|| format!("Cannot load repository {}", self.repository))?;
        let files: Vec<GithubFile> = self
            .list_all(&format!("pulls/{mr}/files"))
            .await
            .context("Cannot list changed files")?;
        let commits: Vec<GithubCommit> = self
            .list_all(&format!("pulls/{mr}/commits"))
            .await
            .context("Cannot list commits")?;
        let comments: Vec<GithubComment> = self
            .list_all(&format!("issues/{mr}/comments"))
            .await
            .context("Cannot list comments")?;
        let reviews: Vec<GithubReview> = self
            .list_all(&format!("pulls/{mr}/reviews"))
            .await
            .context("Cannot list reviews")?;
        let current_user = self.current_user().await?;

        let state = pull.merge_request_state();
        let mergeable_state = pull.mergeable_state.as_deref().unwrap_or_default();
        let mut commits = commits.into_iter().filter_map(GithubCommit::into_commit);
        let first_commit = commits.next();
        let last_commit = commits.last().or_else(|| first_commit.clone());

        let merge_request = MergeRequest {
            id: pull.id.to_string(),
            iid: MergeRequestNumber(pull.number),
            title: pull.title,
            description: pull.body,
            state,
            draft: pull.draft,
            mergeable: pull.mergeable.unwrap_or(false),
            has_conflicts: mergeable_state == "dirty",
            diverged_from_target_branch: false,
            should_be_rebased: mergeable_state == "behind",
            source_branch: pull.head.name,
            target_branch: pull.base.name,
            sha: CommitSha(pull.head.sha),
            author: pull.user.map(Actor::from).unwrap_or_default(),
            labels: pull.labels.into_iter().map(|label| label.name).collect(),
            created_at: pull.created_at,
            updated_at: pull.updated_at,
            notes: comments
                .into_iter()
                .map(|comment| Note {
                    author: comment.user.map(Actor::from).unwrap_or_default(),
                    body: comment.body,
                    created_at: comment.created_at,
                    updated_at: comment.updated_at,
                })
                .collect(),
            diff_stats: files
                .into_iter()
                .map(|file| DiffStat {
                    path: file.filename,
                    additions: file.additions,
                    deletions: file.deletions,
                })
                .collect(),
            first_commit,
            last_commit,
            reviewers: pull
                .requested_reviewers
                .into_iter()
                .map(Actor::from)
                .collect(),
            assignees: pull.assignees.into_iter().map(Actor::from).collect(),
            approved: reviews.iter().any(|review| review.state == "APPROVED"),
            approval_rules: vec![],
        };

        let group = Group {
            id: repository.owner.id.to_string(),
            name: repository.owner.login.clone(),
            full_path: repository.owner.login,
        };
        let project = Project {
            id: repository.id.to_string(),
            name: repository.name,
            full_path: repository.full_name,
            topics: repository.topics,
            default_branch: repository.default_branch,
        };
        Ok(Some(EvalContext::new(
            project,
            Some(group),
            merge_request,
            current_user.into(),
        )))
    }

    async fn set_commit_status(
        &self,
        sha: &CommitSha,
        status: &CommitStatus,
    ) -> Result<(), ScmError> {
        let body = json!({
            "state": status_state(status.state),
            "context": status.name,
            "description": status.description,
            "target_url": status.target_url,
        });
        self.api
            .call(Verb::Post, self.route(&format!("statuses/{sha}")), Some(&body))
            .await?;
        Ok(())
    }
}
