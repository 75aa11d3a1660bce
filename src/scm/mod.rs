//! Contains the provider-agnostic model of merge requests, the client traits used to talk to an
//! SCM platform and the concrete GitLab and GitHub clients.
use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use axum::async_trait;

pub mod context;
pub mod github;
pub mod gitlab;
pub mod pattern;

pub use context::{
    Actor, ApprovalRule, ApprovalRuleKind, Commit, DiffStat, EvalContext, Group, MergeRequest,
    MergeRequestState, Note, Project,
};

/// Name of the external commit status reported by the engine.
pub const PIPELINE_NAME: &str = "scm-engine";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Provider {
    Gitlab,
    Github,
}

impl Display for Provider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::Gitlab => f.write_str("gitlab"),
            Provider::Github => f.write_str("github"),
        }
    }
}

/// Project-scoped number of a merge request (GitLab `iid`, GitHub pull request number).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MergeRequestNumber(pub u64);

impl From<u64> for MergeRequestNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl FromStr for MergeRequestNumber {
    type Err = std::num::ParseIntError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value.trim().parse::<u64>().map(Self)
    }
}

impl Display for MergeRequestNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        <u64 as Display>::fmt(&self.0, f)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitSha(pub String);

impl From<String> for CommitSha {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for CommitSha {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for CommitSha {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Identity of one lockable unit of work.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub provider: Provider,
    pub project: String,
    pub merge_request: MergeRequestNumber,
}

impl ResourceKey {
    pub fn new(provider: Provider, project: &str, merge_request: MergeRequestNumber) -> Self {
        Self {
            provider,
            project: project.to_string(),
            merge_request,
        }
    }
}

impl Display for ResourceKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}!{}", self.provider, self.project, self.merge_request)
    }
}

/// A label as stored in the project's label catalog.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Label {
    pub name: String,
    pub color: String,
    pub description: String,
    pub priority: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateEvent {
    Close,
    Reopen,
}

/// Accumulates every change to the merge request during one evaluation; applied with a single
/// update call at the end.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
pub struct MergeRequestPatch {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub add_labels: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub remove_labels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_event: Option<StateEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discussion_locked: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reviewer_ids: Vec<u64>,
}

impl MergeRequestPatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn add_label(&mut self, name: &str) {
        if !self.add_labels.iter().any(|label| label == name) {
            self.add_labels.push(name.to_string());
        }
    }

    pub fn remove_label(&mut self, name: &str) {
        if !self.remove_labels.iter().any(|label| label == name) {
            self.remove_labels.push(name.to_string());
        }
    }

    pub fn append_reviewer_ids(&mut self, ids: &[u64]) {
        for id in ids {
            if !self.reviewer_ids.contains(id) {
                self.reviewer_ids.push(*id);
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitStatusState {
    Running,
    Success,
    Failed,
    Skipped,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitStatus {
    pub state: CommitStatusState,
    pub name: String,
    pub description: String,
    pub target_url: Option<String>,
}

/// Classified SCM failures. Callers decide per variant whether the failure is benign.
#[derive(thiserror::Error, Debug)]
pub enum ScmError {
    #[error("Resource not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Unknown error ({status}): {text}")]
    Api { status: u16, text: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ScmError {
    /// Classifies an HTTP error response.
    pub fn from_status(status: u16, text: String) -> Self {
        match status {
            404 => ScmError::NotFound(text),
            409 => ScmError::Conflict(text),
            400 => ScmError::BadRequest(text),
            _ => ScmError::Api { status, text },
        }
    }
}

/// Operations on the label catalog of one project.
#[async_trait]
pub trait LabelClient: Send + Sync {
    /// Lists every label of the project, following pagination until there is no next page.
    async fn list(&self) -> anyhow::Result<Vec<Label>>;

    async fn create(&self, label: &Label) -> Result<(), ScmError>;

    async fn update(&self, label: &Label) -> Result<(), ScmError>;
}

/// Operations on the merge requests of one project.
#[async_trait]
pub trait MergeRequestClient: Send + Sync {
    /// Applies the accumulated patch in a single call.
    async fn update(
        &self,
        mr: MergeRequestNumber,
        patch: &MergeRequestPatch,
    ) -> anyhow::Result<()>;

    /// Reads the raw configuration file at `git_ref`.
    async fn get_remote_config(&self, path: &str, git_ref: &str) -> Result<String, ScmError>;

    /// Lists the numbers of all open merge requests.
    async fn list(&self) -> anyhow::Result<Vec<MergeRequestNumber>>;

    async fn comment(&self, mr: MergeRequestNumber, message: &str) -> anyhow::Result<()>;

    async fn approve(&self, mr: MergeRequestNumber) -> anyhow::Result<()>;

    async fn unapprove(&self, mr: MergeRequestNumber) -> anyhow::Result<()>;
}

/// Access to a single project on an SCM platform.
#[async_trait]
pub trait ScmClient: Send + Sync {
    fn provider(&self) -> Provider;

    fn project(&self) -> &str;

    /// Whether the platform stores a priority on labels.
    fn supports_label_priority(&self) -> bool;

    fn labels(&self) -> &dyn LabelClient;

    fn merge_requests(&self) -> &dyn MergeRequestClient;

    /// Builds the evaluation context. Returns `None` if the merge request does not exist.
    async fn eval_context(&self, mr: MergeRequestNumber) -> anyhow::Result<Option<EvalContext>>;

    async fn set_commit_status(&self, sha: &CommitSha, status: &CommitStatus)
        -> Result<(), ScmError>;
}

/// Filters for the periodic sweep query.
#[derive(Clone, Debug, Default)]
pub struct MergeRequestListFilters {
    pub ignore_labels: Vec<String>,
    pub require_labels: Vec<String>,
    pub project_topics: Vec<String>,
    pub only_project_membership: bool,
    pub config_path: String,
}

impl MergeRequestListFilters {
    pub fn config_path(&self) -> &str {
        if self.config_path.is_empty() {
            crate::config::DEFAULT_CONFIG_FILE
        } else {
            &self.config_path
        }
    }
}

/// Head pipeline states for which the sweep does not touch the commit status, to avoid
/// repeated failure notifications.
const SKIP_PIPELINE_UPDATE_STATUSES: &[&str] = &["FAILED", "SKIPPED"];

/// An open merge request found by the periodic sweep.
#[derive(Clone, Debug)]
pub struct PeriodicEvaluationMergeRequest {
    pub project: String,
    pub merge_request: MergeRequestNumber,
    pub sha: CommitSha,
    pub config_blob: Option<String>,
    pub head_pipeline_status: Option<String>,
}

impl PeriodicEvaluationMergeRequest {
    pub fn should_update_pipeline(&self) -> bool {
        self.head_pipeline_status
            .as_deref()
            .map(|status| !SKIP_PIPELINE_UPDATE_STATUSES.contains(&status.to_uppercase().as_str()))
            .unwrap_or(true)
    }
}

/// Account-level access to an SCM platform.
#[async_trait]
pub trait ScmProvider: Send + Sync {
    fn provider(&self) -> Provider;

    /// Returns a client scoped to `project`.
    fn client(&self, project: &str) -> Arc<dyn ScmClient>;

    /// Reads `files` from `project` at `git_ref` (default branch when `None`). Files that do
    /// not exist are absent from the result.
    async fn get_project_files(
        &self,
        project: &str,
        git_ref: Option<&str>,
        files: &[String],
    ) -> anyhow::Result<BTreeMap<String, String>>;

    async fn find_merge_requests_for_periodic_evaluation(
        &self,
        filters: &MergeRequestListFilters,
    ) -> anyhow::Result<Vec<PeriodicEvaluationMergeRequest>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_key_display() {
        let key = ResourceKey::new(Provider::Gitlab, "group/project", 12.into());
        assert_eq!(key.to_string(), "gitlab:group/project!12");
    }

    #[test]
    fn patch_deduplicates_labels() {
        let mut patch = MergeRequestPatch::default();
        assert!(patch.is_empty());
        patch.add_label("bug");
        patch.add_label("bug");
        patch.append_reviewer_ids(&[1, 2, 1]);
        assert_eq!(patch.add_labels, vec!["bug"]);
        assert_eq!(patch.reviewer_ids, vec![1, 2]);
        assert!(!patch.is_empty());
    }

    #[test]
    fn patch_serializes_only_set_fields() {
        let patch = MergeRequestPatch {
            add_labels: vec!["needs-rebase".to_string()],
            state_event: Some(StateEvent::Close),
            ..Default::default()
        };
        insta::assert_snapshot!(
            serde_json::to_string(&patch).unwrap(),
            @r#"{"add_labels":["needs-rebase"],"state_event":"close"}"#
        );
    }

    #[test]
    fn classify_status() {
        assert!(matches!(
            ScmError::from_status(404, String::new()),
            ScmError::NotFound(_)
        ));
        assert!(matches!(
            ScmError::from_status(409, String::new()),
            ScmError::Conflict(_)
        ));
        assert!(matches!(
            ScmError::from_status(500, String::new()),
            ScmError::Api { status: 500, .. }
        ));
    }

    #[test]
    fn periodic_pipeline_update() {
        let mut mr = PeriodicEvaluationMergeRequest {
            project: "a/b".to_string(),
            merge_request: 1.into(),
            sha: CommitSha("abc".to_string()),
            config_blob: None,
            head_pipeline_status: None,
        };
        assert!(mr.should_update_pipeline());
        mr.head_pipeline_status = Some("FAILED".to_string());
        assert!(!mr.should_update_pipeline());
        mr.head_pipeline_status = Some("success".to_string());
        assert!(mr.should_update_pipeline());
    }
}
