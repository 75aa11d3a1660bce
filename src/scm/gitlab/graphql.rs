//! GraphQL queries used by the GitLab client and the models of their responses.
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::scm::{
    Actor, ApprovalRule, ApprovalRuleKind, Commit, CommitSha, DiffStat, EvalContext, Group,
    MergeRequest, MergeRequestNumber, Note, PeriodicEvaluationMergeRequest, Project,
};

pub const EVAL_CONTEXT_QUERY: &str = r#"
query ($project_id: ID!, $mr_id: String!) {
  currentUser { id username publicEmail bot }
  project(fullPath: $project_id) {
    id
    name
    fullPath
    topics
    repository { rootRef }
    group { id name fullPath }
    mergeRequest(iid: $mr_id) {
      id
      iid
      title
      description
      state
      draft
      mergeable
      conflicts
      divergedFromTargetBranch
      shouldBeRebased
      sourceBranch
      targetBranch
      diffHeadSha
      approved
      createdAt
      updatedAt
      author { id username publicEmail bot }
      labels(first: 200) { nodes { title } }
      reviewers { nodes { id username publicEmail bot } }
      assignees { nodes { id username publicEmail bot } }
      notes(last: 100) {
        nodes { body createdAt updatedAt author { id username publicEmail bot } }
      }
      diffStats { path additions deletions }
      firstCommits: commits(first: 1) { nodes { sha title authorEmail committedDate } }
      lastCommits: commits(last: 1) { nodes { sha title authorEmail committedDate } }
      approvalState {
        rules { name type section eligibleApprovers { id username publicEmail bot } }
      }
    }
  }
}
"#;

pub const PERIODIC_EVALUATION_QUERY: &str = r#"
query (
  $project_topics: [String!],
  $config_file: String!,
  $project_membership: Boolean,
  $mr_ignore_labels: [String!],
  $mr_require_labels: [String!]
) {
  projects(
    first: 100
    membership: $project_membership
    withMergeRequestsEnabled: true
    topics: $project_topics
  ) {
    nodes {
      fullPath
      repository { blobs(paths: [$config_file]) { nodes { path rawBlob } } }
      mergeRequests(
        first: 100
        state: opened
        not: { labels: $mr_ignore_labels }
        labels: $mr_require_labels
        sort: UPDATED_ASC
      ) {
        nodes { iid diffHeadSha headPipeline { status } }
      }
    }
  }
}
"#;

pub const PROJECT_FILES_QUERY: &str = r#"
query ($project: ID!, $ref: String = "HEAD", $files: [String!]!) {
  project(fullPath: $project) {
    repository {
      blobs(paths: $files, ref: $ref, first: 100) { nodes { path rawBlob } }
    }
  }
}
"#;

#[derive(Debug, Deserialize)]
pub struct GraphqlResponse<T> {
    pub data: Option<T>,
    #[serde(default)]
    pub errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
pub struct GraphqlError {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct Nodes<T> {
    #[serde(default = "Vec::new")]
    pub nodes: Vec<T>,
}

impl<T> Default for Nodes<T> {
    fn default() -> Self {
        Self { nodes: vec![] }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserNode {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub username: String,
    pub public_email: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

impl From<UserNode> for Actor {
    fn from(user: UserNode) -> Self {
        Actor {
            id: user.id,
            username: user.username,
            email: user.public_email.filter(|email| !email.is_empty()),
            is_bot: user.bot,
        }
    }
}

fn actors(users: Nodes<UserNode>) -> Vec<Actor> {
    users.nodes.into_iter().map(Actor::from).collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalContextData {
    pub current_user: Option<UserNode>,
    pub project: Option<ProjectNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectNode {
    id: String,
    name: String,
    full_path: String,
    #[serde(default)]
    topics: Vec<String>,
    repository: Option<RepositoryNode>,
    group: Option<GroupNode>,
    merge_request: Option<MergeRequestNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryNode {
    root_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupNode {
    id: String,
    name: String,
    full_path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MergeRequestNode {
    id: String,
    iid: String,
    title: String,
    description: Option<String>,
    state: String,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    mergeable: bool,
    #[serde(default)]
    conflicts: bool,
    #[serde(default)]
    diverged_from_target_branch: bool,
    #[serde(default)]
    should_be_rebased: bool,
    source_branch: String,
    target_branch: String,
    diff_head_sha: Option<String>,
    #[serde(default)]
    approved: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    author: Option<UserNode>,
    #[serde(default)]
    labels: Nodes<LabelNode>,
    #[serde(default)]
    reviewers: Nodes<UserNode>,
    #[serde(default)]
    assignees: Nodes<UserNode>,
    #[serde(default)]
    notes: Nodes<NoteNode>,
    diff_stats: Option<Vec<DiffStatNode>>,
    #[serde(default)]
    first_commits: Nodes<CommitNode>,
    #[serde(default)]
    last_commits: Nodes<CommitNode>,
    approval_state: Option<ApprovalStateNode>,
}

#[derive(Debug, Deserialize)]
struct LabelNode {
    title: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NoteNode {
    #[serde(default)]
    body: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    author: Option<UserNode>,
}

#[derive(Debug, Deserialize)]
struct DiffStatNode {
    path: String,
    #[serde(default)]
    additions: u64,
    #[serde(default)]
    deletions: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitNode {
    sha: String,
    #[serde(default)]
    title: String,
    author_email: Option<String>,
    committed_date: DateTime<Utc>,
}

impl From<CommitNode> for Commit {
    fn from(commit: CommitNode) -> Self {
        Commit {
            sha: CommitSha(commit.sha),
            title: commit.title,
            author_email: commit.author_email,
            committed_date: commit.committed_date,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApprovalStateNode {
    #[serde(default)]
    rules: Vec<ApprovalRuleNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApprovalRuleNode {
    #[serde(default)]
    name: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    section: Option<String>,
    eligible_approvers: Option<Vec<UserNode>>,
}

impl From<ApprovalRuleNode> for ApprovalRule {
    fn from(rule: ApprovalRuleNode) -> Self {
        let kind = match rule.kind.as_deref() {
            Some("CODE_OWNER") => ApprovalRuleKind::CodeOwner,
            Some("REGULAR") => ApprovalRuleKind::Regular,
            _ => ApprovalRuleKind::Other,
        };
        ApprovalRule {
            name: rule.name,
            kind,
            section: rule.section,
            eligible_approvers: rule
                .eligible_approvers
                .unwrap_or_default()
                .into_iter()
                .map(Actor::from)
                .collect(),
        }
    }
}

impl EvalContextData {
    /// Converts the response into an evaluation context. Returns `None` if the project or the
    /// merge request does not exist.
    pub fn into_eval_context(self) -> anyhow::Result<Option<EvalContext>> {
        let Some(project) = self.project else {
            return Ok(None);
        };
        let Some(mr) = project.merge_request else {
            return Ok(None);
        };

        let merge_request = MergeRequest {
            id: mr.id,
            iid: mr.iid.parse::<MergeRequestNumber>()?,
            title: mr.title,
            description: mr.description,
            state: mr.state.parse()?,
            draft: mr.draft,
            mergeable: mr.mergeable,
            has_conflicts: mr.conflicts,
            diverged_from_target_branch: mr.diverged_from_target_branch,
            should_be_rebased: mr.should_be_rebased,
            source_branch: mr.source_branch,
            target_branch: mr.target_branch,
            sha: CommitSha(mr.diff_head_sha.unwrap_or_default()),
            author: mr.author.map(Actor::from).unwrap_or_default(),
            labels: mr.labels.nodes.into_iter().map(|label| label.title).collect(),
            created_at: mr.created_at,
            updated_at: mr.updated_at,
            notes: mr
                .notes
                .nodes
                .into_iter()
                .map(|note| Note {
                    author: note.author.map(Actor::from).unwrap_or_default(),
                    body: note.body,
                    created_at: note.created_at,
                    updated_at: note.updated_at,
                })
                .collect(),
            diff_stats: mr
                .diff_stats
                .unwrap_or_default()
                .into_iter()
                .map(|stat| DiffStat {
                    path: stat.path,
                    additions: stat.additions,
                    deletions: stat.deletions,
                })
                .collect(),
            first_commit: mr.first_commits.nodes.into_iter().next().map(Commit::from),
            last_commit: mr.last_commits.nodes.into_iter().next().map(Commit::from),
            reviewers: actors(mr.reviewers),
            assignees: actors(mr.assignees),
            approved: mr.approved,
            approval_rules: mr
                .approval_state
                .map(|state| state.rules.into_iter().map(ApprovalRule::from).collect())
                .unwrap_or_default(),
        };

        let group = project.group.map(|group| Group {
            id: group.id,
            name: group.name,
            full_path: group.full_path,
        });
        let project = Project {
            id: project.id,
            name: project.name,
            full_path: project.full_path,
            topics: project.topics,
            default_branch: project
                .repository
                .and_then(|repository| repository.root_ref)
                .unwrap_or_default(),
        };
        let current_user = self.current_user.map(Actor::from).unwrap_or_default();

        Ok(Some(EvalContext::new(
            project,
            group,
            merge_request,
            current_user,
        )))
    }
}

#[derive(Debug, Deserialize)]
pub struct BlobNode {
    pub path: String,
    #[serde(rename = "rawBlob")]
    pub raw_blob: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BlobRepository {
    #[serde(default)]
    pub blobs: Nodes<BlobNode>,
}

#[derive(Debug, Deserialize)]
pub struct ProjectFilesData {
    pub project: Option<ProjectFilesNode>,
}

#[derive(Debug, Deserialize)]
pub struct ProjectFilesNode {
    pub repository: Option<BlobRepository>,
}

#[derive(Debug, Deserialize)]
pub struct PeriodicEvaluationData {
    pub projects: Nodes<PeriodicProjectNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodicProjectNode {
    full_path: String,
    repository: Option<BlobRepository>,
    #[serde(default)]
    merge_requests: Nodes<PeriodicMergeRequestNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeriodicMergeRequestNode {
    iid: String,
    diff_head_sha: Option<String>,
    head_pipeline: Option<PipelineNode>,
}

#[derive(Debug, Deserialize)]
struct PipelineNode {
    status: String,
}

impl PeriodicEvaluationData {
    pub fn into_merge_requests(self) -> Vec<PeriodicEvaluationMergeRequest> {
        tracing::debug!("Found {} projects", self.projects.nodes.len());

        let mut result = Vec::new();
        for project in self.projects.nodes {
            tracing::debug!(
                "Project {} has {} merge requests",
                project.full_path,
                project.merge_requests.nodes.len()
            );
            // The blob is only present if the configuration file exists in the repository.
            let config_blob = project
                .repository
                .and_then(|repository| repository.blobs.nodes.into_iter().next())
                .and_then(|blob| blob.raw_blob);

            for mr in project.merge_requests.nodes {
                let Ok(merge_request) = mr.iid.parse::<MergeRequestNumber>() else {
                    tracing::warn!("Invalid merge request iid {:?}", mr.iid);
                    continue;
                };
                result.push(PeriodicEvaluationMergeRequest {
                    project: project.full_path.clone(),
                    merge_request,
                    sha: CommitSha(mr.diff_head_sha.unwrap_or_default()),
                    config_blob: config_blob.clone(),
                    head_pipeline_status: mr.head_pipeline.map(|pipeline| pipeline.status),
                });
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::scm::MergeRequestState;

    fn user(id: u64, username: &str) -> serde_json::Value {
        json!({
            "id": format!("gid://gitlab/User/{id}"),
            "username": username,
            "publicEmail": "",
            "bot": false
        })
    }

    #[test]
    fn eval_context_from_response() {
        let response = json!({
            "currentUser": user(1, "scm-engine"),
            "project": {
                "id": "gid://gitlab/Project/5",
                "name": "project",
                "fullPath": "group/project",
                "topics": ["rust"],
                "repository": {"rootRef": "main"},
                "group": {"id": "gid://gitlab/Group/2", "name": "group", "fullPath": "group"},
                "mergeRequest": {
                    "id": "gid://gitlab/MergeRequest/99",
                    "iid": "7",
                    "title": "Fix",
                    "description": null,
                    "state": "opened",
                    "draft": false,
                    "mergeable": true,
                    "conflicts": false,
                    "divergedFromTargetBranch": false,
                    "shouldBeRebased": true,
                    "sourceBranch": "fix",
                    "targetBranch": "main",
                    "diffHeadSha": "abc",
                    "approved": false,
                    "createdAt": "2024-05-01T10:00:00Z",
                    "updatedAt": "2024-05-02T10:00:00Z",
                    "author": user(3, "jane"),
                    "labels": {"nodes": [{"title": "bug"}]},
                    "reviewers": {"nodes": [user(4, "bob")]},
                    "assignees": {"nodes": []},
                    "notes": {"nodes": [{
                        "body": "hi",
                        "createdAt": "2024-05-02T09:00:00Z",
                        "updatedAt": "2024-05-02T09:00:00Z",
                        "author": user(4, "bob")
                    }]},
                    "diffStats": [{"path": "src/lib.rs", "additions": 3, "deletions": 1}],
                    "firstCommits": {"nodes": [{"sha": "a", "title": "first", "authorEmail": null, "committedDate": "2024-05-01T10:00:00Z"}]},
                    "lastCommits": {"nodes": [{"sha": "b", "title": "last", "authorEmail": null, "committedDate": "2024-05-02T10:00:00Z"}]},
                    "approvalState": {"rules": [{
                        "name": "owners",
                        "type": "CODE_OWNER",
                        "section": "backend",
                        "eligibleApprovers": [user(5, "alice")]
                    }]}
                }
            }
        });
        let data: EvalContextData = serde_json::from_value(response).unwrap();
        let ctx = data.into_eval_context().unwrap().unwrap();

        assert_eq!(ctx.project.default_branch, "main");
        assert_eq!(ctx.group.as_ref().unwrap().full_path, "group");
        assert_eq!(ctx.current_user.username, "scm-engine");
        let mr = &ctx.merge_request;
        assert_eq!(mr.iid, MergeRequestNumber(7));
        assert_eq!(mr.state, MergeRequestState::Opened);
        assert!(mr.should_be_rebased);
        assert_eq!(mr.labels, vec!["bug"]);
        assert_eq!(mr.author.numeric_id(), Some(3));
        assert_eq!(mr.author.email, None);
        assert_eq!(mr.notes.len(), 1);
        assert_eq!(mr.modified_file_paths(), vec!["src/lib.rs"]);
        assert_eq!(mr.first_commit.as_ref().unwrap().sha.0, "a");
        assert_eq!(mr.approval_rules[0].kind, ApprovalRuleKind::CodeOwner);
        assert_eq!(ctx.code_owners()[0].username, "alice");
    }

    #[test]
    fn missing_merge_request() {
        let data: EvalContextData = serde_json::from_value(json!({
            "currentUser": user(1, "me"),
            "project": {"id": "1", "name": "p", "fullPath": "g/p", "mergeRequest": null}
        }))
        .unwrap();
        assert!(data.into_eval_context().unwrap().is_none());

        let data: EvalContextData =
            serde_json::from_value(json!({"currentUser": null, "project": null})).unwrap();
        assert!(data.into_eval_context().unwrap().is_none());
    }

    #[test]
    fn periodic_merge_requests() {
        let data: PeriodicEvaluationData = serde_json::from_value(json!({
            "projects": {"nodes": [
                {
                    "fullPath": "g/with-config",
                    "repository": {"blobs": {"nodes": [{"path": ".scm-engine.yml", "rawBlob": "label: []"}]}},
                    "mergeRequests": {"nodes": [
                        {"iid": "1", "diffHeadSha": "a", "headPipeline": {"status": "FAILED"}},
                        {"iid": "2", "diffHeadSha": "b", "headPipeline": null}
                    ]}
                },
                {
                    "fullPath": "g/without-config",
                    "repository": {"blobs": {"nodes": []}},
                    "mergeRequests": {"nodes": [{"iid": "3", "diffHeadSha": "c", "headPipeline": null}]}
                }
            ]}
        }))
        .unwrap();

        let mrs = data.into_merge_requests();
        assert_eq!(mrs.len(), 3);
        assert_eq!(mrs[0].config_blob.as_deref(), Some("label: []"));
        assert!(!mrs[0].should_update_pipeline());
        assert!(mrs[1].should_update_pipeline());
        assert_eq!(mrs[2].project, "g/without-config");
        assert_eq!(mrs[2].config_blob, None);
    }
}
