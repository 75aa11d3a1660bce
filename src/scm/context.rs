//! The normalized, read-mostly snapshot of a merge request that scripts are evaluated against.
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::{Config, IgnoreActivityFrom};
use crate::scm::pattern::{find_modified_files, PatternError};
use crate::scm::{CommitSha, MergeRequestNumber};

/// A user (or bot) interacting with a merge request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    pub is_bot: bool,
}

impl Actor {
    /// The numeric id used by SCM APIs, if the id is a valid non-zero integer.
    ///
    /// GitLab GraphQL ids (`gid://gitlab/User/123`) are accepted as well.
    pub fn numeric_id(&self) -> Option<u64> {
        let raw = self.id.rsplit('/').next().unwrap_or_default();
        raw.parse::<u64>().ok().filter(|id| *id != 0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MergeRequestState {
    #[default]
    Opened,
    Closed,
    Locked,
    Merged,
}

impl MergeRequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeRequestState::Opened => "opened",
            MergeRequestState::Closed => "closed",
            MergeRequestState::Locked => "locked",
            MergeRequestState::Merged => "merged",
        }
    }
}

impl FromStr for MergeRequestState {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "opened" | "open" => Ok(MergeRequestState::Opened),
            "closed" => Ok(MergeRequestState::Closed),
            "locked" => Ok(MergeRequestState::Locked),
            "merged" => Ok(MergeRequestState::Merged),
            _ => Err(anyhow::anyhow!("unknown state value: {value:?}")),
        }
    }
}

impl Display for MergeRequestState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A comment or system note on the merge request.
#[derive(Clone, Debug)]
pub struct Note {
    pub author: Actor,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct Commit {
    pub sha: CommitSha,
    pub title: String,
    pub author_email: Option<String>,
    pub committed_date: DateTime<Utc>,
}

#[derive(Clone, Debug, Default)]
pub struct DiffStat {
    pub path: String,
    pub additions: u64,
    pub deletions: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ApprovalRuleKind {
    CodeOwner,
    #[default]
    Regular,
    Other,
}

#[derive(Clone, Debug, Default)]
pub struct ApprovalRule {
    pub name: String,
    pub kind: ApprovalRuleKind,
    pub section: Option<String>,
    pub eligible_approvers: Vec<Actor>,
}

#[derive(Clone, Debug, Default)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub full_path: String,
    pub topics: Vec<String>,
    pub default_branch: String,
}

#[derive(Clone, Debug, Default)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub full_path: String,
}

#[derive(Clone, Debug, Default)]
pub struct MergeRequest {
    pub id: String,
    pub iid: MergeRequestNumber,
    pub title: String,
    pub description: Option<String>,
    pub state: MergeRequestState,
    pub draft: bool,
    pub mergeable: bool,
    pub has_conflicts: bool,
    pub diverged_from_target_branch: bool,
    pub should_be_rebased: bool,
    pub source_branch: String,
    pub target_branch: String,
    pub sha: CommitSha,
    pub author: Actor,
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub notes: Vec<Note>,
    pub diff_stats: Vec<DiffStat>,
    pub first_commit: Option<Commit>,
    pub last_commit: Option<Commit>,
    pub reviewers: Vec<Actor>,
    pub assignees: Vec<Actor>,
    pub approved: bool,
    pub approval_rules: Vec<ApprovalRule>,
}

impl MergeRequest {
    pub fn has_label(&self, name: &str) -> bool {
        self.labels.iter().any(|label| label == name)
    }

    /// Returns true if the state is any of `states`. Unknown state names are an error.
    pub fn state_is<S: AsRef<str>>(&self, states: &[S]) -> anyhow::Result<bool> {
        let mut matched = false;
        for state in states {
            let state: MergeRequestState = state.as_ref().parse()?;
            matched |= state == self.state;
        }
        Ok(matched)
    }

    /// Any activity within `within`: an update of the MR itself, a recent commit or a note from an
    /// actor that is not ignored.
    pub fn has_any_activity_within(
        &self,
        within: Duration,
        ignore: &IgnoreActivityFrom,
        now: DateTime<Utc>,
    ) -> bool {
        if is_within(self.updated_at, within, now) {
            return true;
        }
        if self
            .last_commit
            .as_ref()
            .is_some_and(|commit| is_within(commit.committed_date, within, now))
        {
            return true;
        }
        self.notes
            .iter()
            .filter(|note| !ignore.matches(&note.author))
            .any(|note| is_within(note.updated_at, within, now))
    }

    /// Activity by humans within `within`. Bots, ignored actors and `current_user` do not count,
    /// and updates of the MR itself are not considered since they may come from automation.
    pub fn has_user_activity_within(
        &self,
        within: Duration,
        ignore: &IgnoreActivityFrom,
        current_user: &Actor,
        now: DateTime<Utc>,
    ) -> bool {
        let note_activity = self
            .notes
            .iter()
            .filter(|note| !ignore.matches(&note.author))
            .filter(|note| !note.author.is_bot)
            .filter(|note| note.author.username != current_user.username)
            .any(|note| is_within(note.updated_at, within, now));
        if note_activity {
            return true;
        }

        self.last_commit
            .as_ref()
            .is_some_and(|commit| is_within(commit.committed_date, within, now))
    }

    pub fn modified_file_paths(&self) -> Vec<&str> {
        self.diff_stats.iter().map(|stat| stat.path.as_str()).collect()
    }

    /// Changed files matching any of the gitignore-style `patterns`.
    pub fn modified_files_list<P: AsRef<str>>(
        &self,
        patterns: &[P],
    ) -> Result<Vec<String>, PatternError> {
        find_modified_files(&self.modified_file_paths(), patterns)
    }

    pub fn modified_files<P: AsRef<str>>(&self, patterns: &[P]) -> Result<bool, PatternError> {
        Ok(!self.modified_files_list(patterns)?.is_empty())
    }

    pub fn time_since_first_commit(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.first_commit
            .as_ref()
            .and_then(|commit| (now - commit.committed_date).to_std().ok())
    }

    pub fn time_since_last_commit(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_commit
            .as_ref()
            .and_then(|commit| (now - commit.committed_date).to_std().ok())
    }

    pub fn time_between_first_and_last_commit(&self) -> Option<Duration> {
        let first = self.first_commit.as_ref()?;
        let last = self.last_commit.as_ref()?;
        (last.committed_date - first.committed_date).to_std().ok()
    }
}

fn is_within(timestamp: DateTime<Utc>, within: Duration, now: DateTime<Utc>) -> bool {
    match (now - timestamp).to_std() {
        Ok(elapsed) => elapsed < within,
        // Timestamps in the future count as recent.
        Err(_) => true,
    }
}

/// Normalized view of one merge request and its project, used as the script environment.
#[derive(Clone, Debug, Default)]
pub struct EvalContext {
    pub project: Project,
    pub group: Option<Group>,
    pub merge_request: MergeRequest,
    /// The user the engine acts as.
    pub current_user: Actor,
    webhook_event: Option<serde_json::Value>,
    config: Option<Arc<Config>>,
}

impl EvalContext {
    pub fn new(
        project: Project,
        group: Option<Group>,
        merge_request: MergeRequest,
        current_user: Actor,
    ) -> Self {
        Self {
            project,
            group,
            merge_request,
            current_user,
            webhook_event: None,
            config: None,
        }
    }

    pub fn set_webhook_event(&mut self, event: serde_json::Value) {
        self.webhook_event = Some(event);
    }

    pub fn webhook_event(&self) -> Option<&serde_json::Value> {
        self.webhook_event.as_ref()
    }

    /// Stores a back-reference to the config so predicates can consult its ignore lists.
    pub fn set_config(&mut self, config: Arc<Config>) {
        self.config = Some(config);
    }

    pub fn config(&self) -> Option<&Arc<Config>> {
        self.config.as_ref()
    }

    pub fn ignore_activity_from(&self) -> IgnoreActivityFrom {
        self.config
            .as_ref()
            .map(|config| config.ignore_activity_from.clone())
            .unwrap_or_default()
    }

    pub fn description(&self) -> &str {
        self.merge_request.description.as_deref().unwrap_or_default()
    }

    /// A configuration file on the MR branch is only trusted while the branch is up to date
    /// with its target.
    pub fn can_use_configuration_file_from_change_request(&self) -> bool {
        if self.merge_request.diverged_from_target_branch {
            tracing::warn!(
                "The merge request branch has diverged from the target branch; using the configuration from the target branch"
            );
            return false;
        }
        if self.merge_request.should_be_rebased {
            tracing::warn!(
                "The merge request branch is not up to date with the target branch; using the configuration from the target branch"
            );
            return false;
        }
        true
    }

    /// Evaluation failures may only fail the pipeline when the configuration file itself is
    /// what the MR changes.
    pub fn allow_pipeline_failure(&self, config_path: &str) -> bool {
        self.merge_request
            .modified_files_list(&[config_path])
            .map(|files| files.len() == 1)
            .unwrap_or(false)
    }

    /// Code owners eligible to review, de-duplicated and without bots, in rule order.
    pub fn code_owners(&self) -> Vec<Actor> {
        let mut owners: Vec<Actor> = Vec::new();
        for rule in &self.merge_request.approval_rules {
            if rule.kind != ApprovalRuleKind::CodeOwner {
                continue;
            }
            if rule.eligible_approvers.is_empty() {
                tracing::debug!(
                    "No eligible approvers for rule {}; ensure the users are direct members of the project",
                    rule.name
                );
                continue;
            }
            for approver in &rule.eligible_approvers {
                if approver.is_bot || owners.iter().any(|owner| owner.id == approver.id) {
                    continue;
                }
                owners.push(approver.clone());
            }
        }
        owners
    }

    pub fn reviewers(&self) -> &[Actor] {
        &self.merge_request.reviewers
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::tests::fixtures::{actor, MergeRequestBuilder};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn note(author: Actor, hours_ago: i64) -> Note {
        let at = now() - chrono::Duration::hours(hours_ago);
        Note {
            author,
            body: "hello".to_string(),
            created_at: at,
            updated_at: at,
        }
    }

    fn old_merge_request(notes: Vec<Note>) -> MergeRequest {
        MergeRequestBuilder::default()
            .updated_at(now() - chrono::Duration::days(30))
            .notes(notes)
            .build()
            .unwrap()
            .into()
    }

    #[test]
    fn numeric_id() {
        let mut actor = actor("jane");
        actor.id = "42".to_string();
        assert_eq!(actor.numeric_id(), Some(42));
        actor.id = "gid://gitlab/User/7".to_string();
        assert_eq!(actor.numeric_id(), Some(7));
        actor.id = "0".to_string();
        assert_eq!(actor.numeric_id(), None);
        actor.id = "abc".to_string();
        assert_eq!(actor.numeric_id(), None);
    }

    #[test]
    fn state_is_checks_names() {
        let mr: MergeRequest = MergeRequestBuilder::default().build().unwrap().into();
        assert!(mr.state_is(&["opened"]).unwrap());
        assert!(mr.state_is(&["merged", "opened"]).unwrap());
        assert!(!mr.state_is(&["closed"]).unwrap());
        assert!(mr.state_is(&["bogus"]).is_err());
    }

    #[test]
    fn activity_from_recent_note() {
        let mr = old_merge_request(vec![note(actor("jane"), 2)]);
        let ignore = IgnoreActivityFrom::default();
        assert!(mr.has_any_activity_within(Duration::from_secs(3 * 3600), &ignore, now()));
        assert!(!mr.has_any_activity_within(Duration::from_secs(3600), &ignore, now()));
    }

    #[test]
    fn activity_ignores_configured_actors() {
        let mr = old_merge_request(vec![note(actor("renovate"), 1)]);
        let ignore = IgnoreActivityFrom {
            usernames: vec!["renovate".to_string()],
            ..Default::default()
        };
        assert!(!mr.has_any_activity_within(Duration::from_secs(7200), &ignore, now()));
    }

    #[test]
    fn user_activity_ignores_bots_and_self() {
        let mut bot = actor("ci-bot");
        bot.is_bot = true;
        let mr = old_merge_request(vec![note(bot, 1), note(actor("scm-engine"), 1)]);
        let ignore = IgnoreActivityFrom::default();
        let me = actor("scm-engine");
        assert!(!mr.has_user_activity_within(Duration::from_secs(7200), &ignore, &me, now()));
        assert!(mr.has_any_activity_within(Duration::from_secs(7200), &ignore, now()));
    }

    #[test]
    fn allow_pipeline_failure_only_for_config_change() {
        let only_config: MergeRequest = MergeRequestBuilder::default()
            .files(vec![".scm-engine.yml".to_string()])
            .build()
            .unwrap()
            .into();
        let ctx = EvalContext::new(Default::default(), None, only_config, actor("me"));
        assert!(ctx.allow_pipeline_failure(".scm-engine.yml"));

        let unrelated: MergeRequest = MergeRequestBuilder::default()
            .files(vec!["src/main.rs".to_string()])
            .build()
            .unwrap()
            .into();
        let ctx = EvalContext::new(Default::default(), None, unrelated, actor("me"));
        assert!(!ctx.allow_pipeline_failure(".scm-engine.yml"));
    }

    #[test]
    fn code_owners_are_deduplicated_without_bots() {
        let mut bot = actor("bot");
        bot.is_bot = true;
        let rules = vec![
            ApprovalRule {
                name: "backend".to_string(),
                kind: ApprovalRuleKind::CodeOwner,
                section: None,
                eligible_approvers: vec![actor("alice"), bot, actor("bob")],
            },
            ApprovalRule {
                name: "all".to_string(),
                kind: ApprovalRuleKind::Regular,
                section: None,
                eligible_approvers: vec![actor("carol")],
            },
            ApprovalRule {
                name: "frontend".to_string(),
                kind: ApprovalRuleKind::CodeOwner,
                section: None,
                eligible_approvers: vec![actor("bob")],
            },
        ];
        let mr: MergeRequest = MergeRequestBuilder::default()
            .approval_rules(rules)
            .build()
            .unwrap()
            .into();
        let ctx = EvalContext::new(Default::default(), None, mr, actor("me"));
        let owners: Vec<String> = ctx.code_owners().into_iter().map(|a| a.username).collect();
        assert_eq!(owners, vec!["alice", "bob"]);
    }

    #[test]
    fn commit_durations() {
        let first = Commit {
            sha: CommitSha("a".to_string()),
            title: "first".to_string(),
            author_email: None,
            committed_date: now() - chrono::Duration::days(3),
        };
        let last = Commit {
            committed_date: now() - chrono::Duration::days(1),
            ..first.clone()
        };
        let mr = MergeRequest {
            first_commit: Some(first),
            last_commit: Some(last),
            ..Default::default()
        };
        assert_eq!(
            mr.time_since_last_commit(now()),
            Some(Duration::from_secs(86_400))
        );
        assert_eq!(
            mr.time_between_first_and_last_commit(),
            Some(Duration::from_secs(2 * 86_400))
        );
    }
}
