use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::async_trait;

use crate::scm::{
    CommitSha, CommitStatus, EvalContext, Label, LabelClient, MergeRequestClient,
    MergeRequestListFilters, MergeRequestNumber, MergeRequestPatch, PeriodicEvaluationMergeRequest,
    Provider, ScmClient, ScmError, ScmProvider, StateEvent,
};
use crate::tests::fixtures::default_project_path;

/// Every side effect the engine asked the mock to perform.
#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    CreateLabel(String),
    UpdateLabel(String),
    UpdateMergeRequest(MergeRequestNumber, MergeRequestPatch),
    Comment(MergeRequestNumber, String),
    Approve(MergeRequestNumber),
    Unapprove(MergeRequestNumber),
    SetStatus(CommitStatus),
}

/// In-memory SCM project that records calls and applies patches to its stored merge requests.
pub struct MockScm {
    project: String,
    pub supports_priority: bool,
    labels: Mutex<Vec<Label>>,
    merge_requests: Mutex<HashMap<MergeRequestNumber, EvalContext>>,
    remote_configs: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<Call>>,
    label_lists: AtomicUsize,
    conflict_on_create: AtomicBool,
    status_failure: Mutex<Option<u16>>,
    eval_context_delay: Option<Duration>,
}

impl Default for MockScm {
    fn default() -> Self {
        Self {
            project: default_project_path(),
            supports_priority: true,
            labels: Default::default(),
            merge_requests: Default::default(),
            remote_configs: Default::default(),
            calls: Default::default(),
            label_lists: AtomicUsize::new(0),
            conflict_on_create: AtomicBool::new(false),
            status_failure: Mutex::new(None),
            eval_context_delay: None,
        }
    }
}

impl MockScm {
    pub fn with_label(self, label: Label) -> Self {
        self.labels.lock().unwrap().push(label);
        self
    }

    pub fn with_merge_request(self, ctx: EvalContext) -> Self {
        self.merge_requests
            .lock()
            .unwrap()
            .insert(ctx.merge_request.iid, ctx);
        self
    }

    /// Serves `content` as the configuration file at `git_ref`.
    pub fn with_remote_config(self, git_ref: &str, content: &str) -> Self {
        self.remote_configs
            .lock()
            .unwrap()
            .insert(git_ref.to_string(), content.to_string());
        self
    }

    /// Creating a label answers with a conflict, as if another process created it first.
    pub fn conflict_on_create(self) -> Self {
        self.conflict_on_create.store(true, Ordering::SeqCst);
        self
    }

    /// Building the evaluation context takes `delay`, simulating a slow SCM.
    pub fn with_eval_context_delay(mut self, delay: Duration) -> Self {
        self.eval_context_delay = Some(delay);
        self
    }

    pub fn fail_status_with(self, status: u16) -> Self {
        *self.status_failure.lock().unwrap() = Some(status);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn label_catalog(&self) -> Vec<Label> {
        self.labels.lock().unwrap().clone()
    }

    pub fn label_lists(&self) -> usize {
        self.label_lists.load(Ordering::SeqCst)
    }

    pub fn merge_request(&self, iid: u64) -> Option<EvalContext> {
        self.merge_requests
            .lock()
            .unwrap()
            .get(&MergeRequestNumber(iid))
            .cloned()
    }

    pub fn statuses(&self) -> Vec<CommitStatus> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::SetStatus(status) => Some(status),
                _ => None,
            })
            .collect()
    }

    pub fn patches(&self) -> Vec<MergeRequestPatch> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::UpdateMergeRequest(_, patch) => Some(patch),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl LabelClient for MockScm {
    async fn list(&self) -> anyhow::Result<Vec<Label>> {
        self.label_lists.fetch_add(1, Ordering::SeqCst);
        Ok(self.labels.lock().unwrap().clone())
    }

    async fn create(&self, label: &Label) -> Result<(), ScmError> {
        self.record(Call::CreateLabel(label.name.clone()));
        let mut labels = self.labels.lock().unwrap();
        if self.conflict_on_create.load(Ordering::SeqCst) {
            labels.push(label.clone());
            return Err(ScmError::Conflict("Label already exists".to_string()));
        }
        labels.push(label.clone());
        Ok(())
    }

    async fn update(&self, label: &Label) -> Result<(), ScmError> {
        self.record(Call::UpdateLabel(label.name.clone()));
        let mut labels = self.labels.lock().unwrap();
        match labels.iter_mut().find(|existing| existing.name == label.name) {
            Some(existing) => {
                *existing = label.clone();
                Ok(())
            }
            None => Err(ScmError::NotFound(label.name.clone())),
        }
    }
}

#[async_trait]
impl MergeRequestClient for MockScm {
    async fn update(
        &self,
        mr: MergeRequestNumber,
        patch: &MergeRequestPatch,
    ) -> anyhow::Result<()> {
        self.record(Call::UpdateMergeRequest(mr, patch.clone()));
        if let Some(ctx) = self.merge_requests.lock().unwrap().get_mut(&mr) {
            let stored = &mut ctx.merge_request;
            stored
                .labels
                .retain(|label| !patch.remove_labels.contains(label));
            for label in &patch.add_labels {
                if !stored.labels.contains(label) {
                    stored.labels.push(label.clone());
                }
            }
            if let Some(description) = &patch.description {
                stored.description = Some(description.clone());
            }
            match patch.state_event {
                Some(StateEvent::Close) => stored.state = crate::scm::MergeRequestState::Closed,
                Some(StateEvent::Reopen) => stored.state = crate::scm::MergeRequestState::Opened,
                None => {}
            }
        }
        Ok(())
    }

    async fn get_remote_config(&self, path: &str, git_ref: &str) -> Result<String, ScmError> {
        self.remote_configs
            .lock()
            .unwrap()
            .get(git_ref)
            .cloned()
            .ok_or_else(|| ScmError::NotFound(format!("{path}@{git_ref}")))
    }

    async fn list(&self) -> anyhow::Result<Vec<MergeRequestNumber>> {
        let mut numbers: Vec<_> = self.merge_requests.lock().unwrap().keys().copied().collect();
        numbers.sort();
        Ok(numbers)
    }

    async fn comment(&self, mr: MergeRequestNumber, message: &str) -> anyhow::Result<()> {
        self.record(Call::Comment(mr, message.to_string()));
        Ok(())
    }

    async fn approve(&self, mr: MergeRequestNumber) -> anyhow::Result<()> {
        self.record(Call::Approve(mr));
        Ok(())
    }

    async fn unapprove(&self, mr: MergeRequestNumber) -> anyhow::Result<()> {
        self.record(Call::Unapprove(mr));
        Ok(())
    }
}

#[async_trait]
impl ScmClient for MockScm {
    fn provider(&self) -> Provider {
        Provider::Gitlab
    }

    fn project(&self) -> &str {
        &self.project
    }

    fn supports_label_priority(&self) -> bool {
        self.supports_priority
    }

    fn labels(&self) -> &dyn LabelClient {
        self
    }

    fn merge_requests(&self) -> &dyn MergeRequestClient {
        self
    }

    async fn eval_context(&self, mr: MergeRequestNumber) -> anyhow::Result<Option<EvalContext>> {
        if let Some(delay) = self.eval_context_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.merge_requests.lock().unwrap().get(&mr).cloned())
    }

    async fn set_commit_status(
        &self,
        _sha: &CommitSha,
        status: &CommitStatus,
    ) -> Result<(), ScmError> {
        self.record(Call::SetStatus(status.clone()));
        match *self.status_failure.lock().unwrap() {
            Some(code) => Err(ScmError::from_status(code, "status rejected".to_string())),
            None => Ok(()),
        }
    }
}

/// Account-level mock serving included files and periodic sweep results.
#[derive(Default)]
pub struct MockProvider {
    pub client: Arc<MockScm>,
    files: HashMap<(String, String), String>,
    periodic: Vec<PeriodicEvaluationMergeRequest>,
    pub periodic_queries: AtomicUsize,
}

impl MockProvider {
    pub fn with_client(mut self, client: MockScm) -> Self {
        self.client = Arc::new(client);
        self
    }

    pub fn with_file(mut self, project: &str, path: &str, content: &str) -> Self {
        self.files
            .insert((project.to_string(), path.to_string()), content.to_string());
        self
    }

    pub fn with_periodic(mut self, mr: PeriodicEvaluationMergeRequest) -> Self {
        self.periodic.push(mr);
        self
    }
}

#[async_trait]
impl ScmProvider for MockProvider {
    fn provider(&self) -> Provider {
        Provider::Gitlab
    }

    fn client(&self, _project: &str) -> Arc<dyn ScmClient> {
        self.client.clone()
    }

    async fn get_project_files(
        &self,
        project: &str,
        _git_ref: Option<&str>,
        files: &[String],
    ) -> anyhow::Result<BTreeMap<String, String>> {
        Ok(files
            .iter()
            .filter_map(|file| {
                self.files
                    .get(&(project.to_string(), file.clone()))
                    .map(|content| (file.clone(), content.clone()))
            })
            .collect())
    }

    async fn find_merge_requests_for_periodic_evaluation(
        &self,
        _filters: &MergeRequestListFilters,
    ) -> anyhow::Result<Vec<PeriodicEvaluationMergeRequest>> {
        self.periodic_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.periodic.clone())
    }
}
