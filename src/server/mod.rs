//! HTTP surface: the GitLab webhook receiver and a static liveness endpoint.
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use secrecy::SecretString;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::Instrument;

use crate::engine::{load_remote_config, process_merge_request, EngineContext, EvaluationState};
use crate::scm::ScmError;

mod error;
pub mod webhook;

pub use error::AppError;
use webhook::{GitlabWebhook, WebhookMergeRequest};

pub const STATUS_BODY: &str =
    "scm-engine status: OK\n\nNOTE: this is a static 'OK', no actual checks are being made";

/// How webhook-triggered evaluations are run.
#[derive(Debug)]
pub struct WebhookSettings {
    pub webhook_secret: Option<SecretString>,
    pub config_path: String,
    /// Bounds the whole evaluation of one webhook, including SCM calls.
    pub timeout: Duration,
    pub dry_run: bool,
    pub update_pipeline: bool,
    pub update_pipeline_url: Option<String>,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            webhook_secret: None,
            config_path: crate::config::DEFAULT_CONFIG_FILE.to_string(),
            timeout: Duration::from_secs(10),
            dry_run: false,
            update_pipeline: false,
            update_pipeline_url: None,
        }
    }
}

/// Shared server state for all axum handlers.
pub struct ServerState {
    ctx: Arc<EngineContext>,
    settings: WebhookSettings,
}

impl ServerState {
    pub fn new(ctx: Arc<EngineContext>, settings: WebhookSettings) -> Self {
        Self { ctx, settings }
    }

    pub fn webhook_secret(&self) -> Option<&SecretString> {
        self.settings.webhook_secret.as_ref()
    }
}

pub type ServerStateRef = Arc<ServerState>;

pub fn create_app(state: ServerState) -> Router {
    Router::new()
        .route("/", post(gitlab_webhook_handler))
        .route("/gitlab", post(gitlab_webhook_handler))
        .route("/_status", get(status_handler))
        .layer(ConcurrencyLimitLayer::new(100))
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(Arc::new(state))
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    tracing::error!("Router panicked: {err:?}");
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
}

async fn status_handler() -> impl IntoResponse {
    tracing::debug!("GET /_status");
    (StatusCode::OK, STATUS_BODY)
}

/// Evaluates the merge request a webhook refers to.
///
/// Evaluation failures still answer 200 so that GitLab does not retry or disable the hook; the
/// body carries the error text.
pub async fn gitlab_webhook_handler(
    State(state): State<ServerStateRef>,
    webhook: GitlabWebhook,
) -> Result<Response, AppError> {
    let target = match webhook.event_type.as_str() {
        "merge_request" => webhook.object_attributes.clone(),
        "note" => webhook.merge_request.clone(),
        other => return Err(anyhow::anyhow!("unknown event type: {other}").into()),
    };
    let Some(target) = target else {
        tracing::info!(
            "Ignoring {} event without a merge request",
            webhook.event_type
        );
        return Ok((StatusCode::OK, "No merge request in event").into_response());
    };

    let span = tracing::info_span!(
        "Webhook",
        event_type = webhook.event_type.as_str(),
        project = webhook.project.as_str(),
        mr = target.iid
    );
    let timeout = state.settings.timeout;
    let outcome = tokio::time::timeout(timeout, evaluate_webhook(&state, &webhook, &target))
        .instrument(span.clone())
        .await;

    let body = span.in_scope(|| match outcome {
        Ok(Ok(())) => "OK".to_string(),
        Ok(Err(error)) => {
            if is_not_found(&error) {
                tracing::info!("Webhook evaluation finished: {error:#}");
            } else {
                tracing::error!("Webhook evaluation failed: {error:?}");
            }
            format!("{error:#}")
        }
        Err(_) => {
            tracing::error!("Webhook evaluation timed out after {timeout:?}");
            format!("evaluation timed out after {timeout:?}")
        }
    });
    Ok((StatusCode::OK, body).into_response())
}

async fn evaluate_webhook(
    state: &ServerState,
    webhook: &GitlabWebhook,
    target: &WebhookMergeRequest,
) -> anyhow::Result<()> {
    let settings = &state.settings;
    let commit_sha = target.commit_sha();

    let config = match &commit_sha {
        Some(sha) => {
            let client = state.ctx.provider.client(&webhook.project);
            let config =
                load_remote_config(client.as_ref(), &settings.config_path, sha.as_ref()).await?;
            Some(config)
        }
        None => None,
    };

    let evaluation = EvaluationState {
        project: webhook.project.clone(),
        merge_request: target.number(),
        commit_sha,
        dry_run: settings.dry_run,
        update_pipeline: settings.update_pipeline,
        update_pipeline_url: settings.update_pipeline_url.clone(),
        config_path: settings.config_path.clone(),
        webhook_event: Some(webhook.payload.clone()),
        seed: None,
    };
    process_merge_request(&state.ctx, evaluation, config).await
}

/// Missing resources are reported to the caller but are not worth an error log.
fn is_not_found(error: &anyhow::Error) -> bool {
    error
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<ScmError>(), Some(ScmError::NotFound(_))))
}
