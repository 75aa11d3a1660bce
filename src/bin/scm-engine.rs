use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

use scm_engine::config::{Config, DEFAULT_CONFIG_FILE};
use scm_engine::engine::{
    process_merge_request, start_periodic_evaluation, BackstageCatalog, EngineContext,
    EvaluationState, PeriodicEvaluation,
};
use scm_engine::scm::github::GithubProvider;
use scm_engine::scm::gitlab::GitlabProvider;
use scm_engine::scm::{
    CommitSha, MergeRequestListFilters, MergeRequestNumber, Provider, ScmProvider,
};
use scm_engine::server::{create_app, ServerState, WebhookSettings};
use scm_engine::utils::duration::parse_duration;
use scm_engine::utils::logging::init_logging;
use scm_engine::utils::text::pluralize;

const DEFAULT_GITLAB_URL: &str = "https://gitlab.com";

#[derive(clap::Parser)]
#[command(
    version,
    about = "Keeps merge request labels, state and reviewers in sync with rules"
)]
struct Opts {
    #[command(flatten)]
    global: GlobalOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct GlobalOpts {
    /// Path to the rule document.
    #[arg(
        long,
        env = "SCM_ENGINE_CONFIG_FILE",
        default_value = DEFAULT_CONFIG_FILE,
        global = true
    )]
    config: String,

    #[arg(
        long,
        env = "SCM_ENGINE_PROVIDER",
        value_enum,
        default_value_t = Provider::Gitlab,
        global = true
    )]
    provider: Provider,

    /// API token used to talk to the SCM platform.
    #[arg(long, env = "SCM_ENGINE_TOKEN", hide_env_values = true, global = true)]
    api_token: Option<String>,

    /// Base URL of the SCM platform, e.g. https://gitlab.example.com.
    #[arg(long, env = "SCM_ENGINE_BASE_URL", global = true)]
    base_url: Option<String>,

    /// Backstage instance used to resolve project owners.
    #[arg(long, env = "BACKSTAGE_URL", global = true)]
    backstage_url: Option<String>,

    #[arg(long, env = "BACKSTAGE_TOKEN", hide_env_values = true, global = true)]
    backstage_token: Option<String>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Evaluate merge requests once and exit.
    Evaluate(EvaluateOpts),
    /// Receive webhooks and optionally re-evaluate open merge requests periodically.
    Server(ServerOpts),
    /// Validate the rule document without contacting the SCM platform.
    Lint,
}

#[derive(clap::Args)]
struct EvaluateOpts {
    /// Project path, e.g. `group/project` or `owner/repository`.
    #[arg(long, env = "SCM_ENGINE_PROJECT")]
    project: String,

    /// Merge request to evaluate. Takes precedence over the positional ids.
    #[arg(long, env = "SCM_ENGINE_ID")]
    id: Option<u64>,

    /// Head commit of the merge request, used for the commit status.
    #[arg(long, env = "SCM_ENGINE_COMMIT_SHA")]
    commit: Option<String>,

    #[arg(long, env = "SCM_ENGINE_DRY_RUN")]
    dry_run: bool,

    #[arg(long, env = "SCM_ENGINE_UPDATE_PIPELINE")]
    update_pipeline: bool,

    #[arg(long, env = "SCM_ENGINE_UPDATE_PIPELINE_URL")]
    update_pipeline_url: Option<String>,

    /// Merge request ids, or `all` for every open merge request.
    ids: Vec<String>,
}

#[derive(clap::Args)]
struct ServerOpts {
    #[arg(long, env = "SCM_ENGINE_LISTEN_HOST", default_value = "0.0.0.0")]
    listen_host: std::net::IpAddr,

    #[arg(long, env = "SCM_ENGINE_LISTEN_PORT", default_value_t = 3000)]
    listen_port: u16,

    /// Time budget of one webhook evaluation, in seconds.
    #[arg(long, env = "SCM_ENGINE_TIMEOUT", default_value_t = 10)]
    timeout: u64,

    /// Shared secret expected in the X-Gitlab-Token header.
    #[arg(long, env = "SCM_ENGINE_WEBHOOK_SECRET", hide_env_values = true)]
    webhook_secret: Option<String>,

    /// Interval between sweeps over all open merge requests, e.g. `1h`. `0` disables the sweep.
    #[arg(
        long,
        env = "SCM_ENGINE_PERIODIC_EVALUATION_INTERVAL",
        default_value = "0",
        value_parser = parse_duration
    )]
    periodic_evaluation_interval: Duration,

    #[arg(
        long,
        env = "SCM_ENGINE_PERIODIC_EVALUATION_IGNORE_MR_LABELS",
        value_delimiter = ','
    )]
    periodic_evaluation_ignore_mr_labels: Vec<String>,

    #[arg(
        long,
        env = "SCM_ENGINE_PERIODIC_EVALUATION_REQUIRE_MR_LABELS",
        value_delimiter = ','
    )]
    periodic_evaluation_require_mr_labels: Vec<String>,

    #[arg(
        long,
        env = "SCM_ENGINE_PERIODIC_EVALUATION_PROJECT_TOPICS",
        value_delimiter = ','
    )]
    periodic_evaluation_project_topics: Vec<String>,

    /// Only sweep projects the token user is a member of.
    #[arg(
        long,
        env = "SCM_ENGINE_PERIODIC_EVALUATION_ONLY_PROJECT_MEMBERSHIP",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    periodic_evaluation_only_project_membership: bool,

    #[arg(long, env = "SCM_ENGINE_UPDATE_PIPELINE")]
    update_pipeline: bool,

    #[arg(long, env = "SCM_ENGINE_UPDATE_PIPELINE_URL")]
    update_pipeline_url: Option<String>,

    #[arg(long, env = "SCM_ENGINE_DRY_RUN")]
    dry_run: bool,
}

fn build_provider(opts: &GlobalOpts) -> anyhow::Result<Arc<dyn ScmProvider>> {
    let token = opts
        .api_token
        .clone()
        .map(SecretString::new)
        .with_context(|| format!("Missing API token for the {} provider", opts.provider))?;

    let provider: Arc<dyn ScmProvider> = match opts.provider {
        Provider::Gitlab => {
            let base_url = opts.base_url.as_deref().unwrap_or(DEFAULT_GITLAB_URL);
            Arc::new(GitlabProvider::new(base_url, token)?)
        }
        Provider::Github => Arc::new(GithubProvider::new(opts.base_url.as_deref(), token)?),
    };
    Ok(provider)
}

fn build_context(opts: &GlobalOpts) -> anyhow::Result<EngineContext> {
    let ctx = EngineContext::new(build_provider(opts)?);
    match &opts.backstage_url {
        Some(url) => {
            let token = opts.backstage_token.clone().map(SecretString::new);
            let catalog = BackstageCatalog::new(url, token)?;
            Ok(ctx.with_catalog(Arc::new(catalog)))
        }
        None => Ok(ctx),
    }
}

async fn evaluate(global: GlobalOpts, opts: EvaluateOpts) -> anyhow::Result<()> {
    let (path, config) = Config::load_local(&global.config)?;
    tracing::info!("Using configuration file {}", path.display());
    let ctx = build_context(&global)?;

    let targets: Vec<(MergeRequestNumber, Option<CommitSha>)> = if let Some(id) = opts.id {
        vec![(MergeRequestNumber(id), opts.commit.clone().map(CommitSha))]
    } else if opts.ids.first().map(String::as_str) == Some("all") {
        let client = ctx.provider.client(&opts.project);
        client
            .merge_requests()
            .list()
            .await?
            .into_iter()
            .map(|mr| (mr, None))
            .collect()
    } else if opts.ids.is_empty() {
        anyhow::bail!("Missing merge request id, pass --id or a list of ids");
    } else {
        opts.ids
            .iter()
            .map(|id| {
                let number = id
                    .parse::<u64>()
                    .with_context(|| format!("Invalid merge request id {id:?}"))?;
                Ok((MergeRequestNumber(number), opts.commit.clone().map(CommitSha)))
            })
            .collect::<anyhow::Result<_>>()?
    };

    for (merge_request, commit_sha) in targets {
        let state = EvaluationState {
            commit_sha,
            dry_run: opts.dry_run,
            update_pipeline: opts.update_pipeline,
            update_pipeline_url: opts.update_pipeline_url.clone(),
            config_path: global.config.clone(),
            ..EvaluationState::new(&opts.project, merge_request)
        };
        process_merge_request(&ctx, state, Some(config.clone())).await?;
    }
    Ok(())
}

async fn server(global: GlobalOpts, opts: ServerOpts) -> anyhow::Result<()> {
    let ctx = Arc::new(build_context(&global)?);

    let settings = WebhookSettings {
        webhook_secret: opts.webhook_secret.map(SecretString::new),
        config_path: global.config.clone(),
        timeout: Duration::from_secs(opts.timeout),
        dry_run: opts.dry_run,
        update_pipeline: opts.update_pipeline,
        update_pipeline_url: opts.update_pipeline_url.clone(),
    };
    let app = create_app(ServerState::new(ctx.clone(), settings));

    let periodic = PeriodicEvaluation {
        interval: opts.periodic_evaluation_interval,
        filters: MergeRequestListFilters {
            ignore_labels: opts.periodic_evaluation_ignore_mr_labels,
            require_labels: opts.periodic_evaluation_require_mr_labels,
            project_topics: opts.periodic_evaluation_project_topics,
            only_project_membership: opts.periodic_evaluation_only_project_membership,
            config_path: global.config,
        },
        dry_run: opts.dry_run,
        update_pipeline: opts.update_pipeline,
        update_pipeline_url: opts.update_pipeline_url,
    };
    let cancel = CancellationToken::new();
    let sweep = start_periodic_evaluation(ctx, periodic, cancel.clone());
    let sweep_process = async move {
        if let Some(sweep) = sweep {
            sweep.await;
            tracing::info!("Periodic evaluation has ended");
        }
    };

    let addr = SocketAddr::new(opts.listen_host, opts.listen_port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Cannot listen on {addr}"))?;
    tracing::info!("Listening on {addr}");

    let server_process = async move {
        let res = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                if let Err(error) = tokio::signal::ctrl_c().await {
                    tracing::error!("Cannot listen for shutdown signal: {error:?}");
                }
                tracing::info!("Shutting down");
            })
            .await;
        tracing::warn!("Server has ended: {res:?}");
        // A sweep in progress finishes, no new sweep starts.
        cancel.cancel();
        res
    };

    let (res, ()) = tokio::join!(server_process, sweep_process);
    res.context("Server failed")
}

fn lint(global: &GlobalOpts) -> anyhow::Result<()> {
    let config = Config::load_file(Path::new(&global.config))?;
    let problems = config.lint(&scm_engine::script::ScriptEngine::new());
    if problems.is_empty() {
        tracing::info!("{} is valid", global.config);
        return Ok(());
    }
    for problem in &problems {
        tracing::error!("{problem}");
    }
    anyhow::bail!("{}", lint_summary(&global.config, problems.len()))
}

fn lint_summary(path: &str, count: usize) -> String {
    format!("{path} has {count} {}", pluralize("problem", count))
}

fn try_main(opts: Opts) -> anyhow::Result<()> {
    if let Command::Lint = opts.command {
        return lint(&opts.global);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Cannot build tokio runtime")?;

    runtime.block_on(async move {
        match opts.command {
            Command::Evaluate(evaluate_opts) => evaluate(opts.global, evaluate_opts).await,
            Command::Server(server_opts) => server(opts.global, server_opts).await,
            Command::Lint => Ok(()),
        }
    })
}

fn main() {
    init_logging();

    let opts = Opts::parse();
    if let Err(error) = try_main(opts) {
        eprintln!("Error: {error:?}");
        std::process::exit(1);
    }
}
