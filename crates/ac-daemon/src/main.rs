//! autocrew daemon — wires the control plane together and drives one
//! instruction end to end.
//!
//! Usage: `ac-daemon <project.json> "<instruction>" [settings.toml]`
//!
//! The project descriptor is the JSON contract produced by the operator
//! tooling. The daemon builds the adapter registry, process runner, bus,
//! git manager and agents, submits the instruction, dispatches the first
//! wave of eligible sub-tasks, and keeps the monitor and auto-scaler
//! running until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;

use ac_adapters::local::LocalAdapter;
use ac_adapters::ollama::OllamaAdapter;
use ac_adapters::{Adapter, AdapterRegistry};
use ac_agents::decomposer::ProjectContext;
use ac_agents::{ManagerAgent, ManagerConfig, MergerAgent, MergerConfig};
use ac_agents::backlog::BacklogStore;
use ac_bus::MessageBus;
use ac_core::ids;
use ac_core::settings::Settings;
use ac_core::shutdown::ShutdownSignal;
use ac_core::types::{ParentTask, ProjectDescriptor};
use ac_core::workspace::WorkspaceManager;
use ac_git::{GitManager, TokioProcessRunner};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(project_path) = args.next() else {
        bail!("usage: ac-daemon <project.json> \"<instruction>\" [settings.toml]");
    };
    let Some(instruction) = args.next() else {
        bail!("usage: ac-daemon <project.json> \"<instruction>\" [settings.toml]");
    };
    let settings_path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("autocrew.toml"));

    let settings = Settings::load(&settings_path)
        .with_context(|| format!("loading settings from {}", settings_path.display()))?
        .with_env_overrides();

    let project: ProjectDescriptor = serde_json::from_str(
        &std::fs::read_to_string(&project_path)
            .with_context(|| format!("reading project descriptor {}", project_path))?,
    )
    .context("parsing project descriptor")?;

    info!(project = %project.id, "autocrew daemon starting");

    // Adapter registry is built once here and injected everywhere.
    let mut registry = AdapterRegistry::new();
    let adapter: Arc<dyn Adapter> = match settings.adapter.kind.as_str() {
        "local" => Arc::new(LocalAdapter::new(
            settings.adapter.endpoint.clone(),
            settings.adapter.model.clone(),
        )),
        _ => Arc::new(OllamaAdapter::new(
            settings.adapter.endpoint.clone(),
            settings.adapter.model.clone(),
        )),
    };
    registry.register(adapter.clone());
    if !adapter.is_available().await {
        tracing::warn!(
            endpoint = %settings.adapter.endpoint,
            "model backend unreachable; decomposition will fail until it is up"
        );
    }

    let runtime_root = PathBuf::from(&settings.paths.runtime_root);
    let bus = MessageBus::with_runtime_root(&runtime_root);
    let backlog = BacklogStore::new(&settings.paths.backlog_dir);
    let workspaces = WorkspaceManager::new(&settings.paths.work_root);

    let runner = Arc::new(TokioProcessRunner);
    let git = Arc::new(GitManager::new(runner, &runtime_root));

    let mut manager_config = ManagerConfig::default();
    manager_config.pool.min_workers = settings.pool.min_workers;
    manager_config.pool.max_workers = settings.pool.max_workers;
    let manager = Arc::new(ManagerAgent::new(
        manager_config,
        registry.default_adapter()?,
        bus.clone(),
        backlog,
        &runtime_root,
    ));

    let _merger = MergerAgent::new(
        git.clone(),
        registry.default_adapter()?,
        &runtime_root,
        MergerConfig {
            integration_branch: settings.merge.integration_branch.clone(),
        },
    );

    // Clone the repository into the project workspace when it is not
    // there yet.
    let work_dir = workspaces.allocate(&project.id)?;
    let bootstrap_run = ids::run_id();
    if !work_dir.join(".git").exists() {
        info!(url = %project.git_url, dir = %work_dir.display(), "cloning project");
        git.clone_repo(&bootstrap_run, &project.git_url, &work_dir)
            .await
            .context("cloning project repository")?;
    }

    // Submit the instruction.
    let task = ParentTask::new(ids::task_id(), &project.id, &instruction);
    let task = manager.receive_task(task).await?;

    let mut context = ProjectContext::new(&project.id);
    context.notes = Some(format!(
        "default branch: {}, integration branch: {}",
        project.default_branch, project.integration_branch
    ));
    let outcome = manager.decompose_task(&task.id, &context).await?;
    info!(
        parent = %outcome.parent_id,
        sub_tasks = outcome.sub_tasks.len(),
        tokens = outcome.tokens,
        "instruction decomposed"
    );

    // First wave: whatever is eligible and has an idle worker. The
    // auto-scaler grows the pool for the rest.
    let assigned = manager.dispatch_pending().await;
    info!(assigned = assigned.len(), "initial dispatch done");

    let run_id = ids::run_id();
    manager.clone().start_monitoring(&run_id).await;
    manager.clone().start_auto_scaling().await;

    // Run until the operator interrupts us.
    let shutdown = ShutdownSignal::new();
    let mut shutdown_rx = shutdown.subscribe();
    let signal_trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_trigger.trigger();
        }
    });
    let _ = shutdown_rx.recv().await;

    info!("shutting down");
    manager.stop_auto_scaling().await;
    manager.stop_monitoring().await;
    Ok(())
}
