// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
mod cli;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use nils_core::{Engine, HookRegistry};
use nils_model::ModelProvider;
use nils_session::Project;
use nils_store::Store;
use nils_tools::ToolRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Arc::new(nils_config::load(cli.config.as_deref())?);

    match cli.command {
        Some(Commands::ShowConfig) => {
            println!("{}", serde_yaml::to_string(&*config).unwrap_or_default());
            Ok(())
        }
        Some(Commands::Import { data_dir }) => {
            let data_dir = data_dir.unwrap_or_else(|| config.storage.resolve_data_dir());
            // Opening the store runs the import; a marker from an earlier
            // run makes this a no-op.
            let store =
                Store::open(&data_dir).context("store open (migrations + import) failed")?;
            store.flush()?;
            println!("import finished: {}", data_dir.display());
            Ok(())
        }
        Some(Commands::Serve { addr, data_dir }) => serve(config, addr, data_dir).await,
        None => serve(config, None, None).await,
    }
}

async fn serve(
    config: Arc<nils_config::Config>,
    addr: Option<String>,
    data_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let data_dir = data_dir.unwrap_or_else(|| config.storage.resolve_data_dir());
    // A migration failure aborts startup with a non-zero exit; the
    // database is left as it was.
    let store = Arc::new(Store::open(&data_dir).context("store open failed")?);

    let worktree = std::env::current_dir().context("cannot resolve working directory")?;
    let project = resolve_project(&store, &worktree)?;

    let bus = Arc::new(nils_event::Bus::new());
    let mut registry = ToolRegistry::new();
    nils_tools::builtin::register_builtins(&mut registry);

    let providers = build_providers(&config)?;
    let engine = Engine::new(
        config.clone(),
        store,
        bus,
        registry,
        HookRegistry::new(),
        providers,
        project,
    );

    let addr = addr.unwrap_or_else(|| config.server.addr.clone());
    let shutdown = shutdown_signal(engine.clone());
    nils_server::serve(engine, &addr, shutdown).await
}

/// Find or create the project for `worktree` and record the visit.
fn resolve_project(store: &Arc<Store>, worktree: &Path) -> anyhow::Result<Project> {
    let id = Project::derive_id(worktree, None);
    let mut project = match store.get_project(&id) {
        Ok(existing) => existing,
        Err(_) => Project::new(&id, worktree),
    };
    project.worktree = worktree.to_path_buf();
    project.touch();
    store.upsert_project(&project)?;
    Ok(project)
}

/// Build every configured provider, keyed by the id prompts reference.
fn build_providers(
    config: &nils_config::Config,
) -> anyhow::Result<HashMap<String, Arc<dyn ModelProvider>>> {
    let mut providers = HashMap::new();
    let default = nils_model::from_config(&config.model)
        .with_context(|| format!("default provider {:?}", config.model.provider))?;
    providers.insert(config.model.provider.clone(), default);
    for (key, model_config) in &config.providers {
        let provider = nils_model::from_config(model_config)
            .with_context(|| format!("provider {key:?}"))?;
        providers.insert(key.clone(), provider);
    }
    Ok(providers)
}

/// Resolve on SIGINT/SIGTERM; cancel all session locks and flush SQLite
/// before the server drains.
async fn shutdown_signal(engine: Arc<Engine>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutting down");
    engine.dispose();
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("NILS_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
