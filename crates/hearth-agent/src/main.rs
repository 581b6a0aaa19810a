use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use hearth_agent::{
    Environment, EnvironmentId, EnvironmentOptions,
    config::AgentConfig,
    operations::{self, OperationRegistry, OperationSettings},
    pipeline,
    server::ServerDefinition,
    supervise,
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_CONFIG_PATH: &str = "/etc/hearth/config.json";
const STOP_TIMEOUT: Duration = Duration::from_secs(30);

fn init_tracing(cfg: &AgentConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &cfg.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "hearth-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();
    guard
}

fn usage() -> anyhow::Error {
    anyhow::anyhow!("usage: hearth-agent <server.json>")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let definition_path = std::env::args_os().nth(1).map(PathBuf::from).ok_or_else(usage)?;
    let config_path = std::env::var_os("HEARTH_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let cfg = AgentConfig::load(&config_path)?;
    let _log_guard = init_tracing(&cfg);
    tracing::info!(config = %config_path.display(), "hearth-agent starting");

    if operations::install_global(OperationRegistry::with_builtins(
        &OperationSettings::from_config(&cfg),
    ))
    .is_err()
    {
        tracing::warn!("operation registry already installed");
    }

    let raw = std::fs::read_to_string(&definition_path)
        .with_context(|| format!("read server definition {}", definition_path.display()))?;
    let def: ServerDefinition =
        serde_json::from_str(&raw).context("parse server definition")?;

    let root = cfg.server_dir(&def.id);
    let env = Environment::new(
        EnvironmentId(def.id.clone()),
        def.environment,
        &root,
        EnvironmentOptions::from_config(&cfg),
    )
    .context("create environment")?;
    env.create().await.context("create server directory")?;

    let data = def.data_map(env.root_directory());
    let steps = operations::global()
        .build(&def.install, &data)
        .context("build install operations")?;
    pipeline::run(&steps, &env).await.context("install")?;

    let (command, arguments) = def.run.resolve(&data);
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let pid = env
        .execute_async(
            &command,
            &arguments,
            Some(Box::new(move |graceful| {
                let _ = done_tx.send(graceful);
            })),
        )
        .context("start server")?;
    tracing::info!(server = %def.id, pid, "server running");

    tokio::select! {
        graceful = done_rx => {
            let graceful = graceful.unwrap_or(false);
            tracing::info!(server = %def.id, graceful, "server exited");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(server = %def.id, "shutdown requested");
            let stop_line = def.run.stop.as_ref().map(|s| format!("{s}\n"));
            let outcome = supervise::stop_with_timeout(&env, stop_line.as_deref(), STOP_TIMEOUT)
                .await
                .context("stop server")?;
            tracing::info!(server = %def.id, escalation = ?outcome.escalation, exit = ?outcome.exit, "server stopped");
        }
    }

    Ok(())
}
