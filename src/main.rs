//! `omni-core`: starts the messaging hub, or runs a one-shot maintenance
//! command (SPEC_FULL.md §1 AMBIENT process model — the CLI is glue only).

use clap::{Parser, Subcommand};
use omni::access::AccessEngine;
use omni::agent::AgentClient;
use omni::api::AppState;
use omni::config::Config;
use omni::dispatch::Dispatcher;
use omni::registry::Registry;
use omni::storage::access::AccessStore;
use omni::storage::instances::{InstanceStore, ListFilter};
use omni::storage::traces::TraceStore;
use omni::storage::users::UserStore;
use omni::supervisor::Supervisor;
use omni::tracing_pipeline::TracingPipeline;
use omni::ChannelKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "omni-core", version)]
struct Cli {
    /// Path to a TOML config file; defaults to `{data_dir}/config.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Starts the webhook server and per-instance workers.
    Serve {
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,
    },
    /// Applies pending database migrations and exits.
    Migrate,
    /// Instance registry maintenance.
    Instance {
        #[command(subcommand)]
        action: InstanceCommand,
    },
}

#[derive(Subcommand)]
enum InstanceCommand {
    List,
    Delete {
        name: String,
        #[arg(long)]
        cascade: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            match e {
                omni::Error::Config(_) => 2,
                omni::Error::Storage(_) | omni::Error::Sqlx(_) => 3,
                _ => 1,
            }
        }
    };

    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> omni::Result<()> {
    let config = Arc::new(Config::load(cli.config.as_deref())?);

    match cli.command {
        Command::Migrate => {
            let pool = omni::db::connect(&config.resolved_database_url()).await?;
            omni::db::migrate(&pool).await?;
            tracing::info!("migrations applied");
            Ok(())
        }
        Command::Instance { action } => run_instance_command(config, action).await,
        Command::Serve { bind } => serve(config, bind).await,
    }
}

async fn run_instance_command(config: Arc<Config>, action: InstanceCommand) -> omni::Result<()> {
    let pool = omni::db::connect(&config.resolved_database_url()).await?;
    omni::db::migrate(&pool).await?;
    let store = InstanceStore::new(pool);

    match action {
        InstanceCommand::List => {
            let tz = config.tz();
            for instance in store.list(ListFilter::All).await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    instance.name,
                    instance.channel,
                    instance.is_default,
                    instance.created_at.with_timezone(&tz).to_rfc3339(),
                );
            }
        }
        InstanceCommand::Delete { name, cascade } => {
            store.delete(&name, cascade).await?;
            println!("deleted {name}");
        }
    }
    Ok(())
}

async fn serve(config: Arc<Config>, bind: String) -> omni::Result<()> {
    let pool = omni::db::connect(&config.resolved_database_url()).await?;
    omni::db::migrate(&pool).await?;

    let registry = Arc::new(Registry::new(InstanceStore::new(pool.clone())).await?);
    let access = Arc::new(AccessEngine::new(AccessStore::new(pool.clone())));
    let users = Arc::new(UserStore::new(pool.clone()));
    let tracing_pipeline = Arc::new(TracingPipeline::new(
        Arc::new(TraceStore::new(pool.clone())),
        config.trace.clone(),
    ));
    let agent_client = Arc::new(AgentClient::new());
    let dispatcher = Arc::new(Dispatcher::new(config.sockets_dir()));

    let state = Arc::new(AppState::new(
        config.clone(),
        registry.clone(),
        access,
        users,
        tracing_pipeline.clone(),
        agent_client,
        dispatcher,
    ));
    let supervisor = Supervisor::new(state.clone());

    spawn_discord_listeners(&config, &registry, &supervisor);
    spawn_retention_sweeper(tracing_pipeline, config.trace.enabled);

    let router = omni::api::build_router(state, supervisor.clone());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|e| omni::error::StorageError::Other(e.into()))?;
    tracing::info!(%bind, "webhook server listening");

    let shutdown = shutdown_signal(supervisor.clone());
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| omni::error::StorageError::Other(e.into()))?;

    Ok(())
}

/// For each active Discord instance, serves `sockets/core-{instance}.sock`
/// so the bot sidecar can push normalized events into the instance's
/// worker queue (spec.md §4.3 Discord path, §6).
fn spawn_discord_listeners(config: &Arc<Config>, registry: &Arc<Registry>, supervisor: &Arc<Supervisor>) {
    for instance in registry.list() {
        if instance.channel != ChannelKind::Discord {
            continue;
        }
        let socket_path = config.core_socket_path(&instance.name);
        let supervisor = supervisor.clone();
        let registry = registry.clone();
        let instance_name = instance.name.clone();

        tokio::spawn(async move {
            let handle = move |req: hyper::Request<hyper::body::Incoming>| {
                let supervisor = supervisor.clone();
                let registry = registry.clone();
                let instance_name = instance_name.clone();
                async move {
                    use http_body_util::BodyExt;
                    let body = req.into_body().collect().await.map(|c| c.to_bytes()).unwrap_or_default();
                    let Some(instance) = registry.get(&instance_name) else {
                        return omni::ipc::unix_http::json_response(
                            hyper::StatusCode::NOT_FOUND,
                            &serde_json::json!({"error": "unknown instance"}),
                        );
                    };
                    let Ok(raw) = serde_json::from_slice::<serde_json::Value>(&body) else {
                        return omni::ipc::unix_http::json_response(
                            hyper::StatusCode::BAD_REQUEST,
                            &serde_json::json!({"error": "invalid payload"}),
                        );
                    };
                    let Ok(message) = serde_json::from_value(raw.clone()) else {
                        return omni::ipc::unix_http::json_response(
                            hyper::StatusCode::BAD_REQUEST,
                            &serde_json::json!({"error": "invalid payload"}),
                        );
                    };
                    let event = omni::InboundEvent { raw, message };
                    match supervisor.enqueue(&instance, event).await {
                        Ok(()) => omni::ipc::unix_http::json_response(
                            hyper::StatusCode::OK,
                            &serde_json::json!({"status": "accepted"}),
                        ),
                        Err(_) => omni::ipc::unix_http::json_response(
                            hyper::StatusCode::TOO_MANY_REQUESTS,
                            &serde_json::json!({"status": "overflow"}),
                        ),
                    }
                }
            };
            if let Err(e) = omni::ipc::unix_http::serve_unix(&socket_path, handle).await {
                tracing::error!(error = %e, path = %socket_path.display(), "core socket listener failed");
            }
        });
    }
}

/// Background sweeper deleting traces older than `retention_days` in
/// bounded batches (spec.md §4.4 Retention GC).
fn spawn_retention_sweeper(pipeline: Arc<TracingPipeline>, enabled: bool) {
    if !enabled {
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            interval.tick().await;
            let mut total = 0;
            loop {
                let deleted = pipeline.gc_once(500).await;
                total += deleted;
                if deleted == 0 {
                    break;
                }
            }
            if total > 0 {
                tracing::info!(count = total, "retention GC swept traces");
            }
        }
    });
}

async fn shutdown_signal(supervisor: Arc<Supervisor>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received, draining in-flight work");
    supervisor.shutdown(Duration::from_secs(10)).await;
}
