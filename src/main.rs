use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use pulseflow::{
    api::{self, AppState},
    config::AppConfig,
    engine::Engine,
    logger::init_tracing,
    outbound::{HttpRenderer, LogRenderer, OutboundRenderer},
    schema::write_schema,
    store::InMemoryFlowStore,
};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "pulseflow",
    about = "Channel-agnostic conversational flow engine",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine: webhook ingestion, authoring APIs and the delay
    /// scheduler.
    Run(RunArgs),

    /// Emit the flow JSON-Schema for the authoring frontend.
    Schema(SchemaArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Bind host override (defaults to HOST or 0.0.0.0).
    #[arg(long)]
    host: Option<String>,

    /// Bind port override (defaults to PORT or 8018).
    #[arg(long)]
    port: Option<u16>,

    /// Log level override (e.g. error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    #[arg(long, default_value = "schemas")]
    out_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let default_run = Commands::Run(RunArgs {
        host: None,
        port: None,
        log_level: "info".to_string(),
    });
    match cli.command.unwrap_or(default_run) {
        Commands::Run(args) => run(args).await,
        Commands::Schema(args) => {
            let path = write_schema(&args.out_dir)?;
            println!("Schema written to {}", path.display());
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = AppConfig::from_env();
    let log_level = if config.debug && args.log_level == "info" {
        "debug"
    } else {
        args.log_level.as_str()
    };
    let _log_guard = init_tracing(log_level, config.log_dir.as_deref())?;

    info!(
        app_env = %config.app_env,
        org_id = config.org_id.as_deref().unwrap_or("-"),
        "pulseflow starting up"
    );
    if let Some(loki) = &config.loki_url {
        info!(loki_url = %loki, "log sink configured");
    }
    if config.mongo.is_configured() {
        // The in-memory store serves this build; a document-database store
        // plugs in behind the same trait.
        warn!(
            host = config.mongo.host.as_deref().unwrap_or("-"),
            "MONGO_* configured but this build uses the in-memory store"
        );
    }

    let store = Arc::new(InMemoryFlowStore::new());
    let renderer: Arc<dyn OutboundRenderer> = match &config.renderer_url {
        Some(url) => Arc::new(HttpRenderer::new(url.clone())),
        None => {
            warn!("RENDERER_URL not set, outbound intents are logged only");
            Arc::new(LogRenderer::new())
        }
    };

    let engine = Engine::new(store.clone(), renderer, config.delay_tick_seconds);
    let scheduler_handle = engine.scheduler.spawn();

    let app = api::router(AppState {
        store,
        state_service: engine.state_service.clone(),
        adapter: engine.adapter.clone(),
    });

    let host = args.host.unwrap_or_else(|| config.host.clone());
    let port = args.port.unwrap_or(config.port);
    let listener = TcpListener::bind((host.as_str(), port)).await?;
    info!(host = %host, port, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    scheduler_handle.abort();
    info!("pulseflow stopped");
    Ok(())
}
