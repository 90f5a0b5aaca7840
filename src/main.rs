use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

use parley_core::context::GenerationOptions;
use parley_core::tokens::{EstimatingCounter, TokenCounter};
use parley_core::transport::Transport;
use parley_engine::{
    CancelRegistry, Coordinator, DispatchConfig, Dispatcher, HistoryStore, IngestConfig, Pipeline,
    PipelineConfig, ToolExecutor, ToolRegistry,
};
use parley_llm::{build_slots, GeminiProvider, RemoteTokenCounter, RotatingGateway, RotationConfig};
use parley_server::{LoggingTransport, ServerConfig, WebhookTransport};
use parley_settings::{load_settings_from_path, parley_home, settings_path, ParleySettings};
use parley_store::{CooldownRepo, Database, HistoryRepo};
use parley_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(name = "parley", about = "Conversational gateway between a chat platform and an LLM")]
struct Cli {
    /// Settings file (defaults to ~/.parley/settings.json).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Override the HTTP ingress port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let path = cli.settings.unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))?;
    if let Some(port) = cli.port {
        settings.server.port = port;
    }

    let home = parley_home();
    let telemetry = init_telemetry(TelemetryConfig {
        filter: settings.logging.level.clone(),
        log_to_sqlite: settings.logging.persist_warnings,
        log_db_path: home.join("logs/parley-logs.db"),
    });

    tracing::info!(settings = %path.display(), "Starting Parley");

    if settings.provider.api_keys.is_empty() {
        bail!("provider.apiKeys is empty; set it in settings or PARLEY_API_KEYS");
    }

    std::fs::create_dir_all(&home).context("failed to create parley home")?;
    let db_path = home.join(&settings.server.db_path);
    let db = Database::open(&db_path).context("failed to open database")?;
    tracing::info!(path = %db_path.display(), "Database opened");

    let coordinator = build_coordinator(&settings, db)?;

    let handle = parley_server::start(
        ServerConfig {
            host: settings.server.host.clone(),
            port: settings.server.port,
        },
        coordinator.clone(),
        telemetry.log_sink(),
    )
    .await
    .context("failed to start server")?;

    tracing::info!(port = handle.port, "Parley ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("Shutting down");
    handle.shutdown().await;
    coordinator.shutdown().await;
    Ok(())
}

fn build_coordinator(settings: &ParleySettings, db: Database) -> anyhow::Result<Arc<Coordinator>> {
    let provider_settings = &settings.provider;
    let provider = GeminiProvider::with_idle_timeout(
        &provider_settings.base_url,
        Duration::from_millis(provider_settings.stream_idle_timeout_ms),
    )?;
    let slots = build_slots(&provider_settings.api_keys, &provider_settings.models);

    let counter: Arc<dyn TokenCounter> = match (settings.history.remote_token_count, slots.first()) {
        (true, Some(slot)) => Arc::new(RemoteTokenCounter::new(
            provider.client().clone(),
            provider.base_url(),
            slot.clone(),
        )),
        _ => Arc::new(EstimatingCounter),
    };

    let gateway = Arc::new(
        RotatingGateway::new(
            Arc::new(provider),
            slots,
            RotationConfig {
                cooldown: Duration::from_millis(provider_settings.cooldown_ms),
                max_transient_retries: provider_settings.max_transient_retries,
                base_delay: Duration::from_millis(provider_settings.base_delay_ms),
                max_delay: Duration::from_millis(provider_settings.max_delay_ms),
                ..RotationConfig::default()
            },
        )
        .with_cooldown_store(Arc::new(CooldownRepo::new(db.clone()))),
    );

    let transport: Arc<dyn Transport> = match &settings.server.webhook_url {
        Some(url) => Arc::new(WebhookTransport::new(
            url.clone(),
            Duration::from_millis(settings.server.webhook_timeout_ms),
        )?),
        None => {
            tracing::warn!("no webhook configured, outbound actions are only logged");
            Arc::new(LoggingTransport::new())
        }
    };

    let cancel = Arc::new(CancelRegistry::new());
    let history = Arc::new(HistoryStore::new(HistoryRepo::new(db), counter));
    let dispatcher = Dispatcher::new(
        transport.clone(),
        cancel.clone(),
        DispatchConfig {
            send_pacing: Duration::from_millis(settings.dispatch.send_pacing_ms),
        },
    );
    let tools = ToolExecutor::new(
        Arc::new(ToolRegistry::new()),
        Duration::from_millis(settings.tools.timeout_ms),
        settings.tools.max_output_chars,
    );
    let pipeline = Arc::new(Pipeline::new(
        gateway,
        history,
        dispatcher,
        tools,
        cancel.clone(),
        transport.clone(),
        PipelineConfig {
            history_budget: settings.history.token_budget,
            max_tool_rounds: settings.tools.max_rounds,
            apology: settings.dispatch.apology_message.clone(),
            system_instruction: provider_settings.system_instruction.clone(),
            generation: GenerationOptions {
                max_output_tokens: provider_settings.max_output_tokens,
                temperature: provider_settings.temperature,
                stop_sequences: Vec::new(),
            },
        },
    ));

    let ingest = &settings.ingest;
    Ok(Coordinator::start(
        pipeline,
        cancel,
        transport,
        IngestConfig {
            debounce: Duration::from_millis(ingest.debounce_ms),
            typing_refresh: Duration::from_millis(ingest.typing_refresh_ms),
            idle_evict_after: Duration::from_millis(ingest.idle_evict_after_ms),
        },
        Duration::from_millis(ingest.sweep_interval_ms),
    ))
}
