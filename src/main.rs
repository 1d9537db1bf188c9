// ai-writer-service/src/main.rs

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ai_writer_service::config::Config;
use ai_writer_service::{
    BudgetLedger, BudgetPolicy, GenerationPipeline, GenerationRequest, HistoryLog, HttpChatClient,
    JsonFileStore, PexelsClient, PipelineSettings, SystemClock,
};
use ai_writer_service::budget::Clock;
use ai_writer_service::models::DocumentFormat;
use ai_writer_service::persistence::KeyValueStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Print to stderr BEFORE logging initialization to catch early failures
    eprintln!("Starting ai-writer-service...");

    // Load configuration
    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.service.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting AI Writer Service"
    );

    let request = match request_from_args() {
        Some(req) => req,
        None => {
            eprintln!("Usage: ai-writer-service <topic> [language] [formats]");
            eprintln!("  formats: comma-separated subset of pdf,docx,pptx,xlsx (default: pdf)");
            std::process::exit(2);
        }
    };

    // Wire up collaborators
    let store: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::new(&config.storage.path));
    let clock: Arc<dyn Clock> =
        Arc::new(SystemClock::new(config.budget.day_boundary_offset_hours));
    let ledger = Arc::new(
        BudgetLedger::load(
            Arc::clone(&store),
            clock,
            BudgetPolicy {
                daily_limit: config.budget.daily_limit,
                bonus: config.budget.bonus,
            },
        )
        .await,
    );

    let chat = HttpChatClient::new(
        config.llm.api_url.clone(),
        config.llm.api_key.clone(),
        config.llm.model.clone(),
        Duration::from_secs(config.llm.timeout_secs),
    )?;
    let images = PexelsClient::new(
        config.images.api_url.clone(),
        config.images.api_key.clone(),
        Duration::from_secs(config.images.timeout_secs),
    )?;

    let pipeline = GenerationPipeline::new(
        Arc::new(chat),
        Arc::new(images),
        Arc::clone(&ledger),
        PipelineSettings::from_config(&config),
    );
    let history = HistoryLog::new(Arc::clone(&store));

    // Cancel the in-flight generation on ctrl-c
    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal, cancelling generation");
                cancel_for_signal.cancel();
            }
            Err(err) => {
                error!("Unable to listen for shutdown signal: {}", err);
            }
        }
    });

    info!(topic = %request.topic, "Processing generation request");

    match pipeline.generate_with_cancel(&request, cancel).await {
        Ok(outcome) => {
            if let Err(e) = history.append(&outcome.history).await {
                error!(error = %e, "Failed to record history entry");
            }
            info!(
                tokens_used_today = outcome.budget.tokens_used_today,
                remaining = outcome.budget.remaining,
                repaired = outcome.repaired,
                "Generation succeeded"
            );
            println!("{}", serde_json::to_string_pretty(&outcome.result)?);
            Ok(())
        }
        Err(e) => {
            let response = e.to_error_response();
            error!(
                error_type = %response.error_type,
                detail = %response.detail,
                "Generation failed"
            );
            eprintln!("{}", response.error);
            std::process::exit(1);
        }
    }
}

fn request_from_args() -> Option<GenerationRequest> {
    let mut args = std::env::args().skip(1);
    let topic = args.next()?;
    let language = args.next().unwrap_or_else(|| "en".to_string());

    let formats: BTreeSet<DocumentFormat> = match args.next() {
        Some(raw) => raw
            .split(',')
            .map(DocumentFormat::parse)
            .collect::<Option<_>>()?,
        None => BTreeSet::from([DocumentFormat::Pdf]),
    };

    Some(GenerationRequest {
        topic,
        target_language: language,
        requested_formats: formats,
    })
}
