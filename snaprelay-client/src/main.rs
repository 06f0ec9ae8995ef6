use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use snaprelay_client::{
    AnalysisOutcome, AnalysisSink, ConnectionController, ConnectionStatus, PairingStore,
    PipelineEvent, ScreenshotIngestionPipeline, Tier,
};
use snaprelay_core::NormalizedImage;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "snaprelay")]
struct ClientArgs {
    #[arg(long, default_value = "ws://127.0.0.1:8080")]
    relay_url: String,
    /// 6-digit pairing code. Omitted: reconnect to the persisted pairing.
    #[arg(long)]
    code: Option<String>,
    #[arg(long, value_enum, default_value_t = TierArg::Free)]
    tier: TierArg,
    #[arg(long)]
    config_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TierArg {
    Free,
    Pro,
}

impl From<TierArg> for Tier {
    fn from(arg: TierArg) -> Self {
        match arg {
            TierArg::Free => Tier::Free,
            TierArg::Pro => Tier::Pro,
        }
    }
}

/// Headless stand-in for the AI pipeline: logs what it would analyze.
struct LoggingSink;

#[async_trait]
impl AnalysisSink for LoggingSink {
    async fn analyze(&self, images: Vec<NormalizedImage>, _text: Option<String>) -> AnalysisOutcome {
        info!(count = images.len(), "forwarding image set for analysis");
        AnalysisOutcome {
            success: true,
            reason: None,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = ClientArgs::parse();

    let relay_url = match url::Url::parse(&args.relay_url) {
        Ok(url) => url,
        Err(err) => {
            error!("invalid relay URL {}: {}", args.relay_url, err);
            std::process::exit(1);
        }
    };

    let store = match args.config_dir {
        Some(dir) => {
            let _ = std::fs::create_dir_all(&dir);
            PairingStore::new(dir.join("pairing.json"))
        }
        None => PairingStore::at_default_path(),
    };

    let stored = store.load();
    let (controller, mut inbound) = match ConnectionController::new(relay_url, store) {
        Ok(built) => built,
        Err(err) => {
            error!("cannot start transport: {}", err);
            std::process::exit(1);
        }
    };

    match (&args.code, stored) {
        (Some(code), _) => {
            if let Err(err) = controller.connect(code) {
                error!("{err}");
                std::process::exit(1);
            }
        }
        (None, Some(pairing)) => {
            info!(code = %pairing.code, "reconnecting to persisted pairing");
            controller.connect_code(pairing.code);
        }
        (None, None) => {
            error!("no --code given and no persisted pairing found");
            std::process::exit(1);
        }
    }

    let (mut pipeline, mut pipeline_events) =
        ScreenshotIngestionPipeline::new(Arc::new(Tier::from(args.tier)), Arc::new(LoggingSink));

    let mut snapshots = controller.watch();

    loop {
        tokio::select! {
            message = inbound.recv() => match message {
                Some(message) => pipeline.handle(message),
                None => break,
            },
            event = pipeline_events.recv() => if let Some(event) = event {
                report_pipeline_event(event);
            },
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow().clone();
                match snapshot.status {
                    ConnectionStatus::Connected => info!("status: connected"),
                    ConnectionStatus::Connecting => info!("status: connecting"),
                    ConnectionStatus::Disconnected => info!("status: disconnected"),
                    ConnectionStatus::Error => {
                        warn!("status: error ({})", snapshot.error.as_deref().unwrap_or("unknown"));
                    }
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                controller.disconnect();
                // Let the close frame reach the relay before teardown.
                tokio::time::sleep(std::time::Duration::from_millis(150)).await;
                break;
            }
        }
    }
}

fn report_pipeline_event(event: PipelineEvent) {
    match event {
        PipelineEvent::DisplayImages(images) => {
            info!(count = images.len(), "displaying images");
        }
        PipelineEvent::UpgradePrompt => {
            info!("auto-analysis requires a paid tier; showing upgrade prompt");
        }
        PipelineEvent::Advisory(text) => info!("advisory: {text}"),
        PipelineEvent::QueueLimitNotice { cap } => {
            info!(cap, "manual review queue is full; oldest entries dropped");
        }
        PipelineEvent::StatusNote(text) => info!("status note: {text}"),
        PipelineEvent::HistoryRestored(_) => info!("conversation history restored"),
    }
}
