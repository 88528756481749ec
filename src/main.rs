use std::sync::Arc;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use inbox_triage::api::{self, AppState};
use inbox_triage::config::AppConfig;
use inbox_triage::feedback::Reinforcer;
use inbox_triage::llm::{LlmConfig, create_provider};
use inbox_triage::pipeline::{Classifier, MessageProcessor};
use inbox_triage::store::{Database, LibSqlBackend};
use inbox_triage::surfaces::{
    ActivityNotifier, DraftSurface, LocalCalendar, LocalDrafts, LocalLabels, MailingDrafts,
    Notifier, SmtpConfig, SmtpSender, Surfaces, TelegramConfig, TelegramNotifier,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let config = AppConfig::from_env()?;
    let _log_guard = init_tracing(&config);

    let llm_config = LlmConfig::from_env()?;

    eprintln!("📬 Inbox Triage v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", llm_config.model);
    eprintln!("   API: http://0.0.0.0:{}/api", config.port);

    let llm = create_provider(&llm_config)?;
    let classifier = Arc::new(Classifier::new(llm, config.classifier_timeout));

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Surfaces ─────────────────────────────────────────────────────────
    let drafts: Arc<dyn DraftSurface> = match SmtpConfig::from_env() {
        Some(smtp) => {
            eprintln!("   SMTP: enabled ({})", smtp.host);
            Arc::new(MailingDrafts::new(Arc::clone(&db), SmtpSender::new(smtp)))
        }
        None => {
            eprintln!("   SMTP: disabled (auto-replies will be logged as failures)");
            Arc::new(LocalDrafts::new(Arc::clone(&db)))
        }
    };
    let notifier: Arc<dyn Notifier> = match TelegramConfig::from_env() {
        Some(telegram) => {
            eprintln!("   Telegram: enabled (chat {})", telegram.chat_id);
            Arc::new(TelegramNotifier::new(telegram))
        }
        None => {
            eprintln!("   Telegram: disabled (alerts go to the activity log)");
            Arc::new(ActivityNotifier::new(Arc::clone(&db)))
        }
    };
    let surfaces = Surfaces {
        labels: Arc::new(LocalLabels::new(Arc::clone(&db))),
        drafts,
        calendar: Arc::new(LocalCalendar::new(Arc::clone(&db))),
        notifier,
    };

    // ── Pipeline ─────────────────────────────────────────────────────────
    let state = AppState {
        db: Arc::clone(&db),
        processor: Arc::new(MessageProcessor::new(
            Arc::clone(&db),
            Arc::clone(&classifier),
            surfaces,
        )),
        reinforcer: Arc::new(Reinforcer::new(Arc::clone(&db), Some(classifier))),
    };

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "Triage API server started");
    axum::serve(listener, api::router(state)).await?;

    Ok(())
}

/// Stderr logging plus an optional daily-rolling file.
///
/// The returned guard must live for the whole process or buffered file
/// output is lost.
fn init_tracing(config: &AppConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "inbox-triage.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}
