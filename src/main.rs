use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use sales_outreach::channels::FsAttachmentStore;
use sales_outreach::config::OutreachConfig;
use sales_outreach::llm::create_provider;
use sales_outreach::pipeline::{ActionDispatcher, Composer, InboxDrain, LlmClassifier};
use sales_outreach::store::{Database, LibSqlBackend};
use sales_outreach::worker::{Orchestrator, OutreachInitiation, TimeoutSweep, spawn_orchestrator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OutreachConfig::from_env().context("Invalid configuration")?;

    // Initialize tracing; the guard flushes the file writer on exit.
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (file_layer, _log_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "sales-outreach.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    eprintln!("📨 Sales Outreach v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!(
        "   Channels: {}",
        config
            .channels
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    eprintln!(
        "   Loops: initiation={}, timeout sweep={}",
        config.initiation, config.timeout_sweep
    );
    eprintln!("   Classifier: {:?} ({})", config.llm.backend, config.llm.model);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    // ── Classifier ───────────────────────────────────────────────────────
    let llm = create_provider(&config.llm).context("Failed to create LLM provider")?;
    let gateway = Arc::new(LlmClassifier::new(llm));

    // ── Pipeline ─────────────────────────────────────────────────────────
    let composer = Composer::new(config.sender_name.clone(), config.demo_link.clone());
    let dispatcher = Arc::new(ActionDispatcher::new(
        composer.clone(),
        Arc::new(FsAttachmentStore::new(config.attachments_dir.clone())),
        config.presentation.clone(),
        config.default_timeout,
    ));
    let mut drain = InboxDrain::new(
        Arc::clone(&db),
        gateway,
        dispatcher,
        config.classify_timeout,
    )
    .with_claim_lease(config.claim_lease);
    if let Some(products) = config.self_registration.clone() {
        eprintln!("   Chat /start: self-registration enabled");
        drain = drain.with_self_registration(products);
    }

    // ── Orchestrator ─────────────────────────────────────────────────────
    let mut orchestrator = Orchestrator::new(
        Arc::clone(&db),
        config.channels.clone(),
        drain,
        config.poll_interval,
    );
    if config.initiation {
        orchestrator =
            orchestrator.with_initiation(OutreachInitiation::new(Arc::clone(&db), composer.clone()));
    }
    if config.timeout_sweep {
        orchestrator = orchestrator.with_timeout_sweep(TimeoutSweep::new(
            Arc::clone(&db),
            composer,
            config.reminder_interval,
        ));
    }

    let (handle, shutdown) = spawn_orchestrator(orchestrator);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested, finishing current cycle");
    shutdown.store(true, Ordering::Relaxed);
    handle.await.context("Orchestrator task panicked")?;

    Ok(())
}
