mod access;
mod automation;
mod backup;
mod bot;
mod chat;
mod config;
mod dedup;
mod delivery;
mod extract;
mod fetch;
mod health;
mod http;
mod jobs;
mod metrics;
mod normalize;
mod pipeline;
mod profile;
mod ratelimit;
mod render;
mod retry;
mod stats;
mod store;
mod supervisor;
mod telegram;
#[cfg(test)]
mod test_support;

use access::AccessGate;
use automation::{Automation, WebDriverClient};
use backup::BackupFile;
use bot::Bot;
use chat::ChatChannel;
use config::Config;
use delivery::{DeliveryManager, TimeoutLadder};
use extract::ExtractionWorker;
use fetch::ImageFetcher;
use health::HealthState;
use jobs::JobRecorder;
use pipeline::PipelineOrchestrator;
use profile::PrincipalDirectory;
use ratelimit::RateLimiter;
use retry::RetryPolicy;
use stats::UsageStats;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use store::{RedisStore, Store};
use supervisor::Supervisor;
use telegram::TelegramClient;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const POLL_WAIT: Duration = Duration::from_secs(30);
const POLL_ERROR_PAUSE: Duration = Duration::from_secs(3);
const JOB_DRAIN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let _log_guard = init_tracing();
    if let Err(err) = run().await {
        error!(target = "listing_bot.main", "bot crashed: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    let config = Config::from_env()?;
    info!(
        target = "listing_bot.main",
        admins = config.admin_ids.len(),
        fail_mode = ?config.access.fail_mode,
        "starting listing photo bot"
    );

    let store: Arc<dyn Store> = Arc::new(RedisStore::open(&config.redis_url)?);
    let gate = Arc::new(AccessGate::new(
        store.clone(),
        BackupFile::new(config.backup_path.clone()),
        config.admin_ids.clone(),
        config.access.fail_mode,
    ));
    gate.bootstrap().await;

    let mut supervisor = Supervisor::new(
        gate.clone(),
        Arc::new(dedup::TaskDeduplicator::new()),
        config.access.refresh_interval,
    );
    supervisor.start();

    let client = http::build_client();
    let telegram = Arc::new(TelegramClient::new(
        &config.bot_token,
        client.clone(),
        http::build_upload_client(),
    ));
    let chat: Arc<dyn ChatChannel> = telegram.clone();
    let automation: Arc<dyn Automation> = Arc::new(WebDriverClient::new(
        &config.automation_url,
        http::build_upload_client(),
        config.extraction.page_load_timeout,
    ));

    let orchestrator = Arc::new(build_orchestrator(
        &config,
        automation.clone(),
        chat.clone(),
        store.clone(),
        client,
    ));
    let bot = Arc::new(Bot::new(
        chat,
        gate,
        supervisor.dedup(),
        orchestrator,
        PrincipalDirectory::new(store.clone()),
        UsageStats::new(store.clone()),
        config.default_crop_percent,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let addr: SocketAddr = ([0, 0, 0, 0], config.health_port).into();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(target = "listing_bot.main", "health endpoint listening on {addr}");
    let app = health::router(HealthState { store, automation });
    let mut health_stop = shutdown_rx.clone();
    let health_server = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = health_stop.changed().await;
            })
            .await
    });

    let poller = tokio::spawn(poll_updates(telegram, bot.clone(), shutdown_rx));

    shutdown_signal().await;
    info!(target = "listing_bot.main", "shutdown requested");
    let _ = shutdown_tx.send(true);

    if let Err(err) = poller.await {
        warn!(target = "listing_bot.main", error = %err, "polling loop ended abnormally");
    }
    supervisor.stop().await;

    let in_flight = bot.jobs_in_flight();
    if in_flight > 0 {
        info!(target = "listing_bot.main", in_flight, "waiting briefly for running jobs");
        if tokio::time::timeout(JOB_DRAIN_GRACE, bot.wait_for_jobs()).await.is_err() {
            warn!(target = "listing_bot.main", in_flight = bot.jobs_in_flight(), "abandoning running jobs");
        }
    }

    health_server.await??;
    info!(target = "listing_bot.main", "stopped");
    Ok(())
}

fn build_orchestrator(
    config: &Config,
    automation: Arc<dyn Automation>,
    chat: Arc<dyn ChatChannel>,
    store: Arc<dyn Store>,
    http: reqwest::Client,
) -> PipelineOrchestrator {
    let jitter = config.retry_jitter;
    let extraction = &config.extraction;
    let extractor = ExtractionWorker::new(
        automation,
        extraction.concurrency,
        RetryPolicy::linear(extraction.retries, extraction.backoff).with_jitter(jitter),
        extract::ExtractionSettings {
            page_load_timeout: extraction.page_load_timeout,
            element_wait: extraction.element_wait,
            overlay_wait: extraction.overlay_wait,
        },
    );

    let fetch = &config.fetch;
    let fetcher = ImageFetcher::new(
        Arc::new(http),
        Arc::new(RateLimiter::per_second(fetch.rate_per_sec)),
        RetryPolicy::linear(fetch.retries, fetch.backoff).with_jitter(jitter),
        fetch.timeout,
    );

    let delivery = &config.delivery;
    let ceiling = config.rate_limit_max_waits;
    let deliverer = DeliveryManager::new(
        chat.clone(),
        delivery.batch_size,
        RetryPolicy::fixed(delivery.batch_attempts, delivery.retry_delay)
            .with_jitter(jitter)
            .with_rate_limit_ceiling(ceiling),
        RetryPolicy::fixed(delivery.item_attempts, delivery.retry_delay)
            .with_jitter(jitter)
            .with_rate_limit_ceiling(ceiling),
        TimeoutLadder {
            base: delivery.timeout_base,
            step: delivery.timeout_step,
            ceiling: delivery.timeout_max,
        },
    );

    PipelineOrchestrator::new(
        Arc::new(extractor),
        Arc::new(fetcher),
        Arc::new(deliverer),
        chat,
        PrincipalDirectory::new(store.clone()),
        UsageStats::new(store.clone()),
        JobRecorder::new(store),
        config.work_dir.clone(),
    )
}

/// Long-polls for updates and dispatches them in arrival order until shutdown.
async fn poll_updates(
    telegram: Arc<TelegramClient>,
    bot: Arc<Bot>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut offset = 0i64;
    info!(target = "listing_bot.main", "polling started");
    loop {
        let updates = tokio::select! {
            result = telegram.get_updates(offset, POLL_WAIT) => result,
            _ = shutdown.changed() => break,
        };
        match updates {
            Ok(updates) => {
                for update in updates {
                    offset = offset.max(update.update_id + 1);
                    if let Some(event) = bot::classify(update) {
                        bot.dispatch(event).await;
                    }
                }
            }
            Err(err) => {
                warn!(target = "listing_bot.main", error = %err, "getUpdates failed");
                tokio::select! {
                    _ = tokio::time::sleep(POLL_ERROR_PAUSE) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }
    info!(target = "listing_bot.main", "polling stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(target = "listing_bot.main", error = %err, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                warn!(target = "listing_bot.main", error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Console output plus an optional daily-rolling JSON file under `LOG_DIR`.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let console = if json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    };

    let (file, guard) = match std::env::var("LOG_DIR").ok().filter(|d| !d.trim().is_empty()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "listing-bot.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().json().with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(console)
        .with(file)
        .with(filter)
        .try_init();
    guard
}
