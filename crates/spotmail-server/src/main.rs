mod app;
mod config;
mod core;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use app::AppState;
use config::Config;
use core::{
    AdminAlerter, Clock, JobStore, Mailer, MemoryJobStore, MemoryRateLimitStore,
    PgJobStore, QueueProcessor, RateLimiter, RetryPolicy, SystemClock,
    run_http_server, spawn_queue_ticker, spawn_rate_limit_sweeper,
};
use spotmail_helpers::{logging, shutdown};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    logging::init_logging(
        "spotmail_server=info,tower_http=warn,sqlx=warn",
        "SPOTMAIL_LOG",
        "spotmail-server",
    );

    let config = Config::load().context("failed to load configuration")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store: Arc<dyn JobStore> = match &config.database_url {
        Some(url) => Arc::new(
            PgJobStore::connect(url, config.database_pool_size)
                .await
                .context("failed to connect database")?,
        ),
        None => {
            warn!("database_url not set, email queue is kept in memory");
            Arc::new(MemoryJobStore::default())
        }
    };

    let mailer = Arc::new(
        Mailer::from_config(&config).context("failed to set up mail dispatcher")?,
    );
    if !mailer.is_configured() {
        warn!("mail credentials missing, every send will fail with CONFIGURATION_ERROR");
    }

    let processor = Arc::new(QueueProcessor::new(
        store,
        mailer.clone(),
        clock.clone(),
        RetryPolicy::from_config(&config.queue),
    ));
    let limiter = Arc::new(RateLimiter::new(
        Arc::new(MemoryRateLimitStore::default()),
        clock.clone(),
        config.rate_limit.limit,
        config.rate_limit.window,
    ));
    let alerter = Arc::new(AdminAlerter::new(
        mailer.clone(),
        config.admin_email.clone(),
        clock.clone(),
    ));

    let state = AppState {
        processor,
        mailer,
        limiter,
        alerter,
        clock,
        cron_secret: config.cron_secret.as_deref().map(Arc::from),
        trust_proxy_headers: config.trust_proxy_headers,
        batch_size: config.queue.batch_size,
        started_at: Instant::now(),
        shutdown: CancellationToken::new(),
    };

    info!(
        "server starting: listen={}, store={}, rate_limit={}/{}s, trust_proxy_headers={}, batch_size={}, max_attempts={}",
        config.listen,
        if config.database_url.is_some() { "postgres" } else { "memory" },
        config.rate_limit.limit,
        config.rate_limit.window.as_secs(),
        config.trust_proxy_headers,
        config.queue.batch_size,
        config.queue.max_attempts
    );

    tokio::spawn(shutdown::listen_shutdown(state.shutdown.clone()));
    tokio::spawn(spawn_rate_limit_sweeper(
        state.limiter.clone(),
        config.rate_limit.sweep_interval,
        state.shutdown.clone(),
    ));
    if let Some(every) = config.queue.poll_interval {
        tokio::spawn(spawn_queue_ticker(
            state.processor.clone(),
            state.alerter.clone(),
            config.queue.batch_size,
            every,
            state.shutdown.clone(),
        ));
    }

    run_http_server(&config.listen, state, config.request_timeout).await
}
