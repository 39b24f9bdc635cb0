use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::core::{AdminAlerter, Clock, Mailer, QueueProcessor, RateLimiter};

#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<QueueProcessor>,
    pub mailer: Arc<Mailer>,
    pub limiter: Arc<RateLimiter>,
    pub alerter: Arc<AdminAlerter>,
    pub clock: Arc<dyn Clock>,
    pub cron_secret: Option<Arc<str>>,
    pub trust_proxy_headers: bool,
    pub batch_size: usize,
    pub started_at: Instant,
    pub shutdown: CancellationToken,
}
