mod alerting;
mod clock;
mod database;
mod error;
mod mailer;
mod processor;
mod rate_limit;
mod server;
mod store;
mod templates;

pub use alerting::AdminAlerter;
pub use clock::{Clock, SystemClock};
pub use database::PgJobStore;
pub use mailer::Mailer;
pub use processor::{QueueProcessor, RetryPolicy, spawn_queue_ticker};
pub use rate_limit::{MemoryRateLimitStore, RateLimiter, spawn_rate_limit_sweeper};
pub use server::run_http_server;
pub use store::{JobStore, MemoryJobStore};
