use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use spotmail_helpers::de::{deserialize_duration, deserialize_optional_duration};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_database_pool_size")]
    pub database_pool_size: u32,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub dkim: DkimConfig,
    #[serde(default)]
    pub admin_email: Option<String>,
    #[serde(default)]
    pub cron_secret: Option<String>,
    #[serde(default)]
    pub unsubscribe_url: Option<String>,
    /// Key rate limits on `X-Forwarded-For`/`X-Real-IP`. Only safe behind a
    /// proxy that overwrites them.
    #[serde(default = "default_trust_proxy_headers")]
    pub trust_proxy_headers: bool,
    #[serde(
        default = "default_request_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub request_timeout: Duration,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            database_url: None,
            database_pool_size: default_database_pool_size(),
            smtp: SmtpConfig::default(),
            dkim: DkimConfig::default(),
            admin_email: None,
            cron_secret: None,
            unsubscribe_url: None,
            trust_proxy_headers: default_trust_proxy_headers(),
            request_timeout: default_request_timeout(),
            rate_limit: RateLimitConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl Config {
    /// Resolves the YAML file (optional), layers secrets from the process
    /// environment on top, then normalizes and validates.
    pub fn load() -> Result<Self> {
        let config_path = parse_config_path_arg(env::args().skip(1))?
            .or_else(resolve_server_config_path);

        let mut config = match config_path {
            Some(path) => load_config_yaml(&path)?,
            None => Self::default(),
        };

        config.apply_env_overrides(non_empty_env);
        config.normalize()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(user) = lookup("GMAIL_USER") {
            self.smtp.user = Some(user);
        }
        if let Some(pass) = lookup("GMAIL_APP_PASSWORD") {
            // app passwords are displayed in groups of four
            self.smtp.pass = Some(pass.split_whitespace().collect());
        }
        if let Some(admin) = lookup("ADMIN_EMAIL") {
            self.admin_email = Some(admin);
        }
        if let Some(secret) = lookup("CRON_SECRET") {
            self.cron_secret = Some(secret);
        }
        if let Some(key) = lookup("DKIM_PRIVATE_KEY") {
            self.dkim.private_key = Some(key.replace("\\n", "\n"));
        }
        if let Some(domain) = lookup("DKIM_DOMAIN") {
            self.dkim.domain = Some(domain);
        }
        if let Some(selector) = lookup("DKIM_SELECTOR") {
            self.dkim.selector = selector;
        }
    }

    fn normalize(&mut self) -> Result<()> {
        self.listen = trim_owned(self.listen.clone());
        if self.listen.is_empty() {
            self.listen = default_listen();
        }

        self.database_url = normalize_opt(self.database_url.clone());
        self.admin_email = normalize_opt(self.admin_email.clone());
        self.cron_secret = normalize_opt(self.cron_secret.clone());
        self.unsubscribe_url = normalize_opt(self.unsubscribe_url.clone());
        self.database_pool_size = self.database_pool_size.max(1);
        if self.request_timeout.is_zero() {
            self.request_timeout = default_request_timeout();
        }

        self.smtp.normalize();
        self.dkim.normalize();
        self.rate_limit.normalize();
        self.queue.normalize();

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.smtp.validate()?;
        self.dkim.validate()?;
        self.queue.validate()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SmtpConfig {
    #[serde(default = "default_smtp_host")]
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    #[serde(default)]
    pub from_address: Option<String>,
    #[serde(default = "default_smtp_max_connections")]
    pub max_connections: usize,
    /// Messages submitted through one pool, across all of its connections,
    /// before the pool is replaced.
    #[serde(default = "default_smtp_max_messages_per_pool")]
    pub max_messages_per_pool: usize,
    #[serde(
        default = "default_smtp_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub timeout: Duration,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            user: None,
            pass: None,
            from_name: default_from_name(),
            from_address: None,
            max_connections: default_smtp_max_connections(),
            max_messages_per_pool: default_smtp_max_messages_per_pool(),
            timeout: default_smtp_timeout(),
        }
    }
}

impl SmtpConfig {
    /// Both halves of the provider login are present.
    pub fn credentials_configured(&self) -> bool {
        self.user.is_some() && self.pass.is_some()
    }

    /// Envelope sender; falls back to the login address.
    pub fn sender_address(&self) -> Option<&str> {
        self.from_address.as_deref().or(self.user.as_deref())
    }

    fn normalize(&mut self) {
        self.host = trim_owned(self.host.clone());
        if self.host.is_empty() {
            self.host = default_smtp_host();
        }
        self.user = normalize_opt(self.user.clone());
        self.pass = normalize_opt(self.pass.clone());
        self.from_address = normalize_opt(self.from_address.clone());
        self.from_name = trim_owned(self.from_name.clone());

        self.max_connections = self.max_connections.max(1);
        self.max_messages_per_pool = self.max_messages_per_pool.max(1);
        if self.timeout.is_zero() {
            self.timeout = default_smtp_timeout();
        }
    }

    fn validate(&self) -> Result<()> {
        if self.user.is_some() && self.pass.is_none() {
            bail!("server config smtp.user is set but `smtp.pass` is missing");
        }
        if self.pass.is_some() && self.user.is_none() {
            bail!("server config smtp.pass is set but `smtp.user` is missing");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DkimConfig {
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default = "default_dkim_selector")]
    pub selector: String,
    #[serde(default)]
    pub private_key: Option<String>,
}

impl Default for DkimConfig {
    fn default() -> Self {
        Self {
            domain: None,
            selector: default_dkim_selector(),
            private_key: None,
        }
    }
}

impl DkimConfig {
    pub fn enabled(&self) -> bool {
        self.private_key.is_some()
    }

    fn normalize(&mut self) {
        self.domain = normalize_opt(self.domain.clone());
        self.private_key = normalize_opt(self.private_key.clone());
        self.selector = trim_owned(self.selector.clone());
        if self.selector.is_empty() {
            self.selector = default_dkim_selector();
        }
    }

    fn validate(&self) -> Result<()> {
        if self.enabled() && self.domain.is_none() {
            bail!("server config dkim key is set but `dkim.domain` is missing");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit")]
    pub limit: u32,
    #[serde(
        default = "default_rate_window",
        deserialize_with = "deserialize_duration"
    )]
    pub window: Duration,
    #[serde(
        default = "default_rate_sweep_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: default_rate_limit(),
            window: default_rate_window(),
            sweep_interval: default_rate_sweep_interval(),
        }
    }
}

impl RateLimitConfig {
    fn normalize(&mut self) {
        self.limit = self.limit.max(1);
        if self.window.is_zero() {
            self.window = default_rate_window();
        }
        if self.sweep_interval.is_zero() {
            self.sweep_interval = default_rate_sweep_interval();
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    #[serde(default = "default_queue_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_queue_max_attempts")]
    pub max_attempts: u32,
    #[serde(
        default = "default_queue_base_backoff",
        deserialize_with = "deserialize_duration"
    )]
    pub base_backoff: Duration,
    #[serde(
        default = "default_queue_max_backoff",
        deserialize_with = "deserialize_duration"
    )]
    pub max_backoff: Duration,
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub poll_interval: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: default_queue_batch_size(),
            max_attempts: default_queue_max_attempts(),
            base_backoff: default_queue_base_backoff(),
            max_backoff: default_queue_max_backoff(),
            poll_interval: None,
        }
    }
}

impl QueueConfig {
    fn normalize(&mut self) {
        self.batch_size = self.batch_size.max(1);
        self.max_attempts = self.max_attempts.max(1);
        if self.base_backoff.is_zero() {
            self.base_backoff = default_queue_base_backoff();
        }
        self.poll_interval = self
            .poll_interval
            .filter(|interval| !interval.is_zero())
            .map(|interval| interval.max(Duration::from_secs(5)));
    }

    fn validate(&self) -> Result<()> {
        if self.max_backoff < self.base_backoff {
            bail!(
                "server config queue.max_backoff ({}) is shorter than queue.base_backoff ({})",
                humantime::format_duration(self.max_backoff),
                humantime::format_duration(self.base_backoff)
            );
        }
        Ok(())
    }
}

fn parse_config_path_arg<I>(mut args: I) -> Result<Option<PathBuf>>
where
    I: Iterator<Item = String>,
{
    let first = args.next();
    let second = args.next();

    if let Some(arg) = second {
        bail!(
            "too many arguments: {arg} (usage: spotmail-server [config-path])"
        );
    }

    if matches!(first.as_deref(), Some("-h" | "--help")) {
        bail!("usage: spotmail-server [config-path]");
    }

    Ok(first.map(PathBuf::from))
}

fn load_config_yaml(path: &Path) -> Result<Config> {
    let raw = std::fs::read(path).with_context(|| {
        format!("failed to read config file {}", path.display())
    })?;
    serde_yaml::from_slice(&raw).with_context(|| {
        format!("failed to parse YAML config {}", path.display())
    })
}

fn resolve_server_config_path() -> Option<PathBuf> {
    if let Some(path) = non_empty_env("SPOTMAIL_CONFIG_PATH") {
        return Some(PathBuf::from(path));
    }

    let mut dirs = Vec::with_capacity(2);
    if let Some(home) = non_empty_env("HOME") {
        dirs.push(PathBuf::from(home));
    }
    dirs.push(env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    dirs.into_iter()
        .flat_map(|dir| {
            [dir.join("spotmail.yaml"), dir.join("spotmail.yml")]
        })
        .find(|candidate| candidate.exists())
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_database_pool_size() -> u32 {
    10
}

fn default_trust_proxy_headers() -> bool {
    true
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_smtp_host() -> String {
    "smtp.gmail.com".to_string()
}

fn default_smtp_port() -> u16 {
    465
}

fn default_from_name() -> String {
    "SpotItForMe".to_string()
}

fn default_smtp_max_connections() -> usize {
    5
}

fn default_smtp_max_messages_per_pool() -> usize {
    100
}

fn default_smtp_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_dkim_selector() -> String {
    "default".to_string()
}

fn default_rate_limit() -> u32 {
    10
}

fn default_rate_window() -> Duration {
    Duration::from_secs(60)
}

fn default_rate_sweep_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_queue_batch_size() -> usize {
    50
}

fn default_queue_max_attempts() -> u32 {
    3
}

fn default_queue_base_backoff() -> Duration {
    Duration::from_secs(60)
}

fn default_queue_max_backoff() -> Duration {
    Duration::from_secs(3600)
}

fn normalize_opt(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    })
}

fn trim_owned(value: String) -> String {
    value.trim().to_string()
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    })
}
