use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{CoreError, CoreErrorKind, CoreResult, DEFAULT_PAGE_SIZE};

/// How long a service may sit in its readiness stage.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy", content = "limit")]
pub enum ReadinessPolicy {
    #[default]
    WaitIndefinitely,
    /// Fails the service with a timeout once the limit elapses.
    Deadline(Duration),
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    pub available_slots: i64,
    pub dispatch_interval: Duration,
    pub sync_interval: Duration,
    pub sync_page_size: usize,
    pub default_working_dir: PathBuf,
    pub readiness_policy: ReadinessPolicy,
    pub readiness_poll_interval: Duration,
    pub service_timeout: Option<Duration>,
    pub result_retries: u32,
    pub result_retry_wait: Duration,
    pub persistence_retries: u32,
    pub persistence_retry_backoff: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            available_slots: 4,
            dispatch_interval: Duration::from_secs(1),
            sync_interval: Duration::from_secs(30),
            sync_page_size: DEFAULT_PAGE_SIZE,
            default_working_dir: std::env::temp_dir().join("jacs"),
            readiness_policy: ReadinessPolicy::WaitIndefinitely,
            readiness_poll_interval: Duration::from_secs(10),
            service_timeout: None,
            result_retries: 60,
            result_retry_wait: Duration::from_secs(1),
            persistence_retries: 3,
            persistence_retry_backoff: Duration::from_millis(100),
        }
    }
}

impl DispatcherConfig {
    pub fn from_env() -> CoreResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from `lookup`, falling back to defaults for unset keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> CoreResult<Self> {
        let env = EnvReader { lookup: &lookup };
        let mut config = Self::default();

        if let Some(slots) = env.u64("JACS_AVAILABLE_SLOTS")? {
            config.available_slots = i64::try_from(slots).map_err(|_| {
                invalid_config("JACS_AVAILABLE_SLOTS is too large".to_string())
            })?;
        }
        if let Some(interval) = env.positive_millis("JACS_DISPATCH_INTERVAL_MS")? {
            config.dispatch_interval = interval;
        }
        if let Some(interval) = env.positive_millis("JACS_SYNC_INTERVAL_MS")? {
            config.sync_interval = interval;
        }
        if let Some(page_size) = env.u64("JACS_SYNC_PAGE_SIZE")? {
            if page_size == 0 {
                return Err(invalid_config(
                    "JACS_SYNC_PAGE_SIZE must be greater than zero".to_string(),
                ));
            }
            config.sync_page_size = usize::try_from(page_size).unwrap_or(usize::MAX);
        }
        if let Some(dir) = env.string("JACS_DEFAULT_WORKING_DIR") {
            config.default_working_dir = PathBuf::from(dir);
        }
        // 0 keeps the indefinite wait
        if let Some(limit) = env.u64("JACS_READINESS_TIMEOUT_MS")?
            && limit > 0
        {
            config.readiness_policy = ReadinessPolicy::Deadline(Duration::from_millis(limit));
        }
        if let Some(interval) = env.positive_millis("JACS_READINESS_POLL_MS")? {
            config.readiness_poll_interval = interval;
        }
        if let Some(timeout) = env.u64("JACS_SERVICE_TIMEOUT_MS")?
            && timeout > 0
        {
            config.service_timeout = Some(Duration::from_millis(timeout));
        }
        if let Some(retries) = env.u32("JACS_RESULT_RETRIES")? {
            config.result_retries = retries;
        }
        if let Some(wait) = env.millis("JACS_RESULT_RETRY_WAIT_MS")? {
            config.result_retry_wait = wait;
        }
        if let Some(retries) = env.u32("JACS_PERSISTENCE_RETRIES")? {
            config.persistence_retries = retries;
        }
        if let Some(backoff) = env.millis("JACS_PERSISTENCE_BACKOFF_MS")? {
            config.persistence_retry_backoff = backoff;
        }

        Ok(config)
    }
}

struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).and_then(|value| {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn u64(&self, name: &str) -> CoreResult<Option<u64>> {
        let Some(value) = self.string(name) else {
            return Ok(None);
        };
        value
            .parse::<u64>()
            .map(Some)
            .map_err(|error| invalid_config(format!("{name} must be a u64: {error}")))
    }

    fn u32(&self, name: &str) -> CoreResult<Option<u32>> {
        let Some(value) = self.string(name) else {
            return Ok(None);
        };
        value
            .parse::<u32>()
            .map(Some)
            .map_err(|error| invalid_config(format!("{name} must be a u32: {error}")))
    }

    fn millis(&self, name: &str) -> CoreResult<Option<Duration>> {
        Ok(self.u64(name)?.map(Duration::from_millis))
    }

    fn positive_millis(&self, name: &str) -> CoreResult<Option<Duration>> {
        match self.u64(name)? {
            Some(0) => Err(invalid_config(format!(
                "{name} must be greater than zero"
            ))),
            other => Ok(other.map(Duration::from_millis)),
        }
    }
}

fn invalid_config(message: String) -> CoreError {
    CoreError::new(CoreErrorKind::InvalidInput, message)
}
