//! Construction-time options for queues and workers.
//!
//! Every field has a default, so `QueueOptions::default()` is a working setup.
//! Both structs deserialize from any serde format; durations accept either a
//! number of seconds or a human-readable string such as `"30m"` or `"7days"`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_PROCESSING_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const DEFAULT_DONE_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const DEFAULT_FAILED_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Settings for the queue's background maintenance sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// How often the sweep runs
    #[serde(with = "duration")]
    pub maintenance_interval: Duration,
    /// How long a job may stay in `processing` before it is returned to `pending`
    #[serde(with = "duration")]
    pub processing_timeout: Duration,
    /// How long `done` jobs are kept, measured from their creation
    #[serde(with = "duration")]
    pub remove_done_jobs_older_than: Duration,
    /// How long `failed` jobs are kept, measured from their failure
    #[serde(with = "duration")]
    pub remove_failed_jobs_older_than: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            processing_timeout: DEFAULT_PROCESSING_TIMEOUT,
            remove_done_jobs_older_than: DEFAULT_DONE_RETENTION,
            remove_failed_jobs_older_than: DEFAULT_FAILED_RETENTION,
        }
    }
}

/// Settings for a single worker's poll loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// How long to sleep when an iteration found no work
    #[serde(with = "duration")]
    pub poll_interval: Duration,
    /// Upper bound of the random delay added to each idle sleep
    #[serde(with = "duration")]
    pub jitter: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: Duration::ZERO,
        }
    }
}

/// Serde adapter for human-readable durations.
pub(crate) mod duration {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;
    use std::time::Duration;

    pub(crate) fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl Visitor<'_> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a duration as seconds or a human-readable string like '5m'")
            }

            fn visit_u64<E>(self, seconds: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(Duration::from_secs(seconds))
            }

            fn visit_i64<E>(self, seconds: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                u64::try_from(seconds)
                    .map(Duration::from_secs)
                    .map_err(|_| de::Error::custom(format!("negative duration: {seconds}")))
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                humantime::parse_duration(value)
                    .map_err(|e| de::Error::custom(format!("Invalid duration '{value}': {e}")))
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}
