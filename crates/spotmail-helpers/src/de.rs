use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

/// Duration as written in config files: bare seconds (`60`) or a humantime
/// string (`"1m"`, `"1h 30m"`).
#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

impl RawDuration {
    fn into_duration(self) -> Result<Option<Duration>, humantime::DurationError> {
        match self {
            Self::Seconds(secs) => Ok(Some(Duration::from_secs(secs))),
            Self::Text(value) => {
                let value = value.trim();
                if value.is_empty() {
                    return Ok(None);
                }
                humantime::parse_duration(value).map(Some)
            }
        }
    }
}

/// `null`, a missing key and an empty string all map to `None`.
pub fn deserialize_optional_duration<'de, D>(
    deserializer: D
) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RawDuration>::deserialize(deserializer)? {
        None => Ok(None),
        Some(raw) => raw.into_duration().map_err(D::Error::custom),
    }
}

/// Like [`deserialize_optional_duration`] but the value must be present and
/// non-empty; pair it with `#[serde(default = "...")]` for optional keys.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    RawDuration::deserialize(deserializer)?
        .into_duration()
        .map_err(D::Error::custom)?
        .ok_or_else(|| D::Error::custom("duration must not be empty"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Sample {
        #[serde(deserialize_with = "super::deserialize_duration")]
        window: Duration,
        #[serde(default, deserialize_with = "super::deserialize_optional_duration")]
        poll: Option<Duration>,
    }

    #[test]
    fn accepts_seconds_and_humantime() {
        let sample: Sample = serde_yaml::from_str("window: 90\npoll: 5m\n").unwrap();
        assert_eq!(sample.window, Duration::from_secs(90));
        assert_eq!(sample.poll, Some(Duration::from_secs(300)));
    }

    #[test]
    fn empty_optional_duration_is_none() {
        let sample: Sample =
            serde_yaml::from_str("window: 1m\npoll: \"\"\n").unwrap();
        assert_eq!(sample.window, Duration::from_secs(60));
        assert!(sample.poll.is_none());

        let sample: Sample = serde_yaml::from_str("window: 1s\n").unwrap();
        assert!(sample.poll.is_none());
    }

    #[test]
    fn empty_required_duration_is_rejected() {
        assert!(serde_yaml::from_str::<Sample>("window: \"\"\n").is_err());
        assert!(serde_yaml::from_str::<Sample>("window: soon\n").is_err());
    }
}
