use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use crate::upload::errors::Result;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

fn serialize_timeout<S>(timeout: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match timeout {
        Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
        None => serializer.serialize_none(),
    }
}

fn deserialize_timeout<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = Option::<u64>::deserialize(deserializer)?;
    Ok(millis.map(Duration::from_millis))
}

/// Upload destination batching, durations in milliseconds
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchConfig {
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub debounce: Duration,
    pub limit: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
            limit: 100,
        }
    }
}

/// First-result timeouts per stage, `None` waits forever
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StageTimeouts {
    #[serde(serialize_with = "serialize_timeout", deserialize_with = "deserialize_timeout")]
    pub convert: Option<Duration>,
    #[serde(serialize_with = "serialize_timeout", deserialize_with = "deserialize_timeout")]
    pub validate: Option<Duration>,
    #[serde(serialize_with = "serialize_timeout", deserialize_with = "deserialize_timeout")]
    pub thumbnail: Option<Duration>,
    #[serde(serialize_with = "serialize_timeout", deserialize_with = "deserialize_timeout")]
    pub upload: Option<Duration>,
    #[serde(serialize_with = "serialize_timeout", deserialize_with = "deserialize_timeout")]
    pub post_process: Option<Duration>,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            convert: None,
            validate: None,
            thumbnail: None,
            upload: Some(Duration::from_secs(60 * 60)),
            post_process: Some(Duration::from_secs(30)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct UploaderConfig {
    /// Maximum concurrent transfers, 0 for no limit
    pub rate_limit: usize,
    pub url_batch: BatchConfig,
    pub timeouts: StageTimeouts,
    /// Quiet period before a batch of newly uploaded items is reported
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub newly_debounce: Duration,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            rate_limit: 10,
            url_batch: BatchConfig::default(),
            timeouts: StageTimeouts::default(),
            newly_debounce: Duration::from_millis(300),
        }
    }
}

impl UploaderConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }
}
