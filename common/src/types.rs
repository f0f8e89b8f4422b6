use serde::{Deserialize, Serialize};

/// A single reading as shown on the panel and pushed to subscribers.
///
/// Serializes to the push-channel wire shape `{"city", "weather", "temp"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherSample {
    pub city: String,
    #[serde(rename = "weather")]
    pub description: String,
    #[serde(rename = "temp")]
    pub temperature_c: f32,
}

impl WeatherSample {
    pub fn new(city: impl Into<String>, description: impl Into<String>, temperature_c: f32) -> Self {
        Self {
            city: city.into(),
            description: description.into(),
            temperature_c,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModeKind {
    Automatic,
    ManualOverride,
    Stopped,
}

impl ModeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Automatic => "AUTOMATIC",
            Self::ManualOverride => "MANUAL_OVERRIDE",
            Self::Stopped => "STOPPED",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StationStatus {
    pub mode: &'static str,
    pub city: String,
    pub weather: Option<String>,
    pub temp: Option<f32>,
    #[serde(rename = "overrideRemainingMs")]
    pub override_remaining_ms: u64,
    #[serde(rename = "nextPollInMs")]
    pub next_poll_in_ms: Option<u64>,
    #[serde(rename = "lastFetchError")]
    pub last_fetch_error: Option<String>,
}
