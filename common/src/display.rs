use crate::{endpoints::TOKEN_MANUAL, types::WeatherSample};

/// Text columns available on a 128px panel with a 6px wide font.
pub const PANEL_COLUMNS: usize = 21;
/// The value line is drawn at double size.
pub const VALUE_COLUMNS: usize = PANEL_COLUMNS / 2;

/// Panel wording for operator-injected readings; subscribers still see `MANUAL`.
pub const PANEL_OVERRIDE: &str = "OVERRIDE";
pub const PANEL_RESUMING: &str = "Resuming...";

#[derive(Debug, Clone, PartialEq)]
pub struct DisplayFrame {
    pub title: String,
    pub status: String,
    pub value: f32,
}

impl DisplayFrame {
    pub fn new(title: impl Into<String>, status: impl Into<String>, value: f32) -> Self {
        Self {
            title: title.into(),
            status: status.into(),
            value,
        }
    }

    pub fn boot() -> Self {
        Self::new("Starting...", "", 0.0)
    }

    /// Shown while the station leaves the stopped state, before the fetch lands.
    pub fn resuming(city: impl Into<String>, last_value: f32) -> Self {
        Self::new(city, PANEL_RESUMING, last_value)
    }

    pub fn value_text(&self) -> String {
        format!("{:.2} C", self.value)
    }

    /// Title, status and value lines clipped to the panel width.
    pub fn lines(&self) -> [String; 3] {
        [
            clip(&self.title, PANEL_COLUMNS),
            clip(&self.status, PANEL_COLUMNS),
            clip(&self.value_text(), VALUE_COLUMNS),
        ]
    }
}

impl From<&WeatherSample> for DisplayFrame {
    fn from(sample: &WeatherSample) -> Self {
        let status = match sample.description.as_str() {
            TOKEN_MANUAL => PANEL_OVERRIDE,
            description => description,
        };
        Self::new(sample.city.clone(), status, sample.temperature_c)
    }
}

fn clip(text: &str, columns: usize) -> String {
    text.chars().take(columns).collect()
}
