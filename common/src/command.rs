
use crate::{
    endpoints::{FORM_FIELD_CITY, FORM_FIELD_TEMP, FORM_FIELD_WEATHER, TOKEN_MANUAL, TOKEN_RESUME, TOKEN_STOP},
    error::StationError,
    form,
    types::WeatherSample,
};

#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    SetCity(String),
    ForceSample(WeatherSample),
    Stop,
    Resume,
}

impl ControlCommand {
    /// Push-channel frames carry a bare city name.
    pub fn from_push_text(text: &str) -> Option<Self> {
        let city = text.trim();
        if city.is_empty() {
            return None;
        }
        Some(Self::SetCity(city.to_string()))
    }

    pub fn ack_message(&self) -> &'static str {
        match self {
            Self::SetCity(_) => "City updated, automatic mode resumed",
            Self::ForceSample(_) => "Manual override accepted",
            Self::Stop => "Execution stopped",
            Self::Resume => "Execution resumed",
        }
    }
}

/// Raw `POST /update` form. Every field is optional here so that missing
/// fields surface as [`StationError::MalformedCommand`].
#[derive(Debug, Clone, Default)]
pub struct UpdateForm {
    pub city: Option<String>,
    pub weather: Option<String>,
    pub temp: Option<String>,
}

impl UpdateForm {
    pub fn from_urlencoded(body: &str) -> Self {
        let mut update = Self::default();
        for (name, value) in form::parse_pairs(body) {
            match name.as_str() {
                FORM_FIELD_CITY => update.city = Some(value),
                FORM_FIELD_WEATHER => update.weather = Some(value),
                FORM_FIELD_TEMP => update.temp = Some(value),
                _ => {}
            }
        }
        update
    }

    pub fn into_command(self) -> Result<ControlCommand, StationError> {
        let city = self
            .city
            .map(|city| city.trim().to_string())
            .filter(|city| !city.is_empty())
            .ok_or_else(|| StationError::MalformedCommand("missing 'city' field".to_string()))?;
        let token = self
            .weather
            .ok_or_else(|| StationError::MalformedCommand("missing 'weather' field".to_string()))?;
        let raw_temp = self
            .temp
            .ok_or_else(|| StationError::MalformedCommand("missing 'temp' field".to_string()))?;
        let temperature_c = raw_temp
            .trim()
            .parse::<f32>()
            .ok()
            .filter(|temp| temp.is_finite())
            .ok_or_else(|| StationError::MalformedCommand(format!("invalid 'temp' value `{raw_temp}`")))?;

        let command = match token.trim() {
            TOKEN_STOP => ControlCommand::Stop,
            TOKEN_RESUME => ControlCommand::Resume,
            TOKEN_MANUAL => {
                ControlCommand::ForceSample(WeatherSample::new(city, TOKEN_MANUAL, temperature_c))
            }
            _ => ControlCommand::SetCity(city),
        };
        Ok(command)
    }
}
