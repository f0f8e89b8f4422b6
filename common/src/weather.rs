use serde::Deserialize;

use crate::{config::WeatherApiConfig, error::StationError, form, types::WeatherSample};

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub description: String,
    pub temperature_c: f32,
}

impl Observation {
    pub fn into_sample(self, city: impl Into<String>) -> WeatherSample {
        WeatherSample::new(city, self.description, self.temperature_c)
    }
}

#[derive(Debug, Deserialize)]
struct CurrentWeatherResponse {
    weather: Vec<ConditionEntry>,
    main: MainReadings,
}

#[derive(Debug, Deserialize)]
struct ConditionEntry {
    description: String,
}

#[derive(Debug, Deserialize)]
struct MainReadings {
    temp: f32,
}

/// Query pairs for the current-weather endpoint, unencoded.
pub fn request_query<'a>(config: &'a WeatherApiConfig, city: &'a str) -> [(&'a str, &'a str); 4] {
    [
        ("q", city),
        ("appid", config.api_key.as_str()),
        ("units", config.units.as_str()),
        ("lang", config.lang.as_str()),
    ]
}

pub fn endpoint(config: &WeatherApiConfig) -> String {
    format!("{}/data/2.5/weather", config.base_url)
}

pub fn request_url(config: &WeatherApiConfig, city: &str) -> String {
    let query = form::encode_pairs(request_query(config, city));
    format!("{}?{query}", endpoint(config))
}

pub fn check_status(status: u16) -> Result<(), StationError> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(StationError::FetchFailed { status })
    }
}

pub fn parse_observation(body: &[u8]) -> Result<Observation, StationError> {
    let response: CurrentWeatherResponse = serde_json::from_slice(body)?;
    let condition = response
        .weather
        .into_iter()
        .next()
        .ok_or_else(|| StationError::MalformedResponse("empty 'weather' array".to_string()))?;

    if !response.main.temp.is_finite() {
        return Err(StationError::MalformedResponse(
            "non-finite temperature".to_string(),
        ));
    }

    Ok(Observation {
        description: condition.description,
        temperature_c: response.main.temp,
    })
}
