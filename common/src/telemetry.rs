//! ThingSpeak channel update encoding.
//!
//! Field 1 carries the city, field 2 the description and field 3 the
//! temperature. The channel answers `200` with the new entry id, or `0` when
//! it rejected the write (usually the free-tier rate limit).

use crate::{config::TelemetryConfig, error::StationError, form, types::WeatherSample};

pub const FIELD_CITY: &str = "field1";
pub const FIELD_DESCRIPTION: &str = "field2";
pub const FIELD_TEMPERATURE: &str = "field3";

pub fn endpoint(config: &TelemetryConfig) -> String {
    format!("{}/update", config.base_url)
}

pub fn update_query(config: &TelemetryConfig, sample: &WeatherSample) -> Vec<(&'static str, String)> {
    vec![
        ("api_key", config.write_api_key.clone()),
        (FIELD_CITY, sample.city.clone()),
        (FIELD_DESCRIPTION, sample.description.clone()),
        (FIELD_TEMPERATURE, format!("{:.2}", sample.temperature_c)),
    ]
}

pub fn update_url(config: &TelemetryConfig, sample: &WeatherSample) -> String {
    let pairs = update_query(config, sample);
    let query = form::encode_pairs(pairs.iter().map(|(name, value)| (*name, value.as_str())));
    format!("{}?{query}", endpoint(config))
}

/// Maps the channel's reply to the delivery status code.
pub fn interpret_response(status: u16, body: &str) -> Result<u16, StationError> {
    if status != 200 {
        return Err(StationError::PublishFailed(format!("HTTP status {status}")));
    }

    match body.trim().parse::<u64>() {
        Ok(0) => Err(StationError::PublishFailed(
            "channel rejected the update".to_string(),
        )),
        Ok(_) => Ok(status),
        Err(_) => Err(StationError::PublishFailed(format!(
            "unexpected response body `{}`",
            body.trim()
        ))),
    }
}
