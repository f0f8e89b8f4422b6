use serde::{Deserialize, Serialize};

const MIN_INTERVAL_MS: u64 = 1_000;
const MAX_INTERVAL_MS: u64 = 3_600_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StationConfig {
    pub poll_interval_ms: u64,
    pub override_duration_ms: u64,
    pub cities: Vec<String>,
    pub default_city: String,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            override_duration_ms: 5_000,
            cities: default_cities(),
            default_city: "Bogota".to_string(),
        }
    }
}

fn default_cities() -> Vec<String> {
    ["Bogota", "Medellin", "Cali", "Barranquilla", "Cartagena"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

impl StationConfig {
    pub fn sanitize(&mut self) {
        self.poll_interval_ms = self.poll_interval_ms.clamp(MIN_INTERVAL_MS, MAX_INTERVAL_MS);
        self.override_duration_ms = self
            .override_duration_ms
            .clamp(MIN_INTERVAL_MS, MAX_INTERVAL_MS);

        self.cities = self
            .cities
            .iter()
            .map(|city| city.trim())
            .filter(|city| !city.is_empty())
            .map(str::to_string)
            .collect();
        if self.cities.is_empty() {
            self.cities = default_cities();
        }

        let trimmed = self.default_city.trim();
        self.default_city = if trimmed.is_empty() {
            self.cities[0].clone()
        } else {
            trimmed.to_string()
        };
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub http_port: u16,
    pub push_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            http_port: 80,
            push_port: 81,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherApiConfig {
    pub base_url: String,
    pub api_key: String,
    pub units: String,
    pub lang: String,
}

impl Default for WeatherApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://api.openweathermap.org".to_string(),
            api_key: String::new(),
            units: "metric".to_string(),
            lang: "es".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub base_url: String,
    pub channel_id: u64,
    pub write_api_key: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            base_url: "http://api.thingspeak.com".to_string(),
            channel_id: 0,
            write_api_key: String::new(),
        }
    }
}

impl TelemetryConfig {
    pub fn is_configured(&self) -> bool {
        !self.write_api_key.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub station: StationConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub weather: WeatherApiConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.station.sanitize();

        let base = self.weather.base_url.trim_end_matches('/');
        self.weather.base_url = base.to_string();
        let base = self.telemetry.base_url.trim_end_matches('/');
        self.telemetry.base_url = base.to_string();
    }
}
