pub mod arbiter;
pub mod command;
pub mod config;
pub mod display;
pub mod endpoints;
pub mod error;
pub mod form;
pub mod static_files;
pub mod station;
pub mod telemetry;
pub mod types;
pub mod weather;

pub use arbiter::{ModeArbiter, OperatingMode, StationAction};
pub use command::{ControlCommand, UpdateForm};
pub use config::{NetworkConfig, RuntimeConfig, StationConfig, TelemetryConfig, WeatherApiConfig};
pub use display::DisplayFrame;
pub use endpoints::*;
pub use error::StationError;
pub use station::{Broadcaster, DisplaySink, Station, TelemetrySink, WeatherSource};
pub use types::{ModeKind, StationStatus, WeatherSample};
pub use weather::Observation;
