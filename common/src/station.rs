use log::{info, warn};

use crate::{
    arbiter::{ModeArbiter, StationAction},
    command::ControlCommand,
    display::DisplayFrame,
    error::StationError,
    types::{ModeKind, StationStatus, WeatherSample},
    weather::Observation,
};

pub trait WeatherSource {
    fn fetch(&mut self, city: &str) -> Result<Observation, StationError>;
}

pub trait TelemetrySink {
    /// Returns the delivery status code reported by the channel.
    fn publish(&mut self, sample: &WeatherSample) -> Result<u16, StationError>;
}

pub trait DisplaySink {
    fn render(&mut self, frame: &DisplayFrame);
}

/// Best-effort fan-out to push-channel subscribers. Must not block.
pub trait Broadcaster {
    fn broadcast(&mut self, sample: &WeatherSample);
}

/// Executes arbiter actions against the I/O collaborators.
///
/// All failures are absorbed here: a failed fetch keeps the previous sample
/// and the current mode, a failed publish never holds back the display or
/// the broadcast.
pub struct Station<W, T, D, B> {
    arbiter: ModeArbiter,
    weather: W,
    telemetry: T,
    display: D,
    broadcaster: B,
    latest: Option<WeatherSample>,
    last_fetched_temp_c: f32,
    last_fetch_error: Option<StationError>,
}

impl<W, T, D, B> Station<W, T, D, B>
where
    W: WeatherSource,
    T: TelemetrySink,
    D: DisplaySink,
    B: Broadcaster,
{
    pub fn new(arbiter: ModeArbiter, weather: W, telemetry: T, display: D, broadcaster: B) -> Self {
        Self {
            arbiter,
            weather,
            telemetry,
            display,
            broadcaster,
            latest: None,
            last_fetched_temp_c: 0.0,
            last_fetch_error: None,
        }
    }

    pub fn arbiter(&self) -> &ModeArbiter {
        &self.arbiter
    }

    pub fn latest_sample(&self) -> Option<&WeatherSample> {
        self.latest.as_ref()
    }

    pub fn show_boot_screen(&mut self) {
        self.display.render(&DisplayFrame::boot());
    }

    pub fn tick(&mut self, now_ms: u64) {
        if let Some(action) = self.arbiter.on_tick(now_ms) {
            self.execute(action);
        }
    }

    pub fn handle_command(&mut self, command: ControlCommand, now_ms: u64) {
        info!("control command: {command:?}");
        let leaving_stop = matches!(command, ControlCommand::Resume)
            && self.arbiter.mode().kind() == ModeKind::Stopped;

        match self.arbiter.on_command(command, now_ms) {
            Some(action) => {
                if leaving_stop {
                    let city = self.arbiter.mode().city().to_string();
                    self.display
                        .render(&DisplayFrame::resuming(city, self.last_fetched_temp_c));
                }
                self.execute(action);
            }
            None => info!("command left mode unchanged"),
        }
    }

    pub fn status(&self, now_ms: u64) -> StationStatus {
        StationStatus {
            mode: self.arbiter.mode().kind().as_str(),
            city: self.arbiter.mode().city().to_string(),
            weather: self.latest.as_ref().map(|sample| sample.description.clone()),
            temp: self.latest.as_ref().map(|sample| sample.temperature_c),
            override_remaining_ms: self.arbiter.override_remaining_ms(now_ms),
            next_poll_in_ms: self.arbiter.next_poll_in_ms(now_ms),
            last_fetch_error: self.last_fetch_error.as_ref().map(ToString::to_string),
        }
    }

    fn execute(&mut self, action: StationAction) {
        match action {
            StationAction::FetchAndPublish { city } => self.fetch_and_publish(&city),
            StationAction::DisplayAndBroadcast(sample) => self.display_and_broadcast(sample),
        }
    }

    fn fetch_and_publish(&mut self, city: &str) {
        let sample = match self.weather.fetch(city) {
            Ok(observation) => observation.into_sample(city),
            Err(StationError::NetworkUnavailable) => {
                info!("network unavailable, skipping fetch for {city}");
                self.last_fetch_error = Some(StationError::NetworkUnavailable);
                return;
            }
            Err(err) => {
                warn!("weather fetch for {city} failed: {err}");
                self.last_fetch_error = Some(err);
                return;
            }
        };
        self.last_fetch_error = None;
        info!(
            "weather for {}: {} / {:.2} C",
            sample.city, sample.description, sample.temperature_c
        );

        self.display.render(&DisplayFrame::from(&sample));
        match self.telemetry.publish(&sample) {
            Ok(status) => info!("telemetry delivered (status {status})"),
            Err(err) => warn!("{err}"),
        }
        self.broadcaster.broadcast(&sample);
        self.last_fetched_temp_c = sample.temperature_c;
        self.latest = Some(sample);
    }

    fn display_and_broadcast(&mut self, sample: WeatherSample) {
        self.display.render(&DisplayFrame::from(&sample));
        self.broadcaster.broadcast(&sample);
        self.latest = Some(sample);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::config::StationConfig;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct FakeWeather {
        calls: Vec<String>,
        failures: VecDeque<StationError>,
    }

    impl WeatherSource for FakeWeather {
        fn fetch(&mut self, city: &str) -> Result<Observation, StationError> {
            self.calls.push(city.to_string());
            if let Some(err) = self.failures.pop_front() {
                return Err(err);
            }
            Ok(Observation {
                description: format!("clear over {city}"),
                temperature_c: 20.0,
            })
        }
    }

    #[derive(Default)]
    struct FakeTelemetry {
        published: Vec<WeatherSample>,
        reject: bool,
    }

    impl TelemetrySink for FakeTelemetry {
        fn publish(&mut self, sample: &WeatherSample) -> Result<u16, StationError> {
            self.published.push(sample.clone());
            if self.reject {
                Err(StationError::PublishFailed("rate limited".to_string()))
            } else {
                Ok(200)
            }
        }
    }

    #[derive(Default)]
    struct FakeDisplay {
        frames: Vec<DisplayFrame>,
    }

    impl DisplaySink for FakeDisplay {
        fn render(&mut self, frame: &DisplayFrame) {
            self.frames.push(frame.clone());
        }
    }

    #[derive(Default)]
    struct FakeBroadcaster {
        sent: Vec<WeatherSample>,
    }

    impl Broadcaster for FakeBroadcaster {
        fn broadcast(&mut self, sample: &WeatherSample) {
            self.sent.push(sample.clone());
        }
    }

    type TestStation = Station<FakeWeather, FakeTelemetry, FakeDisplay, FakeBroadcaster>;

    fn station() -> TestStation {
        let config = StationConfig {
            poll_interval_ms: 5_000,
            override_duration_ms: 5_000,
            cities: vec![
                "Bogota".to_string(),
                "Medellin".to_string(),
                "Cali".to_string(),
            ],
            default_city: "Bogota".to_string(),
        };
        Station::new(
            ModeArbiter::new(config),
            FakeWeather::default(),
            FakeTelemetry::default(),
            FakeDisplay::default(),
            FakeBroadcaster::default(),
        )
    }

    #[test]
    fn due_tick_fetches_displays_publishes_and_broadcasts() {
        let mut station = station();
        station.tick(0);

        let expected = WeatherSample::new("Bogota", "clear over Bogota", 20.0);
        assert_eq!(station.weather.calls, vec!["Bogota".to_string()]);
        assert_eq!(station.display.frames, vec![DisplayFrame::from(&expected)]);
        assert_eq!(station.telemetry.published, vec![expected.clone()]);
        assert_eq!(station.broadcaster.sent, vec![expected.clone()]);
        assert_eq!(station.latest_sample(), Some(&expected));
    }

    #[test]
    fn force_sample_never_fetches_or_publishes() {
        let mut station = station();
        let manual = WeatherSample::new("Cali", "MANUAL", 35.0);

        station.handle_command(ControlCommand::ForceSample(manual.clone()), 0);
        for now in (0..5_000).step_by(250) {
            station.tick(now);
        }

        assert!(station.weather.calls.is_empty());
        assert!(station.telemetry.published.is_empty());
        assert_eq!(station.broadcaster.sent, vec![manual.clone()]);
        assert_eq!(station.latest_sample(), Some(&manual));

        station.tick(5_000);
        assert_eq!(station.weather.calls, vec!["Bogota".to_string()]);
        assert_eq!(station.arbiter().mode().kind(), ModeKind::Automatic);
    }

    #[test]
    fn fetch_failure_keeps_stale_sample_and_mode() {
        let mut station = station();
        station.tick(0);
        let stale = station.latest_sample().cloned();

        station
            .weather
            .failures
            .push_back(StationError::FetchFailed { status: 500 });
        station.tick(5_000);

        assert_eq!(station.latest_sample().cloned(), stale);
        assert_eq!(station.arbiter().mode().kind(), ModeKind::Automatic);
        assert_eq!(station.broadcaster.sent.len(), 1);
        assert_eq!(station.telemetry.published.len(), 1);
        assert_eq!(
            station.status(5_000).last_fetch_error.as_deref(),
            Some("weather request failed with HTTP status 500")
        );
    }

    #[test]
    fn network_unavailable_skips_fetch_without_mode_change() {
        let mut station = station();
        station
            .weather
            .failures
            .push_back(StationError::NetworkUnavailable);

        station.handle_command(ControlCommand::SetCity("Pasto".to_string()), 0);

        assert_eq!(station.latest_sample(), None);
        assert!(station.display.frames.is_empty());
        assert_eq!(station.arbiter().mode().city(), "Pasto");
    }

    #[test]
    fn publish_failure_does_not_block_display_or_broadcast() {
        let mut station = station();
        station.telemetry.reject = true;

        station.tick(0);

        assert_eq!(station.display.frames.len(), 1);
        assert_eq!(station.broadcaster.sent.len(), 1);
        assert!(station.latest_sample().is_some());
    }

    #[test]
    fn stop_tick_resume_scenario() {
        let mut station = station();
        station.tick(0);

        station.handle_command(ControlCommand::Stop, 1_000);
        let stopped = WeatherSample::new("Bogota", "STOPPED", 0.0);
        assert_eq!(station.broadcaster.sent.last(), Some(&stopped));
        assert_eq!(station.status(1_000).mode, "STOPPED");

        station.tick(30_000);
        assert_eq!(station.weather.calls, vec!["Bogota".to_string()]);

        station.handle_command(ControlCommand::Resume, 31_000);
        assert_eq!(
            station.weather.calls,
            vec!["Bogota".to_string(), "Bogota".to_string()]
        );
        assert_eq!(station.status(31_000).mode, "AUTOMATIC");
        assert_eq!(station.status(31_000).next_poll_in_ms, Some(0));

        station.tick(31_000);
        assert_eq!(station.weather.calls.len(), 3);
    }

    #[test]
    fn set_city_fetches_before_returning() {
        let mut station = station();
        station.handle_command(ControlCommand::SetCity("Pasto".to_string()), 0);

        assert_eq!(station.weather.calls, vec!["Pasto".to_string()]);
        assert_eq!(station.telemetry.published.len(), 1);
        assert_eq!(
            station.broadcaster.sent,
            vec![WeatherSample::new("Pasto", "clear over Pasto", 20.0)]
        );
    }

    #[test]
    fn status_reports_override_timer() {
        let mut station = station();
        station.handle_command(
            ControlCommand::ForceSample(WeatherSample::new("Cali", "MANUAL", 35.0)),
            1_000,
        );

        let status = station.status(2_500);
        assert_eq!(status.mode, "MANUAL_OVERRIDE");
        assert_eq!(status.city, "Cali");
        assert_eq!(status.temp, Some(35.0));
        assert_eq!(status.override_remaining_ms, 3_500);
        assert_eq!(status.next_poll_in_ms, None);
    }

    #[test]
    fn resume_shows_resuming_frame_before_the_fetch() {
        let mut station = station();
        station.tick(0);
        station.handle_command(ControlCommand::Stop, 1_000);
        station.handle_command(ControlCommand::Resume, 2_000);

        let frames = &station.display.frames;
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[1], DisplayFrame::new("Bogota", "STOPPED", 0.0));
        assert_eq!(frames[2], DisplayFrame::resuming("Bogota", 20.0));
        assert_eq!(
            frames[3],
            DisplayFrame::new("Bogota", "clear over Bogota", 20.0)
        );
    }

    #[test]
    fn override_reads_override_on_panel_and_manual_on_push() {
        let mut station = station();
        let manual = WeatherSample::new("Cali", "MANUAL", 35.0);

        station.handle_command(ControlCommand::ForceSample(manual.clone()), 0);

        assert_eq!(
            station.display.frames,
            vec![DisplayFrame::new("Cali", "OVERRIDE", 35.0)]
        );
        assert_eq!(station.broadcaster.sent, vec![manual]);
    }

    #[test]
    fn boot_screen_is_rendered() {
        let mut station = station();
        station.show_boot_screen();
        assert_eq!(station.display.frames, vec![DisplayFrame::boot()]);
    }
}
