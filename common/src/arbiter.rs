use crate::{
    command::ControlCommand,
    config::StationConfig,
    endpoints::STATUS_STOPPED,
    types::{ModeKind, WeatherSample},
};

#[derive(Debug, Clone, PartialEq)]
pub enum OperatingMode {
    Automatic {
        current_city: String,
        poll_due_at_ms: u64,
    },
    ManualOverride {
        sample: WeatherSample,
        expires_at_ms: u64,
    },
    Stopped {
        last_city: String,
    },
}

impl OperatingMode {
    pub fn kind(&self) -> ModeKind {
        match self {
            Self::Automatic { .. } => ModeKind::Automatic,
            Self::ManualOverride { .. } => ModeKind::ManualOverride,
            Self::Stopped { .. } => ModeKind::Stopped,
        }
    }

    pub fn city(&self) -> &str {
        match self {
            Self::Automatic { current_city, .. } => current_city,
            Self::ManualOverride { sample, .. } => &sample.city,
            Self::Stopped { last_city } => last_city,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StationAction {
    FetchAndPublish { city: String },
    DisplayAndBroadcast(WeatherSample),
}

/// Owns the automatic / manual-override / stopped state machine.
///
/// Pure state transitions: every entry point returns at most one action for
/// the caller to execute and never performs I/O itself.
#[derive(Debug, Clone)]
pub struct ModeArbiter {
    config: StationConfig,
    mode: OperatingMode,
    rotation_index: usize,
}

impl ModeArbiter {
    pub fn new(mut config: StationConfig) -> Self {
        config.sanitize();
        let mode = OperatingMode::Automatic {
            current_city: config.default_city.clone(),
            poll_due_at_ms: 0,
        };
        Self {
            config,
            mode,
            rotation_index: 0,
        }
    }

    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    pub fn mode(&self) -> &OperatingMode {
        &self.mode
    }

    pub fn on_tick(&mut self, now_ms: u64) -> Option<StationAction> {
        self.expire_override_if_needed(now_ms);

        let OperatingMode::Automatic { poll_due_at_ms, .. } = self.mode else {
            return None;
        };
        if now_ms < poll_due_at_ms {
            return None;
        }

        let city = self.next_rotation_city();
        self.mode = OperatingMode::Automatic {
            current_city: city.clone(),
            poll_due_at_ms: self.next_poll_at(now_ms),
        };
        Some(StationAction::FetchAndPublish { city })
    }

    pub fn on_command(&mut self, command: ControlCommand, now_ms: u64) -> Option<StationAction> {
        match command {
            ControlCommand::SetCity(city) => Some(self.resume_polling(city, now_ms)),
            ControlCommand::ForceSample(sample) => {
                self.mode = OperatingMode::ManualOverride {
                    sample: sample.clone(),
                    expires_at_ms: now_ms.saturating_add(self.config.override_duration_ms),
                };
                Some(StationAction::DisplayAndBroadcast(sample))
            }
            ControlCommand::Stop => {
                let last_city = self.mode.city().to_string();
                self.mode = OperatingMode::Stopped {
                    last_city: last_city.clone(),
                };
                Some(StationAction::DisplayAndBroadcast(WeatherSample::new(
                    last_city,
                    STATUS_STOPPED,
                    0.0,
                )))
            }
            ControlCommand::Resume => {
                let OperatingMode::Stopped { last_city } = &self.mode else {
                    return None;
                };
                let city = last_city.clone();
                Some(self.resume_polling(city, now_ms))
            }
        }
    }

    pub fn override_remaining_ms(&self, now_ms: u64) -> u64 {
        match &self.mode {
            OperatingMode::ManualOverride { expires_at_ms, .. } => {
                expires_at_ms.saturating_sub(now_ms)
            }
            _ => 0,
        }
    }

    pub fn next_poll_in_ms(&self, now_ms: u64) -> Option<u64> {
        match &self.mode {
            OperatingMode::Automatic { poll_due_at_ms, .. } => {
                Some(poll_due_at_ms.saturating_sub(now_ms))
            }
            _ => None,
        }
    }

    fn expire_override_if_needed(&mut self, now_ms: u64) {
        let expired_city = match &self.mode {
            OperatingMode::ManualOverride {
                sample,
                expires_at_ms,
            } if now_ms >= *expires_at_ms => sample.city.clone(),
            _ => return,
        };
        self.mode = OperatingMode::Automatic {
            current_city: expired_city,
            poll_due_at_ms: now_ms,
        };
    }

    // Polling is due again right away; the fetch returned here does not
    // push the next rotation back.
    fn resume_polling(&mut self, city: String, now_ms: u64) -> StationAction {
        self.mode = OperatingMode::Automatic {
            current_city: city.clone(),
            poll_due_at_ms: now_ms,
        };
        StationAction::FetchAndPublish { city }
    }

    fn next_poll_at(&self, now_ms: u64) -> u64 {
        now_ms.saturating_add(self.config.poll_interval_ms)
    }

    fn next_rotation_city(&mut self) -> String {
        let cities = &self.config.cities;
        let city = cities[self.rotation_index % cities.len()].clone();
        self.rotation_index = (self.rotation_index + 1) % cities.len();
        city
    }
}
