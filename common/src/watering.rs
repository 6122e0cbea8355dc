use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::RecordError;

/// What a watering task does when it fires. Text form: `level-liters-minutes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WateringArgs {
    /// 1..=10, tenths of the configured valve duration.
    #[serde(rename = "valveLevel")]
    pub valve_level: u8,
    pub liters: u8,
    pub minutes: u8,
}

impl WateringArgs {
    pub const MAX_LEVEL: u8 = 10;

    pub fn new(valve_level: u8, liters: u8, minutes: u8) -> Option<Self> {
        (1..=Self::MAX_LEVEL)
            .contains(&valve_level)
            .then_some(Self {
                valve_level,
                liters,
                minutes,
            })
    }

    pub fn valve_percentage(&self) -> u8 {
        self.valve_level.min(Self::MAX_LEVEL) * 10
    }

    pub fn open_ms(&self) -> Option<u32> {
        (self.minutes > 0).then(|| u32::from(self.minutes) * 60_000)
    }
}

impl Default for WateringArgs {
    fn default() -> Self {
        Self {
            valve_level: Self::MAX_LEVEL,
            liters: 0,
            minutes: 0,
        }
    }
}

impl fmt::Display for WateringArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.valve_level, self.liters, self.minutes)
    }
}

impl FromStr for WateringArgs {
    type Err = RecordError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = raw.split('-').collect();
        let [level, liters, minutes] = parts[..] else {
            return Err(RecordError::Args(raw.to_string()));
        };

        let number = |value: &str| {
            value
                .parse::<u8>()
                .map_err(|_| RecordError::Args(raw.to_string()))
        };

        Self::new(number(level)?, number(liters)?, number(minutes)?)
            .ok_or_else(|| RecordError::Args(raw.to_string()))
    }
}
