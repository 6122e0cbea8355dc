use chrono::{DateTime, Datelike, TimeZone, Timelike, Weekday};
use serde::{Deserialize, Serialize};

/// 2024-01-01T00:00:00Z. An RTC reading before this has not been set by SNTP yet.
pub const MIN_SYNCED_EPOCH: i64 = 1_704_067_200;

pub fn elapsed_ms(now_ms: u32, since_ms: u32) -> u32 {
    now_ms.wrapping_sub(since_ms)
}

pub fn is_plausible_epoch(epoch_secs: i64) -> bool {
    epoch_secs >= MIN_SYNCED_EPOCH
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DayOfWeek {
    Sun,
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
}

impl DayOfWeek {
    pub const ALL: [DayOfWeek; 7] = [
        Self::Sun,
        Self::Mon,
        Self::Tue,
        Self::Wed,
        Self::Thu,
        Self::Fri,
        Self::Sat,
    ];

    /// Sunday is 0.
    pub fn index(self) -> usize {
        match self {
            Self::Sun => 0,
            Self::Mon => 1,
            Self::Tue => 2,
            Self::Wed => 3,
            Self::Thu => 4,
            Self::Fri => 5,
            Self::Sat => 6,
        }
    }

    pub fn from_index(index: usize) -> Self {
        Self::ALL[index % 7]
    }

    pub fn from_chrono(weekday: Weekday) -> Self {
        Self::from_index(weekday.num_days_from_sunday() as usize)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sun => "SUN",
            Self::Mon => "MON",
            Self::Tue => "TUE",
            Self::Wed => "WED",
            Self::Thu => "THU",
            Self::Fri => "FRI",
            Self::Sat => "SAT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallTime {
    pub hour: u8,
    pub minute: u8,
    pub weekday: DayOfWeek,
    pub synced: bool,
}

impl WallTime {
    pub fn from_datetime<Tz: TimeZone>(now: &DateTime<Tz>, synced: bool) -> Self {
        Self {
            hour: now.hour() as u8,
            minute: now.minute() as u8,
            weekday: DayOfWeek::from_chrono(now.weekday()),
            synced,
        }
    }

    pub fn unsynced() -> Self {
        Self {
            hour: 0,
            minute: 0,
            weekday: DayOfWeek::Sun,
            synced: false,
        }
    }
}

impl std::fmt::Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {:02}:{:02}", self.weekday.as_str(), self.hour, self.minute)
    }
}

#[cfg(test)]
mod tests {
    use chrono::FixedOffset;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn wall_time_uses_sunday_zero_weekdays() {
        // Jan 4, 2026 is a Sunday.
        let sunday = FixedOffset::east_opt(7 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 1, 4, 6, 30, 0)
            .unwrap();

        let wall = WallTime::from_datetime(&sunday, true);

        assert_eq!(wall.weekday, DayOfWeek::Sun);
        assert_eq!(wall.weekday.index(), 0);
        assert_eq!((wall.hour, wall.minute), (6, 30));
        assert_eq!(wall.to_string(), "SUN 06:30");
    }

    #[test]
    fn elapsed_survives_counter_wrap() {
        assert_eq!(elapsed_ms(5, u32::MAX - 4), 10);
        assert_eq!(elapsed_ms(1_000, 400), 600);
    }

    #[test]
    fn rejects_epochs_before_sync() {
        assert!(!is_plausible_epoch(0));
        assert!(is_plausible_epoch(MIN_SYNCED_EPOCH + 60));
    }
}
