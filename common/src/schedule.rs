use std::{fmt, str::FromStr};

use chrono::{DateTime, Datelike, Duration, FixedOffset, TimeZone, Timelike};
use serde::{Deserialize, Serialize};

use crate::{
    clock::{DayOfWeek, WallTime},
    error::RecordError,
};

pub trait TaskArgs: Clone + fmt::Display + FromStr {}

impl<T: Clone + fmt::Display + FromStr> TaskArgs for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskTime {
    pub hour: u8,
    pub minute: u8,
}

impl TaskTime {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    pub fn minutes_of_day(self) -> u16 {
        u16::from(self.hour) * 60 + u16::from(self.minute)
    }

    pub fn matches(self, now: &WallTime) -> bool {
        self.hour == now.hour && self.minute == now.minute
    }
}

impl fmt::Display for TaskTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for TaskTime {
    type Err = RecordError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (hour, minute) = raw
            .trim()
            .split_once(':')
            .ok_or_else(|| RecordError::field("time", raw))?;
        let hour = hour
            .parse::<u8>()
            .map_err(|_| RecordError::field("hour", hour))?;
        let minute = minute
            .parse::<u8>()
            .map_err(|_| RecordError::field("minute", minute))?;
        Self::new(hour, minute).ok_or_else(|| RecordError::field("time", raw))
    }
}

impl TryFrom<String> for TaskTime {
    type Error = RecordError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<TaskTime> for String {
    fn from(time: TaskTime) -> Self {
        time.to_string()
    }
}

/// Seven day-of-week flags, bit `n` for [`DayOfWeek::index`] `n`.
///
/// The text form lists the days Monday first: `1111100` is Monday to Friday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepeatMask(u8);

impl RepeatMask {
    const TEXT_ORDER: [DayOfWeek; 7] = [
        DayOfWeek::Mon,
        DayOfWeek::Tue,
        DayOfWeek::Wed,
        DayOfWeek::Thu,
        DayOfWeek::Fri,
        DayOfWeek::Sat,
        DayOfWeek::Sun,
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self(0x7f)
    }

    pub fn from_days(days: &[DayOfWeek]) -> Self {
        let mut mask = Self::empty();
        for day in days {
            mask.insert(*day);
        }
        mask
    }

    pub fn insert(&mut self, day: DayOfWeek) {
        self.0 |= 1 << day.index();
    }

    pub fn remove(&mut self, day: DayOfWeek) {
        self.0 &= !(1 << day.index());
    }

    pub fn contains(self, day: DayOfWeek) -> bool {
        self.0 & (1 << day.index()) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn days(self) -> Vec<DayOfWeek> {
        DayOfWeek::ALL
            .into_iter()
            .filter(|day| self.contains(*day))
            .collect()
    }
}

impl fmt::Display for RepeatMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for day in Self::TEXT_ORDER {
            f.write_str(if self.contains(day) { "1" } else { "0" })?;
        }
        Ok(())
    }
}

impl FromStr for RepeatMask {
    type Err = RecordError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw.len() != 7 {
            return Err(RecordError::field("repeat mask", raw));
        }

        let mut mask = Self::empty();
        for (day, flag) in Self::TEXT_ORDER.into_iter().zip(raw.chars()) {
            match flag {
                '1' => mask.insert(day),
                '0' => {}
                _ => return Err(RecordError::field("repeat mask", raw)),
            }
        }
        Ok(mask)
    }
}

impl TryFrom<String> for RepeatMask {
    type Error = RecordError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<RepeatMask> for String {
    fn from(mask: RepeatMask) -> Self {
        mask.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask<A> {
    pub id: u8,
    pub time: TaskTime,
    pub repeat: RepeatMask,
    pub enabled: bool,
    pub executed: bool,
    pub args: A,
}

impl<A> ScheduledTask<A> {
    pub fn new(time: TaskTime, repeat: RepeatMask, args: A) -> Self {
        Self {
            id: 0,
            time,
            repeat,
            enabled: true,
            executed: false,
            args,
        }
    }

    pub fn is_due(&self, now: &WallTime) -> bool {
        self.enabled && self.repeat.contains(now.weekday) && self.time.matches(now)
    }

    /// Epoch seconds of the next slot strictly after `now`.
    pub fn next_run_epoch(&self, now: DateTime<FixedOffset>) -> Option<i64> {
        if !self.enabled || self.repeat.is_empty() {
            return None;
        }

        let today = DayOfWeek::from_chrono(now.weekday());
        let now_minutes = now.hour() as u16 * 60 + now.minute() as u16;

        for day_offset in 0..=7_i64 {
            let day = DayOfWeek::from_index(today.index() + day_offset as usize);
            if !self.repeat.contains(day) {
                continue;
            }
            if day_offset == 0 && self.time.minutes_of_day() <= now_minutes {
                continue;
            }

            let date = now.date_naive() + Duration::days(day_offset);
            let Some(naive) =
                date.and_hms_opt(u32::from(self.time.hour), u32::from(self.time.minute), 0)
            else {
                continue;
            };

            if let Some(candidate) = now.offset().from_local_datetime(&naive).single() {
                return Some(candidate.timestamp());
            }
        }

        None
    }
}

impl<A: fmt::Display> fmt::Display for ScheduledTask<A> {
    /// `id|hour|minute|mask|args|enabled|executed`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}|{}|{}",
            self.id,
            self.time.hour,
            self.time.minute,
            self.repeat,
            self.args,
            u8::from(self.enabled),
            u8::from(self.executed)
        )
    }
}

impl<A: FromStr> FromStr for ScheduledTask<A> {
    type Err = RecordError;

    fn from_str(record: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = record.trim_end_matches(['\r', '\n']).split('|').collect();
        let [id, hour, minute, mask, args, enabled, executed] = fields[..] else {
            return Err(RecordError::FieldCount(fields.len()));
        };

        let id = parse_number("id", id)?;
        if id == 0 {
            return Err(RecordError::field("id", "0"));
        }

        let hour = parse_number("hour", hour)?;
        let minute = parse_number("minute", minute)?;
        let time = TaskTime::new(hour, minute)
            .ok_or_else(|| RecordError::field("time", &format!("{hour}:{minute}")))?;

        let repeat = mask.parse::<RepeatMask>()?;
        let enabled = parse_flag("enabled", enabled)?;
        let executed = parse_flag("executed", executed)?;

        if args.is_empty() {
            return Err(RecordError::Args(String::new()));
        }
        let args = args
            .parse::<A>()
            .map_err(|_| RecordError::Args(args.to_string()))?;

        Ok(Self {
            id,
            time,
            repeat,
            enabled,
            executed,
            args,
        })
    }
}

fn parse_number(field: &'static str, raw: &str) -> Result<u8, RecordError> {
    raw.parse::<u8>()
        .map_err(|_| RecordError::field(field, raw))
}

fn parse_flag(field: &'static str, raw: &str) -> Result<bool, RecordError> {
    match raw {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(RecordError::field(field, raw)),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn fixed_time(day: u32, hour: u32, minute: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(7 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 1, day, hour, minute, 0)
            .unwrap()
    }

    fn task(record: &str) -> ScheduledTask<String> {
        record.parse().unwrap()
    }

    #[test]
    fn record_round_trips_field_by_field() {
        let parsed = task("5|7|30|1111100|10-0-5|1|0");

        assert_eq!(parsed.id, 5);
        assert_eq!(parsed.time, TaskTime::new(7, 30).unwrap());
        assert!(parsed.repeat.contains(DayOfWeek::Mon));
        assert!(parsed.repeat.contains(DayOfWeek::Fri));
        assert!(!parsed.repeat.contains(DayOfWeek::Sat));
        assert!(!parsed.repeat.contains(DayOfWeek::Sun));
        assert_eq!(parsed.args, "10-0-5");
        assert!(parsed.enabled);
        assert!(!parsed.executed);
        assert_eq!(parsed.to_string(), "5|7|30|1111100|10-0-5|1|0");
    }

    #[test]
    fn malformed_records_are_rejected_whole() {
        let cases = [
            ("5|7|30|1111100|10-0-5|1", RecordError::FieldCount(6)),
            ("5|7|30|1111100|10-0-5|1|0|9", RecordError::FieldCount(8)),
            ("0|7|30|1111100|a|1|0", RecordError::field("id", "0")),
            ("x|7|30|1111100|a|1|0", RecordError::field("id", "x")),
            ("5|24|0|1111100|a|1|0", RecordError::field("time", "24:0")),
            ("5|7|30|11111|a|1|0", RecordError::field("repeat mask", "11111")),
            ("5|7|30|11111x0|a|1|0", RecordError::field("repeat mask", "11111x0")),
            ("5|7|30|1111100||1|0", RecordError::Args(String::new())),
            ("5|7|30|1111100|a|yes|0", RecordError::field("enabled", "yes")),
        ];

        for (record, expected) in cases {
            assert_eq!(record.parse::<ScheduledTask<String>>(), Err(expected), "{record}");
        }
    }

    #[test]
    fn mask_text_is_monday_first() {
        let weekend = RepeatMask::from_days(&[DayOfWeek::Sat, DayOfWeek::Sun]);

        assert_eq!(weekend.to_string(), "0000011");
        assert_eq!(weekend.days(), vec![DayOfWeek::Sun, DayOfWeek::Sat]);
        assert_eq!("0000011".parse::<RepeatMask>().unwrap(), weekend);
        assert_eq!(RepeatMask::all().to_string(), "1111111");
    }

    #[test]
    fn parses_hh_mm() {
        assert_eq!("06:05".parse::<TaskTime>().unwrap(), TaskTime::new(6, 5).unwrap());
        assert!("6".parse::<TaskTime>().is_err());
        assert!("23:60".parse::<TaskTime>().is_err());
        assert_eq!(TaskTime::new(6, 5).unwrap().to_string(), "06:05");
    }

    #[test]
    fn due_only_in_slot_on_enabled_days() {
        let mut watering = task("5|7|0|1000000|a|1|0");
        let monday_7 = WallTime::from_datetime(&fixed_time(5, 7, 0), true);
        let monday_701 = WallTime::from_datetime(&fixed_time(5, 7, 1), true);
        let tuesday_7 = WallTime::from_datetime(&fixed_time(6, 7, 0), true);

        assert!(watering.is_due(&monday_7));
        assert!(!watering.is_due(&monday_701));
        assert!(!watering.is_due(&tuesday_7));

        watering.enabled = false;
        assert!(!watering.is_due(&monday_7));
    }

    #[test]
    fn next_run_skips_to_following_enabled_day() {
        // Jan 5, 2026 is a Monday.
        let watering = task("5|7|0|0010000|a|1|0");

        let next = watering.next_run_epoch(fixed_time(5, 9, 0)).unwrap();

        assert_eq!(next, fixed_time(7, 7, 0).timestamp());
    }

    #[test]
    fn next_run_wraps_to_same_weekday() {
        let watering = task("5|7|0|1000000|a|1|0");

        let next = watering.next_run_epoch(fixed_time(5, 7, 0)).unwrap();

        assert_eq!(next, fixed_time(12, 7, 0).timestamp());
    }

    #[test]
    fn json_uses_text_forms() {
        let watering = task("5|7|0|1000000|a|1|0");

        let json = serde_json::to_value(&watering).unwrap();

        assert_eq!(json["time"], "07:00");
        assert_eq!(json["repeat"], "1000000");
        let back: ScheduledTask<String> = serde_json::from_value(json).unwrap();
        assert_eq!(back, watering);
    }
}
