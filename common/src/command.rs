use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    error::ScheduleError,
    schedule::{RepeatMask, ScheduledTask, TaskTime},
    topics::{TOPIC_CMD_RELAY_PREFIX, TOPIC_CMD_VALVE},
    types::GardenStatus,
    watering::WateringArgs,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValveCommand {
    On,
    Off,
    Toggle,
    Percent(u8),
    OnceMs(u32),
}

impl ValveCommand {
    pub fn from_query(
        action: Option<&str>,
        percent: Option<&str>,
        seconds: Option<&str>,
    ) -> Result<Self, CommandError> {
        if let Some(action) = action {
            return action.parse();
        }
        if let Some(percent) = percent {
            return format!("{}%", percent.trim()).parse();
        }
        if let Some(seconds) = seconds {
            return format!("{}s", seconds.trim()).parse();
        }
        Err(CommandError::InvalidValveCommand(String::new()))
    }
}

/// `ON`/`OPEN`, `OFF`/`CLOSE`, `TOGGLE`, `NN%` or `NNs`, case-insensitive.
impl FromStr for ValveCommand {
    type Err = CommandError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let value = raw.trim().to_ascii_uppercase();
        let invalid = || CommandError::InvalidValveCommand(raw.trim().to_string());

        match value.as_str() {
            "ON" | "OPEN" => return Ok(Self::On),
            "OFF" | "CLOSE" => return Ok(Self::Off),
            "TOGGLE" => return Ok(Self::Toggle),
            _ => {}
        }

        if let Some(percent) = value.strip_suffix('%') {
            let percent = percent.trim().parse::<u8>().map_err(|_| invalid())?;
            if !(1..=100).contains(&percent) {
                return Err(invalid());
            }
            return Ok(Self::Percent(percent));
        }

        if let Some(seconds) = value.strip_suffix('S') {
            let seconds = seconds.trim().parse::<u32>().map_err(|_| invalid())?;
            if seconds == 0 || seconds > u32::MAX / 1_000 {
                return Err(invalid());
            }
            return Ok(Self::OnceMs(seconds * 1_000));
        }

        Err(invalid())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayName {
    ValvePower,
    ValveDirection,
    Pump,
    AcPower,
}

impl RelayName {
    pub const ALL: [Self; 4] = [Self::ValvePower, Self::ValveDirection, Self::Pump, Self::AcPower];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValvePower => "valve_power",
            Self::ValveDirection => "valve_direction",
            Self::Pump => "pump",
            Self::AcPower => "ac_power",
        }
    }
}

impl FromStr for RelayName {
    type Err = CommandError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "valve_power" | "r1" => Ok(Self::ValvePower),
            "valve_direction" | "r2" => Ok(Self::ValveDirection),
            "pump" | "r3" => Ok(Self::Pump),
            "ac_power" | "r4" => Ok(Self::AcPower),
            _ => Err(CommandError::InvalidRelayCommand(raw.trim().to_string())),
        }
    }
}

pub fn parse_switch(raw: &str) -> Result<bool, CommandError> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "ON" | "1" | "TRUE" => Ok(true),
        "OFF" | "0" | "FALSE" => Ok(false),
        _ => Err(CommandError::InvalidRelayCommand(raw.trim().to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDraft {
    pub time: TaskTime,
    pub repeat: RepeatMask,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub args: WateringArgs,
}

fn enabled_by_default() -> bool {
    true
}

impl TaskDraft {
    pub fn validate(&self) -> Result<(), CommandError> {
        if WateringArgs::new(self.args.valve_level, self.args.liters, self.args.minutes).is_none() {
            return Err(CommandError::InvalidTask("valveLevel must be between 1 and 10"));
        }
        Ok(())
    }

    pub fn into_task(self) -> ScheduledTask<WateringArgs> {
        let mut task = ScheduledTask::new(self.time, self.repeat, self.args);
        task.enabled = self.enabled;
        task
    }
}

pub enum Command {
    Status,
    Valve(ValveCommand),
    Relay(RelayName, bool),
    ListTasks,
    AddTask(TaskDraft),
    UpdateTask(u8, TaskDraft),
    RemoveTask(u8),
    ReloadTasks,
}

impl Command {
    pub fn from_mqtt(topic: &str, payload: &str) -> Option<Result<Self, CommandError>> {
        if topic == TOPIC_CMD_VALVE {
            return Some(payload.parse().map(Self::Valve));
        }

        let relay = topic.strip_prefix(TOPIC_CMD_RELAY_PREFIX)?;
        Some(relay.parse().and_then(|name| Ok(Self::Relay(name, parse_switch(payload)?))))
    }
}

pub enum Reply {
    Status(Box<GardenStatus>),
    Tasks(Vec<ScheduledTask<WateringArgs>>),
    Added(u8),
    Failed(CommandError),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("water leak detected, valve is locked closed")]
    LeakLatched,
    #[error("pump supply voltage out of range")]
    SupplyOutOfRange,
    #[error("invalid valve command `{0}`")]
    InvalidValveCommand(String),
    #[error("invalid relay command `{0}`")]
    InvalidRelayCommand(String),
    #[error("invalid task: {0}")]
    InvalidTask(&'static str),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error("control loop unavailable")]
    Unavailable,
}

impl CommandError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidValveCommand(_)
            | Self::InvalidRelayCommand(_)
            | Self::InvalidTask(_) => 400,
            Self::Schedule(ScheduleError::NotFound(_)) => 404,
            Self::LeakLatched
            | Self::SupplyOutOfRange
            | Self::Schedule(ScheduleError::Full(_))
            | Self::Schedule(ScheduleError::DuplicateId(_)) => 409,
            Self::Schedule(ScheduleError::Store(_)) => 500,
            Self::Unavailable => 503,
        }
    }
}

pub type Responder = Box<dyn FnOnce(Reply) + Send>;

pub struct Request {
    pub command: Command,
    pub respond: Responder,
}

impl Request {
    pub fn new(command: Command, respond: impl FnOnce(Reply) + Send + 'static) -> Self {
        Self {
            command,
            respond: Box::new(respond),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_mqtt_valve_payloads() {
        let cases = [
            ("ON", ValveCommand::On),
            ("open", ValveCommand::On),
            (" off ", ValveCommand::Off),
            ("Toggle", ValveCommand::Toggle),
            ("40%", ValveCommand::Percent(40)),
            ("90s", ValveCommand::OnceMs(90_000)),
        ];

        for (raw, expected) in cases {
            assert_eq!(raw.parse::<ValveCommand>().unwrap(), expected, "{raw}");
        }
    }

    #[test]
    fn rejects_out_of_range_valve_payloads() {
        for raw in ["", "0%", "101%", "0s", "-5s", "half", "%"] {
            assert!(raw.parse::<ValveCommand>().is_err(), "{raw}");
        }
    }

    #[test]
    fn query_prefers_action_then_percent_then_seconds() {
        assert_eq!(
            ValveCommand::from_query(Some("off"), Some("50"), None).unwrap(),
            ValveCommand::Off
        );
        assert_eq!(
            ValveCommand::from_query(None, Some("50"), Some("10")).unwrap(),
            ValveCommand::Percent(50)
        );
        assert_eq!(
            ValveCommand::from_query(None, None, Some("10")).unwrap(),
            ValveCommand::OnceMs(10_000)
        );
        assert!(ValveCommand::from_query(None, None, None).is_err());
    }

    #[test]
    fn parses_relay_names_and_switch_payloads() {
        assert_eq!("pump".parse::<RelayName>().unwrap(), RelayName::Pump);
        assert_eq!("R1".parse::<RelayName>().unwrap(), RelayName::ValvePower);
        assert_eq!(" ac_power ".parse::<RelayName>().unwrap(), RelayName::AcPower);
        assert!("r5".parse::<RelayName>().is_err());

        for name in RelayName::ALL {
            assert_eq!(name.as_str().parse::<RelayName>().unwrap(), name);
        }

        assert!(parse_switch("on").unwrap());
        assert!(!parse_switch("OFF").unwrap());
        assert_eq!(parse_switch("half").unwrap_err().status_code(), 400);
    }

    #[test]
    fn routes_mqtt_command_topics() {
        assert!(matches!(
            Command::from_mqtt("garden/cmnd/valve", "25%"),
            Some(Ok(Command::Valve(ValveCommand::Percent(25))))
        ));
        assert!(matches!(
            Command::from_mqtt("garden/cmnd/relay/pump", "ON"),
            Some(Ok(Command::Relay(RelayName::Pump, true)))
        ));
        assert!(matches!(
            Command::from_mqtt("garden/cmnd/relay/r4", "off"),
            Some(Ok(Command::Relay(RelayName::AcPower, false)))
        ));
        assert!(matches!(
            Command::from_mqtt("garden/cmnd/relay/pump", "maybe"),
            Some(Err(CommandError::InvalidRelayCommand(_)))
        ));
        assert!(Command::from_mqtt("garden/state", "{}").is_none());
    }

    #[test]
    fn draft_json_defaults_to_enabled() {
        let draft: TaskDraft = serde_json::from_str(
            r#"{"time":"06:30","repeat":"1111100","args":{"valveLevel":8,"liters":0,"minutes":10}}"#,
        )
        .unwrap();

        assert!(draft.enabled);
        assert!(draft.validate().is_ok());

        let task = draft.into_task();
        assert_eq!(task.id, 0);
        assert_eq!(task.to_string(), "0|6|30|1111100|8-0-10|1|0");
    }

    #[test]
    fn draft_with_bad_level_is_invalid() {
        let draft = TaskDraft {
            time: TaskTime::new(6, 30).unwrap(),
            repeat: RepeatMask::all(),
            enabled: true,
            args: WateringArgs {
                valve_level: 0,
                liters: 0,
                minutes: 5,
            },
        };

        let err = draft.validate().unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn maps_errors_to_http_status() {
        assert_eq!(CommandError::LeakLatched.status_code(), 409);
        assert_eq!(CommandError::SupplyOutOfRange.status_code(), 409);
        assert_eq!(CommandError::from(ScheduleError::Full(10)).status_code(), 409);
        assert_eq!(CommandError::from(ScheduleError::NotFound(4)).status_code(), 404);
    }
}
