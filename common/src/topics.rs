pub const TOPIC_GARDEN_STATE: &str = "garden/state";
pub const TOPIC_GARDEN_SCHEDULE_STATE: &str = "garden/schedules/state";

pub const TOPIC_CMD_VALVE: &str = "garden/cmnd/valve";
pub const TOPIC_CMD_RELAY_PREFIX: &str = "garden/cmnd/relay/";
pub const TOPIC_CMD_RELAY_FILTER: &str = "garden/cmnd/relay/+";

pub const DEFAULT_SCHEDULE_PATH: &str = "garden/schedules";
