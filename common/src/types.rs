use serde::Serialize;

use crate::output::OutputPhase;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValveStatus {
    pub open: bool,
    pub phase: OutputPhase,
    pub label: String,
    #[serde(rename = "remainingMs")]
    pub remaining_ms: Option<u32>,
    #[serde(rename = "durationMs")]
    pub duration_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayLevels {
    pub actuator: bool,
    pub direction: bool,
    pub pump: bool,
    #[serde(rename = "acPower")]
    pub ac_power: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GardenStatus {
    pub valve: ValveStatus,
    pub relays: RelayLevels,
    #[serde(rename = "leakActive")]
    pub leak_active: bool,
    #[serde(rename = "leakLabel")]
    pub leak_label: String,
    #[serde(rename = "leakLatched")]
    pub leak_latched: bool,
    #[serde(rename = "supplyMv")]
    pub supply_mv: Option<u32>,
    #[serde(rename = "supplyOk")]
    pub supply_ok: bool,
    #[serde(rename = "taskCount")]
    pub task_count: usize,
    #[serde(rename = "maxTasks")]
    pub max_tasks: usize,
    #[serde(rename = "nextRunEpoch")]
    pub next_run_epoch: Option<i64>,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
}
