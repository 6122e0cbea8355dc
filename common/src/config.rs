use serde::{Deserialize, Serialize};

use crate::{last_state::StartupState, scheduler::MAX_TASK_LIMIT, voltage::Divider};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GardenConfig {
    pub valve_duration_ms: u32,
    pub valve_open_delay_ms: u32,
    pub valve_travel_ms: u32,
    pub pump_start_delay_ms: u32,
    pub leak_debounce_ms: u32,
    pub leak_hold_ms: u32,
    pub leak_active_high: bool,
    pub relay_active_high: bool,
    pub scheduler_interval_ms: u32,
    pub max_tasks: usize,
    #[serde(default)]
    pub valve_startup: StartupState,
    #[serde(default)]
    pub supply: SupplyConfig,
}

impl Default for GardenConfig {
    fn default() -> Self {
        Self {
            valve_duration_ms: 600_000,
            valve_open_delay_ms: 0,
            valve_travel_ms: 6_000,
            pump_start_delay_ms: 2_000,
            leak_debounce_ms: 50,
            leak_hold_ms: 5_000,
            leak_active_high: false,
            relay_active_high: false,
            scheduler_interval_ms: 5_000,
            max_tasks: 10,
            valve_startup: StartupState::Off,
            supply: SupplyConfig::default(),
        }
    }
}

impl GardenConfig {
    pub fn sanitize(&mut self) {
        // Never let a watering run longer than two hours.
        self.valve_duration_ms = self.valve_duration_ms.clamp(10_000, 7_200_000);
        self.valve_open_delay_ms = self.valve_open_delay_ms.min(60_000);
        self.valve_travel_ms = self.valve_travel_ms.clamp(500, 60_000);
        self.pump_start_delay_ms = self.pump_start_delay_ms.min(30_000);
        self.leak_debounce_ms = self.leak_debounce_ms.clamp(5, 1_000);
        self.leak_hold_ms = self.leak_hold_ms.clamp(self.leak_debounce_ms, 600_000);
        // A minute slot must be sampled at least twice.
        self.scheduler_interval_ms = self.scheduler_interval_ms.clamp(1_000, 30_000);
        self.max_tasks = self.max_tasks.clamp(1, MAX_TASK_LIMIT.min(50));
        self.supply.sanitize();
    }
}

/// Off unless a sense divider is fitted. A floating input reads as undervoltage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupplyConfig {
    pub enabled: bool,
    pub divider_r1_ohms: u32,
    pub divider_r2_ohms: u32,
    pub change_threshold_mv: u32,
    pub min_mv: u32,
    pub max_mv: u32,
    pub sample_interval_ms: u32,
}

impl Default for SupplyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            divider_r1_ohms: 100_000,
            divider_r2_ohms: 10_000,
            change_threshold_mv: 100,
            min_mv: 10_500,
            max_mv: 14_500,
            sample_interval_ms: 1_000,
        }
    }
}

impl SupplyConfig {
    pub fn divider(&self) -> Divider {
        Divider::new(self.divider_r1_ohms, self.divider_r2_ohms)
    }

    fn sanitize(&mut self) {
        self.change_threshold_mv = self.change_threshold_mv.clamp(10, 5_000);
        self.sample_interval_ms = self.sample_interval_ms.clamp(100, 60_000);
        if self.max_mv != 0 && self.min_mv > self.max_mv {
            std::mem::swap(&mut self.min_mv, &mut self.max_mv);
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PinConfig {
    pub valve_power: i32,
    pub valve_direction: i32,
    pub pump: i32,
    pub ac_power: i32,
    pub water_leak: i32,
    /// Must be an ADC1 pin.
    pub supply_sense: i32,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            valve_power: 19,
            valve_direction: 18,
            pump: 16,
            ac_power: 4,
            water_leak: 34,
            supply_sense: 32,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    File,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub schedule_path: String,
    pub last_state_dir: String,
    pub remote_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            schedule_path: "/spiffs/schedules.txt".to_string(),
            last_state_dir: "/spiffs".to_string(),
            remote_path: crate::topics::DEFAULT_SCHEDULE_PATH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub garden: GardenConfig,
    #[serde(default)]
    pub pins: PinConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub network: NetworkConfig,
    pub timezone: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            garden: GardenConfig::default(),
            pins: PinConfig::default(),
            storage: StorageConfig::default(),
            network: NetworkConfig::default(),
            timezone: "UTC".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.garden.sanitize();
        if self.storage.remote_path.trim().is_empty() {
            self.storage.remote_path = crate::topics::DEFAULT_SCHEDULE_PATH.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn sanitize_clamps_out_of_range_values() {
        let mut config = RuntimeConfig::default();
        config.garden.valve_duration_ms = 0;
        config.garden.scheduler_interval_ms = 120_000;
        config.garden.max_tasks = 0;
        config.garden.leak_hold_ms = 1;
        config.storage.remote_path = " ".to_string();

        config.sanitize();

        assert_eq!(config.garden.valve_duration_ms, 10_000);
        assert_eq!(config.garden.scheduler_interval_ms, 30_000);
        assert_eq!(config.garden.max_tasks, 1);
        assert_eq!(config.garden.leak_hold_ms, config.garden.leak_debounce_ms);
        assert_eq!(config.storage.remote_path, "garden/schedules");
    }

    #[test]
    fn supply_range_is_put_in_order() {
        let mut config = GardenConfig::default();
        config.supply.min_mv = 14_000;
        config.supply.max_mv = 11_000;
        config.supply.sample_interval_ms = 0;

        config.sanitize();

        assert_eq!((config.supply.min_mv, config.supply.max_mv), (11_000, 14_000));
        assert_eq!(config.supply.sample_interval_ms, 100);
        assert!(!config.supply.enabled);
    }

    #[test]
    fn older_config_without_pins_or_storage_still_loads() {
        let raw = serde_json::json!({
            "garden": GardenConfig::default(),
            "network": NetworkConfig::default(),
            "timezone": "Asia/Ho_Chi_Minh",
        });

        let config: RuntimeConfig = serde_json::from_value(raw).unwrap();

        assert_eq!(config.pins, PinConfig::default());
        assert_eq!(config.storage.backend, StorageBackend::File);
        assert_eq!(config.garden.valve_startup, StartupState::Off);
    }
}
