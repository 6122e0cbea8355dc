pub mod clock;
pub mod command;
pub mod config;
pub mod error;
pub mod garden;
pub mod input;
pub mod last_state;
pub mod output;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod topics;
pub mod types;
pub mod virtual_output;
pub mod voltage;
pub mod watering;

pub use clock::{DayOfWeek, WallTime};
pub use command::{
    parse_switch, Command, CommandError, RelayName, Reply, Request, TaskDraft, ValveCommand,
};
pub use config::{
    GardenConfig, PinConfig, RuntimeConfig, StorageBackend, StorageConfig, SupplyConfig,
};
pub use error::{RecordError, ScheduleError, StoreError};
pub use garden::{GardenController, Relays};
pub use input::{DebouncedInput, InputReader, PinInput};
pub use last_state::{LastStateFile, StartupState};
pub use output::{OutputDriver, OutputPhase, PinOutput, TimedOutput};
pub use schedule::{RepeatMask, ScheduledTask, TaskTime};
pub use scheduler::TaskScheduler;
pub use store::{
    FileTaskStore, LoadSlot, RemoteDatabase, RemoteTaskStore, RetainedReads, TaskStore,
};
pub use topics::*;
pub use types::{GardenStatus, RelayLevels, ValveStatus};
pub use virtual_output::VirtualOutput;
pub use voltage::{AnalogReader, Divider, SupplyLevel, VoltageMonitor};
pub use watering::WateringArgs;
