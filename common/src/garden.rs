use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use chrono::{DateTime, FixedOffset};
use log::{error, info, warn};

use crate::{
    clock::{elapsed_ms, WallTime},
    command::{Command, CommandError, RelayName, Reply, ValveCommand},
    config::GardenConfig,
    input::{DebouncedInput, InputReader},
    last_state::{LastStateFile, StartupState},
    output::{OutputDriver, TimedOutput},
    schedule::ScheduledTask,
    scheduler::TaskScheduler,
    store::TaskStore,
    types::{GardenStatus, RelayLevels, ValveStatus},
    virtual_output::{ActionDriver, VirtualOutput},
    voltage::{AnalogReader, VoltageMonitor},
    watering::WateringArgs,
};

pub struct Relays {
    pub valve_power: Box<dyn OutputDriver>,
    pub valve_direction: Box<dyn OutputDriver>,
    pub pump: Box<dyn OutputDriver>,
    pub ac_power: Box<dyn OutputDriver>,
}

type Relay = TimedOutput<Box<dyn OutputDriver>>;

struct RelayBank {
    // Powers the valve motor for one travel period per move.
    actuator: Relay,
    // On drives the valve open, off drives it closed.
    direction: Relay,
    pump: Relay,
    ac_power: Relay,
    pump_locked: bool,
}

impl RelayBank {
    fn new(relays: Relays, config: &GardenConfig) -> Self {
        Self {
            actuator: TimedOutput::new(relays.valve_power).with_duration(config.valve_travel_ms),
            direction: TimedOutput::new(relays.valve_direction),
            pump: TimedOutput::new(relays.pump).with_power_on_delay(config.pump_start_delay_ms),
            ac_power: TimedOutput::new(relays.ac_power),
            pump_locked: false,
        }
    }

    fn open(&mut self, now_ms: u32) {
        self.direction.on(now_ms);
        self.restart_actuator(now_ms);
        self.ac_power.on(now_ms);
        if !self.pump_locked {
            self.pump.on(now_ms);
        }
    }

    fn close(&mut self, now_ms: u32) {
        self.pump.off(now_ms);
        self.ac_power.off(now_ms);
        self.direction.off(now_ms);
        self.restart_actuator(now_ms);
    }

    fn restart_actuator(&mut self, now_ms: u32) {
        self.actuator.off(now_ms);
        self.actuator.on(now_ms);
    }

    fn relay_mut(&mut self, name: RelayName) -> &mut Relay {
        match name {
            RelayName::ValvePower => &mut self.actuator,
            RelayName::ValveDirection => &mut self.direction,
            RelayName::Pump => &mut self.pump,
            RelayName::AcPower => &mut self.ac_power,
        }
    }

    fn tick(&mut self, now_ms: u32) {
        self.actuator.tick(now_ms);
        self.direction.tick(now_ms);
        self.pump.tick(now_ms);
        self.ac_power.tick(now_ms);
    }

    fn levels(&self) -> RelayLevels {
        RelayLevels {
            actuator: self.actuator.is_on(),
            direction: self.direction.is_on(),
            pump: self.pump.is_on(),
            ac_power: self.ac_power.is_on(),
        }
    }
}

enum GardenEvent {
    Fire(ScheduledTask<WateringArgs>),
    LeakActive,
    LeakCleared,
    LeakConfirmed,
    ValveChanged(bool),
    SupplyChanged,
    SupplyLow,
    SupplyHigh,
}

type EventQueue = Rc<RefCell<VecDeque<GardenEvent>>>;

fn queue(events: &EventQueue, make: fn() -> GardenEvent) -> impl FnMut() + 'static {
    let events = Rc::clone(events);
    move || events.borrow_mut().push_back(make())
}

pub type GardenScheduler = TaskScheduler<WateringArgs, Box<dyn TaskStore>>;
pub type SupplyMonitor = VoltageMonitor<Box<dyn AnalogReader>>;

pub struct GardenController {
    config: GardenConfig,
    valve: VirtualOutput,
    relays: Rc<RefCell<RelayBank>>,
    leak: DebouncedInput<Box<dyn InputReader>>,
    supply: Option<SupplyMonitor>,
    scheduler: GardenScheduler,
    last_state: Option<LastStateFile>,
    events: EventQueue,
    leak_latched: bool,
    supply_ok: bool,
    last_run_ms: Option<u32>,
    changed: bool,
}

impl GardenController {
    pub fn new(
        config: GardenConfig,
        relays: Relays,
        leak_sensor: Box<dyn InputReader>,
        store: Box<dyn TaskStore>,
        last_state: Option<LastStateFile>,
        now_ms: u32,
    ) -> Self {
        let events: EventQueue = Rc::new(RefCell::new(VecDeque::new()));
        let relays = Rc::new(RefCell::new(RelayBank::new(relays, &config)));

        let open_relays = Rc::clone(&relays);
        let close_relays = Rc::clone(&relays);
        let mut valve = VirtualOutput::new(ActionDriver::new(
            move |now_ms| open_relays.borrow_mut().open(now_ms),
            move |now_ms| close_relays.borrow_mut().close(now_ms),
        ))
        .with_duration(config.valve_duration_ms)
        .with_power_on_delay(config.valve_open_delay_ms);
        valve.set_labels("OPEN", "CLOSED");
        valve.on_power_on(queue(&events, || GardenEvent::ValveChanged(true)));
        valve.on_power_off(queue(&events, || GardenEvent::ValveChanged(false)));

        let mut leak = DebouncedInput::new(leak_sensor, config.leak_active_high, now_ms)
            .with_debounce(config.leak_debounce_ms);
        leak.set_labels("LEAK", "DRY");
        leak.on_active(queue(&events, || GardenEvent::LeakActive));
        leak.on_inactive(queue(&events, || GardenEvent::LeakCleared));
        leak.on_hold_active(config.leak_hold_ms, queue(&events, || GardenEvent::LeakConfirmed));

        let mut scheduler = TaskScheduler::new(store, config.max_tasks);
        let fire_events = Rc::clone(&events);
        scheduler.set_callback(move |task| fire_events.borrow_mut().push_back(GardenEvent::Fire(task)));

        Self {
            config,
            valve,
            relays,
            leak,
            supply: None,
            scheduler,
            last_state,
            events,
            leak_latched: false,
            supply_ok: true,
            last_run_ms: None,
            changed: false,
        }
    }

    pub fn attach_supply_monitor(&mut self, reader: Box<dyn AnalogReader>) {
        let supply = self.config.supply;
        let mut monitor = VoltageMonitor::new(reader)
            .with_divider(supply.divider())
            .with_change_threshold(supply.change_threshold_mv)
            .with_sample_interval(supply.sample_interval_ms);
        monitor.set_safe_range(supply.min_mv, supply.max_mv);
        monitor.on_changed(queue(&self.events, || GardenEvent::SupplyChanged));
        monitor.on_low(queue(&self.events, || GardenEvent::SupplyLow));
        monitor.on_high(queue(&self.events, || GardenEvent::SupplyHigh));
        self.supply = Some(monitor);
    }

    pub fn start(&mut self, now_ms: u32) {
        if let Err(err) = self.scheduler.load() {
            warn!("failed to load schedules: {err}");
        }

        let open = match self.config.valve_startup {
            StartupState::None => return,
            StartupState::Off => false,
            StartupState::On => true,
            StartupState::LastState => self.recorded_valve_state(),
        };

        if open {
            info!("valve startup state is open");
            self.valve.open(now_ms);
        } else {
            // The valve position is unknown after a reset, drive it closed.
            self.relays.borrow_mut().close(now_ms);
        }
        self.drain_events(now_ms);
    }

    /// Advances every timer. `now` is `None` until wall-clock time is known.
    /// Returns true when the published status changed since the last tick.
    pub fn tick(&mut self, now_ms: u32, now: Option<DateTime<FixedOffset>>) -> bool {
        let before = self.relays.borrow().levels();

        self.leak.tick(now_ms);
        if let Some(supply) = self.supply.as_mut() {
            supply.tick(now_ms);
        }
        self.valve.tick(now_ms);
        self.relays.borrow_mut().tick(now_ms);

        let due = self
            .last_run_ms
            .map_or(true, |last| elapsed_ms(now_ms, last) >= self.config.scheduler_interval_ms);
        if due {
            self.last_run_ms = Some(now_ms);
            let wall = now
                .map(|now| WallTime::from_datetime(&now, true))
                .unwrap_or_else(WallTime::unsynced);
            self.scheduler.run(&wall);
        }

        self.drain_events(now_ms);

        if self.relays.borrow().levels() != before {
            self.changed = true;
        }
        std::mem::take(&mut self.changed)
    }

    pub fn handle(
        &mut self,
        command: Command,
        now_ms: u32,
        now: Option<DateTime<FixedOffset>>,
    ) -> Reply {
        let result = match command {
            Command::Status => Ok(self.status_reply(now_ms, now)),
            Command::Valve(valve) => self
                .valve_command(valve, now_ms)
                .map(|()| self.status_reply(now_ms, now)),
            Command::Relay(name, on) => self
                .relay_command(name, on, now_ms)
                .map(|()| self.status_reply(now_ms, now)),
            Command::ListTasks => Ok(self.tasks_reply()),
            Command::AddTask(draft) => draft
                .validate()
                .and_then(|()| Ok(self.scheduler.add_task(draft.into_task())?))
                .map(Reply::Added),
            Command::UpdateTask(id, draft) => draft
                .validate()
                .and_then(|()| Ok(self.scheduler.update_task(id, draft.into_task())?))
                .map(|()| self.tasks_reply()),
            Command::RemoveTask(id) => self
                .scheduler
                .remove_task(id)
                .map(|()| self.tasks_reply())
                .map_err(CommandError::from),
            Command::ReloadTasks => self
                .scheduler
                .load()
                .map(|()| self.tasks_reply())
                .map_err(CommandError::from),
        };

        result.unwrap_or_else(|err| {
            warn!("command rejected: {err}");
            Reply::Failed(err)
        })
    }

    pub fn valve_command(&mut self, command: ValveCommand, now_ms: u32) -> Result<(), CommandError> {
        let opens = match command {
            ValveCommand::Off => false,
            ValveCommand::Toggle => !self.valve.is_open(),
            _ => true,
        };
        if opens && self.leak_latched {
            return Err(CommandError::LeakLatched);
        }

        match command {
            ValveCommand::On => self.valve.open(now_ms),
            ValveCommand::Off => self.valve.close(now_ms),
            ValveCommand::Toggle => self.valve.toggle(now_ms),
            ValveCommand::Percent(percent) => self.valve.open_percentage(percent, now_ms),
            ValveCommand::OnceMs(duration_ms) => self.valve.open_for(duration_ms, now_ms),
        }

        self.drain_events(now_ms);
        Ok(())
    }

    pub fn relay_command(
        &mut self,
        name: RelayName,
        on: bool,
        now_ms: u32,
    ) -> Result<(), CommandError> {
        if on && self.leak_latched {
            return Err(CommandError::LeakLatched);
        }
        if on && name == RelayName::Pump && !self.supply_ok {
            return Err(CommandError::SupplyOutOfRange);
        }

        let level = if on { "on" } else { "off" };
        info!("relay {} switched {level} by hand", name.as_str());
        self.relays.borrow_mut().relay_mut(name).set_state(on, now_ms);
        self.changed = true;
        Ok(())
    }

    pub fn status(&self, now_ms: u32, now: Option<DateTime<FixedOffset>>) -> GardenStatus {
        GardenStatus {
            valve: ValveStatus {
                open: self.valve.is_open(),
                phase: self.valve.phase(),
                label: self.valve.state_label().to_string(),
                remaining_ms: self.valve.remaining_ms(now_ms),
                duration_ms: self.valve.duration_ms(),
            },
            relays: self.relays.borrow().levels(),
            leak_active: self.leak.is_active(),
            leak_label: self.leak.state_label().to_string(),
            leak_latched: self.leak_latched,
            supply_mv: self.supply.as_ref().map(VoltageMonitor::millivolts),
            supply_ok: self.supply_ok,
            task_count: self.scheduler.len(),
            max_tasks: self.scheduler.max_tasks(),
            next_run_epoch: now.and_then(|now| self.scheduler.next_run_epoch(now)),
            time_synced: now.is_some(),
        }
    }

    pub fn tasks(&self) -> &[ScheduledTask<WateringArgs>] {
        self.scheduler.tasks()
    }

    pub fn is_valve_open(&self) -> bool {
        self.valve.is_open()
    }

    pub fn is_leak_latched(&self) -> bool {
        self.leak_latched
    }

    pub fn is_supply_ok(&self) -> bool {
        self.supply_ok
    }

    fn status_reply(&self, now_ms: u32, now: Option<DateTime<FixedOffset>>) -> Reply {
        Reply::Status(Box::new(self.status(now_ms, now)))
    }

    fn tasks_reply(&self) -> Reply {
        Reply::Tasks(self.scheduler.tasks().to_vec())
    }

    fn drain_events(&mut self, now_ms: u32) {
        loop {
            let event = self.events.borrow_mut().pop_front();
            let Some(event) = event else { break };

            match event {
                GardenEvent::Fire(task) => self.water(&task, now_ms),
                GardenEvent::LeakActive => {
                    warn!("water leak sensor triggered");
                    self.changed = true;
                }
                GardenEvent::LeakConfirmed => {
                    error!(
                        "water leak held for {} ms, closing valve",
                        self.config.leak_hold_ms
                    );
                    self.leak_latched = true;
                    self.valve.close(now_ms);
                    self.relays.borrow_mut().pump.off(now_ms);
                    self.changed = true;
                }
                GardenEvent::LeakCleared => {
                    if self.leak_latched {
                        info!("water leak cleared");
                    }
                    self.leak_latched = false;
                    self.changed = true;
                }
                GardenEvent::SupplyLow | GardenEvent::SupplyHigh => {
                    let millivolts = self.supply.as_ref().map_or(0, VoltageMonitor::millivolts);
                    if self.supply_ok {
                        error!("pump supply out of range at {millivolts} mV, stopping pump");
                    }
                    self.supply_ok = false;
                    let mut relays = self.relays.borrow_mut();
                    relays.pump_locked = true;
                    relays.pump.off(now_ms);
                    self.changed = true;
                }
                GardenEvent::SupplyChanged => {
                    if !self.supply_ok {
                        info!("pump supply back in range");
                        self.supply_ok = true;
                        let mut relays = self.relays.borrow_mut();
                        relays.pump_locked = false;
                        if self.valve.is_open() && !self.leak_latched {
                            relays.pump.on(now_ms);
                        }
                    }
                    self.changed = true;
                }
                GardenEvent::ValveChanged(open) => {
                    info!("valve {}", if open { "opened" } else { "closed" });
                    self.record_valve_state(open);
                    self.changed = true;
                }
            }
        }
    }

    fn water(&mut self, task: &ScheduledTask<WateringArgs>, now_ms: u32) {
        if self.leak_latched {
            warn!("skipping schedule {}: water leak detected", task.id);
            return;
        }

        if !self.supply_ok {
            warn!("schedule {} runs without the pump: supply out of range", task.id);
        }

        match task.args.open_ms() {
            Some(duration_ms) => self.valve.open_for(duration_ms, now_ms),
            None => self
                .valve
                .open_percentage(task.args.valve_percentage(), now_ms),
        }
    }

    fn recorded_valve_state(&self) -> bool {
        let Some(file) = &self.last_state else {
            return false;
        };

        match file.read() {
            Ok(level) => level.unwrap_or(false),
            Err(err) => {
                warn!("failed to read {}: {err}", file.path().display());
                false
            }
        }
    }

    fn record_valve_state(&self, open: bool) {
        if let Some(file) = &self.last_state {
            if let Err(err) = file.write(open) {
                warn!("failed to record valve state: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        command::TaskDraft,
        error::ScheduleError,
        config::SupplyConfig,
        schedule::{RepeatMask, TaskTime},
        store::testing::{scratch_dir, MemoryStore},
    };

    struct FakeRelay(Rc<Cell<bool>>);

    impl OutputDriver for FakeRelay {
        fn apply(&mut self, on: bool, _now_ms: u32) {
            self.0.set(on);
        }
    }

    struct FakeLine(Rc<Cell<bool>>);

    impl InputReader for FakeLine {
        fn read(&mut self) -> bool {
            self.0.get()
        }
    }

    struct FakeAdc(Rc<Cell<u16>>);

    impl AnalogReader for FakeAdc {
        fn read_raw(&mut self) -> Option<u16> {
            Some(self.0.get())
        }
    }

    struct Rig {
        garden: GardenController,
        power: Rc<Cell<bool>>,
        direction: Rc<Cell<bool>>,
        pump: Rc<Cell<bool>>,
        ac: Rc<Cell<bool>>,
        leak: Rc<Cell<bool>>,
    }

    fn config() -> GardenConfig {
        GardenConfig {
            valve_duration_ms: 60_000,
            valve_travel_ms: 5_000,
            pump_start_delay_ms: 2_000,
            leak_debounce_ms: 50,
            leak_hold_ms: 1_000,
            leak_active_high: true,
            scheduler_interval_ms: 1_000,
            ..GardenConfig::default()
        }
    }

    fn rig_with(config: GardenConfig, store: MemoryStore, last_state: Option<LastStateFile>) -> Rig {
        let power = Rc::new(Cell::new(false));
        let direction = Rc::new(Cell::new(false));
        let pump = Rc::new(Cell::new(false));
        let ac = Rc::new(Cell::new(false));
        let leak = Rc::new(Cell::new(false));

        let relays = Relays {
            valve_power: Box::new(FakeRelay(Rc::clone(&power))),
            valve_direction: Box::new(FakeRelay(Rc::clone(&direction))),
            pump: Box::new(FakeRelay(Rc::clone(&pump))),
            ac_power: Box::new(FakeRelay(Rc::clone(&ac))),
        };
        let garden = GardenController::new(
            config,
            relays,
            Box::new(FakeLine(Rc::clone(&leak))),
            Box::new(store),
            last_state,
            0,
        );

        Rig {
            garden,
            power,
            direction,
            pump,
            ac,
            leak,
        }
    }

    fn rig() -> Rig {
        rig_with(config(), MemoryStore::default(), None)
    }

    // Monday 2026-01-05 at the given time, UTC.
    fn monday(hour: u32, minute: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2026, 1, 5, hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn opening_sequences_relays_and_delays_pump() {
        let mut rig = rig();

        rig.garden.valve_command(ValveCommand::On, 1_000).unwrap();

        assert!(rig.garden.is_valve_open());
        assert!(rig.direction.get());
        assert!(rig.power.get());
        assert!(rig.ac.get());
        assert!(!rig.pump.get());

        rig.garden.tick(3_000, None);
        assert!(rig.pump.get());

        // Motor power drops once the valve has travelled.
        rig.garden.tick(6_000, None);
        assert!(!rig.power.get());
        assert!(rig.direction.get());
    }

    #[test]
    fn closing_reverses_the_motor() {
        let mut rig = rig();
        rig.garden.valve_command(ValveCommand::On, 0).unwrap();
        rig.garden.tick(6_000, None);

        rig.garden.valve_command(ValveCommand::Off, 7_000).unwrap();

        assert!(!rig.garden.is_valve_open());
        assert!(!rig.pump.get());
        assert!(!rig.ac.get());
        assert!(!rig.direction.get());
        assert!(rig.power.get());

        rig.garden.tick(12_000, None);
        assert!(!rig.power.get());
    }

    #[test]
    fn percentage_command_closes_after_share_of_duration() {
        let mut rig = rig();

        rig.garden.valve_command(ValveCommand::Percent(50), 0).unwrap();
        let status = rig.garden.status(10_000, None);
        assert_eq!(status.valve.remaining_ms, Some(20_000));
        assert_eq!(status.valve.label, "OPEN");

        rig.garden.tick(30_000, None);
        assert!(!rig.garden.is_valve_open());
    }

    #[test]
    fn scheduled_task_opens_for_its_minutes() {
        let store = MemoryStore::with_records(&["7|6|30|1111111|5-0-2|1|0"]);
        let mut rig = rig_with(config(), store, None);
        rig.garden.start(0);

        rig.garden.tick(1_000, Some(monday(6, 29)));
        assert!(!rig.garden.is_valve_open());

        assert!(rig.garden.tick(2_000, Some(monday(6, 30))));
        assert!(rig.garden.is_valve_open());
        assert_eq!(rig.garden.status(2_000, None).valve.remaining_ms, Some(120_000));
        assert!(rig.garden.tasks()[0].executed);

        rig.garden.tick(122_000, Some(monday(6, 32)));
        assert!(!rig.garden.is_valve_open());
        assert!(!rig.garden.tasks()[0].executed);
    }

    #[test]
    fn scheduler_is_idle_without_wall_clock() {
        let store = MemoryStore::with_records(&["7|6|30|1111111|5-0-2|1|0"]);
        let mut rig = rig_with(config(), store, None);
        rig.garden.start(0);

        rig.garden.tick(1_000, None);

        assert!(!rig.garden.is_valve_open());
        assert!(!rig.garden.status(1_000, None).time_synced);
    }

    #[test]
    fn sustained_leak_closes_and_locks_valve() {
        let mut rig = rig();
        rig.garden.valve_command(ValveCommand::On, 0).unwrap();

        rig.leak.set(true);
        rig.garden.tick(100, None);
        rig.garden.tick(200, None);
        assert!(rig.garden.status(200, None).leak_active);
        assert!(rig.garden.is_valve_open());

        rig.garden.tick(1_200, None);
        assert!(rig.garden.is_leak_latched());
        assert!(!rig.garden.is_valve_open());
        assert!(!rig.pump.get());

        let err = rig.garden.valve_command(ValveCommand::On, 1_300).unwrap_err();
        assert_eq!(err.status_code(), 409);
        assert!(rig.garden.valve_command(ValveCommand::Off, 1_300).is_ok());

        rig.leak.set(false);
        rig.garden.tick(1_400, None);
        rig.garden.tick(1_500, None);
        assert!(!rig.garden.is_leak_latched());
        assert!(rig.garden.valve_command(ValveCommand::On, 1_600).is_ok());
    }

    #[test]
    fn latched_leak_skips_scheduled_watering() {
        let store = MemoryStore::with_records(&["7|6|30|1111111|5-0-2|1|0"]);
        let mut rig = rig_with(config(), store, None);
        rig.garden.start(0);

        rig.leak.set(true);
        rig.garden.tick(100, None);
        rig.garden.tick(200, None);
        rig.garden.tick(1_300, None);
        assert!(rig.garden.is_leak_latched());

        rig.garden.tick(2_400, Some(monday(6, 30)));
        assert!(!rig.garden.is_valve_open());
    }

    #[test]
    fn task_commands_round_through_scheduler() {
        let mut rig = rig();
        let draft = TaskDraft {
            time: TaskTime::new(18, 0).unwrap(),
            repeat: RepeatMask::all(),
            enabled: true,
            args: WateringArgs::default(),
        };

        let Reply::Added(id) = rig.garden.handle(Command::AddTask(draft.clone()), 0, None) else {
            panic!("expected added reply");
        };
        assert_ne!(id, 0);

        let Reply::Tasks(tasks) = rig.garden.handle(Command::ListTasks, 0, None) else {
            panic!("expected task list");
        };
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, id);

        let Reply::Failed(err) = rig.garden.handle(Command::RemoveTask(id.wrapping_add(1).max(1)), 0, None)
        else {
            panic!("expected failure");
        };
        assert!(matches!(err, CommandError::Schedule(ScheduleError::NotFound(_))));

        let Reply::Tasks(tasks) = rig.garden.handle(Command::RemoveTask(id), 0, None) else {
            panic!("expected task list");
        };
        assert!(tasks.is_empty());
    }

    #[test]
    fn status_reports_next_run() {
        let store = MemoryStore::with_records(&["7|6|30|1111111|5-0-2|1|0"]);
        let mut rig = rig_with(config(), store, None);
        rig.garden.start(0);

        let status = rig.garden.status(0, Some(monday(6, 0)));

        assert_eq!(status.task_count, 1);
        assert_eq!(status.next_run_epoch, Some(monday(6, 30).timestamp()));
        assert!(status.time_synced);
        assert_eq!(status.leak_label, "DRY");
    }

    #[test]
    fn restores_last_valve_state_on_start() {
        let dir = scratch_dir("garden-startup");
        LastStateFile::in_dir(&dir, "valve").write(true).unwrap();

        let config = GardenConfig {
            valve_startup: StartupState::LastState,
            ..config()
        };
        let mut rig = rig_with(
            config,
            MemoryStore::default(),
            Some(LastStateFile::in_dir(&dir, "valve")),
        );
        rig.garden.start(0);
        assert!(rig.garden.is_valve_open());

        rig.garden.valve_command(ValveCommand::Off, 10).unwrap();
        assert_eq!(LastStateFile::in_dir(&dir, "valve").read().unwrap(), Some(false));
    }

    #[test]
    fn relays_switch_by_hand() {
        let mut rig = rig();

        let reply = rig.garden.handle(Command::Relay(RelayName::AcPower, true), 0, None);
        let Reply::Status(status) = reply else {
            panic!("expected status reply");
        };
        assert!(status.relays.ac_power);
        assert!(rig.ac.get());
        assert!(!rig.garden.is_valve_open());

        // Manual pump start still honours the start delay.
        rig.garden.relay_command(RelayName::Pump, true, 0).unwrap();
        assert!(!rig.pump.get());
        assert!(rig.garden.tick(2_000, None));
        assert!(rig.pump.get());

        rig.garden.relay_command(RelayName::AcPower, false, 2_100).unwrap();
        assert!(!rig.ac.get());
    }

    #[test]
    fn latched_leak_blocks_switching_relays_on() {
        let mut rig = rig();
        rig.garden.relay_command(RelayName::AcPower, true, 0).unwrap();
        rig.leak.set(true);
        rig.garden.tick(100, None);
        rig.garden.tick(200, None);
        rig.garden.tick(1_300, None);
        assert!(rig.garden.is_leak_latched());

        let reply = rig
            .garden
            .handle(Command::Relay(RelayName::Pump, true), 1_400, None);
        let Reply::Failed(err) = reply else {
            panic!("expected failure");
        };
        assert!(matches!(err, CommandError::LeakLatched));
        assert!(!rig.pump.get());

        assert!(rig.garden.relay_command(RelayName::AcPower, false, 1_400).is_ok());
        assert!(!rig.ac.get());
    }

    fn supply_rig() -> (Rig, Rc<Cell<u16>>) {
        let mut config = config();
        config.supply = SupplyConfig {
            enabled: true,
            sample_interval_ms: 100,
            ..SupplyConfig::default()
        };
        let mut rig = rig_with(config, MemoryStore::default(), None);
        let raw = Rc::new(Cell::new(volts(12_000)));
        rig.garden.attach_supply_monitor(Box::new(FakeAdc(Rc::clone(&raw))));
        (rig, raw)
    }

    fn volts(millivolts: u32) -> u16 {
        SupplyConfig::default().divider().to_raw(millivolts)
    }

    #[test]
    fn undervoltage_stops_pump_until_supply_recovers() {
        let (mut rig, raw) = supply_rig();
        rig.garden.tick(0, None);
        assert!(rig.garden.is_supply_ok());

        rig.garden.valve_command(ValveCommand::On, 0).unwrap();
        rig.garden.tick(2_000, None);
        assert!(rig.pump.get());

        raw.set(volts(9_000));
        rig.garden.tick(2_100, None);
        assert!(!rig.garden.is_supply_ok());
        assert!(!rig.pump.get());
        assert!(rig.garden.is_valve_open());

        let err = rig.garden.relay_command(RelayName::Pump, true, 2_200).unwrap_err();
        assert!(matches!(err, CommandError::SupplyOutOfRange));
        let status = rig.garden.status(2_200, None);
        assert!(!status.supply_ok);
        assert!(status.supply_mv.unwrap() < 10_500);

        raw.set(volts(12_000));
        rig.garden.tick(2_300, None);
        assert!(rig.garden.is_supply_ok());
        rig.garden.tick(4_300, None);
        assert!(rig.pump.get());
    }

    #[test]
    fn overvoltage_keeps_pump_off_when_opening() {
        let (mut rig, raw) = supply_rig();
        raw.set(volts(16_000));
        rig.garden.tick(0, None);
        assert!(!rig.garden.is_supply_ok());

        rig.garden.valve_command(ValveCommand::On, 100).unwrap();
        rig.garden.tick(3_000, None);

        assert!(rig.garden.is_valve_open());
        assert!(rig.ac.get());
        assert!(!rig.pump.get());
    }

    #[test]
    fn default_startup_drives_valve_closed() {
        let mut rig = rig();
        rig.garden.start(0);

        assert!(!rig.garden.is_valve_open());
        assert!(!rig.direction.get());
        assert!(rig.power.get());
    }
}
