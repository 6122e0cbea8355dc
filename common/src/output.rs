use embedded_hal::digital::{OutputPin, PinState};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::clock::elapsed_ms;

pub type Callback = Box<dyn FnMut()>;

pub trait OutputDriver {
    fn apply(&mut self, on: bool, now_ms: u32);
}

impl<D: OutputDriver + ?Sized> OutputDriver for Box<D> {
    fn apply(&mut self, on: bool, now_ms: u32) {
        (**self).apply(on, now_ms);
    }
}

pub struct PinOutput<P> {
    pin: P,
    active_high: bool,
}

impl<P: OutputPin> PinOutput<P> {
    /// Drives the pin to its inactive level right away.
    pub fn new(pin: P, active_high: bool) -> Self {
        let mut output = Self { pin, active_high };
        output.write(false);
        output
    }

    pub fn active_high(&self) -> bool {
        self.active_high
    }

    pub fn into_inner(self) -> P {
        self.pin
    }

    fn write(&mut self, on: bool) {
        let level = PinState::from(on == self.active_high);
        if let Err(err) = self.pin.set_state(level) {
            warn!("output pin write failed: {err:?}");
        }
    }
}

impl<P: OutputPin> OutputDriver for PinOutput<P> {
    fn apply(&mut self, on: bool, _now_ms: u32) {
        self.write(on);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputPhase {
    Off,
    On,
    WaitForOn,
}

impl OutputPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::On => "ON",
            Self::WaitForOn => "WAIT_FOR_ON",
        }
    }
}

/// Mutators do nothing when the output is already in the requested state.
/// A callback must not reach back into the output that is invoking it.
pub struct TimedOutput<D> {
    driver: D,
    state: bool,
    phase: OutputPhase,
    duration_ms: u32,
    power_on_delay_ms: u32,
    once_ms: u32,
    // Activation time while on, wait start while waiting for on.
    since_ms: u32,
    on_label: String,
    off_label: String,
    on_power_on: Option<Callback>,
    on_power_off: Option<Callback>,
    on_power_changed: Option<Callback>,
    on_auto_off: Option<Callback>,
}

impl<D: OutputDriver> TimedOutput<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            state: false,
            phase: OutputPhase::Off,
            duration_ms: 0,
            power_on_delay_ms: 0,
            once_ms: 0,
            since_ms: 0,
            on_label: "ON".to_string(),
            off_label: "OFF".to_string(),
            on_power_on: None,
            on_power_off: None,
            on_power_changed: None,
            on_auto_off: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: u32) -> Self {
        self.set_duration(duration_ms);
        self
    }

    pub fn with_power_on_delay(mut self, delay_ms: u32) -> Self {
        self.set_power_on_delay(delay_ms);
        self
    }

    pub fn set_duration(&mut self, duration_ms: u32) {
        self.duration_ms = duration_ms;
    }

    pub fn duration_ms(&self) -> u32 {
        self.duration_ms
    }

    pub fn set_power_on_delay(&mut self, delay_ms: u32) {
        self.power_on_delay_ms = delay_ms;
    }

    pub fn power_on_delay_ms(&self) -> u32 {
        self.power_on_delay_ms
    }

    pub fn set_labels(&mut self, on_label: impl Into<String>, off_label: impl Into<String>) {
        self.on_label = on_label.into();
        self.off_label = off_label.into();
    }

    pub fn on_power_on(&mut self, callback: impl FnMut() + 'static) {
        self.on_power_on = Some(Box::new(callback));
    }

    pub fn on_power_off(&mut self, callback: impl FnMut() + 'static) {
        self.on_power_off = Some(Box::new(callback));
    }

    pub fn on_power_changed(&mut self, callback: impl FnMut() + 'static) {
        self.on_power_changed = Some(Box::new(callback));
    }

    pub fn on_auto_off(&mut self, callback: impl FnMut() + 'static) {
        self.on_auto_off = Some(Box::new(callback));
    }

    pub fn on(&mut self, now_ms: u32) {
        if self.phase != OutputPhase::On && self.power_on_delay_ms > 0 {
            if self.phase == OutputPhase::Off {
                self.phase = OutputPhase::WaitForOn;
                self.since_ms = now_ms;
            }
            return;
        }

        if self.state {
            return;
        }

        self.activate(now_ms);
    }

    /// Like [`Self::on`], but the next auto-off uses `duration_ms` instead of
    /// the configured duration. Re-arms the deadline when already on.
    pub fn on_once(&mut self, duration_ms: u32, now_ms: u32) {
        self.once_ms = duration_ms;
        if self.state {
            self.since_ms = now_ms;
            return;
        }
        self.on(now_ms);
    }

    pub fn on_percentage(&mut self, percentage: u8, now_ms: u32) {
        if !(1..=100).contains(&percentage) || self.duration_ms == 0 {
            return;
        }

        let once_ms = (u64::from(self.duration_ms) * u64::from(percentage) / 100).max(1) as u32;
        self.on_once(once_ms, now_ms);
    }

    pub fn force_on(&mut self, now_ms: u32) {
        if !self.state {
            self.on(now_ms);
            return;
        }

        self.driver.apply(true, now_ms);
        fire(&mut self.on_power_on);
        fire(&mut self.on_power_changed);
    }

    pub fn off(&mut self, now_ms: u32) {
        if self.phase == OutputPhase::WaitForOn {
            self.phase = OutputPhase::Off;
            self.once_ms = 0;
            return;
        }

        if !self.state {
            return;
        }

        self.state = false;
        self.phase = OutputPhase::Off;
        self.once_ms = 0;
        self.driver.apply(false, now_ms);
        fire(&mut self.on_power_off);
        fire(&mut self.on_power_changed);
    }

    pub fn toggle(&mut self, now_ms: u32) {
        if self.state {
            self.off(now_ms);
        } else {
            self.on(now_ms);
        }
    }

    pub fn set_state(&mut self, on: bool, now_ms: u32) {
        if on {
            self.on(now_ms);
        } else {
            self.off(now_ms);
        }
    }

    /// Anything starting with `ON` switches on, everything else switches off.
    pub fn set_state_str(&mut self, state: &str, now_ms: u32) {
        self.set_state(state.starts_with("ON"), now_ms);
    }

    pub fn tick(&mut self, now_ms: u32) {
        if self.state {
            let elapsed = elapsed_ms(now_ms, self.since_ms);
            let expired = if self.once_ms > 0 {
                elapsed >= self.once_ms
            } else {
                self.duration_ms > 0 && elapsed >= self.duration_ms
            };

            if expired {
                self.off(now_ms);
                fire(&mut self.on_auto_off);
            }
        }

        if self.phase == OutputPhase::WaitForOn
            && elapsed_ms(now_ms, self.since_ms) >= self.power_on_delay_ms
        {
            self.phase = OutputPhase::On;
            self.on(now_ms);
        }
    }

    pub fn is_on(&self) -> bool {
        self.state
    }

    pub fn phase(&self) -> OutputPhase {
        self.phase
    }

    pub fn state_label(&self) -> &str {
        if self.state {
            &self.on_label
        } else {
            &self.off_label
        }
    }

    pub fn remaining_ms(&self, now_ms: u32) -> Option<u32> {
        if !self.state {
            return None;
        }

        let window = if self.once_ms > 0 {
            self.once_ms
        } else {
            self.duration_ms
        };
        if window == 0 {
            return None;
        }

        Some(window.saturating_sub(elapsed_ms(now_ms, self.since_ms)))
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    fn activate(&mut self, now_ms: u32) {
        self.state = true;
        self.phase = OutputPhase::On;
        self.since_ms = now_ms;
        self.driver.apply(true, now_ms);
        fire(&mut self.on_power_on);
        fire(&mut self.on_power_changed);
    }
}

pub(crate) fn fire(callback: &mut Option<Callback>) {
    if let Some(callback) = callback.as_mut() {
        callback();
    }
}
