use embedded_hal::digital::InputPin;
use log::warn;

use crate::{
    clock::elapsed_ms,
    output::{fire, Callback},
};

pub const DEFAULT_DEBOUNCE_MS: u32 = 50;

pub trait InputReader {
    fn read(&mut self) -> bool;
}

impl<R: InputReader + ?Sized> InputReader for Box<R> {
    fn read(&mut self) -> bool {
        (**self).read()
    }
}

pub struct PinInput<P> {
    pin: P,
    last: bool,
}

impl<P: InputPin> PinInput<P> {
    pub fn new(pin: P) -> Self {
        Self { pin, last: false }
    }
}

impl<P: InputPin> InputReader for PinInput<P> {
    fn read(&mut self) -> bool {
        match self.pin.is_high() {
            Ok(level) => self.last = level,
            Err(err) => warn!("input pin read failed: {err:?}"),
        }
        self.last
    }
}

struct HoldState {
    target: bool,
    sustain_ms: u32,
    fired: bool,
    callback: Callback,
}

pub struct DebouncedInput<R> {
    reader: R,
    active_level: bool,
    debounce_ms: u32,
    raw: bool,
    state: bool,
    raw_changed_ms: u32,
    changed_ms: u32,
    holds: Vec<HoldState>,
    on_change: Option<Callback>,
    on_active: Option<Callback>,
    on_inactive: Option<Callback>,
    active_label: String,
    inactive_label: String,
}

impl<R: InputReader> DebouncedInput<R> {
    /// Samples the reader once; the initial level is accepted without callbacks.
    pub fn new(mut reader: R, active_level: bool, now_ms: u32) -> Self {
        let level = reader.read();
        Self {
            reader,
            active_level,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            raw: level,
            state: level,
            raw_changed_ms: now_ms,
            changed_ms: now_ms,
            holds: Vec::new(),
            on_change: None,
            on_active: None,
            on_inactive: None,
            active_label: "ACTIVE".to_string(),
            inactive_label: "NONE".to_string(),
        }
    }

    pub fn with_debounce(mut self, debounce_ms: u32) -> Self {
        self.debounce_ms = debounce_ms;
        self
    }

    pub fn set_labels(&mut self, active: impl Into<String>, inactive: impl Into<String>) {
        self.active_label = active.into();
        self.inactive_label = inactive.into();
    }

    pub fn on_change(&mut self, callback: impl FnMut() + 'static) {
        self.on_change = Some(Box::new(callback));
    }

    pub fn on_active(&mut self, callback: impl FnMut() + 'static) {
        self.on_active = Some(Box::new(callback));
    }

    pub fn on_inactive(&mut self, callback: impl FnMut() + 'static) {
        self.on_inactive = Some(Box::new(callback));
    }

    /// Fires once after the debounced level has stayed at `target` for
    /// `sustain_ms`. Registering the same `(target, sustain_ms)` again
    /// replaces the callback.
    pub fn on_hold_state(&mut self, target: bool, sustain_ms: u32, callback: impl FnMut() + 'static) {
        let callback: Callback = Box::new(callback);
        if let Some(hold) = self
            .holds
            .iter_mut()
            .find(|hold| hold.target == target && hold.sustain_ms == sustain_ms)
        {
            hold.callback = callback;
            return;
        }

        self.holds.push(HoldState {
            target,
            sustain_ms,
            fired: false,
            callback,
        });
    }

    pub fn on_hold_active(&mut self, sustain_ms: u32, callback: impl FnMut() + 'static) {
        self.on_hold_state(self.active_level, sustain_ms, callback);
    }

    pub fn remove_hold_state(&mut self, target: bool, sustain_ms: u32) -> bool {
        let before = self.holds.len();
        self.holds
            .retain(|hold| !(hold.target == target && hold.sustain_ms == sustain_ms));
        self.holds.len() != before
    }

    pub fn tick(&mut self, now_ms: u32) {
        let raw = self.reader.read();
        if raw != self.raw {
            self.raw = raw;
            self.raw_changed_ms = now_ms;
        }

        if raw != self.state && elapsed_ms(now_ms, self.raw_changed_ms) >= self.debounce_ms {
            self.state = raw;
            self.changed_ms = now_ms;
            for hold in &mut self.holds {
                hold.fired = false;
            }

            if self.state == self.active_level {
                fire(&mut self.on_active);
            } else {
                fire(&mut self.on_inactive);
            }
            fire(&mut self.on_change);
        }

        let held_ms = elapsed_ms(now_ms, self.changed_ms);
        for hold in &mut self.holds {
            if hold.target == self.state && !hold.fired && held_ms >= hold.sustain_ms {
                hold.fired = true;
                (hold.callback)();
            }
        }
    }

    pub fn state(&self) -> bool {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == self.active_level
    }

    pub fn active_level(&self) -> bool {
        self.active_level
    }

    pub fn state_label(&self) -> &str {
        if self.is_active() {
            &self.active_label
        } else {
            &self.inactive_label
        }
    }

    pub fn held_ms(&self, now_ms: u32) -> u32 {
        elapsed_ms(now_ms, self.changed_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Clone, Default)]
    struct FakeLine(Rc<Cell<bool>>);

    impl FakeLine {
        fn set(&self, level: bool) {
            self.0.set(level);
        }
    }

    impl InputReader for FakeLine {
        fn read(&mut self) -> bool {
            self.0.get()
        }
    }

    fn counter() -> (Rc<Cell<u32>>, impl FnMut() + 'static) {
        let count = Rc::new(Cell::new(0));
        let handle = count.clone();
        (count, move || handle.set(handle.get() + 1))
    }

    #[test]
    fn bounce_shorter_than_window_is_ignored() {
        let line = FakeLine::default();
        let mut input = DebouncedInput::new(line.clone(), true, 0);
        let (changes, on_change) = counter();
        input.on_change(on_change);

        for step in 0..20_u32 {
            line.set(step % 2 == 0);
            input.tick(step * 10);
        }

        assert_eq!(changes.get(), 0);
        assert!(!input.state());
    }

    #[test]
    fn stable_level_changes_state_once() {
        let line = FakeLine::default();
        let mut input = DebouncedInput::new(line.clone(), true, 0);
        let (changes, on_change) = counter();
        input.on_change(on_change);

        line.set(true);
        input.tick(100);
        input.tick(149);
        assert!(!input.state());

        input.tick(150);
        input.tick(200);
        input.tick(5_000);

        assert!(input.state());
        assert_eq!(changes.get(), 1);
    }

    #[test]
    fn active_and_inactive_follow_polarity() {
        let line = FakeLine(Rc::new(Cell::new(true)));
        let mut input = DebouncedInput::new(line.clone(), false, 0).with_debounce(10);
        let (actives, on_active) = counter();
        let (inactives, on_inactive) = counter();
        input.on_active(on_active);
        input.on_inactive(on_inactive);
        assert_eq!(input.state_label(), "NONE");

        line.set(false);
        input.tick(0);
        input.tick(10);
        assert!(input.is_active());
        assert_eq!(input.state_label(), "ACTIVE");

        line.set(true);
        input.tick(20);
        input.tick(30);

        assert_eq!((actives.get(), inactives.get()), (1, 1));
    }

    #[test]
    fn hold_fires_once_per_sustained_period() {
        let line = FakeLine::default();
        let mut input = DebouncedInput::new(line.clone(), true, 0).with_debounce(0);
        let (holds, on_hold) = counter();
        input.on_hold_state(true, 5_000, on_hold);

        line.set(true);
        input.tick(1_000);
        input.tick(5_999);
        assert_eq!(holds.get(), 0);

        input.tick(6_000);
        input.tick(60_000);
        assert_eq!(holds.get(), 1);

        line.set(false);
        input.tick(61_000);
        input.tick(70_000);
        assert_eq!(holds.get(), 1);

        line.set(true);
        input.tick(71_000);
        input.tick(76_000);
        assert_eq!(holds.get(), 2);
    }

    #[test]
    fn hold_on_initial_level_counts_from_start() {
        let line = FakeLine(Rc::new(Cell::new(true)));
        let mut input = DebouncedInput::new(line, true, 0);
        let (holds, on_hold) = counter();
        input.on_hold_active(2_000, on_hold);

        input.tick(1_999);
        input.tick(2_000);

        assert_eq!(holds.get(), 1);
    }

    #[test]
    fn registering_same_hold_key_replaces_callback() {
        let line = FakeLine::default();
        let mut input = DebouncedInput::new(line.clone(), true, 0).with_debounce(0);
        let (first, on_first) = counter();
        let (second, on_second) = counter();
        input.on_hold_state(true, 1_000, on_first);
        input.on_hold_state(true, 1_000, on_second);

        line.set(true);
        input.tick(0);
        input.tick(1_000);

        assert_eq!((first.get(), second.get()), (0, 1));
    }

    #[test]
    fn removed_hold_never_fires() {
        let line = FakeLine::default();
        let mut input = DebouncedInput::new(line.clone(), true, 0).with_debounce(0);
        let (holds, on_hold) = counter();
        input.on_hold_state(true, 100, on_hold);

        assert!(input.remove_hold_state(true, 100));
        assert!(!input.remove_hold_state(true, 100));

        line.set(true);
        input.tick(0);
        input.tick(1_000);
        assert_eq!(holds.get(), 0);
    }
}
