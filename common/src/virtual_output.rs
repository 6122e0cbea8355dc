use crate::output::{OutputDriver, TimedOutput};

pub type Action = Box<dyn FnMut(u32)>;

/// Runs the open/close action before the power callbacks of the owning output.
pub struct ActionDriver {
    open: Option<Action>,
    close: Option<Action>,
}

impl ActionDriver {
    pub fn new(open: impl FnMut(u32) + 'static, close: impl FnMut(u32) + 'static) -> Self {
        Self {
            open: Some(Box::new(open)),
            close: Some(Box::new(close)),
        }
    }

    pub fn noop() -> Self {
        Self {
            open: None,
            close: None,
        }
    }
}

impl OutputDriver for ActionDriver {
    fn apply(&mut self, on: bool, now_ms: u32) {
        let action = if on { &mut self.open } else { &mut self.close };
        if let Some(action) = action.as_mut() {
            action(now_ms);
        }
    }
}

pub type VirtualOutput = TimedOutput<ActionDriver>;

impl TimedOutput<ActionDriver> {
    pub fn with_actions(
        open: impl FnMut(u32) + 'static,
        close: impl FnMut(u32) + 'static,
    ) -> Self {
        Self::new(ActionDriver::new(open, close))
    }

    pub fn set_open_action(&mut self, open: impl FnMut(u32) + 'static) {
        self.driver_mut().open = Some(Box::new(open));
    }

    pub fn set_close_action(&mut self, close: impl FnMut(u32) + 'static) {
        self.driver_mut().close = Some(Box::new(close));
    }

    pub fn open(&mut self, now_ms: u32) {
        self.on(now_ms);
    }

    pub fn close(&mut self, now_ms: u32) {
        self.off(now_ms);
    }

    pub fn open_for(&mut self, duration_ms: u32, now_ms: u32) {
        self.on_once(duration_ms, now_ms);
    }

    pub fn open_percentage(&mut self, percentage: u8, now_ms: u32) {
        self.on_percentage(percentage, now_ms);
    }

    pub fn is_open(&self) -> bool {
        self.is_on()
    }
}
