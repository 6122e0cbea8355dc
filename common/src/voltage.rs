use log::warn;

use crate::{
    clock::elapsed_ms,
    output::{fire, Callback},
};

/// 12-bit converter over a 0..3.3 V input.
pub const ADC_MAX_RAW: u16 = 4095;
pub const ADC_FULL_SCALE_MV: u32 = 3_300;

pub trait AnalogReader {
    fn read_raw(&mut self) -> Option<u16>;
}

impl<R: AnalogReader + ?Sized> AnalogReader for Box<R> {
    fn read_raw(&mut self) -> Option<u16> {
        (**self).read_raw()
    }
}

/// Resistor divider in front of the converter. `r1` sits on the measured
/// side, `r2` to ground. Either one at zero means a direct connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Divider {
    pub r1_ohms: u32,
    pub r2_ohms: u32,
}

impl Divider {
    pub fn new(r1_ohms: u32, r2_ohms: u32) -> Self {
        Self { r1_ohms, r2_ohms }
    }

    fn is_direct(self) -> bool {
        self.r1_ohms == 0 || self.r2_ohms == 0
    }

    pub fn to_millivolts(self, raw: u16) -> u32 {
        let pin_mv = u64::from(raw.min(ADC_MAX_RAW)) * u64::from(ADC_FULL_SCALE_MV)
            / u64::from(ADC_MAX_RAW);
        if self.is_direct() {
            return pin_mv as u32;
        }

        let scaled = pin_mv * (u64::from(self.r1_ohms) + u64::from(self.r2_ohms))
            / u64::from(self.r2_ohms);
        scaled.min(u64::from(u32::MAX)) as u32
    }

    pub fn to_raw(self, millivolts: u32) -> u16 {
        let pin_mv = if self.is_direct() {
            u64::from(millivolts)
        } else {
            u64::from(millivolts) * u64::from(self.r2_ohms)
                / (u64::from(self.r1_ohms) + u64::from(self.r2_ohms))
        };
        let raw = (pin_mv * u64::from(ADC_MAX_RAW)).div_ceil(u64::from(ADC_FULL_SCALE_MV));
        raw.min(u64::from(ADC_MAX_RAW)) as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupplyLevel {
    Low,
    Normal,
    High,
}

/// Samples an analog input and reports moves larger than the change
/// threshold. A move that lands outside the safe range raises `on_low` or
/// `on_high` instead of `on_changed`, falling back to `on_changed` when that
/// callback is not registered.
pub struct VoltageMonitor<R> {
    reader: R,
    divider: Divider,
    change_threshold_mv: u32,
    min_mv: Option<u32>,
    max_mv: Option<u32>,
    sample_interval_ms: u32,
    last_sample_ms: Option<u32>,
    millivolts: u32,
    on_changed: Option<Callback>,
    on_low: Option<Callback>,
    on_high: Option<Callback>,
}

impl<R: AnalogReader> VoltageMonitor<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            divider: Divider::default(),
            change_threshold_mv: 100,
            min_mv: None,
            max_mv: None,
            sample_interval_ms: 0,
            last_sample_ms: None,
            millivolts: 0,
            on_changed: None,
            on_low: None,
            on_high: None,
        }
    }

    pub fn with_divider(mut self, divider: Divider) -> Self {
        self.divider = divider;
        self
    }

    pub fn with_change_threshold(mut self, threshold_mv: u32) -> Self {
        self.change_threshold_mv = threshold_mv;
        self
    }

    pub fn with_sample_interval(mut self, interval_ms: u32) -> Self {
        self.sample_interval_ms = interval_ms;
        self
    }

    /// Zero leaves that side unbounded.
    pub fn set_safe_range(&mut self, min_mv: u32, max_mv: u32) {
        self.min_mv = (min_mv > 0).then_some(min_mv);
        self.max_mv = (max_mv > 0).then_some(max_mv);
    }

    pub fn on_changed(&mut self, callback: impl FnMut() + 'static) {
        self.on_changed = Some(Box::new(callback));
    }

    pub fn on_low(&mut self, callback: impl FnMut() + 'static) {
        self.on_low = Some(Box::new(callback));
    }

    pub fn on_high(&mut self, callback: impl FnMut() + 'static) {
        self.on_high = Some(Box::new(callback));
    }

    pub fn millivolts(&self) -> u32 {
        self.millivolts
    }

    pub fn level(&self) -> SupplyLevel {
        self.classify(self.millivolts)
    }

    pub fn tick(&mut self, now_ms: u32) {
        if let Some(last) = self.last_sample_ms {
            if elapsed_ms(now_ms, last) < self.sample_interval_ms {
                return;
            }
        }
        self.last_sample_ms = Some(now_ms);

        let Some(raw) = self.reader.read_raw() else {
            warn!("supply voltage read failed");
            return;
        };

        let millivolts = self.divider.to_millivolts(raw);
        if millivolts.abs_diff(self.millivolts) <= self.change_threshold_mv {
            return;
        }
        self.millivolts = millivolts;

        match self.classify(millivolts) {
            SupplyLevel::Low if self.on_low.is_some() => fire(&mut self.on_low),
            SupplyLevel::High if self.on_high.is_some() => fire(&mut self.on_high),
            _ => fire(&mut self.on_changed),
        }
    }

    fn classify(&self, millivolts: u32) -> SupplyLevel {
        if self.min_mv.is_some_and(|min| millivolts < min) {
            SupplyLevel::Low
        } else if self.max_mv.is_some_and(|max| millivolts > max) {
            SupplyLevel::High
        } else {
            SupplyLevel::Normal
        }
    }
}
