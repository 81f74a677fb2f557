use crate::{Channel, DeviceType, SamplingPlan};
use log::info;

/// Register value that ties every analog negative input to ground.
pub const NEGATIVE_CHANNEL_GND: f64 = 199.0;

/// Highest stream resolution index a T7 accepts.
pub const MAX_RESOLUTION_INDEX: u8 = 12;

/// T7 command-response resolution table: (effective bits, noise in microvolts, sample
/// time in ms) indexed by resolution index 1..=12.
const T7_RESOLUTION: &[(f64, f64, f64)] = &[
    (16.0, 316.0, 0.04),
    (16.5, 223.0, 0.04),
    (17.0, 158.0, 0.1),
    (17.5, 112.0, 0.1),
    (17.9, 84.6, 0.2),
    (18.3, 64.1, 0.3),
    (18.8, 45.3, 0.6),
    (19.1, 36.8, 1.1),
    (19.6, 26.0, 3.5),
    (20.5, 14.0, 13.4),
    (21.3, 8.02, 66.2),
    (21.4, 7.48, 159.0),
];

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResolutionInfo {
    pub bits: f64,
    pub microvolts: f64,
    pub sample_time_ms: f64,
}

/// Looks up the T7 resolution table. Index 0 means "device default" and has no entry.
pub fn t7_resolution(index: u8) -> Option<ResolutionInfo> {
    let i = usize::from(index).checked_sub(1)?;
    T7_RESOLUTION
        .get(i)
        .map(|&(bits, microvolts, sample_time_ms)| ResolutionInfo {
            bits,
            microvolts,
            sample_time_ms,
        })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamClock {
    Internal,
    External,
}

/// Digital extended-feature inputs that can trigger a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerChannel {
    DioEf0,
    DioEf1,
    DioEf2,
    DioEf3,
    DioEf4,
    DioEf5,
    DioEf6,
    DioEf7,
}

impl TriggerChannel {
    fn index(self) -> f64 {
        let offset = match self {
            TriggerChannel::DioEf0 => 0,
            TriggerChannel::DioEf1 => 1,
            TriggerChannel::DioEf2 => 2,
            TriggerChannel::DioEf3 => 3,
            TriggerChannel::DioEf4 => 4,
            TriggerChannel::DioEf5 => 5,
            TriggerChannel::DioEf6 => 6,
            TriggerChannel::DioEf7 => 7,
        };
        f64::from(2000 + offset)
    }
}

/// A single device register write.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceSetting {
    AinOn(bool),
    AinOnDefault(bool),
    EthernetOn(bool),
    EthernetOnDefault(bool),
    LedOn(bool),
    LedOnDefault(bool),
    WifiOn(bool),
    WifiOnDefault(bool),
    StreamClock(StreamClock),
    TriggeredStream(Option<TriggerChannel>),
    StreamResolution(u8),
    StreamSettlingUs(f64),
    AinAllNegativeGround,
    Range(Channel, f64),
}

impl DeviceSetting {
    /// Settings the T4 and other models do not implement.
    pub fn t7_only(&self) -> bool {
        matches!(
            self,
            DeviceSetting::AinOn(_)
                | DeviceSetting::AinOnDefault(_)
                | DeviceSetting::StreamClock(_)
                | DeviceSetting::TriggeredStream(_)
        )
    }

    pub fn applies_to(&self, device_type: DeviceType) -> bool {
        !self.t7_only() || matches!(device_type, DeviceType::T7 | DeviceType::Any)
    }

    /// Register name and value written for this setting.
    pub fn register(&self) -> (String, f64) {
        let flag = |on: bool| if on { 1.0 } else { 0.0 };
        match self {
            DeviceSetting::AinOn(on) => ("POWER_AIN".into(), flag(*on)),
            DeviceSetting::AinOnDefault(on) => ("POWER_AIN_DEFAULT".into(), flag(*on)),
            DeviceSetting::EthernetOn(on) => ("POWER_ETHERNET".into(), flag(*on)),
            DeviceSetting::EthernetOnDefault(on) => ("POWER_ETHERNET_DEFAULT".into(), flag(*on)),
            DeviceSetting::LedOn(on) => ("POWER_LED".into(), flag(*on)),
            DeviceSetting::LedOnDefault(on) => ("POWER_LED_DEFAULT".into(), flag(*on)),
            DeviceSetting::WifiOn(on) => ("POWER_WIFI".into(), flag(*on)),
            DeviceSetting::WifiOnDefault(on) => ("POWER_WIFI_DEFAULT".into(), flag(*on)),
            DeviceSetting::StreamClock(clock) => (
                "STREAM_CLOCK_SOURCE".into(),
                match clock {
                    StreamClock::Internal => 0.0,
                    StreamClock::External => 2.0,
                },
            ),
            DeviceSetting::TriggeredStream(trigger) => (
                "STREAM_TRIGGER_INDEX".into(),
                trigger.map_or(0.0, TriggerChannel::index),
            ),
            DeviceSetting::StreamResolution(index) => {
                ("STREAM_RESOLUTION_INDEX".into(), f64::from(*index))
            }
            DeviceSetting::StreamSettlingUs(us) => ("STREAM_SETTLING_US".into(), *us),
            DeviceSetting::AinAllNegativeGround => {
                ("AIN_ALL_NEGATIVE_CH".into(), NEGATIVE_CHANNEL_GND)
            }
            DeviceSetting::Range(channel, volts) => (format!("{}_RANGE", channel), *volts),
        }
    }
}

/// Registers that prepare a device to stream `plan`.
///
/// Negative inputs go to ground, each analog channel gets its range, and the stream
/// gets one settling time and one resolution. T7 devices additionally get an untriggered,
/// internally clocked stream.
pub fn stream_settings(plan: &SamplingPlan, device_type: DeviceType) -> Vec<DeviceSetting> {
    let mut settings = Vec::new();
    if device_type == DeviceType::T7 {
        settings.push(DeviceSetting::TriggeredStream(None));
        settings.push(DeviceSetting::StreamClock(StreamClock::Internal));
    }
    settings.push(DeviceSetting::AinAllNegativeGround);
    for (channel, volts) in plan.analog_channels().zip(&plan.voltage_ranges) {
        settings.push(DeviceSetting::Range(channel.clone(), *volts));
    }
    settings.push(DeviceSetting::StreamSettlingUs(plan.settling_us));
    settings.push(DeviceSetting::StreamResolution(plan.resolution));
    settings
}

/// A process-wide driver library setting.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LibrarySetting {
    EnsureUpdated(bool),
    MultipleFeedbacks(bool),
    RetryOnTransactionErr(bool),
    StreamTimeoutMs(f64),
}

impl LibrarySetting {
    pub fn register(&self) -> (&'static str, f64) {
        let flag = |on: bool| if on { 1.0 } else { 0.0 };
        match *self {
            LibrarySetting::EnsureUpdated(on) => ("LJM_OLD_FIRMWARE_CHECK", flag(on)),
            LibrarySetting::MultipleFeedbacks(on) => {
                ("LJM_ALLOWS_AUTO_MULTIPLE_FEEDBACKS", flag(on))
            }
            LibrarySetting::RetryOnTransactionErr(on) => {
                ("LJM_RETRY_ON_TRANSACTION_ID_MISMATCH", flag(on))
            }
            LibrarySetting::StreamTimeoutMs(ms) => ("LJM_STREAM_RECEIVE_TIMEOUT_MS", ms),
        }
    }
}

/// Driver library configuration handed to a session when it is constructed.
#[derive(Clone, Debug, PartialEq)]
pub struct LibraryConfig {
    settings: Vec<LibrarySetting>,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            settings: vec![
                LibrarySetting::EnsureUpdated(true),
                LibrarySetting::MultipleFeedbacks(true),
                LibrarySetting::RetryOnTransactionErr(false),
                LibrarySetting::StreamTimeoutMs(0.0),
            ],
        }
    }
}

impl LibraryConfig {
    /// Replaces any setting of the same kind.
    pub fn set(&mut self, setting: LibrarySetting) {
        let name = setting.register().0;
        self.settings.retain(|s| s.register().0 != name);
        self.settings.push(setting);
    }

    pub fn settings(&self) -> &[LibrarySetting] {
        &self.settings
    }

    /// Read timeout for stream reads, `None` when reads block indefinitely.
    pub fn stream_timeout_ms(&self) -> Option<f64> {
        self.settings.iter().find_map(|s| match *s {
            LibrarySetting::StreamTimeoutMs(ms) if ms > 0.0 => Some(ms),
            _ => None,
        })
    }

    pub fn retry_on_transaction_err(&self) -> bool {
        self.settings
            .iter()
            .any(|s| matches!(s, LibrarySetting::RetryOnTransactionErr(true)))
    }

    /// Forces transaction-ID retries off, as streaming requires. Returns `true` when a
    /// configured retry was overridden.
    pub fn disable_transaction_retry(&mut self) -> bool {
        let was_on = self.retry_on_transaction_err();
        self.set(LibrarySetting::RetryOnTransactionErr(false));
        was_on
    }
}

pub fn log_all(identifier: &str, device_type: DeviceType, settings: &[DeviceSetting]) {
    let mut param_log = String::new();
    for setting in settings {
        if !setting.applies_to(device_type) {
            continue;
        }
        let (name, value) = setting.register();
        param_log.push_str(&format!("{}: {}\n", name, value));
    }
    if let Some(res) = settings.iter().find_map(|s| match s {
        DeviceSetting::StreamResolution(i) => t7_resolution(*i),
        _ => None,
    }) {
        param_log.push_str(&format!(
            "Effective resolution: {} bits, {} uV noise, {} ms/sample\n",
            res.bits, res.microvolts, res.sample_time_ms
        ));
    }

    if param_log.ends_with('\n') {
        param_log.pop();
    }
    info!("Device {} ({}) parameters:\n{}", identifier, device_type.name(), param_log);
}
