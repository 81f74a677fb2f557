use crate::settings::MAX_RESOLUTION_INDEX;
use crate::{DaqError, Result};
use log::warn;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;

/// Name of one input line on the device, e.g. `AIN0` or `FIO3`.
#[derive(Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Channel(String);

impl Channel {
    pub fn name(&self) -> &str {
        &self.0
    }

    /// Analog inputs are the ones that take a voltage range.
    pub fn is_analog(&self) -> bool {
        self.0.starts_with("AIN")
    }
}

impl From<&str> for Channel {
    fn from(value: &str) -> Self {
        Channel(value.to_string())
    }
}

impl From<String> for Channel {
    fn from(value: String) -> Self {
        Channel(value)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scans requested per stream read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketSize {
    /// Half the scan frequency.
    Auto,
    Scans(usize),
}

impl From<usize> for PacketSize {
    /// `0` means automatic.
    fn from(value: usize) -> Self {
        match value {
            0 => PacketSize::Auto,
            n => PacketSize::Scans(n),
        }
    }
}

/// What to scan and how fast.
#[derive(Clone, Debug, PartialEq)]
pub struct SamplingPlan {
    pub channels: Vec<Channel>,
    /// One range per analog channel, in channel order.
    pub voltage_ranges: Vec<f64>,
    /// Scans per second.
    pub frequency: f64,
    pub packet_size: PacketSize,
    pub resolution: u8,
    pub settling_us: f64,
}

/// Something `resolve` adjusted instead of rejecting.
#[derive(Clone, Debug, PartialEq)]
pub enum PlanWarning {
    PacketClamped { requested: usize, clamped: usize },
}

impl fmt::Display for PlanWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanWarning::PacketClamped { requested, clamped } => write!(
                f,
                "packet size {} exceeds scans per second; using {}",
                requested, clamped
            ),
        }
    }
}

/// Concrete stream parameters after defaults and clamping.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedRate {
    pub frequency: f64,
    pub packet_size: usize,
    pub warnings: Vec<PlanWarning>,
}

impl SamplingPlan {
    pub fn new(
        channels: Vec<Channel>,
        voltage_ranges: Vec<f64>,
        frequency: f64,
        packet_size: PacketSize,
        resolution: u8,
    ) -> Self {
        Self {
            channels,
            voltage_ranges,
            frequency,
            packet_size,
            resolution,
            settling_us: 0.0,
        }
    }

    pub fn with_settling_us(mut self, settling_us: f64) -> Self {
        self.settling_us = settling_us;
        self
    }

    /// Same plan at a different rate, as produced by calibration.
    pub fn with_rate(mut self, frequency: f64, packet_size: usize) -> Self {
        self.frequency = frequency;
        self.packet_size = PacketSize::from(packet_size);
        self
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Channel values plus device time and host time.
    pub fn row_width(&self) -> usize {
        self.channels.len() + 2
    }

    pub fn analog_channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter().filter(|c| c.is_analog())
    }

    /// Column labels matching the rows stored in an acquisition buffer.
    pub fn column_labels(&self) -> Vec<String> {
        self.channels
            .iter()
            .map(|c| c.name().to_string())
            .chain(["Time".to_string(), "System Time".to_string()])
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            return Err(DaqError::validation("at least one channel is required"));
        }
        let mut seen = HashSet::new();
        for channel in &self.channels {
            if channel.name().is_empty() {
                return Err(DaqError::validation("channel names must not be empty"));
            }
            if !seen.insert(channel) {
                return Err(DaqError::validation(format!(
                    "channel {} is listed twice",
                    channel
                )));
            }
        }
        let analog = self.analog_channels().count();
        if self.voltage_ranges.len() != analog {
            return Err(DaqError::validation(format!(
                "{} voltage ranges given for {} analog channels",
                self.voltage_ranges.len(),
                analog
            )));
        }
        if let Some(bad) = self
            .voltage_ranges
            .iter()
            .find(|v| !v.is_finite() || **v <= 0.0)
        {
            return Err(DaqError::validation(format!(
                "voltage range {} must be positive",
                bad
            )));
        }
        if !self.frequency.is_finite() || self.frequency <= 0.0 {
            return Err(DaqError::validation(format!(
                "frequency {} must be positive",
                self.frequency
            )));
        }
        if self.packet_size == PacketSize::Scans(0) {
            return Err(DaqError::validation("packet size must be positive"));
        }
        if self.resolution > MAX_RESOLUTION_INDEX {
            return Err(DaqError::validation(format!(
                "resolution index {} exceeds {}",
                self.resolution, MAX_RESOLUTION_INDEX
            )));
        }
        if !self.settling_us.is_finite() || self.settling_us < 0.0 {
            return Err(DaqError::validation("settling time must be non-negative"));
        }
        Ok(())
    }

    /// Fills in an automatic packet size and clamps one that asks for more scans than a
    /// second produces.
    pub fn resolve(&self) -> ResolvedRate {
        let per_second = (self.frequency.floor() as usize).max(1);
        let mut warnings = Vec::new();
        let packet_size = match self.packet_size {
            PacketSize::Auto => (per_second / 2).max(1),
            PacketSize::Scans(n) if n > per_second => {
                let warning = PlanWarning::PacketClamped {
                    requested: n,
                    clamped: per_second,
                };
                warn!("{}", warning);
                warnings.push(warning);
                per_second
            }
            PacketSize::Scans(n) => n,
        };
        ResolvedRate {
            frequency: self.frequency,
            packet_size,
            warnings,
        }
    }
}
