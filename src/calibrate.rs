//! Search for the fastest loss-free stream rate a device sustains.
//!
//! The frequency grows exponentially while candidates pass. The first failure switches
//! to a bisection between the last good frequency and the failing one. A failing
//! candidate first tries larger packets (fewer reads per second) before the frequency
//! is given up on.

use crate::device::Device;
use crate::driver::DeviceSession;
use crate::{DaqError, DriverReturn, Result, SamplingPlan};
use log::{debug, info, warn};
use std::fmt;
use std::time::{Duration, Instant};

pub const START_FREQUENCY: f64 = 100.0;

#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationSettings {
    /// Observation window per candidate, in seconds of streamed data.
    pub num_seconds: f64,
    pub max_device_backlog: u32,
    pub max_driver_backlog: u32,
    /// Hard stop on distinct frequencies tried.
    pub max_probes: u32,
    /// Hard stop on stream starts, counting packet size changes. A failing frequency is
    /// started once per packet size tried, so a search well within `max_probes` can take
    /// several times as many starts, each costing up to `num_seconds`.
    pub max_attempts: u32,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            num_seconds: 3.0,
            max_device_backlog: 0,
            max_driver_backlog: 0,
            max_probes: 64,
            max_attempts: 1000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Exponential,
    Binary,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationState {
    pub mode: Mode,
    pub frequency: f64,
    pub packet_size: usize,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub last_good: Option<(f64, usize)>,
    last_attempt: Option<(f64, usize, bool)>,
    finished: bool,
}

impl Default for CalibrationState {
    fn default() -> Self {
        Self {
            mode: Mode::Exponential,
            frequency: START_FREQUENCY,
            packet_size: 1,
            lower_bound: 0.0,
            upper_bound: 0.0,
            last_good: None,
            last_attempt: None,
            finished: false,
        }
    }
}

impl CalibrationState {
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn packet_cap(&self) -> usize {
        (self.frequency.floor() as usize).max(1)
    }

    fn collapsed(&self) -> bool {
        let f = self.frequency as i64;
        f == self.lower_bound as i64 || f == self.upper_bound as i64
    }

    /// Moves to the midpoint and finishes if it truncates onto a bound.
    fn bisect(&mut self) {
        self.frequency = (self.lower_bound + self.upper_bound) / 2.0;
        self.packet_size = self.packet_size.min(self.packet_cap());
        if self.collapsed() {
            self.finished = true;
        }
    }

    fn record(&mut self, passed: bool) {
        self.last_attempt = Some((self.frequency, self.packet_size, passed));
    }

    /// Handles a binary-mode retry of the exact previous candidate. Returns `true` when the
    /// bounds were moved and the candidate should not be run.
    pub fn resolve_repeat(&mut self) -> bool {
        if self.mode != Mode::Binary {
            return false;
        }
        match self.last_attempt {
            Some((f, p, passed)) if f == self.frequency && p == self.packet_size => {
                if passed {
                    self.lower_bound = self.frequency;
                } else {
                    self.upper_bound = self.frequency;
                }
                self.bisect();
                true
            }
            _ => false,
        }
    }

    pub fn on_success(&mut self) {
        self.record(true);
        self.last_good = Some((self.frequency, self.packet_size));
        match self.mode {
            Mode::Exponential => {
                self.lower_bound = self.frequency;
                self.upper_bound = 2.0 * self.frequency;
                self.frequency *= 1.5;
            }
            Mode::Binary => {
                self.lower_bound = self.frequency;
                self.bisect();
            }
        }
    }

    pub fn on_failure(&mut self) {
        self.record(false);
        let cap = self.packet_cap();
        if self.packet_size < cap {
            self.packet_size = (self.packet_size * 2).min(cap);
            return;
        }
        self.mode = Mode::Binary;
        self.upper_bound = self.frequency;
        self.packet_size = self.last_good.map(|(_, p)| p).unwrap_or(1);
        self.bisect();
    }

    /// Best observed rate, frequency floored to a multiple of 100 (whole hertz below 100).
    pub fn outcome(&self) -> Calibration {
        match self.last_good {
            Some((f, packet_size)) => {
                let frequency = if f >= 100.0 {
                    (f / 100.0).floor() * 100.0
                } else {
                    f.floor()
                };
                if frequency < 1.0 {
                    Calibration::Failed
                } else {
                    Calibration::Found {
                        frequency,
                        packet_size: packet_size.min(frequency as usize),
                    }
                }
            }
            None => Calibration::Failed,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Calibration {
    Found { frequency: f64, packet_size: usize },
    Failed,
}

impl Calibration {
    /// `(frequency, packet_size)`, or `(-1, -1)` when nothing passed.
    pub fn as_pair(&self) -> (f64, i64) {
        match *self {
            Calibration::Found {
                frequency,
                packet_size,
            } => (frequency, packet_size as i64),
            Calibration::Failed => (-1.0, -1),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationReport {
    pub outcome: Calibration,
    /// Distinct frequencies tried.
    pub probes: u32,
    /// Stream starts attempted.
    pub attempts: u32,
    pub elapsed: Duration,
}

/// What one candidate looked like over its window.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Observation {
    pub frequency: f64,
    pub packet_size: usize,
    pub max_device_backlog: u32,
    pub max_driver_backlog: u32,
    pub skips: u64,
    pub scans: u64,
    pub error: Option<DriverReturn>,
}

impl Observation {
    fn passed(&self, settings: &CalibrationSettings) -> bool {
        self.error.is_none()
            && self.skips == 0
            && self.max_device_backlog <= settings.max_device_backlog
            && self.max_driver_backlog <= settings.max_driver_backlog
    }
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2} Hz, packet {}, device backlog {}, driver backlog {}, skips {}",
            self.frequency,
            self.packet_size,
            self.max_device_backlog,
            self.max_driver_backlog,
            self.skips
        )?;
        if let Some(code) = self.error {
            write!(f, ", error {}", code)?;
        }
        Ok(())
    }
}

pub struct RateCalibrator<'d, S: DeviceSession> {
    device: &'d mut Device<S>,
    plan: SamplingPlan,
    settings: CalibrationSettings,
}

impl<'d, S: DeviceSession> RateCalibrator<'d, S> {
    pub fn new(device: &'d mut Device<S>, plan: &SamplingPlan, settings: CalibrationSettings) -> Self {
        Self {
            device,
            plan: plan.clone(),
            settings,
        }
    }

    pub fn calibrate(&mut self) -> Result<CalibrationReport> {
        self.plan.validate()?;
        let t_begin = Instant::now();
        let mut state = CalibrationState::default();
        let mut probes = 0;
        let mut attempts = 0;
        let mut last_probe = None;

        info!(
            "Calibrating {} channels, {} s per candidate",
            self.plan.channel_count(),
            self.settings.num_seconds
        );
        while !state.is_finished() {
            if state.resolve_repeat() {
                continue;
            }
            if last_probe != Some(state.frequency) {
                if probes >= self.settings.max_probes {
                    warn!("Calibration stopped after {} frequency probes", probes);
                    break;
                }
                probes += 1;
                last_probe = Some(state.frequency);
            }
            if attempts >= self.settings.max_attempts {
                warn!("Calibration stopped after {} attempts", attempts);
                break;
            }
            attempts += 1;

            let observation = self.observe(state.frequency, state.packet_size);
            let passed = observation.passed(&self.settings);
            info!(
                "{} {} [{:.2}, {:.2}]",
                if passed { "PASS" } else { "FAIL" },
                observation,
                state.lower_bound,
                state.upper_bound
            );
            if passed {
                state.on_success();
            } else {
                state.on_failure();
            }
        }

        let outcome = state.outcome();
        match outcome {
            Calibration::Found {
                frequency,
                packet_size,
            } => info!(
                "Calibrated: {} Hz with {} scans per packet ({} probes, {} attempts)",
                frequency, packet_size, probes, attempts
            ),
            Calibration::Failed => warn!(
                "Calibration found no loss-free rate ({} probes, {} attempts)",
                probes, attempts
            ),
        }
        Ok(CalibrationReport {
            outcome,
            probes,
            attempts,
            elapsed: t_begin.elapsed(),
        })
    }

    /// Streams one candidate until the window is covered or it fails.
    fn observe(&mut self, frequency: f64, packet_size: usize) -> Observation {
        let mut obs = Observation {
            frequency,
            packet_size,
            ..Default::default()
        };

        if !self.device.is_open() {
            let opened = self
                .device
                .open()
                .and_then(|_| self.device.configure_stream(&self.plan));
            if let Err(e) = opened {
                debug!("Candidate could not open the device: {}", e);
                obs.error = Some(driver_code(&e));
                if let Err(e) = self.device.close() {
                    warn!("{}", e);
                }
                return obs;
            }
        }

        let channels = self.plan.channel_count();
        let mut stream = match self
            .device
            .start_stream(&self.plan.channels, frequency, packet_size)
        {
            Ok(stream) => stream,
            Err(e) => {
                debug!("Candidate did not start: {}", e);
                obs.error = Some(driver_code(&e));
                return obs;
            }
        };
        obs.frequency = stream.actual_frequency();

        let window = Duration::from_secs_f64(self.settings.num_seconds);
        let window_scans = (self.settings.num_seconds * obs.frequency).ceil() as u64;
        let started = Instant::now();
        while obs.scans < window_scans && started.elapsed() < window {
            match stream.read() {
                Ok(packet) => {
                    obs.scans += (packet.values.len() / channels) as u64;
                    obs.skips += packet.skip_count();
                    obs.max_device_backlog = obs.max_device_backlog.max(packet.device_backlog);
                    obs.max_driver_backlog = obs.max_driver_backlog.max(packet.driver_backlog);
                }
                Err(code) => obs.error = Some(code),
            }
            if !obs.passed(&self.settings) {
                break;
            }
        }
        if let Err(e) = stream.stop() {
            warn!("{}", e);
        }
        obs
    }
}

fn driver_code(e: &DaqError) -> DriverReturn {
    match e {
        DaqError::DeviceUnavailable { code, .. } | DaqError::TransientRead(code) => *code,
        _ => DriverReturn::Generic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ConnectionType, DeviceType};
    use crate::sim::{SimSettings, SimulatedBackend};
    use crate::{Channel, PacketSize, SimulatedDriver};
    use pretty_assertions::assert_eq;

    fn plan() -> SamplingPlan {
        SamplingPlan::new(
            vec![Channel::from("AIN0"), Channel::from("AIN1")],
            vec![10.0, 10.0],
            1000.0,
            PacketSize::Auto,
            0,
        )
    }

    fn settings() -> CalibrationSettings {
        CalibrationSettings {
            num_seconds: 0.2,
            ..Default::default()
        }
    }

    fn run(backend: &SimulatedBackend, sim: SimSettings) -> CalibrationReport {
        let mut device: Device<SimulatedDriver> =
            Device::new(backend.driver(sim), DeviceType::Any, ConnectionType::Any, "ANY");
        RateCalibrator::new(&mut device, &plan(), settings())
            .calibrate()
            .unwrap()
    }

    #[test]
    fn exponential_then_binary() {
        let mut state = CalibrationState::default();
        state.on_success();
        assert_eq!(state.frequency, 150.0);
        assert_eq!((state.lower_bound, state.upper_bound), (100.0, 200.0));

        // 150 Hz fails until the packet saturates at 150 scans
        let mut grows = 0;
        while state.mode == Mode::Exponential {
            state.on_failure();
            grows += 1;
        }
        assert_eq!(grows, 9);
        assert_eq!(state.upper_bound, 150.0);
        assert_eq!(state.frequency, 125.0);
        assert_eq!(state.packet_size, 1);

        state.on_success();
        assert_eq!(state.lower_bound, 125.0);
        assert_eq!(state.frequency, 137.5);
    }

    #[test]
    fn repeat_moves_the_bound_instead_of_retrying() {
        let mut state = CalibrationState {
            mode: Mode::Binary,
            frequency: 300.0,
            packet_size: 4,
            lower_bound: 200.0,
            upper_bound: 400.0,
            ..Default::default()
        };
        state.record(false);
        assert!(state.resolve_repeat());
        assert_eq!(state.upper_bound, 300.0);
        assert_eq!(state.frequency, 250.0);
        assert!(!state.resolve_repeat());
    }

    #[test]
    fn outcome_floors_to_hundreds() {
        let mut state = CalibrationState::default();
        assert_eq!(state.outcome(), Calibration::Failed);
        assert_eq!(state.outcome().as_pair(), (-1.0, -1));
        state.last_good = Some((4987.3, 16));
        assert_eq!(
            state.outcome(),
            Calibration::Found {
                frequency: 4900.0,
                packet_size: 16
            }
        );
        state.last_good = Some((62.5, 2));
        assert_eq!(state.outcome().as_pair(), (62.0, 2));
    }

    #[test]
    fn converges_below_sustainable_frequency() {
        let limit = 5000.0;
        let backend = SimulatedBackend::default();
        let report = run(
            &backend,
            SimSettings {
                sustain_limit: limit,
                max_reads_per_second: 1e9,
                ..Default::default()
            },
        );
        let (f, p) = report.outcome.as_pair();
        assert!(f > 0.0 && f <= limit, "{f}");
        assert!(f >= 0.9 * limit, "{f}");
        assert!(p >= 1);
        assert!(report.probes <= 40, "{} probes", report.probes);
        assert_eq!(backend.streams_running(), 0);
    }

    #[test]
    fn read_errors_fail_the_candidate_only() {
        let backend = SimulatedBackend::default();
        let report = run(
            &backend,
            SimSettings {
                sustain_limit: 3000.0,
                read_failures: vec![0, 1, 2, 40, 41],
                ..Default::default()
            },
        );
        let (f, p) = report.outcome.as_pair();
        assert!(f > 0.0 && f <= 3000.0, "{f}");
        assert!(p >= 1);
        assert!(report.attempts > report.probes);
        assert_eq!(backend.streams_running(), 0);
    }

    #[test]
    fn transport_limit_pushes_packet_size_up() {
        let backend = SimulatedBackend::default();
        let report = run(
            &backend,
            SimSettings {
                sustain_limit: 3000.0,
                max_reads_per_second: 200.0,
                ..Default::default()
            },
        );
        let (f, p) = report.outcome.as_pair();
        assert!(f > 0.0 && f <= 3000.0);
        assert!(f / p as f64 <= 200.0, "{f} Hz with packet {p}");
    }

    #[test]
    fn start_limit_bounds_the_result() {
        let backend = SimulatedBackend::default();
        let report = run(
            &backend,
            SimSettings {
                start_limit: 2500.0,
                max_reads_per_second: 1e9,
                ..Default::default()
            },
        );
        let (f, _) = report.outcome.as_pair();
        assert!(f > 0.0 && f <= 2500.0);
    }

    #[test]
    fn hopeless_device_reports_failure() {
        let backend = SimulatedBackend::default();
        let report = run(
            &backend,
            SimSettings {
                sustain_limit: 0.5,
                ..Default::default()
            },
        );
        assert_eq!(report.outcome, Calibration::Failed);
        assert_eq!(backend.streams_running(), 0);
    }

    #[test]
    fn missing_device_reports_failure() {
        let backend = SimulatedBackend::new(Vec::new());
        let report = run(&backend, SimSettings::default());
        assert_eq!(report.outcome.as_pair(), (-1.0, -1));
    }

    #[test]
    fn invalid_plan_is_rejected_up_front() {
        let backend = SimulatedBackend::default();
        let mut device: Device<SimulatedDriver> = Device::new(
            backend.driver(SimSettings::default()),
            DeviceType::Any,
            ConnectionType::Any,
            "ANY",
        );
        let bad = SamplingPlan::new(vec![], vec![], 100.0, PacketSize::Auto, 0);
        let err = RateCalibrator::new(&mut device, &bad, settings())
            .calibrate()
            .unwrap_err();
        assert!(err.is_validation());
        assert!(!device.is_open());
    }
}
