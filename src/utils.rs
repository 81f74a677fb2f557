use crate::calibrate::CalibrationSettings;
use crate::dispatch::DispatchSettings;
use crate::engine::EngineSettings;
use crate::settings::{LibraryConfig, LibrarySetting};
use crate::sim::{SimSettings, SimulatedBackend, SimulatedDriver};
use crate::{Channel, Conf, ConnectionType, Device, DeviceDescriptor, PacketSize, SamplingPlan};
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Tracks rows written, with both an all-time total and a sliding 1 s window rate.
#[derive(Debug)]
pub struct Counter {
    /// All-time number of rows
    pub total_rows: usize,
    /// Time when this counter was created or last reset
    pub t_begin: Instant,

    window: Duration,
    samples: VecDeque<(Instant, usize)>,
    rows_in_window: usize,
}

impl Default for Counter {
    fn default() -> Self {
        Counter {
            total_rows: 0,
            t_begin: Instant::now(),
            window: Duration::from_secs(1),
            samples: VecDeque::new(),
            rows_in_window: 0,
        }
    }
}

impl Counter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Rows per second over the last `window`
    pub fn rate(&self) -> f64 {
        let secs = self.window.as_secs_f64().max(1e-6);
        self.rows_in_window as f64 / secs
    }

    pub fn increment(&mut self, rows: usize) {
        self.increment_at(Instant::now(), rows);
    }

    fn increment_at(&mut self, now: Instant, rows: usize) {
        self.total_rows += rows;
        self.samples.push_back((now, rows));
        self.rows_in_window += rows;

        while let Some(&(ts, n)) = self.samples.front() {
            if now.duration_since(ts) > self.window {
                self.samples.pop_front();
                self.rows_in_window -= n;
            } else {
                break;
            }
        }
    }

    pub fn reset(&mut self) {
        self.total_rows = 0;
        self.t_begin = Instant::now();
        self.samples.clear();
        self.rows_in_window = 0;
    }
}

pub fn sampling_plan(config: &Conf) -> SamplingPlan {
    let plan = &config.plan;
    SamplingPlan::new(
        plan.channels.iter().map(|c| Channel::from(c.as_str())).collect(),
        plan.voltage_ranges.clone(),
        plan.frequency,
        PacketSize::from(plan.packet_size),
        plan.resolution,
    )
    .with_settling_us(plan.settling_us)
}

pub fn library_config(config: &Conf) -> LibraryConfig {
    let lib = &config.library;
    let mut library = LibraryConfig::default();
    library.set(LibrarySetting::EnsureUpdated(lib.ensure_updated));
    library.set(LibrarySetting::MultipleFeedbacks(lib.multiple_feedbacks));
    library.set(LibrarySetting::RetryOnTransactionErr(lib.retry_on_transaction_err));
    library.set(LibrarySetting::StreamTimeoutMs(lib.stream_timeout_ms));
    library
}

pub fn calibration_settings(config: &Conf) -> CalibrationSettings {
    let cal = &config.calibration;
    CalibrationSettings {
        num_seconds: cal.num_seconds,
        max_device_backlog: cal.max_device_backlog,
        max_driver_backlog: cal.max_driver_backlog,
        max_probes: cal.max_probes,
        max_attempts: cal.max_attempts,
    }
}

pub fn engine_settings(config: &Conf) -> EngineSettings {
    let run = &config.run;
    EngineSettings {
        dispatch: DispatchSettings {
            workers: run.callback_workers,
            queue_depth: run.callback_queue,
            submit_timeout: Duration::from_millis(run.submit_timeout_ms),
        },
        reap_interval: Duration::from_millis(run.reap_interval_ms),
    }
}

pub fn sim_settings(config: &Conf) -> SimSettings {
    let sim = &config.simulator;
    SimSettings {
        sustain_limit: sim.sustain_limit,
        start_limit: sim.start_limit,
        max_reads_per_second: sim.max_reads_per_second,
        realtime: sim.realtime,
        noise: sim.noise,
        seed: sim.seed,
        ..Default::default()
    }
}

/// A bus holding the one simulated device described by `config`.
pub fn sim_backend(config: &Conf) -> SimulatedBackend {
    let sim = &config.simulator;
    let identifier = match sim.connection {
        ConnectionType::Ethernet | ConnectionType::Wifi => {
            format!("192.168.1.{}", sim.serial_number % 200 + 10)
        }
        _ => sim.serial_number.to_string(),
    };
    SimulatedBackend::new(vec![DeviceDescriptor {
        device_type: sim.device_type,
        connection: sim.connection,
        identifier,
        serial_number: sim.serial_number,
    }])
}

/// The configured device, reached through a simulated session on `backend`.
pub fn simulated_device(config: &Conf, backend: &SimulatedBackend) -> Device<SimulatedDriver> {
    let driver = SimulatedDriver::new(backend.clone(), library_config(config), sim_settings(config));
    Device::new(
        driver,
        config.device.device_type,
        config.device.connection,
        config.device.identifier.clone(),
    )
}
