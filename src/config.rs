use crate::{ConnectionType, DeviceType};
use confique::Config;

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub device: DeviceConf,
    #[config(nested)]
    pub library: LibraryConf,
    #[config(nested)]
    pub plan: PlanConf,
    #[config(nested)]
    pub run: RunConf,
    #[config(nested)]
    pub calibration: CalibrationConf,
    #[config(nested)]
    pub simulator: SimulatorConf,
}

/// Which device to open.
#[derive(Config, Debug, Clone)]
pub struct DeviceConf {
    #[config(default = "ANY")]
    pub device_type: DeviceType,
    #[config(default = "ANY")]
    pub connection: ConnectionType,
    /// Serial number, IP address, name or `ANY`.
    #[config(default = "ANY")]
    pub identifier: String,
}

#[derive(Config, Debug, Clone)]
pub struct LibraryConf {
    #[config(default = true)]
    pub ensure_updated: bool,
    #[config(default = true)]
    pub multiple_feedbacks: bool,
    #[config(default = false)]
    pub retry_on_transaction_err: bool,
    /// 0 blocks reads indefinitely.
    #[config(default = 0.0)]
    pub stream_timeout_ms: f64,
}

#[derive(Config, Debug, Clone)]
pub struct PlanConf {
    #[config(default = ["AIN0"])]
    pub channels: Vec<String>,
    #[config(default = [10.0])]
    pub voltage_ranges: Vec<f64>,
    #[config(default = 1000.0)]
    pub frequency: f64,
    /// 0 picks half the frequency.
    #[config(default = 0)]
    pub packet_size: usize,
    #[config(default = 0)]
    pub resolution: u8,
    #[config(default = 0.0)]
    pub settling_us: f64,
}

#[derive(Config, Debug, Clone)]
pub struct RunConf {
    /// Seconds of data to collect.
    #[config(default = 10.0)]
    pub duration: f64,
    #[config(default = 4)]
    pub callback_workers: usize,
    #[config(default = 1024)]
    pub callback_queue: usize,
    #[config(default = 100)]
    pub submit_timeout_ms: u64,
    #[config(default = 250)]
    pub reap_interval_ms: u64,
    #[config(default = ".")]
    pub log_dir: String,
}

#[derive(Config, Debug, Clone)]
pub struct CalibrationConf {
    #[config(default = 3.0)]
    pub num_seconds: f64,
    #[config(default = 0)]
    pub max_device_backlog: u32,
    #[config(default = 0)]
    pub max_driver_backlog: u32,
    #[config(default = 64)]
    pub max_probes: u32,
    #[config(default = 1000)]
    pub max_attempts: u32,
}

/// The built-in simulated device.
#[derive(Config, Debug, Clone)]
pub struct SimulatorConf {
    #[config(default = "T7")]
    pub device_type: DeviceType,
    #[config(default = "USB")]
    pub connection: ConnectionType,
    #[config(default = 470010001)]
    pub serial_number: i32,
    #[config(default = 50000.0)]
    pub sustain_limit: f64,
    #[config(default = 100000.0)]
    pub start_limit: f64,
    #[config(default = 2000.0)]
    pub max_reads_per_second: f64,
    #[config(default = true)]
    pub realtime: bool,
    #[config(default = 0.01)]
    pub noise: f64,
    #[config(default = 0)]
    pub seed: u64,
}
