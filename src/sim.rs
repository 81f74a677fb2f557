//! In-process stand-in for the vendor driver.
//!
//! A [`SimulatedBackend`] plays the part of the physical bus: it lists devices, remembers
//! which of them currently have an open session and records every configuration write.
//! Each [`SimulatedDriver`] is one session onto that backend with its own transport limits.

use crate::driver::{
    ConnectionType, DeviceDescriptor, DeviceSession, DeviceType, Handle, HandleInfo, Packet,
    SKIP_SENTINEL,
};
use crate::settings::LibraryConfig;
use crate::{Channel, DriverReturn};
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Limits and scripted faults of a simulated device.
#[derive(Clone, Debug, PartialEq)]
pub struct SimSettings {
    /// Highest scan frequency the device sustains without dropping scans.
    pub sustain_limit: f64,
    /// Stream start is refused above this frequency.
    pub start_limit: f64,
    /// Reads per second the transport keeps up with before the driver backlog grows.
    pub max_reads_per_second: f64,
    /// Deliver packets at the rate a real device would instead of immediately.
    pub realtime: bool,
    /// Amplitude of uniform noise added to each reading.
    pub noise: f64,
    pub seed: u64,
    /// `(packet index, sentinel count)`: skip sentinels written into a packet, counted
    /// over the session's lifetime across stream restarts.
    pub skips: Vec<(u64, usize)>,
    /// Read calls, counted from zero over the session's lifetime, that fail with
    /// `DriverReturn::Comm`.
    pub read_failures: Vec<u64>,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            sustain_limit: 100_000.0,
            start_limit: 100_000.0,
            max_reads_per_second: 10_000.0,
            realtime: false,
            noise: 0.0,
            seed: 0,
            skips: Vec::new(),
            read_failures: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct BackendState {
    devices: Vec<DeviceDescriptor>,
    open: HashSet<i32>,
    config_log: Vec<(String, f64)>,
    streams_running: usize,
    stream_stops: usize,
}

/// Shared view of the simulated bus.
#[derive(Clone, Debug)]
pub struct SimulatedBackend {
    state: Arc<Mutex<BackendState>>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new(vec![DeviceDescriptor {
            device_type: DeviceType::T7,
            connection: ConnectionType::Usb,
            identifier: "470010001".to_string(),
            serial_number: 470010001,
        }])
    }
}

impl SimulatedBackend {
    pub fn new(devices: Vec<DeviceDescriptor>) -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState {
                devices,
                ..Default::default()
            })),
        }
    }

    /// A new session with the default library configuration.
    pub fn driver(&self, settings: SimSettings) -> SimulatedDriver {
        SimulatedDriver::new(self.clone(), LibraryConfig::default(), settings)
    }

    /// Every register written by any session, in order.
    pub fn written_config(&self) -> Vec<(String, f64)> {
        self.state().config_log.clone()
    }

    pub fn streams_running(&self) -> usize {
        self.state().streams_running
    }

    pub fn stream_stops(&self) -> usize {
        self.state().stream_stops
    }

    fn state(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
struct SimStream {
    channels: usize,
    frequency: f64,
    packet_size: usize,
    started: Instant,
    delivered: u64,
}

/// One driver session onto a [`SimulatedBackend`].
#[derive(Debug)]
pub struct SimulatedDriver {
    backend: SimulatedBackend,
    library: LibraryConfig,
    settings: SimSettings,
    rng: StdRng,
    next_handle: Handle,
    open: HashMap<Handle, DeviceDescriptor>,
    streams: HashMap<Handle, SimStream>,
    reads: u64,
    packets: u64,
}

impl SimulatedDriver {
    pub fn new(backend: SimulatedBackend, mut library: LibraryConfig, settings: SimSettings) -> Self {
        if library.disable_transaction_retry() {
            warn!("Retry on transaction ID mismatch cannot be used while streaming, disabled");
        }
        for setting in library.settings() {
            let (name, value) = setting.register();
            debug!("library {} = {}", name, value);
        }
        Self {
            backend,
            library,
            rng: StdRng::seed_from_u64(settings.seed),
            settings,
            next_handle: 1,
            open: HashMap::new(),
            streams: HashMap::new(),
            reads: 0,
            packets: 0,
        }
    }

    fn descriptor(&self, handle: Handle) -> Result<&DeviceDescriptor, DriverReturn> {
        self.open.get(&handle).ok_or(DriverReturn::InvalidHandle)
    }

    fn end_stream(&mut self, handle: Handle) -> Result<(), DriverReturn> {
        self.streams
            .remove(&handle)
            .ok_or(DriverReturn::StreamNotRunning)?;
        let mut state = self.backend.state();
        state.streams_running = state.streams_running.saturating_sub(1);
        state.stream_stops += 1;
        Ok(())
    }

    /// Waits until the next packet would exist on a real device.
    fn pace(&self, stream: &SimStream) -> Result<(), DriverReturn> {
        let due = Duration::from_secs_f64(
            (stream.delivered + 1) as f64 * stream.packet_size as f64 / stream.frequency,
        );
        let Some(wait) = due.checked_sub(stream.started.elapsed()) else {
            return Ok(());
        };
        match self.library.stream_timeout_ms() {
            Some(ms) if wait.as_secs_f64() * 1000.0 > ms => {
                thread::sleep(Duration::from_secs_f64(ms / 1000.0));
                Err(DriverReturn::Timeout)
            }
            _ => {
                thread::sleep(wait);
                Ok(())
            }
        }
    }
}

fn matches_request(
    device: &DeviceDescriptor,
    device_type: DeviceType,
    connection: ConnectionType,
    identifier: &str,
) -> bool {
    let type_ok = device_type == DeviceType::Any || device_type == device.device_type;
    let conn_ok = connection == ConnectionType::Any || connection == device.connection;
    let id_ok = identifier.is_empty()
        || identifier.eq_ignore_ascii_case("ANY")
        || identifier == device.identifier
        || identifier == device.serial_number.to_string();
    type_ok && conn_ok && id_ok
}

impl DeviceSession for SimulatedDriver {
    fn open(
        &mut self,
        device_type: DeviceType,
        connection: ConnectionType,
        identifier: &str,
    ) -> Result<Handle, DriverReturn> {
        let mut state = self.backend.state();
        let device = state
            .devices
            .iter()
            .find(|d| matches_request(d, device_type, connection, identifier))
            .cloned()
            .ok_or(DriverReturn::DevNotFound)?;
        if !state.open.insert(device.serial_number) {
            return Err(DriverReturn::DevAlreadyOpen);
        }
        drop(state);
        let handle = self.next_handle;
        self.next_handle += 1;
        self.open.insert(handle, device);
        Ok(handle)
    }

    fn close(&mut self, handle: Handle) -> Result<(), DriverReturn> {
        if self.streams.contains_key(&handle) {
            self.end_stream(handle)?;
        }
        let device = self.open.remove(&handle).ok_or(DriverReturn::InvalidHandle)?;
        self.backend.state().open.remove(&device.serial_number);
        Ok(())
    }

    fn handle_info(&mut self, handle: Handle) -> Result<HandleInfo, DriverReturn> {
        let device = self.descriptor(handle)?;
        let (ip_address, port, max_packet_bytes) = match device.connection {
            ConnectionType::Ethernet => (
                u32::from_be_bytes([192, 168, 1, (device.serial_number % 200 + 10) as u8]),
                502,
                1040,
            ),
            ConnectionType::Wifi => (
                u32::from_be_bytes([192, 168, 1, (device.serial_number % 200 + 10) as u8]),
                502,
                500,
            ),
            _ => (0, 0, 64),
        };
        Ok(HandleInfo {
            device_type: device.device_type,
            connection: device.connection,
            serial_number: device.serial_number,
            ip_address,
            port,
            max_packet_bytes,
        })
    }

    fn write_config(&mut self, handle: Handle, pairs: &[(String, f64)]) -> Result<(), DriverReturn> {
        self.descriptor(handle)?;
        if pairs.iter().any(|(_, v)| !v.is_finite()) {
            return Err(DriverReturn::InvalidParam);
        }
        self.backend.state().config_log.extend_from_slice(pairs);
        Ok(())
    }

    fn stream_start(
        &mut self,
        handle: Handle,
        channels: &[Channel],
        frequency: f64,
        packet_size: usize,
    ) -> Result<f64, DriverReturn> {
        self.descriptor(handle)?;
        if self.streams.contains_key(&handle) || self.library.retry_on_transaction_err() {
            return Err(DriverReturn::Command);
        }
        let per_second = (frequency.floor() as usize).max(1);
        if channels.is_empty()
            || !frequency.is_finite()
            || frequency <= 0.0
            || frequency > self.settings.start_limit
            || packet_size == 0
            || packet_size > per_second
        {
            return Err(DriverReturn::InvalidParam);
        }
        self.streams.insert(
            handle,
            SimStream {
                channels: channels.len(),
                frequency,
                packet_size,
                started: Instant::now(),
                delivered: 0,
            },
        );
        self.backend.state().streams_running += 1;
        Ok(frequency)
    }

    fn stream_stop(&mut self, handle: Handle) -> Result<(), DriverReturn> {
        self.descriptor(handle)?;
        self.end_stream(handle)
    }

    fn stream_read(&mut self, handle: Handle) -> Result<Packet, DriverReturn> {
        self.descriptor(handle)?;
        let read = self.reads;
        self.reads += 1;
        let stream = self
            .streams
            .get(&handle)
            .ok_or(DriverReturn::StreamNotRunning)?;
        if self.settings.read_failures.contains(&read) {
            return Err(DriverReturn::Comm);
        }
        if self.settings.realtime {
            self.pace(stream)?;
        }

        let (channels, frequency, packet_size) =
            (stream.channels, stream.frequency, stream.packet_size);
        let noise = self.settings.noise;
        let mut values = Vec::with_capacity(channels * packet_size);
        for _ in 0..packet_size {
            for ch in 0..channels {
                let jitter = if noise > 0.0 {
                    noise * self.rng.random_range(-1.0..=1.0)
                } else {
                    0.0
                };
                values.push(ch as f64 + jitter);
            }
        }

        let sustain = self.settings.sustain_limit;
        let mut device_backlog = 0;
        if frequency > sustain {
            let lost = ((packet_size as f64) * (1.0 - sustain / frequency)).ceil() as usize;
            let lost = lost.clamp(1, packet_size);
            let from = (packet_size - lost) * channels;
            values[from..].fill(SKIP_SENTINEL);
            device_backlog = (packet_size as f64 * (frequency / sustain - 1.0)).ceil() as u32;
        }
        let injected: usize = self
            .settings
            .skips
            .iter()
            .filter(|(index, _)| *index == self.packets)
            .map(|(_, count)| *count)
            .sum();
        let injected = injected.min(values.len());
        let len = values.len();
        values[len - injected..].fill(SKIP_SENTINEL);

        let reads_per_second = frequency / packet_size as f64;
        let limit = self.settings.max_reads_per_second;
        let driver_backlog = if reads_per_second > limit {
            ((reads_per_second - limit) / limit * packet_size as f64)
                .ceil()
                .max(1.0) as u32
        } else {
            0
        };

        self.packets += 1;
        if let Some(stream) = self.streams.get_mut(&handle) {
            stream.delivered += 1;
        }
        Ok(Packet {
            values,
            device_backlog,
            driver_backlog,
        })
    }

    fn list_devices(&mut self) -> Result<Vec<DeviceDescriptor>, DriverReturn> {
        Ok(self.backend.state().devices.clone())
    }
}

impl Drop for SimulatedDriver {
    fn drop(&mut self) {
        let handles: Vec<Handle> = self.open.keys().copied().collect();
        for handle in handles {
            let _ = self.close(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn open(driver: &mut SimulatedDriver) -> Handle {
        driver
            .open(DeviceType::Any, ConnectionType::Any, "ANY")
            .unwrap()
    }

    fn chans(n: usize) -> Vec<Channel> {
        (0..n).map(|i| Channel::from(format!("AIN{i}"))).collect()
    }

    #[test]
    fn open_matches_by_identifier_and_type() {
        let backend = SimulatedBackend::default();
        let mut driver = backend.driver(SimSettings::default());
        assert_eq!(
            driver.open(DeviceType::T4, ConnectionType::Any, "ANY"),
            Err(DriverReturn::DevNotFound)
        );
        let handle = driver
            .open(DeviceType::T7, ConnectionType::Usb, "470010001")
            .unwrap();
        assert_eq!(driver.handle_info(handle).unwrap().max_packet_bytes, 64);
        assert_eq!(
            driver.open(DeviceType::Any, ConnectionType::Any, "ANY"),
            Err(DriverReturn::DevAlreadyOpen)
        );
        driver.close(handle).unwrap();
        assert_eq!(driver.close(handle), Err(DriverReturn::InvalidHandle));
    }

    #[test]
    fn dropping_a_session_releases_its_devices() {
        let backend = SimulatedBackend::default();
        let mut first = backend.driver(SimSettings::default());
        open(&mut first);
        drop(first);
        let mut second = backend.driver(SimSettings::default());
        open(&mut second);
    }

    #[test]
    fn start_rejects_bad_parameters() {
        let backend = SimulatedBackend::default();
        let settings = SimSettings {
            start_limit: 1000.0,
            ..Default::default()
        };
        let mut driver = backend.driver(settings);
        let h = open(&mut driver);
        let c = chans(1);
        for (freq, packet) in [(2000.0, 1), (100.0, 0), (100.0, 101), (-1.0, 1)] {
            assert_eq!(
                driver.stream_start(h, &c, freq, packet),
                Err(DriverReturn::InvalidParam)
            );
        }
        assert_eq!(driver.stream_read(h), Err(DriverReturn::StreamNotRunning));
        assert_eq!(driver.stream_start(h, &c, 1000.0, 100), Ok(1000.0));
        assert_eq!(driver.stream_start(h, &c, 1000.0, 100), Err(DriverReturn::Command));
    }

    #[test]
    fn overload_produces_skips_and_backlog() {
        let backend = SimulatedBackend::default();
        let settings = SimSettings {
            sustain_limit: 500.0,
            max_reads_per_second: 50.0,
            ..Default::default()
        };
        let mut driver = backend.driver(settings);
        let h = open(&mut driver);
        driver.stream_start(h, &chans(2), 400.0, 4).unwrap();
        let packet = driver.stream_read(h).unwrap();
        assert_eq!(packet.skip_count(), 0);
        assert_eq!(packet.device_backlog, 0);
        assert!(packet.driver_backlog > 0);
        driver.stream_stop(h).unwrap();

        driver.stream_start(h, &chans(2), 1000.0, 100).unwrap();
        let packet = driver.stream_read(h).unwrap();
        assert_eq!(packet.skip_count(), 100);
        assert!(packet.device_backlog > 0);
        assert_eq!(packet.driver_backlog, 0);
    }

    #[test]
    fn scripted_faults_fire_once() {
        let backend = SimulatedBackend::default();
        let settings = SimSettings {
            skips: vec![(1, 3)],
            read_failures: vec![2],
            ..Default::default()
        };
        let mut driver = backend.driver(settings);
        let h = open(&mut driver);
        driver.stream_start(h, &chans(2), 100.0, 5).unwrap();
        assert_eq!(driver.stream_read(h).unwrap().skip_count(), 0);
        assert_eq!(driver.stream_read(h).unwrap().skip_count(), 3);
        assert_eq!(driver.stream_read(h), Err(DriverReturn::Comm));
        assert_eq!(driver.stream_read(h).unwrap().skip_count(), 0);
    }

    #[test]
    fn noise_is_seeded() {
        let settings = SimSettings {
            noise: 0.5,
            seed: 7,
            ..Default::default()
        };
        let read = |settings: SimSettings| {
            let backend = SimulatedBackend::default();
            let mut driver = backend.driver(settings);
            let h = open(&mut driver);
            driver.stream_start(h, &chans(3), 100.0, 10).unwrap();
            driver.stream_read(h).unwrap().values
        };
        let a = read(settings.clone());
        assert_eq!(a, read(settings));
        assert!(a.iter().all(|v| *v != SKIP_SENTINEL));
    }

    #[test]
    fn realtime_pacing_takes_stream_time() {
        let backend = SimulatedBackend::default();
        let settings = SimSettings {
            realtime: true,
            ..Default::default()
        };
        let mut driver = backend.driver(settings);
        let h = open(&mut driver);
        driver.stream_start(h, &chans(1), 100.0, 10).unwrap();
        let start = Instant::now();
        for _ in 0..3 {
            driver.stream_read(h).unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(290));
    }
}
