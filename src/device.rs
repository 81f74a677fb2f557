use crate::driver::{ConnectionType, DeviceDescriptor, DeviceSession, DeviceType, Handle, HandleInfo, Packet};
use crate::settings::{self, DeviceSetting};
use crate::{Channel, DaqError, DriverReturn, Result, SamplingPlan};
use log::{debug, info, warn};

/// One physical device reached through a driver session.
///
/// The device is closed when the wrapper is dropped.
pub struct Device<S: DeviceSession> {
    pub device_type: DeviceType,
    pub connection: ConnectionType,
    pub identifier: String,
    session: S,
    handle: Option<Handle>,
    info: Option<HandleInfo>,
}

impl<S: DeviceSession> Device<S> {
    pub fn new(
        session: S,
        device_type: DeviceType,
        connection: ConnectionType,
        identifier: impl Into<String>,
    ) -> Self {
        Self {
            device_type,
            connection,
            identifier: identifier.into(),
            session,
            handle: None,
            info: None,
        }
    }

    pub fn open(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        let handle = self
            .session
            .open(self.device_type, self.connection, &self.identifier)
            .map_err(|code| DaqError::unavailable("open", code))?;
        self.handle = Some(handle);
        match self.session.handle_info(handle) {
            Ok(info) => {
                info!(
                    "Opened {} over {} (serial {}, {}:{}, max packet {} bytes)",
                    info.device_type.name(),
                    info.connection.name(),
                    info.serial_number,
                    info.ip_string(),
                    info.port,
                    info.max_packet_bytes
                );
                self.info = Some(info);
            }
            Err(code) => warn!("Opened {} but could not describe it: {}", self.identifier, code),
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.info = None;
        self.session
            .close(handle)
            .map_err(|code| DaqError::unavailable("close", code))?;
        debug!("Closed {}", self.identifier);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn handle(&self) -> Result<Handle> {
        self.handle
            .ok_or(DaqError::unavailable("handle lookup", DriverReturn::InvalidHandle))
    }

    /// Type, connection, serial number, address and packet limit as reported by the device.
    pub fn describe(&mut self) -> Result<HandleInfo> {
        let handle = self.handle()?;
        let info = self
            .session
            .handle_info(handle)
            .map_err(|code| DaqError::unavailable("describe", code))?;
        self.info = Some(info.clone());
        Ok(info)
    }

    /// The concrete model once open, otherwise the requested one.
    pub fn model(&self) -> DeviceType {
        self.info
            .as_ref()
            .map(|i| i.device_type)
            .unwrap_or(self.device_type)
    }

    /// Writes every setting the model supports, in order.
    pub fn apply(&mut self, settings: &[DeviceSetting]) -> Result<()> {
        let handle = self.handle()?;
        let model = self.model();
        let pairs: Vec<(String, f64)> = settings
            .iter()
            .filter(|s| s.applies_to(model))
            .map(|s| s.register())
            .collect();
        self.session
            .write_config(handle, &pairs)
            .map_err(|code| DaqError::unavailable("configure", code))
    }

    /// Writes the stream settings derived from `plan`.
    pub fn configure_stream(&mut self, plan: &SamplingPlan) -> Result<()> {
        let settings = settings::stream_settings(plan, self.model());
        settings::log_all(&self.identifier, self.model(), &settings);
        self.apply(&settings)
    }

    pub fn list_devices(&mut self) -> Result<Vec<DeviceDescriptor>> {
        self.session
            .list_devices()
            .map_err(|code| DaqError::unavailable("device discovery", code))
    }

    /// Starts streaming `channels`. The stream stops when the returned guard is dropped.
    pub fn start_stream(
        &mut self,
        channels: &[Channel],
        frequency: f64,
        packet_size: usize,
    ) -> Result<Stream<'_, S>> {
        let handle = self.handle()?;
        let actual_frequency = self
            .session
            .stream_start(handle, channels, frequency, packet_size)
            .map_err(|code| DaqError::unavailable("stream start", code))?;
        debug!(
            "Stream started: {} channels at {} Hz (requested {}), {} scans per packet",
            channels.len(),
            actual_frequency,
            frequency,
            packet_size
        );
        Ok(Stream {
            session: &mut self.session,
            handle,
            channels: channels.to_vec(),
            requested_frequency: frequency,
            actual_frequency,
            packet_size,
            running: true,
        })
    }
}

impl<S: DeviceSession> Drop for Device<S> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("{}", e);
        }
    }
}

/// A running stream. Dropping it stops the stream if it is still running.
pub struct Stream<'a, S: DeviceSession> {
    session: &'a mut S,
    handle: Handle,
    channels: Vec<Channel>,
    requested_frequency: f64,
    actual_frequency: f64,
    packet_size: usize,
    running: bool,
}

impl<S: DeviceSession> Stream<'_, S> {
    pub fn actual_frequency(&self) -> f64 {
        self.actual_frequency
    }

    pub fn read(&mut self) -> std::result::Result<Packet, DriverReturn> {
        if !self.running {
            return Err(DriverReturn::StreamNotRunning);
        }
        self.session.stream_read(self.handle)
    }

    /// Stops and starts the stream again with the same parameters.
    pub fn restart(&mut self) -> Result<()> {
        if self.running {
            self.running = false;
            if let Err(code) = self.session.stream_stop(self.handle) {
                warn!("Stream stop before restart failed: {}", code);
            }
        }
        self.actual_frequency = self
            .session
            .stream_start(
                self.handle,
                &self.channels,
                self.requested_frequency,
                self.packet_size,
            )
            .map_err(|code| DaqError::unavailable("stream restart", code))?;
        self.running = true;
        Ok(())
    }

    pub fn stop(mut self) -> Result<()> {
        self.stop_inner()
    }

    fn stop_inner(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        self.running = false;
        self.session
            .stream_stop(self.handle)
            .map_err(|code| DaqError::unavailable("stream stop", code))?;
        debug!("Stream stopped");
        Ok(())
    }
}

impl<S: DeviceSession> Drop for Stream<'_, S> {
    fn drop(&mut self) {
        if let Err(e) = self.stop_inner() {
            warn!("{}", e);
        }
    }
}
