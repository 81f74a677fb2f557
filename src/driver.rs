//! Boundary to the vendor streaming driver.
//!
//! The driver itself is an external collaborator. Everything in the crate talks to it
//! through [`DeviceSession`], and every call reports failure with a [`DriverReturn`]
//! code the same way the vendor C library does.

use crate::Channel;
use serde::Deserialize;
use std::fmt;

/// Sentinel the device writes in place of a sample lost to a buffer overflow.
pub const SKIP_SENTINEL: f64 = -9999.0;

/// Opaque handle returned by [`DeviceSession::open`].
pub type Handle = i32;

#[repr(i32)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum DriverReturn {
    Success = 0,
    Generic = -1,
    InvalidParam = -2,
    DevAlreadyOpen = -3,
    DevNotFound = -4,
    MaxDev = -5,
    Command = -6,
    Internal = -7,
    NotImplemented = -8,
    InvalidHandle = -9,
    StreamNotRunning = -10,
    Timeout = -11,
    Stop = -12,
    ScanRateInconsistent = -13,
    BadLibVer = -14,
    Comm = -15,
    Unknown = 1,
}

impl fmt::Display for DriverReturn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, *self as i32)
    }
}

impl std::error::Error for DriverReturn {}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceType {
    T7,
    T4,
    Digit,
    Any,
}

impl DeviceType {
    pub fn name(self) -> &'static str {
        match self {
            DeviceType::T7 => "T7",
            DeviceType::T4 => "T4",
            DeviceType::Digit => "DIGIT",
            DeviceType::Any => "ANY",
        }
    }
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionType {
    Usb,
    Ethernet,
    Wifi,
    Any,
}

impl ConnectionType {
    pub fn name(self) -> &'static str {
        match self {
            ConnectionType::Usb => "USB",
            ConnectionType::Ethernet => "ETHERNET",
            ConnectionType::Wifi => "WIFI",
            ConnectionType::Any => "ANY",
        }
    }
}

/// One device as reported by [`DeviceSession::list_devices`].
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDescriptor {
    pub device_type: DeviceType,
    pub connection: ConnectionType,
    pub identifier: String,
    pub serial_number: i32,
}

/// Self-reported metadata for an open handle.
#[derive(Debug, Clone, PartialEq)]
pub struct HandleInfo {
    pub device_type: DeviceType,
    pub connection: ConnectionType,
    pub serial_number: i32,
    pub ip_address: u32,
    pub port: i32,
    pub max_packet_bytes: i32,
}

impl HandleInfo {
    /// Dotted-quad form of the packed IP address.
    pub fn ip_string(&self) -> String {
        let [a, b, c, d] = self.ip_address.to_be_bytes();
        format!("{a}.{b}.{c}.{d}")
    }
}

/// One stream read: interleaved scans plus the two backlog counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Packet {
    pub values: Vec<f64>,
    /// Scans still buffered on the device when the packet was taken.
    pub device_backlog: u32,
    /// Scans still buffered in the driver after this packet was removed.
    pub driver_backlog: u32,
}

impl Packet {
    pub fn skip_count(&self) -> u64 {
        self.values.iter().filter(|&&v| v == SKIP_SENTINEL).count() as u64
    }
}

/// The operations the acquisition core needs from a vendor driver.
///
/// Implementations are expected to refuse a second `open` of an identity that already
/// has a live handle (`DriverReturn::DevAlreadyOpen`).
pub trait DeviceSession: Send {
    fn open(
        &mut self,
        device_type: DeviceType,
        connection: ConnectionType,
        identifier: &str,
    ) -> Result<Handle, DriverReturn>;

    fn close(&mut self, handle: Handle) -> Result<(), DriverReturn>;

    fn handle_info(&mut self, handle: Handle) -> Result<HandleInfo, DriverReturn>;

    /// Writes named configuration registers in order.
    fn write_config(&mut self, handle: Handle, pairs: &[(String, f64)])
        -> Result<(), DriverReturn>;

    /// Starts a stream and returns the frequency the device actually runs at.
    fn stream_start(
        &mut self,
        handle: Handle,
        channels: &[Channel],
        frequency: f64,
        packet_size: usize,
    ) -> Result<f64, DriverReturn>;

    fn stream_stop(&mut self, handle: Handle) -> Result<(), DriverReturn>;

    /// Blocks until one packet of `packet_size` scans is available.
    fn stream_read(&mut self, handle: Handle) -> Result<Packet, DriverReturn>;

    fn list_devices(&mut self) -> Result<Vec<DeviceDescriptor>, DriverReturn>;
}

impl<S: DeviceSession + ?Sized> DeviceSession for Box<S> {
    fn open(
        &mut self,
        device_type: DeviceType,
        connection: ConnectionType,
        identifier: &str,
    ) -> Result<Handle, DriverReturn> {
        (**self).open(device_type, connection, identifier)
    }

    fn close(&mut self, handle: Handle) -> Result<(), DriverReturn> {
        (**self).close(handle)
    }

    fn handle_info(&mut self, handle: Handle) -> Result<HandleInfo, DriverReturn> {
        (**self).handle_info(handle)
    }

    fn write_config(
        &mut self,
        handle: Handle,
        pairs: &[(String, f64)],
    ) -> Result<(), DriverReturn> {
        (**self).write_config(handle, pairs)
    }

    fn stream_start(
        &mut self,
        handle: Handle,
        channels: &[Channel],
        frequency: f64,
        packet_size: usize,
    ) -> Result<f64, DriverReturn> {
        (**self).stream_start(handle, channels, frequency, packet_size)
    }

    fn stream_stop(&mut self, handle: Handle) -> Result<(), DriverReturn> {
        (**self).stream_stop(handle)
    }

    fn stream_read(&mut self, handle: Handle) -> Result<Packet, DriverReturn> {
        (**self).stream_read(handle)
    }

    fn list_devices(&mut self) -> Result<Vec<DeviceDescriptor>, DriverReturn> {
        (**self).list_devices()
    }
}
