use crate::buffer::{AcquisitionBuffer, RowWriter};
use crate::device::Device;
use crate::dispatch::{CallbackDispatcher, DispatchReport, DispatchSettings, RowCallback, SampleRow};
use crate::driver::DeviceSession;
use crate::plan::{PlanWarning, ResolvedRate};
use crate::{DaqError, Result, SamplingPlan};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, Debug, PartialEq)]
pub struct EngineSettings {
    pub dispatch: DispatchSettings,
    /// How often finished callbacks are collected while streaming.
    pub reap_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            dispatch: DispatchSettings::default(),
            reap_interval: Duration::from_millis(250),
        }
    }
}

/// Asks a running collection to finish after the packet in hand.
#[derive(Clone, Debug, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CollectReport {
    pub elapsed: Duration,
    /// Skip sentinels per channel.
    pub skip_rate: f64,
    pub skips: u64,
    pub rows: usize,
    pub frequency: f64,
    pub packet_size: usize,
    pub warnings: Vec<PlanWarning>,
    pub packets: u64,
    /// Read errors that a stream restart recovered from.
    pub recovered_reads: u64,
    pub cancelled: bool,
    pub dispatch: DispatchReport,
}

impl CollectReport {
    /// `(elapsed seconds, skip rate)`.
    pub fn as_pair(&self) -> (f64, f64) {
        (self.elapsed.as_secs_f64(), self.skip_rate)
    }
}

/// Streams a device into an acquisition buffer.
pub struct IngestionEngine<'d, S: DeviceSession> {
    device: &'d mut Device<S>,
    settings: EngineSettings,
}

impl<'d, S: DeviceSession> IngestionEngine<'d, S> {
    pub fn new(device: &'d mut Device<S>, settings: EngineSettings) -> Self {
        Self { device, settings }
    }

    /// Validates the request and allocates its buffer without touching the device.
    pub fn prepare(&mut self, plan: &SamplingPlan, duration: f64) -> Result<Run<'_, S>> {
        plan.validate()?;
        if !duration.is_finite() || duration <= 0.0 {
            return Err(DaqError::validation(format!(
                "duration {} must be positive",
                duration
            )));
        }
        let capacity = (duration * plan.frequency).ceil();
        if capacity > u32::MAX as f64 {
            return Err(DaqError::validation(format!(
                "{} s at {} Hz is too many rows",
                duration, plan.frequency
            )));
        }
        let resolved = plan.resolve();
        let (buffer, writer) = AcquisitionBuffer::allocate(capacity as usize, plan.row_width())?;
        Ok(Run {
            device: &mut *self.device,
            settings: self.settings.clone(),
            plan: plan.clone(),
            resolved,
            buffer,
            writer,
            stop: StopHandle::default(),
        })
    }

    /// Prepares and executes in one go. Returns the filled buffer with the report.
    pub fn collect(
        &mut self,
        plan: &SamplingPlan,
        duration: f64,
        callback: Option<RowCallback>,
    ) -> Result<(AcquisitionBuffer, CollectReport)> {
        let run = self.prepare(plan, duration)?;
        let buffer = run.buffer();
        let report = run.execute(callback)?;
        Ok((buffer, report))
    }
}

/// A prepared collection. Its buffer and stop handle can be handed to other threads
/// before [`Run::execute`] starts the stream.
pub struct Run<'d, S: DeviceSession> {
    device: &'d mut Device<S>,
    settings: EngineSettings,
    plan: SamplingPlan,
    resolved: ResolvedRate,
    buffer: AcquisitionBuffer,
    writer: RowWriter,
    stop: StopHandle,
}

impl<S: DeviceSession> Run<'_, S> {
    pub fn buffer(&self) -> AcquisitionBuffer {
        self.buffer.clone()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn execute(mut self, callback: Option<RowCallback>) -> Result<CollectReport> {
        let mut dispatcher = callback
            .map(|cb| CallbackDispatcher::start(cb, self.settings.dispatch))
            .transpose()?;

        self.device.open()?;
        self.device.configure_stream(&self.plan)?;

        let channels = self.plan.channel_count();
        let packet_size = self.resolved.packet_size;
        let capacity = self.buffer.capacity_rows();
        let t_begin = Instant::now();
        let mut stream =
            self.device
                .start_stream(&self.plan.channels, self.resolved.frequency, packet_size)?;
        let frequency = stream.actual_frequency();
        info!(
            "Collecting {} rows of {} channels at {} Hz, {} scans per packet",
            capacity, channels, frequency, packet_size
        );

        let mut packet_index: u64 = 0;
        let mut skips: u64 = 0;
        let mut recovered_reads: u64 = 0;
        let mut last_reap = Instant::now();
        while self.writer.remaining_rows() > 0 && !self.stop.is_stopped() {
            let packet = match stream.read() {
                Ok(packet) => packet,
                Err(code) => {
                    warn!("Stream read failed ({}); restarting stream", code);
                    if let Err(e) = stream.restart() {
                        error!("Stream restart failed: {}", e);
                        return Err(DaqError::TransientRead(code));
                    }
                    match stream.read() {
                        Ok(packet) => {
                            recovered_reads += 1;
                            packet
                        }
                        Err(code) => {
                            error!("Stream read failed again after restart: {}", code);
                            return Err(DaqError::TransientRead(code));
                        }
                    }
                }
            };

            let packet_skips = packet.skip_count();
            if packet_skips > 0 {
                warn!("Packet {} carried {} skipped samples", packet_index, packet_skips);
            }
            skips += packet_skips;

            let scans_in_packet = packet.values.len() / channels;
            for (offset, scan) in packet.values.chunks_exact(channels).enumerate() {
                if self.writer.remaining_rows() == 0 {
                    break;
                }
                let device_time = (packet_size as f64 / frequency)
                    * (packet_index as f64 + offset as f64 / scans_in_packet as f64);
                let host_time = t_begin.elapsed().as_secs_f64();
                let index = self.writer.append_scan(scan, device_time, host_time)?;
                if let Some(dispatcher) = dispatcher.as_mut() {
                    dispatcher.submit(SampleRow {
                        index,
                        readings: scan.to_vec(),
                        device_time,
                        host_time,
                    });
                }
            }
            packet_index += 1;
            debug!(
                "packet {}: {} scans, device backlog {}, driver backlog {}, rows {}",
                packet_index,
                scans_in_packet,
                packet.device_backlog,
                packet.driver_backlog,
                self.buffer.row_count()
            );

            if last_reap.elapsed() >= self.settings.reap_interval {
                if let Some(dispatcher) = dispatcher.as_mut() {
                    dispatcher.reap();
                }
                last_reap = Instant::now();
            }
        }
        if let Err(e) = stream.stop() {
            warn!("{}", e);
        }
        let elapsed = t_begin.elapsed();

        let cancelled = self.stop.is_stopped() && self.writer.remaining_rows() > 0;
        let dispatch = dispatcher.map(|d| d.drain()).unwrap_or_default();
        let report = CollectReport {
            elapsed,
            skip_rate: skips as f64 / channels as f64,
            skips,
            rows: self.buffer.row_count(),
            frequency,
            packet_size,
            warnings: self.resolved.warnings.clone(),
            packets: packet_index,
            recovered_reads,
            cancelled,
            dispatch,
        };
        info!(
            "Collected {} rows in {:.3} s ({} packets, skip rate {}{})",
            report.rows,
            report.elapsed.as_secs_f64(),
            report.packets,
            report.skip_rate,
            if cancelled { ", cancelled" } else { "" }
        );
        Ok(report)
    }
}
