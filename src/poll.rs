//! Periodic device presence polling

use std::fmt;
use std::ops::ControlFlow;
use std::thread;
use std::time::{Duration, Instant};

use log::{trace, warn};

use crate::connection::ConnectionManager;
use crate::device::{ConnectionState, ProtocolMode, TargetDevice};
use crate::enumerate::Enumerator;
use crate::EnumerationError;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A snapshot of the attached devices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Status {
    /// Number of DFU devices
    pub dfu: usize,
    /// Number of debug probes
    pub probes: usize,
    /// Number of configured UART ports that are present
    pub uart: usize,
    /// Whether a DFU device has a live session
    pub dfu_connected: bool,
    /// Whether any device has a live session
    pub device_connected: bool,
    pub devices: Vec<TargetDevice>,
}

impl Status {
    fn summarize(devices: Vec<TargetDevice>, device_connected: bool) -> Status {
        let count = |mode| devices.iter().filter(|d| d.mode == mode).count();

        Status {
            dfu: count(ProtocolMode::Dfu),
            probes: count(ProtocolMode::DebugProbe),
            uart: count(ProtocolMode::Uart),
            dfu_connected: devices.iter().any(|d| {
                d.mode == ProtocolMode::Dfu && d.state != ConnectionState::Disconnected
            }),
            device_connected,
            devices,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DFU: {}, debug probes: {}, UART: {}, connected: {}",
            self.dfu,
            self.probes,
            self.uart,
            if self.device_connected { "yes" } else { "no" }
        )
    }
}

pub struct Poller {
    enumerator: Enumerator,
    manager: ConnectionManager,
    interval: Duration,
}

impl Poller {
    pub fn new(enumerator: Enumerator, manager: ConnectionManager, interval: Duration) -> Poller {
        Poller {
            enumerator,
            manager,
            interval,
        }
    }

    /// Scans once and reports what was found.
    pub fn tick(&self) -> Result<Status, EnumerationError> {
        let mut devices = self.enumerator.scan()?;

        self.manager.annotate(&mut devices);

        Ok(Status::summarize(devices, self.manager.is_connected()))
    }

    /// Calls `callback` with a fresh status every interval until it returns
    /// `ControlFlow::Break`.
    ///
    /// A failed scan is logged and retried on the next tick.
    pub fn run<F>(&self, mut callback: F)
    where
        F: FnMut(&Status) -> ControlFlow<()>,
    {
        loop {
            let started = Instant::now();

            match self.tick() {
                Ok(status) => {
                    trace!("{}", status);

                    if let ControlFlow::Break(()) = callback(&status) {
                        return;
                    }
                }
                Err(err) => warn!("Device scan failed: {}", err),
            }

            if let Some(remaining) = self.interval.checked_sub(started.elapsed()) {
                thread::sleep(remaining);
            }
        }
    }
}
