//! Test doubles for the backend, connector and target seams

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::connection::Connector;
use crate::device::{DeviceId, ProtocolMode, TargetDevice, ST_VENDOR_ID, STM32_DFU_PRODUCT_ID};
use crate::enumerate::Backend;
use crate::target::{Target, TargetInfo, STM32_FLASH_BASE};
use crate::{ConnectionError, EnumerationError, TargetError};

pub fn dfu_device(port: u8) -> TargetDevice {
    let mut device = TargetDevice::new(DeviceId::usb(1, &[port]), ProtocolMode::Dfu);

    device.vendor_id = ST_VENDOR_ID;
    device.product_id = STM32_DFU_PRODUCT_ID;
    device
}

pub fn probe_device(port: u8) -> TargetDevice {
    let mut device = TargetDevice::new(DeviceId::usb(2, &[port]), ProtocolMode::DebugProbe);

    device.vendor_id = ST_VENDOR_ID;
    device.product_id = 0x374b;
    device
}

/// A backend whose device list can be changed between scans.
#[derive(Clone, Default)]
pub struct MockBackend {
    devices: Arc<Mutex<Vec<TargetDevice>>>,
}

impl MockBackend {
    pub fn new(devices: Vec<TargetDevice>) -> MockBackend {
        MockBackend {
            devices: Arc::new(Mutex::new(devices)),
        }
    }

    pub fn set(&self, devices: Vec<TargetDevice>) {
        *self.devices.lock().unwrap() = devices;
    }
}

impl Backend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn scan(&self) -> Result<Vec<TargetDevice>, EnumerationError> {
        Ok(self.devices.lock().unwrap().clone())
    }
}

pub struct UnavailableBackend;

impl Backend for UnavailableBackend {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    fn scan(&self) -> Result<Vec<TargetDevice>, EnumerationError> {
        Err(EnumerationError::Unavailable("unavailable"))
    }
}

pub struct FailingBackend;

impl Backend for FailingBackend {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn scan(&self) -> Result<Vec<TargetDevice>, EnumerationError> {
        Err(EnumerationError::Usb(rusb::Error::Io))
    }
}

/// An in-memory target that records every call made to it.
///
/// Clones share the call log and memory, so a test can keep one while a session owns another.
#[derive(Clone, Default)]
pub struct MockTarget {
    calls: Arc<Mutex<Vec<&'static str>>>,
    memory: Arc<Mutex<BTreeMap<u32, u8>>>,
    executed_at: Arc<Mutex<Option<u32>>>,
    fail_on: Option<&'static str>,
    corrupt_reads: bool,
}

impl MockTarget {
    pub fn new() -> MockTarget {
        MockTarget::default()
    }

    /// A target that NACKs the named operation.
    pub fn failing_on(operation: &'static str) -> MockTarget {
        MockTarget {
            fail_on: Some(operation),
            ..MockTarget::default()
        }
    }

    /// A target whose reads come back with the first byte flipped.
    pub fn corrupting_reads() -> MockTarget {
        MockTarget {
            corrupt_reads: true,
            ..MockTarget::default()
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn byte_at(&self, address: u32) -> Option<u8> {
        self.memory.lock().unwrap().get(&address).copied()
    }

    /// The address of the last execute call.
    pub fn executed_at(&self) -> Option<u32> {
        *self.executed_at.lock().unwrap()
    }

    fn record(&self, operation: &'static str) -> Result<(), TargetError> {
        self.calls.lock().unwrap().push(operation);

        if self.fail_on == Some(operation) {
            return Err(TargetError::Nack(0x44));
        }

        Ok(())
    }
}

impl Target for MockTarget {
    fn info(&mut self) -> Result<TargetInfo, TargetError> {
        self.record("info")?;

        Ok(TargetInfo {
            description: "mock".to_owned(),
            flash_start: Some(STM32_FLASH_BASE),
            flash_size: Some(64 * 1024),
            ..TargetInfo::default()
        })
    }

    fn unprotect(&mut self) -> Result<(), TargetError> {
        self.record("unprotect")
    }

    fn erase(&mut self, regions: &[Range<u32>]) -> Result<(), TargetError> {
        self.record("erase")?;

        let mut memory = self.memory.lock().unwrap();

        for region in regions {
            memory.retain(|address, _| !region.contains(address));
        }

        Ok(())
    }

    fn mass_erase(&mut self) -> Result<(), TargetError> {
        self.record("mass_erase")?;
        self.memory.lock().unwrap().clear();

        Ok(())
    }

    fn program(&mut self, address: u32, data: &[u8]) -> Result<(), TargetError> {
        self.record("program")?;

        let mut memory = self.memory.lock().unwrap();

        for (offset, byte) in data.iter().enumerate() {
            memory.insert(address + offset as u32, *byte);
        }

        Ok(())
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), TargetError> {
        self.record("read")?;

        let memory = self.memory.lock().unwrap();

        for (offset, byte) in buf.iter_mut().enumerate() {
            *byte = memory.get(&(address + offset as u32)).copied().unwrap_or(0xff);
        }

        if self.corrupt_reads {
            if let Some(first) = buf.first_mut() {
                *first = !*first;
            }
        }

        Ok(())
    }

    fn execute(&mut self, address: u32) -> Result<(), TargetError> {
        self.record("execute")?;
        *self.executed_at.lock().unwrap() = Some(address);

        Ok(())
    }

    fn close(&mut self) -> Result<(), TargetError> {
        self.record("close")
    }
}

/// Hands out clones of one mock target, optionally after a delay.
pub struct MockConnector {
    target: MockTarget,
    delay: Duration,
    opened: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn new(target: MockTarget) -> MockConnector {
        MockConnector {
            target,
            delay: Duration::from_millis(0),
            opened: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> MockConnector {
        self.delay = delay;
        self
    }

    /// The number of transports opened so far.
    pub fn opened(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.opened)
    }
}

impl Connector for MockConnector {
    fn open(&self, device: &TargetDevice) -> Result<Box<dyn Target>, ConnectionError> {
        thread::sleep(self.delay);

        if device.mode == ProtocolMode::DebugProbe {
            return Err(ConnectionError::Unsupported(device.mode));
        }

        self.opened.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(self.target.clone()))
    }
}
