//! Discovery of attached targets
//!
//! A scan asks every configured backend for the devices it can see and merges the results,
//! sorted by identity. Scanning never opens a session or touches the connection registry.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use log::{debug, trace};
use rusb::{Context, Device, UsbContext};
use serialport::SerialPortType;

use crate::device::{stlink_revision, DeviceId, ProtocolMode, TargetDevice};
use crate::device::{ST_VENDOR_ID, STM32_DFU_PRODUCT_ID};
use crate::dfu::{DFU_INTERFACE_CLASS, DFU_INTERFACE_SUBCLASS, DFU_MODE_PROTOCOL};
use crate::EnumerationError;

/// A source of target devices.
pub trait Backend: Send {
    /// Short name used in log messages.
    fn name(&self) -> &'static str;

    /// Lists the devices currently visible to this backend.
    fn scan(&self) -> Result<Vec<TargetDevice>, EnumerationError>;
}

pub struct Enumerator {
    backends: Vec<Box<dyn Backend>>,
}

impl Enumerator {
    /// Creates an enumerator for USB devices and the given serial ports.
    pub fn new(serial_ports: Vec<String>) -> Enumerator {
        Enumerator::empty()
            .with_backend(UsbBackend::new())
            .with_backend(SerialBackend::new(serial_ports))
    }

    /// Creates an enumerator without any backend.
    pub fn empty() -> Enumerator {
        Enumerator {
            backends: Vec::new(),
        }
    }

    pub fn with_backend<B: Backend + 'static>(mut self, backend: B) -> Enumerator {
        self.backends.push(Box::new(backend));
        self
    }

    /// Lists the attached targets of every backend.
    ///
    /// Backends that are unavailable on this host are skipped. Any other backend failure aborts
    /// the scan.
    pub fn scan(&self) -> Result<Vec<TargetDevice>, EnumerationError> {
        let mut devices = Vec::new();

        for backend in &self.backends {
            match backend.scan() {
                Ok(found) => {
                    trace!("The {} backend found {} device(s)", backend.name(), found.len());

                    devices.extend(found);
                }
                Err(EnumerationError::Unavailable(name)) => {
                    debug!("Skipping the {} backend, it is unavailable on this host", name)
                }
                Err(err) => return Err(err),
            }
        }

        devices.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(devices)
    }
}

/// Classifies a USB device by its ids and the `(class, subclass, protocol)` triples of its
/// interfaces.
pub fn classify(vendor_id: u16, product_id: u16, interfaces: &[(u8, u8, u8)]) -> Option<ProtocolMode> {
    if stlink_revision(vendor_id, product_id).is_some() {
        return Some(ProtocolMode::DebugProbe);
    }

    let is_dfu = (vendor_id == ST_VENDOR_ID && product_id == STM32_DFU_PRODUCT_ID)
        || interfaces.contains(&(DFU_INTERFACE_CLASS, DFU_INTERFACE_SUBCLASS, DFU_MODE_PROTOCOL));

    if is_dfu {
        Some(ProtocolMode::Dfu)
    } else {
        None
    }
}

/// The identity of a USB device: its bus number and hub port chain.
pub(crate) fn usb_device_id<T: UsbContext>(device: &Device<T>) -> DeviceId {
    match device.port_numbers() {
        Ok(ports) if !ports.is_empty() => DeviceId::usb(device.bus_number(), &ports),
        _ => DeviceId::usb(device.bus_number(), &[device.address()]),
    }
}

/// Opens a libusb context, or returns `None` when libusb cannot be initialized on this host.
pub fn usb_context() -> Option<Context> {
    match Context::new() {
        Ok(context) => Some(context),
        Err(err) => {
            debug!("libusb is unavailable: {}", err);

            None
        }
    }
}

/// Finds the USB device currently attached at `id`.
pub(crate) fn find_usb_device<T: UsbContext>(
    context: &T,
    id: &DeviceId,
) -> Result<Option<Device<T>>, rusb::Error> {
    Ok(context
        .devices()?
        .iter()
        .find(|device| usb_device_id(device) == *id))
}

fn interface_triples<T: UsbContext>(device: &Device<T>) -> Vec<(u8, u8, u8)> {
    let config = match device.active_config_descriptor() {
        Ok(config) => config,
        Err(err) => {
            trace!("No active configuration for {}: {}", usb_device_id(device), err);

            return Vec::new();
        }
    };

    config
        .interfaces()
        .flat_map(|interface| {
            interface
                .descriptors()
                .map(|alt| (alt.class_code(), alt.sub_class_code(), alt.protocol_code()))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// String descriptors of a USB device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct UsbStrings {
    serial_number: Option<String>,
    product: Option<String>,
}

/// A device at a port, with the ids it had when its strings were read.
type StringKey = (DeviceId, u16, u16);

/// String descriptors of the attached devices, kept until the device goes away.
#[derive(Debug, Default)]
struct StringCache {
    entries: HashMap<StringKey, UsbStrings>,
}

impl StringCache {
    /// Returns the strings of `key`, calling `read` only when they are not cached yet.
    fn get_or_read<F>(&mut self, key: &StringKey, read: F) -> Option<&UsbStrings>
    where
        F: FnOnce() -> Option<UsbStrings>,
    {
        if !self.entries.contains_key(key) {
            if let Some(strings) = read() {
                self.entries.insert(key.clone(), strings);
            }
        }

        self.entries.get(key)
    }

    /// Forgets every device that is not in `attached`.
    fn retain(&mut self, attached: &[StringKey]) {
        self.entries.retain(|key, _| attached.contains(key));
    }
}

/// Enumerates DFU devices and debug probes through libusb.
///
/// The string descriptors of a device are read once, when it first shows up, so polling does
/// not open devices that may be in use by a session.
pub struct UsbBackend {
    context: Option<Context>,
    strings: Mutex<StringCache>,
}

impl UsbBackend {
    /// Creates a backend with its own libusb context.
    pub fn new() -> UsbBackend {
        UsbBackend::with_context(usb_context())
    }

    /// Creates a backend using `context`, or an unavailable backend when there is none.
    pub fn with_context(context: Option<Context>) -> UsbBackend {
        UsbBackend {
            context,
            strings: Mutex::new(StringCache::default()),
        }
    }
}

impl Default for UsbBackend {
    fn default() -> UsbBackend {
        UsbBackend::new()
    }
}

impl Backend for UsbBackend {
    fn name(&self) -> &'static str {
        "usb"
    }

    fn scan(&self) -> Result<Vec<TargetDevice>, EnumerationError> {
        let context = self
            .context
            .as_ref()
            .ok_or(EnumerationError::Unavailable("usb"))?;

        let list = match context.devices() {
            Ok(list) => list,
            Err(rusb::Error::NotSupported) => return Err(EnumerationError::Unavailable("usb")),
            Err(err) => return Err(err.into()),
        };

        let mut strings = self.strings.lock().unwrap_or_else(PoisonError::into_inner);
        let mut attached = Vec::new();
        let mut found = Vec::new();

        for device in list.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(err) => {
                    trace!("Skipping device without a descriptor: {}", err);
                    continue;
                }
            };

            let vendor_id = descriptor.vendor_id();
            let product_id = descriptor.product_id();

            let mode = match classify(vendor_id, product_id, &interface_triples(&device)) {
                Some(mode) => mode,
                None => continue,
            };

            let mut target = TargetDevice::new(usb_device_id(&device), mode);

            target.vendor_id = vendor_id;
            target.product_id = product_id;
            target.description = match stlink_revision(vendor_id, product_id) {
                Some(revision) => format!("ST-LINK/{}", revision),
                None => format!("DFU device {:04x}:{:04x}", vendor_id, product_id),
            };

            let key = (target.id.clone(), vendor_id, product_id);

            // Reading string descriptors needs an open handle, which may be refused
            let cached = strings.get_or_read(&key, || match device.open() {
                Ok(handle) => Some(UsbStrings {
                    serial_number: handle.read_serial_number_string_ascii(&descriptor).ok(),
                    product: handle.read_product_string_ascii(&descriptor).ok(),
                }),
                Err(err) => {
                    trace!("Could not open {} to read its strings: {}", key.0, err);

                    None
                }
            });

            if let Some(cached) = cached {
                target.serial_number = cached.serial_number.clone();

                if let Some(product) = &cached.product {
                    target.description = product.clone();
                }
            }

            trace!("Found {}", target);

            attached.push(key);
            found.push(target);
        }

        strings.retain(&attached);

        Ok(found)
    }
}

/// Reports the configured serial ports that are present.
///
/// Serial ports cannot be probed for a bootloader without disturbing whatever is attached, so
/// only ports named in the configuration are considered.
pub struct SerialBackend {
    ports: Vec<String>,
}

impl SerialBackend {
    pub fn new(ports: Vec<String>) -> SerialBackend {
        SerialBackend { ports }
    }
}

impl Backend for SerialBackend {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn scan(&self) -> Result<Vec<TargetDevice>, EnumerationError> {
        if self.ports.is_empty() {
            return Ok(Vec::new());
        }

        // Listing is not supported everywhere (e.g. without libudev), configured paths are still
        // checked below
        let available = match serialport::available_ports() {
            Ok(available) => available,
            Err(err) => {
                debug!("Could not list serial ports: {}", err);

                Vec::new()
            }
        };
        let mut found = Vec::new();

        for port in &self.ports {
            let mut target = TargetDevice::new(DeviceId::serial(port), ProtocolMode::Uart);
            target.description = format!("Serial port {}", port);

            match available.iter().find(|info| info.port_name == *port) {
                Some(info) => {
                    if let SerialPortType::UsbPort(usb) = &info.port_type {
                        target.vendor_id = usb.vid;
                        target.product_id = usb.pid;
                        target.serial_number = usb.serial_number.clone();

                        if let Some(product) = &usb.product {
                            target.description = product.clone();
                        }
                    }
                }
                // Some ports, such as pseudo terminals, are not listed but can still be opened
                None if Path::new(port).exists() => {}
                None => {
                    trace!("Serial port {} is not present", port);
                    continue;
                }
            }

            found.push(target);
        }

        Ok(found)
    }
}
