//! Target device descriptions produced by the enumerator

use std::fmt;

/// The vendor id used by STMicroelectronics for both the DFU bootloader and ST-LINK probes.
pub const ST_VENDOR_ID: u16 = 0x0483;

/// The product id of the STM32 system bootloader in DFU mode.
pub const STM32_DFU_PRODUCT_ID: u16 = 0xdf11;

/// Product ids of the ST-LINK debug probe family and their hardware revision.
pub const STLINK_PRODUCT_IDS: &[(u16, &str)] = &[
    (0x3748, "V2"),
    (0x374b, "V2-1"),
    (0x374a, "V2-1"),
    (0x3742, "V2-1"),
    (0x3752, "V2-1"),
    (0x374e, "V3"),
    (0x374f, "V3"),
    (0x3753, "V3"),
    (0x3754, "V3"),
];

/// Returns the ST-LINK revision name when `vendor_id`/`product_id` identify an ST-LINK probe.
pub fn stlink_revision(vendor_id: u16, product_id: u16) -> Option<&'static str> {
    if vendor_id != ST_VENDOR_ID {
        return None;
    }

    STLINK_PRODUCT_IDS
        .iter()
        .find(|(pid, _)| *pid == product_id)
        .map(|(_, name)| *name)
}

/// Stable identity of a physical device: the bus/port path it is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    /// Identity of a USB device attached at `bus` through the hub `ports` chain.
    pub fn usb(bus: u8, ports: &[u8]) -> DeviceId {
        let path: Vec<String> = ports.iter().map(|p| p.to_string()).collect();

        DeviceId(format!("usb:{}-{}", bus, path.join(".")))
    }

    /// Identity of a serial port.
    pub fn serial<S: AsRef<str>>(port: S) -> DeviceId {
        DeviceId(format!("serial:{}", port.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The port name of a serial device identity.
    pub fn serial_port(&self) -> Option<&str> {
        self.0.strip_prefix("serial:")
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a target is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolMode {
    /// USB Device Firmware Update with the ST DfuSe extensions
    Dfu,
    /// An SWD/JTAG debug probe such as an ST-LINK
    DebugProbe,
    /// The system bootloader on a USART
    Uart,
}

impl fmt::Display for ProtocolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolMode::Dfu => f.write_str("DFU"),
            ProtocolMode::DebugProbe => f.write_str("debug probe"),
            ProtocolMode::Uart => f.write_str("UART"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    /// A flash sequence is running on the session
    Busy,
}

impl Default for ConnectionState {
    fn default() -> ConnectionState {
        ConnectionState::Disconnected
    }
}

/// A device discovered by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDevice {
    pub id: DeviceId,
    pub mode: ProtocolMode,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
    /// Human readable description, such as the product string or probe revision
    pub description: String,
    pub state: ConnectionState,
}

impl TargetDevice {
    pub fn new(id: DeviceId, mode: ProtocolMode) -> TargetDevice {
        TargetDevice {
            id,
            mode,
            vendor_id: 0,
            product_id: 0,
            serial_number: None,
            description: String::new(),
            state: ConnectionState::Disconnected,
        }
    }
}

impl fmt::Display for TargetDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {:04x}:{:04x}",
            self.id, self.mode, self.vendor_id, self.product_id
        )?;

        if let Some(serial) = &self.serial_number {
            write!(f, " sn={}", serial)?;
        }

        if !self.description.is_empty() {
            write!(f, " {}", self.description)?;
        }

        write!(f, " ({:?})", self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_should_format_usb_port_paths() {
        assert_eq!(DeviceId::usb(1, &[2, 3]).as_str(), "usb:1-2.3");
        assert_eq!(DeviceId::usb(3, &[1]).as_str(), "usb:3-1");
        assert_eq!(DeviceId::serial("/dev/ttyUSB0").as_str(), "serial:/dev/ttyUSB0");
        assert_eq!(DeviceId::serial("COM3").serial_port(), Some("COM3"));
        assert_eq!(DeviceId::usb(1, &[2]).serial_port(), None);
    }

    #[test]
    fn it_should_identify_stlink_probes() {
        assert_eq!(stlink_revision(0x0483, 0x3748), Some("V2"));
        assert_eq!(stlink_revision(0x0483, 0x374e), Some("V3"));
        assert_eq!(stlink_revision(0x0483, STM32_DFU_PRODUCT_ID), None);
        assert_eq!(stlink_revision(0x1234, 0x3748), None);
    }
}
