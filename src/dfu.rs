//! USB DFU transport with the ST DfuSe extensions (AN3156)

mod layout;
mod status;

use std::io::Cursor;
use std::ops::Range;
use std::thread;
use std::time::{Duration, Instant};

use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, info, trace, warn};
use rusb::{Context, DeviceHandle, Direction, Recipient, RequestType};

pub use layout::{LayoutError, MemoryLayout, Page};
pub use status::{DfuState, DfuStatus};

use crate::device::DeviceId;
use crate::enumerate::find_usb_device;
use crate::protocol::{
    self, DfuSe, DfuStatusResponse, Erase, ReadUnprotect, Response, SetAddressPointer,
};
use crate::target::{Target, TargetInfo, STM32_FLASH_BASE};
use crate::TargetError;

pub const DFU_INTERFACE_CLASS: u8 = 0xfe;
pub const DFU_INTERFACE_SUBCLASS: u8 = 0x01;
/// Interface protocol of a device running in DFU mode, as opposed to run-time mode
pub const DFU_MODE_PROTOCOL: u8 = 0x02;

const DFU_FUNCTIONAL_DESCRIPTOR: u8 = 0x21;

const DFU_DNLOAD: u8 = 1;
const DFU_UPLOAD: u8 = 2;
const DFU_GETSTATUS: u8 = 3;
const DFU_CLRSTATUS: u8 = 4;
const DFU_ABORT: u8 = 6;

/// DfuSe transfers data with block numbers starting at 2, relative to the address pointer
const FIRST_DATA_BLOCK: u16 = 2;

const DEFAULT_TRANSFER_SIZE: u16 = 2048;
const REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);
const BUSY_TIMEOUT: Duration = Duration::from_secs(60);
const RECONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// The DFU functional descriptor that follows a DFU interface descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionalDescriptor {
    pub attributes: u8,
    pub detach_timeout: u16,
    /// Maximum number of bytes per control transfer
    pub transfer_size: u16,
    /// `bcdDFUVersion`, 0x011a for DfuSe
    pub dfu_version: u16,
}

impl FunctionalDescriptor {
    /// Finds the functional descriptor among the class specific descriptors in `extra`.
    pub fn find(extra: &[u8]) -> Option<FunctionalDescriptor> {
        let mut rest = extra;

        while rest.len() >= 2 {
            let len = rest[0] as usize;

            if len < 2 || len > rest.len() {
                return None;
            }

            if rest[1] == DFU_FUNCTIONAL_DESCRIPTOR && len >= 9 {
                let mut cursor = Cursor::new(&rest[2..len]);

                return Some(FunctionalDescriptor {
                    attributes: cursor.read_u8().ok()?,
                    detach_timeout: cursor.read_u16::<LittleEndian>().ok()?,
                    transfer_size: cursor.read_u16::<LittleEndian>().ok()?,
                    dfu_version: cursor.read_u16::<LittleEndian>().ok()?,
                });
            }

            rest = &rest[len..];
        }

        None
    }

    pub fn version_string(&self) -> String {
        format!("{:x}.{:x}", self.dfu_version >> 8, self.dfu_version & 0xff)
    }
}

/// A DFU alternate setting candidate found in the active configuration.
struct AltSetting {
    interface: u8,
    setting: u8,
    name_index: Option<u8>,
    functional: Option<FunctionalDescriptor>,
}

/// An open session with a device in DfuSe mode.
pub struct DfuTarget {
    id: DeviceId,
    handle: DeviceHandle<Context>,
    interface: u8,
    layout: MemoryLayout,
    functional: Option<FunctionalDescriptor>,
    transfer_size: u16,
}

impl DfuTarget {
    /// Opens the DFU device attached at `id` and selects its internal flash alternate setting.
    pub fn open(context: &Context, id: &DeviceId) -> Result<DfuTarget, TargetError> {
        let device = find_usb_device(context, id)?.ok_or(TargetError::Usb(rusb::Error::NoDevice))?;
        let config = device.active_config_descriptor()?;

        let mut candidates = Vec::new();

        for interface in config.interfaces() {
            for alt in interface.descriptors() {
                if alt.class_code() == DFU_INTERFACE_CLASS
                    && alt.sub_class_code() == DFU_INTERFACE_SUBCLASS
                    && alt.protocol_code() == DFU_MODE_PROTOCOL
                {
                    candidates.push(AltSetting {
                        interface: alt.interface_number(),
                        setting: alt.setting_number(),
                        name_index: alt.description_string_index(),
                        functional: FunctionalDescriptor::find(alt.extra()),
                    });
                }
            }
        }

        let handle = device.open()?;

        if let Err(err) = handle.set_auto_detach_kernel_driver(true) {
            trace!("Automatic kernel driver detach unavailable: {}", err);
        }

        let mut selected: Option<(AltSetting, MemoryLayout)> = None;

        for candidate in candidates {
            let name = match candidate.name_index {
                Some(index) => handle.read_string_descriptor_ascii(index)?,
                None => String::new(),
            };

            let layout = match MemoryLayout::parse(&name) {
                Ok(layout) => layout,
                Err(err) => {
                    debug!("Alternate setting {} has no usable layout: {}", candidate.setting, err);
                    MemoryLayout::default()
                }
            };

            trace!(
                "Interface {} alt {}: {:?}",
                candidate.interface,
                candidate.setting,
                name
            );

            let is_flash = layout.name.contains("Flash");
            let replace = match &selected {
                None => true,
                Some((_, current)) => is_flash && !current.name.contains("Flash"),
            };

            if replace {
                selected = Some((candidate, layout));
            }
        }

        let (alt, layout) = selected.ok_or(TargetError::Usb(rusb::Error::NotFound))?;

        handle.claim_interface(alt.interface)?;
        handle.set_alternate_setting(alt.interface, alt.setting)?;

        let transfer_size = alt
            .functional
            .map(|f| f.transfer_size)
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_TRANSFER_SIZE);

        debug!(
            "Opened {} interface {} alt {} ({:?}), transfer size {}",
            id, alt.interface, alt.setting, layout.name, transfer_size
        );

        Ok(DfuTarget {
            id: id.clone(),
            handle,
            interface: alt.interface,
            layout,
            functional: alt.functional,
            transfer_size,
        })
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    fn request_out(&self, request: u8, value: u16, data: &[u8]) -> Result<usize, TargetError> {
        let request_type = rusb::request_type(Direction::Out, RequestType::Class, Recipient::Interface);

        Ok(self.handle.write_control(
            request_type,
            request,
            value,
            self.interface as u16,
            data,
            REQUEST_TIMEOUT,
        )?)
    }

    fn request_in(&self, request: u8, value: u16, buf: &mut [u8]) -> Result<usize, TargetError> {
        let request_type = rusb::request_type(Direction::In, RequestType::Class, Recipient::Interface);

        Ok(self.handle.read_control(
            request_type,
            request,
            value,
            self.interface as u16,
            buf,
            REQUEST_TIMEOUT,
        )?)
    }

    fn get_status(&self) -> Result<DfuStatusResponse, TargetError> {
        let mut buf = [0u8; 6];
        let len = self.request_in(DFU_GETSTATUS, 0, &mut buf)?;

        if len != buf.len() {
            return Err(TargetError::UnexpectedResponse(buf[..len].to_vec()));
        }

        DfuStatusResponse::from_reader(Cursor::new(&buf))
    }

    fn clear_status(&self) -> Result<(), TargetError> {
        self.request_out(DFU_CLRSTATUS, 0, &[])?;

        Ok(())
    }

    fn abort(&self) -> Result<(), TargetError> {
        self.request_out(DFU_ABORT, 0, &[])?;

        Ok(())
    }

    /// Brings the device back to dfuIDLE, clearing a pending error status.
    fn ensure_idle(&self) -> Result<(), TargetError> {
        let status = self.get_status()?;

        match status.state {
            DfuState::DfuIdle => return Ok(()),
            DfuState::DfuError => {
                trace!("Clearing DFU error status {:?}", status.status);
                self.clear_status()?;
            }
            _ => self.abort()?,
        }

        let status = self.get_status()?;

        if status.state != DfuState::DfuIdle {
            return Err(TargetError::Dfu {
                status: status.status,
                state: status.state,
            });
        }

        Ok(())
    }

    /// Polls the device until it leaves the busy states, returning its final status.
    fn wait_ready(&self) -> Result<DfuStatusResponse, TargetError> {
        let deadline = Instant::now() + BUSY_TIMEOUT;

        loop {
            let status = self.get_status()?;

            if status.status != DfuStatus::NoError {
                if let Err(err) = self.clear_status() {
                    debug!("Could not clear DFU status: {}", err);
                }

                return Err(TargetError::Dfu {
                    status: status.status,
                    state: status.state,
                });
            }

            match status.state {
                DfuState::DfuDnBusy | DfuState::DfuDnloadSync => {
                    if Instant::now() >= deadline {
                        return Err(TargetError::Usb(rusb::Error::Timeout));
                    }

                    thread::sleep(Duration::from_millis(status.poll_timeout as u64));
                }
                _ => return Ok(status),
            }
        }
    }

    /// Downloads `data` as block `block` and waits for the device to process it.
    fn download(&self, block: u16, data: &[u8]) -> Result<(), TargetError> {
        self.request_out(DFU_DNLOAD, block, data)?;

        let status = self.wait_ready()?;

        if status.state != DfuState::DfuDnloadIdle {
            return Err(TargetError::Dfu {
                status: status.status,
                state: status.state,
            });
        }

        Ok(())
    }

    /// Sends a DfuSe command, which is a download of block 0.
    fn command<C: protocol::Command<DfuSe>>(&self, command: &C) -> Result<(), TargetError> {
        let payload = protocol::encode::<DfuSe, _>(command)?;

        self.download(0, &payload)
    }

    fn set_address(&self, address: u32) -> Result<(), TargetError> {
        trace!("Setting address pointer to {:#010x}", address);

        self.command(&SetAddressPointer(address))
    }

    fn check_range(&self, address: u32, len: usize) -> Result<(), TargetError> {
        if self.layout.pages.is_empty() {
            return Ok(());
        }

        self.layout
            .pages_in(address..address.saturating_add(len as u32))
            .map(|_| ())
            .map_err(TargetError::OutOfRange)
    }

    /// Reads one transfer worth of memory at `address`.
    ///
    /// The address pointer is set for every chunk so the block number is always the first data
    /// block, since the device derives the offset from the request length.
    fn upload(&self, address: u32, buf: &mut [u8]) -> Result<(), TargetError> {
        self.set_address(address)?;

        // Uploads are only accepted from dfuIDLE
        self.abort()?;

        match self.request_in(DFU_UPLOAD, FIRST_DATA_BLOCK, buf) {
            Ok(len) if len == buf.len() => Ok(()),
            Ok(len) => Err(TargetError::UnexpectedResponse(buf[..len].to_vec())),
            Err(TargetError::Usb(rusb::Error::Pipe)) => {
                let status = self.get_status()?;

                if let Err(err) = self.clear_status() {
                    debug!("Could not clear DFU status: {}", err);
                }

                Err(TargetError::Dfu {
                    status: status.status,
                    state: status.state,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Waits for the device to reappear at the same port after a reset and reopens it.
    fn reconnect(&mut self, timeout: Duration) -> Result<(), TargetError> {
        let deadline = Instant::now() + timeout;
        let context = self.handle.context().clone();

        // Let the device drop off the bus before looking for it again
        thread::sleep(Duration::from_millis(500));

        loop {
            match DfuTarget::open(&context, &self.id) {
                Ok(target) => {
                    *self = target;
                    info!("Reconnected to {}", self.id);

                    return Ok(());
                }
                Err(err) => {
                    if Instant::now() >= deadline {
                        return Err(TargetError::ReconnectTimeout(timeout));
                    }

                    trace!("Waiting for {} to come back: {}", self.id, err);
                    thread::sleep(Duration::from_millis(500));
                }
            }
        }
    }
}

impl Target for DfuTarget {
    fn info(&mut self) -> Result<TargetInfo, TargetError> {
        let layout_size = self.layout.size();

        Ok(TargetInfo {
            description: self.layout.name.clone(),
            bootloader_version: self
                .functional
                .map(|f| format!("DFU {}", f.version_string())),
            chip_id: None,
            flash_start: self.layout.start(),
            flash_size: if layout_size > 0 {
                Some(layout_size)
            } else {
                None
            },
        })
    }

    fn unprotect(&mut self) -> Result<(), TargetError> {
        let start = self.layout.start().unwrap_or(STM32_FLASH_BASE);
        let mut probe = [0u8; 4];

        self.ensure_idle()?;

        match self.upload(start, &mut probe) {
            Ok(()) => {
                info!("Flash is not read protected");

                return self.ensure_idle();
            }
            Err(TargetError::Dfu {
                status: DfuStatus::ErrVendor,
                ..
            }) => info!("Flash is read protected, disabling read protection"),
            Err(err) => return Err(err),
        }

        self.ensure_idle()?;

        let payload = protocol::encode::<DfuSe, _>(&ReadUnprotect)?;
        self.request_out(DFU_DNLOAD, 0, &payload)?;

        // The device mass erases its flash and resets while this request is pending
        match self.get_status() {
            Ok(status) => debug!("Read unprotect accepted in state {:?}", status.state),
            Err(err) => debug!("Device reset during read unprotect: {}", err),
        }

        self.reconnect(RECONNECT_TIMEOUT)
    }

    fn erase(&mut self, regions: &[Range<u32>]) -> Result<(), TargetError> {
        if self.layout.pages.is_empty() {
            warn!("The device does not describe its flash pages, erasing the whole flash");

            return self.mass_erase();
        }

        let mut pages: Vec<Page> = Vec::new();

        for region in regions {
            let covering = self
                .layout
                .pages_in(region.clone())
                .map_err(TargetError::OutOfRange)?;

            for page in covering {
                if !page.is_erasable() {
                    return Err(TargetError::OutOfRange(page.address));
                }

                if !pages.contains(&page) {
                    pages.push(page);
                }
            }
        }

        self.ensure_idle()?;

        for page in &pages {
            debug!("Erasing page at {:#010x} ({} bytes)", page.address, page.size);

            self.command(&Erase(Some(page.address)))?;
        }

        info!("Erased {} page(s)", pages.len());

        Ok(())
    }

    fn mass_erase(&mut self) -> Result<(), TargetError> {
        self.ensure_idle()?;
        self.command(&Erase(None))?;

        info!("Mass erase complete");

        Ok(())
    }

    fn program(&mut self, address: u32, data: &[u8]) -> Result<(), TargetError> {
        self.check_range(address, data.len())?;
        self.ensure_idle()?;

        let transfer_size = self.transfer_size as usize;

        for (index, chunk) in data.chunks(transfer_size).enumerate() {
            let chunk_address = address + (index * transfer_size) as u32;

            self.set_address(chunk_address)?;
            self.download(FIRST_DATA_BLOCK, chunk)?;

            trace!("Wrote {} bytes at {:#010x}", chunk.len(), chunk_address);
        }

        debug!("Programmed {} bytes at {:#010x}", data.len(), address);

        Ok(())
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), TargetError> {
        self.ensure_idle()?;

        let transfer_size = self.transfer_size as usize;

        for (index, chunk) in buf.chunks_mut(transfer_size).enumerate() {
            let chunk_address = address + (index * transfer_size) as u32;

            self.upload(chunk_address, chunk)?;
        }

        self.ensure_idle()
    }

    fn execute(&mut self, address: u32) -> Result<(), TargetError> {
        self.ensure_idle()?;
        self.set_address(address)?;

        // A zero length download leaves DFU mode and jumps to the address pointer
        self.request_out(DFU_DNLOAD, 0, &[])?;

        match self.get_status() {
            Ok(status) => debug!("Leave request acknowledged in state {:?}", status.state),
            Err(err) => debug!("Device left DFU mode: {}", err),
        }

        info!("Started execution at {:#010x}", address);

        Ok(())
    }

    fn close(&mut self) -> Result<(), TargetError> {
        self.handle.release_interface(self.interface)?;

        Ok(())
    }
}
