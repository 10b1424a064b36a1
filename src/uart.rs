//! The STM32 system bootloader on a USART (AN3155)

use std::ffi::OsStr;
use std::fmt;
use std::io::{self, Read, Write};
use std::ops::{Deref, DerefMut, Range};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, trace};
use serialport::prelude::*;
use serialport::ClearBuffer;

use crate::protocol::{
    Ack, Address, BootloaderCommands, Command, CommandCode, MassErase, ProductId, ReadLength,
    Response, Usart, WriteData, CMD_ERASE, CMD_EXTENDED_ERASE, CMD_GET, CMD_GET_ID, CMD_GO,
    CMD_READOUT_UNPROTECT, CMD_READ_MEMORY, CMD_WRITE_MEMORY, USART_MAX_CHUNK, USART_SYNC,
};
use crate::target::{Target, TargetInfo, STM32_FLASH_BASE};
use crate::TargetError;

pub const DEFAULT_BAUD_RATE: u32 = 115_200;

const SERIAL_TIMEOUT: Duration = Duration::from_millis(2000);
/// Mass erase of the largest parts takes tens of seconds
const ERASE_TIMEOUT: Duration = Duration::from_secs(60);
const RESYNC_TIMEOUT: Duration = Duration::from_secs(10);
const RESYNC_POLL: Duration = Duration::from_millis(200);

/// A byte stream the bootloader protocol runs over.
pub trait Transport: Read + Write + Send {
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TargetError>;

    /// Discards any input received but not read yet.
    fn clear_input(&mut self) -> Result<(), TargetError> {
        Ok(())
    }
}

/// Serial connection with an open serial port.
pub struct SerialPort {
    inner_port: Box<dyn serialport::SerialPort>,
}

impl fmt::Debug for SerialPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialPort")
            .field("name", &self.name())
            .field("settings", &self.settings())
            .finish()
    }
}

impl Deref for SerialPort {
    type Target = Box<dyn serialport::SerialPort>;

    fn deref(&self) -> &Self::Target {
        &self.inner_port
    }
}

impl DerefMut for SerialPort {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner_port
    }
}

impl SerialPort {
    /// Opens the given `port` with the 8E1 framing the system bootloader expects.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use cubeflash::uart::SerialPort;
    ///
    /// let port = SerialPort::open("/dev/ttyUSB0", 115_200)?;
    ///
    /// # Ok::<(), cubeflash::TargetError>(())
    /// ```
    pub fn open<S: AsRef<OsStr>>(port: S, baud_rate: u32) -> Result<SerialPort, TargetError> {
        let settings = SerialPortSettings {
            baud_rate,
            data_bits: DataBits::Eight,
            flow_control: FlowControl::None,
            parity: Parity::Even,
            stop_bits: StopBits::One,
            timeout: SERIAL_TIMEOUT,
        };

        debug!("Opening serial port {:?} at {} baud", port.as_ref(), baud_rate);

        let serial_port = serialport::open_with_settings(port.as_ref(), &settings)?;

        Ok(SerialPort {
            inner_port: serial_port,
        })
    }

    /// Consumes `self` and returns the inner serial port.
    pub fn into_port(self) -> Box<dyn serialport::SerialPort> {
        self.inner_port
    }
}

impl Read for SerialPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner_port.read(buf)
    }
}

impl Write for SerialPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner_port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner_port.flush()
    }
}

impl Transport for SerialPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TargetError> {
        self.inner_port.set_timeout(timeout)?;

        Ok(())
    }

    fn clear_input(&mut self) -> Result<(), TargetError> {
        self.inner_port.clear(ClearBuffer::Input)?;

        Ok(())
    }
}

/// A synchronized session with the system bootloader.
pub struct UartBootloader<T: Transport = SerialPort> {
    port: T,
    name: String,
    commands: BootloaderCommands,
    chip_id: Option<u16>,
}

impl UartBootloader<SerialPort> {
    /// Opens `port` and synchronizes with the bootloader behind it.
    pub fn open(port: &str, baud_rate: u32) -> Result<UartBootloader<SerialPort>, TargetError> {
        let serial_port = SerialPort::open(port, baud_rate)?;

        UartBootloader::connect(serial_port, port)
    }
}

impl<T: Transport> UartBootloader<T> {
    /// Synchronizes with the bootloader on `port` and reads its version and chip id.
    pub fn connect<S: Into<String>>(port: T, name: S) -> Result<UartBootloader<T>, TargetError> {
        let mut bootloader = UartBootloader {
            port,
            name: name.into(),
            commands: BootloaderCommands {
                version: 0,
                commands: Vec::new(),
            },
            chip_id: None,
        };

        bootloader.sync()?;
        bootloader.commands = bootloader.get()?;

        debug!(
            "Bootloader version {}, commands {:02x?}",
            bootloader.commands.version_string(),
            bootloader.commands.commands
        );

        if bootloader.commands.supports(CMD_GET_ID) {
            let chip_id = bootloader.get_id()?;

            debug!("Chip id {:#06x}", chip_id);

            bootloader.chip_id = Some(chip_id);
        }

        Ok(bootloader)
    }

    /// Consumes `self` and returns the underlying transport.
    pub fn into_port(self) -> T {
        self.port
    }

    pub fn commands(&self) -> &BootloaderCommands {
        &self.commands
    }

    /// Sends the synchronization byte that lets the bootloader detect the baud rate.
    fn sync(&mut self) -> Result<(), TargetError> {
        self.port.clear_input()?;
        self.port.write_all(&[USART_SYNC])?;

        // An already synchronized bootloader NACKs the byte as an unknown command
        match Ack::from_reader(&mut self.port)? {
            Ack::Ack => trace!("Synchronized with bootloader"),
            Ack::Nack => trace!("Bootloader was already synchronized"),
        }

        Ok(())
    }

    fn read_ack(&mut self, command: u8) -> Result<(), TargetError> {
        match Ack::from_reader(&mut self.port)? {
            Ack::Ack => Ok(()),
            Ack::Nack => Err(TargetError::Nack(command)),
        }
    }

    /// Writes `frame` as part of `command` and waits for it to be acknowledged.
    fn send<C: Command<Usart>>(&mut self, command: u8, frame: &C) -> Result<(), TargetError> {
        frame.to_writer(&mut self.port)?;

        self.read_ack(command)
    }

    fn start_command(&mut self, command: u8) -> Result<(), TargetError> {
        trace!("Sending command {:#04x}", command);

        self.send(command, &CommandCode(command))
    }

    fn with_timeout<R, F>(&mut self, timeout: Duration, f: F) -> Result<R, TargetError>
    where
        F: FnOnce(&mut Self) -> Result<R, TargetError>,
    {
        self.port.set_timeout(timeout)?;

        let result = f(self);

        self.port.set_timeout(SERIAL_TIMEOUT)?;

        result
    }

    pub fn get(&mut self) -> Result<BootloaderCommands, TargetError> {
        self.start_command(CMD_GET)?;

        let commands = BootloaderCommands::from_reader(&mut self.port)?;

        self.read_ack(CMD_GET)?;

        Ok(commands)
    }

    pub fn get_id(&mut self) -> Result<u16, TargetError> {
        self.start_command(CMD_GET_ID)?;

        let chip_id = ProductId::from_reader(&mut self.port)?;

        self.read_ack(CMD_GET_ID)?;

        Ok(chip_id)
    }

    pub fn read_memory(&mut self, address: u32, buf: &mut [u8]) -> Result<(), TargetError> {
        for (index, chunk) in buf.chunks_mut(USART_MAX_CHUNK).enumerate() {
            let chunk_address = address + (index * USART_MAX_CHUNK) as u32;

            self.start_command(CMD_READ_MEMORY)?;
            self.send(CMD_READ_MEMORY, &Address(chunk_address))?;
            self.send(CMD_READ_MEMORY, &ReadLength(chunk.len()))?;
            self.port.read_exact(chunk)?;

            trace!("Read {} bytes at {:#010x}", chunk.len(), chunk_address);
        }

        Ok(())
    }

    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), TargetError> {
        for (index, chunk) in data.chunks(USART_MAX_CHUNK).enumerate() {
            let chunk_address = address + (index * USART_MAX_CHUNK) as u32;

            self.start_command(CMD_WRITE_MEMORY)?;
            self.send(CMD_WRITE_MEMORY, &Address(chunk_address))?;
            self.send(CMD_WRITE_MEMORY, &WriteData(chunk))?;

            trace!("Wrote {} bytes at {:#010x}", chunk.len(), chunk_address);
        }

        Ok(())
    }

    pub fn go(&mut self, address: u32) -> Result<(), TargetError> {
        self.start_command(CMD_GO)?;
        self.send(CMD_GO, &Address(address))
    }

    /// Erases the whole flash with whichever erase command the bootloader supports.
    pub fn global_erase(&mut self) -> Result<(), TargetError> {
        let command = if self.commands.supports(CMD_EXTENDED_ERASE) {
            CMD_EXTENDED_ERASE
        } else {
            CMD_ERASE
        };

        self.start_command(command)?;
        self.with_timeout(ERASE_TIMEOUT, |this| {
            this.send(
                command,
                &MassErase {
                    extended: command == CMD_EXTENDED_ERASE,
                },
            )
        })
    }

    /// Synchronizes again after the device reset itself.
    fn resync(&mut self, timeout: Duration) -> Result<(), TargetError> {
        let deadline = Instant::now() + timeout;

        self.port.set_timeout(RESYNC_POLL)?;

        loop {
            thread::sleep(RESYNC_POLL);

            match self.sync() {
                Ok(()) => break,
                Err(err) => {
                    if Instant::now() >= deadline {
                        self.port.set_timeout(SERIAL_TIMEOUT)?;

                        return Err(TargetError::ReconnectTimeout(timeout));
                    }

                    trace!("Waiting for the bootloader to come back: {}", err);
                }
            }
        }

        self.port.set_timeout(SERIAL_TIMEOUT)?;

        info!("Bootloader on {} is back", self.name);

        Ok(())
    }
}

impl<T: Transport> Target for UartBootloader<T> {
    fn info(&mut self) -> Result<TargetInfo, TargetError> {
        Ok(TargetInfo {
            description: format!("STM32 system bootloader on {}", self.name),
            bootloader_version: Some(self.commands.version_string()),
            chip_id: self.chip_id,
            flash_start: Some(STM32_FLASH_BASE),
            flash_size: None,
        })
    }

    fn unprotect(&mut self) -> Result<(), TargetError> {
        let mut probe = [0u8; 4];

        match self.read_memory(STM32_FLASH_BASE, &mut probe) {
            Ok(()) => {
                info!("Flash is not read protected");

                return Ok(());
            }
            Err(TargetError::Nack(CMD_READ_MEMORY)) => {
                info!("Flash is read protected, disabling read protection")
            }
            Err(err) => return Err(err),
        }

        self.start_command(CMD_READOUT_UNPROTECT)?;

        // The second ACK is sent once the flash has been mass erased, then the device resets
        self.with_timeout(ERASE_TIMEOUT, |this| this.read_ack(CMD_READOUT_UNPROTECT))?;
        self.resync(RESYNC_TIMEOUT)
    }

    fn erase(&mut self, regions: &[Range<u32>]) -> Result<(), TargetError> {
        info!(
            "Erasing the whole flash for {} region(s), the bootloader does not describe its pages",
            regions.len()
        );

        self.global_erase()
    }

    fn mass_erase(&mut self) -> Result<(), TargetError> {
        self.global_erase()
    }

    fn program(&mut self, address: u32, data: &[u8]) -> Result<(), TargetError> {
        self.write_memory(address, data)?;

        debug!("Programmed {} bytes at {:#010x}", data.len(), address);

        Ok(())
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), TargetError> {
        self.read_memory(address, buf)
    }

    fn execute(&mut self, address: u32) -> Result<(), TargetError> {
        self.go(address)?;

        info!("Started execution at {:#010x}", address);

        Ok(())
    }
}
