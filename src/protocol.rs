//! Command and response codecs for the two bootloader protocols

use std::io::{Read, Write};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use num_enum::TryFromPrimitive;

use crate::dfu::{DfuState, DfuStatus};
use crate::TargetError;

/// A trait marker to mark a type as a programming protocol.
pub trait Protocol {}

/// The STM32 system bootloader on a USART (AN3155).
pub struct Usart;

impl Protocol for Usart {}

/// The DFU class protocol with the ST DfuSe command set (AN3156).
pub struct DfuSe;

impl Protocol for DfuSe {}

/// An interface for serializing commands to a writer in a binary protocol that the target
/// supports.
pub trait Command<P: Protocol> {
    fn to_writer<W: Write>(&self, writer: W) -> Result<(), TargetError>;
}

/// An interface for deserializing responses from a reader.
pub trait Response<P: Protocol>
where
    Self: Sized,
{
    /// The type to return on successful read from a reader.
    type T;

    fn from_reader<R>(reader: R) -> Result<Self::T, TargetError>
    where
        R: Read + ReadBytesExt;
}

/// Serializes `command` into a new buffer.
pub fn encode<P: Protocol, C: Command<P>>(command: &C) -> Result<Vec<u8>, TargetError> {
    let mut buf = Vec::new();

    command.to_writer(&mut buf)?;

    Ok(buf)
}

pub const USART_SYNC: u8 = 0x7f;
pub const USART_ACK: u8 = 0x79;
pub const USART_NACK: u8 = 0x1f;

/// The largest payload of a single read or write memory command.
pub const USART_MAX_CHUNK: usize = 256;

pub const CMD_GET: u8 = 0x00;
pub const CMD_GET_ID: u8 = 0x02;
pub const CMD_READ_MEMORY: u8 = 0x11;
pub const CMD_GO: u8 = 0x21;
pub const CMD_WRITE_MEMORY: u8 = 0x31;
pub const CMD_ERASE: u8 = 0x43;
pub const CMD_EXTENDED_ERASE: u8 = 0x44;
pub const CMD_READOUT_UNPROTECT: u8 = 0x92;

fn xor(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// A command id followed by its complement.
pub struct CommandCode(pub u8);

impl Command<Usart> for CommandCode {
    fn to_writer<W: Write>(&self, mut writer: W) -> Result<(), TargetError> {
        writer.write_all(&[self.0, !self.0])?;

        Ok(())
    }
}

/// A big endian address followed by the XOR of its bytes.
pub struct Address(pub u32);

impl Command<Usart> for Address {
    fn to_writer<W: Write>(&self, mut writer: W) -> Result<(), TargetError> {
        let bytes = self.0.to_be_bytes();

        writer.write_all(&bytes)?;
        writer.write_u8(xor(&bytes))?;

        Ok(())
    }
}

/// The number of bytes to read, minus one, followed by its complement.
pub struct ReadLength(pub usize);

impl Command<Usart> for ReadLength {
    fn to_writer<W: Write>(&self, mut writer: W) -> Result<(), TargetError> {
        let n = (self.0 - 1) as u8;

        writer.write_all(&[n, !n])?;

        Ok(())
    }
}

/// A write memory payload: length minus one, the data padded to a multiple of four bytes with
/// `0xff`, then the XOR of everything before it.
pub struct WriteData<'a>(pub &'a [u8]);

impl<'a> Command<Usart> for WriteData<'a> {
    fn to_writer<W: Write>(&self, mut writer: W) -> Result<(), TargetError> {
        let mut frame = Vec::with_capacity(self.0.len() + 5);
        let padded_len = (self.0.len() + 3) & !3;

        frame.push((padded_len - 1) as u8);
        frame.extend_from_slice(self.0);
        frame.resize(padded_len + 1, 0xff);

        let checksum = xor(&frame);

        writer.write_all(&frame)?;
        writer.write_u8(checksum)?;

        Ok(())
    }
}

/// Global erase for the standard (`0x43`) or the extended (`0x44`) erase command.
pub struct MassErase {
    pub extended: bool,
}

impl Command<Usart> for MassErase {
    fn to_writer<W: Write>(&self, mut writer: W) -> Result<(), TargetError> {
        if self.extended {
            writer.write_all(&[0xff, 0xff, 0x00])?;
        } else {
            writer.write_all(&[0xff, 0x00])?;
        }

        Ok(())
    }
}

/// A single acknowledgement byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Ack,
    Nack,
}

impl Response<Usart> for Ack {
    type T = Ack;

    fn from_reader<R: Read + ReadBytesExt>(mut reader: R) -> Result<Ack, TargetError> {
        match reader.read_u8()? {
            USART_ACK => Ok(Ack::Ack),
            USART_NACK => Ok(Ack::Nack),
            other => Err(TargetError::UnexpectedResponse(vec![other])),
        }
    }
}

/// Response body of the Get command: the bootloader version and the supported command ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootloaderCommands {
    pub version: u8,
    pub commands: Vec<u8>,
}

impl BootloaderCommands {
    pub fn supports(&self, command: u8) -> bool {
        self.commands.contains(&command)
    }

    /// The version formatted as `major.minor`.
    pub fn version_string(&self) -> String {
        format!("{}.{}", self.version >> 4, self.version & 0x0f)
    }
}

impl Response<Usart> for BootloaderCommands {
    type T = Self;

    fn from_reader<R: Read + ReadBytesExt>(mut reader: R) -> Result<Self, TargetError> {
        let n = reader.read_u8()? as usize;
        let version = reader.read_u8()?;
        let mut commands = vec![0u8; n];

        reader.read_exact(&mut commands)?;

        Ok(BootloaderCommands { version, commands })
    }
}

/// Response body of the Get ID command.
pub struct ProductId;

impl Response<Usart> for ProductId {
    type T = u16;

    fn from_reader<R: Read + ReadBytesExt>(mut reader: R) -> Result<u16, TargetError> {
        let n = reader.read_u8()?;

        if n != 1 {
            return Err(TargetError::UnexpectedResponse(vec![n]));
        }

        Ok(reader.read_u16::<BigEndian>()?)
    }
}

pub const DFUSE_SET_ADDRESS: u8 = 0x21;
pub const DFUSE_ERASE: u8 = 0x41;
pub const DFUSE_READ_UNPROTECT: u8 = 0x92;

/// Sets the address pointer used by subsequent downloads and uploads.
pub struct SetAddressPointer(pub u32);

impl Command<DfuSe> for SetAddressPointer {
    fn to_writer<W: Write>(&self, mut writer: W) -> Result<(), TargetError> {
        writer.write_u8(DFUSE_SET_ADDRESS)?;
        writer.write_u32::<LittleEndian>(self.0)?;

        Ok(())
    }
}

/// Erases the page containing the address, or the whole flash when no address is given.
pub struct Erase(pub Option<u32>);

impl Command<DfuSe> for Erase {
    fn to_writer<W: Write>(&self, mut writer: W) -> Result<(), TargetError> {
        writer.write_u8(DFUSE_ERASE)?;

        if let Some(address) = self.0 {
            writer.write_u32::<LittleEndian>(address)?;
        }

        Ok(())
    }
}

/// Disables read protection; the device mass erases its flash and resets.
pub struct ReadUnprotect;

impl Command<DfuSe> for ReadUnprotect {
    fn to_writer<W: Write>(&self, mut writer: W) -> Result<(), TargetError> {
        writer.write_u8(DFUSE_READ_UNPROTECT)?;

        Ok(())
    }
}

/// The six byte payload of a DFU_GETSTATUS request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuStatusResponse {
    pub status: DfuStatus,
    /// Minimum time in milliseconds before the next GETSTATUS request
    pub poll_timeout: u32,
    pub state: DfuState,
    pub string_index: u8,
}

impl Response<DfuSe> for DfuStatusResponse {
    type T = Self;

    fn from_reader<R: Read + ReadBytesExt>(mut reader: R) -> Result<Self, TargetError> {
        let status = DfuStatus::from(reader.read_u8()?);
        let poll_timeout = reader.read_u24::<LittleEndian>()?;
        let state_byte = reader.read_u8()?;
        let state = DfuState::try_from_primitive(state_byte)
            .map_err(|_| TargetError::UnexpectedResponse(vec![state_byte]))?;
        let string_index = reader.read_u8()?;

        Ok(DfuStatusResponse {
            status,
            poll_timeout,
            state,
            string_index,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_hex::*;
    use hex_literal::hex;

    use super::*;

    /// Writes the given USART `command` to a Vec<u8> and returns it
    fn usart_command_to_vec<C: Command<Usart>>(command: C) -> Vec<u8> {
        encode::<Usart, _>(&command).unwrap()
    }

    #[test]
    fn it_should_complement_command_codes() {
        assert_eq_hex!(usart_command_to_vec(CommandCode(CMD_GET)), vec![0x00, 0xff]);
        assert_eq_hex!(
            usart_command_to_vec(CommandCode(CMD_WRITE_MEMORY)),
            vec![0x31, 0xce]
        );
    }

    #[test]
    fn it_should_checksum_addresses() {
        assert_eq_hex!(
            usart_command_to_vec(Address(0x0800_0000)),
            hex!("08 00 00 00 08").to_vec()
        );
        assert_eq_hex!(
            usart_command_to_vec(Address(0x2000_1234)),
            hex!("20 00 12 34 06").to_vec()
        );
    }

    #[test]
    fn it_should_pad_write_payloads() {
        let buf = usart_command_to_vec(WriteData(&[0x01, 0x02, 0x03, 0x04, 0x05]));

        assert_eq_hex!(buf, hex!("07 01 02 03 04 05 ff ff ff f9").to_vec());
    }

    #[test]
    fn it_should_serialize_read_lengths() {
        assert_eq_hex!(usart_command_to_vec(ReadLength(256)), vec![0xff, 0x00]);
        assert_eq_hex!(usart_command_to_vec(ReadLength(4)), vec![0x03, 0xfc]);
    }

    #[test]
    fn it_should_serialize_dfuse_commands() {
        assert_eq_hex!(
            encode::<DfuSe, _>(&SetAddressPointer(0x0800_4000)).unwrap(),
            hex!("21 00 40 00 08").to_vec()
        );
        assert_eq_hex!(
            encode::<DfuSe, _>(&Erase(Some(0x0800_0000))).unwrap(),
            hex!("41 00 00 00 08").to_vec()
        );
        assert_eq_hex!(encode::<DfuSe, _>(&Erase(None)).unwrap(), vec![0x41]);
        assert_eq_hex!(encode::<DfuSe, _>(&ReadUnprotect).unwrap(), vec![0x92]);
    }

    #[test]
    fn it_should_deserialize_bootloader_commands() {
        let input = hex!("0b 31 00 01 02 11 21 31 44 63 73 82 92");
        let commands = BootloaderCommands::from_reader(Cursor::new(&input)).unwrap();

        assert_eq!(commands.version_string(), "3.1");
        assert!(commands.supports(CMD_EXTENDED_ERASE));
        assert!(!commands.supports(CMD_ERASE));
    }

    #[test]
    fn it_should_deserialize_product_ids() {
        let input = hex!("01 04 13");

        assert_eq_hex!(ProductId::from_reader(Cursor::new(&input)).unwrap(), 0x0413);
    }

    #[test]
    fn it_should_deserialize_dfu_status() {
        let input = hex!("00 32 00 00 04 00");
        let status = DfuStatusResponse::from_reader(Cursor::new(&input)).unwrap();

        assert_eq!(status.status, DfuStatus::NoError);
        assert_eq!(status.poll_timeout, 50);
        assert_eq!(status.state, DfuState::DfuDnBusy);

        let input = hex!("0b 00 00 00 0a 00");
        let status = DfuStatusResponse::from_reader(Cursor::new(&input)).unwrap();

        assert_eq!(status.status, DfuStatus::ErrVendor);
        assert_eq!(status.state, DfuState::DfuError);
    }

    #[test]
    fn it_should_reject_unknown_dfu_states() {
        let input = hex!("00 00 00 00 2a 00");

        assert!(matches!(
            DfuStatusResponse::from_reader(Cursor::new(&input)),
            Err(TargetError::UnexpectedResponse(_))
        ));
    }
}
