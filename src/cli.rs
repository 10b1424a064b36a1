use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;

use structopt::StructOpt;

use cubeflash::sequencer::SequenceOptions;

/// Parses an address given either in hex with a `0x` prefix or in decimal.
pub fn parse_address(src: &str) -> Result<u32, ParseIntError> {
    match src.strip_prefix("0x").or_else(|| src.strip_prefix("0X")) {
        Some(digits) => u32::from_str_radix(&digits.replace('_', ""), 16),
        None => src.parse(),
    }
}

#[derive(StructOpt, Debug)]
pub enum Command {
    /// List the attached devices
    List,
    /// Poll for devices and report when they come and go
    Watch {
        /// Flash this image to every device that appears
        #[structopt(long = "flash", parse(from_os_str))]
        filename: Option<PathBuf>,
        #[structopt(flatten)]
        download: DownloadOpts,
    },
    /// Download an image to a device, then verify and start it
    Flash {
        /// The image to download (S-record, Intel HEX or raw binary)
        #[structopt(parse(from_os_str))]
        filename: PathBuf,
        #[structopt(flatten)]
        download: DownloadOpts,
    },
    /// Connect to a device and print its information
    Info,
    /// Remove flash read protection, which mass erases the device
    Unprotect,
    /// Mass erase the flash
    Erase,
    /// Parse an image and print its segments
    Image {
        #[structopt(parse(from_os_str))]
        filename: PathBuf,
    },
    /// Start execution at the given address
    Execute {
        #[structopt(parse(try_from_str = parse_address))]
        address: u32,
    },
}

#[derive(StructOpt, Debug)]
pub struct DownloadOpts {
    /// Do not try to remove read protection first
    #[structopt(long)]
    pub no_unprotect: bool,
    /// Program without erasing first
    #[structopt(long)]
    pub skip_erase: bool,
    /// Do not read back and compare the written image
    #[structopt(long)]
    pub no_verify: bool,
    /// Leave the device in the bootloader after programming
    #[structopt(long)]
    pub no_execute: bool,
    /// Start execution here instead of at the lowest image address
    #[structopt(long, parse(try_from_str = parse_address))]
    pub execute_address: Option<u32>,
}

impl DownloadOpts {
    pub fn sequence_options(&self) -> SequenceOptions {
        SequenceOptions {
            unprotect: !self.no_unprotect,
            skip_erase: self.skip_erase,
            verify: !self.no_verify,
            execute: !self.no_execute,
            execute_address: self.execute_address,
        }
    }
}

#[derive(StructOpt, Debug)]
#[structopt(about = "Flash STM32 microcontrollers through their system bootloader")]
pub struct Opts {
    #[structopt(subcommand)]
    pub command: Command,

    /// Serial ports with an STM32 system bootloader behind them
    #[structopt(env = "SERIAL_PORT", short = "p", long = "port", use_delimiter = true)]
    pub serial_ports: Vec<String>,
    /// The serial baud rate to use for the UART bootloader
    #[structopt(
        env = "BAUD_RATE",
        short = "b",
        long = "baud-rate",
        default_value = "115200"
    )]
    pub baud_rate: u32,
    /// How long to wait for a device to accept a connection, in milliseconds
    #[structopt(env = "CONNECT_TIMEOUT", long = "connect-timeout", default_value = "10000")]
    pub connect_timeout: u64,
    /// How often to scan for devices, in milliseconds
    #[structopt(env = "POLL_INTERVAL", long = "poll-interval", default_value = "1000")]
    pub poll_interval: u64,
    /// Where raw binary images are loaded
    #[structopt(
        env = "BASE_ADDRESS",
        long = "base-address",
        default_value = "0x08000000",
        parse(try_from_str = parse_address)
    )]
    pub base_address: u32,
    /// The device to use, as printed by `list`, instead of the first one found
    #[structopt(short = "d", long = "device")]
    pub device: Option<String>,
}

impl Opts {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_should_parse_hex_and_decimal_addresses() {
        assert_eq!(parse_address("0x08000000"), Ok(0x0800_0000));
        assert_eq!(parse_address("0X0800_4000"), Ok(0x0800_4000));
        assert_eq!(parse_address("4096"), Ok(4096));
        assert!(parse_address("0x1_0000_0000").is_err());
        assert!(parse_address("flash").is_err());
    }

    #[test]
    fn it_should_map_download_flags_to_sequence_options() {
        let opts = Opts::from_iter(&[
            "cubeflash",
            "--base-address",
            "0x08004000",
            "flash",
            "app.bin",
            "--skip-erase",
            "--no-execute",
        ]);

        assert_eq!(opts.base_address, 0x0800_4000);

        match opts.command {
            Command::Flash { filename, download } => {
                assert_eq!(filename, PathBuf::from("app.bin"));
                assert_eq!(
                    download.sequence_options(),
                    SequenceOptions {
                        skip_erase: true,
                        execute: false,
                        ..SequenceOptions::default()
                    }
                );
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn it_should_parse_execute_addresses() {
        let opts = Opts::from_iter(&["cubeflash", "execute", "0x08000000"]);

        assert!(matches!(opts.command, Command::Execute { address: 0x0800_0000 }));
    }
}
