use std::collections::HashSet;
use std::ops::ControlFlow;
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Context;
use log::{error, info, warn};
use structopt::StructOpt;

use cubeflash::connection::{ConnectionManager, DefaultConnector, FlashSession};
use cubeflash::device::{ConnectionState, DeviceId, ProtocolMode, TargetDevice};
use cubeflash::enumerate::Enumerator;
use cubeflash::image::FirmwareImage;
use cubeflash::poll::{Poller, Status};
use cubeflash::sequencer::{spawn_flash, CancelToken, SequenceOptions, Sequencer, Step};
use cubeflash::{Error, SequenceStepFailure};

mod cli;

use cli::{Command, Opts};

type FlashJob = JoinHandle<(FlashSession, Result<(), Error>)>;

fn connection_manager(opts: &Opts) -> ConnectionManager {
    ConnectionManager::new(DefaultConnector::new(opts.baud_rate), opts.connect_timeout())
}

fn load_image<P: AsRef<Path>>(path: P, base_address: u32) -> Result<FirmwareImage, anyhow::Error> {
    FirmwareImage::from_path(&path, base_address)
        .map_err(Error::from)
        .with_context(|| format!("Failed to read image '{}'", path.as_ref().display()))
}

/// Picks the requested device, or the first one that can be flashed.
fn select_device(opts: &Opts, enumerator: &Enumerator) -> Result<TargetDevice, anyhow::Error> {
    let devices = enumerator
        .scan()
        .map_err(Error::from)
        .context("Failed to scan for devices")?;

    let selected = match &opts.device {
        Some(id) => devices.into_iter().find(|d| d.id.as_str() == id),
        None => {
            let flashable = devices
                .iter()
                .position(|d| d.mode != ProtocolMode::DebugProbe)
                .unwrap_or(0);

            devices.into_iter().nth(flashable)
        }
    };

    Ok(selected.ok_or(Error::NoDevice)?)
}

fn connect(opts: &Opts, manager: &ConnectionManager) -> Result<FlashSession, anyhow::Error> {
    let enumerator = Enumerator::new(opts.serial_ports.clone());
    let device = select_device(opts, &enumerator)?;

    println!("Using {}", device);

    manager
        .connect(&device)
        .map_err(Error::from)
        .with_context(|| format!("Failed to connect to {}", device.id))
}

fn list(opts: &Opts) -> Result<(), anyhow::Error> {
    let devices = Enumerator::new(opts.serial_ports.clone())
        .scan()
        .map_err(Error::from)
        .context("Failed to scan for devices")?;

    if devices.is_empty() {
        println!("No devices found");
    }

    for device in devices {
        println!("{}", device);
    }

    Ok(())
}

fn print_image(image: &FirmwareImage) {
    println!("Format: {}", image.format());

    if let Some(header) = image.header() {
        println!("Header: {}", header);
    }

    if let Some(entry_point) = image.entry_point() {
        println!("Entry point: {:#010x}", entry_point);
    }

    for segment in image.segments() {
        println!(
            "  {:#010x}..{:#010x} ({} bytes)",
            segment.address,
            segment.end(),
            segment.data.len()
        );
    }

    println!("Size: {} bytes", image.len());
    println!("SHA-256: {}", image.digest_hex());
}

fn print_log(session: &FlashSession) {
    for entry in session.log() {
        println!("  {:<10} {:?} in {:?}", entry.step, entry.outcome, entry.elapsed);
    }
}

fn flash(opts: &Opts, path: &Path, options: SequenceOptions) -> Result<(), anyhow::Error> {
    let image = load_image(path, opts.base_address)?;
    let manager = connection_manager(opts);
    let mut session = connect(opts, &manager)?;

    print_image(&image);

    let result = Sequencer::new(&mut session, &image, options).run();

    print_log(&session);
    manager.disconnect(session);

    result.context("Flashing failed")?;

    println!("Done");

    Ok(())
}

/// Runs a single target operation, reporting a failure as a failure of `step`.
fn run_step<F>(opts: &Opts, step: Step, operation: F) -> Result<(), anyhow::Error>
where
    F: FnOnce(&mut FlashSession) -> Result<(), cubeflash::TargetError>,
{
    let manager = connection_manager(opts);
    let mut session = connect(opts, &manager)?;
    let result = operation(&mut session);

    manager.disconnect(session);

    result
        .map_err(|err| Error::from(SequenceStepFailure::new(step, err)))
        .with_context(|| format!("The {} operation failed", step))?;

    Ok(())
}

fn info(opts: &Opts) -> Result<(), anyhow::Error> {
    let manager = connection_manager(opts);
    let mut session = connect(opts, &manager)?;
    let info = session.target().info().map_err(Error::from);

    manager.disconnect(session);

    print!("{}", info.context("Failed to read target information")?);

    Ok(())
}

fn finish_job(manager: &ConnectionManager, job: FlashJob) {
    match job.join() {
        Ok((session, result)) => {
            let id = session.device().id.clone();

            print_log(&session);
            manager.disconnect(session);

            match result {
                Ok(()) => println!("Flashed {}", id),
                Err(err) => error!("Flashing {} failed: {}", id, err),
            }
        }
        Err(_) => error!("A flash worker panicked"),
    }
}

fn watch(opts: &Opts, image: Option<FirmwareImage>, options: SequenceOptions) -> Result<(), anyhow::Error> {
    let manager = connection_manager(opts);
    let poller = Poller::new(
        Enumerator::new(opts.serial_ports.clone()),
        manager.clone(),
        opts.poll_interval(),
    );
    let image = image.map(Arc::new);
    let mut last: Option<Status> = None;
    let mut flashed: HashSet<DeviceId> = HashSet::new();
    let mut jobs: Vec<FlashJob> = Vec::new();

    info!("Watching for devices every {:?}", opts.poll_interval());

    poller.run(|status| {
        let changed = last.as_ref().map_or(true, |last| {
            (last.dfu, last.probes, last.uart, last.device_connected)
                != (status.dfu, status.probes, status.uart, status.device_connected)
        });

        if changed {
            println!("{}", status);
        }

        last = Some(status.clone());

        let (finished, running): (Vec<FlashJob>, Vec<FlashJob>) =
            jobs.drain(..).partition(|job| job.is_finished());

        jobs = running;

        for job in finished {
            finish_job(&manager, job);
        }

        // Forget devices that went away so they are flashed again when they come back
        flashed.retain(|id| status.devices.iter().any(|d| d.id == *id));

        let image = match &image {
            Some(image) => image,
            None => return ControlFlow::Continue(()),
        };

        let candidates = status.devices.iter().filter(|d| {
            d.mode != ProtocolMode::DebugProbe
                && d.state == ConnectionState::Disconnected
                && !flashed.contains(&d.id)
        }).collect::<Vec<_>>();

        for device in candidates {
            flashed.insert(device.id.clone());

            let session = match manager.connect(device) {
                Ok(session) => session,
                Err(err) => {
                    warn!("Could not connect to {}: {}", device.id, err);
                    continue;
                }
            };

            match spawn_flash(session, Arc::clone(image), options, CancelToken::new()) {
                Ok(job) => jobs.push(job),
                Err(err) => error!("Could not start flashing {}: {}", device.id, err),
            }
        }

        ControlFlow::Continue(())
    });

    Ok(())
}

fn run(opts: &Opts) -> Result<(), anyhow::Error> {
    match &opts.command {
        Command::List => list(opts),
        Command::Watch { filename, download } => {
            let image = match filename {
                Some(path) => Some(load_image(path, opts.base_address)?),
                None => None,
            };

            watch(opts, image, download.sequence_options())
        }
        Command::Flash { filename, download } => {
            flash(opts, filename, download.sequence_options())
        }
        Command::Info => info(opts),
        Command::Unprotect => run_step(opts, Step::Unprotect, |session| {
            session.target().unprotect()
        }),
        Command::Erase => run_step(opts, Step::Erase, |session| session.target().mass_erase()),
        Command::Image { filename } => {
            let image = load_image(filename, opts.base_address)?;

            print_image(&image);

            Ok(())
        }
        Command::Execute { address } => {
            let address = *address;

            run_step(opts, Step::Execute, move |session| {
                session.target().execute(address)
            })
        }
    }
}

/// The exit code of the first library error in the chain of `err`.
fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<Error>())
        .map_or(1, Error::exit_code)
}

fn main() {
    // Create a logger with a timestamp, the level is set through RUST_LOG
    pretty_env_logger::init_timed();

    // Parse the command-line arguments
    let opts = Opts::from_args();

    if let Err(err) = run(&opts) {
        eprintln!("Error: {:?}", err);

        process::exit(exit_code(&err));
    }
}
