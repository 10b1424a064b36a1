//! The flash sequence: unprotect, erase, program, verify and execute
//!
//! Each step is a single call into the target. The first failing step stops the sequence and
//! leaves the session in `SequenceState::Failed`; nothing is rolled back.

use std::fmt;
use std::io;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info};

use crate::connection::FlashSession;
use crate::image::FirmwareImage;
use crate::{Error, SequenceStepFailure, TargetError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Unprotect,
    Erase,
    Program,
    Verify,
    Execute,
}

impl Step {
    /// Every step in the order they run.
    pub const ALL: [Step; 5] = [
        Step::Unprotect,
        Step::Erase,
        Step::Program,
        Step::Verify,
        Step::Execute,
    ];

    /// The process exit code reported when this step fails.
    pub fn exit_code(self) -> i32 {
        match self {
            Step::Unprotect => 10,
            Step::Erase => 11,
            Step::Program => 12,
            Step::Verify => 13,
            Step::Execute => 14,
        }
    }

    fn completed_state(self) -> SequenceState {
        match self {
            Step::Unprotect => SequenceState::Unprotected,
            Step::Erase => SequenceState::Erased,
            Step::Program => SequenceState::Programmed,
            Step::Verify => SequenceState::Verified,
            Step::Execute => SequenceState::Executing,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Unprotect => "unprotect",
            Step::Erase => "erase",
            Step::Program => "program",
            Step::Verify => "verify",
            Step::Execute => "execute",
        };

        f.pad(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    Idle,
    Unprotected,
    Erased,
    Programmed,
    Verified,
    Executing,
    Done,
    Failed(Step),
}

impl SequenceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SequenceState::Done | SequenceState::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Skipped,
    /// The step failed with the given target error code
    Failed(i32),
}

/// One line of a session's operation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub step: Step,
    pub outcome: Outcome,
    pub elapsed: Duration,
}

/// Which optional steps to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceOptions {
    pub unprotect: bool,
    pub skip_erase: bool,
    pub verify: bool,
    pub execute: bool,
    /// Where to start execution, the lowest image address when unset
    pub execute_address: Option<u32>,
}

impl Default for SequenceOptions {
    fn default() -> SequenceOptions {
        SequenceOptions {
            unprotect: true,
            skip_erase: false,
            verify: true,
            execute: true,
            execute_address: None,
        }
    }
}

/// Requests that a sequence does not start.
///
/// A sequence checks the token once before it leaves `Idle`; cancelling a running sequence has
/// no effect.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs the flash sequence for one image on one session.
pub struct Sequencer<'a> {
    session: &'a mut FlashSession,
    image: &'a FirmwareImage,
    options: SequenceOptions,
    cancel: CancelToken,
}

impl<'a> Sequencer<'a> {
    pub fn new(
        session: &'a mut FlashSession,
        image: &'a FirmwareImage,
        options: SequenceOptions,
    ) -> Sequencer<'a> {
        Sequencer {
            session,
            image,
            options,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Sequencer<'a> {
        self.cancel = cancel;
        self
    }

    /// Runs every step in order, stopping at the first failure.
    ///
    /// The session must be `Idle`; a session that already ran a sequence cannot be reused.
    pub fn run(mut self) -> Result<(), Error> {
        let state = self.session.state();

        if state != SequenceState::Idle {
            return Err(Error::SessionNotIdle(state));
        }

        if self.cancel.is_cancelled() {
            info!("Flashing {} was cancelled", self.session.device().id);

            return Err(Error::Cancelled);
        }

        info!(
            "Flashing {} bytes in {} segment(s) to {}",
            self.image.len(),
            self.image.segments().len(),
            self.session.device().id
        );

        self.session.set_busy(true);

        let result = self.run_steps();

        self.session.set_busy(false);

        result
    }

    fn run_steps(&mut self) -> Result<(), Error> {
        for &step in Step::ALL.iter() {
            let started = Instant::now();
            let result = if self.is_enabled(step) {
                self.perform(step).map(|()| Outcome::Completed)
            } else {
                Ok(Outcome::Skipped)
            };
            let elapsed = started.elapsed();

            match result {
                Ok(outcome) => {
                    if outcome == Outcome::Skipped {
                        debug!("Skipped the {} step", step);
                    } else {
                        info!("The {} step completed in {:?}", step, elapsed);
                    }

                    self.session.record(LogEntry {
                        step,
                        outcome,
                        elapsed,
                    });
                    self.session.set_state(step.completed_state());
                }
                Err(source) => {
                    let failure = SequenceStepFailure::new(step, source);

                    error!("{}", failure);

                    self.session.record(LogEntry {
                        step,
                        outcome: Outcome::Failed(failure.code),
                        elapsed,
                    });
                    self.session.set_state(SequenceState::Failed(step));

                    return Err(failure.into());
                }
            }
        }

        self.session.set_state(SequenceState::Done);

        Ok(())
    }

    fn is_enabled(&self, step: Step) -> bool {
        match step {
            Step::Unprotect => self.options.unprotect,
            Step::Erase => !self.options.skip_erase,
            Step::Program => true,
            Step::Verify => self.options.verify,
            Step::Execute => self.options.execute,
        }
    }

    fn perform(&mut self, step: Step) -> Result<(), TargetError> {
        let image = self.image;
        let target = self.session.target();

        match step {
            Step::Unprotect => target.unprotect(),
            Step::Erase => {
                let regions: Vec<Range<u32>> = image
                    .segments()
                    .iter()
                    .map(|segment| segment.address..segment.end())
                    .collect();

                target.erase(&regions)
            }
            Step::Program => {
                for segment in image.segments() {
                    target.program(segment.address, &segment.data)?;
                }

                Ok(())
            }
            Step::Verify => {
                for segment in image.segments() {
                    let mut actual = vec![0u8; segment.data.len()];

                    target.read(segment.address, &mut actual)?;

                    let mismatch = segment
                        .data
                        .iter()
                        .zip(&actual)
                        .position(|(expected, actual)| expected != actual);

                    if let Some(offset) = mismatch {
                        return Err(TargetError::VerifyMismatch {
                            address: segment.address + offset as u32,
                            expected: segment.data[offset],
                            actual: actual[offset],
                        });
                    }
                }

                info!("Verified {} bytes, sha256 {}", image.len(), image.digest_hex());

                Ok(())
            }
            Step::Execute => {
                let address = self
                    .options
                    .execute_address
                    .unwrap_or_else(|| image.start_address());

                if let Some(entry_point) = image.entry_point() {
                    debug!("The image declares entry point {:#010x}", entry_point);
                }

                target.execute(address)
            }
        }
    }
}

/// Runs the flash sequence on a worker thread and hands the session back when it ends.
pub fn spawn_flash(
    mut session: FlashSession,
    image: Arc<FirmwareImage>,
    options: SequenceOptions,
    cancel: CancelToken,
) -> io::Result<JoinHandle<(FlashSession, Result<(), Error>)>> {
    thread::Builder::new()
        .name(format!("flash {}", session.device().id))
        .spawn(move || {
            let result = Sequencer::new(&mut session, &image, options)
                .with_cancel(cancel)
                .run();

            (session, result)
        })
}

#[cfg(test)]
mod tests {
    use std::ops::Range;

    use super::*;
    use crate::connection::{ConnectionManager, Connector};
    use crate::device::TargetDevice;
    use crate::image::ImageFormat;
    use crate::mock::{dfu_device, MockConnector, MockTarget};
    use crate::target::{Target, TargetInfo};
    use crate::ConnectionError;

    fn image_at(base_address: u32, len: usize) -> FirmwareImage {
        let data: Vec<u8> = (0..len).map(|i| i as u8).collect();

        FirmwareImage::parse(&data, ImageFormat::Binary { base_address }).unwrap()
    }

    fn manager(target: &MockTarget) -> ConnectionManager {
        ConnectionManager::new(MockConnector::new(target.clone()), Duration::from_secs(1))
    }

    fn step_failure(result: Result<(), Error>) -> SequenceStepFailure {
        match result {
            Err(Error::Step(failure)) => failure,
            other => panic!("expected a step failure, got {:?}", other),
        }
    }

    #[test]
    fn it_should_run_every_step_in_order() {
        let target = MockTarget::new();
        let mut session = manager(&target).connect(&dfu_device(1)).unwrap();
        let image = image_at(0x0800_0000, 300);

        Sequencer::new(&mut session, &image, SequenceOptions::default())
            .run()
            .unwrap();

        assert_eq!(
            target.calls(),
            vec!["unprotect", "erase", "program", "read", "execute"]
        );
        assert_eq!(session.state(), SequenceState::Done);
        assert_eq!(session.log().len(), 5);
        assert!(session
            .log()
            .iter()
            .all(|entry| entry.outcome == Outcome::Completed));
        assert_eq!(target.byte_at(0x0800_0000 + 299), Some(43));
        assert_eq!(target.executed_at(), Some(0x0800_0000));
    }

    #[test]
    fn it_should_stop_at_the_first_failing_step() {
        let target = MockTarget::failing_on("erase");
        let mut session = manager(&target).connect(&dfu_device(1)).unwrap();
        let image = image_at(0x0800_0000, 16);

        let failure = step_failure(
            Sequencer::new(&mut session, &image, SequenceOptions::default()).run(),
        );

        assert_eq!(failure.step, Step::Erase);
        assert_eq!(failure.code, 0x144);
        assert_eq!(target.calls(), vec!["unprotect", "erase"]);
        assert_eq!(session.state(), SequenceState::Failed(Step::Erase));
        assert_eq!(
            session.log().last().map(|entry| entry.outcome),
            Some(Outcome::Failed(0x144))
        );
        assert_eq!(target.byte_at(0x0800_0000), None);
    }

    #[test]
    fn it_should_report_the_first_mismatching_address() {
        let target = MockTarget::corrupting_reads();
        let mut session = manager(&target).connect(&dfu_device(1)).unwrap();
        let image = image_at(0x0800_1000, 16);

        let failure = step_failure(
            Sequencer::new(&mut session, &image, SequenceOptions::default()).run(),
        );

        assert_eq!(failure.step, Step::Verify);
        assert!(matches!(
            failure.source,
            TargetError::VerifyMismatch {
                address: 0x0800_1000,
                expected: 0x00,
                actual: 0xff,
            }
        ));
        assert!(!target.calls().contains(&"execute"));
    }

    #[test]
    fn it_should_require_a_fresh_session_after_a_failure() {
        let target = MockTarget::failing_on("unprotect");
        let manager = manager(&target);
        let image = image_at(0x0800_0000, 16);
        let mut session = manager.connect(&dfu_device(1)).unwrap();

        step_failure(Sequencer::new(&mut session, &image, SequenceOptions::default()).run());

        assert!(matches!(
            Sequencer::new(&mut session, &image, SequenceOptions::default()).run(),
            Err(Error::SessionNotIdle(SequenceState::Failed(Step::Unprotect)))
        ));

        manager.disconnect(session);

        let mut session = manager.connect(&dfu_device(1)).unwrap();
        assert_eq!(session.state(), SequenceState::Idle);

        let options = SequenceOptions {
            unprotect: false,
            ..SequenceOptions::default()
        };

        Sequencer::new(&mut session, &image, options).run().unwrap();
        assert_eq!(session.state(), SequenceState::Done);
    }

    #[test]
    fn it_should_advance_through_skipped_steps() {
        let target = MockTarget::new();
        let mut session = manager(&target).connect(&dfu_device(1)).unwrap();
        let image = image_at(0x0800_0000, 16);
        let options = SequenceOptions {
            unprotect: false,
            skip_erase: true,
            verify: false,
            execute: false,
            execute_address: None,
        };

        Sequencer::new(&mut session, &image, options).run().unwrap();

        let outcomes: Vec<Outcome> = session.log().iter().map(|entry| entry.outcome).collect();

        assert_eq!(target.calls(), vec!["program"]);
        assert_eq!(session.state(), SequenceState::Done);
        assert_eq!(
            outcomes,
            vec![
                Outcome::Skipped,
                Outcome::Skipped,
                Outcome::Completed,
                Outcome::Skipped,
                Outcome::Skipped
            ]
        );
    }

    #[test]
    fn it_should_execute_at_the_requested_address() {
        let target = MockTarget::new();
        let mut session = manager(&target).connect(&dfu_device(1)).unwrap();
        let image = image_at(0x0800_4000, 16);
        let options = SequenceOptions {
            execute_address: Some(0x0800_0000),
            ..SequenceOptions::default()
        };

        Sequencer::new(&mut session, &image, options).run().unwrap();

        assert_eq!(target.executed_at(), Some(0x0800_0000));
    }

    #[test]
    fn it_should_honor_cancellation_before_starting() {
        let target = MockTarget::new();
        let mut session = manager(&target).connect(&dfu_device(1)).unwrap();
        let image = image_at(0x0800_0000, 16);
        let cancel = CancelToken::new();

        cancel.cancel();

        assert!(matches!(
            Sequencer::new(&mut session, &image, SequenceOptions::default())
                .with_cancel(cancel)
                .run(),
            Err(Error::Cancelled)
        ));
        assert_eq!(session.state(), SequenceState::Idle);
        assert!(target.calls().is_empty());
    }

    /// A target that cancels the sequence from inside the first step
    struct CancellingTarget {
        inner: MockTarget,
        cancel: CancelToken,
    }

    impl Target for CancellingTarget {
        fn info(&mut self) -> Result<TargetInfo, TargetError> {
            self.inner.info()
        }

        fn unprotect(&mut self) -> Result<(), TargetError> {
            self.cancel.cancel();
            self.inner.unprotect()
        }

        fn erase(&mut self, regions: &[Range<u32>]) -> Result<(), TargetError> {
            self.inner.erase(regions)
        }

        fn mass_erase(&mut self) -> Result<(), TargetError> {
            self.inner.mass_erase()
        }

        fn program(&mut self, address: u32, data: &[u8]) -> Result<(), TargetError> {
            self.inner.program(address, data)
        }

        fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), TargetError> {
            self.inner.read(address, buf)
        }

        fn execute(&mut self, address: u32) -> Result<(), TargetError> {
            self.inner.execute(address)
        }
    }

    struct CancellingConnector {
        inner: MockTarget,
        cancel: CancelToken,
    }

    impl Connector for CancellingConnector {
        fn open(&self, _device: &TargetDevice) -> Result<Box<dyn Target>, ConnectionError> {
            Ok(Box::new(CancellingTarget {
                inner: self.inner.clone(),
                cancel: self.cancel.clone(),
            }))
        }
    }

    #[test]
    fn it_should_ignore_cancellation_once_running() {
        let target = MockTarget::new();
        let cancel = CancelToken::new();
        let manager = ConnectionManager::new(
            CancellingConnector {
                inner: target.clone(),
                cancel: cancel.clone(),
            },
            Duration::from_secs(1),
        );
        let mut session = manager.connect(&dfu_device(1)).unwrap();
        let image = image_at(0x0800_0000, 16);

        Sequencer::new(&mut session, &image, SequenceOptions::default())
            .with_cancel(cancel.clone())
            .run()
            .unwrap();

        assert!(cancel.is_cancelled());
        assert_eq!(session.state(), SequenceState::Done);
        assert_eq!(target.calls().len(), 5);
    }

    #[test]
    fn it_should_flash_on_a_worker_thread() {
        let target = MockTarget::new();
        let manager = manager(&target);
        let device = dfu_device(1);
        let session = manager.connect(&device).unwrap();
        let image = Arc::new(image_at(0x0800_0000, 64));

        let handle = spawn_flash(
            session,
            image,
            SequenceOptions::default(),
            CancelToken::new(),
        )
        .unwrap();
        let (session, result) = handle.join().unwrap();

        assert!(result.is_ok());
        assert_eq!(session.state(), SequenceState::Done);
        assert_eq!(manager.state_of(&device.id), crate::device::ConnectionState::Connected);
    }
}
