//! Exclusive sessions with targets
//!
//! The connection manager keeps a registry of the devices that have a live session. A device can
//! only be claimed once; the claim is released when the session is disconnected or dropped.

use std::collections::HashMap;
use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use log::{debug, info, trace, warn};
use rusb::Context;

use crate::device::{ConnectionState, DeviceId, ProtocolMode, TargetDevice};
use crate::dfu::DfuTarget;
use crate::enumerate::usb_context;
use crate::sequencer::{LogEntry, SequenceState};
use crate::target::Target;
use crate::uart::{UartBootloader, DEFAULT_BAUD_RATE};
use crate::{ConnectionError, TargetError};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens the transport for a target device.
pub trait Connector: Send + Sync {
    fn open(&self, device: &TargetDevice) -> Result<Box<dyn Target>, ConnectionError>;
}

/// Opens DFU devices over libusb and UART ports with the system bootloader protocol.
#[derive(Debug, Clone)]
pub struct DefaultConnector {
    pub baud_rate: u32,
    usb: Option<Context>,
}

impl DefaultConnector {
    /// Creates a connector with its own libusb context, opening UART ports at `baud_rate`.
    pub fn new(baud_rate: u32) -> DefaultConnector {
        DefaultConnector {
            baud_rate,
            usb: usb_context(),
        }
    }
}

impl Default for DefaultConnector {
    fn default() -> DefaultConnector {
        DefaultConnector::new(DEFAULT_BAUD_RATE)
    }
}

impl Connector for DefaultConnector {
    fn open(&self, device: &TargetDevice) -> Result<Box<dyn Target>, ConnectionError> {
        let open_error = |err: TargetError| match err {
            TargetError::Usb(rusb::Error::NoDevice) => ConnectionError::NotFound(device.id.clone()),
            err => ConnectionError::Open(device.id.clone(), err),
        };

        match device.mode {
            ProtocolMode::Dfu => {
                let context = self
                    .usb
                    .as_ref()
                    .ok_or_else(|| open_error(TargetError::Usb(rusb::Error::NotSupported)))?;
                let target = DfuTarget::open(context, &device.id).map_err(open_error)?;

                Ok(Box::new(target))
            }
            ProtocolMode::Uart => {
                let port = device
                    .id
                    .serial_port()
                    .ok_or_else(|| ConnectionError::NotFound(device.id.clone()))?;
                let target = UartBootloader::open(port, self.baud_rate).map_err(open_error)?;

                Ok(Box::new(target))
            }
            ProtocolMode::DebugProbe => Err(ConnectionError::Unsupported(device.mode)),
        }
    }
}

type Registry = Arc<Mutex<HashMap<DeviceId, ConnectionState>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<DeviceId, ConnectionState>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A claim on a device in the registry, released on drop.
struct SessionLease {
    registry: Registry,
    id: DeviceId,
}

impl SessionLease {
    fn claim(registry: &Registry, id: &DeviceId) -> Result<SessionLease, ConnectionError> {
        let mut claims = lock(registry);

        if claims.contains_key(id) {
            return Err(ConnectionError::AlreadyConnected(id.clone()));
        }

        claims.insert(id.clone(), ConnectionState::Connected);

        Ok(SessionLease {
            registry: Arc::clone(registry),
            id: id.clone(),
        })
    }

    fn set_state(&self, state: ConnectionState) {
        lock(&self.registry).insert(self.id.clone(), state);
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        lock(&self.registry).remove(&self.id);

        trace!("Released claim on {}", self.id);
    }
}

/// An open connection to one target device.
pub struct FlashSession {
    device: TargetDevice,
    target: Box<dyn Target>,
    state: SequenceState,
    log: Vec<LogEntry>,
    lease: SessionLease,
}

impl FlashSession {
    fn new(mut device: TargetDevice, target: Box<dyn Target>, lease: SessionLease) -> FlashSession {
        device.state = ConnectionState::Connected;

        FlashSession {
            device,
            target,
            state: SequenceState::Idle,
            log: Vec::new(),
            lease,
        }
    }

    pub fn device(&self) -> &TargetDevice {
        &self.device
    }

    pub fn target(&mut self) -> &mut dyn Target {
        self.target.as_mut()
    }

    /// The state of the flash sequence run on this session.
    pub fn state(&self) -> SequenceState {
        self.state
    }

    /// The steps run on this session so far.
    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    pub(crate) fn set_state(&mut self, state: SequenceState) {
        self.state = state;
    }

    pub(crate) fn record(&mut self, entry: LogEntry) {
        self.log.push(entry);
    }

    /// Marks the device busy while a sequence runs on it.
    pub(crate) fn set_busy(&mut self, busy: bool) {
        let state = if busy {
            ConnectionState::Busy
        } else {
            ConnectionState::Connected
        };

        self.device.state = state;
        self.lease.set_state(state);
    }
}

/// Hands out exclusive sessions and tracks which devices have one.
#[derive(Clone)]
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    registry: Registry,
    timeout: Duration,
}

impl ConnectionManager {
    pub fn new<C: Connector + 'static>(connector: C, timeout: Duration) -> ConnectionManager {
        ConnectionManager {
            connector: Arc::new(connector),
            registry: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    /// Opens a session with `device`, waiting at most the connect timeout for the transport.
    ///
    /// Fails with `ConnectionError::AlreadyConnected` before touching the transport when the
    /// device already has a session.
    pub fn connect(&self, device: &TargetDevice) -> Result<FlashSession, ConnectionError> {
        let lease = SessionLease::claim(&self.registry, &device.id)?;

        debug!("Connecting to {}", device);

        let (sender, receiver) = mpsc::channel();
        let connector = Arc::clone(&self.connector);
        let worker_device = device.clone();

        // The worker holds the claim until its open returns. When the connect timed out nobody
        // receives the result, so a late target is closed before the claim is released.
        thread::Builder::new()
            .name(format!("connect {}", device.id))
            .spawn(move || {
                let result = connector.open(&worker_device);
                let _ = sender.send((result, lease));
            })
            .map_err(|err| ConnectionError::Open(device.id.clone(), err.into()))?;

        match receiver.recv_timeout(self.timeout) {
            Ok((Ok(target), lease)) => {
                info!("Connected to {}", device.id);

                Ok(FlashSession::new(device.clone(), target, lease))
            }
            Ok((Err(err), _lease)) => Err(err),
            Err(RecvTimeoutError::Timeout) => {
                warn!("Timed out connecting to {} after {:?}", device.id, self.timeout);

                Err(ConnectionError::Timeout(self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(ConnectionError::Open(
                device.id.clone(),
                io::Error::new(io::ErrorKind::Other, "the connection worker exited").into(),
            )),
        }
    }

    /// Closes the transport of `session` and releases the device.
    pub fn disconnect(&self, mut session: FlashSession) {
        if let Err(err) = session.target.close() {
            warn!("Error while closing {}: {}", session.device.id, err);
        }

        info!("Disconnected from {}", session.device.id);
    }

    /// The connection state of the device identified by `id`.
    pub fn state_of(&self, id: &DeviceId) -> ConnectionState {
        lock(&self.registry).get(id).copied().unwrap_or_default()
    }

    /// Fills in the connection state of freshly scanned devices.
    pub fn annotate(&self, devices: &mut [TargetDevice]) {
        let claims = lock(&self.registry);

        for device in devices {
            device.state = claims.get(&device.id).copied().unwrap_or_default();
        }
    }

    /// Whether any device has a live session.
    pub fn is_connected(&self) -> bool {
        !lock(&self.registry).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::mock::{dfu_device, probe_device, MockConnector, MockTarget};

    fn manager(connector: MockConnector) -> ConnectionManager {
        ConnectionManager::new(connector, Duration::from_millis(500))
    }

    #[test]
    fn it_should_reject_a_second_connection() {
        let target = MockTarget::new();
        let connector = MockConnector::new(target.clone());
        let opened = connector.opened();
        let manager = manager(connector);
        let device = dfu_device(1);

        let mut first = manager.connect(&device).unwrap();

        match manager.connect(&device) {
            Err(ConnectionError::AlreadyConnected(id)) => assert_eq!(id, device.id),
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }

        assert_eq!(opened.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(manager.state_of(&device.id), ConnectionState::Connected);
        assert_eq!(first.state(), SequenceState::Idle);
        assert!(first.target().info().is_ok());
        assert_eq!(target.calls(), vec!["info"]);
    }

    #[test]
    fn it_should_time_out_slow_connections() {
        let connector = MockConnector::new(MockTarget::new()).with_delay(Duration::from_secs(2));
        let manager = ConnectionManager::new(connector, Duration::from_millis(100));
        let device = dfu_device(1);
        let started = Instant::now();

        assert!(matches!(
            manager.connect(&device),
            Err(ConnectionError::Timeout(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn it_should_hold_the_claim_until_a_timed_out_open_returns() {
        let connector = MockConnector::new(MockTarget::new()).with_delay(Duration::from_millis(300));
        let opened = connector.opened();
        let manager = ConnectionManager::new(connector, Duration::from_millis(100));
        let device = dfu_device(1);

        assert!(matches!(
            manager.connect(&device),
            Err(ConnectionError::Timeout(_))
        ));
        assert!(matches!(
            manager.connect(&device),
            Err(ConnectionError::AlreadyConnected(_))
        ));
        assert_eq!(opened.load(std::sync::atomic::Ordering::SeqCst), 0);

        let started = Instant::now();

        while manager.is_connected() && started.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(10));
        }

        assert!(!manager.is_connected());
        assert_eq!(opened.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn it_should_release_the_claim_when_a_session_ends() {
        let manager = manager(MockConnector::new(MockTarget::new()));
        let device = dfu_device(1);

        let session = manager.connect(&device).unwrap();
        assert!(manager.is_connected());
        drop(session);
        assert!(!manager.is_connected());

        let session = manager.connect(&device).unwrap();
        manager.disconnect(session);
        assert_eq!(manager.state_of(&device.id), ConnectionState::Disconnected);
    }

    #[test]
    fn it_should_release_the_claim_when_opening_fails() {
        let manager = manager(MockConnector::new(MockTarget::new()));
        let device = probe_device(1);

        assert!(matches!(
            manager.connect(&device),
            Err(ConnectionError::Unsupported(ProtocolMode::DebugProbe))
        ));
        assert!(!manager.is_connected());
    }

    #[test]
    fn it_should_annotate_scanned_devices() {
        let manager = manager(MockConnector::new(MockTarget::new()));
        let mut session = manager.connect(&dfu_device(2)).unwrap();
        let mut devices = vec![dfu_device(1), dfu_device(2)];

        session.set_busy(true);
        manager.annotate(&mut devices);

        assert_eq!(devices[0].state, ConnectionState::Disconnected);
        assert_eq!(devices[1].state, ConnectionState::Busy);
        assert_eq!(session.device().state, ConnectionState::Busy);
    }

    #[test]
    fn it_should_refuse_debug_probes() {
        let connector = DefaultConnector::default();

        assert!(matches!(
            connector.open(&probe_device(1)),
            Err(ConnectionError::Unsupported(ProtocolMode::DebugProbe))
        ));
    }
}
