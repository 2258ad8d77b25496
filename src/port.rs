//! The serial port shared between the provisioner and the pulse manager.
//!
//! The provisioner owns the port, but the pulse manager must be able to
//! forcibly close it from its removal callback so that the next read or write
//! fails with an I/O error. [`PortHandle`] is a cheap, cloneable handle over an
//! optional [`Transport`]; closing it drops the underlying port and any later
//! operation reports [`io::ErrorKind::NotConnected`].

use std::{
    fmt,
    io::{self, Read, Write},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use serialport::{ClearBuffer, SerialPort};

use crate::{utils::open_and_setup_port, Settings};

// =============================================================================
// Public Interface
// =============================================================================

/// A duplex byte stream with a configurable read timeout.
///
/// Implemented for the boxed [`SerialPort`] returned by `serialport`, and by
/// in-memory fakes in tests.
pub trait Transport: Read + Write + Send {
    /// Set the timeout used by subsequent reads (and writes).
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Discard any data received but not yet read.
    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for Box<dyn SerialPort> {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        SerialPort::set_timeout(self.as_mut(), timeout).map_err(io::Error::from)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

/// Opens a fresh [`Transport`] each time the provisioner waits for the serial
/// device.
pub trait PortOpener: Send {
    fn open(&mut self) -> io::Result<Box<dyn Transport>>;
}

/// Opens the serial device described by the [`Settings`].
pub struct SerialOpener {
    settings: Settings,
}
impl SerialOpener {
    pub fn new(settings: Settings) -> Self {
        SerialOpener { settings }
    }
}
impl PortOpener for SerialOpener {
    fn open(&mut self) -> io::Result<Box<dyn Transport>> {
        let port = open_and_setup_port(&self.settings)?;
        Ok(Box::new(port))
    }
}

/// Shared, closable handle to the currently open transport.
#[derive(Clone, Default)]
pub struct PortHandle {
    inner: Arc<Mutex<Option<Box<dyn Transport>>>>,
}

impl PortHandle {
    /// A handle with no open transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle wrapping an already open transport.
    pub fn with_transport(transport: Box<dyn Transport>) -> Self {
        let handle = Self::new();
        handle.attach(transport);
        handle
    }

    /// Install a newly opened transport, dropping any previous one.
    pub fn attach(&self, transport: Box<dyn Transport>) {
        *self.lock() = Some(transport);
    }

    /// Drop the transport. Subsequent operations fail with `NotConnected`.
    pub fn close(&self) {
        if self.lock().take().is_some() {
            log::debug!("serial port closed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    /// Read whatever is available within `timeout` into `buf`.
    pub fn read(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.with(|port| {
            port.set_timeout(timeout)?;
            port.read(buf)
        })
    }

    /// Write the whole buffer, waiting at most `timeout` for the port.
    pub fn write_all(&self, buf: &[u8], timeout: Duration) -> io::Result<()> {
        self.with(|port| {
            port.set_timeout(timeout)?;
            port.write_all(buf)?;
            port.flush()
        })
    }

    pub fn clear_input(&self) -> io::Result<()> {
        self.with(|port| port.clear_input())
    }

    fn with<T>(&self, f: impl FnOnce(&mut dyn Transport) -> io::Result<T>) -> io::Result<T> {
        let mut guard = self.lock();
        match guard.as_mut() {
            Some(port) => f(port.as_mut()),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "serial port is closed",
            )),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn Transport>>> {
        // A panic while holding the lock leaves the port in an unknown state
        // but the `Option` itself is still valid.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for PortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortHandle")
            .field("open", &self.is_open())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================


#[cfg(test)]
mod tests {
    use super::testing::ScriptedPort;
    use super::*;

    #[test]
    fn closed_handle_reports_not_connected() {
        let handle = PortHandle::new();
        let mut buf = [0u8; 4];
        let err = handle.read(&mut buf, Duration::from_millis(1)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn close_from_a_clone_affects_all_handles() {
        let handle = PortHandle::with_transport(Box::new(ScriptedPort::new(b"abc")));
        let clone = handle.clone();
        assert!(handle.is_open());
        clone.close();
        assert!(!handle.is_open());
        let err = handle.write_all(b"x", Duration::from_millis(1)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn reads_and_writes_go_through() {
        let port = ScriptedPort::new(b"hello");
        let handle = PortHandle::with_transport(Box::new(port.clone()));
        let mut buf = [0u8; 16];
        let n = handle.read(&mut buf, Duration::from_millis(1)).unwrap();
        assert_eq!(&buf[..n], b"hello");
        handle.write_all(b"cmd\r", Duration::from_millis(1)).unwrap();
        assert_eq!(port.written(), "cmd\r");
    }
}
