//! Control of the device under test through the jig's reset and sense lines.
//!
//! The pulse board sits on a carrier whose reset line is driven by the jig and
//! whose presence is reported by a sense switch. Firmware is flashed by copying
//! the image onto the USB mass storage volume the on-board programmer exposes.
//! Some carriers have no sense switch; for those [`check_for_header`] detects a
//! booted board from the banner it prints on the serial port.

mod gpio;

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use thiserror::Error;

use crate::{jig_client::HeaderParser, port::PortHandle, timeout::Timeout};

pub use gpio::{CdevGpio, GpioPulseManager, InputLine, OutputLine};

// =============================================================================
// Public Interface
// =============================================================================

/// Failure to flash a firmware image.
#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("firmware image {0} not found")]
    MissingImage(PathBuf),
    #[error("programmer volume {0} not writable in time")]
    VolumeUnavailable(PathBuf),
    #[error("failed to copy firmware image: {0}")]
    Copy(#[source] io::Error),
    #[error("firmware copy thread panicked")]
    CopyPanicked,
    #[error("reset line: {0}")]
    Reset(#[source] io::Error),
}

/// The hardware side of the jig as seen by the provisioner.
pub trait PulseManager: Send {
    /// Pulse the reset line of the device.
    fn reset_device(&mut self) -> io::Result<()>;

    /// Whether a board is seated in the jig.
    fn is_connected(&self) -> bool;

    /// Block until the board has been removed.
    fn await_removal(&mut self);

    /// Call `callback` once, the next time the board is removed. Replaces any
    /// callback registered before.
    fn on_removal(&mut self, callback: Box<dyn FnOnce() + Send>);

    /// Flash `image` while holding the device in reset, then release it and
    /// wait for the device to settle.
    fn load_firmware(&mut self, image: &Path) -> Result<(), FirmwareError>;

    /// Look for a boot banner on `port` for at most `timeout`, or until
    /// `keep_going` returns `false`.
    fn check_for_header(
        &mut self,
        port: &PortHandle,
        timeout: Duration,
        keep_going: &dyn Fn() -> bool,
    ) -> io::Result<bool> {
        check_for_header(port, timeout, keep_going)
    }
}

/// Poll `port` for a complete boot banner. Returns `false` when the timeout
/// expires or `keep_going` turns `false` first. Data read is consumed.
pub fn check_for_header(
    port: &PortHandle,
    timeout: Duration,
    keep_going: &dyn Fn() -> bool,
) -> io::Result<bool> {
    const POLL_PERIOD: Duration = Duration::from_millis(50);

    let deadline = Timeout::new(timeout);
    let mut parser = HeaderParser::new();
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 128];

    while deadline.active() && keep_going() {
        let wait = deadline.time_left().map_or(POLL_PERIOD, |left| left.min(POLL_PERIOD));
        match port.read(&mut chunk, wait) {
            Ok(count) => pending.extend_from_slice(&chunk[..count]),
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => return Err(e),
        }
        while let Some(end) = pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=end).collect();
            if let Some(header) = parser.feed(String::from_utf8_lossy(&line).trim_end()) {
                log::debug!("boot header detected: {:?}", header.lines);
                return Ok(true);
            }
        }
    }
    Ok(false)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::testing::ScriptedPort;

    fn separator() -> String {
        "=".repeat(crate::jig_client::HEADER_SEPARATOR_WIDTH)
    }

    #[test]
    fn banner_is_detected() {
        let script = format!(
            "garbage\r\n{sep}\r\nStarting Functional Test Firmware\r\n{sep}\r\n",
            sep = separator()
        );
        let port = PortHandle::with_transport(Box::new(ScriptedPort::new(script.as_bytes())));
        assert!(check_for_header(&port, Duration::from_millis(200), &|| true).unwrap());
    }

    #[test]
    fn half_a_banner_times_out() {
        let script = format!("{}\r\nStarting\r\n", separator());
        let port = PortHandle::with_transport(Box::new(ScriptedPort::new(script.as_bytes())));
        assert!(!check_for_header(&port, Duration::from_millis(50), &|| true).unwrap());
    }

    #[test]
    fn cancelled_by_predicate() {
        let port = PortHandle::with_transport(Box::new(ScriptedPort::new(b"")));
        assert!(!check_for_header(&port, Duration::from_secs(10), &|| false).unwrap());
    }

    #[test]
    fn closed_port_is_an_error() {
        let port = PortHandle::new();
        assert!(check_for_header(&port, Duration::from_millis(50), &|| true).is_err());
    }
}
