//! Framing of the function test protocol over a [`PortHandle`].

use std::{io, time::Duration};

use hexplay::HexViewBuilder;
use log::{debug, log_enabled, trace, Level::Trace};

use super::{
    error::{JigClientError, Result},
    header::{BootHeader, HeaderParser},
};
use crate::{port::PortHandle, settings::ProtocolTimeouts, timeout::Timeout};

const LINE_TERMINATOR: char = '\r';
const PROMPT: &str = "> ";
const ACK_OK: &str = "+OK";
const ACK_ERR: &str = "-ERR";
const END_OF_BODY: &str = ".";
const SUCCESS_TOKEN: &str = "PASS";

/// Longest single wait on the port. Unbounded reads poll in slices of this so
/// a closed port is noticed promptly.
const POLL_PERIOD: Duration = Duration::from_millis(100);

// =============================================================================
// Public Interface
// =============================================================================

/// How the body of a command response is read.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Body {
    /// The command only gets an acknowledgement.
    None,
    /// Body lines must be terminated by `.` within the given time. Empty lines
    /// are kept.
    Within(Duration),
    /// Wait as long as it takes for the `.` line, e.g. for commands waiting on
    /// a physical action. Empty lines are dropped.
    Unbounded,
}

/// Client for the function test protocol.
///
/// All communication with the device is recorded verbatim and can be
/// retrieved with [`log`](JigClient::log), e.g. to be attached to the
/// provisioning record.
#[derive(Debug)]
pub struct JigClient {
    port: PortHandle,
    timeouts: ProtocolTimeouts,
    /// Bytes received but not yet consumed as complete lines.
    rx: Vec<u8>,
    log: String,
    last_error: Option<String>,
}

impl JigClient {
    pub fn new(port: PortHandle, timeouts: ProtocolTimeouts) -> Self {
        JigClient {
            port,
            timeouts,
            rx: Vec::with_capacity(256),
            log: String::new(),
            last_error: None,
        }
    }

    pub fn timeouts(&self) -> &ProtocolTimeouts {
        &self.timeouts
    }

    /// Transcript of everything written and read, terminators included.
    pub fn log(&self) -> &str {
        &self.log
    }

    /// Forget the transcript recorded so far.
    pub fn reset_log(&mut self) {
        self.log.clear();
    }

    /// Description of the last command failure, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Send `cmd` and parse the echo, acknowledgement and, depending on `body`,
    /// the response body. Returns the body lines joined with `\n` (empty for
    /// [`Body::None`]).
    pub fn send_command(&mut self, cmd: &str, body: Body) -> Result<String> {
        let result = self.exchange(cmd, body);
        if let Err(ref e) = result {
            self.last_error = Some(format!("{}: {}", cmd, e));
        }
        result
    }

    /// Run a test command and report whether it passed: the last non-empty
    /// line of its body must be `PASS`.
    pub fn run_test_cmd(&mut self, cmd: &str) -> Result<bool> {
        let body = self.send_command(cmd, Body::Within(self.timeouts.test))?;
        let passed = is_response_successful(&body);
        debug!("{} -> {}", cmd, if passed { "PASS" } else { "FAIL" });
        Ok(passed)
    }

    /// Wait for the boot banner a freshly reset device prints and return its
    /// content.
    pub fn read_boot_header(&mut self) -> Result<BootHeader> {
        let timeout = Timeout::new(self.timeouts.boot_header);
        let mut parser = HeaderParser::new();
        loop {
            match self.read_line(&timeout)? {
                Some(line) => {
                    if let Some(header) = parser.feed(&line) {
                        return Ok(header);
                    }
                }
                None => {
                    return Err(JigClientError::Protocol(
                        "boot header not received".into(),
                    ))
                }
            }
        }
    }

    /// Consume the boot banner a freshly reset device prints.
    pub fn skip_boot_header(&mut self) -> Result<()> {
        self.read_boot_header().map(|_| ())
    }

    /// Read everything the device prints until `timeout` expires.
    pub fn read_available(&mut self, timeout: Duration) -> Result<String> {
        let timeout = Timeout::new(timeout);
        let mut lines = Vec::new();
        while let Some(line) = self.read_line(&timeout)? {
            lines.push(line);
        }
        Ok(lines.join("\n"))
    }

    // -------------------------------------------------------------------------
    // Line level
    // -------------------------------------------------------------------------

    /// Read the next complete line, terminator stripped. `None` when the
    /// timeout expires first; partial data is kept for the next read.
    pub(crate) fn read_line(&mut self, timeout: &Timeout) -> Result<Option<String>> {
        let mut chunk = [0u8; 256];
        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }
            let wait = match timeout.time_left() {
                Some(left) if left == Duration::from_secs(0) => return Ok(None),
                Some(left) => left.min(POLL_PERIOD),
                None => POLL_PERIOD,
            };
            match self.port.read(&mut chunk, wait) {
                Ok(count) => {
                    if count > 0 {
                        if log_enabled!(Trace) {
                            let view = HexViewBuilder::new(&chunk[..count])
                                .address_offset(0)
                                .row_width(16)
                                .finish();
                            trace!("received {} bytes\n{}", count, view);
                        }
                        self.rx.extend_from_slice(&chunk[..count]);
                    }
                }
                Err(ref e) if is_timeout(e) => {}
                Err(e) => return Err(JigClientError::DeviceLost(e)),
            }
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.rx.iter().position(|b| *b == b'\n')?;
        let raw: Vec<u8> = self.rx.drain(..=end).collect();
        let raw = String::from_utf8_lossy(&raw);
        self.log.push_str(&raw);
        let line = raw.trim_end_matches(&['\r', '\n'][..]);
        if !line.is_empty() {
            debug!("DEV: {}", line);
        }
        Some(line.to_owned())
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        debug!("JIG: {}", line);
        let mut line = line.to_owned();
        line.push(LINE_TERMINATOR);
        self.port
            .write_all(line.as_bytes(), self.timeouts.write)
            .map_err(JigClientError::DeviceLost)?;
        self.log.push_str(&line);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Command level
    // -------------------------------------------------------------------------

    fn exchange(&mut self, cmd: &str, body: Body) -> Result<String> {
        self.write_line(cmd)?;

        let first = self.read_line(&Timeout::new(self.timeouts.ack))?;
        let first = first.unwrap_or_default();
        let ack = if strip_prompt(&first) == cmd {
            let ack = self.read_line(&Timeout::new(self.timeouts.ack))?;
            ack.unwrap_or_default()
        } else if is_ack(&first) {
            // The peer does not echo commands.
            first
        } else {
            return Err(JigClientError::Protocol(format!(
                "line not echoed back: {}",
                first
            )));
        };
        parse_ack(&ack)?;

        match body {
            Body::None => Ok(String::new()),
            Body::Within(limit) => self.read_body(Timeout::new(limit), true),
            Body::Unbounded => self.read_body(Timeout::never(), false),
        }
    }

    fn read_body(&mut self, timeout: Timeout, keep_empty: bool) -> Result<String> {
        let mut lines: Vec<String> = Vec::new();
        loop {
            match self.read_line(&timeout)? {
                Some(line) if line == END_OF_BODY => return Ok(lines.join("\n")),
                Some(line) => {
                    if keep_empty || !line.is_empty() {
                        lines.push(line);
                    }
                }
                None => {
                    return Err(JigClientError::Protocol(
                        "did not receive end of body marker".into(),
                    ))
                }
            }
        }
    }
}

// =============================================================================
// Private stuff
// =============================================================================

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn strip_prompt(line: &str) -> &str {
    line.trim_start_matches(|c| PROMPT.contains(c))
}

fn is_ack(line: &str) -> bool {
    line == ACK_OK || line.starts_with(ACK_ERR)
}

fn parse_ack(ack: &str) -> Result<()> {
    if let Some(reason) = ack.strip_prefix(ACK_ERR) {
        Err(JigClientError::CommandFailed(reason.trim().to_owned()))
    } else if ack == ACK_OK {
        Ok(())
    } else {
        Err(JigClientError::Protocol(format!(
            "command not acknowledged: {}",
            ack
        )))
    }
}

fn is_response_successful(body: &str) -> bool {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        == Some(SUCCESS_TOKEN)
}

// =============================================================================
// Unit Tests
// =============================================================================
