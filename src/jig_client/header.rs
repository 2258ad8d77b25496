//! Boot banner recognition.
//!
//! After a reset the firmware prints a fixed-shape block:
//!
//! ```text
//! ==============================================================
//! Starting Functional Test Firmware
//! Firmware Version: 1.4.2
//! ==============================================================
//! ```

pub const HEADER_SEPARATOR_WIDTH: usize = 62;

/// Upper bound on the banner size, past which we assume we locked onto a
/// stray separator and start over.
const MAX_HEADER_LINES: usize = 64;

const FIRMWARE_VERSION_PREFIX: &str = "Firmware Version:";
const DEVICE_SERIAL_PREFIX: &str = "Serial:";

fn is_separator(line: &str) -> bool {
    line.len() == HEADER_SEPARATOR_WIDTH && line.bytes().all(|b| b == b'=')
}

/// The content lines of a boot banner, separators excluded.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct BootHeader {
    pub lines: Vec<String>,
}

impl BootHeader {
    pub fn contains(&self, marker: &str) -> bool {
        self.lines.iter().any(|line| line.contains(marker))
    }

    /// The version announced on the `Firmware Version:` line, if any.
    pub fn firmware_version(&self) -> Option<String> {
        self.lines
            .iter()
            .rev()
            .find_map(|line| line.strip_prefix(FIRMWARE_VERSION_PREFIX))
            .map(|version| version.trim().to_owned())
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

#[derive(Debug)]
enum Scan {
    Seeking,
    Collecting(Vec<String>),
}

/// Incremental banner recogniser fed one line at a time.
#[derive(Debug)]
pub(crate) struct HeaderParser {
    scan: Scan,
}

impl HeaderParser {
    pub(crate) fn new() -> Self {
        HeaderParser { scan: Scan::Seeking }
    }

    /// Feed the next received line (terminator stripped). Returns the banner
    /// once its closing separator has been seen.
    pub(crate) fn feed(&mut self, line: &str) -> Option<BootHeader> {
        let line = line.trim_end();
        match &mut self.scan {
            Scan::Seeking => {
                if is_separator(line) {
                    self.scan = Scan::Collecting(Vec::new());
                }
                None
            }
            Scan::Collecting(lines) => {
                if is_separator(line) {
                    let lines = std::mem::take(lines);
                    self.scan = Scan::Seeking;
                    return Some(BootHeader { lines });
                }
                if lines.len() == MAX_HEADER_LINES {
                    log::debug!("boot header too long, rescanning");
                    self.scan = Scan::Seeking;
                    return None;
                }
                lines.push(line.to_owned());
                None
            }
        }
    }
}

/// Extract the device serial printed by the production firmware as a
/// `Serial: <sn>` line.
pub fn parse_device_serial(text: &str) -> Option<String> {
    text.lines()
        .find_map(|line| line.trim().strip_prefix(DEVICE_SERIAL_PREFIX))
        .map(|serial| serial.trim().to_owned())
        .filter(|serial| !serial.is_empty())
}

// =============================================================================
// Unit Tests
// =============================================================================
