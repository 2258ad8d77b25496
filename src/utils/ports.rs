//! Serial port device discovery and setup.

use console::{style, Term};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use serialport::{available_ports, SerialPort, SerialPortInfo, SerialPortType};

use std::{thread, time::Duration};

use crate::Settings;

//==============================================================================
// Public Interface
//==============================================================================

/// Find the first attached serial device whose USB vendor and product
/// identifiers match, and return its path (e.g. `/dev/ttyACM1`).
pub fn find_device(vid: u16, pid: u16) -> Option<String> {
    match available_ports() {
        Ok(ports) => match_device(&ports, vid, pid),
        Err(ref e) => {
            info!("error: {}", e.to_string());
            None
        }
    }
}

/// Wait for the jig's serial controller to be attached. If it does not show up
/// within a few seconds, fall back to presenting the list of connected devices
/// so that the operator can pick one.
pub fn select_port(vid: u16, pid: u16) -> Option<String> {
    let pb = spinner();

    // Avoid cursor flicker during the waiting
    let _ = Term::stdout().hide_cursor();
    let mut attempt: usize = 1;
    let waiting_period: usize = 1;
    let found = loop {
        if let Some(path) = find_device(vid, pid) {
            break Some(path);
        }
        let found_ports = enumerate_usb_serial_ports();
        if attempt > 5 && !found_ports.is_empty() {
            break None;
        }
        pb.set_message(format!(
            "[{:03}s {}] ⌛ Waiting for jig serial controller {:04x}:{:04x}...",
            style(attempt * waiting_period).dim(),
            found_ports.len(),
            vid,
            pid
        ));
        attempt += 1;
        thread::sleep(Duration::from_secs(waiting_period as u64));
    };
    let _ = Term::stdout().show_cursor();

    let selection = match found {
        Some(path) => Some(path),
        None => {
            pb.finish_with_message("Select a port to be used:");
            select_port_interactive(&enumerate_usb_serial_ports())
        }
    };
    match &selection {
        Some(path) => {
            pb.finish_with_message(format!("👍 Serial port {} is ready", style(path).green()));
        }
        None => {
            pb.finish_with_message("❌ Selection canceled");
        }
    }
    selection
}

pub(crate) fn open_and_setup_port(
    settings: &Settings,
) -> Result<Box<dyn SerialPort>, serialport::Error> {
    use retry::{delay, retry_with_index};

    let path = settings.path.clone().ok_or_else(|| {
        serialport::Error::new(serialport::ErrorKind::NoDevice, "no serial device configured")
    })?;

    let result = retry_with_index(
        delay::Fixed::from_millis(1000).take(4),
        |index| -> Result<Box<dyn SerialPort>, serialport::Error> {
            debug!("Trying to connect {}", index);
            serialport::new(&path, settings.baud_rate)
                .data_bits(settings.data_bits)
                .stop_bits(settings.stop_bits)
                .parity(settings.parity)
                .flow_control(settings.flow_control)
                .open()
        },
    );
    match result {
        Ok(mut port) => {
            // Configure the port again with the values in `settings` as not all
            // drivers honour the builder.
            port.set_baud_rate(settings.baud_rate)?;
            port.set_data_bits(settings.data_bits)?;
            port.set_stop_bits(settings.stop_bits)?;
            port.set_parity(settings.parity)?;
            port.set_flow_control(settings.flow_control)?;

            let baud_rate = port.baud_rate()?;
            info!(
                "Connected to {} at {} baud",
                port.name().unwrap_or_else(|| path.clone()),
                baud_rate
            );
            debug!("data_bits    : {:#?}", port.data_bits()?);
            debug!("stop_bits    : {:#?}", port.stop_bits()?);
            debug!("parity       : {:#?}", port.parity()?);
            debug!("flow control : {:#?}", port.flow_control()?);

            if baud_rate != settings.baud_rate {
                return Err(serialport::Error::new(
                    serialport::ErrorKind::InvalidInput,
                    format!(
                        "failed to set the baud rate to {}, got {}",
                        settings.baud_rate, baud_rate
                    ),
                ));
            }

            Ok(port)
        }
        Err(err) => match err {
            retry::Error::Operation {
                error,
                total_delay,
                tries,
            } => {
                warn!(
                    "Failed to open the port after {:?} and {} tries: {}",
                    total_delay, tries, error,
                );
                Err(error)
            }
            retry::Error::Internal(_) => {
                info!("Internal retry error while opening port");
                Err(serialport::Error::new(
                    serialport::ErrorKind::Unknown,
                    "internal error while retrying to open the port",
                ))
            }
        },
    }
}

//==============================================================================
// Private stuff
//==============================================================================

fn spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.enable_steady_tick(120);
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_strings(&["⠋", "⠙", "⠚", "⠞", "⠖", "⠦", "⠴", "⠲", "⠳", "⠓"])
            .template("[JIG] {spinner:.blue} {msg}"),
    );
    pb
}

fn match_device(ports: &[SerialPortInfo], vid: u16, pid: u16) -> Option<String> {
    ports.iter().find_map(|p| match &p.port_type {
        SerialPortType::UsbPort(info) if info.vid == vid && info.pid == pid => {
            Some(p.port_name.clone())
        }
        _ => None,
    })
}

/// Enumerates serial devices of type USB on the system
fn enumerate_usb_serial_ports() -> Vec<String> {
    let mut usb_ports = vec![];
    match available_ports() {
        Ok(ports) => {
            for p in ports {
                match p.port_type {
                    // USB ports give us more info about the connected serial
                    // controller
                    SerialPortType::UsbPort(info) => {
                        let extended_name = format!(
                            "{}: ({} / {})",
                            p.port_name,
                            info.manufacturer.as_ref().map_or("", String::as_str),
                            info.product.as_ref().map_or("", String::as_str)
                        );
                        usb_ports.push(extended_name);
                    }
                    // Virtual ports are handy for testing against a simulator
                    _ => {
                        usb_ports.push(p.port_name);
                    }
                }
            }
        }
        Err(ref e) => {
            info!("error: {}", e.to_string());
        }
    }
    usb_ports
}

fn select_port_interactive(ports: &[String]) -> Option<String> {
    use dialoguer::{theme::ColorfulTheme, Select};

    if ports.is_empty() {
        return None;
    }

    let term = Term::buffered_stderr();
    let theme = ColorfulTheme::default();

    let mut select = Select::with_theme(&theme);
    for item in ports {
        select.item(item);
    }

    let selection = select.default(0).interact_on_opt(&term).ok()??;
    ports
        .get(selection)
        .and_then(|x| x.split(':').next())
        .map(String::from)
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::UsbPortInfo;

    fn usb(name: &str, vid: u16, pid: u16) -> SerialPortInfo {
        SerialPortInfo {
            port_name: name.into(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid,
                pid,
                serial_number: None,
                manufacturer: None,
                product: None,
            }),
        }
    }

    #[test]
    fn matches_vendor_and_product() {
        let ports = vec![
            SerialPortInfo {
                port_name: "/dev/ttyS0".into(),
                port_type: SerialPortType::Unknown,
            },
            usb("/dev/ttyUSB0", 0x0403, 0x6001),
            usb("/dev/ttyACM1", 0x0D28, 0x0204),
        ];
        assert_eq!(
            match_device(&ports, 0x0D28, 0x0204).as_deref(),
            Some("/dev/ttyACM1")
        );
    }

    #[test]
    fn no_match() {
        let ports = vec![usb("/dev/ttyUSB0", 0x0403, 0x6001)];
        assert_eq!(match_device(&ports, 0x0D28, 0x0204), None);
        assert_eq!(match_device(&[], 0x0D28, 0x0204), None);
    }
}
