//! Helper functions to deal with serial ports.

mod ports;

pub use ports::{find_device, select_port};
pub(crate) use ports::open_and_setup_port;
