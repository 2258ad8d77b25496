//! Client for the jig's line-oriented function test protocol.
//!
//! Every exchange follows the same shape:
//!
//! ```text
//!   JIG -> DEV   <command> [args...]\r
//!   DEV -> JIG   [> ]<command> [args...]\r\n     (echo, optional)
//!   DEV -> JIG   +OK\r\n  |  -ERR <reason>\r\n    (acknowledgement)
//!   DEV -> JIG   <body line>\r\n ...              (only for commands with a body)
//!   DEV -> JIG   .\r\n                            (end of body)
//! ```
//!
//! A freshly reset device also prints a boot banner: content lines enclosed
//! between two separator lines of 62 `=` characters.
//!
//! Failures are reported with [`JigClientError`], which separates transport
//! failures (the device is gone), protocol desynchronisation and explicit
//! negative acknowledgements. Callers must branch on the latter: for example a
//! failing `hwspec-load` only means that no identity has been stored yet.

mod client;
mod commands;
mod error;
mod header;

pub use client::{Body, JigClient};
pub use error::{BusError, JigClientError, Result};
pub use header::{parse_device_serial, BootHeader, HEADER_SEPARATOR_WIDTH};

pub(crate) use header::HeaderParser;
