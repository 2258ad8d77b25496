//! Crate level error type.

use std::io;

use thiserror::Error;

use crate::{
    hwspec::HwSpecError,
    jig_client::{BusError, JigClientError},
    provisioner::State,
    pulse_manager::FirmwareError,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Client(#[from] JigClientError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    HwSpec(#[from] HwSpecError),
    #[error(transparent)]
    Firmware(#[from] FirmwareError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid settings: {0}")]
    Settings(String),
    /// A handler needed something an earlier state should have set up.
    #[error("no {what} in state {state}")]
    Missing { what: &'static str, state: State },
}

pub type Result<T> = std::result::Result<T, Error>;
