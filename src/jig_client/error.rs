//! Errors reported by the [`JigClient`](super::JigClient).

use std::io;

use thiserror::Error;

/// The three failure classes of the function test protocol.
#[derive(Debug, Error)]
pub enum JigClientError {
    /// The serial port failed or was closed (usually the board was removed).
    /// Fatal to the current protocol session.
    #[error("device lost: {0}")]
    DeviceLost(#[from] io::Error),

    /// The device did not follow the protocol: bad echo, missing
    /// acknowledgement or missing end of body marker before the timeout.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The device answered with `-ERR <reason>`. Often an expected outcome.
    #[error("command failed: {0}")]
    CommandFailed(String),
}

impl JigClientError {
    pub fn is_device_lost(&self) -> bool {
        matches!(self, JigClientError::DeviceLost(_))
    }

    pub fn is_command_failed(&self) -> bool {
        matches!(self, JigClientError::CommandFailed(_))
    }
}

pub type Result<T> = std::result::Result<T, JigClientError>;

/// Failure while accessing a bus that has to be bracketed by enable/disable
/// commands. Tells apart a failure to open the bus from a failure while it was
/// open, as the two point at different hardware.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("could not enable the bus: {0}")]
    Enable(#[source] JigClientError),
    #[error("bus access failed: {0}")]
    Access(#[source] JigClientError),
}

impl BusError {
    pub fn into_inner(self) -> JigClientError {
        match self {
            BusError::Enable(e) | BusError::Access(e) => e,
        }
    }
}
