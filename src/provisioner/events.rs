//! Transition events of the provisioning state machine, and the snapshots sent
//! to listeners on every state entry.
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use serde::Serialize;

use super::states::Status;
use crate::{
    hwspec::{HwSpec, QrCode},
    settings::Target,
};

// =============================================================================
// Public Interface
// =============================================================================

/// Events returned by state handlers to request a transition.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Event {
    /// Follow the working path out of the current state. The first transition
    /// whose guard holds is taken; when none does, the machine stays put and
    /// the handler runs again.
    Proceed,
    /// Stay in the current state and run its handler again.
    Stay,
    /// Something went wrong that reinserting the device may fix. The device
    /// is released without a provisioning record.
    Retry,
    /// The device failed. A record is submitted if it has an identity.
    Fail,
    /// The jig or the pulse board went away. Start over.
    DeviceLost,
    /// The plugged probe could not be identified.
    BadProbe,
}

/// Snapshot of the provisioner sent along every event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventData {
    pub hwspec: Option<HwSpec>,
    /// The promoted status, only updated at defined checkpoints.
    pub status: Status,
    /// Set once the device passed and its record was submitted.
    pub qrcode: Option<QrCode>,
    /// Tells the listener to clear whatever log it displays.
    pub reset_logs: bool,
    pub target: Target,
    pub manufacturer: String,
    pub test_firmware_version: Option<String>,
    pub prod_firmware_version: Option<String>,
}

/// Receives `(state_name, snapshot)` on every state entry, synchronously from
/// the provisioner's thread.
pub trait Listener: Send {
    fn on_event(&mut self, name: &str, data: &EventData);
}

impl<F> Listener for F
where
    F: FnMut(&str, &EventData) + Send,
{
    fn on_event(&mut self, name: &str, data: &EventData) {
        self(name, data)
    }
}
