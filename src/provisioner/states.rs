//! States of the provisioning state machine and the provisioning status.
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use std::fmt;

use serde::Serialize;

// =============================================================================
// Public Interface
// =============================================================================

/// Every state any provisioner variant can be in. Each variant only uses the
/// subset its transition table mentions.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum State {
    /// Open the jig's serial port, retrying until it shows up.
    WaitingForSerial,
    /// Wait for a pulse board to be seated in the jig.
    WaitingForPcb,
    /// Flash and boot the functional test firmware.
    LoadingTestFirmware,
    /// Park until the registrar is reachable.
    WaitingForNetwork,
    /// Wait for a probe to be plugged into one of the pulse board's ports.
    WaitingForTarget,
    /// Read the identity stored on the device, if any.
    LoadingDeviceRego,
    GenerateHwspec,
    /// Write the production configuration of a pulse board.
    ConfiguringDevice,
    RegisteringDevice,
    SaveHwspec,
    RunningTests,
    LoadingProdFirmware,
    SubmittingProvisioningRecord,
    WaitingForPcbRemoval,
    WaitingForTargetRemoval,
}

impl State {
    /// The name used for this state in emitted events.
    pub fn name(&self) -> &'static str {
        match self {
            State::WaitingForSerial => "waiting_for_serial",
            State::WaitingForPcb => "waiting_for_pcb",
            State::LoadingTestFirmware => "loading_test_firmware",
            State::WaitingForNetwork => "waiting_for_network",
            State::WaitingForTarget => "waiting_for_target",
            State::LoadingDeviceRego => "loading_device_rego",
            State::GenerateHwspec => "generate_hwspec",
            State::ConfiguringDevice => "configuring_device",
            State::RegisteringDevice => "registering_device",
            State::SaveHwspec => "save_hwspec",
            State::RunningTests => "running_tests",
            State::LoadingProdFirmware => "loading_prod_firmware",
            State::SubmittingProvisioningRecord => "submitting_provisioning_record",
            State::WaitingForPcbRemoval => "waiting_for_pcb_removal",
            State::WaitingForTargetRemoval => "waiting_for_target_removal",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of the provisioning of a device.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub enum Status {
    Unknown,
    InProgress,
    Passed,
    Failed,
    Retry,
    Waiting,
}

impl Status {
    /// The name reported to the registrar.
    pub fn name(&self) -> &'static str {
        match self {
            Status::Unknown => "UNKNOWN",
            Status::InProgress => "INPROGRESS",
            Status::Passed => "PASSED",
            Status::Failed => "FAILED",
            Status::Retry => "RETRY",
            Status::Waiting => "WAITING",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::Unknown
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn state_names_are_snake_case() {
    assert_eq!(State::WaitingForSerial.to_string(), "waiting_for_serial");
    assert_eq!(
        State::SubmittingProvisioningRecord.name(),
        "submitting_provisioning_record"
    );
}

#[test]
fn status_names() {
    assert_eq!(Status::default(), Status::Unknown);
    assert_eq!(Status::Passed.name(), "PASSED");
    assert_eq!(Status::InProgress.to_string(), "INPROGRESS");
}
