//! The provisioner variants: pulse boards (full, phase 1 and phase 2) and
//! probes. A variant contributes its transition table and the handlers that
//! differ between targets; the rest is shared in [`handlers`](super::handlers).

use log::{error, info, warn};

use super::{
    events::Event,
    handlers::{self, Bus, TestStep},
    state_machine::{
        has_hwspec, has_network, has_passed, no_hwspec, no_network, not_passed,
        promote_provisional_status, reset, reset_with_logs, set_status_in_progress,
        set_status_waiting, update_qrcode, Blueprint, Jig, Transition,
    },
    states::State,
};
use crate::{
    error::{Error, Result},
    hwspec::{HwSpec, ProbeSpec},
    jig_client::{BusError, JigClientError},
    settings::Target,
};

/// A kind of provisioner.
pub(crate) trait Variant: Send {
    fn name(&self) -> &'static str;

    fn blueprint(&self) -> Blueprint;

    /// Run the handler of `state`.
    fn handle(&mut self, state: State, jig: &mut Jig) -> Result<Event>;
}

pub(crate) fn for_target(target: Target) -> Box<dyn Variant> {
    match target {
        Target::Pulse => Box::new(PulseVariant { shape: Shape::Full }),
        Target::PulsePhase1 => Box::new(PulseVariant {
            shape: Shape::Phase1,
        }),
        Target::PulsePhase2 => Box::new(PulseVariant {
            shape: Shape::Phase2,
        }),
        Target::Ta3k | Target::Ta6k | Target::Ta11k => Box::new(ProbeVariant { target }),
    }
}

fn unsupported(state: State) -> Error {
    Error::Missing {
        what: "handler",
        state,
    }
}

// =============================================================================
// Pulse
// =============================================================================

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Shape {
    /// Identity, configuration, tests and production firmware.
    Full,
    /// No production firmware yet. Tests exclude LoRa.
    Phase1,
    /// Boards already provisioned in phase 1: read the identity, self test
    /// and load the production firmware.
    Phase2,
}

struct PulseVariant {
    shape: Shape,
}

impl PulseVariant {
    const STORAGE: &'static str = "pulse";

    fn loading_device_rego(&self, jig: &mut Jig) -> Result<Event> {
        let repair = jig.settings.hwspec_repair_mode;
        let rego = jig.client()?.with_platform_bus(|client| {
            if repair {
                warn!("Repair mode: destroying the stored hwspec");
                client.hwspec_destroy(Self::STORAGE)?;
            }
            let hwspec = if client.hwspec_load(Self::STORAGE)? {
                Some(HwSpec::get(client)?)
            } else {
                None
            };
            let dev_eui = client.lora_deveui()?;
            Ok((hwspec, dev_eui))
        });

        match rego {
            Ok((hwspec, dev_eui)) => {
                match &hwspec {
                    Some(hwspec) => info!("Device already registered as {}", hwspec.serial),
                    None => info!("Virgin device"),
                }
                jig.session.hwspec = hwspec;
                jig.session.dev_eui = Some(dev_eui);
                if self.shape == Shape::Phase2 && jig.session.hwspec.is_none() {
                    error!("Phase 2 needs a board provisioned in phase 1");
                    return Ok(Event::Fail);
                }
                Ok(Event::Proceed)
            }
            Err(e) => handlers::bus_failure(e, Event::Retry),
        }
    }

    fn configuring_device(&self, jig: &mut Jig) -> Result<Event> {
        let join_eui = jig.settings.profile.lora.config_join_eui.clone();
        let app_key = jig.session.app_key.clone();
        let client = jig.client()?;
        client.pulse_cfg_init()?;
        client.pulse_cfg_load()?;
        client.pulse_cfg_set_pulse("polling_rate", "1800")?;
        client.pulse_cfg_save()?;
        client.lora_config(&join_eui, &app_key)?;
        Ok(Event::Proceed)
    }

    fn running_tests(&self, jig: &mut Jig) -> Result<Event> {
        let self_test: (&str, TestStep) = ("self test", |jig: &mut Jig| Ok(jig.client()?.test_self()?));
        let port_test: (&str, TestStep) = ("port test", |jig: &mut Jig| Ok(jig.client()?.test_port()?));
        let lora_test: (&str, TestStep) = ("lora test", |jig: &mut Jig| {
            let lora = jig.settings.profile.lora.clone();
            let client = jig.client()?;
            Ok(client.test_lora_connect(
                lora.test_sub_band,
                &lora.test_join_eui,
                &lora.test_app_key,
            )?)
        });
        match self.shape {
            Shape::Full => handlers::running_tests(jig, &[self_test, port_test, lora_test]),
            Shape::Phase1 => handlers::running_tests(jig, &[self_test, port_test]),
            Shape::Phase2 => handlers::running_tests(jig, &[self_test]),
        }
    }
}

impl Variant for PulseVariant {
    fn name(&self) -> &'static str {
        match self.shape {
            Shape::Full => "pulse",
            Shape::Phase1 => "pulse phase 1",
            Shape::Phase2 => "pulse phase 2",
        }
    }

    fn blueprint(&self) -> Blueprint {
        use State::*;

        let mut proceed = vec![
            Transition::new(WaitingForSerial, WaitingForPcb),
            Transition::new(WaitingForPcb, LoadingTestFirmware)
                .when(has_network)
                .before(reset),
            Transition::new(WaitingForPcb, WaitingForNetwork).when(no_network),
            Transition::new(WaitingForNetwork, WaitingForPcb).when(has_network),
            Transition::new(LoadingTestFirmware, LoadingDeviceRego).when(has_network),
            Transition::new(LoadingTestFirmware, WaitingForNetwork).when(no_network),
            Transition::new(LoadingDeviceRego, RunningTests).when(has_hwspec),
        ];
        if self.shape != Shape::Phase2 {
            proceed.extend(vec![
                Transition::new(LoadingDeviceRego, GenerateHwspec).when(no_hwspec),
                Transition::new(GenerateHwspec, ConfiguringDevice),
                Transition::new(ConfiguringDevice, RegisteringDevice),
                Transition::new(RegisteringDevice, SaveHwspec),
                Transition::new(SaveHwspec, RunningTests),
            ]);
        }
        if self.shape == Shape::Phase1 {
            proceed.push(Transition::new(RunningTests, SubmittingProvisioningRecord));
        } else {
            proceed.extend(vec![
                Transition::new(RunningTests, LoadingProdFirmware).when(has_passed),
                Transition::new(RunningTests, SubmittingProvisioningRecord).when(not_passed),
                Transition::new(LoadingProdFirmware, SubmittingProvisioningRecord),
            ]);
        }
        proceed.extend(vec![
            Transition::new(SubmittingProvisioningRecord, WaitingForPcbRemoval)
                .before(update_qrcode),
            Transition::new(WaitingForPcbRemoval, WaitingForSerial),
        ]);

        Blueprint {
            initial: WaitingForSerial,
            proceed,
            retry_to: WaitingForPcbRemoval,
            fail_with_hwspec: SubmittingProvisioningRecord,
            fail_without_hwspec: WaitingForPcbRemoval,
            device_lost_to: WaitingForSerial,
            bad_probe_to: None,
            on_enter: vec![
                (WaitingForSerial, reset),
                (WaitingForPcb, set_status_waiting),
                (LoadingDeviceRego, set_status_in_progress),
                (WaitingForPcbRemoval, promote_provisional_status),
            ],
            on_exit: vec![(WaitingForPcbRemoval, reset_with_logs)],
        }
    }

    fn handle(&mut self, state: State, jig: &mut Jig) -> Result<Event> {
        match state {
            State::WaitingForSerial => handlers::waiting_for_serial(jig),
            State::WaitingForPcb if self.shape == Shape::Phase2 => {
                handlers::waiting_for_pcb_banner(jig)
            }
            State::WaitingForPcb => handlers::waiting_for_pcb(jig),
            State::LoadingTestFirmware => handlers::loading_test_firmware(jig),
            State::WaitingForNetwork => handlers::waiting_for_network(jig),
            State::LoadingDeviceRego => self.loading_device_rego(jig),
            State::GenerateHwspec => handlers::generate_hwspec(jig),
            State::ConfiguringDevice => self.configuring_device(jig),
            State::RegisteringDevice => handlers::registering_device(jig),
            State::SaveHwspec => handlers::save_hwspec(jig, Self::STORAGE, Bus::Platform),
            State::RunningTests => self.running_tests(jig),
            State::LoadingProdFirmware => handlers::loading_prod_firmware(jig),
            State::SubmittingProvisioningRecord => handlers::submitting_provisioning_record(jig),
            State::WaitingForPcbRemoval => handlers::waiting_for_pcb_removal(jig),
            State::WaitingForTarget | State::WaitingForTargetRemoval => Err(unsupported(state)),
        }
    }
}

// =============================================================================
// Probes
// =============================================================================

/// Probes are plugged, one after the other, into the external ports of a
/// pulse board running the test firmware. The pulse board stays seated for
/// the whole session.
struct ProbeVariant {
    target: Target,
}

impl ProbeVariant {
    const STORAGE: &'static str = "probe";

    /// A failure to enable the port means the pulse board itself is in
    /// trouble. A failure while accessing the probe fails the probe.
    fn loading_device_rego(&self, jig: &mut Jig) -> Result<Event> {
        let port_no = jig.port_no()?;
        let repair = jig.settings.hwspec_repair_mode;
        let rego = jig.client()?.with_external_port(port_no, |client| {
            if repair {
                warn!("Repair mode: destroying the stored hwspec");
                client.hwspec_destroy(Self::STORAGE)?;
            }
            if client.hwspec_load(Self::STORAGE)? {
                Ok(Some(HwSpec::get(client)?))
            } else {
                Ok(None)
            }
        });

        match rego {
            Ok(hwspec) => {
                match &hwspec {
                    Some(hwspec) => info!("Probe already registered as {}", hwspec.serial),
                    None => info!("Virgin probe"),
                }
                jig.session.hwspec = hwspec;
                Ok(Event::Proceed)
            }
            Err(BusError::Enable(e)) => {
                error!("Could not reach port {}: {}", port_no, e);
                Ok(Event::DeviceLost)
            }
            Err(BusError::Access(e @ JigClientError::DeviceLost(_))) => Err(e.into()),
            Err(BusError::Access(e)) => {
                error!("{}", e);
                Ok(Event::Fail)
            }
        }
    }

    /// Run the analog test of the probe, then write its cable length.
    fn running_tests(&self, jig: &mut Jig) -> Result<Event> {
        let analog_test: TestStep = match self.target {
            Target::Ta6k => test_ta6k,
            Target::Ta11k => test_ta11k,
            _ => test_ta3k,
        };
        let cable_length: TestStep = write_cable_length;
        handlers::running_tests(
            jig,
            &[(self.target.name(), analog_test), ("cable length", cable_length)],
        )
    }
}

fn test_ta3k(jig: &mut Jig) -> Result<bool> {
    let port_no = jig.port_no()?;
    Ok(jig.client()?.test_ta3k(port_no)?)
}

fn test_ta6k(jig: &mut Jig) -> Result<bool> {
    let port_no = jig.port_no()?;
    Ok(jig.client()?.test_ta6k(port_no)?)
}

fn test_ta11k(jig: &mut Jig) -> Result<bool> {
    let port_no = jig.port_no()?;
    Ok(jig.client()?.test_ta11k(port_no)?)
}

/// Store the configured cable length in the probe's `probe` chunk. Probes
/// without a configured length keep whatever they have.
fn write_cable_length(jig: &mut Jig) -> Result<bool> {
    let meters = match jig.settings.profile.mode.cable_length {
        Some(meters) => meters,
        None => return Ok(true),
    };
    let port_no = jig.port_no()?;
    let spec = ProbeSpec::from_meters(meters);
    let written = jig.client()?.with_external_port(port_no, |client| {
        spec.save(client)?;
        Ok(ProbeSpec::get(client)? == spec)
    });
    match written {
        Ok(matches) => Ok(matches),
        Err(e) => match e.into_inner() {
            e @ JigClientError::DeviceLost(_) => Err(e.into()),
            e => {
                error!("Could not write the cable length: {}", e);
                Ok(false)
            }
        },
    }
}

impl Variant for ProbeVariant {
    fn name(&self) -> &'static str {
        self.target.name()
    }

    fn blueprint(&self) -> Blueprint {
        use State::*;

        Blueprint {
            initial: WaitingForSerial,
            proceed: vec![
                Transition::new(WaitingForSerial, WaitingForPcb),
                Transition::new(WaitingForPcb, LoadingTestFirmware),
                Transition::new(LoadingTestFirmware, WaitingForTarget),
                Transition::new(WaitingForTarget, LoadingDeviceRego),
                Transition::new(LoadingDeviceRego, RunningTests).when(has_hwspec),
                Transition::new(LoadingDeviceRego, GenerateHwspec).when(no_hwspec),
                Transition::new(GenerateHwspec, RegisteringDevice),
                Transition::new(RegisteringDevice, SaveHwspec),
                Transition::new(SaveHwspec, RunningTests),
                Transition::new(RunningTests, SubmittingProvisioningRecord),
                Transition::new(SubmittingProvisioningRecord, WaitingForTargetRemoval)
                    .before(update_qrcode),
                Transition::new(WaitingForTargetRemoval, WaitingForTarget),
            ],
            retry_to: WaitingForTargetRemoval,
            fail_with_hwspec: SubmittingProvisioningRecord,
            fail_without_hwspec: WaitingForTargetRemoval,
            device_lost_to: WaitingForSerial,
            bad_probe_to: Some(WaitingForTargetRemoval),
            on_enter: vec![
                (WaitingForSerial, reset),
                (WaitingForTarget, set_status_waiting),
                (LoadingDeviceRego, set_status_in_progress),
                (WaitingForTargetRemoval, promote_provisional_status),
            ],
            on_exit: vec![(WaitingForTarget, reset_with_logs)],
        }
    }

    fn handle(&mut self, state: State, jig: &mut Jig) -> Result<Event> {
        match state {
            State::WaitingForSerial => handlers::waiting_for_serial(jig),
            State::WaitingForPcb => handlers::waiting_for_pcb(jig),
            State::LoadingTestFirmware => handlers::loading_test_firmware(jig),
            State::WaitingForTarget => handlers::waiting_for_target(jig),
            State::LoadingDeviceRego => self.loading_device_rego(jig),
            State::GenerateHwspec => handlers::generate_hwspec(jig),
            State::RegisteringDevice => handlers::registering_device(jig),
            State::SaveHwspec => {
                let port_no = jig.port_no()?;
                handlers::save_hwspec(jig, Self::STORAGE, Bus::External(port_no))
            }
            State::RunningTests => self.running_tests(jig),
            State::SubmittingProvisioningRecord => handlers::submitting_provisioning_record(jig),
            State::WaitingForTargetRemoval => handlers::waiting_for_target_removal(jig),
            State::WaitingForNetwork
            | State::ConfiguringDevice
            | State::LoadingProdFirmware
            | State::WaitingForPcbRemoval => Err(unsupported(state)),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(blueprint: &Blueprint, from: State) -> Vec<State> {
        blueprint
            .proceed
            .iter()
            .filter(|t| t.from == from)
            .map(|t| t.to)
            .collect()
    }

    #[test]
    fn every_target_has_a_variant() {
        for target in Target::ALL.iter() {
            let variant = for_target(*target);
            assert_eq!(variant.blueprint().initial, State::WaitingForSerial);
        }
    }

    #[test]
    fn full_pulse_loads_prod_firmware_on_pass() {
        let blueprint = for_target(Target::Pulse).blueprint();
        assert_eq!(
            targets(&blueprint, State::RunningTests),
            vec![State::LoadingProdFirmware, State::SubmittingProvisioningRecord]
        );
        assert_eq!(
            targets(&blueprint, State::LoadingDeviceRego),
            vec![State::RunningTests, State::GenerateHwspec]
        );
    }

    #[test]
    fn phase_1_never_loads_prod_firmware() {
        let blueprint = for_target(Target::PulsePhase1).blueprint();
        assert!(blueprint
            .proceed
            .iter()
            .all(|t| t.to != State::LoadingProdFirmware));
        assert_eq!(
            targets(&blueprint, State::RunningTests),
            vec![State::SubmittingProvisioningRecord]
        );
    }

    #[test]
    fn phase_2_never_generates_identity() {
        let blueprint = for_target(Target::PulsePhase2).blueprint();
        assert!(blueprint.proceed.iter().all(|t| t.to != State::GenerateHwspec
            && t.to != State::RegisteringDevice
            && t.to != State::SaveHwspec));
    }

    #[test]
    fn probe_cycle_returns_to_target_wait() {
        let blueprint = for_target(Target::Ta6k).blueprint();
        assert_eq!(
            targets(&blueprint, State::WaitingForTargetRemoval),
            vec![State::WaitingForTarget]
        );
        assert_eq!(blueprint.retry_to, State::WaitingForTargetRemoval);
        assert_eq!(blueprint.bad_probe_to, Some(State::WaitingForTargetRemoval));
        assert!(targets(&blueprint, State::GenerateHwspec) == vec![State::RegisteringDevice]);
    }

    #[test]
    fn failures_route_by_identity() {
        for target in Target::ALL.iter() {
            let blueprint = for_target(*target).blueprint();
            assert_eq!(blueprint.fail_with_hwspec, State::SubmittingProvisioningRecord);
            assert_ne!(blueprint.fail_without_hwspec, State::SubmittingProvisioningRecord);
            assert_eq!(blueprint.device_lost_to, State::WaitingForSerial);
        }
    }
}
