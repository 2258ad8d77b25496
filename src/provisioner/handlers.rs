//! State handlers shared by the provisioner variants.
//!
//! Each handler does the work of one state and returns the [`Event`] deciding
//! the transition. Errors bubble up to the run loop which treats them as a
//! lost device.

use std::{sync::atomic::Ordering, time::Duration};

use log::{debug, error, info, warn};

use super::{events::Event, state_machine::Jig, states::Status};
use crate::{
    error::Result,
    hwspec::HwSpec,
    jig_client::{
        parse_device_serial, BootHeader, BusError, JigClient, JigClientError,
        Result as ClientResult,
    },
    registrar::{ExtraFields, ProvisioningRecord},
};

const SERIAL_RETRY_PERIOD: Duration = Duration::from_secs(1);
const NETWORK_POLL_PERIOD: Duration = Duration::from_secs(1);
const HEADER_POLL_PERIOD: Duration = Duration::from_secs(1);

/// One functional test. `false` means the device failed it.
pub(crate) type TestStep = fn(&mut Jig) -> Result<bool>;

/// The bus an identity memory sits on.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Bus {
    /// The pulse board's own EEPROM.
    Platform,
    /// The EEPROM of the probe on an external port.
    External(u8),
}

impl Bus {
    pub(crate) fn access<T>(
        self,
        client: &mut JigClient,
        access: impl FnOnce(&mut JigClient) -> ClientResult<T>,
    ) -> std::result::Result<T, BusError> {
        match self {
            Bus::Platform => client.with_platform_bus(access),
            Bus::External(port_number) => client.with_external_port(port_number, access),
        }
    }
}

/// (Re)open the jig's serial port.
pub(crate) fn waiting_for_serial(jig: &mut Jig) -> Result<Event> {
    jig.client = None;
    jig.port.close();
    loop {
        match jig.opener.open() {
            Ok(transport) => {
                jig.port.attach(transport);
                return Ok(Event::Proceed);
            }
            Err(e) => {
                error!("{}", e);
                info!("Retrying...");
                if !jig.pause(SERIAL_RETRY_PERIOD) {
                    return Ok(Event::Stay);
                }
            }
        }
    }
}

/// Wait for the sense switch, then arrange for the port to be closed as soon
/// as the board is pulled out. Whatever the machine is doing at that point
/// then fails with an I/O error and the run loop starts over.
pub(crate) fn waiting_for_pcb(jig: &mut Jig) -> Result<Event> {
    if !jig.wait_until(|jig| jig.pulse.is_connected()) {
        return Ok(Event::Stay);
    }
    let port = jig.port.clone();
    jig.pulse.on_removal(Box::new(move || port.close()));
    Ok(Event::Proceed)
}

/// Wait for a board on carriers without a reliable sense switch. A board is
/// also recognised from the banner it prints when powered.
pub(crate) fn waiting_for_pcb_banner(jig: &mut Jig) -> Result<Event> {
    let running = jig.running_flag();
    let keep_going = move || running.load(Ordering::SeqCst);
    loop {
        if !jig.is_running() {
            return Ok(Event::Stay);
        }
        if jig.pulse.is_connected() {
            return Ok(Event::Proceed);
        }
        let port = jig.port.clone();
        if jig.pulse.check_for_header(&port, HEADER_POLL_PERIOD, &keep_going)? {
            return Ok(Event::Proceed);
        }
    }
}

/// Flash and boot the functional test firmware and open the protocol
/// session with it.
pub(crate) fn loading_test_firmware(jig: &mut Jig) -> Result<Event> {
    if !jig.settings.skip_firmware_load {
        let image = jig.settings.test_firmware_path.clone();
        if let Err(e) = jig.pulse.load_firmware(&image) {
            error!("Failed to load the test firmware: {}", e);
            return Ok(Event::Fail);
        }
    }

    let mut client = JigClient::new(jig.port.clone(), jig.settings.timeouts);
    jig.pulse.reset_device()?;
    let header = client.read_boot_header()?;
    jig.client = Some(client);
    // Boot noise is not part of the provisioning record.
    jig.reset_logs();

    if !header.contains(&jig.settings.test_firmware_marker) {
        error!("Unexpected firmware booted: {:?}", header.lines);
        return Ok(Event::Fail);
    }
    let version = jig.client()?.firmware_version()?;
    info!("Test firmware version {}", version);
    jig.test_firmware_version = Some(version);
    Ok(Event::Proceed)
}

/// Let the guard on `has_network` decide, polling at a slow pace.
pub(crate) fn waiting_for_network(jig: &mut Jig) -> Result<Event> {
    debug!("network status: {}", jig.registrar.network_status());
    if jig.pause(NETWORK_POLL_PERIOD) {
        Ok(Event::Proceed)
    } else {
        Ok(Event::Stay)
    }
}

pub(crate) fn generate_hwspec(jig: &mut Jig) -> Result<Event> {
    if jig.session.hwspec.is_none() {
        let version = jig.test_firmware_version.clone().unwrap_or_default();
        let hwspec = HwSpec::generate(&jig.settings.profile, &version);
        info!("Generated serial {}", hwspec.serial);
        jig.session.hwspec = Some(hwspec);
    }
    Ok(Event::Proceed)
}

/// Register the identity before it is written to the device so that no
/// device ever carries an unknown serial.
pub(crate) fn registering_device(jig: &mut Jig) -> Result<Event> {
    let mut extra = ExtraFields::new();
    if let Some(dev_eui) = jig.session.dev_eui.clone() {
        extra.insert("dev_eui".into(), dev_eui);
        extra.insert(
            "join_eui".into(),
            jig.settings.profile.lora.config_join_eui.clone(),
        );
        extra.insert("app_key".into(), jig.session.app_key.clone());
    }
    let hwspec = jig.hwspec()?.clone();
    if jig.registrar.register_serial(&hwspec, &extra) {
        Ok(Event::Proceed)
    } else {
        error!("Failed to register {}", hwspec.serial);
        Ok(Event::Retry)
    }
}

/// Stage the identity, persist it on `storage` and read it back. A record
/// that cannot be verified fails the device.
pub(crate) fn save_hwspec(jig: &mut Jig, storage: &str, bus: Bus) -> Result<Event> {
    let hwspec = jig.hwspec()?.clone();
    let client = jig.client()?;
    hwspec.save(client)?;

    let stored = bus.access(client, |client| {
        client.hwspec_save(storage)?;
        Ok(hwspec.verify(client, storage)?)
    });
    match stored {
        Ok(true) => Ok(Event::Proceed),
        Ok(false) => {
            error!("Could not verify the hwspec written to {}", storage);
            Ok(Event::Fail)
        }
        Err(e) => bus_failure(e, Event::Fail),
    }
}

/// Run the tests in order, stopping at the first failure. The outcome is
/// recorded as the provisional status; the working path then decides between
/// production firmware and record submission.
pub(crate) fn running_tests(
    jig: &mut Jig,
    tests: &[(&str, TestStep)],
) -> Result<Event> {
    let mut passed = true;
    for (name, test) in tests {
        passed = test(jig)?;
        if !passed {
            error!("{} failed", name);
            break;
        }
        debug!("{} passed", name);
    }
    if passed {
        info!("Tests Passed!");
        jig.session.provisional_status = Status::Passed;
    } else {
        error!("Tests Failed!");
        jig.session.provisional_status = Status::Failed;
    }
    Ok(Event::Proceed)
}

/// Flash the production firmware and check it booted. The test firmware's
/// transcript is left untouched.
pub(crate) fn loading_prod_firmware(jig: &mut Jig) -> Result<Event> {
    if !jig.settings.skip_firmware_load {
        let image = match jig.settings.prod_firmware_path.clone() {
            Some(image) => image,
            None => {
                error!("No production firmware configured");
                return Ok(Event::Fail);
            }
        };
        if let Err(e) = jig.pulse.load_firmware(&image) {
            error!("Failed to load the production firmware: {}", e);
            return Ok(Event::Retry);
        }
    }

    let mut client = JigClient::new(jig.port.clone(), jig.settings.timeouts);
    jig.pulse.reset_device()?;
    let header = match client.read_boot_header() {
        Ok(header) => header,
        Err(JigClientError::Protocol(e)) => {
            error!("Production firmware did not boot: {}", e);
            return Ok(Event::Retry);
        }
        Err(e) => return Err(e.into()),
    };
    if !header.contains(&jig.settings.prod_firmware_marker) {
        error!("Failed to load the Production firmware");
        return Ok(Event::Retry);
    }
    jig.session.prod_firmware_version = header.firmware_version();
    check_device_serial(jig, &header);
    Ok(Event::Proceed)
}

/// Submit the outcome of the iteration with the protocol transcript. If the
/// record cannot be stored the device has to go through the jig again.
pub(crate) fn submitting_provisioning_record(jig: &mut Jig) -> Result<Event> {
    let hwspec = match jig.session.hwspec.clone() {
        Some(hwspec) => hwspec,
        None => {
            error!("Nothing to submit without a hwspec");
            return Ok(Event::Retry);
        }
    };

    let mut extra = ExtraFields::new();
    if let Some(version) = &jig.test_firmware_version {
        extra.insert("test_firmware_version".into(), version.clone());
    }
    if jig.settings.target.loads_prod_firmware() {
        let version = jig
            .session
            .prod_firmware_version
            .clone()
            .unwrap_or_else(|| "0.0.0".into());
        extra.insert("prod_firmware_version".into(), version);
    }

    let record = ProvisioningRecord {
        hwspec,
        status: jig.session.provisional_status.name().to_owned(),
        logs: jig
            .client
            .as_ref()
            .map(|client| client.log().to_owned())
            .unwrap_or_default(),
        extra,
    };
    if jig.registrar.submit_provisioning_record(&record) {
        Ok(Event::Proceed)
    } else {
        error!("Failed to submit the provisioning record");
        Ok(Event::Retry)
    }
}

pub(crate) fn waiting_for_pcb_removal(jig: &mut Jig) -> Result<Event> {
    if jig.wait_until(|jig| !jig.pulse.is_connected()) {
        Ok(Event::Proceed)
    } else {
        Ok(Event::Stay)
    }
}

/// Block until a probe is plugged. An unidentified probe is rejected.
pub(crate) fn waiting_for_target(jig: &mut Jig) -> Result<Event> {
    match jig.client()?.probe_await_connect()? {
        Some(port_no) => {
            info!("Probe found on port {}", port_no);
            jig.port_no = Some(port_no);
            Ok(Event::Proceed)
        }
        None => {
            warn!("Bad probe");
            jig.port_no = None;
            Ok(Event::BadProbe)
        }
    }
}

pub(crate) fn waiting_for_target_removal(jig: &mut Jig) -> Result<Event> {
    jig.client()?.probe_await_recovery()?;
    Ok(Event::Proceed)
}

/// Resolve a failure of a bracketed bus access. A lost device always goes to
/// the run loop; anything else becomes `otherwise`.
pub(crate) fn bus_failure(e: BusError, otherwise: Event) -> Result<Event> {
    match e.into_inner() {
        e @ JigClientError::DeviceLost(_) => Err(e.into()),
        e => {
            error!("{}", e);
            Ok(otherwise)
        }
    }
}

/// The production firmware prints the serial it found in storage. A mismatch
/// is only reported for now.
fn check_device_serial(jig: &Jig, header: &BootHeader) {
    // TODO: fail the device on mismatch once the production firmware prints
    // its serial in the boot banner.
    let expected = jig.session.hwspec.as_ref().map(|h| h.serial.as_str());
    match (parse_device_serial(&header.text()), expected) {
        (Some(found), Some(expected)) if found != expected => {
            warn!("Device reports serial {} instead of {}", found, expected)
        }
        (Some(found), _) => debug!("Device reports serial {}", found),
        (None, _) => debug!("No serial in the production banner"),
    }
}
