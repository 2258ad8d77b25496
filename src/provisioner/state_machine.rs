//! The provisioning state machine engine.
//!
//! A provisioner runs one state handler at a time in a loop. Before each
//! handler runs, an event carrying the state name and a snapshot of the
//! provisioner is sent to all listeners. The handler returns an [`Event`]
//! which is resolved against the variant's [`Blueprint`]:
//!
//! * `Proceed` follows the first transition of the working path leaving the
//!   current state whose guard holds (`has_hwspec`, `has_passed`,
//!   `has_network`, ...). If none holds, the machine stays in the state.
//! * `Retry`, `Fail`, `DeviceLost` and `BadProbe` are accepted from any state
//!   and lead to the recovery states named by the blueprint. `Fail` goes to
//!   record submission when the device has an identity and straight to the
//!   removal wait otherwise.
//!
//! Any error returned by a handler is logged and handled as `DeviceLost`. This
//! is the net that keeps the jig from wedging when a board is pulled out
//! mid-test: the removal callback closes the serial port and whatever the
//! handler was doing fails with an I/O error.
//!
//! The working path of a pulse board, with the recovery edges left out:
//!
//! ```text
//!   WaitingForSerial -> WaitingForPcb -> LoadingTestFirmware
//!        ^                ^      |             |
//!        |                |      v             v
//!        |             WaitingForNetwork   LoadingDeviceRego --------.
//!        |                                     | no hwspec           |
//!        |                                     v                     |
//!        |                               GenerateHwspec              |
//!        |                                     v                     |
//!        |                              ConfiguringDevice            |
//!        |                                     v                     |
//!        |                              RegisteringDevice            |
//!        |                                     v                     |
//!        |                                 SaveHwspec                |
//!        |                                     v                     |
//!        |                                RunningTests <-------------'
//!        |                        passed |            | failed
//!        |                               v            |
//!        |                     LoadingProdFirmware    |
//!        |                               v            v
//!        |                     SubmittingProvisioningRecord
//!        |                               v
//!        '------------------------ WaitingForPcbRemoval
//! ```

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use log::{debug, error, info};
use rand::Rng;

use super::{
    events::{Event, EventData, Listener},
    states::{State, Status},
    variants::{self, Variant},
};
use crate::{
    error::{Error, Result},
    hwspec::{HwSpec, QrCode},
    jig_client::JigClient,
    port::{PortHandle, PortOpener},
    pulse_manager::PulseManager,
    registrar::{NetworkStatus, Registrar},
    settings::Settings,
};

// =============================================================================
// Public Interface
// =============================================================================

/// The provisioning state machine for one kind of target. Use
/// [`factory`] to get one for the configured target, then call
/// [`run`](Provisioner::run) from a dedicated thread.
pub struct Provisioner {
    jig: Jig,
    variant: Box<dyn Variant>,
    blueprint: Blueprint,
}

impl Provisioner {
    /// Run until [`StopHandle::terminate`] is called. Termination is observed
    /// between two states, so a handler blocked on the operator delays it.
    pub fn run(&mut self) {
        info!("Starting provisioner: {}", self.variant.name());
        while self.jig.is_running() {
            self.step();
        }
        info!("provisioner terminated");
    }

    /// Run the handler of the current state once and apply the resulting
    /// transition. Returns the new current state.
    pub fn step(&mut self) -> State {
        let state = self.jig.state;
        self.jig.emit(state.name());
        info!("=> {}", state);

        let event = match self.variant.handle(state, &mut self.jig) {
            Ok(event) => event,
            Err(e) => {
                error!("{}: {}", state, e);
                Event::DeviceLost
            }
        };
        self.trigger(event);
        self.jig.state
    }

    pub fn state(&self) -> State {
        self.jig.state
    }

    /// The outcome of the current device so far.
    pub fn provisional_status(&self) -> Status {
        self.jig.session.provisional_status
    }

    pub fn add_listener(&mut self, listener: impl Listener + 'static) {
        self.jig.listeners.push(Box::new(listener));
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: Arc::clone(&self.jig.running),
        }
    }

    fn trigger(&mut self, event: Event) {
        let from = self.jig.state;
        let (to, before): (State, Option<Hook>) = match event {
            Event::Proceed => match self
                .blueprint
                .proceed
                .iter()
                .find(|t| t.from == from && (t.guard)(&self.jig))
            {
                Some(transition) => (transition.to, transition.before),
                None => {
                    debug!("{}: no transition taken, staying", from);
                    return;
                }
            },
            Event::Stay => return,
            Event::Retry => (self.blueprint.retry_to, Some(set_status_retry as Hook)),
            Event::Fail => {
                let to = if has_hwspec(&self.jig) {
                    self.blueprint.fail_with_hwspec
                } else {
                    self.blueprint.fail_without_hwspec
                };
                (to, Some(set_status_failed as Hook))
            }
            Event::DeviceLost => (self.blueprint.device_lost_to, None),
            Event::BadProbe => match self.blueprint.bad_probe_to {
                Some(to) => (to, None),
                None => (self.blueprint.device_lost_to, None),
            },
        };
        debug!("{:?}: {} -> {}", event, from, to);

        if let Some(before) = before {
            before(&mut self.jig);
        }
        for (_, hook) in self.blueprint.on_exit.iter().filter(|(s, _)| *s == from) {
            hook(&mut self.jig);
        }
        self.jig.state = to;
        for (_, hook) in self.blueprint.on_enter.iter().filter(|(s, _)| *s == to) {
            hook(&mut self.jig);
        }
    }
}

/// Build the provisioner for the target selected in `settings`.
pub fn factory(
    settings: Settings,
    registrar: Box<dyn Registrar>,
    pulse: Box<dyn PulseManager>,
    opener: Box<dyn PortOpener>,
) -> Provisioner {
    let variant = variants::for_target(settings.target);
    let blueprint = variant.blueprint();
    Provisioner {
        jig: Jig::new(settings, registrar, pulse, opener, blueprint.initial),
        variant,
        blueprint,
    }
}

/// Requests a running provisioner to terminate. Can be sent to other threads,
/// e.g. a Ctrl+C handler.
#[derive(Debug, Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn terminate(&self) {
        info!("setting terminate on provisioner");
        self.running.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// Crate-Public Interface
// =============================================================================

pub(crate) type Guard = fn(&Jig) -> bool;
pub(crate) type Hook = fn(&mut Jig);

/// A working path edge.
pub(crate) struct Transition {
    pub from: State,
    pub guard: Guard,
    pub to: State,
    pub before: Option<Hook>,
}

impl Transition {
    pub(crate) fn new(from: State, to: State) -> Self {
        Transition {
            from,
            guard: always,
            to,
            before: None,
        }
    }

    pub(crate) fn when(mut self, guard: Guard) -> Self {
        self.guard = guard;
        self
    }

    pub(crate) fn before(mut self, hook: Hook) -> Self {
        self.before = Some(hook);
        self
    }
}

/// The shape of a provisioner variant: its working path and where the
/// universal transitions lead.
pub(crate) struct Blueprint {
    pub initial: State,
    pub proceed: Vec<Transition>,
    pub retry_to: State,
    pub fail_with_hwspec: State,
    pub fail_without_hwspec: State,
    pub device_lost_to: State,
    pub bad_probe_to: Option<State>,
    pub on_enter: Vec<(State, Hook)>,
    pub on_exit: Vec<(State, Hook)>,
}

/// Data belonging to the device currently in the jig. Replaced wholesale
/// between devices.
#[derive(Debug)]
pub(crate) struct Session {
    pub hwspec: Option<HwSpec>,
    pub provisional_status: Status,
    pub qrcode: Option<QrCode>,
    pub prod_firmware_version: Option<String>,
    pub dev_eui: Option<String>,
    /// LoRa application key written to the device when configuring it.
    pub app_key: String,
}

impl Session {
    pub(crate) fn new() -> Self {
        Session {
            hwspec: None,
            provisional_status: Status::Unknown,
            qrcode: None,
            prod_firmware_version: None,
            dev_eui: None,
            app_key: generate_app_key(),
        }
    }
}

/// Everything the state handlers work with.
pub(crate) struct Jig {
    pub settings: Settings,
    pub registrar: Box<dyn Registrar>,
    pub pulse: Box<dyn PulseManager>,
    pub opener: Box<dyn PortOpener>,
    pub port: PortHandle,
    /// Protocol session with the test firmware, once booted.
    pub client: Option<JigClient>,
    pub session: Session,
    /// The status surfaced to listeners.
    pub status: Status,
    pub test_firmware_version: Option<String>,
    /// External port the probe under test is plugged into.
    pub port_no: Option<u8>,
    pub state: State,
    reset_logs: bool,
    listeners: Vec<Box<dyn Listener>>,
    running: Arc<AtomicBool>,
}

impl Jig {
    const POLL_PERIOD: Duration = Duration::from_millis(20);

    fn new(
        settings: Settings,
        registrar: Box<dyn Registrar>,
        pulse: Box<dyn PulseManager>,
        opener: Box<dyn PortOpener>,
        initial: State,
    ) -> Self {
        Jig {
            settings,
            registrar,
            pulse,
            opener,
            port: PortHandle::new(),
            client: None,
            session: Session::new(),
            status: Status::Unknown,
            test_firmware_version: None,
            port_no: None,
            state: initial,
            reset_logs: false,
            listeners: Vec::new(),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Sleep for `duration`, returning early with `false` if termination was
    /// requested.
    pub(crate) fn pause(&self, duration: Duration) -> bool {
        let mut waited = Duration::from_secs(0);
        while waited < duration {
            if !self.is_running() {
                return false;
            }
            thread::sleep(Self::POLL_PERIOD);
            waited += Self::POLL_PERIOD;
        }
        self.is_running()
    }

    /// Poll `condition` until it holds. `false` if termination was requested
    /// first.
    pub(crate) fn wait_until(&self, condition: impl Fn(&Jig) -> bool) -> bool {
        while !condition(self) {
            if !self.pause(Self::POLL_PERIOD) {
                return false;
            }
        }
        true
    }

    pub(crate) fn client(&mut self) -> Result<&mut JigClient> {
        let state = self.state;
        self.client.as_mut().ok_or(Error::Missing {
            what: "protocol session",
            state,
        })
    }

    pub(crate) fn hwspec(&self) -> Result<&HwSpec> {
        self.session.hwspec.as_ref().ok_or(Error::Missing {
            what: "hwspec",
            state: self.state,
        })
    }

    pub(crate) fn port_no(&self) -> Result<u8> {
        self.port_no.ok_or(Error::Missing {
            what: "probe port",
            state: self.state,
        })
    }

    /// Clear the protocol transcript and tell the listeners to clear theirs.
    pub(crate) fn reset_logs(&mut self) {
        if let Some(client) = self.client.as_mut() {
            client.reset_log();
        }
        self.reset_logs = true;
        self.emit(self.state.name());
        self.reset_logs = false;
    }

    pub(crate) fn emit(&mut self, name: &str) {
        if self.listeners.is_empty() {
            return;
        }
        let data = self.snapshot();
        for listener in self.listeners.iter_mut() {
            listener.on_event(name, &data);
        }
    }

    fn snapshot(&self) -> EventData {
        EventData {
            hwspec: self.session.hwspec.clone(),
            status: self.status,
            qrcode: self.session.qrcode.clone(),
            reset_logs: self.reset_logs,
            target: self.settings.target,
            manufacturer: self.settings.profile.device.manufacturer_name.clone(),
            test_firmware_version: self.test_firmware_version.clone(),
            prod_firmware_version: self.session.prod_firmware_version.clone(),
        }
    }
}

// -----------------------------------------------------------------------------
// Guards
// -----------------------------------------------------------------------------

pub(crate) fn always(_: &Jig) -> bool {
    true
}

pub(crate) fn has_hwspec(jig: &Jig) -> bool {
    jig.session.hwspec.is_some()
}

pub(crate) fn no_hwspec(jig: &Jig) -> bool {
    !has_hwspec(jig)
}

pub(crate) fn has_passed(jig: &Jig) -> bool {
    jig.session.provisional_status == Status::Passed
}

pub(crate) fn not_passed(jig: &Jig) -> bool {
    !has_passed(jig)
}

pub(crate) fn has_network(jig: &Jig) -> bool {
    jig.registrar.network_status() == NetworkStatus::Connected
}

pub(crate) fn no_network(jig: &Jig) -> bool {
    !has_network(jig)
}

// -----------------------------------------------------------------------------
// Hooks
// -----------------------------------------------------------------------------

pub(crate) fn set_status_retry(jig: &mut Jig) {
    jig.session.provisional_status = Status::Retry;
}

pub(crate) fn set_status_failed(jig: &mut Jig) {
    jig.session.provisional_status = Status::Failed;
}

pub(crate) fn set_status_waiting(jig: &mut Jig) {
    jig.status = Status::Waiting;
}

pub(crate) fn set_status_in_progress(jig: &mut Jig) {
    jig.status = Status::InProgress;
}

pub(crate) fn promote_provisional_status(jig: &mut Jig) {
    jig.status = jig.session.provisional_status;
}

/// Forget everything about the previous device.
pub(crate) fn reset(jig: &mut Jig) {
    jig.session = Session::new();
    jig.status = Status::Unknown;
}

/// Forget the previous device and its transcript.
pub(crate) fn reset_with_logs(jig: &mut Jig) {
    reset(jig);
    jig.reset_logs();
}

/// Expose the label content of a device that passed.
pub(crate) fn update_qrcode(jig: &mut Jig) {
    if has_passed(jig) {
        jig.session.qrcode = jig.session.hwspec.as_ref().map(HwSpec::qr_code);
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// 16 random bytes as colon separated hex, e.g. `0a:1f:...`.
fn generate_app_key() -> String {
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| format!("{:02x}", rng.gen::<u8>()))
        .collect::<Vec<_>>()
        .join(":")
}

// =============================================================================
// Unit Tests
// =============================================================================
