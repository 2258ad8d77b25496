//! Pulse-jig drives the factory jig used to test and provision pulse boards
//! and the analog probes plugged into them. A pulse board running a functional
//! test firmware is reached over a serial line; the jig host flashes firmware,
//! reads or mints the device identity, registers it with a remote service,
//! runs the functional tests and submits a provisioning record for every
//! device that goes through.
//!
//! The jig is operated by someone seating boards and plugging probes all day
//! long, so the software has to survive devices being pulled out at any time,
//! the serial device disappearing, and the registration service going away,
//! all without restarting.
//!
//! The work is split in layers:
//!
//! * [`JigClient`] speaks the line-oriented command protocol of the test
//!   firmware: echo, `+OK`/`-ERR` acknowledgement and optional body
//!   terminated by a lone `.`. Every exchange is kept in a transcript that ends
//!   up in the provisioning record.
//! * [`PulseManager`] controls the hardware around the board: reset line, seat
//!   sense switch and the mass storage volume used to flash firmware.
//! * [`Registrar`] is the remote registration service and reports whether the
//!   network is up.
//! * [`Provisioner`] is a state machine sequencing all of the above for one
//!   kind of [`Target`].
//!
//! The provisioner is implemented in terms of **states**, **events** and
//! **transitions**:
//!
//! * It can only be in one state at any time, and each state has a handler.
//! * A handler returns an event. `Proceed` follows the working path of the
//!   variant, with guards picking between alternatives. `Retry`, `Fail`,
//!   `DeviceLost` and `BadProbe` can be raised from any state.
//! * Only the transitions listed in a variant's table are taken. An event
//!   without a matching transition leaves the machine where it is.
//! * Any error escaping a handler is treated as the device being lost, which
//!   brings the machine back to waiting for the serial port.

mod error;
mod hwspec;
mod jig_client;
mod port;
mod provisioner;
mod pulse_manager;
mod registrar;
mod settings;
mod timeout;
mod utils;

pub use error::{Error, Result};
pub use hwspec::{HwSpec, HwSpecError, ProbeSpec, QrCode};
pub use jig_client::{
    parse_device_serial, BootHeader, Body, BusError, JigClient, JigClientError,
    HEADER_SEPARATOR_WIDTH,
};
pub use port::{PortHandle, PortOpener, SerialOpener, Transport};
pub use provisioner::{
    factory, Event, EventData, Listener, Provisioner, State, Status, StopHandle,
};
pub use pulse_manager::{
    check_for_header, CdevGpio, FirmwareError, GpioPulseManager, InputLine, OutputLine,
    PulseManager,
};
pub use registrar::{
    ConsoleRegistrar, ExtraFields, NetworkMonitor, NetworkStatus, Prober, ProvisioningRecord,
    Registrar, SharedNetworkStatus, TcpProber,
};
pub use settings::{
    DeviceProfile, LoraSettings, ModeSettings, Profile, ProtocolTimeouts, Settings,
    SettingsBuilder, Target,
};
pub use timeout::Timeout;
pub use utils::{find_device, select_port};
