//! The provisioning state machine driving devices through the jig.
//!
//! **Example** - Provisioning pulse boards until Ctrl+C:
//! ```no_run
//! use pulse_jig::{self as pj, CdevGpio, ConsoleRegistrar, GpioPulseManager, SerialOpener};
//!
//! let settings = pj::SettingsBuilder::default()
//!     .path("/dev/ttyACM0")
//!     .target(pj::Target::Pulse)
//!     .finalize();
//! let pulse = GpioPulseManager::new(
//!     CdevGpio::output("/dev/gpiochip0", 17, true).unwrap(),
//!     CdevGpio::input("/dev/gpiochip0", 27).unwrap(),
//!     "/media/pulse",
//! );
//! let mut provisioner = pj::factory(
//!     settings.clone(),
//!     Box::new(ConsoleRegistrar::offline()),
//!     Box::new(pulse),
//!     Box::new(SerialOpener::new(settings)),
//! );
//! let stop = provisioner.stop_handle();
//! ctrlc::set_handler(move || stop.terminate()).unwrap();
//! provisioner.run();
//! ```

mod events;
mod handlers;
mod state_machine;
mod states;
mod variants;

pub use events::{Event, EventData, Listener};
pub use state_machine::{factory, Provisioner, StopHandle};
pub use states::{State, Status};
