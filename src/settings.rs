//! Settings related to the jig serial port, protocol timeouts, firmware images
//! and the identity data written to provisioned devices.
//!
//! Use the [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
//! pattern to set the configurable values. The resulting [`Settings`] value is
//! immutable and handed to each component at construction.

use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize, Serializer};
pub use serialport::{DataBits, FlowControl, Parity, StopBits};

use crate::Error;

// =============================================================================
// Public Interface
// =============================================================================

/// The kind of hardware being provisioned. Selects the provisioner variant.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Target {
    Ta3k,
    Ta6k,
    Ta11k,
    /// Full pulse provisioning: identity, configuration, tests and production
    /// firmware.
    Pulse,
    /// Pulse boards before production firmware is available.
    PulsePhase1,
    /// Reflash of already provisioned pulse boards.
    PulsePhase2,
}

impl Target {
    pub const ALL: [Target; 6] = [
        Target::Ta3k,
        Target::Ta6k,
        Target::Ta11k,
        Target::Pulse,
        Target::PulsePhase1,
        Target::PulsePhase2,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Target::Ta3k => "ta3k",
            Target::Ta6k => "ta6k",
            Target::Ta11k => "ta11k",
            Target::Pulse => "pulse",
            Target::PulsePhase1 => "pulse-phase-1",
            Target::PulsePhase2 => "pulse-phase-2",
        }
    }

    /// Probes are tested through a pulse board acting as the jig.
    pub fn is_probe(&self) -> bool {
        matches!(self, Target::Ta3k | Target::Ta6k | Target::Ta11k)
    }

    /// Whether this target ends with the production firmware being loaded.
    pub fn loads_prod_firmware(&self) -> bool {
        matches!(self, Target::Pulse | Target::PulsePhase2)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for Target {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Target::ALL
            .iter()
            .find(|target| target.name() == s)
            .copied()
            .ok_or_else(|| format!("unknown target `{}`", s))
    }
}

/// Static identity data stamped into every freshly generated HWSpec.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
pub struct DeviceProfile {
    /// Prefix of every minted serial number.
    pub minter_id: String,
    pub thing_type_name: String,
    pub thing_type_id: String,
    pub hw_revision: String,
    pub assembly_id: String,
    pub assembly_version: String,
    pub manufacturer_name: String,
    pub manufacturer_id: String,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        DeviceProfile {
            minter_id: "W0".into(),
            thing_type_name: "pulse".into(),
            thing_type_id: "0".into(),
            hw_revision: "0".into(),
            assembly_id: "0".into(),
            assembly_version: "0".into(),
            manufacturer_name: "unknown".into(),
            manufacturer_id: "0".into(),
        }
    }
}

/// LoRa parameters used while testing and when configuring pulse devices.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
pub struct LoraSettings {
    pub test_sub_band: u8,
    pub test_join_eui: String,
    pub test_app_key: String,
    /// Join EUI written to the device and reported to the registrar.
    pub config_join_eui: String,
}

impl Default for LoraSettings {
    fn default() -> Self {
        LoraSettings {
            test_sub_band: 2,
            test_join_eui: "00:00:00:00:00:00:00:00".into(),
            test_app_key: "00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00".into(),
            config_join_eui: "00:00:00:00:00:00:00:00".into(),
        }
    }
}

/// Operator selectable values for the current production run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModeSettings {
    #[serde(default = "default_cert")]
    pub iecex_cert: String,
    /// Probe cable length in meters.
    #[serde(default)]
    pub cable_length: Option<f32>,
}

fn default_cert() -> String {
    "N/A".into()
}

impl Default for ModeSettings {
    fn default() -> Self {
        ModeSettings {
            iecex_cert: default_cert(),
            cable_length: None,
        }
    }
}

/// The part of the settings usually loaded from a JSON file, grouping the
/// production data for a run.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub device: DeviceProfile,
    #[serde(default)]
    pub lora: LoraSettings,
    #[serde(default)]
    pub mode: ModeSettings,
}

impl Profile {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Timeouts applied by the protocol client.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ProtocolTimeouts {
    /// Maximum time to write a command line.
    pub write: Duration,
    /// Maximum time to wait for each of the echo and acknowledgement lines.
    pub ack: Duration,
    /// Maximum time to accumulate the body of a regular command.
    pub body: Duration,
    /// Maximum time to accumulate the body of a test command.
    pub test: Duration,
    /// Maximum time to wait for the boot banner after a reset.
    pub boot_header: Duration,
}

impl Default for ProtocolTimeouts {
    fn default() -> Self {
        ProtocolTimeouts {
            write: Duration::from_secs(1),
            ack: Duration::from_millis(500),
            body: Duration::from_secs(2),
            test: Duration::from_secs(30),
            boot_header: Duration::from_secs(5),
        }
    }
}

/// Groups all settings used by the jig and acts as a
/// [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
/// for the settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// The port name, usually the device path.
    pub path: Option<String>,
    /// The baud rate in symbols-per-second.
    pub baud_rate: u32,
    /// Number of bits used to represent a character sent on the line.
    pub data_bits: DataBits,
    /// The type of signalling to use for controlling data transfer.
    pub flow_control: FlowControl,
    /// The type of parity to use for error checking.
    pub parity: Parity,
    /// Number of bits to use to signal the end of a character.
    pub stop_bits: StopBits,
    /// USB vendor id of the jig's serial controller, used for discovery.
    pub usb_vid: u16,
    /// USB product id of the jig's serial controller, used for discovery.
    pub usb_pid: u16,

    pub target: Target,
    pub test_firmware_path: PathBuf,
    pub prod_firmware_path: Option<PathBuf>,
    /// Skip copying firmware images; the device is only reset.
    pub skip_firmware_load: bool,
    /// Destroy any stored identity before reading it, forcing a new one to be
    /// generated, registered and written.
    pub hwspec_repair_mode: bool,

    pub timeouts: ProtocolTimeouts,
    /// Text the test firmware prints in its boot banner.
    pub test_firmware_marker: String,
    /// Text the production firmware prints in its boot banner.
    pub prod_firmware_marker: String,

    pub profile: Profile,

    /// Restrict creation of `Settings` instances unless through the
    /// `SettingsBuilder`.
    #[doc(hidden)]
    _private_use_builder: (),
}

impl Settings {
    /// Check the combination of values makes sense for the selected target.
    pub fn validate(&self) -> crate::Result<()> {
        if self.target.loads_prod_firmware() && self.prod_firmware_path.is_none() {
            return Err(Error::Settings(format!(
                "target `{}` needs a production firmware image",
                self.target
            )));
        }
        if self.target == Target::PulsePhase2 && self.hwspec_repair_mode {
            return Err(Error::Settings(format!(
                "repair mode is not allowed for target `{}`",
                self.target
            )));
        }
        if self.target.is_probe() && self.profile.mode.cable_length.is_none() {
            return Err(Error::Settings(format!(
                "target `{}` needs a cable length",
                self.target
            )));
        }
        Ok(())
    }
}

/// The builder for the `Settings` values.
///
/// All values are optional and have default values that will be used if not
/// explicitly set.
///
/// **Example**
///
/// ```
/// use pulse_jig::{SettingsBuilder, Target};
///
/// let settings = SettingsBuilder::new()
///     .path("/dev/ttyACM0")
///     .target(Target::Ta3k)
///     .finalize();
/// assert_eq!(settings.baud_rate, 115_200);
/// ```
pub struct SettingsBuilder {
    settings: Settings,
}
impl SettingsBuilder {
    /// Start building the settings using default values and no path for the
    /// port.
    pub fn new() -> Self {
        SettingsBuilder {
            settings: Settings {
                path: None,
                baud_rate: 115_200,
                data_bits: DataBits::Eight,
                flow_control: FlowControl::None,
                parity: Parity::None,
                stop_bits: StopBits::One,
                usb_vid: 0x0D28,
                usb_pid: 0x0204,
                target: Target::Pulse,
                test_firmware_path: PathBuf::from("firmware/test-firmware.bin"),
                prod_firmware_path: None,
                skip_firmware_load: false,
                hwspec_repair_mode: false,
                timeouts: ProtocolTimeouts::default(),
                test_firmware_marker: "Starting Functional Test Firmware".into(),
                prod_firmware_marker: "Starting Production Firmware".into(),
                profile: Profile::default(),
                _private_use_builder: (),
            },
        }
    }

    /// Set the path to the serial port
    pub fn path<'a>(mut self, path: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.path = Some(path.into().into_owned());
        self
    }

    /// Set the baud rate in symbols-per-second
    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.settings.baud_rate = baud_rate;
        self
    }

    /// Set the number of bits used to represent a character sent on the line
    pub fn data_bits(mut self, data_bits: DataBits) -> Self {
        self.settings.data_bits = data_bits;
        self
    }

    /// Set the type of signalling to use for controlling data transfer
    pub fn flow_control(mut self, flow_control: FlowControl) -> Self {
        self.settings.flow_control = flow_control;
        self
    }

    /// Set the type of parity to use for error checking
    pub fn parity(mut self, parity: Parity) -> Self {
        self.settings.parity = parity;
        self
    }

    /// Set the number of bits to use to signal the end of a character
    pub fn stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.settings.stop_bits = stop_bits;
        self
    }

    /// Set the USB vendor/product id pair used to discover the jig
    pub fn usb_id(mut self, vid: u16, pid: u16) -> Self {
        self.settings.usb_vid = vid;
        self.settings.usb_pid = pid;
        self
    }

    pub fn target(mut self, target: Target) -> Self {
        self.settings.target = target;
        self
    }

    pub fn test_firmware_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.test_firmware_path = path.into();
        self
    }

    pub fn prod_firmware_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.prod_firmware_path = Some(path.into());
        self
    }

    pub fn skip_firmware_load(mut self, skip: bool) -> Self {
        self.settings.skip_firmware_load = skip;
        self
    }

    pub fn hwspec_repair_mode(mut self, repair: bool) -> Self {
        self.settings.hwspec_repair_mode = repair;
        self
    }

    pub fn timeouts(mut self, timeouts: ProtocolTimeouts) -> Self {
        self.settings.timeouts = timeouts;
        self
    }

    pub fn test_firmware_marker(mut self, marker: impl Into<String>) -> Self {
        self.settings.test_firmware_marker = marker.into();
        self
    }

    pub fn prod_firmware_marker(mut self, marker: impl Into<String>) -> Self {
        self.settings.prod_firmware_marker = marker.into();
        self
    }

    pub fn profile(mut self, profile: Profile) -> Self {
        self.settings.profile = profile;
        self
    }

    /// Set the probe cable length in meters
    pub fn cable_length(mut self, meters: f32) -> Self {
        self.settings.profile.mode.cable_length = Some(meters);
        self
    }

    pub fn finalize(self) -> Settings {
        self.settings
    }
}
impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn all_default() {
    let settings = SettingsBuilder::new().finalize();
    assert_eq!(settings.path, None);
    assert_eq!(settings.baud_rate, 115_200);
    assert_eq!(settings.data_bits, DataBits::Eight);
    assert_eq!(settings.flow_control, FlowControl::None);
    assert_eq!(settings.parity, Parity::None);
    assert_eq!(settings.stop_bits, StopBits::One);
    assert_eq!((settings.usb_vid, settings.usb_pid), (0x0D28, 0x0204));
    assert_eq!(settings.target, Target::Pulse);
    assert!(!settings.skip_firmware_load);
    assert!(!settings.hwspec_repair_mode);
    assert_eq!(settings.timeouts.ack, Duration::from_millis(500));
    assert_eq!(settings.timeouts.body, Duration::from_secs(2));
}

#[test]
fn path() {
    let settings = SettingsBuilder::new().path("/dev/ttyACM1").finalize();
    assert_eq!(settings.path.unwrap(), "/dev/ttyACM1");
}

#[test]
fn baud_rate() {
    let settings = SettingsBuilder::new().baud_rate(9_600).finalize();
    assert_eq!(settings.baud_rate, 9_600);
}

#[test]
fn target_round_trips_through_its_name() {
    for target in Target::ALL.iter() {
        assert_eq!(target.name().parse::<Target>().unwrap(), *target);
    }
    assert!("pulse-r1b".parse::<Target>().is_err());
}

#[test]
fn pulse_needs_prod_firmware() {
    let settings = SettingsBuilder::new().target(Target::Pulse).finalize();
    assert!(settings.validate().is_err());
    let settings = SettingsBuilder::new()
        .target(Target::Pulse)
        .prod_firmware_path("firmware/prod-firmware.bin")
        .finalize();
    assert!(settings.validate().is_ok());
}

#[test]
fn phase_2_refuses_repair_mode() {
    let settings = SettingsBuilder::new()
        .target(Target::PulsePhase2)
        .prod_firmware_path("prod.bin")
        .hwspec_repair_mode(true)
        .finalize();
    assert!(settings.validate().is_err());
}

#[test]
fn probes_need_a_cable_length() {
    let settings = SettingsBuilder::new().target(Target::Ta6k).finalize();
    assert!(settings.validate().is_err());
    let settings = SettingsBuilder::new()
        .target(Target::Ta6k)
        .cable_length(1.5)
        .finalize();
    assert!(settings.validate().is_ok());
}

#[test]
fn profile_from_json() {
    let profile = Profile::from_json(
        r#"{
            "device": {
                "minter_id": "W1",
                "thing_type_name": "ta3k",
                "thing_type_id": "7",
                "hw_revision": "r1b",
                "assembly_id": "42",
                "assembly_version": "3",
                "manufacturer_name": "ACME",
                "manufacturer_id": "9"
            },
            "mode": { "cable_length": 2.5 }
        }"#,
    )
    .unwrap();
    assert_eq!(profile.device.minter_id, "W1");
    assert_eq!(profile.mode.iecex_cert, "N/A");
    assert_eq!(profile.mode.cable_length, Some(2.5));
    assert_eq!(profile.lora, LoraSettings::default());
}
