//! Identity records stored in the non-volatile memory of the devices.
//!
//! A [`HwSpec`] is the permanent identity of a pulse board or probe. It is
//! either read back from a device that went through the jig before, or minted
//! for a virgin device and written to it once registered. The serial is never
//! changed once set.
//!
//! A [`ProbeSpec`] is the additional `probe` chunk holding the cable length of
//! a probe.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    jig_client::{JigClient, JigClientError},
    settings::Profile,
};

#[derive(Debug, Error)]
pub enum HwSpecError {
    #[error(transparent)]
    Client(#[from] JigClientError),
    #[error("malformed {field}: {value:?}")]
    Malformed { field: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, HwSpecError>;

/// Lets identity reads be used inside bus brackets. Malformed data is the
/// device not following the protocol.
impl From<HwSpecError> for JigClientError {
    fn from(e: HwSpecError) -> Self {
        match e {
            HwSpecError::Client(e) => e,
            malformed => JigClientError::Protocol(malformed.to_string()),
        }
    }
}

// =============================================================================
// HWSpec
// =============================================================================

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct HwSpec {
    pub serial: String,
    pub thing_type_name: String,
    pub thing_type_id: String,
    pub hw_revision: String,
    pub assembly_id: String,
    pub assembly_version: String,
    /// Unix time of provisioning.
    pub assembly_timestamp: u64,
    pub manufacturer_name: String,
    pub manufacturer_id: String,
    pub iecex_cert: String,
    /// Version of the test firmware that provisioned the device.
    pub firmware_version: String,
}

/// The content of the label printed for a provisioned device.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct QrCode {
    pub sn: String,
    pub rev: String,
    /// Date of manufacture, unix time.
    pub dom: u64,
    pub cert: String,
}

impl QrCode {
    /// The JSON payload encoded in the printed QR code.
    pub fn payload(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl HwSpec {
    const KEYS: [&'static str; 11] = [
        "serial",
        "thing_type_name",
        "thing_type_id",
        "hw_revision",
        "assembly_id",
        "assembly_version",
        "assembly_timestamp",
        "manufacturer_name",
        "manufacturer_id",
        "iecex_cert",
        "firmware_version",
    ];

    /// A fresh identity for a virgin device.
    pub fn generate(profile: &Profile, firmware_version: &str) -> Self {
        let mut hwspec = HwSpec::default();
        hwspec.set(profile, firmware_version);
        hwspec
    }

    /// Fill the record from the configured device profile. A serial is only
    /// minted if the record has none yet, and an existing timestamp is kept.
    pub fn set(&mut self, profile: &Profile, firmware_version: &str) {
        let device = &profile.device;
        if self.serial.is_empty() {
            self.serial = mint_serial(&device.minter_id);
        }
        if self.assembly_timestamp == 0 {
            self.assembly_timestamp = unix_time();
        }
        self.thing_type_name = device.thing_type_name.clone();
        self.thing_type_id = device.thing_type_id.clone();
        self.hw_revision = device.hw_revision.clone();
        self.assembly_id = device.assembly_id.clone();
        self.assembly_version = device.assembly_version.clone();
        self.manufacturer_name = device.manufacturer_name.clone();
        self.manufacturer_id = device.manufacturer_id.clone();
        self.iecex_cert = profile.mode.iecex_cert.clone();
        self.firmware_version = firmware_version.to_owned();
    }

    /// Read the record most recently loaded with `hwspec-load`.
    pub fn get(client: &mut JigClient) -> Result<Self> {
        let mut hwspec = HwSpec::default();
        for key in Self::KEYS.iter() {
            let value = client.hwspec_get(key)?;
            hwspec.assign(key, value.trim())?;
        }
        Ok(hwspec)
    }

    /// Stage every field with `hwspec-set`. Persisting is left to
    /// `hwspec-save` so that the caller can bracket it with the bus commands
    /// the target needs.
    pub fn save(&self, client: &mut JigClient) -> Result<()> {
        for key in Self::KEYS.iter() {
            let value = self.field(key);
            if !value.is_empty() {
                client.hwspec_set(key, &value)?;
            }
        }
        Ok(())
    }

    /// Reload the record stored on `target` and check it carries our serial.
    pub fn verify(&self, client: &mut JigClient, target: &str) -> Result<bool> {
        if !client.hwspec_load(target)? {
            return Ok(false);
        }
        let stored = client.hwspec_get("serial")?;
        Ok(stored.trim() == self.serial)
    }

    pub fn qr_code(&self) -> QrCode {
        QrCode {
            sn: self.serial.clone(),
            rev: self.hw_revision.clone(),
            dom: self.assembly_timestamp,
            cert: self.iecex_cert.clone(),
        }
    }

    fn field(&self, key: &str) -> String {
        match key {
            "serial" => self.serial.clone(),
            "thing_type_name" => self.thing_type_name.clone(),
            "thing_type_id" => self.thing_type_id.clone(),
            "hw_revision" => self.hw_revision.clone(),
            "assembly_id" => self.assembly_id.clone(),
            "assembly_version" => self.assembly_version.clone(),
            "assembly_timestamp" => self.assembly_timestamp.to_string(),
            "manufacturer_name" => self.manufacturer_name.clone(),
            "manufacturer_id" => self.manufacturer_id.clone(),
            "iecex_cert" => self.iecex_cert.clone(),
            "firmware_version" => self.firmware_version.clone(),
            _ => String::new(),
        }
    }

    fn assign(&mut self, key: &'static str, value: &str) -> Result<()> {
        let value = value.to_owned();
        match key {
            "serial" => self.serial = value,
            "thing_type_name" => self.thing_type_name = value,
            "thing_type_id" => self.thing_type_id = value,
            "hw_revision" => self.hw_revision = value,
            "assembly_id" => self.assembly_id = value,
            "assembly_version" => self.assembly_version = value,
            "assembly_timestamp" => {
                self.assembly_timestamp = if value.is_empty() {
                    0
                } else {
                    value.parse().map_err(|_| HwSpecError::Malformed {
                        field: key,
                        value,
                    })?
                }
            }
            "manufacturer_name" => self.manufacturer_name = value,
            "manufacturer_id" => self.manufacturer_id = value,
            "iecex_cert" => self.iecex_cert = value,
            "firmware_version" => self.firmware_version = value,
            _ => {}
        }
        Ok(())
    }
}

fn mint_serial(minter_id: &str) -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{}-{:03}-{:08}",
        minter_id,
        rng.gen_range(0..1_000),
        rng.gen_range(0..100_000_000)
    )
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

// =============================================================================
// ProbeSpec
// =============================================================================

/// The `probe` chunk of a probe's EEPROM.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProbeSpec {
    pub cable_length_mm: u32,
}

impl ProbeSpec {
    const CABLE_LENGTH_PREFIX: &'static str = "cable length:";

    /// Cable length as entered by the operator, in meters.
    pub fn from_meters(meters: f32) -> Self {
        let mut spec = ProbeSpec::default();
        spec.set(meters);
        spec
    }

    pub fn set(&mut self, meters: f32) {
        self.cable_length_mm = (meters.max(0.0) * 1000.0).round() as u32;
    }

    pub fn cable_length_meters(&self) -> f32 {
        self.cable_length_mm as f32 / 1000.0
    }

    pub fn get(client: &mut JigClient) -> Result<Self> {
        let chunk = client.hwchunk_get_probe()?;
        let cable_length_mm = Self::parse_cable_length(&chunk).ok_or(HwSpecError::Malformed {
            field: "cable_length",
            value: chunk,
        })?;
        Ok(ProbeSpec { cable_length_mm })
    }

    pub fn save(&self, client: &mut JigClient) -> Result<()> {
        client.hwchunk_write_probe(self.cable_length_mm)?;
        Ok(())
    }

    fn parse_cable_length(chunk: &str) -> Option<u32> {
        chunk.lines().find_map(|line| {
            let (_, rest) = line.split_once(Self::CABLE_LENGTH_PREFIX)?;
            rest.trim().strip_suffix("mm")?.trim().parse().ok()
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        port::{testing::ScriptedPort, PortHandle},
        settings::{DeviceProfile, ProtocolTimeouts},
    };
    use std::time::Duration;

    fn profile() -> Profile {
        let mut profile = Profile::default();
        profile.device = DeviceProfile {
            minter_id: "W0".into(),
            thing_type_name: "pulse".into(),
            thing_type_id: "42".into(),
            hw_revision: "C".into(),
            assembly_id: "asm-1".into(),
            assembly_version: "3".into(),
            manufacturer_name: "ACME".into(),
            manufacturer_id: "7".into(),
        };
        profile
    }

    fn client(script: &str) -> (JigClient, ScriptedPort) {
        let port = ScriptedPort::new(script.as_bytes());
        let handle = PortHandle::with_transport(Box::new(port.clone()));
        let timeouts = ProtocolTimeouts {
            write: Duration::from_millis(50),
            ack: Duration::from_millis(50),
            body: Duration::from_millis(100),
            test: Duration::from_millis(100),
            boot_header: Duration::from_millis(100),
        };
        (JigClient::new(handle, timeouts), port)
    }

    #[test]
    fn generated_serial_has_minter_prefix() {
        let hwspec = HwSpec::generate(&profile(), "1.2.3");
        assert!(hwspec.serial.starts_with("W0-"));
        assert_eq!(hwspec.serial.len(), "W0-123-12345678".len());
        assert_eq!(hwspec.hw_revision, "C");
        assert_eq!(hwspec.iecex_cert, "N/A");
        assert_eq!(hwspec.firmware_version, "1.2.3");
        assert!(hwspec.assembly_timestamp > 0);
    }

    #[test]
    fn serial_is_never_overwritten() {
        let mut hwspec = HwSpec::generate(&profile(), "1.2.3");
        let serial = hwspec.serial.clone();
        let timestamp = hwspec.assembly_timestamp;
        hwspec.set(&profile(), "1.2.4");
        assert_eq!(hwspec.serial, serial);
        assert_eq!(hwspec.assembly_timestamp, timestamp);
        assert_eq!(hwspec.firmware_version, "1.2.4");
    }

    #[test]
    fn save_stages_every_field() {
        let hwspec = HwSpec::generate(&profile(), "1.2.3");
        let mut script = String::new();
        for key in HwSpec::KEYS.iter() {
            script.push_str(&format!("hwspec-set {} {}\r\n+OK\r\n", key, hwspec.field(key)));
        }
        let (mut client, port) = client(&script);
        hwspec.save(&mut client).unwrap();
        assert_eq!(port.pending(), 0);
        assert!(port
            .written()
            .contains(&format!("hwspec-set serial {}\r", hwspec.serial)));
    }

    #[test]
    fn get_reads_every_field() {
        let mut script = String::new();
        for key in HwSpec::KEYS.iter() {
            let value = match *key {
                "serial" => "W0-001-00000002",
                "assembly_timestamp" => "1650000000",
                _ => "x",
            };
            script.push_str(&format!("hwspec-get {}\r\n+OK\r\n{}\r\n.\r\n", key, value));
        }
        let (mut client, _) = client(&script);
        let hwspec = HwSpec::get(&mut client).unwrap();
        assert_eq!(hwspec.serial, "W0-001-00000002");
        assert_eq!(hwspec.assembly_timestamp, 1_650_000_000);
        assert_eq!(hwspec.thing_type_id, "x");
    }

    #[test]
    fn malformed_timestamp() {
        let script = "hwspec-get serial\r\n+OK\r\nW0\r\n.\r\n\
                      hwspec-get thing_type_name\r\n+OK\r\n\r\n.\r\n\
                      hwspec-get thing_type_id\r\n+OK\r\n\r\n.\r\n\
                      hwspec-get hw_revision\r\n+OK\r\n\r\n.\r\n\
                      hwspec-get assembly_id\r\n+OK\r\n\r\n.\r\n\
                      hwspec-get assembly_version\r\n+OK\r\n\r\n.\r\n\
                      hwspec-get assembly_timestamp\r\n+OK\r\nyesterday\r\n.\r\n";
        let (mut client, _) = client(script);
        assert!(matches!(
            HwSpec::get(&mut client),
            Err(HwSpecError::Malformed { field: "assembly_timestamp", .. })
        ));
    }

    #[test]
    fn verify_compares_serial() {
        let hwspec = HwSpec::generate(&profile(), "1.2.3");
        let script = format!(
            "hwspec-load pulse\r\n+OK\r\nhwspec-get serial\r\n+OK\r\n{}\r\n.\r\n",
            hwspec.serial
        );
        let (mut client, _) = client(&script);
        assert!(hwspec.verify(&mut client, "pulse").unwrap());

        let (mut client, _) = self::client("hwspec-load pulse\r\n-ERR empty\r\n");
        assert!(!hwspec.verify(&mut client, "pulse").unwrap());
    }

    #[test]
    fn qr_payload() {
        let hwspec = HwSpec {
            serial: "W0-001-00000002".into(),
            hw_revision: "C".into(),
            assembly_timestamp: 1_650_000_000,
            iecex_cert: "N/A".into(),
            ..HwSpec::default()
        };
        assert_eq!(
            hwspec.qr_code().payload(),
            r#"{"sn":"W0-001-00000002","rev":"C","dom":1650000000,"cert":"N/A"}"#
        );
    }

    #[test]
    fn probe_cable_length() {
        assert_eq!(ProbeSpec::from_meters(2.5).cable_length_mm, 2500);
        assert_eq!(ProbeSpec::parse_cable_length("cable length: 1200mm"), Some(1200));
        assert_eq!(ProbeSpec::parse_cable_length("version: 1\ncable length: 30 mm\n"), Some(30));
        assert_eq!(ProbeSpec::parse_cable_length("cable length: ?"), None);
    }

    #[test]
    fn probe_chunk_round_trip_through_device() {
        let (mut client, port) =
            client("hwchunk-write probe 2500\r\n+OK\r\nhwchunk-get probe\r\n+OK\r\ncable length: 2500mm\r\n.\r\n");
        ProbeSpec::from_meters(2.5).save(&mut client).unwrap();
        assert_eq!(ProbeSpec::get(&mut client).unwrap().cable_length_mm, 2500);
        assert!(port.written().starts_with("hwchunk-write probe 2500\r"));
    }
}
