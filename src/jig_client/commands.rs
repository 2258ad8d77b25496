//! Typed wrappers over the commands understood by the functional test
//! firmware.

use super::{
    client::{Body, JigClient},
    error::{BusError, JigClientError, Result},
};

const FOUND_ON_PORT: &str = "Found on port";

impl JigClient {
    fn bodied(&self) -> Body {
        Body::Within(self.timeouts().body)
    }

    /// Send a `platform` command.
    pub fn platform(&mut self, cmd: &str) -> Result<()> {
        self.send_command(&format!("platform {}", cmd), Body::None)
            .map(|_| ())
    }

    // -------------------------------------------------------------------------
    // External accessory bus
    // -------------------------------------------------------------------------

    /// Connect external port `port_number` to the identity bus.
    pub fn enable_external_port(&mut self, port_number: u8) -> Result<()> {
        self.platform("prp-enable")?;
        self.platform("extern-ports-enable")?;
        self.send_command(&format!("port-enable {}", port_number), Body::None)
            .map(|_| ())
    }

    /// Isolate all external ports again.
    pub fn disable_external_port(&mut self) -> Result<()> {
        self.send_command("port-enable none", Body::None)?;
        self.platform("extern-ports-disable")?;
        self.platform("prp-disable")
    }

    /// Run `access` with external port `port_number` enabled. The port is
    /// disabled afterwards whatever the outcome of `access`, provided enabling
    /// it succeeded in the first place.
    pub fn with_external_port<T>(
        &mut self,
        port_number: u8,
        access: impl FnOnce(&mut JigClient) -> Result<T>,
    ) -> std::result::Result<T, BusError> {
        self.enable_external_port(port_number)
            .map_err(BusError::Enable)?;
        let result = access(self);
        let disabled = self.disable_external_port();
        let value = result.map_err(BusError::Access)?;
        disabled.map_err(BusError::Access)?;
        Ok(value)
    }

    /// Run `access` with the on-board identity bus powered.
    pub fn with_platform_bus<T>(
        &mut self,
        access: impl FnOnce(&mut JigClient) -> Result<T>,
    ) -> std::result::Result<T, BusError> {
        self.platform("prp-enable").map_err(BusError::Enable)?;
        let result = access(self);
        let disabled = self.platform("prp-disable");
        let value = result.map_err(BusError::Access)?;
        disabled.map_err(BusError::Access)?;
        Ok(value)
    }

    // -------------------------------------------------------------------------
    // Identity record
    // -------------------------------------------------------------------------

    /// Load the identity record stored on `target` into the firmware's working
    /// copy. `false` means nothing is stored there yet.
    pub fn hwspec_load(&mut self, target: &str) -> Result<bool> {
        match self.send_command(&format!("hwspec-load {}", target), Body::None) {
            Ok(_) => Ok(true),
            Err(JigClientError::CommandFailed(reason)) => {
                log::debug!("no hwspec on {}: {}", target, reason);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub fn hwspec_get(&mut self, key: &str) -> Result<String> {
        let body = self.bodied();
        self.send_command(&format!("hwspec-get {}", key), body)
    }

    pub fn hwspec_set(&mut self, key: &str, value: &str) -> Result<()> {
        self.send_command(&format!("hwspec-set {} {}", key, value), Body::None)
            .map(|_| ())
    }

    pub fn hwspec_save(&mut self, target: &str) -> Result<()> {
        self.send_command(&format!("hwspec-save {}", target), Body::None)
            .map(|_| ())
    }

    /// Erase the identity record stored on `target`. Only used in repair mode.
    pub fn hwspec_destroy(&mut self, target: &str) -> Result<()> {
        self.send_command(&format!("hwspec-destroy {}", target), Body::None)
            .map(|_| ())
    }

    // -------------------------------------------------------------------------
    // Tests
    // -------------------------------------------------------------------------

    pub fn test_self(&mut self) -> Result<bool> {
        self.run_test_cmd("test-self")
    }

    pub fn test_port(&mut self) -> Result<bool> {
        self.run_test_cmd("test-port -n 0x0f 1")
    }

    pub fn test_lora_connect(&mut self, sub_band: u8, join_eui: &str, app_key: &str) -> Result<bool> {
        self.run_test_cmd(&format!(
            "test-lora-connect {} {} {}",
            sub_band, join_eui, app_key
        ))
    }

    pub fn test_ta3k(&mut self, port_number: u8) -> Result<bool> {
        self.run_test_cmd(&format!("test-ta3k {} 1", port_flags(port_number)))
    }

    pub fn test_ta6k(&mut self, port_number: u8) -> Result<bool> {
        self.run_test_cmd(&format!("test-ta6k {} 1", port_flags(port_number)))
    }

    pub fn test_ta11k(&mut self, port_number: u8) -> Result<bool> {
        self.run_test_cmd(&format!("test-ta11k {} 1", port_flags(port_number)))
    }

    // -------------------------------------------------------------------------
    // Probes
    // -------------------------------------------------------------------------

    /// Block until a probe is plugged in. Returns the port it was found on, or
    /// `None` when the firmware could not identify it.
    pub fn probe_await_connect(&mut self) -> Result<Option<u8>> {
        let body = self.send_command("probe-await connect", Body::Unbounded)?;
        Ok(parse_probe_port(&body))
    }

    /// Block until the probe is unplugged.
    pub fn probe_await_recovery(&mut self) -> Result<()> {
        self.send_command("probe-await recovery", Body::Unbounded)
            .map(|_| ())
    }

    pub fn hwchunk_get_probe(&mut self) -> Result<String> {
        let body = self.bodied();
        self.send_command("hwchunk-get probe", body)
    }

    pub fn hwchunk_write_probe(&mut self, cable_length_mm: u32) -> Result<()> {
        self.send_command(&format!("hwchunk-write probe {}", cable_length_mm), Body::None)
            .map(|_| ())
    }

    // -------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------

    pub fn lora_deveui(&mut self) -> Result<String> {
        let body = self.bodied();
        self.send_command("lora-deveui", body)
            .map(|eui| eui.trim().to_owned())
    }

    pub fn lora_config(&mut self, join_eui: &str, app_key: &str) -> Result<()> {
        self.send_command(&format!("lora-config {} {}", join_eui, app_key), Body::None)
            .map(|_| ())
    }

    pub fn firmware_version(&mut self) -> Result<String> {
        let body = self.bodied();
        self.send_command("firmware-version", body)
            .map(|version| version.trim().to_owned())
    }

    pub fn pulse_cfg_init(&mut self) -> Result<()> {
        self.send_command("pulse-cfg init", Body::None).map(|_| ())
    }

    pub fn pulse_cfg_load(&mut self) -> Result<()> {
        self.send_command("pulse-cfg load", Body::None).map(|_| ())
    }

    pub fn pulse_cfg_set_pulse(&mut self, key: &str, value: &str) -> Result<()> {
        self.send_command(&format!("pulse-cfg set pulse {} {}", key, value), Body::None)
            .map(|_| ())
    }

    pub fn pulse_cfg_save(&mut self) -> Result<()> {
        self.send_command("pulse-cfg save", Body::None).map(|_| ())
    }
}

/// Port number to the bit field the test commands take, e.g. port 3 is `0x4`.
fn port_flags(port_number: u8) -> String {
    format!("{:#x}", 1u32 << port_number.saturating_sub(1).min(31))
}

fn parse_probe_port(body: &str) -> Option<u8> {
    let line = body.lines().find(|line| line.contains(FOUND_ON_PORT))?;
    line.splitn(2, ':').nth(1)?.trim().parse().ok()
}

// =============================================================================
// Unit Tests
// =============================================================================
