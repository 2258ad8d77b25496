//! Provisioner scenarios against a simulated pulse board.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};

use pulse_jig::{
    factory, EventData, ExtraFields, FirmwareError, HwSpec, NetworkStatus, PortOpener,
    ProtocolTimeouts, Provisioner, ProvisioningRecord, PulseManager, Registrar, Settings,
    SettingsBuilder, State, Status, Target, Transport, HEADER_SEPARATOR_WIDTH,
};

// -----------------------------------------------------------------------------
// Simulated board
// -----------------------------------------------------------------------------

#[derive(Default)]
struct Board {
    seated: bool,
    /// The serial link died, e.g. the board was pulled out.
    unplugged: bool,
    production: bool,
    /// Persisted identity records by storage name.
    stored: HashMap<String, BTreeMap<String, String>>,
    staged: BTreeMap<String, String>,
    loaded: BTreeMap<String, String>,
    probe_chunk: Option<u32>,
    /// Port reported by `probe-await connect`, `None` for an unknown probe.
    probe_port: Option<u8>,
    /// Test commands answered with `FAIL`.
    failing: Vec<&'static str>,
    /// The board is pulled out when it receives this command.
    pull_on: Option<&'static str>,
    flashed: Vec<PathBuf>,
    commands: Vec<String>,
    rx: Vec<u8>,
    tx: VecDeque<u8>,
}

impl Board {
    fn send(&mut self, line: &str) {
        self.tx.extend(line.bytes());
        self.tx.extend(b"\r\n".iter().copied());
    }

    fn boot(&mut self) {
        let separator = "=".repeat(HEADER_SEPARATOR_WIDTH);
        self.send("");
        self.send(&separator);
        if self.production {
            self.send("Starting Production Firmware");
            self.send("Firmware Version: 2.0.0");
        } else {
            self.send("Starting Functional Test Firmware");
            self.send("Firmware Version: 1.4.2");
        }
        self.send(&separator);
    }

    fn body(&mut self, lines: &[&str]) {
        self.send("+OK");
        for line in lines {
            self.send(line);
        }
        self.send(".");
    }

    fn execute(&mut self, line: &str) -> io::Result<()> {
        self.commands.push(line.to_owned());
        if let Some(pull_on) = self.pull_on {
            if line.starts_with(pull_on) {
                self.seated = false;
                self.unplugged = true;
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "board removed"));
            }
        }
        self.send(line);

        let words: Vec<&str> = line.splitn(3, ' ').collect();
        match words.as_slice() {
            ["firmware-version"] => self.body(&["1.4.2"]),
            ["lora-deveui"] => self.body(&["0011223344556677"]),
            ["hwspec-load", storage] => match self.stored.get(*storage) {
                Some(record) => {
                    self.loaded = record.clone();
                    self.send("+OK");
                }
                None => self.send("-ERR no hwspec"),
            },
            ["hwspec-get", key] => {
                let value = self.loaded.get(*key).cloned().unwrap_or_default();
                self.body(&[value.as_str()]);
            }
            ["hwspec-set", key, value] => {
                self.staged.insert((*key).to_owned(), (*value).to_owned());
                self.send("+OK");
            }
            ["hwspec-save", storage] => {
                self.stored.insert((*storage).to_owned(), self.staged.clone());
                self.send("+OK");
            }
            ["hwspec-destroy", storage] => {
                self.stored.remove(*storage);
                self.send("+OK");
            }
            ["hwchunk-write", "probe", mm] => {
                self.probe_chunk = mm.parse().ok();
                self.send("+OK");
            }
            ["hwchunk-get", "probe"] => {
                let chunk = format!("cable length: {}mm", self.probe_chunk.unwrap_or(0));
                self.body(&[chunk.as_str()]);
            }
            ["probe-await", "connect"] => match self.probe_port {
                Some(port) => {
                    let found = format!("Found on port: {}", port);
                    self.body(&["", found.as_str()]);
                }
                None => self.body(&["Probe not identified"]),
            },
            ["probe-await", "recovery"] => self.body(&["Probe removed"]),
            [test, ..] if test.starts_with("test-") => {
                let verdict = if self.failing.iter().any(|failing| failing == test) {
                    "FAIL"
                } else {
                    "PASS"
                };
                self.body(&["running", verdict]);
            }
            ["platform", ..] | ["port-enable", ..] | ["lora-config", ..] | ["pulse-cfg", ..] => {
                self.send("+OK")
            }
            _ => self.send("-ERR unknown command"),
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
struct Sim(Arc<Mutex<Board>>);

impl Sim {
    fn board(&self) -> MutexGuard<'_, Board> {
        self.0.lock().unwrap()
    }
}

impl Read for Sim {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut board = self.board();
        if board.unplugged {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "board removed"));
        }
        if board.tx.is_empty() {
            drop(board);
            thread::sleep(Duration::from_millis(2));
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let count = buf.len().min(board.tx.len());
        for (slot, byte) in buf.iter_mut().zip(board.tx.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }
}

impl Write for Sim {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut board = self.board();
        if board.unplugged {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "board removed"));
        }
        for byte in buf {
            if *byte == b'\r' {
                let line = String::from_utf8_lossy(&board.rx).into_owned();
                board.rx.clear();
                board.execute(&line)?;
            } else {
                board.rx.push(*byte);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for Sim {
    fn set_timeout(&mut self, _: Duration) -> io::Result<()> {
        Ok(())
    }
}

impl PortOpener for Sim {
    fn open(&mut self) -> io::Result<Box<dyn Transport>> {
        let mut board = self.board();
        board.unplugged = false;
        board.rx.clear();
        board.tx.clear();
        drop(board);
        Ok(Box::new(self.clone()))
    }
}

impl PulseManager for Sim {
    fn reset_device(&mut self) -> io::Result<()> {
        self.board().boot();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.board().seated
    }

    fn await_removal(&mut self) {
        while self.is_connected() {
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn on_removal(&mut self, _: Box<dyn FnOnce() + Send>) {}

    fn load_firmware(&mut self, image: &Path) -> Result<(), FirmwareError> {
        let mut board = self.board();
        board.production = image.to_string_lossy().contains("prod");
        board.flashed.push(image.to_owned());
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Recording registrar
// -----------------------------------------------------------------------------

#[derive(Default)]
struct Ledger {
    registrations: Vec<(String, ExtraFields)>,
    records: Vec<ProvisioningRecord>,
}

#[derive(Clone)]
struct Recorder {
    ledger: Arc<Mutex<Ledger>>,
    accept_registrations: bool,
}

impl Recorder {
    fn new() -> Self {
        Recorder {
            ledger: Arc::default(),
            accept_registrations: true,
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap()
    }
}

impl Registrar for Recorder {
    fn register_serial(&mut self, hwspec: &HwSpec, extra: &ExtraFields) -> bool {
        if self.accept_registrations {
            self.ledger()
                .registrations
                .push((hwspec.serial.clone(), extra.clone()));
        }
        self.accept_registrations
    }

    fn submit_provisioning_record(&mut self, record: &ProvisioningRecord) -> bool {
        self.ledger().records.push(record.clone());
        true
    }

    fn network_status(&self) -> NetworkStatus {
        NetworkStatus::Connected
    }
}

// -----------------------------------------------------------------------------
// Harness
// -----------------------------------------------------------------------------

fn settings(target: Target) -> Settings {
    SettingsBuilder::new()
        .target(target)
        .prod_firmware_path("firmware/prod-firmware.bin")
        .cable_length(2.5)
        .timeouts(ProtocolTimeouts {
            write: Duration::from_millis(100),
            ack: Duration::from_millis(200),
            body: Duration::from_millis(200),
            test: Duration::from_millis(200),
            boot_header: Duration::from_millis(200),
        })
        .finalize()
}

fn provisioner(target: Target, sim: &Sim, recorder: &Recorder) -> Provisioner {
    sim.board().seated = true;
    factory(
        settings(target),
        Box::new(recorder.clone()),
        Box::new(sim.clone()),
        Box::new(sim.clone()),
    )
}

/// Step until `until` is entered, returning every state entered on the way.
fn drive(provisioner: &mut Provisioner, until: State) -> Vec<State> {
    let mut visited = Vec::new();
    for _ in 0..50 {
        let state = provisioner.step();
        visited.push(state);
        if state == until {
            return visited;
        }
    }
    panic!("never reached {}: {:?}", until, visited);
}

fn provisioned_record(serial: &str) -> BTreeMap<String, String> {
    let mut record = BTreeMap::new();
    record.insert("serial".to_owned(), serial.to_owned());
    record.insert("hw_revision".to_owned(), "C".to_owned());
    record.insert("assembly_timestamp".to_owned(), "1650000000".to_owned());
    record
}

// -----------------------------------------------------------------------------
// Pulse boards
// -----------------------------------------------------------------------------

#[test]
fn virgin_pulse_board_is_fully_provisioned() {
    let sim = Sim::default();
    let recorder = Recorder::new();
    let mut provisioner = provisioner(Target::Pulse, &sim, &recorder);

    let visited = drive(&mut provisioner, State::WaitingForPcbRemoval);
    assert_eq!(
        visited,
        vec![
            State::WaitingForPcb,
            State::LoadingTestFirmware,
            State::LoadingDeviceRego,
            State::GenerateHwspec,
            State::ConfiguringDevice,
            State::RegisteringDevice,
            State::SaveHwspec,
            State::RunningTests,
            State::LoadingProdFirmware,
            State::SubmittingProvisioningRecord,
            State::WaitingForPcbRemoval,
        ]
    );
    assert_eq!(provisioner.provisional_status(), Status::Passed);

    let ledger = recorder.ledger();
    assert_eq!(ledger.registrations.len(), 1);
    let (serial, extra) = &ledger.registrations[0];
    assert!(serial.starts_with("W0-"));
    assert_eq!(extra["dev_eui"], "0011223344556677");
    assert_eq!(extra["app_key"].split(':').count(), 16);

    assert_eq!(ledger.records.len(), 1);
    let record = &ledger.records[0];
    assert_eq!(record.status, "PASSED");
    assert_eq!(&record.hwspec.serial, serial);
    assert_eq!(record.extra["test_firmware_version"], "1.4.2");
    assert_eq!(record.extra["prod_firmware_version"], "2.0.0");
    assert!(record.logs.contains("test-lora-connect"));
    assert!(!record.logs.contains("Starting Functional Test Firmware"));

    let board = sim.board();
    assert_eq!(board.stored["pulse"]["serial"], *serial);
    assert_eq!(board.flashed.len(), 2);
    assert!(board.commands.contains(&"pulse-cfg set pulse polling_rate 1800".to_owned()));
}

#[test]
fn board_removal_starts_the_next_iteration() {
    let sim = Sim::default();
    let recorder = Recorder::new();
    let mut provisioner = provisioner(Target::Pulse, &sim, &recorder);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    provisioner.add_listener(move |name: &str, data: &EventData| {
        sink.lock().unwrap().push((name.to_owned(), data.status, data.qrcode.is_some()));
    });

    drive(&mut provisioner, State::WaitingForPcbRemoval);
    sim.board().seated = false;
    assert_eq!(provisioner.step(), State::WaitingForSerial);
    assert_eq!(provisioner.provisional_status(), Status::Unknown);

    let events = events.lock().unwrap();
    assert_eq!(events[0].0, "waiting_for_serial");
    assert!(events.contains(&("waiting_for_pcb_removal".to_owned(), Status::Passed, true)));
    assert_eq!(events.last().map(|e| e.2), Some(false));
}

#[test]
fn registered_board_keeps_its_identity() {
    let sim = Sim::default();
    sim.board()
        .stored
        .insert("pulse".into(), provisioned_record("W0-001-00000002"));
    let recorder = Recorder::new();
    let mut provisioner = provisioner(Target::Pulse, &sim, &recorder);

    let visited = drive(&mut provisioner, State::WaitingForPcbRemoval);
    assert!(!visited.contains(&State::GenerateHwspec));
    assert!(!visited.contains(&State::SaveHwspec));

    let ledger = recorder.ledger();
    assert!(ledger.registrations.is_empty());
    assert_eq!(ledger.records[0].hwspec.serial, "W0-001-00000002");
    assert_eq!(ledger.records[0].hwspec.assembly_timestamp, 1_650_000_000);
}

#[test]
fn failed_test_is_recorded_without_prod_firmware() {
    let sim = Sim::default();
    sim.board().failing.push("test-port");
    let recorder = Recorder::new();
    let mut provisioner = provisioner(Target::Pulse, &sim, &recorder);

    let visited = drive(&mut provisioner, State::WaitingForPcbRemoval);
    assert!(!visited.contains(&State::LoadingProdFirmware));
    assert_eq!(provisioner.provisional_status(), Status::Failed);

    let ledger = recorder.ledger();
    assert_eq!(ledger.records.len(), 1);
    assert_eq!(ledger.records[0].status, "FAILED");
    assert_eq!(ledger.records[0].extra["prod_firmware_version"], "0.0.0");
    // Testing stops at the first failure.
    assert!(!sim
        .board()
        .commands
        .iter()
        .any(|command| command.starts_with("test-lora-connect")));
}

#[test]
fn pulled_board_goes_back_to_the_serial_port() {
    let sim = Sim::default();
    sim.board().pull_on = Some("test-self");
    let recorder = Recorder::new();
    let mut provisioner = provisioner(Target::Pulse, &sim, &recorder);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    provisioner.add_listener(move |name: &str, data: &EventData| {
        sink.lock().unwrap().push((name.to_owned(), data.hwspec.is_some()));
    });

    let visited = drive(&mut provisioner, State::WaitingForSerial);
    assert_eq!(visited[visited.len() - 2], State::RunningTests);
    assert!(recorder.ledger().records.is_empty());
    assert_eq!(provisioner.provisional_status(), Status::Unknown);

    provisioner.step();
    let events = events.lock().unwrap();
    assert!(events.contains(&("running_tests".to_owned(), true)));
    assert_eq!(
        events.last(),
        Some(&("waiting_for_serial".to_owned(), false))
    );
}

#[test]
fn refused_registration_is_retried_on_reinsertion() {
    let sim = Sim::default();
    let mut recorder = Recorder::new();
    recorder.accept_registrations = false;
    let mut provisioner = provisioner(Target::Pulse, &sim, &recorder);

    let visited = drive(&mut provisioner, State::WaitingForPcbRemoval);
    assert_eq!(visited[visited.len() - 2], State::RegisteringDevice);
    assert_eq!(provisioner.provisional_status(), Status::Retry);
    assert!(recorder.ledger().records.is_empty());
    assert!(!sim.board().stored.contains_key("pulse"));
}

#[test]
fn phase_1_stops_before_prod_firmware() {
    let sim = Sim::default();
    let recorder = Recorder::new();
    let mut provisioner = provisioner(Target::PulsePhase1, &sim, &recorder);

    let visited = drive(&mut provisioner, State::WaitingForPcbRemoval);
    assert!(!visited.contains(&State::LoadingProdFirmware));
    assert_eq!(sim.board().flashed.len(), 1);
    let ledger = recorder.ledger();
    assert_eq!(ledger.records[0].status, "PASSED");
    assert!(!ledger.records[0].extra.contains_key("prod_firmware_version"));
}

#[test]
fn phase_2_fails_a_virgin_board() {
    let sim = Sim::default();
    let recorder = Recorder::new();
    let mut provisioner = provisioner(Target::PulsePhase2, &sim, &recorder);

    let visited = drive(&mut provisioner, State::WaitingForPcbRemoval);
    assert_eq!(visited[visited.len() - 2], State::LoadingDeviceRego);
    assert_eq!(provisioner.provisional_status(), Status::Failed);
    assert!(recorder.ledger().records.is_empty());
}

// -----------------------------------------------------------------------------
// Probes
// -----------------------------------------------------------------------------

#[test]
fn virgin_probe_is_provisioned_through_its_port() {
    let sim = Sim::default();
    sim.board().probe_port = Some(2);
    let recorder = Recorder::new();
    let mut provisioner = provisioner(Target::Ta3k, &sim, &recorder);

    let visited = drive(&mut provisioner, State::WaitingForTargetRemoval);
    assert_eq!(
        visited,
        vec![
            State::WaitingForPcb,
            State::LoadingTestFirmware,
            State::WaitingForTarget,
            State::LoadingDeviceRego,
            State::GenerateHwspec,
            State::RegisteringDevice,
            State::SaveHwspec,
            State::RunningTests,
            State::SubmittingProvisioningRecord,
            State::WaitingForTargetRemoval,
        ]
    );
    assert_eq!(provisioner.provisional_status(), Status::Passed);

    let board = sim.board();
    assert!(board.stored.contains_key("probe"));
    assert!(!board.stored.contains_key("pulse"));
    assert_eq!(board.probe_chunk, Some(2500));
    assert!(board.commands.contains(&"test-ta3k 0x2 1".to_owned()));
    assert!(board.commands.contains(&"port-enable 2".to_owned()));
    assert_eq!(
        board.commands.last().map(String::as_str),
        Some("platform prp-disable")
    );
    drop(board);

    // The next probe is awaited without touching the pulse board again.
    assert_eq!(provisioner.step(), State::WaitingForTarget);
    assert_eq!(sim.board().flashed.len(), 1);
    assert_eq!(recorder.ledger().records.len(), 1);
}

#[test]
fn unknown_probe_is_rejected() {
    let sim = Sim::default();
    let recorder = Recorder::new();
    let mut provisioner = provisioner(Target::Ta6k, &sim, &recorder);

    let visited = drive(&mut provisioner, State::WaitingForTargetRemoval);
    assert_eq!(visited[visited.len() - 2], State::WaitingForTarget);
    assert!(recorder.ledger().records.is_empty());
}

#[test]
fn stop_handle_terminates_run() {
    let sim = Sim::default();
    sim.board().probe_port = Some(1);
    let recorder = Recorder::new();
    let mut provisioner = provisioner(Target::Ta11k, &sim, &recorder);
    let stop = provisioner.stop_handle();

    let worker = thread::spawn(move || {
        provisioner.run();
        provisioner.state()
    });
    thread::sleep(Duration::from_millis(300));
    stop.terminate();
    assert!(worker.join().is_ok());
}
