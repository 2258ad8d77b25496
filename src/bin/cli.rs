//! Pulse-jig command line interface.

use std::{fs, process, thread, time::Duration};

use clap::{
    crate_authors, crate_description, crate_name, crate_version, value_t, App, AppSettings::*, Arg,
};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, trace, LevelFilter};
use simplelog::*;

use pulse_jig::{
    self as pj, CdevGpio, ConsoleRegistrar, EventData, GpioPulseManager, NetworkMonitor,
    Profile, Registrar, SerialOpener, Status, TcpProber, Target,
};

fn main() {
    println!("[JIG] pulse-jig v{}", crate_version!());

    let targets: Vec<&str> = Target::ALL.iter().map(|target| target.name()).collect();
    let matches = App::new(crate_name!())
        .version(format!("v{}", crate_version!()).as_str())
        .author(crate_authors!())
        .about(crate_description!())
        .long_about(
            "\n\
            Pulse-jig drives the factory jig used to test and provision pulse \
            boards and analog probes. It talks to the functional test firmware \
            running on the board seated in the jig over a serial line.\n\
            \n\
            For every device that goes through the jig it: \n\
               \t* flashes the test firmware \n\
               \t* reads the identity stored on the device, or generates, \
                   registers and stores a new one \n\
               \t* runs the functional tests \n\
               \t* flashes the production firmware when the target needs it \n\
               \t* submits a provisioning record with the test transcript \n\
            \n\
            Boards and probes can be removed at any time and the jig's serial \
            controller can be unplugged and re-plugged, all without \
            restarting.\
        ",
        )
        .max_term_width(80)
        .setting(ColoredHelp)
        .setting(NextLineHelp)
        .arg(
            Arg::with_name("TARGET")
                .help("the kind of device to provision")
                .possible_values(&targets)
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("DEVICE_TTY")
                .help("the USB tty device of the jig")
                .long_help(
                    "the USB tty device of the jig; when not set, the device \
                     is looked up by its USB vendor and product ids and, if \
                     not found, selected interactively.",
                )
                .short("-t")
                .long("--tty")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("BAUD_RATE")
                .help("serial port baud rate")
                .short("-b")
                .long("--baud-rate")
                .takes_value(true)
                .default_value("115200")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("CONFIG")
                .help("JSON production profile")
                .long_help(
                    "JSON file with the production profile: device identity \
                     data (`device`), LoRa parameters (`lora`) and run mode \
                     (`mode`).",
                )
                .short("-c")
                .long("--config")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("TEST_FIRMWARE")
                .help("path to the functional test firmware image")
                .long("--test-firmware")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("PROD_FIRMWARE")
                .help("path to the production firmware image")
                .long("--prod-firmware")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("SKIP_FIRMWARE_LOAD")
                .help("only reset the device, do not flash firmware")
                .long("--skip-firmware-load"),
        )
        .arg(
            Arg::with_name("REPAIR_MODE")
                .help("destroy any stored identity and provision a new one")
                .long("--repair-mode"),
        )
        .arg(
            Arg::with_name("CABLE_LENGTH")
                .help("probe cable length in meters")
                .long("--cable-length")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("GPIO_CHIP")
                .help("GPIO character device of the reset and sense lines")
                .long("--gpio-chip")
                .takes_value(true)
                .default_value("/dev/gpiochip0")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("RESET_PIN")
                .help("GPIO driving the board's reset line")
                .long("--reset-pin")
                .takes_value(true)
                .default_value("17")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("SENSE_PIN")
                .help("GPIO reading the board seat switch")
                .long("--sense-pin")
                .takes_value(true)
                .default_value("27")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("VOLUME")
                .help("mount point of the programmer's mass storage volume")
                .long("--volume")
                .takes_value(true)
                .default_value("/media/pulse")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("API_HOST")
                .help("host:port of the registration service")
                .long_help(
                    "host:port of the registration service, used to monitor \
                     the network; when not set, records are only logged.",
                )
                .long("--api-host")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(Arg::with_name("v").short("v").multiple(true).help(
            "Sets the logging level of verbosity, repeat several times for \
                higher verbosity",
        ))
        .get_matches();

    // Vary the output based on how many times the user used the "verbose" flag
    // (i.e. 'pulse-jig -v -v -v' or 'pulse-jig -vvv' vs 'pulse-jig -v'
    let log_level = match matches.occurrences_of("v") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    TermLogger::init(
        log_level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .unwrap();

    trace!("{:#?}", matches);

    // Arguments with default values ===========================================

    // It's safe to call unwrap on all command line arguments with default
    // values, because the value with either be what the user input at runtime
    // or the default value

    let baud_rate = numeric_arg::<u32>(&matches, "BAUD_RATE", "baud-rate");
    let reset_pin = numeric_arg::<u32>(&matches, "RESET_PIN", "reset-pin");
    let sense_pin = numeric_arg::<u32>(&matches, "SENSE_PIN", "sense-pin");
    let gpio_chip = matches.value_of("GPIO_CHIP").unwrap().to_owned();
    let volume = matches.value_of("VOLUME").unwrap().to_owned();
    let target: Target = matches.value_of("TARGET").unwrap().parse().unwrap();

    // END - Arguments with default values =====================================

    let mut profile = match matches.value_of("CONFIG") {
        Some(path) => load_profile(path),
        None => Profile::default(),
    };
    if matches.is_present("CABLE_LENGTH") {
        profile.mode.cable_length =
            Some(numeric_arg::<f32>(&matches, "CABLE_LENGTH", "cable-length"));
    }

    let mut builder = pj::SettingsBuilder::default()
        .baud_rate(baud_rate)
        .target(target)
        .skip_firmware_load(matches.is_present("SKIP_FIRMWARE_LOAD"))
        .hwspec_repair_mode(matches.is_present("REPAIR_MODE"))
        .profile(profile);

    // START - Arguments with NO default values ================================

    if let Some(path) = matches.value_of("TEST_FIRMWARE") {
        builder = builder.test_firmware_path(path);
    }
    if let Some(path) = matches.value_of("PROD_FIRMWARE") {
        builder = builder.prod_firmware_path(path);
    }
    let mut settings = builder.finalize();

    // END - Arguments =========================================================

    if let Err(e) = settings.validate() {
        fail(&e.to_string());
    }

    settings.path = match matches.value_of("DEVICE_TTY") {
        Some(path) => Some(path.into()),
        None => pj::select_port(settings.usb_vid, settings.usb_pid),
    };
    if settings.path.is_none() {
        fail("no serial device for the jig");
    }

    // Hardware and services ===================================================

    let reset = CdevGpio::output(&gpio_chip, reset_pin, true).unwrap_or_else(|e| {
        fail(&format!("reset line {} on {}: {}", reset_pin, gpio_chip, e))
    });
    let sense = CdevGpio::input(&gpio_chip, sense_pin).unwrap_or_else(|e| {
        fail(&format!("sense line {} on {}: {}", sense_pin, gpio_chip, e))
    });
    let pulse = GpioPulseManager::new(reset, sense, volume);

    let monitor = matches.value_of("API_HOST").map(|host| {
        NetworkMonitor::spawn(
            TcpProber::new(host, Duration::from_secs(3)),
            Duration::from_secs(5),
        )
    });
    let registrar: Box<dyn Registrar> = match &monitor {
        Some(monitor) => Box::new(ConsoleRegistrar::new(monitor.shared_status())),
        None => Box::new(ConsoleRegistrar::offline()),
    };

    // Run the state machine ===================================================

    let mut provisioner = pj::factory(
        settings.clone(),
        registrar,
        Box::new(pulse),
        Box::new(SerialOpener::new(settings)),
    );
    let mut dashboard = Dashboard::new();
    provisioner.add_listener(move |name: &str, data: &EventData| dashboard.show(name, data));

    let stop = provisioner.stop_handle();
    ctrlc::set_handler(move || {
        println!("🛑 received Ctrl+C!");
        stop.terminate();
    })
    .expect("Failed to install my Ctrl-C handler!");

    let worker = thread::spawn(move || provisioner.run());
    if worker.join().is_err() {
        error!("provisioner thread panicked");
        process::exit(-1);
    }
    drop(monitor);
    debug!("bye");
}

/// Shows the progress of the current device to the operator.
struct Dashboard {
    pb: ProgressBar,
}

impl Dashboard {
    fn new() -> Self {
        let pb = ProgressBar::new_spinner();
        pb.enable_steady_tick(120);
        pb.set_style(
            ProgressStyle::default_spinner()
                .tick_strings(&["⠋", "⠙", "⠚", "⠞", "⠖", "⠦", "⠴", "⠲", "⠳", "⠓"])
                .template("[JIG] {spinner:.blue} {msg}"),
        );
        Dashboard { pb }
    }

    fn show(&mut self, name: &str, data: &EventData) {
        if data.reset_logs {
            return;
        }
        let serial = data
            .hwspec
            .as_ref()
            .map_or_else(|| "-".to_owned(), |hwspec| hwspec.serial.clone());
        let status = match data.status {
            Status::Passed => style(data.status.name()).green().bold(),
            Status::Failed | Status::Retry => style(data.status.name()).red().bold(),
            _ => style(data.status.name()).yellow(),
        };
        self.pb.set_message(format!(
            "[{}] {} {} {}",
            data.target,
            status,
            style(serial).cyan(),
            style(name).dim()
        ));
        if let Some(qrcode) = &data.qrcode {
            self.pb
                .println(format!("{} {}", style("label").green(), qrcode.payload()));
        }
    }
}

fn numeric_arg<T: std::str::FromStr>(matches: &clap::ArgMatches, name: &str, long: &str) -> T {
    value_t!(matches.value_of(name), T).unwrap_or_else(|_| {
        println!(
            "{}: `{}` needs to be a numeric value",
            style("error").red(),
            style(long).cyan()
        );
        println!(
            "   {} `{}` is not a valid value",
            style("-->").cyan(),
            style(matches.value_of(name).unwrap_or_default()).on_red()
        );
        process::exit(-1);
    })
}

fn load_profile(path: &str) -> Profile {
    let json = fs::read_to_string(path).unwrap_or_else(|e| {
        fail(&format!("cannot read {}: {}", path, e))
    });
    Profile::from_json(&json).unwrap_or_else(|e| {
        fail(&format!("invalid profile {}: {}", path, e))
    })
}

fn fail(message: &str) -> ! {
    println!("{}: {}", style("error").red(), message);
    process::exit(-1);
}
