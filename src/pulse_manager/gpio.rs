//! [`PulseManager`] over two GPIO lines and the programmer's mass storage
//! volume. The lines are requested from the kernel GPIO character device
//! with `gpiocdev`.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use gpiocdev::{
    line::{EdgeDetection, Offset, Value},
    Request,
};
use log::{debug, error, info, trace};

use super::{FirmwareError, PulseManager};
use crate::timeout::Timeout;

const RESET_PULSE: Duration = Duration::from_millis(500);
const SENSE_POLL_PERIOD: Duration = Duration::from_millis(50);
const VOLUME_POLL_PERIOD: Duration = Duration::from_millis(250);

// =============================================================================
// Public Interface
// =============================================================================

pub trait OutputLine: Send {
    fn set_high(&mut self, high: bool) -> io::Result<()>;
}

pub trait InputLine: Send + Sync {
    fn is_high(&self) -> io::Result<bool>;

    /// Block until the line changes level or `timeout` elapses. Returns
    /// `true` when the level may have changed. Lines without edge detection
    /// just sleep for `timeout`.
    fn wait_for_edge(&self, timeout: Duration) -> io::Result<bool> {
        thread::sleep(timeout);
        Ok(true)
    }
}

/// A single line requested from a GPIO character device.
pub struct CdevGpio {
    request: Request,
    offset: Offset,
}

impl CdevGpio {
    const CONSUMER: &'static str = "pulse-jig";

    /// Request `offset` on `chip` as an output, initially driven to `high`.
    pub fn output(chip: impl AsRef<Path>, offset: Offset, high: bool) -> io::Result<Self> {
        let request = Request::builder()
            .on_chip(chip.as_ref())
            .with_consumer(Self::CONSUMER)
            .with_line(offset)
            .as_output(level(high))
            .request()
            .map_err(gpio_error)?;
        debug!("gpio line {} requested as output", offset);
        Ok(CdevGpio { request, offset })
    }

    /// Request `offset` on `chip` as an input reporting both edges.
    pub fn input(chip: impl AsRef<Path>, offset: Offset) -> io::Result<Self> {
        let request = Request::builder()
            .on_chip(chip.as_ref())
            .with_consumer(Self::CONSUMER)
            .with_line(offset)
            .as_input()
            .with_edge_detection(EdgeDetection::BothEdges)
            .request()
            .map_err(gpio_error)?;
        debug!("gpio line {} requested as input", offset);
        Ok(CdevGpio { request, offset })
    }
}

impl OutputLine for CdevGpio {
    fn set_high(&mut self, high: bool) -> io::Result<()> {
        self.request
            .set_value(self.offset, level(high))
            .map_err(gpio_error)
    }
}

impl InputLine for CdevGpio {
    fn is_high(&self) -> io::Result<bool> {
        let value = self.request.value(self.offset).map_err(gpio_error)?;
        Ok(value == Value::Active)
    }

    fn wait_for_edge(&self, timeout: Duration) -> io::Result<bool> {
        if !self.request.wait_edge_event(timeout).map_err(gpio_error)? {
            return Ok(false);
        }
        // Drain the queue, only the current level matters.
        while self
            .request
            .wait_edge_event(Duration::from_millis(0))
            .map_err(gpio_error)?
        {
            let event = self.request.read_edge_event().map_err(gpio_error)?;
            trace!("gpio line {}: {:?}", self.offset, event.kind);
        }
        Ok(true)
    }
}

/// Reset line is active low. The sense switch pulls its line low while a
/// board is seated.
pub struct GpioPulseManager<O, I> {
    reset: O,
    sense: Arc<I>,
    volume: PathBuf,
    mount_timeout: Duration,
    settle_time: Duration,
    /// Bumped for every registered removal callback so that a superseded
    /// watcher exits without firing.
    watch_generation: Arc<AtomicUsize>,
}

impl<O, I> GpioPulseManager<O, I>
where
    O: OutputLine,
    I: InputLine + 'static,
{
    pub fn new(reset: O, sense: I, volume: impl Into<PathBuf>) -> Self {
        GpioPulseManager {
            reset,
            sense: Arc::new(sense),
            volume: volume.into(),
            mount_timeout: Duration::from_secs(15),
            settle_time: Duration::from_secs(10),
            watch_generation: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// How long the device is given to boot after flashing.
    pub fn settle_time(mut self, settle_time: Duration) -> Self {
        self.settle_time = settle_time;
        self
    }

    /// How long to wait for the programmer's volume after a (re)connection.
    pub fn mount_timeout(mut self, mount_timeout: Duration) -> Self {
        self.mount_timeout = mount_timeout;
        self
    }

    fn wait_for_volume(&self) -> Result<(), FirmwareError> {
        let timeout = Timeout::new(self.mount_timeout);
        loop {
            if is_writable_dir(&self.volume) {
                return Ok(());
            }
            if timeout.expired() {
                return Err(FirmwareError::VolumeUnavailable(self.volume.clone()));
            }
            thread::sleep(VOLUME_POLL_PERIOD);
        }
    }
}

impl<O, I> PulseManager for GpioPulseManager<O, I>
where
    O: OutputLine,
    I: InputLine + 'static,
{
    fn reset_device(&mut self) -> io::Result<()> {
        debug!("reset_device()");
        self.reset.set_high(false)?;
        thread::sleep(RESET_PULSE);
        self.reset.set_high(true)
    }

    fn is_connected(&self) -> bool {
        board_seated(self.sense.as_ref())
    }

    fn await_removal(&mut self) {
        while board_seated(self.sense.as_ref()) {
            wait_for_edge(self.sense.as_ref());
        }
    }

    fn on_removal(&mut self, callback: Box<dyn FnOnce() + Send>) {
        let generation = self.watch_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let current = Arc::clone(&self.watch_generation);
        let sense = Arc::clone(&self.sense);
        thread::spawn(move || {
            while board_seated(sense.as_ref()) {
                if current.load(Ordering::SeqCst) != generation {
                    return;
                }
                wait_for_edge(sense.as_ref());
            }
            if current.load(Ordering::SeqCst) == generation {
                debug!("board removed");
                callback();
            }
        });
    }

    fn load_firmware(&mut self, image: &Path) -> Result<(), FirmwareError> {
        let name = match image.file_name() {
            Some(name) if image.is_file() => name.to_owned(),
            _ => return Err(FirmwareError::MissingImage(image.to_owned())),
        };
        self.wait_for_volume()?;

        let source = image.to_owned();
        let destination = self.volume.join(name);

        // The programmer only accepts the image while the target is held in
        // reset.
        self.reset.set_high(false).map_err(FirmwareError::Reset)?;
        info!("copying {} to {}", source.display(), destination.display());
        let copy = thread::spawn(move || fs::copy(&source, &destination));
        thread::sleep(RESET_PULSE);
        let released = self.reset.set_high(true);

        debug!("waiting for copy");
        let copied = copy.join().map_err(|_| FirmwareError::CopyPanicked)?;
        released.map_err(FirmwareError::Reset)?;
        let bytes = copied.map_err(|e| {
            error!("firmware copy failed: {}", e);
            FirmwareError::Copy(e)
        })?;
        debug!("copied {} bytes, giving the device {:?}", bytes, self.settle_time);
        thread::sleep(self.settle_time);
        Ok(())
    }
}

// =============================================================================
// Private stuff
// =============================================================================

fn board_seated(sense: &dyn InputLine) -> bool {
    match sense.is_high() {
        Ok(high) => !high,
        Err(e) => {
            debug!("sense line: {}", e);
            false
        }
    }
}

/// Waits at most one poll period so that superseded watchers notice.
fn wait_for_edge(sense: &dyn InputLine) {
    if let Err(e) = sense.wait_for_edge(SENSE_POLL_PERIOD) {
        debug!("sense line: {}", e);
        thread::sleep(SENSE_POLL_PERIOD);
    }
}

fn level(high: bool) -> Value {
    if high {
        Value::Active
    } else {
        Value::Inactive
    }
}

fn gpio_error(e: gpiocdev::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

fn is_writable_dir(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_dir() && !meta.permissions().readonly())
        .unwrap_or(false)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::AtomicBool,
        mpsc,
        Mutex,
    };

    #[derive(Clone, Default)]
    struct Line {
        high: Arc<AtomicBool>,
        history: Arc<Mutex<Vec<bool>>>,
    }

    impl OutputLine for Line {
        fn set_high(&mut self, high: bool) -> io::Result<()> {
            self.high.store(high, Ordering::SeqCst);
            self.history.lock().unwrap().push(high);
            Ok(())
        }
    }

    impl InputLine for Line {
        fn is_high(&self) -> io::Result<bool> {
            Ok(self.high.load(Ordering::SeqCst))
        }
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("pulse-jig-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn reset_pulses_low_then_high() {
        let reset = Line::default();
        let mut manager = GpioPulseManager::new(reset.clone(), Line::default(), "/nonexistent");
        manager.reset_device().unwrap();
        assert_eq!(*reset.history.lock().unwrap(), vec![false, true]);
    }

    #[test]
    fn seated_board_pulls_sense_low() {
        let sense = Line::default();
        let manager = GpioPulseManager::new(Line::default(), sense.clone(), "/nonexistent");
        assert!(manager.is_connected());
        sense.high.store(true, Ordering::SeqCst);
        assert!(!manager.is_connected());
    }

    #[test]
    fn removal_callback_fires_once() {
        let sense = Line::default();
        let mut manager = GpioPulseManager::new(Line::default(), sense.clone(), "/nonexistent");
        let (tx, rx) = mpsc::channel();
        manager.on_removal(Box::new(move || tx.send(()).unwrap()));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        sense.high.store(true, Ordering::SeqCst);
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn superseded_removal_callback_does_not_fire() {
        let sense = Line::default();
        let mut manager = GpioPulseManager::new(Line::default(), sense.clone(), "/nonexistent");
        let (first_tx, first_rx) = mpsc::channel();
        let (second_tx, second_rx) = mpsc::channel();
        manager.on_removal(Box::new(move || first_tx.send(()).unwrap()));
        manager.on_removal(Box::new(move || second_tx.send(()).unwrap()));
        sense.high.store(true, Ordering::SeqCst);
        assert!(second_rx.recv_timeout(Duration::from_secs(1)).is_ok());
        assert!(first_rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    /// A sense line reporting edges through a channel, like a cdev request
    /// with edge detection.
    struct EdgeLine {
        high: Arc<AtomicBool>,
        edges: Mutex<mpsc::Receiver<()>>,
        waits: Arc<AtomicUsize>,
    }

    impl InputLine for EdgeLine {
        fn is_high(&self) -> io::Result<bool> {
            Ok(self.high.load(Ordering::SeqCst))
        }

        fn wait_for_edge(&self, timeout: Duration) -> io::Result<bool> {
            self.waits.fetch_add(1, Ordering::SeqCst);
            Ok(self.edges.lock().unwrap().recv_timeout(timeout).is_ok())
        }
    }

    #[test]
    fn removal_is_detected_on_edge() {
        let high = Arc::new(AtomicBool::new(false));
        let waits = Arc::new(AtomicUsize::new(0));
        let (edge_tx, edge_rx) = mpsc::channel();
        let sense = EdgeLine {
            high: Arc::clone(&high),
            edges: Mutex::new(edge_rx),
            waits: Arc::clone(&waits),
        };
        let mut manager = GpioPulseManager::new(Line::default(), sense, "/nonexistent");
        let (tx, rx) = mpsc::channel();
        manager.on_removal(Box::new(move || tx.send(()).unwrap()));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(waits.load(Ordering::SeqCst) > 0);

        high.store(true, Ordering::SeqCst);
        edge_tx.send(()).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
    }

    struct BrokenEdges(Arc<AtomicBool>);

    impl InputLine for BrokenEdges {
        fn is_high(&self) -> io::Result<bool> {
            Ok(self.0.load(Ordering::SeqCst))
        }

        fn wait_for_edge(&self, _timeout: Duration) -> io::Result<bool> {
            Err(io::Error::new(io::ErrorKind::Other, "edge queue gone"))
        }
    }

    #[test]
    fn await_removal_survives_edge_errors() {
        let high = Arc::new(AtomicBool::new(false));
        let mut manager =
            GpioPulseManager::new(Line::default(), BrokenEdges(Arc::clone(&high)), "/nonexistent");
        let flip = Arc::clone(&high);
        let pull = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            flip.store(true, Ordering::SeqCst);
        });
        manager.await_removal();
        assert!(high.load(Ordering::SeqCst));
        pull.join().unwrap();
    }

    #[test]
    fn firmware_is_copied_while_in_reset() {
        let source = scratch_dir("image");
        let volume = scratch_dir("volume");
        let image = source.join("test-firmware.bin");
        fs::write(&image, b"\x7fELF").unwrap();

        let reset = Line::default();
        let mut manager = GpioPulseManager::new(reset.clone(), Line::default(), &volume)
            .settle_time(Duration::from_millis(1));
        manager.load_firmware(&image).unwrap();

        assert_eq!(fs::read(volume.join("test-firmware.bin")).unwrap(), b"\x7fELF");
        assert_eq!(*reset.history.lock().unwrap(), vec![false, true]);
    }

    #[test]
    fn missing_image() {
        let volume = scratch_dir("volume-missing");
        let mut manager = GpioPulseManager::new(Line::default(), Line::default(), &volume);
        let err = manager
            .load_firmware(Path::new("/nonexistent/firmware.bin"))
            .unwrap_err();
        assert!(matches!(err, FirmwareError::MissingImage(_)));
    }

    #[test]
    fn volume_never_mounted() {
        let source = scratch_dir("image-unmounted");
        let image = source.join("firmware.bin");
        fs::write(&image, b"fw").unwrap();
        let mut manager =
            GpioPulseManager::new(Line::default(), Line::default(), source.join("not-mounted"))
                .mount_timeout(Duration::from_millis(10));
        let err = manager.load_firmware(&image).unwrap_err();
        assert!(matches!(err, FirmwareError::VolumeUnavailable(_)));
    }
}
