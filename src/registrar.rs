//! The remote registration service, as seen by the provisioner.
//!
//! The provisioner registers every freshly minted identity before writing it
//! to the device, and submits one provisioning record per device iteration.
//! Before touching the service it checks the [`NetworkStatus`], which is kept
//! up to date by a [`NetworkMonitor`] probing the service in the background.

use std::{
    collections::BTreeMap,
    fmt,
    net::{TcpStream, ToSocketAddrs},
    io,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, info, warn};
use serde::Serialize;

use crate::hwspec::HwSpec;

// =============================================================================
// Public Interface
// =============================================================================

/// Additional named values sent along a registration or a record.
pub type ExtraFields = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[repr(u8)]
pub enum NetworkStatus {
    Connected = 0,
    NotConnected = 1,
    Timeout = 2,
    Error = 3,
}

impl NetworkStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => NetworkStatus::Connected,
            1 => NetworkStatus::NotConnected,
            2 => NetworkStatus::Timeout,
            _ => NetworkStatus::Error,
        }
    }
}

impl fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkStatus::Connected => "CONNECTED",
            NetworkStatus::NotConnected => "NOT_CONNECTED",
            NetworkStatus::Timeout => "TIMEOUT",
            NetworkStatus::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// The outcome of one device iteration, as submitted to the registrar.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisioningRecord {
    pub hwspec: HwSpec,
    /// `PASSED`, `FAILED`, ...
    pub status: String,
    /// Protocol transcript of the iteration.
    pub logs: String,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

pub trait Registrar: Send {
    /// Register a newly minted identity. `false` if the registration was
    /// refused or could not be sent.
    fn register_serial(&mut self, hwspec: &HwSpec, extra: &ExtraFields) -> bool;

    /// `false` if the record could not be stored.
    fn submit_provisioning_record(&mut self, record: &ProvisioningRecord) -> bool;

    fn network_status(&self) -> NetworkStatus;
}

/// A network status shared between the thread probing the network and its
/// readers.
#[derive(Debug, Clone)]
pub struct SharedNetworkStatus(Arc<AtomicU8>);

impl SharedNetworkStatus {
    pub fn new(status: NetworkStatus) -> Self {
        SharedNetworkStatus(Arc::new(AtomicU8::new(status as u8)))
    }

    pub fn get(&self) -> NetworkStatus {
        NetworkStatus::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, status: NetworkStatus) {
        let previous = NetworkStatus::from_u8(self.0.swap(status as u8, Ordering::SeqCst));
        if previous != status {
            info!("network status: {} -> {}", previous, status);
        }
    }
}

/// One reachability check of the registration service.
pub trait Prober: Send + 'static {
    fn probe(&mut self) -> NetworkStatus;
}

impl<F> Prober for F
where
    F: FnMut() -> NetworkStatus + Send + 'static,
{
    fn probe(&mut self) -> NetworkStatus {
        self()
    }
}

/// Checks that a TCP connection to the service can be established.
#[derive(Debug, Clone)]
pub struct TcpProber {
    address: String,
    timeout: Duration,
}

impl TcpProber {
    /// `address` in `host:port` form.
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        TcpProber {
            address: address.into(),
            timeout,
        }
    }
}

impl Prober for TcpProber {
    fn probe(&mut self) -> NetworkStatus {
        let addresses = match self.address.to_socket_addrs() {
            Ok(addresses) => addresses,
            Err(e) => {
                debug!("cannot resolve {}: {}", self.address, e);
                return NetworkStatus::NotConnected;
            }
        };
        let mut status = NetworkStatus::NotConnected;
        for address in addresses {
            match TcpStream::connect_timeout(&address, self.timeout) {
                Ok(_) => return NetworkStatus::Connected,
                Err(e) => {
                    debug!("cannot reach {}: {}", address, e);
                    status = classify(&e);
                }
            }
        }
        status
    }
}

/// Background thread periodically probing the network and publishing the
/// result. Stopped and joined when dropped.
pub struct NetworkMonitor {
    status: SharedNetworkStatus,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl NetworkMonitor {
    const SLICE: Duration = Duration::from_millis(100);

    pub fn spawn(mut prober: impl Prober, interval: Duration) -> Self {
        let status = SharedNetworkStatus::new(NetworkStatus::NotConnected);
        let running = Arc::new(AtomicBool::new(true));

        let published = status.clone();
        let keep_running = Arc::clone(&running);
        let worker = thread::spawn(move || {
            while keep_running.load(Ordering::SeqCst) {
                published.set(prober.probe());
                let mut waited = Duration::from_secs(0);
                while waited < interval && keep_running.load(Ordering::SeqCst) {
                    thread::sleep(Self::SLICE);
                    waited += Self::SLICE;
                }
            }
            debug!("network monitor terminated");
        });

        NetworkMonitor {
            status,
            running,
            worker: Some(worker),
        }
    }

    pub fn status(&self) -> NetworkStatus {
        self.status.get()
    }

    /// A reader of the published status, e.g. for a [`Registrar`].
    pub fn shared_status(&self) -> SharedNetworkStatus {
        self.status.clone()
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("network monitor thread panicked");
            }
        }
    }
}

/// A registrar that only logs what it is given. Used when the jig is run
/// without a registration service, e.g. on the bench.
#[derive(Debug)]
pub struct ConsoleRegistrar {
    network: SharedNetworkStatus,
}

impl ConsoleRegistrar {
    pub fn new(network: SharedNetworkStatus) -> Self {
        ConsoleRegistrar { network }
    }

    /// A console registrar that always reports the network as connected.
    pub fn offline() -> Self {
        Self::new(SharedNetworkStatus::new(NetworkStatus::Connected))
    }
}

impl Registrar for ConsoleRegistrar {
    fn register_serial(&mut self, hwspec: &HwSpec, extra: &ExtraFields) -> bool {
        info!("register_serial: {} {:?}", hwspec.serial, extra);
        true
    }

    fn submit_provisioning_record(&mut self, record: &ProvisioningRecord) -> bool {
        info!("submit_provisioning_record:");
        info!("  status: {}", record.status);
        info!("  hwspec: {:?}", record.hwspec);
        for (key, value) in &record.extra {
            info!("  {}: {}", key, value);
        }
        let preview: String = record.logs.chars().take(70).collect();
        info!("  logs: {}...", preview.escape_debug());
        true
    }

    fn network_status(&self) -> NetworkStatus {
        self.network.get()
    }
}

// =============================================================================
// Private stuff
// =============================================================================

fn classify(e: &io::Error) -> NetworkStatus {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => NetworkStatus::Timeout,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::AddrNotAvailable => NetworkStatus::NotConnected,
        _ => NetworkStatus::Error,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
