//! Shared CAN bus connection for the syringe pumps.
//!
//! All pumps sit on one bus. The bus is opened when the first pump acquires a
//! lease and closed when the last lease is dropped. The manager owns the
//! single [`PumpBus`] and hands `Arc` clones to each pump adapter at
//! construction.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Reference-counted handle to the pump bus.
#[derive(Debug)]
pub struct PumpBus {
    device_config: PathBuf,
    leases: Mutex<usize>,
    open_count: AtomicU64,
}

impl PumpBus {
    /// Create a closed bus for the given device configuration directory.
    pub fn new(device_config: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            device_config: device_config.into(),
            leases: Mutex::new(0),
            open_count: AtomicU64::new(0),
        })
    }

    /// Device configuration the bus is opened with.
    pub fn device_config(&self) -> &Path {
        &self.device_config
    }

    /// Take a lease, opening the bus if no lease is outstanding.
    pub fn acquire(self: &Arc<Self>) -> BusLease {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        if *leases == 0 {
            info!(config = %self.device_config.display(), "Opening pump bus");
            self.open_count.fetch_add(1, Ordering::SeqCst);
        }
        *leases += 1;
        debug!(leases = *leases, "Pump bus lease acquired");
        BusLease {
            bus: Arc::clone(self),
        }
    }

    /// Whether any lease is outstanding.
    pub fn is_open(&self) -> bool {
        self.lease_count() > 0
    }

    /// Number of outstanding leases.
    pub fn lease_count(&self) -> usize {
        *self.leases.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// How many times the bus has been opened since construction.
    pub fn times_opened(&self) -> u64 {
        self.open_count.load(Ordering::SeqCst)
    }

    fn release(&self) {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        *leases = leases.saturating_sub(1);
        if *leases == 0 {
            info!("Closing pump bus");
        }
    }
}

/// Keeps the pump bus open while held.
#[derive(Debug)]
pub struct BusLease {
    bus: Arc<PumpBus>,
}

impl Drop for BusLease {
    fn drop(&mut self) {
        self.bus.release();
    }
}
