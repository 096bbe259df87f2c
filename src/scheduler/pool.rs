use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use crate::config::{ProbeConfig, RunnerConfig, DEFAULT_UNFIT_BACKOFF};
use crate::error::{AfrunError, Result};
use crate::scheduler::probe::{DeviceProbe, NvidiaSmiProbe, StaticProbe};

#[derive(Debug)]
struct PoolShared {
    idle: Mutex<VecDeque<u32>>,
    capacity: usize,
    /// Signalled once per token returned to the pool.
    available: Notify,
}

impl PoolShared {
    fn idle(&self) -> MutexGuard<'_, VecDeque<u32>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn put_back(&self, device: u32) {
        {
            let mut idle = self.idle();
            if idle.len() >= self.capacity || idle.contains(&device) {
                tracing::error!(device, "Device already idle or pool full, ignoring");
                return;
            }
            idle.push_back(device);
        }
        self.available.notify_one();
    }
}

/// Fixed set of exclusive devices shared by stage executions.
///
/// Each device id is, at any instant, either idle in the pool or held by
/// exactly one [`DeviceLease`]. The set never grows or shrinks after
/// construction.
#[derive(Clone)]
pub struct DevicePool {
    shared: Arc<PoolShared>,
    probe: Arc<dyn DeviceProbe>,
    unfit_backoff: Duration,
}

impl std::fmt::Debug for DevicePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevicePool")
            .field("capacity", &self.shared.capacity)
            .field("available", &self.available())
            .field("unfit_backoff", &self.unfit_backoff)
            .finish()
    }
}

impl DevicePool {
    pub fn new(devices: Vec<u32>, probe: Arc<dyn DeviceProbe>) -> Result<Self> {
        let mut idle = VecDeque::with_capacity(devices.len());
        for device in devices {
            if idle.contains(&device) {
                return Err(AfrunError::Validation(format!(
                    "device {} listed more than once",
                    device
                )));
            }
            idle.push_back(device);
        }
        if idle.is_empty() {
            return Err(AfrunError::Validation("device pool needs at least one device".into()));
        }

        Ok(Self {
            shared: Arc::new(PoolShared {
                capacity: idle.len(),
                idle: Mutex::new(idle),
                available: Notify::new(),
            }),
            probe,
            unfit_backoff: DEFAULT_UNFIT_BACKOFF,
        })
    }

    pub fn from_config(config: &RunnerConfig) -> Result<Self> {
        let probe: Arc<dyn DeviceProbe> = match config.probe {
            ProbeConfig::NvidiaSmi => Arc::new(NvidiaSmiProbe::default()),
            ProbeConfig::Disabled => Arc::new(StaticProbe::unlimited()),
        };
        Ok(Self::new(config.devices.clone(), probe)?.with_unfit_backoff(config.unfit_backoff))
    }

    pub fn with_unfit_backoff(mut self, backoff: Duration) -> Self {
        self.unfit_backoff = backoff;
        self
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Number of devices currently idle in the pool.
    pub fn available(&self) -> usize {
        self.shared.idle().len()
    }

    /// Wait until a device with at least `min_free_mb` free memory is idle
    /// and take it.
    ///
    /// An empty pool wakes the caller as soon as a device is returned. A
    /// device that fails the fitness check (or whose check errors) goes back
    /// into the pool and the caller sleeps the unfit backoff before trying
    /// again. There is no timeout; dropping the future gives up the wait
    /// without losing a device.
    pub async fn acquire(&self, min_free_mb: u64) -> DeviceLease {
        loop {
            let notified = self.shared.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let popped = self.shared.idle().pop_front();
            let Some(device) = popped else {
                tracing::info!(capacity = self.capacity(), "All devices in use, waiting");
                notified.await;
                continue;
            };

            // Owned from here on, so cancellation during the probe returns it.
            let lease = DeviceLease {
                shared: self.shared.clone(),
                device,
                released: false,
            };

            match self.probe.free_memory_mb(device).await {
                Ok(free) if free >= min_free_mb => {
                    tracing::info!(device, free_mb = free, "Acquired device");
                    return lease;
                }
                Ok(free) => {
                    tracing::info!(device, free_mb = free, min_free_mb, "Device has insufficient memory");
                }
                Err(e) => {
                    tracing::warn!(device, error = %e, "Device check failed, treating as unfit");
                }
            }

            drop(lease);
            tokio::time::sleep(self.unfit_backoff).await;
        }
    }
}

/// Exclusive hold on one device, returned to its pool on release or drop.
#[derive(Debug)]
pub struct DeviceLease {
    shared: Arc<PoolShared>,
    device: u32,
    released: bool,
}

impl DeviceLease {
    pub fn device(&self) -> u32 {
        self.device
    }

    /// Return the device to the pool.
    pub fn release(mut self) {
        self.give_back();
    }

    fn give_back(&mut self) {
        if !self.released {
            self.released = true;
            self.shared.put_back(self.device);
            tracing::info!(device = self.device, "Released device");
        }
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.give_back();
    }
}
