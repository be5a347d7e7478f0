//! Status engine
//!
//! Polls every registered printer once per tick, folds the samples into a
//! per-device cache, and pushes one [`BroadcastRecord`] per device to the
//! update sink. Each device poll runs as its own task and owns that device's
//! cache while it is in flight; a poll that outlives its tick carries over,
//! and the device is skipped until it lands. Driver calls are bounded by a
//! timeout and each poll runs inside its own panic guard, so a misbehaving
//! printer only ever degrades its own record.

mod cache;
mod record;

pub use record::{BroadcastRecord, ServerMessage};

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};

use crate::driver::{DriverError, PrinterDriver};
use crate::hub::UpdateSink;
use crate::registry::{DeviceId, DeviceRegistry};
use crate::status::NormalizedStatus;
use cache::{round_percentage, DeviceTickCache};

const REFRESH_QUEUE_DEPTH: usize = 32;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tick_interval: Duration,
    /// Minimum spacing between filament samples for one device.
    pub filament_interval: Duration,
    /// Upper bound on any single driver call.
    pub driver_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            filament_interval: Duration::from_secs(10),
            driver_timeout: Duration::from_secs(3),
        }
    }
}

/// Cloneable control surface for a running [`StatusEngine`].
#[derive(Clone)]
pub struct EngineHandle {
    refresh_tx: mpsc::Sender<DeviceId>,
    shutdown_tx: broadcast::Sender<()>,
    driver_timeout: Duration,
}

impl EngineHandle {
    /// Bound applied to every driver call, shared with the HTTP layer.
    pub fn driver_timeout(&self) -> Duration {
        self.driver_timeout
    }

    /// Ask the engine to poll and broadcast `id` now, outside the tick cadence.
    /// Returns false if the engine is gone or the queue is full.
    pub fn refresh(&self, id: &str) -> bool {
        match self.refresh_tx.try_send(id.to_string()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Refresh queue full, dropping refresh for {}", id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Stop the loop after its current iteration.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// A finished device poll, handing the cache back to the engine.
struct PollOutcome {
    id: DeviceId,
    cache: DeviceTickCache,
    record: BroadcastRecord,
}

pub struct StatusEngine {
    registry: Arc<DeviceRegistry>,
    sink: Arc<dyn UpdateSink>,
    config: EngineConfig,
    /// Caches of devices with no poll in flight.
    caches: HashMap<DeviceId, DeviceTickCache>,
    in_flight: HashSet<DeviceId>,
    /// Devices to poll again as soon as their in-flight poll lands.
    requeued: HashSet<DeviceId>,
    // At most one outcome per in-flight device, so the queue stays small.
    done_tx: mpsc::UnboundedSender<PollOutcome>,
    done_rx: mpsc::UnboundedReceiver<PollOutcome>,
    refresh_rx: mpsc::Receiver<DeviceId>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl StatusEngine {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        sink: Arc<dyn UpdateSink>,
        config: EngineConfig,
    ) -> (Self, EngineHandle) {
        let (refresh_tx, refresh_rx) = mpsc::channel(REFRESH_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let driver_timeout = config.driver_timeout;

        let engine = Self {
            registry,
            sink,
            config,
            caches: HashMap::new(),
            in_flight: HashSet::new(),
            requeued: HashSet::new(),
            done_tx,
            done_rx,
            refresh_rx,
            shutdown_rx,
        };
        (
            engine,
            EngineHandle {
                refresh_tx,
                shutdown_tx,
                driver_timeout,
            },
        )
    }

    /// Run one tick: start a poll for every registered device that has none
    /// in flight, then publish outcomes as they land until every device is
    /// idle or one tick interval has passed. Returns the records published,
    /// in completion order. Polls still running carry over to later ticks.
    pub async fn tick(&mut self) -> Vec<BroadcastRecord> {
        let deadline = Instant::now() + self.config.tick_interval;
        let drivers = self.registry.drivers().await;

        // Forget devices that were removed since the last tick.
        let live: HashSet<&DeviceId> = drivers.iter().map(|(id, _)| id).collect();
        self.caches.retain(|id, _| live.contains(id));
        self.requeued.retain(|id| live.contains(id));

        for (id, driver) in drivers {
            if self.in_flight.contains(&id) {
                log::debug!("[{}] Previous poll still running, skipping this tick", id);
                continue;
            }
            self.dispatch(id, driver);
        }

        let mut records = Vec::new();
        while !self.in_flight.is_empty() {
            let outcome = match tokio::time::timeout_at(deadline, self.done_rx.recv()).await {
                Ok(Some(outcome)) => outcome,
                Ok(None) | Err(_) => break,
            };
            if let Some(record) = self.complete(outcome).await {
                records.push(record);
            }
        }
        records
    }

    /// Poll and broadcast a single device now. If a poll for it is already
    /// in flight, another follows as soon as that one lands. Returns false
    /// if the device is not registered.
    pub async fn refresh(&mut self, id: &str) -> bool {
        let Some(driver) = self.registry.get(id).await else {
            return false;
        };
        if self.in_flight.contains(id) {
            self.requeued.insert(id.to_string());
        } else {
            self.dispatch(id.to_string(), driver);
        }
        true
    }

    /// Hand the device's cache to a fresh poll task.
    fn dispatch(&mut self, id: DeviceId, driver: Arc<dyn PrinterDriver>) {
        let mut cache = self.caches.remove(&id).unwrap_or_default();
        let config = self.config.clone();
        let done = self.done_tx.clone();
        self.in_flight.insert(id.clone());

        tokio::spawn(async move {
            let record = poll_isolated(&id, driver, &mut cache, &config).await;
            let _ = done.send(PollOutcome { id, cache, record });
        });
    }

    /// Take back a finished poll's cache and publish its record. Outcomes
    /// for devices removed mid-poll are dropped.
    async fn complete(&mut self, outcome: PollOutcome) -> Option<BroadcastRecord> {
        let PollOutcome { id, cache, record } = outcome;
        self.in_flight.remove(&id);

        let Some(driver) = self.registry.get(&id).await else {
            log::debug!("[{}] Dropping poll result for removed printer", id);
            self.requeued.remove(&id);
            return None;
        };
        self.caches.insert(id.clone(), cache);
        if self.requeued.remove(&id) {
            self.dispatch(id, driver);
        }

        self.sink.publish(&ServerMessage::from(record.clone())).await;
        Some(record)
    }

    /// Drive ticks until [`EngineHandle::shutdown`] is called, then close
    /// every subscriber.
    pub async fn run(mut self) {
        log::info!(
            "Status engine started (tick {:?}, filament every {:?})",
            self.config.tick_interval,
            self.config.filament_interval
        );

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Ok(()) = self.shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    if AssertUnwindSafe(self.tick()).catch_unwind().await.is_err() {
                        log::error!("Status tick panicked; continuing on next interval");
                    }
                }
                Some(outcome) = self.done_rx.recv() => {
                    let id = outcome.id.clone();
                    if AssertUnwindSafe(self.complete(outcome)).catch_unwind().await.is_err() {
                        log::error!("[{}] Publishing poll result panicked", id);
                    }
                }
                Some(id) = self.refresh_rx.recv() => {
                    match AssertUnwindSafe(self.refresh(&id)).catch_unwind().await {
                        Ok(true) => log::debug!("[{}] Out-of-band refresh scheduled", id),
                        Ok(false) => log::debug!("[{}] Refresh requested for unknown printer", id),
                        Err(_) => log::error!("[{}] Refresh panicked", id),
                    }
                }
            }
        }

        self.sink.close().await;
        log::info!("Status engine stopped");
    }
}

/// Await a driver call, turning an overrun into [`DriverError::Timeout`].
pub(crate) async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, DriverError>>,
) -> Result<T, DriverError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::Timeout(limit)),
    }
}

/// Poll one device behind a panic guard. A panic yields an error-shaped
/// record that still carries the last known tray type.
async fn poll_isolated(
    id: &str,
    driver: Arc<dyn PrinterDriver>,
    cache: &mut DeviceTickCache,
    config: &EngineConfig,
) -> BroadcastRecord {
    let polled = AssertUnwindSafe(poll_device(id, driver.as_ref(), &mut *cache, config))
        .catch_unwind()
        .await;

    match polled {
        Ok(record) => record,
        Err(_) => {
            log::error!("[{}] Driver panicked while polling", id);
            cache.status_failing = true;
            BroadcastRecord {
                printer_id: id.to_string(),
                percentage: None,
                percentage_changed: cache.observe_percentage(None),
                tray_type: cache.last_tray_type.clone(),
                tray_type_changed: false,
                status: NormalizedStatus::unavailable("driver panicked"),
            }
        }
    }
}

async fn poll_device(
    id: &str,
    driver: &dyn PrinterDriver,
    cache: &mut DeviceTickCache,
    config: &EngineConfig,
) -> BroadcastRecord {
    let limit = config.driver_timeout;

    let status = match bounded(limit, driver.status()).await {
        Ok(raw) => {
            if cache.status_failing {
                log::info!("[{}] Status available again", id);
                cache.status_failing = false;
            }
            NormalizedStatus::from_raw(&raw)
        }
        Err(e) => {
            if !cache.status_failing {
                log::warn!("[{}] Status unavailable: {}", id, e);
                cache.status_failing = true;
            }
            NormalizedStatus::unavailable(e.to_string())
        }
    };

    let percentage = match bounded(limit, driver.percentage()).await {
        Ok(raw) => round_percentage(raw),
        Err(e) => {
            log::debug!("[{}] Percentage unavailable: {}", id, e);
            None
        }
    };
    let percentage_changed = cache.observe_percentage(percentage);

    let now = Instant::now();
    let mut sampled_tray = None;
    if cache.filament_due(now) {
        match bounded(limit, driver.filament()).await {
            Ok(report) => {
                cache.filament_sampled(now, config.filament_interval);
                sampled_tray = report.tray_type;
            }
            Err(e) => log::debug!("[{}] Filament info unavailable: {}", id, e),
        }
    }
    let (tray_type, tray_type_changed) = cache.observe_tray_type(sampled_tray);

    BroadcastRecord {
        printer_id: id.to_string(),
        percentage,
        percentage_changed,
        tray_type,
        tray_type_changed,
        status,
    }
}
