//! Cron-driven polling of registered devices.
//!
//! Every registered device gets one timer task that sleeps until the next
//! firing of its cadence and then runs `check_state`. Runs go through a
//! bounded worker pool and are guarded by a lease keyed on the device's lock
//! key, so overlapping ticks for one device (from this process or another
//! sharing the lease store) execute at most once.
//!
//! The next firing is computed after the previous run completes; firings
//! that pass while a run is in progress are skipped, not queued.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::device::{lock_key, CheckOutcome, Device};
use crate::lease::{execute_with_lease, LeaseConfig, LeaseOutcome, LeaseProvider};

pub const DEFAULT_POOL_SIZE: usize = 3;
pub const DEFAULT_LEASE_MIN_HOLD: Duration = Duration::from_secs(5);
pub const DEFAULT_LEASE_MAX_HOLD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    /// Upper bound on concurrently running checks.
    pub pool_size: usize,
    pub lease_min_hold: Duration,
    pub lease_max_hold: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            lease_min_hold: DEFAULT_LEASE_MIN_HOLD,
            lease_max_hold: DEFAULT_LEASE_MAX_HOLD,
        }
    }
}

/// Result of one scheduled or manually triggered run.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Executed(CheckOutcome),
    /// Another run holds the device's lease; this one was skipped.
    LeaseUnavailable,
    /// The check or the lease bookkeeping failed. Already logged.
    Failed,
    UnknownSensor,
}

struct Registration {
    device: Arc<dyn Device>,
    timer: JoinHandle<()>,
}

pub struct Scheduler {
    leases: Arc<dyn LeaseProvider>,
    workers: Semaphore,
    settings: SchedulerSettings,
    scheduled: Mutex<HashMap<String, Registration>>,
}

impl Scheduler {
    pub fn new(leases: Arc<dyn LeaseProvider>, settings: SchedulerSettings) -> Arc<Self> {
        Arc::new(Self {
            leases,
            workers: Semaphore::new(settings.pool_size.max(1)),
            settings,
            scheduled: Mutex::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Start polling `device` on its cadence. Returns `false` without
    /// scheduling anything if a device with the same lock key is already
    /// registered.
    pub async fn register(self: &Arc<Self>, device: Arc<dyn Device>) -> bool {
        let key = lock_key(device.as_ref());
        let mut scheduled = self.scheduled.lock().await;
        if scheduled.contains_key(&key) {
            debug!(sensor = %key, "scheduler: already registered");
            return false;
        }

        info!(
            sensor = %key,
            name = %device.display_name(),
            cron = %device.cadence().expression(),
            "scheduler: registered"
        );
        let timer = tokio::spawn(run_timer(Arc::downgrade(self), Arc::clone(&device)));
        scheduled.insert(key, Registration { device, timer });
        true
    }

    pub async fn is_registered(&self, key: &str) -> bool {
        self.scheduled.lock().await.contains_key(key)
    }

    pub async fn registered_count(&self) -> usize {
        self.scheduled.lock().await.len()
    }

    /// Stop every timer. Runs already in progress finish on their own.
    pub async fn shutdown(&self) {
        let mut scheduled = self.scheduled.lock().await;
        for (key, registration) in scheduled.drain() {
            registration.timer.abort();
            debug!(sensor = %key, "scheduler: timer stopped");
        }
        info!("scheduler: stopped");
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Run one check of a registered device right now, through the same
    /// worker pool and lease as scheduled ticks.
    pub async fn trigger(&self, device_type: &str, id: &str) -> TickOutcome {
        let key = format!("{device_type}-{id}");
        let device = {
            let scheduled = self.scheduled.lock().await;
            scheduled.get(&key).map(|r| Arc::clone(&r.device))
        };
        match device {
            Some(device) => self.execute(device.as_ref()).await,
            None => {
                warn!(sensor = %key, "scheduler: trigger for unknown sensor");
                TickOutcome::UnknownSensor
            }
        }
    }

    async fn execute(&self, device: &dyn Device) -> TickOutcome {
        let key = lock_key(device);
        let Ok(_permit) = self.workers.acquire().await else {
            error!(sensor = %key, "scheduler: worker pool closed");
            return TickOutcome::Failed;
        };

        let config = LeaseConfig::new(
            key.clone(),
            Utc::now(),
            self.settings.lease_max_hold,
            self.settings.lease_min_hold,
        );
        match execute_with_lease(self.leases.as_ref(), config, || device.check_state()).await {
            Ok(LeaseOutcome::Executed(Ok(outcome))) => TickOutcome::Executed(outcome),
            Ok(LeaseOutcome::Executed(Err(e))) => {
                error!(sensor = %key, "scheduler: check failed: {e:#}");
                TickOutcome::Failed
            }
            Ok(LeaseOutcome::Unavailable) => {
                debug!(sensor = %key, "scheduler: lease held elsewhere, skipping");
                TickOutcome::LeaseUnavailable
            }
            Err(e) => {
                error!(sensor = %key, "scheduler: lease unavailable: {e:#}");
                TickOutcome::Failed
            }
        }
    }
}

async fn run_timer(scheduler: Weak<Scheduler>, device: Arc<dyn Device>) {
    loop {
        let now = Utc::now();
        let Some(next) = device.cadence().next_after(now) else {
            warn!(
                sensor = %lock_key(device.as_ref()),
                cron = %device.cadence().expression(),
                "scheduler: cadence has no future firings"
            );
            return;
        };
        let wait = (next - now).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;

        let Some(scheduler) = scheduler.upgrade() else {
            return;
        };
        scheduler.execute(device.as_ref()).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadence::Cadence;
    use crate::lease::InMemoryLeaseProvider;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDevice {
        id: String,
        cadence: Cadence,
        custom_identifiers: BTreeMap<String, String>,
        runs: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl CountingDevice {
        fn new(id: &str, cron: &str) -> Self {
            Self {
                id: id.into(),
                cadence: cron.parse().unwrap(),
                custom_identifiers: BTreeMap::new(),
                runs: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: false,
            }
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Device for CountingDevice {
        fn id(&self) -> &str {
            &self.id
        }

        fn device_type(&self) -> &'static str {
            "counting-device"
        }

        fn display_name(&self) -> &str {
            &self.id
        }

        fn parameters(&self) -> BTreeMap<String, String> {
            BTreeMap::new()
        }

        fn custom_identifiers(&self) -> &BTreeMap<String, String> {
            &self.custom_identifiers
        }

        fn cadence(&self) -> &Cadence {
            &self.cadence
        }

        async fn check_state(&self) -> anyhow::Result<CheckOutcome> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                anyhow::bail!("sensor offline");
            }
            Ok(CheckOutcome::NoSamples)
        }
    }

    // Once a year: timers never fire during a test.
    const RARELY: &str = "0 0 0 1 1 *";

    fn scheduler() -> Arc<Scheduler> {
        Scheduler::new(Arc::new(InMemoryLeaseProvider::new()), SchedulerSettings::default())
    }

    #[test]
    fn settings_are_kept_as_configured() {
        let settings = SchedulerSettings {
            pool_size: 7,
            lease_min_hold: Duration::from_secs(2),
            lease_max_hold: Duration::from_secs(30),
        };
        let s = Scheduler::new(Arc::new(InMemoryLeaseProvider::new()), settings.clone());
        assert_eq!(s.settings(), &settings);
        assert_eq!(s.workers.available_permits(), 7);
    }

    #[tokio::test]
    async fn duplicate_registration_is_ignored() {
        let s = scheduler();
        let first = Arc::new(CountingDevice::new("washer", RARELY));
        let second = Arc::new(CountingDevice::new("washer", RARELY));

        assert!(s.register(first).await);
        assert!(!s.register(second).await);
        assert_eq!(s.registered_count().await, 1);
        assert!(s.is_registered("counting-device-washer").await);
    }

    #[tokio::test]
    async fn concurrent_registration_schedules_once() {
        let s = scheduler();
        let (a, b) = tokio::join!(
            s.register(Arc::new(CountingDevice::new("washer", RARELY))),
            s.register(Arc::new(CountingDevice::new("washer", RARELY))),
        );
        assert!(a ^ b);
        assert_eq!(s.registered_count().await, 1);
    }

    #[tokio::test]
    async fn overlapping_triggers_run_once() {
        let s = scheduler();
        let mut device = CountingDevice::new("washer", RARELY);
        device.delay = Duration::from_millis(100);
        let device = Arc::new(device);
        s.register(Arc::clone(&device) as Arc<dyn Device>).await;

        let (a, b) = tokio::join!(
            s.trigger("counting-device", "washer"),
            s.trigger("counting-device", "washer"),
        );

        let mut outcomes = [a, b];
        outcomes.sort_by_key(|o| matches!(o, TickOutcome::LeaseUnavailable));
        assert_eq!(
            outcomes,
            [
                TickOutcome::Executed(CheckOutcome::NoSamples),
                TickOutcome::LeaseUnavailable
            ]
        );
        assert_eq!(device.runs(), 1);
    }

    #[tokio::test]
    async fn trigger_inside_min_hold_is_skipped() {
        let s = scheduler();
        let device = Arc::new(CountingDevice::new("washer", RARELY));
        s.register(Arc::clone(&device) as Arc<dyn Device>).await;

        assert_eq!(
            s.trigger("counting-device", "washer").await,
            TickOutcome::Executed(CheckOutcome::NoSamples)
        );
        assert_eq!(
            s.trigger("counting-device", "washer").await,
            TickOutcome::LeaseUnavailable
        );
        assert_eq!(device.runs(), 1);
    }

    #[tokio::test]
    async fn failing_check_is_reported() {
        let s = scheduler();
        let mut device = CountingDevice::new("washer", RARELY);
        device.fail = true;
        s.register(Arc::new(device)).await;

        assert_eq!(s.trigger("counting-device", "washer").await, TickOutcome::Failed);
    }

    #[tokio::test]
    async fn unknown_sensor_trigger() {
        let s = scheduler();
        assert_eq!(s.trigger("counting-device", "ghost").await, TickOutcome::UnknownSensor);
    }

    #[tokio::test]
    async fn timer_fires_on_cadence() {
        let s = scheduler();
        let device = Arc::new(CountingDevice::new("washer", "* * * * * *"));
        s.register(Arc::clone(&device) as Arc<dyn Device>).await;

        let fired = tokio::time::timeout(Duration::from_secs(3), async {
            while device.runs() == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(fired.is_ok(), "device never ran");
    }

    #[tokio::test]
    async fn shutdown_stops_timers() {
        let s = scheduler();
        let device = Arc::new(CountingDevice::new("washer", "* * * * * *"));
        s.register(Arc::clone(&device) as Arc<dyn Device>).await;
        s.shutdown().await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(device.runs(), 0);
        assert_eq!(s.registered_count().await, 0);
    }
}
