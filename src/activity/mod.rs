use crate::model::ActivityFlag;
use crate::platform::HostPlatform;
use crate::state::StateStore;
use crate::status::StatusPublisher;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivitySettings {
    /// Quiet period after the last fresh activity before going inactive.
    pub idle_threshold: Duration,
    pub sample_interval: Duration,
    /// Idle readings below this many seconds count as fresh activity.
    pub active_floor_secs: u64,
}

impl Default for ActivitySettings {
    fn default() -> Self {
        Self {
            idle_threshold: Duration::from_secs(10),
            sample_interval: Duration::from_millis(500),
            active_floor_secs: 2,
        }
    }
}

/// An idle reading is fresh activity when it dropped since the previous
/// sample or sits below the floor.
pub fn is_fresh_activity(previous: Option<u64>, idle_secs: u64, floor_secs: u64) -> bool {
    idle_secs < floor_secs || previous.is_some_and(|prev| idle_secs < prev)
}

/// Turns the sampled idle time into a debounced active/inactive flag.
pub struct ActivityDebouncer {
    store: Arc<StateStore>,
    status: Arc<StatusPublisher>,
    host: Arc<dyn HostPlatform>,
    settings: ActivitySettings,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl ActivityDebouncer {
    pub fn new(
        store: Arc<StateStore>,
        status: Arc<StatusPublisher>,
        host: Arc<dyn HostPlatform>,
        settings: ActivitySettings,
    ) -> Self {
        Self {
            store,
            status,
            host,
            settings,
            timer: Mutex::new(None),
        }
    }

    /// Reads the idle time once. A failed read leaves the activity state
    /// untouched.
    pub async fn sample(self: &Arc<Self>) {
        match self.host.idle_seconds().await {
            Ok(idle) => self.record_sample(idle),
            Err(err) => tracing::warn!("Error getting system idle time: {}", err),
        }
    }

    pub fn record_sample(self: &Arc<Self>, idle_secs: u64) {
        let previous = self
            .store
            .update_activity(|activity| activity.last_idle_secs.replace(idle_secs));
        if is_fresh_activity(previous, idle_secs, self.settings.active_floor_secs) {
            self.arm();
        }
        self.status.publish_idle_time(idle_secs);
    }

    /// Marks the user active and re-arms the single inactivity timer. The
    /// timer slot lock is held across the state update so two samples cannot
    /// both leave a live timer behind.
    fn arm(self: &Arc<Self>) {
        let mut slot = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let deadline = now + self.settings.idle_threshold;
        let (became_active, generation) = self.store.update_activity(|activity| {
            let became_active = activity.flag == ActivityFlag::Inactive;
            if became_active {
                activity.flag = ActivityFlag::Active;
                activity.last_transition = Some(now);
            }
            activity.generation += 1;
            activity.pending_deadline = Some(deadline);
            (became_active, activity.generation)
        });

        if let Some(previous) = slot.take() {
            previous.abort();
        }
        let this = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            this.expire(generation);
        }));
        drop(slot);

        if became_active {
            tracing::info!("User activity detected - state: active");
            self.status.publish_activity(ActivityFlag::Active);
        }
    }

    /// Fires the inactive transition if `generation` is still the armed one.
    fn expire(&self, generation: u64) -> bool {
        let went_inactive = self.store.update_activity(|activity| {
            if activity.generation != generation || activity.flag == ActivityFlag::Inactive {
                return false;
            }
            activity.flag = ActivityFlag::Inactive;
            activity.last_transition = Some(Instant::now());
            activity.pending_deadline = None;
            true
        });
        if went_inactive {
            tracing::info!("User activity state changed to: inactive");
            self.status.publish_activity(ActivityFlag::Inactive);
        }
        went_inactive
    }

    /// Samples forever. Samples continue while the link is down so the flag
    /// is current for the resync on reconnect.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            "Starting user activity monitoring (threshold {}s)",
            self.settings.idle_threshold.as_secs()
        );
        let mut ticker = tokio::time::interval(self.settings.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.sample().await;
        }
    }
}
