use crate::model::{
    ActivityFlag, CpuTimes, CpuUsage, Display, MediaSnapshot, ModelServerSnapshot,
};
use std::sync::{PoisonError, RwLock};
use tokio::time::Instant;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityState {
    pub flag: ActivityFlag,
    pub last_transition: Option<Instant>,
    pub pending_deadline: Option<Instant>,
    /// Bumped every time the inactivity deadline is re-armed. A timer only
    /// fires its transition if the generation it was armed with is current.
    pub generation: u64,
    pub last_idle_secs: Option<u64>,
}

/// Shared mutable state. Each field has its own lock; callers copy values
/// out and publish after the lock is released.
#[derive(Debug, Default)]
pub struct StateStore {
    media: RwLock<MediaSnapshot>,
    activity: RwLock<ActivityState>,
    cpu_previous: RwLock<Option<CpuTimes>>,
    model_server: RwLock<ModelServerSnapshot>,
    displays: RwLock<Vec<Display>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn media(&self) -> MediaSnapshot {
        read(&self.media)
    }

    pub fn update_media<R>(&self, f: impl FnOnce(&mut MediaSnapshot) -> R) -> R {
        write(&self.media, f)
    }

    pub fn replace_media(&self, snapshot: MediaSnapshot) {
        write(&self.media, |current| *current = snapshot);
    }

    pub fn activity(&self) -> ActivityState {
        read(&self.activity)
    }

    pub fn update_activity<R>(&self, f: impl FnOnce(&mut ActivityState) -> R) -> R {
        write(&self.activity, f)
    }

    /// Records a new CPU counter sample and returns usage relative to the
    /// previous one. The first sample has no baseline and reports idle.
    pub fn record_cpu_sample(&self, current: CpuTimes) -> CpuUsage {
        write(&self.cpu_previous, |previous| {
            let usage = previous
                .map(|p| current.usage_since(&p))
                .unwrap_or_else(CpuUsage::idle);
            *previous = Some(current);
            usage
        })
    }

    pub fn model_server(&self) -> ModelServerSnapshot {
        read(&self.model_server)
    }

    pub fn set_model_server(&self, snapshot: ModelServerSnapshot) {
        write(&self.model_server, |current| *current = snapshot);
    }

    pub fn displays(&self) -> Vec<Display> {
        read(&self.displays)
    }

    pub fn set_displays(&self, displays: Vec<Display>) {
        write(&self.displays, |current| *current = displays);
    }

    pub fn has_display(&self, display_id: &str) -> bool {
        self.displays
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|d| d.display_id == display_id)
    }
}

fn read<T: Clone>(lock: &RwLock<T>) -> T {
    lock.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn write<T, R>(lock: &RwLock<T>, f: impl FnOnce(&mut T) -> R) -> R {
    let mut guard = lock.write().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard)
}
