use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tick {
    /// Liveness, volume, mute, microphone and camera.
    Status,
    /// Battery, disk, cpu, memory, uptime and public IP.
    Metrics,
    /// Keep-awake, display brightness and model server.
    Power,
    NetworkCheck,
}

impl Tick {
    pub fn as_str(self) -> &'static str {
        match self {
            Tick::Status => "status",
            Tick::Metrics => "metrics",
            Tick::Power => "power",
            Tick::NetworkCheck => "network check",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleSettings {
    pub status: Duration,
    pub metrics: Duration,
    pub power: Duration,
    pub network_check: Duration,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            status: Duration::from_secs(60),
            metrics: Duration::from_secs(60),
            power: Duration::from_secs(60),
            network_check: Duration::from_secs(30),
        }
    }
}

/// Independent fixed-period tickers multiplexed into one stream. The first
/// tick of each fires one period after construction.
pub struct Scheduler {
    status: Interval,
    metrics: Interval,
    power: Interval,
    network_check: Interval,
}

impl Scheduler {
    pub fn new(settings: ScheduleSettings) -> Self {
        Self {
            status: ticker(settings.status),
            metrics: ticker(settings.metrics),
            power: ticker(settings.power),
            network_check: ticker(settings.network_check),
        }
    }

    pub async fn next(&mut self) -> Tick {
        tokio::select! {
            _ = self.status.tick() => Tick::Status,
            _ = self.metrics.tick() => Tick::Metrics,
            _ = self.power.tick() => Tick::Power,
            _ = self.network_check.tick() => Tick::NetworkCheck,
        }
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Logs a repeated condition at most once per `period`, counting what was
/// suppressed in between.
#[derive(Debug)]
pub struct RateLimitedNotice {
    period: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl RateLimitedNotice {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last: None,
            suppressed: 0,
        }
    }

    /// Returns the number of suppressed repeats when the notice should be
    /// emitted now, `None` while still inside the quiet period.
    pub fn check(&mut self) -> Option<u64> {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.period => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.suppressed = 0;
    }
}
