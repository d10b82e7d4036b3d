use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Playing,
    Paused,
    #[default]
    Idle,
}

impl PlaybackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Idle => "idle",
        }
    }
}

/// Last known now-playing state. Never absent: an idle snapshot with empty
/// strings stands in when nothing is playing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MediaSnapshot {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub app_name: String,
    pub state: PlaybackState,
    pub duration_secs: u64,
    pub position_secs: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityFlag {
    Active,
    #[default]
    Inactive,
}

impl ActivityFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemAction {
    Sleep,
    DisplaySleep,
    DisplayWake,
    Shutdown,
    Screensaver,
}

impl FromStr for SystemAction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sleep" => Ok(Self::Sleep),
            "displaysleep" => Ok(Self::DisplaySleep),
            "displaywake" => Ok(Self::DisplayWake),
            "shutdown" => Ok(Self::Shutdown),
            "screensaver" => Ok(Self::Screensaver),
            _ => Err(()),
        }
    }
}

impl fmt::Display for SystemAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sleep => "sleep",
            Self::DisplaySleep => "displaysleep",
            Self::DisplayWake => "displaywake",
            Self::Shutdown => "shutdown",
            Self::Screensaver => "screensaver",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Display {
    #[serde(rename = "displayID")]
    pub display_id: String,
    #[serde(default)]
    pub name: String,
}

impl Display {
    pub fn is_builtin(&self) -> bool {
        self.name.contains("Built-in")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub serial: String,
    pub model: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaDevices {
    pub microphone_on: bool,
    pub camera_on: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub used_percent: f64,
    pub free_percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub used_percent: f64,
    pub free_percent: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CpuUsage {
    pub used_percent: f64,
    pub free_percent: f64,
}

impl CpuUsage {
    pub fn idle() -> Self {
        Self {
            used_percent: 0.0,
            free_percent: 100.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Uptime {
    pub seconds: u64,
    pub human: String,
}

impl Uptime {
    pub fn from_secs(seconds: u64) -> Self {
        let days = seconds / 86_400;
        let hours = (seconds % 86_400) / 3_600;
        let minutes = (seconds % 3_600) / 60;
        let human = if days > 0 {
            format!("{days} days, {hours}:{minutes:02}")
        } else {
            format!("{hours}:{minutes:02}")
        };
        Self { seconds, human }
    }
}

/// Cumulative CPU time counters as reported by the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub sys: u64,
    pub idle: u64,
    pub wait: u64,
    pub nice: u64,
    pub irq: u64,
    pub soft_irq: u64,
    pub stolen: u64,
}

impl CpuTimes {
    pub fn total(&self) -> u64 {
        self.user
            .saturating_add(self.sys)
            .saturating_add(self.idle)
            .saturating_add(self.wait)
            .saturating_add(self.nice)
            .saturating_add(self.irq)
            .saturating_add(self.soft_irq)
            .saturating_add(self.stolen)
    }

    pub fn usage_since(&self, previous: &CpuTimes) -> CpuUsage {
        let total = self.total().saturating_sub(previous.total());
        if total == 0 {
            return CpuUsage::idle();
        }
        let idle = self.idle.saturating_sub(previous.idle);
        let free_percent = idle as f64 / total as f64 * 100.0;
        CpuUsage {
            used_percent: 100.0 - free_percent,
            free_percent,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LmModel {
    pub id: String,
    pub object: String,
    #[serde(rename = "type")]
    pub model_type: String,
    pub publisher: String,
    pub arch: String,
    pub compatibility_type: String,
    pub quantization: String,
    pub state: String,
    pub max_context_length: u64,
}

impl LmModel {
    pub fn is_loaded(&self) -> bool {
        self.state == "loaded"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelServerSnapshot {
    pub running: bool,
    pub loaded: Vec<LmModel>,
    pub available: Vec<LmModel>,
}
