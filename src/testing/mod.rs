//! In-memory doubles for the broker link and the host collaborators.

use crate::connection::{MqttLink, PublishError};
use crate::lmstudio::{ModelServer, ModelServerError};
use crate::metrics::MetricsSource;
use crate::model::{
    CpuTimes, CpuUsage, DeviceIdentity, Display, DiskUsage, LmModel, MediaDevices,
    MediaSnapshot, MemoryUsage, SystemAction, Uptime,
};
use crate::platform::{CollaboratorError, HostPlatform};
use crate::state::StateStore;
use crate::status::StatusPublisher;
use crate::topics::Topics;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TEST_HOST: &str = "test-host";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

pub struct RecordingLink {
    connected: AtomicBool,
    published: Mutex<Vec<Published>>,
    subscriptions: Mutex<Vec<String>>,
}

impl RecordingLink {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    pub fn payloads(&self, topic: &str) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.topic == topic)
            .map(|p| p.payload.clone())
            .collect()
    }

    pub fn topics(&self) -> HashSet<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.topic.clone())
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.published.lock().unwrap().clear();
    }
}

impl MqttLink for RecordingLink {
    fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        self.published.lock().unwrap().push(Published {
            topic: topic.to_string(),
            payload,
            retain,
        });
        Ok(())
    }

    fn subscribe(&self, filter: &str) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        self.subscriptions.lock().unwrap().push(filter.to_string());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct HostState {
    volume: u8,
    muted: bool,
    keep_awake: bool,
    displays: Option<Vec<Display>>,
    brightness: HashMap<String, u8>,
    volume_delays: HashMap<u8, Duration>,
    idle_samples: VecDeque<u64>,
    now_playing: MediaSnapshot,
    fail_actions: bool,
    calls: Vec<String>,
}

/// Scriptable host. Every actuation is appended to the call log.
pub struct FakeHost {
    state: Mutex<HostState>,
    media_control: bool,
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostState {
                volume: 40,
                ..HostState::default()
            }),
            media_control: true,
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn set_displays(&self, displays: Vec<Display>) {
        self.state.lock().unwrap().displays = Some(displays);
    }

    /// Makes `set_volume(level)` take `delay` before it lands.
    pub fn delay_volume(&self, level: u8, delay: Duration) {
        self.state.lock().unwrap().volume_delays.insert(level, delay);
    }

    pub fn push_idle(&self, samples: &[u64]) {
        self.state.lock().unwrap().idle_samples.extend(samples);
    }

    pub fn set_now_playing(&self, snapshot: MediaSnapshot) {
        self.state.lock().unwrap().now_playing = snapshot;
    }

    pub fn fail_actions(&self) {
        self.state.lock().unwrap().fail_actions = true;
    }

    fn record(&self, call: String) -> Result<(), CollaboratorError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call.clone());
        if state.fail_actions {
            return Err(CollaboratorError::failed("fake host", call));
        }
        Ok(())
    }
}

#[async_trait]
impl HostPlatform for FakeHost {
    async fn volume(&self) -> Result<u8, CollaboratorError> {
        Ok(self.state.lock().unwrap().volume)
    }

    async fn set_volume(&self, level: u8) -> Result<(), CollaboratorError> {
        let delay = self.state.lock().unwrap().volume_delays.get(&level).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.record(format!("set_volume {level}"))?;
        self.state.lock().unwrap().volume = level;
        Ok(())
    }

    async fn muted(&self) -> Result<bool, CollaboratorError> {
        Ok(self.state.lock().unwrap().muted)
    }

    async fn set_muted(&self, muted: bool) -> Result<(), CollaboratorError> {
        self.record(format!("set_muted {muted}"))?;
        self.state.lock().unwrap().muted = muted;
        Ok(())
    }

    async fn system_action(&self, action: SystemAction) -> Result<(), CollaboratorError> {
        self.record(format!("system {action}"))
    }

    /// Without a scripted list the display tool counts as missing.
    async fn displays(&self) -> Result<Vec<Display>, CollaboratorError> {
        self.state
            .lock()
            .unwrap()
            .displays
            .clone()
            .ok_or_else(|| CollaboratorError::unavailable("betterdisplaycli"))
    }

    async fn display_brightness(&self, display_id: &str) -> Result<u8, CollaboratorError> {
        Ok(*self
            .state
            .lock()
            .unwrap()
            .brightness
            .get(display_id)
            .unwrap_or(&50))
    }

    async fn set_display_brightness(
        &self,
        display_id: &str,
        level: u8,
    ) -> Result<(), CollaboratorError> {
        self.record(format!("set_brightness {display_id} {level}"))?;
        self.state
            .lock()
            .unwrap()
            .brightness
            .insert(display_id.to_string(), level);
        Ok(())
    }

    async fn run_shortcut(&self, name: &str) -> Result<(), CollaboratorError> {
        self.record(format!("shortcut {name}"))
    }

    async fn keep_awake(&self) -> Result<bool, CollaboratorError> {
        Ok(self.state.lock().unwrap().keep_awake)
    }

    async fn set_keep_awake(&self, enabled: bool) -> Result<(), CollaboratorError> {
        self.record(format!("keep_awake {enabled}"))?;
        self.state.lock().unwrap().keep_awake = enabled;
        Ok(())
    }

    async fn toggle_play_pause(&self) -> Result<(), CollaboratorError> {
        self.record("playpause".to_string())
    }

    async fn now_playing(&self) -> Result<MediaSnapshot, CollaboratorError> {
        Ok(self.state.lock().unwrap().now_playing.clone())
    }

    /// Pops scripted samples; once exhausted the user stays at rest.
    async fn idle_seconds(&self) -> Result<u64, CollaboratorError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .idle_samples
            .pop_front()
            .unwrap_or(600))
    }

    async fn battery_percent(&self) -> Result<Option<u8>, CollaboratorError> {
        Ok(Some(87))
    }

    async fn media_devices(&self) -> Result<MediaDevices, CollaboratorError> {
        Ok(MediaDevices::default())
    }

    async fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            serial: "TESTSERIAL".into(),
            model: "Test Mac".into(),
        }
    }

    fn media_control_available(&self) -> bool {
        self.media_control
    }
}

pub struct FakeMetrics {
    fail_public_ip: AtomicBool,
    cpu_samples: Mutex<VecDeque<CpuTimes>>,
}

impl FakeMetrics {
    pub fn new() -> Self {
        Self {
            fail_public_ip: AtomicBool::new(false),
            cpu_samples: Mutex::new(VecDeque::new()),
        }
    }

    /// Scripts raw counter samples; once exhausted the counters count as
    /// unavailable.
    pub fn push_cpu_times(&self, samples: &[CpuTimes]) {
        self.cpu_samples.lock().unwrap().extend(samples);
    }

    pub fn fail_public_ip(&self) {
        self.fail_public_ip.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetricsSource for FakeMetrics {
    async fn disk_usage(&self) -> Result<DiskUsage, CollaboratorError> {
        Ok(DiskUsage {
            total: 1_000,
            used: 400,
            free: 600,
            used_percent: 40.0,
            free_percent: 60.0,
        })
    }

    async fn memory_usage(&self) -> Result<MemoryUsage, CollaboratorError> {
        Ok(MemoryUsage {
            total: 16,
            used: 4,
            free: 12,
            used_percent: 25.0,
            free_percent: 75.0,
        })
    }

    async fn uptime(&self) -> Result<Uptime, CollaboratorError> {
        Ok(Uptime::from_secs(3_700))
    }

    async fn cpu_times(&self) -> Result<CpuTimes, CollaboratorError> {
        self.cpu_samples
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| CollaboratorError::unavailable("cpu counters"))
    }

    async fn cpu_usage(&self) -> Result<CpuUsage, CollaboratorError> {
        Ok(CpuUsage {
            used_percent: 12.5,
            free_percent: 87.5,
        })
    }

    async fn public_ip(&self) -> Result<String, CollaboratorError> {
        if self.fail_public_ip.load(Ordering::SeqCst) {
            return Err(CollaboratorError::failed("public ip lookup", "offline"));
        }
        Ok("203.0.113.7".to_string())
    }
}

pub struct FakeModelServer {
    running: AtomicBool,
    models: Mutex<Vec<LmModel>>,
    fail_load: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl FakeModelServer {
    pub fn new(running: bool, models: Vec<LmModel>) -> Self {
        Self {
            running: AtomicBool::new(running),
            models: Mutex::new(models),
            fail_load: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_load(&self) {
        self.fail_load.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ModelServer for FakeModelServer {
    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn list_models(&self) -> Result<Vec<LmModel>, ModelServerError> {
        Ok(self.models.lock().unwrap().clone())
    }

    async fn start_server(&self) -> Result<(), ModelServerError> {
        self.record("start".into());
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_server(&self) -> Result<(), ModelServerError> {
        self.record("stop".into());
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn load_model(&self, model_id: &str) -> Result<(), ModelServerError> {
        self.record(format!("load {model_id}"));
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(ModelServerError::Cli {
                command: format!("lms load {model_id}"),
                detail: "model not found".into(),
            });
        }
        Ok(())
    }

    async fn unload_model(&self, model_id: Option<&str>) -> Result<(), ModelServerError> {
        self.record(format!("unload {}", model_id.unwrap_or("--all")));
        Ok(())
    }
}

pub struct Harness {
    pub topics: Topics,
    pub link: Arc<RecordingLink>,
    pub store: Arc<StateStore>,
    pub host: Arc<FakeHost>,
    pub metrics: Arc<FakeMetrics>,
    pub model_server: Option<Arc<FakeModelServer>>,
    pub status: Arc<StatusPublisher>,
}

fn build(model_server: Option<Arc<FakeModelServer>>) -> Harness {
    let topics = Topics::new(None, TEST_HOST, "homeassistant");
    let link = Arc::new(RecordingLink::new());
    let store = Arc::new(StateStore::new());
    let host = Arc::new(FakeHost::new());
    let metrics = Arc::new(FakeMetrics::new());
    let status = Arc::new(StatusPublisher::new(
        link.clone(),
        topics.clone(),
        store.clone(),
        host.clone(),
        metrics.clone(),
        model_server
            .clone()
            .map(|server| server as Arc<dyn ModelServer>),
    ));
    Harness {
        topics,
        link,
        store,
        host,
        metrics,
        model_server,
        status,
    }
}

pub fn harness() -> Harness {
    build(None)
}

pub fn harness_with_model_server(server: Arc<FakeModelServer>) -> Harness {
    build(Some(server))
}

pub fn test_status() -> (Arc<RecordingLink>, Arc<StateStore>, Arc<StatusPublisher>) {
    let h = harness();
    (h.link, h.store, h.status)
}
