use crate::connection::{MqttLink, PublishError};
use crate::discovery::{self, DiscoveryContext};
use crate::lmstudio::{format_model_list, ModelServer};
use crate::metrics::MetricsSource;
use crate::model::{ActivityFlag, MediaSnapshot, ModelServerSnapshot};
use crate::platform::HostPlatform;
use crate::state::StateStore;
use crate::topics::Topics;
use serde_json::json;
use std::sync::Arc;

/// Publishes every status quantity. Values are always read fresh from the
/// collaborators or copied out of the state store before publishing, so no
/// lock is held while the link is busy.
pub struct StatusPublisher {
    link: Arc<dyn MqttLink>,
    topics: Topics,
    store: Arc<StateStore>,
    host: Arc<dyn HostPlatform>,
    metrics: Arc<dyn MetricsSource>,
    model_server: Option<Arc<dyn ModelServer>>,
}

impl StatusPublisher {
    pub fn new(
        link: Arc<dyn MqttLink>,
        topics: Topics,
        store: Arc<StateStore>,
        host: Arc<dyn HostPlatform>,
        metrics: Arc<dyn MetricsSource>,
        model_server: Option<Arc<dyn ModelServer>>,
    ) -> Self {
        Self {
            link,
            topics,
            store,
            host,
            metrics,
            model_server,
        }
    }

    fn send(&self, topic: &str, payload: impl Into<String>, retain: bool) {
        match self.link.publish(topic, payload.into(), retain) {
            Ok(()) => {}
            Err(PublishError::NotConnected) => {
                tracing::debug!("Skipping publish to {} while disconnected", topic);
            }
            Err(err) => tracing::warn!("Failed to publish {}: {}", topic, err),
        }
    }

    fn status(&self, name: &str, payload: impl Into<String>) {
        self.send(&self.topics.status(name), payload, false);
    }

    pub fn publish_alive(&self, online: bool) {
        let payload = if online { "online" } else { "offline" };
        self.send(&self.topics.alive(), payload, true);
    }

    pub async fn publish_discovery(&self) {
        let identity = self.host.identity().await;
        let ctx = DiscoveryContext {
            topics: &self.topics,
            identity: &identity,
            displays: &self.store.displays(),
            media_control: self.host.media_control_available(),
            model_server: self.model_server.is_some(),
        };
        let document = discovery::build_document(&ctx);
        self.send(&self.topics.discovery(), document.to_string(), true);
    }

    pub async fn publish_volume(&self) {
        match self.host.volume().await {
            Ok(level) => self.status("volume", level.to_string()),
            Err(err) => tracing::warn!("Failed to read volume: {}", err),
        }
    }

    pub async fn publish_mute(&self) {
        match self.host.muted().await {
            Ok(muted) => self.status("mute", muted.to_string()),
            Err(err) => tracing::warn!("Failed to read mute status: {}", err),
        }
    }

    pub async fn publish_caffeinate(&self) {
        match self.host.keep_awake().await {
            Ok(active) => self.status("caffeinate", active.to_string()),
            Err(err) => tracing::warn!("Failed to read keep-awake status: {}", err),
        }
    }

    pub async fn publish_battery(&self) {
        match self.host.battery_percent().await {
            Ok(Some(percent)) => self.status("battery", percent.to_string()),
            Ok(None) => self.status("battery", ""),
            Err(err) => tracing::debug!("Failed to read battery: {}", err),
        }
    }

    pub fn publish_brightness(&self, display_id: &str, level: u8) {
        self.send(
            &self.topics.display_brightness_status(display_id),
            level.to_string(),
            true,
        );
    }

    /// Re-reads the display list so hot-plugged or closed displays are
    /// tracked, then publishes each display's brightness.
    pub async fn publish_display_brightness(&self) {
        match self.host.displays().await {
            Ok(displays) => self.store.set_displays(displays),
            Err(err) => tracing::debug!("Keeping previous display list: {}", err),
        }
        for screen in self.store.displays() {
            match self.host.display_brightness(&screen.display_id).await {
                Ok(level) => self.publish_brightness(&screen.display_id, level),
                // a closed lid makes the built-in panel unreadable
                Err(_) if screen.is_builtin() => continue,
                Err(err) => {
                    tracing::warn!("Failed to read brightness for {}: {}", screen.name, err)
                }
            }
        }
    }

    pub fn publish_media(&self, media: &MediaSnapshot) {
        let state = media.state.as_str();
        self.status("now_playing", state);
        let attributes = json!({
            "state": state,
            "title": media.title,
            "artist": media.artist,
            "album": media.album,
            "app_name": media.app_name,
            "duration": media.duration_secs,
            "position": media.position_secs,
        });
        self.status("now_playing_attr", attributes.to_string());

        self.status("media_state", state);
        self.status("media_title", media.title.as_str());
        self.status("media_artist", media.artist.as_str());
        self.status("media_album", media.album.as_str());
        self.status("media_app", media.app_name.as_str());
        self.status("media_duration", media.duration_secs.to_string());
        self.status("media_position", media.position_secs.to_string());

        let player = json!({
            "state": state,
            "title": media.title,
            "artist": media.artist,
            "album": media.album,
            "app_name": media.app_name,
            "duration": media.duration_secs,
            "position": media.position_secs,
            "media_title": media.title,
            "media_artist": media.artist,
            "media_album": media.album,
        });
        self.status("media_player", player.to_string());
    }

    /// Replaces the media snapshot with a one-shot query and publishes it.
    pub async fn refresh_now_playing(&self) {
        match self.host.now_playing().await {
            Ok(snapshot) => {
                self.store.replace_media(snapshot.clone());
                tracing::info!(
                    "Updated now playing: {} - {} ({})",
                    snapshot.artist,
                    snapshot.title,
                    snapshot.state.as_str()
                );
                self.publish_media(&snapshot);
            }
            Err(err) if err.is_unavailable() => {
                tracing::debug!("Now playing unavailable: {}", err)
            }
            Err(err) => tracing::warn!("Failed to read now playing: {}", err),
        }
    }

    pub fn publish_activity(&self, flag: ActivityFlag) {
        self.status("user_activity", flag.as_str());
    }

    pub fn publish_idle_time(&self, idle_secs: u64) {
        self.status("idle_time_seconds", idle_secs.to_string());
    }

    pub async fn publish_disk(&self) {
        match self.metrics.disk_usage().await {
            Ok(disk) => {
                self.status("disk/total", disk.total.to_string());
                self.status("disk/used", disk.used.to_string());
                self.status("disk/free", disk.free.to_string());
                self.status("disk/used_percent", format!("{:.2}", disk.used_percent));
                self.status("disk/free_percent", format!("{:.2}", disk.free_percent));
            }
            Err(err) => tracing::warn!("Failed to get disk usage: {}", err),
        }
    }

    pub async fn publish_cpu(&self) {
        let usage = match self.metrics.cpu_times().await {
            Ok(times) => self.store.record_cpu_sample(times),
            Err(err) if err.is_unavailable() => match self.metrics.cpu_usage().await {
                Ok(usage) => usage,
                Err(err) => {
                    tracing::warn!("Failed to get CPU usage: {}", err);
                    return;
                }
            },
            Err(err) => {
                tracing::warn!("Failed to get CPU counters: {}", err);
                return;
            }
        };
        self.status("cpu/used_percent", format!("{:.2}", usage.used_percent));
        self.status("cpu/free_percent", format!("{:.2}", usage.free_percent));
    }

    pub async fn publish_memory(&self) {
        match self.metrics.memory_usage().await {
            Ok(mem) => {
                self.status("memory/total", mem.total.to_string());
                self.status("memory/used", mem.used.to_string());
                self.status("memory/free", mem.free.to_string());
                self.status("memory/used_percent", format!("{:.2}", mem.used_percent));
                self.status("memory/free_percent", format!("{:.2}", mem.free_percent));
            }
            Err(err) => tracing::warn!("Failed to get memory usage: {}", err),
        }
    }

    pub async fn publish_uptime(&self) {
        match self.metrics.uptime().await {
            Ok(uptime) => {
                self.status("uptime/seconds", uptime.seconds.to_string());
                self.status("uptime/human", uptime.human);
            }
            Err(err) => tracing::warn!("Failed to get uptime: {}", err),
        }
    }

    pub async fn publish_public_ip(&self) {
        match self.metrics.public_ip().await {
            Ok(ip) => self.status("public_ip", ip),
            Err(err) => {
                tracing::warn!("Failed to get public IP: {}", err);
                self.status("public_ip", "unavailable");
            }
        }
    }

    pub async fn publish_media_devices(&self) {
        let devices = match self.host.media_devices().await {
            Ok(devices) => devices,
            Err(err) => {
                tracing::debug!("Failed to get media device state: {}", err);
                Default::default()
            }
        };
        self.status("microphone", on_off(devices.microphone_on));
        self.status("camera", on_off(devices.camera_on));
    }

    /// Queries the model server and publishes its status. Nothing is
    /// published when the integration is disabled.
    pub async fn refresh_model_server(&self) {
        let Some(server) = &self.model_server else {
            return;
        };
        let running = server.is_running().await;
        let snapshot = if running {
            match server.list_models().await {
                Ok(models) => {
                    let (loaded, available): (Vec<_>, Vec<_>) =
                        models.into_iter().partition(|m| m.is_loaded());
                    ModelServerSnapshot {
                        running,
                        loaded,
                        available,
                    }
                }
                Err(err) => {
                    tracing::warn!("Failed to list LM Studio models: {}", err);
                    self.status("lmstudio_server", "online");
                    return;
                }
            }
        } else {
            ModelServerSnapshot::default()
        };
        self.store.set_model_server(snapshot.clone());
        self.publish_model_server(&snapshot);
    }

    fn publish_model_server(&self, snapshot: &ModelServerSnapshot) {
        if !snapshot.running {
            self.status("lmstudio_server", "offline");
            self.status("lmstudio_loaded_models", "[]");
            self.status("lmstudio_available_models", "[]");
            return;
        }
        self.status("lmstudio_server", "online");
        self.status("lmstudio_loaded_models", to_json(&snapshot.loaded));
        self.status("lmstudio_available_models", to_json(&snapshot.available));
        self.status(
            "lmstudio_loaded_models_count",
            snapshot.loaded.len().to_string(),
        );
        self.status(
            "lmstudio_available_models_count",
            snapshot.available.len().to_string(),
        );
        self.status(
            "lmstudio_loaded_models_list",
            format_model_list(&snapshot.loaded),
        );
        self.status(
            "lmstudio_available_models_list",
            format_model_list(&snapshot.available),
        );
        tracing::info!(
            "LM Studio status updated: loaded={}, available={}",
            snapshot.loaded.len(),
            snapshot.available.len()
        );
    }

    pub fn publish_model_server_error(&self, message: &str) {
        self.status("lmstudio_last_error", message);
    }

    pub async fn publish_status_tick(&self) {
        self.publish_volume().await;
        self.publish_mute().await;
        self.publish_media_devices().await;
        self.publish_alive(true);
    }

    pub async fn publish_metrics_tick(&self) {
        self.publish_battery().await;
        self.publish_disk().await;
        self.publish_cpu().await;
        self.publish_memory().await;
        self.publish_uptime().await;
        self.publish_public_ip().await;
    }

    pub async fn publish_power_tick(&self) {
        self.publish_caffeinate().await;
        self.publish_display_brightness().await;
        self.refresh_model_server().await;
    }

    /// Republishes every quantity. Media and activity come from the
    /// in-memory snapshot; everything else is read fresh.
    pub async fn resync(&self) {
        self.publish_status_tick().await;
        self.publish_caffeinate().await;
        self.publish_display_brightness().await;
        self.publish_media(&self.store.media());
        self.publish_activity(self.store.activity().flag);
        if let Some(idle) = self.store.activity().last_idle_secs {
            self.publish_idle_time(idle);
        }
        self.publish_metrics_tick().await;
        self.refresh_model_server().await;
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CpuTimes, Display, LmModel};
    use crate::testing::{harness, harness_with_model_server, test_status, FakeModelServer};

    const PREFIX: &str = "mac2mqtt/test-host/status";

    #[tokio::test]
    async fn resync_covers_every_quantity() {
        let (link, store, status) = test_status();
        store.set_displays(vec![Display {
            display_id: "2".into(),
            name: "LG".into(),
        }]);

        status.resync().await;

        let topics = link.topics();
        for name in [
            "volume",
            "mute",
            "alive",
            "microphone",
            "camera",
            "caffeinate",
            "display_2_brightness",
            "now_playing",
            "now_playing_attr",
            "media_player",
            "user_activity",
            "battery",
            "disk/total",
            "cpu/used_percent",
            "memory/free_percent",
            "uptime/human",
            "public_ip",
        ] {
            assert!(
                topics.contains(&format!("{PREFIX}/{name}")),
                "missing {name}"
            );
        }
        assert_eq!(link.payloads(&format!("{PREFIX}/user_activity")), vec!["inactive"]);
        let retained = link
            .published()
            .into_iter()
            .find(|p| p.topic == format!("{PREFIX}/display_2_brightness"))
            .unwrap();
        assert!(retained.retain);
    }

    #[tokio::test]
    async fn displays_attached_later_are_picked_up() {
        let h = harness();
        h.host.set_displays(Vec::new());
        h.status.publish_display_brightness().await;
        assert!(h.store.displays().is_empty());

        h.host.set_displays(vec![Display {
            display_id: "3".into(),
            name: "Studio Display".into(),
        }]);
        h.status.publish_display_brightness().await;

        assert!(h.store.has_display("3"));
        assert_eq!(
            h.link.payloads(&format!("{PREFIX}/display_3_brightness")),
            vec!["50"]
        );
    }

    #[tokio::test]
    async fn cpu_percent_comes_from_counter_deltas() {
        let h = harness();
        h.metrics.push_cpu_times(&[
            CpuTimes {
                user: 100,
                idle: 900,
                ..CpuTimes::default()
            },
            CpuTimes {
                user: 400,
                idle: 1_600,
                ..CpuTimes::default()
            },
        ]);

        h.status.publish_cpu().await;
        h.status.publish_cpu().await;
        h.status.publish_cpu().await;

        assert_eq!(
            h.link.payloads(&format!("{PREFIX}/cpu/used_percent")),
            vec!["0.00", "30.00", "12.50"]
        );
    }

    #[tokio::test]
    async fn public_ip_failure_publishes_unavailable() {
        let h = harness();
        h.metrics.fail_public_ip();

        h.status.publish_public_ip().await;

        assert_eq!(h.link.payloads(&format!("{PREFIX}/public_ip")), vec!["unavailable"]);
    }

    #[tokio::test]
    async fn model_server_offline_clears_lists() {
        let server = Arc::new(FakeModelServer::new(false, Vec::new()));
        let h = harness_with_model_server(server);
        let link = h.link.clone();

        h.status.refresh_model_server().await;

        assert_eq!(link.payloads(&format!("{PREFIX}/lmstudio_server")), vec!["offline"]);
        assert_eq!(
            link.payloads(&format!("{PREFIX}/lmstudio_loaded_models")),
            vec!["[]"]
        );
        assert!(link
            .payloads(&format!("{PREFIX}/lmstudio_loaded_models_count"))
            .is_empty());
    }

    #[tokio::test]
    async fn model_server_online_splits_loaded_models() {
        let models = vec![
            LmModel {
                id: "qwen".into(),
                model_type: "llm".into(),
                state: "loaded".into(),
                ..LmModel::default()
            },
            LmModel {
                id: "nomic".into(),
                model_type: "embeddings".into(),
                state: "not-loaded".into(),
                ..LmModel::default()
            },
        ];
        let server = Arc::new(FakeModelServer::new(true, models));
        let h = harness_with_model_server(server);
        let (link, store) = (h.link.clone(), h.store.clone());

        h.status.refresh_model_server().await;

        assert_eq!(
            link.payloads(&format!("{PREFIX}/lmstudio_loaded_models_list")),
            vec!["qwen (llm, loaded)"]
        );
        assert_eq!(
            link.payloads(&format!("{PREFIX}/lmstudio_available_models_count")),
            vec!["1"]
        );
        assert_eq!(store.model_server().loaded.len(), 1);
    }

    #[tokio::test]
    async fn publishing_while_disconnected_is_silent() {
        let (link, _store, status) = test_status();
        link.set_connected(false);

        status.publish_status_tick().await;

        assert!(link.published().is_empty());
    }
}
