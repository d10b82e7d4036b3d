use crate::lmstudio::ModelServer;
use crate::model::SystemAction;
use crate::platform::HostPlatform;
use crate::state::StateStore;
use crate::status::StatusPublisher;
use crate::topics::{display_id_from_command, Topics};
use std::sync::Arc;
use std::time::Duration;

const MIN_LEVEL: i64 = 0;
const MAX_LEVEL: i64 = 100;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} must be a number between 0 and 100, got {value:?}")]
    Percent { field: &'static str, value: String },
    #[error("{field} must be true or false, got {value:?}")]
    Boolean { field: &'static str, value: String },
    #[error("unknown system command {0:?}")]
    SystemAction(String),
    #[error("shortcut name cannot be empty")]
    EmptyShortcut,
    #[error("shortcut name contains invalid characters: {0:?}")]
    ShortcutName(String),
    #[error("unexpected play/pause payload {0:?}")]
    PlayPause(String),
    #[error("unknown LM Studio server command {0:?}")]
    ServerCommand(String),
    #[error("empty model ID provided for load command")]
    EmptyModelId,
    #[error("no display with id {0:?} is known")]
    UnknownDisplay(String),
}

pub fn parse_percent(field: &'static str, payload: &str) -> Result<u8, ValidationError> {
    let invalid = || ValidationError::Percent {
        field,
        value: payload.to_string(),
    };
    let value: i64 = payload.trim().parse().map_err(|_| invalid())?;
    if !(MIN_LEVEL..=MAX_LEVEL).contains(&value) {
        return Err(invalid());
    }
    u8::try_from(value).map_err(|_| invalid())
}

pub fn parse_bool(field: &'static str, payload: &str) -> Result<bool, ValidationError> {
    match payload {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
        _ => Err(ValidationError::Boolean {
            field,
            value: payload.to_string(),
        }),
    }
}

/// Shortcut names are limited to ASCII letters, digits, whitespace, `-` and `_`.
pub fn validate_shortcut(payload: &str) -> Result<&str, ValidationError> {
    if payload.is_empty() {
        return Err(ValidationError::EmptyShortcut);
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || c.is_ascii_whitespace() || c == '-' || c == '_';
    if !payload.chars().all(allowed) {
        return Err(ValidationError::ShortcutName(payload.to_string()));
    }
    Ok(payload)
}

pub fn parse_system_action(payload: &str) -> Result<SystemAction, ValidationError> {
    payload
        .parse()
        .map_err(|_| ValidationError::SystemAction(payload.to_string()))
}

/// How long to wait after an action before re-reading the state it changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleDelays {
    pub play_pause: Duration,
    pub server_start: Duration,
    pub server_stop: Duration,
    pub model_load: Duration,
    pub model_unload: Duration,
}

impl Default for SettleDelays {
    fn default() -> Self {
        Self {
            play_pause: Duration::from_millis(500),
            server_start: Duration::from_secs(3),
            server_stop: Duration::from_secs(2),
            model_load: Duration::from_secs(5),
            model_unload: Duration::from_secs(2),
        }
    }
}

impl SettleDelays {
    pub fn none() -> Self {
        Self {
            play_pause: Duration::ZERO,
            server_start: Duration::ZERO,
            server_stop: Duration::ZERO,
            model_load: Duration::ZERO,
            model_unload: Duration::ZERO,
        }
    }
}

/// Command handlers in precedence order. Matching is on the command name
/// alone; payloads never decide which handler owns a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Volume,
    Mute,
    System,
    DisplayBrightness,
    Shortcut,
    KeepAwake,
    PlayPause,
    ModelServer,
}

impl Route {
    pub const PRECEDENCE: [Route; 8] = [
        Route::Volume,
        Route::Mute,
        Route::System,
        Route::DisplayBrightness,
        Route::Shortcut,
        Route::KeepAwake,
        Route::PlayPause,
        Route::ModelServer,
    ];

    pub fn matches(self, command: &str) -> bool {
        match self {
            Route::Volume => command == "volume",
            Route::Mute => command == "mute",
            Route::System => command == "set",
            Route::DisplayBrightness => display_id_from_command(command).is_some(),
            Route::Shortcut => command == "runshortcut",
            Route::KeepAwake => command == "keepawake",
            Route::PlayPause => command == "playpause",
            Route::ModelServer => matches!(
                command,
                "lmstudio_server" | "lmstudio_load_model" | "lmstudio_unload_model"
            ),
        }
    }
}

pub struct CommandRouter {
    topics: Topics,
    host: Arc<dyn HostPlatform>,
    model_server: Option<Arc<dyn ModelServer>>,
    status: Arc<StatusPublisher>,
    store: Arc<StateStore>,
    delays: SettleDelays,
}

impl CommandRouter {
    pub fn new(
        topics: Topics,
        host: Arc<dyn HostPlatform>,
        model_server: Option<Arc<dyn ModelServer>>,
        status: Arc<StatusPublisher>,
        store: Arc<StateStore>,
    ) -> Self {
        Self {
            topics,
            host,
            model_server,
            status,
            store,
            delays: SettleDelays::default(),
        }
    }

    pub fn with_delays(mut self, delays: SettleDelays) -> Self {
        self.delays = delays;
        self
    }

    /// First route whose pattern matches the command name, if any.
    pub fn resolve(&self, command: &str) -> Option<Route> {
        Route::PRECEDENCE
            .into_iter()
            .filter(|route| *route != Route::ModelServer || self.model_server.is_some())
            .find(|route| route.matches(command))
    }

    /// Dispatches one inbound message. Returns `false` only when no handler
    /// owns the topic; invalid payloads are logged and still count as handled.
    pub async fn route(&self, topic: &str, payload: &str) -> bool {
        let Some(command) = self.topics.command_name(topic) else {
            tracing::debug!("Ignoring message on {}", topic);
            return false;
        };
        let Some(route) = self.resolve(command) else {
            tracing::debug!("No handler for command {}", command);
            return false;
        };

        tracing::debug!("Routing {} to {:?}", command, route);
        if let Err(err) = self.dispatch(route, command, payload).await {
            tracing::warn!("Rejected {} command: {}", command, err);
        }
        true
    }

    async fn dispatch(
        &self,
        route: Route,
        command: &str,
        payload: &str,
    ) -> Result<(), ValidationError> {
        match route {
            Route::Volume => {
                let level = parse_percent("volume", payload)?;
                if let Err(err) = self.host.set_volume(level).await {
                    tracing::warn!("Failed to set volume: {}", err);
                }
                self.status.publish_volume().await;
                self.status.publish_mute().await;
            }
            Route::Mute => {
                let muted = parse_bool("mute", payload)?;
                if let Err(err) = self.host.set_muted(muted).await {
                    tracing::warn!("Failed to set mute: {}", err);
                }
                self.status.publish_volume().await;
                self.status.publish_mute().await;
            }
            Route::System => {
                let action = parse_system_action(payload)?;
                tracing::info!("Running system command {}", action);
                if let Err(err) = self.host.system_action(action).await {
                    tracing::warn!("System command {} failed: {}", action, err);
                }
            }
            Route::DisplayBrightness => {
                let display_id = display_id_from_command(command).unwrap_or_default();
                self.set_brightness(display_id, payload).await?;
            }
            Route::Shortcut => {
                let name = validate_shortcut(payload)?;
                tracing::info!("Running shortcut {}", name);
                if let Err(err) = self.host.run_shortcut(name).await {
                    tracing::warn!("Shortcut {} failed: {}", name, err);
                }
            }
            Route::KeepAwake => {
                let enabled = parse_bool("keep awake", payload)?;
                if let Err(err) = self.host.set_keep_awake(enabled).await {
                    tracing::warn!("Failed to change keep-awake: {}", err);
                }
                self.status.publish_caffeinate().await;
            }
            Route::PlayPause => {
                if payload != "playpause" {
                    return Err(ValidationError::PlayPause(payload.to_string()));
                }
                if let Err(err) = self.host.toggle_play_pause().await {
                    tracing::warn!("Play/pause failed: {}", err);
                    return Ok(());
                }
                tokio::time::sleep(self.delays.play_pause).await;
                self.status.refresh_now_playing().await;
            }
            Route::ModelServer => self.model_server_command(command, payload).await?,
        }
        Ok(())
    }

    async fn set_brightness(&self, display_id: &str, payload: &str) -> Result<(), ValidationError> {
        if !self.store.has_display(display_id) {
            if self.store.displays().is_empty() {
                tracing::warn!(
                    "Received brightness command but no displays are available; is betterdisplaycli installed?"
                );
            }
            return Err(ValidationError::UnknownDisplay(display_id.to_string()));
        }
        let level = parse_percent("brightness", payload)?;
        match self.host.set_display_brightness(display_id, level).await {
            Ok(()) => self.status.publish_brightness(display_id, level),
            Err(err) => tracing::warn!("Failed to set brightness for display {}: {}", display_id, err),
        }
        Ok(())
    }

    async fn model_server_command(&self, command: &str, payload: &str) -> Result<(), ValidationError> {
        let Some(server) = &self.model_server else {
            return Ok(());
        };
        let delay = match command {
            "lmstudio_server" => match payload {
                "start" => match server.start_server().await {
                    Ok(()) => {
                        tracing::info!("LM Studio server start command sent");
                        self.delays.server_start
                    }
                    Err(err) => {
                        tracing::warn!("Failed to start LM Studio server: {}", err);
                        return Ok(());
                    }
                },
                "stop" => match server.stop_server().await {
                    Ok(()) => {
                        tracing::info!("LM Studio server stop command sent");
                        self.delays.server_stop
                    }
                    Err(err) => {
                        tracing::warn!("Failed to stop LM Studio server: {}", err);
                        return Ok(());
                    }
                },
                other => return Err(ValidationError::ServerCommand(other.to_string())),
            },
            "lmstudio_load_model" => {
                let model_id = payload.trim();
                if model_id.is_empty() {
                    return Err(ValidationError::EmptyModelId);
                }
                match server.load_model(model_id).await {
                    Ok(()) => {
                        tracing::info!("Model {} load command sent", model_id);
                        self.delays.model_load
                    }
                    Err(err) => {
                        tracing::warn!("Failed to load model {}: {}", model_id, err);
                        self.status
                            .publish_model_server_error(&format!("Failed to load model: {err}"));
                        return Ok(());
                    }
                }
            }
            _ => {
                let target = match payload.trim() {
                    "" | "all" => None,
                    id => Some(id),
                };
                match server.unload_model(target).await {
                    Ok(()) => {
                        tracing::info!("Model {} unload command sent", target.unwrap_or("all"));
                        self.delays.model_unload
                    }
                    Err(err) => {
                        tracing::warn!("Failed to unload {}: {}", target.unwrap_or("all models"), err);
                        return Ok(());
                    }
                }
            }
        };
        tokio::time::sleep(delay).await;
        self.status.refresh_model_server().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Display, MediaSnapshot, PlaybackState};
    use crate::testing::{harness, harness_with_model_server, FakeModelServer, Harness};

    const PREFIX: &str = "mac2mqtt/test-host";

    fn router(h: &Harness) -> CommandRouter {
        let model_server = h
            .model_server
            .clone()
            .map(|server| server as Arc<dyn ModelServer>);
        CommandRouter::new(
            h.topics.clone(),
            h.host.clone(),
            model_server,
            h.status.clone(),
            h.store.clone(),
        )
        .with_delays(SettleDelays::none())
    }

    fn command(name: &str) -> String {
        format!("{PREFIX}/command/{name}")
    }

    #[test]
    fn percent_payloads_are_bounded() {
        assert_eq!(parse_percent("volume", "0"), Ok(0));
        assert_eq!(parse_percent("volume", " 100 "), Ok(100));
        for bad in ["-1", "101", "abc", "", "50.5"] {
            assert!(parse_percent("volume", bad).is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn boolean_vocabulary() {
        for yes in ["1", "t", "T", "TRUE", "true", "True"] {
            assert_eq!(parse_bool("mute", yes), Ok(true));
        }
        for no in ["0", "f", "F", "FALSE", "false", "False"] {
            assert_eq!(parse_bool("mute", no), Ok(false));
        }
        assert!(parse_bool("mute", "yes").is_err());
        assert!(parse_bool("mute", "tRuE").is_err());
    }

    #[test]
    fn shortcut_names_are_restricted() {
        assert_eq!(validate_shortcut("Morning Routine_2-b"), Ok("Morning Routine_2-b"));
        assert_eq!(validate_shortcut(""), Err(ValidationError::EmptyShortcut));
        assert!(validate_shortcut("rm -rf /; echo").is_err());
        assert!(validate_shortcut("$(whoami)").is_err());
        assert!(validate_shortcut("Morning\u{00A0}Routine").is_err());
        assert!(validate_shortcut("Night\u{2003}Mode").is_err());
    }

    #[test]
    fn precedence_follows_command_name() {
        let h = harness();
        let router = router(&h);
        assert_eq!(router.resolve("mute"), Some(Route::Mute));
        assert_eq!(router.resolve("keepawake"), Some(Route::KeepAwake));
        assert_eq!(router.resolve("display_7_brightness"), Some(Route::DisplayBrightness));
        assert_eq!(router.resolve("lmstudio_server"), None);
        assert_eq!(router.resolve("unknown"), None);
    }

    #[tokio::test]
    async fn out_of_range_volume_is_dropped() {
        let h = harness();
        let router = router(&h);

        for bad in ["-1", "101", "abc"] {
            assert!(router.route(&command("volume"), bad).await);
        }

        assert!(h.host.calls().is_empty());
        assert!(h.link.published().is_empty());
    }

    #[tokio::test]
    async fn volume_republishes_volume_and_mute() {
        let h = harness();
        let router = router(&h);

        assert!(router.route(&command("volume"), "65").await);

        assert_eq!(h.host.calls(), vec!["set_volume 65"]);
        assert_eq!(h.link.payloads(&format!("{PREFIX}/status/volume")), vec!["65"]);
        assert_eq!(h.link.payloads(&format!("{PREFIX}/status/mute")), vec!["false"]);
    }

    #[tokio::test]
    async fn mute_maps_payload_and_republishes_both() {
        let h = harness();
        let router = router(&h);

        router.route(&command("mute"), "true").await;
        router.route(&command("mute"), "false").await;

        assert_eq!(h.host.calls(), vec!["set_muted true", "set_muted false"]);
        assert_eq!(
            h.link.payloads(&format!("{PREFIX}/status/mute")),
            vec!["true", "false"]
        );
        assert_eq!(h.link.payloads(&format!("{PREFIX}/status/volume")).len(), 2);
    }

    #[tokio::test]
    async fn mute_and_keepawake_never_cross() {
        let h = harness();
        let router = router(&h);

        router.route(&command("mute"), "true").await;
        assert_eq!(h.host.calls(), vec!["set_muted true"]);
        assert!(h.link.payloads(&format!("{PREFIX}/status/caffeinate")).is_empty());

        router.route(&command("keepawake"), "true").await;
        assert_eq!(h.host.calls(), vec!["set_muted true", "keep_awake true"]);
        assert_eq!(
            h.link.payloads(&format!("{PREFIX}/status/caffeinate")),
            vec!["true"]
        );
        assert_eq!(h.link.payloads(&format!("{PREFIX}/status/mute")), vec!["true"]);
    }

    #[tokio::test]
    async fn invalid_payload_is_consumed_not_forwarded() {
        let h = harness();
        let router = router(&h);

        assert!(router.route(&command("keepawake"), "maybe").await);
        assert!(router.route(&command("set"), "reboot").await);

        assert!(h.host.calls().is_empty());
        assert!(h.link.published().is_empty());
    }

    #[tokio::test]
    async fn unrelated_topics_are_not_handled() {
        let h = harness();
        let router = router(&h);

        assert!(!router.route(&format!("{PREFIX}/status/volume"), "10").await);
        assert!(!router.route(&command("lmstudio_server"), "start").await);
        assert!(!router.route("other/host/command/volume", "10").await);
    }

    #[tokio::test]
    async fn system_action_and_shortcut_reach_host() {
        let h = harness();
        let router = router(&h);

        router.route(&command("set"), "displaysleep").await;
        router.route(&command("runshortcut"), "Good Night").await;
        router.route(&command("runshortcut"), "bad;name").await;

        assert_eq!(
            h.host.calls(),
            vec!["system displaysleep", "shortcut Good Night"]
        );
    }

    #[tokio::test]
    async fn brightness_requires_known_display() {
        let h = harness();
        h.store.set_displays(vec![Display {
            display_id: "3".into(),
            name: "Studio Display".into(),
        }]);
        let router = router(&h);

        router.route(&command("display_9_brightness"), "40").await;
        router.route(&command("display_3_brightness"), "140").await;
        router.route(&command("display_3_brightness"), "40").await;

        assert_eq!(h.host.calls(), vec!["set_brightness 3 40"]);
        let published = h.link.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, format!("{PREFIX}/status/display_3_brightness"));
        assert_eq!(published[0].payload, "40");
        assert!(published[0].retain);
    }

    #[tokio::test]
    async fn host_failure_still_republishes() {
        let h = harness();
        h.host.fail_actions();
        let router = router(&h);

        router.route(&command("keepawake"), "true").await;

        assert_eq!(
            h.link.payloads(&format!("{PREFIX}/status/caffeinate")),
            vec!["false"]
        );
    }

    #[tokio::test]
    async fn play_pause_refreshes_now_playing() {
        let h = harness();
        h.host.set_now_playing(MediaSnapshot {
            title: "Track".into(),
            state: PlaybackState::Paused,
            ..MediaSnapshot::default()
        });
        let router = router(&h);

        router.route(&command("playpause"), "toggle").await;
        assert!(h.host.calls().is_empty());

        router.route(&command("playpause"), "playpause").await;
        assert_eq!(h.host.calls(), vec!["playpause"]);
        assert_eq!(h.store.media().title, "Track");
        assert_eq!(
            h.link.payloads(&format!("{PREFIX}/status/now_playing")),
            vec!["paused"]
        );
    }

    #[tokio::test]
    async fn model_server_commands_when_enabled() {
        let server = Arc::new(FakeModelServer::new(false, Vec::new()));
        let h = harness_with_model_server(server.clone());
        let router = router(&h);

        assert!(router.route(&command("lmstudio_server"), "start").await);
        assert!(router.route(&command("lmstudio_server"), "restart").await);
        assert!(router.route(&command("lmstudio_load_model"), "").await);
        assert!(router.route(&command("lmstudio_unload_model"), "all").await);
        assert!(router.route(&command("lmstudio_unload_model"), "qwen").await);

        assert_eq!(server.calls(), vec!["start", "unload --all", "unload qwen"]);
        assert_eq!(
            h.link.payloads(&format!("{PREFIX}/status/lmstudio_server")),
            vec!["online", "online", "online"]
        );
    }

    #[tokio::test]
    async fn failed_load_publishes_last_error() {
        let server = Arc::new(FakeModelServer::new(true, Vec::new()));
        server.fail_load();
        let h = harness_with_model_server(server.clone());
        let router = router(&h);

        router.route(&command("lmstudio_load_model"), "missing-model").await;

        let errors = h.link.payloads(&format!("{PREFIX}/status/lmstudio_last_error"));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Failed to load model: "));
        assert!(h.link.payloads(&format!("{PREFIX}/status/lmstudio_server")).is_empty());
    }
}
