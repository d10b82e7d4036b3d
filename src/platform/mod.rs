use crate::media::merge_payload;
use crate::model::{
    DeviceIdentity, Display, MediaDevices, MediaSnapshot, PlaybackState, SystemAction,
};
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
const AUDIO_HELPER_URL: &str = "http://localhost:55777";

#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("{tool} is not available on this host")]
    Unavailable { tool: String },
    #[error("{tool} failed: {detail}")]
    Failed { tool: String, detail: String },
    #[error("{tool} timed out")]
    Timeout { tool: String },
    #[error("could not parse {tool} output: {detail}")]
    Parse { tool: String, detail: String },
}

impl CollaboratorError {
    pub fn unavailable(tool: impl Into<String>) -> Self {
        Self::Unavailable { tool: tool.into() }
    }

    pub fn failed(tool: impl Into<String>, detail: impl ToString) -> Self {
        Self::Failed {
            tool: tool.into(),
            detail: detail.to_string(),
        }
    }

    pub fn parse(tool: impl Into<String>, detail: impl ToString) -> Self {
        Self::Parse {
            tool: tool.into(),
            detail: detail.to_string(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Host actuators and readers. Everything the router and publishers touch on
/// the local machine goes through this trait.
#[async_trait]
pub trait HostPlatform: Send + Sync {
    async fn volume(&self) -> Result<u8, CollaboratorError>;
    async fn set_volume(&self, level: u8) -> Result<(), CollaboratorError>;
    async fn muted(&self) -> Result<bool, CollaboratorError>;
    async fn set_muted(&self, muted: bool) -> Result<(), CollaboratorError>;
    async fn system_action(&self, action: SystemAction) -> Result<(), CollaboratorError>;
    async fn displays(&self) -> Result<Vec<Display>, CollaboratorError>;
    async fn display_brightness(&self, display_id: &str) -> Result<u8, CollaboratorError>;
    async fn set_display_brightness(
        &self,
        display_id: &str,
        level: u8,
    ) -> Result<(), CollaboratorError>;
    async fn run_shortcut(&self, name: &str) -> Result<(), CollaboratorError>;
    async fn keep_awake(&self) -> Result<bool, CollaboratorError>;
    async fn set_keep_awake(&self, enabled: bool) -> Result<(), CollaboratorError>;
    async fn toggle_play_pause(&self) -> Result<(), CollaboratorError>;
    async fn now_playing(&self) -> Result<MediaSnapshot, CollaboratorError>;
    async fn idle_seconds(&self) -> Result<u64, CollaboratorError>;
    async fn battery_percent(&self) -> Result<Option<u8>, CollaboratorError>;
    async fn media_devices(&self) -> Result<MediaDevices, CollaboratorError>;
    async fn identity(&self) -> DeviceIdentity;
    fn media_control_available(&self) -> bool;
}

/// macOS implementation backed by the stock command line tools plus the
/// optional `media-control`, `betterdisplaycli` and `switchaudiosource`.
pub struct MacHost {
    media_control: String,
    http: reqwest::Client,
}

impl MacHost {
    pub fn new(media_control: impl Into<String>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            media_control: media_control.into(),
            http,
        })
    }

    async fn osascript(&self, script: &str) -> Result<String, CollaboratorError> {
        run("/usr/bin/osascript", &["-e", script]).await
    }

    async fn current_audio_source(&self) -> Result<String, CollaboratorError> {
        run("switchaudiosource", &["-c"]).await
    }

    /// Devices without a software volume report `missing value`; those go
    /// through the local audio helper instead.
    async fn audio_helper(&self, query: &str) -> Result<String, CollaboratorError> {
        let source = self.current_audio_source().await?;
        let url = audio_helper_url(query, &source);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| CollaboratorError::failed("audio helper", err))?;
        let body = response
            .text()
            .await
            .map_err(|err| CollaboratorError::failed("audio helper", err))?;
        Ok(body.trim().to_string())
    }

    async fn software_volume_supported(&self) -> Result<bool, CollaboratorError> {
        let probe = self
            .osascript("output volume of (get volume settings)")
            .await?;
        Ok(probe != "missing value")
    }
}

#[async_trait]
impl HostPlatform for MacHost {
    async fn volume(&self) -> Result<u8, CollaboratorError> {
        let output = self
            .osascript("output volume of (get volume settings)")
            .await?;
        if let Ok(level) = output.parse::<u8>() {
            return Ok(level.min(100));
        }
        let raw = self.audio_helper("get?name={name}&volume").await?;
        let fraction: f64 = raw
            .parse()
            .map_err(|err| CollaboratorError::parse("audio helper", err))?;
        Ok((fraction * 100.0).round().clamp(0.0, 100.0) as u8)
    }

    async fn set_volume(&self, level: u8) -> Result<(), CollaboratorError> {
        if self.software_volume_supported().await? {
            self.osascript(&format!("set volume output volume {level}"))
                .await?;
        } else {
            let fraction = f64::from(level) / 100.0;
            self.audio_helper(&format!("set?name={{name}}&volume={fraction:.6}"))
                .await?;
        }
        Ok(())
    }

    async fn muted(&self) -> Result<bool, CollaboratorError> {
        let output = self
            .osascript("output muted of (get volume settings)")
            .await?;
        match output.as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            "missing value" => Ok(self.audio_helper("get?name={name}&mute").await? == "on"),
            other => Err(CollaboratorError::parse("osascript", other)),
        }
    }

    async fn set_muted(&self, muted: bool) -> Result<(), CollaboratorError> {
        if self.software_volume_supported().await? {
            self.osascript(&format!("set volume output muted {muted}"))
                .await?;
        } else {
            let state = if muted { "on" } else { "off" };
            self.audio_helper(&format!("set?name={{name}}&mute={state}"))
                .await?;
        }
        Ok(())
    }

    async fn system_action(&self, action: SystemAction) -> Result<(), CollaboratorError> {
        match action {
            SystemAction::Sleep => run("pmset", &["sleepnow"]).await?,
            SystemAction::DisplaySleep => run("pmset", &["displaysleepnow"]).await?,
            SystemAction::DisplayWake => run("/usr/bin/caffeinate", &["-u", "-t", "1"]).await?,
            SystemAction::Screensaver => run("open", &["-a", "ScreenSaverEngine"]).await?,
            SystemAction::Shutdown => {
                if run("id", &["-u"]).await? == "0" {
                    run("shutdown", &["-h", "now"]).await?
                } else {
                    self.osascript("tell app \"System Events\" to shut down")
                        .await?
                }
            }
        };
        Ok(())
    }

    async fn displays(&self) -> Result<Vec<Display>, CollaboratorError> {
        if !on_path("betterdisplaycli") {
            return Err(CollaboratorError::unavailable("betterdisplaycli"));
        }
        let output = run("betterdisplaycli", &["get", "-identifiers"]).await?;
        parse_display_identifiers(&output)
    }

    async fn display_brightness(&self, display_id: &str) -> Result<u8, CollaboratorError> {
        let arg = format!("-displayID={display_id}");
        let output = run("betterdisplaycli", &["get", &arg, "-brightness", "-value"]).await?;
        let fraction: f64 = output
            .parse()
            .map_err(|err| CollaboratorError::parse("betterdisplaycli", err))?;
        Ok((fraction * 100.0).round().clamp(0.0, 100.0) as u8)
    }

    async fn set_display_brightness(
        &self,
        display_id: &str,
        level: u8,
    ) -> Result<(), CollaboratorError> {
        let id_arg = format!("-displayID={display_id}");
        let level_arg = format!("-brightness={level}%");
        run("betterdisplaycli", &["set", &id_arg, &level_arg]).await?;
        Ok(())
    }

    async fn run_shortcut(&self, name: &str) -> Result<(), CollaboratorError> {
        run("shortcuts", &["run", name]).await?;
        Ok(())
    }

    async fn keep_awake(&self) -> Result<bool, CollaboratorError> {
        let status = Command::new("pgrep")
            .args(["-x", "caffeinate"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|err| spawn_error("pgrep", err))?;
        Ok(status.success())
    }

    async fn set_keep_awake(&self, enabled: bool) -> Result<(), CollaboratorError> {
        if enabled {
            // The assertion lives as long as the detached child does.
            Command::new("/usr/bin/caffeinate")
                .arg("-d")
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|err| spawn_error("caffeinate", err))?;
            return Ok(());
        }
        let status = Command::new("pkill")
            .args(["-x", "caffeinate"])
            .status()
            .await
            .map_err(|err| spawn_error("pkill", err))?;
        // pkill exits 1 when nothing matched
        match status.code() {
            Some(0) | Some(1) => Ok(()),
            _ => Err(CollaboratorError::failed("pkill", status)),
        }
    }

    async fn toggle_play_pause(&self) -> Result<(), CollaboratorError> {
        if !self.media_control_available() {
            return Err(CollaboratorError::unavailable(&self.media_control));
        }
        run(&self.media_control, &["toggle-play-pause"]).await?;
        Ok(())
    }

    async fn now_playing(&self) -> Result<MediaSnapshot, CollaboratorError> {
        if !self.media_control_available() {
            return Err(CollaboratorError::unavailable(&self.media_control));
        }
        let output = run(&self.media_control, &["get"]).await?;
        parse_now_playing(&output)
    }

    async fn idle_seconds(&self) -> Result<u64, CollaboratorError> {
        let output = run("ioreg", &["-c", "IOHIDSystem"]).await?;
        parse_hid_idle_seconds(&output)
    }

    async fn battery_percent(&self) -> Result<Option<u8>, CollaboratorError> {
        let output = run("/usr/bin/pmset", &["-g", "batt"]).await?;
        Ok(parse_battery_percent(&output))
    }

    async fn media_devices(&self) -> Result<MediaDevices, CollaboratorError> {
        let audio = run("ioreg", &["-r", "-c", "IOAudioEngine"]).await?;
        let microphone_on = input_engine_running(&audio);
        let camera_on = process_running("VDCAssistant").await
            || process_running("AppleCameraAssistant").await;
        Ok(MediaDevices {
            microphone_on,
            camera_on,
        })
    }

    async fn identity(&self) -> DeviceIdentity {
        let serial = match run("/usr/sbin/ioreg", &["-l"]).await {
            Ok(output) => capture(r#""IOPlatformSerialNumber" = "([^"]+)""#, &output),
            Err(err) => {
                tracing::debug!("Could not read serial number: {}", err);
                None
            }
        };
        let model = match run("/usr/sbin/system_profiler", &["SPHardwareDataType"]).await {
            Ok(output) => capture(r"(?m)^\s*Chip:\s*(.+)$", &output)
                .or_else(|| capture(r"(?m)^\s*Model Name:\s*(.+)$", &output)),
            Err(err) => {
                tracing::debug!("Could not read hardware model: {}", err);
                None
            }
        };
        DeviceIdentity {
            serial: serial.unwrap_or_default(),
            model: model.unwrap_or_else(|| "Mac".to_string()),
        }
    }

    fn media_control_available(&self) -> bool {
        on_path(&self.media_control)
    }
}

async fn run(program: &str, args: &[&str]) -> Result<String, CollaboratorError> {
    let tool = Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string());
    let output = timeout(
        COMMAND_TIMEOUT,
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| CollaboratorError::Timeout { tool: tool.clone() })?
    .map_err(|err| spawn_error(&tool, err))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = if stderr.trim().is_empty() {
            output.status.to_string()
        } else {
            stderr.trim().to_string()
        };
        return Err(CollaboratorError::Failed { tool, detail });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn spawn_error(tool: &str, err: std::io::Error) -> CollaboratorError {
    if err.kind() == std::io::ErrorKind::NotFound {
        CollaboratorError::unavailable(tool)
    } else {
        CollaboratorError::failed(tool, err)
    }
}

async fn process_running(name: &str) -> bool {
    Command::new("pgrep")
        .args(["-x", name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Looks a program up the way a shell would. Absolute and relative paths are
/// checked directly.
/// Substitutes the percent-encoded device name for `{name}` in `query`.
fn audio_helper_url(query: &str, device: &str) -> String {
    format!(
        "{AUDIO_HELPER_URL}/{}",
        query.replace("{name}", &urlencoding::encode(device))
    )
}

pub fn on_path(program: &str) -> bool {
    if program.contains('/') {
        return Path::new(program).is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths)
                .map(|dir: PathBuf| dir.join(program))
                .any(|candidate| candidate.is_file())
        })
        .unwrap_or(false)
}

fn capture(pattern: &str, haystack: &str) -> Option<String> {
    let re = Regex::new(pattern).ok()?;
    re.captures(haystack)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn idle_time_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""HIDIdleTime"\s*=\s*(\d+)"#).expect("valid idle regex"))
}

fn battery_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)%").expect("valid battery regex"))
}

/// `HIDIdleTime` is reported in nanoseconds.
pub fn parse_hid_idle_seconds(output: &str) -> Result<u64, CollaboratorError> {
    let caps = idle_time_regex()
        .captures(output)
        .ok_or_else(|| CollaboratorError::parse("ioreg", "HIDIdleTime not found"))?;
    let nanos: u64 = caps[1]
        .parse()
        .map_err(|err| CollaboratorError::parse("ioreg", err))?;
    Ok(nanos / 1_000_000_000)
}

pub fn parse_battery_percent(output: &str) -> Option<u8> {
    battery_regex()
        .captures(output)
        .and_then(|c| c[1].parse::<u8>().ok())
        .map(|p| p.min(100))
}

pub fn parse_display_identifiers(output: &str) -> Result<Vec<Display>, CollaboratorError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    // betterdisplaycli prints comma separated objects without the brackets
    let wrapped = if trimmed.starts_with('[') {
        trimmed.to_string()
    } else {
        format!("[{trimmed}]")
    };
    serde_json::from_str(&wrapped).map_err(|err| CollaboratorError::parse("betterdisplaycli", err))
}

/// Parses `media-control get`. `null` means no player has a session.
pub fn parse_now_playing(output: &str) -> Result<MediaSnapshot, CollaboratorError> {
    let value: serde_json::Value = serde_json::from_str(output.trim())
        .map_err(|err| CollaboratorError::parse("media-control", err))?;
    let mut snapshot = MediaSnapshot::default();
    if let serde_json::Value::Object(map) = value {
        merge_payload(&mut snapshot, &map);
        if snapshot.state == PlaybackState::Idle && !snapshot.title.is_empty() {
            snapshot.state = PlaybackState::Paused;
        }
    }
    Ok(snapshot)
}

fn input_engine_running(ioreg: &str) -> bool {
    // Each engine block lists its direction and run state; an input engine in
    // state 1 means something is capturing audio.
    ioreg.split("+-o").any(|block| {
        block.contains("\"IOAudioEngineDirection\" = 1") && block.contains("\"IOAudioEngineState\" = 1")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_time_is_converted_from_nanoseconds() {
        let sample = r#"
            | |   "HIDIdleTime" = 12500000000
            | |   "HIDSomethingElse" = 3
        "#;
        assert_eq!(parse_hid_idle_seconds(sample).unwrap(), 12);
        assert!(parse_hid_idle_seconds("nothing here").is_err());
    }

    #[test]
    fn battery_percent_reads_first_percentage() {
        let sample = "Now drawing from 'Battery Power'\n -InternalBattery-0 (id=123)\t87%; discharging; 4:12 remaining present: true";
        assert_eq!(parse_battery_percent(sample), Some(87));
        assert_eq!(parse_battery_percent("Now drawing from 'AC Power'"), None);
    }

    #[test]
    fn display_identifiers_accept_bare_object_list() {
        let out = r#"{"displayID":"1","name":"Built-in Display"},{"displayID":"3","name":"LG UltraFine"}"#;
        let displays = parse_display_identifiers(out).unwrap();
        assert_eq!(displays.len(), 2);
        assert!(displays[0].is_builtin());
        assert_eq!(displays[1].display_id, "3");
        assert!(parse_display_identifiers("").unwrap().is_empty());
    }

    #[test]
    fn now_playing_null_is_idle() {
        let snapshot = parse_now_playing("null").unwrap();
        assert_eq!(snapshot, MediaSnapshot::default());
    }

    #[test]
    fn now_playing_reads_full_object() {
        let out = r#"{"title":"Song","artist":"Band","album":"LP","bundleIdentifier":"com.spotify.client","playing":true,"duration":210.4,"elapsedTime":12.9}"#;
        let snapshot = parse_now_playing(out).unwrap();
        assert_eq!(snapshot.title, "Song");
        assert_eq!(snapshot.app_name, "com.spotify.client");
        assert_eq!(snapshot.state, PlaybackState::Playing);
        assert_eq!(snapshot.duration_secs, 210);
        assert_eq!(snapshot.position_secs, 12);
    }

    #[test]
    fn now_playing_without_flag_but_with_title_is_paused() {
        let snapshot = parse_now_playing(r#"{"title":"Podcast"}"#).unwrap();
        assert_eq!(snapshot.state, PlaybackState::Paused);
    }

    #[test]
    fn input_engine_detection() {
        let running = r#"+-o AppleUSBAudioEngine
              "IOAudioEngineDirection" = 1
              "IOAudioEngineState" = 1
            +-o AppleHDAEngineOutput
              "IOAudioEngineDirection" = 0
              "IOAudioEngineState" = 1"#;
        assert!(input_engine_running(running));
        let idle = running.replacen("\"IOAudioEngineState\" = 1", "\"IOAudioEngineState\" = 0", 1);
        assert!(!input_engine_running(&idle));
    }

    #[test]
    fn host_builds_its_http_client() {
        let host = MacHost::new("definitely-not-a-real-tool-name").unwrap();
        assert!(!host.media_control_available());
    }

    #[test]
    fn audio_helper_url_encodes_device_name() {
        assert_eq!(
            audio_helper_url("get?name={name}&volume", "AirPods & Co #2"),
            "http://localhost:55777/get?name=AirPods%20%26%20Co%20%232&volume"
        );
        assert_eq!(
            audio_helper_url("set?name={name}&mute=on", "Café+Speakers?"),
            "http://localhost:55777/set?name=Caf%C3%A9%2BSpeakers%3F&mute=on"
        );
    }

    #[test]
    fn on_path_checks_explicit_paths() {
        assert!(!on_path("/definitely/not/a/real/tool"));
        assert!(!on_path("definitely-not-a-real-tool-name"));
    }
}
