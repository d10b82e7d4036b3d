use crate::connection::MqttLink;
use crate::model::{MediaSnapshot, PlaybackState};
use crate::state::StateStore;
use crate::status::StatusPublisher;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum MediaStreamError {
    #[error("failed to start `{command} stream`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("media stream has no stdout")]
    NoStdout,
    #[error("media stream read failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("media stream ended ({0})")]
    Ended(String),
}

/// One line of `media-control stream`, e.g.
/// `{"type":"data","diff":true,"payload":{"title":"..."}}`.
#[derive(Debug, Deserialize)]
pub struct StreamEvent {
    #[serde(default)]
    pub diff: Option<bool>,
    #[serde(default)]
    pub payload: Option<Map<String, Value>>,
}

impl StreamEvent {
    pub fn is_full_refresh(&self) -> bool {
        self.diff == Some(false)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum LineOutcome {
    Applied,
    Blank,
    Malformed,
    NoPayload,
    Disconnected,
}

pub fn parse_line(line: &str) -> Result<StreamEvent, serde_json::Error> {
    serde_json::from_str(line)
}

/// Folds a partial payload into `snapshot`. Keys not present keep their
/// previous value; unknown keys are ignored.
pub fn merge_payload(snapshot: &mut MediaSnapshot, payload: &Map<String, Value>) {
    for (key, value) in payload {
        match key.as_str() {
            "title" => set_string(&mut snapshot.title, value),
            "artist" => set_string(&mut snapshot.artist, value),
            "album" => set_string(&mut snapshot.album, value),
            "appName" => set_string(&mut snapshot.app_name, value),
            "bundleIdentifier" if !payload.contains_key("appName") => {
                set_string(&mut snapshot.app_name, value)
            }
            "playing" => {
                if let Some(playing) = value.as_bool() {
                    snapshot.state = if playing {
                        PlaybackState::Playing
                    } else {
                        PlaybackState::Paused
                    };
                }
            }
            "duration" | "totalTime" | "totalDuration" => {
                set_seconds(&mut snapshot.duration_secs, value, 1)
            }
            "durationMicros" => set_seconds(&mut snapshot.duration_secs, value, 1_000_000),
            "elapsedTime" | "position" => set_seconds(&mut snapshot.position_secs, value, 1),
            "positionMicros" => set_seconds(&mut snapshot.position_secs, value, 1_000_000),
            _ => {}
        }
    }
}

fn set_string(field: &mut String, value: &Value) {
    if let Some(s) = value.as_str() {
        *field = s.to_string();
    }
}

fn set_seconds(field: &mut u64, value: &Value, divisor: u64) {
    let whole = if let Some(n) = value.as_u64() {
        n / divisor
    } else if let Some(f) = value.as_f64() {
        if !f.is_finite() || f < 0.0 {
            return;
        }
        (f as u64) / divisor
    } else {
        return;
    };
    *field = whole;
}

/// Reconciles the live media stream into the shared snapshot and republishes
/// after every merge.
pub struct MediaReconciler {
    store: Arc<StateStore>,
    status: Arc<StatusPublisher>,
    link: Arc<dyn MqttLink>,
}

impl MediaReconciler {
    pub fn new(
        store: Arc<StateStore>,
        status: Arc<StatusPublisher>,
        link: Arc<dyn MqttLink>,
    ) -> Self {
        Self {
            store,
            status,
            link,
        }
    }

    pub fn apply_line(&self, line: &str) -> LineOutcome {
        let line = line.trim();
        if line.is_empty() {
            return LineOutcome::Blank;
        }
        let event = match parse_line(line) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!("Skipping malformed media stream line: {}", err);
                return LineOutcome::Malformed;
            }
        };
        let payload = match event.payload.as_ref() {
            Some(payload) if !payload.is_empty() => payload,
            _ => {
                tracing::debug!("Media stream event without payload, skipping");
                return LineOutcome::NoPayload;
            }
        };
        if !self.link.is_connected() {
            tracing::debug!("Dropping media update while disconnected");
            return LineOutcome::Disconnected;
        }

        let full_refresh = event.is_full_refresh();
        let snapshot = self.store.update_media(|media| {
            if full_refresh {
                *media = MediaSnapshot::default();
            }
            merge_payload(media, payload);
            media.clone()
        });

        tracing::info!(
            "Media stream update: {} - {} ({})",
            snapshot.artist,
            snapshot.title,
            snapshot.state.as_str()
        );
        self.status.publish_media(&snapshot);
        LineOutcome::Applied
    }

    /// Reads events until the reader closes. Returns `Ok` on a clean EOF.
    /// Lines that are not UTF-8 are decoded lossily and end up skipped as
    /// malformed.
    pub async fn consume<R>(&self, mut reader: R) -> Result<(), MediaStreamError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                return Ok(());
            }
            self.apply_line(&String::from_utf8_lossy(&buf));
        }
    }

    /// Spawns `<command> stream` and consumes it. Always ends with an error
    /// describing why the stream stopped; the caller restarts it on the next
    /// connect.
    pub async fn run(self: Arc<Self>, command: String) -> Result<(), MediaStreamError> {
        tracing::info!("Starting {} stream for real-time updates", command);
        let mut child = Command::new(&command)
            .arg("stream")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| MediaStreamError::Spawn {
                command: command.clone(),
                source,
            })?;
        let stdout = child.stdout.take().ok_or(MediaStreamError::NoStdout)?;

        self.consume(BufReader::new(stdout)).await?;

        let status = child.wait().await?;
        Err(MediaStreamError::Ended(status.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_status;

    fn payload(raw: &str) -> Map<String, Value> {
        serde_json::from_str(raw).unwrap()
    }

    fn populated() -> MediaSnapshot {
        MediaSnapshot {
            title: "Blue in Green".into(),
            artist: "Miles Davis".into(),
            album: "Kind of Blue".into(),
            app_name: "Music".into(),
            state: PlaybackState::Playing,
            duration_secs: 337,
            position_secs: 12,
        }
    }

    #[test]
    fn position_micros_only_touches_position() {
        let mut snapshot = populated();
        merge_payload(&mut snapshot, &payload(r#"{"positionMicros": 5000000}"#));
        assert_eq!(
            snapshot,
            MediaSnapshot {
                position_secs: 5,
                ..populated()
            }
        );
    }

    #[test]
    fn playing_false_pauses_and_keeps_metadata() {
        let mut snapshot = populated();
        merge_payload(&mut snapshot, &payload(r#"{"playing": false}"#));
        assert_eq!(snapshot.state, PlaybackState::Paused);
        assert_eq!(snapshot.title, "Blue in Green");
        assert_eq!(snapshot.artist, "Miles Davis");
    }

    #[test]
    fn duration_aliases_map_to_same_field() {
        let mut snapshot = MediaSnapshot::default();
        merge_payload(&mut snapshot, &payload(r#"{"totalTime": 100.9}"#));
        assert_eq!(snapshot.duration_secs, 100);
        merge_payload(&mut snapshot, &payload(r#"{"totalDuration": 200}"#));
        assert_eq!(snapshot.duration_secs, 200);
        merge_payload(&mut snapshot, &payload(r#"{"durationMicros": 181999999}"#));
        assert_eq!(snapshot.duration_secs, 181);
        merge_payload(&mut snapshot, &payload(r#"{"elapsedTime": 7.5}"#));
        assert_eq!(snapshot.position_secs, 7);
    }

    #[test]
    fn app_name_wins_over_bundle_identifier() {
        let mut snapshot = MediaSnapshot::default();
        merge_payload(
            &mut snapshot,
            &payload(r#"{"bundleIdentifier":"com.apple.Music","appName":"Music"}"#),
        );
        assert_eq!(snapshot.app_name, "Music");

        merge_payload(&mut snapshot, &payload(r#"{"bundleIdentifier":"com.spotify.client"}"#));
        assert_eq!(snapshot.app_name, "com.spotify.client");
    }

    #[test]
    fn wrong_types_and_unknown_keys_are_ignored() {
        let mut snapshot = populated();
        merge_payload(
            &mut snapshot,
            &payload(r#"{"title": 42, "duration": "long", "artwork": "base64", "position": -3}"#),
        );
        assert_eq!(snapshot, populated());
    }

    #[tokio::test]
    async fn stream_lines_merge_and_republish() {
        let (link, store, status) = test_status();
        let reconciler = MediaReconciler::new(store.clone(), status, link.clone());
        let input = concat!(
            "{\"type\":\"data\",\"diff\":false,\"payload\":{\"title\":\"A\",\"artist\":\"B\",\"playing\":true}}\n",
            "not json\n",
            "\n",
            "{\"type\":\"data\",\"diff\":true,\"payload\":{}}\n",
            "{\"type\":\"data\",\"diff\":true,\"payload\":{\"positionMicros\":3000000}}\n",
        );

        reconciler.consume(input.as_bytes()).await.unwrap();

        let media = store.media();
        assert_eq!(media.title, "A");
        assert_eq!(media.position_secs, 3);
        assert_eq!(
            link.payloads("mac2mqtt/test-host/status/now_playing"),
            vec!["playing", "playing"]
        );
        assert_eq!(
            link.payloads("mac2mqtt/test-host/status/media_title"),
            vec!["A", "A"]
        );
    }

    #[tokio::test]
    async fn undecodable_line_does_not_stop_the_stream() {
        let (link, store, status) = test_status();
        let reconciler = MediaReconciler::new(store.clone(), status, link);
        let mut input = b"\xff\xfe garbage\n".to_vec();
        input.extend_from_slice(b"{\"type\":\"data\",\"diff\":true,\"payload\":{\"title\":\"A\"}}\n");
        input.extend_from_slice(b"{\"diff\":true,\"payload\":{\"artist\":\"B\"}}");

        reconciler.consume(input.as_slice()).await.unwrap();

        let media = store.media();
        assert_eq!(media.title, "A");
        assert_eq!(media.artist, "B");
    }

    #[test]
    fn full_refresh_resets_before_merge() {
        let (link, store, status) = test_status();
        store.replace_media(populated());
        let reconciler = MediaReconciler::new(store.clone(), status, link);

        let outcome = reconciler.apply_line(r#"{"diff":false,"payload":{"title":"Fresh"}}"#);

        assert_eq!(outcome, LineOutcome::Applied);
        let media = store.media();
        assert_eq!(media.title, "Fresh");
        assert!(media.artist.is_empty());
        assert_eq!(media.state, PlaybackState::Idle);
    }

    #[test]
    fn updates_while_disconnected_are_dropped() {
        let (link, store, status) = test_status();
        link.set_connected(false);
        let reconciler = MediaReconciler::new(store.clone(), status, link.clone());

        let outcome = reconciler.apply_line(r#"{"diff":true,"payload":{"title":"Lost"}}"#);

        assert_eq!(outcome, LineOutcome::Disconnected);
        assert!(store.media().title.is_empty());
        assert!(link.published().is_empty());
    }

    #[test]
    fn malformed_and_empty_lines_are_skipped() {
        let (link, store, status) = test_status();
        let reconciler = MediaReconciler::new(store, status, link.clone());
        assert_eq!(reconciler.apply_line("{oops"), LineOutcome::Malformed);
        assert_eq!(reconciler.apply_line("   "), LineOutcome::Blank);
        assert_eq!(reconciler.apply_line(r#"{"type":"data"}"#), LineOutcome::NoPayload);
        assert!(link.published().is_empty());
    }
}
