pub const DEFAULT_TOPIC_ROOT: &str = "mac2mqtt";

/// Topic layout for one host. Every status and command topic hangs off
/// `<root>/<host_id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
    host_id: String,
    discovery_prefix: String,
}

impl Topics {
    pub fn new(root: Option<&str>, hostname: &str, discovery_prefix: &str) -> Self {
        let host_id = sanitize_host(hostname);
        let root = root
            .map(|r| r.trim().trim_end_matches('/'))
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_TOPIC_ROOT);
        Self {
            prefix: format!("{root}/{host_id}"),
            host_id,
            discovery_prefix: discovery_prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn client_id(&self) -> String {
        format!("{}_mac2mqtt", self.host_id)
    }

    pub fn status(&self, name: &str) -> String {
        format!("{}/status/{}", self.prefix, name)
    }

    pub fn command(&self, name: &str) -> String {
        format!("{}/command/{}", self.prefix, name)
    }

    pub fn alive(&self) -> String {
        self.status("alive")
    }

    pub fn command_filter(&self) -> String {
        format!("{}/command/#", self.prefix)
    }

    pub fn display_brightness_status(&self, display_id: &str) -> String {
        self.status(&format!("display_{display_id}_brightness"))
    }

    pub fn discovery(&self) -> String {
        format!("{}/device/{}/config", self.discovery_prefix, self.host_id)
    }

    /// Returns the command name of a topic under this host's command tree,
    /// e.g. `volume` for `mac2mqtt/studio/command/volume`.
    pub fn command_name<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let rest = topic.strip_prefix(self.prefix.as_str())?;
        let name = rest.strip_prefix("/command/")?;
        if name.is_empty() || name.contains('/') {
            return None;
        }
        Some(name)
    }
}

/// Extracts the display id from a `display_<id>_brightness` command name.
pub fn display_id_from_command(name: &str) -> Option<&str> {
    let id = name
        .strip_prefix("display_")?
        .strip_suffix("_brightness")?;
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

/// Reduces a hostname to a topic-safe identifier: the first DNS label with
/// everything outside `[A-Za-z0-9_-]` removed.
pub fn sanitize_host(raw: &str) -> String {
    let label = raw.trim().split('.').next().unwrap_or_default();
    let cleaned: String = label
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        "host".to_string()
    } else {
        cleaned
    }
}
