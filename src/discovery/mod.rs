use crate::model::{DeviceIdentity, Display};
use crate::topics::Topics;
use serde_json::{json, Map, Value};

pub const ORIGIN_NAME: &str = "mac2mqtt";
const MIN_LEVEL: u8 = 0;
const MAX_LEVEL: u8 = 100;

pub struct DiscoveryContext<'a> {
    pub topics: &'a Topics,
    pub identity: &'a DeviceIdentity,
    pub displays: &'a [Display],
    pub media_control: bool,
    pub model_server: bool,
}

/// Builds the single device-discovery document advertising every entity this
/// host exposes.
pub fn build_document(ctx: &DiscoveryContext<'_>) -> Value {
    let mut components = Components::new(ctx.topics);

    components.switch("keepawake", "Keep Awake", "keepawake", "caffeinate", "mdi:coffee");
    components.button("displaywake", "Display Wake", "mdi:monitor");
    components.button("displaysleep", "Display Sleep", "mdi:monitor-off");
    components.button("screensaver", "Screensaver", "mdi:monitor-star");
    components.button("sleep", "Sleep", "mdi:sleep");
    components.button("shutdown", "Shutdown", "mdi:power");
    components.set("shutdown", "enabled_by_default", json!(false));
    components.switch("mute", "Mute", "mute", "mute", "mdi:volume-mute");
    components.number("volume", "Volume", "volume", "volume", "mdi:volume-high");

    components.sensor("battery", "Battery", "battery", json!({
        "enabled_by_default": false,
        "unit_of_measurement": "%",
        "device_class": "battery",
    }));

    for (group, label, icon) in [("disk", "Disk", "mdi:harddisk"), ("memory", "Memory", "mdi:memory")] {
        for (field, field_label) in [("total", "Total"), ("used", "Used"), ("free", "Free")] {
            components.sensor(
                &format!("{group}_{field}"),
                &format!("{label} {field_label}"),
                &format!("{group}/{field}"),
                json!({
                    "unit_of_measurement": "B",
                    "device_class": "data_size",
                    "state_class": "measurement",
                    "icon": icon,
                }),
            );
        }
    }
    for (group, label, icon) in [
        ("disk", "Disk", "mdi:chart-pie"),
        ("cpu", "CPU", "mdi:cpu-64-bit"),
        ("memory", "Memory", "mdi:memory"),
    ] {
        for (field, field_label) in [("used_percent", "Used Percent"), ("free_percent", "Free Percent")] {
            components.sensor(
                &format!("{group}_{field}"),
                &format!("{label} {field_label}"),
                &format!("{group}/{field}"),
                json!({
                    "unit_of_measurement": "%",
                    "state_class": "measurement",
                    "icon": icon,
                }),
            );
        }
    }

    components.sensor("uptime_seconds", "Uptime Seconds", "uptime/seconds", json!({
        "unit_of_measurement": "s",
        "device_class": "duration",
        "state_class": "total_increasing",
        "icon": "mdi:clock-outline",
    }));
    components.sensor("uptime_human", "Uptime", "uptime/human", json!({ "icon": "mdi:clock-outline" }));
    components.binary_sensor("microphone", "Microphone", "ON", "OFF", "running", "mdi:microphone");
    components.binary_sensor("camera", "Camera", "ON", "OFF", "running", "mdi:camera");
    components.sensor("public_ip", "Public IP", "public_ip", json!({ "icon": "mdi:ip-network" }));
    components.binary_sensor(
        "user_activity",
        "User Activity",
        "active",
        "inactive",
        "occupancy",
        "mdi:account-check",
    );
    components.sensor(
        "idle_time_seconds",
        &format!("{} User Idle Time", ctx.topics.host_id()),
        "idle_time_seconds",
        json!({
            "unit_of_measurement": "s",
            "device_class": "duration",
            "state_class": "measurement",
            "icon": "mdi:timer-sand",
        }),
    );

    if ctx.media_control {
        components.insert("playpause", json!({
            "p": "button",
            "name": "Play/Pause",
            "command_topic": ctx.topics.command("playpause"),
            "payload_press": "playpause",
            "icon": "mdi:play-pause",
        }));
        components.sensor("now_playing", "Now Playing", "now_playing", json!({
            "json_attributes_topic": ctx.topics.status("now_playing_attr"),
            "icon": "mdi:music",
        }));
    }

    for display in ctx.displays {
        let entity = format!("display_{}_brightness", display.display_id);
        components.number(
            &entity,
            &format!("{} Brightness", display.name),
            &entity,
            &entity,
            "mdi:brightness-6",
        );
    }

    if ctx.model_server {
        components.insert("lmstudio_server", json!({
            "p": "switch",
            "name": "LM Studio Server",
            "command_topic": ctx.topics.command("lmstudio_server"),
            "state_topic": ctx.topics.status("lmstudio_server"),
            "payload_on": "start",
            "payload_off": "stop",
            "state_on": "online",
            "state_off": "offline",
            "icon": "mdi:server",
        }));
        components.sensor(
            "lmstudio_loaded_models_list",
            "LM Studio Loaded Models",
            "lmstudio_loaded_models_list",
            json!({ "icon": "mdi:brain" }),
        );
        components.sensor(
            "lmstudio_available_models_list",
            "LM Studio Available Models",
            "lmstudio_available_models_list",
            json!({ "icon": "mdi:database" }),
        );
        components.sensor(
            "lmstudio_loaded_models_count",
            "LM Studio Loaded Models Count",
            "lmstudio_loaded_models_count",
            json!({
                "unit_of_measurement": "models",
                "state_class": "measurement",
                "icon": "mdi:counter",
            }),
        );
        components.text("lmstudio_load_model", "LM Studio Load Model", "mdi:upload");
        components.text("lmstudio_unload_model", "LM Studio Unload Model", "mdi:download");
    }

    json!({
        "dev": {
            "ids": ctx.identity.serial,
            "name": ctx.topics.host_id(),
            "mf": "Apple",
            "mdl": ctx.identity.model,
        },
        "o": { "name": ORIGIN_NAME },
        "cmps": Value::Object(components.into_map()),
        "availability_topic": ctx.topics.alive(),
        "qos": 2,
    })
}

struct Components<'a> {
    topics: &'a Topics,
    map: Map<String, Value>,
}

impl<'a> Components<'a> {
    fn new(topics: &'a Topics) -> Self {
        Self {
            topics,
            map: Map::new(),
        }
    }

    /// Adds a component keyed by `entity`, stamping its unique id.
    fn insert(&mut self, entity: &str, mut body: Value) {
        if let Value::Object(fields) = &mut body {
            fields.insert(
                "unique_id".into(),
                Value::String(format!("{}_{}", self.topics.host_id(), entity)),
            );
        }
        self.map.insert(entity.to_string(), body);
    }

    fn set(&mut self, entity: &str, key: &str, value: Value) {
        if let Some(Value::Object(fields)) = self.map.get_mut(entity) {
            fields.insert(key.to_string(), value);
        }
    }

    fn button(&mut self, payload: &str, name: &str, icon: &str) {
        self.insert(payload, json!({
            "p": "button",
            "name": name,
            "command_topic": self.topics.command("set"),
            "payload_press": payload,
            "icon": icon,
        }));
    }

    fn switch(&mut self, entity: &str, name: &str, command: &str, state: &str, icon: &str) {
        self.insert(entity, json!({
            "p": "switch",
            "name": name,
            "command_topic": self.topics.command(command),
            "state_topic": self.topics.status(state),
            "payload_on": "true",
            "payload_off": "false",
            "icon": icon,
        }));
    }

    fn number(&mut self, entity: &str, name: &str, command: &str, state: &str, icon: &str) {
        self.insert(entity, json!({
            "p": "number",
            "name": name,
            "command_topic": self.topics.command(command),
            "state_topic": self.topics.status(state),
            "min_value": MIN_LEVEL,
            "max_value": MAX_LEVEL,
            "step": 1,
            "mode": "slider",
            "icon": icon,
        }));
    }

    fn sensor(&mut self, entity: &str, name: &str, state: &str, extra: Value) {
        let mut body = json!({
            "p": "sensor",
            "name": name,
            "state_topic": self.topics.status(state),
        });
        if let (Value::Object(fields), Value::Object(extra)) = (&mut body, extra) {
            fields.extend(extra);
        }
        self.insert(entity, body);
    }

    fn binary_sensor(
        &mut self,
        entity: &str,
        name: &str,
        on: &str,
        off: &str,
        device_class: &str,
        icon: &str,
    ) {
        self.insert(entity, json!({
            "p": "binary_sensor",
            "name": name,
            "state_topic": self.topics.status(entity),
            "payload_on": on,
            "payload_off": off,
            "device_class": device_class,
            "icon": icon,
        }));
    }

    fn text(&mut self, entity: &str, name: &str, icon: &str) {
        self.insert(entity, json!({
            "p": "text",
            "name": name,
            "command_topic": self.topics.command(entity),
            "mode": "text",
            "icon": icon,
        }));
    }

    fn into_map(self) -> Map<String, Value> {
        self.map
    }
}
