use crate::activity::{ActivityDebouncer, ActivitySettings};
use crate::config::Config;
use crate::connection::{BrokerLink, BrokerSettings, ConnectionManager, LinkEvent, MqttLink};
use crate::lmstudio::{LmStudioClient, ModelServer};
use crate::media::MediaReconciler;
use crate::metrics::SystemMetrics;
use crate::platform::{HostPlatform, MacHost};
use crate::router::CommandRouter;
use crate::runtime::{MediaStream, Runtime};
use crate::scheduler::{RateLimitedNotice, ScheduleSettings, Scheduler, Tick};
use crate::security::Vault;
use crate::state::StateStore;
use crate::status::StatusPublisher;
use crate::topics::Topics;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;

const EVENT_CAPACITY: usize = 256;
const SKIP_NOTICE_PERIOD: Duration = Duration::from_secs(300);
const DEFAULT_PASSWORD_KEY: &str = "mqtt_password";

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let command = std::env::args().nth(1);
    if command.as_deref() == Some("config-init") {
        return handle_config_init();
    }

    let config = Config::load()?;

    if let Some(ref command) = command {
        return match command.as_str() {
            "vault-set" => handle_vault_set(&config),
            "vault-get" => handle_vault_get(&config),
            "vault-list" => handle_vault_list(&config),
            "password-set" => handle_password_set(config),
            "autostart-enable" => handle_autostart(true, &config),
            "autostart-disable" => handle_autostart(false, &config),
            other => Err(format!("unknown command: {other}").into()),
        };
    }

    if config.startup.enable_autostart {
        if let Err(err) = crate::startup::set_autostart(&config.startup.app_name, true) {
            tracing::warn!("autostart setup failed: {}", err);
        }
    }

    let hostname = config
        .device
        .hostname
        .clone()
        .filter(|h| !h.trim().is_empty())
        .or_else(sysinfo::System::host_name)
        .unwrap_or_else(|| "host".to_string());
    let topics = Topics::new(
        config.mqtt.topic.as_deref(),
        &hostname,
        &config.mqtt.discovery_prefix,
    );
    tracing::info!("Using topic prefix {}", topics.prefix());

    let password = resolve_password(&config)?;

    let host = Arc::new(MacHost::new(config.media.command.clone())?);
    let metrics = Arc::new(SystemMetrics::new(config.metrics.public_ip_url.clone())?);
    let store = Arc::new(StateStore::new());

    match host.displays().await {
        Ok(displays) => {
            tracing::info!("Found {} display(s)", displays.len());
            store.set_displays(displays);
        }
        Err(err) => tracing::warn!("Display brightness control disabled: {}", err),
    }

    let model_server = build_model_server(&config);

    let link = Arc::new(BrokerLink::new());
    let (events_tx, mut events_rx) = mpsc::channel(EVENT_CAPACITY);
    let manager = Arc::new(ConnectionManager::new(
        broker_settings(&config, &topics, password),
        link.clone(),
        events_tx,
    ));

    let status = Arc::new(StatusPublisher::new(
        link.clone(),
        topics.clone(),
        store.clone(),
        host.clone(),
        metrics,
        model_server.clone(),
    ));
    let router = Arc::new(CommandRouter::new(
        topics.clone(),
        host.clone(),
        model_server,
        status.clone(),
        store.clone(),
    ));
    let activity = Arc::new(ActivityDebouncer::new(
        store.clone(),
        status.clone(),
        host.clone(),
        activity_settings(&config),
    ));

    let media = if config.media.enabled && host.media_control_available() {
        Some(MediaStream {
            reconciler: Arc::new(MediaReconciler::new(
                store.clone(),
                status.clone(),
                link.clone(),
            )),
            command: config.media.command.clone(),
        })
    } else {
        if config.media.enabled {
            tracing::warn!(
                "{} not found; now playing updates disabled",
                config.media.command
            );
        }
        None
    };

    let runtime = Arc::new(Runtime::new(
        topics,
        link.clone(),
        status.clone(),
        router,
        activity,
        media,
    ));

    tracing::info!("Starting MQTT connection...");
    if let Err(err) = manager.establish().await {
        tracing::warn!("Initial MQTT connection failed: {}", err);
        tracing::warn!("Starting in offline mode; the network check will retry");
        manager.mark_offline();
    }

    let (inbox_tx, inbox_rx) = mpsc::channel(EVENT_CAPACITY);
    tokio::spawn(runtime.clone().process_messages(inbox_rx));

    let mut scheduler = Scheduler::new(schedule_settings(&config));
    let mut skipped = RateLimitedNotice::new(SKIP_NOTICE_PERIOD);

    loop {
        tokio::select! {
            tick = scheduler.next() => {
                if tick == Tick::NetworkCheck {
                    let manager = manager.clone();
                    tokio::spawn(async move { manager.check_network().await });
                    continue;
                }
                if !link.is_connected() {
                    if let Some(suppressed) = skipped.check() {
                        tracing::info!(
                            "MQTT client not connected, skipping {} update ({} similar skipped)",
                            tick.as_str(),
                            suppressed
                        );
                    }
                    continue;
                }
                skipped.reset();
                let status = status.clone();
                tokio::spawn(async move { run_tick(&status, tick).await });
            }
            event = events_rx.recv() => match event {
                Some(LinkEvent::Connected) => {
                    let runtime = runtime.clone();
                    tokio::spawn(async move { runtime.on_connect().await });
                }
                Some(LinkEvent::Lost { reason }) => runtime.on_connection_lost(&reason),
                Some(LinkEvent::Message { topic, payload }) => {
                    if inbox_tx.send((topic, payload)).await.is_err() {
                        tracing::warn!("Command worker stopped; dropping message");
                    }
                }
                None => {
                    tracing::warn!("connection event channel closed");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown: ctrl-c");
                break;
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}

async fn run_tick(status: &StatusPublisher, tick: Tick) {
    match tick {
        Tick::Status => status.publish_status_tick().await,
        Tick::Metrics => status.publish_metrics_tick().await,
        Tick::Power => status.publish_power_tick().await,
        Tick::NetworkCheck => {}
    }
}

fn resolve_password(config: &Config) -> Result<Option<String>, Box<dyn std::error::Error>> {
    match config.mqtt.password_key.as_deref() {
        Some(key) => {
            let vault = Vault::new(config.vault.path.as_deref())?;
            let password = vault
                .retrieve(key)
                .map_err(|err| format!("mqtt.password_key {key:?}: {err}"))?;
            Ok(Some(password.trim().to_string()))
        }
        None => Ok(config.mqtt.password.clone().filter(|p| !p.is_empty())),
    }
}

fn broker_settings(config: &Config, topics: &Topics, password: Option<String>) -> BrokerSettings {
    let mqtt = &config.mqtt;
    BrokerSettings {
        host: mqtt.host.trim().to_string(),
        port: mqtt.port,
        username: mqtt.user.clone().filter(|u| !u.is_empty()),
        password,
        ssl: mqtt.ssl,
        client_id: topics.client_id(),
        will_topic: topics.alive(),
        keep_alive: Duration::from_secs(mqtt.keep_alive_secs),
        connect_timeout: Duration::from_secs(mqtt.connect_timeout_secs),
        probe_timeout: Duration::from_millis(mqtt.probe_timeout_ms),
        reconnect_interval: Duration::from_secs(mqtt.reconnect_interval_secs),
        max_reconnect_interval: Duration::from_secs(mqtt.max_reconnect_interval_secs),
    }
}

fn activity_settings(config: &Config) -> ActivitySettings {
    ActivitySettings {
        idle_threshold: Duration::from_secs(config.activity.idle_threshold_secs),
        sample_interval: Duration::from_millis(config.activity.sample_interval_ms),
        active_floor_secs: config.activity.active_floor_secs,
    }
}

fn schedule_settings(config: &Config) -> ScheduleSettings {
    let s = &config.schedule;
    ScheduleSettings {
        status: Duration::from_secs(s.status_interval_secs),
        metrics: Duration::from_secs(s.metrics_interval_secs),
        power: Duration::from_secs(s.power_interval_secs),
        network_check: Duration::from_secs(s.network_check_interval_secs),
    }
}

/// The LM Studio integration is only enabled when configured and its CLI is
/// installed, since every control command goes through the CLI.
fn build_model_server(config: &Config) -> Option<Arc<dyn ModelServer>> {
    let lm = &config.lmstudio;
    if !lm.enabled {
        return None;
    }
    let client = match LmStudioClient::builder(lm.api_url.clone())
        .cli(lm.cli.clone())
        .timeout(Duration::from_millis(lm.timeout_ms))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            tracing::warn!("LM Studio integration disabled: {}", err);
            return None;
        }
    };
    if !client.cli_available() {
        tracing::warn!(
            "LM Studio CLI ({}) not found; run LM Studio once to install it. LM Studio control disabled",
            lm.cli
        );
        return None;
    }
    tracing::info!("LM Studio integration enabled ({})", lm.api_url);
    let server: Arc<dyn ModelServer> = Arc::new(client);
    Some(server)
}

fn handle_vault_set(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(2);
    let key = args.next().ok_or("missing key")?;
    let value = args.next().ok_or("missing value")?;

    let mut vault = Vault::new(config.vault.path.as_deref())?;
    vault.store(&key, &value)?;

    println!("Stored vault key: {}", key);
    Ok(())
}

fn handle_vault_get(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(2);
    let key = args.next().ok_or("missing key")?;

    let vault = Vault::new(config.vault.path.as_deref())?;
    let value = vault.retrieve(&key)?;

    println!("{}", value);
    Ok(())
}

fn handle_vault_list(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let vault = Vault::new(config.vault.path.as_deref())?;
    for key in vault.list_keys() {
        println!("{}", key);
    }
    Ok(())
}

/// Moves the broker password into the vault and points the config at it.
fn handle_password_set(mut config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let value = std::env::args().nth(2).ok_or("missing password")?;
    let key = config
        .mqtt
        .password_key
        .clone()
        .unwrap_or_else(|| DEFAULT_PASSWORD_KEY.to_string());

    let mut vault = Vault::new(config.vault.path.as_deref())?;
    vault.store(&key, &value)?;

    config.mqtt.password = None;
    config.mqtt.password_key = Some(key.clone());
    config.save()?;

    println!("Stored broker password under vault key: {}", key);
    Ok(())
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

fn handle_autostart(enable: bool, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    crate::startup::set_autostart(&config.startup.app_name, enable)?;
    println!(
        "autostart {} for {}",
        if enable { "enabled" } else { "disabled" },
        config.startup.app_name
    );
    Ok(())
}
